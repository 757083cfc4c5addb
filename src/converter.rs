//! Value conversion applied to every raw channel value.
//!
//! A channel may carry a `Multiplier`, a `Converter`, both, or neither. The multiplier is
//! always applied first; the converter then evaluates its function of the scaled value.
//! With neither configured the raw value passes through untouched, so string and boolean
//! channels (power-meter units, auto-range flags) are stored as-is.

use crate::error::DeviceError;
use crate::reading::FieldValue;
use serde::Deserialize;
use std::collections::BTreeMap;

/// `Converter` object as written in the device document.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "Type")]
pub enum ConverterSpec {
    /// `{"Type": "polynomial", "Coefficients": {"0": -1, "1": 2}}`
    #[serde(rename = "polynomial", alias = "Polynomial")]
    Polynomial {
        /// Exponent (as a string key) to coefficient.
        #[serde(rename = "Coefficients")]
        coefficients: BTreeMap<String, f64>,
    },
}

/// Validated converter function.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ConverterSpec")]
pub enum Converter {
    /// Sparse polynomial `sum(c_i * x^i)`.
    Polynomial(Polynomial),
}

impl TryFrom<ConverterSpec> for Converter {
    type Error = String;

    fn try_from(spec: ConverterSpec) -> Result<Self, Self::Error> {
        match spec {
            ConverterSpec::Polynomial { coefficients } => {
                Polynomial::from_coefficients(&coefficients).map(Converter::Polynomial)
            }
        }
    }
}

impl Converter {
    /// Evaluate the converter at `x`.
    pub fn apply(&self, x: f64) -> f64 {
        match self {
            Converter::Polynomial(p) => p.eval(x),
        }
    }
}

/// Sparse polynomial; exponents not listed have a zero coefficient.
#[derive(Debug, Clone, PartialEq)]
pub struct Polynomial {
    terms: Vec<(i32, f64)>,
}

impl Polynomial {
    /// Build from the document's exponent-keyed coefficient map.
    pub fn from_coefficients(coefficients: &BTreeMap<String, f64>) -> Result<Self, String> {
        let mut terms = Vec::with_capacity(coefficients.len());
        for (exponent, coefficient) in coefficients {
            let exp: i32 = exponent
                .trim()
                .parse()
                .map_err(|_| format!("polynomial exponent '{}' is not an integer", exponent))?;
            if !coefficient.is_finite() {
                return Err(format!("coefficient for exponent {} is not finite", exp));
            }
            terms.push((exp, *coefficient));
        }
        terms.sort_by_key(|(exp, _)| *exp);
        Ok(Self { terms })
    }

    /// Evaluate at `x`.
    pub fn eval(&self, x: f64) -> f64 {
        self.terms
            .iter()
            .map(|(exp, coefficient)| coefficient * x.powi(*exp))
            .sum()
    }
}

/// Apply `multiplier` then `converter` to a raw value.
///
/// Fails only when a transform is configured and the value is not numeric. Integer
/// values become floats once any transform touches them.
pub fn convert(
    raw: FieldValue,
    multiplier: Option<f64>,
    converter: Option<&Converter>,
) -> Result<FieldValue, DeviceError> {
    if multiplier.is_none() && converter.is_none() {
        return Ok(raw);
    }

    let mut x = raw.as_f64().ok_or_else(|| {
        DeviceError::Conversion(format!("cannot apply numeric transform to {}", raw))
    })?;

    if let Some(m) = multiplier {
        x *= m;
    }
    if let Some(c) = converter {
        x = c.apply(x);
    }
    Ok(FieldValue::Float(x))
}
