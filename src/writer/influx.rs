//! InfluxDB v2 write API.
//!
//! `POST {url}/api/v2/write?org=..&bucket=..&precision=..` with a
//! `Authorization: Token ..` header and the line-protocol body. Server errors, rate
//! limiting, timeouts and connection failures are transient; any other rejection
//! (bad token, unknown bucket, unparsable point) is permanent.

use super::PointSink;
use crate::config::DatabaseConfig;
use crate::error::WriteError;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use std::time::Duration;

/// InfluxDB HTTP sink.
#[derive(Debug, Clone)]
pub struct InfluxSink {
    client: Client,
    write_url: Url,
    token: String,
}

impl InfluxSink {
    /// Build the client and write URL.
    pub fn new(config: &DatabaseConfig) -> Result<Self, WriteError> {
        let write_url = write_url(config)?;
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.request_timeout_secs))
            .build()
            .map_err(|e| WriteError::Permanent(format!("HTTP client: {}", e)))?;
        Ok(Self {
            client,
            write_url,
            token: config.token.clone(),
        })
    }

    /// Endpoint batches are posted to.
    pub fn write_url(&self) -> &Url {
        &self.write_url
    }
}

fn write_url(config: &DatabaseConfig) -> Result<Url, WriteError> {
    let base = config.url.trim_end_matches('/');
    let mut url = Url::parse(&format!("{}/api/v2/write", base))
        .map_err(|e| WriteError::Permanent(format!("invalid database url '{}': {}", config.url, e)))?;
    url.query_pairs_mut()
        .append_pair("org", &config.org)
        .append_pair("bucket", &config.bucket)
        .append_pair("precision", config.precision.as_str());
    Ok(url)
}

fn classify(status: StatusCode, body: &str) -> WriteError {
    let message = if body.trim().is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body.trim())
    };
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        WriteError::Transient(message)
    } else {
        WriteError::Permanent(message)
    }
}

#[async_trait]
impl PointSink for InfluxSink {
    fn name(&self) -> &str {
        "influxdb"
    }

    async fn write(&self, body: &str, _points: usize) -> Result<(), WriteError> {
        let response = self
            .client
            .post(self.write_url.clone())
            .header("Authorization", format!("Token {}", self.token))
            .header("Content-Type", "text/plain; charset=utf-8")
            .body(body.to_string())
            .send()
            .await
            .map_err(|e| WriteError::Transient(format!("request failed: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify(status, &text))
    }
}
