//! PurpleAir particle counters read from the REST API.
//!
//! Every channel names a sensor (`PurpleAirSensorIndex`, optionally `PurpleAirReadKey`
//! for private sensors). Each sensor is fetched at most once per cycle with
//! `GET {base}/sensors/{index}` and the `X-API-Key` header; channels then pick fields
//! out of the returned `sensor` object.

use super::{unknown_channel, DeviceDriver};
use crate::config::{ChannelConfig, DeviceConfig};
use crate::error::{ConfigError, DeviceError};
use crate::reading::FieldValue;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Public API endpoint.
pub const PURPLEAIR_API: &str = "https://api.purpleair.com/v1";

/// Smallest particle size bin, counts per deciliter.
const PARTICLE_COUNT_FIELD: &str = "0.3_um_count";

#[derive(Debug, Clone, PartialEq)]
struct SensorChannel {
    sensor: String,
    read_key: Option<String>,
    field: String,
}

/// HTTP/REST driver.
#[derive(Debug)]
pub struct HttpDriver {
    device: String,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
    channels: Vec<SensorChannel>,
}

/// HTTP client plus the sensor objects fetched in the current cycle.
#[derive(Debug)]
pub struct HttpSession {
    client: Client,
    sensors: HashMap<String, Map<String, Value>>,
}

impl HttpDriver {
    /// Build from a device entry.
    pub fn from_config(config: &DeviceConfig) -> Result<Self, ConfigError> {
        let channels = config
            .channels
            .iter()
            .map(|channel| sensor_channel(config, channel))
            .collect::<Result<Vec<_>, _>>()?;
        let api_key = config
            .connection_str("ApiKey")
            .or_else(|| config.param_str("PurpleAirAPIKey"));
        let base_url = config
            .param_str("ApiBaseUrl")
            .unwrap_or_else(|| PURPLEAIR_API.to_string());
        Ok(Self {
            device: config.name.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            timeout: config.timeout,
            channels,
        })
    }

    async fn fetch_sensor(
        &self,
        client: &Client,
        channel: &SensorChannel,
    ) -> Result<Map<String, Value>, DeviceError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| DeviceError::connection("no API key configured"))?;
        let url = format!("{}/sensors/{}", self.base_url, channel.sensor);
        let mut request = client.get(&url).header("X-API-Key", api_key);
        if let Some(read_key) = &channel.read_key {
            request = request.query(&[("read_key", read_key)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| DeviceError::transient(format!("GET {} failed: {}", url, e)))?;
        let status = response.status();
        if !status.is_success() {
            let message = format!("GET {} returned {}", url, status);
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    DeviceError::transient(message)
                } else {
                    DeviceError::malformed(message)
                },
            );
        }

        let mut body: Value = response
            .json()
            .await
            .map_err(|e| DeviceError::malformed(format!("invalid JSON body: {}", e)))?;
        match body.get_mut("sensor").map(Value::take) {
            Some(Value::Object(sensor)) => Ok(sensor),
            _ => Err(DeviceError::malformed("response has no 'sensor' object")),
        }
    }
}

fn sensor_channel(
    config: &DeviceConfig,
    channel: &ChannelConfig,
) -> Result<SensorChannel, ConfigError> {
    let field = match channel.selector() {
        "ParticleCount" => PARTICLE_COUNT_FIELD.to_string(),
        "SensorField" => channel.extra_str("PurpleAirField").ok_or_else(|| {
            ConfigError::channel(&config.name, &channel.key, "SensorField needs PurpleAirField")
        })?,
        _ => return Err(unknown_channel(config, channel)),
    };
    let sensor = channel
        .extra_str("PurpleAirSensorIndex")
        .or_else(|| config.param_str("PurpleAirSensorIndex"))
        .ok_or_else(|| {
            ConfigError::channel(&config.name, &channel.key, "missing PurpleAirSensorIndex")
        })?;
    Ok(SensorChannel {
        sensor,
        read_key: channel.extra_str("PurpleAirReadKey"),
        field,
    })
}

fn field_value(sensor: &Map<String, Value>, field: &str) -> Result<FieldValue, DeviceError> {
    match sensor.get(field) {
        Some(Value::Number(n)) => n
            .as_f64()
            .map(FieldValue::Float)
            .ok_or_else(|| DeviceError::malformed(format!("'{}' is out of range", field))),
        Some(Value::String(s)) => Ok(FieldValue::Text(s.clone())),
        Some(Value::Bool(b)) => Ok(FieldValue::Boolean(*b)),
        Some(Value::Null) | None => Err(DeviceError::malformed(format!(
            "sensor has no value for '{}'",
            field
        ))),
        Some(other) => Err(DeviceError::malformed(format!(
            "'{}' is not a scalar: {}",
            field, other
        ))),
    }
}

#[async_trait]
impl DeviceDriver for HttpDriver {
    type Session = HttpSession;

    async fn open(&self) -> Result<HttpSession, DeviceError> {
        if self.api_key.is_none() {
            return Err(DeviceError::connection(format!(
                "{}: ApiKey connection parameter is required",
                self.device
            )));
        }
        let client = Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| DeviceError::connection(format!("HTTP client: {}", e)))?;
        Ok(HttpSession {
            client,
            sensors: HashMap::new(),
        })
    }

    async fn prepare_cycle(&self, session: &mut HttpSession) -> Result<(), DeviceError> {
        session.sensors.clear();
        Ok(())
    }

    async fn read_channel(
        &self,
        session: &mut HttpSession,
        channel: usize,
    ) -> Result<FieldValue, DeviceError> {
        let target = self
            .channels
            .get(channel)
            .ok_or_else(|| DeviceError::malformed(format!("no channel {}", channel)))?;
        if !session.sensors.contains_key(&target.sensor) {
            let sensor = self.fetch_sensor(&session.client, target).await?;
            debug!(device = %self.device, sensor = %target.sensor, "Fetched sensor");
            session.sensors.insert(target.sensor.clone(), sensor);
        }
        match session.sensors.get(&target.sensor) {
            Some(sensor) => field_value(sensor, &target.field),
            None => Err(DeviceError::transient("sensor data missing from cycle cache")),
        }
    }

    async fn close(&self, _session: HttpSession) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_devices;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal HTTP/1.1 server answering every request with `status` and `body`.
    async fn serve(status: &'static str, body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = vec![0u8; 4096];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                seen.lock()
                    .push(String::from_utf8_lossy(&buf[..n]).into_owned());
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}", addr), requests)
    }

    fn driver(base_url: &str, api_key: bool) -> HttpDriver {
        let connection = if api_key {
            r#""SerialConnectionParams": {"ApiKey": "secret"},"#
        } else {
            ""
        };
        let json = format!(
            r#"[{{"Device": "Air", "Model": "PurpleAir", {connection}
                  "ApiBaseUrl": "{base_url}", "measurement": "air",
                  "Channels": {{
                    "lab": {{"Type": "ParticleCount", "PurpleAirSensorIndex": 1234,
                             "PurpleAirReadKey": "rk", "field-key": "pm03"}},
                    "hum": {{"Type": "SensorField", "PurpleAirSensorIndex": 1234,
                             "PurpleAirField": "humidity", "field-key": "rh"}}
                  }}}}]"#
        );
        let config = parse_devices(&json, Duration::from_secs(2)).unwrap().remove(0);
        HttpDriver::from_config(&config).unwrap()
    }

    #[test]
    fn channel_types_are_checked_at_load() {
        let json = r#"[{"Device": "Air", "Model": "PurpleAir", "measurement": "air",
                        "Channels": {"x": {"Type": "Ozone", "PurpleAirSensorIndex": 1, "field-key": "o"}}}]"#;
        let config = parse_devices(json, Duration::from_secs(1)).unwrap().remove(0);
        assert!(matches!(
            HttpDriver::from_config(&config),
            Err(ConfigError::Channel { .. })
        ));
    }

    #[tokio::test]
    async fn open_requires_an_api_key() {
        let d = driver("http://127.0.0.1:9", false);
        assert!(matches!(d.open().await, Err(DeviceError::Connection(_))));
    }

    #[tokio::test]
    async fn one_request_per_sensor_and_cycle() {
        let (url, requests) = serve(
            "200 OK",
            r#"{"sensor_index": 1234, "sensor": {"0.3_um_count": 812.5, "humidity": 41}}"#,
        )
        .await;
        let d = driver(&url, true);
        let mut session = d.open().await.unwrap();

        d.prepare_cycle(&mut session).await.unwrap();
        assert_eq!(
            d.read_channel(&mut session, 0).await.unwrap(),
            FieldValue::Float(812.5)
        );
        assert_eq!(
            d.read_channel(&mut session, 1).await.unwrap(),
            FieldValue::Float(41.0)
        );

        let seen = requests.lock().clone();
        assert_eq!(seen.len(), 1);
        let request = seen[0].to_ascii_lowercase();
        assert!(request.starts_with("get /sensors/1234?read_key=rk "));
        assert!(request.contains("x-api-key: secret"));
    }

    #[tokio::test]
    async fn status_codes_map_to_read_errors() {
        let (url, _) = serve("503 Service Unavailable", "{}").await;
        let d = driver(&url, true);
        let mut session = d.open().await.unwrap();
        assert!(d.read_channel(&mut session, 0).await.unwrap_err().is_transient());

        let (url, _) = serve("403 Forbidden", r#"{"error": "ApiKeyInvalidError"}"#).await;
        let d = driver(&url, true);
        let mut session = d.open().await.unwrap();
        assert!(!d.read_channel(&mut session, 0).await.unwrap_err().is_transient());
    }
}
