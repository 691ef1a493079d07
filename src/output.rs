//! Adapter for data output

use async_trait::async_trait;
use serde::Serialize;

use crate::devices::sgp30::Sample;
use influx::ToLineProtocol;

pub use iotticket::IotTicket;

/// Receiver of validated samples.
#[async_trait]
pub trait Sink: Send {
    async fn publish(&mut self, device_id: &str, sample: &Sample) -> Result<(), error::PublishError>;
}

#[async_trait]
impl Sink for Box<dyn Sink> {
    async fn publish(&mut self, device_id: &str, sample: &Sample) -> Result<(), error::PublishError> {
        (**self).publish(device_id, sample).await
    }
}

/// Named value of a data node as understood by IoT-Ticket.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataNodeValue {
    pub name: String,
    pub path: String,
    pub data_type: String,
    pub unit: String,
    pub v: i64,
    /// Milliseconds since the Unix epoch
    pub ts: i64,
}

impl DataNodeValue {
    pub fn long(
        name: impl Into<String>,
        path: impl Into<String>,
        unit: impl Into<String>,
        value: impl Into<i64>,
        ts: i64,
    ) -> DataNodeValue {
        DataNodeValue {
            name: name.into(),
            path: path.into(),
            data_type: "long".to_string(),
            unit: unit.into(),
            v: value.into(),
            ts,
        }
    }
}

/// Prints samples to stdout instead of sending them anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stdout {
    /// Human readable line
    Stringify,
    /// InfluxDB Line Protocol
    Influxdb,
}

impl Stdout {
    pub fn format(&self, device_id: &str, sample: &Sample) -> String {
        match self {
            Stdout::Stringify => format!("{}: {}", device_id, sample),
            Stdout::Influxdb => sample
                .to_lineprotocol()
                .add_tag("deviceId", device_id)
                .to_string(),
        }
    }
}

#[async_trait]
impl Sink for Stdout {
    async fn publish(&mut self, device_id: &str, sample: &Sample) -> Result<(), error::PublishError> {
        println!("{}", self.format(device_id, sample));
        Ok(())
    }
}

pub mod influx {
    use std::fmt;

    pub trait ToLineProtocol {
        fn to_lineprotocol(&self) -> LineProtocol;
    }

    /// Field or tag value. Sensor readings are all integers.
    pub enum LineProtocolValue {
        Integer(i64),
        Tag(String),
    }

    impl fmt::Display for LineProtocolValue {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                Self::Integer(x) => write!(f, "{}i", x),
                Self::Tag(x) => write!(f, "{}", escape_key(x)),
            }
        }
    }

    impl From<i64> for LineProtocolValue {
        fn from(x: i64) -> Self {
            LineProtocolValue::Integer(x)
        }
    }

    /// Escape commas, spaces and equal signs in keys and tag values.
    fn escape_key(s: &str) -> String {
        let mut out = String::with_capacity(s.len());
        for c in s.chars() {
            if matches!(c, ',' | ' ' | '=') {
                out.push('\\');
            }
            out.push(c);
        }
        out
    }

    struct Item(String, LineProtocolValue);

    impl fmt::Display for Item {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}={}", escape_key(&self.0), self.1)
        }
    }

    pub struct LineProtocol {
        measurement: String,
        tags: Vec<Item>,
        values: Vec<Item>,
        /// Nanoseconds since the Unix epoch
        time: Option<i64>,
    }

    impl LineProtocol {
        pub fn new(measurement: impl Into<String>) -> LineProtocol {
            LineProtocol {
                measurement: measurement.into(),
                tags: vec![],
                values: vec![],
                time: None,
            }
        }

        pub fn add_tag(mut self, name: impl Into<String>, tag: impl fmt::Display) -> LineProtocol {
            self.tags.push(Item(
                name.into(),
                LineProtocolValue::Tag(format!("{}", tag)),
            ));
            self
        }

        pub fn add_value<V>(mut self, name: impl Into<String>, value: V) -> LineProtocol
        where
            V: Into<LineProtocolValue>,
        {
            self.values.push(Item(name.into(), value.into()));
            self
        }

        pub fn add_time_millis(mut self, millis: i64) -> LineProtocol {
            self.time = Some(millis * 1_000_000);
            self
        }
    }

    impl fmt::Display for LineProtocol {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            let mut tag_string = "".to_string();
            tag_string.extend(self.tags.iter().map(|item| format!(",{}", item)));

            let value_string = self
                .values
                .iter()
                .map(|item| format!("{}", item))
                .collect::<Vec<_>>()
                .join(",");
            write!(f, "{}{} {}", self.measurement, tag_string, value_string)?;
            if let Some(time) = self.time {
                write!(f, " {}", time)?;
            }
            Ok(())
        }
    }

    #[cfg(test)]
    mod test {
        use super::LineProtocol;

        #[test]
        fn line_protocol_fmt() {
            assert_eq!(format!("{}", LineProtocol::new("airQuality")), "airQuality ");

            assert_eq!(
                format!(
                    "{}",
                    LineProtocol::new("airQuality")
                        .add_tag("deviceId", "dev1")
                        .add_tag("room", "lab 2,west")
                        .add_value("co2eq", 450i64)
                        .add_value("tvoc", 20i64)
                        .add_time_millis(1_676_000_000_123)
                ),
                "airQuality,deviceId=dev1,room=lab\\ 2\\,west co2eq=450i,tvoc=20i 1676000000123000000"
            );
        }
    }
}

/// Client for the IoT-Ticket REST API.
pub mod iotticket {
    use async_trait::async_trait;
    use log::{debug, info};
    use serde::Deserialize;

    use super::{error::PublishError, DataNodeValue, Sink};
    use crate::{config::Config, devices::sgp30::Sample};

    /// Answer of the write endpoint.
    #[derive(Debug, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct WriteResult {
        #[serde(default)]
        pub total_written: u64,
    }

    /// Long-lived IoT-Ticket session, reused for every publish.
    pub struct IotTicket {
        client: reqwest::Client,
        baseurl: String,
        username: String,
        password: String,
    }

    impl IotTicket {
        pub fn new(config: &Config) -> Result<Self, PublishError> {
            let client = reqwest::Client::builder()
                .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
                .timeout(std::time::Duration::from_secs(20))
                .build()?;
            Ok(IotTicket {
                client,
                baseurl: config.baseurl.trim_end_matches('/').to_string(),
                username: config.username.clone(),
                password: config.password.clone(),
            })
        }

        pub fn write_url(&self, device_id: &str) -> String {
            format!("{}/process/write/{}/", self.baseurl, device_id)
        }

        /// Write data node values of one device.
        pub async fn write_data(
            &self,
            device_id: &str,
            values: &[DataNodeValue],
        ) -> Result<WriteResult, PublishError> {
            let response = self
                .client
                .post(self.write_url(device_id))
                .basic_auth(&self.username, Some(&self.password))
                .json(values)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PublishError::Rejected { status, body });
            }
            Ok(response.json::<WriteResult>().await?)
        }
    }

    #[async_trait]
    impl Sink for IotTicket {
        async fn publish(&mut self, device_id: &str, sample: &Sample) -> Result<(), PublishError> {
            info!("Publishing to IoT-Ticket device {}: {}", device_id, sample);
            let result = self.write_data(device_id, &sample.to_datanodes()).await?;
            debug!("IoT-Ticket wrote {} values", result.total_written);
            Ok(())
        }
    }

}

pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum PublishError {
        #[error("HTTP request failed: {0}")]
        Http(#[from] reqwest::Error),
        #[error("Telemetry endpoint rejected data with status {status}: {body}")]
        Rejected {
            status: reqwest::StatusCode,
            body: String,
        },
    }
}
