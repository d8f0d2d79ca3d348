//! Metric message model shared by agents and the kernel
//!
//! A [`MetricMessage`] is the unit carried over the `metrics` queue:
//! - [`Host`] identity (hostname is the natural key)
//! - one timestamped [`Metric`] reading with its disk and network sequences
//!
//! Field names on the wire follow the agents' JSON contract (`platformver`,
//! `kernelver`, `used_percent`, ...), so older producers stay compatible.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Monitored machine identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    /// Assigned by the store, 0 until persisted
    #[serde(default)]
    pub id: i64,
    pub hostname: String,
    pub os: String,
    pub platform: String,
    #[serde(rename = "platformver")]
    pub platform_ver: String,
    #[serde(rename = "kernelver")]
    pub kernel_ver: String,
}

/// One resource reading for a host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    #[serde(default)]
    pub id: i64,
    #[serde(default)]
    pub host_id: i64,
    /// Seconds since boot
    pub uptime: u64,
    /// CPU utilization percentage, 0-100
    pub cpu: f64,
    /// RAM utilization percentage, 0-100
    pub ram: f64,
    #[serde(default)]
    pub disk: Vec<DiskMetric>,
    #[serde(default)]
    pub network: Vec<NetMetric>,
    pub time: DateTime<Utc>,
}

/// Usage of a single mount point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskMetric {
    pub path: String,
    pub total: u64,
    pub used: u64,
    pub free: u64,
    pub used_percent: f64,
}

/// Counters of a single network interface
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetMetric {
    pub name: String,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub packets_sent: u64,
    pub packets_recv: u64,
    pub err_in: u64,
    pub err_out: u64,
    pub drop_in: u64,
    pub drop_out: u64,
}

/// Transport envelope: host identity paired with one metric snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMessage {
    pub host: Host,
    pub metric: Metric,
}

/// Reasons a message is refused before it reaches the store
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("hostname is empty")]
    EmptyHostname,
    #[error("{field} must be within [0, 100], got {value}")]
    OutOfRange { field: &'static str, value: f64 },
    #[error("uptime is zero, sample is unavailable")]
    ZeroUptime,
    #[error("timestamp {0} cannot be represented")]
    UnrepresentableTime(DateTime<Utc>),
}

impl MetricMessage {
    pub fn new(host: Host, metric: Metric) -> Self {
        Self { host, metric }
    }

    /// Check the invariants every accepted sample must hold.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.host.hostname.trim().is_empty() {
            return Err(ValidationError::EmptyHostname);
        }
        check_percent("cpu", self.metric.cpu)?;
        check_percent("ram", self.metric.ram)?;
        if self.metric.uptime == 0 {
            return Err(ValidationError::ZeroUptime);
        }
        if self.metric.time.timestamp_nanos_opt().is_none() {
            return Err(ValidationError::UnrepresentableTime(self.metric.time));
        }
        Ok(())
    }

    pub fn hostname(&self) -> &str {
        &self.host.hostname
    }
}

fn check_percent(field: &'static str, value: f64) -> Result<(), ValidationError> {
    // NaN fails `contains`, which is what we want
    if (0.0..=100.0).contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange { field, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message() -> MetricMessage {
        MetricMessage::new(
            Host {
                id: 0,
                hostname: "host-a".to_string(),
                os: "linux".to_string(),
                platform: "debian".to_string(),
                platform_ver: "12".to_string(),
                kernel_ver: "6.1.0".to_string(),
            },
            Metric {
                id: 0,
                host_id: 0,
                uptime: 3600,
                cpu: 42.5,
                ram: 77.0,
                disk: vec![DiskMetric {
                    path: "/".to_string(),
                    total: 1000,
                    used: 400,
                    free: 600,
                    used_percent: 40.0,
                }],
                network: vec![NetMetric {
                    name: "eth0".to_string(),
                    bytes_sent: 100,
                    bytes_recv: 200,
                    ..Default::default()
                }],
                time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            },
        )
    }

    #[test]
    fn test_valid_message_passes() {
        assert_eq!(message().validate(), Ok(()));
    }

    #[test]
    fn test_percent_bounds_are_inclusive() {
        let mut msg = message();
        msg.metric.cpu = 0.0;
        msg.metric.ram = 100.0;
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_and_nan() {
        let mut msg = message();
        msg.metric.cpu = 100.5;
        assert!(matches!(
            msg.validate(),
            Err(ValidationError::OutOfRange { field: "cpu", .. })
        ));

        let mut msg = message();
        msg.metric.ram = f64::NAN;
        assert!(matches!(
            msg.validate(),
            Err(ValidationError::OutOfRange { field: "ram", .. })
        ));

        let mut msg = message();
        msg.metric.ram = -0.1;
        assert!(msg.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_uptime_and_blank_hostname() {
        let mut msg = message();
        msg.metric.uptime = 0;
        assert_eq!(msg.validate(), Err(ValidationError::ZeroUptime));

        let mut msg = message();
        msg.host.hostname = "  ".to_string();
        assert_eq!(msg.validate(), Err(ValidationError::EmptyHostname));
    }

    #[test]
    fn test_wire_field_names() {
        let json = serde_json::to_value(message()).unwrap();
        assert_eq!(json["host"]["platformver"], "12");
        assert_eq!(json["host"]["kernelver"], "6.1.0");
        assert_eq!(json["metric"]["disk"][0]["used_percent"], 40.0);
        assert_eq!(json["metric"]["network"][0]["bytes_recv"], 200);
    }

    #[test]
    fn test_missing_ids_and_sequences_default() {
        let raw = r#"{
            "host": {"hostname": "h", "os": "linux", "platform": "p", "platformver": "1", "kernelver": "k"},
            "metric": {"uptime": 5, "cpu": 1.0, "ram": 2.0, "time": "2024-05-01T12:00:00Z"}
        }"#;
        let msg: MetricMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.host.id, 0);
        assert!(msg.metric.disk.is_empty());
        assert!(msg.metric.network.is_empty());
        assert!(msg.validate().is_ok());
    }
}
