/*!
Builders for metric messages used across tests
*/

use chrono::{DateTime, Duration, TimeZone, Utc};
use hostpulse_bus::{DiskMetric, Host, Metric, MetricMessage, NetMetric};

/// Fluent builder over a valid [`MetricMessage`]
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    message: MetricMessage,
}

/// Fixed reference instant so tests do not depend on the wall clock
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .unwrap_or_default()
}

impl MessageBuilder {
    /// Minimal valid message for `hostname`, no disks or interfaces
    pub fn new(hostname: &str) -> Self {
        Self {
            message: MetricMessage::new(
                Host {
                    id: 0,
                    hostname: hostname.to_string(),
                    os: "linux".to_string(),
                    platform: "debian".to_string(),
                    platform_ver: "12".to_string(),
                    kernel_ver: "6.1.0".to_string(),
                },
                Metric {
                    id: 0,
                    host_id: 0,
                    uptime: 60,
                    cpu: 1.0,
                    ram: 1.0,
                    disk: Vec::new(),
                    network: Vec::new(),
                    time: base_time(),
                },
            ),
        }
    }

    /// The reference `host-a` sample: CPU 42.5, RAM 77.0, one disk, one interface
    pub fn host_a() -> Self {
        Self::new("host-a")
            .uptime(3600)
            .cpu(42.5)
            .ram(77.0)
            .disk("/", 1000, 400)
            .net("eth0", 100, 200)
    }

    pub fn platform(mut self, platform: &str, version: &str) -> Self {
        self.message.host.platform = platform.to_string();
        self.message.host.platform_ver = version.to_string();
        self
    }

    pub fn kernel(mut self, version: &str) -> Self {
        self.message.host.kernel_ver = version.to_string();
        self
    }

    pub fn uptime(mut self, seconds: u64) -> Self {
        self.message.metric.uptime = seconds;
        self
    }

    pub fn cpu(mut self, cpu: f64) -> Self {
        self.message.metric.cpu = cpu;
        self
    }

    pub fn ram(mut self, ram: f64) -> Self {
        self.message.metric.ram = ram;
        self
    }

    pub fn at(mut self, time: DateTime<Utc>) -> Self {
        self.message.metric.time = time;
        self
    }

    /// Shift the timestamp from [`base_time`]
    pub fn minutes_after_base(self, minutes: i64) -> Self {
        self.at(base_time() + Duration::minutes(minutes))
    }

    /// Append a mount point; `free` and `used_percent` are derived
    pub fn disk(mut self, path: &str, total: u64, used: u64) -> Self {
        let used_percent = if total == 0 {
            0.0
        } else {
            used as f64 / total as f64 * 100.0
        };
        self.message.metric.disk.push(DiskMetric {
            path: path.to_string(),
            total,
            used,
            free: total.saturating_sub(used),
            used_percent,
        });
        self
    }

    /// Append an interface with byte counters, other counters zero
    pub fn net(mut self, name: &str, bytes_sent: u64, bytes_recv: u64) -> Self {
        self.message.metric.network.push(NetMetric {
            name: name.to_string(),
            bytes_sent,
            bytes_recv,
            ..NetMetric::default()
        });
        self
    }

    pub fn build(self) -> MetricMessage {
        self.message
    }

    /// Wire encoding of the message
    pub fn json(&self) -> Vec<u8> {
        serde_json::to_vec(&self.message).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_a_fixture() {
        let msg = MessageBuilder::host_a().build();
        assert_eq!(msg.hostname(), "host-a");
        assert_eq!(msg.metric.disk[0].free, 600);
        assert_eq!(msg.metric.disk[0].used_percent, 40.0);
        assert_eq!(msg.metric.network[0].bytes_recv, 200);
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_json_decodes_back() {
        let builder = MessageBuilder::new("host-b").minutes_after_base(5);
        let decoded: MetricMessage = serde_json::from_slice(&builder.json()).unwrap();
        assert_eq!(decoded, builder.build());
    }
}
