//! Host snapshots for HostPulse agents
//!
//! One snapshot per tick:
//! - host identity (hostname, OS, platform, kernel)
//! - uptime, global CPU % and RAM %
//! - usage of every mounted filesystem
//! - cumulative counters of every network interface

use chrono::Utc;
use hostpulse_bus::{DiskMetric, Host, Metric, MetricMessage, NetMetric};
use sysinfo::{Disks, Networks, System};
use tracing::{debug, warn};

/// Anything able to produce the next metric message
pub trait SnapshotSource: Send {
    /// `None` when the host cannot be sampled right now
    fn snapshot(&mut self) -> Option<MetricMessage>;
}

/// `sysinfo`-backed snapshot source. Keeps its handles between ticks so CPU
/// usage is measured over the previous interval.
pub struct SystemCollector {
    sys: System,
    disks: Disks,
    networks: Networks,
}

impl SystemCollector {
    pub fn new() -> Self {
        let mut sys = System::new();
        // first reading primes the CPU counters
        sys.refresh_cpu_usage();
        sys.refresh_memory();

        Self {
            sys,
            disks: Disks::new_with_refreshed_list(),
            networks: Networks::new_with_refreshed_list(),
        }
    }

    fn host(&self) -> Host {
        Host {
            id: 0,
            hostname: local_hostname(),
            os: std::env::consts::OS.to_string(),
            platform: System::distribution_id(),
            platform_ver: System::os_version().unwrap_or_default(),
            kernel_ver: System::kernel_version().unwrap_or_default(),
        }
    }

    fn disk_usage(&mut self) -> Vec<DiskMetric> {
        self.disks.refresh_list();
        self.disks
            .list()
            .iter()
            .map(|disk| {
                disk_metric(
                    disk.mount_point().to_string_lossy().into_owned(),
                    disk.total_space(),
                    disk.available_space(),
                )
            })
            .collect()
    }

    fn interfaces(&mut self) -> Vec<NetMetric> {
        self.networks.refresh_list();
        let mut interfaces: Vec<NetMetric> = self
            .networks
            .iter()
            .map(|(name, data)| NetMetric {
                name: name.clone(),
                bytes_sent: data.total_transmitted(),
                bytes_recv: data.total_received(),
                packets_sent: data.total_packets_transmitted(),
                packets_recv: data.total_packets_received(),
                err_in: data.total_errors_on_received(),
                err_out: data.total_errors_on_transmitted(),
                // not exposed by sysinfo
                drop_in: 0,
                drop_out: 0,
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        interfaces
    }
}

impl Default for SystemCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotSource for SystemCollector {
    fn snapshot(&mut self) -> Option<MetricMessage> {
        let uptime = System::uptime();
        if uptime == 0 {
            warn!("uptime unavailable, skipping snapshot");
            return None;
        }

        self.sys.refresh_cpu_usage();
        self.sys.refresh_memory();

        let host = self.host();
        let metric = Metric {
            id: 0,
            host_id: 0,
            uptime,
            cpu: clamp_percent(f64::from(self.sys.global_cpu_info().cpu_usage())),
            ram: used_percent(
                self.sys
                    .total_memory()
                    .saturating_sub(self.sys.available_memory()),
                self.sys.total_memory(),
            ),
            disk: self.disk_usage(),
            network: self.interfaces(),
            time: Utc::now(),
        };

        debug!(
            hostname = %host.hostname,
            cpu = metric.cpu,
            ram = metric.ram,
            disks = metric.disk.len(),
            interfaces = metric.network.len(),
            "collected snapshot"
        );
        Some(MetricMessage::new(host, metric))
    }
}

fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Clamp into [0, 100]; NaN reads as 0
pub fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

/// `used / total` as a clamped percentage, 0 for an empty total
pub fn used_percent(used: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    clamp_percent(used as f64 / total as f64 * 100.0)
}

/// Disk usage from the total and available byte counts
pub fn disk_metric(path: String, total: u64, available: u64) -> DiskMetric {
    let free = available.min(total);
    let used = total - free;
    DiskMetric {
        path,
        total,
        used,
        free,
        used_percent: used_percent(used, total),
    }
}
