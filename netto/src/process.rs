use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

/// One line of the accounting feed, decoded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawSample {
    pub pid: i32,
    pub name: String,
    pub bytes_in: u64,  // delta since the previous tick
    pub bytes_out: u64, // delta since the previous tick
}

impl RawSample {
    pub fn new(pid: i32, name: impl Into<String>, bytes_in: u64, bytes_out: u64) -> Self {
        Self {
            pid,
            name: name.into(),
            bytes_in,
            bytes_out,
        }
    }
}

/// Smoothed throughput of every instance of one program
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessBandwidth {
    pub name: String,
    /// First pid seen for this name in the latest flush
    pub pid: i32,
    pub download_speed: f64, // bytes per tick, averaged
    pub upload_speed: f64,   // bytes per tick, averaged
    /// Recent (in, out) sums, oldest first
    pub history: Vec<(u64, u64)>,
    pub last_seen: DateTime<Utc>,
}

impl ProcessBandwidth {
    pub fn total_speed(&self) -> f64 {
        self.download_speed + self.upload_speed
    }

    pub fn format_rate(bytes_per_sec: f64) -> String {
        const KB: f64 = 1024.0;
        const MB: f64 = KB * 1024.0;
        const GB: f64 = MB * 1024.0;

        if bytes_per_sec < KB {
            format!("{:.0} B/s", bytes_per_sec)
        } else if bytes_per_sec < MB {
            format!("{:.1} KB/s", bytes_per_sec / KB)
        } else if bytes_per_sec < GB {
            format!("{:.1} MB/s", bytes_per_sec / MB)
        } else {
            format!("{:.1} GB/s", bytes_per_sec / GB)
        }
    }
}

/// What subscribers receive once per aggregation cycle
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub captured_at: DateTime<Utc>,
    pub processes: Vec<ProcessBandwidth>,
}

impl MonitorSnapshot {
    pub fn empty() -> Self {
        Self {
            captured_at: Utc::now(),
            processes: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ProcessBandwidth> {
        self.processes.iter().find(|p| p.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}

pub type SharedSnapshot = Arc<MonitorSnapshot>;
