//! ResourceMonitor: periodic `/proc/self` sampling on Linux, folded into a
//! bounded one-hour sliding window. Absence of `/proc` (non-Linux targets,
//! or a sandboxed environment without it mounted) is non-fatal — the
//! monitor simply reports "unavailable".

use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_time_ticks: u64,
    pub rss_bytes: u64,
    pub peak_rss_bytes: u64,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ResourceSnapshot {
    pub available: bool,
    pub recent_rss_bytes: u64,
    pub peak_rss_bytes: u64,
    pub sample_count: usize,
}

pub struct ResourceMonitor {
    window: VecDeque<ResourceSample>,
    window_capacity: usize,
}

impl ResourceMonitor {
    /// `sample_interval` and a fixed one-hour window together determine
    /// how many samples the sliding window retains.
    pub fn new(sample_interval: Duration) -> Self {
        let capacity = (Duration::from_secs(3600).as_secs() / sample_interval.as_secs().max(1)).max(1) as usize;
        Self {
            window: VecDeque::with_capacity(capacity),
            window_capacity: capacity,
        }
    }

    pub fn sample(&mut self) -> ResourceSnapshot {
        match read_proc_sample() {
            Some(sample) => {
                if self.window.len() >= self.window_capacity {
                    self.window.pop_front();
                }
                self.window.push_back(sample);
                self.snapshot()
            }
            None => ResourceSnapshot::default(),
        }
    }

    fn snapshot(&self) -> ResourceSnapshot {
        let recent = self.window.back().map(|s| s.rss_bytes).unwrap_or(0);
        let peak = self.window.iter().map(|s| s.peak_rss_bytes).max().unwrap_or(0);
        ResourceSnapshot {
            available: !self.window.is_empty(),
            recent_rss_bytes: recent,
            peak_rss_bytes: peak,
            sample_count: self.window.len(),
        }
    }
}

#[cfg(target_os = "linux")]
fn read_proc_sample() -> Option<ResourceSample> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // Field 14 (utime) + field 15 (stime) are CPU ticks; fields are
    // space-separated but field 2 (comm) may itself contain spaces inside
    // parens, so split on the closing paren first.
    let after_comm = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11).and_then(|v| v.parse().ok()).unwrap_or(0);
    let stime: u64 = fields.get(12).and_then(|v| v.parse().ok()).unwrap_or(0);

    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let vm_hwm_kb = status
        .lines()
        .find_map(|line| line.strip_prefix("VmHWM:"))
        .and_then(|rest| rest.trim().trim_end_matches(" kB").trim().parse::<u64>().ok())
        .unwrap_or(0);
    let vm_rss_kb = status
        .lines()
        .find_map(|line| line.strip_prefix("VmRSS:"))
        .and_then(|rest| rest.trim().trim_end_matches(" kB").trim().parse::<u64>().ok())
        .unwrap_or(0);

    Some(ResourceSample {
        cpu_time_ticks: utime + stime,
        rss_bytes: vm_rss_kb * 1024,
        peak_rss_bytes: vm_hwm_kb * 1024,
    })
}

#[cfg(not(target_os = "linux"))]
fn read_proc_sample() -> Option<ResourceSample> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_caps_at_capacity() {
        let mut monitor = ResourceMonitor::new(Duration::from_secs(3600));
        assert_eq!(monitor.window_capacity, 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn sample_on_linux_is_available() {
        let mut monitor = ResourceMonitor::new(Duration::from_secs(1));
        let snap = monitor.sample();
        assert!(snap.available);
    }

    #[cfg(not(target_os = "linux"))]
    #[test]
    fn sample_on_non_linux_is_unavailable() {
        let mut monitor = ResourceMonitor::new(Duration::from_secs(1));
        let snap = monitor.sample();
        assert!(!snap.available);
    }
}
