//! FilterChain: the fixed-order decision pipeline a `Witness` passes
//! through before it ever reaches the plugin pipeline: allow-list,
//! deny-list, tracker filter, internal-hosts filter, size cap, rate
//! limiter. Each stage exposes an atomic drop counter, mirroring the
//! atomic-metrics shape this codebase otherwise uses for its worker
//! threads.

pub mod host_match;
pub mod rate_limiter;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use host_match::HostMatchList;
use rate_limiter::RateLimiter;

use crate::config::filters::FiltersConfig;
use crate::witness::Witness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStage {
    AllowList,
    DenyList,
    Tracker,
    InternalHosts,
    SizeCap,
    RateLimit,
}

#[derive(Debug, Default)]
pub struct FilterCounters {
    pub allow_list_rejected: AtomicU64,
    pub deny_list_rejected: AtomicU64,
    pub tracker_rejected: AtomicU64,
    pub internal_hosts_rejected: AtomicU64,
    pub size_cap_rejected: AtomicU64,
    pub rate_limited: AtomicU64,
    pub passed: AtomicU64,
}

impl FilterCounters {
    fn bump(&self, stage: FilterStage) {
        let counter = match stage {
            FilterStage::AllowList => &self.allow_list_rejected,
            FilterStage::DenyList => &self.deny_list_rejected,
            FilterStage::Tracker => &self.tracker_rejected,
            FilterStage::InternalHosts => &self.internal_hosts_rejected,
            FilterStage::SizeCap => &self.size_cap_rejected,
            FilterStage::RateLimit => &self.rate_limited,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> FilterCountersSnapshot {
        FilterCountersSnapshot {
            allow_list_rejected: self.allow_list_rejected.load(Ordering::Relaxed),
            deny_list_rejected: self.deny_list_rejected.load(Ordering::Relaxed),
            tracker_rejected: self.tracker_rejected.load(Ordering::Relaxed),
            internal_hosts_rejected: self.internal_hosts_rejected.load(Ordering::Relaxed),
            size_cap_rejected: self.size_cap_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            passed: self.passed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct FilterCountersSnapshot {
    pub allow_list_rejected: u64,
    pub deny_list_rejected: u64,
    pub tracker_rejected: u64,
    pub internal_hosts_rejected: u64,
    pub size_cap_rejected: u64,
    pub rate_limited: u64,
    pub passed: u64,
}

/// Well-known advertising/analytics tracker hostnames. This is a small,
/// illustrative seed list — real deployments supply their own via config.
const DEFAULT_TRACKER_HOSTS: &[&str] = &["*.doubleclick.net", "*.google-analytics.com"];

pub struct FilterChain {
    allow_list: HostMatchList,
    deny_list: HostMatchList,
    tracker_list: HostMatchList,
    internal_hosts: HostMatchList,
    max_witness_bytes: usize,
    rate_limiter: RateLimiter,
    pub counters: Arc<FilterCounters>,
}

impl FilterChain {
    pub fn new(config: &FiltersConfig) -> Self {
        let mut tracker_hosts: Vec<String> =
            DEFAULT_TRACKER_HOSTS.iter().map(|s| s.to_string()).collect();
        tracker_hosts.extend(config.tracker_hosts.clone());

        Self {
            allow_list: HostMatchList::new(config.allow_hosts.clone()),
            deny_list: HostMatchList::new(config.deny_hosts.clone()),
            tracker_list: HostMatchList::new(tracker_hosts),
            internal_hosts: HostMatchList::new(config.internal_hosts.clone()),
            max_witness_bytes: config.max_witness_bytes,
            rate_limiter: RateLimiter::new(config.rate_limit_per_minute),
            counters: Arc::new(FilterCounters::default()),
        }
    }

    /// Returns `true` if the witness should continue to the plugin
    /// pipeline. Host-based stages look at the request path's implied
    /// host, passed in separately since the witness model does not carry
    /// a parsed `Host` header convenience field.
    pub fn admit(&self, witness: &Witness, host: Option<&str>) -> bool {
        if let Some(host) = host {
            // Allow-list only narrows the candidate set when non-empty; it
            // never itself causes a rejection once matched. Deny-list is
            // evaluated unconditionally after, and wins on overlap.
            if !self.allow_list.is_empty() && !self.allow_list.matches(host) {
                self.counters.bump(FilterStage::AllowList);
                return false;
            }
            if self.deny_list.matches(host) {
                self.counters.bump(FilterStage::DenyList);
                return false;
            }
            if self.tracker_list.matches(host) {
                self.counters.bump(FilterStage::Tracker);
                return false;
            }
            if self.internal_hosts.matches(host) {
                self.counters.bump(FilterStage::InternalHosts);
                return false;
            }
        }

        if witness_size(witness) > self.max_witness_bytes {
            self.counters.bump(FilterStage::SizeCap);
            return false;
        }

        if !self.rate_limiter.try_acquire() {
            self.counters.bump(FilterStage::RateLimit);
            return false;
        }

        self.counters.passed.fetch_add(1, Ordering::Relaxed);
        true
    }
}

fn witness_size(witness: &Witness) -> usize {
    let req_len = witness.request.as_ref().map(|s| s.body.len()).unwrap_or(0);
    let resp_len = witness.response.as_ref().map(|s| s.body.len()).unwrap_or(0);
    req_len + resp_len
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::witness::Witness;
    use chrono::Utc;

    fn empty_witness() -> Witness {
        Witness {
            id: Witness::new_id(),
            connection_id_display: "x".into(),
            trace_id: None,
            observed_at: Utc::now(),
            request: None,
            response: None,
            one_sided: true,
            tcp_metadata: None,
            tls_handshake: None,
        }
    }

    #[test]
    fn deny_list_wins_over_allow_list_on_overlap() {
        let config = FiltersConfig {
            allow_hosts: vec!["api.example.com".into()],
            deny_hosts: vec!["api.example.com".into()],
            ..FiltersConfig::default()
        };
        let chain = FilterChain::new(&config);
        assert!(!chain.admit(&empty_witness(), Some("api.example.com")));
        assert_eq!(chain.counters.snapshot().deny_list_rejected, 1);
    }

    #[test]
    fn allow_list_restricts_when_non_empty() {
        let config = FiltersConfig {
            allow_hosts: vec!["api.example.com".into()],
            ..FiltersConfig::default()
        };
        let chain = FilterChain::new(&config);
        assert!(!chain.admit(&empty_witness(), Some("other.example.com")));
        assert!(chain.admit(&empty_witness(), Some("api.example.com")));
    }
}
