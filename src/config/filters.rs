//! FilterChain configuration: allow/deny lists, tracker/internal-host
//! lists, the per-witness size cap, and the rate-limit budget.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FiltersConfig {
    pub allow_hosts: Vec<String>,
    pub deny_hosts: Vec<String>,
    pub tracker_hosts: Vec<String>,
    pub internal_hosts: Vec<String>,
    pub max_witness_bytes: usize,
    pub rate_limit_per_minute: u32,
}

impl Default for FiltersConfig {
    fn default() -> Self {
        Self {
            allow_hosts: Vec::new(),
            deny_hosts: Vec::new(),
            tracker_hosts: Vec::new(),
            internal_hosts: vec!["localhost".to_string(), "*.local".to_string()],
            max_witness_bytes: 2 * 1024 * 1024,
            rate_limit_per_minute: 600,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FiltersFileConfig {
    pub allow_hosts: Option<Vec<String>>,
    pub deny_hosts: Option<Vec<String>>,
    pub tracker_hosts: Option<Vec<String>>,
    pub internal_hosts: Option<Vec<String>>,
    pub max_witness_bytes: Option<usize>,
    pub rate_limit_per_minute: Option<u32>,
}
