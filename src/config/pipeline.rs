//! PluginPipeline configuration: currently just the built-in obfuscation
//! plugin's settings. User-supplied plugins are registered in code, not
//! configured here.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub redact_headers: Vec<String>,
    pub redact_bodies: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            redact_headers: vec!["authorization".to_string(), "cookie".to_string()],
            redact_bodies: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PipelineFileConfig {
    pub redact_headers: Option<Vec<String>>,
    pub redact_bodies: Option<bool>,
}
