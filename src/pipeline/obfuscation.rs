//! Built-in obfuscation plugin: redacts configured header names and,
//! optionally, the entire body of both sides of a witness.
//!
//! Registered first in the pipeline (ahead of any user-supplied plugins)
//! so nothing downstream — including later plugins and the backend
//! collector — ever sees the raw values for redacted fields.

use crate::witness::{Witness, WitnessSide};

use super::{EventProcessor, ProcessContext, ProcessResult};

const REDACTED_PLACEHOLDER: &[u8] = b"[redacted]";

#[derive(Debug, Clone, Default)]
pub struct ObfuscationConfig {
    /// Header names to redact (case-insensitive), e.g. "authorization".
    pub redact_headers: Vec<String>,
    /// When set, both request and response bodies are replaced wholesale
    /// rather than redacted field-by-field.
    pub redact_bodies: bool,
}

pub struct ObfuscationPlugin {
    config: ObfuscationConfig,
}

impl ObfuscationPlugin {
    pub fn new(config: ObfuscationConfig) -> Self {
        Self { config }
    }

    fn needs_redaction(&self, side: &WitnessSide) -> bool {
        if self.config.redact_bodies && !side.body.is_empty() {
            return true;
        }
        side.headers
            .0
            .iter()
            .any(|(name, _)| self.is_redacted_header(name))
    }

    fn is_redacted_header(&self, name: &str) -> bool {
        self.config
            .redact_headers
            .iter()
            .any(|h| h.eq_ignore_ascii_case(name))
    }

    fn redact_side(&self, side: &WitnessSide) -> WitnessSide {
        let mut redacted = side.clone();
        for (name, value) in redacted.headers.0.iter_mut() {
            if self.is_redacted_header(name) {
                *value = "[redacted]".to_string();
            }
        }
        if self.config.redact_bodies && !redacted.body.is_empty() {
            redacted.body = REDACTED_PLACEHOLDER.to_vec();
            redacted.truncated = true;
        }
        redacted
    }
}

impl EventProcessor for ObfuscationPlugin {
    fn name(&self) -> &'static str {
        "obfuscation"
    }

    fn process(&self, witness: &Witness, _ctx: &ProcessContext) -> ProcessResult {
        if self.config.redact_headers.is_empty() && !self.config.redact_bodies {
            return ProcessResult::Continue;
        }

        let request_needs = witness.request.as_ref().is_some_and(|s| self.needs_redaction(s));
        let response_needs = witness.response.as_ref().is_some_and(|s| self.needs_redaction(s));
        if !request_needs && !response_needs {
            return ProcessResult::Continue;
        }

        let mut next = witness.clone();
        if request_needs {
            next.request = witness.request.as_ref().map(|s| self.redact_side(s));
        }
        if response_needs {
            next.response = witness.response.as_ref().map(|s| self.redact_side(s));
        }
        ProcessResult::Transform(Box::new(next))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::witness::Headers;
    use chrono::Utc;

    fn side_with_header(name: &str, value: &str) -> WitnessSide {
        let mut headers = Headers::default();
        headers.push(name, value);
        WitnessSide {
            seq: 0,
            observed_at: Utc::now(),
            method_or_status: "GET".into(),
            path: Some("/".into()),
            headers,
            body: vec![],
            truncated: false,
        }
    }

    fn witness_with_request(side: WitnessSide) -> Witness {
        Witness {
            id: Witness::new_id(),
            connection_id_display: "x".into(),
            trace_id: None,
            observed_at: Utc::now(),
            request: Some(side),
            response: None,
            one_sided: true,
            tcp_metadata: None,
            tls_handshake: None,
        }
    }

    #[test]
    fn redacts_configured_header_case_insensitively() {
        let plugin = ObfuscationPlugin::new(ObfuscationConfig {
            redact_headers: vec!["Authorization".into()],
            redact_bodies: false,
        });
        let w = witness_with_request(side_with_header("authorization", "Bearer secret"));
        match plugin.process(&w, &ProcessContext::default()) {
            ProcessResult::Transform(out) => {
                assert_eq!(out.request.unwrap().headers.get("Authorization"), Some("[redacted]"));
            }
            other => panic!("expected Transform, got {other:?}"),
        }
    }

    #[test]
    fn untouched_witness_passes_through() {
        let plugin = ObfuscationPlugin::new(ObfuscationConfig {
            redact_headers: vec!["Authorization".into()],
            redact_bodies: false,
        });
        let w = witness_with_request(side_with_header("host", "api.example.com"));
        assert!(matches!(
            plugin.process(&w, &ProcessContext::default()),
            ProcessResult::Continue
        ));
    }
}
