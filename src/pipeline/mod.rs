//! The PluginPipeline: extensible, ordered `Witness -> Option<Witness>`
//! processing that runs after the `FilterChain` and before the
//! `BackendCollector`.
//!
//! # Architecture
//!
//! ```text
//! Witness → PluginPipeline → [Plugin₁, Plugin₂, ...] → Processed Witness
//! ```
//!
//! # Plugin Types
//!
//! Plugins can perform three operations:
//! - **Filter**: Drop witnesses (return `ProcessResult::Drop`)
//! - **Transform**: Modify witnesses (return `ProcessResult::Transform(modified)`)
//! - **Side-effect**: React to witnesses without modification (return `ProcessResult::Continue`)

use std::borrow::Cow;
use std::sync::Arc;

use crate::witness::Witness;

pub mod obfuscation;

/// Result of processing a witness through one plugin.
#[derive(Debug)]
pub enum ProcessResult {
    /// Witness continues unchanged (side-effect only plugin)
    Continue,
    /// Witness was transformed - use this new version (boxed to reduce enum size)
    Transform(Box<Witness>),
    /// Witness should be dropped (filtered out)
    Drop,
    /// Plugin encountered an error (witness continues unchanged, error logged)
    Error(anyhow::Error),
}

/// Context provided to plugins for decision-making.
///
/// Uses `Arc<str>` for cheap cloning - plugin side-effects often need to
/// clone context for async operations, and an `Arc` clone is just a
/// refcount bump.
#[derive(Debug, Clone, Default)]
pub struct ProcessContext {
    /// The trace this witness currently belongs to, if any.
    pub trace_id: Option<Arc<str>>,
    /// The service this witness currently belongs to, if any.
    pub service_id: Option<Arc<str>>,
}

impl ProcessContext {
    pub fn new(trace_id: Option<&str>, service_id: Option<&str>) -> Self {
        Self {
            trace_id: trace_id.map(Arc::from),
            service_id: service_id.map(Arc::from),
        }
    }
}

/// Trait for plugin pipeline stages.
///
/// Plugins are called in registration order. Each plugin can:
/// - Transform the witness (return `ProcessResult::Transform(new_witness)`)
/// - Filter the witness (return `ProcessResult::Drop`)
/// - Perform side effects and pass through (return `ProcessResult::Continue`)
///
/// # Sync Design
///
/// `process` is intentionally synchronous. For I/O-bound operations,
/// plugins should use internal channels to offload work to dedicated
/// threads. This ensures the pipeline never blocks the async runtime.
pub trait EventProcessor: Send + Sync {
    /// Human-readable name for logging and debugging.
    fn name(&self) -> &'static str;

    /// Process a witness, returning the result.
    fn process(&self, witness: &Witness, ctx: &ProcessContext) -> ProcessResult;

    /// Called when the pipeline is shutting down. Implementations must
    /// block until cleanup is complete (e.g. a background thread has
    /// finished flushing).
    fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Pipeline that runs witnesses through registered plugins.
pub struct EventPipeline {
    processors: Vec<Arc<dyn EventProcessor>>,
}

impl EventPipeline {
    /// Create an empty pipeline (passthrough).
    pub fn new() -> Self {
        Self {
            processors: Vec::new(),
        }
    }

    /// Register a plugin. Plugins are called in registration order.
    pub fn register(&mut self, processor: impl EventProcessor + 'static) {
        self.processors.push(Arc::new(processor));
    }

    /// Process a witness through all registered plugins.
    ///
    /// Returns `Some(Cow::Borrowed(witness))` if no transformation occurred,
    /// `Some(Cow::Owned(witness))` if any plugin transformed the witness,
    /// `None` if any plugin dropped it.
    ///
    /// Using `Cow` avoids cloning when all plugins are side-effect-only.
    pub fn process<'a>(
        &self,
        witness: &'a Witness,
        ctx: &ProcessContext,
    ) -> Option<Cow<'a, Witness>> {
        if self.processors.is_empty() {
            return Some(Cow::Borrowed(witness));
        }

        let mut current: Cow<'a, Witness> = Cow::Borrowed(witness);

        for processor in &self.processors {
            match processor.process(current.as_ref(), ctx) {
                ProcessResult::Continue => {}
                ProcessResult::Transform(new_witness) => {
                    current = Cow::Owned(*new_witness);
                }
                ProcessResult::Drop => {
                    tracing::trace!("Witness dropped by plugin '{}'", processor.name());
                    return None;
                }
                ProcessResult::Error(error) => {
                    tracing::error!("Plugin '{}' error: {}", processor.name(), error);
                    // Witness continues unchanged; the plugin's own failure
                    // should not take the witness down with it.
                }
            }
        }
        Some(current)
    }

    /// Shutdown all plugins gracefully, in reverse registration order
    /// (LIFO) since a later-registered plugin may depend on one
    /// registered earlier. Blocks until all plugins finish cleanup.
    pub fn shutdown(&self) -> anyhow::Result<()> {
        for processor in self.processors.iter().rev() {
            if let Err(e) = processor.shutdown() {
                tracing::warn!("Plugin '{}' shutdown error: {}", processor.name(), e);
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.processors.is_empty()
    }

    pub fn processor_names(&self) -> Vec<&'static str> {
        self.processors.iter().map(|p| p.name()).collect()
    }
}

impl Default for EventPipeline {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn witness() -> Witness {
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

    struct DropEverything;
    impl EventProcessor for DropEverything {
        fn name(&self) -> &'static str {
            "drop-everything"
        }
        fn process(&self, _witness: &Witness, _ctx: &ProcessContext) -> ProcessResult {
            ProcessResult::Drop
        }
    }

    #[test]
    fn empty_pipeline_passes_through_borrowed() {
        let pipeline = EventPipeline::new();
        let w = witness();
        let result = pipeline.process(&w, &ProcessContext::default());
        assert!(matches!(result, Some(Cow::Borrowed(_))));
    }

    #[test]
    fn drop_plugin_filters_witness() {
        let mut pipeline = EventPipeline::new();
        pipeline.register(DropEverything);
        let w = witness();
        assert!(pipeline.process(&w, &ProcessContext::default()).is_none());
    }
}
