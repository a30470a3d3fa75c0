//! Pass-through instrumentation.
//!
//! The engine opens a [`TraceSpan`] around pipeline batches, searches, and
//! indexing runs. Which [`Tracer`] backs those spans is decided once, at
//! construction, by [`tracer_from_config`]: with no tracing configuration
//! every span is a no-op.

use std::sync::Arc;
use std::time::Instant;

use tracing::info;

/// Capability interface for span-style instrumentation.
pub trait Tracer: Send + Sync + std::fmt::Debug {
    /// Open a span. The span is closed by [`TraceSpan::finish`].
    fn span(&self, name: &str) -> TraceSpan;
}

/// An open span. Dropping without `finish` records nothing.
#[derive(Debug)]
pub struct TraceSpan {
    name: String,
    service: Option<Arc<str>>,
    started: Instant,
    attributes: Vec<(String, String)>,
}

impl TraceSpan {
    fn noop() -> Self {
        Self {
            name: String::new(),
            service: None,
            started: Instant::now(),
            attributes: Vec::new(),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.service.is_some()
    }

    /// Attach an attribute; ignored by no-op spans.
    pub fn record(&mut self, key: &str, value: impl ToString) {
        if self.is_recording() {
            self.attributes.push((key.to_string(), value.to_string()));
        }
    }

    pub fn finish(self, ok: bool) {
        let Some(service) = self.service else {
            return;
        };
        let attributes = self
            .attributes
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(
            target: "codectx::trace",
            service = %service,
            span = %self.name,
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            ok,
            %attributes,
            "span finished"
        );
    }
}

/// Tracer that records nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn span(&self, _name: &str) -> TraceSpan {
        TraceSpan::noop()
    }
}

/// Tracer that reports finished spans as `tracing` events.
#[derive(Debug, Clone)]
pub struct LogTracer {
    service: Arc<str>,
}

impl LogTracer {
    pub fn new(service: &str) -> Self {
        Self {
            service: Arc::from(service),
        }
    }
}

impl Tracer for LogTracer {
    fn span(&self, name: &str) -> TraceSpan {
        TraceSpan {
            name: name.to_string(),
            service: Some(self.service.clone()),
            started: Instant::now(),
            attributes: Vec::new(),
        }
    }
}

/// Pick the tracer variant: a configured service name enables [`LogTracer`].
pub fn tracer_from_config(service: Option<&str>) -> Arc<dyn Tracer> {
    match service {
        Some(name) if !name.trim().is_empty() => Arc::new(LogTracer::new(name)),
        _ => Arc::new(NoopTracer),
    }
}
