//! Capability registry: the fixed set of names injected into every sandbox
//! context.
//!
//! The key list here is the single source of truth for "infrastructure, not
//! user data": the isolate installs exactly these names, and the
//! [`Sanitizer`](crate::sanitize::Sanitizer) deletes exactly these names from
//! the reply.
//!
//! The capability values themselves are JavaScript objects built by the
//! isolate bootstrap; logging capabilities reach back into Rust through the
//! `op_sbx_capture` / `op_sbx_console` ops, which write to the per-execution
//! [`OutputSink`] stored in the isolate's `OpState`.

use std::cell::RefCell;
use std::rc::Rc;

use chrono::Utc;
use deno_core::JsRuntime;

use crate::reply::{LogEntry, LogKind};

/// Names injected into every sandbox context, in installation order.
pub const CAPABILITY_KEYS: [&str; 9] = [
    "sbx",
    "_log",
    "console",
    "process",
    "exports",
    "setTimeout",
    "clearTimeout",
    "setInterval",
    "clearInterval",
];

/// Tracing target that captured and forwarded console lines are logged under.
pub const CONSOLE_TARGET: &str = "sbx::console";

/// Per-execution buffer of captured console output.
///
/// Lives on the isolate thread only; cloning shares the same buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputSink(Rc<RefCell<Vec<LogEntry>>>);

impl OutputSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a line and forward it to the host console.
    pub fn record(&self, kind: LogKind, text: &str) {
        self.0.borrow_mut().push(LogEntry {
            kind,
            timestamp: Utc::now(),
            text: text.to_string(),
        });
        forward_to_host(kind, text);
    }

    /// Number of captured lines.
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    /// Whether nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Drain the captured lines, in call order.
    pub fn take(&self) -> Vec<LogEntry> {
        std::mem::take(&mut *self.0.borrow_mut())
    }
}

/// Write a console line to the host console (the worker's stderr via tracing).
pub fn forward_to_host(kind: LogKind, text: &str) {
    match kind {
        LogKind::Warn => tracing::warn!(target: CONSOLE_TARGET, "{}", text),
        LogKind::Error => tracing::error!(target: CONSOLE_TARGET, "{}", text),
        LogKind::Log | LogKind::Info | LogKind::Trace => {
            tracing::info!(target: CONSOLE_TARGET, kind = ?kind, "{}", text)
        }
    }
}

/// Capabilities bound to one execution's output sink.
#[derive(Debug, Clone)]
pub struct CapabilityRegistry {
    sink: OutputSink,
}

impl CapabilityRegistry {
    /// Bind the registry to `sink`. Nothing is shared with other executions.
    pub fn build(sink: OutputSink) -> Self {
        Self { sink }
    }

    /// The registry key set.
    pub fn keys() -> &'static [&'static str] {
        &CAPABILITY_KEYS
    }

    /// Whether `key` is a capability name.
    pub fn contains(key: &str) -> bool {
        CAPABILITY_KEYS.contains(&key)
    }

    /// The sink logging capabilities append to.
    pub fn sink(&self) -> &OutputSink {
        &self.sink
    }

    /// Hand the sink to the isolate and define every capability on its global.
    ///
    /// Requires the bootstrap to have run.
    pub(crate) fn install(&self, runtime: &mut JsRuntime) -> anyhow::Result<()> {
        runtime.op_state().borrow_mut().put(self.sink.clone());
        let keys = serde_json::to_string(&CAPABILITY_KEYS)?;
        runtime
            .execute_script(
                "[sbx:capabilities]",
                format!("__sbx_internal.installCapabilities({keys});"),
            )
            .map_err(|e| anyhow::anyhow!("failed to install capabilities: {e}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn keys_are_unique_and_cover_the_contract() {
        let keys: HashSet<&str> = CapabilityRegistry::keys().iter().copied().collect();
        assert_eq!(keys.len(), CAPABILITY_KEYS.len());
        for required in ["_log", "process", "setTimeout", "clearInterval", "console"] {
            assert!(CapabilityRegistry::contains(required), "{required} missing");
        }
        assert!(!CapabilityRegistry::contains("require"));
        assert!(!CapabilityRegistry::contains("_result"));
    }

    #[test]
    fn sink_records_in_order_and_drains() {
        let registry = CapabilityRegistry::build(OutputSink::new());
        let shared = registry.sink().clone();
        shared.record(LogKind::Log, "first");
        shared.record(LogKind::Warn, "second");
        assert_eq!(registry.sink().len(), 2);

        let entries = registry.sink().take();
        assert_eq!(entries[0].text, "first");
        assert_eq!(entries[1].kind, LogKind::Warn);
        assert!(entries[0].timestamp <= entries[1].timestamp);
        assert!(registry.sink().is_empty());
    }

    #[test]
    fn sinks_are_not_shared_between_registries() {
        let a = CapabilityRegistry::build(OutputSink::new());
        let b = CapabilityRegistry::build(OutputSink::new());
        a.sink().record(LogKind::Info, "only in a");
        assert_eq!(a.sink().len(), 1);
        assert!(b.sink().is_empty());
    }
}
