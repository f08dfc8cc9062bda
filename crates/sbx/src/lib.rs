#![warn(missing_docs)]

//! # sbx
//!
//! Run untrusted JavaScript in disposable, single-use V8 isolates.
//!
//! Every call to [`Sandbox::vm`] spawns one `sbx-worker` process, sends it a
//! single [`ExecutionRequest`] and receives a single [`ExecutionReply`]: the
//! final context of the run with infrastructure keys removed and cycles
//! broken, plus the captured console output and an optional exception.
//!
//! ## Security model
//!
//! - **One process per execution**: no reuse, no pooling, no shared memory
//! - **Fresh isolate per process**: no state leakage between executions
//! - **Fixed capabilities**: logging, `process.exit`, timers and nothing else
//! - **Lockdown by default**: `require` exists only when explicitly unlocked,
//!   and then only resolves modules under the configured roots
//! - **Two timeouts**: an in-isolate limit plus an orchestrator guard that
//!   bounds caller latency even when the worker hangs
//! - **Heap limit**: V8 is terminated near its configured heap size

pub mod capabilities;
pub mod error;
pub mod graph;
pub mod host;
pub mod ipc;
pub mod modules;
pub mod ops;
pub mod reply;
pub mod runner;
pub mod sanitize;
pub mod scanner;
pub mod validator;
pub mod wrapper;

pub use capabilities::{CapabilityRegistry, OutputSink};
pub use error::{ErrorKind, SandboxError};
pub use graph::{Graph, Node, NodeId};
pub use host::{vm, Sandbox, SandboxConfig, VmOptions};
pub use reply::{ExceptionInfo, ExceptionScope, ExecutionReply, ExecutionRequest, LogEntry, LogKind};
pub use runner::{run_isolate, run_isolate_blocking};
pub use sanitize::{CircularReplacer, OutputTooLarge, Sanitizer};
pub use scanner::{ImportExtractor, ModuleScanner, RegexScanner};
pub use wrapper::{SourceTransform, SourceWrapper, WrapOptions};
