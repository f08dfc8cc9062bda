//! deno_core op definitions for the sandbox isolate.
//!
//! The `#[op2]` macro generates additional public items (v8 function pointers,
//! metadata structs) that cannot carry doc comments. We suppress `missing_docs`
//! at the module level; all actual functions and types are documented below.
#![allow(missing_docs)]

use std::time::Duration;

use deno_core::op2;
use deno_core::v8;
use deno_core::OpState;

use crate::capabilities::{forward_to_host, OutputSink};
use crate::reply::LogKind;

/// Append a rendered console line to the output sink (and forward it).
#[op2(fast)]
pub fn op_sbx_capture(state: &mut OpState, #[string] kind: &str, #[string] text: &str) {
    let kind = LogKind::from_method(kind);
    match state.try_borrow::<OutputSink>() {
        Some(sink) => sink.record(kind, text),
        None => forward_to_host(kind, text),
    }
}

/// Forward a console line to the host console without capturing it.
#[op2(fast)]
pub fn op_sbx_console(#[string] kind: &str, #[string] text: &str) {
    forward_to_host(LogKind::from_method(kind), text);
}

/// Resolve after `delay_ms` milliseconds. Backs the timer capabilities.
#[op2(async)]
pub async fn op_sbx_sleep(delay_ms: f64) {
    let delay = if delay_ms.is_finite() && delay_ms > 0.0 {
        Duration::from_secs_f64(delay_ms / 1000.0)
    } else {
        Duration::ZERO
    };
    tokio::time::sleep(delay).await;
}

/// Record a `process.exit(code)` request and terminate the isolate.
#[op2(fast)]
pub fn op_sbx_exit(state: &mut OpState, code: i32) {
    tracing::debug!(code, "process.exit requested");
    if state.try_borrow::<ExitRequest>().is_none() {
        state.put(ExitRequest(code));
    }
    if let Some(handle) = state.try_borrow::<TerminationHandle>() {
        handle.0.terminate_execution();
    }
}

/// Store the serialized context snapshot.
#[op2(fast)]
pub fn op_sbx_set_snapshot(state: &mut OpState, #[string] json: &str) {
    state.put(ContextSnapshot(json.to_string()));
}

/// Report the settle phase of the current `_result`.
#[op2(fast)]
pub fn op_sbx_settle(state: &mut OpState, #[string] phase: &str) {
    let phase = match phase {
        "pending" => SettleState::Pending,
        "settled" => SettleState::Settled,
        _ => SettleState::Done,
    };
    state.put(phase);
}

/// Exit code requested through `process.exit`. The first request wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest(pub i32);

/// Handle used to stop the isolate from inside an op.
pub struct TerminationHandle(pub v8::IsolateHandle);

/// Serialized context arena produced by the snapshot bootstrap function.
pub struct ContextSnapshot(pub String);

/// Where the current `_result` stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettleState {
    /// A thenable is being waited on.
    Pending,
    /// The thenable settled; `_result` may hold another one.
    Settled,
    /// `_result` is final (not thenable, or `_exception` is set).
    Done,
}

deno_core::extension!(
    sbx_ext,
    ops = [
        op_sbx_capture,
        op_sbx_console,
        op_sbx_sleep,
        op_sbx_exit,
        op_sbx_set_snapshot,
        op_sbx_settle
    ],
);
