//! sbx worker: the single-use isolate process.
//!
//! Spawned by [`sbx::Sandbox`] in the parent. It reads exactly one
//! `Execute` message from stdin, runs it in a fresh V8 isolate, writes exactly
//! one `Reply` message to stdout and exits.
//!
//! **Security**: This process runs with a clean environment. Its only channel
//! to the outside is the stdin/stdout pipe pair.

use std::process::ExitCode;

use anyhow::{Context, Result};
use sbx::ipc::{read_message, write_message, ChildMessage, ParentMessage};
use sbx::{ExceptionInfo, ExecutionReply};
use tokio::io::{self, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    // Clean environment: remove all env vars for isolation
    let env_keys: Vec<String> = std::env::vars().map(|(k, _)| k).collect();
    for key in env_keys {
        std::env::remove_var(&key);
    }

    let mut stdin = BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    let ParentMessage::Execute { request, config } = read_message(&mut stdin)
        .await
        .context("failed to read request from parent")?
        .context("parent closed stdin before sending Execute")?;

    // Logs go to stderr; stdout carries the reply.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();
    tracing::debug!(
        lockdown = request.lockdown,
        timeout_ms = ?request.timeout,
        "request received"
    );

    let max_size = config.max_ipc_message_size;
    let reply = bounded(sbx::run_isolate_blocking(request, config), max_size);
    let code = reply.exit_code();

    write_message(&mut stdout, &ChildMessage::Reply { reply })
        .await
        .context("failed to write reply to parent")?;
    stdout.flush().await?;

    Ok(ExitCode::from(code))
}

/// Replace a reply that would not fit in one IPC message with a failure that does.
fn bounded(reply: ExecutionReply, max_size: usize) -> ExecutionReply {
    let size = match serde_json::to_vec(&reply) {
        Ok(bytes) => bytes.len(),
        Err(e) => {
            tracing::error!(error = %e, "reply is not serializable");
            return ExecutionReply::failed(ExceptionInfo::transport(format!(
                "reply could not be serialized: {e}"
            )));
        }
    };
    if size <= max_size {
        return reply;
    }
    tracing::warn!(size, max_size, "reply too large, dropping context");
    ExecutionReply::failed(ExceptionInfo::transport(format!(
        "reply too large: {size} bytes (limit: {max_size} bytes)"
    )))
}
