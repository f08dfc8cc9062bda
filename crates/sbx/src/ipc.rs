//! IPC protocol for orchestrator ↔ worker communication.
//!
//! Uses length-delimited JSON messages: 4-byte big-endian length prefix + JSON payload.
//! Exactly one [`ParentMessage`] and one [`ChildMessage`] cross each pipe.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::host::{guard_margin, snapshot_budget};
use crate::modules::DEFAULT_MAX_MODULES;
use crate::reply::{ExecutionReply, ExecutionRequest};
use crate::runner::SNAPSHOT_TIMEOUT;
use crate::sanitize::DEFAULT_CIRCULAR_MARKER;

/// Default maximum IPC message size: 64 MB.
pub const DEFAULT_MAX_IPC_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Default V8 heap limit: 64 MB.
pub const DEFAULT_MAX_HEAP_SIZE: usize = 64 * 1024 * 1024;

/// Default bound on nested thenable unwrapping.
pub const DEFAULT_MAX_UNWRAP_DEPTH: usize = 32;

/// Default tracing filter inside the worker.
pub const DEFAULT_WORKER_LOG_FILTER: &str = "warn,sbx::console=info";

/// The message sent from the orchestrator to the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ParentMessage {
    /// Run this request.
    Execute {
        /// The request.
        request: ExecutionRequest,
        /// Worker configuration.
        config: WorkerConfig,
    },
}

/// The message sent from the worker back to the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChildMessage {
    /// The sanitized context after execution.
    Reply {
        /// The reply.
        reply: ExecutionReply,
    },
}

/// Configuration passed to the worker process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Absolute module search roots for the escape hatch.
    #[serde(default)]
    pub module_paths: Vec<PathBuf>,
    /// Replacement for cyclic references.
    #[serde(default = "default_circular_marker")]
    pub circular_marker: String,
    /// Bound on nested thenable unwrapping.
    #[serde(default = "default_max_unwrap_depth")]
    pub max_unwrap_depth: usize,
    /// Bound on preloaded modules.
    #[serde(default = "default_max_modules")]
    pub max_modules: usize,
    /// Maximum IPC message size in bytes. Defaults to [`DEFAULT_MAX_IPC_MESSAGE_SIZE`].
    #[serde(default = "default_max_ipc_message_size")]
    pub max_ipc_message_size: usize,
    /// `EnvFilter` directives for the worker's own logging.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
    /// Time allowed for capturing the context after the run, in milliseconds.
    #[serde(default = "default_snapshot_timeout_ms")]
    pub snapshot_timeout_ms: u64,
}

fn default_circular_marker() -> String {
    DEFAULT_CIRCULAR_MARKER.to_string()
}

fn default_max_unwrap_depth() -> usize {
    DEFAULT_MAX_UNWRAP_DEPTH
}

fn default_max_modules() -> usize {
    DEFAULT_MAX_MODULES
}

fn default_max_ipc_message_size() -> usize {
    DEFAULT_MAX_IPC_MESSAGE_SIZE
}

fn default_log_filter() -> String {
    DEFAULT_WORKER_LOG_FILTER.to_string()
}

fn default_snapshot_timeout_ms() -> u64 {
    SNAPSHOT_TIMEOUT.as_millis() as u64
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            module_paths: Vec::new(),
            circular_marker: default_circular_marker(),
            max_unwrap_depth: DEFAULT_MAX_UNWRAP_DEPTH,
            max_modules: DEFAULT_MAX_MODULES,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
            log_filter: default_log_filter(),
            snapshot_timeout_ms: default_snapshot_timeout_ms(),
        }
    }
}

impl From<&crate::SandboxConfig> for WorkerConfig {
    fn from(config: &crate::SandboxConfig) -> Self {
        // The worker starts with a cleared environment in an unspecified
        // directory, so relative roots are pinned here.
        let cwd = std::env::current_dir().ok();
        let module_paths = config
            .module_paths
            .iter()
            .map(|p| match (&cwd, p.is_relative()) {
                (Some(cwd), true) => cwd.join(p),
                _ => p.clone(),
            })
            .collect();
        Self {
            max_heap_size: config.max_heap_size,
            module_paths,
            circular_marker: config.circular_marker.clone(),
            max_unwrap_depth: config.max_unwrap_depth,
            max_modules: config.max_modules,
            max_ipc_message_size: config.max_ipc_message_size,
            log_filter: config.worker_log_filter.clone(),
            snapshot_timeout_ms: snapshot_budget(guard_margin(config)).as_millis() as u64,
        }
    }
}

/// Write a length-delimited JSON message to an async writer.
///
/// Format: 4-byte big-endian length prefix followed by the JSON payload bytes.
pub async fn write_message<T: Serialize, W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &T,
) -> Result<(), std::io::Error> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let len = u32::try_from(payload.len()).map_err(|_| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!(
                "IPC payload too large: {} bytes (max {} bytes)",
                payload.len(),
                u32::MAX
            ),
        )
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a length-delimited JSON message from an async reader.
///
/// Returns `None` if the reader has reached EOF (clean shutdown).
/// Uses [`DEFAULT_MAX_IPC_MESSAGE_SIZE`] as the size limit.
pub async fn read_message<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<T>, std::io::Error> {
    read_message_with_limit(reader, DEFAULT_MAX_IPC_MESSAGE_SIZE).await
}

/// Read a length-delimited JSON message with a configurable size limit.
///
/// Returns `None` if the reader has reached EOF before a length prefix.
pub async fn read_message_with_limit<T: for<'de> Deserialize<'de>, R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Option<T>, std::io::Error> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("IPC message too large: {len} bytes (limit: {max_size} bytes)"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;

    let msg: T = serde_json::from_slice(&payload)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    Ok(Some(msg))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::{ExceptionInfo, ExceptionScope};
    use serde_json::json;
    use std::io::Cursor;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            source: "_result = 1;".into(),
            lockdown: true,
            context: json!({"name": "test1"}).as_object().unwrap().clone(),
            modules: vec!["_".into()],
            requires: vec![],
            timeout: Some(100),
        }
    }

    #[tokio::test]
    async fn execute_message_travels_intact() {
        let msg = ParentMessage::Execute {
            request: request(),
            config: WorkerConfig::default(),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let ParentMessage::Execute { request, config } =
            read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(request.timeout, Some(100));
        assert_eq!(request.context.get("name"), Some(&json!("test1")));
        assert_eq!(config, WorkerConfig::default());
    }

    #[tokio::test]
    async fn reply_message_keeps_flat_context() {
        let mut reply = ExecutionReply::failed(ExceptionInfo::vm("boom"));
        reply.variables.insert("x".into(), json!([1, 2]));
        let msg = ChildMessage::Reply { reply };

        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&buf[4..]).unwrap();
        assert_eq!(payload["type"], "Reply");
        assert_eq!(payload["reply"]["x"], json!([1, 2]));
        assert_eq!(payload["reply"]["_exception"]["scope"], "vm");

        let mut cursor = Cursor::new(buf);
        let ChildMessage::Reply { reply } = read_message(&mut cursor).await.unwrap().unwrap();
        assert_eq!(reply.exception.unwrap().scope, ExceptionScope::Vm);
        assert_eq!(reply.variables.get("x"), Some(&json!([1, 2])));
    }

    #[tokio::test]
    async fn eof_returns_none() {
        let mut cursor = Cursor::new(Vec::<u8>::new());
        let result: Option<ParentMessage> = read_message(&mut cursor).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn truncated_payload_is_an_error() {
        let msg = ChildMessage::Reply {
            reply: ExecutionReply::default(),
        };
        let mut buf = Vec::new();
        write_message(&mut buf, &msg).await.unwrap();
        buf.truncate(buf.len() - 3);
        let mut cursor = Cursor::new(buf);
        let result: Result<Option<ChildMessage>, _> = read_message(&mut cursor).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn read_message_with_limit_rejects_oversized() {
        let mut reply = ExecutionReply::default();
        reply.variables.insert("blob".into(), json!("x".repeat(1024)));
        let mut buf = Vec::new();
        write_message(&mut buf, &ChildMessage::Reply { reply }).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let result: Result<Option<ChildMessage>, _> =
            read_message_with_limit(&mut cursor, 64).await;
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("too large"), "error: {err_msg}");
    }

    #[test]
    fn worker_config_serde_defaults() {
        let config: WorkerConfig = serde_json::from_str(r#"{"max_heap_size": 1048576}"#).unwrap();
        assert_eq!(config.max_heap_size, 1024 * 1024);
        assert_eq!(config.max_ipc_message_size, DEFAULT_MAX_IPC_MESSAGE_SIZE);
        assert_eq!(config.circular_marker, "[Circular]");
        assert_eq!(config.max_unwrap_depth, DEFAULT_MAX_UNWRAP_DEPTH);
        assert_eq!(config.log_filter, DEFAULT_WORKER_LOG_FILTER);
        assert_eq!(config.snapshot_timeout_ms, 1000);
    }

    #[test]
    fn snapshot_budget_fits_inside_the_guard_margin() {
        let default = WorkerConfig::from(&crate::SandboxConfig::default());
        assert_eq!(default.snapshot_timeout_ms, SNAPSHOT_TIMEOUT.as_millis() as u64);

        let tight = WorkerConfig::from(&crate::SandboxConfig {
            guard_margin: std::time::Duration::from_millis(200),
            ..Default::default()
        });
        assert_eq!(tight.snapshot_timeout_ms, 100);
    }

    #[test]
    fn worker_config_pins_relative_module_paths() {
        let sandbox = crate::SandboxConfig {
            module_paths: vec![PathBuf::from("node_modules"), PathBuf::from("/abs/mods")],
            ..Default::default()
        };
        let worker = WorkerConfig::from(&sandbox);
        assert!(worker.module_paths.iter().all(|p| p.is_absolute()));
        assert_eq!(worker.module_paths[1], PathBuf::from("/abs/mods"));
        assert_eq!(worker.max_unwrap_depth, sandbox.max_unwrap_depth);
    }
}
