//! Orchestrator: parent-side management of single-use isolate worker processes.
//!
//! Each [`Sandbox::vm`] call validates and wraps the source, spawns one
//! `sbx-worker` child with a clean environment, sends one
//! [`ParentMessage::Execute`] over stdin and waits for one
//! [`ChildMessage::Reply`] on stdout. A guard of `timeout + guard_margin`
//! bounds how long the caller waits, however the child behaves.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::Semaphore;
use tracing::Instrument;

use crate::error::SandboxError;
use crate::ipc::{
    read_message_with_limit, write_message, ChildMessage, ParentMessage, WorkerConfig,
    DEFAULT_MAX_HEAP_SIZE, DEFAULT_MAX_IPC_MESSAGE_SIZE, DEFAULT_MAX_UNWRAP_DEPTH,
    DEFAULT_WORKER_LOG_FILTER,
};
use crate::modules::DEFAULT_MAX_MODULES;
use crate::reply::{ExecutionReply, ExecutionRequest};
use crate::runner::SNAPSHOT_TIMEOUT;
use crate::sanitize::DEFAULT_CIRCULAR_MARKER;
use crate::validator::{validate_source, validate_timeout, DEFAULT_MAX_CODE_SIZE};
use crate::wrapper::{SourceTransform, SourceWrapper, WrapOptions};

/// Time added to the requested timeout before the orchestrator gives up on a
/// worker.
///
/// After the in-isolate limit fires the worker still captures the context
/// (bounded by [`SNAPSHOT_TIMEOUT`]), sanitizes it and writes the reply, so the
/// margin covers the snapshot budget plus one second for the rest.
pub const DEFAULT_GUARD_MARGIN: Duration =
    SNAPSHOT_TIMEOUT.saturating_add(Duration::from_secs(1));

/// Default bound on simultaneously running worker processes.
pub const DEFAULT_MAX_CONCURRENT: usize = 32;

/// Largest accepted `max_concurrent`; larger values are clamped to it.
pub const MAX_CONCURRENT_LIMIT: usize = Semaphore::MAX_PERMITS;

/// How long a worker may take to exit after replying before it is killed.
const REAP_GRACE: Duration = Duration::from_millis(500);

const WORKER_BIN_NAME: &str = "sbx-worker";

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Timeout applied when a call does not request one. `None` means no limit.
    pub default_timeout: Option<Duration>,
    /// Added to the timeout to form the orchestrator-side guard. Never zero.
    pub guard_margin: Duration,
    /// Maximum source size in bytes.
    pub max_code_size: usize,
    /// V8 heap limit in bytes.
    pub max_heap_size: usize,
    /// Maximum number of worker processes alive at once.
    pub max_concurrent: usize,
    /// Roots searched by the `require` escape hatch.
    pub module_paths: Vec<PathBuf>,
    /// Replacement for cyclic references in replies.
    pub circular_marker: String,
    /// Bound on nested thenable unwrapping.
    pub max_unwrap_depth: usize,
    /// Bound on modules preloaded for one execution.
    pub max_modules: usize,
    /// Maximum IPC message size in bytes.
    pub max_ipc_message_size: usize,
    /// Explicit worker binary. Searched for when `None`.
    pub worker_bin: Option<PathBuf>,
    /// Let worker stderr through to the parent's stderr.
    pub inherit_worker_stderr: bool,
    /// `EnvFilter` directives for the worker's logging.
    pub worker_log_filter: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            guard_margin: DEFAULT_GUARD_MARGIN,
            max_code_size: DEFAULT_MAX_CODE_SIZE,
            max_heap_size: DEFAULT_MAX_HEAP_SIZE,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            module_paths: Vec::new(),
            circular_marker: DEFAULT_CIRCULAR_MARKER.to_string(),
            max_unwrap_depth: DEFAULT_MAX_UNWRAP_DEPTH,
            max_modules: DEFAULT_MAX_MODULES,
            max_ipc_message_size: DEFAULT_MAX_IPC_MESSAGE_SIZE,
            worker_bin: None,
            inherit_worker_stderr: false,
            worker_log_filter: DEFAULT_WORKER_LOG_FILTER.to_string(),
        }
    }
}

/// Per-call options for [`Sandbox::vm`].
#[derive(Clone)]
pub struct VmOptions {
    /// Variables injected into the sandbox context.
    pub context: Map<String, Value>,
    /// In-isolate wall-clock limit. Falls back to the configured default.
    pub timeout: Option<Duration>,
    /// When true (the default) `require` is absent.
    pub lockdown: bool,
    /// Rewrite top-level `import` declarations into `require` calls.
    pub parse_imports: bool,
    /// Optional transform applied to the wrapped unit before it is sent.
    pub transform: Option<Arc<dyn SourceTransform>>,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            context: Map::new(),
            timeout: None,
            lockdown: true,
            parse_imports: false,
            transform: None,
        }
    }
}

impl std::fmt::Debug for VmOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmOptions")
            .field("context", &self.context)
            .field("timeout", &self.timeout)
            .field("lockdown", &self.lockdown)
            .field("parse_imports", &self.parse_imports)
            .field("transform", &self.transform.is_some())
            .finish()
    }
}

impl VmOptions {
    /// Options carrying `context` as caller variables.
    pub fn with_context(context: Map<String, Value>) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }
}

/// Runs untrusted sources, one worker process per call.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: Arc<SandboxConfig>,
    slots: Arc<Semaphore>,
    wrapper: SourceWrapper,
}

impl Default for Sandbox {
    fn default() -> Self {
        Self::new(SandboxConfig::default())
    }
}

/// Run `source` with the default configuration.
pub async fn vm(source: &str, options: VmOptions) -> Result<ExecutionReply, SandboxError> {
    Sandbox::default().vm(source, options).await
}

impl Sandbox {
    /// Create a sandbox. Concurrency is bounded by `config.max_concurrent`.
    pub fn new(config: SandboxConfig) -> Self {
        let permits = config.max_concurrent.clamp(1, MAX_CONCURRENT_LIMIT);
        let slots = Arc::new(Semaphore::new(permits));
        Self {
            config: Arc::new(config),
            slots,
            wrapper: SourceWrapper::default(),
        }
    }

    /// Use a custom wrapper (for example one with a real import parser).
    pub fn with_wrapper(mut self, wrapper: SourceWrapper) -> Self {
        self.wrapper = wrapper;
        self
    }

    /// The active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Run `source` in a fresh isolate and return its sanitized reply.
    ///
    /// A reply carrying `_exception` is returned as
    /// [`SandboxError::Execution`] or [`SandboxError::Host`] with the reply
    /// attached; failures that prevent a reply carry no context.
    pub async fn vm(&self, source: &str, options: VmOptions) -> Result<ExecutionReply, SandboxError> {
        let request = self.prepare(source, &options)?;
        let execution_id = uuid::Uuid::new_v4();
        let span = tracing::info_span!("execution", %execution_id);
        self.dispatch(request).instrument(span).await
    }

    /// Like [`Sandbox::vm`], additionally handing the outcome to `callback`
    /// exactly once before returning it.
    pub async fn vm_with_callback<F>(
        &self,
        source: &str,
        options: VmOptions,
        callback: F,
    ) -> Result<ExecutionReply, SandboxError>
    where
        F: FnOnce(Result<&ExecutionReply, &SandboxError>),
    {
        let outcome = self.vm(source, options).await;
        callback(outcome.as_ref());
        outcome
    }

    /// Validate and wrap; nothing is spawned when this fails.
    fn prepare(&self, source: &str, options: &VmOptions) -> Result<ExecutionRequest, SandboxError> {
        validate_source(source, Some(self.config.max_code_size))?;
        let timeout = options.timeout.or(self.config.default_timeout);
        validate_timeout(timeout)?;

        let wrap = WrapOptions {
            parse_imports: options.parse_imports,
            lockdown: options.lockdown,
            timeout,
            capture_console: !options.context.contains_key("console"),
        };
        let wrapped = self
            .wrapper
            .wrap(source, &wrap, options.transform.as_deref())?;

        Ok(ExecutionRequest {
            source: wrapped.unit,
            lockdown: options.lockdown,
            context: options.context.clone(),
            modules: wrapped.modules,
            requires: wrapped.requires,
            timeout: timeout.map(timeout_millis).transpose()?,
        })
    }

    async fn dispatch(&self, request: ExecutionRequest) -> Result<ExecutionReply, SandboxError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|e| SandboxError::Process(anyhow::anyhow!("sandbox is shut down: {e}")))?;

        let worker_bin = find_worker_binary(self.config.worker_bin.as_deref())?;
        let inherit_stderr =
            self.config.inherit_worker_stderr || std::env::var_os("SBX_DEBUG").is_some();

        let mut child = Command::new(&worker_bin)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if inherit_stderr {
                Stdio::inherit()
            } else {
                Stdio::null()
            })
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SandboxError::Spawn {
                path: worker_bin.clone(),
                source,
            })?;
        tracing::info!(worker = %worker_bin.display(), pid = ?child.id(), "worker spawned");

        let timeout_ms = request.timeout;
        let guard = timeout_ms.map(|ms| Duration::from_millis(ms) + self.guard_margin());
        let pending = exchange(&mut child, request, WorkerConfig::from(&*self.config));

        let outcome = match guard {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_elapsed| limit),
            None => Ok(pending.await),
        };

        let reply = match outcome {
            Ok(reply) => reply,
            Err(limit) => {
                tracing::warn!(
                    guard_ms = limit.as_millis() as u64,
                    "worker did not reply in time, killing it"
                );
                let _ = child.kill().await;
                return Err(SandboxError::Timeout {
                    timeout_ms: timeout_ms.unwrap_or_default(),
                    margin_ms: self.guard_margin().as_millis() as u64,
                });
            }
        };

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                let status = reap(&mut child).await;
                tracing::warn!(error = %e, status = %status, "worker failed without a reply");
                return Err(SandboxError::Process(e.context(format!("worker {status}"))));
            }
        };

        let status = reap(&mut child).await;
        tracing::info!(
            success = reply.succeeded(),
            stdout_lines = reply.stdout.len(),
            status = %status,
            "worker replied"
        );
        SandboxError::check_reply(reply)
    }

    fn guard_margin(&self) -> Duration {
        guard_margin(&self.config)
    }
}

/// The configured guard margin, or the default when it is zero.
pub(crate) fn guard_margin(config: &SandboxConfig) -> Duration {
    if config.guard_margin.is_zero() {
        DEFAULT_GUARD_MARGIN
    } else {
        config.guard_margin
    }
}

/// Snapshot time the worker may spend within `margin`: at most half of it,
/// leaving the rest for startup, sanitizing and the reply.
pub(crate) fn snapshot_budget(margin: Duration) -> Duration {
    SNAPSHOT_TIMEOUT.min(margin / 2)
}

fn timeout_millis(timeout: Duration) -> Result<u64, SandboxError> {
    u64::try_from(timeout.as_millis())
        .map_err(|_| SandboxError::invalid(format!("timeout too large: {timeout:?}")))
}

/// Send the request and wait for the single reply.
async fn exchange(
    child: &mut Child,
    request: ExecutionRequest,
    config: WorkerConfig,
) -> anyhow::Result<ExecutionReply> {
    let max_size = config.max_ipc_message_size;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow::anyhow!("no stdin on worker"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow::anyhow!("no stdout on worker"))?;
    let mut stdout = BufReader::new(stdout);

    write_message(&mut stdin, &ParentMessage::Execute { request, config })
        .await
        .map_err(|e| anyhow::anyhow!("failed to send request: {e}"))?;
    drop(stdin);

    let message: Option<ChildMessage> = read_message_with_limit(&mut stdout, max_size)
        .await
        .map_err(|e| anyhow::anyhow!("failed to read reply: {e}"))?;
    match message {
        Some(ChildMessage::Reply { reply }) => Ok(reply),
        None => anyhow::bail!("worker exited without sending a reply"),
    }
}

/// Wait briefly for the worker to exit, then kill it. Returns a status label.
async fn reap(child: &mut Child) -> String {
    match tokio::time::timeout(REAP_GRACE, child.wait()).await {
        Ok(Ok(status)) => status.to_string(),
        Ok(Err(e)) => format!("wait failed: {e}"),
        Err(_) => {
            let _ = child.kill().await;
            "killed after reply".to_string()
        }
    }
}

/// Find the `sbx-worker` binary.
///
/// Search order:
/// 1. `configured` (from [`SandboxConfig::worker_bin`])
/// 2. `SBX_WORKER_BIN` environment variable (must be absolute path)
/// 3. Same directory as the current executable, or its parent
///
/// On Unix, rejects world-writable binaries (mode & 0o002 != 0).
pub fn find_worker_binary(configured: Option<&Path>) -> Result<PathBuf, SandboxError> {
    if let Some(path) = configured {
        if !path.exists() {
            return Err(SandboxError::Process(anyhow::anyhow!(
                "configured worker binary {} does not exist",
                path.display()
            )));
        }
        validate_binary_permissions(path)?;
        return Ok(path.to_path_buf());
    }

    if let Ok(path) = std::env::var("SBX_WORKER_BIN") {
        let p = PathBuf::from(&path);
        if !p.is_absolute() {
            return Err(SandboxError::Process(anyhow::anyhow!(
                "SBX_WORKER_BIN must be an absolute path, got: {path}"
            )));
        }
        if p.exists() {
            validate_binary_permissions(&p)?;
            return Ok(p);
        }
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            // Test binaries live in target/<profile>/deps/.
            for candidate in [Some(dir), dir.parent()].into_iter().flatten() {
                let worker = candidate.join(WORKER_BIN_NAME);
                if worker.exists() {
                    validate_binary_permissions(&worker)?;
                    return Ok(worker);
                }
            }
        }
    }

    Err(SandboxError::Process(anyhow::anyhow!(
        "{WORKER_BIN_NAME} binary not found. Set SBX_WORKER_BIN or install it alongside this executable"
    )))
}

/// Rejects world-writable binaries (Unix only).
fn validate_binary_permissions(_path: &Path) -> Result<(), SandboxError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let metadata = std::fs::metadata(_path).map_err(|e| {
            SandboxError::Process(anyhow::anyhow!(
                "cannot read metadata for {}: {e}",
                _path.display()
            ))
        })?;
        let mode = metadata.permissions().mode();
        if mode & 0o002 != 0 {
            return Err(SandboxError::Process(anyhow::anyhow!(
                "insecure permissions on worker binary {}: mode {:o} is world-writable",
                _path.display(),
                mode,
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serial_test::serial;

    #[test]
    #[serial]
    fn relative_env_var_is_rejected() {
        std::env::set_var("SBX_WORKER_BIN", "./relative/path");
        let result = find_worker_binary(None);
        std::env::remove_var("SBX_WORKER_BIN");
        let err = result.unwrap_err().to_string();
        assert!(err.contains("absolute"), "expected 'absolute' in error: {err}");
    }

    #[test]
    fn missing_configured_binary_is_an_error() {
        let err = find_worker_binary(Some(Path::new("/nonexistent/sbx-worker"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessError);
        assert!(err.to_string().contains("does not exist"));
    }

    #[cfg(unix)]
    #[test]
    fn world_writable_binary_is_rejected() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("sbx-worker");
        std::fs::write(&bin, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o777)).unwrap();
        let err = find_worker_binary(Some(&bin)).unwrap_err().to_string();
        assert!(err.contains("world-writable"), "{err}");

        std::fs::set_permissions(&bin, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(find_worker_binary(Some(&bin)).unwrap(), bin);
    }

    #[tokio::test]
    async fn empty_source_fails_before_spawn() {
        let sandbox = Sandbox::new(SandboxConfig {
            worker_bin: Some(PathBuf::from("/nonexistent/sbx-worker")),
            ..Default::default()
        });
        let err = sandbox.vm("   ", VmOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn zero_timeout_fails_before_spawn() {
        let sandbox = Sandbox::new(SandboxConfig {
            worker_bin: Some(PathBuf::from("/nonexistent/sbx-worker")),
            ..Default::default()
        });
        let options = VmOptions {
            timeout: Some(Duration::ZERO),
            ..Default::default()
        };
        let err = sandbox.vm("return 1;", options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[tokio::test]
    async fn failing_transform_fails_before_spawn() {
        let sandbox = Sandbox::new(SandboxConfig {
            worker_bin: Some(PathBuf::from("/nonexistent/sbx-worker")),
            ..Default::default()
        });
        let transform: Arc<dyn SourceTransform> = Arc::new(
            |_: &str, _: &crate::wrapper::TransformOptions<'_>| -> anyhow::Result<String> {
                anyhow::bail!("no thanks")
            },
        );
        let options = VmOptions {
            transform: Some(transform),
            ..Default::default()
        };
        let err = sandbox.vm("return 1;", options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TransformError);
    }

    #[tokio::test]
    async fn unrepresentable_timeout_fails_before_spawn() {
        let sandbox = Sandbox::new(SandboxConfig {
            worker_bin: Some(PathBuf::from("/nonexistent/sbx-worker")),
            ..Default::default()
        });
        let options = VmOptions {
            timeout: Some(Duration::MAX),
            ..Default::default()
        };
        let err = sandbox.vm("return 1;", options).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.to_string().contains("timeout too large"), "{err}");
    }

    #[test]
    fn largest_representable_timeout_is_kept_exactly() {
        let sandbox = Sandbox::default();
        let options = VmOptions {
            timeout: Some(Duration::from_millis(u64::MAX)),
            ..Default::default()
        };
        let request = sandbox.prepare("return 1;", &options).unwrap();
        assert_eq!(request.timeout, Some(u64::MAX));
    }

    #[test]
    fn oversized_concurrency_is_clamped() {
        let sandbox = Sandbox::new(SandboxConfig {
            max_concurrent: usize::MAX,
            ..Default::default()
        });
        assert_eq!(sandbox.slots.available_permits(), MAX_CONCURRENT_LIMIT);
    }

    #[test]
    fn prepare_builds_the_request() {
        let sandbox = Sandbox::new(SandboxConfig {
            default_timeout: Some(Duration::from_millis(250)),
            ..Default::default()
        });
        let mut context = Map::new();
        context.insert("name".into(), Value::from("test1"));
        let request = sandbox
            .prepare(
                "var _ = require('lodash'); return _;",
                &VmOptions {
                    lockdown: false,
                    ..VmOptions::with_context(context)
                },
            )
            .unwrap();
        assert_eq!(request.timeout, Some(250));
        assert!(!request.lockdown);
        assert_eq!(request.modules, vec!["_".to_string()]);
        assert_eq!(request.requires, vec!["lodash".to_string()]);
        assert_eq!(request.context.get("name"), Some(&Value::from("test1")));
    }

    #[test]
    fn guard_margin_is_never_zero() {
        let sandbox = Sandbox::new(SandboxConfig {
            guard_margin: Duration::ZERO,
            ..Default::default()
        });
        assert_eq!(sandbox.guard_margin(), DEFAULT_GUARD_MARGIN);
    }

    #[test]
    fn guard_margin_leaves_room_after_the_snapshot() {
        assert!(DEFAULT_GUARD_MARGIN > SNAPSHOT_TIMEOUT);
        assert_eq!(snapshot_budget(DEFAULT_GUARD_MARGIN), SNAPSHOT_TIMEOUT);
        let tight = Duration::from_millis(300);
        assert_eq!(snapshot_budget(tight), Duration::from_millis(150));
    }

    #[test]
    fn vm_options_default_to_lockdown() {
        let options = VmOptions::default();
        assert!(options.lockdown);
        assert!(!options.parse_imports);
        assert!(options.timeout.is_none());
    }
}
