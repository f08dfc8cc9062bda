//! Error types for the sandbox.

use std::path::PathBuf;

use thiserror::Error;

use crate::reply::{ExceptionScope, ExecutionReply};

/// Coarse classification of a [`SandboxError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input; surfaced before any process is spawned.
    InvalidArgument,
    /// The pluggable source transform failed; surfaced before spawn.
    TransformError,
    /// The untrusted code threw or its promise rejected (scope `vm`).
    ExecutionError,
    /// The execution facility failed inside the isolate (scope `transport`).
    HostError,
    /// The isolate could not produce a reply at all.
    ProcessError,
}

impl ErrorKind {
    /// Returns a static error code string for programmatic matching.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::TransformError => "TRANSFORM_ERROR",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::HostError => "HOST_ERROR",
            Self::ProcessError => "PROCESS_ERROR",
        }
    }
}

/// Errors that can occur while running code in an isolate.
///
/// Reply-shaped failures ([`SandboxError::Execution`], [`SandboxError::Host`])
/// carry the sanitized reply; process-level failures carry none.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The call itself was malformed.
    #[error("invalid argument: {reason}")]
    InvalidArgument {
        /// What went wrong.
        reason: String,
    },

    /// Source exceeds the configured maximum size.
    #[error("source exceeds maximum size of {max} bytes (got {actual})")]
    SourceTooLarge {
        /// Maximum allowed size.
        max: usize,
        /// Actual size.
        actual: usize,
    },

    /// The source transform failed or produced no source.
    #[error("source transform failed: {reason}")]
    Transform {
        /// What went wrong.
        reason: String,
    },

    /// The untrusted code threw, or its returned promise rejected.
    #[error("javascript error: {}", exception_message(.reply))]
    Execution {
        /// The sanitized reply, including `_exception`.
        reply: Box<ExecutionReply>,
    },

    /// The execution facility failed (syntax error, in-isolate timeout, heap limit).
    #[error("isolate host error: {}", exception_message(.reply))]
    Host {
        /// The sanitized reply, including `_exception`.
        reply: Box<ExecutionReply>,
    },

    /// The worker process could not be started.
    #[error("failed to spawn isolate worker at {}: {source}", .path.display())]
    Spawn {
        /// Worker binary that was launched.
        path: PathBuf,
        /// The underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// No reply arrived before the orchestrator-side guard fired.
    #[error("isolate did not reply within {timeout_ms}ms (plus {margin_ms}ms guard margin)")]
    Timeout {
        /// Requested execution timeout in milliseconds.
        timeout_ms: u64,
        /// Guard margin added on top of the timeout.
        margin_ms: u64,
    },

    /// Any other process-level failure: crash without reply, broken pipe,
    /// malformed reply, missing worker binary.
    #[error("isolate process failed: {0}")]
    Process(#[from] anyhow::Error),
}

fn exception_message(reply: &ExecutionReply) -> &str {
    reply
        .exception
        .as_ref()
        .map(|e| e.message.as_str())
        .unwrap_or("unknown error")
}

impl SandboxError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } | Self::SourceTooLarge { .. } => ErrorKind::InvalidArgument,
            Self::Transform { .. } => ErrorKind::TransformError,
            Self::Execution { .. } => ErrorKind::ExecutionError,
            Self::Host { .. } => ErrorKind::HostError,
            Self::Spawn { .. } | Self::Timeout { .. } | Self::Process(_) => ErrorKind::ProcessError,
        }
    }

    /// The reply attached to a reply-shaped failure.
    pub fn context(&self) -> Option<&ExecutionReply> {
        match self {
            Self::Execution { reply } | Self::Host { reply } => Some(reply),
            _ => None,
        }
    }

    /// Turn a reply into `Ok` or the matching reply-shaped error.
    pub fn check_reply(reply: ExecutionReply) -> Result<ExecutionReply, SandboxError> {
        match reply.exception.as_ref().map(|e| e.scope) {
            None => Ok(reply),
            Some(ExceptionScope::Vm) => Err(Self::Execution {
                reply: Box::new(reply),
            }),
            Some(ExceptionScope::Transport) => Err(Self::Host {
                reply: Box::new(reply),
            }),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reply::ExceptionInfo;

    #[test]
    fn check_reply_routes_by_scope() {
        assert!(SandboxError::check_reply(ExecutionReply::default()).is_ok());

        let err = SandboxError::check_reply(ExecutionReply::failed(ExceptionInfo::vm("x is not defined")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutionError);
        assert!(err.to_string().contains("x is not defined"));
        assert!(err.context().is_some());

        let err = SandboxError::check_reply(ExecutionReply::failed(ExceptionInfo::transport("timed out")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HostError);
    }

    #[test]
    fn process_errors_have_no_context() {
        let err = SandboxError::Timeout {
            timeout_ms: 100,
            margin_ms: 1000,
        };
        assert_eq!(err.kind(), ErrorKind::ProcessError);
        assert!(err.context().is_none());
        assert_eq!(err.kind().code(), "PROCESS_ERROR");

        let err = SandboxError::Process(anyhow::anyhow!("worker exited"));
        assert!(err.to_string().contains("worker exited"));
    }

    #[test]
    fn invalid_arguments_classify_together() {
        assert_eq!(SandboxError::invalid("empty").kind(), ErrorKind::InvalidArgument);
        let err = SandboxError::SourceTooLarge { max: 1, actual: 2 };
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
