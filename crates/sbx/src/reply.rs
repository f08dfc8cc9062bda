//! Request and reply payloads exchanged with an isolate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Reserved context slot holding the value returned by the untrusted code.
pub const RESULT_KEY: &str = "_result";
/// Reserved context slot holding the structured failure, if any.
pub const EXCEPTION_KEY: &str = "_exception";
/// Reserved context slot holding the captured console output.
pub const STDOUT_KEY: &str = "_stdout";

/// The single message sent to an isolate. Immutable once sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    /// The wrapped executable unit (already transformed).
    pub source: String,
    /// When false, the `require` escape hatch is installed.
    pub lockdown: bool,
    /// Caller variables injected into the sandbox context.
    pub context: Map<String, Value>,
    /// External module binding names, removed from the reply.
    pub modules: Vec<String>,
    /// Module specifiers the loader preloads when lockdown is off.
    #[serde(default)]
    pub requires: Vec<String>,
    /// In-isolate wall-clock limit in milliseconds.
    pub timeout: Option<u64>,
}

/// Where a failure was captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExceptionScope {
    /// The untrusted code threw, or its returned promise rejected.
    Vm,
    /// The execution facility itself failed (syntax error, timeout, heap limit).
    Transport,
}

impl std::fmt::Display for ExceptionScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vm => f.write_str("vm"),
            Self::Transport => f.write_str("transport"),
        }
    }
}

/// Structured failure carried in `_exception`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionInfo {
    /// Where the failure was captured.
    pub scope: ExceptionScope,
    /// Human-readable message.
    pub message: String,
    /// Stack trace, when the thrown value carried one.
    #[serde(default)]
    pub stack: Option<String>,
}

impl ExceptionInfo {
    /// A failure raised by the untrusted code.
    pub fn vm(message: impl Into<String>) -> Self {
        Self {
            scope: ExceptionScope::Vm,
            message: message.into(),
            stack: None,
        }
    }

    /// A failure raised by the execution facility.
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            scope: ExceptionScope::Transport,
            message: message.into(),
            stack: None,
        }
    }

    /// Split a multi-line engine error into a message line and a stack.
    pub fn transport_from_engine(text: &str) -> Self {
        let message = text.lines().next().unwrap_or(text).trim().to_string();
        let stack = text.contains('\n').then(|| text.to_string());
        Self {
            scope: ExceptionScope::Transport,
            message,
            stack,
        }
    }

    /// Interpret whatever the untrusted code left in `_exception`.
    ///
    /// A well-formed object is taken as is; anything else is reported as a
    /// vm-scope failure carrying the value's JSON text.
    pub fn from_context_value(value: Value) -> Option<Self> {
        match value {
            Value::Null => None,
            other => match serde_json::from_value::<ExceptionInfo>(other.clone()) {
                Ok(info) => Some(info),
                Err(_) => Some(Self::vm(match other {
                    Value::String(s) => s,
                    v => v.to_string(),
                })),
            },
        }
    }
}

/// Kind of a captured console line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    /// `log`
    Log,
    /// `info`
    Info,
    /// `warn`
    Warn,
    /// `error`
    Error,
    /// `trace`
    Trace,
}

impl LogKind {
    /// Parse a console method name; unknown names map to [`LogKind::Log`].
    pub fn from_method(name: &str) -> Self {
        match name {
            "info" => Self::Info,
            "warn" => Self::Warn,
            "error" => Self::Error,
            "trace" => Self::Trace,
            _ => Self::Log,
        }
    }
}

/// One captured console line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Console method that produced the line.
    pub kind: LogKind,
    /// When the line was captured.
    pub timestamp: DateTime<Utc>,
    /// Arguments rendered and joined with a single space.
    pub text: String,
}

/// The sanitized context returned by an isolate.
///
/// Serializes as one flat mapping: the caller-visible variables plus the
/// reserved `_result`, `_exception` and `_stdout` slots.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReply {
    /// Final value of `_result`, with promises settled.
    #[serde(rename = "_result", default)]
    pub result: Value,
    /// Present iff execution failed.
    #[serde(rename = "_exception", default)]
    pub exception: Option<ExceptionInfo>,
    /// Captured console output, in call order.
    #[serde(rename = "_stdout", default)]
    pub stdout: Vec<LogEntry>,
    /// Every other context key that survived sanitization.
    #[serde(flatten)]
    pub variables: Map<String, Value>,
}

impl ExecutionReply {
    /// Build a reply from a sanitized context mapping.
    ///
    /// `_stdout` in the mapping is discarded; the isolate's output sink is the
    /// authoritative record and is attached separately.
    pub fn from_context(mut context: Map<String, Value>) -> Self {
        let result = context.remove(RESULT_KEY).unwrap_or(Value::Null);
        let exception = context
            .remove(EXCEPTION_KEY)
            .and_then(ExceptionInfo::from_context_value);
        context.remove(STDOUT_KEY);
        Self {
            result,
            exception,
            stdout: Vec::new(),
            variables: context,
        }
    }

    /// A reply that carries nothing but a failure.
    pub fn failed(exception: ExceptionInfo) -> Self {
        Self {
            exception: Some(exception),
            ..Default::default()
        }
    }

    /// Look up a surviving context variable.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Whether the execution completed without an exception.
    pub fn succeeded(&self) -> bool {
        self.exception.is_none()
    }

    /// Exit code the isolate process reports for this reply.
    pub fn exit_code(&self) -> u8 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }

    /// The captured lines' text, for quick assertions and display.
    pub fn stdout_lines(&self) -> Vec<&str> {
        self.stdout.iter().map(|e| e.text.as_str()).collect()
    }

    /// The full reply as a JSON mapping.
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn reply_serializes_flat() {
        let mut variables = Map::new();
        variables.insert("name".into(), json!("test1"));
        let reply = ExecutionReply {
            result: json!(10),
            exception: None,
            stdout: vec![],
            variables,
        };
        assert_eq!(
            reply.to_value(),
            json!({"_exception": null, "_result": 10, "name": "test1", "_stdout": []})
        );
    }

    #[test]
    fn reply_deserializes_flat() {
        let reply: ExecutionReply = serde_json::from_value(json!({
            "_result": [1, 2],
            "_exception": {"scope": "vm", "message": "boom", "stack": null},
            "_stdout": [{"kind": "warn", "timestamp": "2024-01-01T00:00:00Z", "text": "hi"}],
            "x": 5
        }))
        .unwrap();
        assert_eq!(reply.result, json!([1, 2]));
        assert_eq!(reply.exception.as_ref().unwrap().scope, ExceptionScope::Vm);
        assert_eq!(reply.stdout[0].kind, LogKind::Warn);
        assert_eq!(reply.get("x"), Some(&json!(5)));
        assert!(!reply.succeeded());
        assert_eq!(reply.exit_code(), 1);
    }

    #[test]
    fn from_context_extracts_reserved_slots() {
        let context = json!({
            "_result": "ok",
            "_exception": null,
            "_stdout": ["ignored"],
            "keep": true
        });
        let reply = ExecutionReply::from_context(context.as_object().unwrap().clone());
        assert_eq!(reply.result, json!("ok"));
        assert!(reply.exception.is_none());
        assert!(reply.stdout.is_empty());
        assert_eq!(reply.variables.len(), 1);
    }

    #[test]
    fn malformed_exception_slot_becomes_vm_failure() {
        let info = ExceptionInfo::from_context_value(json!("custom failure")).unwrap();
        assert_eq!(info.scope, ExceptionScope::Vm);
        assert_eq!(info.message, "custom failure");

        let info = ExceptionInfo::from_context_value(json!(42)).unwrap();
        assert_eq!(info.message, "42");
    }

    #[test]
    fn engine_errors_split_message_and_stack() {
        let info = ExceptionInfo::transport_from_engine(
            "SyntaxError: Unexpected token '}'\n    at [sbx:execute]:3:1",
        );
        assert_eq!(info.scope, ExceptionScope::Transport);
        assert_eq!(info.message, "SyntaxError: Unexpected token '}'");
        assert!(info.stack.unwrap().contains("[sbx:execute]"));

        let info = ExceptionInfo::transport_from_engine("single line");
        assert!(info.stack.is_none());
    }

    #[test]
    fn log_kind_parses_console_methods() {
        assert_eq!(LogKind::from_method("warn"), LogKind::Warn);
        assert_eq!(LogKind::from_method("trace"), LogKind::Trace);
        assert_eq!(LogKind::from_method("debug"), LogKind::Log);
    }
}
