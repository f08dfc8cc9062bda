//! Source wrapper: turns raw untrusted source into the executable unit the
//! isolate runs.
//!
//! The body is enclosed in a function whose return value lands in `_result`.
//! A thenable result gets a settle chain that reassigns `_result` or fills
//! `_exception`; a synchronous throw is caught and also lands in
//! `_exception`. Both carry `{ scope: "vm", message, stack }`.

use std::sync::Arc;
use std::time::Duration;

use crate::error::SandboxError;
use crate::scanner::{ImportDecl, ImportExtractor, ModuleScanner, RegexScanner};

/// Options the wrapper (and any transform) sees.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WrapOptions {
    /// Strip line-anchored `import` declarations.
    pub parse_imports: bool,
    /// When true, stripped imports are dropped instead of re-emitted.
    pub lockdown: bool,
    /// Applied to Bluebird-style `.timeout(ms)` on a returned promise.
    pub timeout: Option<Duration>,
    /// Swap `console` for the capturing console before the body runs.
    pub capture_console: bool,
}

impl Default for WrapOptions {
    fn default() -> Self {
        Self {
            parse_imports: false,
            lockdown: true,
            timeout: None,
            capture_console: true,
        }
    }
}

/// What a [`SourceTransform`] is told about the unit it rewrites.
#[derive(Debug, Clone, Copy)]
pub struct TransformOptions<'a> {
    /// The wrap options.
    pub wrap: &'a WrapOptions,
    /// External module names collected so far.
    pub modules: &'a [String],
}

/// Pluggable source-to-source transform run on the fully wrapped unit.
///
/// An `Err` or an empty output fails the call with
/// [`SandboxError::Transform`] before any process is spawned.
pub trait SourceTransform: Send + Sync {
    /// Rewrite `wrapped`.
    fn transform(&self, wrapped: &str, options: &TransformOptions<'_>) -> anyhow::Result<String>;
}

impl<F> SourceTransform for F
where
    F: Fn(&str, &TransformOptions<'_>) -> anyhow::Result<String> + Send + Sync,
{
    fn transform(&self, wrapped: &str, options: &TransformOptions<'_>) -> anyhow::Result<String> {
        self(wrapped, options)
    }
}

/// The wrapper's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedSource {
    /// The executable unit.
    pub unit: String,
    /// External module binding names (imports and `x = require(...)`),
    /// deduplicated. Deleted from the reply.
    pub modules: Vec<String>,
    /// Specifiers the escape-hatch loader should preload. Empty under lockdown.
    pub requires: Vec<String>,
}

/// Wraps untrusted source. Scanners are swappable.
#[derive(Clone)]
pub struct SourceWrapper {
    scanner: Arc<dyn ModuleScanner>,
    imports: Arc<dyn ImportExtractor>,
}

impl Default for SourceWrapper {
    fn default() -> Self {
        Self::new(Arc::new(RegexScanner), Arc::new(RegexScanner))
    }
}

impl std::fmt::Debug for SourceWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceWrapper").finish_non_exhaustive()
    }
}

const DESCRIBE_ERROR: &str = r#"function (err) {
  try {
    var isObj = err !== null && (typeof err === "object" || typeof err === "function");
    var message = isObj && typeof err.message === "string" ? err.message : String(err);
    var stack = isObj && typeof err.stack === "string" ? err.stack : null;
    return { scope: "vm", message: message, stack: stack };
  } catch (_) {
    return { scope: "vm", message: "[unprintable error]", stack: null };
  }
}"#;

const CAPTURE_PRELUDE: &str =
    "if (typeof sbx === \"object\" && sbx !== null && sbx.console) { console = sbx.console; }\n";

impl SourceWrapper {
    /// A wrapper using the given scanners.
    pub fn new(scanner: Arc<dyn ModuleScanner>, imports: Arc<dyn ImportExtractor>) -> Self {
        Self { scanner, imports }
    }

    /// Wrap `source`, then run `transform` over the result if one is given.
    pub fn wrap(
        &self,
        source: &str,
        options: &WrapOptions,
        transform: Option<&dyn SourceTransform>,
    ) -> Result<WrappedSource, SandboxError> {
        let mut modules: Vec<String> = Vec::new();
        let mut requires: Vec<String> = Vec::new();
        let mut emitted: Vec<String> = Vec::new();

        let body = if options.parse_imports {
            let decls = self.imports.extract(source);
            for decl in &decls {
                push_unique(&mut modules, decl.bindings());
                if !options.lockdown {
                    emitted.push(decl.to_require());
                    push_unique(&mut requires, [decl.specifier.as_str()]);
                }
            }
            strip_declarations(source, &decls)
        } else {
            source.to_string()
        };

        push_unique(
            &mut modules,
            self.scanner.scan(&body).iter().map(|r| r.binding.as_str()),
        );
        if !options.lockdown {
            let specs = self.scanner.required_specifiers(&body);
            push_unique(&mut requires, specs.iter().map(String::as_str));
        }

        let mut unit = String::with_capacity(body.len() + 1024);
        if options.capture_console {
            unit.push_str(CAPTURE_PRELUDE);
        }
        unit.push_str("(function (__sbxDescribeError) {\n  try {\n");
        for stmt in &emitted {
            unit.push_str(stmt);
            unit.push('\n');
        }
        unit.push_str("    _result = (function () {\n");
        unit.push_str(&body);
        unit.push_str("\n    })();\n");
        unit.push_str(
            "    if (_result !== null && _result !== undefined && typeof _result.then === \"function\") {\n",
        );
        if let Some(timeout) = options.timeout {
            unit.push_str(&format!(
                "      if (typeof _result.timeout === \"function\") {{ _result = _result.timeout({}); }}\n",
                timeout.as_millis()
            ));
        }
        unit.push_str(
            "      _result.then(function (value) { _result = value; }, function (err) { _exception = __sbxDescribeError(err); });\n",
        );
        unit.push_str("    }\n  } catch (err) {\n    _exception = __sbxDescribeError(err);\n  }\n})(");
        unit.push_str(DESCRIBE_ERROR);
        unit.push_str(");\n");

        let unit = match transform {
            None => unit,
            Some(t) => {
                let view = TransformOptions {
                    wrap: options,
                    modules: &modules,
                };
                let out = t
                    .transform(&unit, &view)
                    .map_err(|e| SandboxError::Transform {
                        reason: format!("{e:#}"),
                    })?;
                if out.trim().is_empty() {
                    return Err(SandboxError::Transform {
                        reason: "transform returned no source".into(),
                    });
                }
                out
            }
        };

        Ok(WrappedSource {
            unit,
            modules,
            requires,
        })
    }
}

/// Blank out declaration spans, keeping line numbers stable.
fn strip_declarations(source: &str, decls: &[ImportDecl]) -> String {
    let mut out = String::with_capacity(source.len());
    let mut cursor = 0;
    for decl in decls {
        if decl.span.start < cursor || decl.span.end > source.len() {
            continue;
        }
        out.push_str(&source[cursor..decl.span.start]);
        let removed = &source[decl.span.clone()];
        out.extend(std::iter::repeat('\n').take(removed.matches('\n').count()));
        cursor = decl.span.end;
    }
    out.push_str(&source[cursor..]);
    out
}

fn push_unique<'a>(into: &mut Vec<String>, items: impl IntoIterator<Item = &'a str>) {
    for item in items {
        if !into.iter().any(|m| m == item) {
            into.push(item.to_string());
        }
    }
}
