//! Best-effort textual scanning for module references.
//!
//! These scanners are regex based and are **not** parsers: they miss
//! computed specifiers, destructured requires and imports split across
//! unusual syntax, and they will happily match inside strings or comments.
//! The wrapper only talks to them through [`ModuleScanner`] and
//! [`ImportExtractor`], so a real parser can replace them without touching
//! the core.

use std::ops::Range;
use std::sync::LazyLock;

use regex::Regex;

/// A `name = require("spec")` binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    /// The bound local name.
    pub binding: String,
    /// The module specifier.
    pub specifier: String,
}

/// Finds module loads in source text.
pub trait ModuleScanner: Send + Sync {
    /// Assignment-style loads, in source order.
    fn scan(&self, source: &str) -> Vec<ModuleRef>;

    /// Every literal `require("spec")` call site, deduplicated, in source order.
    fn required_specifiers(&self, source: &str) -> Vec<String>;
}

/// One `import` declaration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImportDecl {
    /// The module specifier.
    pub specifier: String,
    /// `import X from ...`
    pub default: Option<String>,
    /// `import * as X from ...`
    pub namespace: Option<String>,
    /// `import { a, b as c } from ...` as `(imported, local)` pairs.
    pub named: Vec<(String, String)>,
    /// Byte range of the whole declaration in the scanned source.
    pub span: Range<usize>,
}

impl ImportDecl {
    /// Local names this declaration binds.
    pub fn bindings(&self) -> Vec<&str> {
        let mut out = Vec::new();
        if let Some(d) = &self.default {
            out.push(d.as_str());
        }
        if let Some(n) = &self.namespace {
            out.push(n.as_str());
        }
        out.extend(self.named.iter().map(|(_, local)| local.as_str()));
        out
    }

    /// Whether this is a bare `import "spec"`.
    pub fn is_side_effect(&self) -> bool {
        self.default.is_none() && self.namespace.is_none() && self.named.is_empty()
    }

    /// Equivalent CommonJS statements.
    pub fn to_require(&self) -> String {
        let spec = serde_json::Value::String(self.specifier.clone()).to_string();
        if self.is_side_effect() {
            return format!("require({spec});");
        }
        let mut lines = Vec::new();
        for name in self.default.iter().chain(self.namespace.iter()) {
            lines.push(format!("var {name} = require({spec});"));
        }
        if !self.named.is_empty() {
            let fields: Vec<String> = self
                .named
                .iter()
                .map(|(imported, local)| {
                    if imported == local {
                        local.clone()
                    } else {
                        format!("{imported}: {local}")
                    }
                })
                .collect();
            lines.push(format!("var {{ {} }} = require({spec});", fields.join(", ")));
        }
        lines.join("\n")
    }
}

/// Finds line-anchored `import` declarations.
pub trait ImportExtractor: Send + Sync {
    /// Declarations in source order; spans do not overlap.
    fn extract(&self, source: &str) -> Vec<ImportDecl>;
}

static REQUIRE_BINDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_$][\w$]*)\s*=\s*require\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap()
});

static REQUIRE_CALL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"\brequire\(\s*['"]([^'"\n]+)['"]\s*\)"#).unwrap());

static IMPORT_FROM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*import\s+([^'";]+?)\s+from\s+['"]([^'"\n]+)['"][ \t]*;?[ \t]*(?:\r?\n|$)"#,
    )
    .unwrap()
});

static IMPORT_BARE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^[ \t]*import\s*['"]([^'"\n]+)['"][ \t]*;?[ \t]*(?:\r?\n|$)"#).unwrap()
});

static IDENT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Za-z_$][\w$]*$").unwrap());

/// Regex-backed [`ModuleScanner`] and [`ImportExtractor`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexScanner;

impl ModuleScanner for RegexScanner {
    fn scan(&self, source: &str) -> Vec<ModuleRef> {
        REQUIRE_BINDING
            .captures_iter(source)
            .map(|c| ModuleRef {
                binding: c[1].to_string(),
                specifier: c[2].to_string(),
            })
            .collect()
    }

    fn required_specifiers(&self, source: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for c in REQUIRE_CALL.captures_iter(source) {
            let spec = c[1].to_string();
            if !out.contains(&spec) {
                out.push(spec);
            }
        }
        out
    }
}

impl ImportExtractor for RegexScanner {
    fn extract(&self, source: &str) -> Vec<ImportDecl> {
        let mut decls: Vec<ImportDecl> = Vec::new();
        for c in IMPORT_FROM.captures_iter(source) {
            let Some(whole) = c.get(0) else { continue };
            if let Some(mut decl) = parse_clause(&c[1]) {
                decl.specifier = c[2].to_string();
                decl.span = whole.range();
                decls.push(decl);
            }
        }
        for c in IMPORT_BARE.captures_iter(source) {
            let Some(whole) = c.get(0) else { continue };
            decls.push(ImportDecl {
                specifier: c[1].to_string(),
                span: whole.range(),
                ..Default::default()
            });
        }
        decls.sort_by_key(|d| d.span.start);
        decls
    }
}

/// Parse the part between `import` and `from`.
fn parse_clause(clause: &str) -> Option<ImportDecl> {
    let clause = clause.trim();
    let mut decl = ImportDecl::default();

    let (head, rest) = match clause.find(['{', '*']) {
        Some(i) => (clause[..i].trim(), Some(clause[i..].trim())),
        None => (clause, None),
    };
    let head = head.trim_end_matches(',').trim();
    if !head.is_empty() {
        if !IDENT.is_match(head) {
            return None;
        }
        decl.default = Some(head.to_string());
    }

    match rest {
        None => {}
        Some(r) if r.starts_with('*') => {
            let name = r[1..].trim().strip_prefix("as")?.trim();
            if !IDENT.is_match(name) {
                return None;
            }
            decl.namespace = Some(name.to_string());
        }
        Some(r) => {
            let inner = r.strip_prefix('{')?.strip_suffix('}')?;
            for item in inner.split(',') {
                let item = item.trim();
                if item.is_empty() {
                    continue;
                }
                let mut parts = item.split_whitespace();
                let imported = parts.next()?;
                let local = match (parts.next(), parts.next()) {
                    (None, _) => imported,
                    (Some("as"), Some(alias)) => alias,
                    _ => return None,
                };
                if !IDENT.is_match(imported) || !IDENT.is_match(local) {
                    return None;
                }
                decl.named.push((imported.to_string(), local.to_string()));
            }
        }
    }

    (!decl.is_side_effect()).then_some(decl)
}
