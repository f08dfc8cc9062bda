//! Escape-hatch module loader.
//!
//! When lockdown is off, the isolate gets a `require` function. The isolate
//! has no file system access of its own, so every module it may load is read
//! here up front: the requested specifiers are resolved against the configured
//! module roots, their own `require("...")` call sites are followed breadth
//! first, and the whole set is handed to the isolate as CommonJS factories.
//! `require` of anything outside the preloaded set throws
//! `Cannot find module '<spec>'`.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use deno_core::JsRuntime;
use serde::Deserialize;
use thiserror::Error;

use crate::scanner::{ModuleScanner, RegexScanner};

/// Default bound on the number of modules preloaded for one execution.
pub const DEFAULT_MAX_MODULES: usize = 256;

/// Errors raised while reading resolved modules.
#[derive(Debug, Error)]
pub enum ModuleError {
    /// A resolved file could not be read.
    #[error("failed to read module {path}: {source}")]
    Read {
        /// The module path.
        path: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A `.json` module did not parse.
    #[error("module {path} is not valid JSON: {source}")]
    Json {
        /// The module path.
        path: String,
        /// The parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// How a module's source is evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    /// CommonJS source.
    Script,
    /// A JSON document exported as is.
    Json,
}

/// One module read from disk.
#[derive(Debug, Clone)]
pub struct LoadedModule {
    /// Canonical path, also the module's cache key.
    pub path: PathBuf,
    /// How it is evaluated.
    pub kind: ModuleKind,
    /// The file contents.
    pub source: String,
    /// `require` specifier → canonical path, for the specifiers that resolved.
    pub deps: BTreeMap<String, String>,
}

/// Everything the isolate's `require` can reach.
#[derive(Debug, Clone, Default)]
pub struct ModuleSet {
    /// Top-level specifier → canonical path.
    pub roots: BTreeMap<String, String>,
    /// Loaded modules, in breadth-first order.
    pub modules: Vec<LoadedModule>,
}

impl ModuleSet {
    /// Register every module with the isolate and define the global `require`.
    pub(crate) fn install(&self, runtime: &mut JsRuntime) -> anyhow::Result<()> {
        for module in &self.modules {
            let path = js_string(&module.path.to_string_lossy());
            let dirname = js_string(
                &module
                    .path
                    .parent()
                    .map(|p| p.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            );
            let script = match module.kind {
                ModuleKind::Json => format!(
                    "__sbx_internal.defineJsonModule({path}, {dirname}, JSON.parse({}));",
                    js_string(&module.source)
                ),
                ModuleKind::Script => format!(
                    "__sbx_internal.defineModule({path}, {dirname}, JSON.parse({}), \
                     function (exports, require, module, __filename, __dirname) {{\n{}\n}});",
                    js_string(&serde_json::to_string(&module.deps)?),
                    strip_shebang(&module.source)
                ),
            };
            runtime
                .execute_script("[sbx:module]", script)
                .map_err(|e| anyhow::anyhow!("failed to define module {path}: {e}"))?;
        }
        let roots = js_string(&serde_json::to_string(&self.roots)?);
        runtime
            .execute_script(
                "[sbx:require]",
                format!("__sbx_internal.installRequire(JSON.parse({roots}));"),
            )
            .map_err(|e| anyhow::anyhow!("failed to install require: {e}"))?;
        Ok(())
    }
}

/// Resolves and reads modules from a fixed set of roots.
#[derive(Debug, Clone)]
pub struct ModuleLoader {
    roots: Vec<PathBuf>,
    max_modules: usize,
}

#[derive(Deserialize)]
struct PackageJson {
    main: Option<String>,
}

impl ModuleLoader {
    /// A loader over `roots`. Roots that do not exist are ignored.
    pub fn new(roots: &[PathBuf], max_modules: usize) -> Self {
        let roots = roots
            .iter()
            .filter_map(|r| match r.canonicalize() {
                Ok(p) => Some(p),
                Err(e) => {
                    tracing::debug!(root = %r.display(), error = %e, "skipping module root");
                    None
                }
            })
            .collect();
        Self { roots, max_modules }
    }

    /// Resolve `specifier`, relative to `from` (a module's directory) when given.
    ///
    /// Only paths inside a root are returned.
    pub fn resolve(&self, specifier: &str, from: Option<&Path>) -> Option<PathBuf> {
        if specifier.is_empty() || Path::new(specifier).is_absolute() {
            return None;
        }
        let relative = specifier == "."
            || specifier == ".."
            || specifier.starts_with("./")
            || specifier.starts_with("../");

        let bases: Vec<PathBuf> = if relative {
            match from {
                Some(dir) => vec![dir.to_path_buf()],
                None => self.roots.clone(),
            }
        } else {
            let mut dirs = Vec::new();
            if let Some(dir) = from {
                for ancestor in dir.ancestors() {
                    if !self.within_roots(ancestor) {
                        break;
                    }
                    dirs.push(ancestor.join("node_modules"));
                }
            }
            dirs.extend(self.roots.iter().cloned());
            dirs
        };

        bases
            .iter()
            .filter_map(|base| resolve_candidate(&base.join(specifier)))
            .filter_map(|p| p.canonicalize().ok())
            .find(|p| self.within_roots(p))
    }

    /// Resolve `specifiers` and everything they transitively require.
    ///
    /// Specifiers that do not resolve are skipped; `require` of them fails
    /// lazily inside the isolate.
    pub fn load(&self, specifiers: &[String]) -> Result<ModuleSet, ModuleError> {
        let mut set = ModuleSet::default();
        let mut queue: VecDeque<PathBuf> = VecDeque::new();
        let mut seen: HashSet<PathBuf> = HashSet::new();

        for spec in specifiers {
            match self.resolve(spec, None) {
                Some(path) => {
                    set.roots
                        .insert(spec.clone(), path.to_string_lossy().into_owned());
                    if seen.insert(path.clone()) {
                        queue.push_back(path);
                    }
                }
                None => tracing::debug!(specifier = %spec, "module not found in any root"),
            }
        }

        while let Some(path) = queue.pop_front() {
            if set.modules.len() >= self.max_modules {
                tracing::warn!(
                    max_modules = self.max_modules,
                    "module limit reached, remaining modules are not preloaded"
                );
                break;
            }
            let source = std::fs::read_to_string(&path).map_err(|source| ModuleError::Read {
                path: path.display().to_string(),
                source,
            })?;

            let kind = if path.extension().is_some_and(|e| e == "json") {
                serde_json::from_str::<serde_json::Value>(&source).map_err(|source| {
                    ModuleError::Json {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
                ModuleKind::Json
            } else {
                ModuleKind::Script
            };

            let mut deps = BTreeMap::new();
            if kind == ModuleKind::Script {
                let dir = path.parent().map(Path::to_path_buf);
                for spec in RegexScanner.required_specifiers(&source) {
                    if let Some(dep) = self.resolve(&spec, dir.as_deref()) {
                        deps.insert(spec, dep.to_string_lossy().into_owned());
                        if seen.insert(dep.clone()) {
                            queue.push_back(dep);
                        }
                    }
                }
            }

            tracing::debug!(path = %path.display(), deps = deps.len(), "module preloaded");
            set.modules.push(LoadedModule {
                path,
                kind,
                source,
                deps,
            });
        }

        Ok(set)
    }

    fn within_roots(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| path.starts_with(root))
    }
}

/// `x`, `x.js`, `x.json`, then `x/` as a package directory.
fn resolve_candidate(candidate: &Path) -> Option<PathBuf> {
    resolve_file(candidate).or_else(|| resolve_directory(candidate))
}

fn resolve_file(candidate: &Path) -> Option<PathBuf> {
    if candidate.is_file() {
        return Some(candidate.to_path_buf());
    }
    ["js", "json"].iter().find_map(|ext| {
        let mut name = candidate.as_os_str().to_os_string();
        name.push(".");
        name.push(ext);
        let path = PathBuf::from(name);
        path.is_file().then_some(path)
    })
}

fn resolve_directory(dir: &Path) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }
    let main = std::fs::read_to_string(dir.join("package.json"))
        .ok()
        .and_then(|text| serde_json::from_str::<PackageJson>(&text).ok())
        .and_then(|pkg| pkg.main);
    if let Some(main) = main {
        let target = dir.join(main);
        if let Some(found) = resolve_file(&target).or_else(|| index_of(&target)) {
            return Some(found);
        }
    }
    index_of(dir)
}

fn index_of(dir: &Path) -> Option<PathBuf> {
    ["index.js", "index.json"]
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.is_file())
}

fn strip_shebang(source: &str) -> String {
    if source.starts_with("#!") {
        format!("//{}", &source[2..])
    } else {
        source.to_string()
    }
}

fn js_string(text: &str) -> String {
    serde_json::Value::String(text.to_string()).to_string()
}
