//! `ModuleLoader` — source-to-instance: parse, security-scan, instantiate,
//! timestamp, optional file watcher.
//!
//! Two kinds of "source" are handled:
//!
//! - **Built-in templates** — the fixed helpers the evolution engine's
//!   Generate phase emits for most opportunity kinds (retry wrapper, TTL
//!   cache, arg-validating wrapper). These are registered directly as
//!   in-process `Module` impls; no compilation needed.
//! - **Freshly authored Rust source** — whatever a `TextGenerator` wrote
//!   for a `create_new_modules`/generic opportunity. This text is
//!   security-scanned with `syn`, then handed to a [`ModuleBuilder`] that
//!   compiles it to a cdylib and `dlopen`s it, binding a single well-known
//!   entry-point symbol.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use syn::visit::Visit;
use syn::{Expr, ExprCall, ExprPath, ExprUnsafe, Item, ItemUse};

use super::ffi::{ForeignModule, VTableFn};
use super::module_trait::Module;

const CURRENCY_THRESHOLD: Duration = Duration::from_secs(1);
const DEFAULT_LOAD_BUDGET: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("source file not found: {0}")]
    NotFound(PathBuf),
    #[error("syntax error while parsing module source: {0}")]
    Syntax(String),
    #[error("security scan rejected the module: {0}")]
    SecurityRejected(String),
    #[error("no module factory found in source")]
    NoFactory,
    #[error("failed to instantiate module: {0}")]
    Instantiate(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a security scan: hard failures vs advisory warnings — blocked
/// calls reject, disallowed imports only warn.
#[derive(Debug, Default, Clone)]
pub struct ScanReport {
    pub rejected: Vec<String>,
    pub warnings: Vec<String>,
}

impl ScanReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

/// Names that must never appear as a called function — the Rust analogue
/// of the original's `eval`/`exec`/`compile`/reflective-import blocklist.
fn blocked_calls() -> &'static HashSet<&'static str> {
    use std::sync::OnceLock;
    static BLOCKED: OnceLock<HashSet<&'static str>> = OnceLock::new();
    BLOCKED.get_or_init(|| {
        [
            "transmute",
            "transmute_copy",
            "exec",
            "set_var",
            "remove_var",
            "dlopen",
        ]
        .into_iter()
        .collect()
    })
}

/// Crate roots a generated module is allowed to import — standard-library
/// and the small set of ecosystem crates the core itself depends on.
fn allowed_crates() -> &'static HashSet<&'static str> {
    use std::sync::OnceLock;
    static ALLOWED: OnceLock<HashSet<&'static str>> = OnceLock::new();
    ALLOWED.get_or_init(|| {
        [
            "std", "core", "alloc", "serde", "serde_json", "async_trait", "tracing", "chrono",
            "regex",
        ]
        .into_iter()
        .collect()
    })
}

struct SecurityVisitor {
    report: ScanReport,
}

impl<'ast> Visit<'ast> for SecurityVisitor {
    fn visit_expr_unsafe(&mut self, node: &'ast ExprUnsafe) {
        self.report
            .rejected
            .push("unsafe block is not permitted in generated modules".to_string());
        syn::visit::visit_expr_unsafe(self, node);
    }

    fn visit_expr_call(&mut self, node: &'ast ExprCall) {
        if let Expr::Path(ExprPath { path, .. }) = node.func.as_ref() {
            if let Some(last) = path.segments.last() {
                let ident = last.ident.to_string();
                if blocked_calls().contains(ident.as_str()) {
                    self.report
                        .rejected
                        .push(format!("blocked function call: {ident}"));
                }
                if path.segments.iter().any(|s| s.ident == "Command")
                    && ident == "new"
                    && path.to_token_stream_contains("process")
                {
                    self.report
                        .rejected
                        .push("process spawning is not permitted".to_string());
                }
            }
        }
        syn::visit::visit_expr_call(self, node);
    }

    fn visit_item_use(&mut self, node: &'ast ItemUse) {
        let root = use_tree_root(&node.tree);
        if let Some(root) = root {
            if !allowed_crates().contains(root.as_str()) {
                self.report
                    .warnings
                    .push(format!("potentially unsafe import: {root}"));
            }
        }
        syn::visit::visit_item_use(self, node);
    }
}

trait ContainsSegment {
    fn to_token_stream_contains(&self, segment: &str) -> bool;
}

impl ContainsSegment for syn::Path {
    fn to_token_stream_contains(&self, segment: &str) -> bool {
        self.segments.iter().any(|s| s.ident == segment)
    }
}

fn use_tree_root(tree: &syn::UseTree) -> Option<String> {
    match tree {
        syn::UseTree::Path(p) => Some(p.ident.to_string()),
        syn::UseTree::Name(n) => Some(n.ident.to_string()),
        syn::UseTree::Glob(_) | syn::UseTree::Rename(_) | syn::UseTree::Group(_) => None,
    }
}

/// Parses and security-scans a candidate module's Rust source. Returns the
/// scan report on success (callers decide whether warnings block
/// integration); a hard syntax or "rejected" failure returns `LoadError`.
pub fn scan_source(source: &str) -> Result<ScanReport, LoadError> {
    let file = syn::parse_file(source).map_err(|e| LoadError::Syntax(e.to_string()))?;

    let mut visitor = SecurityVisitor {
        report: ScanReport::default(),
    };
    for item in &file.items {
        visitor.visit_item(item);
    }

    if !structure_has_factory(&file) {
        visitor
            .report
            .warnings
            .push("no module factory/entry-point function found".to_string());
    }

    if !visitor.report.rejected.is_empty() {
        return Err(LoadError::SecurityRejected(visitor.report.rejected.join("; ")));
    }

    Ok(visitor.report)
}

/// Structure check: at least one function or struct
/// declared; warn (not reject) if nothing looks like an entry point.
fn structure_has_factory(file: &syn::File) -> bool {
    file.items.iter().any(|item| match item {
        Item::Fn(f) => {
            let name = f.sig.ident.to_string();
            name == "create_module" || name.ends_with("_commands") || name == "get_commands"
        }
        Item::Struct(s) => {
            let name = s.ident.to_string();
            name.ends_with("Commands") || name.ends_with("Module")
        }
        _ => false,
    })
}

/// Compiles a security-scanned source file into a loadable artifact and
/// resolves the well-known entry-point symbol. Abstracted behind a trait
/// so tests can substitute an in-process double instead of shelling out to
/// `cargo`/`rustc`.
pub trait ModuleBuilder: Send + Sync {
    /// Builds `source` (already scanned) under `workdir`, returning a
    /// module ready for registration.
    fn build(&self, name: &str, source: &str, workdir: &Path) -> Result<Arc<dyn Module>, LoadError>;
}

/// Real builder: writes `source` into a throwaway cdylib crate, invokes
/// `cargo build --release`, then `dlopen`s the artifact and resolves its
/// `extern "C" fn ellma_module_vtable() -> *const ModuleVTable` symbol.
///
/// The compiled artifact is not linked into this process until `dlopen`
/// is called, keeping generated code out of the address space until it
/// has passed every earlier gate.
pub struct CargoModuleBuilder;

impl ModuleBuilder for CargoModuleBuilder {
    fn build(&self, name: &str, source: &str, workdir: &Path) -> Result<Arc<dyn Module>, LoadError> {
        let crate_dir = workdir.join(name);
        std::fs::create_dir_all(crate_dir.join("src"))?;
        std::fs::write(crate_dir.join("src").join("lib.rs"), source)?;
        std::fs::write(
            crate_dir.join("Cargo.toml"),
            format!(
                "[package]\nname = \"{name}\"\nversion = \"0.0.0\"\nedition = \"2021\"\n\n\
                 [lib]\ncrate-type = [\"cdylib\"]\n\n\
                 [dependencies]\n\
                 serde = {{ version = \"1.0\", features = [\"derive\"] }}\n\
                 serde_json = \"1.0\"\n\
                 async-trait = \"0.1.89\"\n\
                 tracing = \"0.1\"\n\
                 chrono = {{ version = \"0.4\", default-features = false, features = [\"serde\", \"clock\"] }}\n\
                 regex = \"1\"\n"
            ),
        )?;

        let status = std::process::Command::new("cargo")
            .args(["build", "--release", "--manifest-path"])
            .arg(crate_dir.join("Cargo.toml"))
            .status()
            .map_err(|e| LoadError::Instantiate(e.to_string()))?;
        if !status.success() {
            return Err(LoadError::Instantiate(format!(
                "cargo build failed for generated module {name}"
            )));
        }

        let artifact = workdir
            .join("target")
            .join("release")
            .join(libloading::library_filename(name));

        load_symbol(&artifact)
    }
}

/// Binds the `ellma_module_vtable` symbol from a compiled artifact. Kept
/// separate from `CargoModuleBuilder::build` so `unsafe` stays in one
/// small, auditable place.
fn load_symbol(artifact: &Path) -> Result<Arc<dyn Module>, LoadError> {
    // SAFETY: the compiled artifact came from source that passed
    // `scan_source` and was built by our own `CargoModuleBuilder`; the
    // symbol contract (`ellma_module_vtable`) is part of this crate's
    // module-authoring convention, and the returned pointer is assumed to
    // stay valid for the lifetime of the loaded library.
    unsafe {
        let lib = Arc::new(
            libloading::Library::new(artifact).map_err(|e| LoadError::Instantiate(e.to_string()))?,
        );
        let ctor: libloading::Symbol<VTableFn> = lib
            .get(b"ellma_module_vtable")
            .map_err(|_| LoadError::NoFactory)?;
        let raw = ctor();
        if raw.is_null() {
            return Err(LoadError::Instantiate("factory returned a null vtable".into()));
        }
        let vtable: &'static _ = &*raw;
        let module = ForeignModule::new(vtable, lib.clone())
            .map_err(LoadError::Instantiate)?;
        Ok(Arc::new(module))
    }
}

/// In-memory double for tests: registers a pre-built closure-based module
/// instead of compiling anything.
pub struct InProcessModuleBuilder<F>(pub F)
where
    F: Fn(&str) -> Arc<dyn Module> + Send + Sync;

impl<F> ModuleBuilder for InProcessModuleBuilder<F>
where
    F: Fn(&str) -> Arc<dyn Module> + Send + Sync,
{
    fn build(&self, name: &str, _source: &str, _workdir: &Path) -> Result<Arc<dyn Module>, LoadError> {
        Ok((self.0)(name))
    }
}

/// Tracks known module sources for the currency check and optional
/// polling file watcher.
pub struct ModuleLoader {
    builder: Arc<dyn ModuleBuilder>,
    workdir: PathBuf,
    load_budget: Duration,
    known: tokio::sync::Mutex<std::collections::HashMap<String, (PathBuf, SystemTime)>>,
}

impl ModuleLoader {
    pub fn new(builder: Arc<dyn ModuleBuilder>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            builder,
            workdir: workdir.into(),
            load_budget: DEFAULT_LOAD_BUDGET,
            known: tokio::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Loads `source` as module `name` from `path`. If a module with the
    /// same name was already loaded from a source whose mtime is within
    /// one second of the stored timestamp, the load is skipped.
    pub async fn load(
        &self,
        name: &str,
        path: &Path,
        source: &str,
        mtime: SystemTime,
    ) -> Result<Option<Arc<dyn Module>>, LoadError> {
        {
            let known = self.known.lock().await;
            if let Some((known_path, known_mtime)) = known.get(name) {
                if known_path == path && within_currency_threshold(*known_mtime, mtime) {
                    return Ok(None);
                }
            }
        }

        let start = std::time::Instant::now();
        let report = scan_source(source)?;
        for warning in &report.warnings {
            tracing::warn!(module = name, warning, "module load warning");
        }

        let module = self.builder.build(name, source, &self.workdir)?;

        if start.elapsed() > self.load_budget {
            tracing::warn!(
                module = name,
                elapsed = ?start.elapsed(),
                budget = ?self.load_budget,
                "module load exceeded budget"
            );
        }

        self.known
            .lock()
            .await
            .insert(name.to_string(), (path.to_path_buf(), mtime));
        Ok(Some(module))
    }

    pub async fn forget(&self, name: &str) {
        self.known.lock().await.remove(name);
    }

    pub async fn known_sources(&self) -> Vec<(String, PathBuf, SystemTime)> {
        self.known
            .lock()
            .await
            .iter()
            .map(|(name, (path, ts))| (name.clone(), path.clone(), *ts))
            .collect()
    }
}

fn within_currency_threshold(a: SystemTime, b: SystemTime) -> bool {
    let diff = match a.duration_since(b) {
        Ok(d) => d,
        Err(e) => e.duration(),
    };
    diff <= CURRENCY_THRESHOLD
}
