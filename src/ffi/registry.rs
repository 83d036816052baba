//! FFI Registry
//!
//! Central registry for native libraries and the functions declared on them.
//! Tracks declarations, resolves and loads them in dependency order, and runs
//! calls through cached call shapes.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::BindingsConfig;

use super::error::{FfiError, FfiResult};
use super::lease::{LeaseCounters, LeaseSet};
use super::loader::{NativeLoader, NativeModule, SystemLoader};
use super::marshal::{decode_return, from_native, to_native, NativeImage};
use super::platform::{platform_specific_name, Bitness, Platform};
use super::shape::{CallShape, ShapeCache};
use super::source::{
    AcquireRequest, CancellationToken, LibrarySource, ProgressSink, SearchPathSource,
};
use super::types::{CallingConvention, FunctionSignature, Value};

/// A library another library needs loaded first
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub name: String,
    /// Exact version required, if any
    pub version: Option<String>,
}

impl Dependency {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn versioned(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: Some(version.into()),
        }
    }
}

/// How a logical name becomes a file name
#[derive(Clone, Default)]
pub enum NameRule {
    /// `name.dll`, `libname.so`, `libname.dylib`, `libname.a`
    #[default]
    Conventional,
    /// The logical name is already the file name
    Verbatim,
    Custom(Arc<dyn Fn(&str, Platform) -> String + Send + Sync>),
}

impl NameRule {
    pub fn apply(&self, name: &str, platform: Platform) -> String {
        match self {
            NameRule::Conventional => platform_specific_name(name, platform),
            NameRule::Verbatim => name.to_string(),
            NameRule::Custom(rule) => rule(name, platform),
        }
    }
}

impl fmt::Debug for NameRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameRule::Conventional => f.write_str("Conventional"),
            NameRule::Verbatim => f.write_str("Verbatim"),
            NameRule::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Predicate deciding at load time whether a library applies
pub type LoadCondition = Arc<dyn Fn() -> bool + Send + Sync>;

/// A native function as declared by the host
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDeclaration {
    /// Owning library, by name
    pub library: String,
    /// Native symbol name
    pub name: String,
    /// Name callers use, when different from the symbol
    pub alias: Option<String>,
    pub signature: FunctionSignature,
    pub convention: CallingConvention,
}

impl FunctionDeclaration {
    pub fn new(name: impl Into<String>, signature: FunctionSignature) -> Self {
        Self {
            library: String::new(),
            name: name.into(),
            alias: None,
            signature,
            convention: CallingConvention::default(),
        }
    }

    /// Declare from a C-style prototype such as `"int add(int, int)"`
    pub fn parse(decl: &str) -> FfiResult<Self> {
        let (name, signature) = FunctionSignature::parse_decl(decl)?;
        Ok(Self::new(name, signature))
    }

    pub fn with_alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn with_convention(mut self, convention: CallingConvention) -> Self {
        self.convention = convention;
        self
    }

    /// The name callers invoke this function by
    pub fn calling_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

/// A library as declared by the host; nothing is loaded until asked
#[derive(Clone, Default)]
pub struct LibraryDeclaration {
    pub name: String,
    pub version: Option<String>,
    /// Restrict to one platform; `None` applies everywhere
    pub platform: Option<Platform>,
    /// Restrict to one bitness; `None` applies to both
    pub bitness: Option<Bitness>,
    /// Explicit file, or directory holding the platform file
    pub path: Option<PathBuf>,
    pub sources: Vec<Arc<dyn LibrarySource>>,
    pub dependencies: Vec<Dependency>,
    pub condition: Option<LoadCondition>,
    pub naming: NameRule,
    pub functions: Vec<FunctionDeclaration>,
}

impl LibraryDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn for_platform(mut self, platform: Platform) -> Self {
        self.platform = Some(platform);
        self
    }

    pub fn for_bitness(mut self, bitness: Bitness) -> Self {
        self.bitness = Some(bitness);
        self
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_source(mut self, source: Arc<dyn LibrarySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_condition(mut self, condition: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn with_naming(mut self, naming: NameRule) -> Self {
        self.naming = naming;
        self
    }

    pub fn with_function(mut self, function: FunctionDeclaration) -> Self {
        self.functions.push(function);
        self
    }

    fn applies_to(&self, platform: Platform, bitness: Bitness) -> bool {
        self.platform.map_or(true, |p| p == platform) && self.bitness.map_or(true, |b| b == bitness)
    }
}

impl fmt::Debug for LibraryDeclaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryDeclaration")
            .field("name", &self.name)
            .field("version", &self.version)
            .field("platform", &self.platform)
            .field("bitness", &self.bitness)
            .field("path", &self.path)
            .field("dependencies", &self.dependencies)
            .field("naming", &self.naming)
            .field("functions", &self.functions.len())
            .finish()
    }
}

/// One resolved, loaded native module
pub struct LibraryHandle {
    name: String,
    path: PathBuf,
    version: Option<String>,
    dependencies: Vec<Dependency>,
    module: Arc<dyn NativeModule>,
}

impl LibraryHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Address of an exported symbol
    pub fn symbol(&self, name: &str) -> FfiResult<usize> {
        self.module.symbol(name)
    }
}

impl fmt::Debug for LibraryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LibraryHandle")
            .field("name", &self.name)
            .field("path", &self.path)
            .field("version", &self.version)
            .finish()
    }
}

/// Result of asking for a library to be loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    /// A native load was performed
    Loaded,
    /// Was loaded before this request
    AlreadyLoaded,
    /// Resolved to a path another declaration had already loaded
    Shared,
    /// Load condition evaluated false
    Skipped,
}

/// Per-library result of [`LibraryRegistry::load_all`]
#[derive(Debug)]
pub struct LoadOutcome {
    pub name: String,
    pub result: FfiResult<LoadStatus>,
}

/// Callback for aggregate load progress: (library, completed, total)
pub type LibraryProgress = Arc<dyn Fn(&str, usize, usize) + Send + Sync>;

/// Options passed through to acquisition
#[derive(Clone, Default)]
pub struct LoadOptions {
    /// Fraction-complete sink handed to sources untouched
    pub progress: Option<ProgressSink>,
    pub cancel: CancellationToken,
    /// Called as each library finishes during `load_all`
    pub on_library: Option<LibraryProgress>,
}

/// Snapshot of registry counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    pub native_loads: usize,
    pub shapes_cached: usize,
    pub shapes_built: usize,
    pub leases_allocated: usize,
    pub leases_released: usize,
}

struct LibraryEntry {
    decl: LibraryDeclaration,
    /// Keyed by calling name
    functions: HashMap<String, Arc<FunctionDeclaration>>,
    handle: Option<Arc<LibraryHandle>>,
}

#[derive(Default)]
struct RegistryState {
    entries: Vec<LibraryEntry>,
    modules: HashMap<PathBuf, Arc<dyn NativeModule>>,
}

impl RegistryState {
    fn find(
        &self,
        name: &str,
        version: Option<&str>,
        platform: Platform,
        bitness: Bitness,
    ) -> Option<usize> {
        self.entries.iter().position(|e| {
            e.decl.name == name
                && e.decl.applies_to(platform, bitness)
                && version.map_or(true, |v| e.decl.version.as_deref() == Some(v))
        })
    }

    fn loaded(&self, name: &str) -> Option<&LibraryEntry> {
        self.entries
            .iter()
            .find(|e| e.decl.name == name && e.handle.is_some())
    }
}

/// FFI Registry - owns every library handle and the call shape cache
pub struct LibraryRegistry {
    state: RwLock<RegistryState>,
    /// Serializes load and unload sequences
    load_lock: Mutex<()>,
    shapes: ShapeCache,
    loader: Arc<dyn NativeLoader>,
    sources: Vec<Arc<dyn LibrarySource>>,
    leases: Arc<LeaseCounters>,
    native_loads: AtomicUsize,
}

impl LibraryRegistry {
    /// Create a registry using the system loader and default search paths
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            load_lock: Mutex::new(()),
            shapes: ShapeCache::new(),
            loader: Arc::new(SystemLoader),
            sources: vec![Arc::new(SearchPathSource::system())],
            leases: Arc::new(LeaseCounters::default()),
            native_loads: AtomicUsize::new(0),
        }
    }

    /// Replace the native loader
    pub fn with_loader(mut self, loader: Arc<dyn NativeLoader>) -> Self {
        self.loader = loader;
        self
    }

    /// Replace the fallback sources consulted after a declaration's own
    pub fn with_sources(mut self, sources: Vec<Arc<dyn LibrarySource>>) -> Self {
        self.sources = sources;
        self
    }

    /// Add a fallback search directory
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.sources
            .push(Arc::new(SearchPathSource::new(vec![path.as_ref().to_path_buf()])));
    }

    /// Add the search paths and library declarations from a configuration
    pub fn apply_config(&mut self, config: &BindingsConfig) -> FfiResult<()> {
        let decls = config.declarations()?;
        for path in &config.search.paths {
            self.add_search_path(path);
        }
        for decl in decls {
            self.declare(decl);
        }
        Ok(())
    }

    // =========================================================================
    // Declaration
    // =========================================================================

    /// Register a library definition. Does not load it.
    pub fn declare(&self, decl: LibraryDeclaration) {
        let functions = decl
            .functions
            .iter()
            .map(|f| {
                let mut f = f.clone();
                f.library = decl.name.clone();
                (f.calling_name().to_string(), Arc::new(f))
            })
            .collect();
        debug!(
            "declared library '{}' with {} functions",
            decl.name,
            decl.functions.len()
        );
        self.state.write().entries.push(LibraryEntry {
            decl,
            functions,
            handle: None,
        });
    }

    /// Add a function to every declaration of `library`
    pub fn declare_function(&self, library: &str, function: FunctionDeclaration) -> FfiResult<()> {
        let mut state = self.state.write();
        let mut found = false;
        for entry in state.entries.iter_mut().filter(|e| e.decl.name == library) {
            let mut f = function.clone();
            f.library = library.to_string();
            entry.decl.functions.push(f.clone());
            entry
                .functions
                .insert(f.calling_name().to_string(), Arc::new(f));
            found = true;
        }
        if found {
            Ok(())
        } else {
            Err(FfiError::missing_library(library, "not declared"))
        }
    }

    // =========================================================================
    // Resolution and loading
    // =========================================================================

    /// Find the file for a declared library without loading it
    pub fn resolve(&self, name: &str, platform: Platform, bitness: Bitness) -> FfiResult<PathBuf> {
        let decl = {
            let state = self.state.read();
            let idx = state
                .find(name, None, platform, bitness)
                .ok_or_else(|| FfiError::missing_library(name, "not declared"))?;
            state.entries[idx].decl.clone()
        };
        self.resolve_decl(&decl, platform, bitness, &LoadOptions::default())
    }

    fn resolve_decl(
        &self,
        decl: &LibraryDeclaration,
        platform: Platform,
        bitness: Bitness,
        options: &LoadOptions,
    ) -> FfiResult<PathBuf> {
        let file_name = decl.naming.apply(&decl.name, platform);

        if let Some(path) = &decl.path {
            let candidate = if path.is_dir() {
                path.join(&file_name)
            } else {
                path.clone()
            };
            return if candidate.is_file() {
                Ok(candidate)
            } else {
                Err(FfiError::missing_library(
                    &decl.name,
                    format!("{} does not exist", candidate.display()),
                ))
            };
        }

        let request = AcquireRequest {
            name: &decl.name,
            file_name: &file_name,
            version: decl.version.as_deref(),
            platform,
            bitness,
            progress: options.progress.as_ref(),
            cancel: &options.cancel,
        };

        let mut reasons = Vec::new();
        for source in decl.sources.iter().chain(&self.sources) {
            match source.acquire(&request) {
                Ok(path) => return Ok(path),
                Err(FfiError::MissingLibrary { reason, .. }) => reasons.push(reason),
                Err(e) => return Err(e),
            }
        }
        Err(FfiError::missing_library(
            &decl.name,
            if reasons.is_empty() {
                format!("no source for '{}'", file_name)
            } else {
                reasons.join("; ")
            },
        ))
    }

    /// Load a declared library and its dependencies. Idempotent.
    pub fn load(
        &self,
        name: &str,
        platform: Platform,
        bitness: Bitness,
        options: &LoadOptions,
    ) -> FfiResult<LoadStatus> {
        let _guard = self.load_lock.lock();
        let idx = self
            .state
            .read()
            .find(name, None, platform, bitness)
            .ok_or_else(|| FfiError::missing_library(name, "not declared for this platform"))?;
        self.load_entry(idx, platform, bitness, options, &mut Vec::new())
    }

    /// Load every declaration that applies to the target
    pub fn load_all(
        &self,
        platform: Platform,
        bitness: Bitness,
        options: &LoadOptions,
    ) -> Vec<LoadOutcome> {
        let _guard = self.load_lock.lock();
        let targets: Vec<(usize, String)> = self
            .state
            .read()
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.decl.applies_to(platform, bitness))
            .map(|(i, e)| (i, e.decl.name.clone()))
            .collect();

        let total = targets.len();
        targets
            .into_iter()
            .enumerate()
            .map(|(done, (idx, name))| {
                let result = self.load_entry(idx, platform, bitness, options, &mut Vec::new());
                if let Err(e) = &result {
                    warn!("failed to load '{}': {}", name, e);
                }
                if let Some(on_library) = &options.on_library {
                    on_library(&name, done + 1, total);
                }
                LoadOutcome { name, result }
            })
            .collect()
    }

    fn load_entry(
        &self,
        idx: usize,
        platform: Platform,
        bitness: Bitness,
        options: &LoadOptions,
        visiting: &mut Vec<usize>,
    ) -> FfiResult<LoadStatus> {
        let decl = {
            let state = self.state.read();
            let entry = &state.entries[idx];
            if entry.handle.is_some() {
                return Ok(LoadStatus::AlreadyLoaded);
            }
            entry.decl.clone()
        };

        if let Some(condition) = &decl.condition {
            if !condition() {
                info!("skipping '{}': load condition is false", decl.name);
                return Ok(LoadStatus::Skipped);
            }
        }

        if visiting.contains(&idx) {
            return Err(FfiError::missing_library(&decl.name, "dependency cycle"));
        }
        visiting.push(idx);

        for dep in &decl.dependencies {
            let dep_idx = self
                .state
                .read()
                .find(&dep.name, dep.version.as_deref(), platform, bitness)
                .ok_or_else(|| {
                    FfiError::missing_library(
                        &decl.name,
                        match &dep.version {
                            Some(v) => format!("dependency '{}' version {} not declared", dep.name, v),
                            None => format!("dependency '{}' not declared", dep.name),
                        },
                    )
                })?;
            self.load_entry(dep_idx, platform, bitness, options, visiting)?;
        }
        visiting.pop();

        // Different spellings of one file must share a native handle
        let resolved = self.resolve_decl(&decl, platform, bitness, options)?;
        let path = std::fs::canonicalize(&resolved).unwrap_or(resolved);

        let existing = self.state.read().modules.get(&path).cloned();
        let (module, status) = match existing {
            Some(module) => {
                debug!(
                    "'{}' shares already loaded {}",
                    decl.name,
                    path.display()
                );
                (module, LoadStatus::Shared)
            }
            None => {
                // Library initializers run here; keep lookups unblocked
                let module = self.loader.open(&path)?;
                self.native_loads.fetch_add(1, Ordering::Relaxed);
                info!("loaded library '{}' from {}", decl.name, path.display());
                (module, LoadStatus::Loaded)
            }
        };

        let mut state = self.state.write();
        let module = Arc::clone(
            state
                .modules
                .entry(path.clone())
                .or_insert_with(|| Arc::clone(&module)),
        );
        state.entries[idx].handle = Some(Arc::new(LibraryHandle {
            name: decl.name.clone(),
            path,
            version: decl.version.clone(),
            dependencies: decl.dependencies.clone(),
            module,
        }));
        Ok(status)
    }

    /// Release every native handle and clear cached shapes.
    ///
    /// Best effort: a handle that fails to close is logged, recorded in the
    /// returned list, and the rest are still released.
    pub fn unload(&self) -> Vec<FfiError> {
        let _guard = self.load_lock.lock();
        let mut state = self.state.write();
        let mut errors = Vec::new();

        for (path, module) in state.modules.drain() {
            match module.close() {
                Ok(()) => info!("unloaded {}", path.display()),
                Err(e) => {
                    warn!("error unloading {}: {}", path.display(), e);
                    errors.push(e);
                }
            }
        }
        for entry in &mut state.entries {
            entry.handle = None;
        }
        drop(state);

        self.shapes.clear();
        errors
    }

    // =========================================================================
    // Invocation
    // =========================================================================

    /// Call a declared function.
    ///
    /// Record, array and text arguments are passed by pointer and written back
    /// into `args` after the call, so callee mutations are visible. If the
    /// return value or any written-back argument fails to decode, the error is
    /// returned and `args` are left unchanged.
    pub fn invoke(&self, library: &str, function: &str, args: &mut [Value]) -> FfiResult<Value> {
        let (func, handle) = self.lookup(library, function)?;

        let code = handle
            .symbol(&func.name)
            .map_err(|_| FfiError::MissingFunction {
                library: library.to_string(),
                function: function.to_string(),
            })?;

        let sig = &func.signature;
        if args.len() != sig.arity() {
            return Err(FfiError::ArityMismatch {
                function: function.to_string(),
                expected: sig.arity(),
                got: args.len(),
            });
        }

        let shape = self.shapes.get_or_build(sig, func.convention);

        let mut leases = LeaseSet::counted(Arc::clone(&self.leases));
        let images = args
            .iter()
            .zip(&sig.params)
            .map(|(value, desc)| to_native(value, desc, &mut leases))
            .collect::<FfiResult<Vec<NativeImage>>>()?;
        let mut slots: Vec<u64> = images.iter().map(NativeImage::arg_word).collect();

        // Safety: the shape was built from the declared signature and every
        // pointer slot refers to a lease that outlives the call.
        let ret = unsafe { shape.call(code, &mut slots) };

        let result = match &sig.returns {
            None => Ok(Value::Void),
            Some(desc) => unsafe { decode_return(&ret, desc) },
        };

        // Decode every write-back before touching `args`, so a failure
        // leaves the caller's values as they were
        let updates = sig
            .params
            .iter()
            .zip(&images)
            .enumerate()
            .filter(|(_, (_, image))| image.is_leased())
            // Safety: `leases` still owns the buffer behind `image`
            .map(|(i, (desc, image))| Ok((i, unsafe { from_native(image, desc) }?)))
            .collect::<FfiResult<Vec<(usize, Value)>>>()?;
        let result = result?;
        for (i, value) in updates {
            args[i] = value;
        }

        leases.release_all();
        Ok(result)
    }

    fn lookup(
        &self,
        library: &str,
        function: &str,
    ) -> FfiResult<(Arc<FunctionDeclaration>, Arc<LibraryHandle>)> {
        let state = self.state.read();
        let entry = state
            .loaded(library)
            .ok_or_else(|| FfiError::missing_library(library, "not loaded"))?;
        let func = entry
            .functions
            .get(function)
            .cloned()
            .ok_or_else(|| FfiError::MissingFunction {
                library: library.to_string(),
                function: function.to_string(),
            })?;
        let handle = entry
            .handle
            .clone()
            .ok_or_else(|| FfiError::missing_library(library, "not loaded"))?;
        Ok((func, handle))
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state.read().loaded(name).is_some()
    }

    /// Names of loaded libraries, in declaration order
    pub fn loaded_libraries(&self) -> Vec<String> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.handle.is_some())
            .map(|e| e.decl.name.clone())
            .collect()
    }

    pub fn handle(&self, name: &str) -> Option<Arc<LibraryHandle>> {
        self.state.read().loaded(name).and_then(|e| e.handle.clone())
    }

    /// A declared function, loaded or not
    pub fn function(&self, library: &str, function: &str) -> Option<Arc<FunctionDeclaration>> {
        self.state
            .read()
            .entries
            .iter()
            .filter(|e| e.decl.name == library)
            .find_map(|e| e.functions.get(function).cloned())
    }

    /// Resolved address of a declared function in a loaded library
    pub fn symbol_address(&self, library: &str, function: &str) -> FfiResult<usize> {
        let (func, handle) = self.lookup(library, function)?;
        handle.symbol(&func.name)
    }

    /// The cached call shape a function's calls go through
    pub fn shape_for(&self, library: &str, function: &str) -> FfiResult<Arc<CallShape>> {
        let func = self
            .function(library, function)
            .ok_or_else(|| FfiError::MissingFunction {
                library: library.to_string(),
                function: function.to_string(),
            })?;
        Ok(self.shapes.get_or_build(&func.signature, func.convention))
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            native_loads: self.native_loads.load(Ordering::Relaxed),
            shapes_cached: self.shapes.len(),
            shapes_built: self.shapes.built(),
            leases_allocated: self.leases.allocated(),
            leases_released: self.leases.released(),
        }
    }
}

impl Default for LibraryRegistry {
    fn default() -> Self {
        Self::new()
    }
}
