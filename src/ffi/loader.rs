//! Dynamic Library Loader
//!
//! Safe wrapper around libloading for loading shared libraries, behind a
//! small trait seam so hosts can supply their own loader.

use std::collections::HashMap;
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::{Library, Symbol};
use log::debug;
use parking_lot::RwLock;

use super::error::{FfiError, FfiResult};

/// A loaded native module that can resolve symbols
pub trait NativeModule: Send + Sync {
    /// Path the module was loaded from
    fn path(&self) -> &Path;

    /// Address of an exported function
    fn symbol(&self, name: &str) -> FfiResult<usize>;

    /// Release the native handle. Later symbol lookups fail.
    fn close(&self) -> FfiResult<()>;
}

/// Opens native modules from resolved paths
pub trait NativeLoader: Send + Sync {
    fn open(&self, path: &Path) -> FfiResult<Arc<dyn NativeModule>>;
}

/// A dynamically loaded library
pub struct DynamicLibrary {
    /// Path to the library
    path: PathBuf,
    /// The loaded library handle, `None` once closed
    library: RwLock<Option<Library>>,
    /// Cached function symbols
    symbols: RwLock<HashMap<String, usize>>,
}

impl DynamicLibrary {
    /// Load a library from the given path
    pub fn load(path: impl AsRef<Path>) -> FfiResult<Self> {
        let path = path.as_ref().to_path_buf();

        // Safety: loading a library runs its initializers. The engine trusts
        // the native code it is asked to load.
        let library = unsafe {
            Library::new(&path).map_err(|e| FfiError::LibraryLoadFailure {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        Ok(Self {
            path,
            library: RwLock::new(Some(library)),
            symbols: RwLock::new(HashMap::new()),
        })
    }

    fn missing(&self, name: &str) -> FfiError {
        FfiError::MissingFunction {
            library: self.path.display().to_string(),
            function: name.to_string(),
        }
    }
}

impl NativeModule for DynamicLibrary {
    fn path(&self) -> &Path {
        &self.path
    }

    fn symbol(&self, name: &str) -> FfiResult<usize> {
        if let Some(&addr) = self.symbols.read().get(name) {
            return Ok(addr);
        }

        let c_name = CString::new(name).map_err(|_| self.missing(name))?;
        let guard = self.library.read();
        let library = guard.as_ref().ok_or_else(|| self.missing(name))?;

        // Safety: the address is only ever called through a call shape built
        // from the declared signature.
        let symbol: Symbol<*const ()> = unsafe {
            library.get(c_name.as_bytes_with_nul()).map_err(|e| {
                debug!("symbol '{}' not found in '{}': {}", name, self.path.display(), e);
                self.missing(name)
            })?
        };

        let addr = *symbol as usize;
        self.symbols.write().insert(name.to_string(), addr);
        Ok(addr)
    }

    fn close(&self) -> FfiResult<()> {
        self.symbols.write().clear();
        match self.library.write().take() {
            Some(library) => library.close().map_err(|e| FfiError::LibraryLoadFailure {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            }),
            None => Ok(()),
        }
    }
}

/// Loader backed by the operating system's dynamic linker
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLoader;

impl NativeLoader for SystemLoader {
    fn open(&self, path: &Path) -> FfiResult<Arc<dyn NativeModule>> {
        Ok(Arc::new(DynamicLibrary::load(path)?))
    }
}

/// Get the default library search paths for this platform
pub fn default_search_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // Current directory
    if let Ok(cwd) = std::env::current_dir() {
        paths.push(cwd);
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/lib"));
        paths.push(PathBuf::from("/lib64"));
        paths.push(PathBuf::from("/usr/lib64"));
        paths.push(PathBuf::from(format!(
            "/usr/lib/{}-linux-gnu",
            std::env::consts::ARCH
        )));
        paths.push(PathBuf::from(format!(
            "/lib/{}-linux-gnu",
            std::env::consts::ARCH
        )));

        if let Ok(ld_path) = std::env::var("LD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&ld_path));
        }
    }

    #[cfg(target_os = "macos")]
    {
        paths.push(PathBuf::from("/usr/lib"));
        paths.push(PathBuf::from("/usr/local/lib"));
        paths.push(PathBuf::from("/opt/homebrew/lib"));

        if let Ok(dyld_path) = std::env::var("DYLD_LIBRARY_PATH") {
            paths.extend(std::env::split_paths(&dyld_path));
        }
    }

    #[cfg(target_os = "windows")]
    {
        paths.push(PathBuf::from("C:\\Windows\\System32"));

        if let Ok(path) = std::env::var("PATH") {
            paths.extend(std::env::split_paths(&path));
        }
    }

    paths
}
