//! Library Acquisition Sources
//!
//! The registry never fetches library bytes itself. It asks each
//! [`LibrarySource`] in turn for a filesystem path to the platform file.

use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info};

use super::error::{FfiError, FfiResult};
use super::loader::default_search_paths;
use super::platform::{Bitness, Platform};

/// Receives fraction-complete updates in `0.0..=1.0`
pub type ProgressSink = Arc<dyn Fn(f64) + Send + Sync>;

/// Cooperative cancellation flag shared with acquisition sources
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What the registry asks a source for
pub struct AcquireRequest<'a> {
    /// Logical library name
    pub name: &'a str,
    /// Platform-specific file name, e.g. `libfoo.so`
    pub file_name: &'a str,
    pub version: Option<&'a str>,
    pub platform: Platform,
    pub bitness: Bitness,
    pub progress: Option<&'a ProgressSink>,
    pub cancel: &'a CancellationToken,
}

impl AcquireRequest<'_> {
    fn report(&self, fraction: f64) {
        if let Some(progress) = self.progress {
            progress(fraction.clamp(0.0, 1.0));
        }
    }

    fn not_found(&self, reason: impl Into<String>) -> FfiError {
        FfiError::missing_library(self.name, reason)
    }
}

/// Supplies a filesystem path for a library file
pub trait LibrarySource: Send + Sync {
    fn acquire(&self, request: &AcquireRequest<'_>) -> FfiResult<PathBuf>;
}

/// Looks for the file in a list of directories
#[derive(Debug, Clone)]
pub struct SearchPathSource {
    paths: Vec<PathBuf>,
}

impl SearchPathSource {
    pub fn new(paths: Vec<PathBuf>) -> Self {
        Self { paths }
    }

    /// The platform's default search paths
    pub fn system() -> Self {
        Self::new(default_search_paths())
    }

    /// Add a search path
    pub fn add_search_path(&mut self, path: impl AsRef<Path>) {
        self.paths.push(path.as_ref().to_path_buf());
    }

    pub fn paths(&self) -> &[PathBuf] {
        &self.paths
    }
}

impl LibrarySource for SearchPathSource {
    fn acquire(&self, request: &AcquireRequest<'_>) -> FfiResult<PathBuf> {
        self.paths
            .iter()
            .map(|dir| dir.join(request.file_name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                request.not_found(format!(
                    "'{}' not in {} search paths",
                    request.file_name,
                    self.paths.len()
                ))
            })
    }
}

/// Library bytes compiled into the host, extracted on first use
pub struct EmbeddedSource {
    files: HashMap<String, &'static [u8]>,
    extract_dir: PathBuf,
}

impl EmbeddedSource {
    pub fn new(extract_dir: impl Into<PathBuf>) -> Self {
        Self {
            files: HashMap::new(),
            extract_dir: extract_dir.into(),
        }
    }

    /// Register the bytes for a platform file name
    pub fn with_file(mut self, file_name: impl Into<String>, bytes: &'static [u8]) -> Self {
        self.files.insert(file_name.into(), bytes);
        self
    }
}

impl LibrarySource for EmbeddedSource {
    fn acquire(&self, request: &AcquireRequest<'_>) -> FfiResult<PathBuf> {
        let bytes = self
            .files
            .get(request.file_name)
            .ok_or_else(|| request.not_found("no embedded resource"))?;

        let target = self.extract_dir.join(request.file_name);
        // Rewrite anything that differs, including stale files of equal length
        let current = fs::read(&target).ok();
        if current.as_deref() != Some(*bytes) {
            fs::create_dir_all(&self.extract_dir).map_err(|e| FfiError::Io(e.to_string()))?;
            fs::write(&target, bytes).map_err(|e| FfiError::Io(e.to_string()))?;
            debug!("extracted embedded '{}' to {}", request.file_name, target.display());
        }
        request.report(1.0);
        Ok(target)
    }
}

/// Downloads the file from `{base_url}/{file_name}` into a cache directory
#[derive(Debug, Clone)]
pub struct RemoteSource {
    base_url: String,
    cache_dir: PathBuf,
}

const CHUNK_SIZE: usize = 64 * 1024;

impl RemoteSource {
    pub fn new(base_url: impl Into<String>, cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache_dir: cache_dir.into(),
        }
    }

    fn url_for(&self, request: &AcquireRequest<'_>) -> String {
        match request.version {
            Some(v) => format!("{}/{}/{}", self.base_url, v, request.file_name),
            None => format!("{}/{}", self.base_url, request.file_name),
        }
    }

    fn cached_path(&self, request: &AcquireRequest<'_>) -> PathBuf {
        match request.version {
            Some(v) => self.cache_dir.join(v).join(request.file_name),
            None => self.cache_dir.join(request.file_name),
        }
    }
}

impl LibrarySource for RemoteSource {
    fn acquire(&self, request: &AcquireRequest<'_>) -> FfiResult<PathBuf> {
        let target = self.cached_path(request);
        if target.is_file() {
            request.report(1.0);
            return Ok(target);
        }
        if request.cancel.is_cancelled() {
            return Err(request.not_found("acquisition cancelled"));
        }

        let url = self.url_for(request);
        info!("downloading {} from {}", request.file_name, url);
        let response = ureq::get(&url)
            .call()
            .map_err(|e| request.not_found(format!("download of {} failed: {}", url, e)))?;
        let total: Option<u64> = response
            .header("Content-Length")
            .and_then(|v| v.parse().ok());

        let dir = target.parent().unwrap_or(&self.cache_dir);
        fs::create_dir_all(dir).map_err(|e| FfiError::Io(e.to_string()))?;
        let partial = target.with_extension("part");

        // A failed or cancelled download never leaves a partial file behind
        let finished = stream_to_file(request, response.into_reader(), &partial, total)
            .and_then(|()| fs::rename(&partial, &target).map_err(|e| FfiError::Io(e.to_string())));
        if let Err(e) = finished {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        info!("downloaded {} to {}", request.file_name, target.display());
        request.report(1.0);
        Ok(target)
    }
}

/// Copy `reader` into `path` chunk by chunk, reporting progress when the
/// total is known and stopping at the first chunk boundary after a cancel
fn stream_to_file(
    request: &AcquireRequest<'_>,
    mut reader: impl Read,
    path: &Path,
    total: Option<u64>,
) -> FfiResult<()> {
    let mut file = fs::File::create(path).map_err(|e| FfiError::Io(e.to_string()))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut received: u64 = 0;
    loop {
        if request.cancel.is_cancelled() {
            return Err(request.not_found("acquisition cancelled"));
        }
        let n = reader.read(&mut buf).map_err(|e| FfiError::Io(e.to_string()))?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .map_err(|e| FfiError::Io(e.to_string()))?;
        received += n as u64;
        if let Some(total) = total.filter(|&t| t > 0) {
            request.report(received as f64 / total as f64);
        }
    }
    file.flush().map_err(|e| FfiError::Io(e.to_string()))
}
