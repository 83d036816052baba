//! Binding Configuration
//!
//! Handles parsing of `nativebind.toml` (or an equivalent JSON manifest) that
//! declares libraries, their functions and named record types.
//!
//! ```toml
//! [search]
//! paths = ["./native"]
//!
//! [types.person]
//! fields = [
//!     { name = "id", type = "i32" },
//!     { name = "name", type = "text[64]" },
//! ]
//!
//! [[library]]
//! name = "people"
//! version = "2.1"
//! dependencies = [{ name = "core", version = "1.0" }]
//!
//! [[library.function]]
//! name = "people_rename"
//! alias = "rename"
//! returns = "int"
//! params = ["person[3]", "u32"]
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::ffi::{
    Dependency, Field, FunctionDeclaration, FunctionSignature, LibraryDeclaration, NameRule,
    RemoteSource, TypeDescriptor,
};

/// File name searched for by [`BindingsConfig::find_and_load`]
pub const CONFIG_FILE: &str = "nativebind.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Root configuration structure matching nativebind.toml.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BindingsConfig {
    /// Fallback library locations
    #[serde(default)]
    pub search: SearchConfig,

    /// Named record types usable in type strings
    #[serde(default)]
    pub types: BTreeMap<String, RecordConfig>,

    /// Library declarations
    #[serde(default, rename = "library")]
    pub libraries: Vec<LibraryConfig>,
}

impl BindingsConfig {
    /// Load configuration from a file path. `.json` files are read as JSON.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        }
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> ConfigResult<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Find and load configuration by searching up from the given directory.
    pub fn find_and_load(start_dir: &Path) -> ConfigResult<Self> {
        let mut dir = start_dir.to_path_buf();
        loop {
            let config_path = dir.join(CONFIG_FILE);
            if config_path.exists() {
                return Self::load(&config_path);
            }
            if !dir.pop() {
                return Err(ConfigError::NotFound(format!(
                    "{} above {}",
                    CONFIG_FILE,
                    start_dir.display()
                )));
            }
        }
    }

    /// Save configuration to a file as TOML.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Resolve every named record type, including ones that nest others
    pub fn named_types(&self) -> ConfigResult<HashMap<String, TypeDescriptor>> {
        let mut resolved = HashMap::new();
        for name in self.types.keys() {
            self.resolve_named(name, &mut resolved, &mut Vec::new())?;
        }
        Ok(resolved)
    }

    fn resolve_named(
        &self,
        name: &str,
        resolved: &mut HashMap<String, TypeDescriptor>,
        stack: &mut Vec<String>,
    ) -> ConfigResult<()> {
        if resolved.contains_key(name) {
            return Ok(());
        }
        if stack.iter().any(|s| s == name) {
            return Err(ConfigError::Invalid(format!(
                "record type '{}' contains itself",
                name
            )));
        }
        let record = &self.types[name];
        stack.push(name.to_string());

        // Declare referenced records first
        for field in &record.fields {
            let base = field.ty.split('[').next().unwrap_or("").trim();
            if self.types.contains_key(base) {
                self.resolve_named(base, resolved, stack)?;
            }
        }

        let fields = record
            .fields
            .iter()
            .map(|f| Ok(Field::new(&f.name, parse_type(&f.ty, resolved)?)))
            .collect::<ConfigResult<Vec<_>>>()?;
        stack.pop();
        let record = TypeDescriptor::Record(fields);
        if record.checked_size().is_none() {
            return Err(ConfigError::Invalid(format!("record type '{}' is too large", name)));
        }
        resolved.insert(name.to_string(), record);
        Ok(())
    }

    /// Turn the library sections into declarations
    pub fn declarations(&self) -> ConfigResult<Vec<LibraryDeclaration>> {
        let named = self.named_types()?;
        let cache_dir = self
            .search
            .cache_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("nativebind-cache"));

        self.libraries
            .iter()
            .map(|lib| lib.declaration(&named, &cache_dir))
            .collect()
    }
}

fn parse_type(s: &str, named: &HashMap<String, TypeDescriptor>) -> ConfigResult<TypeDescriptor> {
    TypeDescriptor::parse(s, named).map_err(|e| ConfigError::Invalid(e.to_string()))
}

/// Library search configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Extra directories searched for library files
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Where remote libraries are downloaded to
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

/// A named record type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordConfig {
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
}

/// File naming rule for a library.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Naming {
    #[default]
    Conventional,
    Verbatim,
}

/// One `[[library]]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LibraryConfig {
    pub name: String,

    #[serde(default)]
    pub version: Option<String>,

    /// Restrict to a platform (`windows`, `linux`, `android`, `macos`, `ios`)
    #[serde(default)]
    pub platform: Option<String>,

    /// Restrict to `x86` or `x64`
    #[serde(default)]
    pub bitness: Option<String>,

    /// Explicit file or directory
    #[serde(default)]
    pub path: Option<PathBuf>,

    #[serde(default)]
    pub naming: Naming,

    /// Base URL to download the file from
    #[serde(default)]
    pub remote: Option<String>,

    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,

    #[serde(default, rename = "function")]
    pub functions: Vec<FunctionConfig>,
}

impl LibraryConfig {
    fn declaration(
        &self,
        named: &HashMap<String, TypeDescriptor>,
        cache_dir: &Path,
    ) -> ConfigResult<LibraryDeclaration> {
        let invalid = |e: crate::ffi::FfiError| ConfigError::Invalid(e.to_string());

        let mut decl = LibraryDeclaration::new(&self.name).with_naming(match self.naming {
            Naming::Conventional => NameRule::Conventional,
            Naming::Verbatim => NameRule::Verbatim,
        });
        decl.version = self.version.clone();
        decl.path = self.path.clone();
        if let Some(platform) = &self.platform {
            decl.platform = Some(platform.parse().map_err(invalid)?);
        }
        if let Some(bitness) = &self.bitness {
            decl.bitness = Some(bitness.parse().map_err(invalid)?);
        }
        if let Some(remote) = &self.remote {
            decl.sources
                .push(Arc::new(RemoteSource::new(remote.clone(), cache_dir)));
        }
        decl.dependencies = self
            .dependencies
            .iter()
            .map(|d| Dependency {
                name: d.name.clone(),
                version: d.version.clone(),
            })
            .collect();

        for function in &self.functions {
            decl.functions.push(function.declaration(named)?);
        }
        Ok(decl)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// One `[[library.function]]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionConfig {
    /// Native symbol name
    pub name: String,

    #[serde(default)]
    pub alias: Option<String>,

    /// Return type string; absent or `void` for no value
    #[serde(default)]
    pub returns: Option<String>,

    #[serde(default)]
    pub params: Vec<String>,

    /// `cdecl`, `stdcall` or `system`
    #[serde(default)]
    pub convention: Option<String>,
}

impl FunctionConfig {
    fn declaration(&self, named: &HashMap<String, TypeDescriptor>) -> ConfigResult<FunctionDeclaration> {
        let returns = match self.returns.as_deref().map(str::trim) {
            None | Some("void") => None,
            Some(ty) => Some(parse_type(ty, named)?),
        };
        let params = self
            .params
            .iter()
            .map(|p| parse_type(p, named))
            .collect::<ConfigResult<Vec<_>>>()?;

        let mut decl = FunctionDeclaration::new(&self.name, FunctionSignature::new(params, returns));
        if let Some(alias) = &self.alias {
            decl = decl.with_alias(alias);
        }
        if let Some(convention) = &self.convention {
            decl = decl.with_convention(
                convention
                    .parse()
                    .map_err(|e: crate::ffi::FfiError| ConfigError::Invalid(e.to_string()))?,
            );
        }
        Ok(decl)
    }
}
