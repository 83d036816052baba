//! nativebind - Dynamic native library binding
//!
//! Lets a host program declare native libraries and functions it has no
//! compile-time bindings for, load them across platforms, and call them with
//! structured values: primitives, fixed-size text, nested records and fixed
//! arrays of records.
//!
//! # Features
//!
//! - **Library registry**: declarations with versions, platform/bitness
//!   targeting, dependency ordering and load conditions
//! - **Pluggable acquisition**: search paths, embedded bytes, HTTP download
//! - **Call shapes**: one prepared libffi interface per distinct signature,
//!   shared by every function that uses it
//! - **Descriptor-driven marshaling**: densely packed native images, with every
//!   temporary allocation freed when the call returns
//! - **TOML/JSON configuration**: declare everything from a `nativebind.toml`
//!
//! # Example
//!
//! ```no_run
//! use nativebind::config::BindingsConfig;
//! use nativebind::ffi::{Bitness, LibraryRegistry, LoadOptions, Platform, Value};
//!
//! # fn main() -> Result<(), nativebind::ffi::FfiError> {
//! let config = BindingsConfig::from_toml_str(r#"
//!     [[library]]
//!     name = "m"
//!     naming = "verbatim"
//!     path = "/lib/x86_64-linux-gnu/libm.so.6"
//!
//!     [[library.function]]
//!     name = "cbrt"
//!     returns = "double"
//!     params = ["double"]
//! "#)?;
//!
//! let mut registry = LibraryRegistry::new();
//! registry.apply_config(&config)?;
//! registry.load("m", Platform::current()?, Bitness::current()?, &LoadOptions::default())?;
//!
//! let root = registry.invoke("m", "cbrt", &mut [Value::Float(27.0)])?;
//! assert_eq!(root, Value::Float(3.0));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod ffi;

pub use config::{BindingsConfig, ConfigError};
pub use ffi::{
    FfiError, FfiResult, FunctionDeclaration, LibraryDeclaration, LibraryRegistry, TypeDescriptor,
    Value,
};
