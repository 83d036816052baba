//! Dynamic Invocation Engine
//!
//! Declares native libraries and functions at run time, loads them in
//! dependency order, and calls them with structured values marshaled to and
//! from native memory.
//!
//! # Architecture
//!
//! ```text
//! Host program
//!       │
//!       ▼
//! registry.invoke("mylib", "my_function", &mut args)
//!       │
//!       ▼
//! LibraryRegistry (library handle + function declaration)
//!       │
//!       ▼
//! ShapeCache (one libffi call interface per distinct signature)
//!       │
//!       ▼
//! Marshaler (Value <-> native image, leases freed on every exit)
//!       │
//!       ▼
//! Native Function Call
//! ```
//!
//! # Example
//!
//! ```ignore
//! let registry = LibraryRegistry::new();
//! registry.declare(
//!     LibraryDeclaration::new("mylib")
//!         .with_function(FunctionDeclaration::parse("int add(int, int)")?),
//! );
//! registry.load("mylib", Platform::current()?, Bitness::current()?, &LoadOptions::default())?;
//!
//! let result = registry.invoke("mylib", "add", &mut [Value::Int(1), Value::Int(2)])?;
//! ```

mod error;
mod lease;
mod loader;
mod marshal;
mod platform;
mod registry;
mod shape;
mod source;
mod types;

pub use error::{FfiError, FfiResult};
pub use lease::{LeaseCounters, LeaseSet, NativeMemoryLease};
pub use loader::{default_search_paths, DynamicLibrary, NativeLoader, NativeModule, SystemLoader};
pub use marshal::{decode_return, from_native, read_native, read_value, to_native, write_value, NativeImage};
pub use platform::{platform_specific_name, platform_specific_name_for, Bitness, Platform};
pub use registry::{
    Dependency, FunctionDeclaration, LibraryDeclaration, LibraryHandle, LibraryProgress,
    LibraryRegistry, LoadCondition, LoadOptions, LoadOutcome, LoadStatus, NameRule,
    RegistryStats,
};
pub use shape::{CallShape, ShapeCache};
pub use source::{
    AcquireRequest, CancellationToken, EmbeddedSource, LibrarySource, ProgressSink,
    RemoteSource, SearchPathSource,
};
pub use types::{CallingConvention, Field, FunctionSignature, PrimitiveKind, TypeDescriptor, Value};
