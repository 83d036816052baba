//! Benchmarks for nativebind call overhead

use std::path::{Path, PathBuf};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use nativebind::ffi::{
    to_native, AcquireRequest, Bitness, CallingConvention, FfiError, FfiResult,
    FunctionDeclaration, FunctionSignature, LeaseSet, LibraryDeclaration, LibraryRegistry,
    LibrarySource, LoadOptions, NativeLoader, NativeModule, Platform, PrimitiveKind, ShapeCache,
    TypeDescriptor, Value,
};

extern "C" fn add_i64(a: i64, b: i64) -> i64 {
    a.wrapping_add(b)
}

extern "C" fn first_id(items: *const u8) -> i32 {
    unsafe { (items as *const i32).read_unaligned() }
}

struct InProcess(PathBuf);

impl NativeModule for InProcess {
    fn path(&self) -> &Path {
        &self.0
    }

    fn symbol(&self, name: &str) -> FfiResult<usize> {
        match name {
            "add_i64" => Ok(add_i64 as usize),
            "first_id" => Ok(first_id as usize),
            _ => Err(FfiError::MissingFunction {
                library: "bench".to_string(),
                function: name.to_string(),
            }),
        }
    }

    fn close(&self) -> FfiResult<()> {
        Ok(())
    }
}

struct InProcessLoader;

impl NativeLoader for InProcessLoader {
    fn open(&self, path: &Path) -> FfiResult<Arc<dyn NativeModule>> {
        Ok(Arc::new(InProcess(path.to_path_buf())))
    }
}

struct Anywhere;

impl LibrarySource for Anywhere {
    fn acquire(&self, request: &AcquireRequest<'_>) -> FfiResult<PathBuf> {
        Ok(PathBuf::from("/bench").join(request.file_name))
    }
}

fn entry() -> TypeDescriptor {
    TypeDescriptor::record([
        ("id", PrimitiveKind::I32.into()),
        ("label", TypeDescriptor::text(28)),
    ])
}

fn entry_value(id: i64) -> Value {
    Value::record([("id", Value::Int(id)), ("label", Value::text("bench"))])
}

fn loaded_registry(array_len: usize) -> LibraryRegistry {
    let registry = LibraryRegistry::new()
        .with_loader(Arc::new(InProcessLoader))
        .with_sources(vec![Arc::new(Anywhere)]);
    registry.declare(
        LibraryDeclaration::new("bench")
            .with_function(FunctionDeclaration::parse("i64 add_i64(i64, i64)").unwrap())
            .with_function(FunctionDeclaration::new(
                "first_id",
                FunctionSignature::new(
                    vec![TypeDescriptor::array(entry(), array_len)],
                    Some(PrimitiveKind::I32.into()),
                ),
            )),
    );
    registry
        .load("bench", Platform::Linux, Bitness::X64, &LoadOptions::default())
        .unwrap();
    registry
}

/// Benchmark a primitive call through the registry
fn bench_primitive_invoke(c: &mut Criterion) {
    let registry = loaded_registry(1);

    c.bench_function("invoke_add_i64", |b| {
        b.iter(|| {
            let out = registry.invoke("bench", "add_i64", &mut [Value::Int(20), Value::Int(22)]);
            black_box(out)
        })
    });
}

/// Benchmark record array marshaling for varying lengths
fn bench_record_arrays(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_array_invoke");

    for &len in &[1, 16, 256] {
        let registry = loaded_registry(len);
        let items = Value::Array((0..len as i64).map(entry_value).collect());
        group.throughput(Throughput::Elements(len as u64));

        group.bench_function(format!("{}_records", len), |b| {
            b.iter(|| {
                let mut args = [items.clone()];
                black_box(registry.invoke("bench", "first_id", &mut args))
            })
        });
    }

    group.finish();
}

/// Benchmark marshaling alone, without a call
fn bench_marshal_only(c: &mut Criterion) {
    let desc = TypeDescriptor::array(entry(), 64);
    let value = Value::Array((0..64).map(entry_value).collect());

    c.bench_function("to_native_64_records", |b| {
        b.iter(|| {
            let mut leases = LeaseSet::new();
            let image = to_native(&value, &desc, &mut leases);
            black_box(image.is_ok())
        })
    });
}

/// Benchmark shape cache hits
fn bench_shape_lookup(c: &mut Criterion) {
    let cache = ShapeCache::new();
    let sig = FunctionSignature::new(
        vec![PrimitiveKind::I64.into(), PrimitiveKind::F64.into()],
        Some(PrimitiveKind::F64.into()),
    );
    cache.get_or_build(&sig, CallingConvention::Cdecl);

    c.bench_function("shape_cache_hit", |b| {
        b.iter(|| black_box(cache.get_or_build(&sig, CallingConvention::Cdecl)))
    });
}

criterion_group!(
    benches,
    bench_primitive_invoke,
    bench_record_arrays,
    bench_marshal_only,
    bench_shape_lookup
);
criterion_main!(benches);
