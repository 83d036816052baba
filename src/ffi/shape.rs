//! Call Shapes
//!
//! A [`CallShape`] is the prepared libffi call interface for one function
//! signature. It holds layout only, never a symbol address, so every function
//! with a structurally identical signature shares one.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use libffi::middle::{Cif, Type};
use libffi::raw;
use log::debug;
use parking_lot::RwLock;

use super::types::{CallingConvention, FunctionSignature, PrimitiveKind, TypeDescriptor};

/// Reusable invocation path for one signature
pub struct CallShape {
    cif: Cif,
    signature: FunctionSignature,
    convention: CallingConvention,
    return_len: usize,
}

// Safety: the prepared cif is never mutated after construction and libffi
// only reads it during ffi_call, so it can be shared across threads.
unsafe impl Send for CallShape {}
unsafe impl Sync for CallShape {}

impl CallShape {
    fn build(signature: &FunctionSignature, convention: CallingConvention) -> Self {
        let params = signature.params.iter().map(ffi_type);
        let ret = signature
            .returns
            .as_ref()
            .map(ffi_type)
            .unwrap_or_else(Type::void);

        let cif = with_convention(Cif::new(params, ret), convention);

        let return_len = match &signature.returns {
            None => 0,
            Some(TypeDescriptor::Primitive(kind)) => kind.size(),
            Some(_) => size_of::<usize>(),
        };

        Self {
            cif,
            signature: signature.clone(),
            convention,
            return_len,
        }
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    /// Bytes the callee writes for its return value
    pub fn return_len(&self) -> usize {
        self.return_len
    }

    /// Call the function at `code` with one 8-byte slot per argument and
    /// return the raw return buffer.
    ///
    /// # Safety
    ///
    /// `code` must be the address of a function whose native signature matches
    /// this shape, `args` must hold exactly one slot per parameter, and any
    /// pointers in those slots must be valid for the callee's use.
    pub unsafe fn call(&self, code: usize, args: &mut [u64]) -> Vec<u8> {
        let mut arg_ptrs: Vec<*mut c_void> = args
            .iter_mut()
            .map(|slot| slot as *mut u64 as *mut c_void)
            .collect();

        // libffi writes at least a full word, even for narrow returns
        let words = self.return_len.max(size_of::<u64>()).div_ceil(size_of::<u64>());
        let mut ret = vec![0u64; words];

        let fun = std::mem::transmute::<usize, unsafe extern "C" fn()>(code);
        raw::ffi_call(
            self.cif.as_raw_ptr(),
            Some(fun),
            ret.as_mut_ptr() as *mut c_void,
            arg_ptrs.as_mut_ptr(),
        );

        ret.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }
}

impl std::fmt::Debug for CallShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallShape")
            .field("signature", &self.signature)
            .field("convention", &self.convention)
            .finish()
    }
}

#[cfg(all(target_arch = "x86", target_os = "windows"))]
fn with_convention(mut cif: Cif, convention: CallingConvention) -> Cif {
    if convention != CallingConvention::Cdecl {
        cif.set_abi(raw::ffi_abi_FFI_STDCALL);
    }
    cif
}

// Only 32-bit Windows distinguishes stdcall from the default ABI
#[cfg(not(all(target_arch = "x86", target_os = "windows")))]
fn with_convention(cif: Cif, _convention: CallingConvention) -> Cif {
    cif
}

/// Non-primitives cross the boundary as pointers to their native image
fn ffi_type(desc: &TypeDescriptor) -> Type {
    match desc {
        TypeDescriptor::Primitive(kind) => match kind {
            PrimitiveKind::I8 => Type::i8(),
            PrimitiveKind::U8 | PrimitiveKind::Bool => Type::u8(),
            PrimitiveKind::I16 => Type::i16(),
            PrimitiveKind::U16 => Type::u16(),
            PrimitiveKind::I32 => Type::i32(),
            PrimitiveKind::U32 => Type::u32(),
            PrimitiveKind::I64 => Type::i64(),
            PrimitiveKind::U64 => Type::u64(),
            PrimitiveKind::F32 => Type::f32(),
            PrimitiveKind::F64 => Type::f64(),
            PrimitiveKind::Pointer => Type::pointer(),
        },
        _ => Type::pointer(),
    }
}

type ShapeTable = HashMap<CallingConvention, HashMap<FunctionSignature, Arc<CallShape>>>;

/// Process-lifetime cache of call shapes keyed by structural signature
#[derive(Default)]
pub struct ShapeCache {
    shapes: RwLock<ShapeTable>,
    built: AtomicUsize,
}

impl ShapeCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shape for `signature`, building it on first use.
    ///
    /// Concurrent first uses build exactly once; every caller gets the same
    /// instance.
    pub fn get_or_build(
        &self,
        signature: &FunctionSignature,
        convention: CallingConvention,
    ) -> Arc<CallShape> {
        if let Some(shape) = self
            .shapes
            .read()
            .get(&convention)
            .and_then(|by_sig| by_sig.get(signature))
        {
            return Arc::clone(shape);
        }

        let mut shapes = self.shapes.write();
        let shape = shapes
            .entry(convention)
            .or_default()
            .entry(signature.clone())
            .or_insert_with(|| {
                self.built.fetch_add(1, Ordering::Relaxed);
                debug!("building call shape for {} ({:?})", signature, convention);
                Arc::new(CallShape::build(signature, convention))
            });
        Arc::clone(shape)
    }

    /// Number of distinct shapes cached
    pub fn len(&self) -> usize {
        self.shapes.read().values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shapes constructed since creation, including ones later cleared
    pub fn built(&self) -> usize {
        self.built.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        self.shapes.write().clear();
    }
}
