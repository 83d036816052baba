//! Native Memory Leases
//!
//! Every native allocation made while preparing a call is owned by exactly one
//! [`LeaseSet`]. Dropping the set frees everything it holds, so the memory is
//! released once on every exit path of the call.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::error::{FfiError, FfiResult};

/// Allocation counters shared between a registry and the leases it hands out
#[derive(Debug, Default)]
pub struct LeaseCounters {
    allocated: AtomicUsize,
    released: AtomicUsize,
}

impl LeaseCounters {
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Leases allocated but not yet released
    pub fn outstanding(&self) -> usize {
        self.allocated().saturating_sub(self.released())
    }
}

/// One zero-initialized native allocation
#[derive(Debug)]
pub struct NativeMemoryLease {
    ptr: NonNull<u8>,
    len: usize,
}

impl NativeMemoryLease {
    fn allocate(len: usize) -> FfiResult<Self> {
        // calloc(0) may hand back null; keep every lease addressable
        let raw = unsafe { libc::calloc(len.max(1), 1) } as *mut u8;
        let ptr = NonNull::new(raw)
            .ok_or_else(|| FfiError::marshal(format!("native allocation of {} bytes failed", len)))?;
        Ok(Self { ptr, len })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr is a live allocation of at least len bytes owned by self
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self guarantees exclusive access
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for NativeMemoryLease {
    fn drop(&mut self) {
        unsafe { libc::free(self.ptr.as_ptr() as *mut libc::c_void) };
    }
}

/// The leases created for a single call
#[derive(Debug, Default)]
pub struct LeaseSet {
    leases: Vec<NativeMemoryLease>,
    counters: Option<Arc<LeaseCounters>>,
}

impl LeaseSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lease set that reports allocations and releases to `counters`
    pub fn counted(counters: Arc<LeaseCounters>) -> Self {
        Self {
            leases: Vec::new(),
            counters: Some(counters),
        }
    }

    /// Allocate `len` zeroed bytes owned by this set
    pub fn allocate(&mut self, len: usize) -> FfiResult<&mut NativeMemoryLease> {
        let lease = NativeMemoryLease::allocate(len)?;
        if let Some(counters) = &self.counters {
            counters.allocated.fetch_add(1, Ordering::Relaxed);
        }
        self.leases.push(lease);
        let last = self.leases.len() - 1;
        Ok(&mut self.leases[last])
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Free every allocation; returns how many were released
    pub fn release_all(self) -> usize {
        self.leases.len()
    }
}

impl Drop for LeaseSet {
    fn drop(&mut self) {
        let count = self.leases.len();
        self.leases.clear();
        if let Some(counters) = &self.counters {
            counters.released.fetch_add(count, Ordering::Relaxed);
        }
    }
}
