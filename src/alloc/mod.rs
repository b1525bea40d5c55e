//! Executable memory allocation.
//!
//! Trampolines and stubs must live in executable pages, and on x64 they
//! must be reachable from the patched function with a 32-bit displacement.
//! Allocations are therefore served from pools mapped within a bounded
//! distance of the requesting address, and several small allocations share
//! one mapping.
use crate::error::Result;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

mod free;
mod pool;

/// A thread-safe allocator for executable memory close to an address.
pub struct Allocator(Arc<Mutex<pool::PoolSet>>);

impl Allocator {
  /// Creates an allocator with a maximum distance to the requested origin.
  pub fn new(max_distance: usize) -> Self {
    Allocator(Arc::new(Mutex::new(pool::PoolSet::new(max_distance))))
  }

  /// Allocates read-, write- and executable memory close to `origin`.
  pub fn allocate(&mut self, origin: *const (), size: usize) -> Result<ExecutableMemory> {
    let mut pools = self.0.lock().unwrap();
    pools.allocate(origin, size).map(|chunk| ExecutableMemory {
      pools: self.0.clone(),
      chunk,
    })
  }
}

/// An exclusively owned chunk of executable memory.
///
/// The chunk is returned to its pool when dropped.
pub struct ExecutableMemory {
  pools: Arc<Mutex<pool::PoolSet>>,
  chunk: pool::Chunk,
}

impl ExecutableMemory {
  /// Returns the address of the memory.
  pub fn as_ptr(&self) -> *const u8 {
    self.chunk.as_ptr()
  }
}

impl Drop for ExecutableMemory {
  fn drop(&mut self) {
    self.pools.lock().unwrap().release(&self.chunk);
  }
}

impl Deref for ExecutableMemory {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    self.chunk.deref()
  }
}

impl DerefMut for ExecutableMemory {
  fn deref_mut(&mut self) -> &mut [u8] {
    self.chunk.deref_mut()
  }
}

unsafe impl Send for ExecutableMemory {}
unsafe impl Sync for ExecutableMemory {}
