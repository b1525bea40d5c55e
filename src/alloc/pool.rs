use std::ops::Range;
use std::slice;

use slice_pool::sync::{SliceBox, SlicePool};

use super::free;
use crate::error::{Error, Result};

/// A chunk handed out by a pool.
pub type Chunk = SliceBox<u8>;

/// All executable memory pools, ordered by creation.
pub struct PoolSet {
  max_distance: usize,
  pools: Vec<SlicePool<u8>>,
}

impl PoolSet {
  pub fn new(max_distance: usize) -> Self {
    PoolSet {
      max_distance,
      pools: Vec::new(),
    }
  }

  /// Allocates a chunk within `max_distance` of `origin`.
  pub fn allocate(&mut self, origin: *const (), size: usize) -> Result<Chunk> {
    let range = ((origin as usize).saturating_sub(self.max_distance))
      ..((origin as usize).saturating_add(self.max_distance));

    // Prefer an existing pool before mapping new memory
    self.allocate_existing(&range, size).or_else(|_| {
      let pool = self.map_pool(&range, origin, size)?;
      let chunk = pool.alloc(size).unwrap();
      self.pools.push(pool);
      Ok(chunk)
    })
  }

  /// Returns the pool associated with a chunk, releasing it if unused.
  pub fn release(&mut self, chunk: &Chunk) {
    let index = self
      .pools
      .iter()
      .position(|pool| {
        let lower = pool.as_ptr() as usize;
        let upper = lower + pool.len();
        (lower..upper).contains(&(chunk.as_ptr() as usize))
      })
      .expect("releasing chunk with no associated pool");

    // The dropped chunk is the pool's only outstanding allocation
    if self.pools[index].len() == 1 {
      self.pools.remove(index);
    }
  }

  /// Tries to serve the allocation from a pool inside the range.
  fn allocate_existing(&mut self, range: &Range<usize>, size: usize) -> Result<Chunk> {
    let in_range = |pool: &SlicePool<u8>| {
      let lower = pool.as_ptr() as usize;
      let upper = lower + pool.len();
      range.contains(&lower) && range.contains(&(upper - 1))
    };

    self
      .pools
      .iter_mut()
      .filter_map(|pool| if in_range(pool) { pool.alloc(size) } else { None })
      .next()
      .ok_or(Error::OutOfMemory)
  }

  /// Maps a new pool as close to `origin` as the OS permits.
  fn map_pool(
    &mut self,
    range: &Range<usize>,
    origin: *const (),
    size: usize,
  ) -> Result<SlicePool<u8>> {
    let after = free::regions_after(origin, Some(range.clone()));
    let before = free::regions_before(origin, Some(range.clone()));

    // Probe addresses after the origin first; low addresses are often
    // reserved and the kernel rejects fixed mappings there.
    after
      .chain(before)
      .filter_map(|result| match result {
        Ok(address) => Self::map_fixed_pool(address, size).map(Ok),
        Err(error) => Some(Err(error)),
      })
      .next()
      .unwrap_or(Err(Error::OutOfMemory))
  }

  /// Tries to map executable memory at a fixed address.
  fn map_fixed_pool(address: *const (), size: usize) -> Option<SlicePool<u8>> {
    mmap::MemoryMap::new(
      size,
      &[
        mmap::MapOption::MapReadable,
        mmap::MapOption::MapWritable,
        mmap::MapOption::MapExecutable,
        mmap::MapOption::MapAddr(address as *const _),
      ],
    )
    .ok()
    .map(SliceableMap)
    .map(SlicePool::new)
  }
}

/// Adapter exposing a memory map as a mutable slice for pooling.
struct SliceableMap(mmap::MemoryMap);

impl AsRef<[u8]> for SliceableMap {
  fn as_ref(&self) -> &[u8] {
    unsafe { slice::from_raw_parts(self.0.data(), self.0.len()) }
  }
}

impl AsMut<[u8]> for SliceableMap {
  fn as_mut(&mut self) -> &mut [u8] {
    unsafe { slice::from_raw_parts_mut(self.0.data(), self.0.len()) }
  }
}

unsafe impl Send for SliceableMap {}
unsafe impl Sync for SliceableMap {}
