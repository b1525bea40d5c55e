//! Code-memory mutation primitives.
//!
//! All writes into live code pages and all executable allocations go
//! through this module. Attach and detach operations serialize on [`POOL`]
//! so no two threads mutate code or the allocator concurrently.
use crate::error::{Error, Result};
use crate::{alloc, arch, pic};
use lazy_static::lazy_static;
use std::collections::HashSet;
use std::ptr;
use std::sync::Mutex;

lazy_static! {
  /// Shared allocator for all trampolines and stubs.
  ///
  /// Also serves as the exclusion domain for attach/detach: every operation
  /// that mutates target code holds this lock for its whole duration.
  pub static ref POOL: Mutex<alloc::Allocator> = {
    // Seek memory blocks within ±2 GiB of the patched function
    Mutex::new(alloc::Allocator::new(arch::JUMP_RANGE))
  };
}

lazy_static! {
  /// Addresses with an active patch of either kind.
  ///
  /// A JMP hook and a breakpoint hook must never co-own an address, so
  /// both engines claim their target here before mutating it.
  static ref SITES: Mutex<HashSet<usize>> = Mutex::new(HashSet::new());
}

/// Claims exclusive patch ownership of an address.
pub fn claim_site(address: usize) -> Result<()> {
  if SITES.lock().unwrap().insert(address) {
    Ok(())
  } else {
    Err(Error::AlreadyPatched)
  }
}

/// Releases patch ownership of an address.
pub fn release_site(address: usize) {
  SITES.lock().unwrap().remove(&address);
}

/// Allocates executable memory near `origin` and emits `emitter` into it.
pub fn allocate_code(
  pool: &mut alloc::Allocator,
  emitter: &pic::CodeEmitter,
  origin: *const (),
) -> Result<alloc::ExecutableMemory> {
  pool.allocate(origin, emitter.len()).map(|mut memory| {
    // The code is generated for the address it was granted
    let code = emitter.emit(memory.as_ptr() as *const ());
    memory.copy_from_slice(code.as_slice());
    memory
  })
}

/// Writes `bytes` over code at `address`, toggling page protection around
/// the write.
///
/// The previous protection is restored when the guard drops, including on
/// unwind, so a failed operation never leaves pages writable.
pub unsafe fn write_protected(address: *const (), bytes: &[u8]) -> Result<()> {
  let _guard = region::protect_with_handle(
    address as *const u8,
    bytes.len(),
    region::Protection::READ_WRITE_EXECUTE,
  )?;

  ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
  Ok(())
}
