//! The software-breakpoint (INT3) patch engine.
//!
//! Attaching replaces the first byte of a function with a breakpoint
//! opcode and registers the address in a process-wide table. A trap
//! handler, installed alongside the first breakpoint, looks the faulting
//! address up and redirects execution to a stub that hands control to the
//! detour. Traps at unregistered addresses are forwarded untouched so
//! debuggers and other handlers keep working.
//!
//! The stub also carries the displaced instruction followed by a jump back
//! into the function, exposed through [`SwbpPatch::original`], so a detour
//! can run the original behavior without re-trapping.
use crate::arch::{decode, thunk};
use crate::error::{Error, Result};
use crate::{alloc, memory, pic, trap, util};
use lazy_static::lazy_static;
use log::debug;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Source of process-unique breakpoint identifiers.
static NEXT_GID: AtomicU32 = AtomicU32::new(1);

lazy_static! {
  /// All active breakpoints, keyed by their address.
  ///
  /// The single exclusion domain for breakpoint state: attach and detach
  /// mutate it, and the trap handler reads it, on whichever thread the
  /// trap lands. Keep the critical sections short.
  static ref REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    slots: HashMap::new(),
  });
}

struct Registry {
  slots: HashMap<usize, Slot>,
}

/// The per-breakpoint state the trap handler needs.
struct Slot {
  gid: u32,
  stub: *const u8,
}

unsafe impl Send for Slot {}

impl Registry {
  /// Registers a breakpoint, installing the trap handler for the first.
  fn insert(&mut self, bp_addr: usize, slot: Slot) -> Result<()> {
    if self.slots.contains_key(&bp_addr) {
      return Err(Error::AlreadyPatched);
    }

    if self.slots.is_empty() {
      trap::install()?;
    }

    self.slots.insert(bp_addr, slot);
    Ok(())
  }

  /// Removes a breakpoint, uninstalling the trap handler after the last.
  fn remove(&mut self, bp_addr: usize) -> Option<Slot> {
    let slot = self.slots.remove(&bp_addr);

    if self.slots.is_empty() {
      trap::uninstall();
    }

    slot
  }
}

/// Resolves a trapped address to its stub, if the breakpoint is ours.
///
/// Called from the trap handler on an arbitrary thread.
pub(crate) fn dispatch(bp_addr: usize) -> Option<*const u8> {
  let registry = REGISTRY.lock().unwrap_or_else(|error| error.into_inner());
  registry.slots.get(&bp_addr).map(|slot| slot.stub)
}

/// An attachable INT3 breakpoint hook for one target function.
///
/// The patch detaches itself when dropped while active.
pub struct SwbpPatch {
  gid: u32,
  active: bool,
  saved_code: Vec<u8>,
  target: *mut *const (),
  detour: *const (),
  bp_addr: *const (),
  stub: Option<alloc::ExecutableMemory>,
  original_offset: usize,
}

impl SwbpPatch {
  /// Attaches a breakpoint hook redirecting `*target` to `detour`.
  ///
  /// As with the JMP engine, the cell behind `target` is read once and
  /// never written; redirection happens through the trap handler.
  pub unsafe fn attach(target: *mut *const (), detour: *const ()) -> Result<SwbpPatch> {
    let bp_addr = *target;

    if bp_addr == detour {
      return Err(Error::SameAddress);
    }

    let mut pool = memory::POOL.lock().unwrap();

    if !util::is_executable_address(bp_addr)? || !util::is_executable_address(detour)? {
      return Err(Error::NotExecutable);
    }

    memory::claim_site(bp_addr as usize)?;
    let result = Self::build(bp_addr, detour, target, &mut pool);

    if result.is_err() {
      memory::release_site(bp_addr as usize);
    }

    result
  }

  unsafe fn build(
    bp_addr: *const (),
    detour: *const (),
    target: *mut *const (),
    pool: &mut alloc::Allocator,
  ) -> Result<SwbpPatch> {
    // The breakpoint overwrites one byte, but the whole first instruction
    // must be preserved so it can be replayed out of line.
    let probe = decode::probe_min(bp_addr, 1)?;
    let saved_code = probe.as_slice().to_vec();

    // Stub layout: hand-off to the detour at offset zero, followed by the
    // displaced instruction and a jump to the rest of the function.
    let mut emitter = pic::CodeEmitter::new();
    let entry = thunk::jmp(detour as usize);
    let original_offset = entry.len();
    emitter.add_thunk(entry);
    emitter.add_thunk(Box::new(saved_code.clone()));
    emitter.add_thunk(thunk::jmp(bp_addr as usize + saved_code.len()));
    let stub = memory::allocate_code(pool, &emitter, bp_addr)?;

    let gid = NEXT_GID.fetch_add(1, Ordering::Relaxed);
    REGISTRY.lock().unwrap().insert(
      bp_addr as usize,
      Slot {
        gid,
        stub: stub.as_ptr(),
      },
    )?;

    if let Err(error) = memory::write_protected(bp_addr, &[thunk::BREAKPOINT]) {
      // Unwind the registration; the target is untouched
      REGISTRY.lock().unwrap().remove(bp_addr as usize);
      return Err(error);
    }

    debug!("swbp patch {} attached at {:p}", gid, bp_addr);

    Ok(SwbpPatch {
      gid,
      active: true,
      saved_code,
      target,
      detour,
      bp_addr,
      stub: Some(stub),
      original_offset,
    })
  }

  /// Detaches the hook, restoring the breakpoint byte and unregistering.
  pub unsafe fn detach(&mut self) -> Result<()> {
    if !self.active {
      return Err(Error::AlreadyDetached);
    }

    let _pool = memory::POOL.lock().unwrap();

    // Only the first byte of the saved instruction was overwritten
    memory::write_protected(self.bp_addr, &self.saved_code[..1])?;
    let slot = REGISTRY.lock().unwrap().remove(self.bp_addr as usize);
    debug_assert_eq!(slot.map(|slot| slot.gid), Some(self.gid));
    memory::release_site(self.bp_addr as usize);

    self.stub = None;
    self.active = false;
    debug!("swbp patch {} detached at {:p}", self.gid, self.bp_addr);
    Ok(())
  }

  /// Returns the process-unique identifier of this breakpoint.
  pub fn gid(&self) -> u32 {
    self.gid
  }

  /// Returns whether the patch is attached.
  pub fn is_active(&self) -> bool {
    self.active
  }

  /// Returns the breakpoint address.
  pub fn address(&self) -> *const () {
    self.bp_addr
  }

  /// Returns the out-of-line entry running the original behavior.
  ///
  /// Executes the displaced instruction and resumes after it, so the
  /// breakpoint is not hit again.
  pub fn original(&self) -> *const () {
    self
      .stub
      .as_ref()
      .map(|memory| unsafe { memory.as_ptr().add(self.original_offset) as *const () })
      .expect("stub of an inactive patch")
  }

  /// Writes a human-readable dump of the patch to stderr.
  pub fn dump(&self) {
    eprintln!("{}", self);
  }
}

impl Drop for SwbpPatch {
  /// Detaches the patch, if attached.
  fn drop(&mut self) {
    if self.active {
      unsafe { self.detach().expect("detaching swbp patch") };
    }
  }
}

impl fmt::Display for SwbpPatch {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    writeln!(f, "swbp patch")?;
    writeln!(f, "  gid:        {}", self.gid)?;
    writeln!(f, "  active:     {}", self.active)?;
    writeln!(f, "  target:     {:p}", self.target)?;
    writeln!(f, "  bp address: {:p}", self.bp_addr)?;
    writeln!(f, "  detour:     {:p}", self.detour)?;
    match &self.stub {
      Some(memory) => writeln!(f, "  stub:       {:p} ({} bytes)", memory.as_ptr(), memory.len())?,
      None => writeln!(f, "  stub:       (freed)")?,
    }
    write!(f, "  saved code:")?;
    for byte in &self.saved_code {
      write!(f, " {:02x}", byte)?;
    }
    Ok(())
  }
}

impl fmt::Debug for SwbpPatch {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(
      f,
      "SwbpPatch {{ gid: {}, active: {}, bp_addr: {:p} }}",
      self.gid, self.active, self.bp_addr
    )
  }
}

unsafe impl Send for SwbpPatch {}
unsafe impl Sync for SwbpPatch {}
