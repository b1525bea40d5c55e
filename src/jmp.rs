//! The inline JMP patch engine.
//!
//! Attaching overwrites the first whole instructions of a function with a
//! jump to the detour, and preserves the displaced instructions in a
//! trampoline that resumes at the first untouched instruction. Calls that
//! reach the original address run the detour; calling the trampoline runs
//! the original behavior.
//!
//! The prologue overwrite is not atomic beyond the bus width. A thread
//! executing inside the patch window while the write lands may fetch a torn
//! instruction stream; callers must quiesce such threads or accept the
//! window. See the crate documentation.
use crate::arch::{self, decode, thunk};
use crate::error::{Error, Result};
use crate::{alloc, memory, pic, util};
use log::debug;
use std::fmt;

/// An attachable inline JMP hook for one target function.
///
/// The patch detaches itself when dropped while active.
pub struct JmpPatch {
  active: bool,
  saved_code: Vec<u8>,
  target: *mut *const (),
  origin: *const (),
  trampoline: Option<alloc::ExecutableMemory>,
}

impl JmpPatch {
  /// Attaches a JMP hook redirecting `*target` to `detour`.
  ///
  /// `target` is a pointer to the cell holding the function address; the
  /// cell is read once and never written. Redirection happens by patching
  /// code at the address it contains.
  pub unsafe fn attach(target: *mut *const (), detour: *const ()) -> Result<JmpPatch> {
    let origin = *target;

    if origin == detour {
      return Err(Error::SameAddress);
    }

    // One attach or detach mutates code at a time
    let mut pool = memory::POOL.lock().unwrap();

    if !util::is_executable_address(origin)? || !util::is_executable_address(detour)? {
      return Err(Error::NotExecutable);
    }

    memory::claim_site(origin as usize)?;
    let result = Self::build(origin, detour, target, &mut pool);

    if result.is_err() {
      // Nothing has been written at this point; only the claim remains
      memory::release_site(origin as usize);
    }

    result
  }

  unsafe fn build(
    origin: *const (),
    detour: *const (),
    target: *mut *const (),
    pool: &mut alloc::Allocator,
  ) -> Result<JmpPatch> {
    // Prefer the five byte relative jump; fall back to the fourteen byte
    // absolute form for far detours in long mode.
    let displacement = (detour as isize).wrapping_sub(origin as isize);
    let patch_size = if arch::is_within_range(displacement) {
      thunk::JMP_REL32_SIZE
    } else if cfg!(target_arch = "x86_64") {
      thunk::JMP_ABS_SIZE
    } else {
      return Err(Error::UnreachableDetour);
    };

    // Cover the patch with whole instructions only
    let probe = decode::probe_min(origin, patch_size)?;
    let saved_code = probe.as_slice().to_vec();

    // The trampoline replays the displaced prologue, then resumes at the
    // first instruction the patch did not touch.
    let mut emitter = pic::CodeEmitter::new();
    emitter.add_thunk(Box::new(saved_code.clone()));
    emitter.add_thunk(thunk::jmp(origin as usize + saved_code.len()));
    let trampoline = memory::allocate_code(pool, &emitter, origin)?;

    // Jump to the detour, padding the displaced tail with nops
    let jump = if patch_size == thunk::JMP_REL32_SIZE {
      thunk::jmp_rel32(detour as usize)
    } else {
      thunk::jmp_abs(detour as usize)
    };
    let mut patch = jump.generate(origin as usize);
    patch.resize(saved_code.len(), 0x90);

    memory::write_protected(origin, &patch)?;
    debug!(
      "jmp patch attached at {:p} ({} bytes saved)",
      origin,
      saved_code.len()
    );

    Ok(JmpPatch {
      active: true,
      saved_code,
      target,
      origin,
      trampoline: Some(trampoline),
    })
  }

  /// Detaches the hook, restoring the original prologue byte for byte.
  pub unsafe fn detach(&mut self) -> Result<()> {
    if !self.active {
      return Err(Error::AlreadyDetached);
    }

    let _pool = memory::POOL.lock().unwrap();
    memory::write_protected(self.origin, &self.saved_code)?;
    memory::release_site(self.origin as usize);

    self.trampoline = None;
    self.active = false;
    debug!("jmp patch detached at {:p}", self.origin);
    Ok(())
  }

  /// Returns whether the patch is attached.
  pub fn is_active(&self) -> bool {
    self.active
  }

  /// Returns the address of the original function body.
  pub fn origin(&self) -> *const () {
    self.origin
  }

  /// Returns the trampoline running the original behavior.
  pub fn trampoline(&self) -> *const () {
    self
      .trampoline
      .as_ref()
      .map(|memory| memory.as_ptr() as *const ())
      .expect("trampoline of an inactive patch")
  }

  /// Writes a human-readable dump of the patch to stderr.
  pub fn dump(&self) {
    eprintln!("{}", self);
  }
}

impl Drop for JmpPatch {
  /// Detaches the patch, if attached.
  fn drop(&mut self) {
    if self.active {
      unsafe { self.detach().expect("detaching jmp patch") };
    }
  }
}

impl fmt::Display for JmpPatch {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    writeln!(f, "jmp patch")?;
    writeln!(f, "  active:     {}", self.active)?;
    writeln!(f, "  target:     {:p}", self.target)?;
    writeln!(f, "  origin:     {:p}", self.origin)?;
    match &self.trampoline {
      Some(memory) => writeln!(f, "  trampoline: {:p} ({} bytes)", memory.as_ptr(), memory.len())?,
      None => writeln!(f, "  trampoline: (freed)")?,
    }
    write!(f, "  saved code:")?;
    for byte in &self.saved_code {
      write!(f, " {:02x}", byte)?;
    }
    Ok(())
  }
}

impl fmt::Debug for JmpPatch {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    write!(
      f,
      "JmpPatch {{ active: {}, origin: {:p}, saved: {} }}",
      self.active,
      self.origin,
      self.saved_code.len()
    )
  }
}

unsafe impl Send for JmpPatch {}
unsafe impl Sync for JmpPatch {}
