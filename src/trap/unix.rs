//! SIGTRAP dispatch via `sigaction`.
use crate::error::{Error, Result};
use crate::swbp;
use std::mem;
use std::ptr;
use std::sync::Mutex;

/// The disposition that was active before ours, for chaining.
static PREVIOUS: Mutex<Option<libc::sigaction>> = Mutex::new(None);

/// Installs the SIGTRAP handler, remembering the previous disposition.
pub fn install() -> Result<()> {
  unsafe {
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = handler as usize;
    action.sa_flags = libc::SA_SIGINFO;
    libc::sigemptyset(&mut action.sa_mask);

    let mut previous: libc::sigaction = mem::zeroed();
    if libc::sigaction(libc::SIGTRAP, &action, &mut previous) != 0 {
      return Err(Error::TrapHandlerFailure);
    }

    *PREVIOUS.lock().unwrap() = Some(previous);
  }

  Ok(())
}

/// Restores the previous SIGTRAP disposition.
pub fn uninstall() {
  unsafe {
    if let Some(previous) = PREVIOUS.lock().unwrap().take() {
      libc::sigaction(libc::SIGTRAP, &previous, ptr::null_mut());
    }
  }
}

/// The process-wide SIGTRAP handler.
///
/// An `int3` reports the instruction pointer one past the breakpoint byte,
/// so the registry is keyed one below the trapped address.
extern "C" fn handler(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
  unsafe {
    let ucontext = &mut *(context as *mut libc::ucontext_t);

    #[cfg(target_arch = "x86_64")]
    {
      let ip = ucontext.uc_mcontext.gregs[libc::REG_RIP as usize];
      if let Some(stub) = swbp::dispatch((ip as usize).wrapping_sub(1)) {
        ucontext.uc_mcontext.gregs[libc::REG_RIP as usize] = stub as i64;
        return;
      }
    }

    #[cfg(target_arch = "x86")]
    {
      let ip = ucontext.uc_mcontext.gregs[libc::REG_EIP as usize];
      if let Some(stub) = swbp::dispatch((ip as usize).wrapping_sub(1)) {
        ucontext.uc_mcontext.gregs[libc::REG_EIP as usize] = stub as i32;
        return;
      }
    }

    // Not ours; hand the trap to whoever owned SIGTRAP before us
    forward(signal, info, context);
  }
}

/// Chains a foreign trap to the previously installed disposition.
unsafe fn forward(signal: libc::c_int, info: *mut libc::siginfo_t, context: *mut libc::c_void) {
  let previous = PREVIOUS
    .lock()
    .unwrap_or_else(|error| error.into_inner())
    .clone();

  match previous {
    Some(action) if action.sa_sigaction == libc::SIG_IGN => (),
    Some(action) if action.sa_sigaction != libc::SIG_DFL => {
      if action.sa_flags & libc::SA_SIGINFO != 0 {
        let callback: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
          mem::transmute(action.sa_sigaction);
        callback(signal, info, context);
      } else {
        let callback: extern "C" fn(libc::c_int) = mem::transmute(action.sa_sigaction);
        callback(signal);
      }
    },
    _ => {
      // Restore the default disposition and let the trap terminate the
      // process as it would have without this engine
      let mut action: libc::sigaction = mem::zeroed();
      action.sa_sigaction = libc::SIG_DFL;
      libc::sigaction(libc::SIGTRAP, &action, ptr::null_mut());
      libc::raise(libc::SIGTRAP);
    },
  }
}
