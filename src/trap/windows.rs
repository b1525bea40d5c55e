//! Breakpoint dispatch via vectored exception handling.
use crate::error::{Error, Result};
use crate::swbp;
use std::sync::Mutex;
use winapi::ctypes::c_void;
use winapi::um::errhandlingapi::{AddVectoredExceptionHandler, RemoveVectoredExceptionHandler};
use winapi::um::minwinbase::EXCEPTION_BREAKPOINT;
use winapi::um::winnt::EXCEPTION_POINTERS;

const EXCEPTION_CONTINUE_EXECUTION: i32 = -1;
const EXCEPTION_CONTINUE_SEARCH: i32 = 0;

/// The registration returned by the OS, needed for removal.
static HANDLE: Mutex<Option<usize>> = Mutex::new(None);

/// Registers the handler first in the vectored handler chain.
pub fn install() -> Result<()> {
  let handle = unsafe { AddVectoredExceptionHandler(1, Some(handler)) };

  if handle.is_null() {
    return Err(Error::TrapHandlerFailure);
  }

  *HANDLE.lock().unwrap() = Some(handle as usize);
  Ok(())
}

/// Removes the handler from the vectored handler chain.
pub fn uninstall() {
  if let Some(handle) = HANDLE.lock().unwrap().take() {
    unsafe { RemoveVectoredExceptionHandler(handle as *mut c_void) };
  }
}

/// The process-wide vectored exception handler.
///
/// A breakpoint exception reports the instruction pointer at the `int3`
/// itself, so the context address keys the registry directly. Unregistered
/// exceptions continue down the handler chain untouched.
unsafe extern "system" fn handler(pointers: *mut EXCEPTION_POINTERS) -> i32 {
  let record = &*(*pointers).ExceptionRecord;

  if record.ExceptionCode != EXCEPTION_BREAKPOINT {
    return EXCEPTION_CONTINUE_SEARCH;
  }

  let context = &mut *(*pointers).ContextRecord;

  #[cfg(target_arch = "x86_64")]
  {
    if let Some(stub) = swbp::dispatch(context.Rip as usize) {
      context.Rip = stub as u64;
      return EXCEPTION_CONTINUE_EXECUTION;
    }
  }

  #[cfg(target_arch = "x86")]
  {
    if let Some(stub) = swbp::dispatch(context.Eip as usize) {
      context.Eip = stub as u32;
      return EXCEPTION_CONTINUE_EXECUTION;
    }
  }

  EXCEPTION_CONTINUE_SEARCH
}
