//! Error types for all hooking operations.
use std::error::Error as StdError;
use std::fmt;

/// The result of a hooking operation.
pub type Result<T> = ::std::result::Result<T, Error>;

/// A collection of possible errors.
#[derive(Debug)]
pub enum Error {
  /// The instruction decoder cannot classify the bytes at the target.
  UnsupportedInstruction,
  /// The address does not lie within an executable memory region.
  NotExecutable,
  /// The target and detour share the same address.
  SameAddress,
  /// No jump encoding can span from the target to the detour.
  UnreachableDetour,
  /// A hook is already active at this address.
  AlreadyPatched,
  /// The patch has already been detached.
  AlreadyDetached,
  /// No executable memory could be obtained.
  OutOfMemory,
  /// The OS trap handler could not be installed.
  TrapHandlerFailure,
  /// A memory protection operation was denied by the OS.
  RegionFailure(region::Error),
}

impl fmt::Display for Error {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Error::UnsupportedInstruction => write!(f, "target contains an unsupported instruction"),
      Error::NotExecutable => write!(f, "address is not executable"),
      Error::SameAddress => write!(f, "target and detour address are the same"),
      Error::UnreachableDetour => write!(f, "detour is out of range for any jump encoding"),
      Error::AlreadyPatched => write!(f, "a hook is already active at this address"),
      Error::AlreadyDetached => write!(f, "the patch is not active"),
      Error::OutOfMemory => write!(f, "cannot allocate executable memory"),
      Error::TrapHandlerFailure => write!(f, "cannot install the trap handler"),
      Error::RegionFailure(error) => write!(f, "memory protection failure: {}", error),
    }
  }
}

impl StdError for Error {
  fn source(&self) -> Option<&(dyn StdError + 'static)> {
    match self {
      Error::RegionFailure(error) => Some(error),
      _ => None,
    }
  }
}

impl From<region::Error> for Error {
  fn from(error: region::Error) -> Self {
    Error::RegionFailure(error)
  }
}
