//! Architecture specific code.
//!
//! An architecture module exposes:
//!
//! - A `decode` module that classifies instruction lengths, so patches
//!   always cover whole instructions.
//! - A `thunk` module that emits the jump and breakpoint encodings the
//!   patch engines write into code.
//! - A `JUMP_RANGE` constant bounding how far a relative jump reaches.
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        mod x86;
        pub use self::x86::{decode, thunk, JUMP_RANGE};
    } else {
        compile_error!("this crate only supports x86 and x86_64");
    }
}

/// Returns true if the displacement is reachable by a relative jump.
pub fn is_within_range(displacement: isize) -> bool {
  let range = JUMP_RANGE as i64;
  (-range..range).contains(&(displacement as i64))
}
