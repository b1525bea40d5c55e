//! Jump and breakpoint encodings written into patched code.
#![allow(dead_code)]

use crate::pic::{FixedThunk, Thunkable};
use generic_array::{typenum, GenericArray};
use std::mem;

/// The breakpoint opcode (`int3`).
pub const BREAKPOINT: u8 = 0xCC;

/// The size of a relative 32-bit jump.
pub const JMP_REL32_SIZE: usize = mem::size_of::<JumpRel>();

/// The size of an absolute indirect jump.
pub const JMP_ABS_SIZE: usize = mem::size_of::<JumpAbs>();

#[repr(packed)]
struct JumpRel {
  opcode: u8,
  operand: u32,
}

/// Constructs a relative 32-bit jump.
///
/// The displacement is computed against the address the thunk is emitted
/// at, which must lie within ±2 GiB of the destination.
pub fn jmp_rel32(destination: usize) -> Box<dyn Thunkable> {
  const JMP: u8 = 0xE9;

  Box::new(FixedThunk::<typenum::U5>::new(move |source| {
    let code = JumpRel {
      opcode: JMP,
      operand: displacement(source, destination, mem::size_of::<JumpRel>()),
    };

    let slice: [u8; 5] = unsafe { mem::transmute(code) };
    GenericArray::clone_from_slice(&slice)
  }))
}

#[repr(packed)]
struct JumpAbs {
  // jmp [rip+0]
  opcode0: u8,
  opcode1: u8,
  dummy: u32,
  // destination, fetched through the rip-relative slot above
  address: u64,
}

/// Constructs an absolute indirect jump (64-bit only).
///
/// Fourteen bytes, reaches any address, position-independent.
pub fn jmp_abs(destination: usize) -> Box<dyn Thunkable> {
  let code = JumpAbs {
    opcode0: 0xFF,
    opcode1: 0x25,
    dummy: 0x0000_0000,
    address: destination as u64,
  };

  let slice: [u8; 14] = unsafe { mem::transmute(code) };
  Box::new(slice.to_vec())
}

/// Constructs the widest jump available for the current mode.
///
/// Used where reachability of the destination is unknown: trampolines and
/// stubs jump back into the target function through this.
pub fn jmp(destination: usize) -> Box<dyn Thunkable> {
  if cfg!(target_arch = "x86_64") {
    jmp_abs(destination)
  } else {
    jmp_rel32(destination)
  }
}

/// Calculates the operand for a relative jump.
fn displacement(source: usize, destination: usize, instruction_size: usize) -> u32 {
  let displacement =
    (destination as isize).wrapping_sub(source as isize + instruction_size as isize);

  // Reachability is the caller's contract; on x86 the arithmetic wraps.
  #[cfg(target_arch = "x86_64")]
  assert!(crate::arch::is_within_range(displacement));

  displacement as u32
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn rel32_encodes_forward_displacement() {
    let thunk = jmp_rel32(0x1010);
    let code = thunk.generate(0x1000);

    // 0x1010 - (0x1000 + 5) = 0x0B
    assert_eq!(code, vec![0xE9, 0x0B, 0x00, 0x00, 0x00]);
    assert_eq!(thunk.len(), JMP_REL32_SIZE);
  }

  #[test]
  fn rel32_encodes_backward_displacement() {
    let thunk = jmp_rel32(0x1000);
    let code = thunk.generate(0x2000);

    let operand = i32::from_le_bytes([code[1], code[2], code[3], code[4]]);
    assert_eq!(operand, 0x1000 - (0x2000 + 5));
  }

  #[test]
  #[cfg(target_arch = "x86_64")]
  fn abs_encodes_destination_inline() {
    let thunk = jmp_abs(0x1122_3344_5566_7788);
    let code = thunk.generate(0xDEAD_0000);

    assert_eq!(thunk.len(), JMP_ABS_SIZE);
    assert_eq!(&code[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    assert_eq!(
      u64::from_le_bytes([code[6], code[7], code[8], code[9], code[10], code[11], code[12], code[13]]),
      0x1122_3344_5566_7788
    );
  }
}
