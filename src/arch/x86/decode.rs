//! Minimal x86/x86_64 instruction boundary decoding.
//!
//! The patch engines overwrite whole instructions only, so they need the
//! *length* of each instruction at a target, never its semantics. This
//! module classifies lengths for the instruction forms compilers emit:
//! legacy prefixes, REX, one-/two-/three-byte opcode maps, ModRM/SIB with
//! all displacement widths (including RIP-relative), and per-opcode
//! immediates. Anything it cannot classify is reported as unsupported
//! rather than guessed, since a wrong length corrupts the target.
use crate::error::{Error, Result};
use std::slice;

/// The architectural upper bound on instruction length.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// The decoding mode, selecting 32- or 64-bit encoding rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
  /// 32-bit protected mode.
  Protected,
  /// 64-bit long mode.
  Long,
}

impl Mode {
  /// Returns the mode of the current process.
  pub fn native() -> Self {
    if cfg!(target_arch = "x86_64") {
      Mode::Long
    } else {
      Mode::Protected
    }
  }

  fn is_long(self) -> bool {
    self == Mode::Long
  }
}

/// A sequence of whole instructions covering a requested byte count.
#[derive(Debug)]
pub struct Probe {
  bytes: Vec<u8>,
}

impl Probe {
  /// Returns the probed instruction bytes.
  pub fn as_slice(&self) -> &[u8] {
    &self.bytes
  }

  /// Returns the total length of the probed instructions.
  pub fn len(&self) -> usize {
    self.bytes.len()
  }
}

/// Walks whole instructions at `address` until at least `min_bytes` are
/// covered, and returns a copy of the covered bytes.
///
/// The result never ends inside an instruction; it may exceed `min_bytes`
/// by the tail of the final instruction.
pub unsafe fn probe_min(address: *const (), min_bytes: usize) -> Result<Probe> {
  let mut total = 0;

  while total < min_bytes {
    let code = slice::from_raw_parts((address as usize + total) as *const u8, MAX_INSTRUCTION_LEN);
    total += instruction_length(code, Mode::native())?;
  }

  Ok(Probe {
    bytes: slice::from_raw_parts(address as *const u8, total).to_vec(),
  })
}

/// Returns the length of the instruction starting at `code[0]`.
///
/// Only prefix, opcode, ModRM and SIB bytes are inspected; displacement and
/// immediate bytes are counted without being read.
pub fn instruction_length(code: &[u8], mode: Mode) -> Result<usize> {
  let mut r = Reader::new(code);
  let mut operand_16 = false;
  let mut address_size = false;
  let mut rex_w = false;

  // Legacy prefixes, in any order and quantity
  loop {
    match r.peek()? {
      0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => r.bump(),
      0x66 => {
        operand_16 = true;
        r.bump();
      },
      0x67 => {
        address_size = true;
        r.bump();
      },
      _ => break,
    }
  }

  // A REX prefix is only such when it immediately precedes the opcode
  if mode.is_long() && (0x40..=0x4F).contains(&r.peek()?) {
    rex_w = r.peek()? & 0x08 != 0;
    r.bump();
  }

  // 16-bit addressing only exists outside of long mode
  let addr16 = address_size && !mode.is_long();

  // Immediate widths: `immz` follows the operand size (capped at 32 bits),
  // branch offsets ignore the operand-size override in long mode.
  let immz = if operand_16 { 2 } else { 4 };
  let branch = if mode.is_long() { 4 } else { immz };
  let moffs = match (mode.is_long(), address_size) {
    (true, false) => 8,
    (true, true) | (false, false) => 4,
    (false, true) => 2,
  };

  let opcode = r.next()?;
  let imm = match opcode {
    // ALU r/m forms: add, or, adc, sbb, and, sub, xor, cmp
    0x00..=0x03 | 0x08..=0x0B | 0x10..=0x13 | 0x18..=0x1B | 0x20..=0x23 | 0x28..=0x2B
    | 0x30..=0x33 | 0x38..=0x3B => {
      r.modrm(addr16)?;
      0
    },
    // ALU accumulator forms
    0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => 1,
    0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => immz,
    // Segment push/pop and BCD adjustments died with long mode
    0x06 | 0x07 | 0x0E | 0x16 | 0x17 | 0x1E | 0x1F | 0x27 | 0x2F | 0x37 | 0x3F => {
      legacy(mode)?;
      0
    },
    // inc/dec r32 in protected mode; consumed above as REX in long mode
    0x40..=0x4F => {
      legacy(mode)?;
      0
    },
    // push/pop r
    0x50..=0x5F => 0,
    0x60 | 0x61 => {
      legacy(mode)?;
      0
    },
    // bound in protected mode; the EVEX prefix in long mode
    0x62 => {
      legacy(mode)?;
      r.modrm(addr16)?;
      0
    },
    // arpl / movsxd
    0x63 => {
      r.modrm(addr16)?;
      0
    },
    0x68 => immz,
    0x69 => {
      r.modrm(addr16)?;
      immz
    },
    0x6A => 1,
    0x6B => {
      r.modrm(addr16)?;
      1
    },
    // ins/outs
    0x6C..=0x6F => 0,
    // jcc rel8
    0x70..=0x7F => 1,
    0x80 => {
      r.modrm(addr16)?;
      1
    },
    0x81 => {
      r.modrm(addr16)?;
      immz
    },
    0x82 => {
      legacy(mode)?;
      r.modrm(addr16)?;
      1
    },
    0x83 => {
      r.modrm(addr16)?;
      1
    },
    // test, xchg, mov, lea, mov sreg, pop r/m
    0x84..=0x8F => {
      r.modrm(addr16)?;
      0
    },
    // nop/xchg r, cbw, cwd
    0x90..=0x99 => 0,
    // call far ptr16:z
    0x9A => {
      legacy(mode)?;
      immz + 2
    },
    0x9B..=0x9F => 0,
    // mov accumulator ↔ memory offset
    0xA0..=0xA3 => moffs,
    0xA4..=0xA7 => 0,
    0xA8 => 1,
    0xA9 => immz,
    0xAA..=0xAF => 0,
    // mov r8, imm8
    0xB0..=0xB7 => 1,
    // mov r, imm — the only 64-bit immediate in the ISA
    0xB8..=0xBF => {
      if rex_w {
        8
      } else {
        immz
      }
    },
    0xC0 | 0xC1 => {
      r.modrm(addr16)?;
      1
    },
    // ret imm16
    0xC2 => 2,
    0xC3 => 0,
    // les/lds in protected mode; VEX prefixes in long mode
    0xC4 | 0xC5 => {
      legacy(mode)?;
      r.modrm(addr16)?;
      0
    },
    0xC6 => {
      r.modrm(addr16)?;
      1
    },
    0xC7 => {
      r.modrm(addr16)?;
      immz
    },
    // enter imm16, imm8
    0xC8 => 3,
    0xC9 => 0,
    // retf imm16 / retf
    0xCA => 2,
    0xCB => 0,
    // int3
    0xCC => 0,
    0xCD => 1,
    0xCE => {
      legacy(mode)?;
      0
    },
    0xCF => 0,
    // shift/rotate groups
    0xD0..=0xD3 => {
      r.modrm(addr16)?;
      0
    },
    // aam/aad
    0xD4 | 0xD5 => {
      legacy(mode)?;
      1
    },
    0xD6 => {
      legacy(mode)?;
      0
    },
    0xD7 => 0,
    // x87 escape range
    0xD8..=0xDF => {
      r.modrm(addr16)?;
      0
    },
    // loopcc, jcxz, in/out imm8
    0xE0..=0xE7 => 1,
    // call/jmp rel
    0xE8 | 0xE9 => branch,
    // jmp far ptr16:z
    0xEA => {
      legacy(mode)?;
      immz + 2
    },
    0xEB => 1,
    0xEC..=0xEF => 0,
    0xF1 => 0,
    0xF4 | 0xF5 => 0,
    // group 3: test carries an immediate, the rest do not
    0xF6 => {
      let modrm = r.modrm(addr16)?;
      if modrm >> 3 & 0b111 <= 1 {
        1
      } else {
        0
      }
    },
    0xF7 => {
      let modrm = r.modrm(addr16)?;
      if modrm >> 3 & 0b111 <= 1 {
        immz
      } else {
        0
      }
    },
    0xF8..=0xFD => 0,
    0xFE | 0xFF => {
      r.modrm(addr16)?;
      0
    },
    0x0F => two_byte(&mut r, addr16, branch)?,
    // A prefix byte in opcode position (e.g. a prefix after REX)
    _ => return Err(Error::UnsupportedInstruction),
  };

  r.skip(imm)?;

  if r.index > MAX_INSTRUCTION_LEN {
    return Err(Error::UnsupportedInstruction);
  }

  Ok(r.index)
}

/// Classifies the 0x0F escape maps; returns the immediate width.
fn two_byte(r: &mut Reader, addr16: bool, branch: usize) -> Result<usize> {
  let opcode = r.next()?;
  let imm = match opcode {
    // System descriptor-table group, lar, lsl
    0x00..=0x03 => {
      r.modrm(addr16)?;
      0
    },
    // syscall, clts, sysret, invd, wbinvd, ud2
    0x05..=0x09 | 0x0B => 0,
    // prefetch
    0x0D => {
      r.modrm(addr16)?;
      0
    },
    // SSE moves, hint-nop space (incl. endbr), control registers
    0x10..=0x23 | 0x28..=0x2F => {
      r.modrm(addr16)?;
      0
    },
    // wrmsr, rdtsc, rdmsr, rdpmc, sysenter, sysexit
    0x30..=0x35 => 0,
    // 0F 38 map: ModRM, no immediates
    0x38 => {
      r.next()?;
      r.modrm(addr16)?;
      0
    },
    // 0F 3A map: ModRM plus imm8
    0x3A => {
      r.next()?;
      r.modrm(addr16)?;
      1
    },
    // cmovcc, SSE/MMX arithmetic
    0x40..=0x6F => {
      r.modrm(addr16)?;
      0
    },
    // pshuf*, packed shift groups
    0x70..=0x73 => {
      r.modrm(addr16)?;
      1
    },
    0x74..=0x76 => {
      r.modrm(addr16)?;
      0
    },
    // emms
    0x77 => 0,
    0x78 | 0x79 | 0x7C..=0x7F => {
      r.modrm(addr16)?;
      0
    },
    // jcc rel32
    0x80..=0x8F => branch,
    // setcc
    0x90..=0x9F => {
      r.modrm(addr16)?;
      0
    },
    // push/pop fs, cpuid
    0xA0..=0xA2 => 0,
    0xA3 => {
      r.modrm(addr16)?;
      0
    },
    // shld imm8
    0xA4 => {
      r.modrm(addr16)?;
      1
    },
    0xA5 => {
      r.modrm(addr16)?;
      0
    },
    // push/pop gs, rsm
    0xA8..=0xAA => 0,
    // shrd imm8
    0xAC => {
      r.modrm(addr16)?;
      1
    },
    0xAB | 0xAD..=0xAF => {
      r.modrm(addr16)?;
      0
    },
    // cmpxchg through movzx, popcnt, ud1
    0xB0..=0xB9 => {
      r.modrm(addr16)?;
      0
    },
    // bt group imm8
    0xBA => {
      r.modrm(addr16)?;
      1
    },
    0xBB..=0xBF => {
      r.modrm(addr16)?;
      0
    },
    0xC0 | 0xC1 | 0xC3 | 0xC7 => {
      r.modrm(addr16)?;
      0
    },
    // cmpps, pinsrw, pextrw, shufps
    0xC2 | 0xC4..=0xC6 => {
      r.modrm(addr16)?;
      1
    },
    // bswap
    0xC8..=0xCF => 0,
    // MMX/SSE arithmetic
    0xD0..=0xFE => {
      r.modrm(addr16)?;
      0
    },
    // 3DNow!, undefined slots, ud0
    _ => return Err(Error::UnsupportedInstruction),
  };

  Ok(imm)
}

/// Fails in long mode; the encoding only exists in protected mode.
fn legacy(mode: Mode) -> Result<()> {
  if mode.is_long() {
    Err(Error::UnsupportedInstruction)
  } else {
    Ok(())
  }
}

/// A bounds-checked cursor over the instruction bytes.
struct Reader<'a> {
  code: &'a [u8],
  index: usize,
}

impl<'a> Reader<'a> {
  fn new(code: &'a [u8]) -> Self {
    Reader { code, index: 0 }
  }

  fn peek(&self) -> Result<u8> {
    self
      .code
      .get(self.index)
      .copied()
      .ok_or(Error::UnsupportedInstruction)
  }

  fn bump(&mut self) {
    self.index += 1;
  }

  fn next(&mut self) -> Result<u8> {
    let byte = self.peek()?;
    self.bump();
    Ok(byte)
  }

  /// Advances past `count` bytes without reading them.
  fn skip(&mut self, count: usize) -> Result<()> {
    if self.index + count > self.code.len() {
      return Err(Error::UnsupportedInstruction);
    }

    self.index += count;
    Ok(())
  }

  /// Consumes a ModRM byte plus any SIB and displacement, returning the
  /// ModRM byte for callers that dispatch on its register field.
  fn modrm(&mut self, addr16: bool) -> Result<u8> {
    let modrm = self.next()?;
    let md = modrm >> 6;
    let rm = modrm & 0b111;

    // Register-direct operands carry no displacement
    if md == 0b11 {
      return Ok(modrm);
    }

    if addr16 {
      match (md, rm) {
        (0b00, 0b110) => self.skip(2)?,
        (0b01, _) => self.skip(1)?,
        (0b10, _) => self.skip(2)?,
        _ => {},
      }
    } else {
      if rm == 0b100 {
        let sib = self.next()?;
        // A base of 101 under mod 00 means an explicit disp32
        if md == 0b00 && sib & 0b111 == 0b101 {
          self.skip(4)?;
        }
      }

      match md {
        // disp32, or RIP-relative in long mode
        0b00 if rm == 0b101 => self.skip(4)?,
        0b01 => self.skip(1)?,
        0b10 => self.skip(4)?,
        _ => {},
      }
    }

    Ok(modrm)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::Error;
  use matches::assert_matches;

  fn long(code: &[u8]) -> Result<usize> {
    instruction_length(code, Mode::Long)
  }

  fn protected(code: &[u8]) -> Result<usize> {
    instruction_length(code, Mode::Protected)
  }

  #[test]
  fn single_byte_instructions() {
    assert_eq!(long(&[0x55]).unwrap(), 1); // push rbp
    assert_eq!(long(&[0xC3]).unwrap(), 1); // ret
    assert_eq!(long(&[0x90]).unwrap(), 1); // nop
    assert_eq!(long(&[0xCC]).unwrap(), 1); // int3
  }

  #[test]
  fn modrm_register_forms() {
    assert_eq!(long(&[0x48, 0x89, 0xE5]).unwrap(), 3); // mov rbp, rsp
    assert_eq!(long(&[0x31, 0xC0]).unwrap(), 2); // xor eax, eax
    assert_eq!(long(&[0x48, 0x83, 0xEC, 0x28]).unwrap(), 4); // sub rsp, 0x28
  }

  #[test]
  fn immediates() {
    assert_eq!(long(&[0xB8, 0x2A, 0, 0, 0]).unwrap(), 5); // mov eax, imm32
    assert_eq!(long(&[0x66, 0xB8, 0x2A, 0]).unwrap(), 4); // mov ax, imm16
    assert_eq!(long(&[0x48, 0xB8, 1, 2, 3, 4, 5, 6, 7, 8]).unwrap(), 10); // mov rax, imm64
    assert_eq!(long(&[0x6A, 0x10]).unwrap(), 2); // push imm8
    assert_eq!(long(&[0xC2, 0x08, 0x00]).unwrap(), 3); // ret imm16
    assert_eq!(long(&[0xC8, 0x20, 0x00, 0x00]).unwrap(), 4); // enter
  }

  #[test]
  fn group_3_immediates_depend_on_register_field() {
    assert_eq!(long(&[0xF7, 0xC0, 1, 0, 0, 0]).unwrap(), 6); // test eax, imm32
    assert_eq!(long(&[0xF7, 0xD8]).unwrap(), 2); // neg eax
    assert_eq!(long(&[0xF6, 0xC1, 0x01]).unwrap(), 3); // test cl, imm8
  }

  #[test]
  fn sib_and_displacement_forms() {
    assert_eq!(long(&[0x4C, 0x8B, 0x54, 0x24, 0x08]).unwrap(), 5); // mov r10, [rsp+8]
    assert_eq!(long(&[0x8B, 0x04, 0x8D, 0, 0, 0, 0]).unwrap(), 7); // mov eax, [rcx*4+disp32]
    assert_eq!(long(&[0x89, 0x85, 0x40, 0x01, 0, 0]).unwrap(), 6); // mov [rbp+disp32], eax
    assert_eq!(long(&[0x88, 0x47, 0x18]).unwrap(), 3); // mov [rdi+0x18], al
  }

  #[test]
  fn rip_relative_operands() {
    assert_eq!(long(&[0x48, 0x8B, 0x05, 0, 0, 0, 0]).unwrap(), 7); // mov rax, [rip+d32]
    assert_eq!(long(&[0xFF, 0x25, 0, 0, 0, 0]).unwrap(), 6); // jmp [rip+d32]
    assert_eq!(long(&[0x80, 0x3D, 0, 0, 0, 0, 0x01]).unwrap(), 7); // cmp byte [rip+d32], 1
  }

  #[test]
  fn relative_branches() {
    assert_eq!(long(&[0xE9, 0, 0, 0, 0]).unwrap(), 5); // jmp rel32
    assert_eq!(long(&[0xE8, 0, 0, 0, 0]).unwrap(), 5); // call rel32
    assert_eq!(long(&[0x74, 0x05]).unwrap(), 2); // jz rel8
    assert_eq!(long(&[0x0F, 0x84, 0, 0, 0, 0]).unwrap(), 6); // jz rel32
    // Branch offsets stay 32-bit in long mode despite the operand override
    assert_eq!(long(&[0x66, 0xE9, 0, 0, 0, 0]).unwrap(), 6);
    assert_eq!(protected(&[0x66, 0xE9, 0, 0]).unwrap(), 4); // jmp rel16
  }

  #[test]
  fn two_and_three_byte_opcodes() {
    assert_eq!(long(&[0xF3, 0x0F, 0x1E, 0xFA]).unwrap(), 4); // endbr64
    assert_eq!(long(&[0x0F, 0xAF, 0xC3]).unwrap(), 3); // imul eax, ebx
    assert_eq!(long(&[0x0F, 0xB6, 0xC0]).unwrap(), 3); // movzx eax, al
    assert_eq!(long(&[0x0F, 0x05]).unwrap(), 2); // syscall
    assert_eq!(long(&[0x66, 0x0F, 0x38, 0x00, 0xC1]).unwrap(), 5); // pshufb
    assert_eq!(long(&[0x66, 0x0F, 0x3A, 0x0F, 0xC1, 0x08]).unwrap(), 6); // palignr
    assert_eq!(long(&[0x0F, 0x70, 0xC1, 0x1B]).unwrap(), 4); // pshufw imm8
  }

  #[test]
  fn segment_and_rex_prefix_stacking() {
    // mov rax, fs:[disp32]
    assert_eq!(long(&[0x64, 0x48, 0x8B, 0x04, 0x25, 0, 0, 0, 0]).unwrap(), 9);
    // lock add [rcx], eax
    assert_eq!(long(&[0xF0, 0x01, 0x01]).unwrap(), 3);
  }

  #[test]
  fn memory_offset_forms() {
    assert_eq!(protected(&[0xA1, 0, 0, 0, 0]).unwrap(), 5); // mov eax, moffs32
    assert_eq!(long(&[0x48, 0xA1, 0, 0, 0, 0, 0, 0, 0, 0]).unwrap(), 10); // mov rax, moffs64
  }

  #[test]
  fn sixteen_bit_addressing_is_protected_mode_only() {
    // mov eax, [bp+si] carries a disp16 under 16-bit addressing
    assert_eq!(protected(&[0x67, 0x8B, 0x06, 0x10, 0x20]).unwrap(), 5);
    // The same override in long mode selects 32-bit addressing instead
    assert_eq!(long(&[0x67, 0x8B, 0x06]).unwrap(), 3);
  }

  #[test]
  fn mode_gated_encodings() {
    assert_eq!(protected(&[0x06]).unwrap(), 1); // push es
    assert_matches!(long(&[0x06]), Err(Error::UnsupportedInstruction));
    assert_eq!(protected(&[0x40]).unwrap(), 1); // inc eax
    assert_eq!(protected(&[0x9A, 0, 0, 0, 0, 0, 0]).unwrap(), 7); // call far
    assert_matches!(long(&[0x9A, 0, 0, 0, 0, 0, 0]), Err(Error::UnsupportedInstruction));
  }

  #[test]
  fn unclassifiable_bytes_are_rejected() {
    assert_matches!(long(&[0x0F, 0x04]), Err(Error::UnsupportedInstruction));
    assert_matches!(long(&[0x0F, 0xFF, 0xC0]), Err(Error::UnsupportedInstruction)); // ud0
    // A dangling prefix with no opcode
    assert_matches!(long(&[0x66]), Err(Error::UnsupportedInstruction));
  }

  #[test]
  fn truncated_buffers_are_rejected() {
    assert_matches!(long(&[0xE9, 0, 0]), Err(Error::UnsupportedInstruction));
    assert_matches!(long(&[0x48, 0x8B]), Err(Error::UnsupportedInstruction));
  }

  // Padded so probes stay within the arrays
  static PROLOG: [u8; 32] = [
    0x55, // push rbp
    0x48, 0x89, 0xE5, // mov rbp, rsp
    0xB8, 0x2A, 0x00, 0x00, 0x00, // mov eax, 42
    0x5D, // pop rbp
    0xC3, // ret
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
    0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
  ];

  #[test]
  #[cfg(target_arch = "x86_64")]
  fn probe_covers_whole_instructions() {
    let probe = unsafe { probe_min(PROLOG.as_ptr() as *const (), 5) }.unwrap();

    // push + mov only cover four bytes, so the five byte mov is included
    assert_eq!(probe.len(), 9);
    assert_eq!(probe.as_slice(), &PROLOG[..9]);
  }

  #[test]
  #[cfg(target_arch = "x86_64")]
  fn probe_stops_at_exact_boundary() {
    let probe = unsafe { probe_min(PROLOG.as_ptr() as *const (), 4) }.unwrap();
    assert_eq!(probe.len(), 4);
  }

  #[test]
  #[cfg(target_arch = "x86_64")]
  fn probe_of_one_byte_yields_one_instruction() {
    let probe = unsafe { probe_min(PROLOG.as_ptr().wrapping_add(4) as *const (), 1) }.unwrap();

    // The instruction at offset 4 is the five byte mov
    assert_eq!(probe.len(), 5);
    assert_eq!(probe.as_slice(), &PROLOG[4..9]);
  }

  #[test]
  #[cfg(target_arch = "x86_64")]
  fn probe_rejects_undecodable_code() {
    static BOGUS: [u8; 16] = [
      0x0F, 0x04, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
      0x90,
    ];
    let result = unsafe { probe_min(BOGUS.as_ptr() as *const (), 5) };
    assert_matches!(result, Err(Error::UnsupportedInstruction));
  }
}
