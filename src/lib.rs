//! A function hooking library for x86/x86_64 Linux and Windows.
//!
//! ## Intro
//!
//! This library redirects execution of a function to a replacement (a
//! "detour") at runtime, by patching the target's machine code in place,
//! and restores the original behavior on detach. Two engines are provided:
//!
//! - [JmpPatch](./struct.JmpPatch.html): overwrites the function prologue
//!   with a jump to the detour. The displaced instructions are preserved in
//!   a trampoline, so the original behavior stays callable while the hook
//!   is active.
//!
//! - [SwbpPatch](./struct.SwbpPatch.html): overwrites a single byte with a
//!   breakpoint opcode (`int3`). A process-wide trap handler redirects the
//!   resulting exception to the detour through a generated stub. Slower per
//!   call, but the patch is one byte and works where no prologue can be
//!   displaced.
//!
//! Both engines share an instruction boundary decoder that measures whole
//! instructions at the target, so a patch never ends inside an encoding.
//! The decoder classifies lengths only; it is not a disassembler.
//!
//! ## Procedure
//!
//! To illustrate on an x86 platform:
//!
//! ```c
//! 0 int return_five() {
//! 1     return 5;
//! 00400020 [b8 05 00 00 00] mov eax, 5
//! 00400025 [c3]             ret
//! 2 }
//! 3
//! 4 int detour_function() {
//! 5     return 10;
//! 00400040 [b8 0A 00 00 00] mov eax, 10
//! 00400045 [c3]             ret
//! 6 }
//! ```
//!
//! Attaching a `JmpPatch` to `return_five` replaces its first five bytes
//! with `jmp detour_function` and copies the displaced `mov` into a
//! trampoline that jumps back to `00400025`. Attaching a `SwbpPatch`
//! instead writes `cc` over the `b8` and registers `00400020` with the
//! trap handler.
//!
//! ## Caveats
//!
//! - A multi-byte JMP patch is not written atomically. A thread executing
//!   inside the first instructions of the target while attach or detach
//!   lands can fetch a torn instruction stream. Pause such threads around
//!   the operation, or accept the window; the engine does not solve this.
//! - Displaced prologue instructions are copied verbatim. A target whose
//!   patch window contains position-dependent code (RIP-relative operands,
//!   relative branches) will misbehave when invoked through the trampoline.
//! - Hooks do not stack: one active patch per address, of either kind.

// Re-exports
pub use crate::error::{Error, Result};
pub use crate::jmp::JmpPatch;
pub use crate::swbp::SwbpPatch;

// Modules
pub mod error;
mod alloc;
mod arch;
mod jmp;
mod memory;
mod pic;
mod swbp;
mod trap;
mod util;
