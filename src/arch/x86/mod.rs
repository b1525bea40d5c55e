pub mod decode;
pub mod thunk;

/// The furthest distance between a patch site and its jump destination (2 GiB).
pub const JUMP_RANGE: usize = 0x8000_0000;
