//! Position-independent code composition.
//!
//! Trampolines and breakpoint stubs are assembled from small segments
//! ("thunks") whose final encoding may depend on where the code ends up in
//! memory. A [`CodeEmitter`] collects thunks and emits the combined block
//! once the allocation address is known.
pub use self::emitter::CodeEmitter;

use generic_array::{ArrayLength, GenericArray};

mod emitter;

/// An interface for position-independent code segments.
pub trait Thunkable {
  /// Generates the code for the specified address.
  fn generate(&self, address: usize) -> Vec<u8>;

  /// Returns the size of the generated code.
  fn len(&self) -> usize;
}

/// Static data is itself position-independent.
impl Thunkable for Vec<u8> {
  fn generate(&self, _address: usize) -> Vec<u8> {
    self.clone()
  }

  fn len(&self) -> usize {
    self.len()
  }
}

/// A closure that generates a thunk of compile-time known size.
pub struct FixedThunk<N: ArrayLength<u8>>(Box<dyn Fn(usize) -> GenericArray<u8, N> + Send>);

impl<N: ArrayLength<u8>> FixedThunk<N> {
  /// Constructs a new thunk from a generator closure.
  pub fn new<T: Fn(usize) -> GenericArray<u8, N> + Send + 'static>(callback: T) -> Self {
    FixedThunk(Box::new(callback))
  }
}

impl<N: ArrayLength<u8>> Thunkable for FixedThunk<N> {
  fn generate(&self, address: usize) -> Vec<u8> {
    self.0(address).to_vec()
  }

  fn len(&self) -> usize {
    N::to_usize()
  }
}
