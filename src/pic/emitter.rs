use super::Thunkable;

/// A collection of thunks that emits as one contiguous code block.
pub struct CodeEmitter {
  thunks: Vec<Box<dyn Thunkable>>,
}

impl CodeEmitter {
  /// Constructs a new, empty code emitter.
  pub fn new() -> Self {
    CodeEmitter { thunks: Vec::new() }
  }

  /// Generates code for use at the specified base address.
  pub fn emit(&self, base: *const ()) -> Vec<u8> {
    let mut result = Vec::with_capacity(self.len());
    let mut base = base as usize;

    for thunk in &self.thunks {
      let code = thunk.generate(base);
      assert_eq!(code.len(), thunk.len());

      // Each segment observes the instruction pointer past itself
      base += thunk.len();
      result.extend(code);
    }

    result
  }

  /// Appends a position-independent code segment.
  pub fn add_thunk(&mut self, thunk: Box<dyn Thunkable>) {
    self.thunks.push(thunk);
  }

  /// Returns the combined size of all code segments.
  pub fn len(&self) -> usize {
    self.thunks.iter().map(|thunk| thunk.len()).sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn emitter_concatenates_segments() {
    let mut emitter = CodeEmitter::new();
    emitter.add_thunk(Box::new(vec![0x90, 0x90]));
    emitter.add_thunk(Box::new(vec![0xC3]));

    assert_eq!(emitter.len(), 3);
    assert_eq!(emitter.emit(0x1000 as *const ()), vec![0x90, 0x90, 0xC3]);
  }

  #[test]
  fn emitter_advances_segment_base() {
    use crate::pic::FixedThunk;
    use generic_array::{typenum, GenericArray};

    let mut emitter = CodeEmitter::new();
    emitter.add_thunk(Box::new(vec![0x90; 4]));
    emitter.add_thunk(Box::new(FixedThunk::<typenum::U1>::new(|base| {
      GenericArray::clone_from_slice(&[(base & 0xFF) as u8])
    })));

    // The second segment observes the base advanced past the first
    assert_eq!(emitter.emit(0x1000 as *const ()), vec![0x90, 0x90, 0x90, 0x90, 0x04]);
  }
}
