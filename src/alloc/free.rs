use crate::error::{Error, Result};
use std::ops::Range;

/// Iterates over free region addresses above `origin`.
pub fn regions_after(
  origin: *const (),
  range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const ()>> {
  FreeRegionIter::new(origin, range, Direction::Up)
}

/// Iterates over free region addresses below `origin`.
pub fn regions_before(
  origin: *const (),
  range: Option<Range<usize>>,
) -> impl Iterator<Item = Result<*const ()>> {
  FreeRegionIter::new(origin, range, Direction::Down)
}

enum Direction {
  Up,
  Down,
}

/// Walks the process address space, yielding unmapped page addresses.
struct FreeRegionIter {
  range: Range<usize>,
  direction: Direction,
  current: usize,
}

impl FreeRegionIter {
  fn new(origin: *const (), range: Option<Range<usize>>, direction: Direction) -> Self {
    FreeRegionIter {
      range: range.unwrap_or(0..usize::max_value()),
      current: origin as usize,
      direction,
    }
  }
}

impl Iterator for FreeRegionIter {
  type Item = Result<*const ()>;

  fn next(&mut self) -> Option<Self::Item> {
    let page_size = region::page::size();

    while self.current > 0 && self.range.contains(&self.current) {
      match region::query(self.current as *const u8) {
        Ok(region) => {
          // Skip past the mapped region in the search direction
          let bounds = region.as_range();
          self.current = match self.direction {
            Direction::Down => bounds.start.saturating_sub(page_size),
            Direction::Up => bounds.end,
          }
        },
        Err(error) => {
          let result = Some(match error {
            region::Error::UnmappedRegion => Ok(self.current as *const ()),
            inner => Err(Error::RegionFailure(inner)),
          });

          self.current = match self.direction {
            Direction::Down => self.current.saturating_sub(page_size),
            Direction::Up => self.current + page_size,
          };

          return result;
        },
      }
    }

    None
  }
}
