use crate::error::Result;

/// Returns true if the address lies within an executable region.
pub fn is_executable_address(address: *const ()) -> Result<bool> {
  Ok(region::query(address as *const u8)?.is_executable())
}
