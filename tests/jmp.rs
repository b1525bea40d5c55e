use matches::assert_matches;
use std::{mem, slice};
use trapline::{Error, JmpPatch};

type FnAdd = extern "C" fn(i32, i32) -> i32;

#[inline(never)]
extern "C" fn add(x: i32, y: i32) -> i32 {
  x + y
}

#[inline(never)]
extern "C" fn sub_detour(x: i32, y: i32) -> i32 {
  x - y
}

#[inline(never)]
extern "C" fn mul(x: i32, y: i32) -> i32 {
  x * y
}

#[inline(never)]
extern "C" fn xor_twice(x: i32) -> i32 {
  x ^ x
}

#[inline(never)]
extern "C" fn shl_one(x: i32) -> i32 {
  x << 1
}

#[inline(never)]
extern "C" fn ret42() -> i32 {
  42
}

#[inline(never)]
extern "C" fn ret7() -> i32 {
  7
}

#[test]
fn jmp_roundtrip_restores_original_bytes() {
  unsafe {
    let snapshot = slice::from_raw_parts(add as usize as *const u8, 24).to_vec();

    let mut target: *const () = add as *const ();
    let mut patch = JmpPatch::attach(&mut target, sub_detour as *const ())
      .expect("target should be hookable");
    assert!(patch.is_active());

    // The hooked function now runs the detour
    assert_eq!(add(10, 5), 5);

    // The trampoline still runs the original behavior
    let original: FnAdd = mem::transmute(patch.trampoline());
    assert_eq!(original(10, 5), 15);

    patch.detach().unwrap();
    assert!(!patch.is_active());
    assert_eq!(add(10, 5), 15);

    // Byte-for-byte identical to the pre-attach snapshot
    let restored = slice::from_raw_parts(add as usize as *const u8, 24).to_vec();
    assert_eq!(snapshot, restored);
  }
}

#[test]
fn jmp_redirects_through_the_origin() {
  unsafe {
    assert_eq!(ret42(), 42);

    let mut target: *const () = ret42 as *const ();
    let patch = JmpPatch::attach(&mut target, ret7 as *const ()).unwrap();

    // Calls through the original address observe the detour
    assert_eq!(ret42(), 7);

    let original: extern "C" fn() -> i32 = mem::transmute(patch.trampoline());
    assert_eq!(original(), 42);

    drop(patch);
    assert_eq!(ret42(), 42);
  }
}

#[test]
fn second_attach_at_the_same_address_fails() {
  unsafe {
    let mut target: *const () = mul as *const ();
    let _patch = JmpPatch::attach(&mut target, sub_detour as *const ()).unwrap();

    let mut second: *const () = mul as *const ();
    let error = JmpPatch::attach(&mut second, sub_detour as *const ()).unwrap_err();
    assert_matches!(error, Error::AlreadyPatched);

    // The first hook is unaffected by the rejected attempt
    assert_eq!(mul(6, 7), -1);
  }
}

#[test]
fn detaching_twice_is_an_error() {
  unsafe {
    let mut target: *const () = xor_twice as *const ();
    let mut patch = JmpPatch::attach(&mut target, sub_detour as *const ()).unwrap();

    patch.detach().unwrap();
    assert_matches!(patch.detach(), Err(Error::AlreadyDetached));
  }
}

#[test]
fn hooking_a_function_onto_itself_fails() {
  unsafe {
    let mut target: *const () = add as *const ();
    let error = JmpPatch::attach(&mut target, add as *const ()).unwrap_err();
    assert_matches!(error, Error::SameAddress);
  }
}

#[test]
fn non_executable_targets_are_rejected() {
  unsafe {
    let data = [0u8; 32];
    let mut target: *const () = data.as_ptr() as *const ();
    let error = JmpPatch::attach(&mut target, sub_detour as *const ()).unwrap_err();
    assert_matches!(error, Error::NotExecutable);
  }
}

#[test]
fn failed_attach_leaves_the_target_untouched() {
  unsafe {
    // An executable page whose content no decoder can classify
    let mut memory = region::alloc(region::page::size(), region::Protection::READ_WRITE_EXECUTE)
      .expect("allocating scratch page");
    let code: &mut [u8] = slice::from_raw_parts_mut(memory.as_mut_ptr::<u8>(), 16);
    code.copy_from_slice(&[
      0x0F, 0x04, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90, 0x90,
      0x90,
    ]);
    let snapshot = code.to_vec();

    let mut target: *const () = code.as_ptr() as *const ();
    let error = JmpPatch::attach(&mut target, sub_detour as *const ()).unwrap_err();
    assert_matches!(error, Error::UnsupportedInstruction);

    // The rejected attach must not have modified a single byte
    assert_eq!(&snapshot[..], code);
  }
}

#[test]
fn dump_formats_every_field() {
  unsafe {
    let mut target: *const () = shl_one as *const ();
    let patch = JmpPatch::attach(&mut target, sub_detour as *const ()).unwrap();

    let dump = format!("{}", patch);
    assert!(dump.contains("active:     true"));
    assert!(dump.contains("origin:"));
    assert!(dump.contains("trampoline:"));
    assert!(dump.contains("saved code:"));
  }
}
