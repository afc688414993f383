//! Integration tests for the W^X executable code buffer, exercising a
//! real mapped page end to end: emit, patch, flip to executable, and
//! actually call into it.

use aerojs_core::ExecutableBuffer;

#[test]
fn a_freshly_reserved_buffer_executes_a_hand_assembled_return_sequence() {
    let mut buf = ExecutableBuffer::new();
    buf.reserve(64).unwrap();

    // `mov eax, 42; ret` — enough to prove the mapped page is genuinely
    // executable on the host running this test.
    buf.emit_bytes(&[0xB8, 0x2A, 0x00, 0x00, 0x00, 0xC3]).unwrap();
    buf.make_executable().unwrap();

    #[cfg(target_arch = "x86_64")]
    {
        let f: extern "C" fn() -> u32 = unsafe { std::mem::transmute(buf.base_ptr()) };
        assert_eq!(f(), 42);
    }

    assert!(buf.is_executable());
}

#[test]
fn patch_at_rewrites_bytes_before_the_executable_transition() {
    let mut buf = ExecutableBuffer::new();
    buf.reserve(64).unwrap();
    buf.emit32(0).unwrap();
    buf.emit32(0xFFFF_FFFF).unwrap();
    buf.patch_at(0, &1234u32.to_le_bytes());
    assert_eq!(&buf.as_slice()[0..4], &1234u32.to_le_bytes());
    assert_eq!(&buf.as_slice()[4..8], &0xFFFF_FFFFu32.to_le_bytes());
}

#[test]
fn growing_past_the_initial_page_preserves_prior_bytes() {
    let mut buf = ExecutableBuffer::new();
    buf.reserve(16).unwrap();
    let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
    buf.emit_bytes(&payload).unwrap();
    assert_eq!(buf.as_slice(), payload.as_slice());
}

#[test]
fn release_then_reserve_gives_a_fresh_empty_region() {
    let mut buf = ExecutableBuffer::new();
    buf.reserve(32).unwrap();
    buf.emit8(0xAB).unwrap();
    buf.release();
    assert_eq!(buf.len(), 0);
    buf.reserve(32).unwrap();
    assert_eq!(buf.len(), 0);
    buf.emit8(0xCD).unwrap();
    assert_eq!(buf.as_slice(), &[0xCD]);
}
