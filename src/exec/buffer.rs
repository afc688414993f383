use std::ptr::NonNull;

/// Errors raised by [`ExecutableBuffer`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BufferError {
    /// The OS refused to map or grow the backing region.
    #[error("failed to map {requested} bytes of memory")]
    OutOfMemory {
        /// Bytes requested by the failing `mmap`/`mremap` call.
        requested: usize,
    },
    /// `mprotect` could not flip the region from RW to RX.
    #[error("failed to make buffer executable: errno {errno}")]
    PermissionError {
        /// The `errno` value reported by `mprotect`.
        errno: i32,
    },
}

/// A growable region of memory that starts writable and can be flipped to
/// executable.
///
/// Addresses returned by [`ExecutableBuffer::base_ptr`] are stable from the
/// first write until [`ExecutableBuffer::release`] (or `Drop`).
pub struct ExecutableBuffer {
    ptr: Option<NonNull<u8>>,
    len: usize,
    capacity: usize,
    executable: bool,
}

// Safety: the buffer owns an exclusively-mapped memory region; sharing a
// `&ExecutableBuffer` across threads is fine once it is executable (no
// further writes happen), matching `ExecutableCode`'s Send+Sync rationale.
unsafe impl Send for ExecutableBuffer {}
unsafe impl Sync for ExecutableBuffer {}

impl ExecutableBuffer {
    /// Create an empty buffer with no backing memory yet.
    pub fn new() -> Self {
        ExecutableBuffer {
            ptr: None,
            len: 0,
            capacity: 0,
            executable: false,
        }
    }

    /// Allocate a page-aligned region of at least `capacity` bytes with RW
    /// permissions. Reserving again releases the prior region first.
    pub fn reserve(&mut self, capacity: usize) -> Result<(), BufferError> {
        self.release();

        let page_size = page_size();
        let mapped = round_up(capacity.max(page_size), page_size);

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if addr == libc::MAP_FAILED {
            return Err(BufferError::OutOfMemory { requested: mapped });
        }

        self.ptr = NonNull::new(addr as *mut u8);
        self.len = 0;
        self.capacity = mapped;
        self.executable = false;
        Ok(())
    }

    fn ensure_capacity(&mut self, additional: usize) -> Result<(), BufferError> {
        if self.len + additional <= self.capacity {
            return Ok(());
        }
        let mut new_capacity = self.capacity.max(page_size());
        while new_capacity < self.len + additional {
            new_capacity *= 2;
        }
        self.grow(new_capacity)
    }

    fn grow(&mut self, new_capacity: usize) -> Result<(), BufferError> {
        debug_assert!(!self.executable, "cannot grow a buffer already made executable");

        let page_size = page_size();
        let mapped = round_up(new_capacity, page_size);

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                mapped,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(BufferError::OutOfMemory { requested: mapped });
        }

        if let Some(old_ptr) = self.ptr {
            unsafe {
                std::ptr::copy_nonoverlapping(old_ptr.as_ptr(), addr as *mut u8, self.len);
                libc::munmap(old_ptr.as_ptr() as *mut libc::c_void, self.capacity);
            }
        }

        self.ptr = NonNull::new(addr as *mut u8);
        self.capacity = mapped;
        Ok(())
    }

    /// Append bytes in little-endian order, growing the buffer if needed.
    pub fn emit_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        debug_assert!(!self.executable, "buffer is already executable");
        self.ensure_capacity(bytes.len())?;
        let ptr = self.ptr.expect("reserve() must be called before emit");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(self.len), bytes.len());
        }
        self.len += bytes.len();
        Ok(())
    }

    /// Append a single byte.
    pub fn emit8(&mut self, v: u8) -> Result<(), BufferError> {
        self.emit_bytes(&v.to_le_bytes())
    }

    /// Append a little-endian `u16`.
    pub fn emit16(&mut self, v: u16) -> Result<(), BufferError> {
        self.emit_bytes(&v.to_le_bytes())
    }

    /// Append a little-endian `u32`.
    pub fn emit32(&mut self, v: u32) -> Result<(), BufferError> {
        self.emit_bytes(&v.to_le_bytes())
    }

    /// Append a little-endian `u64`.
    pub fn emit64(&mut self, v: u64) -> Result<(), BufferError> {
        self.emit_bytes(&v.to_le_bytes())
    }

    /// Current write offset (length of emitted bytes so far).
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been emitted yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Overwrite `bytes.len()` bytes at `offset`, used for relocation fixups.
    /// Must be called before [`Self::make_executable`].
    pub fn patch_at(&mut self, offset: usize, bytes: &[u8]) {
        debug_assert!(!self.executable, "cannot patch an already-executable buffer");
        assert!(offset + bytes.len() <= self.len, "patch out of bounds");
        let ptr = self.ptr.expect("reserve() must be called before patch");
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.as_ptr().add(offset), bytes.len());
        }
    }

    /// Transition the region from RW to RX and flush the instruction cache
    /// for the written range on architectures that require it. Idempotent
    /// after the first success.
    pub fn make_executable(&mut self) -> Result<(), BufferError> {
        if self.executable {
            return Ok(());
        }
        let ptr = self.ptr.expect("reserve() must be called before make_executable");

        let rc = unsafe {
            libc::mprotect(
                ptr.as_ptr() as *mut libc::c_void,
                self.capacity,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            return Err(BufferError::PermissionError {
                errno: unsafe { *libc::__errno_location() },
            });
        }

        flush_icache(ptr.as_ptr(), self.len);
        self.executable = true;
        Ok(())
    }

    /// Whether `make_executable` has succeeded on this buffer.
    pub fn is_executable(&self) -> bool {
        self.executable
    }

    /// Base address of the region. Stable from the first write until
    /// `release`.
    pub fn base_ptr(&self) -> *const u8 {
        self.ptr.map(|p| p.as_ptr() as *const u8).unwrap_or(std::ptr::null())
    }

    /// The emitted bytes so far, for tests and disassembler-based
    /// verification.
    pub fn as_slice(&self) -> &[u8] {
        match self.ptr {
            Some(p) => unsafe { std::slice::from_raw_parts(p.as_ptr(), self.len) },
            None => &[],
        }
    }

    /// Unmap the backing region. Safe to call multiple times.
    pub fn release(&mut self) {
        if let Some(ptr) = self.ptr.take() {
            unsafe {
                libc::munmap(ptr.as_ptr() as *mut libc::c_void, self.capacity);
            }
        }
        self.len = 0;
        self.capacity = 0;
        self.executable = false;
    }
}

impl Default for ExecutableBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ExecutableBuffer {
    fn drop(&mut self) {
        self.release();
    }
}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) / align * align
}

/// Flush the instruction cache for `[ptr, ptr+len)`.
///
/// x86-64 has a coherent instruction cache and needs no flush (a
/// serializing instruction is only required for cross-core handoff, which
/// the host's safepoint mechanism already provides). ARM64 and RISC-V
/// require explicit cache maintenance before newly written code can be
/// safely executed.
fn flush_icache(_ptr: *const u8, _len: usize) {
    #[cfg(target_arch = "aarch64")]
    unsafe {
        let start = _ptr as usize;
        let end = start + _len;
        let mut addr = start & !63;
        while addr < end {
            std::arch::asm!("dc cvau, {0}", in(reg) addr);
            addr += 64;
        }
        std::arch::asm!("dsb ish");
        addr = start & !63;
        while addr < end {
            std::arch::asm!("ic ivau, {0}", in(reg) addr);
            addr += 64;
        }
        std::arch::asm!("dsb ish", "isb");
    }

    #[cfg(target_arch = "riscv64")]
    unsafe {
        // The RISC-V `fence.i` instruction only flushes the *current hart's*
        // pipeline; a multi-hart host is expected to broadcast this via its
        // own IPI/safepoint mechanism.
        std::arch::asm!("fence.i");
    }

    #[cfg(not(any(target_arch = "aarch64", target_arch = "riscv64")))]
    {
        std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_starts_empty_and_writable() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        assert_eq!(buf.len(), 0);
        assert!(!buf.is_executable());
    }

    #[test]
    fn emit_appends_in_order() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        buf.emit8(0x01).unwrap();
        buf.emit16(0x0203).unwrap();
        buf.emit32(0x04050607).unwrap();
        assert_eq!(buf.as_slice(), &[0x01, 0x03, 0x02, 0x07, 0x06, 0x05, 0x04]);
    }

    #[test]
    fn grows_past_initial_capacity() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(4).unwrap();
        for i in 0..10_000u32 {
            buf.emit32(i).unwrap();
        }
        assert_eq!(buf.len(), 40_000);
    }

    #[test]
    fn not_executable_until_make_executable_called() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        buf.emit8(0x00).unwrap();
        assert!(!buf.is_executable());
        buf.make_executable().unwrap();
        assert!(buf.is_executable());
    }

    #[test]
    fn make_executable_preserves_byte_contents() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        let bytes = [0x90u8, 0x90, 0xC3];
        buf.emit_bytes(&bytes).unwrap();
        buf.make_executable().unwrap();
        assert_eq!(buf.as_slice(), &bytes);
    }

    #[test]
    fn make_executable_is_idempotent() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        buf.emit8(0xC3).unwrap();
        buf.make_executable().unwrap();
        buf.make_executable().unwrap();
        assert!(buf.is_executable());
    }

    #[test]
    fn reserve_again_releases_prior_region() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        buf.emit8(0xAA).unwrap();
        buf.reserve(64).unwrap();
        assert_eq!(buf.len(), 0);
    }

    #[test]
    fn patch_at_overwrites_emitted_bytes() {
        let mut buf = ExecutableBuffer::new();
        buf.reserve(64).unwrap();
        buf.emit32(0).unwrap();
        buf.patch_at(0, &42u32.to_le_bytes());
        assert_eq!(buf.as_slice(), &42u32.to_le_bytes());
    }
}
