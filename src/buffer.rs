//! Mirror-mapped ring buffer for contiguous zero-copy views.
//!
//! This module provides [`RingBuffer`], a single-producer single-consumer
//! byte queue whose readable region is always one contiguous linear range,
//! regardless of where the logical wrap point sits. The trick is a virtual
//! memory mirror: the buffer's pages are mapped twice, back to back, so an
//! access that runs off the end of the first mapping lands on the start of
//! the second — which is the same physical memory.
//!
//! The mirror is what lets the socket layer hand a single pointer+length
//! to `send(2)` and a protocol parser treat buffered bytes as flat memory,
//! with no split-at-the-seam branch anywhere.
//!
//! # Concurrency Contract
//!
//! A `RingBuffer` is shared between exactly one producer and one consumer,
//! which may be different threads:
//!
//! - `acquire_write`/`commit_write` are producer-side only
//! - `acquire_read`/`commit_read` are consumer-side only
//! - each side's monotonic counter is read, never written, by the other
//! - the mapping is replaced (grown) only by the producer and only while
//!   the buffer is empty, i.e. while the consumer has nothing it could be
//!   dereferencing
//! - a span returned by an `acquire_*` call is invalidated by the next
//!   call from the same side
//!
//! Violating the split is undefined behavior; the connection layer upholds
//! it by pinning the consumer side to the owner's serial queue.

use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use crate::error::{Error, Result};

/// Returns the VM page size in bytes.
fn page_size() -> usize {
    // SAFETY: sysconf has no memory effects.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 {
        n as usize
    } else {
        4096
    }
}

/// Rounds `n` up to a whole number of pages.
fn round_up_to_page(n: usize) -> Result<usize> {
    let page = page_size();
    let rounded = n
        .checked_add(page - 1)
        .map(|v| v & !(page - 1))
        .filter(|v| *v <= isize::MAX as usize / 2)
        .ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "requested buffer size too large",
            ))
        })?;
    Ok(rounded.max(page))
}

/// Maps `len` bytes of anonymous memory twice, back to back.
///
/// Returns the base of a `2 * len` virtual range whose upper half aliases
/// the lower half. `len` must be page-rounded and non-zero. Every failing
/// step releases what was already mapped and reports which step failed.
#[cfg(target_os = "linux")]
fn map_mirror(len: usize) -> Result<*mut u8> {
    use std::ptr;

    // SAFETY: plain fd-creating syscall; the name is a static NUL-terminated
    // literal used only for /proc listings.
    let memfd = unsafe {
        libc::memfd_create(
            b"ringsock-ring\0".as_ptr() as *const libc::c_char,
            libc::MFD_CLOEXEC,
        )
    };
    if memfd < 0 {
        return Err(Error::remap("memfd_create"));
    }

    // SAFETY: memfd is a valid fd we just created.
    if unsafe { libc::ftruncate(memfd, len as libc::off_t) } != 0 {
        let err = Error::remap("ftruncate");
        unsafe { libc::close(memfd) };
        return Err(err);
    }

    // Reserve the double-length range first so both halves are guaranteed
    // adjacent; the fixed mappings below replace it in place.
    // SAFETY: anonymous reservation, no existing mapping is clobbered.
    let span = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len * 2,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if span == libc::MAP_FAILED {
        let err = Error::remap("mmap reserve");
        unsafe { libc::close(memfd) };
        return Err(err);
    }

    for (offset, op) in [(0usize, "mmap lower"), (len, "mmap upper")] {
        // SAFETY: the target lies inside the reservation we own, and
        // MAP_FIXED therefore replaces only our own PROT_NONE pages.
        let mapped = unsafe {
            libc::mmap(
                (span as *mut u8).add(offset) as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                memfd,
                0,
            )
        };
        if mapped == libc::MAP_FAILED {
            let err = Error::remap(op);
            // SAFETY: span is our 2*len mapping; memfd is our fd.
            unsafe {
                libc::munmap(span, len * 2);
                libc::close(memfd);
            }
            return Err(err);
        }
    }

    // The mappings keep the backing object alive; the fd is not needed
    // past this point.
    // SAFETY: memfd is our fd.
    unsafe { libc::close(memfd) };
    Ok(span as *mut u8)
}

#[cfg(not(target_os = "linux"))]
fn map_mirror(_len: usize) -> Result<*mut u8> {
    Err(Error::Remap {
        op: "mmap",
        source: std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "mirrored mappings require memfd_create",
        ),
    })
}

/// Unmaps a mirror previously returned by [`map_mirror`].
fn unmap_mirror(base: *mut u8, len: usize) {
    // SAFETY: base/len describe a mapping this module created.
    unsafe {
        libc::munmap(base as *mut libc::c_void, len * 2);
    }
}

/// Contiguous-view SPSC byte queue backed by a mirrored mapping.
///
/// Capacity is always a whole number of pages (or zero before the first
/// write). Allocation is lazy: a fresh buffer owns no memory until the
/// first write that needs space, and an empty buffer is reallocated in
/// place when a write demands more than the current capacity. A non-empty
/// buffer never grows — [`RingBuffer::acquire_write`] fails with
/// [`Error::WriteBufferFull`] instead, which is the backpressure signal.
///
/// Occupancy is tracked with two monotonic wrapping counters rather than
/// cursor comparison, so `bytes_written - bytes_read` stays correct across
/// counter overflow.
pub struct RingBuffer {
    /// Base of the 2x mapping; null while unallocated
    base: AtomicPtr<u8>,
    /// Mapped capacity in bytes; zero while unallocated
    capacity: AtomicUsize,
    /// Consumer cursor, an offset in [0, capacity)
    read_pos: AtomicUsize,
    /// Producer cursor, an offset in [0, capacity)
    write_pos: AtomicUsize,
    /// Total bytes ever committed by the producer (wrapping)
    bytes_written: AtomicU64,
    /// Total bytes ever consumed (wrapping)
    bytes_read: AtomicU64,
    /// Capacity floor used by the first allocation
    initial_size: usize,
}

// SAFETY: cross-thread access is mediated by the atomics and the SPSC
// contract documented on the type; the raw base pointer is only
// dereferenced under that contract.
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// Creates an unallocated buffer whose first allocation will be at
    /// least `initial_size` bytes (rounded up to whole pages).
    pub fn with_initial_size(initial_size: usize) -> Self {
        Self {
            base: AtomicPtr::new(std::ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            bytes_written: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            initial_size,
        }
    }

    /// Number of readable bytes.
    #[inline]
    pub fn available(&self) -> usize {
        let written = self.bytes_written.load(Ordering::Acquire);
        let read = self.bytes_read.load(Ordering::Acquire);
        written.wrapping_sub(read) as usize
    }

    /// Number of writable bytes before the buffer is full.
    #[inline]
    pub fn free_space(&self) -> usize {
        self.capacity.load(Ordering::Acquire) - self.available()
    }

    /// Current mapped capacity in bytes (zero while unallocated).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    /// Acquires a linear writable span of at least `n` bytes.
    ///
    /// Allocates lazily on first use, reallocates larger if the buffer is
    /// empty and too small, and fails with [`Error::WriteBufferFull`] when
    /// the demand cannot be met without growing a non-empty buffer. The
    /// returned span starts at the write cursor and is valid until the
    /// next producer-side call; commit what was filled with
    /// [`RingBuffer::commit_write`].
    ///
    /// Producer side only.
    #[allow(clippy::mut_from_ref)] // SPSC: the producer is the sole writer
    pub fn acquire_write(&self, n: usize) -> Result<&mut [u8]> {
        if n == 0 {
            return Ok(&mut []);
        }

        let cap = self.capacity.load(Ordering::Acquire);
        if cap == 0 {
            let want = round_up_to_page(n.max(self.initial_size))?;
            let base = map_mirror(want)?;
            self.read_pos.store(0, Ordering::Relaxed);
            self.write_pos.store(0, Ordering::Relaxed);
            self.base.store(base, Ordering::Release);
            self.capacity.store(want, Ordering::Release);
            // SAFETY: fresh mapping of want >= n bytes, cursor at zero.
            return Ok(unsafe { std::slice::from_raw_parts_mut(base, n) });
        }

        let avail = self.available();
        if cap - avail >= n {
            let base = self.base.load(Ordering::Acquire);
            let wp = self.write_pos.load(Ordering::Relaxed);
            // SAFETY: wp < cap and n <= cap, so [wp, wp + n) lies inside
            // the 2*cap mirror; the span is free space the consumer will
            // not touch until it is committed.
            return Ok(unsafe { std::slice::from_raw_parts_mut(base.add(wp), n) });
        }

        if avail == 0 {
            // Empty: replace the mapping with a larger one. The consumer
            // has nothing to dereference, so cursors can be rewound.
            let want = round_up_to_page(n)?;
            let fresh = map_mirror(want)?;
            let old = self.base.load(Ordering::Relaxed);
            self.read_pos.store(0, Ordering::Relaxed);
            self.write_pos.store(0, Ordering::Relaxed);
            self.base.store(fresh, Ordering::Release);
            self.capacity.store(want, Ordering::Release);
            unmap_mirror(old, cap);
            // SAFETY: fresh mapping of want >= n bytes, cursor at zero.
            return Ok(unsafe { std::slice::from_raw_parts_mut(fresh, n) });
        }

        Err(Error::WriteBufferFull)
    }

    /// Publishes `n` bytes previously filled through
    /// [`RingBuffer::acquire_write`].
    ///
    /// Producer side only.
    pub fn commit_write(&self, n: usize) {
        if n == 0 {
            return;
        }
        let cap = self.capacity.load(Ordering::Relaxed);
        debug_assert!(n <= cap - self.available());
        let wp = self.write_pos.load(Ordering::Relaxed);
        self.write_pos.store((wp + n) % cap, Ordering::Relaxed);
        let written = self.bytes_written.load(Ordering::Relaxed);
        // Release pairs with the consumer's Acquire in available(): once
        // the new count is visible, so are the bytes and any new mapping.
        self.bytes_written
            .store(written.wrapping_add(n as u64), Ordering::Release);
    }

    /// Returns the readable span: the read cursor with `available()` bytes
    /// behind it, linearly addressable across the wrap thanks to the
    /// mirror. Empty when the buffer is empty or unallocated.
    ///
    /// Consumer side only.
    pub fn acquire_read(&self) -> &[u8] {
        let avail = self.available();
        if avail == 0 {
            return &[];
        }
        let base = self.base.load(Ordering::Acquire);
        let rp = self.read_pos.load(Ordering::Relaxed);
        // SAFETY: avail > 0 implies the Acquire above observed a commit
        // that happened after the mapping was published; rp < cap and
        // avail <= cap keep the span inside the 2*cap mirror.
        unsafe { std::slice::from_raw_parts(base.add(rp), avail) }
    }

    /// Consumes `n` bytes from the front of the readable span.
    ///
    /// Consumer side only.
    pub fn commit_read(&self, n: usize) {
        if n == 0 {
            return;
        }
        debug_assert!(n <= self.available());
        let cap = self.capacity.load(Ordering::Relaxed);
        let rp = self.read_pos.load(Ordering::Relaxed);
        self.read_pos.store((rp + n) % cap, Ordering::Relaxed);
        let read = self.bytes_read.load(Ordering::Relaxed);
        self.bytes_read
            .store(read.wrapping_add(n as u64), Ordering::Release);
    }

    /// Zeroes cursors and counters, retaining the mapping.
    ///
    /// Both sides must be quiescent.
    pub fn reset(&self) {
        self.read_pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Release);
    }

    /// Moves every readable byte of `other` into `self` with a single
    /// copy, acting as `other`'s consumer and `self`'s producer.
    ///
    /// Fails with [`Error::WriteBufferFull`] when `self` cannot take the
    /// bytes; `other` is left untouched in that case.
    pub fn splice_from(&self, other: &RingBuffer) -> Result<usize> {
        let n = other.available();
        if n == 0 {
            return Ok(0);
        }
        let dst = self.acquire_write(n)?;
        let src = other.acquire_read();
        dst[..n].copy_from_slice(&src[..n]);
        self.commit_write(n);
        other.commit_read(n);
        Ok(n)
    }

    /// Forces the monotonic counters to arbitrary values, for exercising
    /// wrap-around arithmetic.
    #[cfg(test)]
    fn force_counters(&self, written: u64, read: u64) {
        self.bytes_read.store(read, Ordering::Relaxed);
        self.bytes_written.store(written, Ordering::Release);
    }
}

impl Drop for RingBuffer {
    fn drop(&mut self) {
        let base = self.base.load(Ordering::Relaxed);
        let cap = self.capacity.load(Ordering::Relaxed);
        if !base.is_null() {
            unmap_mirror(base, cap);
        }
    }
}

impl std::fmt::Debug for RingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .field("initial_size", &self.initial_size)
            .finish()
    }
}
