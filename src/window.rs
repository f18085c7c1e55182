// src/window.rs

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

use crate::error::ConfigError;

/// Alignment of the arena allocation. Matches a cache line on every target we
/// care about so region headers never split a line.
const ARENA_ALIGN: usize = 64;

/// The host-visible memory window backing every queue's issue and completion
/// rings.
///
/// Both sides address the window with arena-absolute byte offsets. The host
/// only writes a range after a successful reserve, and the device only reads
/// bytes the host has already committed; there is deliberately no lock here.
/// The watcher exists to catch the device violating that trust.
pub struct HostWindow {
    ptr: NonNull<u8>,
    len: usize,
}

// Safety: concurrent access is governed by the ring protocol. The producer
// writes a range only while it is reserved, and the consumer reads it only
// after the matching pointer register was published.
unsafe impl Send for HostWindow {}
unsafe impl Sync for HostWindow {}

impl HostWindow {
    /// Allocate a zeroed window of `len` bytes.
    pub fn allocate(len: usize) -> Result<Self, ConfigError> {
        if len == 0 {
            return Err(ConfigError::ArenaTooSmall { requested: len });
        }
        let layout = Layout::from_size_align(len, ARENA_ALIGN)
            .map_err(|_| ConfigError::ArenaTooSmall { requested: len })?;
        // Safety: layout has nonzero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(ConfigError::ArenaTooSmall { requested: len })?;
        Ok(HostWindow { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the window at `offset`.
    ///
    /// The caller must hold a reservation covering `offset..offset + len`.
    /// Out-of-bounds writes are programmer errors and panic.
    pub fn write(&self, offset: u32, data: &[u8]) {
        let offset = offset as usize;
        assert!(
            offset + data.len() <= self.len,
            "window write out of bounds: {}..{} > {}",
            offset,
            offset + data.len(),
            self.len
        );
        // Safety: bounds checked above; the reservation protocol guarantees
        // the range is not concurrently read.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
    }

    /// Copy `buf.len()` bytes out of the window at `offset`.
    pub fn read_into(&self, offset: u32, buf: &mut [u8]) {
        let offset = offset as usize;
        assert!(
            offset + buf.len() <= self.len,
            "window read out of bounds: {}..{} > {}",
            offset,
            offset + buf.len(),
            self.len
        );
        // Safety: bounds checked above; the publication protocol guarantees
        // the range is not concurrently written.
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len());
        }
    }

    /// Read `len` bytes at `offset` into a fresh buffer.
    pub fn read_vec(&self, offset: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.read_into(offset, &mut buf);
        buf
    }
}

impl Drop for HostWindow {
    fn drop(&mut self) {
        // Safety: allocated in `allocate` with the same layout.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.len, ARENA_ALIGN);
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}
