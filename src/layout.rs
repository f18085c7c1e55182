// src/layout.rs

use crate::error::ConfigError;
use crate::ring::RingSpan;

/// Alignment of every command and completion record, in bytes.
pub const RING_ALIGNMENT: u32 = 32;

/// Size of one cursor word, in bytes. Pointer registers count these.
pub const WORD_BYTES: u32 = 16;

/// Shift converting a byte offset to a word address.
pub const PTR_SHIFT: u32 = 4;

/// Bytes reserved at the start of each queue region for the pointer scratch
/// area shared with the device. Neither ring may overlap it.
pub const REGION_HEADER_BYTES: u32 = 96;

/// Default fraction of a region dedicated to the issue ring. Smaller issue
/// rings stall workloads that push more work than they read back.
pub const DEFAULT_ISSUE_FRACTION: f32 = 0.75;

/// Round `value` up to a multiple of `alignment` (a power of two).
pub const fn align_up(value: u32, alignment: u32) -> u32 {
    (value + alignment - 1) & !(alignment - 1)
}

/// Immutable layout of one logical queue inside the shared arena.
///
/// A region is `REGION_HEADER_BYTES` of pointer scratch followed by the issue
/// ring and then the completion ring. All addresses handed to the device are
/// arena-absolute, so the layout carries the region's `base_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueLayout {
    region_size: u32,
    base_offset: u32,
    issue_region_size: u32,
    completion_region_size: u32,
}

impl QueueLayout {
    /// Split `region_size` bytes at `base_offset` into issue and completion
    /// rings, giving `issue_fraction` of the usable space (rounded up to
    /// [`RING_ALIGNMENT`]) to the issue side.
    pub fn new(region_size: u32, base_offset: u32, issue_fraction: f32) -> Result<Self, ConfigError> {
        if !(issue_fraction > 0.0 && issue_fraction < 1.0) {
            return Err(ConfigError::InvalidSplit {
                fraction_millis: (issue_fraction * 1000.0) as u32,
            });
        }
        if region_size <= REGION_HEADER_BYTES || region_size % RING_ALIGNMENT != 0 {
            return Err(ConfigError::ZeroRegion {
                region_size,
                issue_region_size: 0,
            });
        }

        let usable = region_size - REGION_HEADER_BYTES;
        let issue_region_size = align_up((usable as f32 * issue_fraction) as u32, RING_ALIGNMENT);
        Self::with_regions(region_size, base_offset, issue_region_size)
    }

    /// Rebuild the layout with an explicit issue region size, keeping the
    /// total region size. Used by `set_issue_region_size`.
    pub fn with_issue_region_size(self, issue_region_size: u32) -> Result<Self, ConfigError> {
        Self::with_regions(self.region_size, self.base_offset, issue_region_size)
    }

    fn with_regions(
        region_size: u32,
        base_offset: u32,
        issue_region_size: u32,
    ) -> Result<Self, ConfigError> {
        let usable = region_size.saturating_sub(REGION_HEADER_BYTES);
        if issue_region_size == 0
            || issue_region_size % RING_ALIGNMENT != 0
            || issue_region_size >= usable
        {
            return Err(ConfigError::ZeroRegion {
                region_size,
                issue_region_size,
            });
        }
        Ok(QueueLayout {
            region_size,
            base_offset,
            issue_region_size,
            completion_region_size: usable - issue_region_size,
        })
    }

    pub fn region_size(&self) -> u32 {
        self.region_size
    }

    pub fn base_offset(&self) -> u32 {
        self.base_offset
    }

    pub fn issue_region_size(&self) -> u32 {
        self.issue_region_size
    }

    pub fn completion_region_size(&self) -> u32 {
        self.completion_region_size
    }

    /// First byte of the issue ring, arena-absolute.
    pub fn issue_start(&self) -> u32 {
        self.base_offset + REGION_HEADER_BYTES
    }

    /// One past the last byte of the issue ring, arena-absolute.
    pub fn issue_limit(&self) -> u32 {
        self.issue_start() + self.issue_region_size
    }

    /// First byte of the completion ring, arena-absolute.
    pub fn completion_start(&self) -> u32 {
        self.issue_limit()
    }

    /// One past the last byte of the completion ring, arena-absolute.
    pub fn completion_limit(&self) -> u32 {
        self.completion_start() + self.completion_region_size
    }

    /// Issue ring bounds in cursor words.
    pub fn issue_span(&self) -> RingSpan {
        RingSpan::new(self.issue_start() >> PTR_SHIFT, self.issue_limit() >> PTR_SHIFT)
    }

    /// Completion ring bounds in cursor words.
    pub fn completion_span(&self) -> RingSpan {
        RingSpan::new(
            self.completion_start() >> PTR_SHIFT,
            self.completion_limit() >> PTR_SHIFT,
        )
    }
}
