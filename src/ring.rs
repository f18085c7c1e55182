// src/ring.rs
//
// Cursor arithmetic for the issue and completion rings. A bare pointer cannot
// distinguish a full ring from an empty one when producer and consumer meet,
// so every cursor carries a parity bit that flips on each wrap; comparing
// (position, parity) pairs resolves the ambiguity.

use crate::layout::{PTR_SHIFT, RING_ALIGNMENT};

/// Bit of the packed register word holding the wrap parity.
pub const TOGGLE_BIT: u32 = 31;

/// Mask of the packed register word holding the word position.
pub const PTR_MASK: u32 = (1 << TOGGLE_BIT) - 1;

/// Half-open word range `[start, limit)` of one ring inside the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSpan {
    start: u32,
    limit: u32,
}

impl RingSpan {
    pub const fn new(start: u32, limit: u32) -> Self {
        RingSpan { start, limit }
    }

    pub const fn start(&self) -> u32 {
        self.start
    }

    pub const fn limit(&self) -> u32 {
        self.limit
    }

    /// Ring capacity in words.
    pub const fn words(&self) -> u32 {
        self.limit - self.start
    }

    /// Ring capacity in bytes.
    pub const fn bytes(&self) -> u32 {
        self.words() << PTR_SHIFT
    }

    pub const fn contains(&self, pos: u32) -> bool {
        pos >= self.start && pos < self.limit
    }
}

/// A ring cursor: word position plus wrap parity.
///
/// This is the value both sides publish in their pointer registers, packed as
/// `position | parity << 31`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pos: u32,
    parity: bool,
}

impl Cursor {
    /// Cursor at the start of `span` with cleared parity (queue-creation
    /// state).
    pub const fn at_start(span: RingSpan) -> Self {
        Cursor {
            pos: span.start(),
            parity: false,
        }
    }

    pub const fn new(pos: u32, parity: bool) -> Self {
        Cursor { pos, parity }
    }

    pub const fn pos(&self) -> u32 {
        self.pos
    }

    pub const fn parity(&self) -> bool {
        self.parity
    }

    /// Arena-absolute byte offset of the cursor.
    pub const fn byte_offset(&self) -> u32 {
        self.pos << PTR_SHIFT
    }

    /// Register form: `position | parity << 31`.
    pub const fn packed(&self) -> u32 {
        self.pos | (self.parity as u32) << TOGGLE_BIT
    }

    pub const fn from_packed(word: u32) -> Self {
        Cursor {
            pos: word & PTR_MASK,
            parity: word >> TOGGLE_BIT == 1,
        }
    }

    /// Advance by `words`, wrapping at the span limit. Returns `true` when
    /// the cursor wrapped (and flipped parity).
    ///
    /// Reaching the limit exactly counts as a wrap; the cursor never rests on
    /// the limit itself.
    pub fn advance(&mut self, words: u32, span: RingSpan) -> bool {
        debug_assert!(span.contains(self.pos));
        debug_assert!(words <= span.words());
        self.pos += words;
        if self.pos >= span.limit() {
            self.pos -= span.words();
            self.parity = !self.parity;
            true
        } else {
            false
        }
    }

    /// Administrative rewrap: rewind to the span start and flip parity, as if
    /// the remaining tail had been consumed.
    pub fn rewrap(&mut self, span: RingSpan) {
        self.pos = span.start();
        self.parity = !self.parity;
    }

    /// Reset to the queue-creation state.
    pub fn reset(&mut self, span: RingSpan) {
        *self = Cursor::at_start(span);
    }

    /// Words remaining before this cursor would cross the span limit.
    pub const fn words_to_limit(&self, span: RingSpan) -> u32 {
        span.limit() - self.pos
    }
}

/// Free words ahead of the producer cursor `write`, given the consumer's last
/// published cursor `read`.
///
/// Equal parities mean the producer is at or ahead of the consumer within the
/// same lap, so `write == read` is an empty ring; differing parities mean the
/// producer has wrapped and only the gap up to the consumer is free, so
/// `write == read` is a full ring.
pub fn free_words(write: Cursor, read: Cursor, span: RingSpan) -> u32 {
    debug_assert!(span.contains(write.pos()));
    debug_assert!(span.contains(read.pos()));
    if write.parity() == read.parity() {
        debug_assert!(write.pos() >= read.pos());
        span.words() - (write.pos() - read.pos())
    } else {
        read.pos() - write.pos()
    }
}

/// Whether the consumer cursor `read` has unread data published at `write`.
pub fn has_pending(write: Cursor, read: Cursor) -> bool {
    write != read
}

/// Convert an aligned byte size to cursor words, rounding up to
/// [`RING_ALIGNMENT`] first.
pub const fn size_to_words(bytes: u32) -> u32 {
    crate::layout::align_up(bytes, RING_ALIGNMENT) >> PTR_SHIFT
}
