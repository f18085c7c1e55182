// src/doorbell.rs
//
// The host never shares a language-level variable with the device. Progress
// flows through four per-queue registers, each one packed cursor word:
//
//   device-published: issue read pointer, completion write pointer
//   host-published:   issue write pointer, completion read pointer (doorbells)
//
// The producer only ever reads the consumer's register and vice versa.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::layout::QueueLayout;
use crate::ring::Cursor;
use crate::types::QueueId;

/// Capability for reaching the device's register file.
///
/// Implementations may be backed by a PCIe TLB window, a simulator, or a
/// remote process; the queue protocol is the same for all of them.
pub trait DeviceLink: Send + Sync {
    /// Read the device's issue-side read pointer (packed cursor).
    fn issue_read_ptr(&self, queue: QueueId) -> u32;

    /// Read the device's completion-side write pointer (packed cursor).
    fn completion_write_ptr(&self, queue: QueueId) -> u32;

    /// Doorbell: publish the host's issue write pointer so the device starts
    /// consuming.
    fn post_issue_write_ptr(&self, queue: QueueId, packed: u32);

    /// Doorbell: publish the host's completion read pointer so the device can
    /// reuse the freed space.
    fn post_completion_read_ptr(&self, queue: QueueId, packed: u32);
}

struct QueueRegisters {
    issue_read: AtomicU32,
    completion_write: AtomicU32,
    issue_write: AtomicU32,
    completion_read: AtomicU32,
}

/// Register file shared between the host and an in-process device (simulator
/// or test double).
///
/// The host side goes through [`DeviceLink`]; the device side uses the
/// `device_*` methods to observe doorbells and publish its own progress.
pub struct RegisterFile {
    queues: Vec<QueueRegisters>,
}

impl RegisterFile {
    /// Registers for `layouts.len()` queues, each initialized to the
    /// queue-creation cursor state (ring starts, cleared parity).
    pub fn new(layouts: &[QueueLayout]) -> Self {
        let queues = layouts
            .iter()
            .map(|layout| {
                let issue = Cursor::at_start(layout.issue_span()).packed();
                let completion = Cursor::at_start(layout.completion_span()).packed();
                QueueRegisters {
                    issue_read: AtomicU32::new(issue),
                    completion_write: AtomicU32::new(completion),
                    issue_write: AtomicU32::new(issue),
                    completion_read: AtomicU32::new(completion),
                }
            })
            .collect();
        RegisterFile { queues }
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    fn regs(&self, queue: QueueId) -> &QueueRegisters {
        &self.queues[queue.index()]
    }

    /// Device side: observe the host's issue write doorbell.
    pub fn device_issue_write_ptr(&self, queue: QueueId) -> u32 {
        self.regs(queue).issue_write.load(Ordering::Acquire)
    }

    /// Device side: observe the host's completion read doorbell.
    pub fn device_completion_read_ptr(&self, queue: QueueId) -> u32 {
        self.regs(queue).completion_read.load(Ordering::Acquire)
    }

    /// Device side: publish consumption progress on the issue ring.
    pub fn device_publish_issue_read(&self, queue: QueueId, packed: u32) {
        self.regs(queue).issue_read.store(packed, Ordering::Release);
    }

    /// Device side: publish a new completion record.
    pub fn device_publish_completion_write(&self, queue: QueueId, packed: u32) {
        self.regs(queue)
            .completion_write
            .store(packed, Ordering::Release);
    }
}

impl DeviceLink for RegisterFile {
    fn issue_read_ptr(&self, queue: QueueId) -> u32 {
        self.regs(queue).issue_read.load(Ordering::Acquire)
    }

    fn completion_write_ptr(&self, queue: QueueId) -> u32 {
        self.regs(queue).completion_write.load(Ordering::Acquire)
    }

    fn post_issue_write_ptr(&self, queue: QueueId, packed: u32) {
        self.regs(queue).issue_write.store(packed, Ordering::Release);
    }

    fn post_completion_read_ptr(&self, queue: QueueId, packed: u32) {
        self.regs(queue)
            .completion_read
            .store(packed, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DEFAULT_ISSUE_FRACTION;

    #[test]
    fn registers_start_at_ring_starts() {
        let layout = QueueLayout::new(4096, 0, DEFAULT_ISSUE_FRACTION).unwrap();
        let regs = RegisterFile::new(&[layout]);
        let q = QueueId::new(0);
        assert_eq!(
            Cursor::from_packed(regs.issue_read_ptr(q)),
            Cursor::at_start(layout.issue_span())
        );
        assert_eq!(
            Cursor::from_packed(regs.completion_write_ptr(q)),
            Cursor::at_start(layout.completion_span())
        );
        // Host doorbells mirror the same initial cursors.
        assert_eq!(regs.device_issue_write_ptr(q), regs.issue_read_ptr(q));
        assert_eq!(
            regs.device_completion_read_ptr(q),
            regs.completion_write_ptr(q)
        );
    }

    #[test]
    fn doorbells_are_visible_to_the_device_side() {
        let layout = QueueLayout::new(4096, 0, DEFAULT_ISSUE_FRACTION).unwrap();
        let regs = RegisterFile::new(&[layout]);
        let q = QueueId::new(0);
        let cursor = Cursor::new(layout.issue_span().start() + 4, true);
        regs.post_issue_write_ptr(q, cursor.packed());
        assert_eq!(Cursor::from_packed(regs.device_issue_write_ptr(q)), cursor);
    }
}
