// src/dispatch.rs
//
// User-facing queue handle tying the two halves together: programs come out
// of the cache address-independent, get bound to this call's buffer
// addresses, and go onto the wire as RunProgram commands. Sequence numbers
// are per queue handle and monotonically increasing; the device completes in
// the same order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::cache::{BoundProgram, CompiledProgram, Fingerprint, ProgramCache};
use crate::command::{CommandHeader, CommandKind, CompletionHeader, COMPLETION_HEADER_BYTES};
use crate::error::DispatchError;
use crate::sysmem::SysmemManager;
use crate::types::{DeviceAddr, QueueId};

/// One hardware command queue plus the program cache feeding it.
///
/// Cloneable via `Arc`: several handles may target different queues of the
/// same manager and share one cache.
pub struct CommandQueue {
    manager: Arc<SysmemManager>,
    queue: QueueId,
    cache: Arc<ProgramCache>,
    next_seq: AtomicU64,
}

impl CommandQueue {
    pub fn new(manager: Arc<SysmemManager>, queue: QueueId, cache: Arc<ProgramCache>) -> Self {
        CommandQueue {
            manager,
            queue,
            cache,
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn queue_id(&self) -> QueueId {
        self.queue
    }

    pub fn manager(&self) -> &Arc<SysmemManager> {
        &self.manager
    }

    pub fn cache(&self) -> &Arc<ProgramCache> {
        &self.cache
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Submit a program launch: fetch (or compile) the program for
    /// `fingerprint`, bind the current buffer `addresses`, and push the bound
    /// form. Returns the command's sequence number.
    ///
    /// The completion record echoes the runtime arguments the device ran
    /// with, so callers can audit the addresses that were actually used.
    pub fn enqueue_program(
        &self,
        fingerprint: &Fingerprint,
        build: impl FnOnce() -> CompiledProgram,
        addresses: &[DeviceAddr],
        lazy: bool,
    ) -> Result<u64, DispatchError> {
        let program = self.cache.get_or_build(fingerprint, build);
        let bound = program.bind(addresses);
        self.enqueue_bound(&bound, lazy)
    }

    /// Submit an already-bound program without touching the cache.
    pub fn enqueue_bound(&self, bound: &BoundProgram, lazy: bool) -> Result<u64, DispatchError> {
        let payload = bound.encode_payload();
        let completion_bytes =
            COMPLETION_HEADER_BYTES + 4 * bound.args().words().len() as u32;
        let seq = self.next_seq();
        let header = CommandHeader::new(
            CommandKind::RunProgram,
            seq,
            payload.len() as u32,
            completion_bytes,
        );
        self.manager
            .write_then_push(self.queue, &header, &payload, lazy)?;
        Ok(seq)
    }

    /// Fire-and-forget host-to-device transfer. The payload leads with the
    /// destination address word.
    pub fn enqueue_write_buffer(
        &self,
        addr: DeviceAddr,
        data: &[u8],
        lazy: bool,
    ) -> Result<u64, DispatchError> {
        let mut payload = Vec::with_capacity(4 + data.len());
        payload.extend_from_slice(&addr.get().to_le_bytes());
        payload.extend_from_slice(data);
        let seq = self.next_seq();
        let header = CommandHeader::new(CommandKind::WriteBuffer, seq, payload.len() as u32, 0);
        self.manager
            .write_then_push(self.queue, &header, &payload, lazy)?;
        Ok(seq)
    }

    /// Device-to-host readback of `len` bytes; the completion record carries
    /// the data.
    pub fn enqueue_read_buffer(
        &self,
        addr: DeviceAddr,
        len: u32,
        lazy: bool,
    ) -> Result<u64, DispatchError> {
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&addr.get().to_le_bytes());
        payload.extend_from_slice(&len.to_le_bytes());
        let seq = self.next_seq();
        let header = CommandHeader::new(
            CommandKind::ReadBuffer,
            seq,
            payload.len() as u32,
            COMPLETION_HEADER_BYTES + len,
        );
        self.manager
            .write_then_push(self.queue, &header, &payload, lazy)?;
        Ok(seq)
    }

    /// Push a barrier; its completion means every prior command on this queue
    /// finished.
    pub fn enqueue_barrier(&self) -> Result<u64, DispatchError> {
        let seq = self.next_seq();
        let header = CommandHeader::new(CommandKind::Barrier, seq, 0, COMPLETION_HEADER_BYTES);
        self.manager
            .write_then_push(self.queue, &header, &[], false)?;
        Ok(seq)
    }

    /// Post the doorbell for lazily pushed commands.
    pub fn flush(&self) -> Result<(), DispatchError> {
        self.manager.flush(self.queue)
    }

    /// Block for the oldest outstanding completion on this queue.
    pub fn wait(&self) -> Result<(CompletionHeader, Vec<u8>), DispatchError> {
        self.manager.wait_and_pop(self.queue)
    }

    /// Drain this queue completely.
    pub fn synchronize(&self) -> Result<(), DispatchError> {
        self.manager.synchronize(self.queue)
    }
}
