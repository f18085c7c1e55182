// src/sim.rs
//
// An in-process device: a thread that plays the autonomous consumer side of
// the ring protocol against the same window and register file the host uses.
// It exists so the protocol can be exercised end to end without hardware,
// and doubles as the reference for what a real consumer must do:
//
//   - consume commands between its read cursor and the host's issue
//     doorbell, honoring wrap markers;
//   - publish issue-read progress as space is freed;
//   - wait for completion-ring space before writing a record, wrapping
//     first when the record would straddle the limit;
//   - publish the completion write pointer only after the full record is
//     in the window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::cache::decode_program_payload;
use crate::command::{
    CommandHeader, CommandKind, CompletionHeader, CompletionStatus, COMMAND_HEADER_BYTES,
    COMPLETION_HEADER_BYTES,
};
use crate::doorbell::RegisterFile;
use crate::fault::{FaultKind, FaultReport, FaultReporter};
use crate::layout::QueueLayout;
use crate::ring::{free_words, size_to_words, Cursor};
use crate::types::{CoreCoord, DeviceId, QueueId};
use crate::window::HostWindow;

/// Behavior knobs for the simulated device.
#[derive(Clone, Default)]
pub struct SimOptions {
    /// Complete the command with this sequence number as a fault and report
    /// it through the watcher channel.
    pub fault_on_seq: Option<u64>,
    /// Core blamed in injected fault reports.
    pub fault_core: Option<CoreCoord>,
}

struct QueueCursors {
    issue_read: Cursor,
    completion_write: Cursor,
}

struct Worker {
    device: DeviceId,
    window: Arc<HostWindow>,
    regs: Arc<RegisterFile>,
    layouts: Vec<QueueLayout>,
    cursors: Vec<QueueCursors>,
    reporter: Option<FaultReporter>,
    options: SimOptions,
    stop: Arc<AtomicBool>,
}

/// Handle to a running simulated device. Stops and joins on drop.
pub struct SimDevice {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SimDevice {
    pub fn spawn(
        device: DeviceId,
        window: Arc<HostWindow>,
        regs: Arc<RegisterFile>,
        layouts: Vec<QueueLayout>,
        reporter: Option<FaultReporter>,
        options: SimOptions,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let cursors = layouts
            .iter()
            .map(|layout| QueueCursors {
                issue_read: Cursor::at_start(layout.issue_span()),
                completion_write: Cursor::at_start(layout.completion_span()),
            })
            .collect();
        let worker = Worker {
            device,
            window,
            regs,
            layouts,
            cursors,
            reporter,
            options,
            stop: stop.clone(),
        };
        let handle = std::thread::Builder::new()
            .name(format!("sim-device-{}", device))
            .spawn(move || worker.run())
            .expect("spawn sim device thread");
        SimDevice {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Worker {
    fn run(mut self) {
        while !self.stop.load(Ordering::Acquire) {
            let mut progressed = false;
            for index in 0..self.layouts.len() {
                progressed |= self.service_queue(QueueId::new(index as u8));
            }
            if !progressed {
                std::thread::yield_now();
            }
        }
    }

    /// Consume every command the host has published on `queue`. Returns
    /// whether anything was consumed.
    fn service_queue(&mut self, queue: QueueId) -> bool {
        let layout = self.layouts[queue.index()];
        let issue_span = layout.issue_span();
        let mut progressed = false;

        loop {
            let host_write = Cursor::from_packed(self.regs.device_issue_write_ptr(queue));
            let read = self.cursors[queue.index()].issue_read;
            if read == host_write {
                break;
            }
            progressed = true;

            let header_buf = self
                .window
                .read_vec(read.byte_offset(), COMMAND_HEADER_BYTES as usize);
            let header = match CommandHeader::decode(&header_buf) {
                Ok(header) => header,
                Err(e) => {
                    // The host committed garbage; report and go quiet, as a
                    // real dispatch core would after an illegal transaction.
                    if let Some(reporter) = &self.reporter {
                        reporter.report(FaultReport::new(
                            self.device,
                            self.fault_core(),
                            FaultKind::IllegalAccess,
                            format!("undecodable command on queue {}: {}", queue, e),
                        ));
                    }
                    self.stop.store(true, Ordering::Release);
                    return progressed;
                }
            };

            if header.kind == CommandKind::Wrap {
                let cursors = &mut self.cursors[queue.index()];
                cursors.issue_read.rewrap(issue_span);
                let packed = cursors.issue_read.packed();
                self.regs.device_publish_issue_read(queue, packed);
                continue;
            }

            let payload = self.window.read_vec(
                read.byte_offset() + COMMAND_HEADER_BYTES,
                header.payload_bytes as usize,
            );

            // Free the issue space before executing: the host only needs the
            // read pointer to reserve more work.
            {
                let cursors = &mut self.cursors[queue.index()];
                cursors
                    .issue_read
                    .advance(size_to_words(header.total_bytes()), issue_span);
                let packed = cursors.issue_read.packed();
                self.regs.device_publish_issue_read(queue, packed);
            }

            if header.completion_bytes > 0 {
                if !self.post_completion(queue, layout, &header, &payload) {
                    return progressed;
                }
            }
        }
        progressed
    }

    /// Execute one command and write its completion record. Returns false if
    /// the device was stopped while waiting for completion space.
    fn post_completion(
        &mut self,
        queue: QueueId,
        layout: QueueLayout,
        header: &CommandHeader,
        payload: &[u8],
    ) -> bool {
        let span = layout.completion_span();
        let record_words = size_to_words(header.completion_bytes);

        let faulted = self.options.fault_on_seq == Some(header.seq);
        if faulted {
            if let Some(reporter) = &self.reporter {
                reporter.report(FaultReport::new(
                    self.device,
                    self.fault_core(),
                    FaultKind::IllegalAccess,
                    format!(
                        "command seq {} on queue {} performed an illegal memory access",
                        header.seq, queue
                    ),
                ));
            }
        }

        let capacity = header.completion_bytes.saturating_sub(COMPLETION_HEADER_BYTES);
        let result: Vec<u8> = if faulted {
            Vec::new()
        } else {
            match header.kind {
                // Runtime-argument readback: completions for program launches
                // carry the args the device actually ran with.
                CommandKind::RunProgram => decode_program_payload(payload)
                    .map(|(_, args)| {
                        args.iter()
                            .flat_map(|w| w.to_le_bytes())
                            .take(capacity as usize)
                            .collect()
                    })
                    .unwrap_or_default(),
                _ => payload.iter().copied().take(capacity as usize).collect(),
            }
        };

        let cursors = &mut self.cursors[queue.index()];
        // Mirror of the host-side straddle predicate: wrap before writing a
        // record that would cross the limit.
        if record_words > cursors.completion_write.words_to_limit(span) {
            cursors.completion_write.rewrap(span);
        }

        // Wait for the host to free enough completion space.
        loop {
            let host_read = Cursor::from_packed(self.regs.device_completion_read_ptr(queue));
            if free_words(cursors.completion_write, host_read, span) >= record_words {
                break;
            }
            if self.stop.load(Ordering::Acquire) {
                return false;
            }
            std::hint::spin_loop();
        }

        let status = if faulted {
            CompletionStatus::Fault
        } else {
            CompletionStatus::Ok
        };
        let record = CompletionHeader::new(header.seq, status, result.len() as u32);
        let offset = cursors.completion_write.byte_offset();
        self.window.write(offset, &record.encode());
        if !result.is_empty() {
            self.window.write(offset + COMPLETION_HEADER_BYTES, &result);
        }

        // Publish only after the full record is in the window; the host
        // relies on this ordering.
        cursors.completion_write.advance(record_words, span);
        let packed = cursors.completion_write.packed();
        self.regs.device_publish_completion_write(queue, packed);
        true
    }

    fn fault_core(&self) -> CoreCoord {
        self.options.fault_core.unwrap_or(CoreCoord::new(1, 1))
    }
}
