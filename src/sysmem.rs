// src/sysmem.rs

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::command::{
    CommandHeader, CompletionHeader, CompletionStatus, COMMAND_HEADER_BYTES,
    COMPLETION_HEADER_BYTES,
};
use crate::doorbell::DeviceLink;
use crate::error::{ConfigError, DispatchError};
use crate::fault::{fault_channel, FaultChannel, FaultKind, FaultReport, FaultReporter};
use crate::layout::QueueLayout;
use crate::queue::{PollBudget, QueueInterface};
use crate::ring::{size_to_words, Cursor};
use crate::types::{CoreCoord, DeviceId, QueueId};
use crate::window::HostWindow;

/// How a manager's arena is carved into queues.
#[derive(Clone)]
pub struct SysmemConfig {
    pub num_queues: u8,
    /// Region bytes per queue (header + issue ring + completion ring).
    pub queue_region_size: u32,
    /// Fraction of each region's usable space given to the issue ring.
    pub issue_fraction: f32,
    /// Budget applied to every blocking wait.
    pub budget: PollBudget,
}

impl Default for SysmemConfig {
    fn default() -> Self {
        SysmemConfig {
            num_queues: 1,
            queue_region_size: 1 << 20,
            issue_fraction: crate::layout::DEFAULT_ISSUE_FRACTION,
            budget: PollBudget::unbounded(),
        }
    }
}

/// Compute the per-queue layouts a config describes. Callers use this to
/// build the register file before constructing the manager.
pub fn queue_layouts(config: &SysmemConfig) -> Result<Vec<QueueLayout>, ConfigError> {
    if config.num_queues == 0 {
        return Err(ConfigError::ArenaTooSmall { requested: 0 });
    }
    (0..config.num_queues)
        .map(|i| {
            QueueLayout::new(
                config.queue_region_size,
                i as u32 * config.queue_region_size,
                config.issue_fraction,
            )
        })
        .collect()
}

/// A completion record the host still owes a pop for. Kept in push order;
/// the device completes in the same order (FIFO per queue).
struct PendingCompletion {
    seq: u64,
    record_bytes: u32,
}

struct QueueState {
    iface: Mutex<QueueInterface>,
    pending: Mutex<VecDeque<PendingCompletion>>,
    in_flight: AtomicU32,
}

/// Owns the shared memory window and one [`QueueInterface`] per hardware
/// queue, and performs all cross-address-space synchronization for a device.
///
/// Multiple queues may be driven by independent threads; each queue is a
/// single-producer ring and its interface is guarded by an uncontended lock.
pub struct SysmemManager {
    device: DeviceId,
    window: Arc<HostWindow>,
    link: Arc<dyn DeviceLink>,
    queues: Vec<QueueState>,
    budget: PollBudget,
    faults: FaultChannel,
    reporter: FaultReporter,
    poisoned: Mutex<Option<FaultReport>>,
    metrics: Option<Arc<DispatchMetrics>>,
}

/// Slice used while draining so watcher reports are noticed even when the
/// device stops completing.
const SYNC_POLL_SLICE: Duration = Duration::from_millis(1);

impl SysmemManager {
    pub fn new(
        device: DeviceId,
        config: SysmemConfig,
        link: Arc<dyn DeviceLink>,
    ) -> Result<Self, ConfigError> {
        let layouts = queue_layouts(&config)?;
        let arena = config.num_queues as usize * config.queue_region_size as usize;
        let window = Arc::new(HostWindow::allocate(arena)?);
        let queues = layouts
            .into_iter()
            .map(|layout| QueueState {
                iface: Mutex::new(QueueInterface::new(layout)),
                pending: Mutex::new(VecDeque::new()),
                in_flight: AtomicU32::new(0),
            })
            .collect();
        let (reporter, faults) = fault_channel();
        Ok(SysmemManager {
            device,
            window,
            link,
            queues,
            budget: config.budget,
            faults,
            reporter,
            poisoned: Mutex::new(None),
            metrics: None,
        })
    }

    /// Same as [`new`](Self::new) with a metrics sink attached.
    pub fn new_with_metrics(
        device: DeviceId,
        config: SysmemConfig,
        link: Arc<dyn DeviceLink>,
        metrics: Arc<DispatchMetrics>,
    ) -> Result<Self, ConfigError> {
        let mut manager = Self::new(device, config, link)?;
        manager.metrics = Some(metrics);
        Ok(manager)
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn num_queues(&self) -> usize {
        self.queues.len()
    }

    /// Handle for the watcher (or a simulator) to report faults through.
    pub fn fault_reporter(&self) -> FaultReporter {
        self.reporter.clone()
    }

    /// The backing arena. The device side of an in-process setup reads and
    /// writes rings through this same window.
    pub fn window(&self) -> &Arc<HostWindow> {
        &self.window
    }

    pub fn metrics(&self) -> Option<&Arc<DispatchMetrics>> {
        self.metrics.as_ref()
    }

    pub fn issue_region_size(&self, queue: QueueId) -> Result<u32, ConfigError> {
        Ok(self.state(queue)?.iface.lock().layout().issue_region_size())
    }

    pub fn completion_region_size(&self, queue: QueueId) -> Result<u32, ConfigError> {
        Ok(self
            .state(queue)?
            .iface
            .lock()
            .layout()
            .completion_region_size())
    }

    /// Commands pushed on `queue` whose completions were not yet popped.
    pub fn in_flight(&self, queue: QueueId) -> Result<u32, ConfigError> {
        Ok(self.state(queue)?.in_flight.load(Ordering::Acquire))
    }

    fn state(&self, queue: QueueId) -> Result<&QueueState, ConfigError> {
        self.queues
            .get(queue.index())
            .ok_or(ConfigError::UnknownQueue { queue })
    }

    fn check_poisoned(&self) -> Result<(), DispatchError> {
        match &*self.poisoned.lock() {
            Some(report) => Err(DispatchError::Fault(report.clone())),
            None => Ok(()),
        }
    }

    fn poison(&self, report: FaultReport) -> DispatchError {
        let mut poisoned = self.poisoned.lock();
        if poisoned.is_none() {
            *poisoned = Some(report.clone());
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_fault();
        }
        DispatchError::Fault(report)
    }

    /// Reserve issue space, copy `header` + `payload` into the window, and
    /// advance the write cursor.
    ///
    /// A `lazy` push defers the doorbell so several small commands collapse
    /// into one device-visible update; finish the batch with
    /// [`flush`](Self::flush). A request that would straddle the issue limit
    /// first plants a wrap marker so the payload stays contiguous.
    pub fn write_then_push(
        &self,
        queue: QueueId,
        header: &CommandHeader,
        payload: &[u8],
        lazy: bool,
    ) -> Result<(), DispatchError> {
        self.check_poisoned()?;
        let state = self.state(queue)?;
        if header.payload_bytes as usize != payload.len() {
            return Err(ConfigError::PayloadMismatch {
                declared: header.payload_bytes,
                actual: payload.len(),
            }
            .into());
        }
        let total = header.total_bytes();

        let mut iface = state.iface.lock();
        // A completion record that cannot fit the completion ring would leave
        // the device spinning for space forever; refuse it here, like an
        // oversized command on the issue side.
        let completion_span = iface.layout().completion_span();
        if size_to_words(header.completion_bytes) > completion_span.words() {
            return Err(ConfigError::OversizedCommand {
                requested: header.completion_bytes,
                capacity: completion_span.bytes(),
            }
            .into());
        }
        if iface.issue_straddles(total) {
            // The tail cannot hold this command; plant a wrap marker and
            // continue from the region start. The marker itself needs a
            // reserved slot so it never overwrites unread commands.
            iface.reserve(COMMAND_HEADER_BYTES, &*self.link, queue, &self.budget)?;
            self.window.write(
                iface.issue_write().byte_offset(),
                &CommandHeader::wrap_marker().encode(),
            );
            iface.force_rewrap(&*self.link, queue);
            if let Some(metrics) = &self.metrics {
                metrics.record_issue_wrap();
            }
        }

        iface.reserve(total, &*self.link, queue, &self.budget)?;
        let offset = iface.issue_write().byte_offset();
        self.window.write(offset, &header.encode());
        if !payload.is_empty() {
            self.window.write(offset + COMMAND_HEADER_BYTES, payload);
        }
        iface.advance_write(total, !lazy, &*self.link, queue);
        drop(iface);

        if header.completion_bytes > 0 {
            state.pending.lock().push_back(PendingCompletion {
                seq: header.seq,
                record_bytes: header.completion_bytes,
            });
            state.in_flight.fetch_add(1, Ordering::AcqRel);
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_push(total, lazy);
        }
        tracing::trace!(
            target: "spindle::sysmem",
            queue = queue.get(),
            seq = header.seq,
            bytes = total,
            lazy,
            "command pushed"
        );
        Ok(())
    }

    /// Post the doorbell for any pushes deferred with `lazy = true`.
    pub fn flush(&self, queue: QueueId) -> Result<(), DispatchError> {
        self.check_poisoned()?;
        let state = self.state(queue)?;
        state.iface.lock().notify_write(&*self.link, queue);
        if let Some(metrics) = &self.metrics {
            metrics.record_doorbell();
        }
        Ok(())
    }

    /// Block for the oldest in-flight completion, copy it out, and free its
    /// ring space (always notifying the device).
    ///
    /// The record is complete and self-consistent when observed: the device
    /// only publishes its write pointer after the full record is written.
    pub fn wait_and_pop(
        &self,
        queue: QueueId,
    ) -> Result<(CompletionHeader, Vec<u8>), DispatchError> {
        self.wait_and_pop_with(queue, &self.budget)
    }

    fn wait_and_pop_with(
        &self,
        queue: QueueId,
        budget: &PollBudget,
    ) -> Result<(CompletionHeader, Vec<u8>), DispatchError> {
        self.check_poisoned()?;
        let state = self.state(queue)?;
        let expected = {
            let pending = state.pending.lock();
            match pending.front() {
                Some(p) => PendingCompletion {
                    seq: p.seq,
                    record_bytes: p.record_bytes,
                },
                None => return Err(ConfigError::NoCompletionPending { queue }.into()),
            }
        };

        let mut iface = state.iface.lock();
        iface.wait_completion(&*self.link, queue, budget)?;

        // The device wraps before writing a record that would straddle the
        // limit; mirror the same predicate before reading.
        if iface.completion_straddles(expected.record_bytes) {
            iface.rewrap_completion_read();
            if let Some(metrics) = &self.metrics {
                metrics.record_completion_wrap();
            }
        }

        let offset = iface.completion_read().byte_offset();
        let header_buf = self
            .window
            .read_vec(offset, COMPLETION_HEADER_BYTES as usize);
        let header = match CompletionHeader::decode(&header_buf) {
            Ok(header) if header.seq == expected.seq => header,
            Ok(header) => {
                return Err(self.poison(self.protocol_fault(format!(
                    "completion out of order on queue {}: expected seq {}, found {}",
                    queue, expected.seq, header.seq
                ))));
            }
            Err(e) => {
                return Err(self.poison(self.protocol_fault(format!(
                    "corrupt completion record on queue {}: {}",
                    queue, e
                ))));
            }
        };

        let payload_len = header
            .payload_bytes
            .min(expected.record_bytes.saturating_sub(COMPLETION_HEADER_BYTES))
            as usize;
        let payload = self
            .window
            .read_vec(offset + COMPLETION_HEADER_BYTES, payload_len);

        iface.advance_read(expected.record_bytes, &*self.link, queue);
        drop(iface);

        state.pending.lock().pop_front();
        state.in_flight.fetch_sub(1, Ordering::AcqRel);
        if let Some(metrics) = &self.metrics {
            metrics.record_pop(expected.record_bytes);
        }

        if header.status == CompletionStatus::Fault {
            // Prefer the watcher's report; synthesize one if it has not
            // arrived yet.
            let report = self.faults.take().unwrap_or_else(|| {
                self.protocol_fault(format!(
                    "command seq {} on queue {} completed with fault status",
                    header.seq, queue
                ))
            });
            return Err(self.poison(report));
        }

        Ok((header, payload))
    }

    fn protocol_fault(&self, detail: String) -> FaultReport {
        FaultReport::new(
            self.device,
            CoreCoord::new(0, 0),
            FaultKind::IllegalAccess,
            detail,
        )
    }

    /// Drain `queue`: pop every outstanding completion and surface any
    /// watcher report as a hard synchronization error.
    ///
    /// Watcher reports are re-checked between short poll slices, so a device
    /// that faulted without completing still fails this call instead of
    /// hanging it (subject to the manager's overall budget).
    pub fn synchronize(&self, queue: QueueId) -> Result<(), DispatchError> {
        // A drain implicitly ends an open lazy batch; without the doorbell
        // the device would never see the last pushes.
        self.flush(queue)?;
        let guard = self.budget.start();
        let slice = PollBudget::unbounded().with_deadline(SYNC_POLL_SLICE);
        loop {
            if let Some(report) = self.faults.take() {
                return Err(self.poison(report));
            }
            if self.state(queue)?.pending.lock().is_empty() && self.issue_drained(queue)? {
                return Ok(());
            }
            if self.state(queue)?.pending.lock().is_empty() {
                // Commands without completions are still being consumed;
                // watch the device's read pointer instead.
                guard.check().map_err(DispatchError::Wait)?;
                std::hint::spin_loop();
                continue;
            }
            match self.wait_and_pop_with(queue, &slice) {
                Ok(_) => {}
                Err(DispatchError::Wait(_)) => guard.check().map_err(DispatchError::Wait)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Drain every queue on the device.
    pub fn finish(&self) -> Result<(), DispatchError> {
        for index in 0..self.queues.len() {
            self.synchronize(QueueId::new(index as u8))?;
        }
        Ok(())
    }

    fn issue_drained(&self, queue: QueueId) -> Result<bool, ConfigError> {
        let state = self.state(queue)?;
        let iface = state.iface.lock();
        let read = Cursor::from_packed(self.link.issue_read_ptr(queue));
        Ok(read == iface.issue_write())
    }

    /// Idle gate for reconfiguration: no in-flight completions, and the
    /// device consumed every pushed command. Fire-and-forget commands count
    /// too; the cursors would desync if the rings moved under them.
    fn check_idle(&self, queue: QueueId, state: &QueueState) -> Result<(), ConfigError> {
        let in_flight = state.in_flight.load(Ordering::Acquire);
        if in_flight != 0 {
            return Err(ConfigError::QueueBusy { queue, in_flight });
        }
        if !self.issue_drained(queue)? {
            return Err(ConfigError::QueueDraining { queue });
        }
        Ok(())
    }

    /// Rewind `queue` to its creation state. Only valid while idle.
    ///
    /// The device side must be reset in the same operation window; this only
    /// restores the host's cursors and bookkeeping.
    pub fn reset(&self, queue: QueueId) -> Result<(), ConfigError> {
        let state = self.state(queue)?;
        self.check_idle(queue, state)?;
        state.iface.lock().reset();
        state.pending.lock().clear();
        Ok(())
    }

    /// Resize the issue/completion split of an idle queue, recomputing both
    /// ring limits.
    pub fn set_issue_region_size(&self, queue: QueueId, bytes: u32) -> Result<(), ConfigError> {
        let state = self.state(queue)?;
        self.check_idle(queue, state)?;
        let mut iface = state.iface.lock();
        let layout = iface.layout().with_issue_region_size(bytes)?;
        iface.reconfigure(layout);
        tracing::debug!(
            target: "spindle::sysmem",
            queue = queue.get(),
            issue = bytes,
            "issue region resized"
        );
        Ok(())
    }

    /// Administrative rewrap of a queue's issue cursor, used when flushing a
    /// queue during error recovery.
    pub fn force_rewrap(&self, queue: QueueId) -> Result<(), ConfigError> {
        let state = self.state(queue)?;
        state.iface.lock().force_rewrap(&*self.link, queue);
        Ok(())
    }

    /// Explicit recovery after a fault: clear the poison, drop stale watcher
    /// reports, and reset every queue. The caller is responsible for having
    /// reset the device itself first; nothing is resubmitted.
    pub fn recover(&self) {
        *self.poisoned.lock() = None;
        self.faults.clear();
        for state in &self.queues {
            state.iface.lock().reset();
            state.pending.lock().clear();
            state.in_flight.store(0, Ordering::Release);
        }
        tracing::debug!(target: "spindle::sysmem", device = self.device.get(), "device recovered");
    }
}

// ============================================================================
// Metrics
// ============================================================================

/// Counters for dispatch traffic, useful for tests and for diagnosing
/// doorbell storms or wrap-heavy workloads.
#[derive(Debug, Default)]
pub struct DispatchMetrics {
    commands_pushed: AtomicU64,
    bytes_pushed: AtomicU64,
    doorbells_posted: AtomicU64,
    lazy_pushes: AtomicU64,
    issue_wraps: AtomicU64,
    completion_wraps: AtomicU64,
    completions_popped: AtomicU64,
    bytes_popped: AtomicU64,
    faults: AtomicU64,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn record_push(&self, bytes: u32, lazy: bool) {
        self.commands_pushed.fetch_add(1, Ordering::Relaxed);
        self.bytes_pushed.fetch_add(bytes as u64, Ordering::Relaxed);
        if lazy {
            self.lazy_pushes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.doorbells_posted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_doorbell(&self) {
        self.doorbells_posted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_issue_wrap(&self) {
        self.issue_wraps.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completion_wrap(&self) {
        self.completion_wraps.fetch_add(1, Ordering::Relaxed);
    }

    fn record_pop(&self, bytes: u32) {
        self.completions_popped.fetch_add(1, Ordering::Relaxed);
        self.bytes_popped.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commands_pushed(&self) -> u64 {
        self.commands_pushed.load(Ordering::Relaxed)
    }

    pub fn bytes_pushed(&self) -> u64 {
        self.bytes_pushed.load(Ordering::Relaxed)
    }

    pub fn doorbells_posted(&self) -> u64 {
        self.doorbells_posted.load(Ordering::Relaxed)
    }

    pub fn lazy_pushes(&self) -> u64 {
        self.lazy_pushes.load(Ordering::Relaxed)
    }

    pub fn issue_wraps(&self) -> u64 {
        self.issue_wraps.load(Ordering::Relaxed)
    }

    pub fn completion_wraps(&self) -> u64 {
        self.completion_wraps.load(Ordering::Relaxed)
    }

    pub fn completions_popped(&self) -> u64 {
        self.completions_popped.load(Ordering::Relaxed)
    }

    pub fn bytes_popped(&self) -> u64 {
        self.bytes_popped.load(Ordering::Relaxed)
    }

    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }
}
