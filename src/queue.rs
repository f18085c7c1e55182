// src/queue.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::doorbell::DeviceLink;
use crate::error::{ConfigError, DispatchError, WaitError};
use crate::layout::QueueLayout;
use crate::ring::{free_words, has_pending, size_to_words, Cursor};
use crate::types::QueueId;

/// Cooperative cancellation for spin-waits.
///
/// The hardware consumer cannot wake the host, so `reserve` and
/// `wait_completion` poll. A token lets another thread abandon a poll that
/// would otherwise spin forever.
#[derive(Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Bound on a single spin-wait: optional deadline, optional cancel token.
///
/// The default budget is unbounded, matching the hardware expectation that
/// the device drains within microseconds to low milliseconds.
#[derive(Clone, Default)]
pub struct PollBudget {
    deadline: Option<Duration>,
    cancel: Option<CancelToken>,
}

impl PollBudget {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Begin one wait under this budget.
    pub fn start(&self) -> PollGuard<'_> {
        PollGuard {
            budget: self,
            started: Instant::now(),
        }
    }
}

/// One in-progress wait. Checked every spin iteration.
pub struct PollGuard<'a> {
    budget: &'a PollBudget,
    started: Instant,
}

impl PollGuard<'_> {
    pub fn check(&self) -> Result<(), WaitError> {
        if let Some(token) = &self.budget.cancel {
            if token.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
        }
        if let Some(deadline) = self.budget.deadline {
            let waited = self.started.elapsed();
            if waited >= deadline {
                return Err(WaitError::DeadlineExceeded { waited });
            }
        }
        Ok(())
    }
}

/// Per-queue mutable cursor state and the blocking ring operations.
///
/// One producer thread drives one `QueueInterface`; there is no lock on the
/// cursors themselves. Correctness comes from the monotonic pointer/toggle
/// protocol: this side only reads the device's published cursors through the
/// [`DeviceLink`] and only writes its own.
pub struct QueueInterface {
    layout: QueueLayout,
    issue_write: Cursor,
    completion_read: Cursor,
}

impl QueueInterface {
    pub fn new(layout: QueueLayout) -> Self {
        QueueInterface {
            issue_write: Cursor::at_start(layout.issue_span()),
            completion_read: Cursor::at_start(layout.completion_span()),
            layout,
        }
    }

    pub fn layout(&self) -> &QueueLayout {
        &self.layout
    }

    pub fn issue_write(&self) -> Cursor {
        self.issue_write
    }

    pub fn completion_read(&self) -> Cursor {
        self.completion_read
    }

    /// Rewind both cursors to queue-creation state.
    pub fn reset(&mut self) {
        self.issue_write.reset(self.layout.issue_span());
        self.completion_read.reset(self.layout.completion_span());
    }

    /// Replace the layout (region resize) and reset cursors. Only safe while
    /// no command is in flight; the manager enforces that.
    pub fn reconfigure(&mut self, layout: QueueLayout) {
        self.layout = layout;
        self.reset();
    }

    /// Whether a command of `bytes` would cross the issue limit from the
    /// current write cursor. Straddling payloads must not be split; the
    /// caller wraps first.
    pub fn issue_straddles(&self, bytes: u32) -> bool {
        size_to_words(bytes) > self.issue_write.words_to_limit(self.layout.issue_span())
    }

    /// Block until `bytes` are free ahead of the issue write cursor.
    ///
    /// Space is measured against the device's published read cursor; toggles
    /// disambiguate the full ring from the empty one. A request larger than
    /// the whole issue region can never succeed and fails immediately.
    pub fn reserve(
        &self,
        bytes: u32,
        link: &dyn DeviceLink,
        queue: QueueId,
        budget: &PollBudget,
    ) -> Result<(), DispatchError> {
        let span = self.layout.issue_span();
        let words = size_to_words(bytes);
        if words > span.words() {
            return Err(ConfigError::OversizedCommand {
                requested: bytes,
                capacity: span.bytes(),
            }
            .into());
        }

        let guard = budget.start();
        let mut blocked = false;
        loop {
            let read = Cursor::from_packed(link.issue_read_ptr(queue));
            if free_words(self.issue_write, read, span) >= words {
                return Ok(());
            }
            if !blocked {
                blocked = true;
                tracing::trace!(
                    target: "spindle::queue",
                    queue = queue.get(),
                    bytes,
                    "issue ring full, waiting for device"
                );
            }
            guard.check()?;
            std::hint::spin_loop();
        }
    }

    /// Advance the write cursor over `bytes` (alignment-rounded). Posts the
    /// doorbell unless the push is lazy. Returns `true` if the cursor
    /// wrapped.
    pub fn advance_write(
        &mut self,
        bytes: u32,
        notify: bool,
        link: &dyn DeviceLink,
        queue: QueueId,
    ) -> bool {
        let wrapped = self
            .issue_write
            .advance(size_to_words(bytes), self.layout.issue_span());
        if notify {
            self.notify_write(link, queue);
        }
        wrapped
    }

    /// Post the current write cursor to the device. This is the doorbell a
    /// lazy push defers; batched pushes end with one explicit call.
    pub fn notify_write(&self, link: &dyn DeviceLink, queue: QueueId) {
        link.post_issue_write_ptr(queue, self.issue_write.packed());
    }

    /// Administrative rewrap of the issue write cursor: rewind to the region
    /// start, flip the toggle, and tell the device.
    pub fn force_rewrap(&mut self, link: &dyn DeviceLink, queue: QueueId) {
        self.issue_write.rewrap(self.layout.issue_span());
        tracing::trace!(target: "spindle::queue", queue = queue.get(), "issue cursor rewrapped");
        self.notify_write(link, queue);
    }

    /// Block until the device has published at least one completion record.
    pub fn wait_completion(
        &self,
        link: &dyn DeviceLink,
        queue: QueueId,
        budget: &PollBudget,
    ) -> Result<(), WaitError> {
        let guard = budget.start();
        loop {
            let write = Cursor::from_packed(link.completion_write_ptr(queue));
            if has_pending(write, self.completion_read) {
                return Ok(());
            }
            guard.check()?;
            std::hint::spin_loop();
        }
    }

    /// Whether a completion record of `bytes` would cross the completion
    /// limit from the current read cursor. The device applies the same
    /// predicate before writing, so both sides wrap at the same point.
    pub fn completion_straddles(&self, bytes: u32) -> bool {
        size_to_words(bytes) > self.completion_read.words_to_limit(self.layout.completion_span())
    }

    /// Rewind the completion read cursor to the region start, mirroring the
    /// device's pre-write wrap. The doorbell travels with the next
    /// `advance_read`.
    pub fn rewrap_completion_read(&mut self) {
        self.completion_read.rewrap(self.layout.completion_span());
    }

    /// Advance the read cursor over a consumed record and always post the
    /// doorbell: the device may be waiting for exactly this space.
    pub fn advance_read(&mut self, bytes: u32, link: &dyn DeviceLink, queue: QueueId) -> bool {
        let wrapped = self
            .completion_read
            .advance(size_to_words(bytes), self.layout.completion_span());
        link.post_completion_read_ptr(queue, self.completion_read.packed());
        wrapped
    }
}
