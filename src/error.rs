// src/error.rs

use std::fmt;
use std::time::Duration;

use crate::fault::FaultReport;
use crate::types::QueueId;

/// Misconfiguration detected synchronously at the offending call.
///
/// These are never retried or clamped; the call that caused one fails
/// immediately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The requested region split leaves a zero-sized issue or completion
    /// region after alignment rounding.
    ZeroRegion {
        region_size: u32,
        issue_region_size: u32,
    },
    /// The issue split fraction is outside (0, 1).
    InvalidSplit { fraction_millis: u32 },
    /// A single command (header + payload) exceeds the whole issue region and
    /// could never be reserved.
    OversizedCommand { requested: u32, capacity: u32 },
    /// A command header declares a payload length other than the payload
    /// actually provided.
    PayloadMismatch { declared: u32, actual: usize },
    /// Administrative reconfiguration attempted while commands are in flight.
    QueueBusy { queue: QueueId, in_flight: u32 },
    /// Administrative reconfiguration attempted before the device consumed
    /// every pushed command.
    QueueDraining { queue: QueueId },
    /// The queue id is not backed by this manager.
    UnknownQueue { queue: QueueId },
    /// A pop was requested with no completion-bearing command in flight.
    NoCompletionPending { queue: QueueId },
    /// The backing arena cannot hold the requested queue regions.
    ArenaTooSmall { requested: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::ZeroRegion {
                region_size,
                issue_region_size,
            } => write!(
                f,
                "region split leaves a zero-sized region (region {} B, issue {} B)",
                region_size, issue_region_size
            ),
            ConfigError::InvalidSplit { fraction_millis } => write!(
                f,
                "issue split fraction {}.{:03} is outside (0, 1)",
                fraction_millis / 1000,
                fraction_millis % 1000
            ),
            ConfigError::OversizedCommand {
                requested,
                capacity,
            } => write!(
                f,
                "command of {} B can never fit an issue region of {} B",
                requested, capacity
            ),
            ConfigError::PayloadMismatch { declared, actual } => write!(
                f,
                "header declares {} payload byte(s) but {} were provided",
                declared, actual
            ),
            ConfigError::QueueBusy { queue, in_flight } => write!(
                f,
                "queue {} reconfigured with {} command(s) in flight",
                queue, in_flight
            ),
            ConfigError::QueueDraining { queue } => write!(
                f,
                "queue {} reconfigured before the device drained its issue ring",
                queue
            ),
            ConfigError::UnknownQueue { queue } => write!(f, "unknown queue {}", queue),
            ConfigError::NoCompletionPending { queue } => {
                write!(f, "no completion in flight on queue {}", queue)
            }
            ConfigError::ArenaTooSmall { requested } => {
                write!(f, "arena of {} B cannot be allocated", requested)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// A blocking poll that ended without the awaited condition.
///
/// Backpressure waits are not errors by themselves; these only occur when a
/// caller opted into a poll budget (deadline or cancellation token).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitError {
    /// The cancellation token was triggered mid-poll.
    Cancelled,
    /// The configured deadline elapsed before the device made progress.
    DeadlineExceeded { waited: Duration },
}

impl fmt::Display for WaitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitError::Cancelled => write!(f, "wait cancelled"),
            WaitError::DeadlineExceeded { waited } => {
                write!(f, "device made no progress within {:?}", waited)
            }
        }
    }
}

impl std::error::Error for WaitError {}

/// Top-level error surfaced by dispatch operations.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchError {
    Config(ConfigError),
    Wait(WaitError),
    /// The device reported a fatal fault. The device is poisoned until
    /// [`SysmemManager::recover`](crate::sysmem::SysmemManager::recover).
    Fault(FaultReport),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Config(e) => write!(f, "configuration error: {}", e),
            DispatchError::Wait(e) => write!(f, "wait aborted: {}", e),
            DispatchError::Fault(report) => write!(f, "device fault: {}", report),
        }
    }
}

impl std::error::Error for DispatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DispatchError::Config(e) => Some(e),
            DispatchError::Wait(e) => Some(e),
            DispatchError::Fault(_) => None,
        }
    }
}

impl From<ConfigError> for DispatchError {
    fn from(e: ConfigError) -> Self {
        DispatchError::Config(e)
    }
}

impl From<WaitError> for DispatchError {
    fn from(e: WaitError) -> Self {
        DispatchError::Wait(e)
    }
}

impl From<FaultReport> for DispatchError {
    fn from(report: FaultReport) -> Self {
        DispatchError::Fault(report)
    }
}
