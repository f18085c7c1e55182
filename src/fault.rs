// src/fault.rs
//
// The watcher is an external collaborator: it observes the device and can
// declare an in-flight command illegal at any moment. The dispatch side never
// polls it mid-command; reports are picked up at the next synchronization
// point and poison the device.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{CoreCoord, DeviceId};

/// Classification of a device-side fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultKind {
    /// The command touched memory it does not own.
    IllegalAccess,
    /// The core stopped making progress.
    Hang,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultKind::IllegalAccess => write!(f, "illegal memory access"),
            FaultKind::Hang => write!(f, "core hang"),
        }
    }
}

/// A fatal condition reported by the watcher.
///
/// The rendered message names the device, the physical core coordinates, and
/// a human-readable description, so external tooling can diagnose from logs
/// alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaultReport {
    pub device: DeviceId,
    pub core: CoreCoord,
    pub kind: FaultKind,
    pub detail: String,
}

impl FaultReport {
    pub fn new(
        device: DeviceId,
        core: CoreCoord,
        kind: FaultKind,
        detail: impl Into<String>,
    ) -> Self {
        FaultReport {
            device,
            core,
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "device {} core {}: {}: {}",
            self.device, self.core, self.kind, self.detail
        )
    }
}

/// Watcher-side handle: reports faults into the channel.
#[derive(Clone)]
pub struct FaultReporter {
    inner: Arc<Mutex<VecDeque<FaultReport>>>,
}

impl FaultReporter {
    pub fn report(&self, report: FaultReport) {
        tracing::error!(target: "spindle::fault", %report, "watcher reported fault");
        self.inner.lock().push_back(report);
    }
}

/// Host-side receiver the memory manager drains at synchronization points.
pub struct FaultChannel {
    inner: Arc<Mutex<VecDeque<FaultReport>>>,
}

impl FaultChannel {
    /// Take the oldest undelivered report, if any.
    pub fn take(&self) -> Option<FaultReport> {
        self.inner.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Discard stale reports during explicit recovery.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

/// Create a connected reporter/receiver pair.
pub fn fault_channel() -> (FaultReporter, FaultChannel) {
    let inner = Arc::new(Mutex::new(VecDeque::new()));
    (
        FaultReporter {
            inner: inner.clone(),
        },
        FaultChannel { inner },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_are_delivered_in_order() {
        let (reporter, channel) = fault_channel();
        assert!(channel.is_empty());
        reporter.report(FaultReport::new(
            DeviceId::new(0),
            CoreCoord::new(1, 2),
            FaultKind::IllegalAccess,
            "write to 0xdead0000 beyond buffer end",
        ));
        reporter.report(FaultReport::new(
            DeviceId::new(0),
            CoreCoord::new(3, 4),
            FaultKind::Hang,
            "no heartbeat",
        ));
        assert_eq!(channel.take().unwrap().core, CoreCoord::new(1, 2));
        assert_eq!(channel.take().unwrap().kind, FaultKind::Hang);
        assert!(channel.take().is_none());
    }

    #[test]
    fn message_identifies_device_core_and_cause() {
        let report = FaultReport::new(
            DeviceId::new(3),
            CoreCoord::new(9, 1),
            FaultKind::IllegalAccess,
            "read of unmapped page",
        );
        let rendered = report.to_string();
        assert!(rendered.contains("device 3"));
        assert!(rendered.contains("(x=9,y=1)"));
        assert!(rendered.contains("illegal memory access"));
        assert!(rendered.contains("read of unmapped page"));
    }
}
