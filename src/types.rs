// src/types.rs

use serde::{Deserialize, Serialize};

/// Identifier of one accelerator device on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u32);

impl DeviceId {
    pub const fn new(id: u32) -> Self {
        DeviceId(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one hardware command queue on a device.
///
/// Queues are numbered densely from zero; the arena owned by a
/// [`SysmemManager`](crate::sysmem::SysmemManager) is split into one region
/// per queue in queue-id order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(u8);

impl QueueId {
    pub const fn new(id: u8) -> Self {
        QueueId(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub(crate) const fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for QueueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical coordinates of a compute core on the chip grid.
///
/// Carried in fault reports so log-based tooling can identify the core that
/// raised an illegal transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreCoord {
    pub x: u32,
    pub y: u32,
}

impl CoreCoord {
    pub const fn new(x: u32, y: u32) -> Self {
        CoreCoord { x, y }
    }
}

impl std::fmt::Display for CoreCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "(x={},y={})", self.x, self.y)
    }
}

/// Address of a buffer in device memory.
///
/// Addresses are runtime values: they change between identical-shape runs and
/// are therefore never part of a program [`Fingerprint`](crate::cache::Fingerprint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddr(u32);

impl DeviceAddr {
    pub const fn new(addr: u32) -> Self {
        DeviceAddr(addr)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for DeviceAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
