// src/lib.rs

//! Host-side dispatch runtime for a tile accelerator.
//!
//! Two cooperating pieces:
//!
//! - **Command dispatch** ([`sysmem`], [`queue`], [`ring`]): each hardware
//!   queue is a pair of single-producer rings in one shared memory window —
//!   an issue ring the host writes and the device reads, and a completion
//!   ring flowing the other way. Progress is exchanged purely through packed
//!   pointer registers ([`doorbell`]); a wrap-parity bit in each register
//!   disambiguates a full ring from an empty one.
//! - **Program cache** ([`cache`]): compiled programs are expensive and
//!   address-independent. The cache keys on a fingerprint of the
//!   compile-time inputs and re-binds buffer addresses on every submission,
//!   so a cache hit never reruns the compiler and never reuses a stale
//!   address.
//!
//! [`dispatch::CommandQueue`] ties the two together; [`sim::SimDevice`]
//! plays the device side in-process so the whole protocol can run without
//! hardware.

#![forbid(unsafe_op_in_unsafe_fn)]

pub mod cache;
pub mod command;
pub mod dispatch;
pub mod doorbell;
pub mod error;
pub mod fault;
pub mod layout;
pub mod queue;
pub mod ring;
pub mod sim;
pub mod sysmem;
pub mod types;
pub mod window;

pub use cache::{
    AttrValue, BoundProgram, CompiledProgram, DataType, Fingerprint, MemoryKind, PageLayout,
    ProgramCache, RuntimeArgs, TensorSpec,
};
pub use command::{
    CommandFlags, CommandHeader, CommandKind, CompletionHeader, CompletionStatus,
};
pub use dispatch::CommandQueue;
pub use doorbell::{DeviceLink, RegisterFile};
pub use error::{ConfigError, DispatchError, WaitError};
pub use fault::{FaultKind, FaultReport};
pub use queue::{CancelToken, PollBudget};
pub use sim::{SimDevice, SimOptions};
pub use sysmem::{queue_layouts, DispatchMetrics, SysmemConfig, SysmemManager};
pub use types::{CoreCoord, DeviceAddr, DeviceId, QueueId};

#[cfg(test)]
mod proptests;
