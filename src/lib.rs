// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Host-side control and asynchronous transfer library for a
//! PCIe-to-RapidIO bridge endpoint.
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: per-module unit tests + integration tests under tests/
//!
//! PUBLIC API:
//!   - `Device`: register, PCI config and maintenance transport plus BDMA
//!     block transfers and synchronous doorbell operations
//!   - `WindowManager`: inbound/outbound memory-mapped window lifecycle
//!   - `DoorbellChannel` / `MailboxChannel` / `PortWriteMonitor`:
//!     asynchronous notification channels with dedicated worker threads
//!   - `Port` / `PortFactory`: the driver boundary seam (one open handle)
//!   - `LoopbackEndpoint`: deterministic in-process double for host tests
//!
//! ERROR CONDITIONS:
//!   - `Error::InvalidParameter`: bad shape/range, caught before any
//!     boundary call
//!   - `Error::InvalidState`: operation illegal for the current slot or
//!     channel state
//!   - `Error::Device`: driver-reported status, surfaced verbatim with the
//!     failing operation attached
//!
//! DEPENDENCIES:
//!   - parking_lot: locks around slot tables and channel state
//!   - thiserror: public error enum
//!   - log: channel lifecycle and worker diagnostics

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

use std::time::Duration;

pub mod control;
pub mod device;
pub mod dma;
pub mod doorbell;
pub mod loopback;
pub mod mailbox;
pub mod port;
pub mod portwrite;
pub mod window;
pub mod wire;

pub use control::{DestId, DmaControl, FabricAddress, IdMode, Rtype};
pub use device::{Device, LinkStatus};
pub use doorbell::{DoorbellChannel, DoorbellConfig};
pub use loopback::LoopbackEndpoint;
pub use mailbox::{MailboxChannel, MailboxConfig, MailboxMessage};
pub use port::{Port, PortError, PortFactory};
pub use portwrite::PortWriteMonitor;
pub use window::{WindowConfig, WindowManager};
pub use wire::{DoorbellEntry, Op, PortWriteMessage};

/// Result type returned by bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the bridge library.
///
/// Validation and state errors are detected locally without a boundary
/// round-trip; driver statuses are surfaced verbatim with the failing
/// operation attached. No component retries automatically.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Input failed shape or range validation before any boundary call.
    #[error("invalid parameter: {what}")]
    InvalidParameter {
        /// Which input was rejected and why.
        what: String,
    },
    /// Operation is illegal for the current slot or channel state.
    #[error("invalid state: {what}")]
    InvalidState {
        /// Which state transition was rejected.
        what: String,
    },
    /// The driver boundary reported a failure status.
    #[error("{op} failed with driver status {code:#x}")]
    Device {
        /// Wire operation that failed.
        op: &'static str,
        /// Opaque driver status code.
        code: u32,
    },
    /// The fabric link is not operational (derived from the port status
    /// register, not a distinct wire error).
    #[error("fabric link is down (port status {status:#010x})")]
    LinkDown {
        /// Raw value of the port error/status CSR.
        status: u32,
    },
    /// Window allocation failed for resource reasons; callers may retry
    /// with a smaller size.
    #[error("window allocation failed: insufficient resources")]
    ResourceExhausted,
    /// A channel worker did not exit within the bounded stop timeout.
    #[error("{channel} worker did not stop within {timeout:?}")]
    ShutdownTimeout {
        /// Channel whose worker failed to stop.
        channel: &'static str,
        /// Timeout that was exceeded.
        timeout: Duration,
    },
    /// A pending asynchronous operation was forcibly terminated by channel
    /// shutdown or handle close.
    #[error("pending operation abandoned by shutdown")]
    Abandoned,
}

impl Error {
    /// Wraps an input validation failure.
    pub fn invalid_parameter(what: impl Into<String>) -> Self {
        Self::InvalidParameter { what: what.into() }
    }

    /// Wraps an illegal state transition.
    pub fn invalid_state(what: impl Into<String>) -> Self {
        Self::InvalidState { what: what.into() }
    }

    /// Maps a boundary error onto the public error type, attaching the
    /// operation name for diagnosability.
    pub(crate) fn from_port(op: &'static str, err: PortError) -> Self {
        match err {
            PortError::Device(code) => Self::Device { op, code },
            PortError::Abandoned | PortError::Closed => Self::Abandoned,
        }
    }
}
