// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Driver boundary seam.
//!
//! A [`Port`] is one open device handle: synchronous request/response for
//! buffered and direct-data operations, plus the two asynchronous
//! completion paths the driver offers. Doorbell/port-write waits and
//! message sends complete through a per-request [`Ticket`]; posted message
//! receives complete through the handle's completion queue
//! ([`Port::next_completion`]). Each worker thread that needs independent
//! completion routing opens its own handle through [`PortFactory`].
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//!
//! PUBLIC API:
//!   - trait `Port`, trait `PortFactory`
//!   - `PortError`: boundary error surfaced to the public `Error`
//!   - `Ticket`: blocking per-request completion
//!   - `RxLease`: pool buffer lent to one in-flight receive
//!   - `RxCompletion`, `DoorbellWait`, `PortWriteWait`, `SendTicket`

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::wire::{DoorbellEntry, Op, PortWriteMessage, PAGE_SIZE};

/// Result type at the driver boundary.
pub type PortResult<T> = std::result::Result<T, PortError>;

/// Errors reported by the driver boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortError {
    /// Driver reported a failure status (opaque code).
    Device(u32),
    /// A pending operation was forcibly terminated by cancellation or
    /// handle close.
    Abandoned,
    /// The handle's completion queue is closed.
    Closed,
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(code) => write!(f, "driver status {code:#x}"),
            Self::Abandoned => write!(f, "pending operation abandoned"),
            Self::Closed => write!(f, "completion queue closed"),
        }
    }
}

impl std::error::Error for PortError {}

/// Blocking handle for one pending asynchronous request.
///
/// Whoever completes the request sends exactly one result; dropping the
/// completer without sending resolves the wait as [`PortError::Abandoned`],
/// which is how cancellation unblocks a waiter deterministically.
pub struct Ticket<T> {
    rx: Receiver<PortResult<T>>,
}

impl<T> Ticket<T> {
    /// Creates a pending ticket and its completer half.
    pub fn pending() -> (TicketCompleter<T>, Self) {
        let (tx, rx) = mpsc::channel();
        (TicketCompleter { tx }, Self { rx })
    }

    /// Blocks until the request completes or is abandoned.
    pub fn wait(self) -> PortResult<T> {
        self.rx.recv().unwrap_or(Err(PortError::Abandoned))
    }
}

/// Completer half of a [`Ticket`].
pub struct TicketCompleter<T> {
    tx: Sender<PortResult<T>>,
}

impl<T> TicketCompleter<T> {
    /// Resolves the ticket; the waiter may already be gone.
    pub fn complete(self, result: PortResult<T>) {
        let _ = self.tx.send(result);
    }
}

/// Outcome of issuing a doorbell wait: entries may already be queued.
pub enum DoorbellWait {
    /// Entries were available immediately.
    Ready(Vec<DoorbellEntry>),
    /// The wait is pending; block on the ticket.
    Pending(Ticket<Vec<DoorbellEntry>>),
}

/// Outcome of issuing a port-write wait.
pub enum PortWriteWait {
    /// A message was available immediately.
    Ready(PortWriteMessage),
    /// The wait is pending; block on the ticket.
    Pending(Ticket<PortWriteMessage>),
}

/// Per-request completion for an asynchronous message send; resolves to
/// the number of bytes the driver accepted.
pub type SendTicket = Ticket<usize>;

/// Completion of one posted message receive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxCompletion {
    /// Slot id of the pool buffer the message landed in.
    pub slot: usize,
    /// Destination id of the sending endpoint.
    pub source: u16,
    /// Delivered payload length in bytes.
    pub len: usize,
}

/// A page-aligned pool buffer lent to one in-flight receive.
///
/// The pool retains ownership; clones of the lease reference the same
/// backing storage. Only the in-flight completion path may touch the
/// bytes, which the interior lock enforces.
#[derive(Clone)]
pub struct RxLease {
    slot: usize,
    buf: Arc<Mutex<AlignedBuf>>,
}

impl RxLease {
    /// Allocates one page-aligned buffer of `capacity` bytes tagged with
    /// `slot`.
    pub fn new(slot: usize, capacity: usize) -> Self {
        Self { slot, buf: Arc::new(Mutex::new(AlignedBuf::new(capacity))) }
    }

    /// Slot id identifying this buffer within its pool.
    pub const fn slot(&self) -> usize {
        self.slot
    }

    /// Usable capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.buf.lock().len
    }

    /// Copies `data` into the buffer, returning the number of bytes that
    /// fit. Used by the completing side.
    pub fn fill(&self, data: &[u8]) -> usize {
        let mut buf = self.buf.lock();
        let n = data.len().min(buf.len);
        buf.as_mut_slice()[..n].copy_from_slice(&data[..n]);
        n
    }

    /// Copies the first `len` bytes out of the buffer.
    pub fn snapshot(&self, len: usize) -> Vec<u8> {
        let buf = self.buf.lock();
        buf.as_slice()[..len.min(buf.len)].to_vec()
    }
}

/// Fixed-size buffer whose payload starts on a page boundary.
///
/// Over-allocates by one page and offsets the payload; this keeps the
/// alignment guarantee without unsafe code.
struct AlignedBuf {
    raw: Box<[u8]>,
    off: usize,
    len: usize,
}

impl AlignedBuf {
    fn new(len: usize) -> Self {
        let raw = vec![0u8; len + PAGE_SIZE].into_boxed_slice();
        let addr = raw.as_ptr() as usize;
        let off = (PAGE_SIZE - addr % PAGE_SIZE) % PAGE_SIZE;
        Self { raw, off, len }
    }

    fn as_slice(&self) -> &[u8] {
        &self.raw[self.off..self.off + self.len]
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.raw[self.off..self.off + self.len]
    }
}

/// One open device handle at the driver boundary.
///
/// Implementations must be safe to share across threads; the kernel
/// driver serializes nothing above this contract.
pub trait Port: Send + Sync {
    /// Issues a buffered request and returns up to `out_len` response
    /// words; fixed-shape requests return exactly `out_len`.
    fn control(&self, op: Op, input: &[u32], out_len: usize) -> PortResult<Vec<u32>>;

    /// Issues a direct-in request carrying `data`; returns bytes accepted.
    fn write_block(&self, op: Op, input: &[u32], data: &[u8]) -> PortResult<usize>;

    /// Issues a direct-out request filling `buf`; returns bytes delivered.
    fn read_block(&self, op: Op, input: &[u32], buf: &mut [u8]) -> PortResult<usize>;

    /// Issues an asynchronous doorbell wait on `queue`.
    fn doorbell_wait(&self, queue: u32) -> PortResult<DoorbellWait>;

    /// Issues an asynchronous port-write wait.
    fn port_write_wait(&self) -> PortResult<PortWriteWait>;

    /// Posts an asynchronous message send to `mbox` on `dest`.
    fn send_message(&self, mbox: u8, dest: u16, data: &[u8]) -> PortResult<SendTicket>;

    /// Posts one receive buffer to `mbox`; its completion arrives through
    /// [`Port::next_completion`] on this handle.
    fn post_receive(&self, mbox: u8, lease: RxLease) -> PortResult<()>;

    /// Blocks for the next posted-receive completion on this handle.
    ///
    /// Fails with [`PortError::Abandoned`] once the queue is closed.
    fn next_completion(&self) -> PortResult<RxCompletion>;

    /// Fails this handle's pending ticket waits with
    /// [`PortError::Abandoned`] and marks the handle cancelled: later
    /// doorbell and port-write waits on it fail the same way, so a stop
    /// racing the gap between two waits cannot strand a worker. Posted
    /// receives stay pending.
    fn cancel_pending(&self);

    /// Closes the handle: the completion queue stops delivering
    /// (pending receives fail [`PortError::Abandoned`]) and pending ticket
    /// waits are cancelled.
    fn close(&self);
}

/// Opens device handles; the device-open collaborator plugs in here.
pub trait PortFactory: Send + Sync {
    /// Opens a new handle bound to its own completion routing.
    fn open(&self) -> PortResult<Arc<dyn Port>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn ticket_resolves_with_sent_result() {
        let (completer, ticket) = Ticket::pending();
        completer.complete(Ok(7usize));
        assert_eq!(ticket.wait(), Ok(7));
    }

    #[test]
    fn dropped_completer_abandons_waiter() {
        let (completer, ticket) = Ticket::<usize>::pending();
        let waiter = thread::spawn(move || ticket.wait());
        drop(completer);
        assert_eq!(waiter.join().unwrap(), Err(PortError::Abandoned));
    }

    #[test]
    fn rx_lease_is_page_aligned_and_copies_both_ways() {
        let lease = RxLease::new(3, PAGE_SIZE);
        assert_eq!(lease.slot(), 3);
        assert_eq!(lease.capacity(), PAGE_SIZE);
        {
            let buf = lease.buf.lock();
            assert_eq!(buf.as_slice().as_ptr() as usize % PAGE_SIZE, 0);
        }
        assert_eq!(lease.fill(b"hello"), 5);
        assert_eq!(lease.snapshot(5), b"hello");
        // Oversized fill is clipped to capacity.
        assert_eq!(lease.fill(&[1u8; PAGE_SIZE + 9]), PAGE_SIZE);
    }
}
