// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Deterministic in-process endpoint double.
//!
//! Implements the full driver boundary over plain in-memory state: local
//! and PCI config registers, remote endpoint config space and memory
//! regions, window slots with bounded backing, a doorbell queue, a
//! port-write queue and the mailbox receive pools. Host components run
//! unmodified against it, and the test hooks inject fabric-side traffic
//! and observe what crossed the boundary.
//!
//! Maintenance transactions deliberately dwell for a short time while an
//! in-flight counter is raised; a second transaction entering during the
//! dwell trips the overlap flag, which is how the serialization contract
//! is verified without touching hardware.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal (test support)
//! TEST_COVERAGE: exercised by every integration test under tests/

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::control::DmaControl;
use crate::device::csr;
use crate::port::{
    DoorbellWait, Port, PortError, PortFactory, PortResult, PortWriteWait, RxCompletion, RxLease,
    SendTicket, Ticket, TicketCompleter,
};
use crate::wire::{DoorbellEntry, Op, PortWriteMessage, MAILBOX_COUNT, WINDOW_SLOTS};

/// Status the double reports for a malformed request word.
pub const STATUS_BAD_REQUEST: u32 = 0x57;
/// Status the double reports when a transfer names memory no test
/// installed.
pub const STATUS_NO_TARGET: u32 = 0x490;

/// Largest backing buffer kept per window slot; windows may be configured
/// larger, but accesses must stay inside the backing.
const WINDOW_BACKING_CAP: u64 = 4 << 20;

/// How long a maintenance transaction dwells inside the double, long
/// enough for a racing transaction to land in the window.
const MAINT_DWELL: Duration = Duration::from_micros(200);

/// Posted-receive FIFO for one mailbox: (owning port id, buffer).
type RxFifo = VecDeque<(u64, RxLease)>;

struct RemoteRegion {
    base: u64,
    data: Vec<u8>,
}

struct BoundWindow {
    base: u64,
    size: u64,
    backing: Vec<u8>,
}

struct DoorbellState {
    queue: VecDeque<DoorbellEntry>,
    waiters: Vec<(u64, TicketCompleter<Vec<DoorbellEntry>>)>,
}

struct PortWriteState {
    queue: VecDeque<PortWriteMessage>,
    waiters: Vec<(u64, TicketCompleter<PortWriteMessage>)>,
}

/// Blocking completion queue for one handle, closeable from either side.
struct CompletionQueue {
    state: Mutex<CqState>,
    cond: Condvar,
}

struct CqState {
    queue: VecDeque<RxCompletion>,
    closed: bool,
}

impl CompletionQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CqState { queue: VecDeque::new(), closed: false }),
            cond: Condvar::new(),
        })
    }

    fn push(&self, completion: RxCompletion) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.queue.push_back(completion);
        self.cond.notify_one();
    }

    fn pop(&self) -> PortResult<RxCompletion> {
        let mut state = self.state.lock();
        loop {
            if let Some(completion) = state.queue.pop_front() {
                return Ok(completion);
            }
            if state.closed {
                return Err(PortError::Abandoned);
            }
            self.cond.wait(&mut state);
        }
    }

    fn close(&self) {
        self.state.lock().closed = true;
        self.cond.notify_all();
    }
}

struct Shared {
    registers: Mutex<HashMap<u32, u32>>,
    pcfg: Mutex<HashMap<u32, u32>>,
    remote_regs: Mutex<HashMap<(u16, u32, u32), u32>>,
    remote_mem: Mutex<HashMap<u16, RemoteRegion>>,
    inbound: Mutex<Vec<Option<BoundWindow>>>,
    // Outbound slots only track (base, size).
    outbound: Mutex<Vec<Option<(u64, u64)>>>,
    doorbell: Mutex<DoorbellState>,
    port_write: Mutex<PortWriteState>,
    rx_posted: Mutex<[RxFifo; MAILBOX_COUNT as usize]>,
    ports: Mutex<HashMap<u64, Arc<CompletionQueue>>>,
    sent_messages: Mutex<Vec<(u8, u16, Vec<u8>)>>,
    sent_doorbells: Mutex<Vec<(u16, u16, bool)>>,
    fail_window: Mutex<Option<u32>>,
    local_host_id: Mutex<u32>,
    ib_msg_dev_id: Mutex<u32>,
    pw_enabled: AtomicBool,
    maint_in_flight: AtomicUsize,
    maint_overlap: AtomicBool,
    boundary_calls: AtomicUsize,
    next_port_id: AtomicU64,
}

impl Shared {
    fn new() -> Arc<Self> {
        let mut registers = HashMap::new();
        // Link comes up by default.
        registers.insert(csr::RIO_PORT_N_ERR_STAT_CSR, 0x02);
        let mut pcfg = HashMap::new();
        // BAR0 looks mapped.
        pcfg.insert(0x10, 0xf000_0000);
        Arc::new(Self {
            registers: Mutex::new(registers),
            pcfg: Mutex::new(pcfg),
            remote_regs: Mutex::new(HashMap::new()),
            remote_mem: Mutex::new(HashMap::new()),
            inbound: Mutex::new((0..WINDOW_SLOTS).map(|_| None).collect()),
            outbound: Mutex::new(vec![None; WINDOW_SLOTS]),
            doorbell: Mutex::new(DoorbellState { queue: VecDeque::new(), waiters: Vec::new() }),
            port_write: Mutex::new(PortWriteState { queue: VecDeque::new(), waiters: Vec::new() }),
            rx_posted: Mutex::new(Default::default()),
            ports: Mutex::new(HashMap::new()),
            sent_messages: Mutex::new(Vec::new()),
            sent_doorbells: Mutex::new(Vec::new()),
            fail_window: Mutex::new(None),
            local_host_id: Mutex::new(0),
            ib_msg_dev_id: Mutex::new(0),
            pw_enabled: AtomicBool::new(false),
            maint_in_flight: AtomicUsize::new(0),
            maint_overlap: AtomicBool::new(false),
            boundary_calls: AtomicUsize::new(0),
            next_port_id: AtomicU64::new(1),
        })
    }

    /// Routes a message to the oldest posted buffer on `mbox`, completing
    /// it on the owning handle's queue. Fails when nothing is posted.
    fn deliver_message(&self, mbox: u8, source: u16, data: &[u8]) -> PortResult<usize> {
        let (port_id, lease) = {
            let mut posted = self.rx_posted.lock();
            let fifo = posted
                .get_mut(mbox as usize)
                .ok_or(PortError::Device(STATUS_BAD_REQUEST))?;
            fifo.pop_front().ok_or(PortError::Device(STATUS_NO_TARGET))?
        };
        let len = lease.fill(data);
        let queue = self.ports.lock().get(&port_id).cloned();
        match queue {
            Some(queue) => {
                queue.push(RxCompletion { slot: lease.slot(), source, len });
                Ok(len)
            }
            None => Err(PortError::Device(STATUS_NO_TARGET)),
        }
    }

    fn push_doorbell(&self, entry: DoorbellEntry) {
        let mut state = self.doorbell.lock();
        if state.waiters.is_empty() {
            state.queue.push_back(entry);
        } else {
            let (_, completer) = state.waiters.remove(0);
            completer.complete(Ok(vec![entry]));
        }
    }
}

/// In-process endpoint double; opens [`Port`] handles and exposes the
/// fabric-side test hooks.
pub struct LoopbackEndpoint {
    shared: Arc<Shared>,
}

impl Default for LoopbackEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackEndpoint {
    /// Creates an endpoint with the link up and everything else empty.
    pub fn new() -> Self {
        Self { shared: Shared::new() }
    }

    /// Installs a remote memory region of `size` zero bytes at `base` on
    /// endpoint `dest`; DMA to that endpoint must stay inside it.
    pub fn install_remote_window(&self, dest: u16, base: u64, size: usize) {
        self.shared
            .remote_mem
            .lock()
            .insert(dest, RemoteRegion { base, data: vec![0; size] });
    }

    /// Copy of `len` bytes at fabric address `addr` on endpoint `dest`.
    pub fn remote_snapshot(&self, dest: u16, addr: u64, len: usize) -> Option<Vec<u8>> {
        let mem = self.shared.remote_mem.lock();
        let region = mem.get(&dest)?;
        let start = addr.checked_sub(region.base)? as usize;
        region.data.get(start..start + len).map(<[u8]>::to_vec)
    }

    /// Delivers a doorbell as if the fabric raised it.
    pub fn inject_doorbell(&self, entry: DoorbellEntry) {
        self.shared.push_doorbell(entry);
    }

    /// Delivers a port-write event as if the fabric raised it.
    pub fn inject_port_write(&self, msg: PortWriteMessage) {
        let mut state = self.shared.port_write.lock();
        if state.waiters.is_empty() {
            state.queue.push_back(msg);
        } else {
            let (_, completer) = state.waiters.remove(0);
            completer.complete(Ok(msg));
        }
    }

    /// Delivers an inbound message from `source`; `false` when no receive
    /// buffer was posted on `mbox`.
    pub fn inject_message(&self, mbox: u8, source: u16, data: &[u8]) -> bool {
        self.shared.deliver_message(mbox, source, data).is_ok()
    }

    /// Number of receive buffers currently posted on `mbox`.
    pub fn pending_receives(&self, mbox: u8) -> usize {
        self.shared.rx_posted.lock()[mbox as usize].len()
    }

    /// Everything sent with MSG_SEND so far: (mailbox, dest, payload).
    pub fn sent_messages(&self) -> Vec<(u8, u16, Vec<u8>)> {
        self.shared.sent_messages.lock().clone()
    }

    /// Every doorbell sent so far: (dest, info, critical flow).
    pub fn sent_doorbells(&self) -> Vec<(u16, u16, bool)> {
        self.shared.sent_doorbells.lock().clone()
    }

    /// Makes the next window bind fail with driver status `code`.
    pub fn fail_next_window(&self, code: u32) {
        *self.shared.fail_window.lock() = Some(code);
    }

    /// Total requests that crossed the boundary.
    pub fn boundary_calls(&self) -> usize {
        self.shared.boundary_calls.load(Ordering::Relaxed)
    }

    /// Overwrites the port error/status register.
    pub fn set_link_status(&self, raw: u32) {
        self.shared
            .registers
            .lock()
            .insert(csr::RIO_PORT_N_ERR_STAT_CSR, raw);
    }

    /// Base address decoded from the most recent bind of inbound `slot`.
    pub fn inbound_window_base(&self, slot: usize) -> Option<u64> {
        let windows = self.shared.inbound.lock();
        windows.get(slot)?.as_ref().map(|w| w.base)
    }

    /// Base address decoded from the most recent bind of outbound `slot`.
    pub fn outbound_window_base(&self, slot: usize) -> Option<u64> {
        let windows = self.shared.outbound.lock();
        windows.get(slot)?.map(|(base, _)| base)
    }

    /// True once two maintenance transactions have overlapped in time.
    pub fn maintenance_overlap_detected(&self) -> bool {
        self.shared.maint_overlap.load(Ordering::Acquire)
    }

    /// Whether port-write delivery has been enabled.
    pub fn port_writes_enabled(&self) -> bool {
        self.shared.pw_enabled.load(Ordering::Acquire)
    }
}

impl PortFactory for LoopbackEndpoint {
    fn open(&self) -> PortResult<Arc<dyn Port>> {
        let id = self.shared.next_port_id.fetch_add(1, Ordering::Relaxed);
        let completions = CompletionQueue::new();
        self.shared.ports.lock().insert(id, Arc::clone(&completions));
        Ok(Arc::new(LoopbackPort {
            id,
            shared: Arc::clone(&self.shared),
            completions,
            closed: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }))
    }
}

struct LoopbackPort {
    id: u64,
    shared: Arc<Shared>,
    completions: Arc<CompletionQueue>,
    closed: AtomicBool,
    cancelled: AtomicBool,
}

impl LoopbackPort {
    fn enter(&self) -> PortResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PortError::Closed);
        }
        self.shared.boundary_calls.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn maintenance<R>(&self, body: impl FnOnce() -> R) -> R {
        let in_flight = self.shared.maint_in_flight.fetch_add(1, Ordering::AcqRel);
        if in_flight > 0 {
            self.shared.maint_overlap.store(true, Ordering::Release);
        }
        thread::sleep(MAINT_DWELL);
        let result = body();
        self.shared.maint_in_flight.fetch_sub(1, Ordering::AcqRel);
        result
    }

    /// Word shape `[select, base_lo, base_hi, pages]`; the base travels
    /// low word first.
    fn bind_window(&self, op: Op, input: &[u32]) -> PortResult<()> {
        if let Some(code) = self.shared.fail_window.lock().take() {
            return Err(PortError::Device(code));
        }
        let [select, lo, hi, pages] = args(input)?;
        let slot = (select & 0xff) as usize;
        let size = crate::wire::window_pages_to_size(pages);
        if slot >= WINDOW_SLOTS || size == 0 {
            return Err(PortError::Device(STATUS_BAD_REQUEST));
        }
        let base = (hi as u64) << 32 | lo as u64;
        match op {
            Op::R2pWinSet => {
                let backing = vec![0u8; size.min(WINDOW_BACKING_CAP) as usize];
                self.shared.inbound.lock()[slot] = Some(BoundWindow { base, size, backing });
            }
            Op::P2rWinSet => {
                self.shared.outbound.lock()[slot] = Some((base, size));
            }
            _ => return Err(PortError::Device(STATUS_BAD_REQUEST)),
        }
        Ok(())
    }

    fn free_window(&self, op: Op, input: &[u32]) -> PortResult<()> {
        let [slot] = args(input)?;
        let slot = slot as usize;
        if slot >= WINDOW_SLOTS {
            return Err(PortError::Device(STATUS_BAD_REQUEST));
        }
        match op {
            Op::R2pWinFree => self.shared.inbound.lock()[slot] = None,
            Op::P2rWinFree => self.shared.outbound.lock()[slot] = None,
            _ => return Err(PortError::Device(STATUS_BAD_REQUEST)),
        }
        Ok(())
    }

    /// Resolves a DMA request header to (dest, absolute address); the
    /// control word is decoded to catch malformed reserved bits.
    fn dma_target(input: &[u32]) -> PortResult<(u16, u64)> {
        let [dest, hi, lo, ctrl] = *input else {
            return Err(PortError::Device(STATUS_BAD_REQUEST));
        };
        if DmaControl::decode(ctrl).is_err() {
            return Err(PortError::Device(STATUS_BAD_REQUEST));
        }
        Ok((dest as u16, (hi as u64) << 32 | lo as u64))
    }
}

impl Port for LoopbackPort {
    fn control(&self, op: Op, input: &[u32], out_len: usize) -> PortResult<Vec<u32>> {
        self.enter()?;
        match op {
            Op::RegRead => {
                let [offset] = args(input)?;
                let regs = self.shared.registers.lock();
                Ok((0..out_len)
                    .map(|i| *regs.get(&(offset + 4 * i as u32)).unwrap_or(&0))
                    .collect())
            }
            Op::RegWrite => {
                let [offset, value] = args(input)?;
                self.shared.registers.lock().insert(offset, value);
                Ok(Vec::new())
            }
            Op::PcfgRead => {
                let [offset] = args(input)?;
                Ok(vec![*self.shared.pcfg.lock().get(&offset).unwrap_or(&0)])
            }
            Op::PcfgWrite => {
                let [offset, value] = args(input)?;
                self.shared.pcfg.lock().insert(offset, value);
                Ok(Vec::new())
            }
            Op::MntRead => {
                let [dest, hop, offset] = args(input)?;
                self.maintenance(|| {
                    let regs = self.shared.remote_regs.lock();
                    Ok((0..out_len)
                        .map(|i| {
                            *regs.get(&(dest as u16, hop, offset + 4 * i as u32)).unwrap_or(&0)
                        })
                        .collect())
                })
            }
            Op::MntWrite => {
                let [dest, hop, offset, value] = args(input)?;
                self.maintenance(|| {
                    self.shared.remote_regs.lock().insert((dest as u16, hop, offset), value);
                    Ok(Vec::new())
                })
            }
            Op::DbSend => {
                let [dest, word] = args(input)?;
                let dest = dest as u16;
                let info = (word & 0xffff) as u16;
                let crf = word >> 31 != 0;
                self.shared.sent_doorbells.lock().push((dest, info, crf));
                // Doorbells to the local id loop straight back.
                let local = *self.shared.local_host_id.lock() as u16;
                if dest == local {
                    self.shared.push_doorbell(DoorbellEntry {
                        source: local,
                        destination: dest,
                        info,
                        misc: 0,
                    });
                }
                Ok(Vec::new())
            }
            Op::DbCheck => {
                let [queue] = args(input)?;
                let len = if queue == 0 { self.shared.doorbell.lock().queue.len() } else { 0 };
                Ok(vec![len as u32])
            }
            Op::DbGet => {
                let [queue] = args(input)?;
                // Capacity is implied by the caller's output buffer.
                let max = out_len / DoorbellEntry::WORDS;
                let mut entries = Vec::new();
                if queue == 0 {
                    let mut state = self.shared.doorbell.lock();
                    while entries.len() < max {
                        match state.queue.pop_front() {
                            Some(e) => entries.push(e),
                            None => break,
                        }
                    }
                }
                Ok(DoorbellEntry::encode_all(&entries))
            }
            Op::IbMsgDevIdSet => {
                let [id] = args(input)?;
                *self.shared.ib_msg_dev_id.lock() = id;
                Ok(Vec::new())
            }
            Op::IbMsgDevIdGet => {
                let [] = args(input)?;
                Ok(vec![*self.shared.ib_msg_dev_id.lock()])
            }
            Op::SetLocalHostId => {
                let [id] = args(input)?;
                *self.shared.local_host_id.lock() = id;
                Ok(Vec::new())
            }
            Op::GetLocalHostId => {
                let [] = args(input)?;
                Ok(vec![*self.shared.local_host_id.lock()])
            }
            Op::PwEnable => {
                let [flag] = args(input)?;
                self.shared.pw_enabled.store(flag != 0, Ordering::Release);
                Ok(Vec::new())
            }
            Op::P2rWinSet | Op::R2pWinSet => self.bind_window(op, input).map(|()| Vec::new()),
            Op::P2rWinFree | Op::R2pWinFree => self.free_window(op, input).map(|()| Vec::new()),
            // These travel the direct-data or asynchronous paths, never
            // the buffered one.
            Op::SrioWrite
            | Op::SrioRead
            | Op::IbwBufferGet
            | Op::IbwBufferPut
            | Op::DbWait
            | Op::MsgSend
            | Op::MsgAddRxBuf
            | Op::PwWait => Err(PortError::Device(STATUS_BAD_REQUEST)),
        }
        .map(|words: Vec<u32>| {
            debug_assert!(words.len() <= out_len, "{} returned more than {out_len} words", op.name());
            words
        })
    }

    fn write_block(&self, op: Op, input: &[u32], data: &[u8]) -> PortResult<usize> {
        self.enter()?;
        match op {
            Op::SrioWrite => {
                let (dest, addr) = Self::dma_target(input)?;
                let mut mem = self.shared.remote_mem.lock();
                let region = mem.get_mut(&dest).ok_or(PortError::Device(STATUS_NO_TARGET))?;
                let start = addr
                    .checked_sub(region.base)
                    .ok_or(PortError::Device(STATUS_NO_TARGET))? as usize;
                let slice = region
                    .data
                    .get_mut(start..start + data.len())
                    .ok_or(PortError::Device(STATUS_NO_TARGET))?;
                slice.copy_from_slice(data);
                Ok(data.len())
            }
            Op::IbwBufferPut => {
                let slot = *input.first().ok_or(PortError::Device(STATUS_BAD_REQUEST))? as usize;
                let offset = window_offset(input)?;
                let mut windows = self.shared.inbound.lock();
                let window = windows
                    .get_mut(slot)
                    .and_then(Option::as_mut)
                    .ok_or(PortError::Device(STATUS_BAD_REQUEST))?;
                if (offset + data.len()) as u64 > window.size {
                    return Err(PortError::Device(STATUS_BAD_REQUEST));
                }
                let slice = window
                    .backing
                    .get_mut(offset..offset + data.len())
                    .ok_or(PortError::Device(STATUS_BAD_REQUEST))?;
                slice.copy_from_slice(data);
                Ok(data.len())
            }
            _ => Err(PortError::Device(STATUS_BAD_REQUEST)),
        }
    }

    fn read_block(&self, op: Op, input: &[u32], buf: &mut [u8]) -> PortResult<usize> {
        self.enter()?;
        match op {
            Op::SrioRead => {
                let (dest, addr) = Self::dma_target(input)?;
                let mem = self.shared.remote_mem.lock();
                let region = mem.get(&dest).ok_or(PortError::Device(STATUS_NO_TARGET))?;
                let start = addr
                    .checked_sub(region.base)
                    .ok_or(PortError::Device(STATUS_NO_TARGET))? as usize;
                let slice = region
                    .data
                    .get(start..start + buf.len())
                    .ok_or(PortError::Device(STATUS_NO_TARGET))?;
                buf.copy_from_slice(slice);
                Ok(buf.len())
            }
            Op::IbwBufferGet => {
                let slot = *input.first().ok_or(PortError::Device(STATUS_BAD_REQUEST))? as usize;
                let offset = window_offset(input)?;
                let windows = self.shared.inbound.lock();
                let window = windows
                    .get(slot)
                    .and_then(Option::as_ref)
                    .ok_or(PortError::Device(STATUS_BAD_REQUEST))?;
                if (offset + buf.len()) as u64 > window.size {
                    return Err(PortError::Device(STATUS_BAD_REQUEST));
                }
                let slice = window
                    .backing
                    .get(offset..offset + buf.len())
                    .ok_or(PortError::Device(STATUS_BAD_REQUEST))?;
                buf.copy_from_slice(slice);
                Ok(buf.len())
            }
            _ => Err(PortError::Device(STATUS_BAD_REQUEST)),
        }
    }

    fn doorbell_wait(&self, queue: u32) -> PortResult<DoorbellWait> {
        self.enter()?;
        let mut state = self.shared.doorbell.lock();
        // Checked under the lock: cancel_pending stores the flag before
        // sweeping the waiter list with this lock held, so either this
        // wait sees the flag or the sweep sees the waiter.
        if self.cancelled.load(Ordering::Acquire) {
            return Err(PortError::Abandoned);
        }
        if queue == 0 && !state.queue.is_empty() {
            return Ok(DoorbellWait::Ready(state.queue.drain(..).collect()));
        }
        let (completer, ticket) = Ticket::pending();
        state.waiters.push((self.id, completer));
        Ok(DoorbellWait::Pending(ticket))
    }

    fn port_write_wait(&self) -> PortResult<PortWriteWait> {
        self.enter()?;
        let mut state = self.shared.port_write.lock();
        if self.cancelled.load(Ordering::Acquire) {
            return Err(PortError::Abandoned);
        }
        if let Some(msg) = state.queue.pop_front() {
            return Ok(PortWriteWait::Ready(msg));
        }
        let (completer, ticket) = Ticket::pending();
        state.waiters.push((self.id, completer));
        Ok(PortWriteWait::Pending(ticket))
    }

    fn send_message(&self, mbox: u8, dest: u16, data: &[u8]) -> PortResult<SendTicket> {
        self.enter()?;
        self.shared.sent_messages.lock().push((mbox, dest, data.to_vec()));
        // Messages to the local id loop straight back; everything else is
        // considered accepted by the fabric.
        let local = *self.shared.local_host_id.lock() as u16;
        let outcome = if dest == local {
            self.shared.deliver_message(mbox, local, data)
        } else {
            Ok(data.len())
        };
        let (completer, ticket) = Ticket::pending();
        completer.complete(outcome);
        Ok(ticket)
    }

    fn post_receive(&self, mbox: u8, lease: RxLease) -> PortResult<()> {
        self.enter()?;
        let mut posted = self.shared.rx_posted.lock();
        let fifo = posted
            .get_mut(mbox as usize)
            .ok_or(PortError::Device(STATUS_BAD_REQUEST))?;
        fifo.push_back((self.id, lease));
        Ok(())
    }

    fn next_completion(&self) -> PortResult<RxCompletion> {
        self.completions.pop()
    }

    fn cancel_pending(&self) {
        // Sticky: waits issued after this point fail immediately.
        self.cancelled.store(true, Ordering::Release);
        // Dropping a waiter's completer abandons its ticket.
        self.shared.doorbell.lock().waiters.retain(|(id, _)| *id != self.id);
        self.shared.port_write.lock().waiters.retain(|(id, _)| *id != self.id);
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.completions.close();
        self.cancel_pending();
        self.shared.ports.lock().remove(&self.id);
        let mut posted = self.shared.rx_posted.lock();
        for fifo in posted.iter_mut() {
            fifo.retain(|(id, _)| *id != self.id);
        }
    }
}

/// Decodes a fixed-arity request; any other word count is malformed.
fn args<const N: usize>(input: &[u32]) -> PortResult<[u32; N]> {
    input.try_into().map_err(|_| PortError::Device(STATUS_BAD_REQUEST))
}

// Offset travels low word first, same order as the bind base.
fn window_offset(input: &[u32]) -> PortResult<usize> {
    let [_slot, lo, hi] = args(input)?;
    Ok(((hi as u64) << 32 | lo as u64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(endpoint: &LoopbackEndpoint) -> Arc<dyn Port> {
        endpoint.open().unwrap()
    }

    #[test]
    fn registers_read_back_and_default_to_zero() {
        let endpoint = LoopbackEndpoint::new();
        let port = open(&endpoint);
        port.control(Op::RegWrite, &[0x100, 0xabcd], 0).unwrap();
        let out = port.control(Op::RegRead, &[0x100], 2).unwrap();
        assert_eq!(out, vec![0xabcd, 0]);
    }

    #[test]
    fn buffered_requests_enforce_exact_word_counts() {
        let endpoint = LoopbackEndpoint::new();
        let port = open(&endpoint);
        let bad = Err(PortError::Device(STATUS_BAD_REQUEST));
        // read counts come from the output buffer, never the input
        assert_eq!(port.control(Op::RegRead, &[0, 1], 1), bad);
        assert_eq!(port.control(Op::MntRead, &[9, 0xff, 0x60, 1], 1), bad);
        assert_eq!(port.control(Op::DbGet, &[0, 8], 16), bad);
        // get-style requests carry no input at all
        assert_eq!(port.control(Op::GetLocalHostId, &[0], 1), bad);
        // and short requests are just as malformed
        assert_eq!(port.control(Op::RegWrite, &[0x100], 0), bad);
        assert_eq!(port.control(Op::R2pWinSet, &[0, 0, 1], 0), bad);
    }

    #[test]
    fn closed_port_rejects_everything() {
        let endpoint = LoopbackEndpoint::new();
        let port = open(&endpoint);
        port.close();
        assert_eq!(port.control(Op::RegRead, &[0], 1), Err(PortError::Closed));
        assert_eq!(port.next_completion(), Err(PortError::Abandoned));
    }

    #[test]
    fn close_drops_this_ports_posted_receives_only() {
        let endpoint = LoopbackEndpoint::new();
        let a = open(&endpoint);
        let b = open(&endpoint);
        a.post_receive(0, RxLease::new(0, 64)).unwrap();
        b.post_receive(0, RxLease::new(0, 64)).unwrap();
        assert_eq!(endpoint.pending_receives(0), 2);
        a.close();
        assert_eq!(endpoint.pending_receives(0), 1);
    }

    #[test]
    fn injected_message_lands_on_posting_handle() {
        let endpoint = LoopbackEndpoint::new();
        let port = open(&endpoint);
        let lease = RxLease::new(5, 4096);
        port.post_receive(1, lease.clone()).unwrap();
        assert!(endpoint.inject_message(1, 0x22, b"ping"));
        let c = port.next_completion().unwrap();
        assert_eq!(c, RxCompletion { slot: 5, source: 0x22, len: 4 });
        assert_eq!(lease.snapshot(c.len), b"ping");
        // pool is drained now
        assert!(!endpoint.inject_message(1, 0x22, b"again"));
    }
}
