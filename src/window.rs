// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Memory window lifecycle for both bridge directions: outbound
//! windows map a host aperture onto fabric memory (P2R), inbound windows
//! expose host buffers to the fabric (R2P), eight hardware slots each.
//!
//! A slot moves Free -> Configuring -> Bound. The Configuring state claims
//! the slot under the table lock so the boundary call itself runs
//! unlocked; a failed call returns the slot to Free. Inbound window
//! contents are reached through the driver's buffer get/put path.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + tests/roundtrip.rs (bind/access/free)

use std::sync::Arc;

use parking_lot::Mutex;

use crate::control::FabricAddress;
use crate::device::Device;
use crate::port::PortError;
use crate::wire::{self, Op, STATUS_INSUFFICIENT_RES, WINDOW_SLOTS};
use crate::{Error, Result};

/// Smallest configurable window, one host page.
pub const MIN_WINDOW_SIZE: u64 = wire::PAGE_SIZE as u64;
/// Largest configurable window.
pub const MAX_WINDOW_SIZE: u64 = 16 << 30;

/// Placement of one memory window on the fabric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WindowConfig {
    /// Fabric base address; must be aligned to `size`.
    pub base: FabricAddress,
    /// Window size in bytes; a power of two between 4 KiB and 16 GiB.
    pub size: u64,
}

impl WindowConfig {
    fn validate(&self) -> Result<()> {
        if !self.size.is_power_of_two()
            || self.size < MIN_WINDOW_SIZE
            || self.size > MAX_WINDOW_SIZE
        {
            return Err(Error::invalid_parameter(format!(
                "window size {:#x} is not a power of two in [4 KiB, 16 GiB]",
                self.size
            )));
        }
        if self.base.as_u64() % self.size != 0 {
            return Err(Error::invalid_parameter(format!(
                "window base {:#x} is not aligned to size {:#x}",
                self.base.as_u64(),
                self.size
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Configuring,
    Bound(WindowConfig),
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    const fn set_op(self) -> Op {
        match self {
            Self::Inbound => Op::R2pWinSet,
            Self::Outbound => Op::P2rWinSet,
        }
    }

    const fn free_op(self) -> Op {
        match self {
            Self::Inbound => Op::R2pWinFree,
            Self::Outbound => Op::P2rWinFree,
        }
    }
}

/// Tracks the eight inbound and eight outbound window slots of one device.
pub struct WindowManager {
    device: Arc<Device>,
    inbound: Mutex<[SlotState; WINDOW_SLOTS]>,
    outbound: Mutex<[SlotState; WINDOW_SLOTS]>,
}

impl WindowManager {
    /// Creates a manager with every slot free.
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            inbound: Mutex::new([SlotState::Free; WINDOW_SLOTS]),
            outbound: Mutex::new([SlotState::Free; WINDOW_SLOTS]),
        }
    }

    /// Binds inbound window `slot` so the fabric can reach host memory
    /// through it.
    pub fn configure_inbound(&self, slot: usize, config: WindowConfig) -> Result<()> {
        self.configure(Direction::Inbound, slot, config)
    }

    /// Releases inbound window `slot`.
    pub fn free_inbound(&self, slot: usize) -> Result<()> {
        self.free(Direction::Inbound, slot)
    }

    /// Binds outbound window `slot` onto fabric memory at `config.base`.
    pub fn configure_outbound(&self, slot: usize, config: WindowConfig) -> Result<()> {
        self.configure(Direction::Outbound, slot, config)
    }

    /// Releases outbound window `slot`.
    pub fn free_outbound(&self, slot: usize) -> Result<()> {
        self.free(Direction::Outbound, slot)
    }

    /// Configuration bound to inbound `slot`, if any.
    pub fn inbound_window(&self, slot: usize) -> Option<WindowConfig> {
        bound_config(&self.inbound, slot)
    }

    /// Configuration bound to outbound `slot`, if any.
    pub fn outbound_window(&self, slot: usize) -> Option<WindowConfig> {
        bound_config(&self.outbound, slot)
    }

    /// Reads from the host buffer behind bound inbound window `slot`.
    pub fn inbound_read(&self, slot: usize, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.check_inbound_access(slot, offset, buf.len())?;
        self.device
            .port()
            .read_block(Op::IbwBufferGet, &access_words(slot, offset), buf)
            .map_err(|e| Error::from_port(Op::IbwBufferGet.name(), e))
    }

    /// Writes into the host buffer behind bound inbound window `slot`.
    pub fn inbound_write(&self, slot: usize, offset: u64, data: &[u8]) -> Result<usize> {
        self.check_inbound_access(slot, offset, data.len())?;
        self.device
            .port()
            .write_block(Op::IbwBufferPut, &access_words(slot, offset), data)
            .map_err(|e| Error::from_port(Op::IbwBufferPut.name(), e))
    }

    fn configure(&self, dir: Direction, slot: usize, config: WindowConfig) -> Result<()> {
        check_slot(slot)?;
        config.validate()?;
        let table = self.table(dir);
        {
            let mut slots = table.lock();
            match slots[slot] {
                SlotState::Free => slots[slot] = SlotState::Configuring,
                _ => {
                    return Err(Error::invalid_state(format!(
                        "window slot {slot} is not free"
                    )))
                }
            }
        }
        let op = dir.set_op();
        // Base travels low word first.
        let words = [
            wire::window_select_word(slot as u32, config.base.ex),
            config.base.lo,
            config.base.hi,
            wire::window_size_to_pages(config.size),
        ];
        let outcome = self.device.port().control(op, &words, 0);
        let mut slots = table.lock();
        match outcome {
            Ok(_) => {
                slots[slot] = SlotState::Bound(config);
                log::debug!(
                    "{}: bound slot {slot} at {:#x} ({:#x} bytes)",
                    op.name(),
                    config.base.as_u64(),
                    config.size
                );
                Ok(())
            }
            Err(err) => {
                slots[slot] = SlotState::Free;
                Err(match err {
                    PortError::Device(STATUS_INSUFFICIENT_RES) => Error::ResourceExhausted,
                    other => Error::from_port(op.name(), other),
                })
            }
        }
    }

    fn free(&self, dir: Direction, slot: usize) -> Result<()> {
        check_slot(slot)?;
        let table = self.table(dir);
        {
            let mut slots = table.lock();
            match slots[slot] {
                SlotState::Bound(_) => slots[slot] = SlotState::Configuring,
                _ => {
                    return Err(Error::invalid_state(format!(
                        "window slot {slot} is not bound"
                    )))
                }
            }
        }
        let op = dir.free_op();
        let outcome = self.device.port().control(op, &[slot as u32], 0);
        let mut slots = table.lock();
        // The slot is released locally even if the driver call failed;
        // hardware state is unknown at that point and rebinding is the
        // only recovery.
        slots[slot] = SlotState::Free;
        outcome.map_err(|e| Error::from_port(op.name(), e))?;
        Ok(())
    }

    fn check_inbound_access(&self, slot: usize, offset: u64, len: usize) -> Result<()> {
        check_slot(slot)?;
        let config = self
            .inbound_window(slot)
            .ok_or_else(|| Error::invalid_state(format!("window slot {slot} is not bound")))?;
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| Error::invalid_parameter("window access range overflows"))?;
        if end > config.size {
            return Err(Error::invalid_parameter(format!(
                "access [{offset:#x}, {end:#x}) exceeds window size {:#x}",
                config.size
            )));
        }
        Ok(())
    }

    fn table(&self, dir: Direction) -> &Mutex<[SlotState; WINDOW_SLOTS]> {
        match dir {
            Direction::Inbound => &self.inbound,
            Direction::Outbound => &self.outbound,
        }
    }
}

fn check_slot(slot: usize) -> Result<()> {
    if slot >= WINDOW_SLOTS {
        return Err(Error::invalid_parameter(format!(
            "window slot {slot} out of range 0..{WINDOW_SLOTS}"
        )));
    }
    Ok(())
}

fn bound_config(table: &Mutex<[SlotState; WINDOW_SLOTS]>, slot: usize) -> Option<WindowConfig> {
    match table.lock().get(slot)? {
        SlotState::Bound(config) => Some(*config),
        _ => None,
    }
}

// Offset low word first, matching the WIN_SET base order.
fn access_words(slot: usize, offset: u64) -> [u32; 3] {
    [slot as u32, offset as u32, (offset >> 32) as u32]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::IdMode;
    use crate::loopback::LoopbackEndpoint;
    use crate::port::PortFactory;

    fn manager(endpoint: &LoopbackEndpoint) -> WindowManager {
        let device = Arc::new(Device::new(endpoint.open().unwrap(), IdMode::Small));
        WindowManager::new(device)
    }

    fn config(base: u64, size: u64) -> WindowConfig {
        WindowConfig { base: FabricAddress::new(base, 0).unwrap(), size }
    }

    #[test]
    fn rejects_bad_sizes_and_misaligned_bases() {
        let endpoint = LoopbackEndpoint::new();
        let mgr = manager(&endpoint);
        // not a power of two
        assert!(mgr.configure_inbound(0, config(0, 3 * 4096)).is_err());
        // below the minimum
        assert!(mgr.configure_inbound(0, config(0, 2048)).is_err());
        // base not size-aligned
        assert!(mgr.configure_inbound(0, config(4096, 8192)).is_err());
        // slot out of range
        assert!(mgr.configure_inbound(WINDOW_SLOTS, config(0, 4096)).is_err());
        // nothing reached the boundary
        assert_eq!(endpoint.boundary_calls(), 0);
    }

    #[test]
    fn double_bind_and_double_free_are_state_errors() {
        let endpoint = LoopbackEndpoint::new();
        let mgr = manager(&endpoint);
        mgr.configure_inbound(2, config(0, 4096)).unwrap();
        assert!(matches!(
            mgr.configure_inbound(2, config(0, 4096)),
            Err(Error::InvalidState { .. })
        ));
        mgr.free_inbound(2).unwrap();
        assert!(matches!(mgr.free_inbound(2), Err(Error::InvalidState { .. })));
    }

    #[test]
    fn failed_bind_returns_slot_to_free() {
        let endpoint = LoopbackEndpoint::new();
        let mgr = manager(&endpoint);
        endpoint.fail_next_window(STATUS_INSUFFICIENT_RES);
        assert!(matches!(
            mgr.configure_outbound(1, config(0, 4096)),
            Err(Error::ResourceExhausted)
        ));
        // slot is reusable afterwards
        mgr.configure_outbound(1, config(0, 4096)).unwrap();
        assert_eq!(mgr.outbound_window(1), Some(config(0, 4096)));
    }

    #[test]
    fn inbound_access_is_bounds_checked() {
        let endpoint = LoopbackEndpoint::new();
        let mgr = manager(&endpoint);
        mgr.configure_inbound(0, config(0, 8192)).unwrap();
        let mut buf = [0u8; 16];
        assert!(mgr.inbound_read(0, 8192 - 8, &mut buf).is_err());
        assert!(mgr.inbound_read(0, u64::MAX, &mut buf).is_err());
        assert_eq!(mgr.inbound_read(0, 0, &mut buf).unwrap(), 16);
    }
}
