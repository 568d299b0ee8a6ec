// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Synchronous device surface: bridge register access, PCI config
//! space, maintenance transactions to fabric endpoints, host id management
//! and the blocking doorbell operations.
//!
//! Maintenance read and write are serialized through one mutex held across
//! the boundary call; the bridge has a single maintenance engine and
//! interleaved transactions would corrupt each other's completions.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + tests/maintenance.rs (serialization)

use std::sync::Arc;

use parking_lot::Mutex;

use crate::control::{DestId, IdMode};
use crate::port::Port;
use crate::wire::{self, DoorbellEntry, Op};
use crate::{Error, Result};

/// Standard RapidIO capability and status register offsets, usable with
/// both local register access and maintenance transactions.
pub mod csr {
    /// Device identity CAR.
    pub const RIO_DEV_ID_CAR: u32 = 0x00;
    /// Base device id CSR.
    pub const RIO_BASE_ID_CSR: u32 = 0x60;
    /// Component tag CSR.
    pub const RIO_COMPONENT_TAG_CSR: u32 = 0x6C;
    /// Port general control CSR.
    pub const RIO_PORT_GEN_CTRL_CSR: u32 = 0x13C;
    /// Port 0 error and status CSR.
    pub const RIO_PORT_N_ERR_STAT_CSR: u32 = 0x158;
}

/// PORT_OK bit of the port error/status CSR.
const PORT_STATUS_OK: u32 = 0x0000_0002;
/// Output/input error-stopped bits of the port error/status CSR.
const PORT_STATUS_ERR_STOPPED: u32 = 0x0001_0100;

/// Decoded snapshot of the bridge's fabric port status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkStatus {
    /// Raw value of the port error/status CSR.
    pub raw: u32,
}

impl LinkStatus {
    /// True when the port reports an initialized, usable link.
    pub const fn is_ok(self) -> bool {
        self.raw & PORT_STATUS_OK != 0 && !self.is_error_stopped()
    }

    /// True when either direction of the port is error-stopped.
    pub const fn is_error_stopped(self) -> bool {
        self.raw & PORT_STATUS_ERR_STOPPED != 0
    }
}

/// One opened bridge endpoint.
///
/// Cheap to share: clones hand out the same underlying handle.
pub struct Device {
    port: Arc<dyn Port>,
    id_mode: IdMode,
    // Serializes maintenance transactions; held across the boundary call.
    maint: Mutex<()>,
}

impl Device {
    /// Wraps an open handle, fixing the fabric addressing mode for every
    /// destination id this device will emit.
    pub fn new(port: Arc<dyn Port>, id_mode: IdMode) -> Self {
        Self { port, id_mode, maint: Mutex::new(()) }
    }

    /// The underlying driver handle.
    pub fn port(&self) -> &Arc<dyn Port> {
        &self.port
    }

    /// Active fabric addressing mode.
    pub const fn id_mode(&self) -> IdMode {
        self.id_mode
    }

    /// Reads `count` consecutive 32-bit bridge registers starting at
    /// `offset`.
    pub fn read_registers(&self, offset: u32, count: usize) -> Result<Vec<u32>> {
        if count == 0 {
            return Err(Error::invalid_parameter("register read of zero words"));
        }
        // The word count is implied by the output length.
        self.port
            .control(Op::RegRead, &[offset], count)
            .map_err(|e| Error::from_port(Op::RegRead.name(), e))
    }

    /// Reads a single 32-bit bridge register.
    pub fn read_register(&self, offset: u32) -> Result<u32> {
        Ok(self.read_registers(offset, 1)?[0])
    }

    /// Writes a single 32-bit bridge register.
    pub fn write_register(&self, offset: u32, value: u32) -> Result<()> {
        self.port
            .control(Op::RegWrite, &[offset, value], 0)
            .map_err(|e| Error::from_port(Op::RegWrite.name(), e))?;
        Ok(())
    }

    /// Reads a 32-bit word from the bridge's PCI configuration space.
    pub fn read_config_space(&self, offset: u32) -> Result<u32> {
        let out = self
            .port
            .control(Op::PcfgRead, &[offset], 1)
            .map_err(|e| Error::from_port(Op::PcfgRead.name(), e))?;
        Ok(out[0])
    }

    /// Writes a 32-bit word to the bridge's PCI configuration space.
    pub fn write_config_space(&self, offset: u32, value: u32) -> Result<()> {
        self.port
            .control(Op::PcfgWrite, &[offset, value], 0)
            .map_err(|e| Error::from_port(Op::PcfgWrite.name(), e))?;
        Ok(())
    }

    /// Issues a maintenance read of `count` words at `offset` in the
    /// config space of the endpoint reached via `dest` and `hop`.
    ///
    /// Use [`wire::HOP_DIRECT`] for a directly attached endpoint.
    pub fn maintenance_read(
        &self,
        dest: DestId,
        hop: u32,
        offset: u32,
        count: usize,
    ) -> Result<Vec<u32>> {
        if count == 0 {
            return Err(Error::invalid_parameter("maintenance read of zero words"));
        }
        let _guard = self.maint.lock();
        self.port
            .control(Op::MntRead, &[dest.word(), hop, offset], count)
            .map_err(|e| Error::from_port(Op::MntRead.name(), e))
    }

    /// Issues a maintenance write of `value` at `offset` in the config
    /// space of the endpoint reached via `dest` and `hop`.
    pub fn maintenance_write(&self, dest: DestId, hop: u32, offset: u32, value: u32) -> Result<()> {
        let _guard = self.maint.lock();
        self.port
            .control(Op::MntWrite, &[dest.word(), hop, offset, value], 0)
            .map_err(|e| Error::from_port(Op::MntWrite.name(), e))?;
        Ok(())
    }

    /// Reads the host-side local destination id.
    pub fn local_host_id(&self) -> Result<DestId> {
        let out = self
            .port
            .control(Op::GetLocalHostId, &[], 1)
            .map_err(|e| Error::from_port(Op::GetLocalHostId.name(), e))?;
        Ok(DestId::masked(out[0], self.id_mode))
    }

    /// Sets the host-side local destination id, masked to the addressing
    /// mode before it crosses the boundary.
    pub fn set_local_host_id(&self, raw: u32) -> Result<DestId> {
        let id = DestId::masked(raw, self.id_mode);
        self.port
            .control(Op::SetLocalHostId, &[id.word()], 0)
            .map_err(|e| Error::from_port(Op::SetLocalHostId.name(), e))?;
        Ok(id)
    }

    /// Reads the destination id inbound messaging answers to.
    pub fn ib_msg_dev_id(&self) -> Result<DestId> {
        let out = self
            .port
            .control(Op::IbMsgDevIdGet, &[], 1)
            .map_err(|e| Error::from_port(Op::IbMsgDevIdGet.name(), e))?;
        Ok(DestId::masked(out[0], self.id_mode))
    }

    /// Sets the destination id inbound messaging answers to.
    pub fn set_ib_msg_dev_id(&self, raw: u32) -> Result<DestId> {
        let id = DestId::masked(raw, self.id_mode);
        self.port
            .control(Op::IbMsgDevIdSet, &[id.word()], 0)
            .map_err(|e| Error::from_port(Op::IbMsgDevIdSet.name(), e))?;
        Ok(id)
    }

    /// Snapshot of the bridge's fabric port status register.
    pub fn link_status(&self) -> Result<LinkStatus> {
        let raw = self.read_register(csr::RIO_PORT_N_ERR_STAT_CSR)?;
        Ok(LinkStatus { raw })
    }

    /// Fails with [`Error::LinkDown`] unless the fabric link is usable.
    pub fn ensure_link_ok(&self) -> Result<()> {
        let status = self.link_status()?;
        if status.is_ok() {
            Ok(())
        } else {
            Err(Error::LinkDown { status: status.raw })
        }
    }

    /// Sends a doorbell carrying `info` to `dest`.
    pub fn doorbell_send(&self, dest: DestId, info: u16, critical_flow: bool) -> Result<()> {
        self.port
            .control(
                Op::DbSend,
                &[dest.word(), wire::doorbell_send_word(info, critical_flow)],
                0,
            )
            .map_err(|e| Error::from_port(Op::DbSend.name(), e))?;
        Ok(())
    }

    /// Number of doorbell entries queued on `queue` without consuming any.
    pub fn doorbell_check(&self, queue: u32) -> Result<usize> {
        let out = self
            .port
            .control(Op::DbCheck, &[queue], 1)
            .map_err(|e| Error::from_port(Op::DbCheck.name(), e))?;
        Ok(out[0] as usize)
    }

    /// Drains up to `max` queued doorbell entries from `queue` without
    /// blocking; returns fewer (possibly none) if the queue runs dry.
    pub fn doorbell_get(&self, queue: u32, max: usize) -> Result<Vec<DoorbellEntry>> {
        if max == 0 {
            return Ok(Vec::new());
        }
        let words = self
            .port
            .control(Op::DbGet, &[queue], max * DoorbellEntry::WORDS)
            .map_err(|e| Error::from_port(Op::DbGet.name(), e))?;
        Ok(DoorbellEntry::decode_all(&words))
    }

    /// Enables or disables delivery of port-write event messages.
    pub fn port_write_enable(&self, enable: bool) -> Result<()> {
        self.port
            .control(Op::PwEnable, &[enable as u32], 0)
            .map_err(|e| Error::from_port(Op::PwEnable.name(), e))?;
        Ok(())
    }

    /// Closes the underlying handle; pending asynchronous waits on it are
    /// abandoned.
    pub fn close(&self) {
        self.port.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_status_decodes_ok_and_error_stopped() {
        assert!(LinkStatus { raw: 0x02 }.is_ok());
        assert!(!LinkStatus { raw: 0x00 }.is_ok());
        // PORT_OK set but output error-stopped
        let s = LinkStatus { raw: 0x0001_0002 };
        assert!(s.is_error_stopped());
        assert!(!s.is_ok());
        // input error-stopped
        assert!(LinkStatus { raw: 0x0000_0102 }.is_error_stopped());
    }
}
