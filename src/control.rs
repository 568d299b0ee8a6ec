// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Control-word codec and fabric addressing.
//!
//! The DMA request control word and the 66-bit fabric address split are
//! plain bit-packing over fixed-width integers with documented field
//! widths; nothing here relies on memory layout.
//!
//! Control word layout (low to high):
//!   priority      bits 1:0
//!   addr_ex       bits 3:2   (fabric address bits 65:64)
//!   critical_flow bit  4
//!   reserved      bit  5     (must be zero)
//!   rtype         bits 9:6
//!   reserved      bits 31:10 (must be zero)
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: unit tests + proptest round-trip

use crate::{Error, Result};

/// RapidIO DMA request type carried in the control word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Rtype {
    /// NREAD data read.
    Nread = 0,
    /// NWRITE for all packets, NWRITE_R for the last packet.
    LastNwriteR = 1,
    /// NWRITE or SWRITE for all packets.
    AllNwrite = 2,
    /// NWRITE_R for all packets.
    AllNwriteR = 3,
    /// Maintenance read.
    MaintRead = 4,
    /// Maintenance write.
    MaintWrite = 5,
}

impl Rtype {
    /// Decodes an rtype field value.
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Nread),
            1 => Some(Self::LastNwriteR),
            2 => Some(Self::AllNwrite),
            3 => Some(Self::AllNwriteR),
            4 => Some(Self::MaintRead),
            5 => Some(Self::MaintWrite),
            _ => None,
        }
    }

    /// True for request types valid on the read path.
    pub const fn is_read(self) -> bool {
        matches!(self, Self::Nread | Self::MaintRead)
    }

    /// True for request types valid on the write path.
    pub const fn is_write(self) -> bool {
        !self.is_read()
    }
}

/// Decoded DMA request control word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DmaControl {
    /// SRIO request priority (0..=3).
    pub priority: u8,
    /// Fabric address bits 65:64 (0..=3).
    pub addr_ex: u8,
    /// SRIO critical request flow flag.
    pub critical_flow: bool,
    /// DMA request type.
    pub rtype: Rtype,
}

impl DmaControl {
    /// Creates a control word with default priority and no flags.
    pub const fn new(rtype: Rtype) -> Self {
        Self { priority: 0, addr_ex: 0, critical_flow: false, rtype }
    }

    /// Encodes the control word for the wire.
    pub fn encode(self) -> Result<u32> {
        if self.priority > 3 {
            return Err(Error::invalid_parameter(format!(
                "dma priority {} out of range 0..=3",
                self.priority
            )));
        }
        if self.addr_ex > 3 {
            return Err(Error::invalid_parameter(format!(
                "address extension bits {} out of range 0..=3",
                self.addr_ex
            )));
        }
        Ok(self.priority as u32
            | (self.addr_ex as u32) << 2
            | (self.critical_flow as u32) << 4
            | (self.rtype as u32) << 6)
    }

    /// Decodes a wire control word; reserved bits must be zero.
    pub fn decode(word: u32) -> Result<Self> {
        if word & !0x3df != 0 {
            return Err(Error::invalid_parameter(format!(
                "control word {word:#x} has reserved bits set"
            )));
        }
        let rtype = Rtype::from_bits((word >> 6 & 0xf) as u8).ok_or_else(|| {
            Error::invalid_parameter(format!("control word {word:#x} carries invalid rtype"))
        })?;
        Ok(Self {
            priority: (word & 0x3) as u8,
            addr_ex: (word >> 2 & 0x3) as u8,
            critical_flow: word & 1 << 4 != 0,
            rtype,
        })
    }
}

/// A 66-bit RapidIO address split into its wire components.
///
/// `hi`/`lo` travel as request words; `ex` (bits 65:64) travels inside the
/// DMA control word or the window select word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FabricAddress {
    /// Address bits 63:32.
    pub hi: u32,
    /// Address bits 31:0.
    pub lo: u32,
    /// Address bits 65:64 (0..=3).
    pub ex: u8,
}

impl FabricAddress {
    /// Builds an address from the low 64 bits and the extension bits.
    pub fn new(addr: u64, ex: u8) -> Result<Self> {
        if ex > 3 {
            return Err(Error::invalid_parameter(format!(
                "address extension bits {ex} out of range 0..=3"
            )));
        }
        Ok(Self { hi: (addr >> 32) as u32, lo: addr as u32, ex })
    }

    /// The low 64 bits as a single value.
    pub const fn as_u64(self) -> u64 {
        (self.hi as u64) << 32 | self.lo as u64
    }
}

/// Active fabric addressing mode: destination ids are 8-bit in a small
/// system and 16-bit in a large one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IdMode {
    /// Small system, 8-bit destination ids.
    #[default]
    Small,
    /// Large system, 16-bit destination ids.
    Large,
}

impl IdMode {
    /// Masks a raw id to the width of this addressing mode.
    pub const fn mask(self, id: u32) -> u16 {
        match self {
            Self::Small => (id & 0xff) as u16,
            Self::Large => (id & 0xffff) as u16,
        }
    }
}

/// Fabric endpoint identifier, already masked to the active addressing
/// mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DestId(pub u16);

impl DestId {
    /// Builds an id from a raw value, masking it to `mode`.
    pub const fn masked(raw: u32, mode: IdMode) -> Self {
        Self(mode.mask(raw))
    }

    /// The wire representation.
    pub const fn word(self) -> u32 {
        self.0 as u32
    }
}

impl From<u16> for DestId {
    fn from(raw: u16) -> Self {
        Self(raw)
    }
}
