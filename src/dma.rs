// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: BDMA block transfers to and from fabric memory.
//!
//! A transfer names a destination endpoint, a 66-bit fabric address and a
//! control word; the payload moves through the driver's direct-data path
//! rather than a bounce buffer. Validation happens before the boundary
//! call: the request type must match the transfer direction and the
//! address extension bits carried in the control word must agree with the
//! ones in the address, since the driver trusts the control word.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests + tests/roundtrip.rs

use crate::control::{DestId, DmaControl, FabricAddress};
use crate::device::Device;
use crate::wire::Op;
use crate::{Error, Result};

impl Device {
    /// Writes `data` to fabric memory at `addr` on endpoint `dest`.
    ///
    /// Returns the number of bytes the driver accepted.
    pub fn dma_write(
        &self,
        dest: DestId,
        addr: FabricAddress,
        ctrl: DmaControl,
        data: &[u8],
    ) -> Result<usize> {
        if data.is_empty() {
            return Err(Error::invalid_parameter("dma write of zero bytes"));
        }
        let words = dma_request_words(dest, addr, ctrl, Direction::Write)?;
        self.port()
            .write_block(Op::SrioWrite, &words, data)
            .map_err(|e| Error::from_port(Op::SrioWrite.name(), e))
    }

    /// Reads fabric memory at `addr` on endpoint `dest` into `buf`.
    ///
    /// Returns the number of bytes delivered.
    pub fn dma_read(
        &self,
        dest: DestId,
        addr: FabricAddress,
        ctrl: DmaControl,
        buf: &mut [u8],
    ) -> Result<usize> {
        if buf.is_empty() {
            return Err(Error::invalid_parameter("dma read into zero-byte buffer"));
        }
        let words = dma_request_words(dest, addr, ctrl, Direction::Read)?;
        self.port()
            .read_block(Op::SrioRead, &words, buf)
            .map_err(|e| Error::from_port(Op::SrioRead.name(), e))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Read,
    Write,
}

/// Builds the four-word request header shared by both transfer directions:
/// `[dest, addr_hi, addr_lo, control]`.
fn dma_request_words(
    dest: DestId,
    addr: FabricAddress,
    ctrl: DmaControl,
    dir: Direction,
) -> Result<[u32; 4]> {
    let dir_ok = match dir {
        Direction::Read => ctrl.rtype.is_read(),
        Direction::Write => ctrl.rtype.is_write(),
    };
    if !dir_ok {
        return Err(Error::invalid_parameter(format!(
            "request type {:?} does not match the transfer direction",
            ctrl.rtype
        )));
    }
    if ctrl.addr_ex != addr.ex {
        return Err(Error::invalid_parameter(format!(
            "control word extension bits {} disagree with address bits {}",
            ctrl.addr_ex, addr.ex
        )));
    }
    Ok([dest.word(), addr.hi, addr.lo, ctrl.encode()?])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::Rtype;

    #[test]
    fn request_words_pack_in_order() {
        let addr = FabricAddress::new(0xAB_CDEF_0123, 1).unwrap();
        let mut ctrl = DmaControl::new(Rtype::AllNwrite);
        ctrl.addr_ex = 1;
        let words = dma_request_words(DestId(9), addr, ctrl, Direction::Write).unwrap();
        assert_eq!(words[0], 9);
        assert_eq!(words[1], 0xAB);
        assert_eq!(words[2], 0xCDEF_0123);
        assert_eq!(words[3], ctrl.encode().unwrap());
    }

    #[test]
    fn direction_mismatch_is_rejected() {
        let addr = FabricAddress::new(0, 0).unwrap();
        let read_ctrl = DmaControl::new(Rtype::Nread);
        let write_ctrl = DmaControl::new(Rtype::LastNwriteR);
        assert!(dma_request_words(DestId(1), addr, read_ctrl, Direction::Write).is_err());
        assert!(dma_request_words(DestId(1), addr, write_ctrl, Direction::Read).is_err());
    }

    #[test]
    fn extension_bit_disagreement_is_rejected() {
        let addr = FabricAddress::new(0x1000, 2).unwrap();
        let ctrl = DmaControl::new(Rtype::Nread);
        assert!(matches!(
            dma_request_words(DestId(1), addr, ctrl, Direction::Read),
            Err(Error::InvalidParameter { .. })
        ));
    }
}
