// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Wire protocol layer shared by every component crossing the
//! driver boundary: request codes, word shapes and the raw codecs for
//! doorbell entries and port-write messages.
//!
//! The request codes are bit-exact against the bridge driver contract.
//! Codecs here are pure functions over fixed-width integers; none of them
//! panic on malformed input.
//!
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Internal
//! TEST_COVERAGE: unit tests (codecs, size encoding)

/// Size of one host memory page; mailbox receive buffers and message
/// payloads are bounded by it.
pub const PAGE_SIZE: usize = 4096;

/// Maximum mailbox message payload in bytes (one page).
pub const MAX_MESSAGE_SIZE: usize = PAGE_SIZE;

/// Number of independent messaging mailboxes.
pub const MAILBOX_COUNT: u8 = 4;

/// Number of hardware window slots per direction.
pub const WINDOW_SLOTS: usize = 8;

/// Hop count denoting a directly attached endpoint in maintenance requests.
pub const HOP_DIRECT: u32 = 0xff;

/// Driver status reported when a window allocation fails for resource
/// reasons.
pub const STATUS_INSUFFICIENT_RES: u32 = 0x5AA;

/// Request codes accepted at the driver boundary.
///
/// The discriminants are the driver's function codes and must not change.
/// `P2R_WIN_SET`/`P2R_WIN_FREE` occupy the two codes the numbering leaves
/// open below the inbound window pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum Op {
    RegRead = 0x880,
    RegWrite = 0x881,
    MntRead = 0x882,
    MntWrite = 0x883,
    PcfgRead = 0x884,
    PcfgWrite = 0x885,
    SrioWrite = 0x890,
    SrioRead = 0x891,
    IbwBufferGet = 0x892,
    IbwBufferPut = 0x893,
    DbSend = 0x8a0,
    DbWait = 0x8a1,
    DbCheck = 0x8a2,
    DbGet = 0x8a3,
    MsgSend = 0x8b0,
    IbMsgDevIdSet = 0x8b1,
    IbMsgDevIdGet = 0x8b2,
    MsgAddRxBuf = 0x8b3,
    PwWait = 0x8c0,
    PwEnable = 0x8c1,
    P2rWinSet = 0x8d0,
    P2rWinFree = 0x8d1,
    R2pWinSet = 0x8d2,
    R2pWinFree = 0x8d3,
    SetLocalHostId = 0x8f2,
    GetLocalHostId = 0x8f3,
}

impl Op {
    /// Returns the numeric function code carried on the wire.
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Short name used in error context.
    pub const fn name(self) -> &'static str {
        match self {
            Self::RegRead => "REG_READ",
            Self::RegWrite => "REG_WRITE",
            Self::MntRead => "MNT_READ",
            Self::MntWrite => "MNT_WRITE",
            Self::PcfgRead => "PCFG_READ",
            Self::PcfgWrite => "PCFG_WRITE",
            Self::SrioWrite => "SRIO_WRITE",
            Self::SrioRead => "SRIO_READ",
            Self::IbwBufferGet => "IBW_BUFFER_GET",
            Self::IbwBufferPut => "IBW_BUFFER_PUT",
            Self::DbSend => "DB_SEND",
            Self::DbWait => "DB_WAIT",
            Self::DbCheck => "DB_CHECK",
            Self::DbGet => "DB_GET",
            Self::MsgSend => "MSG_SEND",
            Self::IbMsgDevIdSet => "IB_MSG_DEV_ID_SET",
            Self::IbMsgDevIdGet => "IB_MSG_DEV_ID_GET",
            Self::MsgAddRxBuf => "MSG_ADDRXBUF",
            Self::PwWait => "PW_WAIT",
            Self::PwEnable => "PW_ENABLE",
            Self::P2rWinSet => "P2R_WIN_SET",
            Self::P2rWinFree => "P2R_WIN_FREE",
            Self::R2pWinSet => "R2P_WIN_SET",
            Self::R2pWinFree => "R2P_WIN_FREE",
            Self::SetLocalHostId => "SET_LOCAL_HOST_ID",
            Self::GetLocalHostId => "GET_LOCAL_HOST_ID",
        }
    }
}

/// One inbound doorbell notification as produced by the fabric.
///
/// Consumed in FIFO arrival order within a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DoorbellEntry {
    /// Destination id of the sending endpoint.
    pub source: u16,
    /// Destination id the doorbell was addressed to.
    pub destination: u16,
    /// 16-bit doorbell INFO field.
    pub info: u16,
    /// Miscellaneous bits reported by the controller.
    pub misc: u16,
}

impl DoorbellEntry {
    /// Number of 32-bit words one entry occupies on the wire.
    pub const WORDS: usize = 2;

    /// Decodes one entry from its two-word raw form
    /// (`word0 = src | info << 16`, `word1 = misc | dst << 16`).
    pub const fn from_words(w0: u32, w1: u32) -> Self {
        Self {
            source: (w0 & 0xffff) as u16,
            info: (w0 >> 16) as u16,
            misc: (w1 & 0xffff) as u16,
            destination: (w1 >> 16) as u16,
        }
    }

    /// Encodes this entry into its two-word raw form.
    pub const fn to_words(self) -> [u32; 2] {
        [
            self.source as u32 | (self.info as u32) << 16,
            self.misc as u32 | (self.destination as u32) << 16,
        ]
    }

    /// Decodes a packed sequence of entries; a trailing odd word is
    /// ignored, matching the driver's whole-entry delivery contract.
    pub fn decode_all(words: &[u32]) -> Vec<Self> {
        words
            .chunks_exact(Self::WORDS)
            .map(|c| Self::from_words(c[0], c[1]))
            .collect()
    }

    /// Encodes a sequence of entries into packed words.
    pub fn encode_all(entries: &[Self]) -> Vec<u32> {
        let mut out = Vec::with_capacity(entries.len() * Self::WORDS);
        for e in entries {
            out.extend_from_slice(&e.to_words());
        }
        out
    }
}

/// Builds the DB_SEND info word: 16-bit INFO combined with the critical
/// request flow flag in bit 31.
pub const fn doorbell_send_word(info: u16, crf: bool) -> u32 {
    info as u32 | if crf { 1 << 31 } else { 0 }
}

/// An unsolicited port-write event message from the fabric link layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortWriteMessage {
    /// Component tag of the reporting device.
    pub component_tag: u32,
    /// Port error detect CSR snapshot.
    pub port_err_det: u32,
    /// Reporting port id.
    pub port_id: u32,
    /// Logical/transport error detect CSR snapshot.
    pub lt_err_det: u32,
    /// Implementation-specific capture words.
    pub capture: [u32; 4],
}

impl PortWriteMessage {
    /// Number of 32-bit words one message occupies on the wire.
    pub const WORDS: usize = 8;

    /// Decodes a message from its raw words; `None` if the slice is short.
    pub fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() < Self::WORDS {
            return None;
        }
        Some(Self {
            component_tag: words[0],
            port_err_det: words[1],
            port_id: words[2],
            lt_err_det: words[3],
            capture: [words[4], words[5], words[6], words[7]],
        })
    }

    /// Encodes this message into its raw words.
    pub fn to_words(self) -> [u32; Self::WORDS] {
        [
            self.component_tag,
            self.port_err_det,
            self.port_id,
            self.lt_err_det,
            self.capture[0],
            self.capture[1],
            self.capture[2],
            self.capture[3],
        ]
    }
}

/// Encodes a window size for the wire as a 4 KiB page count.
///
/// The boundary word is 32 bits wide while the documented size range runs
/// to 16 GiB, so sizes travel as page counts. The caller validates the
/// power-of-two constraint beforehand.
pub const fn window_size_to_pages(size: u64) -> u32 {
    (size >> 12) as u32
}

/// Inverse of [`window_size_to_pages`].
pub const fn window_pages_to_size(pages: u32) -> u64 {
    (pages as u64) << 12
}

/// Builds the R2P/P2R WIN_SET first word: window number combined with the
/// address extension bits 65:64 (`(ex << 24) | win`).
pub const fn window_select_word(win: u32, addr_ex: u8) -> u32 {
    (addr_ex as u32) << 24 | (win & 0xff)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doorbell_entry_words_roundtrip() {
        let e = DoorbellEntry { source: 0x0102, destination: 0x0304, info: 0xBEEF, misc: 0x0055 };
        let [w0, w1] = e.to_words();
        assert_eq!(w0, 0xBEEF_0102);
        assert_eq!(w1, 0x0304_0055);
        assert_eq!(DoorbellEntry::from_words(w0, w1), e);
    }

    #[test]
    fn doorbell_decode_all_ignores_trailing_word() {
        let e = DoorbellEntry { source: 1, destination: 2, info: 3, misc: 4 };
        let mut words = DoorbellEntry::encode_all(&[e, e]);
        words.push(0xdead_beef);
        assert_eq!(DoorbellEntry::decode_all(&words), vec![e, e]);
    }

    #[test]
    fn doorbell_send_word_sets_crf_bit() {
        assert_eq!(doorbell_send_word(0x1234, false), 0x0000_1234);
        assert_eq!(doorbell_send_word(0x1234, true), 0x8000_1234);
    }

    #[test]
    fn window_size_pages_cover_full_range() {
        assert_eq!(window_size_to_pages(4096), 1);
        assert_eq!(window_size_to_pages(16 << 30), 1 << 22);
        assert_eq!(window_pages_to_size(1 << 22), 16 << 30);
    }

    #[test]
    fn window_select_word_packs_extension_bits() {
        assert_eq!(window_select_word(5, 0), 5);
        assert_eq!(window_select_word(7, 3), 0x0300_0007);
    }

    #[test]
    fn port_write_message_words_roundtrip() {
        let m = PortWriteMessage {
            component_tag: 1,
            port_err_det: 2,
            port_id: 3,
            lt_err_det: 4,
            capture: [5, 6, 7, 8],
        };
        assert_eq!(PortWriteMessage::from_words(&m.to_words()), Some(m));
        assert_eq!(PortWriteMessage::from_words(&[0; 7]), None);
    }
}
