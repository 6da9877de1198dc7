//! ATDECC control PDU codecs.
//!
//! Every ADP, ACMP and AECP message starts with the AVTP common control
//! header, big-endian on the wire:
//!
//! ```text
//! ┌────┬─────────┬────┬───────┬──────────┬────────────┬──────────┬──────────────────┐
//! │ cd │ subtype │ sv │ ver(3)│ msg_t(4) │ status(5)  │ cdl(11)  │ stream/entity id │
//! │ 1b │   7b    │ 1b │       │          │            │          │       (8)        │
//! └────┴─────────┴────┴───────┴──────────┴────────────┴──────────┴──────────────────┘
//! ```
//!
//! `cdl` (control data length) counts the bytes after this 12-byte header.
//! For ADP the status bits carry `valid_time`.
//!
//! Sub-protocol codecs live in [`adp`], [`acmp`] and [`aecp`]; [`Pdu`] is the
//! closed sum of the three as handed to callbacks.

pub mod acmp;
pub mod adp;
pub mod aecp;

use std::fmt;

use thiserror::Error;

use crate::net::{EntityId, MacAddress};

pub use acmp::Acmpdu;
pub use adp::Adpdu;
pub use aecp::AecpAemPdu;

/// Length of the AVTP common control header.
pub const CONTROL_HEADER_LEN: usize = 12;

/// AVTP subtype values (low 7 bits of byte 0).
pub mod subtype {
    pub const ADP: u8 = 0x7A;
    pub const AECP: u8 = 0x7B;
    pub const ACMP: u8 = 0x7C;
}

/// The three ATDECC sub-protocols the dispatcher routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subprotocol {
    /// ADP: entity advertisement and discovery.
    Discovery,
    /// ACMP: stream connection management.
    ConnectionManagement,
    /// AECP (AEM): entity enumeration and control.
    Enumeration,
}

impl Subprotocol {
    /// Maps the 7-bit AVTP subtype onto a sub-protocol.
    #[inline]
    #[must_use]
    pub const fn from_subtype(subtype: u8) -> Option<Self> {
        match subtype & 0x7F {
            subtype::ADP => Some(Self::Discovery),
            subtype::ACMP => Some(Self::ConnectionManagement),
            subtype::AECP => Some(Self::Enumeration),
            _ => None,
        }
    }

    /// Short protocol name for logs.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Discovery => "adp",
            Self::ConnectionManagement => "acmp",
            Self::Enumeration => "aecp",
        }
    }
}

impl fmt::Display for Subprotocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors during PDU encode/decode.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PduError {
    /// Buffer too small to decode the PDU.
    #[error("buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },
    /// Subtype byte names a different sub-protocol.
    #[error("subtype mismatch: expected 0x{expected:02x}, found 0x{found:02x}")]
    SubtypeMismatch { expected: u8, found: u8 },
    /// `control_data_length` is below the sub-protocol minimum.
    #[error("control data length {declared} below minimum {minimum}")]
    ControlDataTooShort { declared: u16, minimum: u16 },
    /// Command specific data does not fit in one frame.
    #[error("payload too large: {len} bytes, limit {limit}")]
    PayloadTooLarge { len: usize, limit: usize },
}

/// The AVTP common control header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControlHeader {
    pub cd: bool,
    pub subtype: u8,
    pub sv: bool,
    pub version: u8,
    pub message_type: u8,
    /// Status for ACMP/AECP, `valid_time` for ADP.
    pub status: u8,
    pub control_data_length: u16,
    /// Stream id for ACMP, entity id for ADP, target entity id for AECP.
    pub stream_id: EntityId,
}

impl ControlHeader {
    /// Header for a control PDU of the given subtype with `cd` set and
    /// version 0.
    #[must_use]
    pub const fn control(
        subtype: u8,
        message_type: u8,
        status: u8,
        control_data_length: u16,
        stream_id: EntityId,
    ) -> Self {
        Self {
            cd: true,
            subtype,
            sv: false,
            version: 0,
            message_type,
            status,
            control_data_length,
            stream_id,
        }
    }

    /// Decodes the header at the start of an AVTP payload.
    ///
    /// # Errors
    ///
    /// Returns [`PduError::BufferTooSmall`] if fewer than 12 bytes are
    /// available.
    pub fn decode(bytes: &[u8]) -> Result<Self, PduError> {
        PduReader::new(bytes).take_header()
    }

    /// Total PDU length announced by the header.
    #[inline]
    #[must_use]
    pub const fn pdu_len(&self) -> usize {
        CONTROL_HEADER_LEN + self.control_data_length as usize
    }
}

/// A decoded PDU of any supported sub-protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    Adp(Adpdu),
    Acmp(Acmpdu),
    Aecp(AecpAemPdu),
}

impl Pdu {
    #[must_use]
    pub const fn subprotocol(&self) -> Subprotocol {
        match self {
            Self::Adp(_) => Subprotocol::Discovery,
            Self::Acmp(_) => Subprotocol::ConnectionManagement,
            Self::Aecp(_) => Subprotocol::Enumeration,
        }
    }

    /// Decodes any supported PDU, picking the codec from the subtype byte.
    ///
    /// Returns `Ok(None)` for subtypes outside ADP/ACMP/AECP.
    ///
    /// # Errors
    ///
    /// Returns the codec's error if the selected decode fails.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, PduError> {
        let Some(&first) = bytes.first() else {
            return Err(PduError::BufferTooSmall { need: 1, have: 0 });
        };
        let pdu = match Subprotocol::from_subtype(first) {
            Some(Subprotocol::Discovery) => Self::Adp(Adpdu::try_decode(bytes)?),
            Some(Subprotocol::ConnectionManagement) => Self::Acmp(Acmpdu::try_decode(bytes)?),
            Some(Subprotocol::Enumeration) => Self::Aecp(AecpAemPdu::try_decode(bytes)?),
            None => return Ok(None),
        };
        Ok(Some(pdu))
    }

    /// Encodes the PDU into `buf` (cleared first, capacity kept).
    ///
    /// # Errors
    ///
    /// Returns [`PduError::PayloadTooLarge`] for AECP command data that does
    /// not fit in one frame.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), PduError> {
        match self {
            Self::Adp(p) => p.encode(buf),
            Self::Acmp(p) => p.encode(buf),
            Self::Aecp(p) => return p.encode(buf),
        }
        Ok(())
    }
}

impl fmt::Display for Pdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Adp(p) => p.fmt(f),
            Self::Acmp(p) => p.fmt(f),
            Self::Aecp(p) => p.fmt(f),
        }
    }
}

/// Writer for encoding big-endian PDUs.
pub(crate) struct PduWriter<'a> {
    buf: &'a mut Vec<u8>,
}

impl<'a> PduWriter<'a> {
    pub(crate) fn new(buf: &'a mut Vec<u8>) -> Self {
        buf.clear();
        Self { buf }
    }

    pub(crate) fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn put_entity(&mut self, v: EntityId) {
        self.buf.extend_from_slice(&v.to_bytes());
    }

    pub(crate) fn put_mac(&mut self, v: MacAddress) {
        self.buf.extend_from_slice(&v.octets());
    }

    pub(crate) fn put_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    pub(crate) fn put_header(&mut self, h: &ControlHeader) {
        self.put_u8((u8::from(h.cd) << 7) | (h.subtype & 0x7F));
        let version = (h.version & 0x07) << 4;
        self.put_u8((u8::from(h.sv) << 7) | version | (h.message_type & 0x0F));
        let status = u16::from(h.status & 0x1F) << 11;
        self.put_u16(status | (h.control_data_length & 0x07FF));
        self.put_entity(h.stream_id);
    }
}

/// Reader for decoding big-endian PDUs.
pub(crate) struct PduReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> PduReader<'a> {
    pub(crate) const fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Fails unless at least `need` bytes remain.
    pub(crate) fn require(&self, need: usize) -> Result<(), PduError> {
        if self.remaining() < need {
            return Err(PduError::BufferTooSmall {
                need,
                have: self.remaining(),
            });
        }
        Ok(())
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], PduError> {
        self.require(N)?;
        let mut arr = [0u8; N];
        arr.copy_from_slice(&self.buf[self.cursor..self.cursor + N]);
        self.cursor += N;
        Ok(arr)
    }

    pub(crate) fn take_u8(&mut self) -> Result<u8, PduError> {
        let [v] = self.take_array::<1>()?;
        Ok(v)
    }

    pub(crate) fn take_u16(&mut self) -> Result<u16, PduError> {
        Ok(u16::from_be_bytes(self.take_array()?))
    }

    pub(crate) fn take_u32(&mut self) -> Result<u32, PduError> {
        Ok(u32::from_be_bytes(self.take_array()?))
    }

    pub(crate) fn take_u64(&mut self) -> Result<u64, PduError> {
        Ok(u64::from_be_bytes(self.take_array()?))
    }

    pub(crate) fn take_entity(&mut self) -> Result<EntityId, PduError> {
        Ok(EntityId::from_bytes(self.take_array()?))
    }

    pub(crate) fn take_mac(&mut self) -> Result<MacAddress, PduError> {
        Ok(MacAddress::new(self.take_array()?))
    }

    pub(crate) fn take_bytes(&mut self, len: usize) -> Result<&'a [u8], PduError> {
        self.require(len)?;
        let bytes = &self.buf[self.cursor..self.cursor + len];
        self.cursor += len;
        Ok(bytes)
    }

    pub(crate) fn take_header(&mut self) -> Result<ControlHeader, PduError> {
        self.require(CONTROL_HEADER_LEN)?;
        let b0 = self.take_u8()?;
        let b1 = self.take_u8()?;
        let word = self.take_u16()?;
        let stream_id = self.take_entity()?;
        #[allow(clippy::cast_possible_truncation)] // 5 bits
        let status = (word >> 11) as u8;
        Ok(ControlHeader {
            cd: b0 & 0x80 != 0,
            subtype: b0 & 0x7F,
            sv: b1 & 0x80 != 0,
            version: (b1 >> 4) & 0x07,
            message_type: b1 & 0x0F,
            status,
            control_data_length: word & 0x07FF,
            stream_id,
        })
    }

    /// Reads the header and checks the subtype and minimum length.
    pub(crate) fn take_header_for(
        &mut self,
        expected: u8,
        pdu_len: usize,
    ) -> Result<ControlHeader, PduError> {
        if let Some(&first) = self.buf.get(self.cursor)
            && first & 0x7F != expected
        {
            return Err(PduError::SubtypeMismatch {
                expected,
                found: first & 0x7F,
            });
        }
        self.require(pdu_len)?;
        self.take_header()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_bitfields() {
        let header = ControlHeader {
            cd: true,
            subtype: subtype::ADP,
            sv: false,
            version: 0,
            message_type: 2,
            status: 31,
            control_data_length: 56,
            stream_id: EntityId::new(0x0011_2233_4455_6677),
        };
        let mut buf = Vec::new();
        PduWriter::new(&mut buf).put_header(&header);

        assert_eq!(
            buf,
            [0xFA, 0x02, 0xF8, 0x38, 0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
        assert_eq!(ControlHeader::decode(&buf).unwrap(), header);
        assert_eq!(header.pdu_len(), 68);
    }

    #[test]
    fn header_needs_twelve_bytes() {
        assert_eq!(
            ControlHeader::decode(&[0xFA; 11]),
            Err(PduError::BufferTooSmall { need: 12, have: 11 })
        );
    }

    #[test]
    fn subprotocol_from_subtype_ignores_cd_bit() {
        assert_eq!(
            Subprotocol::from_subtype(0xFA),
            Some(Subprotocol::Discovery)
        );
        assert_eq!(
            Subprotocol::from_subtype(0x7B),
            Some(Subprotocol::Enumeration)
        );
        assert_eq!(
            Subprotocol::from_subtype(0xFC),
            Some(Subprotocol::ConnectionManagement)
        );
        assert_eq!(Subprotocol::from_subtype(0x00), None);
        assert_eq!(Subprotocol::from_subtype(0x7D), None);
    }

    #[test]
    fn decode_dispatches_on_subtype() {
        let mut buf = Vec::new();
        Adpdu::discover(EntityId::WILDCARD).encode(&mut buf);
        assert!(matches!(Pdu::decode(&buf), Ok(Some(Pdu::Adp(_)))));

        buf[0] = 0xFF;
        assert_eq!(Pdu::decode(&buf), Ok(None));
        assert!(Pdu::decode(&[]).is_err());
    }
}
