//! AECP with the AEM (ATDECC Entity Model) command format.
//!
//! ```text
//! offset  field
//!      0  common control header (target_entity_id in the stream id slot)
//!     12  controller_entity_id (8)
//!     20  sequence_id (2)
//!     22  u (1 bit) | command_type (15 bits)
//!     24  command specific data
//! ```
//!
//! `control_data_length` covers controller id, sequence id, command type
//! and the command specific data, so it is never below 12.

use std::fmt;

use crate::net::frame::MAX_PAYLOAD_LEN;
use crate::net::{EntityId, MacAddress, OutboundFrame};

use super::{CONTROL_HEADER_LEN, ControlHeader, PduError, PduReader, PduWriter, subtype};

/// Length of the AEM header, up to the command specific data.
pub const AECPDU_AEM_HEADER_LEN: usize = 24;

/// Smallest valid `control_data_length` for an AEM PDU.
#[allow(clippy::cast_possible_truncation)] // 12 fits in 11 bits
pub const AEM_MIN_CONTROL_DATA_LEN: u16 = (AECPDU_AEM_HEADER_LEN - CONTROL_HEADER_LEN) as u16;

/// Largest command specific payload that fits in one standard frame.
pub const MAX_COMMAND_PAYLOAD_LEN: usize = MAX_PAYLOAD_LEN - AECPDU_AEM_HEADER_LEN;

const UNSOLICITED_BIT: u16 = 0x8000;

/// AECP message types handled here.
pub mod message_type {
    pub const AEM_COMMAND: u8 = 0;
    pub const AEM_RESPONSE: u8 = 1;
}

/// A few AEM command types, for building and logging commands.
///
/// The dispatcher itself does not interpret command types.
pub mod command_type {
    pub const ACQUIRE_ENTITY: u16 = 0x0000;
    pub const LOCK_ENTITY: u16 = 0x0001;
    pub const ENTITY_AVAILABLE: u16 = 0x0002;
    pub const CONTROLLER_AVAILABLE: u16 = 0x0003;
    pub const READ_DESCRIPTOR: u16 = 0x0004;
    pub const GET_CONFIGURATION: u16 = 0x0007;
    pub const REGISTER_UNSOLICITED_NOTIFICATION: u16 = 0x0024;
    pub const DEREGISTER_UNSOLICITED_NOTIFICATION: u16 = 0x0025;
}

/// An AECP AEM data unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AecpAemPdu {
    pub message_type: u8,
    pub status: u8,
    pub target_entity_id: EntityId,
    pub controller_entity_id: EntityId,
    pub sequence_id: u16,
    /// The `u` flag: unsolicited response.
    pub unsolicited: bool,
    pub command_type: u16,
    /// Command specific data.
    pub payload: Vec<u8>,
}

impl AecpAemPdu {
    /// An `AEM_COMMAND` from `controller` to `target`.
    #[must_use]
    pub fn command(
        controller: EntityId,
        target: EntityId,
        sequence_id: u16,
        command_type: u16,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            message_type: message_type::AEM_COMMAND,
            status: 0,
            target_entity_id: target,
            controller_entity_id: controller,
            sequence_id,
            unsolicited: false,
            command_type,
            payload,
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_command(&self) -> bool {
        self.message_type == message_type::AEM_COMMAND
    }

    /// Decodes an AEM PDU from an AVTP payload.
    ///
    /// Bytes past `12 + control_data_length` are Ethernet padding and are
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the subtype is not AECP, the header is truncated,
    /// `control_data_length` is below 12, or the announced data is missing.
    pub fn try_decode(bytes: &[u8]) -> Result<Self, PduError> {
        let mut r = PduReader::new(bytes);
        let header = r.take_header_for(subtype::AECP, AECPDU_AEM_HEADER_LEN)?;
        if header.control_data_length < AEM_MIN_CONTROL_DATA_LEN {
            return Err(PduError::ControlDataTooShort {
                declared: header.control_data_length,
                minimum: AEM_MIN_CONTROL_DATA_LEN,
            });
        }

        let controller_entity_id = r.take_entity()?;
        let sequence_id = r.take_u16()?;
        let raw_command_type = r.take_u16()?;
        let payload_len = header.pdu_len() - AECPDU_AEM_HEADER_LEN;
        let payload = r.take_bytes(payload_len)?.to_vec();

        Ok(Self {
            message_type: header.message_type,
            status: header.status,
            target_entity_id: header.stream_id,
            controller_entity_id,
            sequence_id,
            unsolicited: raw_command_type & UNSOLICITED_BIT != 0,
            command_type: raw_command_type & !UNSOLICITED_BIT,
            payload,
        })
    }

    /// Encodes the PDU into `buf` (cleared first, capacity kept).
    ///
    /// # Errors
    ///
    /// Returns [`PduError::PayloadTooLarge`] if the command specific data
    /// does not fit in one frame.
    pub fn encode(&self, buf: &mut Vec<u8>) -> Result<(), PduError> {
        if self.payload.len() > MAX_COMMAND_PAYLOAD_LEN {
            return Err(PduError::PayloadTooLarge {
                len: self.payload.len(),
                limit: MAX_COMMAND_PAYLOAD_LEN,
            });
        }
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_COMMAND_PAYLOAD_LEN
        let control_data_length = AEM_MIN_CONTROL_DATA_LEN + self.payload.len() as u16;

        let mut w = PduWriter::new(buf);
        w.put_header(&ControlHeader::control(
            subtype::AECP,
            self.message_type,
            self.status,
            control_data_length,
            self.target_entity_id,
        ));
        w.put_entity(self.controller_entity_id);
        w.put_u16(self.sequence_id);
        let u = if self.unsolicited { UNSOLICITED_BIT } else { 0 };
        w.put_u16(u | (self.command_type & !UNSOLICITED_BIT));
        w.put_bytes(&self.payload);
        Ok(())
    }

    /// Forms a frame addressed to `destination`, normally the target
    /// entity's MAC address learned from its advertisement.
    ///
    /// # Errors
    ///
    /// Returns [`PduError::PayloadTooLarge`] if the command specific data
    /// does not fit in one frame.
    pub fn form_message(&self, destination: MacAddress) -> Result<OutboundFrame, PduError> {
        let mut payload = Vec::with_capacity(AECPDU_AEM_HEADER_LEN + self.payload.len());
        self.encode(&mut payload)?;
        Ok(OutboundFrame::new(destination, payload))
    }
}

impl fmt::Display for AecpAemPdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.message_type {
            message_type::AEM_COMMAND => "AEM_COMMAND",
            message_type::AEM_RESPONSE => "AEM_RESPONSE",
            _ => "AECP_OTHER",
        };
        write!(
            f,
            "{kind} command_type=0x{:04x}{} status={} controller={} target={} seq={} len={}",
            self.command_type,
            if self.unsolicited { " (unsolicited)" } else { "" },
            self.status,
            self.controller_entity_id,
            self.target_entity_id,
            self.sequence_id,
            self.payload.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_descriptor() -> AecpAemPdu {
        AecpAemPdu::command(
            EntityId::new(0xC0),
            EntityId::new(0x7A),
            42,
            command_type::READ_DESCRIPTOR,
            vec![0, 0, 0, 0, 0, 0, 0, 0],
        )
    }

    #[test]
    fn encode_layout() {
        let mut buf = Vec::new();
        read_descriptor().encode(&mut buf).unwrap();

        assert_eq!(buf.len(), AECPDU_AEM_HEADER_LEN + 8);
        assert_eq!(buf[0], 0xFB);
        assert_eq!(buf[1], message_type::AEM_COMMAND);
        assert_eq!(u16::from_be_bytes([buf[2], buf[3]]), 20);
        assert_eq!(&buf[4..12], &0x7Au64.to_be_bytes());
        assert_eq!(&buf[12..20], &0xC0u64.to_be_bytes());
        assert_eq!(&buf[20..22], &42u16.to_be_bytes());
        assert_eq!(&buf[22..24], &command_type::READ_DESCRIPTOR.to_be_bytes());
    }

    #[test]
    fn decode_strips_padding_and_splits_u_flag() {
        let mut pdu = read_descriptor();
        pdu.message_type = message_type::AEM_RESPONSE;
        pdu.unsolicited = true;
        let mut buf = Vec::new();
        pdu.encode(&mut buf).unwrap();
        buf.extend_from_slice(&[0u8; 14]);

        let decoded = AecpAemPdu::try_decode(&buf).unwrap();
        assert_eq!(decoded, pdu);
        assert!(decoded.unsolicited);
        assert_eq!(decoded.command_type, command_type::READ_DESCRIPTOR);
    }

    #[test]
    fn decode_rejects_short_control_data() {
        let mut buf = Vec::new();
        read_descriptor().encode(&mut buf).unwrap();
        buf[2] = 0;
        buf[3] = 11;

        assert_eq!(
            AecpAemPdu::try_decode(&buf),
            Err(PduError::ControlDataTooShort {
                declared: 11,
                minimum: 12,
            })
        );
    }

    #[test]
    fn decode_rejects_missing_command_data() {
        let mut buf = Vec::new();
        read_descriptor().encode(&mut buf).unwrap();
        buf.truncate(28);

        assert_eq!(
            AecpAemPdu::try_decode(&buf),
            Err(PduError::BufferTooSmall { need: 8, have: 4 })
        );
    }

    #[test]
    fn oversized_payload_is_refused() {
        let pdu = AecpAemPdu::command(
            EntityId::new(1),
            EntityId::new(2),
            0,
            command_type::ACQUIRE_ENTITY,
            vec![0; MAX_COMMAND_PAYLOAD_LEN + 1],
        );
        assert!(matches!(
            pdu.form_message(MacAddress::BROADCAST),
            Err(PduError::PayloadTooLarge { .. })
        ));
    }
}
