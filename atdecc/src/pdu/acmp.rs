//! ACMP: ATDECC Connection Management Protocol.
//!
//! ```text
//! offset  field
//!      0  common control header (stream_id, status)
//!     12  controller_entity_id (8)
//!     20  talker_entity_id (8)
//!     28  listener_entity_id (8)
//!     36  talker_unique_id (2)        38  listener_unique_id (2)
//!     40  stream_dest_mac (6)
//!     46  connection_count (2)
//!     48  sequence_id (2)
//!     50  flags (2)
//!     52  stream_vlan_id (2)
//!     54  reserved (2)
//! ```
//!
//! Commands have even message types; the matching response is the next odd
//! value.

use std::fmt;

use crate::net::{EntityId, MacAddress, OutboundFrame};

use super::{CONTROL_HEADER_LEN, ControlHeader, PduError, PduReader, PduWriter, subtype};

/// Length of an ACMPDU.
pub const ACMPDU_LEN: usize = 56;

#[allow(clippy::cast_possible_truncation)] // 44 fits in 11 bits
const ACMPDU_CONTROL_DATA_LEN: u16 = (ACMPDU_LEN - CONTROL_HEADER_LEN) as u16;

/// ACMP message types.
pub mod message_type {
    pub const CONNECT_TX_COMMAND: u8 = 0;
    pub const CONNECT_TX_RESPONSE: u8 = 1;
    pub const DISCONNECT_TX_COMMAND: u8 = 2;
    pub const DISCONNECT_TX_RESPONSE: u8 = 3;
    pub const GET_TX_STATE_COMMAND: u8 = 4;
    pub const GET_TX_STATE_RESPONSE: u8 = 5;
    pub const CONNECT_RX_COMMAND: u8 = 6;
    pub const CONNECT_RX_RESPONSE: u8 = 7;
    pub const DISCONNECT_RX_COMMAND: u8 = 8;
    pub const DISCONNECT_RX_RESPONSE: u8 = 9;
    pub const GET_RX_STATE_COMMAND: u8 = 10;
    pub const GET_RX_STATE_RESPONSE: u8 = 11;
    pub const GET_TX_CONNECTION_COMMAND: u8 = 12;
    pub const GET_TX_CONNECTION_RESPONSE: u8 = 13;

    /// Human-readable name, for logs.
    #[must_use]
    pub const fn name(message_type: u8) -> &'static str {
        match message_type {
            CONNECT_TX_COMMAND => "CONNECT_TX_COMMAND",
            CONNECT_TX_RESPONSE => "CONNECT_TX_RESPONSE",
            DISCONNECT_TX_COMMAND => "DISCONNECT_TX_COMMAND",
            DISCONNECT_TX_RESPONSE => "DISCONNECT_TX_RESPONSE",
            GET_TX_STATE_COMMAND => "GET_TX_STATE_COMMAND",
            GET_TX_STATE_RESPONSE => "GET_TX_STATE_RESPONSE",
            CONNECT_RX_COMMAND => "CONNECT_RX_COMMAND",
            CONNECT_RX_RESPONSE => "CONNECT_RX_RESPONSE",
            DISCONNECT_RX_COMMAND => "DISCONNECT_RX_COMMAND",
            DISCONNECT_RX_RESPONSE => "DISCONNECT_RX_RESPONSE",
            GET_RX_STATE_COMMAND => "GET_RX_STATE_COMMAND",
            GET_RX_STATE_RESPONSE => "GET_RX_STATE_RESPONSE",
            GET_TX_CONNECTION_COMMAND => "GET_TX_CONNECTION_COMMAND",
            GET_TX_CONNECTION_RESPONSE => "GET_TX_CONNECTION_RESPONSE",
            _ => "ACMP_UNKNOWN",
        }
    }
}

/// An ACMP data unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Acmpdu {
    pub message_type: u8,
    pub status: u8,
    pub stream_id: EntityId,
    pub controller_entity_id: EntityId,
    pub talker_entity_id: EntityId,
    pub listener_entity_id: EntityId,
    pub talker_unique_id: u16,
    pub listener_unique_id: u16,
    pub stream_dest_mac: MacAddress,
    pub connection_count: u16,
    pub sequence_id: u16,
    pub flags: u16,
    pub stream_vlan_id: u16,
}

impl Acmpdu {
    /// `true` for command message types (even values).
    #[inline]
    #[must_use]
    pub const fn is_command(&self) -> bool {
        self.message_type % 2 == 0
    }

    #[inline]
    #[must_use]
    pub const fn is_response(&self) -> bool {
        !self.is_command()
    }

    /// Decodes an ACMPDU from an AVTP payload.
    ///
    /// # Errors
    ///
    /// Returns an error if the subtype is not ACMP or fewer than 56 bytes are
    /// available.
    pub fn try_decode(bytes: &[u8]) -> Result<Self, PduError> {
        let mut r = PduReader::new(bytes);
        let header = r.take_header_for(subtype::ACMP, ACMPDU_LEN)?;

        let controller_entity_id = r.take_entity()?;
        let talker_entity_id = r.take_entity()?;
        let listener_entity_id = r.take_entity()?;
        let talker_unique_id = r.take_u16()?;
        let listener_unique_id = r.take_u16()?;
        let stream_dest_mac = r.take_mac()?;
        let connection_count = r.take_u16()?;
        let sequence_id = r.take_u16()?;
        let flags = r.take_u16()?;
        let stream_vlan_id = r.take_u16()?;
        let _reserved = r.take_u16()?;

        Ok(Self {
            message_type: header.message_type,
            status: header.status,
            stream_id: header.stream_id,
            controller_entity_id,
            talker_entity_id,
            listener_entity_id,
            talker_unique_id,
            listener_unique_id,
            stream_dest_mac,
            connection_count,
            sequence_id,
            flags,
            stream_vlan_id,
        })
    }

    /// Encodes the ACMPDU into `buf` (cleared first, capacity kept).
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = PduWriter::new(buf);
        w.put_header(&ControlHeader::control(
            subtype::ACMP,
            self.message_type,
            self.status,
            ACMPDU_CONTROL_DATA_LEN,
            self.stream_id,
        ));
        w.put_entity(self.controller_entity_id);
        w.put_entity(self.talker_entity_id);
        w.put_entity(self.listener_entity_id);
        w.put_u16(self.talker_unique_id);
        w.put_u16(self.listener_unique_id);
        w.put_mac(self.stream_dest_mac);
        w.put_u16(self.connection_count);
        w.put_u16(self.sequence_id);
        w.put_u16(self.flags);
        w.put_u16(self.stream_vlan_id);
        w.put_u16(0);
    }

    /// Forms a frame addressed to the ADP/ACMP multicast group.
    #[must_use]
    pub fn form_message(&self) -> OutboundFrame {
        let mut payload = Vec::with_capacity(ACMPDU_LEN);
        self.encode(&mut payload);
        OutboundFrame::new(MacAddress::ADP_ACMP_MULTICAST, payload)
    }
}

impl fmt::Display for Acmpdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} status={} controller={} talker={}:{} listener={}:{} seq={}",
            message_type::name(self.message_type),
            self.status,
            self.controller_entity_id,
            self.talker_entity_id,
            self.talker_unique_id,
            self.listener_entity_id,
            self.listener_unique_id,
            self.sequence_id
        )
    }
}
