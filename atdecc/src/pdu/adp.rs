//! ADP: ATDECC Discovery Protocol.
//!
//! ```text
//! offset  field
//!      0  common control header (entity_id in the stream id slot)
//!     12  entity_model_id (8)
//!     20  entity_capabilities (4)
//!     24  talker_stream_sources (2)   26  talker_capabilities (2)
//!     28  listener_stream_sinks (2)   30  listener_capabilities (2)
//!     32  controller_capabilities (4)
//!     36  available_index (4)
//!     40  gptp_grandmaster_id (8)
//!     48  gptp_domain_number (1)      49  reserved (1)
//!     50  current_configuration_index (2)
//!     52  identify_control_index (2)
//!     54  interface_index (2)
//!     56  association_id (8)
//!     64  reserved (4)
//! ```

use std::fmt;

use crate::net::{EntityId, MacAddress, OutboundFrame};

use super::{CONTROL_HEADER_LEN, ControlHeader, PduError, PduReader, PduWriter, subtype};

/// Length of an ADPDU.
pub const ADPDU_LEN: usize = 68;

#[allow(clippy::cast_possible_truncation)] // 56 fits in 11 bits
const ADPDU_CONTROL_DATA_LEN: u16 = (ADPDU_LEN - CONTROL_HEADER_LEN) as u16;

/// ADP message types.
pub mod message_type {
    pub const ENTITY_AVAILABLE: u8 = 0;
    pub const ENTITY_DEPARTING: u8 = 1;
    pub const ENTITY_DISCOVER: u8 = 2;
}

/// An ADP data unit.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Adpdu {
    pub message_type: u8,
    /// Advertisement validity in 2-second units (5 bits).
    pub valid_time: u8,
    pub entity_id: EntityId,
    pub entity_model_id: EntityId,
    pub entity_capabilities: u32,
    pub talker_stream_sources: u16,
    pub talker_capabilities: u16,
    pub listener_stream_sinks: u16,
    pub listener_capabilities: u16,
    pub controller_capabilities: u32,
    pub available_index: u32,
    pub gptp_grandmaster_id: u64,
    pub gptp_domain_number: u8,
    pub current_configuration_index: u16,
    pub identify_control_index: u16,
    pub interface_index: u16,
    pub association_id: EntityId,
}

impl Adpdu {
    /// An `ENTITY_DISCOVER` for `target`; the wildcard asks every entity.
    #[must_use]
    pub fn discover(target: EntityId) -> Self {
        Self {
            message_type: message_type::ENTITY_DISCOVER,
            entity_id: target,
            ..Self::default()
        }
    }

    #[inline]
    #[must_use]
    pub const fn is_discover(&self) -> bool {
        self.message_type == message_type::ENTITY_DISCOVER
    }

    /// Decodes an ADPDU from an AVTP payload.
    ///
    /// Trailing bytes (Ethernet padding) are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the subtype is not ADP or fewer than 68 bytes are
    /// available.
    pub fn try_decode(bytes: &[u8]) -> Result<Self, PduError> {
        let mut r = PduReader::new(bytes);
        let header = r.take_header_for(subtype::ADP, ADPDU_LEN)?;

        let entity_model_id = r.take_entity()?;
        let entity_capabilities = r.take_u32()?;
        let talker_stream_sources = r.take_u16()?;
        let talker_capabilities = r.take_u16()?;
        let listener_stream_sinks = r.take_u16()?;
        let listener_capabilities = r.take_u16()?;
        let controller_capabilities = r.take_u32()?;
        let available_index = r.take_u32()?;
        let gptp_grandmaster_id = r.take_u64()?;
        let gptp_domain_number = r.take_u8()?;
        let _reserved0 = r.take_u8()?;
        let current_configuration_index = r.take_u16()?;
        let identify_control_index = r.take_u16()?;
        let interface_index = r.take_u16()?;
        let association_id = r.take_entity()?;
        let _reserved1 = r.take_u32()?;

        Ok(Self {
            message_type: header.message_type,
            valid_time: header.status,
            entity_id: header.stream_id,
            entity_model_id,
            entity_capabilities,
            talker_stream_sources,
            talker_capabilities,
            listener_stream_sinks,
            listener_capabilities,
            controller_capabilities,
            available_index,
            gptp_grandmaster_id,
            gptp_domain_number,
            current_configuration_index,
            identify_control_index,
            interface_index,
            association_id,
        })
    }

    /// Encodes the ADPDU into `buf` (cleared first, capacity kept).
    ///
    /// `control_data_length` is always written as 56.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut w = PduWriter::new(buf);
        w.put_header(&ControlHeader::control(
            subtype::ADP,
            self.message_type,
            self.valid_time,
            ADPDU_CONTROL_DATA_LEN,
            self.entity_id,
        ));
        w.put_entity(self.entity_model_id);
        w.put_u32(self.entity_capabilities);
        w.put_u16(self.talker_stream_sources);
        w.put_u16(self.talker_capabilities);
        w.put_u16(self.listener_stream_sinks);
        w.put_u16(self.listener_capabilities);
        w.put_u32(self.controller_capabilities);
        w.put_u32(self.available_index);
        w.put_u64(self.gptp_grandmaster_id);
        w.put_u8(self.gptp_domain_number);
        w.put_u8(0);
        w.put_u16(self.current_configuration_index);
        w.put_u16(self.identify_control_index);
        w.put_u16(self.interface_index);
        w.put_entity(self.association_id);
        w.put_u32(0);
    }

    /// Forms a frame addressed to the ADP/ACMP multicast group.
    #[must_use]
    pub fn form_message(&self) -> OutboundFrame {
        let mut payload = Vec::with_capacity(ADPDU_LEN);
        self.encode(&mut payload);
        OutboundFrame::new(MacAddress::ADP_ACMP_MULTICAST, payload)
    }
}

impl fmt::Display for Adpdu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.message_type {
            message_type::ENTITY_AVAILABLE => "ENTITY_AVAILABLE",
            message_type::ENTITY_DEPARTING => "ENTITY_DEPARTING",
            message_type::ENTITY_DISCOVER => "ENTITY_DISCOVER",
            _ => "ADP_UNKNOWN",
        };
        write!(
            f,
            "{kind} entity={} model={} available_index={} valid_time={}",
            self.entity_id, self.entity_model_id, self.available_index, self.valid_time
        )
    }
}
