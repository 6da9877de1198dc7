//! Identity and sequence filters applied to decoded inbound PDUs.
//!
//! A zero entity id or zero sequence id on record is a wildcard. The worker
//! is the only owner of [`IdentityFilterState`]: it starts from the value in
//! the configuration and learns from every frame it transmits, so a
//! response is accepted only if it answers what this handle last asked.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::net::EntityId;
use crate::pdu::adp::Adpdu;
use crate::pdu::aecp::AecpAemPdu;
use crate::pdu::{Acmpdu, Pdu};

/// How ACMP frames are filtered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionFilterMode {
    /// Accept every decoded ACMPDU.
    #[default]
    Permissive,
    /// Match responses against the controller, listener and sequence on
    /// record. Commands are always accepted.
    Strict,
}

/// Why a decoded PDU was not dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterReason {
    EntityMismatch,
    ControllerMismatch,
    ListenerMismatch,
    ListenerUniqueMismatch,
    TargetMismatch,
    SequenceMismatch,
    /// `cd` bit clear: not a control PDU.
    NotControl,
    UnsupportedVersion(u8),
    UnsupportedMessageType(u8),
    ControlDataTooShort(u16),
}

impl fmt::Display for FilterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EntityMismatch => f.write_str("entity id mismatch"),
            Self::ControllerMismatch => f.write_str("controller id mismatch"),
            Self::ListenerMismatch => f.write_str("listener id mismatch"),
            Self::ListenerUniqueMismatch => f.write_str("listener unique id mismatch"),
            Self::TargetMismatch => f.write_str("target id mismatch"),
            Self::SequenceMismatch => f.write_str("sequence id mismatch"),
            Self::NotControl => f.write_str("cd bit clear"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported version {v}"),
            Self::UnsupportedMessageType(t) => write!(f, "unsupported message type {t}"),
            Self::ControlDataTooShort(len) => write!(f, "control data length {len} too short"),
        }
    }
}

/// ADP filter: the entity a discovery was last sent for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryFilter {
    pub entity_id: EntityId,
}

/// ACMP filter: the identities of the last command sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionFilter {
    pub controller_entity_id: EntityId,
    pub listener_entity_id: EntityId,
    pub listener_unique_id: u16,
    pub sequence_id: u16,
}

/// AECP filter: the identities of the last AEM command sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EnumerationFilter {
    pub controller_entity_id: EntityId,
    pub target_entity_id: EntityId,
    pub sequence_id: u16,
}

/// Per-handle filter records, one per sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityFilterState {
    pub discovery: DiscoveryFilter,
    pub connection: ConnectionFilter,
    pub enumeration: EnumerationFilter,
}

#[inline]
const fn sequence_admits(on_record: u16, seen: u16) -> bool {
    on_record == 0 || on_record == seen
}

#[inline]
fn check(ok: bool, reason: FilterReason) -> Result<(), FilterReason> {
    if ok { Ok(()) } else { Err(reason) }
}

impl IdentityFilterState {
    /// Updates the records from a PDU this handle transmitted.
    ///
    /// Only requests change the filter: an ADP discover, an ACMP command or
    /// an AEM command. Returns `true` if anything was recorded.
    pub fn learn(&mut self, sent: &Pdu) -> bool {
        match sent {
            Pdu::Adp(adp) if adp.is_discover() => {
                self.discovery.entity_id = adp.entity_id;
                true
            }
            Pdu::Acmp(acmp) if acmp.is_command() => {
                self.connection = ConnectionFilter {
                    controller_entity_id: acmp.controller_entity_id,
                    listener_entity_id: acmp.listener_entity_id,
                    listener_unique_id: acmp.listener_unique_id,
                    sequence_id: acmp.sequence_id,
                };
                true
            }
            Pdu::Aecp(aecp) if aecp.is_command() => {
                self.enumeration = EnumerationFilter {
                    controller_entity_id: aecp.controller_entity_id,
                    target_entity_id: aecp.target_entity_id,
                    sequence_id: aecp.sequence_id,
                };
                true
            }
            _ => false,
        }
    }

    /// # Errors
    ///
    /// Returns the reason if a discovery target is on record and differs.
    pub fn admit_discovery(&self, adp: &Adpdu) -> Result<(), FilterReason> {
        check(
            self.discovery.entity_id.admits(adp.entity_id),
            FilterReason::EntityMismatch,
        )
    }

    /// # Errors
    ///
    /// In [`ConnectionFilterMode::Strict`], returns the first mismatching
    /// field of a response.
    pub fn admit_connection(
        &self,
        acmp: &Acmpdu,
        mode: ConnectionFilterMode,
    ) -> Result<(), FilterReason> {
        if mode == ConnectionFilterMode::Permissive || acmp.is_command() {
            return Ok(());
        }
        let record = &self.connection;
        check(
            record.controller_entity_id.admits(acmp.controller_entity_id),
            FilterReason::ControllerMismatch,
        )?;
        check(
            record.listener_entity_id.admits(acmp.listener_entity_id),
            FilterReason::ListenerMismatch,
        )?;
        check(
            record.listener_entity_id.is_wildcard()
                || record.listener_unique_id == acmp.listener_unique_id,
            FilterReason::ListenerUniqueMismatch,
        )?;
        check(
            sequence_admits(record.sequence_id, acmp.sequence_id),
            FilterReason::SequenceMismatch,
        )
    }

    /// # Errors
    ///
    /// Returns the first of controller, target or sequence that is on
    /// record and differs.
    pub fn admit_enumeration(&self, aecp: &AecpAemPdu) -> Result<(), FilterReason> {
        let record = &self.enumeration;
        check(
            record.controller_entity_id.admits(aecp.controller_entity_id),
            FilterReason::ControllerMismatch,
        )?;
        check(
            record.target_entity_id.admits(aecp.target_entity_id),
            FilterReason::TargetMismatch,
        )?;
        check(
            sequence_admits(record.sequence_id, aecp.sequence_id),
            FilterReason::SequenceMismatch,
        )
    }
}
