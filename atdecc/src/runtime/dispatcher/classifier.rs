//! Inbound frame classification.
//!
//! Pure decision logic: given a received frame and the worker's filter
//! state, decide whether the frame is dispatched to a sub-protocol callback,
//! rejected by an identity filter, or ignored outright. Rejections are the
//! steady state on a shared segment and are never errors.
//!
//! Order of checks:
//! 1. ethertype must be the bound one;
//! 2. destination must be the ADP/ACMP group or the local address;
//! 3. the subtype byte selects exactly one decoder;
//! 4. the decoded PDU passes that sub-protocol's filter.

use crate::net::{InboundFrame, MacAddress};
use crate::pdu::aecp::{self, AecpAemPdu};
use crate::pdu::{Acmpdu, Adpdu, ControlHeader, Pdu, PduError, Subprotocol};

use super::filter::{ConnectionFilterMode, FilterReason, IdentityFilterState};

/// Why a frame never reached a decoder's filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IgnoreReason {
    ForeignEthertype(u16),
    NotAddressedToUs(MacAddress),
    EmptyPayload,
    UnknownSubtype(u8),
    Malformed {
        subprotocol: Subprotocol,
        error: PduError,
    },
}

/// Outcome of classifying one inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Decoded and accepted: deliver to the sub-protocol's callback.
    Dispatch(Pdu),
    /// Decoded, rejected by the identity filter.
    Filtered {
        subprotocol: Subprotocol,
        reason: FilterReason,
    },
    /// Not ours, or not decodable.
    Ignored(IgnoreReason),
}

impl Classification {
    /// The dispatch decision as a sub-protocol and its decoded message.
    #[must_use]
    pub fn into_dispatch(self) -> Option<(Subprotocol, Pdu)> {
        match self {
            Self::Dispatch(pdu) => Some((pdu.subprotocol(), pdu)),
            Self::Filtered { .. } | Self::Ignored(_) => None,
        }
    }

    #[must_use]
    pub const fn is_dispatch(&self) -> bool {
        matches!(self, Self::Dispatch(_))
    }
}

/// Link-level parameters the classifier checks frames against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classifier {
    ethertype: u16,
    group: MacAddress,
    local: MacAddress,
    connection_mode: ConnectionFilterMode,
}

impl Classifier {
    #[must_use]
    pub const fn new(
        ethertype: u16,
        group: MacAddress,
        local: MacAddress,
        connection_mode: ConnectionFilterMode,
    ) -> Self {
        Self {
            ethertype,
            group,
            local,
            connection_mode,
        }
    }

    #[must_use]
    pub fn classify(&self, frame: &InboundFrame, state: &IdentityFilterState) -> Classification {
        if frame.ethertype != self.ethertype {
            return Classification::Ignored(IgnoreReason::ForeignEthertype(frame.ethertype));
        }
        if frame.destination != self.group && frame.destination != self.local {
            return Classification::Ignored(IgnoreReason::NotAddressedToUs(frame.destination));
        }
        let Some(&first) = frame.payload.first() else {
            return Classification::Ignored(IgnoreReason::EmptyPayload);
        };
        let Some(subprotocol) = Subprotocol::from_subtype(first) else {
            return Classification::Ignored(IgnoreReason::UnknownSubtype(first & 0x7F));
        };

        let verdict = self.decode_and_admit(subprotocol, &frame.payload, state);
        match verdict {
            Ok(Ok(pdu)) => Classification::Dispatch(pdu),
            Ok(Err(reason)) => Classification::Filtered {
                subprotocol,
                reason,
            },
            Err(error) => Classification::Ignored(IgnoreReason::Malformed { subprotocol, error }),
        }
    }

    fn decode_and_admit(
        &self,
        subprotocol: Subprotocol,
        bytes: &[u8],
        state: &IdentityFilterState,
    ) -> Result<Result<Pdu, FilterReason>, PduError> {
        Ok(match subprotocol {
            Subprotocol::Discovery => {
                let adp = Adpdu::try_decode(bytes)?;
                state.admit_discovery(&adp).map(|()| Pdu::Adp(adp))
            }
            Subprotocol::ConnectionManagement => {
                let acmp = Acmpdu::try_decode(bytes)?;
                state.admit_connection(&acmp, self.connection_mode).map(|()| Pdu::Acmp(acmp))
            }
            Subprotocol::Enumeration => {
                let checked = Self::decode_enumeration(bytes)?;
                checked.and_then(|aem| state.admit_enumeration(&aem).map(|()| Pdu::Aecp(aem)))
            }
        })
    }

    /// Validates the AECP header for AEM before decoding the body.
    fn decode_enumeration(bytes: &[u8]) -> Result<Result<AecpAemPdu, FilterReason>, PduError> {
        let header = ControlHeader::decode(bytes)?;
        if !header.cd {
            return Ok(Err(FilterReason::NotControl));
        }
        if header.version != 0 {
            return Ok(Err(FilterReason::UnsupportedVersion(header.version)));
        }
        if header.message_type != aecp::message_type::AEM_COMMAND
            && header.message_type != aecp::message_type::AEM_RESPONSE
        {
            return Ok(Err(FilterReason::UnsupportedMessageType(header.message_type)));
        }
        if header.control_data_length < aecp::AEM_MIN_CONTROL_DATA_LEN {
            return Ok(Err(FilterReason::ControlDataTooShort(header.control_data_length)));
        }
        AecpAemPdu::try_decode(bytes).map(Ok)
    }
}
