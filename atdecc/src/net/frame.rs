//! Ethernet II frames as seen by the dispatcher.
//!
//! ```text
//! ┌──────────────┬──────────────┬─────────────┬──────────────────────────┐
//! │ Dest MAC (6) │ Src MAC (6)  │ Ethertype(2)│ Payload (AVTP control)   │
//! └──────────────┴──────────────┴─────────────┴──────────────────────────┘
//! ```
//!
//! VLAN tags are stripped by the kernel before frames reach a packet
//! socket, so the header is always 14 bytes here.

use super::MacAddress;

/// AVTP ethertype carrying every ATDECC sub-protocol.
pub const AVTP_ETHERTYPE: u16 = 0x22F0;

/// Ethernet II header length.
pub const ETHERNET_HEADER_LEN: usize = 14;

/// Largest payload a standard (non-jumbo) frame carries.
pub const MAX_PAYLOAD_LEN: usize = 1500;

/// A complete link-layer frame.
///
/// Received frames are handed to the classifier and callbacks by reference
/// and never retained by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetFrame {
    pub destination: MacAddress,
    pub source: MacAddress,
    pub ethertype: u16,
    pub payload: Vec<u8>,
}

/// Inbound frames are plain Ethernet frames.
pub type InboundFrame = EthernetFrame;

impl EthernetFrame {
    /// Parses a raw frame as delivered by a `SOCK_RAW` packet socket.
    ///
    /// Returns `None` if the buffer is shorter than the Ethernet header.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ETHERNET_HEADER_LEN {
            return None;
        }
        let mut destination = [0u8; 6];
        let mut source = [0u8; 6];
        destination.copy_from_slice(&bytes[0..6]);
        source.copy_from_slice(&bytes[6..12]);
        Some(Self {
            destination: MacAddress::new(destination),
            source: MacAddress::new(source),
            ethertype: u16::from_be_bytes([bytes[12], bytes[13]]),
            payload: bytes[ETHERNET_HEADER_LEN..].to_vec(),
        })
    }

    /// Serializes header and payload into `buf` (cleared first, capacity kept).
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.clear();
        buf.extend_from_slice(&self.destination.octets());
        buf.extend_from_slice(&self.source.octets());
        buf.extend_from_slice(&self.ethertype.to_be_bytes());
        buf.extend_from_slice(&self.payload);
    }

    /// Total on-wire length without FCS or padding.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        ETHERNET_HEADER_LEN + self.payload.len()
    }
}

/// A frame queued for transmission.
///
/// Carries only what the caller decides: the destination and the AVTP
/// payload. The worker stamps the source with the interface's hardware
/// address and the ethertype the transport is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    pub destination: MacAddress,
    pub payload: Vec<u8>,
}

impl OutboundFrame {
    #[must_use]
    pub fn new(destination: MacAddress, payload: Vec<u8>) -> Self {
        Self {
            destination,
            payload,
        }
    }

    /// Completes the frame with the local source address and ethertype.
    #[must_use]
    pub fn into_ethernet(self, source: MacAddress, ethertype: u16) -> EthernetFrame {
        EthernetFrame {
            destination: self.destination,
            source,
            ethertype,
            payload: self.payload,
        }
    }
}
