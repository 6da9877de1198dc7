//! Link-layer primitives.
//!
//! Addresses, Ethernet frames, the [`Transport`] seam the dispatch worker
//! drives, and two transports: a Linux `AF_PACKET` raw socket and an
//! in-process loopback for tests.

pub mod address;
pub mod frame;
pub mod loopback;
pub mod socket;
pub mod transport;

pub use address::{EntityId, MacAddress, ParseMacError};
pub use frame::{AVTP_ETHERTYPE, ETHERNET_HEADER_LEN, EthernetFrame, InboundFrame, OutboundFrame};
pub use loopback::{LoopbackPeer, LoopbackTransport};
pub use socket::{RawSocket, RawSocketConnector};
pub use transport::{Connector, LinkParams, Transport};
