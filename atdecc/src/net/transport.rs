//! Transport seam between the dispatch worker and the link layer.
//!
//! The worker only needs three things from a link: its hardware address,
//! a way to put one frame on the wire, and a bounded wait for one frame to
//! come back. Closing is `Drop`.
//!
//! # Implementations
//!
//! - [`RawSocket`](super::RawSocket): Linux `AF_PACKET` socket (production)
//! - [`LoopbackTransport`](super::LoopbackTransport): in-process, scripted
//!   peer (tests)

use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::{EthernetFrame, InboundFrame, MacAddress};

/// Where and how a transport should be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkParams {
    /// Interface name, e.g. `eth0`.
    pub interface: String,
    /// Ethertype to bind to; frames with any other type are not delivered.
    pub ethertype: u16,
    /// Multicast group the interface must join.
    pub group: MacAddress,
    /// Kernel receive buffer size, if it should differ from the default.
    pub recv_buffer_size: Option<usize>,
}

/// An open link owned by exactly one worker thread.
pub trait Transport: Send + 'static {
    /// Hardware address assigned to the bound interface.
    fn local_address(&self) -> MacAddress;

    /// Transmits one complete frame.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the caller drops the frame.
    fn transmit(&mut self, frame: &EthernetFrame) -> io::Result<usize>;

    /// Waits at most `timeout` for one inbound frame.
    ///
    /// A zero timeout polls. `Ok(None)` means nothing arrived in time.
    ///
    /// # Errors
    ///
    /// Returns I/O errors other than "would block".
    fn receive_once(&mut self, timeout: Duration) -> io::Result<Option<InboundFrame>>;
}

/// Opens a [`Transport`]. Consumed by the worker during its Starting state,
/// so the transport is created on the thread that will own it.
pub trait Connector: Send + 'static {
    type Transport: Transport;

    /// # Errors
    ///
    /// Returns an error if the link cannot be opened.
    fn open(self, params: &LinkParams) -> io::Result<Self::Transport>;
}

impl<F, T> Connector for F
where
    F: FnOnce(&LinkParams) -> io::Result<T> + Send + 'static,
    T: Transport,
{
    type Transport = T;

    fn open(self, params: &LinkParams) -> io::Result<T> {
        self(params)
    }
}
