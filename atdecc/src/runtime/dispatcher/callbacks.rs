//! User callbacks, one per sub-protocol.
//!
//! Callbacks run synchronously on the worker thread, so a slow callback
//! delays the next transmit and receive. [`Callbacks::forward`] moves the
//! work off the worker: every delivery is cloned into a channel the caller
//! drains on a thread of its own.

use std::fmt;
use std::sync::mpsc;

use crate::net::InboundFrame;
use crate::pdu::{Pdu, Subprotocol};
use crate::trace::debug;

/// Callback invoked for each dispatched frame of one sub-protocol.
pub type Callback = Box<dyn FnMut(&InboundFrame, &Pdu) + Send>;

/// An owned copy of one dispatch, for handing to another thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub subprotocol: Subprotocol,
    pub frame: InboundFrame,
    pub pdu: Pdu,
}

/// Registered callbacks, moved into the worker at creation.
///
/// ```ignore
/// let callbacks = Callbacks::new()
///     .on_discovery(|frame, pdu| println!("{} {pdu}", frame.source))
///     .on_enumeration(|_, pdu| println!("{pdu}"));
/// ```
#[derive(Default)]
pub struct Callbacks {
    discovery: Option<Callback>,
    connection: Option<Callback>,
    enumeration: Option<Callback>,
}

impl Callbacks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the ADP callback.
    #[must_use]
    pub fn on_discovery<F>(mut self, f: F) -> Self
    where
        F: FnMut(&InboundFrame, &Pdu) + Send + 'static,
    {
        self.discovery = Some(Box::new(f));
        self
    }

    /// Sets the ACMP callback.
    #[must_use]
    pub fn on_connection<F>(mut self, f: F) -> Self
    where
        F: FnMut(&InboundFrame, &Pdu) + Send + 'static,
    {
        self.connection = Some(Box::new(f));
        self
    }

    /// Sets the AECP callback.
    #[must_use]
    pub fn on_enumeration<F>(mut self, f: F) -> Self
    where
        F: FnMut(&InboundFrame, &Pdu) + Send + 'static,
    {
        self.enumeration = Some(Box::new(f));
        self
    }

    /// Sends every delivery, of every sub-protocol, to `tx`.
    ///
    /// Replaces all three callbacks. A dropped receiver is not an error;
    /// deliveries are discarded from then on.
    #[must_use]
    pub fn forward(tx: mpsc::Sender<Delivery>) -> Self {
        let forwarder = |tx: mpsc::Sender<Delivery>| -> Callback {
            Box::new(move |frame: &InboundFrame, pdu: &Pdu| {
                let delivery = Delivery {
                    subprotocol: pdu.subprotocol(),
                    frame: frame.clone(),
                    pdu: pdu.clone(),
                };
                if tx.send(delivery).is_err() {
                    debug!("delivery receiver dropped");
                }
            })
        };
        Self {
            discovery: Some(forwarder(tx.clone())),
            connection: Some(forwarder(tx.clone())),
            enumeration: Some(forwarder(tx)),
        }
    }

    /// The callback for `subprotocol`, if one is registered.
    pub fn get_mut(&mut self, subprotocol: Subprotocol) -> Option<&mut Callback> {
        match subprotocol {
            Subprotocol::Discovery => self.discovery.as_mut(),
            Subprotocol::ConnectionManagement => self.connection.as_mut(),
            Subprotocol::Enumeration => self.enumeration.as_mut(),
        }
    }

    #[must_use]
    pub const fn is_registered(&self, subprotocol: Subprotocol) -> bool {
        match subprotocol {
            Subprotocol::Discovery => self.discovery.is_some(),
            Subprotocol::ConnectionManagement => self.connection.is_some(),
            Subprotocol::Enumeration => self.enumeration.is_some(),
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("discovery", &self.discovery.is_some())
            .field("connection", &self.connection.is_some())
            .field("enumeration", &self.enumeration.is_some())
            .finish()
    }
}
