//! In-process transport for tests and simulations.
//!
//! [`LoopbackTransport`] is owned by the dispatch worker like a real socket;
//! the paired [`LoopbackPeer`] stays with the test and plays the rest of the
//! segment: it injects inbound frames, records what was transmitted, can
//! answer transmissions through a responder, and can make transmits fail.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::sync::queue::BlockingQueue;

use super::transport::{Connector, LinkParams, Transport};
use super::{EthernetFrame, InboundFrame, MacAddress};

type Responder = Box<dyn FnMut(&EthernetFrame) -> Vec<InboundFrame> + Send>;

struct Shared {
    inbound: BlockingQueue<InboundFrame>,
    transmitted: Mutex<Vec<EthernetFrame>>,
    responder: Mutex<Option<Responder>>,
    failing_transmits: AtomicUsize,
    closed: AtomicBool,
}

/// Worker-side end of an in-process link.
pub struct LoopbackTransport {
    local: MacAddress,
    shared: Arc<Shared>,
}

/// Test-side end of an in-process link.
#[derive(Clone)]
pub struct LoopbackPeer {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Creates a link whose interface has hardware address `local`.
    #[must_use]
    pub fn pair(local: MacAddress) -> (Self, LoopbackPeer) {
        let shared = Arc::new(Shared {
            inbound: BlockingQueue::new(),
            transmitted: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
            failing_transmits: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        let peer = LoopbackPeer {
            shared: Arc::clone(&shared),
        };
        (Self { local, shared }, peer)
    }
}

impl Transport for LoopbackTransport {
    fn local_address(&self) -> MacAddress {
        self.local
    }

    fn transmit(&mut self, frame: &EthernetFrame) -> io::Result<usize> {
        let failing = self
            .shared
            .failing_transmits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(io::Error::new(
                io::ErrorKind::NetworkDown,
                "loopback transmit failure",
            ));
        }

        self.shared
            .transmitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(frame.clone());

        let replies = self
            .shared
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
            .map(|respond| respond(frame))
            .unwrap_or_default();
        for reply in replies {
            self.shared.inbound.push(reply);
        }

        Ok(frame.wire_len())
    }

    fn receive_once(&mut self, timeout: Duration) -> io::Result<Option<InboundFrame>> {
        Ok(self.shared.inbound.try_pop(timeout))
    }
}

/// A loopback transport is already open; handing it to a dispatcher as the
/// connector gives it to the worker unchanged.
impl Connector for LoopbackTransport {
    type Transport = Self;

    fn open(self, _params: &LinkParams) -> io::Result<Self> {
        Ok(self)
    }
}

impl Drop for LoopbackTransport {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

impl LoopbackPeer {
    /// Queues a frame for the worker's next receive.
    pub fn inject(&self, frame: InboundFrame) {
        self.shared.inbound.push(frame);
    }

    /// Answers every transmitted frame with the frames `respond` returns.
    pub fn respond_with<F>(&self, respond: F)
    where
        F: FnMut(&EthernetFrame) -> Vec<InboundFrame> + Send + 'static,
    {
        *self
            .shared
            .responder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Box::new(respond));
    }

    /// Makes the next `count` transmits fail with an I/O error.
    pub fn fail_next_transmits(&self, count: usize) {
        self.shared.failing_transmits.store(count, Ordering::Release);
    }

    /// Snapshot of every frame transmitted so far, in order.
    #[must_use]
    pub fn transmitted(&self) -> Vec<EthernetFrame> {
        self.shared
            .transmitted
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Polls until at least `count` frames were transmitted or `timeout` passes.
    #[must_use]
    pub fn wait_for_transmitted(&self, count: usize, timeout: Duration) -> bool {
        let deadline = minstant::Instant::now() + timeout;
        loop {
            if self.transmitted().len() >= count {
                return true;
            }
            if minstant::Instant::now() > deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Frames injected but not yet received by the worker.
    #[must_use]
    pub fn pending_inbound(&self) -> usize {
        self.shared.inbound.len()
    }

    /// `true` once the worker dropped its end.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::AVTP_ETHERTYPE;

    const LOCAL: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 1]);

    fn frame(payload: &[u8]) -> EthernetFrame {
        EthernetFrame {
            destination: MacAddress::ADP_ACMP_MULTICAST,
            source: MacAddress::new([0x02, 0, 0, 0, 0, 9]),
            ethertype: AVTP_ETHERTYPE,
            payload: payload.to_vec(),
        }
    }

    #[test]
    fn injected_frames_are_received_in_order() {
        let (mut transport, peer) = LoopbackTransport::pair(LOCAL);
        peer.inject(frame(&[1]));
        peer.inject(frame(&[2]));

        let first = transport.receive_once(Duration::ZERO).unwrap().unwrap();
        let second = transport.receive_once(Duration::ZERO).unwrap().unwrap();
        assert_eq!(first.payload, vec![1]);
        assert_eq!(second.payload, vec![2]);
        assert!(transport.receive_once(Duration::ZERO).unwrap().is_none());
    }

    #[test]
    fn responder_feeds_inbound() {
        let (mut transport, peer) = LoopbackTransport::pair(LOCAL);
        peer.respond_with(|sent| vec![frame(&[sent.payload[0] + 1])]);

        transport.transmit(&frame(&[41])).unwrap();

        assert_eq!(peer.transmitted().len(), 1);
        let reply = transport.receive_once(Duration::ZERO).unwrap().unwrap();
        assert_eq!(reply.payload, vec![42]);
    }

    #[test]
    fn scripted_transmit_failures() {
        let (mut transport, peer) = LoopbackTransport::pair(LOCAL);
        peer.fail_next_transmits(1);

        assert!(transport.transmit(&frame(&[1])).is_err());
        assert!(transport.transmit(&frame(&[2])).is_ok());
        assert_eq!(peer.transmitted().len(), 1);
    }

    #[test]
    fn drop_marks_closed() {
        let (transport, peer) = LoopbackTransport::pair(MacAddress::UNSPECIFIED);
        assert!(!peer.is_closed());
        drop(transport);
        assert!(peer.is_closed());
    }
}
