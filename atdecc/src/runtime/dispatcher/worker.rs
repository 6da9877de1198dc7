//! Dispatch worker: the single thread that owns the transport.
//!
//! Each iteration of the loop:
//! 1. pops at most one [`OutboundMessage`], waiting up to `queue_wait`
//!    unless the previous receive found a frame; a frame is stamped with
//!    the local address, transmitted and fed to the identity filter;
//!    `Shutdown` ends the loop;
//! 2. receives at most one frame, waiting up to `receive_wait`, classifies
//!    it and runs the matching callback on this thread;
//! 3. idles (`idle_sleep`, or a yield) when neither step found work.
//!
//! The transport, filter state and callbacks never leave this thread, so
//! nothing here takes a lock except the queue itself.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread;
use std::time::Duration;

use minstant::Instant;

use crate::net::{InboundFrame, MacAddress, OutboundFrame, Transport};
use crate::pdu::Pdu;
use crate::trace::{debug, info, trace, warn};

use super::DispatcherConfig;
use super::callbacks::Callbacks;
use super::classifier::{Classification, Classifier, IgnoreReason};
use super::commands::{OutboundMessage, OutboundQueue};
use super::filter::IdentityFilterState;

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    /// Opening the transport.
    Starting = 0,
    /// Looping over transmit and receive.
    Running = 1,
    /// Shutdown observed; releasing resources.
    Draining = 2,
    /// Thread finished (or never got a transport).
    Stopped = 3,
}

impl WorkerState {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Starting,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

/// Worker state readable from the handle.
#[derive(Debug, Clone)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    #[must_use]
    pub fn new() -> Self {
        Self(Arc::new(AtomicU8::new(WorkerState::Starting as u8)))
    }

    #[must_use]
    pub fn load(&self) -> WorkerState {
        WorkerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters kept by the worker, returned when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub transmitted: u64,
    pub transmit_errors: u64,
    pub received: u64,
    pub receive_errors: u64,
    pub dispatched: u64,
    /// Decoded but rejected by an identity filter.
    pub filtered: u64,
    /// Wrong ethertype, wrong destination, empty or unknown subtype.
    pub ignored: u64,
    /// Selected a decoder that failed.
    pub malformed: u64,
    /// Accepted, but no callback registered for the sub-protocol.
    pub unhandled: u64,
    pub slow_callbacks: u64,
}

/// The worker loop and everything it owns.
pub struct DispatchWorker<T: Transport> {
    transport: T,
    queue: OutboundQueue,
    callbacks: Callbacks,
    classifier: Classifier,
    filter: IdentityFilterState,
    local: MacAddress,
    ethertype: u16,
    queue_wait: Duration,
    receive_wait: Duration,
    idle_sleep: Duration,
    slow_callback: Duration,
    state: StateCell,
    stats: WorkerStats,
    /// The last receive returned a frame, so more are likely queued.
    inbound_pending: bool,
}

impl<T: Transport> DispatchWorker<T> {
    /// Builds a worker around an already open transport and marks it
    /// Running.
    pub fn new(
        transport: T,
        queue: OutboundQueue,
        callbacks: Callbacks,
        config: &DispatcherConfig,
        state: StateCell,
    ) -> Self {
        let local = transport.local_address();
        state.store(WorkerState::Running);
        Self {
            transport,
            queue,
            callbacks,
            classifier: Classifier::new(
                config.ethertype,
                config.group,
                local,
                config.connection_filter,
            ),
            filter: config.initial_filter,
            local,
            ethertype: config.ethertype,
            queue_wait: config.queue_wait,
            receive_wait: config.receive_wait,
            idle_sleep: config.idle_sleep,
            slow_callback: config.slow_callback,
            state,
            stats: WorkerStats::default(),
            inbound_pending: false,
        }
    }

    #[must_use]
    pub fn state(&self) -> WorkerState {
        self.state.load()
    }

    #[must_use]
    pub const fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    #[must_use]
    pub const fn filter(&self) -> &IdentityFilterState {
        &self.filter
    }

    #[must_use]
    pub const fn local_address(&self) -> MacAddress {
        self.local
    }

    /// Runs one loop iteration without idling.
    ///
    /// Returns `true` if a message was popped or a frame received. After a
    /// `Shutdown` the state is Draining and no receive is attempted.
    pub fn poll_once(&mut self) -> bool {
        let popped = self.transmit_next();
        if self.state() != WorkerState::Running {
            return popped;
        }
        let received = self.receive_next();
        self.inbound_pending = received;
        popped || received
    }

    /// Loops until `Shutdown`, then closes the transport.
    pub fn run(mut self) -> WorkerStats {
        info!(local = %self.local, "dispatch worker running");

        while self.state() == WorkerState::Running {
            if !self.poll_once() {
                self.idle();
            }
        }

        let Self {
            transport,
            callbacks,
            state,
            stats,
            ..
        } = self;
        drop(callbacks);
        drop(transport);
        state.store(WorkerState::Stopped);

        info!(
            transmitted = stats.transmitted,
            dispatched = stats.dispatched,
            filtered = stats.filtered,
            "dispatch worker stopped"
        );
        stats
    }

    fn idle(&self) {
        if self.idle_sleep.is_zero() {
            thread::yield_now();
        } else {
            thread::sleep(self.idle_sleep);
        }
    }

    fn transmit_next(&mut self) -> bool {
        // Never block on an idle queue while inbound frames are backed up.
        let wait = if self.inbound_pending {
            Duration::ZERO
        } else {
            self.queue_wait
        };
        match self.queue.try_pop(wait) {
            None => false,
            Some(OutboundMessage::Shutdown) => {
                debug!("shutdown observed");
                self.state.store(WorkerState::Draining);
                true
            }
            Some(OutboundMessage::Frame(frame)) => {
                self.transmit(frame);
                true
            }
        }
    }

    fn transmit(&mut self, frame: OutboundFrame) {
        let frame = frame.into_ethernet(self.local, self.ethertype);
        match self.transport.transmit(&frame) {
            Ok(_len) => {
                self.stats.transmitted += 1;
                trace!(destination = %frame.destination, len = _len, "frame transmitted");
                if let Ok(Some(sent)) = Pdu::decode(&frame.payload)
                    && self.filter.learn(&sent)
                {
                    debug!(filter = ?self.filter, "identity filter updated");
                }
            }
            Err(_e) => {
                self.stats.transmit_errors += 1;
                warn!(destination = %frame.destination, error = %_e, "transmit failed, frame dropped");
            }
        }
    }

    fn receive_next(&mut self) -> bool {
        let frame = match self.transport.receive_once(self.receive_wait) {
            Ok(Some(frame)) => frame,
            Ok(None) => return false,
            Err(_e) => {
                self.stats.receive_errors += 1;
                // Persistent errors would otherwise log every iteration.
                if self.stats.receive_errors.is_power_of_two() {
                    warn!(error = %_e, count = self.stats.receive_errors, "receive failed");
                }
                return false;
            }
        };
        self.stats.received += 1;

        match self.classifier.classify(&frame, &self.filter) {
            Classification::Dispatch(pdu) => self.dispatch(&frame, &pdu),
            Classification::Filtered {
                subprotocol: _subprotocol,
                reason: _reason,
            } => {
                self.stats.filtered += 1;
                trace!(subprotocol = %_subprotocol, reason = %_reason, source = %frame.source, "frame filtered");
            }
            Classification::Ignored(IgnoreReason::Malformed {
                subprotocol: _subprotocol,
                error: _error,
            }) => {
                self.stats.malformed += 1;
                trace!(subprotocol = %_subprotocol, error = %_error, source = %frame.source, "malformed pdu");
            }
            Classification::Ignored(_reason) => {
                self.stats.ignored += 1;
                trace!(reason = ?_reason, "frame ignored");
            }
        }
        true
    }

    fn dispatch(&mut self, frame: &InboundFrame, pdu: &Pdu) {
        let subprotocol = pdu.subprotocol();
        let Some(callback) = self.callbacks.get_mut(subprotocol) else {
            self.stats.unhandled += 1;
            debug!(%subprotocol, %pdu, source = %frame.source, "unhandled");
            return;
        };

        let start = Instant::now();
        callback(frame, pdu);
        let elapsed = start.elapsed();

        self.stats.dispatched += 1;
        if elapsed > self.slow_callback {
            self.stats.slow_callbacks += 1;
            warn!(
                %subprotocol,
                elapsed_us = elapsed.as_micros() as u64,
                "slow callback delayed the dispatch loop"
            );
        }
    }
}
