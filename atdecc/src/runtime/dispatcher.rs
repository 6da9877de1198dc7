//! ATDECC dispatcher: one worker thread per handle over a raw link.
//!
//! # Architecture
//!
//! ```text
//!  caller threads                         worker thread ("atdecc-dispatch")
//!  ──────────────                         ────────────────────────────────
//!  Dispatcher::send ─┐                    ┌─ try_pop ─ stamp ─ transmit ─ learn filter
//!  FrameSender::send ┼─▶ BlockingQueue ──▶│
//!  Dispatcher::drop ─┘   (Frame|Shutdown) └─ receive_once ─ classify ─ callback
//! ```
//!
//! The worker is the only owner of the transport, the identity filter and
//! the callbacks. Callers share nothing with it but the queue. Shutdown is
//! a message on that queue, so it is observed after every frame pushed
//! before it.
//!
//! # Lifecycle
//!
//! [`Dispatcher::create`] spawns the worker and waits until it has opened
//! the transport (Starting → Running). If opening fails the handle is
//! either not created ([`OpenFailurePolicy::Fail`]) or created inert
//! ([`OpenFailurePolicy::Inert`]). [`Dispatcher::shutdown`] abandons
//! pending frames, sends `Shutdown` and joins (Draining → Stopped); `Drop`
//! does the same if `shutdown` was not called.
//!
//! # Example
//!
//! ```ignore
//! use atdecc::{Callbacks, Dispatcher, DispatcherConfig, EntityId};
//! use atdecc::pdu::Adpdu;
//!
//! let callbacks = Callbacks::new().on_discovery(|frame, pdu| println!("{} {pdu}", frame.source));
//! let dispatcher = Dispatcher::create(DispatcherConfig::for_interface("eth0"), callbacks)?;
//!
//! dispatcher.send_adp(&Adpdu::discover(EntityId::WILDCARD))?;
//! // ... entities answer on the discovery callback ...
//!
//! let report = dispatcher.shutdown()?;
//! ```

pub mod callbacks;
pub mod classifier;
pub mod commands;
pub mod filter;
pub mod worker;

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::net::{
    AVTP_ETHERTYPE, Connector, LinkParams, MacAddress, OutboundFrame, RawSocketConnector,
};
use crate::pdu::{Acmpdu, Adpdu, AecpAemPdu, PduError};
use crate::sync::queue::BlockingQueue;
use crate::trace::{debug, error, info, warn};

use callbacks::Callbacks;
use commands::{OutboundMessage, OutboundQueue, count_frames};
use filter::{ConnectionFilterMode, IdentityFilterState};
use worker::{DispatchWorker, StateCell, WorkerState, WorkerStats};

/// Name given to every worker thread.
pub const WORKER_THREAD_NAME: &str = "atdecc-dispatch";

/// What [`Dispatcher::create`] does when the transport cannot be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenFailurePolicy {
    /// Return [`DispatchError::TransportOpen`].
    #[default]
    Fail,
    /// Return a handle whose callbacks never fire and whose sends are
    /// abandoned at shutdown.
    Inert,
}

/// Configuration for a dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Network interface to bind, e.g. `eth0`.
    pub interface: String,
    /// Ethertype to bind and stamp on outbound frames.
    pub ethertype: u16,
    /// Multicast group to join and accept.
    pub group: MacAddress,
    /// How long each iteration waits for an outbound message.
    pub queue_wait: Duration,
    /// How long each iteration waits for an inbound frame.
    pub receive_wait: Duration,
    /// Pause after an iteration with no work; zero yields instead.
    pub idle_sleep: Duration,
    /// Callbacks running longer than this are logged and counted.
    pub slow_callback: Duration,
    /// ACMP filtering.
    pub connection_filter: ConnectionFilterMode,
    /// Filter records the worker starts from.
    pub initial_filter: IdentityFilterState,
    /// Kernel receive buffer size for the raw socket.
    pub recv_buffer_size: Option<usize>,
    /// Pin the worker thread to this core.
    pub cpu_core: Option<usize>,
    pub on_open_failure: OpenFailurePolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interface: "eth0".to_owned(),
            ethertype: AVTP_ETHERTYPE,
            group: MacAddress::ADP_ACMP_MULTICAST,
            queue_wait: Duration::from_millis(1),
            receive_wait: Duration::ZERO,
            idle_sleep: Duration::ZERO,
            slow_callback: Duration::from_millis(10),
            connection_filter: ConnectionFilterMode::Permissive,
            initial_filter: IdentityFilterState::default(),
            recv_buffer_size: None,
            cpu_core: None,
            on_open_failure: OpenFailurePolicy::Fail,
        }
    }
}

impl DispatcherConfig {
    /// Default configuration bound to `interface`.
    #[must_use]
    pub fn for_interface(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn link_params(&self) -> LinkParams {
        LinkParams {
            interface: self.interface.clone(),
            ethertype: self.ethertype,
            group: self.group,
            recv_buffer_size: self.recv_buffer_size,
        }
    }
}

/// Error creating or shutting down a dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The worker could not open the transport.
    #[error("failed to open transport on {interface}: {source}")]
    TransportOpen {
        interface: String,
        #[source]
        source: io::Error,
    },
    /// The worker thread panicked.
    #[error("dispatch worker panicked")]
    WorkerPanicked,
}

/// Error enqueueing a frame.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Shutdown has begun or the worker died; the frame is handed back.
    #[error("dispatcher is shut down")]
    Closed(OutboundFrame),
    /// The PDU could not be formed into a frame.
    #[error("cannot form message: {0}")]
    Pdu(#[from] PduError),
}

/// Outcome of [`Dispatcher::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Frames that were queued but never transmitted.
    pub abandoned: usize,
    /// Worker counters; all zero for an inert handle.
    pub stats: WorkerStats,
}

/// Cloneable producer side of a dispatcher's queue.
#[derive(Debug, Clone)]
pub struct FrameSender {
    queue: OutboundQueue,
    closed: Arc<AtomicBool>,
}

impl FrameSender {
    /// Enqueues `frame` for transmission.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] once shutdown has begun or the worker
    /// has panicked.
    pub fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed(frame));
        }
        self.queue.push(OutboundMessage::Frame(frame));
        Ok(())
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Handle to a running dispatch worker.
///
/// `Sync`: share it by reference across threads, or hand out
/// [`FrameSender`]s.
#[derive(Debug)]
pub struct Dispatcher {
    sender: FrameSender,
    worker: Option<JoinHandle<WorkerStats>>,
    state: StateCell,
    interface: String,
    local: Option<MacAddress>,
}

impl Dispatcher {
    /// Creates a dispatcher over a Linux raw socket.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::with_connector`].
    pub fn create(config: DispatcherConfig, callbacks: Callbacks) -> Result<Self, DispatchError> {
        Self::with_connector(config, callbacks, RawSocketConnector)
    }

    /// Creates a dispatcher whose worker opens its transport through
    /// `connector`.
    ///
    /// Blocks until the worker has either opened the transport or failed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::TransportOpen`] if opening fails and the
    /// policy is [`OpenFailurePolicy::Fail`], or
    /// [`DispatchError::WorkerPanicked`] if the worker died before
    /// reporting.
    ///
    /// # Panics
    ///
    /// Panics if the worker thread cannot be spawned.
    pub fn with_connector<C: Connector>(
        config: DispatcherConfig,
        callbacks: Callbacks,
        connector: C,
    ) -> Result<Self, DispatchError> {
        info!(
            interface = %config.interface,
            ethertype = config.ethertype,
            group = %config.group,
            ?callbacks,
            "dispatcher starting"
        );

        let queue: OutboundQueue = Arc::new(BlockingQueue::new());
        let closed = Arc::new(AtomicBool::new(false));
        let state = StateCell::new();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<io::Result<MacAddress>>(1);

        let worker_queue = Arc::clone(&queue);
        let worker_state = state.clone();
        let worker_config = config.clone();
        let exit_guard = CloseOnPanic {
            closed: Arc::clone(&closed),
            state: state.clone(),
        };
        let handle = thread::Builder::new()
            .name(WORKER_THREAD_NAME.into())
            .spawn(move || {
                let _exit_guard = exit_guard;
                if let Some(core) = worker_config.cpu_core
                    && !pin_to_core(core)
                {
                    warn!(core, "failed to pin dispatch worker");
                }
                let transport = match connector.open(&worker_config.link_params()) {
                    Ok(transport) => transport,
                    Err(e) => {
                        error!(interface = %worker_config.interface, error = %e, "failed to open transport");
                        worker_state.store(WorkerState::Stopped);
                        let _ = ready_tx.send(Err(e));
                        return WorkerStats::default();
                    }
                };
                let worker = DispatchWorker::new(
                    transport,
                    worker_queue,
                    callbacks,
                    &worker_config,
                    worker_state,
                );
                let _ = ready_tx.send(Ok(worker.local_address()));
                worker.run()
            })
            .expect("failed to spawn dispatch worker thread");

        let sender = FrameSender { queue, closed };

        match ready_rx.recv() {
            Ok(Ok(local)) => {
                info!(interface = %config.interface, local = %local, "dispatcher started");
                Ok(Self {
                    sender,
                    worker: Some(handle),
                    state,
                    interface: config.interface,
                    local: Some(local),
                })
            }
            Ok(Err(source)) => {
                let _ = handle.join();
                match config.on_open_failure {
                    OpenFailurePolicy::Fail => Err(DispatchError::TransportOpen {
                        interface: config.interface,
                        source,
                    }),
                    OpenFailurePolicy::Inert => {
                        warn!(interface = %config.interface, "dispatcher is inert, sends will be abandoned");
                        Ok(Self {
                            sender,
                            worker: None,
                            state,
                            interface: config.interface,
                            local: None,
                        })
                    }
                }
            }
            Err(_) => {
                let _ = handle.join();
                Err(DispatchError::WorkerPanicked)
            }
        }
    }

    /// Enqueues a frame; callable from any thread.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] once shutdown has begun.
    pub fn send(&self, frame: OutboundFrame) -> Result<(), SendError> {
        self.sender.send(frame)
    }

    /// Forms and enqueues an ADP message to the multicast group.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] once shutdown has begun.
    pub fn send_adp(&self, adp: &Adpdu) -> Result<(), SendError> {
        self.send(adp.form_message())
    }

    /// Forms and enqueues an ACMP message to the multicast group.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Closed`] once shutdown has begun.
    pub fn send_acmp(&self, acmp: &Acmpdu) -> Result<(), SendError> {
        self.send(acmp.form_message())
    }

    /// Forms and enqueues an AEM message to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::Pdu`] if the command data is too large, or
    /// [`SendError::Closed`] once shutdown has begun.
    pub fn send_aecp(&self, aecp: &AecpAemPdu, destination: MacAddress) -> Result<(), SendError> {
        self.send(aecp.form_message(destination)?)
    }

    /// A cloneable sender feeding this dispatcher's queue.
    #[must_use]
    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    /// Hardware address of the bound interface; `None` for an inert handle.
    #[must_use]
    pub const fn local_address(&self) -> Option<MacAddress> {
        self.local
    }

    #[must_use]
    pub fn interface(&self) -> &str {
        &self.interface
    }

    #[must_use]
    pub fn worker_state(&self) -> WorkerState {
        self.state.load()
    }

    /// `true` if the transport never opened.
    #[must_use]
    pub const fn is_inert(&self) -> bool {
        self.local.is_none()
    }

    /// Messages queued but not yet taken by the worker.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.sender.queue.len()
    }

    /// Abandons pending frames, stops the worker and waits for it.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::WorkerPanicked`] if the worker panicked,
    /// for instance inside a callback.
    pub fn shutdown(mut self) -> Result<ShutdownReport, DispatchError> {
        info!(interface = %self.interface, "dispatcher shutdown initiated");
        self.stop(true)
    }

    /// Like [`shutdown`](Self::shutdown), but lets the worker transmit every
    /// frame queued before this call first.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::WorkerPanicked`] if the worker panicked.
    pub fn shutdown_after_pending(mut self) -> Result<ShutdownReport, DispatchError> {
        let _pending = self.pending();
        info!(interface = %self.interface, pending = _pending, "dispatcher flushing before shutdown");
        self.stop(false)
    }

    fn stop(&mut self, abandon_pending: bool) -> Result<ShutdownReport, DispatchError> {
        let queue = &self.sender.queue;
        self.sender.closed.store(true, Ordering::Release);

        let mut abandoned = if abandon_pending || self.worker.is_none() {
            count_frames(&queue.drain())
        } else {
            0
        };

        let mut joined = Ok(WorkerStats::default());
        if let Some(handle) = self.worker.take() {
            queue.push(OutboundMessage::Shutdown);
            debug!("waiting for dispatch worker to exit");
            joined = handle.join().map_err(|_| DispatchError::WorkerPanicked);
        }

        // Sends racing with the close flag can land behind the shutdown marker,
        // and a dead worker leaves everything it never popped.
        abandoned += count_frames(&queue.drain());
        if abandoned > 0 {
            info!(abandoned, "pending frames abandoned");
        }

        let stats = joined?;
        info!(interface = %self.interface, "dispatcher shutdown complete");
        Ok(ShutdownReport { abandoned, stats })
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        // A worker that died on its own has closed the handle but not been joined.
        if self.worker.is_some() || !self.sender.is_closed() {
            let _ = self.stop(true);
        }
    }
}

/// Closes the handle and marks the worker stopped if its thread unwinds.
struct CloseOnPanic {
    closed: Arc<AtomicBool>,
    state: StateCell,
}

impl Drop for CloseOnPanic {
    fn drop(&mut self) {
        if thread::panicking() {
            error!("dispatch worker panicked, handle closed");
            self.closed.store(true, Ordering::Release);
            self.state.store(WorkerState::Stopped);
        }
    }
}

fn pin_to_core(core_id: usize) -> bool {
    core_affinity::set_for_current(core_affinity::CoreId { id: core_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{EntityId, LoopbackTransport};

    const LOCAL: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 1]);

    fn quick_config() -> DispatcherConfig {
        DispatcherConfig {
            interface: "lo-test".to_owned(),
            receive_wait: Duration::from_millis(1),
            ..DispatcherConfig::default()
        }
    }

    #[test]
    fn default_config_targets_adp_acmp_group() {
        let config = DispatcherConfig::default();
        assert_eq!(config.ethertype, AVTP_ETHERTYPE);
        assert_eq!(config.group, MacAddress::ADP_ACMP_MULTICAST);
        assert_eq!(config.on_open_failure, OpenFailurePolicy::Fail);
        assert_eq!(config.connection_filter, ConnectionFilterMode::Permissive);

        let params = DispatcherConfig::for_interface("eth1").link_params();
        assert_eq!(params.interface, "eth1");
        assert_eq!(params.ethertype, AVTP_ETHERTYPE);
    }

    #[test]
    fn create_reports_local_address_and_runs() {
        let (transport, _peer) = LoopbackTransport::pair(LOCAL);
        let dispatcher =
            Dispatcher::with_connector(quick_config(), Callbacks::new(), transport).unwrap();

        assert_eq!(dispatcher.local_address(), Some(LOCAL));
        assert_eq!(dispatcher.worker_state(), WorkerState::Running);
        assert!(!dispatcher.is_inert());

        let report = dispatcher.shutdown().unwrap();
        assert_eq!(report.abandoned, 0);
    }

    #[test]
    fn open_failure_fails_by_default() {
        let result = Dispatcher::with_connector(
            quick_config(),
            Callbacks::new(),
            |_: &LinkParams| -> io::Result<LoopbackTransport> {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such interface"))
            },
        );
        match result {
            Err(DispatchError::TransportOpen { interface, source }) => {
                assert_eq!(interface, "lo-test");
                assert_eq!(source.kind(), io::ErrorKind::NotFound);
            }
            other => panic!("expected TransportOpen, got {other:?}"),
        }
    }

    #[test]
    fn inert_handle_accepts_then_abandons() {
        let config = DispatcherConfig {
            on_open_failure: OpenFailurePolicy::Inert,
            ..quick_config()
        };
        let dispatcher = Dispatcher::with_connector(
            config,
            Callbacks::new(),
            |_: &LinkParams| -> io::Result<LoopbackTransport> {
                Err(io::Error::from(io::ErrorKind::PermissionDenied))
            },
        )
        .unwrap();

        assert!(dispatcher.is_inert());
        assert_eq!(dispatcher.worker_state(), WorkerState::Stopped);
        dispatcher.send_adp(&Adpdu::discover(EntityId::WILDCARD)).unwrap();
        dispatcher.send_adp(&Adpdu::discover(EntityId::WILDCARD)).unwrap();

        let report = dispatcher.shutdown().unwrap();
        assert_eq!(report.abandoned, 2);
        assert_eq!(report.stats, WorkerStats::default());
    }

    #[test]
    fn senders_fail_after_shutdown() {
        let (transport, _peer) = LoopbackTransport::pair(LOCAL);
        let dispatcher =
            Dispatcher::with_connector(quick_config(), Callbacks::new(), transport).unwrap();
        let sender = dispatcher.sender();
        dispatcher.shutdown().unwrap();

        let frame = Adpdu::discover(EntityId::WILDCARD).form_message();
        assert!(sender.is_closed());
        match sender.send(frame.clone()) {
            Err(SendError::Closed(returned)) => assert_eq!(returned, frame),
            other => panic!("expected Closed, got {other:?}"),
        }
    }

    #[test]
    fn drop_stops_worker() {
        let (transport, peer) = LoopbackTransport::pair(LOCAL);
        let dispatcher =
            Dispatcher::with_connector(quick_config(), Callbacks::new(), transport).unwrap();
        drop(dispatcher);
        assert!(peer.is_closed());
    }

    #[test]
    fn flush_transmits_pending_frames() {
        let (transport, peer) = LoopbackTransport::pair(LOCAL);
        let config = DispatcherConfig {
            // Keep the worker slow so frames pile up behind it.
            idle_sleep: Duration::from_millis(5),
            ..quick_config()
        };
        let dispatcher = Dispatcher::with_connector(config, Callbacks::new(), transport).unwrap();

        for _ in 0..5 {
            dispatcher.send_adp(&Adpdu::discover(EntityId::WILDCARD)).unwrap();
        }
        let report = dispatcher.shutdown_after_pending().unwrap();

        assert_eq!(report.abandoned, 0);
        assert_eq!(report.stats.transmitted, 5);
        assert_eq!(peer.transmitted().len(), 5);
    }
}
