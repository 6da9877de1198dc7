//! End-to-end dispatcher tests over the in-process loopback link.
//!
//! Each test plays the rest of the segment through a [`LoopbackPeer`]:
//! it answers transmitted commands with responses, injects unsolicited
//! traffic and inspects what the worker put on the wire.
//!
//! # Running with tracing
//!
//! ```bash
//! RUST_LOG=atdecc=debug cargo test --features tracing --test dispatcher_loopback -- --nocapture
//! ```

use std::collections::HashMap;
use std::io;
use std::sync::Once;
use std::sync::mpsc::{self, TryRecvError};
use std::thread;
use std::time::Duration;

use atdecc::net::{AVTP_ETHERTYPE, LinkParams, LoopbackPeer, LoopbackTransport};
use atdecc::pdu::acmp::message_type as acmp_type;
use atdecc::pdu::adp::message_type as adp_type;
use atdecc::pdu::aecp::{MAX_COMMAND_PAYLOAD_LEN, command_type, message_type as aecp_type};
use atdecc::pdu::{Acmpdu, Adpdu, AecpAemPdu, PduError};
use atdecc::{
    Callbacks, ConnectionFilterMode, Delivery, DispatchError, Dispatcher, DispatcherConfig,
    EntityId, InboundFrame, MacAddress, OpenFailurePolicy, Pdu, SendError, Subprotocol,
    WorkerState,
};

static INIT_TRACING: Once = Once::new();

fn init_test_tracing() {
    INIT_TRACING.call_once(|| {
        atdecc::init_tracing();
    });
}

const LOCAL: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x01]);
const REMOTE: MacAddress = MacAddress::new([0x02, 0, 0, 0, 0, 0x02]);
const CONTROLLER: EntityId = EntityId::new(0x0001_0203_0405_0607);
const TALKER: EntityId = EntityId::new(0x0011_2233_4455_6677);
const LISTENER: EntityId = EntityId::new(0x0088_99AA_BBCC_DDEE);

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(2);

fn config() -> DispatcherConfig {
    DispatcherConfig {
        interface: "loop0".to_owned(),
        receive_wait: Duration::from_millis(1),
        ..DispatcherConfig::default()
    }
}

fn start(config: DispatcherConfig) -> (Dispatcher, LoopbackPeer, mpsc::Receiver<Delivery>) {
    init_test_tracing();
    let (transport, peer) = LoopbackTransport::pair(LOCAL);
    let (tx, rx) = mpsc::channel();
    let dispatcher = Dispatcher::with_connector(config, Callbacks::forward(tx), transport)
        .expect("loopback open never fails");
    (dispatcher, peer, rx)
}

fn inbound(destination: MacAddress, payload: Vec<u8>) -> InboundFrame {
    InboundFrame {
        destination,
        source: REMOTE,
        ethertype: AVTP_ETHERTYPE,
        payload,
    }
}

fn available(entity_id: EntityId) -> InboundFrame {
    let adp = Adpdu {
        message_type: adp_type::ENTITY_AVAILABLE,
        valid_time: 10,
        entity_id,
        available_index: 1,
        ..Adpdu::default()
    };
    let mut payload = Vec::new();
    adp.encode(&mut payload);
    inbound(MacAddress::ADP_ACMP_MULTICAST, payload)
}

fn decode_sent(frame: &InboundFrame) -> Option<Pdu> {
    Pdu::decode(&frame.payload).ok().flatten()
}

#[test]
fn wildcard_discover_delivers_each_answer_once() {
    let (dispatcher, peer, rx) = start(config());
    let entity = EntityId::new(0x7A7A_0000_0000_0001);
    peer.respond_with(move |sent| match decode_sent(sent) {
        Some(Pdu::Adp(adp)) if adp.is_discover() => vec![available(entity)],
        _ => Vec::new(),
    });

    dispatcher
        .send_adp(&Adpdu::discover(EntityId::WILDCARD))
        .unwrap();

    let delivery = rx.recv_timeout(DELIVERY_TIMEOUT).unwrap();
    assert_eq!(delivery.subprotocol, Subprotocol::Discovery);
    assert_eq!(delivery.frame.source, REMOTE);
    match delivery.pdu {
        Pdu::Adp(adp) => {
            assert_eq!(adp.entity_id, entity);
            assert_eq!(adp.message_type, adp_type::ENTITY_AVAILABLE);
        }
        other => panic!("expected ADP, got {other}"),
    }

    let sent = peer.transmitted();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].source, LOCAL);
    assert_eq!(sent[0].destination, MacAddress::ADP_ACMP_MULTICAST);
    assert_eq!(sent[0].ethertype, AVTP_ETHERTYPE);

    let report = dispatcher.shutdown().unwrap();
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.stats.transmitted, 1);
    assert_eq!(report.stats.dispatched, 1);

    // Callbacks are dropped with the worker.
    peer.inject(available(entity));
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    assert!(peer.is_closed());
}

#[test]
fn inbound_backlog_drains_without_outbound_traffic() {
    const BACKLOG: u64 = 500;

    // Default pacing: the worker waits on the outbound queue when idle.
    let (dispatcher, peer, rx) = start(DispatcherConfig {
        interface: "loop0".to_owned(),
        ..DispatcherConfig::default()
    });
    for entity in 1..=BACKLOG {
        peer.inject(available(EntityId::new(entity)));
    }

    let start = minstant::Instant::now();
    for entity in 1..=BACKLOG {
        let delivery = rx.recv_timeout(DELIVERY_TIMEOUT).unwrap();
        match delivery.pdu {
            Pdu::Adp(adp) => assert_eq!(adp.entity_id, EntityId::new(entity)),
            other => panic!("expected ADP, got {other}"),
        }
    }
    let elapsed = start.elapsed();
    assert!(
        elapsed < Duration::from_millis(200),
        "{BACKLOG} frames took {elapsed:?}"
    );

    let report = dispatcher.shutdown().unwrap();
    assert_eq!(report.stats.dispatched, BACKLOG);
}

#[test]
fn targeted_discover_filters_other_entities() {
    let (dispatcher, peer, rx) = start(config());
    let wanted = EntityId::new(0xAAAA);
    let other = EntityId::new(0xBBBB);
    // The foreign answer comes first so it is classified before the wanted one.
    peer.respond_with(move |_| vec![available(other), available(wanted)]);

    dispatcher.send_adp(&Adpdu::discover(wanted)).unwrap();

    let delivery = rx.recv_timeout(DELIVERY_TIMEOUT).unwrap();
    match delivery.pdu {
        Pdu::Adp(adp) => assert_eq!(adp.entity_id, wanted),
        other => panic!("expected ADP, got {other}"),
    }

    let report = dispatcher.shutdown().unwrap();
    assert_eq!(report.stats.dispatched, 1);
    assert_eq!(report.stats.filtered, 1);
    assert!(rx.try_recv().is_err());
}

#[test]
fn strict_connection_filter_matches_last_command() {
    let (dispatcher, peer, rx) = start(DispatcherConfig {
        connection_filter: ConnectionFilterMode::Strict,
        ..config()
    });
    let command = Acmpdu {
        message_type: acmp_type::CONNECT_RX_COMMAND,
        controller_entity_id: CONTROLLER,
        talker_entity_id: TALKER,
        listener_entity_id: LISTENER,
        listener_unique_id: 3,
        sequence_id: 7,
        ..Acmpdu::default()
    };
    peer.respond_with(move |sent| {
        let Some(Pdu::Acmp(command)) = decode_sent(sent) else {
            return Vec::new();
        };
        let respond = |sequence_id| {
            let mut payload = Vec::new();
            Acmpdu {
                message_type: acmp_type::CONNECT_RX_RESPONSE,
                sequence_id,
                ..command.clone()
            }
            .encode(&mut payload);
            inbound(MacAddress::ADP_ACMP_MULTICAST, payload)
        };
        vec![respond(command.sequence_id + 1), respond(command.sequence_id)]
    });

    dispatcher.send_acmp(&command).unwrap();

    let delivery = rx.recv_timeout(DELIVERY_TIMEOUT).unwrap();
    assert_eq!(delivery.subprotocol, Subprotocol::ConnectionManagement);
    match delivery.pdu {
        Pdu::Acmp(response) => {
            assert!(response.is_response());
            assert_eq!(response.sequence_id, 7);
            assert_eq!(response.listener_entity_id, LISTENER);
        }
        other => panic!("expected ACMP, got {other}"),
    }

    let report = dispatcher.shutdown().unwrap();
    assert_eq!(report.stats.filtered, 1);
    assert_eq!(report.stats.dispatched, 1);
}

#[test]
fn aem_response_must_be_addressed_to_us() {
    let (dispatcher, peer, rx) = start(config());
    // configuration 0, ENTITY descriptor 0
    let descriptor = vec![0; 8];
    let read = command_type::READ_DESCRIPTOR;
    let command = AecpAemPdu::command(CONTROLLER, TALKER, 42, read, descriptor);
    peer.respond_with(move |sent| {
        let Some(Pdu::Aecp(command)) = decode_sent(sent) else {
            return Vec::new();
        };
        let mut payload = Vec::new();
        AecpAemPdu {
            message_type: aecp_type::AEM_RESPONSE,
            payload: vec![0xDE, 0xAD],
            ..command
        }
        .encode(&mut payload)
        .unwrap();
        let elsewhere = MacAddress::new([0x02, 0, 0, 0, 0, 0x99]);
        vec![inbound(elsewhere, payload.clone()), inbound(LOCAL, payload)]
    });

    dispatcher.send_aecp(&command, REMOTE).unwrap();

    let delivery = rx.recv_timeout(DELIVERY_TIMEOUT).unwrap();
    assert_eq!(delivery.subprotocol, Subprotocol::Enumeration);
    assert_eq!(delivery.frame.destination, LOCAL);
    match delivery.pdu {
        Pdu::Aecp(response) => {
            assert_eq!(response.message_type, aecp_type::AEM_RESPONSE);
            assert_eq!(response.sequence_id, 42);
            assert_eq!(response.payload, vec![0xDE, 0xAD]);
        }
        other => panic!("expected AECP, got {other}"),
    }

    let sent = peer.transmitted();
    assert_eq!(sent[0].destination, REMOTE);

    let report = dispatcher.shutdown().unwrap();
    assert_eq!(report.stats.ignored, 1);
    assert_eq!(report.stats.dispatched, 1);
}

#[test]
fn oversized_aem_command_is_rejected_before_queueing() {
    let (dispatcher, _peer, _rx) = start(config());
    let command = AecpAemPdu::command(
        CONTROLLER,
        TALKER,
        1,
        command_type::READ_DESCRIPTOR,
        vec![0; MAX_COMMAND_PAYLOAD_LEN + 1],
    );

    match dispatcher.send_aecp(&command, REMOTE) {
        Err(SendError::Pdu(PduError::PayloadTooLarge { len, limit })) => {
            assert_eq!(len, MAX_COMMAND_PAYLOAD_LEN + 1);
            assert_eq!(limit, MAX_COMMAND_PAYLOAD_LEN);
        }
        other => panic!("expected PayloadTooLarge, got {other:?}"),
    }
    assert_eq!(dispatcher.pending(), 0);
    dispatcher.shutdown().unwrap();
}

#[test]
fn senders_on_many_threads_keep_their_own_order() {
    const THREADS: u64 = 4;
    const PER_THREAD: u16 = 50;

    let (dispatcher, peer, _rx) = start(config());

    let producers: Vec<_> = (1..=THREADS)
        .map(|t| {
            let sender = dispatcher.sender();
            thread::spawn(move || {
                for seq in 0..PER_THREAD {
                    let command = AecpAemPdu::command(
                        CONTROLLER,
                        EntityId::new(t),
                        seq,
                        command_type::ENTITY_AVAILABLE,
                        Vec::new(),
                    );
                    sender.send(command.form_message(REMOTE).unwrap()).unwrap();
                }
            })
        })
        .collect();
    for producer in producers {
        producer.join().unwrap();
    }

    let total = (THREADS as usize) * usize::from(PER_THREAD);
    assert!(peer.wait_for_transmitted(total, DELIVERY_TIMEOUT));

    let mut next: HashMap<EntityId, u16> = HashMap::new();
    for frame in peer.transmitted() {
        let aecp = AecpAemPdu::try_decode(&frame.payload).unwrap();
        let expected = next.entry(aecp.target_entity_id).or_insert(0);
        assert_eq!(
            aecp.sequence_id, *expected,
            "reordered within {}",
            aecp.target_entity_id
        );
        *expected += 1;
    }
    assert_eq!(next.len(), THREADS as usize);

    let report = dispatcher.shutdown().unwrap();
    assert_eq!(report.stats.transmitted, total as u64);
}

#[test]
fn transmit_failure_drops_frame_and_continues() {
    let (dispatcher, peer, _rx) = start(config());
    peer.fail_next_transmits(1);

    let first = Adpdu::discover(EntityId::new(1));
    let second = Adpdu::discover(EntityId::new(2));
    dispatcher.send_adp(&first).unwrap();
    dispatcher.send_adp(&second).unwrap();

    assert!(peer.wait_for_transmitted(1, DELIVERY_TIMEOUT));
    let report = dispatcher.shutdown_after_pending().unwrap();

    let sent = peer.transmitted();
    assert_eq!(sent.len(), 1);
    match decode_sent(&sent[0]) {
        Some(Pdu::Adp(adp)) => assert_eq!(adp.entity_id, EntityId::new(2)),
        other => panic!("expected the second discover, got {other:?}"),
    }
    assert_eq!(report.stats.transmit_errors, 1);
    assert_eq!(report.stats.transmitted, 1);
}

#[test]
fn raw_socket_on_missing_interface_fails_to_open() {
    init_test_tracing();
    let result = Dispatcher::create(
        DispatcherConfig::for_interface("atdecc-none0"),
        Callbacks::new(),
    );
    match result {
        Err(DispatchError::TransportOpen { interface, .. }) => {
            assert_eq!(interface, "atdecc-none0");
        }
        other => panic!("expected TransportOpen, got {other:?}"),
    }
}

#[test]
fn inert_dispatcher_never_calls_back() {
    init_test_tracing();
    let (tx, rx) = mpsc::channel();
    let dispatcher = Dispatcher::with_connector(
        DispatcherConfig {
            on_open_failure: OpenFailurePolicy::Inert,
            ..config()
        },
        Callbacks::forward(tx),
        |_: &LinkParams| -> io::Result<LoopbackTransport> {
            Err(io::Error::from(io::ErrorKind::PermissionDenied))
        },
    )
    .unwrap();

    assert!(dispatcher.is_inert());
    assert_eq!(dispatcher.local_address(), None);
    dispatcher
        .send_adp(&Adpdu::discover(EntityId::WILDCARD))
        .unwrap();
    assert_eq!(dispatcher.pending(), 1);

    let report = dispatcher.shutdown().unwrap();
    assert_eq!(report.abandoned, 1);
    assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
}

#[test]
fn panicking_callback_closes_handle() {
    init_test_tracing();
    let (transport, peer) = LoopbackTransport::pair(LOCAL);
    let callbacks = Callbacks::new().on_discovery(|_, _| panic!("callback failed"));
    let dispatcher = Dispatcher::with_connector(config(), callbacks, transport).unwrap();
    assert_eq!(dispatcher.worker_state(), WorkerState::Running);

    let sender = dispatcher.sender();
    peer.inject(available(TALKER));
    let deadline = minstant::Instant::now() + DELIVERY_TIMEOUT;
    while !sender.is_closed() {
        assert!(minstant::Instant::now() < deadline, "worker did not unwind");
        thread::sleep(Duration::from_millis(1));
    }

    assert!(peer.is_closed());
    assert_eq!(dispatcher.worker_state(), WorkerState::Stopped);
    let frame = Adpdu::discover(EntityId::WILDCARD).form_message();
    assert!(matches!(sender.send(frame), Err(SendError::Closed(_))));
    assert!(matches!(
        dispatcher.shutdown(),
        Err(DispatchError::WorkerPanicked)
    ));
}
