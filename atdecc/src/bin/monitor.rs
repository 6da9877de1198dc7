//! ATDECC monitor.
//!
//! Opens a dispatcher on one interface, optionally sends an ADP discover,
//! and prints every ADP, ACMP and AECP delivery until the duration ends or
//! the process is interrupted.
//!
//! # Usage
//!
//! ```sh
//! atdecc-monitor --interface eth0 --discover all --duration 10
//! ```
//!
//! Needs `CAP_NET_RAW` (or root) to open the raw socket.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use minstant::Instant;

use atdecc::pdu::Adpdu;
use atdecc::{
    Callbacks, ConnectionFilterMode, DispatchError, Dispatcher, DispatcherConfig, EntityId,
    MacAddress, SendError, init_tracing,
};

/// Default interface.
const DEFAULT_INTERFACE: &str = "eth0";

/// How often the main thread wakes to check the deadline.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
enum MonitorError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Send(#[from] SendError),
}

struct Options {
    config: DispatcherConfig,
    discover: Option<EntityId>,
    duration: Option<Duration>,
}

fn main() {
    init_tracing();
    if let Err(e) = run() {
        eprintln!("atdecc-monitor: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), MonitorError> {
    let args: Vec<String> = std::env::args().collect();
    let options = parse_args(&args)?;

    eprintln!("atdecc-monitor: opening {}", options.config.interface);

    let (tx, rx) = mpsc::channel();
    let dispatcher = Dispatcher::create(options.config, Callbacks::forward(tx))?;

    if let Some(local) = dispatcher.local_address() {
        eprintln!("atdecc-monitor: listening as {local}");
    }

    if let Some(target) = options.discover {
        dispatcher.send_adp(&Adpdu::discover(target))?;
        eprintln!("atdecc-monitor: discover sent for {target}");
    }

    let deadline = options.duration.map(|d| Instant::now() + d);
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(delivery) => println!(
                "{:<4} {} -> {} {}",
                delivery.subprotocol.name().to_uppercase(),
                delivery.frame.source,
                delivery.frame.destination,
                delivery.pdu
            ),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let stats = dispatcher.shutdown()?.stats;
    eprintln!(
        "atdecc-monitor: stopped; received {} dispatched {} filtered {} ignored {}",
        stats.received, stats.dispatched, stats.filtered, stats.ignored
    );
    Ok(())
}

fn take_value<'a>(args: &'a [String], i: &mut usize, flag: &str) -> Result<&'a str, MonitorError> {
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .ok_or_else(|| MonitorError::Usage(format!("missing value for {flag}")))
}

fn parse_group(value: &str) -> Result<MacAddress, MonitorError> {
    let group: MacAddress = value.parse().map_err(|e| MonitorError::Usage(format!("{e}")))?;
    if !group.is_multicast() {
        return Err(MonitorError::Usage(format!("{group} is not a multicast address")));
    }
    Ok(group)
}

fn parse_entity(value: &str) -> Result<EntityId, MonitorError> {
    if value == "all" {
        return Ok(EntityId::WILDCARD);
    }
    let digits = value.trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map(EntityId::new)
        .map_err(|e| MonitorError::Usage(format!("invalid entity id {value:?}: {e}")))
}

/// Parses command line arguments into monitor options.
fn parse_args(args: &[String]) -> Result<Options, MonitorError> {
    let mut config = DispatcherConfig::for_interface(DEFAULT_INTERFACE);
    let mut discover = None;
    let mut duration = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--interface" | "-i" => {
                config.interface = take_value(args, &mut i, "--interface")?.to_owned();
            }
            "--discover" | "-d" => {
                discover = Some(parse_entity(take_value(args, &mut i, "--discover")?)?);
            }
            "--duration" | "-t" => {
                let value = take_value(args, &mut i, "--duration")?;
                let secs: u64 = value
                    .parse()
                    .map_err(|e| MonitorError::Usage(format!("invalid duration {value:?}: {e}")))?;
                duration = (secs > 0).then(|| Duration::from_secs(secs));
            }
            "--core" | "-c" => {
                let value = take_value(args, &mut i, "--core")?;
                config.cpu_core = Some(
                    value
                        .parse()
                        .map_err(|e| MonitorError::Usage(format!("invalid core {value:?}: {e}")))?,
                );
            }
            "--group" | "-g" => {
                config.group = parse_group(take_value(args, &mut i, "--group")?)?;
            }
            "--rcvbuf" => {
                let value = take_value(args, &mut i, "--rcvbuf")?;
                config.recv_buffer_size = Some(
                    value
                        .parse()
                        .map_err(|e| MonitorError::Usage(format!("invalid size {value:?}: {e}")))?,
                );
            }
            "--strict" => config.connection_filter = ConnectionFilterMode::Strict,
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            arg => return Err(MonitorError::Usage(format!("unknown argument: {arg}"))),
        }
        i += 1;
    }

    Ok(Options {
        config,
        discover,
        duration,
    })
}

fn print_usage() {
    eprintln!(
        r#"atdecc-monitor - print ATDECC traffic seen on an interface

USAGE:
    atdecc-monitor [OPTIONS]

OPTIONS:
    -i, --interface <NAME>   Network interface (default: eth0)
    -d, --discover <ID|all>  Send an ADP discover for an entity id (hex) or all
    -t, --duration <SECS>    Stop after this many seconds (default: run until killed)
    -c, --core <N>           Pin the dispatch worker to core N
    -g, --group <MAC>        Multicast group to join (default: 91:e0:f0:01:00:00)
        --rcvbuf <BYTES>     Kernel receive buffer size for the raw socket
        --strict             Filter ACMP responses against the last command sent
    -h, --help               Print this help message

ENVIRONMENT:
    RUST_LOG                 Log filter when built with --features tracing

EXAMPLE:
    atdecc-monitor -i eth0 -d all -t 10
"#
    );
}
