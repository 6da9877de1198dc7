//! IEEE 1722.1 (ATDECC) link-layer dispatcher.
//!
//! One worker thread per [`Dispatcher`] owns a raw Ethernet transport,
//! transmits frames queued from any thread and routes inbound ADP, ACMP and
//! AECP (AEM) frames to per-protocol [`Callbacks`] after address and
//! identity filtering.
//!
//! - [`net`]: addresses, frames, the [`Transport`](net::Transport) seam, the
//!   Linux raw socket and an in-process loopback.
//! - [`pdu`]: big-endian codecs for the three control PDUs.
//! - [`runtime`]: the dispatcher, its worker and classifier.
//! - [`sync`]: the blocking handoff queue.

pub mod net;
pub mod pdu;
pub mod runtime;
pub mod sync;
pub mod trace;

pub use net::{EntityId, InboundFrame, MacAddress, OutboundFrame};
pub use pdu::{Pdu, Subprotocol};
pub use runtime::dispatcher::callbacks::{Callbacks, Delivery};
pub use runtime::dispatcher::classifier::{Classification, Classifier};
pub use runtime::dispatcher::commands::OutboundMessage;
pub use runtime::dispatcher::filter::{ConnectionFilterMode, IdentityFilterState};
pub use runtime::dispatcher::worker::{WorkerState, WorkerStats};
pub use runtime::dispatcher::{
    DispatchError, Dispatcher, DispatcherConfig, FrameSender, OpenFailurePolicy, SendError,
    ShutdownReport,
};
pub use trace::init_tracing;
