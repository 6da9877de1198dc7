//! Messages carried from caller threads to the dispatch worker.
//!
//! The queue between handle and worker carries exactly these values.
//! Shutdown travels through the same queue as frames, so it is observed
//! only after every frame pushed before it.

use std::sync::Arc;

use crate::net::OutboundFrame;
use crate::sync::queue::BlockingQueue;

/// One unit of work for the dispatch worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Transmit this frame. The worker stamps the source address.
    Frame(OutboundFrame),
    /// Stop the worker loop.
    Shutdown,
}

impl OutboundMessage {
    #[inline]
    #[must_use]
    pub const fn is_shutdown(&self) -> bool {
        matches!(self, Self::Shutdown)
    }
}

impl From<OutboundFrame> for OutboundMessage {
    fn from(frame: OutboundFrame) -> Self {
        Self::Frame(frame)
    }
}

/// Queue shared between the handle (producers) and the worker (consumer).
pub type OutboundQueue = Arc<BlockingQueue<OutboundMessage>>;

/// Counts the frames among `messages`, ignoring shutdown markers.
pub(crate) fn count_frames(messages: &[OutboundMessage]) -> usize {
    messages.iter().filter(|m| !m.is_shutdown()).count()
}
