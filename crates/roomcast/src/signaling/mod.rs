//! Room signaling
//!
//! Protocol types, the [`SignalingChannel`] seam, the Socket.IO client that
//! implements it, and the [`SignalingRouter`] that turns room events into
//! session operations.

pub mod protocol;
pub mod router;
pub mod socketio;

pub use protocol::{
    ChatMessage, IceCandidate, InboundEvent, MediaKind, MediaStatus, SdpType, SessionDescription,
    SignalMessage,
};
pub use router::SignalingRouter;
pub use socketio::SocketIoClient;

use crate::Result;
use serde_json::Value;

/// A named event with its arguments, as delivered by the signaling channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub name: String,
    pub args: Vec<Value>,
}

impl ChannelEvent {
    pub fn new(name: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            name: name.into(),
            args,
        }
    }
}

/// Outbound half of the signaling channel
pub trait SignalingChannel: Send + Sync {
    /// Emit `event` with `args`; never blocks
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<()>;

    /// Stop the channel
    fn close(&self) {}
}
