//! Peer sessions and the registry that owns them
//!
//! Each remote participant gets one [`PeerSession`]: a cheap handle in front
//! of a driver task that owns the transport and runs the offer/answer/ICE
//! state machine. Commands reach the driver over an ordered channel, so
//! operations for one peer never interleave.

mod registry;
mod session;

pub use registry::PeerRegistry;
pub use session::{
    NegotiationPhase, NegotiationState, PeerSession, Role, SessionContext, SessionEvent,
    SessionSnapshot,
};
