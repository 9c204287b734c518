//! Peer connection transport
//!
//! A [`PeerTransport`] is the opaque connection object a session drives
//! through offer/answer/candidate exchange. Connectivity and gathering
//! progress come back as [`TransportEvent`]s on the channel handed to
//! [`TransportFactory::create`].

mod rtc;

pub use self::rtc::{WebRtcTransport, WebRtcTransportFactory};

use crate::signaling::protocol::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

/// Connectivity state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// No connectivity checks yet
    New,
    /// Connectivity checks in progress
    Checking,
    /// A working candidate pair was found
    Connected,
    /// Connectivity lost, may recover
    Disconnected,
    /// Connectivity checks failed for good
    Failed,
    /// Transport shut down
    Closed,
}

impl TransportState {
    /// Whether the transport can carry media
    pub fn is_connected(&self) -> bool {
        matches!(self, TransportState::Connected)
    }

    /// Whether the transport will never recover
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

/// Event emitted by a transport
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A local ICE candidate was discovered
    LocalCandidate(IceCandidate),
    /// Local candidate gathering finished
    GatheringComplete,
    /// Connectivity state changed
    StateChanged(TransportState),
}

/// Sender half handed to a transport for its events
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

/// One peer connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Attach an outbound media track
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()>;

    /// Create an offer (not yet applied)
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer to the applied remote offer (not yet applied)
    async fn create_answer(&self) -> Result<SessionDescription>;

    /// Apply a local description; starts candidate gathering
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply the remote description
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    /// Apply a remote candidate; only valid once a remote description is set
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Current local description, including gathered candidates
    async fn local_description(&self) -> Option<SessionDescription>;

    /// Release the connection and its background readers
    async fn close(&self) -> Result<()>;
}

/// Creates transports for new sessions
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a transport for `peer_id`, reporting its events on `events`
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}
