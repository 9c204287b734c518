//! WebRTC mesh client for signaling-driven rooms
//!
//! Joins a room over a Socket.IO signaling channel, opens one peer connection
//! to every other participant and relays a single pre-encoded video file to
//! all of them.
//!
//! # Features
//!
//! - **Mesh topology**: one independently negotiated session per participant
//! - **Atomic peer registry**: at most one session per peer id, ever
//! - **Offer/answer state machine**: candidate queueing, glare resolution,
//!   negotiation timeout
//! - **Shared media**: one paced IVF producer fanned out to every session
//! - **Socket.IO signaling**: Engine.IO v3/v4 over WebSocket
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │  Room server (Socket.IO)                               │
//! │  ↓ user-joined / user-left / signal / message          │
//! │  RoomClient                                            │
//! │  ├─ SocketIoClient (SignalingChannel)                  │
//! │  └─ SignalingRouter                                    │
//! │     └─ PeerRegistry                                    │
//! │        └─ PeerSession ×N (driver task per peer)        │
//! │           └─ PeerTransport (webrtc-rs)                 │
//! │              ↑ shared track                            │
//! │  MediaSource (IVF, paced by timebase)                  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use roomcast::{IceDelivery, RoomcastConfig};
//!
//! let config = RoomcastConfig::default().with_ice_delivery(IceDelivery::Bundled);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.stun_servers.len(), 2);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use roomcast::{media, RoomClient, RoomcastConfig};
//! use std::sync::Arc;
//!
//! # async fn example() -> roomcast::Result<()> {
//! let config = RoomcastConfig::default();
//! let source = Arc::new(media::open_ivf(&config.media_path)?);
//!
//! let mut client = RoomClient::connect(config, Some(source)).await?;
//! let result = client.run().await;
//! client.shutdown().await;
//! result
//! # }
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod peer;
pub mod signaling;
pub mod transport;

pub use client::RoomClient;
pub use config::{EngineIoVersion, IceDelivery, RoomcastConfig, TurnServerConfig};
pub use error::{Error, Result};
pub use media::{MediaSample, MediaSource, SourceState};
pub use peer::{NegotiationState, PeerRegistry, PeerSession, Role, SessionEvent};
pub use signaling::{SignalMessage, SignalingChannel, SignalingRouter};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
