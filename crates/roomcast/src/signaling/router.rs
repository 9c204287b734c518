//! Dispatch between the signaling channel and peer sessions

use super::protocol::{events, ChatMessage, InboundEvent, MediaKind, MediaStatus, SignalMessage};
use super::{ChannelEvent, SignalingChannel};
use crate::peer::{PeerRegistry, Role, SessionEvent};
use crate::Result;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Routes room events to the [`PeerRegistry`] and session output back to the room
///
/// Inbound, every event is applied through the registry: rosters create Caller
/// sessions and trigger their offer, unsolicited signals create Callee
/// sessions, departures evict. Outbound, [`SessionEvent::Signal`]s are encoded
/// and emitted as `signal` events addressed to the peer.
pub struct SignalingRouter {
    registry: Arc<PeerRegistry>,
    channel: Arc<dyn SignalingChannel>,
}

impl SignalingRouter {
    pub fn new(registry: Arc<PeerRegistry>, channel: Arc<dyn SignalingChannel>) -> Self {
        Self { registry, channel }
    }

    /// Registry the router drives
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Parse and dispatch a raw channel event; bad events are logged and dropped
    pub fn handle_channel_event(&self, event: &ChannelEvent) {
        match InboundEvent::parse(&event.name, &event.args) {
            Ok(Some(inbound)) => self.dispatch(inbound),
            Ok(None) => debug!("Ignoring signaling event '{}'", event.name),
            Err(e) => warn!("Dropping signaling event '{}': {}", event.name, e),
        }
    }

    /// Apply one typed inbound event
    pub fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::Connected => info!(local_id = %self.registry.local_id(), "Signaling connected"),
            InboundEvent::Disconnected { reason } => warn!("Signaling disconnected: {}", reason),
            InboundEvent::Error { detail } => warn!("Signaling error: {}", detail),
            InboundEvent::Chat { from, body } => self.on_chat(&from, &body),
            InboundEvent::UserJoined { id, count, peers } => self.on_roster(&id, count, &peers),
            InboundEvent::UserLeft { id } => self.on_peer_left(&id),
            InboundEvent::MediaStatusChanged { kind, status } => {
                self.on_media_status(kind, &status)
            }
            InboundEvent::Signal { from, payload } => self.on_signal(&from, &payload),
        }
    }

    /// Roster announcement: open a Caller session to every unknown peer
    pub fn on_roster(&self, joined: &str, count: Option<u64>, peers: &[String]) {
        info!(
            joined = %joined,
            count = count.unwrap_or(peers.len() as u64),
            "Roster update: {:?}",
            peers
        );

        for peer in peers {
            if peer == self.registry.local_id() {
                continue;
            }

            let (session, created) = self.registry.get_or_create(peer, Role::Caller);
            if created {
                session.initiate_offer();
            } else {
                debug!(peer_id = %peer, "Already tracking peer ({})", session.state());
            }
        }
    }

    /// Participant left: evict and close its session
    pub fn on_peer_left(&self, id: &str) {
        match self.registry.remove(id) {
            Some(session) => {
                info!(peer_id = %id, "Peer left ({})", session.state());
                session.close();
            }
            None => debug!(peer_id = %id, "Unknown peer left"),
        }
    }

    /// Negotiation payload: decode, then apply to the sender's session
    pub fn on_signal(&self, from: &str, payload: &Value) {
        if from == self.registry.local_id() {
            debug!("Ignoring signal from ourselves");
            return;
        }

        // Decode before touching the registry so garbage never creates a session
        let messages = match SignalMessage::decode(payload) {
            Ok(messages) => messages,
            Err(e) => {
                warn!(peer_id = %from, "Dropping signal: {}", e);
                return;
            }
        };
        if messages.is_empty() {
            return;
        }

        let (session, created) = self.registry.get_or_create(from, Role::Callee);
        if created {
            debug!(peer_id = %from, "Signal from unknown peer, answering");
        }

        for message in messages {
            session.apply(message);
        }
    }

    /// Mute/unmute notification; observed only
    pub fn on_media_status(&self, kind: MediaKind, status: &MediaStatus) {
        let state = if status.status { "enabled" } else { "disabled" };
        match kind {
            MediaKind::Video => info!(peer_id = %status.id, "Video {}", state),
            MediaKind::Sound => info!(peer_id = %status.id, "Sound {}", state),
        }
    }

    /// Chat line from a participant
    pub fn on_chat(&self, from: &str, body: &ChatMessage) {
        info!("{} ({}): {}", body.username, from, body.message);
    }

    /// Emit `message` to the room
    pub fn send_chat(&self, username: &str, message: &str) -> Result<()> {
        let body = ChatMessage {
            username: username.to_string(),
            message: message.to_string(),
        };
        self.channel
            .emit(events::MESSAGE, vec![serde_json::to_value(body)?])
    }

    /// Emit `signal` to `peer_id`
    pub fn send_signal(&self, peer_id: &str, message: &SignalMessage) -> Result<()> {
        let payload = message.to_payload()?;
        debug!(peer_id = %peer_id, "Sending signal: {}", payload);
        self.channel.emit(
            events::SIGNAL,
            vec![Value::String(peer_id.to_string()), Value::String(payload)],
        )
    }

    /// React to one session event
    pub fn handle_session_event(&self, event: SessionEvent) {
        match event {
            SessionEvent::Signal { peer_id, message } => {
                if let Err(e) = self.send_signal(&peer_id, &message) {
                    warn!(peer_id = %peer_id, "Failed to send signal: {}", e);
                }
            }
            SessionEvent::Connected { peer_id, generation } => {
                info!(peer_id = %peer_id, generation, "Peer connected");
            }
            SessionEvent::Error { peer_id, error } => {
                warn!(peer_id = %peer_id, "Negotiation error: {}", error);
            }
            SessionEvent::Closed {
                peer_id,
                generation,
                reason,
            } => {
                if self.registry.remove_generation(&peer_id, generation).is_some() {
                    info!(peer_id = %peer_id, "Session evicted: {}", reason);
                }
            }
        }
    }

    /// Pump session events until every sender is gone
    pub fn spawn_outbound(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                self.handle_session_event(event);
            }
            debug!("Session event pump stopped");
        })
    }
}
