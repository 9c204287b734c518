//! Room bootstrap
//!
//! [`RoomClient`] connects the signaling channel, builds the registry and
//! router around it, announces itself and then pumps room events until the
//! channel goes away.

use crate::config::RoomcastConfig;
use crate::media::MediaSource;
use crate::peer::{PeerRegistry, SessionContext};
use crate::signaling::protocol::events;
use crate::signaling::{ChannelEvent, SignalingChannel, SignalingRouter, SocketIoClient};
use crate::transport::{TransportFactory, WebRtcTransportFactory};
use crate::{Error, Result};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Chat line announcing our presence
const PRESENCE_MESSAGE: &str = "JOINED";

/// A joined room
pub struct RoomClient {
    config: RoomcastConfig,
    local_id: String,
    channel: Arc<dyn SignalingChannel>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    registry: Arc<PeerRegistry>,
    router: Arc<SignalingRouter>,
    tasks: Vec<JoinHandle<()>>,
    connected: bool,
}

impl RoomClient {
    /// Connect to the room server and join
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration or when the signaling server cannot be
    /// reached; neither is retried.
    pub async fn connect(config: RoomcastConfig, media: Option<Arc<MediaSource>>) -> Result<Self> {
        config.validate()?;

        let (socket, inbound) = SocketIoClient::connect(&config).await?;
        let local_id = socket.sid().to_string();
        let transports = Arc::new(WebRtcTransportFactory::new(&config));

        Self::from_parts(config, local_id, Arc::new(socket), inbound, transports, media)
    }

    /// Assemble a client around an already connected channel
    pub fn from_parts(
        config: RoomcastConfig,
        local_id: String,
        channel: Arc<dyn SignalingChannel>,
        inbound: mpsc::UnboundedReceiver<ChannelEvent>,
        transports: Arc<dyn TransportFactory>,
        media: Option<Arc<MediaSource>>,
    ) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registry = Arc::new(PeerRegistry::new(SessionContext {
            local_id: local_id.clone(),
            transports,
            media,
            ice_delivery: config.ice_delivery,
            negotiation_timeout: config.negotiation_timeout(),
            events: events_tx,
        }));
        let router = Arc::new(SignalingRouter::new(
            Arc::clone(&registry),
            Arc::clone(&channel),
        ));

        let mut tasks = vec![Arc::clone(&router).spawn_outbound(events_rx)];
        if let Some(interval) = config.status_interval() {
            tasks.push(spawn_status_reporter(
                local_id.clone(),
                Arc::clone(&registry),
                interval,
            ));
        }

        info!(local_id = %local_id, username = %config.username, "Joined room");
        router.send_chat(&config.username, PRESENCE_MESSAGE)?;

        Ok(Self {
            config,
            local_id,
            channel,
            inbound,
            registry,
            router,
            tasks,
            connected: true,
        })
    }

    /// Our peer id in the room
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    /// Live sessions
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// Event router
    pub fn router(&self) -> &Arc<SignalingRouter> {
        &self.router
    }

    /// Whether the signaling channel is still up
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Send a chat line to the room under the configured username
    pub fn send_chat(&self, line: &str) -> Result<()> {
        self.router.send_chat(&self.config.username, line)
    }

    /// Dispatch room events until the signaling channel disconnects
    ///
    /// # Errors
    ///
    /// Always ends with [`Error::SignalingError`] describing why the channel
    /// went away.
    pub async fn run(&mut self) -> Result<()> {
        while let Some(event) = self.inbound.recv().await {
            let disconnected = event.name == events::DISCONNECT;
            self.router.handle_channel_event(&event);

            if disconnected {
                self.connected = false;
                let reason = event
                    .args
                    .first()
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                return Err(Error::SignalingError(format!(
                    "Signaling channel disconnected: {}",
                    reason
                )));
            }
        }

        self.connected = false;
        Err(Error::SignalingError(
            "Signaling channel closed".to_string(),
        ))
    }

    /// Close every session, then the signaling channel
    pub async fn shutdown(mut self) {
        info!("Shutting down");
        self.registry.clear().await;

        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.channel.close();
        self.connected = false;
        debug!("Shutdown complete");
    }
}

impl Drop for RoomClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Log our id and every session's role and state on a fixed interval
fn spawn_status_reporter(
    local_id: String,
    registry: Arc<PeerRegistry>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let sessions = registry.snapshot();
            info!(local_id = %local_id, peers = sessions.len(), "Status");
            for (peer_id, snapshot) in sessions {
                info!(
                    peer_id = %peer_id,
                    role = ?snapshot.role,
                    state = %snapshot.state,
                    "Session status"
                );
            }
        }
    })
}
