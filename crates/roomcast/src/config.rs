//! Configuration types for the mesh client

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

/// Main configuration for [`RoomClient`](crate::RoomClient)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomcastConfig {
    /// Socket.IO endpoint (http(s):// or ws(s)://)
    pub signaling_url: String,

    /// Engine.IO protocol revision spoken by the server
    pub engine_io: EngineIoVersion,

    /// Extra query parameters sent with the handshake
    pub query: BTreeMap<String, String>,

    /// Display name used for chat and the presence announcement
    pub username: String,

    /// STUN server URLs (at least two, for NAT traversal redundancy)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// Pre-encoded IVF video relayed to every peer
    pub media_path: PathBuf,

    /// How local ICE candidates reach the remote side
    pub ice_delivery: IceDelivery,

    /// Seconds a session may spend negotiating before it is evicted
    pub negotiation_timeout_secs: u64,

    /// Seconds between status reports (0 disables)
    pub status_interval_secs: u64,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// ICE candidate delivery discipline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IceDelivery {
    /// Send the description at once and each candidate as it is discovered
    Trickle,
    /// Hold the description until gathering completes; no candidate events
    Bundled,
}

/// Engine.IO protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineIoVersion {
    /// Socket.IO 2.x servers: client pings, implicit namespace connect
    V3,
    /// Socket.IO 3.x/4.x servers: server pings, explicit namespace connect
    V4,
}

impl EngineIoVersion {
    /// Value of the `EIO` query parameter
    pub fn as_query_value(&self) -> &'static str {
        match self {
            EngineIoVersion::V3 => "3",
            EngineIoVersion::V4 => "4",
        }
    }
}

impl Default for RoomcastConfig {
    fn default() -> Self {
        Self {
            signaling_url: "https://topaz.h91.co/socket.io/".to_string(),
            engine_io: EngineIoVersion::V4,
            query: BTreeMap::new(),
            username: "roomcast".to_string(),
            stun_servers: vec![
                "stun:stun.services.mozilla.com".to_string(),
                "stun:stun.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            media_path: PathBuf::from("output.ivf"),
            ice_delivery: IceDelivery::Trickle,
            negotiation_timeout_secs: 30,
            status_interval_secs: 5,
        }
    }
}

impl RoomcastConfig {
    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - fewer than two STUN servers are configured
    /// - a STUN/TURN URL has the wrong scheme
    /// - `negotiation_timeout_secs` is zero
    /// - `username` is empty
    /// - `signaling_url` cannot be turned into a WebSocket URL
    pub fn validate(&self) -> Result<()> {
        if self.stun_servers.len() < 2 {
            return Err(Error::InvalidConfig(format!(
                "At least two STUN servers are required, got {}",
                self.stun_servers.len()
            )));
        }

        if let Some(bad) = self.stun_servers.iter().find(|s| !s.starts_with("stun:")) {
            return Err(Error::InvalidConfig(format!(
                "STUN server must start with stun:, got {}",
                bad
            )));
        }

        if let Some(bad) = self
            .turn_servers
            .iter()
            .find(|t| !t.url.starts_with("turn:") && !t.url.starts_with("turns:"))
        {
            return Err(Error::InvalidConfig(format!(
                "TURN server must start with turn: or turns:, got {}",
                bad.url
            )));
        }

        if self.negotiation_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "negotiation_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.username.trim().is_empty() {
            return Err(Error::InvalidConfig("username must not be empty".to_string()));
        }

        self.websocket_url()?;

        Ok(())
    }

    /// Negotiation deadline as a [`Duration`]
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    /// Status report period, `None` when disabled
    pub fn status_interval(&self) -> Option<Duration> {
        (self.status_interval_secs > 0).then(|| Duration::from_secs(self.status_interval_secs))
    }

    /// Build the Engine.IO WebSocket URL from `signaling_url`
    ///
    /// `https://host/` becomes `wss://host/socket.io/?EIO=4&transport=websocket`,
    /// followed by any extra `query` pairs.
    pub fn websocket_url(&self) -> Result<Url> {
        let mut url = Url::parse(&self.signaling_url).map_err(|e| {
            Error::InvalidConfig(format!(
                "signaling_url is not a valid URL ({}): {}",
                self.signaling_url, e
            ))
        })?;

        let scheme = match url.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => {
                return Err(Error::InvalidConfig(format!(
                    "signaling_url must use http(s) or ws(s), got {}",
                    other
                )))
            }
        };
        url.set_scheme(scheme)
            .map_err(|_| Error::InvalidConfig(format!("cannot use scheme {}", scheme)))?;

        if url.path().is_empty() || url.path() == "/" {
            url.set_path("/socket.io/");
        }

        url.query_pairs_mut()
            .append_pair("EIO", self.engine_io.as_query_value())
            .append_pair("transport", "websocket");
        for (key, value) in &self.query {
            url.query_pairs_mut().append_pair(key, value);
        }

        Ok(url)
    }

    /// Add TURN servers to this configuration
    pub fn with_turn_servers(mut self, turn_servers: Vec<TurnServerConfig>) -> Self {
        self.turn_servers = turn_servers;
        self
    }

    /// Set the media file
    pub fn with_media_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.media_path = path.into();
        self
    }

    /// Set the ICE delivery discipline
    pub fn with_ice_delivery(mut self, ice_delivery: IceDelivery) -> Self {
        self.ice_delivery = ice_delivery;
        self
    }
}
