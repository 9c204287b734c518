//! Error types for the mesh client

/// Result type alias using the crate [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while joining a room and negotiating peers
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling channel error (handshake, emit, protocol)
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// WebSocket error underneath the signaling channel
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Peer not found in the registry
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Peer connection could not be created or closed
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// Offer/answer creation or description setting failed
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate could not be applied or serialized
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media track could not be attached
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Local media file could not be opened or decoded
    #[error("Media source error: {0}")]
    MediaSourceError(String),

    /// Invalid data format
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Remote answer arrived without a local offer
    #[error("Unexpected answer from {0}: no local offer was set")]
    UnexpectedAnswer(String),

    /// Session already closed
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    OperationTimeout(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::OperationTimeout(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::PeerConnectionError(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::UnexpectedAnswer(_)
        )
    }

    /// Whether a session hitting this error must close.
    ///
    /// Failed negotiation steps leave the connection in an ambiguous state.
    /// Protocol slips by the remote side (a stray answer, one bad candidate)
    /// are reported and the session carries on.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(
            self,
            Error::UnexpectedAnswer(_) | Error::IceCandidateError(_) | Error::InvalidData(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}
