//! Socket.IO client over WebSocket
//!
//! Speaks just enough Engine.IO (v3 and v4) and Socket.IO to join the default
//! namespace, keep the connection alive and exchange JSON events. Binary
//! packets and acknowledgements are not used by the room server.

use super::protocol::events;
use super::{ChannelEvent, SignalingChannel};
use crate::config::{EngineIoVersion, RoomcastConfig};
use crate::{Error, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine.IO open packet payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Engine.IO session id
    pub sid: String,

    /// Milliseconds between pings
    #[serde(default)]
    pub ping_interval: u64,

    /// Milliseconds before a missing ping/pong counts as a dead connection
    #[serde(default)]
    pub ping_timeout: u64,
}

/// One Engine.IO packet, with Socket.IO packets carried in `4` messages
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// `0{...}` session open
    Open(Handshake),
    /// `1` transport close
    Close,
    /// `2` ping with optional probe payload
    Ping(String),
    /// `3` pong echoing the ping payload
    Pong(String),
    /// `6` no-op
    Noop,
    /// `40` namespace connect, optionally with `{"sid": ..}`
    Connect(Option<Value>),
    /// `41` namespace disconnect
    Disconnect,
    /// `42[name, ...args]` event
    Event(ChannelEvent),
    /// `44{...}` namespace connect refused
    ConnectError(Value),
    /// Any other Socket.IO packet (acks, binary); kept raw
    Unsupported(String),
}

impl Packet {
    /// Decode a WebSocket text frame
    pub fn decode(text: &str) -> Result<Packet> {
        let kind = text
            .chars()
            .next()
            .ok_or_else(|| Error::InvalidData("empty Engine.IO packet".to_string()))?;
        let body = &text[kind.len_utf8()..];

        match kind {
            '0' => Ok(Packet::Open(serde_json::from_str(body)?)),
            '1' => Ok(Packet::Close),
            '2' => Ok(Packet::Ping(body.to_string())),
            '3' => Ok(Packet::Pong(body.to_string())),
            '4' => Self::decode_socket(body),
            '5' | '6' => Ok(Packet::Noop),
            other => Err(Error::InvalidData(format!(
                "unknown Engine.IO packet type '{}'",
                other
            ))),
        }
    }

    fn decode_socket(text: &str) -> Result<Packet> {
        let kind = text
            .chars()
            .next()
            .ok_or_else(|| Error::InvalidData("empty Socket.IO packet".to_string()))?;
        let body = strip_namespace(&text[kind.len_utf8()..]);

        match kind {
            '0' if body.is_empty() => Ok(Packet::Connect(None)),
            '0' => Ok(Packet::Connect(Some(serde_json::from_str(body)?))),
            '1' => Ok(Packet::Disconnect),
            '2' => {
                let payload = body.trim_start_matches(|c: char| c.is_ascii_digit());
                let mut items: Vec<Value> = serde_json::from_str(payload)?;
                if items.is_empty() {
                    return Err(Error::InvalidData("event packet without a name".to_string()));
                }
                let name = match items.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(Error::InvalidData(format!(
                            "event name is not a string: {}",
                            other
                        )))
                    }
                };
                Ok(Packet::Event(ChannelEvent::new(name, items)))
            }
            '4' if body.is_empty() => Ok(Packet::ConnectError(Value::Null)),
            '4' => Ok(Packet::ConnectError(
                serde_json::from_str(body).unwrap_or_else(|_| Value::String(body.to_string())),
            )),
            _ => Ok(Packet::Unsupported(text.to_string())),
        }
    }

    /// Encode as a WebSocket text frame
    pub fn encode(&self) -> String {
        match self {
            Packet::Open(handshake) => format!(
                "0{}",
                serde_json::to_value(handshake).unwrap_or(Value::Null)
            ),
            Packet::Close => "1".to_string(),
            Packet::Ping(payload) => format!("2{}", payload),
            Packet::Pong(payload) => format!("3{}", payload),
            Packet::Noop => "6".to_string(),
            Packet::Connect(None) => "40".to_string(),
            Packet::Connect(Some(payload)) => format!("40{}", payload),
            Packet::Disconnect => "41".to_string(),
            Packet::Event(event) => {
                let mut items = Vec::with_capacity(event.args.len() + 1);
                items.push(Value::String(event.name.clone()));
                items.extend(event.args.iter().cloned());
                format!("42{}", Value::Array(items))
            }
            Packet::ConnectError(detail) => format!("44{}", detail),
            Packet::Unsupported(raw) => format!("4{}", raw),
        }
    }
}

/// Drop a `/namespace,` prefix
fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(idx) => &body[idx + 1..],
            None => "",
        }
    } else {
        body
    }
}

/// Socket.IO connection to the room server
///
/// Inbound events arrive on the receiver returned by [`SocketIoClient::connect`],
/// starting with a `connect` event and ending with a `disconnect` event.
pub struct SocketIoClient {
    sid: String,
    tx: mpsc::UnboundedSender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketIoClient {
    /// Connect, complete the Engine.IO/Socket.IO handshake and start the I/O tasks
    pub async fn connect(
        config: &RoomcastConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let url = config.websocket_url()?;
        info!("Connecting to signaling server: {}", url);

        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to connect: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let (handshake, sid) = time::timeout(
            HANDSHAKE_TIMEOUT,
            Self::handshake(&mut write, &mut read, config.engine_io, &inbound_tx),
        )
        .await
        .map_err(|_| Error::OperationTimeout("Socket.IO handshake".to_string()))??;

        let (tx, rx) = mpsc::unbounded_channel();
        let mut tasks = vec![
            tokio::spawn(Self::sender_task(write, rx)),
            tokio::spawn(Self::receiver_task(read, tx.clone(), inbound_tx.clone())),
        ];

        // Engine.IO v3 clients drive the heartbeat
        if config.engine_io == EngineIoVersion::V3 && handshake.ping_interval > 0 {
            tasks.push(tokio::spawn(Self::ping_task(
                tx.clone(),
                Duration::from_millis(handshake.ping_interval),
            )));
        }

        info!(sid = %sid, "Connected to signaling server");
        let _ = inbound_tx.send(ChannelEvent::new(events::CONNECT, Vec::new()));

        Ok((
            Self {
                sid,
                tx,
                tasks: Mutex::new(tasks),
            },
            inbound_rx,
        ))
    }

    /// Our id as seen by the room server
    pub fn sid(&self) -> &str {
        &self.sid
    }

    async fn handshake(
        write: &mut WsSink,
        read: &mut WsSource,
        version: EngineIoVersion,
        inbound: &mpsc::UnboundedSender<ChannelEvent>,
    ) -> Result<(Handshake, String)> {
        let open = loop {
            match Self::next_packet(read).await? {
                Packet::Open(handshake) => break handshake,
                other => debug!("Ignoring packet before open: {:?}", other),
            }
        };
        debug!(
            "Engine.IO session {} (ping every {}ms)",
            open.sid, open.ping_interval
        );

        // v3 servers join the default namespace implicitly
        if version == EngineIoVersion::V4 {
            Self::send_packet(write, &Packet::Connect(None)).await?;
        }

        let sid = loop {
            match Self::next_packet(read).await? {
                Packet::Connect(payload) => {
                    break payload
                        .as_ref()
                        .and_then(|p| p.get("sid"))
                        .and_then(Value::as_str)
                        .map(str::to_string)
                        .unwrap_or_else(|| open.sid.clone());
                }
                Packet::ConnectError(detail) => {
                    return Err(Error::SignalingError(format!(
                        "Namespace connect refused: {}",
                        detail
                    )))
                }
                Packet::Ping(payload) => Self::send_packet(write, &Packet::Pong(payload)).await?,
                Packet::Event(event) => {
                    let _ = inbound.send(event);
                }
                Packet::Close | Packet::Disconnect => {
                    return Err(Error::SignalingError(
                        "Server closed the connection during handshake".to_string(),
                    ))
                }
                other => debug!("Ignoring packet during handshake: {:?}", other),
            }
        };

        Ok((open, sid))
    }

    async fn next_packet(read: &mut WsSource) -> Result<Packet> {
        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => return Packet::decode(&text),
                Some(Ok(Message::Close(_))) | None => {
                    return Err(Error::SignalingError(
                        "Connection closed during handshake".to_string(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(Error::WebSocketError(e.to_string())),
            }
        }
    }

    async fn send_packet(write: &mut WsSink, packet: &Packet) -> Result<()> {
        write
            .send(Message::Text(packet.encode()))
            .await
            .map_err(|e| Error::WebSocketError(format!("Failed to send packet: {}", e)))
    }

    /// Sender task: sends messages from channel to WebSocket
    async fn sender_task(mut write: WsSink, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
            if closing {
                break;
            }
        }

        debug!("Sender task terminated");
    }

    /// Receiver task: decodes packets, answers pings, forwards events
    async fn receiver_task(
        mut read: WsSource,
        tx: mpsc::UnboundedSender<Message>,
        inbound: mpsc::UnboundedSender<ChannelEvent>,
    ) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => match Packet::decode(&text) {
                    Ok(Packet::Ping(payload)) => {
                        let _ = tx.send(Message::Text(Packet::Pong(payload).encode()));
                    }
                    Ok(Packet::Event(event)) => {
                        if inbound.send(event).is_err() {
                            break "client dropped";
                        }
                    }
                    Ok(Packet::ConnectError(detail)) => {
                        let _ = inbound.send(ChannelEvent::new(events::ERROR, vec![detail]));
                    }
                    Ok(Packet::Disconnect) => break "io server disconnect",
                    Ok(Packet::Close) => break "transport close",
                    Ok(Packet::Unsupported(raw)) => debug!("Ignoring unsupported packet: {}", raw),
                    Ok(_) => {}
                    Err(e) => warn!("Failed to decode signaling packet: {}", e),
                },
                Some(Ok(Message::Close(_))) | None => break "transport close",
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("WebSocket error: {}", e);
                    break "transport error";
                }
            }
        };

        info!("Signaling connection ended: {}", reason);
        let _ = inbound.send(ChannelEvent::new(
            events::DISCONNECT,
            vec![Value::String(reason.to_string())],
        ));
        debug!("Receiver task terminated");
    }

    /// Ping task (Engine.IO v3): the client pings, the server pongs
    async fn ping_task(tx: mpsc::UnboundedSender<Message>, interval: Duration) {
        let mut ticker = time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if tx.send(Message::Text(Packet::Ping(String::new()).encode())).is_err() {
                break;
            }
        }
    }
}

impl SignalingChannel for SocketIoClient {
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        let packet = Packet::Event(ChannelEvent::new(event, args)).encode();
        debug!("Sending signaling message: {}", packet);

        self.tx
            .send(Message::Text(packet))
            .map_err(|e| Error::SignalingError(format!("Failed to send message: {}", e)))
    }

    fn close(&self) {
        let _ = self.tx.send(Message::Text(Packet::Disconnect.encode()));
        let _ = self.tx.send(Message::Close(None));
    }
}

impl Drop for SocketIoClient {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
