//! Roomcast binary entry point
//!
//! Joins a room and relays a pre-encoded IVF video to every participant.
//! Lines typed on stdin are sent to the room as chat messages.
//!
//! # Usage
//!
//! ```bash
//! # Join the default room server with ./output.ivf
//! cargo run --bin roomcast
//!
//! # Custom server, file and Socket.IO 2.x server
//! cargo run --bin roomcast -- \
//!   --signaling-url https://rooms.example.com/ \
//!   --engine-io v3 \
//!   --media ./clip.ivf
//!
//! # Wait for full candidate gathering before sending descriptions
//! ROOMCAST_ICE_DELIVERY=bundled cargo run --bin roomcast
//! ```
//!
//! # Environment Variables
//!
//! Every flag has a `ROOMCAST_*` counterpart, e.g. `ROOMCAST_SIGNALING_URL`,
//! `ROOMCAST_MEDIA`, `ROOMCAST_STUN_SERVERS`. `RUST_LOG` sets the log level
//! (default: `info`).

use anyhow::{anyhow, Context};
use clap::Parser;
use roomcast::{
    media, EngineIoVersion, IceDelivery, RoomClient, RoomcastConfig, SignalingRouter,
    SourceState, TurnServerConfig,
};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Roomcast
///
/// Signaling-driven WebRTC mesh client: joins a room and streams one video
/// file to every other participant.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Socket.IO server URL (http(s):// or ws(s)://)
    #[arg(
        long,
        default_value = "https://topaz.h91.co/socket.io/",
        env = "ROOMCAST_SIGNALING_URL"
    )]
    signaling_url: String,

    /// Engine.IO protocol revision: v3 (Socket.IO 2.x) or v4 (Socket.IO 3.x/4.x)
    #[arg(long, default_value = "v4", env = "ROOMCAST_ENGINE_IO")]
    engine_io: EngineIoArg,

    /// Extra handshake query parameters (key=value, comma-separated)
    #[arg(long, value_delimiter = ',', value_parser = parse_query_pair, env = "ROOMCAST_QUERY")]
    query: Vec<(String, String)>,

    /// Display name for chat messages
    #[arg(short, long, default_value = "roomcast", env = "ROOMCAST_USERNAME")]
    username: String,

    /// IVF file relayed to every peer
    #[arg(short, long, default_value = "output.ivf", env = "ROOMCAST_MEDIA")]
    media: PathBuf,

    /// STUN servers (comma-separated, at least two)
    #[arg(
        long,
        value_delimiter = ',',
        default_value = "stun:stun.services.mozilla.com,stun:stun.l.google.com:19302",
        env = "ROOMCAST_STUN_SERVERS"
    )]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "ROOMCAST_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// ICE candidate delivery: trickle or bundled
    #[arg(long, default_value = "trickle", env = "ROOMCAST_ICE_DELIVERY")]
    ice_delivery: IceDeliveryArg,

    /// Seconds a peer may take to connect before its session is dropped
    #[arg(long, default_value_t = 30, env = "ROOMCAST_NEGOTIATION_TIMEOUT")]
    negotiation_timeout_secs: u64,

    /// Seconds between status reports (0 disables)
    #[arg(long, default_value_t = 5, env = "ROOMCAST_STATUS_INTERVAL")]
    status_interval_secs: u64,

    /// Do not read chat lines from stdin
    #[arg(long, default_value_t = false, env = "ROOMCAST_NO_CHAT")]
    no_chat: bool,

    /// Emit logs as JSON
    #[arg(long, default_value_t = false, env = "ROOMCAST_LOG_JSON")]
    log_json: bool,
}

/// Engine.IO revision CLI argument wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum EngineIoArg {
    V3,
    V4,
}

impl From<EngineIoArg> for EngineIoVersion {
    fn from(arg: EngineIoArg) -> Self {
        match arg {
            EngineIoArg::V3 => EngineIoVersion::V3,
            EngineIoArg::V4 => EngineIoVersion::V4,
        }
    }
}

/// ICE delivery CLI argument wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum IceDeliveryArg {
    Trickle,
    Bundled,
}

impl From<IceDeliveryArg> for IceDelivery {
    fn from(arg: IceDeliveryArg) -> Self {
        match arg {
            IceDeliveryArg::Trickle => IceDelivery::Trickle,
            IceDeliveryArg::Bundled => IceDelivery::Bundled,
        }
    }
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<TurnServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    // Password may contain colons
    Ok(TurnServerConfig {
        url: format!("{}:{}:{}", protocol, parts[1], parts[2]),
        username: parts[3].to_string(),
        credential: parts[4..].join(":"),
    })
}

fn parse_query_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("Invalid query pair: '{}'. Expected key=value", s)),
    }
}

/// Build RoomcastConfig from CLI arguments
fn build_config_from_args(args: &Args) -> anyhow::Result<RoomcastConfig> {
    let mut turn_servers = Vec::new();
    for turn_str in &args.turn_servers {
        let turn_config =
            parse_turn_server(turn_str).map_err(|e| anyhow!("Failed to parse TURN server: {}", e))?;
        info!(
            "Adding TURN server: {} (user: {})",
            turn_config.url, turn_config.username
        );
        turn_servers.push(turn_config);
    }

    let config = RoomcastConfig {
        signaling_url: args.signaling_url.clone(),
        engine_io: args.engine_io.into(),
        query: args.query.iter().cloned().collect::<BTreeMap<_, _>>(),
        username: args.username.clone(),
        stun_servers: args.stun_servers.clone(),
        turn_servers,
        media_path: args.media.clone(),
        ice_delivery: args.ice_delivery.into(),
        negotiation_timeout_secs: args.negotiation_timeout_secs,
        status_interval_secs: args.status_interval_secs,
    };

    config.validate()?;
    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("roomcast-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    init_tracing(args.log_json);

    info!(version = env!("CARGO_PKG_VERSION"), "Roomcast starting");

    let config = build_config_from_args(&args)?;
    info!(
        signaling_url = %config.signaling_url,
        engine_io = ?config.engine_io,
        username = %config.username,
        media = ?config.media_path,
        stun_servers = ?config.stun_servers,
        turn_servers = config.turn_servers.len(),
        ice_delivery = ?config.ice_delivery,
        negotiation_timeout_secs = config.negotiation_timeout_secs,
        "Configuration loaded"
    );

    let source = Arc::new(
        media::open_ivf(&config.media_path)
            .with_context(|| format!("Failed to open media file {:?}", config.media_path))?,
    );
    info!("Media source started");

    let username = config.username.clone();
    let mut client = RoomClient::connect(config, Some(Arc::clone(&source)))
        .await
        .context("Failed to join room")?;
    info!(local_id = %client.local_id(), "Press Ctrl+C to leave");

    let chat = if args.no_chat {
        None
    } else {
        Some(spawn_chat_input(Arc::clone(client.router()), username))
    };

    let mut media_done = false;
    let result = loop {
        tokio::select! {
            result = client.run() => break result.map_err(anyhow::Error::from),
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
                info!("Ctrl+C received, leaving room");
                break Ok(());
            }
            state = source.finished(), if !media_done => match state {
                SourceState::Failed(e) => break Err(anyhow!("Media source failed: {}", e)),
                other => {
                    info!("Media source finished: {:?}", other);
                    media_done = true;
                }
            },
        }
    };

    if let Some(chat) = chat {
        chat.abort();
    }
    client.shutdown().await;
    source.stop();

    result
}

/// Forward stdin lines to the room as chat messages
fn spawn_chat_input(router: Arc<SignalingRouter>, username: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = router.send_chat(&username, &line) {
                        warn!("Failed to send chat message: {}", e);
                    }
                }
                Ok(None) => {
                    debug!("stdin closed, chat input stopped");
                    break;
                }
                Err(e) => {
                    warn!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    })
}

fn init_tracing(json: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
