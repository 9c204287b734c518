//! Mesh test harness
//!
//! Provides scripted stand-ins for the two external collaborators of the
//! mesh client so that negotiation can be tested without a network:
//! - [`MockTransportFactory`] / [`MockTransport`]: records every call a
//!   session makes and lets the test inject transport events
//! - [`MockChannel`]: records every event emitted towards the room
//!
//! [`TestRoom`] wires both into a real [`RoomClient`]; [`SessionFixture`] gives
//! direct access to a registry and its raw [`SessionEvent`] stream.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use roomcast::config::IceDelivery;
use roomcast::peer::SessionContext;
use roomcast::signaling::protocol::{events, IceCandidate, SdpType, SessionDescription};
use roomcast::signaling::ChannelEvent;
use roomcast::transport::{
    PeerTransport, TransportEvent, TransportEventSender, TransportFactory, TransportState,
};
use roomcast::{
    Error, MediaSource, PeerRegistry, Result, RoomClient, RoomcastConfig, SessionEvent,
    SignalMessage, SignalingChannel,
};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use webrtc::track::track_local::TrackLocal;

/// How long any wait in a test may take before it is considered hung
pub const WAIT: Duration = Duration::from_secs(5);

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// One recorded transport call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    AddTrack(String),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    Close,
}

/// Transport that records calls and answers with canned descriptions
pub struct MockTransport {
    pub peer_id: String,
    events: TransportEventSender,
    calls: Mutex<Vec<Call>>,
    local: Mutex<Option<SessionDescription>>,
    fail_remote_description: bool,
    stall_offers: bool,
    closed: AtomicBool,
}

impl MockTransport {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    /// Remote candidates applied, in order
    pub fn candidates(&self) -> Vec<String> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                Call::AddCandidate(candidate) => Some(candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Inject a transport event
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_state(&self, state: TransportState) {
        self.emit(TransportEvent::StateChanged(state));
    }

    pub fn discover_candidate(&self, candidate: &str) {
        self.emit(TransportEvent::LocalCandidate(IceCandidate::new(candidate)));
    }

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn add_track(&self, track: Arc<dyn TrackLocal + Send + Sync>) -> Result<()> {
        self.record(Call::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateOffer);
        if self.stall_offers {
            futures::future::pending::<()>().await;
        }
        Ok(SessionDescription::offer(format!("offer-for-{}", self.peer_id)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.record(Call::CreateAnswer);
        Ok(SessionDescription::answer(format!("answer-for-{}", self.peer_id)))
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.record(Call::SetLocal(description.sdp_type));
        *self.local.lock() = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.record(Call::SetRemote(description.sdp_type));
        if self.fail_remote_description {
            return Err(Error::SdpError("remote description rejected".to_string()));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(Call::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn local_description(&self) -> Option<SessionDescription> {
        self.local
            .lock()
            .clone()
            .map(|mut description| {
                description.sdp.push_str(" +gathered");
                description
            })
    }

    async fn close(&self) -> Result<()> {
        self.record(Call::Close);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory handing out [`MockTransport`]s and keeping every one it made
#[derive(Default)]
pub struct MockTransportFactory {
    created: Mutex<Vec<Arc<MockTransport>>>,
    fail_remote_description: AtomicBool,
    stall_offers: AtomicBool,
}

impl MockTransportFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every transport created from now on reject remote descriptions
    pub fn reject_remote_descriptions(&self) {
        self.fail_remote_description.store(true, Ordering::SeqCst);
    }

    /// Make every transport created from now on hang forever in `create_offer`
    pub fn stall_offers(&self) {
        self.stall_offers.store(true, Ordering::SeqCst);
    }

    /// Transports created for `peer_id`, oldest first
    pub fn transports_for(&self, peer_id: &str) -> Vec<Arc<MockTransport>> {
        self.created
            .lock()
            .iter()
            .filter(|t| t.peer_id == peer_id)
            .cloned()
            .collect()
    }

    pub fn total_created(&self) -> usize {
        self.created.lock().len()
    }

    /// Wait for the `index`-th transport of `peer_id`
    pub async fn transport(&self, peer_id: &str, index: usize) -> Arc<MockTransport> {
        let mut found = None;
        wait_until(|| {
            found = self.transports_for(peer_id).get(index).cloned();
            found.is_some()
        })
        .await;
        found.unwrap()
    }
}

#[async_trait]
impl TransportFactory for MockTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(MockTransport {
            peer_id: peer_id.to_string(),
            events,
            calls: Mutex::new(Vec::new()),
            local: Mutex::new(None),
            fail_remote_description: self.fail_remote_description.load(Ordering::SeqCst),
            stall_offers: self.stall_offers.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        });
        self.created.lock().push(Arc::clone(&transport));
        Ok(transport)
    }
}

/// Signaling channel that records every emitted event
#[derive(Default)]
pub struct MockChannel {
    emitted: Mutex<Vec<ChannelEvent>>,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn emitted(&self) -> Vec<ChannelEvent> {
        self.emitted.lock().clone()
    }

    /// Decoded `signal` messages addressed to `peer_id`, in emit order
    pub fn signals_to(&self, peer_id: &str) -> Vec<SignalMessage> {
        self.emitted
            .lock()
            .iter()
            .filter(|e| e.name == events::SIGNAL && e.args.first() == Some(&json!(peer_id)))
            .flat_map(|e| {
                let payload = e.args.get(1).and_then(Value::as_str).unwrap_or_default();
                SignalMessage::decode_str(payload).unwrap()
            })
            .collect()
    }

    /// Wait until at least `count` messages were sent to `peer_id`
    pub async fn wait_for_signals(&self, peer_id: &str, count: usize) -> Vec<SignalMessage> {
        wait_until(|| self.signals_to(peer_id).len() >= count).await;
        self.signals_to(peer_id)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl SignalingChannel for MockChannel {
    fn emit(&self, event: &str, args: Vec<Value>) -> Result<()> {
        self.emitted.lock().push(ChannelEvent::new(event, args));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// A [`RoomClient`] wired to mocks
pub struct TestRoom {
    pub client: RoomClient,
    pub channel: Arc<MockChannel>,
    pub transports: Arc<MockTransportFactory>,
    pub inbound: mpsc::UnboundedSender<ChannelEvent>,
}

impl TestRoom {
    pub fn new(local_id: &str) -> Self {
        Self::with_config(local_id, test_config(), None)
    }

    pub fn with_config(
        local_id: &str,
        config: RoomcastConfig,
        media: Option<Arc<MediaSource>>,
    ) -> Self {
        init_logging();

        let channel = Arc::new(MockChannel::default());
        let transports = MockTransportFactory::new();
        let (inbound, inbound_rx) = mpsc::unbounded_channel();

        let client = RoomClient::from_parts(
            config,
            local_id.to_string(),
            channel.clone(),
            inbound_rx,
            transports.clone(),
            media,
        )
        .unwrap();

        Self {
            client,
            channel,
            transports,
            inbound,
        }
    }

    /// Deliver one room event to the router
    pub fn event(&self, name: &str, args: Vec<Value>) {
        self.client
            .router()
            .handle_channel_event(&ChannelEvent::new(name, args));
    }

    pub fn roster(&self, joined: &str, peers: &[&str]) {
        self.event(
            events::USER_JOINED,
            vec![json!(joined), json!(peers.len()), json!(peers)],
        );
    }

    pub fn user_left(&self, id: &str) {
        self.event(events::USER_LEFT, vec![json!(id)]);
    }

    /// `signal` event carrying `message` as a JSON string, the way browsers send it
    pub fn signal(&self, from: &str, message: &SignalMessage) {
        self.event(
            events::SIGNAL,
            vec![json!(from), json!(message.to_payload().unwrap())],
        );
    }
}

/// Registry plus the raw events its sessions emit
pub struct SessionFixture {
    pub registry: Arc<PeerRegistry>,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub transports: Arc<MockTransportFactory>,
}

impl SessionFixture {
    pub fn new(local_id: &str, ice_delivery: IceDelivery, negotiation_timeout: Duration) -> Self {
        init_logging();

        let transports = MockTransportFactory::new();
        let (events_tx, events) = mpsc::unbounded_channel();
        let registry = Arc::new(PeerRegistry::new(SessionContext {
            local_id: local_id.to_string(),
            transports: transports.clone(),
            media: None,
            ice_delivery,
            negotiation_timeout,
            events: events_tx,
        }));

        Self {
            registry,
            events,
            transports,
        }
    }

    pub fn trickle(local_id: &str) -> Self {
        Self::new(local_id, IceDelivery::Trickle, Duration::from_secs(30))
    }

    /// Next session event, failing the test if none arrives in time
    pub async fn next_event(&mut self) -> SessionEvent {
        match tokio::time::timeout(WAIT, self.events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => panic!("session event channel closed"),
            Err(_) => panic!("no session event within {:?}", WAIT),
        }
    }

    /// Fail the test if an event is already waiting
    pub fn assert_no_event(&mut self) {
        if let Ok(event) = self.events.try_recv() {
            panic!("unexpected session event {:?}", event);
        }
    }
}

pub fn test_config() -> RoomcastConfig {
    RoomcastConfig {
        username: "tester".to_string(),
        status_interval_secs: 0,
        ..Default::default()
    }
}

pub fn offer(sdp: &str) -> SignalMessage {
    SignalMessage::Offer(SessionDescription::offer(sdp))
}

pub fn answer(sdp: &str) -> SignalMessage {
    SignalMessage::Answer(SessionDescription::answer(sdp))
}

pub fn candidate(line: &str) -> SignalMessage {
    SignalMessage::IceCandidate(IceCandidate::new(line))
}

/// Poll `condition` until it holds, failing the test after [`WAIT`]
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    let polled = tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "condition not met within {:?}", WAIT);
}

/// Let spawned session tasks run for a moment
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Await `future`, failing the test if it takes longer than [`WAIT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .unwrap_or_else(|_| panic!("operation did not finish within {:?}", WAIT))
}
