//! Per-peer negotiation state machine

use crate::config::IceDelivery;
use crate::media::MediaSource;
use crate::signaling::protocol::{IceCandidate, SessionDescription, SignalMessage};
use crate::transport::{PeerTransport, TransportEvent, TransportFactory, TransportState};
use crate::{Error, Result};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

/// Which side sends the offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sends the offer
    Caller,
    /// Answers a remote offer
    Callee,
}

/// Step within an ongoing negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationPhase {
    /// Caller is building its offer (or waiting for gathering to finish)
    CreatingOffer,
    /// Offer delivered, waiting for the answer and connectivity
    OfferSent,
    /// Callee is building its answer (or waiting for gathering to finish)
    CreatingAnswer,
    /// Answer delivered, waiting for connectivity
    AnswerSent,
}

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Transport allocated, nothing exchanged yet
    Created,
    /// Offer/answer exchange in progress
    Negotiating(NegotiationPhase),
    /// Transport reported connectivity
    Connected,
    /// Terminal; transport released
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NegotiationState::Created => write!(f, "created"),
            NegotiationState::Negotiating(NegotiationPhase::CreatingOffer) => {
                write!(f, "creating-offer")
            }
            NegotiationState::Negotiating(NegotiationPhase::OfferSent) => write!(f, "offer-sent"),
            NegotiationState::Negotiating(NegotiationPhase::CreatingAnswer) => {
                write!(f, "creating-answer")
            }
            NegotiationState::Negotiating(NegotiationPhase::AnswerSent) => {
                write!(f, "answer-sent")
            }
            NegotiationState::Connected => write!(f, "connected"),
            NegotiationState::Closed => write!(f, "closed"),
        }
    }
}

/// Point-in-time view of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub role: Role,
    pub state: NegotiationState,
}

/// Something a session needs the outside world to act on
#[derive(Debug)]
pub enum SessionEvent {
    /// Deliver a local offer, answer or candidate to the peer
    Signal { peer_id: String, message: SignalMessage },
    /// Transport is up
    Connected { peer_id: String, generation: u64 },
    /// A negotiation step failed without ending the session
    Error { peer_id: String, error: Error },
    /// Session ended and released its transport
    Closed {
        peer_id: String,
        generation: u64,
        reason: String,
    },
}

/// Collaborators shared by every session
pub struct SessionContext {
    /// Our own peer id, used to break offer collisions
    pub local_id: String,

    /// Opens one transport per session
    pub transports: Arc<dyn TransportFactory>,

    /// Outbound media attached to every transport
    pub media: Option<Arc<MediaSource>>,

    /// How local candidates are delivered
    pub ice_delivery: IceDelivery,

    /// Time allowed from creation to connectivity
    pub negotiation_timeout: Duration,

    /// Where sessions report [`SessionEvent`]s
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

enum StepOutcome {
    Done(Result<()>),
    Closed,
    TimedOut,
}

#[derive(Debug)]
enum Command {
    InitiateOffer,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    Close,
}

/// Handle to one remote peer's session
///
/// Cloning is cheap; all clones drive the same session. Operations are
/// queued and applied in call order by the session's driver task.
#[derive(Clone)]
pub struct PeerSession {
    id: Arc<str>,
    generation: u64,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl PeerSession {
    /// Build a session handle and the driver that will run it.
    ///
    /// Nothing happens until [`SessionDriver::spawn`] is called; operations
    /// issued before that are queued.
    pub(crate) fn new(
        id: &str,
        role: Role,
        generation: u64,
        context: Arc<SessionContext>,
    ) -> (Self, SessionDriver) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionSnapshot {
            role,
            state: NegotiationState::Created,
        });
        // Replaced as soon as the first transport opens
        let (_, transport_events) = mpsc::unbounded_channel();

        let session = Self {
            id: Arc::from(id),
            generation,
            commands: commands_tx,
            state: state_rx,
        };

        let driver = SessionDriver {
            id: id.to_string(),
            generation,
            role,
            state: NegotiationState::Created,
            context,
            created_at: Instant::now(),
            commands: commands_rx,
            snapshot: state_tx,
            transport: None,
            transport_events,
            local_offer_set: false,
            remote_description_set: false,
            queued_candidates: VecDeque::new(),
            gathering_complete: false,
            awaiting_gathering: false,
        };

        (session, driver)
    }

    /// Remote peer id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation counter, distinguishes a re-created session from its predecessor
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Current role and state
    pub fn snapshot(&self) -> SessionSnapshot {
        *self.state.borrow()
    }

    /// Current role (a Caller that yields an offer collision becomes Callee)
    pub fn role(&self) -> Role {
        self.snapshot().role
    }

    /// Current negotiation state
    pub fn state(&self) -> NegotiationState {
        self.snapshot().state
    }

    /// Whether the session has ended
    pub fn is_closed(&self) -> bool {
        self.state() == NegotiationState::Closed
    }

    /// Create and deliver a local offer (Caller only; repeated calls are ignored)
    pub fn initiate_offer(&self) {
        self.send(Command::InitiateOffer);
    }

    /// Apply a remote offer and answer it
    pub fn on_remote_offer(&self, description: SessionDescription) {
        self.send(Command::RemoteOffer(description));
    }

    /// Apply the remote answer to our offer
    pub fn on_remote_answer(&self, description: SessionDescription) {
        self.send(Command::RemoteAnswer(description));
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub fn on_remote_candidate(&self, candidate: IceCandidate) {
        self.send(Command::RemoteCandidate(candidate));
    }

    /// Route a decoded signal message to the matching handler
    pub fn apply(&self, message: SignalMessage) {
        match message {
            SignalMessage::Offer(description) => self.on_remote_offer(description),
            SignalMessage::Answer(description) => self.on_remote_answer(description),
            SignalMessage::IceCandidate(candidate) => self.on_remote_candidate(candidate),
        }
    }

    /// Close the session; safe to call repeatedly
    pub fn close(&self) {
        self.send(Command::Close);
    }

    /// Wait until the session has released its transport
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state
            .wait_for(|s| s.state == NegotiationState::Closed)
            .await;
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            debug!(peer_id = %self.id, "Session already closed, dropping command");
        }
    }
}

/// Owns one session's transport and negotiation state
pub(crate) struct SessionDriver {
    id: String,
    generation: u64,
    role: Role,
    state: NegotiationState,
    context: Arc<SessionContext>,
    created_at: Instant,
    commands: mpsc::UnboundedReceiver<Command>,
    snapshot: watch::Sender<SessionSnapshot>,
    transport: Option<Arc<dyn PeerTransport>>,
    transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    local_offer_set: bool,
    remote_description_set: bool,
    queued_candidates: VecDeque<IceCandidate>,
    gathering_complete: bool,
    awaiting_gathering: bool,
}

impl SessionDriver {
    /// Run the session on the current runtime
    pub(crate) fn spawn(self) {
        let span = info_span!("session", peer_id = %self.id, generation = self.generation);
        tokio::spawn(self.run().instrument(span));
    }

    async fn run(mut self) {
        // Steps borrow the driver, so the command queue is polled from outside it
        let (_, detached) = mpsc::unbounded_channel();
        let mut commands = std::mem::replace(&mut self.commands, detached);

        let reason = match self.drive(&mut commands).await {
            Ok(reason) => reason,
            Err(e) => {
                error!("Session failed: {}", e);
                e.to_string()
            }
        };
        commands.close();
        self.shutdown(reason).await;
    }

    async fn drive(&mut self, commands: &mut mpsc::UnboundedReceiver<Command>) -> Result<String> {
        let deadline = self.created_at + self.context.negotiation_timeout;

        // Commands that arrive while a step is in flight wait here, except Close
        let mut backlog = VecDeque::new();
        let opening = open_transport(Arc::clone(&self.context), self.id.clone());
        tokio::pin!(opening);

        loop {
            tokio::select! {
                opened = &mut opening => {
                    let (transport, events) = opened?;
                    self.install(transport, events);
                    break;
                },
                command = commands.recv() => match command {
                    Some(Command::Close) | None => return Ok("closed".to_string()),
                    Some(command) => backlog.push_back(command),
                },
                _ = time::sleep_until(deadline) => {
                    return Err(self.timeout_error());
                },
            }
        }

        loop {
            let command = match backlog.pop_front() {
                Some(command) => command,
                None => {
                    let connected = self.state == NegotiationState::Connected;

                    tokio::select! {
                        command = commands.recv() => match command {
                            Some(Command::Close) | None => return Ok("closed".to_string()),
                            Some(command) => command,
                        },
                        Some(event) = self.transport_events.recv() => {
                            if let Some(reason) = self.handle_transport_event(event).await? {
                                return Ok(reason);
                            }
                            continue;
                        },
                        _ = time::sleep_until(deadline), if !connected => {
                            return Err(self.timeout_error());
                        },
                    }
                }
            };

            if let Some(reason) = self.step(command, commands, &mut backlog, deadline).await? {
                return Ok(reason);
            }
        }
    }

    /// Apply one command, abandoning it on Close or when the deadline passes
    async fn step(
        &mut self,
        command: Command,
        commands: &mut mpsc::UnboundedReceiver<Command>,
        backlog: &mut VecDeque<Command>,
        deadline: Instant,
    ) -> Result<Option<String>> {
        let connected = self.state == NegotiationState::Connected;

        let outcome = {
            let running = self.handle_command(command);
            tokio::pin!(running);

            loop {
                tokio::select! {
                    result = &mut running => break StepOutcome::Done(result),
                    next = commands.recv() => match next {
                        Some(Command::Close) | None => break StepOutcome::Closed,
                        Some(next) => backlog.push_back(next),
                    },
                    _ = time::sleep_until(deadline), if !connected => break StepOutcome::TimedOut,
                }
            }
        };

        match outcome {
            StepOutcome::Done(Ok(())) => Ok(None),
            StepOutcome::Done(Err(e)) => self.fail_step(e).map(|()| None),
            StepOutcome::Closed => {
                debug!("Closed during a negotiation step ({})", self.state);
                Ok(Some("closed".to_string()))
            }
            StepOutcome::TimedOut => Err(self.timeout_error()),
        }
    }

    fn timeout_error(&self) -> Error {
        Error::OperationTimeout(format!(
            "{} not connected after {:?}",
            self.id, self.context.negotiation_timeout
        ))
    }

    /// Report a failed step; fatal failures end the session
    fn fail_step(&self, error: Error) -> Result<()> {
        if error.is_session_fatal() {
            return Err(error);
        }
        warn!("{}", error);
        self.emit(SessionEvent::Error {
            peer_id: self.id.clone(),
            error,
        });
        Ok(())
    }

    fn install(
        &mut self,
        transport: Arc<dyn PeerTransport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        self.transport = Some(transport);
        self.transport_events = events;
        debug!("Transport ready");
    }

    fn transport(&self) -> Result<Arc<dyn PeerTransport>> {
        self.transport
            .clone()
            .ok_or_else(|| Error::SessionClosed(self.id.clone()))
    }

    async fn handle_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::InitiateOffer => self.initiate_offer().await,
            Command::RemoteOffer(description) => self.on_remote_offer(description).await,
            Command::RemoteAnswer(description) => self.on_remote_answer(description).await,
            Command::RemoteCandidate(candidate) => self.on_remote_candidate(candidate).await,
            Command::Close => Ok(()),
        }
    }

    async fn initiate_offer(&mut self) -> Result<()> {
        if self.role != Role::Caller {
            debug!("Not the caller, ignoring offer request");
            return Ok(());
        }
        if self.state != NegotiationState::Created {
            debug!("Offer already initiated ({})", self.state);
            return Ok(());
        }

        self.set_state(NegotiationState::Negotiating(NegotiationPhase::CreatingOffer));

        let transport = self.transport()?;
        let offer = transport.create_offer().await?;
        transport.set_local_description(offer.clone()).await?;
        self.local_offer_set = true;

        info!("Local offer set");
        self.deliver_local_description(offer).await
    }

    async fn on_remote_offer(&mut self, offer: SessionDescription) -> Result<()> {
        if self.remote_description_set {
            warn!("Ignoring offer: remote description already set");
            return Ok(());
        }

        if self.local_offer_set {
            if self.context.local_id.as_str() < self.id.as_str() {
                info!("Offer collision, keeping our offer");
                return Ok(());
            }
            info!("Offer collision, yielding to the remote offer");
            self.restart_as_callee().await?;
        } else if self.role == Role::Caller {
            debug!("Remote offered first, answering instead");
            self.set_role(Role::Callee);
        }

        self.set_state(NegotiationState::Negotiating(NegotiationPhase::CreatingAnswer));

        let transport = self.transport()?;
        transport.set_remote_description(offer).await?;
        self.remote_description_set = true;
        self.flush_candidates().await;

        let answer = transport.create_answer().await?;
        transport.set_local_description(answer.clone()).await?;

        info!("Local answer set");
        self.deliver_local_description(answer).await
    }

    async fn on_remote_answer(&mut self, answer: SessionDescription) -> Result<()> {
        if !self.local_offer_set {
            return Err(Error::UnexpectedAnswer(self.id.clone()));
        }
        if self.remote_description_set {
            warn!("Ignoring duplicate answer");
            return Ok(());
        }

        self.transport()?.set_remote_description(answer).await?;
        self.remote_description_set = true;
        info!("Remote answer applied");

        self.flush_candidates().await;
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) -> Result<()> {
        if !self.remote_description_set {
            debug!(
                "Queueing remote candidate ({} queued)",
                self.queued_candidates.len() + 1
            );
            self.queued_candidates.push_back(candidate);
            return Ok(());
        }

        self.transport()?.add_ice_candidate(candidate).await
    }

    /// Apply queued candidates in arrival order
    async fn flush_candidates(&mut self) {
        if self.queued_candidates.is_empty() {
            return;
        }
        debug!("Applying {} queued candidates", self.queued_candidates.len());

        while let Some(candidate) = self.queued_candidates.pop_front() {
            let result = match self.transport() {
                Ok(transport) => transport.add_ice_candidate(candidate).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let _ = self.fail_step(e);
            }
        }
    }

    /// Abandon our offer and start over with a fresh transport as Callee
    async fn restart_as_callee(&mut self) -> Result<()> {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Failed to close superseded transport: {}", e);
            }
        }

        self.local_offer_set = false;
        self.gathering_complete = false;
        self.awaiting_gathering = false;
        self.set_role(Role::Callee);

        let (transport, events) =
            open_transport(Arc::clone(&self.context), self.id.clone()).await?;
        self.install(transport, events);
        Ok(())
    }

    /// Send a local offer/answer, now (trickle) or once gathering completes (bundled)
    async fn deliver_local_description(&mut self, description: SessionDescription) -> Result<()> {
        match self.context.ice_delivery {
            IceDelivery::Trickle => self.send_description(description),
            IceDelivery::Bundled => {
                self.awaiting_gathering = true;
                if self.gathering_complete {
                    self.send_gathered_description().await?;
                }
                Ok(())
            }
        }
    }

    async fn send_gathered_description(&mut self) -> Result<()> {
        self.awaiting_gathering = false;
        let description = self
            .transport()?
            .local_description()
            .await
            .ok_or_else(|| Error::SdpError("No local description after gathering".to_string()))?;
        self.send_description(description)
    }

    fn send_description(&mut self, description: SessionDescription) -> Result<()> {
        let message = SignalMessage::try_from(description)?;
        let phase = match message {
            SignalMessage::Answer(_) => NegotiationPhase::AnswerSent,
            _ => NegotiationPhase::OfferSent,
        };

        if self.state != NegotiationState::Connected {
            self.set_state(NegotiationState::Negotiating(phase));
        }

        self.emit(SessionEvent::Signal {
            peer_id: self.id.clone(),
            message,
        });
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<Option<String>> {
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                if self.context.ice_delivery == IceDelivery::Trickle {
                    self.emit(SessionEvent::Signal {
                        peer_id: self.id.clone(),
                        message: SignalMessage::IceCandidate(candidate),
                    });
                }
            }
            TransportEvent::GatheringComplete => {
                debug!("Candidate gathering complete");
                self.gathering_complete = true;
                if self.awaiting_gathering {
                    self.send_gathered_description().await?;
                }
            }
            TransportEvent::StateChanged(state) => match state {
                TransportState::Connected => {
                    if self.state != NegotiationState::Connected {
                        info!("Connected after {:?}", self.created_at.elapsed());
                        self.set_state(NegotiationState::Connected);
                        self.emit(SessionEvent::Connected {
                            peer_id: self.id.clone(),
                            generation: self.generation,
                        });
                    }
                }
                TransportState::Disconnected => {
                    warn!("Connectivity lost, waiting for recovery");
                }
                TransportState::Failed | TransportState::Closed => {
                    return Ok(Some(format!("transport {:?}", state).to_lowercase()));
                }
                TransportState::New | TransportState::Checking => {
                    debug!("Transport state {:?}", state);
                }
            },
        }
        Ok(None)
    }

    async fn shutdown(&mut self, reason: String) {
        if let Some(transport) = self.transport.take() {
            if let Err(e) = transport.close().await {
                warn!("Failed to close transport: {}", e);
            }
        }
        self.queued_candidates.clear();

        self.set_state(NegotiationState::Closed);
        info!("Session closed ({})", reason);

        self.emit(SessionEvent::Closed {
            peer_id: self.id.clone(),
            generation: self.generation,
            reason,
        });
    }

    fn set_state(&mut self, state: NegotiationState) {
        if self.state != state {
            debug!("{} -> {}", self.state, state);
            self.state = state;
            self.publish();
        }
    }

    fn set_role(&mut self, role: Role) {
        self.role = role;
        self.publish();
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            role: self.role,
            state: self.state,
        });
    }

    fn emit(&self, event: SessionEvent) {
        // The router may already be gone during shutdown
        let _ = self.context.events.send(event);
    }
}

/// Create a transport for `peer_id` and attach the shared media to it
#[instrument(skip(context))]
async fn open_transport(
    context: Arc<SessionContext>,
    peer_id: String,
) -> Result<(Arc<dyn PeerTransport>, mpsc::UnboundedReceiver<TransportEvent>)> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let transport = context.transports.create(&peer_id, events_tx).await?;

    if let Some(media) = &context.media {
        if let Err(e) = media.attach(transport.as_ref()).await {
            if let Err(close_err) = transport.close().await {
                warn!("Failed to close transport: {}", close_err);
            }
            return Err(e);
        }
    }

    Ok((transport, events_rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportEventSender;
    use async_trait::async_trait;

    struct UnreachableFactory;

    #[async_trait]
    impl TransportFactory for UnreachableFactory {
        async fn create(
            &self,
            peer_id: &str,
            _events: TransportEventSender,
        ) -> Result<Arc<dyn PeerTransport>> {
            Err(Error::PeerConnectionError(format!("no route to {}", peer_id)))
        }
    }

    fn context() -> (Arc<SessionContext>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let context = SessionContext {
            local_id: "local".to_string(),
            transports: Arc::new(UnreachableFactory),
            media: None,
            ice_delivery: IceDelivery::Trickle,
            negotiation_timeout: Duration::from_secs(30),
            events,
        };
        (Arc::new(context), rx)
    }

    #[test]
    fn test_state_display() {
        assert_eq!(NegotiationState::Created.to_string(), "created");
        assert_eq!(
            NegotiationState::Negotiating(NegotiationPhase::OfferSent).to_string(),
            "offer-sent"
        );
        assert_eq!(NegotiationState::Closed.to_string(), "closed");
    }

    #[tokio::test]
    async fn test_new_session_starts_created() {
        let (context, _rx) = context();
        let (session, _driver) = PeerSession::new("peer-b", Role::Caller, 7, context);

        assert_eq!(session.id(), "peer-b");
        assert_eq!(session.generation(), 7);
        assert_eq!(
            session.snapshot(),
            SessionSnapshot {
                role: Role::Caller,
                state: NegotiationState::Created
            }
        );
    }

    #[tokio::test]
    async fn test_transport_failure_closes_session() {
        let (context, mut rx) = context();
        let (session, driver) = PeerSession::new("peer-b", Role::Callee, 1, context);
        driver.spawn();

        session.closed().await;
        assert!(session.is_closed());

        match rx.recv().await {
            Some(SessionEvent::Closed {
                peer_id,
                generation,
                reason,
            }) => {
                assert_eq!(peer_id, "peer-b");
                assert_eq!(generation, 1);
                assert!(reason.contains("no route"));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_commands_after_close_are_dropped() {
        let (context, _rx) = context();
        let (session, driver) = PeerSession::new("peer-b", Role::Caller, 1, context);
        driver.spawn();
        session.closed().await;

        session.initiate_offer();
        session.close();
        assert!(session.is_closed());
    }
}
