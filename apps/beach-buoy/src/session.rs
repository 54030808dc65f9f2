//! Per-connection signaling state machine.
//!
//! One [`SignalingSession`] exists per accepted WebSocket. Its [`run`] loop is
//! the only place session state changes: inbound frames, peer-connection
//! events, engine operation results and watchdog expiries are all handled
//! there one at a time, so nothing here needs a lock.
//!
//! [`run`]: SignalingSession::run

use std::fmt;
use std::future::Future;
use std::mem;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use futures::FutureExt;
use tokio::sync::mpsc;

use crate::error::PeerError;
use crate::observer::{CloseReason, NegotiationStage, SessionObserver};
use crate::peer::{
    ConnectivityState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvents,
    RtcSettings,
};
use crate::protocol::{self, Discard, InboundMessage, OutboundMessage};
use crate::watchdog::Watchdog;

pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Unregistered,
    Registered,
    Closed,
}

impl SessionState {
    fn is_open(&self) -> bool {
        matches!(self, SessionState::Unregistered | SessionState::Registered)
    }
}

/// Outcome of one read on the transport that did not yield a text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The channel was closed cleanly. Not a fault.
    Closed,
    Fault(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Closed => f.write_str("channel closed"),
            ReadError::Fault(err) => f.write_str(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub rtc: RtcSettings,
    /// Watchdog period armed by `register`.
    pub ping_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            rtc: RtcSettings::default(),
            ping_interval: DEFAULT_PING_INTERVAL,
        }
    }
}

/// Peer-connection event stamped with the generation of the handle that
/// produced it.
#[derive(Debug)]
struct PeerEvent {
    generation: u64,
    kind: PeerEventKind,
}

#[derive(Debug)]
enum PeerEventKind {
    Connectivity(ConnectivityState),
    LocalCandidate(IceCandidate),
}

/// The session's side of [`PeerEvents`]. Holds only a channel sender, so an
/// engine callback that fires after the session is gone is silently dropped.
struct SessionEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl SessionEvents {
    fn push(&self, kind: PeerEventKind) {
        let _ = self.tx.send(PeerEvent {
            generation: self.generation,
            kind,
        });
    }
}

impl PeerEvents for SessionEvents {
    fn connectivity_state_changed(&self, state: ConnectivityState) {
        self.push(PeerEventKind::Connectivity(state));
    }

    fn local_candidate(&self, candidate: IceCandidate) {
        self.push(PeerEventKind::LocalCandidate(candidate));
    }
}

struct ActivePeer {
    generation: u64,
    handle: Box<dyn PeerConnection>,
}

/// Finished engine operation, stamped like [`PeerEvent`].
struct Completion {
    generation: u64,
    outcome: Outcome,
}

enum Outcome {
    OfferApplied(Result<(), PeerError>),
    AnswerCreated(Result<String, PeerError>),
    Applied(NegotiationStage, Result<(), PeerError>),
}

pub struct SignalingSession {
    state: SessionState,
    config: SessionConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    observer: Arc<dyn SessionObserver>,
    peer: Option<ActivePeer>,
    generation: u64,
    connectivity: ConnectivityState,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    events_rx: mpsc::UnboundedReceiver<PeerEvent>,
    pending: FuturesUnordered<BoxFuture<'static, Completion>>,
    watchdog: Watchdog,
}

impl SignalingSession {
    pub fn new(
        config: SessionConfig,
        factory: Arc<dyn PeerConnectionFactory>,
        outbound: mpsc::UnboundedSender<OutboundMessage>,
        observer: Arc<dyn SessionObserver>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            state: SessionState::AwaitingHandshake,
            config,
            factory,
            outbound,
            observer,
            peer: None,
            generation: 0,
            connectivity: ConnectivityState::New,
            events_tx,
            events_rx,
            pending: FuturesUnordered::new(),
            watchdog: Watchdog::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity
    }

    pub fn has_peer_connection(&self) -> bool {
        self.peer.is_some()
    }

    pub fn watchdog_enabled(&self) -> bool {
        self.watchdog.is_enabled()
    }

    /// The transport finished its handshake; start accepting messages.
    pub fn accepted(&mut self) {
        if self.state == SessionState::AwaitingHandshake {
            self.state = SessionState::Unregistered;
            self.observer.opened();
        }
    }

    /// Drive the session until the transport closes.
    ///
    /// `inbound` yields one item per completed read. Engine operations started
    /// by a message keep running while later messages are read, so replies
    /// produced by them (the answer, local candidates) may go out after
    /// messages that arrived later.
    pub async fn run<S>(mut self, mut inbound: S) -> CloseReason
    where
        S: Stream<Item = Result<String, ReadError>> + Unpin,
    {
        self.accepted();
        let reason = loop {
            tokio::select! {
                frame = inbound.next() => match frame {
                    Some(Ok(text)) => self.handle_message(&text),
                    Some(Err(ReadError::Closed)) | None => break CloseReason::Graceful,
                    Some(Err(err)) => {
                        self.observer.transport_fault("read", &err);
                        break CloseReason::Fault;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_peer_event(event),
                Some(completion) = self.pending.next(), if !self.pending.is_empty() => {
                    self.complete(completion)
                }
                () = self.watchdog.expired() => self.send(OutboundMessage::Ping),
            }
        };
        self.close(reason);
        reason
    }

    /// Dispatch one inbound text frame.
    ///
    /// Any received frame counts as liveness and resets the watchdog before
    /// it is even parsed. Malformed or out-of-order messages are dropped
    /// without a reply.
    pub fn handle_message(&mut self, text: &str) {
        if !self.state.is_open() {
            return;
        }
        self.watchdog.reset();

        let message = match protocol::parse(text) {
            Ok(message) => message,
            Err(reason) => {
                self.observer.message_discarded(reason);
                return;
            }
        };
        self.observer.message_received(message.kind());

        match message {
            InboundMessage::Offer { sdp } => self.on_offer(sdp),
            InboundMessage::Answer { sdp } => self.on_answer(sdp),
            InboundMessage::Candidate { ice } => self.on_candidate(ice),
            InboundMessage::Close | InboundMessage::Bye => self.release_peer_connection(),
            InboundMessage::Register => self.on_register(),
        }
    }

    /// Enter `Closed`: stop the watchdog, release the peer connection and
    /// abandon in-flight engine operations. Idempotent.
    pub fn close(&mut self, reason: CloseReason) {
        if self.state == SessionState::Closed {
            return;
        }
        let was_open = self.state.is_open();
        self.watchdog.disable();
        self.release_peer_connection();
        self.pending = FuturesUnordered::new();
        self.state = SessionState::Closed;
        if was_open {
            self.observer.closed(reason);
        }
    }

    /// Answers at most one offer per handle; a new offer needs `close` or `bye` first.
    fn on_offer(&mut self, sdp: String) {
        if self.peer.is_some() {
            self.observer
                .message_discarded(Discard::PeerConnectionExists);
            return;
        }

        self.generation += 1;
        let generation = self.generation;
        let events = Arc::new(SessionEvents {
            generation,
            tx: self.events_tx.clone(),
        });
        let handle = match self.factory.create(&self.config.rtc, events) {
            Ok(handle) => handle,
            Err(err) => {
                self.observer
                    .negotiation_failed(NegotiationStage::CreatePeerConnection, &err);
                return;
            }
        };
        self.observer.peer_connection_created();
        self.connectivity = ConnectivityState::New;

        let applied = handle.apply_remote_offer(sdp);
        self.peer = Some(ActivePeer { generation, handle });
        self.track(generation, applied.map(Outcome::OfferApplied));
    }

    fn on_answer(&mut self, sdp: String) {
        let Some(peer) = &self.peer else {
            self.observer.message_discarded(Discard::NoPeerConnection);
            return;
        };
        let generation = peer.generation;
        let applied = peer.handle.apply_remote_answer(sdp);
        self.track(
            generation,
            applied.map(|result| Outcome::Applied(NegotiationStage::ApplyRemoteAnswer, result)),
        );
    }

    fn on_candidate(&mut self, ice: IceCandidate) {
        let Some(peer) = &self.peer else {
            self.observer.message_discarded(Discard::NoPeerConnection);
            return;
        };
        let generation = peer.generation;
        let added = peer.handle.add_remote_candidate(ice);
        self.track(
            generation,
            added.map(|result| Outcome::Applied(NegotiationStage::AddRemoteCandidate, result)),
        );
    }

    fn on_register(&mut self) {
        self.send(OutboundMessage::Accept {
            is_exist_user: true,
        });
        self.state = SessionState::Registered;
        self.watchdog.enable(self.config.ping_interval);
        self.observer.registered();
    }

    fn release_peer_connection(&mut self) {
        if let Some(peer) = self.peer.take() {
            drop(peer);
            self.connectivity = ConnectivityState::Closed;
            self.observer.peer_connection_released();
        }
    }

    fn current_generation(&self) -> Option<u64> {
        self.peer.as_ref().map(|peer| peer.generation)
    }

    fn track<F>(&mut self, generation: u64, operation: F)
    where
        F: Future<Output = Outcome> + Send + 'static,
    {
        self.pending.push(
            operation
                .map(move |outcome| Completion {
                    generation,
                    outcome,
                })
                .boxed(),
        );
    }

    fn complete(&mut self, completion: Completion) {
        if self.current_generation() != Some(completion.generation) {
            return;
        }

        match completion.outcome {
            Outcome::OfferApplied(Ok(())) => {
                if let Some(peer) = &self.peer {
                    let answer = peer.handle.create_local_answer();
                    self.track(completion.generation, answer.map(Outcome::AnswerCreated));
                }
            }
            Outcome::OfferApplied(Err(err)) => self
                .observer
                .negotiation_failed(NegotiationStage::ApplyRemoteOffer, &err),
            Outcome::AnswerCreated(Ok(sdp)) => self.send(OutboundMessage::Answer { sdp }),
            Outcome::AnswerCreated(Err(err)) => self
                .observer
                .negotiation_failed(NegotiationStage::CreateLocalAnswer, &err),
            Outcome::Applied(_, Ok(())) => {}
            Outcome::Applied(stage, Err(err)) => self.observer.negotiation_failed(stage, &err),
        }
    }

    fn handle_peer_event(&mut self, event: PeerEvent) {
        if self.current_generation() != Some(event.generation) {
            return;
        }

        match event.kind {
            PeerEventKind::Connectivity(state) => {
                let previous = mem::replace(&mut self.connectivity, state);
                self.observer.connectivity_changed(previous, state);
            }
            PeerEventKind::LocalCandidate(ice) => {
                self.send(OutboundMessage::Candidate { ice });
            }
        }
    }

    fn send(&mut self, message: OutboundMessage) {
        if self.state == SessionState::Closed {
            return;
        }
        self.observer.message_sent(message.kind());
        let _ = self.outbound.send(message);
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.close(CloseReason::Graceful);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockCall, MockPeerFactory};
    use crate::observer::TracingObserver;
    use uuid::Uuid;

    fn session_with(
        factory: &MockPeerFactory,
    ) -> (SignalingSession, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new(
            SessionConfig::default(),
            Arc::new(factory.clone()),
            tx,
            Arc::new(TracingObserver::new(Uuid::new_v4())),
        );
        session.accepted();
        (session, rx)
    }

    #[test_timeout::tokio_timeout_test]
    async fn starts_unregistered_after_handshake() {
        let factory = MockPeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut session = SignalingSession::new(
            SessionConfig::default(),
            Arc::new(factory),
            tx,
            Arc::new(TracingObserver::new(Uuid::new_v4())),
        );
        assert_eq!(session.state(), SessionState::AwaitingHandshake);
        session.handle_message(r#"{"type":"register"}"#);
        assert_eq!(session.state(), SessionState::AwaitingHandshake);

        session.accepted();
        assert_eq!(session.state(), SessionState::Unregistered);
        assert!(!session.watchdog_enabled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn register_replies_accept_and_arms_watchdog() {
        let factory = MockPeerFactory::new();
        let (mut session, mut rx) = session_with(&factory);

        session.handle_message(r#"{"type":"register"}"#);

        assert_eq!(
            rx.try_recv().unwrap(),
            OutboundMessage::Accept {
                is_exist_user: true
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Registered);
        assert!(session.watchdog_enabled());
    }

    #[test_timeout::tokio_timeout_test]
    async fn offer_creates_exactly_one_peer_connection() {
        let factory = MockPeerFactory::new();
        let (mut session, _rx) = session_with(&factory);

        session.handle_message(r#"{"type":"offer","sdp":"v=0 remote"}"#);
        assert!(session.has_peer_connection());
        assert_eq!(factory.created_count(), 1);
        assert_eq!(
            factory.peer(0).calls(),
            vec![MockCall::ApplyRemoteOffer("v=0 remote".into())]
        );

        session.handle_message(r#"{"type":"offer","sdp":"v=0 again"}"#);
        assert_eq!(factory.created_count(), 1);
        assert!(!factory.peer(0).is_released());
    }

    #[test_timeout::tokio_timeout_test]
    async fn answer_and_candidate_without_peer_connection_are_ignored() {
        let factory = MockPeerFactory::new();
        let (mut session, mut rx) = session_with(&factory);

        session.handle_message(r#"{"type":"answer","sdp":"v=0"}"#);
        session.handle_message(
            r#"{"type":"candidate","ice":{"candidate":"c","sdpMLineIndex":0,"sdpMid":"0"}}"#,
        );

        assert!(rx.try_recv().is_err());
        assert_eq!(factory.created_count(), 0);
        assert!(!session.has_peer_connection());
        assert_eq!(session.state(), SessionState::Unregistered);
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_and_bye_release_the_peer_connection() {
        let factory = MockPeerFactory::new();
        let (mut session, _rx) = session_with(&factory);
        session.handle_message(r#"{"type":"register"}"#);

        session.handle_message(r#"{"type":"offer","sdp":"v=0"}"#);
        session.handle_message(r#"{"type":"close"}"#);
        assert!(!session.has_peer_connection());
        assert!(factory.peer(0).is_released());
        assert_eq!(session.connectivity_state(), ConnectivityState::Closed);
        assert_eq!(session.state(), SessionState::Registered);

        session.handle_message(r#"{"type":"offer","sdp":"v=0"}"#);
        session.handle_message(r#"{"type":"bye"}"#);
        assert!(factory.peer(1).is_released());
        assert_eq!(factory.created_count(), 2);
    }

    #[test_timeout::tokio_timeout_test]
    async fn creation_failure_leaves_no_peer_connection() {
        let factory = MockPeerFactory::new();
        factory.fail_creation(true);
        let (mut session, mut rx) = session_with(&factory);

        session.handle_message(r#"{"type":"offer","sdp":"v=0"}"#);
        assert!(!session.has_peer_connection());
        assert!(rx.try_recv().is_err());
    }

    #[test_timeout::tokio_timeout_test]
    async fn close_is_terminal() {
        let factory = MockPeerFactory::new();
        let (mut session, mut rx) = session_with(&factory);
        session.handle_message(r#"{"type":"register"}"#);
        session.handle_message(r#"{"type":"offer","sdp":"v=0"}"#);
        let _ = rx.try_recv();

        session.close(CloseReason::Graceful);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.watchdog_enabled());
        assert!(factory.peer(0).is_released());

        session.handle_message(r#"{"type":"register"}"#);
        assert!(rx.try_recv().is_err());
        assert_eq!(session.state(), SessionState::Closed);
    }
}
