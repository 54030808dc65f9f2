//! In-memory peer-connection engine for exercising sessions without ICE.

use std::collections::VecDeque;
use std::sync::Arc;

use futures::future::{self, BoxFuture};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::PeerError;
use crate::peer::{
    ConnectivityState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvents,
    RtcSettings,
};

/// One operation issued against a [`MockPeerConnection`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    ApplyRemoteOffer(String),
    CreateLocalAnswer,
    ApplyRemoteAnswer(String),
    AddRemoteCandidate(IceCandidate),
}

#[derive(Default)]
struct Behavior {
    fail_creation: bool,
    fail_offers: bool,
    fail_answers: bool,
    hold_answers: bool,
}

#[derive(Default)]
struct FactoryState {
    behavior: Behavior,
    peers: Vec<MockPeer>,
    held_answers: VecDeque<(String, oneshot::Sender<Result<String, PeerError>>)>,
}

/// Factory that records every handle it creates.
///
/// Clones share state, so a test keeps one clone and hands the other to the
/// session.
#[derive(Clone, Default)]
pub struct MockPeerFactory {
    state: Arc<Mutex<FactoryState>>,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_creation(&self, fail: bool) {
        self.state.lock().behavior.fail_creation = fail;
    }

    pub fn fail_offers(&self, fail: bool) {
        self.state.lock().behavior.fail_offers = fail;
    }

    pub fn fail_answers(&self, fail: bool) {
        self.state.lock().behavior.fail_answers = fail;
    }

    /// Keep `create_local_answer` pending until [`release_answer`] is called.
    ///
    /// [`release_answer`]: MockPeerFactory::release_answer
    pub fn hold_answers(&self, hold: bool) {
        self.state.lock().behavior.hold_answers = hold;
    }

    /// Complete the oldest held answer. Returns false if none is waiting.
    pub fn release_answer(&self) -> bool {
        let held = self.state.lock().held_answers.pop_front();
        match held {
            Some((sdp, tx)) => {
                let _ = tx.send(Ok(sdp));
                true
            }
            None => false,
        }
    }

    pub fn held_answer_count(&self) -> usize {
        self.state.lock().held_answers.len()
    }

    pub fn created_count(&self) -> usize {
        self.state.lock().peers.len()
    }

    /// The `index`th created handle, in creation order.
    ///
    /// Panics if fewer handles were created.
    pub fn peer(&self, index: usize) -> MockPeer {
        self.state.lock().peers[index].clone()
    }
}

impl PeerConnectionFactory for MockPeerFactory {
    fn create(
        &self,
        settings: &RtcSettings,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        let mut state = self.state.lock();
        if state.behavior.fail_creation {
            return Err(PeerError::Engine("mock creation refused".into()));
        }

        let peer = MockPeer {
            inner: Arc::new(PeerRecord {
                index: state.peers.len(),
                settings: settings.clone(),
                events,
                calls: Mutex::new(Vec::new()),
                released: Mutex::new(false),
            }),
        };
        state.peers.push(peer.clone());
        Ok(Box::new(MockPeerConnection {
            peer,
            factory: self.state.clone(),
        }))
    }
}

struct PeerRecord {
    index: usize,
    settings: RtcSettings,
    events: Arc<dyn PeerEvents>,
    calls: Mutex<Vec<MockCall>>,
    released: Mutex<bool>,
}

/// Test-side view of a created handle.
#[derive(Clone)]
pub struct MockPeer {
    inner: Arc<PeerRecord>,
}

impl MockPeer {
    pub fn settings(&self) -> RtcSettings {
        self.inner.settings.clone()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.calls.lock().clone()
    }

    pub fn is_released(&self) -> bool {
        *self.inner.released.lock()
    }

    /// The answer SDP this handle produces.
    pub fn answer_sdp(&self) -> String {
        format!("v=0 mock-answer-{}", self.inner.index)
    }

    /// Fire the events capability the session supplied, as the engine would.
    pub fn emit_candidate(&self, candidate: IceCandidate) {
        self.inner.events.local_candidate(candidate);
    }

    pub fn emit_state(&self, state: ConnectivityState) {
        self.inner.events.connectivity_state_changed(state);
    }
}

pub struct MockPeerConnection {
    peer: MockPeer,
    factory: Arc<Mutex<FactoryState>>,
}

impl MockPeerConnection {
    fn record(&self, call: MockCall) {
        self.peer.inner.calls.lock().push(call);
    }
}

impl PeerConnection for MockPeerConnection {
    fn apply_remote_offer(&self, sdp: String) -> BoxFuture<'static, Result<(), PeerError>> {
        self.record(MockCall::ApplyRemoteOffer(sdp));
        let result = if self.factory.lock().behavior.fail_offers {
            Err(PeerError::InvalidDescription("mock offer rejected".into()))
        } else {
            Ok(())
        };
        future::ready(result).boxed()
    }

    fn create_local_answer(&self) -> BoxFuture<'static, Result<String, PeerError>> {
        self.record(MockCall::CreateLocalAnswer);
        let sdp = self.peer.answer_sdp();
        let mut factory = self.factory.lock();
        if factory.behavior.fail_answers {
            return future::ready(Err(PeerError::Engine("mock answer failed".into()))).boxed();
        }
        if factory.behavior.hold_answers {
            let (tx, rx) = oneshot::channel();
            factory.held_answers.push_back((sdp, tx));
            return async move { rx.await.unwrap_or(Err(PeerError::Closed)) }.boxed();
        }
        future::ready(Ok(sdp)).boxed()
    }

    fn apply_remote_answer(&self, sdp: String) -> BoxFuture<'static, Result<(), PeerError>> {
        self.record(MockCall::ApplyRemoteAnswer(sdp));
        future::ready(Ok(())).boxed()
    }

    fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> BoxFuture<'static, Result<(), PeerError>> {
        let result = if candidate.candidate.is_empty() {
            Err(PeerError::InvalidCandidate("empty candidate".into()))
        } else {
            Ok(())
        };
        self.record(MockCall::AddRemoteCandidate(candidate));
        future::ready(result).boxed()
    }
}

impl Drop for MockPeerConnection {
    fn drop(&mut self) {
        *self.peer.inner.released.lock() = true;
    }
}
