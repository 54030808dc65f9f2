//! Peer connections backed by the `webrtc` crate.
//!
//! Each handle owns a worker task that holds the `RTCPeerConnection` and
//! applies commands strictly in the order they were issued. Dropping the
//! handle closes the command queue, after which the worker closes the
//! connection and exits.

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::error::PeerError;
use crate::peer::{
    ConnectivityState, IceCandidate, PeerConnection, PeerConnectionFactory, PeerEvents,
    RtcSettings,
};

type Reply<T> = oneshot::Sender<Result<T, PeerError>>;

enum Command {
    ApplyRemoteOffer(String, Reply<()>),
    CreateLocalAnswer(Reply<String>),
    ApplyRemoteAnswer(String, Reply<()>),
    AddRemoteCandidate(IceCandidate, Reply<()>),
}

impl Command {
    fn fail(self, err: PeerError) {
        match self {
            Command::ApplyRemoteOffer(_, reply)
            | Command::ApplyRemoteAnswer(_, reply)
            | Command::AddRemoteCandidate(_, reply) => {
                let _ = reply.send(Err(err));
            }
            Command::CreateLocalAnswer(reply) => {
                let _ = reply.send(Err(err));
            }
        }
    }
}

/// Factory sharing one configured `webrtc` API across all connections.
#[derive(Clone)]
pub struct RtcPeerFactory {
    api: Arc<API>,
}

impl RtcPeerFactory {
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api: Arc::new(api) })
    }
}

impl PeerConnectionFactory for RtcPeerFactory {
    fn create(
        &self,
        settings: &RtcSettings,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Box<dyn PeerConnection>, PeerError> {
        let runtime = Handle::try_current().map_err(engine_error)?;
        let config = rtc_configuration(settings);
        let (commands, queue) = mpsc::unbounded_channel();
        runtime.spawn(run_worker(self.api.clone(), config, events, queue));
        Ok(Box::new(RtcPeerConnection { commands }))
    }
}

fn rtc_configuration(settings: &RtcSettings) -> RTCConfiguration {
    let urls = settings.ice_server_urls();
    let ice_servers = if urls.is_empty() {
        Vec::new()
    } else {
        vec![RTCIceServer {
            urls,
            ..Default::default()
        }]
    };
    RTCConfiguration {
        ice_servers,
        ..Default::default()
    }
}

async fn run_worker(
    api: Arc<API>,
    config: RTCConfiguration,
    events: Arc<dyn PeerEvents>,
    mut queue: mpsc::UnboundedReceiver<Command>,
) {
    let connection = match api.new_peer_connection(config).await {
        Ok(connection) => Arc::new(connection),
        Err(err) => {
            let err = engine_error(err);
            while let Some(command) = queue.recv().await {
                command.fail(err.clone());
            }
            return;
        }
    };
    attach_events(&connection, events);

    while let Some(command) = queue.recv().await {
        match command {
            Command::ApplyRemoteOffer(sdp, reply) => {
                let offer = RTCSessionDescription::offer(sdp);
                let _ = reply.send(apply_remote(&connection, offer).await);
            }
            Command::CreateLocalAnswer(reply) => {
                let _ = reply.send(create_local_answer(&connection).await);
            }
            Command::ApplyRemoteAnswer(sdp, reply) => {
                let answer = RTCSessionDescription::answer(sdp);
                let _ = reply.send(apply_remote(&connection, answer).await);
            }
            Command::AddRemoteCandidate(candidate, reply) => {
                let _ = reply.send(add_remote_candidate(&connection, candidate).await);
            }
        }
    }

    if let Err(err) = connection.close().await {
        debug!(error = %err, "peer connection close failed");
    }
}

fn attach_events(connection: &RTCPeerConnection, events: Arc<dyn PeerEvents>) {
    let candidate_events = events.clone();
    connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else {
                return;
            };
            match candidate.to_json() {
                Ok(init) => events.local_candidate(local_candidate(init)),
                Err(err) => debug!(error = %err, "dropping unserializable local candidate"),
            }
        })
    }));

    connection.on_ice_connection_state_change(Box::new(move |state: RTCIceConnectionState| {
        events.connectivity_state_changed(connectivity_state(state));
        Box::pin(async {})
    }));
}

/// Engine candidates may omit the media line; the wire format always has one.
fn local_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid.unwrap_or_default(),
        sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
    }
}

fn connectivity_state(state: RTCIceConnectionState) -> ConnectivityState {
    match state {
        RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => ConnectivityState::New,
        RTCIceConnectionState::Checking => ConnectivityState::Checking,
        RTCIceConnectionState::Connected => ConnectivityState::Connected,
        RTCIceConnectionState::Completed => ConnectivityState::Completed,
        RTCIceConnectionState::Failed => ConnectivityState::Failed,
        RTCIceConnectionState::Disconnected => ConnectivityState::Disconnected,
        RTCIceConnectionState::Closed => ConnectivityState::Closed,
    }
}

async fn apply_remote(
    connection: &RTCPeerConnection,
    description: Result<RTCSessionDescription, webrtc::Error>,
) -> Result<(), PeerError> {
    let description = description.map_err(description_error)?;
    connection
        .set_remote_description(description)
        .await
        .map_err(description_error)
}

async fn create_local_answer(connection: &RTCPeerConnection) -> Result<String, PeerError> {
    let answer = connection.create_answer(None).await.map_err(engine_error)?;
    let sdp = answer.sdp.clone();
    connection
        .set_local_description(answer)
        .await
        .map_err(engine_error)?;
    Ok(sdp)
}

async fn add_remote_candidate(
    connection: &RTCPeerConnection,
    candidate: IceCandidate,
) -> Result<(), PeerError> {
    let init = RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: Some(candidate.sdp_mid),
        sdp_mline_index: Some(candidate.sdp_mline_index),
        username_fragment: None,
    };
    connection
        .add_ice_candidate(init)
        .await
        .map_err(|err| PeerError::InvalidCandidate(err.to_string()))
}

fn engine_error(err: impl std::fmt::Display) -> PeerError {
    PeerError::Engine(err.to_string())
}

fn description_error(err: webrtc::Error) -> PeerError {
    PeerError::InvalidDescription(err.to_string())
}

struct RtcPeerConnection {
    commands: mpsc::UnboundedSender<Command>,
}

impl RtcPeerConnection {
    fn request<T: Send + 'static>(
        &self,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> BoxFuture<'static, Result<T, PeerError>> {
        let (reply, response) = oneshot::channel();
        // A closed queue drops the reply sender, which resolves to `Closed`.
        let _ = self.commands.send(command(reply));
        async move { response.await.unwrap_or(Err(PeerError::Closed)) }.boxed()
    }
}

impl PeerConnection for RtcPeerConnection {
    fn apply_remote_offer(&self, sdp: String) -> BoxFuture<'static, Result<(), PeerError>> {
        self.request(|reply| Command::ApplyRemoteOffer(sdp, reply))
    }

    fn create_local_answer(&self) -> BoxFuture<'static, Result<String, PeerError>> {
        self.request(Command::CreateLocalAnswer)
    }

    fn apply_remote_answer(&self, sdp: String) -> BoxFuture<'static, Result<(), PeerError>> {
        self.request(|reply| Command::ApplyRemoteAnswer(sdp, reply))
    }

    fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> BoxFuture<'static, Result<(), PeerError>> {
        self.request(|reply| Command::AddRemoteCandidate(candidate, reply))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn configuration_follows_discovery_setting() {
        let config = rtc_configuration(&RtcSettings::default());
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(
            config.ice_servers[0].urls,
            vec![crate::peer::DEFAULT_STUN_URL.to_string()]
        );

        let local_only = rtc_configuration(&RtcSettings {
            use_default_discovery_server: false,
            ..RtcSettings::default()
        });
        assert!(local_only.ice_servers.is_empty());
    }

    #[test_timeout::timeout]
    fn local_candidate_fills_missing_media_line() {
        let bare = local_candidate(RTCIceCandidateInit {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.7 40000 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        });
        assert_eq!(bare.sdp_mid, "");
        assert_eq!(bare.sdp_mline_index, 0);

        let full = local_candidate(RTCIceCandidateInit {
            candidate: "candidate:2 1 udp 2130706431 10.0.0.7 40001 typ host".into(),
            sdp_mid: Some("data".into()),
            sdp_mline_index: Some(2),
            username_fragment: Some("ufrag".into()),
        });
        assert_eq!(
            full,
            IceCandidate {
                candidate: "candidate:2 1 udp 2130706431 10.0.0.7 40001 typ host".into(),
                sdp_mid: "data".into(),
                sdp_mline_index: 2,
            }
        );
    }

    #[test_timeout::timeout]
    fn unspecified_state_reads_as_new() {
        assert_eq!(
            connectivity_state(RTCIceConnectionState::Unspecified),
            ConnectivityState::New
        );
        assert_eq!(
            connectivity_state(RTCIceConnectionState::Disconnected),
            ConnectivityState::Disconnected
        );
    }
}
