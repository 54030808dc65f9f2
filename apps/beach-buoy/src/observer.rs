use std::fmt;

use metrics::{counter, decrement_gauge, increment_counter, increment_gauge};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::PeerError;
use crate::peer::ConnectivityState;
use crate::protocol::Discard;

/// Engine operation that failed during negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationStage {
    CreatePeerConnection,
    ApplyRemoteOffer,
    CreateLocalAnswer,
    ApplyRemoteAnswer,
    AddRemoteCandidate,
}

impl NegotiationStage {
    pub fn label(&self) -> &'static str {
        match self {
            NegotiationStage::CreatePeerConnection => "create_peer_connection",
            NegotiationStage::ApplyRemoteOffer => "apply_remote_offer",
            NegotiationStage::CreateLocalAnswer => "create_local_answer",
            NegotiationStage::ApplyRemoteAnswer => "apply_remote_answer",
            NegotiationStage::AddRemoteCandidate => "add_remote_candidate",
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The peer closed the socket or the stream ended.
    Graceful,
    /// A read failed.
    Fault,
}

/// Structured sink for everything worth recording about one session.
///
/// The session calls it at its boundaries (frame in, frame out, engine result,
/// transport fault) and never logs on its own. All methods default to no-ops.
pub trait SessionObserver: Send + Sync {
    fn opened(&self) {}
    fn message_received(&self, _kind: &'static str) {}
    fn message_discarded(&self, _reason: Discard) {}
    fn message_sent(&self, _kind: &'static str) {}
    fn registered(&self) {}
    fn peer_connection_created(&self) {}
    fn peer_connection_released(&self) {}
    fn connectivity_changed(&self, _from: ConnectivityState, _to: ConnectivityState) {}
    fn negotiation_failed(&self, _stage: NegotiationStage, _error: &PeerError) {}
    fn transport_fault(&self, _stage: &'static str, _error: &dyn fmt::Display) {}
    fn closed(&self, _reason: CloseReason) {}
}

/// Observer that reports through `tracing` and the `metrics` recorder.
pub struct TracingObserver {
    session_id: Uuid,
}

impl TracingObserver {
    pub fn new(session_id: Uuid) -> Self {
        Self { session_id }
    }
}

impl SessionObserver for TracingObserver {
    fn opened(&self) {
        increment_gauge!("beach_buoy_sessions_active", 1.0);
        increment_counter!("beach_buoy_sessions_total");
        info!(session_id = %self.session_id, "signaling session opened");
    }

    fn message_received(&self, kind: &'static str) {
        increment_counter!("beach_buoy_messages_received_total", "type" => kind);
        debug!(session_id = %self.session_id, kind, "message received");
    }

    fn message_discarded(&self, reason: Discard) {
        increment_counter!(
            "beach_buoy_messages_discarded_total",
            "reason" => reason.label()
        );
        debug!(session_id = %self.session_id, ?reason, "message discarded");
    }

    fn message_sent(&self, kind: &'static str) {
        if kind == "ping" {
            increment_counter!("beach_buoy_pings_sent_total");
        }
        debug!(session_id = %self.session_id, kind, "message queued");
    }

    fn registered(&self) {
        info!(session_id = %self.session_id, "peer registered");
    }

    fn peer_connection_created(&self) {
        counter!("beach_buoy_peer_connections_created_total", 1);
        info!(session_id = %self.session_id, "peer connection created");
    }

    fn peer_connection_released(&self) {
        info!(session_id = %self.session_id, "peer connection released");
    }

    fn connectivity_changed(&self, from: ConnectivityState, to: ConnectivityState) {
        info!(
            session_id = %self.session_id,
            from = %from,
            to = %to,
            "ice connection state changed"
        );
    }

    fn negotiation_failed(&self, stage: NegotiationStage, error: &PeerError) {
        increment_counter!(
            "beach_buoy_negotiation_failures_total",
            "stage" => stage.label()
        );
        warn!(
            session_id = %self.session_id,
            stage = stage.label(),
            error = %error,
            "negotiation step failed"
        );
    }

    fn transport_fault(&self, stage: &'static str, error: &dyn fmt::Display) {
        increment_counter!("beach_buoy_transport_faults_total", "stage" => stage);
        warn!(
            session_id = %self.session_id,
            stage,
            error = %error,
            "websocket transport fault"
        );
    }

    fn closed(&self, reason: CloseReason) {
        decrement_gauge!("beach_buoy_sessions_active", 1.0);
        info!(session_id = %self.session_id, ?reason, "signaling session closed");
    }
}
