//! Boundary between the signaling session and the peer-connection engine.
//!
//! The session never sees the engine itself. It creates handles through a
//! [`PeerConnectionFactory`], drives them through [`PeerConnection`], and hears
//! back through the [`PeerEvents`] capability it hands to the factory.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::PeerError;
pub use crate::protocol::IceCandidate;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// ICE connectivity of a peer connection, in the engine's ordinal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectivityState {
    #[default]
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl ConnectivityState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectivityState::New => "new",
            ConnectivityState::Checking => "checking",
            ConnectivityState::Connected => "connected",
            ConnectivityState::Completed => "completed",
            ConnectivityState::Failed => "failed",
            ConnectivityState::Disconnected => "disconnected",
            ConnectivityState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable per-server settings handed to every new peer connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcSettings {
    /// Include the public discovery server. When false no ICE servers are
    /// configured at all and only local candidates are gathered.
    pub use_default_discovery_server: bool,
    pub discovery_server_url: String,
}

impl RtcSettings {
    pub fn ice_server_urls(&self) -> Vec<String> {
        if self.use_default_discovery_server {
            vec![self.discovery_server_url.clone()]
        } else {
            Vec::new()
        }
    }
}

impl Default for RtcSettings {
    fn default() -> Self {
        Self {
            use_default_discovery_server: true,
            discovery_server_url: DEFAULT_STUN_URL.to_string(),
        }
    }
}

/// Events a peer connection pushes back to whoever created it.
///
/// Implementations must tolerate being called after their session is gone.
pub trait PeerEvents: Send + Sync + 'static {
    fn connectivity_state_changed(&self, state: ConnectivityState);
    fn local_candidate(&self, candidate: IceCandidate);
}

/// One negotiated (or negotiating) media session.
///
/// Operations are applied in the order they are issued. The returned futures
/// do not borrow the handle, so the caller may keep reading while they run.
/// Dropping the handle releases the underlying connection.
pub trait PeerConnection: Send {
    fn apply_remote_offer(&self, sdp: String) -> BoxFuture<'static, Result<(), PeerError>>;

    /// Produce the local answer SDP. Only meaningful after a remote offer was
    /// applied successfully.
    fn create_local_answer(&self) -> BoxFuture<'static, Result<String, PeerError>>;

    fn apply_remote_answer(&self, sdp: String) -> BoxFuture<'static, Result<(), PeerError>>;

    fn add_remote_candidate(
        &self,
        candidate: IceCandidate,
    ) -> BoxFuture<'static, Result<(), PeerError>>;
}

/// Shared, stateless constructor of peer connections.
pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        settings: &RtcSettings,
        events: Arc<dyn PeerEvents>,
    ) -> Result<Box<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn discovery_server_is_optional() {
        let settings = RtcSettings::default();
        assert_eq!(settings.ice_server_urls(), vec![DEFAULT_STUN_URL.to_string()]);

        let local_only = RtcSettings {
            use_default_discovery_server: false,
            ..RtcSettings::default()
        };
        assert!(local_only.ice_server_urls().is_empty());
    }

    #[test_timeout::timeout]
    fn connectivity_state_labels() {
        assert_eq!(ConnectivityState::default(), ConnectivityState::New);
        assert_eq!(ConnectivityState::Disconnected.to_string(), "disconnected");
    }
}
