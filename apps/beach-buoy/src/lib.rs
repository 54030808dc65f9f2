//! WebRTC signaling over WebSocket.
//!
//! Each accepted WebSocket gets a [`session::SignalingSession`] that answers
//! remote offers through a [`peer::PeerConnectionFactory`], trades ICE
//! candidates, and pings registered clients that have gone quiet.

pub mod config;
pub mod error;
pub mod mock;
pub mod observer;
pub mod peer;
pub mod protocol;
pub mod rtc;
pub mod server;
pub mod session;
pub mod telemetry;
pub mod watchdog;
