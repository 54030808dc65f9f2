use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ensure, Context};
use clap::Parser;

use crate::peer::{RtcSettings, DEFAULT_STUN_URL};
use crate::session::SessionConfig;

#[derive(Debug, Parser)]
#[command(
    name = "beach-buoy",
    author,
    version,
    about = "WebRTC signaling endpoint over WebSocket"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(long, env = "BEACH_BUOY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,

    /// Route serving the signaling WebSocket.
    #[arg(long, env = "BEACH_BUOY_WS_PATH", default_value = "/ws")]
    pub ws_path: String,

    /// Do not configure any STUN server; gather host candidates only.
    #[arg(long, env = "BEACH_BUOY_NO_GOOGLE_STUN", default_value_t = false)]
    pub no_google_stun: bool,

    /// STUN server used unless --no-google-stun is set.
    #[arg(long, env = "BEACH_BUOY_STUN_URL", default_value = DEFAULT_STUN_URL)]
    pub stun_url: String,

    /// Seconds of inbound silence after `register` before a ping is sent.
    #[arg(long, env = "BEACH_BUOY_PING_INTERVAL_SECS", default_value_t = 30)]
    pub ping_interval_secs: u64,

    /// Directory of static files served at `/`.
    #[arg(long, env = "BEACH_BUOY_DOCUMENT_ROOT")]
    pub document_root: Option<PathBuf>,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_BUOY_SHUTDOWN_GRACE_SECS", default_value_t = 2)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub ws_path: String,
    pub session: SessionConfig,
    pub document_root: Option<PathBuf>,
    pub shutdown_grace: Duration,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        ensure!(
            cli.ws_path.starts_with('/'),
            "websocket path must start with '/': {}",
            cli.ws_path
        );
        ensure!(
            cli.ping_interval_secs > 0,
            "ping interval must be at least one second"
        );

        Ok(ServerConfig {
            listen_addr,
            ws_path: cli.ws_path,
            session: SessionConfig {
                rtc: RtcSettings {
                    use_default_discovery_server: !cli.no_google_stun,
                    discovery_server_url: cli.stun_url,
                },
                ping_interval: Duration::from_secs(cli.ping_interval_secs),
            },
            document_root: cli.document_root,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> anyhow::Result<ServerConfig> {
        let cli = Cli::try_parse_from(std::iter::once("beach-buoy").chain(args.iter().copied()))?;
        ServerConfig::try_from(cli)
    }

    #[test_timeout::timeout]
    fn defaults_match_classic_deployment() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(config.ws_path, "/ws");
        assert_eq!(config.session.ping_interval, Duration::from_secs(30));
        assert!(config.session.rtc.use_default_discovery_server);
        assert_eq!(config.session.rtc.discovery_server_url, DEFAULT_STUN_URL);
        assert!(config.document_root.is_none());
    }

    #[test_timeout::timeout]
    fn no_google_stun_disables_discovery() {
        let config = parse(&["--no-google-stun"]).unwrap();
        assert!(config.session.rtc.ice_server_urls().is_empty());
    }

    #[test_timeout::timeout]
    fn rejects_bad_values() {
        assert!(parse(&["--listen-addr", "not-an-addr"]).is_err());
        assert!(parse(&["--ping-interval-secs", "0"]).is_err());
        assert!(parse(&["--ws-path", "ws"]).is_err());
    }
}
