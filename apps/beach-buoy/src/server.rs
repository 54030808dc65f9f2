//! HTTP surface: the signaling WebSocket plus health, metrics and static files.

use std::future::{self, Future};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{stream::SplitStream, SinkExt, Stream, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

use crate::error::ServerError;
use crate::observer::{SessionObserver, TracingObserver};
use crate::peer::PeerConnectionFactory;
use crate::protocol::OutboundMessage;
use crate::session::{ReadError, SessionConfig, SignalingSession};

/// Everything the router needs besides the listener.
pub struct AppConfig {
    pub ws_path: String,
    pub session: SessionConfig,
    pub document_root: Option<PathBuf>,
}

struct AppState {
    factory: Arc<dyn PeerConnectionFactory>,
    session: SessionConfig,
    metrics: PrometheusHandle,
}

pub fn router(
    config: AppConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    metrics: PrometheusHandle,
) -> Router {
    let state = Arc::new(AppState {
        factory,
        session: config.session,
        metrics,
    });

    let router = Router::new()
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route(&config.ws_path, get(ws_handler))
        .with_state(state);

    let router = match config.document_root {
        Some(root) => router.fallback_service(ServeDir::new(root)),
        None => router,
    };
    router.layer(TraceLayer::new_for_http())
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve until `shutdown` resolves. Open sessions are not awaited.
pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(ServerError::Serve)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_handler(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let session_id = Uuid::new_v4();
    let observer: Arc<dyn SessionObserver> = Arc::new(TracingObserver::new(session_id));
    let failed = observer.clone();

    ws.on_failed_upgrade(move |err| failed.transport_fault("accept", &err))
        .on_upgrade(move |socket| {
            handle_connection(socket, state, observer)
                .instrument(info_span!("session", session_id = %session_id))
        })
}

async fn handle_connection(
    socket: WebSocket,
    state: Arc<AppState>,
    observer: Arc<dyn SessionObserver>,
) {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<OutboundMessage>();

    let writer_observer = observer.clone();
    let writer = tokio::spawn(
        async move {
            while let Some(message) = rx.recv().await {
                let text = match message.to_text() {
                    Ok(text) => text,
                    Err(err) => {
                        writer_observer.transport_fault("encode", &err);
                        continue;
                    }
                };
                if let Err(err) = sender.send(Message::Text(text)).await {
                    writer_observer.transport_fault("write", &err);
                    break;
                }
            }
            let _ = sender.close().await;
        }
        .in_current_span(),
    );

    let session = SignalingSession::new(state.session.clone(), state.factory.clone(), tx, observer);
    let reason = session.run(inbound_frames(receiver)).await;
    debug!(?reason, "session loop finished");

    // The session dropped its sender; the writer drains what is queued and exits.
    let _ = writer.await;
}

/// Completed reads as the session consumes them. Control frames are handled
/// by the WebSocket layer and never reach the session.
fn inbound_frames(
    receiver: SplitStream<WebSocket>,
) -> impl Stream<Item = Result<String, ReadError>> + Unpin {
    receiver.filter_map(|frame| {
        future::ready(match frame {
            Ok(Message::Text(text)) => Some(Ok(text)),
            Ok(Message::Binary(bytes)) => Some(Ok(String::from_utf8_lossy(&bytes).into_owned())),
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
            Ok(Message::Close(_)) => Some(Err(ReadError::Closed)),
            Err(err) => Some(Err(ReadError::Fault(err.to_string()))),
        })
    })
}
