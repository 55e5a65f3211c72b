//! WebSocket responder: authenticates the upgrade, answers the tunnel handshake, and runs
//! one mux endpoint per connection until it completes.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::trace::TraceLayer;

use crate::tunneler::{
    auth::{ANONYMOUS_USER, TokenAuthority},
    telemetry::SharedPrometheusHandle,
    tunnel::{
        endpoint::{self, Endpoint, EndpointOptions},
        protocol::{Message, Protocol, TunnelRequest},
        transport::{Transport, ws},
    },
};

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub path: String,
    pub allow_anonymous: bool,
    pub mux: EndpointOptions,
}

#[derive(Clone)]
pub struct ServerState {
    pub opts: Arc<ServerOptions>,
    pub auth: Arc<TokenAuthority>,
    pub prometheus: Option<SharedPrometheusHandle>,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: ServerState) -> Router {
    let path = state.opts.path.clone();
    Router::new()
        .route(&path, get(upgrade))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn serve(listener: TcpListener, state: ServerState) -> anyhow::Result<()> {
    let mut shutdown = state.shutdown.clone();
    let app = router(state);

    tracing::info!(addr = %listener.local_addr()?, "server: listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { stopped(&mut shutdown).await })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { ok: true }))
}

async fn metrics(State(st): State<ServerState>) -> Response {
    match &st.prometheus {
        Some(h) => (StatusCode::OK, h.render()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn upgrade(State(st): State<ServerState>, headers: HeaderMap, ws: WebSocketUpgrade) -> Response {
    let header = headers.get(AUTHORIZATION).and_then(|v| v.to_str().ok());

    let user = if st.opts.allow_anonymous && header.is_none() {
        ANONYMOUS_USER.to_string()
    } else {
        match st.auth.authorize(header) {
            Ok(claims) => claims.sub,
            Err(err) => {
                tracing::warn!(err = %err, "server: authorization failed");
                return (StatusCode::UNAUTHORIZED, "authorization failed").into_response();
            }
        }
    };

    let mux = st.opts.mux.clone();
    let shutdown = st.shutdown.clone();
    ws.on_upgrade(move |socket| async move {
        let transport = ws::from_axum(socket);
        if let Err(err) = handle_tunnel(transport, &user, mux, shutdown).await {
            tracing::warn!(user = %user, err = %err, "server: tunnel ended with error");
        }
    })
}

/// Answers the first frame of a fresh transport and drives the resulting endpoint.
pub async fn handle_tunnel(
    mut transport: Transport,
    user: &str,
    mux: EndpointOptions,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let first = transport.reader.read_frame().await?;
    tracing::trace!(user = %user, kind = ?first.kind(), "server: handshake frame");

    let ep = match first {
        Message::CreateLocalTunnel(req) => {
            tracing::debug!(user = %user, service = %req.service, "server: client asks for a local tunnel");
            let proto = match parse_protocol(&req) {
                Ok(p) => p,
                Err(err) => return reject(transport, err).await,
            };
            let ep = Endpoint::dial(transport, proto, &req.service, mux)?;
            ep.send_control(Message::LocalTunnelReady(TunnelRequest::new(
                proto.as_str(),
                req.service.clone(),
            )))
            .await?;
            tracing::info!(user = %user, upstream = %req.service, "server: local tunnel ready");
            ep
        }
        Message::CreateRemoteTunnel(req) => {
            tracing::debug!(user = %user, service = %req.service, "server: client asks for a remote tunnel");
            let proto = match parse_protocol(&req) {
                Ok(p) => p,
                Err(err) => return reject(transport, err).await,
            };
            let ln = match endpoint::bind(&req.service).await {
                Ok(ln) => ln,
                Err(err) => return reject(transport, err).await,
            };
            let ep = Endpoint::with_listener(transport, ln, mux)?;
            let bound = ep
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|| req.service.clone());
            ep.send_control(Message::RemoteTunnelReady(TunnelRequest::new(
                proto.as_str(),
                bound.clone(),
            )))
            .await?;
            tracing::info!(user = %user, addr = %bound, "server: remote tunnel ready");
            ep
        }
        other => {
            tracing::warn!(user = %user, kind = ?other.kind(), "server: unexpected handshake frame");
            return reject(transport, "protocol mismatch").await;
        }
    };

    loop {
        tokio::select! {
            m = ep.next_control() => match m {
                Some(m) => tracing::debug!(user = %user, kind = ?m.kind(), "server: ignoring control frame"),
                None => break,
            },
            _ = stopped(&mut shutdown) => {
                ep.shutdown().await;
                break;
            }
        }
    }

    tracing::debug!(user = %user, "server: tunnel done");
    Ok(())
}

fn parse_protocol(req: &TunnelRequest) -> anyhow::Result<Protocol> {
    let proto: Protocol = req.protocol.parse()?;
    endpoint::check_protocol(proto)?;
    Ok(proto)
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

async fn reject(mut transport: Transport, err: impl std::fmt::Display) -> anyhow::Result<()> {
    tracing::warn!(err = %err, "server: handshake rejected");
    transport.writer.write_frame(&Message::error(&err)).await?;
    transport.writer.close().await;
    Ok(())
}
