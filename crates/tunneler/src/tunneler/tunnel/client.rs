use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{
    client::IntoClientRequest,
    http::{HeaderValue, header::AUTHORIZATION},
};

use crate::tunneler::{
    net::TunnelSpec,
    tunnel::{
        endpoint::{Endpoint, EndpointOptions},
        protocol::{Message, TunnelRequest},
        transport::{Transport, ws},
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub mux: EndpointOptions,
}

/// Which side listens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelKind {
    /// `-L`: listen here, connect from the server.
    Local,
    /// `-R`: listen on the server, connect from here.
    Remote,
}

/// Opens the WebSocket transport to the server.
pub async fn connect(opts: &ClientOptions) -> anyhow::Result<Transport> {
    let mut req = opts
        .server_url
        .as_str()
        .into_client_request()
        .with_context(|| format!("client: bad server url {}", opts.server_url))?;

    if let Some(token) = opts.token.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        req.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).context("client: bad token")?,
        );
    }

    let (stream, _resp) = tokio::time::timeout(opts.connect_timeout, tokio_tungstenite::connect_async(req))
        .await
        .with_context(|| {
            format!(
                "client: connect to {} timed out after {}",
                opts.server_url,
                humantime::format_duration(opts.connect_timeout)
            )
        })?
        .with_context(|| format!("client: connect to {}", opts.server_url))?;

    tracing::info!(server = %opts.server_url, "client: connected");
    Ok(ws::from_tungstenite(stream))
}

/// Builds the local half of the tunnel and performs the handshake. On failure the
/// endpoint is shut down before returning.
pub async fn open_tunnel(
    transport: Transport,
    kind: TunnelKind,
    spec: &TunnelSpec,
    mux: EndpointOptions,
) -> anyhow::Result<(Endpoint, TunnelRequest)> {
    let proto = spec.protocol;

    let (ep, request) = match kind {
        TunnelKind::Remote => {
            tracing::debug!(tunnel = %spec, "client: creating remote tunnel");
            let ep = Endpoint::dial(transport, proto, &spec.connect, mux)?;
            (
                ep,
                Message::CreateRemoteTunnel(TunnelRequest::new(proto.as_str(), spec.bind.clone())),
            )
        }
        TunnelKind::Local => {
            tracing::debug!(tunnel = %spec, "client: creating local tunnel");
            let ep = Endpoint::listen(transport, proto, &spec.bind, mux).await?;
            (
                ep,
                Message::CreateLocalTunnel(TunnelRequest::new(proto.as_str(), spec.connect.clone())),
            )
        }
    };

    match handshake(&ep, kind, request).await {
        Ok(ready) => Ok((ep, ready)),
        Err(err) => {
            ep.shutdown().await;
            Err(err)
        }
    }
}

async fn handshake(
    ep: &Endpoint,
    kind: TunnelKind,
    request: Message,
) -> anyhow::Result<TunnelRequest> {
    ep.send_control(request).await?;

    let reply = ep
        .next_control()
        .await
        .context("client: connection closed during handshake")?;

    match (kind, reply) {
        (TunnelKind::Remote, Message::RemoteTunnelReady(r))
        | (TunnelKind::Local, Message::LocalTunnelReady(r)) => Ok(r),
        (_, Message::Error { description }) => anyhow::bail!("{description}"),
        (_, other) => {
            tracing::debug!(kind = ?other.kind(), "client: unexpected handshake reply");
            anyhow::bail!("protocol mismatch")
        }
    }
}

/// Connects, opens one tunnel and relays until the endpoint completes or `shutdown` fires.
pub async fn run(
    opts: &ClientOptions,
    kind: TunnelKind,
    spec: &TunnelSpec,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let transport = connect(opts).await?;
    let (ep, ready) = open_tunnel(transport, kind, spec, opts.mux.clone()).await?;

    match kind {
        TunnelKind::Remote => {
            tracing::info!(addr = %format!("{}://{}", ready.protocol, ready.service), "client: remote tunnel bound")
        }
        TunnelKind::Local => {
            tracing::info!(addr = %format!("{}://{}", ready.protocol, spec.bind), upstream = %ready.service, "client: local tunnel bound")
        }
    }

    tokio::select! {
        _ = ep.wait() => {
            tracing::info!("client: tunnel closed by peer");
        }
        _ = stopped(&mut shutdown) => {
            tracing::info!("client: shutting down");
            ep.shutdown().await;
        }
    }

    Ok(())
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|s| *s).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::{TcpListener, TcpStream},
    };

    use super::*;
    use crate::tunneler::{
        auth::TokenAuthority,
        tunnel::{
            protocol::Protocol,
            server::{self, ServerOptions, ServerState},
        },
    };

    const WAIT: Duration = Duration::from_secs(5);
    const SECRET: &str = "test-secret";

    async fn start_server(allow_anonymous: bool) -> (String, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let state = ServerState {
            opts: Arc::new(ServerOptions {
                path: "/ws".into(),
                allow_anonymous,
                mux: EndpointOptions::default(),
            }),
            auth: Arc::new(TokenAuthority::new(Some(SECRET))),
            prometheus: None,
            shutdown: rx,
        };
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}/ws", ln.local_addr().unwrap());
        tokio::spawn(server::serve(ln, state));
        (url, tx)
    }

    fn options(url: String, token: Option<String>) -> ClientOptions {
        ClientOptions {
            server_url: url,
            token,
            connect_timeout: WAIT,
            mux: EndpointOptions::default(),
        }
    }

    fn valid_token() -> String {
        TokenAuthority::new(Some(SECRET)).issue("tester", 1).unwrap()
    }

    async fn echo_server() -> String {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = ln.accept().await {
                tokio::spawn(async move {
                    let (mut r, mut w) = sock.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                    let _ = w.shutdown().await;
                });
            }
        });
        addr
    }

    // The tunnel closes a client on its repeated local EOF, so the socket stays open
    // until the echo is back.
    async fn roundtrip(addr: &str, msg: &[u8]) -> Vec<u8> {
        let (mut rd, mut wr) = TcpStream::connect(addr).await.unwrap().into_split();
        let out = msg.to_vec();
        let writer = tokio::spawn(async move {
            wr.write_all(&out).await.unwrap();
            wr
        });
        let mut got = vec![0u8; msg.len()];
        tokio::time::timeout(WAIT, rd.read_exact(&mut got))
            .await
            .unwrap()
            .unwrap();
        let _ = writer.await;
        got
    }

    #[tokio::test]
    async fn remote_tunnel_relays_through_server() {
        let (url, _stop) = start_server(false).await;
        let echo = echo_server().await;

        let spec = TunnelSpec::parse(Protocol::Tcp, &format!("127.0.0.1:0:{echo}")).unwrap();
        let transport = connect(&options(url, Some(valid_token()))).await.unwrap();
        let (_ep, ready) = open_tunnel(transport, TunnelKind::Remote, &spec, EndpointOptions::default())
            .await
            .unwrap();

        assert_eq!(roundtrip(&ready.service, b"over the wire").await, b"over the wire");
    }

    #[tokio::test]
    async fn local_tunnel_relays_through_server() {
        let (url, _stop) = start_server(false).await;
        let echo = echo_server().await;

        let spec = TunnelSpec::parse(Protocol::Tcp, &format!("127.0.0.1:0:{echo}")).unwrap();
        let transport = connect(&options(url, Some(valid_token()))).await.unwrap();
        let (ep, ready) = open_tunnel(transport, TunnelKind::Local, &spec, EndpointOptions::default())
            .await
            .unwrap();
        assert_eq!(ready.service, echo);

        let local = ep.local_addr().unwrap().to_string();
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(roundtrip(&local, &payload).await, payload);
    }

    #[tokio::test]
    async fn missing_or_bad_token_is_refused() {
        let (url, _stop) = start_server(false).await;
        assert!(connect(&options(url.clone(), None)).await.is_err());

        let forged = TokenAuthority::new(Some("other")).issue("mallory", 1).unwrap();
        assert!(connect(&options(url, Some(forged))).await.is_err());
    }

    #[tokio::test]
    async fn anonymous_server_accepts_without_token() {
        let (url, _stop) = start_server(true).await;
        assert!(connect(&options(url, None)).await.is_ok());
    }

    #[tokio::test]
    async fn server_error_fails_handshake() {
        let (url, _stop) = start_server(false).await;
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let spec = TunnelSpec::parse(
            Protocol::Tcp,
            &format!("{}:127.0.0.1:1", taken.local_addr().unwrap()),
        )
        .unwrap();
        let transport = connect(&options(url, Some(valid_token()))).await.unwrap();
        let err = open_tunnel(transport, TunnelKind::Remote, &spec, EndpointOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bind"), "{err:#}");
    }

    #[tokio::test]
    async fn run_returns_when_shutdown_fires() {
        let (url, _stop) = start_server(false).await;
        let spec = TunnelSpec::parse(Protocol::Tcp, "127.0.0.1:0:127.0.0.1:1").unwrap();
        let opts = options(url, Some(valid_token()));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(async move { run(&opts, TunnelKind::Local, &spec, rx).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        tx.send_replace(true);
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap().unwrap();
    }
}
