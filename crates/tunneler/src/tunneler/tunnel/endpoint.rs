//! Mux endpoint: owns the shared transport and every client relayed over it.
//!
//! One endpoint type serves both tunnel directions. [`Mode::Listening`] accepts local
//! connections and numbers them; [`Mode::Dialing`] opens a connection to its target the
//! first time the peer sends bytes for an unseen client id. Everything else (framing,
//! queueing, half-close, teardown) is shared.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt, io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    sync::{Mutex, mpsc, watch},
};

use crate::tunneler::{
    net, telemetry,
    tunnel::{
        adapter::{Client, ClientHandle, Direction, HalfClose, MuxHandle},
        protocol::{Message, Protocol},
        transport::{FrameReader, FrameWriter, Transport},
    },
};

pub const DEFAULT_CHUNK_SIZE: usize = 40 * 1024;
pub const DEFAULT_OUTBOUND_QUEUE: usize = 10;
pub const DEFAULT_CONTROL_QUEUE: usize = 10;
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);
/// How many closed ids a dialing endpoint remembers.
const RETIRED_IDS: usize = 1024;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("unsupported protocol {0} (only tcp is relayed)")]
    UnsupportedProtocol(Protocol),
    #[error("bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("endpoint closed")]
    Closed,
}

#[derive(Debug, Clone)]
pub struct EndpointOptions {
    /// Largest payload read from a client socket in one call.
    pub chunk_size: usize,
    /// Capacity of the outbound frame queue; producers block when it is full.
    pub outbound_queue: usize,
    /// Capacity of the queue holding non-data frames for the handshake logic.
    pub control_queue: usize,
    /// Bound on the lazy dial performed in dialing mode.
    pub dial_timeout: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            control_queue: DEFAULT_CONTROL_QUEUE,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// How an endpoint obtains client sockets.
#[derive(Debug, Clone)]
pub enum Mode {
    /// Accepts connections on a bound socket.
    Listening { local_addr: SocketAddr },
    /// Dials `target` on demand.
    Dialing { target: String },
}

impl Mode {
    pub fn name(&self) -> &'static str {
        match self {
            Mode::Listening { .. } => "listening",
            Mode::Dialing { .. } => "dialing",
        }
    }
}

#[derive(Default)]
struct Registry {
    clients: HashMap<String, Arc<ClientHandle>>,
    // Ids the dialing side already tore down; late frames for them are dropped.
    retired: RetiredIds,
}

/// Most recently closed ids, oldest evicted first once `cap` is reached.
struct RetiredIds {
    order: VecDeque<String>,
    ids: HashSet<String>,
    cap: usize,
}

impl Default for RetiredIds {
    fn default() -> Self {
        Self::with_capacity(RETIRED_IDS)
    }
}

impl RetiredIds {
    fn with_capacity(cap: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(cap),
            ids: HashSet::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    fn insert(&mut self, id: &str) {
        if !self.ids.insert(id.to_string()) {
            return;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }

    fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Shared {
    mode: Mode,
    opts: EndpointOptions,
    registry: Mutex<Registry>,
    live: watch::Sender<bool>,
    done: watch::Sender<bool>,
    done_fired: AtomicBool,
    outbound: mpsc::Sender<Message>,
    control: mpsc::Sender<Message>,
}

/// A running mux endpoint. Cheap to clone; all clones drive the same endpoint.
#[derive(Clone)]
pub struct Endpoint {
    shared: Arc<Shared>,
    control_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("mode", &self.shared.mode)
            .field("live", &self.shared.is_live())
            .finish_non_exhaustive()
    }
}

impl Endpoint {
    /// Binds `service` and starts accepting clients. Fails if the bind fails.
    pub async fn listen(
        transport: Transport,
        protocol: Protocol,
        service: &str,
        opts: EndpointOptions,
    ) -> Result<Self, EndpointError> {
        check_protocol(protocol)?;
        let ln = bind(service).await?;
        Self::with_listener(transport, ln, opts)
    }

    /// Starts a listening endpoint on an already bound socket.
    pub fn with_listener(
        transport: Transport,
        ln: TcpListener,
        opts: EndpointOptions,
    ) -> Result<Self, EndpointError> {
        let local_addr = ln.local_addr().map_err(|source| EndpointError::Bind {
            addr: "listener".to_string(),
            source,
        })?;

        tracing::info!(addr = %local_addr, "endpoint: listening");

        Ok(Self::start(
            transport,
            Mode::Listening { local_addr },
            Some(ln),
            opts,
        ))
    }

    /// Starts an endpoint that dials `target` for every new client id the peer sends.
    pub fn dial(
        transport: Transport,
        protocol: Protocol,
        target: &str,
        opts: EndpointOptions,
    ) -> Result<Self, EndpointError> {
        check_protocol(protocol)?;

        tracing::info!(upstream = %target, protocol = %protocol, "endpoint: dialing on demand");

        Ok(Self::start(
            transport,
            Mode::Dialing {
                target: target.trim().to_string(),
            },
            None,
            opts,
        ))
    }

    fn start(
        transport: Transport,
        mode: Mode,
        listener: Option<TcpListener>,
        opts: EndpointOptions,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(opts.outbound_queue.max(1));
        let (control, control_rx) = mpsc::channel(opts.control_queue.max(1));
        let (live, _) = watch::channel(true);
        let (done, _) = watch::channel(false);

        let shared = Arc::new(Shared {
            mode,
            opts,
            registry: Mutex::new(Registry::default()),
            live,
            done,
            done_fired: AtomicBool::new(false),
            outbound,
            control,
        });

        let Transport { reader, writer } = transport;
        if let Some(ln) = listener {
            tokio::spawn(accept_loop(shared.clone(), ln));
        }
        tokio::spawn(writer_loop(shared.clone(), writer, outbound_rx));
        tokio::spawn(reader_loop(shared.clone(), reader));

        Self {
            shared,
            control_rx: Arc::new(Mutex::new(control_rx)),
        }
    }

    /// The bound address in listening mode.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.shared.mode {
            Mode::Listening { local_addr } => Some(*local_addr),
            Mode::Dialing { .. } => None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.shared.is_live()
    }

    pub async fn submit_outbound(&self, client_id: &str, payload: Vec<u8>) {
        self.shared.submit_outbound(client_id, payload).await
    }

    /// Queues a non-data frame (handshake traffic) behind any pending data.
    pub async fn send_control(&self, msg: Message) -> Result<(), EndpointError> {
        self.shared
            .outbound
            .send(msg)
            .await
            .map_err(|_| EndpointError::Closed)
    }

    /// Receives the next non-data frame read from the transport. `None` once the
    /// endpoint has shut down.
    pub async fn next_control(&self) -> Option<Message> {
        let mut rx = self.control_rx.lock().await;
        let mut done = self.shared.done.subscribe();
        tokio::select! {
            biased;
            m = rx.recv() => m,
            _ = wait_done(&mut done) => None,
        }
    }

    pub async fn deliver_inbound(&self, client_id: &str, payload: Vec<u8>) {
        self.shared.deliver_inbound(client_id, payload).await
    }

    pub async fn remote_eof(&self, client_id: &str) {
        self.shared.remote_eof(client_id).await
    }

    pub async fn local_eof(&self, client_id: &str) -> HalfClose {
        self.shared.local_eof(client_id).await
    }

    pub async fn close_client(&self, client_id: &str) {
        self.shared.close_client(client_id).await
    }

    pub async fn shutdown(&self) {
        self.shared.shutdown().await
    }

    pub async fn terminate_on_fatal_error(&self, err: &(dyn fmt::Display + Sync)) {
        self.shared.terminate_on_fatal_error(err).await
    }

    /// Resolves once the endpoint has shut down.
    pub async fn wait(&self) {
        let mut done = self.shared.done.subscribe();
        wait_done(&mut done).await;
    }

    #[cfg(test)]
    pub async fn client_ids(&self) -> Vec<String> {
        let reg = self.shared.registry.lock().await;
        let mut ids: Vec<String> = reg.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    #[cfg(test)]
    pub async fn client_state(&self, client_id: &str) -> Option<HalfClose> {
        let reg = self.shared.registry.lock().await;
        reg.clients.get(client_id).map(|h| h.state())
    }
}

/// Binds a service address; a bare port or `:port` binds all interfaces.
pub async fn bind(service: &str) -> Result<TcpListener, EndpointError> {
    let addr = net::normalize_bind_addr(service);
    TcpListener::bind(addr.as_ref())
        .await
        .map_err(|source| EndpointError::Bind {
            addr: addr.to_string(),
            source,
        })
}

pub fn check_protocol(protocol: Protocol) -> Result<(), EndpointError> {
    match protocol {
        Protocol::Tcp => Ok(()),
        Protocol::Udp => Err(EndpointError::UnsupportedProtocol(protocol)),
    }
}

impl Shared {
    fn is_live(&self) -> bool {
        *self.live.borrow()
    }

    /// Registers a client and starts its read loop. Caller holds the registry lock.
    fn spawn_client<R, W>(
        self: &Arc<Self>,
        reg: &mut Registry,
        client_id: String,
        reader: R,
        writer: W,
    ) -> Arc<ClientHandle>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let handle = Arc::new(ClientHandle::new(
            client_id.clone(),
            Box::new(writer),
            self.mode.name(),
        ));
        reg.clients.insert(client_id, handle.clone());

        let client = Client::new(reader, handle.clone(), self.opts.chunk_size);
        let point = self.clone();
        tokio::spawn(async move { client.run(point.as_ref()).await });

        handle
    }

    async fn deliver_inbound(self: &Arc<Self>, client_id: &str, payload: Vec<u8>) {
        let handle = match &self.mode {
            Mode::Listening { .. } => {
                let h = self.registry.lock().await.clients.get(client_id).cloned();
                match h {
                    Some(h) => h,
                    None => {
                        tracing::warn!(client_id = %client_id, bytes = payload.len(), "endpoint: data for unknown client dropped");
                        return;
                    }
                }
            }
            Mode::Dialing { target } => match self.provision_dialed(client_id, target).await {
                Some(h) => h,
                None => return,
            },
        };

        telemetry::record_bytes_in(payload.len());
        tracing::trace!(client_id = %client_id, bytes = payload.len(), "endpoint: write to client");

        if let Err(err) = handle.write(&payload).await {
            tracing::warn!(client_id = %client_id, err = %err, "endpoint: write to client failed");
            self.close_client(client_id).await;
        }
    }

    /// Returns the live client for `client_id`, dialing the target if there is none.
    /// Dials are serialized by the registry lock.
    async fn provision_dialed(
        self: &Arc<Self>,
        client_id: &str,
        target: &str,
    ) -> Option<Arc<ClientHandle>> {
        let mut reg = self.registry.lock().await;
        if let Some(h) = reg.clients.get(client_id) {
            return Some(h.clone());
        }
        if !self.is_live() {
            return None;
        }
        if reg.retired.contains(client_id) {
            tracing::debug!(client_id = %client_id, "endpoint: data for closed client dropped");
            return None;
        }

        tracing::trace!(client_id = %client_id, upstream = %target, "endpoint: client not connected; dialing");

        let dialed = tokio::time::timeout(self.opts.dial_timeout, TcpStream::connect(target)).await;
        let sock = match dialed {
            Ok(Ok(sock)) => sock,
            Ok(Err(err)) => {
                telemetry::record_dial_failure();
                tracing::warn!(client_id = %client_id, upstream = %target, err = %err, "endpoint: dial failed; frame dropped");
                return None;
            }
            Err(_) => {
                telemetry::record_dial_failure();
                tracing::warn!(
                    client_id = %client_id,
                    upstream = %target,
                    timeout = %humantime::format_duration(self.opts.dial_timeout),
                    "endpoint: dial timed out; frame dropped"
                );
                return None;
            }
        };

        tracing::info!(client_id = %client_id, upstream = %target, "endpoint: new client");
        let (rd, wr) = sock.into_split();
        Some(self.spawn_client(&mut reg, client_id.to_string(), rd, wr))
    }

    async fn remote_eof(&self, client_id: &str) {
        let h = self.registry.lock().await.clients.get(client_id).cloned();
        let Some(handle) = h else {
            tracing::trace!(client_id = %client_id, "endpoint: half-close for unknown client");
            return;
        };

        tracing::trace!(client_id = %client_id, "endpoint: received EOF from peer");
        match handle.signal_eof(Direction::Remote) {
            HalfClose::Closed => self.close_client(client_id).await,
            _ => {
                // Let the local socket see end-of-stream; its read side stays open.
                if let Err(err) = handle.shutdown_write().await {
                    tracing::debug!(client_id = %client_id, err = %err, "endpoint: shutdown write failed");
                }
            }
        }
    }

    async fn shutdown(&self) {
        self.live.send_replace(false);

        let ids: Vec<String> = self.registry.lock().await.clients.keys().cloned().collect();
        for id in ids {
            self.close_client(&id).await;
        }

        if !self.done_fired.swap(true, Ordering::AcqRel) {
            self.done.send_replace(true);
            tracing::info!(mode = self.mode.name(), "endpoint: closed");
        }
    }

    /// Fatal transport failure. Flipping liveness stops the accept loop (dropping the
    /// listener) and makes the writer loop close the transport.
    async fn terminate_on_fatal_error(&self, err: &(dyn fmt::Display + Sync)) {
        tracing::error!(fatal = true, mode = self.mode.name(), err = %err, "endpoint: transport failed; tearing down");
        self.shutdown().await;
    }
}

#[async_trait]
impl MuxHandle for Shared {
    async fn submit_outbound(&self, client_id: &str, payload: Vec<u8>) {
        let n = payload.len();
        if self
            .outbound
            .send(Message::data(client_id, payload))
            .await
            .is_err()
        {
            tracing::debug!(client_id = %client_id, "endpoint: outbound queue closed; frame dropped");
            return;
        }
        telemetry::record_bytes_out(n);
    }

    async fn local_eof(&self, client_id: &str) -> HalfClose {
        let h = self.registry.lock().await.clients.get(client_id).cloned();
        let Some(handle) = h else {
            return HalfClose::Closed;
        };

        tracing::trace!(client_id = %client_id, "endpoint: client socket EOF");
        let st = handle.signal_eof(Direction::Local);
        if st == HalfClose::Closed {
            self.close_client(client_id).await;
        }
        st
    }

    async fn close_client(&self, client_id: &str) {
        let removed = {
            let mut reg = self.registry.lock().await;
            let removed = reg.clients.remove(client_id);
            if removed.is_some() && matches!(self.mode, Mode::Dialing { .. }) {
                reg.retired.insert(client_id);
            }
            removed
        };

        if let Some(handle) = removed {
            handle.close().await;
            tracing::debug!(client_id = %client_id, "endpoint: client closed");
        }
    }

    fn is_live(&self) -> bool {
        Shared::is_live(self)
    }
}

async fn wait_dead(live: &mut watch::Receiver<bool>) {
    let _ = live.wait_for(|live| !*live).await;
}

async fn wait_done(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|d| *d).await;
}

async fn accept_loop(shared: Arc<Shared>, ln: TcpListener) {
    let mut live = shared.live.subscribe();
    let mut next_id: u64 = 1;

    loop {
        let accepted = tokio::select! {
            _ = wait_dead(&mut live) => break,
            r = ln.accept() => r,
        };

        let (sock, peer) = match accepted {
            Ok(v) => v,
            Err(err) => {
                shared.terminate_on_fatal_error(&err).await;
                break;
            }
        };

        let mut reg = shared.registry.lock().await;
        if !shared.is_live() {
            break;
        }

        let client_id = next_id.to_string();
        next_id += 1;

        tracing::info!(client_id = %client_id, peer = %peer, "endpoint: new client");
        let (rd, wr) = sock.into_split();
        shared.spawn_client(&mut reg, client_id, rd, wr);
    }

    tracing::debug!("endpoint: accept loop ended");
}

async fn writer_loop(
    shared: Arc<Shared>,
    mut writer: Box<dyn FrameWriter>,
    mut rx: mpsc::Receiver<Message>,
) {
    let mut live = shared.live.subscribe();

    loop {
        let msg = tokio::select! {
            _ = wait_dead(&mut live) => break,
            m = rx.recv() => match m {
                Some(m) => m,
                None => break,
            },
        };

        tracing::trace!(kind = ?msg.kind(), "endpoint: writing frame");

        let written = tokio::select! {
            _ = wait_dead(&mut live) => break,
            r = writer.write_frame(&msg) => r,
        };
        if let Err(err) = written {
            shared.terminate_on_fatal_error(&err).await;
            break;
        }
    }

    writer.close().await;
    tracing::debug!("endpoint: writer loop ended");
}

async fn reader_loop(shared: Arc<Shared>, mut reader: Box<dyn FrameReader>) {
    let mut live = shared.live.subscribe();

    loop {
        let read = tokio::select! {
            _ = wait_dead(&mut live) => break,
            r = reader.read_frame() => r,
        };

        let msg = match read {
            Ok(m) => m,
            Err(err) => {
                shared.terminate_on_fatal_error(&err).await;
                break;
            }
        };

        tracing::trace!(kind = ?msg.kind(), "endpoint: read frame");

        match msg {
            Message::Data { client_id, payload } if payload.is_empty() => {
                shared.remote_eof(&client_id).await;
            }
            Message::Data { client_id, payload } => {
                shared.deliver_inbound(&client_id, payload).await;
            }
            other => {
                let kind = other.kind();
                if shared.control.try_send(other).is_err() {
                    tracing::warn!(kind = ?kind, "endpoint: control queue full; frame dropped");
                }
            }
        }
    }

    tracing::debug!("endpoint: reader loop ended");
}
