//! Connection adapter: one task per relayed socket.
//!
//! The adapter owns the read half of its socket and pumps bytes into the owning
//! endpoint. The write half lives in the [`ClientHandle`] the endpoint keeps in its
//! client map, so inbound bytes never touch the adapter task.

use std::{
    io,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::watch,
};

use crate::tunneler::telemetry::ActiveClientGuard;

pub type BoxedWrite = Box<dyn AsyncWrite + Unpin + Send>;

/// Which side of a relayed connection reported end-of-stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The local socket returned EOF.
    Local,
    /// The peer sent an empty `Data` frame.
    Remote,
}

/// Two-phase close progress of one client.
///
/// Either direction may signal first; any further signal completes the close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalfClose {
    Open,
    HalfClosedLocal,
    HalfClosedRemote,
    Closed,
}

impl HalfClose {
    pub fn on_eof(self, from: Direction) -> HalfClose {
        match (self, from) {
            (HalfClose::Open, Direction::Local) => HalfClose::HalfClosedLocal,
            (HalfClose::Open, Direction::Remote) => HalfClose::HalfClosedRemote,
            _ => HalfClose::Closed,
        }
    }
}

/// What an adapter needs from the endpoint that owns it.
#[async_trait]
pub trait MuxHandle: Send + Sync {
    /// Queue bytes read from the local socket. Blocks while the outbound queue is full.
    async fn submit_outbound(&self, client_id: &str, payload: Vec<u8>);
    /// Feed a local end-of-stream into the client's half-close state.
    async fn local_eof(&self, client_id: &str) -> HalfClose;
    /// Remove the client and close its socket.
    async fn close_client(&self, client_id: &str);
    fn is_live(&self) -> bool;
}

/// Endpoint-side handle of a registered client: the socket's write half plus the
/// shared half-close state.
pub struct ClientHandle {
    id: String,
    writer: tokio::sync::Mutex<Option<BoxedWrite>>,
    state: Mutex<HalfClose>,
    closed: watch::Sender<bool>,
    _active: ActiveClientGuard,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientHandle {
    pub fn new(id: String, writer: BoxedWrite, mode: &'static str) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id,
            writer: tokio::sync::Mutex::new(Some(writer)),
            state: Mutex::new(HalfClose::Open),
            closed,
            _active: ActiveClientGuard::new(mode),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HalfClose {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// Applies one end-of-stream signal and returns the resulting state.
    pub fn signal_eof(&self, from: Direction) -> HalfClose {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *st = st.on_eof(from);
        *st
    }

    /// Writes the whole payload to the socket. Gives up as soon as the client is closed,
    /// so a peer that stopped reading cannot pin the writer.
    pub async fn write(&self, payload: &[u8]) -> io::Result<()> {
        let mut closed = self.closed.subscribe();
        let mut guard = self.writer.lock().await;
        let Some(w) = guard.as_mut() else {
            return Err(io::ErrorKind::NotConnected.into());
        };
        tokio::select! {
            _ = wait_closed(&mut closed) => Err(io::ErrorKind::NotConnected.into()),
            r = async {
                w.write_all(payload).await?;
                w.flush().await
            } => r,
        }
    }

    /// Sends FIN on the socket while leaving the read direction open.
    pub async fn shutdown_write(&self) -> io::Result<()> {
        let mut guard = self.writer.lock().await;
        match guard.as_mut() {
            Some(w) => w.shutdown().await,
            None => Ok(()),
        }
    }

    /// Stops the adapter's read loop and releases the write half. Only the path that
    /// removed the client from the endpoint map calls this.
    pub(crate) async fn close(&self) {
        self.closed.send_replace(true);
        let w = self.writer.lock().await.take();
        if let Some(mut w) = w {
            let _ = w.shutdown().await;
        }
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

/// The read side of one relayed connection.
pub struct Client<R> {
    id: String,
    reader: R,
    handle: Arc<ClientHandle>,
    chunk_size: usize,
}

impl<R> Client<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(reader: R, handle: Arc<ClientHandle>, chunk_size: usize) -> Self {
        Self {
            id: handle.id().to_string(),
            reader,
            handle,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Pumps the socket into `point` until a second EOF (or a local EOF after the
    /// peer's half-close) completes the close, the socket fails, the client is closed,
    /// or the endpoint dies. The read half is dropped on return.
    pub async fn run<P>(mut self, point: &P)
    where
        P: MuxHandle + ?Sized,
    {
        tracing::debug!(client_id = %self.id, "client: read loop started");

        let mut buf = vec![0u8; self.chunk_size];
        let mut closed = self.handle.closed_signal();

        loop {
            if !point.is_live() || self.handle.is_closed() {
                break;
            }

            let read = tokio::select! {
                _ = wait_closed(&mut closed) => break,
                r = self.reader.read(&mut buf) => r,
            };

            match read {
                Ok(n) => {
                    tracing::trace!(client_id = %self.id, bytes = n, "client: read");

                    // Copy out of the reused buffer; an empty copy is the half-close signal.
                    point.submit_outbound(&self.id, buf[..n].to_vec()).await;

                    // The first EOF half-closes; the repeated EOF on the next read closes.
                    if n == 0 && point.local_eof(&self.id).await == HalfClose::Closed {
                        break;
                    }
                }
                Err(err) => {
                    tracing::warn!(client_id = %self.id, err = %err, "client: read failed");
                    point.close_client(&self.id).await;
                    break;
                }
            }
        }

        tracing::debug!(client_id = %self.id, "client: read loop ended");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::{io::AsyncWriteExt, sync::Mutex as AsyncMutex};

    use super::*;

    #[derive(Default)]
    struct FakePoint {
        submitted: AsyncMutex<Vec<(String, Vec<u8>)>>,
        handle: AsyncMutex<Option<Arc<ClientHandle>>>,
        removed: AsyncMutex<Vec<String>>,
        dead: AtomicBool,
    }

    #[async_trait]
    impl MuxHandle for FakePoint {
        async fn submit_outbound(&self, client_id: &str, payload: Vec<u8>) {
            self.submitted
                .lock()
                .await
                .push((client_id.to_string(), payload));
        }

        async fn local_eof(&self, client_id: &str) -> HalfClose {
            let h = self.handle.lock().await.clone();
            let st = h
                .map(|h| h.signal_eof(Direction::Local))
                .unwrap_or(HalfClose::Closed);
            if st == HalfClose::Closed {
                self.close_client(client_id).await;
            }
            st
        }

        async fn close_client(&self, client_id: &str) {
            self.removed.lock().await.push(client_id.to_string());
            if let Some(h) = self.handle.lock().await.take() {
                h.close().await;
            }
        }

        fn is_live(&self) -> bool {
            !self.dead.load(Ordering::SeqCst)
        }
    }

    fn client_with_peer(
        id: &str,
    ) -> (
        Client<tokio::io::ReadHalf<tokio::io::DuplexStream>>,
        Arc<ClientHandle>,
        tokio::io::DuplexStream,
    ) {
        let (ours, peer) = tokio::io::duplex(1024);
        let (rd, wr) = tokio::io::split(ours);
        let handle = Arc::new(ClientHandle::new(id.to_string(), Box::new(wr), "test"));
        (Client::new(rd, handle.clone(), 4), handle, peer)
    }

    #[test]
    fn half_close_state_machine() {
        use Direction::*;
        use HalfClose::*;

        assert_eq!(Open.on_eof(Local), HalfClosedLocal);
        assert_eq!(Open.on_eof(Remote), HalfClosedRemote);
        assert_eq!(HalfClosedLocal.on_eof(Remote), Closed);
        assert_eq!(HalfClosedRemote.on_eof(Local), Closed);
        assert_eq!(HalfClosedRemote.on_eof(Remote), Closed);
        assert_eq!(Closed.on_eof(Local), Closed);
        assert_eq!(Closed.on_eof(Remote), Closed);
    }

    #[tokio::test]
    async fn reads_are_chunked_and_copied() {
        let point = Arc::new(FakePoint::default());
        let (client, handle, mut peer) = client_with_peer("1");
        *point.handle.lock().await = Some(handle.clone());

        let p = point.clone();
        let task = tokio::spawn(async move { client.run(p.as_ref()).await });

        peer.write_all(b"hello").await.unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            loop {
                let total: usize = point.submitted.lock().await.iter().map(|(_, b)| b.len()).sum();
                if total >= 5 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let got = point.submitted.lock().await.clone();
        assert!(got.iter().all(|(id, b)| id == "1" && b.len() <= 4));
        let joined: Vec<u8> = got.into_iter().flat_map(|(_, b)| b).collect();
        assert_eq!(joined, b"hello");

        point.close_client("1").await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn local_eof_after_remote_half_close_removes_client() {
        let point = Arc::new(FakePoint::default());
        let (client, handle, peer) = client_with_peer("2");
        *point.handle.lock().await = Some(handle.clone());

        assert_eq!(handle.signal_eof(Direction::Remote), HalfClose::HalfClosedRemote);
        drop(peer);

        client.run(point.as_ref()).await;

        let submitted = point.submitted.lock().await.clone();
        assert_eq!(submitted, vec![("2".to_string(), Vec::new())]);
        assert_eq!(*point.removed.lock().await, vec!["2".to_string()]);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn repeated_local_eof_closes_client() {
        let point = Arc::new(FakePoint::default());
        let (client, handle, peer) = client_with_peer("3");
        *point.handle.lock().await = Some(handle.clone());
        drop(peer);

        tokio::time::timeout(std::time::Duration::from_secs(2), client.run(point.as_ref()))
            .await
            .unwrap();

        // One empty frame per EOF: the first half-closes, the second closes.
        let submitted = point.submitted.lock().await.clone();
        assert_eq!(
            submitted,
            vec![("3".to_string(), Vec::new()), ("3".to_string(), Vec::new())]
        );
        assert_eq!(*point.removed.lock().await, vec!["3".to_string()]);
        assert!(handle.is_closed());
    }

    #[tokio::test]
    async fn dead_endpoint_stops_loop_without_reading() {
        let point = FakePoint::default();
        point.dead.store(true, Ordering::SeqCst);
        let (client, _handle, _peer) = client_with_peer("4");

        client.run(&point).await;
        assert!(point.submitted.lock().await.is_empty());
    }

    #[tokio::test]
    async fn write_after_close_is_rejected() {
        let (_client, handle, _peer) = client_with_peer("5");
        handle.write(b"ok").await.unwrap();
        handle.close().await;
        let err = handle.write(b"late").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }
}
