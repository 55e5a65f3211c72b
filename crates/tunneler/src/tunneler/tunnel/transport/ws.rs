use std::marker::PhantomData;

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::tunneler::tunnel::{
    protocol::Message,
    transport::{FrameReader, FrameWriter, Transport, TransportError},
};

/// WebSocket message types from either side of the upgrade (axum on the server,
/// tungstenite on the client) reduced to what the frame codec needs.
pub trait WsFrame: Sized + Send {
    fn text(s: String) -> Self;
    /// `None` for control traffic (ping/pong) that carries no frame.
    fn decode(self) -> Option<Result<Message, TransportError>>;
}

impl WsFrame for axum::extract::ws::Message {
    fn text(s: String) -> Self {
        axum::extract::ws::Message::Text(s.into())
    }

    fn decode(self) -> Option<Result<Message, TransportError>> {
        use axum::extract::ws::Message as M;
        match self {
            M::Text(t) => Some(Message::decode(t.as_str().as_bytes()).map_err(Into::into)),
            M::Binary(b) => Some(Message::decode(&b).map_err(Into::into)),
            M::Close(_) => Some(Err(TransportError::Closed)),
            M::Ping(_) | M::Pong(_) => None,
        }
    }
}

impl WsFrame for tokio_tungstenite::tungstenite::Message {
    fn text(s: String) -> Self {
        tokio_tungstenite::tungstenite::Message::text(s)
    }

    fn decode(self) -> Option<Result<Message, TransportError>> {
        use tokio_tungstenite::tungstenite::Message as M;
        match self {
            M::Text(t) => Some(Message::decode(t.as_str().as_bytes()).map_err(Into::into)),
            M::Binary(b) => Some(Message::decode(&b).map_err(Into::into)),
            M::Close(_) => Some(Err(TransportError::Closed)),
            M::Ping(_) | M::Pong(_) | M::Frame(_) => None,
        }
    }
}

pub struct WsReader<S> {
    inner: S,
}

#[async_trait]
impl<S, M, E> FrameReader for WsReader<S>
where
    S: Stream<Item = Result<M, E>> + Unpin + Send,
    M: WsFrame,
    E: Into<TransportError> + Send,
{
    async fn read_frame(&mut self) -> Result<Message, TransportError> {
        loop {
            let Some(next) = self.inner.next().await else {
                return Err(TransportError::Closed);
            };
            let msg: M = next.map_err(Into::<TransportError>::into)?;
            if let Some(frame) = msg.decode() {
                return frame;
            }
        }
    }
}

pub struct WsWriter<K, M> {
    inner: K,
    _frame: PhantomData<fn() -> M>,
}

#[async_trait]
impl<K, M> FrameWriter for WsWriter<K, M>
where
    K: Sink<M> + Unpin + Send,
    K::Error: Into<TransportError>,
    M: WsFrame,
{
    async fn write_frame(&mut self, msg: &Message) -> Result<(), TransportError> {
        let text = msg.encode()?;
        self.inner.send(M::text(text)).await.map_err(Into::into)
    }

    async fn close(&mut self) {
        let _ = self.inner.close().await;
    }
}

impl<K, M> WsWriter<K, M> {
    fn new(inner: K) -> Self {
        Self {
            inner,
            _frame: PhantomData,
        }
    }
}

/// Wraps a WebSocket accepted by the axum upgrade handler.
pub fn from_axum(socket: axum::extract::ws::WebSocket) -> Transport {
    let (sink, stream) = socket.split();
    Transport::new(
        Box::new(WsReader { inner: stream }),
        Box::new(WsWriter::<_, axum::extract::ws::Message>::new(sink)),
    )
}

/// Wraps a client-side WebSocket produced by `tokio_tungstenite`.
pub fn from_tungstenite<S>(ws: tokio_tungstenite::WebSocketStream<S>) -> Transport
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    Transport::new(
        Box::new(WsReader { inner: stream }),
        Box::new(WsWriter::<_, tokio_tungstenite::tungstenite::Message>::new(sink)),
    )
}
