use async_trait::async_trait;
use thiserror::Error;

use crate::tunneler::tunnel::protocol::{Message, ProtocolError};

pub mod ws;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport closed")]
    Closed,
    #[error("protocol: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("websocket: {0}")]
    Upgraded(#[from] axum::Error),
}

/// Read half of the shared duplex transport. Yields one decoded frame per call.
#[async_trait]
pub trait FrameReader: Send {
    async fn read_frame(&mut self) -> Result<Message, TransportError>;
}

/// Write half of the shared duplex transport.
#[async_trait]
pub trait FrameWriter: Send {
    async fn write_frame(&mut self, msg: &Message) -> Result<(), TransportError>;
    async fn close(&mut self);
}

/// An established transport, split so that one task reads while another writes.
pub struct Transport {
    pub reader: Box<dyn FrameReader>,
    pub writer: Box<dyn FrameWriter>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}

impl Transport {
    pub fn new(reader: Box<dyn FrameReader>, writer: Box<dyn FrameWriter>) -> Self {
        Self { reader, writer }
    }
}
