//! TCP multiplexing over one WebSocket.
//!
//! Each side of a tunnel runs an [`endpoint::Endpoint`] over the shared [`transport`].
//! Local sockets are wrapped by [`adapter`] tasks and identified on the wire by a client id.

pub mod adapter;
pub mod client;
pub mod endpoint;
pub mod protocol;
pub mod server;
pub mod transport;
