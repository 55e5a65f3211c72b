use std::{fmt, str::FromStr};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported protocol {0:?} (expected tcp)")]
    UnsupportedProtocol(String),
}

/// Socket protocol requested for a tunnel.
///
/// Only stream sockets are relayed; `udp` is accepted on the wire so that a peer
/// asking for it gets a proper `Error` frame instead of a decode failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ProtocolError::UnsupportedProtocol(other.to_string())),
        }
    }
}

/// Wire tag carried in the `t` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    CreateLocalTunnel,
    LocalTunnelReady,
    CloseLocalTunnel,
    CreateRemoteTunnel,
    RemoteTunnelReady,
    CloseRemoteTunnel,
    Data,
    Error,
}

/// Protocol + service address pair carried by the handshake frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelRequest {
    pub protocol: String,
    pub service: String,
}

impl TunnelRequest {
    pub fn new(protocol: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            protocol: protocol.into(),
            service: service.into(),
        }
    }
}

/// One frame exchanged over the shared transport.
///
/// A `Data` frame with an empty payload is the half-close signal for that client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireMessage", from = "WireMessage")]
pub enum Message {
    CreateLocalTunnel(TunnelRequest),
    LocalTunnelReady(TunnelRequest),
    CloseLocalTunnel,
    CreateRemoteTunnel(TunnelRequest),
    RemoteTunnelReady(TunnelRequest),
    CloseRemoteTunnel,
    Data { client_id: String, payload: Vec<u8> },
    Error { description: String },
}

impl Message {
    pub fn data(client_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Message::Data {
            client_id: client_id.into(),
            payload,
        }
    }

    pub fn error(err: impl fmt::Display) -> Self {
        Message::Error {
            description: err.to_string(),
        }
    }

    pub fn kind(&self) -> MessageType {
        match self {
            Message::CreateLocalTunnel(_) => MessageType::CreateLocalTunnel,
            Message::LocalTunnelReady(_) => MessageType::LocalTunnelReady,
            Message::CloseLocalTunnel => MessageType::CloseLocalTunnel,
            Message::CreateRemoteTunnel(_) => MessageType::CreateRemoteTunnel,
            Message::RemoteTunnelReady(_) => MessageType::RemoteTunnelReady,
            Message::CloseRemoteTunnel => MessageType::CloseRemoteTunnel,
            Message::Data { .. } => MessageType::Data,
            Message::Error { .. } => MessageType::Error,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(b: &[u8]) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_slice(b)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    t: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    d: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    s: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    p: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    c: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    b: Option<Vec<u8>>,
}

impl WireMessage {
    fn bare(t: MessageType) -> Self {
        Self {
            t,
            d: None,
            s: None,
            p: None,
            c: None,
            b: None,
        }
    }

    fn handshake(t: MessageType, req: TunnelRequest) -> Self {
        Self {
            s: non_empty(req.service),
            p: non_empty(req.protocol),
            ..Self::bare(t)
        }
    }

    fn request(&mut self) -> TunnelRequest {
        TunnelRequest {
            protocol: self.p.take().unwrap_or_default(),
            service: self.s.take().unwrap_or_default(),
        }
    }
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() { None } else { Some(s) }
}

impl From<Message> for WireMessage {
    fn from(m: Message) -> Self {
        match m {
            Message::CreateLocalTunnel(r) => Self::handshake(MessageType::CreateLocalTunnel, r),
            Message::LocalTunnelReady(r) => Self::handshake(MessageType::LocalTunnelReady, r),
            Message::CloseLocalTunnel => Self::bare(MessageType::CloseLocalTunnel),
            Message::CreateRemoteTunnel(r) => Self::handshake(MessageType::CreateRemoteTunnel, r),
            Message::RemoteTunnelReady(r) => Self::handshake(MessageType::RemoteTunnelReady, r),
            Message::CloseRemoteTunnel => Self::bare(MessageType::CloseRemoteTunnel),
            Message::Data { client_id, payload } => Self {
                c: non_empty(client_id),
                b: if payload.is_empty() { None } else { Some(payload) },
                ..Self::bare(MessageType::Data)
            },
            Message::Error { description } => Self {
                d: non_empty(description),
                ..Self::bare(MessageType::Error)
            },
        }
    }
}

impl From<WireMessage> for Message {
    fn from(mut w: WireMessage) -> Self {
        match w.t {
            MessageType::CreateLocalTunnel => Message::CreateLocalTunnel(w.request()),
            MessageType::LocalTunnelReady => Message::LocalTunnelReady(w.request()),
            MessageType::CloseLocalTunnel => Message::CloseLocalTunnel,
            MessageType::CreateRemoteTunnel => Message::CreateRemoteTunnel(w.request()),
            MessageType::RemoteTunnelReady => Message::RemoteTunnelReady(w.request()),
            MessageType::CloseRemoteTunnel => Message::CloseRemoteTunnel,
            MessageType::Data => Message::Data {
                client_id: w.c.unwrap_or_default(),
                payload: w.b.unwrap_or_default(),
            },
            MessageType::Error => Message::Error {
                description: w.d.unwrap_or_default(),
            },
        }
    }
}

// Payload bytes travel as padded standard base64, the usual JSON encoding of a byte slice.
mod b64 {
    use super::*;

    pub fn serialize<S: Serializer>(v: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match v {
            Some(b) => s.serialize_str(&STANDARD.encode(b)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let Some(s) = Option::<String>::deserialize(d)? else {
            return Ok(None);
        };
        STANDARD
            .decode(s.as_bytes())
            .map(Some)
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_frame_uses_short_keys_and_base64() {
        let s = Message::data("1", b"hello".to_vec()).encode().unwrap();
        assert_eq!(s, r#"{"t":"Data","c":"1","b":"aGVsbG8="}"#);
    }

    #[test]
    fn half_close_frame_elides_payload() {
        let s = Message::data("7", Vec::new()).encode().unwrap();
        assert_eq!(s, r#"{"t":"Data","c":"7"}"#);

        let back = Message::decode(s.as_bytes()).unwrap();
        assert_eq!(back, Message::data("7", Vec::new()));
    }

    #[test]
    fn handshake_frames_carry_protocol_and_service_only() {
        let m = Message::CreateRemoteTunnel(TunnelRequest::new("tcp", "0.0.0.0:2222"));
        let v: serde_json::Value = serde_json::from_str(&m.encode().unwrap()).unwrap();
        assert_eq!(v["t"], "CreateRemoteTunnel");
        assert_eq!(v["p"], "tcp");
        assert_eq!(v["s"], "0.0.0.0:2222");
        assert!(v.get("c").is_none());
        assert!(v.get("b").is_none());
        assert!(v.get("d").is_none());
    }

    #[test]
    fn error_frame_carries_description() {
        let m = Message::error("protocol mismatch");
        assert_eq!(m.encode().unwrap(), r#"{"t":"Error","d":"protocol mismatch"}"#);
        assert_eq!(m.kind(), MessageType::Error);
    }

    #[test]
    fn decode_tolerates_null_payload_and_missing_fields() {
        let m = Message::decode(br#"{"t":"Data","c":"3","b":null}"#).unwrap();
        assert_eq!(m, Message::data("3", Vec::new()));

        let m = Message::decode(br#"{"t":"LocalTunnelReady"}"#).unwrap();
        assert_eq!(m, Message::LocalTunnelReady(TunnelRequest::new("", "")));
    }

    #[test]
    fn decode_rejects_unknown_type_and_bad_payload() {
        assert!(Message::decode(br#"{"t":"Bogus"}"#).is_err());
        assert!(Message::decode(br#"{"t":"Data","c":"1","b":"***"}"#).is_err());
    }

    #[test]
    fn protocol_parse() {
        assert_eq!("TCP".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!(" udp ".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(ProtocolError::UnsupportedProtocol(p)) if p == "sctp"
        ));
    }
}
