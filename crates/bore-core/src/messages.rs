//! bore control protocol messages.
//!
//! The control stream carries a [`Greeting`] in each direction, then a
//! sequence of [`GlobalRequest`]s from the client, each optionally answered
//! by a [`GlobalReply`]. Every other bidirectional stream starts with a
//! [`ChannelOpen`] header frame.

use serde::{Deserialize, Serialize};

/// Protocol version exchanged in the greeting.
pub const PROTOCOL_VERSION: &str = "bore-v1";

/// ALPN identifier negotiated during the QUIC handshake.
pub const ALPN: &[u8] = b"bore/1";

/// Application error codes used when closing a tunnel connection.
pub mod close_code {
    pub const NORMAL: u32 = 0;
    pub const PROTOCOL_ERROR: u32 = 1;
    pub const AUTH_FAILED: u32 = 2;
    pub const ALLOCATION_FAILED: u32 = 3;
    pub const SHUTDOWN: u32 = 4;
}

/// First frame sent by each side of the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub version: String,
}

impl Greeting {
    pub fn current() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }
}

/// Typed control request. Field order is part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Request {
    Password {
        password: String,
    },
    SetId {
        id: String,
    },
    TcpipForward {
        bind_addr: String,
        bind_port: u32,
    },
    CancelTcpipForward {
        bind_addr: String,
        bind_port: u32,
    },
    Keepalive,
    /// Any request type this build does not know.
    #[serde(other)]
    Unknown,
}

impl Request {
    /// Wire name of the request type, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Request::Password { .. } => "password",
            Request::SetId { .. } => "set-id",
            Request::TcpipForward { .. } => "tcpip-forward",
            Request::CancelTcpipForward { .. } => "cancel-tcpip-forward",
            Request::Keepalive => "keepalive",
            Request::Unknown => "unknown",
        }
    }
}

/// A request on the control stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRequest {
    pub want_reply: bool,
    pub request: Request,
}

impl GlobalRequest {
    pub fn new(request: Request) -> Self {
        Self {
            want_reply: true,
            request,
        }
    }
}

/// Reply to a [`GlobalRequest`] that asked for one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalReply {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bound_port: Option<u32>,
}

impl GlobalReply {
    pub fn success() -> Self {
        Self {
            success: true,
            bound_port: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            success: false,
            bound_port: None,
        }
    }

    pub fn bound(port: u16) -> Self {
        Self {
            success: true,
            bound_port: Some(port as u32),
        }
    }
}

/// Header frame at the start of every non-control bidirectional stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ChannelOpen {
    /// Client-opened status channel; the server writes human-readable text.
    Session,
    /// Server-opened channel carrying one inbound TCP connection.
    ForwardedTcpip {
        connected_addr: String,
        connected_port: u32,
        origin_addr: String,
        origin_port: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{cbor_decode, frame_encode};

    fn encode_decode<T>(value: &T) -> T
    where
        T: Serialize + serde::de::DeserializeOwned,
    {
        let frame = frame_encode(value).unwrap();
        cbor_decode(&frame[4..]).unwrap()
    }

    #[test]
    fn requests_use_kebab_case_tags() {
        #[derive(Deserialize)]
        struct Tagged {
            #[serde(rename = "type")]
            kind: String,
        }

        let req = Request::TcpipForward {
            bind_addr: "127.0.0.1".into(),
            bind_port: 0,
        };
        let tagged: Tagged = encode_decode_as(&req);
        assert_eq!(tagged.kind, "tcpip-forward");
        assert_eq!(req.kind(), "tcpip-forward");

        let tagged: Tagged = encode_decode_as(&Request::SetId { id: "abc".into() });
        assert_eq!(tagged.kind, "set-id");
    }

    fn encode_decode_as<T, U>(value: &T) -> U
    where
        T: Serialize,
        U: serde::de::DeserializeOwned,
    {
        let frame = frame_encode(value).unwrap();
        cbor_decode(&frame[4..]).unwrap()
    }

    #[test]
    fn forward_fields_are_camel_case() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Fields {
            bind_addr: String,
            bind_port: u32,
        }

        let fields: Fields = encode_decode_as(&Request::TcpipForward {
            bind_addr: "0.0.0.0".into(),
            bind_port: 8080,
        });
        assert_eq!(fields.bind_addr, "0.0.0.0");
        assert_eq!(fields.bind_port, 8080);
    }

    #[test]
    fn unknown_request_type_decodes_as_unknown() {
        #[derive(Serialize)]
        struct Foreign {
            #[serde(rename = "type")]
            kind: &'static str,
            payload: u32,
        }

        let req: Request = encode_decode_as(&Foreign {
            kind: "streamlocal-forward@openssh.com",
            payload: 1,
        });
        assert_eq!(req, Request::Unknown);
    }

    #[test]
    fn global_request_keeps_want_reply() {
        let mut req = GlobalRequest::new(Request::Keepalive);
        req.want_reply = false;
        assert_eq!(encode_decode(&req), req);
    }

    #[test]
    fn reply_omits_port_unless_bound() {
        assert_eq!(encode_decode(&GlobalReply::failure()).bound_port, None);
        assert_eq!(encode_decode(&GlobalReply::bound(55001)).bound_port, Some(55001));
    }

    #[test]
    fn channel_headers_decode() {
        let header = ChannelOpen::ForwardedTcpip {
            connected_addr: "127.0.0.1".into(),
            connected_port: 55123,
            origin_addr: "203.0.113.9".into(),
            origin_port: 40022,
        };
        assert_eq!(encode_decode(&header), header);
        assert_eq!(encode_decode(&ChannelOpen::Session), ChannelOpen::Session);
    }

    #[test]
    fn greeting_version_check() {
        assert!(Greeting::current().is_compatible());
        let old = Greeting {
            version: "bore-v0".into(),
        };
        assert!(!old.is_compatible());
    }
}
