use serde::{Deserialize, Serialize};

use crate::{ConnectionId, HttpRequest, HttpResponse, MAX_HEADERS_PER_MESSAGE, MAX_MESSAGE_BYTES};

pub const PROTOCOL_MAJOR: u32 = 1;
pub const PROTOCOL_MINOR: u32 = 0;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion {
    pub major: u32,
    pub minor: u32,
}

impl ProtocolVersion {
    pub const CURRENT: ProtocolVersion = ProtocolVersion {
        major: PROTOCOL_MAJOR,
        minor: PROTOCOL_MINOR,
    };
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupportedVersions {
    pub min: ProtocolVersion,
    pub max: ProtocolVersion,
}

impl SupportedVersions {
    pub const CURRENT: SupportedVersions = SupportedVersions {
        min: ProtocolVersion::CURRENT,
        max: ProtocolVersion::CURRENT,
    };

    pub fn choose_common(&self, other: &SupportedVersions) -> Option<ProtocolVersion> {
        let min = std::cmp::max(self.min, other.min);
        let max = std::cmp::min(self.max, other.max);
        (min <= max).then_some(max)
    }
}

pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;
pub const DEFAULT_MAX_PACKET_LEN: u32 = 64 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Capabilities {
    pub max_frame_len: u32,
    pub max_packet_len: u32,
    pub supports_cancel: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_packet_len: DEFAULT_MAX_PACKET_LEN,
            supports_cancel: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientHello {
    pub supported_versions: SupportedVersions,
    pub capabilities: Capabilities,
    pub client_build: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerWelcome {
    pub connection_id: ConnectionId,
    pub chosen_version: ProtocolVersion,
    pub chosen_capabilities: Capabilities,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RejectCode {
    InvalidRequest,
    UnsupportedVersion,
    Internal,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandshakeReject {
    pub code: RejectCode,
    pub message: String,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RpcErrorCode {
    InvalidRequest,
    TooLarge,
    Cancelled,
    /// The handler answered with a 5xx status; the response is embedded in the error.
    HttpStatus,
    Internal,
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RpcError {
    pub code: RpcErrorCode,
    pub message: String,
    /// Complete HTTP response carried by the failure, if any.
    #[serde(default)]
    pub response: Option<HttpResponse>,
    #[serde(default)]
    pub do_not_log: bool,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            response: None,
            do_not_log: false,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RpcResult<T> {
    Ok {
        value: T,
    },
    Err {
        error: RpcError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Request {
    Handle(HttpRequest),
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum Response {
    Handle(HttpResponse),
    #[serde(other)]
    Unknown,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum RpcPayload {
    Request(Request),
    Response(RpcResult<Response>),
    Cancel,
    #[serde(other)]
    Unknown,
}

/// Serializes `Vec<u8>` as a CBOR byte string instead of an array of integers.
pub(crate) mod cbor_bytes {
    use std::fmt;

    use serde::de::{self, Deserializer, Visitor};
    use serde::Serializer;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        deserializer.deserialize_byte_buf(ByteBuf)
    }

    struct ByteBuf;

    impl<'de> Visitor<'de> for ByteBuf {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a byte string")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Vec<u8>, E> {
            Ok(v.to_owned())
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Vec<u8>, E> {
            Ok(v)
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum WireFrame {
    Hello(ClientHello),
    Welcome(ServerWelcome),
    Reject(HandshakeReject),
    Packet {
        id: u64,
        #[serde(with = "cbor_bytes")]
        data: Vec<u8>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("{what} of {len} bytes exceeds the limit of {max}")]
    TooLarge {
        what: &'static str,
        len: usize,
        max: usize,
    },
    #[error("message carries {count} headers, more than the limit of {max}")]
    TooManyHeaders { count: usize, max: usize },
    #[error(transparent)]
    Cbor(#[from] serde_cbor::Error),
}

fn check_len(what: &'static str, bytes: &[u8]) -> Result<(), WireError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(WireError::TooLarge {
            what,
            len: bytes.len(),
            max: MAX_MESSAGE_BYTES,
        });
    }
    Ok(())
}

pub fn encode_wire_frame(frame: &WireFrame) -> Result<Vec<u8>, WireError> {
    Ok(serde_cbor::to_vec(frame)?)
}

pub fn decode_wire_frame(bytes: &[u8]) -> Result<WireFrame, WireError> {
    check_len("wire frame", bytes)?;
    Ok(serde_cbor::from_slice(bytes)?)
}

pub fn encode_rpc_payload(payload: &RpcPayload) -> Result<Vec<u8>, WireError> {
    Ok(serde_cbor::to_vec(payload)?)
}

/// Decodes a payload received from the peer, enforcing the message and header limits.
pub fn decode_rpc_payload(bytes: &[u8]) -> Result<RpcPayload, WireError> {
    check_len("rpc payload", bytes)?;
    let payload: RpcPayload = serde_cbor::from_slice(bytes)?;

    let headers = match &payload {
        RpcPayload::Request(Request::Handle(req)) => req.headers.len(),
        RpcPayload::Response(RpcResult::Ok {
            value: Response::Handle(resp),
        }) => resp.headers.len(),
        RpcPayload::Response(RpcResult::Err { error }) => {
            error.response.as_ref().map_or(0, |resp| resp.headers.len())
        }
        _ => 0,
    };
    if headers > MAX_HEADERS_PER_MESSAGE {
        return Err(WireError::TooManyHeaders {
            count: headers,
            max: MAX_HEADERS_PER_MESSAGE,
        });
    }
    Ok(payload)
}
