use serde::{Deserialize, Serialize};

/// Hard limits enforced during deserialization of untrusted network payloads.
///
/// Maximum size of a single RPC payload (not including the outer 4-byte length prefix).
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024; // 64 MiB

/// Maximum number of header entries accepted in a single tunneled request or response.
pub const MAX_HEADERS_PER_MESSAGE: usize = 4_096;

pub type ConnectionId = u64;

/// A single header key with all of its values, in the order they were received.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub values: Vec<String>,
}

impl Header {
    pub fn new(key: impl Into<String>, values: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            key: key.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// An HTTP request as it travels through the tunnel.
///
/// `url` is the request target exactly as the origin received it (path + query). It is never
/// re-parsed on the wire.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(with = "wire::cbor_bytes")]
    pub body: Vec<u8>,
    pub headers: Vec<Header>,
}

/// An HTTP response as it travels back through the tunnel.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpResponse {
    pub code: i32,
    pub headers: Vec<Header>,
    #[serde(with = "wire::cbor_bytes")]
    pub body: Vec<u8>,
}

/// Tunnel protocol: CBOR wire frames, request ids, handshake and structured errors.
pub mod wire;
