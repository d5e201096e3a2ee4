//! Tokio runtime for the tunnel's RPC protocol.
//!
//! A connection opens with a hello/welcome handshake that settles the protocol version and
//! the frame and packet limits. After that both sides exchange length-prefixed CBOR frames
//! carrying multiplexed requests, responses and cancellations. Either side may issue
//! requests: the client allocates odd request ids and the server even ones.

mod cancel;
mod connection;
mod frame;
mod handshake;

use httptunnel_proto::wire::RpcError as ProtoRpcError;

pub use cancel::{CancellationToken, RequestContext};
pub use connection::RpcConnection;
pub use handshake::{
    default_client_hello, ClientConfig, ServerConfig, DEFAULT_PRE_HANDSHAKE_MAX_FRAME_LEN,
};

pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcRole {
    Client,
    Server,
}

impl RpcRole {
    /// First id this side hands out; ids then advance by two.
    fn first_request_id(self) -> RequestId {
        match self {
            RpcRole::Client => 1,
            RpcRole::Server => 2,
        }
    }

    /// Whether `id` could have been allocated by this side.
    fn owns(self, id: RequestId) -> bool {
        id % 2 == self.first_request_id() % 2
    }
}

/// Failures that take down the whole connection.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RpcTransportError {
    #[error("i/o: {message}")]
    Io { message: String },

    #[error("cannot allocate frame buffer: {message}")]
    AllocationFailed { message: String },

    #[error("frame of {len} bytes exceeds the limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("packet of {len} bytes exceeds the limit of {max}")]
    PacketTooLarge { len: usize, max: usize },

    #[error("malformed frame: {message}")]
    DecodeError { message: String },

    #[error("cannot encode frame: {message}")]
    EncodeError { message: String },

    #[error("handshake failed: {message}")]
    HandshakeFailed { message: String },

    #[error("protocol violation: {message}")]
    ProtocolViolation { message: String },

    #[error("connection closed")]
    ConnectionClosed,
}

impl From<std::io::Error> for RpcTransportError {
    fn from(err: std::io::Error) -> Self {
        RpcTransportError::Io {
            message: err.to_string(),
        }
    }
}

/// Failure of a single call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Transport(#[from] RpcTransportError),

    #[error("remote error: {}", .0.message)]
    Remote(ProtoRpcError),

    #[error("request cancelled")]
    Canceled,

    #[error("unexpected response payload")]
    UnexpectedResponse,
}

impl RpcError {
    /// The structured error sent by the peer, if this failure came from the remote handler.
    pub fn remote(&self) -> Option<&ProtoRpcError> {
        match self {
            RpcError::Remote(err) => Some(err),
            _ => None,
        }
    }
}
