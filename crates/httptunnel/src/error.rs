use std::fmt;

use httptunnel_proto::wire::{RpcError as ProtoRpcError, RpcErrorCode};
use httptunnel_proto::HttpResponse;

use crate::channel::ChannelError;
use crate::headers::HeaderError;

/// A tunneled request that cannot be turned back into a native request.
#[derive(Debug, thiserror::Error)]
pub enum MalformedRequest {
    #[error("invalid method {method:?}: {source}")]
    Method {
        method: String,
        #[source]
        source: http::method::InvalidMethod,
    },
    #[error("invalid request target {target:?}: {source}")]
    Target {
        target: String,
        #[source]
        source: http::uri::InvalidUri,
    },
    #[error(transparent)]
    Header(#[from] HeaderError),
}

/// A failure that carries a complete HTTP response.
///
/// The terminus produces one for every 5xx response so that RPC-level error handling sees a
/// failure, while the response itself stays recoverable byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredError {
    response: HttpResponse,
    do_not_log: bool,
}

impl StructuredError {
    pub fn new(response: HttpResponse) -> Self {
        Self {
            response,
            do_not_log: false,
        }
    }

    pub fn with_do_not_log(mut self, do_not_log: bool) -> Self {
        self.do_not_log = do_not_log;
        self
    }

    /// Whether error-logging middleware should stay quiet about this failure.
    pub fn do_not_log(&self) -> bool {
        self.do_not_log
    }

    pub fn response(&self) -> &HttpResponse {
        &self.response
    }

    pub fn into_response(self) -> HttpResponse {
        self.response
    }

    /// Recovers a structured error from a remote failure, if the peer embedded a response.
    pub fn from_rpc_error(err: &ProtoRpcError) -> Option<Self> {
        let response = err.response.clone()?;
        Some(Self {
            response,
            do_not_log: err.do_not_log,
        })
    }

    pub fn into_rpc_error(self) -> ProtoRpcError {
        let mut err = ProtoRpcError::new(RpcErrorCode::HttpStatus, self.to_string());
        err.response = Some(self.response);
        err.do_not_log = self.do_not_log;
        err
    }
}

impl fmt::Display for StructuredError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "HTTP status {}: {}",
            self.response.code,
            String::from_utf8_lossy(&self.response.body)
        )
    }
}

impl std::error::Error for StructuredError {}

/// Why the terminus did not produce a plain response.
#[derive(Debug, thiserror::Error)]
pub enum HandleError {
    #[error("malformed request: {0}")]
    Malformed(#[from] MalformedRequest),
    #[error(transparent)]
    Failure(#[from] StructuredError),
}

impl HandleError {
    pub fn into_rpc_error(self) -> ProtoRpcError {
        match self {
            HandleError::Malformed(err) => {
                ProtoRpcError::new(RpcErrorCode::InvalidRequest, format!("malformed request: {err}"))
            }
            HandleError::Failure(err) => err.into_rpc_error(),
        }
    }
}

/// The result of a tunneled call as the origin sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Response(HttpResponse),
    Failure(StructuredError),
    /// No response could be recovered; the message describes what went wrong.
    Transport(String),
}

impl Outcome {
    pub fn from_result(result: Result<HttpResponse, ChannelError>) -> Self {
        match result {
            Ok(response) => Outcome::Response(response),
            Err(err) => match err.remote().and_then(StructuredError::from_rpc_error) {
                Some(structured) => Outcome::Failure(structured),
                None => Outcome::Transport(err.to_string()),
            },
        }
    }

    /// The response to forward to the caller, or the transport failure's message.
    pub fn into_response(self) -> Result<HttpResponse, String> {
        match self {
            Outcome::Response(response) => Ok(response),
            Outcome::Failure(err) => Ok(err.into_response()),
            Outcome::Transport(message) => Err(message),
        }
    }
}
