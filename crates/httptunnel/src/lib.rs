//! HTTP tunneling over a multiplexed RPC connection.
//!
//! An origin ([`Client`]) is a [`Handler`] that forwards every request it receives through the
//! tunnel; a terminus ([`Server`]) replays each tunneled request against a local [`Handler`]
//! and sends back what it wrote. Status codes, headers and bodies survive the trip unchanged.
//!
//! Responses with a status of 500 or above travel as failures ([`StructuredError`]) so that
//! RPC-level error handling sees them, but they still carry the complete response and the
//! origin writes it out as-is. Any failure that carries no response reaches the caller as a
//! plain `500` with the error text as body.

use std::future::Future;
use std::pin::Pin;

mod body;
mod context;
mod handler;
mod writer;

pub mod address;
pub mod channel;
pub mod codec;
pub mod discovery;
pub mod error;
pub mod headers;
pub mod origin;
pub mod terminus;
pub mod trace;

pub use address::{parse_url, AddressError, Target};
pub use body::Body;
pub use channel::{Channel, ChannelConfig, ChannelError};
pub use codec::{unwrap_request, wrap_request, write_error, write_response};
pub use context::{Context, RawTarget};
pub use discovery::{Discovery, DnsResolver, Resolver, StaticResolver};
pub use error::{HandleError, MalformedRequest, Outcome, StructuredError};
pub use handler::{handler_fn, Handler, HandlerFn};
pub use headers::{from_wire_headers, to_wire_headers, DO_NOT_LOG_ERROR_HEADER};
pub use origin::{Client, HttpClient};
pub use terminus::Server;
pub use trace::{Propagator, SpanContext, TraceContextPropagator};
pub use writer::{Recorder, ResponseWriter};

pub use httptunnel_proto::{Header, HttpRequest, HttpResponse};

/// A native request as handlers see it.
pub type Request = http::Request<Body>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
