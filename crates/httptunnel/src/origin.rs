//! The forwarding side of the tunnel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use httptunnel_config::OriginConfig;
use httptunnel_proto::{HttpRequest, HttpResponse};

use crate::address::{parse_url, AddressError, Target};
use crate::channel::{Channel, ChannelConfig, ChannelError};
use crate::codec::{internal_error, wrap_request, write_response};
use crate::context::Context;
use crate::discovery::Discovery;
use crate::error::Outcome;
use crate::trace::{Propagator, TraceContextPropagator};
use crate::{BoxFuture, Handler, Request, ResponseWriter};

/// Sends one tunneled request to a terminus.
pub trait HttpClient: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        ctx: &'a Context,
        req: HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, ChannelError>>;
}

impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    fn handle<'a>(
        &'a self,
        ctx: &'a Context,
        req: HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, ChannelError>> {
        (**self).handle(ctx, req)
    }
}

/// A [`Handler`] that forwards every request through the tunnel.
///
/// Whatever happens along the way, the caller gets a response: the terminus' response (5xx
/// included) when one comes back, a plain `500` carrying the error text otherwise.
pub struct Client<C = Channel> {
    client: C,
    propagator: Option<Arc<dyn Propagator>>,
    request_timeout: Option<Duration>,
}

impl Client<Channel> {
    /// Normalizes `address` and prepares a channel to it. No connection is made yet.
    pub fn new(address: &str, discovery: Discovery) -> Result<Self, AddressError> {
        let target = Target::parse(&parse_url(address)?);
        Ok(Self::with_client(Channel::new(target, discovery)))
    }

    pub fn from_config(config: &OriginConfig, discovery: Discovery) -> Result<Self, AddressError> {
        let target = Target::parse(&parse_url(&config.address)?);
        tracing::info!(target: "httptunnel.origin", address = %target, "configured tunnel origin");
        let channel = Channel::with_config(
            target,
            discovery,
            ChannelConfig {
                connect_timeout: config.connect_timeout(),
                refresh_interval: config.refresh_interval(),
                ..ChannelConfig::default()
            },
        );
        let mut client = Self::with_client(channel);
        client.request_timeout = config.request_timeout();
        Ok(client)
    }

    pub fn channel(&self) -> &Channel {
        &self.client
    }
}

impl<C: HttpClient> Client<C> {
    /// Uses `client` for the calls and W3C trace context propagation.
    pub fn with_client(client: C) -> Self {
        Self {
            client,
            propagator: Some(Arc::new(TraceContextPropagator)),
            request_timeout: None,
        }
    }

    pub fn with_propagator(mut self, propagator: impl Propagator) -> Self {
        self.propagator = Some(Arc::new(propagator));
        self
    }

    pub fn without_propagator(mut self) -> Self {
        self.propagator = None;
        self
    }

    /// Deadline for requests whose [`Context`] does not carry one.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    async fn forward(&self, req: Request, w: &mut dyn ResponseWriter) {
        let (mut parts, body) = req.into_parts();
        if let Some(propagator) = &self.propagator {
            if let Err(err) = propagator.inject(&parts.extensions, &mut parts.headers) {
                tracing::warn!(
                    target: "httptunnel.origin",
                    error = %err,
                    "failed to inject tracing headers into request"
                );
            }
        }

        let mut ctx = parts.extensions.get::<Context>().cloned().unwrap_or_default();
        if let (None, Some(timeout)) = (ctx.deadline(), self.request_timeout) {
            ctx = ctx.with_timeout(timeout);
        }

        let mut req = Request::from_parts(parts, body);
        let wrapped = match wrap_request(&mut req) {
            Ok(wrapped) => wrapped,
            Err(err) => {
                tracing::warn!(target: "httptunnel.origin", error = %err, "failed to read request body");
                internal_error(w, &err.to_string());
                return;
            }
        };

        let outcome = Outcome::from_result(self.client.handle(&ctx, wrapped).await);
        match outcome.into_response() {
            Ok(resp) => {
                if let Err(err) = write_response(w, &resp) {
                    tracing::warn!(target: "httptunnel.origin", error = %err, "failed to write tunneled response");
                    internal_error(w, &err.to_string());
                }
            }
            Err(message) => {
                tracing::warn!(target: "httptunnel.origin", error = %message, "tunneled request failed");
                internal_error(w, &message);
            }
        }
    }
}

impl<C: HttpClient> Handler for Client<C> {
    fn serve<'a>(&'a self, req: Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        Box::pin(self.forward(req, w))
    }
}

impl<C: fmt::Debug> fmt::Debug for Client<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("client", &self.client)
            .field("propagator", &self.propagator.is_some())
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
