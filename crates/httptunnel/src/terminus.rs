//! The serving side of the tunnel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use httptunnel_config::TerminusConfig;
use httptunnel_proto::wire::{Request, Response, RpcError as ProtoRpcError, RpcErrorCode};
use httptunnel_proto::{HttpRequest, HttpResponse};
use httptunnel_rpc::{RequestContext, RpcConnection, RpcTransportError, ServerConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::codec::unwrap_request;
use crate::context::Context;
use crate::error::{HandleError, StructuredError};
use crate::headers::{to_wire_headers, DO_NOT_LOG_ERROR_HEADER};
use crate::writer::Recorder;
use crate::Handler;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Replays tunneled requests against a local [`Handler`].
pub struct Server<H> {
    handler: Arc<H>,
    transport: ServerConfig,
    next_connection_id: Arc<AtomicU64>,
}

impl<H> Clone for Server<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            transport: self.transport.clone(),
            next_connection_id: self.next_connection_id.clone(),
        }
    }
}

impl<H: Handler> Server<H> {
    pub fn new(handler: H) -> Self {
        Self::with_transport(handler, ServerConfig::default())
    }

    pub fn with_transport(handler: H, transport: ServerConfig) -> Self {
        Self {
            handler: Arc::new(handler),
            transport,
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Runs one tunneled request to completion.
    ///
    /// Responses with a status of 500 or above come back as [`HandleError::Failure`] carrying
    /// the full response. If the handler set the `x-donotlogerror` header, the failure is marked
    /// do-not-log; the header itself never ends up in the response.
    pub async fn handle(&self, ctx: Context, req: HttpRequest) -> Result<HttpResponse, HandleError> {
        let req = unwrap_request(ctx, req)?;

        let mut recorder = Recorder::new();
        self.handler.serve(req, &mut recorder).await;

        let (status, headers, body) = recorder.into_parts();
        let response = HttpResponse {
            code: i32::from(status.as_u16()),
            headers: to_wire_headers(&headers),
            body,
        };
        if status.as_u16() >= 500 {
            let do_not_log = headers.contains_key(DO_NOT_LOG_ERROR_HEADER);
            return Err(StructuredError::new(response)
                .with_do_not_log(do_not_log)
                .into());
        }
        Ok(response)
    }

    /// Handshakes on `stream` and serves tunneled requests on it until the peer goes away.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<RpcConnection, RpcTransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut transport = self.transport.clone();
        transport.connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let server = self.clone();
        let (conn, welcome) = RpcConnection::handshake_as_server_with_handler(
            stream,
            transport,
            move |rpc_ctx: RequestContext, request: Request| {
                let server = server.clone();
                async move { server.dispatch(rpc_ctx, request).await }
            },
        )
        .await?;
        tracing::debug!(
            target: "httptunnel.terminus",
            connection_id = welcome.connection_id,
            "tunnel connection established"
        );
        Ok(conn)
    }

    /// Accepts tunnel connections until `shutdown` turns true or its sender is dropped.
    ///
    /// Connections still open at shutdown are closed.
    pub async fn serve(&self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let local_addr = listener.local_addr().context("listener address")?;
        tracing::info!(target: "httptunnel.terminus", addr = %local_addr, "serving tunnel");

        loop {
            tokio::select! {
                _ = shutdown_requested(&mut shutdown) => return Ok(()),
                res = listener.accept() => {
                    let (stream, peer_addr) = res.with_context(|| format!("accept tcp {local_addr}"))?;
                    let _ = stream.set_nodelay(true);
                    let server = self.clone();
                    let mut shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        let conn = match tokio::time::timeout(HANDSHAKE_TIMEOUT, server.serve_connection(stream)).await {
                            Ok(Ok(conn)) => conn,
                            Ok(Err(err)) => {
                                tracing::warn!(target: "httptunnel.terminus", %peer_addr, error = %err, "tunnel handshake failed");
                                return;
                            }
                            Err(_) => {
                                tracing::warn!(target: "httptunnel.terminus", %peer_addr, "tunnel handshake timed out");
                                return;
                            }
                        };
                        tokio::select! {
                            _ = conn.closed() => {}
                            _ = shutdown_requested(&mut shutdown) => {
                                let _ = conn.shutdown().await;
                            }
                        }
                        tracing::debug!(target: "httptunnel.terminus", %peer_addr, "tunnel connection closed");
                    });
                }
            }
        }
    }

    /// Binds the configured address and serves until `shutdown` turns true.
    pub async fn serve_config(&self, config: &TerminusConfig, shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("bind tcp listener {}", config.listen))?;

        let mut server = self.clone();
        server.transport.capabilities.max_frame_len = config.max_frame_len;
        server.transport.capabilities.max_packet_len = config.max_frame_len;
        server.serve(listener, shutdown).await
    }

    async fn dispatch(&self, rpc_ctx: RequestContext, request: Request) -> Result<Response, ProtoRpcError> {
        let req = match request {
            Request::Handle(req) => req,
            Request::Unknown => {
                return Err(ProtoRpcError::new(
                    RpcErrorCode::InvalidRequest,
                    "unknown request type",
                ))
            }
        };

        let method = req.method.clone();
        let url = req.url.clone();
        let ctx = Context::with_cancellation(rpc_ctx.cancellation());
        match self.handle(ctx, req).await {
            Ok(resp) => Ok(Response::Handle(resp)),
            Err(err) => {
                log_failure(&err, rpc_ctx.request_id(), &method, &url);
                Err(err.into_rpc_error())
            }
        }
    }
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn log_failure(err: &HandleError, request_id: u64, method: &str, url: &str) {
    match err {
        HandleError::Failure(failure) if failure.do_not_log() => {
            tracing::debug!(
                target: "httptunnel.terminus",
                request_id,
                method,
                url,
                status = failure.response().code,
                "request failed"
            );
        }
        HandleError::Failure(failure) => {
            tracing::warn!(
                target: "httptunnel.terminus",
                request_id,
                method,
                url,
                status = failure.response().code,
                error = %failure,
                "request failed"
            );
        }
        HandleError::Malformed(malformed) => {
            tracing::warn!(
                target: "httptunnel.terminus",
                request_id,
                error = %malformed,
                "rejected malformed request"
            );
        }
    }
}
