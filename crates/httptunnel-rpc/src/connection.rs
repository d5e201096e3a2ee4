use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use httptunnel_proto::wire::{
    self, Capabilities, Request, Response, RpcError as ProtoRpcError,
    RpcErrorCode, RpcPayload, RpcResult, ServerWelcome, WireFrame,
};
use parking_lot::{Mutex, RwLock};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};

use crate::cancel::{CancellationToken, RequestContext};
use crate::handshake::{self, ClientConfig, ServerConfig};
use crate::{frame, RequestId, RpcError, RpcRole, RpcTransportError};

/// Frames queued for the writer before senders start waiting.
const OUTBOX_CAPACITY: usize = 256;

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Response, ProtoRpcError>> + Send>>;
type Handler = Arc<dyn Fn(RequestContext, Request) -> HandlerFuture + Send + Sync>;
type Reply = Result<Response, RpcError>;

fn boxed<H, Fut>(handler: H) -> Handler
where
    H: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response, ProtoRpcError>> + Send + 'static,
{
    Arc::new(move |ctx, req| Box::pin(handler(ctx, req)))
}

/// One end of an established connection. Clones share the connection.
///
/// A reader task and a writer task run for as long as the connection is open. Calls made
/// through any clone are multiplexed over it, and requests from the peer are dispatched to
/// the installed handler on their own tasks.
#[derive(Clone)]
pub struct RpcConnection {
    shared: Arc<Shared>,
    welcome: ServerWelcome,
}

struct Shared {
    role: RpcRole,
    limits: Capabilities,
    next_id: AtomicU64,
    outbox: mpsc::Sender<Bytes>,
    /// `Some` once the connection is closed, holding the reason.
    state: watch::Sender<Option<RpcTransportError>>,
    /// Our calls waiting for a reply.
    awaiting: Mutex<HashMap<RequestId, oneshot::Sender<Reply>>>,
    /// Peer calls being served, keyed to the sender that cancels them.
    serving: Mutex<HashMap<RequestId, watch::Sender<bool>>>,
    handler: RwLock<Option<Handler>>,
}

impl RpcConnection {
    pub async fn handshake_as_server<S>(stream: S) -> Result<(Self, ServerWelcome), RpcTransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::accept(stream, &ServerConfig::default(), None).await
    }

    /// Server handshake with `handler` already installed when the first request arrives.
    pub async fn handshake_as_server_with_handler<S, H, Fut>(
        stream: S,
        cfg: ServerConfig,
        handler: H,
    ) -> Result<(Self, ServerWelcome), RpcTransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
        H: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, ProtoRpcError>> + Send + 'static,
    {
        Self::accept(stream, &cfg, Some(boxed(handler))).await
    }

    async fn accept<S>(
        mut stream: S,
        cfg: &ServerConfig,
        handler: Option<Handler>,
    ) -> Result<(Self, ServerWelcome), RpcTransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let welcome = handshake::accept(&mut stream, cfg).await?;
        let conn = Self::start(stream, RpcRole::Server, welcome.clone(), handler);
        Ok((conn, welcome))
    }

    pub async fn handshake_as_client<S>(stream: S) -> Result<(Self, ServerWelcome), RpcTransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::handshake_as_client_with_config(stream, ClientConfig::default()).await
    }

    pub async fn handshake_as_client_with_config<S>(
        mut stream: S,
        cfg: ClientConfig,
    ) -> Result<(Self, ServerWelcome), RpcTransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let welcome = handshake::connect(&mut stream, &cfg).await?;
        let conn = Self::start(stream, RpcRole::Client, welcome.clone(), None);
        Ok((conn, welcome))
    }

    fn start<S>(stream: S, role: RpcRole, welcome: ServerWelcome, handler: Option<Handler>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (outbox, queue) = mpsc::channel(OUTBOX_CAPACITY);
        let shared = Arc::new(Shared {
            role,
            limits: welcome.chosen_capabilities.clone(),
            next_id: AtomicU64::new(role.first_request_id()),
            outbox,
            state: watch::channel(None).0,
            awaiting: Mutex::new(HashMap::new()),
            serving: Mutex::new(HashMap::new()),
            handler: RwLock::new(handler),
        });

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(read_task(reader, shared.clone()));
        tokio::spawn(write_task(writer, shared.clone(), queue));

        Self { shared, welcome }
    }

    pub fn welcome(&self) -> &ServerWelcome {
        &self.welcome
    }

    pub fn negotiated_capabilities(&self) -> &Capabilities {
        &self.shared.limits
    }

    pub fn role(&self) -> RpcRole {
        self.shared.role
    }

    /// Installs the handler for requests sent by the peer, replacing any previous one.
    /// Requests already being served keep the handler they started with.
    pub fn set_request_handler<H, Fut>(&self, handler: H)
    where
        H: Fn(RequestContext, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response, ProtoRpcError>> + Send + 'static,
    {
        *self.shared.handler.write() = Some(boxed(handler));
    }

    pub async fn call(&self, request: Request) -> Result<Response, RpcError> {
        self.call_until(request, std::future::pending()).await
    }

    /// Like [`RpcConnection::call`], but gives up as soon as `cancelled` resolves.
    ///
    /// On cancellation the peer is told to stop (when both sides negotiated cancel support)
    /// and [`RpcError::Canceled`] is returned without waiting for its reply.
    pub async fn call_until<F>(&self, request: Request, cancelled: F) -> Result<Response, RpcError>
    where
        F: Future<Output = ()>,
    {
        if let Some(err) = self.shared.close_reason() {
            return Err(err.into());
        }

        let id = self.shared.next_id.fetch_add(2, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.shared.awaiting.lock().insert(id, tx);
        let _pending = Pending {
            shared: &self.shared,
            id,
        };

        self.shared.send(id, RpcPayload::Request(request)).await?;

        tokio::pin!(cancelled);
        tokio::select! {
            reply = rx => reply.unwrap_or(Err(RpcTransportError::ConnectionClosed.into())),
            () = &mut cancelled => {
                if self.shared.limits.supports_cancel {
                    if let Err(err) = self.shared.send(id, RpcPayload::Cancel).await {
                        tracing::debug!(target: "httptunnel.rpc", request_id = id, error = %err, "failed to send cancel");
                    }
                }
                Err(RpcError::Canceled)
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.close_reason().is_some()
    }

    /// Resolves once the connection has closed, locally or because the peer went away.
    pub async fn closed(&self) {
        wait_closed(&mut self.shared.state.subscribe()).await;
    }

    /// Closes the connection. Calls still waiting fail with
    /// [`RpcTransportError::ConnectionClosed`] and handlers serving the peer are cancelled.
    pub async fn shutdown(&self) -> Result<(), RpcTransportError> {
        self.shared.close(RpcTransportError::ConnectionClosed);
        Ok(())
    }
}

impl fmt::Debug for RpcConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcConnection")
            .field("role", &self.shared.role)
            .field("welcome", &self.welcome)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Forgets an outgoing call when `call_until` returns or its future is dropped.
struct Pending<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for Pending<'_> {
    fn drop(&mut self) {
        self.shared.awaiting.lock().remove(&self.id);
    }
}

/// Forgets a peer call once its handler has finished, panicked or been dropped.
struct Serving<'a> {
    shared: &'a Shared,
    id: RequestId,
}

impl Drop for Serving<'_> {
    fn drop(&mut self) {
        self.shared.serving.lock().remove(&self.id);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

impl Shared {
    fn close_reason(&self) -> Option<RpcTransportError> {
        self.state.borrow().clone()
    }

    /// Records the first close reason and fails everything still in flight. Later calls
    /// are no-ops.
    fn close(&self, reason: RpcTransportError) {
        let first = self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(reason.clone());
            true
        });
        if !first {
            return;
        }

        tracing::debug!(target: "httptunnel.rpc", role = ?self.role, error = %reason, "rpc connection closed");
        let awaiting: Vec<_> = self.awaiting.lock().drain().map(|(_, tx)| tx).collect();
        for tx in awaiting {
            let _ = tx.send(Err(reason.clone().into()));
        }
        for (_, cancel) in self.serving.lock().drain() {
            let _ = cancel.send(true);
        }
    }

    async fn send(&self, id: RequestId, payload: RpcPayload) -> Result<(), RpcTransportError> {
        if let Some(err) = self.close_reason() {
            return Err(err);
        }

        let data = wire::encode_rpc_payload(&payload).map_err(|err| {
            RpcTransportError::EncodeError {
                message: err.to_string(),
            }
        })?;
        let max = self.limits.max_packet_len as usize;
        if data.len() > max {
            return Err(RpcTransportError::PacketTooLarge {
                len: data.len(),
                max,
            });
        }

        let bytes = frame::encode(&WireFrame::Packet { id, data }, self.limits.max_frame_len)?;
        self.outbox
            .send(bytes)
            .await
            .map_err(|_| RpcTransportError::ConnectionClosed)
    }

    fn on_packet(self: &Arc<Self>, id: RequestId, data: Vec<u8>) -> Result<(), RpcTransportError> {
        let max = self.limits.max_packet_len as usize;
        if data.len() > max {
            return Err(RpcTransportError::PacketTooLarge {
                len: data.len(),
                max,
            });
        }
        let payload = wire::decode_rpc_payload(&data).map_err(|err| {
            RpcTransportError::DecodeError {
                message: err.to_string(),
            }
        })?;

        match payload {
            RpcPayload::Response(result) => {
                let waiter = self.awaiting.lock().remove(&id);
                if let Some(tx) = waiter {
                    let _ = tx.send(into_reply(result));
                }
            }
            RpcPayload::Request(request) => {
                if self.role.owns(id) {
                    return Err(RpcTransportError::ProtocolViolation {
                        message: format!("peer sent request {id} with our id parity"),
                    });
                }
                self.serve(id, request);
            }
            RpcPayload::Cancel => {
                if self.limits.supports_cancel {
                    if let Some(cancel) = self.serving.lock().get(&id) {
                        let _ = cancel.send(true);
                    }
                }
            }
            RpcPayload::Unknown => {}
        }
        Ok(())
    }

    fn serve(self: &Arc<Self>, id: RequestId, request: Request) {
        let handler = self.handler.read().clone();
        let (cancel_tx, cancel) = CancellationToken::channel();
        // Registered before the task starts so a cancel that follows right behind the
        // request still finds it.
        self.serving.lock().insert(id, cancel_tx);

        let shared = self.clone();
        tokio::spawn(async move {
            let serving = Serving { shared: &shared, id };
            let ctx = RequestContext::new(id, cancel);
            let result = match handler {
                Some(handler) => AssertUnwindSafe(async move { handler(ctx, request).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        tracing::error!(
                            target: "httptunnel.rpc",
                            request_id = id,
                            panic = panic_message(&*panic),
                            "request handler panicked"
                        );
                        Err(ProtoRpcError::new(
                            RpcErrorCode::Internal,
                            "request handler panicked",
                        ))
                    }),
                None => Err(ProtoRpcError::new(
                    RpcErrorCode::InvalidRequest,
                    "no request handler installed",
                )),
            };
            drop(serving);
            shared.reply(id, result).await;
        });
    }

    async fn reply(&self, id: RequestId, result: Result<Response, ProtoRpcError>) {
        let result = match result {
            Ok(value) => RpcResult::Ok { value },
            Err(error) => RpcResult::Err { error },
        };
        let err = match self.send(id, RpcPayload::Response(result)).await {
            Ok(()) => return,
            Err(err) => err,
        };

        // An oversized reply fails only this call.
        let err = match err {
            RpcTransportError::PacketTooLarge { .. } | RpcTransportError::FrameTooLarge { .. } => {
                let error = ProtoRpcError::new(RpcErrorCode::TooLarge, err.to_string());
                match self.send(id, RpcPayload::Response(RpcResult::Err { error })).await {
                    Ok(()) => return,
                    Err(err) => err,
                }
            }
            other => other,
        };
        self.close(err);
    }
}

fn into_reply(result: RpcResult<Response>) -> Reply {
    match result {
        RpcResult::Ok { value } => Ok(value),
        RpcResult::Err { error } if error.code == RpcErrorCode::Cancelled => Err(RpcError::Canceled),
        RpcResult::Err { error } => Err(RpcError::Remote(error)),
        RpcResult::Unknown => Err(RpcError::UnexpectedResponse),
    }
}

async fn wait_closed(state: &mut watch::Receiver<Option<RpcTransportError>>) {
    while state.borrow_and_update().is_none() {
        if state.changed().await.is_err() {
            return;
        }
    }
}

async fn read_task<R>(mut io: R, shared: Arc<Shared>)
where
    R: AsyncRead + Unpin,
{
    let mut state = shared.state.subscribe();
    loop {
        let frame = tokio::select! {
            () = wait_closed(&mut state) => return,
            frame = frame::read(&mut io, shared.limits.max_frame_len) => frame,
        };
        let result = match frame {
            Ok(WireFrame::Packet { id, data }) => shared.on_packet(id, data),
            Ok(WireFrame::Unknown) => Ok(()),
            Ok(other) => Err(RpcTransportError::ProtocolViolation {
                message: format!("unexpected {} frame after the handshake", frame::kind(&other)),
            }),
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            shared.close(err);
            return;
        }
    }
}

async fn write_task<W>(mut io: W, shared: Arc<Shared>, mut queue: mpsc::Receiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    let mut state = shared.state.subscribe();
    loop {
        let bytes = tokio::select! {
            () = wait_closed(&mut state) => break,
            bytes = queue.recv() => match bytes {
                Some(bytes) => bytes,
                None => break,
            },
        };
        let written = match io.write_all(&bytes).await {
            Ok(()) => io.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            shared.close(err.into());
            break;
        }
    }
    let _ = io.shutdown().await;
}
