//! Load-balanced connections to the terminus instances behind one address.

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use httptunnel_proto::wire::{Request, Response, RpcError as ProtoRpcError};
use httptunnel_proto::{HttpRequest, HttpResponse};
use httptunnel_rpc::{ClientConfig, RpcConnection, RpcError, RpcTransportError};
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::address::Target;
use crate::context::Context;
use crate::discovery::{Discovery, DiscoveryError};
use crate::origin::HttpClient;
use crate::BoxFuture;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("no terminus reachable at {target}: {reason}")]
    Unavailable { target: String, reason: String },
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl ChannelError {
    /// The structured error sent by the terminus, if the call reached it and failed there.
    pub fn remote(&self) -> Option<&ProtoRpcError> {
        match self {
            ChannelError::Rpc(err) => err.remote(),
            _ => None,
        }
    }
}

/// Settings for a [`Channel`].
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Limit for dialing and handshaking with one terminus instance.
    pub connect_timeout: Duration,
    /// Age after which a call triggers a background re-resolve of the address.
    pub refresh_interval: Duration,
    pub client: ClientConfig,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            client: ClientConfig::default(),
        }
    }
}

/// A lazily established set of connections to every terminus behind one canonical address.
///
/// Nothing is dialed until the first call. That call resolves the address and connects to
/// all endpoints at once; unreachable ones are skipped. Later calls rotate over the open
/// connections. Once the set is older than the refresh interval, or one of its connections
/// has closed, a call kicks off a background refresh: the address is resolved again, new
/// endpoints are dialed, endpoints no longer listed are closed and live ones are kept.
/// Callers only wait for connection setup when no connection is open, and never past their
/// own deadline.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    target: Target,
    discovery: Discovery,
    config: ChannelConfig,
    pool: RwLock<Option<Arc<Pool>>>,
    /// Serializes rebuilds of `pool`.
    rebuilding: Mutex<()>,
    refreshing: AtomicBool,
    next: AtomicUsize,
}

#[derive(Clone)]
struct Endpoint {
    addr: SocketAddr,
    conn: RpcConnection,
}

struct Pool {
    endpoints: Vec<Endpoint>,
    resolved_at: Instant,
}

impl Pool {
    fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            resolved_at: Instant::now(),
        }
    }

    fn live(&self) -> impl Iterator<Item = &Endpoint> {
        self.endpoints.iter().filter(|ep| !ep.conn.is_closed())
    }

    fn needs_refresh(&self, interval: Duration) -> bool {
        self.resolved_at.elapsed() >= interval
            || self.endpoints.iter().any(|ep| ep.conn.is_closed())
    }

    /// Next open connection in rotation.
    fn pick(&self, next: &AtomicUsize) -> Option<&RpcConnection> {
        let len = self.endpoints.len();
        let start = next.fetch_add(1, Ordering::Relaxed);
        (0..len)
            .map(|i| &self.endpoints[(start + i) % len])
            .find(|ep| !ep.conn.is_closed())
            .map(|ep| &ep.conn)
    }
}

impl Channel {
    pub fn new(target: Target, discovery: Discovery) -> Self {
        Self::with_config(target, discovery, ChannelConfig::default())
    }

    pub fn with_config(target: Target, discovery: Discovery, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                target,
                discovery,
                config,
                pool: RwLock::new(None),
                rebuilding: Mutex::new(()),
                refreshing: AtomicBool::new(false),
                next: AtomicUsize::new(0),
            }),
        }
    }

    pub fn target(&self) -> &Target {
        &self.inner.target
    }

    /// Number of open connections, or zero before the first call.
    pub fn connection_count(&self) -> usize {
        self.inner
            .current()
            .map_or(0, |pool| pool.live().count())
    }

    pub async fn call(&self, ctx: &Context, req: HttpRequest) -> Result<HttpResponse, ChannelError> {
        let pool = tokio::select! {
            pool = self.pool() => pool?,
            () = ctx.done() => return Err(interrupted(ctx)),
        };
        let conn = pool.pick(&self.inner.next).ok_or_else(|| ChannelError::Unavailable {
            target: self.inner.target.to_string(),
            reason: "every connection is closed".to_owned(),
        })?;
        call_connection(conn, ctx, req).await
    }

    async fn pool(&self) -> Result<Arc<Pool>, ChannelError> {
        if let Some(pool) = self.inner.current() {
            if pool.live().next().is_some() {
                if pool.needs_refresh(self.inner.config.refresh_interval) {
                    self.refresh_in_background();
                }
                return Ok(pool);
            }
        }

        // The rebuild runs on its own task, so a caller that gives up does not abandon
        // handshakes other callers are waiting on.
        let inner = self.inner.clone();
        tokio::spawn(async move { inner.refresh().await })
            .await
            .unwrap_or_else(|err| {
                Err(ChannelError::Unavailable {
                    target: self.inner.target.to_string(),
                    reason: format!("connection setup failed: {err}"),
                })
            })
    }

    fn refresh_in_background(&self) {
        if self.inner.refreshing.swap(true, Ordering::AcqRel) {
            return;
        }
        let inner = self.inner.clone();
        tokio::spawn(async move {
            if let Err(err) = inner.refresh().await {
                tracing::warn!(
                    target: "httptunnel.channel",
                    target_addr = %inner.target,
                    error = %err,
                    "failed to refresh terminus connections"
                );
            }
            inner.refreshing.store(false, Ordering::Release);
        });
    }
}

impl ChannelInner {
    fn current(&self) -> Option<Arc<Pool>> {
        self.pool.read().clone()
    }

    async fn refresh(&self) -> Result<Arc<Pool>, ChannelError> {
        let _rebuilding = self.rebuilding.lock().await;
        let current = self.current();
        // Someone else may have rebuilt while we waited for the lock.
        if let Some(pool) = &current {
            if pool.live().next().is_some() && !pool.needs_refresh(self.config.refresh_interval) {
                return Ok(pool.clone());
            }
        }

        let pool = Arc::new(self.rebuild(current.as_deref()).await?);
        tracing::debug!(
            target: "httptunnel.channel",
            target_addr = %self.target,
            connections = pool.endpoints.len(),
            "terminus connections refreshed"
        );
        *self.pool.write() = Some(pool.clone());
        Ok(pool)
    }

    async fn rebuild(&self, previous: Option<&Pool>) -> Result<Pool, ChannelError> {
        let live: Vec<Endpoint> = previous.map_or_else(Vec::new, |pool| pool.live().cloned().collect());
        let addrs = match self.discovery.resolve(&self.target).await {
            Ok(addrs) => addrs,
            Err(err) if !live.is_empty() => {
                tracing::warn!(
                    target: "httptunnel.channel",
                    target_addr = %self.target,
                    error = %err,
                    "failed to resolve termini; keeping existing connections"
                );
                return Ok(Pool::new(live));
            }
            Err(err) => return Err(err.into()),
        };

        let (kept, gone): (Vec<_>, Vec<_>) =
            live.into_iter().partition(|ep| addrs.contains(&ep.addr));
        for ep in gone {
            tracing::debug!(target: "httptunnel.channel", addr = %ep.addr, "terminus no longer resolved; closing");
            let _ = ep.conn.shutdown().await;
        }

        let mut seen: HashSet<SocketAddr> = kept.iter().map(|ep| ep.addr).collect();
        let fresh = addrs.into_iter().filter(|addr| seen.insert(*addr));
        let dialed = join_all(fresh.map(|addr| self.dial(addr))).await;

        let mut endpoints = kept;
        let mut last_err = String::new();
        for result in dialed {
            match result {
                Ok(ep) => endpoints.push(ep),
                Err(reason) => last_err = reason,
            }
        }
        if endpoints.is_empty() {
            return Err(ChannelError::Unavailable {
                target: self.target.to_string(),
                reason: last_err,
            });
        }
        Ok(Pool::new(endpoints))
    }

    async fn dial(&self, addr: SocketAddr) -> Result<Endpoint, String> {
        let attempt = async {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(RpcTransportError::from)?;
            let _ = stream.set_nodelay(true);
            RpcConnection::handshake_as_client_with_config(stream, self.config.client.clone()).await
        };
        match tokio::time::timeout(self.config.connect_timeout, attempt).await {
            Ok(Ok((conn, welcome))) => {
                tracing::debug!(
                    target: "httptunnel.channel",
                    %addr,
                    connection_id = welcome.connection_id,
                    "connected to terminus"
                );
                Ok(Endpoint { addr, conn })
            }
            Ok(Err(err)) => {
                tracing::warn!(target: "httptunnel.channel", %addr, error = %err, "failed to connect to terminus");
                Err(err.to_string())
            }
            Err(_) => {
                tracing::warn!(target: "httptunnel.channel", %addr, "timed out connecting to terminus");
                Err(format!("timed out connecting to {addr}"))
            }
        }
    }
}

/// Why a call stopped waiting: its deadline passed, or it was cancelled.
fn interrupted(ctx: &Context) -> ChannelError {
    if ctx.deadline().is_some_and(|deadline| Instant::now() >= deadline) {
        ChannelError::DeadlineExceeded
    } else {
        RpcError::Canceled.into()
    }
}

async fn call_connection(
    conn: &RpcConnection,
    ctx: &Context,
    req: HttpRequest,
) -> Result<HttpResponse, ChannelError> {
    match conn.call_until(Request::Handle(req), ctx.done()).await {
        Ok(Response::Handle(resp)) => Ok(resp),
        Ok(Response::Unknown) => Err(RpcError::UnexpectedResponse.into()),
        Err(RpcError::Canceled) => Err(interrupted(ctx)),
        Err(err) => Err(err.into()),
    }
}

/// A single established connection, without discovery or reconnects.
impl HttpClient for RpcConnection {
    fn handle<'a>(
        &'a self,
        ctx: &'a Context,
        req: HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, ChannelError>> {
        Box::pin(call_connection(self, ctx, req))
    }
}

impl HttpClient for Channel {
    fn handle<'a>(
        &'a self,
        ctx: &'a Context,
        req: HttpRequest,
    ) -> BoxFuture<'a, Result<HttpResponse, ChannelError>> {
        Box::pin(self.call(ctx, req))
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("target", &self.inner.target)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
