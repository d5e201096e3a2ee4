//! Name resolution for terminus addresses.
//!
//! A [`Discovery`] is built once at startup and handed to the origin. It maps the scheme of a
//! canonical address to the [`Resolver`] that turns its endpoint into socket addresses.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::address::{Target, KUBERNETES_SCHEME};
use crate::BoxFuture;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("no resolver registered for scheme {0:?}")]
    UnknownScheme(String),
    #[error("failed to resolve {target}: {source}")]
    Resolve {
        target: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} resolved to no endpoints")]
    NoEndpoints(String),
}

pub trait Resolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>>;
}

/// Resolves `host:port` through the system resolver.
///
/// Inside a cluster, service names such as `svc.ns:9095` resolve through cluster DNS, which
/// makes this the in-cluster resolver for `kubernetes:///` addresses too.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsResolver;

impl Resolver for DnsResolver {
    fn resolve<'a>(&'a self, endpoint: &'a str) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
        Box::pin(async move { Ok(tokio::net::lookup_host(endpoint).await?.collect()) })
    }
}

/// Resolves every endpoint to the same fixed set of addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    addrs: Vec<SocketAddr>,
}

impl StaticResolver {
    pub fn new(addrs: impl IntoIterator<Item = SocketAddr>) -> Self {
        Self {
            addrs: addrs.into_iter().collect(),
        }
    }
}

impl Resolver for StaticResolver {
    fn resolve<'a>(&'a self, _endpoint: &'a str) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
        let addrs = self.addrs.clone();
        Box::pin(async move { Ok(addrs) })
    }
}

#[derive(Clone)]
pub struct Discovery {
    direct: Arc<dyn Resolver>,
    schemes: HashMap<String, Arc<dyn Resolver>>,
}

impl Discovery {
    /// Direct addresses only, resolved through DNS.
    pub fn new() -> Self {
        Self {
            direct: Arc::new(DnsResolver),
            schemes: HashMap::new(),
        }
    }

    /// Direct addresses plus `kubernetes:///` addresses resolved through cluster DNS.
    pub fn in_cluster() -> Self {
        Self::new().with_resolver(KUBERNETES_SCHEME, DnsResolver)
    }

    pub fn with_resolver(mut self, scheme: impl Into<String>, resolver: impl Resolver) -> Self {
        self.schemes
            .insert(scheme.into().to_ascii_lowercase(), Arc::new(resolver));
        self
    }

    /// Replaces the resolver used for bare `host:port` addresses.
    pub fn with_direct_resolver(mut self, resolver: impl Resolver) -> Self {
        self.direct = Arc::new(resolver);
        self
    }

    pub async fn resolve(&self, target: &Target) -> Result<Vec<SocketAddr>, DiscoveryError> {
        let resolver = match &target.scheme {
            None => &self.direct,
            Some(scheme) => self
                .schemes
                .get(scheme)
                .ok_or_else(|| DiscoveryError::UnknownScheme(scheme.clone()))?,
        };

        let addrs = resolver
            .resolve(&target.endpoint)
            .await
            .map_err(|source| DiscoveryError::Resolve {
                target: target.to_string(),
                source,
            })?;
        if addrs.is_empty() {
            return Err(DiscoveryError::NoEndpoints(target.to_string()));
        }
        Ok(addrs)
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self::in_cluster()
    }
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut schemes: Vec<_> = self.schemes.keys().collect();
        schemes.sort();
        f.debug_struct("Discovery")
            .field("schemes", &schemes)
            .finish_non_exhaustive()
    }
}
