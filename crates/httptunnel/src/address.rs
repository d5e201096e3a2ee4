//! Normalization of configured terminus addresses.
//!
//! Accepted forms, checked in order:
//!
//! - anything containing `:///` is already a discovery address and is returned unchanged;
//! - `direct://host:port` addresses the terminus directly and yields the bare `host:port`;
//! - `kubernetes://name[.namespace[.domain]]:port`, or the same without any `scheme://`,
//!   yields `kubernetes:///name[.namespace[.domain]]:port`.
//!
//! Any other scheme is rejected, as is a discovery host without a port.

use std::fmt;

use url::Url;

pub const KUBERNETES_SCHEME: &str = "kubernetes";
pub const DIRECT_SCHEME: &str = "direct";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("invalid address {address:?}: {source}")]
    InvalidUrl {
        address: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unrecognised scheme: {0}")]
    UnrecognizedScheme(String),
    #[error("address {address}: missing port in address")]
    MissingPort { address: String },
    #[error("address {address}: missing host")]
    MissingHost { address: String },
    #[error("address {address}: {reason}")]
    InvalidHostPort {
        address: String,
        reason: &'static str,
    },
}

/// Turns a configured endpoint into the canonical address used for discovery.
pub fn parse_url(unparsed: &str) -> Result<String, AddressError> {
    if unparsed.contains(":///") {
        return Ok(unparsed.to_owned());
    }

    let (scheme, host) = if unparsed.contains("://") {
        let url = Url::parse(unparsed).map_err(|source| AddressError::InvalidUrl {
            address: unparsed.to_owned(),
            source,
        })?;
        let authority = url.authority();
        let host = authority
            .rsplit_once('@')
            .map_or(authority, |(_, host)| host)
            .to_owned();
        (url.scheme().to_owned(), host)
    } else {
        (KUBERNETES_SCHEME.to_owned(), unparsed.to_owned())
    };

    match scheme.as_str() {
        DIRECT_SCHEME => {
            if host.is_empty() {
                return Err(AddressError::MissingHost {
                    address: unparsed.to_owned(),
                });
            }
            Ok(host)
        }
        KUBERNETES_SCHEME => {
            let (host, port) = split_host_port(&host)?;
            if port.is_empty() {
                return Err(AddressError::MissingPort {
                    address: unparsed.to_owned(),
                });
            }
            let service = ServiceName::parse(host);
            Ok(format!(
                "{KUBERNETES_SCHEME}:///{}",
                join_host_port(&service.to_string(), port)
            ))
        }
        _ => Err(AddressError::UnrecognizedScheme(scheme)),
    }
}

/// A discovery host split into at most three dot-separated segments.
///
/// `svc`, `svc.ns` and `svc.ns.svc.cluster.local` all name the same kind of service; everything
/// past the namespace stays in `domain` as one segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceName {
    pub name: String,
    pub namespace: Option<String>,
    pub domain: Option<String>,
}

impl ServiceName {
    pub fn parse(host: &str) -> Self {
        let mut parts = host.splitn(3, '.');
        Self {
            name: parts.next().unwrap_or_default().to_owned(),
            namespace: parts.next().map(str::to_owned),
            domain: parts.next().map(str::to_owned),
        }
    }
}

impl fmt::Display for ServiceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        if let Some(domain) = &self.domain {
            write!(f, ".{domain}")?;
        }
        Ok(())
    }
}

/// A canonical address split for resolution: `scheme:///endpoint`, or a bare endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: Option<String>,
    pub endpoint: String,
}

impl Target {
    pub fn parse(canonical: &str) -> Self {
        match canonical.split_once(":///") {
            Some((scheme, endpoint)) => Self {
                scheme: Some(scheme.to_ascii_lowercase()),
                endpoint: endpoint.to_owned(),
            },
            None => Self {
                scheme: None,
                endpoint: canonical.to_owned(),
            },
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scheme {
            Some(scheme) => write!(f, "{scheme}:///{}", self.endpoint),
            None => f.write_str(&self.endpoint),
        }
    }
}

/// Splits `host:port` or `[host]:port`. The port may be empty.
pub fn split_host_port(address: &str) -> Result<(&str, &str), AddressError> {
    let invalid = |reason| AddressError::InvalidHostPort {
        address: address.to_owned(),
        reason,
    };

    let Some(colon) = address.rfind(':') else {
        return Err(AddressError::MissingPort {
            address: address.to_owned(),
        });
    };

    let host = if let Some(rest) = address.strip_prefix('[') {
        let Some(end) = rest.find(']') else {
            return Err(invalid("missing ']' in address"));
        };
        // `]` must be followed directly by the port separator.
        match end + 2 {
            i if i == address.len() => {
                return Err(AddressError::MissingPort {
                    address: address.to_owned(),
                })
            }
            i if i == colon => {}
            _ => {
                return Err(if address.as_bytes()[end + 2] == b':' {
                    invalid("too many colons in address")
                } else {
                    invalid("missing port in address")
                })
            }
        }
        &rest[..end]
    } else {
        let host = &address[..colon];
        if host.contains(':') {
            return Err(invalid("too many colons in address"));
        }
        host
    };

    let port = &address[colon + 1..];
    if host.contains(['[', ']']) || port.contains(['[', ']']) {
        return Err(invalid("unexpected bracket in address"));
    }
    Ok((host, port))
}

/// Joins a host and port, bracketing hosts that contain a colon.
pub fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn bare_names_use_kubernetes_discovery() {
        assert_eq!(
            parse_url("myservice.mynamespace.svc.cluster.local:80").unwrap(),
            "kubernetes:///myservice.mynamespace.svc.cluster.local:80"
        );
        assert_eq!(parse_url("svc:9095").unwrap(), "kubernetes:///svc:9095");
        assert_eq!(parse_url("svc.ns:9095").unwrap(), "kubernetes:///svc.ns:9095");
        assert_eq!(
            parse_url("kubernetes://svc.ns:9095").unwrap(),
            "kubernetes:///svc.ns:9095"
        );
    }

    #[test]
    fn direct_addresses_bypass_discovery() {
        assert_eq!(parse_url("direct://1.2.3.4:9095").unwrap(), "1.2.3.4:9095");
        assert_eq!(parse_url("direct://[::1]:9095").unwrap(), "[::1]:9095");
        assert!(matches!(
            parse_url("direct://"),
            Err(AddressError::MissingHost { .. })
        ));
    }

    #[test]
    fn qualified_addresses_pass_through() {
        assert_eq!(
            parse_url("foo:///already-qualified").unwrap(),
            "foo:///already-qualified"
        );
    }

    #[test]
    fn unknown_schemes_are_rejected() {
        assert_eq!(
            parse_url("bogus://host:1"),
            Err(AddressError::UnrecognizedScheme("bogus".to_owned()))
        );
    }

    #[test]
    fn discovery_addresses_need_a_port() {
        assert!(matches!(
            parse_url("svc.ns"),
            Err(AddressError::MissingPort { .. })
        ));
        assert!(matches!(
            parse_url("kubernetes://svc.ns"),
            Err(AddressError::MissingPort { .. })
        ));
        assert!(matches!(
            parse_url("svc.ns:"),
            Err(AddressError::MissingPort { .. })
        ));
    }

    #[test]
    fn service_names_split_into_three_segments() {
        assert_eq!(
            ServiceName::parse("a.b.c.d"),
            ServiceName {
                name: "a".to_owned(),
                namespace: Some("b".to_owned()),
                domain: Some("c.d".to_owned()),
            }
        );
        assert_eq!(ServiceName::parse("a").to_string(), "a");
    }

    #[test]
    fn host_port_splitting() {
        assert_eq!(split_host_port("h:80").unwrap(), ("h", "80"));
        assert_eq!(split_host_port("[::1]:80").unwrap(), ("::1", "80"));
        assert!(split_host_port("a:b:80").is_err());
        assert!(split_host_port("[::1]").is_err());
        assert_eq!(join_host_port("::1", "80"), "[::1]:80");
    }

    #[test]
    fn targets_split_scheme_and_endpoint() {
        assert_eq!(
            Target::parse("kubernetes:///svc.ns:80"),
            Target {
                scheme: Some("kubernetes".to_owned()),
                endpoint: "svc.ns:80".to_owned(),
            }
        );
        assert_eq!(Target::parse("1.2.3.4:9095").scheme, None);
    }
}
