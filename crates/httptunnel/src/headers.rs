//! Conversion between `http::HeaderMap` and the wire header list.

use http::header::{HeaderName, HeaderValue, InvalidHeaderName, InvalidHeaderValue};
use http::HeaderMap;
use httptunnel_proto::Header;

/// Marks a 5xx response whose failure should not be logged.
///
/// Only its presence matters. It is consumed locally and never sent over the wire.
pub const DO_NOT_LOG_ERROR_HEADER: HeaderName = HeaderName::from_static("x-donotlogerror");

#[derive(Debug, thiserror::Error)]
pub enum HeaderError {
    #[error("invalid header name {name:?}: {source}")]
    InvalidName {
        name: String,
        #[source]
        source: InvalidHeaderName,
    },
    #[error("invalid value for header {name}: {source}")]
    InvalidValue {
        name: String,
        #[source]
        source: InvalidHeaderValue,
    },
}

/// One wire entry per distinct key, holding every value of that key.
///
/// Entries follow the map's iteration order, which callers must not rely on. The
/// [`DO_NOT_LOG_ERROR_HEADER`] key is always dropped.
///
/// Wire values are UTF-8 strings. Bytes of a value that are not valid UTF-8 (`obs-text`) are
/// replaced with U+FFFD; the value is still forwarded rather than failing the request.
pub fn to_wire_headers(headers: &HeaderMap) -> Vec<Header> {
    let mut out = Vec::with_capacity(headers.keys_len());
    for name in headers.keys() {
        if *name == DO_NOT_LOG_ERROR_HEADER {
            continue;
        }
        out.push(Header {
            key: name.as_str().to_owned(),
            values: headers
                .get_all(name)
                .iter()
                .map(|value| wire_value(name, value))
                .collect(),
        });
    }
    out
}

fn wire_value(name: &HeaderName, value: &HeaderValue) -> String {
    match std::str::from_utf8(value.as_bytes()) {
        Ok(text) => text.to_owned(),
        Err(_) => {
            tracing::debug!(
                target: "httptunnel.headers",
                header = %name,
                "header value is not UTF-8; replacing invalid bytes"
            );
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        }
    }
}

/// Writes wire entries into `dst`, replacing any values already stored under the same key.
///
/// If the list repeats a key, the last entry wins. An entry with no values removes the key.
pub fn from_wire_headers(entries: &[Header], dst: &mut HeaderMap) -> Result<(), HeaderError> {
    for entry in entries {
        let name = HeaderName::from_bytes(entry.key.as_bytes()).map_err(|source| {
            HeaderError::InvalidName {
                name: entry.key.clone(),
                source,
            }
        })?;

        let values = entry
            .values
            .iter()
            .map(|value| HeaderValue::from_str(value))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|source| HeaderError::InvalidValue {
                name: entry.key.clone(),
                source,
            })?;

        dst.remove(&name);
        for value in values {
            dst.append(name.clone(), value);
        }
    }
    Ok(())
}
