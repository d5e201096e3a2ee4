//! Trace context propagation for outbound tunneled requests.

use http::header::{HeaderName, HeaderValue, InvalidHeaderValue};
use http::{Extensions, HeaderMap};

pub const TRACEPARENT: HeaderName = HeaderName::from_static("traceparent");

#[derive(Debug, thiserror::Error)]
pub enum InjectError {
    #[error("invalid span context: {0}")]
    InvalidSpan(&'static str),
    #[error("invalid trace header value: {0}")]
    InvalidHeader(#[from] InvalidHeaderValue),
}

/// The active span of a request, stored as a request extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
    pub sampled: bool,
}

/// Writes the trace context of a request into its outgoing headers.
pub trait Propagator: Send + Sync + 'static {
    /// Does nothing when `extensions` holds no active span.
    fn inject(&self, extensions: &Extensions, headers: &mut HeaderMap) -> Result<(), InjectError>;
}

/// W3C Trace Context (`traceparent`) propagation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceContextPropagator;

impl Propagator for TraceContextPropagator {
    fn inject(&self, extensions: &Extensions, headers: &mut HeaderMap) -> Result<(), InjectError> {
        let Some(span) = extensions.get::<SpanContext>() else {
            return Ok(());
        };
        if span.trace_id == 0 {
            return Err(InjectError::InvalidSpan("trace id is zero"));
        }
        if span.span_id == 0 {
            return Err(InjectError::InvalidSpan("span id is zero"));
        }

        let flags = if span.sampled { "01" } else { "00" };
        let value = format!("00-{:032x}-{:016x}-{flags}", span.trace_id, span.span_id);
        headers.insert(TRACEPARENT, HeaderValue::from_str(&value)?);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn injects_traceparent_for_active_span() {
        let mut extensions = Extensions::new();
        extensions.insert(SpanContext {
            trace_id: 0x4bf92f3577b34da6a3ce929d0e0e4736,
            span_id: 0x00f067aa0ba902b7,
            sampled: true,
        });
        let mut headers = HeaderMap::new();

        TraceContextPropagator
            .inject(&extensions, &mut headers)
            .unwrap();
        assert_eq!(
            headers.get(TRACEPARENT).unwrap(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
    }

    #[test]
    fn no_span_means_no_header() {
        let mut headers = HeaderMap::new();
        TraceContextPropagator
            .inject(&Extensions::new(), &mut headers)
            .unwrap();
        assert!(headers.is_empty());
    }

    #[test]
    fn zero_ids_are_rejected() {
        let mut extensions = Extensions::new();
        extensions.insert(SpanContext {
            trace_id: 0,
            span_id: 1,
            sampled: false,
        });
        let err = TraceContextPropagator
            .inject(&extensions, &mut HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, InjectError::InvalidSpan(_)));
    }
}
