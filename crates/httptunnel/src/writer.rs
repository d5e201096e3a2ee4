use std::io;

use http::{HeaderMap, StatusCode};

/// The write side of an HTTP exchange.
///
/// Headers are mutable until [`ResponseWriter::write_head`] is called; after that the status
/// line and headers are fixed and only body bytes may follow.
pub trait ResponseWriter: Send {
    fn headers_mut(&mut self) -> &mut HeaderMap;

    /// Sends the status line and the current headers. Only the first call has an effect.
    fn write_head(&mut self, status: StatusCode);

    /// Appends body bytes, sending `200 OK` first if no head was written yet.
    fn write_body(&mut self, data: &[u8]) -> io::Result<()>;

    fn head_written(&self) -> bool;
}

/// In-memory [`ResponseWriter`] that records what a handler produced.
#[derive(Debug, Default)]
pub struct Recorder {
    headers: HeaderMap,
    status: Option<StatusCode>,
    sent_headers: Option<HeaderMap>,
    body: Vec<u8>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// The recorded status; `200 OK` if the handler never wrote a head.
    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::OK)
    }

    /// Headers as they were when the head was written (or the current headers if it never was).
    pub fn headers(&self) -> &HeaderMap {
        self.sent_headers.as_ref().unwrap_or(&self.headers)
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_parts(self) -> (StatusCode, HeaderMap, Vec<u8>) {
        let status = self.status.unwrap_or(StatusCode::OK);
        let headers = self.sent_headers.unwrap_or(self.headers);
        (status, headers, self.body)
    }
}

impl ResponseWriter for Recorder {
    fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    fn write_head(&mut self, status: StatusCode) {
        if self.status.is_some() {
            tracing::debug!(target: "httptunnel.writer", %status, "superfluous write_head ignored");
            return;
        }
        self.status = Some(status);
        self.sent_headers = Some(self.headers.clone());
    }

    fn write_body(&mut self, data: &[u8]) -> io::Result<()> {
        if self.status.is_none() {
            self.write_head(StatusCode::OK);
        }
        self.body.extend_from_slice(data);
        Ok(())
    }

    fn head_written(&self) -> bool {
        self.status.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::CONTENT_TYPE;
    use http::HeaderValue;

    #[test]
    fn headers_are_frozen_by_write_head() {
        let mut rec = Recorder::new();
        rec.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        rec.write_head(StatusCode::CREATED);
        rec.headers_mut()
            .insert("x-late", HeaderValue::from_static("1"));
        rec.write_head(StatusCode::INTERNAL_SERVER_ERROR);
        rec.write_body(b"done").unwrap();

        let (status, headers, body) = rec.into_parts();
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert!(headers.get("x-late").is_none());
        assert_eq!(body, b"done");
    }

    #[test]
    fn body_without_head_implies_ok() {
        let mut rec = Recorder::new();
        rec.write_body(b"hi").unwrap();
        assert!(rec.head_written());
        assert_eq!(rec.status(), StatusCode::OK);
    }
}
