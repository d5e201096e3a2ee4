//! Conversion between native requests/responses and their tunneled form.

use std::fmt::Write as _;
use std::io;

use http::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, X_CONTENT_TYPE_OPTIONS};
use http::uri::InvalidUri;
use http::{HeaderMap, Method, StatusCode, Uri};
use httptunnel_proto::{HttpRequest, HttpResponse};

use crate::context::{Context, RawTarget};
use crate::error::{MalformedRequest, StructuredError};
use crate::headers::{from_wire_headers, to_wire_headers};
use crate::{Body, Request, ResponseWriter};

/// Builds the tunneled form of `req`, reading its body to the end.
///
/// The target is the [`RawTarget`] extension when present and the request URI otherwise; it
/// is copied verbatim and never re-validated. Body reads block, so streaming bodies backed by
/// slow readers should be buffered before they reach an async context.
pub fn wrap_request(req: &mut Request) -> io::Result<HttpRequest> {
    let body = req.body_mut().read_all()?;
    let url = match req.extensions().get::<RawTarget>() {
        Some(target) => target.as_str().to_owned(),
        None => req.uri().to_string(),
    };
    Ok(HttpRequest {
        method: req.method().as_str().to_owned(),
        url,
        body,
        headers: to_wire_headers(req.headers()),
    })
}

/// Rebuilds a native request from its tunneled form.
///
/// The body replays the tunneled bytes, `content-length` is set to their exact count and `ctx`
/// is stored in the request extensions next to the verbatim [`RawTarget`]. A target that
/// `http::Uri` refuses as sent is percent-encoded for [`Request::uri`]; only one that stays
/// unparsable after that is rejected.
pub fn unwrap_request(ctx: Context, wrapped: HttpRequest) -> Result<Request, MalformedRequest> {
    let HttpRequest {
        method,
        url,
        body,
        headers,
    } = wrapped;

    let method = Method::from_bytes(method.as_bytes())
        .map_err(|source| MalformedRequest::Method { method, source })?;
    let uri = parse_target(&url).map_err(|source| MalformedRequest::Target {
        target: url.clone(),
        source,
    })?;

    let mut header_map = HeaderMap::with_capacity(headers.len() + 1);
    from_wire_headers(&headers, &mut header_map)?;
    header_map.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));

    let mut req = Request::new(Body::from(body));
    *req.method_mut() = method;
    *req.uri_mut() = uri;
    *req.headers_mut() = header_map;
    req.extensions_mut().insert(RawTarget(url));
    req.extensions_mut().insert(ctx);
    Ok(req)
}

fn parse_target(target: &str) -> Result<Uri, InvalidUri> {
    target.parse::<Uri>().or_else(|err| {
        let escaped = escape_target(target);
        if escaped == target {
            return Err(err);
        }
        escaped.parse::<Uri>().map_err(|_| err)
    })
}

/// Percent-encodes every byte outside the visible ASCII range, plus the visible ones
/// `http::Uri` refuses. Existing escapes are left alone.
fn escape_target(target: &str) -> String {
    let mut out = String::with_capacity(target.len());
    for &byte in target.as_bytes() {
        if byte.is_ascii_graphic() && !b"\"#<>\\^`{|}".contains(&byte) {
            out.push(char::from(byte));
        } else {
            let _ = write!(out, "%{byte:02X}");
        }
    }
    out
}

/// Writes `resp` to `w`: headers first, then the status line, then the body.
pub fn write_response(w: &mut dyn ResponseWriter, resp: &HttpResponse) -> io::Result<()> {
    let status = u16::try_from(resp.code)
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid status code {}", resp.code),
            )
        })?;

    from_wire_headers(&resp.headers, w.headers_mut())
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    w.write_head(status);
    w.write_body(&resp.body)
}

/// Writes any error as a response.
///
/// A [`StructuredError`] is written as the response it carries; everything else becomes a
/// `500 Internal Server Error` with the error text as its body.
pub fn write_error(w: &mut dyn ResponseWriter, err: &(dyn std::error::Error + 'static)) {
    match err.downcast_ref::<StructuredError>() {
        Some(structured) => {
            if let Err(write_err) = write_response(w, structured.response()) {
                tracing::debug!(
                    target: "httptunnel.codec",
                    error = %write_err,
                    "failed to write structured error response"
                );
            }
        }
        None => internal_error(w, &err.to_string()),
    }
}

/// Emits a plain-text 500 carrying `message`, unless a status line was already sent.
/// Headers staged on `w` before the failure are discarded.
pub(crate) fn internal_error(w: &mut dyn ResponseWriter, message: &str) {
    if w.head_written() {
        tracing::debug!(
            target: "httptunnel.codec",
            error = message,
            "response already started; dropping error"
        );
        return;
    }

    let headers = w.headers_mut();
    headers.clear();
    headers.insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    headers.insert(X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff"));
    w.write_head(StatusCode::INTERNAL_SERVER_ERROR);

    let mut body = String::with_capacity(message.len() + 1);
    body.push_str(message);
    body.push('\n');
    if let Err(err) = w.write_body(body.as_bytes()) {
        tracing::debug!(target: "httptunnel.codec", error = %err, "failed to write error body");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::Recorder;
    use httptunnel_proto::Header;
    use pretty_assertions::assert_eq;

    #[test]
    fn request_survives_wrap_and_unwrap() {
        let mut req = http::Request::builder()
            .method("PUT")
            .uri("/api/v1/push?tenant=a%2Fb&x=1")
            .header("X-Scope-OrgID", "team-a")
            .header("accept", "text/plain")
            .header("accept", "application/json")
            .body(Body::from("payload"))
            .unwrap();

        let wrapped = wrap_request(&mut req).unwrap();
        assert_eq!(wrapped.method, "PUT");
        assert_eq!(wrapped.url, "/api/v1/push?tenant=a%2Fb&x=1");
        assert_eq!(wrapped.body, b"payload");

        let mut back = unwrap_request(Context::background(), wrapped).unwrap();
        assert_eq!(back.method(), "PUT");
        assert_eq!(
            back.extensions().get::<RawTarget>(),
            Some(&RawTarget("/api/v1/push?tenant=a%2Fb&x=1".to_owned()))
        );
        assert_eq!(back.uri().path(), "/api/v1/push");
        assert_eq!(back.headers().get("x-scope-orgid").unwrap(), "team-a");
        let accept: Vec<_> = back.headers().get_all("accept").iter().collect();
        assert_eq!(accept, vec!["text/plain", "application/json"]);
        assert_eq!(back.headers().get(CONTENT_LENGTH).unwrap(), "7");
        assert!(back.extensions().get::<Context>().is_some());
        assert_eq!(back.body_mut().read_all().unwrap(), b"payload");
    }

    #[test]
    fn raw_target_takes_precedence_over_the_uri() {
        let mut req = http::Request::builder()
            .uri("/normalized")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(RawTarget("/raw/../path?q=%zz".to_owned()));

        let wrapped = wrap_request(&mut req).unwrap();
        assert_eq!(wrapped.url, "/raw/../path?q=%zz");
    }

    #[test]
    fn body_read_failures_abort_the_wrap() {
        struct Broken;
        impl io::Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated"))
            }
        }

        let mut req = Request::new(Body::from_reader(Broken));
        let err = wrap_request(&mut req).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn malformed_method_is_rejected() {
        let wrapped = HttpRequest {
            method: "GE T".to_owned(),
            url: "/".to_owned(),
            ..HttpRequest::default()
        };
        let err = unwrap_request(Context::background(), wrapped).unwrap_err();
        assert!(matches!(err, MalformedRequest::Method { .. }), "{err}");
    }

    #[test]
    fn targets_the_uri_parser_refuses_are_escaped() {
        let cases = [
            ("/q?x={\"a\":1}", "/q", Some("x=%7B%22a%22:1%7D")),
            ("/a b", "/a%20b", None),
            ("/x`y", "/x%60y", None),
        ];
        for (target, path, query) in cases {
            let wrapped = HttpRequest {
                method: "GET".to_owned(),
                url: target.to_owned(),
                ..HttpRequest::default()
            };
            let req = unwrap_request(Context::background(), wrapped).unwrap();
            assert_eq!(req.uri().path(), path, "{target}");
            assert_eq!(req.uri().query(), query, "{target}");
            assert_eq!(
                req.extensions().get::<RawTarget>(),
                Some(&RawTarget(target.to_owned()))
            );
        }
    }

    #[test]
    fn empty_target_is_rejected() {
        let wrapped = HttpRequest {
            method: "GET".to_owned(),
            url: String::new(),
            ..HttpRequest::default()
        };
        let err = unwrap_request(Context::background(), wrapped).unwrap_err();
        assert!(matches!(err, MalformedRequest::Target { .. }), "{err}");
    }

    #[test]
    fn internal_error_drops_staged_headers() {
        let mut rec = Recorder::new();
        rec.headers_mut()
            .insert("x-answer", HeaderValue::from_static("42"));
        rec.headers_mut().insert(CONTENT_LENGTH, HeaderValue::from(9));

        internal_error(&mut rec, "boom");

        let (status, headers, body) = rec.into_parts();
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let mut names: Vec<_> = headers.keys().map(|name| name.as_str()).collect();
        names.sort_unstable();
        assert_eq!(names, vec!["content-type", "x-content-type-options"]);
        assert_eq!(body, b"boom\n");
    }

    #[test]
    fn response_is_written_headers_then_status_then_body() {
        let resp = HttpResponse {
            code: 404,
            headers: vec![Header::new("Content-Type", ["text/plain"])],
            body: b"not found".to_vec(),
        };
        let mut rec = Recorder::new();
        write_response(&mut rec, &resp).unwrap();

        let (status, headers, body) = rec.into_parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "text/plain");
        assert_eq!(body, b"not found");
    }

    #[test]
    fn invalid_status_code_is_an_io_error() {
        let resp = HttpResponse {
            code: 42,
            ..HttpResponse::default()
        };
        let mut rec = Recorder::new();
        let err = write_response(&mut rec, &resp).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(!rec.head_written());
    }

    #[test]
    fn structured_errors_write_their_response() {
        let err = StructuredError::new(HttpResponse {
            code: 503,
            headers: Vec::new(),
            body: b"overloaded".to_vec(),
        });
        let mut rec = Recorder::new();
        write_error(&mut rec, &err);
        assert_eq!(rec.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(rec.body(), b"overloaded");
    }

    #[test]
    fn other_errors_become_a_plain_500() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, "connection reset");
        let mut rec = Recorder::new();
        write_error(&mut rec, &err);
        assert_eq!(rec.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            rec.headers().get(CONTENT_TYPE).unwrap(),
            "text/plain; charset=utf-8"
        );
        assert_eq!(rec.body(), b"connection reset\n");
    }
}
