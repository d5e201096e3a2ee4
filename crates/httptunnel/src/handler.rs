use std::future::Future;
use std::sync::Arc;

use crate::{BoxFuture, Request, ResponseWriter};

/// Something that answers HTTP requests by writing to a [`ResponseWriter`].
///
/// The terminus drives a local `Handler`; the origin *is* a `Handler`, so callers can swap a
/// local implementation for a tunneled one without changes.
pub trait Handler: Send + Sync + 'static {
    fn serve<'a>(&'a self, req: Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()>;
}

impl<H: Handler + ?Sized> Handler for Arc<H> {
    fn serve<'a>(&'a self, req: Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        (**self).serve(req, w)
    }
}

impl<H: Handler + ?Sized> Handler for Box<H> {
    fn serve<'a>(&'a self, req: Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        (**self).serve(req, w)
    }
}

/// Adapts a closure into a [`Handler`].
///
/// The closure gets the request and returns a future resolving to `(status, headers, body)`,
/// which is then written out in that order.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Vec<u8>>> + Send + 'static,
{
    HandlerFn { f }
}

pub struct HandlerFn<F> {
    f: F,
}

impl<F, Fut> Handler for HandlerFn<F>
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = http::Response<Vec<u8>>> + Send + 'static,
{
    fn serve<'a>(&'a self, req: Request, w: &'a mut dyn ResponseWriter) -> BoxFuture<'a, ()> {
        let fut = (self.f)(req);
        Box::pin(async move {
            let (parts, body) = fut.await.into_parts();
            for (name, value) in &parts.headers {
                w.headers_mut().append(name, value.clone());
            }
            w.write_head(parts.status);
            if let Err(err) = w.write_body(&body) {
                tracing::debug!(target: "httptunnel.handler", error = %err, "failed to write response body");
            }
        })
    }
}
