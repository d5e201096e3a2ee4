use tokio::sync::watch;

use crate::RequestId;

/// Observes whether an in-flight request has been cancelled.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    rx: watch::Receiver<bool>,
}

impl CancellationToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self::channel().1
    }

    /// A token together with the sender that cancels it (by sending `true`).
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the token is cancelled. Dropping the sender without cancelling leaves
    /// this pending forever.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// What a request handler knows about the call it is serving.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: RequestId,
    cancel: CancellationToken,
}

impl RequestContext {
    pub(crate) fn new(request_id: RequestId, cancel: CancellationToken) -> Self {
        Self { request_id, cancel }
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}
