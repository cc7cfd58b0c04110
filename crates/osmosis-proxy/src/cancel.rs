use tokio::sync::watch;

/// One-shot cancellation signal. Each request carries a token that fires
/// when the server shuts down or when the request itself is aborted.
#[derive(Clone)]
pub struct CancelToken {
    shutdown: watch::Receiver<bool>,
    local: watch::Receiver<bool>,
}

/// Triggers the request-local half of a [`CancelToken`].
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl CancelToken {
    pub fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow() || *self.local.borrow()
    }

    /// Resolves when either side of the token fires.
    pub async fn cancelled(&self) {
        let mut shutdown = self.shutdown.clone();
        let mut local = self.local.clone();
        tokio::select! {
            _ = shutdown.wait_for(|fired| *fired) => {}
            _ = local.wait_for(|fired| *fired) => {}
        }
    }
}

impl AbortHandle {
    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

/// Derives a request token from the server-wide shutdown signal plus a
/// fresh local abort channel.
pub(crate) fn request_scope(shutdown: watch::Receiver<bool>) -> (AbortHandle, CancelToken) {
    let (tx, local) = watch::channel(false);
    (AbortHandle { tx }, CancelToken { shutdown, local })
}

#[cfg(test)]
mod tests {
    use tokio::sync::watch;

    use super::request_scope;

    #[tokio::test]
    async fn abort_fires_token() {
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (abort, token) = request_scope(shutdown_rx);
        assert!(!token.is_cancelled());
        abort.abort();
        assert!(token.is_cancelled());
        token.cancelled().await;
    }

    #[tokio::test]
    async fn shutdown_fires_every_token() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (_abort_a, token_a) = request_scope(shutdown_rx.clone());
        let (_abort_b, token_b) = request_scope(shutdown_rx);
        shutdown_tx.send(true).expect("send shutdown");
        assert!(token_a.is_cancelled());
        assert!(token_b.is_cancelled());
    }
}
