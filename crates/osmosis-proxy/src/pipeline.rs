//! The operator hook pipeline.
//!
//! Hooks are registered once at startup into a vector; every request gets
//! a fresh walker over that vector. The hook registered last runs
//! outermost, and each hook receives a [`Next`] continuation that descends
//! one layer, bottoming out in the terminal forward action.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::errors::{ProxyError, ProxyResult};
use crate::event::{Event, ProxyResponse};

/// An operator-supplied hook. It may rewrite the event, short-circuit with
/// its own response, or call `next.run(event)` to continue toward the
/// upstream round-trip.
pub trait Hook: Send + Sync + 'static {
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>>;
}

/// The terminal step of the pipeline, normally the upstream round-trip.
pub trait ForwardAction: Send + Sync + 'static {
    fn forward<'a>(&'a self, event: &'a mut Event) -> BoxFuture<'a, ProxyResult<ProxyResponse>>;
}

/// Adapter turning a closure into a [`Hook`].
pub struct FnHook<F>(pub F);

impl<F> Hook for FnHook<F>
where
    F: for<'a> Fn(&'a mut Event, Next<'a>) -> BoxFuture<'a, ProxyResult<ProxyResponse>>
        + Send
        + Sync
        + 'static,
{
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        (self.0)(event, next)
    }
}

/// The continuation handed to each hook: the layers beneath it plus the
/// terminal.
pub struct Next<'a> {
    hooks: &'a [Arc<dyn Hook>],
    terminal: Option<&'a Arc<dyn ForwardAction>>,
}

impl<'a> Next<'a> {
    /// Descends one layer. Fails with [`ProxyError::Cancelled`] once the
    /// event's cancellation scope has fired, and with
    /// [`ProxyError::NoForwardAction`] when the pipeline has no terminal.
    ///
    /// The event is reborrowed only for the duration of the descent, so a
    /// hook can keep using it after the downstream result returns.
    pub fn run<'b>(self, event: &'b mut Event) -> BoxFuture<'b, ProxyResult<ProxyResponse>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            if event.is_cancelled() {
                return Err(ProxyError::Cancelled);
            }
            match self.hooks.split_last() {
                Some((hook, rest)) => {
                    let next = Next {
                        hooks: rest,
                        terminal: self.terminal,
                    };
                    hook.handle(event, next).await
                }
                None => match self.terminal {
                    Some(terminal) => terminal.forward(event).await,
                    None => Err(ProxyError::NoForwardAction),
                },
            }
        })
    }
}

/// Hook registration order plus the terminal forward action.
pub struct Pipeline {
    hooks: Vec<Arc<dyn Hook>>,
    terminal: Option<Arc<dyn ForwardAction>>,
}

impl Pipeline {
    pub fn new(terminal: Option<Arc<dyn ForwardAction>>) -> Self {
        Self {
            hooks: Vec::new(),
            terminal,
        }
    }

    /// Registers a hook. Hooks registered later wrap hooks registered
    /// earlier. Registration is a startup-time operation; the server takes
    /// the pipeline by value before accepting traffic.
    pub fn register(&mut self, hook: impl Hook) {
        self.hooks.push(Arc::new(hook));
    }

    pub fn register_arc(&mut self, hook: Arc<dyn Hook>) {
        self.hooks.push(hook);
    }

    /// Drops every registered hook, leaving only the terminal.
    pub fn reset(&mut self) {
        self.hooks.clear();
    }

    pub async fn run(&self, event: &mut Event) -> ProxyResult<ProxyResponse> {
        let next = Next {
            hooks: &self.hooks,
            terminal: self.terminal.as_ref(),
        };
        next.run(event).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use bytes::Bytes;
    use futures::future::BoxFuture;
    use tokio::sync::watch;

    use super::{ForwardAction, Hook, Next, Pipeline};
    use crate::errors::{ProxyError, ProxyResult};
    use crate::event::{Event, ProxyRequest, ProxyResponse};
    use crate::http1::{HeaderList, HttpVersion};

    type Trace = Arc<std::sync::Mutex<Vec<&'static str>>>;

    struct RecordingTerminal {
        order: Trace,
    }

    impl ForwardAction for RecordingTerminal {
        fn forward<'a>(
            &'a self,
            event: &'a mut Event,
        ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
            let order = Arc::clone(&self.order);
            Box::pin(async move {
                order.lock().expect("order lock").push("terminal");
                let mut response = ProxyResponse::new(200, "OK");
                response.headers.set(
                    "X-Seen-Agent",
                    event.request.headers.get("user-agent").unwrap_or(""),
                );
                Ok(response)
            })
        }
    }

    /// Records its label, optionally sets the User-Agent, then descends.
    struct TraceHook {
        label: &'static str,
        set_agent: Option<&'static str>,
        order: Trace,
    }

    impl Hook for TraceHook {
        fn handle<'a>(
            &'a self,
            event: &'a mut Event,
            next: Next<'a>,
        ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
            Box::pin(async move {
                self.order.lock().expect("order lock").push(self.label);
                if let Some(agent) = self.set_agent {
                    event.request.headers.set("User-Agent", agent);
                }
                next.run(event).await
            })
        }
    }

    struct BlockHook {
        hits: Arc<AtomicUsize>,
    }

    impl Hook for BlockHook {
        fn handle<'a>(
            &'a self,
            _event: &'a mut Event,
            _next: Next<'a>,
        ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
            Box::pin(async move {
                self.hits.fetch_add(1, Ordering::SeqCst);
                Ok(ProxyResponse::plaintext(403, "Forbidden", "blocked"))
            })
        }
    }

    fn test_event() -> Event {
        let request = ProxyRequest {
            method: "GET".to_string(),
            uri: "http://echo.test/".parse().expect("uri"),
            version: HttpVersion::Http11,
            headers: HeaderList::new(),
            body: Bytes::new(),
        };
        let (tx, rx) = watch::channel(false);
        std::mem::forget(tx);
        Event::new(7, "127.0.0.1:1".to_string(), request, rx)
    }

    fn recording_pipeline() -> (Pipeline, Trace) {
        let order: Trace = Arc::new(std::sync::Mutex::new(Vec::new()));
        let pipeline = Pipeline::new(Some(Arc::new(RecordingTerminal {
            order: Arc::clone(&order),
        })));
        (pipeline, order)
    }

    #[tokio::test]
    async fn hooks_wrap_in_registration_order() {
        let (mut pipeline, order) = recording_pipeline();
        pipeline.register(TraceHook {
            label: "a",
            set_agent: None,
            order: Arc::clone(&order),
        });
        pipeline.register(TraceHook {
            label: "b",
            set_agent: Some("P"),
            order: Arc::clone(&order),
        });

        let mut event = test_event();
        let response = pipeline.run(&mut event).await.expect("pipeline run");

        // Last registered runs outermost.
        assert_eq!(
            order.lock().expect("order lock").as_slice(),
            ["b", "a", "terminal"]
        );
        assert_eq!(response.headers.get("x-seen-agent"), Some("P"));
    }

    #[tokio::test]
    async fn hook_can_short_circuit() {
        let hits = Arc::new(AtomicUsize::new(0));
        let (mut pipeline, order) = recording_pipeline();
        pipeline.register(BlockHook {
            hits: Arc::clone(&hits),
        });

        let mut event = test_event();
        let response = pipeline.run(&mut event).await.expect("pipeline run");
        assert_eq!(response.status, 403);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(order.lock().expect("order lock").is_empty());
    }

    #[tokio::test]
    async fn missing_terminal_is_no_forward_action() {
        let pipeline = Pipeline::new(None);
        let mut event = test_event();
        let error = pipeline.run(&mut event).await.expect_err("must fail");
        assert!(matches!(error, ProxyError::NoForwardAction));
    }

    #[tokio::test]
    async fn cancelled_event_short_circuits() {
        let (pipeline, order) = recording_pipeline();
        let mut event = test_event();
        event.abort();
        let error = pipeline.run(&mut event).await.expect_err("must cancel");
        assert!(matches!(error, ProxyError::Cancelled));
        assert!(order.lock().expect("order lock").is_empty());
    }

    #[tokio::test]
    async fn reset_restores_the_bare_terminal() {
        let (mut pipeline, order) = recording_pipeline();
        pipeline.register(BlockHook {
            hits: Arc::new(AtomicUsize::new(0)),
        });
        pipeline.reset();

        let mut event = test_event();
        let response = pipeline.run(&mut event).await.expect("pipeline run");
        assert_eq!(response.status, 200);
        assert_eq!(order.lock().expect("order lock").as_slice(), ["terminal"]);
    }
}
