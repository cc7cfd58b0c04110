//! Ready-made hooks for common interception tasks.

use futures::future::BoxFuture;

use crate::errors::ProxyResult;
use crate::event::{Event, ProxyResponse};
use crate::pipeline::{Hook, Next};

/// Sets `Accept-Encoding: identity` so the response arrives uncompressed
/// and stays easily editable.
pub struct RemoveCompression;

impl Hook for RemoveCompression {
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move {
            event.request.headers.set("Accept-Encoding", "identity");
            next.run(event).await
        })
    }
}

/// Waits for the upstream response and logs status code, method, URL, and
/// protocol.
pub struct LogCompleteRequest;

impl Hook for LogCompleteRequest {
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move {
            let method = event.request.method.clone();
            let uri = event.request.uri.clone();
            let version = event.request.version;
            let response = next.run(event).await?;
            event.log(format!(
                "{} {} {} {}",
                response.status,
                method,
                uri,
                version.as_str()
            ));
            Ok(response)
        })
    }
}

/// Dumps the request and/or the response to the event's log.
pub struct DumpToLog {
    pub dump_request: bool,
    pub dump_response: bool,
}

impl Hook for DumpToLog {
    fn handle<'a>(
        &'a self,
        event: &'a mut Event,
        next: Next<'a>,
    ) -> BoxFuture<'a, ProxyResult<ProxyResponse>> {
        Box::pin(async move {
            if self.dump_request {
                let dump = event.raw_request();
                event.log(format!("Request dump:\n{}", String::from_utf8_lossy(&dump)));
            }

            let mut response = next.run(event).await?;

            if self.dump_response {
                let dump = response.raw().await?;
                event.log(format!(
                    "Response dump:\n{}",
                    String::from_utf8_lossy(&dump)
                ));
            }
            Ok(response)
        })
    }
}
