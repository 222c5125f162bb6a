//! `reqwest`-backed HTTP transport
//!
//! Every accepted request becomes a task on a tokio runtime. Finished tasks
//! push their [`HttpResponse`] into an unbounded channel which the fetcher
//! drains once per tick through [`HttpTransport::poll_completions`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use reqwest::header::{ACCEPT, CONTENT_RANGE, CONTENT_TYPE, RANGE, RETRY_AFTER};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use crate::core::error::Error;
use crate::core::types::Result;
use crate::net::http::{
    ContentRange, HttpGet, HttpHandle, HttpResponse, HttpStatus, HttpTransport, TEXTURE_ACCEPT,
};

/// HTTP transport running requests on a tokio runtime
pub struct ReqwestTransport {
    client: reqwest::Client,
    handle: Handle,
    next_handle: AtomicU64,
    completion_tx: mpsc::UnboundedSender<HttpResponse>,
    completion_rx: Mutex<mpsc::UnboundedReceiver<HttpResponse>>,
    /// Tasks still in flight, so they can be aborted on cancel
    in_flight: Mutex<HashMap<HttpHandle, AbortHandle>>,
    pipelined: bool,
    /// Owned runtime when created with [`ReqwestTransport::new`]
    #[allow(dead_code)]
    runtime: Option<Runtime>,
}

impl ReqwestTransport {
    /// Create a transport with its own runtime
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = Runtime::new()?;
        let handle = runtime.handle().clone();
        let mut transport = Self::build(handle, timeout)?;
        transport.runtime = Some(runtime);
        Ok(transport)
    }

    /// Create a transport that spawns onto an existing runtime
    pub fn with_handle(handle: Handle, timeout: Duration) -> Result<Self> {
        Self::build(handle, timeout)
    }

    fn build(handle: Handle, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Http(e.to_string()))?;
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();

        Ok(Self {
            client,
            handle,
            next_handle: AtomicU64::new(1),
            completion_tx,
            completion_rx: Mutex::new(completion_rx),
            in_flight: Mutex::new(HashMap::new()),
            pipelined: false,
            runtime: None,
        })
    }

    /// Declare that the underlying connections pipeline requests
    pub fn set_pipelined(&mut self, pipelined: bool) {
        self.pipelined = pipelined;
    }

    fn allocate_handle(&self) -> HttpHandle {
        HttpHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn spawn(&self, handle: HttpHandle, request: reqwest::RequestBuilder) {
        let tx = self.completion_tx.clone();
        // Hold the table while spawning so a fast completion can't be polled first
        let mut in_flight = self.in_flight.lock().unwrap();
        let task = self.handle.spawn(async move {
            let response = Self::execute(handle, request).await;
            // Receiver gone means the transport was dropped
            let _ = tx.send(response);
        });
        in_flight.insert(handle, task.abort_handle());
    }

    async fn execute(handle: HttpHandle, request: reqwest::RequestBuilder) -> HttpResponse {
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return HttpResponse::new(handle, HttpStatus::Transport(e.to_string()), Vec::new()),
        };

        let status = HttpStatus::Http(response.status().as_u16());
        let headers = response.headers();
        let content_range = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(ContentRange::parse);
        let retry_after = headers
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);

        match response.bytes().await {
            Ok(body) => HttpResponse {
                handle,
                status,
                body: body.to_vec(),
                content_range,
                retry_after,
            },
            Err(e) => HttpResponse::new(handle, HttpStatus::Transport(e.to_string()), Vec::new()),
        }
    }
}

/// Parse a `Retry-After` value given in seconds. HTTP dates are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

impl HttpTransport for ReqwestTransport {
    fn request_get(&self, request: HttpGet) -> Option<HttpHandle> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| log::warn!("Rejecting texture URL {}: {}", request.url, e))
            .ok()?;

        let mut builder = self.client.get(url).header(ACCEPT, TEXTURE_ACCEPT);
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }

        let handle = self.allocate_handle();
        log::debug!("HTTP GET {} ({:?}) as {:?}", request.url, request.range, handle);
        self.spawn(handle, builder);
        Some(handle)
    }

    fn request_post(&self, url: &str, content_type: &str, body: Vec<u8>) -> Option<HttpHandle> {
        let url = reqwest::Url::parse(url)
            .map_err(|e| log::warn!("Rejecting POST URL {}: {}", url, e))
            .ok()?;

        let builder = self.client.post(url).header(CONTENT_TYPE, content_type.to_string()).body(body);
        let handle = self.allocate_handle();
        self.spawn(handle, builder);
        Some(handle)
    }

    fn cancel(&self, handle: HttpHandle) {
        if let Some(task) = self.in_flight.lock().unwrap().remove(&handle) {
            task.abort();
        }
    }

    fn poll_completions(&self) -> Vec<HttpResponse> {
        let mut completions = Vec::new();
        let mut rx = self.completion_rx.lock().unwrap();
        let mut in_flight = self.in_flight.lock().unwrap();

        while let Ok(response) = rx.try_recv() {
            // A cancelled task may still have finished before the abort landed
            if in_flight.remove(&response.handle).is_some() {
                completions.push(response);
            }
        }

        completions
    }

    fn is_pipelined(&self) -> bool {
        self.pipelined
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("120"), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_rejects_malformed_url() {
        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let request = HttpGet {
            url: "not a url".into(),
            priority: 0,
            range: None,
            want_headers: false,
        };
        assert!(transport.request_get(request).is_none());
        assert!(transport.request_post("::", "application/json", Vec::new()).is_none());
    }

    #[test]
    fn test_unreachable_host_completes_with_transport_error() {
        let transport = ReqwestTransport::new(Duration::from_secs(2)).unwrap();
        let handle = transport
            .request_get(HttpGet {
                // Port 9 on loopback: nothing listens there
                url: "http://127.0.0.1:9/texture".into(),
                priority: 0,
                range: None,
                want_headers: false,
            })
            .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut completions = Vec::new();
        while completions.is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
            completions = transport.poll_completions();
        }

        assert_eq!(completions.len(), 1);
        assert_eq!(completions[0].handle, handle);
        assert!(matches!(completions[0].status, HttpStatus::Transport(_)));
    }

    #[test]
    fn test_cancelled_request_is_not_delivered() {
        let transport = ReqwestTransport::new(Duration::from_secs(2)).unwrap();
        let handle = transport
            .request_get(HttpGet {
                url: "http://127.0.0.1:9/texture".into(),
                priority: 0,
                range: None,
                want_headers: false,
            })
            .unwrap();
        transport.cancel(handle);

        std::thread::sleep(Duration::from_millis(200));
        assert!(transport.poll_completions().is_empty());
    }
}
