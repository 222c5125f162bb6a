//! HTTP transport contract and byte-range helpers

use std::fmt;
use std::time::Duration;

/// MIME type requested for texture downloads
pub const TEXTURE_ACCEPT: &str = "image/x-j2c";
/// MIME type of metrics reports
pub const METRICS_CONTENT_TYPE: &str = "application/json";

pub const HTTP_PARTIAL_CONTENT: u16 = 206;
pub const HTTP_NOT_FOUND: u16 = 404;
pub const HTTP_RANGE_NOT_SATISFIABLE: u16 = 416;
pub const HTTP_SERVICE_UNAVAILABLE: u16 = 503;

/// Opaque id of an accepted HTTP request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HttpHandle(pub u64);

/// Outcome of an HTTP request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpStatus {
    /// The server answered with this status code
    Http(u16),
    /// The request never produced a response (connect, TLS, timeout, ...)
    Transport(String),
}

impl HttpStatus {
    /// 2xx response
    pub fn is_success(&self) -> bool {
        matches!(self, HttpStatus::Http(code) if (200..300).contains(code))
    }

    /// Status code, if the server answered
    pub fn code(&self) -> Option<u16> {
        match self {
            HttpStatus::Http(code) => Some(*code),
            HttpStatus::Transport(_) => None,
        }
    }

    /// Failures worth retrying: server errors and transport failures
    pub fn is_retryable(&self) -> bool {
        match self {
            HttpStatus::Http(code) => *code >= 500,
            HttpStatus::Transport(_) => true,
        }
    }
}

impl fmt::Display for HttpStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpStatus::Http(code) => write!(f, "HTTP {}", code),
            HttpStatus::Transport(reason) => write!(f, "transport error: {}", reason),
        }
    }
}

/// Byte range asked of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    /// Bytes wanted. 0 = everything from `offset` on.
    pub length: u64,
}

impl ByteRange {
    /// Value of the `Range` request header
    pub fn header_value(&self) -> String {
        if self.length == 0 {
            format!("bytes={}-", self.offset)
        } else {
            format!("bytes={}-{}", self.offset, self.offset + self.length - 1)
        }
    }
}

/// `Content-Range` of a partial response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub offset: u64,
    pub length: u64,
    /// Full size of the resource, if the server disclosed it
    pub full_length: Option<u64>,
}

impl ContentRange {
    /// Parse `bytes <first>-<last>/<full|*>`
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, full) = rest.split_once('/')?;
        let (first, last) = range.trim().split_once('-')?;
        let first: u64 = first.trim().parse().ok()?;
        let last: u64 = last.trim().parse().ok()?;
        if last < first {
            return None;
        }
        let full_length = match full.trim() {
            "*" => None,
            n => Some(n.parse().ok()?),
        };
        Some(Self {
            offset: first,
            length: last - first + 1,
            full_length,
        })
    }
}

/// A GET issued on behalf of a fetch worker
#[derive(Debug, Clone, PartialEq)]
pub struct HttpGet {
    pub url: String,
    /// Scheduling hint for the transport
    pub priority: u32,
    /// `None` issues a plain GET for the whole resource
    pub range: Option<ByteRange>,
    /// Ask the transport to keep response headers (server bakes)
    pub want_headers: bool,
}

/// Completion of an accepted request
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub handle: HttpHandle,
    pub status: HttpStatus,
    pub body: Vec<u8>,
    pub content_range: Option<ContentRange>,
    /// Server `Retry-After`, if any
    pub retry_after: Option<Duration>,
}

impl HttpResponse {
    /// Build a response with no range or retry information
    pub fn new(handle: HttpHandle, status: HttpStatus, body: Vec<u8>) -> Self {
        Self {
            handle,
            status,
            body,
            content_range: None,
            retry_after: None,
        }
    }
}

/// HTTP collaborator
///
/// Requests are accepted immediately and complete later. Each accepted
/// request yields exactly one [`HttpResponse`] from [`poll_completions`]
/// unless it is cancelled first. The transport only ever sees handles; the
/// fetcher routes completions to workers itself.
///
/// [`poll_completions`]: HttpTransport::poll_completions
pub trait HttpTransport: Send + Sync {
    /// Issue a GET. `None` means the request was refused outright.
    fn request_get(&self, request: HttpGet) -> Option<HttpHandle>;

    /// Issue a fire-and-forget POST
    fn request_post(&self, url: &str, content_type: &str, body: Vec<u8>) -> Option<HttpHandle>;

    /// Abandon a request. No completion is delivered for it afterwards.
    fn cancel(&self, handle: HttpHandle);

    /// Drain the completions that arrived since the last call
    fn poll_completions(&self) -> Vec<HttpResponse>;

    /// Whether the transport pipelines requests on shared connections
    fn is_pipelined(&self) -> bool {
        false
    }
}
