//! Debug tools for texfetch - TCP debug server for remote inspection and control
//!
//! Start the debug server in your app:
//! ```ignore
//! let handler = Arc::new(Mutex::new(FetcherDebugHandler::new(fetcher)));
//! let _server = DebugServer::start(handler, DEFAULT_PORT);
//! ```

pub mod protocol;
pub mod server;
pub mod client;

pub use protocol::*;
pub use server::{DebugHandler, DebugServer};
pub use client::{ClientError, DebugClient};

/// Default debug server port
pub const DEFAULT_PORT: u16 = 9743;
