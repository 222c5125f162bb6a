//! Blocking client for the debug server

use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use thiserror::Error;

use crate::protocol::{DebugCommand, DebugResponse};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Server closed the connection")]
    Closed,
}

/// One connection to a running debug server
pub struct DebugClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl DebugClient {
    pub fn connect(addr: SocketAddr) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(Duration::from_secs(30)))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self { stream, reader })
    }

    /// Send a command and wait for its response line
    pub fn send(&mut self, cmd: &DebugCommand) -> Result<DebugResponse, ClientError> {
        let json = serde_json::to_string(cmd)?;
        self.send_raw(&json)
    }

    /// Send an arbitrary line. Used to probe the server with malformed input.
    pub fn send_raw(&mut self, line: &str) -> Result<DebugResponse, ClientError> {
        self.stream.write_all(line.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()?;

        let mut response_line = String::new();
        if self.reader.read_line(&mut response_line)? == 0 {
            return Err(ClientError::Closed);
        }
        Ok(serde_json::from_str(&response_line)?)
    }
}
