//! Backend side of the inference exchange
//!
//! Used by mock and replay backends: accept a submission, then stream
//! envelopes back over the same connection.

use crate::protocol::{MessageType, Protocol, ProtocolError};
use crate::types::{AssembleRequest, Envelope, LogLevel, Payload, Stage};

use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Errors that can occur while serving an exchange
#[derive(Error, Debug)]
pub enum ReceiveError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Bind error: {0}")]
    Bind(String),

    #[error("Accept timeout")]
    AcceptTimeout,

    #[error("Connection closed before a request was received")]
    NoRequest,
}

/// Configuration for the backend listener
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// TCP no-delay setting
    pub tcp_nodelay: bool,
    /// Read timeout while waiting for the request
    pub read_timeout: Option<Duration>,
    /// Accept timeout for new connections
    pub accept_timeout: Option<Duration>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            max_message_size: 100 * 1024 * 1024, // 100MB
            tcp_nodelay: true,
            read_timeout: Some(Duration::from_secs(30)),
            accept_timeout: None, // Block by default
        }
    }
}

/// TCP listener accepting run submissions
pub struct BackendListener {
    listener: TcpListener,
    protocol: Protocol,
    config: ListenerConfig,
    requests_received: u64,
}

impl BackendListener {
    /// Create a new listener on the specified address
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, ReceiveError> {
        Self::bind_with_config(addr, ListenerConfig::default())
    }

    /// Create a new listener with custom configuration
    pub fn bind_with_config<A: ToSocketAddrs>(
        addr: A,
        config: ListenerConfig,
    ) -> Result<Self, ReceiveError> {
        let listener = TcpListener::bind(addr)
            .map_err(|e| ReceiveError::Bind(format!("Failed to bind: {e}")))?;

        let local_addr = listener.local_addr()?;
        info!("Backend listening on {}", local_addr);

        // Set non-blocking mode if accept timeout is specified
        if config.accept_timeout.is_some() {
            listener.set_nonblocking(true)?;
        }

        let protocol = Protocol::new().with_max_message_size(config.max_message_size);

        Ok(Self {
            listener,
            protocol,
            config,
            requests_received: 0,
        })
    }

    /// Get the local address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr, ReceiveError> {
        Ok(self.listener.local_addr()?)
    }

    /// Number of submissions accepted so far
    pub fn requests_received(&self) -> u64 {
        self.requests_received
    }

    /// Accept a single connection and read its submission
    pub fn accept(&mut self) -> Result<(AssembleRequest, ResponseWriter), ReceiveError> {
        debug!("Waiting for connection...");

        let (mut stream, addr) = if let Some(timeout) = self.config.accept_timeout {
            let start = std::time::Instant::now();
            loop {
                match self.listener.accept() {
                    Ok(result) => break result,
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        if start.elapsed() > timeout {
                            return Err(ReceiveError::AcceptTimeout);
                        }
                        std::thread::sleep(Duration::from_millis(10));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        } else {
            self.listener.accept()?
        };

        info!("Accepted connection from {}", addr);

        stream.set_nonblocking(false)?;
        stream.set_nodelay(self.config.tcp_nodelay)?;
        stream.set_read_timeout(self.config.read_timeout)?;

        let request = self.read_request(&mut stream)?;
        self.requests_received += 1;

        info!(
            "Received {} from {} ({} fragments, {})",
            request.operation,
            addr,
            request.fragment_count(),
            request.mesh_type
        );

        Ok((
            request,
            ResponseWriter {
                stream,
                protocol: self.protocol.clone(),
                peer: addr,
                envelopes_sent: 0,
            },
        ))
    }

    fn read_request(&self, stream: &mut TcpStream) -> Result<AssembleRequest, ReceiveError> {
        loop {
            let message = self.protocol.read_message(stream)?;
            match message.msg_type {
                MessageType::Request => {
                    return Ok(self.protocol.deserialize_request(&message)?);
                }
                MessageType::Heartbeat => {
                    trace!("Received heartbeat");
                    continue;
                }
                MessageType::EndOfStream => return Err(ReceiveError::NoRequest),
                MessageType::Envelope => {
                    warn!("Ignoring unexpected message type: {:?}", message.msg_type);
                    continue;
                }
            }
        }
    }

    /// Serve submissions with a callback until it returns `false`
    pub fn run<F>(&mut self, mut handler: F) -> Result<(), ReceiveError>
    where
        F: FnMut(AssembleRequest, ResponseWriter) -> bool,
    {
        info!("Starting backend loop");

        loop {
            match self.accept() {
                Ok((request, writer)) => {
                    if !handler(request, writer) {
                        info!("Handler requested stop");
                        break;
                    }
                }
                Err(ReceiveError::AcceptTimeout) => {
                    trace!("Accept timeout, continuing");
                    continue;
                }
                Err(e) => {
                    // A broken client should not take the backend down
                    error!("Error accepting submission: {}", e);
                    continue;
                }
            }
        }

        info!(
            "Backend stopped after {} submissions",
            self.requests_received
        );

        Ok(())
    }
}

/// Streams envelopes back to the viewer for one exchange
pub struct ResponseWriter {
    stream: TcpStream,
    protocol: Protocol,
    peer: SocketAddr,
    envelopes_sent: u64,
}

impl ResponseWriter {
    /// Address of the connected viewer
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Number of envelopes written so far
    pub fn envelopes_sent(&self) -> u64 {
        self.envelopes_sent
    }

    /// Send one envelope
    pub fn send(&mut self, envelope: &Envelope) -> Result<(), ProtocolError> {
        let message = self.protocol.serialize_envelope(envelope)?;
        self.protocol.write_message(&mut self.stream, &message)?;
        self.envelopes_sent += 1;
        Ok(())
    }

    /// Send a lifecycle record
    pub fn send_status(&mut self, stage: Stage) -> Result<(), ProtocolError> {
        debug!("Sending stage {:?} to {}", stage, self.peer);
        self.send(&Envelope::status(stage))
    }

    /// Send a data record
    pub fn send_payload(&mut self, payload: Payload) -> Result<(), ProtocolError> {
        trace!("Sending {} payload to {}", payload.kind(), self.peer);
        self.send(&Envelope::data(payload))
    }

    /// Send a log record
    pub fn send_log(&mut self, level: LogLevel, message: impl Into<String>) -> Result<(), ProtocolError> {
        self.send(&Envelope::Log {
            level,
            message: message.into(),
        })
    }

    /// Send a heartbeat
    pub fn send_heartbeat(&mut self) -> Result<(), ProtocolError> {
        let message = self.protocol.create_heartbeat();
        self.protocol.write_message(&mut self.stream, &message)
    }

    /// Send the end-of-stream marker and close the connection
    pub fn finish(mut self) -> Result<(), ReceiveError> {
        let message = self.protocol.create_end_of_stream();
        self.protocol.write_message(&mut self.stream, &message)?;
        self.stream.shutdown(std::net::Shutdown::Both)?;

        info!(
            "Exchange with {} finished after {} envelopes",
            self.peer, self.envelopes_sent
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_config_default() {
        let config = ListenerConfig::default();
        assert!(config.tcp_nodelay);
        assert!(config.accept_timeout.is_none());
        assert_eq!(config.max_message_size, 100 * 1024 * 1024);
    }

    #[test]
    fn test_listener_bind() {
        let listener = BackendListener::bind("127.0.0.1:0").unwrap();
        assert!(listener.local_addr().is_ok());
        assert_eq!(listener.requests_received(), 0);
    }

    #[test]
    fn test_accept_timeout() {
        let config = ListenerConfig {
            accept_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut listener = BackendListener::bind_with_config("127.0.0.1:0", config).unwrap();

        let start = std::time::Instant::now();
        let result = listener.accept();
        assert!(matches!(result, Err(ReceiveError::AcceptTimeout)));
        assert!(start.elapsed() >= Duration::from_millis(100));
    }
}
