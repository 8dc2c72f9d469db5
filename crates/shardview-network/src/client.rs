//! Client side of the inference exchange

use crate::protocol::{MessageType, Protocol, ProtocolError};
use crate::types::{AssembleRequest, Envelope};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Errors that can occur during network operations
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Configuration for the inference client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Maximum message size in bytes
    pub max_message_size: usize,
    /// TCP no-delay setting
    pub tcp_nodelay: bool,
    /// Connection timeout
    pub connect_timeout: Option<Duration>,
    /// Maximum wait for the next response frame; `None` waits indefinitely
    pub read_timeout: Option<Duration>,
    /// Write timeout
    pub write_timeout: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_message_size: 100 * 1024 * 1024, // 100MB
            tcp_nodelay: true,
            connect_timeout: Some(Duration::from_secs(10)),
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(30)),
        }
    }
}

/// TCP client that submits runs to an inference backend
#[derive(Debug, Clone)]
pub struct InferenceClient {
    addr: SocketAddr,
    protocol: Protocol,
    config: ClientConfig,
}

impl InferenceClient {
    /// Create a client for the backend at the given address
    pub fn new<A: ToSocketAddrs>(addr: A) -> Result<Self, NetworkError> {
        Self::with_config(addr, ClientConfig::default())
    }

    /// Create a client with custom configuration
    pub fn with_config<A: ToSocketAddrs>(
        addr: A,
        config: ClientConfig,
    ) -> Result<Self, NetworkError> {
        let addr = addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| NetworkError::InvalidAddress("No valid address".to_string()))?;

        let protocol = Protocol::new().with_max_message_size(config.max_message_size);

        Ok(Self {
            addr,
            protocol,
            config,
        })
    }

    /// Address of the backend
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    fn connect(&self) -> Result<TcpStream, NetworkError> {
        info!("Connecting to inference backend at {}...", self.addr);

        let stream = if let Some(timeout) = self.config.connect_timeout {
            TcpStream::connect_timeout(&self.addr, timeout)?
        } else {
            TcpStream::connect(self.addr)?
        };

        stream.set_nodelay(self.config.tcp_nodelay)?;
        stream.set_read_timeout(self.config.read_timeout)?;
        stream.set_write_timeout(self.config.write_timeout)?;

        info!("Connected to {}", stream.peer_addr()?);
        Ok(stream)
    }

    /// Open one exchange: send the request and return the response stream
    pub fn submit(&self, request: &AssembleRequest) -> Result<EnvelopeStream, NetworkError> {
        request
            .settings
            .validate()
            .map_err(NetworkError::InvalidRequest)?;

        let mut stream = self.connect()?;
        let message = self.protocol.serialize_request(request)?;
        let bytes_sent = message.size() as u64;
        self.protocol.write_message(&mut stream, &message)?;

        debug!(
            "Submitted {} ({} fragments, {} bytes)",
            request.operation,
            request.fragment_count(),
            bytes_sent
        );

        Ok(EnvelopeStream {
            stream,
            protocol: self.protocol.clone(),
            finished: false,
            stats: ClientStats {
                bytes_sent,
                ..Default::default()
            },
        })
    }
}

/// Response side of one exchange
///
/// Yields envelopes in arrival order. Heartbeats are skipped; the iterator
/// ends at the end-of-stream marker and stops after the first error.
pub struct EnvelopeStream {
    stream: TcpStream,
    protocol: Protocol,
    finished: bool,
    stats: ClientStats,
}

impl EnvelopeStream {
    /// Get statistics about the exchange so far
    pub fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Close the connection without waiting for the backend
    pub fn close(mut self) -> Result<(), NetworkError> {
        self.finished = true;
        self.stream.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    fn read_next(&mut self) -> Result<Option<Envelope>, NetworkError> {
        loop {
            let message = self.protocol.read_message(&mut self.stream)?;
            self.stats.bytes_received += message.size() as u64;

            match message.msg_type {
                MessageType::Envelope => {
                    let envelope = self.protocol.deserialize_envelope(&message)?;
                    self.stats.envelopes_received += 1;
                    trace!("Received envelope #{}", self.stats.envelopes_received);
                    return Ok(Some(envelope));
                }
                MessageType::Heartbeat => {
                    trace!("Received heartbeat");
                    continue;
                }
                MessageType::EndOfStream => {
                    info!(
                        "Exchange closed by backend after {} envelopes",
                        self.stats.envelopes_received
                    );
                    return Ok(None);
                }
                MessageType::Request => {
                    warn!("Ignoring unexpected message type: {:?}", message.msg_type);
                    continue;
                }
            }
        }
    }
}

impl Iterator for EnvelopeStream {
    type Item = Result<Envelope, NetworkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_next() {
            Ok(Some(envelope)) => Some(Ok(envelope)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

/// Statistics about one exchange
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientStats {
    /// Bytes written for the submission
    pub bytes_sent: u64,
    /// Number of envelopes received
    pub envelopes_received: u64,
    /// Total bytes received
    pub bytes_received: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{InferenceSettings, MeshFile, MeshType};
    use std::net::TcpListener;
    use std::thread;

    fn request() -> AssembleRequest {
        AssembleRequest::with_files(
            vec![MeshFile::new("a.obj", vec![1]), MeshFile::new("b.obj", vec![2])],
            MeshType::Obj,
            InferenceSettings::default(),
        )
    }

    #[test]
    fn test_client_config_default() {
        let config = ClientConfig::default();
        assert!(config.tcp_nodelay);
        assert!(config.read_timeout.is_none());
        assert_eq!(config.max_message_size, 100 * 1024 * 1024);
    }

    #[test]
    fn test_submit_connection_refused() {
        let client = InferenceClient::new("127.0.0.1:1").unwrap();
        assert!(client.submit(&request()).is_err());
    }

    #[test]
    fn test_submit_rejects_invalid_settings() {
        let client = InferenceClient::new("127.0.0.1:1").unwrap();
        let mut request = request();
        request.settings.steps = 0;
        assert!(matches!(
            client.submit(&request),
            Err(NetworkError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_stream_ends_on_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        // Read the submission, then drop the connection without answering
        thread::spawn(move || {
            if let Ok((mut stream, _)) = listener.accept() {
                let _ = Protocol::new().read_message(&mut stream);
            }
        });

        let client = InferenceClient::new(addr).unwrap();
        let mut stream = client.submit(&request()).unwrap();
        assert!(stream.stats().bytes_sent > 0);

        assert!(matches!(stream.next(), Some(Err(_))));
        assert!(stream.next().is_none());
    }
}
