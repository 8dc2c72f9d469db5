//! Wire protocol for the inference exchange
//!
//! Every frame is a small little-endian header (version, type, payload length)
//! followed by a JSON payload. A viewer sends one `Request` frame; the backend
//! answers with `Envelope` frames, optional heartbeats, and an `EndOfStream`
//! marker once the run is over.

use crate::types::{AssembleRequest, Envelope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use thiserror::Error;
use tracing::{debug, trace};

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u16 = 1;

/// Maximum message size (100MB by default)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;

/// Message types in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Run submission from the viewer
    Request = 0x01,
    /// Response envelope from the backend
    Envelope = 0x02,
    /// Heartbeat/keepalive
    Heartbeat = 0x03,
    /// End of stream marker
    EndOfStream = 0x04,
}

impl MessageType {
    /// Convert from u8 representation
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Request),
            0x02 => Some(Self::Envelope),
            0x03 => Some(Self::Heartbeat),
            0x04 => Some(Self::EndOfStream),
            _ => None,
        }
    }
}

/// Protocol error types
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid protocol version: expected {expected}, got {received}")]
    InvalidVersion { expected: u16, received: u16 },

    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Message too large: {size} bytes exceeds maximum {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Unexpected message type: expected {expected:?}, got {received:?}")]
    UnexpectedMessage {
        expected: MessageType,
        received: MessageType,
    },
}

/// Frame containing type and payload
#[derive(Debug)]
pub struct NetworkMessage {
    /// Protocol version
    pub version: u16,
    /// Message type
    pub msg_type: MessageType,
    /// Serialized payload
    pub payload: Vec<u8>,
}

impl NetworkMessage {
    /// Create a new network message
    pub fn new(msg_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            msg_type,
            payload,
        }
    }

    /// Get the total size of the message when serialized
    pub fn size(&self) -> usize {
        // Version (2) + Type (1) + Length (4) + Payload
        2 + 1 + 4 + self.payload.len()
    }
}

/// Protocol handler for reading and writing messages
#[derive(Debug, Clone)]
pub struct Protocol {
    max_message_size: usize,
}

impl Default for Protocol {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl Protocol {
    /// Create a new protocol handler
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum message size
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    fn encode<T: Serialize>(
        &self,
        msg_type: MessageType,
        value: &T,
    ) -> Result<NetworkMessage, ProtocolError> {
        let payload = serde_json::to_vec(value)?;

        debug!("Serialized {:?} payload: {} bytes", msg_type, payload.len());

        if payload.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload.len(),
                max_size: self.max_message_size,
            });
        }

        Ok(NetworkMessage::new(msg_type, payload))
    }

    fn decode<T: DeserializeOwned>(
        &self,
        expected: MessageType,
        message: &NetworkMessage,
    ) -> Result<T, ProtocolError> {
        if message.msg_type != expected {
            return Err(ProtocolError::UnexpectedMessage {
                expected,
                received: message.msg_type,
            });
        }
        trace!("Deserializing {:?} from {} bytes", expected, message.payload.len());
        Ok(serde_json::from_slice(&message.payload)?)
    }

    /// Serialize a run submission
    pub fn serialize_request(
        &self,
        request: &AssembleRequest,
    ) -> Result<NetworkMessage, ProtocolError> {
        debug!(
            "Serializing request: operation={}, fragments={}, mesh_type={}",
            request.operation,
            request.fragment_count(),
            request.mesh_type
        );
        self.encode(MessageType::Request, request)
    }

    /// Deserialize a run submission
    pub fn deserialize_request(
        &self,
        message: &NetworkMessage,
    ) -> Result<AssembleRequest, ProtocolError> {
        self.decode(MessageType::Request, message)
    }

    /// Serialize a response envelope
    pub fn serialize_envelope(&self, envelope: &Envelope) -> Result<NetworkMessage, ProtocolError> {
        self.encode(MessageType::Envelope, envelope)
    }

    /// Deserialize a response envelope
    pub fn deserialize_envelope(
        &self,
        message: &NetworkMessage,
    ) -> Result<Envelope, ProtocolError> {
        self.decode(MessageType::Envelope, message)
    }

    /// Write a message to a stream
    pub fn write_message<W: Write>(
        &self,
        writer: &mut W,
        message: &NetworkMessage,
    ) -> Result<(), ProtocolError> {
        use byteorder::{LittleEndian, WriteBytesExt};

        debug!(
            "Writing message: type={:?}, payload_size={}",
            message.msg_type,
            message.payload.len()
        );

        // Write header
        writer.write_u16::<LittleEndian>(message.version)?;
        writer.write_u8(message.msg_type as u8)?;
        writer.write_u32::<LittleEndian>(message.payload.len() as u32)?;

        // Write payload
        writer.write_all(&message.payload)?;
        writer.flush()?;

        trace!("Message written successfully");
        Ok(())
    }

    /// Read a message from a stream
    pub fn read_message<R: Read>(&self, reader: &mut R) -> Result<NetworkMessage, ProtocolError> {
        use byteorder::{LittleEndian, ReadBytesExt};

        trace!("Reading message header");

        let version = reader.read_u16::<LittleEndian>()?;
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidVersion {
                expected: PROTOCOL_VERSION,
                received: version,
            });
        }

        let msg_type_raw = reader.read_u8()?;
        let msg_type = MessageType::from_u8(msg_type_raw)
            .ok_or(ProtocolError::InvalidMessageType(msg_type_raw))?;

        let payload_size = reader.read_u32::<LittleEndian>()? as usize;

        debug!(
            "Message header: version={}, type={:?}, size={}",
            version, msg_type, payload_size
        );

        if payload_size > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: payload_size,
                max_size: self.max_message_size,
            });
        }

        let mut payload = vec![0u8; payload_size];
        reader.read_exact(&mut payload)?;

        trace!("Message read successfully");

        Ok(NetworkMessage {
            version,
            msg_type,
            payload,
        })
    }

    /// Create a heartbeat message
    pub fn create_heartbeat(&self) -> NetworkMessage {
        NetworkMessage::new(MessageType::Heartbeat, Vec::new())
    }

    /// Create an end-of-stream message
    pub fn create_end_of_stream(&self) -> NetworkMessage {
        NetworkMessage::new(MessageType::EndOfStream, Vec::new())
    }
}
