//! Network library for streaming fragment reassembly runs between a viewer and
//! an inference backend
//!
//! A viewer submits one [`AssembleRequest`] per run and then reads a sequence of
//! [`Envelope`] messages (lifecycle stages, tagged data payloads and log lines)
//! until the backend closes the exchange.

pub mod client;
pub mod protocol;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use client::{ClientConfig, ClientStats, EnvelopeStream, InferenceClient, NetworkError};
pub use protocol::{MessageType, Protocol, ProtocolError, PROTOCOL_VERSION};
pub use server::{BackendListener, ListenerConfig, ReceiveError, ResponseWriter};
pub use types::{
    AssembleRequest, Envelope, InferenceSettings, InputData, LogLevel, MeshFile, MeshType,
    Payload, SampleStrategy, Stage, TransformationData, ASSEMBLE_OPERATION,
};

/// Result type for client operations
pub type Result<T> = std::result::Result<T, NetworkError>;
