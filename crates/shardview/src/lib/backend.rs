//! Seam between an assembly task and whatever answers its submissions

use shardview_network::{AssembleRequest, Envelope, EnvelopeStream, InferenceClient, NetworkError};

/// Something that accepts one submission and streams envelopes back
///
/// The stream is consumed strictly in order; an `Err` item or the end of
/// the iterator closes the exchange.
pub trait InferenceBackend {
    type Error: std::error::Error;
    type Stream: Iterator<Item = Result<Envelope, Self::Error>>;

    fn submit(&mut self, request: &AssembleRequest) -> Result<Self::Stream, Self::Error>;
}

impl InferenceBackend for InferenceClient {
    type Error = NetworkError;
    type Stream = EnvelopeStream;

    fn submit(&mut self, request: &AssembleRequest) -> Result<EnvelopeStream, NetworkError> {
        InferenceClient::submit(self, request)
    }
}
