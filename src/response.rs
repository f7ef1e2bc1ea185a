use crate::rpc;
use crate::status::StatusCode;
use crate::types::{header_value, Headers};
use bytes::Bytes;

/// Everything a stream accumulated by the time it closed: the merged
/// header list (initial headers and trailers alike) and the raw body
/// bytes, envelope included.
#[derive(Debug, Clone)]
pub struct Response {
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        header_value(&self.headers, name)
    }

    #[must_use]
    pub fn status(&self) -> Option<u16> {
        self.header(":status").and_then(|v| v.parse().ok())
    }

    #[must_use]
    pub fn grpc_status(&self) -> Option<StatusCode> {
        self.header(rpc::GRPC_STATUS).and_then(StatusCode::from_trailer)
    }

    #[must_use]
    pub fn grpc_message(&self) -> Option<String> {
        self.header(rpc::GRPC_MESSAGE).map(rpc::decode_grpc_message)
    }

    /// The message body with the 5-byte envelope stripped.
    pub fn message(&self) -> Result<Bytes, rpc::EnvelopeError> {
        let (_, message) = rpc::decode_message(&self.body)?;
        Ok(Bytes::copy_from_slice(message))
    }
}
