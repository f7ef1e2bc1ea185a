//! RPC message framing: the 5-byte envelope around every message body
//! (1-byte compression flag, 4-byte big-endian length), the path split,
//! and the trailer conventions.

use crate::wire::WireWriter;
use bytes::Bytes;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};

pub const ENVELOPE_SIZE: usize = 5;

pub const CONTENT_TYPE: &str = "content-type";
pub const CONTENT_TYPE_GRPC: &str = "application/grpc";
pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";

/// Escaping for `grpc-message` values: controls, `%` itself, and anything
/// beyond ASCII.
const MESSAGE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("message body is shorter than the 5-byte envelope")]
    TooShort,
    #[error("envelope declares {declared} bytes but only {available} follow")]
    LengthMismatch { declared: usize, available: usize },
}

/// Wrap a message body: flag byte 0 (never compressed on emit) plus the
/// big-endian length.
#[must_use]
pub fn encode_message(body: &[u8]) -> Bytes {
    let mut out = WireWriter::with_capacity(ENVELOPE_SIZE + body.len());
    out.put_u8(0);
    out.put_u32(body.len() as u32);
    out.put_bytes(body);
    out.freeze()
}

/// Unwrap one enveloped message, returning the compression flag and the
/// message bytes. A non-zero flag is passed through undecoded.
pub fn decode_message(body: &[u8]) -> Result<(u8, &[u8]), EnvelopeError> {
    if body.len() < ENVELOPE_SIZE {
        return Err(EnvelopeError::TooShort);
    }
    let flag = body[0];
    // unwrap: the slice is always 4 bytes
    let declared = u32::from_be_bytes(body[1..5].try_into().unwrap()) as usize;
    let rest = &body[ENVELOPE_SIZE..];
    if declared > rest.len() {
        return Err(EnvelopeError::LengthMismatch {
            declared,
            available: rest.len(),
        });
    }
    Ok((flag, &rest[..declared]))
}

/// Split `"/" + service + "/" + method` into its two components.
#[must_use]
pub fn split_path(path: &str) -> Option<(&str, &str)> {
    let mut parts = path.split('/');
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(""), Some(service), Some(method), None)
            if !service.is_empty() && !method.is_empty() =>
        {
            Some((service, method))
        }
        _ => None,
    }
}

#[must_use]
pub fn encode_grpc_message(message: &str) -> String {
    utf8_percent_encode(message, MESSAGE_ESCAPES).to_string()
}

#[must_use]
pub fn decode_grpc_message(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
