use num_derive::{FromPrimitive, ToPrimitive};

pub type StreamId = u32;

/// Stream 0 carries connection-scoped control frames and owns no data.
pub const CONNECTION_STREAM: StreamId = 0;

/// An ordered multimap; names are lowercased on emit and pseudo-headers
/// (leading `:`) sort before ordinary headers.
pub type Headers = Vec<(String, String)>;

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

impl From<crate::wire::ShortRead> for FrameDecodeError {
    fn from(_: crate::wire::ShortRead) -> Self {
        Self::PayloadTooShort
    }
}

#[derive(thiserror::Error, Debug)]
pub enum FrameDecodeError {
    #[error("unknown frame type: {0:#x}")]
    UnknownType(u8),
    #[error("payload is shorter than expected")]
    PayloadTooShort,
    #[error("payload length {0} does not fit in 24 bits")]
    PayloadTooLong(usize),
    #[error("unexpected 0 window increment")]
    ZeroWindowIncrement,
    #[error("unknown error code: {0}")]
    UnknownErrorCode(u32),
    #[error("PING payload must be exactly 8 bytes, got {0}")]
    BadPingLength(usize),
}

/// https://httpwg.org/specs/rfc7540.html#FrameTypes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0x0,
    Headers = 0x1,
    Priority = 0x2,
    ResetStream = 0x3,
    Settings = 0x4,
    PushPromise = 0x5,
    Ping = 0x6,
    GoAway = 0x7,
    WindowUpdate = 0x8,
    Continuation = 0x9,
}

/// https://httpwg.org/specs/rfc7540.html#ErrorCodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, FromPrimitive, ToPrimitive)]
#[repr(u32)]
#[non_exhaustive]
pub enum ErrorType {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

/// https://httpwg.org/specs/rfc7540.html#SettingValues
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromPrimitive,
    ToPrimitive,
    enum_map::Enum,
)]
#[repr(u16)]
#[non_exhaustive]
pub enum SettingsParameter {
    /// Maximum size in octets of the header compression table used to decode
    /// header blocks sent by this peer. Initial value 4096.
    HeaderTableSize = 0x1,
    /// 0 disables server push. Clients here always advertise 0.
    EnablePush = 0x2,
    /// Maximum number of concurrent streams the sender permits.
    MaxConcurrentStreams = 0x3,
    /// Sender's initial window size for stream-level flow control.
    /// Initial value 2^16-1 (65,535) octets.
    InitialWindowSize = 0x4,
    /// Largest frame payload the sender is willing to receive.
    MaxFrameSize = 0x5,
    /// Advisory cap on the uncompressed size of a header list.
    MaxHeaderListSize = 0x6,
}
