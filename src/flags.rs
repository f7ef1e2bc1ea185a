use bitflags::bitflags;

bitflags! {
    /// https://httpwg.org/specs/rfc7540.html#DATA
    #[repr(transparent)]
    pub struct DataFlags: u8 {
        /// Last frame the endpoint will send for this stream; moves the
        /// stream into a half-closed or closed state.
        const END_STREAM = 0x1;
        /// A Pad Length field and padding follow the payload.
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#HEADERS
    #[repr(transparent)]
    pub struct HeadersFlags: u8 {
        /// The header block is the last thing the endpoint sends for the
        /// stream (CONTINUATION frames may still follow it).
        const END_STREAM = 0x1;
        /// The frame holds an entire header block, no CONTINUATION follows.
        const END_HEADERS = 0x4;
        /// A Pad Length field and padding are present.
        const PADDED = 0x8;
        /// Exclusive flag, stream dependency and weight precede the block.
        const PRIORITY = 0x20;
    }

    /// https://httpwg.org/specs/rfc7540.html#SETTINGS
    #[repr(transparent)]
    pub struct SettingsFlags: u8 {
        /// Acknowledges the peer's SETTINGS; the payload must be empty.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#PUSH_PROMISE
    #[repr(transparent)]
    pub struct PushPromiseFlags: u8 {
        const END_HEADERS = 0x4;
        const PADDED = 0x8;
    }

    /// https://httpwg.org/specs/rfc7540.html#PING
    #[repr(transparent)]
    pub struct PingFlags: u8 {
        /// Marks a PING response; never reply to a PING carrying it.
        const ACK = 0x1;
    }

    /// https://httpwg.org/specs/rfc7540.html#CONTINUATION
    #[repr(transparent)]
    pub struct ContinuationFlags: u8 {
        /// This frame ends the header block.
        const END_HEADERS = 0x4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::From, derive_more::TryInto)]
pub enum Flags {
    Data(DataFlags),
    Headers(HeadersFlags),
    Settings(SettingsFlags),
    PushPromise(PushPromiseFlags),
    Ping(PingFlags),
    Continuation(ContinuationFlags),
    None,
}

impl Flags {
    /// END_STREAM as carried by DATA or HEADERS; other frame types never
    /// end a stream themselves.
    #[must_use]
    pub fn end_stream(self) -> bool {
        match self {
            Self::Data(flags) => flags.contains(DataFlags::END_STREAM),
            Self::Headers(flags) => flags.contains(HeadersFlags::END_STREAM),
            _ => false,
        }
    }

    #[must_use]
    pub fn end_headers(self) -> bool {
        match self {
            Self::Headers(flags) => flags.contains(HeadersFlags::END_HEADERS),
            Self::Continuation(flags) => flags.contains(ContinuationFlags::END_HEADERS),
            Self::PushPromise(flags) => flags.contains(PushPromiseFlags::END_HEADERS),
            _ => false,
        }
    }
}
