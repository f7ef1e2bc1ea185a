//! The wire frame codec: a 9-byte header (24-bit length, type, flags,
//! 31-bit stream id) followed by a typed payload.

use crate::flags::*;
use crate::types::*;
use crate::wire::{WireReader, WireWriter};
use bytes::Bytes;
use num_traits::{FromPrimitive, ToPrimitive};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const FRAME_HEADER_SIZE: usize = 9;
pub const MAX_PAYLOAD_SIZE: usize = (1 << 24) - 1;

#[derive(thiserror::Error, Debug)]
pub enum FrameReadError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Decode(#[from] FrameDecodeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream: StreamId,
        flags: DataFlags,
        data: Bytes,
    },
    Headers {
        stream: StreamId,
        flags: HeadersFlags,
        fragment: Bytes,
    },
    Priority {
        stream: StreamId,
        dependency: StreamId,
        exclusive: bool,
        weight: u8,
    },
    ResetStream {
        stream: StreamId,
        error: ErrorType,
    },
    Settings {
        flags: SettingsFlags,
        params: Vec<(SettingsParameter, u32)>,
    },
    PushPromise {
        stream: StreamId,
        flags: PushPromiseFlags,
        promised: StreamId,
        fragment: Bytes,
    },
    Ping {
        flags: PingFlags,
        data: [u8; 8],
    },
    GoAway {
        last_stream: StreamId,
        error: ErrorType,
        debug: Bytes,
    },
    WindowUpdate {
        stream: StreamId,
        increment: u32,
    },
    Continuation {
        stream: StreamId,
        flags: ContinuationFlags,
        fragment: Bytes,
    },
}

impl Frame {
    #[must_use]
    pub fn settings_ack() -> Self {
        Self::Settings {
            flags: SettingsFlags::ACK,
            params: Vec::new(),
        }
    }

    #[must_use]
    pub fn ping_ack(data: [u8; 8]) -> Self {
        Self::Ping {
            flags: PingFlags::ACK,
            data,
        }
    }

    #[must_use]
    pub fn stream_id(&self) -> StreamId {
        match self {
            Self::Data { stream, .. }
            | Self::Headers { stream, .. }
            | Self::Priority { stream, .. }
            | Self::ResetStream { stream, .. }
            | Self::PushPromise { stream, .. }
            | Self::WindowUpdate { stream, .. }
            | Self::Continuation { stream, .. } => *stream,
            Self::Settings { .. } | Self::Ping { .. } | Self::GoAway { .. } => CONNECTION_STREAM,
        }
    }

    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Data { .. } => FrameType::Data,
            Self::Headers { .. } => FrameType::Headers,
            Self::Priority { .. } => FrameType::Priority,
            Self::ResetStream { .. } => FrameType::ResetStream,
            Self::Settings { .. } => FrameType::Settings,
            Self::PushPromise { .. } => FrameType::PushPromise,
            Self::Ping { .. } => FrameType::Ping,
            Self::GoAway { .. } => FrameType::GoAway,
            Self::WindowUpdate { .. } => FrameType::WindowUpdate,
            Self::Continuation { .. } => FrameType::Continuation,
        }
    }

    #[must_use]
    pub fn flags(&self) -> Flags {
        match self {
            Self::Data { flags, .. } => Flags::from(*flags),
            Self::Headers { flags, .. } => Flags::from(*flags),
            Self::Settings { flags, .. } => Flags::from(*flags),
            Self::PushPromise { flags, .. } => Flags::from(*flags),
            Self::Ping { flags, .. } => Flags::from(*flags),
            Self::Continuation { flags, .. } => Flags::from(*flags),
            Self::Priority { .. }
            | Self::ResetStream { .. }
            | Self::GoAway { .. }
            | Self::WindowUpdate { .. } => Flags::None,
        }
    }

    /// Read one frame. `Ok(None)` is a clean EOF at a frame boundary; EOF
    /// inside a frame is a short-frame error. The second tuple element is
    /// the raw payload length as it appeared on the wire, which the
    /// flow-control accounting charges (padding included).
    pub async fn read_from<R>(reader: &mut R) -> Result<Option<(Self, usize)>, FrameReadError>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(FrameDecodeError::PayloadTooShort.into());
            }
            filled += n;
        }

        let length = u32::from_be_bytes([0, header[0], header[1], header[2]]) as usize;
        let typ = FrameType::from_u8(header[3])
            .ok_or(FrameDecodeError::UnknownType(header[3]))?;
        let flags = header[4];
        // unwrap: the slice is always 4 bytes
        let stream =
            u32::from_be_bytes(header[5..9].try_into().unwrap()) & (u32::MAX >> 1);

        let mut payload = vec![0u8; length];
        reader.read_exact(&mut payload).await.map_err(|err| {
            if err.kind() == io::ErrorKind::UnexpectedEof {
                FrameReadError::from(FrameDecodeError::PayloadTooShort)
            } else {
                FrameReadError::from(err)
            }
        })?;

        let frame = Self::parse_payload(typ, flags, stream, &payload)?;
        Ok(Some((frame, length)))
    }

    fn parse_payload(
        typ: FrameType,
        raw_flags: u8,
        stream: StreamId,
        payload: &[u8],
    ) -> Result<Self, FrameDecodeError> {
        let mut reader = WireReader::new(payload);
        let frame = match typ {
            FrameType::Data => {
                let mut flags = DataFlags::from_bits_truncate(raw_flags);
                let data = strip_padding(
                    &mut reader,
                    flags.contains(DataFlags::PADDED),
                )?;
                flags.remove(DataFlags::PADDED);
                Self::Data {
                    stream,
                    flags,
                    data: Bytes::copy_from_slice(data),
                }
            }
            FrameType::Headers => {
                let mut flags = HeadersFlags::from_bits_truncate(raw_flags);
                let padded = flags.contains(HeadersFlags::PADDED);
                let pad = if padded { usize::from(reader.read_u8()?) } else { 0 };
                if flags.contains(HeadersFlags::PRIORITY) {
                    // inert here: the dependency tree is recorded nowhere
                    reader.read_u32()?;
                    reader.read_u8()?;
                }
                let rest = reader.read_bytes(reader.remaining())?;
                let fragment = rest
                    .get(..rest.len().checked_sub(pad).ok_or(FrameDecodeError::PayloadTooShort)?)
                    .ok_or(FrameDecodeError::PayloadTooShort)?;
                flags.remove(HeadersFlags::PADDED | HeadersFlags::PRIORITY);
                Self::Headers {
                    stream,
                    flags,
                    fragment: Bytes::copy_from_slice(fragment),
                }
            }
            FrameType::Priority => {
                let word = reader.read_u32()?;
                Self::Priority {
                    stream,
                    dependency: word & (u32::MAX >> 1),
                    exclusive: word >> 31 == 1,
                    weight: reader.read_u8()?,
                }
            }
            FrameType::ResetStream => {
                let code = reader.read_u32()?;
                Self::ResetStream {
                    stream,
                    error: ErrorType::from_u32(code)
                        .ok_or(FrameDecodeError::UnknownErrorCode(code))?,
                }
            }
            FrameType::Settings => {
                let mut params = Vec::with_capacity(payload.len() / 6);
                while !reader.done() {
                    let id = reader.read_u16()?;
                    let value = reader.read_u32()?;
                    // unknown parameters are ignored, per the protocol
                    if let Some(param) = SettingsParameter::from_u16(id) {
                        params.push((param, value));
                    }
                }
                Self::Settings {
                    flags: SettingsFlags::from_bits_truncate(raw_flags),
                    params,
                }
            }
            FrameType::PushPromise => {
                let mut flags = PushPromiseFlags::from_bits_truncate(raw_flags);
                let padded = flags.contains(PushPromiseFlags::PADDED);
                let pad = if padded { usize::from(reader.read_u8()?) } else { 0 };
                let promised = reader.read_u32()? & (u32::MAX >> 1);
                let rest = reader.read_bytes(reader.remaining())?;
                let fragment = rest
                    .get(..rest.len().checked_sub(pad).ok_or(FrameDecodeError::PayloadTooShort)?)
                    .ok_or(FrameDecodeError::PayloadTooShort)?;
                flags.remove(PushPromiseFlags::PADDED);
                Self::PushPromise {
                    stream,
                    flags,
                    promised,
                    fragment: Bytes::copy_from_slice(fragment),
                }
            }
            FrameType::Ping => {
                if payload.len() != 8 {
                    return Err(FrameDecodeError::BadPingLength(payload.len()));
                }
                // unwrap: length checked just above
                Self::Ping {
                    flags: PingFlags::from_bits_truncate(raw_flags),
                    data: payload.try_into().unwrap(),
                }
            }
            FrameType::GoAway => {
                let last_stream = reader.read_u32()? & (u32::MAX >> 1);
                let code = reader.read_u32()?;
                Self::GoAway {
                    last_stream,
                    error: ErrorType::from_u32(code)
                        .ok_or(FrameDecodeError::UnknownErrorCode(code))?,
                    debug: Bytes::copy_from_slice(reader.read_bytes(reader.remaining())?),
                }
            }
            FrameType::WindowUpdate => {
                let increment = reader.read_u32()? & (u32::MAX >> 1);
                if increment == 0 {
                    return Err(FrameDecodeError::ZeroWindowIncrement);
                }
                Self::WindowUpdate { stream, increment }
            }
            FrameType::Continuation => Self::Continuation {
                stream,
                flags: ContinuationFlags::from_bits_truncate(raw_flags),
                fragment: Bytes::copy_from_slice(reader.read_bytes(reader.remaining())?),
            },
        };
        Ok(frame)
    }

    /// Serialize header and payload into a single buffer, ready for one
    /// atomic write.
    pub fn encode(&self) -> Result<Bytes, FrameDecodeError> {
        let mut payload = WireWriter::with_capacity(64);
        let flags_byte = match self {
            Self::Data { flags, data, .. } => {
                payload.put_bytes(data);
                flags.bits()
            }
            Self::Headers { flags, fragment, .. } => {
                payload.put_bytes(fragment);
                flags.bits()
            }
            Self::Priority {
                dependency,
                exclusive,
                weight,
                ..
            } => {
                payload.put_u32(dependency | u32::from(*exclusive) << 31);
                payload.put_u8(*weight);
                0
            }
            Self::ResetStream { error, .. } => {
                // unwrap: ErrorType is repr(u32)
                payload.put_u32(error.to_u32().unwrap());
                0
            }
            Self::Settings { flags, params } => {
                for (param, value) in params {
                    // unwrap: SettingsParameter is repr(u16)
                    payload.put_u16(param.to_u16().unwrap());
                    payload.put_u32(*value);
                }
                flags.bits()
            }
            Self::PushPromise {
                flags,
                promised,
                fragment,
                ..
            } => {
                payload.put_u32(*promised);
                payload.put_bytes(fragment);
                flags.bits()
            }
            Self::Ping { flags, data } => {
                payload.put_bytes(data);
                flags.bits()
            }
            Self::GoAway {
                last_stream,
                error,
                debug,
            } => {
                payload.put_u32(*last_stream);
                // unwrap: ErrorType is repr(u32)
                payload.put_u32(error.to_u32().unwrap());
                payload.put_bytes(debug);
                0
            }
            Self::WindowUpdate { increment, .. } => {
                payload.put_u32(*increment);
                0
            }
            Self::Continuation { flags, fragment, .. } => {
                payload.put_bytes(fragment);
                flags.bits()
            }
        };

        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(FrameDecodeError::PayloadTooLong(payload.len()));
        }

        let mut out = WireWriter::with_capacity(FRAME_HEADER_SIZE + payload.len());
        out.put_bytes(&(payload.len() as u32).to_be_bytes()[1..]);
        // unwrap: FrameType is repr(u8)
        out.put_u8(self.frame_type().to_u8().unwrap());
        out.put_u8(flags_byte);
        out.put_u32(self.stream_id() & (u32::MAX >> 1));
        out.put_bytes(&payload.freeze());
        Ok(out.freeze())
    }
}

fn strip_padding<'a>(
    reader: &mut WireReader<'a>,
    padded: bool,
) -> Result<&'a [u8], FrameDecodeError> {
    let pad = if padded { usize::from(reader.read_u8()?) } else { 0 };
    let rest = reader.read_bytes(reader.remaining())?;
    rest.get(..rest.len().checked_sub(pad).ok_or(FrameDecodeError::PayloadTooShort)?)
        .ok_or(FrameDecodeError::PayloadTooShort)
}

impl From<Vec<(SettingsParameter, u32)>> for Frame {
    fn from(params: Vec<(SettingsParameter, u32)>) -> Self {
        Self::Settings {
            flags: SettingsFlags::empty(),
            params,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip(frame: Frame) {
        let encoded = frame.encode().unwrap();
        let (parsed, len) = Frame::read_from(&mut &encoded[..]).await.unwrap().unwrap();
        assert_eq!(parsed, frame);
        assert_eq!(len, encoded.len() - FRAME_HEADER_SIZE);
    }

    #[tokio::test]
    async fn every_variant_round_trips() {
        round_trip(Frame::Data {
            stream: 1,
            flags: DataFlags::END_STREAM,
            data: Bytes::from_static(b"hello"),
        })
        .await;
        round_trip(Frame::Headers {
            stream: 3,
            flags: HeadersFlags::END_HEADERS | HeadersFlags::END_STREAM,
            fragment: Bytes::from_static(&[0x82, 0x84]),
        })
        .await;
        round_trip(Frame::Priority {
            stream: 5,
            dependency: 3,
            exclusive: true,
            weight: 200,
        })
        .await;
        round_trip(Frame::ResetStream {
            stream: 7,
            error: ErrorType::Cancel,
        })
        .await;
        round_trip(Frame::Settings {
            flags: SettingsFlags::empty(),
            params: vec![
                (SettingsParameter::EnablePush, 0),
                (SettingsParameter::InitialWindowSize, 65_535),
            ],
        })
        .await;
        round_trip(Frame::PushPromise {
            stream: 1,
            flags: PushPromiseFlags::END_HEADERS,
            promised: 2,
            fragment: Bytes::from_static(&[0x82]),
        })
        .await;
        round_trip(Frame::ping_ack(*b"12345678")).await;
        round_trip(Frame::GoAway {
            last_stream: 9,
            error: ErrorType::ProtocolError,
            debug: Bytes::from_static(b"bye"),
        })
        .await;
        round_trip(Frame::WindowUpdate {
            stream: 0,
            increment: 40_000,
        })
        .await;
        round_trip(Frame::Continuation {
            stream: 11,
            flags: ContinuationFlags::END_HEADERS,
            fragment: Bytes::from_static(&[0x86]),
        })
        .await;
    }

    #[tokio::test]
    async fn payload_length_boundary() {
        let frame = Frame::Data {
            stream: 1,
            flags: DataFlags::empty(),
            data: Bytes::from(vec![0u8; 0xff_fffe]),
        };
        let encoded = frame.encode().unwrap();
        let (parsed, len) = Frame::read_from(&mut &encoded[..]).await.unwrap().unwrap();
        assert_eq!(len, 0xff_fffe);
        assert_eq!(parsed, frame);

        let too_long = Frame::Data {
            stream: 1,
            flags: DataFlags::empty(),
            data: Bytes::from(vec![0u8; 0x100_0000]),
        };
        assert!(matches!(
            too_long.encode(),
            Err(FrameDecodeError::PayloadTooLong(0x100_0000))
        ));
    }

    #[tokio::test]
    async fn reserved_stream_bit_is_masked() {
        let mut wire = Frame::WindowUpdate {
            stream: 5,
            increment: 1,
        }
        .encode()
        .unwrap()
        .to_vec();
        wire[5] |= 0x80; // set the reserved bit on the stream id
        let (parsed, _) = Frame::read_from(&mut &wire[..]).await.unwrap().unwrap();
        assert_eq!(parsed.stream_id(), 5);
    }

    #[tokio::test]
    async fn unknown_type_is_rejected() {
        let wire = [0u8, 0, 0, 0xa, 0, 0, 0, 0, 1];
        assert!(matches!(
            Frame::read_from(&mut &wire[..]).await,
            Err(FrameReadError::Decode(FrameDecodeError::UnknownType(0xa)))
        ));
    }

    #[tokio::test]
    async fn truncated_payload_is_a_short_frame() {
        let encoded = Frame::ping_ack([0; 8]).encode().unwrap();
        let wire = &encoded[..encoded.len() - 3];
        assert!(matches!(
            Frame::read_from(&mut &wire[..]).await,
            Err(FrameReadError::Decode(FrameDecodeError::PayloadTooShort))
        ));
    }

    #[tokio::test]
    async fn eof_at_frame_boundary_is_clean() {
        assert!(Frame::read_from(&mut &b""[..]).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_settings_are_ignored() {
        // id 0x99 is nothing we know; the entry simply drops out
        let wire = [
            0, 0, 12, 0x4, 0, 0, 0, 0, 0, // header: len 12, SETTINGS
            0x00, 0x99, 0, 0, 0, 1, // unknown parameter
            0x00, 0x02, 0, 0, 0, 0, // EnablePush = 0
        ];
        let (parsed, _) = Frame::read_from(&mut &wire[..]).await.unwrap().unwrap();
        assert_eq!(
            parsed,
            Frame::Settings {
                flags: SettingsFlags::empty(),
                params: vec![(SettingsParameter::EnablePush, 0)],
            }
        );
    }

    #[tokio::test]
    async fn padded_data_is_stripped_and_charged() {
        // DATA with PADDED: pad length 2, body "hi", two pad bytes
        let wire = [
            0, 0, 5, 0x0, 0x8, 0, 0, 0, 1, // header
            2, b'h', b'i', 0, 0,
        ];
        let (parsed, len) = Frame::read_from(&mut &wire[..]).await.unwrap().unwrap();
        assert_eq!(len, 5);
        assert_eq!(
            parsed,
            Frame::Data {
                stream: 1,
                flags: DataFlags::empty(),
                data: Bytes::from_static(b"hi"),
            }
        );
    }
}
