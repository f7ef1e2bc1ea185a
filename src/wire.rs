use bytes::{Bytes, BytesMut};

/// Cursor ran off the end of the input. The HPACK layer reports it as an
/// invalid-compression error, the frame layer as a short frame.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("read past end of buffer")]
pub struct ShortRead;

/// Big-endian cursor over a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn read_u8(&mut self) -> Result<u8, ShortRead> {
        let byte = *self.buf.get(self.pos).ok_or(ShortRead)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, ShortRead> {
        // unwrap: read_bytes returned exactly 2 bytes
        Ok(u16::from_be_bytes(self.read_bytes(2)?.try_into().unwrap()))
    }

    pub fn read_u32(&mut self) -> Result<u32, ShortRead> {
        // unwrap: read_bytes returned exactly 4 bytes
        Ok(u32::from_be_bytes(self.read_bytes(4)?.try_into().unwrap()))
    }

    pub fn read_u64(&mut self) -> Result<u64, ShortRead> {
        // unwrap: read_bytes returned exactly 8 bytes
        Ok(u64::from_be_bytes(self.read_bytes(8)?.try_into().unwrap()))
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], ShortRead> {
        let end = self.pos.checked_add(n).ok_or(ShortRead)?;
        let slice = self.buf.get(self.pos..end).ok_or(ShortRead)?;
        self.pos = end;
        Ok(slice)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[must_use]
    pub fn done(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// Growing in-memory buffer with the operations symmetric to [`WireReader`].
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.extend_from_slice(&[value]);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[must_use]
    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
