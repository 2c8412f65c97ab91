//! Little-endian field-at-a-time binary codec shared by every wire format.

mod framing;

pub use framing::{FrameDecoder, FrameError, MAX_FRAME_SIZE, encode_frame};

/// Width of fixed-size name fields on the wire.
pub const NAME_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("buffer truncated: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("packet too short for opcode {opcode:#04x}: {len} bytes, minimum {min}")]
    TooShort { opcode: u8, len: usize, min: usize },
    #[error("empty packet")]
    Empty,
    #[error("unknown opcode: {0:#04x}")]
    UnknownOpcode(u8),
    #[error("invalid {what} tag: {value}")]
    InvalidTag { what: &'static str, value: u8 },
}

#[derive(Debug, Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Writes `value` into exactly `width` bytes, zero padded. Overlong
    /// strings are cut on a char boundary.
    pub fn write_fixed_str(&mut self, value: &str, width: usize) {
        let mut end = value.len().min(width);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        self.buf.extend_from_slice(&value.as_bytes()[..end]);
        self.buf.resize(self.buf.len() + (width - end), 0);
    }

    /// Overwrites a previously written u32 at `offset`.
    pub fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        if self.remaining() < n {
            return Err(CodecError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, CodecError> {
        self.take_array().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        self.take_array().map(u32::from_le_bytes)
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        self.take_array().map(u64::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, CodecError> {
        self.take_array().map(f32::from_le_bytes)
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        self.take(n)
    }

    /// Reads a zero padded string of `width` bytes. Invalid UTF-8 is
    /// replaced rather than rejected; names are display-only.
    pub fn read_fixed_str(&mut self, width: usize) -> Result<String, CodecError> {
        let raw = self.take(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
    }
}

/// Rejects `data` unless it holds at least `min` bytes. `data[0]` is the opcode.
pub fn ensure_min_len(data: &[u8], min: usize) -> Result<(), CodecError> {
    let Some(&opcode) = data.first() else {
        return Err(CodecError::Empty);
    };
    if data.len() < min {
        return Err(CodecError::TooShort {
            opcode,
            len: data.len(),
            min,
        });
    }
    Ok(())
}
