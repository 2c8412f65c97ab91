/// Hard ceiling on a single reliable frame payload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame declares {declared} bytes, maximum is {max}")]
    TooLarge { declared: usize, max: usize },
}

/// Prefixes `payload` with its little-endian u32 length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Reassembles length-prefixed frames from a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    /// On an oversized declaration the partial buffer is discarded and the
    /// caller is expected to drop the connection.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            if self.buffer.len() < LENGTH_PREFIX {
                return Ok(None);
            }

            let mut prefix = [0u8; LENGTH_PREFIX];
            prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX]);
            let declared = u32::from_le_bytes(prefix) as usize;

            if declared > MAX_FRAME_SIZE {
                self.buffer.clear();
                return Err(FrameError::TooLarge {
                    declared,
                    max: MAX_FRAME_SIZE,
                });
            }

            if self.buffer.len() < LENGTH_PREFIX + declared {
                return Ok(None);
            }

            let frame: Vec<u8> = self.buffer[LENGTH_PREFIX..LENGTH_PREFIX + declared].to_vec();
            self.buffer.drain(..LENGTH_PREFIX + declared);

            if frame.is_empty() {
                continue;
            }
            return Ok(Some(frame));
        }
    }
}
