//! Batch framing for outbound messages.
//!
//! A frame is a sequence of records, each a varint length prefix followed by
//! the message payload. Frames are cut so that none exceeds the configured
//! maximum batch size, except that a single oversized record always gets a
//! frame of its own.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::message::Message;
use crate::varint;

/// Largest payload a record length prefix can describe.
pub const MAX_PAYLOAD_SIZE: usize = u32::MAX as usize;

/// Reusable frame encoder. One per flush worker; never shared.
pub struct BatchEncoder {
    max_batch_size: usize,
    current: BytesMut,
    frames: Vec<Bytes>,
}

impl BatchEncoder {
    /// Create an encoder cutting frames at `max_batch_size` bytes.
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            current: BytesMut::new(),
            frames: Vec::new(),
        }
    }

    #[inline]
    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Discard any partially built frame and previous output.
    pub fn reset(&mut self) {
        self.current.clear();
        self.frames.clear();
    }

    /// Append one message, cutting a frame first if it would overflow.
    ///
    /// Payloads over [`MAX_PAYLOAD_SIZE`] are skipped; the engine rejects
    /// them at publish.
    pub fn push(&mut self, msg: &Message) {
        let Ok(len) = u32::try_from(msg.payload.len()) else {
            return;
        };
        let record_len = varint::encoded_len(len) + msg.payload.len();

        if !self.current.is_empty() && self.current.len() + record_len > self.max_batch_size {
            self.cut();
        }

        let mut prefix = [0u8; varint::MAX_LEN];
        let n = varint::encode_to_slice(len, &mut prefix);
        self.current.reserve(record_len);
        self.current.put_slice(&prefix[..n]);
        self.current.put_slice(&msg.payload);

        if self.current.len() >= self.max_batch_size {
            self.cut();
        }
    }

    /// Close the frame in progress and return all frames built since the last reset.
    pub fn finish(&mut self) -> &[Bytes] {
        if !self.current.is_empty() {
            self.cut();
        }
        &self.frames
    }

    /// Reset, encode `messages`, and return the resulting frames.
    pub fn encode(&mut self, messages: &[Message]) -> &[Bytes] {
        self.reset();
        for msg in messages {
            self.push(msg);
        }
        self.finish()
    }

    fn cut(&mut self) {
        self.frames.push(self.current.split().freeze());
    }
}

/// Split a frame back into message payloads (zero-copy slices of `frame`).
pub fn decode_frame(frame: &Bytes) -> Result<Vec<Bytes>, FrameError> {
    let mut out = Vec::new();
    let mut pos = 0;

    while pos < frame.len() {
        let (len, consumed) = match varint::decode(&frame[pos..])? {
            Some(v) => v,
            None => {
                return Err(FrameError::Truncated {
                    needed: pos + 1,
                    have: frame.len(),
                })
            }
        };
        let start = pos + consumed;
        let end = start + len;
        if end > frame.len() {
            return Err(FrameError::Truncated {
                needed: end,
                have: frame.len(),
            });
        }
        out.push(frame.slice(start..end));
        pos = end;
    }

    Ok(out)
}
