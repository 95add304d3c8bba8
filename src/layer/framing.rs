//! Length-prefixed framing over a byte stream.
//!
//! Wire format: `length: u32 BE | payload[length]`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};
use crate::pipeline::{Context, Signal, Stage};

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Bytes> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::invalid(format!("payload of {} bytes cannot be framed", payload.len())))?;
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Splits an arbitrarily chunked byte stream back into frames.
#[derive(Debug)]
pub struct Reassembler {
    buf: BytesMut,
    max_len: usize,
}

impl Reassembler {
    /// Create a reassembler that rejects frames longer than `max_len`.
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
        }
    }

    /// Append a chunk and return every frame it completes, in order.
    ///
    /// A trailing partial frame stays buffered for the next call.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        while self.buf.len() >= LENGTH_PREFIX_SIZE {
            let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
            prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
            let len = u32::from_be_bytes(prefix) as usize;
            if len > self.max_len {
                return Err(Error::FrameTooLarge {
                    len,
                    max: self.max_len,
                });
            }
            if self.buf.len() < LENGTH_PREFIX_SIZE + len {
                self.buf.reserve(LENGTH_PREFIX_SIZE + len - self.buf.len());
                break;
            }
            self.buf.advance(LENGTH_PREFIX_SIZE);
            frames.push(self.buf.split_to(len).freeze());
        }
        Ok(frames)
    }

    /// Bytes held over from previous chunks.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }
}

/// Stage that frames payloads going down and reassembles them coming up.
pub struct FramingStage {
    reassembler: Reassembler,
}

impl FramingStage {
    /// Create a framing stage with the given frame cap.
    pub fn new(max_len: usize) -> Self {
        Self {
            reassembler: Reassembler::new(max_len),
        }
    }
}

impl Stage for FramingStage {
    fn name(&self) -> &'static str {
        "framing"
    }

    fn fetch_data_from_up(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        // A peer with the same cap would reject it.
        if data.len() > self.reassembler.max_len {
            let e = Error::FrameTooLarge {
                len: data.len(),
                max: self.reassembler.max_len,
            };
            return ctx.dispatch_signal_down(Signal::error(e));
        }
        match encode_frame(&data) {
            Ok(frame) => ctx.dispatch_data_down(frame),
            Err(e) => ctx.dispatch_signal_down(Signal::error(e)),
        }
    }

    fn fetch_data_from_down(&mut self, ctx: &mut Context<'_>, data: Bytes) -> Result<()> {
        match self.reassembler.push(&data) {
            Ok(frames) => {
                for frame in frames {
                    ctx.dispatch_data_up(frame)?;
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(src = ?ctx.env().src, error = %e, "rejecting stream");
                ctx.dispatch_signal_down(Signal::error(e))
            }
        }
    }
}
