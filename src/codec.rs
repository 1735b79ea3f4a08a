use bytes::{Buf, BytesMut};
use std::io::Cursor;
use tokio_util::codec::{Decoder, Encoder};

use crate::command::Command;
use crate::frame::{self, Frame, FrameCheck};
use crate::Error;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024;

/// Encodes commands and decodes replies. Each decoded reply consumes exactly its own bytes from
/// the read buffer; whatever follows stays buffered for the next call.
///
/// A reply arriving over several reads is checked incrementally and parsed once, after its last
/// byte is in.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    check: FrameCheck,
}

impl FrameCodec {
    pub fn new() -> FrameCodec {
        FrameCodec::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> FrameCodec {
        FrameCodec {
            max_frame_size,
            check: FrameCheck::default(),
        }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let length = match self.check.advance(&src[..], self.max_frame_size) {
            Ok(length) => length,
            Err(frame::Error::Incomplete) => {
                // Only a reply that is still incomplete can grow past the limit.
                if src.len() > self.max_frame_size {
                    self.check.reset();
                    return Err(frame::Error::FrameTooLarge(self.max_frame_size).into());
                }
                return Ok(None);
            }
            Err(err) => {
                self.check.reset();
                return Err(err.into());
            }
        };

        let mut cursor = Cursor::new(&src[..length]);
        let frame = Frame::parse(&mut cursor)?;

        // Remove the parsed frame from the buffer.
        src.advance(length);

        Ok(Some(frame))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(frame::Error::Truncated.into()),
        }
    }
}

impl<'a> Encoder<&'a Command> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, cmd: &'a Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        cmd.encode(dst);
        Ok(())
    }
}
