//! # Wire Framing
//!
//! One TCP frame is a `u32` little-endian length prefix followed by the
//! bincode serialization of an [`Envelope`]. Frames are concatenated on
//! the stream with no further framing; the length prefix is the only
//! record boundary, so a decode failure leaves the stream unsynchronized
//! and the connection must be torn down.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::config::MAX_FRAME_BYTES;
use crate::message::Envelope;

/// Bytes in the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Framing and codec failures.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: &'static str },
    #[error("frame too large: max {max} got {got}")]
    FrameTooLarge { max: usize, got: usize },
    #[error("frame decode failed: {0}")]
    Decode(String),
}

/// Serializes one envelope as a length-prefixed frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, envelope: &Envelope) -> Result<(), FrameError> {
    let body = bincode::serialize(envelope).map_err(|e| FrameError::Decode(e.to_string()))?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
            got: body.len(),
        });
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the stream ended cleanly at a frame
/// boundary; EOF inside a frame is an error.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Envelope>, FrameError> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0usize;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame header truncated").into());
        }
        filled += n;
    }

    let len = u32::from_le_bytes(header) as usize;
    if len == 0 {
        return Err(FrameError::LengthInvalid {
            reason: "frame length cannot be zero",
        });
    }
    if len > MAX_FRAME_BYTES {
        return Err(FrameError::FrameTooLarge {
            max: MAX_FRAME_BYTES,
            got: len,
        });
    }

    let mut body = vec![0u8; len];
    let mut filled = 0usize;
    while filled < len {
        let n = reader.read(&mut body[filled..])?;
        if n == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "frame body truncated").into());
        }
        filled += n;
    }

    let envelope = bincode::deserialize(&body).map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(Some(envelope))
}
