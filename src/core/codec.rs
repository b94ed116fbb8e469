//! Tokio codec for length-delimited frames.
//!
//! Every packet on the wire is `len:u32_BE | body[len]`. The decoder yields
//! one complete body at a time; the encoder prepends the length prefix in the
//! same buffer reservation as the body so a frame is always handed to the
//! socket as one contiguous write.
//!
//! A declared length above [`MAX_FRAME_SIZE`] is a framing violation: the
//! decoder returns an error, which tears the connection down without sending
//! anything back.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::ProxyError;

/// Hard cap on a frame body. Larger frames close the connection.
pub const MAX_FRAME_SIZE: usize = 100 * 1024;

/// Length of the frame header (the `u32` length prefix).
const HEADER_LEN: usize = 4;

/// Stateless framing codec: 4-byte big-endian length prefix, then the body.
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProxyError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let body_len = u32::from_be_bytes(header) as usize;

        if body_len > MAX_FRAME_SIZE {
            return Err(ProxyError::FrameTooLarge(body_len));
        }

        if src.len() < HEADER_LEN + body_len {
            // Reserve what the rest of the frame needs before the next read.
            src.reserve(HEADER_LEN + body_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(body_len)))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProxyError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if body.len() > MAX_FRAME_SIZE {
            return Err(ProxyError::FrameTooLarge(body.len()));
        }
        dst.reserve(HEADER_LEN + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
