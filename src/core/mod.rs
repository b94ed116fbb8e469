//! # Core Wire Components
//!
//! Low-level framing and primitive encoding for the proxy protocol.
//!
//! ## Components
//! - **Codec**: Tokio codec for length-delimited framing over byte streams
//! - **Wire**: checked big-endian primitive reader/writer
//!
//! ## Wire Format
//! ```text
//! [Length(4, BE)] [PacketId(4, BE)] [Opcode(4, BE)] [Payload(N)]
//! ```
//!
//! The length prefix covers everything after itself. A reader must refuse
//! frames larger than [`codec::MAX_FRAME_SIZE`] by closing the connection:
//! a peer that produces one has lost framing and cannot be resynchronized.

pub mod codec;
pub mod wire;
