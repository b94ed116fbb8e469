//! # Protocol Messages
//!
//! The opcode set and the request/response message types.
//!
//! Every packet body is `packetId:u32 | opcode:u32 | payload`. The packet id
//! is an opaque round-trip token: the server never interprets it beyond
//! echoing the request's value in the matching response. Requests and
//! responses use distinct opcodes, so a message's direction is unambiguous
//! from its body alone.
//!
//! Messages are a tagged sum over opcodes ([`message::Request`],
//! [`message::Response`]) with hand-written big-endian encoders and decoders.
//! The layouts are fixed wire contracts, not a serialization format.

pub mod message;
pub mod opcode;

pub use message::{Request, Response};
pub use opcode::Opcode;
