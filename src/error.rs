//! # Error Types
//!
//! Error handling for the proxy.
//!
//! The error taxonomy mirrors the protocol's failure model: anything in this
//! enum is fatal to the connection it occurred on (wire violations, transport
//! failures, configuration problems). Failures the protocol can express, such
//! as unknown handles, backend status codes, and buffer caps, are *not* errors
//! here; they travel back to the client as the `apiReturn` word of a normal
//! response.
//!
//! All errors implement `std::error::Error` for interoperability.

use std::io;
use thiserror::Error;

/// Primary error type for all proxy operations.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A frame length prefix exceeded the hard cap. The peer has lost framing
    /// (or is hostile); the connection is closed without a response.
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(usize),

    /// An opcode that is not valid in the direction it was received.
    #[error("unknown opcode: {0}")]
    UnknownOpcode(u32),

    /// A packet body ended before all declared fields were read.
    #[error("truncated packet body")]
    ShortBody,

    /// A packet body carried bytes past its last field.
    #[error("trailing bytes after packet body")]
    TrailingBody,

    /// A length-prefixed string field was not valid UTF-8.
    #[error("string field is not valid UTF-8")]
    InvalidString,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Type alias for Results using `ProxyError`.
pub type Result<T> = std::result::Result<T, ProxyError>;
