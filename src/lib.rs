//! # scard-proxy
//!
//! A network proxy that exposes the host's PC/SC smart-card interface to
//! remote clients over a framed binary TCP protocol. A thin client on
//! another machine drives physical readers attached to this one; the proxy
//! translates each request into a local PC/SC call, tracks the resulting
//! handles on the client's behalf, and enforces the strict per-card
//! serialization the PC/SC contract demands.
//!
//! ## Architecture
//! - [`crate::core`]: length-delimited framing and big-endian primitive encoding
//! - [`proto`]: the opcode set and request/response message types
//! - [`pcsc`]: the backend seam ([`pcsc::ScardBackend`]) and the real
//!   `pcsc-sys` implementation (feature `system`)
//! - [`service`]: the accept loop, the per-connection session engine, and
//!   the per-card worker threads
//! - [`config`]: TOML configuration and the IP allow-list
//!
//! ## Guarantees
//! - At most one PC/SC call is in flight against a given card at any
//!   instant: each card has exactly one dedicated worker thread, and its
//!   queue is FIFO, so responses per card come back in request order.
//! - Frames on a connection never interleave: every outbound frame passes
//!   through one writer per session.
//! - When a connection ends, cleanly or not, every native handle the
//!   client held is disconnected or released before the session is gone.
//!
//! ## Security
//! - Admission is by IP allow-list only; the transport is plaintext TCP.
//! - Frames above 100 KiB close the connection unanswered.
//! - Reader-list buffer requests are capped to keep the proxy from being
//!   used as an amplifier.

pub mod config;
pub mod core;
pub mod error;
pub mod pcsc;
pub mod proto;
pub mod service;

pub use config::{AllowList, ProxyConfig};
pub use error::{ProxyError, Result};
pub use service::server::Server;
