//! # PC/SC Backend
//!
//! The seam between the protocol engine and the host smart-card service.
//!
//! The proxy core never calls PC/SC directly; it goes through the
//! [`ScardBackend`] trait. The trait mirrors the synchronous winscard-style
//! API: every call blocks until the service answers, returns a raw status
//! word (`0` = success), and works in terms of opaque handles. Status words
//! are transported to the client untouched; the proxy adds no error
//! vocabulary of its own.
//!
//! The real implementation ([`system::SystemBackend`], feature `system`)
//! binds against the platform library via `pcsc-sys`. Tests substitute a
//! scripted mock.

#[cfg(feature = "system")]
pub mod system;

/// `SCARD_S_SUCCESS`. Every other status word is a failure or warning.
pub const SCARD_S_SUCCESS: u32 = 0;

/// `SCARD_E_INVALID_HANDLE`. Also what the proxy answers for a virtual
/// handle it does not know.
pub const SCARD_E_INVALID_HANDLE: u32 = 0x8010_0003;

/// `SCARD_E_INSUFFICIENT_BUFFER`. Answered for reader-list requests above
/// the anti-amplification cap, without touching the backend.
pub const SCARD_E_INSUFFICIENT_BUFFER: u32 = 0x8010_0008;

/// `SCARD_LEAVE_CARD`, the disposition used when tearing down live card
/// handles at session close.
pub const SCARD_LEAVE_CARD: u32 = 0;

/// Protocol control block selector for a transmit.
///
/// The wire carries a small integer; anything outside the known set passes a
/// null PCB through to the backend, which then rejects the transmit itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPci {
    T0,
    T1,
    Raw,
    /// Unmapped selector; the backend receives no PCB.
    None,
}

impl From<u32> for SendPci {
    fn from(value: u32) -> Self {
        match value {
            0 => SendPci::T0,
            1 => SendPci::T1,
            2 => SendPci::Raw,
            _ => SendPci::None,
        }
    }
}

/// Mutable protocol control block, updated in place by a transmit.
/// Mirrors `SCARD_IO_REQUEST` (`dwProtocol`, `cbPciLength`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRequest {
    pub protocol: u32,
    pub length: u32,
}

/// Synchronous PC/SC interface, exactly the calls the proxy core needs.
///
/// Contract: thread-safe across distinct handles; calls may block
/// arbitrarily long (`begin_transaction` until another process releases the
/// card). The proxy guarantees that calls against one card handle are never
/// issued concurrently, because each card has a single dedicated worker
/// thread.
///
/// Buffer-returning calls follow the winscard shape: the caller provides a
/// buffer and an in/out length; the backend writes into the buffer (when it
/// fits) and stores the actual length. An empty buffer probes for the
/// required length.
pub trait ScardBackend: Send + Sync {
    /// `SCardEstablishContext`. Returns `(status, context)`; the context is
    /// `0` unless the service handed one out.
    fn establish_context(&self, scope: u32) -> (u32, u64);

    /// `SCardReleaseContext`.
    fn release_context(&self, context: u64) -> u32;

    /// `SCardListReaders`. `readers_len` is in/out: requested capacity in,
    /// actual (or required) length out.
    fn list_readers(
        &self,
        context: u64,
        groups: Option<&str>,
        readers: &mut [u8],
        readers_len: &mut u32,
    ) -> u32;

    /// `SCardConnect`. Returns `(status, card, active_protocol)`.
    fn connect(
        &self,
        context: u64,
        reader: &str,
        share_mode: u32,
        preferred_protocols: u32,
    ) -> (u32, u64, u32);

    /// `SCardDisconnect`.
    fn disconnect(&self, card: u64, disposition: u32) -> u32;

    /// `SCardBeginTransaction`. May block until the card is free.
    fn begin_transaction(&self, card: u64) -> u32;

    /// `SCardEndTransaction`.
    fn end_transaction(&self, card: u64, disposition: u32) -> u32;

    /// `SCardTransmit`. `recv_len` is in/out; `recv_pci`, when given, is
    /// updated in place with the backend's view of the receive protocol.
    #[allow(clippy::too_many_arguments)]
    fn transmit(
        &self,
        card: u64,
        send_pci: SendPci,
        send_buffer: &[u8],
        recv_pci: Option<&mut IoRequest>,
        recv_buffer: &mut [u8],
        recv_len: &mut u32,
    ) -> u32;

    /// `SCardGetAttrib`. `attr_len` is in/out.
    fn get_attrib(&self, card: u64, attr_id: u32, attr_buffer: &mut [u8], attr_len: &mut u32)
        -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_pci_mapping() {
        assert_eq!(SendPci::from(0), SendPci::T0);
        assert_eq!(SendPci::from(1), SendPci::T1);
        assert_eq!(SendPci::from(2), SendPci::Raw);
        assert_eq!(SendPci::from(3), SendPci::None);
        assert_eq!(SendPci::from(u32::MAX), SendPci::None);
    }

    #[test]
    fn status_constants_match_the_abi() {
        assert_eq!(SCARD_S_SUCCESS, 0);
        assert_eq!(SCARD_E_INVALID_HANDLE, 0x8010_0003);
        assert_eq!(SCARD_E_INSUFFICIENT_BUFFER, 0x8010_0008);
        assert_eq!(SCARD_LEAVE_CARD, 0);
    }
}
