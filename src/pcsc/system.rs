//! Real PC/SC backend over the platform library.
//!
//! Thin FFI shims around `pcsc-sys`: winscard on Windows, the PCSC framework
//! on macOS, pcsclite elsewhere. Handle and length types differ per platform
//! (`SCARDCONTEXT` is a `LONG` on pcsclite, a pointer-sized integer on
//! Windows; `DWORD` is a `c_ulong` on pcsclite), so every value crosses the
//! boundary through an explicit cast against the `pcsc-sys` typedefs.
//!
//! Status words come back as `LONG`; the wire carries them as the equivalent
//! unsigned 32-bit pattern (`0x8010_xxxx` for errors).

use std::ffi::CString;
use std::ptr;

use pcsc_sys::{DWORD, LONG, SCARDCONTEXT, SCARDHANDLE, SCARD_IO_REQUEST};

use super::{IoRequest, ScardBackend, SendPci};

/// Backend bound to the host's smart-card service.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl SystemBackend {
    pub fn new() -> Self {
        SystemBackend
    }
}

fn status(code: LONG) -> u32 {
    code as u32
}

/// Reader and group names cross the FFI as C strings; an interior NUL can
/// never name a real reader, so it maps to the invalid-parameter status
/// instead of reaching the service.
fn c_string(value: &str) -> Result<CString, u32> {
    CString::new(value).map_err(|_| pcsc_sys::SCARD_E_INVALID_PARAMETER as u32)
}

fn send_pci_ptr(pci: SendPci) -> *const SCARD_IO_REQUEST {
    // SAFETY: the g_rgSCard*Pci statics are immutable data exported by the
    // platform library for exactly this purpose.
    unsafe {
        match pci {
            SendPci::T0 => ptr::addr_of!(pcsc_sys::g_rgSCardT0Pci),
            SendPci::T1 => ptr::addr_of!(pcsc_sys::g_rgSCardT1Pci),
            SendPci::Raw => ptr::addr_of!(pcsc_sys::g_rgSCardRawPci),
            SendPci::None => ptr::null(),
        }
    }
}

impl ScardBackend for SystemBackend {
    fn establish_context(&self, scope: u32) -> (u32, u64) {
        let mut context: SCARDCONTEXT = 0;
        let rv = unsafe {
            pcsc_sys::SCardEstablishContext(
                scope as DWORD,
                ptr::null(),
                ptr::null(),
                &mut context,
            )
        };
        (status(rv), context as u64)
    }

    fn release_context(&self, context: u64) -> u32 {
        status(unsafe { pcsc_sys::SCardReleaseContext(context as SCARDCONTEXT) })
    }

    fn list_readers(
        &self,
        context: u64,
        groups: Option<&str>,
        readers: &mut [u8],
        readers_len: &mut u32,
    ) -> u32 {
        let groups = match groups.map(c_string).transpose() {
            Ok(groups) => groups,
            Err(code) => return code,
        };

        let mut len: DWORD = *readers_len as DWORD;
        let readers_ptr = if readers.is_empty() {
            ptr::null_mut()
        } else {
            readers.as_mut_ptr().cast()
        };
        let rv = unsafe {
            pcsc_sys::SCardListReaders(
                context as SCARDCONTEXT,
                groups.as_ref().map_or(ptr::null(), |g| g.as_ptr()),
                readers_ptr,
                &mut len,
            )
        };
        *readers_len = len as u32;
        status(rv)
    }

    fn connect(
        &self,
        context: u64,
        reader: &str,
        share_mode: u32,
        preferred_protocols: u32,
    ) -> (u32, u64, u32) {
        let reader = match c_string(reader) {
            Ok(reader) => reader,
            Err(code) => return (code, 0, 0),
        };

        let mut card: SCARDHANDLE = 0;
        let mut active_protocol: DWORD = 0;
        let rv = unsafe {
            pcsc_sys::SCardConnect(
                context as SCARDCONTEXT,
                reader.as_ptr(),
                share_mode as DWORD,
                preferred_protocols as DWORD,
                &mut card,
                &mut active_protocol,
            )
        };
        (status(rv), card as u64, active_protocol as u32)
    }

    fn disconnect(&self, card: u64, disposition: u32) -> u32 {
        status(unsafe { pcsc_sys::SCardDisconnect(card as SCARDHANDLE, disposition as DWORD) })
    }

    fn begin_transaction(&self, card: u64) -> u32 {
        status(unsafe { pcsc_sys::SCardBeginTransaction(card as SCARDHANDLE) })
    }

    fn end_transaction(&self, card: u64, disposition: u32) -> u32 {
        status(unsafe {
            pcsc_sys::SCardEndTransaction(card as SCARDHANDLE, disposition as DWORD)
        })
    }

    fn transmit(
        &self,
        card: u64,
        send_pci: SendPci,
        send_buffer: &[u8],
        recv_pci: Option<&mut IoRequest>,
        recv_buffer: &mut [u8],
        recv_len: &mut u32,
    ) -> u32 {
        let mut native_recv_pci = recv_pci.as_ref().map(|pci| SCARD_IO_REQUEST {
            dwProtocol: pci.protocol as DWORD,
            cbPciLength: pci.length as DWORD,
        });
        let recv_pci_ptr = native_recv_pci
            .as_mut()
            .map_or(ptr::null_mut(), |pci| pci as *mut SCARD_IO_REQUEST);

        let mut len: DWORD = *recv_len as DWORD;
        let rv = unsafe {
            pcsc_sys::SCardTransmit(
                card as SCARDHANDLE,
                send_pci_ptr(send_pci),
                send_buffer.as_ptr(),
                send_buffer.len() as DWORD,
                recv_pci_ptr,
                recv_buffer.as_mut_ptr(),
                &mut len,
            )
        };
        *recv_len = len as u32;

        if let (Some(pci), Some(updated)) = (recv_pci, native_recv_pci) {
            pci.protocol = updated.dwProtocol as u32;
            pci.length = updated.cbPciLength as u32;
        }
        status(rv)
    }

    fn get_attrib(
        &self,
        card: u64,
        attr_id: u32,
        attr_buffer: &mut [u8],
        attr_len: &mut u32,
    ) -> u32 {
        let mut len: DWORD = *attr_len as DWORD;
        let rv = unsafe {
            pcsc_sys::SCardGetAttrib(
                card as SCARDHANDLE,
                attr_id as DWORD,
                attr_buffer.as_mut_ptr(),
                &mut len,
            )
        };
        *attr_len = len as u32;
        status(rv)
    }
}
