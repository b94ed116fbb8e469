//! Wire opcodes.
//!
//! Request/response pairs are interleaved, starting at 1. These values are
//! the wire contract; reordering or renumbering is a breaking change.

use crate::error::ProxyError;

/// Operation selector in every packet body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Opcode {
    EstablishContextReq = 1,
    EstablishContextRes = 2,
    ReleaseContextReq = 3,
    ReleaseContextRes = 4,
    ListReadersReq = 5,
    ListReadersRes = 6,
    ConnectReq = 7,
    ConnectRes = 8,
    DisconnectReq = 9,
    DisconnectRes = 10,
    BeginTransactionReq = 11,
    BeginTransactionRes = 12,
    EndTransactionReq = 13,
    EndTransactionRes = 14,
    TransmitReq = 15,
    TransmitRes = 16,
    GetAttribReq = 17,
    GetAttribRes = 18,
}

impl Opcode {
    /// Whether this opcode names a client-to-server request.
    pub fn is_request(self) -> bool {
        (self as u32) % 2 == 1
    }
}

impl TryFrom<u32> for Opcode {
    type Error = ProxyError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Opcode::EstablishContextReq),
            2 => Ok(Opcode::EstablishContextRes),
            3 => Ok(Opcode::ReleaseContextReq),
            4 => Ok(Opcode::ReleaseContextRes),
            5 => Ok(Opcode::ListReadersReq),
            6 => Ok(Opcode::ListReadersRes),
            7 => Ok(Opcode::ConnectReq),
            8 => Ok(Opcode::ConnectRes),
            9 => Ok(Opcode::DisconnectReq),
            10 => Ok(Opcode::DisconnectRes),
            11 => Ok(Opcode::BeginTransactionReq),
            12 => Ok(Opcode::BeginTransactionRes),
            13 => Ok(Opcode::EndTransactionReq),
            14 => Ok(Opcode::EndTransactionRes),
            15 => Ok(Opcode::TransmitReq),
            16 => Ok(Opcode::TransmitRes),
            17 => Ok(Opcode::GetAttribReq),
            18 => Ok(Opcode::GetAttribRes),
            _ => Err(ProxyError::UnknownOpcode(value)),
        }
    }
}
