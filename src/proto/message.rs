//! Request and response message types with their wire layouts.
//!
//! Each variant's field order is exactly its payload layout; see the table
//! in the module docs of [`crate::proto`]. Decoders are strict: a body that
//! is short, carries trailing bytes, or holds a non-UTF-8 string is rejected,
//! and rejection is fatal to the connection.

use bytes::Bytes;

use crate::core::wire::{WireReader, WireWriter};
use crate::error::{ProxyError, Result};
use crate::pcsc::IoRequest;
use crate::proto::opcode::Opcode;

/// A client-to-server request, tagged by opcode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    EstablishContext {
        scope: u32,
    },
    ReleaseContext {
        context: u64,
    },
    ListReaders {
        context: u64,
        groups: Option<String>,
        readers_len: u32,
    },
    Connect {
        context: u64,
        reader: String,
        share_mode: u32,
        preferred_protocols: u32,
    },
    Disconnect {
        card: u64,
        disposition: u32,
    },
    BeginTransaction {
        card: u64,
    },
    EndTransaction {
        card: u64,
        disposition: u32,
    },
    Transmit {
        card: u64,
        send_pci: u32,
        send_buffer: Vec<u8>,
        recv_pci: Option<IoRequest>,
        recv_len: u32,
    },
    GetAttrib {
        card: u64,
        attr_id: u32,
        attr_len: u32,
    },
}

/// A server-to-client response, tagged by opcode. Every response carries the
/// backend status word (`api_return`); the remaining fields are whatever the
/// operation produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    EstablishContext {
        api_return: u32,
        context: u64,
    },
    ReleaseContext {
        api_return: u32,
    },
    ListReaders {
        api_return: u32,
        readers: Vec<u8>,
        readers_len: u32,
    },
    Connect {
        api_return: u32,
        card: u64,
        active_protocol: u32,
    },
    Disconnect {
        api_return: u32,
    },
    BeginTransaction {
        api_return: u32,
    },
    EndTransaction {
        api_return: u32,
    },
    Transmit {
        api_return: u32,
        recv_buffer: Vec<u8>,
        recv_pci: Option<IoRequest>,
        recv_len: u32,
    },
    GetAttrib {
        api_return: u32,
        attr_buffer: Vec<u8>,
        attr_len: u32,
    },
}

fn read_opt_io_request(r: &mut WireReader<'_>) -> Result<Option<IoRequest>> {
    if r.read_u8()? == 0 {
        return Ok(None);
    }
    Ok(Some(IoRequest {
        protocol: r.read_u32()?,
        length: r.read_u32()?,
    }))
}

fn put_opt_io_request(w: &mut WireWriter, pci: &Option<IoRequest>) {
    match pci {
        Some(pci) => {
            w.put_u8(1);
            w.put_u32(pci.protocol);
            w.put_u32(pci.length);
        }
        None => w.put_u8(0),
    }
}

impl Request {
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::EstablishContext { .. } => Opcode::EstablishContextReq,
            Request::ReleaseContext { .. } => Opcode::ReleaseContextReq,
            Request::ListReaders { .. } => Opcode::ListReadersReq,
            Request::Connect { .. } => Opcode::ConnectReq,
            Request::Disconnect { .. } => Opcode::DisconnectReq,
            Request::BeginTransaction { .. } => Opcode::BeginTransactionReq,
            Request::EndTransaction { .. } => Opcode::EndTransactionReq,
            Request::Transmit { .. } => Opcode::TransmitReq,
            Request::GetAttrib { .. } => Opcode::GetAttribReq,
        }
    }

    /// Decode a request frame body into `(packet_id, request)`.
    ///
    /// Any response opcode, unknown opcode, or malformed payload is an error;
    /// the session closes the connection on error rather than answering.
    pub fn decode(body: &[u8]) -> Result<(u32, Request)> {
        let mut r = WireReader::new(body);
        let packet_id = r.read_u32()?;
        let opcode_raw = r.read_u32()?;
        let opcode = Opcode::try_from(opcode_raw)?;

        let request = match opcode {
            Opcode::EstablishContextReq => Request::EstablishContext {
                scope: r.read_u32()?,
            },
            Opcode::ReleaseContextReq => Request::ReleaseContext {
                context: r.read_u64()?,
            },
            Opcode::ListReadersReq => {
                let context = r.read_u64()?;
                let groups = if r.read_u8()? != 0 {
                    Some(r.read_string()?)
                } else {
                    None
                };
                Request::ListReaders {
                    context,
                    groups,
                    readers_len: r.read_u32()?,
                }
            }
            Opcode::ConnectReq => Request::Connect {
                context: r.read_u64()?,
                reader: r.read_string()?,
                share_mode: r.read_u32()?,
                preferred_protocols: r.read_u32()?,
            },
            Opcode::DisconnectReq => Request::Disconnect {
                card: r.read_u64()?,
                disposition: r.read_u32()?,
            },
            Opcode::BeginTransactionReq => Request::BeginTransaction {
                card: r.read_u64()?,
            },
            Opcode::EndTransactionReq => Request::EndTransaction {
                card: r.read_u64()?,
                disposition: r.read_u32()?,
            },
            Opcode::TransmitReq => {
                let card = r.read_u64()?;
                let send_pci = r.read_u32()?;
                let send_buffer = r.read_bytes()?;
                let recv_pci = read_opt_io_request(&mut r)?;
                Request::Transmit {
                    card,
                    send_pci,
                    send_buffer,
                    recv_pci,
                    recv_len: r.read_u32()?,
                }
            }
            Opcode::GetAttribReq => Request::GetAttrib {
                card: r.read_u64()?,
                attr_id: r.read_u32()?,
                attr_len: r.read_u32()?,
            },
            // A response opcode in the request direction.
            _ => return Err(ProxyError::UnknownOpcode(opcode_raw)),
        };

        r.finish()?;
        Ok((packet_id, request))
    }

    /// Encode this request as a frame body. Used by clients; the server only
    /// decodes requests.
    pub fn encode(&self, packet_id: u32) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u32(packet_id);
        w.put_u32(self.opcode() as u32);
        match self {
            Request::EstablishContext { scope } => w.put_u32(*scope),
            Request::ReleaseContext { context } => w.put_u64(*context),
            Request::ListReaders {
                context,
                groups,
                readers_len,
            } => {
                w.put_u64(*context);
                match groups {
                    Some(groups) => {
                        w.put_u8(1);
                        w.put_string(groups);
                    }
                    None => w.put_u8(0),
                }
                w.put_u32(*readers_len);
            }
            Request::Connect {
                context,
                reader,
                share_mode,
                preferred_protocols,
            } => {
                w.put_u64(*context);
                w.put_string(reader);
                w.put_u32(*share_mode);
                w.put_u32(*preferred_protocols);
            }
            Request::Disconnect { card, disposition } => {
                w.put_u64(*card);
                w.put_u32(*disposition);
            }
            Request::BeginTransaction { card } => w.put_u64(*card),
            Request::EndTransaction { card, disposition } => {
                w.put_u64(*card);
                w.put_u32(*disposition);
            }
            Request::Transmit {
                card,
                send_pci,
                send_buffer,
                recv_pci,
                recv_len,
            } => {
                w.put_u64(*card);
                w.put_u32(*send_pci);
                w.put_bytes(send_buffer);
                put_opt_io_request(&mut w, recv_pci);
                w.put_u32(*recv_len);
            }
            Request::GetAttrib {
                card,
                attr_id,
                attr_len,
            } => {
                w.put_u64(*card);
                w.put_u32(*attr_id);
                w.put_u32(*attr_len);
            }
        }
        w.into_bytes()
    }
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::EstablishContext { .. } => Opcode::EstablishContextRes,
            Response::ReleaseContext { .. } => Opcode::ReleaseContextRes,
            Response::ListReaders { .. } => Opcode::ListReadersRes,
            Response::Connect { .. } => Opcode::ConnectRes,
            Response::Disconnect { .. } => Opcode::DisconnectRes,
            Response::BeginTransaction { .. } => Opcode::BeginTransactionRes,
            Response::EndTransaction { .. } => Opcode::EndTransactionRes,
            Response::Transmit { .. } => Opcode::TransmitRes,
            Response::GetAttrib { .. } => Opcode::GetAttribRes,
        }
    }

    /// Encode this response as a frame body, echoing the request's packet id.
    pub fn encode(&self, packet_id: u32) -> Bytes {
        let mut w = WireWriter::new();
        w.put_u32(packet_id);
        w.put_u32(self.opcode() as u32);
        match self {
            Response::EstablishContext {
                api_return,
                context,
            } => {
                w.put_u32(*api_return);
                w.put_u64(*context);
            }
            Response::ReleaseContext { api_return }
            | Response::Disconnect { api_return }
            | Response::BeginTransaction { api_return }
            | Response::EndTransaction { api_return } => w.put_u32(*api_return),
            Response::ListReaders {
                api_return,
                readers,
                readers_len,
            } => {
                w.put_u32(*api_return);
                w.put_bytes(readers);
                w.put_u32(*readers_len);
            }
            Response::Connect {
                api_return,
                card,
                active_protocol,
            } => {
                w.put_u32(*api_return);
                w.put_u64(*card);
                w.put_u32(*active_protocol);
            }
            Response::Transmit {
                api_return,
                recv_buffer,
                recv_pci,
                recv_len,
            } => {
                w.put_u32(*api_return);
                w.put_bytes(recv_buffer);
                put_opt_io_request(&mut w, recv_pci);
                w.put_u32(*recv_len);
            }
            Response::GetAttrib {
                api_return,
                attr_buffer,
                attr_len,
            } => {
                w.put_u32(*api_return);
                w.put_bytes(attr_buffer);
                w.put_u32(*attr_len);
            }
        }
        w.into_bytes()
    }

    /// Decode a response frame body into `(packet_id, response)`. Used by
    /// clients; the server only encodes responses.
    pub fn decode(body: &[u8]) -> Result<(u32, Response)> {
        let mut r = WireReader::new(body);
        let packet_id = r.read_u32()?;
        let opcode_raw = r.read_u32()?;
        let opcode = Opcode::try_from(opcode_raw)?;

        let response = match opcode {
            Opcode::EstablishContextRes => Response::EstablishContext {
                api_return: r.read_u32()?,
                context: r.read_u64()?,
            },
            Opcode::ReleaseContextRes => Response::ReleaseContext {
                api_return: r.read_u32()?,
            },
            Opcode::ListReadersRes => Response::ListReaders {
                api_return: r.read_u32()?,
                readers: r.read_bytes()?,
                readers_len: r.read_u32()?,
            },
            Opcode::ConnectRes => Response::Connect {
                api_return: r.read_u32()?,
                card: r.read_u64()?,
                active_protocol: r.read_u32()?,
            },
            Opcode::DisconnectRes => Response::Disconnect {
                api_return: r.read_u32()?,
            },
            Opcode::BeginTransactionRes => Response::BeginTransaction {
                api_return: r.read_u32()?,
            },
            Opcode::EndTransactionRes => Response::EndTransaction {
                api_return: r.read_u32()?,
            },
            Opcode::TransmitRes => {
                let api_return = r.read_u32()?;
                let recv_buffer = r.read_bytes()?;
                let recv_pci = read_opt_io_request(&mut r)?;
                Response::Transmit {
                    api_return,
                    recv_buffer,
                    recv_pci,
                    recv_len: r.read_u32()?,
                }
            }
            Opcode::GetAttribRes => Response::GetAttrib {
                api_return: r.read_u32()?,
                attr_buffer: r.read_bytes()?,
                attr_len: r.read_u32()?,
            },
            _ => return Err(ProxyError::UnknownOpcode(opcode_raw)),
        };

        r.finish()?;
        Ok((packet_id, response))
    }
}
