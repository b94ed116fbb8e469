//! Per-card worker.
//!
//! A worker owns one virtual card handle for its entire life. All PC/SC
//! calls against that card run on the worker's own OS thread, pulled from a
//! FIFO queue. That is what makes the per-card serialization guarantee
//! hold, and what keeps a `begin_transaction` that blocks for minutes from
//! stalling anything but its own card.
//!
//! The worker holds a weak reference back to the session: it must reach the
//! session's send path to emit responses, but must not keep the session
//! alive past the client's disconnect. If the upgrade fails the response is
//! dropped and the thread exits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use crate::error::Result;
use crate::pcsc::{IoRequest, SendPci, SCARD_E_INVALID_HANDLE, SCARD_S_SUCCESS};
use crate::proto::Response;

use super::lock;
use super::session::SessionShared;

/// A card-scoped operation queued for a worker. The session has already
/// resolved which card this is; the worker knows its own handles.
pub(crate) enum CardRequest {
    Connect {
        context: u64,
        reader: String,
        share_mode: u32,
        preferred_protocols: u32,
    },
    Disconnect {
        disposition: u32,
    },
    BeginTransaction,
    EndTransaction {
        disposition: u32,
    },
    Transmit {
        send_pci: u32,
        send_buffer: Vec<u8>,
        recv_pci: Option<IoRequest>,
        recv_len: u32,
    },
    GetAttrib {
        attr_id: u32,
        attr_len: u32,
    },
}

pub(crate) struct CardWorker {
    virtual_card: u64,
    session: Weak<SessionShared>,
    /// Native PC/SC card handle; 0 until `connect` succeeds.
    native: AtomicU64,
    running: AtomicBool,
    queue: Mutex<VecDeque<(u32, CardRequest)>>,
    available: Condvar,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CardWorker {
    /// Create a worker with its first request (always the connect) already
    /// queued, and start its thread.
    pub(crate) fn spawn(
        virtual_card: u64,
        session: Weak<SessionShared>,
        packet_id: u32,
        first: CardRequest,
    ) -> Result<Arc<CardWorker>> {
        let worker = Arc::new(CardWorker {
            virtual_card,
            session,
            native: AtomicU64::new(0),
            running: AtomicBool::new(true),
            queue: Mutex::new(VecDeque::from([(packet_id, first)])),
            available: Condvar::new(),
            thread: Mutex::new(None),
        });

        let runner = Arc::clone(&worker);
        let handle = thread::Builder::new()
            .name(format!("card-{virtual_card}"))
            .spawn(move || runner.run())?;
        *lock(&worker.thread) = Some(handle);

        Ok(worker)
    }

    /// Whether the worker still accepts requests. Cleared by a failed
    /// connect, a successful disconnect, or session teardown.
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub(crate) fn native_handle(&self) -> u64 {
        self.native.load(Ordering::SeqCst)
    }

    pub(crate) fn enqueue(&self, packet_id: u32, request: CardRequest) {
        lock(&self.queue).push_back((packet_id, request));
        self.available.notify_one();
    }

    /// Stop the worker and wait for its thread. The caller is responsible
    /// for first disconnecting the native handle if the worker might be
    /// blocked inside a PC/SC call; that disconnect is what makes this
    /// join terminate.
    pub(crate) fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.available.notify_all();
        let handle = lock(&self.thread).take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Block until a request is available. Returns `None` once the worker
    /// is stopped and the queue is drained.
    fn next_request(&self) -> Option<(u32, CardRequest)> {
        let mut queue = lock(&self.queue);
        loop {
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }
            queue = self
                .available
                .wait(queue)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn run(self: Arc<Self>) {
        while let Some((packet_id, request)) = self.next_request() {
            // The session owns this worker; if it is gone the connection is
            // gone and there is nowhere to send the response.
            let Some(session) = self.session.upgrade() else {
                return;
            };
            let response = self.execute(&session, request);
            session.send_blocking(response.encode(packet_id));
        }
    }

    fn execute(&self, session: &SessionShared, request: CardRequest) -> Response {
        let backend = session.backend();
        match request {
            CardRequest::Connect {
                context,
                reader,
                share_mode,
                preferred_protocols,
            } => self.connect(session, context, &reader, share_mode, preferred_protocols),
            CardRequest::Disconnect { disposition } => {
                let api_return = backend.disconnect(self.native_handle(), disposition);
                if api_return == SCARD_S_SUCCESS {
                    // No further requests are accepted; the session's table
                    // entry stays until the connection closes.
                    self.running.store(false, Ordering::SeqCst);
                }
                Response::Disconnect { api_return }
            }
            CardRequest::BeginTransaction => Response::BeginTransaction {
                api_return: backend.begin_transaction(self.native_handle()),
            },
            CardRequest::EndTransaction { disposition } => Response::EndTransaction {
                api_return: backend.end_transaction(self.native_handle(), disposition),
            },
            CardRequest::Transmit {
                send_pci,
                send_buffer,
                mut recv_pci,
                recv_len,
            } => {
                let mut recv_buffer = vec![0u8; recv_len as usize];
                let mut out_len = recv_len;
                let api_return = backend.transmit(
                    self.native_handle(),
                    SendPci::from(send_pci),
                    &send_buffer,
                    recv_pci.as_mut(),
                    &mut recv_buffer,
                    &mut out_len,
                );
                recv_buffer.truncate(out_len as usize);
                Response::Transmit {
                    api_return,
                    recv_buffer,
                    recv_pci,
                    recv_len: out_len,
                }
            }
            CardRequest::GetAttrib { attr_id, attr_len } => {
                let mut attr_buffer = vec![0u8; attr_len as usize];
                let mut out_len = attr_len;
                let api_return = backend.get_attrib(
                    self.native_handle(),
                    attr_id,
                    &mut attr_buffer,
                    &mut out_len,
                );
                attr_buffer.truncate(out_len as usize);
                Response::GetAttrib {
                    api_return,
                    attr_buffer,
                    attr_len: out_len,
                }
            }
        }
    }

    fn connect(
        &self,
        session: &SessionShared,
        context: u64,
        reader: &str,
        share_mode: u32,
        preferred_protocols: u32,
    ) -> Response {
        // The session validated the context at dispatch, but it may have
        // been released while this request sat in the queue.
        let Some(native_context) = session.lookup_context(context) else {
            self.running.store(false, Ordering::SeqCst);
            return Response::Connect {
                api_return: SCARD_E_INVALID_HANDLE,
                card: 0,
                active_protocol: 0,
            };
        };

        let (api_return, native_card, active_protocol) = session.backend().connect(
            native_context,
            reader,
            share_mode,
            preferred_protocols,
        );
        if api_return == SCARD_S_SUCCESS {
            self.native.store(native_card, Ordering::SeqCst);
        } else {
            self.running.store(false, Ordering::SeqCst);
        }

        Response::Connect {
            api_return,
            card: self.virtual_card,
            active_protocol,
        }
    }
}
