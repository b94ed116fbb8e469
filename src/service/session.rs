//! Per-connection protocol engine.
//!
//! One `Session` per accepted TCP connection. It owns the socket, the two
//! handle tables (virtual context and virtual card), and the set of card
//! workers. The reader task pulls one frame at a time, decodes it, and
//! either handles the request in place (context-scoped operations plus the
//! validation half of `Connect`) or queues it on the matching card worker.
//!
//! All outbound frames funnel through a single writer task via a bounded
//! channel. That is the serialization point that keeps frames from ever
//! interleaving on the socket, whether a response was produced by the
//! session task or a worker thread.
//!
//! ## Close and teardown
//!
//! A read error, a write error, a decode failure, or an oversized frame all
//! end the session the same way: the close callback fires exactly once,
//! then teardown disconnects every live native card handle with
//! `SCARD_LEAVE_CARD` (unblocking any worker stuck in a transmit), stops
//! and joins every worker thread, and releases every native context. A
//! disconnected client never leaves a native handle behind.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::core::codec::FrameCodec;
use crate::error::{ProxyError, Result};
use crate::pcsc::{
    ScardBackend, SCARD_E_INSUFFICIENT_BUFFER, SCARD_E_INVALID_HANDLE, SCARD_LEAVE_CARD,
    SCARD_S_SUCCESS,
};
use crate::proto::{Request, Response};

use super::lock;
use super::worker::{CardRequest, CardWorker};

/// Anti-amplification cap on the reader-list buffer a client may request.
/// Larger requests answer `SCARD_E_INSUFFICIENT_BUFFER` without touching
/// the backend.
pub const READERS_BUFFER_CAP: u32 = 25_600;

/// Depth of the outbound response queue feeding the writer task.
const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Session state reachable from card worker threads.
///
/// The context table lives here because a worker's `connect` re-resolves the
/// virtual context on its own thread. Only the session task ever mutates the
/// table; workers read it.
pub(crate) struct SessionShared {
    peer: SocketAddr,
    backend: Arc<dyn ScardBackend>,
    contexts: Mutex<HashMap<u64, u64>>,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
}

impl SessionShared {
    pub(crate) fn backend(&self) -> &dyn ScardBackend {
        &*self.backend
    }

    pub(crate) fn lookup_context(&self, virtual_context: u64) -> Option<u64> {
        lock(&self.contexts).get(&virtual_context).copied()
    }

    fn insert_context(&self, virtual_context: u64, native: u64) {
        lock(&self.contexts).insert(virtual_context, native);
    }

    fn remove_context(&self, virtual_context: u64) {
        lock(&self.contexts).remove(&virtual_context);
    }

    fn drain_contexts(&self) -> Vec<u64> {
        lock(&self.contexts).drain().map(|(_, native)| native).collect()
    }

    /// Submit a frame body from a worker thread. A send failure means the
    /// writer is gone and the connection is closing; the frame is dropped.
    pub(crate) fn send_blocking(&self, body: Bytes) {
        let _ = self.outbound.blocking_send(body);
    }

    async fn send(&self, body: Bytes) {
        let _ = self.outbound.send(body).await;
    }
}

/// Virtual handle allocator. Starts at 1; never yields `0` ("absent") or
/// `0xFFFFFFFF` (reserved by the PC/SC ABI), including after wrap-around.
struct HandleAllocator {
    next: u64,
}

impl HandleAllocator {
    fn new() -> Self {
        Self { next: 1 }
    }

    fn allocate(&mut self) -> u64 {
        let handle = self.next;
        self.next = self.next.wrapping_add(1);
        if self.next == 0xFFFF_FFFF {
            self.next += 1;
        }
        if self.next == 0 {
            self.next = 1;
        }
        handle
    }
}

pub(crate) struct Session {
    shared: Arc<SessionShared>,
    cards: HashMap<u64, Arc<CardWorker>>,
    context_handles: HandleAllocator,
    card_handles: HandleAllocator,
    on_close: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Session {
    /// Wire up a session on an accepted connection: split the socket, start
    /// the writer task, start the reader task.
    pub(crate) fn spawn(
        stream: TcpStream,
        peer: SocketAddr,
        backend: Arc<dyn ScardBackend>,
        on_close: Box<dyn FnOnce() + Send + Sync>,
    ) {
        let (read_half, write_half) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        let shared = Arc::new(SessionShared {
            peer,
            backend,
            contexts: Mutex::new(HashMap::new()),
            outbound,
            cancel: cancel.clone(),
        });

        tokio::spawn(write_loop(write_half, outbound_rx, cancel));

        let session = Session {
            shared,
            cards: HashMap::new(),
            context_handles: HandleAllocator::new(),
            card_handles: HandleAllocator::new(),
            on_close: Some(on_close),
        };
        tokio::spawn(session.run(read_half));
    }

    async fn run(mut self, read_half: OwnedReadHalf) {
        let mut frames = FramedRead::new(read_half, FrameCodec);
        let cancel = self.shared.cancel.clone();
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                frame = frames.next() => match frame {
                    Some(Ok(body)) => {
                        if let Err(error) = self.handle_frame(&body).await {
                            debug!(peer = %self.shared.peer, %error, "closing connection");
                            break;
                        }
                    }
                    Some(Err(error)) => {
                        debug!(peer = %self.shared.peer, %error, "closing connection");
                        break;
                    }
                    None => break,
                },
            }
        }
        self.close().await;
    }

    async fn close(mut self) {
        if let Some(on_close) = self.on_close.take() {
            on_close();
        }
        self.shared.cancel.cancel();
        // Teardown makes blocking PC/SC calls and joins worker threads;
        // keep it off the reactor.
        let _ = task::spawn_blocking(move || self.teardown()).await;
    }

    fn teardown(&mut self) {
        for (_, worker) in self.cards.drain() {
            let native = worker.native_handle();
            if native != 0 {
                self.shared.backend.disconnect(native, SCARD_LEAVE_CARD);
            }
            worker.shutdown();
        }
        for native in self.shared.drain_contexts() {
            self.shared.backend.release_context(native);
        }
    }

    async fn handle_frame(&mut self, body: &[u8]) -> Result<()> {
        let (packet_id, request) = Request::decode(body)?;
        match request {
            Request::EstablishContext { scope } => {
                self.establish_context(packet_id, scope).await
            }
            Request::ReleaseContext { context } => self.release_context(packet_id, context).await,
            Request::ListReaders {
                context,
                groups,
                readers_len,
            } => self.list_readers(packet_id, context, groups, readers_len).await,
            Request::Connect {
                context,
                reader,
                share_mode,
                preferred_protocols,
            } => {
                self.connect(packet_id, context, reader, share_mode, preferred_protocols)
                    .await
            }
            Request::Disconnect { card, disposition } => {
                self.route_to_card(
                    packet_id,
                    card,
                    CardRequest::Disconnect { disposition },
                    Response::Disconnect {
                        api_return: SCARD_E_INVALID_HANDLE,
                    },
                )
                .await
            }
            Request::BeginTransaction { card } => {
                self.route_to_card(
                    packet_id,
                    card,
                    CardRequest::BeginTransaction,
                    Response::BeginTransaction {
                        api_return: SCARD_E_INVALID_HANDLE,
                    },
                )
                .await
            }
            Request::EndTransaction { card, disposition } => {
                self.route_to_card(
                    packet_id,
                    card,
                    CardRequest::EndTransaction { disposition },
                    Response::EndTransaction {
                        api_return: SCARD_E_INVALID_HANDLE,
                    },
                )
                .await
            }
            Request::Transmit {
                card,
                send_pci,
                send_buffer,
                recv_pci,
                recv_len,
            } => {
                self.route_to_card(
                    packet_id,
                    card,
                    CardRequest::Transmit {
                        send_pci,
                        send_buffer,
                        recv_pci,
                        recv_len,
                    },
                    Response::Transmit {
                        api_return: SCARD_E_INVALID_HANDLE,
                        recv_buffer: Vec::new(),
                        recv_pci: None,
                        recv_len: 0,
                    },
                )
                .await
            }
            Request::GetAttrib {
                card,
                attr_id,
                attr_len,
            } => {
                self.route_to_card(
                    packet_id,
                    card,
                    CardRequest::GetAttrib { attr_id, attr_len },
                    Response::GetAttrib {
                        api_return: SCARD_E_INVALID_HANDLE,
                        attr_buffer: Vec::new(),
                        attr_len: 0,
                    },
                )
                .await
            }
        }
    }

    async fn establish_context(&mut self, packet_id: u32, scope: u32) -> Result<()> {
        let backend = Arc::clone(&self.shared.backend);
        let (api_return, native) = self
            .blocking(move || backend.establish_context(scope))
            .await?;

        let mut context = 0;
        if native != 0 {
            context = self.context_handles.allocate();
            self.shared.insert_context(context, native);
        }

        self.respond(
            packet_id,
            Response::EstablishContext {
                api_return,
                context,
            },
        )
        .await;
        Ok(())
    }

    async fn release_context(&mut self, packet_id: u32, context: u64) -> Result<()> {
        let Some(native) = self.shared.lookup_context(context) else {
            self.respond(
                packet_id,
                Response::ReleaseContext {
                    api_return: SCARD_E_INVALID_HANDLE,
                },
            )
            .await;
            return Ok(());
        };

        let backend = Arc::clone(&self.shared.backend);
        let api_return = self.blocking(move || backend.release_context(native)).await?;
        if api_return == SCARD_S_SUCCESS {
            self.shared.remove_context(context);
        }

        self.respond(packet_id, Response::ReleaseContext { api_return })
            .await;
        Ok(())
    }

    async fn list_readers(
        &mut self,
        packet_id: u32,
        context: u64,
        groups: Option<String>,
        readers_len: u32,
    ) -> Result<()> {
        if readers_len > READERS_BUFFER_CAP {
            self.respond(
                packet_id,
                Response::ListReaders {
                    api_return: SCARD_E_INSUFFICIENT_BUFFER,
                    readers: Vec::new(),
                    readers_len: 0,
                },
            )
            .await;
            return Ok(());
        }

        let Some(native) = self.shared.lookup_context(context) else {
            self.respond(
                packet_id,
                Response::ListReaders {
                    api_return: SCARD_E_INVALID_HANDLE,
                    readers: Vec::new(),
                    readers_len: 0,
                },
            )
            .await;
            return Ok(());
        };

        let backend = Arc::clone(&self.shared.backend);
        let (api_return, readers, out_len) = self
            .blocking(move || {
                let mut buffer = vec![0u8; readers_len as usize];
                let mut len = readers_len;
                let api_return =
                    backend.list_readers(native, groups.as_deref(), &mut buffer, &mut len);
                if len < readers_len {
                    buffer.truncate(len as usize);
                }
                (api_return, buffer, len)
            })
            .await?;

        self.respond(
            packet_id,
            Response::ListReaders {
                api_return,
                readers,
                readers_len: out_len,
            },
        )
        .await;
        Ok(())
    }

    /// Validate the context inline, then hand the PC/SC connect to a fresh
    /// worker. The card-table entry exists from this moment, before the
    /// worker has heard back from the backend.
    async fn connect(
        &mut self,
        packet_id: u32,
        context: u64,
        reader: String,
        share_mode: u32,
        preferred_protocols: u32,
    ) -> Result<()> {
        if self.shared.lookup_context(context).is_none() {
            self.respond(
                packet_id,
                Response::Connect {
                    api_return: SCARD_E_INVALID_HANDLE,
                    card: 0,
                    active_protocol: 0,
                },
            )
            .await;
            return Ok(());
        }

        let card = self.card_handles.allocate();
        let worker = CardWorker::spawn(
            card,
            Arc::downgrade(&self.shared),
            packet_id,
            CardRequest::Connect {
                context,
                reader,
                share_mode,
                preferred_protocols,
            },
        )?;
        self.cards.insert(card, worker);
        Ok(())
    }

    /// Queue a card-scoped request, or answer `INVALID_HANDLE` inline when
    /// the card is unknown or its worker has stopped.
    async fn route_to_card(
        &mut self,
        packet_id: u32,
        card: u64,
        request: CardRequest,
        invalid: Response,
    ) -> Result<()> {
        match self.cards.get(&card) {
            Some(worker) if worker.is_running() => worker.enqueue(packet_id, request),
            _ => self.respond(packet_id, invalid).await,
        }
        Ok(())
    }

    async fn respond(&self, packet_id: u32, response: Response) {
        self.shared.send(response.encode(packet_id)).await;
    }

    /// Run a blocking PC/SC call off the reactor and await it, so the next
    /// frame is not read until the call completes.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        task::spawn_blocking(f)
            .await
            .map_err(|e| ProxyError::Io(io::Error::other(e)))
    }
}

async fn write_loop(
    write_half: OwnedWriteHalf,
    mut outbound: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
) {
    let mut frames = FramedWrite::new(write_half, FrameCodec);
    while let Some(body) = outbound.recv().await {
        if let Err(error) = frames.send(body).await {
            debug!(%error, "write failed");
            cancel.cancel();
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handles_start_at_one_and_increment() {
        let mut alloc = HandleAllocator::new();
        assert_eq!(alloc.allocate(), 1);
        assert_eq!(alloc.allocate(), 2);
        assert_eq!(alloc.allocate(), 3);
    }

    #[test]
    fn reserved_sentinel_is_skipped() {
        let mut alloc = HandleAllocator { next: 0xFFFF_FFFE };
        assert_eq!(alloc.allocate(), 0xFFFF_FFFE);
        // 0xFFFFFFFF is reserved; the next handle skips straight past it.
        assert_eq!(alloc.allocate(), 0x1_0000_0000);
    }

    #[test]
    fn zero_is_skipped_after_wrap() {
        let mut alloc = HandleAllocator { next: u64::MAX };
        assert_eq!(alloc.allocate(), u64::MAX);
        assert_eq!(alloc.allocate(), 1);
    }

    #[test]
    fn allocator_never_yields_sentinels_near_boundaries() {
        for start in [1u64, 0xFFFF_FFFD, u64::MAX - 2] {
            let mut alloc = HandleAllocator { next: start };
            for _ in 0..8 {
                let handle = alloc.allocate();
                assert_ne!(handle, 0);
                assert_ne!(handle, 0xFFFF_FFFF);
            }
        }
    }
}
