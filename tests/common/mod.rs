//! Shared test fixtures: a scripted PC/SC backend and a minimal protocol
//! client speaking the framed wire format over a real socket.

#![allow(dead_code)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use scard_proxy::core::codec::FrameCodec;
use scard_proxy::pcsc::{IoRequest, ScardBackend, SendPci, SCARD_S_SUCCESS};
use scard_proxy::proto::{Request, Response};
use scard_proxy::{ProxyConfig, Server};

/// Status a blocked transmit reports after the card is yanked out from
/// under it (`SCARD_W_RESET_CARD`).
pub const RESET_CARD: u32 = 0x8010_0068;

/// One backend call as the mock observed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    EstablishContext { scope: u32 },
    ReleaseContext { context: u64 },
    ListReaders { context: u64, capacity: u32 },
    Connect { context: u64, reader: String },
    Disconnect { card: u64, disposition: u32 },
    BeginTransaction { card: u64 },
    EndTransaction { card: u64, disposition: u32 },
    Transmit { card: u64, send: Vec<u8> },
    GetAttrib { card: u64, attr_id: u32 },
}

/// Scripted stand-in for the host PC/SC service.
///
/// Every call is recorded. Native handles count up from a recognizable
/// base so virtual and native values can never be confused in assertions.
/// `block_transmits()` parks the next transmit on a condvar until a
/// disconnect arrives, which is the shape of a worker stuck talking to a
/// card.
pub struct MockBackend {
    calls: Mutex<Vec<Call>>,
    next_native: AtomicU64,
    pub readers: Vec<u8>,
    pub transmit_reply: Vec<u8>,
    pub attr_value: Vec<u8>,
    pub connect_status: AtomicU32,
    pub transmit_status: AtomicU32,
    transmit_blocked: Mutex<bool>,
    unblock: Condvar,
    in_flight: Mutex<HashMap<u64, usize>>,
    pub max_in_flight_per_card: AtomicUsize,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            next_native: AtomicU64::new(0x0100_0000),
            readers: b"Mock Reader 0\0\0".to_vec(),
            transmit_reply: vec![0x90, 0x00],
            attr_value: b"MOCK".to_vec(),
            connect_status: AtomicU32::new(SCARD_S_SUCCESS),
            transmit_status: AtomicU32::new(SCARD_S_SUCCESS),
            transmit_blocked: Mutex::new(false),
            unblock: Condvar::new(),
            in_flight: Mutex::new(HashMap::new()),
            max_in_flight_per_card: AtomicUsize::new(0),
        }
    }

    /// Park subsequent transmits until a disconnect arrives or
    /// [`release_transmits`](Self::release_transmits) is called.
    pub fn block_transmits(&self) {
        *self.transmit_blocked.lock().unwrap() = true;
    }

    /// Let a parked transmit finish, as if the card finally answered.
    pub fn release_transmits(&self) {
        *self.transmit_blocked.lock().unwrap() = false;
        self.unblock.notify_all();
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matcher: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matcher(c)).count()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn alloc_native(&self) -> u64 {
        self.next_native.fetch_add(1, Ordering::SeqCst)
    }

    fn enter_card(&self, card: u64) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let count = in_flight.entry(card).or_insert(0);
        *count += 1;
        let current = *count;
        drop(in_flight);
        self.max_in_flight_per_card
            .fetch_max(current, Ordering::SeqCst);
    }

    fn exit_card(&self, card: u64) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(count) = in_flight.get_mut(&card) {
            *count -= 1;
        }
    }
}

impl ScardBackend for MockBackend {
    fn establish_context(&self, scope: u32) -> (u32, u64) {
        self.record(Call::EstablishContext { scope });
        (SCARD_S_SUCCESS, self.alloc_native())
    }

    fn release_context(&self, context: u64) -> u32 {
        self.record(Call::ReleaseContext { context });
        SCARD_S_SUCCESS
    }

    fn list_readers(
        &self,
        context: u64,
        _groups: Option<&str>,
        readers: &mut [u8],
        readers_len: &mut u32,
    ) -> u32 {
        self.record(Call::ListReaders {
            context,
            capacity: *readers_len,
        });
        let n = self.readers.len().min(readers.len());
        readers[..n].copy_from_slice(&self.readers[..n]);
        *readers_len = self.readers.len() as u32;
        SCARD_S_SUCCESS
    }

    fn connect(
        &self,
        context: u64,
        reader: &str,
        _share_mode: u32,
        _preferred_protocols: u32,
    ) -> (u32, u64, u32) {
        self.record(Call::Connect {
            context,
            reader: reader.to_string(),
        });
        let status = self.connect_status.load(Ordering::SeqCst);
        if status == SCARD_S_SUCCESS {
            (status, self.alloc_native(), 2)
        } else {
            (status, 0, 0)
        }
    }

    fn disconnect(&self, card: u64, disposition: u32) -> u32 {
        self.record(Call::Disconnect { card, disposition });
        // A disconnect is the one thing that unblocks a stuck transmit.
        let mut blocked = self.transmit_blocked.lock().unwrap();
        *blocked = false;
        self.unblock.notify_all();
        SCARD_S_SUCCESS
    }

    fn begin_transaction(&self, card: u64) -> u32 {
        self.record(Call::BeginTransaction { card });
        self.enter_card(card);
        self.exit_card(card);
        SCARD_S_SUCCESS
    }

    fn end_transaction(&self, card: u64, disposition: u32) -> u32 {
        self.record(Call::EndTransaction { card, disposition });
        SCARD_S_SUCCESS
    }

    fn transmit(
        &self,
        card: u64,
        _send_pci: SendPci,
        send_buffer: &[u8],
        recv_pci: Option<&mut IoRequest>,
        recv_buffer: &mut [u8],
        recv_len: &mut u32,
    ) -> u32 {
        self.record(Call::Transmit {
            card,
            send: send_buffer.to_vec(),
        });
        self.enter_card(card);

        let mut blocked = self.transmit_blocked.lock().unwrap();
        let was_blocked = *blocked;
        while *blocked {
            blocked = self.unblock.wait(blocked).unwrap();
        }
        drop(blocked);

        self.exit_card(card);
        if was_blocked {
            *recv_len = 0;
            return RESET_CARD;
        }

        let status = self.transmit_status.load(Ordering::SeqCst);
        if let Some(pci) = recv_pci {
            // Prove in-place PCI updates reach the client.
            pci.protocol = 2;
        }
        let n = self.transmit_reply.len().min(recv_buffer.len());
        recv_buffer[..n].copy_from_slice(&self.transmit_reply[..n]);
        *recv_len = n as u32;
        status
    }

    fn get_attrib(
        &self,
        card: u64,
        attr_id: u32,
        attr_buffer: &mut [u8],
        attr_len: &mut u32,
    ) -> u32 {
        self.record(Call::GetAttrib { card, attr_id });
        self.enter_card(card);
        self.exit_card(card);
        let n = self.attr_value.len().min(attr_buffer.len());
        attr_buffer[..n].copy_from_slice(&self.attr_value[..n]);
        *attr_len = n as u32;
        SCARD_S_SUCCESS
    }
}

/// Bind a server on a loopback port with the given backend; returns the
/// bound address and the shutdown handle (keep it alive for the test's
/// duration).
pub async fn start_server(backend: Arc<MockBackend>) -> (SocketAddr, mpsc::Sender<()>) {
    let config = ProxyConfig {
        listen: "127.0.0.1:0".to_string(),
        allowed_ips: vec!["127.0.0.1/32".to_string()],
    };
    start_server_with_config(backend, config).await
}

pub async fn start_server_with_config(
    backend: Arc<MockBackend>,
    config: ProxyConfig,
) -> (SocketAddr, mpsc::Sender<()>) {
    let server = Server::bind(&config, backend).await.unwrap();
    let addr = server.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(server.run_with_shutdown(shutdown_rx));
    (addr, shutdown_tx)
}

/// Minimal client over the framed wire format.
pub struct TestClient {
    frames: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            frames: Framed::new(stream, FrameCodec),
        }
    }

    pub async fn send(&mut self, packet_id: u32, request: &Request) {
        self.frames.send(request.encode(packet_id)).await.unwrap();
    }

    /// Next decoded response, or `None` once the server has closed the
    /// connection.
    pub async fn next_response(&mut self) -> Option<(u32, Response)> {
        match self.frames.next().await? {
            Ok(body) => Some(Response::decode(&body).unwrap()),
            Err(_) => None,
        }
    }

    pub async fn roundtrip(&mut self, packet_id: u32, request: &Request) -> Response {
        self.send(packet_id, request).await;
        let (echoed, response) = self.next_response().await.expect("connection closed");
        assert_eq!(echoed, packet_id, "response must echo the packet id");
        response
    }

    /// Push raw bytes down the socket, bypassing the encoder.
    pub async fn send_raw(&mut self, bytes: &[u8]) {
        use tokio::io::AsyncWriteExt;
        self.frames.get_mut().write_all(bytes).await.unwrap();
        self.frames.get_mut().flush().await.unwrap();
    }

    /// True once the server has closed the connection.
    pub async fn server_closed(&mut self) -> bool {
        matches!(self.frames.next().await, None | Some(Err(_)))
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_for(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

/// Convenience: a frame body for an opcode the server does not know.
pub fn unknown_opcode_frame(packet_id: u32) -> Bytes {
    use bytes::BufMut;
    let mut body = bytes::BytesMut::new();
    body.put_u32(packet_id);
    body.put_u32(999);
    body.freeze()
}
