//! TCP transport to remote worker nodes.
//!
//! Each node gets a small pool of persistent connections used round-robin.
//! Every connection runs a writer task fed by a channel and a reader task that
//! demultiplexes incoming frames to waiting callers by sequence number (for
//! results) or nonce (for health acks). A connection that fails is marked
//! closed and replaced on next use, retrying the connect with exponential
//! backoff.

use crate::errors::{MoeError, Result};
use crate::registry::NodeId;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::frame::{read_frame, write_frame, Frame, DEFAULT_MAX_FRAME_BYTES};
use super::messages::{DispatchRequest, HealthAck, HealthProbe, Message, PartialResultBatch};
use super::transport::{ClusterTransport, TransportStats};

/// Outbound frames buffered per connection before `send` waits
const WRITE_QUEUE_DEPTH: usize = 256;

/// Connection and retry settings for [`NetworkTransport`]
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Persistent connections per node
    pub pool_size: usize,
    pub connect_timeout: Duration,
    /// First reconnect delay; doubles on each failed attempt
    pub reconnect_base: Duration,
    pub reconnect_max: Duration,
    pub reconnect_attempts: u32,
    pub max_frame_bytes: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pool_size: 2,
            connect_timeout: Duration::from_secs(2),
            reconnect_base: Duration::from_millis(50),
            reconnect_max: Duration::from_secs(2),
            reconnect_attempts: 5,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

/// Callers waiting for a response on one connection
#[derive(Default)]
struct Waiters {
    results: HashMap<u64, oneshot::Sender<PartialResultBatch>>,
    acks: HashMap<u64, oneshot::Sender<HealthAck>>,
}

type SharedWaiters = Arc<Mutex<Waiters>>;

/// One live TCP connection to a worker
struct Connection {
    outbound: mpsc::Sender<Frame>,
    waiters: SharedWaiters,
    closed: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl Connection {
    fn spawn(node: NodeId, stream: TcpStream, max_frame_bytes: usize, stats: Arc<TransportStats>) -> Self {
        let _ = stream.set_nodelay(true);
        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::channel(WRITE_QUEUE_DEPTH);
        let waiters: SharedWaiters = Arc::new(Mutex::new(Waiters::default()));
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn(write_loop(
            node.clone(),
            write_half,
            rx,
            max_frame_bytes,
            closed.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            node,
            read_half,
            waiters.clone(),
            max_frame_bytes,
            closed.clone(),
            stats,
        ));

        Self {
            outbound,
            waiters,
            closed,
            reader,
            writer,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Removes a waiter when the caller gives up (timeout or cancellation)
struct WaiterGuard {
    waiters: SharedWaiters,
    key: u64,
    is_ack: bool,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        if let Ok(mut w) = self.waiters.lock() {
            if self.is_ack {
                w.acks.remove(&self.key);
            } else {
                w.results.remove(&self.key);
            }
        }
    }
}

#[derive(Default)]
struct NodePool {
    slots: Vec<Option<Arc<Connection>>>,
    next: usize,
}

/// [`ClusterTransport`] over TCP using the framed wire protocol.
pub struct NetworkTransport {
    addresses: HashMap<NodeId, String>,
    config: NetworkConfig,
    pools: Mutex<HashMap<NodeId, Arc<tokio::sync::Mutex<NodePool>>>>,
    next_nonce: AtomicU64,
    stats: Arc<TransportStats>,
}

impl NetworkTransport {
    pub fn new(addresses: HashMap<NodeId, String>, config: NetworkConfig) -> Self {
        Self {
            addresses,
            config,
            pools: Mutex::new(HashMap::new()),
            next_nonce: AtomicU64::new(1),
            stats: Arc::new(TransportStats::new()),
        }
    }

    fn pool(&self, node: &NodeId) -> Result<Arc<tokio::sync::Mutex<NodePool>>> {
        let mut pools = self
            .pools
            .lock()
            .map_err(|_| MoeError::transport(node, "connection pool poisoned"))?;
        Ok(pools.entry(node.clone()).or_default().clone())
    }

    /// Next pooled connection for `node`, connecting or reconnecting as needed.
    async fn connection(&self, node: &NodeId) -> Result<Arc<Connection>> {
        let addr = self
            .addresses
            .get(node)
            .ok_or_else(|| MoeError::transport(node, "no address configured"))?;

        let pool = self.pool(node)?;
        let mut pool = pool.lock().await;
        let size = self.config.pool_size.max(1);
        if pool.slots.len() != size {
            pool.slots.resize_with(size, || None);
        }
        let slot = pool.next % size;
        pool.next = pool.next.wrapping_add(1);

        if let Some(conn) = &pool.slots[slot] {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            self.stats.record_reconnect();
            debug!(node = %node, slot, "Replacing closed connection");
        }

        let stream = self.connect_with_backoff(node, addr).await?;
        let conn = Arc::new(Connection::spawn(
            node.clone(),
            stream,
            self.config.max_frame_bytes,
            self.stats.clone(),
        ));
        pool.slots[slot] = Some(conn.clone());
        Ok(conn)
    }

    #[instrument(skip(self), fields(node = %node))]
    async fn connect_with_backoff(&self, node: &NodeId, addr: &str) -> Result<TcpStream> {
        let attempts = self.config.reconnect_attempts.max(1);
        let mut delay = self.config.reconnect_base;
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    info!(addr, attempt, "Connected to worker");
                    return Ok(stream);
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = "connect timed out".to_string(),
            }

            if attempt < attempts {
                debug!(addr, attempt, delay_ms = delay.as_millis() as u64, error = %last_error, "Connect failed, backing off");
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(self.config.reconnect_max);
            }
        }

        self.stats.record_send_failure();
        Err(MoeError::transport(
            node,
            format!("connect to {addr} failed after {attempts} attempts: {last_error}"),
        ))
    }

    async fn enqueue(&self, node: &NodeId, conn: &Connection, frame: Frame) -> Result<()> {
        if frame.encoded_len() - 4 > self.config.max_frame_bytes {
            return Err(MoeError::transport(
                node,
                format!("frame of {} bytes exceeds limit", frame.encoded_len()),
            ));
        }
        conn.outbound.send(frame).await.map_err(|_| {
            self.stats.record_send_failure();
            MoeError::transport(node, "connection closed")
        })?;
        self.stats.record_sent();
        Ok(())
    }
}

impl std::fmt::Debug for NetworkTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkTransport")
            .field("nodes", &self.addresses.len())
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl ClusterTransport for NetworkTransport {
    async fn send(&self, node: &NodeId, request: DispatchRequest) -> Result<PartialResultBatch> {
        let conn = self.connection(node).await?;
        let sequence = request.sequence;

        let (tx, rx) = oneshot::channel();
        {
            let mut w = conn
                .waiters
                .lock()
                .map_err(|_| MoeError::transport(node, "waiter table poisoned"))?;
            w.results.insert(sequence, tx);
        }
        let _guard = WaiterGuard {
            waiters: conn.waiters.clone(),
            key: sequence,
            is_ack: false,
        };

        self.enqueue(node, &conn, Message::Dispatch(request).to_frame())
            .await?;
        rx.await
            .map_err(|_| MoeError::transport(node, "connection closed before response"))
    }

    async fn probe(&self, node: &NodeId) -> Result<HealthAck> {
        let conn = self.connection(node).await?;
        let nonce = self.next_nonce.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        {
            let mut w = conn
                .waiters
                .lock()
                .map_err(|_| MoeError::transport(node, "waiter table poisoned"))?;
            w.acks.insert(nonce, tx);
        }
        let _guard = WaiterGuard {
            waiters: conn.waiters.clone(),
            key: nonce,
            is_ack: true,
        };

        self.enqueue(node, &conn, Message::Probe(HealthProbe { nonce }).to_frame())
            .await?;
        rx.await
            .map_err(|_| MoeError::transport(node, "connection closed before health ack"))
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

async fn write_loop(
    node: NodeId,
    mut io: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    max_frame_bytes: usize,
    closed: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut io, &frame, max_frame_bytes).await {
            warn!(node = %node, error = %e, "Write failed, closing connection");
            break;
        }
    }
    closed.store(true, Ordering::Release);
}

async fn read_loop(
    node: NodeId,
    mut io: OwnedReadHalf,
    waiters: SharedWaiters,
    max_frame_bytes: usize,
    closed: Arc<AtomicBool>,
    stats: Arc<TransportStats>,
) {
    loop {
        let frame = match read_frame(&mut io, max_frame_bytes).await {
            Ok(frame) => frame,
            Err(MoeError::CorruptFrame(reason)) => {
                stats.record_corrupt();
                warn!(node = %node, %reason, "Dropped corrupt frame");
                continue;
            }
            Err(e) => {
                debug!(node = %node, error = %e, "Connection closed");
                break;
            }
        };

        let message = match Message::from_frame(&frame) {
            Ok(m) => m,
            Err(e) => {
                stats.record_corrupt();
                warn!(node = %node, error = %e, "Dropped undecodable frame");
                continue;
            }
        };
        stats.record_received();

        let Ok(mut w) = waiters.lock() else { break };
        match message {
            Message::Results(batch) => match w.results.remove(&batch.sequence) {
                Some(tx) => {
                    let _ = tx.send(batch);
                }
                None => {
                    stats.record_unmatched();
                    debug!(node = %node, sequence = batch.sequence, "Discarded unmatched result");
                }
            },
            Message::Ack(ack) => match w.acks.remove(&ack.nonce) {
                Some(tx) => {
                    let _ = tx.send(ack);
                }
                None => stats.record_unmatched(),
            },
            other => {
                warn!(node = %node, kind = ?other.kind(), "Unexpected message from worker");
            }
        }
    }

    closed.store(true, Ordering::Release);
    // Wake every caller still waiting on this connection
    if let Ok(mut w) = waiters.lock() {
        w.results.clear();
        w.acks.clear();
    }
}
