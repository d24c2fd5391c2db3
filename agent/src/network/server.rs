//! TCP front end of a worker node.
//!
//! Accepts coordinator connections, answers health probes inline and runs
//! dispatch requests on the blocking pool through the node's
//! [`ExpertWorker`]. A semaphore bounds how many requests compute at once;
//! requests that waited past their deadline for a permit are answered with
//! `DeadlineExceeded` without touching the kernel.

use crate::cancel::CancelToken;
use crate::errors::{MoeError, Result};
use crate::executor::ExpertWorker;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tracing::{debug, error, info, instrument, warn};

use super::frame::{read_frame, write_frame, Frame};
use super::messages::{HealthAck, Message, PartialResultBatch, ResultStatus};
use super::transport::TransportStats;

/// Serves one [`ExpertWorker`] over TCP
pub struct WorkerServer {
    worker: ExpertWorker,
    permits: Arc<Semaphore>,
    max_frame_bytes: usize,
    stats: Arc<TransportStats>,
}

impl WorkerServer {
    pub fn new(worker: ExpertWorker, max_concurrent_requests: usize, max_frame_bytes: usize) -> Self {
        Self {
            worker,
            permits: Arc::new(Semaphore::new(max_concurrent_requests.max(1))),
            max_frame_bytes,
            stats: Arc::new(TransportStats::new()),
        }
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    /// Bind `addr` and serve until `shutdown` fires.
    pub async fn run(self, addr: &str, shutdown: CancelToken) -> Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve connections from an already bound listener.
    #[instrument(skip_all, fields(node = %self.worker.node_id()))]
    pub async fn serve(self, listener: TcpListener, shutdown: CancelToken) -> Result<()> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            experts = ?self.worker.hosted_experts().collect::<Vec<_>>(),
            "Worker listening"
        );

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "Accepted coordinator connection");
                            tokio::spawn(handle_connection(
                                stream,
                                peer,
                                self.worker.clone(),
                                self.permits.clone(),
                                self.max_frame_bytes,
                                self.stats.clone(),
                                shutdown.clone(),
                            ));
                        }
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Worker shutting down");
                    return Ok(());
                }
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    worker: ExpertWorker,
    permits: Arc<Semaphore>,
    max_frame_bytes: usize,
    stats: Arc<TransportStats>,
    shutdown: CancelToken,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Frame>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut write_half, &frame, max_frame_bytes).await {
                warn!(%peer, error = %e, "Write to coordinator failed");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            read = read_frame(&mut read_half, max_frame_bytes) => read,
            _ = shutdown.cancelled() => break,
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(MoeError::CorruptFrame(reason)) => {
                stats.record_corrupt();
                warn!(%peer, %reason, "Dropped corrupt frame");
                continue;
            }
            Err(e) => {
                debug!(%peer, error = %e, "Coordinator connection closed");
                break;
            }
        };
        stats.record_received();

        match Message::from_frame(&frame) {
            Ok(Message::Dispatch(mut request)) => {
                let worker = worker.clone();
                let permits = permits.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let arrived = Instant::now();
                    let Ok(_permit) = permits.acquire_owned().await else {
                        return;
                    };

                    let waited_ms = arrived.elapsed().as_millis() as u64;
                    let batch = if request.timeout_ms > 0 && waited_ms >= request.timeout_ms as u64 {
                        PartialResultBatch::failed(
                            request.sequence,
                            request.layer,
                            ResultStatus::DeadlineExceeded,
                            format!("queued for {waited_ms}ms"),
                        )
                    } else {
                        if request.timeout_ms > 0 {
                            request.timeout_ms -= waited_ms as u32;
                        }
                        let (sequence, layer) = (request.sequence, request.layer);
                        match tokio::task::spawn_blocking(move || worker.handle(&request)).await {
                            Ok(batch) => batch,
                            Err(e) => PartialResultBatch::failed(
                                sequence,
                                layer,
                                ResultStatus::KernelError,
                                format!("worker task failed: {e}"),
                            ),
                        }
                    };
                    let _ = tx.send(Message::Results(batch).to_frame()).await;
                });
            }
            Ok(Message::Probe(probe)) => {
                let ack = HealthAck {
                    nonce: probe.nonce,
                    inflight: worker.stats().active_requests() as u32,
                    hosted_experts: worker.hosted_experts().count() as u32,
                };
                if tx.send(Message::Ack(ack).to_frame()).await.is_err() {
                    break;
                }
            }
            Ok(other) => {
                warn!(%peer, kind = ?other.kind(), "Unexpected message from coordinator");
            }
            Err(e) => {
                stats.record_corrupt();
                warn!(%peer, error = %e, "Dropped undecodable frame");
            }
        }
    }

    drop(tx);
    let _ = writer.await;
}
