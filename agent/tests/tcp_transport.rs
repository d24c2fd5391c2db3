//! Integration tests for the TCP transport and worker server
//!
//! Workers listen on ephemeral loopback ports inside the test process.

use moe_agent::network::{
    read_frame, DispatchEntry, DispatchRequest, Frame, HealthProbe, Message, ResultStatus,
    TransportStats, DEFAULT_MAX_FRAME_BYTES,
};
use moe_agent::{
    AffineExpertKernel, CancelToken, ClusterTransport, DispatchConfig, DispatchCoordinator,
    DriverSettings, ExpertComputeKernel, ExpertId, ExpertRegistry, ExpertWorker, ForwardDriver,
    LinearGate, MoeError, MoeStats, NetworkConfig, NetworkTransport, NodeId, OutputStatus, Router,
    Token, WorkerServer,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

const HIDDEN: usize = 3;

struct RunningWorker {
    addr: String,
    stats: Arc<TransportStats>,
}

async fn start_worker(id: &str, experts: Vec<ExpertId>, shutdown: &CancelToken) -> RunningWorker {
    let kernel: Arc<dyn ExpertComputeKernel> = Arc::new(AffineExpertKernel::new(HIDDEN));
    let worker = ExpertWorker::new(NodeId::new(id), experts, kernel);
    let server = WorkerServer::new(worker, 4, DEFAULT_MAX_FRAME_BYTES);
    let stats = server.stats().clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let stop = shutdown.clone();
    tokio::spawn(async move { server.serve(listener, stop).await });

    RunningWorker { addr, stats }
}

fn fast_config() -> NetworkConfig {
    NetworkConfig {
        pool_size: 2,
        connect_timeout: Duration::from_millis(500),
        reconnect_base: Duration::from_millis(5),
        reconnect_max: Duration::from_millis(20),
        reconnect_attempts: 3,
        max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
    }
}

fn request(sequence: u64, pairs: &[(u64, ExpertId)]) -> DispatchRequest {
    DispatchRequest {
        sequence,
        layer: 0,
        timeout_ms: 1000,
        entries: pairs
            .iter()
            .map(|&(token_id, expert_id)| DispatchEntry {
                token_id,
                expert_id,
                hidden_state: vec![1.0f32, 2.0, -1.0].into(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_dispatch_and_probe_round_trip() {
    let shutdown = CancelToken::new();
    let worker = start_worker("w0", vec![0, 2], &shutdown).await;
    let node = NodeId::new("w0");
    let transport = NetworkTransport::new(
        HashMap::from([(node.clone(), worker.addr.clone())]),
        fast_config(),
    );

    let batch = transport
        .send(&node, request(1, &[(7, 0), (7, 2), (8, 2)]))
        .await
        .unwrap();
    assert_eq!(batch.status, ResultStatus::Ok);
    assert_eq!(batch.sequence, 1);
    let outputs: Vec<(u64, ExpertId, Vec<f32>)> = batch
        .results
        .into_iter()
        .map(|r| (r.token_id, r.expert_id, r.output))
        .collect();
    assert_eq!(
        outputs,
        vec![
            (7, 0, vec![1.0, 2.0, -1.0]),
            (7, 2, vec![3.0, 6.0, -3.0]),
            (8, 2, vec![3.0, 6.0, -3.0]),
        ]
    );

    let ack = transport.probe(&node).await.unwrap();
    assert_eq!(ack.hosted_experts, 2);

    let snap = transport.stats().snapshot();
    assert_eq!(snap.frames_sent, 2);
    assert_eq!(snap.frames_received, 2);
    assert_eq!(snap.corrupt_frames, 0);
    shutdown.cancel();
}

#[tokio::test]
async fn test_concurrent_requests_are_matched_by_sequence() {
    let shutdown = CancelToken::new();
    let worker = start_worker("w0", vec![0, 1, 2, 3], &shutdown).await;
    let node = NodeId::new("w0");
    let transport = Arc::new(NetworkTransport::new(
        HashMap::from([(node.clone(), worker.addr.clone())]),
        fast_config(),
    ));

    let calls = (1..=16u64).map(|seq| {
        let transport = transport.clone();
        let node = node.clone();
        async move {
            let expert = (seq % 4) as ExpertId;
            let batch = transport.send(&node, request(seq, &[(seq, expert)])).await?;
            Ok::<_, MoeError>((seq, expert, batch))
        }
    });
    for outcome in futures::future::join_all(calls).await {
        let (seq, expert, batch) = outcome.unwrap();
        assert_eq!(batch.sequence, seq);
        assert_eq!(batch.results[0].token_id, seq);
        assert_eq!(batch.results[0].expert_id, expert);
    }
    shutdown.cancel();
}

#[tokio::test]
async fn test_unhosted_expert_reports_kernel_error() {
    let shutdown = CancelToken::new();
    let worker = start_worker("w0", vec![0], &shutdown).await;
    let node = NodeId::new("w0");
    let transport = NetworkTransport::new(
        HashMap::from([(node.clone(), worker.addr.clone())]),
        fast_config(),
    );

    let batch = transport.send(&node, request(1, &[(1, 5)])).await.unwrap();
    assert_eq!(batch.status, ResultStatus::KernelError);
    assert!(batch.results.is_empty());
    shutdown.cancel();
}

#[tokio::test]
async fn test_server_drops_corrupt_frame_and_stays_aligned() {
    let shutdown = CancelToken::new();
    let worker = start_worker("w0", vec![0], &shutdown).await;

    let mut stream = TcpStream::connect(&worker.addr).await.unwrap();
    let mut corrupt = Message::Probe(HealthProbe { nonce: 1 }).to_frame().encode();
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0xFF;
    stream.write_all(&corrupt).await.unwrap();

    let valid = Message::Probe(HealthProbe { nonce: 2 }).to_frame().encode();
    stream.write_all(&valid).await.unwrap();

    let reply: Frame = tokio::time::timeout(
        Duration::from_secs(2),
        read_frame(&mut stream, DEFAULT_MAX_FRAME_BYTES),
    )
    .await
    .unwrap()
    .unwrap();
    match Message::from_frame(&reply).unwrap() {
        Message::Ack(ack) => assert_eq!(ack.nonce, 2),
        other => panic!("expected ack, got {other:?}"),
    }

    let snap = worker.stats.snapshot();
    assert_eq!(snap.corrupt_frames, 1);
    assert_eq!(snap.frames_received, 1);
    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_worker_fails_after_backoff() {
    // Reserve a port, then free it so nothing listens there
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let node = NodeId::new("gone");
    let transport = NetworkTransport::new(HashMap::from([(node.clone(), addr)]), fast_config());

    let err = transport.send(&node, request(1, &[(1, 0)])).await.unwrap_err();
    assert!(matches!(err, MoeError::TransportFailure { .. }));
    assert!(transport.probe(&node).await.is_err());
    assert!(transport.stats().snapshot().send_failures >= 2);

    let unknown = transport
        .send(&NodeId::new("nowhere"), request(1, &[(1, 0)]))
        .await;
    assert!(matches!(unknown, Err(MoeError::TransportFailure { .. })));
}

#[tokio::test]
async fn test_forward_layer_over_tcp() {
    let shutdown = CancelToken::new();
    let a = start_worker("a", vec![0, 1], &shutdown).await;
    let b = start_worker("b", vec![2, 3], &shutdown).await;

    let placements: BTreeMap<ExpertId, Vec<NodeId>> = [
        (0, vec![NodeId::new("a")]),
        (1, vec![NodeId::new("a")]),
        (2, vec![NodeId::new("b")]),
        (3, vec![NodeId::new("b")]),
    ]
    .into_iter()
    .collect();
    let registry = Arc::new(ExpertRegistry::new(placements).unwrap());
    let transport = Arc::new(NetworkTransport::new(
        HashMap::from([(NodeId::new("a"), a.addr), (NodeId::new("b"), b.addr)]),
        fast_config(),
    ));
    let stats = Arc::new(MoeStats::new());
    let coordinator = Arc::new(DispatchCoordinator::new(
        registry,
        transport,
        Arc::new(AffineExpertKernel::new(HIDDEN)),
        DispatchConfig::default(),
        stats.clone(),
    ));

    let gate = Arc::new(LinearGate::seeded(HIDDEN, 4, 11));
    let router = Router::new(gate.clone(), HIDDEN).unwrap();
    let mut driver = ForwardDriver::new(
        vec![Router::new(gate, HIDDEN).unwrap()],
        coordinator,
        DriverSettings {
            hidden_size: HIDDEN,
            expert_count: 4,
            top_k: 2,
            accept_partial: false,
        },
    )
    .unwrap();

    let tokens: Vec<Token> = (1..=4u64)
        .map(|id| Token::new(id, vec![id as f32, 1.0, -(id as f32)]))
        .collect();
    let decisions = router.route_batch(&tokens, 2, 4).unwrap();
    let combined = driver
        .forward_layer(0, &tokens, &CancelToken::new())
        .await
        .unwrap();

    assert_eq!(combined.status, OutputStatus::Complete);
    for (token, decision) in tokens.iter().zip(&decisions) {
        let factor: f32 = decision
            .selections
            .iter()
            .map(|s| s.gate_weight * AffineExpertKernel::scale(s.expert_id))
            .sum();
        let row = combined.output_for(token.id).unwrap();
        for (actual, x) in row.iter().zip(token.hidden_state.iter()) {
            assert!((actual - x * factor).abs() < 1e-4);
        }
    }
    assert_eq!(stats.snapshot().request_failures, 0);
    shutdown.cancel();
}
