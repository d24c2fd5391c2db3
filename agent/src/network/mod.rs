// Network module for coordinator <-> worker traffic
//
// This module provides the framed wire protocol, the transport trait the
// dispatcher talks to, and its two implementations: a loopback transport
// for single-process clusters and a pooled TCP transport with the matching
// worker-side server.

mod frame;
mod in_process;
mod messages;
mod server;
mod tcp;
mod transport;

pub use frame::{read_frame, write_frame, Frame, MessageType, DEFAULT_MAX_FRAME_BYTES};
pub use in_process::{InProcessTransport, NodeBehavior};
pub use messages::{
    DispatchEntry, DispatchRequest, HealthAck, HealthProbe, Message, PartialResult,
    PartialResultBatch, ResultStatus,
};
pub use server::WorkerServer;
pub use tcp::{NetworkConfig, NetworkTransport};
pub use transport::{ClusterTransport, TransportSnapshot, TransportStats};
