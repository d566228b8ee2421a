//! UDP tracker protocol (BEP 15)
//!
//! Peer discovery: connect, announce, and the retransmission schedule that
//! governs both.

pub mod backoff;
pub mod response;
pub mod session;
pub mod udp;

pub use backoff::RetryPolicy;
pub use response::{parse_compact_peers, AnnounceResponse, TrackerEvent};
pub use session::{AnnounceParams, TrackerPhase, TrackerSession};
pub use udp::{AnnounceStats, TrackerClient, TrackerConfig};
