//! Caller-facing error types for the cluster coordination plane.
//!
//! Internal, non-recoverable plumbing continues to propagate via
//! `anyhow::Result` (see `cluster::traits`). Operations a caller needs to
//! pattern-match on -- lock acquisition, replication, pub/sub -- return
//! `Result<T, ClusterError>` instead.

use thiserror::Error;

/// Errors surfaced across the cluster coordination plane's caller-facing APIs.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ClusterError {
    /// `send`/`broadcast` attempted while the peer link was not OPEN.
    #[error("peer {node_id} is unreachable")]
    PeerUnreachable {
        /// The node the send was addressed to.
        node_id: String,
    },

    /// A STRONG/QUORUM replicate did not reach its consistency predicate before its deadline.
    #[error("replication of {op_id} timed out: {acked}/{targets} backups acked")]
    ReplicationTimeout {
        /// The operation identifier that timed out.
        op_id: String,
        /// Node IDs the operation was sent to.
        targets: Vec<String>,
        /// Node IDs that acknowledged before the deadline.
        acked: Vec<String>,
    },

    /// A migration chunk's checksum did not match what the sender declared.
    #[error("migration checksum mismatch for partition {partition_id}")]
    MigrationChecksumMismatch {
        /// The partition whose chunk failed verification.
        partition_id: u32,
    },

    /// Final record-count/checksum verification failed after reassembly.
    #[error("migration verify failed for partition {partition_id}")]
    MigrationVerifyFailed {
        /// The partition whose post-reassembly verification failed.
        partition_id: u32,
    },

    /// `release` was called by a client that does not currently own the lock.
    #[error("client {client_id} does not own lock {name}")]
    LockNotOwner {
        /// The lock name.
        name: String,
        /// The client that attempted the release.
        client_id: String,
    },

    /// `release` was called with a fencing token that does not match the current grant.
    #[error("fencing token mismatch for lock {name}: expected {expected}, got {actual}")]
    LockTokenMismatch {
        /// The lock name.
        name: String,
        /// The fencing token currently held by the lock.
        expected: u64,
        /// The fencing token the caller supplied.
        actual: u64,
    },

    /// A topic name failed `TopicBus::validate_topic`.
    #[error("invalid topic name: {name}")]
    InvalidTopicName {
        /// The rejected topic name.
        name: String,
    },

    /// A client attempted to exceed its per-client subscription cap.
    #[error("client {client_id} has reached the subscription limit of {limit}")]
    SubscriptionLimitReached {
        /// The client that was rejected.
        client_id: String,
        /// The configured per-client cap.
        limit: usize,
    },

    /// A bounded queue dropped its oldest entry to admit a new one.
    #[error("replication queue for {node_id} overflowed, oldest task dropped")]
    QueueOverflow {
        /// The backup node whose queue overflowed.
        node_id: String,
    },

    /// The owning component was shut down while the operation was outstanding.
    #[error("{component} was shut down")]
    Shutdown {
        /// Name of the component that shut down (e.g. `"ReplicationPipeline"`).
        component: String,
    },

    /// A required configuration value was missing or invalid at startup.
    #[error("configuration error: {message}")]
    ConfigError {
        /// Human-readable description of the misconfiguration.
        message: String,
    },
}
