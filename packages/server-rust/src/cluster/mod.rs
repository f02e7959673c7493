//! Cluster protocol module.
//!
//! Provides domain types, service traits, wire messages, shared state,
//! failure detection, and partition assignment algorithms for the
//! inter-node cluster protocol.

pub mod assignment;
pub mod errors;
pub mod failover;
pub mod failure_detector;
pub mod lock;
pub mod messages;
pub mod migration;
pub mod repair;
pub mod replication;
pub mod service;
pub mod state;
pub mod topic;
pub mod traits;
pub mod transport;
pub mod types;

// ---------------------------------------------------------------------------
// Re-exports — flat public API
// ---------------------------------------------------------------------------

// types
pub use types::{
    ActiveMigration, ClusterConfig, ClusterHealth, MemberInfo, MembersView, MigrationPhase,
    MigrationTask, NodeState, PartitionAssignment, PartitionMeta, PartitionState,
};

// traits
pub use traits::{
    ClusterPartitionService, ClusterService, FailureDetector, MembershipService, MigrationService,
};

// messages
pub use messages::{
    ClusterClientDisconnectedPayload, ClusterLockGrantedPayload, ClusterLockReleasePayload,
    ClusterLockReleasedPayload, ClusterLockReqPayload, ClusterMerkleBucketsReqPayload,
    ClusterMerkleBucketsRespPayload, ClusterMerkleKeysReqPayload, ClusterMerkleKeysRespPayload,
    ClusterMerkleRootReqPayload, ClusterMerkleRootRespPayload, ClusterMessage,
    ClusterRepairDataReqPayload, ClusterRepairDataRespPayload, ClusterRepairWritePayload,
    ClusterTopicPubPayload, ConsistencyLevel, DeltaOp, ExplicitSuspicionPayload,
    HeartbeatComplaintPayload, HeartbeatPayload, HelloPayload, JoinRequestPayload,
    JoinResponsePayload, LeaveRequestPayload, MapStateChunk, MapType, MembersUpdatePayload,
    MergeRequestPayload, MigrateCancelPayload, MigrateChunkAckPayload, MigrateChunkPayload,
    MigrateCompletePayload, MigrateDataPayload, MigrateFinalizePayload, MigrateReadyPayload,
    MigrateStartPayload, MigrateVerifyPayload, OpForwardPayload, PartitionTableUpdatePayload,
    ReplicationAckPayload, ReplicationBatchAckPayload, ReplicationBatchPayload,
    ReplicationPayload, SplitBrainProbePayload, SplitBrainProbeResponsePayload, PROTOCOL_VERSION,
};

// errors
pub use errors::ClusterError;

// lock
pub use lock::{AcquireResult, LockGranted, LockManager, SharedLockManager, WaitQueueEntry};

// topic
pub use topic::{validate_topic, PublishOutcome, SharedTopicBus, TopicBus, TopicMessage};

// replication
pub use replication::{
    LagSnapshot, LagTracker, OperationApplier, PeerSender, ReplicationEvent, ReplicationOutcome,
    ReplicationPipeline,
};

// migration (chunked transfer engine; distinct from the existing MigrationService trait)
pub use migration::{
    checksum64, DataCollector, DataStorer, MigrationEngine, MigrationEvent,
};

// repair
pub use repair::{MerkleIndex, RecordStore, RepairPriority, RepairRecord, RepairScheduler, RepairTask};

// transport
pub use transport::{ClusterTransport, SharedClusterTransport, TransportEvent};

// state
pub use state::{
    ClusterChange, ClusterChannelReceivers, ClusterChannels, ClusterPartitionTable, ClusterState,
    InboundClusterMessage, MigrationCommand,
};

// failure_detector
pub use failure_detector::{DeadlineFailureDetector, PhiAccrualConfig, PhiAccrualFailureDetector};

// failover
pub use failover::{
    alive_from_liveness, sorted_alive_except, FailoverController, FailoverEvent,
    PartitionOwnerChange, SharedFailoverController,
};

// assignment
pub use assignment::{compute_assignment, order_migrations, plan_rebalance};

// service (composition root)
pub use service::ClusterServiceImpl;

// ---------------------------------------------------------------------------
// Integration tests
// ---------------------------------------------------------------------------
