//! `ReplicationPipeline`: fans writes out to backups under a caller-selected
//! consistency level, and `LagTracker`, which watches per-backup replication
//! health.
//!
//! Sending wire messages and applying received operations are both modeled as
//! injected async traits (`PeerSender`, `OperationApplier`), the same way the
//! teacher's `MigrationService`/`ClusterService` traits keep transport and
//! storage pluggable behind `async_trait` objects owned by the embedder.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::errors::ClusterError;
use super::messages::{
    ClusterMessage, ConsistencyLevel, ReplicationAckPayload, ReplicationBatchAckPayload,
    ReplicationBatchPayload, ReplicationPayload,
};
use super::types::ClusterConfig;

/// Sends a single cluster message to one peer. Implemented by `ClusterTransport`.
#[async_trait]
pub trait PeerSender: Send + Sync {
    async fn send_to(&self, node_id: &str, message: ClusterMessage) -> Result<(), ClusterError>;
}

/// Applies a replicated operation to local storage. Implemented by the embedder's
/// KV/storage layer; corresponds to the spec's `OperationApplier(operation, opId, sender) -> bool`.
#[async_trait]
pub trait OperationApplier: Send + Sync {
    async fn apply(&self, operation: &[u8], op_id: &str, sender_id: &str) -> bool;
}

/// Result of a resolved `replicate` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationOutcome {
    pub success: bool,
    pub acked_by: Vec<String>,
}

struct PendingAck {
    targets: Vec<String>,
    acked: HashSet<String>,
    consistency: ConsistencyLevel,
    resolver: Option<oneshot::Sender<Result<Vec<String>, ClusterError>>>,
}

/// One queued write awaiting EVENTUAL delivery to a specific backup.
#[derive(Debug, Clone)]
struct ReplicationTask {
    op_id: String,
    operation: Vec<u8>,
    retry_count: u32,
}

/// Per-node replication lag statistics.
#[derive(Debug, Clone, Default)]
struct NodeLagState {
    current_ms: u64,
    history_ms: VecDeque<u64>,
    last_update_ms: u64,
    pending_ops: u64,
}

const LAG_HISTORY_CAP: usize = 100;

/// A point-in-time snapshot of one node's replication lag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LagSnapshot {
    pub current_ms: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
    pub p99_ms: u64,
}

/// Tracks replication round-trip latency per backup node.
pub struct LagTracker {
    nodes: DashMap<String, Mutex<NodeLagState>>,
    laggy_threshold_ms: u64,
    unhealthy_threshold_ms: u64,
    clock: AtomicU64,
}

impl LagTracker {
    #[must_use]
    pub fn new(config: &ClusterConfig) -> Self {
        Self {
            nodes: DashMap::new(),
            laggy_threshold_ms: config.laggy_threshold_ms,
            unhealthy_threshold_ms: config.unhealthy_threshold_ms,
            clock: AtomicU64::new(0),
        }
    }

    /// Advances the tracker's notion of "now" (tests drive this explicitly;
    /// production call sites pass real wall-clock millis).
    pub fn tick(&self, now_ms: u64) {
        self.clock.store(now_ms, Ordering::Relaxed);
    }

    fn now(&self) -> u64 {
        self.clock.load(Ordering::Relaxed)
    }

    /// Records a fresh round-trip measurement for `node`.
    pub fn update(&self, node: &str, rtt_ms: u64) {
        let now = self.now();
        let entry = self.nodes.entry(node.to_string()).or_default();
        let mut state = entry.lock();
        state.current_ms = rtt_ms;
        state.last_update_ms = now;
        if state.history_ms.len() >= LAG_HISTORY_CAP {
            state.history_ms.pop_front();
        }
        state.history_ms.push_back(rtt_ms);
    }

    /// Records a successful ack: resets `current` to zero and decrements `pendingOps`.
    pub fn record_ack(&self, node: &str) {
        let now = self.now();
        let entry = self.nodes.entry(node.to_string()).or_default();
        let mut state = entry.lock();
        state.current_ms = 0;
        state.last_update_ms = now;
        state.pending_ops = state.pending_ops.saturating_sub(1);
    }

    /// Marks one outstanding op queued for `node` (EVENTUAL enqueue).
    pub fn note_pending(&self, node: &str) {
        let entry = self.nodes.entry(node.to_string()).or_default();
        entry.lock().pending_ops += 1;
    }

    /// Returns lag statistics for `node`, or a zeroed snapshot if unseen.
    #[must_use]
    pub fn get_lag(&self, node: &str) -> LagSnapshot {
        let Some(entry) = self.nodes.get(node) else {
            return LagSnapshot {
                current_ms: 0,
                avg_ms: 0.0,
                max_ms: 0,
                p99_ms: 0,
            };
        };
        let state = entry.lock();
        let mut sorted: Vec<u64> = state.history_ms.iter().copied().collect();
        sorted.sort_unstable();
        let avg = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };
        let max = sorted.last().copied().unwrap_or(0);
        let p99 = if sorted.is_empty() {
            0
        } else {
            let idx = ((sorted.len() as f64) * 0.99).ceil() as usize;
            sorted[idx.saturating_sub(1).min(sorted.len() - 1)]
        };
        LagSnapshot {
            current_ms: state.current_ms,
            avg_ms: avg,
            max_ms: max,
            p99_ms: p99,
        }
    }

    /// A node is laggy once its current round-trip exceeds the configured threshold.
    #[must_use]
    pub fn is_laggy(&self, node: &str) -> bool {
        self.get_lag(node).current_ms > self.laggy_threshold_ms
    }

    /// A node is unhealthy once it has had no update for longer than the configured threshold.
    #[must_use]
    pub fn is_unhealthy(&self, node: &str) -> bool {
        let Some(entry) = self.nodes.get(node) else {
            return false;
        };
        let state = entry.lock();
        self.now().saturating_sub(state.last_update_ms) > self.unhealthy_threshold_ms
    }

    /// The cluster-wide view is healthy iff no tracked node is unhealthy.
    #[must_use]
    pub fn cluster_healthy(&self) -> bool {
        !self.nodes.iter().any(|entry| {
            let state = entry.value().lock();
            self.now().saturating_sub(state.last_update_ms) > self.unhealthy_threshold_ms
        })
    }
}

/// Bounded recent-opId window used by backups to de-duplicate at-least-once
/// batch deliveries (see SPEC_FULL.md §9 Open Questions: batch-level idempotence).
struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Returns `true` if `op_id` was already seen; otherwise records it and returns `false`.
    fn check_and_insert(&mut self, op_id: &str) -> bool {
        if self.seen.contains(op_id) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(op_id.to_string());
        self.order.push_back(op_id.to_string());
        false
    }
}

/// Notable lifecycle events a replication pipeline emits for the embedder to observe.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationEvent {
    QueueOverflow { node_id: String },
    ReplicationFailed { op_id: String, node_id: String },
}

/// Fans writes out to backup replicas per consistency level, tracks pending
/// acks, and drains EVENTUAL queues on a batch timer.
pub struct ReplicationPipeline {
    config: Arc<ClusterConfig>,
    local_node_id: String,
    transport: Arc<dyn PeerSender>,
    applier: Arc<dyn OperationApplier>,
    pending: DashMap<String, Mutex<PendingAck>>,
    eventual_queues: DashMap<String, Mutex<VecDeque<ReplicationTask>>>,
    dedup: DashMap<String, Mutex<DedupWindow>>,
    pub lag: LagTracker,
    closed: std::sync::atomic::AtomicBool,
    events: mpsc::UnboundedSender<ReplicationEvent>,
}

impl ReplicationPipeline {
    #[must_use]
    pub fn new(
        config: Arc<ClusterConfig>,
        local_node_id: String,
        transport: Arc<dyn PeerSender>,
        applier: Arc<dyn OperationApplier>,
    ) -> (Self, mpsc::UnboundedReceiver<ReplicationEvent>) {
        let lag = LagTracker::new(&config);
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                local_node_id,
                transport,
                applier,
                pending: DashMap::new(),
                eventual_queues: DashMap::new(),
                dedup: DashMap::new(),
                lag,
                closed: std::sync::atomic::AtomicBool::new(false),
                events,
            },
            events_rx,
        )
    }

    /// Replicates one operation to `backups` under the given consistency level.
    pub async fn replicate(
        &self,
        op_id: String,
        operation: Vec<u8>,
        backups: Vec<String>,
        consistency: ConsistencyLevel,
        timeout_override: Option<Duration>,
    ) -> Result<ReplicationOutcome, ClusterError> {
        if backups.is_empty() {
            return Ok(ReplicationOutcome {
                success: true,
                acked_by: vec![self.local_node_id.clone()],
            });
        }

        match consistency {
            ConsistencyLevel::Eventual => {
                for backup in &backups {
                    self.enqueue_eventual(backup, op_id.clone(), operation.clone());
                }
                Ok(ReplicationOutcome {
                    success: true,
                    acked_by: vec![self.local_node_id.clone()],
                })
            }
            ConsistencyLevel::Strong | ConsistencyLevel::Quorum => {
                self.replicate_acked(op_id, operation, backups, consistency, timeout_override)
                    .await
            }
        }
    }

    async fn replicate_acked(
        &self,
        op_id: String,
        operation: Vec<u8>,
        targets: Vec<String>,
        consistency: ConsistencyLevel,
        timeout_override: Option<Duration>,
    ) -> Result<ReplicationOutcome, ClusterError> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            op_id.clone(),
            Mutex::new(PendingAck {
                targets: targets.clone(),
                acked: HashSet::new(),
                consistency,
                resolver: Some(tx),
            }),
        );

        for target in &targets {
            let message = ClusterMessage::Replication(ReplicationPayload {
                op_id: op_id.clone(),
                operation: operation.clone(),
                consistency,
                sender_id: self.local_node_id.clone(),
            });
            if self.transport.send_to(target, message).await.is_err() {
                warn!(node_id = target, op_id, "replication send failed, awaiting timeout");
            }
        }

        let deadline = timeout_override
            .unwrap_or_else(|| Duration::from_millis(self.config.ack_timeout_ms));

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(result)) => result.map(|acked_by| ReplicationOutcome {
                success: true,
                acked_by,
            }),
            _ => {
                let acked = self
                    .pending
                    .remove(&op_id)
                    .map(|(_, entry)| entry.into_inner().acked.into_iter().collect())
                    .unwrap_or_default();
                Err(ClusterError::ReplicationTimeout {
                    op_id,
                    targets,
                    acked,
                })
            }
        }
    }

    fn quorum_threshold(target_count: usize) -> usize {
        target_count / 2 + 1
    }

    /// Reconciles a `REPLICATION_ACK` against a pending entry, resolving it if the
    /// consistency predicate is now satisfied. `rtt_ms` feeds the `LagTracker`.
    pub fn on_replication_ack(&self, ack: &ReplicationAckPayload, rtt_ms: u64) {
        self.lag.update(&ack.sender_id, rtt_ms);
        if !ack.success {
            return;
        }
        self.lag.record_ack(&ack.sender_id);

        let mut resolve_with: Option<(Vec<String>, oneshot::Sender<Result<Vec<String>, ClusterError>>)> =
            None;

        if let Some(entry) = self.pending.get(&ack.op_id) {
            let mut pending = entry.lock();
            pending.acked.insert(ack.sender_id.clone());

            let satisfied = match pending.consistency {
                ConsistencyLevel::Strong => pending.acked.len() == pending.targets.len(),
                ConsistencyLevel::Quorum => {
                    pending.acked.len() >= Self::quorum_threshold(pending.targets.len())
                }
                ConsistencyLevel::Eventual => false,
            };

            if satisfied {
                if let Some(resolver) = pending.resolver.take() {
                    let mut acked_by: Vec<String> = pending.acked.iter().cloned().collect();
                    acked_by.push(self.local_node_id.clone());
                    resolve_with = Some((acked_by, resolver));
                }
            }
        }

        if let Some((acked_by, resolver)) = resolve_with {
            self.pending.remove(&ack.op_id);
            let _ = resolver.send(Ok(acked_by));
        }
    }

    /// `REPLICATION_BATCH_ACK` only updates lag; EVENTUAL never waits on acks.
    pub fn on_replication_batch_ack(&self, ack: &ReplicationBatchAckPayload, rtt_ms: u64) {
        self.lag.update(&ack.sender_id, rtt_ms);
        if ack.success {
            self.lag.record_ack(&ack.sender_id);
        }
    }

    fn enqueue_eventual(&self, backup: &str, op_id: String, operation: Vec<u8>) {
        let queue = self
            .eventual_queues
            .entry(backup.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut queue = queue.lock();
        if queue.len() >= self.config.queue_size_limit {
            queue.pop_front();
            warn!(node_id = backup, "eventual replication queue overflowed, dropped oldest");
            let _ = self.events.send(ReplicationEvent::QueueOverflow {
                node_id: backup.to_string(),
            });
        }
        queue.push_back(ReplicationTask {
            op_id,
            operation,
            retry_count: 0,
        });
        drop(queue);
        self.lag.note_pending(backup);
    }

    /// Drains up to `batch_size` queued tasks for `backup` into one `REPLICATION_BATCH`.
    /// Call on the batch timer interval (`batch_interval_ms`) for every known backup.
    pub async fn drain_batch(&self, backup: &str) {
        let Some(queue_lock) = self.eventual_queues.get(backup) else {
            return;
        };

        let batch: Vec<ReplicationTask> = {
            let mut queue = queue_lock.lock();
            let n = self.config.batch_size.min(queue.len());
            queue.drain(..n).collect()
        };
        if batch.is_empty() {
            return;
        }

        let op_ids: Vec<String> = batch.iter().map(|t| t.op_id.clone()).collect();
        let operations: Vec<Vec<u8>> = batch.iter().map(|t| t.operation.clone()).collect();
        let message = ClusterMessage::ReplicationBatch(ReplicationBatchPayload {
            op_ids: op_ids.clone(),
            operations,
            sender_id: self.local_node_id.clone(),
        });

        if self.transport.send_to(backup, message).await.is_err() {
            self.requeue_with_retry(backup, batch);
        }
    }

    fn requeue_with_retry(&self, backup: &str, batch: Vec<ReplicationTask>) {
        let queue_lock = self
            .eventual_queues
            .entry(backup.to_string())
            .or_insert_with(|| Mutex::new(VecDeque::new()));
        let mut queue = queue_lock.lock();
        for mut task in batch.into_iter().rev() {
            task.retry_count += 1;
            if task.retry_count <= self.config.max_replication_retries {
                queue.push_front(task);
            } else {
                warn!(node_id = backup, op_id = task.op_id, "replication task exhausted retries");
                let _ = self.events.send(ReplicationEvent::ReplicationFailed {
                    op_id: task.op_id.clone(),
                    node_id: backup.to_string(),
                });
            }
        }
    }

    /// Applies an incoming `REPLICATION` and builds the ack to send back.
    /// De-duplicates against the per-backup recent-opId window first.
    pub async fn handle_replication(
        &self,
        payload: ReplicationPayload,
        sender_id: &str,
    ) -> ReplicationAckPayload {
        let dup = {
            let window = self
                .dedup
                .entry(sender_id.to_string())
                .or_insert_with(|| Mutex::new(DedupWindow::new(self.config.opid_dedup_window)));
            window.lock().check_and_insert(&payload.op_id)
        };

        let success = if dup {
            true
        } else {
            self.applier
                .apply(&payload.operation, &payload.op_id, sender_id)
                .await
        };

        ReplicationAckPayload {
            op_id: payload.op_id,
            success,
            sender_id: self.local_node_id.clone(),
        }
    }

    /// Applies an incoming `REPLICATION_BATCH` and builds the batch ack to send back.
    pub async fn handle_replication_batch(
        &self,
        payload: ReplicationBatchPayload,
        sender_id: &str,
    ) -> ReplicationBatchAckPayload {
        let window_entry = self
            .dedup
            .entry(sender_id.to_string())
            .or_insert_with(|| Mutex::new(DedupWindow::new(self.config.opid_dedup_window)));

        let mut all_applied = true;
        for (op_id, operation) in payload.op_ids.iter().zip(payload.operations.iter()) {
            let dup = window_entry.lock().check_and_insert(op_id);
            if !dup {
                let applied = self.applier.apply(operation, op_id, sender_id).await;
                all_applied &= applied;
            }
        }

        ReplicationBatchAckPayload {
            op_ids: payload.op_ids,
            success: all_applied,
            sender_id: self.local_node_id.clone(),
        }
    }

    /// Rejects every outstanding pending ack and drops all EVENTUAL queues.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, entry)) = self.pending.remove(&key) {
                let mut pending = entry.into_inner();
                if let Some(resolver) = pending.resolver.take() {
                    let _ = resolver.send(Err(ClusterError::Shutdown {
                        component: "ReplicationPipeline".to_string(),
                    }));
                }
            }
        }
        self.eventual_queues.clear();
        debug!("replication pipeline closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// Number of queued EVENTUAL tasks for `backup`.
    #[must_use]
    pub fn queue_len(&self, backup: &str) -> usize {
        self.eventual_queues
            .get(backup)
            .map(|q| q.lock().len())
            .unwrap_or(0)
    }
}
