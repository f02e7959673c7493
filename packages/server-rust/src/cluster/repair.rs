//! `MerkleIndex` and `RepairScheduler`: periodic anti-entropy repair.
//!
//! `MerkleIndex` is a thin per-partition wrapper over `topgun_core::MerkleTree`,
//! the same "one tree per shard behind a `DashMap`" shape `ClusterPartitionTable`
//! uses for per-partition metadata. `RepairScheduler` drives the bucket-exchange
//! protocol described in SPEC_FULL.md §4.6 over the `CLUSTER_MERKLE_*`/
//! `CLUSTER_REPAIR_*` wire messages, correlating request/response pairs with
//! `oneshot` channels exactly as [`super::migration`] does for chunk acks.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use topgun_core::{MerkleNode, MerkleTree, Timestamp};

use super::errors::ClusterError;
use super::messages::{
    ClusterMerkleBucketsRespPayload, ClusterMerkleKeysRespPayload, ClusterMerkleRootRespPayload,
    ClusterMessage, ClusterRepairDataReqPayload, ClusterRepairDataRespPayload,
    ClusterRepairWritePayload,
};
use super::replication::PeerSender;

// ---------------------------------------------------------------------------
// MerkleIndex
// ---------------------------------------------------------------------------

/// One per-partition `MerkleTree`, keyed by partition ID.
pub struct MerkleIndex {
    trees: DashMap<u32, Mutex<MerkleTree>>,
    depth: usize,
}

impl MerkleIndex {
    #[must_use]
    pub fn new(depth: usize) -> Self {
        Self {
            trees: DashMap::new(),
            depth,
        }
    }

    fn tree_for(&self, partition_id: u32) -> dashmap::mapref::one::Ref<'_, u32, Mutex<MerkleTree>> {
        self.trees
            .entry(partition_id)
            .or_insert_with(|| Mutex::new(MerkleTree::new(self.depth)))
            .downgrade()
    }

    pub fn update_record(&self, partition_id: u32, key: &str, content_hash: u32) {
        self.tree_for(partition_id).lock().update_record(key, content_hash);
    }

    pub fn remove_record(&self, partition_id: u32, key: &str) {
        self.tree_for(partition_id).lock().remove_record(key);
    }

    #[must_use]
    pub fn root_hash(&self, partition_id: u32) -> u32 {
        self.tree_for(partition_id).lock().root_hash()
    }

    #[must_use]
    pub fn node_at(&self, partition_id: u32, prefix: &str) -> MerkleNode {
        self.tree_for(partition_id).lock().node_at(prefix)
    }

    #[must_use]
    pub fn keys_in_bucket(&self, partition_id: u32, path: &str) -> BTreeSet<String> {
        self.tree_for(partition_id).lock().keys_in_bucket(path)
    }
}

// ---------------------------------------------------------------------------
// RecordStore
// ---------------------------------------------------------------------------

/// Opaque record shape exchanged during repair: an HLC timestamp for LWW
/// comparison plus the caller's serialized record bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairRecord {
    pub timestamp: Timestamp,
    pub data: Vec<u8>,
}

/// Reads/writes the local KV store during repair. Corresponds to the spec's
/// injected `getRecord`/`setRecord` callbacks.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get_record(&self, partition_id: u32, key: &str) -> Option<RepairRecord>;
    async fn set_record(&self, partition_id: u32, key: &str, record: RepairRecord) -> anyhow::Result<()>;
}

// ---------------------------------------------------------------------------
// RepairTask / priority queue
// ---------------------------------------------------------------------------

/// Relative urgency of a repair task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RepairPriority {
    Low,
    Normal,
    High,
}

/// One (partition, peer) pair queued for reconciliation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepairTask {
    pub partition_id: u32,
    pub peer_node_id: String,
}

struct QueuedTask {
    task: RepairTask,
    priority: RepairPriority,
    last_updated_ms: u64,
}

/// Min-effort priority queue: highest priority first, ties broken by
/// `last_updated_ms` descending when `prioritize_recent` is set.
struct RepairQueue {
    items: VecDeque<QueuedTask>,
    queued: HashSet<RepairTask>,
    prioritize_recent: bool,
}

impl RepairQueue {
    fn new(prioritize_recent: bool) -> Self {
        Self {
            items: VecDeque::new(),
            queued: HashSet::new(),
            prioritize_recent,
        }
    }

    fn push(&mut self, task: RepairTask, priority: RepairPriority, last_updated_ms: u64) {
        if self.queued.contains(&task) {
            return;
        }
        self.queued.insert(task.clone());
        self.items.push_back(QueuedTask {
            task,
            priority,
            last_updated_ms,
        });
    }

    fn pop(&mut self) -> Option<RepairTask> {
        let (idx, _) = self
            .items
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                a.priority.cmp(&b.priority).then_with(|| {
                    if self.prioritize_recent {
                        a.last_updated_ms.cmp(&b.last_updated_ms)
                    } else {
                        std::cmp::Ordering::Equal
                    }
                })
            })?;
        let item = self.items.remove(idx)?;
        self.queued.remove(&item.task);
        Some(item.task)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

// ---------------------------------------------------------------------------
// RepairScheduler
// ---------------------------------------------------------------------------

enum PendingResponse {
    Root(oneshot::Sender<u32>),
    Buckets(oneshot::Sender<(u32, Vec<(char, u32)>)>),
    Keys(oneshot::Sender<Vec<String>>),
    Data(oneshot::Sender<Option<Vec<u8>>>),
}

/// Drains a prioritized queue of (partition, peer) repair tasks, running the
/// bucket-exchange-diff-then-LWW-reconcile algorithm against each.
pub struct RepairScheduler {
    local_node_id: String,
    index: Arc<MerkleIndex>,
    transport: Arc<dyn PeerSender>,
    store: Arc<dyn RecordStore>,
    max_concurrent: usize,
    throttle: Duration,
    queue: Mutex<RepairQueue>,
    pending: DashMap<String, PendingResponse>,
}

impl RepairScheduler {
    #[must_use]
    pub fn new(
        local_node_id: String,
        index: Arc<MerkleIndex>,
        transport: Arc<dyn PeerSender>,
        store: Arc<dyn RecordStore>,
        max_concurrent: usize,
        throttle_ms: u64,
        prioritize_recent: bool,
    ) -> Self {
        Self {
            local_node_id,
            index,
            transport,
            store,
            max_concurrent,
            throttle: Duration::from_millis(throttle_ms),
            queue: Mutex::new(RepairQueue::new(prioritize_recent)),
            pending: DashMap::new(),
        }
    }

    /// Enqueues a (partition, peer) pair for repair, deduplicated against the
    /// current queue contents.
    pub fn enqueue(&self, partition_id: u32, peer_node_id: String, priority: RepairPriority, last_updated_ms: u64) {
        self.queue.lock().push(
            RepairTask {
                partition_id,
                peer_node_id,
            },
            priority,
            last_updated_ms,
        );
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drains up to `max_concurrent` tasks and runs them, pausing `throttle`
    /// between batches. Call on the scan-scheduler's drain loop.
    pub async fn drain_once(self: &Arc<Self>) {
        let batch: Vec<RepairTask> = {
            let mut queue = self.queue.lock();
            let n = self.max_concurrent.min(queue.len());
            (0..n).filter_map(|_| queue.pop()).collect()
        };
        if batch.is_empty() {
            return;
        }

        let handles: Vec<_> = batch
            .into_iter()
            .map(|task| {
                let scheduler = Arc::clone(self);
                tokio::spawn(async move { scheduler.reconcile(task).await })
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        tokio::time::sleep(self.throttle).await;
    }

    /// Runs the full bucket-exchange-diff-then-LWW-reconcile algorithm against
    /// one peer for one partition. Network/peer-left errors cancel silently.
    async fn reconcile(&self, task: RepairTask) {
        let RepairTask {
            partition_id,
            peer_node_id: peer,
        } = task;

        let Ok(remote_root) = self.request_root(partition_id, &peer).await else {
            debug!(partition_id, peer, "repair root exchange failed, skipping");
            return;
        };
        let local_root = self.index.root_hash(partition_id);
        if local_root == remote_root {
            return;
        }

        let mut candidates = BTreeSet::new();
        let mut frontier = VecDeque::new();
        frontier.push_back(String::new());

        while let Some(prefix) = frontier.pop_front() {
            let local_node = self.index.node_at(partition_id, &prefix);
            let Ok((remote_hash, remote_children)) =
                self.request_buckets(partition_id, &peer, &prefix).await
            else {
                debug!(partition_id, peer, prefix, "repair bucket exchange failed, cancelling task");
                return;
            };
            if local_node.hash == remote_hash {
                continue;
            }

            let depth_reached = {
                // A node with no children is a leaf (tree depth reached).
                local_node.children.is_empty() && remote_children.is_empty()
            };
            if depth_reached {
                let Ok(remote_keys) = self.request_keys(partition_id, &peer, &prefix).await else {
                    debug!(partition_id, peer, prefix, "repair key exchange failed, cancelling task");
                    return;
                };
                let local_keys = self.index.keys_in_bucket(partition_id, &prefix);
                candidates.extend(local_keys);
                candidates.extend(remote_keys);
                continue;
            }

            // Every branch whose hash differs between local and remote (on
            // either side) diverges and must be descended; taking only the
            // first would leave sibling divergences unreconciled.
            let mut diverging_branches: BTreeSet<char> = remote_children
                .iter()
                .filter(|(branch, hash)| local_node.children.get(branch) != Some(hash))
                .map(|(branch, _)| *branch)
                .collect();
            diverging_branches.extend(local_node.children.iter().filter_map(|(branch, hash)| {
                let matches_remote = remote_children.iter().any(|(b, h)| b == branch && h == hash);
                (!matches_remote).then_some(*branch)
            }));

            for branch in diverging_branches {
                let mut child_prefix = prefix.clone();
                child_prefix.push(branch);
                frontier.push_back(child_prefix);
            }
        }

        for key in candidates {
            self.reconcile_key(partition_id, &peer, &key).await;
        }
    }

    async fn reconcile_key(&self, partition_id: u32, peer: &str, key: &str) {
        let Ok(Some(remote_bytes)) = self.request_data(partition_id, peer, key).await else {
            return;
        };
        let Ok(remote) = rmp_serde::from_slice::<RepairRecord>(&remote_bytes) else {
            return;
        };
        let local = self.store.get_record(partition_id, key).await;

        let remote_wins = match &local {
            None => true,
            Some(local_record) => remote.timestamp > local_record.timestamp,
        };

        if remote_wins {
            if self
                .store
                .set_record(partition_id, key, remote.clone())
                .await
                .is_ok()
            {
                let _ = self
                    .transport
                    .send_to(
                        peer,
                        ClusterMessage::ClusterRepairWrite(ClusterRepairWritePayload {
                            partition_id,
                            key: key.to_string(),
                            record: remote_bytes,
                        }),
                    )
                    .await;
            }
        }
    }

    /// Deterministic correlation key for one outstanding request to `peer`.
    ///
    /// The wire payloads carry no request id of their own (`partition_id` plus
    /// the bucket prefix/path/key already identify what's being asked), so the
    /// key is derived the same way on both ends: the requester stores under
    /// it before sending, and the dispatcher recomputes it from the inbound
    /// response (whose sender is the `peer` this request went to) to resolve
    /// the right pending slot. `reconcile` never has two requests of the same
    /// kind in flight to the same peer at once, so this can't collide.
    pub(super) fn correlation_key(kind: &str, peer: &str, partition_id: u32, detail: &str) -> String {
        format!("{peer}:{kind}:{partition_id}:{detail}")
    }

    async fn request_root(&self, partition_id: u32, peer: &str) -> Result<u32, ClusterError> {
        let (tx, rx) = oneshot::channel();
        let key = Self::correlation_key("root", peer, partition_id, "");
        self.pending.insert(key.clone(), PendingResponse::Root(tx));
        self.transport
            .send_to(
                peer,
                ClusterMessage::ClusterMerkleRootReq(super::messages::ClusterMerkleRootReqPayload {
                    partition_id,
                }),
            )
            .await?;
        self.await_response(key, rx).await
    }

    async fn request_buckets(
        &self,
        partition_id: u32,
        peer: &str,
        prefix: &str,
    ) -> Result<(u32, Vec<(char, u32)>), ClusterError> {
        let (tx, rx) = oneshot::channel();
        let key = Self::correlation_key("buckets", peer, partition_id, prefix);
        self.pending.insert(key.clone(), PendingResponse::Buckets(tx));
        self.transport
            .send_to(
                peer,
                ClusterMessage::ClusterMerkleBucketsReq(
                    super::messages::ClusterMerkleBucketsReqPayload {
                        partition_id,
                        prefix: prefix.to_string(),
                    },
                ),
            )
            .await?;
        self.await_response(key, rx).await
    }

    async fn request_keys(
        &self,
        partition_id: u32,
        peer: &str,
        path: &str,
    ) -> Result<Vec<String>, ClusterError> {
        let (tx, rx) = oneshot::channel();
        let key = Self::correlation_key("keys", peer, partition_id, path);
        self.pending.insert(key.clone(), PendingResponse::Keys(tx));
        self.transport
            .send_to(
                peer,
                ClusterMessage::ClusterMerkleKeysReq(super::messages::ClusterMerkleKeysReqPayload {
                    partition_id,
                    path: path.to_string(),
                }),
            )
            .await?;
        self.await_response(key, rx).await
    }

    async fn request_data(
        &self,
        partition_id: u32,
        peer: &str,
        key_name: &str,
    ) -> Result<Option<Vec<u8>>, ClusterError> {
        let (tx, rx) = oneshot::channel();
        let key = Self::correlation_key("data", peer, partition_id, key_name);
        self.pending.insert(key.clone(), PendingResponse::Data(tx));
        self.transport
            .send_to(
                peer,
                ClusterMessage::ClusterRepairDataReq(ClusterRepairDataReqPayload {
                    partition_id,
                    key: key_name.to_string(),
                }),
            )
            .await?;
        self.await_response(key, rx).await
    }

    async fn await_response<T>(
        &self,
        key: String,
        rx: oneshot::Receiver<T>,
    ) -> Result<T, ClusterError> {
        match tokio::time::timeout(Duration::from_millis(5000), rx).await {
            Ok(Ok(value)) => Ok(value),
            _ => {
                self.pending.remove(&key);
                Err(ClusterError::PeerUnreachable {
                    node_id: key,
                })
            }
        }
    }

    /// Resolves a pending `CLUSTER_MERKLE_ROOT_RESP`. `request_key` must be the
    /// same `correlation_key` the dispatcher derives from the response's
    /// sender and fields.
    pub fn on_root_resp(&self, request_key: &str, resp: &ClusterMerkleRootRespPayload) {
        if let Some((_, PendingResponse::Root(tx))) = self.pending.remove(request_key) {
            let _ = tx.send(resp.root_hash);
        }
    }

    pub fn on_buckets_resp(&self, request_key: &str, resp: &ClusterMerkleBucketsRespPayload) {
        if let Some((_, PendingResponse::Buckets(tx))) = self.pending.remove(request_key) {
            let _ = tx.send((resp.hash, resp.children.clone()));
        }
    }

    pub fn on_keys_resp(&self, request_key: &str, resp: &ClusterMerkleKeysRespPayload) {
        if let Some((_, PendingResponse::Keys(tx))) = self.pending.remove(request_key) {
            let _ = tx.send(resp.keys.clone());
        }
    }

    pub fn on_data_resp(&self, request_key: &str, resp: &ClusterRepairDataRespPayload) {
        if let Some((_, PendingResponse::Data(tx))) = self.pending.remove(request_key) {
            let _ = tx.send(resp.record.clone());
        }
    }

    /// Serves a local `CLUSTER_MERKLE_ROOT_REQ`.
    #[must_use]
    pub fn serve_root_req(&self, partition_id: u32) -> ClusterMerkleRootRespPayload {
        ClusterMerkleRootRespPayload {
            partition_id,
            root_hash: self.index.root_hash(partition_id),
        }
    }

    /// Serves a local `CLUSTER_MERKLE_BUCKETS_REQ`.
    #[must_use]
    pub fn serve_buckets_req(&self, partition_id: u32, prefix: &str) -> ClusterMerkleBucketsRespPayload {
        let node = self.index.node_at(partition_id, prefix);
        ClusterMerkleBucketsRespPayload {
            partition_id,
            prefix: prefix.to_string(),
            hash: node.hash,
            children: node.children.into_iter().collect(),
        }
    }

    /// Serves a local `CLUSTER_MERKLE_KEYS_REQ`.
    #[must_use]
    pub fn serve_keys_req(&self, partition_id: u32, path: &str) -> ClusterMerkleKeysRespPayload {
        ClusterMerkleKeysRespPayload {
            partition_id,
            path: path.to_string(),
            keys: self.index.keys_in_bucket(partition_id, path).into_iter().collect(),
        }
    }

    /// Serves a local `CLUSTER_REPAIR_DATA_REQ`.
    pub async fn serve_data_req(
        &self,
        partition_id: u32,
        key: &str,
    ) -> ClusterRepairDataRespPayload {
        let record = self.store.get_record(partition_id, key).await.and_then(|r| {
            rmp_serde::to_vec_named(&r).ok()
        });
        ClusterRepairDataRespPayload {
            partition_id,
            key: key.to_string(),
            record,
        }
    }

    /// Handles an incoming `CLUSTER_REPAIR_WRITE`: applies the peer's
    /// already-resolved winner locally (the write-back half of repair).
    pub async fn handle_repair_write(&self, payload: ClusterRepairWritePayload) {
        let Ok(record) = rmp_serde::from_slice::<RepairRecord>(&payload.record) else {
            warn!(partition_id = payload.partition_id, "malformed repair write-back");
            return;
        };
        let _ = self.store.set_record(payload.partition_id, &payload.key, record).await;
    }
}
