//! `MigrationEngine`: chunked online partition transfer between nodes.
//!
//! Follows the same pluggable-callback shape as [`super::replication`]:
//! sending is delegated to `PeerSender`, and reading/writing the KV store is
//! delegated to `DataCollector`/`DataStorer`, matching the spec's
//! `dataCollector`/`dataStorer` callbacks and the teacher's preference for
//! injected `async_trait` objects over concrete storage types.

use std::collections::VecDeque;
use std::hash::Hasher;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ahash::AHasher;
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::errors::ClusterError;
use super::messages::{
    ClusterMessage, MigrateChunkAckPayload, MigrateChunkPayload, MigrateCompletePayload,
    MigrateStartPayload, MigrateVerifyPayload,
};
use super::replication::PeerSender;
use super::state::ClusterPartitionTable;
use super::types::{ActiveMigration, MigrationPhase, MigrationTask};

/// Reads a partition's records out of local storage (opaque to this module).
#[async_trait]
pub trait DataCollector: Send + Sync {
    async fn collect(&self, partition_id: u32) -> Vec<Vec<u8>>;
}

/// Writes a reassembled partition's records into local storage.
#[async_trait]
pub trait DataStorer: Send + Sync {
    async fn store(&self, partition_id: u32, records: Vec<Vec<u8>>) -> anyhow::Result<()>;
}

/// Computes a fast, non-cryptographic 64-bit checksum for a chunk or buffer.
///
/// Any fast non-cryptographic hash suffices per the spec; `ahash` is already
/// part of the dependency stack (used elsewhere for hash-map hashing), so it
/// is reused here rather than pulling in a dedicated checksum crate.
#[must_use]
pub fn checksum64(data: &[u8]) -> u64 {
    let mut hasher = AHasher::default();
    hasher.write(data);
    hasher.finish()
}

/// Notable lifecycle events a migration emits for the embedder to observe.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    PartitionMoved {
        partition_id: u32,
        old_owner: String,
        new_owner: String,
    },
    MigrationFailed {
        migration_id: String,
        partition_id: u32,
    },
}

/// Splits `records` into length-prefixed chunks targeting `chunk_size` bytes each.
fn build_chunks(records: &[Vec<u8>], chunk_size: usize) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for record in records {
        if !current.is_empty() && current.len() + 4 + record.len() > chunk_size {
            chunks.push(std::mem::take(&mut current));
        }
        current.extend_from_slice(&(record.len() as u32).to_le_bytes());
        current.extend_from_slice(record);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Parses a reassembled, length-prefixed byte stream back into records.
fn parse_records(mut buf: &[u8]) -> Option<Vec<Vec<u8>>> {
    let mut records = Vec::new();
    while !buf.is_empty() {
        if buf.len() < 4 {
            return None;
        }
        let len = u32::from_le_bytes(buf[0..4].try_into().ok()?) as usize;
        buf = &buf[4..];
        if buf.len() < len {
            return None;
        }
        records.push(buf[0..len].to_vec());
        buf = &buf[len..];
    }
    Some(records)
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Tracking state for one outbound (this node is source) migration.
struct OutboundMigration {
    migration_id: String,
    task: MigrationTask,
    phase: MigrationPhase,
    retry_count: u32,
    started_at_ms: u64,
}

/// Tracking state for one inbound (this node is destination) migration.
struct IncomingMigration {
    partition_id: u32,
    chunks: Vec<Option<Vec<u8>>>,
    total_chunks: u32,
    started_at_ms: u64,
}

/// Coordinates outbound transfers (queue + batch timer + per-partition state
/// machine) and inbound reassembly for partition migrations.
pub struct MigrationEngine {
    local_node_id: String,
    transport: Arc<dyn PeerSender>,
    collector: Arc<dyn DataCollector>,
    storer: Arc<dyn DataStorer>,
    partition_table: Arc<ClusterPartitionTable>,
    transfer_chunk_size: usize,
    sync_timeout_ms: u64,
    max_retries: u32,
    parallel_transfers: usize,

    queue: Mutex<VecDeque<MigrationTask>>,
    active: DashMap<u32, Mutex<OutboundMigration>>,
    incoming: DashMap<String, Mutex<IncomingMigration>>,
    chunk_acks: DashMap<String, oneshot::Sender<bool>>,
    verify_acks: DashMap<String, oneshot::Sender<bool>>,
    next_migration_id: AtomicU32,
    events: mpsc::UnboundedSender<MigrationEvent>,
}

impl MigrationEngine {
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn new(
        local_node_id: String,
        transport: Arc<dyn PeerSender>,
        collector: Arc<dyn DataCollector>,
        storer: Arc<dyn DataStorer>,
        partition_table: Arc<ClusterPartitionTable>,
        transfer_chunk_size: usize,
        sync_timeout_ms: u64,
        max_retries: u32,
        parallel_transfers: usize,
    ) -> (Self, mpsc::UnboundedReceiver<MigrationEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                local_node_id,
                transport,
                collector,
                storer,
                partition_table,
                transfer_chunk_size,
                sync_timeout_ms,
                max_retries,
                parallel_transfers,
                queue: Mutex::new(VecDeque::new()),
                active: DashMap::new(),
                incoming: DashMap::new(),
                chunk_acks: DashMap::new(),
                verify_acks: DashMap::new(),
                next_migration_id: AtomicU32::new(1),
                events,
            },
            events_rx,
        )
    }

    fn fresh_migration_id(&self) -> String {
        let n = self.next_migration_id.fetch_add(1, Ordering::Relaxed);
        format!("{}-mig-{n}", self.local_node_id)
    }

    /// Enumerates partitions where `old` had this node as owner but `new` moved
    /// ownership elsewhere, orders by partition ID, and enqueues them.
    pub fn plan_migration(
        &self,
        old: &[(u32, String)],
        new: &[(u32, String, Vec<String>)],
    ) -> usize {
        let mut tasks: Vec<MigrationTask> = new
            .iter()
            .filter_map(|(pid, new_owner, backups)| {
                let old_owner = old.iter().find(|(p, _)| p == pid).map(|(_, o)| o.as_str());
                if old_owner == Some(self.local_node_id.as_str())
                    && new_owner != &self.local_node_id
                {
                    Some(MigrationTask {
                        partition_id: *pid,
                        source: self.local_node_id.clone(),
                        destination: new_owner.clone(),
                        new_backups: backups.clone(),
                    })
                } else {
                    None
                }
            })
            .collect();
        tasks.sort_by_key(|t| t.partition_id);

        let mut queue = self.queue.lock();
        let count = tasks.len();
        queue.extend(tasks);
        count
    }

    /// Pulls up to `min(slots_available, batch_size)` tasks into the active set
    /// and begins transferring each. Call on the batch timer (default 100ms).
    pub fn pull_batch(self: &Arc<Self>, batch_size: usize) -> usize {
        let slots = self.parallel_transfers.saturating_sub(self.active.len());
        let n = slots.min(batch_size);
        let mut started = Vec::with_capacity(n);
        {
            let mut queue = self.queue.lock();
            for _ in 0..n {
                match queue.pop_front() {
                    Some(task) => started.push(task),
                    None => break,
                }
            }
        }

        let count = started.len();
        for task in started {
            let migration_id = self.fresh_migration_id();
            self.active.insert(
                task.partition_id,
                Mutex::new(OutboundMigration {
                    migration_id: migration_id.clone(),
                    task: task.clone(),
                    phase: MigrationPhase::Replicating,
                    retry_count: 0,
                    started_at_ms: now_ms(),
                }),
            );
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.transfer(migration_id, task).await;
            });
        }
        count
    }

    async fn transfer(self: Arc<Self>, migration_id: String, task: MigrationTask) {
        let records = self.collector.collect(task.partition_id).await;

        if self
            .transport
            .send_to(
                &task.destination,
                ClusterMessage::MigrateStart(MigrateStartPayload {
                    migration_id: migration_id.clone(),
                    partition_id: task.partition_id,
                    destination_node_id: task.destination.clone(),
                }),
            )
            .await
            .is_err()
        {
            self.fail_or_retry(&migration_id, task).await;
            return;
        }

        let chunks = build_chunks(&records, self.transfer_chunk_size);
        let total_chunks = chunks.len() as u32;

        for (index, chunk) in chunks.iter().enumerate() {
            let ok = self
                .send_chunk_and_await_ack(&migration_id, &task, index as u32, total_chunks, chunk)
                .await;
            if !ok {
                self.fail_or_retry(&migration_id, task).await;
                return;
            }
        }

        let whole: Vec<u8> = chunks.concat();
        let checksum = checksum64(&whole);
        let (tx, rx) = oneshot::channel();
        self.verify_acks.insert(migration_id.clone(), tx);

        let sent = self
            .transport
            .send_to(
                &task.destination,
                ClusterMessage::MigrateComplete(MigrateCompletePayload {
                    migration_id: migration_id.clone(),
                    partition_id: task.partition_id,
                    total_records: records.len() as u64,
                    checksum,
                }),
            )
            .await
            .is_ok();

        let verified = sent
            && matches!(
                tokio::time::timeout(Duration::from_millis(self.sync_timeout_ms), rx).await,
                Ok(Ok(true))
            );
        self.verify_acks.remove(&migration_id);

        if verified {
            self.partition_table
                .set_owner(task.partition_id, task.destination.clone(), task.new_backups.clone());
            self.partition_table.increment_version();
            self.active.remove(&task.partition_id);
            let _ = self.events.send(MigrationEvent::PartitionMoved {
                partition_id: task.partition_id,
                old_owner: task.source.clone(),
                new_owner: task.destination.clone(),
            });
            debug!(partition_id = task.partition_id, migration_id, "migration complete");
        } else {
            self.fail_or_retry(&migration_id, task).await;
        }
    }

    async fn send_chunk_and_await_ack(
        &self,
        migration_id: &str,
        task: &MigrationTask,
        chunk_index: u32,
        total_chunks: u32,
        data: &[u8],
    ) -> bool {
        let key = format!("{migration_id}:{chunk_index}");
        let (tx, rx) = oneshot::channel();
        self.chunk_acks.insert(key.clone(), tx);

        let sent = self
            .transport
            .send_to(
                &task.destination,
                ClusterMessage::MigrateChunk(MigrateChunkPayload {
                    migration_id: migration_id.to_string(),
                    partition_id: task.partition_id,
                    chunk_index,
                    total_chunks,
                    data: data.to_vec(),
                    checksum: checksum64(data),
                }),
            )
            .await
            .is_ok();

        let acked = sent
            && matches!(
                tokio::time::timeout(Duration::from_millis(self.sync_timeout_ms), rx).await,
                Ok(Ok(true))
            );
        self.chunk_acks.remove(&key);
        acked
    }

    async fn fail_or_retry(&self, migration_id: &str, task: MigrationTask) {
        let partition_id = task.partition_id;
        let mut requeue = false;

        if let Some(entry) = self.active.get(&partition_id) {
            let mut outbound = entry.lock();
            outbound.retry_count += 1;
            if outbound.retry_count <= self.max_retries {
                outbound.phase = MigrationPhase::Replicating;
                requeue = true;
            } else {
                outbound.phase = MigrationPhase::Failed;
            }
        }

        if requeue {
            warn!(partition_id, migration_id, "migration failed, requeueing");
            self.active.remove(&partition_id);
            self.queue.lock().push_front(task);
        } else {
            warn!(partition_id, migration_id, "migration permanently failed");
            self.active.remove(&partition_id);
            let _ = self.events.send(MigrationEvent::MigrationFailed {
                migration_id: migration_id.to_string(),
                partition_id,
            });
        }
    }

    /// Target-side: allocates reassembly state for an incoming migration.
    pub fn handle_migrate_start(&self, payload: &MigrateStartPayload) {
        self.incoming.insert(
            payload.migration_id.clone(),
            Mutex::new(IncomingMigration {
                partition_id: payload.partition_id,
                chunks: Vec::new(),
                total_chunks: 0,
                started_at_ms: now_ms(),
            }),
        );
    }

    /// Target-side: verifies and stores one chunk, returning the ack to send back.
    pub fn handle_migrate_chunk(&self, payload: MigrateChunkPayload) -> MigrateChunkAckPayload {
        let valid = checksum64(&payload.data) == payload.checksum;
        if valid {
            if let Some(entry) = self.incoming.get(&payload.migration_id) {
                let mut incoming = entry.lock();
                incoming.total_chunks = payload.total_chunks;
                if incoming.chunks.len() < payload.total_chunks as usize {
                    incoming.chunks.resize(payload.total_chunks as usize, None);
                }
                if let Some(slot) = incoming.chunks.get_mut(payload.chunk_index as usize) {
                    *slot = Some(payload.data);
                }
            }
        } else {
            warn!(
                migration_id = payload.migration_id,
                chunk_index = payload.chunk_index,
                "migration chunk checksum mismatch"
            );
        }
        MigrateChunkAckPayload {
            migration_id: payload.migration_id,
            partition_id: payload.partition_id,
            chunk_index: payload.chunk_index,
            success: valid,
        }
    }

    /// Primary-side: resolves a pending chunk-ack wait.
    pub fn on_migrate_chunk_ack(&self, ack: &MigrateChunkAckPayload) {
        let key = format!("{}:{}", ack.migration_id, ack.chunk_index);
        if let Some((_, tx)) = self.chunk_acks.remove(&key) {
            let _ = tx.send(ack.success);
        }
    }

    /// Target-side: reassembles all chunks, verifies, stores, and builds the
    /// `MIGRATE_VERIFY` reply.
    pub async fn handle_migrate_complete(
        &self,
        payload: MigrateCompletePayload,
    ) -> MigrateVerifyPayload {
        let Some((_, entry)) = self.incoming.remove(&payload.migration_id) else {
            return MigrateVerifyPayload {
                migration_id: payload.migration_id,
                partition_id: payload.partition_id,
                success: false,
            };
        };
        let incoming = entry.into_inner();

        let success = 'verify: {
            if incoming.chunks.iter().any(Option::is_none) {
                break 'verify false;
            }
            let whole: Vec<u8> = incoming
                .chunks
                .into_iter()
                .flatten()
                .flat_map(|c| c.into_iter())
                .collect();
            if checksum64(&whole) != payload.checksum {
                break 'verify false;
            }
            let Some(records) = parse_records(&whole) else {
                break 'verify false;
            };
            if records.len() as u64 != payload.total_records {
                break 'verify false;
            }
            self.storer.store(payload.partition_id, records).await.is_ok()
        };

        if !success {
            warn!(
                migration_id = payload.migration_id,
                partition_id = payload.partition_id,
                "migration verify failed"
            );
        }

        MigrateVerifyPayload {
            migration_id: payload.migration_id,
            partition_id: payload.partition_id,
            success,
        }
    }

    /// Primary-side: resolves a pending verify wait.
    pub fn on_migrate_verify(&self, verify: &MigrateVerifyPayload) {
        if let Some((_, tx)) = self.verify_acks.remove(&verify.migration_id) {
            let _ = tx.send(verify.success);
        }
    }

    /// Stops the batch timer (caller-side), drops the queue, marks active
    /// migrations failed, and clears incoming state.
    pub fn cancel_all(&self) {
        self.queue.lock().clear();
        let active_partitions: Vec<u32> = self.active.iter().map(|e| *e.key()).collect();
        for partition_id in active_partitions {
            if let Some((_, entry)) = self.active.remove(&partition_id) {
                let outbound = entry.into_inner();
                let _ = self.events.send(MigrationEvent::MigrationFailed {
                    migration_id: outbound.migration_id,
                    partition_id,
                });
            }
        }
        self.incoming.clear();
        // Dropping the sender halves rejects any in-flight chunk/verify awaits.
        self.chunk_acks.clear();
        self.verify_acks.clear();
    }

    /// `true` if `partition_id` currently has an outbound migration in flight.
    #[must_use]
    pub fn is_migrating(&self, partition_id: u32) -> bool {
        self.active.contains_key(&partition_id)
    }

    /// Queues tasks directly, bypassing the old/new-snapshot diff `plan_migration`
    /// performs. Used when the caller (e.g. a rebalance plan) already knows
    /// exactly which tasks this node should source.
    pub fn enqueue(&self, tasks: Vec<MigrationTask>) {
        self.queue.lock().extend(tasks);
    }

    /// Cancels a single queued-or-active migration by partition ID. A no-op if
    /// the partition has no migration in flight.
    pub fn cancel_migration(&self, partition_id: u32) {
        self.queue.lock().retain(|t| t.partition_id != partition_id);
        if let Some((_, entry)) = self.active.remove(&partition_id) {
            let outbound = entry.into_inner();
            let _ = self.events.send(MigrationEvent::MigrationFailed {
                migration_id: outbound.migration_id,
                partition_id,
            });
        }
    }

    /// Snapshot of one active outbound migration, for diagnostics.
    #[must_use]
    pub fn active_migration(&self, partition_id: u32) -> Option<ActiveMigration> {
        self.active.get(&partition_id).map(|entry| {
            let outbound = entry.lock();
            ActiveMigration {
                migration_id: outbound.migration_id.clone(),
                partition_id,
                source: outbound.task.source.clone(),
                destination: outbound.task.destination.clone(),
                state: outbound.phase,
                started_at_ms: outbound.started_at_ms,
            }
        })
    }

    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }
}
