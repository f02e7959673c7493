//! `FailoverController`: promotes backups and reassigns ownership when a peer
//! is confirmed failed.
//!
//! Mirrors [`super::lock::LockManager`]'s shape: a `DashMap`-backed struct
//! mutated synchronously, paired with an `mpsc::UnboundedSender` of events
//! for the embedder to observe. The debounce window (`reassignmentDelayMs`,
//! SPEC_FULL.md §4.7) is implemented with a per-node generation counter --
//! each call to `on_confirmed_failed` bumps the counter and only the last
//! caller to wake up after the delay actually performs the reassignment,
//! so rapid repeated confirmations for the same node collapse into one pass.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::info;

use super::state::ClusterPartitionTable;
use super::types::ClusterConfig;

/// One partition's ownership change produced by a failover pass.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionOwnerChange {
    pub partition_id: u32,
    pub old_owner: String,
    pub new_owner: String,
}

/// Events emitted by a completed (or empty) failover pass.
#[derive(Debug, Clone, PartialEq)]
pub enum FailoverEvent {
    PartitionsReassigned {
        failed_node_id: String,
        changes: Vec<PartitionOwnerChange>,
    },
    FailoverComplete {
        failed_node_id: String,
        partitions_reassigned: usize,
        duration_ms: u64,
    },
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reacts to `nodeConfirmedFailed` by promoting a surviving backup (or the
/// deterministic fallback) to owner for every partition the failed node held.
pub struct FailoverController {
    reassignment_delay: Duration,
    backup_count: u32,
    /// Monotonic per-node debounce generation; only the latest scheduled
    /// reassignment for a given node actually runs.
    generations: DashMap<String, u64>,
    events_tx: mpsc::UnboundedSender<FailoverEvent>,
}

impl FailoverController {
    #[must_use]
    pub fn new(config: &ClusterConfig) -> (Self, mpsc::UnboundedReceiver<FailoverEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                reassignment_delay: Duration::from_millis(config.reassignment_delay_ms),
                backup_count: config.backup_count,
                generations: DashMap::new(),
                events_tx,
            },
            events_rx,
        )
    }

    /// Debounces and then runs a reassignment pass for `failed_node_id`.
    ///
    /// `alive_node_ids` must be every other currently-alive member, sorted
    /// (the deterministic fallback in step 3 of SPEC_FULL.md §4.7 depends on
    /// a stable order). Intended to be spawned as its own task per
    /// `nodeConfirmedFailed` event; cheap to call repeatedly for the same
    /// node since only the last call's sleep wins the race.
    pub async fn on_confirmed_failed(
        self: &Arc<Self>,
        failed_node_id: String,
        table: &ClusterPartitionTable,
        alive_node_ids: Vec<String>,
    ) {
        let generation = {
            let mut entry = self
                .generations
                .entry(failed_node_id.clone())
                .or_insert(0);
            *entry += 1;
            *entry
        };

        tokio::time::sleep(self.reassignment_delay).await;

        // A later confirmation for the same node superseded this one; let
        // that task's sleep perform the (single) reassignment instead.
        if self
            .generations
            .get(&failed_node_id)
            .is_some_and(|g| *g != generation)
        {
            return;
        }

        self.reassign(&failed_node_id, table, &alive_node_ids);
    }

    /// Runs one reassignment pass synchronously. Exposed separately from
    /// `on_confirmed_failed` so tests (and callers who already debounced
    /// externally) can drive it without waiting out the delay.
    pub fn reassign(
        &self,
        failed_node_id: &str,
        table: &ClusterPartitionTable,
        alive_node_ids: &[String],
    ) {
        let start = now_ms();
        let owned = table.partitions_for_node(failed_node_id);

        let mut changes = Vec::with_capacity(owned.len());
        for partition_id in owned {
            let Some(meta) = table.get_partition(partition_id) else {
                continue;
            };

            let new_owner = pick_new_owner(failed_node_id, &meta.backups, alive_node_ids, partition_id);
            let Some(new_owner) = new_owner else {
                // No alive node anywhere in the cluster -- nothing to promote to.
                continue;
            };

            let new_backups = rebuild_backups(
                &meta.backups,
                &new_owner,
                failed_node_id,
                alive_node_ids,
                self.backup_count,
            );

            table.set_owner(partition_id, new_owner.clone(), new_backups);
            changes.push(PartitionOwnerChange {
                partition_id,
                old_owner: meta.owner.clone(),
                new_owner,
            });
        }

        if changes.is_empty() {
            return;
        }

        table.increment_version();
        info!(
            failed_node_id,
            partitions = changes.len(),
            "failover reassigned partition ownership"
        );

        let partitions_reassigned = changes.len();
        let _ = self.events_tx.send(FailoverEvent::PartitionsReassigned {
            failed_node_id: failed_node_id.to_string(),
            changes,
        });
        let _ = self.events_tx.send(FailoverEvent::FailoverComplete {
            failed_node_id: failed_node_id.to_string(),
            partitions_reassigned,
            duration_ms: now_ms().saturating_sub(start),
        });
    }
}

/// Picks the new owner for a partition whose owner just failed: the first
/// still-alive node in its backup list, or -- if none of the backups
/// survived -- a deterministic pick from the sorted alive set.
fn pick_new_owner(
    failed_node_id: &str,
    backups: &[String],
    alive_node_ids: &[String],
    partition_id: u32,
) -> Option<String> {
    if let Some(promoted) = backups
        .iter()
        .find(|b| b.as_str() != failed_node_id && alive_node_ids.contains(b))
    {
        return Some(promoted.clone());
    }

    if alive_node_ids.is_empty() {
        return None;
    }
    let idx = (partition_id as usize) % alive_node_ids.len();
    Some(alive_node_ids[idx].clone())
}

/// Rebuilds a partition's backup list after a failover: drops the failed
/// node and the newly-promoted owner, keeps surviving backups in order, and
/// tops up from the alive pool (deterministically, by sorted node ID) up to
/// `backup_count`.
fn rebuild_backups(
    old_backups: &[String],
    new_owner: &str,
    failed_node_id: &str,
    alive_node_ids: &[String],
    backup_count: u32,
) -> Vec<String> {
    let mut backups: Vec<String> = old_backups
        .iter()
        .filter(|b| b.as_str() != failed_node_id && b.as_str() != new_owner)
        .cloned()
        .collect();

    let target = (backup_count as usize).min(alive_node_ids.len().saturating_sub(1));
    if backups.len() < target {
        let mut candidates: Vec<&String> = alive_node_ids
            .iter()
            .filter(|n| n.as_str() != new_owner && !backups.contains(n))
            .collect();
        candidates.sort();
        for candidate in candidates {
            if backups.len() >= target {
                break;
            }
            backups.push(candidate.clone());
        }
    }

    backups
}

/// Shared handle, suitable for spawning one debounce task per confirmed failure.
pub type SharedFailoverController = Arc<FailoverController>;

/// Builds the sorted "alive" list a `FailoverController` expects: every
/// member other than `excluded`, independent of how membership is tracked by
/// the caller (kept as a free function so callers with a `MembersView` or a
/// plain `HashMap` of liveness can both use it).
#[must_use]
pub fn sorted_alive_except(all_node_ids: &[String], excluded: &str) -> Vec<String> {
    let mut alive: Vec<String> = all_node_ids
        .iter()
        .filter(|n| n.as_str() != excluded)
        .cloned()
        .collect();
    alive.sort();
    alive
}

/// Convenience: derive the alive set from a `node_id -> is_alive` map,
/// excluding the failed node itself.
#[must_use]
pub fn alive_from_liveness(liveness: &HashMap<String, bool>, excluded: &str) -> Vec<String> {
    let mut alive: Vec<String> = liveness
        .iter()
        .filter(|(id, &is_alive)| is_alive && id.as_str() != excluded)
        .map(|(id, _)| id.clone())
        .collect();
    alive.sort();
    alive
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn table_with(entries: &[(u32, &str, &[&str])]) -> ClusterPartitionTable {
        let table = ClusterPartitionTable::new(entries.len() as u32);
        for (pid, owner, backups) in entries {
            table.set_owner(
                *pid,
                (*owner).to_string(),
                backups.iter().map(|b| (*b).to_string()).collect(),
            );
        }
        table
    }

    #[test]
    fn promotes_first_alive_backup() {
        let table = table_with(&[(0, "n1", &["n2", "n3"])]);
        let (controller, mut rx) = FailoverController::new(&ClusterConfig::default());

        controller.reassign("n1", &table, &["n2".to_string(), "n3".to_string()]);

        let meta = table.get_partition(0).unwrap();
        assert_eq!(meta.owner, "n2");

        match rx.try_recv().unwrap() {
            FailoverEvent::PartitionsReassigned { failed_node_id, changes } => {
                assert_eq!(failed_node_id, "n1");
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].new_owner, "n2");
                assert_eq!(changes[0].old_owner, "n1");
            }
            other => panic!("expected PartitionsReassigned, got {other:?}"),
        }
        match rx.try_recv().unwrap() {
            FailoverEvent::FailoverComplete { partitions_reassigned, .. } => {
                assert_eq!(partitions_reassigned, 1);
            }
            other => panic!("expected FailoverComplete, got {other:?}"),
        }
    }

    #[test]
    fn skips_dead_backup_promotes_next_alive() {
        // n2 is also dead (not in alive list); n3 should be promoted.
        let table = table_with(&[(0, "n1", &["n2", "n3"])]);
        let (controller, _rx) = FailoverController::new(&ClusterConfig::default());

        controller.reassign("n1", &table, &["n3".to_string()]);

        assert_eq!(table.get_partition(0).unwrap().owner, "n3");
    }

    #[test]
    fn no_alive_backup_falls_back_to_deterministic_pick() {
        // Partition 5 has no surviving backups; fallback = alive[5 % |alive|].
        let table = table_with(&[(5, "n1", &["n2"])]);
        let (controller, _rx) = FailoverController::new(&ClusterConfig::default());
        let alive = vec!["n3".to_string(), "n4".to_string()];

        controller.reassign("n1", &table, &alive);

        // 5 % 2 == 1 -> alive[1] == "n4"
        assert_eq!(table.get_partition(5).unwrap().owner, "n4");
    }

    #[test]
    fn no_alive_nodes_leaves_partition_untouched() {
        let table = table_with(&[(0, "n1", &[])]);
        let (controller, mut rx) = FailoverController::new(&ClusterConfig::default());

        controller.reassign("n1", &table, &[]);

        assert_eq!(table.get_partition(0).unwrap().owner, "n1");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn only_affected_partitions_are_touched() {
        let table = table_with(&[(0, "n1", &["n2"]), (1, "n2", &["n1"])]);
        let (controller, _rx) = FailoverController::new(&ClusterConfig::default());

        controller.reassign("n1", &table, &["n2".to_string()]);

        assert_eq!(table.get_partition(0).unwrap().owner, "n2");
        // Partition 1 was never owned by n1, so it is untouched.
        assert_eq!(table.get_partition(1).unwrap().owner, "n2");
    }

    #[test]
    fn version_bumps_once_per_pass_not_per_partition() {
        let table = table_with(&[(0, "n1", &["n2"]), (1, "n1", &["n2"])]);
        let before = table.version();
        let (controller, _rx) = FailoverController::new(&ClusterConfig::default());

        controller.reassign("n1", &table, &["n2".to_string()]);

        assert_eq!(table.version(), before + 1);
    }

    #[test]
    fn empty_changeset_does_not_bump_version() {
        let table = table_with(&[(0, "n2", &["n3"])]);
        let before = table.version();
        let (controller, mut rx) = FailoverController::new(&ClusterConfig::default());

        // n1 owns nothing here.
        controller.reassign("n1", &table, &["n2".to_string(), "n3".to_string()]);

        assert_eq!(table.version(), before);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn rebuild_backups_drops_failed_and_new_owner_tops_up() {
        let backups = rebuild_backups(
            &["n1".to_string(), "n2".to_string()],
            "n2",
            "n1",
            &["n2".to_string(), "n3".to_string(), "n4".to_string()],
            2,
        );
        assert!(!backups.contains(&"n1".to_string()));
        assert!(!backups.contains(&"n2".to_string()));
        assert_eq!(backups.len(), 2);
    }

    #[tokio::test]
    async fn rapid_repeated_failures_collapse_into_one_pass() {
        let table = Arc::new(table_with(&[(0, "n1", &["n2"])]));
        let config = ClusterConfig {
            reassignment_delay_ms: 30,
            ..ClusterConfig::default()
        };
        let (controller, mut rx) = FailoverController::new(&config);
        let controller = Arc::new(controller);

        // Fire three confirmations for the same node in quick succession;
        // only the last one's sleep should still be "current" when it wakes.
        let c1 = Arc::clone(&controller);
        let t1 = Arc::clone(&table);
        let h1 = tokio::spawn(async move {
            c1.on_confirmed_failed("n1".to_string(), &t1, vec!["n2".to_string()])
                .await;
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        let c2 = Arc::clone(&controller);
        let t2 = Arc::clone(&table);
        let h2 = tokio::spawn(async move {
            c2.on_confirmed_failed("n1".to_string(), &t2, vec!["n2".to_string()])
                .await;
        });

        h1.await.unwrap();
        h2.await.unwrap();

        // Only the superseding call's pass should have emitted events; the
        // stale one returned early without touching the table or channel.
        let mut reassigned_count = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, FailoverEvent::PartitionsReassigned { .. }) {
                reassigned_count += 1;
            }
        }
        assert_eq!(reassigned_count, 1);
        assert_eq!(table.get_partition(0).unwrap().owner, "n2");
    }
}
