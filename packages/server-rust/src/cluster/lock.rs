//! `LockManager`: per-name exclusive leases with monotonic fencing tokens.
//!
//! Grants are tracked in a `DashMap` keyed by lock name, mirroring the
//! `ClusterPartitionTable` pattern in [`super::state`]. Fencing tokens are
//! per-lock `u64` counters that only ever increase, so a stale lease holder
//! presenting an old token can always be detected by a downstream resource.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::errors::ClusterError;
use super::types::ClusterConfig;

/// One entry in a lock's FIFO wait queue.
#[derive(Debug, Clone, PartialEq)]
pub struct WaitQueueEntry {
    pub client_id: String,
    pub request_id: String,
    pub ttl_ms: u64,
}

/// Current state of a single named lock.
#[derive(Debug, Clone, PartialEq)]
struct LockEntry {
    owner: Option<String>,
    fencing_token: u64,
    expires_at_ms: u64,
    wait_queue: VecDeque<WaitQueueEntry>,
}

impl LockEntry {
    fn new() -> Self {
        Self {
            owner: None,
            fencing_token: 0,
            expires_at_ms: 0,
            wait_queue: VecDeque::new(),
        }
    }

    fn is_empty_and_unowned(&self) -> bool {
        self.owner.is_none() && self.wait_queue.is_empty()
    }
}

/// Outcome of an `acquire` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquireResult {
    pub granted: bool,
    pub fencing_token: Option<u64>,
}

/// Emitted once per grant, whether from `acquire`, `process_next`, or the sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct LockGranted {
    pub name: String,
    pub client_id: String,
    pub request_id: String,
    pub fencing_token: u64,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Manages exclusive, fenced leases over arbitrary named resources.
///
/// All mutation happens under the per-lock `DashMap` shard lock, so
/// `acquire`/`release`/`process_next` are each atomic with respect to a given
/// lock name without a global mutex -- the same trade-off `ClusterPartitionTable`
/// makes for per-partition state.
pub struct LockManager {
    locks: DashMap<String, LockEntry>,
    min_ttl_ms: u64,
    max_ttl_ms: u64,
    granted_tx: mpsc::UnboundedSender<LockGranted>,
}

impl LockManager {
    /// Creates an empty lock manager and returns the receiver for `lockGranted` events.
    #[must_use]
    pub fn new(config: &ClusterConfig) -> (Self, mpsc::UnboundedReceiver<LockGranted>) {
        let (granted_tx, granted_rx) = mpsc::unbounded_channel();
        (
            Self {
                locks: DashMap::new(),
                min_ttl_ms: config.lock_min_ttl_ms,
                max_ttl_ms: config.lock_max_ttl_ms,
                granted_tx,
            },
            granted_rx,
        )
    }

    fn clamp_ttl(&self, ttl_ms: i64) -> u64 {
        if ttl_ms <= 0 {
            self.min_ttl_ms
        } else {
            (ttl_ms as u64).clamp(self.min_ttl_ms, self.max_ttl_ms)
        }
    }

    /// Requests (or extends) a lock. See SPEC_FULL.md §4.8 for the full state machine.
    pub fn acquire(
        &self,
        name: &str,
        client_id: &str,
        request_id: &str,
        ttl_ms: i64,
    ) -> AcquireResult {
        let ttl = self.clamp_ttl(ttl_ms);
        let now = now_ms();
        let mut entry = self.locks.entry(name.to_string()).or_insert_with(LockEntry::new);

        let expired = entry.owner.is_some() && entry.expires_at_ms < now;
        if entry.owner.is_none() || expired {
            entry.owner = Some(client_id.to_string());
            entry.expires_at_ms = now + ttl;
            entry.fencing_token += 1;
            debug!(lock = name, client_id, token = entry.fencing_token, "lock granted");
            return AcquireResult {
                granted: true,
                fencing_token: Some(entry.fencing_token),
            };
        }

        if entry.owner.as_deref() == Some(client_id) {
            entry.expires_at_ms = entry.expires_at_ms.max(now + ttl);
            return AcquireResult {
                granted: true,
                fencing_token: Some(entry.fencing_token),
            };
        }

        entry.wait_queue.push_back(WaitQueueEntry {
            client_id: client_id.to_string(),
            request_id: request_id.to_string(),
            ttl_ms: ttl,
        });
        AcquireResult {
            granted: false,
            fencing_token: None,
        }
    }

    /// Releases a lock held with a matching fencing token, then advances the queue.
    pub fn release(
        &self,
        name: &str,
        client_id: &str,
        token: u64,
    ) -> Result<(), ClusterError> {
        let owner_matches = {
            let entry = self.locks.get(name).ok_or_else(|| ClusterError::LockNotOwner {
                name: name.to_string(),
                client_id: client_id.to_string(),
            })?;
            if entry.owner.as_deref() != Some(client_id) {
                return Err(ClusterError::LockNotOwner {
                    name: name.to_string(),
                    client_id: client_id.to_string(),
                });
            }
            if entry.fencing_token != token {
                return Err(ClusterError::LockTokenMismatch {
                    name: name.to_string(),
                    expected: entry.fencing_token,
                    actual: token,
                });
            }
            true
        };

        if owner_matches {
            self.process_next(name);
        }
        Ok(())
    }

    /// Clears the current owner and grants to the queue head, if any.
    ///
    /// Deletes the lock entirely when the queue is also empty afterwards.
    fn process_next(&self, name: &str) {
        let mut delete = false;
        let mut granted = None;

        if let Some(mut entry) = self.locks.get_mut(name) {
            entry.owner = None;
            entry.expires_at_ms = 0;

            if let Some(next) = entry.wait_queue.pop_front() {
                entry.fencing_token += 1;
                entry.owner = Some(next.client_id.clone());
                entry.expires_at_ms = now_ms() + next.ttl_ms;
                granted = Some(LockGranted {
                    name: name.to_string(),
                    client_id: next.client_id,
                    request_id: next.request_id,
                    fencing_token: entry.fencing_token,
                });
            } else {
                delete = entry.is_empty_and_unowned();
            }
        }

        if delete {
            self.locks.remove(name);
        }
        if let Some(event) = granted {
            debug!(lock = name, client_id = %event.client_id, token = event.fencing_token, "lock granted from queue");
            let _ = self.granted_tx.send(event);
        }
    }

    /// Scans every lock, expiring owned-but-stale leases and deleting dead entries.
    ///
    /// Run on an interval timer (`lock_sweep_interval_ms`, default 1 s).
    pub fn sweep(&self) {
        let now = now_ms();
        let expired_or_empty: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| {
                let owned_expired = entry.owner.is_some() && entry.expires_at_ms < now;
                let unowned_empty = entry.is_empty_and_unowned();
                owned_expired || unowned_empty
            })
            .map(|entry| entry.key().clone())
            .collect();

        for name in expired_or_empty {
            self.process_next(&name);
        }
    }

    /// Releases or dequeues every trace of a disconnected client across all locks.
    pub fn handle_client_disconnect(&self, client_id: &str) {
        let owned_locks: Vec<String> = self
            .locks
            .iter()
            .filter(|entry| entry.owner.as_deref() == Some(client_id))
            .map(|entry| entry.key().clone())
            .collect();

        for name in &owned_locks {
            self.process_next(name);
        }

        for mut entry in self.locks.iter_mut() {
            entry.wait_queue.retain(|w| w.client_id != client_id);
        }

        let empties: Vec<String> = self
            .locks
            .iter()
            .filter(|e| e.is_empty_and_unowned())
            .map(|e| e.key().clone())
            .collect();
        for name in empties {
            self.locks.remove(&name);
        }

        if !owned_locks.is_empty() {
            warn!(client_id, released = owned_locks.len(), "released locks on client disconnect");
        }
    }

    /// Returns the current fencing token for a lock, if it exists.
    #[must_use]
    pub fn fencing_token(&self, name: &str) -> Option<u64> {
        self.locks.get(name).map(|e| e.fencing_token)
    }

    /// Number of locks currently tracked (owned or with a non-empty queue).
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Shared handle, suitable for use from multiple connection-handler tasks.
pub type SharedLockManager = Arc<LockManager>;

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (LockManager, mpsc::UnboundedReceiver<LockGranted>) {
        LockManager::new(&ClusterConfig::default())
    }

    #[test]
    fn first_acquire_grants_token_one() {
        let (mgr, _rx) = manager();
        let result = mgr.acquire("r", "c1", "q1", 1000);
        assert_eq!(result, AcquireResult { granted: true, fencing_token: Some(1) });
    }

    #[test]
    fn second_client_is_queued() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        let result = mgr.acquire("r", "c2", "q2", 1000);
        assert_eq!(result, AcquireResult { granted: false, fencing_token: None });
    }

    #[test]
    fn same_owner_extends_without_bumping_token() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        let result = mgr.acquire("r", "c1", "q2", 2000);
        assert_eq!(result, AcquireResult { granted: true, fencing_token: Some(1) });
    }

    #[test]
    fn negative_or_zero_ttl_clamps_to_minimum() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", -5);
        // min_ttl_ms default is 1000; expiry should be ~now+1000, not negative.
        assert!(mgr.fencing_token("r").is_some());
    }

    #[test]
    fn release_wrong_owner_fails() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        let err = mgr.release("r", "c2", 1).unwrap_err();
        assert!(matches!(err, ClusterError::LockNotOwner { .. }));
    }

    #[test]
    fn release_wrong_token_fails() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        let err = mgr.release("r", "c1", 99).unwrap_err();
        assert!(matches!(err, ClusterError::LockTokenMismatch { .. }));
    }

    #[test]
    fn release_promotes_queue_head_with_bumped_token() {
        let (mgr, mut rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        mgr.acquire("r", "c2", "q2", 1000);
        mgr.acquire("r", "c3", "q3", 1000);

        mgr.release("r", "c1", 1).unwrap();

        let event = rx.try_recv().expect("expected lockGranted event");
        assert_eq!(event.client_id, "c2");
        assert_eq!(event.fencing_token, 2);
    }

    #[test]
    fn release_with_empty_queue_deletes_lock() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        mgr.release("r", "c1", 1).unwrap();
        assert!(mgr.fencing_token("r").is_none());
        assert!(mgr.is_empty());
    }

    #[test]
    fn disconnect_frees_lock_and_skips_queued_client() {
        let (mgr, mut rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        mgr.acquire("r", "c2", "q2", 1000);
        mgr.acquire("r", "c3", "q3", 1000);

        mgr.handle_client_disconnect("c2");
        mgr.release("r", "c1", 1).unwrap();

        let event = rx.try_recv().expect("expected lockGranted event");
        assert_eq!(event.client_id, "c3");
        assert_eq!(event.fencing_token, 2);
    }

    #[test]
    fn disconnect_of_owner_promotes_next() {
        let (mgr, mut rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        mgr.acquire("r", "c2", "q2", 1000);

        mgr.handle_client_disconnect("c1");

        let event = rx.try_recv().expect("expected lockGranted event");
        assert_eq!(event.client_id, "c2");
        assert_eq!(event.fencing_token, 2);
    }

    #[test]
    fn fencing_token_strictly_increases_across_grants() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", 1000);
        mgr.acquire("r", "c2", "q2", 1000);
        let t1 = mgr.fencing_token("r").unwrap();
        mgr.release("r", "c1", t1).unwrap();
        let t2 = mgr.fencing_token("r").unwrap();
        assert!(t2 > t1);
    }

    #[test]
    fn sweep_is_noop_on_fresh_locks() {
        let (mgr, _rx) = manager();
        mgr.acquire("r", "c1", "q1", 60_000);
        mgr.sweep();
        assert_eq!(mgr.fencing_token("r"), Some(1));
    }
}
