//! Resource manager: atomic, FIFO-fair locks on named resources.
//!
//! Every device access by a sequence happens under a lock granted here.
//! Requests are all-or-nothing: a requester either receives every resource
//! of its claim set at once or waits holding none of them, so no two
//! sequences can each hold part of what the other needs.
//!
//! # Fairness
//!
//! Waiters are kept in a single queue in request order. A waiter is granted
//! only when its claims are compatible with the current holders *and* no
//! earlier waiter still in the queue conflicts with it on any resource. A
//! later request therefore never overtakes an earlier conflicting one.
//!
//! # Lock lifecycle
//!
//! ```text
//! acquire() ──▶ Queued ──grant──▶ Held ──release()──▶ Released
//!                  │
//!                  └── timeout / cancel: queue entry removed
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use iic_core::error::{SeqResult, SequenceError};
use iic_core::ids::SequenceId;
use iic_core::resource::{LockMode, ResourceClaim, ResourceName, ResourceRegistry};

/// State of one (sequence, resource) lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Waiting in the queue.
    Queued,
    /// Granted.
    Held,
    /// Returned to the manager.
    Released,
}

/// Resources granted to one sequence by a single acquisition.
///
/// Claims are kept in global (lexicographic) order; release walks them in
/// reverse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockSet {
    id: u64,
    sequence: SequenceId,
    claims: Vec<ResourceClaim>,
}

impl LockSet {
    /// Manager-assigned identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Owning sequence.
    pub fn sequence(&self) -> SequenceId {
        self.sequence
    }

    /// Claims granted, in acquisition order.
    pub fn claims(&self) -> &[ResourceClaim] {
        &self.claims
    }

    /// Mode in which `name` was granted, if it is part of the set.
    pub fn mode_of(&self, name: &ResourceName) -> Option<LockMode> {
        self.claims.iter().find(|c| &c.name == name).map(|c| c.mode)
    }
}

/// One row of a [`LockManager::snapshot`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockView {
    /// Requesting or holding sequence.
    pub sequence: SequenceId,
    /// Resource.
    pub resource: ResourceName,
    /// Requested or held mode.
    pub mode: LockMode,
    /// `Queued` or `Held`.
    pub state: LockState,
}

#[derive(Debug, Clone)]
struct Holding {
    set: u64,
    sequence: SequenceId,
    mode: LockMode,
}

#[derive(Debug)]
struct ActiveSet {
    sequence: SequenceId,
    remaining: Vec<ResourceClaim>,
}

#[derive(Debug)]
struct Waiter {
    ticket: u64,
    set: u64,
    sequence: SequenceId,
    claims: Vec<ResourceClaim>,
    grant: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct LockTable {
    holders: BTreeMap<ResourceName, Vec<Holding>>,
    active: HashMap<u64, ActiveSet>,
    queue: VecDeque<Waiter>,
    next_ticket: u64,
}

fn conflicts(a: &[ResourceClaim], b: &[ResourceClaim]) -> bool {
    a.iter().any(|x| {
        b.iter()
            .any(|y| x.name == y.name && !x.mode.compatible_with(y.mode))
    })
}

impl LockTable {
    fn compatible_with_holders(&self, claims: &[ResourceClaim]) -> bool {
        claims.iter().all(|claim| {
            self.holders
                .get(&claim.name)
                .map_or(true, |hs| hs.iter().all(|h| h.mode.compatible_with(claim.mode)))
        })
    }

    fn blocking_holders(&self, claims: &[ResourceClaim]) -> Vec<String> {
        claims
            .iter()
            .filter(|claim| {
                self.holders.get(&claim.name).is_some_and(|hs| {
                    hs.iter().any(|h| !h.mode.compatible_with(claim.mode))
                })
            })
            .map(|claim| claim.name.to_string())
            .collect()
    }

    fn grantable_now(&self, claims: &[ResourceClaim]) -> bool {
        self.compatible_with_holders(claims)
            && !self.queue.iter().any(|w| conflicts(&w.claims, claims))
    }

    /// A sequence waiting on a lock it already holds incompatibly would wait forever.
    fn check_reentrant(&self, sequence: SequenceId, claims: &[ResourceClaim]) -> SeqResult<()> {
        for claim in claims {
            let held = self.holders.get(&claim.name).and_then(|hs| {
                hs.iter()
                    .find(|h| h.sequence == sequence && !h.mode.compatible_with(claim.mode))
            });
            if let Some(h) = held {
                return Err(SequenceError::invalid(format!(
                    "deadlock-prone request: {} already holds '{}' as {} and requests {}",
                    sequence, claim.name, h.mode, claim.mode
                )));
            }
        }
        Ok(())
    }

    fn insert_holdings(&mut self, set: u64, sequence: SequenceId, claims: &[ResourceClaim]) {
        for claim in claims {
            self.holders
                .entry(claim.name.clone())
                .or_default()
                .push(Holding {
                    set,
                    sequence,
                    mode: claim.mode,
                });
        }
        self.active.insert(
            set,
            ActiveSet {
                sequence,
                remaining: claims.to_vec(),
            },
        );
    }

    fn remove_holding(&mut self, set: u64, name: &ResourceName) {
        if let Some(hs) = self.holders.get_mut(name) {
            hs.retain(|h| h.set != set);
            if hs.is_empty() {
                self.holders.remove(name);
            }
        }
    }

    /// Drops every remaining holding of `set`, newest first. Returns false if
    /// the set was already released.
    fn release_set(&mut self, set: u64) -> bool {
        let Some(active) = self.active.remove(&set) else {
            return false;
        };
        for claim in active.remaining.iter().rev() {
            self.remove_holding(set, &claim.name);
            debug!(
                sequence_id = %active.sequence,
                resource = %claim.name,
                mode = %claim.mode,
                "lock released"
            );
        }
        true
    }

    fn remove_waiter(&mut self, ticket: u64) -> bool {
        let before = self.queue.len();
        self.queue.retain(|w| w.ticket != ticket);
        self.queue.len() != before
    }

    /// Grants every waiter that has become grantable, in queue order.
    fn pump(&mut self) {
        let waiters = std::mem::take(&mut self.queue);
        let mut blocked: Vec<ResourceClaim> = Vec::new();
        for waiter in waiters {
            if self.compatible_with_holders(&waiter.claims) && !conflicts(&blocked, &waiter.claims)
            {
                self.insert_holdings(waiter.set, waiter.sequence, &waiter.claims);
                if waiter.grant.send(()).is_err() {
                    // Requester went away between queueing and grant.
                    self.release_set(waiter.set);
                    continue;
                }
                debug!(
                    sequence_id = %waiter.sequence,
                    resources = ?waiter.claims.iter().map(|c| c.name.as_str()).collect::<Vec<_>>(),
                    "queued lock granted"
                );
            } else {
                blocked.extend(waiter.claims.iter().cloned());
                self.queue.push_back(waiter);
            }
        }
    }
}

/// Removes a queue entry (or rolls back a grant nobody collected) when the
/// acquiring future is dropped.
struct QueueGuard<'a> {
    manager: &'a LockManager,
    ticket: u64,
    set: u64,
    armed: bool,
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut table = self.manager.table.lock();
        if !table.remove_waiter(self.ticket) {
            table.release_set(self.set);
        }
        table.pump();
    }
}

/// Grants and releases locks on registered resources.
///
/// Shared by every running sequence; all methods take `&self`.
pub struct LockManager {
    registry: Arc<ResourceRegistry>,
    table: Mutex<LockTable>,
    next_set: AtomicU64,
}

impl LockManager {
    /// Creates a manager over `registry`.
    pub fn new(registry: Arc<ResourceRegistry>) -> Self {
        Self {
            registry,
            table: Mutex::new(LockTable::default()),
            next_set: AtomicU64::new(1),
        }
    }

    /// Registry the manager validates against.
    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    fn prepare(&self, claims: &[ResourceClaim]) -> SeqResult<Vec<ResourceClaim>> {
        if claims.is_empty() {
            return Err(SequenceError::invalid("empty claim set"));
        }
        self.registry.validate(claims)
    }

    /// Grants `claims` immediately or fails with [`SequenceError::Busy`].
    ///
    /// Nothing is queued on failure.
    pub fn try_acquire(
        &self,
        sequence: SequenceId,
        claims: &[ResourceClaim],
    ) -> SeqResult<LockSet> {
        let claims = self.prepare(claims)?;
        let mut table = self.table.lock();
        table.check_reentrant(sequence, &claims)?;
        if !table.grantable_now(&claims) {
            let mut resources = table.blocking_holders(&claims);
            if resources.is_empty() {
                resources = claims.iter().map(|c| c.name.to_string()).collect();
            }
            return Err(SequenceError::Busy { resources });
        }
        let set = self.next_set.fetch_add(1, Ordering::Relaxed);
        table.insert_holdings(set, sequence, &claims);
        debug!(sequence_id = %sequence, set, "locks granted immediately");
        Ok(LockSet {
            id: set,
            sequence,
            claims,
        })
    }

    /// Acquires every claim atomically, queueing for at most `timeout`.
    ///
    /// Fails with [`SequenceError::Invalid`] for requests that can never be
    /// granted and [`SequenceError::Timeout`] when the wait expires; in the
    /// latter case the queue entry is removed. Dropping the returned future
    /// while queued withdraws the request.
    pub async fn acquire(
        &self,
        sequence: SequenceId,
        claims: &[ResourceClaim],
        timeout: Duration,
    ) -> SeqResult<LockSet> {
        let claims = self.prepare(claims)?;
        let set = self.next_set.fetch_add(1, Ordering::Relaxed);

        let (rx, ticket) = {
            let mut table = self.table.lock();
            table.check_reentrant(sequence, &claims)?;
            if table.grantable_now(&claims) {
                table.insert_holdings(set, sequence, &claims);
                debug!(sequence_id = %sequence, set, "locks granted");
                return Ok(LockSet {
                    id: set,
                    sequence,
                    claims,
                });
            }
            let (tx, rx) = oneshot::channel();
            let ticket = table.next_ticket;
            table.next_ticket += 1;
            table.queue.push_back(Waiter {
                ticket,
                set,
                sequence,
                claims: claims.clone(),
                grant: tx,
            });
            info!(
                sequence_id = %sequence,
                blocked_by = ?table.blocking_holders(&claims),
                queue_len = table.queue.len(),
                "lock request queued"
            );
            (rx, ticket)
        };

        let mut guard = QueueGuard {
            manager: self,
            ticket,
            set,
            armed: true,
        };
        let started = Instant::now();
        let granted = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => true,
            Ok(Err(_)) | Err(_) => {
                let mut table = self.table.lock();
                if table.remove_waiter(ticket) {
                    table.pump();
                    false
                } else {
                    // Granted between the deadline and taking the lock.
                    table.active.contains_key(&set)
                }
            }
        };
        guard.armed = false;

        if granted {
            Ok(LockSet {
                id: set,
                sequence,
                claims,
            })
        } else {
            let waited = started.elapsed();
            warn!(
                sequence_id = %sequence,
                waited_ms = waited.as_millis() as u64,
                "lock request timed out"
            );
            Err(SequenceError::Timeout {
                resources: claims.iter().map(|c| c.name.to_string()).collect(),
                waited_ms: waited.as_millis() as u64,
            })
        }
    }

    /// Releases every lock of `set` still held, in reverse acquisition order.
    ///
    /// Idempotent: returns `false` when the set was already released.
    pub fn release(&self, set: &LockSet) -> bool {
        let mut table = self.table.lock();
        let released = table.release_set(set.id);
        if released {
            table.pump();
        }
        released
    }

    /// Releases the named resources of `set`, keeping the rest held.
    ///
    /// Names not held by `set` are ignored. Returns how many locks were released.
    pub fn release_resources(&self, set: &LockSet, names: &[ResourceName]) -> usize {
        let mut table = self.table.lock();
        let Some(active) = table.active.get_mut(&set.id) else {
            return 0;
        };
        let (dropped, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut active.remaining)
            .into_iter()
            .partition(|c| names.contains(&c.name));
        active.remaining = kept;
        let sequence = active.sequence;
        if active.remaining.is_empty() {
            table.active.remove(&set.id);
        }
        for claim in dropped.iter().rev() {
            table.remove_holding(set.id, &claim.name);
            debug!(sequence_id = %sequence, resource = %claim.name, "lock released");
        }
        if !dropped.is_empty() {
            table.pump();
        }
        dropped.len()
    }

    /// Current state of `set`.
    pub fn state_of(&self, set: &LockSet) -> LockState {
        if self.table.lock().active.contains_key(&set.id) {
            LockState::Held
        } else {
            LockState::Released
        }
    }

    /// Whether any sequence holds a lock on `name`.
    pub fn is_held(&self, name: &ResourceName) -> bool {
        self.table.lock().holders.contains_key(name)
    }

    /// Locks currently held by `sequence`.
    pub fn held_by(&self, sequence: SequenceId) -> Vec<ResourceClaim> {
        let table = self.table.lock();
        table
            .holders
            .iter()
            .flat_map(|(name, hs)| {
                hs.iter()
                    .filter(|h| h.sequence == sequence)
                    .map(|h| ResourceClaim {
                        name: name.clone(),
                        mode: h.mode,
                    })
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Number of queued requests.
    pub fn queue_len(&self) -> usize {
        self.table.lock().queue.len()
    }

    /// Held and queued locks, held first.
    pub fn snapshot(&self) -> Vec<LockView> {
        let table = self.table.lock();
        let held = table.holders.iter().flat_map(|(name, hs)| {
            hs.iter().map(move |h| LockView {
                sequence: h.sequence,
                resource: name.clone(),
                mode: h.mode,
                state: LockState::Held,
            })
        });
        let queued = table.queue.iter().flat_map(|w| {
            w.claims.iter().map(move |c| LockView {
                sequence: w.sequence,
                resource: c.name.clone(),
                mode: c.mode,
                state: LockState::Queued,
            })
        });
        held.chain(queued).collect()
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let table = self.table.lock();
        f.debug_struct("LockManager")
            .field("resources", &self.registry.len())
            .field("held", &table.holders.len())
            .field("queued", &table.queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> Arc<LockManager> {
        let registry = ResourceRegistry::new()
            .with_exclusive("arm:b1")
            .with_exclusive("arm:r1")
            .with_shared("lamp:halogen");
        Arc::new(LockManager::new(Arc::new(registry)))
    }

    fn excl(name: &str) -> ResourceClaim {
        ResourceClaim::exclusive(ResourceName::new(name))
    }

    fn shared(name: &str) -> ResourceClaim {
        ResourceClaim::shared(ResourceName::new(name))
    }

    #[test]
    fn try_acquire_reports_busy() {
        let mgr = manager();
        let held = mgr.try_acquire(SequenceId(1), &[excl("arm:b1")]).unwrap();
        let err = mgr.try_acquire(SequenceId(2), &[excl("arm:b1")]).unwrap_err();
        assert_eq!(
            err,
            SequenceError::Busy {
                resources: vec!["arm:b1".into()]
            }
        );
        assert!(mgr.release(&held));
        assert!(mgr.try_acquire(SequenceId(2), &[excl("arm:b1")]).is_ok());
    }

    #[test]
    fn shared_locks_coexist_but_exclude_writers() {
        let mgr = manager();
        let a = mgr.try_acquire(SequenceId(1), &[shared("lamp:halogen")]).unwrap();
        let b = mgr.try_acquire(SequenceId(2), &[shared("lamp:halogen")]).unwrap();
        assert!(mgr.try_acquire(SequenceId(3), &[excl("lamp:halogen")]).is_err());
        mgr.release(&a);
        assert!(mgr.try_acquire(SequenceId(3), &[excl("lamp:halogen")]).is_err());
        mgr.release(&b);
        assert!(mgr.try_acquire(SequenceId(3), &[excl("lamp:halogen")]).is_ok());
    }

    #[test]
    fn invalid_requests_are_rejected() {
        let mgr = manager();
        let unknown = mgr.try_acquire(SequenceId(1), &[excl("hexapod:sm9")]);
        assert!(matches!(unknown, Err(SequenceError::Invalid { .. })));

        let self_conflict =
            mgr.try_acquire(SequenceId(1), &[excl("arm:b1"), shared("arm:b1")]);
        assert!(matches!(self_conflict, Err(SequenceError::Invalid { .. })));

        let empty = mgr.try_acquire(SequenceId(1), &[]);
        assert!(matches!(empty, Err(SequenceError::Invalid { .. })));
    }

    #[test]
    fn reentrant_incompatible_request_is_invalid() {
        let mgr = manager();
        let _held = mgr.try_acquire(SequenceId(1), &[shared("lamp:halogen")]).unwrap();
        let err = mgr
            .try_acquire(SequenceId(1), &[excl("lamp:halogen")])
            .unwrap_err();
        assert!(err.to_string().contains("deadlock-prone"));
    }

    #[test]
    fn release_is_idempotent() {
        let mgr = manager();
        let set = mgr
            .try_acquire(SequenceId(1), &[excl("arm:r1"), excl("arm:b1")])
            .unwrap();
        assert_eq!(set.claims()[0].name.as_str(), "arm:b1");
        assert_eq!(mgr.state_of(&set), LockState::Held);
        assert!(mgr.release(&set));
        assert!(!mgr.release(&set));
        assert_eq!(mgr.state_of(&set), LockState::Released);
        assert!(mgr.snapshot().is_empty());
    }

    #[test]
    fn partial_release_keeps_remaining_locks() {
        let mgr = manager();
        let set = mgr
            .try_acquire(SequenceId(1), &[excl("arm:b1"), shared("lamp:halogen")])
            .unwrap();
        assert_eq!(
            mgr.release_resources(&set, &[ResourceName::new("lamp:halogen")]),
            1
        );
        assert!(mgr.is_held(&ResourceName::new("arm:b1")));
        assert!(!mgr.is_held(&ResourceName::new("lamp:halogen")));
        assert_eq!(
            mgr.release_resources(&set, &[ResourceName::new("lamp:halogen")]),
            0
        );
        assert!(mgr.release(&set));
        assert!(!mgr.is_held(&ResourceName::new("arm:b1")));
    }

    #[tokio::test(start_paused = true)]
    async fn queued_request_is_granted_on_release() {
        let mgr = manager();
        let held = mgr.try_acquire(SequenceId(1), &[excl("arm:b1")]).unwrap();

        let waiter = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.acquire(SequenceId(2), &[excl("arm:b1")], Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mgr.queue_len(), 1);
        assert!(mgr
            .snapshot()
            .iter()
            .any(|v| v.sequence == SequenceId(2) && v.state == LockState::Queued));

        mgr.release(&held);
        let granted = waiter.await.unwrap().unwrap();
        assert_eq!(granted.sequence(), SequenceId(2));
        assert_eq!(mgr.held_by(SequenceId(2)).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn queued_acquire_is_pending_until_release() {
        let mgr = manager();
        let held = mgr.try_acquire(SequenceId(1), &[excl("arm:r1")]).unwrap();
        let claims = [excl("arm:r1"), shared("lamp:halogen")];
        let mut waiter = tokio_test::task::spawn(mgr.acquire(
            SequenceId(2),
            &claims,
            Duration::from_secs(30),
        ));
        tokio_test::assert_pending!(waiter.poll());
        tokio_test::assert_pending!(waiter.poll());

        mgr.release(&held);
        assert!(waiter.is_woken());
        let granted = tokio_test::assert_ready_ok!(waiter.poll());
        assert_eq!(granted.claims().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_removes_queue_entry() {
        let mgr = manager();
        let _held = mgr.try_acquire(SequenceId(1), &[excl("arm:b1")]).unwrap();
        let err = mgr
            .acquire(SequenceId(2), &[excl("arm:b1")], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, SequenceError::Timeout { .. }));
        assert_eq!(mgr.queue_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fifo_order_is_respected() {
        let mgr = manager();
        let held = mgr.try_acquire(SequenceId(1), &[excl("arm:b1")]).unwrap();

        // Sequence 2 wants b1 and r1; sequence 3 only r1, which is free. It
        // must still wait behind 2 because 2 asked first.
        let second = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.acquire(
                    SequenceId(2),
                    &[excl("arm:b1"), excl("arm:r1")],
                    Duration::from_secs(60),
                )
                .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let third = mgr.try_acquire(SequenceId(3), &[excl("arm:r1")]);
        assert!(matches!(third, Err(SequenceError::Busy { .. })));

        mgr.release(&held);
        let second = second.await.unwrap().unwrap();
        assert_eq!(second.claims().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_does_not_keep_locks() {
        let mgr = manager();
        let held = mgr.try_acquire(SequenceId(1), &[excl("arm:b1")]).unwrap();
        let task = {
            let mgr = mgr.clone();
            tokio::spawn(async move {
                mgr.acquire(SequenceId(2), &[excl("arm:b1")], Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        task.abort();
        let _ = task.await;
        assert_eq!(mgr.queue_len(), 0);
        mgr.release(&held);
        assert!(!mgr.is_held(&ResourceName::new("arm:b1")));
    }

    #[tokio::test]
    async fn concurrent_double_release_releases_once() {
        let mgr = manager();
        let set = mgr.try_acquire(SequenceId(1), &[excl("arm:b1")]).unwrap();
        let (a, b) = tokio::join!(
            {
                let mgr = mgr.clone();
                let set = set.clone();
                async move { mgr.release(&set) }
            },
            {
                let mgr = mgr.clone();
                let set = set.clone();
                async move { mgr.release(&set) }
            }
        );
        assert!(a ^ b, "exactly one release must take effect");
    }
}
