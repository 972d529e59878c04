//! Coordination store contract and an in-memory implementation

use crate::error::{ElectionError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

/// Handle of a store-side lease
pub type LeaseId = i64;

/// A record as returned by the coordination store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    /// Number of writes since creation; 0 marks a deleted record
    pub version: i64,
    pub lease: LeaseId,
}

impl KeyValue {
    /// Marker record carried by delete events
    fn tombstone(key: &str, revision: i64) -> Self {
        Self {
            key: key.to_string(),
            value: Vec::new(),
            create_revision: 0,
            mod_revision: revision,
            version: 0,
            lease: 0,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.version == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

/// A change delivered on a watch stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
}

/// What a watch subscribes to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Key(String),
    Prefix(String),
}

impl WatchTarget {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Key(k) => k == key,
            Self::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key {}", key),
            Self::Prefix(prefix) => write!(f, "prefix {}", prefix),
        }
    }
}

/// An open watch subscription. Dropping it cancels the subscription.
#[derive(Debug)]
pub struct Watch {
    target: WatchTarget,
    events: mpsc::UnboundedReceiver<WatchEvent>,
}

impl Watch {
    pub fn new(target: WatchTarget, events: mpsc::UnboundedReceiver<WatchEvent>) -> Self {
        Self { target, events }
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Next event in revision order, `None` once the store closed the stream
    pub async fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().await
    }
}

/// Outcome of the create-if-absent transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnOutcome {
    /// The key was absent and is now bound to the lease
    Succeeded,
    /// The key already existed; nothing was written
    CompareFailed,
}

/// Operations consumed from the strongly-consistent coordination store
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Read one key. A missing key is `ElectionError::KeyNotFound`.
    async fn get(&self, key: &str) -> Result<KeyValue>;

    /// Read every live key under a prefix
    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>>;

    /// Grant a lease with the given TTL
    async fn lease_grant(&self, ttl_secs: u64) -> Result<LeaseId>;

    /// Renew a lease once
    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<()>;

    /// Single transaction: if `mod_revision(key) == 0` put `value` bound to `lease`, else no-op
    async fn create_if_absent(&self, key: &str, value: Vec<u8>, lease: LeaseId)
        -> Result<TxnOutcome>;

    /// Subscribe to changes on a key or a prefix
    async fn watch(&self, target: WatchTarget) -> Result<Watch>;

    /// Lightweight liveness probe
    async fn ping(&self) -> Result<()>;
}

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct Watcher {
    target: WatchTarget,
    tx: mpsc::UnboundedSender<WatchEvent>,
}

#[derive(Default)]
struct StoreState {
    revision: i64,
    data: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease_id: LeaseId,
    watchers: Vec<Watcher>,
}

impl StoreState {
    fn notify(&mut self, event: WatchEvent) {
        self.watchers.retain(|watcher| {
            if watcher.target.matches(&event.kv.key) {
                watcher.tx.send(event.clone()).is_ok()
            } else {
                !watcher.tx.is_closed()
            }
        });
    }

    fn put_key(&mut self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<i64> {
        if lease != 0 && !self.leases.contains_key(&lease) {
            return Err(ElectionError::LeaseNotFound(lease));
        }

        self.revision += 1;
        let revision = self.revision;

        let previous = self.data.get(key).cloned();
        if let Some(prev) = &previous {
            if prev.lease != 0 && prev.lease != lease {
                if let Some(entry) = self.leases.get_mut(&prev.lease) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(entry) = self.leases.get_mut(&lease) {
            entry.keys.insert(key.to_string());
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: previous.as_ref().map_or(revision, |p| p.create_revision),
            mod_revision: revision,
            version: previous.as_ref().map_or(1, |p| p.version + 1),
            lease,
        };
        self.data.insert(key.to_string(), kv.clone());
        self.notify(WatchEvent {
            kind: WatchEventKind::Put,
            kv,
        });

        Ok(revision)
    }

    fn delete_key(&mut self, key: &str) -> Option<KeyValue> {
        let removed = self.data.remove(key)?;
        if let Some(entry) = self.leases.get_mut(&removed.lease) {
            entry.keys.remove(key);
        }

        self.revision += 1;
        let revision = self.revision;
        self.notify(WatchEvent {
            kind: WatchEventKind::Delete,
            kv: KeyValue::tombstone(key, revision),
        });

        Some(removed)
    }

    fn revoke(&mut self, lease: LeaseId) -> bool {
        match self.leases.remove(&lease) {
            Some(entry) => {
                for key in entry.keys {
                    self.delete_key(&key);
                }
                true
            }
            None => false,
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let mut expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort_unstable();

        for lease in expired {
            tracing::debug!("Lease {} expired", lease);
            self.revoke(lease);
        }
    }
}

/// In-memory linearizable coordination store (for testing and local development).
///
/// Every operation runs under a single mutex, so writes are totally ordered and
/// watch events are delivered in revision order. Lease expiry is evaluated
/// against the tokio clock on every operation.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
    unavailable: AtomicBool,
    failing_reads: AtomicUsize,
    failing_lease_grants: AtomicUsize,
    failing_transactions: AtomicUsize,
    failing_keep_alives: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the state after failing fast when unavailable and applying due expirations
    fn live_state(&self) -> Result<MutexGuard<'_, StoreState>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ElectionError::coordination("coordination store unavailable"));
        }

        let mut state = self.lock();
        state.expire_leases(Instant::now());
        Ok(state)
    }

    fn take_fault(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Simulate an outage. While unavailable every operation fails and every
    /// open watch stream is closed.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
        if !available {
            self.lock().watchers.clear();
            tracing::debug!("Memory store marked unavailable");
        }
    }

    /// Fail the next `count` calls to `get` or `list`
    pub fn fail_next_reads(&self, count: usize) {
        self.failing_reads.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_lease_grants(&self, count: usize) {
        self.failing_lease_grants.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_transactions(&self, count: usize) {
        self.failing_transactions.store(count, Ordering::SeqCst);
    }

    pub fn fail_keep_alives(&self, failing: bool) {
        self.failing_keep_alives.store(failing, Ordering::SeqCst);
    }

    /// Unconditional write, `lease == 0` for a key without lease
    pub fn put(&self, key: &str, value: Vec<u8>, lease: LeaseId) -> Result<i64> {
        let mut state = self.lock();
        state.expire_leases(Instant::now());
        state.put_key(key, value, lease)
    }

    /// Remove a key, returning the removed record
    pub fn delete(&self, key: &str) -> Option<KeyValue> {
        self.lock().delete_key(key)
    }

    /// Revoke a lease and delete every key bound to it
    pub fn revoke_lease(&self, lease: LeaseId) -> bool {
        self.lock().revoke(lease)
    }

    /// Apply lease expirations that are due now
    pub fn expire_leases(&self) {
        self.lock().expire_leases(Instant::now());
    }

    /// Number of watch subscriptions still held by a receiver
    pub fn watcher_count(&self) -> usize {
        let mut state = self.lock();
        state.watchers.retain(|w| !w.tx.is_closed());
        state.watchers.len()
    }
}

#[async_trait]
impl CoordinationClient for MemoryStore {
    async fn get(&self, key: &str) -> Result<KeyValue> {
        if Self::take_fault(&self.failing_reads) {
            return Err(ElectionError::coordination(format!("read of {} rejected", key)));
        }

        let state = self.live_state()?;
        state
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| ElectionError::key_not_found(key))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KeyValue>> {
        if Self::take_fault(&self.failing_reads) {
            return Err(ElectionError::coordination(format!("listing of {} rejected", prefix)));
        }

        let state = self.live_state()?;
        Ok(state
            .data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect())
    }

    async fn lease_grant(&self, ttl_secs: u64) -> Result<LeaseId> {
        if Self::take_fault(&self.failing_lease_grants) {
            return Err(ElectionError::coordination("lease grant rejected"));
        }

        let mut state = self.live_state()?;
        state.next_lease_id += 1;
        let lease = state.next_lease_id;
        let ttl = Duration::from_secs(ttl_secs);
        state.leases.insert(
            lease,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );

        Ok(lease)
    }

    async fn lease_keep_alive(&self, lease: LeaseId) -> Result<()> {
        if self.failing_keep_alives.load(Ordering::SeqCst) {
            return Err(ElectionError::lease_renewal(lease, "keepalive stream broken"));
        }

        let mut state = self.live_state()?;
        let entry = state
            .leases
            .get_mut(&lease)
            .ok_or(ElectionError::LeaseNotFound(lease))?;
        entry.deadline = Instant::now() + entry.ttl;

        Ok(())
    }

    async fn create_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: LeaseId,
    ) -> Result<TxnOutcome> {
        if Self::take_fault(&self.failing_transactions) {
            return Err(ElectionError::timeout(format!("transaction on {}", key)));
        }

        let mut state = self.live_state()?;
        if state.data.contains_key(key) {
            return Ok(TxnOutcome::CompareFailed);
        }

        state.put_key(key, value, lease)?;
        Ok(TxnOutcome::Succeeded)
    }

    async fn watch(&self, target: WatchTarget) -> Result<Watch> {
        let mut state = self.live_state()?;
        let (tx, rx) = mpsc::unbounded_channel();
        state.watchers.push(Watcher {
            target: target.clone(),
            tx,
        });

        Ok(Watch::new(target, rx))
    }

    async fn ping(&self) -> Result<()> {
        self.live_state().map(|_| ())
    }
}
