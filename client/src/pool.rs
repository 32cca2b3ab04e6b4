//! Channel pool with lifetime-based rotation.
//!
//! Each entry key owns one active channel. When its lifetime elapses the
//! entry is retired: clients already handed out keep using the old channel,
//! new clients get a fresh one. A retired channel is disposed once no
//! invoker over it is alive, which the cleanup pass checks through a weak
//! reference.

use dashmap::DashMap;
use grpc::{Call, CallInvoker, CallOptions, CallRequest, Channel, MethodDescriptor};
use parking_lot::Mutex;
use std::any::TypeId;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Pool key: the client name and the typed client it is created for.
#[derive(Clone, PartialEq, Eq, Hash)]
pub(crate) struct EntryKey {
    name: String,
    client_type: TypeId,
}

impl EntryKey {
    pub(crate) fn new<T: 'static>(name: &str) -> Self {
        Self {
            name: name.to_string(),
            client_type: TypeId::of::<T>(),
        }
    }
}

impl fmt::Debug for EntryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Invoker that leases itself to every call it starts, so it stays alive
/// while calls are in flight even after its clients are gone.
pub(crate) struct LifetimeTrackedInvoker {
    inner: Arc<dyn CallInvoker>,
    this: Weak<LifetimeTrackedInvoker>,
}

impl LifetimeTrackedInvoker {
    fn new(inner: Arc<dyn CallInvoker>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            inner,
            this: this.clone(),
        })
    }
}

impl CallInvoker for LifetimeTrackedInvoker {
    fn start_call(
        &self,
        method: &MethodDescriptor,
        host: Option<&str>,
        options: CallOptions,
        request: CallRequest,
    ) -> Call {
        let call = self.inner.start_call(method, host, options, request);
        if let Some(this) = self.this.upgrade() {
            call.retain(this);
        }
        call
    }
}

struct ActiveEntry {
    id: u64,
    channel: Channel,
    invoker: Arc<LifetimeTrackedInvoker>,
    expires_at: Option<Instant>,
}

impl ActiveEntry {
    fn is_due(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn retire(&self, key: &EntryKey) -> ExpiredEntry {
        info!(name = ?key, address = self.channel.target(), "channel lifetime expired");
        ExpiredEntry {
            key: key.clone(),
            channel: self.channel.clone(),
            invoker: Arc::downgrade(&self.invoker),
        }
    }
}

struct ExpiredEntry {
    key: EntryKey,
    channel: Channel,
    invoker: Weak<LifetimeTrackedInvoker>,
}

#[derive(Default)]
struct Expired {
    entries: Vec<ExpiredEntry>,
    cleanup_running: bool,
}

/// Channel and base invoker for a new entry.
pub(crate) struct PooledChannel {
    pub(crate) channel: Channel,
    pub(crate) invoker: Arc<dyn CallInvoker>,
}

/// The active entry for one key. Empty until the first successful build and
/// after expiry. Slots are never removed from the pool, so every caller for
/// a key serializes on the same lock.
type Slot = Arc<Mutex<Option<ActiveEntry>>>;

pub(crate) struct ChannelPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    active: DashMap<EntryKey, Slot>,
    expired: Mutex<Expired>,
    next_id: AtomicU64,
    cleanup_interval: Duration,
}

impl ChannelPool {
    pub(crate) fn new(cleanup_interval: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                active: DashMap::new(),
                expired: Mutex::new(Expired::default()),
                next_id: AtomicU64::new(0),
                cleanup_interval,
            }),
        }
    }

    /// Return the tracked invoker for `key`, building the channel with
    /// `build` when there is no live entry. Concurrent callers for one key
    /// wait for each other, so `build` runs at most once per rotation.
    ///
    /// `build` runs under the key's lock only; other keys are not blocked,
    /// but `build` must not create a client for the same key.
    pub(crate) fn get_or_create<E>(
        &self,
        key: EntryKey,
        lifetime: Option<Duration>,
        build: impl FnOnce() -> Result<PooledChannel, E>,
    ) -> Result<Arc<LifetimeTrackedInvoker>, E> {
        let slot = self.inner.slot(&key);
        let mut active = slot.lock();
        let now = Instant::now();
        if let Some(entry) = active.as_ref()
            && !entry.is_due(now)
        {
            return Ok(entry.invoker.clone());
        }

        let entry = self.inner.new_entry(&key, lifetime, build()?);
        let invoker = entry.invoker.clone();
        if let Some(old) = active.replace(entry) {
            self.inner.retire(old.retire(&key));
        }
        Ok(invoker)
    }

    /// Retire due entries and dispose retired channels nothing references.
    /// Returns the number of channels disposed.
    pub(crate) fn cleanup_expired(&self) -> usize {
        self.inner.cleanup_expired()
    }

    pub(crate) fn active_len(&self) -> usize {
        self.inner
            .slots()
            .iter()
            .filter(|(_, slot)| slot.lock().is_some())
            .count()
    }

    pub(crate) fn expired_len(&self) -> usize {
        self.inner.expired.lock().entries.len()
    }
}

impl PoolInner {
    fn slot(&self, key: &EntryKey) -> Slot {
        if let Some(slot) = self.active.get(key) {
            return slot.clone();
        }
        self.active.entry(key.clone()).or_default().clone()
    }

    /// Snapshot of every slot, taken without holding a map lock afterwards.
    fn slots(&self) -> Vec<(EntryKey, Slot)> {
        self.active
            .iter()
            .map(|slot| (slot.key().clone(), slot.value().clone()))
            .collect()
    }

    fn new_entry(
        self: &Arc<Self>,
        key: &EntryKey,
        lifetime: Option<Duration>,
        pooled: PooledChannel,
    ) -> ActiveEntry {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let expires_at = lifetime.and_then(|lifetime| Instant::now().checked_add(lifetime));
        debug!(name = ?key, address = pooled.channel.target(), "channel created");

        if let Some(at) = expires_at
            && let Ok(handle) = tokio::runtime::Handle::try_current()
        {
            let pool = Arc::downgrade(self);
            let key = key.clone();
            handle.spawn(async move {
                tokio::time::sleep_until(at).await;
                if let Some(pool) = pool.upgrade() {
                    pool.expire(&key, id);
                }
            });
        }

        ActiveEntry {
            id,
            channel: pooled.channel,
            invoker: LifetimeTrackedInvoker::new(pooled.invoker),
            expires_at,
        }
    }

    /// Retire the entry for `key` if it is still the one created as `id`.
    fn expire(self: &Arc<Self>, key: &EntryKey, id: u64) {
        let Some(slot) = self.active.get(key).map(|slot| slot.clone()) else {
            return;
        };
        let mut active = slot.lock();
        if active.as_ref().is_some_and(|entry| entry.id == id)
            && let Some(entry) = active.take()
        {
            self.retire(entry.retire(key));
        }
    }

    fn retire(self: &Arc<Self>, entry: ExpiredEntry) {
        let mut expired = self.expired.lock();
        expired.entries.push(entry);
        if expired.cleanup_running {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            expired.cleanup_running = true;
            let guard = CleanupRunning {
                pool: Arc::downgrade(self),
                armed: true,
            };
            handle.spawn(cleanup_loop(guard, self.cleanup_interval));
        }
    }

    fn cleanup_expired(self: &Arc<Self>) -> usize {
        let now = Instant::now();
        for (key, slot) in self.slots() {
            let due = slot
                .lock()
                .as_ref()
                .filter(|entry| entry.is_due(now))
                .map(|entry| entry.id);
            if let Some(id) = due {
                self.expire(&key, id);
            }
        }

        let released: Vec<ExpiredEntry> = {
            let mut expired = self.expired.lock();
            let (released, live) = std::mem::take(&mut expired.entries)
                .into_iter()
                .partition(|entry| entry.invoker.strong_count() == 0);
            expired.entries = live;
            released
        };
        for entry in &released {
            debug!(name = ?entry.key, address = entry.channel.target(), "disposing expired channel");
            entry.channel.dispose();
        }
        released.len()
    }
}

/// Marks the cleanup loop as running. Clears the mark if the loop is
/// dropped early, e.g. when its runtime shuts down.
struct CleanupRunning {
    pool: Weak<PoolInner>,
    armed: bool,
}

impl Drop for CleanupRunning {
    fn drop(&mut self) {
        if self.armed
            && let Some(pool) = self.pool.upgrade()
        {
            pool.expired.lock().cleanup_running = false;
        }
    }
}

/// Periodically clean up until no expired entries remain or the pool is gone.
async fn cleanup_loop(mut running: CleanupRunning, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(pool) = running.pool.upgrade() else {
            return;
        };
        pool.cleanup_expired();
        let mut expired = pool.expired.lock();
        if expired.entries.is_empty() {
            expired.cleanup_running = false;
            running.armed = false;
            return;
        }
    }
}
