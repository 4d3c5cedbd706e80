//! The keyspace: string keys mapped to typed values, with a per-key
//! reader/writer lock and context-bounded acquisition.
//!
//! Keys are distributed over shards. Each shard's table mutex is the creation
//! gate: it is held only for table lookups and mutations, never across a user
//! operation. The value itself lives inside the key's `RwLock`, so a caller
//! can only reach it through a guard — writes require the write guard,
//! reads at least a read guard — and every exit path releases on drop.
//!
//! Acquisition polls `try_read`/`try_write` on a 5 ms tick so a caller's
//! cancellation token or deadline can abort the wait without the lock
//! primitive itself being cancellation-aware.

pub mod entry;

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{MurexError, MurexResult};
use crate::linked_list::{LinkedList, Topology};

pub use entry::{now_millis, Entry, Value};

const SHARD_COUNT: usize = 16;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(5);

type Slot = Arc<RwLock<Option<Entry>>>;

/// Bounds for a single lock acquisition: the connection's cancellation token
/// and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct LockCtx {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl LockCtx {
    pub fn with_deadline(cancel: CancellationToken, timeout: Duration) -> Self {
        LockCtx {
            cancel,
            deadline: Some(Instant::now() + timeout),
        }
    }
}

struct Shard {
    table: Mutex<HashMap<String, Slot>>,
}

pub struct Keyspace {
    shards: Vec<Shard>,
    /// Ring of shard indices the expiry sweeper rotates through.
    sweep_ring: LinkedList<usize>,
}

/// Exclusive access to one key's slot. `None` inside the guard means the key
/// holds no live value (never written, or cleared).
#[derive(Debug)]
pub struct WriteGuard {
    guard: OwnedRwLockWriteGuard<Option<Entry>>,
}

impl WriteGuard {
    pub fn set(&mut self, entry: Entry) {
        *self.guard = Some(entry);
    }

    pub fn clear(&mut self) -> Option<Entry> {
        self.guard.take()
    }

    pub fn entry(&self, now_ms: u64) -> Option<&Entry> {
        self.guard.as_ref().filter(|e| !e.is_expired(now_ms))
    }

    pub fn entry_mut(&mut self, now_ms: u64) -> &mut Option<Entry> {
        if self.guard.as_ref().is_some_and(|e| e.is_expired(now_ms)) {
            *self.guard = None;
        }
        &mut *self.guard
    }
}

/// Shared access to one key's slot.
pub struct ReadGuard {
    guard: OwnedRwLockReadGuard<Option<Entry>>,
}

impl ReadGuard {
    pub fn entry(&self, now_ms: u64) -> Option<&Entry> {
        self.guard.as_ref().filter(|e| !e.is_expired(now_ms))
    }
}

impl Default for Keyspace {
    fn default() -> Self {
        Self::new()
    }
}

impl Keyspace {
    pub fn new() -> Self {
        let mut sweep_ring = LinkedList::new(Topology::Ring);
        for i in 0..SHARD_COUNT {
            sweep_ring.add(i);
        }
        Keyspace {
            shards: (0..SHARD_COUNT)
                .map(|_| Shard {
                    table: Mutex::new(HashMap::new()),
                })
                .collect(),
            sweep_ring,
        }
    }

    fn shard_for(&self, key: &str) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Whether a lock record exists for `key`. A pure table lookup.
    pub fn exists(&self, key: &str) -> bool {
        self.shard_for(key)
            .table
            .lock()
            .expect("keyspace table poisoned")
            .contains_key(key)
    }

    /// Acquire the write lock for `key`, installing the key first if absent.
    ///
    /// On the creation path the fresh lock is taken in write mode before the
    /// slot becomes visible in the table, so no reader can observe a
    /// partially constructed key.
    pub async fn create_and_lock(&self, ctx: &LockCtx, key: &str) -> MurexResult<WriteGuard> {
        loop {
            let existing = {
                let shard = self.shard_for(key);
                let mut table = shard.table.lock().expect("keyspace table poisoned");
                match table.get(key) {
                    Some(slot) => Some(Arc::clone(slot)),
                    None => {
                        let slot: Slot = Arc::new(RwLock::new(None));
                        let guard = Arc::clone(&slot)
                            .try_write_owned()
                            .expect("fresh lock is uncontended");
                        table.insert(key.to_string(), slot);
                        return Ok(WriteGuard { guard });
                    }
                }
            };

            // Key already present: fall through to a plain write acquisition,
            // revalidating that the slot was not deleted while we waited.
            let slot = existing.expect("checked above");
            let guard = self.poll_write(ctx, key, Arc::clone(&slot)).await?;
            if self.slot_is_current(key, &slot) {
                return Ok(WriteGuard { guard });
            }
        }
    }

    /// Acquire the write lock for an existing `key`.
    pub async fn lock(&self, ctx: &LockCtx, key: &str) -> MurexResult<WriteGuard> {
        loop {
            let slot = self.slot_of(key).ok_or(MurexError::NoSuchKey)?;
            let guard = self.poll_write(ctx, key, Arc::clone(&slot)).await?;
            if self.slot_is_current(key, &slot) {
                return Ok(WriteGuard { guard });
            }
        }
    }

    /// Acquire a read lock for an existing `key`.
    pub async fn rlock(&self, ctx: &LockCtx, key: &str) -> MurexResult<ReadGuard> {
        loop {
            let slot = self.slot_of(key).ok_or(MurexError::NoSuchKey)?;
            let guard = self.poll_read(ctx, key, Arc::clone(&slot)).await?;
            if self.slot_is_current(key, &slot) {
                return Ok(ReadGuard { guard });
            }
        }
    }

    /// Drop `key`'s lock record. The caller must hold (and should then drop)
    /// the key's write guard with the slot cleared.
    pub fn remove(&self, key: &str) {
        self.shard_for(key)
            .table
            .lock()
            .expect("keyspace table poisoned")
            .remove(key);
    }

    fn slot_of(&self, key: &str) -> Option<Slot> {
        self.shard_for(key)
            .table
            .lock()
            .expect("keyspace table poisoned")
            .get(key)
            .cloned()
    }

    fn slot_is_current(&self, key: &str, slot: &Slot) -> bool {
        self.slot_of(key)
            .is_some_and(|current| Arc::ptr_eq(&current, slot))
    }

    async fn poll_write(
        &self,
        ctx: &LockCtx,
        key: &str,
        slot: Slot,
    ) -> MurexResult<OwnedRwLockWriteGuard<Option<Entry>>> {
        let mut tick = poll_ticker();
        loop {
            if let Ok(guard) = Arc::clone(&slot).try_write_owned() {
                return Ok(guard);
            }
            self.wait_tick(ctx, key, &mut tick).await?;
        }
    }

    async fn poll_read(
        &self,
        ctx: &LockCtx,
        key: &str,
        slot: Slot,
    ) -> MurexResult<OwnedRwLockReadGuard<Option<Entry>>> {
        let mut tick = poll_ticker();
        loop {
            if let Ok(guard) = Arc::clone(&slot).try_read_owned() {
                return Ok(guard);
            }
            self.wait_tick(ctx, key, &mut tick).await?;
        }
    }

    async fn wait_tick(
        &self,
        ctx: &LockCtx,
        key: &str,
        tick: &mut tokio::time::Interval,
    ) -> MurexResult<()> {
        tokio::select! {
            _ = tick.tick() => Ok(()),
            _ = ctx.cancel.cancelled() => {
                debug!(key, "lock acquisition cancelled");
                Err(MurexError::LockFailed(key.to_string()))
            }
            _ = wait_deadline(ctx.deadline) => {
                debug!(key, "lock acquisition deadline passed");
                Err(MurexError::LockFailed(key.to_string()))
            }
        }
    }

    // ---- module-facing helpers -------------------------------------------
    //
    // Handlers reach the keyspace through these so the locking discipline
    // (writers via create_and_lock/lock, readers via rlock) cannot be
    // bypassed from a command module.

    pub fn keys_exist(&self, keys: &[String]) -> HashMap<String, bool> {
        keys.iter()
            .map(|k| (k.clone(), self.exists(k)))
            .collect()
    }

    /// Read each key under its read lock; absent and expired keys map to
    /// `None`.
    pub async fn get_values(
        &self,
        ctx: &LockCtx,
        now_ms: u64,
        keys: &[String],
    ) -> MurexResult<HashMap<String, Option<Value>>> {
        let mut out = HashMap::with_capacity(keys.len());
        for key in keys {
            if !self.exists(key) {
                out.insert(key.clone(), None);
                continue;
            }
            let value = match self.rlock(ctx, key).await {
                Ok(guard) => guard.entry(now_ms).map(|e| e.value.clone()),
                // Deleted between the existence check and the lock.
                Err(MurexError::NoSuchKey) => None,
                Err(e) => return Err(e),
            };
            out.insert(key.clone(), value);
        }
        Ok(out)
    }

    /// Write each entry under its write lock, creating keys as needed.
    pub async fn set_values(
        &self,
        ctx: &LockCtx,
        entries: Vec<(String, Entry)>,
    ) -> MurexResult<()> {
        for (key, entry) in entries {
            let mut guard = self.create_and_lock(ctx, &key).await?;
            guard.set(entry);
        }
        Ok(())
    }

    /// Read-modify-write one key under its write lock. The closure sees
    /// `None` for an absent or expired entry.
    pub async fn update<R>(
        &self,
        ctx: &LockCtx,
        now_ms: u64,
        key: &str,
        f: impl FnOnce(&mut Option<Entry>) -> R,
    ) -> MurexResult<R> {
        let mut guard = self.create_and_lock(ctx, key).await?;
        let slot = guard.entry_mut(now_ms);
        let result = f(&mut *slot);
        // The record must leave the table while the writer is still held, or
        // a racing create_and_lock could write into a slot this call is
        // about to orphan.
        if slot.is_none() {
            self.remove(key);
        }
        drop(guard);
        Ok(result)
    }

    /// Delete a key outright. Returns whether it existed with a live value.
    pub async fn delete(&self, ctx: &LockCtx, now_ms: u64, key: &str) -> MurexResult<bool> {
        if !self.exists(key) {
            return Ok(false);
        }
        match self.lock(ctx, key).await {
            Ok(mut guard) => {
                let existed = guard.entry(now_ms).is_some();
                guard.clear();
                // Removed while the writer is held; see update().
                self.remove(key);
                drop(guard);
                Ok(existed)
            }
            Err(MurexError::NoSuchKey) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ---- expiry sweep ----------------------------------------------------

    /// One sweeper step: visit the shard after `cursor` in the ring and drop
    /// any expired entries whose locks are immediately free. Returns the new
    /// cursor and the number of entries dropped.
    pub fn sweep_step(&self, cursor: Option<usize>, now_ms: u64) -> (Option<usize>, usize) {
        let Some((next, &shard_idx)) = self.sweep_ring.advance(cursor) else {
            return (None, 0);
        };

        let shard = &self.shards[shard_idx];
        let keys: Vec<String> = shard
            .table
            .lock()
            .expect("keyspace table poisoned")
            .keys()
            .cloned()
            .collect();

        let mut dropped = 0;
        for key in keys {
            let mut table = shard.table.lock().expect("keyspace table poisoned");
            let Some(slot) = table.get(&key) else {
                continue;
            };
            // Never block the sweeper on a held lock; the key is revisited
            // on a later lap. Clearing and unmapping happen under both the
            // gate and the writer, so no racing create can be orphaned.
            if let Ok(mut guard) = Arc::clone(slot).try_write_owned() {
                if guard.as_ref().is_some_and(|e| e.is_expired(now_ms)) {
                    *guard = None;
                    table.remove(&key);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            debug!(shard = shard_idx, dropped, "expired entries swept");
        }
        (Some(next), dropped)
    }
}

/// The acquisition ticker. The first tick is one interval out: each attempt
/// tries the lock before waiting, so an immediate tick would busy-spin.
fn poll_ticker() -> tokio::time::Interval {
    tokio::time::interval_at(Instant::now() + LOCK_POLL_INTERVAL, LOCK_POLL_INTERVAL)
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> LockCtx {
        LockCtx::default()
    }

    #[tokio::test]
    async fn create_set_get_roundtrip() {
        let ks = Keyspace::new();
        let mut guard = ks.create_and_lock(&ctx(), "k").await.unwrap();
        guard.set(Entry::new(Value::Str(b"v".to_vec())));
        drop(guard);

        assert!(ks.exists("k"));
        let guard = ks.rlock(&ctx(), "k").await.unwrap();
        assert_eq!(
            guard.entry(0).map(|e| e.value.clone()),
            Some(Value::Str(b"v".to_vec()))
        );
    }

    #[tokio::test]
    async fn writers_are_exclusive_and_ordered() {
        let ks = Arc::new(Keyspace::new());
        let mut guard = ks.create_and_lock(&ctx(), "counter").await.unwrap();
        guard.set(Entry::new(Value::Int(0)));
        drop(guard);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ks = Arc::clone(&ks);
            handles.push(tokio::spawn(async move {
                for _ in 0..25 {
                    let mut guard = ks.lock(&LockCtx::default(), "counter").await.unwrap();
                    let next = match guard.entry(0).map(|e| e.value.clone()) {
                        Some(Value::Int(n)) => n + 1,
                        other => panic!("unexpected value {other:?}"),
                    };
                    guard.set(Entry::new(Value::Int(next)));
                }
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let guard = ks.rlock(&ctx(), "counter").await.unwrap();
        assert_eq!(guard.entry(0).map(|e| e.value.clone()), Some(Value::Int(200)));
    }

    #[tokio::test]
    async fn create_and_lock_is_atomic() {
        // Both racers target the same absent key; exactly one may observe it
        // absent, and neither may proceed while the other holds the writer.
        let ks = Arc::new(Keyspace::new());
        let mut handles = Vec::new();
        for i in 0..2 {
            let ks = Arc::clone(&ks);
            handles.push(tokio::spawn(async move {
                let mut guard = ks.create_and_lock(&LockCtx::default(), "races").await.unwrap();
                let fresh = guard.entry(0).is_none();
                if fresh {
                    guard.set(Entry::new(Value::Int(i)));
                }
                fresh
            }));
        }
        let mut fresh_count = 0;
        for h in handles {
            if h.await.unwrap() {
                fresh_count += 1;
            }
        }
        assert_eq!(fresh_count, 1);
    }

    #[tokio::test]
    async fn lock_acquisition_honors_cancellation() {
        let ks = Arc::new(Keyspace::new());
        let mut guard = ks.create_and_lock(&ctx(), "held").await.unwrap();
        guard.set(Entry::new(Value::Int(1)));

        let cancel = CancellationToken::new();
        let waiter_ctx = LockCtx {
            cancel: cancel.clone(),
            deadline: None,
        };
        let ks2 = Arc::clone(&ks);
        let waiter = tokio::spawn(async move { ks2.lock(&waiter_ctx, "held").await.map(|_| ()) });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, MurexError::LockFailed(_)));
        drop(guard);
    }

    #[tokio::test]
    async fn lock_acquisition_honors_deadline() {
        let ks = Keyspace::new();
        let _held = ks.create_and_lock(&ctx(), "busy").await.unwrap();

        let waiter_ctx = LockCtx::with_deadline(CancellationToken::new(), Duration::from_millis(30));
        let err = ks.lock(&waiter_ctx, "busy").await.unwrap_err();
        assert!(matches!(err, MurexError::LockFailed(_)));
    }

    #[tokio::test]
    async fn readers_share_the_lock() {
        let ks = Keyspace::new();
        let mut guard = ks.create_and_lock(&ctx(), "shared").await.unwrap();
        guard.set(Entry::new(Value::Int(7)));
        drop(guard);

        let r1 = ks.rlock(&ctx(), "shared").await.unwrap();
        let r2 = ks.rlock(&ctx(), "shared").await.unwrap();
        assert_eq!(r1.entry(0).map(|e| e.value.clone()), Some(Value::Int(7)));
        assert_eq!(r2.entry(0).map(|e| e.value.clone()), Some(Value::Int(7)));
    }

    #[tokio::test]
    async fn lock_on_missing_key_fails_fast() {
        let ks = Keyspace::new();
        assert!(matches!(
            ks.lock(&ctx(), "ghost").await.unwrap_err(),
            MurexError::NoSuchKey
        ));
    }

    #[tokio::test]
    async fn delete_removes_lock_record() {
        let ks = Keyspace::new();
        ks.set_values(&ctx(), vec![("k".into(), Entry::new(Value::Int(1)))])
            .await
            .unwrap();
        assert!(ks.delete(&ctx(), 0, "k").await.unwrap());
        assert!(!ks.exists("k"));
        assert!(!ks.delete(&ctx(), 0, "k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let ks = Keyspace::new();
        ks.set_values(
            &ctx(),
            vec![("k".into(), Entry::with_expiry(Value::Int(1), 100))],
        )
        .await
        .unwrap();

        let values = ks.get_values(&ctx(), 50, &["k".to_string()]).await.unwrap();
        assert_eq!(values["k"], Some(Value::Int(1)));

        let values = ks.get_values(&ctx(), 200, &["k".to_string()]).await.unwrap();
        assert_eq!(values["k"], None);
    }

    #[tokio::test]
    async fn sweep_drops_expired_entries_across_laps() {
        let ks = Keyspace::new();
        for i in 0..32 {
            ks.set_values(
                &ctx(),
                vec![(format!("key:{i}"), Entry::with_expiry(Value::Int(i), 10))],
            )
            .await
            .unwrap();
        }

        let mut cursor = None;
        let mut dropped = 0;
        for _ in 0..SHARD_COUNT {
            let (next, n) = ks.sweep_step(cursor, 1_000);
            cursor = next;
            dropped += n;
        }
        assert_eq!(dropped, 32);
        assert!(!ks.exists("key:0"));
    }
}
