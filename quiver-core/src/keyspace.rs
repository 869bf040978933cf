//! The keyspace: a lock-free hash table of objects with one writer.
//!
//! The table is a power-of-two array of buckets. Readers never lock: they
//! load the table pointer and a bucket pointer inside a read section and scan
//! the bucket. The writer never edits a bucket that readers can see. It
//! copies the bucket, edits the copy, publishes it and retires the previous
//! version. Once enough retired versions pile up it runs a grace period.
//!
//! # Logging
//!
//! - **DEBUG** `quiver::keyspace`: `table_grown` with the new bucket count.
//! - **TRACE** `quiver::keyspace`: `expired` for every key removed because
//!   its time to live elapsed.

use std::{
    fmt::{self, Display},
    hash::{BuildHasher, RandomState},
    sync::{
        Arc,
        atomic::{AtomicU64, AtomicUsize, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use rand::Rng;
use tracing::{debug, trace};

use crate::{
    notify::{EventClass, KeyspaceEvent, Notifier},
    object::{Encoding, Object, ObjectType, Unshared},
    random::with_thread_rng,
    rcu::{
        GracePeriod, Protect, RcuCell, RcuDomain, RcuReader, RcuStats, RcuWriter, ReadSection,
        Retired, sealed,
    },
};

/// Integers in `0..SHARED_INTEGERS` produced by integer commands share one
/// pooled object per value.
pub const SHARED_INTEGERS: i64 = 10_000;

const MIN_BUCKETS: usize = 16;
/// Average entries per bucket before the table doubles.
const LOAD_FACTOR: usize = 2;
/// Retired bucket versions tolerated before the writer forces a grace period.
const RECLAIM_THRESHOLD: usize = 64;

/// Milliseconds since the UNIX epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct Entry {
    key: Box<[u8]>,
    object: Arc<Object>,
    /// Absolute expiry in unix milliseconds
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self, now: u64) -> bool {
        self.expires_at.is_some_and(|when| now > when)
    }
}

struct Table {
    buckets: Box<[RcuCell<Vec<Entry>>]>,
    mask: usize,
}

impl Table {
    fn with_buckets(buckets: Vec<Vec<Entry>>) -> Self {
        let mask = buckets.len() - 1;
        Table {
            buckets: buckets.into_iter().map(RcuCell::new).collect(),
            mask,
        }
    }

    fn slot(&self, hasher: &RandomState, key: &[u8]) -> usize {
        (hasher.hash_one(key) as usize) & self.mask
    }
}

struct Shared {
    table: RcuCell<Table>,
    hasher: RandomState,
    db: u32,
    keys: AtomicUsize,
    buckets: AtomicUsize,
    dirty: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
}

impl Shared {
    fn find<'a, P: Protect + ?Sized>(&'a self, guard: &'a P, key: &[u8]) -> Option<&'a Entry> {
        let table = self.table.load(guard);
        table.buckets[table.slot(&self.hasher, key)]
            .load(guard)
            .iter()
            .find(|e| &*e.key == key)
    }
}

/// Time to live of a key as seen by a reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    Missing,
    Persistent,
    /// Milliseconds left; zero when the key is due this very millisecond
    ExpiresIn(u64),
}

/// Point-in-time counters of a keyspace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct KeyspaceStats {
    pub keys: usize,
    pub buckets: usize,
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub dirty: u64,
    pub rcu: RcuStats,
}

impl Display for KeyspaceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Keys: {}, Buckets: {}, Hits: {}, Misses: {}, Expired: {}, Dirty: {}",
            self.keys, self.buckets, self.hits, self.misses, self.expired, self.dirty
        )?;
        write!(f, "{}", self.rcu)
    }
}

enum TtlPolicy {
    Keep,
    Clear,
}

/// Entry point for building a keyspace.
pub struct Keyspace;

impl Keyspace {
    /// Creates an empty keyspace and returns its only writer.
    ///
    /// # Example
    /// ```rust
    /// use std::sync::Arc;
    /// use quiver_core::{Keyspace, Object, TracingNotifier};
    ///
    /// let mut writer = Keyspace::new(0, Arc::new(TracingNotifier));
    /// writer.set_key(b"greeting", Arc::new(Object::raw("hello")));
    ///
    /// let reader = writer.handle().reader();
    /// let view = reader.view();
    /// assert!(view.lookup(b"greeting").is_some());
    /// ```
    #[allow(clippy::new_ret_no_self)]
    pub fn new(db: u32, notifier: Arc<dyn Notifier>) -> KeyspaceWriter {
        let shared = Shared {
            table: RcuCell::new(Table::with_buckets(vec![Vec::new(); MIN_BUCKETS])),
            hasher: RandomState::new(),
            db,
            keys: AtomicUsize::new(0),
            buckets: AtomicUsize::new(MIN_BUCKETS),
            dirty: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        };
        KeyspaceWriter {
            rcu: RcuWriter::new(),
            shared: Arc::new(shared),
            notifier,
            integers: (0..SHARED_INTEGERS)
                .map(|v| Arc::new(Object::integer(v)))
                .collect(),
            len: 0,
            expired_keys: Vec::new(),
        }
    }
}

/// The single mutating handle of a keyspace. Not `Clone`; moving it to a
/// thread makes that thread the writer.
pub struct KeyspaceWriter {
    rcu: RcuWriter,
    shared: Arc<Shared>,
    notifier: Arc<dyn Notifier>,
    integers: Box<[Arc<Object>]>,
    len: usize,
    expired_keys: Vec<Vec<u8>>,
}

impl sealed::Sealed for KeyspaceWriter {
    fn domain_id(&self) -> *const () {
        sealed::Sealed::domain_id(&self.rcu)
    }
}
impl Protect for KeyspaceWriter {}

impl KeyspaceWriter {
    pub fn handle(&self) -> KeyspaceHandle {
        KeyspaceHandle {
            shared: Arc::clone(&self.shared),
            domain: self.rcu.domain(),
        }
    }

    pub fn db(&self) -> u32 {
        self.shared.db
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn owner_id(&self) -> usize {
        Arc::as_ptr(&self.shared) as usize
    }

    fn entry(&self, key: &[u8]) -> Option<&Entry> {
        self.shared.find(&self.rcu, key)
    }

    /// Looks a key up without side effects. Expired keys read as missing.
    pub fn get(&self, key: &[u8]) -> Option<&Object> {
        let now = now_ms();
        self.entry(key)
            .filter(|e| !e.is_expired(now))
            .map(|e| &*e.object)
    }

    /// Deletes `key` if its time to live has elapsed. Returns true when the
    /// key was removed.
    pub fn expire_if_needed(&mut self, key: &[u8]) -> bool {
        let now = now_ms();
        if !self.entry(key).is_some_and(|e| e.is_expired(now)) {
            return false;
        }
        self.delete(key);
        self.shared.expired.fetch_add(1, Ordering::Relaxed);
        self.expired_keys.push(key.to_vec());
        trace!(target: "quiver::keyspace", key = %String::from_utf8_lossy(key), "expired");
        self.notify(EventClass::Generic, "expired", key);
        true
    }

    /// Keys removed by expiry since the last call, oldest first.
    pub fn take_expired(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.expired_keys)
    }

    /// Inserts a new key. Returns false, leaving the keyspace untouched, if
    /// the key already exists.
    pub fn add(&mut self, key: &[u8], object: Arc<Object>) -> bool {
        if self.entry(key).is_some() {
            return false;
        }
        self.install(key, object, TtlPolicy::Clear);
        true
    }

    /// Replaces the value of an existing key, keeping its time to live.
    /// Returns false if the key does not exist.
    pub fn overwrite(&mut self, key: &[u8], object: Arc<Object>) -> bool {
        if self.entry(key).is_none() {
            return false;
        }
        self.install(key, object, TtlPolicy::Keep);
        true
    }

    /// Adds or overwrites `key` and clears any time to live.
    pub fn set_key(&mut self, key: &[u8], object: Arc<Object>) {
        self.install(key, object, TtlPolicy::Clear);
    }

    /// Deletes `key`. Keys whose time to live elapsed count as missing.
    pub fn remove(&mut self, key: &[u8]) -> bool {
        if self.expire_if_needed(key) {
            return false;
        }
        self.delete(key)
    }

    /// Sets the absolute expiry of an existing key, in unix milliseconds.
    pub fn set_expire(&mut self, key: &[u8], when_ms: u64) -> bool {
        if self.entry(key).is_none() {
            return false;
        }
        self.modify_bucket(key, |bucket| {
            if let Some(e) = bucket.iter_mut().find(|e| &*e.key == key) {
                e.expires_at = Some(when_ms);
            }
        });
        true
    }

    pub fn get_expire(&self, key: &[u8]) -> Option<u64> {
        self.entry(key).and_then(|e| e.expires_at)
    }

    /// Returns a token for in-place edits if `key` holds the only reference
    /// to its object.
    ///
    /// Retired bucket versions keep extra references alive until the next
    /// grace period, so a shared-looking object triggers one before the
    /// final check.
    pub fn exclusive(&mut self, key: &[u8]) -> Option<Unshared> {
        let object = Arc::clone(&self.entry(key)?.object);
        if Arc::strong_count(&object) > 2 && self.rcu.pending() > 0 {
            self.rcu.synchronize();
        }
        (Arc::strong_count(&object) == 2).then(|| Unshared::new(object, self.owner_id()))
    }

    /// Makes the string at `key` safe to edit in place: exclusive and
    /// raw-encoded. Shared or integer-encoded values are replaced by a raw
    /// copy, keeping the time to live. `None` if the key is missing or does
    /// not hold a string.
    pub fn unshare_string(&mut self, key: &[u8]) -> Option<Unshared> {
        if self.get(key)?.object_type() != ObjectType::String {
            return None;
        }
        if let Some(token) = self.exclusive(key)
            && token.object().encoding() == Encoding::Raw
        {
            return Some(token);
        }

        let copy = Arc::new(self.get(key)?.dup_raw(&self.rcu)?);
        self.overwrite(key, Arc::clone(&copy));
        Some(Unshared::new(copy, self.owner_id()))
    }

    /// Returns an integer object, reusing the shared pool for small values.
    pub fn create_integer(&self, value: i64) -> Arc<Object> {
        match usize::try_from(value) {
            Ok(idx) if idx < self.integers.len() => Arc::clone(&self.integers[idx]),
            _ => Arc::new(Object::integer(value)),
        }
    }

    /// Publishes a new byte buffer for an unshared raw string. The buffer is
    /// handed back if the token does not fit this keyspace.
    pub fn publish_bytes(
        &self,
        token: &Unshared,
        bytes: Vec<u8>,
    ) -> Result<Retired<Vec<u8>>, Vec<u8>> {
        if token.owner() != self.owner_id() {
            return Err(bytes);
        }
        token.publish_bytes(bytes, &self.rcu)
    }

    /// Stores a new integer into an unshared integer object.
    pub fn set_int(&self, token: &Unshared, value: i64) -> bool {
        token.owner() == self.owner_id() && token.set_int(value)
    }

    pub fn synchronize(&mut self) -> GracePeriod {
        self.rcu.synchronize()
    }

    /// Waits for a grace period, then frees `retired`.
    pub fn reclaim<T: Send + 'static>(&mut self, retired: Retired<T>) {
        self.rcu.reclaim(retired)
    }

    /// Samples keys with a time to live, starting at a random bucket, and
    /// deletes those that elapsed. Returns the number of keys removed.
    pub fn active_expire_cycle(&mut self, samples: usize) -> usize {
        let now = now_ms();
        let victims: Vec<Vec<u8>> = {
            let table = self.shared.table.load(&self.rcu);
            let size = table.buckets.len();
            let start = with_thread_rng(|rng| rng.random_range(0..size));
            let mut seen = 0;
            let mut victims = Vec::new();
            for i in 0..size {
                let bucket = table.buckets[(start + i) & table.mask].load(&self.rcu);
                for e in bucket.iter().filter(|e| e.expires_at.is_some()) {
                    seen += 1;
                    if e.is_expired(now) {
                        victims.push(e.key.to_vec());
                    }
                }
                if seen >= samples {
                    break;
                }
            }
            victims
        };

        victims
            .iter()
            .filter(|key| self.expire_if_needed(key))
            .count()
    }

    pub fn mark_dirty(&self, changes: u64) {
        self.shared.dirty.fetch_add(changes, Ordering::Relaxed);
    }

    pub fn dirty(&self) -> u64 {
        self.shared.dirty.load(Ordering::Relaxed)
    }

    pub fn notify(&self, class: EventClass, event: &'static str, key: &[u8]) {
        self.notifier.notify(KeyspaceEvent {
            class,
            event,
            key: key.to_vec(),
            db: self.shared.db,
        });
    }

    pub fn stats(&self) -> KeyspaceStats {
        self.handle().stats()
    }

    fn install(&mut self, key: &[u8], object: Arc<Object>, ttl: TtlPolicy) {
        let inserted = self.modify_bucket(key, |bucket| {
            match bucket.iter_mut().find(|e| &*e.key == key) {
                Some(e) => {
                    e.object = object;
                    if matches!(ttl, TtlPolicy::Clear) {
                        e.expires_at = None;
                    }
                    false
                }
                None => {
                    bucket.push(Entry {
                        key: key.into(),
                        object,
                        expires_at: None,
                    });
                    true
                }
            }
        });
        if inserted {
            self.len += 1;
            self.shared.keys.store(self.len, Ordering::Relaxed);
            if self.len > LOAD_FACTOR * self.shared.buckets.load(Ordering::Relaxed) {
                self.grow();
            }
        }
    }

    fn delete(&mut self, key: &[u8]) -> bool {
        if self.entry(key).is_none() {
            return false;
        }
        self.modify_bucket(key, |bucket| bucket.retain(|e| &*e.key != key));
        self.len -= 1;
        self.shared.keys.store(self.len, Ordering::Relaxed);
        true
    }

    /// Copy, edit, publish, retire.
    fn modify_bucket<R>(&mut self, key: &[u8], edit: impl FnOnce(&mut Vec<Entry>) -> R) -> R {
        let (result, retired) = {
            let table = self.shared.table.load(&self.rcu);
            let cell = &table.buckets[table.slot(&self.shared.hasher, key)];
            let mut bucket = cell.load(&self.rcu).clone();
            let result = edit(&mut bucket);
            (result, cell.publish(bucket, &self.rcu))
        };
        self.rcu.retire(retired);
        if self.rcu.pending() >= RECLAIM_THRESHOLD {
            self.rcu.synchronize();
        }
        result
    }

    fn grow(&mut self) {
        let (retired, size) = {
            let table = self.shared.table.load(&self.rcu);
            let size = table.buckets.len() * 2;
            let mut buckets: Vec<Vec<Entry>> = vec![Vec::new(); size];
            for cell in table.buckets.iter() {
                for e in cell.load(&self.rcu) {
                    let slot = (self.shared.hasher.hash_one(&*e.key) as usize) & (size - 1);
                    buckets[slot].push(e.clone());
                }
            }
            debug!(target: "quiver::keyspace", buckets = size, keys = self.len, "table_grown");
            (
                self.shared
                    .table
                    .publish(Table::with_buckets(buckets), &self.rcu),
                size,
            )
        };
        self.rcu.retire(retired);
        self.shared.buckets.store(size, Ordering::Relaxed);
    }
}

/// Cloneable, thread-safe handle used to create readers.
#[derive(Clone)]
pub struct KeyspaceHandle {
    shared: Arc<Shared>,
    domain: RcuDomain,
}

impl KeyspaceHandle {
    /// Registers a new reader. Each reader thread owns its own.
    pub fn reader(&self) -> KeyspaceReader {
        KeyspaceReader {
            shared: Arc::clone(&self.shared),
            rcu: self.domain.register_reader(),
        }
    }

    pub fn stats(&self) -> KeyspaceStats {
        KeyspaceStats {
            keys: self.shared.keys.load(Ordering::Relaxed),
            buckets: self.shared.buckets.load(Ordering::Relaxed),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
            expired: self.shared.expired.load(Ordering::Relaxed),
            dirty: self.shared.dirty.load(Ordering::Relaxed),
            rcu: self.domain.stats(),
        }
    }
}

/// A registered reader. `Send` but not `Sync`: one thread at a time.
pub struct KeyspaceReader {
    shared: Arc<Shared>,
    rcu: RcuReader,
}

impl KeyspaceReader {
    /// Opens a read section. Everything looked up through the view stays
    /// valid until the view is dropped.
    pub fn view(&self) -> ReadView<'_> {
        ReadView {
            section: self.rcu.enter_read_section(),
            shared: &self.shared,
            now: now_ms(),
        }
    }
}

/// A consistent window onto the keyspace.
pub struct ReadView<'r> {
    section: ReadSection<'r>,
    shared: &'r Shared,
    now: u64,
}

impl ReadView<'_> {
    pub fn lookup(&self, key: &[u8]) -> Option<&Object> {
        match self.live_entry(key) {
            Some(e) => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(&e.object)
            }
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn ttl_ms(&self, key: &[u8]) -> KeyTtl {
        match self.live_entry(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at: None, ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at: Some(when),
                ..
            }) => KeyTtl::ExpiresIn(when.saturating_sub(self.now)),
        }
    }

    /// The section protecting this view, for decoding looked up values.
    pub fn guard(&self) -> &ReadSection<'_> {
        &self.section
    }

    fn live_entry(&self, key: &[u8]) -> Option<&Entry> {
        self.shared
            .find(&self.section, key)
            .filter(|e| !e.is_expired(self.now))
    }
}
