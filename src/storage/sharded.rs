//! Sharded Concurrent Map
//!
//! A fixed-size table of independently locked shards. Every key maps to
//! exactly one shard through an FNV-32 hash masked by the (power of two)
//! shard count, so writers touching different shards never contend.
//!
//! ## Two Locking Styles
//!
//! ```text
//!   auto-locking                      manual (lock region)
//!   ────────────                      ────────────────────
//!   map.put(k, v)                     let mut locks = map.rw_locks(&[a, b], &[c]);
//!     └─ lock shard(k)                locks.put(a, v1);
//!     └─ insert                       locks.put(b, v2);
//!     └─ unlock                       locks.get(c);
//!                                     drop(locks);   // release, descending order
//! ```
//!
//! Both styles call the same entry helpers, so the count bookkeeping lives
//! in one place. A lock region acquires its shards in ascending index order,
//! which is what keeps two overlapping multi-key regions from deadlocking.

use bytes::Bytes;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Smallest shard table the map will build.
pub const MIN_SHARD_COUNT: usize = 16;

const FNV_OFFSET_BASIS: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

type Shard<V> = RwLock<HashMap<Bytes, V>>;

/// 32-bit FNV hash (multiply, then xor) over the raw key bytes.
#[inline]
pub fn fnv32(key: &[u8]) -> u32 {
    let mut hash = FNV_OFFSET_BASIS;
    for &byte in key {
        hash = hash.wrapping_mul(FNV_PRIME);
        hash ^= byte as u32;
    }
    hash
}

/// Rounds the requested shard count up to a power of two, never below 16.
pub fn compute_capacity(requested: usize) -> usize {
    if requested <= MIN_SHARD_COUNT {
        return MIN_SHARD_COUNT;
    }
    requested
        .checked_next_power_of_two()
        .unwrap_or(1 << (usize::BITS - 1))
}

/// Outcome of an unconditional put.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The key was not present before.
    Inserted,
    /// An existing value was replaced.
    Updated,
}

// ============================================================================
// Entry helpers shared by the auto-locking and manual variants
// ============================================================================

fn put_entry<V>(
    data: &mut HashMap<Bytes, V>,
    count: &AtomicUsize,
    key: Bytes,
    value: V,
) -> PutOutcome {
    if data.insert(key, value).is_some() {
        PutOutcome::Updated
    } else {
        count.fetch_add(1, Ordering::Relaxed);
        PutOutcome::Inserted
    }
}

fn put_absent_entry<V>(
    data: &mut HashMap<Bytes, V>,
    count: &AtomicUsize,
    key: Bytes,
    value: V,
) -> bool {
    if data.contains_key(&key) {
        return false;
    }
    data.insert(key, value);
    count.fetch_add(1, Ordering::Relaxed);
    true
}

fn put_existing_entry<V>(data: &mut HashMap<Bytes, V>, key: &[u8], value: V) -> bool {
    match data.get_mut(key) {
        Some(slot) => {
            *slot = value;
            true
        }
        None => false,
    }
}

fn remove_entry<V>(data: &mut HashMap<Bytes, V>, count: &AtomicUsize, key: &[u8]) -> Option<V> {
    let removed = data.remove(key);
    if removed.is_some() {
        count.fetch_sub(1, Ordering::Relaxed);
    }
    removed
}

/// A concurrent map split into independently locked shards.
///
/// # Example
///
/// ```
/// use fluxkv::storage::ShardedMap;
/// use bytes::Bytes;
///
/// let map: ShardedMap<u32> = ShardedMap::new(64);
/// map.put(Bytes::from("a"), 1);
/// assert_eq!(map.get(b"a"), Some(1));
///
/// // Lock two keys for writing and one for reading, as one region.
/// let mut locks = map.rw_locks(&[b"a".as_slice(), b"b".as_slice()], &[b"c".as_slice()]);
/// locks.put(Bytes::from("b"), 2);
/// assert_eq!(locks.get(b"a"), Some(&1));
/// drop(locks);
///
/// assert_eq!(map.len(), 2);
/// ```
pub struct ShardedMap<V> {
    shards: Vec<Shard<V>>,
    count: AtomicUsize,
}

impl<V> std::fmt::Debug for ShardedMap<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedMap")
            .field("shards", &self.shards.len())
            .field("count", &self.count.load(Ordering::Relaxed))
            .finish()
    }
}

impl<V> ShardedMap<V> {
    /// Creates a map with `shard_count` rounded up to a power of two (minimum 16).
    pub fn new(shard_count: usize) -> Self {
        let shard_count = compute_capacity(shard_count);
        let shards = (0..shard_count)
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            shards,
            count: AtomicUsize::new(0),
        }
    }

    /// Number of shards in the table.
    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Determines which shard a key belongs to.
    #[inline]
    pub fn shard_index(&self, key: &[u8]) -> usize {
        (fnv32(key) as usize) & (self.shards.len() - 1)
    }

    #[inline]
    fn read_shard(&self, key: &[u8]) -> RwLockReadGuard<'_, HashMap<Bytes, V>> {
        self.shards[self.shard_index(key)].read().unwrap()
    }

    #[inline]
    fn write_shard(&self, key: &[u8]) -> RwLockWriteGuard<'_, HashMap<Bytes, V>> {
        self.shards[self.shard_index(key)].write().unwrap()
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<V>
    where
        V: Clone,
    {
        self.read_shard(key).get(key).cloned()
    }

    /// Checks whether `key` is present.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.read_shard(key).contains_key(key)
    }

    /// Inserts or replaces the value for `key`.
    pub fn put(&self, key: Bytes, value: V) -> PutOutcome {
        let mut data = self.write_shard(&key);
        put_entry(&mut data, &self.count, key, value)
    }

    /// Inserts only when `key` is absent. Returns `true` if inserted.
    pub fn put_if_absent(&self, key: Bytes, value: V) -> bool {
        let mut data = self.write_shard(&key);
        put_absent_entry(&mut data, &self.count, key, value)
    }

    /// Replaces only when `key` is present. Returns `true` if updated.
    pub fn put_if_exists(&self, key: &[u8], value: V) -> bool {
        let mut data = self.write_shard(key);
        put_existing_entry(&mut data, key, value)
    }

    /// Removes `key`, returning the old value if there was one.
    pub fn remove(&self, key: &[u8]) -> Option<V> {
        let mut data = self.write_shard(key);
        remove_entry(&mut data, &self.count, key)
    }

    /// Total number of entries across all shards.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visits every entry, one shard at a time under that shard's read lock.
    ///
    /// The visitor returns `false` to stop early. The view is consistent per
    /// shard, not across the whole map.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Bytes, &V) -> bool,
    {
        for shard in &self.shards {
            let data = shard.read().unwrap();
            for (key, value) in data.iter() {
                if !visitor(key, value) {
                    return;
                }
            }
        }
    }

    /// Collects every key.
    pub fn keys(&self) -> Vec<Bytes> {
        let mut keys = Vec::with_capacity(self.len());
        self.for_each(|key, _| {
            keys.push(key.clone());
            true
        });
        keys
    }

    fn random_key_in(&self, index: usize, rng: &mut impl Rng) -> Option<Bytes> {
        let data = self.shards[index].read().unwrap();
        if data.is_empty() {
            return None;
        }
        let nth = rng.gen_range(0..data.len());
        data.keys().nth(nth).cloned()
    }

    /// Samples `limit` keys; the same key may appear more than once.
    pub fn random_keys(&self, limit: usize) -> Vec<Bytes> {
        if limit >= self.len() {
            return self.keys();
        }

        let mut rng = rand::thread_rng();
        let mut result = Vec::with_capacity(limit);
        let mut attempts = limit.saturating_mul(self.shards.len()).max(64);

        while result.len() < limit && attempts > 0 {
            attempts -= 1;
            let index = rng.gen_range(0..self.shards.len());
            if let Some(key) = self.random_key_in(index, &mut rng) {
                result.push(key);
            }
        }
        result
    }

    /// Samples up to `limit` distinct keys.
    pub fn random_distinct_keys(&self, limit: usize) -> Vec<Bytes> {
        if limit >= self.len() {
            return self.keys();
        }

        let mut rng = rand::thread_rng();
        let mut result = HashSet::with_capacity(limit);
        let mut attempts = limit.saturating_mul(self.shards.len()).max(64);

        while result.len() < limit && attempts > 0 {
            attempts -= 1;
            let index = rng.gen_range(0..self.shards.len());
            if let Some(key) = self.random_key_in(index, &mut rng) {
                result.insert(key);
            }
        }
        result.into_iter().collect()
    }

    /// Removes every entry while holding every shard at once.
    pub fn clear(&self) {
        self.lock_all().clear();
    }

    /// Distinct shard indices for `keys`, sorted ascending.
    pub fn lock_indices<K: AsRef<[u8]>>(&self, keys: &[K]) -> Vec<usize> {
        let mut indices: Vec<usize> = keys.iter().map(|k| self.shard_index(k.as_ref())).collect();
        indices.sort_unstable();
        indices.dedup();
        indices
    }

    /// Locks the shards covering `write_keys` (exclusively) and `read_keys`
    /// (shared) as one region.
    ///
    /// Shards are acquired in ascending index order. A shard touched by both
    /// lists is write-locked. The returned guard releases everything in
    /// descending order when dropped.
    pub fn rw_locks<K: AsRef<[u8]>>(&self, write_keys: &[K], read_keys: &[K]) -> ShardLocks<'_, V> {
        let write_indices: HashSet<usize> = write_keys
            .iter()
            .map(|k| self.shard_index(k.as_ref()))
            .collect();

        let mut indices: Vec<usize> = write_indices.iter().copied().collect();
        indices.extend(read_keys.iter().map(|k| self.shard_index(k.as_ref())));
        indices.sort_unstable();
        indices.dedup();

        let mut guards = Vec::with_capacity(indices.len());
        for index in indices {
            let guard = if write_indices.contains(&index) {
                ShardGuard::Write(self.shards[index].write().unwrap())
            } else {
                ShardGuard::Read(self.shards[index].read().unwrap())
            };
            guards.push((index, guard));
        }

        ShardLocks { map: self, guards }
    }

    /// Write-locks every shard, ascending, as one region.
    pub fn lock_all(&self) -> ShardLocks<'_, V> {
        let guards = self
            .shards
            .iter()
            .enumerate()
            .map(|(index, shard)| (index, ShardGuard::Write(shard.write().unwrap())))
            .collect();
        ShardLocks { map: self, guards }
    }
}

enum ShardGuard<'a, V> {
    Read(RwLockReadGuard<'a, HashMap<Bytes, V>>),
    Write(RwLockWriteGuard<'a, HashMap<Bytes, V>>),
}

/// A held multi-key lock region over a [`ShardedMap`].
///
/// The methods here are the manual ("with lock") variants: they touch the
/// shard data directly because the region already holds its lock. Touching
/// a key whose shard is outside the region is a programming error and
/// panics, as does writing through a shard that was only read-locked.
pub struct ShardLocks<'a, V> {
    map: &'a ShardedMap<V>,
    /// Sorted by shard index, ascending.
    guards: Vec<(usize, ShardGuard<'a, V>)>,
}

impl<V> std::fmt::Debug for ShardLocks<'_, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shards: Vec<(usize, bool)> = self
            .guards
            .iter()
            .map(|(index, guard)| (*index, matches!(guard, ShardGuard::Write(_))))
            .collect();
        f.debug_struct("ShardLocks").field("shards", &shards).finish()
    }
}

impl<'a, V> ShardLocks<'a, V> {
    /// Shard indices held by this region, ascending, with `true` for write locks.
    pub fn held(&self) -> Vec<(usize, bool)> {
        self.guards
            .iter()
            .map(|(index, guard)| (*index, matches!(guard, ShardGuard::Write(_))))
            .collect()
    }

    fn position(&self, key: &[u8]) -> Option<usize> {
        let index = self.map.shard_index(key);
        self.guards.binary_search_by_key(&index, |(i, _)| *i).ok()
    }

    /// Whether `key` falls inside this region at all.
    pub fn covers(&self, key: &[u8]) -> bool {
        self.position(key).is_some()
    }

    /// Whether `key`'s shard is held exclusively.
    pub fn is_write_locked(&self, key: &[u8]) -> bool {
        matches!(
            self.position(key).map(|p| &self.guards[p].1),
            Some(ShardGuard::Write(_))
        )
    }

    fn shard(&self, key: &[u8]) -> &HashMap<Bytes, V> {
        let position = self
            .position(key)
            .unwrap_or_else(|| panic!("key {:?} is outside the lock region", key));
        match &self.guards[position].1 {
            ShardGuard::Read(guard) => guard,
            ShardGuard::Write(guard) => guard,
        }
    }

    fn shard_mut(&mut self, key: &[u8]) -> &mut HashMap<Bytes, V> {
        let position = self
            .position(key)
            .unwrap_or_else(|| panic!("key {:?} is outside the lock region", key));
        match &mut self.guards[position].1 {
            ShardGuard::Write(guard) => guard,
            ShardGuard::Read(_) => panic!("key {:?} is only read-locked", key),
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&V> {
        self.shard(key).get(key)
    }

    pub fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        self.shard_mut(key).get_mut(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.shard(key).contains_key(key)
    }

    pub fn put(&mut self, key: Bytes, value: V) -> PutOutcome {
        let count = &self.map.count;
        let data = self.shard_mut(&key);
        put_entry(data, count, key, value)
    }

    pub fn put_if_absent(&mut self, key: Bytes, value: V) -> bool {
        let count = &self.map.count;
        let data = self.shard_mut(&key);
        put_absent_entry(data, count, key, value)
    }

    pub fn put_if_exists(&mut self, key: &[u8], value: V) -> bool {
        put_existing_entry(self.shard_mut(key), key, value)
    }

    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        let count = &self.map.count;
        let data = self.shard_mut(key);
        remove_entry(data, count, key)
    }

    /// Every key stored in the shards this region holds.
    pub fn keys(&self) -> Vec<Bytes> {
        self.guards
            .iter()
            .flat_map(|(_, guard)| match guard {
                ShardGuard::Read(data) => data.keys(),
                ShardGuard::Write(data) => data.keys(),
            })
            .cloned()
            .collect()
    }

    /// Empties every write-locked shard in the region. Returns how many
    /// entries were dropped.
    pub fn clear(&mut self) -> usize {
        let mut removed = 0;
        for (_, guard) in &mut self.guards {
            if let ShardGuard::Write(data) = guard {
                removed += data.len();
                data.clear();
            }
        }
        self.map.count.fetch_sub(removed, Ordering::Relaxed);
        removed
    }
}

impl<V> Drop for ShardLocks<'_, V> {
    fn drop(&mut self) {
        // Release in descending shard order, mirroring acquisition.
        while let Some(guard) = self.guards.pop() {
            drop(guard);
        }
    }
}
