//! Sharded Key-Value Store
//!
//! Keys are spread over a fixed number of shards, each behind its own
//! `RwLock`, so commands issued by different reactor threads and by the
//! asynchronous worker pool rarely contend on the same lock.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     StorageEngine                           │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ HashMap │ │ HashMap │ │ HashMap │ │ HashMap │           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Expiry is lazy (an expired entry is removed by the access that finds it)
//! plus active (the [`ExpirySweeper`](super::ExpirySweeper) calls
//! [`StorageEngine::cleanup_expired`]).

use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Number of shards for the storage engine.
const NUM_SHARDS: usize = 64;

/// Estimated bookkeeping bytes per entry, for `INFO memory`.
const ENTRY_OVERHEAD: usize = 64;

/// Errors returned by value-manipulating operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("value is not an integer or out of range")]
    NotAnInteger,

    #[error("increment or decrement would overflow")]
    Overflow,
}

/// A stored value with its optional deadline.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Bytes,
    pub expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Bytes, ttl: Option<Duration>) -> Self {
        Self {
            value,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }

    /// Remaining time to live in milliseconds; `None` for persistent keys.
    pub fn remaining_ms(&self) -> Option<i64> {
        self.expires_at.map(|at| {
            at.saturating_duration_since(Instant::now()).as_millis() as i64
        })
    }
}

/// When a `SET` is allowed to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SetCondition {
    #[default]
    Always,
    /// `NX`
    IfAbsent,
    /// `XX`
    IfPresent,
}

/// Options of a conditional `SET`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetOptions {
    pub ttl: Option<Duration>,
    pub condition: SetCondition,
}

type Shard = RwLock<HashMap<Bytes, Entry>>;

/// The key-value store shared by every connection.
pub struct StorageEngine {
    shards: Vec<Shard>,
    key_count: AtomicU64,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine")
            .field("shards", &self.shards.len())
            .field("keys", &self.len())
            .finish()
    }
}

impl Default for StorageEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine {
    pub fn new() -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| RwLock::new(HashMap::new())).collect(),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
        }
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % NUM_SHARDS]
    }

    fn read(&self, key: &[u8]) -> RwLockReadGuard<'_, HashMap<Bytes, Entry>> {
        self.shard(key).read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, key: &[u8]) -> RwLockWriteGuard<'_, HashMap<Bytes, Entry>> {
        self.shard(key).write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes `key` from a locked shard if it expired. Returns true if the
    /// key is live afterwards.
    fn evict_if_expired(&self, data: &mut HashMap<Bytes, Entry>, key: &[u8]) -> bool {
        match data.get(key) {
            Some(entry) if entry.is_expired() => {
                data.remove(key);
                self.key_count.fetch_sub(1, Ordering::Relaxed);
                self.expired_count.fetch_add(1, Ordering::Relaxed);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Sets a key, replacing any previous value and deadline.
    pub fn set(&self, key: Bytes, value: Bytes) {
        self.set_with_options(key, value, SetOptions::default());
    }

    pub fn set_with_ttl(&self, key: Bytes, value: Bytes, ttl: Duration) {
        self.set_with_options(
            key,
            value,
            SetOptions {
                ttl: Some(ttl),
                ..SetOptions::default()
            },
        );
    }

    /// Sets a key if `options.condition` allows it. Returns whether it was written.
    pub fn set_with_options(&self, key: Bytes, value: Bytes, options: SetOptions) -> bool {
        let mut data = self.write(&key);
        let live = self.evict_if_expired(&mut data, &key);

        let allowed = match options.condition {
            SetCondition::Always => true,
            SetCondition::IfAbsent => !live,
            SetCondition::IfPresent => live,
        };
        if !allowed {
            return false;
        }

        self.set_count.fetch_add(1, Ordering::Relaxed);
        if data.insert(key, Entry::new(value, options.ttl)).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
        true
    }

    /// Returns the value of a live key.
    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.get_count.fetch_add(1, Ordering::Relaxed);
        self.get_entry(key).map(|entry| entry.value)
    }

    /// Returns a live entry including its deadline.
    pub fn get_entry(&self, key: &[u8]) -> Option<Entry> {
        {
            let data = self.read(key);
            match data.get(key) {
                Some(entry) if !entry.is_expired() => return Some(entry.clone()),
                Some(_) => {}
                None => return None,
            }
        }

        // Expired: upgrade to evict, another writer may have replaced it meanwhile.
        let mut data = self.write(key);
        if self.evict_if_expired(&mut data, key) {
            return data.get(key).cloned();
        }
        None
    }

    pub fn delete(&self, key: &[u8]) -> bool {
        self.del_count.fetch_add(1, Ordering::Relaxed);
        let mut data = self.write(key);
        let live = self.evict_if_expired(&mut data, key);
        if live && data.remove(key).is_some() {
            self.key_count.fetch_sub(1, Ordering::Relaxed);
            return true;
        }
        false
    }

    pub fn delete_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|key| self.delete(key)).count() as u64
    }

    pub fn exists(&self, key: &[u8]) -> bool {
        self.read(key).get(key).is_some_and(|entry| !entry.is_expired())
    }

    pub fn exists_many(&self, keys: &[Bytes]) -> u64 {
        keys.iter().filter(|key| self.exists(key)).count() as u64
    }

    /// Gives a live key a deadline. Returns false if the key does not exist.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> bool {
        let mut data = self.write(key);
        if !self.evict_if_expired(&mut data, key) {
            return false;
        }
        match data.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                true
            }
            None => false,
        }
    }

    /// Removes a deadline. Returns false if the key is missing or persistent.
    pub fn persist(&self, key: &[u8]) -> bool {
        let mut data = self.write(key);
        if !self.evict_if_expired(&mut data, key) {
            return false;
        }
        data.get_mut(key)
            .and_then(|entry| entry.expires_at.take())
            .is_some()
    }

    /// Remaining time to live in milliseconds.
    ///
    /// `None` if the key does not exist, `Some(-1)` if it has no deadline.
    pub fn pttl(&self, key: &[u8]) -> Option<i64> {
        self.get_entry(key)
            .map(|entry| entry.remaining_ms().unwrap_or(-1))
    }

    /// Adds `delta` to an integer value, creating it at 0 if missing. The
    /// deadline of an existing key is kept.
    pub fn incr_by(&self, key: &Bytes, delta: i64) -> Result<i64, StorageError> {
        let mut data = self.write(key);
        let live = self.evict_if_expired(&mut data, key);

        let current = match data.get(key) {
            Some(entry) if live => std::str::from_utf8(&entry.value)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StorageError::NotAnInteger)?,
            _ => 0,
        };
        let next = current.checked_add(delta).ok_or(StorageError::Overflow)?;
        let value = Bytes::from(next.to_string());

        match data.get_mut(key) {
            Some(entry) => entry.value = value,
            None => {
                data.insert(key.clone(), Entry::new(value, None));
                self.key_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.set_count.fetch_add(1, Ordering::Relaxed);
        Ok(next)
    }

    /// Appends to a string value, creating it if missing. Returns the new length.
    pub fn append(&self, key: &Bytes, suffix: &[u8]) -> usize {
        let mut data = self.write(key);
        self.evict_if_expired(&mut data, key);

        match data.get_mut(key) {
            Some(entry) => {
                let mut joined = BytesMut::with_capacity(entry.value.len() + suffix.len());
                joined.extend_from_slice(&entry.value);
                joined.extend_from_slice(suffix);
                entry.value = joined.freeze();
                entry.value.len()
            }
            None => {
                data.insert(key.clone(), Entry::new(Bytes::copy_from_slice(suffix), None));
                self.key_count.fetch_add(1, Ordering::Relaxed);
                suffix.len()
            }
        }
    }

    pub fn strlen(&self, key: &[u8]) -> usize {
        self.get_entry(key).map_or(0, |entry| entry.value.len())
    }

    /// Returns every live key matching a glob pattern (`*`, `?`, `[...]`, `\`).
    ///
    /// Scans all shards; used by `KEYS`, which runs off the reactor threads.
    pub fn keys(&self, pattern: &[u8]) -> Vec<Bytes> {
        let mut matched = Vec::new();
        for shard in &self.shards {
            let data = shard.read().unwrap_or_else(PoisonError::into_inner);
            matched.extend(
                data.iter()
                    .filter(|(key, entry)| !entry.is_expired() && glob_match(pattern, key))
                    .map(|(key, _)| key.clone()),
            );
        }
        matched
    }

    /// Removes every key. Returns how many were removed.
    pub fn flush(&self) -> u64 {
        let mut removed = 0;
        for shard in &self.shards {
            let mut data = shard.write().unwrap_or_else(PoisonError::into_inner);
            removed += data.len() as u64;
            data.clear();
        }
        self.key_count.store(0, Ordering::Relaxed);
        removed
    }

    /// Approximate number of keys, including expired ones not yet evicted.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StorageStats {
        StorageStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
        }
    }

    /// Approximate bytes held by keys, values and bookkeeping.
    pub fn used_memory(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| {
                shard
                    .read()
                    .unwrap_or_else(PoisonError::into_inner)
                    .iter()
                    .map(|(key, entry)| key.len() + entry.value.len() + ENTRY_OVERHEAD)
                    .sum::<usize>()
            })
            .sum()
    }

    /// Evicts expired keys from all shards. Returns how many were evicted.
    pub fn cleanup_expired(&self) -> u64 {
        let mut evicted = 0u64;
        for shard in &self.shards {
            let mut data = shard.write().unwrap_or_else(PoisonError::into_inner);
            let before = data.len();
            data.retain(|_, entry| !entry.is_expired());
            evicted += (before - data.len()) as u64;
        }

        if evicted > 0 {
            self.key_count.fetch_sub(evicted, Ordering::Relaxed);
            self.expired_count.fetch_add(evicted, Ordering::Relaxed);
        }
        evicted
    }
}

/// Operation counters reported by `INFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    pub keys: u64,
    pub get_ops: u64,
    pub set_ops: u64,
    pub del_ops: u64,
    pub expired: u64,
}

/// Redis-style glob matching over raw bytes.
///
/// Iterative with single-star backtracking, so hostile patterns such as
/// `*a*a*a*b` stay linear in practice.
fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    if let Some((matched, next)) = match_class(&pattern[p..], text[t]) {
                        if matched {
                            p += next;
                            t += 1;
                            continue;
                        }
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                c if c == text[t] => {
                    p += 1;
                    t += 1;
                    continue;
                }
                _ => {}
            }
        }

        // Mismatch: let the last star swallow one more byte.
        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == b'*')
}

/// Matches `byte` against the class starting at `class[0] == b'['`.
///
/// Returns whether it matched and the length of the class, or `None` for an
/// unterminated class.
fn match_class(class: &[u8], byte: u8) -> Option<(bool, usize)> {
    let mut i = 1;
    let negate = class.get(1) == Some(&b'^');
    if negate {
        i += 1;
    }

    let mut matched = false;
    while i < class.len() && class[i] != b']' {
        if class[i] == b'\\' && i + 1 < class.len() {
            matched |= class[i + 1] == byte;
            i += 2;
        } else if i + 2 < class.len() && class[i + 1] == b'-' && class[i + 2] != b']' {
            let (lo, hi) = (class[i].min(class[i + 2]), class[i].max(class[i + 2]));
            matched |= (lo..=hi).contains(&byte);
            i += 3;
        } else {
            matched |= class[i] == byte;
            i += 1;
        }
    }

    if i >= class.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
