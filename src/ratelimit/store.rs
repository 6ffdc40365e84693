//! Bounded key-value store whose entries expire after a time-to-live.
//!
//! Expiry is lazy: an expired entry is dropped the next time it is looked up,
//! or when [`ExpiringKeyStore::purge_expired`] runs. When the store is full a
//! new key evicts the entry closest to expiry.

use std::borrow::Borrow;
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::add_duration;
use crate::error::{Result, TollgateError};

/// Default maximum number of tracked keys.
pub const DEFAULT_CAPACITY: usize = 65_536;

#[derive(Debug)]
struct Entry<V> {
    value: V,
    ttl: Duration,
    expires_at: DateTime<Utc>,
    /// Tie breaker for entries expiring at the same instant
    seq: u64,
}

impl<V> Entry<V> {
    fn slot(&self) -> (DateTime<Utc>, u64) {
        (self.expires_at, self.seq)
    }
}

/// A capacity-bounded map with per-entry time-to-live.
#[derive(Debug)]
pub struct ExpiringKeyStore<K, V> {
    entries: HashMap<K, Entry<V>>,
    /// Keys ordered by expiry
    expiry: BTreeMap<(DateTime<Utc>, u64), K>,
    capacity: usize,
    next_seq: u64,
}

impl<K, V> ExpiringKeyStore<K, V>
where
    K: Hash + Eq + Clone,
{
    /// Create a store holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TollgateError::Config(
                "store capacity must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            entries: HashMap::new(),
            expiry: BTreeMap::new(),
            capacity,
            next_seq: 0,
        })
    }

    /// Get a live entry and push its expiry out by its TTL.
    ///
    /// An expired entry is removed and reported as absent.
    pub fn get_mut<Q>(&mut self, key: &Q, now: DateTime<Utc>) -> Option<&mut V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let expires_at = self.entries.get(key)?.expires_at;
        if now >= expires_at {
            self.remove(key);
            return None;
        }

        let seq = self.bump_seq();
        let entry = self.entries.get_mut(key)?;
        let owned = self.expiry.remove(&entry.slot())?;
        entry.expires_at = add_duration(now, entry.ttl);
        entry.seq = seq;
        self.expiry.insert(entry.slot(), owned);
        Some(&mut entry.value)
    }

    /// Shared-reference variant of [`get_mut`](Self::get_mut).
    pub fn get<Q>(&mut self, key: &Q, now: DateTime<Utc>) -> Option<&V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_mut(key, now).map(|value| &*value)
    }

    /// Insert or replace `key`, expiring `ttl` after `now`.
    ///
    /// Returns the key evicted to make room, if any.
    pub fn set(&mut self, key: K, value: V, ttl: Duration, now: DateTime<Utc>) -> Option<K> {
        let mut evicted = None;
        if let Some(previous) = self.entries.remove(&key) {
            self.expiry.remove(&previous.slot());
        } else if self.entries.len() >= self.capacity {
            self.purge_expired(now);
            if self.entries.len() >= self.capacity {
                evicted = self.evict_soonest();
            }
        }

        let entry = Entry {
            value,
            ttl,
            expires_at: add_duration(now, ttl),
            seq: self.bump_seq(),
        };
        self.expiry.insert(entry.slot(), key.clone());
        self.entries.insert(key, entry);
        evicted
    }

    /// Remove `key`, returning its value whether or not it had expired.
    pub fn remove<Q>(&mut self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let entry = self.entries.remove(key)?;
        self.expiry.remove(&entry.slot());
        Some(entry.value)
    }

    /// Drop every entry that has expired by `now`.
    ///
    /// Returns the number of entries removed.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> usize {
        let mut purged = 0;
        while let Some(slot) = self.expiry.first_entry() {
            if slot.key().0 > now {
                break;
            }
            let key = slot.remove();
            self.entries.remove(&key);
            purged += 1;
        }
        purged
    }

    /// Number of entries, including expired ones not yet reclaimed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.expiry.clear();
    }

    fn evict_soonest(&mut self) -> Option<K> {
        let (_, key) = self.expiry.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn bump_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }
}
