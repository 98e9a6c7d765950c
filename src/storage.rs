/*!
 * In-Memory Storage Implementation
 *
 * One `Store` per shard. It is owned by the shard thread and has no
 * synchronisation of its own. Entries carry an optional absolute expiry
 * (milliseconds on the process clock); expiry is checked lazily on every
 * access and swept periodically through an ordered deadline index.
 *
 * Mutations of keys that have subscribers are recorded as `WatchEvent`s,
 * which the shard drains after each command.
 */

use crate::command::End;
use crate::error::StoreError;
use crate::protocol::Frame;
use crate::time::deadline_after;
use crate::watch::WatchEvent;
use bytes::Bytes;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::hash::BuildHasherDefault;
use std::time::Duration;

// AHash is considerably faster than SipHash for short keys
type AHash = BuildHasherDefault<ahash::AHasher>;

pub type HashValue = HashMap<Bytes, Bytes, AHash>;

/// Value types that can be stored.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// String/binary data
    Str(Bytes),
    /// 64-bit signed integer, kept only when the textual form is canonical
    Int(i64),
    List(VecDeque<Bytes>),
    Hash(HashValue),
}

impl Value {
    /// Build a string value, storing canonical integers as `Int`.
    ///
    /// "42" becomes `Int(42)`, while "042" or "+42" stay strings so that a
    /// later GET returns exactly the bytes that were written.
    pub fn from_bytes(v: Bytes) -> Value {
        // Fast fail: integers fit in 20 chars and start with a digit or '-'
        if v.is_empty() || v.len() > 20 || !(v[0].is_ascii_digit() || v[0] == b'-') {
            return Value::Str(v);
        }
        match std::str::from_utf8(&v).ok().and_then(|s| s.parse::<i64>().ok()) {
            Some(i) if i.to_string().as_bytes() == &v[..] => Value::Int(i),
            _ => Value::Str(v),
        }
    }

    /// Redis TYPE name.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) | Value::Int(_) => "string",
            Value::List(_) => "list",
            Value::Hash(_) => "hash",
        }
    }

    /// Wire representation, used by GET and by watch pushes.
    pub fn to_frame(&self) -> Frame {
        match self {
            Value::Str(b) => Frame::Bulk(b.clone()),
            Value::Int(i) => Frame::Bulk(Bytes::from(i.to_string())),
            Value::List(items) => Frame::Array(items.iter().cloned().map(Frame::Bulk).collect()),
            Value::Hash(h) => {
                let mut out = Vec::with_capacity(h.len() * 2);
                for (f, v) in h {
                    out.push(Frame::Bulk(f.clone()));
                    out.push(Frame::Bulk(v.clone()));
                }
                Frame::Array(out)
            }
        }
    }
}

/// A stored value and its optional absolute deadline.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<u64>,
}

impl Entry {
    #[inline]
    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(d) if d <= now)
    }
}

/// Per-shard key-value table.
#[derive(Default)]
pub struct Store {
    inner: HashMap<Bytes, Entry, AHash>,
    /// (deadline, key) for every entry with a TTL
    deadlines: BTreeSet<(u64, Bytes)>,
    /// Keys that currently have at least one subscriber
    watched: HashSet<Bytes, AHash>,
    events: Vec<WatchEvent>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Get the value stored at `k`.
    ///
    /// # Returns
    /// * `Ok(&Value)` if the key exists and has not expired
    /// * `Err(NotFound)` otherwise
    pub fn get(&mut self, k: &[u8], now: u64) -> Result<&Value, StoreError> {
        if !self.live(k, now) {
            return Err(StoreError::NotFound);
        }
        self.inner
            .get(k)
            .map(|e| &e.value)
            .ok_or(StoreError::NotFound)
    }

    /// Set `k` to `v`, replacing any previous value and TTL.
    pub fn set(&mut self, k: Bytes, v: Value, ttl: Option<Duration>, now: u64) -> Result<(), StoreError> {
        let expires_at = ttl.map(|d| deadline_after(now, d));
        if let Some((key, old)) = self.inner.remove_entry(&k[..]) {
            if let Some(d) = old.expires_at {
                self.deadlines.remove(&(d, key));
            }
        }
        if let Some(d) = expires_at {
            self.deadlines.insert((d, k.clone()));
        }
        self.inner.insert(k.clone(), Entry { value: v, expires_at });
        self.emit(&k);
        Ok(())
    }

    /// Delete `k`, returning the removed value.
    ///
    /// Deleting an absent (or expired) key is `NotFound` and records no event.
    pub fn delete(&mut self, k: &[u8], now: u64) -> Result<Value, StoreError> {
        if !self.live(k, now) {
            return Err(StoreError::NotFound);
        }
        let entry = self.remove_entry(k).ok_or(StoreError::NotFound)?;
        self.emit(k);
        Ok(entry.value)
    }

    pub fn exists(&mut self, k: &[u8], now: u64) -> bool {
        self.live(k, now)
    }

    /// Remove every key whose deadline is at or before `now`.
    ///
    /// Returns the number of keys removed.
    pub fn expire_sweep(&mut self, now: u64) -> usize {
        let mut removed = 0;
        while let Some((d, _)) = self.deadlines.first() {
            if *d > now {
                break;
            }
            if let Some((_, key)) = self.deadlines.pop_first() {
                self.inner.remove(&key[..]);
                self.emit(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Add `delta` to the integer at `k`, creating it as 0 if absent.
    pub fn incr_by(&mut self, k: &[u8], delta: i64, now: u64) -> Result<i64, StoreError> {
        let current = match self.get(k, now) {
            Ok(Value::Int(i)) => *i,
            Ok(Value::Str(s)) => std::str::from_utf8(s)
                .ok()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or(StoreError::TypeMismatch)?,
            Ok(_) => return Err(StoreError::WrongType),
            Err(_) => 0,
        };
        let next = current.checked_add(delta).ok_or(StoreError::TypeMismatch)?;
        match self.inner.get_mut(k) {
            // keep the TTL of an existing key
            Some(e) => e.value = Value::Int(next),
            None => {
                self.inner.insert(
                    Bytes::copy_from_slice(k),
                    Entry {
                        value: Value::Int(next),
                        expires_at: None,
                    },
                );
            }
        }
        self.emit(k);
        Ok(next)
    }

    /// Give `k` a TTL. A zero TTL deletes the key immediately.
    pub fn expire(&mut self, k: &[u8], ttl: Duration, now: u64) -> Result<(), StoreError> {
        if !self.live(k, now) {
            return Err(StoreError::NotFound);
        }
        if ttl.is_zero() {
            self.remove_entry(k);
            self.emit(k);
            return Ok(());
        }
        let deadline = deadline_after(now, ttl);
        if let Some((key, entry)) = self.inner.get_key_value(k) {
            let key = key.clone();
            if let Some(old) = entry.expires_at {
                self.deadlines.remove(&(old, key.clone()));
            }
            self.deadlines.insert((deadline, key));
        }
        if let Some(e) = self.inner.get_mut(k) {
            e.expires_at = Some(deadline);
        }
        Ok(())
    }

    /// Remove the TTL of `k`. Returns whether a TTL was removed.
    pub fn persist(&mut self, k: &[u8], now: u64) -> Result<bool, StoreError> {
        if !self.live(k, now) {
            return Err(StoreError::NotFound);
        }
        let Some((key, entry)) = self.inner.get_key_value(k) else {
            return Err(StoreError::NotFound);
        };
        let Some(d) = entry.expires_at else {
            return Ok(false);
        };
        let key = key.clone();
        self.deadlines.remove(&(d, key));
        if let Some(e) = self.inner.get_mut(k) {
            e.expires_at = None;
        }
        Ok(true)
    }

    /// Remaining TTL in milliseconds; `None` when the key has no TTL.
    pub fn ttl(&mut self, k: &[u8], now: u64) -> Result<Option<u64>, StoreError> {
        if !self.live(k, now) {
            return Err(StoreError::NotFound);
        }
        Ok(self
            .inner
            .get(k)
            .and_then(|e| e.expires_at)
            .map(|d| d.saturating_sub(now)))
    }

    /// Move the value (and TTL) at `from` to `to`.
    pub fn rename(&mut self, from: &[u8], to: Bytes, now: u64) -> Result<(), StoreError> {
        if !self.live(from, now) {
            return Err(StoreError::NotFound);
        }
        if from == &to[..] {
            return Ok(());
        }
        let entry = self.remove_entry(from).ok_or(StoreError::NotFound)?;
        self.emit(from);
        self.remove_entry(&to[..]);
        if let Some(d) = entry.expires_at {
            self.deadlines.insert((d, to.clone()));
        }
        self.inner.insert(to.clone(), entry);
        self.emit(&to);
        Ok(())
    }

    /// TYPE of `k`, or "none".
    pub fn type_of(&mut self, k: &[u8], now: u64) -> &'static str {
        self.get(k, now).map(Value::kind).unwrap_or("none")
    }

    /// Push values onto a list, creating it if needed. Returns the new length.
    pub fn push(&mut self, k: &[u8], values: Vec<Bytes>, end: End, now: u64) -> Result<usize, StoreError> {
        if values.is_empty() {
            return self.llen(k, now);
        }
        self.live(k, now);
        let entry = self
            .inner
            .entry(Bytes::copy_from_slice(k))
            .or_insert_with(|| Entry {
                value: Value::List(VecDeque::new()),
                expires_at: None,
            });
        let Value::List(list) = &mut entry.value else {
            return Err(StoreError::WrongType);
        };
        for v in values {
            match end {
                End::Left => list.push_front(v),
                End::Right => list.push_back(v),
            }
        }
        let len = list.len();
        self.emit(k);
        Ok(len)
    }

    /// Pop one element. An emptied list is removed.
    pub fn pop(&mut self, k: &[u8], end: End, now: u64) -> Result<Bytes, StoreError> {
        if !self.live(k, now) {
            return Err(StoreError::NotFound);
        }
        let Some(Entry { value: Value::List(list), .. }) = self.inner.get_mut(k) else {
            return Err(StoreError::WrongType);
        };
        let item = match end {
            End::Left => list.pop_front(),
            End::Right => list.pop_back(),
        }
        .ok_or(StoreError::NotFound)?;
        if list.is_empty() {
            self.remove_entry(k);
        }
        self.emit(k);
        Ok(item)
    }

    /// Elements between `start` and `stop` inclusive; negative indexes count
    /// from the tail.
    pub fn lrange(&mut self, k: &[u8], start: i64, stop: i64, now: u64) -> Result<Vec<Bytes>, StoreError> {
        let list = match self.get(k, now) {
            Ok(Value::List(l)) => l,
            Ok(_) => return Err(StoreError::WrongType),
            Err(_) => return Ok(Vec::new()),
        };
        let len = list.len() as i64;
        let norm = |i: i64| if i < 0 { len.saturating_add(i) } else { i };
        let (start, stop) = (norm(start), norm(stop));
        if stop < 0 || start > stop || start >= len {
            return Ok(Vec::new());
        }
        let (start, stop) = (start.max(0), stop.min(len - 1));
        Ok(list
            .range(start as usize..=stop as usize)
            .cloned()
            .collect())
    }

    pub fn llen(&mut self, k: &[u8], now: u64) -> Result<usize, StoreError> {
        match self.get(k, now) {
            Ok(Value::List(l)) => Ok(l.len()),
            Ok(_) => Err(StoreError::WrongType),
            Err(_) => Ok(0),
        }
    }

    /// Set hash fields. Returns the number of fields that were added.
    pub fn hset(&mut self, k: &[u8], fields: Vec<(Bytes, Bytes)>, now: u64) -> Result<usize, StoreError> {
        self.live(k, now);
        let entry = self
            .inner
            .entry(Bytes::copy_from_slice(k))
            .or_insert_with(|| Entry {
                value: Value::Hash(HashValue::default()),
                expires_at: None,
            });
        let Value::Hash(h) = &mut entry.value else {
            return Err(StoreError::WrongType);
        };
        let mut added = 0;
        for (f, v) in fields {
            if h.insert(f, v).is_none() {
                added += 1;
            }
        }
        self.emit(k);
        Ok(added)
    }

    pub fn hget(&mut self, k: &[u8], field: &[u8], now: u64) -> Result<Option<Bytes>, StoreError> {
        match self.get(k, now) {
            Ok(Value::Hash(h)) => Ok(h.get(field).cloned()),
            Ok(_) => Err(StoreError::WrongType),
            Err(_) => Ok(None),
        }
    }

    /// Remove hash fields. An emptied hash is removed.
    pub fn hdel(&mut self, k: &[u8], fields: &[Bytes], now: u64) -> Result<usize, StoreError> {
        if !self.live(k, now) {
            return Ok(0);
        }
        let Some(Entry { value: Value::Hash(h), .. }) = self.inner.get_mut(k) else {
            return Err(StoreError::WrongType);
        };
        let removed = fields.iter().filter(|f| h.remove(&f[..]).is_some()).count();
        let emptied = h.is_empty();
        if emptied {
            self.remove_entry(k);
        }
        if removed > 0 {
            self.emit(k);
        }
        Ok(removed)
    }

    pub fn hgetall(&mut self, k: &[u8], now: u64) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        match self.get(k, now) {
            Ok(Value::Hash(h)) => Ok(h.iter().map(|(f, v)| (f.clone(), v.clone())).collect()),
            Ok(_) => Err(StoreError::WrongType),
            Err(_) => Ok(Vec::new()),
        }
    }

    /// Drop every key. Watched keys get a deletion event.
    pub fn flush(&mut self) {
        let keys: Vec<Bytes> = self.inner.keys().cloned().collect();
        self.inner.clear();
        self.deadlines.clear();
        for k in keys {
            self.emit(&k);
        }
    }

    //
    // Watch support
    //

    /// Start recording events for `k`.
    pub fn watch_key(&mut self, k: Bytes) {
        self.watched.insert(k);
    }

    /// Stop recording events for `k`.
    pub fn unwatch_key(&mut self, k: &[u8]) {
        self.watched.remove(k);
    }

    /// Events recorded since the last call, in mutation order.
    pub fn take_events(&mut self) -> Vec<WatchEvent> {
        std::mem::take(&mut self.events)
    }

    /// Lazy expiry: returns whether `k` exists, removing it first if its
    /// deadline has passed.
    fn live(&mut self, k: &[u8], now: u64) -> bool {
        match self.inner.get(k) {
            None => false,
            Some(e) if e.is_expired(now) => {
                self.remove_entry(k);
                self.emit(k);
                false
            }
            Some(_) => true,
        }
    }

    fn remove_entry(&mut self, k: &[u8]) -> Option<Entry> {
        let (key, entry) = self.inner.remove_entry(k)?;
        if let Some(d) = entry.expires_at {
            self.deadlines.remove(&(d, key));
        }
        Some(entry)
    }

    /// Record the current state of `k` if anyone is watching it.
    fn emit(&mut self, k: &[u8]) {
        if let Some(key) = self.watched.get(k) {
            let state = self.inner.get(k).map(|e| e.value.clone());
            self.events.push(WatchEvent {
                key: key.clone(),
                state,
            });
        }
    }
}
