/*!
 * Watch Registry
 *
 * Per-shard table of standing WATCH subscriptions. Every subscription's key
 * is owned by the same shard, so registration, lookup and publishing all
 * happen on that shard's thread without locks.
 */

use crate::bridge::{ConnId, ConnectionRegistry, Outbound};
use crate::protocol::Frame;
use crate::storage::Value;
use bytes::Bytes;
use hashbrown::HashMap;
use rustc_hash::FxHashMap;
use std::fmt;

/// Identifies a subscription; `shard` names the shard that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId {
    pub shard: usize,
    pub seq: u64,
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.shard, self.seq)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub key: Bytes,
    pub conn: ConnId,
}

/// A key's new state after a mutation; `None` means deleted or expired.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchEvent {
    pub key: Bytes,
    pub state: Option<Value>,
}

impl WatchEvent {
    /// The RESP3 push sent to subscribers.
    ///
    /// `>4 watch <key> set <value>` or `>3 watch <key> del`
    pub fn to_push(&self) -> Frame {
        let mut items = vec![
            Frame::bulk(Bytes::from_static(b"watch")),
            Frame::Bulk(self.key.clone()),
        ];
        match &self.state {
            Some(v) => {
                items.push(Frame::bulk(Bytes::from_static(b"set")));
                items.push(v.to_frame());
            }
            None => items.push(Frame::bulk(Bytes::from_static(b"del"))),
        }
        Frame::Push(items)
    }
}

pub struct WatchRegistry {
    shard: usize,
    next_seq: u64,
    subs: FxHashMap<SubscriptionId, Subscription>,
    /// Subscribers per key, in registration order
    by_key: HashMap<Bytes, Vec<SubscriptionId>>,
}

impl WatchRegistry {
    pub fn new(shard: usize) -> Self {
        Self {
            shard,
            next_seq: 1,
            subs: FxHashMap::default(),
            by_key: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }

    pub fn has_subscribers(&self, key: &[u8]) -> bool {
        self.by_key.contains_key(key)
    }

    /// Register interest of `conn` in `key`.
    ///
    /// A connection watching a key it already watches gets its existing
    /// subscription back, so it never receives duplicate pushes.
    pub fn subscribe(&mut self, key: Bytes, conn: ConnId) -> Subscription {
        if let Some(ids) = self.by_key.get(&key[..]) {
            if let Some(existing) = ids
                .iter()
                .filter_map(|id| self.subs.get(id))
                .find(|s| s.conn == conn)
            {
                return existing.clone();
            }
        }

        let id = SubscriptionId {
            shard: self.shard,
            seq: self.next_seq,
        };
        self.next_seq += 1;
        let sub = Subscription { id, key: key.clone(), conn };
        self.by_key.entry(key).or_default().push(id);
        self.subs.insert(id, sub.clone());
        sub
    }

    /// Remove a subscription. Unknown ids are a no-op.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Subscription> {
        let sub = self.subs.remove(&id)?;
        if let Some(ids) = self.by_key.get_mut(&sub.key[..]) {
            ids.retain(|i| *i != id);
            if ids.is_empty() {
                self.by_key.remove(&sub.key[..]);
            }
        }
        Some(sub)
    }

    /// Remove the subscription `conn` holds on `key`, if any.
    pub fn unsubscribe_key(&mut self, key: &[u8], conn: ConnId) -> Option<Subscription> {
        let id = self
            .by_key
            .get(key)?
            .iter()
            .copied()
            .find(|id| self.subs.get(id).is_some_and(|s| s.conn == conn))?;
        self.unsubscribe(id)
    }

    /// Deliver `event` to every subscriber of its key.
    ///
    /// Subscriptions whose connection has gone away are pruned. Returns the
    /// number of deliveries.
    pub fn publish(&mut self, event: &WatchEvent, bridge: &ConnectionRegistry) -> usize {
        let Some(ids) = self.by_key.get(&event.key[..]) else {
            return 0;
        };
        let frame = event.to_push();
        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in ids {
            let Some(sub) = self.subs.get(id) else { continue };
            let msg = Outbound::Push {
                conn: sub.conn,
                frame: frame.clone(),
            };
            if bridge.deliver(sub.conn, msg) {
                delivered += 1;
            } else {
                dead.push(*id);
            }
        }
        for id in dead {
            self.unsubscribe(id);
        }
        delivered
    }
}
