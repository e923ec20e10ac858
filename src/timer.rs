//! Sorted timer list that evicts idle connections.
//!
//! Nodes live in a slab arena and link to each other by key instead of by
//! pointer, so a key handed out for one connection can never alias a node that
//! was since freed and reused by another: removing a key that is no longer
//! present is simply `None`.
//!
//! Invariant: expirations are non-decreasing from head to tail after every
//! operation, and timers with equal expirations keep their insertion order.

use std::time::Instant;

use slab::Slab;

/// Arena key of a timer node.
pub type TimerKey = usize;

#[derive(Debug)]
struct TimerNode<T> {
    expire: Instant,
    owner: T,
    prev: Option<TimerKey>,
    next: Option<TimerKey>,
}

#[derive(Debug)]
pub struct TimerList<T> {
    nodes: Slab<TimerNode<T>>,
    head: Option<TimerKey>,
    tail: Option<TimerKey>,
}

impl<T> Default for TimerList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TimerList<T> {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Slab::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn expire_of(&self, key: TimerKey) -> Option<Instant> {
        self.nodes.get(key).map(|node| node.expire)
    }

    pub fn owner(&self, key: TimerKey) -> Option<&T> {
        self.nodes.get(key).map(|node| &node.owner)
    }

    /// Insert a timer in expiration order and return its key.
    ///
    /// Earlier than the head or not earlier than the tail are both O(1); anything
    /// else walks forward from the head.
    pub fn insert(&mut self, expire: Instant, owner: T) -> TimerKey {
        let key = self.nodes.insert(TimerNode {
            expire,
            owner,
            prev: None,
            next: None,
        });

        match (self.head, self.tail) {
            (Some(head), Some(tail)) => {
                if expire < self.nodes[head].expire {
                    self.link_before(key, head);
                } else if expire >= self.nodes[tail].expire {
                    self.link_after(key, tail);
                } else {
                    self.splice_from(key, head);
                }
            }
            _ => {
                self.head = Some(key);
                self.tail = Some(key);
            }
        }
        key
    }

    /// Move a timer's expiration to `expire` and restore ordering.
    ///
    /// Activity only pushes a deadline later, so the node is re-spliced forward
    /// from where it already sits. An earlier deadline is still handled correctly
    /// by re-inserting from the head. Returns `false` for an unknown key.
    pub fn adjust(&mut self, key: TimerKey, expire: Instant) -> bool {
        let Some(node) = self.nodes.get_mut(key) else {
            return false;
        };
        let old = node.expire;
        node.expire = expire;

        if expire < old {
            self.unlink(key);
            self.relink_from_head(key);
            return true;
        }

        let Some(next) = self.nodes[key].next else {
            return true;
        };
        if expire < self.nodes[next].expire {
            return true;
        }

        self.unlink(key);
        self.splice_from(key, next);
        true
    }

    /// Unlink and free a timer, handing back its owner.
    pub fn remove(&mut self, key: TimerKey) -> Option<T> {
        if !self.nodes.contains(key) {
            return None;
        }
        self.unlink(key);
        Some(self.nodes.remove(key).owner)
    }

    /// Fire every timer whose expiration is at or before `now`, in order.
    ///
    /// Each expired node is unlinked before `on_expire` sees its owner. Stops at
    /// the first timer that has not yet expired and returns how many fired.
    pub fn tick<F>(&mut self, now: Instant, mut on_expire: F) -> usize
    where
        F: FnMut(T),
    {
        let mut fired = 0;
        while let Some(head) = self.head {
            if now < self.nodes[head].expire {
                break;
            }
            if let Some(owner) = self.remove(head) {
                on_expire(owner);
                fired += 1;
            }
        }
        fired
    }

    /// Iterate head → tail.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            list: self,
            cursor: self.head,
        }
    }

    /// Insert `key` before the first node after `start` (inclusive) that expires
    /// strictly later, or at the tail.
    fn splice_from(&mut self, key: TimerKey, start: TimerKey) {
        let expire = self.nodes[key].expire;
        let mut cursor = Some(start);
        while let Some(at) = cursor {
            if expire < self.nodes[at].expire {
                self.link_before(key, at);
                return;
            }
            cursor = self.nodes[at].next;
        }
        match self.tail {
            Some(tail) => self.link_after(key, tail),
            None => {
                self.head = Some(key);
                self.tail = Some(key);
            }
        }
    }

    fn relink_from_head(&mut self, key: TimerKey) {
        match self.head {
            Some(head) => self.splice_from(key, head),
            None => {
                self.head = Some(key);
                self.tail = Some(key);
            }
        }
    }

    fn link_before(&mut self, key: TimerKey, at: TimerKey) {
        let prev = self.nodes[at].prev;
        self.nodes[key].prev = prev;
        self.nodes[key].next = Some(at);
        self.nodes[at].prev = Some(key);
        match prev {
            Some(prev) => self.nodes[prev].next = Some(key),
            None => self.head = Some(key),
        }
    }

    fn link_after(&mut self, key: TimerKey, at: TimerKey) {
        let next = self.nodes[at].next;
        self.nodes[key].next = next;
        self.nodes[key].prev = Some(at);
        self.nodes[at].next = Some(key);
        match next {
            Some(next) => self.nodes[next].prev = Some(key),
            None => self.tail = Some(key),
        }
    }

    fn unlink(&mut self, key: TimerKey) {
        let (prev, next) = {
            let node = &mut self.nodes[key];
            (node.prev.take(), node.next.take())
        };
        match prev {
            Some(prev) => self.nodes[prev].next = next,
            None => self.head = next,
        }
        match next {
            Some(next) => self.nodes[next].prev = prev,
            None => self.tail = prev,
        }
    }
}

pub struct Iter<'a, T> {
    list: &'a TimerList<T>,
    cursor: Option<TimerKey>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Instant, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.cursor?;
        let node = &self.list.nodes[key];
        self.cursor = node.next;
        Some((node.expire, &node.owner))
    }
}
