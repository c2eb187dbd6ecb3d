//! Generic key-sorted collection shared by reads, writes and update slots.

use std::cmp::Ordering;

use crate::keys::{KeyRange, PartitionKey, Ranges, Seekable};

/// Position of a sort key relative to a range.
pub trait Routable: Ord {
    /// Entirely at or before the range's (exclusive) start.
    fn before(&self, range: &KeyRange) -> bool;
    /// Entirely after the range's (inclusive) end.
    fn after(&self, range: &KeyRange) -> bool;

    fn intersects(&self, range: &KeyRange) -> bool {
        !self.before(range) && !self.after(range)
    }
}

impl Routable for PartitionKey {
    fn before(&self, range: &KeyRange) -> bool {
        self.routing() <= *range.start()
    }

    fn after(&self, range: &KeyRange) -> bool {
        self.routing() > *range.end()
    }
}

impl Routable for Seekable {
    fn before(&self, range: &KeyRange) -> bool {
        match self {
            Seekable::Key(key) => key.before(range),
            Seekable::Range(r) => r.end() <= range.start(),
        }
    }

    fn after(&self, range: &KeyRange) -> bool {
        match self {
            Seekable::Key(key) => key.after(range),
            Seekable::Range(r) => r.start() >= range.end(),
        }
    }
}

/// An element of a [`KeySorted`] collection.
pub trait KeySortedItem: Clone {
    type Key: Routable + Clone;

    fn key(&self) -> &Self::Key;

    /// Orders items that share a key.
    fn tie_break(&self, other: &Self) -> Ordering;

    fn compare(&self, other: &Self) -> Ordering {
        self.key()
            .cmp(other.key())
            .then_with(|| self.tie_break(other))
    }
}

/// Items kept ordered by key, then by the item's tie-break.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeySorted<T> {
    items: Vec<T>,
}

impl<T> Default for KeySorted<T> {
    fn default() -> Self {
        Self { items: Vec::new() }
    }
}

impl<T: KeySortedItem> KeySorted<T> {
    /// Sorts `items` by key and tie-break.
    pub fn new(mut items: Vec<T>) -> Self {
        items.sort_by(|a, b| a.compare(b));
        Self { items }
    }

    /// Wraps items that are already ordered, e.g. straight off the wire.
    pub fn from_sorted(items: Vec<T>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            items
                .windows(2)
                .all(|w| w[0].compare(&w[1]) != Ordering::Greater),
            "items are not sorted by key"
        );
        Ok(Self { items })
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    /// Distinct keys in order.
    pub fn keys(&self) -> Vec<T::Key> {
        let mut out: Vec<T::Key> = Vec::with_capacity(self.items.len());
        for item in &self.items {
            if out.last() != Some(item.key()) {
                out.push(item.key().clone());
            }
        }
        out
    }

    /// Items intersecting `ranges`, passed through `clip` for each range they
    /// meet. An item spanning several ranges is emitted once per range.
    pub fn slice<F>(&self, ranges: &Ranges, mut clip: F) -> Self
    where
        F: FnMut(&T, &KeyRange) -> Option<T>,
    {
        let mut out = Vec::new();
        let mut cursor = 0;
        for range in ranges.iter() {
            let start = cursor
                + self.items[cursor..].partition_point(|item| item.key().before(range));
            let mut idx = start;
            while idx < self.items.len() && !self.items[idx].key().after(range) {
                let item = &self.items[idx];
                if item.key().intersects(range) {
                    if let Some(clipped) = clip(item, range) {
                        out.push(clipped);
                    }
                }
                idx += 1;
            }
            cursor = start;
        }
        Self { items: out }
    }

    /// Items whose key appears in `subset`, which must be a sorted subset of
    /// this collection's keys.
    ///
    /// Panics if a subset key is missing, since the twin-pointer scan would
    /// otherwise silently desynchronize.
    pub fn select(&self, subset: &[T::Key]) -> Self {
        let mut out = Vec::new();
        let mut idx = 0;
        for key in subset {
            while idx < self.items.len() && self.items[idx].key() < key {
                idx += 1;
            }
            assert!(
                idx < self.items.len() && self.items[idx].key() == key,
                "selected key is not present in the collection"
            );
            while idx < self.items.len() && self.items[idx].key() == key {
                out.push(self.items[idx].clone());
                idx += 1;
            }
        }
        Self { items: out }
    }

    /// Index of the first item at `key`, if any.
    pub fn find(&self, key: &T::Key) -> Option<usize> {
        let idx = self.items.partition_point(|item| item.key() < key);
        (idx < self.items.len() && self.items[idx].key() == key).then_some(idx)
    }

    /// Calls `action` on every item at `key`, in order.
    pub fn for_each_with_key<'a, F>(&'a self, key: &T::Key, mut action: F)
    where
        F: FnMut(&'a T),
    {
        if let Some(start) = self.find(key) {
            for item in self.items[start..].iter().take_while(|item| item.key() == key) {
                action(item);
            }
        }
    }

    /// Every item at `key`, in order.
    pub fn with_key(&self, key: &T::Key) -> Vec<&T> {
        let mut out = Vec::new();
        self.for_each_with_key(key, |item| out.push(item));
        out
    }

    /// Linear merge; an item that compares equal on both sides is taken
    /// from `self`.
    pub fn merge(&self, other: &Self) -> Self {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() {
            return other.clone();
        }
        let mut out = Vec::with_capacity(self.items.len() + other.items.len());
        let (mut i, mut j) = (0, 0);
        while i < self.items.len() && j < other.items.len() {
            match self.items[i].compare(&other.items[j]) {
                Ordering::Less => {
                    out.push(self.items[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    out.push(other.items[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    out.push(self.items[i].clone());
                    i += 1;
                    j += 1;
                }
            }
        }
        out.extend_from_slice(&self.items[i..]);
        out.extend_from_slice(&other.items[j..]);
        Self { items: out }
    }
}
