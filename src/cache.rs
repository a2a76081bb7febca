use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};

/// Fixed-capacity least-recently-used map from an opaque key to a value. All
/// four operations run in O(1): a slab of doubly linked entries ordered by
/// recency plus a key index. `get` returns a clone so callers can never
/// mutate cached state, and because it touches recency it takes the same
/// exclusive lock as the writers.
pub struct ResourceCache<K, V> {
    inner: Mutex<Lru<K, V>>,
}

struct Lru<K, V> {
    capacity: usize,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    index: HashMap<K, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

struct Entry<K, V> {
    key: K,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K: Eq + Hash + Clone, V: Clone> ResourceCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            inner: Mutex::new(Lru {
                capacity,
                slots: Vec::with_capacity(capacity),
                free: Vec::new(),
                index: HashMap::with_capacity(capacity),
                head: None,
                tail: None,
            }),
        }
    }

    /// Returns a copy of the cached value and marks it most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut lru = self.lock();
        let slot = *lru.index.get(key)?;
        lru.move_to_head(slot);
        lru.slots[slot].as_ref().map(|entry| entry.value.clone())
    }

    /// Inserts at the head, evicting the least recently used entry once the
    /// cache is over capacity. Adding a key that is already present replaces
    /// its value and refreshes its recency.
    pub fn add(&self, key: K, value: V) {
        let mut lru = self.lock();
        if let Some(&slot) = lru.index.get(&key) {
            if let Some(entry) = lru.slots[slot].as_mut() {
                entry.value = value;
            }
            lru.move_to_head(slot);
            return;
        }

        let slot = lru.alloc(key.clone(), value);
        lru.index.insert(key, slot);
        lru.push_head(slot);

        if lru.index.len() > lru.capacity {
            lru.evict_tail();
        }
    }

    /// Discards the entry for `key` if present, splicing its neighbors
    /// together. A miss is a no-op.
    pub fn invalidate(&self, key: &K) {
        let mut lru = self.lock();
        if let Some(slot) = lru.index.remove(key) {
            lru.unlink(slot);
            lru.slots[slot] = None;
            lru.free.push(slot);
        }
    }

    /// Replaces the value for `key` if present without touching its recency.
    pub fn update(&self, key: &K, value: V) {
        let mut lru = self.lock();
        if let Some(&slot) = lru.index.get(key) {
            if let Some(entry) = lru.slots[slot].as_mut() {
                entry.value = value;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lock().index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lru<K, V>> {
        // A panicked holder cannot have left the list half-spliced: every
        // mutation completes before the guard drops.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[cfg(test)]
    fn head_key(&self) -> Option<K> {
        let lru = self.lock();
        lru.head
            .and_then(|slot| lru.slots[slot].as_ref())
            .map(|entry| entry.key.clone())
    }

    #[cfg(test)]
    fn tail_key(&self) -> Option<K> {
        let lru = self.lock();
        lru.tail
            .and_then(|slot| lru.slots[slot].as_ref())
            .map(|entry| entry.key.clone())
    }
}

impl<K: Eq + Hash + Clone, V> Lru<K, V> {
    fn alloc(&mut self, key: K, value: V) -> usize {
        let entry = Entry {
            key,
            value,
            prev: None,
            next: None,
        };
        if let Some(slot) = self.free.pop() {
            self.slots[slot] = Some(entry);
            slot
        } else {
            self.slots.push(Some(entry));
            self.slots.len() - 1
        }
    }

    fn link(&mut self, slot: usize, prev: Option<usize>, next: Option<usize>) {
        if let Some(entry) = self.slots[slot].as_mut() {
            entry.prev = prev;
            entry.next = next;
        }
    }

    /// Splices `slot` out of the list, patching its neighbors and the
    /// head/tail pointers. The single-element case clears both ends.
    fn unlink(&mut self, slot: usize) {
        let (prev, next) = match self.slots[slot].as_ref() {
            Some(entry) => (entry.prev, entry.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(entry) = self.slots[p].as_mut() {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(entry) = self.slots[n].as_mut() {
                    entry.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        self.link(slot, None, None);
    }

    fn push_head(&mut self, slot: usize) {
        self.link(slot, None, self.head);
        if let Some(old) = self.head {
            if let Some(entry) = self.slots[old].as_mut() {
                entry.prev = Some(slot);
            }
        }
        self.head = Some(slot);
        if self.tail.is_none() {
            self.tail = Some(slot);
        }
    }

    fn move_to_head(&mut self, slot: usize) {
        if self.head == Some(slot) {
            return;
        }
        self.unlink(slot);
        self.push_head(slot);
    }

    fn evict_tail(&mut self) {
        let Some(slot) = self.tail else { return };
        if let Some(entry) = self.slots[slot].as_ref() {
            self.index.remove(&entry.key);
        }
        self.unlink(slot);
        self.slots[slot] = None;
        self.free.push(slot);
    }
}
