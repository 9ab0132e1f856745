use std::collections::HashMap;
use std::hash::Hash;

/// Callback invoked exactly once for each entry evicted from the cache,
/// receiving the key and the owned value.
pub type EvictCallback<K, V> = Box<dyn FnMut(&K, V) + Send + Sync>;

/// A capacity-bounded LRU cache with per-entry refcount pinning.
///
/// An entry with a nonzero refcount is never evicted: pruning skips it and
/// the cache temporarily overshoots its capacity instead. Callers must pair
/// every `pin` with an `unpin` once they are done with the value.
///
/// The recency list is an intrusive doubly-linked list over a slot arena,
/// so promotion and eviction are O(1) without unsafe code.
pub struct Cache<K, V> {
    capacity: usize,
    map: HashMap<K, usize>,
    slots: Vec<Option<Entry<K, V>>>,
    free: Vec<usize>,
    /// Most recently used slot.
    head: Option<usize>,
    /// Least recently used slot.
    tail: Option<usize>,
    on_evict: Option<EvictCallback<K, V>>,
}

struct Entry<K, V> {
    key: K,
    value: V,
    refs: u64,
    prev: Option<usize>,
    next: Option<usize>,
}

impl<K: Clone + Eq + Hash, V> Cache<K, V> {
    pub fn new(capacity: usize, on_evict: Option<EvictCallback<K, V>>) -> Self {
        Self {
            capacity,
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            on_evict,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts a value. An existing entry is replaced and promoted without
    /// touching its refcount. Otherwise, a cache at capacity first prunes
    /// unpinned entries down to capacity - 1; the insert goes through even
    /// if nothing could be evicted. New entries start with refcount 0 at
    /// the most-recent position.
    pub fn put(&mut self, key: K, value: V) {
        if let Some(&index) = self.map.get(&key) {
            self.slots[index].as_mut().unwrap().value = value;
            self.promote(index);
            return;
        }
        if self.map.len() >= self.capacity {
            self.prune(self.capacity.saturating_sub(1), false);
        }
        let entry = Entry { key: key.clone(), value, refs: 0, prev: None, next: None };
        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index] = Some(entry);
                index
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.push_front(index);
        self.map.insert(key, index);
    }

    /// Looks up a value, promoting it and incrementing its refcount. A miss
    /// returns None and does not disturb recency.
    pub fn pin(&mut self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let index = *self.map.get(key)?;
        self.promote(index);
        let entry = self.slots[index].as_mut().unwrap();
        entry.refs += 1;
        Some(entry.value.clone())
    }

    /// Releases one pin on an entry, saturating at zero. Unknown keys are
    /// ignored (the entry may have been force-evicted by close).
    pub fn unpin(&mut self, key: &K) {
        if let Some(&index) = self.map.get(key) {
            let entry = self.slots[index].as_mut().unwrap();
            entry.refs = entry.refs.saturating_sub(1);
        }
    }

    /// Evicts least-recently-used entries until at most `limit` remain.
    /// Pinned entries are skipped unless `force` is set. Each eviction
    /// invokes the callback exactly once.
    pub fn prune(&mut self, limit: usize, force: bool) {
        let mut victims = Vec::new();
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            if self.map.len() - victims.len() <= limit {
                break;
            }
            let entry = self.slots[index].as_ref().unwrap();
            cursor = entry.prev;
            if entry.refs > 0 && !force {
                continue;
            }
            victims.push(index);
        }
        for index in victims {
            self.evict(index);
        }
    }

    /// Removes a specific entry regardless of its refcount, invoking the
    /// eviction callback. Returns true if the key was present.
    pub fn remove(&mut self, key: &K) -> bool {
        match self.map.get(key) {
            Some(&index) => {
                self.evict(index);
                true
            }
            None => false,
        }
    }

    /// Removes every entry matching the predicate, regardless of refcount.
    pub fn remove_if(&mut self, pred: impl Fn(&K) -> bool) {
        let keys: Vec<K> = self.map.keys().filter(|k| pred(k)).cloned().collect();
        for key in keys {
            self.remove(&key);
        }
    }

    /// Evicts every entry, pinned or not, running the eviction callback
    /// for each.
    pub fn close(&mut self) {
        self.prune(0, true);
    }

    fn evict(&mut self, index: usize) {
        self.unlink(index);
        let entry = self.slots[index].take().unwrap();
        self.map.remove(&entry.key);
        self.free.push(index);
        if let Some(on_evict) = self.on_evict.as_mut() {
            on_evict(&entry.key, entry.value);
        }
    }

    fn promote(&mut self, index: usize) {
        self.unlink(index);
        self.push_front(index);
    }

    fn unlink(&mut self, index: usize) {
        let (prev, next) = {
            let entry = self.slots[index].as_ref().unwrap();
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.slots[p].as_mut().unwrap().next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.slots[n].as_mut().unwrap().prev = prev,
            None => self.tail = prev,
        }
        let entry = self.slots[index].as_mut().unwrap();
        entry.prev = None;
        entry.next = None;
    }

    fn push_front(&mut self, index: usize) {
        let entry = self.slots[index].as_mut().unwrap();
        entry.prev = None;
        entry.next = self.head;
        if let Some(old) = self.head {
            self.slots[old].as_mut().unwrap().prev = Some(index);
        }
        self.head = Some(index);
        if self.tail.is_none() {
            self.tail = Some(index);
        }
    }
}
