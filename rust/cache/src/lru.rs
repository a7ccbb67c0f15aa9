use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tephra_types::{HasIndexKey, SegmentFieldKey};

/// Subtype-specific eviction: releases whatever the key addresses and
/// reports the bytes reclaimed. The document instantiation erases forward
/// index slots; the term instantiation erases clustered posting lists.
pub trait Evictor<K>: Send + Sync {
    fn evict(&self, key: &K) -> u64;
}

const NIL: usize = usize::MAX;

struct Node<K> {
    key: K,
    prev: usize,
    next: usize,
}

struct LruState<K> {
    map: HashMap<K, usize>,
    nodes: Vec<Option<Node<K>>>,
    free: Vec<usize>,
    /// Most recently used.
    head: usize,
    /// Least recently used.
    tail: usize,
}

impl<K: Eq + Hash + Clone> LruState<K> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    fn node(&self, slot: usize) -> &Node<K> {
        self.nodes[slot].as_ref().expect("linked slot is occupied")
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node<K> {
        self.nodes[slot].as_mut().expect("linked slot is occupied")
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = {
            let node = self.node(slot);
            (node.prev, node.next)
        };
        if prev == NIL {
            self.head = next;
        } else {
            self.node_mut(prev).next = next;
        }
        if next == NIL {
            self.tail = prev;
        } else {
            self.node_mut(next).prev = prev;
        }
    }

    fn push_front(&mut self, slot: usize) {
        let old_head = self.head;
        {
            let node = self.node_mut(slot);
            node.prev = NIL;
            node.next = old_head;
        }
        if old_head != NIL {
            self.node_mut(old_head).prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn allocate(&mut self, key: K) -> usize {
        let node = Node {
            key,
            prev: NIL,
            next: NIL,
        };
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Some(node);
                slot
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> K {
        let node = self.nodes[slot].take().expect("released slot is occupied");
        self.free.push(slot);
        node.key
    }

    fn pop_tail(&mut self) -> Option<K> {
        if self.tail == NIL {
            return None;
        }
        let slot = self.tail;
        self.unlink(slot);
        let key = self.release(slot);
        self.map.remove(&key);
        Some(key)
    }
}

/// Recency tracker for one class of cache entries. Stores keys only; the
/// payloads live in the owning container, which is reached back through the
/// [`Evictor`] callback. One short mutex guards the whole structure and every
/// critical section is a constant number of pointer splices.
pub struct LruCache<K: Eq + Hash + Clone> {
    state: Mutex<LruState<K>>,
    evicting: AtomicBool,
}

impl<K: Eq + Hash + Clone> Default for LruCache<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> LruCache<K> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LruState::new()),
            evicting: AtomicBool::new(false),
        }
    }

    /// Records an access: `key` becomes strictly more recent than any key
    /// whose touch completed before this call returned. Unknown keys are
    /// inserted.
    pub fn touch(&self, key: K) {
        let mut state = self.state.lock();
        if let Some(&slot) = state.map.get(&key) {
            state.unlink(slot);
            state.push_front(slot);
        } else {
            let slot = state.allocate(key.clone());
            state.map.insert(key, slot);
            state.push_front(slot);
        }
    }

    /// Pops least-recent keys and runs `evictor` on each until `bytes_wanted`
    /// bytes are reclaimed or the cache drains. Non-reentrant: a call that
    /// overlaps another eviction returns 0 immediately and lets the first
    /// pass finish. The callback runs outside the recency lock.
    pub fn evict(&self, bytes_wanted: u64, evictor: &dyn Evictor<K>) -> u64 {
        if self.evicting.swap(true, Ordering::AcqRel) {
            return 0;
        }
        let mut freed = 0u64;
        while freed < bytes_wanted {
            let key = self.state.lock().pop_tail();
            match key {
                Some(key) => freed += evictor.evict(&key),
                None => {
                    tracing::debug!(freed, bytes_wanted, "recency cache drained before target");
                    break;
                }
            }
        }
        self.evicting.store(false, Ordering::Release);
        freed
    }

    /// Drops a key without running eviction, e.g. when the owning container
    /// erased the entry through a non-LRU path.
    pub fn remove(&self, key: &K) {
        let mut state = self.state.lock();
        if let Some(slot) = state.map.remove(key) {
            state.unlink(slot);
            state.release(slot);
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        *state = LruState::new();
    }
}

impl<K: Eq + Hash + Clone + HasIndexKey> LruCache<K> {
    /// Purges every entry belonging to `index`, e.g. on whole-segment drop.
    /// Returns the number of entries removed. Payload teardown is the
    /// caller's job; this only forgets recency.
    pub fn remove_index(&self, index: &SegmentFieldKey) -> usize {
        let mut state = self.state.lock();
        let doomed: Vec<usize> = state
            .map
            .iter()
            .filter(|(key, _)| key.index_key() == index)
            .map(|(_, &slot)| slot)
            .collect();
        for slot in &doomed {
            state.unlink(*slot);
            let key = state.release(*slot);
            state.map.remove(&key);
        }
        doomed.len()
    }
}
