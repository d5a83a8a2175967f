//! Arena-index LRU store with O(1) touch and evict.
//!
//! Entries live in a slot arena linked into a doubly-linked recency list by
//! stable index; the map points keys at slots. No owning references, no
//! allocation per touch.

use std::collections::HashMap;

use super::entry::CachedResponse;

const NIL: usize = usize::MAX;

struct Slot {
    prev: usize,
    next: usize,
    key: String,
    resp: CachedResponse,
}

pub(crate) struct LruStore {
    capacity: usize,
    map: HashMap<String, usize>,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl LruStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: HashMap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Fetch an entry and move it to the MRU position.
    pub fn get(&mut self, key: &str) -> Option<&CachedResponse> {
        let idx = *self.map.get(key)?;
        self.move_to_front(idx);
        self.slots[idx].as_ref().map(|slot| &slot.resp)
    }

    /// Insert or replace an entry at the MRU position, evicting the LRU
    /// entry at capacity. Returns the evicted key, if any.
    pub fn insert(&mut self, key: &str, resp: CachedResponse) -> Option<String> {
        if let Some(&idx) = self.map.get(key) {
            let slot = self.slots[idx].as_mut().expect("occupied lru slot");
            slot.resp = resp;
            self.move_to_front(idx);
            return None;
        }

        let mut evicted = None;
        if self.map.len() >= self.capacity {
            evicted = self.pop_back();
        }

        let slot = Slot {
            prev: NIL,
            next: NIL,
            key: key.to_string(),
            resp,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.push_front(idx);
        self.map.insert(key.to_string(), idx);
        evicted
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let Some(idx) = self.map.remove(key) else {
            return false;
        };
        self.unlink(idx);
        self.slots[idx] = None;
        self.free.push(idx);
        true
    }

    pub fn purge_prefix(&mut self, prefix: &str) -> usize {
        let keys: Vec<String> = self
            .map
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    fn pop_back(&mut self) -> Option<String> {
        let idx = self.tail;
        if idx == NIL {
            return None;
        }
        self.unlink(idx);
        let slot = self.slots[idx].take().expect("occupied lru tail");
        self.free.push(idx);
        self.map.remove(&slot.key);
        Some(slot.key)
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.unlink(idx);
        self.push_front(idx);
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        {
            let slot = self.slots[idx].as_mut().expect("occupied lru slot");
            slot.prev = NIL;
            slot.next = old_head;
        }
        if old_head != NIL {
            self.slots[old_head].as_mut().expect("occupied lru head").prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let slot = self.slots[idx].as_ref().expect("occupied lru slot");
            (slot.prev, slot.next)
        };
        if prev != NIL {
            self.slots[prev].as_mut().expect("occupied lru slot").next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].as_mut().expect("occupied lru slot").prev = prev;
        } else {
            self.tail = prev;
        }
        let slot = self.slots[idx].as_mut().expect("occupied lru slot");
        slot.prev = NIL;
        slot.next = NIL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::SystemTime;

    fn resp(marker: &str) -> CachedResponse {
        let now = SystemTime::UNIX_EPOCH;
        CachedResponse {
            status: 200,
            headers: Vec::new(),
            body: Bytes::from(marker.to_string()),
            cached_at: now,
            expires: now,
            stale_until: now,
            etag: None,
            last_modified: None,
        }
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut store = LruStore::new(2);
        assert_eq!(store.insert("a", resp("a")), None);
        assert_eq!(store.insert("b", resp("b")), None);

        // Touch `a` so `b` becomes LRU.
        assert!(store.get("a").is_some());
        assert_eq!(store.insert("c", resp("c")), Some("b".to_string()));

        assert!(store.get("b").is_none());
        assert!(store.get("a").is_some());
        assert!(store.get("c").is_some());
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn duplicate_insert_replaces_and_touches() {
        let mut store = LruStore::new(2);
        store.insert("a", resp("a1"));
        store.insert("b", resp("b"));
        store.insert("a", resp("a2"));

        // `b` is now LRU and should be the eviction victim.
        assert_eq!(store.insert("c", resp("c")), Some("b".to_string()));
        assert_eq!(store.get("a").unwrap().body, Bytes::from_static(b"a2"));
    }

    #[test]
    fn remove_and_slot_reuse() {
        let mut store = LruStore::new(4);
        store.insert("a", resp("a"));
        store.insert("b", resp("b"));
        assert!(store.remove("a"));
        assert!(!store.remove("a"));
        store.insert("c", resp("c"));
        assert_eq!(store.len(), 2);
        assert!(store.get("b").is_some());
        assert!(store.get("c").is_some());
    }

    #[test]
    fn purge_prefix_removes_matching_keys() {
        let mut store = LruStore::new(8);
        store.insert("GET|h|/api/a||", resp("1"));
        store.insert("GET|h|/api/b||", resp("2"));
        store.insert("GET|h|/web/a||", resp("3"));

        assert_eq!(store.purge_prefix("GET|h|/api/"), 2);
        assert_eq!(store.len(), 1);
        assert!(store.get("GET|h|/web/a||").is_some());
    }
}
