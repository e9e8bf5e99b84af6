use std::hash::Hash;
use linked_hash_map::LinkedHashMap;
use parking_lot::Mutex;

/// LRU (Least Recently Used) replacement policy.
///
/// Membership tracks "unpinned in the buffer pool": frames are inserted when
/// their pin count drops to zero and erased when they are pinned again. The
/// victim is the entry touched least recently.
pub struct LruReplacer<T: Hash + Eq + Clone> {
    inner: Mutex<LinkedHashMap<T, ()>>,
}

impl<T: Hash + Eq + Clone> LruReplacer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LinkedHashMap::new()),
        }
    }

    /// Record `value` as most recently used, inserting it if absent.
    pub fn insert(&self, value: T) {
        let mut map = self.inner.lock();
        map.remove(&value);
        map.insert(value, ());
    }

    /// Pop the least recently used entry, if any.
    pub fn victim(&self) -> Option<T> {
        self.inner.lock().pop_front().map(|(v, ())| v)
    }

    /// Remove `value` regardless of its position. Returns whether it was
    /// present.
    pub fn erase(&self, value: &T) -> bool {
        self.inner.lock().remove(value).is_some()
    }

    pub fn size(&self) -> usize {
        self.inner.lock().len()
    }
}

impl<T: Hash + Eq + Clone> Default for LruReplacer<T> {
    fn default() -> Self {
        Self::new()
    }
}
