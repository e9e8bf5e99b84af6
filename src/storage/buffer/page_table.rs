use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use parking_lot::Mutex;

/// Default number of entries a bucket holds before it splits.
pub const DEFAULT_BUCKET_SIZE: usize = 64;

/// In-memory extendible hash table.
///
/// The buffer pool uses this to map page IDs to resident frames. A directory
/// of `2^global_depth` slots indexes buckets of `local_depth <= global_depth`;
/// only an overflowing bucket splits and, when its local depth would exceed
/// the global depth, the directory doubles.
///
/// Lock order is always table latch before bucket latch. Readers resolve the
/// directory entry under the table latch and then only hold the bucket latch.
pub struct ExtendibleHashTable<K, V> {
    bucket_size: usize,
    state: Mutex<TableState<K, V>>,
}

struct TableState<K, V> {
    global_depth: u32,
    num_buckets: usize,
    directory: Vec<Arc<Bucket<K, V>>>,
}

struct Bucket<K, V> {
    data: Mutex<BucketData<K, V>>,
}

struct BucketData<K, V> {
    local_depth: u32,
    entries: HashMap<K, V>,
}

impl<K, V> Bucket<K, V> {
    fn new(local_depth: u32) -> Self {
        Self {
            data: Mutex::new(BucketData {
                local_depth,
                entries: HashMap::new(),
            }),
        }
    }
}

impl<K, V> Default for ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new(DEFAULT_BUCKET_SIZE)
    }
}

impl<K, V> ExtendibleHashTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a hash table whose buckets hold up to `bucket_size` entries.
    pub fn new(bucket_size: usize) -> Self {
        assert!(bucket_size > 0, "bucket size must be positive");
        Self {
            bucket_size,
            state: Mutex::new(TableState {
                global_depth: 0,
                num_buckets: 1,
                directory: vec![Arc::new(Bucket::new(0))],
            }),
        }
    }

    fn hash_key(key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// Resolve the bucket a key currently maps to.
    fn bucket_for(&self, key: &K) -> Arc<Bucket<K, V>> {
        let state = self.state.lock();
        let idx = (Self::hash_key(key) & ((1u64 << state.global_depth) - 1)) as usize;
        state.directory[idx].clone()
    }

    /// Look up the value associated with a key.
    pub fn get(&self, key: &K) -> Option<V> {
        let bucket = self.bucket_for(key);
        let data = bucket.data.lock();
        data.entries.get(key).cloned()
    }

    /// Insert or overwrite a key/value pair, splitting the target bucket as
    /// many times as the new entry requires.
    pub fn insert(&self, key: K, value: V) {
        loop {
            let bucket = self.bucket_for(&key);
            {
                let mut data = bucket.data.lock();
                if data.entries.contains_key(&key) || data.entries.len() < self.bucket_size {
                    data.entries.insert(key, value);
                    return;
                }
            }

            // Overflow: split under the table latch, then retry. The retry is
            // required because the key may still land in a full bucket after
            // one split.
            self.split_bucket(&key);
        }
    }

    fn split_bucket(&self, key: &K) {
        let mut state = self.state.lock();
        let idx = (Self::hash_key(key) & ((1u64 << state.global_depth) - 1)) as usize;
        let bucket = state.directory[idx].clone();
        let mut data = bucket.data.lock();

        // Another thread may have split this bucket already
        if data.entries.len() < self.bucket_size {
            return;
        }

        let mask = 1u64 << data.local_depth;
        data.local_depth += 1;

        if data.local_depth > state.global_depth {
            // Double the directory; both halves point at the same buckets
            let len = state.directory.len();
            for i in 0..len {
                let b = state.directory[i].clone();
                state.directory.push(b);
            }
            state.global_depth += 1;
        }
        state.num_buckets += 1;

        // Move every entry whose hash has the newly significant bit set
        let new_bucket = Arc::new(Bucket::new(data.local_depth));
        {
            let mut new_data = new_bucket.data.lock();
            let moved: Vec<K> = data
                .entries
                .keys()
                .filter(|k| Self::hash_key(k) & mask != 0)
                .cloned()
                .collect();
            for k in moved {
                if let Some(v) = data.entries.remove(&k) {
                    new_data.entries.insert(k, v);
                }
            }
        }

        // Redirect directory slots that referenced the old bucket and have
        // the split bit set
        for i in 0..state.directory.len() {
            if Arc::ptr_eq(&state.directory[i], &bucket) && (i as u64 & mask) != 0 {
                state.directory[i] = new_bucket.clone();
            }
        }
    }

    /// Remove a key. Buckets never merge and the directory never shrinks.
    pub fn remove(&self, key: &K) -> bool {
        let bucket = self.bucket_for(key);
        let mut data = bucket.data.lock();
        data.entries.remove(key).is_some()
    }

    /// Current global depth of the directory.
    pub fn global_depth(&self) -> u32 {
        self.state.lock().global_depth
    }

    /// Local depth of the bucket at the given directory slot, or None for an
    /// empty bucket.
    pub fn local_depth(&self, directory_idx: usize) -> Option<u32> {
        let bucket = {
            let state = self.state.lock();
            state.directory.get(directory_idx)?.clone()
        };
        let data = bucket.data.lock();
        if data.entries.is_empty() {
            None
        } else {
            Some(data.local_depth)
        }
    }

    /// Number of distinct buckets.
    pub fn num_buckets(&self) -> usize {
        self.state.lock().num_buckets
    }

    /// Total number of entries across all buckets.
    pub fn len(&self) -> usize {
        let buckets: Vec<_> = {
            let state = self.state.lock();
            let mut unique: Vec<Arc<Bucket<K, V>>> = Vec::new();
            for b in &state.directory {
                if !unique.iter().any(|u| Arc::ptr_eq(u, b)) {
                    unique.push(b.clone());
                }
            }
            unique
        };
        buckets.iter().map(|b| b.data.lock().entries.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every key currently stored.
    pub fn keys(&self) -> Vec<K> {
        let buckets: Vec<_> = {
            let state = self.state.lock();
            let mut unique: Vec<Arc<Bucket<K, V>>> = Vec::new();
            for b in &state.directory {
                if !unique.iter().any(|u| Arc::ptr_eq(u, b)) {
                    unique.push(b.clone());
                }
            }
            unique
        };
        let mut keys = Vec::new();
        for b in buckets {
            keys.extend(b.data.lock().entries.keys().cloned());
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_insert_and_get() {
        let table: ExtendibleHashTable<u32, String> = ExtendibleHashTable::new(4);
        table.insert(1, "a".to_string());
        table.insert(2, "b".to_string());

        assert_eq!(table.get(&1), Some("a".to_string()));
        assert_eq!(table.get(&2), Some("b".to_string()));
        assert_eq!(table.get(&3), None);
    }

    #[test]
    fn test_overwrite_existing_key() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);
        table.insert(7, 70);
        table.insert(7, 71);
        assert_eq!(table.get(&7), Some(71));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(4);
        table.insert(5, 50);
        assert!(table.remove(&5));
        assert!(!table.remove(&5));
        assert_eq!(table.get(&5), None);
    }

    #[test]
    fn test_bucket_split_and_directory_growth() {
        // bucket size 2 forces splits quickly
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);
        assert_eq!(table.global_depth(), 0);
        assert_eq!(table.num_buckets(), 1);

        for k in 0..64u32 {
            table.insert(k, k * 10);
        }

        // With 64 entries and bucket capacity 2, the table must have split
        // many times and the directory must have doubled repeatedly.
        assert!(table.num_buckets() > 1);
        assert!(table.global_depth() >= 3);

        // Every entry survives redistribution
        for k in 0..64u32 {
            assert_eq!(table.get(&k), Some(k * 10), "lost key {} after splits", k);
        }
        assert_eq!(table.len(), 64);
    }

    #[test]
    fn test_local_depth_bounded_by_global_depth() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::new(2);
        for k in 0..32u32 {
            table.insert(k, k);
        }
        let global = table.global_depth();
        for idx in 0..(1usize << global) {
            if let Some(local) = table.local_depth(idx) {
                assert!(local <= global);
            }
        }
    }

    #[test]
    fn test_default_bucket_size() {
        let table: ExtendibleHashTable<u32, u32> = ExtendibleHashTable::default();
        table.insert(1, 1);
        assert_eq!(table.get(&1), Some(1));
    }

    #[test]
    fn test_concurrent_insert_and_find() {
        let table: Arc<ExtendibleHashTable<u32, u32>> = Arc::new(ExtendibleHashTable::new(4));
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let table = table.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200u32 {
                    let key = t * 1000 + i;
                    table.insert(key, key + 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..4u32 {
            for i in 0..200u32 {
                let key = t * 1000 + i;
                assert_eq!(table.get(&key), Some(key + 1));
            }
        }
        assert_eq!(table.len(), 800);
    }
}
