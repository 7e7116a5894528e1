use std::hash::{BuildHasher, BuildHasherDefault, DefaultHasher, Hash};

/// Fixed size open addressing table collapsing repeated keys into one entry holding the highest
/// value seen for that key.
///
/// The table is sized once to a power of two of at least twice `max_unique` and never resizes.
/// Occupied buckets are tracked in a dense list so [`DedupTable::clear`] and iteration cost
/// `O(len)` rather than `O(buckets)`.
///
/// Inserting more than `max_unique` distinct keys is a contract violation and panics; callers
/// check [`DedupTable::is_full`] and [`DedupTable::contains`] first.
#[derive(Debug)]
pub struct DedupTable<K, V, S = BuildHasherDefault<DefaultHasher>> {
    buckets: Vec<Option<(K, V)>>,
    occupied: Vec<u32>,
    mask: usize,
    max_unique: usize,
    hasher: S,
}

impl<K: Copy + Eq + Hash, V: Copy + Ord> DedupTable<K, V> {
    pub fn new(max_unique: usize) -> Self {
        Self::with_hasher(max_unique, BuildHasherDefault::default())
    }
}

impl<K: Copy + Eq + Hash, V: Copy + Ord, S: BuildHasher> DedupTable<K, V, S> {
    pub fn with_hasher(max_unique: usize, hasher: S) -> Self {
        let bucket_count = (max_unique.max(1) * 2).next_power_of_two();
        Self {
            buckets: vec![None; bucket_count],
            occupied: Vec::with_capacity(max_unique),
            mask: bucket_count - 1,
            max_unique,
            hasher,
        }
    }

    pub fn len(&self) -> usize {
        self.occupied.len()
    }

    pub fn is_empty(&self) -> bool {
        self.occupied.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.occupied.len() >= self.max_unique
    }

    pub fn max_unique(&self) -> usize {
        self.max_unique
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket_index(&self, key: &K) -> usize {
        let mut index = self.hasher.hash_one(key) as usize & self.mask;
        loop {
            match &self.buckets[index] {
                Some((existing, _)) if existing != key => index = (index + 1) & self.mask,
                _ => return index,
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.buckets[self.bucket_index(key)].is_some()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.buckets[self.bucket_index(key)].map(|(_, value)| value)
    }

    /// Inserts `key` or raises its stored value to `value`. Returns `true` if the key was new.
    pub fn insert_or_max(&mut self, key: K, value: V) -> bool {
        let index = self.bucket_index(&key);
        let bucket = &mut self.buckets[index];
        if let Some((_, existing)) = bucket {
            *existing = (*existing).max(value);
            return false;
        }
        assert!(
            self.occupied.len() < self.max_unique,
            "Dedup table overflow: more than {} unique keys",
            self.max_unique
        );
        *bucket = Some((key, value));
        self.occupied.push(index as u32);
        true
    }

    /// Entries in first-insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (K, V)> + '_ {
        self.occupied
            .iter()
            .filter_map(|index| self.buckets[*index as usize])
    }

    pub fn clear(&mut self) {
        for index in self.occupied.drain(..) {
            self.buckets[index as usize] = None;
        }
    }
}
