/// A growable array of key/value pairs kept in ascending key order.
///
/// Lookup is a binary search; keyed insertion and removal shift the tail. Intended for small
/// collections (per-channel packet pools, peer tables) where a contiguous array beats a tree.
#[derive(Debug)]
pub struct SortedVec<K, V> {
    entries: Vec<(K, V)>,
}

impl<K, V> Default for SortedVec<K, V> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K, V> SortedVec<K, V>
where
    K: Ord,
{
    pub fn new() -> Self {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn search(&self, key: &K) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.cmp(key))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.search(key).is_ok()
    }

    pub fn find(&self, key: &K) -> Option<&V> {
        match self.search(key) {
            Ok(idx) => Some(&self.entries[idx].1),
            Err(_) => None,
        }
    }

    pub fn find_mut(&mut self, key: &K) -> Option<&mut V> {
        match self.search(key) {
            Ok(idx) => Some(&mut self.entries[idx].1),
            Err(_) => None,
        }
    }

    /// Inserts `value` at its sorted position, replacing (and dropping) any value already stored
    /// under `key`. Returns a reference to the stored value.
    pub fn insert(&mut self, key: K, value: V) -> &mut V {
        let idx = match self.search(&key) {
            Ok(idx) => {
                self.entries[idx].1 = value;
                idx
            }
            Err(idx) => {
                self.entries.insert(idx, (key, value));
                idx
            }
        };

        &mut self.entries[idx].1
    }

    /// Appends `value` under a key expected to be greater than every stored key. Falls back to a
    /// sorted insert if it is not.
    pub fn push(&mut self, key: K, value: V) -> &mut V {
        let in_order = match self.entries.last() {
            Some((last, _)) => *last < key,
            None => true,
        };

        if in_order {
            self.entries.push((key, value));

            let idx = self.entries.len() - 1;

            &mut self.entries[idx].1
        } else {
            self.insert(key, value)
        }
    }

    /// Returns the value stored under `key`, inserting the result of `f` if none exists.
    pub fn get_or_insert_with<F>(&mut self, key: K, f: F) -> &mut V
    where
        F: FnOnce() -> V,
    {
        let idx = match self.search(&key) {
            Ok(idx) => idx,
            Err(idx) => {
                self.entries.insert(idx, (key, f()));
                idx
            }
        };

        &mut self.entries[idx].1
    }

    /// Removes and returns the value stored under `key`.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        match self.search(key) {
            Ok(idx) => Some(self.entries.remove(idx).1),
            Err(_) => None,
        }
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        self.entries.first().map(|(k, v)| (k, v))
    }

    pub fn pop_first(&mut self) -> Option<(K, V)> {
        if self.entries.is_empty() {
            None
        } else {
            Some(self.entries.remove(0))
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.entries.iter().map(|(k, _)| k)
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut V> {
        self.entries.iter_mut().map(|(_, v)| v)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&K, &mut V)> {
        self.entries.iter_mut().map(|(k, v)| (&*k, v))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
