//! Chained hash table with incremental rehashing.
//!
//! The table keeps two bucket arrays: `tables[0]` is the live one, and
//! `tables[1]` only exists while a rehash is in progress. Rehashing moves
//! one bucket's chain at a time, so a resize never stops the world; every
//! lookup, insert and removal pays for one small step. While rehashing,
//! lookups consult both arrays and all inserts go to the new one.

use std::time::Instant;

use ahash::RandomState;

const INITIAL_SIZE: usize = 4;

/// When resizing is disabled (a snapshot child is running and we want to
/// keep copy-on-write pages clean), growth is still forced once the chains
/// get this deep on average.
const FORCE_RESIZE_RATIO: usize = 5;

#[derive(Debug, Clone)]
struct DictEntry<V> {
    key: Vec<u8>,
    hash: u64,
    val: V,
    next: Option<Box<DictEntry<V>>>,
}

#[derive(Debug, Clone)]
struct Table<V> {
    buckets: Vec<Option<Box<DictEntry<V>>>>,
    used: usize,
}

impl<V> Default for Table<V> {
    fn default() -> Self {
        Table {
            buckets: Vec::new(),
            used: 0,
        }
    }
}

impl<V> Table<V> {
    fn with_size(size: usize) -> Self {
        let mut buckets = Vec::with_capacity(size);
        buckets.resize_with(size, || None);
        Table { buckets, used: 0 }
    }

    fn size(&self) -> usize {
        self.buckets.len()
    }

    fn mask(&self) -> usize {
        debug_assert!(!self.buckets.is_empty());
        self.buckets.len() - 1
    }
}

#[derive(Debug, Clone)]
pub struct Dict<V> {
    tables: [Table<V>; 2],
    /// −1 when not rehashing, otherwise the next `tables[0]` bucket to move.
    rehash_idx: isize,
    /// Live safe iterators; rehash steps are suppressed while positive.
    iterators: usize,
    resize_enabled: bool,
    hasher: RandomState,
}

impl<V> Default for Dict<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Dict<V> {
    pub fn new() -> Self {
        Dict {
            tables: [Table::default(), Table::default()],
            rehash_idx: -1,
            iterators: 0,
            resize_enabled: true,
            hasher: RandomState::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.tables[0].used + self.tables[1].used
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total allocated buckets across both tables.
    pub fn capacity(&self) -> usize {
        self.tables[0].size() + self.tables[1].size()
    }

    pub fn is_rehashing(&self) -> bool {
        self.rehash_idx != -1
    }

    /// Enable or disable on-demand resizing. Growth past the forced ratio
    /// happens regardless.
    pub fn set_resize_enabled(&mut self, enabled: bool) {
        self.resize_enabled = enabled;
    }

    fn hash_key(&self, key: &[u8]) -> u64 {
        self.hasher.hash_one(key)
    }

    // ---------------------------------------------------------------- lookup

    /// Look up a key, advancing the rehash by one step.
    pub fn find(&mut self, key: &[u8]) -> Option<&V> {
        self.rehash_step();
        self.peek(key)
    }

    pub fn find_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        self.rehash_step();
        if self.tables[0].size() == 0 {
            return None;
        }
        let hash = self.hash_key(key);
        let rehashing = self.is_rehashing();
        let idx0 = (hash as usize) & self.tables[0].mask();
        let table1_active = rehashing && self.tables[1].size() != 0;
        let idx1 = if table1_active {
            (hash as usize) & self.tables[1].mask()
        } else {
            0
        };

        let [t0, t1] = &mut self.tables;

        let mut cur = t0.buckets[idx0].as_mut();
        while let Some(entry) = cur {
            if entry.hash == hash && entry.key == key {
                return Some(&mut entry.val);
            }
            cur = entry.next.as_mut();
        }

        if table1_active {
            let mut cur = t1.buckets[idx1].as_mut();
            while let Some(entry) = cur {
                if entry.hash == hash && entry.key == key {
                    return Some(&mut entry.val);
                }
                cur = entry.next.as_mut();
            }
        }

        None
    }

    /// Read-only lookup that never advances the rehash.
    pub fn peek(&self, key: &[u8]) -> Option<&V> {
        self.peek_entry(key).map(|e| &e.val)
    }

    pub fn contains_key(&mut self, key: &[u8]) -> bool {
        self.find(key).is_some()
    }

    fn peek_entry(&self, key: &[u8]) -> Option<&DictEntry<V>> {
        if self.tables[0].size() == 0 {
            return None;
        }
        let hash = self.hash_key(key);
        for t in 0..2 {
            if self.tables[t].size() == 0 {
                break;
            }
            let idx = (hash as usize) & self.tables[t].mask();
            let mut cur = self.tables[t].buckets[idx].as_deref();
            while let Some(entry) = cur {
                if entry.hash == hash && entry.key == key {
                    return Some(entry);
                }
                cur = entry.next.as_deref();
            }
            if !self.is_rehashing() {
                break;
            }
        }
        None
    }

    // ---------------------------------------------------------------- insert

    /// Insert a new key. Fails (returning the value) if the key is present.
    pub fn insert(&mut self, key: Vec<u8>, val: V) -> Result<(), V> {
        self.rehash_step();
        if self.peek_entry(&key).is_some() {
            return Err(val);
        }
        self.expand_if_needed();
        let hash = self.hash_key(&key);
        let t = if self.is_rehashing() { 1 } else { 0 };
        let idx = (hash as usize) & self.tables[t].mask();
        let next = self.tables[t].buckets[idx].take();
        self.tables[t].buckets[idx] = Some(Box::new(DictEntry {
            key,
            hash,
            val,
            next,
        }));
        self.tables[t].used += 1;
        Ok(())
    }

    /// Insert or replace. Returns the previous value when the key existed.
    pub fn upsert(&mut self, key: Vec<u8>, val: V) -> Option<V> {
        if let Some(slot) = self.find_mut(&key) {
            return Some(std::mem::replace(slot, val));
        }
        let inserted = self.insert(key, val);
        debug_assert!(inserted.is_ok());
        None
    }

    // ---------------------------------------------------------------- remove

    /// Remove a key and drop its value. Returns the value if present.
    pub fn remove(&mut self, key: &[u8]) -> Option<V> {
        self.unlink(key).map(|(_, v)| v)
    }

    /// Detach a key from the table, handing key and value to the caller.
    /// This is the "peek then free later" path used by async deletion.
    pub fn unlink(&mut self, key: &[u8]) -> Option<(Vec<u8>, V)> {
        if self.tables[0].size() == 0 {
            return None;
        }
        self.rehash_step();
        let hash = self.hash_key(key);
        let rehashing = self.is_rehashing();
        for t in 0..2 {
            if self.tables[t].size() == 0 {
                break;
            }
            let idx = (hash as usize) & self.tables[t].mask();
            let mut cur = &mut self.tables[t].buckets[idx];
            while cur.is_some() {
                let found = {
                    let e = cur.as_ref().unwrap();
                    e.hash == hash && e.key == key
                };
                if found {
                    let mut e = cur.take().unwrap();
                    *cur = e.next.take();
                    self.tables[t].used -= 1;
                    return Some((e.key, e.val));
                }
                cur = &mut cur.as_mut().unwrap().next;
            }
            if !rehashing {
                break;
            }
        }
        None
    }

    /// Drop every entry and release both tables.
    pub fn clear(&mut self) {
        self.tables = [Table::default(), Table::default()];
        self.rehash_idx = -1;
        self.iterators = 0;
    }

    /// Detach the whole table contents in one move, leaving the dict empty.
    /// Used to hand a full keyspace to the background reclaimer.
    pub fn take_all(&mut self) -> Dict<V> {
        std::mem::take(self)
    }

    // ---------------------------------------------------------------- resize

    fn expand_if_needed(&mut self) {
        if self.is_rehashing() {
            return;
        }
        if self.tables[0].size() == 0 {
            self.expand(INITIAL_SIZE);
            return;
        }
        let used = self.tables[0].used;
        let size = self.tables[0].size();
        if used >= size && (self.resize_enabled || used / size > FORCE_RESIZE_RATIO) {
            self.expand(used * 2);
        }
    }

    /// Grow (or first-allocate) the table. The real size is the smallest
    /// power of two holding `size`. Starts an incremental rehash when the
    /// table is already populated.
    pub fn expand(&mut self, size: usize) -> bool {
        if self.is_rehashing() || self.tables[0].used > size {
            return false;
        }
        let realsize = next_power(size);
        if realsize == self.tables[0].size() {
            return false;
        }
        let new_table = Table::with_size(realsize);
        if self.tables[0].size() == 0 {
            self.tables[0] = new_table;
            return true;
        }
        self.tables[1] = new_table;
        self.rehash_idx = 0;
        true
    }

    /// Shrink the table to the minimal size holding the current entries.
    pub fn resize_to_fit(&mut self) -> bool {
        if !self.resize_enabled || self.is_rehashing() {
            return false;
        }
        let minimal = self.tables[0].used.max(INITIAL_SIZE);
        self.expand(minimal)
    }

    /// Whether the table is mostly empty and worth shrinking.
    pub fn needs_resize(&self) -> bool {
        let size = self.tables[0].size();
        let used = self.tables[0].used;
        size > INITIAL_SIZE && used > 0 && used * 100 / size < 10
    }

    // ---------------------------------------------------------------- rehash

    /// Perform up to `n` bucket moves. Visits at most `10 * n` empty
    /// buckets so a sparse table cannot stall the caller. Returns true if
    /// more rehashing remains.
    pub fn rehash(&mut self, n: usize) -> bool {
        if !self.is_rehashing() {
            return false;
        }
        let mut empty_visits = n * 10;
        let mut n = n;
        while n > 0 && self.tables[0].used != 0 {
            n -= 1;
            debug_assert!((self.rehash_idx as usize) < self.tables[0].size());
            while self.tables[0].buckets[self.rehash_idx as usize].is_none() {
                self.rehash_idx += 1;
                empty_visits -= 1;
                if empty_visits == 0 {
                    return true;
                }
            }
            let mut entry = self.tables[0].buckets[self.rehash_idx as usize].take();
            while let Some(mut e) = entry {
                entry = e.next.take();
                let idx = (e.hash as usize) & self.tables[1].mask();
                e.next = self.tables[1].buckets[idx].take();
                self.tables[1].buckets[idx] = Some(e);
                self.tables[0].used -= 1;
                self.tables[1].used += 1;
            }
            self.rehash_idx += 1;
        }
        if self.tables[0].used == 0 {
            self.tables[0] = std::mem::take(&mut self.tables[1]);
            self.rehash_idx = -1;
            return false;
        }
        true
    }

    /// Rehash in batches of 100 buckets for up to `ms` milliseconds.
    pub fn rehash_for_ms(&mut self, ms: u64) -> usize {
        let start = Instant::now();
        let mut moved = 0;
        while self.rehash(100) {
            moved += 100;
            if start.elapsed().as_millis() as u64 >= ms {
                break;
            }
        }
        moved
    }

    fn rehash_step(&mut self) {
        if self.iterators == 0 {
            self.rehash(1);
        }
    }

    // ------------------------------------------------------------- sampling

    /// A uniformly random entry: uniform over non-empty buckets, then
    /// uniform within the chosen chain.
    pub fn random_entry(&mut self) -> Option<(&[u8], &V)> {
        use rand::Rng;
        if self.is_empty() {
            return None;
        }
        self.rehash_step();
        let mut rng = rand::thread_rng();
        let (t, i, pos) = loop {
            let (t, i) = if self.is_rehashing() {
                // Buckets below rehash_idx in tables[0] are already empty.
                let start = self.rehash_idx as usize;
                let total = self.tables[0].size() + self.tables[1].size();
                let idx = start + rng.gen_range(0..total - start);
                if idx >= self.tables[0].size() {
                    (1, idx - self.tables[0].size())
                } else {
                    (0, idx)
                }
            } else {
                (0, rng.gen_range(0..self.tables[0].size()))
            };
            if let Some(head) = self.tables[t].buckets[i].as_deref() {
                let mut len = 1;
                let mut e = head.next.as_deref();
                while let Some(entry) = e {
                    len += 1;
                    e = entry.next.as_deref();
                }
                break (t, i, rng.gen_range(0..len));
            }
        };
        let mut e = self.tables[t].buckets[i].as_deref().unwrap();
        for _ in 0..pos {
            e = e.next.as_deref().unwrap();
        }
        Some((e.key.as_slice(), &e.val))
    }

    /// Collect up to `count` entries, weakly uniform, possibly with
    /// duplicates. Bounded at `10 * count` bucket visits so it degrades to
    /// fewer results rather than a long walk on a sparse table.
    pub fn sample_entries(&mut self, count: usize) -> Vec<(&[u8], &V)> {
        use rand::Rng;
        if self.is_empty() || count == 0 {
            return Vec::new();
        }
        let count = count.min(self.len());
        for _ in 0..count {
            self.rehash_step();
        }
        let mut rng = rand::thread_rng();
        let tables = if self.is_rehashing() { 2 } else { 1 };
        let mut maxmask = self.tables[0].mask();
        if tables > 1 && self.tables[1].size() > self.tables[0].size() {
            maxmask = self.tables[1].mask();
        }

        let mut out: Vec<(&[u8], &V)> = Vec::with_capacity(count);
        let mut i = rng.gen::<usize>() & maxmask;
        let mut empty_run = 0usize;
        let mut steps = count * 10;
        while out.len() < count && steps > 0 {
            steps -= 1;
            for t in 0..tables {
                // Skip the drained prefix of the old table.
                if tables == 2 && t == 0 && i < self.rehash_idx as usize {
                    if i >= self.tables[1].size() {
                        i = self.rehash_idx as usize;
                    } else {
                        continue;
                    }
                }
                if i >= self.tables[t].size() {
                    continue;
                }
                match self.tables[t].buckets[i].as_deref() {
                    None => {
                        empty_run += 1;
                        if empty_run >= 5 && empty_run > count {
                            i = rng.gen::<usize>() & maxmask;
                            empty_run = 0;
                        }
                    }
                    Some(head) => {
                        empty_run = 0;
                        let mut e = Some(head);
                        while let Some(entry) = e {
                            out.push((entry.key.as_slice(), &entry.val));
                            if out.len() == count {
                                return out;
                            }
                            e = entry.next.as_deref();
                        }
                    }
                }
            }
            i = (i + 1) & maxmask;
        }
        out
    }

    // ----------------------------------------------------------------- scan

    /// Progressive traversal with a reverse-binary-increment cursor.
    ///
    /// The cursor walks the bucket index from the high bits down, so
    /// buckets already visited in a smaller table map onto contiguous,
    /// already-visited ranges after a resize: no bucket is emitted twice
    /// across a grow or shrink, though individual entries may be (the
    /// caller sees every entry that stays present for the whole scan at
    /// least once). Start with cursor 0; the scan has finished when 0
    /// comes back.
    pub fn scan<F: FnMut(&[u8], &V)>(&self, cursor: u64, mut f: F) -> u64 {
        if self.tables[0].size() == 0 {
            return 0;
        }
        let mut v = cursor;
        if !self.is_rehashing() {
            let m0 = self.tables[0].mask() as u64;
            self.scan_bucket(0, (v & m0) as usize, &mut f);
            v |= !m0;
            v = v.reverse_bits().wrapping_add(1).reverse_bits();
        } else {
            let (small, large) = if self.tables[0].size() <= self.tables[1].size() {
                (0, 1)
            } else {
                (1, 0)
            };
            let m_small = self.tables[small].mask() as u64;
            let m_large = self.tables[large].mask() as u64;
            // The smaller table's bucket first, then every one of its
            // expansions in the larger table.
            self.scan_bucket(small, (v & m_small) as usize, &mut f);
            loop {
                self.scan_bucket(large, (v & m_large) as usize, &mut f);
                v |= !m_large;
                v = v.reverse_bits().wrapping_add(1).reverse_bits();
                if v & (m_small ^ m_large) == 0 {
                    break;
                }
            }
        }
        v
    }

    fn scan_bucket<F: FnMut(&[u8], &V)>(&self, t: usize, idx: usize, f: &mut F) {
        let mut e = self.tables[t].buckets[idx].as_deref();
        while let Some(entry) = e {
            f(&entry.key, &entry.val);
            e = entry.next.as_deref();
        }
    }

    // ----------------------------------------------------------- iterators

    /// Digest of the observable table state, used to detect mutation under
    /// an iterator that promised not to mutate.
    pub fn fingerprint(&self) -> u64 {
        let integers = [
            self.tables[0].buckets.as_ptr() as u64,
            self.tables[0].size() as u64,
            self.tables[0].used as u64,
            self.tables[1].buckets.as_ptr() as u64,
            self.tables[1].size() as u64,
            self.tables[1].used as u64,
        ];
        let mut hash: u64 = 0;
        for n in integers {
            hash = hash.wrapping_add(n);
            // Tomas Wang's 64 bit integer hash.
            hash = (!hash).wrapping_add(hash << 21);
            hash ^= hash >> 24;
            hash = hash.wrapping_add(hash << 3).wrapping_add(hash << 8);
            hash ^= hash >> 14;
            hash = hash.wrapping_add(hash << 2).wrapping_add(hash << 4);
            hash ^= hash >> 28;
            hash = hash.wrapping_add(hash << 31);
        }
        hash
    }

    /// Start a safe iterator: rehash steps are suppressed until it is
    /// released, and the caller may mutate the dict between `iter_next`
    /// calls. Entries deleted mid-iteration are skipped; entries inserted
    /// mid-iteration may or may not be seen.
    pub fn iter_safe(&mut self) -> DictIterator {
        self.iterators += 1;
        DictIterator {
            safe: true,
            fingerprint: 0,
            table: 0,
            index: -1,
            bucket_keys: Vec::new(),
            bucket_pos: 0,
            chain_pos: 0,
        }
    }

    /// Start an unsafe iterator: cheaper, but the dict must not be mutated
    /// while it is live. Misuse is detected at release time and is fatal.
    pub fn iter_unsafe(&self) -> DictIterator {
        DictIterator {
            safe: false,
            fingerprint: self.fingerprint(),
            table: 0,
            index: -1,
            bucket_keys: Vec::new(),
            bucket_pos: 0,
            chain_pos: 0,
        }
    }

    pub fn iter_next<'a>(&'a mut self, it: &mut DictIterator) -> Option<(&'a [u8], &'a V)> {
        if it.safe {
            self.safe_next(it)
        } else {
            self.unsafe_next(it)
        }
    }

    /// Release an iterator. For a safe iterator this re-enables rehashing;
    /// for an unsafe one it verifies the table was left untouched.
    pub fn release_iter(&mut self, it: DictIterator) {
        if it.safe {
            debug_assert!(self.iterators > 0);
            self.iterators -= 1;
        } else if it.index != -1 {
            assert_eq!(
                it.fingerprint,
                self.fingerprint(),
                "dict was mutated under an unsafe iterator"
            );
        }
    }

    fn safe_next<'a>(&'a mut self, it: &mut DictIterator) -> Option<(&'a [u8], &'a V)> {
        let pos = 'outer: loop {
            while it.bucket_pos < it.bucket_keys.len() {
                let pos = it.bucket_pos;
                it.bucket_pos += 1;
                // Re-resolve through the live table so deletions are honored.
                if self.peek_entry(&it.bucket_keys[pos]).is_some() {
                    break 'outer pos;
                }
            }
            if !self.advance_bucket(it) {
                return None;
            }
            // Snapshot the keys of the new bucket. Rehashing is suppressed
            // while this iterator is live, so bucket indices stay stable
            // even though entries may come and go.
            let (t, idx) = (it.table, it.index as usize);
            it.bucket_keys.clear();
            it.bucket_pos = 0;
            let mut e = self.tables[t].buckets[idx].as_deref();
            while let Some(entry) = e {
                it.bucket_keys.push(entry.key.clone());
                e = entry.next.as_deref();
            }
        };
        let e = self.peek_entry(&it.bucket_keys[pos]).expect("entry checked above");
        Some((e.key.as_slice(), &e.val))
    }

    fn unsafe_next<'a>(&'a self, it: &mut DictIterator) -> Option<(&'a [u8], &'a V)> {
        loop {
            if it.index >= 0 {
                let mut e = self.tables[it.table].buckets[it.index as usize].as_deref();
                let mut pos = 0;
                while let Some(entry) = e {
                    if pos == it.chain_pos {
                        it.chain_pos += 1;
                        return Some((entry.key.as_slice(), &entry.val));
                    }
                    pos += 1;
                    e = entry.next.as_deref();
                }
            }
            it.chain_pos = 0;
            if !self.advance_bucket(it) {
                return None;
            }
        }
    }

    fn advance_bucket(&self, it: &mut DictIterator) -> bool {
        loop {
            it.index += 1;
            if (it.index as usize) >= self.tables[it.table].size() {
                if it.table == 0 && self.is_rehashing() {
                    it.table = 1;
                    it.index = 0;
                    if self.tables[1].size() == 0 {
                        return false;
                    }
                } else {
                    return false;
                }
            }
            if self.tables[it.table].buckets[it.index as usize].is_some() {
                return true;
            }
        }
    }
}

/// Cursor state for both iterator flavors. Advanced by the owning dict via
/// `iter_next`, released via `release_iter`.
#[derive(Debug)]
pub struct DictIterator {
    safe: bool,
    fingerprint: u64,
    table: usize,
    index: isize,
    bucket_keys: Vec<Vec<u8>>,
    bucket_pos: usize,
    chain_pos: usize,
}

fn next_power(size: usize) -> usize {
    size.max(INITIAL_SIZE).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: usize) -> Vec<u8> {
        format!("key:{i}").into_bytes()
    }

    #[test]
    fn test_insert_find_remove() {
        let mut d: Dict<u64> = Dict::new();
        for i in 0..100 {
            assert!(d.insert(key(i), i as u64).is_ok());
        }
        assert_eq!(d.len(), 100);
        assert!(d.insert(key(7), 7).is_err());
        for i in 0..100 {
            assert_eq!(d.find(&key(i)), Some(&(i as u64)));
        }
        assert_eq!(d.remove(&key(50)), Some(50));
        assert_eq!(d.find(&key(50)), None);
        assert_eq!(d.len(), 99);
    }

    #[test]
    fn test_upsert_replaces() {
        let mut d: Dict<&'static str> = Dict::new();
        assert_eq!(d.upsert(key(1), "a"), None);
        assert_eq!(d.upsert(key(1), "b"), Some("a"));
        assert_eq!(d.find(&key(1)), Some(&"b"));
        assert_eq!(d.len(), 1);
    }

    #[test]
    fn test_unlink_transfers_ownership() {
        let mut d: Dict<String> = Dict::new();
        d.insert(b"k".to_vec(), "v".to_string()).unwrap();
        let (k, v) = d.unlink(b"k").unwrap();
        assert_eq!(k, b"k");
        assert_eq!(v, "v");
        assert!(d.is_empty());
    }

    #[test]
    fn test_incremental_rehash_finds_everything() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..10_000 {
            d.insert(key(i), i).unwrap();
        }
        // Growth must have started at least one incremental rehash along
        // the way; force another and walk it to completion via finds.
        d.expand(d.len() * 4);
        assert!(d.is_rehashing());
        for i in 0..10_000 {
            assert_eq!(d.find(&key(i)), Some(&i));
        }
        while d.rehash(100) {}
        assert!(!d.is_rehashing());
        assert_eq!(d.len(), 10_000);
        for i in 0..10_000 {
            assert_eq!(d.find(&key(i)), Some(&i));
        }
    }

    #[test]
    fn test_forced_growth_when_resize_disabled() {
        let mut d: Dict<usize> = Dict::new();
        d.set_resize_enabled(false);
        for i in 0..4 * (FORCE_RESIZE_RATIO + 2) {
            d.insert(key(i), i).unwrap();
        }
        // With resizing disabled the table stays at its initial size until
        // the forced ratio trips, at which point it must have grown.
        assert!(d.capacity() > INITIAL_SIZE);
    }

    #[test]
    fn test_scan_visits_every_key() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..1000 {
            d.insert(key(i), i).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.to_vec());
            });
            if cursor == 0 {
                break;
            }
        }
        assert_eq!(seen.len(), 1000);
    }

    #[test]
    fn test_scan_across_resize() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..512 {
            d.insert(key(i), i).unwrap();
        }
        let mut seen = std::collections::HashSet::new();
        let mut cursor = 0;
        let mut rounds = 0;
        loop {
            cursor = d.scan(cursor, |k, _| {
                seen.insert(k.to_vec());
            });
            rounds += 1;
            if rounds == 3 {
                // Grow mid-scan; the reverse cursor guarantees no bucket
                // is skipped even though some may repeat.
                d.expand(4096);
                while d.rehash(100) {}
            }
            if cursor == 0 {
                break;
            }
        }
        for i in 0..512 {
            assert!(seen.contains(&key(i)), "missing {i}");
        }
    }

    #[test]
    fn test_safe_iterator_tolerates_deletion() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..100 {
            d.insert(key(i), i).unwrap();
        }
        let mut it = d.iter_safe();
        let mut visited = 0;
        while let Some((k, _)) = d.iter_next(&mut it) {
            let k = k.to_vec();
            visited += 1;
            d.remove(&k);
        }
        d.release_iter(it);
        assert_eq!(visited, 100);
        assert!(d.is_empty());
    }

    #[test]
    fn test_safe_iterator_suppresses_rehash() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..100 {
            d.insert(key(i), i).unwrap();
        }
        d.expand(1024);
        assert!(d.is_rehashing());
        let idx_before = d.rehash_idx;
        let it = d.iter_safe();
        let _ = d.find(&key(0));
        let _ = d.find(&key(1));
        assert_eq!(d.rehash_idx, idx_before);
        d.release_iter(it);
        let _ = d.find(&key(0));
        assert!(d.rehash_idx != idx_before || !d.is_rehashing());
    }

    #[test]
    fn test_unsafe_iterator_full_walk() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..256 {
            d.insert(key(i), i).unwrap();
        }
        let mut it = d.iter_unsafe();
        let mut seen = std::collections::HashSet::new();
        while let Some((k, _)) = d.iter_next(&mut it) {
            seen.insert(k.to_vec());
        }
        d.release_iter(it);
        assert_eq!(seen.len(), 256);
    }

    #[test]
    #[should_panic(expected = "mutated under an unsafe iterator")]
    fn test_unsafe_iterator_detects_mutation() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..64 {
            d.insert(key(i), i).unwrap();
        }
        let mut it = d.iter_unsafe();
        let _ = d.iter_next(&mut it);
        d.insert(b"intruder".to_vec(), 0).unwrap();
        // Force a resize so the fingerprint is guaranteed to change.
        d.expand(4096);
        d.release_iter(it);
    }

    #[test]
    fn test_random_and_sample() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..100 {
            d.insert(key(i), i).unwrap();
        }
        let (k, v) = d.random_entry().unwrap();
        assert_eq!(k, key(*v).as_slice());
        let samples = d.sample_entries(10);
        assert!(!samples.is_empty());
        assert!(samples.len() <= 10);
        for (k, v) in samples {
            assert_eq!(k, key(*v).as_slice());
        }
    }

    #[test]
    fn test_shrink() {
        let mut d: Dict<usize> = Dict::new();
        for i in 0..1000 {
            d.insert(key(i), i).unwrap();
        }
        for i in 0..990 {
            d.remove(&key(i));
        }
        assert!(d.needs_resize());
        assert!(d.resize_to_fit());
        while d.rehash(100) {}
        assert!(d.capacity() <= 32);
        for i in 990..1000 {
            assert_eq!(d.find(&key(i)), Some(&i));
        }
    }
}
