//! Open-addressing string maps over an arena
//!
//! Keys and values are interned into the owning arena; the probe table
//! itself is an ordinary `Vec` so rehashing never invalidates interned
//! bytes. Deleted slots are tombstoned and elided on resize.
//!
//! [`StrMultiMap`] is the chained variant used for HTTP header fields: each
//! live slot owns a small vector of values, preserving insertion order among
//! repeated keys.
//!
//! Hashing is rapidhash (see [`crate::hash`]), which is not
//! attacker-resistant; callers bound adversarial growth through the arena
//! ceiling instead.

use crate::arena::Arena;
use crate::error::ArenaError;
use crate::hash::hash_bytes;
use std::rc::Rc;

/// A byte string interned in an arena, stored as offset + length so that
/// table resizes never touch the bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AStr {
    off: usize,
    len: usize,
}

impl AStr {
    /// The empty string; resolves to `&[]` against any arena.
    pub const fn empty() -> AStr {
        AStr { off: 0, len: 0 }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `s` into the arena.
    pub fn intern(arena: &Arena, s: &[u8]) -> Result<AStr, ArenaError> {
        if s.is_empty() {
            return Ok(AStr { off: 0, len: 0 });
        }
        let ptr = arena.alloc(s.len(), 1, false).ok_or(ArenaError::OutOfMemory)?;
        unsafe {
            std::ptr::copy_nonoverlapping(s.as_ptr(), ptr.as_ptr(), s.len());
        }
        let off = ptr.as_ptr() as usize - arena.base().as_ptr() as usize;
        Ok(AStr { off, len: s.len() })
    }

    /// Resolve against the arena that interned it.
    ///
    /// Valid until the arena is freed past this string's position; maps are
    /// cleared together with their arena epoch.
    #[inline]
    pub fn resolve<'a>(&self, arena: &'a Arena) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { arena.slice(self.off, self.len) }
    }
}

enum Slot<V> {
    Empty,
    Tombstone,
    Live { hash: u64, key: AStr, value: V },
}

enum Probe {
    Found(usize),
    Vacant(usize),
}

/// Open-addressing table keyed by interned strings.
///
/// Probe sequence is triangular (`k += j` with incrementing `j`) over a
/// power-of-two capacity, which visits every slot exactly once.
struct StrTable<V> {
    arena: Rc<Arena>,
    slots: Vec<Slot<V>>,
    live: usize,
    occupied: usize, // live + tombstones, drives the resize trigger
}

impl<V> StrTable<V> {
    fn new(arena: Rc<Arena>, capacity_hint: usize) -> Self {
        let cap = capacity_hint.max(8).next_power_of_two();
        Self {
            arena,
            slots: (0..cap).map(|_| Slot::Empty).collect(),
            live: 0,
            occupied: 0,
        }
    }

    #[inline]
    fn key_bytes(&self, key: &AStr) -> &[u8] {
        key.resolve(&self.arena)
    }

    fn probe(&self, hash: u64, key: &[u8]) -> Probe {
        let cap = self.slots.len();
        let mut k = hash as usize & (cap - 1);
        let mut first_vacant = None;
        for j in 1..=cap {
            match &self.slots[k] {
                Slot::Empty => {
                    return Probe::Vacant(first_vacant.unwrap_or(k));
                }
                Slot::Tombstone => {
                    first_vacant.get_or_insert(k);
                }
                Slot::Live { hash: h, key: k2, .. } => {
                    if *h == hash && self.key_bytes(k2) == key {
                        return Probe::Found(k);
                    }
                }
            }
            k = (k + j) & (cap - 1);
        }
        Probe::Vacant(first_vacant.expect("table has no vacant slot"))
    }

    /// Vacant position for a known-absent key (used during rehash).
    fn probe_vacant(&self, hash: u64) -> usize {
        let cap = self.slots.len();
        let mut k = hash as usize & (cap - 1);
        let mut j = 1;
        while let Slot::Live { .. } = &self.slots[k] {
            k = (k + j) & (cap - 1);
            j += 1;
        }
        k
    }

    fn maybe_resize(&mut self) {
        let cap = self.slots.len();
        if self.occupied < 2 * cap / 3 {
            return;
        }
        let new_cap = cap * 2;
        let old = std::mem::replace(
            &mut self.slots,
            (0..new_cap).map(|_| Slot::Empty).collect(),
        );
        self.occupied = self.live;
        for slot in old {
            if let Slot::Live { hash, key, value } = slot {
                let k = self.probe_vacant(hash);
                self.slots[k] = Slot::Live { hash, key, value };
            }
        }
    }

    fn get(&self, key: &[u8]) -> Option<&V> {
        match self.probe(hash_bytes(key), key) {
            Probe::Found(k) => match &self.slots[k] {
                Slot::Live { value, .. } => Some(value),
                _ => unreachable!(),
            },
            Probe::Vacant(_) => None,
        }
    }

    fn get_mut(&mut self, key: &[u8]) -> Option<&mut V> {
        match self.probe(hash_bytes(key), key) {
            Probe::Found(k) => match &mut self.slots[k] {
                Slot::Live { value, .. } => Some(value),
                _ => unreachable!(),
            },
            Probe::Vacant(_) => None,
        }
    }

    /// Get the existing value for `key` or insert one built by `make`.
    fn get_or_insert_with(
        &mut self,
        key: &[u8],
        make: impl FnOnce() -> V,
    ) -> Result<&mut V, ArenaError> {
        self.maybe_resize();
        let hash = hash_bytes(key);
        let k = match self.probe(hash, key) {
            Probe::Found(k) => k,
            Probe::Vacant(k) => {
                let interned = AStr::intern(&self.arena, key)?;
                if matches!(self.slots[k], Slot::Empty) {
                    self.occupied += 1;
                }
                self.slots[k] = Slot::Live {
                    hash,
                    key: interned,
                    value: make(),
                };
                self.live += 1;
                k
            }
        };
        match &mut self.slots[k] {
            Slot::Live { value, .. } => Ok(value),
            _ => unreachable!(),
        }
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        match self.probe(hash_bytes(key), key) {
            Probe::Found(k) => {
                self.slots[k] = Slot::Tombstone;
                self.live -= 1;
                true
            }
            Probe::Vacant(_) => false,
        }
    }

    fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::Empty;
        }
        self.live = 0;
        self.occupied = 0;
    }

    fn iter(&self) -> impl Iterator<Item = (&[u8], &V)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Live { key, value, .. } => Some((key.resolve(&self.arena), value)),
            _ => None,
        })
    }
}

/// Single-value string map.
pub struct StrMap {
    inner: StrTable<AStr>,
}

impl StrMap {
    pub fn new(arena: Rc<Arena>, capacity_hint: usize) -> Self {
        Self {
            inner: StrTable::new(arena, capacity_hint),
        }
    }

    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), ArenaError> {
        let interned = AStr::intern(&self.inner.arena, value)?;
        let slot = self.inner.get_or_insert_with(key, || interned)?;
        *slot = interned;
        Ok(())
    }

    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.inner.get(key).map(|v| v.resolve(&self.inner.arena))
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        self.inner.remove(key)
    }

    pub fn len(&self) -> usize {
        self.inner.live
    }

    pub fn is_empty(&self) -> bool {
        self.inner.live == 0
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        let arena = &self.inner.arena;
        self.inner.iter().map(move |(k, v)| (k, v.resolve(arena)))
    }
}

/// Multi-value string map preserving insertion order among same-key values.
pub struct StrMultiMap {
    inner: StrTable<Vec<AStr>>,
}

impl StrMultiMap {
    pub fn new(arena: Rc<Arena>, capacity_hint: usize) -> Self {
        Self {
            inner: StrTable::new(arena, capacity_hint),
        }
    }

    /// Append a value to the key's chain.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<(), ArenaError> {
        let interned = AStr::intern(&self.inner.arena, value)?;
        let chain = self.inner.get_or_insert_with(key, Vec::new)?;
        chain.push(interned);
        Ok(())
    }

    /// Replace the key's chain with a single value.
    pub fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), ArenaError> {
        let interned = AStr::intern(&self.inner.arena, value)?;
        let chain = self.inner.get_or_insert_with(key, Vec::new)?;
        chain.clear();
        chain.push(interned);
        Ok(())
    }

    /// First value in the key's chain.
    pub fn get(&self, key: &[u8]) -> Option<&[u8]> {
        self.inner
            .get(key)
            .and_then(|chain| chain.first())
            .map(|v| v.resolve(&self.inner.arena))
    }

    /// All values for the key, in insertion order.
    pub fn values(&self, key: &[u8]) -> impl Iterator<Item = &[u8]> {
        let arena = &self.inner.arena;
        self.inner
            .get(key)
            .into_iter()
            .flat_map(|chain| chain.iter())
            .map(move |v| v.resolve(arena))
    }

    /// Number of values stored under the key.
    pub fn count(&self, key: &[u8]) -> usize {
        self.inner.get(key).map_or(0, |chain| chain.len())
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.inner.get(key).is_some()
    }

    pub fn remove(&mut self, key: &[u8]) -> bool {
        self.inner.remove(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.inner.live
    }

    pub fn is_empty(&self) -> bool {
        self.inner.live == 0
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }

    /// Iterate `(key, value)` pairs; same-key values appear consecutively in
    /// insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        let arena = &self.inner.arena;
        self.inner.iter().flat_map(move |(k, chain)| {
            chain.iter().map(move |v| (k, v.resolve(arena)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kib;

    fn arena() -> Rc<Arena> {
        Rc::new(Arena::new(kib(4), kib(256)).unwrap())
    }

    #[test]
    fn test_map_set_get_overwrite() {
        let mut m = StrMap::new(arena(), 4);
        m.set(b"host", b"a").unwrap();
        m.set(b"port", b"8080").unwrap();
        assert_eq!(m.get(b"host"), Some(&b"a"[..]));
        m.set(b"host", b"b").unwrap();
        assert_eq!(m.get(b"host"), Some(&b"b"[..]));
        assert_eq!(m.len(), 2);
        assert_eq!(m.get(b"missing"), None);
    }

    #[test]
    fn test_map_remove_tombstone_then_reinsert() {
        let mut m = StrMap::new(arena(), 4);
        m.set(b"a", b"1").unwrap();
        m.set(b"b", b"2").unwrap();
        assert!(m.remove(b"a"));
        assert!(!m.remove(b"a"));
        assert_eq!(m.get(b"a"), None);
        // Probe sequences must still reach keys past the tombstone.
        assert_eq!(m.get(b"b"), Some(&b"2"[..]));
        m.set(b"a", b"3").unwrap();
        assert_eq!(m.get(b"a"), Some(&b"3"[..]));
    }

    #[test]
    fn test_map_resize_keeps_entries() {
        let mut m = StrMap::new(arena(), 8);
        for i in 0..100 {
            let k = format!("key-{i}");
            let v = format!("val-{i}");
            m.set(k.as_bytes(), v.as_bytes()).unwrap();
        }
        assert_eq!(m.len(), 100);
        for i in 0..100 {
            let k = format!("key-{i}");
            let v = format!("val-{i}");
            assert_eq!(m.get(k.as_bytes()), Some(v.as_bytes()));
        }
    }

    #[test]
    fn test_multimap_add_preserves_order() {
        let mut m = StrMultiMap::new(arena(), 4);
        m.add(b"Accept", b"v1").unwrap();
        m.add(b"Accept", b"v2").unwrap();
        m.add(b"Accept", b"v3").unwrap();
        let vals: Vec<&[u8]> = m.values(b"Accept").collect();
        assert_eq!(vals, vec![&b"v1"[..], &b"v2"[..], &b"v3"[..]]);
        assert_eq!(m.count(b"Accept"), 3);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn test_multimap_set_collapses_chain() {
        let mut m = StrMultiMap::new(arena(), 4);
        m.add(b"k", b"v1").unwrap();
        m.add(b"k", b"v2").unwrap();
        m.set(b"k", b"only").unwrap();
        assert_eq!(m.count(b"k"), 1);
        assert_eq!(m.get(b"k"), Some(&b"only"[..]));
    }

    #[test]
    fn test_multimap_chains_survive_resize() {
        let mut m = StrMultiMap::new(arena(), 8);
        m.add(b"dup", b"first").unwrap();
        m.add(b"dup", b"second").unwrap();
        for i in 0..50 {
            let k = format!("k{i}");
            m.add(k.as_bytes(), b"x").unwrap();
        }
        let vals: Vec<&[u8]> = m.values(b"dup").collect();
        assert_eq!(vals, vec![&b"first"[..], &b"second"[..]]);
    }

    #[test]
    fn test_multimap_clear() {
        let mut m = StrMultiMap::new(arena(), 4);
        m.add(b"k", b"v").unwrap();
        m.clear();
        assert!(m.is_empty());
        assert!(!m.contains(b"k"));
    }
}
