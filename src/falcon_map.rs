// File: src/falcon_map.rs
//
// Open-addressed, linear-probing hash table keyed by interned strings.
// Backs every Falcon `Map` value, `Instance` field tables, `Class` method
// tables, and the VM's global-variable table. Strings are interned (see
// `heap.rs`), so key equality is `ObjRef` identity — no byte comparison is
// needed once two keys share an index.
//
// The table stores each key's hash inline rather than asking the heap to
// recompute it, so lookups never need a `&Heap` borrow. That matters
// because `FalconMap` itself often lives *inside* the heap arena (a
// class's method table, an instance's fields) — borrowing the heap
// immutably to hash a key while the map is already borrowed mutably out of
// that same arena would conflict. Callers fetch the hash once via
// `Heap::string_hash` before calling in.

use crate::value::{ObjRef, Value};

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone)]
struct Entry {
    /// `None` means either empty or a tombstone; distinguished by `value`:
    /// empty is `Value::Null`, tombstone is `Value::Bool(true)`.
    key: Option<ObjRef>,
    hash: u64,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry { key: None, hash: 0, value: Value::Null }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }

    fn is_empty_slot(&self) -> bool {
        self.key.is_none() && !self.is_tombstone()
    }
}

/// A Falcon `Map`: `String -> Value`, open addressing with tombstones.
#[derive(Clone)]
pub struct FalconMap {
    entries: Vec<Entry>,
    /// Count of live keys (excludes tombstones); used for the load factor.
    count: usize,
}

impl Default for FalconMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FalconMap {
    pub fn new() -> Self {
        FalconMap { entries: Vec::new(), count: 0 }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Finds the slot `key` (with precomputed `hash`) occupies, or the
    /// first tombstone/empty slot on its probe sequence if absent.
    fn find_slot(entries: &[Entry], capacity: usize, key: ObjRef, hash: u64) -> usize {
        let mut index = (hash as usize) % capacity;
        let mut first_tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.is_empty_slot() {
                return first_tombstone.unwrap_or(index);
            } else if entry.is_tombstone() {
                if first_tombstone.is_none() {
                    first_tombstone = Some(index);
                }
            } else if entry.key == Some(key) {
                return index;
            }
            index = (index + 1) % capacity;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.capacity() == 0 { INITIAL_CAPACITY } else { self.capacity() * 2 };
        let mut new_entries = vec![Entry::empty(); new_capacity];
        let mut live = 0;
        for entry in &self.entries {
            if let Some(key) = entry.key {
                let slot = Self::find_slot(&new_entries, new_capacity, key, entry.hash);
                new_entries[slot] = Entry { key: Some(key), hash: entry.hash, value: entry.value };
                live += 1;
            }
        }
        self.entries = new_entries;
        self.count = live;
    }

    fn ensure_capacity(&mut self) {
        let needs_growth = self.capacity() == 0
            || (self.count + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR;
        if needs_growth {
            self.grow();
        }
    }

    /// Sets `key` to `value`. Returns `true` if `key` was not already present.
    pub fn set(&mut self, key: ObjRef, hash: u64, value: Value) -> bool {
        self.ensure_capacity();
        let slot = Self::find_slot(&self.entries, self.capacity(), key, hash);
        // A tombstone slot reused for a new key must also increment `count`:
        // `delete` decrements it unconditionally when it plants that
        // tombstone, so reuse has to pay that back or `count` drifts under
        // delete/insert churn.
        let is_new = self.entries[slot].key != Some(key);
        if is_new {
            self.count += 1;
        }
        self.entries[slot] = Entry { key: Some(key), hash, value };
        is_new
    }

    pub fn get(&self, key: ObjRef, hash: u64) -> Option<Value> {
        if self.capacity() == 0 {
            return None;
        }
        let slot = Self::find_slot(&self.entries, self.capacity(), key, hash);
        let entry = &self.entries[slot];
        if entry.key == Some(key) {
            Some(entry.value)
        } else {
            None
        }
    }

    pub fn contains(&self, key: ObjRef, hash: u64) -> bool {
        self.get(key, hash).is_some()
    }

    /// Removes `key`, leaving a tombstone so later probe chains stay intact.
    pub fn delete(&mut self, key: ObjRef, hash: u64) -> bool {
        if self.capacity() == 0 {
            return false;
        }
        let slot = Self::find_slot(&self.entries, self.capacity(), key, hash);
        if self.entries[slot].key != Some(key) {
            return false;
        }
        self.entries[slot] = Entry { key: None, hash: 0, value: Value::Bool(true) };
        self.count -= 1;
        true
    }

    /// Copies every live entry of `other` into `self`, used by `OP_INHERIT`
    /// to copy a superclass's method table into the subclass's.
    pub fn copy_from(&mut self, other: &FalconMap) {
        for entry in &other.entries {
            if let Some(key) = entry.key {
                self.set(key, entry.hash, entry.value);
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| e.key.map(|k| (k, e.value)))
    }
}
