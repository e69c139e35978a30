use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;

use crate::pool::Pool;
use crate::wfst::StateId;

pub const NO_ELEM: u32 = u32::MAX;

/// Graph-state key of a search hypothesis.
///
/// `lm_state` is 0 unless an LM-diff FST is attached, in which case the key
/// is the composed (graph state, LM state) pair. Equality and hashing treat
/// the pair as a plain value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub state: StateId,
    pub lm_state: StateId,
}

impl StateKey {
    #[inline]
    pub fn bare(state: StateId) -> Self {
        StateKey { state, lm_state: 0 }
    }
}

/// One entry of the frontier hash: a graph-state key and its token slot.
///
/// `tail` is the bucket chain while the entry is indexed, and the detached
/// list chain after [`TokenHash::clear`].
#[derive(Debug, Clone, Copy)]
pub struct Elem {
    pub key: StateKey,
    pub tok: u32,
    pub tail: u32,
}

/// Chained hash from graph-state key to token slot, valid only for the
/// frontier frame.
///
/// Entries live in a slab pool so that `clear` can detach the whole
/// contents as a singly-linked chain in one pass; the caller walks the
/// chain and releases each entry once its arcs have been expanded.
pub struct TokenHash {
    buckets: Vec<u32>,
    elems: Pool<Elem>,
    mask: u64,
}

impl TokenHash {
    /// `size` is rounded up to the next power of two.
    pub fn new(size: usize) -> Self {
        let n = size.next_power_of_two();
        TokenHash {
            buckets: vec![NO_ELEM; n],
            elems: Pool::new(n),
            mask: (n - 1) as u64,
        }
    }

    /// Current bucket count.
    #[inline]
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    fn bucket(&self, key: StateKey) -> usize {
        let mut h = FxHasher::default();
        key.hash(&mut h);
        (h.finish() & self.mask) as usize
    }

    /// Grow to at least `n` buckets, rehashing any indexed entries.
    /// Detached entries (from a prior `clear`) are unaffected.
    pub fn set_size(&mut self, n: usize) {
        let n = n.next_power_of_two();
        if n <= self.buckets.len() {
            return;
        }

        let mut live: Vec<u32> = Vec::new();
        for b in 0..self.buckets.len() {
            let mut e = self.buckets[b];
            while e != NO_ELEM {
                live.push(e);
                e = self.elems[e].tail;
            }
        }

        self.buckets.clear();
        self.buckets.resize(n, NO_ELEM);
        self.mask = (n - 1) as u64;

        for e in live {
            let b = self.bucket(self.elems[e].key);
            self.elems[e].tail = self.buckets[b];
            self.buckets[b] = e;
        }
    }

    /// Insert a key that is not currently present.
    pub fn insert(&mut self, key: StateKey, tok: u32) {
        debug_assert!(self.find(key).is_none());
        let b = self.bucket(key);
        let e = self.elems.alloc(Elem {
            key,
            tok,
            tail: self.buckets[b],
        });
        self.buckets[b] = e;
    }

    /// Token slot stored under `key`, if any.
    pub fn find(&self, key: StateKey) -> Option<u32> {
        let mut e = self.buckets[self.bucket(key)];
        while e != NO_ELEM {
            let elem = &self.elems[e];
            if elem.key == key {
                return Some(elem.tok);
            }
            e = elem.tail;
        }
        None
    }

    /// Read an entry by id (valid for detached entries too).
    #[inline]
    pub fn elem(&self, id: u32) -> Elem {
        self.elems[id]
    }

    /// Detach all indexed entries and return the head of their chain
    /// (linked through `tail`, `NO_ELEM`-terminated). The hash is empty
    /// afterwards and may be refilled while the chain is walked.
    pub fn clear(&mut self) -> u32 {
        let mut head = NO_ELEM;
        for b in 0..self.buckets.len() {
            let mut e = self.buckets[b];
            while e != NO_ELEM {
                let next = self.elems[e].tail;
                self.elems[e].tail = head;
                head = e;
                e = next;
            }
            self.buckets[b] = NO_ELEM;
        }
        head
    }

    /// Return a detached entry to the pool for reuse.
    #[inline]
    pub fn release(&mut self, id: u32) {
        self.elems.release(id);
    }

    /// Iterate the indexed entries without detaching them.
    pub fn iter(&self) -> FrontierIter<'_> {
        FrontierIter {
            hash: self,
            bucket: 0,
            elem: NO_ELEM,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

pub struct FrontierIter<'a> {
    hash: &'a TokenHash,
    bucket: usize,
    elem: u32,
}

impl Iterator for FrontierIter<'_> {
    type Item = Elem;

    fn next(&mut self) -> Option<Elem> {
        while self.elem == NO_ELEM {
            if self.bucket >= self.hash.buckets.len() {
                return None;
            }
            self.elem = self.hash.buckets[self.bucket];
            self.bucket += 1;
        }
        let out = self.hash.elems[self.elem];
        self.elem = out.tail;
        Some(out)
    }
}
