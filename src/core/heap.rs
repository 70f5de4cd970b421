//! Fibonacci heap backed by an index arena.
//!
//! Nodes live in a vector of generation-tagged slots and refer to each other
//! by slot index, so cuts, splices and cascading-cut walks are plain index
//! assignments. The root list and every child list are circular
//! doubly-linked rings threaded through `left`/`right`.
//!
//! Keys are ordered with `Ord`; callers that need FIFO behavior on equal
//! priorities fold an insertion sequence number into the key.

use crate::error::{Error, Result};

const PHI: f64 = 1.618_033_988_749_895;

/// Stable reference to an element inside a [`FibonacciHeap`].
///
/// A handle stays valid until its element is extracted or deleted. Using it
/// afterwards yields [`Error::InvalidHandle`], even if the slot was reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle {
    index: usize,
    generation: u64,
}

/// Operation counters, used to spot-check amortized bounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    pub inserts: u64,
    pub extracts: u64,
    /// Tree links performed during consolidation.
    pub links: u64,
    /// Roots visited by consolidation passes.
    pub roots_scanned: u64,
    pub cuts: u64,
    pub cascading_cuts: u64,
}

impl HeapStats {
    /// Total structural work done by extract-min (links plus root scans).
    pub fn consolidation_work(&self) -> u64 {
        self.links + self.roots_scanned
    }
}

#[derive(Debug)]
struct Node<K, T> {
    key: K,
    value: T,
    degree: usize,
    mark: bool,
    parent: Option<usize>,
    child: Option<usize>,
    left: usize,
    right: usize,
}

#[derive(Debug)]
struct Slot<K, T> {
    generation: u64,
    node: Option<Node<K, T>>,
}

/// Translates handles of a heap that was merged into another one.
#[derive(Debug, Clone, Copy)]
pub struct HandleTranslator {
    offset: usize,
}

impl HandleTranslator {
    /// Map a handle issued by the absorbed heap to the merged heap.
    pub fn translate(&self, handle: Handle) -> Handle {
        Handle {
            index: handle.index + self.offset,
            generation: handle.generation,
        }
    }
}

/// Mergeable min-priority queue with amortized O(1) insert and
/// decrease-key and amortized O(log n) extract-min.
pub struct FibonacciHeap<K, T> {
    slots: Vec<Slot<K, T>>,
    free: Vec<usize>,
    min: Option<usize>,
    len: usize,
    stats: HeapStats,
}

impl<K: Ord, T> FibonacciHeap<K, T> {
    /// Create an empty heap.
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            min: None,
            len: 0,
            stats: HeapStats::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn stats(&self) -> HeapStats {
        self.stats
    }

    /// Insert a value and return a handle for later decrease-key or delete.
    pub fn insert(&mut self, key: K, value: T) -> Handle {
        let node = Node {
            key,
            value,
            degree: 0,
            mark: false,
            parent: None,
            child: None,
            left: 0,
            right: 0,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.slots[index].node = Some(node);
                index
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                self.slots.len() - 1
            }
        };

        {
            let n = self.node_mut(index);
            n.left = index;
            n.right = index;
        }
        self.add_root(index);
        self.len += 1;
        self.stats.inserts += 1;

        Handle {
            index,
            generation: self.slots[index].generation,
        }
    }

    /// Return the minimum entry without removing it.
    pub fn peek_min(&self) -> Option<(&K, &T)> {
        self.min.map(|m| {
            let n = self.node(m);
            (&n.key, &n.value)
        })
    }

    /// Remove and return the minimum entry.
    pub fn extract_min(&mut self) -> Option<(K, T)> {
        let z = self.min?;

        if let Some(child) = self.node(z).child {
            for c in self.ring(child) {
                {
                    let n = self.node_mut(c);
                    n.parent = None;
                    n.mark = false;
                    n.left = c;
                    n.right = c;
                }
                self.splice_after(z, c);
            }
            let n = self.node_mut(z);
            n.child = None;
            n.degree = 0;
        }

        let right = self.node(z).right;
        if right == z {
            self.min = None;
        } else {
            self.unlink(z);
            self.min = Some(right);
            self.consolidate();
        }

        let node = self.release(z);
        self.len -= 1;
        self.stats.extracts += 1;
        Some((node.key, node.value))
    }

    /// Lower the key of an element. The new key must be strictly smaller.
    pub fn decrease_key(&mut self, handle: Handle, key: K) -> Result<()> {
        let x = self.resolve(handle)?;
        if key >= self.node(x).key {
            return Err(Error::InvalidKeyOrder);
        }
        self.node_mut(x).key = key;

        if let Some(p) = self.node(x).parent {
            if self.node(x).key < self.node(p).key {
                self.cut(x, p);
                self.cascading_cut(p);
            }
        }

        if let Some(m) = self.min {
            if self.node(x).key < self.node(m).key {
                self.min = Some(x);
            }
        }
        Ok(())
    }

    /// Remove an arbitrary element.
    ///
    /// Equivalent to decreasing its key to negative infinity and extracting
    /// the minimum, without requiring `K` to have such a value.
    pub fn delete(&mut self, handle: Handle) -> Result<(K, T)> {
        let x = self.resolve(handle)?;
        if let Some(p) = self.node(x).parent {
            self.cut(x, p);
            self.cascading_cut(p);
        }
        self.min = Some(x);
        match self.extract_min() {
            Some(entry) => Ok(entry),
            None => unreachable!("heap emptied while deleting a live node"),
        }
    }

    /// Look up the entry behind a handle.
    pub fn get(&self, handle: Handle) -> Option<(&K, &T)> {
        let index = self.resolve(handle).ok()?;
        let n = self.node(index);
        Some((&n.key, &n.value))
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.resolve(handle).is_ok()
    }

    /// Absorb `other` in O(1) ring concatenation plus an arena append.
    ///
    /// Handles issued by `other` must be passed through the returned
    /// translator before use with `self`.
    pub fn merge(&mut self, mut other: Self) -> HandleTranslator {
        let offset = self.slots.len();
        for slot in other.slots.iter_mut() {
            if let Some(n) = slot.node.as_mut() {
                n.left += offset;
                n.right += offset;
                n.parent = n.parent.map(|p| p + offset);
                n.child = n.child.map(|c| c + offset);
            }
        }
        self.slots.append(&mut other.slots);
        self.free.extend(other.free.iter().map(|i| i + offset));

        if let Some(other_min) = other.min.map(|m| m + offset) {
            match self.min {
                None => self.min = Some(other_min),
                Some(m) => {
                    let m_right = self.node(m).right;
                    let other_left = self.node(other_min).left;
                    self.node_mut(m).right = other_min;
                    self.node_mut(other_min).left = m;
                    self.node_mut(other_left).right = m_right;
                    self.node_mut(m_right).left = other_left;
                    if self.node(other_min).key < self.node(m).key {
                        self.min = Some(other_min);
                    }
                }
            }
        }
        self.len += other.len;
        HandleTranslator { offset }
    }

    /// Walk every live node and check heap order and link consistency.
    ///
    /// O(n). Intended for tests and debug assertions.
    pub fn validate(&self) -> bool {
        let mut live = 0;
        for (index, slot) in self.slots.iter().enumerate() {
            let Some(n) = slot.node.as_ref() else {
                continue;
            };
            live += 1;
            if self.node(n.right).left != index || self.node(n.left).right != index {
                return false;
            }
            if let Some(p) = n.parent {
                if self.node(p).key > n.key {
                    return false;
                }
            }
            if let Some(c) = n.child {
                let children = self.ring(c);
                if children.len() != n.degree
                    || children.iter().any(|&c| self.node(c).parent != Some(index))
                {
                    return false;
                }
            }
        }
        if live != self.len {
            return false;
        }
        match self.min {
            None => self.len == 0,
            Some(m) => self
                .ring(m)
                .iter()
                .all(|&r| self.node(r).parent.is_none() && self.node(m).key <= self.node(r).key),
        }
    }

    // ========== Internal link surgery ==========

    fn node(&self, index: usize) -> &Node<K, T> {
        match self.slots[index].node.as_ref() {
            Some(n) => n,
            None => panic!("heap link points at vacant slot {index}"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<K, T> {
        match self.slots[index].node.as_mut() {
            Some(n) => n,
            None => panic!("heap link points at vacant slot {index}"),
        }
    }

    fn resolve(&self, handle: Handle) -> Result<usize> {
        match self.slots.get(handle.index) {
            Some(slot) if slot.generation == handle.generation && slot.node.is_some() => {
                Ok(handle.index)
            }
            _ => Err(Error::InvalidHandle),
        }
    }

    fn release(&mut self, index: usize) -> Node<K, T> {
        let slot = &mut self.slots[index];
        let node = match slot.node.take() {
            Some(n) => n,
            None => panic!("released vacant heap slot {index}"),
        };
        slot.generation += 1;
        self.free.push(index);
        node
    }

    /// Collect the members of the ring containing `start`.
    fn ring(&self, start: usize) -> Vec<usize> {
        let mut members = vec![start];
        let mut cursor = self.node(start).right;
        while cursor != start {
            members.push(cursor);
            cursor = self.node(cursor).right;
        }
        members
    }

    /// Insert a detached singleton `index` to the right of `anchor`.
    fn splice_after(&mut self, anchor: usize, index: usize) {
        let right = self.node(anchor).right;
        {
            let n = self.node_mut(index);
            n.left = anchor;
            n.right = right;
        }
        self.node_mut(anchor).right = index;
        self.node_mut(right).left = index;
    }

    fn unlink(&mut self, index: usize) {
        let (left, right) = {
            let n = self.node(index);
            (n.left, n.right)
        };
        self.node_mut(left).right = right;
        self.node_mut(right).left = left;
        let n = self.node_mut(index);
        n.left = index;
        n.right = index;
    }

    fn add_root(&mut self, index: usize) {
        self.node_mut(index).parent = None;
        match self.min {
            None => {
                let n = self.node_mut(index);
                n.left = index;
                n.right = index;
                self.min = Some(index);
            }
            Some(m) => {
                self.splice_after(m, index);
                if self.node(index).key < self.node(m).key {
                    self.min = Some(index);
                }
            }
        }
    }

    fn degree_bound(&self) -> usize {
        ((self.len.max(1) as f64).ln() / PHI.ln()).floor() as usize + 2
    }

    fn consolidate(&mut self) {
        let Some(start) = self.min else {
            return;
        };
        let roots = self.ring(start);
        self.stats.roots_scanned += roots.len() as u64;

        let mut buckets: Vec<Option<usize>> = vec![None; self.degree_bound()];
        for root in roots {
            let mut x = root;
            let mut degree = self.node(x).degree;
            loop {
                if degree >= buckets.len() {
                    buckets.resize(degree + 1, None);
                }
                let Some(mut y) = buckets[degree].take() else {
                    break;
                };
                if self.node(y).key < self.node(x).key {
                    std::mem::swap(&mut x, &mut y);
                }
                self.link(y, x);
                degree += 1;
            }
            buckets[degree] = Some(x);
        }

        self.min = None;
        for root in buckets.into_iter().flatten() {
            {
                let n = self.node_mut(root);
                n.left = root;
                n.right = root;
            }
            self.add_root(root);
        }
    }

    /// Make root `child` a child of root `parent`.
    fn link(&mut self, child: usize, parent: usize) {
        {
            let n = self.node_mut(child);
            n.left = child;
            n.right = child;
            n.parent = Some(parent);
            n.mark = false;
        }
        match self.node(parent).child {
            Some(c) => self.splice_after(c, child),
            None => self.node_mut(parent).child = Some(child),
        }
        self.node_mut(parent).degree += 1;
        self.stats.links += 1;
    }

    fn cut(&mut self, x: usize, parent: usize) {
        let right = self.node(x).right;
        if right == x {
            self.node_mut(parent).child = None;
        } else {
            if self.node(parent).child == Some(x) {
                self.node_mut(parent).child = Some(right);
            }
            self.unlink(x);
        }
        self.node_mut(parent).degree -= 1;
        {
            let n = self.node_mut(x);
            n.mark = false;
            n.left = x;
            n.right = x;
        }
        self.add_root(x);
        self.stats.cuts += 1;
    }

    fn cascading_cut(&mut self, mut y: usize) {
        while let Some(z) = self.node(y).parent {
            if !self.node(y).mark {
                self.node_mut(y).mark = true;
                return;
            }
            self.cut(y, z);
            self.stats.cascading_cuts += 1;
            y = z;
        }
    }
}

impl<K: Ord, T> Default for FibonacciHeap<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T> std::fmt::Debug for FibonacciHeap<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FibonacciHeap")
            .field("len", &self.len)
            .field("slots", &self.slots.len())
            .finish()
    }
}
