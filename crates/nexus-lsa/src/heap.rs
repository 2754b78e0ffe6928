//! Index-addressable binary min-heap.
//!
//! Regions keep their closed segments ordered by used space, and region
//! groups keep their member regions ordered by size. Both need to change
//! the key of, or remove, an arbitrary element, so the heap tracks the
//! position of every id it holds.

use std::collections::HashMap;
use std::hash::Hash;

/// A binary min-heap whose elements are addressed by id.
#[derive(Debug, Clone)]
pub(crate) struct IndexedHeap<I, K> {
    entries: Vec<(I, K)>,
    positions: HashMap<I, usize>,
}

impl<I, K> Default for IndexedHeap<I, K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            positions: HashMap::new(),
        }
    }
}

impl<I: Copy + Eq + Hash, K: Ord> IndexedHeap<I, K> {
    /// Creates an empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    pub fn contains(&self, id: I) -> bool {
        self.positions.contains_key(&id)
    }

    /// Returns the key of `id`.
    #[cfg(test)]
    pub fn key(&self, id: I) -> Option<&K> {
        self.positions.get(&id).map(|&pos| &self.entries[pos].1)
    }

    /// Inserts `id`, or updates its key if already present.
    pub fn push(&mut self, id: I, key: K) {
        if self.contains(id) {
            self.update(id, key);
            return;
        }
        let pos = self.entries.len();
        self.entries.push((id, key));
        self.positions.insert(id, pos);
        self.sift_up(pos);
    }

    /// Changes the key of `id`. Returns false if `id` is not in the heap.
    pub fn update(&mut self, id: I, key: K) -> bool {
        let Some(&pos) = self.positions.get(&id) else {
            return false;
        };
        self.entries[pos].1 = key;
        let pos = self.sift_up(pos);
        self.sift_down(pos);
        true
    }

    /// Returns the element with the smallest key.
    pub fn peek(&self) -> Option<(I, &K)> {
        self.entries.first().map(|(id, key)| (*id, key))
    }

    /// Removes and returns the element with the smallest key.
    #[cfg(test)]
    pub fn pop(&mut self) -> Option<(I, K)> {
        let id = self.entries.first()?.0;
        self.remove(id).map(|key| (id, key))
    }

    /// Removes `id`, returning its key.
    pub fn remove(&mut self, id: I) -> Option<K> {
        let pos = self.positions.remove(&id)?;
        let last = self.entries.len() - 1;
        if pos != last {
            self.entries.swap(pos, last);
            let moved = self.entries[pos].0;
            self.positions.insert(moved, pos);
        }
        let (_, key) = self.entries.pop()?;
        if pos < self.entries.len() {
            let pos = self.sift_up(pos);
            self.sift_down(pos);
        }
        Some(key)
    }

    /// Iterates over all elements in heap order (not sorted).
    pub fn iter(&self) -> impl Iterator<Item = (I, &K)> {
        self.entries.iter().map(|(id, key)| (*id, key))
    }

    /// Removes every element.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.positions.clear();
    }

    /// Removes every element, returning them in heap order.
    pub fn drain(&mut self) -> Vec<(I, K)> {
        self.positions.clear();
        std::mem::take(&mut self.entries)
    }

    // -----------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------

    fn swap(&mut self, a: usize, b: usize) {
        self.entries.swap(a, b);
        self.positions.insert(self.entries[a].0, a);
        self.positions.insert(self.entries[b].0, b);
    }

    fn sift_up(&mut self, mut pos: usize) -> usize {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if self.entries[pos].1 >= self.entries[parent].1 {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
        pos
    }

    fn sift_down(&mut self, mut pos: usize) -> usize {
        let len = self.entries.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut smallest = pos;
            if left < len && self.entries[left].1 < self.entries[smallest].1 {
                smallest = left;
            }
            if right < len && self.entries[right].1 < self.entries[smallest].1 {
                smallest = right;
            }
            if smallest == pos {
                return pos;
            }
            self.swap(pos, smallest);
            pos = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cmp::Reverse;

    use rand::Rng;

    use super::*;

    #[test]
    fn test_pop_order() {
        let mut heap = IndexedHeap::new();
        for (id, key) in [(1u32, 50usize), (2, 10), (3, 40), (4, 30), (5, 20)] {
            heap.push(id, key);
        }
        assert_eq!(heap.len(), 5);
        assert_eq!(heap.peek(), Some((2, &10)));

        let order: Vec<u32> = std::iter::from_fn(|| heap.pop().map(|(id, _)| id)).collect();
        assert_eq!(order, vec![2, 5, 4, 3, 1]);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_update_and_remove() {
        let mut heap = IndexedHeap::new();
        heap.push(1u32, 10usize);
        heap.push(2, 20);
        heap.push(3, 30);

        assert!(heap.update(3, 5));
        assert_eq!(heap.peek(), Some((3, &5)));

        assert!(heap.update(3, 100));
        assert_eq!(heap.peek(), Some((1, &10)));

        assert_eq!(heap.remove(1), Some(10));
        assert_eq!(heap.remove(1), None);
        assert!(!heap.update(1, 0));
        assert_eq!(heap.key(3), Some(&100));
        assert_eq!(heap.pop(), Some((2, 20)));
        assert_eq!(heap.pop(), Some((3, 100)));
    }

    #[test]
    fn test_max_heap_with_reverse() {
        let mut heap = IndexedHeap::new();
        heap.push("small", Reverse(1usize));
        heap.push("large", Reverse(100));
        heap.push("medium", Reverse(10));
        assert_eq!(heap.peek().map(|(id, _)| id), Some("large"));
    }

    #[test]
    fn test_random_operations() {
        let mut rng = rand::thread_rng();
        let mut heap = IndexedHeap::new();
        let mut model: HashMap<u32, u32> = HashMap::new();

        for _ in 0..2000 {
            let id = rng.gen_range(0..64u32);
            match rng.gen_range(0..3) {
                0 => {
                    let key = rng.gen_range(0..1000);
                    heap.push(id, key);
                    model.insert(id, key);
                }
                1 => {
                    assert_eq!(heap.remove(id), model.remove(&id));
                }
                _ => {
                    if let Some((id, key)) = heap.pop() {
                        let min = model.values().copied().min().unwrap();
                        assert_eq!(key, min);
                        model.remove(&id);
                    }
                }
            }
            assert_eq!(heap.len(), model.len());
        }

        let mut rest: Vec<u32> = model.values().copied().collect();
        rest.sort_unstable();
        let drained: Vec<u32> = std::iter::from_fn(|| heap.pop().map(|(_, key)| key)).collect();
        assert_eq!(drained, rest);
    }
}
