//! Device memory reuse: a best-fit arena over one preallocated region and a
//! cache of freed driver allocations.

use std::collections::BTreeMap;

/// Offsets handed out by the arena are multiples of this.
pub const ARENA_ALIGNMENT: usize = 256;

/// Best-fit allocator over `[0, capacity)`.
///
/// Free blocks are kept by offset; neighbours are merged on release so the
/// free list never holds two adjacent blocks.
#[derive(Debug)]
pub struct BestFitArena {
    capacity: usize,
    free: BTreeMap<usize, usize>,
    used: BTreeMap<usize, usize>,
}

impl BestFitArena {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity - capacity % ARENA_ALIGNMENT;
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            used: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently handed out, after alignment padding.
    pub fn bytes_in_use(&self) -> usize {
        self.used.values().sum()
    }

    pub fn largest_free_block(&self) -> usize {
        self.free.values().copied().max().unwrap_or(0)
    }

    /// Returns the offset of a block of at least `bytes`, or `None` if no
    /// free block is large enough.
    pub fn allocate(&mut self, bytes: usize) -> Option<usize> {
        let size = align_up(bytes.max(1))?;
        let (&offset, &block) = self
            .free
            .iter()
            .filter(|(_, block)| **block >= size)
            .min_by_key(|(offset, block)| (**block, **offset))?;
        self.free.remove(&offset);
        if block > size {
            self.free.insert(offset + size, block - size);
        }
        self.used.insert(offset, size);
        Some(offset)
    }

    /// Releases the block at `offset`. Unknown offsets are ignored and
    /// reported as `false`.
    pub fn release(&mut self, offset: usize) -> bool {
        let Some(mut size) = self.used.remove(&offset) else {
            return false;
        };
        let mut start = offset;

        if let Some((&next, &next_size)) = self.free.range(offset + size..).next() {
            if next == offset + size {
                self.free.remove(&next);
                size += next_size;
            }
        }
        if let Some((&prev, &prev_size)) = self.free.range(..offset).next_back() {
            if prev + prev_size == offset {
                self.free.remove(&prev);
                start = prev;
                size += prev_size;
            }
        }
        self.free.insert(start, size);
        true
    }
}

/// Freed driver allocations kept for reuse, keyed by block size.
#[derive(Debug, Default)]
pub struct BlockCache {
    blocks: BTreeMap<usize, Vec<u64>>,
    cached_bytes: usize,
}

impl BlockCache {
    pub fn cached_bytes(&self) -> usize {
        self.cached_bytes
    }

    /// Takes the smallest cached block of at least `bytes`.
    pub fn take(&mut self, bytes: usize) -> Option<(u64, usize)> {
        let (&size, ptrs) = self.blocks.range_mut(bytes..).next()?;
        let ptr = ptrs.pop()?;
        if ptrs.is_empty() {
            self.blocks.remove(&size);
        }
        self.cached_bytes -= size;
        Some((ptr, size))
    }

    pub fn put(&mut self, ptr: u64, size: usize) {
        self.blocks.entry(size).or_default().push(ptr);
        self.cached_bytes += size;
    }

    /// Empties the cache, returning every block so the caller can free it.
    pub fn drain(&mut self) -> Vec<u64> {
        self.cached_bytes = 0;
        std::mem::take(&mut self.blocks)
            .into_values()
            .flatten()
            .collect()
    }
}

fn align_up(bytes: usize) -> Option<usize> {
    let rem = bytes % ARENA_ALIGNMENT;
    if rem == 0 {
        Some(bytes)
    } else {
        bytes.checked_add(ARENA_ALIGNMENT - rem)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_are_aligned_and_disjoint() {
        let mut arena = BestFitArena::new(4096);
        let a = arena.allocate(10).unwrap();
        let b = arena.allocate(300).unwrap();
        assert_eq!(a % ARENA_ALIGNMENT, 0);
        assert_eq!(b % ARENA_ALIGNMENT, 0);
        assert!(b >= a + ARENA_ALIGNMENT);
        assert_eq!(arena.bytes_in_use(), 256 + 512);
    }

    #[test]
    fn exhausted_arena_refuses() {
        let mut arena = BestFitArena::new(512);
        assert!(arena.allocate(512).is_some());
        assert_eq!(arena.allocate(1), None);
        assert_eq!(arena.allocate(usize::MAX), None);
    }

    #[test]
    fn picks_the_smallest_fitting_hole() {
        let mut arena = BestFitArena::new(256 * 8);
        let a = arena.allocate(256 * 3).unwrap();
        let _b = arena.allocate(256).unwrap();
        let c = arena.allocate(256).unwrap();
        let _d = arena.allocate(256).unwrap();
        arena.release(a);
        arena.release(c);
        // Holes: 3 blocks at `a`, 1 block at `c`, 2 blocks at the tail.
        assert_eq!(arena.allocate(200), Some(c));
        assert_eq!(arena.allocate(256 * 2), Some(256 * 6));
    }

    #[test]
    fn release_coalesces_neighbours() {
        let mut arena = BestFitArena::new(1024);
        let blocks: Vec<usize> = (0..4).map(|_| arena.allocate(256).unwrap()).collect();
        assert_eq!(arena.largest_free_block(), 0);

        arena.release(blocks[1]);
        arena.release(blocks[3]);
        assert_eq!(arena.largest_free_block(), 256);
        arena.release(blocks[2]);
        assert_eq!(arena.largest_free_block(), 768);
        arena.release(blocks[0]);
        assert_eq!(arena.largest_free_block(), 1024);
        assert_eq!(arena.bytes_in_use(), 0);
        assert!(!arena.release(blocks[0]));
    }

    #[test]
    fn cache_returns_the_tightest_block() {
        let mut cache = BlockCache::default();
        cache.put(0x1000, 4096);
        cache.put(0x2000, 512);
        cache.put(0x3000, 1024);
        assert_eq!(cache.cached_bytes(), 5632);

        assert_eq!(cache.take(600), Some((0x3000, 1024)));
        assert_eq!(cache.take(600), Some((0x1000, 4096)));
        assert_eq!(cache.take(600), None);
        assert_eq!(cache.cached_bytes(), 512);
        assert_eq!(cache.drain(), vec![0x2000]);
        assert_eq!(cache.cached_bytes(), 0);
    }
}
