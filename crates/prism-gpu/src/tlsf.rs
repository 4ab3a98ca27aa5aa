//! Two-level segregated-fit suballocator.
//!
//! Carves constant-time allocations out of large backing chunks. The
//! allocator itself is pure bookkeeping: actual chunk acquisition and
//! release go through a pluggable [`ChunkBackend`], which keeps the device
//! plumbing out of the data structure and makes it testable in isolation.

use crate::format::align_up;

/// Second-level subdivision: each power-of-two range splits into 32 bins.
const SL_COUNT_LOG2: u32 = 5;
const SL_COUNT: usize = 1 << SL_COUNT_LOG2;
/// First-level bins cover sizes up to 2^48 bytes.
const FL_COUNT: usize = 48;

/// Identifies one backing chunk owned by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkId(pub u32);

/// Opaque handle to a live allocated range; required to free it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlsfToken(u32);

/// A successful suballocation.
#[derive(Debug, Clone, Copy)]
pub struct TlsfAllocation {
    /// Backing chunk the range lives in.
    pub chunk: ChunkId,
    /// Offset of the range within the chunk.
    pub offset: u64,
    /// Rounded size of the range.
    pub size: u64,
    /// Handle used to free the range.
    pub token: TlsfToken,
}

/// Supplies backing chunks to the allocator.
///
/// `try_allocate_chunk` must return a chunk of at least `min_size` bytes
/// whose size is a multiple of the allocator's minimum alignment, or `None`
/// when the backend cannot grow.
pub trait ChunkBackend {
    /// Acquire a new chunk of at least `min_size` bytes.
    fn try_allocate_chunk(&mut self, min_size: u64) -> Option<(ChunkId, u64)>;
    /// Release a chunk that no longer contains any live range.
    fn free_chunk(&mut self, chunk: ChunkId);
}

#[derive(Debug, Clone, Copy)]
struct Block {
    chunk: ChunkId,
    offset: u64,
    size: u64,
    prev_phys: Option<u32>,
    next_phys: Option<u32>,
    prev_free: Option<u32>,
    next_free: Option<u32>,
    free: bool,
}

/// Two-level segregated-fit allocator over chunks supplied by `B`.
///
/// All offsets and sizes are multiples of the minimum alignment, so every
/// returned address is aligned by construction rather than by post-hoc
/// rounding.
pub struct Tlsf<B: ChunkBackend> {
    backend: B,
    min_alignment: u64,
    blocks: Vec<Block>,
    free_slots: Vec<u32>,
    fl_bitmap: u64,
    sl_bitmaps: [u32; FL_COUNT],
    free_heads: Vec<Option<u32>>,
}

impl<B: ChunkBackend> Tlsf<B> {
    /// Create an allocator with the given minimum alignment.
    ///
    /// The alignment must be a power of two and at least 64.
    pub fn new(backend: B, min_alignment: u64) -> Self {
        assert!(min_alignment.is_power_of_two() && min_alignment >= 64);
        Self {
            backend,
            min_alignment,
            blocks: Vec::new(),
            free_slots: Vec::new(),
            fl_bitmap: 0,
            sl_bitmaps: [0; FL_COUNT],
            free_heads: vec![None; FL_COUNT * SL_COUNT],
        }
    }

    /// Access the chunk backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Mutable access to the chunk backend.
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Allocate `size` bytes, growing the backend when needed.
    pub fn try_allocate(&mut self, size: u64) -> Option<TlsfAllocation> {
        self.allocate_inner(size, true)
    }

    /// Allocate `size` bytes from existing chunks only.
    pub fn try_allocate_existing(&mut self, size: u64) -> Option<TlsfAllocation> {
        self.allocate_inner(size, false)
    }

    /// Return a range to the allocator, merging with free neighbors.
    ///
    /// Chunks left without any live range are released via the backend.
    pub fn free(&mut self, token: TlsfToken) {
        let mut idx = token.0;
        assert!(
            !self.blocks[idx as usize].free,
            "double free of TLSF token {token:?}"
        );

        // Merge with the previous physical neighbor
        if let Some(prev) = self.blocks[idx as usize].prev_phys {
            if self.blocks[prev as usize].free {
                self.remove_free(prev);
                let absorbed = self.blocks[idx as usize];
                self.blocks[prev as usize].size += absorbed.size;
                self.blocks[prev as usize].next_phys = absorbed.next_phys;
                if let Some(next) = absorbed.next_phys {
                    self.blocks[next as usize].prev_phys = Some(prev);
                }
                self.recycle(idx);
                idx = prev;
            }
        }

        // Merge with the next physical neighbor
        if let Some(next) = self.blocks[idx as usize].next_phys {
            if self.blocks[next as usize].free {
                self.remove_free(next);
                let absorbed = self.blocks[next as usize];
                self.blocks[idx as usize].size += absorbed.size;
                self.blocks[idx as usize].next_phys = absorbed.next_phys;
                if let Some(after) = absorbed.next_phys {
                    self.blocks[after as usize].prev_phys = Some(idx);
                }
                self.recycle(next);
            }
        }

        let block = self.blocks[idx as usize];
        if block.prev_phys.is_none() && block.next_phys.is_none() {
            // The block spans its whole chunk; give the chunk back
            self.backend.free_chunk(block.chunk);
            self.recycle(idx);
        } else {
            self.blocks[idx as usize].free = true;
            self.insert_free(idx);
        }
    }

    fn allocate_inner(&mut self, size: u64, allow_grow: bool) -> Option<TlsfAllocation> {
        assert!(size > 0);
        let size = align_up(size, self.min_alignment);

        let idx = match self.find_suitable(size) {
            Some(idx) => idx,
            None => {
                if !allow_grow {
                    return None;
                }
                let (chunk, chunk_size) = self.backend.try_allocate_chunk(size)?;
                debug_assert!(chunk_size >= size);
                debug_assert_eq!(chunk_size % self.min_alignment, 0);
                // Allocate straight from the fresh block: a chunk sized
                // exactly to the request can sit one bin below the
                // rounded-up search bin and a re-search would miss it.
                let fresh = self.new_block(Block {
                    chunk,
                    offset: 0,
                    size: chunk_size,
                    prev_phys: None,
                    next_phys: None,
                    prev_free: None,
                    next_free: None,
                    free: true,
                });
                self.insert_free(fresh);
                fresh
            }
        };

        self.remove_free(idx);

        // Split off the tail when the block is larger than requested
        let block = self.blocks[idx as usize];
        let extra = block.size - size;
        if extra >= self.min_alignment {
            let remainder = self.new_block(Block {
                chunk: block.chunk,
                offset: block.offset + size,
                size: extra,
                prev_phys: Some(idx),
                next_phys: block.next_phys,
                prev_free: None,
                next_free: None,
                free: true,
            });
            if let Some(next) = block.next_phys {
                self.blocks[next as usize].prev_phys = Some(remainder);
            }
            self.blocks[idx as usize].next_phys = Some(remainder);
            self.blocks[idx as usize].size = size;
            self.insert_free(remainder);
        }

        self.blocks[idx as usize].free = false;
        let block = self.blocks[idx as usize];
        Some(TlsfAllocation {
            chunk: block.chunk,
            offset: block.offset,
            size: block.size,
            token: TlsfToken(idx),
        })
    }

    /// Map a block size to its exact (first, second) level indices.
    fn mapping_insert(size: u64) -> (usize, usize) {
        let fl = (63 - size.leading_zeros()) as usize;
        debug_assert!(fl >= SL_COUNT_LOG2 as usize && fl < FL_COUNT);
        let sl = ((size >> (fl as u32 - SL_COUNT_LOG2)) as usize) & (SL_COUNT - 1);
        (fl, sl)
    }

    /// Map a request size to the lowest list guaranteed to fit it.
    fn mapping_search(size: u64) -> (usize, usize) {
        let fl = (63 - size.leading_zeros()) as usize;
        let rounded = size + (1u64 << (fl as u32 - SL_COUNT_LOG2)) - 1;
        Self::mapping_insert(rounded)
    }

    fn find_suitable(&self, size: u64) -> Option<u32> {
        let (fl, sl) = Self::mapping_search(size);

        // Bins >= sl within the same first level
        let sl_map = self.sl_bitmaps[fl] & (!0u32 << sl);
        if sl_map != 0 {
            let sl = sl_map.trailing_zeros() as usize;
            return self.free_heads[fl * SL_COUNT + sl];
        }

        // Any bin in a higher first level
        let fl_map = self.fl_bitmap & (!0u64).checked_shl(fl as u32 + 1)?;
        if fl_map == 0 {
            return None;
        }
        let fl = fl_map.trailing_zeros() as usize;
        let sl = self.sl_bitmaps[fl].trailing_zeros() as usize;
        self.free_heads[fl * SL_COUNT + sl]
    }

    fn insert_free(&mut self, idx: u32) {
        let (fl, sl) = Self::mapping_insert(self.blocks[idx as usize].size);
        let list = fl * SL_COUNT + sl;
        let head = self.free_heads[list];
        self.blocks[idx as usize].prev_free = None;
        self.blocks[idx as usize].next_free = head;
        if let Some(head) = head {
            self.blocks[head as usize].prev_free = Some(idx);
        }
        self.free_heads[list] = Some(idx);
        self.fl_bitmap |= 1 << fl;
        self.sl_bitmaps[fl] |= 1 << sl;
    }

    fn remove_free(&mut self, idx: u32) {
        let (fl, sl) = Self::mapping_insert(self.blocks[idx as usize].size);
        let list = fl * SL_COUNT + sl;
        let prev = self.blocks[idx as usize].prev_free;
        let next = self.blocks[idx as usize].next_free;

        match prev {
            Some(prev) => self.blocks[prev as usize].next_free = next,
            None => {
                self.free_heads[list] = next;
                if next.is_none() {
                    self.sl_bitmaps[fl] &= !(1 << sl);
                    if self.sl_bitmaps[fl] == 0 {
                        self.fl_bitmap &= !(1 << fl);
                    }
                }
            }
        }
        if let Some(next) = next {
            self.blocks[next as usize].prev_free = prev;
        }
        self.blocks[idx as usize].prev_free = None;
        self.blocks[idx as usize].next_free = None;
    }

    fn new_block(&mut self, block: Block) -> u32 {
        if let Some(idx) = self.free_slots.pop() {
            self.blocks[idx as usize] = block;
            idx
        } else {
            let idx = u32::try_from(self.blocks.len()).expect("TLSF block count overflow");
            self.blocks.push(block);
            idx
        }
    }

    fn recycle(&mut self, idx: u32) {
        // Poison the slot so stale tokens trip the double-free assert
        self.blocks[idx as usize].free = true;
        self.blocks[idx as usize].size = 0;
        self.free_slots.push(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct TestBackend {
        chunk_size: u64,
        live: Vec<bool>,
        grow_calls: usize,
        free_calls: usize,
    }

    impl TestBackend {
        fn with_chunk_size(chunk_size: u64) -> Self {
            Self {
                chunk_size,
                ..Self::default()
            }
        }

        fn live_chunks(&self) -> usize {
            self.live.iter().filter(|&&l| l).count()
        }
    }

    impl ChunkBackend for TestBackend {
        fn try_allocate_chunk(&mut self, min_size: u64) -> Option<(ChunkId, u64)> {
            self.grow_calls += 1;
            let size = self.chunk_size.max(align_up(min_size, 64));
            let id = ChunkId(self.live.len() as u32);
            self.live.push(true);
            Some((id, size))
        }

        fn free_chunk(&mut self, chunk: ChunkId) {
            self.free_calls += 1;
            assert!(self.live[chunk.0 as usize], "chunk freed twice");
            self.live[chunk.0 as usize] = false;
        }
    }

    #[test]
    fn sizes_round_up_to_alignment() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(4096), 64);
        let a = tlsf.try_allocate(1).unwrap();
        let b = tlsf.try_allocate(1).unwrap();
        assert_eq!(a.offset, 0);
        assert_eq!(a.size, 64);
        assert_eq!(b.offset, 64);
    }

    #[test]
    fn addresses_honor_large_alignment() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(8192), 256);
        for size in [1u64, 100, 255, 256, 300] {
            let alloc = tlsf.try_allocate(size).unwrap();
            assert_eq!(alloc.offset % 256, 0);
            assert_eq!(alloc.size % 256, 0);
        }
    }

    #[test]
    fn allocations_never_overlap() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(64 * 1024), 64);
        let sizes = [64u64, 1000, 64, 4096, 128, 777, 2048, 64, 9000, 333];
        let mut live: Vec<TlsfAllocation> = Vec::new();
        for (i, &size) in sizes.iter().enumerate() {
            let alloc = tlsf.try_allocate(size).unwrap();
            live.push(alloc);
            // Free every third allocation to churn the free lists
            if i % 3 == 2 {
                let victim = live.remove(i / 3);
                tlsf.free(victim.token);
            }
        }
        for (i, a) in live.iter().enumerate() {
            for b in live.iter().skip(i + 1) {
                if a.chunk == b.chunk {
                    let disjoint = a.offset + a.size <= b.offset || b.offset + b.size <= a.offset;
                    assert!(disjoint, "ranges overlap: {a:?} vs {b:?}");
                }
            }
        }
    }

    #[test]
    fn freed_range_is_immediately_reusable() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(4096), 64);
        let a = tlsf.try_allocate(1024).unwrap();
        let offset = a.offset;
        tlsf.free(a.token);
        let b = tlsf.try_allocate(1024).unwrap();
        assert_eq!(b.offset, offset);
        assert_eq!(tlsf.backend().grow_calls, 1);
    }

    #[test]
    fn merge_with_neighbors_releases_empty_chunk() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(4096), 64);
        let a = tlsf.try_allocate(512).unwrap();
        let b = tlsf.try_allocate(512).unwrap();
        let c = tlsf.try_allocate(512).unwrap();
        // Free out of order so both merge directions run
        tlsf.free(b.token);
        tlsf.free(a.token);
        assert_eq!(tlsf.backend().free_calls, 0);
        tlsf.free(c.token);
        assert_eq!(tlsf.backend().free_calls, 1);
        assert_eq!(tlsf.backend().live_chunks(), 0);
    }

    #[test]
    fn grows_a_new_chunk_when_full() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(1024), 64);
        let a = tlsf.try_allocate(1024).unwrap();
        let b = tlsf.try_allocate(1024).unwrap();
        assert_ne!(a.chunk, b.chunk);
        assert_eq!(tlsf.backend().grow_calls, 2);
    }

    #[test]
    fn oversized_request_grows_a_matching_chunk() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(1024), 64);
        let big = tlsf.try_allocate(100_000).unwrap();
        assert_eq!(big.offset, 0);
        assert_eq!(big.size, align_up(100_000, 64));
    }

    #[test]
    fn existing_only_allocation_never_grows() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(4096), 64);
        assert!(tlsf.try_allocate_existing(64).is_none());
        assert_eq!(tlsf.backend().grow_calls, 0);

        let a = tlsf.try_allocate(64).unwrap();
        tlsf.free(a.token);
        // The chunk went back to the backend, so there is still nothing
        assert!(tlsf.try_allocate_existing(64).is_none());

        let _keep = tlsf.try_allocate(64).unwrap();
        assert!(tlsf.try_allocate_existing(64).is_some());
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_detected() {
        let mut tlsf = Tlsf::new(TestBackend::with_chunk_size(4096), 64);
        let a = tlsf.try_allocate(64).unwrap();
        let b = tlsf.try_allocate(64).unwrap();
        let _ = b;
        tlsf.free(a.token);
        tlsf.free(a.token);
    }
}
