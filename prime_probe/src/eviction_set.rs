//! Eviction set construction without physical address knowledge.
//!
//! For every set index within a page, one circular pointer chain is laid out
//! in the eviction buffer. The chain visits the same in-page line offset on
//! every page needed to cover the LLC, once per way, so walking it touches
//! `ways` lines congruent to that set in each page colour.
//!
//! Pages are visited in a shuffled order, identical for all sets, which keeps
//! the walk from looking like a stride to the prefetchers.

use crate::{PrimeProbeError, EVICTION_BUFFER_BYTES};
use cache_utils::mmap::MMappedMemory;
use cache_utils::{CacheGeometry, WORD_BYTES};
use log::debug;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Fisher-Yates: for `top` from `len - 1` down to 1, swap `top` with a
/// uniformly chosen index in `[0, top]`.
pub fn shuffle<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for top in (1..items.len()).rev() {
        let current = rng.gen_range(0..=top);
        items.swap(current, top);
    }
}

/// Word-addressed memory holding the pointer chains.
///
/// Every word holds an offset into the buffer itself: zero until linked, then
/// the offset of the next element of its chain.
pub struct EvictionBuffer {
    memory: MMappedMemory<u32>,
}

impl EvictionBuffer {
    fn allocate(words: usize, huge: bool) -> Result<Self, PrimeProbeError> {
        // Writing every word faults every page in.
        let memory = MMappedMemory::try_new(words, huge, |_| 0u32)?;
        Ok(Self { memory })
    }

    fn link(&mut self, from: usize, to: usize) {
        debug_assert!(to < self.memory.len());
        self.memory[from] = to as u32;
    }

    /// Number of words.
    pub fn len(&self) -> usize {
        self.memory.len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty()
    }

    /// The link stored at `offset`.
    pub fn next(&self, offset: u32) -> u32 {
        self.memory[offset as usize]
    }

    pub(crate) fn as_ptr(&self) -> *const u32 {
        self.memory.as_ptr()
    }
}

/// Per-page set index -> offset of the head of its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetHeadTable(Vec<u32>);

impl SetHeadTable {
    pub fn head(&self, set: usize) -> u32 {
        self.0[set]
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.0.iter().copied()
    }
}

pub struct EvictionSetBuilder<R = SmallRng> {
    geometry: CacheGeometry,
    rng: R,
    huge_pages: bool,
    buffer_words: usize,
}

impl EvictionSetBuilder<SmallRng> {
    pub fn new(geometry: CacheGeometry) -> Self {
        Self::with_rng(geometry, SmallRng::from_entropy())
    }

    /// Reproducible page order: same seed, same chains.
    pub fn seeded(geometry: CacheGeometry, seed: u64) -> Self {
        Self::with_rng(geometry, SmallRng::seed_from_u64(seed))
    }
}

impl<R: Rng> EvictionSetBuilder<R> {
    pub fn with_rng(geometry: CacheGeometry, rng: R) -> Self {
        Self {
            geometry,
            rng,
            huge_pages: false,
            buffer_words: EVICTION_BUFFER_BYTES / WORD_BYTES,
        }
    }

    pub fn huge_pages(mut self, huge_pages: bool) -> Self {
        self.huge_pages = huge_pages;
        self
    }

    /// Override the eviction buffer size. It must still cover the geometry.
    pub fn buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_words = bytes / WORD_BYTES;
        self
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    /// Fresh random visiting order of the pages covering the LLC.
    pub fn page_order(&mut self) -> Vec<usize> {
        let mut pages: Vec<usize> = (0..self.geometry.pages_needed()).collect();
        shuffle(&mut pages, &mut self.rng);
        pages
    }

    pub fn build(mut self) -> Result<(EvictionBuffer, SetHeadTable), PrimeProbeError> {
        let g = self.geometry;
        let needed = g.words_spanned();
        if needed > self.buffer_words || needed > u32::MAX as usize {
            return Err(PrimeProbeError::BufferTooSmall {
                needed,
                available: self.buffer_words,
            });
        }

        let pages = self.page_order();
        let mut buffer = EvictionBuffer::allocate(self.buffer_words, self.huge_pages)?;
        let mut heads = Vec::with_capacity(g.sets_per_page());

        for set in 0..g.sets_per_page() {
            let head = g.word_offset(pages[0], 0, set);
            heads.push(head as u32);
            let mut current = head;
            // Outer loop over ways, inner loop over the pages covering all sets.
            for way in 0..g.ways() {
                for &page in &pages[1..] {
                    let next = g.word_offset(page, way, set);
                    buffer.link(current, next);
                    current = next;
                }
                // Last page of a way hands over to the next way, the last way closes the circle.
                let next = if way == g.ways() - 1 {
                    head
                } else {
                    g.word_offset(pages[0], way + 1, set)
                };
                buffer.link(current, next);
                current = next;
            }
        }

        debug!(
            "laid out {} eviction chains of {} lines ({} ways x {} pages) in {} words",
            g.sets_per_page(),
            g.ways() * g.pages_needed(),
            g.ways(),
            g.pages_needed(),
            buffer.len()
        );
        Ok((buffer, SetHeadTable(heads)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn small_geometry() -> CacheGeometry {
        CacheGeometry::with_sets_and_ways(256, 4).unwrap()
    }

    fn walk(buffer: &EvictionBuffer, head: u32) -> Vec<u32> {
        let mut chain = vec![head];
        let mut current = buffer.next(head);
        while current != head {
            chain.push(current);
            current = buffer.next(current);
            assert!(chain.len() <= buffer.len(), "chain does not close");
        }
        chain
    }

    fn check_well_formed(g: CacheGeometry, buffer: &EvictionBuffer, heads: &SetHeadTable) {
        assert_eq!(heads.len(), g.sets_per_page());
        let set_mask = g.sets_per_page() as u32 - 1;
        let page_mask = (1u32 << (g.way_word_shift() - g.page_word_shift())) - 1;
        for (set, head) in heads.iter().enumerate() {
            let chain = walk(buffer, head);
            assert_eq!(chain.len(), g.ways() * g.pages_needed());
            let distinct: HashSet<u32> = chain.iter().copied().collect();
            assert_eq!(distinct.len(), chain.len(), "sub-cycle in set {}", set);

            let mut per_way: HashMap<u32, HashSet<u32>> = HashMap::new();
            for &offset in &chain {
                assert_eq!((offset >> g.line_word_shift()) & set_mask, set as u32);
                let way = offset >> g.way_word_shift();
                let page = (offset >> g.page_word_shift()) & page_mask;
                assert!(per_way.entry(way).or_default().insert(page));
            }
            assert_eq!(per_way.len(), g.ways());
            assert!(per_way.values().all(|p| p.len() == g.pages_needed()));
        }
    }

    #[test]
    fn chains_are_well_formed() {
        let g = small_geometry();
        let (buffer, heads) = EvictionSetBuilder::seeded(g, 1)
            .buffer_bytes(64 * 1024)
            .build()
            .unwrap();
        check_well_formed(g, &buffer, &heads);
    }

    #[test]
    fn chains_are_well_formed_for_presets() {
        for name in ["default", "i5-3470", "i7-7600u"].iter() {
            let g = CacheGeometry::preset(name).unwrap();
            let (buffer, heads) = EvictionSetBuilder::seeded(g, 42).build().unwrap();
            assert_eq!(buffer.len() * WORD_BYTES, EVICTION_BUFFER_BYTES);
            check_well_formed(g, &buffer, &heads);
        }
    }

    #[test]
    fn single_page_geometry() {
        let g = CacheGeometry::with_sets_and_ways(64, 8).unwrap();
        let (buffer, heads) = EvictionSetBuilder::seeded(g, 3)
            .buffer_bytes(64 * 1024)
            .build()
            .unwrap();
        check_well_formed(g, &buffer, &heads);
        assert_eq!(walk(&buffer, heads.head(5)).len(), 8);
    }

    #[test]
    fn non_default_line_and_page() {
        let g = CacheGeometry::new(2048, 8, 128, 16384, 4).unwrap();
        let (buffer, heads) = EvictionSetBuilder::seeded(g, 9)
            .buffer_bytes(g.words_spanned() * WORD_BYTES)
            .build()
            .unwrap();
        check_well_formed(g, &buffer, &heads);
    }

    #[test]
    fn head_is_first_permuted_page_way_zero() {
        let g = small_geometry();
        let mut probe = EvictionSetBuilder::seeded(g, 5);
        let first_page = probe.page_order()[0];
        let (_, heads) = EvictionSetBuilder::seeded(g, 5)
            .buffer_bytes(64 * 1024)
            .build()
            .unwrap();
        for set in 0..g.sets_per_page() {
            assert_eq!(heads.head(set) as usize, g.word_offset(first_page, 0, set));
        }
    }

    #[test]
    fn same_seed_same_layout() {
        let g = small_geometry();
        let (b1, h1) = EvictionSetBuilder::seeded(g, 7)
            .buffer_bytes(64 * 1024)
            .build()
            .unwrap();
        let (b2, h2) = EvictionSetBuilder::seeded(g, 7)
            .buffer_bytes(64 * 1024)
            .build()
            .unwrap();
        assert_eq!(h1, h2);
        for head in h1.iter() {
            assert_eq!(walk(&b1, head), walk(&b2, head));
        }
        assert_eq!(b1.memory.slice(), b2.memory.slice());
    }

    #[test]
    fn different_seed_different_order() {
        let g = CacheGeometry::default();
        let a = EvictionSetBuilder::seeded(g, 1).page_order();
        let b = EvictionSetBuilder::seeded(g, 2).page_order();
        assert_ne!(a, b);
    }

    #[test]
    fn buffer_too_small() {
        let g = CacheGeometry::default();
        let r = EvictionSetBuilder::seeded(g, 1)
            .buffer_bytes(1024 * 1024)
            .build();
        match r {
            Err(PrimeProbeError::BufferTooSmall { needed, available }) => {
                assert_eq!(needed, g.words_spanned());
                assert_eq!(available, 256 * 1024);
            }
            _ => panic!("expected BufferTooSmall"),
        }
    }

    #[test]
    fn shuffle_is_a_permutation() {
        let mut rng = SmallRng::seed_from_u64(11);
        for n in [0usize, 1, 2, 17, 192].iter() {
            let mut v: Vec<usize> = (0..*n).collect();
            shuffle(&mut v, &mut rng);
            let mut sorted = v.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, (0..*n).collect::<Vec<_>>());
        }
    }

    #[test]
    fn shuffle_is_unbiased() {
        const TRIALS: usize = 60_000;
        let mut rng = SmallRng::seed_from_u64(0xc0ffee);
        let mut counts: HashMap<Vec<u8>, usize> = HashMap::new();
        for _ in 0..TRIALS {
            let mut v = vec![0u8, 1, 2];
            shuffle(&mut v, &mut rng);
            *counts.entry(v).or_default() += 1;
        }
        assert_eq!(counts.len(), 6);
        let expected = TRIALS / 6;
        for (perm, count) in counts {
            assert!(
                (count as isize - expected as isize).abs() < (expected / 10) as isize,
                "{:?} drawn {} times, expected about {}",
                perm,
                count,
                expected
            );
        }
    }

    #[test]
    fn every_position_equally_likely() {
        const TRIALS: usize = 40_000;
        const N: usize = 8;
        let mut rng = SmallRng::seed_from_u64(77);
        let mut first = [0usize; N];
        for _ in 0..TRIALS {
            let mut v: Vec<usize> = (0..N).collect();
            shuffle(&mut v, &mut rng);
            first[v[0]] += 1;
        }
        let expected = TRIALS / N;
        for count in first.iter() {
            assert!((*count as isize - expected as isize).abs() < (expected / 10) as isize);
        }
    }
}
