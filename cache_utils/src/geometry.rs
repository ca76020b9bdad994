//! Static description of the last level cache targeted by the channel.
//!
//! The eviction buffer is addressed in 32-bit words, so every byte-level
//! quantity (page, line) is also exposed as a shift in word units.

use thiserror::Error;

/// Size of one eviction buffer slot.
pub const WORD_BYTES: usize = 4;
const WORD_SHIFT: u32 = 2;

pub const DEFAULT_LINE_BYTES: usize = 64;
pub const DEFAULT_PAGE_BYTES: usize = 4096;
pub const DEFAULT_SET_SKIPPING_STEP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub total_sets: usize,
    pub ways: usize,
}

/// i5-3470: 6MB, 12 ways -> 8192 sets. i7-7600u: 4MB, 16 ways -> 4096 sets.
pub const PRESETS: [Preset; 3] = [
    Preset {
        name: "default",
        total_sets: 12288,
        ways: 16,
    },
    Preset {
        name: "i5-3470",
        total_sets: 8192,
        ways: 12,
    },
    Preset {
        name: "i7-7600u",
        total_sets: 4096,
        ways: 16,
    },
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("{name} ({value}) must be a power of two")]
    NotPowerOfTwo { name: &'static str, value: usize },
    #[error("line size {0} is smaller than a 4 byte word")]
    LineSmallerThanWord(usize),
    #[error("page size {page_bytes} is smaller than line size {line_bytes}")]
    PageSmallerThanLine {
        page_bytes: usize,
        line_bytes: usize,
    },
    #[error("{total_sets} sets cannot be covered by whole pages of {sets_per_page} sets")]
    SetsNotPageMultiple {
        total_sets: usize,
        sets_per_page: usize,
    },
    #[error("{total_sets} sets x {ways} ways cannot be laid out in the address space")]
    TooLarge { total_sets: usize, ways: usize },
    #[error("unknown cache preset {0:?}")]
    UnknownPreset(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheGeometry {
    total_sets: usize,
    ways: usize,
    line_bytes: usize,
    page_bytes: usize,
    sets_per_page: usize,
    set_skipping_step: usize,
}

fn check_power_of_two(name: &'static str, value: usize) -> Result<(), GeometryError> {
    if value == 0 {
        Err(GeometryError::Zero(name))
    } else if !value.is_power_of_two() {
        Err(GeometryError::NotPowerOfTwo { name, value })
    } else {
        Ok(())
    }
}

/// One past the highest word offset, or `None` if the layout or the byte
/// capacity overflows `usize`.
fn checked_extent(
    total_sets: usize,
    ways: usize,
    line_bytes: usize,
    page_bytes: usize,
    sets_per_page: usize,
) -> Option<usize> {
    total_sets.checked_mul(ways)?.checked_mul(line_bytes)?;
    let line_word_shift = line_bytes.trailing_zeros() - WORD_SHIFT;
    let page_word_shift = page_bytes.trailing_zeros() - WORD_SHIFT;
    let set_bits = total_sets.checked_next_power_of_two()?.trailing_zeros();
    let way_stride = 1usize.checked_shl(set_bits + line_word_shift)?;
    let pages = total_sets / sets_per_page;
    (ways - 1)
        .checked_mul(way_stride)?
        .checked_add((pages - 1).checked_mul(1 << page_word_shift)?)?
        .checked_add((sets_per_page - 1) << line_word_shift)?
        .checked_add(1)
}

impl CacheGeometry {
    pub fn new(
        total_sets: usize,
        ways: usize,
        line_bytes: usize,
        page_bytes: usize,
        set_skipping_step: usize,
    ) -> Result<Self, GeometryError> {
        if total_sets == 0 {
            return Err(GeometryError::Zero("total_sets"));
        }
        if ways == 0 {
            return Err(GeometryError::Zero("ways"));
        }
        if set_skipping_step == 0 {
            return Err(GeometryError::Zero("set_skipping_step"));
        }
        check_power_of_two("line_bytes", line_bytes)?;
        check_power_of_two("page_bytes", page_bytes)?;
        if line_bytes < WORD_BYTES {
            return Err(GeometryError::LineSmallerThanWord(line_bytes));
        }
        if page_bytes < line_bytes {
            return Err(GeometryError::PageSmallerThanLine {
                page_bytes,
                line_bytes,
            });
        }
        let sets_per_page = page_bytes / line_bytes;
        if total_sets % sets_per_page != 0 {
            return Err(GeometryError::SetsNotPageMultiple {
                total_sets,
                sets_per_page,
            });
        }
        if checked_extent(total_sets, ways, line_bytes, page_bytes, sets_per_page).is_none() {
            return Err(GeometryError::TooLarge { total_sets, ways });
        }
        Ok(Self {
            total_sets,
            ways,
            line_bytes,
            page_bytes,
            sets_per_page,
            set_skipping_step,
        })
    }

    /// Geometry with 64 byte lines, 4KiB pages and the default set stride.
    pub fn with_sets_and_ways(total_sets: usize, ways: usize) -> Result<Self, GeometryError> {
        Self::new(
            total_sets,
            ways,
            DEFAULT_LINE_BYTES,
            DEFAULT_PAGE_BYTES,
            DEFAULT_SET_SKIPPING_STEP,
        )
    }

    pub fn preset(name: &str) -> Result<Self, GeometryError> {
        PRESETS
            .iter()
            .find(|p| p.name == name)
            .ok_or_else(|| GeometryError::UnknownPreset(name.to_owned()))
            .and_then(|p| Self::with_sets_and_ways(p.total_sets, p.ways))
    }

    pub fn with_set_skipping_step(self, set_skipping_step: usize) -> Result<Self, GeometryError> {
        Self::new(
            self.total_sets,
            self.ways,
            self.line_bytes,
            self.page_bytes,
            set_skipping_step,
        )
    }

    pub fn total_sets(&self) -> usize {
        self.total_sets
    }

    pub fn ways(&self) -> usize {
        self.ways
    }

    pub fn line_bytes(&self) -> usize {
        self.line_bytes
    }

    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    pub fn sets_per_page(&self) -> usize {
        self.sets_per_page
    }

    pub fn set_skipping_step(&self) -> usize {
        self.set_skipping_step
    }

    /// Pages needed so that every LLC set has one line per page.
    pub fn pages_needed(&self) -> usize {
        self.total_sets / self.sets_per_page
    }

    /// Total capacity in bytes.
    pub fn capacity_bytes(&self) -> usize {
        self.total_sets * self.ways * self.line_bytes
    }

    /// `log2(line_bytes) - log2(word)`: shift from a set index to its word offset in a page.
    pub fn line_word_shift(&self) -> u32 {
        self.line_bytes.trailing_zeros() - WORD_SHIFT
    }

    /// `log2(page_bytes) - log2(word)`: shift from a page number to its word offset.
    pub fn page_word_shift(&self) -> u32 {
        self.page_bytes.trailing_zeros() - WORD_SHIFT
    }

    /// Shift separating consecutive ways of one set: a stride covering every set of the cache.
    /// 16 for 4096 sets, 17 for 8192 sets, 18 for 12288 sets with 64 byte lines.
    pub fn way_word_shift(&self) -> u32 {
        let set_bits = self.total_sets.next_power_of_two().trailing_zeros();
        set_bits + self.line_word_shift()
    }

    /// Word offset of the line for permuted page `page`, way `way` and per-page set `set`.
    pub fn word_offset(&self, page: usize, way: usize, set: usize) -> usize {
        (way << self.way_word_shift()) + (page << self.page_word_shift()) + (set << self.line_word_shift())
    }

    /// One past the highest word offset `word_offset` can produce.
    pub fn words_spanned(&self) -> usize {
        self.word_offset(self.pages_needed() - 1, self.ways - 1, self.sets_per_page - 1) + 1
    }
}

impl Default for CacheGeometry {
    fn default() -> Self {
        Self {
            total_sets: PRESETS[0].total_sets,
            ways: PRESETS[0].ways,
            line_bytes: DEFAULT_LINE_BYTES,
            page_bytes: DEFAULT_PAGE_BYTES,
            sets_per_page: DEFAULT_PAGE_BYTES / DEFAULT_LINE_BYTES,
            set_skipping_step: DEFAULT_SET_SKIPPING_STEP,
        }
    }
}
