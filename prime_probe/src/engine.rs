use crate::eviction_set::{EvictionBuffer, EvictionSetBuilder, SetHeadTable};
use crate::PrimeProbeError;
use cache_side_channel::Contender;
use cache_utils::{maccess, CacheGeometry};
use log::info;
use rand::Rng;
use std::hint::black_box;

/// Owns the eviction buffer and walks its chains.
pub struct PrimeProbeEngine {
    geometry: CacheGeometry,
    buffer: EvictionBuffer,
    heads: SetHeadTable,
}

impl PrimeProbeEngine {
    /// Build eviction sets for `geometry`. A seed makes the page order reproducible.
    pub fn new(
        geometry: CacheGeometry,
        seed: Option<u64>,
        huge_pages: bool,
    ) -> Result<Self, PrimeProbeError> {
        match seed {
            Some(seed) => {
                Self::from_builder(EvictionSetBuilder::seeded(geometry, seed).huge_pages(huge_pages))
            }
            None => Self::from_builder(EvictionSetBuilder::new(geometry).huge_pages(huge_pages)),
        }
    }

    pub fn from_builder<R: Rng>(builder: EvictionSetBuilder<R>) -> Result<Self, PrimeProbeError> {
        let geometry = *builder.geometry();
        let (buffer, heads) = builder.build()?;
        info!(
            "eviction sets ready: {} sets x {} ways, {} pages, every {} set(s) probed",
            geometry.total_sets(),
            geometry.ways(),
            geometry.pages_needed(),
            geometry.set_skipping_step()
        );
        Ok(Self {
            geometry,
            buffer,
            heads,
        })
    }

    pub fn geometry(&self) -> &CacheGeometry {
        &self.geometry
    }

    pub fn heads(&self) -> &SetHeadTable {
        &self.heads
    }

    pub fn buffer(&self) -> &EvictionBuffer {
        &self.buffer
    }

    /// Walk the chain of `set` once around. Returns the last pointer read,
    /// which is the chain head.
    pub fn probe_set(&self, set: usize) -> u32 {
        let base = self.buffer.as_ptr();
        let head = self.heads.head(set);
        let mut pointer = head;
        loop {
            // Safety: every word of the buffer holds an offset into the buffer,
            // and heads come from the same builder.
            pointer = unsafe { maccess(base.add(pointer as usize)) };
            if pointer == head {
                break;
            }
        }
        pointer
    }

    /// One pass: probe sets `0, step, 2*step, ...` below the per-page set count.
    pub fn probe_all_sets(&self) -> u32 {
        let mut pointer = 0;
        for set in (0..self.geometry.sets_per_page()).step_by(self.geometry.set_skipping_step()) {
            pointer = self.probe_set(set);
        }
        pointer
    }
}

impl Contender for PrimeProbeEngine {
    fn contend(&mut self) {
        black_box(self.probe_all_sets());
    }
}
