/// Cache hierarchy discovery through CPUID leaf 4 (deterministic cache parameters).
///
/// Only the highest level unified cache matters here: it is the cache shared
/// with the other side of the channel.
use crate::geometry::{CacheGeometry, DEFAULT_SET_SKIPPING_STEP};
use lazy_static::lazy_static;
use log::debug;

#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as arch_x86;

const CACHE_INFO_CPUID_LEAF: u32 = 0x4;

/// Raw register values of one CPUID sub-leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuidRegisters {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheType {
    Data = 1,
    Instruction = 2,
    Unified = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLevel {
    pub cache_type: CacheType,
    pub level: u8,
    pub line_size: u16,
    pub physical_line_partition: u16,
    pub associativity: u16,
    pub sets: u32,
    pub inclusive: bool,
    pub complex_cache_indexing: bool,
}

impl CacheLevel {
    pub fn from_cpuid(r: &CpuidRegisters) -> Option<CacheLevel> {
        let cache_type = match r.eax & 0x1f {
            1 => CacheType::Data,
            2 => CacheType::Instruction,
            3 => CacheType::Unified,
            _ => {
                return None;
            }
        };
        Some(CacheLevel {
            cache_type,
            level: (r.eax >> 5 & 0x7) as u8,
            line_size: (r.ebx & 0xfff) as u16 + 1,
            physical_line_partition: (r.ebx >> 12 & 0x3ff) as u16 + 1,
            associativity: (r.ebx >> 22 & 0x3ff) as u16 + 1,
            sets: r.ecx + 1,
            inclusive: (r.edx & 0x2) != 0,
            complex_cache_indexing: (r.edx & 0x4) != 0,
        })
    }

    pub fn size_bytes(&self) -> usize {
        self.sets as usize
            * self.associativity as usize
            * self.line_size as usize
            * self.physical_line_partition as usize
    }

    /// Channel geometry for this cache, assuming 4KiB pages.
    pub fn geometry(&self) -> Option<CacheGeometry> {
        CacheGeometry::new(
            self.sets as usize,
            self.associativity as usize,
            self.line_size as usize,
            4096,
            DEFAULT_SET_SKIPPING_STEP,
        )
        .ok()
    }
}

#[cfg(target_arch = "x86_64")]
pub fn get_cache_info() -> Vec<CacheLevel> {
    let mut ret = Vec::new();
    let mut i = 0;
    loop {
        let r = unsafe { arch_x86::__cpuid_count(CACHE_INFO_CPUID_LEAF, i) };
        let regs = CpuidRegisters {
            eax: r.eax,
            ebx: r.ebx,
            ecx: r.ecx,
            edx: r.edx,
        };
        match CacheLevel::from_cpuid(&regs) {
            Some(level) => ret.push(level),
            None => break,
        }
        i += 1;
    }
    ret
}

#[cfg(not(target_arch = "x86_64"))]
pub fn get_cache_info() -> Vec<CacheLevel> {
    Vec::new()
}

/// Highest level unified cache among `levels`.
pub fn last_level(levels: &[CacheLevel]) -> Option<&CacheLevel> {
    levels
        .iter()
        .filter(|c| c.cache_type == CacheType::Unified)
        .max_by_key(|c| c.level)
}

lazy_static! {
    static ref HOST_LLC: Option<CacheGeometry> = {
        let levels = get_cache_info();
        let llc = last_level(&levels).and_then(CacheLevel::geometry);
        debug!("detected LLC geometry: {:?}", llc);
        llc
    };
}

/// Geometry of the host's last level cache, if CPUID exposes one we can use.
pub fn host_llc_geometry() -> Option<CacheGeometry> {
    *HOST_LLC
}

#[cfg(test)]
mod tests {
    use super::*;

    // L3 of an i7-9750H: 12MB, 16 ways, 64B lines, 12288 sets, complex indexing.
    const L3_REGS: CpuidRegisters = CpuidRegisters {
        eax: 0x3c06_c163,
        ebx: 0x03c0_003f,
        ecx: 12287,
        edx: 0x6,
    };

    const L1D_REGS: CpuidRegisters = CpuidRegisters {
        eax: 0x1c00_4121,
        ebx: 0x01c0_003f,
        ecx: 63,
        edx: 0,
    };

    #[test]
    fn decode_llc() {
        let l3 = CacheLevel::from_cpuid(&L3_REGS).unwrap();
        assert_eq!(l3.cache_type, CacheType::Unified);
        assert_eq!(l3.level, 3);
        assert_eq!(l3.line_size, 64);
        assert_eq!(l3.associativity, 16);
        assert_eq!(l3.sets, 12288);
        assert!(l3.inclusive);
        assert!(l3.complex_cache_indexing);
        assert_eq!(l3.size_bytes(), 12 * 1024 * 1024);
        assert_eq!(l3.geometry(), Some(CacheGeometry::default()));
    }

    #[test]
    fn null_terminates() {
        let regs = CpuidRegisters {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
        };
        assert_eq!(CacheLevel::from_cpuid(&regs), None);
    }

    #[test]
    fn last_level_picks_highest_unified() {
        let l1 = CacheLevel::from_cpuid(&L1D_REGS).unwrap();
        let l3 = CacheLevel::from_cpuid(&L3_REGS).unwrap();
        assert_eq!(l1.cache_type, CacheType::Data);
        assert_eq!(l1.level, 1);
        let levels = vec![l1, l3];
        assert_eq!(last_level(&levels), Some(&l3));
        assert_eq!(last_level(&levels[..1]), None);
    }
}
