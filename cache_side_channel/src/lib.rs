#![deny(unsafe_op_in_unsafe_fn)]

//! Seams shared by both ends of a contention based covert channel.
//!
//! The physical side (what gets timed, how contention is produced) and the
//! protocol side (bit slots, framing) only meet through the traits below, so
//! either half can be replaced by a simulation in tests.

use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::Pid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod bits;
pub mod clock;
pub mod framing;

pub use bits::{parse_bits, to_bit_string, BitParseError, BitStr, Bits};
pub use clock::{spin_until, spin_until_boundary, Clock, SteppingClock, SystemClock};
pub use framing::MessageFramer;

/// Produces the channel's raw observation: how many full probe sweeps fit in
/// one measurement epoch. More contention, fewer sweeps.
pub trait SweepSource {
    fn sample(&mut self) -> u64;
}

/// Something that generates last level cache contention, one pass at a time.
pub trait Contender {
    fn contend(&mut self);
}

impl<T: SweepSource + ?Sized> SweepSource for &mut T {
    fn sample(&mut self) -> u64 {
        (**self).sample()
    }
}

impl<T: Contender + ?Sized> Contender for &mut T {
    fn contend(&mut self) {
        (**self).contend()
    }
}

/// Cooperative stop flag. Roles poll it between bit slots only, never inside
/// a timed window.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub fn restore_affinity(cpu_set: &CpuSet) -> Result<(), nix::Error> {
    sched_setaffinity(Pid::from_raw(0), cpu_set)
}

#[must_use = "This result must be used to restore affinity"]
pub fn set_affinity(cpu_set: &CpuSet) -> Result<CpuSet, nix::Error> {
    let old = sched_getaffinity(Pid::from_raw(0))?;
    sched_setaffinity(Pid::from_raw(0), cpu_set)?;
    Ok(old)
}

/// Pin the calling thread to `core`, returning the previous affinity.
#[must_use = "This result must be used to restore affinity"]
pub fn pin_to_core(core: usize) -> Result<CpuSet, nix::Error> {
    let mut cpu_set = CpuSet::new();
    cpu_set.set(core)?;
    set_affinity(&cpu_set)
}
