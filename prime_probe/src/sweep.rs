//! Sweep counting: the channel observable.

use cache_side_channel::{Clock, Contender, SweepSource};

/// Run `pass` back to back over `windows` consecutive windows and count the
/// passes.
///
/// Each pass is preceded by a clock reading. The first window holds a single
/// pass. Every later window keeps going while its pre-pass reading is below
/// `period_ms` after the last reading of the previous window, the pass that
/// crosses the limit included. An epoch therefore lasts about
/// `(windows - 1) * period_ms`.
pub fn count_sweeps<C: Clock + ?Sized>(
    clock: &C,
    windows: usize,
    period_ms: u64,
    mut pass: impl FnMut(),
) -> u64 {
    let mut sweeps = 0;
    let mut last_reading: Option<u64> = None;
    for _ in 0..windows {
        let window_end = last_reading.map(|t| t + period_ms);
        loop {
            let now = clock.now_ms();
            last_reading = Some(now);
            sweeps += 1;
            pass();
            match window_end {
                Some(end) if now < end => continue,
                _ => break,
            }
        }
    }
    sweeps
}

/// Turns a contender into a sweep source: one `sample` is one epoch of
/// `measurement_count` windows.
pub struct SweepSampler<P: Contender, C: Clock> {
    contender: P,
    clock: C,
    measurement_count: usize,
    sampling_period_ms: u64,
}

impl<P: Contender, C: Clock> SweepSampler<P, C> {
    pub fn new(contender: P, clock: C, measurement_count: usize, sampling_period_ms: u64) -> Self {
        Self {
            contender,
            clock,
            measurement_count,
            sampling_period_ms,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn into_inner(self) -> P {
        self.contender
    }
}

impl<P: Contender, C: Clock> SweepSource for SweepSampler<P, C> {
    fn sample(&mut self) -> u64 {
        let Self {
            contender,
            clock,
            measurement_count,
            sampling_period_ms,
        } = self;
        count_sweeps(&*clock, *measurement_count, *sampling_period_ms, || {
            contender.contend()
        })
    }
}
