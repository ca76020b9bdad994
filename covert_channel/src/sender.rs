use crate::{ChannelConfig, ConfigError, Event, EventSink};
use cache_side_channel::{
    spin_until_boundary, BitStr, CancellationToken, Clock, Contender, MessageFramer,
};
use log::debug;
use prime_probe::count_sweeps;

/// Encoder role. Broadcasts `prefix || payload` slot by slot, with no
/// feedback from the receiver.
pub struct Sender<P: Contender, C: Clock> {
    contender: P,
    clock: C,
    config: ChannelConfig,
}

impl<P: Contender, C: Clock> Sender<P, C> {
    /// Fails if the slot timing in `config` is unusable.
    pub fn new(contender: P, clock: C, config: ChannelConfig) -> Result<Self, ConfigError> {
        config.validate_timing()?;
        Ok(Self {
            contender,
            clock,
            config,
        })
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn into_inner(self) -> P {
        self.contender
    }

    /// Occupy one epoch: probe back to back for a 1, poll the clock only for
    /// a 0. Returns the number of loop iterations, for diagnostics.
    pub fn send_bit(&mut self, bit: bool) -> u64 {
        let Self {
            contender,
            clock,
            config,
        } = self;
        if bit {
            count_sweeps(
                &*clock,
                config.measurement_count,
                config.sampling_period_ms,
                || contender.contend(),
            )
        } else {
            count_sweeps(
                &*clock,
                config.measurement_count,
                config.sampling_period_ms,
                || {},
            )
        }
    }

    /// Send every bit of `message` once, each followed by a wait for the next
    /// slot boundary. Returns false if cancelled before the end.
    pub fn transmit<S: EventSink>(
        &mut self,
        message: &BitStr,
        cancel: &CancellationToken,
        sink: &mut S,
    ) -> bool {
        for bit in message.iter().by_vals() {
            if cancel.is_cancelled() {
                return false;
            }
            sink.report(Event::BitSent(bit));
            self.send_bit(bit);
            spin_until_boundary(&self.clock, self.config.bit_period_ms);
        }
        true
    }

    /// Repeat `prefix || payload` until cancelled, or for `passes` repetitions.
    /// Returns the number of complete repetitions.
    pub fn run<S: EventSink>(
        &mut self,
        framer: &MessageFramer,
        payload: &BitStr,
        cancel: &CancellationToken,
        sink: &mut S,
        passes: Option<usize>,
    ) -> usize {
        let message = framer.message(payload);
        sink.report(Event::MessageComposed(message.clone()));
        debug!("transmitting {} bit message", message.len());

        spin_until_boundary(&self.clock, self.config.bit_period_ms);
        let mut completed = 0;
        while passes.map_or(true, |passes| completed < passes) {
            if !self.transmit(&message, cancel, sink) {
                break;
            }
            completed += 1;
            debug!("message repetition {} complete", completed);
        }
        completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_side_channel::{parse_bits, SteppingClock};
    use std::rc::Rc;

    #[derive(Default)]
    struct CountingContender(u64);

    impl Contender for CountingContender {
        fn contend(&mut self) {
            self.0 += 1;
        }
    }

    #[test]
    fn one_contends_zero_idles() {
        let clock = SteppingClock::new(0, 1);
        let mut sender = Sender::new(CountingContender::default(), &clock, ChannelConfig::default()).unwrap();
        assert_eq!(sender.send_bit(false), 901);
        assert_eq!(sender.contender.0, 0);
        assert_eq!(sender.send_bit(true), 901);
        assert_eq!(sender.contender.0, 901);
    }

    #[test]
    fn bits_stay_in_their_slots() {
        let clock = Rc::new(SteppingClock::new(5_000, 1));
        let mut sender = Sender::new(CountingContender::default(), clock.clone(), ChannelConfig::default()).unwrap();
        let message = parse_bits("101").unwrap();
        let mut events = Vec::new();
        assert!(sender.transmit(&message, &CancellationToken::new(), &mut events));
        // Three epochs, each followed by the wait for the next boundary.
        assert_eq!(clock.peek(), 8_001);
        assert_eq!(
            events,
            vec![Event::BitSent(true), Event::BitSent(false), Event::BitSent(true)]
        );
    }

    #[test]
    fn bounded_passes() {
        let clock = SteppingClock::new(0, 1);
        let mut sender = Sender::new(CountingContender::default(), &clock, ChannelConfig::default()).unwrap();
        let framer = MessageFramer::new(parse_bits("11").unwrap(), 2);
        let mut events = Vec::new();
        let done = sender.run(
            &framer,
            &parse_bits("01").unwrap(),
            &CancellationToken::new(),
            &mut events,
            Some(2),
        );
        assert_eq!(done, 2);
        assert_eq!(events[0], Event::MessageComposed(parse_bits("1101").unwrap()));
        assert_eq!(events.len(), 1 + 8);
        assert_eq!(sender.into_inner().0, 3 * 2 * 901);
    }

    #[test]
    fn unusable_timing_is_rejected() {
        let clock = SteppingClock::new(0, 1);
        let config = ChannelConfig {
            bit_period_ms: 0,
            ..ChannelConfig::default()
        };
        assert_eq!(
            Sender::new(CountingContender::default(), &clock, config).err(),
            Some(ConfigError::Zero("bit_period_ms"))
        );
        let config = ChannelConfig {
            sampling_period_ms: 200,
            ..ChannelConfig::default()
        };
        assert_eq!(
            Sender::new(CountingContender::default(), &clock, config).err(),
            Some(ConfigError::EpochTooLong {
                epoch_ms: 1800,
                bit_period_ms: 1000
            })
        );
        // Framing lengths are the receiver's concern.
        let config = ChannelConfig {
            chunk_length: 0,
            ..ChannelConfig::default()
        };
        assert!(Sender::new(CountingContender::default(), &clock, config).is_ok());
    }

    #[test]
    fn cancelled_sender_stops() {
        let clock = SteppingClock::new(0, 1);
        let mut sender = Sender::new(CountingContender::default(), &clock, ChannelConfig::default()).unwrap();
        let framer = MessageFramer::new(parse_bits("11").unwrap(), 2);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut events = Vec::new();
        let done = sender.run(&framer, &parse_bits("01").unwrap(), &cancel, &mut events, None);
        assert_eq!(done, 0);
        assert_eq!(events.len(), 1);
    }
}
