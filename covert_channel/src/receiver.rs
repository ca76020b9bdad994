use crate::{decode_bit, ChannelConfig, ConfigError, Event, EventSink};
use cache_side_channel::{
    spin_until_boundary, Bits, CancellationToken, Clock, MessageFramer, SweepSource,
};
use log::{debug, trace};
use std::hint::spin_loop;

/// Decoder role: one bit per slot, searched for a frame every chunk.
///
/// The receiver waits for the boundary and then measures, while the sender
/// measures and then waits. A frame that straddles two chunks is not found;
/// retransmission puts a whole frame in a later chunk.
pub struct Receiver<S: SweepSource, C: Clock> {
    source: S,
    clock: C,
    config: ChannelConfig,
    framer: MessageFramer,
}

impl<S: SweepSource, C: Clock> Receiver<S, C> {
    /// Fails unless `config` and `prefix` together can carry a frame.
    pub fn new(
        source: S,
        clock: C,
        config: ChannelConfig,
        prefix: Bits,
    ) -> Result<Self, ConfigError> {
        config.validate(prefix.len())?;
        let framer = MessageFramer::new(prefix, config.payload_length);
        Ok(Self {
            source,
            clock,
            config,
            framer,
        })
    }

    pub fn framer(&self) -> &MessageFramer {
        &self.framer
    }

    /// Wait for the next slot, sample it and threshold the sweep count.
    pub fn receive_bit(&mut self) -> bool {
        spin_until_boundary(&self.clock, self.config.bit_period_ms);
        let sweeps = self.source.sample();
        trace!("{} sweeps", sweeps);
        decode_bit(sweeps, self.config.threshold)
    }

    /// `chunk_length` fresh bits, or `None` once cancelled.
    pub fn receive_chunk(&mut self, cancel: &CancellationToken) -> Option<Bits> {
        let mut chunk = Bits::with_capacity(self.config.chunk_length);
        for _ in 0..self.config.chunk_length {
            if cancel.is_cancelled() {
                return None;
            }
            chunk.push(self.receive_bit());
        }
        debug!("collected a {} bit chunk", chunk.len());
        Some(chunk)
    }

    /// Collect chunks until one holds a frame, backing off after each miss.
    /// Returns the payload, or `None` once cancelled.
    pub fn run<E: EventSink>(&mut self, cancel: &CancellationToken, sink: &mut E) -> Option<Bits> {
        loop {
            let chunk = self.receive_chunk(cancel)?;
            match self.framer.search(&chunk) {
                Some(payload) => {
                    let payload = payload.to_bitvec();
                    sink.report(Event::PayloadFound(payload.clone()));
                    return Some(payload);
                }
                None => {
                    sink.report(Event::ChunkUnmatched(chunk));
                    self.back_off(cancel)?;
                }
            }
        }
    }

    fn back_off(&self, cancel: &CancellationToken) -> Option<()> {
        let deadline = self.clock.now_ms() + self.config.backoff_ms;
        while self.clock.now_ms() < deadline {
            if cancel.is_cancelled() {
                return None;
            }
            spin_loop();
        }
        Some(())
    }
}
