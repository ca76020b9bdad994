//! Bit slots over a sweep counting Prime+Probe channel.
//!
//! Time is cut into slots of `bit_period_ms`, aligned on wall clock multiples
//! of the period. The sender contends for the LLC during a slot to send a 1
//! and idles to send a 0; the receiver samples its own sweep rate in the same
//! slot and thresholds it. Framing is `PREFIX || PAYLOAD || PREFIX`, found by
//! the receiver in fixed size chunks.

use cache_side_channel::{to_bit_string, BitStr, Bits};
use log::{debug, info};
use std::fmt;
use std::sync::mpsc;
use thiserror::Error;

pub mod identifier;
pub mod receiver;
pub mod sender;

pub use identifier::{Identifier, IdentifierError};
pub use receiver::Receiver;
pub use sender::Sender;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must not be zero")]
    Zero(&'static str),
    #[error("the framing prefix must not be empty")]
    EmptyPrefix,
    #[error("a measurement epoch of {epoch_ms} ms does not fit in a {bit_period_ms} ms bit slot")]
    EpochTooLong { epoch_ms: u64, bit_period_ms: u64 },
    #[error("chunks of {chunk_length} bits cannot hold a {needed} bit frame")]
    ChunkTooShort { chunk_length: usize, needed: usize },
}

/// Constants both ends must agree on. Nothing is negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Windows per measurement epoch.
    pub measurement_count: usize,
    pub sampling_period_ms: u64,
    pub bit_period_ms: u64,
    /// Bits collected before each frame search.
    pub chunk_length: usize,
    pub payload_length: usize,
    /// Sweep counts below this decode as 1.
    pub threshold: u64,
    /// Wait after an unmatched chunk.
    pub backoff_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            measurement_count: 10,
            sampling_period_ms: 100,
            bit_period_ms: 1000,
            chunk_length: 300,
            payload_length: 128,
            threshold: 121,
            backoff_ms: 5000,
        }
    }
}

impl ChannelConfig {
    /// Approximate length of one measurement epoch.
    pub fn epoch_ms(&self) -> u64 {
        (self.measurement_count.saturating_sub(1) as u64).saturating_mul(self.sampling_period_ms)
    }

    /// The slot timing alone, which is all a sender depends on.
    pub fn validate_timing(&self) -> Result<(), ConfigError> {
        if self.measurement_count == 0 {
            return Err(ConfigError::Zero("measurement_count"));
        }
        if self.sampling_period_ms == 0 {
            return Err(ConfigError::Zero("sampling_period_ms"));
        }
        if self.bit_period_ms == 0 {
            return Err(ConfigError::Zero("bit_period_ms"));
        }
        if self.epoch_ms() >= self.bit_period_ms {
            return Err(ConfigError::EpochTooLong {
                epoch_ms: self.epoch_ms(),
                bit_period_ms: self.bit_period_ms,
            });
        }
        Ok(())
    }

    pub fn validate(&self, prefix_len: usize) -> Result<(), ConfigError> {
        self.validate_timing()?;
        if self.chunk_length == 0 {
            return Err(ConfigError::Zero("chunk_length"));
        }
        if self.payload_length == 0 {
            return Err(ConfigError::Zero("payload_length"));
        }
        if prefix_len == 0 {
            return Err(ConfigError::EmptyPrefix);
        }
        let needed = self.payload_length + 2 * prefix_len;
        if self.chunk_length < needed {
            return Err(ConfigError::ChunkTooShort {
                chunk_length: self.chunk_length,
                needed,
            });
        }
        Ok(())
    }
}

/// Fewer sweeps means more contention, which encodes a 1.
pub fn decode_bit(sweeps: u64, threshold: u64) -> bool {
    sweeps < threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

/// Status reported by a running role to whoever started it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    EngineReady(Role),
    MessageComposed(Bits),
    BitSent(bool),
    PayloadFound(Bits),
    ChunkUnmatched(Bits),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::EngineReady(Role::Sender) => write!(f, "Created sender Prime+Probe object"),
            Event::EngineReady(Role::Receiver) => write!(f, "Created listener Prime+Probe object"),
            Event::MessageComposed(bits) | Event::ChunkUnmatched(bits) => {
                write!(f, "{}", to_bit_string(bits))
            }
            Event::BitSent(bit) => write!(f, "{}", *bit as u8),
            Event::PayloadFound(bits) => write!(f, "UUID read: {}", to_bit_string(bits)),
        }
    }
}

impl Event {
    pub fn payload(&self) -> Option<&BitStr> {
        match self {
            Event::PayloadFound(bits) => Some(bits.as_bitslice()),
            _ => None,
        }
    }
}

pub trait EventSink {
    fn report(&mut self, event: Event);
}

impl<S: EventSink + ?Sized> EventSink for &mut S {
    fn report(&mut self, event: Event) {
        (**self).report(event)
    }
}

/// Reports through the `log` facade. Per bit echoes go to `debug`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl EventSink for LogSink {
    fn report(&mut self, event: Event) {
        match event {
            Event::BitSent(_) => debug!("{}", event),
            _ => info!("{}", event),
        }
    }
}

impl EventSink for Vec<Event> {
    fn report(&mut self, event: Event) {
        self.push(event);
    }
}

impl EventSink for mpsc::Sender<Event> {
    fn report(&mut self, event: Event) {
        if self.send(event).is_err() {
            debug!("event receiver hung up");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cache_side_channel::parse_bits;

    #[test]
    fn default_config_is_valid() {
        let config = ChannelConfig::default();
        assert_eq!(config.epoch_ms(), 900);
        assert_eq!(config.validate(8), Ok(()));
    }

    #[test]
    fn config_rejections() {
        let mut config = ChannelConfig::default();
        config.measurement_count = 0;
        assert_eq!(config.validate(8), Err(ConfigError::Zero("measurement_count")));

        let mut config = ChannelConfig::default();
        config.sampling_period_ms = 120;
        assert_eq!(
            config.validate(8),
            Err(ConfigError::EpochTooLong {
                epoch_ms: 1080,
                bit_period_ms: 1000
            })
        );

        let mut config = ChannelConfig::default();
        config.bit_period_ms = 0;
        assert_eq!(config.validate_timing(), Err(ConfigError::Zero("bit_period_ms")));

        let mut config = ChannelConfig::default();
        config.payload_length = 0;
        assert_eq!(config.validate_timing(), Ok(()));
        assert_eq!(config.validate(8), Err(ConfigError::Zero("payload_length")));

        let config = ChannelConfig::default();
        assert_eq!(
            config.validate(90),
            Err(ConfigError::ChunkTooShort {
                chunk_length: 300,
                needed: 308
            })
        );
        assert_eq!(config.validate(86), Ok(()));
        assert_eq!(config.validate(0), Err(ConfigError::EmptyPrefix));
    }

    #[test]
    fn decode_is_a_step_function() {
        let threshold = 121;
        for sweeps in 0..threshold {
            assert!(decode_bit(sweeps, threshold));
        }
        for sweeps in threshold..threshold + 1000 {
            assert!(!decode_bit(sweeps, threshold));
        }
        assert!(!decode_bit(threshold, threshold));
        assert!(!decode_bit(u64::MAX, threshold));
    }

    #[test]
    fn event_display() {
        let bits = parse_bits("0110").unwrap();
        assert_eq!(
            Event::PayloadFound(bits.clone()).to_string(),
            "UUID read: 0110"
        );
        assert_eq!(Event::ChunkUnmatched(bits.clone()).to_string(), "0110");
        assert_eq!(Event::BitSent(true).to_string(), "1");
        assert_eq!(
            Event::EngineReady(Role::Receiver).to_string(),
            "Created listener Prime+Probe object"
        );
        assert_eq!(Event::PayloadFound(bits.clone()).payload(), Some(bits.as_bitslice()));
        assert_eq!(Event::BitSent(false).payload(), None);
    }

    #[test]
    fn channel_sink_forwards() {
        let (tx, rx) = mpsc::channel();
        let mut sink = tx;
        sink.report(Event::BitSent(false));
        assert_eq!(rx.recv(), Ok(Event::BitSent(false)));
        drop(rx);
        // A gone receiver is not an error for the role.
        sink.report(Event::BitSent(true));
    }
}
