//! Random version 4 identifiers used as channel payloads.

use cache_side_channel::bits::{bits_to_bytes, bytes_to_bits};
use cache_side_channel::{BitStr, Bits};
use itertools::Itertools;
use rand::Rng;
use std::fmt;
use thiserror::Error;

pub const IDENTIFIER_BITS: usize = 128;

/// Candidates drawn before giving up on a prefix that every identifier contains.
const MAX_ATTEMPTS: usize = 4096;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("an identifier is 128 bits, got {0}")]
    Length(usize),
    #[error("no identifier keeps the prefix to frame boundaries after {0} attempts")]
    PrefixUnavoidable(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Identifier([u8; 16]);

/// Whether `prefix || bits || prefix` holds `prefix` only at its two ends.
///
/// The repeated message is cyclic, so this also rules out a prefix that
/// straddles a seam between payload and prefix, which a bordered prefix
/// such as `11000011` can do without ever occurring inside the payload.
fn frames_cleanly(bits: &BitStr, prefix: &BitStr) -> bool {
    let mut framed = Bits::with_capacity(bits.len() + 2 * prefix.len());
    framed.extend_from_bitslice(prefix);
    framed.extend_from_bitslice(bits);
    framed.extend_from_bitslice(prefix);
    framed.windows(prefix.len()).filter(|w| *w == prefix).count() == 2
}

impl Identifier {
    /// Random identifier such that, in the repeated `prefix || payload`
    /// stream, `prefix` is only found at frame boundaries.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R, prefix: &BitStr) -> Result<Self, IdentifierError> {
        for _ in 0..MAX_ATTEMPTS {
            let candidate = Self::random(rng);
            if frames_cleanly(&candidate.to_bits(), prefix) {
                return Ok(candidate);
            }
        }
        Err(IdentifierError::PrefixUnavoidable(MAX_ATTEMPTS))
    }

    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; 16];
        rng.fill(&mut bytes[..]);
        bytes[6] = (bytes[6] & 0x0f) | 0x40;
        bytes[8] = (bytes[8] & 0x3f) | 0x80;
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_bits(&self) -> Bits {
        bytes_to_bits(&self.0)
    }

    pub fn from_bits(bits: &BitStr) -> Result<Self, IdentifierError> {
        if bits.len() != IDENTIFIER_BITS {
            return Err(IdentifierError::Length(bits.len()));
        }
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&bits_to_bytes(bits));
        Ok(Self(bytes))
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let groups = [&self.0[0..4], &self.0[4..6], &self.0[6..8], &self.0[8..10], &self.0[10..16]];
        let text = groups
            .iter()
            .map(|group| group.iter().map(|b| format!("{:02x}", b)).join(""))
            .join("-");
        f.write_str(&text)
    }
}
