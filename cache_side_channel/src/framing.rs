//! Wire format: `PREFIX || PAYLOAD || PREFIX`, payload of fixed length.
//!
//! Prefix and payload length are agreed out of band. A sender that keeps
//! repeating `PREFIX || PAYLOAD` produces the closed frame on the wire by
//! itself.

use crate::bits::{BitStr, Bits};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFramer {
    prefix: Bits,
    payload_len: usize,
}

impl MessageFramer {
    pub fn new(prefix: Bits, payload_len: usize) -> Self {
        Self {
            prefix,
            payload_len,
        }
    }

    pub fn prefix(&self) -> &BitStr {
        &self.prefix
    }

    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Length of a closed frame.
    pub fn frame_len(&self) -> usize {
        2 * self.prefix.len() + self.payload_len
    }

    /// What the sender repeats: `prefix || payload`.
    pub fn message(&self, payload: &BitStr) -> Bits {
        let mut message = self.prefix.clone();
        message.extend_from_bitslice(payload);
        message
    }

    /// `prefix || payload || prefix`.
    pub fn frame(&self, payload: &BitStr) -> Bits {
        let mut frame = self.message(payload);
        frame.extend_from_bitslice(&self.prefix);
        frame
    }

    /// Leftmost closed frame in `bits`, returning its payload.
    pub fn search<'a>(&self, bits: &'a BitStr) -> Option<&'a BitStr> {
        search(bits, &self.prefix, self.payload_len)
    }
}

/// Leftmost match of `prefix [01]{payload_len} prefix` in `bits`.
pub fn search<'a>(bits: &'a BitStr, prefix: &BitStr, payload_len: usize) -> Option<&'a BitStr> {
    let p = prefix.len();
    let frame_len = 2 * p + payload_len;
    if bits.len() < frame_len {
        return None;
    }
    (0..=bits.len() - frame_len)
        .find(|&start| {
            bits[start..start + p] == *prefix
                && bits[start + p + payload_len..start + frame_len] == *prefix
        })
        .map(|start| &bits[start + p..start + p + payload_len])
}
