use bitvec::prelude::*;
use thiserror::Error;

/// Owned bit string, first transmitted bit at index 0.
pub type Bits = BitVec;
pub type BitStr = BitSlice;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitParseError {
    #[error("invalid character {character:?} at position {position}, expected '0' or '1'")]
    InvalidCharacter { character: char, position: usize },
}

/// Parse a `"0101..."` string.
pub fn parse_bits(s: &str) -> Result<Bits, BitParseError> {
    let mut bits = Bits::with_capacity(s.len());
    for (position, character) in s.chars().enumerate() {
        match character {
            '0' => bits.push(false),
            '1' => bits.push(true),
            _ => {
                return Err(BitParseError::InvalidCharacter {
                    character,
                    position,
                })
            }
        }
    }
    Ok(bits)
}

pub fn to_bit_string(bits: &BitStr) -> String {
    bits.iter()
        .by_vals()
        .map(|b| if b { '1' } else { '0' })
        .collect()
}

/// Bits of `bytes`, most significant bit of each byte first.
pub fn bytes_to_bits(bytes: &[u8]) -> Bits {
    let mut bits = Bits::with_capacity(bytes.len() * 8);
    for byte in bytes {
        for i in (0..8).rev() {
            bits.push((byte >> i) & 1 != 0);
        }
    }
    bits
}

/// Inverse of `bytes_to_bits`; a trailing partial byte is zero padded.
pub fn bits_to_bytes(bits: &BitStr) -> Vec<u8> {
    bits.chunks(8)
        .map(|chunk| {
            chunk
                .iter()
                .by_vals()
                .enumerate()
                .fold(0u8, |acc, (i, b)| acc | ((b as u8) << (7 - i)))
        })
        .collect()
}

/// Whether `needle` occurs anywhere in `haystack`.
pub fn contains(haystack: &BitStr, needle: &BitStr) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_print() {
        let bits = parse_bits("11001010").unwrap();
        assert_eq!(bits.len(), 8);
        assert!(bits[0]);
        assert!(!bits[2]);
        assert_eq!(to_bit_string(&bits), "11001010");
        assert_eq!(parse_bits("").unwrap().len(), 0);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(
            parse_bits("10a1"),
            Err(BitParseError::InvalidCharacter {
                character: 'a',
                position: 2
            })
        );
    }

    #[test]
    fn byte_order_is_msb_first() {
        let bits = bytes_to_bits(&[0xca, 0x01]);
        assert_eq!(to_bit_string(&bits), "1100101000000001");
        assert_eq!(bits_to_bytes(&bits), vec![0xca, 0x01]);
        assert_eq!(bits_to_bytes(&parse_bits("101").unwrap()), vec![0xa0]);
    }

    #[test]
    fn substring_search() {
        let hay = parse_bits("0001101000").unwrap();
        assert!(contains(&hay, &parse_bits("1101").unwrap()));
        assert!(!contains(&hay, &parse_bits("1111").unwrap()));
        assert!(!contains(&parse_bits("01").unwrap(), &parse_bits("010").unwrap()));
    }
}
