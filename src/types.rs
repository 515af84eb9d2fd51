use std::fmt;
use std::ops::{BitAnd, BitOr, BitXor, Not};

use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ParseError};

/// One-bit full adder.
/// Returns: (sum, carry_out)
pub fn full_adder(a: bool, b: bool, carry_in: bool) -> (bool, bool) {
    let partial = a ^ b;
    let sum = partial ^ carry_in;
    let carry_out = (a && b) || (partial && carry_in);
    (sum, carry_out)
}

/// 4-bit machine word stored as four booleans, index 0 = most significant bit.
///
/// Arithmetic is done bit by bit through [`full_adder`]; native integers only
/// show up when parsing, printing, indexing memory and in the multiplier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Nibble([bool; 4]);

impl Nibble {
    pub const WIDTH: usize = 4;
    pub const ZERO: Nibble = Nibble([false, false, false, false]);
    pub const ONE: Nibble = Nibble([false, false, false, true]);
    pub const MAX: Nibble = Nibble([true, true, true, true]);

    pub const fn from_bits(bits: [bool; 4]) -> Self {
        Nibble(bits)
    }

    pub const fn bits(&self) -> [bool; 4] {
        self.0
    }

    /// Bit at `index`, 0 being the MSB. Panics for index > 3.
    pub fn bit(&self, index: usize) -> bool {
        self.0[index]
    }

    /// Builds a nibble from an integer, rejecting anything above 15.
    pub fn from_u8(value: u8) -> Option<Self> {
        (value <= 15).then(|| Self::from_low_bits(value))
    }

    /// Keeps only the low four bits of `value`. Used at I/O boundaries
    /// (key bytes, multiplier product) where truncation is the contract.
    pub fn from_low_bits(value: u8) -> Self {
        Nibble([
            value & 0b1000 != 0,
            value & 0b0100 != 0,
            value & 0b0010 != 0,
            value & 0b0001 != 0,
        ])
    }

    /// Converts a bit slice coming from operand preparation.
    pub fn try_from_slice(bits: &[bool]) -> Result<Self, ExecutionError> {
        match bits {
            [b0, b1, b2, b3] => Ok(Nibble([*b0, *b1, *b2, *b3])),
            _ => Err(ExecutionError::InvalidOperandLength(bits.len())),
        }
    }

    /// Parses exactly four `0`/`1` characters, MSB first.
    pub fn parse_binary(text: &str) -> Option<Self> {
        let bytes = text.as_bytes();
        if bytes.len() != Self::WIDTH {
            return None;
        }
        let mut bits = [false; 4];
        for (bit, byte) in bits.iter_mut().zip(bytes) {
            *bit = match byte {
                b'0' => false,
                b'1' => true,
                _ => return None,
            };
        }
        Some(Nibble(bits))
    }

    pub fn value(&self) -> u8 {
        self.0.iter().fold(0, |acc, &bit| (acc << 1) | u8::from(bit))
    }

    /// Memory/register index for this word.
    pub fn index(&self) -> usize {
        usize::from(self.value())
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|bit| !bit)
    }

    /// Ripple-carry addition from the LSB (index 3) up to the MSB.
    /// Returns: (sum, carry out of the MSB)
    pub fn ripple_add(self, other: Nibble, carry_in: bool) -> (Nibble, bool) {
        let mut sum = [false; 4];
        let mut carry = carry_in;
        for i in (0..Self::WIDTH).rev() {
            let (bit, carry_out) = full_adder(self.0[i], other.0[i], carry);
            sum[i] = bit;
            carry = carry_out;
        }
        (Nibble(sum), carry)
    }

    /// Adds one through the adder chain, wrapping 15 -> 0.
    /// Returns: (next value, true when the increment wrapped)
    pub fn increment(self) -> (Nibble, bool) {
        self.ripple_add(Nibble::ONE, false)
    }
}

impl fmt::Display for Nibble {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for bit in self.0 {
            f.write_str(if bit { "1" } else { "0" })?;
        }
        Ok(())
    }
}

impl TryFrom<u8> for Nibble {
    type Error = ParseError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Nibble::from_u8(value).ok_or_else(|| ParseError::OutOfRange(value.to_string()))
    }
}

impl From<Nibble> for u8 {
    fn from(value: Nibble) -> Self {
        value.value()
    }
}

impl Not for Nibble {
    type Output = Nibble;

    fn not(self) -> Nibble {
        Nibble(self.0.map(|bit| !bit))
    }
}

macro_rules! bitwise_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait for Nibble {
            type Output = Nibble;

            fn $method(self, rhs: Nibble) -> Nibble {
                let mut out = [false; 4];
                for (i, bit) in out.iter_mut().enumerate() {
                    *bit = self.0[i] $op rhs.0[i];
                }
                Nibble(out)
            }
        }
    };
}

bitwise_op!(BitAnd, bitand, &);
bitwise_op!(BitOr, bitor, |);
bitwise_op!(BitXor, bitxor, ^);

#[cfg(test)]
mod tests {
    use super::*;

    fn n(value: u8) -> Nibble {
        Nibble::from_u8(value).unwrap()
    }

    #[test]
    fn test_full_adder_truth_table() {
        assert_eq!(full_adder(false, false, false), (false, false));
        assert_eq!(full_adder(true, false, false), (true, false));
        assert_eq!(full_adder(true, true, false), (false, true));
        assert_eq!(full_adder(true, false, true), (false, true));
        assert_eq!(full_adder(true, true, true), (true, true));
    }

    #[test]
    fn test_index_zero_is_msb() {
        let eight = n(8);
        assert!(eight.bit(0));
        assert!(!eight.bit(3));
        assert_eq!(eight.to_string(), "1000");
    }

    #[test]
    fn test_ripple_add_carries_out_of_msb() {
        assert_eq!(n(15).ripple_add(n(1), false), (Nibble::ZERO, true));
        assert_eq!(n(5).ripple_add(n(6), false), (n(11), false));
        assert_eq!(n(5).ripple_add(n(6), true), (n(12), false));
    }

    #[test]
    fn test_increment_wraps() {
        assert_eq!(n(7).increment(), (n(8), false));
        assert_eq!(n(15).increment(), (Nibble::ZERO, true));
    }

    #[test]
    fn test_parse_binary_requires_four_digits() {
        assert_eq!(Nibble::parse_binary("1010"), Some(n(10)));
        assert_eq!(Nibble::parse_binary("101"), None);
        assert_eq!(Nibble::parse_binary("10a0"), None);
    }

    #[test]
    fn test_from_u8_range() {
        assert!(Nibble::from_u8(16).is_none());
        assert_eq!(Nibble::try_from(16u8), Err(ParseError::OutOfRange("16".into())));
        assert_eq!(Nibble::from_low_bits(0x4B), n(11));
    }

    #[test]
    fn test_slice_length_is_checked() {
        assert_eq!(Nibble::try_from_slice(&[true, false, true, false]), Ok(n(10)));
        assert_eq!(
            Nibble::try_from_slice(&[true, false]),
            Err(ExecutionError::InvalidOperandLength(2))
        );
    }

    #[test]
    fn test_bitwise_ops() {
        assert_eq!(n(0b1100) & n(0b1010), n(0b1000));
        assert_eq!(n(0b1100) | n(0b1010), n(0b1110));
        assert_eq!(n(0b1100) ^ n(0b1010), n(0b0110));
        assert_eq!(!n(0b1100), n(0b0011));
    }

    #[test]
    fn test_serializes_as_bool_array() {
        let json = serde_json::to_string(&n(5)).unwrap();
        assert_eq!(json, "[false,true,false,true]");
        let back: Nibble = serde_json::from_str(&json).unwrap();
        assert_eq!(back, n(5));
    }
}
