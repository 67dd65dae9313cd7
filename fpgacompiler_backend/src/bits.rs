//! Bit layout of the 32-bit bus word and helpers for the special bits.
//!
//! Every sample written to a board rack is a single `u32`:
//!
//! ```text
//! bit 31       NOP       sample is a time-filler; board ignores data
//! bit 30       TRST      time reset (reserved)
//! bit 29       IRQ       raise data-IRQ at this sample
//! bit 28       STOP      wait for restart trigger at this sample
//! bit 23       STRB      strobe toggle (position configurable, 23..=27)
//! bits 22..16  ADDRESS   7-bit device address
//! bits 15..0   DATA      16-bit payload
//! ```
//!
//! This module is the single place where these positions are defined. All helpers are pure
//! functions over `u32`.

use std::fmt;

/// Number of payload bits per word.
pub const DATA_BITS: u32 = 16;
/// Mask of the payload field.
pub const DATA_MASK: u32 = 0x0000_FFFF;
/// Number of address bits.
pub const ADDR_BITS: u32 = 7;
/// Position of the least significant address bit.
pub const ADDR_SHIFT: u32 = 16;
/// Unshifted address mask.
pub const ADDR_MASK: u32 = (1 << ADDR_BITS) - 1;
/// Address mask in place within the word.
pub const ADDR_MASK_SHIFTED: u32 = ADDR_MASK << ADDR_SHIFT;
/// Largest legal device address.
pub const MAX_ADDRESS: u32 = ADDR_MASK;
/// A DDS reserves `1 << ADDR_RNG_BITS` consecutive addresses.
pub const ADDR_RNG_BITS: u32 = 2;

pub const BIT_NOP: u32 = 1 << 31;
pub const BIT_TRST: u32 = 1 << 30;
pub const BIT_IRQ: u32 = 1 << 29;
pub const BIT_STOP: u32 = 1 << 28;
/// Default position of the strobe bit.
pub const BIT_STRB_POS: u32 = 23;
pub const BIT_STRB: u32 = 1 << BIT_STRB_POS;
/// Range of positions the strobe bit may be moved to without overlapping any other field.
pub const STRB_POS_RANGE: std::ops::RangeInclusive<u32> = 23..=27;

/// The "explicit NOP" word: only the NOP bit is set.
pub const NOP_WORD: u32 = BIT_NOP;

/// Special bits which can be attached to a sample by the per-rack special channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SpecialBit {
    Nop,
    Trst,
    Irq,
    Stop,
    Strb,
}

impl SpecialBit {
    /// Word mask of the bit. The strobe mask assumes its default position, see [`strb_mask`].
    pub fn mask(&self) -> u32 {
        match self {
            SpecialBit::Nop => BIT_NOP,
            SpecialBit::Trst => BIT_TRST,
            SpecialBit::Irq => BIT_IRQ,
            SpecialBit::Stop => BIT_STOP,
            SpecialBit::Strb => BIT_STRB,
        }
    }

    /// Word mask of the bit with the strobe placed at `strb_pos`.
    pub fn mask_at(&self, strb_pos: u32) -> u32 {
        match self {
            SpecialBit::Strb => strb_mask(strb_pos),
            other => other.mask(),
        }
    }
}

impl fmt::Display for SpecialBit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                SpecialBit::Nop => "NOP",
                SpecialBit::Trst => "TRST",
                SpecialBit::Irq => "IRQ",
                SpecialBit::Stop => "STOP",
                SpecialBit::Strb => "STRB",
            }
        )
    }
}

/// Mask of all special bits, with the strobe at `strb_pos`.
pub fn special_mask(strb_pos: u32) -> u32 {
    BIT_NOP | BIT_TRST | BIT_IRQ | BIT_STOP | strb_mask(strb_pos)
}

/// Strobe mask for a given position.
pub fn strb_mask(strb_pos: u32) -> u32 {
    1 << strb_pos
}

/// Packs `address` and `data` into a word. Bits outside the fields are discarded.
///
/// # Example
/// ```
/// use fpgacompiler_backend::bits::*;
///
/// let word = encode(0x05, 0x0008);
/// assert_eq!(word, 0x0005_0008);
/// assert_eq!(extract(word), (0x05, 0x0008));
/// ```
pub fn encode(address: u32, data: u32) -> u32 {
    ((address & ADDR_MASK) << ADDR_SHIFT) | (data & DATA_MASK)
}

/// Returns `(address, data)` of a word.
pub fn extract(word: u32) -> (u32, u32) {
    (address_of(word), data_of(word))
}

pub fn address_of(word: u32) -> u32 {
    (word >> ADDR_SHIFT) & ADDR_MASK
}

pub fn data_of(word: u32) -> u32 {
    word & DATA_MASK
}

/// Address and data fields of a word with every special bit stripped.
pub fn payload_of(word: u32) -> u32 {
    word & (ADDR_MASK_SHIFTED | DATA_MASK)
}

pub fn set_bit(word: u32, mask: u32) -> u32 {
    word | mask
}

pub fn clear_bit(word: u32, mask: u32) -> u32 {
    word & !mask
}

pub fn is_set(word: u32, mask: u32) -> bool {
    word & mask != 0
}

pub fn is_nop(word: u32) -> bool {
    is_set(word, BIT_NOP)
}
