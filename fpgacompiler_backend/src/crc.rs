//! CRC-32 (reflected, polynomial `0xEDB88320`) used to fingerprint per-channel data.
//!
//! Byte streams are consumed in order. 32-bit words are consumed most significant byte first,
//! i.e. `crc32_words(&[0x31323334]) == crc32(b"1234")`.

pub const CRC32_POLY: u32 = 0xEDB8_8320;
const CRC32_INIT: u32 = 0xFFFF_FFFF;
const CRC32_XOR_OUT: u32 = 0xFFFF_FFFF;

const fn make_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0;
    while n < 256 {
        let mut c = n as u32;
        let mut k = 0;
        while k < 8 {
            c = if c & 1 != 0 { CRC32_POLY ^ (c >> 1) } else { c >> 1 };
            k += 1;
        }
        table[n] = c;
        n += 1;
    }
    table
}

static CRC32_TABLE: [u32; 256] = make_table();

/// Incremental CRC-32.
#[derive(Clone, Debug)]
pub struct Crc32 {
    state: u32,
}

impl Default for Crc32 {
    fn default() -> Self {
        Self::new()
    }
}

impl Crc32 {
    pub fn new() -> Self {
        Self { state: CRC32_INIT }
    }

    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        for &byte in bytes {
            self.state = CRC32_TABLE[((self.state ^ byte as u32) & 0xFF) as usize] ^ (self.state >> 8);
        }
        self
    }

    pub fn update_word(&mut self, word: u32) -> &mut Self {
        self.update(&word.to_be_bytes())
    }

    pub fn update_words(&mut self, words: &[u32]) -> &mut Self {
        for &word in words {
            self.update_word(word);
        }
        self
    }

    pub fn finalize(&self) -> u32 {
        self.state ^ CRC32_XOR_OUT
    }
}

/// CRC-32 of a byte stream.
///
/// ```
/// use fpgacompiler_backend::crc::crc32;
/// assert_eq!(crc32(b"123456789"), 0xCBF43926);
/// ```
pub fn crc32(bytes: &[u8]) -> u32 {
    Crc32::new().update(bytes).finalize()
}

/// CRC-32 of a word stream, each word high byte first.
pub fn crc32_words(words: &[u32]) -> u32 {
    Crc32::new().update_words(words).finalize()
}

#[cfg(test)]
mod test {
    mod reference_vectors {
        use crate::crc::*;

        #[test]
        fn ascii() {
            assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
            assert_eq!(
                crc32(b"The quick brown fox jumps over the lazy dog"),
                0x414F_A339
            );
            assert_eq!(crc32(b""), 0);
        }

        #[test]
        fn binary() {
            assert_eq!(crc32(&[0u8; 4]), 0x2144_DF1C);
            assert_eq!(crc32(&[0xFFu8; 4]), 0xFFFF_FFFF);
            assert_eq!(crc32_words(&[0]), 0x2144_DF1C);
            assert_eq!(crc32_words(&[0xFFFF_FFFF]), 0xFFFF_FFFF);
        }

        #[test]
        fn words_are_big_endian() {
            assert_eq!(crc32_words(&[0x3132_3334]), crc32(b"1234"));
            let mut inc = Crc32::new();
            inc.update(b"12345").update(b"6789");
            assert_eq!(inc.finalize(), 0xCBF4_3926);
        }
    }
}
