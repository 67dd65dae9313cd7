//! Voltage DACs: the generic analog output and the DAC712, DAC715 and DAC7744 parts.
//!
//! All of them share one formula parameterised by the number of bits, the voltage range,
//! the denominator ([`Span`]) and the output coding ([`Coding`]):
//!
//! ```text
//! offset = round((clip(v, min, max) - min) * N / (max - min)),   saturated at 2^bits - 1
//! word   = offset XOR 2^(bits-1)   (two's complement parts)
//! word   = offset                  (offset-binary parts)
//! ```
//!
//! where `N = 2^bits - 1` for [`Span::FullScale`] and `N = 2^bits` for [`Span::Steps`].

use crate::codec::{Codec, Unit};

/// Denominator of the voltage-to-code formula.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Span {
    /// `2^bits - 1`: both range ends are exactly representable.
    FullScale,
    /// `2^bits`: the datasheet LSB `(max - min) / 2^bits`; `max` itself saturates one LSB below.
    Steps,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Coding {
    TwosComplement,
    OffsetBinary,
}

#[derive(Clone, Debug)]
pub struct Dac {
    tag: String,
    bits: u32,
    min: f64,
    max: f64,
    span: Span,
    coding: Coding,
    vectors: Vec<(f64, u64)>,
}

impl Dac {
    /// Custom DAC. Its self-test table holds the clip points and both range ends.
    pub fn new(tag: &str, bits: u32, min: f64, max: f64, span: Span, coding: Coding) -> Self {
        let mut dac = Self {
            tag: tag.to_string(),
            bits,
            min,
            max,
            span,
            coding,
            vectors: Vec::new(),
        };
        let top = dac.code(dac.max_code());
        let bottom = dac.code(0);
        dac.vectors = vec![
            (min - 1.0, bottom),
            (min, bottom),
            (max, top),
            (max + 1.0, top),
        ];
        dac
    }

    /// Generic 16-bit bipolar analog output, ±10 V, full-scale denominator.
    pub fn analog_out() -> Self {
        let mut dac = Self::new(
            "AnalogOut",
            16,
            -10.0,
            10.0,
            Span::FullScale,
            Coding::TwosComplement,
        );
        dac.vectors = vec![
            (-11.0, 0x8000),
            (-10.0, 0x8000),
            (-5.0, 0xC000),
            (0.0, 0x0000),
            (5.0, 0x3FFF),
            (10.0, 0x7FFF),
            (11.0, 0x7FFF),
        ];
        dac
    }

    /// DAC712: 16 bit, ±10 V, two's complement.
    pub fn dac712() -> Self {
        const LSB: f64 = 20.0 / 65536.0;
        let mut dac = Self::new("DAC712", 16, -10.0, 10.0, Span::Steps, Coding::TwosComplement);
        dac.vectors = vec![
            (-11.0, 0x8000),
            (-10.0, 0x8000),
            (-5.0, 0xC000),
            (-LSB, 0xFFFF),
            (0.0, 0x0000),
            (LSB / 2.0, 0x0000),
            (LSB, 0x0001),
            (5.0, 0x4000),
            (10.0 - LSB, 0x7FFF),
            (10.0, 0x7FFF),
            (11.0, 0x7FFF),
        ];
        dac
    }

    /// DAC715: the DAC712 formula over 0..10 V.
    pub fn dac715() -> Self {
        const LSB: f64 = 10.0 / 65536.0;
        let mut dac = Self::new("DAC715", 16, 0.0, 10.0, Span::Steps, Coding::TwosComplement);
        dac.vectors = vec![
            (-1.0, 0x8000),
            (0.0, 0x8000),
            (2.5, 0xC000),
            (5.0 - LSB, 0xFFFF),
            (5.0, 0x0000),
            (5.0 + LSB, 0x0001),
            (7.5, 0x4000),
            (10.0 - LSB, 0x7FFF),
            (10.0, 0x7FFF),
            (11.0, 0x7FFF),
        ];
        dac
    }

    /// DAC7744: 16 bit, ±10 V, offset binary with the datasheet denominator `2^bits`.
    pub fn dac7744() -> Self {
        const LSB: f64 = 20.0 / 65536.0;
        let mut dac = Self::new("DAC7744", 16, -10.0, 10.0, Span::Steps, Coding::OffsetBinary);
        dac.vectors = vec![
            (-11.0, 0x0000),
            (-10.0, 0x0000),
            (-5.0, 0x4000),
            (-LSB, 0x7FFF),
            (0.0, 0x8000),
            (LSB, 0x8001),
            (5.0, 0xC000),
            (10.0 - LSB, 0xFFFF),
            (10.0, 0xFFFF),
            (11.0, 0xFFFF),
        ];
        dac
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    fn denominator(&self) -> f64 {
        match self.span {
            Span::FullScale => ((1u64 << self.bits) - 1) as f64,
            Span::Steps => (1u64 << self.bits) as f64,
        }
    }

    fn max_code(&self) -> u64 {
        (1u64 << self.bits) - 1
    }

    fn sign_bit(&self) -> u64 {
        1u64 << (self.bits - 1)
    }

    /// Offset (monotone) code to output word.
    fn code(&self, offset: u64) -> u64 {
        match self.coding {
            Coding::TwosComplement => offset ^ self.sign_bit(),
            Coding::OffsetBinary => offset,
        }
    }

    /// Output word to offset (monotone) code.
    fn uncode(&self, word: u64) -> u64 {
        // XOR is its own inverse
        self.code(word & self.max_code())
    }

    /// Encodes a list of voltages into raw words.
    pub fn v_to_words(&self, volts: &[f64]) -> Vec<u64> {
        volts.iter().map(|&v| self.to_raw(v)).collect()
    }

    /// Decodes a list of raw words into voltages.
    pub fn words_to_v(&self, words: &[u64]) -> Vec<f64> {
        words.iter().map(|&w| self.from_raw(w)).collect()
    }
}

impl Codec for Dac {
    fn tag(&self) -> &str {
        &self.tag
    }
    fn unit(&self) -> Unit {
        Unit::Volt
    }
    fn limits(&self) -> (f64, f64) {
        (self.min, self.max)
    }
    fn raw_bits(&self) -> u32 {
        self.bits
    }
    fn to_raw(&self, value: f64) -> u64 {
        let x = ((self.clip(value) - self.min) * self.denominator() / (self.max - self.min))
            .round_ties_even();
        // NaN casts to 0
        let offset = (x.max(0.0) as u64).min(self.max_code());
        self.code(offset)
    }
    fn from_raw(&self, raw: u64) -> f64 {
        self.uncode(raw) as f64 * (self.max - self.min) / self.denominator() + self.min
    }
    fn lsb(&self) -> f64 {
        (self.max - self.min) / self.denominator()
    }
    fn self_test_vectors(&self) -> Vec<(f64, u64)> {
        self.vectors.clone()
    }
    fn step(&self, raw: u64, delta: i64) -> Option<u64> {
        let next = self.uncode(raw) as i64 + delta;
        if next < 0 || next as u64 > self.max_code() {
            None
        } else {
            Some(self.code(next as u64))
        }
    }
}

#[cfg(test)]
mod test {
    mod endpoints {
        use crate::codec::*;
        use crate::dac::*;

        #[test]
        fn dac712_bipolar_endpoints() {
            let dac = Dac::dac712();
            let volts = [-10.0, -5.0, 0.0, 5.0, 9.999695];
            assert_eq!(
                dac.v_to_words(&volts),
                vec![0x8000, 0xC000, 0x0000, 0x4000, 0x7FFF]
            );
            for (v, back) in volts.iter().zip(dac.words_to_v(&dac.v_to_words(&volts))) {
                assert!((v - back).abs() <= dac.lsb());
            }
        }

        #[test]
        fn dac7744_datasheet_formula() {
            let dac = Dac::dac7744();
            let lsb = 20.0 / 65536.0;
            assert_eq!(
                dac.v_to_words(&[-10.0, 0.0, 10.0 - lsb]),
                vec![0x0000, 0x8000, 0xFFFF]
            );
        }

        #[test]
        fn generic_full_scale_reaches_both_ends() {
            let dac = Dac::analog_out();
            assert_eq!(dac.from_raw(0x8000), -10.0);
            assert_eq!(dac.from_raw(0x7FFF), 10.0);
        }

        #[test]
        fn words_carry_the_address() {
            let dac = Dac::dac712();
            let words = dac.to_words(&ChannelProps::new(0x10, 0), &[SampleValue::Written(5.0)]);
            assert_eq!(words, vec![0x0010_4000]);
        }

        #[test]
        fn custom_dac() {
            let dac = Dac::new("DAC12", 12, 0.0, 5.0, Span::FullScale, Coding::OffsetBinary);
            assert_eq!(dac.to_raw(5.0), 0xFFF);
            assert_eq!(dac.to_raw(-1.0), 0);
            dac.test(&[(2.5, 0x800)]).unwrap();
        }
    }

    mod self_test {
        use crate::codec::*;
        use crate::dac::*;

        #[test]
        fn builtin_parts() {
            for dac in [Dac::analog_out(), Dac::dac712(), Dac::dac715(), Dac::dac7744()] {
                dac.test(&[]).unwrap();
            }
        }

        #[test]
        fn wrong_vector_is_reported() {
            match Dac::dac712().test(&[(0.0, 0x8000)]) {
                Err(CodecError::SelfTest { tag, .. }) => assert_eq!(tag, "DAC712"),
                other => panic!("unexpected {:?}", other),
            }
        }

        #[test]
        fn tolerance_check() {
            let dac = Dac::dac712();
            let props = ChannelProps::new(1, 0);
            assert!(dac
                .to_words_checked(&props, &[SampleValue::Written(3.3), SampleValue::Written(20.0)])
                .is_ok());
            // a word two LSB away from the requested value is rejected
            let raw = dac.step(dac.to_raw(3.3), 2).unwrap();
            assert!(dac.check_tolerance(3.3, raw).is_err());
        }
    }

    mod properties {
        use crate::codec::*;
        use crate::dac::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn dac712_round_trip_within_one_lsb(v in -12.0f64..12.0) {
                let dac = Dac::dac712();
                let back = dac.from_raw(dac.to_raw(v));
                prop_assert!((back - dac.clip(v)).abs() <= dac.lsb());
            }

            #[test]
            fn dac7744_words_round_trip(w in 0u64..65536) {
                let dac = Dac::dac7744();
                prop_assert_eq!(dac.to_raw(dac.from_raw(w)), w);
            }
        }
    }
}
