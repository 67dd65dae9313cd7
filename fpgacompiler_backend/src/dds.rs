//! Direct digital synthesis sub-channel codecs.
//!
//! A DDS occupies `1 << ADDR_RNG_BITS` consecutive addresses starting at an aligned base:
//! frequency at `base`, amplitude at `base + 1`, phase at `base + 2`.
//!
//! - Frequency: `FTW = round(f * 2^FREQ_BITS / SYSCLK) mod 2^FREQ_BITS`, spread over three
//!   words, least significant chunk first.
//! - Amplitude: dBm is converted to a linear voltage `u = 10^(dBm / 20)` and mapped onto the
//!   amplitude tuning word with a two-point calibration `(A0, DBM0)`, `(A1, DBM1)`.
//! - Phase: `PTW = round(phase * (2^PHASE_BITS - 1) / 360)`, phases outside `[0, 360]`
//!   being wrapped first.

use crate::bits::ADDR_RNG_BITS;
use crate::codec::{Codec, Unit};

pub const SYSCLK_DEFAULT: f64 = 1e9;
pub const FREQ_BITS: u32 = 48;
pub const AMP_BITS: u32 = 14;
pub const PHASE_BITS: u32 = 12;

/// Number of addresses reserved by one DDS.
pub const DDS_ADDR_RANGE: u32 = 1 << ADDR_RNG_BITS;
pub const DDS_FREQ_OFFSET: u32 = 0;
pub const DDS_AMP_OFFSET: u32 = 1;
pub const DDS_PHASE_OFFSET: u32 = 2;

#[derive(Clone, Debug)]
pub struct DdsFreq {
    tag: String,
    sysclk: f64,
    bits: u32,
}

impl Default for DdsFreq {
    fn default() -> Self {
        Self::new("DDS_FREQ", SYSCLK_DEFAULT, FREQ_BITS)
    }
}

impl DdsFreq {
    pub fn new(tag: &str, sysclk: f64, bits: u32) -> Self {
        Self {
            tag: tag.to_string(),
            sysclk,
            bits,
        }
    }

    pub fn sysclk(&self) -> f64 {
        self.sysclk
    }

    fn scale(&self) -> f64 {
        (1u64 << self.bits) as f64
    }
}

impl Codec for DdsFreq {
    fn tag(&self) -> &str {
        &self.tag
    }
    fn unit(&self) -> Unit {
        Unit::Hertz
    }
    /// Upper limit is the frequency of the largest tuning word.
    fn limits(&self) -> (f64, f64) {
        (0.0, self.from_raw(self.max_raw()))
    }
    fn raw_bits(&self) -> u32 {
        self.bits
    }
    fn to_raw(&self, value: f64) -> u64 {
        let ftw = (self.clip(value) * self.scale() / self.sysclk).round_ties_even();
        (ftw.max(0.0) as u64).min(self.max_raw()) & self.max_raw()
    }
    fn from_raw(&self, raw: u64) -> f64 {
        (raw & self.max_raw()) as f64 * self.sysclk / self.scale()
    }
    fn lsb(&self) -> f64 {
        self.sysclk / self.scale()
    }
    fn self_test_vectors(&self) -> Vec<(f64, u64)> {
        let quarter = 1u64 << (self.bits - 2);
        vec![
            (-1.0, 0),
            (0.0, 0),
            (self.lsb(), 1),
            (self.sysclk / 4.0, quarter),
            (self.sysclk / 10.0, (self.scale() / 10.0).round_ties_even() as u64),
            (2.0 * self.sysclk, self.max_raw()),
        ]
    }
}

/// Amplitude sub-channel with a two-point calibration in linear voltage space.
#[derive(Clone, Debug)]
pub struct DdsAmp {
    tag: String,
    bits: u32,
    a0: f64,
    u0: f64,
    a1: f64,
    u1: f64,
}

impl Default for DdsAmp {
    fn default() -> Self {
        // ATW = 16383 * u, i.e. full scale at 0 dBm
        Self::new("DDS_AMP", AMP_BITS, (1638.3, -20.0), (16383.0, 0.0))
    }
}

impl DdsAmp {
    /// `cal0` and `cal1` are `(ATW, dBm)` calibration points.
    pub fn new(tag: &str, bits: u32, cal0: (f64, f64), cal1: (f64, f64)) -> Self {
        Self {
            tag: tag.to_string(),
            bits,
            a0: cal0.0,
            u0: dbm_to_u(cal0.1),
            a1: cal1.0,
            u1: dbm_to_u(cal1.1),
        }
    }

    /// Linear voltage at a given tuning word.
    fn u_at(&self, atw: f64) -> f64 {
        (self.u0 + (atw - self.a0) * (self.u1 - self.u0) / (self.a1 - self.a0)).max(0.0)
    }

    fn u_range(&self) -> (f64, f64) {
        (self.u_at(0.0), self.u_at(self.max_raw() as f64))
    }

    /// Smallest finite dBm value, reached at the smallest tuning word with a positive voltage.
    pub fn dbm_min(&self) -> f64 {
        let u_lo = self.u_at(0.0);
        if u_lo > 0.0 {
            u_to_dbm(u_lo)
        } else {
            u_to_dbm(self.u_at(1.0))
        }
    }

    pub fn dbm_max(&self) -> f64 {
        u_to_dbm(self.u_range().1)
    }
}

fn dbm_to_u(dbm: f64) -> f64 {
    10f64.powf(dbm / 20.0)
}

fn u_to_dbm(u: f64) -> f64 {
    20.0 * u.log10()
}

impl Codec for DdsAmp {
    fn tag(&self) -> &str {
        &self.tag
    }
    fn unit(&self) -> Unit {
        Unit::DBm
    }
    fn limits(&self) -> (f64, f64) {
        (self.dbm_min(), self.dbm_max())
    }
    fn raw_bits(&self) -> u32 {
        self.bits
    }
    /// Clips in voltage space so that `-inf` dBm maps onto tuning word 0.
    fn clip(&self, value: f64) -> f64 {
        let (u_lo, u_hi) = self.u_range();
        u_to_dbm(dbm_to_u(value).clamp(u_lo, u_hi))
    }
    fn linear(&self, value: f64) -> f64 {
        dbm_to_u(value)
    }
    fn from_linear(&self, x: f64) -> f64 {
        u_to_dbm(x)
    }
    fn to_raw(&self, value: f64) -> u64 {
        let u = dbm_to_u(self.clip(value));
        let atw = (((u - self.u0) * self.a1 + (self.u1 - u) * self.a0) / (self.u1 - self.u0))
            .round_ties_even();
        (atw.max(0.0) as u64).min(self.max_raw())
    }
    fn from_raw(&self, raw: u64) -> f64 {
        u_to_dbm(self.u_at((raw & self.max_raw()) as f64))
    }
    fn lsb(&self) -> f64 {
        ((self.u1 - self.u0) / (self.a1 - self.a0)).abs()
    }
    fn self_test_vectors(&self) -> Vec<(f64, u64)> {
        let max = self.max_raw();
        let at = |dbm: f64| {
            let u = dbm_to_u(dbm);
            (((u - self.u0) * self.a1 + (self.u1 - u) * self.a0) / (self.u1 - self.u0))
                .round_ties_even()
                .clamp(0.0, max as f64) as u64
        };
        vec![
            (f64::NEG_INFINITY, 0),
            (-40.0, at(-40.0)),
            (u_to_dbm(self.u0), at(u_to_dbm(self.u0))),
            (self.dbm_max(), max),
            (self.dbm_max() + 10.0, max),
        ]
    }
}

#[derive(Clone, Debug)]
pub struct DdsPhase {
    tag: String,
    bits: u32,
}

impl Default for DdsPhase {
    fn default() -> Self {
        Self::new("DDS_PHASE", PHASE_BITS)
    }
}

impl DdsPhase {
    pub fn new(tag: &str, bits: u32) -> Self {
        Self {
            tag: tag.to_string(),
            bits,
        }
    }

    fn wrap(value: f64) -> f64 {
        if (0.0..=360.0).contains(&value) {
            value
        } else {
            value.rem_euclid(360.0)
        }
    }
}

impl Codec for DdsPhase {
    fn tag(&self) -> &str {
        &self.tag
    }
    fn unit(&self) -> Unit {
        Unit::Degree
    }
    fn limits(&self) -> (f64, f64) {
        (0.0, 360.0)
    }
    fn raw_bits(&self) -> u32 {
        self.bits
    }
    fn clip(&self, value: f64) -> f64 {
        Self::wrap(value)
    }
    fn to_raw(&self, value: f64) -> u64 {
        let ptw = (self.clip(value) * self.max_raw() as f64 / 360.0).round_ties_even();
        (ptw.max(0.0) as u64).min(self.max_raw())
    }
    fn from_raw(&self, raw: u64) -> f64 {
        (raw & self.max_raw()) as f64 * 360.0 / self.max_raw() as f64
    }
    fn lsb(&self) -> f64 {
        360.0 / self.max_raw() as f64
    }
    fn self_test_vectors(&self) -> Vec<(f64, u64)> {
        if self.bits != PHASE_BITS {
            return vec![(0.0, 0), (360.0, self.max_raw())];
        }
        vec![
            (0.0, 0),
            (90.0, 1024),
            (180.0, 2048),
            (360.0, 4095),
            (450.0, 1024),
            (-90.0, 3071),
        ]
    }
}

#[cfg(test)]
mod test {
    mod frequency {
        use crate::bits::*;
        use crate::codec::*;
        use crate::dds::*;

        #[test]
        fn split_into_three_words() {
            let codec = DdsFreq::new("DDS_FREQ", 1e9, 48);
            let ftw = (2f64.powi(48) / 10.0).round() as u64;
            assert_eq!(codec.to_raw(100e6), ftw);

            let props = ChannelProps::new(0x20, 0);
            let words = codec.to_words(&props, &[SampleValue::Written(100e6)]);
            assert_eq!(
                words,
                vec![
                    encode(0x20, (ftw & 0xFFFF) as u32),
                    encode(0x20, ((ftw >> 16) & 0xFFFF) as u32),
                    encode(0x20, ((ftw >> 32) & 0xFFFF) as u32),
                ]
            );

            let (times, values) = codec.from_words(&props, &[10, 11, 12], &words);
            assert_eq!(times, vec![10]);
            assert!((values[0] - 100e6).abs() <= codec.lsb());
        }

        #[test]
        fn self_test() {
            DdsFreq::default().test(&[]).unwrap();
        }
    }

    mod amplitude {
        use crate::codec::*;
        use crate::dds::*;

        #[test]
        fn calibration_points() {
            let codec = DdsAmp::default();
            assert_eq!(codec.to_raw(0.0), 16383);
            assert_eq!(codec.to_raw(-20.0), 1638);
            assert_eq!(codec.to_raw(-40.0), 164);
            assert_eq!(codec.to_raw(f64::NEG_INFINITY), 0);
            assert_eq!(codec.to_raw(6.0), 16383);
            assert!(codec.dbm_max().abs() < 1e-9);
            assert!(codec.dbm_min() < -80.0);
            assert_eq!(codec.words_per_value(), 1);
        }

        #[test]
        fn self_test() {
            DdsAmp::default().test(&[]).unwrap();
        }
    }

    mod phase {
        use crate::codec::*;
        use crate::dds::*;

        #[test]
        fn wraps_outside_one_turn() {
            let codec = DdsPhase::default();
            assert_eq!(codec.to_raw(360.0), 4095);
            assert_eq!(codec.to_raw(720.0), 0);
            assert_eq!(codec.to_raw(-90.0), codec.to_raw(270.0));
        }

        #[test]
        fn self_test() {
            DdsPhase::default().test(&[]).unwrap();
        }
    }
}
