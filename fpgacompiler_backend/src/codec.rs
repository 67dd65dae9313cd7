//! Channel codecs: conversion between user values and 32-bit bus words.
//!
//! ## Overview
//!
//! Every output channel is paired with a [`Codec`], looked up by a string tag in a
//! [`CodecRegistry`]. A codec converts a user value (volts, Hz, dBm, degrees or a digital bit)
//! into an integer *raw code* of `raw_bits()` bits, splits the raw code into one or more
//! 16-bit payload chunks and tags each chunk with the channel address.
//!
//! The trait has two layers:
//! 1. Required scalar methods ([`Codec::to_raw`], [`Codec::from_raw`], [`Codec::limits`], ...)
//!    which define the bit-exact formulas of one device type.
//! 2. Provided methods built on top of them: [`Codec::to_words`], [`Codec::from_words`],
//!    [`Codec::check_tolerance`] and the self-test [`Codec::test`].
//!
//! Concrete codecs live in [`crate::dac`] (DAC712, DAC715, DAC7744 and the generic analog
//! output), [`crate::dds`] (frequency, amplitude and phase sub-channels) and here
//! ([`DigitalOut`]).
//!
//! Samples which carry no user instruction are passed as [`SampleValue::Unwritten`] and always
//! encode to pure-NOP words.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use thiserror::Error;

use crate::bits::*;
use crate::dac::Dac;
use crate::dds::{DdsAmp, DdsFreq, DdsPhase};

/// Value of a channel at one sample of its clockline.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SampleValue {
    Written(f64),
    Unwritten,
}

impl SampleValue {
    pub fn written(&self) -> Option<f64> {
        match self {
            SampleValue::Written(v) => Some(*v),
            SampleValue::Unwritten => None,
        }
    }
}

/// Physical unit of the user-visible value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unit {
    Volt,
    Hertz,
    DBm,
    Degree,
    Bit,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Unit::Volt => "V",
                Unit::Hertz => "Hz",
                Unit::DBm => "dBm",
                Unit::Degree => "deg",
                Unit::Bit => "bit",
            }
        )
    }
}

/// Location of a channel on the bus, as seen by its codec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChannelProps {
    pub address: u32,
    /// Bit index within the payload; only meaningful for digital channels.
    pub bit: u32,
}

impl ChannelProps {
    pub fn new(address: u32, bit: u32) -> Self {
        Self { address, bit }
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum CodecError {
    #[error("Unknown codec tag \"{tag}\". Registered tags are {registered:?}")]
    UnknownTag { tag: String, registered: Vec<String> },
    #[error(
        "Codec {tag}: value {value} decodes back to {decoded}, which is off by more than the tolerance {tolerance}"
    )]
    OutOfTolerance {
        tag: String,
        value: f64,
        decoded: f64,
        tolerance: f64,
    },
    #[error("Codec {tag} self-test failed: {reason}")]
    SelfTest { tag: String, reason: String },
}

/// Conversion between user values and bus words for one device type.
///
/// Implementors provide the scalar formulas; chunking, address tagging, NOP handling,
/// tolerance checks and the self-test come for free.
///
/// # Example
/// ```
/// use fpgacompiler_backend::codec::*;
/// use fpgacompiler_backend::dac::Dac;
///
/// let dac = Dac::dac712();
/// let props = ChannelProps::new(0x10, 0);
/// let words = dac.to_words(&props, &[SampleValue::Written(-10.0), SampleValue::Unwritten]);
/// assert_eq!(words, vec![0x0010_8000, 0x8000_0000]);
/// ```
pub trait Codec: Send + Sync + fmt::Debug {
    /// Registry tag, e.g. `"DAC712"`.
    fn tag(&self) -> &str;
    fn unit(&self) -> Unit;
    /// Legal user range `(min, max)`.
    fn limits(&self) -> (f64, f64);
    /// Width of the raw code.
    fn raw_bits(&self) -> u32;
    /// Clipped and rounded raw code of a user value.
    fn to_raw(&self, value: f64) -> u64;
    /// User value of a raw code.
    fn from_raw(&self, raw: u64) -> f64;
    /// One LSB in the linear domain (see [`Codec::linear`]).
    fn lsb(&self) -> f64;
    /// Static `{value -> expected raw code}` table checked by [`Codec::test`].
    fn self_test_vectors(&self) -> Vec<(f64, u64)>;

    /// Clips a user value into the legal range.
    fn clip(&self, value: f64) -> f64 {
        let (lo, hi) = self.limits();
        value.clamp(lo, hi)
    }
    /// Maps a user value into the domain where the raw code is uniformly spaced.
    fn linear(&self, value: f64) -> f64 {
        value
    }
    /// Inverse of [`Codec::linear`].
    fn from_linear(&self, x: f64) -> f64 {
        x
    }
    fn max_raw(&self) -> u64 {
        (1u64 << self.raw_bits()) - 1
    }
    fn words_per_value(&self) -> usize {
        ((self.raw_bits() + DATA_BITS - 1) / DATA_BITS) as usize
    }
    /// Splits a raw code into 16-bit payload chunks, least significant first.
    fn raw_to_chunks(&self, raw: u64, _props: &ChannelProps) -> Vec<u32> {
        (0..self.words_per_value())
            .map(|i| ((raw >> (i as u32 * DATA_BITS)) as u32) & DATA_MASK)
            .collect()
    }
    /// Inverse of [`Codec::raw_to_chunks`].
    fn chunks_to_raw(&self, chunks: &[u32], _props: &ChannelProps) -> u64 {
        chunks
            .iter()
            .enumerate()
            .fold(0u64, |raw, (i, chunk)| {
                raw | (((chunk & DATA_MASK) as u64) << (i as u32 * DATA_BITS))
            })
    }
    /// Neighbouring raw code, `delta` steps away in the order of increasing value.
    fn step(&self, raw: u64, delta: i64) -> Option<u64> {
        let next = raw as i128 + delta as i128;
        if next < 0 || next > self.max_raw() as i128 {
            None
        } else {
            Some(next as u64)
        }
    }

    /// Encodes a sequence of samples into bus words.
    ///
    /// Each written value produces [`Codec::words_per_value`] words carrying the channel
    /// address; each unwritten sample produces the same number of pure-NOP words.
    fn to_words(&self, props: &ChannelProps, values: &[SampleValue]) -> Vec<u32> {
        let n = self.words_per_value();
        let mut words = Vec::with_capacity(values.len() * n);
        for value in values {
            match value {
                SampleValue::Written(v) => {
                    let raw = self.to_raw(*v);
                    words.extend(
                        self.raw_to_chunks(raw, props)
                            .into_iter()
                            .map(|chunk| encode(props.address, chunk)),
                    );
                }
                SampleValue::Unwritten => words.extend(std::iter::repeat(NOP_WORD).take(n)),
            }
        }
        words
    }

    /// Same as [`Codec::to_words`] but re-runs the decoder on every written value and fails
    /// if the round trip is further than one LSB from the clipped input.
    fn to_words_checked(
        &self,
        props: &ChannelProps,
        values: &[SampleValue],
    ) -> Result<Vec<u32>, CodecError> {
        for v in values.iter().filter_map(SampleValue::written) {
            self.check_tolerance(v, self.to_raw(v))?;
        }
        Ok(self.to_words(props, values))
    }

    /// Decodes the words addressed to this channel.
    ///
    /// NOP words and words carrying other addresses are skipped; the remaining words are
    /// grouped by [`Codec::words_per_value`]. The time of a value is the time of its first word.
    fn from_words(&self, props: &ChannelProps, times: &[u32], words: &[u32]) -> (Vec<u32>, Vec<f64>) {
        let n = self.words_per_value();
        let mut out_times = Vec::new();
        let mut out_values = Vec::new();
        let mut chunks: Vec<u32> = Vec::with_capacity(n);
        let mut group_time = 0;
        for (&t, &word) in times.iter().zip(words.iter()) {
            if is_nop(word) || address_of(word) != props.address {
                continue;
            }
            if chunks.is_empty() {
                group_time = t;
            }
            chunks.push(data_of(word));
            if chunks.len() == n {
                out_times.push(group_time);
                out_values.push(self.from_raw(self.chunks_to_raw(&chunks, props)));
                chunks.clear();
            }
        }
        (out_times, out_values)
    }

    /// Fails if `raw` decodes further than one LSB away from the clipped `value`.
    fn check_tolerance(&self, value: f64, raw: u64) -> Result<(), CodecError> {
        let decoded = self.from_raw(raw);
        let error = (self.linear(decoded) - self.linear(self.clip(value))).abs();
        let tolerance = self.lsb();
        if error.is_nan() || error > tolerance + float_slack(self, decoded) {
            return Err(CodecError::OutOfTolerance {
                tag: self.tag().to_string(),
                value,
                decoded,
                tolerance,
            });
        }
        Ok(())
    }

    /// Self-test of the codec.
    ///
    /// Checks, in order:
    /// 1. forward conversion of the static table plus `extra_vectors`;
    /// 2. reverse conversion of the same table, within one LSB;
    /// 3. `to_raw(from_raw(w)) == w` over the raw code space (exhaustive up to 16 bits,
    ///    every 16-bit pattern in every chunk position above that);
    /// 4. for values around each of those codes and up to 10 LSB beyond both limits, the chosen
    ///    code is at least as close as its two neighbours.
    fn test(&self, extra_vectors: &[(f64, u64)]) -> Result<(), CodecError> {
        let fail = |reason: String| CodecError::SelfTest {
            tag: self.tag().to_string(),
            reason,
        };
        let mut vectors = self.self_test_vectors();
        vectors.extend_from_slice(extra_vectors);

        for &(value, expected) in vectors.iter() {
            let got = self.to_raw(value);
            if got != expected {
                return Err(fail(format!(
                    "forward {} {} gave {:#x}, expected {:#x}",
                    value,
                    self.unit(),
                    got,
                    expected
                )));
            }
            self.check_tolerance(value, expected)
                .map_err(|e| fail(format!("reverse of {:#x}: {}", expected, e)))?;
        }

        let raws = raw_test_space(self);
        for &raw in raws.iter() {
            let back = self.to_raw(self.from_raw(raw));
            if back != raw {
                return Err(fail(format!(
                    "code {:#x} decodes to {} which encodes to {:#x}",
                    raw,
                    self.from_raw(raw),
                    back
                )));
            }
        }

        let lsb = self.lsb();
        let mut points: Vec<f64> = Vec::with_capacity(raws.len() * 3 + 84);
        for &raw in raws.iter() {
            let x = self.linear(self.from_raw(raw));
            points.extend([x - 0.25 * lsb, x, x + 0.25 * lsb]);
        }
        let (lo, hi) = self.limits();
        let (lo, hi) = (self.linear(lo), self.linear(hi));
        for k in 0..=40 {
            let d = k as f64 * 0.25 * lsb;
            points.push(lo - d);
            points.push(hi + d);
        }
        for x in points {
            let value = self.from_linear(x);
            if value.is_nan() {
                continue;
            }
            let target = self.linear(self.clip(value));
            let chosen = self.to_raw(value);
            let err = |raw: u64| (self.linear(self.from_raw(raw)) - target).abs();
            let chosen_err = err(chosen);
            for neighbour in [self.step(chosen, -1), self.step(chosen, 1)].into_iter().flatten() {
                if chosen_err > err(neighbour) + float_slack(self, value) {
                    return Err(fail(format!(
                        "value {} {} encodes to {:#x} (error {}) while {:#x} is closer (error {})",
                        value,
                        self.unit(),
                        chosen,
                        chosen_err,
                        neighbour,
                        err(neighbour)
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Absolute slack for float comparisons in the linear domain around `value`.
fn float_slack<C: Codec + ?Sized>(codec: &C, value: f64) -> f64 {
    let scale = codec.linear(value).abs().max(codec.lsb());
    scale * f64::EPSILON * 4.0 + codec.lsb() * 1e-9
}

/// Raw codes visited by the self-test.
fn raw_test_space<C: Codec + ?Sized>(codec: &C) -> Vec<u64> {
    let max = codec.max_raw();
    if codec.raw_bits() <= DATA_BITS {
        return (0..=max).collect();
    }
    let mut raws = Vec::with_capacity(codec.words_per_value() << DATA_BITS);
    for pos in 0..codec.words_per_value() {
        for w in 0..=DATA_MASK as u64 {
            raws.push((w << (pos as u32 * DATA_BITS)) & max);
        }
    }
    raws.push(max);
    raws
}

/// One line of a digital bank: a single bit at `ChannelProps::bit`.
#[derive(Clone, Debug)]
pub struct DigitalOut {
    tag: String,
}

impl Default for DigitalOut {
    fn default() -> Self {
        Self::new()
    }
}

impl DigitalOut {
    pub fn new() -> Self {
        Self {
            tag: "DigitalOut".to_string(),
        }
    }
}

impl Codec for DigitalOut {
    fn tag(&self) -> &str {
        &self.tag
    }
    fn unit(&self) -> Unit {
        Unit::Bit
    }
    fn limits(&self) -> (f64, f64) {
        (0.0, 1.0)
    }
    fn raw_bits(&self) -> u32 {
        1
    }
    fn to_raw(&self, value: f64) -> u64 {
        if self.clip(value) >= 0.5 {
            1
        } else {
            0
        }
    }
    fn from_raw(&self, raw: u64) -> f64 {
        (raw & 1) as f64
    }
    fn lsb(&self) -> f64 {
        1.0
    }
    fn self_test_vectors(&self) -> Vec<(f64, u64)> {
        vec![(-1.0, 0), (0.0, 0), (0.2, 0), (0.8, 1), (1.0, 1), (2.0, 1)]
    }
    fn raw_to_chunks(&self, raw: u64, props: &ChannelProps) -> Vec<u32> {
        vec![((raw & 1) as u32) << props.bit]
    }
    fn chunks_to_raw(&self, chunks: &[u32], props: &ChannelProps) -> u64 {
        chunks
            .first()
            .map(|chunk| ((chunk >> props.bit) & 1) as u64)
            .unwrap_or(0)
    }
}

/// Registry of codecs keyed by their tag.
///
/// [`CodecRegistry::default`] is populated with every built-in codec:
/// `AnalogOut`, `DAC712`, `DAC715`, `DAC7744`, `DigitalOut`, `DDS_FREQ`, `DDS_AMP` and `DDS_PHASE`.
#[derive(Clone, Debug)]
pub struct CodecRegistry {
    codecs: IndexMap<String, Arc<dyn Codec>>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        let mut reg = Self::empty();
        reg.register(Arc::new(Dac::analog_out()));
        reg.register(Arc::new(Dac::dac712()));
        reg.register(Arc::new(Dac::dac715()));
        reg.register(Arc::new(Dac::dac7744()));
        reg.register(Arc::new(DigitalOut::new()));
        reg.register(Arc::new(DdsFreq::default()));
        reg.register(Arc::new(DdsAmp::default()));
        reg.register(Arc::new(DdsPhase::default()));
        reg
    }
}

impl CodecRegistry {
    pub fn empty() -> Self {
        Self {
            codecs: IndexMap::new(),
        }
    }

    /// Registers a codec under its own tag, replacing any previous codec with that tag.
    pub fn register(&mut self, codec: Arc<dyn Codec>) {
        self.codecs.insert(codec.tag().to_string(), codec);
    }

    pub fn get(&self, tag: &str) -> Result<Arc<dyn Codec>, CodecError> {
        self.codecs
            .get(tag)
            .cloned()
            .ok_or_else(|| CodecError::UnknownTag {
                tag: tag.to_string(),
                registered: self.tags(),
            })
    }

    pub fn tags(&self) -> Vec<String> {
        self.codecs.keys().cloned().collect()
    }

    /// Runs the self-test of every registered codec.
    pub fn test_all(&self) -> Result<(), CodecError> {
        self.codecs.values().try_for_each(|codec| codec.test(&[]))
    }
}

#[cfg(test)]
mod test {
    mod digital {
        use crate::codec::*;

        #[test]
        fn bit_placement() {
            let codec = DigitalOut::new();
            let props = ChannelProps::new(0x05, 3);
            let words = codec.to_words(
                &props,
                &[
                    SampleValue::Written(1.0),
                    SampleValue::Written(0.0),
                    SampleValue::Unwritten,
                ],
            );
            assert_eq!(words, vec![0x0005_0008, 0x0005_0000, NOP_WORD]);
            let (times, values) = codec.from_words(&props, &[0, 1, 2], &words);
            assert_eq!(times, vec![0, 1]);
            assert_eq!(values, vec![1.0, 0.0]);
        }

        #[test]
        fn self_test() {
            DigitalOut::new().test(&[]).unwrap();
        }
    }

    mod registry {
        use crate::codec::*;

        #[test]
        fn defaults_are_registered() {
            let reg = CodecRegistry::default();
            for tag in [
                "AnalogOut",
                "DAC712",
                "DAC715",
                "DAC7744",
                "DigitalOut",
                "DDS_FREQ",
                "DDS_AMP",
                "DDS_PHASE",
            ] {
                assert_eq!(reg.get(tag).unwrap().tag(), tag);
            }
        }

        #[test]
        fn unknown_tag() {
            let reg = CodecRegistry::default();
            match reg.get("AD9910") {
                Err(CodecError::UnknownTag { tag, registered }) => {
                    assert_eq!(tag, "AD9910");
                    assert!(registered.contains(&"DAC712".to_string()));
                }
                other => panic!("unexpected {:?}", other),
            }
        }

        #[test]
        fn every_builtin_passes_its_self_test() {
            CodecRegistry::default().test_all().unwrap();
        }
    }

    mod from_words {
        use crate::codec::*;
        use crate::dac::Dac;

        #[test]
        fn skips_foreign_addresses_and_nops() {
            let dac = Dac::dac7744();
            let props = ChannelProps::new(0x20, 0);
            let words = [
                encode(0x20, 0x8000),
                encode(0x21, 0xFFFF),
                NOP_WORD | encode(0x20, 0x1234),
                encode(0x20, 0xFFFF),
            ];
            let (times, values) = dac.from_words(&props, &[0, 4, 7, 9], &words);
            assert_eq!(times, vec![0, 9]);
            assert_eq!(values[0], 0.0);
            assert!((values[1] - (10.0 - 20.0 / 65536.0)).abs() < 1e-12);
        }
    }
}
