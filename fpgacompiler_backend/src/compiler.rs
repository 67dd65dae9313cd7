//! The timeline compiler: turns the device tree of a [`Board`] into a packed sample matrix.
//!
//! ## Output
//!
//! A [`CompiledBoard`] holds
//! - `data`: `u32[S][R + 1]`, one row `[tick, rack0_word, (rack1_word)]` per retained sample;
//! - the final-value table (`channel -> value`);
//! - the CRC table (`channel -> crc32`);
//! - the worker options merged from the board defaults and the in-script options.
//!
//! ## Algorithm
//!
//! 1. Every channel is expanded into written samples and encoded with its codec. Digital banks
//!    merge their lines into one word per tick. A written value is a *change* when its words
//!    differ from the previous value of the same channel (or bank), and the first value always
//!    is. Multi-word values occupy consecutive ticks.
//! 2. The time union holds tick 0, every changed tick, every special marker and the stop tick.
//! 3. Changes are placed rack by rack. Placing a second change on a `(tick, rack)` which already
//!    carries one marks a conflict; any conflict aborts with a [`ConflictReport`].
//! 4. Samples are retained if any rack changed, a marker is present, or they are first or last.
//!    Racks without a change carry the pure-NOP word, except on the first sample where the NOP
//!    word preloads the rack's first data word.
//! 5. Special bits are ORed in and the strobe is generated, either toggling on every retained
//!    sample (auto mode) or following the cumulative parity of explicit strobe markers.
//! 6. Final values and per-channel CRCs are taken from the result.

use std::collections::BTreeSet;
use std::sync::Arc;

use indexmap::IndexMap;
use ndarray::Array2;

use crate::bits::*;
use crate::board::Board;
use crate::channel::*;
use crate::codec::{ChannelProps, Codec, CodecError, SampleValue};
use crate::config::{BoardConfig, WorkerOptions};
use crate::crc::Crc32;
use crate::device::*;
use crate::error::*;
use crate::utils::*;

/// Channel information kept with the compiled stream for back-decoding.
#[derive(Clone, Debug)]
pub struct CompiledChannel {
    pub kind: ChannelKind,
    pub rack: usize,
    pub props: ChannelProps,
    pub codec: Arc<dyn Codec>,
}

/// One change a device puts on the bus.
struct Placed {
    tick: usize,
    word: u32,
    /// `(channel, old, new)` of the user values behind the word.
    sources: Vec<(String, Option<f64>, Option<f64>)>,
}

struct DevicePlan {
    rack: usize,
    placed: Vec<Placed>,
    /// Last tick occupied by any written value, changed or not.
    last_tick: Option<usize>,
}

fn encode_values(chan: &Channel, values: &[SampleValue], check: bool) -> Result<Vec<u32>, CompileError> {
    let codec = chan.codec();
    if !check {
        return Ok(codec.to_words(&chan.props(), values));
    }
    codec
        .to_words_checked(&chan.props(), values)
        .map_err(|e| match e {
            CodecError::OutOfTolerance {
                value,
                decoded,
                tolerance,
                ..
            } => CompileError::CodecOutOfTolerance {
                channel: chan.name().to_string(),
                value,
                decoded,
                tolerance,
            },
            other => CompileError::Codec(other),
        })
}

/// Plans a digital bank: one merged word per tick at which any line is written.
fn plan_bank(dev: &Device, check: bool) -> Result<DevicePlan, CompileError> {
    let lines: Vec<(&Channel, Vec<(usize, f64)>)> =
        dev.channels().values().map(|c| (c, c.expand())).collect();
    let ticks: BTreeSet<usize> = lines
        .iter()
        .flat_map(|(_, samples)| samples.iter().map(|s| s.0))
        .collect();

    let mut cursors = vec![0usize; lines.len()];
    let mut held: Vec<Option<f64>> = vec![None; lines.len()];
    let mut prev_word: Option<u32> = None;
    let mut placed = Vec::new();
    for &tick in ticks.iter() {
        let mut data = 0;
        let mut sources = Vec::new();
        for (k, (chan, samples)) in lines.iter().enumerate() {
            if let Some(&(t, value)) = samples.get(cursors[k]) {
                if t == tick {
                    sources.push((chan.name().to_string(), held[k], Some(value)));
                    held[k] = Some(value);
                    cursors[k] += 1;
                }
            }
            let value = held[k].unwrap_or(chan.default_value());
            let words = encode_values(chan, &[SampleValue::Written(value)], check)?;
            data |= words.first().map_or(0, |w| data_of(*w));
        }
        let word = encode(dev.address(), data);
        if prev_word != Some(word) {
            placed.push(Placed { tick, word, sources });
        }
        prev_word = Some(word);
    }
    Ok(DevicePlan {
        rack: dev.rack(),
        placed,
        last_tick: ticks.last().copied(),
    })
}

/// Plans a device owning its addresses: each channel is placed independently.
fn plan_channels(dev: &Device, check: bool) -> Result<DevicePlan, CompileError> {
    let mut placed = Vec::new();
    let mut last_tick: Option<usize> = None;
    for chan in dev.channels().values() {
        let samples = chan.expand();
        if samples.is_empty() {
            continue;
        }
        let values: Vec<SampleValue> = samples.iter().map(|s| SampleValue::Written(s.1)).collect();
        let words = encode_values(chan, &values, check)?;
        let n = chan.codec().words_per_value();
        let mut prev: Option<(&[u32], f64)> = None;
        for (&(tick, value), chunk) in samples.iter().zip(words.chunks(n)) {
            let changed = prev.map_or(true, |(p, _)| p != chunk);
            if changed {
                for (j, &word) in chunk.iter().enumerate() {
                    placed.push(Placed {
                        tick: tick + j,
                        word,
                        sources: vec![(chan.name().to_string(), prev.map(|p| p.1), Some(value))],
                    });
                }
            }
            prev = Some((chunk, value));
            last_tick = last_tick.max(Some(tick + n - 1));
        }
    }
    Ok(DevicePlan {
        rack: dev.rack(),
        placed,
        last_tick,
    })
}

fn plan_device(dev: &Device, check: bool) -> Result<DevicePlan, CompileError> {
    if dev.shares_address() {
        plan_bank(dev, check)
    } else {
        plan_channels(dev, check)
    }
}

/// Compiles `board`; `stop_time` extends the stream to at least that time.
///
/// # Example
/// ```
/// use fpgacompiler_backend::*;
///
/// let mut cfg = BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary);
/// cfg.auto_strb = false;
/// let mut board = Board::new(cfg).unwrap();
/// board.add_pseudoclock("pc").unwrap();
/// board.add_clockline("pc", "cl").unwrap();
/// board.add_digital_bank("cl", "bank0", 0, 0x05).unwrap();
/// board.add_digital_line("bank0", "do3", 3, false).unwrap();
/// board.channel_("do3").unwrap().constant(1.0, 1e-6, None).unwrap();
/// board.channel_("do3").unwrap().constant(0.0, 3e-6, None).unwrap();
///
/// let compiled = board.compile(None).unwrap();
/// assert_eq!(compiled.times(), vec![0, 1, 3, 4]);
/// assert_eq!(
///     compiled.rack_words(0),
///     vec![BIT_NOP | 0x0005_0008, 0x0005_0008, 0x0005_0000, BIT_NOP]
/// );
/// ```
pub fn compile(board: &Board, stop_time: Option<f64>) -> Result<CompiledBoard, CompileError> {
    let mut timer = TickTimer::new();
    let cfg = board.config();
    let name = cfg.name.clone();
    let rate = cfg.bus_rate;
    let num_racks = cfg.num_racks;
    let strb = strb_mask(cfg.strb_pos);

    let explicit_strb = board.specials().iter().any(|s| s.has_strobe());
    if explicit_strb && cfg.auto_strb {
        return Err(CompileError::StrobeModeConflict { board: name });
    }

    let plans = board
        .devices()
        .map(|dev| plan_device(dev, cfg.check_codecs))
        .collect::<Result<Vec<_>, _>>()?;
    timer.tick_print(&format!("{}: encode channels", name));

    // Time union
    let mut last_used = plans.iter().filter_map(|p| p.last_tick).max();
    for special in board.specials() {
        last_used = last_used.max(special.marks().keys().next_back().copied());
    }
    let needed = last_used.map_or(0, |t| t + 1).max(board.last_instr_end_pos()).max(1);
    let stop = match stop_time {
        Some(t) => {
            let requested = tick_of(t, rate, &format!("stop time of board {}", name))?;
            if requested < needed {
                return Err(CompileError::InvalidTime {
                    what: format!("stop time of board {}", name),
                    time: t,
                    reason: format!(
                        "the last instruction ends at {} s",
                        time_of(needed, rate)
                    ),
                });
            }
            requested
        }
        None => needed,
    };
    if stop > u32::MAX as usize {
        return Err(CompileError::TickOverflow {
            board: name,
            tick: stop,
        });
    }
    let mut union: BTreeSet<usize> = BTreeSet::new();
    union.insert(0);
    union.insert(stop);
    for plan in plans.iter() {
        union.extend(plan.placed.iter().map(|p| p.tick));
    }
    for special in board.specials() {
        union.extend(special.marks().keys().copied());
    }
    let times: Vec<usize> = union.into_iter().collect();
    let index_of = |tick: usize| times.binary_search(&tick).unwrap_or_else(|i| i);
    let num_ticks = times.len();

    // Placement and conflict detection
    let mut words = Array2::<u32>::from_elem((num_ticks, num_racks), NOP_WORD);
    let mut changes = Array2::<bool>::from_elem((num_ticks, num_racks), false);
    let mut conflicts = Array2::<bool>::from_elem((num_ticks, num_racks), false);
    let mut records: Vec<ChangeRecord> = Vec::new();
    for plan in plans.iter() {
        let r = plan.rack;
        for p in plan.placed.iter() {
            let i = index_of(p.tick);
            conflicts[[i, r]] |= changes[[i, r]];
            changes[[i, r]] = true;
            words[[i, r]] = p.word;
            for (channel, old, new) in p.sources.iter() {
                records.push(ChangeRecord {
                    channel: channel.clone(),
                    rack: r,
                    address: address_of(p.word),
                    index: i,
                    time: time_of(p.tick, rate),
                    old: *old,
                    new: *new,
                });
            }
        }
    }
    if conflicts.iter().any(|c| *c) {
        let mut entries = Vec::new();
        for ((i, r), _) in conflicts.indexed_iter().filter(|(_, c)| **c) {
            entries.push(ConflictEntry {
                tick: times[i],
                time: time_of(times[i], rate),
                rack: r,
                records: records
                    .iter()
                    .filter(|rec| rec.index == i && rec.rack == r)
                    .cloned()
                    .collect(),
            });
        }
        let report = ConflictReport {
            board: name,
            entries,
        };
        log::error!("{}", report);
        return Err(CompileError::TimeConflict(report));
    }
    timer.tick_print(&format!("{}: place {} ticks", name, num_ticks));

    // Special markers
    let mut special_bits = Array2::<u32>::zeros((num_ticks, num_racks));
    let mut strb_marks = Array2::<bool>::from_elem((num_ticks, num_racks), false);
    for (r, special) in board.specials().iter().enumerate() {
        for (&tick, bits) in special.marks().iter() {
            let i = index_of(tick);
            for bit in bits {
                match bit {
                    SpecialBit::Strb if i == 0 => {
                        return Err(CompileError::FirstSampleHasStrobe { board: name });
                    }
                    SpecialBit::Strb => strb_marks[[i, r]] = true,
                    other => special_bits[[i, r]] |= other.mask(),
                }
            }
        }
    }

    // Compression
    let has_mark = |i: usize| {
        (0..num_racks).any(|r| special_bits[[i, r]] != 0 || strb_marks[[i, r]])
    };
    let retained: Vec<usize> = (0..num_ticks)
        .filter(|&i| {
            i == 0 || i + 1 == num_ticks || (0..num_racks).any(|r| changes[[i, r]]) || has_mark(i)
        })
        .collect();
    let preload: Vec<u32> = (0..num_racks)
        .map(|r| {
            (0..num_ticks)
                .find(|&i| changes[[i, r]])
                .map_or(0, |i| payload_of(words[[i, r]]))
        })
        .collect();

    let mut data = Array2::<u32>::zeros((retained.len(), num_racks + 1));
    let mut parity = vec![false; num_racks];
    for (k, &i) in retained.iter().enumerate() {
        data[[k, 0]] = times[i] as u32;
        for r in 0..num_racks {
            let mut word = if changes[[i, r]] {
                words[[i, r]]
            } else if i == 0 {
                NOP_WORD | preload[r]
            } else {
                NOP_WORD
            };
            word |= special_bits[[i, r]];
            if cfg.auto_strb {
                if k % 2 == 1 {
                    word |= strb;
                }
            } else {
                if strb_marks[[i, r]] {
                    parity[r] = !parity[r];
                }
                if parity[r] {
                    word |= strb;
                }
            }
            data[[k, r + 1]] = word;
        }
    }
    timer.tick_print(&format!("{}: compress", name));

    let mut channels = IndexMap::new();
    let mut final_values = IndexMap::new();
    let mut crcs = IndexMap::new();
    for chan in board.channels() {
        let column = data.column(chan.rack() + 1);
        let filtered: Vec<u32> = column
            .iter()
            .filter(|w| !is_nop(**w) && address_of(**w) == chan.address())
            .map(|w| payload_of(*w))
            .collect();
        let crc = Crc32::new()
            .update_word(chan.address())
            .update_words(&filtered)
            .finalize();
        crcs.insert(chan.name().to_string(), crc);
        final_values.insert(chan.name().to_string(), chan.final_value());
        channels.insert(
            chan.name().to_string(),
            CompiledChannel {
                kind: chan.kind(),
                rack: chan.rack(),
                props: chan.props(),
                codec: chan.codec().clone(),
            },
        );
    }

    log::info!(
        "board {}: {} samples retained of {} ticks, stop at tick {} ({} s)",
        name,
        retained.len(),
        num_ticks,
        stop,
        time_of(stop, rate)
    );
    Ok(CompiledBoard {
        config: cfg.clone(),
        data,
        final_values,
        crcs,
        worker_args: WorkerOptions::merged(&cfg.defaults, board.worker_args()),
        channels,
        num_ticks,
    })
}

/// Result of compiling one board.
#[derive(Clone, Debug)]
pub struct CompiledBoard {
    config: BoardConfig,
    data: Array2<u32>,
    final_values: IndexMap<String, f64>,
    crcs: IndexMap<String, u32>,
    worker_args: WorkerOptions,
    channels: IndexMap<String, CompiledChannel>,
    num_ticks: usize,
}

impl CompiledBoard {
    pub fn name(&self) -> &str {
        &self.config.name
    }
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }
    pub fn bus_rate(&self) -> f64 {
        self.config.bus_rate
    }
    pub fn num_racks(&self) -> usize {
        self.config.num_racks
    }
    /// The packed matrix, one `[tick, rack words..]` row per sample.
    pub fn data(&self) -> &Array2<u32> {
        &self.data
    }
    pub fn num_samples(&self) -> usize {
        self.data.nrows()
    }
    /// Samples in the time union before compression.
    pub fn num_ticks(&self) -> usize {
        self.num_ticks
    }
    pub fn times(&self) -> Vec<u32> {
        self.data.column(0).to_vec()
    }
    pub fn rack_words(&self, rack: usize) -> Vec<u32> {
        self.data.column(rack + 1).to_vec()
    }
    /// Tick of the last sample.
    pub fn stop_tick(&self) -> u32 {
        self.data.column(0).iter().last().copied().unwrap_or(0)
    }
    /// Run time of one cycle in seconds.
    pub fn duration(&self) -> f64 {
        time_of(self.stop_tick() as usize, self.bus_rate())
    }
    pub fn final_values(&self) -> &IndexMap<String, f64> {
        &self.final_values
    }
    pub fn crcs(&self) -> &IndexMap<String, u32> {
        &self.crcs
    }
    pub fn worker_args(&self) -> &WorkerOptions {
        &self.worker_args
    }
    pub fn channels(&self) -> &IndexMap<String, CompiledChannel> {
        &self.channels
    }

    /// Bytes per sample on the wire: 8 with one rack, 12 with two.
    pub fn bytes_per_sample(&self) -> usize {
        4 * (self.num_racks() + 1)
    }

    /// The WRITE payload: every row, little-endian, row after row.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.data.len() * 4);
        for word in self.data.iter() {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    /// Recovers `(times in seconds, values)` of channel `name` from the compiled stream.
    pub fn decode_channel(&self, name: &str) -> Result<(Vec<f64>, Vec<f64>), CompileError> {
        let chan = self
            .channels
            .get(name)
            .ok_or(CompileError::UnknownChannel {
                board: self.name().to_string(),
                channel: name.to_string(),
            })?;
        let (ticks, values) =
            chan.codec
                .from_words(&chan.props, &self.times(), &self.rack_words(chan.rack));
        let times = ticks
            .iter()
            .map(|t| time_of(*t as usize, self.bus_rate()))
            .collect();
        Ok((times, values))
    }
}

#[cfg(test)]
mod test {
    mod stream {
        use crate::bits::*;
        use crate::board::*;
        use crate::channel::*;
        use crate::config::*;
        use crate::error::CompileError;
        use crate::instruction::Instruction;

        fn board(auto_strb: bool) -> Board {
            let mut cfg = BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary);
            cfg.auto_strb = auto_strb;
            let mut b = Board::new(cfg).unwrap();
            b.add_pseudoclock("pc").unwrap();
            b.add_clockline("pc", "cl").unwrap();
            b
        }

        #[test]
        fn analog_and_bank_share_a_rack() {
            let mut b = board(false);
            b.add_digital_bank("cl", "bank0", 0, 0x05).unwrap();
            b.add_digital_line("bank0", "do0", 0, false).unwrap();
            b.add_digital_line("bank0", "do1", 1, true).unwrap();
            b.add_analog("cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
            b.channel_("do0").unwrap().constant(1.0, 2e-6, None).unwrap();
            b.channel_("ao0").unwrap().constant(5.0, 4e-6, None).unwrap();
            // same value again is not a change
            b.channel_("ao0").unwrap().constant(5.0, 6e-6, None).unwrap();

            let c = b.compile(None).unwrap();
            assert_eq!(c.times(), vec![0, 2, 4, 7]);
            assert_eq!(
                c.rack_words(0),
                vec![NOP_WORD | 0x0005_0003, 0x0005_0003, 0x0010_4000, NOP_WORD]
            );
            assert_eq!(c.final_values()["do0"], 1.0);
            assert_eq!(c.final_values()["do1"], 1.0);
            assert_eq!(c.final_values()["ao0"], 5.0);
            let (times, values) = c.decode_channel("ao0").unwrap();
            assert_eq!(times, vec![4e-6]);
            assert_eq!(values, vec![5.0]);
            assert!(c.decode_channel("ao9").is_err());
        }

        #[test]
        fn auto_strobe_alternates() {
            let mut b = board(true);
            b.add_analog("cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
            for k in 1..5 {
                b.channel_("ao0").unwrap().constant(k as f64, k as f64 * 1e-6, None).unwrap();
            }
            let c = b.compile(None).unwrap();
            let strobes: Vec<bool> = c.rack_words(0).iter().map(|w| is_set(*w, BIT_STRB)).collect();
            assert_eq!(strobes, vec![false, true, false, true, false, true]);
        }

        #[test]
        fn explicit_strobe_parity() {
            let mut b = board(false);
            b.add_analog("cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
            b.channel_("ao0").unwrap().constant(1.0, 1e-6, None).unwrap();
            b.channel_("ao0").unwrap().constant(2.0, 3e-6, None).unwrap();
            b.add_special(0, 2e-6, SpecialBit::Strb).unwrap();
            b.add_special(0, 3e-6, SpecialBit::Strb).unwrap();
            b.add_special(0, 3e-6, SpecialBit::Irq).unwrap();
            let c = b.compile(None).unwrap();
            assert_eq!(c.times(), vec![0, 1, 2, 3, 4]);
            let words = c.rack_words(0);
            let strobes: Vec<bool> = words.iter().map(|w| is_set(*w, BIT_STRB)).collect();
            assert_eq!(strobes, vec![false, false, true, false, false]);
            // a marker without data keeps the rack idle
            assert!(is_nop(words[2]));
            assert!(is_set(words[3], BIT_IRQ));
            assert!(!is_nop(words[3]));
        }

        #[test]
        fn strobe_mode_errors() {
            let mut b = board(true);
            b.add_special(0, 1e-6, SpecialBit::Strb).unwrap();
            assert!(matches!(
                b.compile(None),
                Err(CompileError::StrobeModeConflict { .. })
            ));
            let mut b = board(false);
            b.add_special(0, 0.0, SpecialBit::Strb).unwrap();
            assert!(matches!(
                b.compile(None),
                Err(CompileError::FirstSampleHasStrobe { .. })
            ));
        }

        #[test]
        fn dds_words_fill_consecutive_ticks() {
            let mut b = board(false);
            b.add_dds("cl", "dds0", 0, 0x20, (0.0, f64::NEG_INFINITY, 0.0)).unwrap();
            b.channel_("dds0_freq").unwrap().constant(100e6, 1e-6, None).unwrap();
            b.channel_("dds0_amp").unwrap().constant(0.0, 5e-6, None).unwrap();
            let c = b.compile(None).unwrap();
            assert_eq!(c.times(), vec![0, 1, 2, 3, 5, 6]);
            let ftw: u64 = 28_147_497_671_066;
            let words = c.rack_words(0);
            assert_eq!(words[1], encode(0x20, (ftw & 0xFFFF) as u32));
            assert_eq!(words[2], encode(0x20, ((ftw >> 16) & 0xFFFF) as u32));
            assert_eq!(words[3], encode(0x20, (ftw >> 32) as u32));
            assert_eq!(words[4], encode(0x21, 16383));
            let (_, freqs) = c.decode_channel("dds0_freq").unwrap();
            assert!((freqs[0] - 100e6).abs() < 1e-3);

            // amplitude on a tick still carrying frequency words
            b.channel_("dds0_amp").unwrap().constant(-10.0, 2e-6, None).unwrap();
            let err = b.compile(None).unwrap_err();
            let report = err.conflict_report().unwrap();
            assert_eq!(report.entries[0].tick, 2);
            assert_eq!(report.entries[0].addresses(), vec![0x20, 0x21]);
        }

        #[test]
        fn ramps_and_stop_time() {
            let mut b = board(false);
            b.add_analog("cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
            let ramp = Instruction::new_linramp(0.0, 4.0, 0.0, 4e-6);
            b.channel_("ao0").unwrap().add_instr(ramp, 0.0, Some((4e-6, true))).unwrap();
            let c = b.compile(Some(10e-6)).unwrap();
            assert_eq!(c.times(), vec![0, 1, 2, 3, 4, 10]);
            assert_eq!(c.duration(), 10e-6);
            assert!(b.compile(Some(3e-6)).is_err());
            assert_eq!(c.to_bytes().len(), 6 * 8);
            assert_eq!(&c.to_bytes()[8..12], &1u32.to_le_bytes());
        }

        #[test]
        fn crc_follows_the_channel_words() {
            let mut b = board(false);
            b.add_analog("cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
            b.add_analog("cl", "ao1", 0, 0x11, "DAC712", 0.0).unwrap();
            b.channel_("ao0").unwrap().constant(1.0, 1e-6, None).unwrap();
            let before = b.compile(None).unwrap();
            b.channel_("ao1").unwrap().constant(1.0, 2e-6, None).unwrap();
            let after = b.compile(None).unwrap();
            assert_eq!(before.crcs()["ao0"], after.crcs()["ao0"]);
            assert_ne!(before.crcs()["ao1"], after.crcs()["ao1"]);
        }

        #[test]
        fn empty_board_has_two_samples() {
            let b = board(false);
            let c = b.compile(None).unwrap();
            assert_eq!(c.times(), vec![0, 1]);
            assert_eq!(c.rack_words(0), vec![NOP_WORD, NOP_WORD]);
        }
    }
}
