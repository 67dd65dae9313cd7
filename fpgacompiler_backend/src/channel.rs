//! Output channels and their instruction books.
//!
//! A channel is one logical output of a device: a digital line of a bank, an analog output or
//! one sub-channel (frequency, amplitude, phase) of a DDS. It owns the instructions added during
//! editing and expands them into the discrete written samples the compiler places on the bus.
//! Behavior lives in the default methods of [`BaseChannel`]; [`Channel`] only supplies fields.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::codec::{ChannelProps, Codec};
use crate::error::CompileError;
use crate::instruction::*;
use crate::utils::*;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Digital,
    Analog,
    DdsFreq,
    DdsAmp,
    DdsPhase,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ChannelKind::Digital => "DigitalOut",
                ChannelKind::Analog => "AnalogOut",
                ChannelKind::DdsFreq => "DDS frequency",
                ChannelKind::DdsAmp => "DDS amplitude",
                ChannelKind::DdsPhase => "DDS phase",
            }
        )
    }
}

pub trait BaseChannel {
    // Field methods
    fn name(&self) -> &str;
    fn kind(&self) -> ChannelKind;
    fn rack(&self) -> usize;
    fn props(&self) -> ChannelProps;
    fn codec(&self) -> &Arc<dyn Codec>;
    fn bus_rate(&self) -> f64;
    fn ramp_step(&self) -> usize;
    fn default_value(&self) -> f64;
    fn instr_list(&self) -> &BTreeSet<InstrBook>;
    // Mutable field references
    fn instr_list_(&mut self) -> &mut BTreeSet<InstrBook>;

    fn address(&self) -> u32 {
        self.props().address
    }
    fn is_edited(&self) -> bool {
        !self.instr_list().is_empty()
    }
    fn clear_edit_cache(&mut self) {
        self.instr_list_().clear();
    }

    /// Exclusive end tick of the last instruction.
    fn last_instr_end_pos(&self) -> usize {
        self.instr_list().last().map_or(0, |book| book.end_pos)
    }

    fn last_instr_end_time(&self) -> f64 {
        time_of(self.last_instr_end_pos(), self.bus_rate())
    }

    /// Base method through which instructions are added.
    ///
    /// # Arguments
    /// - `instr`: the instruction.
    /// - `t`: start time in seconds.
    /// - `dur_spec`: `Some((duration, keep_val))` covers `[t, t + duration)`; `None` is a single
    ///   "go" write whose value is held.
    ///
    /// Instructions may not overlap: adding one that starts inside another's interval fails.
    fn add_instr(
        &mut self,
        instr: Instruction,
        t: f64,
        dur_spec: Option<(f64, bool)>,
    ) -> Result<(), CompileError> {
        let what = format!("channel {}", self.name());
        let start_pos = tick_of(t, self.bus_rate(), &what)?;
        let (end_pos, keep_val) = match dur_spec {
            Some((duration, keep_val)) => {
                (start_pos + tick_of(duration, self.bus_rate(), &what)?, keep_val)
            }
            None => (start_pos + 1, true),
        };
        let new_book = InstrBook::new(start_pos, end_pos, self.ramp_step(), keep_val, instr)?;

        let overlap = |existing: &InstrBook| CompileError::DuplicateInstruction {
            channel: self.name().to_string(),
            new: new_book.to_string(),
            existing: existing.to_string(),
        };
        if let Some(next) = self.instr_list().range(&new_book..).next() {
            if next.start_pos < new_book.end_pos {
                return Err(overlap(next));
            }
        }
        if let Some(prev) = self.instr_list().range(..&new_book).next_back() {
            if prev.end_pos > new_book.start_pos {
                return Err(overlap(prev));
            }
        }
        self.instr_list_().insert(new_book);
        Ok(())
    }

    fn constant(
        &mut self,
        value: f64,
        t: f64,
        dur_spec: Option<(f64, bool)>,
    ) -> Result<(), CompileError> {
        self.add_instr(Instruction::new_const(value), t, dur_spec)
    }

    /// Written samples `(tick, value)` in increasing tick order.
    ///
    /// Constant instructions produce one sample at their start. Other instructions are sampled
    /// every `ramp_step` ticks within their interval. After an interval the channel either
    /// returns to its default (`keep_val == false`) or, for non-constant instructions, settles
    /// on the value reached at `end_pos`. A sample at `end_pos` is dropped when the next
    /// instruction starts there.
    fn expand(&self) -> Vec<(usize, f64)> {
        let rate = self.bus_rate();
        let books: Vec<&InstrBook> = self.instr_list().iter().collect();
        let mut samples = Vec::new();
        for (i, book) in books.iter().enumerate() {
            for tick in book.sample_ticks() {
                samples.push((tick, book.instr.eval_at(time_of(tick, rate))));
            }
            let next_starts_at_end = books
                .get(i + 1)
                .map_or(false, |next| next.start_pos == book.end_pos);
            if next_starts_at_end {
                continue;
            }
            if !book.keep_val {
                samples.push((book.end_pos, self.default_value()));
            } else if !book.instr.is_const() {
                samples.push((book.end_pos, book.instr.eval_at(time_of(book.end_pos, rate))));
            }
        }
        samples
    }

    /// Last written value, or the default if nothing is written.
    fn final_value(&self) -> f64 {
        self.expand()
            .last()
            .map_or(self.default_value(), |(_, value)| *value)
    }
}

pub struct Channel {
    name: String,
    kind: ChannelKind,
    rack: usize,
    props: ChannelProps,
    codec: Arc<dyn Codec>,
    bus_rate: f64,
    ramp_step: usize,
    default_value: f64,
    instr_list: BTreeSet<InstrBook>,
}

impl BaseChannel for Channel {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> ChannelKind {
        self.kind
    }
    fn rack(&self) -> usize {
        self.rack
    }
    fn props(&self) -> ChannelProps {
        self.props
    }
    fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }
    fn bus_rate(&self) -> f64 {
        self.bus_rate
    }
    fn ramp_step(&self) -> usize {
        self.ramp_step
    }
    fn default_value(&self) -> f64 {
        self.default_value
    }
    fn instr_list(&self) -> &BTreeSet<InstrBook> {
        &self.instr_list
    }
    fn instr_list_(&mut self) -> &mut BTreeSet<InstrBook> {
        &mut self.instr_list
    }
}

impl Channel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        kind: ChannelKind,
        rack: usize,
        props: ChannelProps,
        codec: Arc<dyn Codec>,
        bus_rate: f64,
        ramp_step: usize,
        default_value: f64,
    ) -> Self {
        Self {
            name: name.to_string(),
            kind,
            rack,
            props,
            codec,
            bus_rate,
            ramp_step: ramp_step.max(1),
            default_value,
            instr_list: BTreeSet::new(),
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("rack", &self.rack)
            .field("props", &self.props)
            .field("codec", &self.codec.tag())
            .field("instructions", &self.instr_list.len())
            .finish()
    }
}
