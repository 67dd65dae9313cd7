//! The device tree of one board: pseudoclocks, clocklines, intermediate devices and per-rack
//! special channels.
//!
//! A [`Board`] owns its [`BoardConfig`], a [`CodecRegistry`] and the in-script worker options.
//! Devices are registered through the `add_*` methods, which enforce the address rules of the
//! bus: addresses fit in 7 bits, and no two devices on one rack share an address (a DDS claims
//! four). Channel and device names are unique on the board.
//!
//! Editing happens on channels (see [`crate::channel::BaseChannel`]); compiling turns the tree
//! into a packed stream, see [`crate::compiler`].

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::bits::SpecialBit;
use crate::channel::*;
use crate::codec::{Codec, CodecRegistry};
use crate::compiler::{self, CompiledBoard};
use crate::config::*;
use crate::device::*;
use crate::error::CompileError;
use crate::utils::*;

/// A group of devices updated from one clock output.
#[derive(Debug)]
pub struct ClockLine {
    name: String,
    devices: IndexMap<String, Device>,
}

impl ClockLine {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            devices: IndexMap::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn devices(&self) -> &IndexMap<String, Device> {
        &self.devices
    }
}

#[derive(Debug)]
pub struct PseudoClock {
    name: String,
    clocklines: IndexMap<String, ClockLine>,
}

impl PseudoClock {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            clocklines: IndexMap::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn clocklines(&self) -> &IndexMap<String, ClockLine> {
        &self.clocklines
    }
}

/// Special-bit markers of one rack, keyed by tick.
#[derive(Clone, Debug, Default)]
pub struct SpecialChannel {
    marks: BTreeMap<usize, Vec<SpecialBit>>,
}

impl SpecialChannel {
    pub fn mark(&mut self, tick: usize, bit: SpecialBit) {
        let bits = self.marks.entry(tick).or_default();
        if !bits.contains(&bit) {
            bits.push(bit);
        }
    }
    pub fn marks(&self) -> &BTreeMap<usize, Vec<SpecialBit>> {
        &self.marks
    }
    pub fn has_strobe(&self) -> bool {
        self.marks.values().any(|bits| bits.contains(&SpecialBit::Strb))
    }
    pub fn clear(&mut self) {
        self.marks.clear();
    }
}

#[derive(Debug)]
pub struct Board {
    config: BoardConfig,
    registry: CodecRegistry,
    pseudoclocks: IndexMap<String, PseudoClock>,
    specials: Vec<SpecialChannel>,
    worker_args: WorkerOptions,
}

impl Board {
    /// Board with the built-in codecs.
    pub fn new(config: BoardConfig) -> Result<Self, CompileError> {
        Self::with_registry(config, CodecRegistry::default())
    }

    pub fn with_registry(config: BoardConfig, registry: CodecRegistry) -> Result<Self, CompileError> {
        config.validate()?;
        let specials = vec![SpecialChannel::default(); config.num_racks];
        Ok(Self {
            config,
            registry,
            pseudoclocks: IndexMap::new(),
            specials,
            worker_args: WorkerOptions::default(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }
    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }
    pub fn registry_(&mut self) -> &mut CodecRegistry {
        &mut self.registry
    }
    pub fn pseudoclocks(&self) -> &IndexMap<String, PseudoClock> {
        &self.pseudoclocks
    }
    pub fn specials(&self) -> &[SpecialChannel] {
        &self.specials
    }
    /// Worker options set in-script.
    pub fn worker_args(&self) -> &WorkerOptions {
        &self.worker_args
    }

    pub fn add_pseudoclock(&mut self, name: &str) -> Result<(), CompileError> {
        if self.pseudoclocks.contains_key(name) {
            return Err(self.duplicate(name));
        }
        self.pseudoclocks.insert(name.to_string(), PseudoClock::new(name));
        Ok(())
    }

    pub fn add_clockline(&mut self, pseudoclock: &str, name: &str) -> Result<(), CompileError> {
        if self.clockline(name).is_some() {
            return Err(self.duplicate(name));
        }
        let board = self.name().to_string();
        let pc = self
            .pseudoclocks
            .get_mut(pseudoclock)
            .ok_or(CompileError::UnknownClockLine {
                board,
                clockline: pseudoclock.to_string(),
            })?;
        pc.clocklines.insert(name.to_string(), ClockLine::new(name));
        Ok(())
    }

    fn duplicate(&self, name: &str) -> CompileError {
        CompileError::DuplicateName {
            owner: format!("board {}", self.name()),
            name: name.to_string(),
        }
    }

    fn clockline(&self, name: &str) -> Option<&ClockLine> {
        self.pseudoclocks
            .values()
            .find_map(|pc| pc.clocklines.get(name))
    }

    fn clockline_(&mut self, name: &str) -> Result<&mut ClockLine, CompileError> {
        let board = self.name().to_string();
        self.pseudoclocks
            .values_mut()
            .find_map(|pc| pc.clocklines.get_mut(name))
            .ok_or(CompileError::UnknownClockLine {
                board,
                clockline: name.to_string(),
            })
    }

    /// Every device of the board, in registration order per clockline.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.pseudoclocks
            .values()
            .flat_map(|pc| pc.clocklines.values())
            .flat_map(|cl| cl.devices.values())
    }

    fn devices_(&mut self) -> impl Iterator<Item = &mut Device> {
        self.pseudoclocks
            .values_mut()
            .flat_map(|pc| pc.clocklines.values_mut())
            .flat_map(|cl| cl.devices.values_mut())
    }

    pub fn device(&self, name: &str) -> Result<&Device, CompileError> {
        self.devices()
            .find(|dev| dev.name() == name)
            .ok_or(CompileError::UnknownDevice {
                board: self.name().to_string(),
                device: name.to_string(),
            })
    }

    pub fn device_(&mut self, name: &str) -> Result<&mut Device, CompileError> {
        let board = self.name().to_string();
        self.devices_()
            .find(|dev| dev.name() == name)
            .ok_or(CompileError::UnknownDevice {
                board,
                device: name.to_string(),
            })
    }

    /// Every channel of the board.
    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.devices().flat_map(|dev| dev.channels().values())
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels().map(|c| c.name().to_string()).collect()
    }

    pub fn channel(&self, name: &str) -> Result<&Channel, CompileError> {
        self.channels()
            .find(|c| c.name() == name)
            .ok_or(CompileError::UnknownChannel {
                board: self.name().to_string(),
                channel: name.to_string(),
            })
    }

    pub fn channel_(&mut self, name: &str) -> Result<&mut Channel, CompileError> {
        let board = self.name().to_string();
        self.devices_()
            .flat_map(|dev| dev.channels_().values_mut())
            .find(|c| c.name() == name)
            .ok_or(CompileError::UnknownChannel {
                board,
                channel: name.to_string(),
            })
    }

    fn placement(&self, clockline: &str, rack: usize, address: u32) -> Result<Placement, CompileError> {
        if self.clockline(clockline).is_none() {
            return Err(CompileError::UnknownClockLine {
                board: self.name().to_string(),
                clockline: clockline.to_string(),
            });
        }
        if rack >= self.config.num_racks {
            return Err(CompileError::InvalidAddressOrChannel {
                what: format!("Rack {} of board {}", rack, self.name()),
                reason: format!("the board has {} rack(s)", self.config.num_racks),
            });
        }
        Ok(Placement {
            clockline: clockline.to_string(),
            rack,
            address,
            bus_rate: self.config.bus_rate,
            ramp_step: self.config.ramp_step(),
        })
    }

    /// Fails if `name` is taken or any address of `dev` is already used on its rack.
    fn check_new_device(&self, dev: &Device) -> Result<(), CompileError> {
        let taken = self.devices().any(|d| d.name() == dev.name())
            || dev
                .channels()
                .keys()
                .any(|c| self.channel(c).is_ok() || self.devices().any(|d| d.name() == c));
        if taken {
            return Err(self.duplicate(dev.name()));
        }
        for other in self.devices().filter(|d| d.rack() == dev.rack()) {
            let used = other.addresses();
            if let Some(address) = dev.addresses().into_iter().find(|a| used.contains(a)) {
                return Err(CompileError::AddressCollision {
                    board: self.name().to_string(),
                    rack: dev.rack(),
                    address,
                    device: dev.name().to_string(),
                    other: other.name().to_string(),
                });
            }
        }
        Ok(())
    }

    fn insert_device(&mut self, dev: Device) -> Result<(), CompileError> {
        self.check_new_device(&dev)?;
        let clockline = dev.clockline().to_string();
        log::debug!(
            "board {}: {} {} on rack {} at {:#04x}",
            self.name(),
            dev.kind(),
            dev.name(),
            dev.rack(),
            dev.address()
        );
        self.clockline_(&clockline)?
            .devices
            .insert(dev.name().to_string(), dev);
        Ok(())
    }

    pub fn add_digital_bank(
        &mut self,
        clockline: &str,
        name: &str,
        rack: usize,
        address: u32,
    ) -> Result<(), CompileError> {
        let at = self.placement(clockline, rack, address)?;
        self.insert_device(Device::digital_bank(name, &at)?)
    }

    /// Adds line `name` at payload bit `bit` of digital bank `bank`.
    pub fn add_digital_line(
        &mut self,
        bank: &str,
        name: &str,
        bit: u32,
        default_value: bool,
    ) -> Result<(), CompileError> {
        if self.channel(name).is_ok() || self.device(name).is_ok() {
            return Err(self.duplicate(name));
        }
        let codec = self.registry.get("DigitalOut")?;
        let default_value = if default_value { 1.0 } else { 0.0 };
        self.device_(bank)?.add_line(name, bit, codec, default_value)
    }

    /// Adds an analog output using the codec registered under `codec_tag`.
    pub fn add_analog(
        &mut self,
        clockline: &str,
        name: &str,
        rack: usize,
        address: u32,
        codec_tag: &str,
        default_value: f64,
    ) -> Result<(), CompileError> {
        let at = self.placement(clockline, rack, address)?;
        let codec: Arc<dyn Codec> = self.registry.get(codec_tag)?;
        self.insert_device(Device::analog(name, &at, codec, default_value)?)
    }

    /// Adds a DDS at `base_address` with `(frequency, amplitude, phase)` defaults.
    pub fn add_dds(
        &mut self,
        clockline: &str,
        name: &str,
        rack: usize,
        base_address: u32,
        defaults: (f64, f64, f64),
    ) -> Result<(), CompileError> {
        let at = self.placement(clockline, rack, base_address)?;
        let dev = Device::dds(name, &at, &self.registry, defaults)?;
        self.insert_device(dev)
    }

    /// Attaches `bit` to the sample at time `t` on `rack`.
    pub fn add_special(&mut self, rack: usize, t: f64, bit: SpecialBit) -> Result<(), CompileError> {
        let tick = tick_of(t, self.config.bus_rate, &format!("{} marker on board {}", bit, self.name()))?;
        let board = self.name().to_string();
        let num_racks = self.config.num_racks;
        let special = self
            .specials
            .get_mut(rack)
            .ok_or(CompileError::InvalidAddressOrChannel {
                what: format!("Rack {} of board {}", rack, board),
                reason: format!("the board has {} rack(s)", num_racks),
            })?;
        special.mark(tick, bit);
        Ok(())
    }

    /// Merges `options` into the in-script worker options.
    pub fn set_worker_options(&mut self, options: &WorkerOptions) {
        self.worker_args = WorkerOptions::merged(&self.worker_args, options);
    }

    pub fn is_edited(&self) -> bool {
        self.devices().any(|dev| dev.is_edited())
            || self.specials.iter().any(|s| !s.marks().is_empty())
    }

    /// Drops every instruction, marker and in-script option.
    pub fn clear_edit_cache(&mut self) {
        self.devices_().for_each(|dev| dev.clear_edit_cache());
        self.specials.iter_mut().for_each(|s| s.clear());
        self.worker_args = WorkerOptions::default();
    }

    /// Exclusive end tick of the last instruction or marker.
    pub fn last_instr_end_pos(&self) -> usize {
        let marks = self
            .specials
            .iter()
            .filter_map(|s| s.marks().keys().next_back())
            .map(|tick| tick + 1)
            .fold(0, usize::max);
        self.devices()
            .map(|dev| dev.last_instr_end_pos())
            .fold(marks, usize::max)
    }

    pub fn last_instr_end_time(&self) -> f64 {
        time_of(self.last_instr_end_pos(), self.config.bus_rate)
    }

    /// Compiles the board. `stop_time` extends the stream to at least that time.
    pub fn compile(&self, stop_time: Option<f64>) -> Result<CompiledBoard, CompileError> {
        compiler::compile(self, stop_time)
    }
}

#[cfg(test)]
mod test {
    mod tree {
        use crate::board::*;

        fn board() -> Board {
            let mut board = Board::new(BoardConfig::new("main", "10.0.0.2", 1e6, 2, Role::Primary)).unwrap();
            board.add_pseudoclock("pc").unwrap();
            board.add_clockline("pc", "cl").unwrap();
            board
        }

        #[test]
        fn address_collisions() {
            let mut b = board();
            b.add_dds("cl", "dds0", 0, 0x20, (0.0, f64::NEG_INFINITY, 0.0)).unwrap();
            match b.add_analog("cl", "ao0", 0, 0x22, "DAC712", 0.0) {
                Err(CompileError::AddressCollision { address, other, .. }) => {
                    assert_eq!(address, 0x22);
                    assert_eq!(other, "dds0");
                }
                other => panic!("unexpected {:?}", other),
            }
            // same address on the other rack is fine
            b.add_analog("cl", "ao0", 1, 0x22, "DAC712", 0.0).unwrap();
            assert!(b.add_analog("cl", "ao1", 2, 0x30, "DAC712", 0.0).is_err());
            assert!(b.add_analog("cl", "ao2", 0, 0x30, "AD5791", 0.0).is_err());
        }

        #[test]
        fn lookup_and_names() {
            let mut b = board();
            b.add_digital_bank("cl", "bank0", 0, 0x05).unwrap();
            b.add_digital_line("bank0", "shutter", 3, false).unwrap();
            b.add_digital_line("bank0", "trigger", 4, true).unwrap();
            assert!(b.add_digital_line("bank0", "shutter", 5, false).is_err());
            assert!(b.add_digital_line("bank1", "other", 5, false).is_err());
            assert!(b.add_digital_bank("nowhere", "bank1", 0, 0x06).is_err());
            assert_eq!(b.channel_names(), vec!["shutter", "trigger"]);
            assert_eq!(b.channel("trigger").unwrap().default_value(), 1.0);
            assert!(matches!(
                b.channel("laser"),
                Err(CompileError::UnknownChannel { .. })
            ));
        }

        #[test]
        fn edit_state() {
            let mut b = board();
            b.add_analog("cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
            assert!(!b.is_edited());
            b.channel_("ao0").unwrap().constant(1.0, 2e-6, None).unwrap();
            b.add_special(1, 9e-6, SpecialBit::Stop).unwrap();
            assert!(b.is_edited());
            assert_eq!(b.last_instr_end_pos(), 10);
            assert!(b.add_special(2, 1e-6, SpecialBit::Irq).is_err());
            b.clear_edit_cache();
            assert!(!b.is_edited());
            assert_eq!(b.last_instr_end_time(), 0.0);
        }
    }
}
