//! Implements struct and methods corresponding to intermediate devices on the bus. See
//! [`BaseDevice`] for implementation details.
//!
//! An intermediate device sits on one clockline of a board and drives one rack. It is one of:
//!
//! 1. **Digital bank** ([`DeviceKind::DigitalBank`]): up to 16 digital lines sharing one address;
//!    each line is one bit of the payload. Words of the bank are the OR of its lines.
//! 2. **Analog output** ([`DeviceKind::Analog`]): a single DAC channel owning its address. The
//!    codec tag (`AnalogOut`, `DAC712`, `DAC715`, `DAC7744` or any registered tag) selects the
//!    conversion.
//! 3. **DDS** ([`DeviceKind::Dds`]): three sub-channels at `base`, `base + 1`, `base + 2`, with
//!    the whole range `base .. base + 4` reserved. `base` must be a multiple of 4.
//!
//! Address collisions between devices are checked by the board, see [`crate::board`].

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::bits::{DATA_BITS, MAX_ADDRESS};
use crate::channel::*;
use crate::codec::{ChannelProps, Codec, CodecRegistry};
use crate::dds::*;
use crate::error::CompileError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DeviceKind {
    DigitalBank,
    Analog,
    Dds,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                DeviceKind::DigitalBank => "digital bank",
                DeviceKind::Analog => "analog output",
                DeviceKind::Dds => "DDS",
            }
        )
    }
}

/// Name suffixes of the DDS sub-channels, in address order.
pub const DDS_SUFFIXES: [&str; 3] = ["freq", "amp", "phase"];

/// Operations and attributes common to every intermediate device.
///
/// Implementers supply the field methods; channel lookup, edit-state queries and line
/// management come from the default methods.
pub trait BaseDevice {
    // Immutable accessors (getters)
    fn name(&self) -> &str;
    fn kind(&self) -> DeviceKind;
    fn clockline(&self) -> &str;
    fn rack(&self) -> usize;
    /// First address of the device.
    fn address(&self) -> u32;
    fn bus_rate(&self) -> f64;
    fn ramp_step(&self) -> usize;
    fn channels(&self) -> &IndexMap<String, Channel>;
    // Mutable accessors
    fn channels_(&mut self) -> &mut IndexMap<String, Channel>;

    /// Digital banks drive one word from several channels.
    fn shares_address(&self) -> bool {
        self.kind() == DeviceKind::DigitalBank
    }

    /// Addresses the device occupies on its rack.
    fn addresses(&self) -> Vec<u32> {
        match self.kind() {
            DeviceKind::Dds => (self.address()..self.address() + DDS_ADDR_RANGE).collect(),
            _ => vec![self.address()],
        }
    }

    /// Shortcut to borrow channel instance by name
    fn chan(&self, name: &str) -> Option<&Channel> {
        self.channels().get(name)
    }
    /// Shortcut to mutably borrow channel instance by name
    fn chan_(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels_().get_mut(name)
    }

    /// Adds a digital line at payload bit `bit`.
    ///
    /// # Arguments
    /// - `name`: channel name, unique on the board.
    /// - `bit`: bit index within the 16-bit payload, unique within the bank.
    /// - `codec`: the `DigitalOut` codec.
    /// - `default_value`: line state while unwritten, 0 or 1.
    fn add_line(
        &mut self,
        name: &str,
        bit: u32,
        codec: Arc<dyn Codec>,
        default_value: f64,
    ) -> Result<(), CompileError> {
        let invalid = |reason: String| CompileError::InvalidAddressOrChannel {
            what: format!("Line {} of {}", name, self.name()),
            reason,
        };
        if self.kind() != DeviceKind::DigitalBank {
            return Err(invalid(format!("{} {} has no digital lines", self.kind(), self.name())));
        }
        if bit >= DATA_BITS {
            return Err(invalid(format!("bit {} is beyond the {}-bit payload", bit, DATA_BITS)));
        }
        if default_value != 0.0 && default_value != 1.0 {
            return Err(invalid(format!("default {} is not a logic level", default_value)));
        }
        if let Some(other) = self.channels().values().find(|c| c.props().bit == bit) {
            return Err(invalid(format!("bit {} is already used by {}", bit, other.name())));
        }
        if self.channels().contains_key(name) {
            return Err(CompileError::DuplicateName {
                owner: self.name().to_string(),
                name: name.to_string(),
            });
        }
        let chan = Channel::new(
            name,
            ChannelKind::Digital,
            self.rack(),
            ChannelProps::new(self.address(), bit),
            codec,
            self.bus_rate(),
            self.ramp_step(),
            default_value,
        );
        self.channels_().insert(name.to_string(), chan);
        Ok(())
    }

    /// A device is marked edited if any of its channels is edited.
    fn is_edited(&self) -> bool {
        self.channels().values().any(|c| c.is_edited())
    }

    fn clear_edit_cache(&mut self) {
        for chan in self.channels_().values_mut() {
            chan.clear_edit_cache();
        }
    }

    fn last_instr_end_pos(&self) -> usize {
        self.channels()
            .values()
            .map(|c| c.last_instr_end_pos())
            .fold(0, usize::max)
    }
}

pub struct Device {
    name: String,
    kind: DeviceKind,
    clockline: String,
    rack: usize,
    address: u32,
    bus_rate: f64,
    ramp_step: usize,
    channels: IndexMap<String, Channel>,
}

impl BaseDevice for Device {
    fn name(&self) -> &str {
        &self.name
    }
    fn kind(&self) -> DeviceKind {
        self.kind
    }
    fn clockline(&self) -> &str {
        &self.clockline
    }
    fn rack(&self) -> usize {
        self.rack
    }
    fn address(&self) -> u32 {
        self.address
    }
    fn bus_rate(&self) -> f64 {
        self.bus_rate
    }
    fn ramp_step(&self) -> usize {
        self.ramp_step
    }
    fn channels(&self) -> &IndexMap<String, Channel> {
        &self.channels
    }
    fn channels_(&mut self) -> &mut IndexMap<String, Channel> {
        &mut self.channels
    }
}

/// Placement of a device on a board: clockline, rack, first address, and the board's
/// bus rate and ramp step.
#[derive(Clone, Debug)]
pub struct Placement {
    pub clockline: String,
    pub rack: usize,
    pub address: u32,
    pub bus_rate: f64,
    pub ramp_step: usize,
}

fn check_address(name: &str, address: u32, span: u32) -> Result<(), CompileError> {
    if address + span - 1 > MAX_ADDRESS {
        return Err(CompileError::InvalidAddressOrChannel {
            what: format!("Device {}", name),
            reason: format!("address {:#04x} is beyond {:#04x}", address + span - 1, MAX_ADDRESS),
        });
    }
    Ok(())
}

impl Device {
    fn new(name: &str, kind: DeviceKind, at: &Placement) -> Self {
        Self {
            name: name.to_string(),
            kind,
            clockline: at.clockline.clone(),
            rack: at.rack,
            address: at.address,
            bus_rate: at.bus_rate,
            ramp_step: at.ramp_step,
            channels: IndexMap::new(),
        }
    }

    /// Empty digital bank; lines are added with [`BaseDevice::add_line`].
    pub fn digital_bank(name: &str, at: &Placement) -> Result<Self, CompileError> {
        check_address(name, at.address, 1)?;
        Ok(Self::new(name, DeviceKind::DigitalBank, at))
    }

    /// Analog output with a single channel named `name`.
    pub fn analog(
        name: &str,
        at: &Placement,
        codec: Arc<dyn Codec>,
        default_value: f64,
    ) -> Result<Self, CompileError> {
        check_address(name, at.address, 1)?;
        let mut dev = Self::new(name, DeviceKind::Analog, at);
        let chan = Channel::new(
            name,
            ChannelKind::Analog,
            at.rack,
            ChannelProps::new(at.address, 0),
            codec,
            at.bus_rate,
            at.ramp_step,
            default_value,
        );
        dev.channels.insert(name.to_string(), chan);
        Ok(dev)
    }

    /// DDS with sub-channels `{name}_freq`, `{name}_amp` and `{name}_phase`.
    ///
    /// `defaults` are the frequency (Hz), amplitude (dBm) and phase (degrees) while unwritten.
    pub fn dds(
        name: &str,
        at: &Placement,
        registry: &CodecRegistry,
        defaults: (f64, f64, f64),
    ) -> Result<Self, CompileError> {
        if at.address % DDS_ADDR_RANGE != 0 {
            return Err(CompileError::InvalidAddressOrChannel {
                what: format!("DDS {}", name),
                reason: format!(
                    "base address {:#04x} is not a multiple of {}",
                    at.address, DDS_ADDR_RANGE
                ),
            });
        }
        check_address(name, at.address, DDS_ADDR_RANGE)?;
        let mut dev = Self::new(name, DeviceKind::Dds, at);
        let subs = [
            (DDS_SUFFIXES[0], ChannelKind::DdsFreq, "DDS_FREQ", DDS_FREQ_OFFSET, defaults.0),
            (DDS_SUFFIXES[1], ChannelKind::DdsAmp, "DDS_AMP", DDS_AMP_OFFSET, defaults.1),
            (DDS_SUFFIXES[2], ChannelKind::DdsPhase, "DDS_PHASE", DDS_PHASE_OFFSET, defaults.2),
        ];
        for (suffix, kind, tag, offset, default_value) in subs {
            let chan_name = format!("{}_{}", name, suffix);
            let chan = Channel::new(
                &chan_name,
                kind,
                at.rack,
                ChannelProps::new(at.address + offset, 0),
                registry.get(tag)?,
                at.bus_rate,
                at.ramp_step,
                default_value,
            );
            dev.channels.insert(chan_name, chan);
        }
        Ok(dev)
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("clockline", &self.clockline)
            .field("rack", &self.rack)
            .field("address", &self.address)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .finish()
    }
}
