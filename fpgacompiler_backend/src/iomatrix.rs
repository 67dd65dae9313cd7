//! Routing of board inputs and outputs.
//!
//! The board has two 32-bit input routing registers (`ctrl_in_0`, `ctrl_in_1`) and two 32-bit
//! output routing registers (`ctrl_out_0`, `ctrl_out_1`). Each register holds four 8-bit fields,
//! byte 0 first, and each field routes one *source* to one *destination*:
//!
//! ```text
//! field = source_code | level_code << 6
//! ```
//!
//! | register     | byte 0          | byte 1          | byte 2            | byte 3       |
//! |--------------|-----------------|-----------------|-------------------|--------------|
//! | `ctrl_in_0`  | `trigger_start` | `trigger_stop`  | `trigger_restart` | reserved     |
//! | `ctrl_in_1`  | `bit_NOP`       | `bit_IRQ`       | `bit_STRB`        | reserved     |
//! | `ctrl_out_0` | `output_0`      | `output_1`      | `output_2`        | `bus_enable_0` |
//! | `ctrl_out_1` | `bus_enable_1`  | `LED_R`         | `LED_G`           | `LED_B`      |
//!
//! Which sources and levels a destination accepts is held in an [`IoTable`], so a firmware
//! revision only needs a new table. A field value of zero is the default route of every
//! destination: [`IoTable::decode`] leaves it out, so [`IoTable::encode`] refuses it. Use
//! [`IoTable::merge`] to put a destination back on its default route.

use std::fmt;
use std::str::FromStr;

use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const FIELD_BITS: u32 = 8;
pub const FIELD_MASK: u32 = (1 << FIELD_BITS) - 1;
pub const SOURCE_MASK: u32 = 0x3F;
pub const LEVEL_SHIFT: u32 = 6;
pub const FIELDS_PER_REGISTER: usize = 4;
pub const DATA_TAP_BASE: u32 = 32;
pub const DATA_TAPS: u32 = 32;

/// Values of the two routing registers of one direction.
pub type Registers = [u32; 2];

/// `{destination -> route}`, ordered as inserted.
pub type Selection = IndexMap<String, Route>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Direction::Input => "input",
                Direction::Output => "output",
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum IoMatrixError {
    #[error("Unknown {direction} destination \"{name}\". Known destinations are {known:?}")]
    UnknownDestination {
        direction: Direction,
        name: String,
        known: Vec<String>,
    },
    #[error("Unknown source \"{source_name}\" for {destination}")]
    UnknownSource {
        destination: String,
        source_name: String,
    },
    #[error("Unknown level \"{level}\" for {destination}")]
    UnknownLevel { destination: String, level: String },
    #[error("Source \"{source_name}\" cannot drive {destination}")]
    SourceNotAllowed {
        destination: String,
        source_name: String,
    },
    #[error("Level \"{level}\" is not allowed on {destination}")]
    LevelNotAllowed { destination: String, level: String },
    #[error("Invalid {direction} routing field {value:#04x} in register {register}, byte {field}")]
    InvalidField {
        direction: Direction,
        register: usize,
        field: usize,
        value: u32,
    },
    #[error("Cannot parse route \"{0}\": expected \"source\" or \"source:level\"")]
    BadRoute(String),
    #[error("\"{route}\" is the default route of {destination}; leave {destination} out instead")]
    DefaultRoute { destination: String, route: String },
}

lazy_static! {
    static ref ROUTE_RE: Result<Regex, regex::Error> =
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*(?::\s*([A-Za-z_]+)\s*)?$");
}

/// One routing choice: a source name and a level name.
///
/// Written as `"source"` (level `"level"`) or `"source:level"`.
///
/// # Example
/// ```
/// use fpgacompiler_backend::iomatrix::Route;
///
/// let route: Route = "in0:rising".parse().unwrap();
/// assert_eq!(route, Route::new("in0", "rising"));
/// assert_eq!(route.to_string(), "in0:rising");
/// assert_eq!("run".parse::<Route>().unwrap().to_string(), "run");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Route {
    pub source: String,
    pub level: String,
}

pub const DEFAULT_LEVEL: &str = "level";

impl Route {
    pub fn new(source: &str, level: &str) -> Self {
        Self {
            source: source.to_string(),
            level: level.to_string(),
        }
    }

    pub fn source(source: &str) -> Self {
        Self::new(source, DEFAULT_LEVEL)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.level == DEFAULT_LEVEL {
            write!(f, "{}", self.source)
        } else {
            write!(f, "{}:{}", self.source, self.level)
        }
    }
}

impl FromStr for Route {
    type Err = IoMatrixError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let re = ROUTE_RE
            .as_ref()
            .map_err(|e| IoMatrixError::BadRoute(e.to_string()))?;
        let caps = re
            .captures(s)
            .ok_or_else(|| IoMatrixError::BadRoute(s.to_string()))?;
        let source = &caps[1];
        let level = caps.get(2).map_or(DEFAULT_LEVEL, |m| m.as_str());
        Ok(Route::new(source, level))
    }
}

impl Serialize for Route {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Route {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Position and permitted values of one destination field.
#[derive(Clone, Debug)]
pub struct Destination {
    pub register: usize,
    pub field: usize,
    sources: Vec<u32>,
    levels: Vec<u32>,
}

impl Destination {
    pub fn new(register: usize, field: usize, sources: Vec<u32>, levels: Vec<u32>) -> Self {
        Self {
            register,
            field,
            sources,
            levels,
        }
    }

    pub fn accepts(&self, source: u32, level: u32) -> bool {
        self.sources.contains(&source) && self.levels.contains(&level)
    }

    fn shift(&self) -> u32 {
        self.field as u32 * FIELD_BITS
    }

    fn read(&self, regs: &Registers) -> u32 {
        (regs[self.register] >> self.shift()) & FIELD_MASK
    }

    fn write(&self, regs: &mut Registers, value: u32) {
        let shift = self.shift();
        regs[self.register] = (regs[self.register] & !(FIELD_MASK << shift)) | ((value & FIELD_MASK) << shift);
    }
}

/// Routing table of one direction: named sources, named levels and destinations.
#[derive(Clone, Debug)]
pub struct IoTable {
    direction: Direction,
    sources: IndexMap<String, u32>,
    levels: IndexMap<String, u32>,
    destinations: IndexMap<String, Destination>,
}

const INPUT_SOURCES: [&str; 4] = ["none", "in0", "in1", "in2"];
const INPUT_LEVELS: [&str; 4] = ["level", "inverted", "rising", "falling"];

const OUTPUT_SOURCES: [&str; 24] = [
    "fixed_low",
    "fixed_high",
    "sync_out",
    "sync_en",
    "sync_mon",
    "clk_locked",
    "clk_ext_used",
    "run",
    "wait",
    "end",
    "error",
    "restart",
    "trg_start",
    "trg_stop",
    "trg_restart",
    "strb_0",
    "strb_1",
    "irq_tx",
    "irq_rx",
    "irq_fpga",
    "irq_state",
    "tx_full",
    "rx_full",
    "ready",
];
const OUTPUT_LEVELS: [&str; 2] = ["level", "inverted"];
const BUS_ENABLE_SOURCES: [&str; 6] = ["fixed_low", "fixed_high", "run", "wait", "ready", "sync_en"];

fn data_taps() -> impl Iterator<Item = (String, u32)> {
    (0..DATA_TAPS).map(|i| (format!("data_{}", i), DATA_TAP_BASE + i))
}

impl IoTable {
    pub fn new(
        direction: Direction,
        sources: IndexMap<String, u32>,
        levels: IndexMap<String, u32>,
        destinations: IndexMap<String, Destination>,
    ) -> Self {
        Self {
            direction,
            sources,
            levels,
            destinations,
        }
    }

    /// Table of the current firmware for `direction`.
    pub fn for_direction(direction: Direction) -> Self {
        match direction {
            Direction::Input => Self::inputs(),
            Direction::Output => Self::outputs(),
        }
    }

    pub fn inputs() -> Self {
        let mut sources: IndexMap<String, u32> = INPUT_SOURCES
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();
        sources.extend(data_taps());
        let levels: IndexMap<String, u32> = INPUT_LEVELS
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();

        let triggers: Vec<u32> = (0..INPUT_SOURCES.len() as u32).collect();
        let taps: Vec<u32> = std::iter::once(0)
            .chain(DATA_TAP_BASE..DATA_TAP_BASE + DATA_TAPS)
            .collect();
        let mut destinations = IndexMap::new();
        for (field, name) in ["trigger_start", "trigger_stop", "trigger_restart"].iter().enumerate() {
            destinations.insert(
                name.to_string(),
                Destination::new(0, field, triggers.clone(), vec![0, 1, 2, 3]),
            );
        }
        for (field, name) in ["bit_NOP", "bit_IRQ", "bit_STRB"].iter().enumerate() {
            destinations.insert(
                name.to_string(),
                Destination::new(1, field, taps.clone(), vec![0, 1]),
            );
        }
        Self::new(Direction::Input, sources, levels, destinations)
    }

    pub fn outputs() -> Self {
        let mut sources: IndexMap<String, u32> = OUTPUT_SOURCES
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();
        let signals: Vec<u32> = sources.values().copied().collect();
        sources.extend(data_taps());
        let levels: IndexMap<String, u32> = OUTPUT_LEVELS
            .iter()
            .enumerate()
            .map(|(i, s)| (s.to_string(), i as u32))
            .collect();

        let everything: Vec<u32> = sources.values().copied().collect();
        let bus_enable: Vec<u32> = BUS_ENABLE_SOURCES
            .iter()
            .filter_map(|s| sources.get(*s).copied())
            .collect();
        let layout: [(&str, usize, usize, &Vec<u32>); 8] = [
            ("output_0", 0, 0, &everything),
            ("output_1", 0, 1, &everything),
            ("output_2", 0, 2, &everything),
            ("bus_enable_0", 0, 3, &bus_enable),
            ("bus_enable_1", 1, 0, &bus_enable),
            ("LED_R", 1, 1, &signals),
            ("LED_G", 1, 2, &signals),
            ("LED_B", 1, 3, &signals),
        ];
        let destinations = layout
            .iter()
            .map(|(name, reg, field, allowed)| {
                (
                    name.to_string(),
                    Destination::new(*reg, *field, (*allowed).clone(), vec![0, 1]),
                )
            })
            .collect();
        Self::new(Direction::Output, sources, levels, destinations)
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn destination_names(&self) -> Vec<String> {
        self.destinations.keys().cloned().collect()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.keys().cloned().collect()
    }

    pub fn level_names(&self) -> Vec<String> {
        self.levels.keys().cloned().collect()
    }

    fn destination(&self, name: &str) -> Result<&Destination, IoMatrixError> {
        self.destinations
            .get(name)
            .ok_or_else(|| IoMatrixError::UnknownDestination {
                direction: self.direction,
                name: name.to_string(),
                known: self.destination_names(),
            })
    }

    /// Field value of `route` on `destination`, after checking it is permitted.
    pub fn field_of(&self, destination: &str, route: &Route) -> Result<u32, IoMatrixError> {
        let dest = self.destination(destination)?;
        let source = *self
            .sources
            .get(&route.source)
            .ok_or_else(|| IoMatrixError::UnknownSource {
                destination: destination.to_string(),
                source_name: route.source.clone(),
            })?;
        let level = *self
            .levels
            .get(&route.level)
            .ok_or_else(|| IoMatrixError::UnknownLevel {
                destination: destination.to_string(),
                level: route.level.clone(),
            })?;
        if !dest.sources.contains(&source) {
            return Err(IoMatrixError::SourceNotAllowed {
                destination: destination.to_string(),
                source_name: route.source.clone(),
            });
        }
        if !dest.levels.contains(&level) {
            return Err(IoMatrixError::LevelNotAllowed {
                destination: destination.to_string(),
                level: route.level.clone(),
            });
        }
        Ok(source | (level << LEVEL_SHIFT))
    }

    /// Route encoded by a field value, or `None` if the destination cannot hold it.
    fn route_of(&self, dest: &Destination, field: u32) -> Option<Route> {
        let source = field & SOURCE_MASK;
        let level = field >> LEVEL_SHIFT;
        if !dest.accepts(source, level) {
            return None;
        }
        let source_name = self.sources.iter().find(|(_, &c)| c == source)?.0;
        let level_name = self.levels.iter().find(|(_, &c)| c == level)?.0;
        Some(Route::new(source_name, level_name))
    }

    /// Register words for `selection`. Unlisted destinations keep their default route; listing
    /// a destination with its default route is an error, as decoding would drop it.
    pub fn encode(&self, selection: &Selection) -> Result<Registers, IoMatrixError> {
        for (name, route) in selection.iter() {
            if self.field_of(name, route)? == 0 {
                return Err(IoMatrixError::DefaultRoute {
                    destination: name.clone(),
                    route: route.to_string(),
                });
            }
        }
        self.merge([0, 0], selection)
    }

    /// Replaces only the listed destinations of `registers`. A default route clears its field.
    pub fn merge(&self, registers: Registers, selection: &Selection) -> Result<Registers, IoMatrixError> {
        let mut regs = registers;
        for (name, route) in selection.iter() {
            let value = self.field_of(name, route)?;
            self.destination(name)?.write(&mut regs, value);
        }
        Ok(regs)
    }

    /// Selection held by `registers`; destinations on their default route are omitted.
    ///
    /// Fails on any field no selection could have produced, reserved fields included.
    pub fn decode(&self, registers: Registers) -> Result<Selection, IoMatrixError> {
        let mut selection = Selection::new();
        let mut used = [0u32; 2];
        for (name, dest) in self.destinations.iter() {
            used[dest.register] |= FIELD_MASK << dest.shift();
            let field = dest.read(&registers);
            if field == 0 {
                continue;
            }
            let route = self
                .route_of(dest, field)
                .ok_or(IoMatrixError::InvalidField {
                    direction: self.direction,
                    register: dest.register,
                    field: dest.field,
                    value: field,
                })?;
            selection.insert(name.clone(), route);
        }
        for (register, &mask) in used.iter().enumerate() {
            let stray = registers[register] & !mask;
            if stray != 0 {
                let field = (0..FIELDS_PER_REGISTER)
                    .find(|f| (stray >> (*f as u32 * FIELD_BITS)) & FIELD_MASK != 0)
                    .unwrap_or(0);
                return Err(IoMatrixError::InvalidField {
                    direction: self.direction,
                    register,
                    field,
                    value: (registers[register] >> (field as u32 * FIELD_BITS)) & FIELD_MASK,
                });
            }
        }
        Ok(selection)
    }

    /// True if any of `destinations` is driven by a non-default source, or, with `sources`
    /// given, by one of those sources.
    pub fn is_enabled(
        &self,
        destinations: &[&str],
        registers: Registers,
        sources: Option<&[&str]>,
    ) -> Result<bool, IoMatrixError> {
        let wanted: Option<Vec<u32>> = match sources {
            Some(names) => Some(
                names
                    .iter()
                    .map(|s| {
                        self.sources
                            .get(*s)
                            .copied()
                            .ok_or_else(|| IoMatrixError::UnknownSource {
                                destination: destinations.join(","),
                                source_name: s.to_string(),
                            })
                    })
                    .collect::<Result<_, _>>()?,
            ),
            None => None,
        };
        for name in destinations {
            let source = self.destination(name)?.read(&registers) & SOURCE_MASK;
            let hit = match &wanted {
                Some(codes) => codes.contains(&source),
                None => source != 0,
            };
            if hit {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Register words for `selection` in `direction`.
pub fn encode(selection: &Selection, direction: Direction) -> Result<Registers, IoMatrixError> {
    IoTable::for_direction(direction).encode(selection)
}

pub fn decode(registers: Registers, direction: Direction) -> Result<Selection, IoMatrixError> {
    IoTable::for_direction(direction).decode(registers)
}

pub fn merge(
    registers: Registers,
    selection: &Selection,
    direction: Direction,
) -> Result<Registers, IoMatrixError> {
    IoTable::for_direction(direction).merge(registers, selection)
}

pub fn is_enabled(
    destinations: &[&str],
    registers: Registers,
    direction: Direction,
    sources: Option<&[&str]>,
) -> Result<bool, IoMatrixError> {
    IoTable::for_direction(direction).is_enabled(destinations, registers, sources)
}
