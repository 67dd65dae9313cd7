//! Errors of the compile stage.
//!
//! Every fallible operation of this crate returns [`CompileError`]. A time conflict carries a
//! [`ConflictReport`] whose `Display` is the human readable conflict table.

use std::fmt;

use thiserror::Error;

use crate::codec::CodecError;
use crate::iomatrix::IoMatrixError;

/// One channel output change placed on the bus.
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeRecord {
    pub channel: String,
    pub rack: usize,
    pub address: u32,
    /// Index into the board's time union.
    pub index: usize,
    pub time: f64,
    pub old: Option<f64>,
    pub new: Option<f64>,
}

/// All changes placed on one rack at one conflicting tick.
#[derive(Clone, Debug, PartialEq)]
pub struct ConflictEntry {
    pub tick: usize,
    pub time: f64,
    pub rack: usize,
    pub records: Vec<ChangeRecord>,
}

impl ConflictEntry {
    /// Sorted, de-duplicated addresses involved in the conflict.
    pub fn addresses(&self) -> Vec<u32> {
        let mut addresses: Vec<u32> = self.records.iter().map(|r| r.address).collect();
        addresses.sort_unstable();
        addresses.dedup();
        addresses
    }

    pub fn channels(&self) -> Vec<&str> {
        self.records.iter().map(|r| r.channel.as_str()).collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ConflictReport {
    pub board: String,
    pub entries: Vec<ConflictEntry>,
}

fn dash_or(value: Option<f64>) -> String {
    value.map_or("-".to_string(), |v| format!("{}", v))
}

impl fmt::Display for ConflictReport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        writeln!(
            f,
            "{} time conflict(s) on board {}:",
            self.entries.len(),
            self.board
        )?;
        for entry in self.entries.iter() {
            let addresses: Vec<String> = entry
                .addresses()
                .iter()
                .map(|a| format!("{:#04x}", a))
                .collect();
            writeln!(
                f,
                "  time {} s (tick {}), rack {}, addresses [{}]",
                entry.time,
                entry.tick,
                entry.rack,
                addresses.join(", ")
            )?;
            writeln!(
                f,
                "    {:<24} {:>4} {:>7} {:>7} {:>14} {:>14} {:>14}",
                "channel", "rack", "address", "sample", "time", "old", "new"
            )?;
            for r in entry.records.iter() {
                writeln!(
                    f,
                    "    {:<24} {:>4} {:>#7x} {:>7} {:>14} {:>14} {:>14}",
                    r.channel,
                    r.rack,
                    r.address,
                    r.index,
                    r.time,
                    dash_or(r.old),
                    dash_or(r.new)
                )?;
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum CompileError {
    #[error("{0}")]
    TimeConflict(ConflictReport),
    #[error("Board {board}: the first sample carries an explicit strobe bit")]
    FirstSampleHasStrobe { board: String },
    #[error("Board {board}: explicit strobe bits are not allowed while the strobe is auto-generated")]
    StrobeModeConflict { board: String },
    #[error(
        "Channel {channel}: value {value} is encoded as {decoded}, off by more than {tolerance}"
    )]
    CodecOutOfTolerance {
        channel: String,
        value: f64,
        decoded: f64,
        tolerance: f64,
    },
    #[error("{what} is invalid: {reason}")]
    InvalidAddressOrChannel { what: String, reason: String },
    #[error("Board {board}, rack {rack}: address {address:#04x} of {device} is already used by {other}")]
    AddressCollision {
        board: String,
        rack: usize,
        address: u32,
        device: String,
        other: String,
    },
    #[error("Invalid time {time} for {what}: {reason}")]
    InvalidTime {
        what: String,
        time: f64,
        reason: String,
    },
    #[error("Channel {channel}: instruction {new} overlaps with instruction {existing}")]
    DuplicateInstruction {
        channel: String,
        new: String,
        existing: String,
    },
    #[error("Instruction type {instr_type} requires argument \"{key}\"")]
    MissingArgument { instr_type: String, key: String },
    #[error("Board {0} not found")]
    UnknownBoard(String),
    #[error("Clockline {clockline} not found on board {board}")]
    UnknownClockLine { board: String, clockline: String },
    #[error("Device {device} not found on board {board}")]
    UnknownDevice { board: String, device: String },
    #[error("Channel {channel} not found on board {board}")]
    UnknownChannel { board: String, channel: String },
    #[error("Name {name} is already registered on {owner}")]
    DuplicateName { owner: String, name: String },
    #[error("{what} cannot be applied to channel {channel}")]
    WrongChannelKind { channel: String, what: String },
    #[error("Tick {tick} of board {board} does not fit in the 32-bit time column")]
    TickOverflow { board: String, tick: usize },
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    IoMatrix(#[from] IoMatrixError),
}

impl CompileError {
    /// Conflict report of a [`CompileError::TimeConflict`].
    pub fn conflict_report(&self) -> Option<&ConflictReport> {
        match self {
            CompileError::TimeConflict(report) => Some(report),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    mod report {
        use crate::error::*;

        fn record(channel: &str, address: u32, new: f64) -> ChangeRecord {
            ChangeRecord {
                channel: channel.to_string(),
                rack: 0,
                address,
                index: 1,
                time: 5e-6,
                old: None,
                new: Some(new),
            }
        }

        #[test]
        fn lists_every_channel() {
            let report = ConflictReport {
                board: "main".to_string(),
                entries: vec![ConflictEntry {
                    tick: 5,
                    time: 5e-6,
                    rack: 0,
                    records: vec![record("ao_a", 0x11, 1.0), record("ao_b", 0x10, -2.5)],
                }],
            };
            assert_eq!(report.entries[0].addresses(), vec![0x10, 0x11]);
            let text = CompileError::TimeConflict(report).to_string();
            assert!(text.contains("board main"));
            assert!(text.contains("ao_a"));
            assert!(text.contains("ao_b"));
            assert!(text.contains("0x10"));
            assert!(text.contains("-2.5"));
            assert!(text.contains(" - "));
        }
    }
}
