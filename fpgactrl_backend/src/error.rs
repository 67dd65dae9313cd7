//! Errors of the run stage.
//!
//! [`ProtocolError`] covers the connection to one board, [`RunError`] what the board reports
//! about a run, [`CoordinationError`] the barriers between workers. [`WorkerError`] wraps them
//! all, together with the compile stage's errors.

use std::io;
use std::time::Duration;

use thiserror::Error;

use fpgacompiler_backend::CompileError;

use crate::client::ClientState;
use crate::status::StatusFlags;
use crate::wire::Command;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("{command} frame of {actual} bytes, expected {expected:?}")]
    UnexpectedFrameSize {
        command: Command,
        expected: Vec<usize>,
        actual: usize,
    },
    #[error("Expected {expected} in reply to {request}, got {actual}")]
    UnexpectedCommand {
        request: Command,
        expected: Command,
        actual: Command,
    },
    #[error("Unknown command id {0:#04x}")]
    UnknownCommand(u8),
    #[error("Board rejected {0}")]
    Nack(Command),
    #[error("Connection closed by the board")]
    PeerClosed,
    #[error("Timeout while {0}")]
    Timeout(String),
    #[error("Not connected")]
    NotConnected,
    #[error("{op} is not allowed in state {state:?}")]
    InvalidState { op: Command, state: ClientState },
    #[error(transparent)]
    Io(io::Error),
}

impl ProtocolError {
    /// Classifies a socket error; `what` names the operation for timeouts.
    pub fn from_io(err: io::Error, what: &str) -> Self {
        match err.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                ProtocolError::Timeout(what.to_string())
            }
            io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe => ProtocolError::PeerClosed,
            _ => ProtocolError::Io(err),
        }
    }

    /// Whether the connection is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::Nack(_) | ProtocolError::InvalidState { .. } | ProtocolError::NotConnected
        )
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error("Board {board}: external clock is not locked")]
    ClockNotLocked { board: String },
    #[error("Board {board} is in error state: {flags}")]
    BoardInErrorState { board: String, flags: StatusFlags },
    #[error("Board {board} output {actual} samples, expected {expected}")]
    SampleCountMismatch {
        board: String,
        expected: u64,
        actual: u64,
    },
    #[error("Board {board} stopped at time {actual}, expected {expected}")]
    BoardTimeMismatch {
        board: String,
        expected: u32,
        actual: u32,
    },
    #[error("Board {board} lost the external clock")]
    ClockLostWarning { board: String },
    #[error("Board {board}: run aborted")]
    Aborted { board: String },
    #[error("Board {board} did not end within {limit:?}")]
    RunTimeout { board: String, limit: Duration },
}

#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("Timeout waiting for {event} from {peer}")]
    BarrierTimeout { peer: String, event: String },
    #[error("Peer {peer} reported a failure at {event}")]
    PeerReportedFailure { peer: String, event: String },
    #[error("Event {event}: received counter {actual}, expected {expected}")]
    CounterMismatch {
        event: String,
        expected: u32,
        actual: u32,
    },
    #[error("Event bus: {0}")]
    Bus(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Cannot access settings file: {0}")]
    Io(#[from] io::Error),
    #[error("Cannot parse settings: {0}")]
    Decode(#[from] toml::de::Error),
    #[error("Cannot write settings: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error("Invalid settings: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error("Board {board}: {source}")]
    Protocol {
        board: String,
        #[source]
        source: ProtocolError,
    },
    #[error(transparent)]
    Run(#[from] RunError),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("Worker thread of board {0} panicked")]
    Panicked(String),
}
