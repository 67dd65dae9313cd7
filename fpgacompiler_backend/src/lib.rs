//! Compiler backend for FPGA pulse-sequence controllers.
//!
//! Channels are edited through an [`Experiment`] (see [`BaseExperiment`]), grouped into devices
//! on the racks of a [`Board`]. Compiling a board checks the edits for bus conflicts and produces
//! a [`CompiledBoard`]: one 32-bit time column plus one data column per rack, ready to be
//! uploaded.
#[cfg(feature = "pybindings")]
use pyo3::prelude::*;

pub mod bits;
pub mod board;
pub mod channel;
pub mod codec;
pub mod compiler;
pub mod config;
pub mod crc;
pub mod dac;
pub mod dds;
pub mod device;
pub mod error;
pub mod experiment;
pub mod instruction;
pub mod iomatrix;
pub mod utils;

pub use bits::*;
pub use board::*;
pub use channel::*;
pub use codec::*;
pub use compiler::*;
pub use config::*;
pub use crc::*;
pub use dac::*;
pub use dds::*;
pub use device::*;
pub use error::*;
pub use experiment::*;
pub use instruction::*;
pub use iomatrix::{Destination, Direction, IoMatrixError, IoTable, Registers, Route, Selection};
pub use utils::*;

#[cfg(feature = "pybindings")]
#[pymodule]
fn fpgacompiler_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<Experiment>()?;
    Ok(())
}
