//! Run stage for FPGA pulse-sequence controllers.
//!
//! Boards compiled with [`fpgacompiler_backend`] are uploaded and run over TCP. The layers, from
//! the bottom up:
//!
//! - [`wire`]: frames of the board protocol.
//! - [`status`]: control, status and register constants, the status summary.
//! - [`client`]: one connection and its state machine. [`sim`] answers it in-process.
//! - [`event`]: named, counted events between workers.
//! - [`worker`]: the per-board run sequence with its barriers.
//! - [`experiment`]: compile and run a whole experiment, one worker thread per board.
#[cfg(feature = "pybindings")]
use pyo3::prelude::*;

pub mod client;
pub mod error;
pub mod event;
pub mod experiment;
pub mod settings;
pub mod sim;
pub mod status;
pub mod utils;
pub mod wire;
pub mod worker;

pub use crate::client::*;
pub use crate::error::*;
pub use crate::event::*;
pub use crate::experiment::Experiment;
pub use crate::settings::*;
pub use crate::sim::*;
pub use crate::status::*;
pub use crate::wire::*;
pub use crate::worker::*;

#[cfg(feature = "pybindings")]
#[pymodule]
fn fpgactrl_backend(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_class::<Experiment>()?;
    Ok(())
}
