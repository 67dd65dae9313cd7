//! The experiment module provides the highest level of abstraction for editing pulse sequences
//! across boards, and the single place by which methods are exposed to python.
//!
//! ## Overview
//!
//! At the heart of this module lies the [`Experiment`] struct, which consists of a collection of
//! boards. The behavior of the `Experiment` struct is primarily defined by the [`BaseExperiment`]
//! trait, which prescribes a collection of methods for experiment management and manipulation.
//!
//! 1. **Experiment Struct**: a collection of [`Board`]s keyed by name.
//! 2. **Traits**: the [`BaseExperiment`] trait, whose default methods implement every operation.
//! 3. **Macro**: `impl_exp_boilerplate!` implements the trait's field accessors for a struct with
//!    a `boards` field and, with the `pybindings` feature, generates the python wrappers.
//!
//! ## Key Structures and Their Relationships
//!
//! - **Board**: one FPGA controller and its device tree, see [`crate::board`].
//! - **Device**: a digital bank, analog output or DDS on a clockline, see [`crate::device`].
//! - **Channel**: one output of a device holding the edited instructions, see [`crate::channel`].
//! - **CompiledBoard**: the packed stream and tables produced by [`BaseExperiment::compile`].
//!
//! Errors never panic: every fallible method returns [`CompileError`], which the python wrappers
//! turn into `ValueError`.

use indexmap::IndexMap;
use rayon::prelude::*;

use crate::bits::SpecialBit;
use crate::board::*;
use crate::channel::*;
use crate::compiler::CompiledBoard;
use crate::config::*;
use crate::error::CompileError;
use crate::instruction::*;
use crate::utils::TickTimer;

/// This trait defines the behavior of the [`Experiment`] struct through default trait
/// implementations.
///
/// Trait methods are primarily classified into the following categories:
/// 1. Experiment-targeted methods:
///     - [`add_board`], [`compile`], [`compile_all`]
///     - [`is_edited`], [`clear_edit_cache`], [`last_instr_end_time`]
/// 2. Board-targeted methods:
///     - [`add_pseudoclock`], [`add_clockline`], [`add_digital_bank`], [`add_digital_line`],
///       [`add_analog`], [`add_dds`]
///     - [`stop`], [`irq`], [`strobe`], [`nop`], [`set_worker_options`]
/// 3. Channel-targeted methods:
///     - [`constant`], [`go_constant`], [`high`], [`low`], [`go_high`], [`go_low`],
///       [`linramp`], [`sine`], [`freq`], [`amp`], [`phase`]
/// 4. Internal helper methods:
///     - [`boards`], [`boards_`], [`board`], [`board_`], [`channel_op`], [`typed_channel_op`]
///
/// [`add_board`]: BaseExperiment::add_board
/// [`compile`]: BaseExperiment::compile
/// [`compile_all`]: BaseExperiment::compile_all
/// [`is_edited`]: BaseExperiment::is_edited
/// [`clear_edit_cache`]: BaseExperiment::clear_edit_cache
/// [`last_instr_end_time`]: BaseExperiment::last_instr_end_time
/// [`add_pseudoclock`]: BaseExperiment::add_pseudoclock
/// [`add_clockline`]: BaseExperiment::add_clockline
/// [`add_digital_bank`]: BaseExperiment::add_digital_bank
/// [`add_digital_line`]: BaseExperiment::add_digital_line
/// [`add_analog`]: BaseExperiment::add_analog
/// [`add_dds`]: BaseExperiment::add_dds
/// [`stop`]: BaseExperiment::stop
/// [`irq`]: BaseExperiment::irq
/// [`strobe`]: BaseExperiment::strobe
/// [`nop`]: BaseExperiment::nop
/// [`set_worker_options`]: BaseExperiment::set_worker_options
/// [`constant`]: BaseExperiment::constant
/// [`go_constant`]: BaseExperiment::go_constant
/// [`high`]: BaseExperiment::high
/// [`low`]: BaseExperiment::low
/// [`go_high`]: BaseExperiment::go_high
/// [`go_low`]: BaseExperiment::go_low
/// [`linramp`]: BaseExperiment::linramp
/// [`sine`]: BaseExperiment::sine
/// [`freq`]: BaseExperiment::freq
/// [`amp`]: BaseExperiment::amp
/// [`phase`]: BaseExperiment::phase
/// [`boards`]: BaseExperiment::boards
/// [`boards_`]: BaseExperiment::boards_
/// [`board`]: BaseExperiment::board
/// [`board_`]: BaseExperiment::board_
/// [`channel_op`]: BaseExperiment::channel_op
/// [`typed_channel_op`]: BaseExperiment::typed_channel_op
pub trait BaseExperiment {
    // FIELD methods
    fn boards(&self) -> &IndexMap<String, Board>;
    fn boards_(&mut self) -> &mut IndexMap<String, Board>;

    /// Borrows the board `name`.
    ///
    /// # Example
    /// ```
    /// use fpgacompiler_backend::*;
    ///
    /// let mut exp = Experiment::new();
    /// exp.add_board(BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary)).unwrap();
    /// assert_eq!(exp.board("main").unwrap().config().bus_rate, 1e6);
    /// assert!(matches!(exp.board("other"), Err(CompileError::UnknownBoard(_))));
    /// ```
    fn board(&self, name: &str) -> Result<&Board, CompileError> {
        self.boards()
            .get(name)
            .ok_or_else(|| CompileError::UnknownBoard(name.to_string()))
    }

    fn board_(&mut self, name: &str) -> Result<&mut Board, CompileError> {
        self.boards_()
            .get_mut(name)
            .ok_or_else(|| CompileError::UnknownBoard(name.to_string()))
    }

    /// Registers a board. The configuration is validated; board names are unique.
    fn add_board(&mut self, config: BoardConfig) -> Result<(), CompileError> {
        if self.boards().contains_key(&config.name) {
            return Err(CompileError::DuplicateName {
                owner: "experiment".to_string(),
                name: config.name,
            });
        }
        let board = Board::new(config)?;
        log::info!(
            "Added {} board {} at {} ({} rack(s), {} Hz)",
            board.config().role,
            board.name(),
            board.config().endpoint,
            board.config().num_racks,
            board.config().bus_rate
        );
        self.boards_().insert(board.name().to_string(), board);
        Ok(())
    }

    fn add_pseudoclock(&mut self, board: &str, name: &str) -> Result<(), CompileError> {
        self.board_(board)?.add_pseudoclock(name)
    }

    fn add_clockline(&mut self, board: &str, pseudoclock: &str, name: &str) -> Result<(), CompileError> {
        self.board_(board)?.add_clockline(pseudoclock, name)
    }

    /// Adds an empty digital bank at `address` of `rack`.
    fn add_digital_bank(
        &mut self,
        board: &str,
        clockline: &str,
        name: &str,
        rack: usize,
        address: u32,
    ) -> Result<(), CompileError> {
        self.board_(board)?.add_digital_bank(clockline, name, rack, address)
    }

    /// Adds a digital line at payload bit `bit` of digital bank `bank`.
    ///
    /// # Example
    /// ```
    /// # use fpgacompiler_backend::*;
    /// let mut exp = Experiment::new();
    /// exp.add_board(BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary)).unwrap();
    /// exp.add_pseudoclock("main", "pc").unwrap();
    /// exp.add_clockline("main", "pc", "cl").unwrap();
    /// exp.add_digital_bank("main", "cl", "bank0", 0, 0x05).unwrap();
    /// exp.add_digital_line("main", "bank0", "shutter", 3, false).unwrap();
    /// // bit 3 is taken
    /// assert!(exp.add_digital_line("main", "bank0", "trigger", 3, false).is_err());
    /// ```
    fn add_digital_line(
        &mut self,
        board: &str,
        bank: &str,
        name: &str,
        bit: u32,
        default_value: bool,
    ) -> Result<(), CompileError> {
        self.board_(board)?.add_digital_line(bank, name, bit, default_value)
    }

    /// Adds an analog output whose codec is registered under `codec_tag` (e.g. `"DAC712"`).
    #[allow(clippy::too_many_arguments)]
    fn add_analog(
        &mut self,
        board: &str,
        clockline: &str,
        name: &str,
        rack: usize,
        address: u32,
        codec_tag: &str,
        default_value: f64,
    ) -> Result<(), CompileError> {
        self.board_(board)?
            .add_analog(clockline, name, rack, address, codec_tag, default_value)
    }

    /// Adds a DDS with sub-channels `{name}_freq`, `{name}_amp` and `{name}_phase`.
    ///
    /// `defaults` are `(Hz, dBm, degrees)`.
    fn add_dds(
        &mut self,
        board: &str,
        clockline: &str,
        name: &str,
        rack: usize,
        base_address: u32,
        defaults: (f64, f64, f64),
    ) -> Result<(), CompileError> {
        self.board_(board)?
            .add_dds(clockline, name, rack, base_address, defaults)
    }

    /// Executes `f` on channel `chan_name` of `board`.
    fn channel_op<F, R>(&mut self, board: &str, chan_name: &str, f: F) -> Result<R, CompileError>
    where
        F: FnOnce(&mut Channel) -> Result<R, CompileError>,
    {
        f(self.board_(board)?.channel_(chan_name)?)
    }

    /// Like [`BaseExperiment::channel_op`], but only on channels of the listed kinds.
    fn typed_channel_op<F, R>(
        &mut self,
        board: &str,
        chan_name: &str,
        kinds: &[ChannelKind],
        what: &str,
        f: F,
    ) -> Result<R, CompileError>
    where
        F: FnOnce(&mut Channel) -> Result<R, CompileError>,
    {
        self.channel_op(board, chan_name, |chan| {
            if !kinds.contains(&chan.kind()) {
                return Err(CompileError::WrongChannelKind {
                    channel: chan.name().to_string(),
                    what: what.to_string(),
                });
            }
            f(chan)
        })
    }

    /// Holds `value` on `[t, t + duration)`; afterwards the channel keeps `value` if `keep_val`,
    /// otherwise it returns to its default.
    ///
    /// # Example
    /// ```
    /// # use fpgacompiler_backend::*;
    /// let mut exp = Experiment::new();
    /// exp.add_board(BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary)).unwrap();
    /// exp.add_pseudoclock("main", "pc").unwrap();
    /// exp.add_clockline("main", "pc", "cl").unwrap();
    /// exp.add_analog("main", "cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
    /// exp.constant("main", "ao0", 1e-6, 2e-6, 5.0, false).unwrap();
    /// assert_eq!(exp.last_instr_end_time(), 3e-6);
    /// ```
    fn constant(
        &mut self,
        board: &str,
        chan_name: &str,
        t: f64,
        duration: f64,
        value: f64,
        keep_val: bool,
    ) -> Result<(), CompileError> {
        self.channel_op(board, chan_name, |chan| {
            chan.constant(value, t, Some((duration, keep_val)))
        })
    }

    /// Sets `value` at `t` and keeps it.
    fn go_constant(&mut self, board: &str, chan_name: &str, t: f64, value: f64) -> Result<(), CompileError> {
        self.channel_op(board, chan_name, |chan| chan.constant(value, t, None))
    }

    /// Digital pulse high on `[t, t + duration)`.
    fn high(&mut self, board: &str, chan_name: &str, t: f64, duration: f64) -> Result<(), CompileError> {
        self.typed_channel_op(board, chan_name, &[ChannelKind::Digital], "high", |chan| {
            chan.constant(1.0, t, Some((duration, false)))
        })
    }

    /// Digital pulse low on `[t, t + duration)`.
    fn low(&mut self, board: &str, chan_name: &str, t: f64, duration: f64) -> Result<(), CompileError> {
        self.typed_channel_op(board, chan_name, &[ChannelKind::Digital], "low", |chan| {
            chan.constant(0.0, t, Some((duration, false)))
        })
    }

    fn go_high(&mut self, board: &str, chan_name: &str, t: f64) -> Result<(), CompileError> {
        self.typed_channel_op(board, chan_name, &[ChannelKind::Digital], "go_high", |chan| {
            chan.constant(1.0, t, None)
        })
    }

    fn go_low(&mut self, board: &str, chan_name: &str, t: f64) -> Result<(), CompileError> {
        self.typed_channel_op(board, chan_name, &[ChannelKind::Digital], "go_low", |chan| {
            chan.constant(0.0, t, None)
        })
    }

    /// Linear ramp from `start_val` to `end_val` over `[t, t + duration)`, sampled every ramp
    /// step of the board.
    #[allow(clippy::too_many_arguments)]
    fn linramp(
        &mut self,
        board: &str,
        chan_name: &str,
        t: f64,
        duration: f64,
        start_val: f64,
        end_val: f64,
        keep_val: bool,
    ) -> Result<(), CompileError> {
        let instr = Instruction::new_linramp(start_val, end_val, t, t + duration);
        self.typed_channel_op(
            board,
            chan_name,
            &[
                ChannelKind::Analog,
                ChannelKind::DdsFreq,
                ChannelKind::DdsAmp,
                ChannelKind::DdsPhase,
            ],
            "linramp",
            |chan| chan.add_instr(instr, t, Some((duration, keep_val))),
        )
    }

    /// Sine on `[t, t + duration)`. Unset parameters take the defaults of
    /// [`Instruction::new_sine`].
    #[allow(clippy::too_many_arguments)]
    fn sine(
        &mut self,
        board: &str,
        chan_name: &str,
        t: f64,
        duration: f64,
        keep_val: bool,
        freq: f64,
        amplitude: Option<f64>,
        phase: Option<f64>,
        dc_offset: Option<f64>,
    ) -> Result<(), CompileError> {
        let instr = Instruction::new_sine(freq, amplitude, phase, dc_offset);
        self.typed_channel_op(board, chan_name, &[ChannelKind::Analog], "sine", |chan| {
            chan.add_instr(instr, t, Some((duration, keep_val)))
        })
    }

    /// Sets the frequency (Hz) of DDS `dds` at `t`.
    fn freq(&mut self, board: &str, dds: &str, t: f64, value: f64) -> Result<(), CompileError> {
        let name = format!("{}_freq", dds);
        self.typed_channel_op(board, &name, &[ChannelKind::DdsFreq], "freq", |chan| {
            chan.constant(value, t, None)
        })
    }

    /// Sets the amplitude (dBm) of DDS `dds` at `t`.
    fn amp(&mut self, board: &str, dds: &str, t: f64, value: f64) -> Result<(), CompileError> {
        let name = format!("{}_amp", dds);
        self.typed_channel_op(board, &name, &[ChannelKind::DdsAmp], "amp", |chan| {
            chan.constant(value, t, None)
        })
    }

    /// Sets the phase (degrees) of DDS `dds` at `t`.
    fn phase(&mut self, board: &str, dds: &str, t: f64, value: f64) -> Result<(), CompileError> {
        let name = format!("{}_phase", dds);
        self.typed_channel_op(board, &name, &[ChannelKind::DdsPhase], "phase", |chan| {
            chan.constant(value, t, None)
        })
    }

    /// Board waits for the restart trigger at `t`.
    fn stop(&mut self, board: &str, rack: usize, t: f64) -> Result<(), CompileError> {
        self.board_(board)?.add_special(rack, t, SpecialBit::Stop)
    }

    /// Board raises the data IRQ at `t`.
    fn irq(&mut self, board: &str, rack: usize, t: f64) -> Result<(), CompileError> {
        self.board_(board)?.add_special(rack, t, SpecialBit::Irq)
    }

    /// Explicit strobe toggle at `t`. Requires `auto_strb` off on the board.
    fn strobe(&mut self, board: &str, rack: usize, t: f64) -> Result<(), CompileError> {
        self.board_(board)?.add_special(rack, t, SpecialBit::Strb)
    }

    /// Forces an idle sample at `t`.
    fn nop(&mut self, board: &str, rack: usize, t: f64) -> Result<(), CompileError> {
        self.board_(board)?.add_special(rack, t, SpecialBit::Nop)
    }

    /// Merges run options into the in-script worker options of `board`.
    fn set_worker_options(&mut self, board: &str, options: &WorkerOptions) -> Result<(), CompileError> {
        self.board_(board)?.set_worker_options(options);
        Ok(())
    }

    /// Compiles one board.
    fn compile(&self, board: &str, stop_time: Option<f64>) -> Result<CompiledBoard, CompileError> {
        self.board(board)?.compile(stop_time)
    }

    /// Compiles every board in parallel; boards are compiled independently.
    ///
    /// # Example
    /// ```
    /// # use fpgacompiler_backend::*;
    /// let mut exp = Experiment::new();
    /// exp.add_board(BoardConfig::new("a", "10.0.0.2", 1e6, 1, Role::Primary)).unwrap();
    /// exp.add_board(BoardConfig::new("b", "10.0.0.3", 1e6, 2, Role::Primary)).unwrap();
    /// let compiled = exp.compile_all(None).unwrap();
    /// assert_eq!(compiled.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    /// assert_eq!(compiled["b"].data().ncols(), 3);
    /// ```
    fn compile_all(&self, stop_time: Option<f64>) -> Result<IndexMap<String, CompiledBoard>, CompileError> {
        let mut timer = TickTimer::new();
        let boards: Vec<&Board> = self.boards().values().collect();
        let compiled = boards
            .par_iter()
            .map(|board| board.compile(stop_time))
            .collect::<Result<Vec<_>, _>>()?;
        timer.tick_print(&format!("compiled {} board(s)", compiled.len()));
        Ok(compiled
            .into_iter()
            .map(|c| (c.name().to_string(), c))
            .collect())
    }

    fn is_edited(&self) -> bool {
        self.boards().values().any(|b| b.is_edited())
    }

    fn clear_edit_cache(&mut self) {
        self.boards_().values_mut().for_each(|b| b.clear_edit_cache());
    }

    /// Latest instruction end across boards, in seconds.
    fn last_instr_end_time(&self) -> f64 {
        self.boards()
            .values()
            .map(|b| b.last_instr_end_time())
            .fold(0.0, f64::max)
    }
}

/// A concrete struct consisting of a collection of boards.
///
/// **Refer to the [`BaseExperiment`] trait for method behavior.**
#[cfg_attr(feature = "pybindings", pyo3::pyclass)]
#[derive(Default)]
pub struct Experiment {
    boards: IndexMap<String, Board>,
}

impl Experiment {
    pub fn new() -> Self {
        Self {
            boards: IndexMap::new(),
        }
    }
}

/// A macro to generate boilerplate implementations for structs representing experiments.
///
/// The struct needs a `boards: IndexMap<String, Board>` field. The macro implements the field
/// accessors of [`BaseExperiment`]; with the `pybindings` feature it also wraps the trait
/// methods in a `#[pymethods]` block, since PyO3 cannot export trait methods directly.
///
/// Usage:
/// ```rust
/// use fpgacompiler_backend::*;
/// use indexmap::IndexMap;
///
/// struct CustomExperiment {
///     boards: IndexMap<String, Board>,
///     some_property: f64,
/// }
/// impl_exp_boilerplate!(CustomExperiment);
///
/// let mut exp = CustomExperiment { boards: IndexMap::new(), some_property: 1.0 };
/// exp.add_board(BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary)).unwrap();
/// assert!(!exp.is_edited());
/// ```
#[macro_export]
macro_rules! impl_exp_boilerplate {
    ($exp_type: ty) => {
        impl $crate::experiment::BaseExperiment for $exp_type {
            fn boards(&self) -> &::indexmap::IndexMap<String, $crate::board::Board> {
                &self.boards
            }
            fn boards_(&mut self) -> &mut ::indexmap::IndexMap<String, $crate::board::Board> {
                &mut self.boards
            }
        }

        $crate::impl_exp_pymethods!($exp_type);
    };
}

/// Python wrappers of the [`BaseExperiment`] methods, see [`impl_exp_boilerplate`].
#[cfg(feature = "pybindings")]
#[macro_export]
macro_rules! impl_exp_pymethods {
    ($exp_type: ty) => {
        #[::pyo3::pymethods]
        impl $exp_type {
            #[pyo3(signature = (name, endpoint, bus_rate, num_racks=1, primary=true, peers=Vec::new(), auto_strb=true))]
            #[allow(clippy::too_many_arguments)]
            pub fn add_board(
                &mut self,
                name: &str,
                endpoint: &str,
                bus_rate: f64,
                num_racks: usize,
                primary: bool,
                peers: Vec<String>,
                auto_strb: bool,
            ) -> ::pyo3::PyResult<()> {
                let role = if primary {
                    $crate::config::Role::Primary
                } else {
                    $crate::config::Role::Secondary
                };
                let mut config = $crate::config::BoardConfig::new(name, endpoint, bus_rate, num_racks, role);
                config.peers = peers;
                config.auto_strb = auto_strb;
                $crate::experiment::BaseExperiment::add_board(self, config).map_err($crate::experiment::to_py_err)
            }

            pub fn add_pseudoclock(&mut self, board: &str, name: &str) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::add_pseudoclock(self, board, name)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn add_clockline(&mut self, board: &str, pseudoclock: &str, name: &str) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::add_clockline(self, board, pseudoclock, name)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn add_digital_bank(
                &mut self,
                board: &str,
                clockline: &str,
                name: &str,
                rack: usize,
                address: u32,
            ) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::add_digital_bank(self, board, clockline, name, rack, address)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn add_digital_line(
                &mut self,
                board: &str,
                bank: &str,
                name: &str,
                bit: u32,
                default_value: bool,
            ) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::add_digital_line(self, board, bank, name, bit, default_value)
                    .map_err($crate::experiment::to_py_err)
            }

            #[allow(clippy::too_many_arguments)]
            pub fn add_analog(
                &mut self,
                board: &str,
                clockline: &str,
                name: &str,
                rack: usize,
                address: u32,
                codec_tag: &str,
                default_value: f64,
            ) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::add_analog(
                    self, board, clockline, name, rack, address, codec_tag, default_value,
                )
                .map_err($crate::experiment::to_py_err)
            }

            #[allow(clippy::too_many_arguments)]
            pub fn add_dds(
                &mut self,
                board: &str,
                clockline: &str,
                name: &str,
                rack: usize,
                base_address: u32,
                freq: f64,
                amp: f64,
                phase: f64,
            ) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::add_dds(
                    self, board, clockline, name, rack, base_address, (freq, amp, phase),
                )
                .map_err($crate::experiment::to_py_err)
            }

            pub fn constant(
                &mut self,
                board: &str,
                chan_name: &str,
                t: f64,
                duration: f64,
                value: f64,
                keep_val: bool,
            ) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::constant(self, board, chan_name, t, duration, value, keep_val)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn go_constant(&mut self, board: &str, chan_name: &str, t: f64, value: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::go_constant(self, board, chan_name, t, value)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn high(&mut self, board: &str, chan_name: &str, t: f64, duration: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::high(self, board, chan_name, t, duration)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn low(&mut self, board: &str, chan_name: &str, t: f64, duration: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::low(self, board, chan_name, t, duration)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn go_high(&mut self, board: &str, chan_name: &str, t: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::go_high(self, board, chan_name, t)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn go_low(&mut self, board: &str, chan_name: &str, t: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::go_low(self, board, chan_name, t)
                    .map_err($crate::experiment::to_py_err)
            }

            #[allow(clippy::too_many_arguments)]
            pub fn linramp(
                &mut self,
                board: &str,
                chan_name: &str,
                t: f64,
                duration: f64,
                start_val: f64,
                end_val: f64,
                keep_val: bool,
            ) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::linramp(
                    self, board, chan_name, t, duration, start_val, end_val, keep_val,
                )
                .map_err($crate::experiment::to_py_err)
            }

            #[pyo3(signature = (board, chan_name, t, duration, keep_val, freq, amplitude=None, phase=None, dc_offset=None))]
            #[allow(clippy::too_many_arguments)]
            pub fn sine(
                &mut self,
                board: &str,
                chan_name: &str,
                t: f64,
                duration: f64,
                keep_val: bool,
                freq: f64,
                amplitude: Option<f64>,
                phase: Option<f64>,
                dc_offset: Option<f64>,
            ) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::sine(
                    self, board, chan_name, t, duration, keep_val, freq, amplitude, phase, dc_offset,
                )
                .map_err($crate::experiment::to_py_err)
            }

            pub fn freq(&mut self, board: &str, dds: &str, t: f64, value: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::freq(self, board, dds, t, value)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn amp(&mut self, board: &str, dds: &str, t: f64, value: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::amp(self, board, dds, t, value)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn phase(&mut self, board: &str, dds: &str, t: f64, value: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::phase(self, board, dds, t, value)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn stop(&mut self, board: &str, rack: usize, t: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::stop(self, board, rack, t)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn irq(&mut self, board: &str, rack: usize, t: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::irq(self, board, rack, t)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn strobe(&mut self, board: &str, rack: usize, t: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::strobe(self, board, rack, t)
                    .map_err($crate::experiment::to_py_err)
            }

            pub fn nop(&mut self, board: &str, rack: usize, t: f64) -> ::pyo3::PyResult<()> {
                $crate::experiment::BaseExperiment::nop(self, board, rack, t)
                    .map_err($crate::experiment::to_py_err)
            }

            /// Worker options as a JSON object string, e.g. `{"num_cycles": 3}`.
            pub fn set_worker_options(&mut self, board: &str, options_json: &str) -> ::pyo3::PyResult<()> {
                let options = $crate::experiment::worker_options_from_json(options_json)?;
                $crate::experiment::BaseExperiment::set_worker_options(self, board, &options)
                    .map_err($crate::experiment::to_py_err)
            }

            /// Compiles `board` and returns the sample matrix.
            pub fn compile(
                &self,
                py: ::pyo3::Python<'_>,
                board: &str,
                stop_time: Option<f64>,
            ) -> ::pyo3::PyResult<::pyo3::Py<::numpy::PyArray2<u32>>> {
                let compiled = $crate::experiment::BaseExperiment::compile(self, board, stop_time)
                    .map_err($crate::experiment::to_py_err)?;
                Ok(::numpy::ToPyArray::to_pyarray(compiled.data(), py).to_owned())
            }

            pub fn final_values(
                &self,
                board: &str,
                stop_time: Option<f64>,
            ) -> ::pyo3::PyResult<::std::collections::HashMap<String, f64>> {
                let compiled = $crate::experiment::BaseExperiment::compile(self, board, stop_time)
                    .map_err($crate::experiment::to_py_err)?;
                Ok(compiled.final_values().clone().into_iter().collect())
            }

            pub fn is_edited(&self) -> bool {
                $crate::experiment::BaseExperiment::is_edited(self)
            }

            pub fn clear_edit_cache(&mut self) {
                $crate::experiment::BaseExperiment::clear_edit_cache(self)
            }

            pub fn last_instr_end_time(&self) -> f64 {
                $crate::experiment::BaseExperiment::last_instr_end_time(self)
            }
        }
    };
}

#[cfg(not(feature = "pybindings"))]
#[macro_export]
macro_rules! impl_exp_pymethods {
    ($exp_type: ty) => {};
}

#[cfg(feature = "pybindings")]
pub fn to_py_err(err: CompileError) -> pyo3::PyErr {
    pyo3::exceptions::PyValueError::new_err(err.to_string())
}

#[cfg(feature = "pybindings")]
pub fn worker_options_from_json(json: &str) -> pyo3::PyResult<WorkerOptions> {
    serde_json::from_str(json).map_err(|e| pyo3::exceptions::PyValueError::new_err(e.to_string()))
}

#[cfg(feature = "pybindings")]
#[pyo3::pymethods]
impl Experiment {
    /// Constructor for the `Experiment` class.
    ///
    /// # Example (python)
    /// ```python
    /// from fpgacompiler_backend import Experiment
    ///
    /// exp = Experiment()
    /// exp.add_board("main", "10.0.0.2", 1e6)
    /// ```
    #[new]
    pub fn py_new() -> Self {
        Self::new()
    }
}

impl_exp_boilerplate!(Experiment);
