//! Provides definitions and implementations for instruction-related functionalities.
//!
//! ## Main Structures and Enumerations:
//!
//! - `InstrType`: An enumeration that defines the types of instructions supported: `CONST` for
//!   constant values, `LINRAMP` for linear ramps and `SINE` for sinusoidal waves.
//!
//! - `Instruction`: Represents a general instruction composed of a type (`InstrType`) and a set of
//!   arguments (`InstrArgs`). It offers methods for creating specific instruction types
//!   conveniently and for evaluating them.
//!
//! - `InstrBook`: Manages an instruction along with its associated metadata during the editing
//!   phase: the tick interval it covers, the tick spacing of its samples and whether to retain
//!   the value after the interval.
//!
//! Ramps and sines are not streamed: the bus only carries discrete writes, so a channel evaluates
//! its books on a tick grid once and stores the resulting samples (see
//! [`crate::channel::BaseChannel::expand`]).

use std::cmp::Ordering;
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use maplit::hashmap;

use crate::error::CompileError;

/// Type alias for instruction arguments: a dictionary with key-value pairs of
/// string (argument name) and float (value)
pub type InstrArgs = HashMap<String, f64>;

/// Enum type for different instructions. Supported instructions: `CONST`, `LINRAMP`, `SINE`
#[derive(Clone, Debug, PartialEq)]
pub enum InstrType {
    CONST,
    LINRAMP,
    SINE,
}
impl fmt::Display for InstrType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                InstrType::CONST => "CONST",
                InstrType::LINRAMP => "LINRAMP",
                InstrType::SINE => "SINE",
            }
        )
    }
}

/// Struct for a general instruction, consisting of type and arguments.
///
/// ## Implemented instruction types and their expected fields:
/// 1. `InstrType::CONST`:
///    - `value`
/// 2. `InstrType::LINRAMP`:
///    - `start_val`, `end_val`
///    - `start_time`, `end_time`: absolute times in seconds
/// 3. `InstrType::SINE`:
///    - `freq`
///    - `amplitude`: Default is `1.0`
///    - `offset`: Default is `0.0`
///    - `phase`: Default is `0.0`
#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub instr_type: InstrType,
    pub args: InstrArgs,
}
impl Instruction {
    /// Constructs an `Instruction` object, checking that `args` holds every key the
    /// instruction type requires.
    ///
    /// # Examples
    ///
    /// ```
    /// use fpgacompiler_backend::instruction::*;
    ///
    /// let mut const_args = InstrArgs::new();
    /// const_args.insert("value".to_string(), 1.0);
    /// assert!(Instruction::new(InstrType::CONST, const_args).is_ok());
    ///
    /// // `freq` is missing
    /// assert!(Instruction::new(InstrType::SINE, InstrArgs::new()).is_err());
    /// ```
    pub fn new(instr_type: InstrType, args: InstrArgs) -> Result<Self, CompileError> {
        let required: &[&str] = match instr_type {
            InstrType::CONST => &["value"],
            InstrType::LINRAMP => &["start_val", "end_val", "start_time", "end_time"],
            InstrType::SINE => &["freq"],
        };
        if let Some(key) = required.iter().find(|key| !args.contains_key(**key)) {
            return Err(CompileError::MissingArgument {
                instr_type: instr_type.to_string(),
                key: key.to_string(),
            });
        }
        Ok(Instruction { instr_type, args })
    }

    fn arg(&self, key: &str, default: f64) -> f64 {
        self.args.get(key).copied().unwrap_or(default)
    }

    /// Evaluates the instruction at the times in `t_arr` (seconds), in place.
    ///
    /// # Examples
    ///
    /// ```
    /// use fpgacompiler_backend::instruction::*;
    ///
    /// let mut t = ndarray::Array1::linspace(0.0, 1.0, 5);
    /// Instruction::new_linramp(0.0, 2.0, 0.0, 1.0).eval_inplace(&mut t.view_mut());
    /// assert_eq!(t.to_vec(), vec![0.0, 0.5, 1.0, 1.5, 2.0]);
    /// ```
    pub fn eval_inplace(&self, t_arr: &mut ndarray::ArrayViewMut1<f64>) {
        match self.instr_type {
            InstrType::CONST => {
                t_arr.fill(self.arg("value", 0.0));
            }
            InstrType::LINRAMP => {
                let start_val = self.arg("start_val", 0.0);
                let end_val = self.arg("end_val", 0.0);
                let start_time = self.arg("start_time", 0.0);
                let end_time = self.arg("end_time", 0.0);
                let span = end_time - start_time;
                t_arr.map_inplace(|t| {
                    *t = if span == 0.0 {
                        end_val
                    } else {
                        start_val + (end_val - start_val) * (*t - start_time) / span
                    }
                });
            }
            InstrType::SINE => {
                let freq = self.arg("freq", 0.0);
                let amplitude = self.arg("amplitude", 1.0);
                let offset = self.arg("offset", 0.0);
                let phase = self.arg("phase", 0.0);
                t_arr.map_inplace(|t| {
                    *t = (2.0 * PI * freq * (*t) + phase).sin() * amplitude + offset
                });
            }
        }
    }

    /// Value at a single time.
    pub fn eval_at(&self, t: f64) -> f64 {
        let mut arr = ndarray::array![t];
        self.eval_inplace(&mut arr.view_mut());
        arr[0]
    }

    pub fn new_const(value: f64) -> Instruction {
        Instruction {
            instr_type: InstrType::CONST,
            args: hashmap! {String::from("value") => value},
        }
    }

    /// Linear ramp from `start_val` at `start_time` to `end_val` at `end_time`.
    pub fn new_linramp(start_val: f64, end_val: f64, start_time: f64, end_time: f64) -> Instruction {
        Instruction {
            instr_type: InstrType::LINRAMP,
            args: hashmap! {
                String::from("start_val") => start_val,
                String::from("end_val") => end_val,
                String::from("start_time") => start_time,
                String::from("end_time") => end_time,
            },
        }
    }

    /// Constructs a new sine instruction. Unspecified parameters are left out of the argument
    /// dictionary and take their defaults at evaluation.
    ///
    /// # Arguments
    ///
    /// - `freq`: The frequency of the sine wave.
    /// - `amplitude`: Optional amplitude of the sine wave.
    /// - `phase`: Optional phase offset in radians.
    /// - `dc_offset`: Optional DC offset.
    pub fn new_sine(
        freq: f64,
        amplitude: Option<f64>,
        phase: Option<f64>,
        dc_offset: Option<f64>,
    ) -> Instruction {
        let mut instr_args: InstrArgs = hashmap! {"freq".to_string() => freq};
        [
            ("amplitude", amplitude),
            ("phase", phase),
            ("offset", dc_offset),
        ]
        .iter()
        .for_each(|(key, opt_value)| {
            if let Some(value) = *opt_value {
                instr_args.insert(key.to_string(), value);
            }
        });
        Instruction {
            instr_type: InstrType::SINE,
            args: instr_args,
        }
    }

    pub fn is_const(&self) -> bool {
        self.instr_type == InstrType::CONST
    }
}
impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut args: Vec<(&String, &f64)> = self.args.iter().collect();
        args.sort_by(|a, b| a.0.cmp(b.0));
        let args_string = args
            .iter()
            .map(|(k, v)| format!("{}: {}", k, v))
            .collect::<Vec<String>>()
            .join(", ");
        write!(f, "[{}, {{{}}}]", self.instr_type, args_string)
    }
}

/// An instruction together with its tick interval during editing.
///
/// - `start_pos` is inclusive, `end_pos` exclusive.
/// - `step` is the tick spacing at which non-constant instructions are sampled.
/// - `keep_val`: hold the value reached at `end_pos` afterwards; otherwise the channel returns
///   to its default at `end_pos`.
///
/// `InstrBook` is ordered by `start_pos`.
#[derive(Clone, Debug)]
pub struct InstrBook {
    pub start_pos: usize,
    pub end_pos: usize,
    pub step: usize,
    pub keep_val: bool,
    pub instr: Instruction,
}
impl InstrBook {
    /// # Example
    /// ```
    /// # use fpgacompiler_backend::instruction::*;
    /// let book = InstrBook::new(0, 5, 1, true, Instruction::new_const(1.0)).unwrap();
    /// assert!(InstrBook::new(5, 5, 1, true, Instruction::new_const(1.0)).is_err());
    /// ```
    pub fn new(
        start_pos: usize,
        end_pos: usize,
        step: usize,
        keep_val: bool,
        instr: Instruction,
    ) -> Result<Self, CompileError> {
        if end_pos <= start_pos {
            return Err(CompileError::InvalidTime {
                what: format!("instruction {}", instr),
                time: end_pos as f64,
                reason: format!("end_pos {} should be strictly greater than start_pos {}", end_pos, start_pos),
            });
        }
        Ok(InstrBook {
            start_pos,
            end_pos,
            step: step.max(1),
            keep_val,
            instr,
        })
    }

    /// Ticks at which the instruction is sampled inside its interval.
    pub fn sample_ticks(&self) -> Vec<usize> {
        if self.instr.is_const() {
            vec![self.start_pos]
        } else {
            (self.start_pos..self.end_pos).step_by(self.step).collect()
        }
    }
}
// Support total ordering for InstrBook
impl Ord for InstrBook {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start_pos.cmp(&other.start_pos)
    }
}
impl PartialOrd for InstrBook {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl PartialEq for InstrBook {
    fn eq(&self, other: &Self) -> bool {
        self.start_pos == other.start_pos
    }
}
impl fmt::Display for InstrBook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InstrBook({}, {}-{}, {})",
            self.instr, self.start_pos, self.end_pos, self.keep_val
        )
    }
}
impl Eq for InstrBook {}
