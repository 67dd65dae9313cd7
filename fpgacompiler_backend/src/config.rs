//! Board configuration and in-script worker options.

use serde::{Deserialize, Serialize};

use crate::bits::{BIT_STRB_POS, STRB_POS_RANGE};
use crate::error::CompileError;
use crate::iomatrix::Selection;

pub const DEFAULT_PORT: u16 = 49701;
pub const DEFAULT_BUS_RATE: f64 = 1e6;
pub const DEFAULT_CLOCK_RATE: f64 = 100e6;
pub const MAX_RACKS: usize = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Primary,
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Role::Primary => "primary",
                Role::Secondary => "secondary",
            }
        )
    }
}

/// Static description of one board, fixed for a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub name: String,
    /// `ip[:port]`, port defaults to [`DEFAULT_PORT`].
    pub endpoint: String,
    /// Output bus rate in Hz.
    pub bus_rate: f64,
    /// Board clock in Hz.
    pub clock_rate: f64,
    pub num_racks: usize,
    pub role: Role,
    /// For the primary: every secondary. For a secondary: the primary.
    pub peers: Vec<String>,
    /// Toggle the strobe bit on every other retained sample.
    pub auto_strb: bool,
    /// Re-run each codec's decoder on every written value.
    pub check_codecs: bool,
    pub strb_pos: u32,
    /// Event counter both sides of a multi-board run start from.
    pub initial_counter: u32,
    /// Sample rate used to pre-expand ramps, in Hz. `None` samples ramps at the bus rate.
    pub ramp_rate: Option<f64>,
    /// Options applied when neither the run nor the script sets them.
    pub defaults: WorkerOptions,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            endpoint: format!("127.0.0.1:{}", DEFAULT_PORT),
            bus_rate: DEFAULT_BUS_RATE,
            clock_rate: DEFAULT_CLOCK_RATE,
            num_racks: 1,
            role: Role::Primary,
            peers: Vec::new(),
            auto_strb: true,
            check_codecs: false,
            strb_pos: BIT_STRB_POS,
            initial_counter: 0,
            ramp_rate: None,
            defaults: WorkerOptions::default(),
        }
    }
}

impl BoardConfig {
    pub fn new(name: &str, endpoint: &str, bus_rate: f64, num_racks: usize, role: Role) -> Self {
        Self {
            name: name.to_string(),
            endpoint: endpoint.to_string(),
            bus_rate,
            num_racks,
            role,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        let invalid = |reason: String| CompileError::InvalidAddressOrChannel {
            what: format!("Board {}", self.name),
            reason,
        };
        if self.name.is_empty() {
            return Err(invalid("empty board name".to_string()));
        }
        if !(1..=MAX_RACKS).contains(&self.num_racks) {
            return Err(invalid(format!("{} racks, expected 1 or 2", self.num_racks)));
        }
        if !(self.bus_rate.is_finite() && self.bus_rate > 0.0) {
            return Err(invalid(format!("bus rate {}", self.bus_rate)));
        }
        if !(self.clock_rate.is_finite() && self.clock_rate >= self.bus_rate) {
            return Err(invalid(format!(
                "board clock {} is below the bus rate {}",
                self.clock_rate, self.bus_rate
            )));
        }
        if !STRB_POS_RANGE.contains(&self.strb_pos) {
            return Err(invalid(format!(
                "strobe bit position {} outside {:?}",
                self.strb_pos, STRB_POS_RANGE
            )));
        }
        if let Some(rate) = self.ramp_rate {
            if !(rate.is_finite() && rate > 0.0 && rate <= self.bus_rate) {
                return Err(invalid(format!("ramp rate {}", rate)));
            }
        }
        if self.role == Role::Secondary && self.peers.len() != 1 {
            return Err(invalid(format!(
                "a secondary needs exactly one primary peer, got {:?}",
                self.peers
            )));
        }
        Ok(())
    }

    /// Bus ticks between two ramp samples.
    pub fn ramp_step(&self) -> usize {
        match self.ramp_rate {
            Some(rate) => ((self.bus_rate / rate).round() as usize).max(1),
            None => 1,
        }
    }
}

/// Run options a worker recognises. Unset fields fall back to the board defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Full control word in running mode.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Selection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Selection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext_clock: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignore_clock_loss: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_wait: Option<u32>,
    /// `(phase_ext << 12) | phase_det`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_phase: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strb_delay: Option<u32>,
    /// 0 repeats forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_cycles: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simulate: Option<bool>,
}

fn merge_selection(defaults: &Option<Selection>, overrides: &Option<Selection>) -> Option<Selection> {
    match (defaults, overrides) {
        (None, None) => None,
        (Some(d), None) => Some(d.clone()),
        (None, Some(o)) => Some(o.clone()),
        (Some(d), Some(o)) => {
            let mut merged = d.clone();
            for (dest, route) in o.iter() {
                merged.insert(dest.clone(), route.clone());
            }
            Some(merged)
        }
    }
}

impl WorkerOptions {
    /// `overrides` wins field by field; routing selections are merged per destination.
    ///
    /// # Example
    /// ```
    /// use fpgacompiler_backend::config::WorkerOptions;
    ///
    /// let defaults = WorkerOptions { num_cycles: Some(1), ext_clock: Some(false), ..Default::default() };
    /// let script = WorkerOptions { ext_clock: Some(true), ..Default::default() };
    /// let merged = WorkerOptions::merged(&defaults, &script);
    /// assert_eq!(merged.num_cycles, Some(1));
    /// assert_eq!(merged.ext_clock, Some(true));
    /// ```
    pub fn merged(defaults: &WorkerOptions, overrides: &WorkerOptions) -> WorkerOptions {
        WorkerOptions {
            config: overrides.config.or(defaults.config),
            inputs: merge_selection(&defaults.inputs, &overrides.inputs),
            outputs: merge_selection(&defaults.outputs, &overrides.outputs),
            ext_clock: overrides.ext_clock.or(defaults.ext_clock),
            ignore_clock_loss: overrides.ignore_clock_loss.or(defaults.ignore_clock_loss),
            sync_wait: overrides.sync_wait.or(defaults.sync_wait),
            sync_phase: overrides.sync_phase.or(defaults.sync_phase),
            strb_delay: overrides.strb_delay.or(defaults.strb_delay),
            num_cycles: overrides.num_cycles.or(defaults.num_cycles),
            simulate: overrides.simulate.or(defaults.simulate),
        }
    }

    /// Names of the options which are set.
    pub fn keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        let flags = [
            ("config", self.config.is_some()),
            ("inputs", self.inputs.is_some()),
            ("outputs", self.outputs.is_some()),
            ("ext_clock", self.ext_clock.is_some()),
            ("ignore_clock_loss", self.ignore_clock_loss.is_some()),
            ("sync_wait", self.sync_wait.is_some()),
            ("sync_phase", self.sync_phase.is_some()),
            ("strb_delay", self.strb_delay.is_some()),
            ("num_cycles", self.num_cycles.is_some()),
            ("simulate", self.simulate.is_some()),
        ];
        for (key, set) in flags {
            if set {
                keys.push(key);
            }
        }
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.keys().is_empty()
    }
}

#[cfg(test)]
mod test {
    mod board {
        use crate::config::*;

        #[test]
        fn validation() {
            let cfg = BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary);
            assert!(cfg.validate().is_ok());
            assert!(BoardConfig { num_racks: 3, ..cfg.clone() }.validate().is_err());
            assert!(BoardConfig { strb_pos: 22, ..cfg.clone() }.validate().is_err());
            assert!(BoardConfig { bus_rate: 0.0, ..cfg.clone() }.validate().is_err());
            assert!(BoardConfig { role: Role::Secondary, ..cfg.clone() }.validate().is_err());
            let sec = BoardConfig {
                role: Role::Secondary,
                peers: vec!["main".to_string()],
                ..cfg
            };
            assert!(sec.validate().is_ok());
        }

        #[test]
        fn ramp_step() {
            let mut cfg = BoardConfig::new("main", "10.0.0.2", 1e6, 1, Role::Primary);
            assert_eq!(cfg.ramp_step(), 1);
            cfg.ramp_rate = Some(1e5);
            assert_eq!(cfg.ramp_step(), 10);
        }
    }

    mod options {
        use crate::config::*;
        use crate::iomatrix::*;

        #[test]
        fn merge_routes_per_destination() {
            let mut d_in = Selection::new();
            d_in.insert("trigger_start".to_string(), Route::new("in0", "rising"));
            d_in.insert("trigger_stop".to_string(), Route::new("in1", "falling"));
            let mut s_in = Selection::new();
            s_in.insert("trigger_stop".to_string(), Route::new("in2", "level"));
            let defaults = WorkerOptions {
                inputs: Some(d_in),
                num_cycles: Some(3),
                ..Default::default()
            };
            let script = WorkerOptions {
                inputs: Some(s_in),
                simulate: Some(true),
                ..Default::default()
            };
            let merged = WorkerOptions::merged(&defaults, &script);
            let inputs = merged.inputs.clone().unwrap();
            assert_eq!(inputs["trigger_start"], Route::new("in0", "rising"));
            assert_eq!(inputs["trigger_stop"], Route::new("in2", "level"));
            assert_eq!(merged.keys(), vec!["inputs", "num_cycles", "simulate"]);
            assert!(WorkerOptions::default().is_empty());
        }
    }
}
