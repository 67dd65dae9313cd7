use std::time::Instant;

use crate::error::CompileError;

/// Utility for timing compile stages; elapsed times go to the `debug` log.
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Milliseconds since the previous tick (or construction).
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    pub fn tick_print(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

/// Number of decimal digits that resolve one tick at `rate`, e.g. 6 at 1 MHz.
pub fn decimal_digits(rate: f64) -> i32 {
    rate.log10().ceil().max(0.0) as i32
}

/// Rounds `t` (ties to even) to the decimal resolution of `rate`.
pub fn quantise_time(t: f64, rate: f64) -> f64 {
    let scale = 10f64.powi(decimal_digits(rate));
    (t * scale).round_ties_even() / scale
}

/// Tick of time `t` on a clock of `rate` Hz.
///
/// # Example
/// ```
/// use fpgacompiler_backend::utils::tick_of;
///
/// assert_eq!(tick_of(0.000003, 1e6, "example").unwrap(), 3);
/// assert_eq!(tick_of(2.4e-6, 1e6, "example").unwrap(), 2);
/// assert!(tick_of(-1.0, 1e6, "example").is_err());
/// ```
pub fn tick_of(t: f64, rate: f64, what: &str) -> Result<usize, CompileError> {
    let invalid = |reason: &str| CompileError::InvalidTime {
        what: what.to_string(),
        time: t,
        reason: reason.to_string(),
    };
    if !t.is_finite() {
        return Err(invalid("time is not finite"));
    }
    let tick = (quantise_time(t, rate) * rate).round_ties_even();
    if tick < 0.0 {
        return Err(invalid("time is negative"));
    }
    if tick > u32::MAX as f64 {
        return Err(invalid("time is beyond the 32-bit tick range"));
    }
    Ok(tick as usize)
}

/// Time in seconds of `tick` on a clock of `rate` Hz.
pub fn time_of(tick: usize, rate: f64) -> f64 {
    tick as f64 / rate
}

#[cfg(test)]
mod test {
    mod quantise {
        use crate::utils::*;

        #[test]
        fn digits() {
            assert_eq!(decimal_digits(1e6), 6);
            assert_eq!(decimal_digits(20e6), 8);
            assert_eq!(decimal_digits(1.0), 0);
        }

        #[test]
        fn ticks() {
            assert_eq!(tick_of(0.0, 1e6, "t").unwrap(), 0);
            assert_eq!(tick_of(0.000001, 1e6, "t").unwrap(), 1);
            assert_eq!(tick_of(0.0000049999999, 1e6, "t").unwrap(), 5);
            assert_eq!(tick_of(0.5, 1.0, "t").unwrap(), 0);
            assert_eq!(tick_of(1.5, 1.0, "t").unwrap(), 2);
            assert!(matches!(
                tick_of(f64::NAN, 1e6, "t"),
                Err(CompileError::InvalidTime { .. })
            ));
            assert!(tick_of(1e4, 1e6, "t").is_err());
            assert_eq!(time_of(5, 1e6), 5e-6);
        }
    }
}
