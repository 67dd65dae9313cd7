//! Control bits, status bits and register offsets of the board, and the semantic status
//! summary the worker acts on.

use std::fmt;

use serde::{Deserialize, Serialize};

// Control register
pub const CTRL_RESET: u32 = 1 << 0;
pub const CTRL_READY: u32 = 1 << 1;
pub const CTRL_RUN: u32 = 1 << 2;
pub const CTRL_RESTART_EN: u32 = 1 << 4;
pub const CTRL_AUTO_SYNC_EN: u32 = 1 << 5;
pub const CTRL_AUTO_SYNC_PRIM: u32 = 1 << 6;
pub const CTRL_BPS96: u32 = 1 << 8;
pub const CTRL_BPS96_BRD: u32 = 1 << 9;
pub const CTRL_CLK_EXT: u32 = 1 << 10;
pub const CTRL_ERR_LOCK_EN: u32 = 1 << 15;
pub const CTRL_IRQ_EN: u32 = 1 << 20;
pub const CTRL_IRQ_END_EN: u32 = 1 << 21;
pub const CTRL_IRQ_RESTART_EN: u32 = 1 << 22;
pub const CTRL_IRQ_FREQ_EN: u32 = 1 << 23;
pub const CTRL_IRQ_DATA_EN: u32 = 1 << 24;

/// Bits cleared to leave the external clock and auto-sync, e.g. before the primary resets.
pub const CTRL_MANUAL_MASK: u32 = CTRL_CLK_EXT | CTRL_AUTO_SYNC_EN | CTRL_AUTO_SYNC_PRIM;

// Status register
pub const STATUS_RESET: u32 = 1 << 0;
pub const STATUS_READY: u32 = 1 << 1;
pub const STATUS_RUN: u32 = 1 << 2;
pub const STATUS_END: u32 = 1 << 3;
pub const STATUS_WAIT: u32 = 1 << 4;
pub const STATUS_AUTO_SYNC: u32 = 1 << 5;
pub const STATUS_SYNC_TIMEOUT: u32 = 1 << 6;
pub const STATUS_PHASE_SHIFTING: u32 = 1 << 7;
pub const STATUS_TX_FULL: u32 = 1 << 8;
pub const STATUS_RX_FULL: u32 = 1 << 9;
pub const STATUS_EXT_USED: u32 = 1 << 10;
pub const STATUS_EXT_LOCKED: u32 = 1 << 11;
pub const STATUS_ERR_TX: u32 = 1 << 12;
pub const STATUS_ERR_RX: u32 = 1 << 13;
pub const STATUS_ERR_TIME: u32 = 1 << 14;
pub const STATUS_ERR_LOCK: u32 = 1 << 15;
pub const STATUS_ERR_TKEEP: u32 = 0b111 << 16;
pub const STATUS_IRQ_ERROR: u32 = 1 << 20;
pub const STATUS_IRQ_END: u32 = 1 << 21;
pub const STATUS_IRQ_RESTART: u32 = 1 << 22;
pub const STATUS_IRQ_STATE: u32 = 1 << 23;
pub const STATUS_IRQ_FPGA: u32 = 1 << 24;
pub const STATUS_IRQ_DATA: u32 = 1 << 25;
pub const STATUS_BTN_0: u32 = 1 << 30;
pub const STATUS_BTN_1: u32 = 1 << 31;

pub const STATUS_ERRORS: u32 =
    STATUS_ERR_TX | STATUS_ERR_RX | STATUS_ERR_TIME | STATUS_ERR_LOCK | STATUS_ERR_TKEEP;

// Register offsets
pub const REG_CTRL: u32 = 0x00;
pub const REG_CTRL_IN0: u32 = 0x04;
pub const REG_CTRL_IN1: u32 = 0x08;
pub const REG_CTRL_OUT0: u32 = 0x0C;
pub const REG_CTRL_OUT1: u32 = 0x10;
pub const REG_CLK_DIV: u32 = 0x14;
pub const REG_STRB_DELAY: u32 = 0x18;
pub const REG_SYNC_DELAY: u32 = 0x1C;
pub const REG_SYNC_PHASE: u32 = 0x20;
pub const REG_NUM_SAMPLES: u32 = 0x24;
pub const REG_NUM_CYCLES: u32 = 0x28;
pub const REG_STATUS: u32 = 0x40;
pub const REG_BOARD_TIME: u32 = 0x44;
pub const REG_BOARD_SAMPLES: u32 = 0x48;
pub const REG_BOARD_CYCLES: u32 = 0x4C;

// Sync phase
pub const PHASE_BITS: u32 = 12;
pub const PHASE_360: u32 = 1120;

/// Packs external and detector phase into the SYNC_PHASE register.
pub fn sync_phase(phase_ext: u32, phase_det: u32) -> u32 {
    ((phase_ext % PHASE_360) << PHASE_BITS) | (phase_det % PHASE_360)
}

/// Packs `[strb0_start, strb0_end, strb1_start, strb1_end]` (board clock cycles) into the
/// STRB_DELAY register, first field in the low byte.
pub fn strb_delay(fields: [u8; 4]) -> u32 {
    u32::from_le_bytes(fields)
}

const FLAG_NAMES: [(u32, &str); 27] = [
    (STATUS_RESET, "reset"),
    (STATUS_READY, "ready"),
    (STATUS_RUN, "run"),
    (STATUS_END, "end"),
    (STATUS_WAIT, "wait"),
    (STATUS_AUTO_SYNC, "auto_sync"),
    (STATUS_SYNC_TIMEOUT, "sync_timeout"),
    (STATUS_PHASE_SHIFTING, "phase_shifting"),
    (STATUS_TX_FULL, "tx_full"),
    (STATUS_RX_FULL, "rx_full"),
    (STATUS_EXT_USED, "ext_clock_used"),
    (STATUS_EXT_LOCKED, "ext_clock_locked"),
    (STATUS_ERR_TX, "err_tx"),
    (STATUS_ERR_RX, "err_rx"),
    (STATUS_ERR_TIME, "err_time"),
    (STATUS_ERR_LOCK, "err_lock"),
    (1 << 16, "err_tkeep0"),
    (1 << 17, "err_tkeep1"),
    (1 << 18, "err_tkeep2"),
    (STATUS_IRQ_ERROR, "irq_error"),
    (STATUS_IRQ_END, "irq_end"),
    (STATUS_IRQ_RESTART, "irq_restart"),
    (STATUS_IRQ_STATE, "irq_state"),
    (STATUS_IRQ_FPGA, "irq_fpga"),
    (STATUS_IRQ_DATA, "irq_data"),
    (STATUS_BTN_0, "btn_0"),
    (STATUS_BTN_1, "btn_1"),
];

/// Raw status word with named accessors. `Display` lists the set flags.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StatusFlags(pub u32);

impl StatusFlags {
    pub fn bits(&self) -> u32 {
        self.0
    }
    pub fn contains(&self, mask: u32) -> bool {
        self.0 & mask == mask
    }
    pub fn any(&self, mask: u32) -> bool {
        self.0 & mask != 0
    }
    pub fn running(&self) -> bool {
        self.any(STATUS_RUN)
    }
    pub fn ended(&self) -> bool {
        self.any(STATUS_END)
    }
    pub fn waiting(&self) -> bool {
        self.any(STATUS_WAIT)
    }
    pub fn ext_clock_used(&self) -> bool {
        self.any(STATUS_EXT_USED)
    }
    pub fn ext_clock_locked(&self) -> bool {
        self.any(STATUS_EXT_LOCKED)
    }
    pub fn names(&self) -> Vec<&'static str> {
        FLAG_NAMES
            .iter()
            .filter(|(mask, _)| self.any(*mask))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for StatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#010x} [{}]", self.0, self.names().join(", "))
    }
}

/// Which status error bits fail a run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPolicy {
    /// Loss of the external clock is a warning instead of an error.
    pub ignore_clock_loss: bool,
}

impl ErrorPolicy {
    pub fn error_mask(&self) -> u32 {
        if self.ignore_clock_loss {
            STATUS_ERRORS & !STATUS_ERR_LOCK
        } else {
            STATUS_ERRORS
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    /// Configured, not started.
    Idle,
    Running,
    /// Halted at a STOP sample, waiting for the restart trigger.
    Waiting,
    /// Restarted after a wait.
    Restart,
    End,
    Error,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub state: RunState,
    pub flags: StatusFlags,
    /// Error bits under the policy's mask.
    pub errors: u32,
    pub clock_locked: bool,
    pub clock_lost_but_running: bool,
    pub clock_lost_at_end: bool,
}

impl StatusSummary {
    /// Interprets a status word under `policy`.
    ///
    /// # Example
    /// ```
    /// use fpgactrl_backend::status::*;
    ///
    /// let lost = STATUS_RUN | STATUS_EXT_USED | STATUS_ERR_LOCK;
    /// let strict = StatusSummary::new(lost, ErrorPolicy::default());
    /// assert_eq!(strict.state, RunState::Error);
    ///
    /// let lenient = StatusSummary::new(lost, ErrorPolicy { ignore_clock_loss: true });
    /// assert_eq!(lenient.state, RunState::Running);
    /// assert!(lenient.clock_lost_but_running);
    /// ```
    pub fn new(status: u32, policy: ErrorPolicy) -> Self {
        let flags = StatusFlags(status);
        let errors = status & policy.error_mask();
        let state = if errors != 0 {
            RunState::Error
        } else if flags.ended() {
            RunState::End
        } else if flags.waiting() {
            RunState::Waiting
        } else if flags.running() && flags.any(STATUS_IRQ_RESTART) {
            RunState::Restart
        } else if flags.running() {
            RunState::Running
        } else {
            RunState::Idle
        };
        let clock_lost =
            flags.any(STATUS_ERR_LOCK) || (flags.ext_clock_used() && !flags.ext_clock_locked());
        let active = matches!(state, RunState::Running | RunState::Waiting | RunState::Restart);
        Self {
            state,
            flags,
            errors,
            clock_locked: flags.ext_clock_locked(),
            clock_lost_but_running: clock_lost && active,
            clock_lost_at_end: clock_lost && state == RunState::End,
        }
    }

    pub fn finished(&self) -> bool {
        matches!(self.state, RunState::End | RunState::Error)
    }

    pub fn clock_lost(&self) -> bool {
        self.clock_lost_but_running || self.clock_lost_at_end
    }
}

#[cfg(test)]
mod test {
    mod summary {
        use crate::status::*;

        #[test]
        fn states() {
            let policy = ErrorPolicy::default();
            assert_eq!(StatusSummary::new(STATUS_READY, policy).state, RunState::Idle);
            assert_eq!(StatusSummary::new(STATUS_RUN, policy).state, RunState::Running);
            assert_eq!(
                StatusSummary::new(STATUS_RUN | STATUS_WAIT, policy).state,
                RunState::Waiting
            );
            assert_eq!(
                StatusSummary::new(STATUS_RUN | STATUS_IRQ_RESTART, policy).state,
                RunState::Restart
            );
            assert_eq!(StatusSummary::new(STATUS_END, policy).state, RunState::End);
            let err = StatusSummary::new(STATUS_END | STATUS_ERR_TIME, policy);
            assert_eq!(err.state, RunState::Error);
            assert_eq!(err.errors, STATUS_ERR_TIME);
            assert!(err.finished());
        }

        #[test]
        fn clock_loss_policy() {
            let lenient = ErrorPolicy {
                ignore_clock_loss: true,
            };
            let end = StatusSummary::new(STATUS_END | STATUS_EXT_USED, lenient);
            assert_eq!(end.state, RunState::End);
            assert!(end.clock_lost_at_end);
            assert!(!end.clock_lost_but_running);

            let locked = StatusSummary::new(STATUS_END | STATUS_EXT_USED | STATUS_EXT_LOCKED, lenient);
            assert!(locked.clock_locked);
            assert!(!locked.clock_lost());

            assert_eq!(ErrorPolicy::default().error_mask() & STATUS_ERR_LOCK, STATUS_ERR_LOCK);
            assert_eq!(lenient.error_mask() & STATUS_ERR_LOCK, 0);
        }
    }

    mod registers {
        use crate::status::*;

        #[test]
        fn packing() {
            assert_eq!(sync_phase(1, 2), (1 << 12) | 2);
            assert_eq!(sync_phase(PHASE_360 + 5, 0), 5 << 12);
            assert_eq!(strb_delay([1, 2, 3, 4]), 0x0403_0201);
            assert_eq!(CTRL_MANUAL_MASK & CTRL_CLK_EXT, CTRL_CLK_EXT);
        }

        #[test]
        fn flag_names() {
            let flags = StatusFlags(STATUS_RUN | STATUS_EXT_LOCKED | STATUS_BTN_1);
            assert_eq!(flags.names(), vec!["run", "ext_clock_locked", "btn_1"]);
            assert!(flags.to_string().starts_with("0x80000804"));
            assert!(flags.contains(STATUS_RUN | STATUS_EXT_LOCKED));
            assert!(!flags.contains(STATUS_RUN | STATUS_END));
        }
    }
}
