//! The per-board worker: drives one board through a run and meets its peers at the barriers.
//!
//! ## Run sequence
//!
//! Primary and secondaries go through the same states; only the direction of each barrier
//! differs. With `k` the worker's event counter before the run:
//!
//! | step | primary                                      | secondary                                   |
//! |------|----------------------------------------------|---------------------------------------------|
//! | 1    | RESET, CONFIG, WRITE, post `start(k+1)`      | wait `start(k+1)`                           |
//! | 2    | wait `started(k+2)` from every secondary     | RESET, lock clock, CONFIG, WRITE, START, post `started(k+2)` |
//! | 3    | START, poll until end                        | poll until end                              |
//! | 4    | wait `stopped(k+3)` from every secondary     | unlock clock, STOP, post `stopped(k+3)`     |
//! | 5    | STOP, verify                                 |                                             |
//!
//! A failing worker still posts its next event with `ok == false` so its peer does not run into
//! the barrier timeout. A failing primary also posts `stopped(k+3)` with `ok == false` to every
//! secondary; secondaries watch for it while polling their board and stop early. Polling ends
//! at the latest after the stream duration plus the barrier timeout and
//! [`WorkerSettings::run_margin`], unless the board repeats forever.
//!
//! Whatever happens the counter advances by three per run, keeping both sides in step for the
//! next attempt. Messages older than the run are pruned from the mailbox when it starts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use fpgacompiler_backend::iomatrix::{self, Direction};
use fpgacompiler_backend::{BoardConfig, CompileError, CompiledBoard, Role, TickTimer};

use crate::client::{BoardClient, Transport};
use crate::error::*;
use crate::event::*;
use crate::settings::WorkerSettings;
use crate::status::*;
use crate::wire::{ConfigFrame, StatusFrame};

/// Barriers passed in one run.
pub const BARRIERS_PER_RUN: u32 = 3;
/// Status polls waiting for the external clock to lock.
pub const LOCK_POLLS: usize = 20;

/// Opens a new connection to the worker's board.
pub type Connector<T> = Box<dyn FnMut() -> Result<T, ProtocolError> + Send>;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RunReport {
    pub board: String,
    pub role: Role,
    /// Event counter the run started from.
    pub counter: u32,
    pub applied: ConfigFrame,
    pub samples: u64,
    pub board_time: u32,
    pub cycles: u32,
    /// The board lost its external clock and the loss was ignored.
    pub clock_lost: bool,
    /// Secondaries reporting a warning.
    pub peer_warnings: Vec<String>,
    pub duration: Duration,
}

fn protocol(board: &str, source: ProtocolError) -> WorkerError {
    WorkerError::Protocol {
        board: board.to_string(),
        source,
    }
}

/// The CONFIG payload of a run, built from the board and the merged worker options.
pub fn running_config(compiled: &CompiledBoard) -> Result<(ConfigFrame, ErrorPolicy), WorkerError> {
    let cfg = compiled.config();
    let opts = compiled.worker_args();
    let policy = ErrorPolicy {
        ignore_clock_loss: opts.ignore_clock_loss.unwrap_or(false),
    };

    let mut bits = CTRL_IRQ_EN | CTRL_IRQ_END_EN | CTRL_IRQ_FREQ_EN | CTRL_ERR_LOCK_EN;
    if cfg.num_racks == 2 {
        bits |= CTRL_BPS96;
    }
    if opts.ext_clock.unwrap_or(false) || cfg.role == Role::Secondary {
        bits |= CTRL_CLK_EXT;
    }
    if !cfg.peers.is_empty() {
        bits |= CTRL_AUTO_SYNC_EN;
        if cfg.role == Role::Primary {
            bits |= CTRL_AUTO_SYNC_PRIM;
        }
    }
    if policy.ignore_clock_loss {
        bits &= !CTRL_ERR_LOCK_EN;
    }

    // merged options may put a destination back on its default route
    let routes = |selection: &Option<_>, direction| -> Result<[u32; 2], WorkerError> {
        match selection {
            Some(selection) => Ok(iomatrix::merge([0, 0], selection, direction).map_err(CompileError::from)?),
            None => Ok([0, 0]),
        }
    };
    let sync_phase = opts.sync_phase.unwrap_or(0);
    let phase_mask = (1 << PHASE_BITS) - 1;
    if sync_phase >> PHASE_BITS >= PHASE_360 || sync_phase & phase_mask >= PHASE_360 {
        return Err(SettingsError::Invalid(format!(
            "sync_phase {:#x} of board {}: each field must be below {}",
            sync_phase, cfg.name, PHASE_360
        ))
        .into());
    }

    let config = ConfigFrame {
        clock_hz: cfg.clock_rate.round() as u32,
        scan_hz: cfg.bus_rate.round() as u32,
        config: opts.config.unwrap_or(bits),
        ctrl_in: routes(&opts.inputs, Direction::Input)?,
        ctrl_out: routes(&opts.outputs, Direction::Output)?,
        cycles: opts.num_cycles.unwrap_or(1),
        num_samples: compiled.num_samples() as u32,
        strb_delay: opts.strb_delay.unwrap_or(0),
        sync_wait: opts.sync_wait.unwrap_or(0),
        sync_phase,
    };
    Ok((config, policy))
}

pub struct BoardWorker<T: Transport> {
    config: BoardConfig,
    settings: WorkerSettings,
    connect: Connector<T>,
    client: BoardClient<T>,
    bus: Arc<dyn EventBus>,
    counter: u32,
    abort: Arc<AtomicBool>,
    clock_loss_warnings: u32,
}

impl<T: Transport> BoardWorker<T> {
    pub fn new(
        config: BoardConfig,
        settings: &WorkerSettings,
        bus: Arc<dyn EventBus>,
        connect: Connector<T>,
    ) -> Self {
        let mut client = BoardClient::disconnected(&config.name, settings.timeouts());
        client.set_chunk_bytes(settings.chunk_bytes);
        Self {
            counter: config.initial_counter,
            config,
            settings: settings.clone(),
            connect,
            client,
            bus,
            abort: Arc::new(AtomicBool::new(false)),
            clock_loss_warnings: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }
    pub fn client(&self) -> &BoardClient<T> {
        &self.client
    }
    pub fn counter(&self) -> u32 {
        self.counter
    }
    /// Runs which ended with an ignored clock loss.
    pub fn clock_loss_warnings(&self) -> u32 {
        self.clock_loss_warnings
    }

    /// Setting the flag ends the current run at its next status poll. The flag stays set
    /// until its owner clears it.
    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    /// Shares `flag` with other workers, so one store aborts them all.
    pub fn with_abort_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.abort = flag;
        self
    }

    /// Runs `compiled` once. On any error the board is pushed through the abort sequence.
    pub fn run(&mut self, compiled: &CompiledBoard) -> Result<RunReport, WorkerError> {
        if compiled.name() != self.config.name {
            return Err(WorkerError::Settings(SettingsError::Invalid(format!(
                "worker of {} got the stream of {}",
                self.config.name,
                compiled.name()
            ))));
        }
        let base = self.counter;
        self.counter += BARRIERS_PER_RUN;
        self.bus.prune(&self.config.name, base + 1);
        let t0 = Instant::now();
        log::info!(
            "{} ({}): run of {} samples, counter {}",
            self.config.name,
            self.config.role,
            compiled.num_samples(),
            base
        );
        let result = match self.config.role {
            Role::Primary => self.run_primary(compiled, base),
            Role::Secondary => self.run_secondary(compiled, base),
        };
        match result {
            Ok(mut report) => {
                report.duration = t0.elapsed();
                if report.clock_lost {
                    self.clock_loss_warnings += 1;
                    log::warn!(
                        "{}: {} ({} so far)",
                        self.config.name,
                        RunError::ClockLostWarning {
                            board: self.config.name.clone()
                        },
                        self.clock_loss_warnings
                    );
                }
                log::info!("{}: run finished in {:?}", self.config.name, report.duration);
                Ok(report)
            }
            Err(err) => {
                log::error!("{}: run failed: {}", self.config.name, err);
                if self.config.role == Role::Primary {
                    self.release_secondaries(base);
                }
                self.abort_board();
                Err(err)
            }
        }
    }

    /// Posts a failed `stopped` to every secondary, ending their runs.
    fn release_secondaries(&self, base: u32) {
        for peer in &self.config.peers {
            if let Err(e) = self.post(peer, EVENT_STOPPED, base + 3, false, false) {
                log::warn!("{}: cannot stop {}: {}", self.config.name, peer, e);
            }
        }
    }

    /// Pushes the board through STOP, then CLOSE or RESET and a status sweep. Idempotent.
    pub fn abort(&mut self) {
        self.abort_board();
    }

    fn abort_board(&mut self) {
        if !self.client.is_connected() {
            return;
        }
        if self.settings.close_on_abort {
            self.client.abort();
            return;
        }
        if let Err(e) = self.client.stop() {
            log::warn!("{}: STOP during abort failed: {}", self.config.name, e);
        }
        if let Err(e) = self.client.reset().and_then(|_| self.client.poll_status(false)) {
            log::warn!("{}: reset during abort failed: {}", self.config.name, e);
        }
    }

    fn post(&self, to: &str, event: &str, counter: u32, ok: bool, warn: bool) -> Result<(), WorkerError> {
        let message = EventMessage::new(event, &self.config.name, counter, ok).with_warning(warn);
        self.bus.post(to, &message)?;
        Ok(())
    }

    fn wait(&self, from: &str, event: &str, counter: u32) -> Result<EventMessage, WorkerError> {
        Ok(self.bus.wait(
            &self.config.name,
            from,
            event,
            counter,
            self.settings.barrier_timeout(),
        )?)
    }

    fn connect_and_reset(&mut self) -> Result<(), WorkerError> {
        if !self.client.is_connected() {
            let transport = (self.connect)().map_err(|e| protocol(&self.config.name, e))?;
            self.client.attach(transport);
            self.client.open().map_err(|e| protocol(&self.config.name, e))?;
        }
        self.client.reset().map_err(|e| protocol(&self.config.name, e))
    }

    /// Switches the board to the external clock and waits for the lock.
    fn lock_clock(&mut self) -> Result<(), WorkerError> {
        let ctrl = self
            .client
            .get_register(REG_CTRL)
            .map_err(|e| protocol(&self.config.name, e))?;
        self.client
            .set_register(REG_CTRL, ctrl | CTRL_CLK_EXT)
            .map_err(|e| protocol(&self.config.name, e))?;
        for _ in 0..LOCK_POLLS {
            let status = self
                .client
                .poll_status(false)
                .map_err(|e| protocol(&self.config.name, e))?;
            if StatusFlags(status.status).ext_clock_locked() {
                log::debug!("{}: external clock locked", self.config.name);
                return Ok(());
            }
            thread::sleep(self.settings.poll_interval());
        }
        Err(RunError::ClockNotLocked {
            board: self.config.name.clone(),
        }
        .into())
    }

    fn upload(&mut self, compiled: &CompiledBoard) -> Result<ConfigFrame, WorkerError> {
        let mut timer = TickTimer::new();
        let (config, policy) = running_config(compiled)?;
        self.client.set_policy(policy);
        let applied = self
            .client
            .configure(&config)
            .map_err(|e| protocol(&self.config.name, e))?;
        self.client
            .write_stream(&compiled.to_bytes())
            .map_err(|e| protocol(&self.config.name, e))?;
        timer.tick_print(&format!("{}: upload", self.config.name));
        Ok(applied)
    }

    /// Longest a run of `cycles` repetitions may take, `None` if it repeats forever.
    fn run_limit(&self, compiled: &CompiledBoard, cycles: u32) -> Option<Duration> {
        if cycles == 0 {
            return None;
        }
        let period = (compiled.stop_tick() as f64 + 1.0) / compiled.config().bus_rate;
        let stream = Duration::try_from_secs_f64(period * cycles as f64).ok()?;
        Some(stream + self.settings.barrier_timeout() + self.settings.run_margin())
    }

    /// Polls until the board ends, taking the `stopped(counter)` events of `peers` as they
    /// arrive. A peer reporting a failure ends the wait.
    ///
    /// Returns the last status, whether the clock was lost and the events taken.
    fn wait_for_end(
        &mut self,
        limit: Option<Duration>,
        peers: &[String],
        counter: u32,
    ) -> Result<(StatusFrame, bool, Vec<EventMessage>), WorkerError> {
        let t0 = Instant::now();
        let mut clock_lost = false;
        let mut taken: Vec<EventMessage> = Vec::new();
        loop {
            if self.abort.load(Ordering::Relaxed) {
                return Err(RunError::Aborted {
                    board: self.config.name.clone(),
                }
                .into());
            }
            for peer in peers {
                if taken.iter().any(|msg| &msg.from == peer) {
                    continue;
                }
                if let Some(msg) = self.bus.poll(&self.config.name, peer, EVENT_STOPPED, counter) {
                    taken.push(msg?);
                }
            }
            if let Some(limit) = limit {
                if t0.elapsed() > limit {
                    return Err(RunError::RunTimeout {
                        board: self.config.name.clone(),
                        limit,
                    }
                    .into());
                }
            }
            let status = self
                .client
                .poll_status(false)
                .map_err(|e| protocol(&self.config.name, e))?;
            let summary = StatusSummary::new(status.status, self.client.policy());
            if summary.clock_lost() && !clock_lost {
                log::warn!("{}: external clock lost ({})", self.config.name, summary.flags);
                clock_lost = true;
            }
            match summary.state {
                RunState::End => return Ok((status, clock_lost, taken)),
                RunState::Error => {
                    return Err(RunError::BoardInErrorState {
                        board: self.config.name.clone(),
                        flags: summary.flags,
                    }
                    .into())
                }
                _ => thread::sleep(self.settings.poll_interval()),
            }
        }
    }

    fn verify(&self, compiled: &CompiledBoard, applied: &ConfigFrame, status: &StatusFrame) -> Result<(), RunError> {
        let expected = compiled.num_samples() as u64 * applied.cycles as u64;
        if status.board_samples as u64 != expected {
            return Err(RunError::SampleCountMismatch {
                board: self.config.name.clone(),
                expected,
                actual: status.board_samples as u64,
            });
        }
        if status.board_time != compiled.stop_tick() {
            return Err(RunError::BoardTimeMismatch {
                board: self.config.name.clone(),
                expected: compiled.stop_tick(),
                actual: status.board_time,
            });
        }
        Ok(())
    }

    fn report(&self, base: u32, applied: ConfigFrame, status: &StatusFrame, clock_lost: bool) -> RunReport {
        RunReport {
            board: self.config.name.clone(),
            role: self.config.role,
            counter: base,
            applied,
            samples: status.board_samples as u64,
            board_time: status.board_time,
            cycles: status.board_cycles,
            clock_lost,
            peer_warnings: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    fn run_primary(&mut self, compiled: &CompiledBoard, base: u32) -> Result<RunReport, WorkerError> {
        let secondaries = self.config.peers.clone();
        let prepared = self.connect_and_reset().and_then(|_| self.upload(compiled));
        for peer in &secondaries {
            self.post(peer, EVENT_START, base + 1, prepared.is_ok(), false)?;
        }
        let applied = prepared?;
        for peer in &secondaries {
            self.wait(peer, EVENT_STARTED, base + 2)?;
        }
        self.client
            .start(applied.cycles)
            .map_err(|e| protocol(&self.config.name, e))?;
        let limit = self.run_limit(compiled, applied.cycles);
        let (status, clock_lost, early) = self.wait_for_end(limit, &secondaries, base + 3)?;

        let mut peer_warnings: Vec<String> = early
            .iter()
            .filter(|msg| msg.warn)
            .map(|msg| msg.from.clone())
            .collect();
        let mut peer_failure = None;
        for peer in &secondaries {
            if early.iter().any(|msg| &msg.from == peer) {
                continue;
            }
            match self.wait(peer, EVENT_STOPPED, base + 3) {
                Ok(msg) if msg.warn => peer_warnings.push(peer.clone()),
                Ok(_) => (),
                Err(e) => {
                    peer_failure.get_or_insert(e);
                }
            }
        }
        let stopped = self.client.stop().map_err(|e| protocol(&self.config.name, e));
        if let Some(e) = peer_failure {
            if let Err(stop_err) = &stopped {
                log::warn!("{}: {}", self.config.name, stop_err);
            }
            return Err(e);
        }
        stopped?;
        self.verify(compiled, &applied, &status)?;
        let mut report = self.report(base, applied, &status, clock_lost);
        report.peer_warnings = peer_warnings;
        Ok(report)
    }

    fn run_secondary(&mut self, compiled: &CompiledBoard, base: u32) -> Result<RunReport, WorkerError> {
        let primary = self.config.peers.first().cloned().ok_or_else(|| {
            SettingsError::Invalid(format!("secondary {} has no primary", self.config.name))
        })?;
        let started = self
            .wait(&primary, EVENT_START, base + 1)
            .and_then(|_| self.connect_and_reset())
            .and_then(|_| self.lock_clock())
            .and_then(|_| self.upload(compiled))
            .and_then(|applied| {
                self.client
                    .start(applied.cycles)
                    .map_err(|e| protocol(&self.config.name, e))?;
                Ok(applied)
            });
        self.post(&primary, EVENT_STARTED, base + 2, started.is_ok(), false)?;
        let applied = started?;

        let limit = self.run_limit(compiled, applied.cycles);
        let result = self
            .wait_for_end(limit, std::slice::from_ref(&primary), base + 3)
            .and_then(|(status, clock_lost, _)| {
                self.verify(compiled, &applied, &status)?;
                Ok(self.report(base, applied, &status, clock_lost))
            });
        // leave the external clock before the primary resets
        let unlocked = self
            .client
            .set_register(REG_CTRL, applied.config & !CTRL_MANUAL_MASK)
            .and_then(|_| self.client.stop())
            .map_err(|e| protocol(&self.config.name, e));
        let warn = result.as_ref().map_or(false, |r| r.clock_lost);
        self.post(
            &primary,
            EVENT_STOPPED,
            base + 3,
            result.is_ok() && unlocked.is_ok(),
            warn,
        )?;
        unlocked?;
        result
    }
}
