//! # Running compiled experiments on boards with the `experiment` Module
//!
//! The [`Experiment`] here extends [`fpgacompiler_backend::Experiment`] with the run stage: it
//! compiles every board, then drives each one through the worker sequence of
//! [`crate::worker`] on its own thread. The workers of one experiment meet at their barriers
//! through a shared [`LocalEventBus`].
//!
//! ## How to Use:
//!
//! 1. **Initialization:** [`Experiment::new`] or [`Experiment::with_settings`], the latter
//!    registering the boards of a [`WorkerSettings`] table.
//! 2. **Experiment design:** the editing methods of [`fpgacompiler_backend::BaseExperiment`].
//! 3. **Running:** [`Experiment::run`] for a number of repetitions, [`Experiment::abort`] from
//!    another thread, [`Experiment::reset_boards`] to bring every board back to a known state.
//!
//! Boards whose worker options set `simulate` run against a [`SimBoard`] instead of a socket.
//!
//! ```
//! use fpgacompiler_backend::*;
//! use fpgactrl_backend::Experiment;
//!
//! let mut exp = Experiment::new();
//! exp.add_board(BoardConfig::new("main", "127.0.0.1", 1e6, 1, Role::Primary)).unwrap();
//! exp.add_pseudoclock("main", "pc").unwrap();
//! exp.add_clockline("main", "pc", "cl").unwrap();
//! exp.add_digital_bank("main", "cl", "bank0", 0, 0x05).unwrap();
//! exp.add_digital_line("main", "bank0", "do0", 0, false).unwrap();
//! exp.high("main", "do0", 1e-6, 2e-6).unwrap();
//! exp.set_worker_options("main", &WorkerOptions { simulate: Some(true), ..Default::default() }).unwrap();
//!
//! let reports = exp.run(2).unwrap();
//! assert_eq!(reports.len(), 2);
//! assert_eq!(reports[1]["main"].samples, 4);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use indexmap::IndexMap;

use fpgacompiler_backend::*;

use crate::client::{BoardClient, TcpTransport, Transport};
use crate::error::{CoordinationError, ProtocolError, RunError, WorkerError};
use crate::event::{EventBus, LocalEventBus};
use crate::settings::WorkerSettings;
use crate::sim::SimBoard;
use crate::worker::{BoardWorker, Connector, RunReport};

/// An extended version of [`fpgacompiler_backend::Experiment`] able to run its boards.
///
/// Editing and compiling follow [`BaseExperiment`]; the run stage adds worker settings and an
/// abort flag shared by every worker of a run.
#[cfg_attr(feature = "pybindings", pyo3::pyclass)]
#[derive(Default)]
pub struct Experiment {
    boards: IndexMap<String, Board>,
    settings: WorkerSettings,
    abort: Arc<AtomicBool>,
}

impl_exp_boilerplate!(Experiment);

type BoxedWorker = BoardWorker<Box<dyn Transport>>;

impl Experiment {
    pub fn new() -> Self {
        Self::default()
    }

    /// An experiment with every board of `settings` registered.
    pub fn with_settings(settings: WorkerSettings) -> Result<Self, CompileError> {
        let mut exp = Self::new();
        for config in settings.boards.values() {
            exp.add_board(config.clone())?;
        }
        exp.settings = settings;
        Ok(exp)
    }

    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }
    pub fn settings_(&mut self) -> &mut WorkerSettings {
        &mut self.settings
    }

    /// Ends the running repetition at the next status poll of every board.
    pub fn abort(&self) {
        log::warn!("Abort requested");
        self.abort.store(true, Ordering::Relaxed);
    }

    pub fn abort_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.abort)
    }

    fn connector(&self, config: &BoardConfig, simulate: bool) -> Connector<Box<dyn Transport>> {
        if simulate {
            let sim = SimBoard::new(&config.name);
            return Box::new(move || Ok(Box::new(sim.connection()) as Box<dyn Transport>));
        }
        let endpoint = config.endpoint.clone();
        let timeout = self.settings.timeouts().connect;
        Box::new(move || {
            TcpTransport::connect(&endpoint, timeout).map(|t| Box::new(t) as Box<dyn Transport>)
        })
    }

    fn workers<'a>(
        &self,
        compiled: &'a IndexMap<String, CompiledBoard>,
        bus: &Arc<dyn EventBus>,
    ) -> Vec<(BoxedWorker, &'a CompiledBoard)> {
        compiled
            .values()
            .map(|board| {
                let simulate = board.worker_args().simulate.unwrap_or(false);
                let worker = BoardWorker::new(
                    board.config().clone(),
                    &self.settings,
                    Arc::clone(bus),
                    self.connector(board.config(), simulate),
                )
                .with_abort_flag(Arc::clone(&self.abort));
                (worker, board)
            })
            .collect()
    }

    /// Runs one repetition, every worker on its own thread. The first failing worker raises
    /// `abort` so the others end at their next poll.
    fn run_once(
        workers: &mut [(BoxedWorker, &CompiledBoard)],
        abort: &AtomicBool,
    ) -> IndexMap<String, Result<RunReport, WorkerError>> {
        let names: Vec<String> = workers.iter().map(|(w, _)| w.name().to_string()).collect();
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut panicked = Vec::new();
        thread::scope(|s| {
            let mut handles = Vec::new();
            for (worker, compiled) in workers.iter_mut() {
                let tx = tx.clone();
                let compiled: &CompiledBoard = *compiled;
                let name = worker.name().to_string();
                let spawned = thread::Builder::new()
                    .name(format!("{}_worker", name))
                    .spawn_scoped(s, move || {
                        let result = worker.run(compiled);
                        if result.is_err() {
                            abort.store(true, Ordering::Relaxed);
                        }
                        if tx.send((worker.name().to_string(), result)).is_err() {
                            log::error!("Result of {} dropped", worker.name());
                        }
                    });
                match spawned {
                    Ok(handle) => handles.push((name, handle)),
                    Err(e) => {
                        log::error!("Cannot start worker of {}: {}", name, e);
                        abort.store(true, Ordering::Relaxed);
                        panicked.push(name);
                    }
                }
            }
            for (name, handle) in handles {
                if handle.join().is_err() {
                    abort.store(true, Ordering::Relaxed);
                    panicked.push(name);
                }
            }
        });
        drop(tx);
        let mut results: HashMap<String, Result<RunReport, WorkerError>> = rx.iter().collect();
        for name in panicked {
            results.insert(name.clone(), Err(WorkerError::Panicked(name)));
        }
        names
            .into_iter()
            .filter_map(|name| results.remove(&name).map(|r| (name, r)))
            .collect()
    }

    /// Compiles every board and runs them `reps` times.
    ///
    /// Returns the reports of every repetition. The first failing repetition stops the run with
    /// the error of its root cause: boards that only ended because another one failed rank last,
    /// ties go by board order.
    pub fn run(&self, reps: usize) -> Result<Vec<IndexMap<String, RunReport>>, WorkerError> {
        let mut timer = TickTimer::new();
        let compiled = self.compile_all(None)?;
        timer.tick_print("compile");
        self.abort.store(false, Ordering::Relaxed);
        let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
        let mut workers = self.workers(&compiled, &bus);

        let mut reports = Vec::with_capacity(reps);
        for rep in 0..reps {
            log::info!("Repetition {} of {}", rep + 1, reps);
            let mut rep_reports = IndexMap::new();
            let mut failure: Option<WorkerError> = None;
            for (name, result) in Self::run_once(&mut workers, &self.abort) {
                match result {
                    Ok(report) => {
                        rep_reports.insert(name, report);
                    }
                    Err(e) => {
                        log::error!("{}: {}", name, e);
                        if failure.as_ref().map_or(true, |f| consequence_rank(&e) < consequence_rank(f)) {
                            failure = Some(e);
                        }
                    }
                }
            }
            if let Some(e) = failure {
                return Err(e);
            }
            timer.tick_print(&format!("repetition {}", rep + 1));
            reports.push(rep_reports);
            if self.abort.load(Ordering::Relaxed) {
                break;
            }
        }
        Ok(reports)
    }

    /// Connects to a board, RESETs it and closes again.
    pub fn reset_board(&self, name: &str) -> Result<(), WorkerError> {
        let board = self.board(name)?;
        let config = board.config().clone();
        let simulate = WorkerOptions::merged(&config.defaults, board.worker_args())
            .simulate
            .unwrap_or(false);
        let mut connect = self.connector(&config, simulate);
        let protocol = |source: ProtocolError| WorkerError::Protocol {
            board: name.to_string(),
            source,
        };
        let mut client = BoardClient::new(name, connect().map_err(protocol)?, self.settings.timeouts());
        client.open().map_err(protocol)?;
        client.reset().map_err(protocol)?;
        let status = client.poll_status(false).map_err(protocol)?;
        log::info!("{}: reset, status {:#010x}", name, status.status);
        client.close().map_err(protocol)
    }

    pub fn reset_boards(&self) -> Result<(), WorkerError> {
        for name in self.boards.keys() {
            self.reset_board(name)?;
        }
        Ok(())
    }
}

/// 0 for a failure of its own, 1 for a peer's reported failure, 2 for an abort.
fn consequence_rank(err: &WorkerError) -> u8 {
    match err {
        WorkerError::Run(RunError::Aborted { .. }) => 2,
        WorkerError::Coordination(CoordinationError::PeerReportedFailure { .. }) => 1,
        _ => 0,
    }
}

#[cfg(feature = "pybindings")]
fn to_py_run_err(err: WorkerError) -> pyo3::PyErr {
    pyo3::exceptions::PyRuntimeError::new_err(err.to_string())
}

#[cfg(feature = "pybindings")]
#[pyo3::pymethods]
impl Experiment {
    /// Constructor for the `Experiment` class.
    ///
    /// # Example (python)
    /// ```python
    /// from fpgactrl_backend import Experiment
    ///
    /// exp = Experiment()
    /// exp.add_board("main", "10.0.0.2", 1e6)
    /// ```
    #[new]
    pub fn py_new() -> Self {
        Self::new()
    }

    /// Reads the worker settings and registers their boards.
    #[staticmethod]
    pub fn from_settings(path: &str) -> pyo3::PyResult<Self> {
        let settings = WorkerSettings::from_toml(std::path::Path::new(path))
            .map_err(|e| to_py_run_err(e.into()))?;
        Self::with_settings(settings).map_err(to_py_err)
    }

    /// Runs `reps` repetitions; returns the reports as a JSON string.
    #[pyo3(name = "run", signature = (reps=1))]
    pub fn py_run(&self, reps: usize) -> pyo3::PyResult<String> {
        let reports = self.run(reps).map_err(to_py_run_err)?;
        serde_json::to_string(&reports)
            .map_err(|e| pyo3::exceptions::PyRuntimeError::new_err(e.to_string()))
    }

    #[pyo3(name = "abort")]
    pub fn py_abort(&self) {
        self.abort();
    }

    #[pyo3(name = "reset_board")]
    pub fn py_reset_board(&self, name: &str) -> pyo3::PyResult<()> {
        self.reset_board(name).map_err(to_py_run_err)
    }

    #[pyo3(name = "reset_boards")]
    pub fn py_reset_boards(&self) -> pyo3::PyResult<()> {
        self.reset_boards().map_err(to_py_run_err)
    }
}

#[cfg(test)]
mod test {
    mod run {
        use fpgacompiler_backend::*;

        use crate::error::*;
        use crate::experiment::Experiment;
        use crate::settings::WorkerSettings;

        fn simulated(name: &str, role: Role, peers: &[&str]) -> BoardConfig {
            let mut cfg = BoardConfig::new(name, "127.0.0.1", 1e6, 1, role);
            cfg.peers = peers.iter().map(|p| p.to_string()).collect();
            cfg.defaults.simulate = Some(true);
            cfg
        }

        fn pulse(exp: &mut Experiment, board: &str, t: f64) {
            exp.add_pseudoclock(board, "pc").unwrap();
            exp.add_clockline(board, "pc", "cl").unwrap();
            exp.add_digital_bank(board, "cl", "bank", 0, 0x02).unwrap();
            exp.add_digital_line(board, "bank", "trig", 1, false).unwrap();
            exp.high(board, "trig", t, 2e-6).unwrap();
        }

        #[test]
        fn settings_register_boards() {
            let mut settings = WorkerSettings::default();
            settings
                .boards
                .insert("main".to_string(), simulated("main", Role::Primary, &["aux"]));
            settings
                .boards
                .insert("aux".to_string(), simulated("aux", Role::Secondary, &["main"]));
            let mut exp = Experiment::with_settings(settings).unwrap();
            pulse(&mut exp, "main", 1e-6);
            pulse(&mut exp, "aux", 5e-6);
            exp.settings_().barrier_timeout_ms = 2000;

            let reports = exp.run(1).unwrap();
            assert_eq!(reports[0].keys().collect::<Vec<_>>(), vec!["main", "aux"]);
            assert_eq!(reports[0]["main"].counter, 0);
            assert_eq!(reports[0]["aux"].board_time, 8);
            exp.reset_boards().unwrap();
        }

        #[test]
        fn missing_peer_fails_the_run() {
            let mut exp = Experiment::new();
            exp.add_board(simulated("main", Role::Primary, &["ghost"])).unwrap();
            pulse(&mut exp, "main", 1e-6);
            exp.settings_().barrier_timeout_ms = 30;
            let err = exp.run(3).unwrap_err();
            assert!(matches!(
                err,
                WorkerError::Coordination(CoordinationError::BarrierTimeout { ref peer, .. }) if peer == "ghost"
            ));
        }

        #[test]
        fn compile_errors_surface() {
            let mut exp = Experiment::new();
            exp.add_board(simulated("main", Role::Primary, &[])).unwrap();
            exp.add_pseudoclock("main", "pc").unwrap();
            exp.add_clockline("main", "pc", "cl").unwrap();
            exp.add_analog("main", "cl", "a", 0, 0x10, "DAC712", 0.0).unwrap();
            exp.add_analog("main", "cl", "b", 0, 0x11, "DAC712", 0.0).unwrap();
            exp.go_constant("main", "a", 5e-6, 1.0).unwrap();
            exp.go_constant("main", "b", 5e-6, 1.0).unwrap();
            assert!(matches!(exp.run(1), Err(WorkerError::Compile(CompileError::TimeConflict(_)))));
        }

        #[test]
        fn failing_board_aborts_the_others() {
            let mut exp = Experiment::new();
            let mut forever = simulated("a", Role::Primary, &[]);
            forever.defaults.num_cycles = Some(0);
            exp.add_board(forever).unwrap();
            exp.add_board(simulated("b", Role::Primary, &["ghost"])).unwrap();
            pulse(&mut exp, "a", 1e-6);
            pulse(&mut exp, "b", 1e-6);
            exp.settings_().barrier_timeout_ms = 30;

            let t0 = std::time::Instant::now();
            let err = exp.run(1).unwrap_err();
            assert!(t0.elapsed() < std::time::Duration::from_secs(2));
            assert!(matches!(
                err,
                WorkerError::Coordination(CoordinationError::BarrierTimeout { ref peer, .. }) if peer == "ghost"
            ));
        }

        #[test]
        fn root_cause_outranks_consequences() {
            use crate::experiment::consequence_rank;

            let aborted = WorkerError::Run(RunError::Aborted { board: "s1".into() });
            let released = WorkerError::Coordination(CoordinationError::PeerReportedFailure {
                peer: "main".into(),
                event: "stopped".into(),
            });
            let cause = WorkerError::Run(RunError::ClockNotLocked { board: "s2".into() });
            assert!(consequence_rank(&cause) < consequence_rank(&released));
            assert!(consequence_rank(&released) < consequence_rank(&aborted));
        }
    }
}
