use std::net::TcpListener;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fpgacompiler_backend::*;
use fpgactrl_backend::*;

fn board_config(name: &str, role: Role, peers: &[&str]) -> BoardConfig {
    let mut cfg = BoardConfig::new(name, "127.0.0.1", 1e6, 1, role);
    cfg.peers = peers.iter().map(|p| p.to_string()).collect();
    cfg
}

/// A board toggling one line every tick: 1000 samples at 1 MHz.
fn toggling(cfg: BoardConfig, options: WorkerOptions) -> CompiledBoard {
    let name = cfg.name.clone();
    let mut exp = fpgacompiler_backend::Experiment::new();
    exp.add_board(cfg).unwrap();
    exp.add_pseudoclock(&name, "pc").unwrap();
    exp.add_clockline(&name, "pc", "cl").unwrap();
    exp.add_digital_bank(&name, "cl", "bank", 0, 0x05).unwrap();
    exp.add_digital_line(&name, "bank", "clk", 0, false).unwrap();
    for i in 0..499 {
        exp.high(&name, "clk", (2 * i + 1) as f64 * 1e-6, 1e-6).unwrap();
    }
    exp.set_worker_options(&name, &options).unwrap();
    exp.compile(&name, None).unwrap()
}

fn settings(barrier_ms: u64) -> WorkerSettings {
    WorkerSettings {
        barrier_timeout_ms: barrier_ms,
        poll_interval_ms: 1,
        ..Default::default()
    }
}

fn sim_worker(
    sim: &SimBoard,
    cfg: &BoardConfig,
    settings: &WorkerSettings,
    bus: &Arc<dyn EventBus>,
) -> BoardWorker<SimBoard> {
    let sim = sim.connection();
    BoardWorker::new(
        cfg.clone(),
        settings,
        Arc::clone(bus),
        Box::new(move || Ok(sim.connection())),
    )
}

#[test]
fn two_board_run() {
    let main_cfg = board_config("main", Role::Primary, &["aux"]);
    let aux_cfg = board_config("aux", Role::Secondary, &["main"]);
    let main_stream = toggling(main_cfg.clone(), WorkerOptions::default());
    let aux_stream = toggling(aux_cfg.clone(), WorkerOptions::default());
    assert_eq!(main_stream.num_samples(), 1000);
    assert_eq!(main_stream.stop_tick(), 999);

    let settings = settings(5000);
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let main_sim = SimBoard::new("main");
    let aux_sim = SimBoard::new("aux");
    let mut main = sim_worker(&main_sim, &main_cfg, &settings, &bus);
    let mut aux = sim_worker(&aux_sim, &aux_cfg, &settings, &bus);

    for rep in 0..2u32 {
        let (main_report, aux_report) = thread::scope(|s| {
            let aux_run = s.spawn(|| aux.run(&aux_stream));
            let main_report = main.run(&main_stream);
            (main_report, aux_run.join().unwrap())
        });
        let main_report = main_report.unwrap();
        let aux_report = aux_report.unwrap();
        assert_eq!(main_report.counter, 3 * rep);
        assert_eq!(aux_report.counter, 3 * rep);
        for report in [&main_report, &aux_report] {
            assert_eq!(report.samples, 1000);
            assert_eq!(report.board_time, 999);
            assert!(!report.clock_lost);
        }
        assert!(main_report.peer_warnings.is_empty());
    }
    assert_eq!(main.counter(), 6);
    assert_eq!(aux.counter(), 6);

    // the secondary runs on the external clock and leaves it before posting stopped
    assert_eq!(aux_sim.config().config & CTRL_MANUAL_MASK, 0);
    let aux_log = aux_sim.received();
    let start = aux_log.iter().position(|c| *c == Command::Start).unwrap();
    let stop = aux_log.iter().position(|c| *c == Command::Stop).unwrap();
    assert!(start < stop);
    assert_eq!(aux_log[stop - 1], Command::SetReg);
    assert_eq!(main_sim.uploaded(), main_stream.to_bytes());
    assert_eq!(main_sim.config().num_samples, 1000);
    assert_ne!(main_sim.config().config & CTRL_AUTO_SYNC_PRIM, 0);
}

#[test]
fn three_board_run() {
    let main_cfg = board_config("main", Role::Primary, &["s1", "s2"]);
    let s1_cfg = board_config("s1", Role::Secondary, &["main"]);
    let s2_cfg = board_config("s2", Role::Secondary, &["main"]);
    let streams: Vec<CompiledBoard> = [&main_cfg, &s1_cfg, &s2_cfg]
        .into_iter()
        .map(|cfg| toggling(cfg.clone(), WorkerOptions::default()))
        .collect();
    let settings = settings(5000);
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let sims = [SimBoard::new("main"), SimBoard::new("s1"), SimBoard::new("s2")];
    let mut main = sim_worker(&sims[0], &main_cfg, &settings, &bus);
    let mut s1 = sim_worker(&sims[1], &s1_cfg, &settings, &bus);
    let mut s2 = sim_worker(&sims[2], &s2_cfg, &settings, &bus);

    for rep in 0..2u32 {
        let (main_report, s1_report, s2_report) = thread::scope(|s| {
            let s1_run = s.spawn(|| s1.run(&streams[1]));
            let s2_run = s.spawn(|| s2.run(&streams[2]));
            let main_report = main.run(&streams[0]);
            (main_report, s1_run.join().unwrap(), s2_run.join().unwrap())
        });
        let main_report = main_report.unwrap();
        assert!(main_report.peer_warnings.is_empty());
        for report in [main_report, s1_report.unwrap(), s2_report.unwrap()] {
            assert_eq!(report.counter, 3 * rep);
            assert_eq!(report.samples, 1000);
        }
    }
    assert_eq!([main.counter(), s1.counter(), s2.counter()], [6, 6, 6]);
    for sim in &sims[1..] {
        assert_eq!(sim.config().config & CTRL_MANUAL_MASK, 0);
    }
}

#[test]
fn failed_primary_releases_running_secondaries() {
    let main_cfg = board_config("main", Role::Primary, &["s1", "s2"]);
    let s1_cfg = board_config("s1", Role::Secondary, &["main"]);
    let s2_cfg = board_config("s2", Role::Secondary, &["main"]);
    let forever = WorkerOptions {
        num_cycles: Some(0),
        ..Default::default()
    };
    let main_stream = toggling(main_cfg.clone(), WorkerOptions::default());
    let s1_stream = toggling(s1_cfg.clone(), forever);
    let s2_stream = toggling(s2_cfg.clone(), WorkerOptions::default());
    let settings = settings(1000);
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let main_sim = SimBoard::new("main");
    let s1_sim = SimBoard::new("s1");
    let s2_sim = SimBoard::new("s2").without_ext_clock();
    let mut main = sim_worker(&main_sim, &main_cfg, &settings, &bus);
    let mut s1 = sim_worker(&s1_sim, &s1_cfg, &settings, &bus);
    let mut s2 = sim_worker(&s2_sim, &s2_cfg, &settings, &bus);

    let t0 = Instant::now();
    let (main_result, s1_result, s2_result) = thread::scope(|s| {
        let s1_run = s.spawn(|| s1.run(&s1_stream));
        let s2_run = s.spawn(|| s2.run(&s2_stream));
        let main_result = main.run(&main_stream);
        (main_result, s1_run.join().unwrap(), s2_run.join().unwrap())
    });
    // s1 repeats forever, only the primary's stopped event ends it
    assert!(t0.elapsed() < Duration::from_secs(2));
    assert!(matches!(
        main_result,
        Err(WorkerError::Coordination(CoordinationError::PeerReportedFailure { ref peer, .. })) if peer == "s2"
    ));
    assert!(matches!(
        s2_result,
        Err(WorkerError::Run(RunError::ClockNotLocked { .. }))
    ));
    match s1_result {
        Err(WorkerError::Coordination(CoordinationError::PeerReportedFailure { peer, event })) => {
            assert_eq!(peer, "main");
            assert_eq!(event, EVENT_STOPPED);
        }
        other => panic!("unexpected result {:?}", other.map(|r| r.board)),
    }
    assert!(s1_sim.received().contains(&Command::Start));
    assert!(s1_sim.received().contains(&Command::Stop));
    assert!(!main_sim.received().contains(&Command::Start));
    assert_eq!([main.counter(), s1.counter(), s2.counter()], [3, 3, 3]);
}

#[test]
fn peer_failure_outlives_stop_error() {
    let main_cfg = board_config("main", Role::Primary, &["aux"]);
    let aux_cfg = board_config("aux", Role::Secondary, &["main"]);
    let main_stream = toggling(main_cfg.clone(), WorkerOptions::default());
    let aux_stream = toggling(aux_cfg.clone(), WorkerOptions::default());
    let settings = settings(2000);
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let main_sim = SimBoard::new("main").nack_on(Command::Stop);
    let aux_sim = SimBoard::new("aux").nack_on(Command::Stop);
    let mut main = sim_worker(&main_sim, &main_cfg, &settings, &bus);
    let mut aux = sim_worker(&aux_sim, &aux_cfg, &settings, &bus);

    let (main_result, aux_result) = thread::scope(|s| {
        let aux_run = s.spawn(|| aux.run(&aux_stream));
        let main_result = main.run(&main_stream);
        (main_result, aux_run.join().unwrap())
    });
    assert!(matches!(
        aux_result,
        Err(WorkerError::Protocol { source: ProtocolError::Nack(Command::Stop), .. })
    ));
    match main_result {
        Err(WorkerError::Coordination(CoordinationError::PeerReportedFailure { peer, event })) => {
            assert_eq!(peer, "aux");
            assert_eq!(event, EVENT_STOPPED);
        }
        other => panic!("unexpected result {:?}", other.map(|r| r.board)),
    }
}

#[test]
fn stuck_board_times_out() {
    let cfg = board_config("main", Role::Primary, &[]);
    let stream = toggling(cfg.clone(), WorkerOptions::default());
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let sim = SimBoard::new("main").with_speed(0.0);
    let mut settings = settings(50);
    settings.run_margin_ms = 50;
    let mut main = sim_worker(&sim, &cfg, &settings, &bus);

    let t0 = Instant::now();
    let err = main.run(&stream).unwrap_err();
    assert!(t0.elapsed() < Duration::from_secs(1));
    match err {
        WorkerError::Run(RunError::RunTimeout { board, limit }) => {
            assert_eq!(board, "main");
            assert!(limit >= Duration::from_millis(100));
        }
        other => panic!("unexpected error {}", other),
    }
    let log = sim.received();
    assert_eq!(&log[log.len() - 2..], &[Command::Stop, Command::Close]);
}

#[test]
fn barrier_timeout_names_the_peer() {
    let cfg = board_config("main", Role::Primary, &["aux"]);
    let stream = toggling(cfg.clone(), WorkerOptions::default());
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let sim = SimBoard::new("main");
    let mut main = sim_worker(&sim, &cfg, &settings(50), &bus);

    let err = main.run(&stream).unwrap_err();
    match err {
        WorkerError::Coordination(CoordinationError::BarrierTimeout { peer, event }) => {
            assert_eq!(peer, "aux");
            assert_eq!(event, EVENT_STARTED);
        }
        other => panic!("unexpected error {}", other),
    }
    // the board was never started and the connection is closed
    assert!(!sim.received().contains(&Command::Start));
    assert_eq!(sim.received().last(), Some(&Command::Close));
    assert_eq!(main.client().state(), ClientState::Disconnected);
    assert_eq!(main.counter(), 3);
}

#[test]
fn secondary_without_clock_fails_both() {
    let main_cfg = board_config("main", Role::Primary, &["aux"]);
    let aux_cfg = board_config("aux", Role::Secondary, &["main"]);
    let main_stream = toggling(main_cfg.clone(), WorkerOptions::default());
    let aux_stream = toggling(aux_cfg.clone(), WorkerOptions::default());
    let settings = settings(2000);
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let main_sim = SimBoard::new("main");
    let aux_sim = SimBoard::new("aux").without_ext_clock();
    let mut main = sim_worker(&main_sim, &main_cfg, &settings, &bus);
    let mut aux = sim_worker(&aux_sim, &aux_cfg, &settings, &bus);

    let (main_result, aux_result) = thread::scope(|s| {
        let aux_run = s.spawn(|| aux.run(&aux_stream));
        let main_result = main.run(&main_stream);
        (main_result, aux_run.join().unwrap())
    });
    assert!(matches!(
        aux_result,
        Err(WorkerError::Run(RunError::ClockNotLocked { ref board })) if board == "aux"
    ));
    assert!(matches!(
        main_result,
        Err(WorkerError::Coordination(CoordinationError::PeerReportedFailure { ref peer, .. })) if peer == "aux"
    ));
    assert!(!main_sim.received().contains(&Command::Start));
}

#[test]
fn abort_is_idempotent() {
    let cfg = board_config("main", Role::Primary, &[]);
    let forever = WorkerOptions {
        num_cycles: Some(0),
        ..Default::default()
    };
    let stream = toggling(cfg.clone(), forever);
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let sim = SimBoard::new("main");
    let mut main = sim_worker(&sim, &cfg, &settings(100), &bus);
    let flag = main.abort_handle();

    let result = thread::scope(|s| {
        let run = s.spawn(|| main.run(&stream));
        thread::sleep(Duration::from_millis(50));
        flag.store(true, Ordering::Relaxed);
        run.join().unwrap()
    });
    assert!(matches!(result, Err(WorkerError::Run(RunError::Aborted { .. }))));
    let log = sim.received();
    assert_eq!(&log[log.len() - 2..], &[Command::Stop, Command::Close]);

    main.abort();
    main.abort();
    assert_eq!(sim.received().len(), log.len());
    assert_eq!(main.client().state(), ClientState::Disconnected);
}

#[test]
fn abort_without_close_resets() {
    let cfg = board_config("main", Role::Primary, &[]);
    let stream = toggling(cfg.clone(), WorkerOptions::default());
    let bus: Arc<dyn EventBus> = Arc::new(LocalEventBus::new());
    let sim = SimBoard::new("main").nack_on(Command::Config);
    let mut settings = settings(100);
    settings.close_on_abort = false;
    let mut main = sim_worker(&sim, &cfg, &settings, &bus);

    let err = main.run(&stream).unwrap_err();
    assert!(matches!(
        err,
        WorkerError::Protocol { source: ProtocolError::Nack(Command::Config), .. }
    ));
    let log = sim.received();
    assert_eq!(&log[log.len() - 3..], &[Command::Stop, Command::Reset, Command::Status]);
    assert_eq!(main.client().state(), ClientState::Open);
}

#[test]
fn client_over_tcp() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    let sim = SimBoard::new("tcp").with_speed(1000.0);
    let server = sim.connection();
    let handle = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        server.serve(stream)
    });

    let cfg = board_config("tcp", Role::Primary, &[]);
    let stream = toggling(cfg, WorkerOptions::default());
    let (config, _) = running_config(&stream).unwrap();
    let mut client = BoardClient::connect("tcp", &endpoint, Timeouts::default()).unwrap();
    client.set_chunk_bytes(1000);
    client.open().unwrap();
    client.reset().unwrap();
    assert_eq!(client.configure(&config).unwrap(), config);
    client.write_stream(&stream.to_bytes()).unwrap();
    client.start(1).unwrap();
    let mut status = client.poll_status(true).unwrap();
    while status.status & STATUS_END == 0 {
        thread::sleep(Duration::from_millis(1));
        status = client.poll_status(false).unwrap();
    }
    assert_eq!(status.board_samples, 1000);
    let full = client.full_status().unwrap();
    assert_eq!(full.bt_tot, 8000);
    assert_eq!(full.last_sample.len(), 2);
    assert_eq!(full.last_sample[0], 999);
    client.close().unwrap();
    handle.join().unwrap().unwrap();
    assert_eq!(sim.uploaded(), stream.to_bytes());
}

#[test]
fn connect_refused() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let endpoint = listener.local_addr().unwrap().to_string();
    drop(listener);
    let timeouts = Timeouts {
        connect: Duration::from_millis(200),
        operation: Duration::from_millis(200),
    };
    assert!(BoardClient::connect("gone", &endpoint, timeouts).is_err());
}
