use env_logger::Env;

use fpgacompiler_backend::*;
use fpgactrl_backend::{Experiment, WorkerError};

fn main() -> Result<(), WorkerError> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut exp = Experiment::new();
    let simulated = WorkerOptions {
        simulate: Some(true),
        ..Default::default()
    };

    let mut main_cfg = BoardConfig::new("main", "192.168.1.120", 1e6, 2, Role::Primary);
    main_cfg.peers = vec!["aux".to_string()];
    let mut aux_cfg = BoardConfig::new("aux", "192.168.1.121", 1e6, 1, Role::Secondary);
    aux_cfg.peers = vec!["main".to_string()];
    for cfg in [main_cfg, aux_cfg] {
        let name = cfg.name.clone();
        exp.add_board(cfg)?;
        exp.add_pseudoclock(&name, "pc")?;
        exp.add_clockline(&name, "pc", "cl")?;
        exp.set_worker_options(&name, &simulated)?;
    }

    exp.add_digital_bank("main", "cl", "bank0", 0, 0x05)?;
    exp.add_digital_line("main", "bank0", "shutter", 3, false)?;
    exp.add_analog("main", "cl", "coil", 1, 0x10, "DAC712", 0.0)?;
    exp.high("main", "shutter", 10e-6, 200e-6)?;
    exp.linramp("main", "coil", 20e-6, 500e-6, 0.0, 5.0, true)?;

    exp.add_dds("aux", "cl", "dds0", 0, 0x20, (80e6, 0.0, 0.0))?;
    exp.freq("aux", "dds0", 50e-6, 81e6)?;
    exp.amp("aux", "dds0", 300e-6, -10.0)?;
    exp.irq("aux", 0, 900e-6)?;

    let reports = exp.run(2)?;
    for (rep, boards) in reports.iter().enumerate() {
        for (name, report) in boards {
            println!(
                "rep {} {}: {} samples, board time {}, {:?}",
                rep, name, report.samples, report.board_time, report.duration
            );
        }
    }
    Ok(())
}
