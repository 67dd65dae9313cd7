use env_logger::{Builder, Env};
use fpgacompiler_backend::*;

fn main() -> Result<(), CompileError> {
    Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut exp = Experiment::new();
    exp.add_board(BoardConfig::new("main", "192.168.1.120", 1e6, 1, Role::Primary))?;
    exp.add_pseudoclock("main", "pc0")?;
    exp.add_clockline("main", "pc0", "cl0")?;
    exp.add_digital_bank("main", "cl0", "bank0", 0, 0x05)?;
    exp.add_digital_line("main", "bank0", "shutter", 3, false)?;
    exp.add_analog("main", "cl0", "ao0", 0, 0x10, "DAC712", 0.0)?;
    exp.add_dds("main", "cl0", "dds0", 0, 0x20, (0.0, f64::NEG_INFINITY, 0.0))?;

    exp.high("main", "shutter", 1e-6, 2e-6)?;
    exp.linramp("main", "ao0", 10e-6, 20e-6, -1.0, 1.0, true)?;
    exp.freq("main", "dds0", 5e-6, 80e6)?;
    exp.amp("main", "dds0", 40e-6, -3.0)?;
    exp.irq("main", 0, 50e-6)?;

    let compiled = exp.compile("main", None)?;
    for (t, word) in compiled.times().iter().zip(compiled.rack_words(0)) {
        println!("{:>6} {:#010x}", t, word);
    }
    println!("final values: {:?}", compiled.final_values());
    println!("crcs: {:?}", compiled.crcs());
    Ok(())
}
