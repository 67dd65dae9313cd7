use std::collections::BTreeSet;

use fpgacompiler_backend::*;
use proptest::prelude::*;

fn experiment(auto_strb: bool, num_racks: usize) -> Experiment {
    let mut cfg = BoardConfig::new("main", "10.0.0.2", 1e6, num_racks, Role::Primary);
    cfg.auto_strb = auto_strb;
    let mut exp = Experiment::new();
    exp.add_board(cfg).unwrap();
    exp.add_pseudoclock("main", "pc").unwrap();
    exp.add_clockline("main", "pc", "cl").unwrap();
    exp
}

#[test]
fn single_digital_pulse() {
    let mut exp = experiment(false, 1);
    exp.add_digital_bank("main", "cl", "bank0", 0, 0x05).unwrap();
    exp.add_digital_line("main", "bank0", "do3", 3, false).unwrap();
    exp.go_high("main", "do3", 0.000001).unwrap();
    exp.go_low("main", "do3", 0.000003).unwrap();

    let compiled = exp.compile("main", None).unwrap();
    assert_eq!(compiled.times(), vec![0, 1, 3, 4]);
    assert_eq!(
        compiled.rack_words(0),
        vec![BIT_NOP | 0x0005_0008, 0x0005_0008, 0x0005_0000, BIT_NOP]
    );
    assert_eq!(compiled.final_values()["do3"], 0.0);

    let (times, values) = compiled.decode_channel("do3").unwrap();
    assert_eq!(times, vec![1e-6, 3e-6]);
    assert_eq!(values, vec![1.0, 0.0]);
}

#[test]
fn simultaneous_analog_changes_conflict() {
    let mut exp = experiment(false, 1);
    exp.add_analog("main", "cl", "ao_a", 0, 0x10, "DAC712", 0.0).unwrap();
    exp.add_analog("main", "cl", "ao_b", 0, 0x11, "DAC712", 0.0).unwrap();
    exp.go_constant("main", "ao_a", 0.000005, 1.0).unwrap();
    exp.go_constant("main", "ao_b", 0.000005, -1.0).unwrap();

    let err = exp.compile("main", None).unwrap_err();
    let report = err.conflict_report().unwrap();
    assert_eq!(report.entries.len(), 1);
    let entry = &report.entries[0];
    assert_eq!(entry.time, 5e-6);
    assert_eq!(entry.rack, 0);
    assert_eq!(entry.addresses(), vec![0x10, 0x11]);
    assert_eq!(entry.channels(), vec!["ao_a", "ao_b"]);

    // the same changes on different racks are fine
    let mut exp = experiment(false, 2);
    exp.add_analog("main", "cl", "ao_a", 0, 0x10, "DAC712", 0.0).unwrap();
    exp.add_analog("main", "cl", "ao_b", 1, 0x11, "DAC712", 0.0).unwrap();
    exp.go_constant("main", "ao_a", 0.000005, 1.0).unwrap();
    exp.go_constant("main", "ao_b", 0.000005, -1.0).unwrap();
    let compiled = exp.compile("main", None).unwrap();
    assert_eq!(compiled.times(), vec![0, 5, 6]);
    assert_eq!(compiled.bytes_per_sample(), 12);
}

#[test]
fn auto_strobe_on_every_rack() {
    let mut exp = experiment(true, 2);
    exp.add_analog("main", "cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
    exp.add_analog("main", "cl", "ao1", 1, 0x10, "DAC712", 0.0).unwrap();
    exp.go_constant("main", "ao0", 2e-6, 1.0).unwrap();
    exp.go_constant("main", "ao1", 4e-6, 1.0).unwrap();

    let compiled = exp.compile("main", None).unwrap();
    assert_eq!(compiled.times(), vec![0, 2, 4, 5]);
    for rack in 0..2 {
        let strobes: Vec<bool> = compiled
            .rack_words(rack)
            .iter()
            .map(|w| w & BIT_STRB != 0)
            .collect();
        assert_eq!(strobes, vec![false, true, false, true]);
    }
    // rack 1 idles at tick 2, rack 0 at tick 4
    assert!(is_nop(compiled.rack_words(1)[1]));
    assert!(is_nop(compiled.rack_words(0)[2]));

    exp.strobe("main", 0, 3e-6).unwrap();
    assert!(matches!(
        exp.compile("main", None),
        Err(CompileError::StrobeModeConflict { .. })
    ));
}

#[test]
fn dds_and_dac_round_trip() {
    let mut exp = experiment(false, 1);
    exp.add_analog("main", "cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
    exp.add_dds("main", "cl", "dds0", 0, 0x20, (0.0, f64::NEG_INFINITY, 0.0))
        .unwrap();
    exp.freq("main", "dds0", 1e-6, 100e6).unwrap();
    exp.amp("main", "dds0", 10e-6, -6.0).unwrap();
    exp.go_constant("main", "ao0", 20e-6, 5.0).unwrap();

    let compiled = exp.compile("main", None).unwrap();
    let words = compiled.rack_words(0);
    // three frequency chunks on consecutive ticks
    assert_eq!(&compiled.times()[1..4], &[1, 2, 3]);
    assert!(words[1..4].iter().all(|w| address_of(*w) == 0x20));

    let (_, freqs) = compiled.decode_channel("dds0_freq").unwrap();
    assert_eq!(freqs.len(), 1);
    assert!((freqs[0] - 100e6).abs() < 1e-3);
    let (_, volts) = compiled.decode_channel("ao0").unwrap();
    assert_eq!(volts, vec![5.0]);
    assert!(compiled.crcs().contains_key("dds0_amp"));
    assert!(matches!(
        compiled.decode_channel("ao9"),
        Err(CompileError::UnknownChannel { .. })
    ));
}

#[test]
fn boards_compile_independently() {
    let mut exp = experiment(true, 1);
    let mut aux = BoardConfig::new("aux", "10.0.0.3", 2e6, 1, Role::Secondary);
    aux.peers = vec!["main".to_string()];
    exp.add_board(aux).unwrap();
    exp.add_pseudoclock("aux", "pc").unwrap();
    exp.add_clockline("aux", "pc", "cl").unwrap();
    exp.add_analog("main", "cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
    exp.add_analog("aux", "cl", "ao0", 0, 0x10, "DAC715", 0.0).unwrap();
    exp.go_constant("main", "ao0", 10e-6, 1.0).unwrap();
    exp.go_constant("aux", "ao0", 10e-6, 1.0).unwrap();

    let compiled = exp.compile_all(None).unwrap();
    assert_eq!(compiled["main"].stop_tick(), 11);
    assert_eq!(compiled["aux"].stop_tick(), 21);
    assert_eq!(compiled["main"].duration(), 11e-6);
}

proptest! {
    #[test]
    fn stream_invariants(
        analog_ticks in prop::collection::btree_set(1usize..1000, 1..30),
        digital_ticks in prop::collection::btree_set(1usize..1000, 1..30),
    ) {
        let mut exp = experiment(true, 2);
        exp.add_analog("main", "cl", "ao0", 0, 0x10, "DAC712", 0.0).unwrap();
        exp.add_digital_bank("main", "cl", "bank0", 1, 0x05).unwrap();
        exp.add_digital_line("main", "bank0", "do0", 0, false).unwrap();

        for (i, &tick) in analog_ticks.iter().enumerate() {
            let value = (i % 10) as f64 - 4.5;
            exp.go_constant("main", "ao0", tick as f64 / 1e6, value).unwrap();
        }
        for (i, &tick) in digital_ticks.iter().enumerate() {
            if i % 2 == 0 {
                exp.go_high("main", "do0", tick as f64 / 1e6).unwrap();
            } else {
                exp.go_low("main", "do0", tick as f64 / 1e6).unwrap();
            }
        }

        let compiled = exp.compile("main", None).unwrap();
        let times = compiled.times();
        prop_assert!(times.windows(2).all(|w| w[0] < w[1]));

        let last = *analog_ticks.iter().chain(digital_ticks.iter()).max().unwrap();
        let mut expected: BTreeSet<u32> = analog_ticks
            .iter()
            .chain(digital_ticks.iter())
            .map(|t| *t as u32)
            .collect();
        expected.insert(0);
        expected.insert(last as u32 + 1);
        prop_assert_eq!(times, expected.into_iter().collect::<Vec<_>>());

        for (rack, edits) in [(0, analog_ticks.len()), (1, digital_ticks.len())] {
            let words = compiled.rack_words(rack);
            prop_assert_eq!(words.iter().filter(|w| !is_nop(**w)).count(), edits);
            for (k, w) in words.iter().enumerate() {
                prop_assert_eq!(w & BIT_STRB != 0, k % 2 == 1);
            }
        }
    }
}
