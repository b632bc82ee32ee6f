//! Distributed clocks: propagation delay measurement, reference clock
//! distribution and drift filter convergence.

mod util;

use ethermite::{Master, MasterOptions, PdoCfg, PdoEntryCfg, SmCfg};
use util::*;

const CYCLE: u64 = 1_000_000;

#[test]
fn drift_filter_stabilises() {
    let _ = env_logger::builder().is_test(true).try_init();

    let mut coupler = ek1100();
    let mut output = el2008(0x11);

    // Slave clocks drift tens of ppm against the master
    coupler.drift_ppb = 40_000;
    output.drift_ppb = -25_000;

    // Chain wiring: 100ns to the terminal and back
    coupler.port_times = [0, 200, 0, 0];
    output.port_times = [100, 100, 0, 0];

    let bus = bus_with(vec![coupler, output]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    run_fsm(&mut master, &clock, &bus, 4_000, CYCLE);

    // Delay measurement ran during the scan
    assert_eq!(master.slaves()[0].propagation_delay, 0);
    assert_eq!(master.slaves()[1].propagation_delay, 100);

    let domain = master.create_domain().unwrap();

    let sc = master
        .slave_config(0, 1, BECKHOFF, EL2008_PRODUCT)
        .unwrap();

    let mut sm = SmCfg::output(2);
    let mut pdo = PdoCfg::new(0x1600);

    pdo.entries
        .push(PdoEntryCfg {
            index: 0x7000,
            sub_index: 1,
            bit_length: 1,
        })
        .unwrap();

    sm.pdos.push(pdo).unwrap();

    master.slave_config_pdos(sc, &[sm]).unwrap();
    master
        .slave_config_reg_pdo_entry(sc, 0x7000, 1, domain)
        .unwrap();

    // SYNC0 at the cycle period on the output terminal
    master
        .slave_config_dc(sc, 0x0300, CYCLE as u32, 0, 0, 0)
        .unwrap();

    master.activate().unwrap();

    run_fsm(&mut master, &clock, &bus, 2_000, CYCLE);

    assert!(master.slave_config_state(sc).unwrap().operational);

    // SYNC0 got programmed: cycle time and a future start time
    {
        let bus = bus.borrow();
        let mem = &bus.slaves[1].mem;

        let sync0_cycle = u32::from_le_bytes(mem[0x9a0..0x9a4].try_into().unwrap());
        let start = u64::from_le_bytes(mem[0x990..0x998].try_into().unwrap());
        let activate = u16::from_le_bytes([mem[0x980], mem[0x981]]);

        assert_eq!(sync0_cycle, CYCLE as u32);
        assert_eq!(activate, 0x0300);
        assert_eq!(start % CYCLE, 0);
        assert!(start > 0);
    }

    // Cyclic DC phase: discipline the reference clock to the application
    // time and distribute it to the rest of the ring every cycle
    let mut worst_tail_diff = 0i64;

    for i in 0..2_500u64 {
        clock.advance(CYCLE);
        bus.borrow_mut().time = clock.0.get();

        master.receive().unwrap();
        master.domain_process(domain).unwrap();

        master.application_time(clock.0.get());
        master.sync_reference_clock().unwrap();
        master.sync_slave_clocks().unwrap();

        master.domain_queue(domain).unwrap();
        master.send().unwrap();

        master.fsm_step();
        master.send_ext().unwrap();

        if i > 2_000 {
            worst_tail_diff = worst_tail_diff.max(master.dc_diff_ns().abs());
        }
    }

    // After a couple of thousand cycles the master/reference difference sits
    // well inside half a microsecond
    assert!(
        worst_tail_diff <= 500,
        "dc diff stabilised at {} ns",
        worst_tail_diff
    );

    // The reference time is being captured
    assert!(master.reference_clock_time().unwrap() > 0);

    // The broadcast distribution pulled the drifting terminal's clock onto
    // the reference clock: both system times agree to well under the drift
    // they would otherwise have accumulated
    {
        let bus = bus.borrow();
        let time = bus.time;

        let ref_offset =
            u64::from_le_bytes(bus.slaves[0].mem[0x920..0x928].try_into().unwrap());
        let out_offset =
            u64::from_le_bytes(bus.slaves[1].mem[0x920..0x928].try_into().unwrap());

        // Local clocks drifted 65ppm apart; a cycle of staleness is the most
        // the distributed copies may disagree by
        let ref_sys =
            ((time as i128 * 1_000_040_000 / 1_000_000_000) as u64).wrapping_add(ref_offset);
        let out_sys =
            ((time as i128 * 999_975_000 / 1_000_000_000) as u64).wrapping_add(out_offset);

        let disagreement = ref_sys.abs_diff(out_sys);

        assert!(
            disagreement < 1_000,
            "slave clocks disagree by {} ns",
            disagreement
        );
    }
}
