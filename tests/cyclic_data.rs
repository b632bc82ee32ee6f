//! Cyclic process data exchange: a single digital output terminal driven
//! through a one-byte domain.

mod util;

use ethermite::{Master, MasterOptions, PdoCfg, PdoEntryCfg, SmCfg, WcState, write_u8};
use util::*;

const CYCLE: u64 = 1_000_000;

/// One realtime cycle: advance time, receive, exchange the domain, pump the
/// master state machine a few times, send.
fn cycle(
    master: &mut Master<SimDevice, SimClock>,
    clock: &SimClock,
    bus: &std::rc::Rc<std::cell::RefCell<Bus>>,
    domain: ethermite::DomainHandle,
    output: u8,
) {
    clock.advance(CYCLE);
    bus.borrow_mut().time = clock.0.get();

    master.receive().unwrap();
    master.domain_process(domain).unwrap();

    write_u8(&mut master.domain_data(domain).unwrap()[0..], output);

    master.domain_queue(domain).unwrap();
    master.send().unwrap();

    for _ in 0..8 {
        master.fsm_step();
    }

    master.send_ext().unwrap();
}

#[test]
fn el2008_domain_exchange() {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = bus_with(vec![ek1100(), el2008(0x42)]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    // Scan the bus before configuring
    run_fsm(&mut master, &clock, &bus, 4_000, CYCLE);

    assert_eq!(master.slaves().len(), 2);

    let domain = master.create_domain().unwrap();

    let sc = master
        .slave_config(0, 1, BECKHOFF, EL2008_PRODUCT)
        .unwrap();

    let mut sm = SmCfg::output(2);
    let mut pdo = PdoCfg::new(0x1600);

    for sub in 1..=8 {
        pdo.entries
            .push(PdoEntryCfg {
                index: 0x7000,
                sub_index: sub,
                bit_length: 1,
            })
            .unwrap();
    }

    sm.pdos.push(pdo).unwrap();

    master.slave_config_pdos(sc, &[sm]).unwrap();

    // First output bit lands at the very start of the image
    let (offset, bit) = master
        .slave_config_reg_pdo_entry(sc, 0x7000, 0x01, domain)
        .unwrap();

    assert_eq!((offset, bit), (0, 0));

    // Fourth bit is still in byte 0
    let (offset, bit) = master
        .slave_config_reg_pdo_entry(sc, 0x7000, 0x04, domain)
        .unwrap();

    assert_eq!((offset, bit), (0, 3));

    master.activate().unwrap();

    // Drive cycles until the slave is brought to OP
    let mut operational_at = None;

    for i in 0..600 {
        cycle(&mut master, &clock, &bus, domain, 0x55);

        if master.slave_config_state(sc).unwrap().operational {
            operational_at = Some(i);

            break;
        }
    }

    let operational_at = operational_at.expect("slave never reached OP");

    // The domain working counter reaches its expected value within a few
    // cycles of the slave going operational and stays there
    let mut complete_at = None;

    for i in 0..10 {
        cycle(&mut master, &clock, &bus, domain, 0x55);

        if master.domain_state(domain).unwrap().wc_state == WcState::Complete {
            complete_at = Some(operational_at + i);

            break;
        }
    }

    assert!(complete_at.is_some(), "working counter never completed");

    for _ in 0..20 {
        cycle(&mut master, &clock, &bus, domain, 0x55);

        let state = master.domain_state(domain).unwrap();

        assert_eq!(state.wc_state, WcState::Complete);
        assert_eq!(state.working_counter, 1);
    }

    // The output byte reached the slave's sync manager memory
    assert_eq!(bus.borrow().slaves[1].mem[0x1100], 0x55);

    // Flip a bit and confirm propagation
    for _ in 0..3 {
        cycle(&mut master, &clock, &bus, domain, 0xaa);
    }

    assert_eq!(bus.borrow().slaves[1].mem[0x1100], 0xaa);
}
