//! FoE file transfers: fragment sequencing, packet accounting and the
//! write-then-read-back law.

mod util;

use ethermite::{Master, MasterOptions, RequestState, SlaveState};
use util::*;

const CYCLE: u64 = 1_000_000;

#[test]
fn write_and_read_back() {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = bus_with(vec![ek1100(), el5001(7)]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    run_fsm(&mut master, &clock, &bus, 4_000, CYCLE);

    let sc = master
        .slave_config(0, 1, BECKHOFF, EL5001_PRODUCT)
        .unwrap();

    // Firmware downloads run against a parked slave
    master
        .slave_config_request_state(sc, SlaveState::Bootstrap)
        .unwrap();

    master.activate().unwrap();

    run_fsm(&mut master, &clock, &bus, 2_000, CYCLE);

    assert_eq!(
        master.slave_config_state(sc).unwrap().al_state,
        SlaveState::Bootstrap
    );

    let payload: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();

    let request = master.slave_config_create_foe_request(sc).unwrap();

    {
        let request = master.foe_request_mut(request).unwrap();

        request.set_filename("app.bin").unwrap();
        request.set_data(&payload).unwrap();
        request.write().unwrap();
    }

    for _ in 0..6_000 {
        run_fsm(&mut master, &clock, &bus, 1, CYCLE);

        if master.foe_request(request).unwrap().state().is_terminal() {
            break;
        }
    }

    assert_eq!(
        master.foe_request(request).unwrap().state(),
        RequestState::Success
    );

    // The file arrived intact
    assert_eq!(
        bus.borrow().slaves[1].files.get("app.bin"),
        Some(&payload)
    );

    // Exactly ceil(len / fragment) DATA packets: the mailbox carries
    // 128 - 6 - 6 = 116 byte fragments, so 1024 bytes take 9 packets
    let fragment = usize::from(MBOX_SIZE) - 6 - 6;
    let expected = payload.len().div_ceil(fragment) as u32;

    assert_eq!(bus.borrow().slaves[1].foe_data_packets, expected);

    // And read it back
    {
        let request = master.foe_request_mut(request).unwrap();

        request.set_filename("app.bin").unwrap();
        request.read().unwrap();
    }

    for _ in 0..6_000 {
        run_fsm(&mut master, &clock, &bus, 1, CYCLE);

        if master.foe_request(request).unwrap().state().is_terminal() {
            break;
        }
    }

    let done = master.foe_request(request).unwrap();

    assert_eq!(done.state(), RequestState::Success);
    assert_eq!(done.data(), &payload[..]);
}

#[test]
fn missing_file_fails_with_slave_error() {
    let bus = bus_with(vec![ek1100(), el5001(8)]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    run_fsm(&mut master, &clock, &bus, 4_000, CYCLE);

    let sc = master
        .slave_config(0, 1, BECKHOFF, EL5001_PRODUCT)
        .unwrap();

    master.activate().unwrap();

    run_fsm(&mut master, &clock, &bus, 2_000, CYCLE);

    let request = master.slave_config_create_foe_request(sc).unwrap();

    {
        let request = master.foe_request_mut(request).unwrap();

        request.set_filename("nope.bin").unwrap();
        request.read().unwrap();
    }

    for _ in 0..6_000 {
        run_fsm(&mut master, &clock, &bus, 1, CYCLE);

        if master.foe_request(request).unwrap().state().is_terminal() {
            break;
        }
    }

    let done = master.foe_request(request).unwrap();

    assert_eq!(done.state(), RequestState::Failure);
    assert_eq!(
        done.error(),
        Some(ethermite::Error::Foe(ethermite::foe::FoeError::Error(
            0x8001
        )))
    );
}
