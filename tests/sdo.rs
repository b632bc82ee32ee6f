//! Acyclic CoE: expedited and segmented SDO transfers, abort codes and the
//! download/upload round trip law.

mod util;

use ethermite::error::{CoeAbortCode, MailboxError};
use ethermite::{Error, Master, MasterOptions, RequestState};
use util::*;

const CYCLE: u64 = 1_000_000;

struct Rig {
    master: Master<SimDevice, SimClock>,
    clock: SimClock,
    bus: std::rc::Rc<std::cell::RefCell<Bus>>,
    sc: ethermite::SlaveConfigHandle,
}

/// Bring up a bus with one EL5001-ish device and activate it.
fn rig() -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = bus_with(vec![ek1100(), el5001(0x99)]);
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

    assert!(master.slave_config_state(sc).unwrap().operational);

    Rig {
        master,
        clock,
        bus,
        sc,
    }
}

fn wait_terminal(
    rig: &mut Rig,
    state: impl Fn(&Master<SimDevice, SimClock>) -> RequestState,
) -> RequestState {
    for _ in 0..4_000 {
        run_fsm(&mut rig.master, &rig.clock, &rig.bus, 1, CYCLE);

        let current = state(&rig.master);

        if current.is_terminal() {
            return current;
        }
    }

    panic!("request never finished");
}

#[test]
fn expedited_upload() {
    let mut rig = rig();

    let request = rig
        .master
        .slave_config_create_sdo_request(rig.sc, 0x6000, 0x11)
        .unwrap();

    rig.master.sdo_request_mut(request).unwrap().read().unwrap();

    let state = wait_terminal(&mut rig, |master| {
        master.sdo_request(request).unwrap().state()
    });

    assert_eq!(state, RequestState::Success);

    let done = rig.master.sdo_request(request).unwrap();

    assert_eq!(done.data(), &0x1234_5678u32.to_le_bytes());
    assert_eq!(done.abort_code(), None);
}

#[test]
fn download_then_upload_returns_value() {
    let mut rig = rig();

    let request = rig
        .master
        .slave_config_create_sdo_request(rig.sc, 0x6000, 0x11)
        .unwrap();

    {
        let request = rig.master.sdo_request_mut(request).unwrap();

        request.set_data(&0xdead_beefu32.to_le_bytes()).unwrap();
        request.write().unwrap();
    }

    assert_eq!(
        wait_terminal(&mut rig, |master| master.sdo_request(request).unwrap().state()),
        RequestState::Success
    );

    rig.master.sdo_request_mut(request).unwrap().read().unwrap();

    assert_eq!(
        wait_terminal(&mut rig, |master| master.sdo_request(request).unwrap().state()),
        RequestState::Success
    );

    assert_eq!(
        rig.master.sdo_request(request).unwrap().data(),
        &0xdead_beefu32.to_le_bytes()
    );
}

#[test]
fn missing_object_aborts() {
    let mut rig = rig();

    let request = rig
        .master
        .slave_config_create_sdo_request(rig.sc, 0x5555, 0x00)
        .unwrap();

    rig.master.sdo_request_mut(request).unwrap().read().unwrap();

    let state = wait_terminal(&mut rig, |master| {
        master.sdo_request(request).unwrap().state()
    });

    assert_eq!(state, RequestState::Failure);

    let failed = rig.master.sdo_request(request).unwrap();

    assert_eq!(failed.abort_code(), Some(CoeAbortCode::NotFound));
    assert_eq!(
        failed.error(),
        Some(Error::Mailbox(MailboxError::Aborted {
            code: CoeAbortCode::NotFound,
            index: 0x5555,
            sub_index: 0,
        }))
    );
}

#[test]
fn segmented_upload_reassembles() {
    let mut rig = rig();

    // An object three mailbox fragments long
    let big: Vec<u8> = (0..300u16).map(|i| i as u8).collect();

    rig.bus.borrow_mut().slaves[1]
        .objects
        .insert((0x2000 << 8) | 0, big.clone());

    let request = rig
        .master
        .slave_config_create_sdo_request(rig.sc, 0x2000, 0x00)
        .unwrap();

    rig.master.sdo_request_mut(request).unwrap().read().unwrap();

    assert_eq!(
        wait_terminal(&mut rig, |master| master.sdo_request(request).unwrap().state()),
        RequestState::Success
    );

    assert_eq!(rig.master.sdo_request(request).unwrap().data(), &big[..]);
}

#[test]
fn dictionary_scan_counts_objects() {
    let mut rig = rig();

    let request = rig
        .master
        .slave_config_create_dict_request(rig.sc)
        .unwrap();

    rig.master.dict_request_mut(request).unwrap().read().unwrap();

    let state = wait_terminal(&mut rig, |master| {
        master.dict_request(request).unwrap().state()
    });

    assert_eq!(state, RequestState::Success);

    let summary = rig.master.dict_request(request).unwrap().summary().clone();

    // 0x1a00, 0x1c13, 0x6000 at least
    assert!(summary.object_count >= 3);
    assert!(summary.indices.contains(&0x6000));
    assert!(summary.entry_count > 0);
}
