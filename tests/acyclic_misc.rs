//! The remaining acyclic services: EoE IP provisioning, SoE IDN access, VoE
//! pass-through and raw register requests.

mod util;

use ethermite::eoe::IpParameters;
use ethermite::{Master, MasterOptions, RequestState};
use util::*;

const CYCLE: u64 = 1_000_000;

struct Rig {
    master: Master<SimDevice, SimClock>,
    clock: SimClock,
    bus: std::rc::Rc<std::cell::RefCell<Bus>>,
    sc: ethermite::SlaveConfigHandle,
}

fn rig() -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = bus_with(vec![el5001(0x31)]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    run_fsm(&mut master, &clock, &bus, 4_000, CYCLE);

    let sc = master
        .slave_config(0, 0, BECKHOFF, EL5001_PRODUCT)
        .unwrap();

    master.activate().unwrap();

    run_fsm(&mut master, &clock, &bus, 2_000, CYCLE);

    Rig {
        master,
        clock,
        bus,
        sc,
    }
}

fn pump_until(rig: &mut Rig, done: impl Fn(&Master<SimDevice, SimClock>) -> bool) {
    for _ in 0..4_000 {
        run_fsm(&mut rig.master, &rig.clock, &rig.bus, 1, CYCLE);

        if done(&rig.master) {
            return;
        }
    }

    panic!("request never finished");
}

#[test]
fn eoe_set_ip_parameters() {
    let mut rig = rig();

    let request = rig.master.slave_config_create_eoe_request(rig.sc).unwrap();

    let mut name = heapless::String::new();

    name.push_str("drive7").unwrap();

    rig.master
        .eoe_request_mut(request)
        .unwrap()
        .set_ip(IpParameters {
            mac: Some([0x02, 0x00, 0x00, 0x00, 0x00, 0x07]),
            ip: Some(0xc0a8_0207),
            subnet: Some(0xffff_ff00),
            gateway: Some(0xc0a8_0201),
            dns: None,
            name,
        })
        .unwrap();

    pump_until(&mut rig, |master| {
        master.eoe_request(request).unwrap().state().is_terminal()
    });

    let done = rig.master.eoe_request(request).unwrap();

    assert_eq!(done.state(), RequestState::Success);
    assert_eq!(done.result(), 0);

    // The slave saw the flags word and the address slots in network order
    let seen = rig.bus.borrow().slaves[0].eoe_request.clone();

    assert_eq!(&seen[4..8], &[0b0010_1111, 0, 0, 0]);
    assert_eq!(&seen[14..18], &[192, 168, 2, 7]);
}

#[test]
fn eoe_vendor_failure_is_surfaced() {
    let mut rig = rig();

    rig.bus.borrow_mut().slaves[0].eoe_result = 0x0201;

    let request = rig.master.slave_config_create_eoe_request(rig.sc).unwrap();

    rig.master
        .eoe_request_mut(request)
        .unwrap()
        .set_ip(IpParameters {
            mac: Some([2, 0, 0, 0, 0, 1]),
            ..IpParameters::default()
        })
        .unwrap();

    pump_until(&mut rig, |master| {
        master.eoe_request(request).unwrap().state().is_terminal()
    });

    let done = rig.master.eoe_request(request).unwrap();

    assert_eq!(done.state(), RequestState::Failure);
    assert_eq!(done.result(), 0x0201);
    assert_eq!(done.error(), Some(ethermite::Error::Eoe(0x0201)));
}

#[test]
fn soe_write_then_read_idn() {
    let mut rig = rig();

    rig.bus.borrow_mut().slaves[0]
        .idns
        .insert(0x0011, vec![0, 0]);

    let request = rig
        .master
        .slave_config_create_soe_request(rig.sc, 0, 0x0011)
        .unwrap();

    {
        let request = rig.master.soe_request_mut(request).unwrap();

        request.set_data(&[0x34, 0x12]).unwrap();
        request.write().unwrap();
    }

    pump_until(&mut rig, |master| {
        master.soe_request(request).unwrap().state().is_terminal()
    });

    assert_eq!(
        rig.master.soe_request(request).unwrap().state(),
        RequestState::Success
    );

    rig.master.soe_request_mut(request).unwrap().read().unwrap();

    pump_until(&mut rig, |master| {
        master.soe_request(request).unwrap().state().is_terminal()
    });

    let done = rig.master.soe_request(request).unwrap();

    assert_eq!(done.state(), RequestState::Success);
    assert_eq!(done.data(), &[0x34, 0x12]);
    assert_eq!(done.error_code(), 0);
}

#[test]
fn soe_unknown_idn_reports_error_code() {
    let mut rig = rig();

    let request = rig
        .master
        .slave_config_create_soe_request(rig.sc, 0, 0x7654)
        .unwrap();

    rig.master.soe_request_mut(request).unwrap().read().unwrap();

    pump_until(&mut rig, |master| {
        master.soe_request(request).unwrap().state().is_terminal()
    });

    let done = rig.master.soe_request(request).unwrap();

    assert_eq!(done.state(), RequestState::Failure);
    // "No IDN"
    assert_eq!(done.error_code(), 0x0001);
}

#[test]
fn voe_round_trip() {
    let mut rig = rig();

    let handler = rig.master.slave_config_create_voe_handler(rig.sc).unwrap();

    {
        let handler = rig.master.voe_request_mut(handler).unwrap();

        handler.set_vendor_header(BECKHOFF, 0x1234).unwrap();
        handler.set_data(&[1, 2, 3, 4]).unwrap();
        handler.write().unwrap();
    }

    pump_until(&mut rig, |master| {
        master.voe_request(handler).unwrap().state().is_terminal()
    });

    assert_eq!(
        rig.master.voe_request(handler).unwrap().state(),
        RequestState::Success
    );

    // The simulated device echoes the payload reversed
    rig.master.voe_request_mut(handler).unwrap().read().unwrap();

    pump_until(&mut rig, |master| {
        master.voe_request(handler).unwrap().state().is_terminal()
    });

    let done = rig.master.voe_request(handler).unwrap();

    assert_eq!(done.state(), RequestState::Success);
    assert_eq!(done.data(), &[4, 3, 2, 1]);
    assert_eq!(done.vendor_header(), (BECKHOFF, 0x1234));
}

#[test]
fn register_request_round_trip() {
    let mut rig = rig();

    let request = rig.master.slave_config_create_reg_request(rig.sc).unwrap();

    {
        let request = rig.master.reg_request_mut(request).unwrap();

        request.set_data(&[0xab, 0xcd]).unwrap();
        // A scratch register in user RAM
        request.write(0x0f80).unwrap();
    }

    pump_until(&mut rig, |master| {
        master.reg_request(request).unwrap().state().is_terminal()
    });

    assert_eq!(
        rig.master.reg_request(request).unwrap().state(),
        RequestState::Success
    );

    rig.master
        .reg_request_mut(request)
        .unwrap()
        .read(0x0f80, 2)
        .unwrap();

    pump_until(&mut rig, |master| {
        master.reg_request(request).unwrap().state().is_terminal()
    });

    assert_eq!(
        rig.master.reg_request(request).unwrap().data(),
        &[0xab, 0xcd]
    );
}
