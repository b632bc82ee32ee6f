//! Full bus bring-up against the simulated segment: discovery, station
//! addressing, SII readout and PRE-OP for mailbox capable devices.

mod util;

use ethermite::sync_manager_channel::Direction;
use ethermite::{Master, MasterOptions, SlaveState};
use util::*;

#[test]
fn discovers_and_scans_chain() {
    let _ = env_logger::builder().is_test(true).try_init();

    let bus = bus_with(vec![ek1100(), el2008(0x100), el5001(0x200)]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    run_fsm(&mut master, &clock, &bus, 5_000, 1_000_000);

    assert_eq!(master.state().slaves_responding, 3);
    assert_eq!(master.slaves().len(), 3);

    let coupler = &master.slaves()[0];

    assert_eq!(coupler.configured_address, 0x1000);
    assert_eq!(coupler.sii.identity.vendor_id, BECKHOFF);
    assert_eq!(coupler.sii.identity.product_code, EK1100_PRODUCT);
    assert!(coupler.features.dc_supported);

    let output = &master.slaves()[1];

    assert_eq!(output.configured_address, 0x1001);
    assert_eq!(output.sii.identity.product_code, EL2008_PRODUCT);
    assert_eq!(output.sii.identity.serial, 0x100);
    // One RxPDO with 8 single-bit entries parsed from the SII
    assert_eq!(output.sii.pdos.len(), 1);
    assert_eq!(output.sii.pdos[0].index, 0x1600);
    assert_eq!(output.sii.pdos[0].entries.len(), 8);
    // Mailbox geometry from the SII
    assert!(output.sii.std_rx_mbox_offset == MBOX_RX_OFFSET);
    // CoE capable devices are parked in PRE-OP after scanning
    assert_eq!(output.al_state, SlaveState::PreOp);

    let encoder = &master.slaves()[2];

    assert_eq!(encoder.sii.identity.product_code, EL5001_PRODUCT);
    assert_eq!(encoder.al_state, SlaveState::PreOp);
    assert_eq!(encoder.sii.pdos[0].direction, Direction::MasterRead);

    // The broadcast probe ORs the AL state nibbles together: INIT from the
    // coupler, PRE-OP from the terminals
    assert_eq!(master.state().al_states & 0x03, 0x03);
}

#[test]
fn sii_override_skips_eeprom() {
    let bus = bus_with(vec![ek1100()]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    // Replace the coupler's EEPROM with an image claiming a different serial
    let image = SiiBuilder::new(BECKHOFF, EK1100_PRODUCT, 0x0011_0000, 0xcafe).build();

    master.set_sii_override(0, &image).unwrap();

    run_fsm(&mut master, &clock, &bus, 2_000, 1_000_000);

    assert_eq!(master.slaves()[0].sii.identity.serial, 0xcafe);
}

#[test]
fn topology_change_triggers_rescan() {
    let bus = bus_with(vec![ek1100(), el2008(1)]);
    let clock = SimClock::new();

    let mut master = Master::new(
        SimDevice::new(bus.clone()),
        clock.clone(),
        MasterOptions::default(),
    );

    run_fsm(&mut master, &clock, &bus, 4_000, 1_000_000);

    assert_eq!(master.slaves().len(), 2);

    // Unplug the terminal; the idle master notices the count change and
    // rebuilds its slave list
    bus.borrow_mut().slaves[1].online = false;

    run_fsm(&mut master, &clock, &bus, 4_000, 1_000_000);

    assert_eq!(master.state().slaves_responding, 1);
    assert_eq!(master.slaves().len(), 1);
}
