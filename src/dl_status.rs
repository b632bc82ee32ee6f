/// DL status register (`0x0110`), ETG1000.4 Table 34.
///
/// The scan state machine records the per-port link bits to build the bus
/// topology used for DC propagation delay measurement.
#[derive(Debug, Default, Copy, Clone, PartialEq)]
#[cfg_attr(not(test), derive(ethercrab_wire::EtherCrabWireRead))]
#[cfg_attr(
    test,
    derive(arbitrary::Arbitrary, ethercrab_wire::EtherCrabWireReadWrite)
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct DlStatus {
    #[wire(bits = 1)]
    pub pdi_operational: bool,
    #[wire(bits = 1)]
    pub watchdog_ok: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub extended_link_detection: bool,
    /// True if port 0 has a physical link present.
    #[wire(bits = 1)]
    pub link_port0: bool,
    /// True if port 1 has a physical link present.
    #[wire(bits = 1)]
    pub link_port1: bool,
    /// True if port 2 has a physical link present.
    #[wire(bits = 1)]
    pub link_port2: bool,
    /// True if port 3 has a physical link present.
    #[wire(bits = 1)]
    pub link_port3: bool,
    /// True if port 0 forwards to itself (i.e. loopback).
    #[wire(bits = 1)]
    pub loopback_port0: bool,
    /// RX signal detected on port 0.
    #[wire(bits = 1)]
    pub signal_port0: bool,
    /// True if port 1 forwards to itself.
    #[wire(bits = 1)]
    pub loopback_port1: bool,
    /// RX signal detected on port 1.
    #[wire(bits = 1)]
    pub signal_port1: bool,
    /// True if port 2 forwards to itself.
    #[wire(bits = 1)]
    pub loopback_port2: bool,
    /// RX signal detected on port 2.
    #[wire(bits = 1)]
    pub signal_port2: bool,
    /// True if port 3 forwards to itself.
    #[wire(bits = 1)]
    pub loopback_port3: bool,
    /// RX signal detected on port 3.
    #[wire(bits = 1)]
    pub signal_port3: bool,
}

impl DlStatus {
    /// Link state of the given port.
    pub fn link_up(&self, port: u8) -> bool {
        match port {
            0 => self.link_port0,
            1 => self.link_port1,
            2 => self.link_port2,
            _ => self.link_port3,
        }
    }

    /// True if the port passes frames on to a downstream device rather than
    /// looping them back.
    pub fn forwards(&self, port: u8) -> bool {
        let loopback = match port {
            0 => self.loopback_port0,
            1 => self.loopback_port1,
            2 => self.loopback_port2,
            _ => self.loopback_port3,
        };

        self.link_up(port) && !loopback
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    fn last_device_loops_back() {
        // Port 0 linked and forwarding, all others closed
        let status = DlStatus::unpack_from_slice(&[0b0001_0000, 0b0000_0110]).unwrap();

        assert!(status.link_up(0));
        assert!(status.forwards(0));
        assert!(!status.forwards(1));
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn dl_status_fuzz() {
        heckcheck::check(|status: DlStatus| {
            let mut buf = [0u8; 16];

            let packed = status.pack_to_slice(&mut buf).expect("Pack");

            let unpacked = DlStatus::unpack_from_slice(packed).expect("Unpack");

            pretty_assertions::assert_eq!(status, unpacked);

            Ok(())
        });
    }
}
