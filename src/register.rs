//! Slave register address map and a few registers small enough to live here.
//!
//! Addresses are defined in ETG1000.4 Table 31 and friends.

/// Slave device register address abstraction.
///
/// This enum gives the raw physical addresses used by the scan/config state
/// machines readable names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum RegisterAddress {
    /// Type, `u8`.
    Type = 0x0000u16,
    /// EtherCAT revision, `u8`.
    Revision = 0x0001,
    /// Slave build, `u16`.
    Build = 0x0002,
    /// Number of supported FMMU entities, `u8`.
    FmmuCount = 0x0004,
    /// Number of supported sync manager channels, `u8`.
    SyncManagerChannels = 0x0005,
    /// RAM size in kilo-octets (1024 octets), `u8`.
    RamSize = 0x0006,
    /// EtherCAT port descriptors 0-3, `u8`.
    PortDescriptors = 0x0007,
    /// Feature support flags, `u16`.
    SupportFlags = 0x0008,
    /// The slave's configured station address, `u16`.
    ConfiguredStationAddress = 0x0010,
    /// The slave's address alias, `u16`.
    ConfiguredStationAlias = 0x0012,

    /// DL status, `u16`. Defined in ETG1000.4 Table 34.
    DlStatus = 0x0110,

    /// Application Layer (AL) control register, `u16`. ETG1000.4 Table 35.
    AlControl = 0x0120,
    /// Application Layer (AL) status register, `u16`.
    AlStatus = 0x0130,
    /// Application Layer (AL) status code register, `u16`.
    AlStatusCode = 0x0134,

    /// Watchdog divider, `u16`. See ETG1000.4 section 6.3 Watchdogs.
    WatchdogDivider = 0x0400,
    /// PDI watchdog timeout, `u16`.
    PdiWatchdog = 0x0410,
    /// Sync manager watchdog timeout, `u16`.
    SyncManagerWatchdog = 0x0420,

    /// EEPROM (SII) access config register, `u16`.
    SiiAccess = 0x0500,
    /// EEPROM (SII) control/status register, `u16`.
    SiiControl = 0x0502,
    /// EEPROM (SII) word address register, `u16`.
    SiiAddress = 0x0504,
    /// Start of 4 data bytes read from the EEPROM interface.
    SiiData = 0x0508,

    /// First Fieldbus Memory Management Unit (FMMU) entity.
    ///
    /// Defined in ETG1000.4 Table 57; 16 bytes per entity.
    Fmmu0 = 0x0600,

    /// First sync manager channel.
    ///
    /// Defined in ETG1000.4 Table 59; 8 bytes per channel.
    Sm0 = 0x0800,

    /// Distributed clock (DC) port 0 receive time in ns.
    ///
    /// Writing any value to this register latches the receive time of all
    /// four ports. DC registers are defined in ETG1000.4 Table 60.
    DcTimePort0 = 0x0900,
    /// DC port 1 receive time.
    DcTimePort1 = 0x0904,
    /// DC port 2 receive time.
    DcTimePort2 = 0x0908,
    /// DC port 3 receive time.
    DcTimePort3 = 0x090c,
    /// DC system time, `u32` or `u64`.
    DcSystemTime = 0x0910,
    /// Local receive time at port 0, `u64`.
    DcReceiveTime = 0x0918,
    /// DC system time offset, `u64`.
    DcSystemTimeOffset = 0x0920,
    /// Transmission (propagation) delay, `u32`.
    DcSystemTimeTransmissionDelay = 0x0928,
    /// DC system time difference filter output, `u32`.
    DcSystemTimeDifference = 0x092c,

    /// DC cyclic unit control/activation, `u8` at +1 for AssignActivate's low
    /// byte. ETG1000.6 Table 27, AKA ETG1000.4 Table 61 DC user P1/P2.
    DcCyclicUnitControl = 0x0980,
    /// DC sync activation register, `u8`.
    DcSyncActive = 0x0981,
    /// DC cyclic operation start time, `u64`.
    DcSyncStartTime = 0x0990,
    /// SYNC0 cycle time in ns, `u32`.
    DcSync0CycleTime = 0x09a0,
    /// SYNC1 cycle time in ns, `u32`.
    DcSync1CycleTime = 0x09a4,
}

impl From<RegisterAddress> for u16 {
    fn from(reg: RegisterAddress) -> Self {
        reg as u16
    }
}

impl RegisterAddress {
    /// FMMU entity register block by index.
    pub fn fmmu(index: u8) -> u16 {
        debug_assert!(usize::from(index) < crate::MAX_FMMUS);

        Self::Fmmu0 as u16 + u16::from(index) * 0x10
    }

    /// Sync manager channel register block by index.
    pub fn sync_manager(index: u8) -> u16 {
        debug_assert!(usize::from(index) < crate::MAX_SYNC_MANAGERS);

        Self::Sm0 as u16 + u16::from(index) * 0x08
    }

    /// Sync manager status byte: the 5th byte of the channel block.
    pub fn sync_manager_status(index: u8) -> u16 {
        Self::sync_manager(index) + 5
    }

    /// DC port receive time register by port.
    pub fn dc_time_port(port: u8) -> u16 {
        debug_assert!(port < 4);

        Self::DcTimePort0 as u16 + u16::from(port) * 4
    }
}

/// Physical port type from the port descriptor register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum PortType {
    #[default]
    NotImplemented = 0x00u8,
    NotConfigured = 0x01,
    Ebus = 0x02,
    Mii = 0x03,
}

/// The four 2 bit port descriptors packed into register `0x0007`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct PortDescriptors {
    #[wire(bits = 2)]
    pub port0: PortType,
    #[wire(bits = 2)]
    pub port1: PortType,
    #[wire(bits = 2)]
    pub port2: PortType,
    #[wire(bits = 2)]
    pub port3: PortType,
}

/// Feature support flags from register `0x0008`.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(not(test), derive(ethercrab_wire::EtherCrabWireRead))]
#[cfg_attr(
    test,
    derive(arbitrary::Arbitrary, ethercrab_wire::EtherCrabWireReadWrite)
)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct SupportFlags {
    #[wire(bits = 1)]
    pub fmmu_supports_bit_ops: bool,
    #[wire(bits = 1)]
    pub reserved_register_support: bool,
    #[wire(bits = 1)]
    pub dc_supported: bool,
    #[wire(bits = 1)]
    pub has_64bit_dc: bool,
    #[wire(bits = 1)]
    pub low_jitter: bool,
    #[wire(bits = 1)]
    pub ebus_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub mii_enhanced_link_detection: bool,
    #[wire(bits = 1)]
    pub separate_fcs_error_handling: bool,
    #[wire(bits = 1)]
    pub enhanced_dc_sync: bool,
    #[wire(bits = 1)]
    pub lrw_supported: bool,
    #[wire(bits = 1)]
    pub brw_aprw_fprw_supported: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub special_fmmu: bool,
}

impl core::fmt::Display for SupportFlags {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("DC: ")?;

        if self.dc_supported {
            f.write_str("yes")?;

            if self.has_64bit_dc {
                f.write_str(" (64 bit)")?;
            } else {
                f.write_str(" (32 bit)")?;
            }
        } else {
            f.write_str("no")?;
        }

        if self.enhanced_dc_sync {
            f.write_str(", enhanced sync")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

    #[test]
    fn block_addresses() {
        assert_eq!(RegisterAddress::fmmu(0), 0x0600);
        assert_eq!(RegisterAddress::fmmu(2), 0x0620);
        assert_eq!(RegisterAddress::sync_manager(0), 0x0800);
        assert_eq!(RegisterAddress::sync_manager(3), 0x0818);
        assert_eq!(RegisterAddress::sync_manager_status(1), 0x080d);
        assert_eq!(RegisterAddress::dc_time_port(3), 0x090c);
    }

    #[test]
    fn port_descriptors() {
        // EK1100: two EBUS ports, two MII
        let parsed = PortDescriptors::unpack_from_slice(&[0b11_10_10_11]).unwrap();

        assert_eq!(parsed.port0, PortType::Mii);
        assert_eq!(parsed.port1, PortType::Ebus);
        assert_eq!(parsed.port2, PortType::Ebus);
        assert_eq!(parsed.port3, PortType::Mii);
    }

    #[test]
    #[cfg_attr(miri, ignore)]
    fn support_flags_fuzz() {
        heckcheck::check(|status: SupportFlags| {
            let mut buf = [0u8; 2];

            let packed = status.pack_to_slice(&mut buf).expect("Pack");

            let unpacked = SupportFlags::unpack_from_slice(packed).expect("Unpack");

            pretty_assertions::assert_eq!(status, unpacked);

            Ok(())
        });
    }
}
