//! Sync manager channel register block, programmed per channel at
//! `0x0800 + 8 * index` during slave configuration.

use core::fmt;

/// One sync manager channel as written to the slave.
///
/// Defined in ETG1000.4 6.7.2.
#[derive(Default, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 8)]
pub struct SyncManagerChannel {
    #[wire(bytes = 2)]
    pub physical_start_address: u16,
    #[wire(bytes = 2)]
    pub length_bytes: u16,
    #[wire(bytes = 1)]
    pub control: Control,
    #[wire(bytes = 1)]
    pub status: Status,
    #[wire(bytes = 2)]
    pub enable: Enable,
}

impl fmt::Debug for SyncManagerChannel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncManagerChannel")
            .field(
                "physical_start_address",
                &format_args!("{:#06x}", self.physical_start_address),
            )
            .field("length_bytes", &self.length_bytes)
            .field("control", &self.control)
            .field("status", &self.status)
            .field("enable", &self.enable.channel_enable)
            .finish()
    }
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct Control {
    #[wire(bits = 2)]
    pub operation_mode: OperationMode,
    #[wire(bits = 2)]
    pub direction: Direction,
    #[wire(bits = 1)]
    pub ecat_event_enable: bool,
    #[wire(bits = 1)]
    pub dls_user_event_enable: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub watchdog_enable: bool,
    // reserved1: bool
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 1)]
pub struct Status {
    #[wire(bits = 1)]
    pub has_write_event: bool,
    #[wire(bits = 1, post_skip = 1)]
    pub has_read_event: bool,
    // reserved1: bool
    /// For a mailbox mode channel: the slave has filled the buffer and it is
    /// ready to be fetched (TX mailbox), or still occupied (RX mailbox).
    #[wire(bits = 1)]
    pub mailbox_full: bool,
    #[wire(bits = 2)]
    pub buffer_state: u8,
    #[wire(bits = 1)]
    pub read_buffer_open: bool,
    #[wire(bits = 1)]
    pub write_buffer_open: bool,
}

/// ETG1000.4 6.7.2 Sync Manager Attributes, activation word.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct Enable {
    #[wire(bits = 1)]
    pub channel_enable: bool,
    #[wire(bits = 1, post_skip = 4)]
    pub repeat: bool,
    // reserved4
    /// DC event 0 on EtherCAT write.
    #[wire(bits = 1)]
    pub enable_dc_event_bus_write: bool,
    /// DC event 0 on local (PDI) write.
    #[wire(bits = 1)]
    pub enable_dc_event_local_write: bool,
    // Second byte
    #[wire(bits = 1)]
    pub channel_pdi_disabled: bool,
    #[wire(bits = 1, post_skip = 6)]
    pub repeat_ack: bool,
    // reserved6
}

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 2)]
#[repr(u8)]
pub enum OperationMode {
    /// Buffered ("3 buffer") mode, used for process data.
    #[default]
    Buffered = 0x00,
    /// Mailbox mode with handshaking.
    Mailbox = 0x02,
}

/// Transfer direction as seen from the bus.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bits = 2)]
#[repr(u8)]
pub enum Direction {
    /// Slave writes, master reads (inputs, TX mailbox).
    #[default]
    MasterRead = 0x00,
    /// Master writes, slave reads (outputs, RX mailbox).
    MasterWrite = 0x01,
}

impl SyncManagerChannel {
    /// A disabled, zeroed channel, written to clear stale configuration.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// A mailbox mode channel over the given physical region.
    pub fn mailbox(physical_start_address: u16, length_bytes: u16, direction: Direction) -> Self {
        Self {
            physical_start_address,
            length_bytes,
            control: Control {
                operation_mode: OperationMode::Mailbox,
                direction,
                dls_user_event_enable: true,
                ..Control::default()
            },
            status: Status::default(),
            enable: Enable {
                channel_enable: true,
                ..Enable::default()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWriteSized};

    #[test]
    fn size() {
        assert_eq!(SyncManagerChannel::PACKED_LEN, 8);
    }

    #[test]
    fn decode_mailbox_write_channel() {
        // Fields are little endian. Taken from a capture of a LAN9252 being
        // configured by SOEM.
        let raw = [
            // Start address
            0x00, 0x10, //
            // Length
            0x80, 0x00, //
            // Control
            0x26, //
            // Status
            0x00, //
            // Enable
            0x01, 0x00,
        ];

        let parsed = SyncManagerChannel::unpack_from_slice(&raw).unwrap();

        assert_eq!(
            parsed,
            SyncManagerChannel {
                physical_start_address: 0x1000,
                length_bytes: 0x0080,
                control: Control {
                    operation_mode: OperationMode::Mailbox,
                    direction: Direction::MasterWrite,
                    ecat_event_enable: false,
                    dls_user_event_enable: true,
                    watchdog_enable: false,
                },
                status: Status::default(),
                enable: Enable {
                    channel_enable: true,
                    ..Enable::default()
                },
            }
        );

        // And the constructor builds the same configuration
        assert_eq!(
            SyncManagerChannel::mailbox(0x1000, 0x0080, Direction::MasterWrite).pack(),
            raw
        );
    }

    #[test]
    fn decode_mailbox_full() {
        let parsed = Status::unpack_from_slice(&[0x09]).unwrap();

        assert!(parsed.mailbox_full);
        assert!(parsed.has_write_event);
    }

    #[test]
    fn disabled_is_zero() {
        assert_eq!(SyncManagerChannel::disabled().pack(), [0u8; 8]);
    }
}
