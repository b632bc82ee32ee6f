//! A tick-driven EtherCAT master core in pure Rust.
//!
//! `ethermite` drives a chain of EtherCAT slave devices on a raw Ethernet
//! segment: it discovers the chain, walks every device through the `INIT` →
//! `PRE-OP` → `SAFE-OP` → `OP` state machine, programs sync managers and
//! FMMUs from the application's PDO configuration, runs the
//! CoE/FoE/EoE/SoE/VoE mailbox protocols, and cyclically exchanges a
//! contiguous process data image at sub-millisecond periods.
//!
//! Unlike async masters, the whole core is synchronous and cooperative: the
//! realtime application owns the cycle and calls
//! [`Master::receive`](crate::Master::receive),
//! [`Master::fsm_step`](crate::Master::fsm_step) and
//! [`Master::send`](crate::Master::send) at its own fixed period. Every
//! internal state machine advances at most one transition per call and never
//! blocks, so the hot path is allocation-free and has a bounded execution
//! time.
//!
//! The crate talks to the outside world through exactly two seams, both
//! injected at construction: a [`Device`] (raw Ethernet TX/RX) and a
//! [`Clock`] (monotonic nanoseconds, used for all timeouts). This keeps the
//! core portable and lets the test suite run a full bus bring-up against a
//! simulated segment.

#![cfg_attr(not(feature = "std"), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

mod al_control;
mod al_status_code;
mod command;
pub mod dc;
mod device;
pub mod dl_status;
pub mod domain;
pub mod eeprom;
pub mod error;
mod ethernet;
pub mod fmmu;
pub mod mailbox;
mod master;
mod pdi;
mod pdu_loop;
pub mod register;
pub mod request;
pub mod slave;
mod slave_state;
pub mod sync_manager_channel;

pub mod coe;
pub mod eoe;
pub mod foe;
pub mod soe;
pub mod voe;

pub use al_status_code::AlStatusCode;
pub use command::Command;
pub use device::{AtomicLinkState, Clock, Device, DeviceStats, LinkState};
pub use domain::{DomainHandle, DomainState, WcState};
pub use error::Error;
pub use ethernet::EthernetAddress;
pub use master::{
    DictRequestHandle, EoeRequestHandle, FoeRequestHandle, Master, MasterOptions, MasterState,
    RegRequestHandle, SdoRequestHandle, SlaveConfigHandle, SlaveConfigState, SoeRequestHandle,
    Timeouts, VoeRequestHandle,
};
pub use pdi::{
    read_bit, read_u8, read_u16, read_u32, read_u64, write_bit, write_u8, write_u16, write_u32,
    write_u64,
};
pub use pdu_loop::PduStats;
pub use register::RegisterAddress;
pub use request::RequestState;
pub use slave::config::{PdoCfg, PdoEntryCfg, SmCfg, SyncDirection, WatchdogMode};
pub use slave_state::SlaveState;

#[cfg(feature = "std")]
pub use device::StdClock;

/// EtherCAT protocol EtherType.
pub const ETHERCAT_ETHERTYPE: u16 = 0x88a4;

/// Source MAC address used for all frames sent by a master.
///
/// The address only has to be locally unique (the destination of every
/// EtherCAT frame is broadcast), so a fixed locally-administered address is
/// used.
pub const MASTER_ADDR: EthernetAddress = EthernetAddress([0x10, 0x10, 0x10, 0x10, 0x10, 0x10]);

/// Starting configured station address.
///
/// The address given to a slave is `BASE_SLAVE_ADDR + ring_position`.
pub const BASE_SLAVE_ADDR: u16 = 0x1000;

/// Mask for the 11 bit length field in EtherCAT frame and PDU headers.
pub(crate) const LEN_MASK: u16 = 0b0000_0111_1111_1111;

/// Maximum number of slaves on one segment.
pub const MAX_SLAVES: usize = 32;

/// Maximum number of FMMU entities supported per slave (ETG1000.4 allows 16).
pub const MAX_FMMUS: usize = 16;

/// Maximum number of sync manager channels per slave (ETG1000.4 allows 16).
pub const MAX_SYNC_MANAGERS: usize = 16;

/// Safety cap on SII image size in words, used when a device's category list
/// is missing its `0xffff` terminator.
pub const MAX_SII_WORDS: usize = 1024;

/// Maximum number of process data domains.
pub const MAX_DOMAINS: usize = 8;

/// Maximum payload of a single PDU.
///
/// Ethernet MTU (1500) minus EtherCAT frame header (2) and one PDU
/// header/working counter overhead (12).
pub const MAX_PDU_DATA: usize = 1486;

/// Number of preallocated datagram descriptors.
///
/// This bounds the number of in-flight PDUs; the 8 bit index *space* the
/// descriptors draw from is still the full 256 so that stale replies are
/// recognisable long after their descriptor has been recycled.
pub const MAX_DATAGRAMS: usize = 32;

/// Largest supported mailbox payload (mailbox size minus mailbox header).
pub const MAX_MAILBOX_DATA: usize = 512;

/// Largest single SDO/FoE/SoE/VoE transfer payload held by a request object.
pub const MAX_SDO_DATA: usize = 1024;

/// Fixed size of the DNS name slot in an EoE "set IP parameter" request.
pub const MAX_HOSTNAME: usize = 32;

/// Maximum byte size of one process data domain image.
pub const MAX_DOMAIN_IMAGE: usize = 2048;

#[cfg(not(target_endian = "little"))]
compile_error!(
    "Only little-endian targets are supported: process data is exposed as raw little-endian slices"
);
