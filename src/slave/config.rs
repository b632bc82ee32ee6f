//! Application-provided slave configuration: sync manager layout, PDO
//! assignment and mapping, startup SDO/IDN writes, DC parameters.

use crate::eeprom::types::SiiPdoEntry;
use crate::slave_state::SlaveState;
use crate::sync_manager_channel::Direction;
use crate::{MAX_SYNC_MANAGERS, fmt};

/// Transfer direction of a sync manager, from the master's point of view.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum SyncDirection {
    /// Master writes process data to the slave.
    Output,
    /// Master reads process data from the slave.
    Input,
}

impl From<SyncDirection> for Direction {
    fn from(dir: SyncDirection) -> Self {
        match dir {
            SyncDirection::Output => Direction::MasterWrite,
            SyncDirection::Input => Direction::MasterRead,
        }
    }
}

/// Watchdog behaviour for one sync manager.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WatchdogMode {
    /// Keep the slave's default.
    #[default]
    Default,
    /// Enable the sync manager watchdog.
    Enable,
    /// Disable the sync manager watchdog.
    Disable,
}

/// One entry inside a PDO mapping.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PdoEntryCfg {
    /// Object index of the mapped entry.
    pub index: u16,
    /// Object subindex.
    pub sub_index: u8,
    /// Size of the entry in bits.
    pub bit_length: u8,
}

impl PdoEntryCfg {
    /// Encoding used by the `0x16xx`/`0x1axx` mapping objects.
    pub(crate) fn as_mapping_value(&self) -> u32 {
        u32::from(self.index) << 16 | u32::from(self.sub_index) << 8 | u32::from(self.bit_length)
    }
}

impl From<SiiPdoEntry> for PdoEntryCfg {
    fn from(entry: SiiPdoEntry) -> Self {
        Self {
            index: entry.index,
            sub_index: entry.sub_index,
            bit_length: entry.bit_length,
        }
    }
}

/// One PDO with its ordered entry mapping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PdoCfg {
    /// PDO index (`0x16xx` receive, `0x1axx` transmit).
    pub index: u16,
    /// Mapped entries, in order.
    pub entries: heapless::Vec<PdoEntryCfg, 16>,
}

impl PdoCfg {
    pub fn new(index: u16) -> Self {
        Self {
            index,
            entries: heapless::Vec::new(),
        }
    }

    /// Summed entry size in bits.
    pub fn bit_length(&self) -> u16 {
        self.entries
            .iter()
            .map(|entry| u16::from(entry.bit_length))
            .sum()
    }
}

/// One sync manager with its assigned PDOs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmCfg {
    /// Sync manager index. Process data typically starts at 2; 0 and 1 carry
    /// the mailbox.
    pub index: u8,
    pub direction: SyncDirection,
    pub watchdog: WatchdogMode,
    /// PDOs assigned to this sync manager, in order.
    pub pdos: heapless::Vec<PdoCfg, 8>,
}

impl SmCfg {
    pub fn output(index: u8) -> Self {
        Self {
            index,
            direction: SyncDirection::Output,
            watchdog: WatchdogMode::Default,
            pdos: heapless::Vec::new(),
        }
    }

    pub fn input(index: u8) -> Self {
        Self {
            index,
            direction: SyncDirection::Input,
            watchdog: WatchdogMode::Default,
            pdos: heapless::Vec::new(),
        }
    }

    /// Byte size of all assigned PDO data, rounded up.
    pub fn byte_length(&self) -> u16 {
        let bits: u16 = self.pdos.iter().map(PdoCfg::bit_length).sum();

        bits.div_ceil(8)
    }
}

/// A startup SDO write executed on every (re)configuration, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SdoConfig {
    pub index: u16,
    pub sub_index: u8,
    pub complete_access: bool,
    pub data: heapless::Vec<u8, 128>,
}

/// A startup IDN write executed while bringing the slave to `al_state`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IdnConfig {
    pub drive_no: u8,
    pub idn: u16,
    /// State boundary at which the write runs. Only `PRE-OP` writes are
    /// distinguished currently; others run at the same point.
    pub al_state: SlaveState,
    pub data: heapless::Vec<u8, 128>,
}

/// Distributed clock parameters for one slave.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DcConfig {
    /// Value for the cyclic unit control / activation registers (`0x0980`).
    pub assign_activate: u16,
    /// SYNC0 cycle time in ns.
    pub sync0_cycle: u32,
    /// SYNC0 shift relative to the cycle start in ns.
    pub sync0_shift: i32,
    /// SYNC1 cycle time in ns.
    pub sync1_cycle: u32,
    /// SYNC1 shift in ns.
    pub sync1_shift: i32,
}

/// Application intent for one expected slave, matched against the bus by
/// `(alias, position)` and verified against `(vendor, product)`.
#[derive(Debug, Default)]
pub struct SlaveConfig {
    /// Alias to anchor the position at; zero means absolute ring position.
    pub alias: u16,
    /// Ring position, relative to the aliased slave when `alias` is nonzero.
    pub position: u16,
    pub vendor_id: u32,
    pub product_code: u32,

    pub(crate) syncs: heapless::Vec<SmCfg, MAX_SYNC_MANAGERS>,
    pub(crate) sdo_configs: heapless::Vec<SdoConfig, 16>,
    pub(crate) idn_configs: heapless::Vec<IdnConfig, 8>,
    pub(crate) dc: Option<DcConfig>,
    pub(crate) watchdog_divider: Option<u16>,
    pub(crate) watchdog_intervals: Option<u16>,
    /// Target AL state, `OP` unless the application parks the slave lower.
    pub(crate) requested_state: SlaveState,

    /// Index of the matching discovered slave.
    pub(crate) slave_index: Option<usize>,
    /// The configuration has been fully applied.
    pub(crate) applied: bool,
    /// Configuration failed; retried when the slave reappears.
    pub(crate) config_error: bool,
}

impl SlaveConfig {
    pub(crate) fn new(alias: u16, position: u16, vendor_id: u32, product_code: u32) -> Self {
        Self {
            alias,
            position,
            vendor_id,
            product_code,
            requested_state: SlaveState::Op,
            ..Self::default()
        }
    }

    /// Replace the whole sync manager/PDO layout.
    pub(crate) fn set_pdos(&mut self, syncs: &[SmCfg]) -> Result<(), ()> {
        self.syncs.clear();

        for sync in syncs {
            if usize::from(sync.index) >= MAX_SYNC_MANAGERS {
                fmt::error!("Sync manager index {} out of range", sync.index);

                return Err(());
            }

            self.syncs.push(sync.clone()).map_err(|_| ())?;
        }

        Ok(())
    }

    pub(crate) fn sync(&self, index: u8) -> Option<&SmCfg> {
        self.syncs.iter().find(|sync| sync.index == index)
    }

    pub(crate) fn sync_mut(&mut self, index: u8) -> Option<&mut SmCfg> {
        self.syncs.iter_mut().find(|sync| sync.index == index)
    }
}
