//! Per-slave configuration: FMMU/SM programming, startup SDO/IDN writes, PDO
//! assignment and mapping, DC activation and the walk up to the requested AL
//! state.

use super::config::{SlaveConfig, WatchdogMode};
use super::{AlPoll, AlTransition, Slave};
use crate::coe::fsm::{CoeFsm, CoePoll};
use crate::command::Command;
use crate::dc;
use crate::domain::Domain;
use crate::error::Error;
use crate::fmmu::Fmmu;
use crate::fmt;
use crate::master::MasterOptions;
use crate::mailbox::{MailboxProtocols, RX_MAILBOX_SM, TX_MAILBOX_SM};
use crate::pdu_loop::{PduLoop, RegPoll, RegisterExchange};
use crate::register::RegisterAddress;
use crate::slave_state::SlaveState;
use crate::soe::{SoeFsm, SoePoll};
use crate::sync_manager_channel::{
    Control, Direction, Enable, OperationMode, SyncManagerChannel,
};
use ethercrab_wire::{EtherCrabWireSized, EtherCrabWireWrite, EtherCrabWireWriteSized};

/// Configuration attempts before the slave is marked failed; a fresh attempt
/// restarts from `INIT`.
const CONFIG_ATTEMPTS: u8 = 3;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum ConfigState {
    #[default]
    Idle,
    ToInit,
    ClearFmmus,
    AwaitClearFmmus,
    ClearSms,
    AwaitClearSms,
    /// Program the two mailbox sync managers.
    MailboxSms,
    AwaitMailboxSms,
    ToPreop,
    WatchdogDivider,
    AwaitWatchdogDivider,
    WatchdogIntervals,
    AwaitWatchdogIntervals,
    /// Startup SDO writes, in order.
    SdoConf,
    /// Startup IDN writes.
    IdnConf,
    /// `0x16xx`/`0x1axx` mapping objects.
    PdoMapZero,
    PdoMapEntry,
    PdoMapCount,
    /// `0x1c1x` assignment objects.
    PdoAssignZero,
    PdoAssignEntry,
    PdoAssignCount,
    /// Program the process data sync managers.
    PdoSms,
    AwaitPdoSms,
    Fmmus,
    AwaitFmmus,
    DcCycles,
    AwaitDcCycles,
    DcStartTime,
    AwaitDcStartTime,
    DcActivate,
    AwaitDcActivate,
    /// Walk to the requested AL state one hop at a time.
    ToTarget,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ConfigPoll {
    Pending,
    Done,
    Failed(Error),
}

/// The configuration state machine. One instance lives on the master and is
/// restarted for each matched (slave, config) pair.
#[derive(Debug, Default)]
pub(crate) struct ConfigFsm {
    state: ConfigState,
    reg: RegisterExchange,
    al: AlTransition,
    coe: CoeFsm,
    soe: SoeFsm,

    attempts: u8,
    sdo_cursor: usize,
    idn_cursor: usize,
    sync_cursor: usize,
    pdo_cursor: usize,
    entry_cursor: usize,
    sm_write_index: u8,
    fmmu_write_index: u8,
    /// Application (DC) time captured when the FSM starts, used to place the
    /// SYNC0 start time in the future.
    app_time: u64,

    error: Option<Error>,
}

impl ConfigFsm {
    pub fn start(&mut self, app_time: u64) {
        *self = Self {
            state: ConfigState::ToInit,
            app_time,
            ..Self::default()
        };

        self.al.start(SlaveState::Init);
    }

    fn fail(&mut self, slave: &mut Slave, config: &mut SlaveConfig, error: Error) -> ConfigPoll {
        fmt::error!(
            "Failed to configure slave {}: {}",
            slave.ring_position,
            error
        );

        slave.error_flag = true;
        config.config_error = true;
        self.state = ConfigState::Failed;
        self.error = Some(error);

        ConfigPoll::Failed(error)
    }

    /// An AL refusal restarts configuration from `INIT` a bounded number of
    /// times.
    fn al_failed(
        &mut self,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        error: Error,
    ) -> ConfigPoll {
        slave.al_status_code = self.al.status_code;

        self.attempts += 1;

        if self.attempts >= CONFIG_ATTEMPTS {
            return self.fail(slave, config, error);
        }

        fmt::warn!(
            "Slave {}: state transition failed, restarting configuration (attempt {})",
            slave.ring_position,
            self.attempts + 1
        );

        self.sdo_cursor = 0;
        self.idn_cursor = 0;
        self.sync_cursor = 0;
        self.pdo_cursor = 0;
        self.entry_cursor = 0;
        self.sm_write_index = 0;
        self.fmmu_write_index = 0;
        self.al.start(SlaveState::Init);
        self.state = ConfigState::ToInit;

        ConfigPoll::Pending
    }

    /// Advance the configuration by at most one transition.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        config_index: usize,
        domains: &mut [Domain],
        options: &MasterOptions,
        now: u64,
    ) -> ConfigPoll {
        let timeouts = &options.timeouts;

        match self.state {
            ConfigState::Idle | ConfigState::Done => ConfigPoll::Pending,
            ConfigState::Failed => {
                ConfigPoll::Failed(self.error.unwrap_or(Error::Internal))
            }

            ConfigState::ToInit => {
                match self
                    .al
                    .step(pdu_loop, slave.configured_address, now, timeouts)
                {
                    AlPoll::Pending => ConfigPoll::Pending,
                    AlPoll::Failed(e) => self.al_failed(slave, config, e),
                    AlPoll::Done => {
                        slave.al_state = SlaveState::Init;
                        self.state = ConfigState::ClearFmmus;

                        ConfigPoll::Pending
                    }
                }
            }

            ConfigState::ClearFmmus => {
                let len = usize::from(slave.fmmu_count) * Fmmu::PACKED_LEN;
                let zeros = [0u8; crate::MAX_FMMUS * 16];

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(slave.configured_address, RegisterAddress::Fmmu0.into()),
                    &zeros[..len],
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitClearFmmus;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitClearFmmus => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.state = ConfigState::ClearSms;

                    ConfigPoll::Pending
                }
            },

            ConfigState::ClearSms => {
                let len = usize::from(slave.sm_count) * SyncManagerChannel::PACKED_LEN;
                let zeros = [0u8; crate::MAX_SYNC_MANAGERS * 8];

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(slave.configured_address, RegisterAddress::Sm0.into()),
                    &zeros[..len],
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitClearSms;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitClearSms => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    if slave.mailbox.present() {
                        self.state = ConfigState::MailboxSms;
                    } else {
                        self.al.start(SlaveState::PreOp);
                        self.state = ConfigState::ToPreop;
                    }

                    ConfigPoll::Pending
                }
            },

            ConfigState::MailboxSms => {
                let mut raw = [0u8; 2 * 8];

                SyncManagerChannel::mailbox(
                    slave.mailbox.rx_offset,
                    slave.mailbox.rx_size,
                    Direction::MasterWrite,
                )
                .pack_to_slice_unchecked(&mut raw[..8]);

                SyncManagerChannel::mailbox(
                    slave.mailbox.tx_offset,
                    slave.mailbox.tx_size,
                    Direction::MasterRead,
                )
                .pack_to_slice_unchecked(&mut raw[8..]);

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::sync_manager(RX_MAILBOX_SM),
                    ),
                    &raw,
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitMailboxSms;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitMailboxSms => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.al.start(SlaveState::PreOp);
                    self.state = ConfigState::ToPreop;

                    ConfigPoll::Pending
                }
            },

            ConfigState::ToPreop => {
                match self
                    .al
                    .step(pdu_loop, slave.configured_address, now, timeouts)
                {
                    AlPoll::Pending => ConfigPoll::Pending,
                    AlPoll::Failed(e) => self.al_failed(slave, config, e),
                    AlPoll::Done => {
                        slave.al_state = SlaveState::PreOp;

                        self.state = if config.watchdog_divider.is_some() {
                            ConfigState::WatchdogDivider
                        } else if config.watchdog_intervals.is_some() {
                            ConfigState::WatchdogIntervals
                        } else {
                            ConfigState::SdoConf
                        };

                        ConfigPoll::Pending
                    }
                }
            }

            ConfigState::WatchdogDivider => {
                let divider = config.watchdog_divider.unwrap_or(0).to_le_bytes();

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::WatchdogDivider.into(),
                    ),
                    &divider,
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitWatchdogDivider;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitWatchdogDivider => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.state = if config.watchdog_intervals.is_some() {
                        ConfigState::WatchdogIntervals
                    } else {
                        ConfigState::SdoConf
                    };

                    ConfigPoll::Pending
                }
            },

            ConfigState::WatchdogIntervals => {
                let interval = config.watchdog_intervals.unwrap_or(0).to_le_bytes();

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::SyncManagerWatchdog.into(),
                    ),
                    &interval,
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitWatchdogIntervals;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitWatchdogIntervals => {
                match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                    RegPoll::Pending => ConfigPoll::Pending,
                    RegPoll::Failed(e) => self.fail(slave, config, e),
                    RegPoll::Done { .. } => {
                        self.state = ConfigState::SdoConf;

                        ConfigPoll::Pending
                    }
                }
            }

            ConfigState::SdoConf => {
                if self.sdo_cursor >= config.sdo_configs.len() {
                    self.state = ConfigState::IdnConf;

                    return ConfigPoll::Pending;
                }

                if self.coe.is_idle() {
                    let sdo = &config.sdo_configs[self.sdo_cursor];

                    if let Err(e) = self.coe.start_download(
                        sdo.index,
                        sdo.sub_index,
                        sdo.complete_access,
                        &sdo.data,
                    ) {
                        return self.fail(slave, config, e);
                    }
                }

                match self.coe.step(pdu_loop, &mut slave.mailbox, now, timeouts) {
                    CoePoll::Pending => ConfigPoll::Pending,
                    CoePoll::Failed(e) => self.fail(slave, config, e),
                    CoePoll::Done => {
                        self.sdo_cursor += 1;
                        self.coe = CoeFsm::default();

                        ConfigPoll::Pending
                    }
                }
            }

            ConfigState::IdnConf => {
                if self.idn_cursor >= config.idn_configs.len() {
                    self.begin_pdo_configuration(slave, config);

                    return ConfigPoll::Pending;
                }

                if self.soe.is_idle() {
                    let idn = &config.idn_configs[self.idn_cursor];

                    if let Err(e) = self.soe.start_write(idn.drive_no, idn.idn, &idn.data) {
                        return self.fail(slave, config, e);
                    }
                }

                match self.soe.step(pdu_loop, &mut slave.mailbox, now, timeouts) {
                    SoePoll::Pending => ConfigPoll::Pending,
                    SoePoll::Failed(e) => self.fail(slave, config, e),
                    SoePoll::Done => {
                        self.idn_cursor += 1;
                        self.soe = SoeFsm::default();

                        ConfigPoll::Pending
                    }
                }
            }

            ConfigState::PdoMapZero => {
                let Some((_, pdo)) = self.current_pdo(config) else {
                    self.sync_cursor = 0;
                    self.pdo_cursor = 0;
                    self.state = ConfigState::PdoAssignZero;

                    return ConfigPoll::Pending;
                };

                if self.coe.is_idle() {
                    if let Err(e) = self.coe.start_download(pdo.index, 0, false, &[0u8]) {
                        return self.fail(slave, config, e);
                    }
                }

                self.pump_coe(pdu_loop, slave, config, now, options, |fsm| {
                    fsm.entry_cursor = 0;
                    fsm.state = ConfigState::PdoMapEntry;
                })
            }

            ConfigState::PdoMapEntry => {
                let Some((_, pdo)) = self.current_pdo(config) else {
                    return self.fail(slave, config, Error::Internal);
                };

                if self.entry_cursor >= pdo.entries.len() {
                    self.state = ConfigState::PdoMapCount;

                    return ConfigPoll::Pending;
                }

                if self.coe.is_idle() {
                    let value = pdo.entries[self.entry_cursor].as_mapping_value();

                    if let Err(e) = self.coe.start_download(
                        pdo.index,
                        self.entry_cursor as u8 + 1,
                        false,
                        &value.to_le_bytes(),
                    ) {
                        return self.fail(slave, config, e);
                    }
                }

                self.pump_coe(pdu_loop, slave, config, now, options, |fsm| {
                    fsm.entry_cursor += 1;
                    fsm.state = ConfigState::PdoMapEntry;
                })
            }

            ConfigState::PdoMapCount => {
                let Some((_, pdo)) = self.current_pdo(config) else {
                    return self.fail(slave, config, Error::Internal);
                };

                if self.coe.is_idle() {
                    let count = pdo.entries.len() as u8;

                    if let Err(e) = self.coe.start_download(pdo.index, 0, false, &[count]) {
                        return self.fail(slave, config, e);
                    }
                }

                self.pump_coe(pdu_loop, slave, config, now, options, |fsm| {
                    fsm.pdo_cursor += 1;
                    fsm.state = ConfigState::PdoMapZero;
                })
            }

            ConfigState::PdoAssignZero => {
                let Some(sync) = config.syncs.get(self.sync_cursor) else {
                    self.sm_write_index = 0;
                    self.state = ConfigState::PdoSms;

                    return ConfigPoll::Pending;
                };

                let object = crate::coe::SDO_PDO_ASSIGN_BASE + u16::from(sync.index);

                if self.coe.is_idle() {
                    if let Err(e) = self.coe.start_download(object, 0, false, &[0u8]) {
                        return self.fail(slave, config, e);
                    }
                }

                self.pump_coe(pdu_loop, slave, config, now, options, |fsm| {
                    fsm.pdo_cursor = 0;
                    fsm.state = ConfigState::PdoAssignEntry;
                })
            }

            ConfigState::PdoAssignEntry => {
                let Some(sync) = config.syncs.get(self.sync_cursor) else {
                    return self.fail(slave, config, Error::Internal);
                };

                if self.pdo_cursor >= sync.pdos.len() {
                    self.state = ConfigState::PdoAssignCount;

                    return ConfigPoll::Pending;
                }

                let object = crate::coe::SDO_PDO_ASSIGN_BASE + u16::from(sync.index);
                let pdo_index = sync.pdos[self.pdo_cursor].index;

                if self.coe.is_idle() {
                    if let Err(e) = self.coe.start_download(
                        object,
                        self.pdo_cursor as u8 + 1,
                        false,
                        &pdo_index.to_le_bytes(),
                    ) {
                        return self.fail(slave, config, e);
                    }
                }

                self.pump_coe(pdu_loop, slave, config, now, options, |fsm| {
                    fsm.pdo_cursor += 1;
                    fsm.state = ConfigState::PdoAssignEntry;
                })
            }

            ConfigState::PdoAssignCount => {
                let Some(sync) = config.syncs.get(self.sync_cursor) else {
                    return self.fail(slave, config, Error::Internal);
                };

                let object = crate::coe::SDO_PDO_ASSIGN_BASE + u16::from(sync.index);
                let count = sync.pdos.len() as u8;

                if self.coe.is_idle() {
                    if let Err(e) = self.coe.start_download(object, 0, false, &[count]) {
                        return self.fail(slave, config, e);
                    }
                }

                self.pump_coe(pdu_loop, slave, config, now, options, |fsm| {
                    fsm.sync_cursor += 1;
                    fsm.pdo_cursor = 0;
                    fsm.state = ConfigState::PdoAssignZero;
                })
            }

            ConfigState::PdoSms => {
                let Some(channel) = self.next_pdo_sm(slave, config) else {
                    self.fmmu_write_index = 0;
                    self.state = ConfigState::Fmmus;

                    return ConfigPoll::Pending;
                };

                let index = self.sm_write_index;

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::sync_manager(index),
                    ),
                    &channel.pack(),
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitPdoSms;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitPdoSms => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.sm_write_index += 1;
                    self.state = ConfigState::PdoSms;

                    ConfigPoll::Pending
                }
            },

            ConfigState::Fmmus => {
                let Some(fmmu) = self.next_fmmu(slave, config_index, domains) else {
                    if config.dc.is_some() && slave.features.dc_supported {
                        self.state = ConfigState::DcCycles;
                    } else {
                        self.enter_target(slave, config);
                    }

                    return ConfigPoll::Pending;
                };

                let index = self.fmmu_write_index;

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(slave.configured_address, RegisterAddress::fmmu(index)),
                    &fmmu.pack(),
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitFmmus;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitFmmus => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.fmmu_write_index += 1;
                    self.state = ConfigState::Fmmus;

                    ConfigPoll::Pending
                }
            },

            ConfigState::DcCycles => {
                let dc = config.dc.unwrap_or_default();

                let mut raw = [0u8; 8];

                raw[..4].copy_from_slice(&dc.sync0_cycle.to_le_bytes());
                raw[4..].copy_from_slice(&dc.sync1_cycle.to_le_bytes());

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::DcSync0CycleTime.into(),
                    ),
                    &raw,
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitDcCycles;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitDcCycles => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.state = ConfigState::DcStartTime;

                    ConfigPoll::Pending
                }
            },

            ConfigState::DcStartTime => {
                let dc = config.dc.unwrap_or_default();

                let start = dc::sync_start_time(self.app_time, &dc);

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::DcSyncStartTime.into(),
                    ),
                    &start.to_le_bytes(),
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitDcStartTime;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitDcStartTime => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.state = ConfigState::DcActivate;

                    ConfigPoll::Pending
                }
            },

            ConfigState::DcActivate => {
                let dc = config.dc.unwrap_or_default();

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::DcCyclicUnitControl.into(),
                    ),
                    &dc.assign_activate.to_le_bytes(),
                ) {
                    Ok(()) => {
                        self.state = ConfigState::AwaitDcActivate;

                        ConfigPoll::Pending
                    }
                    Err(e) => self.fail(slave, config, e),
                }
            }

            ConfigState::AwaitDcActivate => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ConfigPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, config, e),
                RegPoll::Done { .. } => {
                    self.enter_target(slave, config);

                    ConfigPoll::Pending
                }
            },

            ConfigState::ToTarget => {
                match self
                    .al
                    .step(pdu_loop, slave.configured_address, now, timeouts)
                {
                    AlPoll::Pending => ConfigPoll::Pending,
                    AlPoll::Failed(e) => self.al_failed(slave, config, e),
                    AlPoll::Done => {
                        slave.al_state = self.al.observed;

                        match slave.al_state.next_towards(config.requested_state) {
                            Some(next) => {
                                self.al.start(next);

                                ConfigPoll::Pending
                            }
                            None => {
                                config.applied = true;
                                config.config_error = false;
                                self.state = ConfigState::Done;

                                fmt::info!(
                                    "Slave {} configured, state {}",
                                    slave.ring_position,
                                    slave.al_state
                                );

                                ConfigPoll::Done
                            }
                        }
                    }
                }
            }
        }
    }

    /// Skip the PDO mapping/assignment phase for slaves that cannot take it.
    fn begin_pdo_configuration(&mut self, slave: &Slave, config: &SlaveConfig) {
        let coe_ok = slave.sii.mailbox_protocols.contains(MailboxProtocols::COE)
            && slave.mailbox.present();

        // General category bit 2: PDO assignment configurable
        let assign_ok = slave
            .sii
            .general
            .map(|general| general.coe_details & 0x04 != 0)
            .unwrap_or(true);

        if coe_ok && assign_ok && !config.syncs.is_empty() {
            self.sync_cursor = 0;
            self.pdo_cursor = 0;
            self.state = ConfigState::PdoMapZero;
        } else {
            self.sm_write_index = 0;
            self.state = ConfigState::PdoSms;
        }
    }

    /// The (sync, pdo) pair under the mapping cursor, advancing over sync
    /// managers with no PDOs left.
    fn current_pdo<'cfg>(
        &mut self,
        config: &'cfg SlaveConfig,
    ) -> Option<(usize, &'cfg crate::slave::config::PdoCfg)> {
        loop {
            let sync = config.syncs.get(self.sync_cursor)?;

            if let Some(pdo) = sync.pdos.get(self.pdo_cursor) {
                return Some((self.sync_cursor, pdo));
            }

            self.sync_cursor += 1;
            self.pdo_cursor = 0;
        }
    }

    fn pump_coe(
        &mut self,
        pdu_loop: &mut PduLoop,
        slave: &mut Slave,
        config: &mut SlaveConfig,
        now: u64,
        options: &MasterOptions,
        advance: impl FnOnce(&mut Self),
    ) -> ConfigPoll {
        match self
            .coe
            .step(pdu_loop, &mut slave.mailbox, now, &options.timeouts)
        {
            CoePoll::Pending => ConfigPoll::Pending,
            CoePoll::Failed(e) => self.fail(slave, config, e),
            CoePoll::Done => {
                self.coe = CoeFsm::default();

                advance(self);

                ConfigPoll::Pending
            }
        }
    }

    /// Build the channel for the next process data sync manager to program,
    /// or `None` when all are done.
    fn next_pdo_sm(&mut self, slave: &Slave, config: &SlaveConfig) -> Option<SyncManagerChannel> {
        while usize::from(self.sm_write_index) < usize::from(slave.sm_count) {
            let index = self.sm_write_index;

            // Mailbox channels were programmed before PRE-OP
            if slave.mailbox.present()
                && (index == RX_MAILBOX_SM || index == TX_MAILBOX_SM)
            {
                self.sm_write_index += 1;
                continue;
            }

            let sii_sm = slave.sii.sync_managers.get(usize::from(index));

            let (length, direction, watchdog) = if let Some(sync) = config.sync(index) {
                (
                    sync.byte_length(),
                    Direction::from(sync.direction),
                    sync.watchdog,
                )
            } else if let Some(sii_sm) = sii_sm {
                // Fall back to the SII defaults: length from the descriptor,
                // direction from the default PDO set
                let direction = slave
                    .default_pdos()
                    .iter()
                    .find(|pdo| pdo.sync_manager == index)
                    .map(|pdo| pdo.direction)
                    .unwrap_or(Direction::MasterRead);

                (sii_sm.length, direction, WatchdogMode::Default)
            } else {
                self.sm_write_index += 1;
                continue;
            };

            let Some(sii_sm) = sii_sm else {
                self.sm_write_index += 1;
                continue;
            };

            if length == 0 {
                self.sm_write_index += 1;
                continue;
            }

            let watchdog_enable = match watchdog {
                WatchdogMode::Default => direction == Direction::MasterWrite,
                WatchdogMode::Enable => true,
                WatchdogMode::Disable => false,
            };

            return Some(SyncManagerChannel {
                physical_start_address: sii_sm.start_address,
                length_bytes: length,
                control: Control {
                    operation_mode: OperationMode::Buffered,
                    direction,
                    watchdog_enable,
                    ..Control::default()
                },
                status: Default::default(),
                enable: Enable {
                    channel_enable: true,
                    ..Enable::default()
                },
            });
        }

        None
    }

    /// Build the next FMMU entity to program from the domains that map this
    /// slave, or `None` when all are done.
    fn next_fmmu(
        &mut self,
        slave: &Slave,
        config_index: usize,
        domains: &[Domain],
    ) -> Option<Fmmu> {
        let mut nth = 0usize;

        for domain in domains {
            for mapping in domain.fmmu_mappings() {
                if mapping.config != config_index {
                    continue;
                }

                if nth != usize::from(self.fmmu_write_index) {
                    nth += 1;
                    continue;
                }

                let physical = slave
                    .sii
                    .sync_managers
                    .get(usize::from(mapping.sync_index))
                    .map(|sm| sm.start_address)
                    .unwrap_or(0);

                let read = mapping.direction == Direction::MasterRead;

                return Some(Fmmu::byte_aligned(
                    domain.logical_base() + mapping.logical_offset,
                    mapping.size,
                    physical,
                    read,
                    !read,
                ));
            }
        }

        None
    }

    fn enter_target(&mut self, slave: &mut Slave, config: &SlaveConfig) {
        match slave.al_state.next_towards(config.requested_state) {
            Some(next) => {
                self.al.start(next);
                self.state = ConfigState::ToTarget;
            }
            None => {
                self.state = ConfigState::ToTarget;
                // Degenerate case: already there. Drive one status read so
                // the Done path runs uniformly.
                self.al.start(slave.al_state);
            }
        }
    }
}
