//! Per-slave bring-up scan: station addressing, base info, DC capability,
//! DL status, SII identity/image readout and the CoE PDO configuration scan.

use super::{AlPoll, AlTransition, Slave};
use crate::coe::fsm::{CoeFsm, CoePoll};
use crate::command::Command;
use crate::dl_status::DlStatus;
use crate::eeprom::cache::SiiCache;
use crate::eeprom::types::{SiiIdentity, SiiImage, SiiInfo, SiiPdo, SiiPdoEntry, word};
use crate::eeprom::{SiiPoll, SiiReader};
use crate::error::{EepromError, Error};
use crate::fmt;
use crate::master::MasterOptions;
use crate::mailbox::{MailboxProtocols, RX_MAILBOX_SM, TX_MAILBOX_SM};
use crate::pdu_loop::{PduLoop, RegPoll, RegisterExchange};
use crate::register::{PortDescriptors, RegisterAddress, SupportFlags};
use crate::slave_state::SlaveState;
use crate::sync_manager_channel::{Direction, SyncManagerChannel};
use crate::{MAX_FMMUS, MAX_SII_WORDS, MAX_SYNC_MANAGERS};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum ScanState {
    #[default]
    Idle,
    /// APWR the configured station address.
    WriteStation,
    AwaitStation,
    /// Record the current AL state.
    ReadAl,
    AwaitAl,
    /// Registers 0x0000..0x000a: type, revision, build, FMMU/SM counts,
    /// ports, feature flags.
    ReadBase,
    AwaitBase,
    /// Confirm DC capability by reading the system time register.
    DcProbe,
    AwaitDcProbe,
    /// Port receive times for delay measurement.
    DcPortTimes,
    AwaitDcPortTimes,
    ReadDlStatus,
    AwaitDlStatus,
    /// Read the station alias register.
    ReadAliasReg,
    AwaitAliasReg,
    /// Hand the SII to the EtherCAT side.
    AssignSii,
    AwaitAssignSii,
    /// Identity words for the cache lookup.
    Identity,
    /// Category header walk to size the image.
    SizeSweep,
    /// Sequential read of the full image.
    Fetch,
    Parse,
    /// Program the mailbox sync managers so the slave accepts PRE-OP.
    WriteMailboxSms,
    AwaitMailboxSms,
    /// CoE-capable slaves are brought to PRE-OP for mailbox access.
    Preop,
    /// Live mailbox geometry from the first two sync manager channels.
    ReadSmConfig,
    AwaitSmConfig,
    /// Drain residual data out of the TX mailbox, best effort.
    MailboxCleanCheck,
    AwaitMailboxCleanCheck,
    AwaitMailboxCleanFetch,
    /// CoE reads of 0x1c1x / 0x16xx / 0x1axx.
    PdoAssignCount,
    PdoAssignEntry,
    PdoMapCount,
    PdoMapEntry,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ScanPoll {
    Pending,
    Done,
    Failed(Error),
}

/// Identity word offsets read before deciding on a cache hit.
const IDENTITY_WORDS: [u16; 5] = [
    word::ALIAS,
    word::VENDOR,
    word::PRODUCT,
    word::REVISION,
    word::SERIAL,
];

/// The scan state machine. One instance lives on the master and is restarted
/// for each slave in turn.
#[derive(Debug, Default)]
pub(crate) struct ScanFsm {
    state: ScanState,
    reg: RegisterExchange,
    sii: SiiReader,
    al: AlTransition,
    coe: CoeFsm,

    /// Identity words accumulated before the image is present.
    identity_words: [u16; 10],
    identity_step: usize,
    register_alias: Option<u16>,

    image: SiiImage,
    sweep_offset: u16,
    nwords: u16,
    fetch_offset: u16,

    sm_iter: u8,
    assign_count: u8,
    assign_sub: u8,
    pdo_list: heapless::Vec<(u16, u8), 32>,
    pdo_cursor: usize,
    map_count: u8,
    map_sub: u8,

    error: Option<Error>,
}

impl ScanFsm {
    /// Begin scanning `slave`.
    pub fn start(&mut self) {
        *self = Self {
            state: ScanState::WriteStation,
            ..Self::default()
        };
    }

    /// Tear down any exchange in flight, returning descriptors to the pool.
    pub fn abort(&mut self, pdu_loop: &mut PduLoop, slave: &mut Slave) {
        self.reg.abort(pdu_loop);
        self.sii.abort(pdu_loop);
        self.al.abort(pdu_loop);
        self.coe.abort(pdu_loop, &mut slave.mailbox);
        self.state = ScanState::Idle;
    }

    fn fail(&mut self, slave: &mut Slave, error: Error) -> ScanPoll {
        fmt::error!(
            "Failed to scan slave {}: {}",
            slave.ring_position,
            error
        );

        slave.error_flag = true;
        self.state = ScanState::Failed;
        self.error = Some(error);

        ScanPoll::Failed(error)
    }

    /// Advance the scan by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        slave: &mut Slave,
        cache: &mut SiiCache,
        override_image: Option<&SiiImage>,
        options: &MasterOptions,
        now: u64,
    ) -> ScanPoll {
        let timeouts = &options.timeouts;

        match self.state {
            ScanState::Idle | ScanState::Done => ScanPoll::Pending,
            ScanState::Failed => ScanPoll::Failed(self.error.unwrap_or(Error::Internal)),

            ScanState::WriteStation => {
                let address = slave.configured_address.to_le_bytes();

                match self.reg.write(
                    pdu_loop,
                    Command::apwr(
                        slave.ring_position,
                        RegisterAddress::ConfiguredStationAddress.into(),
                    ),
                    &address,
                ) {
                    Ok(()) => {
                        self.state = ScanState::AwaitStation;

                        ScanPoll::Pending
                    }
                    Err(e) => self.fail(slave, e),
                }
            }

            ScanState::AwaitStation => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { working_counter } => {
                    if working_counter != 1 {
                        return self.fail(
                            slave,
                            Error::WorkingCounter {
                                expected: 1,
                                received: working_counter,
                            },
                        );
                    }

                    slave.mailbox.station_address = slave.configured_address;
                    self.state = ScanState::ReadAl;

                    ScanPoll::Pending
                }
            },

            ScanState::ReadAl => self.issue_read(
                pdu_loop,
                Command::fprd(slave.configured_address, RegisterAddress::AlStatus.into()),
                2,
                ScanState::AwaitAl,
                slave,
            ),

            ScanState::AwaitAl => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { working_counter } => {
                    if working_counter != 1 {
                        return self.fail(
                            slave,
                            Error::WorkingCounter {
                                expected: 1,
                                received: working_counter,
                            },
                        );
                    }

                    let raw = self.reg.data();

                    if let Ok(status) = crate::al_control::AlStatus::unpack_from_slice(raw) {
                        slave.al_state = status.state;

                        if status.error {
                            fmt::warn!(
                                "Slave {} has pending AL error on scan",
                                slave.ring_position
                            );
                        }
                    }

                    self.state = ScanState::ReadBase;

                    ScanPoll::Pending
                }
            },

            ScanState::ReadBase => self.issue_read(
                pdu_loop,
                Command::fprd(slave.configured_address, RegisterAddress::Type.into()),
                10,
                ScanState::AwaitBase,
                slave,
            ),

            ScanState::AwaitBase => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { .. } => {
                    let data = self.reg.data();

                    if data.len() < 10 {
                        return self.fail(slave, Error::ReceiveFrame);
                    }

                    slave.base_type = data[0];
                    slave.base_revision = data[1];
                    slave.base_build = u16::from_le_bytes([data[2], data[3]]);
                    slave.fmmu_count = data[4].min(MAX_FMMUS as u8);
                    slave.sm_count = data[5].min(MAX_SYNC_MANAGERS as u8);
                    slave.ports = PortDescriptors::unpack_from_slice(&data[7..8])
                        .unwrap_or_default();
                    slave.features =
                        SupportFlags::unpack_from_slice(&data[8..10]).unwrap_or_default();

                    fmt::debug!(
                        "Slave {}: {} FMMUs, {} SMs, {}",
                        slave.ring_position,
                        slave.fmmu_count,
                        slave.sm_count,
                        slave.features
                    );

                    self.state = if slave.features.dc_supported {
                        ScanState::DcProbe
                    } else {
                        ScanState::ReadDlStatus
                    };

                    ScanPoll::Pending
                }
            },

            ScanState::DcProbe => self.issue_read(
                pdu_loop,
                Command::fprd(slave.configured_address, RegisterAddress::DcSystemTime.into()),
                4,
                ScanState::AwaitDcProbe,
                slave,
            ),

            ScanState::AwaitDcProbe => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { working_counter } => {
                    if working_counter != 1 {
                        // Registers missing: the feature bit lied
                        fmt::warn!(
                            "Slave {} claims DC support but has no system time register",
                            slave.ring_position
                        );

                        slave.features.dc_supported = false;
                        self.state = ScanState::ReadDlStatus;
                    } else {
                        self.state = ScanState::DcPortTimes;
                    }

                    ScanPoll::Pending
                }
            },

            ScanState::DcPortTimes => self.issue_read(
                pdu_loop,
                Command::fprd(slave.configured_address, RegisterAddress::DcTimePort0.into()),
                16,
                ScanState::AwaitDcPortTimes,
                slave,
            ),

            ScanState::AwaitDcPortTimes => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { .. } => {
                    let data = self.reg.data();

                    for port in 0..4 {
                        slave.port_receive_times[port] = data
                            .get(port * 4..port * 4 + 4)
                            .and_then(|raw| raw.try_into().ok())
                            .map(u32::from_le_bytes)
                            .unwrap_or(0);
                    }

                    self.state = ScanState::ReadDlStatus;

                    ScanPoll::Pending
                }
            },

            ScanState::ReadDlStatus => self.issue_read(
                pdu_loop,
                Command::fprd(slave.configured_address, RegisterAddress::DlStatus.into()),
                2,
                ScanState::AwaitDlStatus,
                slave,
            ),

            ScanState::AwaitDlStatus => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { .. } => {
                    slave.dl_status =
                        DlStatus::unpack_from_slice(self.reg.data()).unwrap_or_default();

                    self.state = if options.use_register_alias {
                        ScanState::ReadAliasReg
                    } else {
                        ScanState::AssignSii
                    };

                    ScanPoll::Pending
                }
            },

            ScanState::ReadAliasReg => self.issue_read(
                pdu_loop,
                Command::fprd(
                    slave.configured_address,
                    RegisterAddress::ConfiguredStationAlias.into(),
                ),
                2,
                ScanState::AwaitAliasReg,
                slave,
            ),

            ScanState::AwaitAliasReg => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { .. } => {
                    let data = self.reg.data();

                    self.register_alias = Some(u16::from_le_bytes([
                        data.first().copied().unwrap_or(0),
                        data.get(1).copied().unwrap_or(0),
                    ]));

                    self.state = ScanState::AssignSii;

                    ScanPoll::Pending
                }
            },

            ScanState::AssignSii => {
                // Bit 0 of 0x0500 clear: EtherCAT side owns the SII interface
                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(slave.configured_address, RegisterAddress::SiiAccess.into()),
                    &[0x00, 0x00],
                ) {
                    Ok(()) => {
                        self.state = ScanState::AwaitAssignSii;

                        ScanPoll::Pending
                    }
                    Err(e) => self.fail(slave, e),
                }
            }

            ScanState::AwaitAssignSii => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { .. } => {
                    if let Some(image) = override_image {
                        fmt::info!(
                            "Slave {}: using external SII image ({} words)",
                            slave.ring_position,
                            image.words.len()
                        );

                        self.image = image.clone();
                        self.state = ScanState::Parse;

                        return ScanPoll::Pending;
                    }

                    self.identity_step = 0;
                    self.sii.start(IDENTITY_WORDS[0]);
                    self.state = ScanState::Identity;

                    ScanPoll::Pending
                }
            },

            ScanState::Identity => {
                match self
                    .sii
                    .step(pdu_loop, slave.configured_address, now, timeouts)
                {
                    SiiPoll::Pending => ScanPoll::Pending,
                    SiiPoll::Failed(e) => self.fail(slave, e),
                    SiiPoll::Done(raw) => {
                        self.identity_words[self.identity_step * 2] =
                            u16::from_le_bytes([raw[0], raw[1]]);
                        self.identity_words[self.identity_step * 2 + 1] =
                            u16::from_le_bytes([raw[2], raw[3]]);

                        self.identity_step += 1;

                        if self.identity_step < IDENTITY_WORDS.len() {
                            self.sii.start(IDENTITY_WORDS[self.identity_step]);

                            return ScanPoll::Pending;
                        }

                        let identity = self.read_identity();

                        if let Some(cached) = cache.lookup(&identity) {
                            fmt::debug!(
                                "Slave {}: SII image reattached from cache",
                                slave.ring_position
                            );

                            self.image = cached.clone();
                            self.state = ScanState::Parse;
                        } else {
                            self.sweep_offset = word::FIRST_CATEGORY;
                            self.sii.start(self.sweep_offset);
                            self.state = ScanState::SizeSweep;
                        }

                        ScanPoll::Pending
                    }
                }
            }

            ScanState::SizeSweep => {
                match self
                    .sii
                    .step(pdu_loop, slave.configured_address, now, timeouts)
                {
                    SiiPoll::Pending => ScanPoll::Pending,
                    SiiPoll::Failed(e) => self.fail(slave, e),
                    SiiPoll::Done(raw) => {
                        let category = u16::from_le_bytes([raw[0], raw[1]]);
                        let size = u16::from_le_bytes([raw[2], raw[3]]);

                        if category == 0xffff {
                            self.nwords = self.sweep_offset + 1;
                            self.fetch_offset = 0;
                            self.image.words.clear();
                            self.sii.start(0);
                            self.state = ScanState::Fetch;

                            return ScanPoll::Pending;
                        }

                        let next = u32::from(self.sweep_offset) + 2 + u32::from(size);

                        if next >= MAX_SII_WORDS as u32 {
                            fmt::warn!(
                                "Slave {}: SII category list unterminated, truncating image",
                                slave.ring_position
                            );

                            self.nwords = word::FIRST_CATEGORY;
                            self.fetch_offset = 0;
                            self.image.words.clear();
                            self.sii.start(0);
                            self.state = ScanState::Fetch;

                            return ScanPoll::Pending;
                        }

                        self.sweep_offset = next as u16;
                        self.sii.start(self.sweep_offset);

                        ScanPoll::Pending
                    }
                }
            }

            ScanState::Fetch => {
                match self
                    .sii
                    .step(pdu_loop, slave.configured_address, now, timeouts)
                {
                    SiiPoll::Pending => ScanPoll::Pending,
                    SiiPoll::Failed(e) => self.fail(slave, e),
                    SiiPoll::Done(raw) => {
                        for half in 0..2 {
                            let value =
                                u16::from_le_bytes([raw[half * 2], raw[half * 2 + 1]]);

                            if self.image.words.push(value).is_err() {
                                return self
                                    .fail(slave, Error::Eeprom(EepromError::ImageTooLarge));
                            }
                        }

                        self.fetch_offset += 2;

                        if self.fetch_offset < self.nwords {
                            self.sii.start(self.fetch_offset);

                            return ScanPoll::Pending;
                        }

                        self.image.words.truncate(usize::from(self.nwords));
                        self.state = ScanState::Parse;

                        ScanPoll::Pending
                    }
                }
            }

            ScanState::Parse => {
                let info = match SiiInfo::parse(&self.image) {
                    Ok(info) => info,
                    Err(e) => return self.fail(slave, Error::Eeprom(e)),
                };

                cache.insert(&self.image);

                slave.sii_image = core::mem::take(&mut self.image);
                slave.sii = info;

                if let Some(alias) = self.register_alias {
                    slave.sii.identity.alias = alias;
                }

                slave.mailbox.rx_offset = slave.sii.std_rx_mbox_offset;
                slave.mailbox.rx_size = slave.sii.std_rx_mbox_size;
                slave.mailbox.tx_offset = slave.sii.std_tx_mbox_offset;
                slave.mailbox.tx_size = slave.sii.std_tx_mbox_size;

                fmt::info!(
                    "Slave {}: vendor {:#010x} product {:#010x} revision {:#010x}",
                    slave.ring_position,
                    slave.sii.identity.vendor_id,
                    slave.sii.identity.product_code,
                    slave.sii.identity.revision
                );

                if slave
                    .sii
                    .mailbox_protocols
                    .contains(MailboxProtocols::COE)
                    && slave.mailbox.present()
                {
                    self.state = ScanState::WriteMailboxSms;
                } else {
                    self.state = ScanState::Done;

                    return ScanPoll::Done;
                }

                ScanPoll::Pending
            }

            ScanState::WriteMailboxSms => {
                let mut raw = [0u8; 2 * SyncManagerChannel::PACKED_LEN];

                SyncManagerChannel::mailbox(
                    slave.mailbox.rx_offset,
                    slave.mailbox.rx_size,
                    Direction::MasterWrite,
                )
                .pack_to_slice_unchecked(&mut raw[..SyncManagerChannel::PACKED_LEN]);

                SyncManagerChannel::mailbox(
                    slave.mailbox.tx_offset,
                    slave.mailbox.tx_size,
                    Direction::MasterRead,
                )
                .pack_to_slice_unchecked(&mut raw[SyncManagerChannel::PACKED_LEN..]);

                match self.reg.write(
                    pdu_loop,
                    Command::fpwr(
                        slave.configured_address,
                        RegisterAddress::sync_manager(RX_MAILBOX_SM),
                    ),
                    &raw,
                ) {
                    Ok(()) => {
                        self.state = ScanState::AwaitMailboxSms;

                        ScanPoll::Pending
                    }
                    Err(e) => self.fail(slave, e),
                }
            }

            ScanState::AwaitMailboxSms => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { .. } => {
                    self.al.start(SlaveState::PreOp);
                    self.state = ScanState::Preop;

                    ScanPoll::Pending
                }
            },

            ScanState::Preop => {
                match self
                    .al
                    .step(pdu_loop, slave.configured_address, now, timeouts)
                {
                    AlPoll::Pending => ScanPoll::Pending,
                    AlPoll::Failed(e) => {
                        slave.al_status_code = self.al.status_code;

                        self.fail(slave, e)
                    }
                    AlPoll::Done => {
                        slave.al_state = SlaveState::PreOp;
                        self.state = ScanState::ReadSmConfig;

                        ScanPoll::Pending
                    }
                }
            }

            ScanState::ReadSmConfig => self.issue_read(
                pdu_loop,
                Command::fprd(
                    slave.configured_address,
                    RegisterAddress::sync_manager(RX_MAILBOX_SM),
                ),
                2 * SyncManagerChannel::PACKED_LEN,
                ScanState::AwaitSmConfig,
                slave,
            ),

            ScanState::AwaitSmConfig => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                RegPoll::Failed(e) => self.fail(slave, e),
                RegPoll::Done { .. } => {
                    let data = self.reg.data();

                    // The live configuration wins over the SII defaults once
                    // the slave is in PRE-OP
                    for (index, chunk) in data.chunks_exact(SyncManagerChannel::PACKED_LEN).enumerate()
                    {
                        let Ok(channel) = SyncManagerChannel::unpack_from_slice(chunk) else {
                            continue;
                        };

                        if !channel.enable.channel_enable || channel.length_bytes == 0 {
                            continue;
                        }

                        if index == usize::from(RX_MAILBOX_SM) {
                            slave.mailbox.rx_offset = channel.physical_start_address;
                            slave.mailbox.rx_size = channel.length_bytes;
                        } else if index == usize::from(TX_MAILBOX_SM) {
                            slave.mailbox.tx_offset = channel.physical_start_address;
                            slave.mailbox.tx_size = channel.length_bytes;
                        }
                    }

                    self.state = ScanState::MailboxCleanCheck;

                    ScanPoll::Pending
                }
            },

            ScanState::MailboxCleanCheck => self.issue_read(
                pdu_loop,
                Command::fprd(
                    slave.configured_address,
                    RegisterAddress::sync_manager_status(TX_MAILBOX_SM),
                ),
                1,
                ScanState::AwaitMailboxCleanCheck,
                slave,
            ),

            ScanState::AwaitMailboxCleanCheck => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                // Best effort: failures skip straight to the PDO scan
                RegPoll::Failed(_) => {
                    self.begin_pdo_scan();

                    ScanPoll::Pending
                }
                RegPoll::Done { .. } => {
                    let full = self
                        .reg
                        .data()
                        .first()
                        .map(|status| status & 0x08 != 0)
                        .unwrap_or(false);

                    if !full {
                        self.begin_pdo_scan();

                        return ScanPoll::Pending;
                    }

                    fmt::debug!(
                        "Slave {}: discarding residual mailbox data",
                        slave.ring_position
                    );

                    match self.reg.read(
                        pdu_loop,
                        Command::fprd(slave.configured_address, slave.mailbox.tx_offset),
                        usize::from(slave.mailbox.tx_size).min(crate::pdu_loop::REG_DATA_MAX),
                    ) {
                        Ok(()) => {
                            self.state = ScanState::AwaitMailboxCleanFetch;

                            ScanPoll::Pending
                        }
                        Err(_) => {
                            self.begin_pdo_scan();

                            ScanPoll::Pending
                        }
                    }
                }
            },

            ScanState::AwaitMailboxCleanFetch => match self.reg.poll(pdu_loop, now, timeouts.pdu) {
                RegPoll::Pending => ScanPoll::Pending,
                // Contents are irrelevant; the fetch itself clears the
                // mailbox
                RegPoll::Failed(_) | RegPoll::Done { .. } => {
                    self.begin_pdo_scan();

                    ScanPoll::Pending
                }
            },

            ScanState::PdoAssignCount => {
                if self.sm_iter >= slave.sm_count {
                    // All assignments read; move on to the mappings
                    self.pdo_cursor = 0;
                    self.state = ScanState::PdoMapCount;

                    return ScanPoll::Pending;
                }

                if self.coe.is_idle() {
                    self.coe.start_upload(
                        crate::coe::SDO_PDO_ASSIGN_BASE + u16::from(self.sm_iter),
                        0,
                        false,
                    );
                }

                match self.coe.step(pdu_loop, &mut slave.mailbox, now, timeouts) {
                    CoePoll::Pending => ScanPoll::Pending,
                    CoePoll::Failed(_) => {
                        // Object absent: this SM has no PDO assignment
                        self.next_sm();

                        ScanPoll::Pending
                    }
                    CoePoll::Done => {
                        self.assign_count = self.coe.data().first().copied().unwrap_or(0);
                        self.assign_sub = 1;

                        if self.assign_count == 0 {
                            self.next_sm();
                        } else {
                            self.coe = CoeFsm::default();
                            self.state = ScanState::PdoAssignEntry;
                        }

                        ScanPoll::Pending
                    }
                }
            }

            ScanState::PdoAssignEntry => {
                if self.coe.is_idle() {
                    self.coe.start_upload(
                        crate::coe::SDO_PDO_ASSIGN_BASE + u16::from(self.sm_iter),
                        self.assign_sub,
                        false,
                    );
                }

                match self.coe.step(pdu_loop, &mut slave.mailbox, now, timeouts) {
                    CoePoll::Pending => ScanPoll::Pending,
                    CoePoll::Failed(_) => {
                        self.next_sm();

                        ScanPoll::Pending
                    }
                    CoePoll::Done => {
                        let data = self.coe.data();

                        if data.len() >= 2 {
                            let pdo = u16::from_le_bytes([data[0], data[1]]);

                            if pdo != 0 {
                                let _ = self.pdo_list.push((pdo, self.sm_iter));
                            }
                        }

                        if self.assign_sub < self.assign_count {
                            self.assign_sub += 1;
                            self.coe = CoeFsm::default();
                        } else {
                            self.next_sm();
                        }

                        ScanPoll::Pending
                    }
                }
            }

            ScanState::PdoMapCount => {
                if self.pdo_cursor >= self.pdo_list.len() {
                    self.state = ScanState::Done;

                    return ScanPoll::Done;
                }

                let (pdo, _) = self.pdo_list[self.pdo_cursor];

                if self.coe.is_idle() {
                    self.coe.start_upload(pdo, 0, false);
                }

                match self.coe.step(pdu_loop, &mut slave.mailbox, now, timeouts) {
                    CoePoll::Pending => ScanPoll::Pending,
                    CoePoll::Failed(_) => {
                        self.next_pdo(slave);

                        ScanPoll::Pending
                    }
                    CoePoll::Done => {
                        self.map_count = self.coe.data().first().copied().unwrap_or(0);
                        self.map_sub = 1;

                        self.push_scanned_pdo(slave);

                        if self.map_count == 0 {
                            self.next_pdo(slave);
                        } else {
                            self.coe = CoeFsm::default();
                            self.state = ScanState::PdoMapEntry;
                        }

                        ScanPoll::Pending
                    }
                }
            }

            ScanState::PdoMapEntry => {
                let (pdo, _) = self.pdo_list[self.pdo_cursor];

                if self.coe.is_idle() {
                    self.coe.start_upload(pdo, self.map_sub, false);
                }

                match self.coe.step(pdu_loop, &mut slave.mailbox, now, timeouts) {
                    CoePoll::Pending => ScanPoll::Pending,
                    CoePoll::Failed(_) => {
                        self.next_pdo(slave);

                        ScanPoll::Pending
                    }
                    CoePoll::Done => {
                        let data = self.coe.data();

                        if data.len() >= 4 {
                            let raw = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

                            let entry = SiiPdoEntry {
                                index: (raw >> 16) as u16,
                                sub_index: (raw >> 8) as u8,
                                bit_length: raw as u8,
                            };

                            if let Some(last) = slave.coe_pdos.last_mut() {
                                let _ = last.entries.push(entry);
                            }
                        }

                        if self.map_sub < self.map_count {
                            self.map_sub += 1;
                            self.coe = CoeFsm::default();
                        } else {
                            self.next_pdo(slave);
                        }

                        ScanPoll::Pending
                    }
                }
            }
        }
    }

    fn issue_read(
        &mut self,
        pdu_loop: &mut PduLoop,
        command: Command,
        len: usize,
        next: ScanState,
        slave: &mut Slave,
    ) -> ScanPoll {
        match self.reg.read(pdu_loop, command, len) {
            Ok(()) => {
                self.state = next;

                ScanPoll::Pending
            }
            Err(e) => self.fail(slave, e),
        }
    }

    fn read_identity(&self) -> SiiIdentity {
        SiiIdentity {
            alias: self.identity_words[0],
            vendor_id: u32::from(self.identity_words[2])
                | u32::from(self.identity_words[3]) << 16,
            product_code: u32::from(self.identity_words[4])
                | u32::from(self.identity_words[5]) << 16,
            revision: u32::from(self.identity_words[6])
                | u32::from(self.identity_words[7]) << 16,
            serial: u32::from(self.identity_words[8])
                | u32::from(self.identity_words[9]) << 16,
        }
    }

    fn begin_pdo_scan(&mut self) {
        self.sm_iter = 2;
        self.pdo_list.clear();
        self.coe = CoeFsm::default();
        self.state = ScanState::PdoAssignCount;
    }

    fn next_sm(&mut self) {
        self.sm_iter += 1;
        self.coe = CoeFsm::default();
        self.state = ScanState::PdoAssignCount;
    }

    fn next_pdo(&mut self, _slave: &mut Slave) {
        self.pdo_cursor += 1;
        self.coe = CoeFsm::default();
        self.state = ScanState::PdoMapCount;
    }

    /// Start a fresh entry list for the PDO under the mapping scan.
    fn push_scanned_pdo(&mut self, slave: &mut Slave) {
        let (pdo, sm) = self.pdo_list[self.pdo_cursor];

        let direction = if pdo < 0x1a00 {
            Direction::MasterWrite
        } else {
            Direction::MasterRead
        };

        let _ = slave.coe_pdos.push(SiiPdo {
            index: pdo,
            sync_manager: sm,
            direction,
            entries: heapless::Vec::new(),
        });
    }
}
