//! The master: owner of the device, datagram engine, slave list, domains and
//! request arenas, and the top level cooperative state machine that drives
//! scanning, configuration, acyclic services and liveness monitoring.

use crate::al_control::AlStatus;
use crate::coe::fsm::{CoeFsm, CoePoll};
use crate::command::Command;
use crate::dc::{DEFAULT_DRIFT_WINDOW, DcFilter, calc_propagation_delays};
use crate::device::{Clock, Device, DeviceStats, LinkState};
use crate::domain::{Domain, DomainHandle, DomainState};
use crate::eeprom::cache::SiiCache;
use crate::eeprom::types::SiiImage;
use crate::eoe::{EoeFsm, EoePoll};
use crate::error::{DcError, Error, Item};
use crate::foe::{FoeFsm, FoePoll};
use crate::fmt;
use crate::mailbox::MailboxProtocols;
use crate::pdu_loop::{PduLoop, PduPoll, PduQueue, PduStats, RegPoll, RegisterExchange};
use crate::register::RegisterAddress;
use crate::request::{
    DictRequest, EoeRequest, FoeRequest, RegRequest, RequestDirection, RequestState, Requests,
    SdoRequest, SoeRequest, VoeRequest,
};
use crate::slave::config::{DcConfig, IdnConfig, PdoCfg, PdoEntryCfg, SdoConfig, SlaveConfig, SmCfg, SyncDirection, WatchdogMode};
use crate::slave::configurator::{ConfigFsm, ConfigPoll};
use crate::slave::scan::{ScanFsm, ScanPoll};
use crate::slave::Slave;
use crate::slave_state::SlaveState;
use crate::soe::{SoeFsm, SoePoll};
use crate::voe::{VoeFsm, VoePoll};
use crate::{MAX_DOMAINS, MAX_SLAVES};
use ethercrab_wire::EtherCrabWireRead;

/// Timeouts used by the master's state machines, all in nanoseconds.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// Deadline for a single acyclic datagram round trip.
    pub pdu: u64,
    /// Deadline for a slave to answer a mailbox request.
    pub mailbox_response: u64,
    /// Deadline for an AL state transition to complete.
    pub state_transition: u64,
    /// Deadline for a cyclic (domain) datagram; the default is one cycle.
    pub cycle: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            pdu: 100_000_000,
            mailbox_response: 3_000_000_000,
            state_transition: 5_000_000_000,
            cycle: 1_000_000,
        }
    }
}

/// Master tuning knobs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MasterOptions {
    pub timeouts: Timeouts,
    /// Application cycle period in ns, used for domain datagram deadlines and
    /// the DC drift filter.
    pub cycle_time_ns: u32,
    /// DC drift filter window in cycles.
    pub drift_window: u32,
    /// Prefer the alias from register `0x0012` over the SII alias word.
    pub use_register_alias: bool,
}

impl Default for MasterOptions {
    fn default() -> Self {
        Self {
            timeouts: Timeouts::default(),
            cycle_time_ns: 1_000_000,
            drift_window: DEFAULT_DRIFT_WINDOW,
            use_register_alias: false,
        }
    }
}

/// Bus level state returned by [`Master::state`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct MasterState {
    /// Number of slaves answering the broadcast liveness probe.
    pub slaves_responding: u16,
    /// OR of the AL state nibbles of all responding slaves.
    pub al_states: u8,
    /// Network link presence.
    pub link_up: bool,
}

/// State of one configured slave, per [`Master::slave_config_state`].
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SlaveConfigState {
    /// The matched slave is present and answering.
    pub online: bool,
    /// The slave reached `OP` with this configuration applied.
    pub operational: bool,
    /// Current AL state.
    pub al_state: SlaveState,
}

/// Opaque handle to a slave configuration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SlaveConfigHandle(pub(crate) usize);

macro_rules! request_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub struct $name(pub(crate) usize);
    };
}

request_handle!(
    /// Opaque handle to an SDO request.
    SdoRequestHandle
);
request_handle!(
    /// Opaque handle to a FoE request.
    FoeRequestHandle
);
request_handle!(
    /// Opaque handle to an EoE request.
    EoeRequestHandle
);
request_handle!(
    /// Opaque handle to an SoE request.
    SoeRequestHandle
);
request_handle!(
    /// Opaque handle to a VoE handler.
    VoeRequestHandle
);
request_handle!(
    /// Opaque handle to a register request.
    RegRequestHandle
);
request_handle!(
    /// Opaque handle to a dictionary request.
    DictRequestHandle
);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum MasterPhase {
    /// Scanning and monitoring only; configuration is parked.
    Idle,
    /// Activated: configuration runs and cyclic data may be exchanged.
    Operation,
}

/// Distributed clock runtime state.
struct DcRuntime {
    /// Reference slave selected at activation.
    reference: Option<usize>,
    /// Reference selection requested by the application.
    reference_config: Option<usize>,
    app_time: u64,
    prev_app_time: u64,
    last_ref_time: u32,
    filter: DcFilter,
    sync_ref_handle: Option<crate::pdu_loop::PduHandle>,
    sync_slaves_handle: Option<crate::pdu_loop::PduHandle>,
}

impl Default for DcRuntime {
    fn default() -> Self {
        Self {
            reference: None,
            reference_config: None,
            app_time: 0,
            prev_app_time: 0,
            last_ref_time: 0,
            filter: DcFilter::default(),
            sync_ref_handle: None,
            sync_slaves_handle: None,
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum FsmState {
    /// Broadcast liveness/topology probe.
    #[default]
    Probe,
    AwaitProbe,
    StartScan {
        slave: usize,
    },
    Scanning {
        slave: usize,
    },
    /// Broadcast write latching the port receive times on all slaves.
    DcLatch,
    AwaitDcLatch,
    DcTimes {
        slave: usize,
    },
    AwaitDcTimes {
        slave: usize,
    },
    DcSystime {
        slave: usize,
    },
    AwaitDcSystime {
        slave: usize,
    },
    AwaitDcOffset {
        slave: usize,
    },
    AwaitDcDelay {
        slave: usize,
    },
    /// Find the next configuration to apply.
    NextConfig,
    Configuring {
        config: usize,
    },
    /// Process at most one acyclic request.
    Request,
    Monitor {
        slave: usize,
    },
    AwaitMonitor {
        slave: usize,
    },
}

/// The request currently being processed by the acyclic runner.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum ActiveRequest {
    #[default]
    None,
    Sdo(usize),
    Foe(usize),
    Eoe(usize),
    Soe(usize),
    Voe(usize),
    Reg(usize),
    Dict(usize),
}

/// Runs one acyclic request at a time through its protocol state machine.
#[derive(Default)]
struct RequestRunner {
    active: ActiveRequest,
    coe: CoeFsm,
    foe: FoeFsm,
    eoe: EoeFsm,
    soe: SoeFsm,
    voe: VoeFsm,
    reg: RegisterExchange,
}

/// An EtherCAT master. One per physical Ethernet segment.
///
/// Generic over the raw Ethernet [`Device`] and the monotonic [`Clock`], both
/// injected at construction.
pub struct Master<D, C> {
    device: D,
    clock: C,
    options: MasterOptions,

    phase: MasterPhase,
    link: LinkState,
    stats: DeviceStats,

    pdu: PduLoop,
    slaves: heapless::Vec<Slave, MAX_SLAVES>,
    configs: heapless::Vec<SlaveConfig, MAX_SLAVES>,
    domains: heapless::Vec<Domain, MAX_DOMAINS>,
    requests: Requests,
    cache: SiiCache,
    /// External SII images by ring position, replacing EEPROM reads.
    sii_overrides: heapless::Vec<(u16, SiiImage), 4>,
    dc: DcRuntime,

    fsm_state: FsmState,
    scan_fsm: ScanFsm,
    config_fsm: ConfigFsm,
    fsm_reg: RegisterExchange,
    runner: RequestRunner,
    /// The whole bus has been scanned since the last topology change.
    bus_scanned: bool,
    slaves_responding: u16,
    al_states: u8,
}

impl<D: Device, C: Clock> Master<D, C> {
    /// Create a master over the given device and clock.
    ///
    /// The master starts in its idle phase: it will scan and monitor the bus
    /// as soon as [`fsm_step`](Self::fsm_step)/[`send_ext`](Self::send_ext)
    /// are pumped, but slaves are only configured once
    /// [`activate`](Self::activate) is called.
    pub fn new(device: D, clock: C, options: MasterOptions) -> Self {
        Self {
            device,
            clock,
            options,
            phase: MasterPhase::Idle,
            link: LinkState::Down,
            stats: DeviceStats::default(),
            pdu: PduLoop::new(),
            slaves: heapless::Vec::new(),
            configs: heapless::Vec::new(),
            domains: heapless::Vec::new(),
            requests: Requests::default(),
            cache: SiiCache::default(),
            sii_overrides: heapless::Vec::new(),
            dc: DcRuntime::default(),
            fsm_state: FsmState::default(),
            scan_fsm: ScanFsm::default(),
            config_fsm: ConfigFsm::default(),
            fsm_reg: RegisterExchange::default(),
            runner: RequestRunner::default(),
            bus_scanned: false,
            slaves_responding: 0,
            al_states: 0,
        }
    }

    /// The discovered slaves, ordered by ring position.
    pub fn slaves(&self) -> &[Slave] {
        &self.slaves
    }

    /// Datagram engine statistics.
    pub fn pdu_stats(&self) -> PduStats {
        self.pdu.stats()
    }

    /// Device statistics.
    pub fn device_stats(&self) -> DeviceStats {
        self.stats
    }

    /// Bus level state.
    pub fn state(&self) -> MasterState {
        MasterState {
            slaves_responding: self.slaves_responding,
            al_states: self.al_states,
            link_up: self.link == LinkState::Up,
        }
    }

    /// Provide an external SII image for the slave at `position`, replacing
    /// EEPROM reads entirely.
    pub fn set_sii_override(&mut self, position: u16, words: &[u16]) -> Result<(), Error> {
        let image = SiiImage {
            words: heapless::Vec::from_slice(words)
                .map_err(|_| Error::Capacity(Item::SiiImage))?,
        };

        if let Some(existing) = self
            .sii_overrides
            .iter_mut()
            .find(|(at, _)| *at == position)
        {
            existing.1 = image;

            return Ok(());
        }

        self.sii_overrides
            .push((position, image))
            .map_err(|_| Error::Capacity(Item::SiiImage))
    }

    // ------------------------------------------------------------------
    // Configuration-time API
    // ------------------------------------------------------------------

    /// Create a new process data domain.
    pub fn create_domain(&mut self) -> Result<DomainHandle, Error> {
        if self.phase == MasterPhase::Operation {
            return Err(Error::Busy);
        }

        self.domains
            .push(Domain::default())
            .map_err(|_| Error::Capacity(Item::Domain))?;

        Ok(DomainHandle(self.domains.len() - 1))
    }

    /// Declare an expected slave at `(alias, position)` with the given
    /// identity, returning its configuration handle.
    pub fn slave_config(
        &mut self,
        alias: u16,
        position: u16,
        vendor_id: u32,
        product_code: u32,
    ) -> Result<SlaveConfigHandle, Error> {
        if self.phase == MasterPhase::Operation {
            return Err(Error::Busy);
        }

        if self
            .configs
            .iter()
            .any(|config| config.alias == alias && config.position == position)
        {
            return Err(Error::Exists(Item::SlaveConfig));
        }

        self.configs
            .push(SlaveConfig::new(alias, position, vendor_id, product_code))
            .map_err(|_| Error::Capacity(Item::SlaveConfig))?;

        Ok(SlaveConfigHandle(self.configs.len() - 1))
    }

    fn config_mut(&mut self, sc: SlaveConfigHandle) -> Result<&mut SlaveConfig, Error> {
        self.configs.get_mut(sc.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(sc.0),
        })
    }

    fn config_ref(&self, sc: SlaveConfigHandle) -> Result<&SlaveConfig, Error> {
        self.configs.get(sc.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(sc.0),
        })
    }

    /// Replace the complete sync manager/PDO layout of a configuration.
    pub fn slave_config_pdos(
        &mut self,
        sc: SlaveConfigHandle,
        syncs: &[SmCfg],
    ) -> Result<(), Error> {
        self.config_mut(sc)?
            .set_pdos(syncs)
            .map_err(|_| Error::InvalidInput)
    }

    /// Configure one sync manager's direction and watchdog mode.
    pub fn slave_config_sync_manager(
        &mut self,
        sc: SlaveConfigHandle,
        index: u8,
        direction: SyncDirection,
        watchdog: WatchdogMode,
    ) -> Result<(), Error> {
        if usize::from(index) >= crate::MAX_SYNC_MANAGERS {
            return Err(Error::InvalidInput);
        }

        let config = self.config_mut(sc)?;

        if let Some(sync) = config.sync_mut(index) {
            sync.direction = direction;
            sync.watchdog = watchdog;
        } else {
            let mut sync = SmCfg::output(index);

            sync.direction = direction;
            sync.watchdog = watchdog;

            config
                .syncs
                .push(sync)
                .map_err(|_| Error::Capacity(Item::SyncManager))?;
        }

        Ok(())
    }

    /// Assign a PDO to a sync manager.
    pub fn slave_config_pdo_assign_add(
        &mut self,
        sc: SlaveConfigHandle,
        sync_index: u8,
        pdo_index: u16,
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        let sync = config.sync_mut(sync_index).ok_or(Error::NotFound {
            item: Item::SyncManager,
            index: Some(usize::from(sync_index)),
        })?;

        sync.pdos
            .push(PdoCfg::new(pdo_index))
            .map_err(|_| Error::Capacity(Item::Pdo))
    }

    /// Clear the PDO assignment of a sync manager.
    pub fn slave_config_pdo_assign_clear(
        &mut self,
        sc: SlaveConfigHandle,
        sync_index: u8,
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        if let Some(sync) = config.sync_mut(sync_index) {
            sync.pdos.clear();
        }

        Ok(())
    }

    /// Append an entry to a PDO's mapping.
    pub fn slave_config_pdo_mapping_add(
        &mut self,
        sc: SlaveConfigHandle,
        pdo_index: u16,
        entry_index: u16,
        entry_sub_index: u8,
        entry_bit_length: u8,
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        for sync in config.syncs.iter_mut() {
            if let Some(pdo) = sync.pdos.iter_mut().find(|pdo| pdo.index == pdo_index) {
                return pdo
                    .entries
                    .push(PdoEntryCfg {
                        index: entry_index,
                        sub_index: entry_sub_index,
                        bit_length: entry_bit_length,
                    })
                    .map_err(|_| Error::Capacity(Item::PdoEntry));
            }
        }

        Err(Error::NotFound {
            item: Item::Pdo,
            index: Some(usize::from(pdo_index)),
        })
    }

    /// Clear a PDO's entry mapping.
    pub fn slave_config_pdo_mapping_clear(
        &mut self,
        sc: SlaveConfigHandle,
        pdo_index: u16,
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        for sync in config.syncs.iter_mut() {
            if let Some(pdo) = sync.pdos.iter_mut().find(|pdo| pdo.index == pdo_index) {
                pdo.entries.clear();

                return Ok(());
            }
        }

        Ok(())
    }

    /// Register a PDO entry for process data exchange in `domain`.
    ///
    /// Returns the entry's byte offset into the domain image and its bit
    /// position within that byte.
    pub fn slave_config_reg_pdo_entry(
        &mut self,
        sc: SlaveConfigHandle,
        entry_index: u16,
        entry_sub_index: u8,
        domain: DomainHandle,
    ) -> Result<(u32, u8), Error> {
        if self.phase == MasterPhase::Operation {
            return Err(Error::Busy);
        }

        let config = self.configs.get(sc.0).ok_or(Error::NotFound {
            item: Item::SlaveConfig,
            index: Some(sc.0),
        })?;

        for sync in config.syncs.iter() {
            let mut bit_offset = 0u32;

            for pdo in sync.pdos.iter() {
                for entry in pdo.entries.iter() {
                    if entry.index == entry_index && entry.sub_index == entry_sub_index {
                        let size = sync.byte_length();
                        let direction = sync.direction.into();
                        let sync_index = sync.index;

                        let domain = self.domains.get_mut(domain.0).ok_or(Error::NotFound {
                            item: Item::Domain,
                            index: Some(domain.0),
                        })?;

                        let logical = domain.prepare_fmmu(sc.0, sync_index, direction, size)?;

                        return Ok((logical + bit_offset / 8, (bit_offset % 8) as u8));
                    }

                    bit_offset += u32::from(entry.bit_length);
                }
            }
        }

        Err(Error::NotFound {
            item: Item::PdoEntry,
            index: None,
        })
    }

    /// Configure distributed clock parameters for a slave.
    pub fn slave_config_dc(
        &mut self,
        sc: SlaveConfigHandle,
        assign_activate: u16,
        sync0_cycle: u32,
        sync0_shift: i32,
        sync1_cycle: u32,
        sync1_shift: i32,
    ) -> Result<(), Error> {
        self.config_mut(sc)?.dc = Some(DcConfig {
            assign_activate,
            sync0_cycle,
            sync0_shift,
            sync1_cycle,
            sync1_shift,
        });

        Ok(())
    }

    /// Configure the slave's watchdog divider and sync manager watchdog
    /// intervals.
    pub fn slave_config_watchdog(
        &mut self,
        sc: SlaveConfigHandle,
        divider: u16,
        intervals: u16,
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        config.watchdog_divider = Some(divider);
        config.watchdog_intervals = Some(intervals);

        Ok(())
    }

    /// Park a slave in a lower AL state instead of `OP`, e.g. `BOOT` for
    /// firmware download.
    pub fn slave_config_request_state(
        &mut self,
        sc: SlaveConfigHandle,
        state: SlaveState,
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        config.requested_state = state;
        config.applied = false;

        Ok(())
    }

    fn push_sdo_config(
        &mut self,
        sc: SlaveConfigHandle,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        let entry = SdoConfig {
            index,
            sub_index,
            complete_access,
            data: heapless::Vec::from_slice(data).map_err(|_| Error::Capacity(Item::Request))?,
        };

        config
            .sdo_configs
            .push(entry)
            .map_err(|_| Error::Capacity(Item::Request))
    }

    /// Add a startup SDO write with raw data.
    pub fn slave_config_sdo(
        &mut self,
        sc: SlaveConfigHandle,
        index: u16,
        sub_index: u8,
        data: &[u8],
    ) -> Result<(), Error> {
        self.push_sdo_config(sc, index, sub_index, false, data)
    }

    /// Add a startup SDO write of a `u8`.
    pub fn slave_config_sdo8(
        &mut self,
        sc: SlaveConfigHandle,
        index: u16,
        sub_index: u8,
        value: u8,
    ) -> Result<(), Error> {
        self.push_sdo_config(sc, index, sub_index, false, &[value])
    }

    /// Add a startup SDO write of a `u16`.
    pub fn slave_config_sdo16(
        &mut self,
        sc: SlaveConfigHandle,
        index: u16,
        sub_index: u8,
        value: u16,
    ) -> Result<(), Error> {
        self.push_sdo_config(sc, index, sub_index, false, &value.to_le_bytes())
    }

    /// Add a startup SDO write of a `u32`.
    pub fn slave_config_sdo32(
        &mut self,
        sc: SlaveConfigHandle,
        index: u16,
        sub_index: u8,
        value: u32,
    ) -> Result<(), Error> {
        self.push_sdo_config(sc, index, sub_index, false, &value.to_le_bytes())
    }

    /// Add a startup SDO complete-access write of a whole object.
    pub fn slave_config_complete_sdo(
        &mut self,
        sc: SlaveConfigHandle,
        index: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.push_sdo_config(sc, index, 0, true, data)
    }

    /// Add a startup IDN write executed while bringing the slave up.
    pub fn slave_config_idn(
        &mut self,
        sc: SlaveConfigHandle,
        drive_no: u8,
        idn: u16,
        al_state: SlaveState,
        data: &[u8],
    ) -> Result<(), Error> {
        let config = self.config_mut(sc)?;

        let entry = IdnConfig {
            drive_no,
            idn,
            al_state,
            data: heapless::Vec::from_slice(data).map_err(|_| Error::Capacity(Item::Request))?,
        };

        config
            .idn_configs
            .push(entry)
            .map_err(|_| Error::Capacity(Item::Request))
    }

    // ------------------------------------------------------------------
    // Request creation and access
    // ------------------------------------------------------------------

    /// Create an SDO request against a configured slave.
    pub fn slave_config_create_sdo_request(
        &mut self,
        sc: SlaveConfigHandle,
        index: u16,
        sub_index: u8,
    ) -> Result<SdoRequestHandle, Error> {
        self.config_ref(sc)?;

        let request = SdoRequest {
            config: sc.0,
            index,
            sub_index,
            ..SdoRequest::default()
        };

        self.requests
            .sdo
            .push(request)
            .map_err(|_| Error::Capacity(Item::Request))?;

        Ok(SdoRequestHandle(self.requests.sdo.len() - 1))
    }

    /// Create a FoE request against a configured slave.
    pub fn slave_config_create_foe_request(
        &mut self,
        sc: SlaveConfigHandle,
    ) -> Result<FoeRequestHandle, Error> {
        self.config_ref(sc)?;

        let request = FoeRequest {
            config: sc.0,
            ..FoeRequest::default()
        };

        self.requests
            .foe
            .push(request)
            .map_err(|_| Error::Capacity(Item::Request))?;

        Ok(FoeRequestHandle(self.requests.foe.len() - 1))
    }

    /// Create an EoE "set IP parameters" request.
    pub fn slave_config_create_eoe_request(
        &mut self,
        sc: SlaveConfigHandle,
    ) -> Result<EoeRequestHandle, Error> {
        self.config_ref(sc)?;

        let request = EoeRequest {
            config: sc.0,
            ..EoeRequest::default()
        };

        self.requests
            .eoe
            .push(request)
            .map_err(|_| Error::Capacity(Item::Request))?;

        Ok(EoeRequestHandle(self.requests.eoe.len() - 1))
    }

    /// Create an SoE IDN request.
    pub fn slave_config_create_soe_request(
        &mut self,
        sc: SlaveConfigHandle,
        drive_no: u8,
        idn: u16,
    ) -> Result<SoeRequestHandle, Error> {
        self.config_ref(sc)?;

        let request = SoeRequest {
            config: sc.0,
            drive_no,
            idn,
            ..SoeRequest::default()
        };

        self.requests
            .soe
            .push(request)
            .map_err(|_| Error::Capacity(Item::Request))?;

        Ok(SoeRequestHandle(self.requests.soe.len() - 1))
    }

    /// Create a VoE handler.
    pub fn slave_config_create_voe_handler(
        &mut self,
        sc: SlaveConfigHandle,
    ) -> Result<VoeRequestHandle, Error> {
        self.config_ref(sc)?;

        let request = VoeRequest {
            config: sc.0,
            ..VoeRequest::default()
        };

        self.requests
            .voe
            .push(request)
            .map_err(|_| Error::Capacity(Item::Request))?;

        Ok(VoeRequestHandle(self.requests.voe.len() - 1))
    }

    /// Create a raw register request.
    pub fn slave_config_create_reg_request(
        &mut self,
        sc: SlaveConfigHandle,
    ) -> Result<RegRequestHandle, Error> {
        self.config_ref(sc)?;

        let request = RegRequest {
            config: sc.0,
            ..RegRequest::default()
        };

        self.requests
            .reg
            .push(request)
            .map_err(|_| Error::Capacity(Item::Request))?;

        Ok(RegRequestHandle(self.requests.reg.len() - 1))
    }

    /// Create an object dictionary scan request.
    pub fn slave_config_create_dict_request(
        &mut self,
        sc: SlaveConfigHandle,
    ) -> Result<DictRequestHandle, Error> {
        self.config_ref(sc)?;

        let request = DictRequest {
            config: sc.0,
            ..DictRequest::default()
        };

        self.requests
            .dict
            .push(request)
            .map_err(|_| Error::Capacity(Item::Request))?;

        Ok(DictRequestHandle(self.requests.dict.len() - 1))
    }

    /// Access an SDO request.
    pub fn sdo_request(&self, handle: SdoRequestHandle) -> Result<&SdoRequest, Error> {
        self.requests.sdo.get(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Mutably access an SDO request, e.g. to arm a read or write.
    pub fn sdo_request_mut(&mut self, handle: SdoRequestHandle) -> Result<&mut SdoRequest, Error> {
        self.requests.sdo.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Access a FoE request.
    pub fn foe_request(&self, handle: FoeRequestHandle) -> Result<&FoeRequest, Error> {
        self.requests.foe.get(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Mutably access a FoE request.
    pub fn foe_request_mut(&mut self, handle: FoeRequestHandle) -> Result<&mut FoeRequest, Error> {
        self.requests.foe.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Access an EoE request.
    pub fn eoe_request(&self, handle: EoeRequestHandle) -> Result<&EoeRequest, Error> {
        self.requests.eoe.get(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Mutably access an EoE request.
    pub fn eoe_request_mut(&mut self, handle: EoeRequestHandle) -> Result<&mut EoeRequest, Error> {
        self.requests.eoe.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Access an SoE request.
    pub fn soe_request(&self, handle: SoeRequestHandle) -> Result<&SoeRequest, Error> {
        self.requests.soe.get(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Mutably access an SoE request.
    pub fn soe_request_mut(&mut self, handle: SoeRequestHandle) -> Result<&mut SoeRequest, Error> {
        self.requests.soe.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Access a VoE handler.
    pub fn voe_request(&self, handle: VoeRequestHandle) -> Result<&VoeRequest, Error> {
        self.requests.voe.get(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Mutably access a VoE handler.
    pub fn voe_request_mut(&mut self, handle: VoeRequestHandle) -> Result<&mut VoeRequest, Error> {
        self.requests.voe.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Access a register request.
    pub fn reg_request(&self, handle: RegRequestHandle) -> Result<&RegRequest, Error> {
        self.requests.reg.get(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Mutably access a register request.
    pub fn reg_request_mut(&mut self, handle: RegRequestHandle) -> Result<&mut RegRequest, Error> {
        self.requests.reg.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Access a dictionary request.
    pub fn dict_request(&self, handle: DictRequestHandle) -> Result<&DictRequest, Error> {
        self.requests.dict.get(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    /// Mutably access a dictionary request.
    pub fn dict_request_mut(
        &mut self,
        handle: DictRequestHandle,
    ) -> Result<&mut DictRequest, Error> {
        self.requests.dict.get_mut(handle.0).ok_or(Error::NotFound {
            item: Item::Request,
            index: Some(handle.0),
        })
    }

    // ------------------------------------------------------------------
    // Activation
    // ------------------------------------------------------------------

    /// Finish configuration and enter the cyclic phase.
    ///
    /// Lays out all domains in the logical address space, matches
    /// configurations against the scanned bus and lets the state machine
    /// start bringing slaves to their requested states.
    pub fn activate(&mut self) -> Result<(), Error> {
        if self.phase == MasterPhase::Operation {
            return Err(Error::Busy);
        }

        let mut base = 0u32;

        for domain in self.domains.iter_mut() {
            domain.finish(base)?;

            base = base
                .checked_add(domain.len() as u32)
                .ok_or(Error::Capacity(Item::Domain))?;
        }

        self.match_configs();

        // Reference clock: explicit selection, or the first DC capable slave
        self.dc.reference = self
            .dc
            .reference_config
            .and_then(|config| self.configs.get(config))
            .and_then(|config| config.slave_index)
            .or_else(|| {
                self.slaves
                    .iter()
                    .position(|slave| slave.features.dc_supported)
            });

        self.dc.filter = DcFilter::new(
            u64::from(self.options.cycle_time_ns),
            self.options.drift_window,
        );

        // Tear down any scan exchange still in flight so its descriptors
        // return to the pool
        if let FsmState::Scanning { slave } = self.fsm_state {
            if let Some(device) = self.slaves.get_mut(slave) {
                self.scan_fsm.abort(&mut self.pdu, device);
            }
        }

        self.fsm_reg.abort(&mut self.pdu);

        self.phase = MasterPhase::Operation;
        self.fsm_state = FsmState::NextConfig;

        fmt::info!(
            "Master activated: {} slaves, {} configs, {} domains",
            self.slaves.len(),
            self.configs.len(),
            self.domains.len()
        );

        Ok(())
    }

    /// Leave the cyclic phase: fail all pending requests and stop
    /// configuring slaves. The bus keeps being scanned and monitored.
    pub fn deactivate(&mut self) {
        self.requests.fail_all_pending();

        for config in self.configs.iter_mut() {
            config.applied = false;
            config.slave_index = None;
        }

        for slave in self.slaves.iter_mut() {
            slave.config_index = None;
        }

        self.phase = MasterPhase::Idle;
        self.fsm_state = FsmState::Probe;
    }

    /// Match configurations against scanned slaves by `(alias, position)`,
    /// verifying `(vendor, product)`.
    fn match_configs(&mut self) {
        for slave in self.slaves.iter_mut() {
            slave.config_index = None;
        }

        for (index, config) in self.configs.iter_mut().enumerate() {
            let position = if config.alias != 0 {
                self.slaves
                    .iter()
                    .position(|slave| slave.sii.identity.alias == config.alias)
                    .map(|anchor| anchor + usize::from(config.position))
            } else {
                Some(usize::from(config.position))
            };

            let Some(position) = position else {
                fmt::warn!("No slave with alias {:#06x} on the bus", config.alias);

                continue;
            };

            let Some(slave) = self.slaves.get_mut(position) else {
                fmt::warn!("No slave at position {}", position);

                continue;
            };

            if config.vendor_id != 0 && slave.sii.identity.vendor_id != config.vendor_id
                || config.product_code != 0
                    && slave.sii.identity.product_code != config.product_code
            {
                fmt::error!(
                    "Slave at position {} is {:#010x}:{:#010x}, expected {:#010x}:{:#010x}",
                    position,
                    slave.sii.identity.vendor_id,
                    slave.sii.identity.product_code,
                    config.vendor_id,
                    config.product_code
                );

                continue;
            }

            config.slave_index = Some(position);
            config.applied = false;
            config.config_error = false;
            slave.config_index = Some(index);
        }
    }

    // ------------------------------------------------------------------
    // Cyclic API
    // ------------------------------------------------------------------

    /// Drain received frames from the device and demultiplex replies onto
    /// their in-flight datagrams.
    pub fn receive(&mut self) -> Result<(), Error> {
        let mut buf = [0u8; 1518];

        loop {
            match self.device.receive(&mut buf) {
                Ok(Some(len)) => {
                    self.stats.rx_count += 1;

                    if self.pdu.receive_frame(&buf[..len]).is_err() {
                        self.stats.rx_errors += 1;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    self.stats.rx_errors += 1;

                    return Err(e);
                }
            }
        }

        self.link = self.device.link_state();

        Ok(())
    }

    /// Send the application's queued (domain) datagrams.
    pub fn send(&mut self) -> Result<(), Error> {
        let now = self.clock.now();

        let frames = self.pdu.send_queued(&mut self.device, false, now)?;

        self.stats.tx_count += frames as u32;

        Ok(())
    }

    /// Send all queued datagrams, including those originated by the master's
    /// own state machines.
    pub fn send_ext(&mut self) -> Result<(), Error> {
        let now = self.clock.now();

        let frames = self.pdu.send_queued(&mut self.device, true, now)?;

        self.stats.tx_count += frames as u32;

        Ok(())
    }

    /// Queue one cycle's process data datagrams for `domain`.
    pub fn domain_queue(&mut self, domain: DomainHandle) -> Result<(), Error> {
        let domain = self.domains.get_mut(domain.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(domain.0),
        })?;

        domain.queue(&mut self.pdu)
    }

    /// Collect the replies of the previous cycle for `domain`, updating its
    /// image and working counter state.
    pub fn domain_process(&mut self, domain: DomainHandle) -> Result<(), Error> {
        let now = self.clock.now();

        let cycle = self.options.timeouts.cycle.max(u64::from(self.options.cycle_time_ns));

        let domain = self.domains.get_mut(domain.0).ok_or(Error::NotFound {
            item: Item::Domain,
            index: Some(domain.0),
        })?;

        domain.process(&mut self.pdu, now, cycle);

        Ok(())
    }

    /// The process data image of `domain`.
    pub fn domain_data(&mut self, domain: DomainHandle) -> Result<&mut [u8], Error> {
        self.domains
            .get_mut(domain.0)
            .map(|domain| domain.data_mut())
            .ok_or(Error::NotFound {
                item: Item::Domain,
                index: Some(domain.0),
            })
    }

    /// Working counter state of `domain`.
    pub fn domain_state(&self, domain: DomainHandle) -> Result<DomainState, Error> {
        self.domains
            .get(domain.0)
            .map(Domain::state)
            .ok_or(Error::NotFound {
                item: Item::Domain,
                index: Some(domain.0),
            })
    }

    /// State of one configured slave.
    pub fn slave_config_state(&self, sc: SlaveConfigHandle) -> Result<SlaveConfigState, Error> {
        let config = self.config_ref(sc)?;

        let Some(slave) = config.slave_index.and_then(|index| self.slaves.get(index)) else {
            return Ok(SlaveConfigState::default());
        };

        Ok(SlaveConfigState {
            online: slave.online,
            operational: config.applied && slave.al_state == SlaveState::Op,
            al_state: slave.al_state,
        })
    }

    // ------------------------------------------------------------------
    // Distributed clocks
    // ------------------------------------------------------------------

    /// Set the application time used as the DC time base for this cycle.
    pub fn application_time(&mut self, time: u64) {
        self.dc.prev_app_time = self.dc.app_time;
        self.dc.app_time = time;
    }

    /// Correction accumulated by the drift filter, to be added to the
    /// application's time base.
    pub fn dc_time_base_adjustment(&self) -> i64 {
        self.dc.filter.time_base
    }

    /// The most recent centred master/reference clock difference in ns.
    pub fn dc_diff_ns(&self) -> i64 {
        self.dc.filter.last_diff
    }

    /// Select the slave of `sc` as the DC reference clock.
    pub fn select_reference_clock(&mut self, sc: SlaveConfigHandle) -> Result<(), Error> {
        self.config_ref(sc)?;

        self.dc.reference_config = Some(sc.0);

        Ok(())
    }

    /// Queue a write of the application time to the reference slave's system
    /// time register. Call once per cycle in DC operation.
    pub fn sync_reference_clock(&mut self) -> Result<(), Error> {
        let now = self.clock.now();

        let Some(reference) = self.dc.reference else {
            return Err(Error::Dc(DcError::NoReference));
        };

        let slave = self.slaves.get(reference).ok_or(Error::Internal)?;

        if let Some(handle) = self.dc.sync_ref_handle.take() {
            // Fire and forget: the previous cycle's write needs no reply
            // processing beyond releasing the descriptor
            let _ = self.pdu.poll(handle, now, self.options.timeouts.pdu);
            self.pdu.release(handle);
        }

        let command = Command::fpwr(
            slave.configured_address,
            RegisterAddress::DcSystemTime.into(),
        );

        let handle = if slave.features.has_64bit_dc {
            self.pdu
                .request(command, &self.dc.app_time.to_le_bytes(), PduQueue::Main)?
        } else {
            self.pdu.request(
                command,
                &(self.dc.app_time as u32).to_le_bytes(),
                PduQueue::Main,
            )?
        };

        self.dc.sync_ref_handle = Some(handle);

        Ok(())
    }

    /// Queue the broadcast distribution of the reference clock to all other
    /// slaves, and harvest the previous cycle's reference time into the
    /// drift filter. Call once per cycle in DC operation.
    pub fn sync_slave_clocks(&mut self) -> Result<(), Error> {
        let now = self.clock.now();

        let Some(reference) = self.dc.reference else {
            return Err(Error::Dc(DcError::NoReference));
        };

        let address = self
            .slaves
            .get(reference)
            .ok_or(Error::Internal)?
            .configured_address;

        if let Some(handle) = self.dc.sync_slaves_handle.take() {
            if let Ok(PduPoll::Ready { working_counter }) =
                self.pdu.poll(handle, now, self.options.timeouts.pdu)
            {
                if working_counter > 0 {
                    if let Ok(data) = self.pdu.data(handle) {
                        if data.len() >= 4 {
                            let ref_time =
                                u32::from_le_bytes([data[0], data[1], data[2], data[3]]);

                            self.dc.last_ref_time = ref_time;
                            self.dc
                                .filter
                                .update(self.dc.prev_app_time, u64::from(ref_time));
                        }
                    }
                }
            }

            self.pdu.release(handle);
        }

        let handle = self.pdu.request_read(
            Command::frmw(address, RegisterAddress::DcSystemTime.into()),
            4,
            PduQueue::Main,
        )?;

        self.dc.sync_slaves_handle = Some(handle);

        Ok(())
    }

    /// The reference clock time captured by the last
    /// [`sync_slave_clocks`](Self::sync_slave_clocks) round.
    pub fn reference_clock_time(&self) -> Result<u32, Error> {
        if self.dc.reference.is_none() {
            return Err(Error::Dc(DcError::NoReference));
        }

        Ok(self.dc.last_ref_time)
    }

    // ------------------------------------------------------------------
    // The master state machine
    // ------------------------------------------------------------------

    /// Advance the master's internal state machines by at most one step.
    ///
    /// Call between [`receive`](Self::receive) and
    /// [`send_ext`](Self::send_ext); it never blocks. More than one call per
    /// cycle is fine and speeds up bring-up.
    pub fn fsm_step(&mut self) {
        let now = self.clock.now();

        match self.fsm_state {
            FsmState::Probe => {
                if self
                    .fsm_reg
                    .read(
                        &mut self.pdu,
                        Command::brd(RegisterAddress::AlStatus.into()),
                        2,
                    )
                    .is_ok()
                {
                    self.fsm_state = FsmState::AwaitProbe;
                }
            }

            FsmState::AwaitProbe => {
                match self.fsm_reg.poll(&mut self.pdu, now, self.options.timeouts.pdu) {
                    RegPoll::Pending => {}
                    RegPoll::Failed(_) => {
                        self.slaves_responding = 0;
                        self.fsm_state = self.after_probe(0);
                    }
                    RegPoll::Done { working_counter } => {
                        self.al_states = self
                            .fsm_reg
                            .data()
                            .first()
                            .map(|raw| raw & 0x1f)
                            .unwrap_or(0);

                        if working_counter != self.slaves_responding {
                            fmt::info!("{} slaves responding", working_counter);
                        }

                        self.slaves_responding = working_counter;
                        self.fsm_state = self.after_probe(working_counter);
                    }
                }
            }

            FsmState::StartScan { slave } => {
                if slave >= self.slaves.len() {
                    // All slaves scanned; measure DC delays next
                    self.fsm_state = FsmState::DcLatch;

                    return;
                }

                self.scan_fsm.start();
                self.fsm_state = FsmState::Scanning { slave };
            }

            FsmState::Scanning { slave } => {
                let Some(device) = self.slaves.get_mut(slave) else {
                    self.fsm_state = FsmState::Probe;

                    return;
                };

                let override_image = self
                    .sii_overrides
                    .iter()
                    .find(|(position, _)| *position == device.ring_position)
                    .map(|(_, image)| image);

                match self.scan_fsm.step(
                    &mut self.pdu,
                    device,
                    &mut self.cache,
                    override_image,
                    &self.options,
                    now,
                ) {
                    ScanPoll::Pending => {}
                    ScanPoll::Done | ScanPoll::Failed(_) => {
                        self.fsm_state = FsmState::StartScan { slave: slave + 1 };
                    }
                }
            }

            FsmState::DcLatch => {
                if !self.slaves.iter().any(|slave| slave.features.dc_supported) {
                    self.bus_scanned = true;
                    self.fsm_state = FsmState::Probe;

                    return;
                }

                // Writing any value to 0x0900 latches the receive time of
                // the measurement frame at every port of every slave
                if self
                    .fsm_reg
                    .write(
                        &mut self.pdu,
                        Command::bwr(RegisterAddress::DcTimePort0.into()),
                        &[0u8; 4],
                    )
                    .is_ok()
                {
                    self.fsm_state = FsmState::AwaitDcLatch;
                }
            }

            FsmState::AwaitDcLatch => {
                match self.fsm_reg.poll(&mut self.pdu, now, self.options.timeouts.pdu) {
                    RegPoll::Pending => {}
                    RegPoll::Failed(_) => {
                        self.bus_scanned = true;
                        self.fsm_state = FsmState::Probe;
                    }
                    RegPoll::Done { .. } => {
                        self.fsm_state = FsmState::DcTimes { slave: 0 };
                    }
                }
            }

            FsmState::DcTimes { slave } => {
                let Some(device) = self.next_dc_slave(slave) else {
                    calc_propagation_delays(&mut self.slaves);

                    self.fsm_state = FsmState::DcSystime { slave: 0 };

                    return;
                };

                let address = self.slaves[device].configured_address;

                if self
                    .fsm_reg
                    .read(
                        &mut self.pdu,
                        Command::fprd(address, RegisterAddress::DcTimePort0.into()),
                        16,
                    )
                    .is_ok()
                {
                    self.fsm_state = FsmState::AwaitDcTimes { slave: device };
                }
            }

            FsmState::AwaitDcTimes { slave } => {
                match self.fsm_reg.poll(&mut self.pdu, now, self.options.timeouts.pdu) {
                    RegPoll::Pending => {}
                    RegPoll::Failed(_) => {
                        self.fsm_state = FsmState::DcTimes { slave: slave + 1 };
                    }
                    RegPoll::Done { .. } => {
                        let data = self.fsm_reg.data();

                        if let Some(device) = self.slaves.get_mut(slave) {
                            for port in 0..4 {
                                device.port_receive_times[port] = data
                                    .get(port * 4..port * 4 + 4)
                                    .and_then(|raw| raw.try_into().ok())
                                    .map(u32::from_le_bytes)
                                    .unwrap_or(0);
                            }
                        }

                        self.fsm_state = FsmState::DcTimes { slave: slave + 1 };
                    }
                }
            }

            FsmState::DcSystime { slave } => {
                let Some(device) = self.next_dc_slave(slave) else {
                    self.bus_scanned = true;
                    self.fsm_state = FsmState::Probe;

                    return;
                };

                let address = self.slaves[device].configured_address;

                if self
                    .fsm_reg
                    .read(
                        &mut self.pdu,
                        Command::fprd(address, RegisterAddress::DcSystemTime.into()),
                        8,
                    )
                    .is_ok()
                {
                    self.fsm_state = FsmState::AwaitDcSystime { slave: device };
                }
            }

            FsmState::AwaitDcSystime { slave } => {
                match self.fsm_reg.poll(&mut self.pdu, now, self.options.timeouts.pdu) {
                    RegPoll::Pending => {}
                    RegPoll::Failed(_) => {
                        self.fsm_state = FsmState::DcSystime { slave: slave + 1 };
                    }
                    RegPoll::Done { .. } => {
                        let data = self.fsm_reg.data();

                        let slave_time = data
                            .get(..8)
                            .and_then(|raw| raw.try_into().ok())
                            .map(u64::from_le_bytes)
                            .unwrap_or(0);

                        // System time offset makes the slave's clock read
                        // master application time
                        let offset = self.dc.app_time.wrapping_sub(slave_time);

                        let address = self.slaves[slave].configured_address;

                        if self
                            .fsm_reg
                            .write(
                                &mut self.pdu,
                                Command::fpwr(
                                    address,
                                    RegisterAddress::DcSystemTimeOffset.into(),
                                ),
                                &offset.to_le_bytes(),
                            )
                            .is_ok()
                        {
                            self.fsm_state = FsmState::AwaitDcOffset { slave };
                        } else {
                            self.fsm_state = FsmState::DcSystime { slave: slave + 1 };
                        }
                    }
                }
            }

            FsmState::AwaitDcOffset { slave } => {
                match self.fsm_reg.poll(&mut self.pdu, now, self.options.timeouts.pdu) {
                    RegPoll::Pending => {}
                    RegPoll::Failed(_) => {
                        self.fsm_state = FsmState::DcSystime { slave: slave + 1 };
                    }
                    RegPoll::Done { .. } => {
                        let address = self.slaves[slave].configured_address;
                        let delay = self.slaves[slave].propagation_delay;

                        if self
                            .fsm_reg
                            .write(
                                &mut self.pdu,
                                Command::fpwr(
                                    address,
                                    RegisterAddress::DcSystemTimeTransmissionDelay.into(),
                                ),
                                &delay.to_le_bytes(),
                            )
                            .is_ok()
                        {
                            self.fsm_state = FsmState::AwaitDcDelay { slave };
                        } else {
                            self.fsm_state = FsmState::DcSystime { slave: slave + 1 };
                        }
                    }
                }
            }

            FsmState::AwaitDcDelay { slave } => {
                match self.fsm_reg.poll(&mut self.pdu, now, self.options.timeouts.pdu) {
                    RegPoll::Pending => {}
                    RegPoll::Failed(_) | RegPoll::Done { .. } => {
                        self.fsm_state = FsmState::DcSystime { slave: slave + 1 };
                    }
                }
            }

            FsmState::NextConfig => {
                let next = self.configs.iter().position(|config| {
                    config.slave_index.is_some() && !config.applied && !config.config_error
                });

                match next {
                    Some(config) => {
                        self.config_fsm.start(self.dc.app_time);
                        self.fsm_state = FsmState::Configuring { config };
                    }
                    None => {
                        self.fsm_state = FsmState::Request;
                    }
                }
            }

            FsmState::Configuring { config } => {
                let Some(slave_index) =
                    self.configs.get(config).and_then(|config| config.slave_index)
                else {
                    self.fsm_state = FsmState::NextConfig;

                    return;
                };

                let (slave, config_ref) = match (
                    self.slaves.get_mut(slave_index),
                    self.configs.get_mut(config),
                ) {
                    (Some(slave), Some(config_ref)) => (slave, config_ref),
                    _ => {
                        self.fsm_state = FsmState::NextConfig;

                        return;
                    }
                };

                match self.config_fsm.step(
                    &mut self.pdu,
                    slave,
                    config_ref,
                    config,
                    &mut self.domains,
                    &self.options,
                    now,
                ) {
                    ConfigPoll::Pending => {}
                    ConfigPoll::Done | ConfigPoll::Failed(_) => {
                        self.fsm_state = FsmState::NextConfig;
                    }
                }
            }

            FsmState::Request => {
                let busy = self.runner.step(
                    &mut self.pdu,
                    &mut self.slaves,
                    &self.configs,
                    &mut self.requests,
                    &self.options,
                    now,
                );

                if !busy {
                    self.fsm_state = FsmState::Monitor { slave: 0 };
                }
            }

            FsmState::Monitor { slave } => {
                let Some(device) = self.slaves.get(slave) else {
                    self.fsm_state = FsmState::Probe;

                    return;
                };

                let address = device.configured_address;

                if self
                    .fsm_reg
                    .read(
                        &mut self.pdu,
                        Command::fprd(address, RegisterAddress::AlStatus.into()),
                        2,
                    )
                    .is_ok()
                {
                    self.fsm_state = FsmState::AwaitMonitor { slave };
                }
            }

            FsmState::AwaitMonitor { slave } => {
                match self.fsm_reg.poll(&mut self.pdu, now, self.options.timeouts.pdu) {
                    RegPoll::Pending => {}
                    RegPoll::Failed(_) => {
                        self.mark_offline(slave);

                        self.fsm_state = FsmState::Monitor { slave: slave + 1 };
                    }
                    RegPoll::Done { working_counter } => {
                        if working_counter == 1 {
                            let raw = self.fsm_reg.data();

                            if let (Some(device), Ok(status)) = (
                                self.slaves.get_mut(slave),
                                AlStatus::unpack_from_slice(raw),
                            ) {
                                let was_online = device.online;

                                device.online = true;
                                device.al_state = status.state;

                                if !was_online {
                                    // Came back: clear errors and let the
                                    // configuration re-apply
                                    device.error_flag = false;

                                    if let Some(config) = device
                                        .config_index
                                        .and_then(|index| self.configs.get_mut(index))
                                    {
                                        config.applied = false;
                                        config.config_error = false;
                                    }
                                }
                            }
                        } else {
                            self.mark_offline(slave);
                        }

                        self.fsm_state = FsmState::Monitor { slave: slave + 1 };
                    }
                }
            }
        }
    }

    /// Decide what follows a completed broadcast probe.
    fn after_probe(&mut self, responding: u16) -> FsmState {
        match self.phase {
            MasterPhase::Idle => {
                if usize::from(responding) != self.slaves.len() || !self.bus_scanned {
                    // Topology changed: rebuild the slave list and rescan
                    fmt::info!("Rescanning bus: {} slaves", responding);

                    self.bus_scanned = false;
                    self.slaves.clear();

                    for position in 0..responding.min(MAX_SLAVES as u16) {
                        let _ = self.slaves.push(Slave::new(position));
                    }

                    if self.slaves.is_empty() {
                        self.bus_scanned = true;

                        FsmState::Probe
                    } else {
                        FsmState::StartScan { slave: 0 }
                    }
                } else {
                    FsmState::Monitor { slave: 0 }
                }
            }
            MasterPhase::Operation => {
                // No rescan while cyclic data runs; monitoring flags the
                // missing slaves individually
                FsmState::NextConfig
            }
        }
    }

    fn mark_offline(&mut self, slave: usize) {
        if let Some(device) = self.slaves.get_mut(slave) {
            if device.online {
                fmt::warn!("Slave {} is offline", device.ring_position);
            }

            device.online = false;
        }
    }

    /// Next DC capable slave at or after `from`.
    fn next_dc_slave(&self, from: usize) -> Option<usize> {
        self.slaves
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, slave)| slave.features.dc_supported)
            .map(|(index, _)| index)
    }
}

impl<D, C> Drop for Master<D, C> {
    fn drop(&mut self) {
        self.requests.fail_all_pending();
    }
}

impl RequestRunner {
    /// Process the active request, or pick the next queued one. Returns
    /// whether a request is (still) active.
    fn step(
        &mut self,
        pdu: &mut PduLoop,
        slaves: &mut heapless::Vec<Slave, MAX_SLAVES>,
        configs: &heapless::Vec<SlaveConfig, MAX_SLAVES>,
        requests: &mut Requests,
        options: &MasterOptions,
        now: u64,
    ) -> bool {
        let timeouts = &options.timeouts;

        // Resolve a request's slave, failing the request if it has none
        macro_rules! slave_for {
            ($req:expr, $protocol:expr) => {{
                let slave = configs
                    .get($req.config)
                    .and_then(|config| config.slave_index)
                    .and_then(|index| slaves.get_mut(index));

                match slave {
                    Some(slave) if !slave.online => {
                        $req.finish(Err(Error::Timeout));
                        self.active = ActiveRequest::None;

                        return true;
                    }
                    Some(slave) => {
                        if let Some(protocol) = $protocol {
                            if !slave.sii.mailbox_protocols.contains(protocol) {
                                $req.finish(Err(Error::ProtocolNotSupported));
                                self.active = ActiveRequest::None;

                                return true;
                            }
                        }

                        slave
                    }
                    None => {
                        $req.finish(Err(Error::NotFound {
                            item: Item::Slave,
                            index: None,
                        }));
                        self.active = ActiveRequest::None;

                        return true;
                    }
                }
            }};
        }

        match self.active {
            ActiveRequest::None => self.pick(pdu, slaves, configs, requests),

            ActiveRequest::Sdo(index) => {
                let request = &mut requests.sdo[index];
                let slave = slave_for!(request, Some(MailboxProtocols::COE));

                match self.coe.step(pdu, &mut slave.mailbox, now, timeouts) {
                    CoePoll::Pending => true,
                    CoePoll::Done => {
                        if request.direction == RequestDirection::Read {
                            request.data.clear();
                            let _ = request.data.extend_from_slice(self.coe.data());
                        }

                        request.finish(Ok(()));
                        self.active = ActiveRequest::None;

                        true
                    }
                    CoePoll::Failed(error) => {
                        request.abort_code = self.coe.abort_code();
                        request.finish(Err(error));
                        self.active = ActiveRequest::None;

                        true
                    }
                }
            }

            ActiveRequest::Foe(index) => {
                let request = &mut requests.foe[index];
                let slave = slave_for!(request, Some(MailboxProtocols::FOE));

                if request.state == RequestState::Ready {
                    if request.resume_requested {
                        request.resume_requested = false;
                        self.foe.resume();
                    } else {
                        return true;
                    }
                }

                match self.foe.step(pdu, &mut slave.mailbox, now, timeouts) {
                    FoePoll::Pending => true,
                    FoePoll::Suspended => {
                        request.data.clear();
                        let _ = request.data.extend_from_slice(self.foe.data());
                        request.state = RequestState::Ready;

                        true
                    }
                    FoePoll::Done => {
                        if request.direction == RequestDirection::Read {
                            request.data.clear();
                            let _ = request.data.extend_from_slice(self.foe.data());
                        }

                        request.finish(Ok(()));
                        self.active = ActiveRequest::None;

                        true
                    }
                    FoePoll::Failed(error) => {
                        request.finish(Err(error));
                        self.active = ActiveRequest::None;

                        true
                    }
                }
            }

            ActiveRequest::Eoe(index) => {
                let request = &mut requests.eoe[index];
                let slave = slave_for!(request, Some(MailboxProtocols::EOE));

                match self.eoe.step(pdu, &mut slave.mailbox, now, timeouts) {
                    EoePoll::Pending => true,
                    EoePoll::Done => {
                        request.result = 0;
                        request.state = RequestState::Success;
                        self.active = ActiveRequest::None;

                        true
                    }
                    EoePoll::Failed(error) => {
                        request.result = self.eoe.result();
                        request.state = RequestState::Failure;
                        request.error = Some(error);
                        self.active = ActiveRequest::None;

                        true
                    }
                }
            }

            ActiveRequest::Soe(index) => {
                let request = &mut requests.soe[index];
                let slave = slave_for!(request, Some(MailboxProtocols::SOE));

                match self.soe.step(pdu, &mut slave.mailbox, now, timeouts) {
                    SoePoll::Pending => true,
                    SoePoll::Done => {
                        if request.direction == RequestDirection::Read {
                            request.data.clear();
                            let _ = request.data.extend_from_slice(self.soe.data());
                        }

                        request.finish(Ok(()));
                        self.active = ActiveRequest::None;

                        true
                    }
                    SoePoll::Failed(error) => {
                        request.error_code = self.soe.error_code();
                        request.finish(Err(error));
                        self.active = ActiveRequest::None;

                        true
                    }
                }
            }

            ActiveRequest::Voe(index) => {
                let request = &mut requests.voe[index];
                let slave = slave_for!(request, Some(MailboxProtocols::VOE));

                match self.voe.step(pdu, &mut slave.mailbox, now, timeouts) {
                    VoePoll::Pending => true,
                    VoePoll::Done => {
                        if request.direction == RequestDirection::Read {
                            let (vendor_id, vendor_type) = self.voe.vendor_header();

                            request.vendor_id = vendor_id;
                            request.vendor_type = vendor_type;
                            request.data.clear();
                            let _ = request.data.extend_from_slice(self.voe.data());
                        }

                        request.finish(Ok(()));
                        self.active = ActiveRequest::None;

                        true
                    }
                    VoePoll::Failed(error) => {
                        request.finish(Err(error));
                        self.active = ActiveRequest::None;

                        true
                    }
                }
            }

            ActiveRequest::Reg(index) => {
                let request = &mut requests.reg[index];

                // Register requests bypass the mailbox entirely
                let _ = slave_for!(request, Option::<MailboxProtocols>::None);

                match self.reg.poll(pdu, now, timeouts.pdu) {
                    RegPoll::Pending => true,
                    RegPoll::Done { working_counter } => {
                        if working_counter != 1 {
                            request.finish(Err(Error::WorkingCounter {
                                expected: 1,
                                received: working_counter,
                            }));
                        } else {
                            if request.direction == RequestDirection::Read {
                                request.data.clear();
                                let _ = request.data.extend_from_slice(self.reg.data());
                            }

                            request.finish(Ok(()));
                        }

                        self.active = ActiveRequest::None;

                        true
                    }
                    RegPoll::Failed(error) => {
                        request.finish(Err(error));
                        self.active = ActiveRequest::None;

                        true
                    }
                }
            }

            ActiveRequest::Dict(index) => {
                let request = &mut requests.dict[index];
                let slave = slave_for!(request, Some(MailboxProtocols::COE));

                match self.coe.step(pdu, &mut slave.mailbox, now, timeouts) {
                    CoePoll::Pending => true,
                    CoePoll::Done => {
                        request.summary = self.coe.dictionary().clone();
                        request.state = RequestState::Success;
                        self.active = ActiveRequest::None;

                        true
                    }
                    CoePoll::Failed(error) => {
                        request.state = RequestState::Failure;
                        request.error = Some(error);
                        self.active = ActiveRequest::None;

                        true
                    }
                }
            }
        }
    }

    /// Find the next queued request with a usable slave and start its
    /// protocol state machine. Returns whether anything was started.
    fn pick(
        &mut self,
        pdu: &mut PduLoop,
        slaves: &mut heapless::Vec<Slave, MAX_SLAVES>,
        configs: &heapless::Vec<SlaveConfig, MAX_SLAVES>,
        requests: &mut Requests,
    ) -> bool {
        let attached = |config: usize| {
            configs
                .get(config)
                .and_then(|config| config.slave_index)
                .and_then(|index| slaves.get(index))
                .map(|slave| slave.online)
                .unwrap_or(false)
        };

        if let Some(index) = requests
            .sdo
            .iter()
            .position(|r| r.state == RequestState::Queued && attached(r.config))
        {
            let request = &mut requests.sdo[index];

            request.state = RequestState::Busy;

            self.coe = CoeFsm::default();

            let started = match request.direction {
                RequestDirection::Read => {
                    self.coe
                        .start_upload(request.index, request.sub_index, request.complete_access);

                    Ok(())
                }
                RequestDirection::Write => self.coe.start_download(
                    request.index,
                    request.sub_index,
                    request.complete_access,
                    &request.data,
                ),
            };

            if let Err(error) = started {
                request.finish(Err(error));

                return true;
            }

            self.active = ActiveRequest::Sdo(index);

            return true;
        }

        if let Some(index) = requests
            .foe
            .iter()
            .position(|r| r.state == RequestState::Queued && attached(r.config))
        {
            let request = &mut requests.foe[index];

            request.state = RequestState::Busy;

            self.foe = FoeFsm::default();

            let started = match request.direction {
                RequestDirection::Read => self.foe.start_read(&request.filename),
                RequestDirection::Write => {
                    self.foe.start_write(&request.filename, &request.data)
                }
            };

            if let Err(error) = started {
                request.finish(Err(error));

                return true;
            }

            self.active = ActiveRequest::Foe(index);

            return true;
        }

        if let Some(index) = requests
            .eoe
            .iter()
            .position(|r| r.state == RequestState::Queued && attached(r.config))
        {
            let request = &mut requests.eoe[index];

            request.state = RequestState::Busy;

            self.eoe = EoeFsm::default();
            self.eoe.start_set_ip(request.params.clone());

            self.active = ActiveRequest::Eoe(index);

            return true;
        }

        if let Some(index) = requests
            .soe
            .iter()
            .position(|r| r.state == RequestState::Queued && attached(r.config))
        {
            let request = &mut requests.soe[index];

            request.state = RequestState::Busy;

            self.soe = SoeFsm::default();

            let started = match request.direction {
                RequestDirection::Read => {
                    self.soe.start_read(request.drive_no, request.idn);

                    Ok(())
                }
                RequestDirection::Write => {
                    self.soe
                        .start_write(request.drive_no, request.idn, &request.data)
                }
            };

            if let Err(error) = started {
                request.finish(Err(error));

                return true;
            }

            self.active = ActiveRequest::Soe(index);

            return true;
        }

        if let Some(index) = requests
            .voe
            .iter()
            .position(|r| r.state == RequestState::Queued && attached(r.config))
        {
            let request = &mut requests.voe[index];

            request.state = RequestState::Busy;

            self.voe = VoeFsm::default();

            let started = match request.direction {
                RequestDirection::Read => {
                    self.voe.start_read();

                    Ok(())
                }
                RequestDirection::Write => self.voe.start_write(
                    request.vendor_id,
                    request.vendor_type,
                    &request.data,
                ),
            };

            if let Err(error) = started {
                request.finish(Err(error));

                return true;
            }

            self.active = ActiveRequest::Voe(index);

            return true;
        }

        if let Some(index) = requests
            .reg
            .iter()
            .position(|r| r.state == RequestState::Queued && attached(r.config))
        {
            let request = &mut requests.reg[index];

            let address = configs
                .get(request.config)
                .and_then(|config| config.slave_index)
                .and_then(|slave| slaves.get(slave))
                .map(|slave| slave.configured_address);

            let Some(address) = address else {
                request.finish(Err(Error::NotFound {
                    item: Item::Slave,
                    index: None,
                }));

                return true;
            };

            request.state = RequestState::Busy;

            self.reg = RegisterExchange::default();

            let started = match request.direction {
                RequestDirection::Read => self.reg.read(
                    pdu,
                    Command::fprd(address, request.register),
                    request.data.len(),
                ),
                RequestDirection::Write => {
                    self.reg
                        .write(pdu, Command::fpwr(address, request.register), &request.data)
                }
            };

            if let Err(error) = started {
                request.finish(Err(error));

                return true;
            }

            self.active = ActiveRequest::Reg(index);

            return true;
        }

        if let Some(index) = requests
            .dict
            .iter()
            .position(|r| r.state == RequestState::Queued && attached(r.config))
        {
            let request = &mut requests.dict[index];

            request.state = RequestState::Busy;

            self.coe = CoeFsm::default();
            self.coe.start_dictionary();

            self.active = ActiveRequest::Dict(index);

            return true;
        }

        false
    }
}
