//! The discovered slave model and the shared AL state transition helper.

pub mod config;
pub(crate) mod configurator;
pub(crate) mod scan;

use crate::al_control::{AlControl, AlStatus};
use crate::al_status_code::AlStatusCode;
use crate::command::Command;
use crate::dl_status::DlStatus;
use crate::eeprom::types::{SiiImage, SiiInfo, SiiPdo};
use crate::error::Error;
use crate::fmt;
use crate::mailbox::MailboxRuntime;
use crate::master::Timeouts;
use crate::pdu_loop::{PduHandle, PduLoop, PduPoll, PduQueue};
use crate::register::{PortDescriptors, RegisterAddress, SupportFlags};
use crate::slave_state::SlaveState;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

/// One device discovered on the ring.
///
/// Created during bus scan, destroyed when the master is dropped or the bus
/// is rescanned. All fields are populated by the scan state machine.
#[derive(Debug, Default)]
pub struct Slave {
    /// Zero-based position on the ring.
    pub ring_position: u16,
    /// Station address assigned by the master.
    pub configured_address: u16,

    // Base information from registers 0x0000..0x000a
    pub base_type: u8,
    pub base_revision: u8,
    pub base_build: u16,
    /// Number of FMMU entities, capped at [`crate::MAX_FMMUS`].
    pub fmmu_count: u8,
    /// Number of sync manager channels, capped at
    /// [`crate::MAX_SYNC_MANAGERS`].
    pub sm_count: u8,
    pub ports: PortDescriptors,
    pub features: SupportFlags,

    pub dl_status: DlStatus,

    /// Current AL state, updated by scan, configuration and monitoring.
    pub al_state: SlaveState,
    /// Last AL status code reported by the device.
    pub al_status_code: Option<AlStatusCode>,
    /// Scan or configuration failed; the slave is skipped until it responds
    /// again.
    pub error_flag: bool,
    /// The slave answered its last monitored read.
    pub online: bool,

    /// Raw SII image.
    pub sii_image: SiiImage,
    /// Parsed SII contents.
    pub sii: SiiInfo,
    /// PDO assignment/mapping read back over CoE during scan; preferred over
    /// the SII defaults when present.
    pub coe_pdos: heapless::Vec<SiiPdo, 32>,

    pub(crate) mailbox: MailboxRuntime,

    /// DC receive time of each port, latched during delay measurement.
    pub port_receive_times: [u32; 4],
    /// Propagation delay from the master, in ns.
    pub propagation_delay: u32,

    /// Index of the matching application configuration.
    pub config_index: Option<usize>,
}

impl Slave {
    pub(crate) fn new(ring_position: u16) -> Self {
        Self {
            ring_position,
            configured_address: crate::BASE_SLAVE_ADDR + ring_position,
            online: true,
            al_state: SlaveState::None,
            ..Self::default()
        }
    }

    /// Active PDO set: CoE-reported when available, SII defaults otherwise.
    pub(crate) fn default_pdos(&self) -> &[SiiPdo] {
        if self.coe_pdos.is_empty() {
            &self.sii.pdos
        } else {
            &self.coe_pdos
        }
    }

}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum AlState {
    #[default]
    Idle,
    /// Write the requested state to AL control.
    WriteControl,
    AwaitWrite,
    /// Poll AL status until the state is reached.
    ReadStatus,
    AwaitRead,
    /// Fetch the AL status code after a refused transition.
    ReadCode,
    AwaitCode,
    /// Acknowledge the error, then fail.
    Acknowledge,
    AwaitAcknowledge,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum AlPoll {
    Pending,
    /// The requested state was reached.
    Done,
    Failed(Error),
}

/// Drives one AL state hop: request via `0x0120`, poll `0x0130`, decode and
/// acknowledge errors via `0x0134`.
///
/// Callers walk multi-hop transitions (e.g. `INIT` → `OP`) one hop at a time
/// using [`SlaveState::next_towards`].
#[derive(Debug, Default)]
pub(crate) struct AlTransition {
    state: AlState,
    target: SlaveState,
    pdu: Option<PduHandle>,
    started_at: u64,
    /// State observed while polling; exposed to the caller on failure too.
    pub observed: SlaveState,
    pub status_code: Option<AlStatusCode>,
    error: Option<Error>,
}

impl AlTransition {
    pub fn start(&mut self, target: SlaveState) {
        self.target = target;
        self.started_at = 0;
        self.status_code = None;
        self.error = None;
        self.state = AlState::WriteControl;
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop) {
        if let Some(handle) = self.pdu.take() {
            pdu_loop.release(handle);
        }

        self.state = AlState::Idle;
    }

    fn fail(&mut self, error: Error) -> AlPoll {
        self.state = AlState::Failed;
        self.error = Some(error);

        AlPoll::Failed(error)
    }

    /// Advance by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        station_address: u16,
        now: u64,
        timeouts: &Timeouts,
    ) -> AlPoll {
        match self.state {
            AlState::Idle | AlState::Done => AlPoll::Pending,
            AlState::Failed => AlPoll::Failed(self.error.unwrap_or(Error::Internal)),

            AlState::WriteControl => {
                if self.started_at == 0 {
                    self.started_at = now;
                }

                let control = AlControl::new(self.target).pack();

                match pdu_loop.request(
                    Command::fpwr(station_address, RegisterAddress::AlControl.into()),
                    &control,
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = AlState::AwaitWrite;

                        AlPoll::Pending
                    }
                    Err(e) => self.fail(e),
                }
            }

            AlState::AwaitWrite => match self.poll_pdu(pdu_loop, now, timeouts) {
                PduStep::Pending => AlPoll::Pending,
                PduStep::Retry => {
                    self.state = AlState::WriteControl;

                    self.timeout_check(now, timeouts)
                }
                PduStep::Failed(e) => self.fail(e),
                PduStep::Data(_) => {
                    self.state = AlState::ReadStatus;

                    AlPoll::Pending
                }
            },

            AlState::ReadStatus => {
                match pdu_loop.request_read(
                    Command::fprd(station_address, RegisterAddress::AlStatus.into()),
                    2,
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = AlState::AwaitRead;

                        AlPoll::Pending
                    }
                    Err(e) => self.fail(e),
                }
            }

            AlState::AwaitRead => match self.poll_pdu(pdu_loop, now, timeouts) {
                PduStep::Pending => AlPoll::Pending,
                PduStep::Retry => {
                    self.state = AlState::ReadStatus;

                    self.timeout_check(now, timeouts)
                }
                PduStep::Failed(e) => self.fail(e),
                PduStep::Data(raw) => {
                    let Ok(status) = AlStatus::unpack_from_slice(&raw) else {
                        return self.fail(Error::Pdu(crate::error::PduError::Decode));
                    };

                    self.observed = status.state;

                    if status.error {
                        self.state = AlState::ReadCode;

                        return AlPoll::Pending;
                    }

                    if status.state == self.target {
                        self.state = AlState::Done;

                        return AlPoll::Done;
                    }

                    // Still transitioning
                    self.state = AlState::ReadStatus;

                    self.timeout_check(now, timeouts)
                }
            },

            AlState::ReadCode => {
                match pdu_loop.request_read(
                    Command::fprd(station_address, RegisterAddress::AlStatusCode.into()),
                    2,
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = AlState::AwaitCode;

                        AlPoll::Pending
                    }
                    Err(e) => self.fail(e),
                }
            }

            AlState::AwaitCode => match self.poll_pdu(pdu_loop, now, timeouts) {
                PduStep::Pending => AlPoll::Pending,
                PduStep::Retry => {
                    self.state = AlState::ReadCode;

                    self.timeout_check(now, timeouts)
                }
                PduStep::Failed(e) => self.fail(e),
                PduStep::Data(raw) => {
                    let code = AlStatusCode::unpack_from_slice(&raw)
                        .unwrap_or(AlStatusCode::Unknown(0));

                    fmt::error!(
                        "Slave {:#06x} refused transition to {}: {}",
                        station_address,
                        self.target,
                        code
                    );

                    self.status_code = Some(code);
                    self.state = AlState::Acknowledge;

                    AlPoll::Pending
                }
            },

            AlState::Acknowledge => {
                let control = AlControl::acknowledge(self.observed).pack();

                match pdu_loop.request(
                    Command::fpwr(station_address, RegisterAddress::AlControl.into()),
                    &control,
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = AlState::AwaitAcknowledge;

                        AlPoll::Pending
                    }
                    Err(e) => self.fail(e),
                }
            }

            AlState::AwaitAcknowledge => match self.poll_pdu(pdu_loop, now, timeouts) {
                PduStep::Pending => AlPoll::Pending,
                PduStep::Retry | PduStep::Data(_) => self.fail(Error::StateTransition {
                    configured_address: station_address,
                    code: self.status_code.unwrap_or(AlStatusCode::Unknown(0)),
                }),
                PduStep::Failed(e) => self.fail(e),
            },
        }
    }

    fn timeout_check(&mut self, now: u64, timeouts: &Timeouts) -> AlPoll {
        if now.saturating_sub(self.started_at) >= timeouts.state_transition {
            self.fail(Error::Timeout)
        } else {
            AlPoll::Pending
        }
    }

    fn poll_pdu(&mut self, pdu_loop: &mut PduLoop, now: u64, timeouts: &Timeouts) -> PduStep {
        let Some(handle) = self.pdu else {
            return PduStep::Failed(Error::Internal);
        };

        match pdu_loop.poll(handle, now, timeouts.pdu) {
            Ok(PduPoll::Pending) => PduStep::Pending,
            Ok(PduPoll::Ready { working_counter }) => {
                let mut raw = [0u8; 2];

                if let Ok(data) = pdu_loop.data(handle) {
                    raw[..data.len().min(2)].copy_from_slice(&data[..data.len().min(2)]);
                }

                pdu_loop.release(handle);
                self.pdu = None;

                if working_counter != 1 {
                    return PduStep::Retry;
                }

                PduStep::Data(raw)
            }
            Ok(PduPoll::TimedOut) => {
                pdu_loop.release(handle);
                self.pdu = None;

                PduStep::Retry
            }
            Err(e) => {
                self.pdu = None;

                PduStep::Failed(e)
            }
        }
    }
}

enum PduStep {
    Pending,
    Retry,
    Failed(Error),
    Data([u8; 2]),
}
