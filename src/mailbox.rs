//! Mailbox transport: framing, counters and the two-phase (check, fetch)
//! read sequence shared by every mailbox protocol.
//!
//! A request is FPWRed into the slave's RX mailbox (sync manager 0), then the
//! TX mailbox (sync manager 1) status byte is polled until the slave signals
//! "mailbox full", at which point the whole TX region is fetched and
//! dispatched on its protocol type nibble. Only one read sequence is in
//! flight per slave at a time; a fetched payload belonging to a different
//! protocol is parked in a staging slot for that protocol's state machine to
//! consume.

use crate::command::Command;
use crate::error::{Error, MailboxError};
use crate::fmt;
use crate::pdu_loop::{PduHandle, PduLoop, PduPoll, PduQueue};
use crate::register::RegisterAddress;
use crate::MAX_MAILBOX_DATA;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWriteSized};

/// Mailbox header size on the wire.
pub const MAILBOX_HEADER: usize = 6;

/// Sync manager indices carrying the mailbox, fixed by convention.
pub const RX_MAILBOX_SM: u8 = 0;
pub const TX_MAILBOX_SM: u8 = 1;

#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Priority {
    #[default]
    Lowest = 0x00,
    Low = 0x01,
    High = 0x02,
    Highest = 0x03,
}

/// Mailbox protocol type nibble.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum MailboxType {
    /// Error reply (ERR).
    #[default]
    Err = 0x00,
    /// ADS over EtherCAT (AoE).
    Aoe = 0x01,
    /// Ethernet over EtherCAT (EoE).
    Eoe = 0x02,
    /// CAN application protocol over EtherCAT (CoE).
    Coe = 0x03,
    /// File Access over EtherCAT (FoE).
    Foe = 0x04,
    /// Servo profile over EtherCAT (SoE).
    Soe = 0x05,
    // 0x06 - 0x0e reserved
    /// Vendor specific (VoE).
    VendorSpecific = 0x0f,
}

bitflags::bitflags! {
    /// Mailbox protocols supported by a slave, from SII word `0x1c`.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
    pub struct MailboxProtocols: u16 {
        /// ADS over EtherCAT.
        const AOE = 0x0001;
        /// Ethernet over EtherCAT.
        const EOE = 0x0002;
        /// CAN application protocol over EtherCAT.
        const COE = 0x0004;
        /// File Access over EtherCAT.
        const FOE = 0x0008;
        /// Servo profile over EtherCAT.
        const SOE = 0x0010;
        /// Vendor specific.
        const VOE = 0x0020;
    }
}

/// Mailbox header.
///
/// Defined in ETG1000.6 under `TMBXHEADER`/`MbxHeader`, e.g. Table 29 – CoE
/// Elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 6)]
pub struct MailboxHeader {
    /// Payload length following this header.
    #[wire(bytes = 2)]
    pub length: u16,
    /// Station address of the originator (zero when sent by the master).
    #[wire(bytes = 2)]
    pub address: u16,
    // reserved6
    #[wire(pre_skip = 6, bits = 2)]
    pub priority: Priority,
    #[wire(bits = 4)]
    pub mailbox_type: MailboxType,
    /// Sequence counter, 1 to 7 inclusive. Wraps to 1; 0 is reserved.
    #[wire(bits = 3, post_skip = 1)]
    pub counter: u8,
}

/// Error code carried in a mailbox error reply (type nibble `0x00`).
///
/// Defined in ETG1000.4 Table 30 – Error reply service data.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u16)]
pub enum MailboxErrorCode {
    /// Syntax of 6 octet mailbox header is wrong
    Syntax = 0x0001,
    /// The mailbox protocol is not supported
    UnsupportedProtocol = 0x0002,
    /// Channel field contains wrong value
    InvalidChannel = 0x0003,
    /// The service in the mailbox protocol is not supported
    ServiceNotSupported = 0x0004,
    /// The mailbox protocol header is wrong
    InvalidHeader = 0x0005,
    /// Received mailbox data is too short
    SizeTooShort = 0x0006,
    /// The mailbox protocol can not be processed because of limited resources
    NoMoreMemory = 0x0007,
    /// The length of the data is inconsistent
    InvalidSize = 0x0008,
    /// Unknown error code.
    #[wire(catch_all)]
    Unknown(u16),
}

impl core::fmt::Display for MailboxErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let num = u16::from(*self);

        f.write_fmt(format_args!("{:#06x}: ", num))?;

        let s = match self {
            Self::Syntax => "mailbox header syntax error",
            Self::UnsupportedProtocol => "protocol not supported",
            Self::InvalidChannel => "invalid channel",
            Self::ServiceNotSupported => "service not supported",
            Self::InvalidHeader => "invalid protocol header",
            Self::SizeTooShort => "data too short",
            Self::NoMoreMemory => "out of mailbox memory",
            Self::InvalidSize => "inconsistent data length",
            Self::Unknown(_) => "(unknown)",
        };

        f.write_str(s)
    }
}

/// A fetched mailbox payload parked for a protocol state machine that was not
/// the one doing the fetch.
type Staged = (MailboxType, heapless::Vec<u8, MAX_MAILBOX_DATA>);

/// Per-slave mailbox geometry and runtime state.
///
/// Geometry comes from the SII standard mailbox words during scan and may be
/// refined from the live sync manager configuration once the slave reaches
/// `PRE-OP`.
#[derive(Debug, Default)]
pub struct MailboxRuntime {
    /// The slave's configured station address, denormalised here so the
    /// transport can address datagrams without a slave reference.
    pub station_address: u16,
    /// Physical start of the write (master → slave) mailbox.
    pub rx_offset: u16,
    pub rx_size: u16,
    /// Physical start of the read (slave → master) mailbox.
    pub tx_offset: u16,
    pub tx_size: u16,
    /// Last sequence counter used, advanced 1..=7 skipping 0.
    counter: u8,
    /// One read sequence in flight per slave.
    pub(crate) locked: bool,
    /// Payloads fetched on behalf of other protocols.
    staged: heapless::Vec<Staged, 2>,
}

impl MailboxRuntime {
    /// Whether the slave has a usable mailbox.
    pub fn present(&self) -> bool {
        self.rx_size > MAILBOX_HEADER as u16 && self.tx_size > MAILBOX_HEADER as u16
    }

    /// Usable payload of one write mailbox frame.
    pub fn rx_data_size(&self) -> usize {
        usize::from(self.rx_size).saturating_sub(MAILBOX_HEADER)
    }

    /// Usable payload of one read mailbox frame.
    pub fn tx_data_size(&self) -> usize {
        usize::from(self.tx_size).saturating_sub(MAILBOX_HEADER)
    }

    fn next_counter(&mut self) -> u8 {
        self.counter = if self.counter >= 7 { 1 } else { self.counter + 1 };

        self.counter
    }

    fn stage(&mut self, mailbox_type: MailboxType, data: &[u8]) {
        let Ok(copy) = heapless::Vec::from_slice(data) else {
            fmt::warn!("Staged mailbox payload too large, dropping");

            return;
        };

        if self.staged.is_full() {
            self.staged.remove(0);
        }

        let _ = self.staged.push((mailbox_type, copy));
    }

    pub(crate) fn take_staged(
        &mut self,
        mailbox_type: MailboxType,
    ) -> Option<heapless::Vec<u8, MAX_MAILBOX_DATA>> {
        let at = self.staged.iter().position(|(t, _)| *t == mailbox_type)?;

        Some(self.staged.remove(at).1)
    }
}

/// State of one request/response round over a slave's mailbox.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum ExchangeState {
    #[default]
    Idle,
    /// Write the request into the RX mailbox.
    Send,
    AwaitSend,
    /// Read the TX mailbox sync manager status byte.
    Check,
    AwaitCheck,
    /// Read the whole TX mailbox region.
    Fetch,
    AwaitFetch,
    Done,
}

/// Result of stepping a [`MailboxExchange`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MbxPoll {
    Pending,
    /// Response available via [`MailboxExchange::response`].
    Done,
    Failed(Error),
}

/// One mailbox round: an optional request write followed by a two-phase read,
/// filtered on the expected protocol type.
///
/// Protocol state machines own one of these and pump it from their own step
/// function. The exchange takes the per-slave mailbox lock while a read
/// sequence is in flight.
#[derive(Debug, Default)]
pub(crate) struct MailboxExchange {
    state: ExchangeState,
    pdu: Option<PduHandle>,
    /// Request payload, kept for resends while the RX mailbox is occupied.
    request: heapless::Vec<u8, MAX_MAILBOX_DATA>,
    request_type: Option<MailboxType>,
    expect: MailboxType,
    /// Responses of an unexpected (but valid) protocol are staged; the
    /// exchange keeps waiting for its own until this deadline.
    started_at: u64,
    /// Complete after the request write, without reading a response.
    write_only: bool,
    response: heapless::Vec<u8, MAX_MAILBOX_DATA>,
}

impl MailboxExchange {
    /// Begin a new round: send `request` (if any), then read until a payload
    /// of type `expect` arrives.
    pub fn start(&mut self, request: Option<(MailboxType, &[u8])>, expect: MailboxType) {
        self.request.clear();
        self.response.clear();
        self.request_type = None;

        if let Some((mailbox_type, data)) = request {
            // Callers size their payloads from `rx_data_size`
            let _ = self.request.extend_from_slice(data);
            self.request_type = Some(mailbox_type);
            self.state = ExchangeState::Send;
        } else {
            self.state = ExchangeState::Check;
        }

        self.expect = expect;
        self.started_at = 0;
        self.write_only = false;
    }

    /// Begin a read-only round with no request write.
    pub fn start_read(&mut self, expect: MailboxType) {
        self.start(None, expect);
    }

    /// Begin a write-only round: the exchange completes as soon as the slave
    /// accepts the request, without awaiting a response.
    pub fn start_write_only(&mut self, mailbox_type: MailboxType, data: &[u8]) {
        self.start(Some((mailbox_type, data)), mailbox_type);
        self.write_only = true;
    }

    /// The response payload (protocol data, mailbox header stripped).
    pub fn response(&self) -> &[u8] {
        &self.response
    }

    /// Abandon the round, releasing the PDU descriptor and mailbox lock.
    pub fn abort(&mut self, pdu_loop: &mut PduLoop, mbx: &mut MailboxRuntime) {
        if let Some(handle) = self.pdu.take() {
            pdu_loop.release(handle);
        }

        if !matches!(self.state, ExchangeState::Idle) {
            mbx.locked = false;
        }

        self.state = ExchangeState::Idle;
    }

    fn fail(&mut self, mbx: &mut MailboxRuntime, error: Error) -> MbxPoll {
        self.state = ExchangeState::Idle;
        mbx.locked = false;

        MbxPoll::Failed(error)
    }

    /// Advance the exchange by at most one transition.
    ///
    /// `pdu_timeout` bounds each individual datagram round trip;
    /// `response_timeout` bounds the whole wait for the slave to fill its TX
    /// mailbox.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        mbx: &mut MailboxRuntime,
        now: u64,
        pdu_timeout: u64,
        response_timeout: u64,
    ) -> MbxPoll {
        match self.state {
            ExchangeState::Idle | ExchangeState::Done => MbxPoll::Pending,

            ExchangeState::Send => {
                if !mbx.present() {
                    return self.fail(mbx, Error::Mailbox(MailboxError::NoMailbox));
                }

                if self.request.len() > mbx.rx_data_size() {
                    return self.fail(mbx, Error::Mailbox(MailboxError::TooLong));
                }

                let header = MailboxHeader {
                    length: self.request.len() as u16,
                    address: 0,
                    priority: Priority::Lowest,
                    // Set in `start`
                    mailbox_type: self.request_type.unwrap_or(MailboxType::Err),
                    counter: mbx.next_counter(),
                };

                // The whole RX mailbox region must be written in one go
                let mut frame = [0u8; MAX_MAILBOX_DATA + MAILBOX_HEADER];
                let total = usize::from(mbx.rx_size).min(frame.len());

                frame[..MAILBOX_HEADER].copy_from_slice(&header.pack());
                frame[MAILBOX_HEADER..MAILBOX_HEADER + self.request.len()]
                    .copy_from_slice(&self.request);

                match pdu_loop.request(
                    Command::fpwr(mbx.station_address, mbx.rx_offset),
                    &frame[..total],
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = ExchangeState::AwaitSend;

                        if self.started_at == 0 {
                            self.started_at = now;
                        }

                        MbxPoll::Pending
                    }
                    Err(e) => self.fail(mbx, e),
                }
            }

            ExchangeState::AwaitSend => {
                let Some(handle) = self.pdu else {
                    return self.fail(mbx, Error::Internal);
                };

                match pdu_loop.poll(handle, now, pdu_timeout) {
                    Ok(PduPoll::Pending) => MbxPoll::Pending,
                    Ok(PduPoll::Ready { working_counter }) => {
                        pdu_loop.release(handle);
                        self.pdu = None;

                        if working_counter == 1 {
                            if self.write_only {
                                self.state = ExchangeState::Done;

                                return MbxPoll::Done;
                            }

                            mbx.locked = true;
                            self.state = ExchangeState::Check;
                        } else if now.saturating_sub(self.started_at) >= response_timeout {
                            return self.fail(
                                mbx,
                                Error::WorkingCounter {
                                    expected: 1,
                                    received: working_counter,
                                },
                            );
                        } else {
                            // RX mailbox still occupied; keep trying
                            self.state = ExchangeState::Send;
                        }

                        MbxPoll::Pending
                    }
                    Ok(PduPoll::TimedOut) => {
                        pdu_loop.release(handle);
                        self.pdu = None;
                        self.state = ExchangeState::Send;

                        if now.saturating_sub(self.started_at) >= response_timeout {
                            return self.fail(mbx, Error::Timeout);
                        }

                        MbxPoll::Pending
                    }
                    Err(e) => {
                        self.pdu = None;

                        self.fail(mbx, e)
                    }
                }
            }

            ExchangeState::Check => {
                // A response fetched by another protocol's round may already
                // be waiting for us
                if let Some(staged) = mbx.take_staged(self.expect) {
                    self.response = staged;
                    self.state = ExchangeState::Done;
                    mbx.locked = false;

                    return MbxPoll::Done;
                }

                if self.started_at == 0 {
                    self.started_at = now;
                }

                mbx.locked = true;

                match pdu_loop.request_read(
                    Command::fprd(
                        mbx.station_address,
                        RegisterAddress::sync_manager_status(TX_MAILBOX_SM),
                    ),
                    1,
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = ExchangeState::AwaitCheck;

                        MbxPoll::Pending
                    }
                    Err(e) => self.fail(mbx, e),
                }
            }

            ExchangeState::AwaitCheck => {
                let Some(handle) = self.pdu else {
                    return self.fail(mbx, Error::Internal);
                };

                match pdu_loop.poll(handle, now, pdu_timeout) {
                    Ok(PduPoll::Pending) => MbxPoll::Pending,
                    Ok(PduPoll::Ready { working_counter }) => {
                        // SM status bit 3: mailbox full
                        let full = pdu_loop
                            .data(handle)
                            .ok()
                            .and_then(|data| data.first().copied())
                            .map(|status| status & 0x08 != 0)
                            .unwrap_or(false);

                        pdu_loop.release(handle);
                        self.pdu = None;

                        if working_counter != 1 || !full {
                            if now.saturating_sub(self.started_at) >= response_timeout {
                                return self.fail(mbx, Error::Timeout);
                            }

                            self.state = ExchangeState::Check;
                        } else {
                            self.state = ExchangeState::Fetch;
                        }

                        MbxPoll::Pending
                    }
                    Ok(PduPoll::TimedOut) => {
                        pdu_loop.release(handle);
                        self.pdu = None;

                        if now.saturating_sub(self.started_at) >= response_timeout {
                            return self.fail(mbx, Error::Timeout);
                        }

                        self.state = ExchangeState::Check;

                        MbxPoll::Pending
                    }
                    Err(e) => {
                        self.pdu = None;

                        self.fail(mbx, e)
                    }
                }
            }

            ExchangeState::Fetch => {
                match pdu_loop.request_read(
                    Command::fprd(mbx.station_address, mbx.tx_offset),
                    usize::from(mbx.tx_size),
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = ExchangeState::AwaitFetch;

                        MbxPoll::Pending
                    }
                    Err(e) => self.fail(mbx, e),
                }
            }

            ExchangeState::AwaitFetch => {
                let Some(handle) = self.pdu else {
                    return self.fail(mbx, Error::Internal);
                };

                match pdu_loop.poll(handle, now, pdu_timeout) {
                    Ok(PduPoll::Pending) => MbxPoll::Pending,
                    Ok(PduPoll::Ready { working_counter }) => {
                        if working_counter != 1 {
                            pdu_loop.release(handle);
                            self.pdu = None;

                            // The slave repeats the buffer on a failed read;
                            // go back to checking
                            self.state = ExchangeState::Check;

                            return MbxPoll::Pending;
                        }

                        let result = self.consume_fetch(pdu_loop, mbx, handle);

                        pdu_loop.release(handle);
                        self.pdu = None;

                        result
                    }
                    Ok(PduPoll::TimedOut) => {
                        pdu_loop.release(handle);
                        self.pdu = None;

                        if now.saturating_sub(self.started_at) >= response_timeout {
                            return self.fail(mbx, Error::Timeout);
                        }

                        self.state = ExchangeState::Check;

                        MbxPoll::Pending
                    }
                    Err(e) => {
                        self.pdu = None;

                        self.fail(mbx, e)
                    }
                }
            }
        }
    }

    fn consume_fetch(
        &mut self,
        pdu_loop: &PduLoop,
        mbx: &mut MailboxRuntime,
        handle: PduHandle,
    ) -> MbxPoll {
        let Ok(data) = pdu_loop.data(handle) else {
            return self.fail(mbx, Error::Internal);
        };

        let Ok(header) = MailboxHeader::unpack_from_slice(data) else {
            return self.fail(mbx, Error::Mailbox(MailboxError::ResponseInvalid));
        };

        let Some(payload) = data
            .get(MAILBOX_HEADER..MAILBOX_HEADER + usize::from(header.length))
        else {
            return self.fail(mbx, Error::Mailbox(MailboxError::ResponseInvalid));
        };

        if header.mailbox_type == MailboxType::Err {
            // Error reply payload: u16 service, u16 detail code
            let code = payload
                .get(2..4)
                .and_then(|raw| u16::unpack_from_slice(raw).ok())
                .map(MailboxErrorCode::from)
                .unwrap_or(MailboxErrorCode::Unknown(0));

            fmt::error!(
                "Slave {:#06x} mailbox error reply: {}",
                mbx.station_address,
                code
            );

            return self.fail(mbx, Error::Mailbox(MailboxError::ErrorReply(code)));
        }

        if header.mailbox_type != self.expect {
            fmt::debug!(
                "Slave {:#06x}: staging mailbox payload of type {:?} while waiting for {:?}",
                mbx.station_address,
                header.mailbox_type,
                self.expect
            );

            mbx.stage(header.mailbox_type, payload);

            self.state = ExchangeState::Check;

            return MbxPoll::Pending;
        }

        if self.response.extend_from_slice(payload).is_err() {
            return self.fail(mbx, Error::Mailbox(MailboxError::TooLong));
        }

        self.state = ExchangeState::Done;
        mbx.locked = false;

        MbxPoll::Done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_skips_zero() {
        let mut mbx = MailboxRuntime::default();

        let mut seen = heapless::Vec::<u8, 16>::new();

        for _ in 0..16 {
            seen.push(mbx.next_counter()).unwrap();
        }

        // 1..=7 then wraps back to 1, never 0
        assert_eq!(
            &seen[..],
            &[1, 2, 3, 4, 5, 6, 7, 1, 2, 3, 4, 5, 6, 7, 1, 2]
        );
    }

    #[test]
    fn counter_unique_within_window() {
        let mut mbx = MailboxRuntime::default();

        let mut last = [0u8; 7];

        for i in 0..70 {
            let counter = mbx.next_counter();

            assert!(
                !last[..(i).min(6)].contains(&counter),
                "counter {} repeated within a 7 message window",
                counter
            );

            last.rotate_right(1);
            last[0] = counter;
        }
    }

    #[test]
    fn encode_header() {
        // From a wireshark capture of a CoE SDO request
        let expected = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x33];

        let packed = MailboxHeader {
            length: 10,
            priority: Priority::Lowest,
            address: 0x0000,
            counter: 3,
            mailbox_type: MailboxType::Coe,
        }
        .pack();

        assert_eq!(packed, expected);
    }

    #[test]
    fn decode_header() {
        let raw = [0x0a, 0x00, 0x00, 0x00, 0x00, 0x23];

        let expected = MailboxHeader {
            length: 10,
            address: 0x0000,
            priority: Priority::Lowest,
            mailbox_type: MailboxType::Coe,
            counter: 2,
        };

        assert_eq!(MailboxHeader::unpack_from_slice(&raw).unwrap(), expected);
    }

    #[test]
    fn staging_round_trip() {
        let mut mbx = MailboxRuntime::default();

        mbx.stage(MailboxType::Coe, &[1, 2, 3]);
        mbx.stage(MailboxType::Foe, &[4, 5]);

        assert_eq!(mbx.take_staged(MailboxType::Soe), None);
        assert_eq!(
            mbx.take_staged(MailboxType::Foe).as_deref(),
            Some(&[4u8, 5][..])
        );
        assert_eq!(
            mbx.take_staged(MailboxType::Coe).as_deref(),
            Some(&[1u8, 2, 3][..])
        );
        assert_eq!(mbx.take_staged(MailboxType::Coe), None);
    }

    #[test]
    fn mailbox_geometry() {
        let mbx = MailboxRuntime {
            rx_offset: 0x1000,
            rx_size: 128,
            tx_offset: 0x1080,
            tx_size: 128,
            ..MailboxRuntime::default()
        };

        assert!(mbx.present());
        assert_eq!(mbx.rx_data_size(), 122);

        assert!(!MailboxRuntime::default().present());
    }
}
