//! Servo drive profile over EtherCAT (SoE): IDN reads and writes with
//! fragmentation.
//!
//! Every SoE mailbox payload starts with a 4 byte header: an opcode byte
//! (opcode in bits 0..3, "incomplete" in bit 3, "error" in bit 4), an element
//! byte (drive number in bits 0..3, "value" element flag in bit 6), then a 16
//! bit field holding the IDN. On all but the last fragment of a segmented
//! write that field holds the number of fragments left instead.

use crate::error::{Error, Item};
use crate::fmt;
use crate::mailbox::{MailboxExchange, MailboxRuntime, MailboxType, MbxPoll};
use crate::master::Timeouts;
use crate::pdu_loop::PduLoop;
use crate::MAX_SDO_DATA;

/// SoE header size.
pub const SOE_HEADER: usize = 4;

const OPCODE_READ_REQUEST: u8 = 0x01;
const OPCODE_READ_RESPONSE: u8 = 0x02;
const OPCODE_WRITE_REQUEST: u8 = 0x03;
const OPCODE_WRITE_RESPONSE: u8 = 0x04;

/// SoE protocol failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SoeError {
    /// The slave set the error flag and returned this SERCOS error code.
    Error(u16),
    /// The response names a different IDN than the request.
    WrongIdn {
        /// Requested IDN.
        expected: u16,
        /// IDN in the response.
        received: u16,
    },
    /// An unexpected opcode arrived.
    OpCode(u8),
    /// The response is too short or otherwise malformed.
    ResponseInvalid,
}

/// Human readable text for the well known SERCOS error codes.
///
/// Codes are defined in IEC 61800-7-204; vendor specific codes fall through
/// to a generic message.
pub fn soe_error_text(code: u16) -> &'static str {
    match code {
        0x0001 => "No IDN",
        0x0009 => "Invalid access to element 1",
        0x1001 => "No name",
        0x1009 => "Invalid access to element 2",
        0x2001 => "No attribute",
        0x2009 => "Invalid access to element 3",
        0x3001 => "No units",
        0x3009 => "Invalid access to element 4",
        0x4001 => "No minimum value",
        0x4009 => "Invalid access to element 5",
        0x5001 => "No maximum value",
        0x5009 => "Invalid access to element 6",
        0x6001 => "No data",
        0x6002 => "Data transmission too short",
        0x6004 => "Data not writable at this time",
        0x6009 => "Invalid access to element 7",
        0x600a => "Procedure command already active",
        0x600c => "Data invalid",
        0x7002 => "Data transmission too long",
        0x7003 => "Data cannot be changed",
        0x7004 => "Data currently write protected",
        0x7005 => "Data smaller than minimum value",
        0x7006 => "Data greater than maximum value",
        0x7008 => "Invalid data",
        0x7009 => "Data write protected by password",
        0x700a => "Data write protected, parameterization level",
        0x700b => "Invalid indirect addressing",
        0x700c => "Data write protected by operating mode",
        0x700d => "Reserved",
        0x7010 => "Procedure command already active",
        0x7011 => "Procedure command not interruptible",
        0x7012 => "Procedure command currently not executable (operating state)",
        0x7013 => "Procedure command not executable (invalid or false parameters)",
        0x8001 => "No state",
        0x8005 => "Maintenance required",
        _ => "Unknown error code",
    }
}

impl core::fmt::Display for SoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Error(code) => write!(f, "{:#06x}: {}", code, soe_error_text(*code)),
            Self::WrongIdn { expected, received } => {
                write!(
                    f,
                    "response for wrong IDN {:#06x} (requested {:#06x})",
                    received, expected
                )
            }
            Self::OpCode(code) => write!(f, "unexpected opcode {:#04x}", code),
            Self::ResponseInvalid => f.write_str("malformed response"),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum SoeState {
    #[default]
    Idle,
    ReadRequest,
    ReadResponse,
    /// Send the next write fragment.
    WriteFragment,
    /// Await acceptance of an intermediate (not last) fragment.
    WriteFragmentSent,
    WriteResponse,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SoePoll {
    Pending,
    Done,
    Failed(Error),
}

/// One SoE IDN operation in flight against one slave.
#[derive(Debug, Default)]
pub(crate) struct SoeFsm {
    state: SoeState,
    exchange: MailboxExchange,

    idn: u16,
    drive_no: u8,
    /// Write source, or accumulated read data.
    data: heapless::Vec<u8, MAX_SDO_DATA>,
    offset: usize,
    /// SERCOS error code from the slave, if any.
    error_code: u16,
    error: Option<Error>,
}

impl SoeFsm {
    pub fn is_idle(&self) -> bool {
        matches!(self.state, SoeState::Idle)
    }

    /// Read data after a successful read.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// SERCOS error code from the last failed operation, zero if none.
    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    fn reset(&mut self, drive_no: u8, idn: u16) {
        self.idn = idn;
        self.drive_no = drive_no;
        self.data.clear();
        self.offset = 0;
        self.error_code = 0;
        self.error = None;
    }

    /// Begin reading the value of `idn`.
    pub fn start_read(&mut self, drive_no: u8, idn: u16) {
        self.reset(drive_no, idn);

        self.state = SoeState::ReadRequest;
    }

    /// Begin writing `data` as the value of `idn`.
    pub fn start_write(&mut self, drive_no: u8, idn: u16, data: &[u8]) -> Result<(), Error> {
        self.reset(drive_no, idn);

        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(Item::Request))?;

        self.state = SoeState::WriteFragment;

        Ok(())
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop, mbx: &mut MailboxRuntime) {
        self.exchange.abort(pdu_loop, mbx);
        self.state = SoeState::Idle;
    }

    fn fail(&mut self, error: Error) -> SoePoll {
        self.state = SoeState::Failed;
        self.error = Some(error);

        SoePoll::Failed(error)
    }

    fn element_byte(&self) -> u8 {
        // Value element requested
        (self.drive_no & 0x07) | (1 << 6)
    }

    /// Advance by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        mbx: &mut MailboxRuntime,
        now: u64,
        timeouts: &Timeouts,
    ) -> SoePoll {
        match self.state {
            SoeState::Idle | SoeState::Done => SoePoll::Pending,
            SoeState::Failed => SoePoll::Failed(self.error.unwrap_or(Error::Internal)),

            SoeState::ReadRequest => {
                let mut request = [0u8; SOE_HEADER];

                request[0] = OPCODE_READ_REQUEST;
                request[1] = self.element_byte();
                request[2..4].copy_from_slice(&self.idn.to_le_bytes());

                self.exchange
                    .start(Some((MailboxType::Soe, &request)), MailboxType::Soe);
                self.state = SoeState::ReadResponse;

                SoePoll::Pending
            }

            SoeState::ReadResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => SoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_read_response(mbx),
            },

            SoeState::WriteFragment => {
                let header_room = mbx.rx_data_size();

                if header_room <= SOE_HEADER {
                    return self.fail(Error::Mailbox(crate::error::MailboxError::NoMailbox));
                }

                let max_fragment = header_room - SOE_HEADER;
                let remaining = self.data.len() - self.offset;
                let incomplete = remaining > max_fragment;
                let fragment = remaining.min(max_fragment);

                let mut fragments_left = remaining / fragment.max(1) - 1;
                if remaining % fragment.max(1) != 0 {
                    fragments_left += 1;
                }

                let mut request = [0u8; MAX_SDO_DATA + SOE_HEADER];

                request[0] = OPCODE_WRITE_REQUEST | u8::from(incomplete) << 3;
                request[1] = self.element_byte();

                let idn_field = if incomplete {
                    fragments_left as u16
                } else {
                    self.idn
                };

                request[2..4].copy_from_slice(&idn_field.to_le_bytes());
                request[SOE_HEADER..SOE_HEADER + fragment]
                    .copy_from_slice(&self.data[self.offset..self.offset + fragment]);

                self.offset += fragment;

                if incomplete {
                    self.exchange
                        .start_write_only(MailboxType::Soe, &request[..SOE_HEADER + fragment]);
                    self.state = SoeState::WriteFragmentSent;
                } else {
                    self.exchange.start(
                        Some((MailboxType::Soe, &request[..SOE_HEADER + fragment])),
                        MailboxType::Soe,
                    );
                    self.state = SoeState::WriteResponse;
                }

                SoePoll::Pending
            }

            SoeState::WriteFragmentSent => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => SoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => {
                    self.state = SoeState::WriteFragment;

                    SoePoll::Pending
                }
            },

            SoeState::WriteResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => SoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_write_response(mbx),
            },
        }
    }

    fn handle_read_response(&mut self, mbx: &mut MailboxRuntime) -> SoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        if response.len() < SOE_HEADER {
            return self.fail(Error::Soe(SoeError::ResponseInvalid));
        }

        let header = response[0];
        let opcode = header & 0x07;
        let incomplete = header >> 3 & 1 != 0;
        let error_flag = header >> 4 & 1 != 0;

        if opcode != OPCODE_READ_RESPONSE {
            return self.fail(Error::Soe(SoeError::OpCode(opcode)));
        }

        if error_flag {
            self.error_code =
                u16::from_le_bytes([response[response.len() - 2], response[response.len() - 1]]);

            fmt::error!(
                "SoE read of IDN {:#06x} failed on slave {:#06x}: {}",
                self.idn,
                mbx.station_address,
                SoeError::Error(self.error_code)
            );

            return self.fail(Error::Soe(SoeError::Error(self.error_code)));
        }

        if self
            .data
            .extend_from_slice(&response[SOE_HEADER..])
            .is_err()
        {
            return self.fail(Error::Capacity(Item::Request));
        }

        if incomplete {
            fmt::debug!("SoE data incomplete, waiting for fragment");

            self.exchange.start_read(MailboxType::Soe);
            self.state = SoeState::ReadResponse;

            return SoePoll::Pending;
        }

        self.state = SoeState::Done;

        SoePoll::Done
    }

    fn handle_write_response(&mut self, mbx: &mut MailboxRuntime) -> SoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        if response.len() < SOE_HEADER {
            return self.fail(Error::Soe(SoeError::ResponseInvalid));
        }

        let header = response[0];
        let opcode = header & 0x07;
        let error_flag = header >> 4 & 1 != 0;

        if opcode != OPCODE_WRITE_RESPONSE {
            return self.fail(Error::Soe(SoeError::OpCode(opcode)));
        }

        let idn = u16::from_le_bytes([response[2], response[3]]);

        if idn != self.idn {
            return self.fail(Error::Soe(SoeError::WrongIdn {
                expected: self.idn,
                received: idn,
            }));
        }

        if error_flag {
            self.error_code = response
                .get(SOE_HEADER..SOE_HEADER + 2)
                .map(|raw| u16::from_le_bytes([raw[0], raw[1]]))
                .unwrap_or(0);

            fmt::error!(
                "SoE write of IDN {:#06x} failed on slave {:#06x}: {}",
                self.idn,
                mbx.station_address,
                SoeError::Error(self.error_code)
            );

            return self.fail(Error::Soe(SoeError::Error(self.error_code)));
        }

        self.state = SoeState::Done;

        SoePoll::Done
    }
}
