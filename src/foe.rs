//! File Access over EtherCAT (FoE): firmware/file upload and download with
//! packet number sequencing.
//!
//! Opcode and header layout per ETG.5003. Every mailbox frame carries a 6
//! byte FoE header: opcode, a reserved byte and a 32 bit field holding the
//! password (requests), packet number (DATA/ACK) or error code (ERR).

use crate::error::{Error, Item};
use crate::fmt;
use crate::mailbox::{MailboxExchange, MailboxRuntime, MailboxType, MbxPoll};
use crate::master::Timeouts;
use crate::pdu_loop::PduLoop;
use crate::MAX_SDO_DATA;
use ethercrab_wire::EtherCrabWireRead;

/// FoE header size.
pub const FOE_HEADER: usize = 6;

/// Maximum file name length in a read/write request.
pub const MAX_FILENAME: usize = 64;

/// FoE operation codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FoeOpCode {
    /// Read request.
    Rrq = 1,
    /// Write request.
    Wrq = 2,
    /// File data fragment.
    Data = 3,
    /// Acknowledgement of a data fragment.
    Ack = 4,
    /// Error; the header's u32 field carries the code.
    Err = 5,
    /// The device cannot take the fragment right now; retransmit.
    Busy = 6,
}

/// FoE protocol failure.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FoeError {
    /// The slave answered with an ERR packet carrying this code.
    Error(u32),
    /// A DATA packet arrived out of sequence.
    WrongPacket {
        /// The packet number the master expected.
        expected: u32,
        /// The packet number received.
        received: u32,
    },
    /// An unexpected opcode arrived.
    OpCode(u8),
    /// The response is too short or otherwise malformed.
    ResponseInvalid,
}

impl core::fmt::Display for FoeError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Error(code) => write!(f, "slave error {:#010x}", code),
            Self::WrongPacket { expected, received } => {
                write!(f, "expected packet {}, received {}", expected, received)
            }
            Self::OpCode(code) => write!(f, "unexpected opcode {:#04x}", code),
            Self::ResponseInvalid => f.write_str("malformed response"),
        }
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum FoeState {
    #[default]
    Idle,
    /// Send WRQ with the file name.
    WriteRequest,
    /// Await the ACK for WRQ or a DATA fragment.
    WriteAck,
    /// Send the next DATA fragment.
    DataSend,
    /// Send RRQ with the file name.
    ReadRequest,
    /// Await the next DATA fragment.
    DataReceive,
    /// Send the ACK for the fragment just received.
    AckSend,
    /// Reception suspended: the receive buffer is full and the application
    /// must drain it before the transfer continues.
    Ready,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum FoePoll {
    Pending,
    /// Read transfers: buffer full, application must drain and resume.
    Suspended,
    Done,
    Failed(Error),
}

/// FoE transfer statistics for one operation.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FoeProgress {
    /// DATA packets sent (write) or received (read).
    pub packets: u32,
    /// Payload bytes transferred so far.
    pub bytes: usize,
}

/// One FoE transfer in flight against one slave.
#[derive(Debug, Default)]
pub(crate) struct FoeFsm {
    state: FoeState,
    exchange: MailboxExchange,

    filename: heapless::Vec<u8, MAX_FILENAME>,
    /// Write source or read sink.
    data: heapless::Vec<u8, MAX_SDO_DATA>,
    /// Write: offset of the next fragment to send.
    offset: usize,
    /// Write: length of the fragment in flight, for BUSY retransmission.
    last_fragment_len: usize,
    /// Write: packet number of the fragment in flight.
    tx_packet_no: u32,
    tx_last_packet: bool,
    /// Read: the packet number the next DATA fragment must carry.
    rx_expected_packet_no: u32,
    rx_last_packet: bool,
    progress: FoeProgress,
    error: Option<Error>,
}

impl FoeFsm {
    pub fn is_idle(&self) -> bool {
        matches!(self.state, FoeState::Idle)
    }

    pub fn is_suspended(&self) -> bool {
        matches!(self.state, FoeState::Ready)
    }

    /// Received file data so far (read transfers).
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn progress(&self) -> FoeProgress {
        self.progress
    }

    fn reset(&mut self, filename: &str) -> Result<(), Error> {
        self.filename.clear();
        self.filename
            .extend_from_slice(filename.as_bytes())
            .map_err(|_| Error::Capacity(Item::Request))?;
        self.data.clear();
        self.offset = 0;
        self.last_fragment_len = 0;
        self.tx_packet_no = 0;
        self.tx_last_packet = false;
        self.rx_expected_packet_no = 1;
        self.rx_last_packet = false;
        self.progress = FoeProgress::default();
        self.error = None;

        Ok(())
    }

    /// Begin writing `data` to the file `filename` on the slave.
    pub fn start_write(&mut self, filename: &str, data: &[u8]) -> Result<(), Error> {
        self.reset(filename)?;

        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(Item::Request))?;

        self.state = FoeState::WriteRequest;

        Ok(())
    }

    /// Begin reading the file `filename` from the slave.
    pub fn start_read(&mut self, filename: &str) -> Result<(), Error> {
        self.reset(filename)?;

        self.state = FoeState::ReadRequest;

        Ok(())
    }

    /// Continue a suspended read after the application drained the buffer.
    pub fn resume(&mut self) {
        if self.is_suspended() {
            self.data.clear();
            self.state = FoeState::AckSend;
        }
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop, mbx: &mut MailboxRuntime) {
        self.exchange.abort(pdu_loop, mbx);
        self.state = FoeState::Idle;
    }

    fn fail(&mut self, error: Error) -> FoePoll {
        self.state = FoeState::Failed;
        self.error = Some(error);

        FoePoll::Failed(error)
    }

    fn header(opcode: FoeOpCode, field: u32, out: &mut [u8]) {
        out[0] = opcode as u8;
        out[1] = 0;
        out[2..6].copy_from_slice(&field.to_le_bytes());
    }

    /// Payload capacity of one outgoing DATA fragment.
    fn tx_fragment_size(mbx: &MailboxRuntime) -> usize {
        mbx.rx_data_size().saturating_sub(FOE_HEADER)
    }

    /// Advance by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        mbx: &mut MailboxRuntime,
        now: u64,
        timeouts: &Timeouts,
    ) -> FoePoll {
        match self.state {
            FoeState::Idle | FoeState::Done => FoePoll::Pending,
            FoeState::Ready => FoePoll::Suspended,
            FoeState::Failed => FoePoll::Failed(self.error.unwrap_or(Error::Internal)),

            FoeState::WriteRequest => {
                let mut request = [0u8; FOE_HEADER + MAX_FILENAME];

                // Password is always zero
                Self::header(FoeOpCode::Wrq, 0, &mut request);
                request[FOE_HEADER..FOE_HEADER + self.filename.len()]
                    .copy_from_slice(&self.filename);

                self.exchange.start(
                    Some((
                        MailboxType::Foe,
                        &request[..FOE_HEADER + self.filename.len()],
                    )),
                    MailboxType::Foe,
                );
                self.state = FoeState::WriteAck;

                FoePoll::Pending
            }

            FoeState::WriteAck => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => FoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_write_ack(),
            },

            FoeState::DataSend => {
                let fragment_size = Self::tx_fragment_size(mbx);

                if fragment_size == 0 {
                    return self.fail(Error::Capacity(Item::Mailbox));
                }

                let remaining = self.data.len() - self.offset;

                // A final fragment is marked by being shorter than the full
                // mailbox; an exactly-full last fragment is followed by an
                // empty one.
                let current = if remaining < fragment_size {
                    self.tx_last_packet = true;

                    remaining
                } else {
                    fragment_size
                };

                let mut request = [0u8; MAX_SDO_DATA + FOE_HEADER];

                Self::header(FoeOpCode::Data, self.tx_packet_no, &mut request);
                request[FOE_HEADER..FOE_HEADER + current]
                    .copy_from_slice(&self.data[self.offset..self.offset + current]);

                self.last_fragment_len = current;
                self.offset += current;
                self.progress.packets += 1;
                self.progress.bytes = self.offset;

                self.exchange.start(
                    Some((MailboxType::Foe, &request[..FOE_HEADER + current])),
                    MailboxType::Foe,
                );
                self.state = FoeState::WriteAck;

                FoePoll::Pending
            }

            FoeState::ReadRequest => {
                let mut request = [0u8; FOE_HEADER + MAX_FILENAME];

                Self::header(FoeOpCode::Rrq, 0, &mut request);
                request[FOE_HEADER..FOE_HEADER + self.filename.len()]
                    .copy_from_slice(&self.filename);

                self.exchange.start(
                    Some((
                        MailboxType::Foe,
                        &request[..FOE_HEADER + self.filename.len()],
                    )),
                    MailboxType::Foe,
                );
                self.state = FoeState::DataReceive;

                FoePoll::Pending
            }

            FoeState::DataReceive => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => FoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_data(mbx),
            },

            FoeState::AckSend => {
                let mut request = [0u8; FOE_HEADER];

                Self::header(FoeOpCode::Ack, self.rx_expected_packet_no, &mut request);

                if self.rx_last_packet {
                    // Nothing follows the final ACK
                    self.exchange.start_write_only(MailboxType::Foe, &request);
                } else {
                    self.rx_expected_packet_no += 1;
                    self.exchange
                        .start(Some((MailboxType::Foe, &request)), MailboxType::Foe);
                }

                self.state = if self.rx_last_packet {
                    FoeState::WriteAck // reuse: await write-only completion
                } else {
                    FoeState::DataReceive
                };

                FoePoll::Pending
            }
        }
    }

    fn handle_write_ack(&mut self) -> FoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        // Write-only final ACK completion has an empty response
        if response.is_empty() && self.rx_last_packet {
            self.state = FoeState::Done;

            return FoePoll::Done;
        }

        if response.len() < FOE_HEADER {
            return self.fail(Error::Foe(FoeError::ResponseInvalid));
        }

        let field = u32::from_le_bytes([response[2], response[3], response[4], response[5]]);

        match FoeOpCode::unpack_from_slice(&response[..1]) {
            Ok(FoeOpCode::Ack) => {
                if self.tx_last_packet {
                    self.state = FoeState::Done;

                    return FoePoll::Done;
                }

                self.tx_packet_no += 1;
                self.state = FoeState::DataSend;

                FoePoll::Pending
            }
            Ok(FoeOpCode::Busy) => {
                // Retransmit the fragment in flight
                fmt::debug!("FoE write: slave busy, retransmitting packet {}", self.tx_packet_no);

                if self.tx_packet_no > 0 {
                    self.offset -= self.last_fragment_len;
                    self.progress.packets -= 1;
                    self.progress.bytes = self.offset;
                    self.tx_last_packet = false;
                    self.state = FoeState::DataSend;
                } else {
                    self.state = FoeState::WriteRequest;
                }

                FoePoll::Pending
            }
            Ok(FoeOpCode::Err) => {
                fmt::error!("FoE write rejected: error {:#010x}", field);

                self.fail(Error::Foe(FoeError::Error(field)))
            }
            Ok(other) => self.fail(Error::Foe(FoeError::OpCode(other as u8))),
            Err(_) => self.fail(Error::Foe(FoeError::OpCode(response[0]))),
        }
    }

    fn handle_data(&mut self, mbx: &mut MailboxRuntime) -> FoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        if response.len() < FOE_HEADER {
            return self.fail(Error::Foe(FoeError::ResponseInvalid));
        }

        let opcode = response[0];

        match FoeOpCode::unpack_from_slice(&response[..1]) {
            Ok(FoeOpCode::Data) => {}
            Ok(FoeOpCode::Err) => {
                let code =
                    u32::from_le_bytes([response[2], response[3], response[4], response[5]]);

                fmt::error!("FoE read failed: error {:#010x}", code);

                return self.fail(Error::Foe(FoeError::Error(code)));
            }
            Ok(FoeOpCode::Busy) => {
                // Keep waiting for the data
                self.exchange.start_read(MailboxType::Foe);

                return FoePoll::Pending;
            }
            _ => return self.fail(Error::Foe(FoeError::OpCode(opcode))),
        }

        let packet_no = u32::from(u16::from_le_bytes([response[2], response[3]]));

        if packet_no != self.rx_expected_packet_no {
            fmt::error!(
                "FoE read: expected packet {}, received {}",
                self.rx_expected_packet_no,
                packet_no
            );

            return self.fail(Error::Foe(FoeError::WrongPacket {
                expected: self.rx_expected_packet_no,
                received: packet_no,
            }));
        }

        let payload = &response[FOE_HEADER..];

        // A fragment shorter than a full mailbox marks the end of the file
        let full_fragment = mbx.tx_data_size().saturating_sub(FOE_HEADER);

        self.rx_last_packet = payload.len() < full_fragment;

        self.progress.packets += 1;

        if self.data.extend_from_slice(payload).is_err() {
            // Buffer full: hold the ACK and hand the buffered bytes to the
            // application for incremental streaming
            let take = self.data.capacity() - self.data.len();

            let _ = self.data.extend_from_slice(&payload[..take]);

            fmt::debug!(
                "FoE read: buffer full after {} bytes, suspending",
                self.progress.bytes + payload.len()
            );

            self.progress.bytes += payload.len();
            self.state = FoeState::Ready;

            return FoePoll::Suspended;
        }

        self.progress.bytes += payload.len();

        self.state = FoeState::AckSend;

        FoePoll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout() {
        let mut buf = [0u8; 6];

        FoeFsm::header(FoeOpCode::Data, 0x0000_0102, &mut buf);

        assert_eq!(buf, [0x03, 0x00, 0x02, 0x01, 0x00, 0x00]);
    }

    #[test]
    fn opcode_decode() {
        assert_eq!(FoeOpCode::unpack_from_slice(&[4]), Ok(FoeOpCode::Ack));
        assert!(FoeOpCode::unpack_from_slice(&[9]).is_err());
    }

    #[test]
    fn write_starts_with_wrq() {
        let mut fsm = FoeFsm::default();

        fsm.start_write("firmware.bin", &[0u8; 100]).unwrap();

        assert!(!fsm.is_idle());
        assert_eq!(fsm.progress().packets, 0);
    }

    #[test]
    fn filename_too_long() {
        let mut fsm = FoeFsm::default();

        let long = core::str::from_utf8(&[b'a'; 80]).unwrap();

        assert!(fsm.start_read(long).is_err());
    }
}
