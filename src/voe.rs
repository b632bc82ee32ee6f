//! Vendor specific over EtherCAT (VoE) pass-through.
//!
//! The master does not interpret VoE payloads; it prefixes writes with the 6
//! byte VoE header (32 bit vendor ID, 16 bit vendor type) and hands reads
//! back to the application with the header split off.

use crate::error::{Error, Item};
use crate::mailbox::{MailboxExchange, MailboxRuntime, MailboxType, MbxPoll};
use crate::master::Timeouts;
use crate::pdu_loop::PduLoop;
use crate::MAX_SDO_DATA;

/// VoE header size.
pub const VOE_HEADER: usize = 6;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum VoeState {
    #[default]
    Idle,
    Write,
    WriteSent,
    Read,
    ReadWait,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum VoePoll {
    Pending,
    Done,
    Failed(Error),
}

/// One VoE send or receive in flight against one slave.
#[derive(Debug, Default)]
pub(crate) struct VoeFsm {
    state: VoeState,
    exchange: MailboxExchange,

    vendor_id: u32,
    vendor_type: u16,
    data: heapless::Vec<u8, MAX_SDO_DATA>,
    error: Option<Error>,
}

impl VoeFsm {
    pub fn is_idle(&self) -> bool {
        matches!(self.state, VoeState::Idle)
    }

    /// Received payload, VoE header stripped.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Vendor ID and type from the last received frame.
    pub fn vendor_header(&self) -> (u32, u16) {
        (self.vendor_id, self.vendor_type)
    }

    /// Begin sending `data` with the given vendor header.
    pub fn start_write(
        &mut self,
        vendor_id: u32,
        vendor_type: u16,
        data: &[u8],
    ) -> Result<(), Error> {
        self.data.clear();
        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(Item::Request))?;

        self.vendor_id = vendor_id;
        self.vendor_type = vendor_type;
        self.error = None;
        self.state = VoeState::Write;

        Ok(())
    }

    /// Begin waiting for a VoE frame from the slave.
    pub fn start_read(&mut self) {
        self.data.clear();
        self.error = None;
        self.state = VoeState::Read;
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop, mbx: &mut MailboxRuntime) {
        self.exchange.abort(pdu_loop, mbx);
        self.state = VoeState::Idle;
    }

    fn fail(&mut self, error: Error) -> VoePoll {
        self.state = VoeState::Failed;
        self.error = Some(error);

        VoePoll::Failed(error)
    }

    /// Advance by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        mbx: &mut MailboxRuntime,
        now: u64,
        timeouts: &Timeouts,
    ) -> VoePoll {
        match self.state {
            VoeState::Idle | VoeState::Done => VoePoll::Pending,
            VoeState::Failed => VoePoll::Failed(self.error.unwrap_or(Error::Internal)),

            VoeState::Write => {
                let mut request = [0u8; MAX_SDO_DATA + VOE_HEADER];

                request[..4].copy_from_slice(&self.vendor_id.to_le_bytes());
                request[4..6].copy_from_slice(&self.vendor_type.to_le_bytes());
                request[VOE_HEADER..VOE_HEADER + self.data.len()].copy_from_slice(&self.data);

                self.exchange.start_write_only(
                    MailboxType::VendorSpecific,
                    &request[..VOE_HEADER + self.data.len()],
                );
                self.state = VoeState::WriteSent;

                VoePoll::Pending
            }

            VoeState::WriteSent => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => VoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => {
                    self.state = VoeState::Done;

                    VoePoll::Done
                }
            },

            VoeState::Read => {
                self.exchange.start_read(MailboxType::VendorSpecific);
                self.state = VoeState::ReadWait;

                VoePoll::Pending
            }

            VoeState::ReadWait => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => VoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => {
                    let response = self.exchange.response();

                    if response.len() < VOE_HEADER {
                        return self.fail(Error::Mailbox(
                            crate::error::MailboxError::ResponseInvalid,
                        ));
                    }

                    self.vendor_id =
                        u32::from_le_bytes([response[0], response[1], response[2], response[3]]);
                    self.vendor_type = u16::from_le_bytes([response[4], response[5]]);

                    let payload: heapless::Vec<u8, MAX_SDO_DATA> =
                        match heapless::Vec::from_slice(&response[VOE_HEADER..]) {
                            Ok(payload) => payload,
                            Err(_) => return self.fail(Error::Capacity(Item::Request)),
                        };

                    self.data = payload;
                    self.state = VoeState::Done;

                    VoePoll::Done
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_prefixes_header() {
        let mut fsm = VoeFsm::default();

        fsm.start_write(0x0000_0002, 0x1234, &[0xaa, 0xbb]).unwrap();

        assert!(!fsm.is_idle());
        assert_eq!(fsm.vendor_header(), (0x0000_0002, 0x1234));
    }

    #[test]
    fn payload_too_large() {
        let mut fsm = VoeFsm::default();

        let big = [0u8; MAX_SDO_DATA + 1];

        assert!(fsm.start_write(2, 0, &big).is_err());
    }
}
