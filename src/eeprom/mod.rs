//! SII (EEPROM) access via the slave's register block at `0x0500`.
//!
//! One read operation fetches two words: write the word address to the
//! control/address registers, poll the busy flag, then read four data bytes.
//! The scan state machine composes these into identity probes and full image
//! sweeps.

pub mod cache;
pub mod types;

use crate::command::Command;
use crate::error::{EepromError, Error};
use crate::master::Timeouts;
use crate::pdu_loop::{PduHandle, PduLoop, PduPoll, PduQueue};
use crate::register::RegisterAddress;

/// Control word: trigger a read operation.
const CONTROL_READ: u16 = 0x0100;
/// Status bit: operation in progress.
const STATUS_BUSY: u16 = 0x8000;
/// Status bit: device missed an acknowledge or found no EEPROM.
const STATUS_NACK: u16 = 0x2000;

const RETRIES: u8 = 3;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum ReaderState {
    #[default]
    Idle,
    /// Write control word + word address.
    StartRead,
    AwaitStart,
    /// Read status + address + 4 data bytes in one go.
    Status,
    AwaitStatus,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SiiPoll {
    Pending,
    /// Two words of data available.
    Done([u8; 4]),
    Failed(Error),
}

/// Register-level SII word reader: one operation = two words.
#[derive(Debug, Default)]
pub(crate) struct SiiReader {
    state: ReaderState,
    pdu: Option<PduHandle>,
    word_offset: u16,
    value: [u8; 4],
    retries: u8,
    error: Option<Error>,
}

impl SiiReader {
    /// Begin reading the two words at `word_offset`.
    pub fn start(&mut self, word_offset: u16) {
        self.word_offset = word_offset;
        self.retries = 0;
        self.error = None;
        self.state = ReaderState::StartRead;
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop) {
        if let Some(handle) = self.pdu.take() {
            pdu_loop.release(handle);
        }

        self.state = ReaderState::Idle;
    }

    fn fail(&mut self, error: Error) -> SiiPoll {
        self.state = ReaderState::Failed;
        self.error = Some(error);

        SiiPoll::Failed(error)
    }

    fn retry(&mut self, error: Error) -> SiiPoll {
        self.retries += 1;

        if self.retries > RETRIES {
            return self.fail(error);
        }

        self.state = ReaderState::StartRead;

        SiiPoll::Pending
    }

    /// Advance by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        station_address: u16,
        now: u64,
        timeouts: &Timeouts,
    ) -> SiiPoll {
        match self.state {
            ReaderState::Idle => SiiPoll::Pending,
            ReaderState::Done => SiiPoll::Done(self.value),
            ReaderState::Failed => SiiPoll::Failed(self.error.unwrap_or(Error::Internal)),

            ReaderState::StartRead => {
                let mut request = [0u8; 4];

                request[..2].copy_from_slice(&CONTROL_READ.to_le_bytes());
                request[2..].copy_from_slice(&self.word_offset.to_le_bytes());

                match pdu_loop.request(
                    Command::fpwr(station_address, RegisterAddress::SiiControl.into()),
                    &request,
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = ReaderState::AwaitStart;

                        SiiPoll::Pending
                    }
                    Err(e) => self.fail(e),
                }
            }

            ReaderState::AwaitStart => {
                let Some(handle) = self.pdu else {
                    return self.fail(Error::Internal);
                };

                match pdu_loop.poll(handle, now, timeouts.pdu) {
                    Ok(PduPoll::Pending) => SiiPoll::Pending,
                    Ok(PduPoll::Ready { working_counter }) => {
                        pdu_loop.release(handle);
                        self.pdu = None;

                        if working_counter != 1 {
                            return self.retry(Error::WorkingCounter {
                                expected: 1,
                                received: working_counter,
                            });
                        }

                        self.state = ReaderState::Status;

                        SiiPoll::Pending
                    }
                    Ok(PduPoll::TimedOut) => {
                        pdu_loop.release(handle);
                        self.pdu = None;

                        self.retry(Error::Timeout)
                    }
                    Err(e) => {
                        self.pdu = None;

                        self.fail(e)
                    }
                }
            }

            ReaderState::Status => {
                // Status word, address word(s) and 4 data bytes in one read
                match pdu_loop.request_read(
                    Command::fprd(station_address, RegisterAddress::SiiControl.into()),
                    10,
                    PduQueue::Ext,
                ) {
                    Ok(handle) => {
                        self.pdu = Some(handle);
                        self.state = ReaderState::AwaitStatus;

                        SiiPoll::Pending
                    }
                    Err(e) => self.fail(e),
                }
            }

            ReaderState::AwaitStatus => {
                let Some(handle) = self.pdu else {
                    return self.fail(Error::Internal);
                };

                match pdu_loop.poll(handle, now, timeouts.pdu) {
                    Ok(PduPoll::Pending) => SiiPoll::Pending,
                    Ok(PduPoll::Ready { working_counter }) => {
                        let mut data = [0u8; 10];

                        if let Ok(raw) = pdu_loop.data(handle) {
                            data[..raw.len().min(10)].copy_from_slice(&raw[..raw.len().min(10)]);
                        }

                        pdu_loop.release(handle);
                        self.pdu = None;

                        if working_counter != 1 {
                            return self.retry(Error::WorkingCounter {
                                expected: 1,
                                received: working_counter,
                            });
                        }

                        let status = u16::from_le_bytes([data[0], data[1]]);

                        if status & STATUS_BUSY != 0 {
                            // Still reading; poll again
                            self.state = ReaderState::Status;

                            return SiiPoll::Pending;
                        }

                        if status & STATUS_NACK != 0 {
                            return self
                                .retry(Error::Eeprom(EepromError::NoAcknowledge));
                        }

                        self.value.copy_from_slice(&data[6..10]);
                        self.state = ReaderState::Done;

                        SiiPoll::Done(self.value)
                    }
                    Ok(PduPoll::TimedOut) => {
                        pdu_loop.release(handle);
                        self.pdu = None;

                        self.retry(Error::Timeout)
                    }
                    Err(e) => {
                        self.pdu = None;

                        self.fail(e)
                    }
                }
            }
        }
    }
}
