//! The CoE state machine: SDO download (expedited/normal), SDO upload
//! (expedited/normal/segmented) and the SDO information (object dictionary)
//! service, all running over one [`MailboxExchange`].

use super::{
    CoeHeader, CoeService, Emergency, SdoFlags, SdoHeader, SdoInfoHeader, SdoInfoOpCode,
    SegmentSdoHeader,
};
use crate::coe::abort_code::CoeAbortCode;
use crate::error::{Error, Item, MailboxError};
use crate::fmt;
use crate::mailbox::{MailboxExchange, MailboxRuntime, MailboxType, MbxPoll};
use crate::master::Timeouts;
use crate::pdu_loop::PduLoop;
use crate::MAX_SDO_DATA;
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireWrite};

/// Maximum number of object indices retained from a dictionary scan. The
/// object and entry *counts* keep counting past this.
pub const MAX_DICT_OBJECTS: usize = 128;

/// Invalid-looking responses are re-awaited this many times before the
/// transfer fails; emergencies and foreign mailbox traffic can interleave
/// with a pending SDO operation.
const REREAD_LIMIT: u8 = 3;

/// Outcome of a dictionary scan.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DictionarySummary {
    /// Number of objects the slave advertised.
    pub object_count: u16,
    /// Total entry descriptions read.
    pub entry_count: u32,
    /// The first [`MAX_DICT_OBJECTS`] object indices.
    pub indices: heapless::Vec<u16, MAX_DICT_OBJECTS>,
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum CoeState {
    #[default]
    Idle,
    /// Issue the initiate download request.
    Download,
    DownloadResponse,
    /// Issue the initiate upload request.
    Upload,
    UploadResponse,
    /// Issue an upload segment request with the current toggle.
    SegmentRequest,
    SegmentResponse,
    /// Issue a Get OD List request.
    OdList,
    OdListResponse,
    /// Issue a Get Object Description request for the next listed index.
    ObjDesc,
    ObjDescResponse,
    /// Issue a Get Entry Description request for the next subindex.
    EntryDesc,
    EntryDescResponse,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum CoePoll {
    Pending,
    Done,
    Failed(Error),
}

/// One CoE operation in flight against one slave.
#[derive(Debug, Default)]
pub(crate) struct CoeFsm {
    state: CoeState,
    exchange: MailboxExchange,

    index: u16,
    sub_index: u8,
    complete_access: bool,

    /// Download payload, or accumulated upload data.
    data: heapless::Vec<u8, MAX_SDO_DATA>,
    /// Complete size advertised by a normal upload response.
    complete_size: usize,
    toggle: bool,
    rereads: u8,

    /// Abort code from the slave, if the transfer was aborted.
    abort_code: Option<CoeAbortCode>,
    error: Option<Error>,

    // Dictionary scan context
    dict: DictionarySummary,
    dict_cursor: usize,
    dict_first_fragment: bool,
    max_sub_index: u8,
    entry_sub: u8,
}

impl CoeFsm {
    pub fn is_idle(&self) -> bool {
        matches!(self.state, CoeState::Idle)
    }

    /// Uploaded data after a successful upload.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn abort_code(&self) -> Option<CoeAbortCode> {
        self.abort_code
    }

    pub fn dictionary(&self) -> &DictionarySummary {
        &self.dict
    }

    fn reset(&mut self, index: u16, sub_index: u8, complete_access: bool) {
        self.data.clear();
        self.index = index;
        self.sub_index = sub_index;
        self.complete_access = complete_access;
        self.complete_size = 0;
        self.toggle = false;
        self.rereads = 0;
        self.abort_code = None;
        self.error = None;
        self.dict = DictionarySummary::default();
        self.dict_cursor = 0;
        self.dict_first_fragment = true;
        self.max_sub_index = 0;
        self.entry_sub = 0;
    }

    /// Begin an SDO download of `data` to `index:sub_index`.
    pub fn start_download(
        &mut self,
        index: u16,
        sub_index: u8,
        complete_access: bool,
        data: &[u8],
    ) -> Result<(), Error> {
        if data.is_empty() {
            return Err(Error::InvalidInput);
        }

        self.reset(index, sub_index, complete_access);

        self.data
            .extend_from_slice(data)
            .map_err(|_| Error::Capacity(Item::Request))?;

        self.state = CoeState::Download;

        Ok(())
    }

    /// Begin an SDO upload from `index:sub_index`.
    pub fn start_upload(&mut self, index: u16, sub_index: u8, complete_access: bool) {
        self.reset(index, sub_index, complete_access);

        self.state = CoeState::Upload;
    }

    /// Begin an object dictionary scan.
    pub fn start_dictionary(&mut self) {
        self.reset(0, 0, false);

        self.state = CoeState::OdList;
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop, mbx: &mut MailboxRuntime) {
        self.exchange.abort(pdu_loop, mbx);
        self.state = CoeState::Idle;
    }

    fn fail(&mut self, error: Error) -> CoePoll {
        self.state = CoeState::Failed;
        self.error = Some(error);

        CoePoll::Failed(error)
    }

    /// Advance by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        mbx: &mut MailboxRuntime,
        now: u64,
        timeouts: &Timeouts,
    ) -> CoePoll {
        match self.state {
            CoeState::Idle | CoeState::Done => CoePoll::Pending,
            CoeState::Failed => CoePoll::Failed(self.error.unwrap_or(Error::Internal)),

            CoeState::Download => {
                let mut request = [0u8; MAX_SDO_DATA + 10];

                let expedited = self.data.len() <= 4;

                CoeHeader {
                    service: CoeService::SdoRequest,
                }
                .pack_to_slice_unchecked(&mut request);

                let total = if expedited {
                    SdoHeader {
                        flags: SdoFlags {
                            size_indicator: true,
                            expedited_transfer: true,
                            size: 4 - self.data.len() as u8,
                            complete_access: self.complete_access,
                            command: SdoFlags::DOWNLOAD_REQUEST,
                        },
                        index: self.index,
                        sub_index: self.sub_index,
                    }
                    .pack_to_slice_unchecked(&mut request[2..]);

                    request[6..6 + self.data.len()].copy_from_slice(&self.data);

                    10
                } else {
                    // A normal download must fit a single mailbox frame;
                    // segmented downloads are not supported.
                    if 10 + self.data.len() > mbx.rx_data_size() {
                        fmt::error!(
                            "SDO download {:#06x}:{} of {} bytes exceeds mailbox capacity of {}; segmented download is not supported",
                            self.index,
                            self.sub_index,
                            self.data.len(),
                            mbx.rx_data_size().saturating_sub(10),
                        );

                        return self.fail(Error::Capacity(Item::Mailbox));
                    }

                    SdoHeader {
                        flags: SdoFlags {
                            size_indicator: true,
                            expedited_transfer: false,
                            size: 0,
                            complete_access: self.complete_access,
                            command: SdoFlags::DOWNLOAD_REQUEST,
                        },
                        index: self.index,
                        sub_index: self.sub_index,
                    }
                    .pack_to_slice_unchecked(&mut request[2..]);

                    (self.data.len() as u32).pack_to_slice_unchecked(&mut request[6..]);
                    request[10..10 + self.data.len()].copy_from_slice(&self.data);

                    10 + self.data.len()
                };

                self.exchange
                    .start(Some((MailboxType::Coe, &request[..total])), MailboxType::Coe);
                self.state = CoeState::DownloadResponse;

                CoePoll::Pending
            }

            CoeState::DownloadResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => CoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_download_response(mbx),
            },

            CoeState::Upload => {
                let mut request = [0u8; 10];

                CoeHeader {
                    service: CoeService::SdoRequest,
                }
                .pack_to_slice_unchecked(&mut request);

                SdoHeader {
                    flags: SdoFlags {
                        size_indicator: false,
                        expedited_transfer: false,
                        size: 0,
                        complete_access: self.complete_access,
                        command: SdoFlags::UPLOAD_REQUEST,
                    },
                    index: self.index,
                    sub_index: self.sub_index,
                }
                .pack_to_slice_unchecked(&mut request[2..]);

                self.exchange
                    .start(Some((MailboxType::Coe, &request)), MailboxType::Coe);
                self.state = CoeState::UploadResponse;

                CoePoll::Pending
            }

            CoeState::UploadResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => CoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_upload_response(mbx),
            },

            CoeState::SegmentRequest => {
                let mut request = [0u8; 3];

                CoeHeader {
                    service: CoeService::SdoRequest,
                }
                .pack_to_slice_unchecked(&mut request);

                SegmentSdoHeader {
                    is_last_segment: false,
                    segment_data_size: 0,
                    toggle: self.toggle,
                    command: SegmentSdoHeader::UPLOAD_SEGMENT_REQUEST,
                }
                .pack_to_slice_unchecked(&mut request[2..]);

                self.exchange
                    .start(Some((MailboxType::Coe, &request)), MailboxType::Coe);
                self.state = CoeState::SegmentResponse;

                CoePoll::Pending
            }

            CoeState::SegmentResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => CoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_segment_response(mbx),
            },

            CoeState::OdList => {
                let mut request = [0u8; 8];

                CoeHeader {
                    service: CoeService::SdoInformation,
                }
                .pack_to_slice_unchecked(&mut request);

                SdoInfoHeader {
                    op_code: SdoInfoOpCode::GetObjectDescriptionListRequest,
                    incomplete: false,
                    fragments_left: 0,
                }
                .pack_to_slice_unchecked(&mut request[2..]);

                // List type 0x01: all objects
                1u16.pack_to_slice_unchecked(&mut request[6..]);

                self.dict_first_fragment = true;

                self.exchange
                    .start(Some((MailboxType::Coe, &request)), MailboxType::Coe);
                self.state = CoeState::OdListResponse;

                CoePoll::Pending
            }

            CoeState::OdListResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => CoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_od_list_response(mbx),
            },

            CoeState::ObjDesc => {
                if self.dict_cursor >= self.dict.indices.len() {
                    self.state = CoeState::Done;

                    return CoePoll::Done;
                }

                let index = self.dict.indices[self.dict_cursor];

                let mut request = [0u8; 8];

                CoeHeader {
                    service: CoeService::SdoInformation,
                }
                .pack_to_slice_unchecked(&mut request);

                SdoInfoHeader {
                    op_code: SdoInfoOpCode::GetObjectDescriptionRequest,
                    incomplete: false,
                    fragments_left: 0,
                }
                .pack_to_slice_unchecked(&mut request[2..]);

                index.pack_to_slice_unchecked(&mut request[6..]);

                self.exchange
                    .start(Some((MailboxType::Coe, &request)), MailboxType::Coe);
                self.state = CoeState::ObjDescResponse;

                CoePoll::Pending
            }

            CoeState::ObjDescResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => CoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_obj_desc_response(mbx),
            },

            CoeState::EntryDesc => {
                let index = self.dict.indices[self.dict_cursor];

                let mut request = [0u8; 10];

                CoeHeader {
                    service: CoeService::SdoInformation,
                }
                .pack_to_slice_unchecked(&mut request);

                SdoInfoHeader {
                    op_code: SdoInfoOpCode::GetEntryDescriptionRequest,
                    incomplete: false,
                    fragments_left: 0,
                }
                .pack_to_slice_unchecked(&mut request[2..]);

                index.pack_to_slice_unchecked(&mut request[6..]);
                request[8] = self.entry_sub;
                // Value info: basic description only
                request[9] = 0x00;

                self.exchange
                    .start(Some((MailboxType::Coe, &request)), MailboxType::Coe);
                self.state = CoeState::EntryDescResponse;

                CoePoll::Pending
            }

            CoeState::EntryDescResponse => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => CoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => self.handle_entry_desc_response(mbx),
            },
        }
    }

    /// Check a CoE response for services that interleave with the pending
    /// operation. Returns `None` if the response was consumed and the
    /// exchange restarted.
    fn filter_response(&mut self, mbx: &mut MailboxRuntime) -> Option<CoeHeader> {
        let response = self.exchange.response();

        let Ok(header) = CoeHeader::unpack_from_slice(response) else {
            self.reread(mbx);

            return None;
        };

        if header.service == CoeService::Emergency {
            match Emergency::unpack_from_slice(&response[2..]) {
                Ok(emergency) => fmt::warn!(
                    "Slave {:#06x} emergency: code {:#06x}, register {:#04x}, data {:?}",
                    mbx.station_address,
                    emergency.error_code,
                    emergency.error_register,
                    emergency.data
                ),
                Err(_) => fmt::warn!(
                    "Slave {:#06x} sent a malformed emergency message",
                    mbx.station_address
                ),
            }

            // The pending operation is still outstanding
            self.exchange.start_read(MailboxType::Coe);

            return None;
        }

        Some(header)
    }

    /// Re-await a response after receiving something that does not parse as
    /// the expected reply.
    fn reread(&mut self, mbx: &mut MailboxRuntime) {
        self.rereads += 1;

        if self.rereads > REREAD_LIMIT {
            let _ = self.fail(Error::Mailbox(MailboxError::ResponseInvalid));
        } else {
            fmt::debug!(
                "Slave {:#06x}: unexpected CoE response, re-reading ({}/{})",
                mbx.station_address,
                self.rereads,
                REREAD_LIMIT
            );

            self.exchange.start_read(MailboxType::Coe);
        }
    }

    /// Abort replies carry their code at bytes 6..10.
    fn check_abort(&mut self, response: &[u8]) -> bool {
        let Ok(sdo) = SdoHeader::unpack_from_slice(&response[2..]) else {
            return false;
        };

        if sdo.flags.command != SdoFlags::ABORT_REQUEST {
            return false;
        }

        let code = response
            .get(6..10)
            .and_then(|raw| u32::unpack_from_slice(raw).ok())
            .map(CoeAbortCode::from)
            .unwrap_or(CoeAbortCode::Unknown(0));

        fmt::error!(
            "SDO {:#06x}:{} aborted: {}",
            self.index,
            self.sub_index,
            code
        );

        self.abort_code = Some(code);

        let _ = self.fail(Error::Mailbox(MailboxError::Aborted {
            code,
            index: self.index,
            sub_index: self.sub_index,
        }));

        true
    }

    fn handle_download_response(&mut self, mbx: &mut MailboxRuntime) -> CoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        let Some(header) = self.filter_response(mbx) else {
            return self.pending_or_failed();
        };

        if response.len() < 6 || header.service != CoeService::SdoResponse {
            if self.check_abort(&response) {
                return CoePoll::Failed(self.error.unwrap_or(Error::Internal));
            }

            self.reread(mbx);

            return self.pending_or_failed();
        }

        if self.check_abort(&response) {
            return CoePoll::Failed(self.error.unwrap_or(Error::Internal));
        }

        let Ok(sdo) = SdoHeader::unpack_from_slice(&response[2..]) else {
            self.reread(mbx);

            return self.pending_or_failed();
        };

        if sdo.flags.command != SdoFlags::DOWNLOAD_RESPONSE
            || sdo.index != self.index
            || sdo.sub_index != self.sub_index
        {
            self.reread(mbx);

            return self.pending_or_failed();
        }

        self.state = CoeState::Done;

        CoePoll::Done
    }

    fn handle_upload_response(&mut self, mbx: &mut MailboxRuntime) -> CoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        let Some(header) = self.filter_response(mbx) else {
            return self.pending_or_failed();
        };

        if self.check_abort(&response) {
            return CoePoll::Failed(self.error.unwrap_or(Error::Internal));
        }

        let Ok(sdo) = SdoHeader::unpack_from_slice(&response[2..]) else {
            self.reread(mbx);

            return self.pending_or_failed();
        };

        if header.service != CoeService::SdoResponse
            || sdo.flags.command != SdoFlags::UPLOAD_RESPONSE
            || sdo.index != self.index
            || sdo.sub_index != self.sub_index
        {
            self.reread(mbx);

            return self.pending_or_failed();
        }

        if sdo.flags.expedited_transfer {
            let size = if sdo.flags.size_indicator {
                4 - usize::from(sdo.flags.size)
            } else {
                4
            };

            let Some(data) = response.get(6..6 + size) else {
                return self.fail(Error::Mailbox(MailboxError::ResponseInvalid));
            };

            // Capacity is MAX_SDO_DATA >= 4
            let _ = self.data.extend_from_slice(data);

            self.state = CoeState::Done;

            return CoePoll::Done;
        }

        // Normal transfer: 4 byte complete size, then the initial fragment
        let Some(raw_size) = response.get(6..10) else {
            return self.fail(Error::Mailbox(MailboxError::ResponseInvalid));
        };

        self.complete_size = u32::unpack_from_slice(raw_size).unwrap_or(0) as usize;

        if self.complete_size == 0 {
            return self.fail(Error::Mailbox(MailboxError::ResponseInvalid));
        }

        if self.complete_size > MAX_SDO_DATA {
            return self.fail(Error::Capacity(Item::Request));
        }

        let fragment = &response[10.min(response.len())..];
        let take = fragment.len().min(self.complete_size);

        let _ = self.data.extend_from_slice(&fragment[..take]);

        if self.data.len() < self.complete_size {
            self.toggle = false;
            self.state = CoeState::SegmentRequest;

            return CoePoll::Pending;
        }

        self.finish_upload()
    }

    fn handle_segment_response(&mut self, mbx: &mut MailboxRuntime) -> CoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        let Some(header) = self.filter_response(mbx) else {
            return self.pending_or_failed();
        };

        if self.check_abort(&response) {
            return CoePoll::Failed(self.error.unwrap_or(Error::Internal));
        }

        let Ok(segment) = SegmentSdoHeader::unpack_from_slice(&response[2.min(response.len())..])
        else {
            self.reread(mbx);

            return self.pending_or_failed();
        };

        if header.service != CoeService::SdoResponse
            || segment.command != SegmentSdoHeader::UPLOAD_SEGMENT_RESPONSE
        {
            self.reread(mbx);

            return self.pending_or_failed();
        }

        if segment.toggle != self.toggle {
            fmt::error!(
                "SDO upload {:#06x}:{} segment toggle mismatch",
                self.index,
                self.sub_index
            );

            return self.fail(Error::Mailbox(MailboxError::ResponseInvalid));
        }

        // Segment data follows the 3 header bytes. Responses are padded to a
        // minimum 7 byte data area; for those, `segment_data_size` holds the
        // number of unused trailing bytes.
        let data_size = if response.len() > 10 {
            response.len() - 3
        } else {
            7usize.saturating_sub(usize::from(segment.segment_data_size))
        };

        let Some(data) = response.get(3..3 + data_size) else {
            return self.fail(Error::Mailbox(MailboxError::ResponseInvalid));
        };

        let take = data
            .len()
            .min(self.complete_size.saturating_sub(self.data.len()));

        let _ = self.data.extend_from_slice(&data[..take]);

        if segment.is_last_segment {
            return self.finish_upload();
        }

        self.toggle = !self.toggle;
        self.state = CoeState::SegmentRequest;

        CoePoll::Pending
    }

    fn finish_upload(&mut self) -> CoePoll {
        if self.data.len() != self.complete_size {
            fmt::warn!(
                "SDO upload {:#06x}:{}: assembled size {} does not match advertised complete size {}",
                self.index,
                self.sub_index,
                self.data.len(),
                self.complete_size
            );
        }

        self.state = CoeState::Done;

        CoePoll::Done
    }

    fn handle_od_list_response(&mut self, mbx: &mut MailboxRuntime) -> CoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        let Some(header) = self.filter_response(mbx) else {
            return self.pending_or_failed();
        };

        let Ok(info) = SdoInfoHeader::unpack_from_slice(&response[2.min(response.len())..]) else {
            self.reread(mbx);

            return self.pending_or_failed();
        };

        if header.service != CoeService::SdoInformation {
            self.reread(mbx);

            return self.pending_or_failed();
        }

        if info.op_code == SdoInfoOpCode::SdoInfoErrorRequest {
            return self.fail(Error::Mailbox(MailboxError::ResponseInvalid));
        }

        if info.op_code != SdoInfoOpCode::GetObjectDescriptionListResponse {
            self.reread(mbx);

            return self.pending_or_failed();
        }

        // The first fragment repeats the list type before the indices
        let indices_at = if self.dict_first_fragment { 8 } else { 6 };

        for chunk in response[indices_at.min(response.len())..].chunks_exact(2) {
            self.dict.object_count += 1;

            let index = u16::from_le_bytes([chunk[0], chunk[1]]);

            if self.dict.indices.push(index).is_err() {
                // Keep counting, stop retaining
            }
        }

        self.dict_first_fragment = false;

        if info.incomplete {
            fmt::debug!(
                "OD list incomplete, {} fragments left",
                info.fragments_left
            );

            // Remaining fragments arrive without a new request
            self.exchange.start_read(MailboxType::Coe);
            self.state = CoeState::OdListResponse;

            return CoePoll::Pending;
        }

        fmt::debug!("OD list: {} objects", self.dict.object_count);

        self.dict_cursor = 0;
        self.state = CoeState::ObjDesc;

        CoePoll::Pending
    }

    fn handle_obj_desc_response(&mut self, mbx: &mut MailboxRuntime) -> CoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        let Some(header) = self.filter_response(mbx) else {
            return self.pending_or_failed();
        };

        let Ok(info) = SdoInfoHeader::unpack_from_slice(&response[2.min(response.len())..]) else {
            self.reread(mbx);

            return self.pending_or_failed();
        };

        if header.service != CoeService::SdoInformation
            || info.op_code != SdoInfoOpCode::GetObjectDescriptionResponse
            || response.len() < 12
        {
            self.reread(mbx);

            return self.pending_or_failed();
        }

        self.max_sub_index = response[10];
        self.entry_sub = 0;
        self.rereads = 0;
        self.state = CoeState::EntryDesc;

        CoePoll::Pending
    }

    fn handle_entry_desc_response(&mut self, mbx: &mut MailboxRuntime) -> CoePoll {
        let response: heapless::Vec<u8, { crate::MAX_MAILBOX_DATA }> =
            heapless::Vec::from_slice(self.exchange.response()).unwrap_or_default();

        let Some(header) = self.filter_response(mbx) else {
            return self.pending_or_failed();
        };

        let Ok(info) = SdoInfoHeader::unpack_from_slice(&response[2.min(response.len())..]) else {
            self.reread(mbx);

            return self.pending_or_failed();
        };

        if header.service != CoeService::SdoInformation {
            self.reread(mbx);

            return self.pending_or_failed();
        }

        // Slaves commonly answer "entry does not exist" for gaps in the
        // subindex range; skip to the next one
        if info.op_code == SdoInfoOpCode::GetEntryDescriptionResponse {
            self.dict.entry_count += 1;
        }

        self.rereads = 0;

        if self.entry_sub < self.max_sub_index {
            self.entry_sub += 1;
            self.state = CoeState::EntryDesc;
        } else {
            self.dict_cursor += 1;
            self.state = CoeState::ObjDesc;
        }

        CoePoll::Pending
    }

    fn pending_or_failed(&mut self) -> CoePoll {
        if matches!(self.state, CoeState::Failed) {
            CoePoll::Failed(self.error.unwrap_or(Error::Internal))
        } else {
            CoePoll::Pending
        }
    }
}
