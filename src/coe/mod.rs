//! CAN application protocol over EtherCAT (CoE): SDO transfers and the
//! object dictionary information service.

pub mod abort_code;
pub(crate) mod fsm;

pub use fsm::{DictionarySummary, MAX_DICT_OBJECTS};

/// CoE header prefixed to every CoE mailbox payload.
///
/// Defined in ETG1000.6 5.6.1 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[wire(bytes = 2)]
pub struct CoeHeader {
    // number: u9, reserved: u3
    #[wire(pre_skip = 12, bits = 4)]
    pub service: CoeService,
}

/// CoE service number.
///
/// Defined in ETG1000.6 Table 29 – CoE elements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(test, derive(arbitrary::Arbitrary))]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum CoeService {
    /// Emergency
    Emergency = 0x01,
    /// SDO Request
    SdoRequest = 0x02,
    /// SDO Response
    SdoResponse = 0x03,
    /// TxPDO
    TxPdo = 0x04,
    /// RxPDO
    RxPdo = 0x05,
    /// TxPDO remote request
    TxPdoRemoteRequest = 0x06,
    /// RxPDO remote request
    RxPdoRemoteRequest = 0x07,
    /// SDO Information
    SdoInformation = 0x08,
}

/// The flags byte of an initiate SDO request/response.
///
/// Defined in ETG1000.6 Section 5.6.2.1.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct SdoFlags {
    #[wire(bits = 1)]
    pub size_indicator: bool,
    #[wire(bits = 1)]
    pub expedited_transfer: bool,
    /// For an expedited transfer: `4 - data length`, i.e. the number of
    /// padding bytes.
    #[wire(bits = 2)]
    pub size: u8,
    #[wire(bits = 1)]
    pub complete_access: bool,
    #[wire(bits = 3)]
    pub command: u8,
}

impl SdoFlags {
    pub const DOWNLOAD_REQUEST: u8 = 0x01;
    pub const DOWNLOAD_RESPONSE: u8 = 0x03;
    pub const UPLOAD_REQUEST: u8 = 0x02;
    pub const UPLOAD_RESPONSE: u8 = 0x02;
    pub const ABORT_REQUEST: u8 = 0x04;
}

/// The initiate SDO header: flags, object index, subindex.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub struct SdoHeader {
    #[wire(bytes = 1)]
    pub flags: SdoFlags,
    #[wire(bytes = 2)]
    pub index: u16,
    #[wire(bytes = 1)]
    pub sub_index: u8,
}

/// The single byte header of an upload segment request/response.
///
/// Defined in ETG1000.6 5.6.2.3.1.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 1)]
pub struct SegmentSdoHeader {
    #[wire(bits = 1)]
    pub is_last_segment: bool,
    /// In a response with the minimum 7 byte segment data area: the number of
    /// unused trailing bytes.
    #[wire(bits = 3)]
    pub segment_data_size: u8,
    #[wire(bits = 1)]
    pub toggle: bool,
    #[wire(bits = 3)]
    pub command: u8,
}

impl SegmentSdoHeader {
    pub const UPLOAD_SEGMENT_REQUEST: u8 = 0x03;
    pub const UPLOAD_SEGMENT_RESPONSE: u8 = 0x00;
}

/// SDO information service header, following the CoE header.
///
/// Defined in ETG1000.6 5.6.3.2.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[wire(bytes = 4)]
pub struct SdoInfoHeader {
    #[wire(bits = 7)]
    pub op_code: SdoInfoOpCode,
    #[wire(bits = 1)]
    pub incomplete: bool,
    // reserved byte
    #[wire(pre_skip = 8, bytes = 2)]
    pub fragments_left: u16,
}

/// SDO information service operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[repr(u8)]
pub enum SdoInfoOpCode {
    GetObjectDescriptionListRequest = 0x01,
    GetObjectDescriptionListResponse = 0x02,
    GetObjectDescriptionRequest = 0x03,
    GetObjectDescriptionResponse = 0x04,
    GetEntryDescriptionRequest = 0x05,
    GetEntryDescriptionResponse = 0x06,
    SdoInfoErrorRequest = 0x07,
}

/// An emergency message pushed by a slave instead of an SDO response.
///
/// ETG1000.6 5.6.4.1.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireRead)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 8)]
pub struct Emergency {
    #[wire(bytes = 2)]
    pub error_code: u16,
    #[wire(bytes = 1)]
    pub error_register: u8,
    #[wire(bytes = 5)]
    pub data: [u8; 5],
}

/// CoE communication area: object index of the first sync manager PDO assign
/// object (`0x1c10` for SM0).
pub const SDO_PDO_ASSIGN_BASE: u16 = 0x1c10;

/// CoE communication area: sync manager communication type object.
pub const SDO_SM_COMM_TYPE: u16 = 0x1c00;
