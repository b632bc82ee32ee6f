//! Error types for the master core.

pub use crate::coe::abort_code::CoeAbortCode;
use crate::al_status_code::AlStatusCode;
use crate::mailbox::MailboxErrorCode;

/// Top level error.
///
/// Where the classic C master API surfaces a POSIX errno, the matching code is
/// noted on each variant so ports of existing applications can map failures
/// one to one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// A low level error occurred when producing or consuming a PDU (`EIO`).
    Pdu(PduError),
    /// A working counter (WKC) error was encountered (`EIO`).
    WorkingCounter {
        /// The expected working counter value.
        expected: u16,
        /// The actual value received.
        received: u16,
    },
    /// Something timed out (`ETIMEDOUT`).
    Timeout,
    /// An EEPROM (SII) error was encountered.
    Eeprom(EepromError),
    /// A mailbox error was encountered.
    Mailbox(MailboxError),
    /// A FoE transfer failed.
    Foe(crate::foe::FoeError),
    /// An SoE operation failed.
    Soe(crate::soe::SoeError),
    /// An EoE operation failed: the slave returned this nonzero vendor
    /// defined result code.
    Eoe(u16),
    /// A fixed size list is full (`ENOMEM`/`ENOSPC`).
    Capacity(Item),
    /// An item in a list could not be found (`ENOENT`).
    NotFound {
        /// Item kind.
        item: Item,
        /// An index into a list of items.
        index: Option<usize>,
    },
    /// An item with the same identity already exists (`EEXIST`).
    Exists(Item),
    /// An argument is out of range or inconsistent (`EINVAL`).
    InvalidInput,
    /// A single PDU would not fit in an Ethernet frame (`EOVERFLOW`).
    PduTooLong {
        /// Requested payload length in bytes.
        len: usize,
        /// Largest usable payload length.
        max: usize,
    },
    /// A slave refused a state transition and reported this AL status code.
    StateTransition {
        /// The slave's configured station address.
        configured_address: u16,
        /// The code read from register `0x0134`.
        code: AlStatusCode,
    },
    /// The slave does not support the requested mailbox protocol
    /// (`EPROTONOSUPPORT`).
    ProtocolNotSupported,
    /// The operation cannot run right now, e.g. a request slot is still busy
    /// or the master is in the wrong phase (`EBUSY`/`EAGAIN`).
    Busy,
    /// Failed to send a frame over the network device.
    SendFrame,
    /// Failed to receive a frame properly.
    ReceiveFrame,
    /// The network link is down.
    LinkDown,
    /// An error occurred encoding or decoding an item.
    Wire(ethercrab_wire::WireError),
    /// A distributed clock error occurred.
    Dc(DcError),
    /// An internal error. This indicates a bug in the master itself.
    Internal,
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Pdu(e) => write!(f, "pdu: {}", e),
            Error::WorkingCounter { expected, received } => {
                write!(f, "working counter expected {}, got {}", expected, received)
            }
            Error::Timeout => f.write_str("timeout"),
            Error::Eeprom(e) => write!(f, "eeprom: {}", e),
            Error::Mailbox(e) => write!(f, "mailbox: {}", e),
            Error::Foe(e) => write!(f, "foe: {}", e),
            Error::Soe(e) => write!(f, "soe: {}", e),
            Error::Eoe(code) => write!(f, "eoe: result code {:#06x}", code),
            Error::Capacity(item) => write!(f, "not enough capacity for {:?}", item),
            Error::NotFound { item, index } => {
                write!(f, "item kind {:?} not found (index: {:?})", item, index)
            }
            Error::Exists(item) => write!(f, "item kind {:?} already exists", item),
            Error::InvalidInput => f.write_str("invalid argument"),
            Error::PduTooLong { len, max } => {
                write!(f, "PDU of {} bytes exceeds frame capacity of {}", len, max)
            }
            Error::StateTransition {
                configured_address,
                code,
            } => write!(
                f,
                "slave {:#06x} refused state transition: {}",
                configured_address, code
            ),
            Error::ProtocolNotSupported => f.write_str("mailbox protocol not supported by slave"),
            Error::Busy => f.write_str("resource busy"),
            Error::SendFrame => f.write_str("failed to send EtherCAT frame"),
            Error::ReceiveFrame => f.write_str("failed to receive an EtherCAT frame"),
            Error::LinkDown => f.write_str("network link is down"),
            Error::Wire(e) => write!(f, "wire encode/decode error: {}", e),
            Error::Dc(e) => write!(f, "distributed clock: {}", e),
            Error::Internal => f.write_str("internal error"),
        }
    }
}

/// The kind of item a capacity or lookup error refers to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Item {
    /// A slave device discovered on the ring.
    Slave,
    /// An application provided slave configuration.
    SlaveConfig,
    /// A process data domain.
    Domain,
    /// Fieldbus Memory Management Unit.
    Fmmu,
    /// Sync manager channel.
    SyncManager,
    /// Process Data Object.
    Pdo,
    /// A PDO entry.
    PdoEntry,
    /// An acyclic request slot.
    Request,
    /// A datagram descriptor in the preallocated pool.
    Datagram,
    /// A slave's mailbox.
    Mailbox,
    /// A cached SII image.
    SiiImage,
}

/// Low level PDU error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PduError {
    /// Failed to decode raw PDU data into a given data type.
    Decode,
    /// Something went wrong when encoding/decoding the raw Ethernet II frame.
    Ethernet,
    /// PDU data is too long to fit in a datagram descriptor.
    TooLong,
    /// No free descriptor in the datagram pool.
    ///
    /// This may be caused by sending too many concurrent PDUs, or by not
    /// calling `receive` often enough.
    NoDescriptor,
    /// All 256 PDU indices are reserved by in-flight datagrams.
    NoIndex,
    /// A PDU index was given that does not point to an in-flight datagram.
    InvalidIndex(u8),
    /// A received PDU failed validation against the sent one.
    Validation(PduValidationError),
    /// A descriptor is not in the right state for the attempted operation.
    InvalidState,
}

impl core::fmt::Display for PduError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PduError::Decode => f.write_str("failed to decode raw PDU data into type"),
            PduError::Ethernet => f.write_str("network"),
            PduError::TooLong => f.write_str("data is too long to fit in a descriptor"),
            PduError::NoDescriptor => f.write_str("datagram descriptor pool exhausted"),
            PduError::NoIndex => f.write_str("no free PDU index"),
            PduError::InvalidIndex(index) => write!(f, "invalid PDU index {}", index),
            PduError::Validation(e) => write!(f, "received PDU validation failed: {}", e),
            PduError::InvalidState => f.write_str("invalid datagram descriptor state"),
        }
    }
}

/// A PDU response failed to validate against the request it answers.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PduValidationError {
    /// The received command code does not match the one sent.
    CommandMismatch {
        /// Sent command code.
        sent: u8,
        /// Received command code.
        received: u8,
    },
    /// The received payload length does not match the sent one.
    LengthMismatch {
        /// Sent payload length.
        sent: u16,
        /// Received payload length.
        received: u16,
    },
}

impl core::fmt::Display for PduValidationError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::CommandMismatch { sent, received } => {
                write!(
                    f,
                    "PDU command mismatch: sent {:#04x}, received {:#04x}",
                    sent, received
                )
            }
            Self::LengthMismatch { sent, received } => {
                write!(
                    f,
                    "PDU length mismatch: sent {}, received {}",
                    sent, received
                )
            }
        }
    }
}

/// Mailbox error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MailboxError {
    /// The SDO operation was aborted by the slave.
    Aborted {
        /// Abort code.
        code: CoeAbortCode,
        /// The object index used in the operation.
        index: u16,
        /// The subindex used in the operation.
        sub_index: u8,
    },
    /// Mailbox data is too long to fit in the given buffer.
    TooLong,
    /// The slave has no mailbox but one is required for the given action.
    NoMailbox,
    /// The response to a mailbox operation is malformed.
    ResponseInvalid,
    /// The slave answered with a mailbox error reply (type nibble `0x00`).
    ErrorReply(MailboxErrorCode),
    /// The response's protocol type nibble does not match the request.
    WrongProtocol,
    /// The returned counter value does not match the request.
    InvalidCount,
}

impl core::fmt::Display for MailboxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            MailboxError::Aborted {
                code,
                index,
                sub_index,
            } => write!(f, "{:#06x}:{} aborted: {}", index, sub_index, code),
            MailboxError::TooLong => f.write_str("returned data is too long"),
            MailboxError::NoMailbox => f.write_str("device has no mailbox"),
            MailboxError::ResponseInvalid => f.write_str("invalid response from device"),
            MailboxError::ErrorReply(code) => write!(f, "error reply: {}", code),
            MailboxError::WrongProtocol => f.write_str("unexpected mailbox protocol in response"),
            MailboxError::InvalidCount => f.write_str("incorrect mailbox count value"),
        }
    }
}

/// EEPROM (SII) error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum EepromError {
    /// Failed to decode data from EEPROM.
    Decode,
    /// The device reported an EEPROM acknowledge error.
    NoAcknowledge,
    /// The device's category list exceeds the image size safety cap.
    ImageTooLarge,
    /// A category is truncated or overruns the image.
    SectionOverrun,
    /// A general EEPROM error occurred.
    General,
}

impl core::fmt::Display for EepromError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            EepromError::Decode => f.write_str("failed to decode data"),
            EepromError::NoAcknowledge => f.write_str("device did not acknowledge operation"),
            EepromError::ImageTooLarge => f.write_str("image exceeds size cap"),
            EepromError::SectionOverrun => f.write_str("category overruns image"),
            EepromError::General => f.write_str("general EEPROM error"),
        }
    }
}

/// Distributed clock error.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DcError {
    /// No DC capable slave was found to act as the reference clock.
    NoReference,
    /// The selected reference slave does not support DC.
    NotDcCapable,
}

impl core::fmt::Display for DcError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoReference => f.write_str("no DC reference slave found"),
            Self::NotDcCapable => f.write_str("selected reference slave is not DC capable"),
        }
    }
}

impl From<PduError> for Error {
    fn from(e: PduError) -> Self {
        Self::Pdu(e)
    }
}

impl From<PduValidationError> for Error {
    fn from(e: PduValidationError) -> Self {
        Self::Pdu(PduError::Validation(e))
    }
}

impl From<EepromError> for Error {
    fn from(e: EepromError) -> Self {
        Self::Eeprom(e)
    }
}

impl From<MailboxError> for Error {
    fn from(e: MailboxError) -> Self {
        Self::Mailbox(e)
    }
}

impl From<crate::foe::FoeError> for Error {
    fn from(e: crate::foe::FoeError) -> Self {
        Self::Foe(e)
    }
}

impl From<crate::soe::SoeError> for Error {
    fn from(e: crate::soe::SoeError) -> Self {
        Self::Soe(e)
    }
}

impl From<DcError> for Error {
    fn from(e: DcError) -> Self {
        Self::Dc(e)
    }
}

impl From<ethercrab_wire::WireError> for Error {
    fn from(value: ethercrab_wire::WireError) -> Self {
        Self::Wire(value)
    }
}

impl From<core::num::TryFromIntError> for Error {
    fn from(_e: core::num::TryFromIntError) -> Self {
        Self::InvalidInput
    }
}
