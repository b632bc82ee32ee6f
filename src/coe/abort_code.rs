/// SDO abort code, defined in ETG1000.6 Table 41 – SDO Abort Codes.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum CoeAbortCode {
    /// Toggle bit not changed
    ToggleBit = 0x05030000,
    /// SDO protocol timeout
    SdoTimeout = 0x05040000,
    /// Client/Server command specifier not valid or unknown
    InvalidCommand = 0x05040001,
    /// Out of memory
    OutOfMemory = 0x05040005,
    /// Unsupported access to an object
    UnsupportedAccess = 0x06010000,
    /// Attempt to read to a write only object
    WriteOnlyRead = 0x06010001,
    /// Attempt to write to a read only object
    ReadOnlyWrite = 0x06010002,
    /// Subindex cannot be written, SI0 must be 0 for write access
    IndexOnly = 0x06010003,
    /// SDO Complete access not supported for objects of variable length
    NoCompleteAccess = 0x06010004,
    /// Object length exceeds mailbox size
    ObjectTooLarge = 0x06010005,
    /// Object mapped to RxPDO, SDO Download blocked
    DownloadBlocked = 0x06010006,
    /// The object does not exist in the object directory
    NotFound = 0x06020000,
    /// The object can not be mapped into the PDO
    PdoMappingFailed = 0x06040041,
    /// The number and length of the objects to be mapped would exceed the PDO
    /// length
    PdoTooSmall = 0x06040042,
    /// General parameter incompatibility reason
    Incompatible = 0x06040043,
    /// General internal incompatibility in the device
    Internal = 0x06040047,
    /// Access failed due to a hardware error
    HardwareFailure = 0x06060000,
    /// Data type does not match, length of service parameter does not match
    DataLengthMismatch = 0x06070010,
    /// Data type does not match, length of service parameter too high
    DataTooLong = 0x06070012,
    /// Data type does not match, length of service parameter too low
    DataTooShort = 0x06070013,
    /// Subindex does not exist
    SubIndexNotFound = 0x06090011,
    /// Value range of parameter exceeded (only for write access)
    ValueOutOfRange = 0x06090030,
    /// Value of parameter written too high
    ValueTooLarge = 0x06090031,
    /// Value of parameter written too low
    ValueTooSmall = 0x06090032,
    /// Maximum value is less than minimum value
    MaxMin = 0x06090036,
    /// General error
    General = 0x08000000,
    /// Data cannot be transferred or stored to the application
    TransferFailed = 0x08000020,
    /// Data cannot be transferred or stored to the application because of
    /// local control
    TransferFailedLocal = 0x08000021,
    /// Data cannot be transferred or stored to the application because of the
    /// present device state
    InvalidState = 0x08000022,
    /// Object dictionary dynamic generation fails or no object dictionary is
    /// present
    NoObjectDictionary = 0x08000023,

    /// Unknown abort code.
    #[wire(catch_all)]
    Unknown(u32),
}

impl core::fmt::Display for CoeAbortCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let num = u32::from(*self);

        f.write_fmt(format_args!("{:#010x}: ", num))?;

        let s = match self {
            Self::ToggleBit => "Toggle bit not changed",
            Self::SdoTimeout => "SDO protocol timeout",
            Self::InvalidCommand => "Client/Server command specifier not valid or unknown",
            Self::OutOfMemory => "Out of memory",
            Self::UnsupportedAccess => "Unsupported access to an object",
            Self::WriteOnlyRead => "Attempt to read to a write only object",
            Self::ReadOnlyWrite => "Attempt to write to a read only object",
            Self::IndexOnly => "Subindex cannot be written, SI0 must be 0 for write access",
            Self::NoCompleteAccess => {
                "SDO Complete access not supported for objects of variable length"
            }
            Self::ObjectTooLarge => "Object length exceeds mailbox size",
            Self::DownloadBlocked => "Object mapped to RxPDO, SDO Download blocked",
            Self::NotFound => "The object does not exist in the object directory",
            Self::PdoMappingFailed => "The object can not be mapped into the PDO",
            Self::PdoTooSmall => {
                "The number and length of the objects to be mapped would exceed the PDO length"
            }
            Self::Incompatible => "General parameter incompatibility reason",
            Self::Internal => "General internal incompatibility in the device",
            Self::HardwareFailure => "Access failed due to a hardware error",
            Self::DataLengthMismatch => {
                "Data type does not match, length of service parameter does not match"
            }
            Self::DataTooLong => "Data type does not match, length of service parameter too high",
            Self::DataTooShort => "Data type does not match, length of service parameter too low",
            Self::SubIndexNotFound => "Subindex does not exist",
            Self::ValueOutOfRange => "Value range of parameter exceeded (only for write access)",
            Self::ValueTooLarge => "Value of parameter written too high",
            Self::ValueTooSmall => "Value of parameter written too low",
            Self::MaxMin => "Maximum value is less than minimum value",
            Self::General => "General error",
            Self::TransferFailed => "Data cannot be transferred or stored to the application",
            Self::TransferFailedLocal => {
                "Data cannot be transferred or stored to the application because of local control"
            }
            Self::InvalidState => {
                "Data cannot be transferred or stored to the application because of the present device state"
            }
            Self::NoObjectDictionary => {
                "Object dictionary dynamic generation fails or no object dictionary is present"
            }
            Self::Unknown(_) => "Unknown code",
        };

        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_code() {
        let decoded = CoeAbortCode::from(0x1234_5678u32);

        assert_eq!(decoded, CoeAbortCode::Unknown(0x1234_5678));
        assert_eq!(decoded.to_string(), "0x12345678: Unknown code");
    }

    #[test]
    fn parse_code() {
        assert_eq!(CoeAbortCode::from(0x06090036), CoeAbortCode::MaxMin);
        assert_eq!(
            CoeAbortCode::from(0x05030000).to_string(),
            "0x05030000: Toggle bit not changed"
        );
    }
}
