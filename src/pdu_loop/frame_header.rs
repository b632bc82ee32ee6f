//! The EtherCAT frame header: 11 bits of payload length, a reserved bit and a
//! 4 bit protocol type.

use crate::LEN_MASK;
use crate::error::{Error, PduError};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};

/// Protocol type nibble. Only DLPDUs are supported.
const PROTOCOL_DLPDU: u16 = 0x01;

/// An EtherCAT frame header.
///
/// A frame contains one or more PDUs, each starting with a
/// [`PduHeader`](crate::pdu_loop::pdu_header::PduHeader).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub payload_len: u16,
}

impl FrameHeader {
    /// Create a new DLPDU frame header.
    pub fn pdu(len: u16) -> Self {
        debug_assert!(
            len <= LEN_MASK,
            "frame length may not exceed {} bytes",
            LEN_MASK
        );

        Self {
            payload_len: len & LEN_MASK,
        }
    }

    /// Decode a header, rejecting frames that are not DLPDU type.
    pub fn parse(buf: &[u8]) -> Result<Self, Error> {
        let raw = u16::unpack_from_slice(buf).map_err(|_| Error::Pdu(PduError::Ethernet))?;

        if raw >> 12 != PROTOCOL_DLPDU {
            return Err(Error::Pdu(PduError::Decode));
        }

        Ok(Self {
            payload_len: raw & LEN_MASK,
        })
    }
}

impl EtherCrabWireSized for FrameHeader {
    const PACKED_LEN: usize = 2;

    type Buffer = [u8; 2];

    fn buffer() -> Self::Buffer {
        [0u8; 2]
    }
}

impl EtherCrabWireWrite for FrameHeader {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        // Protocol type in the top 4 bits
        let raw = self.payload_len | (PROTOCOL_DLPDU << 12);

        raw.pack_to_slice_unchecked(buf)
    }

    fn packed_len(&self) -> usize {
        Self::PACKED_LEN
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdu_header() {
        let header = FrameHeader::pdu(0x28);

        let mut buf = [0u8; 2];

        let packed = header.pack_to_slice_unchecked(&mut buf);

        let expected = &0b0001_0000_0010_1000u16.to_le_bytes();

        assert_eq!(packed, expected);
    }

    #[test]
    fn decode_pdu_len() {
        let raw = 0b0001_0000_0010_1000u16;

        let header = FrameHeader::parse(&raw.to_le_bytes()).unwrap();

        assert_eq!(header.payload_len, 0x28);
    }

    #[test]
    fn reject_non_dlpdu() {
        // Protocol type 4 (network variables) is not supported
        let raw = 0b0100_0000_0010_1000u16;

        assert!(FrameHeader::parse(&raw.to_le_bytes()).is_err());
    }
}
