//! The header prefixed to every PDU inside an EtherCAT frame.

use crate::LEN_MASK;

/// Flags word following the address in a PDU header.
///
/// Low 11 bits are the payload length, bit 14 is the "circulating" marker set
/// by a slave when a frame loops the ring more than once, bit 15 signals that
/// another PDU follows in the same frame.
#[derive(Default, Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 2)]
pub struct PduFlags {
    /// Payload length of this PDU in bytes.
    #[wire(bits = 11, post_skip = 3)]
    pub length: u16,
    /// The frame has circulated at least once.
    #[wire(bits = 1)]
    pub circulated: bool,
    /// Another PDU follows this one in the same frame.
    #[wire(bits = 1)]
    pub more_follows: bool,
}

impl PduFlags {
    pub const fn with_len(len: u16) -> Self {
        Self {
            length: len & LEN_MASK,
            circulated: false,
            more_follows: false,
        }
    }
}

/// PDU header: command, index, raw address, flags, IRQ.
///
/// The 4 address bytes are kept raw here; their interpretation (station +
/// register, or one logical address) depends on the command code and is
/// handled by [`Command`](crate::Command).
#[derive(Copy, Clone, Debug, PartialEq, Eq, ethercrab_wire::EtherCrabWireReadWrite)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[wire(bytes = 10)]
pub struct PduHeader {
    /// Command code.
    #[wire(bytes = 1)]
    pub command_code: u8,
    /// PDU index used to match a reply to its request.
    #[wire(bytes = 1)]
    pub index: u8,
    /// Raw address bytes.
    #[wire(bytes = 4)]
    pub address: [u8; 4],
    /// Length/circulating/more flags.
    #[wire(bytes = 2)]
    pub flags: PduFlags,
    /// IRQ event request. Always zero when sent from this master.
    #[wire(bytes = 2)]
    pub irq: u16,
}

/// Header plus trailing working counter.
pub const PDU_OVERHEAD: usize = 12;
