//! Raw EtherCAT commands, e.g. `LRW`, `BRD`, `APWR`, etc.

use crate::error::{Error, PduError};
use crate::fmt;
use ethercrab_wire::{EtherCrabWireSized, EtherCrabWireWrite};

const NOP: u8 = 0x00;
const APRD: u8 = 0x01;
const APWR: u8 = 0x02;
const APRW: u8 = 0x03;
const FPRD: u8 = 0x04;
const FPWR: u8 = 0x05;
const FPRW: u8 = 0x06;
const BRD: u8 = 0x07;
const BWR: u8 = 0x08;
const BRW: u8 = 0x09;
const LRD: u8 = 0x0a;
const LWR: u8 = 0x0b;
const LRW: u8 = 0x0c;
const ARMW: u8 = 0x0d;
const FRMW: u8 = 0x0e;

/// A PDU command: one EtherCAT operation inside a frame.
///
/// Every command carries its addressing with it: position (auto increment),
/// configured station, broadcast or logical. The constructors take care of
/// the addressing quirks, e.g. position addresses counting *down* from zero
/// as each slave increments the field on the way through.
#[derive(Default, PartialEq, Eq, Debug, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    /// No operation.
    #[default]
    Nop,

    /// Auto increment physical read.
    Aprd {
        /// Auto increment address (`0 - ring_position`, on the wire).
        address: u16,
        /// Register offset.
        register: u16,
    },
    /// Auto increment physical write.
    Apwr {
        /// Auto increment address.
        address: u16,
        /// Register offset.
        register: u16,
    },
    /// Auto increment physical read/write.
    Aprw {
        /// Auto increment address.
        address: u16,
        /// Register offset.
        register: u16,
    },

    /// Configured address physical read.
    Fprd {
        /// Configured station address.
        address: u16,
        /// Register offset.
        register: u16,
    },
    /// Configured address physical write.
    Fpwr {
        /// Configured station address.
        address: u16,
        /// Register offset.
        register: u16,
    },
    /// Configured address physical read/write.
    Fprw {
        /// Configured station address.
        address: u16,
        /// Register offset.
        register: u16,
    },

    /// Broadcast read.
    Brd {
        /// Always zero when sent from the master.
        address: u16,
        /// Register offset.
        register: u16,
    },
    /// Broadcast write.
    Bwr {
        /// Always zero when sent from the master.
        address: u16,
        /// Register offset.
        register: u16,
    },
    /// Broadcast read/write.
    Brw {
        /// Always zero when sent from the master.
        address: u16,
        /// Register offset.
        register: u16,
    },

    /// Logical read.
    Lrd {
        /// Logical address.
        address: u32,
    },
    /// Logical write.
    Lwr {
        /// Logical address.
        address: u32,
    },
    /// Logical read/write.
    Lrw {
        /// Logical address.
        address: u32,
    },

    /// Auto increment read, multiple write.
    Armw {
        /// Auto increment address.
        address: u16,
        /// Register offset.
        register: u16,
    },
    /// Configured address read, multiple write.
    ///
    /// Used to distribute a value from one slave to all others, e.g. the
    /// distributed clock reference time.
    Frmw {
        /// Configured station address.
        address: u16,
        /// Register offset.
        register: u16,
    },
}

impl Command {
    /// Create an auto increment read (APRD) addressing the slave at the given
    /// ring position.
    pub fn aprd(position: u16, register: u16) -> Self {
        Self::Aprd {
            // Each slave increments the address on the way through, so the
            // target is reached when the field hits zero.
            address: 0u16.wrapping_sub(position),
            register,
        }
    }

    /// Create an auto increment write (APWR) addressing the slave at the
    /// given ring position.
    pub fn apwr(position: u16, register: u16) -> Self {
        Self::Apwr {
            address: 0u16.wrapping_sub(position),
            register,
        }
    }

    /// Create a configured address read (FPRD).
    pub fn fprd(address: u16, register: u16) -> Self {
        Self::Fprd { address, register }
    }

    /// Create a configured address write (FPWR).
    pub fn fpwr(address: u16, register: u16) -> Self {
        Self::Fpwr { address, register }
    }

    /// Create a broadcast read (BRD).
    ///
    /// The address is always zero when transmitted from the master; each
    /// slave increments it, so the working counter doubles as a device count.
    pub fn brd(register: u16) -> Self {
        Self::Brd {
            address: 0,
            register,
        }
    }

    /// Create a broadcast write (BWR).
    pub fn bwr(register: u16) -> Self {
        Self::Bwr {
            address: 0,
            register,
        }
    }

    /// Create a logical read (LRD).
    pub fn lrd(address: u32) -> Self {
        Self::Lrd { address }
    }

    /// Create a logical write (LWR).
    pub fn lwr(address: u32) -> Self {
        Self::Lwr { address }
    }

    /// Create a logical read/write (LRW).
    pub fn lrw(address: u32) -> Self {
        Self::Lrw { address }
    }

    /// Create a configured address read, multiple write (FRMW).
    pub fn frmw(address: u16, register: u16) -> Self {
        Self::Frmw { address, register }
    }

    /// Get the command code.
    pub(crate) const fn code(&self) -> u8 {
        match self {
            Self::Nop => NOP,
            Self::Aprd { .. } => APRD,
            Self::Apwr { .. } => APWR,
            Self::Aprw { .. } => APRW,
            Self::Fprd { .. } => FPRD,
            Self::Fpwr { .. } => FPWR,
            Self::Fprw { .. } => FPRW,
            Self::Brd { .. } => BRD,
            Self::Bwr { .. } => BWR,
            Self::Brw { .. } => BRW,
            Self::Lrd { .. } => LRD,
            Self::Lwr { .. } => LWR,
            Self::Lrw { .. } => LRW,
            Self::Armw { .. } => ARMW,
            Self::Frmw { .. } => FRMW,
        }
    }

    /// Whether a reply to this command carries data written by slaves.
    ///
    /// Write-only commands echo the master's own payload back, so their reply
    /// payload is not copied back into the descriptor buffer.
    pub(crate) const fn reads_back(&self) -> bool {
        matches!(
            self,
            Self::Aprd { .. }
                | Self::Aprw { .. }
                | Self::Fprd { .. }
                | Self::Fprw { .. }
                | Self::Brd { .. }
                | Self::Brw { .. }
                | Self::Lrd { .. }
                | Self::Lrw { .. }
                | Self::Armw { .. }
                | Self::Frmw { .. }
        )
    }

    /// Reconstruct a command from a code and the raw 4 address bytes.
    pub(crate) fn parse(code: u8, addr: [u8; 4]) -> Result<Self, Error> {
        let address = u16::from_le_bytes([addr[0], addr[1]]);
        let register = u16::from_le_bytes([addr[2], addr[3]]);
        let logical = u32::from_le_bytes(addr);

        match code {
            NOP => Ok(Self::Nop),
            APRD => Ok(Self::Aprd { address, register }),
            APWR => Ok(Self::Apwr { address, register }),
            APRW => Ok(Self::Aprw { address, register }),
            FPRD => Ok(Self::Fprd { address, register }),
            FPWR => Ok(Self::Fpwr { address, register }),
            FPRW => Ok(Self::Fprw { address, register }),
            BRD => Ok(Self::Brd { address, register }),
            BWR => Ok(Self::Bwr { address, register }),
            BRW => Ok(Self::Brw { address, register }),
            LRD => Ok(Self::Lrd { address: logical }),
            LWR => Ok(Self::Lwr { address: logical }),
            LRW => Ok(Self::Lrw { address: logical }),
            ARMW => Ok(Self::Armw { address, register }),
            FRMW => Ok(Self::Frmw { address, register }),
            other => {
                fmt::error!("Invalid command code {:#04x}", other);

                Err(Error::Pdu(PduError::Decode))
            }
        }
    }
}

impl EtherCrabWireWrite for Command {
    fn pack_to_slice_unchecked<'buf>(&self, buf: &'buf mut [u8]) -> &'buf [u8] {
        match *self {
            Command::Nop => {
                buf[0..4].fill(0);

                &buf[0..4]
            }

            Command::Aprd { address, register }
            | Command::Apwr { address, register }
            | Command::Aprw { address, register }
            | Command::Fprd { address, register }
            | Command::Fpwr { address, register }
            | Command::Fprw { address, register }
            | Command::Brd { address, register }
            | Command::Bwr { address, register }
            | Command::Brw { address, register }
            | Command::Armw { address, register }
            | Command::Frmw { address, register } => {
                address.pack_to_slice_unchecked(&mut buf[0..2]);
                register.pack_to_slice_unchecked(&mut buf[2..4]);

                &buf[0..4]
            }

            Command::Lrd { address } | Command::Lwr { address } | Command::Lrw { address } => {
                address.pack_to_slice_unchecked(&mut buf[0..4])
            }
        }
    }

    fn packed_len(&self) -> usize {
        u32::PACKED_LEN
    }
}

impl core::fmt::Display for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Command::Nop => write!(f, "NOP"),
            Command::Aprd { address, register } => {
                write!(f, "APRD(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Apwr { address, register } => {
                write!(f, "APWR(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Aprw { address, register } => {
                write!(f, "APRW(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Fprd { address, register } => {
                write!(f, "FPRD(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Fpwr { address, register } => {
                write!(f, "FPWR(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Fprw { address, register } => {
                write!(f, "FPRW(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Brd { address, register } => {
                write!(f, "BRD(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Bwr { address, register } => {
                write!(f, "BWR(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Brw { address, register } => {
                write!(f, "BRW(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Lrd { address } => write!(f, "LRD(addr {:#010x})", address),
            Command::Lwr { address } => write!(f, "LWR(addr {:#010x})", address),
            Command::Lrw { address } => write!(f, "LRW(addr {:#010x})", address),
            Command::Armw { address, register } => {
                write!(f, "ARMW(addr {:#06x}, reg {:#06x})", address, register)
            }
            Command::Frmw { address, register } => {
                write!(f, "FRMW(addr {:#06x}, reg {:#06x})", address, register)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aprd_counts_down() {
        let Command::Aprd { address, .. } = Command::aprd(2, 0x0130) else {
            panic!("wrong variant");
        };

        assert_eq!(address, 0xfffe);
    }

    #[test]
    fn pack_physical() {
        let mut buf = [0u8; 4];

        let packed = Command::fprd(0x1001, 0x0130).pack_to_slice_unchecked(&mut buf);

        assert_eq!(packed, &[0x01, 0x10, 0x30, 0x01]);
    }

    #[test]
    fn pack_logical() {
        let mut buf = [0u8; 4];

        let packed = Command::lrw(0x0001_0080).pack_to_slice_unchecked(&mut buf);

        assert_eq!(packed, &[0x80, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn parse_round_trip() {
        let commands = [
            Command::Nop,
            Command::aprd(1, 0x0000),
            Command::apwr(3, 0x0010),
            Command::fprd(0x1000, 0x0130),
            Command::fpwr(0x1001, 0x0120),
            Command::brd(0x0000),
            Command::bwr(0x0900),
            Command::lrd(0x0000_0000),
            Command::lwr(0x0000_0100),
            Command::lrw(0xdead_beef),
            Command::frmw(0x1000, 0x0910),
        ];

        for command in commands {
            let mut buf = [0u8; 4];

            command.pack_to_slice_unchecked(&mut buf);

            assert_eq!(Command::parse(command.code(), buf), Ok(command));
        }
    }

    #[test]
    fn reject_bad_code() {
        assert!(Command::parse(0x0f, [0; 4]).is_err());
    }
}
