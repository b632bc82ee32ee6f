//! SII (Slave Information Interface) image layout: fixed words, category
//! TLVs and their payloads.

use crate::error::EepromError;
use crate::mailbox::MailboxProtocols;
use crate::sync_manager_channel::Direction;
use crate::{MAX_SII_WORDS, MAX_SYNC_MANAGERS, fmt};

/// Fixed word addresses in the SII, ETG1000.6 Table 16.
pub mod word {
    /// Configured station alias.
    pub const ALIAS: u16 = 0x0004;
    /// Vendor ID (2 words).
    pub const VENDOR: u16 = 0x0008;
    /// Product code (2 words).
    pub const PRODUCT: u16 = 0x000a;
    /// Revision number (2 words).
    pub const REVISION: u16 = 0x000c;
    /// Serial number (2 words).
    pub const SERIAL: u16 = 0x000e;
    /// Bootstrap receive mailbox offset.
    pub const BOOT_RX_MBOX_OFFSET: u16 = 0x0014;
    /// Bootstrap receive mailbox size.
    pub const BOOT_RX_MBOX_SIZE: u16 = 0x0015;
    /// Bootstrap send mailbox offset.
    pub const BOOT_TX_MBOX_OFFSET: u16 = 0x0016;
    /// Bootstrap send mailbox size.
    pub const BOOT_TX_MBOX_SIZE: u16 = 0x0017;
    /// Standard receive mailbox offset.
    pub const STD_RX_MBOX_OFFSET: u16 = 0x0018;
    /// Standard receive mailbox size.
    pub const STD_RX_MBOX_SIZE: u16 = 0x0019;
    /// Standard send mailbox offset.
    pub const STD_TX_MBOX_OFFSET: u16 = 0x001a;
    /// Standard send mailbox size.
    pub const STD_TX_MBOX_SIZE: u16 = 0x001b;
    /// Supported mailbox protocols bitmask.
    pub const MAILBOX_PROTOCOLS: u16 = 0x001c;
    /// First category header.
    pub const FIRST_CATEGORY: u16 = 0x0040;
}

/// Category type from a category TLV header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CategoryType {
    Strings,
    DataTypes,
    General,
    Fmmu,
    SyncManager,
    TxPdo,
    RxPdo,
    Dc,
    End,
    Other(u16),
}

impl From<u16> for CategoryType {
    fn from(raw: u16) -> Self {
        match raw {
            10 => Self::Strings,
            20 => Self::DataTypes,
            30 => Self::General,
            40 => Self::Fmmu,
            41 => Self::SyncManager,
            50 => Self::TxPdo,
            51 => Self::RxPdo,
            60 => Self::Dc,
            0xffff => Self::End,
            other => Self::Other(other),
        }
    }
}

/// Identity words used for cache matching and configured-slave lookup.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct SiiIdentity {
    pub alias: u16,
    pub vendor_id: u32,
    pub product_code: u32,
    pub revision: u32,
    pub serial: u32,
}

impl SiiIdentity {
    /// Whether a cached image belonging to `self` may be reattached to a
    /// device reporting `other`.
    ///
    /// A device is uniquely identifiable either by a nonzero alias plus
    /// revision, or by the full (vendor, product, revision, serial) tuple
    /// with a nonzero serial.
    pub fn matches(&self, other: &SiiIdentity) -> bool {
        if self.alias != 0 && self.alias == other.alias && self.revision == other.revision {
            return true;
        }

        self.serial != 0
            && self.vendor_id == other.vendor_id
            && self.product_code == other.product_code
            && self.revision == other.revision
            && self.serial == other.serial
    }
}

/// A complete SII word image.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SiiImage {
    pub words: heapless::Vec<u16, MAX_SII_WORDS>,
}

impl SiiImage {
    pub fn word(&self, address: u16) -> u16 {
        self.words.get(usize::from(address)).copied().unwrap_or(0)
    }

    pub fn dword(&self, address: u16) -> u32 {
        u32::from(self.word(address)) | u32::from(self.word(address + 1)) << 16
    }

    /// One byte out of the little endian word stream.
    fn byte(&self, offset: usize) -> u8 {
        let word = self.word((offset / 2) as u16);

        if offset % 2 == 0 {
            word as u8
        } else {
            (word >> 8) as u8
        }
    }

    pub fn identity(&self) -> SiiIdentity {
        SiiIdentity {
            alias: self.word(word::ALIAS),
            vendor_id: self.dword(word::VENDOR),
            product_code: self.dword(word::PRODUCT),
            revision: self.dword(word::REVISION),
            serial: self.dword(word::SERIAL),
        }
    }

    /// Walk the category list, calling `visit` with each category's type and
    /// word range.
    pub fn for_each_category<E>(
        &self,
        mut visit: impl FnMut(CategoryType, u16, u16) -> Result<(), E>,
    ) -> Result<(), E> {
        let mut offset = word::FIRST_CATEGORY;

        while usize::from(offset) + 1 < self.words.len() {
            let category = CategoryType::from(self.word(offset));
            let size = self.word(offset + 1);

            if category == CategoryType::End {
                break;
            }

            visit(category, offset + 2, size)?;

            offset += 2 + size;
        }

        Ok(())
    }
}

/// General category (type 30) fields the master cares about.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SiiGeneral {
    pub group_string_idx: u8,
    pub image_string_idx: u8,
    pub order_string_idx: u8,
    pub name_string_idx: u8,
    /// CoE details: bit 0 enable SDO, bit 1 enable SDO info, bit 2 enable PDO
    /// assign, bit 3 enable PDO configuration.
    pub coe_details: u8,
    pub foe_details: u8,
    pub eoe_details: u8,
    pub flags: u8,
    /// Consumption in mA on the E-bus; negative values feed the bus.
    pub ebus_current_ma: i16,
}

/// One sync manager descriptor from the SyncManager category (type 41).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SiiSyncManager {
    pub start_address: u16,
    pub length: u16,
    pub control: u8,
    pub enable: u8,
    pub usage: SmUsage,
}

/// Sync manager usage from the SII descriptor.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SmUsage {
    #[default]
    Unused,
    MailboxWrite,
    MailboxRead,
    ProcessDataOut,
    ProcessDataIn,
    Other(u8),
}

impl From<u8> for SmUsage {
    fn from(raw: u8) -> Self {
        match raw {
            0 => Self::Unused,
            1 => Self::MailboxWrite,
            2 => Self::MailboxRead,
            3 => Self::ProcessDataOut,
            4 => Self::ProcessDataIn,
            other => Self::Other(other),
        }
    }
}

/// One entry of a PDO from the TxPDO/RxPDO categories.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SiiPdoEntry {
    pub index: u16,
    pub sub_index: u8,
    pub bit_length: u8,
}

/// One PDO descriptor from the TxPDO (50) or RxPDO (51) categories.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SiiPdo {
    pub index: u16,
    /// Sync manager this PDO is assigned to by default.
    pub sync_manager: u8,
    pub direction: Direction,
    pub entries: heapless::Vec<SiiPdoEntry, 16>,
}

impl SiiPdo {
    /// Summed size of all entries in bits.
    pub fn bit_length(&self) -> u16 {
        self.entries
            .iter()
            .map(|entry| u16::from(entry.bit_length))
            .sum()
    }
}

/// Everything parsed out of a slave's SII image.
#[derive(Debug, Default, Clone)]
pub struct SiiInfo {
    pub identity: SiiIdentity,
    pub mailbox_protocols: MailboxProtocols,
    pub std_rx_mbox_offset: u16,
    pub std_rx_mbox_size: u16,
    pub std_tx_mbox_offset: u16,
    pub std_tx_mbox_size: u16,
    pub boot_rx_mbox_offset: u16,
    pub boot_rx_mbox_size: u16,
    pub boot_tx_mbox_offset: u16,
    pub boot_tx_mbox_size: u16,
    pub general: Option<SiiGeneral>,
    pub sync_managers: heapless::Vec<SiiSyncManager, MAX_SYNC_MANAGERS>,
    pub pdos: heapless::Vec<SiiPdo, 32>,
}

impl SiiInfo {
    /// Parse the fixed words and all known categories out of an image.
    pub fn parse(image: &SiiImage) -> Result<Self, EepromError> {
        let mut info = Self {
            identity: image.identity(),
            mailbox_protocols: MailboxProtocols::from_bits_truncate(
                image.word(word::MAILBOX_PROTOCOLS),
            ),
            std_rx_mbox_offset: image.word(word::STD_RX_MBOX_OFFSET),
            std_rx_mbox_size: image.word(word::STD_RX_MBOX_SIZE),
            std_tx_mbox_offset: image.word(word::STD_TX_MBOX_OFFSET),
            std_tx_mbox_size: image.word(word::STD_TX_MBOX_SIZE),
            boot_rx_mbox_offset: image.word(word::BOOT_RX_MBOX_OFFSET),
            boot_rx_mbox_size: image.word(word::BOOT_RX_MBOX_SIZE),
            boot_tx_mbox_offset: image.word(word::BOOT_TX_MBOX_OFFSET),
            boot_tx_mbox_size: image.word(word::BOOT_TX_MBOX_SIZE),
            ..Self::default()
        };

        // A blank EEPROM reads as all ones; scrub unusable mailbox words
        for value in [
            &mut info.std_rx_mbox_offset,
            &mut info.std_rx_mbox_size,
            &mut info.std_tx_mbox_offset,
            &mut info.std_tx_mbox_size,
            &mut info.boot_rx_mbox_offset,
            &mut info.boot_rx_mbox_size,
            &mut info.boot_tx_mbox_offset,
            &mut info.boot_tx_mbox_size,
        ] {
            if *value == 0xffff {
                *value = 0;
            }
        }

        image.for_each_category(|category, data_word, size_words| {
            match category {
                CategoryType::General => {
                    info.general = Some(parse_general(image, data_word, size_words)?);
                }
                CategoryType::SyncManager => {
                    parse_sync_managers(image, data_word, size_words, &mut info.sync_managers)?;
                }
                CategoryType::TxPdo => {
                    parse_pdos(
                        image,
                        data_word,
                        size_words,
                        Direction::MasterRead,
                        &mut info.pdos,
                    )?;
                }
                CategoryType::RxPdo => {
                    parse_pdos(
                        image,
                        data_word,
                        size_words,
                        Direction::MasterWrite,
                        &mut info.pdos,
                    )?;
                }
                // Strings are only referenced for diagnostics and not stored
                _ => {}
            }

            Ok(())
        })?;

        Ok(info)
    }

    /// Default PDOs assigned to the given sync manager.
    pub fn pdos_for_sync_manager(&self, index: u8) -> impl Iterator<Item = &SiiPdo> {
        self.pdos.iter().filter(move |pdo| pdo.sync_manager == index)
    }
}

fn parse_general(
    image: &SiiImage,
    data_word: u16,
    size_words: u16,
) -> Result<SiiGeneral, EepromError> {
    if size_words < 16 {
        return Err(EepromError::SectionOverrun);
    }

    let base = usize::from(data_word) * 2;

    Ok(SiiGeneral {
        group_string_idx: image.byte(base),
        image_string_idx: image.byte(base + 1),
        order_string_idx: image.byte(base + 2),
        name_string_idx: image.byte(base + 3),
        coe_details: image.byte(base + 5),
        foe_details: image.byte(base + 6),
        eoe_details: image.byte(base + 7),
        flags: image.byte(base + 11),
        ebus_current_ma: i16::from_le_bytes([image.byte(base + 12), image.byte(base + 13)]),
    })
}

fn parse_sync_managers(
    image: &SiiImage,
    data_word: u16,
    size_words: u16,
    out: &mut heapless::Vec<SiiSyncManager, MAX_SYNC_MANAGERS>,
) -> Result<(), EepromError> {
    // 8 bytes (4 words) per descriptor
    let count = usize::from(size_words) / 4;

    for i in 0..count {
        let base = (usize::from(data_word) + i * 4) * 2;

        let sm = SiiSyncManager {
            start_address: u16::from_le_bytes([image.byte(base), image.byte(base + 1)]),
            length: u16::from_le_bytes([image.byte(base + 2), image.byte(base + 3)]),
            control: image.byte(base + 4),
            enable: image.byte(base + 6),
            usage: SmUsage::from(image.byte(base + 7)),
        };

        if out.push(sm).is_err() {
            fmt::warn!("More than {} SII sync managers, ignoring rest", out.capacity());

            break;
        }
    }

    Ok(())
}

fn parse_pdos(
    image: &SiiImage,
    data_word: u16,
    size_words: u16,
    direction: Direction,
    out: &mut heapless::Vec<SiiPdo, 32>,
) -> Result<(), EepromError> {
    let mut offset = usize::from(data_word) * 2;
    let end = offset + usize::from(size_words) * 2;

    while offset + 8 <= end {
        let index = u16::from_le_bytes([image.byte(offset), image.byte(offset + 1)]);
        let entry_count = image.byte(offset + 2);
        let sync_manager = image.byte(offset + 3);

        let mut pdo = SiiPdo {
            index,
            sync_manager,
            direction,
            entries: heapless::Vec::new(),
        };

        offset += 8;

        for _ in 0..entry_count {
            if offset + 8 > end {
                return Err(EepromError::SectionOverrun);
            }

            let entry = SiiPdoEntry {
                index: u16::from_le_bytes([image.byte(offset), image.byte(offset + 1)]),
                sub_index: image.byte(offset + 2),
                bit_length: image.byte(offset + 5),
            };

            if pdo.entries.push(entry).is_err() {
                fmt::warn!(
                    "PDO {:#06x} has more than {} entries, ignoring rest",
                    index,
                    pdo.entries.capacity()
                );
            }

            offset += 8;
        }

        if out.push(pdo).is_err() {
            fmt::warn!("More than {} SII PDOs, ignoring rest", out.capacity());

            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a minimal image: identity words, mailbox words, one SM category
    /// with two mailboxes and two process data SMs, one RxPDO and one TxPDO.
    pub(crate) fn test_image() -> SiiImage {
        let mut words = [0u16; 0x80];

        words[0x04] = 0x0abc; // alias
        words[0x08] = 0x0002; // vendor lo (Beckhoff)
        words[0x0a] = 0x3052; // product lo
        words[0x0b] = 0x07d8; // product hi -> 0x07d83052
        words[0x0c] = 0x0000;
        words[0x0d] = 0x0011; // revision 0x00110000
        words[0x0e] = 0x5678;
        words[0x0f] = 0x1234; // serial 0x12345678

        words[0x18] = 0x1000; // std rx mailbox offset
        words[0x19] = 0x0080;
        words[0x1a] = 0x1080; // std tx mailbox offset
        words[0x1b] = 0x0080;
        words[0x1c] = 0x000c; // CoE + FoE

        let mut at = 0x40;

        // SyncManager category: 2 descriptors = 8 words
        words[at] = 41;
        words[at + 1] = 8;
        // SM0: mailbox write
        words[at + 2] = 0x1000;
        words[at + 3] = 0x0080;
        words[at + 4] = 0x0026; // control | status
        words[at + 5] = 0x0101; // enable | usage 1
        // SM2: process data out
        words[at + 6] = 0x1100;
        words[at + 7] = 0x0001;
        words[at + 8] = 0x0024;
        words[at + 9] = 0x0301;
        at += 10;

        // RxPDO category: header (4 words) + 1 entry (4 words)
        words[at] = 51;
        words[at + 1] = 8;
        words[at + 2] = 0x1600; // pdo index
        words[at + 3] = 0x0201; // 1 entry, SM 2
        words[at + 4] = 0x0000;
        words[at + 5] = 0x0000;
        words[at + 6] = 0x7000; // entry index
        words[at + 7] = 0x0001; // sub 1, name 0
        words[at + 8] = 0x0100; // data type 0, bit len 1
        words[at + 9] = 0x0000;
        at += 10;

        words[at] = 0xffff; // end

        SiiImage {
            words: heapless::Vec::from_slice(&words).unwrap(),
        }
    }

    #[test]
    fn identity_words() {
        let identity = test_image().identity();

        assert_eq!(identity.alias, 0x0abc);
        assert_eq!(identity.vendor_id, 0x0000_0002);
        assert_eq!(identity.product_code, 0x07d8_3052);
        assert_eq!(identity.revision, 0x0011_0000);
        assert_eq!(identity.serial, 0x1234_5678);
    }

    #[test]
    fn parse_full() {
        let info = SiiInfo::parse(&test_image()).unwrap();

        assert_eq!(info.std_rx_mbox_offset, 0x1000);
        assert_eq!(info.std_tx_mbox_offset, 0x1080);
        assert!(info.mailbox_protocols.contains(MailboxProtocols::COE));
        assert!(info.mailbox_protocols.contains(MailboxProtocols::FOE));
        assert!(!info.mailbox_protocols.contains(MailboxProtocols::SOE));

        assert_eq!(info.sync_managers.len(), 2);
        assert_eq!(info.sync_managers[0].start_address, 0x1000);
        assert_eq!(info.sync_managers[1].usage, SmUsage::ProcessDataOut);

        assert_eq!(info.pdos.len(), 1);

        let pdo = &info.pdos[0];

        assert_eq!(pdo.index, 0x1600);
        assert_eq!(pdo.sync_manager, 2);
        assert_eq!(pdo.direction, Direction::MasterWrite);
        assert_eq!(pdo.entries.len(), 1);
        assert_eq!(pdo.entries[0].index, 0x7000);
        assert_eq!(pdo.entries[0].sub_index, 1);
        assert_eq!(pdo.entries[0].bit_length, 1);
        assert_eq!(pdo.bit_length(), 1);
    }

    #[test]
    fn blank_mailbox_words_scrubbed() {
        let mut image = test_image();

        image.words[0x18] = 0xffff;
        image.words[0x19] = 0xffff;

        let info = SiiInfo::parse(&image).unwrap();

        assert_eq!(info.std_rx_mbox_offset, 0);
        assert_eq!(info.std_rx_mbox_size, 0);
    }

    #[test]
    fn cache_match_rules() {
        let by_alias = SiiIdentity {
            alias: 5,
            revision: 1,
            ..SiiIdentity::default()
        };

        assert!(by_alias.matches(&by_alias));
        assert!(!by_alias.matches(&SiiIdentity {
            alias: 5,
            revision: 2,
            ..SiiIdentity::default()
        }));

        let by_serial = SiiIdentity {
            alias: 0,
            vendor_id: 2,
            product_code: 3,
            revision: 4,
            serial: 99,
        };

        assert!(by_serial.matches(&by_serial));
        assert!(!by_serial.matches(&SiiIdentity {
            serial: 98,
            ..by_serial
        }));

        // Serial of zero is not unique
        assert!(
            !SiiIdentity::default().matches(&SiiIdentity::default())
        );
    }

    #[test]
    fn category_walk_stops_at_end() {
        let image = test_image();

        let mut seen = heapless::Vec::<CategoryType, 8>::new();

        image
            .for_each_category(|category, _, _| {
                seen.push(category).unwrap();

                Ok::<(), ()>(())
            })
            .unwrap();

        assert_eq!(
            &seen[..],
            &[CategoryType::SyncManager, CategoryType::RxPdo]
        );
    }
}
