//! Cache of SII images keyed by device identity.
//!
//! Reading a full EEPROM image takes hundreds of bus round trips, so images
//! of uniquely identifiable devices are kept for the life of the master and
//! reattached on rescan.

use super::types::{SiiIdentity, SiiImage};
use crate::fmt;

const CACHE_SLOTS: usize = 8;

#[derive(Debug, Default)]
pub struct SiiCache {
    entries: heapless::Vec<(SiiIdentity, SiiImage), CACHE_SLOTS>,
}

impl SiiCache {
    /// Look up a cached image for a device reporting `identity`.
    pub fn lookup(&self, identity: &SiiIdentity) -> Option<&SiiImage> {
        self.entries
            .iter()
            .find(|(key, _)| key.matches(identity))
            .map(|(_, image)| image)
    }

    /// Retain `image` if the device is uniquely identifiable. Oldest entry is
    /// evicted when full.
    pub fn insert(&mut self, image: &SiiImage) {
        let identity = image.identity();

        // Without an alias or serial the image cannot be told apart from a
        // sibling of the same type, so caching it would be wrong
        if identity.alias == 0 && identity.serial == 0 {
            return;
        }

        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|(key, _)| key.matches(&identity))
        {
            existing.1 = image.clone();

            return;
        }

        if self.entries.is_full() {
            fmt::debug!("SII cache full, evicting oldest image");

            self.entries.remove(0);
        }

        let _ = self.entries.push((identity, image.clone()));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_with(alias: u16, serial: u32) -> SiiImage {
        let mut words = [0u16; 0x10];

        words[0x04] = alias;
        words[0x0e] = serial as u16;
        words[0x0f] = (serial >> 16) as u16;

        SiiImage {
            words: heapless::Vec::from_slice(&words).unwrap(),
        }
    }

    #[test]
    fn reattach_by_alias() {
        let mut cache = SiiCache::default();

        let image = image_with(7, 0);

        cache.insert(&image);

        assert_eq!(cache.lookup(&image.identity()), Some(&image));
    }

    #[test]
    fn anonymous_devices_not_cached() {
        let mut cache = SiiCache::default();

        cache.insert(&image_with(0, 0));

        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn update_in_place() {
        let mut cache = SiiCache::default();

        cache.insert(&image_with(7, 0));

        let mut updated = image_with(7, 0);
        updated.words[0x05] = 0xaaaa;

        cache.insert(&updated);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(&updated.identity()), Some(&updated));
    }
}
