//! Process data domains: a contiguous logical address region assembled from
//! slave PDO data, exchanged cyclically with LRD/LWR/LRW datagrams.

use crate::command::Command;
use crate::error::{Error, Item};
use crate::fmt;
use crate::pdu_loop::{PduHandle, PduLoop, PduPoll, PduQueue};
use crate::sync_manager_channel::Direction;
use crate::{MAX_DOMAIN_IMAGE, MAX_PDU_DATA, MAX_SLAVES};

/// Opaque handle to a domain created on a master.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DomainHandle(pub(crate) usize);

/// Aggregate working counter interpretation for one domain.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum WcState {
    /// No slave processed the domain's datagrams.
    #[default]
    Zero,
    /// Some but not all registered slaves exchanged data.
    Incomplete,
    /// All registered slaves exchanged data.
    Complete,
}

/// Cyclic state of one domain.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct DomainState {
    /// Sum of the working counters of the domain's datagrams in the last
    /// completed cycle.
    pub working_counter: u16,
    pub wc_state: WcState,
}

/// One FMMU-backed window inside a domain's image.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct FmmuMapping {
    /// Owning slave configuration (index into the master's config list).
    pub config: usize,
    /// Sync manager whose data this window carries.
    pub sync_index: u8,
    pub direction: Direction,
    /// Offset of the window inside the domain image.
    pub logical_offset: u32,
    /// Window size in bytes.
    pub size: u16,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum DatagramKind {
    Lrd,
    Lwr,
    Lrw,
}

/// One cyclic datagram covering a contiguous slice of the image.
#[derive(Debug, Copy, Clone)]
struct CyclicDatagram {
    kind: DatagramKind,
    /// Offset into the image.
    offset: u32,
    len: u16,
    expected_wc: u16,
    handle: Option<PduHandle>,
}

/// A contiguous logical address region holding a process data image.
#[derive(Debug, Default)]
pub struct Domain {
    logical_base: u32,
    image: heapless::Vec<u8, MAX_DOMAIN_IMAGE>,
    fmmus: heapless::Vec<FmmuMapping, { 2 * MAX_SLAVES }>,
    datagrams: heapless::Vec<CyclicDatagram, 8>,
    expected_wc: u16,
    state: DomainState,
}

impl Domain {
    /// Logical start address assigned at activation.
    pub(crate) fn logical_base(&self) -> u32 {
        self.logical_base
    }

    pub(crate) fn fmmu_mappings(&self) -> &[FmmuMapping] {
        &self.fmmus
    }

    /// Current byte size of the image.
    pub fn len(&self) -> usize {
        self.image.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.is_empty()
    }

    /// The process data image. Offsets come from PDO entry registration.
    pub fn data(&self) -> &[u8] {
        &self.image
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.image
    }

    pub fn state(&self) -> DomainState {
        self.state
    }

    pub(crate) fn expected_working_counter(&self) -> u16 {
        self.expected_wc
    }

    /// Reserve image space for one (config, sync manager) pair, or return
    /// the existing window: one FMMU covers the whole SM-mapped data of a
    /// sync manager within one domain.
    pub(crate) fn prepare_fmmu(
        &mut self,
        config: usize,
        sync_index: u8,
        direction: Direction,
        size: u16,
    ) -> Result<u32, Error> {
        if let Some(existing) = self
            .fmmus
            .iter()
            .find(|fmmu| fmmu.config == config && fmmu.sync_index == sync_index)
        {
            return Ok(existing.logical_offset);
        }

        let logical_offset = self.image.len() as u32;

        if self
            .image
            .resize(self.image.len() + usize::from(size), 0)
            .is_err()
        {
            return Err(Error::Capacity(Item::Domain));
        }

        self.fmmus
            .push(FmmuMapping {
                config,
                sync_index,
                direction,
                logical_offset,
                size,
            })
            .map_err(|_| Error::Capacity(Item::Fmmu))?;

        Ok(logical_offset)
    }

    /// Assign the logical base address and lay the image out into cyclic
    /// datagrams. Called once at master activation.
    pub(crate) fn finish(&mut self, logical_base: u32) -> Result<(), Error> {
        self.logical_base = logical_base;
        self.datagrams.clear();

        if self.image.is_empty() {
            return Ok(());
        }

        // Walk the windows in logical order, packing as many as fit into each
        // datagram. Windows were allocated contiguously, so a split can only
        // happen on a window boundary.
        let mut fmmus: heapless::Vec<FmmuMapping, { 2 * MAX_SLAVES }> = self.fmmus.clone();

        fmmus.sort_unstable_by_key(|fmmu| fmmu.logical_offset);

        // Slaves covered by the datagram under construction: (config, has a
        // read window, has a write window). The working counter increments
        // once per slave and direction, no matter how many windows map it.
        let mut members: heapless::Vec<(usize, bool, bool), MAX_SLAVES> = heapless::Vec::new();

        let mut start = 0u32;
        let mut end = 0u32;

        for fmmu in fmmus.iter() {
            let fmmu_end = fmmu.logical_offset + u32::from(fmmu.size);

            if usize::try_from(fmmu_end - start).map_err(|_| Error::Internal)? > MAX_PDU_DATA {
                // Flush what we have and start a new datagram
                self.flush_datagram(start, end, &members)?;

                start = fmmu.logical_offset;
                members.clear();
            }

            let at = match members
                .iter()
                .position(|(config, _, _)| *config == fmmu.config)
            {
                Some(at) => at,
                None => {
                    members
                        .push((fmmu.config, false, false))
                        .map_err(|_| Error::Capacity(Item::Fmmu))?;

                    members.len() - 1
                }
            };

            match fmmu.direction {
                Direction::MasterRead => members[at].1 = true,
                Direction::MasterWrite => members[at].2 = true,
            }

            end = fmmu_end;
        }

        self.flush_datagram(start, end, &members)?;

        self.expected_wc = self
            .datagrams
            .iter()
            .map(|datagram| datagram.expected_wc)
            .sum();

        fmt::debug!(
            "Domain at {:#010x}: {} bytes, {} datagrams, expected WC {}",
            self.logical_base,
            self.image.len(),
            self.datagrams.len(),
            self.expected_wc
        );

        Ok(())
    }

    fn flush_datagram(
        &mut self,
        start: u32,
        end: u32,
        members: &[(usize, bool, bool)],
    ) -> Result<(), Error> {
        if end <= start {
            return Ok(());
        }

        let reads = members.iter().filter(|(_, read, _)| *read).count() as u16;
        let writes = members.iter().filter(|(_, _, write)| *write).count() as u16;

        // Working counter contributions per ETG1000.4: a slave that reads
        // counts 1, one that writes counts 1 on LWR but 2 on LRW.
        let (kind, expected_wc) = match (reads, writes) {
            (0, w) => (DatagramKind::Lwr, w),
            (r, 0) => (DatagramKind::Lrd, r),
            (r, w) => (DatagramKind::Lrw, r + 2 * w),
        };

        self.datagrams
            .push(CyclicDatagram {
                kind,
                offset: start,
                len: (end - start) as u16,
                expected_wc,
                handle: None,
            })
            .map_err(|_| Error::Capacity(Item::Datagram))
    }

    /// Queue this cycle's datagrams into the main send queue.
    pub(crate) fn queue(&mut self, pdu_loop: &mut PduLoop) -> Result<(), Error> {
        for datagram in self.datagrams.iter_mut() {
            if let Some(stale) = datagram.handle.take() {
                // Previous cycle's exchange never completed
                pdu_loop.release(stale);
            }

            let address = self.logical_base + datagram.offset;
            let slice = &self.image
                [datagram.offset as usize..datagram.offset as usize + usize::from(datagram.len)];

            let handle = match datagram.kind {
                DatagramKind::Lrd => pdu_loop.request_read(
                    Command::lrd(address),
                    usize::from(datagram.len),
                    PduQueue::Main,
                )?,
                DatagramKind::Lwr => {
                    pdu_loop.request(Command::lwr(address), slice, PduQueue::Main)?
                }
                DatagramKind::Lrw => {
                    pdu_loop.request(Command::lrw(address), slice, PduQueue::Main)?
                }
            };

            datagram.handle = Some(handle);
        }

        Ok(())
    }

    /// Collect this cycle's replies and update the aggregate working counter
    /// state.
    pub(crate) fn process(&mut self, pdu_loop: &mut PduLoop, now: u64, cycle_timeout: u64) {
        let mut sum = 0u16;

        for i in 0..self.datagrams.len() {
            let Some(handle) = self.datagrams[i].handle else {
                continue;
            };

            match pdu_loop.poll(handle, now, cycle_timeout) {
                Ok(PduPoll::Ready { working_counter }) => {
                    let datagram = self.datagrams[i];

                    if !matches!(datagram.kind, DatagramKind::Lwr) {
                        if let Ok(data) = pdu_loop.data(handle) {
                            let at = datagram.offset as usize;

                            self.image[at..at + usize::from(datagram.len)]
                                .copy_from_slice(&data[..usize::from(datagram.len)]);
                        }
                    }

                    sum = sum.wrapping_add(working_counter);

                    pdu_loop.release(handle);
                    self.datagrams[i].handle = None;
                }
                Ok(PduPoll::TimedOut) => {
                    pdu_loop.release(handle);
                    self.datagrams[i].handle = None;
                }
                // Pending exchanges stay queued; their data lands next cycle
                Ok(PduPoll::Pending) => {}
                Err(_) => {
                    self.datagrams[i].handle = None;
                }
            }
        }

        self.state.working_counter = sum;
        self.state.wc_state = if sum == 0 {
            WcState::Zero
        } else if sum < self.expected_wc {
            WcState::Incomplete
        } else {
            WcState::Complete
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prepare_fmmu_is_idempotent_per_sync() {
        let mut domain = Domain::default();

        let first = domain
            .prepare_fmmu(0, 2, Direction::MasterWrite, 4)
            .unwrap();
        let again = domain
            .prepare_fmmu(0, 2, Direction::MasterWrite, 4)
            .unwrap();
        let other = domain.prepare_fmmu(0, 3, Direction::MasterRead, 2).unwrap();

        assert_eq!(first, 0);
        assert_eq!(again, 0);
        assert_eq!(other, 4);
        assert_eq!(domain.len(), 6);
    }

    #[test]
    fn finish_merges_mixed_directions_into_lrw() {
        let mut domain = Domain::default();

        domain.prepare_fmmu(0, 2, Direction::MasterWrite, 4).unwrap();
        domain.prepare_fmmu(0, 3, Direction::MasterRead, 2).unwrap();

        domain.finish(0x0001_0000).unwrap();

        assert_eq!(domain.datagrams.len(), 1);
        assert_eq!(domain.datagrams[0].kind, DatagramKind::Lrw);
        // 1 for the read + 2 for the write
        assert_eq!(domain.expected_working_counter(), 3);
    }

    #[test]
    fn finish_single_direction() {
        let mut outputs = Domain::default();

        outputs.prepare_fmmu(0, 2, Direction::MasterWrite, 1).unwrap();
        outputs.prepare_fmmu(1, 2, Direction::MasterWrite, 1).unwrap();
        outputs.finish(0).unwrap();

        assert_eq!(outputs.datagrams[0].kind, DatagramKind::Lwr);
        assert_eq!(outputs.expected_working_counter(), 2);

        let mut inputs = Domain::default();

        inputs.prepare_fmmu(0, 3, Direction::MasterRead, 2).unwrap();
        inputs.finish(0).unwrap();

        assert_eq!(inputs.datagrams[0].kind, DatagramKind::Lrd);
        assert_eq!(inputs.expected_working_counter(), 1);
    }

    #[test]
    fn large_domain_splits_at_window_boundary() {
        let mut domain = Domain::default();

        // Two windows of 1000 bytes cannot share one datagram
        domain
            .prepare_fmmu(0, 2, Direction::MasterWrite, 1000)
            .unwrap();
        domain
            .prepare_fmmu(1, 2, Direction::MasterWrite, 1000)
            .unwrap();

        domain.finish(0).unwrap();

        assert_eq!(domain.datagrams.len(), 2);
        assert_eq!(domain.datagrams[0].len, 1000);
        assert_eq!(domain.datagrams[1].offset, 1000);
    }

    #[test]
    fn image_capacity_bounded() {
        let mut domain = Domain::default();

        assert!(
            domain
                .prepare_fmmu(0, 2, Direction::MasterWrite, MAX_DOMAIN_IMAGE as u16 + 1)
                .is_err()
        );
    }
}
