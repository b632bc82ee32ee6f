//! The cyclic datagram engine: descriptor pool, send queues and the frame
//! assembler that packs queued datagrams into Ethernet frames and matches
//! replies back to their descriptors by PDU index.

pub(crate) mod frame_header;
pub(crate) mod pdu_header;
pub(crate) mod pool;

use crate::command::Command;
use crate::device::Device;
use crate::error::{Error, PduError, PduValidationError};
use crate::ethernet::{ETHERNET_HEADER_LEN, EthernetAddress, EthernetFrame};
use crate::{ETHERCAT_ETHERTYPE, MASTER_ADDR, MAX_DATAGRAMS, MAX_PDU_DATA, fmt};
use ethercrab_wire::{EtherCrabWireRead, EtherCrabWireSized, EtherCrabWireWrite};
use frame_header::FrameHeader;
use pdu_header::{PDU_OVERHEAD, PduFlags, PduHeader};
use pool::{IndexAllocator, Pdu, PduState};

pub(crate) use pool::PduQueue;

/// Largest frame emitted or accepted: Ethernet header plus 1500 byte MTU.
const FRAME_BUF: usize = ETHERNET_HEADER_LEN + 1500;

/// EtherCAT payload capacity of one frame.
const FRAME_PAYLOAD: usize = 1500 - FrameHeader::PACKED_LEN;

/// Minimum Ethernet frame length (without FCS); shorter frames are padded.
const MIN_FRAME: usize = 60;

/// Sentinel for "no descriptor" in the index → slot map.
const NO_SLOT: u8 = u8::MAX;

/// Handle to an in-flight datagram descriptor.
///
/// Carries both the pool slot and the reserved PDU index so a stale handle
/// (kept across a release/reuse) is detected instead of silently reading
/// another exchange's data.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct PduHandle {
    slot: u8,
    index: u8,
}

/// Result of polling an in-flight datagram.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum PduPoll {
    /// No reply yet.
    Pending,
    /// Reply received; payload is readable until the handle is released.
    Ready {
        working_counter: u16,
    },
    TimedOut,
}

/// Transmit/receive statistics, including the dropped-reply counters.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PduStats {
    /// Frames handed to the device.
    pub tx_frames: u32,
    /// Frames accepted from the device.
    pub rx_frames: u32,
    /// PDUs sent.
    pub tx_pdus: u32,
    /// PDUs matched to a descriptor.
    pub rx_pdus: u32,
    /// Replies whose index did not match any in-flight descriptor (stale or
    /// corrupt).
    pub unmatched: u32,
    /// Replies that failed validation against their request.
    pub invalid: u32,
    /// Exchanges that hit their owner's deadline.
    pub timeouts: u32,
}

pub(crate) struct PduLoop {
    pdus: [Pdu; MAX_DATAGRAMS],
    index_alloc: IndexAllocator,
    /// Maps a reserved PDU index to its pool slot.
    index_map: [u8; 256],
    queue_main: heapless::Deque<PduHandle, MAX_DATAGRAMS>,
    /// Datagrams queued by the master's own state machines, possibly from
    /// outside the realtime context. Drained into the frame by
    /// [`send_queued`](Self::send_queued) when the `ext` flag is set.
    queue_ext: spin::Mutex<heapless::Deque<PduHandle, MAX_DATAGRAMS>>,
    src_addr: EthernetAddress,
    stats: PduStats,
}

impl PduLoop {
    pub fn new() -> Self {
        Self {
            pdus: core::array::from_fn(|_| Pdu::default()),
            index_alloc: IndexAllocator::new(),
            index_map: [NO_SLOT; 256],
            queue_main: heapless::Deque::new(),
            queue_ext: spin::Mutex::new(heapless::Deque::new()),
            src_addr: MASTER_ADDR,
            stats: PduStats::default(),
        }
    }

    pub fn stats(&self) -> PduStats {
        self.stats
    }

    /// Queue a datagram carrying the given payload.
    pub fn request(
        &mut self,
        command: Command,
        data: &[u8],
        queue: PduQueue,
    ) -> Result<PduHandle, Error> {
        if data.len() > MAX_PDU_DATA {
            return Err(Error::PduTooLong {
                len: data.len(),
                max: MAX_PDU_DATA,
            });
        }

        let slot = self
            .pdus
            .iter()
            .position(|pdu| pdu.state == PduState::Free)
            .ok_or(Error::Pdu(PduError::NoDescriptor))?;

        let index = self.index_alloc.alloc().ok_or(Error::Pdu(PduError::NoIndex))?;

        let pdu = &mut self.pdus[slot];

        pdu.reset();
        pdu.state = PduState::Queued;
        pdu.command = command;
        pdu.index = index;
        pdu.queue = queue;
        // Infallible: length checked above
        let _ = pdu.data.extend_from_slice(data);

        let handle = PduHandle {
            slot: slot as u8,
            index,
        };

        match queue {
            PduQueue::Main => self
                .queue_main
                .push_back(handle)
                .map_err(|_| Error::Pdu(PduError::NoDescriptor))?,
            PduQueue::Ext => self
                .queue_ext
                .lock()
                .push_back(handle)
                .map_err(|_| Error::Pdu(PduError::NoDescriptor))?,
        }

        Ok(handle)
    }

    /// Queue a read datagram: `len` zero bytes of payload for the slaves to
    /// fill in.
    pub fn request_read(
        &mut self,
        command: Command,
        len: usize,
        queue: PduQueue,
    ) -> Result<PduHandle, Error> {
        if len > MAX_PDU_DATA {
            return Err(Error::PduTooLong {
                len,
                max: MAX_PDU_DATA,
            });
        }

        // Zero length scratch: the payload is all zeroes anyway
        static ZEROES: [u8; MAX_PDU_DATA] = [0u8; MAX_PDU_DATA];

        self.request(command, &ZEROES[..len], queue)
    }

    fn checked(&self, handle: PduHandle) -> Result<&Pdu, Error> {
        let pdu = self
            .pdus
            .get(usize::from(handle.slot))
            .ok_or(Error::Pdu(PduError::InvalidIndex(handle.index)))?;

        if pdu.state == PduState::Free || pdu.index != handle.index {
            return Err(Error::Pdu(PduError::InvalidState));
        }

        Ok(pdu)
    }

    /// Poll an exchange against the owner's deadline.
    pub fn poll(&mut self, handle: PduHandle, now: u64, timeout: u64) -> Result<PduPoll, Error> {
        let state = self.checked(handle)?.state;
        let sent_at = self.pdus[usize::from(handle.slot)].sent_at;

        match state {
            PduState::Queued => Ok(PduPoll::Pending),
            PduState::Sent => {
                if now.saturating_sub(sent_at) >= timeout {
                    // The index goes back to the pool on timeout; the
                    // descriptor itself stays until released so the owner can
                    // decide whether to retry.
                    self.index_alloc.release(handle.index);
                    self.index_map[usize::from(handle.index)] = NO_SLOT;
                    self.pdus[usize::from(handle.slot)].state = PduState::TimedOut;
                    self.stats.timeouts += 1;

                    fmt::debug!(
                        "PDU index {} timed out after {} ns",
                        handle.index,
                        now.saturating_sub(sent_at)
                    );

                    Ok(PduPoll::TimedOut)
                } else {
                    Ok(PduPoll::Pending)
                }
            }
            PduState::Received => Ok(PduPoll::Ready {
                working_counter: self.pdus[usize::from(handle.slot)].working_counter,
            }),
            PduState::TimedOut => Ok(PduPoll::TimedOut),
            PduState::Free => Err(Error::Pdu(PduError::InvalidState)),
        }
    }

    /// Received payload of a completed exchange.
    pub fn data(&self, handle: PduHandle) -> Result<&[u8], Error> {
        Ok(&self.checked(handle)?.data)
    }

    /// Return a descriptor to the pool.
    pub fn release(&mut self, handle: PduHandle) {
        let Ok(_) = self.checked(handle) else {
            return;
        };

        let pdu = &mut self.pdus[usize::from(handle.slot)];

        // A descriptor released before its exchange finished still holds its
        // index reservation
        if matches!(pdu.state, PduState::Queued | PduState::Sent) {
            self.index_alloc.release(handle.index);
            self.index_map[usize::from(handle.index)] = NO_SLOT;
        }

        pdu.reset();
    }

    /// Number of datagrams waiting in the main queue.
    #[cfg(test)]
    pub fn queued(&self) -> usize {
        self.queue_main.len()
    }

    /// Pack queued datagrams into as few frames as possible, preserving FIFO
    /// order, and hand them to the device.
    ///
    /// When `include_ext` is set the state machine queue is drained into the
    /// cyclic queue first.
    pub fn send_queued(
        &mut self,
        device: &mut dyn Device,
        include_ext: bool,
        now: u64,
    ) -> Result<usize, Error> {
        if include_ext {
            let mut ext = self.queue_ext.lock();

            while let Some(handle) = ext.pop_front() {
                if self.queue_main.push_back(handle).is_err() {
                    // Push back and retry next cycle
                    let _ = ext.push_front(handle);
                    break;
                }
            }
        }

        let mut frames = 0;

        while !self.queue_main.is_empty() {
            frames += self.send_one_frame(device, now)?;
        }

        Ok(frames)
    }

    fn send_one_frame(&mut self, device: &mut dyn Device, now: u64) -> Result<usize, Error> {
        let mut buf = [0u8; FRAME_BUF];

        let mut used = 0usize;
        let mut last_header_at = None;
        let mut pdu_count = 0u32;

        while let Some(handle) = self.queue_main.front().copied() {
            let pdu = &self.pdus[usize::from(handle.slot)];

            // A release before send leaves a dangling queue entry; skip it
            if pdu.state != PduState::Queued || pdu.index != handle.index {
                let _ = self.queue_main.pop_front();
                continue;
            }

            let need = PDU_OVERHEAD + pdu.data.len();

            if used + need > FRAME_PAYLOAD {
                break;
            }

            let _ = self.queue_main.pop_front();

            let payload = &mut buf[ETHERNET_HEADER_LEN + FrameHeader::PACKED_LEN..];

            let header = PduHeader {
                command_code: pdu.command.code(),
                index: pdu.index,
                address: {
                    let mut addr = [0u8; 4];
                    pdu.command.pack_to_slice_unchecked(&mut addr);
                    addr
                },
                flags: PduFlags {
                    length: pdu.data.len() as u16,
                    circulated: false,
                    // Cleared again on the final PDU below
                    more_follows: true,
                },
                irq: 0,
            };

            header.pack_to_slice_unchecked(&mut payload[used..]);
            payload[used + PduHeader::PACKED_LEN..used + PduHeader::PACKED_LEN + pdu.data.len()]
                .copy_from_slice(&pdu.data);
            // Working counter starts at zero
            payload[used + need - 2..used + need].fill(0);

            last_header_at = Some(used);
            used += need;
            pdu_count += 1;

            let index = pdu.index;
            let slot = handle.slot;

            let pdu = &mut self.pdus[usize::from(slot)];
            pdu.state = PduState::Sent;
            pdu.sent_at = now;

            self.index_map[usize::from(index)] = slot;
        }

        let Some(last_header_at) = last_header_at else {
            return Ok(0);
        };

        // Clear the "more follows" bit of the final PDU: bit 15 of the flags
        // word at header offset 6
        buf[ETHERNET_HEADER_LEN + FrameHeader::PACKED_LEN + last_header_at + 7] &= 0x7f;

        FrameHeader::pdu(used as u16)
            .pack_to_slice_unchecked(&mut buf[ETHERNET_HEADER_LEN..]);

        let mut frame = EthernetFrame::new_checked(&mut buf[..]).map_err(|_| Error::Internal)?;

        frame.set_dst_addr(EthernetAddress::BROADCAST);
        frame.set_src_addr(self.src_addr);
        frame.set_ethertype(ETHERCAT_ETHERTYPE);

        let len = (ETHERNET_HEADER_LEN + FrameHeader::PACKED_LEN + used).max(MIN_FRAME);

        device.send(&buf[..len])?;

        self.stats.tx_frames += 1;
        self.stats.tx_pdus += pdu_count;

        Ok(1)
    }

    /// Demultiplex one received frame back onto the in-flight descriptors.
    ///
    /// Returns the number of PDUs matched. Unknown indices (stale replies,
    /// foreign traffic) are counted and dropped.
    pub fn receive_frame(&mut self, raw: &[u8]) -> Result<usize, Error> {
        let frame = EthernetFrame::new_checked(raw)?;

        if frame.ethertype() != ETHERCAT_ETHERTYPE {
            return Ok(0);
        }

        // Our own transmission looping back on some interfaces must not be
        // confused with the ring's reply: replies have our source address
        // too, so rely on the working counter/index state instead of source
        // filtering. A frame is only consumed if it answers in-flight PDUs.

        let header = FrameHeader::parse(frame.payload())?;

        let mut payload = frame
            .payload()
            .get(FrameHeader::PACKED_LEN..FrameHeader::PACKED_LEN + usize::from(header.payload_len))
            .ok_or(Error::ReceiveFrame)?;

        self.stats.rx_frames += 1;

        let mut matched = 0;

        loop {
            let pdu_header = PduHeader::unpack_from_slice(payload)?;

            let data_len = usize::from(pdu_header.flags.length);

            let data = payload
                .get(PduHeader::PACKED_LEN..PduHeader::PACKED_LEN + data_len)
                .ok_or(Error::ReceiveFrame)?;

            let wc_off = PduHeader::PACKED_LEN + data_len;

            let working_counter = u16::unpack_from_slice(
                payload.get(wc_off..wc_off + 2).ok_or(Error::ReceiveFrame)?,
            )?;

            matched += usize::from(self.accept(&pdu_header, data, working_counter));

            if !pdu_header.flags.more_follows {
                break;
            }

            payload = &payload[wc_off + 2..];
        }

        Ok(matched)
    }

    fn accept(&mut self, header: &PduHeader, data: &[u8], working_counter: u16) -> bool {
        let slot = self.index_map[usize::from(header.index)];

        if slot == NO_SLOT {
            self.stats.unmatched += 1;

            fmt::trace!("Dropping reply with unmatched PDU index {}", header.index);

            return false;
        }

        let pdu = &mut self.pdus[usize::from(slot)];

        if pdu.state != PduState::Sent {
            self.stats.unmatched += 1;

            return false;
        }

        if header.command_code != pdu.command.code() {
            self.stats.invalid += 1;

            fmt::warn!(
                "{}",
                PduValidationError::CommandMismatch {
                    sent: pdu.command.code(),
                    received: header.command_code,
                }
            );

            return false;
        }

        if usize::from(header.flags.length) != pdu.data.len() {
            self.stats.invalid += 1;

            fmt::warn!(
                "{}",
                PduValidationError::LengthMismatch {
                    sent: pdu.data.len() as u16,
                    received: header.flags.length,
                }
            );

            return false;
        }

        if pdu.command.reads_back() {
            pdu.data.clear();
            // Infallible: length validated against the request above
            let _ = pdu.data.extend_from_slice(data);
        }

        pdu.working_counter = working_counter;
        pdu.state = PduState::Received;

        // Reception ends the index reservation
        self.index_alloc.release(header.index);
        self.index_map[usize::from(header.index)] = NO_SLOT;

        self.stats.rx_pdus += 1;

        true
    }
}

/// Payload cap for one [`RegisterExchange`], sized for the largest register
/// block written in one go (all 16 FMMU entities).
pub(crate) const REG_DATA_MAX: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum RegPoll {
    Pending,
    /// Exchange complete. The working counter is the caller's to judge;
    /// broadcast reads legitimately see many different values.
    Done { working_counter: u16 },
    Failed(Error),
}

/// One register read or write with bounded retry on timeout.
///
/// The state machines' workhorse: issue, poll every step, get the reply or a
/// terminal failure after the retries are spent.
#[derive(Debug, Default)]
pub(crate) struct RegisterExchange {
    pdu: Option<PduHandle>,
    command: Command,
    payload: heapless::Vec<u8, REG_DATA_MAX>,
    data: heapless::Vec<u8, REG_DATA_MAX>,
    retries: u8,
    active: bool,
}

impl RegisterExchange {
    const RETRIES: u8 = 3;

    /// Issue a write of `payload` (or a read when `payload` is all zeroes by
    /// way of [`Self::read`]).
    pub fn write(
        &mut self,
        pdu_loop: &mut PduLoop,
        command: Command,
        payload: &[u8],
    ) -> Result<(), Error> {
        self.payload = heapless::Vec::from_slice(payload).map_err(|_| Error::PduTooLong {
            len: payload.len(),
            max: REG_DATA_MAX,
        })?;
        self.command = command;
        self.retries = 0;
        self.active = true;

        self.reissue(pdu_loop)
    }

    /// Issue a read of `len` bytes.
    pub fn read(&mut self, pdu_loop: &mut PduLoop, command: Command, len: usize) -> Result<(), Error> {
        if len > REG_DATA_MAX {
            return Err(Error::PduTooLong {
                len,
                max: REG_DATA_MAX,
            });
        }

        self.payload.clear();
        self.payload.resize(len, 0).ok();
        self.command = command;
        self.retries = 0;
        self.active = true;

        self.reissue(pdu_loop)
    }

    /// Reply payload after `poll` returned `Done`.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop) {
        if let Some(handle) = self.pdu.take() {
            pdu_loop.release(handle);
        }

        self.active = false;
    }

    pub fn poll(&mut self, pdu_loop: &mut PduLoop, now: u64, pdu_timeout: u64) -> RegPoll {
        if !self.active {
            return RegPoll::Failed(Error::Internal);
        }

        let Some(handle) = self.pdu else {
            return RegPoll::Failed(Error::Internal);
        };

        match pdu_loop.poll(handle, now, pdu_timeout) {
            Ok(PduPoll::Pending) => RegPoll::Pending,
            Ok(PduPoll::Ready { working_counter }) => {
                self.data.clear();

                if let Ok(data) = pdu_loop.data(handle) {
                    let _ = self.data.extend_from_slice(&data[..data.len().min(REG_DATA_MAX)]);
                }

                pdu_loop.release(handle);
                self.pdu = None;
                self.active = false;

                RegPoll::Done { working_counter }
            }
            Ok(PduPoll::TimedOut) => {
                pdu_loop.release(handle);
                self.pdu = None;

                self.retries += 1;

                if self.retries > Self::RETRIES {
                    self.active = false;

                    return RegPoll::Failed(Error::Timeout);
                }

                match self.reissue(pdu_loop) {
                    Ok(()) => RegPoll::Pending,
                    Err(e) => {
                        self.active = false;

                        RegPoll::Failed(e)
                    }
                }
            }
            Err(e) => {
                self.pdu = None;
                self.active = false;

                RegPoll::Failed(e)
            }
        }
    }

    fn reissue(&mut self, pdu_loop: &mut PduLoop) -> Result<(), Error> {
        self.pdu = Some(pdu_loop.request(self.command, &self.payload, PduQueue::Ext)?);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Device;

    /// Loopback device: echoes frames back with every PDU's working counter
    /// incremented once.
    struct Loopback {
        frames: heapless::Deque<heapless::Vec<u8, FRAME_BUF>, 4>,
    }

    impl Loopback {
        fn new() -> Self {
            Self {
                frames: heapless::Deque::new(),
            }
        }
    }

    impl Device for Loopback {
        fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
            let mut copy: heapless::Vec<u8, FRAME_BUF> =
                heapless::Vec::from_slice(frame).map_err(|_| Error::SendFrame)?;

            // Walk the PDUs, bump each working counter
            let header = FrameHeader::parse(&copy[ETHERNET_HEADER_LEN..]).unwrap();
            let mut offset = ETHERNET_HEADER_LEN + FrameHeader::PACKED_LEN;
            let end = offset + usize::from(header.payload_len);

            while offset < end {
                let pdu_header = PduHeader::unpack_from_slice(&copy[offset..]).unwrap();
                let wc_at = offset + PduHeader::PACKED_LEN + usize::from(pdu_header.flags.length);

                copy[wc_at] = copy[wc_at].wrapping_add(1);

                if !pdu_header.flags.more_follows {
                    break;
                }

                offset = wc_at + 2;
            }

            self.frames.push_back(copy).map_err(|_| Error::SendFrame)
        }

        fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
            Ok(self.frames.pop_front().map(|frame| {
                buf[..frame.len()].copy_from_slice(&frame);

                frame.len()
            }))
        }
    }

    fn drain(pdu_loop: &mut PduLoop, device: &mut Loopback) {
        let mut buf = [0u8; FRAME_BUF];

        while let Some(len) = device.receive(&mut buf).unwrap() {
            pdu_loop.receive_frame(&buf[..len]).unwrap();
        }
    }

    #[test]
    fn round_trip_single() {
        let mut pdu_loop = PduLoop::new();
        let mut device = Loopback::new();

        let handle = pdu_loop
            .request(
                Command::fpwr(0x1000, 0x0120),
                &[0x01, 0x00],
                PduQueue::Main,
            )
            .unwrap();

        assert_eq!(pdu_loop.send_queued(&mut device, false, 0).unwrap(), 1);

        drain(&mut pdu_loop, &mut device);

        assert_eq!(
            pdu_loop.poll(handle, 100, 1_000).unwrap(),
            PduPoll::Ready { working_counter: 1 }
        );
        assert_eq!(pdu_loop.data(handle).unwrap(), &[0x01, 0x00]);

        pdu_loop.release(handle);

        // Slot is reusable again
        assert!(
            pdu_loop
                .request(Command::brd(0), &[0; 2], PduQueue::Main)
                .is_ok()
        );
    }

    #[test]
    fn multiple_pdus_one_frame() {
        let mut pdu_loop = PduLoop::new();
        let mut device = Loopback::new();

        let handles: heapless::Vec<_, 4> = (0..4)
            .map(|i| {
                pdu_loop
                    .request_read(Command::fprd(0x1000 + i, 0x0130), 2, PduQueue::Main)
                    .unwrap()
            })
            .collect();

        // All four fit into a single frame
        assert_eq!(pdu_loop.send_queued(&mut device, false, 0).unwrap(), 1);

        drain(&mut pdu_loop, &mut device);

        for handle in handles {
            assert!(matches!(
                pdu_loop.poll(handle, 0, 1_000).unwrap(),
                PduPoll::Ready { .. }
            ));

            pdu_loop.release(handle);
        }
    }

    #[test]
    fn fills_frames_in_fifo_order() {
        let mut pdu_loop = PduLoop::new();
        let mut device = Loopback::new();

        // Two PDUs of 800 bytes each cannot share a 1498 byte frame
        let a = pdu_loop
            .request_read(Command::lrd(0), 800, PduQueue::Main)
            .unwrap();
        let b = pdu_loop
            .request_read(Command::lrd(800), 800, PduQueue::Main)
            .unwrap();

        assert_eq!(pdu_loop.send_queued(&mut device, false, 0).unwrap(), 2);

        drain(&mut pdu_loop, &mut device);

        for handle in [a, b] {
            assert!(matches!(
                pdu_loop.poll(handle, 0, 1_000).unwrap(),
                PduPoll::Ready { .. }
            ));

            pdu_loop.release(handle);
        }
    }

    #[test]
    fn oversize_pdu_rejected() {
        let mut pdu_loop = PduLoop::new();

        assert_eq!(
            pdu_loop.request_read(Command::lrd(0), MAX_PDU_DATA + 1, PduQueue::Main),
            Err(Error::PduTooLong {
                len: MAX_PDU_DATA + 1,
                max: MAX_PDU_DATA
            })
        );
    }

    #[test]
    fn timeout_releases_index() {
        let mut pdu_loop = PduLoop::new();
        let mut device = Loopback::new();

        let handle = pdu_loop
            .request_read(Command::fprd(0x1000, 0x0130), 2, PduQueue::Main)
            .unwrap();

        pdu_loop.send_queued(&mut device, false, 0).unwrap();

        // Reply never delivered; deadline passes
        assert_eq!(
            pdu_loop.poll(handle, 2_000_000, 1_000_000).unwrap(),
            PduPoll::TimedOut
        );

        assert_eq!(pdu_loop.stats().timeouts, 1);

        pdu_loop.release(handle);

        // The late reply is now stale and must be dropped
        let mut buf = [0u8; FRAME_BUF];

        if let Some(len) = device.receive(&mut buf).unwrap() {
            pdu_loop.receive_frame(&buf[..len]).unwrap();
        }

        assert_eq!(pdu_loop.stats().unmatched, 1);
    }

    #[test]
    fn ext_queue_flushed_separately() {
        let mut pdu_loop = PduLoop::new();
        let mut device = Loopback::new();

        let _ext = pdu_loop
            .request_read(Command::brd(0x0130), 2, PduQueue::Ext)
            .unwrap();

        // Plain send must not touch the ext queue
        assert_eq!(pdu_loop.send_queued(&mut device, false, 0).unwrap(), 0);
        assert_eq!(pdu_loop.send_queued(&mut device, true, 0).unwrap(), 1);
    }
}
