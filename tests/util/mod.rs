//! A deterministic in-process EtherCAT segment used by the integration
//! tests: a handful of simulated slaves with registers, SII, AL state
//! machine, mailbox protocol servers and FMMU-mapped process data, driven
//! through the same `Device`/`Clock` seams a real network would be.

#![allow(dead_code)]

use ethermite::{Clock, Device, Error};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

pub const EC_HEADER: usize = 14 + 2;

/// Beckhoff vendor id used by the canned devices.
pub const BECKHOFF: u32 = 0x0000_0002;
pub const EK1100_PRODUCT: u32 = 0x044c_2c52;
pub const EL2008_PRODUCT: u32 = 0x07d8_3052;
pub const EL5001_PRODUCT: u32 = 0x1389_3052;

const MEM_SIZE: usize = 0x4000;

/// Mailbox geometry used by all simulated devices.
pub const MBOX_RX_OFFSET: u16 = 0x1000;
pub const MBOX_TX_OFFSET: u16 = 0x1080;
pub const MBOX_SIZE: u16 = 0x0080;

/// One simulated slave.
pub struct SimSlave {
    pub online: bool,
    /// Flat physical memory: registers and DPRAM.
    pub mem: Vec<u8>,
    pub sii: Vec<u16>,

    pub al_state: u8,
    pub al_error: bool,
    pub al_status_code: u16,
    /// Refuse the transition to OP with "invalid output configuration".
    pub refuse_op: bool,

    /// CoE object dictionary, keyed by `index << 8 | sub`.
    pub objects: HashMap<u32, Vec<u8>>,
    /// FoE file store.
    pub files: HashMap<String, Vec<u8>>,
    /// SoE IDN store.
    pub idns: HashMap<u16, Vec<u8>>,
    /// Result code returned to EoE set-IP requests.
    pub eoe_result: u16,
    /// IP parameter blob from the last EoE request.
    pub eoe_request: Vec<u8>,

    /// Queued mailbox responses: (type nibble, payload).
    tx_mbox: VecDeque<(u8, Vec<u8>)>,
    mbox_counter: u8,
    /// In-progress FoE download to the slave.
    foe_rx: Option<(String, Vec<u8>)>,
    /// In-progress FoE upload from the slave: (data, offset, packet no).
    foe_tx: Option<(Vec<u8>, usize, u32)>,
    /// DATA packets received over FoE, for transfer accounting in tests.
    pub foe_data_packets: u32,
    /// In-progress segmented SDO upload: (data, offset).
    sdo_segment: Option<(Vec<u8>, usize)>,
    /// In-progress fragmented SoE download.
    soe_rx: Vec<u8>,
    /// System time write awaiting the bus timestamp: (value, width).
    pending_time_write: Option<(u64, usize)>,

    pub dc_supported: bool,
    pub has_64bit_dc: bool,
    /// Local clock drift in parts per billion.
    pub drift_ppb: i64,
    /// Port receive times latched by the delay measurement broadcast.
    pub port_times: [u32; 4],
    /// This device loops back at port 0 (end of chain).
    pub is_last: bool,

    pub fmmu_count: u8,
    pub sm_count: u8,
}

/// Build a minimal SII image for a device.
pub struct SiiBuilder {
    words: Vec<u16>,
}

impl SiiBuilder {
    pub fn new(vendor: u32, product: u32, revision: u32, serial: u32) -> Self {
        let mut words = vec![0u16; 0x40];

        words[0x08] = vendor as u16;
        words[0x09] = (vendor >> 16) as u16;
        words[0x0a] = product as u16;
        words[0x0b] = (product >> 16) as u16;
        words[0x0c] = revision as u16;
        words[0x0d] = (revision >> 16) as u16;
        words[0x0e] = serial as u16;
        words[0x0f] = (serial >> 16) as u16;

        Self { words }
    }

    pub fn alias(mut self, alias: u16) -> Self {
        self.words[0x04] = alias;
        self
    }

    /// Standard mailbox words plus the supported protocol mask.
    pub fn mailbox(mut self, protocols: u16) -> Self {
        self.words[0x18] = MBOX_RX_OFFSET;
        self.words[0x19] = MBOX_SIZE;
        self.words[0x1a] = MBOX_TX_OFFSET;
        self.words[0x1b] = MBOX_SIZE;
        self.words[0x1c] = protocols;
        self
    }

    /// Append a raw category.
    pub fn category(mut self, kind: u16, data: &[u16]) -> Self {
        self.words.push(kind);
        self.words.push(data.len() as u16);
        self.words.extend_from_slice(data);
        self
    }

    /// Sync manager category for the standard mailbox + 2 process data SMs.
    pub fn standard_sync_managers(self, out_start: u16, out_len: u16, in_start: u16, in_len: u16) -> Self {
        // Descriptor words: start, length, control/status, enable/usage
        let sm = |start: u16, len: u16, control: u16, usage: u16| {
            [start, len, control, 0x0001 | usage << 8]
        };

        let mut data = Vec::new();

        data.extend_from_slice(&sm(MBOX_RX_OFFSET, MBOX_SIZE, 0x0026, 1));
        data.extend_from_slice(&sm(MBOX_TX_OFFSET, MBOX_SIZE, 0x0022, 2));
        data.extend_from_slice(&sm(out_start, out_len, 0x0024, 3));
        data.extend_from_slice(&sm(in_start, in_len, 0x0020, 4));

        self.category(41, &data)
    }

    /// An RxPDO (`0x16xx`) or TxPDO (`0x1axx`) with single-entry mapping.
    pub fn pdo(self, kind: u16, pdo_index: u16, sm: u16, entries: &[(u16, u8, u8)]) -> Self {
        let mut data = vec![pdo_index, (sm << 8) | entries.len() as u16, 0, 0];

        for (index, sub, bits) in entries {
            data.push(*index);
            data.push(u16::from(*sub));
            data.push(u16::from(*bits) << 8);
            data.push(0);
        }

        self.category(kind, &data)
    }

    pub fn build(mut self) -> Vec<u16> {
        self.words.push(0xffff);
        self.words
    }
}

impl SimSlave {
    pub fn new(sii: Vec<u16>) -> Self {
        Self {
            online: true,
            mem: vec![0u8; MEM_SIZE],
            sii,
            al_state: 0x01,
            al_error: false,
            al_status_code: 0,
            refuse_op: false,
            objects: HashMap::new(),
            files: HashMap::new(),
            idns: HashMap::new(),
            eoe_result: 0,
            eoe_request: Vec::new(),
            tx_mbox: VecDeque::new(),
            mbox_counter: 0,
            foe_rx: None,
            foe_tx: None,
            foe_data_packets: 0,
            sdo_segment: None,
            soe_rx: Vec::new(),
            pending_time_write: None,
            dc_supported: true,
            has_64bit_dc: true,
            drift_ppb: 0,
            port_times: [0; 4],
            is_last: false,
            fmmu_count: 8,
            sm_count: 8,
        }
    }

    fn station_address(&self) -> u16 {
        u16::from_le_bytes([self.mem[0x10], self.mem[0x11]])
    }

    fn features(&self) -> u16 {
        let mut raw = 0u16;

        if self.dc_supported {
            raw |= 1 << 2;
        }

        if self.has_64bit_dc {
            raw |= 1 << 3;
        }

        // LRW support
        raw |= 1 << 9;

        raw
    }

    fn dl_status(&self) -> u16 {
        // PDI operational, link on port 0, port 1 open unless last
        let mut raw = 0x0001 | 1 << 4;

        if self.is_last {
            // Loopback on port 1
            raw |= 1 << 10;
        } else {
            raw |= 1 << 5;
        }

        raw
    }

    /// Local DC clock, drifting relative to the bus time.
    fn local_time(&self, bus_time: u64) -> u64 {
        let drifted = bus_time as i128 * (1_000_000_000 + i128::from(self.drift_ppb))
            / 1_000_000_000;

        drifted as u64
    }

    fn system_time(&self, bus_time: u64) -> u64 {
        let offset = u64::from_le_bytes(self.mem[0x920..0x928].try_into().unwrap());

        self.local_time(bus_time).wrapping_add(offset)
    }

    /// Register/memory read with behavioural overlays.
    fn read(&mut self, reg: u16, out: &mut [u8], bus_time: u64) {
        let reg = usize::from(reg);

        // Serve from flat memory first
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.mem.get(reg + i).copied().unwrap_or(0);
        }

        let overlay = |out: &mut [u8], at: usize, data: &[u8]| {
            for (i, byte) in data.iter().enumerate() {
                if at + i >= reg && at + i < reg + out.len() {
                    out[at + i - reg] = *byte;
                }
            }
        };

        // Base info block
        overlay(out, 0x0000, &[0x04, 0x02]);
        overlay(out, 0x0004, &[self.fmmu_count, self.sm_count]);
        overlay(out, 0x0007, &[if self.is_last { 0b0000_0111 } else { 0b0000_1111 }]);
        overlay(out, 0x0008, &self.features().to_le_bytes());
        overlay(out, 0x0110, &self.dl_status().to_le_bytes());

        // AL status + code
        let al = u16::from(self.al_state) | u16::from(self.al_error) << 4;

        overlay(out, 0x0130, &al.to_le_bytes());
        overlay(out, 0x0134, &self.al_status_code.to_le_bytes());

        // SII: status word (never busy), address echo, data
        let sii_addr = u16::from_le_bytes([self.mem[0x504], self.mem[0x505]]);
        let word = |at: u16| -> u16 {
            self.sii.get(usize::from(at)).copied().unwrap_or(0xffff)
        };

        overlay(out, 0x0502, &[0x00, 0x00]);
        overlay(out, 0x0508, &word(sii_addr).to_le_bytes());
        overlay(out, 0x050a, &word(sii_addr + 1).to_le_bytes());

        // TX mailbox sync manager status: bit 3 = mailbox full
        let tx_status: u8 = if self.tx_mbox.is_empty() { 0x00 } else { 0x08 };

        overlay(out, 0x080d, &[tx_status]);

        // DC system time
        overlay(out, 0x0910, &self.system_time(bus_time).to_le_bytes());

        // TX mailbox region
        let tx_offset = usize::from(MBOX_TX_OFFSET);

        if reg == tx_offset {
            if let Some((mbox_type, payload)) = self.tx_mbox.pop_front() {
                self.mbox_counter = if self.mbox_counter >= 7 {
                    1
                } else {
                    self.mbox_counter + 1
                };

                let mut frame = vec![0u8; usize::from(MBOX_SIZE)];

                frame[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
                frame[2..4].copy_from_slice(&self.station_address().to_le_bytes());
                frame[5] = mbox_type | self.mbox_counter << 4;
                frame[6..6 + payload.len()].copy_from_slice(&payload);

                overlay(out, tx_offset, &frame);
            }
        }
    }

    /// Register/memory write with behavioural overlays.
    fn write(&mut self, reg: u16, data: &[u8]) {
        let reg = usize::from(reg);

        for (i, byte) in data.iter().enumerate() {
            if let Some(slot) = self.mem.get_mut(reg + i) {
                *slot = *byte;
            }
        }

        // AL control
        if reg <= 0x0120 && reg + data.len() > 0x0120 {
            let value = u16::from_le_bytes([self.mem[0x120], self.mem[0x121]]);

            self.al_control(value);
        }

        // System time write: the DC servo pulls the local clock onto the
        // written value, modelled as an offset adjustment
        if reg == 0x0910 && (data.len() == 4 || data.len() == 8) {
            let mut raw = [0u8; 8];

            raw[..data.len().min(8)].copy_from_slice(&data[..data.len().min(8)]);

            let written = u64::from_le_bytes(raw);

            self.pending_time_write = Some((written, data.len()));
        }

        // RX mailbox written in full
        if reg == usize::from(MBOX_RX_OFFSET) {
            self.mailbox_request();
        }
    }

    fn apply_time_write(&mut self, bus_time: u64) {
        if let Some((written, len)) = self.pending_time_write.take() {
            let local = self.local_time(bus_time);

            let offset = if len == 8 {
                written.wrapping_sub(local)
            } else {
                // 32 bit DC: only the low word is servoed
                u64::from((written as u32).wrapping_sub(local as u32))
            };

            self.mem[0x920..0x928].copy_from_slice(&offset.to_le_bytes());
        }
    }

    fn al_control(&mut self, value: u16) {
        let requested = (value & 0x0f) as u8;
        let acknowledge = value & 0x10 != 0;

        if acknowledge {
            self.al_error = false;
            self.al_status_code = 0;
        }

        if requested == self.al_state {
            return;
        }

        if requested == 0x08 && self.refuse_op {
            self.al_error = true;
            // Invalid output configuration
            self.al_status_code = 0x001d;

            return;
        }

        let allowed = matches!(
            (self.al_state, requested),
            (_, 0x01)
                | (0x01, 0x02)
                | (0x01, 0x03)
                | (0x02, 0x04)
                | (0x04, 0x08)
                | (0x04, 0x02)
                | (0x08, 0x04)
                | (0x08, 0x02)
        );

        if allowed {
            self.al_state = requested;
        } else {
            self.al_error = true;
            // Invalid requested state change
            self.al_status_code = 0x0011;
        }
    }

    fn queue_response(&mut self, mbox_type: u8, payload: Vec<u8>) {
        self.tx_mbox.push_back((mbox_type, payload));
    }

    fn mailbox_request(&mut self) {
        let rx = usize::from(MBOX_RX_OFFSET);
        let header_len =
            u16::from_le_bytes([self.mem[rx], self.mem[rx + 1]]) as usize;
        let mbox_type = self.mem[rx + 5] & 0x0f;

        let payload: Vec<u8> = self.mem[rx + 6..rx + 6 + header_len.min(usize::from(MBOX_SIZE) - 6)].to_vec();

        match mbox_type {
            0x03 => self.coe_request(&payload),
            0x04 => self.foe_request(&payload),
            0x02 => self.eoe_request(&payload),
            0x05 => self.soe_request(&payload),
            0x0f => self.voe_request(&payload),
            other => {
                // Mailbox error reply: service + "unsupported protocol"
                self.queue_response(0x00, vec![0x01, 0x00, 0x02, 0x00]);

                let _ = other;
            }
        }
    }

    /// Usable mailbox payload for responses.
    fn mbox_payload(&self) -> usize {
        usize::from(MBOX_SIZE) - 6
    }

    fn coe_abort(&mut self, index: u16, sub: u8, code: u32) {
        let mut out = vec![0u8; 10];

        // Service: SDO request, command: abort
        out[1] = 0x20;
        out[2] = 0x80;
        out[3..5].copy_from_slice(&index.to_le_bytes());
        out[5] = sub;
        out[6..10].copy_from_slice(&code.to_le_bytes());

        self.queue_response(0x03, out);
    }

    fn coe_request(&mut self, payload: &[u8]) {
        if payload.len() < 2 {
            return;
        }

        let service = payload[1] >> 4;

        match service {
            // SDO request
            0x02 => self.sdo_request(payload),
            // SDO information
            0x08 => self.sdo_info_request(payload),
            _ => {}
        }
    }

    fn sdo_request(&mut self, payload: &[u8]) {
        if payload.len() < 6 {
            return;
        }

        let flags = payload[2];
        let command = flags >> 5;
        let index = u16::from_le_bytes([payload[3], payload[4]]);
        let sub = payload[5];
        let key = u32::from(index) << 8 | u32::from(sub);

        match command {
            // Download
            0x01 => {
                let expedited = flags & 0x02 != 0;

                let data = if expedited {
                    let size = 4 - usize::from(flags >> 2 & 0x03);

                    payload[6..6 + size].to_vec()
                } else {
                    let size =
                        u32::from_le_bytes([payload[6], payload[7], payload[8], payload[9]])
                            as usize;

                    payload[10..10 + size.min(payload.len() - 10)].to_vec()
                };

                if !self.objects.contains_key(&key) {
                    self.coe_abort(index, sub, 0x0602_0000);

                    return;
                }

                self.objects.insert(key, data);

                let mut out = vec![0u8; 10];

                out[1] = 0x30;
                out[2] = 0x60;
                out[3..5].copy_from_slice(&index.to_le_bytes());
                out[5] = sub;

                self.queue_response(0x03, out);
            }
            // Upload
            0x02 => {
                let Some(value) = self.objects.get(&key).cloned() else {
                    self.coe_abort(index, sub, 0x0602_0000);

                    return;
                };

                if value.len() <= 4 {
                    let mut out = vec![0u8; 10];

                    out[1] = 0x30;
                    out[2] = 0x43 | ((4 - value.len() as u8) << 2);
                    out[3..5].copy_from_slice(&index.to_le_bytes());
                    out[5] = sub;
                    out[6..6 + value.len()].copy_from_slice(&value);

                    self.queue_response(0x03, out);
                } else {
                    // Normal response with the first fragment; the rest goes
                    // out via upload segments
                    let room = self.mbox_payload() - 10;
                    let first = value.len().min(room);

                    let mut out = vec![0u8; 10 + first];

                    out[1] = 0x30;
                    out[2] = 0x41;
                    out[3..5].copy_from_slice(&index.to_le_bytes());
                    out[5] = sub;
                    out[6..10].copy_from_slice(&(value.len() as u32).to_le_bytes());
                    out[10..].copy_from_slice(&value[..first]);

                    self.sdo_segment = if first < value.len() {
                        Some((value, first))
                    } else {
                        None
                    };

                    self.queue_response(0x03, out);
                }
            }
            // Upload segment
            0x03 => {
                let toggle = flags & 0x10;

                let Some((value, offset)) = self.sdo_segment.take() else {
                    self.coe_abort(0, 0, 0x0800_0000);

                    return;
                };

                let remaining = value.len() - offset;
                let room = self.mbox_payload() - 3;
                let chunk = remaining.min(room);
                let last = chunk == remaining;

                let mut out;

                if chunk > 7 {
                    out = vec![0u8; 3 + chunk];
                    out[3..].copy_from_slice(&value[offset..offset + chunk]);
                } else {
                    // Minimum data area is 7 bytes; flag the unused tail
                    out = vec![0u8; 10];
                    out[3..3 + chunk].copy_from_slice(&value[offset..offset + chunk]);
                    out[2] |= ((7 - chunk) as u8) << 1;
                }

                out[1] = 0x30;
                out[2] |= toggle | u8::from(last);

                if !last {
                    self.sdo_segment = Some((value, offset + chunk));
                }

                self.queue_response(0x03, out);
            }
            _ => self.coe_abort(index, sub, 0x0504_0001),
        }
    }

    fn sdo_info_request(&mut self, payload: &[u8]) {
        if payload.len() < 6 {
            return;
        }

        let op_code = payload[2] & 0x7f;

        match op_code {
            // Get OD list
            0x01 => {
                let mut indices: Vec<u16> = self
                    .objects
                    .keys()
                    .map(|key| (key >> 8) as u16)
                    .collect();

                indices.sort_unstable();
                indices.dedup();

                let mut out = vec![0u8; 8 + indices.len() * 2];

                out[1] = 0x80;
                out[2] = 0x02;
                out[6..8].copy_from_slice(&1u16.to_le_bytes());

                for (i, index) in indices.iter().enumerate() {
                    out[8 + i * 2..10 + i * 2].copy_from_slice(&index.to_le_bytes());
                }

                self.queue_response(0x03, out);
            }
            // Get object description
            0x03 => {
                let index = u16::from_le_bytes([payload[6], payload[7]]);

                let max_sub = self
                    .objects
                    .keys()
                    .filter(|key| (*key >> 8) as u16 == index)
                    .map(|key| (key & 0xff) as u8)
                    .max()
                    .unwrap_or(0);

                let mut out = vec![0u8; 12];

                out[1] = 0x80;
                out[2] = 0x04;
                out[6..8].copy_from_slice(&index.to_le_bytes());
                out[10] = max_sub;
                out[11] = 0x07;

                self.queue_response(0x03, out);
            }
            // Get entry description
            0x05 => {
                let index = u16::from_le_bytes([payload[6], payload[7]]);
                let sub = payload[8];

                let mut out = vec![0u8; 16];

                out[1] = 0x80;
                out[2] = 0x06;
                out[6..8].copy_from_slice(&index.to_le_bytes());
                out[8] = sub;

                self.queue_response(0x03, out);
            }
            _ => {}
        }
    }

    fn foe_request(&mut self, payload: &[u8]) {
        if payload.len() < 6 {
            return;
        }

        let opcode = payload[0];
        let field = u32::from_le_bytes([payload[2], payload[3], payload[4], payload[5]]);

        let ack = |packet: u32| {
            let mut out = vec![0u8; 6];

            out[0] = 4;
            out[2..6].copy_from_slice(&packet.to_le_bytes());

            out
        };

        match opcode {
            // WRQ
            2 => {
                let name = String::from_utf8_lossy(&payload[6..]).into_owned();

                self.foe_rx = Some((name, Vec::new()));

                self.queue_response(0x04, ack(0));
            }
            // DATA
            3 => {
                self.foe_data_packets += 1;

                let full_fragment = self.mbox_payload() - 6;
                let chunk = &payload[6..];
                let last = chunk.len() < full_fragment;

                if let Some((name, mut data)) = self.foe_rx.take() {
                    data.extend_from_slice(chunk);

                    if last {
                        self.files.insert(name, data);
                    } else {
                        self.foe_rx = Some((name, data));
                    }
                }

                self.queue_response(0x04, ack(field));
            }
            // RRQ
            1 => {
                let name = String::from_utf8_lossy(&payload[6..]).into_owned();

                match self.files.get(&name).cloned() {
                    Some(data) => {
                        self.foe_tx = Some((data, 0, 1));
                        self.foe_send_next();
                    }
                    None => {
                        let mut out = vec![0u8; 6];

                        out[0] = 5;
                        // "File not found"
                        out[2..6].copy_from_slice(&0x8001u32.to_le_bytes());

                        self.queue_response(0x04, out);
                    }
                }
            }
            // ACK of a served DATA packet
            4 => {
                self.foe_send_next();
            }
            _ => {}
        }
    }

    fn foe_send_next(&mut self) {
        let Some((data, offset, packet)) = self.foe_tx.take() else {
            return;
        };

        let full_fragment = self.mbox_payload() - 6;
        let chunk = (data.len() - offset).min(full_fragment);

        let mut out = vec![0u8; 6 + chunk];

        out[0] = 3;
        out[2..6].copy_from_slice(&packet.to_le_bytes());
        out[6..].copy_from_slice(&data[offset..offset + chunk]);

        // A full-size fragment means more follow (possibly an empty one)
        if chunk == full_fragment {
            self.foe_tx = Some((data, offset + chunk, packet + 1));
        }

        self.queue_response(0x04, out);
    }

    fn eoe_request(&mut self, payload: &[u8]) {
        if payload.first().map(|byte| byte & 0x0f) != Some(0x02) {
            return;
        }

        self.eoe_request = payload.to_vec();

        let mut out = vec![0u8; 4];

        out[0] = 0x03;
        out[2..4].copy_from_slice(&self.eoe_result.to_le_bytes());

        self.queue_response(0x02, out);
    }

    fn soe_request(&mut self, payload: &[u8]) {
        if payload.len() < 4 {
            return;
        }

        let header = payload[0];
        let opcode = header & 0x07;
        let incomplete = header & 0x08 != 0;
        let idn = u16::from_le_bytes([payload[2], payload[3]]);

        match opcode {
            // Read request
            0x01 => match self.idns.get(&idn).cloned() {
                Some(value) => {
                    let mut out = vec![0u8; 4 + value.len()];

                    out[0] = 0x02;
                    out[1] = 0x40;
                    out[2..4].copy_from_slice(&idn.to_le_bytes());
                    out[4..].copy_from_slice(&value);

                    self.queue_response(0x05, out);
                }
                None => {
                    let mut out = vec![0u8; 6];

                    // Error flag set, error code in the tail
                    out[0] = 0x02 | 0x10;
                    out[1] = 0x40;
                    out[2..4].copy_from_slice(&idn.to_le_bytes());
                    // "No IDN"
                    out[4..6].copy_from_slice(&0x0001u16.to_le_bytes());

                    self.queue_response(0x05, out);
                }
            },
            // Write request, possibly fragmented
            0x03 => {
                self.soe_rx.extend_from_slice(&payload[4..]);

                if incomplete {
                    // Intermediate fragments are not acknowledged
                    return;
                }

                let data = std::mem::take(&mut self.soe_rx);

                self.idns.insert(idn, data);

                let mut out = vec![0u8; 4];

                out[0] = 0x04;
                out[1] = 0x40;
                out[2..4].copy_from_slice(&idn.to_le_bytes());

                self.queue_response(0x05, out);
            }
            _ => {}
        }
    }

    fn voe_request(&mut self, payload: &[u8]) {
        // Echo the frame back with the payload reversed, keeping the header
        if payload.len() < 6 {
            return;
        }

        let mut out = payload.to_vec();

        out[6..].reverse();

        self.queue_response(0x0f, out);
    }

    /// FMMU entries parsed from the register block: (logical, length,
    /// physical, read, write).
    fn fmmus(&self) -> Vec<(u32, u16, u16, bool, bool)> {
        let mut out = Vec::new();

        for i in 0..usize::from(self.fmmu_count) {
            let base = 0x600 + i * 16;

            let enabled = self.mem[base + 12] & 0x01 != 0;

            if !enabled {
                continue;
            }

            let logical =
                u32::from_le_bytes(self.mem[base..base + 4].try_into().unwrap());
            let len = u16::from_le_bytes([self.mem[base + 4], self.mem[base + 5]]);
            let phys = u16::from_le_bytes([self.mem[base + 8], self.mem[base + 9]]);
            let read = self.mem[base + 11] & 0x01 != 0;
            let write = self.mem[base + 11] & 0x02 != 0;

            out.push((logical, len, phys, read, write));
        }

        out
    }
}

/// The simulated segment.
pub struct Bus {
    pub slaves: Vec<SimSlave>,
    pub time: u64,
}

impl Bus {
    /// Process one EtherCAT frame in ring order, mutating it like the real
    /// segment would.
    fn process(&mut self, frame: &mut [u8]) {
        if frame.len() < EC_HEADER {
            return;
        }

        let mut at = EC_HEADER;

        loop {
            if at + 12 > frame.len() {
                break;
            }

            let command = frame[at];
            let len = usize::from(u16::from_le_bytes([frame[at + 6], frame[at + 7]]) & 0x07ff);
            let more = frame[at + 7] & 0x80 != 0;

            if at + 10 + len + 2 > frame.len() {
                break;
            }

            self.process_pdu(command, at, len, frame);

            if !more {
                break;
            }

            at += 10 + len + 2;
        }
    }

    fn process_pdu(&mut self, command: u8, at: usize, len: usize, frame: &mut [u8]) {
        let time = self.time;

        let mut adp = u16::from_le_bytes([frame[at + 2], frame[at + 3]]);
        let ado = u16::from_le_bytes([frame[at + 4], frame[at + 5]]);
        let logical = u32::from_le_bytes([
            frame[at + 2],
            frame[at + 3],
            frame[at + 4],
            frame[at + 5],
        ]);

        let mut wc = u16::from_le_bytes([frame[at + 10 + len], frame[at + 10 + len + 1]]);

        let data = at + 10;

        for slave in self.slaves.iter_mut() {
            if !slave.online {
                continue;
            }

            match command {
                // BRD: data is OR'd together
                0x07 => {
                    let mut scratch = vec![0u8; len];

                    slave.read(ado, &mut scratch, time);

                    for (i, byte) in scratch.iter().enumerate() {
                        frame[data + i] |= byte;
                    }

                    wc = wc.wrapping_add(1);
                }
                // BWR
                0x08 => {
                    let payload = frame[data..data + len].to_vec();

                    // Latch port receive times on a DC latch write
                    if ado == 0x0900 && slave.dc_supported {
                        let times = slave.port_times;

                        for (port, value) in times.iter().enumerate() {
                            slave.mem[0x900 + port * 4..0x904 + port * 4]
                                .copy_from_slice(&value.to_le_bytes());
                        }
                    }

                    slave.write(ado, &payload);
                    slave.apply_time_write(time);

                    wc = wc.wrapping_add(1);
                }
                // APRD/APWR: position addressing; the field increments as it
                // passes each slave
                0x01 | 0x02 => {
                    if adp == 0 {
                        if command == 0x01 {
                            let mut scratch = vec![0u8; len];

                            slave.read(ado, &mut scratch, time);

                            frame[data..data + len].copy_from_slice(&scratch);
                        } else {
                            let payload = frame[data..data + len].to_vec();

                            slave.write(ado, &payload);
                        }

                        wc = wc.wrapping_add(1);
                    }

                    adp = adp.wrapping_add(1);
                }
                // FPRD/FPWR
                0x04 | 0x05 => {
                    if slave.station_address() == adp {
                        if command == 0x04 {
                            let mut scratch = vec![0u8; len];

                            slave.read(ado, &mut scratch, time);

                            frame[data..data + len].copy_from_slice(&scratch);
                        } else {
                            let payload = frame[data..data + len].to_vec();

                            slave.write(ado, &payload);
                            slave.apply_time_write(time);
                        }

                        wc = wc.wrapping_add(1);
                    }
                }
                // FRMW: the addressed slave's value is broadcast to the rest
                0x0e => {
                    if slave.station_address() == adp {
                        let mut scratch = vec![0u8; len];

                        slave.read(ado, &mut scratch, time);

                        frame[data..data + len].copy_from_slice(&scratch);
                    } else {
                        let payload = frame[data..data + len].to_vec();

                        slave.write(ado, &payload);
                        slave.apply_time_write(time);
                    }

                    wc = wc.wrapping_add(1);
                }
                // LRD/LWR/LRW through the FMMUs. The working counter
                // increments once per slave for a processed read, twice for
                // a processed write on a read/write command.
                0x0a | 0x0b | 0x0c => {
                    let mut contributed = 0u16;

                    for (fmmu_logical, fmmu_len, fmmu_phys, read, write) in slave.fmmus() {
                        let start = fmmu_logical.max(logical);
                        let end =
                            (fmmu_logical + u32::from(fmmu_len)).min(logical + len as u32);

                        if start >= end {
                            continue;
                        }

                        let frame_at = data + (start - logical) as usize;
                        let span = (end - start) as usize;
                        let phys =
                            usize::from(fmmu_phys) + (start - fmmu_logical) as usize;

                        let reading = read && command != 0x0b;
                        let writing = write && command != 0x0a;

                        if reading {
                            let value = slave.mem[phys..phys + span].to_vec();

                            frame[frame_at..frame_at + span].copy_from_slice(&value);

                            contributed |= 1;
                        }

                        if writing {
                            let value = frame[frame_at..frame_at + span].to_vec();

                            slave.mem[phys..phys + span].copy_from_slice(&value);

                            contributed |= if command == 0x0c { 2 } else { 1 };
                        }
                    }

                    wc = wc.wrapping_add(contributed);
                }
                _ => {}
            }
        }

        frame[at + 2..at + 4].copy_from_slice(&adp.to_le_bytes());
        frame[at + 10 + len..at + 10 + len + 2].copy_from_slice(&wc.to_le_bytes());
    }
}

/// `Device` implementation backed by the shared [`Bus`].
pub struct SimDevice {
    pub bus: Rc<RefCell<Bus>>,
    rx: VecDeque<Vec<u8>>,
    /// Drop every frame, simulating a dead link.
    pub drop_frames: bool,
}

impl SimDevice {
    pub fn new(bus: Rc<RefCell<Bus>>) -> Self {
        Self {
            bus,
            rx: VecDeque::new(),
            drop_frames: false,
        }
    }
}

impl Device for SimDevice {
    fn send(&mut self, frame: &[u8]) -> Result<(), Error> {
        if self.drop_frames {
            return Ok(());
        }

        let mut frame = frame.to_vec();

        self.bus.borrow_mut().process(&mut frame);

        self.rx.push_back(frame);

        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        match self.rx.pop_front() {
            Some(frame) => {
                buf[..frame.len()].copy_from_slice(&frame);

                Ok(Some(frame.len()))
            }
            None => Ok(None),
        }
    }
}

/// Test clock shared between the harness and the master.
#[derive(Clone)]
pub struct SimClock(pub Rc<Cell<u64>>);

impl SimClock {
    pub fn new() -> Self {
        Self(Rc::new(Cell::new(0)))
    }

    pub fn advance(&self, ns: u64) {
        self.0.set(self.0.get() + ns);
    }
}

impl Clock for SimClock {
    fn now(&self) -> u64 {
        self.0.get()
    }
}

/// An EK1100-ish bus coupler: DC capable, no mailbox, no process data.
pub fn ek1100() -> SimSlave {
    let sii = SiiBuilder::new(BECKHOFF, EK1100_PRODUCT, 0x0011_0000, 0)
        .build();

    let mut slave = SimSlave::new(sii);

    slave.sm_count = 0;
    slave.fmmu_count = 0;

    slave
}

/// An EL2008-ish digital output terminal: 8 output bits in PDO 0x1600.
pub fn el2008(serial: u32) -> SimSlave {
    let entries: Vec<(u16, u8, u8)> = (1..=8).map(|sub| (0x7000u16, sub as u8, 1u8)).collect();

    let sii = SiiBuilder::new(BECKHOFF, EL2008_PRODUCT, 0x0011_0000, serial)
        .mailbox(0x0004)
        .standard_sync_managers(0x1100, 1, 0x1180, 0)
        .pdo(51, 0x1600, 2, &entries)
        .build();

    let mut slave = SimSlave::new(sii);

    // Mapping objects exist so PDO assignment downloads succeed
    slave.objects.insert(0x1c12 << 8, vec![0]);
    slave.objects.insert((0x1c12 << 8) | 1, vec![0, 0]);
    slave.objects.insert(0x1600 << 8, vec![0]);

    for sub in 1..=8u32 {
        slave.objects.insert((0x1600 << 8) | sub, vec![0; 4]);
    }

    slave
}

/// An EL5001-ish encoder input terminal with a CoE dictionary.
pub fn el5001(serial: u32) -> SimSlave {
    let sii = SiiBuilder::new(BECKHOFF, EL5001_PRODUCT, 0x0010_0000, serial)
        .mailbox(0x003e)
        .standard_sync_managers(0x1100, 0, 0x1180, 4)
        .pdo(50, 0x1a00, 3, &[(0x6000, 0x11, 32)])
        .build();

    let mut slave = SimSlave::new(sii);

    slave.objects.insert((0x6000 << 8) | 0x11, 0x1234_5678u32.to_le_bytes().to_vec());
    slave.objects.insert(0x1c13 << 8, vec![0]);
    slave.objects.insert((0x1c13 << 8) | 1, vec![0, 0]);
    slave.objects.insert(0x1a00 << 8, vec![0]);
    slave.objects.insert((0x1a00 << 8) | 1, vec![0; 4]);

    slave
}

/// Wire a chain of slaves into a bus, marking the final device as the chain
/// end for DL status purposes.
pub fn bus_with(mut slaves: Vec<SimSlave>) -> Rc<RefCell<Bus>> {
    if let Some(last) = slaves.last_mut() {
        last.is_last = true;
    }

    Rc::new(RefCell::new(Bus { slaves, time: 0 }))
}

/// Run `steps` iterations of receive → fsm → send_ext, advancing the clock
/// by `cycle_ns` each iteration.
pub fn run_fsm(
    master: &mut ethermite::Master<SimDevice, SimClock>,
    clock: &SimClock,
    bus: &Rc<RefCell<Bus>>,
    steps: usize,
    cycle_ns: u64,
) {
    for _ in 0..steps {
        clock.advance(cycle_ns);
        bus.borrow_mut().time = clock.0.get();

        master.receive().unwrap();
        master.fsm_step();
        master.send_ext().unwrap();
    }
}
