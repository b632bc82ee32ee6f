//! Ethernet over EtherCAT (EoE): IP parameter provisioning.
//!
//! Only the "set IP parameter" service is implemented; tunnelled Ethernet
//! frames are out of scope for the master core. The request is a fixed
//! layout: a 4 byte EoE header, a 32 bit flags word saying which items are
//! present, then one fixed slot per item. Devices ignore everything after
//! the first absent item, and setting only the MAC address requests DHCP.

use crate::error::Error;
use crate::fmt;
use crate::mailbox::{MailboxExchange, MailboxRuntime, MailboxType, MbxPoll};
use crate::master::Timeouts;
use crate::pdu_loop::PduLoop;
use crate::MAX_HOSTNAME;

/// EoE frame type nibble: "initiate EoE", i.e. set IP parameter request.
const EOE_TYPE_INIT_REQ: u8 = 0x02;
/// Set IP parameter response.
const EOE_TYPE_INIT_RES: u8 = 0x03;

/// IP parameters to provision into a slave's EoE stack.
///
/// Absent (`None`) items are flagged as not included; per the protocol,
/// devices ignore all items after the first absent one.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IpParameters {
    /// MAC address of the tunnelled interface.
    pub mac: Option<[u8; 6]>,
    /// IPv4 address, host byte order.
    pub ip: Option<u32>,
    /// Subnet mask, host byte order.
    pub subnet: Option<u32>,
    /// Default gateway, host byte order.
    pub gateway: Option<u32>,
    /// DNS server, host byte order.
    pub dns: Option<u32>,
    /// DNS/host name, at most [`MAX_HOSTNAME`] bytes.
    pub name: heapless::String<MAX_HOSTNAME>,
}

/// Request size: header + flags + one slot per item.
const SET_IP_SIZE: usize = 8 + 6 + 4 + 4 + 4 + 4 + MAX_HOSTNAME;

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
enum EoeState {
    #[default]
    Idle,
    Request,
    Response,
    Done,
    Failed,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum EoePoll {
    Pending,
    Done,
    Failed(Error),
}

/// One "set IP parameter" operation in flight against one slave.
#[derive(Debug, Default)]
pub(crate) struct EoeFsm {
    state: EoeState,
    exchange: MailboxExchange,
    params: IpParameters,
    /// Vendor defined result code from the response.
    result: u16,
    error: Option<Error>,
}

impl EoeFsm {
    /// Result code from the last response; zero means success.
    pub fn result(&self) -> u16 {
        self.result
    }

    pub fn start_set_ip(&mut self, params: IpParameters) {
        self.params = params;
        self.result = 0;
        self.error = None;
        self.state = EoeState::Request;
    }

    pub fn abort(&mut self, pdu_loop: &mut PduLoop, mbx: &mut MailboxRuntime) {
        self.exchange.abort(pdu_loop, mbx);
        self.state = EoeState::Idle;
    }

    fn fail(&mut self, error: Error) -> EoePoll {
        self.state = EoeState::Failed;
        self.error = Some(error);

        EoePoll::Failed(error)
    }

    fn build_request(&self, out: &mut [u8; SET_IP_SIZE]) {
        let p = &self.params;

        out.fill(0);

        out[0] = EOE_TYPE_INIT_REQ;
        // out[1]: port/last fragment unused for this service
        // out[2..4]: fragment fields unused

        let flags = u32::from(p.mac.is_some())
            | u32::from(p.ip.is_some()) << 1
            | u32::from(p.subnet.is_some()) << 2
            | u32::from(p.gateway.is_some()) << 3
            | u32::from(p.dns.is_some()) << 4
            | u32::from(!p.name.is_empty()) << 5;

        out[4..8].copy_from_slice(&flags.to_le_bytes());

        let mut at = 8;

        if let Some(mac) = p.mac {
            out[at..at + 6].copy_from_slice(&mac);
        }
        at += 6;

        // IP quantities are carried in network byte order
        for value in [p.ip, p.subnet, p.gateway, p.dns] {
            if let Some(value) = value {
                out[at..at + 4].copy_from_slice(&value.to_be_bytes());
            }
            at += 4;
        }

        out[at..at + p.name.len()].copy_from_slice(p.name.as_bytes());
    }

    /// Advance by at most one transition.
    pub fn step(
        &mut self,
        pdu_loop: &mut PduLoop,
        mbx: &mut MailboxRuntime,
        now: u64,
        timeouts: &Timeouts,
    ) -> EoePoll {
        match self.state {
            EoeState::Idle | EoeState::Done => EoePoll::Pending,
            EoeState::Failed => EoePoll::Failed(self.error.unwrap_or(Error::Internal)),

            EoeState::Request => {
                let mut request = [0u8; SET_IP_SIZE];

                self.build_request(&mut request);

                self.exchange
                    .start(Some((MailboxType::Eoe, &request)), MailboxType::Eoe);
                self.state = EoeState::Response;

                EoePoll::Pending
            }

            EoeState::Response => match self.exchange.step(
                pdu_loop,
                mbx,
                now,
                timeouts.pdu,
                timeouts.mailbox_response,
            ) {
                MbxPoll::Pending => EoePoll::Pending,
                MbxPoll::Failed(e) => self.fail(e),
                MbxPoll::Done => {
                    let response = self.exchange.response();

                    if response.len() < 4 {
                        return self.fail(Error::Eoe(0xffff));
                    }

                    let eoe_type = response[0] & 0x0f;

                    if eoe_type != EOE_TYPE_INIT_RES {
                        fmt::warn!("Unexpected EoE frame type {:#03x}", eoe_type);

                        return self.fail(Error::Eoe(0xffff));
                    }

                    self.result = u16::from_le_bytes([response[2], response[3]]);

                    if self.result != 0 {
                        fmt::error!(
                            "Slave {:#06x} rejected IP parameters: result {:#06x}",
                            mbx.station_address,
                            self.result
                        );

                        return self.fail(Error::Eoe(self.result));
                    }

                    self.state = EoeState::Done;

                    EoePoll::Done
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_layout() {
        let mut fsm = EoeFsm::default();

        fsm.start_set_ip(IpParameters {
            mac: Some([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            ip: Some(0xc0a8_0164),
            subnet: Some(0xffff_ff00),
            gateway: None,
            dns: None,
            name: heapless::String::new(),
        });

        let mut out = [0u8; SET_IP_SIZE];

        fsm.build_request(&mut out);

        assert_eq!(out[0], EOE_TYPE_INIT_REQ);
        // mac, ip, subnet flags
        assert_eq!(&out[4..8], &[0b0000_0111, 0, 0, 0]);
        assert_eq!(&out[8..14], &[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        // Network byte order
        assert_eq!(&out[14..18], &[192, 168, 1, 100]);
        assert_eq!(&out[18..22], &[255, 255, 255, 0]);
        assert_eq!(&out[22..26], &[0; 4]);
    }

    #[test]
    fn dhcp_is_mac_only() {
        let fsm = EoeFsm {
            params: IpParameters {
                mac: Some([2, 0, 0, 0, 0, 9]),
                ..IpParameters::default()
            },
            ..EoeFsm::default()
        };

        let mut out = [0u8; SET_IP_SIZE];

        fsm.build_request(&mut out);

        assert_eq!(&out[4..8], &[0x01, 0, 0, 0]);
    }
}
