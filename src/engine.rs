//! The DHCP request state machine.
//!
//! [`Engine::handle`] turns one decoded inbound frame into at most one
//! outbound frame and at most one piece of advice for the host (publish an
//! ARP entry, persist the lease table). The engine owns its interface's
//! [`Pool`] and offer table outright; calls are sequential and never block.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::hwaddr::HwAddr;
use crate::options::{DhcpOption, MessageType, OptionCode};
use crate::packet::{Frame, Op};
use crate::pool::{Lease, Pool};

/// A reply frame and the address it should be sent to (client port 68).
#[derive(Debug, Clone)]
pub struct Outbound {
    pub target: Ipv4Addr,
    pub frame: Frame,
}

/// A side effect for the surrounding host to realise.
#[derive(Debug, Clone)]
pub enum Advice {
    /// Publish an ARP entry so the offer can reach a client that has no
    /// address yet.
    PublishArp { ip: Ipv4Addr, hw: HwAddr },
    /// Rewrite the persistent lease table with this snapshot.
    PersistLeases(Vec<Lease>),
}

/// The outcome of handling one inbound frame.
#[derive(Debug, Default)]
pub struct Handled {
    pub reply: Option<Outbound>,
    pub advice: Option<Advice>,
}

impl Handled {
    fn none() -> Self {
        Self::default()
    }
}

pub struct Engine {
    iface: String,
    pool: Pool,
    /// Pending offers by hardware address. Soft state: an entry is written
    /// on DISCOVER, overwritten by a re-DISCOVER and consumed by REQUEST.
    offers: HashMap<HwAddr, Frame>,
}

impl Engine {
    pub fn new(iface: impl Into<String>, pool: Pool) -> Self {
        Self {
            iface: iface.into(),
            pool,
            offers: HashMap::new(),
        }
    }

    pub fn iface(&self) -> &str {
        &self.iface
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn handle(&mut self, frame: Frame) -> Handled {
        match frame.message_type() {
            Some(MessageType::Discover) => {
                info!("Handling {} from {}", MessageType::Discover, frame.chaddr);
                self.handle_discover(frame)
            }
            Some(MessageType::Request) => {
                info!("Handling {} from {}", MessageType::Request, frame.chaddr);
                self.handle_request(frame)
            }
            Some(MessageType::Release) => {
                info!("Handling {} from {}", MessageType::Release, frame.chaddr);
                self.handle_release(&frame)
            }
            Some(MessageType::Decline) => {
                // Handled as a release. The address would ideally be
                // quarantined, but we inherit the simpler behaviour.
                info!(
                    "Handling {} (as a release) from {}",
                    MessageType::Decline,
                    frame.chaddr
                );
                self.handle_release(&frame)
            }
            Some(other) => {
                debug!("Ignoring {} from {}", other, frame.chaddr);
                Handled::none()
            }
            None => {
                debug!("Ignoring frame without a message type from {}", frame.chaddr);
                Handled::none()
            }
        }
    }

    fn handle_discover(&mut self, frame: Frame) -> Handled {
        if frame.op != Op::Request {
            // A reply opcode here would be a bug in the client.
            return Handled::none();
        }

        let hw = frame.chaddr;
        let Some(address) = self.pool.available(hw, None) else {
            warn!(
                "{}: {}, not offering anything to {}",
                self.iface,
                Error::Exhausted,
                hw
            );
            return Handled::none();
        };

        let mut offer = frame.clone();
        offer.op = Op::Reply;
        offer.yiaddr = address;
        offer.options.clear();
        self.provide_parameters(&frame, &mut offer);

        info!("Offering address {} to {}", address, hw);

        self.offers.insert(hw, offer.clone());

        Handled {
            reply: Some(Outbound {
                target: address,
                frame: offer,
            }),
            advice: Some(Advice::PublishArp { ip: address, hw }),
        }
    }

    fn handle_request(&mut self, frame: Frame) -> Handled {
        let hw = frame.chaddr;

        let mut offer = match self.offers.remove(&hw) {
            Some(offer) => offer,
            // No offer outstanding: fall back to the recorded lease, or NAK
            // a client we know nothing about.
            None => match self.pool.lease_by_hw(hw) {
                Some(lease) => {
                    let mut offer = frame.clone();
                    offer.op = Op::Reply;
                    offer.yiaddr = lease.ip;
                    offer.options.clear();
                    self.provide_parameters(&frame, &mut offer);
                    offer
                }
                None => {
                    info!("Sending NAK to {} because we don't know them", hw);
                    let mut nak = frame.clone();
                    self.mark_as_nak(&mut nak);
                    return Handled {
                        reply: Some(Outbound {
                            target: self.pool.config().broadcast(),
                            frame: nak,
                        }),
                        advice: None,
                    };
                }
            },
        };

        let requested = frame.requested_ip();
        let granted = self.pool.available(hw, requested);

        let address = requested.filter(|ip| offer.yiaddr == *ip && granted == Some(*ip));
        let Some(address) = address else {
            info!(
                "Sending NAK to {} because the binding is inconsistent: yiaddr={}, requested={:?}, granted={:?}",
                hw, offer.yiaddr, requested, granted
            );
            self.mark_as_nak(&mut offer);
            return Handled {
                reply: Some(Outbound {
                    target: self.pool.config().broadcast(),
                    frame: offer,
                }),
                advice: None,
            };
        };

        if self.pool.reserve(hw, address) {
            offer.set_option(DhcpOption::MessageType(MessageType::Ack));
            info!("Sending ACK on address {} to {}", address, hw);
            Handled {
                reply: Some(Outbound {
                    target: address,
                    frame: offer,
                }),
                advice: Some(Advice::PersistLeases(self.pool.snapshot())),
            }
        } else {
            info!(
                "Sending NAK to {} because reservation of {} failed",
                hw, address
            );
            self.mark_as_nak(&mut offer);
            Handled {
                reply: Some(Outbound {
                    target: self.pool.config().broadcast(),
                    frame: offer,
                }),
                advice: None,
            }
        }
    }

    fn handle_release(&mut self, frame: &Frame) -> Handled {
        info!("Releasing address {} from {}", frame.ciaddr, frame.chaddr);
        self.pool.release(frame.ciaddr);
        Handled::none()
    }

    /// Fills the offer with the parameters every client needs, asked for or
    /// not; some clients skip option 55 and assume these appear anyway.
    fn provide_parameters(&self, request: &Frame, offer: &mut Frame) {
        let config = self.pool.config();

        offer.set_option(DhcpOption::MessageType(MessageType::Offer));
        offer.set_option(DhcpOption::ServerIdentifier(config.server_id));
        offer.set_option(DhcpOption::LeaseTime(config.lease_seconds));
        offer.set_option(DhcpOption::SubnetMask(config.subnet_mask()));
        offer.set_option(DhcpOption::Router(vec![config.router]));
        offer.set_option(DhcpOption::DnsServer(config.dns_servers.clone()));
        offer.set_option(DhcpOption::Broadcast(config.broadcast()));

        let Some(parameters) = request.parameter_request_list() else {
            debug!("Parameter request from {} - [unspecified]", request.chaddr);
            return;
        };

        for &code in parameters {
            match OptionCode::try_from(code) {
                Ok(OptionCode::RenewalTime) => {
                    offer.set_option(DhcpOption::RenewalTime(config.renewal_seconds));
                }
                Ok(OptionCode::RebindingTime) => {
                    offer.set_option(DhcpOption::RebindingTime(config.rebinding_seconds));
                }
                _ => debug!(
                    "Parameter request from {} - {} not handled",
                    request.chaddr, code
                ),
            }
        }
    }

    /// Rewrites a reply into a NAK: options cleared down to MessageType and
    /// ServerIdentifier, address fields zeroed.
    fn mark_as_nak(&self, frame: &mut Frame) {
        frame.op = Op::Reply;
        frame.options.clear();
        frame.set_option(DhcpOption::MessageType(MessageType::Nak));
        frame.set_option(DhcpOption::ServerIdentifier(self.pool.config().server_id));
        frame.yiaddr = Ipv4Addr::UNSPECIFIED;
        frame.ciaddr = Ipv4Addr::UNSPECIFIED;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap as StdHashMap;

    use crate::packet::{HLEN_ETHERNET, HTYPE_ETHERNET};
    use crate::pool::NetworkConfig;

    fn test_config() -> NetworkConfig {
        NetworkConfig {
            network: Ipv4Addr::new(192, 168, 200, 0),
            prefix_len: 24,
            router: Ipv4Addr::new(192, 168, 200, 1),
            server_id: Ipv4Addr::new(192, 168, 200, 1),
            dhcp_first: Ipv4Addr::new(192, 168, 200, 100),
            dhcp_last: Ipv4Addr::new(192, 168, 200, 254),
            dns_servers: vec![Ipv4Addr::new(9, 9, 9, 9)],
            lease_seconds: 3600,
            renewal_seconds: 1800,
            rebinding_seconds: 3150,
            reservations: StdHashMap::new(),
        }
    }

    fn test_engine() -> Engine {
        Engine::new("eth0", Pool::new(test_config(), vec![]))
    }

    fn hw(tail: u8) -> HwAddr {
        HwAddr::from_octets([0xaa, 0xbb, 0xcc, 0xdd, 0xee, tail])
    }

    fn ip(tail: u8) -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 200, tail)
    }

    fn request_frame(chaddr: HwAddr, msg_type: MessageType) -> Frame {
        Frame {
            op: Op::Request,
            htype: HTYPE_ETHERNET,
            hlen: HLEN_ETHERNET,
            hops: 0,
            xid: 0x1234,
            secs: 0,
            flags: 0x8000,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![DhcpOption::MessageType(msg_type)],
        }
    }

    fn request_with_ip(chaddr: HwAddr, requested: Ipv4Addr) -> Frame {
        let mut frame = request_frame(chaddr, MessageType::Request);
        frame.set_option(DhcpOption::RequestedIp(requested));
        frame
    }

    #[test]
    fn test_happy_dora() {
        let mut engine = test_engine();
        let client = hw(1);

        let handled = engine.handle(request_frame(client, MessageType::Discover));
        let offer = handled.reply.expect("expected an offer");
        assert_eq!(offer.target, ip(100));
        assert_eq!(offer.frame.op, Op::Reply);
        assert_eq!(offer.frame.yiaddr, ip(100));
        assert_eq!(offer.frame.xid, 0x1234);
        assert_eq!(offer.frame.message_type(), Some(MessageType::Offer));
        assert_eq!(
            offer.frame.option(OptionCode::ServerIdentifier),
            Some(&DhcpOption::ServerIdentifier(ip(1)))
        );
        assert_eq!(
            offer.frame.option(OptionCode::SubnetMask),
            Some(&DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 0)))
        );
        assert!(matches!(
            handled.advice,
            Some(Advice::PublishArp { ip: arp_ip, hw: arp_hw })
                if arp_ip == ip(100) && arp_hw == client
        ));

        let handled = engine.handle(request_with_ip(client, ip(100)));
        let ack = handled.reply.expect("expected an ACK");
        assert_eq!(ack.target, ip(100));
        assert_eq!(ack.frame.yiaddr, ip(100));
        assert_eq!(ack.frame.message_type(), Some(MessageType::Ack));
        assert!(matches!(
            handled.advice,
            Some(Advice::PersistLeases(ref leases)) if leases.len() == 1
        ));
        assert_eq!(engine.pool().lease_by_hw(client).unwrap().ip, ip(100));
    }

    #[test]
    fn test_rediscover_reuses_address() {
        let mut engine = test_engine();
        let client = hw(1);

        engine.handle(request_frame(client, MessageType::Discover));
        engine.handle(request_with_ip(client, ip(100)));

        let handled = engine.handle(request_frame(client, MessageType::Discover));
        let offer = handled.reply.expect("expected an offer");
        assert_eq!(offer.frame.yiaddr, ip(100));
    }

    #[test]
    fn test_nak_for_stranger_requesting_taken_address() {
        let mut engine = test_engine();

        engine.handle(request_frame(hw(1), MessageType::Discover));
        engine.handle(request_with_ip(hw(1), ip(100)));

        let stranger = HwAddr::from_octets([0x11, 0x22, 0x33, 0x44, 0x55, 0x66]);
        let handled = engine.handle(request_with_ip(stranger, ip(100)));
        let nak = handled.reply.expect("expected a NAK");
        assert_eq!(nak.frame.message_type(), Some(MessageType::Nak));
        assert_eq!(nak.frame.yiaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(nak.frame.ciaddr, Ipv4Addr::UNSPECIFIED);
        assert_eq!(nak.target, ip(255));
        assert!(handled.advice.is_none());
    }

    #[test]
    fn test_preferred_outside_network_gets_pool_address() {
        let mut engine = test_engine();

        let mut discover = request_frame(hw(1), MessageType::Discover);
        discover.set_option(DhcpOption::RequestedIp(Ipv4Addr::new(10, 0, 0, 10)));

        let handled = engine.handle(discover);
        let offer = handled.reply.expect("expected an offer");
        assert_eq!(offer.frame.yiaddr, ip(100));
    }

    #[test]
    fn test_expired_lease_reoffered_to_new_client() {
        let stale = Lease {
            start_secs: 1,
            hw: hw(1),
            ip: ip(100),
        };
        let mut engine = Engine::new("eth0", Pool::new(test_config(), vec![stale]));

        let handled = engine.handle(request_frame(hw(2), MessageType::Discover));
        let offer = handled.reply.expect("expected an offer");
        assert_eq!(offer.frame.yiaddr, ip(100));
    }

    #[test]
    fn test_discover_with_reply_opcode_ignored() {
        let mut engine = test_engine();

        let mut frame = request_frame(hw(1), MessageType::Discover);
        frame.op = Op::Reply;

        let handled = engine.handle(frame);
        assert!(handled.reply.is_none());
        assert!(handled.advice.is_none());
    }

    #[test]
    fn test_exhausted_pool_stays_silent_on_discover() {
        let config = NetworkConfig {
            dhcp_first: ip(100),
            dhcp_last: ip(100),
            ..test_config()
        };
        let mut engine = Engine::new("eth0", Pool::new(config, vec![]));

        engine.handle(request_frame(hw(1), MessageType::Discover));
        engine.handle(request_with_ip(hw(1), ip(100)));

        let handled = engine.handle(request_frame(hw(2), MessageType::Discover));
        assert!(handled.reply.is_none());
        assert!(handled.advice.is_none());
    }

    #[test]
    fn test_request_without_offer_uses_recorded_lease() {
        let mut engine = test_engine();
        let client = hw(1);

        engine.handle(request_frame(client, MessageType::Discover));
        engine.handle(request_with_ip(client, ip(100)));

        // Fresh REQUEST with no outstanding offer, e.g. after a restart of
        // the client's DHCP state machine.
        let handled = engine.handle(request_with_ip(client, ip(100)));
        let ack = handled.reply.expect("expected an ACK");
        assert_eq!(ack.frame.message_type(), Some(MessageType::Ack));
        assert_eq!(ack.frame.yiaddr, ip(100));
    }

    #[test]
    fn test_request_mismatching_offer_naks() {
        let mut engine = test_engine();
        let client = hw(1);

        engine.handle(request_frame(client, MessageType::Discover));

        let handled = engine.handle(request_with_ip(client, ip(150)));
        let nak = handled.reply.expect("expected a NAK");
        assert_eq!(nak.frame.message_type(), Some(MessageType::Nak));

        // The offer was consumed; a repeat REQUEST from a client with no
        // lease is NAKed as unknown.
        let handled = engine.handle(request_with_ip(client, ip(150)));
        let nak = handled.reply.expect("expected a NAK");
        assert_eq!(nak.frame.message_type(), Some(MessageType::Nak));
    }

    #[test]
    fn test_request_without_requested_ip_naks() {
        let mut engine = test_engine();
        let client = hw(1);

        engine.handle(request_frame(client, MessageType::Discover));

        let handled = engine.handle(request_frame(client, MessageType::Request));
        let nak = handled.reply.expect("expected a NAK");
        assert_eq!(nak.frame.message_type(), Some(MessageType::Nak));
    }

    #[test]
    fn test_release_frees_address() {
        let mut engine = test_engine();
        let client = hw(1);

        engine.handle(request_frame(client, MessageType::Discover));
        engine.handle(request_with_ip(client, ip(100)));

        let mut release = request_frame(client, MessageType::Release);
        release.ciaddr = ip(100);
        let handled = engine.handle(release);
        assert!(handled.reply.is_none());
        assert!(engine.pool().lease_by_ip(ip(100)).is_none());
    }

    #[test]
    fn test_decline_handled_as_release() {
        let mut engine = test_engine();
        let client = hw(1);

        engine.handle(request_frame(client, MessageType::Discover));
        engine.handle(request_with_ip(client, ip(100)));

        let mut decline = request_frame(client, MessageType::Decline);
        decline.ciaddr = ip(100);
        let handled = engine.handle(decline);
        assert!(handled.reply.is_none());
        assert!(engine.pool().lease_by_ip(ip(100)).is_none());
    }

    #[test]
    fn test_unknown_message_type_ignored() {
        let mut engine = test_engine();

        let mut frame = request_frame(hw(1), MessageType::Discover);
        frame.options.clear();
        frame.set_option(DhcpOption::Unknown(53, vec![99]));

        let handled = engine.handle(frame);
        assert!(handled.reply.is_none());
    }

    #[test]
    fn test_inform_ignored() {
        let mut engine = test_engine();
        let handled = engine.handle(request_frame(hw(1), MessageType::Inform));
        assert!(handled.reply.is_none());
    }

    #[test]
    fn test_renewal_and_rebinding_times_on_request_list() {
        let mut engine = test_engine();

        let mut discover = request_frame(hw(1), MessageType::Discover);
        discover.set_option(DhcpOption::ParameterRequestList(vec![1, 3, 58, 59, 119]));

        let handled = engine.handle(discover);
        let offer = handled.reply.expect("expected an offer");
        assert_eq!(
            offer.frame.option(OptionCode::RenewalTime),
            Some(&DhcpOption::RenewalTime(1800))
        );
        assert_eq!(
            offer.frame.option(OptionCode::RebindingTime),
            Some(&DhcpOption::RebindingTime(3150))
        );
        // Always provided, asked for or not.
        assert!(offer.frame.option(OptionCode::Router).is_some());
        assert!(offer.frame.option(OptionCode::DnsServer).is_some());
        assert!(offer.frame.option(OptionCode::Broadcast).is_some());
        assert!(offer.frame.option(OptionCode::LeaseTime).is_some());
    }

    #[test]
    fn test_offer_encodes_cleanly() {
        let mut engine = test_engine();
        let handled = engine.handle(request_frame(hw(1), MessageType::Discover));
        let offer = handled.reply.unwrap();
        let bytes = offer.frame.encode().unwrap();
        assert!(bytes.len() >= 300);

        let reparsed = Frame::decode(&bytes).unwrap();
        assert_eq!(reparsed.message_type(), Some(MessageType::Offer));
        assert_eq!(reparsed.yiaddr, ip(100));
    }
}
