//! DHCP server limited to the static leases the configuration names.

use heapless::Vec as HeaplessVec;
use smoltcp::wire::{DhcpMessageType, DhcpPacket, DhcpRepr, EthernetAddress, Ipv4Address};
use std::collections::HashMap;
use std::net::Ipv4Addr;

const LEASE_DURATION: u32 = 3600;

/// Answers DHCP for known MACs only; anything else is ignored. The guest
/// has a fixed address, so there is no dynamic pool.
pub struct StaticDhcp {
    server_ip: Ipv4Address,
    subnet_mask: Ipv4Address,
    leases: HashMap<EthernetAddress, Ipv4Address>,
    dns_servers: HeaplessVec<Ipv4Address, 3>,
}

impl StaticDhcp {
    pub fn new(gateway: Ipv4Addr, subnet_prefix: u8, leases: &[([u8; 6], Ipv4Addr)]) -> Self {
        let mut dns_servers = HeaplessVec::new();
        dns_servers.push(gateway.into()).ok();

        Self {
            server_ip: gateway.into(),
            subnet_mask: prefix_to_mask(subnet_prefix).into(),
            leases: leases
                .iter()
                .map(|(mac, ip)| (EthernetAddress(*mac), Ipv4Address::from(*ip)))
                .collect(),
            dns_servers,
        }
    }

    /// Handles one incoming packet, returning the reply representation if
    /// the client is known.
    pub fn handle_packet<'a>(
        &mut self,
        client_mac: EthernetAddress,
        packet: &DhcpPacket<&'a [u8]>,
    ) -> Option<DhcpRepr<'a>> {
        let repr = DhcpRepr::parse(packet).ok()?;
        let leased_ip = *self.leases.get(&client_mac)?;

        match repr.message_type {
            DhcpMessageType::Discover => {
                Some(self.reply(DhcpMessageType::Offer, client_mac, leased_ip, &repr))
            }
            DhcpMessageType::Request => {
                if let Some(requested) = repr.requested_ip {
                    if requested != leased_ip {
                        tracing::warn!(
                            "DHCP request for {requested} from {client_mac}, lease is {leased_ip}"
                        );
                        return None;
                    }
                }
                Some(self.reply(DhcpMessageType::Ack, client_mac, leased_ip, &repr))
            }
            _ => None,
        }
    }

    fn reply<'a>(
        &self,
        message_type: DhcpMessageType,
        client_mac: EthernetAddress,
        your_ip: Ipv4Address,
        request: &DhcpRepr<'_>,
    ) -> DhcpRepr<'a> {
        DhcpRepr {
            message_type,
            transaction_id: request.transaction_id,
            secs: 0,
            client_hardware_address: client_mac,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip,
            server_ip: self.server_ip,
            router: Some(self.server_ip),
            subnet_mask: Some(self.subnet_mask),
            relay_agent_ip: Ipv4Address::UNSPECIFIED,
            broadcast: true,
            requested_ip: None,
            client_identifier: None,
            server_identifier: Some(self.server_ip),
            parameter_request_list: None,
            dns_servers: Some(self.dns_servers.clone()),
            max_size: None,
            lease_duration: Some(LEASE_DURATION),
            renew_duration: Some(LEASE_DURATION / 2),
            rebind_duration: Some(LEASE_DURATION * 7 / 8),
            additional_options: &[],
        }
    }
}

fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    if prefix == 0 {
        Ipv4Addr::UNSPECIFIED
    } else if prefix >= 32 {
        Ipv4Addr::BROADCAST
    } else {
        Ipv4Addr::from(!((1u32 << (32 - prefix)) - 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST_MAC: [u8; 6] = [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee];

    fn server() -> StaticDhcp {
        StaticDhcp::new(
            Ipv4Addr::new(192, 168, 127, 1),
            24,
            &[(GUEST_MAC, Ipv4Addr::new(192, 168, 127, 2))],
        )
    }

    fn discover_repr(mac: EthernetAddress) -> DhcpRepr<'static> {
        DhcpRepr {
            message_type: DhcpMessageType::Discover,
            transaction_id: 0x1234,
            secs: 0,
            client_hardware_address: mac,
            client_ip: Ipv4Address::UNSPECIFIED,
            your_ip: Ipv4Address::UNSPECIFIED,
            server_ip: Ipv4Address::UNSPECIFIED,
            router: None,
            subnet_mask: None,
            relay_agent_ip: Ipv4Address::UNSPECIFIED,
            broadcast: true,
            requested_ip: None,
            client_identifier: None,
            server_identifier: None,
            parameter_request_list: None,
            dns_servers: None,
            max_size: None,
            lease_duration: None,
            renew_duration: None,
            rebind_duration: None,
            additional_options: &[],
        }
    }

    fn emit(repr: &DhcpRepr<'_>) -> Vec<u8> {
        let mut buf = vec![0u8; repr.buffer_len()];
        let mut packet = DhcpPacket::new_unchecked(&mut buf[..]);
        repr.emit(&mut packet).unwrap();
        buf
    }

    #[test]
    fn known_mac_gets_its_static_lease() {
        let mut dhcp = server();
        let mac = EthernetAddress(GUEST_MAC);

        let bytes = emit(&discover_repr(mac));
        let packet = DhcpPacket::new_checked(&bytes[..]).unwrap();
        let reply = dhcp.handle_packet(mac, &packet).unwrap();

        assert_eq!(reply.message_type, DhcpMessageType::Offer);
        assert_eq!(reply.your_ip, Ipv4Address::new(192, 168, 127, 2));
        assert_eq!(reply.router, Some(Ipv4Address::new(192, 168, 127, 1)));
        assert_eq!(reply.subnet_mask, Some(Ipv4Address::new(255, 255, 255, 0)));
        assert_eq!(reply.transaction_id, 0x1234);
    }

    #[test]
    fn unknown_mac_is_ignored() {
        let mut dhcp = server();
        let stranger = EthernetAddress([0, 1, 2, 3, 4, 5]);

        let bytes = emit(&discover_repr(stranger));
        let packet = DhcpPacket::new_checked(&bytes[..]).unwrap();
        assert!(dhcp.handle_packet(stranger, &packet).is_none());
    }

    #[test]
    fn request_for_wrong_address_is_ignored() {
        let mut dhcp = server();
        let mac = EthernetAddress(GUEST_MAC);

        let mut repr = discover_repr(mac);
        repr.message_type = DhcpMessageType::Request;
        repr.requested_ip = Some(Ipv4Address::new(10, 0, 0, 9));

        let bytes = emit(&repr);
        let packet = DhcpPacket::new_checked(&bytes[..]).unwrap();
        assert!(dhcp.handle_packet(mac, &packet).is_none());
    }

    #[test]
    fn gateway_advertises_itself_as_dns() {
        let mut dhcp = server();
        let mac = EthernetAddress(GUEST_MAC);

        let bytes = emit(&discover_repr(mac));
        let packet = DhcpPacket::new_checked(&bytes[..]).unwrap();
        let reply = dhcp.handle_packet(mac, &packet).unwrap();

        let dns = reply.dns_servers.unwrap();
        assert_eq!(dns.as_slice(), &[Ipv4Address::new(192, 168, 127, 1)]);
    }
}
