//! Configuration blob consumed by the virtual network.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// A single authoritative record inside a [`DnsZone`].
#[derive(Clone, Debug)]
pub struct DnsRecord {
    /// Bare name inside the zone, e.g. `gateway`.
    pub name: String,
    pub ip: Ipv4Addr,
}

/// An authoritative DNS zone served to the guest.
#[derive(Clone, Debug)]
pub struct DnsZone {
    /// Zone suffix with trailing dot, e.g. `containers.internal.`.
    pub name: String,
    pub records: Vec<DnsRecord>,
}

/// A host-side port forward into the guest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Forward {
    pub local: SocketAddr,
    pub remote: SocketAddrV4,
}

/// Everything the virtual network needs to come up.
///
/// The supervisor fills this with fixed values; nothing here changes after
/// the stack starts.
#[derive(Clone, Debug)]
pub struct NetworkConfig {
    pub subnet: Ipv4Addr,
    pub subnet_prefix: u8,
    pub gateway_ip: Ipv4Addr,
    /// Virtual address that NATs to the host loopback.
    pub host_ip: Ipv4Addr,
    pub guest_ip: Ipv4Addr,
    pub gateway_mac: [u8; 6],
    pub guest_mac: [u8; 6],
    pub mtu: usize,
    /// Static DHCP leases, MAC to IP.
    pub dhcp_static_leases: Vec<([u8; 6], Ipv4Addr)>,
    pub dns_zones: Vec<DnsZone>,
    pub dns_search_domains: Vec<String>,
    pub forwards: Vec<Forward>,
    /// Virtual address to host address translations.
    pub nat: Vec<(Ipv4Addr, Ipv4Addr)>,
    /// Addresses the gateway answers for in addition to its own.
    pub gateway_virtual_ips: Vec<Ipv4Addr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let gateway_ip = Ipv4Addr::new(192, 168, 127, 1);
        let host_ip = Ipv4Addr::new(192, 168, 127, 254);
        let guest_ip = Ipv4Addr::new(192, 168, 127, 2);
        let guest_mac = [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xee];

        let records = |gw: Ipv4Addr, host: Ipv4Addr| {
            vec![
                DnsRecord {
                    name: "gateway".to_string(),
                    ip: gw,
                },
                DnsRecord {
                    name: "host".to_string(),
                    ip: host,
                },
            ]
        };

        Self {
            subnet: Ipv4Addr::new(192, 168, 127, 0),
            subnet_prefix: 24,
            gateway_ip,
            host_ip,
            guest_ip,
            gateway_mac: [0x5a, 0x94, 0xef, 0xe4, 0x0c, 0xdd],
            guest_mac,
            mtu: 5000,
            dhcp_static_leases: vec![(guest_mac, guest_ip)],
            dns_zones: vec![
                DnsZone {
                    name: "containers.internal.".to_string(),
                    records: records(gateway_ip, host_ip),
                },
                DnsZone {
                    name: "docker.internal.".to_string(),
                    records: records(gateway_ip, host_ip),
                },
            ],
            dns_search_domains: Vec::new(),
            forwards: Vec::new(),
            nat: vec![(host_ip, Ipv4Addr::LOCALHOST)],
            gateway_virtual_ips: vec![host_ip],
        }
    }
}

/// Reads `search` domains out of `/etc/resolv.conf`. Best effort; an
/// unreadable file yields no domains.
pub fn host_search_domains() -> Vec<String> {
    let Ok(contents) = std::fs::read(resolv_conf_path()) else {
        return Vec::new();
    };

    match resolv_conf::Config::parse(&contents) {
        Ok(config) => config
            .get_search()
            .map(|domains| domains.to_vec())
            .unwrap_or_default(),
        Err(e) => {
            tracing::warn!("parse resolv.conf failed: {e}");
            Vec::new()
        }
    }
}

fn resolv_conf_path() -> &'static str {
    "/etc/resolv.conf"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_the_podman_machine_layout() {
        let config = NetworkConfig::default();

        assert_eq!(config.subnet, Ipv4Addr::new(192, 168, 127, 0));
        assert_eq!(config.gateway_ip, Ipv4Addr::new(192, 168, 127, 1));
        assert_eq!(config.host_ip, Ipv4Addr::new(192, 168, 127, 254));
        assert_eq!(config.guest_ip, Ipv4Addr::new(192, 168, 127, 2));
        assert_eq!(config.mtu, 5000);
        assert_eq!(config.dhcp_static_leases.len(), 1);
        assert_eq!(config.dhcp_static_leases[0].1, config.guest_ip);
        assert_eq!(config.nat, vec![(config.host_ip, Ipv4Addr::LOCALHOST)]);
        assert_eq!(config.gateway_virtual_ips, vec![config.host_ip]);
    }

    #[test]
    fn default_zones_cover_both_internal_domains() {
        let config = NetworkConfig::default();
        let names: Vec<&str> = config.dns_zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names, ["containers.internal.", "docker.internal."]);

        for zone in &config.dns_zones {
            assert!(zone.records.iter().any(|r| r.name == "gateway"));
            assert!(zone.records.iter().any(|r| r.name == "host"));
        }
    }
}
