//! DNS for the guest: authoritative answers for the internal zones,
//! host-resolver fallback for everything else.

use crate::config::DnsZone;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

pub const TYPE_A: u16 = 1;
pub const TYPE_AAAA: u16 = 28;

const TTL: u32 = 60;
const RCODE_SERVFAIL: u8 = 2;
const RCODE_NXDOMAIN: u8 = 3;
const RCODE_NOTIMP: u8 = 4;
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of matching a query against the configured zones.
pub enum ZoneAnswer {
    /// We are authoritative; these are the response bytes.
    Authoritative(Vec<u8>),
    /// Not one of our zones; resolve upstream.
    NotOurs { qname: String, qtype: u16 },
    /// Unparseable query; drop it.
    Garbage,
}

pub struct ZoneResolver {
    zones: Vec<DnsZone>,
}

impl ZoneResolver {
    pub fn new(zones: Vec<DnsZone>) -> Self {
        Self { zones }
    }

    pub fn answer(&self, query: &[u8]) -> ZoneAnswer {
        let Ok(packet) = dns_parser::Packet::parse(query) else {
            return ZoneAnswer::Garbage;
        };
        let Some(question) = packet.questions.first() else {
            return ZoneAnswer::Garbage;
        };

        let qname = question.qname.to_string();
        let qtype = question.qtype as u16;

        for zone in &self.zones {
            let suffix = zone.name.trim_end_matches('.');
            let host = if qname == suffix {
                ""
            } else if let Some(host) = qname.strip_suffix(&format!(".{suffix}")) {
                host
            } else {
                continue;
            };

            let record = zone.records.iter().find(|r| r.name == host);
            let response = match (record, qtype) {
                (Some(r), TYPE_A) => {
                    build_response(query, 0, &[ResponseRecord::A(r.ip)])
                }
                // Authoritative for the zone, but nothing of that type.
                (Some(_), _) => build_response(query, 0, &[]),
                (None, _) => build_response(query, RCODE_NXDOMAIN, &[]),
            };

            return match response {
                Some(bytes) => ZoneAnswer::Authoritative(bytes),
                None => ZoneAnswer::Garbage,
            };
        }

        ZoneAnswer::NotOurs { qname, qtype }
    }
}

/// Resolves a non-zone query through the host resolver and renders a
/// response. Always returns bytes to send; failures become SERVFAIL.
pub async fn resolve_upstream(qname: &str, qtype: u16, query: &[u8]) -> Vec<u8> {
    let fallback = |rcode| build_response(query, rcode, &[]).unwrap_or_default();

    if qtype != TYPE_A && qtype != TYPE_AAAA {
        return fallback(RCODE_NOTIMP);
    }

    let lookup = tokio::time::timeout(
        UPSTREAM_TIMEOUT,
        tokio::net::lookup_host((qname.to_string(), 0)),
    )
    .await;

    let addrs: Vec<IpAddr> = match lookup {
        Ok(Ok(addrs)) => addrs.map(|sa| sa.ip()).collect(),
        Ok(Err(_)) => return fallback(RCODE_NXDOMAIN),
        Err(_) => return fallback(RCODE_SERVFAIL),
    };

    let records: Vec<ResponseRecord> = addrs
        .into_iter()
        .filter_map(|ip| match (ip, qtype) {
            (IpAddr::V4(v4), TYPE_A) => Some(ResponseRecord::A(v4)),
            (IpAddr::V6(v6), TYPE_AAAA) => Some(ResponseRecord::Aaaa(v6)),
            _ => None,
        })
        .collect();

    if records.is_empty() {
        return fallback(RCODE_NXDOMAIN);
    }

    build_response(query, 0, &records).unwrap_or_default()
}

enum ResponseRecord {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
}

/// Renders a response for a single-question query: echoed question,
/// compression pointer to it in every answer.
fn build_response(query: &[u8], rcode: u8, records: &[ResponseRecord]) -> Option<Vec<u8>> {
    let question_end = question_end(query)?;

    let mut out = Vec::with_capacity(question_end + records.len() * 28);
    out.extend_from_slice(&query[0..2]); // transaction id
    // QR + AA + RD + RA, plus the response code.
    out.extend_from_slice(&[0x85, 0x80 | (rcode & 0x0f)]);
    out.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
    out.extend_from_slice(&(records.len() as u16).to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&[0x00, 0x00, 0x00, 0x00]); // NSCOUNT, ARCOUNT
    out.extend_from_slice(&query[12..question_end]);

    for record in records {
        out.extend_from_slice(&[0xc0, 0x0c]); // pointer to the question name
        match record {
            ResponseRecord::A(ip) => {
                out.extend_from_slice(&TYPE_A.to_be_bytes());
                out.extend_from_slice(&[0x00, 0x01]); // class IN
                out.extend_from_slice(&TTL.to_be_bytes());
                out.extend_from_slice(&4u16.to_be_bytes());
                out.extend_from_slice(&ip.octets());
            }
            ResponseRecord::Aaaa(ip) => {
                out.extend_from_slice(&TYPE_AAAA.to_be_bytes());
                out.extend_from_slice(&[0x00, 0x01]);
                out.extend_from_slice(&TTL.to_be_bytes());
                out.extend_from_slice(&16u16.to_be_bytes());
                out.extend_from_slice(&ip.octets());
            }
        }
    }

    Some(out)
}

/// Index one past the question section of a single-question query.
fn question_end(query: &[u8]) -> Option<usize> {
    let mut idx = 12;
    loop {
        let len = *query.get(idx)? as usize;
        if len == 0 {
            idx += 1;
            break;
        }
        if len >= 0xc0 {
            // Compressed name in a question is not something we emit or
            // expect, bail out.
            return None;
        }
        idx += 1 + len;
    }
    idx += 4; // QTYPE + QCLASS
    (idx <= query.len()).then_some(idx)
}
