// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Sending side: router-group subscription and query transmission.
//!
//! The querier core only needs `send_report` / `send_leave` (router-group
//! join and leave on a given interface); the proxy event loop additionally
//! sends paced general queries. [`SocketSender`] is the production
//! implementation over raw sockets; tests substitute recording mocks.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, SockAddr, Socket, Type};

use super::membership_db::ProtocolVersion;
use super::timers::TimersValues;

/// All-hosts group, destination of IGMPv3 general queries (224.0.0.1).
pub const IPV4_ALL_HOSTS: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);
/// All-nodes group, destination of MLDv2 general queries (ff02::1).
pub const IPV6_ALL_NODES: Ipv6Addr = Ipv6Addr::new(0xff02, 0, 0, 0, 0, 0, 0, 1);

/// IGMP membership query message type.
pub const IGMP_MEMBERSHIP_QUERY: u8 = 0x11;
/// ICMPv6 multicast listener query message type.
pub const MLD_LISTENER_QUERY: u8 = 130;

const IPPROTO_IGMP: i32 = 2;

/// Operations the querier core and proxy loop need from the sending side.
pub trait Sender: Send + Sync {
    /// Subscribe the interface to `gaddr` (router-group join).
    fn send_report(&self, if_index: u32, gaddr: IpAddr) -> Result<()>;

    /// Unsubscribe the interface from `gaddr`.
    fn send_leave(&self, if_index: u32, gaddr: IpAddr) -> Result<()>;

    /// Transmit a general query on the interface.
    fn send_general_query(&self, if_index: u32, timers: &TimersValues) -> Result<()>;
}

/// Common trait for query packet builders.
pub trait PacketBuilder {
    /// Build a packet for transmission.
    fn build(&self) -> Vec<u8>;

    /// Internet checksum over `data`.
    fn calculate_checksum(&self, data: &[u8]) -> u16 {
        let mut sum: u32 = 0;
        for i in (0..data.len()).step_by(2) {
            if i + 1 < data.len() {
                let word = u16::from_be_bytes([data[i], data[i + 1]]);
                sum = sum.wrapping_add(word as u32);
            } else {
                sum = sum.wrapping_add((data[i] as u32) << 8);
            }
        }
        while (sum >> 16) != 0 {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        !(sum as u16)
    }
}

/// Encode a duration as an IGMPv3 8-bit time code (units of 1/10 second;
/// exponential range above 128, RFC 3376 section 4.1.1).
pub fn igmp_time_code(value: Duration) -> u8 {
    encode_code8((value.as_millis() / 100) as u32)
}

/// Encode a query interval as a QQIC (units of 1 second, same 8-bit scheme).
pub fn qqic(value: Duration) -> u8 {
    encode_code8(value.as_secs() as u32)
}

/// Encode a duration as an MLDv2 16-bit Maximum Response Code (units of
/// 1 millisecond; exponential range above 32768, RFC 3810 section 5.1.3).
pub fn mld_response_code(value: Duration) -> u16 {
    let ms = value.as_millis().min(u128::from(u32::MAX)) as u32;
    if ms < 0x8000 {
        return ms as u16;
    }
    let mut exp: u16 = 0;
    let mut mant = ms >> 3;
    while mant > 0x1fff {
        mant >>= 1;
        exp += 1;
        if exp > 7 {
            return u16::MAX;
        }
    }
    0x8000 | (exp << 12) | (mant as u16 & 0x0fff)
}

fn encode_code8(value: u32) -> u8 {
    if value < 128 {
        return value as u8;
    }
    let mut exp: u8 = 0;
    let mut mant = value >> 3;
    while mant > 0x1f {
        mant >>= 1;
        exp += 1;
        if exp > 7 {
            return u8::MAX;
        }
    }
    0x80 | (exp << 4) | (mant as u8 & 0x0f)
}

/// Builder for IGMPv3 general queries (RFC 3376 section 4.1).
#[derive(Debug)]
pub struct Igmpv3QueryBuilder {
    pub max_resp_code: u8,
    pub robustness: u8,
    pub qqic: u8,
}

impl Igmpv3QueryBuilder {
    pub fn general_query(timers: &TimersValues) -> Self {
        Self {
            max_resp_code: igmp_time_code(timers.query_response_interval),
            robustness: timers.robustness_variable.min(7),
            qqic: qqic(timers.query_interval),
        }
    }
}

impl PacketBuilder for Igmpv3QueryBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(12);

        packet.push(IGMP_MEMBERSHIP_QUERY);
        packet.push(self.max_resp_code);
        // Checksum placeholder
        packet.extend_from_slice(&[0, 0]);
        // Group Address: unspecified for a general query
        packet.extend_from_slice(&Ipv4Addr::UNSPECIFIED.octets());
        // Resv | S | QRV
        packet.push(self.robustness & 0x07);
        packet.push(self.qqic);
        // Number of Sources
        packet.extend_from_slice(&0u16.to_be_bytes());

        let checksum = self.calculate_checksum(&packet);
        packet[2..4].copy_from_slice(&checksum.to_be_bytes());
        packet
    }
}

/// Builder for MLDv2 general queries (RFC 3810 section 5.1). The ICMPv6
/// checksum needs the IPv6 pseudo-header and is filled in by the kernel.
#[derive(Debug)]
pub struct Mldv2QueryBuilder {
    pub max_resp_code: u16,
    pub robustness: u8,
    pub qqic: u8,
}

impl Mldv2QueryBuilder {
    pub fn general_query(timers: &TimersValues) -> Self {
        Self {
            max_resp_code: mld_response_code(timers.query_response_interval),
            robustness: timers.robustness_variable.min(7),
            qqic: qqic(timers.query_interval),
        }
    }
}

impl PacketBuilder for Mldv2QueryBuilder {
    fn build(&self) -> Vec<u8> {
        let mut packet = Vec::with_capacity(28);

        packet.push(MLD_LISTENER_QUERY);
        packet.push(0); // Code
        packet.extend_from_slice(&[0, 0]); // Checksum (kernel)
        packet.extend_from_slice(&self.max_resp_code.to_be_bytes());
        packet.extend_from_slice(&[0, 0]); // Reserved
        packet.extend_from_slice(&Ipv6Addr::UNSPECIFIED.octets());
        packet.push(self.robustness & 0x07);
        packet.push(self.qqic);
        packet.extend_from_slice(&0u16.to_be_bytes());

        packet
    }
}

/// Raw-socket sender for one address family.
pub struct SocketSender {
    version: ProtocolVersion,
    socket: Socket,
}

impl SocketSender {
    /// Open the raw protocol socket for the given family. Requires
    /// CAP_NET_RAW.
    pub fn new(version: ProtocolVersion) -> Result<Self> {
        let socket = match version {
            ProtocolVersion::Igmpv3 => {
                let socket = Socket::new(
                    Domain::IPV4,
                    Type::RAW,
                    Some(Protocol::from(IPPROTO_IGMP)),
                )
                .context("opening raw IGMP socket")?;
                socket
                    .set_multicast_ttl_v4(1)
                    .context("setting IGMP multicast TTL")?;
                socket
            }
            ProtocolVersion::Mldv2 => {
                let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
                    .context("opening raw ICMPv6 socket")?;
                socket
                    .set_multicast_hops_v6(1)
                    .context("setting MLD multicast hop limit")?;
                socket
            }
        };
        Ok(Self { version, socket })
    }

    fn check_family(&self, gaddr: &IpAddr) -> Result<()> {
        match (self.version, gaddr) {
            (ProtocolVersion::Igmpv3, IpAddr::V4(_)) => Ok(()),
            (ProtocolVersion::Mldv2, IpAddr::V6(_)) => Ok(()),
            _ => bail!("group address {gaddr} does not match sender family"),
        }
    }
}

impl Sender for SocketSender {
    fn send_report(&self, if_index: u32, gaddr: IpAddr) -> Result<()> {
        self.check_family(&gaddr)?;
        match gaddr {
            IpAddr::V4(group) => self
                .socket
                .join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(if_index))
                .with_context(|| format!("joining {group} on interface {if_index}")),
            IpAddr::V6(group) => self
                .socket
                .join_multicast_v6(&group, if_index)
                .with_context(|| format!("joining {group} on interface {if_index}")),
        }
    }

    fn send_leave(&self, if_index: u32, gaddr: IpAddr) -> Result<()> {
        self.check_family(&gaddr)?;
        match gaddr {
            IpAddr::V4(group) => self
                .socket
                .leave_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(if_index))
                .with_context(|| format!("leaving {group} on interface {if_index}")),
            IpAddr::V6(group) => self
                .socket
                .leave_multicast_v6(&group, if_index)
                .with_context(|| format!("leaving {group} on interface {if_index}")),
        }
    }

    fn send_general_query(&self, if_index: u32, timers: &TimersValues) -> Result<()> {
        match self.version {
            ProtocolVersion::Igmpv3 => {
                let local = interface_ipv4(if_index)
                    .with_context(|| format!("no IPv4 address on interface {if_index}"))?;
                self.socket
                    .set_multicast_if_v4(&local)
                    .context("selecting IGMP egress interface")?;
                let packet = Igmpv3QueryBuilder::general_query(timers).build();
                let dst = SockAddr::from(SocketAddrV4::new(IPV4_ALL_HOSTS, 0));
                self.socket
                    .send_to(&packet, &dst)
                    .context("sending IGMPv3 general query")?;
            }
            ProtocolVersion::Mldv2 => {
                self.socket
                    .set_multicast_if_v6(if_index)
                    .context("selecting MLD egress interface")?;
                let packet = Mldv2QueryBuilder::general_query(timers).build();
                let dst = SockAddr::from(SocketAddrV6::new(IPV6_ALL_NODES, 0, 0, if_index));
                self.socket
                    .send_to(&packet, &dst)
                    .context("sending MLDv2 general query")?;
            }
        }
        Ok(())
    }
}

/// First IPv4 address assigned to the interface with the given index.
fn interface_ipv4(if_index: u32) -> Option<Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for entry in addrs {
        let Ok(index) = nix::net::if_::if_nametoindex(entry.interface_name.as_str()) else {
            continue;
        };
        if index != if_index {
            continue;
        }
        if let Some(sockaddr) = entry.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            return Some(sockaddr.ip());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_igmp_time_code_linear_range() {
        // 10 s QRI = 100 deciseconds, below the exponential threshold
        assert_eq!(igmp_time_code(Duration::from_secs(10)), 100);
        assert_eq!(igmp_time_code(Duration::from_millis(100)), 1);
        assert_eq!(igmp_time_code(Duration::ZERO), 0);
    }

    #[test]
    fn test_igmp_time_code_exponential_range() {
        // 128 deciseconds encodes as mant = 0, exp = 0 -> 0x80
        assert_eq!(igmp_time_code(Duration::from_millis(12_800)), 0x80);
        // Decoding (mant | 0x10) << (exp + 3) must land within a factor of
        // two below the requested value (floor encoding).
        let code = igmp_time_code(Duration::from_secs(60)); // 600 ds
        assert!(code & 0x80 != 0);
        let mant = u32::from(code & 0x0f) | 0x10;
        let exp = u32::from((code >> 4) & 0x07);
        let decoded = mant << (exp + 3);
        assert!(decoded <= 600 && decoded > 600 / 2);
    }

    #[test]
    fn test_qqic_default_interval() {
        // 125 s fits the linear range
        assert_eq!(qqic(Duration::from_secs(125)), 125);
    }

    #[test]
    fn test_mld_response_code() {
        assert_eq!(mld_response_code(Duration::from_secs(10)), 10_000);
        let code = mld_response_code(Duration::from_secs(60)); // 60000 ms
        assert!(code & 0x8000 != 0);
        let mant = u32::from(code & 0x0fff) | 0x1000;
        let exp = u32::from((code >> 12) & 0x07);
        let decoded = mant << (exp + 3);
        assert!(decoded <= 60_000 && decoded > 60_000 / 2);
    }

    #[test]
    fn test_igmpv3_general_query_layout() {
        let packet = Igmpv3QueryBuilder::general_query(&TimersValues::default()).build();
        assert_eq!(packet.len(), 12);
        assert_eq!(packet[0], IGMP_MEMBERSHIP_QUERY);
        assert_eq!(packet[1], 100); // 10 s in deciseconds
        assert_eq!(&packet[4..8], &[0, 0, 0, 0]); // general query
        assert_eq!(packet[8], 2); // QRV = robustness
        assert_eq!(packet[9], 125); // QQIC
        assert_eq!(&packet[10..12], &[0, 0]); // no sources

        // Checksum must verify: summing the packet including the stored
        // checksum yields 0xffff before the final complement.
        let builder = Igmpv3QueryBuilder::general_query(&TimersValues::default());
        let mut unchecked = packet.clone();
        unchecked[2] = 0;
        unchecked[3] = 0;
        let expected = builder.calculate_checksum(&unchecked);
        assert_eq!(u16::from_be_bytes([packet[2], packet[3]]), expected);
    }

    #[test]
    fn test_mldv2_general_query_layout() {
        let packet = Mldv2QueryBuilder::general_query(&TimersValues::default()).build();
        assert_eq!(packet.len(), 28);
        assert_eq!(packet[0], MLD_LISTENER_QUERY);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 10_000);
        assert_eq!(&packet[8..24], &Ipv6Addr::UNSPECIFIED.octets());
        assert_eq!(packet[24], 2);
        assert_eq!(packet[25], 125);
    }
}
