//! Zero-copy extraction of a 5-tuple flow key from an Ethernet frame.
use thiserror::Error;

const ETH_HEADER_LEN: usize = 14;
const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_ARP: u16 = 0x0806;

const IPV4_MIN_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const UDP_LEN: usize = 8;
const TCP_MIN_LEN: usize = 20;
const ICMP_MIN_LEN: usize = 8;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

/// Reason a frame was rejected by [`parse_flow_key`].
///
/// Every variant is a protocol-layer drop per `spec.md` §7: counted, never
/// propagated past the worker's PARSE sub-state.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("frame shorter than the Ethernet header")]
    ShortEthernet,
    #[error("unsupported ethertype {0:#06x}")]
    UnsupportedEtherType(u16),
    #[error("IPv4 header truncated or malformed")]
    BadIpv4Header,
    #[error("IPv6 header truncated")]
    BadIpv6Header,
    #[error("L4 header truncated")]
    BadL4Header,
    #[error("unsupported L4 protocol {0}")]
    UnsupportedProtocol(u8),
}

/// A source or destination IP address, tagged by version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpAddrKey {
    V4(u32),
    V6([u8; 16]),
}

/// The 5-tuple (plus IP version) used for classification and RSS hashing.
///
/// For ICMP/ICMPv6, `src_port` holds the echo identifier and `dst_port`
/// holds `(type << 8) | code`, per `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowKey {
    pub ip_version: u8,
    pub src_ip: IpAddrKey,
    pub dst_ip: IpAddrKey,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

impl FlowKey {
    /// The key with source and destination endpoints swapped, used to test
    /// flow-hash symmetry.
    #[must_use]
    pub fn swap_endpoints(&self) -> Self {
        Self {
            ip_version: self.ip_version,
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

/// Returns the big-endian ethertype field of an Ethernet II frame.
///
/// # Errors
/// Returns [`ParseError::ShortEthernet`] if `frame` is shorter than 14 bytes.
pub fn peek_ethertype(frame: &[u8]) -> Result<u16, ParseError> {
    if frame.len() < ETH_HEADER_LEN {
        return Err(ParseError::ShortEthernet);
    }
    Ok(u16::from_be_bytes([frame[12], frame[13]]))
}

/// Parses a flow key out of a candidate Ethernet frame.
///
/// # Errors
/// Returns a [`ParseError`] describing the first bound or format violation
/// encountered; no out-of-bounds read is ever attempted.
pub fn parse_flow_key(frame: &[u8]) -> Result<FlowKey, ParseError> {
    let ethertype = peek_ethertype(frame)?;
    let l3 = &frame[ETH_HEADER_LEN..];

    match ethertype {
        ETHERTYPE_IPV4 => parse_ipv4(l3),
        ETHERTYPE_IPV6 => parse_ipv6(l3),
        other => Err(ParseError::UnsupportedEtherType(other)),
    }
}

fn parse_ipv4(l3: &[u8]) -> Result<FlowKey, ParseError> {
    if l3.len() < IPV4_MIN_LEN {
        return Err(ParseError::BadIpv4Header);
    }
    let version = l3[0] >> 4;
    if version != 4 {
        return Err(ParseError::BadIpv4Header);
    }
    let ihl = usize::from(l3[0] & 0x0F) * 4;
    if ihl < IPV4_MIN_LEN || ihl > l3.len() {
        return Err(ParseError::BadIpv4Header);
    }
    let protocol = l3[9];
    let src_ip = u32::from_be_bytes([l3[12], l3[13], l3[14], l3[15]]);
    let dst_ip = u32::from_be_bytes([l3[16], l3[17], l3[18], l3[19]]);

    let l4 = &l3[ihl..];
    let (src_port, dst_port) = parse_l4(protocol, l4)?;

    Ok(FlowKey {
        ip_version: 4,
        src_ip: IpAddrKey::V4(src_ip),
        dst_ip: IpAddrKey::V4(dst_ip),
        src_port,
        dst_port,
        protocol,
    })
}

fn parse_ipv6(l3: &[u8]) -> Result<FlowKey, ParseError> {
    if l3.len() < IPV6_LEN {
        return Err(ParseError::BadIpv6Header);
    }
    let version = l3[0] >> 4;
    if version != 6 {
        return Err(ParseError::BadIpv6Header);
    }
    let protocol = l3[6];
    let mut src_ip = [0u8; 16];
    let mut dst_ip = [0u8; 16];
    src_ip.copy_from_slice(&l3[8..24]);
    dst_ip.copy_from_slice(&l3[24..40]);

    let l4 = &l3[IPV6_LEN..];
    let (src_port, dst_port) = parse_l4(protocol, l4)?;

    Ok(FlowKey {
        ip_version: 6,
        src_ip: IpAddrKey::V6(src_ip),
        dst_ip: IpAddrKey::V6(dst_ip),
        src_port,
        dst_port,
        protocol,
    })
}

fn parse_l4(protocol: u8, l4: &[u8]) -> Result<(u16, u16), ParseError> {
    match protocol {
        PROTO_UDP => {
            if l4.len() < UDP_LEN {
                return Err(ParseError::BadL4Header);
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            Ok((src_port, dst_port))
        }
        PROTO_TCP => {
            if l4.len() < TCP_MIN_LEN {
                return Err(ParseError::BadL4Header);
            }
            let data_offset = usize::from(l4[12] >> 4) * 4;
            if data_offset < TCP_MIN_LEN || data_offset > l4.len() {
                return Err(ParseError::BadL4Header);
            }
            let src_port = u16::from_be_bytes([l4[0], l4[1]]);
            let dst_port = u16::from_be_bytes([l4[2], l4[3]]);
            Ok((src_port, dst_port))
        }
        PROTO_ICMP | PROTO_ICMPV6 => {
            if l4.len() < ICMP_MIN_LEN {
                return Err(ParseError::BadL4Header);
            }
            let icmp_type = l4[0];
            let code = l4[1];
            let identifier = u16::from_be_bytes([l4[4], l4[5]]);
            let dst_port = (u16::from(icmp_type) << 8) | u16::from(code);
            Ok((identifier, dst_port))
        }
        other => Err(ParseError::UnsupportedProtocol(other)),
    }
}
