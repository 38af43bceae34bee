//! PROXY protocol v1 header representation and emitter.

use std::fmt;
use std::net::SocketAddr;

/// Transport family announced on the line.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ProtocolV1 {
    Tcp4,
    Tcp6,
    Unknown,
}

impl fmt::Display for ProtocolV1 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ProtocolV1::Tcp4 => write!(f, "TCP4"),
            ProtocolV1::Tcp6 => write!(f, "TCP6"),
            ProtocolV1::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Text form header:
/// - TCP/IPv4: `PROXY TCP4 255.255.255.255 255.255.255.255 65535 65535\r\n`
/// - TCP/IPv6: `PROXY TCP6 ffff::ffff ffff::ffff 65535 65535\r\n`
/// - Unknown: `PROXY UNKNOWN\r\n`
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct HeaderV1 {
    pub protocol: ProtocolV1,
    pub addr_src: SocketAddr,
    pub addr_dst: SocketAddr,
}

/// The longest well-formed v1 line, terminator included.
pub const MAX_V1_LINE: usize = 107;

impl HeaderV1 {
    pub fn new(addr_src: SocketAddr, addr_dst: SocketAddr) -> Self {
        let protocol = if addr_dst.is_ipv6() {
            ProtocolV1::Tcp6
        } else if addr_dst.is_ipv4() {
            ProtocolV1::Tcp4
        } else {
            ProtocolV1::Unknown
        };
        HeaderV1 {
            protocol,
            addr_src,
            addr_dst,
        }
    }

    pub fn into_bytes(&self) -> Vec<u8> {
        if self.protocol == ProtocolV1::Unknown {
            return b"PROXY UNKNOWN\r\n".to_vec();
        }
        format!(
            "PROXY {} {} {} {} {}\r\n",
            self.protocol,
            self.addr_src.ip(),
            self.addr_dst.ip(),
            self.addr_src.port(),
            self.addr_dst.port(),
        )
        .into_bytes()
    }
}
