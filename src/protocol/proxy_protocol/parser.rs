//! PROXY protocol v1 line parser.
//!
//! Streaming combinators make the partial-input case explicit: the
//! receiver peeks at the buffered bytes first and only consumes once a
//! complete line parsed, so a half-received header never corrupts the
//! stream behind it. The protocol sniff is positive: the first six bytes
//! must equal `PROXY `.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use nom::{
    branch::alt,
    bytes::streaming::{tag, take_while1},
    character::streaming::char,
    combinator::map_res,
    sequence::tuple,
    IResult,
};

use crate::buffer::Buffer;

use super::header::{HeaderV1, ProtocolV1, MAX_V1_LINE};

fn is_addr_char(c: u8) -> bool {
    c.is_ascii_hexdigit() || c == b'.' || c == b':'
}

fn parse_ip(i: &[u8]) -> IResult<&[u8], IpAddr> {
    map_res(take_while1(is_addr_char), |s: &[u8]| {
        std::str::from_utf8(s)
            .map_err(|_| ())
            .and_then(|s| s.parse::<IpAddr>().map_err(|_| ()))
    })(i)
}

fn parse_port(i: &[u8]) -> IResult<&[u8], u16> {
    map_res(take_while1(|c: u8| c.is_ascii_digit()), |s: &[u8]| {
        std::str::from_utf8(s)
            .map_err(|_| ())
            .and_then(|s| s.parse::<u16>().map_err(|_| ()))
    })(i)
}

fn parse_tcp(i: &[u8]) -> IResult<&[u8], HeaderV1> {
    let (i, (_, family, _, src, _, dst, _, sport, _, dport, _)) = tuple((
        tag("PROXY "),
        alt((tag("TCP4"), tag("TCP6"))),
        char(' '),
        parse_ip,
        char(' '),
        parse_ip,
        char(' '),
        parse_port,
        char(' '),
        parse_port,
        tag("\r\n"),
    ))(i)?;
    let protocol = if family == b"TCP4" {
        ProtocolV1::Tcp4
    } else {
        ProtocolV1::Tcp6
    };
    Ok((
        i,
        HeaderV1 {
            protocol,
            addr_src: SocketAddr::new(src, sport),
            addr_dst: SocketAddr::new(dst, dport),
        },
    ))
}

fn parse_unknown(i: &[u8]) -> IResult<&[u8], HeaderV1> {
    // senders may append the unparsed address block; it is ignored
    let (i, _) = tuple((
        tag("PROXY UNKNOWN"),
        nom::bytes::streaming::take_while(|c| c != b'\r'),
        tag("\r\n"),
    ))(i)?;
    Ok((
        i,
        HeaderV1 {
            protocol: ProtocolV1::Unknown,
            addr_src: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            addr_dst: SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        },
    ))
}

pub fn parse_v1_header(i: &[u8]) -> IResult<&[u8], HeaderV1> {
    alt((parse_tcp, parse_unknown))(i)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProxyProtoError {
    #[error("the handshake line is not PROXY protocol v1")]
    Invalid,
    #[error("the handshake line exceeds the maximum length")]
    TooLong,
}

/// Peek-first, consume-exact receiver: inspects the buffered input and
/// only removes the header line once it parsed completely. Returns
/// `Ok(None)` when more bytes are needed.
pub fn consume_v1_header(buf: &mut Buffer) -> Result<Option<HeaderV1>, ProxyProtoError> {
    let peeked = buf.linearize_input();
    match parse_v1_header(&peeked) {
        Ok((rest, header)) => {
            let consumed = peeked.len() - rest.len();
            buf.skip_input(consumed);
            Ok(Some(header))
        }
        Err(nom::Err::Incomplete(_)) => {
            if peeked.len() >= MAX_V1_LINE {
                return Err(ProxyProtoError::TooLong);
            }
            Ok(None)
        }
        Err(_) => Err(ProxyProtoError::Invalid),
    }
}
