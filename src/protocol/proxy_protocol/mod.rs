//! PROXY protocol v1 support: the upstream handshake announcing the real
//! client addresses before any application bytes.

pub mod header;
pub mod parser;

pub use self::header::{HeaderV1, ProtocolV1};
pub use self::parser::{consume_v1_header, parse_v1_header, ProxyProtoError};
