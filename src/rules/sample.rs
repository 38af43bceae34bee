//! Sample fetches: named extractors returning a typed value from the
//! current transaction and connection.

use std::net::{IpAddr, SocketAddr};

use crate::buffer::Buffer;
use crate::protocol::http::parser::compare_no_case;
use crate::protocol::http::Transaction;

/// Addresses of the underlying connection, as rewritten by an accepted
/// PROXY protocol handshake where applicable.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub src: SocketAddr,
    pub dst: SocketAddr,
}

/// A typed fetched value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Bool(bool),
    Int(i64),
    Str(Vec<u8>),
    Addr(IpAddr),
}

impl Sample {
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Sample::Bool(b) => if *b { b"1".to_vec() } else { b"0".to_vec() },
            Sample::Int(v) => v.to_string().into_bytes(),
            Sample::Str(s) => s.clone(),
            Sample::Addr(a) => a.to_string().into_bytes(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Sample::Bool(b) => Some(*b as i64),
            Sample::Int(v) => Some(*v),
            Sample::Str(s) => std::str::from_utf8(s).ok()?.parse().ok(),
            Sample::Addr(_) => None,
        }
    }

    pub fn as_addr(&self) -> Option<IpAddr> {
        match self {
            Sample::Addr(a) => Some(*a),
            Sample::Str(s) => std::str::from_utf8(s).ok()?.parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> bool {
        match self {
            Sample::Bool(b) => *b,
            Sample::Int(v) => *v != 0,
            Sample::Str(s) => !s.is_empty(),
            Sample::Addr(_) => true,
        }
    }
}

/// A named extractor. Header- and body-dependent fetches return `Missing`
/// until the request headers are parsed, which drives the tri-state rule
/// results during early TCP inspection.
#[derive(Debug, Clone)]
pub enum SampleFetch {
    Src,
    SrcPort,
    Dst,
    DstPort,
    Url,
    Path,
    Hdr(String),
    Cook(String),
    Base,
    Base32,
    Status,
    Method,
    Version,
    UrlParam(String),
    HttpFirstReq,
    /// valid Basic credentials against the embedded user list
    HttpAuth(Vec<(String, String)>),
}

/// Everything a fetch may look at.
pub struct SampleCtx<'a> {
    pub conn: &'a ConnInfo,
    pub txn: &'a Transaction,
    /// request buffer; headers are visible while the transaction holds them
    pub buf: &'a Buffer,
}

/// `Missing` turns into a rule-level MISS: evaluation suspends until more
/// data arrives or the inspection delay expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Value(Sample),
    Missing,
}

impl SampleFetch {
    pub fn eval(&self, ctx: &SampleCtx) -> FetchResult {
        use FetchResult::{Missing, Value};
        match self {
            SampleFetch::Src => Value(Sample::Addr(ctx.conn.src.ip())),
            SampleFetch::SrcPort => Value(Sample::Int(ctx.conn.src.port() as i64)),
            SampleFetch::Dst => Value(Sample::Addr(ctx.conn.dst.ip())),
            SampleFetch::DstPort => Value(Sample::Int(ctx.conn.dst.port() as i64)),
            SampleFetch::Url => match &ctx.txn.uri {
                Some(uri) => Value(Sample::Str(uri.clone().into_bytes())),
                None => Missing,
            },
            SampleFetch::Path => match &ctx.txn.uri {
                Some(uri) => Value(Sample::Str(path_of(uri.as_bytes()))),
                None => Missing,
            },
            SampleFetch::Hdr(name) => {
                if !ctx.txn.req.state.headers_complete() {
                    return Missing;
                }
                match find_header(ctx, name.as_bytes()) {
                    Some(v) => Value(Sample::Str(v)),
                    None => Value(Sample::Str(Vec::new())),
                }
            }
            SampleFetch::Cook(name) => {
                if !ctx.txn.req.state.headers_complete() {
                    return Missing;
                }
                match find_cookie(ctx, name.as_bytes()) {
                    Some(v) => Value(Sample::Str(v)),
                    None => Value(Sample::Str(Vec::new())),
                }
            }
            SampleFetch::Base => match (&ctx.txn.uri, host_of(ctx)) {
                (Some(uri), Some(host)) => {
                    let mut base = host;
                    base.extend_from_slice(&path_of(uri.as_bytes()));
                    Value(Sample::Str(base))
                }
                (None, _) => Missing,
                (Some(uri), None) => Value(Sample::Str(path_of(uri.as_bytes()))),
            },
            SampleFetch::Base32 => match (&ctx.txn.uri, host_of(ctx)) {
                (Some(uri), host) => {
                    let mut hash: u32 = 0;
                    if let Some(host) = host {
                        for &c in &host {
                            hash = sdbm_step(hash, c);
                        }
                    }
                    for &c in &path_of(uri.as_bytes()) {
                        hash = sdbm_step(hash, c);
                    }
                    Value(Sample::Int(full_avalanche(hash) as i64))
                }
                (None, _) => Missing,
            },
            SampleFetch::Status => {
                if ctx.txn.status == 0 {
                    Missing
                } else {
                    Value(Sample::Int(ctx.txn.status as i64))
                }
            }
            SampleFetch::Method => match &ctx.txn.meth {
                Some(m) => Value(Sample::Str(m.to_string().into_bytes())),
                None => Missing,
            },
            SampleFetch::Version => {
                if !ctx.txn.req.state.headers_complete() {
                    return Missing;
                }
                let v = if ctx
                    .txn
                    .req
                    .flags
                    .has(crate::protocol::http::parser::MsgFlags::VER_11)
                {
                    b"1.1".to_vec()
                } else {
                    b"1.0".to_vec()
                };
                Value(Sample::Str(v))
            }
            SampleFetch::UrlParam(name) => match &ctx.txn.uri {
                Some(uri) => Value(Sample::Str(
                    url_param(uri.as_bytes(), name.as_bytes()).unwrap_or_default(),
                )),
                None => Missing,
            },
            SampleFetch::HttpFirstReq => Value(Sample::Bool(ctx.txn.keepalive_count == 0)),
            SampleFetch::HttpAuth(users) => {
                if !ctx.txn.req.state.headers_complete() {
                    return Missing;
                }
                Value(Sample::Bool(check_basic_auth(ctx, users)))
            }
        }
    }
}

/// The sdbm accumulation step used over host and path bytes.
fn sdbm_step(hash: u32, c: u8) -> u32 {
    (c as u32)
        .wrapping_add(hash << 6)
        .wrapping_add(hash << 16)
        .wrapping_sub(hash)
}

/// Thirty-two bit integer avalanche, applied over the accumulated hash so
/// close inputs spread over the whole space.
pub fn full_avalanche(mut a: u32) -> u32 {
    a = a.wrapping_add(0x7ed55d16).wrapping_add(a << 12);
    a = (a ^ 0xc761c23c) ^ (a >> 19);
    a = a.wrapping_add(0x165667b1).wrapping_add(a << 5);
    a = a.wrapping_add(0xd3a2646c) ^ (a << 9);
    a = a.wrapping_add(0xfd7046c5).wrapping_add(a << 3);
    a = (a ^ 0xb55a4f09) ^ (a >> 16);
    a
}

fn path_of(uri: &[u8]) -> Vec<u8> {
    // absolute-form targets carry scheme and authority before the path
    if uri.starts_with(b"http://") || uri.starts_with(b"https://") {
        if let Some(url) = std::str::from_utf8(uri)
            .ok()
            .and_then(|s| url::Url::parse(s).ok())
        {
            return url.path().as_bytes().to_vec();
        }
    }
    let end = uri.iter().position(|&c| c == b'?').unwrap_or(uri.len());
    uri[..end].to_vec()
}

fn find_header(ctx: &SampleCtx, name: &[u8]) -> Option<Vec<u8>> {
    let mut hctx = ctx.txn.hdr_idx.fresh_ctx();
    if ctx
        .txn
        .hdr_idx
        .find(ctx.buf, ctx.buf.input_begin(), name, &mut hctx)
    {
        let base = hctx.sol + hctx.val;
        Some((0..hctx.vlen).map(|n| ctx.buf.input_byte(base + n)).collect())
    } else {
        None
    }
}

fn host_of(ctx: &SampleCtx) -> Option<Vec<u8>> {
    find_header(ctx, b"Host").filter(|h| !h.is_empty())
}

fn find_cookie(ctx: &SampleCtx, name: &[u8]) -> Option<Vec<u8>> {
    let raw = find_header(ctx, b"Cookie")?;
    for pair in raw.split(|&c| c == b';') {
        let pair = trim(pair);
        if let Some(eq) = pair.iter().position(|&c| c == b'=') {
            if &pair[..eq] == name {
                return Some(trim(&pair[eq + 1..]).to_vec());
            }
        }
    }
    None
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|&c| c != b' ' && c != b'\t').unwrap_or(s.len());
    let end = s.iter().rposition(|&c| c != b' ' && c != b'\t').map(|n| n + 1).unwrap_or(start);
    &s[start..end]
}

fn url_param(uri: &[u8], name: &[u8]) -> Option<Vec<u8>> {
    let query = &uri[uri.iter().position(|&c| c == b'?')? + 1..];
    for pair in query.split(|&c| c == b'&') {
        match pair.iter().position(|&c| c == b'=') {
            Some(eq) if &pair[..eq] == name => return Some(pair[eq + 1..].to_vec()),
            None if pair == name => return Some(Vec::new()),
            _ => {}
        }
    }
    None
}

const BASE64_ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Standard base64 decoding for Authorization headers.
pub fn base64_decode(input: &[u8]) -> Option<Vec<u8>> {
    let input: Vec<u8> = input.iter().copied().filter(|&c| c != b'=').collect();
    let mut out = Vec::with_capacity(input.len() * 3 / 4);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for &c in &input {
        let v = BASE64_ALPHABET.iter().position(|&a| a == c)? as u32;
        acc = (acc << 6) | v;
        bits += 6;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}

fn check_basic_auth(ctx: &SampleCtx, users: &[(String, String)]) -> bool {
    let value = match find_header(ctx, b"Authorization") {
        Some(v) if !v.is_empty() => v,
        _ => return false,
    };
    if value.len() < 6 || !compare_no_case(&value[..6], b"Basic ") {
        return false;
    }
    let decoded = match base64_decode(trim(&value[6..])) {
        Some(d) => d,
        None => return false,
    };
    let text = match std::str::from_utf8(&decoded) {
        Ok(t) => t,
        Err(_) => return false,
    };
    match text.split_once(':') {
        Some((user, pass)) => users.iter().any(|(u, p)| u == user && p == pass),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendConfig, FrontendConfig};
    use crate::protocol::http::AnalyserStatus;

    fn ctx_for(raw: &[u8]) -> (Buffer, Transaction, ConnInfo) {
        let mut buf = Buffer::with_capacity_and_margin(2048, 256);
        buf.write(raw);
        let mut txn = Transaction::new();
        let status = txn.process_request_headers(
            &mut buf,
            &FrontendConfig::default(),
            &BackendConfig::default(),
            0,
        );
        assert_eq!(status, AnalyserStatus::Complete);
        let conn = ConnInfo {
            src: "192.0.2.7:42424".parse().unwrap(),
            dst: "198.51.100.1:80".parse().unwrap(),
        };
        (buf, txn, conn)
    }

    #[test]
    fn address_fetches() {
        let (buf, txn, conn) = ctx_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let ctx = SampleCtx { conn: &conn, txn: &txn, buf: &buf };
        assert_eq!(
            SampleFetch::Src.eval(&ctx),
            FetchResult::Value(Sample::Addr("192.0.2.7".parse().unwrap()))
        );
        assert_eq!(
            SampleFetch::SrcPort.eval(&ctx),
            FetchResult::Value(Sample::Int(42424))
        );
        assert_eq!(
            SampleFetch::DstPort.eval(&ctx),
            FetchResult::Value(Sample::Int(80))
        );
    }

    #[test]
    fn url_and_path_fetches() {
        let (buf, txn, conn) = ctx_for(b"GET /a/b?k=v&flag HTTP/1.1\r\nHost: x\r\n\r\n");
        let ctx = SampleCtx { conn: &conn, txn: &txn, buf: &buf };
        assert_eq!(
            SampleFetch::Url.eval(&ctx),
            FetchResult::Value(Sample::Str(b"/a/b?k=v&flag".to_vec()))
        );
        assert_eq!(
            SampleFetch::Path.eval(&ctx),
            FetchResult::Value(Sample::Str(b"/a/b".to_vec()))
        );
        assert_eq!(
            SampleFetch::UrlParam("k".into()).eval(&ctx),
            FetchResult::Value(Sample::Str(b"v".to_vec()))
        );
        assert_eq!(
            SampleFetch::UrlParam("flag".into()).eval(&ctx),
            FetchResult::Value(Sample::Str(Vec::new()))
        );
    }

    #[test]
    fn header_and_cookie_fetches() {
        let (buf, txn, conn) =
            ctx_for(b"GET / HTTP/1.1\r\nHost: x\r\nX-Id: 42\r\nCookie: a=1; b=2\r\n\r\n");
        let ctx = SampleCtx { conn: &conn, txn: &txn, buf: &buf };
        assert_eq!(
            SampleFetch::Hdr("x-id".into()).eval(&ctx),
            FetchResult::Value(Sample::Str(b"42".to_vec()))
        );
        assert_eq!(
            SampleFetch::Cook("b".into()).eval(&ctx),
            FetchResult::Value(Sample::Str(b"2".to_vec()))
        );
    }

    #[test]
    fn base32_is_avalanched_host_path_hash() {
        // scenario: base32 over Host "x" and path "/a"
        let (buf, txn, conn) = ctx_for(
            b"GET /a HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        let ctx = SampleCtx { conn: &conn, txn: &txn, buf: &buf };
        let mut hash: u32 = 0;
        for &c in b"x/a" {
            hash = super::sdbm_step(hash, c);
        }
        let expected = full_avalanche(hash) as i64;
        assert_eq!(
            SampleFetch::Base32.eval(&ctx),
            FetchResult::Value(Sample::Int(expected))
        );
        assert_eq!(
            SampleFetch::Base.eval(&ctx),
            FetchResult::Value(Sample::Str(b"x/a".to_vec()))
        );
    }

    #[test]
    fn http_auth_checks_credentials() {
        // "user:secret" in base64
        let (buf, txn, conn) = ctx_for(
            b"GET / HTTP/1.1\r\nHost: x\r\nAuthorization: Basic dXNlcjpzZWNyZXQ=\r\n\r\n",
        );
        let ctx = SampleCtx { conn: &conn, txn: &txn, buf: &buf };
        let users = vec![("user".to_string(), "secret".to_string())];
        assert_eq!(
            SampleFetch::HttpAuth(users).eval(&ctx),
            FetchResult::Value(Sample::Bool(true))
        );
        let wrong = vec![("user".to_string(), "other".to_string())];
        assert_eq!(
            SampleFetch::HttpAuth(wrong).eval(&ctx),
            FetchResult::Value(Sample::Bool(false))
        );
    }

    #[test]
    fn base64_decoding() {
        assert_eq!(base64_decode(b"dXNlcjpzZWNyZXQ=").unwrap(), b"user:secret");
        assert_eq!(base64_decode(b"YQ==").unwrap(), b"a");
        assert!(base64_decode(b"!!bad!!").is_none());
    }

    #[test]
    fn first_request_flag() {
        let (buf, mut txn, conn) = ctx_for(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        {
            let ctx = SampleCtx { conn: &conn, txn: &txn, buf: &buf };
            assert_eq!(
                SampleFetch::HttpFirstReq.eval(&ctx),
                FetchResult::Value(Sample::Bool(true))
            );
        }
        txn.reset();
        let ctx = SampleCtx { conn: &conn, txn: &txn, buf: &buf };
        assert_eq!(
            SampleFetch::HttpFirstReq.eval(&ctx),
            FetchResult::Value(Sample::Bool(false))
        );
    }
}
