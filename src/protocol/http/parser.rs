//! Incremental HTTP/1.x message parser.
//!
//! The parser is a hand-written byte state machine, not a grammar library:
//! it must be able to stop on any byte when input runs out, persist its
//! state into the message, and resume later without re-scanning, even when
//! the message sits across the wrap point of the ring. All offsets stored
//! in [`HttpMsg`] are relative to the buffer's input start.

use log::debug;

use crate::buffer::Buffer;

use super::header::HeaderIndex;

/// ASCII case-insensitive equality, the comparison HTTP tokens and header
/// names call for: only A-Z/a-z fold, every other byte must match exactly.
pub fn compare_no_case(left: &[u8], right: &[u8]) -> bool {
    left.eq_ignore_ascii_case(right)
}

pub fn is_token_char(i: u8) -> bool {
    i.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&i)
}

/// Printable ASCII, the only bytes accepted in a request target by default.
fn is_uri_char(i: u8) -> bool {
    (0x21..=0x7e).contains(&i)
}

fn is_version_char(i: u8) -> bool {
    i.is_ascii_digit() || i == b'.' || i == b'/' || i == b'H' || i == b'T' || i == b'P'
}

fn is_spht(i: u8) -> bool {
    i == b' ' || i == b'\t'
}

fn is_crlf(i: u8) -> bool {
    i == b'\r' || i == b'\n'
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Trace,
    Other(String),
}

impl Method {
    pub fn new(s: &[u8]) -> Method {
        if compare_no_case(s, b"GET") {
            Method::Get
        } else if compare_no_case(s, b"HEAD") {
            Method::Head
        } else if compare_no_case(s, b"POST") {
            Method::Post
        } else if compare_no_case(s, b"PUT") {
            Method::Put
        } else if compare_no_case(s, b"DELETE") {
            Method::Delete
        } else if compare_no_case(s, b"CONNECT") {
            Method::Connect
        } else if compare_no_case(s, b"TRACE") {
            Method::Trace
        } else {
            Method::Other(String::from_utf8_lossy(s).into_owned())
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Method::Get => write!(f, "GET"),
            Method::Head => write!(f, "HEAD"),
            Method::Post => write!(f, "POST"),
            Method::Put => write!(f, "PUT"),
            Method::Delete => write!(f, "DELETE"),
            Method::Connect => write!(f, "CONNECT"),
            Method::Trace => write!(f, "TRACE"),
            Method::Other(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    V10,
    V11,
}

/// Parser states. `Rq*`/`Rp*` drive the start line, `Hdr*`/`LastLf` the
/// header block, and the remaining states describe body transfer, owned by
/// the transaction state machine and the chunk codec. The declaration
/// order matters: states compare by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MsgState {
    RqBefore,
    RqBeforeCr,
    RqMeth,
    RqMethSp,
    RqUri,
    RqUriSp,
    RqVer,
    RqLineEnd,
    RpBefore,
    RpBeforeCr,
    RpVer,
    RpVerSp,
    RpCode,
    RpCodeSp,
    RpReason,
    RpLineEnd,
    HdrFirst,
    HdrName,
    HdrL1Sp,
    HdrL1Lf,
    HdrL1Lws,
    HdrVal,
    HdrL2Lf,
    HdrL2Lws,
    LastLf,
    Body,
    ChunkSize,
    Data,
    ChunkCrlf,
    Trailers,
    Done,
    Closing,
    Closed,
    Tunnel,
    Error,
}

impl MsgState {
    pub fn is_request_line(&self) -> bool {
        matches!(
            self,
            MsgState::RqBefore
                | MsgState::RqBeforeCr
                | MsgState::RqMeth
                | MsgState::RqMethSp
                | MsgState::RqUri
                | MsgState::RqUriSp
                | MsgState::RqVer
                | MsgState::RqLineEnd
        )
    }

    /// Headers fully parsed, body transfer may start.
    pub fn headers_complete(&self) -> bool {
        *self >= MsgState::Body && *self != MsgState::Error
    }

    pub fn finished(&self) -> bool {
        matches!(self, MsgState::Done | MsgState::Closing | MsgState::Closed | MsgState::Tunnel)
    }
}

/// Message flag bits, sharing one compact word the way the channel readiness
/// bits do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags(pub u32);

impl MsgFlags {
    /// Content-Length present
    pub const CNT_LEN: u32 = 0x0001;
    /// Transfer-Encoding: chunked present
    pub const TE_CHNK: u32 = 0x0002;
    /// message uses HTTP/1.1 or above
    pub const VER_11: u32 = 0x0004;
    /// the body size is known (either of the two above, or bodyless)
    pub const XFER_LEN: u32 = 0x0008;
    /// the body is being compressed on the fly
    pub const COMPRESSING: u32 = 0x0010;

    pub fn set(&mut self, flag: u32) {
        self.0 |= flag;
    }

    pub fn clear(&mut self, flag: u32) {
        self.0 &= !flag;
    }

    pub fn has(&self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestLineLayout {
    /// method length; the method always starts at offset 0
    pub m_len: usize,
    /// URI offset and length
    pub u: usize,
    pub u_len: usize,
    /// version offset and length; a zero length marks an HTTP/0.9 request
    pub v: usize,
    pub v_len: usize,
    /// total request line length, CR/LF excluded
    pub len: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusLineLayout {
    pub v_len: usize,
    /// status code offset, length, and parsed value
    pub c: usize,
    pub c_len: usize,
    pub status: u16,
    /// reason offset and length
    pub r: usize,
    pub r_len: usize,
    pub len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartLine {
    None,
    Request(RequestLineLayout),
    Status(StatusLineLayout),
}

/// One direction's message being parsed and forwarded. Offsets are relative
/// to the buffer's input start while headers are being processed.
#[derive(Debug, Clone)]
pub struct HttpMsg {
    pub state: MsgState,
    /// start of the current line during parsing, then start of message
    pub sol: usize,
    /// offset of the last CR/LF ending the header block
    pub eoh: usize,
    /// start of value during header parsing, then first body byte
    pub sov: usize,
    /// length of the final empty line (1 for LF, 2 for CRLF)
    pub eol: usize,
    /// next byte to parse; saved verbatim on suspension
    pub next: usize,
    pub chunk_len: u64,
    pub body_len: u64,
    pub flags: MsgFlags,
    pub start_line: StartLine,
    /// first invalid byte observed, for diagnostics
    pub err_pos: Option<usize>,
    /// state the parser was in when the error fired
    pub err_state: Option<MsgState>,
}

impl HttpMsg {
    pub fn request() -> HttpMsg {
        HttpMsg::new(MsgState::RqBefore)
    }

    pub fn response() -> HttpMsg {
        HttpMsg::new(MsgState::RpBefore)
    }

    fn new(state: MsgState) -> HttpMsg {
        HttpMsg {
            state,
            sol: 0,
            eoh: 0,
            sov: 0,
            eol: 0,
            next: 0,
            chunk_len: 0,
            body_len: 0,
            flags: MsgFlags::default(),
            start_line: StartLine::None,
            err_pos: None,
            err_state: None,
        }
    }

    pub fn reset(&mut self, state: MsgState) {
        *self = HttpMsg::new(state);
    }

    pub fn is_error(&self) -> bool {
        self.state == MsgState::Error
    }

    /// Applies a header-block displacement: `sov`, `eoh` and `next` all sit
    /// at or after any header edit point once parsing completed.
    pub fn move_end(&mut self, delta: i32) {
        self.eoh = (self.eoh as i64 + delta as i64) as usize;
        self.sov = (self.sov as i64 + delta as i64) as usize;
        self.next = (self.next as i64 + delta as i64) as usize;
    }

    pub fn request_line(&self) -> Option<&RequestLineLayout> {
        match &self.start_line {
            StartLine::Request(rl) => Some(rl),
            _ => None,
        }
    }

    pub fn status_line(&self) -> Option<&StatusLineLayout> {
        match &self.start_line {
            StartLine::Status(sl) => Some(sl),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        self.status_line().map(|sl| sl.status)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParserConfig {
    /// accept bytes >= 0x80 in the request target, recording the first
    /// offending position instead of failing
    pub accept_invalid_request: bool,
}

/// Outcome of one parser activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseStatus {
    /// headers fully parsed, message advanced to `Body`
    Complete,
    /// input exhausted, state and `next` saved for resumption
    NeedData,
    /// parse error, see `err_pos`/`err_state`
    Invalid,
}

/// Runs the state machine from `msg.next` until the headers complete, input
/// runs out, or an error fires. Completed header lines are registered into
/// `idx` as they are recognized.
pub fn parse_message(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    cfg: &ParserConfig,
) -> ParseStatus {
    let mut state = msg.state;
    let mut ptr = msg.next;

    macro_rules! fail {
        () => {{
            msg.err_state = Some(state);
            if msg.err_pos.is_none() {
                msg.err_pos = Some(ptr);
            }
            msg.state = MsgState::Error;
            msg.next = ptr;
            debug!("parse error in state {:?} at offset {}", state, ptr);
            return ParseStatus::Invalid
        }};
    }

    // registers the header line ending at msg.eol, then transitions on the
    // byte at ptr: another header name, or the final empty line
    macro_rules! complete_header {
        ($c:expr) => {{
            let has_cr = buf.input_byte(msg.eol) == b'\r';
            if idx.add(msg.eol - msg.sol, has_cr, idx.tail()).is_err() {
                fail!();
            }
            msg.sol = ptr;
            if !is_crlf($c) {
                state = MsgState::HdrName;
            } else {
                state = MsgState::LastLf;
                if $c == b'\r' {
                    ptr += 1;
                }
            }
        }};
    }

    loop {
        if ptr >= buf.input_len() {
            // out of data: save the state and exact position
            msg.state = state;
            msg.next = ptr;
            return ParseStatus::NeedData;
        }
        let c = buf.input_byte(ptr);

        match state {
            MsgState::RqBefore | MsgState::RpBefore => {
                if (state == MsgState::RqBefore && is_token_char(c))
                    || (state == MsgState::RpBefore && is_version_char(c))
                {
                    // a message starts here; drop the empty lines before it,
                    // which is only possible with nothing pending on the
                    // output side
                    if ptr > 0 {
                        if buf.output_len() > 0 {
                            msg.state = state;
                            msg.next = ptr;
                            return ParseStatus::NeedData;
                        }
                        buf.skip_input(ptr);
                        ptr = 0;
                    }
                    msg.sol = 0;
                    state = if state == MsgState::RqBefore {
                        MsgState::RqMeth
                    } else {
                        MsgState::RpVer
                    };
                } else if c == b'\r' {
                    ptr += 1;
                    state = if state == MsgState::RqBefore {
                        MsgState::RqBeforeCr
                    } else {
                        MsgState::RpBeforeCr
                    };
                } else if c == b'\n' {
                    ptr += 1;
                } else {
                    fail!();
                }
            }
            MsgState::RqBeforeCr | MsgState::RpBeforeCr => {
                if c == b'\n' {
                    ptr += 1;
                    state = if state == MsgState::RqBeforeCr {
                        MsgState::RqBefore
                    } else {
                        MsgState::RpBefore
                    };
                } else {
                    fail!();
                }
            }

            // ---------------- request line ----------------
            MsgState::RqMeth => {
                if is_token_char(c) {
                    ptr += 1;
                } else if is_spht(c) {
                    let rl = RequestLineLayout {
                        m_len: ptr,
                        ..RequestLineLayout::default()
                    };
                    msg.start_line = StartLine::Request(rl);
                    ptr += 1;
                    state = MsgState::RqMethSp;
                } else if is_crlf(c) {
                    // HTTP/0.9 request with a bare method
                    msg.start_line = StartLine::Request(RequestLineLayout {
                        m_len: ptr,
                        u: ptr,
                        u_len: 0,
                        v: ptr,
                        v_len: 0,
                        len: ptr,
                    });
                    state = MsgState::RqLineEnd;
                    if c == b'\r' {
                        ptr += 1;
                    }
                } else {
                    fail!();
                }
            }
            MsgState::RqMethSp => {
                if is_spht(c) {
                    ptr += 1;
                } else if is_crlf(c) {
                    // HTTP/0.9, no URI
                    if let StartLine::Request(ref mut rl) = msg.start_line {
                        rl.u = ptr;
                        rl.u_len = 0;
                        rl.v = ptr;
                        rl.v_len = 0;
                        rl.len = ptr;
                    }
                    state = MsgState::RqLineEnd;
                    if c == b'\r' {
                        ptr += 1;
                    }
                } else {
                    if let StartLine::Request(ref mut rl) = msg.start_line {
                        rl.u = ptr;
                    }
                    state = MsgState::RqUri;
                }
            }
            MsgState::RqUri => {
                if is_uri_char(c) {
                    ptr += 1;
                } else if is_spht(c) {
                    if let StartLine::Request(ref mut rl) = msg.start_line {
                        rl.u_len = ptr - rl.u;
                    }
                    ptr += 1;
                    state = MsgState::RqUriSp;
                } else if c >= 0x80 {
                    if !cfg.accept_invalid_request {
                        fail!();
                    }
                    if msg.err_pos.is_none() {
                        msg.err_pos = Some(ptr);
                    }
                    ptr += 1;
                } else if is_crlf(c) {
                    // HTTP/0.9 request line, no version
                    if let StartLine::Request(ref mut rl) = msg.start_line {
                        rl.u_len = ptr - rl.u;
                        rl.v = ptr;
                        rl.v_len = 0;
                        rl.len = ptr;
                    }
                    state = MsgState::RqLineEnd;
                    if c == b'\r' {
                        ptr += 1;
                    }
                } else {
                    fail!();
                }
            }
            MsgState::RqUriSp => {
                if is_spht(c) {
                    ptr += 1;
                } else if is_crlf(c) {
                    if let StartLine::Request(ref mut rl) = msg.start_line {
                        rl.v = ptr;
                        rl.v_len = 0;
                        rl.len = ptr;
                    }
                    state = MsgState::RqLineEnd;
                    if c == b'\r' {
                        ptr += 1;
                    }
                } else {
                    if let StartLine::Request(ref mut rl) = msg.start_line {
                        rl.v = ptr;
                    }
                    state = MsgState::RqVer;
                }
            }
            MsgState::RqVer => {
                if is_version_char(c) {
                    ptr += 1;
                } else if is_crlf(c) {
                    if let StartLine::Request(ref mut rl) = msg.start_line {
                        rl.v_len = ptr - rl.v;
                        rl.len = ptr;
                    }
                    state = MsgState::RqLineEnd;
                    if c == b'\r' {
                        ptr += 1;
                    }
                } else {
                    fail!();
                }
            }
            MsgState::RqLineEnd | MsgState::RpLineEnd => {
                // only a LF is allowed here
                if c != b'\n' {
                    fail!();
                }
                ptr += 1;
                let line_len = match &msg.start_line {
                    StartLine::Request(rl) => rl.len,
                    StartLine::Status(sl) => sl.len,
                    StartLine::None => fail!(),
                };
                let has_cr = buf.input_byte(line_len) == b'\r';
                idx.start(line_len, has_cr);
                state = MsgState::HdrFirst;
            }

            // ---------------- status line ----------------
            MsgState::RpVer => {
                if is_version_char(c) {
                    ptr += 1;
                } else if is_spht(c) {
                    msg.start_line = StartLine::Status(StatusLineLayout {
                        v_len: ptr,
                        ..StatusLineLayout::default()
                    });
                    ptr += 1;
                    state = MsgState::RpVerSp;
                } else {
                    fail!();
                }
            }
            MsgState::RpVerSp => {
                if is_spht(c) {
                    ptr += 1;
                } else if !is_crlf(c) {
                    if let StartLine::Status(ref mut sl) = msg.start_line {
                        sl.c = ptr;
                    }
                    state = MsgState::RpCode;
                } else {
                    // empty status code is not a message
                    fail!();
                }
            }
            MsgState::RpCode => {
                if !is_spht(c) && !is_crlf(c) {
                    ptr += 1;
                } else {
                    let mut status = 0u16;
                    if let StartLine::Status(ref mut sl) = msg.start_line {
                        sl.c_len = ptr - sl.c;
                        for n in sl.c..ptr {
                            let d = buf.input_byte(n);
                            if d.is_ascii_digit() {
                                status = status.saturating_mul(10) + (d - b'0') as u16;
                            }
                        }
                        sl.status = status;
                    }
                    if is_spht(c) {
                        ptr += 1;
                        state = MsgState::RpCodeSp;
                    } else {
                        // CR/LF right after the code: empty reason
                        if let StartLine::Status(ref mut sl) = msg.start_line {
                            sl.r = ptr;
                            sl.r_len = 0;
                            sl.len = ptr;
                        }
                        state = MsgState::RpLineEnd;
                        if c == b'\r' {
                            ptr += 1;
                        }
                    }
                }
            }
            MsgState::RpCodeSp => {
                if is_spht(c) {
                    ptr += 1;
                } else if !is_crlf(c) {
                    if let StartLine::Status(ref mut sl) = msg.start_line {
                        sl.r = ptr;
                    }
                    state = MsgState::RpReason;
                } else {
                    if let StartLine::Status(ref mut sl) = msg.start_line {
                        sl.r = ptr;
                        sl.r_len = 0;
                        sl.len = ptr;
                    }
                    state = MsgState::RpLineEnd;
                    if c == b'\r' {
                        ptr += 1;
                    }
                }
            }
            MsgState::RpReason => {
                if !is_crlf(c) {
                    ptr += 1;
                } else {
                    if let StartLine::Status(ref mut sl) = msg.start_line {
                        sl.r_len = ptr - sl.r;
                        sl.len = ptr;
                    }
                    state = MsgState::RpLineEnd;
                    if c == b'\r' {
                        ptr += 1;
                    }
                }
            }

            // ---------------- header block ----------------
            MsgState::HdrFirst => {
                msg.sol = ptr;
                if !is_crlf(c) {
                    state = MsgState::HdrName;
                } else {
                    state = MsgState::LastLf;
                    if c == b'\r' {
                        ptr += 1;
                    }
                }
            }
            MsgState::HdrName => {
                if is_token_char(c) {
                    ptr += 1;
                } else if c == b':' {
                    ptr += 1;
                    state = MsgState::HdrL1Sp;
                } else {
                    // a LF inside a header name is fatal, as is any
                    // separator
                    fail!();
                }
            }
            MsgState::HdrL1Sp => {
                if is_spht(c) {
                    ptr += 1;
                } else {
                    msg.sov = ptr;
                    if !is_crlf(c) {
                        state = MsgState::HdrVal;
                    } else {
                        state = MsgState::HdrL1Lf;
                        if c == b'\r' {
                            ptr += 1;
                        }
                    }
                }
            }
            MsgState::HdrL1Lf => {
                if c != b'\n' {
                    fail!();
                }
                ptr += 1;
                state = MsgState::HdrL1Lws;
            }
            MsgState::HdrL1Lws => {
                if is_spht(c) {
                    // obsolete folding before any value: overwrite the
                    // CR/LF with spaces and keep looking for the value
                    while msg.sov < ptr {
                        let abs = buf.abs_of(msg.sov);
                        buf.set_byte(abs, b' ');
                        msg.sov += 1;
                    }
                    state = MsgState::HdrL1Sp;
                } else {
                    // empty value
                    msg.eol = msg.sov;
                    complete_header!(c);
                }
            }
            MsgState::HdrVal => {
                if !is_crlf(c) {
                    ptr += 1;
                } else {
                    msg.eol = ptr;
                    state = MsgState::HdrL2Lf;
                    if c == b'\r' {
                        ptr += 1;
                    }
                }
            }
            MsgState::HdrL2Lf => {
                if c != b'\n' {
                    fail!();
                }
                ptr += 1;
                state = MsgState::HdrL2Lws;
            }
            MsgState::HdrL2Lws => {
                if is_spht(c) {
                    // folded continuation: rewrite the line break to spaces
                    // so the value reads as a single line
                    while msg.eol < ptr {
                        let abs = buf.abs_of(msg.eol);
                        buf.set_byte(abs, b' ');
                        msg.eol += 1;
                    }
                    state = MsgState::HdrVal;
                } else {
                    complete_header!(c);
                }
            }
            MsgState::LastLf => {
                if c != b'\n' {
                    fail!();
                }
                // the empty line closes the header block
                msg.eoh = msg.sol;
                msg.eol = ptr + 1 - msg.sol;
                msg.sov = ptr + 1;
                msg.next = ptr + 1;
                msg.sol = 0;
                msg.state = MsgState::Body;
                return ParseStatus::Complete;
            }

            _ => {
                // Body and later states are not this function's business
                msg.state = state;
                msg.next = ptr;
                return ParseStatus::Complete;
            }
        }
    }
}

/// Rewrites an HTTP/0.9 request into HTTP/1.0 in place: appends a default
/// "/" target when missing and a version token before the line end, then
/// re-runs the parse so every recorded position is refreshed.
pub fn upgrade_v09_to_v10(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    cfg: &ParserConfig,
) -> bool {
    let rl = match msg.request_line() {
        Some(rl) if rl.v_len == 0 => *rl,
        _ => return false,
    };
    // RFC 1945 only allows GET without a version
    if Method::new(&slice_rel(buf, 0, rl.m_len)) != Method::Get {
        return false;
    }
    let mut line_end = buf.abs_of(rl.len);
    if rl.u_len == 0 {
        if buf.insert(line_end, b" /").is_err() {
            return false;
        }
        line_end = buf.add_ofs(line_end, 2);
    }
    if buf.insert(line_end, b" HTTP/1.0").is_err() {
        return false;
    }
    idx.reset();
    msg.reset(MsgState::RqBefore);
    matches!(parse_message(buf, msg, idx, cfg), ParseStatus::Complete)
}

/// Copies `len` bytes starting `rel` bytes past the input start.
pub fn slice_rel(buf: &Buffer, rel: usize, len: usize) -> Vec<u8> {
    (0..len).map(|n| buf.input_byte(rel + n)).collect()
}
