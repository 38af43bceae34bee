//! Per-transaction HTTP state machine.
//!
//! A [`Transaction`] couples one request message and one response message
//! over a shared header index, negotiates the connection mode between
//! frontend and backend options and the tokens both peers sent, rewrites
//! Connection headers accordingly, runs the cookie passes, forwards both
//! bodies, and resynchronizes the two directions until the transaction can
//! restart (keep-alive), close one side (server-close) or close both.

pub mod answers;
pub mod chunk;
pub mod cookies;
pub mod header;
pub mod parser;

use log::{debug, error, trace};
use rusty_ulid::Ulid;
use serde::{Deserialize, Serialize};

use crate::buffer::{Buffer, BufferError};
use crate::config::{BackendConfig, CookieMode, FrontendConfig};

use self::answers::AnswerStatus;
use self::chunk::ChunkStatus;
use self::cookies::{ClientCookieStatus, ServerCookieStatus};
use self::header::HeaderIndex;
use self::parser::{
    compare_no_case, parse_message, slice_rel, upgrade_v09_to_v10, HttpMsg, Method, MsgFlags,
    MsgState, ParseStatus, ParserConfig, Version,
};

/// Desired connection behavior once the transaction completes. The
/// declaration order is the selection precedence: when the frontend and the
/// backend disagree, the higher-ranked mode wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnMode {
    /// pass bytes both ways until either side closes
    Tunnel,
    KeepAlive,
    /// close the server connection after each transaction, keep the client
    ServerClose,
    /// announce `Connection: close` and let the transaction finish
    Close,
    /// actively close both directions once the response ends
    ForceClose,
}

impl ConnMode {
    pub fn closes_client(&self) -> bool {
        matches!(self, ConnMode::Close | ConnMode::ForceClose)
    }

    pub fn closes_server(&self) -> bool {
        matches!(
            self,
            ConnMode::ServerClose | ConnMode::Close | ConnMode::ForceClose
        )
    }
}

/// Transaction flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxFlags(pub u32);

impl TxFlags {
    /// the request's Connection header was parsed
    pub const CONN_PARSED: u32 = 0x0001;
    /// the client sent a `close` token
    pub const CONN_CLO: u32 = 0x0002;
    /// the client sent a `keep-alive` token
    pub const CONN_KAL: u32 = 0x0004;
    /// the client sent an `upgrade` token
    pub const CONN_UPG: u32 = 0x0008;
    /// talk `Proxy-Connection` instead of `Connection` to this client
    pub const USE_PX_CONN: u32 = 0x0010;
    /// the client sent `Expect: 100-continue`
    pub const EXPECT_100: u32 = 0x0020;
    /// the target server was imposed by persistence
    pub const DIRECT: u32 = 0x0040;
    /// a target server has been assigned
    pub const ASSIGNED: u32 = 0x0080;
    /// a `100 Continue` interim response has been emitted
    pub const SENT_100: u32 = 0x0100;

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

/// Who caused the transaction to fail, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrCause {
    #[default]
    None,
    ClientTimeout,
    ClientClosed,
    ServerTimeout,
    ServerClosed,
    /// denied or invalid per proxy rules, including parse errors
    ProxyCondition,
    Resource,
    Internal,
}

/// Which processing phase the transaction was in when it failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TxPhase {
    #[default]
    Request,
    Queue,
    Connect,
    Headers,
    Data,
    Tarpit,
}

/// Absolute tick deadlines carried by one channel. The scheduler owns the
/// clock; analysers only compare.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadlines {
    pub read: Option<u64>,
    pub write: Option<u64>,
    pub analyse: Option<u64>,
}

impl Deadlines {
    pub fn read_expired(&self, now: u64) -> bool {
        self.read.map(|t| now >= t).unwrap_or(false)
    }

    pub fn write_expired(&self, now: u64) -> bool {
        self.write.map(|t| now >= t).unwrap_or(false)
    }

    pub fn analyse_expired(&self, now: u64) -> bool {
        self.analyse.map(|t| now >= t).unwrap_or(false)
    }
}

/// Outcome of one analyser activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalyserStatus {
    /// analysis finished, move on to the next analyser
    Complete,
    /// come back once more bytes arrived
    NeedData,
    /// answer with this canned status and abort the transaction
    Error(AnswerStatus),
}

/// What the resync loop concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// still in flight
    Continue,
    /// the transaction completed
    End {
        close_backend: bool,
        close_client: bool,
    },
    /// both directions must be torn down immediately
    Abort,
}

#[derive(Debug, Clone, Copy, Default)]
struct ConnTokens {
    close: bool,
    keep_alive: bool,
    upgrade: bool,
}

pub struct Transaction {
    pub request_id: Ulid,
    pub req: HttpMsg,
    pub rsp: HttpMsg,
    pub hdr_idx: HeaderIndex,
    pub meth: Option<Method>,
    pub status: u16,
    pub flags: TxFlags,
    pub conn_mode: ConnMode,
    /// copy of the request target for logs and fetches
    pub uri: Option<String>,
    pub cli_cookie: Option<String>,
    pub srv_cookie: Option<String>,
    pub sess_id: Option<String>,
    pub cookie_status: ClientCookieStatus,
    pub set_cookie_status: ServerCookieStatus,
    pub cookie_first_date: i64,
    pub cookie_last_date: i64,
    /// id of the server imposed by persistence, when any
    pub target_server: Option<String>,
    pub err_cause: ErrCause,
    pub phase: TxPhase,
    pub req_deadlines: Deadlines,
    pub rsp_deadlines: Deadlines,
    pub keepalive_count: usize,
}

impl Default for Transaction {
    fn default() -> Transaction {
        Transaction::new()
    }
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction {
            request_id: Ulid::generate(),
            req: HttpMsg::request(),
            rsp: HttpMsg::response(),
            hdr_idx: HeaderIndex::with_capacity(101),
            meth: None,
            status: 0,
            flags: TxFlags::default(),
            conn_mode: ConnMode::KeepAlive,
            uri: None,
            cli_cookie: None,
            srv_cookie: None,
            sess_id: None,
            cookie_status: ClientCookieStatus::None,
            set_cookie_status: ServerCookieStatus::None,
            cookie_first_date: 0,
            cookie_last_date: 0,
            target_server: None,
            err_cause: ErrCause::None,
            phase: TxPhase::Request,
            req_deadlines: Deadlines::default(),
            rsp_deadlines: Deadlines::default(),
            keepalive_count: 0,
        }
    }

    /// Prepares the next transaction of a kept-alive connection. Short
    /// lived captures are freed here.
    pub fn reset(&mut self) {
        self.request_id = Ulid::generate();
        self.req.reset(MsgState::RqBefore);
        self.rsp.reset(MsgState::RpBefore);
        self.hdr_idx.reset();
        self.meth = None;
        self.status = 0;
        self.flags = TxFlags::default();
        self.conn_mode = ConnMode::KeepAlive;
        self.uri = None;
        self.cli_cookie = None;
        self.srv_cookie = None;
        self.sess_id = None;
        self.cookie_status = ClientCookieStatus::None;
        self.set_cookie_status = ServerCookieStatus::None;
        self.cookie_first_date = 0;
        self.cookie_last_date = 0;
        self.target_server = None;
        self.err_cause = ErrCause::None;
        self.phase = TxPhase::Request;
        self.keepalive_count += 1;
    }

    // ------------------------------------------------------------------
    // request side
    // ------------------------------------------------------------------

    /// Waits for complete request headers, then fixes the message up:
    /// HTTP/0.9 upgrade, transfer-length determination, connection-mode
    /// selection and Connection rewrite, and the cookie pass.
    pub fn process_request_headers(
        &mut self,
        buf: &mut Buffer,
        fe: &FrontendConfig,
        be: &BackendConfig,
        now: i64,
    ) -> AnalyserStatus {
        if self.req.state.headers_complete() {
            return AnalyserStatus::Complete;
        }
        let cfg = ParserConfig {
            accept_invalid_request: fe.accept_invalid_request,
        };
        match parse_message(buf, &mut self.req, &mut self.hdr_idx, &cfg) {
            ParseStatus::NeedData => {
                // refuse a message that can never fit with the rewrite
                // margin preserved
                if buf.available_input_space() == 0 {
                    self.request_error(buf);
                    return AnalyserStatus::Error(AnswerStatus::Answer400);
                }
                return AnalyserStatus::NeedData;
            }
            ParseStatus::Invalid => {
                self.request_error(buf);
                return AnalyserStatus::Error(AnswerStatus::Answer400);
            }
            ParseStatus::Complete => {}
        }

        // an HTTP/0.9 request is turned into HTTP/1.0 on the wire
        if self.req.request_line().map(|rl| rl.v_len) == Some(0)
            && !upgrade_v09_to_v10(buf, &mut self.req, &mut self.hdr_idx, &cfg)
        {
            self.request_error(buf);
            return AnalyserStatus::Error(AnswerStatus::Answer400);
        }

        let rl = match self.req.request_line() {
            Some(rl) => *rl,
            None => {
                self.request_error(buf);
                return AnalyserStatus::Error(AnswerStatus::Answer400);
            }
        };
        self.meth = Some(Method::new(&slice_rel(buf, 0, rl.m_len)));
        let uri = slice_rel(buf, rl.u, rl.u_len);
        if message_version(buf, rl.v, rl.v_len) == Version::V11 {
            self.req.flags.set(MsgFlags::VER_11);
        }
        // a proxied request (absolute target) may call for the
        // Proxy-Connection variant
        if fe.proxy_connection_header && !uri.is_empty() && uri[0] != b'/' && uri[0] != b'*' {
            self.flags.set(TxFlags::USE_PX_CONN);
        }
        self.uri = Some(String::from_utf8_lossy(&uri).into_owned());

        if !self.determine_transfer_length(buf, true) {
            self.request_error(buf);
            return AnalyserStatus::Error(AnswerStatus::Answer400);
        }
        self.scan_expect(buf);

        let tokens = self.scan_tokens(buf, true);
        self.flags.set(TxFlags::CONN_PARSED);
        if tokens.close {
            self.flags.set(TxFlags::CONN_CLO);
        }
        if tokens.keep_alive {
            self.flags.set(TxFlags::CONN_KAL);
        }
        if tokens.upgrade {
            self.flags.set(TxFlags::CONN_UPG);
        }
        self.select_connection_mode(fe, be, tokens);
        if let Err(e) = self.update_request_connection(buf) {
            debug!("{} connection rewrite failed: {e}", self.request_id);
            self.request_error(buf);
            return AnalyserStatus::Error(AnswerStatus::Answer400);
        }

        let outcome = cookies::manage_request_cookies(
            buf,
            &mut self.req,
            &mut self.hdr_idx,
            &be.cookie,
            &fe.capture,
            &be.servers,
            now,
        );
        self.cookie_status = outcome.status;
        self.cookie_first_date = outcome.first_date;
        self.cookie_last_date = outcome.last_date;
        if outcome.captured.is_some() {
            self.cli_cookie = outcome.captured;
        }
        if let Some(server_id) = outcome.server_id {
            self.target_server = Some(server_id);
            self.flags.set(TxFlags::DIRECT);
            self.flags.set(TxFlags::ASSIGNED);
        }
        AnalyserStatus::Complete
    }

    /// Emits the interim `100 Continue` into the client-bound buffer, once.
    pub fn emit_100_continue(&mut self, rsp_buf: &mut Buffer) {
        if self.flags.has(TxFlags::EXPECT_100) && !self.flags.has(TxFlags::SENT_100) {
            write_answer(rsp_buf, b"HTTP/1.1 100 Continue\r\n\r\n");
            self.flags.set(TxFlags::SENT_100);
        }
    }

    // ------------------------------------------------------------------
    // response side
    // ------------------------------------------------------------------

    /// Waits for complete response headers, forwarding interim 100
    /// responses, then finalizes the connection mode, rewrites the
    /// Connection header, and runs the response cookie pass.
    pub fn process_response_headers(
        &mut self,
        buf: &mut Buffer,
        fe: &FrontendConfig,
        be: &BackendConfig,
        now: i64,
    ) -> AnalyserStatus {
        loop {
            if self.rsp.state.headers_complete() {
                return AnalyserStatus::Complete;
            }
            if self.rsp.state == MsgState::RpBefore && self.rsp.next == 0 {
                // the index is shared with the request and rebuilt for the
                // response
                self.hdr_idx.reset();
            }
            match parse_message(
                buf,
                &mut self.rsp,
                &mut self.hdr_idx,
                &ParserConfig::default(),
            ) {
                ParseStatus::NeedData => {
                    if buf.available_input_space() == 0 {
                        self.response_error(buf);
                        return AnalyserStatus::Error(AnswerStatus::Answer502);
                    }
                    return AnalyserStatus::NeedData;
                }
                ParseStatus::Invalid => {
                    self.response_error(buf);
                    return AnalyserStatus::Error(AnswerStatus::Answer502);
                }
                ParseStatus::Complete => {}
            }

            let sl = match self.rsp.status_line() {
                Some(sl) => *sl,
                None => {
                    self.response_error(buf);
                    return AnalyserStatus::Error(AnswerStatus::Answer502);
                }
            };
            if sl.status == 100 {
                // interim response: forward it and wait for the real one
                trace!("{} forwarding interim 100", self.request_id);
                forward_headers(buf, &mut self.rsp);
                self.rsp.reset(MsgState::RpBefore);
                self.hdr_idx.reset();
                continue;
            }
            self.status = sl.status;
            if message_version(buf, 0, sl.v_len) == Version::V11 {
                self.rsp.flags.set(MsgFlags::VER_11);
            }

            if !self.determine_transfer_length(buf, false) {
                self.response_error(buf);
                return AnalyserStatus::Error(AnswerStatus::Answer502);
            }

            // server-forced close downgrades keep-alive to server-close
            let tokens = self.scan_tokens(buf, false);
            if self.conn_mode == ConnMode::KeepAlive {
                let server_closes = tokens.close
                    || (!self.rsp.flags.has(MsgFlags::VER_11) && !tokens.keep_alive)
                    || !self.rsp.flags.has(MsgFlags::XFER_LEN);
                if server_closes {
                    self.conn_mode = ConnMode::ServerClose;
                }
            }
            if !tokens.upgrade {
                if let Err(e) = self.update_response_connection(buf) {
                    debug!("{} response connection rewrite failed: {e}", self.request_id);
                }
            }

            let server = self
                .target_server
                .as_deref()
                .and_then(|id| be.servers.iter().find(|s| s.id == id));
            let mut outcome = cookies::ResponseCookieOutcome::default();
            cookies::manage_response_cookies(
                buf,
                &mut self.rsp,
                &mut self.hdr_idx,
                &be.cookie,
                &fe.capture,
                server,
                &mut outcome,
            );
            self.set_cookie_status = outcome.status;
            if outcome.captured.is_some() {
                self.srv_cookie = outcome.captured;
            }
            if outcome.session_id.is_some() {
                self.sess_id = outcome.session_id;
            }

            // insert our own persistence cookie where configured
            if be.cookie.mode == CookieMode::Insert {
                if let Some(ck) = server.and_then(|s| s.cookie.as_deref()) {
                    if let Some(line) = cookies::build_persistence_cookie(
                        &be.cookie,
                        ck,
                        now,
                        self.cookie_first_date,
                    ) {
                        if add_header(buf, &mut self.rsp, &mut self.hdr_idx, line.as_bytes())
                            .is_ok()
                        {
                            self.set_cookie_status = ServerCookieStatus::Replaced;
                        }
                    }
                }
            }

            // an accepted upgrade turns the transaction into a tunnel
            if self.flags.has(TxFlags::CONN_UPG) && sl.status == 101 {
                self.req.state = MsgState::Tunnel;
                self.rsp.state = MsgState::Tunnel;
            }
            return AnalyserStatus::Complete;
        }
    }

    // ------------------------------------------------------------------
    // connection mode
    // ------------------------------------------------------------------

    /// First post-headers selection: frontend and backend each vote, the
    /// precedence order picks, then protocol constraints may downgrade a
    /// keep-alive wish to a close.
    fn select_connection_mode(
        &mut self,
        fe: &FrontendConfig,
        be: &BackendConfig,
        tokens: ConnTokens,
    ) {
        let mut wanted = fe.mode.max(be.mode);
        if wanted == ConnMode::KeepAlive {
            let downgrade = tokens.close
                || (!self.req.flags.has(MsgFlags::VER_11) && !tokens.keep_alive)
                || !self.req.flags.has(MsgFlags::XFER_LEN)
                || fe.stopping;
            if downgrade {
                wanted = ConnMode::Close;
            }
        }
        self.conn_mode = wanted;
        trace!("{} connection mode {:?}", self.request_id, wanted);
    }

    fn connection_header_name(&self) -> &'static [u8] {
        if self.flags.has(TxFlags::USE_PX_CONN) {
            b"Proxy-Connection"
        } else {
            b"Connection"
        }
    }

    /// Read-only scan of the Connection token list of one message.
    fn scan_tokens(&self, buf: &Buffer, request: bool) -> ConnTokens {
        let mut tokens = ConnTokens::default();
        let mut names: Vec<&[u8]> = vec![b"Connection"];
        if request && self.flags.has(TxFlags::USE_PX_CONN) {
            names.push(b"Proxy-Connection");
        }
        for name in names {
            let mut ctx = self.hdr_idx.fresh_ctx();
            while self.hdr_idx.find(buf, buf.input_begin(), name, &mut ctx) {
                let value = ctx_value(buf, &ctx);
                if compare_no_case(&value, b"close") {
                    tokens.close = true;
                } else if compare_no_case(&value, b"keep-alive") {
                    tokens.keep_alive = true;
                } else if compare_no_case(&value, b"upgrade") {
                    tokens.upgrade = true;
                }
            }
        }
        tokens
    }

    /// Rewrites the request's Connection tokens to reflect the mode the
    /// proxy wants with the server.
    fn update_request_connection(&mut self, buf: &mut Buffer) -> Result<(), BufferError> {
        if self.conn_mode == ConnMode::Tunnel || self.flags.has(TxFlags::CONN_UPG) {
            return Ok(());
        }
        // toward the server, anything but keep-alive means close
        let want_close = self.conn_mode != ConnMode::KeepAlive;
        let name = self.connection_header_name();
        let (seen_close, seen_kal) =
            strip_connection_tokens(buf, &mut self.req, &mut self.hdr_idx, name, want_close);
        let ver_11 = self.req.flags.has(MsgFlags::VER_11);
        if want_close && ver_11 && !seen_close {
            let line = format!(
                "{}: close\r\n",
                String::from_utf8_lossy(self.connection_header_name())
            );
            add_header(buf, &mut self.req, &mut self.hdr_idx, line.as_bytes())?;
        } else if !want_close && !ver_11 && !seen_kal {
            let line = format!(
                "{}: keep-alive\r\n",
                String::from_utf8_lossy(self.connection_header_name())
            );
            add_header(buf, &mut self.req, &mut self.hdr_idx, line.as_bytes())?;
        }
        Ok(())
    }

    /// Rewrites the response's Connection tokens to reflect the mode kept
    /// with the client.
    fn update_response_connection(&mut self, buf: &mut Buffer) -> Result<(), BufferError> {
        if self.conn_mode == ConnMode::Tunnel {
            return Ok(());
        }
        // server-close still keeps the client connection alive
        let want_close = self.conn_mode.closes_client();
        let (seen_close, seen_kal) = strip_connection_tokens(
            buf,
            &mut self.rsp,
            &mut self.hdr_idx,
            b"Connection",
            want_close,
        );
        let ver_11 = self.rsp.flags.has(MsgFlags::VER_11);
        if want_close && ver_11 && !seen_close {
            add_header(buf, &mut self.rsp, &mut self.hdr_idx, b"Connection: close\r\n")?;
        } else if !want_close && !ver_11 && !seen_kal {
            add_header(
                buf,
                &mut self.rsp,
                &mut self.hdr_idx,
                b"Connection: keep-alive\r\n",
            )?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // message metadata
    // ------------------------------------------------------------------

    /// Transfer-length determination per the framing priority: chunked
    /// Transfer-Encoding, then Content-Length, then (responses only)
    /// close-delimited. Returns false on conflicting lengths.
    fn determine_transfer_length(&mut self, buf: &Buffer, request: bool) -> bool {
        if !request {
            // bodyless responses have a known zero length whatever the
            // headers pretend
            let status = self.rsp.status().unwrap_or(0);
            let head = matches!(self.meth, Some(Method::Head));
            if head || status / 100 == 1 || status == 204 || status == 304 {
                self.rsp.body_len = 0;
                self.rsp.flags.set(MsgFlags::XFER_LEN);
                return true;
            }
        }
        let msg = if request { &mut self.req } else { &mut self.rsp };
        let idx = &self.hdr_idx;
        let p = buf.input_begin();

        let mut ctx = idx.fresh_ctx();
        while idx.find(buf, p, b"Transfer-Encoding", &mut ctx) {
            let value = ctx_value(buf, &ctx);
            if compare_no_case(&value, b"chunked") {
                msg.flags.set(MsgFlags::TE_CHNK);
                msg.flags.set(MsgFlags::XFER_LEN);
            }
        }
        if msg.flags.has(MsgFlags::TE_CHNK) {
            return true;
        }

        let mut length: Option<u64> = None;
        let mut ctx = idx.fresh_ctx();
        while idx.find(buf, p, b"Content-Length", &mut ctx) {
            let value = ctx_value(buf, &ctx);
            let parsed = match std::str::from_utf8(&value).ok().and_then(|s| s.parse().ok()) {
                Some(v) => v,
                None => return false,
            };
            match length {
                // duplicate lengths are allowed only when they agree
                Some(known) if known != parsed => return false,
                _ => length = Some(parsed),
            }
        }

        if let Some(len) = length {
            msg.body_len = len;
            msg.flags.set(MsgFlags::CNT_LEN);
            msg.flags.set(MsgFlags::XFER_LEN);
            return true;
        }

        if request {
            // a request without TE nor Content-Length has no body
            msg.body_len = 0;
            msg.flags.set(MsgFlags::XFER_LEN);
        }
        // a response without either is delimited by the connection closing
        true
    }

    fn scan_expect(&mut self, buf: &Buffer) {
        if !self.req.flags.has(MsgFlags::VER_11) {
            return;
        }
        let has_body =
            self.req.flags.has(MsgFlags::TE_CHNK) || self.req.body_len > 0;
        if !has_body {
            return;
        }
        let mut ctx = self.hdr_idx.fresh_ctx();
        while self
            .hdr_idx
            .find(buf, buf.input_begin(), b"Expect", &mut ctx)
        {
            if compare_no_case(&ctx_value(buf, &ctx), b"100-continue") {
                self.flags.set(TxFlags::EXPECT_100);
            }
        }
    }

    // ------------------------------------------------------------------
    // resynchronization
    // ------------------------------------------------------------------

    /// Converges the two message states after any progress on either side.
    pub fn resync(&mut self, req_buf: &Buffer, rsp_buf: &Buffer) -> ResyncOutcome {
        loop {
            let before = (self.req.state, self.rsp.state);

            // a tunnel on either side drags the other in
            if self.req.state == MsgState::Tunnel || self.rsp.state == MsgState::Tunnel {
                self.req.state = MsgState::Tunnel;
                self.rsp.state = MsgState::Tunnel;
                return ResyncOutcome::Continue;
            }

            if self.rsp.is_error() || self.req.is_error() {
                return ResyncOutcome::Abort;
            }

            if self.req.state == MsgState::Done && self.rsp.state == MsgState::Done {
                match self.conn_mode {
                    ConnMode::KeepAlive | ConnMode::Tunnel => {
                        return ResyncOutcome::End {
                            close_backend: false,
                            close_client: false,
                        }
                    }
                    ConnMode::ServerClose => {
                        // shut our writes to the server first
                        self.req.state = MsgState::Closing;
                    }
                    ConnMode::Close | ConnMode::ForceClose => {
                        self.req.state = MsgState::Closing;
                        self.rsp.state = MsgState::Closing;
                    }
                }
            }

            if self.req.state == MsgState::Closing && req_buf.output_len() == 0 {
                self.req.state = MsgState::Closed;
            }
            if self.rsp.state == MsgState::Closing && rsp_buf.output_len() == 0 {
                self.rsp.state = MsgState::Closed;
            }

            if self.req.state == MsgState::Closed {
                if self.rsp.state == MsgState::Done && self.conn_mode == ConnMode::ServerClose {
                    return ResyncOutcome::End {
                        close_backend: true,
                        close_client: false,
                    };
                }
                if self.rsp.state == MsgState::Closed {
                    return ResyncOutcome::End {
                        close_backend: true,
                        close_client: true,
                    };
                }
            }

            if (self.req.state, self.rsp.state) == before {
                return ResyncOutcome::Continue;
            }
        }
    }

    /// Records a deadline hit observed by the scheduler and picks the
    /// matching canned answer: 408 while waiting for the client's headers,
    /// 504 while waiting for the server's.
    pub fn handle_timeout(&mut self, request_side: bool) -> AnswerStatus {
        if request_side {
            self.err_cause = ErrCause::ClientTimeout;
            self.phase = TxPhase::Request;
            AnswerStatus::Answer408
        } else {
            self.err_cause = ErrCause::ServerTimeout;
            self.phase = TxPhase::Headers;
            AnswerStatus::Answer504
        }
    }

    /// The tarpit analyser holds the connection until the analysis
    /// deadline, then answers 500.
    pub fn tarpit_expired(&self, now: u64) -> bool {
        self.req_deadlines.analyse_expired(now)
    }

    /// The server closed its side: a close-delimited response body is now
    /// complete.
    pub fn notify_server_close(&mut self) {
        if !self.rsp.flags.has(MsgFlags::XFER_LEN)
            && matches!(self.rsp.state, MsgState::Body | MsgState::Data)
        {
            self.rsp.state = MsgState::Done;
        }
    }

    fn request_error(&mut self, buf: &Buffer) {
        self.err_cause = ErrCause::ProxyCondition;
        self.phase = TxPhase::Request;
        capture_error(buf, &self.req, self.request_id);
    }

    fn response_error(&mut self, buf: &Buffer) {
        self.err_cause = ErrCause::ProxyCondition;
        self.phase = TxPhase::Headers;
        capture_error(buf, &self.rsp, self.request_id);
    }
}

// ----------------------------------------------------------------------
// free helpers shared by both directions
// ----------------------------------------------------------------------

/// Extracts the current header value designated by a context.
fn ctx_value(buf: &Buffer, ctx: &header::HdrCtx) -> Vec<u8> {
    let base = ctx.sol + ctx.val;
    (0..ctx.vlen).map(|n| buf.input_byte(base + n)).collect()
}

fn message_version(buf: &Buffer, v: usize, v_len: usize) -> Version {
    if v_len >= 8 && compare_no_case(&slice_rel(buf, v, 8), b"HTTP/1.1") {
        Version::V11
    } else {
        Version::V10
    }
}

/// Removes `close` or `keep-alive` tokens that contradict the wanted mode,
/// and reports which tokens remain.
fn strip_connection_tokens(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    name: &[u8],
    want_close: bool,
) -> (bool, bool) {
    let mut seen_close = false;
    let mut seen_kal = false;
    let p = buf.input_begin();
    let mut ctx = idx.fresh_ctx();
    loop {
        let found = idx.find(buf, p, name, &mut ctx);
        if !found {
            break;
        }
        let value = ctx_value(buf, &ctx);
        if compare_no_case(&value, b"close") {
            if !want_close {
                let delta = idx.remove(buf, p, &mut ctx);
                msg.move_end(delta);
            } else {
                seen_close = true;
            }
        } else if compare_no_case(&value, b"keep-alive") {
            if want_close {
                let delta = idx.remove(buf, p, &mut ctx);
                msg.move_end(delta);
            } else {
                seen_kal = true;
            }
        }
    }
    (seen_close, seen_kal)
}

/// Appends a header line (CRLF included) at the end of the header block.
pub fn add_header(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    line: &[u8],
) -> Result<(), BufferError> {
    debug_assert!(line.ends_with(b"\r\n"));
    let at = buf.abs_of(msg.eoh);
    let delta = buf.insert(at, line)?;
    if idx.add(line.len() - 2, true, idx.tail()).is_err() {
        buf.delete(at, buf.add_ofs(at, line.len()));
        return Err(BufferError::NoRoom);
    }
    msg.move_end(delta);
    Ok(())
}

/// Commits the parsed head as output and rebases the message offsets onto
/// the body.
pub fn forward_headers(buf: &mut Buffer, msg: &mut HttpMsg) {
    let head = msg.sov;
    buf.advance(head);
    msg.next -= head;
    msg.sov = 0;
    msg.sol = 0;
}

/// Schedules and commits body bytes according to the message's framing.
/// Returns `Advanced` once the body is fully forwarded (state `Done` or
/// beyond), `NeedData` when input ran dry, `Invalid` on framing errors.
pub fn forward_body(buf: &mut Buffer, msg: &mut HttpMsg) -> ChunkStatus {
    loop {
        match msg.state {
            MsgState::Body => {
                if msg.flags.has(MsgFlags::TE_CHNK) {
                    msg.state = MsgState::ChunkSize;
                } else if msg.flags.has(MsgFlags::XFER_LEN) {
                    if msg.body_len == 0 {
                        msg.state = MsgState::Done;
                        continue;
                    }
                    msg.chunk_len = msg.body_len;
                    msg.state = MsgState::Data;
                } else {
                    // close-delimited: forward everything until shutdown
                    msg.chunk_len = u64::MAX;
                    msg.state = MsgState::Data;
                }
            }
            MsgState::Data => {
                let avail = buf.input_len() - msg.next;
                let take = (msg.chunk_len.min(avail as u64)) as usize;
                msg.next += take;
                msg.chunk_len -= take as u64;
                flush_scheduled(buf, msg);
                if msg.chunk_len == 0 {
                    msg.state = if msg.flags.has(MsgFlags::TE_CHNK) {
                        MsgState::ChunkCrlf
                    } else {
                        MsgState::Done
                    };
                    continue;
                }
                return ChunkStatus::NeedData;
            }
            MsgState::ChunkSize => match chunk::parse_chunk_size(buf, msg) {
                ChunkStatus::Advanced => flush_scheduled(buf, msg),
                other => return other,
            },
            MsgState::ChunkCrlf => match chunk::skip_chunk_crlf(buf, msg) {
                ChunkStatus::Advanced => flush_scheduled(buf, msg),
                other => return other,
            },
            MsgState::Trailers => match chunk::forward_trailers(buf, msg) {
                ChunkStatus::Advanced => flush_scheduled(buf, msg),
                other => {
                    // complete trailer lines are forwarded eagerly
                    flush_scheduled(buf, msg);
                    return other;
                }
            },
            MsgState::Done | MsgState::Closing | MsgState::Closed | MsgState::Tunnel => {
                return ChunkStatus::Advanced
            }
            MsgState::Error => return ChunkStatus::Invalid,
            _ => return ChunkStatus::NeedData,
        }
    }
}

/// Tunnel mode: pass everything through unconditionally.
pub fn forward_tunnel(buf: &mut Buffer, msg: &mut HttpMsg) {
    msg.next = 0;
    let n = buf.input_len();
    buf.advance(n);
}

fn flush_scheduled(buf: &mut Buffer, msg: &mut HttpMsg) {
    if msg.next > 0 {
        let n = msg.next;
        buf.advance(n);
        msg.next = 0;
    }
}

/// Writes a generated answer straight into the output side of a buffer.
pub fn write_answer(buf: &mut Buffer, answer: &[u8]) {
    let n = buf.write_unchecked(answer);
    debug_assert!(n == answer.len(), "generated answer did not fit");
    buf.advance(n);
}

/// Snapshots the bytes around a parse error for diagnostics.
fn capture_error(buf: &Buffer, msg: &HttpMsg, id: Ulid) {
    let input = buf.linearize_input();
    let pos = msg.err_pos.unwrap_or(0).min(input.len());
    let from = pos.saturating_sub(32);
    let to = (pos + 32).min(input.len());
    error!(
        "{} parse error in {:?} at {}: {:?}",
        id,
        msg.err_state.unwrap_or(msg.state),
        pos,
        String::from_utf8_lossy(&input[from..to]),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerRef;

    fn buffer_with(raw: &[u8]) -> Buffer {
        let mut buf = Buffer::with_capacity_and_margin(2048, 256);
        assert_eq!(buf.write(raw), raw.len());
        buf
    }

    fn fe_mode(mode: ConnMode) -> FrontendConfig {
        FrontendConfig {
            mode,
            ..FrontendConfig::default()
        }
    }

    fn be_mode(mode: ConnMode) -> BackendConfig {
        BackendConfig {
            mode,
            ..BackendConfig::default()
        }
    }

    fn run_request(raw: &[u8], fe: &FrontendConfig, be: &BackendConfig) -> (Buffer, Transaction) {
        let mut buf = buffer_with(raw);
        let mut txn = Transaction::new();
        let status = txn.process_request_headers(&mut buf, fe, be, 1_000_000);
        assert_eq!(status, AnalyserStatus::Complete);
        (buf, txn)
    }

    #[test]
    fn http10_without_keepalive_selects_close() {
        // scenario: HTTP/1.0 request, frontend keep-alive off
        let fe = fe_mode(ConnMode::Close);
        let be = be_mode(ConnMode::KeepAlive);
        let (_, txn) = run_request(b"GET / HTTP/1.0\r\n\r\n", &fe, &be);
        assert_eq!(txn.conn_mode, ConnMode::Close);
    }

    #[test]
    fn connection_mode_truth_table() {
        // mode = max(fe, be), then downgrade-to-close rules for keep-alive
        let cases: &[(&[u8], ConnMode, ConnMode, ConnMode)] = &[
            // HTTP/1.1, no token: combined wish holds
            (b"GET / HTTP/1.1\r\n\r\n", ConnMode::KeepAlive, ConnMode::KeepAlive, ConnMode::KeepAlive),
            (b"GET / HTTP/1.1\r\n\r\n", ConnMode::KeepAlive, ConnMode::ServerClose, ConnMode::ServerClose),
            (b"GET / HTTP/1.1\r\n\r\n", ConnMode::ServerClose, ConnMode::KeepAlive, ConnMode::ServerClose),
            (b"GET / HTTP/1.1\r\n\r\n", ConnMode::ForceClose, ConnMode::KeepAlive, ConnMode::ForceClose),
            (b"GET / HTTP/1.1\r\n\r\n", ConnMode::Tunnel, ConnMode::KeepAlive, ConnMode::KeepAlive),
            (b"GET / HTTP/1.1\r\n\r\n", ConnMode::Tunnel, ConnMode::Tunnel, ConnMode::Tunnel),
            // client close token downgrades keep-alive
            (b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n", ConnMode::KeepAlive, ConnMode::KeepAlive, ConnMode::Close),
            // HTTP/1.0 without keep-alive downgrades
            (b"GET / HTTP/1.0\r\n\r\n", ConnMode::KeepAlive, ConnMode::KeepAlive, ConnMode::Close),
            // HTTP/1.0 with keep-alive holds
            (b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n", ConnMode::KeepAlive, ConnMode::KeepAlive, ConnMode::KeepAlive),
            // stronger modes are not downgraded by tokens
            (b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n", ConnMode::ServerClose, ConnMode::KeepAlive, ConnMode::ServerClose),
        ];
        for (raw, fe, be, expected) in cases {
            let (_, txn) = run_request(raw, &fe_mode(*fe), &be_mode(*be));
            assert_eq!(txn.conn_mode, *expected, "case {:?}", String::from_utf8_lossy(raw));
        }
    }

    #[test]
    fn stopping_frontend_downgrades_to_close() {
        let fe = FrontendConfig {
            stopping: true,
            ..FrontendConfig::default()
        };
        let (_, txn) = run_request(b"GET / HTTP/1.1\r\n\r\n", &fe, &BackendConfig::default());
        assert_eq!(txn.conn_mode, ConnMode::Close);
    }

    #[test]
    fn request_close_rewrite_adds_token() {
        let fe = fe_mode(ConnMode::ServerClose);
        let (buf, _) = run_request(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n", &fe, &BackendConfig::default());
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Connection: close\r\n"), "{text}");
    }

    #[test]
    fn keepalive_rewrite_strips_close_token() {
        // 1.1 keep-alive wanted: a stray keep-alive token is left alone,
        // close tokens are dropped by the request rewrite only when mode
        // stays keep-alive, which a close token prevents; use a 1.0
        // keep-alive case instead
        let fe = fe_mode(ConnMode::KeepAlive);
        let (buf, txn) = run_request(
            b"GET / HTTP/1.0\r\nConnection: keep-alive\r\n\r\n",
            &fe,
            &BackendConfig::default(),
        );
        assert_eq!(txn.conn_mode, ConnMode::KeepAlive);
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        // the keep-alive token survives for the 1.0 server
        assert!(text.contains("Connection: keep-alive\r\n"), "{text}");
    }

    #[test]
    fn transfer_length_prefers_chunked() {
        let (_, txn) = run_request(
            b"POST / HTTP/1.1\r\nContent-Length: 10\r\nTransfer-Encoding: chunked\r\n\r\n",
            &FrontendConfig::default(),
            &BackendConfig::default(),
        );
        assert!(txn.req.flags.has(MsgFlags::TE_CHNK));
        assert!(txn.req.flags.has(MsgFlags::XFER_LEN));
    }

    #[test]
    fn conflicting_content_lengths_rejected() {
        let mut buf = buffer_with(b"POST / HTTP/1.1\r\nContent-Length: 10\r\nContent-Length: 11\r\n\r\n");
        let mut txn = Transaction::new();
        let status = txn.process_request_headers(
            &mut buf,
            &FrontendConfig::default(),
            &BackendConfig::default(),
            0,
        );
        assert_eq!(status, AnalyserStatus::Error(AnswerStatus::Answer400));
    }

    #[test]
    fn expect_100_flag_and_interim_answer() {
        let (_, mut txn) = run_request(
            b"POST /admin HTTP/1.1\r\nHost: x\r\nExpect: 100-continue\r\nContent-Length: 3\r\n\r\n",
            &FrontendConfig::default(),
            &BackendConfig::default(),
        );
        assert!(txn.flags.has(TxFlags::EXPECT_100));
        let mut rsp_buf = Buffer::with_capacity_and_margin(256, 0);
        txn.emit_100_continue(&mut rsp_buf);
        assert_eq!(rsp_buf.output_slice(), b"HTTP/1.1 100 Continue\r\n\r\n");
        // only once
        txn.emit_100_continue(&mut rsp_buf);
        assert_eq!(rsp_buf.output_len(), b"HTTP/1.1 100 Continue\r\n\r\n".len());
    }

    #[test]
    fn full_transaction_keepalive_roundtrip() {
        let fe = FrontendConfig::default();
        let be = BackendConfig::default();
        let mut req_buf = buffer_with(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut txn = Transaction::new();
        assert_eq!(
            txn.process_request_headers(&mut req_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        assert_eq!(txn.conn_mode, ConnMode::KeepAlive);
        forward_headers(&mut req_buf, &mut txn.req);
        assert_eq!(forward_body(&mut req_buf, &mut txn.req), ChunkStatus::Advanced);
        assert_eq!(txn.req.state, MsgState::Done);

        let mut rsp_buf = buffer_with(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(
            txn.process_response_headers(&mut rsp_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        forward_headers(&mut rsp_buf, &mut txn.rsp);
        assert_eq!(forward_body(&mut rsp_buf, &mut txn.rsp), ChunkStatus::Advanced);
        assert_eq!(txn.rsp.state, MsgState::Done);

        // pretend all output was written out
        let n = req_buf.output_len();
        req_buf.consume_output(n);
        let n = rsp_buf.output_len();
        rsp_buf.consume_output(n);

        assert_eq!(
            txn.resync(&req_buf, &rsp_buf),
            ResyncOutcome::End {
                close_backend: false,
                close_client: false
            }
        );
        txn.reset();
        assert_eq!(txn.keepalive_count, 1);
        assert_eq!(txn.req.state, MsgState::RqBefore);
    }

    #[test]
    fn server_close_sequencing() {
        let fe = fe_mode(ConnMode::ServerClose);
        let be = BackendConfig::default();
        let mut req_buf = buffer_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut txn = Transaction::new();
        assert_eq!(
            txn.process_request_headers(&mut req_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        forward_headers(&mut req_buf, &mut txn.req);
        forward_body(&mut req_buf, &mut txn.req);

        let mut rsp_buf = buffer_with(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(
            txn.process_response_headers(&mut rsp_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        forward_headers(&mut rsp_buf, &mut txn.rsp);
        forward_body(&mut rsp_buf, &mut txn.rsp);

        // output still pending on the request side: we only get to Closing
        assert_eq!(txn.resync(&req_buf, &rsp_buf), ResyncOutcome::Continue);
        assert_eq!(txn.req.state, MsgState::Closing);

        let n = req_buf.output_len();
        req_buf.consume_output(n);
        assert_eq!(
            txn.resync(&req_buf, &rsp_buf),
            ResyncOutcome::End {
                close_backend: true,
                close_client: false
            }
        );
    }

    #[test]
    fn response_error_aborts() {
        let mut txn = Transaction::new();
        txn.req.state = MsgState::Done;
        txn.rsp.state = MsgState::Error;
        let req_buf = Buffer::with_capacity(256);
        let rsp_buf = Buffer::with_capacity(256);
        assert_eq!(txn.resync(&req_buf, &rsp_buf), ResyncOutcome::Abort);
    }

    #[test]
    fn tunnel_propagates_to_both_sides() {
        let mut txn = Transaction::new();
        txn.req.state = MsgState::Tunnel;
        txn.rsp.state = MsgState::Body;
        let req_buf = Buffer::with_capacity(256);
        let rsp_buf = Buffer::with_capacity(256);
        assert_eq!(txn.resync(&req_buf, &rsp_buf), ResyncOutcome::Continue);
        assert_eq!(txn.rsp.state, MsgState::Tunnel);
    }

    #[test]
    fn upgrade_101_enters_tunnel() {
        let fe = FrontendConfig::default();
        let be = BackendConfig::default();
        let mut req_buf = buffer_with(
            b"GET /ws HTTP/1.1\r\nHost: x\r\nConnection: upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        let mut txn = Transaction::new();
        assert_eq!(
            txn.process_request_headers(&mut req_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        assert!(txn.flags.has(TxFlags::CONN_UPG));

        let mut rsp_buf = buffer_with(
            b"HTTP/1.1 101 Switching Protocols\r\nConnection: upgrade\r\nUpgrade: websocket\r\n\r\n",
        );
        assert_eq!(
            txn.process_response_headers(&mut rsp_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        assert_eq!(txn.req.state, MsgState::Tunnel);
        assert_eq!(txn.rsp.state, MsgState::Tunnel);
    }

    #[test]
    fn close_delimited_response_ends_on_server_close() {
        let fe = FrontendConfig::default();
        let be = BackendConfig::default();
        let mut req_buf = buffer_with(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut txn = Transaction::new();
        txn.process_request_headers(&mut req_buf, &fe, &be, 0);

        let mut rsp_buf = buffer_with(b"HTTP/1.1 200 OK\r\n\r\nstream data");
        assert_eq!(
            txn.process_response_headers(&mut rsp_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        // no length information: server-close mode, close-delimited body
        assert_eq!(txn.conn_mode, ConnMode::ServerClose);
        assert!(!txn.rsp.flags.has(MsgFlags::XFER_LEN));
        forward_headers(&mut rsp_buf, &mut txn.rsp);
        assert_eq!(forward_body(&mut rsp_buf, &mut txn.rsp), ChunkStatus::NeedData);
        txn.notify_server_close();
        assert_eq!(txn.rsp.state, MsgState::Done);
    }

    #[test]
    fn chunked_request_forwarding() {
        let fe = FrontendConfig::default();
        let be = BackendConfig::default();
        let raw = b"POST /a HTTP/1.1\r\nHost: x\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";
        let mut buf = buffer_with(raw);
        let mut txn = Transaction::new();
        assert_eq!(
            txn.process_request_headers(&mut buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        forward_headers(&mut buf, &mut txn.req);
        assert_eq!(forward_body(&mut buf, &mut txn.req), ChunkStatus::Advanced);
        assert_eq!(txn.req.state, MsgState::Done);
        assert_eq!(buf.input_len(), 0);
        // everything went to the output side untouched
        assert_eq!(buf.output_len(), raw.len());
    }

    #[test]
    fn persistence_cookie_scenario() {
        // Cookie: $Version=1; SRVID=s1; other=v with insert+indirect
        let fe = FrontendConfig::default();
        let be = BackendConfig {
            cookie: crate::config::CookieConfig {
                name: Some("SRVID".into()),
                mode: CookieMode::Insert,
                indirect: true,
                ..crate::config::CookieConfig::default()
            },
            servers: vec![ServerRef {
                id: "s1".into(),
                cookie: Some("s1".into()),
                up: true,
                maintenance: false,
            }],
            ..BackendConfig::default()
        };
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nCookie: $Version=1; SRVID=s1; other=v\r\n\r\n";
        let (buf, txn) = run_request(raw, &fe, &be);
        assert_eq!(txn.cookie_status, ClientCookieStatus::Valid);
        assert_eq!(txn.target_server.as_deref(), Some("s1"));
        assert!(txn.flags.has(TxFlags::DIRECT));
        assert!(txn.flags.has(TxFlags::ASSIGNED));
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Cookie: $Version=1; other=v\r\n"), "{text}");
    }

    #[test]
    fn insert_mode_adds_set_cookie_to_response() {
        let fe = FrontendConfig::default();
        let be = BackendConfig {
            cookie: crate::config::CookieConfig {
                name: Some("SRVID".into()),
                mode: CookieMode::Insert,
                indirect: true,
                ..crate::config::CookieConfig::default()
            },
            servers: vec![ServerRef {
                id: "s1".into(),
                cookie: Some("s1".into()),
                up: true,
                maintenance: false,
            }],
            ..BackendConfig::default()
        };
        let mut req_buf = buffer_with(b"GET / HTTP/1.1\r\nHost: x\r\nCookie: SRVID=s1\r\n\r\n");
        let mut txn = Transaction::new();
        assert_eq!(
            txn.process_request_headers(&mut req_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        let mut rsp_buf = buffer_with(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n");
        assert_eq!(
            txn.process_response_headers(&mut rsp_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        let text = rsp_buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Set-Cookie: SRVID=s1; path=/\r\n"), "{text}");
    }
}
