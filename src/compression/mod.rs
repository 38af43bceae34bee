//! Response-body compression: algorithm dispatch, negotiation and rate
//! accounting. The buffered streaming pipeline lives in [`pipeline`].

pub mod pipeline;

use flate2::{Compress, Compression, Crc, FlushCompress, Status};
use log::debug;

use crate::buffer::Buffer;
use crate::config::CompressionConfig;
use crate::protocol::http::parser::{compare_no_case, MsgFlags};
use crate::protocol::http::{add_header, Transaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CompError {
    #[error("the encoder failed")]
    Encoder,
    #[error("not enough output room")]
    NoRoom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgoKind {
    Identity,
    Deflate,
    Gzip,
}

impl AlgoKind {
    pub fn name(&self) -> &'static str {
        match self {
            AlgoKind::Identity => "identity",
            AlgoKind::Deflate => "deflate",
            AlgoKind::Gzip => "gzip",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<AlgoKind> {
        if compare_no_case(name, b"identity") {
            Some(AlgoKind::Identity)
        } else if compare_no_case(name, b"deflate") {
            Some(AlgoKind::Deflate)
        } else if compare_no_case(name, b"gzip") {
            Some(AlgoKind::Gzip)
        } else {
            None
        }
    }
}

/// The ten-byte gzip member header: no name, no mtime, unknown OS.
const GZIP_HEADER: [u8; 10] = [0x1f, 0x8b, 0x08, 0, 0, 0, 0, 0, 0, 0xff];

enum Encoder {
    Identity,
    /// zlib-wrapped stream, the HTTP `deflate` coding
    Deflate(Box<Compress>),
    /// raw deflate between a gzip header and a CRC trailer, the wrapping
    /// flate2's own gzip writer performs
    Gzip {
        raw: Box<Compress>,
        crc: Crc,
        header_sent: bool,
        stream_ended: bool,
        trailer_written: bool,
    },
}

fn new_encoder(kind: AlgoKind, level: u32) -> Encoder {
    match kind {
        AlgoKind::Identity => Encoder::Identity,
        AlgoKind::Deflate => Encoder::Deflate(Box::new(Compress::new(Compression::new(level), true))),
        AlgoKind::Gzip => Encoder::Gzip {
            raw: Box::new(Compress::new(Compression::new(level), false)),
            crc: Crc::new(),
            header_sent: false,
            stream_ended: false,
            trailer_written: false,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    Sync,
    Finish,
}

/// One transaction's compression stream: the encoder plus the byte
/// counters feeding the global rate adaptation.
pub struct CompCtx {
    kind: AlgoKind,
    encoder: Encoder,
    /// current dynamic level; adapted between 0 and the configured level
    pub cur_level: u32,
    /// level to apply at the next stream reset; the underlying encoder
    /// cannot change parameters mid-stream
    pending_level: Option<u32>,
    pub consumed_in: u64,
    pub produced_out: u64,
}

impl CompCtx {
    pub fn init(kind: AlgoKind, level: u32) -> Result<CompCtx, CompError> {
        Ok(CompCtx {
            kind,
            encoder: new_encoder(kind, level),
            cur_level: level,
            pending_level: None,
            consumed_in: 0,
            produced_out: 0,
        })
    }

    pub fn kind(&self) -> AlgoKind {
        self.kind
    }

    /// Feeds `input` into the encoder, writing into `output`. Never reads
    /// more than `input` nor writes more than `output`. Returns
    /// (consumed, produced).
    pub fn add_data(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), CompError> {
        if input.is_empty() {
            return Ok((0, 0));
        }
        match &mut self.encoder {
            Encoder::Identity => {
                if output.len() < input.len() {
                    return Err(CompError::NoRoom);
                }
                output[..input.len()].copy_from_slice(input);
                self.consumed_in += input.len() as u64;
                self.produced_out += input.len() as u64;
                Ok((input.len(), input.len()))
            }
            Encoder::Deflate(c) => {
                let (consumed, produced) = deflate_step(c, input, output, FlushCompress::None)?;
                self.consumed_in += consumed as u64;
                self.produced_out += produced as u64;
                Ok((consumed, produced))
            }
            Encoder::Gzip {
                raw,
                crc,
                header_sent,
                ..
            } => {
                let mut written = 0;
                if !*header_sent {
                    if output.len() < GZIP_HEADER.len() {
                        return Ok((0, 0));
                    }
                    output[..GZIP_HEADER.len()].copy_from_slice(&GZIP_HEADER);
                    written = GZIP_HEADER.len();
                    *header_sent = true;
                }
                let (consumed, produced) =
                    deflate_step(raw, input, &mut output[written..], FlushCompress::None)?;
                crc.update(&input[..consumed]);
                self.consumed_in += consumed as u64;
                self.produced_out += (written + produced) as u64;
                Ok((consumed, written + produced))
            }
        }
    }

    /// Flushes buffered data. Returns the number of bytes produced and
    /// whether the stream reached its end (after which the encoder must
    /// not be called again before a reset).
    pub fn flush(&mut self, output: &mut [u8], mode: FlushMode) -> Result<(usize, bool), CompError> {
        let flush = match mode {
            FlushMode::Sync => FlushCompress::Sync,
            FlushMode::Finish => FlushCompress::Finish,
        };
        match &mut self.encoder {
            Encoder::Identity => Ok((0, mode == FlushMode::Finish)),
            Encoder::Deflate(c) => {
                let before_out = c.total_out();
                let ended = match c.compress(&[], output, flush) {
                    Ok(Status::StreamEnd) => true,
                    Ok(Status::Ok) | Ok(Status::BufError) => false,
                    Err(_) => return Err(CompError::Encoder),
                };
                let produced = (c.total_out() - before_out) as usize;
                self.produced_out += produced as u64;
                Ok((produced, ended))
            }
            Encoder::Gzip {
                raw,
                crc,
                header_sent,
                stream_ended,
                trailer_written,
            } => {
                let mut written = 0;
                if !*header_sent {
                    // an empty body still needs a well-formed member
                    if output.len() < GZIP_HEADER.len() {
                        return Ok((0, false));
                    }
                    output[..GZIP_HEADER.len()].copy_from_slice(&GZIP_HEADER);
                    written = GZIP_HEADER.len();
                    *header_sent = true;
                }
                if !*stream_ended {
                    let before_out = raw.total_out();
                    let ended = match raw.compress(&[], &mut output[written..], flush) {
                        Ok(Status::StreamEnd) => true,
                        Ok(Status::Ok) | Ok(Status::BufError) => false,
                        Err(_) => return Err(CompError::Encoder),
                    };
                    written += (raw.total_out() - before_out) as usize;
                    *stream_ended = ended;
                }
                if *stream_ended && !*trailer_written {
                    if output.len() - written < 8 {
                        self.produced_out += written as u64;
                        return Ok((written, false));
                    }
                    output[written..written + 4].copy_from_slice(&crc.sum().to_le_bytes());
                    output[written + 4..written + 8].copy_from_slice(&crc.amount().to_le_bytes());
                    written += 8;
                    *trailer_written = true;
                }
                self.produced_out += written as u64;
                Ok((written, *trailer_written))
            }
        }
    }

    /// Ends the stream between transactions and applies a pending level
    /// change.
    pub fn reset(&mut self) {
        if let Some(level) = self.pending_level.take() {
            self.cur_level = level;
            self.encoder = new_encoder(self.kind, level);
            return;
        }
        match &mut self.encoder {
            Encoder::Identity => {}
            Encoder::Deflate(c) => c.reset(),
            Encoder::Gzip {
                raw,
                crc,
                header_sent,
                stream_ended,
                trailer_written,
            } => {
                raw.reset();
                *crc = Crc::new();
                *header_sent = false;
                *stream_ended = false;
                *trailer_written = false;
            }
        }
    }

    /// Requests a different level; effective at the next stream reset.
    pub fn request_level(&mut self, level: u32) {
        if level != self.cur_level {
            self.pending_level = Some(level);
        }
    }
}

/// Sliding one-second byte counter, enough to bound the compressed output
/// rate without a full histogram.
#[derive(Debug, Clone, Copy, Default)]
pub struct FreqCounter {
    cur_sec: i64,
    cur: u64,
    prev: u64,
}

impl FreqCounter {
    pub fn add(&mut self, now_sec: i64, count: u64) {
        self.rotate(now_sec);
        self.cur += count;
    }

    /// Approximate events per second over the last second.
    pub fn rate(&mut self, now_sec: i64) -> u64 {
        self.rotate(now_sec);
        self.prev.max(self.cur)
    }

    fn rotate(&mut self, now_sec: i64) {
        if now_sec != self.cur_sec {
            self.prev = if now_sec == self.cur_sec + 1 { self.cur } else { 0 };
            self.cur = 0;
            self.cur_sec = now_sec;
        }
    }
}

/// Process-wide compression counters, owned by the embedding proxy and
/// passed by reference: the single-threaded model needs no locking.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompressionRates {
    pub bps_in: FreqCounter,
    pub bps_out: FreqCounter,
}

/// Request-side selection: picks the algorithm from `Accept-Encoding`,
/// applies the legacy user-agent quirk, and strips the advertisement in
/// offload mode.
pub fn select_request_algorithm(
    txn: &mut Transaction,
    buf: &mut Buffer,
    cfg: &CompressionConfig,
) -> Option<AlgoKind> {
    // Mozilla/4 era browsers mishandle compressed responses, except MSIE 6
    // with XP SP2 ("SV1") and MSIE 7 and later
    let mut ctx = txn.hdr_idx.fresh_ctx();
    if txn
        .hdr_idx
        .find(buf, buf.input_begin(), b"User-Agent", &mut ctx)
    {
        let ua = header_value(buf, &ctx);
        if ua.len() >= 9 && &ua[..9] == b"Mozilla/4" {
            let known_good = ua.len() >= 31
                && &ua[25..30] == b"MSIE "
                && (ua[30] > b'6' || (ua[30] == b'6' && ua.len() >= 54 && &ua[51..54] == b"SV1"));
            if !known_good {
                debug!("{} compression disabled for legacy user agent", txn.request_id);
                return None;
            }
        }
    }

    let mut selected = None;
    let mut seen_any = false;
    let mut ctx = txn.hdr_idx.fresh_ctx();
    while txn
        .hdr_idx
        .find(buf, buf.input_begin(), b"Accept-Encoding", &mut ctx)
    {
        seen_any = true;
        if selected.is_none() {
            if let Some(kind) = AlgoKind::from_name(&header_value(buf, &ctx)) {
                if cfg.algorithms.iter().any(|a| a == kind.name()) {
                    selected = Some(kind);
                }
            }
        }
    }
    // a client not advertising anything may still receive identity
    if !seen_any && cfg.algorithms.iter().any(|a| a == "identity") {
        selected = Some(AlgoKind::Identity);
    }

    if cfg.offload {
        // the backend must never negotiate its own compression
        let p = buf.input_begin();
        let mut ctx = txn.hdr_idx.fresh_ctx();
        while txn.hdr_idx.find(buf, p, b"Accept-Encoding", &mut ctx) {
            let delta = txn.hdr_idx.remove(buf, p, &mut ctx);
            txn.req.move_end(delta);
        }
    }
    selected
}

/// Response-side selection. On success the response headers are rewritten
/// for chunked, compressed output and a ready stream context is returned.
pub fn select_response_compression(
    txn: &mut Transaction,
    buf: &mut Buffer,
    cfg: &CompressionConfig,
    candidate: Option<AlgoKind>,
    idle_pct: u32,
) -> Option<CompCtx> {
    let kind = candidate?;
    if !txn.rsp.flags.has(MsgFlags::VER_11) {
        return None;
    }
    if txn.status != 200 {
        return None;
    }
    // a known empty body is not worth a stream; close-delimited bodies are
    if txn.rsp.flags.has(MsgFlags::XFER_LEN)
        && !txn.rsp.flags.has(MsgFlags::TE_CHNK)
        && txn.rsp.body_len == 0
    {
        return None;
    }
    if idle_pct < cfg.min_idle {
        return None;
    }

    let p = buf.input_begin();
    let mut ctx = txn.hdr_idx.fresh_ctx();
    if txn.hdr_idx.find(buf, p, b"Content-Encoding", &mut ctx) {
        return None;
    }
    let mut ctx = txn.hdr_idx.fresh_ctx();
    while txn.hdr_idx.find(buf, p, b"Cache-Control", &mut ctx) {
        if compare_no_case(&header_value(buf, &ctx), b"no-transform") {
            return None;
        }
    }
    let mut ctx = txn.hdr_idx.fresh_ctx();
    if txn.hdr_idx.find(buf, p, b"Content-Type", &mut ctx) {
        let value = header_value(buf, &ctx);
        if value.len() >= 9 && compare_no_case(&value[..9], b"multipart") {
            return None;
        }
        if !cfg.types.is_empty() {
            let base = value.split(|&c| c == b';').next().unwrap_or(&value);
            if !cfg
                .types
                .iter()
                .any(|t| base.len() >= t.len() && compare_no_case(&base[..t.len()], t.as_bytes()))
            {
                return None;
            }
        }
    } else if !cfg.types.is_empty() {
        return None;
    }

    let stream = CompCtx::init(kind, cfg.level).ok()?;

    // rewrite the headers: the body leaves here chunked and encoded
    let mut ctx = txn.hdr_idx.fresh_ctx();
    while txn.hdr_idx.find(buf, p, b"Content-Length", &mut ctx) {
        let delta = txn.hdr_idx.remove(buf, p, &mut ctx);
        txn.rsp.move_end(delta);
    }
    add_header(
        buf,
        &mut txn.rsp,
        &mut txn.hdr_idx,
        b"Transfer-Encoding: chunked\r\n",
    )
    .ok()?;
    if kind != AlgoKind::Identity {
        let line = format!("Content-Encoding: {}\r\n", kind.name());
        add_header(buf, &mut txn.rsp, &mut txn.hdr_idx, line.as_bytes()).ok()?;
    }
    txn.rsp.flags.set(MsgFlags::COMPRESSING);
    Some(stream)
}

fn deflate_step(
    c: &mut Compress,
    input: &[u8],
    output: &mut [u8],
    flush: FlushCompress,
) -> Result<(usize, usize), CompError> {
    let before_in = c.total_in();
    let before_out = c.total_out();
    match c.compress(input, output, flush) {
        Ok(Status::Ok) | Ok(Status::BufError) | Ok(Status::StreamEnd) => {}
        Err(_) => return Err(CompError::Encoder),
    }
    Ok((
        (c.total_in() - before_in) as usize,
        (c.total_out() - before_out) as usize,
    ))
}

fn header_value(buf: &Buffer, ctx: &crate::protocol::http::header::HdrCtx) -> Vec<u8> {
    let base = ctx.sol + ctx.val;
    (0..ctx.vlen).map(|n| buf.input_byte(base + n)).collect()
}
