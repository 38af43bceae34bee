//! Buffered compression pipeline.
//!
//! Each activation works with two buffers: the live response ring (`input`)
//! and a scratch ring (`output`). The output starts with the already
//! committed bytes of the input (response headers, previously emitted
//! chunks) followed by an eight-byte reservation for the chunk-size header.
//! Compressed data accumulates after it; on `end` the reservation is
//! backpatched with the real size, the raw leftovers are copied over, and
//! the two buffers swap so no payload copy ever happens.
//!
//! Chunk envelope bytes parsed from the source stream are consumed into
//! the input's committed side and vanish at swap time; only the payload
//! flows through the encoder.

use log::trace;

use crate::buffer::Buffer;
use crate::config::CompressionConfig;
use crate::pool::Reset;
use crate::protocol::http::chunk::{emit_chunk_size, ChunkStatus, CHUNK_SIZE_WIDTH};
use crate::protocol::http::parser::{HttpMsg, MsgFlags, MsgState};
use crate::protocol::http::chunk;

use super::{CompCtx, CompError, CompressionRates, FlushMode};

/// Sets up the scratch buffer for one activation: prior committed output
/// first, then the size reservation.
pub fn buffer_init(input: &mut Buffer, output: &mut Buffer, msg: &mut HttpMsg) -> Result<(), CompError> {
    if input.available_space() < 40 {
        return Err(CompError::NoRoom);
    }
    output.reset();

    // keep the committed bytes (headers, earlier chunks) ahead of us
    while input.output_len() > 0 {
        let part = input.output_slice().to_vec();
        output.write_unchecked(&part);
        output.advance(part.len());
        input.consume_output(part.len());
    }

    // drop the chunk envelope parsed so far
    input.advance(msg.next);
    input.consume_output(msg.next);
    msg.next = 0;
    msg.sov = 0;
    msg.sol = 0;

    let mut slot = [0u8; CHUNK_SIZE_WIDTH];
    emit_chunk_size(&mut slot, 0, false);
    output.write_unchecked(&slot);
    Ok(())
}

/// Compresses as much of the current chunk as input, announced length and
/// output room allow.
pub fn buffer_add_data(
    input: &mut Buffer,
    output: &mut Buffer,
    msg: &mut HttpMsg,
    ctx: &mut CompCtx,
) -> Result<usize, CompError> {
    // envelope bytes from CHUNK_SIZE / CHUNK_CRLF parsing are not payload
    input.advance(msg.next);
    input.consume_output(msg.next);
    msg.next = 0;

    let mut budget = (msg.chunk_len.min(input.input_len() as u64)) as usize;
    let mut total = 0usize;
    while budget > 0 {
        let start = input.input_begin();
        let part_len = input.slice_contiguous(start).len().min(budget);
        if part_len == 0 {
            break;
        }
        let part = input.slice_contiguous(start)[..part_len].to_vec();
        let spare = output.spare_mut();
        if spare.is_empty() {
            break;
        }
        let (consumed, produced) = ctx.add_data(&part, spare)?;
        output.fill(produced);
        input.advance(consumed);
        input.consume_output(consumed);
        msg.chunk_len -= consumed as u64;
        budget -= consumed;
        total += consumed;
        if consumed == 0 {
            break;
        }
    }
    Ok(total)
}

/// Flushes the encoder, finalizes the chunk framing, swaps the buffers and
/// commits the emitted bytes. Returns the number of bytes made available
/// for forwarding.
#[allow(clippy::too_many_arguments)]
pub fn buffer_end(
    input: &mut Buffer,
    output: &mut Buffer,
    msg: &mut HttpMsg,
    ctx: &mut CompCtx,
    rates: &mut CompressionRates,
    cfg: &CompressionConfig,
    now_sec: i64,
    finish: bool,
) -> Result<usize, CompError> {
    let mode = if finish { FlushMode::Finish } else { FlushMode::Sync };
    loop {
        let spare = output.spare_mut();
        if spare.is_empty() {
            break;
        }
        let (produced, ended) = ctx.flush(spare, mode)?;
        output.fill(produced);
        if produced == 0 || ended {
            break;
        }
    }

    let emitted = output.input_len();
    let to_forward;
    if emitted > CHUNK_SIZE_WIDTH {
        // write the real size into the reservation
        let payload = (emitted - CHUNK_SIZE_WIDTH) as u32;
        let mut slot = [0u8; CHUNK_SIZE_WIDTH];
        emit_chunk_size(&mut slot, payload, false);
        let base = output.input_begin();
        for (n, &b) in slot.iter().enumerate() {
            output.set_byte(output.add_ofs(base, n), b);
        }
        output.write_unchecked(b"\r\n");
        if !msg.flags.has(MsgFlags::TE_CHNK) && msg.chunk_len == 0 {
            // the source framing carries no terminator of its own
            output.write_unchecked(b"0\r\n\r\n");
        }
        to_forward = output.input_len();
    } else {
        // nothing came out: cancel the reservation
        output.cancel_input(emitted);
        to_forward = 0;
    }

    rates.bps_in.add(now_sec, ctx.consumed_in);
    rates.bps_out.add(now_sec, ctx.produced_out);
    ctx.consumed_in = 0;
    ctx.produced_out = 0;

    // output rate ceiling drives the level up and down
    if cfg.rate_limit > 0 {
        if rates.bps_out.rate(now_sec) > cfg.rate_limit {
            if ctx.cur_level > 0 {
                ctx.request_level(ctx.cur_level - 1);
            }
        } else if ctx.cur_level < cfg.level {
            ctx.request_level(ctx.cur_level + 1);
        }
    }

    // raw leftovers (unparsed tail, trailers) ride along behind
    while input.input_len() > 0 {
        let part = input.slice_contiguous(input.input_begin()).to_vec();
        output.write_unchecked(&part);
        input.skip_input(part.len());
    }

    std::mem::swap(input, output);
    output.reset();

    // commit the emitted chunk, plus any trailer bytes already parsed
    input.advance(to_forward);
    input.advance(msg.next);
    msg.next = 0;

    trace!("compression emitted {to_forward} bytes");
    Ok(to_forward)
}

/// Drives a response body through the compressor, mirroring the plain
/// forwarding loop but emitting re-framed chunks.
pub fn compress_response_body(
    input: &mut Buffer,
    scratch: &mut Buffer,
    msg: &mut HttpMsg,
    ctx: &mut CompCtx,
    rates: &mut CompressionRates,
    cfg: &CompressionConfig,
    now_sec: i64,
) -> ChunkStatus {
    if buffer_init(input, scratch, msg).is_err() {
        return ChunkStatus::NeedData;
    }
    let mut end = |input: &mut Buffer, scratch: &mut Buffer, msg: &mut HttpMsg, ctx: &mut CompCtx, finish: bool| {
        buffer_end(input, scratch, msg, ctx, rates, cfg, now_sec, finish)
    };

    loop {
        match msg.state {
            MsgState::Body => {
                if msg.flags.has(MsgFlags::TE_CHNK) {
                    msg.state = MsgState::ChunkSize;
                } else if msg.flags.has(MsgFlags::XFER_LEN) {
                    msg.chunk_len = msg.body_len;
                    msg.state = MsgState::Data;
                } else {
                    msg.chunk_len = u64::MAX;
                    msg.state = MsgState::Data;
                }
            }
            MsgState::Data => {
                if buffer_add_data(input, scratch, msg, ctx).is_err() {
                    msg.state = MsgState::Error;
                    return ChunkStatus::Invalid;
                }
                if msg.chunk_len == 0 {
                    msg.state = if msg.flags.has(MsgFlags::TE_CHNK) {
                        MsgState::ChunkCrlf
                    } else {
                        MsgState::Done
                    };
                    continue;
                }
                // out of input or output room for now
                let _ = end(input, scratch, msg, ctx, false);
                return ChunkStatus::NeedData;
            }
            MsgState::ChunkSize => match chunk::parse_chunk_size(input, msg) {
                ChunkStatus::Advanced => {}
                other => {
                    let _ = end(input, scratch, msg, ctx, false);
                    return other;
                }
            },
            MsgState::ChunkCrlf => match chunk::skip_chunk_crlf(input, msg) {
                ChunkStatus::Advanced => {}
                other => {
                    let _ = end(input, scratch, msg, ctx, false);
                    return other;
                }
            },
            MsgState::Trailers => match chunk::forward_trailers(input, msg) {
                ChunkStatus::Advanced => {
                    // Done: trailers ride behind the final flush
                    if end(input, scratch, msg, ctx, true).is_err() {
                        msg.state = MsgState::Error;
                        return ChunkStatus::Invalid;
                    }
                    ctx.reset();
                    return ChunkStatus::Advanced;
                }
                other => {
                    let _ = end(input, scratch, msg, ctx, false);
                    return other;
                }
            },
            MsgState::Done => {
                if end(input, scratch, msg, ctx, true).is_err() {
                    msg.state = MsgState::Error;
                    return ChunkStatus::Invalid;
                }
                ctx.reset();
                return ChunkStatus::Advanced;
            }
            MsgState::Error => return ChunkStatus::Invalid,
            _ => return ChunkStatus::NeedData,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::AlgoKind;
    use crate::config::{BackendConfig, FrontendConfig};
    use crate::protocol::http::{forward_headers, AnalyserStatus, Transaction};
    use std::io::Read;

    fn drive(
        raw_rsp: &[u8],
        kind: AlgoKind,
    ) -> (Vec<u8>, Transaction) {
        let fe = FrontendConfig::default();
        let be = BackendConfig::default();
        let comp_cfg = CompressionConfig {
            algorithms: vec![kind.name().to_string()],
            level: 6,
            ..CompressionConfig::default()
        };

        let mut req_buf = Buffer::with_capacity_and_margin(2048, 256);
        req_buf.write(b"GET / HTTP/1.1\r\nAccept-Encoding: gzip, deflate, identity\r\n\r\n");
        let mut txn = Transaction::new();
        assert_eq!(
            txn.process_request_headers(&mut req_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        let candidate = crate::compression::select_request_algorithm(&mut txn, &mut req_buf, &comp_cfg);
        assert_eq!(candidate, Some(kind));

        let mut rsp_buf = Buffer::with_capacity_and_margin(4096, 256);
        rsp_buf.write(raw_rsp);
        assert_eq!(
            txn.process_response_headers(&mut rsp_buf, &fe, &be, 0),
            AnalyserStatus::Complete
        );
        let mut stream =
            crate::compression::select_response_compression(&mut txn, &mut rsp_buf, &comp_cfg, candidate, 100)
                .expect("compression should engage");

        forward_headers(&mut rsp_buf, &mut txn.rsp);
        let mut scratch = Buffer::with_capacity_and_margin(4096, 0);
        let mut rates = CompressionRates::default();
        let status = compress_response_body(
            &mut rsp_buf,
            &mut scratch,
            &mut txn.rsp,
            &mut stream,
            &mut rates,
            &comp_cfg,
            0,
        );
        assert_eq!(status, ChunkStatus::Advanced);

        // everything is committed output now
        let mut wire = Vec::new();
        while rsp_buf.output_len() > 0 {
            let part = rsp_buf.output_slice().to_vec();
            wire.extend_from_slice(&part);
            rsp_buf.consume_output(part.len());
        }
        (wire, txn)
    }

    /// Decodes a chunked body, returning the concatenated payload.
    fn decode_chunks(mut body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let pos = body.windows(2).position(|w| w == b"\r\n").unwrap();
            let size = usize::from_str_radix(std::str::from_utf8(&body[..pos]).unwrap(), 16).unwrap();
            body = &body[pos + 2..];
            if size == 0 {
                break;
            }
            out.extend_from_slice(&body[..size]);
            body = &body[size..];
            assert_eq!(&body[..2], b"\r\n");
            body = &body[2..];
        }
        out
    }

    #[test]
    fn gzip_content_length_response() {
        // headers rewritten, body turned into one gzip stream in chunked
        // framing with a terminating zero chunk
        let (wire, _) = drive(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 11\r\n\r\nhello world",
            AlgoKind::Gzip,
        );
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = String::from_utf8_lossy(&wire[..head_end]);
        assert!(head.contains("Transfer-Encoding: chunked\r\n"), "{head}");
        assert!(head.contains("Content-Encoding: gzip\r\n"), "{head}");
        assert!(!head.contains("Content-Length"), "{head}");

        let payload = decode_chunks(&wire[head_end..]);
        let mut decoder = flate2::read::GzDecoder::new(&payload[..]);
        let mut plain = String::new();
        decoder.read_to_string(&mut plain).unwrap();
        assert_eq!(plain, "hello world");
    }

    #[test]
    fn identity_keeps_payload_bytes() {
        let (wire, _) = drive(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
            AlgoKind::Identity,
        );
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(decode_chunks(&wire[head_end..]), b"hello");
        // identity does not announce a content encoding
        assert!(!String::from_utf8_lossy(&wire[..head_end]).contains("Content-Encoding"));
    }

    #[test]
    fn chunked_source_is_recompressed() {
        let (wire, _) = drive(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nTransfer-Encoding: chunked\r\n\r\n\
              6\r\nhello \r\n5\r\nworld\r\n0\r\n\r\n",
            AlgoKind::Identity,
        );
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(decode_chunks(&wire[head_end..]), b"hello world");
    }

    #[test]
    fn fixed_width_chunk_sizes() {
        let (wire, _) = drive(
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
            AlgoKind::Identity,
        );
        let head_end = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let body = &wire[head_end..];
        // six zero-padded hex digits then CRLF
        assert_eq!(&body[..8], b"000005\r\n");
    }
}
