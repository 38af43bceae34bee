//! Cookie persistence and capture passes.
//!
//! Both passes perform their edits directly inside the ring buffer while
//! the header index stays live: every deletion or insertion immediately
//! updates the owning entry's length and the message offsets, so the pass
//! can keep walking the same line without re-parsing.
//!
//! Persistence cookies come in two shapes. In prefix mode the value is
//! `SRV~OPAQUE` and the proxy strips `SRV~` before the server sees it. In
//! the other modes the value is `SRV[|LASTSEEN[|FIRSTSEEN]]` where the
//! dates are 30-bit epoch values in 4-second units, base64-encoded on five
//! characters.

use log::debug;

use crate::buffer::Buffer;
use crate::config::{CaptureConfig, CookieConfig, CookieMode, ServerRef};

use super::header::HeaderIndex;
use super::parser::HttpMsg;

/// Delimiter between the server id and the opaque value in prefix mode.
pub const COOKIE_DELIM: u8 = b'~';
/// Delimiter before each date field.
pub const COOKIE_DELIM_DATE: u8 = b'|';

/// Clock-drift tolerance: cookies dated further in the future are invalid.
const COOKIE_DATE_TOLERANCE: i64 = 86400;

const BASE64_TAB: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

/// Encodes a 30-bit value on five base64 characters, high bits first.
pub fn s30tob64(v: u32) -> [u8; 5] {
    let mut out = [0u8; 5];
    for (n, slot) in out.iter_mut().enumerate() {
        let shift = 24 - 6 * n;
        *slot = BASE64_TAB[((v >> shift) & 0x3f) as usize];
    }
    out
}

/// Decodes five base64 characters into a 30-bit value, or -1 when a
/// character is not part of the alphabet.
pub fn b64tos30(s: &[u8]) -> i64 {
    let mut v: i64 = 0;
    for &c in s.iter().take(5) {
        let d = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a' + 26,
            b'0'..=b'9' => c - b'0' + 52,
            b'+' => 62,
            b'/' => 63,
            _ => return -1,
        };
        v = (v << 6) | d as i64;
    }
    v
}

/// Quantizes a wall-clock second count the way cookie dates are stored.
pub fn quantize_date(secs: i64) -> u32 {
    (((secs + 3) >> 2) & 0x3fff_ffff) as u32
}

/// What the request pass concluded about the client's persistence cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientCookieStatus {
    /// no persistence cookie seen
    #[default]
    None,
    /// cookie designates a usable server
    Valid,
    /// cookie matched no server
    Invalid,
    /// cookie designates a server that is down
    Down,
    /// last-seen date exceeded maxidle
    Expired,
    /// first-seen date exceeded maxlife
    Old,
}

/// What the response pass did with the server's Set-Cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerCookieStatus {
    #[default]
    None,
    /// the server set its cookie and it was left untouched
    Found,
    /// the server's cookie was removed (insert mode owns the name)
    Deleted,
    /// the value was rewritten or prefixed with the server id
    Replaced,
}

#[derive(Debug, Clone, Default)]
pub struct RequestCookieOutcome {
    pub status: ClientCookieStatus,
    /// id of the server designated by the cookie, when one matched
    pub server_id: Option<String>,
    /// captured `name=value` for logs
    pub captured: Option<String>,
    /// dates decoded from the cookie, 0 when absent or cleared
    pub first_date: i64,
    pub last_date: i64,
    /// net displacement applied to the message
    pub delta: i32,
}

#[derive(Debug, Clone, Default)]
pub struct ResponseCookieOutcome {
    pub status: ServerCookieStatus,
    pub captured: Option<String>,
    /// application session id captured for stickiness
    pub session_id: Option<String>,
    pub delta: i32,
}

fn is_spht(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

fn at(buf: &Buffer, rel: usize) -> u8 {
    buf.input_byte(rel)
}

/// End of a cookie value starting at `from`: the next delimiter outside of
/// any quoted string. Commas only delimit when `comma` is set (Set-Cookie2);
/// plain Set-Cookie values such as Expires dates may contain them.
fn find_value_end(buf: &Buffer, from: usize, end: usize, comma: bool) -> usize {
    let mut pos = from;
    let mut quoted = false;
    let mut escaped = false;
    while pos < end {
        let c = at(buf, pos);
        if escaped {
            escaped = false;
        } else if quoted {
            match c {
                b'\\' => escaped = true,
                b'"' => quoted = false,
                _ => {}
            }
        } else if c == b'"' {
            quoted = true;
        } else if c == b';' || (comma && c == b',') {
            break;
        }
        pos += 1;
    }
    pos
}

fn line_has_name(buf: &Buffer, sol: usize, len: usize, name: &[u8]) -> bool {
    if len < name.len() + 1 || at(buf, sol + name.len()) != b':' {
        return false;
    }
    (0..name.len()).all(|n| {
        let c = at(buf, sol + n);
        c.eq_ignore_ascii_case(&name[n])
    })
}

/// Removes the value sitting between the delimiters `from` and `next`,
/// preserving exactly one delimiter and at most one space, the way a human
/// would have written the remaining header. Returns the new `from`
/// (the preserved delimiter region's end) and the displacement.
fn del_hdr_value(buf: &mut Buffer, from: usize, next: usize, end: usize) -> (usize, i32) {
    let mut prev = from;
    let mut next = next;

    if at(buf, prev) == b':' {
        // removing the first value: keep the colon, normalize one space
        while next < end && is_spht(at(buf, next)) {
            next += 1;
        }
        prev += 1;
        if prev < next {
            let abs = buf.abs_of(prev);
            buf.set_byte(abs, b' ');
            prev += 1;
        }
        while prev < next && is_spht(at(buf, prev)) {
            prev += 1;
        }
    } else {
        // back out the spaces before the leading delimiter
        while is_spht(at(buf, prev - 1)) {
            prev -= 1;
        }
        // then take over the trailing delimiter and one space
        if next < end {
            let c = at(buf, next);
            let abs = buf.abs_of(prev);
            buf.set_byte(abs, c);
            prev += 1;
            next += 1;
            if prev + 1 < next {
                let abs = buf.abs_of(prev);
                buf.set_byte(abs, b' ');
                prev += 1;
            }
            while next < end && is_spht(at(buf, next)) {
                next += 1;
            }
        }
    }
    let delta = buf.delete(buf.abs_of(prev), buf.abs_of(next));
    (prev, delta)
}

/// Request-side pass over every `Cookie:` header.
pub fn manage_request_cookies(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    be: &CookieConfig,
    capture: &CaptureConfig,
    servers: &[ServerRef],
    now: i64,
) -> RequestCookieOutcome {
    let mut out = RequestCookieOutcome::default();

    let mut prev_idx = 0usize;
    let mut sol = idx.first_pos();
    let mut cur = idx.entry(0).next as usize;

    while cur != 0 {
        let len = idx.entry(cur).len as usize;
        if !line_has_name(buf, sol, len, b"Cookie") {
            prev_idx = cur;
            sol += idx.line_span(cur);
            cur = idx.entry(cur).next as usize;
            continue;
        }

        let deleted = process_request_line(
            buf, msg, idx, cur, prev_idx, sol, be, capture, servers, now, &mut out,
        );
        if deleted {
            // the next line now starts at the same offset
            cur = idx.entry(prev_idx).next as usize;
            continue;
        }
        prev_idx = cur;
        sol += idx.line_span(cur);
        cur = idx.entry(cur).next as usize;
    }
    out
}

/// One `Cookie:` line. Returns true when the whole line was removed.
#[allow(clippy::too_many_arguments)]
fn process_request_line(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    cur: usize,
    prev_idx: usize,
    hdr_beg: usize,
    be: &CookieConfig,
    capture: &CaptureConfig,
    servers: &[ServerRef],
    now: i64,
    out: &mut RequestCookieOutcome,
) -> bool {
    let mut hdr_end = hdr_beg + idx.entry(cur).len as usize;

    // position of the separator before the pair scheduled for deletion
    let mut del_from: Option<usize> = None;
    // raised as soon as one pair must be kept
    let mut preserve_hdr = false;

    let mut prev = hdr_beg + 6; // the colon after "Cookie"
    while prev < hdr_end {
        // attribute name starts after the separator and its spaces
        let mut att_beg = prev + 1;
        while att_beg < hdr_end && is_spht(at(buf, att_beg)) {
            att_beg += 1;
        }

        // attribute end: last non-space before the equal sign
        let mut att_end = att_beg;
        let mut equal = att_beg;
        while equal < hdr_end {
            let c = at(buf, equal);
            if c == b'=' || c == b';' {
                break;
            }
            equal += 1;
            if !is_spht(c) {
                att_end = equal;
            }
        }

        let (mut val_beg, mut val_end, mut next) = if equal < hdr_end && at(buf, equal) == b'=' {
            let mut vb = equal + 1;
            while vb < hdr_end && is_spht(at(buf, vb)) {
                vb += 1;
            }
            let nx = find_value_end(buf, vb, hdr_end, false);
            let mut ve = nx;
            while ve > vb && is_spht(at(buf, ve - 1)) {
                ve -= 1;
            }
            (vb, ve, nx)
        } else {
            (equal, equal, equal)
        };

        // '$'-prefixed attributes belong to the preceding cookie and follow
        // its fate
        if att_beg < hdr_end && at(buf, att_beg) == b'$' {
            prev = next;
            continue;
        }

        // pairs without an equal sign are preserved untouched
        if equal == next {
            preserve_hdr = true;
            if let Some(from) = del_from.take() {
                let (_, delta) = del_hdr_value(buf, from, prev, hdr_end);
                hdr_end = (hdr_end as i32 + delta) as usize;
                idx.adjust_len(cur, delta);
                msg.move_end(delta);
                out.delta += delta;
                prev = (next as i32 + delta) as usize;
            } else {
                prev = next;
            }
            continue;
        }

        // strip the spaces around the equal sign so captures and rewrites
        // see `name=value`
        if att_end != equal {
            let delta = buf.delete(buf.abs_of(att_end), buf.abs_of(equal));
            equal = (equal as i32 + delta) as usize;
            val_beg = (val_beg as i32 + delta) as usize;
            val_end = (val_end as i32 + delta) as usize;
            next = (next as i32 + delta) as usize;
            hdr_end = (hdr_end as i32 + delta) as usize;
            idx.adjust_len(cur, delta);
            msg.move_end(delta);
            out.delta += delta;
        }
        if val_beg > equal + 1 {
            let delta = buf.delete(buf.abs_of(equal + 1), buf.abs_of(val_beg));
            val_beg = (val_beg as i32 + delta) as usize;
            val_end = (val_end as i32 + delta) as usize;
            next = (next as i32 + delta) as usize;
            hdr_end = (hdr_end as i32 + delta) as usize;
            idx.adjust_len(cur, delta);
            msg.move_end(delta);
            out.delta += delta;
        }

        // capture, first match only
        if let Some(name) = capture.cookie_name.as_deref() {
            if out.captured.is_none()
                && val_end - att_beg >= name.len()
                && range_eq(buf, att_beg, name.as_bytes())
            {
                let log_len = (val_end - att_beg).min(capture.cookie_len.max(name.len()));
                out.captured = Some(range_string(buf, att_beg, log_len));
            }
        }

        let name_matches = match be.name.as_deref() {
            Some(name) => att_end - att_beg == name.len() && range_eq(buf, att_beg, name.as_bytes()),
            None => false,
        };

        if name_matches {
            // locate the server id inside the value
            let mut delim = val_end;
            if be.mode == CookieMode::Prefix {
                delim = val_beg;
                while delim < val_end && at(buf, delim) != COOKIE_DELIM {
                    delim += 1;
                }
            } else {
                // optional date fields after vertical bars
                let mut bar = val_beg;
                while bar < val_end && at(buf, bar) != COOKIE_DELIM_DATE {
                    bar += 1;
                }
                if bar < val_end {
                    delim = bar;
                    let date_beg = bar + 1;
                    if val_end - date_beg >= 5 {
                        let raw: Vec<u8> = (0..5).map(|n| at(buf, date_beg + n)).collect();
                        let val = b64tos30(&raw);
                        if val > 0 {
                            out.last_date = val << 2;
                        }
                    }
                    let mut bar2 = date_beg;
                    while bar2 < val_end && at(buf, bar2) != COOKIE_DELIM_DATE {
                        bar2 += 1;
                    }
                    if bar2 < val_end && val_end - bar2 > 5 {
                        let raw: Vec<u8> = (0..5).map(|n| at(buf, bar2 + 1 + n)).collect();
                        let val = b64tos30(&raw);
                        if val > 0 {
                            out.first_date = val << 2;
                        }
                    }
                }
            }

            // expiry: an out-of-date cookie is handled as if it were absent
            if be.maxlife != 0
                && out.first_date != 0
                && (out.first_date + be.maxlife < now
                    || out.first_date > now + COOKIE_DATE_TOLERANCE)
            {
                out.status = ClientCookieStatus::Old;
                delim = val_beg;
                out.first_date = 0;
                out.last_date = 0;
            } else if be.maxidle != 0
                && out.last_date != 0
                && (out.last_date + be.maxidle < now
                    || out.last_date > now + COOKIE_DATE_TOLERANCE)
            {
                out.status = ClientCookieStatus::Expired;
                delim = val_beg;
                out.first_date = 0;
                out.last_date = 0;
            }

            // empty ids never match: a client that once learned an empty
            // cookie must not stick to a cookie-less server
            if delim > val_beg && !be.ignore_persistence && out.server_id.is_none() {
                for srv in servers {
                    let matches = srv
                        .cookie
                        .as_deref()
                        .map(|ck| {
                            ck.len() == delim - val_beg && range_eq(buf, val_beg, ck.as_bytes())
                        })
                        .unwrap_or(false);
                    if !matches {
                        continue;
                    }
                    if srv.usable() || be.persist_on_down {
                        out.status = if srv.usable() {
                            ClientCookieStatus::Valid
                        } else {
                            ClientCookieStatus::Down
                        };
                        out.server_id = Some(srv.id.clone());
                        break;
                    }
                    // found but down: remember it and keep looking for a
                    // usable server sharing the same cookie
                    out.status = ClientCookieStatus::Down;
                }
            }

            if out.server_id.is_none()
                && !matches!(
                    out.status,
                    ClientCookieStatus::Down | ClientCookieStatus::Expired | ClientCookieStatus::Old
                )
            {
                out.status = ClientCookieStatus::Invalid;
            }

            if be.mode == CookieMode::Prefix && delim != val_end {
                // strip `SRV~` so the server receives its own value back
                let delta = buf.delete(buf.abs_of(val_beg), buf.abs_of(delim + 1));
                next = (next as i32 + delta) as usize;
                hdr_end = (hdr_end as i32 + delta) as usize;
                idx.adjust_len(cur, delta);
                msg.move_end(delta);
                out.delta += delta;
                del_from = None;
                preserve_hdr = true;
            } else if del_from.is_none() && be.mode == CookieMode::Insert && be.indirect {
                // proxy-owned cookie: the server must never see it
                del_from = Some(prev);
            } else {
                preserve_hdr = true;
            }
        } else {
            // not ours: keep it, and flush any pending deletion now
            preserve_hdr = true;
            if let Some(from) = del_from.take() {
                let (_, delta) = del_hdr_value(buf, from, prev, hdr_end);
                next = (next as i32 + delta) as usize;
                hdr_end = (hdr_end as i32 + delta) as usize;
                idx.adjust_len(cur, delta);
                msg.move_end(delta);
                out.delta += delta;
            }
        }

        prev = next;
    }

    // a deletion may still be pending at the end of the line
    if let Some(from) = del_from {
        if preserve_hdr {
            let (_, delta) = del_hdr_value(buf, from, hdr_end, hdr_end);
            idx.adjust_len(cur, delta);
            msg.move_end(delta);
            out.delta += delta;
        } else {
            // nothing left on this line: delete the header entirely
            let span = idx.line_span(cur);
            let delta = buf.delete(buf.abs_of(hdr_beg), buf.abs_of(hdr_beg + span));
            idx.unlink(prev_idx, cur);
            msg.move_end(delta);
            out.delta += delta;
            debug!("removed empty Cookie header");
            return true;
        }
    }
    false
}

/// Response-side pass over `Set-Cookie` and `Set-Cookie2` headers.
pub fn manage_response_cookies(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    be: &CookieConfig,
    capture: &CaptureConfig,
    server: Option<&ServerRef>,
    out: &mut ResponseCookieOutcome,
) {
    let mut prev_idx = 0usize;
    let mut sol = idx.first_pos();
    let mut cur = idx.entry(0).next as usize;

    while cur != 0 {
        let len = idx.entry(cur).len as usize;
        let (is_set_cookie, name_len, comma_separated) =
            if line_has_name(buf, sol, len, b"Set-Cookie") {
                (true, 10, false)
            } else if line_has_name(buf, sol, len, b"Set-Cookie2") {
                (true, 11, true)
            } else {
                (false, 0, false)
            };
        if !is_set_cookie {
            prev_idx = cur;
            sol += idx.line_span(cur);
            cur = idx.entry(cur).next as usize;
            continue;
        }

        let deleted = process_response_line(
            buf, msg, idx, cur, prev_idx, sol, name_len, comma_separated, be, capture, server, out,
        );
        if deleted {
            cur = idx.entry(prev_idx).next as usize;
            continue;
        }
        prev_idx = cur;
        sol += idx.line_span(cur);
        cur = idx.entry(cur).next as usize;
    }
}

#[allow(clippy::too_many_arguments)]
fn process_response_line(
    buf: &mut Buffer,
    msg: &mut HttpMsg,
    idx: &mut HeaderIndex,
    cur: usize,
    prev_idx: usize,
    hdr_beg: usize,
    name_len: usize,
    comma_separated: bool,
    be: &CookieConfig,
    capture: &CaptureConfig,
    server: Option<&ServerRef>,
    out: &mut ResponseCookieOutcome,
) -> bool {
    let mut hdr_end = hdr_beg + idx.entry(cur).len as usize;

    let mut prev = hdr_beg + name_len; // the colon
    while prev < hdr_end {
        let mut att_beg = prev + 1;
        while att_beg < hdr_end && is_spht(at(buf, att_beg)) {
            att_beg += 1;
        }
        let mut att_end = att_beg;
        let mut equal = att_beg;
        while equal < hdr_end {
            let c = at(buf, equal);
            if c == b'=' || c == b';' || (comma_separated && c == b',') {
                break;
            }
            equal += 1;
            if !is_spht(c) {
                att_end = equal;
            }
        }

        let (val_beg, val_end, mut next) = if equal < hdr_end && at(buf, equal) == b'=' {
            let mut vb = equal + 1;
            while vb < hdr_end && is_spht(at(buf, vb)) {
                vb += 1;
            }
            let nx = find_value_end(buf, vb, hdr_end, comma_separated);
            let mut ve = nx;
            while ve > vb && is_spht(at(buf, ve - 1)) {
                ve -= 1;
            }
            (vb, ve, nx)
        } else {
            (equal, equal, equal)
        };

        // every pair is a candidate: attribute names such as path or
        // expires simply never collide with a persistence cookie name
        {
            if let Some(name) = capture.cookie_name.as_deref() {
                if out.captured.is_none()
                    && val_end - att_beg >= name.len()
                    && range_eq(buf, att_beg, name.as_bytes())
                {
                    let log_len = (val_end - att_beg).min(capture.cookie_len.max(name.len()));
                    out.captured = Some(range_string(buf, att_beg, log_len));
                }
            }

            if let Some(name) = be.session_cookie.as_deref() {
                if out.session_id.is_none()
                    && att_end - att_beg == name.len()
                    && range_eq(buf, att_beg, name.as_bytes())
                {
                    out.session_id = Some(range_string(buf, val_beg, val_end - val_beg));
                }
            }

            let name_matches = match be.name.as_deref() {
                Some(name) => {
                    att_end - att_beg == name.len() && range_eq(buf, att_beg, name.as_bytes())
                }
                None => false,
            };

            if name_matches {
                if be.mode == CookieMode::Insert && (!be.preserve || val_end == val_beg) {
                    // this name belongs to the proxy; drop the server's
                    // version, ours is inserted separately
                    let span = idx.line_span(cur);
                    let delta = buf.delete(buf.abs_of(hdr_beg), buf.abs_of(hdr_beg + span));
                    idx.unlink(prev_idx, cur);
                    msg.move_end(delta);
                    out.delta += delta;
                    out.status = ServerCookieStatus::Deleted;
                    return true;
                } else if be.mode == CookieMode::Rewrite {
                    if let Some(ck) = server.and_then(|s| s.cookie.as_deref()) {
                        let delta =
                            buf.replace(buf.abs_of(val_beg), buf.abs_of(val_end), ck.as_bytes());
                        next = (next as i32 + delta) as usize;
                        hdr_end = (hdr_end as i32 + delta) as usize;
                        idx.adjust_len(cur, delta);
                        msg.move_end(delta);
                        out.delta += delta;
                        out.status = ServerCookieStatus::Replaced;
                    } else {
                        out.status = ServerCookieStatus::Found;
                    }
                } else if be.mode == CookieMode::Prefix {
                    if let Some(ck) = server.and_then(|s| s.cookie.as_deref()) {
                        let mut prefix = Vec::with_capacity(ck.len() + 1);
                        prefix.extend_from_slice(ck.as_bytes());
                        prefix.push(COOKIE_DELIM);
                        if let Ok(delta) = buf.insert(buf.abs_of(val_beg), &prefix) {
                            next = (next as i32 + delta) as usize;
                            hdr_end = (hdr_end as i32 + delta) as usize;
                            idx.adjust_len(cur, delta);
                            msg.move_end(delta);
                            out.delta += delta;
                            out.status = ServerCookieStatus::Replaced;
                        }
                    } else {
                        out.status = ServerCookieStatus::Found;
                    }
                } else if out.status == ServerCookieStatus::None {
                    out.status = ServerCookieStatus::Found;
                }
            }
        }

        prev = next;
    }
    false
}

/// Builds the `Set-Cookie` header line inserted in insert mode, dates
/// included when maxidle/maxlife tracking is configured.
pub fn build_persistence_cookie(
    be: &CookieConfig,
    srv_cookie: &str,
    now: i64,
    first_date: i64,
) -> Option<String> {
    let name = be.name.as_deref()?;
    let mut value = String::from(srv_cookie);
    if be.maxidle != 0 || be.maxlife != 0 {
        value.push(COOKIE_DELIM_DATE as char);
        value.push_str(std::str::from_utf8(&s30tob64(quantize_date(now))).unwrap_or(""));
        if be.maxlife != 0 {
            let first = if first_date != 0 { first_date } else { now };
            value.push(COOKIE_DELIM_DATE as char);
            value.push_str(std::str::from_utf8(&s30tob64(quantize_date(first))).unwrap_or(""));
        }
    }
    Some(format!("Set-Cookie: {name}={value}; path=/\r\n"))
}

// cookie names are case-sensitive, unlike header names
fn range_eq(buf: &Buffer, from: usize, expected: &[u8]) -> bool {
    (0..expected.len()).all(|n| at(buf, from + n) == expected[n])
}

fn range_string(buf: &Buffer, from: usize, len: usize) -> String {
    let raw: Vec<u8> = (0..len).map(|n| at(buf, from + n)).collect();
    String::from_utf8_lossy(&raw).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::http::header::HeaderIndex;
    use crate::protocol::http::parser::{parse_message, HttpMsg, ParseStatus, ParserConfig};

    fn parsed(raw: &[u8]) -> (Buffer, HttpMsg, HeaderIndex) {
        let mut buf = Buffer::with_capacity_and_margin(1024, 128);
        assert_eq!(buf.write(raw), raw.len());
        let mut msg = if raw.starts_with(b"HTTP/") {
            HttpMsg::response()
        } else {
            HttpMsg::request()
        };
        let mut idx = HeaderIndex::with_capacity(16);
        let status = parse_message(&mut buf, &mut msg, &mut idx, &ParserConfig::default());
        assert_eq!(status, ParseStatus::Complete);
        (buf, msg, idx)
    }

    fn servers() -> Vec<ServerRef> {
        vec![
            ServerRef {
                id: "s1".into(),
                cookie: Some("s1".into()),
                up: true,
                maintenance: false,
            },
            ServerRef {
                id: "s2".into(),
                cookie: Some("s2".into()),
                up: false,
                maintenance: false,
            },
        ]
    }

    fn insert_indirect(name: &str) -> CookieConfig {
        CookieConfig {
            name: Some(name.into()),
            mode: CookieMode::Insert,
            indirect: true,
            ..CookieConfig::default()
        }
    }

    #[test]
    fn base64_date_roundtrip() {
        for v in [0u32, 1, 12345, 0x3fff_ffff] {
            let enc = s30tob64(v);
            assert_eq!(b64tos30(&enc), v as i64);
        }
        assert_eq!(b64tos30(b"!!!!!"), -1);
    }

    #[test]
    fn insert_indirect_strips_pair_but_keeps_others() {
        let raw = b"GET / HTTP/1.1\r\nHost: x\r\nCookie: $Version=1; SRVID=s1; other=v\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = insert_indirect("SRVID");
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        assert_eq!(out.status, ClientCookieStatus::Valid);
        assert_eq!(out.server_id.as_deref(), Some("s1"));
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Cookie: $Version=1; other=v\r\n"), "{text}");
    }

    #[test]
    fn sole_persistence_cookie_removes_whole_header() {
        let raw = b"GET / HTTP/1.1\r\nCookie: SRVID=s1\r\nHost: x\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let eoh_before = msg.eoh;
        let be = insert_indirect("SRVID");
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        assert_eq!(out.status, ClientCookieStatus::Valid);
        let text = buf.linearize_input();
        assert_eq!(&text, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(msg.eoh as i32, eoh_before as i32 + out.delta);
        assert_eq!(idx.used(), 1);
    }

    #[test]
    fn prefix_mode_strips_server_id() {
        let raw = b"GET / HTTP/1.1\r\nCookie: SRVID=s1~opaque-value\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Prefix,
            ..CookieConfig::default()
        };
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        assert_eq!(out.status, ClientCookieStatus::Valid);
        assert_eq!(out.server_id.as_deref(), Some("s1"));
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Cookie: SRVID=opaque-value\r\n"), "{text}");
    }

    #[test]
    fn unknown_server_marks_invalid() {
        let raw = b"GET / HTTP/1.1\r\nCookie: SRVID=nosuch\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Passive,
            ..CookieConfig::default()
        };
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        assert_eq!(out.status, ClientCookieStatus::Invalid);
        assert!(out.server_id.is_none());
    }

    #[test]
    fn down_server_reported() {
        let raw = b"GET / HTTP/1.1\r\nCookie: SRVID=s2\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Passive,
            ..CookieConfig::default()
        };
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        assert_eq!(out.status, ClientCookieStatus::Down);
    }

    #[test]
    fn equal_sign_spacing_is_normalized() {
        let raw = b"GET / HTTP/1.1\r\nCookie: name = value; SRVID=s1\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Passive,
            ..CookieConfig::default()
        };
        let _ = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Cookie: name=value; SRVID=s1\r\n"), "{text}");
    }

    #[test]
    fn capture_clones_first_match_only() {
        let raw = b"GET / HTTP/1.1\r\nCookie: lang=fr; lang=en\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let capture = CaptureConfig {
            cookie_name: Some("lang".into()),
            cookie_len: 32,
        };
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &CookieConfig::default(),
            &capture,
            &[],
            1_000_000,
        );
        assert_eq!(out.captured.as_deref(), Some("lang=fr"));
    }

    #[test]
    fn expired_cookie_treated_as_absent() {
        // last-seen date of 1000 (quantized), maxidle of 60s, now far later
        let date = s30tob64(quantize_date(1000));
        let raw = format!(
            "GET / HTTP/1.1\r\nCookie: SRVID=s1|{}\r\n\r\n",
            std::str::from_utf8(&date).unwrap()
        );
        let (mut buf, mut msg, mut idx) = parsed(raw.as_bytes());
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Passive,
            maxidle: 60,
            ..CookieConfig::default()
        };
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        assert_eq!(out.status, ClientCookieStatus::Expired);
        assert!(out.server_id.is_none());
        assert_eq!(out.first_date, 0);
        assert_eq!(out.last_date, 0);
    }

    #[test]
    fn future_dated_cookie_rejected() {
        let now = 1_000_000i64;
        let date = s30tob64(quantize_date(now + 200_000));
        let raw = format!(
            "GET / HTTP/1.1\r\nCookie: SRVID=s1|{}\r\n\r\n",
            std::str::from_utf8(&date).unwrap()
        );
        let (mut buf, mut msg, mut idx) = parsed(raw.as_bytes());
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Passive,
            maxidle: 3600,
            ..CookieConfig::default()
        };
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            now,
        );
        assert_eq!(out.status, ClientCookieStatus::Expired);
    }

    #[test]
    fn request_pass_is_idempotent() {
        let raw = b"GET / HTTP/1.1\r\nCookie: $Version=1; SRVID=s1; other=v\r\nHost: x\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = insert_indirect("SRVID");
        let _ = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        let after_first = buf.linearize_input();
        let out = manage_request_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            &servers(),
            1_000_000,
        );
        assert_eq!(buf.linearize_input(), after_first);
        assert_eq!(out.delta, 0);
    }

    #[test]
    fn response_insert_mode_deletes_server_cookie() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: SRVID=old; path=/\r\nContent-Length: 0\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = insert_indirect("SRVID");
        let mut out = ResponseCookieOutcome::default();
        manage_response_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            None,
            &mut out,
        );
        assert_eq!(out.status, ServerCookieStatus::Deleted);
        let text = buf.linearize_input();
        assert_eq!(
            &text,
            b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"
        );
        assert_eq!(idx.used(), 1);
    }

    #[test]
    fn response_rewrite_mode_swaps_value() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: SRVID=whatever; path=/\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Rewrite,
            ..CookieConfig::default()
        };
        let srv = ServerRef {
            id: "s1".into(),
            cookie: Some("s1".into()),
            up: true,
            maintenance: false,
        };
        let mut out = ResponseCookieOutcome::default();
        manage_response_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            Some(&srv),
            &mut out,
        );
        assert_eq!(out.status, ServerCookieStatus::Replaced);
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Set-Cookie: SRVID=s1; path=/\r\n"), "{text}");
    }

    #[test]
    fn response_prefix_mode_prepends_server_id() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: SRVID=app-value\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Prefix,
            ..CookieConfig::default()
        };
        let srv = ServerRef {
            id: "s1".into(),
            cookie: Some("s1".into()),
            up: true,
            maintenance: false,
        };
        let mut out = ResponseCookieOutcome::default();
        manage_response_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            Some(&srv),
            &mut out,
        );
        assert_eq!(out.status, ServerCookieStatus::Replaced);
        let text = buf.linearize_input();
        let text = String::from_utf8_lossy(&text);
        assert!(text.contains("Set-Cookie: SRVID=s1~app-value\r\n"), "{text}");
    }

    #[test]
    fn session_cookie_is_captured() {
        let raw = b"HTTP/1.1 200 OK\r\nSet-Cookie: JSESSIONID=abc123; path=/\r\n\r\n";
        let (mut buf, mut msg, mut idx) = parsed(raw);
        let be = CookieConfig {
            session_cookie: Some("JSESSIONID".into()),
            ..CookieConfig::default()
        };
        let mut out = ResponseCookieOutcome::default();
        manage_response_cookies(
            &mut buf,
            &mut msg,
            &mut idx,
            &be,
            &CaptureConfig::default(),
            None,
            &mut out,
        );
        assert_eq!(out.session_id.as_deref(), Some("abc123"));
    }

    #[test]
    fn persistence_cookie_build_includes_dates() {
        let be = CookieConfig {
            name: Some("SRVID".into()),
            mode: CookieMode::Insert,
            maxidle: 60,
            maxlife: 3600,
            ..CookieConfig::default()
        };
        let hdr = build_persistence_cookie(&be, "s1", 1_000_000, 0).unwrap();
        assert!(hdr.starts_with("Set-Cookie: SRVID=s1|"));
        assert!(hdr.ends_with("; path=/\r\n"));
        // two date fields
        assert_eq!(hdr.matches('|').count(), 2);
    }
}
