//! Ordered index over the header lines of a parsed message.
//!
//! The index is a dense arena of small entries linked in wire order, with a
//! sentinel at slot 0. Entries only store lengths; all positions are
//! recomputed by walking the chain from the start of the message, so
//! in-place buffer edits never invalidate the index. Mutating operations
//! maintain the affected entry lengths themselves and return the
//! displacement; applying it to the message's end-of-headers offset (via
//! `HttpMsg::move_end`) is the caller's job.

use crate::buffer::Buffer;

use super::parser::compare_no_case;

fn is_lws(c: u8) -> bool {
    c == b' ' || c == b'\t'
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum IndexError {
    #[error("no free entry left in the header index")]
    NoSpace,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HdrEntry {
    /// length of the header line, start of line to last non-CR/LF byte
    pub len: u16,
    /// 1 when the line ends with CRLF, 0 for a bare LF
    pub cr: u8,
    /// arena slot of the next entry in wire order
    pub next: u16,
}

/// Iteration context over one header occurrence. All offsets are relative
/// to the start of the message except `val`, `vlen` and `tws` which are
/// relative to `sol`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HdrCtx {
    /// arena slot of the current line, 0 before the first find
    pub idx: usize,
    /// arena slot of the predecessor line
    pub prev: usize,
    /// start of the current line, relative to start of message
    pub sol: usize,
    /// offset of the current value within the line; 0 means "no current
    /// value", which makes a fresh or line-removed context resume on the
    /// next line
    pub val: usize,
    /// value length, trailing whitespace excluded
    pub vlen: usize,
    /// trailing whitespace after the value
    pub tws: usize,
    /// offset of the separator preceding the value (colon or comma)
    pub del: usize,
}

pub struct HeaderIndex {
    entries: Vec<HdrEntry>,
    used: usize,
    tail: usize,
}

impl HeaderIndex {
    pub fn with_capacity(capacity: usize) -> HeaderIndex {
        HeaderIndex {
            entries: vec![HdrEntry::default(); capacity + 1],
            used: 0,
            tail: 0,
        }
    }

    pub fn reset(&mut self) {
        for e in self.entries.iter_mut() {
            *e = HdrEntry::default();
        }
        self.used = 0;
        self.tail = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn entry(&self, idx: usize) -> &HdrEntry {
        &self.entries[idx]
    }

    /// Records the start line: its length (CR/LF excluded) and whether it
    /// ended with a CRLF. The first header starts at `len + cr + 1`.
    pub fn start(&mut self, start_line_len: usize, has_cr: bool) {
        self.entries[0] = HdrEntry {
            len: start_line_len as u16,
            cr: has_cr as u8,
            next: 0,
        };
        self.tail = 0;
        self.used = 0;
    }

    /// Offset of the first header line relative to the start of message.
    pub fn first_pos(&self) -> usize {
        let s = &self.entries[0];
        s.len as usize + s.cr as usize + 1
    }

    /// Appends an entry after `after` (pass [`tail`](Self::tail) to append
    /// in wire order). Free slots are found by scanning for `len == 0`.
    pub fn add(&mut self, len: usize, has_cr: bool, after: usize) -> Result<usize, IndexError> {
        debug_assert!(len > 0, "an indexed header line cannot be empty");
        let slot = self.entries[1..]
            .iter()
            .position(|e| e.len == 0)
            .map(|n| n + 1)
            .ok_or(IndexError::NoSpace)?;
        self.entries[slot] = HdrEntry {
            len: len as u16,
            cr: has_cr as u8,
            next: self.entries[after].next,
        };
        self.entries[after].next = slot as u16;
        if self.tail == after {
            self.tail = slot;
        }
        self.used += 1;
        Ok(slot)
    }

    /// A context that makes [`find`](Self::find) start from the first line.
    pub fn fresh_ctx(&self) -> HdrCtx {
        HdrCtx {
            sol: self.first_pos(),
            ..HdrCtx::default()
        }
    }

    /// Finds the next occurrence of `name`, iterating comma-separated
    /// values within a line before moving to the following lines. `msg_abs`
    /// is the absolute buffer offset of the start of the message.
    ///
    /// Returns `true` and updates `ctx` in place when a value was found.
    pub fn find(&self, buf: &Buffer, msg_abs: usize, name: &[u8], ctx: &mut HdrCtx) -> bool {
        let mut cur;
        let mut prev;
        let mut sol;

        if ctx.idx != 0 && ctx.val != 0 {
            // resume: next value on the same line first
            if self.iterate_value(buf, msg_abs, ctx) {
                return true;
            }
            prev = ctx.idx;
            sol = ctx.sol + self.line_span(ctx.idx);
            cur = self.entries[ctx.idx].next as usize;
        } else {
            // fresh context, or the current line was removed: the next line
            // now starts where the old one did
            prev = ctx.idx;
            sol = ctx.sol;
            cur = self.entries[ctx.idx].next as usize;
        }

        while cur != 0 {
            let len = self.entries[cur].len as usize;
            if name.len() + 1 <= len
                && buf.read_at(buf.add_ofs(msg_abs, sol + name.len())) == b':'
                && self.name_matches(buf, msg_abs, sol, name)
            {
                ctx.idx = cur;
                ctx.prev = prev;
                ctx.sol = sol;
                ctx.del = name.len();
                let mut sov = name.len() + 1;
                while sov < len && is_lws(self.at(buf, msg_abs, sol + sov)) {
                    sov += 1;
                }
                let (vlen, tws) = self.value_bounds(buf, msg_abs, sol, sov, len);
                ctx.val = sov;
                ctx.vlen = vlen;
                ctx.tws = tws;
                return true;
            }
            prev = cur;
            sol += self.line_span(cur);
            cur = self.entries[cur].next as usize;
        }
        false
    }

    /// Advances `ctx` to the next comma-separated value on the same line.
    /// The value end honors quoted strings and backslash escapes
    /// (RFC 2616 §2.2); the value start skips linear whitespace.
    pub fn iterate_value(&self, buf: &Buffer, msg_abs: usize, ctx: &mut HdrCtx) -> bool {
        let len = self.entries[ctx.idx].len as usize;
        let mut sov = ctx.val + ctx.vlen + ctx.tws;
        while sov < len && is_lws(self.at(buf, msg_abs, ctx.sol + sov)) {
            sov += 1;
        }
        if sov < len && self.at(buf, msg_abs, ctx.sol + sov) == b',' {
            ctx.del = sov;
            sov += 1;
            while sov < len && is_lws(self.at(buf, msg_abs, ctx.sol + sov)) {
                sov += 1;
            }
        } else if ctx.vlen != 0 || sov >= len {
            // a non-empty value must be followed by a comma to continue
            return false;
        }
        let (vlen, tws) = self.value_bounds(buf, msg_abs, ctx.sol, sov, len);
        ctx.val = sov;
        ctx.vlen = vlen;
        ctx.tws = tws;
        true
    }

    /// Removes the current value. When it is the sole value of the line the
    /// whole line goes, CR/LF included, and the entry is unlinked. Returns
    /// the displacement; entry lengths are maintained internally, the
    /// caller applies the displacement to its end-of-headers offset.
    pub fn remove(&mut self, buf: &mut Buffer, msg_abs: usize, ctx: &mut HdrCtx) -> i32 {
        if ctx.idx == 0 {
            return 0;
        }
        let len = self.entries[ctx.idx].len as usize;
        let vend = ctx.val + ctx.vlen + ctx.tws;
        let followed_by_comma = vend < len && self.at(buf, msg_abs, ctx.sol + vend) == b',';
        let first_value = self.at(buf, msg_abs, ctx.sol + ctx.del) == b':';

        if first_value && !followed_by_comma {
            // sole value: drop the entire line
            let span = self.line_span(ctx.idx);
            let from = buf.add_ofs(msg_abs, ctx.sol);
            let to = buf.add_ofs(msg_abs, ctx.sol + span);
            let delta = buf.delete(from, to);
            self.unlink(ctx.prev, ctx.idx);
            ctx.idx = ctx.prev;
            ctx.val = 0;
            ctx.vlen = 0;
            ctx.tws = 0;
            return delta;
        }

        let (from_rel, to_rel) = if followed_by_comma {
            // value plus the following comma
            (ctx.val, vend + 1)
        } else {
            // last of several: preceding comma up to the end of the value
            (ctx.del, vend)
        };
        let from = buf.add_ofs(msg_abs, ctx.sol + from_rel);
        let to = buf.add_ofs(msg_abs, ctx.sol + to_rel);
        let delta = buf.delete(from, to);
        self.entries[ctx.idx].len = (len as i32 + delta) as u16;
        ctx.val = from_rel.max(1);
        ctx.vlen = 0;
        ctx.tws = 0;
        delta
    }

    /// Applies a buffer displacement to one entry's length, after an edit
    /// performed directly on the line's bytes.
    pub fn adjust_len(&mut self, idx: usize, delta: i32) {
        let len = self.entries[idx].len as i32 + delta;
        debug_assert!(len > 0, "an entry length cannot become negative");
        self.entries[idx].len = len as u16;
    }

    /// Unlinks `idx`, known to follow `prev` in wire order, and frees its
    /// slot. The caller has already deleted the line bytes.
    pub fn unlink(&mut self, prev: usize, idx: usize) {
        self.entries[prev].next = self.entries[idx].next;
        if self.tail == idx {
            self.tail = prev;
        }
        self.entries[idx] = HdrEntry::default();
        self.used -= 1;
    }

    /// Length of a line including its CR/LF terminator.
    pub fn line_span(&self, idx: usize) -> usize {
        let e = &self.entries[idx];
        e.len as usize + e.cr as usize + 1
    }

    fn at(&self, buf: &Buffer, msg_abs: usize, rel: usize) -> u8 {
        buf.read_at(buf.add_ofs(msg_abs, rel))
    }

    fn name_matches(&self, buf: &Buffer, msg_abs: usize, sol: usize, name: &[u8]) -> bool {
        for (n, &expected) in name.iter().enumerate() {
            if !compare_no_case(&[self.at(buf, msg_abs, sol + n)], &[expected]) {
                return false;
            }
        }
        true
    }

    /// Value end scan from `sov`: stops at an unquoted comma, then counts
    /// trailing whitespace backwards.
    fn value_bounds(
        &self,
        buf: &Buffer,
        msg_abs: usize,
        sol: usize,
        sov: usize,
        len: usize,
    ) -> (usize, usize) {
        let mut pos = sov;
        let mut quoted = false;
        let mut escaped = false;
        while pos < len {
            let c = self.at(buf, msg_abs, sol + pos);
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
            } else if c == b',' {
                break;
            }
            pos += 1;
        }
        let mut end = pos;
        let mut tws = 0;
        while end > sov && is_lws(self.at(buf, msg_abs, sol + end - 1)) {
            end -= 1;
            tws += 1;
        }
        (end - sov, tws)
    }
}
