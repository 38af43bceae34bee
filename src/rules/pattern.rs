//! Pattern matchers applied to fetched samples.

use std::net::IpAddr;

use regex::bytes::Regex;

use crate::protocol::http::parser::compare_no_case;

use super::sample::Sample;

/// One comparison method with its compiled pattern set.
#[derive(Debug)]
pub enum PatternMatcher {
    /// exact string
    Str(Vec<Vec<u8>>),
    /// prefix
    Beg(Vec<Vec<u8>>),
    /// suffix
    End(Vec<Vec<u8>>),
    /// substring
    Sub(Vec<Vec<u8>>),
    /// substring delimited by `/` on both ends
    Dir(Vec<Vec<u8>>),
    /// substring delimited by `.` or `/` on both ends
    Dom(Vec<Vec<u8>>),
    /// regular expression
    Reg(Vec<Regex>),
    /// string length ranges
    Len(Vec<(i64, i64)>),
    /// address/mask pairs
    Ip(Vec<(IpAddr, u8)>),
    /// integer ranges
    Int(Vec<(i64, i64)>),
}

fn eq_bytes(a: &[u8], b: &[u8], icase: bool) -> bool {
    if icase {
        compare_no_case(a, b)
    } else {
        a == b
    }
}

fn find_sub(hay: &[u8], needle: &[u8], icase: bool) -> Option<usize> {
    if needle.is_empty() || hay.len() < needle.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&n| eq_bytes(&hay[n..n + needle.len()], needle, icase))
}

fn delimited_sub(hay: &[u8], needle: &[u8], delims: &[u8], icase: bool) -> bool {
    let mut from = 0;
    while let Some(pos) = find_sub(&hay[from..], needle, icase) {
        let start = from + pos;
        let end = start + needle.len();
        let left_ok = start == 0 || delims.contains(&hay[start - 1]);
        let right_ok = end == hay.len() || delims.contains(&hay[end]);
        if left_ok && right_ok {
            return true;
        }
        from = start + 1;
    }
    false
}

fn ip_in_net(addr: IpAddr, net: IpAddr, mask: u8) -> bool {
    match (addr, net) {
        (IpAddr::V4(a), IpAddr::V4(n)) => {
            let mask = if mask >= 32 {
                u32::MAX
            } else if mask == 0 {
                0
            } else {
                u32::MAX << (32 - mask)
            };
            u32::from(a) & mask == u32::from(n) & mask
        }
        (IpAddr::V6(a), IpAddr::V6(n)) => {
            let mask = if mask >= 128 {
                u128::MAX
            } else if mask == 0 {
                0
            } else {
                u128::MAX << (128 - mask)
            };
            u128::from(a) & mask == u128::from(n) & mask
        }
        _ => false,
    }
}

impl PatternMatcher {
    /// Matches a sample against the pattern set. `icase` folds ASCII case
    /// on the string matchers.
    pub fn matches(&self, sample: &Sample, icase: bool) -> bool {
        match self {
            PatternMatcher::Str(pats) => {
                let s = sample.as_bytes();
                pats.iter().any(|p| eq_bytes(&s, p, icase))
            }
            PatternMatcher::Beg(pats) => {
                let s = sample.as_bytes();
                pats.iter()
                    .any(|p| s.len() >= p.len() && eq_bytes(&s[..p.len()], p, icase))
            }
            PatternMatcher::End(pats) => {
                let s = sample.as_bytes();
                pats.iter()
                    .any(|p| s.len() >= p.len() && eq_bytes(&s[s.len() - p.len()..], p, icase))
            }
            PatternMatcher::Sub(pats) => {
                let s = sample.as_bytes();
                pats.iter().any(|p| find_sub(&s, p, icase).is_some())
            }
            PatternMatcher::Dir(pats) => {
                let s = sample.as_bytes();
                pats.iter().any(|p| delimited_sub(&s, p, b"/", icase))
            }
            PatternMatcher::Dom(pats) => {
                let s = sample.as_bytes();
                pats.iter().any(|p| delimited_sub(&s, p, b"./", icase))
            }
            PatternMatcher::Reg(pats) => {
                let s = sample.as_bytes();
                pats.iter().any(|re| re.is_match(&s))
            }
            PatternMatcher::Len(ranges) => {
                let len = sample.as_bytes().len() as i64;
                ranges.iter().any(|&(lo, hi)| len >= lo && len <= hi)
            }
            PatternMatcher::Ip(nets) => match sample.as_addr() {
                Some(addr) => nets.iter().any(|&(net, mask)| ip_in_net(addr, net, mask)),
                None => false,
            },
            PatternMatcher::Int(ranges) => match sample.as_int() {
                Some(v) => ranges.iter().any(|&(lo, hi)| v >= lo && v <= hi),
                None => false,
            },
        }
    }
}

/// Parses an `addr[/mask]` pattern.
pub fn parse_ip_pattern(text: &str) -> Option<(IpAddr, u8)> {
    match text.split_once('/') {
        Some((addr, mask)) => {
            let addr: IpAddr = addr.parse().ok()?;
            let mask: u8 = mask.parse().ok()?;
            Some((addr, mask))
        }
        None => {
            let addr: IpAddr = text.parse().ok()?;
            let mask = if addr.is_ipv4() { 32 } else { 128 };
            Some((addr, mask))
        }
    }
}

/// Parses an `N` or `N:M` integer range.
pub fn parse_int_pattern(text: &str) -> Option<(i64, i64)> {
    match text.split_once(':') {
        Some((lo, hi)) => Some((lo.parse().ok()?, hi.parse().ok()?)),
        None => {
            let v: i64 = text.parse().ok()?;
            Some((v, v))
        }
    }
}
