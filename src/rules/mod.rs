//! Rule engine: ordered per-hook rule lists with ACL conditions.
//!
//! Each rule couples an optional condition with an action. Conditions
//! evaluate to a tri-state result so TCP content inspection can suspend on
//! incomplete data: a `Miss` before the inspection deadline pauses the
//! hook, and counts as a failure once the deadline fired.

pub mod pattern;
pub mod sample;

use log::debug;

use crate::buffer::Buffer;
use crate::protocol::http::answers::{build_redirect, RedirectCode};
use crate::protocol::http::{add_header, Transaction};

pub use self::pattern::PatternMatcher;
pub use self::sample::{ConnInfo, FetchResult, Sample, SampleCtx, SampleFetch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclResult {
    Pass,
    Fail,
    /// not enough data to decide yet
    Miss,
}

impl AclResult {
    fn invert(self) -> AclResult {
        match self {
            AclResult::Pass => AclResult::Fail,
            AclResult::Fail => AclResult::Pass,
            AclResult::Miss => AclResult::Miss,
        }
    }
}

/// A fetch combined with a pattern set.
#[derive(Debug)]
pub struct Acl {
    pub fetch: SampleFetch,
    pub matcher: PatternMatcher,
    pub ignore_case: bool,
}

impl Acl {
    pub fn eval(&self, ctx: &SampleCtx) -> AclResult {
        match self.fetch.eval(ctx) {
            FetchResult::Missing => AclResult::Miss,
            FetchResult::Value(sample) => {
                if self.matcher.matches(&sample, self.ignore_case) {
                    AclResult::Pass
                } else {
                    AclResult::Fail
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    If,
    Unless,
}

/// All terms must pass; `unless` inverts the final result.
#[derive(Debug)]
pub struct Condition {
    pub polarity: Polarity,
    pub terms: Vec<Acl>,
}

impl Condition {
    pub fn eval(&self, ctx: &SampleCtx) -> AclResult {
        let mut result = AclResult::Pass;
        for term in &self.terms {
            match term.eval(ctx) {
                AclResult::Fail => {
                    result = AclResult::Fail;
                    break;
                }
                AclResult::Miss => result = AclResult::Miss,
                AclResult::Pass => {}
            }
        }
        if self.polarity == Polarity::Unless {
            result.invert()
        } else {
            result
        }
    }
}

/// Stick-counter slot selected by a TRACK action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSlot {
    Sc1,
    Sc2,
}

#[derive(Debug, Clone)]
pub enum RedirectTarget {
    /// replace the whole location
    Location(String),
    /// prefix the original target
    Prefix(String),
}

#[derive(Debug, Clone)]
pub struct RedirectRule {
    pub code: RedirectCode,
    pub target: RedirectTarget,
    pub drop_query: bool,
    pub append_slash: bool,
    pub set_cookie: Option<String>,
}

impl RedirectRule {
    pub fn build_location(&self, uri: &str) -> String {
        let mut kept = uri.to_string();
        if self.drop_query {
            if let Some(q) = kept.find('?') {
                kept.truncate(q);
            }
        }
        if self.append_slash && !kept.ends_with('/') {
            kept.push('/');
        }
        match &self.target {
            RedirectTarget::Location(loc) => loc.clone(),
            RedirectTarget::Prefix(prefix) => format!("{prefix}{kept}"),
        }
    }
}

#[derive(Debug)]
pub enum Action {
    Allow,
    Deny,
    /// hold the connection until the analysis deadline, then answer 500
    Tarpit,
    Auth {
        realm: String,
        proxy: bool,
    },
    Redirect(RedirectRule),
    AddHdr {
        name: String,
        value: String,
    },
    SetHdr {
        name: String,
        value: String,
    },
    TrackSc1(SampleFetch),
    TrackSc2(SampleFetch),
    SetBackend(String),
}

#[derive(Debug)]
pub struct Rule {
    pub cond: Option<Condition>,
    pub action: Action,
}

/// Ordered rule lists, one per hook point.
#[derive(Debug, Default)]
pub struct RuleEngine {
    pub tcp_accept: Vec<Rule>,
    pub tcp_content_request: Vec<Rule>,
    pub tcp_content_response: Vec<Rule>,
    pub http_request: Vec<Rule>,
    pub http_response: Vec<Rule>,
    pub redirect: Vec<Rule>,
}

/// Terminal decision of one hook's evaluation.
#[derive(Debug, PartialEq, Eq)]
pub enum Verdict {
    /// an ALLOW rule stopped the list
    Allow,
    /// the list ran out without a stopping rule
    Continue,
    /// block, answering 403 on requests and 502 on responses
    Deny,
    Tarpit,
    Auth {
        realm: String,
        proxy: bool,
    },
    /// complete generated redirect response
    Redirect(Vec<u8>),
    /// suspend until more data arrives or the inspection delay expires
    Miss,
}

#[derive(Debug, Default)]
pub struct RuleOutcome {
    pub verdict: Option<Verdict>,
    /// keys to hand to the stick-table subsystem
    pub tracks: Vec<(TrackSlot, Sample)>,
    pub backend: Option<String>,
}

impl RuleOutcome {
    fn stopped(verdict: Verdict, tracks: Vec<(TrackSlot, Sample)>, backend: Option<String>) -> RuleOutcome {
        RuleOutcome {
            verdict: Some(verdict),
            tracks,
            backend,
        }
    }
}

/// Runs one hook's rules in order. `request` selects which message header
/// actions edit; `final_stage` converts a Miss into a failed condition
/// once the inspection delay has expired.
pub fn process_rules(
    rules: &[Rule],
    txn: &mut Transaction,
    buf: &mut Buffer,
    conn: &ConnInfo,
    request: bool,
    final_stage: bool,
) -> RuleOutcome {
    let mut tracks = Vec::new();
    let mut backend = None;

    for rule in rules {
        let cond_result = match &rule.cond {
            None => AclResult::Pass,
            Some(cond) => {
                let ctx = SampleCtx {
                    conn,
                    txn,
                    buf,
                };
                cond.eval(&ctx)
            }
        };
        match cond_result {
            AclResult::Fail => continue,
            AclResult::Miss => {
                if final_stage {
                    // the inspection delay expired: a miss is a failure
                    continue;
                }
                return RuleOutcome::stopped(Verdict::Miss, tracks, backend);
            }
            AclResult::Pass => {}
        }

        match &rule.action {
            Action::Allow => return RuleOutcome::stopped(Verdict::Allow, tracks, backend),
            Action::Deny => {
                debug!("{} denied by rule", txn.request_id);
                return RuleOutcome::stopped(Verdict::Deny, tracks, backend);
            }
            Action::Tarpit => {
                txn.phase = crate::protocol::http::TxPhase::Tarpit;
                return RuleOutcome::stopped(Verdict::Tarpit, tracks, backend);
            }
            Action::Auth { realm, proxy } => {
                return RuleOutcome::stopped(
                    Verdict::Auth {
                        realm: realm.clone(),
                        proxy: *proxy,
                    },
                    tracks,
                    backend,
                )
            }
            Action::Redirect(redirect) => {
                let uri = txn.uri.clone().unwrap_or_default();
                let location = redirect.build_location(&uri);
                let keep_alive = !txn.conn_mode.closes_client();
                let body = build_redirect(
                    redirect.code,
                    &location,
                    redirect.set_cookie.as_deref(),
                    keep_alive,
                );
                return RuleOutcome::stopped(Verdict::Redirect(body), tracks, backend);
            }
            Action::AddHdr { name, value } => {
                let line = format!("{name}: {value}\r\n");
                let (msg, idx) = if request {
                    (&mut txn.req, &mut txn.hdr_idx)
                } else {
                    (&mut txn.rsp, &mut txn.hdr_idx)
                };
                if let Err(e) = add_header(buf, msg, idx, line.as_bytes()) {
                    debug!("add-header failed: {e}");
                }
            }
            Action::SetHdr { name, value } => {
                let (msg, idx) = if request {
                    (&mut txn.req, &mut txn.hdr_idx)
                } else {
                    (&mut txn.rsp, &mut txn.hdr_idx)
                };
                // remove every occurrence, then add ours
                let p = buf.input_begin();
                let mut ctx = idx.fresh_ctx();
                while idx.find(buf, p, name.as_bytes(), &mut ctx) {
                    let delta = idx.remove(buf, p, &mut ctx);
                    msg.move_end(delta);
                }
                let line = format!("{name}: {value}\r\n");
                if let Err(e) = add_header(buf, msg, idx, line.as_bytes()) {
                    debug!("set-header failed: {e}");
                }
            }
            Action::TrackSc1(fetch) | Action::TrackSc2(fetch) => {
                let slot = match &rule.action {
                    Action::TrackSc1(_) => TrackSlot::Sc1,
                    _ => TrackSlot::Sc2,
                };
                let ctx = SampleCtx { conn, txn, buf };
                if let FetchResult::Value(sample) = fetch.eval(&ctx) {
                    tracks.push((slot, sample));
                }
            }
            Action::SetBackend(name) => {
                if backend.is_none() {
                    backend = Some(name.clone());
                }
            }
        }
    }
    RuleOutcome {
        verdict: None,
        tracks,
        backend,
    }
}
