//! Stats admin protocol: the state-changing half of the statistics page.
//!
//! A `POST` to the stats URI carries an `application/x-www-form-urlencoded`
//! body selecting a backend (`b`), an action, and one or more servers
//! (`s`). The answer is always a 303 redirect back to the stats URI with
//! the outcome appended as `;st=<code>`.

use nom::{
    bytes::complete::{tag, take_while},
    combinator::opt,
    multi::separated_list0,
    sequence::{pair, preceded},
    IResult,
};

use crate::config::ServerRef;
use crate::protocol::http::answers::{build_redirect, RedirectCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAction {
    Disable,
    Enable,
    Stop,
    Start,
    Shutdown,
}

impl AdminAction {
    fn from_name(name: &[u8]) -> Option<AdminAction> {
        match name {
            b"disable" => Some(AdminAction::Disable),
            b"enable" => Some(AdminAction::Enable),
            b"stop" => Some(AdminAction::Stop),
            b"start" => Some(AdminAction::Start),
            b"shutdown" => Some(AdminAction::Shutdown),
            _ => None,
        }
    }
}

/// Decoded admin form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdminRequest {
    pub backend: Option<String>,
    pub action: Option<AdminAction>,
    pub servers: Vec<String>,
    /// an `action` key carried an unrecognized value
    pub bad_action: bool,
}

/// Outcome code embedded in the redirect location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOutcome {
    /// the action was refused
    Deny,
    /// every named server was updated
    Done,
    /// the form could not be interpreted
    Errp,
    /// too many servers named at once
    Excd,
    /// no server field was present
    None,
    /// only part of the named servers were updated
    Part,
    /// the backend is unknown
    Unkn,
}

impl AdminOutcome {
    pub fn code(&self) -> &'static str {
        match self {
            AdminOutcome::Deny => "DENY",
            AdminOutcome::Done => "DONE",
            AdminOutcome::Errp => "ERRP",
            AdminOutcome::Excd => "EXCD",
            AdminOutcome::None => "NONE",
            AdminOutcome::Part => "PART",
            AdminOutcome::Unkn => "UNKN",
        }
    }
}

fn is_form_char(c: u8) -> bool {
    c != b'=' && c != b'&'
}

fn form_pair(i: &[u8]) -> IResult<&[u8], (&[u8], Option<&[u8]>)> {
    pair(
        take_while(is_form_char),
        opt(preceded(tag("="), take_while(is_form_char))),
    )(i)
}

fn form_pairs(i: &[u8]) -> IResult<&[u8], Vec<(&[u8], Option<&[u8]>)>> {
    separated_list0(tag("&"), form_pair)(i)
}

fn url_decode(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut n = 0;
    while n < raw.len() {
        match raw[n] {
            b'+' => out.push(b' '),
            b'%' if n + 2 < raw.len() => {
                let hex = std::str::from_utf8(&raw[n + 1..n + 3])
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        n += 2;
                    }
                    None => out.push(b'%'),
                }
            }
            c => out.push(c),
        }
        n += 1;
    }
    out
}

/// Parses the urlencoded body. Unknown keys are ignored.
pub fn parse_admin_form(body: &[u8]) -> AdminRequest {
    let mut req = AdminRequest::default();
    let pairs = match form_pairs(body) {
        Ok((_, pairs)) => pairs,
        Err(_) => return req,
    };
    for (key, value) in pairs {
        let value = value.map(url_decode).unwrap_or_default();
        match key {
            b"b" => req.backend = Some(String::from_utf8_lossy(&value).into_owned()),
            b"action" => match AdminAction::from_name(&value) {
                Some(action) => req.action = Some(action),
                None => req.bad_action = true,
            },
            b"s" => req
                .servers
                .push(String::from_utf8_lossy(&value).into_owned()),
            _ => {}
        }
    }
    req
}

/// Upper bound on servers altered by one POST.
pub const MAX_ADMIN_SERVERS: usize = 100;

/// Applies an admin request to the server table of the matching backend.
/// `backend_id` is the backend the embedding proxy resolved (or not).
pub fn apply_admin(
    req: &AdminRequest,
    backend_id: Option<&str>,
    servers: &mut [ServerRef],
    allowed: bool,
) -> AdminOutcome {
    if !allowed {
        return AdminOutcome::Deny;
    }
    if req.action.is_none() || req.bad_action || req.backend.is_none() {
        return AdminOutcome::Errp;
    }
    if req.backend.as_deref() != backend_id {
        return AdminOutcome::Unkn;
    }
    if req.servers.is_empty() {
        return AdminOutcome::None;
    }
    if req.servers.len() > MAX_ADMIN_SERVERS {
        return AdminOutcome::Excd;
    }

    let action = req.action.unwrap_or(AdminAction::Disable);
    let mut applied = 0;
    for name in &req.servers {
        if let Some(server) = servers.iter_mut().find(|s| &s.id == name) {
            match action {
                AdminAction::Disable => server.maintenance = true,
                AdminAction::Enable => server.maintenance = false,
                AdminAction::Stop | AdminAction::Shutdown => server.up = false,
                AdminAction::Start => server.up = true,
            }
            applied += 1;
        }
    }
    if applied == req.servers.len() {
        AdminOutcome::Done
    } else if applied > 0 {
        AdminOutcome::Part
    } else {
        AdminOutcome::Unkn
    }
}

/// The 303 answer sent back after an admin POST.
pub fn build_admin_redirect(stats_uri: &str, outcome: AdminOutcome, keep_alive: bool) -> Vec<u8> {
    let location = format!("{stats_uri};st={}", outcome.code());
    build_redirect(RedirectCode::SeeOther, &location, None, keep_alive)
}
