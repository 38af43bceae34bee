//! Canned HTTP answers and builders for generated responses.
//!
//! Every canned message carries `Connection: close` and a minimal HTML
//! body; they are emitted verbatim when the proxy answers in place of a
//! server. Redirects and authentication challenges are built on demand
//! since they interpolate transaction data.

use std::collections::HashMap;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AnswerStatus {
    Answer200,
    Answer400,
    Answer403,
    Answer408,
    Answer500,
    Answer502,
    Answer503,
    Answer504,
}

impl From<AnswerStatus> for u16 {
    fn from(a: AnswerStatus) -> u16 {
        match a {
            AnswerStatus::Answer200 => 200,
            AnswerStatus::Answer400 => 400,
            AnswerStatus::Answer403 => 403,
            AnswerStatus::Answer408 => 408,
            AnswerStatus::Answer500 => 500,
            AnswerStatus::Answer502 => 502,
            AnswerStatus::Answer503 => 503,
            AnswerStatus::Answer504 => 504,
        }
    }
}

fn canned(status: u16, title: &str, body: &str) -> Rc<Vec<u8>> {
    Rc::new(
        format!(
            "HTTP/1.0 {status} {title}\r\n\
             Cache-Control: no-cache\r\n\
             Connection: close\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <html><body><h1>{status} {title}</h1>\n{body}\n</body></html>\n"
        )
        .into_bytes(),
    )
}

/// The default answer set, shared by every transaction of a listener.
pub struct HttpAnswers {
    default: HashMap<AnswerStatus, Rc<Vec<u8>>>,
    /// per-backend 503 overrides
    custom_503: HashMap<String, Rc<Vec<u8>>>,
}

impl HttpAnswers {
    pub fn new() -> HttpAnswers {
        let mut default = HashMap::new();
        default.insert(
            AnswerStatus::Answer200,
            canned(200, "OK", "Service ready."),
        );
        default.insert(
            AnswerStatus::Answer400,
            canned(400, "Bad request", "Your browser sent an invalid request."),
        );
        default.insert(
            AnswerStatus::Answer403,
            canned(
                403,
                "Forbidden",
                "Request forbidden by administrative rules.",
            ),
        );
        default.insert(
            AnswerStatus::Answer408,
            canned(
                408,
                "Request Time-out",
                "Your browser didn't send a complete request in time.",
            ),
        );
        default.insert(
            AnswerStatus::Answer500,
            canned(500, "Server Error", "An internal server error occurred."),
        );
        default.insert(
            AnswerStatus::Answer502,
            canned(
                502,
                "Bad Gateway",
                "The server returned an invalid or incomplete response.",
            ),
        );
        default.insert(
            AnswerStatus::Answer503,
            canned(
                503,
                "Service Unavailable",
                "No server is available to handle this request.",
            ),
        );
        default.insert(
            AnswerStatus::Answer504,
            canned(
                504,
                "Gateway Time-out",
                "The server didn't respond in time.",
            ),
        );
        HttpAnswers {
            default,
            custom_503: HashMap::new(),
        }
    }

    pub fn set_custom_503(&mut self, backend_id: &str, answer: Vec<u8>) {
        self.custom_503.insert(backend_id.to_string(), Rc::new(answer));
    }

    pub fn remove_custom_503(&mut self, backend_id: &str) {
        self.custom_503.remove(backend_id);
    }

    pub fn get(&self, answer: AnswerStatus, backend_id: Option<&str>) -> Rc<Vec<u8>> {
        if answer == AnswerStatus::Answer503 {
            if let Some(custom) = backend_id.and_then(|id| self.custom_503.get(id)) {
                return custom.clone();
            }
        }
        self.default[&answer].clone()
    }
}

impl Default for HttpAnswers {
    fn default() -> HttpAnswers {
        HttpAnswers::new()
    }
}

/// 401/407 challenge with the realm interpolated.
pub fn auth_challenge(proxy_auth: bool, realm: &str) -> Vec<u8> {
    let (status, title, header) = if proxy_auth {
        (407, "Unauthorized", "Proxy-Authenticate")
    } else {
        (401, "Unauthorized", "WWW-Authenticate")
    };
    format!(
        "HTTP/1.0 {status} {title}\r\n\
         Cache-Control: no-cache\r\n\
         Connection: close\r\n\
         {header}: Basic realm=\"{realm}\"\r\n\
         Content-Type: text/html\r\n\
         \r\n\
         <html><body><h1>{status} {title}</h1>\nYou need a valid user and password to access this content.\n</body></html>\n"
    )
    .into_bytes()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectCode {
    MovedPermanently,
    Found,
    SeeOther,
}

impl RedirectCode {
    fn line(&self) -> &'static str {
        match self {
            RedirectCode::MovedPermanently => "301 Moved Permanently",
            RedirectCode::Found => "302 Found",
            RedirectCode::SeeOther => "303 See Other",
        }
    }
}

/// Builds a complete redirect response. `keep_alive` selects the
/// Connection header; the caller knows whether the transaction survives.
pub fn build_redirect(
    code: RedirectCode,
    location: &str,
    set_cookie: Option<&str>,
    keep_alive: bool,
) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 {}\r\n\
         Cache-Control: no-cache\r\n\
         Content-length: 0\r\n\
         Location: {location}\r\n",
        code.line()
    );
    if let Some(cookie) = set_cookie {
        out.push_str(&format!("Set-Cookie: {cookie}\r\n"));
    }
    if keep_alive {
        out.push_str("Connection: keep-alive\r\n");
    } else {
        out.push_str("Connection: close\r\n");
    }
    out.push_str("\r\n");
    out.into_bytes()
}
