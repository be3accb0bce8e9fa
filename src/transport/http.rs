//! HTTP transport against a live server.
//!
//! Every operation is a GET on its path with the parameters in the query
//! string. Bodies are `;`-separated lines; a non-200 status carries
//! `code;description;message` in the first line. Version tokens travel in
//! response headers.

use md5::{Digest, Md5};
use parking_lot::Mutex;
use reqwest::blocking::{Client, Response};
use reqwest::StatusCode;

use super::{codes, ops, wire, Request, Rows, Transport};
use crate::config::ClientConfig;
use crate::{Error, Result};

pub struct HttpTransport {
    client: Client,
    base_url: String,
    username: String,
    /// MD5 hex digest; the plain password is never sent.
    password_hash: String,
    resend_on_invalid_session: bool,
    session_id: Mutex<Option<String>>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url(),
            username: config.username.clone(),
            password_hash: md5_hex(&config.password),
            resend_on_invalid_session: config.resend_on_invalid_session,
            session_id: Mutex::new(None),
        })
    }

    fn login(&self) -> Result<()> {
        let request = Request::new(ops::SERVER_LOGIN)
            .without_session()
            .param("user", &self.username)
            .param("password", &self.password_hash);
        let rows = self.execute(&request, None).map_err(|e| match e {
            Error::Server { code, message } => Error::Session(format!("login failed ({code}): {message}")),
            other => other,
        })?;
        let sid = wire::field(wire::first_row(&rows, "login")?, 0, "session id")?.to_string();
        tracing::debug!(url = %self.base_url, user = %self.username, "logged in");
        *self.session_id.lock() = Some(sid);
        Ok(())
    }

    fn sid(&self) -> Option<String> {
        self.session_id.lock().clone()
    }

    fn get(&self, request: &Request, sid: Option<&str>) -> Result<Response> {
        let url = request_url(&self.base_url, request, sid);
        self.client
            .get(&url)
            .send()
            .map_err(|e| Error::Transport(format!("{} failed: {e}", request.operation)))
    }

    fn execute(&self, request: &Request, sid: Option<&str>) -> Result<Rows> {
        let response = self.get(request, sid)?;
        let status = response.status();
        let token = token_header(&request.operation)
            .and_then(|name| response.headers().get(name))
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response
            .text()
            .map_err(|e| Error::Transport(format!("{}: unreadable body: {e}", request.operation)))?;

        if status != StatusCode::OK {
            return Err(error_from_body(status, &body));
        }
        if request.token_only {
            let token = token.ok_or_else(|| {
                Error::Protocol(format!("{} returned no version token header", request.operation))
            })?;
            return Ok(vec![vec![token]]);
        }
        let mut rows = wire::parse_body(&body);
        if request.with_token {
            let token = token.ok_or_else(|| {
                Error::Protocol(format!("{} returned no version token header", request.operation))
            })?;
            if let Some(first) = rows.first_mut() {
                first.push(token);
            }
        }
        Ok(rows)
    }
}

impl Transport for HttpTransport {
    fn open(&self) -> Result<()> {
        self.login()
    }

    fn close(&self, stop: bool) -> Result<()> {
        let Some(sid) = self.session_id.lock().take() else {
            return Ok(());
        };
        let request = Request::new(ops::SERVER_LOGOUT).flag("type", stop);
        self.execute(&request, Some(&sid)).map(|_| ())
    }

    fn send(&self, request: &Request) -> Result<Rows> {
        let sid = if request.with_session { self.sid() } else { None };
        if request.with_session && sid.is_none() {
            return Err(Error::Session("not logged in".into()));
        }
        match self.execute(request, sid.as_deref()) {
            Err(Error::Server { code, message })
                if code == codes::INVALID_SESSION && self.resend_on_invalid_session && request.with_session =>
            {
                tracing::warn!(operation = %request.operation, %message, "session expired, logging in again");
                self.login()?;
                let sid = self.sid();
                self.execute(request, sid.as_deref())
            }
            other => other,
        }
    }

    fn name(&self) -> &str {
        "http"
    }
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("logged_in", &self.session_id.lock().is_some())
            .finish()
    }
}

fn md5_hex(password: &str) -> String {
    Md5::digest(password.as_bytes()).iter().map(|b| format!("{b:02x}")).collect()
}

fn request_url(base_url: &str, request: &Request, sid: Option<&str>) -> String {
    let mut query = request.query_string();
    if let Some(sid) = sid {
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str("sid=");
        query.push_str(&wire::percent_encode(sid));
    }
    if query.is_empty() {
        format!("{base_url}{}", request.operation)
    } else {
        format!("{base_url}{}?{query}", request.operation)
    }
}

fn token_header(operation: &str) -> Option<&'static str> {
    match operation {
        ops::SERVER_INFO => Some("X-PALO-SV"),
        ops::DATABASE_INFO => Some("X-PALO-DB"),
        ops::DIMENSION_INFO => Some("X-PALO-DIM"),
        ops::CUBE_INFO => Some("X-PALO-CC"),
        _ => None,
    }
}

/// `code;description;message`
fn error_from_body(status: StatusCode, body: &str) -> Error {
    let rows = wire::parse_body(body);
    let Some(row) = rows.first() else {
        return Error::Transport(format!("HTTP {status} without body"));
    };
    match wire::parse_u32(row, 0, "error code") {
        Ok(code) => {
            let description = wire::field_or_empty(row, 1);
            let message = wire::field_or_empty(row, 2);
            let text = if message.is_empty() {
                description.to_string()
            } else {
                format!("{description}: {message}")
            };
            Error::server(code, text)
        }
        Err(_) => Error::Transport(format!("HTTP {status}: {}", body.trim())),
    }
}
