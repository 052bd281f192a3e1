//! SIP Registrar: accepts REGISTER requests from doorbell devices and keeps
//! a binding table of `contact token -> network source address`, rewriting
//! the Contact the device advertised to whatever source address the
//! REGISTER actually arrived from (the device is almost always behind NAT).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;

use super::message::{SipMessage, SipMethod, SipRequest, SipResponse, parse};

#[derive(Debug, Clone)]
pub struct Binding {
    /// Where REGISTER actually came from — used as the real Contact when we
    /// send the device an INVITE, since its advertised Contact is usually a
    /// private address behind NAT.
    pub source: SocketAddr,
    pub expires_at: Instant,
}

impl Binding {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Keyed by the registering user part (e.g. `doorbell` out of
/// `sip:doorbell@sipstacks.com`).
#[derive(Default)]
pub struct Registrar {
    bindings: DashMap<String, Binding>,
}

impl Registrar {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn lookup(&self, user: &str) -> Option<Binding> {
        self.bindings.get(user).map(|b| b.clone())
    }

    /// Drops bindings whose TTL has elapsed. Returns the users removed.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let expired: Vec<String> = self
            .bindings
            .iter()
            .filter(|entry| entry.value().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for user in &expired {
            self.bindings.remove(user);
        }
        expired
    }

    /// Handles an incoming REGISTER, updating the binding table and
    /// producing the 200 OK (or 400) response to send back.
    pub fn handle_register(
        &self,
        req: &SipRequest,
        source: SocketAddr,
        default_ttl: Duration,
    ) -> SipResponse {
        let Some(contact) = req.headers.get("Contact") else {
            return error_response(req, 400, "Missing Contact");
        };
        let Some(user) = extract_user(contact).or_else(|| extract_user(&req.uri)) else {
            return error_response(req, 400, "Unparseable Contact/Request-URI");
        };

        let requested = req
            .headers
            .get("Expires")
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(default_ttl);
        let expires = requested.min(default_ttl);

        if expires.is_zero() {
            self.bindings.remove(&user);
            tracing::info!(%user, %source, "REGISTER de-registration");
            return ok_response(req, 0);
        }

        self.bindings.insert(
            user.clone(),
            Binding {
                source,
                expires_at: Instant::now() + expires,
            },
        );
        tracing::info!(%user, %source, expires_secs = expires.as_secs(), "registered binding");

        ok_response(req, expires.as_secs())
    }
}

fn ok_response(req: &SipRequest, expires_secs: u64) -> SipResponse {
    let mut resp = SipResponse::new(200, "OK");
    copy_dialog_headers(req, &mut resp);
    resp.headers.push("Expires", expires_secs.to_string());
    resp
}

fn error_response(req: &SipRequest, code: u16, reason: &'static str) -> SipResponse {
    let mut resp = SipResponse::new(code, reason);
    copy_dialog_headers(req, &mut resp);
    resp
}

fn copy_dialog_headers(req: &SipRequest, resp: &mut SipResponse) {
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = req.headers.get(name) {
            resp.headers.push(name, value);
        }
    }
}

/// Pulls the user part out of a SIP URI like `<sip:doorbell@host:port>` or
/// `sip:doorbell@host`.
fn extract_user(uri_or_header: &str) -> Option<String> {
    let start = uri_or_header.find("sip:")?;
    let rest = &uri_or_header[start + 4..];
    let user_end = rest.find(['@', ';', '>'])?;
    let user = &rest[..user_end];
    if user.is_empty() || rest.as_bytes().get(user_end) != Some(&b'@') {
        return None;
    }
    Some(user.to_string())
}

/// Parses a raw datagram and dispatches it if it's a REGISTER, returning
/// the serialized response to send back. Returns `None` for anything that
/// isn't a REGISTER request (the caller routes those elsewhere).
pub fn try_handle_datagram(
    registrar: &Registrar,
    datagram: &str,
    source: SocketAddr,
    default_ttl: Duration,
) -> Option<String> {
    let msg = parse(datagram).ok()?;
    match msg {
        SipMessage::Request(req) if req.method == SipMethod::Register => {
            Some(registrar.handle_register(&req, source, default_ttl).serialize())
        }
        _ => None,
    }
}
