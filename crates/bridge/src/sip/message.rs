//! Minimal SIP message parsing/serialization (RFC 3261 subset).
//!
//! Only what the registrar and UAC need: REGISTER/INVITE/ACK/BYE requests,
//! status-line responses, and the handful of headers used to correlate a
//! request with its response (Call-ID, CSeq, Via, From, To, Contact).

use std::collections::HashMap;
use std::fmt::Write as _;

const CRLF: &str = "\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SipMethod {
    Register,
    Invite,
    Ack,
    Bye,
    Options,
}

impl SipMethod {
    fn as_str(self) -> &'static str {
        match self {
            SipMethod::Register => "REGISTER",
            SipMethod::Invite => "INVITE",
            SipMethod::Ack => "ACK",
            SipMethod::Bye => "BYE",
            SipMethod::Options => "OPTIONS",
        }
    }

    fn parse(s: &str) -> Result<Self, SipError> {
        match s {
            "REGISTER" => Ok(SipMethod::Register),
            "INVITE" => Ok(SipMethod::Invite),
            "ACK" => Ok(SipMethod::Ack),
            "BYE" => Ok(SipMethod::Bye),
            "OPTIONS" => Ok(SipMethod::Options),
            other => Err(SipError::UnsupportedMethod(other.to_string())),
        }
    }
}

/// Ordered header list: SIP allows repeated header names (e.g. multiple
/// `Via`), so this is a `Vec`, not a map. `get` returns the first match.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.0
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[derive(Debug, Clone)]
pub struct SipRequest {
    pub method: SipMethod,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone)]
pub struct SipResponse {
    pub version: String,
    pub status_code: u16,
    pub reason: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Debug, Clone)]
pub enum SipMessage {
    Request(SipRequest),
    Response(SipResponse),
}

impl SipMessage {
    pub fn call_id(&self) -> Option<&str> {
        self.headers().get("Call-ID")
    }

    pub fn cseq(&self) -> Option<&str> {
        self.headers().get("CSeq")
    }

    pub fn headers(&self) -> &Headers {
        match self {
            SipMessage::Request(r) => &r.headers,
            SipMessage::Response(r) => &r.headers,
        }
    }
}

impl SipRequest {
    pub fn new(method: SipMethod, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            version: "SIP/2.0".to_string(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.headers.push("Content-Length", body.len().to_string());
        self.body = body;
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} {} {}\r", self.method.as_str(), self.uri, self.version);
        for (name, value) in self.headers.iter() {
            let _ = write!(out, "{name}: {value}{CRLF}");
        }
        if self.headers.get("Content-Length").is_none() {
            let _ = write!(out, "Content-Length: {}{CRLF}", self.body.len());
        }
        out.push_str(CRLF);
        out.push_str(&self.body);
        out
    }
}

impl SipResponse {
    pub fn new(status_code: u16, reason: impl Into<String>) -> Self {
        Self {
            version: "SIP/2.0".to_string(),
            status_code,
            reason: reason.into(),
            headers: Headers::new(),
            body: String::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        let body = body.into();
        self.headers.push("Content-Length", body.len().to_string());
        self.body = body;
        self
    }

    pub fn serialize(&self) -> String {
        let mut out = String::new();
        let _ = write!(
            out,
            "{} {} {}{CRLF}",
            self.version, self.status_code, self.reason
        );
        for (name, value) in self.headers.iter() {
            let _ = write!(out, "{name}: {value}{CRLF}");
        }
        if self.headers.get("Content-Length").is_none() {
            let _ = write!(out, "Content-Length: {}{CRLF}", self.body.len());
        }
        out.push_str(CRLF);
        out.push_str(&self.body);
        out
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status_code)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SipError {
    #[error("empty datagram")]
    Empty,
    #[error("malformed start line: {0:?}")]
    MalformedStartLine(String),
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),
    #[error("malformed status code: {0:?}")]
    MalformedStatusCode(String),
    #[error("malformed header line: {0:?}")]
    MalformedHeaderLine(String),
}

/// Parses a full UDP datagram's worth of text into a request or response.
pub fn parse(datagram: &str) -> Result<SipMessage, SipError> {
    let mut lines = datagram.split("\r\n").peekable();
    let start_line = lines.next().ok_or(SipError::Empty)?;

    let (is_response, parts): (bool, Vec<&str>) = if start_line.starts_with("SIP/2.0") {
        (true, start_line.splitn(3, ' ').collect())
    } else {
        (false, start_line.splitn(3, ' ').collect())
    };
    if parts.len() != 3 {
        return Err(SipError::MalformedStartLine(start_line.to_string()));
    }

    let mut headers = Headers::new();
    let mut body_start_consumed = false;
    let mut body_lines = Vec::new();
    for line in lines {
        if body_start_consumed {
            body_lines.push(line);
            continue;
        }
        if line.is_empty() {
            body_start_consumed = true;
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| SipError::MalformedHeaderLine(line.to_string()))?;
        headers.push(name.trim(), value.trim());
    }
    let body = body_lines.join("\r\n");

    if is_response {
        let status_code: u16 = parts[1]
            .parse()
            .map_err(|_| SipError::MalformedStatusCode(parts[1].to_string()))?;
        Ok(SipMessage::Response(SipResponse {
            version: parts[0].to_string(),
            status_code,
            reason: parts[2].to_string(),
            headers,
            body,
        }))
    } else {
        let method = SipMethod::parse(parts[0])?;
        Ok(SipMessage::Request(SipRequest {
            method,
            uri: parts[1].to_string(),
            version: parts[2].to_string(),
            headers,
            body,
        }))
    }
}

/// Splits a `CSeq` header value ("42 INVITE") into (sequence, method).
pub fn parse_cseq(value: &str) -> Option<(u32, &str)> {
    let (seq, method) = value.trim().split_once(' ')?;
    Some((seq.parse().ok()?, method))
}

/// Parses the `tag=` parameter out of a From/To header value, if present.
pub fn parse_tag(header_value: &str) -> Option<&str> {
    header_value.split(';').find_map(|part| {
        let part = part.trim();
        part.strip_prefix("tag=")
    })
}

#[allow(dead_code)]
pub type HeaderMap = HashMap<String, String>;
