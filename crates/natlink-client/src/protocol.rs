//! Outbound wire encoding and the INFO/CONNECT JSON bodies.

use crate::config::ClientOptions;
use crate::endpoint::{AuthMode, ServerEndpoint};
use crate::error::Result;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

/// Line terminator.
pub const CRLF: &[u8] = b"\r\n";
/// Keep-alive ping.
pub const PING: &[u8] = b"PING\r\n";
/// Keep-alive answer.
pub const PONG: &[u8] = b"PONG\r\n";

/// Language reported in CONNECT.
pub const LANG: &str = "rust";
/// Protocol level reported in CONNECT.
pub const PROTOCOL_VERSION: u8 = 1;

/// Server capabilities announced with `INFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerInfo {
    /// Unique id of the server.
    pub server_id: String,
    /// Host the server listens on.
    pub host: String,
    /// Port the server listens on.
    pub port: u16,
    /// Server version string.
    pub version: String,
    /// Whether CONNECT must carry credentials.
    pub auth_required: bool,
    /// Whether the connection must be upgraded to TLS.
    pub tls_required: bool,
    /// Largest accepted payload in bytes.
    pub max_payload: u64,
    /// Peers the client may fail over to.
    pub connect_urls: Vec<String>,
}

impl ServerInfo {
    /// Parses the JSON argument of an INFO line.
    pub fn parse(json: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(json)?)
    }
}

/// Client handshake body sent with `CONNECT`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo<'a> {
    verbose: bool,
    pedantic: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    user: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pass: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_token: Option<&'a str>,
    tls_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    lang: &'static str,
    version: &'static str,
    protocol: u8,
}

impl<'a> ConnectInfo<'a> {
    /// Builds the handshake for `endpoint`.
    pub fn new(options: &'a ClientOptions, endpoint: &'a ServerEndpoint) -> Self {
        let (user, pass, auth_token) = match endpoint.auth() {
            AuthMode::Anonymous => (None, None, None),
            AuthMode::Credentials { user, password } => {
                (Some(user.as_str()), Some(password.as_str()), None)
            }
            AuthMode::Token(token) => (None, None, Some(token.as_str())),
        };
        Self {
            verbose: options.verbose,
            pedantic: options.pedantic,
            user,
            pass,
            auth_token,
            tls_required: endpoint.is_secured(),
            name: options.name.as_deref(),
            lang: LANG,
            version: env!("CARGO_PKG_VERSION"),
            protocol: PROTOCOL_VERSION,
        }
    }

    /// `CONNECT {json}\r\n`.
    pub fn to_line(&self) -> Result<Bytes> {
        let json = serde_json::to_vec(self)?;
        let mut buf = BytesMut::with_capacity(json.len() + 10);
        buf.put_slice(b"CONNECT ");
        buf.put_slice(&json);
        buf.put_slice(CRLF);
        Ok(buf.freeze())
    }
}

/// `PUB subject [reply] len\r\n`.
pub fn pub_header(subject: &str, reply_to: Option<&str>, len: usize) -> Bytes {
    let mut buf = BytesMut::with_capacity(subject.len() + 32);
    buf.put_slice(b"PUB ");
    buf.put_slice(subject.as_bytes());
    buf.put_u8(b' ');
    if let Some(reply) = reply_to {
        buf.put_slice(reply.as_bytes());
        buf.put_u8(b' ');
    }
    buf.put_slice(len.to_string().as_bytes());
    buf.put_slice(CRLF);
    buf.freeze()
}

/// `SUB subject [queue] sid\r\n`.
pub fn sub_line(subject: &str, queue: Option<&str>, sid: u64) -> Bytes {
    let line = match queue {
        Some(queue) => format!("SUB {} {} {}\r\n", subject, queue, sid),
        None => format!("SUB {} {}\r\n", subject, sid),
    };
    Bytes::from(line)
}

/// `UNSUB sid [max]\r\n`.
pub fn unsub_line(sid: u64, max: Option<u64>) -> Bytes {
    let line = match max {
        Some(max) => format!("UNSUB {} {}\r\n", sid, max),
        None => format!("UNSUB {}\r\n", sid),
    };
    Bytes::from(line)
}
