//! Server endpoints and their URL forms.

use crate::error::{NatsError, Result};
use serde::Deserialize;
use std::fmt;
use std::hash::{Hash, Hasher};
use zeroize::Zeroizing;

/// Port used when a URL does not name one.
pub const DEFAULT_PORT: u16 = 4222;

/// Host used when no server is configured.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// How the client authenticates in CONNECT.
#[derive(Clone)]
pub enum AuthMode {
    /// No credentials.
    Anonymous,
    /// User name and password.
    Credentials {
        /// User name.
        user: String,
        /// Password, wiped on drop.
        password: Zeroizing<String>,
    },
    /// Single auth token.
    Token(Zeroizing<String>),
}

impl AuthMode {
    /// The part of the credentials that identifies who connects. Secrets other than tokens are
    /// excluded.
    fn identity(&self) -> (u8, &str) {
        match self {
            AuthMode::Anonymous => (0, ""),
            AuthMode::Credentials { user, .. } => (1, user.as_str()),
            AuthMode::Token(token) => (2, token.as_str()),
        }
    }
}

impl fmt::Debug for AuthMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthMode::Anonymous => write!(f, "Anonymous"),
            AuthMode::Credentials { user, .. } => f
                .debug_struct("Credentials")
                .field("user", user)
                .field("password", &"<redacted>")
                .finish(),
            AuthMode::Token(_) => write!(f, "Token(<redacted>)"),
        }
    }
}

/// An immutable server address with its TLS intent and credentials.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "String")]
pub struct ServerEndpoint {
    host: String,
    port: u16,
    secured: bool,
    auth: AuthMode,
}

impl ServerEndpoint {
    /// Anonymous plain-text endpoint.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            secured: false,
            auth: AuthMode::Anonymous,
        }
    }

    /// Returns a copy with the TLS flag set.
    pub fn with_tls(mut self, secured: bool) -> Self {
        self.secured = secured;
        self
    }

    /// Returns a copy using `auth`.
    pub fn with_auth(mut self, auth: AuthMode) -> Self {
        self.auth = auth;
        self
    }

    /// Parses `nats://[user:pass@|token@]host[:port]`, `tls://...`, `host:port` or `host`.
    pub fn parse(url: &str) -> Result<Self> {
        let invalid = |why: &str| NatsError::InvalidArgument(format!("server url {url:?}: {why}"));
        let url = url.trim();
        let (secured, rest) = if let Some(rest) = url.strip_prefix("tls://") {
            (true, rest)
        } else if let Some(rest) = url.strip_prefix("nats://") {
            (false, rest)
        } else if url.contains("://") {
            return Err(invalid("unsupported scheme"));
        } else {
            (false, url)
        };
        let rest = rest.trim_end_matches('/');

        let (auth, hostport) = match rest.rsplit_once('@') {
            Some((creds, hostport)) => {
                let auth = match creds.split_once(':') {
                    Some((user, password)) => AuthMode::Credentials {
                        user: user.to_string(),
                        password: Zeroizing::new(password.to_string()),
                    },
                    None => AuthMode::Token(Zeroizing::new(creds.to_string())),
                };
                (auth, hostport)
            }
            None => (AuthMode::Anonymous, rest),
        };

        let (host, port) = split_host_port(hostport).ok_or_else(|| invalid("bad host or port"))?;
        if host.is_empty() {
            return Err(invalid("empty host"));
        }
        Ok(Self {
            host: host.to_string(),
            port,
            secured,
            auth,
        })
    }

    /// Host name or address literal.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// TCP port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the connection must be upgraded to TLS.
    pub fn is_secured(&self) -> bool {
        self.secured
    }

    /// Authentication mode.
    pub fn auth(&self) -> &AuthMode {
        &self.auth
    }

    /// `host:port` suitable for `TcpStream::connect`.
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for ServerEndpoint {
    fn default() -> Self {
        Self::new(DEFAULT_HOST, DEFAULT_PORT)
    }
}

fn split_host_port(hostport: &str) -> Option<(&str, u16)> {
    if let Some(rest) = hostport.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        return match tail.strip_prefix(':') {
            Some(port) => Some((host, port.parse().ok()?)),
            None if tail.is_empty() => Some((host, DEFAULT_PORT)),
            None => None,
        };
    }
    match hostport.split_once(':') {
        Some((host, port)) => Some((host, port.parse().ok()?)),
        None => Some((hostport, DEFAULT_PORT)),
    }
}

impl TryFrom<String> for ServerEndpoint {
    type Error = NatsError;

    fn try_from(url: String) -> Result<Self> {
        Self::parse(&url)
    }
}

impl std::str::FromStr for ServerEndpoint {
    type Err = NatsError;

    fn from_str(url: &str) -> Result<Self> {
        Self::parse(url)
    }
}

impl PartialEq for ServerEndpoint {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host
            && self.port == other.port
            && self.secured == other.secured
            && self.auth.identity() == other.auth.identity()
    }
}

impl Eq for ServerEndpoint {}

impl Hash for ServerEndpoint {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.host.hash(state);
        self.port.hash(state);
        self.secured.hash(state);
        self.auth.identity().hash(state);
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.secured { "tls" } else { "nats" };
        write!(f, "{}://{}", scheme, self.socket_addr())
    }
}
