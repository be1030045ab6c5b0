//! Connection options.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use url::Url;

use crate::codec::ParserRegistry;
use crate::error::Error;
use crate::request::{ErrorObserver, TracingObserver};

const DEFAULT_PORT: u16 = 5432;

/// SSL connection mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    /// Don't use SSL
    Disable,
    /// Try SSL, fall back to unencrypted if not supported
    #[default]
    Prefer,
    /// Require SSL connection
    Require,
}

impl FromStr for SslMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "disable" => Ok(SslMode::Disable),
            "allow" | "prefer" => Ok(SslMode::Prefer),
            "require" | "verify-ca" | "verify-full" => Ok(SslMode::Require),
            _ => Err(Error::InvalidUsage(format!(
                "Invalid sslmode: expected one of ['disable', 'prefer', 'require'], got {s}"
            ))),
        }
    }
}

/// Connection options for PostgreSQL.
///
/// Built from a `postgres://` URL, a libpq keyword/value string or the empty string.
/// Whatever the source leaves out is taken from the `PG*` environment variables and
/// then from the libpq defaults.
#[derive(Clone, PartialEq, Eq)]
pub struct Opts {
    /// Hostname, IP address, or a Unix socket directory when it starts with `/`.
    ///
    /// Default: `localhost`
    pub host: String,

    /// Default: `5432`
    pub port: u16,

    /// Explicit Unix socket path; overrides `host`.
    ///
    /// Default: `None`
    pub socket: Option<String>,

    /// Default: `PGUSER`, then `USER`, then `postgres`
    pub user: String,

    /// Default: `None` (the server uses the user name)
    pub database: Option<String>,

    pub password: Option<String>,

    pub application_name: Option<String>,

    /// Default: `SslMode::Prefer`
    pub ssl_mode: SslMode,

    /// Additional startup parameters, e.g. `options` or `search_path`.
    pub params: Vec<(String, String)>,
}

impl Default for Opts {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            socket: None,
            user: "postgres".to_string(),
            database: None,
            password: None,
            application_name: None,
            ssl_mode: SslMode::Prefer,
            params: Vec::new(),
        }
    }
}

impl fmt::Debug for Opts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Opts")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("socket", &self.socket)
            .field("user", &self.user)
            .field("database", &self.database)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("application_name", &self.application_name)
            .field("ssl_mode", &self.ssl_mode)
            .field("params", &self.params)
            .finish()
    }
}

impl Opts {
    /// Path of the Unix socket to connect to, if any.
    pub fn socket_path(&self) -> Option<String> {
        if let Some(socket) = &self.socket {
            return Some(socket.clone());
        }
        self.host
            .starts_with('/')
            .then(|| format!("{}/.s.PGSQL.{}", self.host.trim_end_matches('/'), self.port))
    }

    /// Build options from `(keyword, value)` pairs, falling back to `env` for
    /// anything the pairs leave out.
    fn from_pairs<I, F>(pairs: I, env: F) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
        F: Fn(&str) -> Option<String>,
    {
        let mut host = None;
        let mut port = None;
        let mut user = None;
        let mut ssl_mode = None;
        let mut opts = Opts::default();

        for (key, value) in pairs {
            match key.as_str() {
                "host" | "hostaddr" => host = Some(value),
                "port" => port = Some(value),
                "user" => user = Some(value),
                "password" => opts.password = Some(value),
                "dbname" => opts.database = Some(value).filter(|db| !db.is_empty()),
                "application_name" => opts.application_name = Some(value),
                "sslmode" => ssl_mode = Some(value),
                "socket" => opts.socket = Some(value),
                // client-side libpq settings that are not startup parameters
                "connect_timeout" | "sslcert" | "sslkey" | "sslrootcert" | "sslcrl"
                | "target_session_attrs" | "keepalives" | "keepalives_idle" => {
                    tracing::debug!(key = %key, "ignoring unsupported connection option");
                }
                _ => opts.params.push((key, value)),
            }
        }

        if let Some(host) = host.or_else(|| env("PGHOST")).filter(|h| !h.is_empty()) {
            opts.host = host;
        }
        if let Some(port) = port.or_else(|| env("PGPORT")).filter(|p| !p.is_empty()) {
            opts.port = port
                .parse()
                .map_err(|e| Error::InvalidUsage(format!("Invalid port {port:?}: {e}")))?;
        }
        if let Some(user) = user
            .or_else(|| env("PGUSER"))
            .or_else(|| env("USER"))
            .filter(|u| !u.is_empty())
        {
            opts.user = user;
        }
        if opts.database.is_none() {
            opts.database = env("PGDATABASE").filter(|db| !db.is_empty());
        }
        if opts.password.is_none() {
            opts.password = env("PGPASSWORD");
        }
        if opts.application_name.is_none() {
            opts.application_name = env("PGAPPNAME");
        }
        if let Some(mode) = ssl_mode.or_else(|| env("PGSSLMODE")) {
            opts.ssl_mode = mode.parse()?;
        }
        Ok(opts)
    }

    fn parse_with_env<F>(s: &str, env: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let s = s.trim();
        if s.contains("://") {
            let url = Url::parse(s).map_err(|e| Error::InvalidUsage(format!("Invalid URL: {e}")))?;
            Self::from_pairs(url_pairs(&url)?, env)
        } else {
            Self::from_pairs(keyword_pairs(s)?, env)
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

impl TryFrom<&Url> for Opts {
    type Error = Error;

    /// Parse a PostgreSQL connection URL.
    ///
    /// Format: `postgres://[user[:password]@][host][:port][/database][?param1=value1&..]`
    ///
    /// Query parameters use the libpq keywords (`host`, `sslmode`, `application_name`, ...);
    /// unknown ones are sent to the server as startup parameters.
    fn try_from(url: &Url) -> Result<Self, Self::Error> {
        Self::from_pairs(url_pairs(url)?, env_var)
    }
}

impl TryFrom<&str> for Opts {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Self::parse_with_env(s, env_var)
    }
}

impl FromStr for Opts {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s)
    }
}

fn url_pairs(url: &Url) -> Result<Vec<(String, String)>, Error> {
    if !["postgres", "postgresql", "pg"].contains(&url.scheme()) {
        return Err(Error::InvalidUsage(format!(
            "Invalid scheme: expected 'postgres://' or 'pg://', got '{}://'",
            url.scheme()
        )));
    }

    let mut pairs = Vec::new();
    if let Some(host) = url.host_str().filter(|h| !h.is_empty()) {
        pairs.push(("host".to_string(), percent_decode(host).into_owned()));
    }
    if let Some(port) = url.port() {
        pairs.push(("port".to_string(), port.to_string()));
    }
    if !url.username().is_empty() {
        pairs.push(("user".to_string(), percent_decode(url.username()).into_owned()));
    }
    if let Some(password) = url.password() {
        pairs.push(("password".to_string(), percent_decode(password).into_owned()));
    }
    if let Some(db) = url.path().strip_prefix('/').filter(|db| !db.is_empty()) {
        pairs.push(("dbname".to_string(), percent_decode(db).into_owned()));
    }
    // query parameters come last so that `?host=/tmp` overrides the authority
    pairs.extend(
        url.query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned())),
    );
    Ok(pairs)
}

fn percent_decode(s: &str) -> Cow<'_, str> {
    if !s.contains('%') {
        return Cow::Borrowed(s);
    }
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while let Some(&b) = bytes.get(i) {
        let decoded = (b == b'%')
            .then(|| bytes.get(i + 1..i + 3))
            .flatten()
            .and_then(|hex| simdutf8::compat::from_utf8(hex).ok())
            .and_then(|hex| u8::from_str_radix(hex, 16).ok());
        match decoded {
            Some(byte) => {
                out.push(byte);
                i += 3;
            }
            None => {
                out.push(b);
                i += 1;
            }
        }
    }
    Cow::Owned(String::from_utf8_lossy(&out).into_owned())
}

/// Split a libpq `keyword = value` string.
///
/// Values may be single-quoted; inside quotes and out, `\'` and `\\` escape.
fn keyword_pairs(s: &str) -> Result<Vec<(String, String)>, Error> {
    let mut pairs = Vec::new();
    let mut chars = s.chars().peekable();
    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(pairs);
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(Error::InvalidUsage(format!(
                "missing \"=\" after {key:?} in connection info string"
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\'') => break,
                    Some('\\') => value.extend(chars.next()),
                    Some(c) => value.push(c),
                    None => {
                        return Err(Error::InvalidUsage(
                            "unterminated quoted string in connection info string".into(),
                        ));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                if c == '\\' {
                    value.extend(chars.next());
                } else {
                    value.push(c);
                }
            }
        }
        pairs.push((key, value));
    }
}

/// Facade-level configuration of a [`Connection`](crate::Connection).
#[derive(Clone)]
pub struct ConnectionOptions {
    /// Parsers applied to result values. Clones share the same table.
    pub registry: ParserRegistry,
    /// Receives panics of completion callbacks.
    pub observer: Arc<dyn ErrorObserver>,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            registry: ParserRegistry::new(),
            observer: Arc::new(TracingObserver),
        }
    }
}

impl fmt::Debug for ConnectionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionOptions")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
