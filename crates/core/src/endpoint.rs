//! Endpoint parsing for `[password@]host[:port]` addresses.

use std::fmt;
use std::str::FromStr;

use crate::cache::{CacheError, Result};

/// Port used when an address does not name one.
pub const DEFAULT_PORT: u16 = 6379;

/// A parsed store address.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
}

impl Endpoint {
    /// Parses `[password@]host[:port]`.
    ///
    /// # Examples
    ///
    /// ```
    /// use gamecache_core::endpoint::Endpoint;
    ///
    /// let endpoint = Endpoint::parse("secret@cache.local:6380").unwrap();
    /// assert_eq!(endpoint.pool_key(), "cache.local:6380");
    /// assert_eq!(endpoint.password.as_deref(), Some("secret"));
    ///
    /// assert_eq!(Endpoint::parse("cache.local").unwrap().pool_key(), "cache.local:6379");
    /// ```
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        let (password, rest) = match address.rsplit_once('@') {
            Some((password, rest)) => (Some(password.to_string()), rest),
            None => (None, address),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|_| {
                    CacheError::InvalidConfig(format!("invalid port in address {}", rest))
                })?;
                (host, port)
            }
            None => (rest, DEFAULT_PORT),
        };

        if host.is_empty() {
            return Err(CacheError::InvalidConfig(format!(
                "missing host in address {}",
                rest
            )));
        }

        Ok(Self {
            host: host.to_string(),
            port,
            password: password.filter(|p| !p.is_empty()),
        })
    }

    /// Normalized `host:port` key identifying this endpoint's pool.
    pub fn pool_key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

// Keeps the password out of logs.
impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}
