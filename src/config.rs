//! Endpoint and per-call configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};

/// Configuration shared by all connections of one endpoint.
///
/// Changing `connection_limit` or `max_idle_time` on a running endpoint goes through
/// [`Scheduler::set_connection_limit`](crate::Scheduler::set_connection_limit) and
/// [`Scheduler::set_max_idle_time`](crate::Scheduler::set_max_idle_time).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Max connections per connection group.
    pub connection_limit: usize,

    /// Idle connections are closed after this long.
    pub max_idle_time: Duration,

    /// A connection is closed after serving this many operations.
    pub max_requests_per_connection: usize,

    /// Timeout for each TCP connect attempt.
    pub connect_timeout: Duration,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connection_limit: 6,
            max_idle_time: Duration::from_secs(100),
            max_requests_per_connection: 1000,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Credentials handed to an [`Authenticator`](crate::auth::Authenticator).
///
/// Connections authenticated with a connection-based scheme are bound to the
/// credentials that authenticated them.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    pub domain: String,
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            domain: String::new(),
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An HTTP proxy.
///
/// Plain `http` requests are sent to the proxy in absolute form, `https` requests are
/// tunneled with `CONNECT`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Proxy {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl Proxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }
}

/// Which content encodings are requested and transparently decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decompression {
    pub gzip: bool,
    pub deflate: bool,
}

impl Decompression {
    pub fn none() -> Self {
        Self {
            gzip: false,
            deflate: false,
        }
    }

    /// Value for `accept-encoding`, limited to the compiled in decoders.
    pub(crate) fn accept_encoding(&self) -> Option<&'static str> {
        let gzip = self.gzip && cfg!(feature = "gzip");
        let deflate = self.deflate && cfg!(feature = "deflate");
        match (gzip, deflate) {
            (true, true) => Some("gzip, deflate"),
            (true, false) => Some("gzip"),
            (false, true) => Some("deflate"),
            (false, false) => None,
        }
    }
}

impl Default for Decompression {
    fn default() -> Self {
        Self {
            gzip: true,
            deflate: true,
        }
    }
}

/// Invoked once for the first `100 Continue` of a call.
pub type ContinueCallback = Arc<dyn Fn(StatusCode, &HeaderMap) + Send + Sync>;

/// Per call options.
#[derive(Clone)]
pub struct CallOptions {
    /// Connection group name. Empty is the default group.
    pub connection_group: String,

    /// Ask to keep the connection open after the response.
    pub keep_alive: bool,

    /// Send the request body chunked.
    pub send_chunked: bool,

    /// Buffer the request body so it can be replayed after an auth challenge.
    pub allow_write_buffering: bool,

    /// Bound on each read of response bytes.
    pub read_timeout: Option<Duration>,

    /// Bound on each write of request bytes.
    pub write_timeout: Option<Duration>,

    /// Credentials for answering `401` challenges.
    pub credentials: Option<Credentials>,

    /// Let connections authenticated with a connection-based scheme serve calls with
    /// different credentials.
    pub unsafe_authenticated_connection_sharing: bool,

    pub decompression: Decompression,

    pub proxy: Option<Proxy>,

    pub on_continue: Option<ContinueCallback>,
}

impl CallOptions {
    pub fn connection_group(mut self, name: impl Into<String>) -> Self {
        self.connection_group = name.into();
        self
    }

    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn proxy(mut self, proxy: Proxy) -> Self {
        self.proxy = Some(proxy);
        self
    }
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            connection_group: String::new(),
            keep_alive: true,
            send_chunked: false,
            allow_write_buffering: true,
            read_timeout: None,
            write_timeout: None,
            credentials: None,
            unsafe_authenticated_connection_sharing: false,
            decompression: Decompression::default(),
            proxy: None,
            on_continue: None,
        }
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("connection_group", &self.connection_group)
            .field("keep_alive", &self.keep_alive)
            .field("send_chunked", &self.send_chunked)
            .field("allow_write_buffering", &self.allow_write_buffering)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("credentials", &self.credentials)
            .field(
                "unsafe_authenticated_connection_sharing",
                &self.unsafe_authenticated_connection_sharing,
            )
            .field("decompression", &self.decompression)
            .field("proxy", &self.proxy)
            .field("on_continue", &self.on_continue.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EndpointConfig::default();
        assert_eq!(c.connection_limit, 6);
        assert_eq!(c.max_idle_time, Duration::from_secs(100));

        let o = CallOptions::default();
        assert!(o.keep_alive);
        assert!(o.allow_write_buffering);
        assert!(!o.send_chunked);
        assert_eq!(o.connection_group, "");
    }

    #[test]
    fn credentials_debug_hides_password() {
        let c = Credentials::new("martin", "secret").with_domain("CORP");
        let s = format!("{:?}", c);
        assert!(s.contains("martin"));
        assert!(!s.contains("secret"));
    }

    #[test]
    fn accept_encoding() {
        assert_eq!(Decompression::none().accept_encoding(), None);
        #[cfg(all(feature = "gzip", feature = "deflate"))]
        assert_eq!(
            Decompression::default().accept_encoding(),
            Some("gzip, deflate")
        );
    }
}
