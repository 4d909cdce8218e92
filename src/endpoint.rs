use std::fmt;

use http::uri::Scheme;
use http::Uri;

use crate::ext::SchemeExt;
use crate::{Error, Proxy};

/// Remote identity owning one connection pool: scheme, host, port and the proxy
/// used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    scheme: Scheme,
    host: String,
    port: u16,
    proxy: Option<Proxy>,
}

impl Endpoint {
    /// The endpoint serving `uri` through `proxy`.
    pub fn from_uri(uri: &Uri, proxy: Option<&Proxy>) -> Result<Endpoint, Error> {
        let scheme = uri
            .scheme()
            .ok_or_else(|| Error::BadUri(format!("{} has no scheme", uri)))?;

        if *scheme != Scheme::HTTP && *scheme != Scheme::HTTPS {
            return Err(Error::BadUri(format!("unsupported scheme: {}", scheme)));
        }

        let host = uri
            .host()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::BadUri(format!("{} has no host", uri)))?;

        let port = match uri.port_u16() {
            Some(p) => p,
            None => scheme
                .default_port()
                .ok_or_else(|| Error::BadUri(format!("no port for {}", uri)))?,
        };

        Ok(Endpoint {
            scheme: scheme.clone(),
            host: host.to_string(),
            port,
            proxy: proxy.cloned(),
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn proxy(&self) -> Option<&Proxy> {
        self.proxy.as_ref()
    }

    pub fn is_secure(&self) -> bool {
        self.scheme.is_secure()
    }

    /// Requests go through a `CONNECT` tunnel.
    pub(crate) fn needs_tunnel(&self) -> bool {
        self.proxy.is_some() && self.is_secure()
    }

    /// Requests are sent to a proxy in absolute form.
    pub(crate) fn uses_absolute_form(&self) -> bool {
        self.proxy.is_some() && !self.is_secure()
    }

    /// Where the TCP connection goes.
    pub(crate) fn connect_target(&self) -> (&str, u16) {
        match &self.proxy {
            Some(p) => (&p.host, p.port),
            None => (&self.host, self.port),
        }
    }

    /// `host:port` as used by `CONNECT`.
    pub(crate) fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Value for the `host` header. The port is left out when it is the scheme default.
    pub(crate) fn host_header(&self) -> String {
        if self.scheme.default_port() == Some(self.port) {
            self.host.clone()
        } else {
            self.authority()
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if let Some(p) = &self.proxy {
            write!(f, " via {}:{}", p.host, p.port)?;
        }
        Ok(())
    }
}
