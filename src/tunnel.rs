//! `CONNECT` handshake for `https` through a proxy.

use std::fmt;
use std::io::Write;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use http::{header, HeaderMap, HeaderName, Method, StatusCode, Version};

use crate::auth::challenges;
use crate::body::BodyReader;
use crate::ext::{HeaderIterExt, StatusExt};
use crate::parser::{check_head_size, try_parse_response};
use crate::response::discard_body;
use crate::transport::Stream;
use crate::{Error, MAX_RESPONSE_HEADERS};

/// What the proxy answered to `CONNECT`.
pub struct TunnelResult {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    /// `proxy-authenticate` challenges, in the order received.
    pub challenges: Vec<String>,
    /// Bytes read past the end of the proxy's head.
    pub leftover: BytesMut,
}

impl TunnelResult {
    /// Tell if the proxy keeps the connection open after this answer.
    pub fn keep_alive(&self) -> bool {
        let proxy_connection = HeaderName::from_static("proxy-connection");
        let has = |v: &str| {
            self.headers.iter().has(header::CONNECTION, v)
                || self.headers.iter().has(proxy_connection.clone(), v)
        };
        if has("close") {
            return false;
        }
        if self.version == Version::HTTP_10 {
            return has("keep-alive");
        }
        true
    }
}

impl fmt::Debug for TunnelResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelResult")
            .field("status", &self.status)
            .field("challenges", &self.challenges)
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

/// Outcome of one `CONNECT` exchange.
#[derive(Debug)]
pub enum TunnelOutcome {
    /// The tunnel is open, the stream now talks to the target.
    Established(TunnelResult),
    /// Not yet successful. Answer a challenge and send `CONNECT` again.
    RetryWithChallenge(TunnelResult),
}

/// One `CONNECT` handshake against a proxy.
#[derive(Debug)]
pub struct Tunnel {
    authority: String,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    attempts: usize,
}

impl Tunnel {
    /// Tunnel to `authority` (`host:port`).
    pub fn new(
        authority: String,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Tunnel {
        Tunnel {
            authority,
            read_timeout,
            write_timeout,
            attempts: 0,
        }
    }

    /// Number of `CONNECT` requests sent so far.
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Write the `CONNECT` request head.
    pub(crate) fn write_connect(
        &self,
        proxy_authorization: Option<&str>,
        proxy_keep_alive: bool,
        out: &mut Vec<u8>,
    ) -> Result<(), Error> {
        let a = &self.authority;
        write!(out, "CONNECT {} HTTP/1.1\r\nHost: {}\r\n", a, a)?;
        if let Some(v) = proxy_authorization {
            write!(out, "Proxy-Authorization: {}\r\n", v)?;
        }
        if proxy_keep_alive {
            write!(out, "Proxy-Connection: keep-alive\r\n")?;
        }
        write!(out, "\r\n")?;
        Ok(())
    }

    /// Send `CONNECT` and read the proxy's answer.
    pub async fn initialize(
        &mut self,
        stream: &mut Stream,
        proxy_authorization: Option<&str>,
        proxy_keep_alive: bool,
    ) -> Result<TunnelOutcome, Error> {
        let mut out = Vec::with_capacity(256);
        self.write_connect(proxy_authorization, proxy_keep_alive, &mut out)?;

        self.attempts += 1;
        debug!("Send CONNECT {} (attempt {})", self.authority, self.attempts);
        stream.write_all(&out, self.write_timeout).await?;

        let mut buf = stream.take_leftover();

        let (version, status, headers) = loop {
            if let Some((used, res)) = try_parse_response::<MAX_RESPONSE_HEADERS>(&buf)? {
                buf.advance(used);
                if res.status().is_interim() {
                    trace!("Skip interim {} from proxy", res.status());
                    continue;
                }
                let (parts, _) = res.into_parts();
                break (parts.version, parts.status, parts.headers);
            }

            check_head_size(buf.len())?;
            let n = stream
                .read_buf(&mut buf, self.read_timeout)
                .await
                .map_err(|e| match e {
                    Error::Timeout(_) => Error::Timeout(crate::Timeout::Tunnel),
                    e => e,
                })?;
            if n == 0 {
                return Err(Error::UnexpectedEof);
            }
        };

        debug!("CONNECT {} answered: {}", self.authority, status);

        let result = TunnelResult {
            status,
            version,
            challenges: challenges(&headers, &header::PROXY_AUTHENTICATE),
            headers,
            leftover: buf,
        };

        if status == StatusCode::OK {
            return Ok(TunnelOutcome::Established(result));
        }

        let is_auth = status == StatusCode::PROXY_AUTHENTICATION_REQUIRED
            || status == StatusCode::UNAUTHORIZED;

        if !is_auth {
            return Err(Error::ProxyTunnel(status));
        }

        if status == StatusCode::UNAUTHORIZED || result.challenges.is_empty() {
            return Err(Error::Authentication(status));
        }

        Ok(TunnelOutcome::RetryWithChallenge(result))
    }

    /// Read and discard the body of a non-successful answer so the socket can carry the
    /// next `CONNECT`. Returns `false` if the socket can't be reused.
    pub(crate) async fn drain_body(
        &self,
        stream: &mut Stream,
        result: &mut TunnelResult,
    ) -> Result<bool, Error> {
        if !result.keep_alive() {
            return Ok(false);
        }

        // A 407 isn't a 2xx, so CONNECT doesn't rule out a body here.
        let mut reader = BodyReader::for_response(&Method::CONNECT, result.status, &result.headers)?;
        let buf = std::mem::take(&mut result.leftover);

        discard_body(stream, buf, &mut reader, self.read_timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_line() {
        let t = Tunnel::new("q.test:443".into(), None, None);
        let mut out = Vec::new();
        t.write_connect(None, false, &mut out).unwrap();
        assert_eq!(out, b"CONNECT q.test:443 HTTP/1.1\r\nHost: q.test:443\r\n\r\n");

        let mut out = Vec::new();
        t.write_connect(Some("NTLM abc"), true, &mut out).unwrap();
        assert_eq!(
            out,
            b"CONNECT q.test:443 HTTP/1.1\r\nHost: q.test:443\r\n\
            Proxy-Authorization: NTLM abc\r\nProxy-Connection: keep-alive\r\n\r\n"
                .as_slice()
        );
    }

    #[test]
    fn keep_alive_rules() {
        let mut r = TunnelResult {
            status: StatusCode::PROXY_AUTHENTICATION_REQUIRED,
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            challenges: vec![],
            leftover: BytesMut::new(),
        };
        assert!(r.keep_alive());

        r.headers
            .insert("proxy-connection", "close".parse().unwrap());
        assert!(!r.keep_alive());

        r.headers.clear();
        r.version = Version::HTTP_10;
        assert!(!r.keep_alive());
        r.headers
            .insert(header::CONNECTION, "keep-alive".parse().unwrap());
        assert!(r.keep_alive());
    }
}
