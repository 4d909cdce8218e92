//! Answering `401`/`407` challenges.
//!
//! The credential computation itself is external. An [`Authenticator`] gets the
//! challenge and returns the header value to send. Connection-based schemes (NTLM)
//! return `true` from [`Authenticator::is_connection_based`], which binds the
//! connection to the credentials once the handshake succeeds.

use std::fmt;
use std::sync::Arc;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use http::{HeaderMap, HeaderName, Method, Uri};

use crate::util::compare_lowercase_ascii;
use crate::Credentials;

/// What is being authenticated.
#[derive(Debug)]
pub struct AuthContext<'a> {
    pub method: &'a Method,
    pub uri: &'a Uri,
    /// `true` when answering a proxy (`407`) challenge.
    pub proxy: bool,
}

/// Computes an authorization header value from a challenge.
pub trait Authenticator: fmt::Debug + Send + Sync + 'static {
    /// Scheme name as it appears in the challenge, e.g. `Basic`.
    fn scheme(&self) -> &str;

    /// Tell if a successful handshake authenticates the connection rather than the
    /// request.
    fn is_connection_based(&self) -> bool {
        false
    }

    /// Produce the header value answering `challenge`, the full challenge string
    /// including the scheme. `None` if this authenticator can't answer.
    fn authenticate(
        &self,
        challenge: &str,
        ctx: &AuthContext<'_>,
        credentials: &Credentials,
    ) -> Option<String>;
}

/// `Basic` authentication.
#[derive(Debug, Default)]
pub struct BasicAuthenticator;

impl Authenticator for BasicAuthenticator {
    fn scheme(&self) -> &str {
        "Basic"
    }

    fn authenticate(
        &self,
        _challenge: &str,
        _ctx: &AuthContext<'_>,
        credentials: &Credentials,
    ) -> Option<String> {
        Some(basic_header(credentials))
    }
}

pub(crate) fn basic_header(credentials: &Credentials) -> String {
    let user = if credentials.domain.is_empty() {
        credentials.username.clone()
    } else {
        format!("{}\\{}", credentials.domain, credentials.username)
    };
    let encoded = BASE64_STANDARD.encode(format!("{}:{}", user, credentials.password));
    format!("Basic {}", encoded)
}

/// Challenge strings of all `name` headers, in order.
pub(crate) fn challenges(headers: &HeaderMap, name: &HeaderName) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// The answer to a challenge.
#[derive(Debug, Clone)]
pub(crate) struct AuthAnswer {
    pub value: String,
    pub connection_based: bool,
}

/// Try the challenges in the order the server sent them against the registered
/// authenticators.
pub(crate) fn answer(
    authenticators: &[Arc<dyn Authenticator>],
    challenges: &[String],
    ctx: &AuthContext<'_>,
    credentials: &Credentials,
) -> Option<AuthAnswer> {
    for challenge in challenges {
        let scheme = challenge.split_whitespace().next().unwrap_or_default();
        let lowercased = scheme.to_ascii_lowercase();

        for a in authenticators {
            if !compare_lowercase_ascii(a.scheme(), &lowercased) {
                continue;
            }
            if let Some(value) = a.authenticate(challenge, ctx, credentials) {
                debug!("Answering {} challenge", a.scheme());
                return Some(AuthAnswer {
                    value,
                    connection_based: a.is_connection_based(),
                });
            }
        }
    }

    trace!("No authenticator for challenges: {:?}", challenges);
    None
}
