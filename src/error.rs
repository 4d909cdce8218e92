use std::fmt;
use std::io;
use std::sync::Arc;

use http::{Method, StatusCode, Version};

/// Error type for webconn
#[derive(Debug, Clone)]
#[allow(missing_docs)]
#[non_exhaustive]
pub enum Error {
    BadHeader(String),
    UnsupportedVersion,
    MethodVersionMismatch(Method, Version),
    TooManyHostHeaders,
    TooManyContentLengthHeaders,
    BadContentLengthHeader,
    AmbiguousContentLength,
    MissingContentLength,
    ChunkLenNotAscii,
    ChunkLenNotANumber,
    ChunkExpectedCrLf,
    BodyContentAfterFinish,
    BodyLargerThanContentLength,
    BodyShorterThanContentLength { written: u64, declared: u64 },
    HttpParseFail(String),
    HttpParseTooManyHeaders,
    BodyIsChunked,
    NoRequestStream,
    StreamTaken,
    BadUri(String),
    NameResolution(String),
    ConnectFailed(String),
    NoTlsConnector,
    Io(Arc<io::Error>),
    UnexpectedEof,
    Timeout(Timeout),
    RequestCanceled,
    Authentication(StatusCode),
    ProxyTunnel(StatusCode),
    Shutdown,
}

/// Which configured bound a [`Error::Timeout`] exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Establishing the TCP connection to one address.
    Connect,
    /// Waiting for response bytes.
    Read,
    /// Writing request bytes.
    Write,
    /// Running the CONNECT handshake with a proxy.
    Tunnel,
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The host name could not be resolved.
    NameResolution,
    /// Every candidate address failed to connect.
    Connect,
    /// The local side broke the HTTP framing rules (body length, malformed input).
    Protocol,
    /// The peer (server or proxy) sent something we cannot frame.
    ServerProtocol,
    /// A read, write, connect or tunnel bound was exceeded.
    Timeout,
    /// The operation was aborted or disposed.
    RequestCanceled,
    /// A 401/407 arrived without a usable challenge.
    Authentication,
    /// Any other transport failure.
    Io,
}

impl Error {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::NameResolution(_) => ErrorKind::NameResolution,
            Error::ConnectFailed(_) | Error::NoTlsConnector => ErrorKind::Connect,
            Error::BadHeader(_)
            | Error::UnsupportedVersion
            | Error::MethodVersionMismatch(_, _)
            | Error::TooManyHostHeaders
            | Error::TooManyContentLengthHeaders
            | Error::BadContentLengthHeader
            | Error::MissingContentLength
            | Error::BodyContentAfterFinish
            | Error::BodyLargerThanContentLength
            | Error::BodyShorterThanContentLength { .. }
            | Error::BodyIsChunked
            | Error::NoRequestStream
            | Error::StreamTaken
            | Error::BadUri(_) => ErrorKind::Protocol,
            Error::ChunkLenNotAscii
            | Error::ChunkLenNotANumber
            | Error::ChunkExpectedCrLf
            | Error::AmbiguousContentLength
            | Error::HttpParseFail(_)
            | Error::HttpParseTooManyHeaders
            | Error::UnexpectedEof
            | Error::ProxyTunnel(_) => ErrorKind::ServerProtocol,
            Error::Timeout(_) => ErrorKind::Timeout,
            Error::RequestCanceled | Error::Shutdown => ErrorKind::RequestCanceled,
            Error::Authentication(_) => ErrorKind::Authentication,
            Error::Io(_) => ErrorKind::Io,
        }
    }

    /// Tell if this error was caused by a timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }

    /// Tell if this error was caused by cancellation.
    pub fn is_canceled(&self) -> bool {
        self.kind() == ErrorKind::RequestCanceled
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => io::Error::new(e.kind(), e.to_string()),
            Error::Timeout(_) => io::Error::new(io::ErrorKind::TimedOut, self),
            Error::UnexpectedEof => io::Error::new(io::ErrorKind::UnexpectedEof, self),
            e => io::Error::new(io::ErrorKind::Other, e),
        }
    }
}

impl From<httparse::Error> for Error {
    fn from(value: httparse::Error) -> Self {
        Error::HttpParseFail(value.to_string())
    }
}

impl From<io::Error> for Error {
    fn from(value: io::Error) -> Self {
        // Errors that passed through an AsyncRead boundary come back wrapped.
        if value.get_ref().map(|e| e.is::<Error>()).unwrap_or(false) {
            if let Some(inner) = value.into_inner() {
                if let Ok(e) = inner.downcast::<Error>() {
                    return *e;
                }
            }
            return Error::Io(Arc::new(io::Error::new(
                io::ErrorKind::Other,
                "unreadable wrapped error",
            )));
        }
        match value.kind() {
            io::ErrorKind::UnexpectedEof => Error::UnexpectedEof,
            io::ErrorKind::TimedOut => Error::Timeout(Timeout::Read),
            _ => Error::Io(Arc::new(value)),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(&**e),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadHeader(v) => write!(f, "bad header: {}", v),
            Error::UnsupportedVersion => write!(f, "unsupported http version"),
            Error::MethodVersionMismatch(m, v) => {
                write!(f, "{} not valid for HTTP version {:?}", m, v)
            }
            Error::TooManyHostHeaders => write!(f, "more than one host header"),
            Error::TooManyContentLengthHeaders => write!(f, "more than one content-length header"),
            Error::BadContentLengthHeader => write!(f, "content-length header not a number"),
            Error::AmbiguousContentLength => {
                write!(f, "response has conflicting content-length headers")
            }
            Error::MissingContentLength => {
                write!(f, "unbuffered, unchunked request body requires content-length")
            }
            Error::ChunkLenNotAscii => write!(f, "chunk length is not ascii"),
            Error::ChunkLenNotANumber => write!(f, "chunk length cannot be read as a number"),
            Error::ChunkExpectedCrLf => write!(f, "chunk expected crlf as next character"),
            Error::BodyContentAfterFinish => {
                write!(f, "attempt to stream body after sending finish")
            }
            Error::BodyLargerThanContentLength => {
                write!(f, "attempt to write larger body than content-length")
            }
            Error::BodyShorterThanContentLength { written, declared } => write!(
                f,
                "request body closed after {} of {} declared bytes",
                written, declared
            ),
            Error::HttpParseFail(v) => write!(f, "http parse fail: {}", v),
            Error::HttpParseTooManyHeaders => write!(f, "http parse resulted in too many headers"),
            Error::BodyIsChunked => write!(f, "chunked request body requires HTTP/1.1"),
            Error::NoRequestStream => write!(f, "request body is not streamed by the caller"),
            Error::StreamTaken => write!(f, "stream was already taken from the call"),
            Error::BadUri(v) => write!(f, "bad uri: {}", v),
            Error::NameResolution(v) => write!(f, "failed to resolve host: {}", v),
            Error::ConnectFailed(v) => write!(f, "failed to connect: {}", v),
            Error::NoTlsConnector => write!(f, "https requested but no tls connector configured"),
            Error::Io(e) => write!(f, "io: {}", e),
            Error::UnexpectedEof => write!(f, "connection closed before message completed"),
            Error::Timeout(t) => write!(f, "timeout: {:?}", t),
            Error::RequestCanceled => write!(f, "request canceled"),
            Error::Authentication(s) => write!(f, "authentication failed: {}", s),
            Error::ProxyTunnel(s) => write!(f, "proxy refused tunnel: {}", s),
            Error::Shutdown => write!(f, "pool is shut down"),
        }
    }
}
