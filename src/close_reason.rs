/// Why a connection is dropped instead of going back to its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// An HTTP/1.0 exchange without `connection: keep-alive` from the server.
    Http10,

    /// The request carried `connection: close`.
    ClientConnectionClose,

    /// The response carried `connection: close`.
    ServerConnectionClose,

    /// The response body runs until EOF, so the socket is spent once it is read.
    CloseDelimitedBody,

    /// The connection has served `max_requests_per_connection` operations.
    TooManyReuses,
}

impl CloseReason {
    pub(crate) fn explain(&self) -> &'static str {
        match self {
            CloseReason::Http10 => "http/1.0 without keep-alive",
            CloseReason::ClientConnectionClose => "request asked for close",
            CloseReason::ServerConnectionClose => "response asked for close",
            CloseReason::CloseDelimitedBody => "body ends at eof",
            CloseReason::TooManyReuses => "reuse limit reached",
        }
    }
}
