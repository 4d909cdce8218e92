//! Pooled HTTP/1.1 client connections
//!
//! Turns request descriptions into bytes on pooled, reused TCP (or TLS) connections and
//! response bytes back into status, headers and a body stream.
//!
//! The framing core (body writers and readers, chunked coding, response head parsing)
//! is sans-IO and works on buffers. The pooling layer drives that core over tokio
//! transports.
//!
//! * **[`Pool`]** - registry of endpoints, one [`Scheduler`] per (scheme, host, port,
//!   proxy).
//! * **[`Scheduler`]** - owns the connection groups of an endpoint and runs the
//!   dispatch loop matching queued requests to idle or new connections.
//! * **Connection group** - a named partition with its own connections and FIFO
//!   queue. Bounded by [`EndpointConfig::connection_limit`].
//! * **Connection** - one transport, serving at most one request at a time.
//! * **Operation** - one request, observed by the caller through a [`Call`].
//!
//! A request moves through these stages, each observable on the [`Call`]:
//!
//! ```text
//!  ┌──────────┐    ┌──────────────┐    ┌───────────────┐    ┌──────────────┐
//!  │  Queued  │───▶│ RequestStream│───▶│RequestWritten │───▶│   Response   │
//!  └──────────┘    └──────────────┘    └───────────────┘    └──────────────┘
//!                                              ▲                    │
//!                                              │ 401/407            ▼
//!                                       ┌──────────────┐     ┌──────────────┐
//!                                       │  Successor   │◀────│   Finished   │
//!                                       └──────────────┘     └──────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use webconn::{Body, CallOptions, Pool};
//! use webconn::http::Request;
//!
//! # async fn example() -> Result<(), webconn::Error> {
//! let pool = Pool::new();
//!
//! let req = Request::post("http://q.test/upload")
//!     .body(Body::Streaming)
//!     .unwrap();
//!
//! let mut call = pool.submit(req, CallOptions::default())?;
//!
//! let mut body = call.request_stream().await?;
//! body.write(b"hello").await?;
//! body.close().await?;
//!
//! let mut response = call.response().await?;
//! assert_eq!(response.status(), 200);
//! let bytes = response.bytes().await?;
//!
//! call.finished().await?;
//! # Ok(()) }
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all)]

#[macro_use]
extern crate log;

mod auth;
mod body;
mod close_reason;
mod config;
mod connection;
mod endpoint;
mod error;
mod ext;
mod group;
mod operation;
mod parser;
mod pool;
mod request;
mod response;
mod scheduler;
mod transport;
mod tunnel;
mod util;

#[cfg(test)]
mod test;

pub use auth::{AuthContext, Authenticator, BasicAuthenticator};
pub use body::{calculate_max_input, BodyMode, BodyReader, BodyWriter};
pub use close_reason::CloseReason;
pub use config::{CallOptions, ContinueCallback, Credentials, Decompression};
pub use config::{EndpointConfig, Proxy};
pub use endpoint::Endpoint;
pub use error::{Error, ErrorKind, Timeout};
pub use operation::Call;
pub use parser::try_parse_response;
pub use pool::{Pool, PoolBuilder};
pub use request::{Body, RequestStream, WriteMode};
pub use response::ResponseStream;
pub use scheduler::Scheduler;
pub use transport::{BoxFuture, BoxTransport, GaiResolver, Resolver, TlsConnect, Transport};

pub use http;

/// Max number of headers to parse from an HTTP response.
pub const MAX_RESPONSE_HEADERS: usize = 128;

/// Max number of bytes a response head may take, interim responses included.
pub const MAX_RESPONSE_HEAD_SIZE: usize = 64 * 1024;
