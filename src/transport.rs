//! Transports and the resolver/TLS seams.

use std::fmt;
use std::future::Future;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::error::Timeout;
use crate::util::log_data;
use crate::Error;

/// Boxed future returned by the collaborator traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A byte stream a connection runs on: TCP, TLS over TCP, or anything else.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + fmt::Debug + 'static {}

pub type BoxTransport = Box<dyn Transport>;

/// Resolves a host name to socket addresses, tried in order.
pub trait Resolver: fmt::Debug + Send + Sync + 'static {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>>;
}

/// Resolver using the system's `getaddrinfo` through tokio.
#[derive(Debug, Default)]
pub struct GaiResolver;

impl Resolver for GaiResolver {
    fn resolve<'a>(&'a self, host: &'a str, port: u16) -> BoxFuture<'a, io::Result<Vec<SocketAddr>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((host, port)).await?;
            Ok(addrs.collect())
        })
    }
}

/// Wraps an established transport in TLS for `domain`.
///
/// Certificate validation is entirely up to the implementation.
pub trait TlsConnect: fmt::Debug + Send + Sync + 'static {
    fn connect<'a>(
        &'a self,
        domain: &'a str,
        io: BoxTransport,
    ) -> BoxFuture<'a, io::Result<BoxTransport>>;
}

/// The transport of one connection plus bytes read past the end of the previous
/// message.
pub(crate) struct Stream {
    io: BoxTransport,
    leftover: BytesMut,
}

impl Stream {
    pub fn new(io: BoxTransport) -> Stream {
        Stream {
            io,
            leftover: BytesMut::new(),
        }
    }

    pub fn into_inner(self) -> (BoxTransport, BytesMut) {
        (self.io, self.leftover)
    }

    /// Bytes that must be read before anything from the transport.
    pub fn take_leftover(&mut self) -> BytesMut {
        std::mem::take(&mut self.leftover)
    }

    pub fn set_leftover(&mut self, leftover: BytesMut) {
        self.leftover = leftover;
    }

    pub fn io_mut(&mut self) -> &mut BoxTransport {
        &mut self.io
    }

    pub async fn write_all(&mut self, buf: &[u8], timeout: Option<Duration>) -> Result<(), Error> {
        log_data(buf);
        let io = &mut self.io;
        with_timeout(timeout, Timeout::Write, async move {
            io.write_all(buf).await?;
            io.flush().await?;
            Ok(())
        })
        .await
    }

    /// Read more bytes into `buf`. `0` is EOF.
    pub async fn read_buf(
        &mut self,
        buf: &mut BytesMut,
        timeout: Option<Duration>,
    ) -> Result<usize, Error> {
        if buf.capacity() - buf.len() < 1024 {
            buf.reserve(8192);
        }
        let io = &mut self.io;
        let n = with_timeout(timeout, Timeout::Read, async move {
            Ok(io.read_buf(buf).await?)
        })
        .await?;
        Ok(n)
    }
}

/// A transport whose first reads come from `pre`.
///
/// Used to hand bytes that arrived behind a `CONNECT` reply to the TLS layer.
#[derive(Debug)]
pub(crate) struct Rewind<T> {
    pre: Option<Bytes>,
    inner: T,
}

impl<T> Rewind<T> {
    pub fn new(pre: Bytes, inner: T) -> Rewind<T> {
        let pre = if pre.is_empty() { None } else { Some(pre) };
        Rewind { pre, inner }
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for Rewind<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(mut prefix) = self.pre.take() {
            if !prefix.is_empty() {
                let n = prefix.len().min(buf.remaining());
                buf.put_slice(&prefix[..n]);
                prefix.advance(n);
                if !prefix.is_empty() {
                    self.pre = Some(prefix);
                }
                return Poll::Ready(Ok(()));
            }
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for Rewind<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("io", &self.io)
            .field("leftover", &self.leftover.len())
            .finish()
    }
}

/// Bound `fut` by `timeout`, if there is one.
pub(crate) async fn with_timeout<F, T>(
    timeout: Option<Duration>,
    kind: Timeout,
    fut: F,
) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match timeout {
        Some(d) => match tokio::time::timeout(d, fut).await {
            Ok(r) => r,
            Err(_) => Err(Error::Timeout(kind)),
        },
        None => fut.await,
    }
}

/// Resolve `host` and connect to each address in turn until one succeeds.
pub(crate) async fn connect_tcp(
    resolver: &dyn Resolver,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, Error> {
    // IPv6 literals come bracketed out of the URI.
    let literal = host.trim_start_matches('[').trim_end_matches(']');

    let addrs = match literal.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, port)],
        Err(_) => resolver
            .resolve(host, port)
            .await
            .map_err(|e| Error::NameResolution(format!("{}: {}", host, e)))?,
    };

    if addrs.is_empty() {
        return Err(Error::NameResolution(format!("{}: no addresses", host)));
    }

    let mut last_err = None;

    for addr in addrs {
        debug!("Connecting to {}", addr);
        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => {
                if let Err(e) = tcp.set_nodelay(true) {
                    warn!("tcp set_nodelay error: {}", e);
                }
                debug!("Connected to {}", addr);
                return Ok(tcp);
            }
            Ok(Err(e)) => {
                trace!("Connect error for {}: {}", addr, e);
                last_err = Some(format!("{}: {}", addr, e));
            }
            Err(_) => {
                trace!("Connect timeout for {}", addr);
                last_err = Some(format!("{}: timed out", addr));
            }
        }
    }

    Err(Error::ConnectFailed(last_err.unwrap_or_default()))
}
