//! Response head reading and the response body stream.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use http::{header, response, HeaderMap, Method, Response, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::oneshot;
use tokio::time::Sleep;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

#[cfg(any(feature = "gzip", feature = "deflate"))]
use tokio::io::BufReader;

use crate::body::{BodyMode, BodyReader};
use crate::close_reason::CloseReason;
use crate::config::{ContinueCallback, Decompression};
use crate::ext::{HeaderIterExt, StatusExt};
use crate::parser::{check_head_size, try_parse_response};
use crate::transport::Stream;
use crate::util::compare_lowercase_ascii;
use crate::{Error, MAX_RESPONSE_HEADERS};

/// Read a response head, looping past interim `1xx` responses.
///
/// `on_continue` is invoked for the first `100 Continue` only. Returns the head and
/// the bytes read past it.
pub(crate) async fn read_head(
    stream: &mut Stream,
    read_timeout: Option<Duration>,
    on_continue: Option<&ContinueCallback>,
) -> Result<(Response<()>, BytesMut), Error> {
    let mut buf = stream.take_leftover();
    let mut continued = false;

    loop {
        if let Some((used, res)) = try_parse_response::<MAX_RESPONSE_HEADERS>(&buf)? {
            buf.advance(used);

            if res.status().is_interim() {
                debug!("Skip interim response: {}", res.status());
                if res.status() == StatusCode::CONTINUE && !continued {
                    continued = true;
                    if let Some(cb) = on_continue {
                        cb(res.status(), res.headers());
                    }
                }
                continue;
            }

            return Ok((res, buf));
        }

        check_head_size(buf.len())?;
        let n = stream.read_buf(&mut buf, read_timeout).await?;
        if n == 0 {
            return Err(Error::UnexpectedEof);
        }
    }
}

/// Why the connection can't be kept after this response, if it can't.
pub(crate) fn close_reason(
    request_keep_alive: bool,
    res: &Response<()>,
    reader: &BodyReader,
) -> Option<CloseReason> {
    if !request_keep_alive {
        return Some(CloseReason::ClientConnectionClose);
    }

    let headers = res.headers();

    if headers.iter().has(header::CONNECTION, "close") {
        return Some(CloseReason::ServerConnectionClose);
    }

    if res.version() == Version::HTTP_10 && !headers.iter().has(header::CONNECTION, "keep-alive")
    {
        return Some(CloseReason::Http10);
    }

    if reader.is_close_delimited() {
        return Some(CloseReason::CloseDelimitedBody);
    }

    None
}

/// Read and discard a body so the stream is positioned at the next message.
///
/// Returns `false` when the body can't be delimited without the peer closing.
pub(crate) async fn discard_body(
    stream: &mut Stream,
    mut buf: BytesMut,
    reader: &mut BodyReader,
    read_timeout: Option<Duration>,
) -> Result<bool, Error> {
    if reader.is_close_delimited() {
        return Ok(false);
    }

    let mut scratch = [0_u8; 1024];

    while !reader.is_ended() {
        if buf.is_empty() {
            let n = stream.read_buf(&mut buf, read_timeout).await?;
            if n == 0 {
                return Ok(false);
            }
        }
        let (used, _) = reader.read(&buf, &mut scratch)?;
        buf.advance(used);
    }

    stream.set_leftover(buf);
    Ok(true)
}

/// Sent to the operation when the body is done with the connection.
pub(crate) struct Release {
    /// `Some` when the connection can be kept alive.
    pub stream: Option<Stream>,
    pub result: Result<(), Error>,
}

// //////////////////////////////////////////////////////////////////////////////////////////// FRAMED

/// Body bytes of one response with the transfer framing removed.
pub(crate) struct FramedBody {
    stream: Option<Stream>,
    input: BytesMut,
    reader: BodyReader,
    close_reason: Option<CloseReason>,
    release: Option<oneshot::Sender<Release>>,
    cancel: Pin<Box<WaitForCancellationFutureOwned>>,
    read_timeout: Option<Duration>,
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
    error: Option<Error>,
}

impl FramedBody {
    pub fn new(
        stream: Stream,
        input: BytesMut,
        reader: BodyReader,
        close_reason: Option<CloseReason>,
        release: oneshot::Sender<Release>,
        cancel: CancellationToken,
        read_timeout: Option<Duration>,
    ) -> FramedBody {
        let mut body = FramedBody {
            stream: Some(stream),
            input,
            reader,
            close_reason,
            release: Some(release),
            cancel: Box::pin(cancel.cancelled_owned()),
            read_timeout,
            sleep: None,
            done: false,
            error: None,
        };

        if body.reader.is_ended() {
            trace!("Response has no body");
            body.finish();
        } else if let BodyReader::LengthDelimited(len) = body.reader {
            if body.input.len() as u64 >= len {
                // The whole body came with the head. Serve it from memory and hand the
                // connection back right away.
                trace!("Response body of {} bytes already buffered", len);
                let rest = body.input.split_off(len as usize);
                let mut stream = body.stream.take();
                if let Some(s) = &mut stream {
                    s.set_leftover(rest);
                }
                body.release(stream, Ok(()));
            }
        }

        body
    }

    pub fn body_mode(&self) -> BodyMode {
        self.reader.body_mode()
    }

    fn release(&mut self, stream: Option<Stream>, result: Result<(), Error>) {
        let Some(tx) = self.release.take() else {
            return;
        };
        let stream = match (&self.close_reason, result.is_ok()) {
            (None, true) => stream,
            (Some(reason), _) => {
                debug!("Close connection: {}", reason.explain());
                None
            }
            (None, false) => None,
        };
        let _ = tx.send(Release { stream, result });
    }

    fn finish(&mut self) {
        self.done = true;
        let mut stream = self.stream.take();
        if let Some(s) = &mut stream {
            s.set_leftover(std::mem::take(&mut self.input));
        }
        self.release(stream, Ok(()));
    }

    fn fail(&mut self, e: Error) -> io::Error {
        debug!("Response body failed: {}", e);
        self.done = true;
        self.stream = None;
        self.error = Some(e.clone());
        self.release(None, Err(e.clone()));
        e.into_io()
    }

    fn poll_body(&mut self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if let Some(e) = &self.error {
            return Poll::Ready(Err(e.clone().into_io()));
        }

        loop {
            if self.done || buf.remaining() == 0 {
                return Poll::Ready(Ok(()));
            }

            if self.cancel.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(self.fail(Error::RequestCanceled)));
            }

            if self.reader.is_ended() {
                self.finish();
                return Poll::Ready(Ok(()));
            }

            if !self.input.is_empty() {
                let (used, n) = match self.reader.read(&self.input, buf.initialize_unfilled()) {
                    Ok(v) => v,
                    Err(e) => return Poll::Ready(Err(self.fail(e))),
                };
                self.input.advance(used);
                buf.advance(n);

                if self.reader.is_ended() {
                    self.finish();
                }

                if n > 0 {
                    return Poll::Ready(Ok(()));
                }
                if used > 0 {
                    continue;
                }
            }

            let Some(stream) = self.stream.as_mut() else {
                // Buffered bodies never need the stream.
                return Poll::Ready(Err(self.fail(Error::UnexpectedEof)));
            };

            if let Some(d) = self.read_timeout {
                let sleep = self
                    .sleep
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(d)));
                if sleep.as_mut().poll(cx).is_ready() {
                    return Poll::Ready(Err(self.fail(Error::Timeout(crate::Timeout::Read))));
                }
            }

            if self.input.capacity() - self.input.len() < 1024 {
                self.input.reserve(8192);
            }

            let polled = tokio_util::io::poll_read_buf(Pin::new(stream.io_mut()), cx, &mut self.input);

            match ready!(polled) {
                Ok(0) => {
                    self.sleep = None;
                    if self.reader.is_close_delimited() {
                        trace!("Close delimited body ended");
                        self.finish();
                        return Poll::Ready(Ok(()));
                    }
                    return Poll::Ready(Err(self.fail(Error::UnexpectedEof)));
                }
                Ok(n) => {
                    trace!("Read {} body bytes", n);
                    self.sleep = None;
                }
                Err(e) => return Poll::Ready(Err(self.fail(e.into()))),
            }
        }
    }

    /// Consume the rest of the body without keeping it.
    fn poll_drain(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut scratch = [0_u8; 1024];
        loop {
            let mut rb = ReadBuf::new(&mut scratch);
            ready!(self.poll_body(cx, &mut rb))?;
            if rb.filled().is_empty() {
                return Poll::Ready(Ok(()));
            }
        }
    }
}

impl AsyncRead for FramedBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().poll_body(cx, buf)
    }
}

impl Drop for FramedBody {
    fn drop(&mut self) {
        if self.release.is_some() {
            debug!("Response body dropped before end");
            // Unread body bytes make the connection unusable.
            self.close_reason = self.close_reason.or(Some(CloseReason::ClientConnectionClose));
            self.release(None, Ok(()));
        }
    }
}

enum BodyStream {
    Plain(FramedBody),
    #[cfg(feature = "gzip")]
    Gzip(async_compression::tokio::bufread::GzipDecoder<BufReader<FramedBody>>),
    #[cfg(feature = "deflate")]
    Deflate(async_compression::tokio::bufread::ZlibDecoder<BufReader<FramedBody>>),
}

// //////////////////////////////////////////////////////////////////////////////////////////// STREAM

/// A received response: status, headers and the body to read.
///
/// Read the body with [`tokio::io::AsyncRead`]. Once the body is read to the end the
/// connection goes back to its pool, dropping the stream before that closes it.
pub struct ResponseStream {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    mode: BodyMode,
    body: BodyStream,
}

impl ResponseStream {
    pub(crate) fn new(
        res: Response<()>,
        body: FramedBody,
        decompression: Decompression,
    ) -> ResponseStream {
        let (parts, _) = res.into_parts();
        let response::Parts {
            status,
            version,
            mut headers,
            ..
        } = parts;

        let mode = body.body_mode();
        let body = wrap_decoder(body, &mut headers, decompression);

        ResponseStream {
            status,
            version,
            headers,
            mode,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Response headers. `content-encoding` is removed when the body is decoded.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// How the body is framed on the wire.
    pub fn body_mode(&self) -> BodyMode {
        self.mode
    }

    /// Read the entire body.
    pub async fn bytes(&mut self) -> Result<Vec<u8>, Error> {
        let mut out = Vec::new();
        self.read_to_end(&mut out).await?;
        Ok(out)
    }

    /// Read the entire body as a string, lossily.
    pub async fn text(&mut self) -> Result<String, Error> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

fn wrap_decoder(body: FramedBody, headers: &mut HeaderMap, d: Decompression) -> BodyStream {
    let encoding = headers
        .get(header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    let Some(encoding) = encoding else {
        return BodyStream::Plain(body);
    };

    #[cfg(feature = "gzip")]
    if d.gzip && (compare_lowercase_ascii(&encoding, "gzip") || encoding == "x-gzip") {
        headers.remove(header::CONTENT_ENCODING);
        let decoder = async_compression::tokio::bufread::GzipDecoder::new(BufReader::new(body));
        return BodyStream::Gzip(decoder);
    }

    #[cfg(feature = "deflate")]
    if d.deflate && compare_lowercase_ascii(&encoding, "deflate") {
        headers.remove(header::CONTENT_ENCODING);
        let decoder = async_compression::tokio::bufread::ZlibDecoder::new(BufReader::new(body));
        return BodyStream::Deflate(decoder);
    }

    let _ = (d, encoding);
    BodyStream::Plain(body)
}

/// Poll a decoder, then drain the framing it left unread once it reports the end.
#[cfg(any(feature = "gzip", feature = "deflate"))]
fn poll_decoded<D>(
    decoder: &mut D,
    framed: impl FnOnce(&mut D) -> &mut FramedBody,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
) -> Poll<io::Result<()>>
where
    D: AsyncRead + Unpin,
{
    let before = buf.filled().len();
    ready!(Pin::new(&mut *decoder).poll_read(cx, buf))?;
    if buf.filled().len() == before && buf.remaining() > 0 {
        ready!(framed(decoder).poll_drain(cx))?;
    }
    Poll::Ready(Ok(()))
}

impl AsyncRead for ResponseStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().body {
            BodyStream::Plain(b) => b.poll_body(cx, buf),
            #[cfg(feature = "gzip")]
            BodyStream::Gzip(d) => poll_decoded(d, |d| d.get_mut().get_mut(), cx, buf),
            #[cfg(feature = "deflate")]
            BodyStream::Deflate(d) => poll_decoded(d, |d| d.get_mut().get_mut(), cx, buf),
        }
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("status", &self.status)
            .field("version", &self.version)
            .field("mode", &self.mode)
            .finish()
    }
}

/// Framing decision for a response to `method`.
pub(crate) fn body_reader(method: &Method, res: &Response<()>) -> Result<BodyReader, Error> {
    BodyReader::for_response(method, res.status(), res.headers())
}
