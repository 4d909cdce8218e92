//! Sans-IO body framing.
//!
//! [`BodyWriter`] frames request body bytes into an output buffer, [`BodyReader`]
//! removes the framing from response body bytes. Neither does any I/O, the async
//! streams in [`crate::request`] and [`crate::response`] move the bytes.

use std::fmt;
use std::io::Write;

use http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode};

use crate::ext::{HeaderIterExt, StatusExt};
use crate::util::Writer;
use crate::Error;

/// How a message body is framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    /// No body at all.
    NoBody,
    /// Exactly this many bytes.
    LengthDelimited(u64),
    /// `transfer-encoding: chunked`.
    Chunked,
    /// Body ends when the peer closes the connection.
    CloseDelimited,
}

// //////////////////////////////////////////////////////////////////////////////////////////// WRITER

/// Frames a request body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyWriter {
    /// Nothing is sent after the headers.
    #[default]
    NoBody,
    /// Exactly `declared` bytes, `left` of which are still to be sent.
    Sized { declared: u64, left: u64 },
    /// Chunked, `ended` once the terminal chunk was produced.
    Chunked { ended: bool },
}

impl BodyWriter {
    /// No body.
    pub fn new_none() -> Self {
        BodyWriter::NoBody
    }

    /// Chunked body.
    pub fn new_chunked() -> Self {
        BodyWriter::Chunked { ended: false }
    }

    /// Body of exactly `len` bytes.
    pub fn new_sized(len: u64) -> Self {
        BodyWriter::Sized {
            declared: len,
            left: len,
        }
    }

    /// Tell whether there is anything to send after the headers.
    pub fn has_body(&self) -> bool {
        !matches!(self, BodyWriter::NoBody)
    }

    /// Tell if the framing is chunked.
    pub fn is_chunked(&self) -> bool {
        matches!(self, BodyWriter::Chunked { .. })
    }

    /// Tell if the entire body was produced.
    pub fn is_ended(&self) -> bool {
        match self {
            BodyWriter::NoBody => true,
            BodyWriter::Sized { left, .. } => *left == 0,
            BodyWriter::Chunked { ended } => *ended,
        }
    }

    /// Bytes still to send for a sized body. `None` when not sized.
    pub fn left_to_send(&self) -> Option<u64> {
        match self {
            BodyWriter::Sized { left, .. } => Some(*left),
            _ => None,
        }
    }

    /// The declared length of a sized body.
    pub fn declared(&self) -> Option<u64> {
        match self {
            BodyWriter::Sized { declared, .. } => Some(*declared),
            _ => None,
        }
    }

    /// The header announcing this framing.
    pub fn body_header(&self) -> Option<(HeaderName, HeaderValue)> {
        match self {
            BodyWriter::NoBody => None,
            BodyWriter::Sized { declared, .. } => {
                Some((header::CONTENT_LENGTH, HeaderValue::from(*declared)))
            }
            BodyWriter::Chunked { .. } => Some((
                header::TRANSFER_ENCODING,
                HeaderValue::from_static("chunked"),
            )),
        }
    }

    /// Frame `input` into `w`, returning how much of `input` was consumed.
    ///
    /// For chunked bodies an empty `input` produces the terminal chunk. Callers check
    /// [`left_to_send()`](Self::left_to_send) before writing to a sized body; excess
    /// input is never consumed.
    pub(crate) fn write(&mut self, input: &[u8], w: &mut Writer) -> usize {
        match self {
            BodyWriter::NoBody => 0,
            BodyWriter::Sized { left, .. } => {
                let max = (*left).min(w.available() as u64) as usize;
                let n = input.len().min(max);
                let success = w.try_write(|w| w.write_all(&input[..n]));
                if !success {
                    return 0;
                }
                *left -= n as u64;
                n
            }
            BodyWriter::Chunked { ended } => {
                if *ended {
                    return 0;
                }
                if input.is_empty() {
                    if w.try_write(|w| w.write_all(b"0\r\n\r\n")) {
                        *ended = true;
                    }
                    return 0;
                }
                let n = input.len().min(calculate_max_input(w.available()));
                if n == 0 {
                    return 0;
                }
                let success = w.try_write(|w| {
                    write!(w, "{:x}\r\n", n)?;
                    w.write_all(&input[..n])?;
                    write!(w, "\r\n")
                });
                if success {
                    n
                } else {
                    0
                }
            }
        }
    }

    /// Account for bytes the caller sent straight to the transport.
    pub(crate) fn consume_direct_write(&mut self, amount: usize) {
        if let BodyWriter::Sized { left, .. } = self {
            *left = left.saturating_sub(amount as u64);
        }
    }
}

/// The max amount of input that fits `output_len` bytes once chunk framed.
pub fn calculate_max_input(output_len: usize) -> usize {
    // <hex>\r\n<data>\r\n
    let guess = output_len.saturating_sub(4 + hex_len(output_len));
    if guess == 0 {
        return 0;
    }
    guess
}

fn hex_len(n: usize) -> usize {
    let mut len = 1;
    let mut n = n >> 4;
    while n > 0 {
        len += 1;
        n >>= 4;
    }
    len
}

// //////////////////////////////////////////////////////////////////////////////////////////// READER

/// Removes the framing from a response body.
#[derive(Debug)]
pub enum BodyReader {
    /// No body is expected.
    NoBody,
    /// This many bytes are left.
    LengthDelimited(u64),
    /// Chunked decoding.
    Chunked(Dechunker),
    /// Body runs until the peer closes.
    CloseDelimited,
}

impl BodyReader {
    /// Decide the framing of a response body, evaluated once the head is parsed.
    ///
    /// 1. `HEAD`, 1xx, 204 and 304 have no body.
    /// 2. `transfer-encoding: chunked` wins over `content-length`.
    /// 3. A valid `content-length` is exact.
    /// 4. Anything else is close delimited.
    pub fn for_response(
        method: &Method,
        status: StatusCode,
        headers: &HeaderMap,
    ) -> Result<BodyReader, Error> {
        if *method == Method::HEAD || status.body_forbidden() {
            return Ok(BodyReader::NoBody);
        }

        if *method == Method::CONNECT && status.is_success() {
            return Ok(BodyReader::NoBody);
        }

        if headers.iter().has(header::TRANSFER_ENCODING, "chunked") {
            return Ok(BodyReader::Chunked(Dechunker::new()));
        }

        if let Some(len) = content_length(headers)? {
            return Ok(BodyReader::LengthDelimited(len));
        }

        Ok(BodyReader::CloseDelimited)
    }

    /// The mode this reader decodes.
    pub fn body_mode(&self) -> BodyMode {
        match self {
            BodyReader::NoBody => BodyMode::NoBody,
            BodyReader::LengthDelimited(v) => BodyMode::LengthDelimited(*v),
            BodyReader::Chunked(_) => BodyMode::Chunked,
            BodyReader::CloseDelimited => BodyMode::CloseDelimited,
        }
    }

    /// Tell if the body is complete. A close delimited body never is, the
    /// transport EOF ends it.
    pub fn is_ended(&self) -> bool {
        match self {
            BodyReader::NoBody => true,
            BodyReader::LengthDelimited(v) => *v == 0,
            BodyReader::Chunked(v) => v.is_ended(),
            BodyReader::CloseDelimited => false,
        }
    }

    /// Tell if the body is close delimited.
    pub fn is_close_delimited(&self) -> bool {
        matches!(self, BodyReader::CloseDelimited)
    }

    /// Decode body bytes from `input` to `output`.
    ///
    /// The result `(usize, usize)` is `(input consumed, output used)`. `(0, 0)` with a
    /// non-empty `input` and `output` never happens before the body has ended.
    pub fn read(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), Error> {
        match self {
            BodyReader::NoBody => Ok((0, 0)),
            BodyReader::LengthDelimited(left) => {
                let n = input
                    .len()
                    .min(output.len())
                    .min((*left).min(usize::MAX as u64) as usize);
                output[..n].copy_from_slice(&input[..n]);
                *left -= n as u64;
                Ok((n, n))
            }
            BodyReader::Chunked(d) => d.read(input, output),
            BodyReader::CloseDelimited => {
                let n = input.len().min(output.len());
                output[..n].copy_from_slice(&input[..n]);
                Ok((n, n))
            }
        }
    }
}

/// Parse all `content-length` headers. Differing values are ambiguous, an
/// unparsable value is treated as absent.
fn content_length(headers: &HeaderMap) -> Result<Option<u64>, Error> {
    let mut found: Option<u64> = None;

    for v in headers.get_all(header::CONTENT_LENGTH) {
        let Some(len) = v.to_str().ok().and_then(|s| s.trim().parse::<u64>().ok()) else {
            debug!("Ignoring invalid content-length: {:?}", v);
            return Ok(None);
        };
        match found {
            Some(prev) if prev != len => return Err(Error::AmbiguousContentLength),
            _ => found = Some(len),
        }
    }

    Ok(found)
}

/// Chunked transfer decoding state.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Dechunker {
    state: ChunkState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Reading hex digits of the chunk size.
    Size { len: u64, digits: u8 },
    /// Skipping a chunk extension up to CR.
    Extension { len: u64 },
    /// Seen CR after size, expecting LF.
    SizeLf { len: u64 },
    /// Copying chunk data.
    Data { left: u64 },
    /// Expecting CR after data.
    DataCr,
    /// Expecting LF after data.
    DataLf,
    /// Reading trailer lines after the zero chunk. `empty` while the line has no bytes.
    Trailer { empty: bool },
    /// Seen CR in a trailer line.
    TrailerLf { empty: bool },
    Ended,
}

impl Dechunker {
    pub(crate) fn new() -> Self {
        Dechunker {
            state: ChunkState::Size { len: 0, digits: 0 },
        }
    }

    fn is_ended(&self) -> bool {
        self.state == ChunkState::Ended
    }

    fn read(&mut self, input: &[u8], output: &mut [u8]) -> Result<(usize, usize), Error> {
        let mut i = 0;
        let mut o = 0;

        while i < input.len() {
            match &mut self.state {
                ChunkState::Data { left } => {
                    let n = (input.len() - i)
                        .min(output.len() - o)
                        .min((*left).min(usize::MAX as u64) as usize);
                    if n == 0 {
                        // Output full.
                        break;
                    }
                    output[o..o + n].copy_from_slice(&input[i..i + n]);
                    i += n;
                    o += n;
                    *left -= n as u64;
                    if *left == 0 {
                        self.state = ChunkState::DataCr;
                    }
                }
                ChunkState::Ended => break,
                _ => {
                    self.step(input[i])?;
                    i += 1;
                }
            }
        }

        Ok((i, o))
    }

    fn step(&mut self, b: u8) -> Result<(), Error> {
        self.state = match self.state {
            ChunkState::Size { len, digits } => {
                if !b.is_ascii() {
                    return Err(Error::ChunkLenNotAscii);
                }
                match b {
                    b'\r' if digits > 0 => ChunkState::SizeLf { len },
                    b';' if digits > 0 => ChunkState::Extension { len },
                    // Tolerate whitespace between size and CRLF/extension.
                    b' ' | b'\t' if digits > 0 => ChunkState::Extension { len },
                    _ => {
                        let d = (b as char)
                            .to_digit(16)
                            .ok_or(Error::ChunkLenNotANumber)?;
                        // 16 hex digits is the most a u64 holds.
                        if digits >= 16 {
                            return Err(Error::ChunkLenNotANumber);
                        }
                        ChunkState::Size {
                            len: len << 4 | d as u64,
                            digits: digits + 1,
                        }
                    }
                }
            }
            ChunkState::Extension { len } => {
                if !b.is_ascii() {
                    return Err(Error::ChunkLenNotAscii);
                }
                if b == b'\r' {
                    ChunkState::SizeLf { len }
                } else {
                    ChunkState::Extension { len }
                }
            }
            ChunkState::SizeLf { len } => {
                if b != b'\n' {
                    return Err(Error::ChunkExpectedCrLf);
                }
                if len == 0 {
                    ChunkState::Trailer { empty: true }
                } else {
                    ChunkState::Data { left: len }
                }
            }
            ChunkState::DataCr => {
                if b != b'\r' {
                    return Err(Error::ChunkExpectedCrLf);
                }
                ChunkState::DataLf
            }
            ChunkState::DataLf => {
                if b != b'\n' {
                    return Err(Error::ChunkExpectedCrLf);
                }
                ChunkState::Size { len: 0, digits: 0 }
            }
            ChunkState::Trailer { empty } => {
                if b == b'\r' {
                    ChunkState::TrailerLf { empty }
                } else {
                    ChunkState::Trailer { empty: false }
                }
            }
            ChunkState::TrailerLf { empty } => {
                if b != b'\n' {
                    return Err(Error::ChunkExpectedCrLf);
                }
                if empty {
                    ChunkState::Ended
                } else {
                    ChunkState::Trailer { empty: true }
                }
            }
            // Handled by the caller.
            s @ (ChunkState::Data { .. } | ChunkState::Ended) => s,
        };
        Ok(())
    }
}

impl fmt::Debug for Dechunker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Dechunker({:?})", self.state)
    }
}
