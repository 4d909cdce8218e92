use http::{HeaderName, HeaderValue, Response, StatusCode, Version};

use crate::{Error, MAX_RESPONSE_HEAD_SIZE};

/// Fail when `buffered` bytes still don't hold a complete head.
pub(crate) fn check_head_size(buffered: usize) -> Result<(), Error> {
    if buffered >= MAX_RESPONSE_HEAD_SIZE {
        return Err(Error::HttpParseFail(format!(
            "response head exceeds {} bytes",
            MAX_RESPONSE_HEAD_SIZE
        )));
    }
    Ok(())
}

/// Try to parse a status line and headers from `input`.
///
/// Returns `Ok(None)` until `input` holds the entire head, i.e. up to and including
/// the blank line. On success the `usize` is the number of input bytes consumed; the
/// remainder belongs to the body (or the next message).
///
/// `N` bounds the number of headers. `N = 0` parses a bare status line, which is how
/// an interim `100 Continue` is recognized without headers.
pub fn try_parse_response<const N: usize>(
    input: &[u8],
) -> Result<Option<(usize, Response<()>)>, Error> {
    let mut headers = [httparse::EMPTY_HEADER; N];
    let mut res = httparse::Response::new(&mut headers);

    let input_used = match res.parse(input) {
        Ok(httparse::Status::Complete(v)) => v,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(httparse::Error::TooManyHeaders) => return Err(Error::HttpParseTooManyHeaders),
        Err(e) => return Err(e.into()),
    };

    let version = match res.version {
        Some(0) => Version::HTTP_10,
        Some(1) => Version::HTTP_11,
        _ => return Err(Error::UnsupportedVersion),
    };

    // httparse guarantees a code on Complete.
    let code = res.code.unwrap_or_default();
    let status = StatusCode::from_u16(code)
        .map_err(|_| Error::HttpParseFail(format!("bad status code: {}", code)))?;

    let mut response = Response::new(());
    *response.version_mut() = version;
    *response.status_mut() = status;

    let map = response.headers_mut();
    map.reserve(res.headers.len());
    for h in res.headers.iter() {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|e| Error::BadHeader(e.to_string()))?;
        let value =
            HeaderValue::from_bytes(h.value).map_err(|e| Error::BadHeader(e.to_string()))?;
        map.append(name, value);
    }

    Ok(Some((input_used, response)))
}
