//! One logical request from connection lease to the end of its response body.

use std::fmt;
use std::sync::Arc;

use http::{header, request, StatusCode};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio_util::sync::CancellationToken;

use crate::auth::{self, AuthAnswer, AuthContext};
use crate::close_reason::CloseReason;
use crate::connection::{self, Lease, NtlmBinding};
use crate::pool::Context;
use crate::request::{AuthHeaders, Body, RequestHead, RequestStream, RequestWriter};
use crate::response::{self, FramedBody, Release, ResponseStream};
use crate::transport::Stream;
use crate::{CallOptions, Endpoint, Error};

type Signal<T> = Option<oneshot::Sender<Result<T, Error>>>;

/// The four completion futures of an operation, caller side senders.
#[derive(Default)]
pub(crate) struct Completion {
    request_stream: Signal<RequestStream>,
    request_written: Signal<()>,
    response: Signal<ResponseStream>,
    finished: Signal<()>,
}

impl Completion {
    fn request_written(&mut self) {
        if let Some(tx) = self.request_written.take() {
            let _ = tx.send(Ok(()));
        }
    }

    fn finished(&mut self, result: Result<(), Error>) {
        if let Some(tx) = self.finished.take() {
            let _ = tx.send(result);
        }
    }

    /// Fail every future not yet resolved.
    pub fn fail_all(&mut self, e: Error) {
        if let Some(tx) = self.request_stream.take() {
            let _ = tx.send(Err(e.clone()));
        }
        if let Some(tx) = self.request_written.take() {
            let _ = tx.send(Err(e.clone()));
        }
        if let Some(tx) = self.response.take() {
            let _ = tx.send(Err(e.clone()));
        }
        if let Some(tx) = self.finished.take() {
            let _ = tx.send(Err(e));
        }
    }
}

/// Auth state carried from one attempt of a request to its successor.
#[derive(Debug, Clone, Default)]
pub(crate) struct AuthState {
    pub headers: AuthHeaders,
    pub retries: usize,
    /// The last answer came from a connection-based scheme.
    pub connection_based: bool,
    /// The last answer was for a proxy.
    pub proxy: bool,
}

impl AuthState {
    fn may_retry(&self) -> bool {
        let bound = if self.connection_based { 2 } else { 1 };
        self.retries < bound
    }
}

/// A queued or running request.
pub(crate) struct Operation {
    pub id: u64,
    parts: Arc<request::Parts>,
    body: Body,
    pub options: Arc<CallOptions>,
    pub auth: AuthState,
    pub cancel: CancellationToken,
    completion: Completion,
    /// Set on a successor whose connection could not carry it.
    pub force_new_connection: bool,
}

impl Operation {
    pub fn new(
        id: u64,
        parts: request::Parts,
        body: Body,
        options: CallOptions,
        wake: Arc<Notify>,
    ) -> (Operation, Call) {
        let cancel = CancellationToken::new();
        let streaming = matches!(body, Body::Streaming);

        let (stream_tx, stream_rx) = oneshot::channel();
        let (written_tx, written_rx) = oneshot::channel();
        let (response_tx, response_rx) = oneshot::channel();
        let (finished_tx, finished_rx) = oneshot::channel();

        let completion = Completion {
            request_stream: streaming.then_some(stream_tx),
            request_written: Some(written_tx),
            response: Some(response_tx),
            finished: Some(finished_tx),
        };

        let op = Operation {
            id,
            parts: Arc::new(parts),
            body,
            options: Arc::new(options),
            auth: AuthState::default(),
            cancel: cancel.clone(),
            completion,
            force_new_connection: false,
        };

        let call = Call {
            id,
            streaming,
            request_stream: streaming.then_some(stream_rx),
            request_written: Waiter::new(written_rx),
            response: Some(response_rx),
            finished: Waiter::new(finished_rx),
            cancel,
            wake,
        };

        (op, call)
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn group(&self) -> &str {
        &self.options.connection_group
    }

    /// Cancel and fail every pending future.
    pub fn abort(&mut self, e: Error) {
        self.cancel.cancel();
        self.completion.fail_all(e);
    }

    /// The same request sent again with `answer` to a challenge.
    fn successor(&mut self, body: Body, answer: AuthAnswer, proxy: bool) -> Operation {
        let mut auth = self.auth.clone();
        if proxy {
            auth.headers.proxy_authorization = Some(answer.value);
        } else {
            auth.headers.authorization = Some(answer.value);
        }
        auth.retries += 1;
        auth.connection_based = answer.connection_based;
        auth.proxy = proxy;

        Operation {
            id: self.id,
            parts: self.parts.clone(),
            body,
            options: self.options.clone(),
            auth,
            cancel: self.cancel.clone(),
            completion: std::mem::take(&mut self.completion),
            force_new_connection: false,
        }
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("id", &self.id)
            .field("method", &self.parts.method)
            .field("uri", &self.parts.uri)
            .field("retries", &self.auth.retries)
            .finish()
    }
}

// //////////////////////////////////////////////////////////////////////////////////////////// RUN

/// Reported to the scheduler when an operation lets go of its connection.
#[derive(Debug)]
pub(crate) struct Finished {
    pub conn_id: u64,
    pub group: String,
    pub op_id: u64,
    pub outcome: Outcome,
}

#[derive(Debug)]
pub(crate) enum Outcome {
    /// The response completed. `stream` is `Some` when the connection can be kept.
    Done {
        stream: Option<Stream>,
        binding: Option<NtlmBinding>,
    },
    /// The connection must be closed.
    Failed,
    /// The request must be sent again, preferably on the same connection.
    Successor { op: Operation, stream: Option<Stream> },
}

enum Step {
    Done {
        stream: Option<Stream>,
        binding: Option<NtlmBinding>,
    },
    Retry {
        op: Operation,
        stream: Option<Stream>,
    },
}

/// Drive `op` on the leased connection and report back on `tx`.
pub(crate) async fn run(
    ctx: Arc<Context>,
    endpoint: Endpoint,
    lease: Lease,
    mut op: Operation,
    tx: mpsc::UnboundedSender<Finished>,
) {
    let conn_id = lease.conn_id;
    let group = lease.group.clone();
    let op_id = op.id;
    let cancel = op.cancel.clone();

    debug!("Operation {} start on connection {}", op_id, conn_id);

    let result = tokio::select! {
        r = drive(&ctx, &endpoint, lease, &mut op) => r,
        _ = cancel.cancelled() => Err(Error::RequestCanceled),
    };

    let outcome = match result {
        Ok(Step::Done { stream, binding }) => {
            debug!("Operation {} done, keep-alive: {}", op_id, stream.is_some());
            Outcome::Done { stream, binding }
        }
        Ok(Step::Retry { op, stream }) => {
            debug!("Operation {} continues with auth retry {}", op_id, op.auth.retries);
            Outcome::Successor { op, stream }
        }
        Err(e) => {
            debug!("Operation {} failed: {}", op_id, e);
            op.completion.fail_all(e);
            Outcome::Failed
        }
    };

    let finished = Finished {
        conn_id,
        group,
        op_id,
        outcome,
    };

    if tx.send(finished).is_err() {
        trace!("Scheduler gone before operation {} finished", op_id);
    }
}

async fn drive(
    ctx: &Context,
    endpoint: &Endpoint,
    lease: Lease,
    op: &mut Operation,
) -> Result<Step, Error> {
    let stream = match lease.stream {
        Some(s) => s,
        None => connection::establish(ctx, endpoint, lease.connect_timeout, &op.options).await?,
    };

    let head = RequestHead::new(&op.parts, endpoint, &op.options, &op.auth.headers)?;
    let keep_alive = head.keep_alive();

    let (has_body, body_len) = match &op.body {
        Body::Empty => (false, None),
        Body::Full(b) => (true, Some(b.len() as u64)),
        Body::Streaming => (true, None),
    };

    let mut writer = RequestWriter::new(stream, head, &op.options, has_body, body_len)?;

    let (mut stream, replay) = match op.body.clone() {
        Body::Empty => writer.close().await?,
        Body::Full(b) => {
            writer.write(&b).await?;
            writer.close().await?
        }
        Body::Streaming => {
            let (done_tx, done_rx) = oneshot::channel();
            let rs = RequestStream::new(writer, done_tx, op.cancel.clone());
            let tx = op
                .completion
                .request_stream
                .take()
                .ok_or(Error::NoRequestStream)?;
            // A refused send drops the stream, which reports cancellation on done_rx.
            let _ = tx.send(Ok(rs));
            done_rx.await.unwrap_or(Err(Error::RequestCanceled))?
        }
    };

    trace!("Operation {} request written", op.id);
    op.completion.request_written();

    let read_timeout = op.options.read_timeout;
    let (res, buf) =
        response::read_head(&mut stream, read_timeout, op.options.on_continue.as_ref()).await?;

    debug!("Operation {} response: {}", op.id, res.status());

    let mut reader = response::body_reader(&op.parts.method, &res)?;
    let mut reason = response::close_reason(keep_alive, &res, &reader);
    if lease.last && reason.is_none() {
        reason = Some(CloseReason::TooManyReuses);
    }

    let replayable = match &op.body {
        Body::Streaming => replay.map(Body::Full),
        b => Some(b.clone()),
    };

    if let Some(body) = replayable {
        if let Some((answer, proxy)) = challenge_answer(ctx, endpoint, op, res.status(), res.headers()) {
            let kept = if reason.is_none() {
                match response::discard_body(&mut stream, buf, &mut reader, read_timeout).await {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("Discarding challenge body failed: {}", e);
                        false
                    }
                }
            } else {
                false
            };

            let next = op.successor(body, answer, proxy);
            return Ok(Step::Retry {
                op: next,
                stream: kept.then_some(stream),
            });
        }
    }

    let status = res.status();
    let (release_tx, release_rx) = oneshot::channel();
    let body = FramedBody::new(
        stream,
        buf,
        reader,
        reason,
        release_tx,
        op.cancel.clone(),
        read_timeout,
    );
    let rs = ResponseStream::new(res, body, op.options.decompression);

    if let Some(tx) = op.completion.response.take() {
        // A caller that went away drops the stream, which releases the connection.
        let _ = tx.send(Ok(rs));
    }

    let release = release_rx.await.unwrap_or(Release {
        stream: None,
        result: Ok(()),
    });

    release.result.clone()?;
    op.completion.finished(Ok(()));

    let binding = (op.auth.connection_based && !op.auth.proxy && status.as_u16() < 400).then(|| {
        debug!("Connection authenticated with a connection-based scheme");
        NtlmBinding {
            credentials: op.options.credentials.clone(),
            unsafe_sharing: op.options.unsafe_authenticated_connection_sharing,
        }
    });

    Ok(Step::Done {
        stream: release.stream,
        binding,
    })
}

/// An answer to a `401`, or a `407` from a proxy we talk HTTP to, if one can be given.
fn challenge_answer(
    ctx: &Context,
    endpoint: &Endpoint,
    op: &Operation,
    status: StatusCode,
    headers: &http::HeaderMap,
) -> Option<(AuthAnswer, bool)> {
    let (name, credentials, proxy) = match status {
        StatusCode::UNAUTHORIZED => (
            header::WWW_AUTHENTICATE,
            op.options.credentials.as_ref()?,
            false,
        ),
        StatusCode::PROXY_AUTHENTICATION_REQUIRED if endpoint.uses_absolute_form() => (
            header::PROXY_AUTHENTICATE,
            endpoint.proxy()?.credentials.as_ref()?,
            true,
        ),
        _ => return None,
    };

    if !op.auth.may_retry() {
        debug!("Operation {} out of auth retries", op.id);
        return None;
    }

    let challenges = auth::challenges(headers, &name);
    if challenges.is_empty() {
        return None;
    }

    let auth_ctx = AuthContext {
        method: &op.parts.method,
        uri: &op.parts.uri,
        proxy,
    };

    let answer = auth::answer(&ctx.authenticators, &challenges, &auth_ctx, credentials)?;
    Some((answer, proxy))
}

// //////////////////////////////////////////////////////////////////////////////////////////// CALL

struct Waiter {
    rx: Option<oneshot::Receiver<Result<(), Error>>>,
    result: Option<Result<(), Error>>,
}

impl Waiter {
    fn new(rx: oneshot::Receiver<Result<(), Error>>) -> Self {
        Waiter {
            rx: Some(rx),
            result: None,
        }
    }

    async fn wait(&mut self, cancel: &CancellationToken) -> Result<(), Error> {
        if let Some(r) = &self.result {
            return r.clone();
        }
        let r = match self.rx.as_mut() {
            Some(rx) => wait(rx, cancel).await,
            None => Err(Error::RequestCanceled),
        };
        self.rx = None;
        self.result = Some(r.clone());
        r
    }
}

async fn wait<T>(
    rx: &mut oneshot::Receiver<Result<T, Error>>,
    cancel: &CancellationToken,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        r = rx => r.unwrap_or(Err(Error::RequestCanceled)),
        _ = cancel.cancelled() => Err(Error::RequestCanceled),
    }
}

/// Caller handle for a submitted request.
///
/// Each future resolves exactly once. After [`abort()`](Self::abort) all unresolved
/// futures resolve with [`Error::RequestCanceled`].
pub struct Call {
    id: u64,
    streaming: bool,
    request_stream: Option<oneshot::Receiver<Result<RequestStream, Error>>>,
    request_written: Waiter,
    response: Option<oneshot::Receiver<Result<ResponseStream, Error>>>,
    finished: Waiter,
    cancel: CancellationToken,
    wake: Arc<Notify>,
}

impl Call {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The writer for a [`Body::Streaming`] request, once a connection is ready.
    pub async fn request_stream(&mut self) -> Result<RequestStream, Error> {
        if !self.streaming {
            return Err(Error::NoRequestStream);
        }
        let mut rx = self.request_stream.take().ok_or(Error::StreamTaken)?;
        wait(&mut rx, &self.cancel).await
    }

    /// Resolves when the whole request has been sent.
    pub async fn request_written(&mut self) -> Result<(), Error> {
        self.request_written.wait(&self.cancel).await
    }

    /// The response, once its head is received.
    pub async fn response(&mut self) -> Result<ResponseStream, Error> {
        let mut rx = self.response.take().ok_or(Error::StreamTaken)?;
        wait(&mut rx, &self.cancel).await
    }

    /// Resolves when the response body has been read to its end or dropped.
    pub async fn finished(&mut self) -> Result<(), Error> {
        self.finished.wait(&self.cancel).await
    }

    /// Cancel the request. Idempotent.
    pub fn abort(&self) {
        if !self.cancel.is_cancelled() {
            debug!("Abort operation {}", self.id);
            self.cancel.cancel();
            self.wake.notify_one();
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.id)
            .field("aborted", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_operation(method: http::Method, uri: &str, options: CallOptions) -> (Operation, Call) {
    let req = http::Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::Empty)
        .unwrap();
    test_request(req, options)
}

#[cfg(test)]
pub(crate) fn test_request(req: http::Request<Body>, options: CallOptions) -> (Operation, Call) {
    let (parts, body) = req.into_parts();
    Operation::new(0, parts, body, options, Arc::new(Notify::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    #[tokio::test]
    async fn abort_fails_every_future() {
        let (mut op, mut call) = test_operation(Method::GET, "http://q.test/", CallOptions::default());
        call.abort();
        call.abort();
        assert!(op.is_canceled());
        assert!(matches!(call.response().await, Err(Error::RequestCanceled)));
        assert!(matches!(call.finished().await, Err(Error::RequestCanceled)));
        assert!(matches!(call.finished().await, Err(Error::RequestCanceled)));
        op.abort(Error::RequestCanceled);
    }

    #[tokio::test]
    async fn request_stream_only_for_streaming_bodies() {
        let (_op, mut call) = test_operation(Method::GET, "http://q.test/", CallOptions::default());
        assert!(matches!(call.request_stream().await, Err(Error::NoRequestStream)));
    }

    #[tokio::test]
    async fn response_taken_twice() {
        let (mut op, mut call) = test_operation(Method::GET, "http://q.test/", CallOptions::default());
        op.completion.fail_all(Error::Shutdown);
        assert!(matches!(call.response().await, Err(Error::Shutdown)));
        assert!(matches!(call.response().await, Err(Error::StreamTaken)));
    }

    #[tokio::test]
    async fn successor_carries_completion_and_answer() {
        let (mut op, mut call) = test_operation(Method::GET, "http://q.test/", CallOptions::default());
        let answer = AuthAnswer {
            value: "Basic abc".into(),
            connection_based: false,
        };
        assert!(op.auth.may_retry());
        let mut next = op.successor(Body::Empty, answer, false);
        assert_eq!(next.id, op.id);
        assert_eq!(next.auth.retries, 1);
        assert!(!next.auth.may_retry());
        assert_eq!(next.auth.headers.authorization.as_deref(), Some("Basic abc"));

        // Completion moved to the successor.
        op.completion.fail_all(Error::Shutdown);
        next.completion.request_written();
        assert!(call.request_written().await.is_ok());
    }

    #[test]
    fn connection_based_gets_two_retries() {
        let mut auth = AuthState {
            connection_based: true,
            retries: 1,
            ..Default::default()
        };
        assert!(auth.may_retry());
        auth.retries = 2;
        assert!(!auth.may_retry());
    }
}
