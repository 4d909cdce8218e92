use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

use crate::auth::BasicAuthenticator;
use crate::connection::Lease;
use crate::operation::{self, Finished, Operation};
use crate::pool;
use crate::transport::{GaiResolver, Stream};
use crate::Endpoint;


pub(crate) type Writes = Arc<Mutex<Vec<Vec<u8>>>>;

/// In-memory transport serving canned input and recording every write call.
#[derive(Debug)]
pub(crate) struct MockTransport {
    input: Vec<u8>,
    pos: usize,
    writes: Writes,
    /// At the end of input, block instead of EOF.
    hang: bool,
}

impl MockTransport {
    pub fn new(input: &[u8]) -> (MockTransport, Writes) {
        let writes = Writes::default();
        let mock = MockTransport {
            input: input.to_vec(),
            pos: 0,
            writes: writes.clone(),
            hang: false,
        };
        (mock, writes)
    }

    pub fn hanging(input: &[u8]) -> (MockTransport, Writes) {
        let (mut mock, writes) = MockTransport::new(input);
        mock.hang = true;
        (mock, writes)
    }
}

impl AsyncRead for MockTransport {
    fn poll_read(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let rest = &this.input[this.pos..];
        if rest.is_empty() {
            if this.hang {
                return Poll::Pending;
            }
            return Poll::Ready(Ok(()));
        }
        let n = rest.len().min(buf.remaining());
        buf.put_slice(&rest[..n]);
        this.pos += n;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockTransport {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.writes.lock().unwrap().push(buf.to_vec());
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

pub(crate) fn mock_stream(input: &[u8]) -> (Stream, Writes) {
    let (mock, writes) = MockTransport::new(input);
    (Stream::new(Box::new(mock)), writes)
}

pub(crate) fn context() -> Arc<pool::Context> {
    Arc::new(pool::Context {
        resolver: Arc::new(GaiResolver),
        tls: None,
        authenticators: vec![Arc::new(BasicAuthenticator)],
    })
}

pub(crate) fn lease(stream: Stream) -> Lease {
    Lease {
        conn_id: 1,
        group: String::new(),
        stream: Some(stream),
        reused: true,
        last: false,
        connect_timeout: Duration::from_secs(5),
    }
}

/// Run `op` on an already established `stream`, returning the handle to wait on its
/// report.
pub(crate) fn spawn_op(
    endpoint: &str,
    op: Operation,
    stream: Stream,
) -> tokio::task::JoinHandle<Finished> {
    let endpoint = Endpoint::from_uri(&endpoint.parse().unwrap(), None).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        operation::run(context(), endpoint, lease(stream), op, tx).await;
        rx.recv().await.unwrap()
    })
}

pub(crate) fn written(writes: &Writes) -> Vec<Vec<u8>> {
    writes.lock().unwrap().clone()
}
