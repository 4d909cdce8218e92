//! Scripted HTTP/1.1 server on a local port.
//!
//! Every request is parsed, recorded and answered with whatever the handler returns.
//! The handler sees which accepted connection the request arrived on, so tests can
//! tell reuse from new connections.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// One request as seen by the server.
#[derive(Debug, Clone)]
pub struct Received {
    /// Index of the accepted connection, starting at 0.
    pub conn: usize,
    /// Index of the request on its connection, starting at 0.
    pub seq: usize,
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Received {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// What to do with a request.
pub enum Reply {
    /// Write the bytes and keep reading requests.
    Send(Vec<u8>),
    /// Write the bytes and close the connection.
    SendAndClose(Vec<u8>),
    /// Write the bytes, then go silent without closing.
    SendAndHang(Vec<u8>),
    /// Wait this long, then write the bytes.
    Delay(Duration, Vec<u8>),
}

type Handler = dyn Fn(&Received) -> Reply + Send + Sync;

pub struct TestServer {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
    accepted: Arc<AtomicUsize>,
    open: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub async fn start<F>(handler: F) -> TestServer
    where
        F: Fn(&Received) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let open = Arc::new(AtomicUsize::new(0));
        let handler: Arc<Handler> = Arc::new(handler);

        let handle = {
            let received = received.clone();
            let accepted = accepted.clone();
            let open = open.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((tcp, _)) = listener.accept().await else {
                        return;
                    };
                    let conn = accepted.fetch_add(1, Ordering::SeqCst);
                    open.fetch_add(1, Ordering::SeqCst);
                    let handler = handler.clone();
                    let received = received.clone();
                    let open = open.clone();
                    tokio::spawn(async move {
                        serve(tcp, conn, handler, received).await;
                        open.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            })
        };

        TestServer {
            addr,
            received,
            accepted,
            open,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.addr.port(), path)
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections the server still has open.
    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    /// Wait until the server has seen its side of every connection closed.
    pub async fn wait_all_closed(&self) {
        for _ in 0..200 {
            if self.open() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("connections still open: {}", self.open());
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(
    mut tcp: TcpStream,
    conn: usize,
    handler: Arc<Handler>,
    received: Arc<Mutex<Vec<Received>>>,
) {
    let mut buf = Vec::new();
    let mut seq = 0;

    loop {
        let Some(req) = read_request(&mut tcp, &mut buf, conn, seq).await else {
            return;
        };
        seq += 1;

        let reply = handler(&req);
        received.lock().unwrap().push(req);

        match reply {
            Reply::Send(bytes) => {
                if tcp.write_all(&bytes).await.is_err() {
                    return;
                }
            }
            Reply::SendAndClose(bytes) => {
                let _ = tcp.write_all(&bytes).await;
                let _ = tcp.shutdown().await;
                return;
            }
            Reply::SendAndHang(bytes) => {
                let _ = tcp.write_all(&bytes).await;
                // Hold the socket until the client goes away.
                let mut sink = [0; 1024];
                while let Ok(n) = tcp.read(&mut sink).await {
                    if n == 0 {
                        return;
                    }
                }
                return;
            }
            Reply::Delay(d, bytes) => {
                tokio::time::sleep(d).await;
                if tcp.write_all(&bytes).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn read_request(
    tcp: &mut TcpStream,
    buf: &mut Vec<u8>,
    conn: usize,
    seq: usize,
) -> Option<Received> {
    let (head_len, method, target, headers) = loop {
        let mut raw = [httparse::EMPTY_HEADER; 64];
        let mut req = httparse::Request::new(&mut raw);
        if let httparse::Status::Complete(n) = req.parse(buf).ok()? {
            let headers: Vec<(String, String)> = req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect();
            break (
                n,
                req.method?.to_string(),
                req.path?.to_string(),
                headers,
            );
        }
        fill(tcp, buf).await?;
    };
    buf.drain(..head_len);

    let find = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let body = if let Some(len) = find("content-length") {
        let len: usize = len.trim().parse().ok()?;
        while buf.len() < len {
            fill(tcp, buf).await?;
        }
        buf.drain(..len).collect()
    } else if find("transfer-encoding").is_some_and(|v| v.contains("chunked")) {
        read_chunked(tcp, buf).await?
    } else {
        Vec::new()
    };

    Some(Received {
        conn,
        seq,
        method,
        target,
        headers,
        body,
    })
}

async fn read_chunked(tcp: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let line_end = loop {
            if let Some(i) = buf.windows(2).position(|w| w == b"\r\n") {
                break i;
            }
            fill(tcp, buf).await?;
        };
        let line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
        let size = usize::from_str_radix(line.split(';').next()?.trim(), 16).ok()?;
        buf.drain(..line_end + 2);

        while buf.len() < size + 2 {
            fill(tcp, buf).await?;
        }
        body.extend(buf.drain(..size));
        buf.drain(..2);

        if size == 0 {
            return Some(body);
        }
    }
}

async fn fill(tcp: &mut TcpStream, buf: &mut Vec<u8>) -> Option<()> {
    let mut tmp = [0; 4096];
    let n = tcp.read(&mut tmp).await.ok()?;
    if n == 0 {
        return None;
    }
    buf.extend_from_slice(&tmp[..n]);
    Some(())
}

/// `200 OK` with a length-delimited body.
pub fn ok(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}
