use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use tokio::io::AsyncReadExt;

use webconn::http::{HeaderMap, Request, StatusCode};
use webconn::{Body, BodyMode, CallOptions, Decompression, Pool, WriteMode};

mod support;
use support::server::{ok, Reply, TestServer};

const TEXT: &str = "the quick brown fox jumps over the lazy dog, again and again and again";

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn zlib(data: &[u8]) -> Vec<u8> {
    let mut enc = ZlibEncoder::new(Vec::new(), Compression::default());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

fn encoded_reply(encoding: &str, body: Vec<u8>) -> Vec<u8> {
    let mut out = format!(
        "HTTP/1.1 200 OK\r\nContent-Encoding: {}\r\nContent-Length: {}\r\n\r\n",
        encoding,
        body.len()
    )
    .into_bytes();
    out.extend(body);
    out
}

fn get(url: &str) -> Request<Body> {
    Request::get(url).body(Body::Empty).unwrap()
}

#[tokio::test]
async fn gzip_body_is_decoded() {
    let _ = env_logger::try_init();

    let server = TestServer::start(|_| Reply::Send(encoded_reply("gzip", gzip(TEXT.as_bytes())))).await;
    let pool = Pool::new();

    let mut call = pool.submit(get(&server.url("/")), CallOptions::default()).unwrap();
    let mut res = call.response().await.unwrap();
    assert!(res.headers().get("content-encoding").is_none());
    assert_eq!(res.text().await.unwrap(), TEXT);
    call.finished().await.unwrap();

    assert_eq!(
        server.received()[0].header("accept-encoding"),
        Some("gzip, deflate")
    );
}

#[tokio::test]
async fn deflate_body_is_decoded() {
    let server = TestServer::start(|_| Reply::Send(encoded_reply("deflate", zlib(TEXT.as_bytes())))).await;
    let pool = Pool::new();

    let mut call = pool.submit(get(&server.url("/")), CallOptions::default()).unwrap();
    let mut res = call.response().await.unwrap();
    let mut out = String::new();
    res.read_to_string(&mut out).await.unwrap();
    assert_eq!(out, TEXT);
    call.finished().await.unwrap();
}

#[tokio::test]
async fn decoding_turned_off_passes_bytes_through() {
    let compressed = gzip(TEXT.as_bytes());
    let reply = encoded_reply("gzip", compressed.clone());
    let server = TestServer::start(move |_| Reply::Send(reply.clone())).await;
    let pool = Pool::new();

    let options = CallOptions {
        decompression: Decompression::none(),
        ..Default::default()
    };
    let mut call = pool.submit(get(&server.url("/")), options).unwrap();
    let mut res = call.response().await.unwrap();
    assert_eq!(res.headers().get("content-encoding").unwrap(), "gzip");
    assert_eq!(res.bytes().await.unwrap(), compressed);

    assert!(server.received()[0].header("accept-encoding").is_none());
}

#[tokio::test]
async fn chunked_upload_reaches_server() {
    let server = TestServer::start(|r| {
        Reply::Send(ok(&format!(
            "{}:{}",
            r.header("transfer-encoding").unwrap_or("-"),
            String::from_utf8_lossy(&r.body)
        )))
    })
    .await;
    let pool = Pool::new();

    let req = Request::post(server.url("/up"))
        .body(Body::Streaming)
        .unwrap();
    let options = CallOptions {
        send_chunked: true,
        ..Default::default()
    };
    let mut call = pool.submit(req, options).unwrap();

    let mut body = call.request_stream().await.unwrap();
    assert_eq!(body.mode(), Some(WriteMode::Chunked));
    for part in ["one ", "two ", "three"] {
        body.write(part.as_bytes()).await.unwrap();
    }
    assert_eq!(body.written(), 13);
    body.close().await.unwrap();
    call.request_written().await.unwrap();

    let mut res = call.response().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "chunked:one two three");
    call.finished().await.unwrap();
}

#[tokio::test]
async fn direct_upload_with_declared_length() {
    let server = TestServer::start(|r| Reply::Send(ok(&String::from_utf8_lossy(&r.body)))).await;
    let pool = Pool::new();

    let req = Request::put(server.url("/up"))
        .header("content-length", "11")
        .body(Body::Streaming)
        .unwrap();
    let options = CallOptions {
        allow_write_buffering: false,
        ..Default::default()
    };
    let mut call = pool.submit(req, options).unwrap();

    let mut body = call.request_stream().await.unwrap();
    assert_eq!(body.mode(), Some(WriteMode::Direct));
    body.write(b"hello").await.unwrap();
    body.write(b" world").await.unwrap();
    body.close().await.unwrap();

    let mut res = call.response().await.unwrap();
    assert_eq!(res.text().await.unwrap(), "hello world");
}

#[tokio::test]
async fn continue_callback_fires_once() {
    let server = TestServer::start(|_| {
        Reply::Send(
            b"HTTP/1.1 100 Continue\r\n\r\n\
            HTTP/1.1 100 Continue\r\n\r\n\
            HTTP/1.1 201 Created\r\nContent-Length: 0\r\n\r\n"
                .to_vec(),
        )
    })
    .await;
    let pool = Pool::new();

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    let options = CallOptions {
        on_continue: Some(Arc::new(move |status: StatusCode, _: &HeaderMap| {
            assert_eq!(status, StatusCode::CONTINUE);
            counter.fetch_add(1, Ordering::SeqCst);
        })),
        ..Default::default()
    };

    let req = Request::post(server.url("/")).body(Body::from("x")).unwrap();
    let mut call = pool.submit(req, options).unwrap();
    let res = call.response().await.unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    assert_eq!(res.body_mode(), BodyMode::LengthDelimited(0));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn chunked_response_across_reads() {
    let server = TestServer::start(|_| {
        Reply::Send(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n\
            3\r\nabc\r\n4;ext=1\r\ndefg\r\n0\r\n\r\n"
                .to_vec(),
        )
    })
    .await;
    let pool = Pool::new();

    let mut call = pool.submit(get(&server.url("/")), CallOptions::default()).unwrap();
    let mut res = call.response().await.unwrap();
    assert_eq!(res.body_mode(), BodyMode::Chunked);

    let mut one = [0; 1];
    let mut out = Vec::new();
    while res.read(&mut one).await.unwrap() == 1 {
        out.push(one[0]);
    }
    assert_eq!(out, b"abcdefg");
    call.finished().await.unwrap();
}
