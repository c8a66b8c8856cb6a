//! End-to-end exchanges against canned local servers.
//!
//! The client owns its own runtime, so the servers here are plain
//! std-thread loops speaking just enough HTTP/1.1 for each scenario.

use std::io::{Cursor, Read as _, Write as _};
use std::net::{TcpListener, TcpStream};
use std::sync::Once;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use http::StatusCode;
use relais::client::ProxyConfig;
use relais::{Client, Error, Request};

fn subscribe() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let subscriber = tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .finish();
        tracing::subscriber::set_global_default(subscriber).unwrap();
    });
}

/// Read until `marker` is seen (inclusive), byte at a time so nothing past
/// the marker is consumed.
fn read_until(stream: &mut TcpStream, marker: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).unwrap();
        if n == 0 {
            break;
        }
        buf.push(byte[0]);
        if buf.len() >= marker.len() && &buf[buf.len() - marker.len()..] == marker {
            break;
        }
    }
    buf
}

fn read_head(stream: &mut TcpStream) -> String {
    String::from_utf8(read_until(stream, b"\r\n\r\n")).unwrap()
}

/// A server that accepts one connection and answers `responses` requests on
/// it, returning the request heads it saw.
fn serve(listener: TcpListener, responses: Vec<&'static [u8]>) -> JoinHandle<Vec<String>> {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut heads = Vec::new();
        for response in responses {
            heads.push(read_head(&mut stream));
            stream.write_all(response).unwrap();
        }
        heads
    })
}

fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn body_string(response: &mut relais::Response) -> String {
    let mut body = String::new();
    response.body_mut().read_to_string(&mut body).unwrap();
    body
}

#[test]
fn get_creates_a_connection_and_completes() {
    subscribe();

    let (listener, port) = bind();
    let server = serve(
        listener,
        vec![b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n"],
    );

    let client = Client::new().unwrap();
    let mut response = client
        .send(Request::get(format!("http://127.0.0.1:{port}/")).unwrap())
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(&mut response), "");

    let heads = server.join().unwrap();
    assert!(heads[0].starts_with("GET / HTTP/1.1\r\n"));
    assert!(heads[0].contains(&format!("host: 127.0.0.1:{port}\r\n")));
}

#[test]
fn second_request_reuses_the_pooled_connection() {
    subscribe();

    let (listener, port) = bind();
    // One accepted socket serves both requests; a fresh connection from the
    // client would never be accepted and the second send would time out.
    let server = serve(
        listener,
        vec![
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
            b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok",
        ],
    );

    let client = Client::builder()
        .read_timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    for _ in 0..2 {
        let mut response = client
            .send(Request::get(format!("http://127.0.0.1:{port}/")).unwrap())
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(&mut response), "ok");
    }

    assert_eq!(server.join().unwrap().len(), 2);
}

#[test]
fn unknown_length_entity_is_sent_chunked() {
    subscribe();

    let (listener, port) = bind();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_head(&mut stream);
        let body = read_until(&mut stream, b"0\r\n\r\n");
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 4\r\n\r\ndone")
            .unwrap();
        (head, body)
    });

    let client = Client::new().unwrap();
    let request = Request::post(format!("http://127.0.0.1:{port}/upload"))
        .unwrap()
        .streaming(Cursor::new(b"streamed entity".to_vec()), None);
    let mut response = client.send(request).unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(&mut response), "done");

    let (head, body) = server.join().unwrap();
    assert!(head.contains("transfer-encoding: chunked\r\n"));
    let body = String::from_utf8(body).unwrap();
    assert!(body.contains("streamed entity"));
    assert!(body.ends_with("0\r\n\r\n"));
}

#[test]
fn sized_entity_carries_content_length() {
    subscribe();

    let (listener, port) = bind();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let head = read_head(&mut stream);
        let mut body = [0u8; 4];
        stream.read_exact(&mut body).unwrap();
        stream
            .write_all(b"HTTP/1.1 204 No Content\r\n\r\n")
            .unwrap();
        (head, body)
    });

    let client = Client::new().unwrap();
    let request = Request::put(format!("http://127.0.0.1:{port}/item"))
        .unwrap()
        .body("data");
    let response = client.send(request).unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let (head, body) = server.join().unwrap();
    assert!(head.contains("content-length: 4\r\n"));
    assert_eq!(&body, b"data");
}

#[test]
fn connect_timeout_fails_before_any_exchange() {
    subscribe();

    let client = Client::builder()
        .connect_timeout(Duration::from_millis(1))
        .build()
        .unwrap();

    // Unroutable address: the connection attempt blackholes.
    let error = client
        .send(Request::get("http://10.255.255.1:81/").unwrap())
        .unwrap_err();

    assert!(matches!(error, Error::ConnectTimeout(_)), "got {error:?}");
}

#[test]
fn read_timeout_raises_while_the_server_stays_silent() {
    subscribe();

    let (listener, port) = bind();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _head = read_head(&mut stream);
        // Never answer; just wait for the client to go away.
        let mut sink = Vec::new();
        let _ = stream.read_to_end(&mut sink);
    });

    let client = Client::builder()
        .read_timeout(Duration::from_millis(200))
        .build()
        .unwrap();

    let error = client
        .send(Request::get(format!("http://127.0.0.1:{port}/")).unwrap())
        .unwrap_err();
    assert!(matches!(error, Error::Timeout(_)), "got {error:?}");

    drop(client);
    server.join().unwrap();
}

#[test]
fn callback_fires_once_with_the_response() {
    subscribe();

    let (listener, port) = bind();
    let _server = serve(
        listener,
        vec![b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nhi"],
    );

    let client = Client::new().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();

    let _handle = client.send_with(
        Request::get(format!("http://127.0.0.1:{port}/")).unwrap(),
        move |outcome| {
            let summary = outcome.map(|mut response| {
                // callbacks run off the transport threads, so blocking on
                // the body here is fine
                (response.status(), body_string(&mut response))
            });
            tx.send(summary).unwrap();
        },
    );

    let summary = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!(summary.0, StatusCode::OK);
    assert_eq!(summary.1, "hi");

    // the callback fired exactly once
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn callback_receives_failures() {
    subscribe();

    // Bind then drop to get a port that refuses connections.
    let (listener, port) = bind();
    drop(listener);

    let client = Client::new().unwrap();
    let (tx, rx) = std::sync::mpsc::channel();

    let _handle = client.send_with(
        Request::get(format!("http://127.0.0.1:{port}/")).unwrap(),
        move |outcome| {
            tx.send(outcome.map(|response| response.status())).unwrap();
        },
    );

    let outcome = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(outcome, Err(Error::Connect(_))), "got {outcome:?}");
}

#[test]
fn proxied_requests_tunnel_through_connect() {
    subscribe();

    let (listener, port) = bind();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let connect = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
            .unwrap();
        let request = read_head(&mut stream);
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 7\r\n\r\ntunnel!")
            .unwrap();
        (connect, request)
    });

    let client = Client::builder()
        .proxy(ProxyConfig::new("127.0.0.1", port))
        .build()
        .unwrap();

    // The origin host never resolves; only the proxy is dialed.
    let mut response = client
        .send(Request::get("http://origin.internal:7777/resource").unwrap())
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(&mut response), "tunnel!");

    let (connect, request) = server.join().unwrap();
    assert!(connect.starts_with("CONNECT origin.internal:7777 HTTP/1.1\r\n"));
    assert!(request.starts_with("GET /resource HTTP/1.1\r\n"));
    assert!(request.contains("host: origin.internal:7777\r\n"));
}

#[test]
fn gzip_responses_are_decoded() {
    subscribe();

    let payload = {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"compressed over the wire").unwrap();
        encoder.finish().unwrap()
    };

    let (listener, port) = bind();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _head = read_head(&mut stream);
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Encoding: gzip\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        );
        stream.write_all(head.as_bytes()).unwrap();
        stream.write_all(&payload).unwrap();
    });

    let client = Client::new().unwrap();
    let mut response = client
        .send(Request::get(format!("http://127.0.0.1:{port}/")).unwrap())
        .unwrap();

    assert_eq!(body_string(&mut response), "compressed over the wire");
    assert!(!response.headers().contains_key("content-encoding"));

    server.join().unwrap();
}

#[test]
fn server_close_mid_exchange_is_a_transport_error() {
    subscribe();

    let (listener, port) = bind();
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _head = read_head(&mut stream);
        // Promise more than is delivered, then hang up.
        stream
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
            .unwrap();
    });

    let client = Client::new().unwrap();
    let error = client
        .send(Request::get(format!("http://127.0.0.1:{port}/")).unwrap())
        .unwrap_err();

    assert!(matches!(error, Error::Transport(_)), "got {error:?}");
    server.join().unwrap();
}
