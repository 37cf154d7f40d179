//! end-to-end tests of the listening server over real sockets.

use std::{
    cell::RefCell,
    future::Future,
    net::SocketAddr,
    rc::Rc,
    time::Duration,
};

use bytes::Bytes;
use http::StatusCode;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    task::LocalSet,
};

use quay_http::{HandleResult, OutputMode, Request};
use quay_server::{
    Builder, ServerHandle,
    acceptor::{ConnectionState, Inspection, StateListener},
};
use quay_ws::{Message, Outbox};

async fn with_local<F: Future>(fut: F) -> F::Output {
    LocalSet::new().run_until(fut).await
}

fn hello_handler(req: Request) -> HandleResult {
    let mut res = req.create_response(StatusCode::OK, OutputMode::Buffered);
    res.set_body(Bytes::from_static(b"hello"));
    res.done();
    HandleResult::Accepted
}

async fn start<H>(builder: Builder<H>) -> (ServerHandle, SocketAddr)
where
    H: quay_http::Handler + 'static,
{
    let server = builder.bind("127.0.0.1:0").unwrap();
    let handle = server.handle();
    let addr = server.local_addr();
    tokio::task::spawn_local(async move {
        let _ = server.run().await;
    });
    (handle, addr)
}

async fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let mut head = Vec::new();
    let mut byte = [0u8];
    while !head.ends_with(b"\r\n\r\n") {
        stream.read_exact(&mut byte).await.expect("response head");
        head.push(byte[0]);
    }
    let head = String::from_utf8(head).unwrap();

    let len = head
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse::<usize>().unwrap())
        })
        .unwrap_or(0);

    let mut body = vec![0; len];
    stream.read_exact(&mut body).await.expect("response body");
    (head, body)
}

#[tokio::test]
async fn serves_requests_over_tcp() {
    with_local(async {
        let (handle, addr) = start(Builder::new(hello_handler)).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let (head, body) = read_response(&mut stream).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"hello");

        // keep-alive: a second request on the same socket works.
        stream.write_all(b"GET /again HTTP/1.1\r\n\r\n").await.unwrap();
        let (_, body) = read_response(&mut stream).await;
        assert_eq!(body, b"hello");

        handle.stop();
    })
    .await;
}

#[tokio::test]
async fn connection_limit_defers_accepts() {
    with_local(async {
        let (handle, addr) = start(
            Builder::new(hello_handler)
                .max_parallel_connections(1)
                .concurrent_accepts(2),
        )
        .await;

        // the first connection occupies the only seat.
        let mut first = TcpStream::connect(addr).await.unwrap();
        first.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let _ = read_response(&mut first).await;

        // the second connects on tcp level (backlog) but is not admitted:
        // its request stays unanswered while the first connection lives.
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        let unanswered = tokio::time::timeout(Duration::from_millis(200), async {
            let mut byte = [0u8];
            second.read_exact(&mut byte).await
        })
        .await;
        assert!(unanswered.is_err(), "second connection must wait for admission");

        // releasing the first connection admits the second.
        drop(first);

        let (head, body) = read_response(&mut second).await;
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert_eq!(body, b"hello");

        handle.stop();
    })
    .await;
}

#[tokio::test]
async fn ip_blocker_denies_peers() {
    with_local(async {
        let (handle, addr) = start(
            Builder::new(hello_handler).ip_blocker(Rc::new(|_addr: SocketAddr| Inspection::Deny)),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();

        // the socket is dropped without a response.
        let mut rest = Vec::new();
        let n = stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);

        handle.stop();
    })
    .await;
}

#[derive(Default)]
struct RecordingListener {
    events: RefCell<Vec<(u64, ConnectionState)>>,
}

impl StateListener for RecordingListener {
    fn state_changed(&self, conn_id: u64, _addr: SocketAddr, state: ConnectionState) {
        self.events.borrow_mut().push((conn_id, state));
    }
}

#[tokio::test]
async fn state_listener_observes_lifecycle() {
    with_local(async {
        let listener = Rc::new(RecordingListener::default());
        let (handle, addr) = start(Builder::new(hello_handler).state_listener(listener.clone())).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let _ = read_response(&mut stream).await;
        drop(stream);

        // give the connection task a moment to wind down.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let events = listener.events.borrow();
        assert_eq!(
            *events,
            vec![(0, ConnectionState::Accepted), (0, ConnectionState::Closed)]
        );

        handle.stop();
    })
    .await;
}

fn ws_upgrade_handler(req: Request) -> HandleResult {
    match quay_ws::handshake(req.method(), req.header()) {
        Ok(token) => {
            let mut res = req.create_response(StatusCode::SWITCHING_PROTOCOLS, OutputMode::UserControlledLength);
            res.append_header("upgrade", "websocket");
            res.append_header("connection", "upgrade");
            res.append_header("sec-websocket-accept", &token[..]);
            res.done_with_upgrade();
            HandleResult::Accepted
        }
        Err(_) => HandleResult::Rejected,
    }
}

fn ws_echo() -> Box<dyn quay_ws::MessageHandler> {
    Box::new(|msg: Message, out: &mut Outbox| {
        if let Message::Text(text) = msg {
            out.send(Message::Text(text));
        }
    })
}

fn mask_bytes(key: [u8; 4], payload: &[u8]) -> Vec<u8> {
    payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]).collect()
}

#[tokio::test]
async fn websocket_upgrade_and_echo() {
    with_local(async {
        let listener = Rc::new(RecordingListener::default());
        let (handle, addr) = start(
            Builder::new(ws_upgrade_handler)
                .ws_handler(Rc::new(ws_echo))
                .state_listener(listener.clone()),
        )
        .await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"GET /chat HTTP/1.1\r\n\
                  Upgrade: websocket\r\n\
                  Connection: upgrade\r\n\
                  Sec-WebSocket-Version: 13\r\n\
                  Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
                  \r\n",
            )
            .await
            .unwrap();

        let mut head = Vec::new();
        let mut byte = [0u8];
        while !head.ends_with(b"\r\n\r\n") {
            stream.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        let head = String::from_utf8(head).unwrap();
        assert!(head.starts_with("HTTP/1.1 101 "));
        assert!(
            head.to_ascii_lowercase()
                .contains(&"Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=".to_ascii_lowercase())
        );

        // masked text frame "Hello" comes back as an unmasked 7 byte frame.
        let key = [0x37, 0xfa, 0x21, 0x3d];
        let mut frame = vec![0x81, 0x85];
        frame.extend_from_slice(&key);
        frame.extend_from_slice(&mask_bytes(key, b"Hello"));
        stream.write_all(&frame).await.unwrap();

        let mut reply = [0; 7];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

        // close handshake: code 1000 echoed, then EOF.
        let mut close = vec![0x88, 0x82];
        close.extend_from_slice(&key);
        close.extend_from_slice(&mask_bytes(key, &[0x03, 0xE8]));
        stream.write_all(&close).await.unwrap();

        let mut reply = [0; 4];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x88, 0x02, 0x03, 0xE8]);

        let mut rest = Vec::new();
        let n = stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n, 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let events = listener.events.borrow();
        assert_eq!(
            *events,
            vec![
                (0, ConnectionState::Accepted),
                (0, ConnectionState::UpgradedToWebSocket),
                (0, ConnectionState::Closed),
            ]
        );

        handle.stop();
    })
    .await;
}
