use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use quay_ws::{Message, Outbox, connection};

fn echo_handler(msg: Message, out: &mut Outbox) {
    if let Message::Text(text) = msg {
        out.send(Message::Text(text));
    }
}

fn mask_bytes(key: [u8; 4], payload: &[u8]) -> Vec<u8> {
    payload
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % 4])
        .collect()
}

#[tokio::test]
async fn echoes_masked_text_as_unmasked_frame() {
    let (mut client, server) = tokio::io::duplex(1024);

    let server_task = tokio::spawn(async move {
        let mut handler = echo_handler;
        connection::serve(server, BytesMut::new(), &mut handler, &Default::default()).await
    });

    // masked text frame "Hello".
    let key = [0x37, 0xfa, 0x21, 0x3d];
    let mut frame = vec![0x81, 0x85];
    frame.extend_from_slice(&key);
    frame.extend_from_slice(&mask_bytes(key, b"Hello"));
    client.write_all(&frame).await.unwrap();

    // the echo comes back as an unmasked 7 byte frame.
    let mut reply = [0; 7];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);

    // close handshake ends the connection.
    let mut close = vec![0x88, 0x82];
    close.extend_from_slice(&key);
    close.extend_from_slice(&mask_bytes(key, &[0x03, 0xE8]));
    client.write_all(&close).await.unwrap();

    let mut reply = [0; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xE8]);

    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn close_reply_is_followed_by_eof() {
    let (mut client, server) = tokio::io::duplex(1024);

    let server_task = tokio::spawn(async move {
        let mut handler = echo_handler;
        connection::serve(server, BytesMut::new(), &mut handler, &Default::default()).await
    });

    let key = [0x01, 0x02, 0x03, 0x04];
    let mut close = vec![0x88, 0x82];
    close.extend_from_slice(&key);
    close.extend_from_slice(&mask_bytes(key, &[0x03, 0xE8]));
    client.write_all(&close).await.unwrap();

    let mut reply = [0; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xE8]);

    // the server shut the stream down; the next read observes EOF.
    let mut rest = Vec::new();
    let n = client.read_to_end(&mut rest).await.unwrap();
    assert_eq!(n, 0);

    server_task.await.unwrap().unwrap();
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (mut client, server) = tokio::io::duplex(1024);

    let server_task = tokio::spawn(async move {
        let mut handler = echo_handler;
        connection::serve(server, BytesMut::new(), &mut handler, &Default::default()).await
    });

    let key = [0xAA, 0xBB, 0xCC, 0xDD];
    let mut ping = vec![0x89, 0x84];
    ping.extend_from_slice(&key);
    ping.extend_from_slice(&mask_bytes(key, b"ping"));
    client.write_all(&ping).await.unwrap();

    let mut reply = [0; 6];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[..2], &[0x8A, 0x04]);
    assert_eq!(&reply[2..], b"ping");

    drop(client);
    let _ = server_task.await.unwrap();
}

#[tokio::test]
async fn unmasked_client_frame_closes_with_protocol_error() {
    let (mut client, server) = tokio::io::duplex(1024);

    let server_task = tokio::spawn(async move {
        let mut handler = echo_handler;
        connection::serve(server, BytesMut::new(), &mut handler, &Default::default()).await
    });

    // unmasked text frame violates the client-to-server masking rule.
    client.write_all(&[0x81, 0x05, b'H', b'e', b'l', b'l', b'o']).await.unwrap();

    // the server answers with a close frame carrying 1002 before dropping.
    let mut reply = [0; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply, [0x88, 0x02, 0x03, 0xEA]);

    assert!(server_task.await.unwrap().is_err());
}

#[tokio::test]
async fn leftover_bytes_are_parsed_as_frames() {
    let (mut client, server) = tokio::io::duplex(1024);

    // the first frame arrived while the socket still belonged to http.
    let key = [0x37, 0xfa, 0x21, 0x3d];
    let mut leftover = BytesMut::from(&[0x81u8, 0x85][..]);
    leftover.extend_from_slice(&key);
    leftover.extend_from_slice(&mask_bytes(key, b"early"));

    let server_task = tokio::spawn(async move {
        let mut handler = echo_handler;
        connection::serve(server, leftover, &mut handler, &Default::default()).await
    });

    let mut reply = [0; 7];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply[2..], b"early");

    drop(client);
    let _ = server_task.await.unwrap();
}
