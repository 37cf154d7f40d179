//! post-upgrade connection driver.
//!
//! Runs the websocket protocol over any async byte stream once the http
//! engine transferred the socket: reads and validates frames, auto-replies
//! ping with pong, performs the close handshake and delivers data messages
//! to a [MessageHandler].

use core::fmt;

use std::{io, time::Duration};

use bytes::BytesMut;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    time::timeout,
};
use tracing::{trace, warn};

use super::{
    codec::{Codec, Message},
    error::ProtocolError,
    proto::CloseReason,
};

/// Configuration of the post-upgrade driver.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// maximum accepted frame payload size.
    pub max_frame_size: usize,
    /// deadline for receiving the next frame.
    pub idle_timeout: Duration,
    /// deadline for one write operation to finish.
    pub write_timeout: Duration,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 65_536,
            idle_timeout: Duration::from_secs(300),
            write_timeout: Duration::from_secs(15),
        }
    }
}

/// Failure of a websocket connection.
#[derive(Debug)]
pub enum Error {
    Protocol(ProtocolError),
    Io(io::Error),
    /// no frame arrived within the idle deadline.
    IdleTimeout,
    /// a write operation missed its deadline.
    WriteTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl std::error::Error for Error {}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Self::Protocol(e)
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Outgoing message queue handed to the handler.
pub struct Outbox {
    queue: Vec<Message>,
}

impl Outbox {
    fn new() -> Self {
        Self { queue: Vec::new() }
    }

    /// Queue one message for transmission.
    pub fn send(&mut self, msg: Message) {
        self.queue.push(msg);
    }

    /// Queue a close frame, starting the close handshake.
    pub fn close(&mut self, reason: Option<CloseReason>) {
        self.queue.push(Message::Close(reason));
    }
}

/// Receiver of incoming data messages.
///
/// Ping frames are answered by the driver and not delivered; pong frames and
/// data messages (including fragments) reach the handler.
pub trait MessageHandler {
    fn on_message(&mut self, msg: Message, out: &mut Outbox);
}

impl<F> MessageHandler for F
where
    F: FnMut(Message, &mut Outbox),
{
    fn on_message(&mut self, msg: Message, out: &mut Outbox) {
        (self)(msg, out)
    }
}

/// Drive the websocket protocol on `io` until either side completes the
/// close handshake, the peer disappears, or a protocol violation ends the
/// connection with a close frame carrying the matching status code.
///
/// `leftover` holds bytes received beyond the http stream during the
/// upgrade; they are parsed as the beginning of the frame stream.
pub async fn serve<Io, H>(io: Io, leftover: BytesMut, handler: &mut H, config: &WsConfig) -> Result<(), Error>
where
    Io: AsyncRead + AsyncWrite + Unpin,
    H: MessageHandler + ?Sized,
{
    let mut connection = Connection {
        io,
        codec: Codec::new().max_size(config.max_frame_size),
        read_buf: leftover,
        write_buf: BytesMut::new(),
        close_sent: false,
        close_received: false,
    };

    match connection.drive(handler, config).await {
        Ok(()) => {
            let _ = connection.io.shutdown().await;
            Ok(())
        }
        Err(e) => {
            connection.send_error_close(&e, config).await;
            let _ = connection.io.shutdown().await;
            Err(e)
        }
    }
}

struct Connection<Io> {
    io: Io,
    codec: Codec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    close_sent: bool,
    close_received: bool,
}

impl<Io> Connection<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    async fn drive<H>(&mut self, handler: &mut H, config: &WsConfig) -> Result<(), Error>
    where
        H: MessageHandler + ?Sized,
    {
        let mut outbox = Outbox::new();

        loop {
            while let Some(msg) = self.codec.decode(&mut self.read_buf)? {
                self.on_frame(msg, handler, &mut outbox)?;
            }

            self.flush(config).await?;

            if self.close_received {
                return Ok(());
            }

            let read = timeout(config.idle_timeout, self.io.read_buf(&mut self.read_buf))
                .await
                .map_err(|_| Error::IdleTimeout)?;

            if read? == 0 {
                if self.close_sent {
                    // the peer dropped after our close frame; good enough.
                    return Ok(());
                }
                return Err(Error::Io(io::ErrorKind::UnexpectedEof.into()));
            }
        }
    }

    fn on_frame<H>(&mut self, msg: Message, handler: &mut H, outbox: &mut Outbox) -> Result<(), Error>
    where
        H: MessageHandler + ?Sized,
    {
        match msg {
            Message::Ping(payload) => {
                trace!(target: "ws_connection", "ping received, echoing pong");
                self.codec.encode(Message::Pong(payload), &mut self.write_buf)?;
            }
            Message::Close(reason) => {
                trace!(target: "ws_connection", "close received: {:?}", reason);
                self.close_received = true;
                if !self.close_sent {
                    // echo the status code, drop the reason text.
                    let echo = reason.map(|r| CloseReason {
                        code: r.code,
                        description: None,
                    });
                    self.codec.encode(Message::Close(echo), &mut self.write_buf)?;
                    self.close_sent = true;
                }
            }
            msg => {
                handler.on_message(msg, outbox);
                for msg in outbox.queue.drain(..) {
                    if self.close_sent {
                        warn!(target: "ws_connection", "message after close frame dropped");
                        continue;
                    }
                    if matches!(msg, Message::Close(_)) {
                        self.close_sent = true;
                    }
                    self.codec.encode(msg, &mut self.write_buf)?;
                }
            }
        }
        Ok(())
    }

    async fn flush(&mut self, config: &WsConfig) -> Result<(), Error> {
        if self.write_buf.is_empty() {
            return Ok(());
        }
        timeout(config.write_timeout, self.io.write_all(&self.write_buf))
            .await
            .map_err(|_| Error::WriteTimeout)??;
        self.write_buf.clear();
        self.io.flush().await?;
        Ok(())
    }

    async fn send_error_close(&mut self, e: &Error, config: &WsConfig) {
        if self.close_sent {
            return;
        }
        let code = match *e {
            Error::Protocol(ref proto) => proto.close_code(),
            Error::IdleTimeout | Error::WriteTimeout => super::proto::CloseCode::Away,
            Error::Io(_) => return,
        };
        self.write_buf.clear();
        if self
            .codec
            .encode(Message::Close(Some(code.into())), &mut self.write_buf)
            .is_ok()
        {
            self.close_sent = true;
            let _ = self.flush(config).await;
        }
    }
}
