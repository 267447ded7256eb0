//! Thin socket abstraction over `tokio-tungstenite`.
//!
//! A WebSocket stream is split into a writer task fed by an unbounded command
//! channel (so synchronous broadcast handlers can `send`/`close` without
//! awaiting) and a reader task that turns inbound frames into
//! [`SocketEvent`]s.

use std::fmt;

use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Identity of one live WebSocket, used as the origin of the broadcasts it
/// produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SocketId(uuid::Uuid);

impl SocketId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl From<SocketId> for uuid::Uuid {
    fn from(id: SocketId) -> Self {
        id.0
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug)]
enum SocketCommand {
    Send(Message),
    Close,
}

/// Something that happened on the read side of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Message { data: Bytes, is_binary: bool },
    /// Emitted exactly once, after which the reader stops.
    Closed,
}

/// Cloneable write handle for one socket.
#[derive(Debug, Clone)]
pub struct SocketHandle {
    id: SocketId,
    tx: mpsc::UnboundedSender<SocketCommand>,
}

impl SocketHandle {
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Queue a frame for sending. Frames sent after the writer has stopped
    /// are dropped.
    pub fn send(&self, data: &Bytes, is_binary: bool) {
        let message = to_message(data.clone(), is_binary);
        if self.tx.send(SocketCommand::Send(message)).is_err() {
            tracing::debug!(socket = %self.id, "send on closed socket dropped");
        }
    }

    /// Start the closing handshake. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.tx.send(SocketCommand::Close);
    }
}

/// Read half of a socket that has not started reading yet.
///
/// Splitting [`open`] from [`SocketReader::spawn`] lets the owner register the
/// handle before any event can fire.
pub struct SocketReader<S> {
    id: SocketId,
    stream: SplitStream<WebSocketStream<S>>,
}

/// Split `ws` into a write handle (writer task already running) and a reader.
pub fn open<S>(ws: WebSocketStream<S>) -> (SocketHandle, SocketReader<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let id = SocketId::new();
    let (sink, stream) = ws.split();
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(id, sink, rx));

    (SocketHandle { id, tx }, SocketReader { id, stream })
}

impl<S> SocketReader<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn id(&self) -> SocketId {
        self.id
    }

    /// Start delivering events to `on_event`. Ends with a single
    /// [`SocketEvent::Closed`] once the closing handshake has finished, or on
    /// read error or EOF.
    pub fn spawn<F>(self, on_event: F) -> JoinHandle<()>
    where
        F: FnMut(SocketEvent) + Send + 'static,
    {
        tokio::spawn(read_loop(self.id, self.stream, on_event))
    }
}

async fn write_loop<S>(
    id: SocketId,
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::UnboundedReceiver<SocketCommand>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        match command {
            SocketCommand::Send(message) => {
                if let Err(err) = sink.send(message).await {
                    tracing::debug!(socket = %id, %err, "write error, stopping writer");
                    break;
                }
            }
            SocketCommand::Close => {
                if let Err(err) = sink.close().await {
                    tracing::debug!(socket = %id, %err, "close handshake failed");
                }
                break;
            }
        }
    }
}

async fn read_loop<S, F>(id: SocketId, mut stream: SplitStream<WebSocketStream<S>>, mut on_event: F)
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnMut(SocketEvent),
{
    while let Some(result) = stream.next().await {
        match result {
            Ok(message @ (Message::Text(_) | Message::Binary(_))) => {
                let is_binary = message.is_binary();
                on_event(SocketEvent::Message {
                    data: message.into_data(),
                    is_binary,
                });
            }
            // Keep polling: tungstenite sends the close reply on the next read
            // and then ends the stream.
            Ok(Message::Close(frame)) => {
                tracing::debug!(socket = %id, ?frame, "close frame received");
            }
            // Ping/pong are answered by tungstenite itself.
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(socket = %id, %err, "read error, closing socket");
                break;
            }
        }
    }

    on_event(SocketEvent::Closed);
}

/// Build the outgoing frame. Text that is not valid UTF-8 goes out as binary.
fn to_message(data: Bytes, is_binary: bool) -> Message {
    if is_binary {
        return Message::Binary(data);
    }
    match String::from_utf8(data.to_vec()) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(data),
    }
}
