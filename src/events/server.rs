//! Remote ingress for the event bus.
//!
//! Peers connect over TCP and write one JSON object per line:
//! `{"name": "...", "args": [...], "kwargs": {...}}`. Every well-formed line
//! is dispatched on the bus. Nothing is written back. Lines longer than
//! [`MAX_EVENT_LINE`] bytes are discarded up to the next newline.

use std::io;
use std::net::SocketAddr;

use futures::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, FramedRead};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::{Event, EventBus};

/// Longest event line accepted from a peer, newline excluded.
pub const MAX_EVENT_LINE: usize = 64 * 1024;

#[derive(Debug)]
enum Frame {
    Line(Bytes),
    Oversized,
}

/// Newline framing that reports an oversized line once and then resumes at
/// the next newline.
#[derive(Debug)]
struct EventLines(AnyDelimiterCodec);

impl EventLines {
    fn new() -> Self {
        Self(AnyDelimiterCodec::new_with_max_length(
            b"\n".to_vec(),
            Vec::new(),
            MAX_EVENT_LINE,
        ))
    }

    fn frame(
        result: Result<Option<Bytes>, AnyDelimiterCodecError>,
    ) -> io::Result<Option<Frame>> {
        match result {
            Ok(line) => Ok(line.map(Frame::Line)),
            Err(AnyDelimiterCodecError::MaxChunkLengthExceeded) => Ok(Some(Frame::Oversized)),
            Err(AnyDelimiterCodecError::Io(err)) => Err(err),
        }
    }
}

impl Decoder for EventLines {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::frame(self.0.decode(buf))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> io::Result<Option<Frame>> {
        Self::frame(self.0.decode_eof(buf))
    }
}

/// Errors raised by the remote event endpoint and its client.
#[derive(Debug, Error)]
pub enum EventServerError {
    /// Raised when the listener cannot bind its address.
    #[error("failed to bind event listener on {addr}: {source}")]
    Bind {
        /// Address that was requested.
        addr: SocketAddr,
        /// Underlying socket error.
        source: io::Error,
    },
    /// Raised when the client cannot reach the endpoint or write to it.
    #[error("event endpoint i/o failed: {0}")]
    Io(#[from] io::Error),
    /// Raised when an event cannot be encoded.
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Running TCP listener that feeds a bus.
#[derive(Debug)]
pub struct EventServer {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl EventServer {
    /// Binds `addr` and starts accepting connections in the background.
    ///
    /// # Errors
    ///
    /// Returns [`EventServerError::Bind`] when the address is unavailable.
    pub async fn bind(addr: SocketAddr, bus: EventBus) -> Result<Self, EventServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| EventServerError::Bind {
                addr,
                source,
            })?;
        let local_addr = listener.local_addr()?;
        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();

        tasks.spawn(accept_loop(listener, bus, cancel.clone(), tasks.clone()));
        info!(%local_addr, "event endpoint listening");

        Ok(Self {
            local_addr,
            cancel,
            tasks,
        })
    }

    /// Returns the bound address, useful when binding port 0.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting, closes open connections, and waits for their tasks.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        debug!(local_addr = %self.local_addr, "event endpoint stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    bus: EventBus,
    cancel: CancellationToken,
    tasks: TaskTracker,
) {
    loop {
        let accepted = tokio::select! {
            () = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!(%peer, "event peer connected");
                tasks.spawn(serve_peer(stream, peer, bus.clone(), cancel.clone()));
            }
            Err(err) => warn!(error = %err, "failed to accept event peer"),
        }
    }
}

async fn serve_peer(stream: TcpStream, peer: SocketAddr, bus: EventBus, cancel: CancellationToken) {
    let mut frames = FramedRead::new(stream, EventLines::new());
    loop {
        let frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.next() => frame,
        };
        match frame {
            Some(Ok(Frame::Line(line))) => forward_line(&bus, peer, &line),
            Some(Ok(Frame::Oversized)) => {
                warn!(%peer, limit = MAX_EVENT_LINE, "skipping oversized event line");
            }
            Some(Err(err)) => {
                warn!(%peer, error = %err, "event peer read failed");
                break;
            }
            None => break,
        }
    }
    debug!(%peer, "event peer disconnected");
}

fn forward_line(bus: &EventBus, peer: SocketAddr, line: &[u8]) {
    if line.iter().all(u8::is_ascii_whitespace) {
        return;
    }
    match serde_json::from_slice::<Event>(line) {
        Ok(event) => {
            bus.dispatch(event);
        }
        Err(err) => warn!(%peer, error = %err, "skipping malformed event line"),
    }
}

/// Sends events to a remote [`EventServer`].
#[derive(Debug)]
pub struct EventClient {
    stream: TcpStream,
}

impl EventClient {
    /// Connects to the endpoint at `addr`.
    ///
    /// # Errors
    ///
    /// Returns [`EventServerError::Io`] when the connection fails.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, EventServerError> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { stream })
    }

    /// Writes one event as a JSON line.
    ///
    /// # Errors
    ///
    /// Returns [`EventServerError`] when encoding or writing fails.
    pub async fn dispatch(&mut self, event: &Event) -> Result<(), EventServerError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Flushes and closes the write half.
    ///
    /// # Errors
    ///
    /// Returns [`EventServerError::Io`] when the shutdown fails.
    pub async fn close(mut self) -> Result<(), EventServerError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
