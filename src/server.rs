//! WebSocket server: accepts connections, decodes inbound messages, and
//! fans each one back out `write_factor` times.
//!
//! The read loop never writes to the socket directly. Each connection owns
//! a writer task fed through a channel with a byte ceiling: a duplicate
//! that would push the queued bytes past the ceiling is dropped, and the
//! connection stays open. Dropped writes are counted, not treated as
//! errors.

use crate::config::Config;
use crate::protocol::{self, EchoReply};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};
use tracing::{debug, error, info, trace, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 10000;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Server instance
pub struct Server {
    config: Config,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Server {
            config,
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        }
    }

    /// Bind to the configured address and begin accepting connections
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.listen).await?;
        info!(address = %self.config.listen, "Server listening");

        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener. Tests bind to
    /// port 0 and pass the listener in to learn the address.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            // Wait for a connection slot
            let permit = self.connection_limit.clone().acquire_owned().await?;

            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let config = self.config.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, config).await {
                            debug!(error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }
    }
}

/// Handle a single WebSocket connection
async fn handle_connection(
    stream: TcpStream,
    config: Config,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = accept_async(stream).await?;
    let (sink, mut reader) = ws_stream.split();
    let outbound = OutboundQueue::start(sink, config.max_backpressure);

    while let Some(frame) = reader.next().await {
        // Text and binary frames both carry a JSON body; the reply batch
        // mirrors the inbound frame kind.
        let (body, binary) = match frame? {
            Message::Text(text) => (text.into_bytes(), false),
            Message::Binary(data) => (data, true),
            Message::Close(_) => break,
            // The library answers pings on its own
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
        };

        let inbound = match protocol::parse(&body) {
            Ok(inbound) => inbound,
            Err(e) => {
                // Wrong schema ends the connection; no replies are sent
                // for the offending message.
                warn!(error = %e, "Closing connection on unparseable message");
                break;
            }
        };

        // One clock capture and one serialization per inbound message;
        // the duplicates are byte-identical.
        let now = protocol::now_millis();
        trace!(latency = now - inbound.created_at, "Inbound message");

        let reply = EchoReply::build(inbound, now).encode()?;
        for _ in 0..config.write_factor {
            outbound.send(&reply, binary);
        }
    }

    let dropped = outbound.dropped();
    if dropped > 0 {
        debug!(dropped, "Connection closed; writes dropped at the ceiling");
    } else {
        trace!("Connection closed");
    }
    Ok(())
}

/// Outbound write queue with a buffered-byte ceiling.
struct OutboundQueue {
    tx: mpsc::UnboundedSender<Message>,
    budget: Arc<BackpressureBudget>,
}

impl OutboundQueue {
    /// Spawn the writer task for a connection's sink half.
    fn start(sink: WsSink, ceiling: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let budget = Arc::new(BackpressureBudget::new(ceiling));

        tokio::spawn(write_task(sink, rx, Arc::clone(&budget)));

        OutboundQueue { tx, budget }
    }

    /// Enqueue one duplicate for delivery. Returns false when the write
    /// was dropped at the ceiling or the writer has already gone away;
    /// neither outcome affects subsequent sends.
    fn send(&self, payload: &str, binary: bool) -> bool {
        let len = payload.len();
        if !self.budget.reserve(len) {
            trace!(bytes = len, "Write dropped at backpressure ceiling");
            return false;
        }

        let message = if binary {
            Message::Binary(payload.as_bytes().to_vec())
        } else {
            Message::Text(payload.to_owned())
        };

        if self.tx.send(message).is_err() {
            self.budget.release(len);
            return false;
        }
        true
    }

    /// Writes dropped at the ceiling over the connection's lifetime.
    fn dropped(&self) -> usize {
        self.budget.dropped()
    }
}

/// Drain the queue into the socket, releasing budget as bytes leave.
async fn write_task(
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Message>,
    budget: Arc<BackpressureBudget>,
) {
    while let Some(message) = rx.recv().await {
        let len = message.len();
        if let Err(e) = sink.send(message).await {
            debug!(error = %e, "Write failed");
            break;
        }
        budget.release(len);
    }
}

/// Tracks queued-but-unsent outbound bytes against a fixed ceiling.
struct BackpressureBudget {
    ceiling: usize,
    queued: AtomicUsize,
    dropped: AtomicUsize,
}

impl BackpressureBudget {
    fn new(ceiling: usize) -> Self {
        BackpressureBudget {
            ceiling,
            queued: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Reserve `len` bytes of queue budget. Fails, and counts a drop,
    /// when the reservation would exceed the ceiling.
    fn reserve(&self, len: usize) -> bool {
        let mut current = self.queued.load(Ordering::Relaxed);
        loop {
            if current + len > self.ceiling {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            match self.queued.compare_exchange_weak(
                current,
                current + len,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn release(&self, len: usize) {
        self.queued.fetch_sub(len, Ordering::AcqRel);
    }

    fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}
