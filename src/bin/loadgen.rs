//! Benchmark load generator for the ws-fanout server.
//!
//! Spawns concurrent WebSocket clients, each sending batches of JSON
//! messages on an interval and draining the amplified replies. When every
//! client has finished, prints aggregate round-trip and server-reported
//! latency summaries.

use clap::Parser;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{self, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use ws_fanout::protocol::{now_millis, EchoReply};

/// Command-line arguments for the load generator
#[derive(Parser, Debug)]
#[command(name = "loadgen")]
#[command(version = "0.1.0")]
#[command(about = "Load generator for the ws-fanout server", long_about = None)]
struct Args {
    /// WebSocket URL of the server
    #[arg(short, long, default_value = "ws://127.0.0.1:3000/")]
    server: String,

    /// Number of concurrent clients
    #[arg(short, long, default_value_t = 100)]
    clients: usize,

    /// Messages per batch
    #[arg(short, long, default_value_t = 1)]
    batch_size: usize,

    /// Number of batches per client
    #[arg(short, long, default_value_t = 10)]
    n_batches: usize,

    /// Wait between batches in milliseconds
    #[arg(short, long, default_value_t = 100)]
    wait: u64,

    /// Replies expected per sent message (the server's write factor)
    #[arg(short, long, default_value_t = 4)]
    rcv_factor: usize,

    /// Payload size in bytes
    #[arg(short, long, default_value_t = 1024)]
    payload: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;
type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The message shape the server expects
#[derive(Serialize, Debug)]
struct OutboundMessage<'a> {
    client_id: usize,
    msg_id: usize,
    msg: &'a str,
    created_at: i64,
}

/// One observed reply
#[derive(Debug)]
struct Sample {
    rtt_ms: i64,
    server_latency_ms: i64,
}

/// Running min/mean/max over recorded samples
#[derive(Debug, Default)]
struct Summary {
    count: u64,
    sum: i64,
    min: i64,
    max: i64,
}

impl Summary {
    fn record(&mut self, value: i64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum as f64 / self.count as f64
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<(), BoxError> {
    let args = Arc::new(Args::parse());

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        server = %args.server,
        clients = args.clients,
        batch_size = args.batch_size,
        n_batches = args.n_batches,
        rcv_factor = args.rcv_factor,
        "Starting load generator"
    );

    let (tx, rx) = mpsc::unbounded_channel::<Sample>();
    let aggregator = tokio::spawn(aggregate(rx));

    let start = Instant::now();
    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let args = Arc::clone(&args);
        let tx = tx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_client(client_id, args, tx).await {
                error!(client_id, error = %e, "Client failed");
            }
        }));
    }
    drop(tx);

    for task in tasks {
        task.await?;
    }
    let elapsed = start.elapsed();

    let (rtt, server_latency) = aggregator.await?;
    info!(
        elapsed_ms = elapsed.as_millis() as u64,
        replies = rtt.count,
        "Run complete"
    );
    info!(
        min = rtt.min,
        mean = rtt.mean(),
        max = rtt.max,
        "Round-trip latency (ms)"
    );
    info!(
        min = server_latency.min,
        mean = server_latency.mean(),
        max = server_latency.max,
        "Server-reported latency (ms)"
    );
    Ok(())
}

/// Collect samples until every client sender is gone
async fn aggregate(mut rx: mpsc::UnboundedReceiver<Sample>) -> (Summary, Summary) {
    let mut rtt = Summary::default();
    let mut server_latency = Summary::default();
    while let Some(sample) = rx.recv().await {
        rtt.record(sample.rtt_ms);
        server_latency.record(sample.server_latency_ms);
    }
    (rtt, server_latency)
}

/// Connect one client and run its send and receive halves to completion
async fn run_client(
    client_id: usize,
    args: Arc<Args>,
    results: mpsc::UnboundedSender<Sample>,
) -> Result<(), BoxError> {
    let ws_stream = connect(client_id, &args.server).await?;
    let (sender, receiver) = ws_stream.split();

    let expected = args.batch_size * args.n_batches * args.rcv_factor;
    let send_task = tokio::spawn(run_sender(sender, client_id, Arc::clone(&args)));
    let recv_task = tokio::spawn(run_receiver(receiver, client_id, expected, results));

    let (send_res, recv_res) = tokio::join!(send_task, recv_task);
    send_res??;
    recv_res??;

    debug!(client_id, "Client finished");
    Ok(())
}

/// Connect with bounded retries; the server may still be binding when a
/// large client fleet starts up.
async fn connect(client_id: usize, server: &str) -> Result<WsClient, BoxError> {
    const ATTEMPTS: usize = 20;

    let mut attempt = 0;
    loop {
        match connect_async(server).await {
            Ok((ws_stream, _response)) => {
                debug!(client_id, attempt, "Connected");
                return Ok(ws_stream);
            }
            Err(e) if attempt < ATTEMPTS => {
                debug!(client_id, attempt, error = %e, "Connect failed; retrying");
                attempt += 1;
                time::sleep(Duration::from_millis(100)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

async fn run_sender(
    mut sender: SplitSink<WsClient, Message>,
    client_id: usize,
    args: Arc<Args>,
) -> Result<(), BoxError> {
    // Stagger clients so batches do not run in lockstep
    time::sleep(Duration::from_millis((client_id % 100) as u64)).await;

    let payload = "x".repeat(args.payload);
    let mut interval = time::interval(Duration::from_millis(args.wait.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    for batch in 0..args.n_batches {
        interval.tick().await;
        debug!(client_id, batch, "Sending batch");

        for idx in 0..args.batch_size {
            let outbound = OutboundMessage {
                client_id,
                msg_id: batch * args.batch_size + idx,
                msg: &payload,
                created_at: now_millis(),
            };
            let text = serde_json::to_string(&outbound)?;
            sender.send(Message::Text(text)).await?;
        }
    }

    sender.send(Message::Close(None)).await.ok();
    Ok(())
}

async fn run_receiver(
    mut receiver: SplitStream<WsClient>,
    client_id: usize,
    expected: usize,
    results: mpsc::UnboundedSender<Sample>,
) -> Result<(), BoxError> {
    let mut received = 0;
    while received < expected {
        let frame = match receiver.next().await {
            Some(frame) => frame?,
            None => break,
        };

        let reply: EchoReply = match frame {
            Message::Text(text) => serde_json::from_str(&text)?,
            Message::Binary(data) => serde_json::from_slice(&data)?,
            Message::Close(_) => break,
            _ => continue,
        };

        let recv_ts = now_millis();
        results.send(Sample {
            rtt_ms: recv_ts - reply.client_ts,
            server_latency_ms: reply.server_latency,
        })?;
        received += 1;
    }

    if received < expected {
        warn!(
            client_id,
            received, expected, "Connection ended before all replies arrived"
        );
    } else {
        debug!(client_id, received, "Received all replies");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_records_extremes() {
        let mut summary = Summary::default();
        summary.record(5);
        summary.record(-2);
        summary.record(10);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, -2);
        assert_eq!(summary.max, 10);
        assert!((summary.mean() - 13.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_summary_mean() {
        let summary = Summary::default();
        assert_eq!(summary.mean(), 0.0);
    }
}
