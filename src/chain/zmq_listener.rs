//! Node ZMQ subscriber for mempool transactions and new blocks.
//!
//! Subscribes to the node's `rawtx` (and optionally `rawblock`) topics and
//! forwards raw payloads with their arrival time over bounded channels.
//! Reconnects forever with capped exponential backoff; messages already
//! queued in the channels survive reconnects. Within a topic, source order
//! is preserved; across topics there is no ordering guarantee.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use zeromq::{Socket, SocketRecv, SubSocket};

/// Reconnect backoff bounds.
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Queue depth per topic; the consumer applies backpressure past this.
const CHANNEL_DEPTH: usize = 4096;

pub const RAWTX_TOPIC: &str = "rawtx";
pub const RAWBLOCK_TOPIC: &str = "rawblock";

/// One raw payload from a topic, timestamped at arrival.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub bytes: Vec<u8>,
    pub arrival_time: f64,
}

/// Handles to the listener's output channels.
pub struct ZmqListener {
    pub transactions: mpsc::Receiver<RawMessage>,
    pub blocks: Option<mpsc::Receiver<RawMessage>>,
}

impl ZmqListener {
    /// Spawn one subscriber task per topic. Tasks exit when the shutdown
    /// signal flips, completing the in-flight message first.
    pub fn spawn(
        tx_endpoint: String,
        block_endpoint: Option<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let (tx_sender, tx_receiver) = mpsc::channel(CHANNEL_DEPTH);
        tokio::spawn(subscribe_loop(
            tx_endpoint,
            RAWTX_TOPIC,
            tx_sender,
            shutdown.clone(),
        ));

        let blocks = block_endpoint.map(|endpoint| {
            let (block_sender, block_receiver) = mpsc::channel(CHANNEL_DEPTH);
            tokio::spawn(subscribe_loop(
                endpoint,
                RAWBLOCK_TOPIC,
                block_sender,
                shutdown,
            ));
            block_receiver
        });

        Self {
            transactions: tx_receiver,
            blocks,
        }
    }
}

fn now_seconds() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

async fn subscribe_loop(
    endpoint: String,
    topic: &'static str,
    sender: mpsc::Sender<RawMessage>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match stream_topic(&endpoint, topic, &sender, &mut shutdown).await {
            Ok(()) => break, // clean shutdown
            Err(e) => {
                warn!(
                    endpoint = %endpoint,
                    topic,
                    error = %e,
                    backoff_secs = backoff.as_secs(),
                    "ZMQ stream dropped, reconnecting"
                );
            }
        }

        // Sleep with one eye on the shutdown signal.
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown.changed() => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    debug!(topic, "ZMQ subscriber stopped");
}

/// Connect, subscribe, and pump messages until an error or shutdown.
async fn stream_topic(
    endpoint: &str,
    topic: &'static str,
    sender: &mpsc::Sender<RawMessage>,
    shutdown: &mut watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut socket = SubSocket::new();
    socket.connect(endpoint).await?;
    socket.subscribe(topic).await?;
    info!(endpoint = %endpoint, topic, "ZMQ subscribed");

    loop {
        let message = tokio::select! {
            message = socket.recv() => message?,
            _ = shutdown.changed() => return Ok(()),
        };

        let arrival_time = now_seconds();

        // Frames: topic, payload, monotonic sequence. The payload is all the
        // pipeline needs.
        let frames = message.into_vec();
        let Some(payload) = frames.get(1) else {
            debug!(topic, frames = frames.len(), "short ZMQ message skipped");
            continue;
        };

        let raw = RawMessage {
            bytes: payload.to_vec(),
            arrival_time,
        };

        // Completing this send before checking shutdown again means the
        // in-flight message is never dropped mid-handoff.
        if sender.send(raw).await.is_err() {
            return Ok(()); // consumer gone: pipeline is shutting down
        }

        if *shutdown.borrow() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        // Endpoint that nothing listens on: the task sits in backoff.
        let listener = ZmqListener::spawn(
            "tcp://127.0.0.1:1".to_string(),
            None,
            shutdown_rx,
        );
        assert!(listener.blocks.is_none());

        shutdown_tx.send(true).unwrap();

        // The channel closes once the subscriber task exits.
        let mut transactions = listener.transactions;
        let closed = tokio::time::timeout(Duration::from_secs(5), async move {
            while transactions.recv().await.is_some() {}
        })
        .await;
        assert!(closed.is_ok(), "subscriber task did not stop");
    }
}
