//! Bounded per-session input queues.
//!
//! Local input routed to a session goes through a bounded queue so one
//! unresponsive remote can never stall routing to the others. Overflow is
//! handled per the configured policy: drop the oldest queued chunks, or
//! block the sender up to a timeout.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// What happens when a session's input queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Discard the oldest queued chunks to make room. Sends never block.
    DropOldest,
    /// Block the sender, failing the delivery after `timeout`.
    Block { timeout: Duration },
}

/// Sizing and overflow policy of one input queue.
#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    /// Maximum queued chunks.
    pub capacity: usize,
    /// Overflow behavior.
    pub overflow: Overflow,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 64,
            overflow: Overflow::DropOldest,
        }
    }
}

/// Delivery failures into an input queue.
#[derive(Debug, Error)]
pub enum InputError {
    /// The queue stayed full past the configured timeout.
    #[error("input queue full, send timed out after {0:?}")]
    Timeout(Duration),

    /// The consuming pump is gone.
    #[error("input queue closed")]
    Closed,
}

/// Creates an input queue per `config`.
pub fn channel(config: QueueConfig) -> (InputSender, InputReceiver) {
    let dropped = Arc::new(AtomicU64::new(0));
    match config.overflow {
        Overflow::DropOldest => {
            let (tx, rx) = broadcast::channel(config.capacity);
            (
                InputSender {
                    inner: SenderInner::Dropping(tx),
                    dropped: Arc::clone(&dropped),
                },
                InputReceiver {
                    inner: ReceiverInner::Dropping(rx),
                    dropped,
                },
            )
        }
        Overflow::Block { timeout } => {
            let (tx, rx) = mpsc::channel(config.capacity);
            (
                InputSender {
                    inner: SenderInner::Blocking(tx, timeout),
                    dropped: Arc::clone(&dropped),
                },
                InputReceiver {
                    inner: ReceiverInner::Blocking(rx),
                    dropped,
                },
            )
        }
    }
}

enum SenderInner {
    Dropping(broadcast::Sender<Vec<u8>>),
    Blocking(mpsc::Sender<Vec<u8>>, Duration),
}

/// Sending half of an input queue.
pub struct InputSender {
    inner: SenderInner,
    dropped: Arc<AtomicU64>,
}

impl InputSender {
    /// Queues one chunk per the overflow policy.
    pub async fn send(&self, chunk: Vec<u8>) -> Result<(), InputError> {
        match &self.inner {
            SenderInner::Dropping(tx) => {
                // The broadcast channel overwrites the oldest entries when
                // the single receiver lags; the receiver counts the loss.
                tx.send(chunk).map(|_| ()).map_err(|_| InputError::Closed)
            }
            SenderInner::Blocking(tx, timeout) => {
                tx.send_timeout(chunk, *timeout).await.map_err(|err| match err {
                    mpsc::error::SendTimeoutError::Timeout(_) => InputError::Timeout(*timeout),
                    mpsc::error::SendTimeoutError::Closed(_) => InputError::Closed,
                })
            }
        }
    }

    /// Chunks dropped so far under the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum ReceiverInner {
    Dropping(broadcast::Receiver<Vec<u8>>),
    Blocking(mpsc::Receiver<Vec<u8>>),
}

/// Receiving half of an input queue, consumed by the session's input pump.
pub struct InputReceiver {
    inner: ReceiverInner,
    dropped: Arc<AtomicU64>,
}

impl InputReceiver {
    /// Receives the next queued chunk, `None` once the queue is closed.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        match &mut self.inner {
            ReceiverInner::Dropping(rx) => loop {
                match rx.recv().await {
                    Ok(chunk) => return Some(chunk),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        self.dropped.fetch_add(n, Ordering::Relaxed);
                        tracing::warn!(dropped = n, "Input queue overflow, dropped oldest chunks");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            ReceiverInner::Blocking(rx) => rx.recv().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order_preserved() {
        let (tx, mut rx) = channel(QueueConfig::default());
        for i in 0..5u8 {
            tx.send(vec![i]).await.unwrap();
        }
        for i in 0..5u8 {
            assert_eq!(rx.recv().await, Some(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_drop_oldest_keeps_newest() {
        let (tx, mut rx) = channel(QueueConfig {
            capacity: 2,
            overflow: Overflow::DropOldest,
        });
        for i in 0..6u8 {
            tx.send(vec![i]).await.unwrap();
        }

        // The oldest chunks were evicted; what remains is in order and
        // ends with the newest chunk.
        let mut got = Vec::new();
        while let Ok(Some(chunk)) =
            tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
        {
            got.push(chunk[0]);
        }
        assert_eq!(got.last(), Some(&5));
        assert!(got.len() < 6);
        assert!(got.windows(2).all(|w| w[0] < w[1]));
        assert!(tx.dropped() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_policy_times_out_when_full() {
        let timeout = Duration::from_millis(100);
        let (tx, _rx) = channel(QueueConfig {
            capacity: 1,
            overflow: Overflow::Block { timeout },
        });

        tx.send(b"a".to_vec()).await.unwrap();
        let err = tx.send(b"b".to_vec()).await.err().expect("queue is full");
        assert!(matches!(err, InputError::Timeout(t) if t == timeout));
    }

    #[tokio::test]
    async fn test_block_policy_closed_receiver() {
        let (tx, rx) = channel(QueueConfig {
            capacity: 1,
            overflow: Overflow::Block {
                timeout: Duration::from_millis(10),
            },
        });
        drop(rx);
        let err = tx.send(b"a".to_vec()).await.err().expect("queue closed");
        assert!(matches!(err, InputError::Closed));
    }

    #[tokio::test]
    async fn test_drop_policy_closed_receiver() {
        let (tx, rx) = channel(QueueConfig::default());
        drop(rx);
        let err = tx.send(b"a".to_vec()).await.err().expect("queue closed");
        assert!(matches!(err, InputError::Closed));
    }
}
