//! Outbound publish queue.
//!
//! Producers on the hot path (the network adapter, the outcome reporter)
//! never await the broker: they push onto a bounded queue with `try_send`,
//! and a single worker task drains it into the MQTT client. State replay
//! after a reconnect uses [`Publisher::send`] instead, which waits for room
//! and so cannot lose a value to a backlog.

use log::{debug, info, warn};
use rumqttc::{AsyncClient, QoS};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl Publication {
    /// Last-known-value message, held by the broker for late subscribers.
    pub fn retained(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: true,
        }
    }

    pub fn transient(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Empty retained message; deletes whatever the broker retained on `topic`.
    pub fn clear(topic: impl Into<String>) -> Self {
        Self::retained(topic, Vec::new())
    }
}

#[derive(Clone)]
pub struct Publisher {
    tx: mpsc::Sender<Publication>,
    dropped: Arc<AtomicU64>,
}

impl Publisher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Publication>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Queue a publication without waiting. Returns false if it was dropped.
    pub fn publish(&self, publication: Publication) -> bool {
        match self.tx.try_send(publication) {
            Ok(()) => true,
            Err(TrySendError::Full(publication)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "[MQTT] Publish queue full, dropped message for {}",
                    publication.topic
                );
                false
            }
            Err(TrySendError::Closed(publication)) => {
                debug!(
                    "[MQTT] Publish queue closed, dropped message for {}",
                    publication.topic
                );
                false
            }
        }
    }

    /// Queue a publication, waiting while the queue is full. Returns false
    /// only if the worker is gone.
    pub async fn send(&self, publication: Publication) -> bool {
        match self.tx.send(publication).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(publication)) => {
                debug!(
                    "[MQTT] Publish queue closed, dropped message for {}",
                    publication.topic
                );
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain the publish queue into the broker connection.
pub async fn run_publish_worker(client: AsyncClient, mut queue: mpsc::Receiver<Publication>) {
    info!("[MQTT] Publish worker started");
    while let Some(publication) = queue.recv().await {
        debug!(
            "[MQTT] Publishing to {} ({} bytes, retain={})",
            publication.topic,
            publication.payload.len(),
            publication.retain
        );
        if let Err(e) = client
            .publish(
                publication.topic.as_str(),
                QoS::AtLeastOnce,
                publication.retain,
                publication.payload,
            )
            .await
        {
            warn!("[MQTT] Failed to publish to {}: {:?}", publication.topic, e);
        }
    }
    info!("[MQTT] Publish worker stopped");
}
