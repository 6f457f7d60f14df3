//! Typed events of the `/tracking` namespace and live location batching.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, warn};

use patrol_types::{CheckpointId, ProofMethod, RoundId, Timestamp};

use crate::{Connection, Subscription, TransportError};

pub const LOCATION_BATCH: &str = "location_batch";
pub const ROUND_UPDATED: &str = "round_updated";
pub const ROUND_VERIFIED: &str = "round_verified";
pub const CHECKPOINT_CONFIRMED: &str = "checkpoint_confirmed";
pub const CHECKPOINT_REJECTED: &str = "checkpoint_rejected";

/// Samples kept while the link is down; older ones are dropped first.
pub const DEFAULT_BATCH_CAPACITY: usize = 500;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub lat: f64,
    pub lon: f64,
    pub accuracy: f64,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationBatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_id: Option<RoundId>,
    pub samples: Vec<LocationSample>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointConfirmedPush {
    pub round_id: RoundId,
    pub checkpoint_id: CheckpointId,
    pub method: ProofMethod,
    pub timestamp: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointRejectedPush {
    pub round_id: RoundId,
    pub checkpoint_id: CheckpointId,
    #[serde(default)]
    pub message: String,
}

/// Tracking view over the shared `/tracking` connection.
///
/// Round snapshots are delivered as `T` so the consumer picks the round
/// representation.
#[derive(Clone)]
pub struct TrackingChannel {
    connection: Arc<Connection>,
}

impl TrackingChannel {
    pub fn new(connection: Arc<Connection>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn send_location_batch(&self, batch: &LocationBatch) -> Result<(), TransportError> {
        let payload =
            serde_json::to_value(batch).map_err(|e| TransportError::Codec(e.to_string()))?;
        self.connection.emit(LOCATION_BATCH, payload)
    }

    pub fn on_round_updated<T, F>(&self, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.connection.on_json(ROUND_UPDATED, handler)
    }

    pub fn on_round_verified<T, F>(&self, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        self.connection.on_json(ROUND_VERIFIED, handler)
    }

    pub fn on_checkpoint_confirmed<F>(&self, handler: F) -> Subscription
    where
        F: Fn(CheckpointConfirmedPush) + Send + Sync + 'static,
    {
        self.connection.on_json(CHECKPOINT_CONFIRMED, handler)
    }

    pub fn on_checkpoint_rejected<F>(&self, handler: F) -> Subscription
    where
        F: Fn(CheckpointRejectedPush) + Send + Sync + 'static,
    {
        self.connection.on_json(CHECKPOINT_REJECTED, handler)
    }
}

/// Buffers location samples and sends them as one `location_batch` per flush.
///
/// A flush while disconnected keeps the samples for the next one. The buffer
/// is bounded; when full, the oldest sample is dropped.
pub struct LocationBatcher {
    channel: TrackingChannel,
    capacity: usize,
    round: Mutex<Option<RoundId>>,
    buffer: Mutex<VecDeque<LocationSample>>,
}

impl LocationBatcher {
    pub fn new(channel: TrackingChannel) -> Self {
        Self::with_capacity(channel, DEFAULT_BATCH_CAPACITY)
    }

    pub fn with_capacity(channel: TrackingChannel, capacity: usize) -> Self {
        Self {
            channel,
            capacity: capacity.max(1),
            round: Mutex::new(None),
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Tag subsequent batches with the active round.
    pub fn set_round(&self, round: Option<RoundId>) {
        *lock(&self.round) = round;
    }

    pub fn push(&self, sample: LocationSample) {
        let mut buffer = lock(&self.buffer);
        if buffer.len() == self.capacity {
            buffer.pop_front();
            debug!("location buffer full, oldest sample dropped");
        }
        buffer.push_back(sample);
    }

    pub fn pending(&self) -> usize {
        lock(&self.buffer).len()
    }

    /// Send everything buffered. Returns the number of samples sent.
    pub fn flush(&self) -> Result<usize, TransportError> {
        let mut buffer = lock(&self.buffer);
        if buffer.is_empty() {
            return Ok(0);
        }
        let batch = LocationBatch {
            round_id: *lock(&self.round),
            samples: buffer.iter().copied().collect(),
        };
        self.channel.send_location_batch(&batch)?;
        let sent = buffer.len();
        buffer.clear();
        Ok(sent)
    }

    /// Flush every `interval` until `stop` turns true, then flush once more.
    pub async fn run(self: Arc<Self>, interval: Duration, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush() {
                        debug!(error = %e, kept = self.pending(), "location flush deferred");
                    }
                }
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = self.flush() {
            warn!(error = %e, dropped = self.pending(), "final location flush failed");
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
