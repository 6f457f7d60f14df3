//! Tracking pushes and reconnect refetch, folded into the round machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use patrol_rounds::{ApplyEffect, RetryReport, RoundDetail, RoundError, RoundMachine};
use patrol_transport::events::{CONNECT, DISCONNECT};
use patrol_transport::{
    CheckpointConfirmedPush, CheckpointRejectedPush, Subscription, TrackingChannel,
};
use patrol_types::RejectionReason;

use crate::SyncError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    /// Resubmit pending logs once the round has been refetched after a
    /// reconnect.
    pub retry_on_reconnect: bool,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            retry_on_reconnect: true,
        }
    }
}

enum Signal {
    Confirmed(CheckpointConfirmedPush),
    Rejected(CheckpointRejectedPush),
    Snapshot(Box<RoundDetail>),
    Connected,
    Disconnected,
}

/// Folds server pushes on the tracking namespace into a [`RoundMachine`].
///
/// Listener callbacks only enqueue; a single worker task applies signals in
/// arrival order, so a refetch never interleaves with a push. Whichever of
/// the HTTP ack and the `checkpoint_confirmed` push lands first confirms the
/// log; the other is a no-op.
///
/// [`SyncCoordinator::detach`] (or dropping the coordinator) removes the
/// listeners but leaves the shared connection open.
pub struct SyncCoordinator {
    machine: Arc<RoundMachine>,
    tracking: TrackingChannel,
    subscriptions: Mutex<Vec<Subscription>>,
    attached: AtomicBool,
}

impl SyncCoordinator {
    /// Install the listeners and spawn the worker. Must be called inside a
    /// tokio runtime.
    pub fn attach(
        machine: Arc<RoundMachine>,
        tracking: TrackingChannel,
        options: SyncOptions,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = tracking.connection();
        let subscriptions = vec![
            tracking.on_checkpoint_confirmed(forward(&tx, Signal::Confirmed)),
            tracking.on_checkpoint_rejected(forward(&tx, Signal::Rejected)),
            tracking.on_round_updated(forward(&tx, Signal::Snapshot)),
            tracking.on_round_verified(forward(&tx, Signal::Snapshot)),
            connection.on(CONNECT, {
                let tx = tx.clone();
                move |_| {
                    let _ = tx.send(Signal::Connected);
                }
            }),
            connection.on(DISCONNECT, move |_| {
                let _ = tx.send(Signal::Disconnected);
            }),
        ];
        tokio::spawn(fold(Arc::clone(&machine), rx, options));
        info!(namespace = %connection.namespace(), "sync attached");

        Self {
            machine,
            tracking,
            subscriptions: Mutex::new(subscriptions),
            attached: AtomicBool::new(true),
        }
    }

    pub fn machine(&self) -> &Arc<RoundMachine> {
        &self.machine
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    /// Resubmit pending logs under the machine's retry budget.
    pub async fn retry_pending(&self) -> Result<RetryReport, SyncError> {
        if !self.is_attached() {
            return Err(SyncError::Detached);
        }
        Ok(self.machine.retry_pending().await)
    }

    /// Refetch the active round now.
    pub async fn resync(&self) -> Result<ApplyEffect, SyncError> {
        if !self.is_attached() {
            return Err(SyncError::Detached);
        }
        Ok(self.machine.refresh().await?)
    }

    /// Remove every listener this coordinator installed. The worker stops
    /// once the signals already queued are applied.
    pub fn detach(&self) {
        if !self.attached.swap(false, Ordering::SeqCst) {
            return;
        }
        let subscriptions: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        let count = subscriptions.len();
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        info!(
            namespace = %self.tracking.connection().namespace(),
            listeners = count,
            "sync detached"
        );
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.detach();
    }
}

fn forward<T: 'static>(
    tx: &mpsc::UnboundedSender<Signal>,
    wrap: fn(T) -> Signal,
) -> impl Fn(T) + Send + Sync + 'static {
    let tx = tx.clone();
    move |value| {
        let _ = tx.send(wrap(value));
    }
}

async fn fold(
    machine: Arc<RoundMachine>,
    mut signals: mpsc::UnboundedReceiver<Signal>,
    options: SyncOptions,
) {
    // Set by a disconnect; the next connect is a reconnect after a gap.
    let mut gap = false;

    while let Some(signal) = signals.recv().await {
        match signal {
            Signal::Confirmed(push) => {
                let effect = machine.apply_confirmation(
                    push.round_id,
                    push.checkpoint_id,
                    push.method,
                    push.timestamp,
                );
                debug!(
                    round = %push.round_id,
                    checkpoint = %push.checkpoint_id,
                    effect = ?effect,
                    "confirmation push"
                );
            }
            Signal::Rejected(push) => {
                let reason = RejectionReason::ServerRejected {
                    message: push.message,
                };
                let effect = machine.apply_rejection(push.round_id, push.checkpoint_id, reason);
                debug!(
                    round = %push.round_id,
                    checkpoint = %push.checkpoint_id,
                    effect = ?effect,
                    "rejection push"
                );
            }
            Signal::Snapshot(detail) => {
                let round = detail.id;
                let effect = machine.apply_server_round(*detail);
                debug!(round = %round, effect = ?effect, "round push");
            }
            Signal::Disconnected => gap = true,
            Signal::Connected if gap => {
                gap = false;
                resync(&machine, options).await;
            }
            Signal::Connected => {}
        }
    }
    debug!("sync worker stopped");
}

async fn resync(machine: &RoundMachine, options: SyncOptions) {
    match machine.refresh().await {
        Ok(effect) => info!(effect = ?effect, "round refetched after reconnect"),
        Err(RoundError::NoActiveRound) => return,
        Err(e) => warn!(error = %e, "refetch after reconnect failed"),
    }
    if options.retry_on_reconnect {
        let report = machine.retry_pending().await;
        debug!(
            confirmed = report.confirmed.len(),
            rejected = report.rejected.len(),
            still_pending = report.still_pending.len(),
            "pending logs retried after reconnect"
        );
    }
}
