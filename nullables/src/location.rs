//! Nullable location source.

use std::sync::Mutex;

use async_trait::async_trait;
use patrol_verification::{LocationFix, LocationSource, VerificationError};
use tokio::sync::mpsc;

const WATCH_CAPACITY: usize = 32;

enum FixBehavior {
    Fixed(LocationFix),
    Unavailable(String),
    Hanging,
}

/// A location source with a scripted current fix and a manually driven watch.
pub struct NullLocationSource {
    behavior: Mutex<FixBehavior>,
    watchers: Mutex<Vec<mpsc::Sender<LocationFix>>>,
}

impl NullLocationSource {
    fn with_behavior(behavior: FixBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Every `current_fix` returns `fix`.
    pub fn with_fix(fix: LocationFix) -> Self {
        Self::with_behavior(FixBehavior::Fixed(fix))
    }

    /// `current_fix` never resolves.
    pub fn hanging() -> Self {
        Self::with_behavior(FixBehavior::Hanging)
    }

    /// `current_fix` fails (permission denied, services off).
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::with_behavior(FixBehavior::Unavailable(reason.into()))
    }

    pub fn set_fix(&self, fix: LocationFix) {
        *self.behavior.lock().unwrap() = FixBehavior::Fixed(fix);
    }

    /// Deliver a position update to every open watch.
    pub async fn push(&self, fix: LocationFix) {
        let watchers: Vec<_> = self.watchers.lock().unwrap().clone();
        for watcher in watchers {
            let _ = watcher.send(fix).await;
        }
    }

    pub fn watcher_count(&self) -> usize {
        let mut watchers = self.watchers.lock().unwrap();
        watchers.retain(|w| !w.is_closed());
        watchers.len()
    }
}

#[async_trait]
impl LocationSource for NullLocationSource {
    async fn current_fix(&self) -> Result<LocationFix, VerificationError> {
        let outcome = match &*self.behavior.lock().unwrap() {
            FixBehavior::Fixed(fix) => Some(Ok(*fix)),
            FixBehavior::Unavailable(reason) => {
                Some(Err(VerificationError::LocationUnavailable(reason.clone())))
            }
            FixBehavior::Hanging => None,
        };
        match outcome {
            Some(outcome) => outcome,
            None => std::future::pending().await,
        }
    }

    fn watch(&self) -> mpsc::Receiver<LocationFix> {
        let (tx, rx) = mpsc::channel(WATCH_CAPACITY);
        self.watchers.lock().unwrap().push(tx);
        rx
    }
}
