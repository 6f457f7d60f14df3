//! Evidence acquisition from device capabilities.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use patrol_nfc::{ScanCancel, TagReader};
use patrol_types::{GeoPoint, Timestamp};

use crate::{Evidence, VerificationError};

/// Default bound on waiting for a one-shot location fix.
pub const DEFAULT_LOCATION_TIMEOUT: Duration = Duration::from_secs(15);

/// One position report from the device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LocationFix {
    pub point: GeoPoint,
    /// Horizontal accuracy radius reported by the location source, in meters.
    pub accuracy_m: f64,
    pub at: Timestamp,
}

/// Device location capability.
#[async_trait]
pub trait LocationSource: Send + Sync {
    /// Request a single high-accuracy fix.
    async fn current_fix(&self) -> Result<LocationFix, VerificationError>;

    /// Continuous position updates. The watch stops when the receiver is dropped.
    fn watch(&self) -> mpsc::Receiver<LocationFix>;
}

/// Acquires evidence for each proof method.
#[derive(Clone)]
pub struct EvidenceCollector {
    location: Arc<dyn LocationSource>,
    tags: Option<TagReader>,
    location_timeout: Duration,
}

impl EvidenceCollector {
    pub fn new(location: Arc<dyn LocationSource>, tags: Option<TagReader>) -> Self {
        Self {
            location,
            tags,
            location_timeout: DEFAULT_LOCATION_TIMEOUT,
        }
    }

    pub fn with_location_timeout(mut self, timeout: Duration) -> Self {
        self.location_timeout = timeout;
        self
    }

    pub fn location(&self) -> &Arc<dyn LocationSource> {
        &self.location
    }

    /// Acquire a location fix, bounded by the configured timeout.
    pub async fn gps(&self) -> Result<Evidence, VerificationError> {
        let fix = tokio::time::timeout(self.location_timeout, self.location.current_fix())
            .await
            .map_err(|_| VerificationError::LocationTimeout)??;
        debug!(
            lat = fix.point.lat,
            lon = fix.point.lon,
            accuracy_m = fix.accuracy_m,
            "location fix"
        );
        Ok(Evidence::Gps {
            point: fix.point,
            accuracy_m: fix.accuracy_m,
        })
    }

    /// Read an NFC tag. The read is bounded by the reader's own timeout.
    pub async fn nfc(
        &self,
        prompt: &str,
        cancel: &ScanCancel,
    ) -> Result<Evidence, VerificationError> {
        let reader = self.tags.as_ref().ok_or(VerificationError::NoTagReader)?;
        let read = reader.read_tag(prompt, cancel).await?;
        Ok(Evidence::from(&read))
    }

    /// Wrap a scanned QR string. Scanning itself happens in the camera UI.
    pub fn qr(&self, code: impl Into<String>) -> Evidence {
        Evidence::Qr { code: code.into() }
    }
}
