//! Location taken from the command line.

use async_trait::async_trait;
use tokio::sync::mpsc;

use patrol_types::{GeoPoint, Timestamp};
use patrol_verification::{LocationFix, LocationSource, VerificationError};

/// Reports the position given by `--lat` / `--lon`, if any.
pub struct FixedLocation {
    fix: Option<LocationFix>,
}

impl FixedLocation {
    pub fn new(lat: Option<f64>, lon: Option<f64>, accuracy_m: f64) -> Self {
        let fix = lat.zip(lon).map(|(lat, lon)| LocationFix {
            point: GeoPoint::new(lat, lon),
            accuracy_m,
            at: Timestamp::now(),
        });
        Self { fix }
    }
}

#[async_trait]
impl LocationSource for FixedLocation {
    async fn current_fix(&self) -> Result<LocationFix, VerificationError> {
        self.fix
            .map(|fix| LocationFix {
                at: Timestamp::now(),
                ..fix
            })
            .ok_or_else(|| VerificationError::LocationUnavailable("no --lat/--lon given".into()))
    }

    fn watch(&self) -> mpsc::Receiver<LocationFix> {
        let (tx, rx) = mpsc::channel(1);
        if let Some(fix) = self.fix {
            let _ = tx.try_send(fix);
        }
        rx
    }
}
