//! Login lifecycle and component wiring.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::watch;
use tracing::{debug, info};

use patrol_nfc::{NfcDevice, ScanCancel, TagReader};
use patrol_rounds::{Confirmation, HttpRoundApi, RoundApi, RoundMachine};
use patrol_sync::{SyncCoordinator, SyncOptions};
use patrol_transport::{
    ChatChannel, ConnectionRegistry, Connector, LocationBatcher, LocationSample, Namespace,
    TrackingChannel, WsConnector,
};
use patrol_types::{CheckpointId, Clock, Round, RoundId, SystemClock, TokenProvider};
use patrol_verification::{
    Evidence, EvidenceCollector, LocationFix, LocationSource, ProofVerifier,
};

use crate::{ClientConfig, ClientError};

/// External boundaries a session is built on.
pub struct SessionParts {
    pub api: Arc<dyn RoundApi>,
    pub connector: Arc<dyn Connector>,
    pub clock: Arc<dyn Clock>,
    pub location: Arc<dyn LocationSource>,
    pub nfc: Option<NfcDevice>,
}

struct LiveTracking {
    round: RoundId,
    stop: watch::Sender<bool>,
}

/// One operator's session.
///
/// Created logged out. [`Session::login`] stores the bearer token obtained
/// from face-recognition login; every HTTP call and socket handshake reads
/// it through the session's token provider. [`Session::logout`] disposes
/// every connection, discards the active round and forgets the token.
pub struct Session {
    config: ClientConfig,
    token: Arc<RwLock<Option<String>>>,
    registry: ConnectionRegistry,
    machine: Arc<RoundMachine>,
    evidence: EvidenceCollector,
    live: Mutex<Option<LiveTracking>>,
}

impl Session {
    /// Production wiring: `reqwest` round API and WebSocket transport.
    pub fn connect(
        config: ClientConfig,
        location: Arc<dyn LocationSource>,
        nfc: Option<NfcDevice>,
    ) -> Self {
        let token = Arc::new(RwLock::new(None));
        let api = HttpRoundApi::new(config.api_url.clone(), provider(&token));
        let parts = SessionParts {
            api: Arc::new(api),
            connector: Arc::new(WsConnector::new(config.socket_origin())),
            clock: Arc::new(SystemClock),
            location,
            nfc,
        };
        Self::build(config, parts, token)
    }

    pub fn new(config: ClientConfig, parts: SessionParts) -> Self {
        Self::build(config, parts, Arc::new(RwLock::new(None)))
    }

    fn build(
        config: ClientConfig,
        parts: SessionParts,
        token: Arc<RwLock<Option<String>>>,
    ) -> Self {
        let machine = Arc::new(RoundMachine::new(
            parts.api,
            ProofVerifier::new(config.gps_policy()),
            parts.clock,
            config.machine_config(),
        ));
        let tags = parts
            .nfc
            .map(|device| TagReader::new(device, config.nfc_config()));
        let evidence = EvidenceCollector::new(parts.location, tags)
            .with_location_timeout(config.location_timeout());
        let registry = ConnectionRegistry::new(parts.connector, config.reconnect_policy());
        Self {
            config,
            token,
            registry,
            machine,
            evidence,
            live: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn machine(&self) -> &Arc<RoundMachine> {
        &self.machine
    }

    pub fn evidence(&self) -> &EvidenceCollector {
        &self.evidence
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Reads the current token on every call.
    pub fn token_provider(&self) -> TokenProvider {
        provider(&self.token)
    }

    pub fn is_logged_in(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Store the bearer token of a successful login. A later login replaces
    /// it; open connections pick it up on their next reconnection.
    pub fn login(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = Some(token.into());
        info!("session logged in");
    }

    pub fn logout(&self) {
        self.stop_location_tracking();
        self.registry.dispose_all();
        self.machine.discard();
        *self.token.write().unwrap_or_else(PoisonError::into_inner) = None;
        info!("session logged out");
    }

    /// The shared `/chat` connection, opened on first use. Safe to call on
    /// every screen mount.
    pub fn chat(&self) -> Result<ChatChannel, ClientError> {
        self.require_login()?;
        let connection = self.registry.connect(Namespace::Chat, self.token_provider());
        Ok(ChatChannel::new(connection))
    }

    /// The shared `/tracking` connection, opened on first use.
    pub fn tracking(&self) -> Result<TrackingChannel, ClientError> {
        self.require_login()?;
        let connection = self
            .registry
            .connect(Namespace::Tracking, self.token_provider());
        Ok(TrackingChannel::new(connection))
    }

    /// Fold tracking pushes into the round machine until the returned
    /// coordinator is detached or dropped.
    pub fn attach_sync(&self) -> Result<SyncCoordinator, ClientError> {
        let tracking = self.tracking()?;
        Ok(SyncCoordinator::attach(
            Arc::clone(&self.machine),
            tracking,
            SyncOptions::default(),
        ))
    }

    /// Start a round and begin streaming the device location for it.
    pub async fn start_round(&self, round: RoundId) -> Result<Round, ClientError> {
        self.require_login()?;
        let started = self.machine.start(round).await?;
        self.start_location_tracking(round)?;
        Ok(started)
    }

    /// Pick up a round already in progress on the server.
    pub async fn resume_round(&self, round: RoundId) -> Result<Round, ClientError> {
        self.require_login()?;
        let resumed = self.machine.resume(round).await?;
        self.start_location_tracking(round)?;
        Ok(resumed)
    }

    pub async fn end_round(
        &self,
        round: RoundId,
        notes: Option<&str>,
    ) -> Result<Round, ClientError> {
        self.require_login()?;
        let ended = self.machine.end(round, notes).await?;
        self.stop_location_tracking();
        Ok(ended)
    }

    pub async fn verify_gps(&self, checkpoint: CheckpointId) -> Result<Confirmation, ClientError> {
        let evidence = self.evidence.gps().await?;
        self.submit(checkpoint, evidence).await
    }

    pub async fn verify_qr(
        &self,
        checkpoint: CheckpointId,
        code: &str,
    ) -> Result<Confirmation, ClientError> {
        let evidence = self.evidence.qr(code);
        self.submit(checkpoint, evidence).await
    }

    pub async fn verify_nfc(
        &self,
        checkpoint: CheckpointId,
        cancel: &ScanCancel,
    ) -> Result<Confirmation, ClientError> {
        let evidence = self.evidence.nfc("Hold the device near the tag", cancel).await?;
        self.submit(checkpoint, evidence).await
    }

    async fn submit(
        &self,
        checkpoint: CheckpointId,
        evidence: Evidence,
    ) -> Result<Confirmation, ClientError> {
        self.require_login()?;
        Ok(self.machine.log_checkpoint(checkpoint, evidence).await?)
    }

    /// Stream location fixes for `round` as `location_batch` emits. A no-op
    /// when already streaming for the same round.
    pub fn start_location_tracking(&self, round: RoundId) -> Result<(), ClientError> {
        let tracking = self.tracking()?;
        let mut live = self.live();
        if let Some(current) = live.as_ref() {
            if current.round == round {
                return Ok(());
            }
            current.stop.send_replace(true);
        }

        let batcher = Arc::new(LocationBatcher::new(tracking));
        batcher.set_round(Some(round));
        let (stop, stop_rx) = watch::channel(false);

        let mut fixes = self.evidence.location().watch();
        let mut pump_stop = stop_rx.clone();
        let pump = Arc::clone(&batcher);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    fix = fixes.recv() => match fix {
                        Some(fix) => pump.push(sample(&fix)),
                        None => break,
                    },
                    _ = pump_stop.changed() => break,
                }
            }
            debug!("location pump stopped");
        });
        tokio::spawn(batcher.run(self.config.location_batch_interval(), stop_rx));

        info!(round = %round, "live location started");
        *live = Some(LiveTracking { round, stop });
        Ok(())
    }

    pub fn stop_location_tracking(&self) {
        if let Some(current) = self.live().take() {
            current.stop.send_replace(true);
            info!(round = %current.round, "live location stopped");
        }
    }

    pub fn is_tracking_location(&self) -> bool {
        self.live().is_some()
    }

    fn require_login(&self) -> Result<(), ClientError> {
        if self.is_logged_in() {
            Ok(())
        } else {
            Err(ClientError::NotLoggedIn)
        }
    }

    fn live(&self) -> MutexGuard<'_, Option<LiveTracking>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stop_location_tracking();
    }
}

fn provider(token: &Arc<RwLock<Option<String>>>) -> TokenProvider {
    let token = Arc::clone(token);
    Arc::new(move || token.read().unwrap_or_else(PoisonError::into_inner).clone())
}

fn sample(fix: &LocationFix) -> LocationSample {
    LocationSample {
        lat: fix.point.lat,
        lon: fix.point.lon,
        accuracy: fix.accuracy_m,
        timestamp: fix.at,
    }
}
