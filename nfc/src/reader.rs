//! Single-shot tag reads with timeout, cancellation and guaranteed teardown.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::device::{EventNfc, NfcDevice, PollingNfc, RawTag};
use crate::ndef::{decode_first_record, DecodedPayload};
use crate::TagError;

/// Default bound on how long a scan waits for a tag.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct NfcConfig {
    pub read_timeout: Duration,
}

impl Default for NfcConfig {
    fn default() -> Self {
        Self {
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Handle that lets the UI dismiss an in-flight scan.
///
/// Clones share the same signal. Cancelling runs the same session teardown
/// as success or timeout.
#[derive(Clone, Debug)]
pub struct ScanCancel {
    tx: Arc<watch::Sender<bool>>,
}

impl ScanCancel {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once [`ScanCancel::cancel`] has been called.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

impl Default for ScanCancel {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a successful scan.
#[derive(Clone, Debug, PartialEq)]
pub struct TagRead {
    pub text: Option<String>,
    pub uri: Option<String>,
    pub tag: RawTag,
}

impl TagRead {
    pub fn from_tag(tag: RawTag) -> Self {
        let (text, uri) = match decode_first_record(&tag.ndef_message) {
            Some(DecodedPayload::Text(text)) => (Some(text), None),
            Some(DecodedPayload::Uri(uri)) => (None, Some(uri)),
            None => (None, None),
        };
        Self { text, uri, tag }
    }

    pub fn uid(&self) -> String {
        self.tag.uid_hex()
    }

    /// Decoded text, falling back to the URI.
    pub fn payload(&self) -> Option<&str> {
        self.text.as_deref().or(self.uri.as_deref())
    }
}

/// Reads NFC tags through whichever session model the device uses.
#[derive(Clone, Debug)]
pub struct TagReader {
    device: NfcDevice,
    config: NfcConfig,
}

impl TagReader {
    pub fn new(device: NfcDevice, config: NfcConfig) -> Self {
        Self { device, config }
    }

    /// Read one tag.
    ///
    /// Fails immediately, without opening a session, when the hardware is
    /// unsupported or disabled.
    pub async fn read_tag(&self, prompt: &str, cancel: &ScanCancel) -> Result<TagRead, TagError> {
        if !self.device.is_supported().await {
            return Err(TagError::UnsupportedHardware);
        }
        if !self.device.is_enabled().await {
            return Err(TagError::HardwareDisabled);
        }

        debug!(model = self.device.model(), "starting NFC scan");
        let tag = match &self.device {
            NfcDevice::Polling(device) => self.read_polling(device, prompt, cancel).await,
            NfcDevice::Event(device) => self.read_event(device, prompt, cancel).await,
        };

        match tag {
            Ok(tag) => {
                let read = TagRead::from_tag(tag);
                debug!(uid = %read.uid(), has_payload = read.payload().is_some(), "tag read");
                Ok(read)
            }
            Err(e) => {
                warn!(error = %e, "NFC scan failed");
                Err(e)
            }
        }
    }

    async fn read_polling(
        &self,
        device: &Arc<dyn PollingNfc>,
        prompt: &str,
        cancel: &ScanCancel,
    ) -> Result<RawTag, TagError> {
        let session = PollingSession {
            device: Some(Arc::clone(device)),
        };
        let acquire = async {
            device.request_technology(prompt).await?;
            device.get_tag().await
        };
        let result = bounded(acquire, self.config.read_timeout, cancel).await;
        session.release().await;
        result
    }

    async fn read_event(
        &self,
        device: &Arc<dyn EventNfc>,
        prompt: &str,
        cancel: &ScanCancel,
    ) -> Result<RawTag, TagError> {
        let (tx, rx) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let listener_slot = Arc::clone(&slot);
        device.set_discovery_listener(Some(Box::new(move |outcome| {
            let sender = listener_slot.lock().ok().and_then(|mut s| s.take());
            if let Some(sender) = sender {
                let _ = sender.send(outcome);
            }
        })));
        let session = EventSession {
            device: Some(Arc::clone(device)),
        };

        let acquire = async {
            device.register_tag_event(prompt).await?;
            rx.await.map_err(|_| TagError::SessionClosed)?
        };
        let result = bounded(acquire, self.config.read_timeout, cancel).await;
        session.release().await;
        result
    }
}

/// Open polling session. Released by [`PollingSession::release`], or from
/// `Drop` when the read future is abandoned mid-scan.
struct PollingSession {
    device: Option<Arc<dyn PollingNfc>>,
}

impl PollingSession {
    async fn release(mut self) {
        if let Some(device) = self.device.take() {
            device.cancel_technology_request().await;
        }
    }
}

impl Drop for PollingSession {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            debug!("scan abandoned, releasing technology session");
            spawn_teardown(async move { device.cancel_technology_request().await });
        }
    }
}

/// Installed discovery listener plus reading session.
struct EventSession {
    device: Option<Arc<dyn EventNfc>>,
}

impl EventSession {
    async fn release(mut self) {
        if let Some(device) = self.device.take() {
            device.set_discovery_listener(None);
            device.unregister_tag_event().await;
        }
    }
}

impl Drop for EventSession {
    fn drop(&mut self) {
        if let Some(device) = self.device.take() {
            debug!("scan abandoned, removing discovery listener");
            device.set_discovery_listener(None);
            spawn_teardown(async move { device.unregister_tag_event().await });
        }
    }
}

fn spawn_teardown<F>(teardown: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(teardown);
        }
        Err(_) => warn!("no runtime to close the NFC session on"),
    }
}

/// Race a tag acquisition against the timeout and the cancel signal.
async fn bounded<F>(acquire: F, timeout: Duration, cancel: &ScanCancel) -> Result<RawTag, TagError>
where
    F: Future<Output = Result<RawTag, TagError>>,
{
    tokio::select! {
        result = tokio::time::timeout(timeout, acquire) => {
            result.unwrap_or(Err(TagError::Timeout))
        }
        _ = cancel.cancelled() => Err(TagError::Cancelled),
    }
}
