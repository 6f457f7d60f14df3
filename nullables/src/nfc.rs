//! Nullable NFC drivers for both session models.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use patrol_nfc::{EventNfc, NdefRecord, PollingNfc, RawTag, TagError, TagListener};

const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// A tag carrying one well-known Text record (language `en`).
pub fn text_tag(uid: &[u8], text: &str) -> RawTag {
    let mut payload = vec![0x02, b'e', b'n'];
    payload.extend_from_slice(text.as_bytes());
    RawTag {
        id: uid.into(),
        tech_types: vec!["android.nfc.tech.Ndef".into()],
        ndef_message: vec![NdefRecord {
            tnf: 0x01,
            record_type: b"T".as_slice().into(),
            payload: payload.into(),
        }],
    }
}

/// A tag carrying one well-known URI record with the given prefix code.
pub fn uri_tag(uid: &[u8], prefix_code: u8, rest: &str) -> RawTag {
    let mut payload = vec![prefix_code];
    payload.extend_from_slice(rest.as_bytes());
    RawTag {
        id: uid.into(),
        tech_types: vec!["android.nfc.tech.Ndef".into()],
        ndef_message: vec![NdefRecord {
            tnf: 0x01,
            record_type: b"U".as_slice().into(),
            payload: payload.into(),
        }],
    }
}

/// Polling-model driver. `get_tag` waits until a tag is presented.
pub struct NullPollingNfc {
    supported: AtomicBool,
    enabled: AtomicBool,
    session_open: AtomicBool,
    requests: AtomicUsize,
    releases: AtomicUsize,
    tags: Mutex<VecDeque<RawTag>>,
    failure: Mutex<Option<TagError>>,
}

impl NullPollingNfc {
    pub fn new() -> Self {
        Self {
            supported: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            session_open: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            tags: Mutex::new(VecDeque::new()),
            failure: Mutex::new(None),
        }
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Hold a tag near the reader.
    pub fn present(&self, tag: RawTag) {
        self.tags.lock().unwrap().push_back(tag);
    }

    /// Make the next `get_tag` fail.
    pub fn fail_next(&self, error: TagError) {
        *self.failure.lock().unwrap() = Some(error);
    }

    pub fn technology_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn technology_releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    pub fn session_open(&self) -> bool {
        self.session_open.load(Ordering::SeqCst)
    }
}

impl Default for NullPollingNfc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PollingNfc for NullPollingNfc {
    async fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    async fn request_technology(&self, _prompt: &str) -> Result<(), TagError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.session_open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn get_tag(&self) -> Result<RawTag, TagError> {
        loop {
            if let Some(error) = self.failure.lock().unwrap().take() {
                return Err(error);
            }
            if let Some(tag) = self.tags.lock().unwrap().pop_front() {
                return Ok(tag);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn cancel_technology_request(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.session_open.store(false, Ordering::SeqCst);
    }
}

/// Event-model driver. Discoveries are pushed through the installed listener.
pub struct NullEventNfc {
    supported: AtomicBool,
    enabled: AtomicBool,
    listener: Mutex<Option<TagListener>>,
    installs: AtomicUsize,
    removals: AtomicUsize,
    registrations: AtomicUsize,
    unregistrations: AtomicUsize,
    on_register: Mutex<Option<Result<RawTag, TagError>>>,
}

impl NullEventNfc {
    pub fn new() -> Self {
        Self {
            supported: AtomicBool::new(true),
            enabled: AtomicBool::new(true),
            listener: Mutex::new(None),
            installs: AtomicUsize::new(0),
            removals: AtomicUsize::new(0),
            registrations: AtomicUsize::new(0),
            unregistrations: AtomicUsize::new(0),
            on_register: Mutex::new(None),
        }
    }

    pub fn set_supported(&self, supported: bool) {
        self.supported.store(supported, Ordering::SeqCst);
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Deliver `outcome` to the listener as soon as the next session opens.
    pub fn deliver_on_register(&self, outcome: Result<RawTag, TagError>) {
        *self.on_register.lock().unwrap() = Some(outcome);
    }

    /// Simulate a discovery. Returns whether a listener received it.
    pub fn discover(&self, outcome: Result<RawTag, TagError>) -> bool {
        let listener = self.listener.lock().unwrap();
        match listener.as_ref() {
            Some(listener) => {
                listener(outcome);
                true
            }
            None => false,
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }

    pub fn listener_installs(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn listener_removals(&self) -> usize {
        self.removals.load(Ordering::SeqCst)
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    pub fn unregistrations(&self) -> usize {
        self.unregistrations.load(Ordering::SeqCst)
    }
}

impl Default for NullEventNfc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventNfc for NullEventNfc {
    async fn is_supported(&self) -> bool {
        self.supported.load(Ordering::SeqCst)
    }

    async fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn set_discovery_listener(&self, listener: Option<TagListener>) {
        match &listener {
            Some(_) => self.installs.fetch_add(1, Ordering::SeqCst),
            None => self.removals.fetch_add(1, Ordering::SeqCst),
        };
        *self.listener.lock().unwrap() = listener;
    }

    async fn register_tag_event(&self, _prompt: &str) -> Result<(), TagError> {
        self.registrations.fetch_add(1, Ordering::SeqCst);
        let pending = self.on_register.lock().unwrap().take();
        if let Some(outcome) = pending {
            self.discover(outcome);
        }
        Ok(())
    }

    async fn unregister_tag_event(&self) {
        self.unregistrations.fetch_add(1, Ordering::SeqCst);
    }
}
