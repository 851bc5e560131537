use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use crate::drivers::{DeviceKind, DriverProfile, OpenCloseSwitch, Switch, TypedDevice};
use crate::keystore::{KeyStore, NoopKeyStore};
use crate::light::Light;
use crate::scanner::AnnouncementSink;
use crate::session::{DeviceSession, SessionConfig, SessionObserver, StatusRecord};
use crate::{DEFAULT_HEARTBEAT_SECS, DEFAULT_TCP_PORT, DEFAULT_VERSION, PROBE_HEARTBEAT_SECS};

/// Probe errors tolerated before a device is given up on.
const MAX_PROBE_ERRORS: u32 = 5;

/// Tunables shared by every session the manager creates.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub tcp_port: u16,
    pub heartbeat_secs: u64,
    pub probe_heartbeat_secs: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            probe_heartbeat_secs: PROBE_HEARTBEAT_SECS,
        }
    }
}

struct PendingProbe {
    session: Arc<DeviceSession>,
    /// Decremented on every duplicate announcement to shed rebroadcast spam.
    attempts: i32,
}

struct ManagerInner {
    keys: HashMap<String, String>,
    running: HashMap<String, TypedDevice>,
    pending: HashMap<String, PendingProbe>,
    versions: HashMap<String, String>,
    ignored: HashSet<String>,
    probe_errors: HashMap<String, u32>,
}

/// Orchestrates the device fleet. Creates sessions when the scanner reports
/// an announcement, probes unknown devices with a raw-DPS session to infer
/// their kind, replaces sessions when a device moves to a new IP, and drops
/// devices whose key it does not know.
///
/// The manager acts as the parent of its own probe sessions, so their
/// classification records flow back in through [`SessionObserver::got_data`].
pub struct TuyaManager {
    self_ref: Weak<TuyaManager>,
    config: ManagerConfig,
    observers: Vec<Arc<dyn SessionObserver>>,
    store: Box<dyn KeyStore>,
    inner: Mutex<ManagerInner>,
}

impl TuyaManager {
    /// `known` maps device id to its 16-byte local key; `observers` are the
    /// parents attached to every classified session.
    pub fn new(
        known: HashMap<String, String>,
        observers: Vec<Arc<dyn SessionObserver>>,
    ) -> Arc<Self> {
        Self::with_store(known, observers, Box::new(NoopKeyStore), ManagerConfig::default())
    }

    pub fn with_store(
        known: HashMap<String, String>,
        observers: Vec<Arc<dyn SessionObserver>>,
        store: Box<dyn KeyStore>,
        config: ManagerConfig,
    ) -> Arc<Self> {
        let mut keys = store.load_keys();
        keys.extend(known);
        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            observers,
            store,
            inner: Mutex::new(ManagerInner {
                keys,
                running: HashMap::new(),
                pending: HashMap::new(),
                versions: HashMap::new(),
                ignored: HashSet::new(),
                probe_errors: HashMap::new(),
            }),
        })
    }

    /// Handle one announcement. Safe to call with arbitrary decoded
    /// broadcast payloads; anything without `gwId` and `ip` is dropped.
    pub fn notify(&self, announcement: &Value) {
        let Some(id) = announcement.get("gwId").and_then(Value::as_str) else {
            return;
        };
        let Some(ip) = announcement.get("ip").and_then(Value::as_str) else {
            return;
        };
        let version = announcement
            .get("version")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_VERSION);

        let mut inner = self.inner.lock().unwrap();

        if inner.ignored.contains(id) {
            tracing::debug!(device_id = %id, "ignoring announcement");
            return;
        }

        // A known, connected device re-announcing from the same address is
        // a no-op; an address change replaces the session but keeps the
        // already-inferred kind.
        let mut remembered: Option<(DeviceKind, bool)> = None;
        if let Some(device) = inner.running.get(id) {
            let session = device.session();
            if session.ip() == ip && session.is_connected() {
                return;
            }
            tracing::info!(device_id = %id, old_ip = %session.ip(), new_ip = %ip, "replacing session");
            remembered = Some((device.kind(), device.session().profile().inverted));
            device.close();
            inner.running.remove(id);
        }

        if let Some(probe) = inner.pending.get_mut(id) {
            // This one broadcasts like crazy, or the probe is stuck.
            probe.attempts -= 1;
            if probe.attempts == 0 {
                probe.session.close();
                inner.pending.remove(id);
            }
            return;
        }

        let Some(key) = inner.keys.get(id).cloned() else {
            tracing::debug!(device_id = %id, "no key for device");
            return;
        };

        inner.versions.insert(id.to_owned(), version.to_owned());

        if let Some((kind, inverted)) = remembered {
            match self.build_typed(kind, inverted, id, &key, ip, version) {
                Ok(device) => {
                    let session = device.session().clone();
                    inner.running.insert(id.to_owned(), device);
                    session.start();
                }
                Err(e) => {
                    tracing::warn!(device_id = %id, error = %e, "could not recreate session")
                }
            }
        } else {
            // Unknown kind: spawn a fast-heartbeat raw-DPS probe with the
            // manager itself as parent, and classify from its first record.
            let config = SessionConfig::new(id, &key, ip)
                .with_port(self.config.tcp_port)
                .with_version(version)
                .with_heartbeat(self.config.probe_heartbeat_secs)
                .with_raw_dps(true);
            match DeviceSession::new(config, vec![self.self_arc()]) {
                Ok(session) => {
                    inner.pending.insert(
                        id.to_owned(),
                        PendingProbe {
                            session: session.clone(),
                            attempts: 0,
                        },
                    );
                    session.start();
                }
                Err(e) => tracing::warn!(device_id = %id, error = %e, "could not create probe"),
            }
        }
    }

    /// Record a freshly provisioned key and stop ignoring the device.
    pub fn insert_key(&self, device_id: &str, local_key: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.keys.insert(device_id.to_owned(), local_key.to_owned());
        inner.ignored.remove(device_id);
        self.store.persist_keys(&inner.keys);
    }

    /// Best-effort shutdown of every session; does not wait for any of them.
    pub fn close(&self) {
        let mut inner = self.inner.lock().unwrap();
        tracing::debug!(
            running = inner.running.len(),
            pending = inner.pending.len(),
            ignored = inner.ignored.len(),
            "manager closing"
        );
        for probe in inner.pending.values() {
            probe.session.close();
        }
        for device in inner.running.values() {
            device.close();
        }
        inner.pending.clear();
        inner.running.clear();
    }

    // -- Accessors for the surrounding application --

    pub fn device(&self, device_id: &str) -> Option<TypedDevice> {
        self.inner.lock().unwrap().running.get(device_id).cloned()
    }

    pub fn running_ids(&self) -> Vec<String> {
        self.inner.lock().unwrap().running.keys().cloned().collect()
    }

    pub fn is_pending(&self, device_id: &str) -> bool {
        self.inner.lock().unwrap().pending.contains_key(device_id)
    }

    pub fn is_ignored(&self, device_id: &str) -> bool {
        self.inner.lock().unwrap().ignored.contains(device_id)
    }

    // -- Internal --

    fn self_arc(&self) -> Arc<dyn SessionObserver> {
        self.self_ref
            .upgrade()
            .expect("manager methods are only reachable through its Arc")
    }

    fn build_typed(
        &self,
        kind: DeviceKind,
        inverted: bool,
        id: &str,
        key: &str,
        ip: &str,
        version: &str,
    ) -> Result<TypedDevice, crate::protocol::CodecError> {
        let profile = match kind {
            DeviceKind::Switch => DriverProfile::switch(),
            DeviceKind::OpenCloseSwitch => DriverProfile::open_close(inverted),
            DeviceKind::Light => DriverProfile::light(),
        };
        let config = SessionConfig::new(id, key, ip)
            .with_port(self.config.tcp_port)
            .with_version(version)
            .with_heartbeat(self.config.heartbeat_secs)
            .with_profile(profile);
        let session = DeviceSession::new(config, self.observers.clone())?;
        Ok(match kind {
            DeviceKind::Switch => TypedDevice::Switch(Switch::new(session)),
            DeviceKind::OpenCloseSwitch => {
                TypedDevice::OpenCloseSwitch(OpenCloseSwitch::new(session))
            }
            DeviceKind::Light => TypedDevice::Light(Light::new(session)),
        })
    }

    /// Classification: invoked with the first raw-DPS record a probe
    /// session produces.
    fn classify(&self, record: &StatusRecord) {
        let Some(id) = record.get("devId").and_then(Value::as_str).map(str::to_owned) else {
            return;
        };

        let mut inner = self.inner.lock().unwrap();
        let Some(probe) = inner.pending.get(&id) else {
            tracing::debug!(device_id = %id, "record from a device that is not pending");
            return;
        };
        let ip = probe.session.ip().to_owned();

        match classify_record(record) {
            Some(kind) => {
                let version = inner
                    .versions
                    .get(&id)
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_VERSION.to_owned());
                let Some(key) = inner.keys.get(&id).cloned() else {
                    return;
                };
                match self.build_typed(kind, false, &id, &key, &ip, &version) {
                    Ok(device) => {
                        tracing::info!(device_id = %id, ?kind, "device classified");
                        let session = device.session().clone();
                        inner.running.insert(id.clone(), device);
                        session.start();
                    }
                    Err(e) => {
                        tracing::warn!(device_id = %id, error = %e, "could not create typed session")
                    }
                }
            }
            None => {
                tracing::debug!(device_id = %id, ?record, "no classification match");
                inner.ignored.insert(id.clone());
            }
        }

        if let Some(probe) = inner.pending.remove(&id) {
            probe.session.close();
        }
    }

    /// Probe error ladder: nudge the device with a switch-shaped then a
    /// curtain-shaped SET, and give up after five errors.
    fn probe_error(&self, session: &Arc<DeviceSession>) {
        let id = session.device_id().to_owned();
        tracing::debug!(device_id = %id, "probe error");

        let mut inner = self.inner.lock().unwrap();
        let count = inner.probe_errors.entry(id.clone()).or_insert(0);
        if *count == 0 {
            let _ = session.raw_set(&json!({"1": false}));
        } else if *count == 1 {
            let _ = session.raw_set(&json!({"1": "3"}));
        }
        *count += 1;

        if *count >= MAX_PROBE_ERRORS {
            tracing::debug!(device_id = %id, "done trying, ignoring device");
            inner.ignored.insert(id.clone());
            inner.probe_errors.remove(&id);
            if let Some(probe) = inner.pending.remove(&id) {
                probe.session.close();
            }
        }
    }
}

/// Match a raw DPS record against the known device shapes.
fn classify_record(record: &StatusRecord) -> Option<DeviceKind> {
    if record.len() == 2 {
        let first = record.get("1")?;
        if matches!(first.as_str(), Some("1" | "2" | "3")) {
            return Some(DeviceKind::OpenCloseSwitch);
        }
        if first.is_boolean() {
            return Some(DeviceKind::Switch);
        }
    } else if record.len() == 11
        && matches!(
            record.get("2").and_then(Value::as_str),
            Some("white" | "colour" | "scene")
        )
    {
        return Some(DeviceKind::Light);
    }
    None
}

impl SessionObserver for TuyaManager {
    fn register(&self, _session: &Arc<DeviceSession>) {
        // runs when a probe connects; nothing to do until it reports
    }

    fn unregister(&self, session: &Arc<DeviceSession>) {
        self.inner
            .lock()
            .unwrap()
            .pending
            .remove(session.device_id());
    }

    fn got_data(&self, record: &StatusRecord) {
        self.classify(record);
    }

    fn got_error(&self, session: &Arc<DeviceSession>, _last: &StatusRecord) {
        self.probe_error(session);
    }
}

impl AnnouncementSink for TuyaManager {
    fn notify(&self, announcement: &Value) {
        TuyaManager::notify(self, announcement);
    }
}
