use serde_json::{Map, Value, json};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::{mpsc, watch};

use crate::drivers::{DriverError, DriverProfile};
use crate::protocol::{CodecError, FrameBody, MessageCodec, TuyaCipher};
use crate::{DEFAULT_HEARTBEAT_SECS, DEFAULT_TCP_PORT, DEFAULT_VERSION, DISCONNECT_THRESHOLD};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const READ_BUFFER_SIZE: usize = 4096;

/// A decoded status update: attribute names (or numeric DPS keys in raw
/// mode) to values, plus `devId` when the device reported one.
pub type StatusRecord = Map<String, Value>;

/// Capability set through which a session reports its lifecycle and data.
/// A session can have several parents; every one is notified on each event.
pub trait SessionObserver: Send + Sync {
    fn register(&self, _session: &Arc<DeviceSession>) {}
    fn unregister(&self, _session: &Arc<DeviceSession>) {}
    fn got_data(&self, _record: &StatusRecord) {}
    fn got_error(&self, _session: &Arc<DeviceSession>, _last: &StatusRecord) {}
}

#[derive(Debug)]
pub enum SessionError {
    NotConnected,
    Codec(CodecError),
    Driver(DriverError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::NotConnected => write!(f, "No live connection to the device"),
            SessionError::Codec(e) => write!(f, "Codec error: {e}"),
            SessionError::Driver(e) => write!(f, "Driver error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CodecError> for SessionError {
    fn from(e: CodecError) -> Self {
        SessionError::Codec(e)
    }
}

impl From<DriverError> for SessionError {
    fn from(e: DriverError) -> Self {
        SessionError::Driver(e)
    }
}

/// Construction parameters for a [`DeviceSession`].
pub struct SessionConfig {
    pub device_id: String,
    pub local_key: String,
    pub ip: String,
    pub port: u16,
    pub version: String,
    pub heartbeat_secs: u64,
    pub raw_dps: bool,
    pub profile: DriverProfile,
}

impl SessionConfig {
    pub fn new(device_id: &str, local_key: &str, ip: &str) -> Self {
        Self {
            device_id: device_id.to_owned(),
            local_key: local_key.to_owned(),
            ip: ip.to_owned(),
            port: DEFAULT_TCP_PORT,
            version: DEFAULT_VERSION.to_owned(),
            heartbeat_secs: DEFAULT_HEARTBEAT_SECS,
            raw_dps: false,
            profile: DriverProfile::probe(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_owned();
        self
    }

    pub fn with_heartbeat(mut self, secs: u64) -> Self {
        self.heartbeat_secs = secs;
        self
    }

    pub fn with_raw_dps(mut self, raw: bool) -> Self {
        self.raw_dps = raw;
        self
    }

    pub fn with_profile(mut self, profile: DriverProfile) -> Self {
        self.profile = profile;
        self
    }
}

/// One TCP control channel to one device.
///
/// `start` connects in the background; once up, the session keeps a
/// heartbeat query running and decodes every inbound frame into a
/// [`StatusRecord`] for its parents. Three unanswered heartbeats in a row
/// and the session tears itself down.
pub struct DeviceSession {
    self_ref: Weak<DeviceSession>,
    device_id: String,
    ip: String,
    port: u16,
    version: String,
    heartbeat_secs: u64,
    raw_dps: bool,
    profile: DriverProfile,
    codec: MessageCodec,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    missed: AtomicU32,
    parents: Mutex<Vec<Arc<dyn SessionObserver>>>,
    last_status: Mutex<StatusRecord>,
    closed: watch::Sender<bool>,
    started: AtomicBool,
    unregistered: AtomicBool,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("ip", &self.ip)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    pub fn new(
        config: SessionConfig,
        parents: Vec<Arc<dyn SessionObserver>>,
    ) -> Result<Arc<Self>, CodecError> {
        let cipher = TuyaCipher::new(&config.local_key, &config.version)?;
        Ok(Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            device_id: config.device_id,
            ip: config.ip,
            port: config.port,
            version: config.version,
            heartbeat_secs: config.heartbeat_secs,
            raw_dps: config.raw_dps,
            profile: config.profile,
            codec: MessageCodec::new(cipher),
            outbound: Mutex::new(None),
            missed: AtomicU32::new(DISCONNECT_THRESHOLD),
            parents: Mutex::new(parents),
            last_status: Mutex::new(StatusRecord::new()),
            closed: watch::Sender::new(false),
            started: AtomicBool::new(false),
            unregistered: AtomicBool::new(false),
        }))
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn profile(&self) -> &DriverProfile {
        &self.profile
    }

    pub fn raw_dps(&self) -> bool {
        self.raw_dps
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().unwrap().is_some()
    }

    /// Snapshot of the last reported value for one attribute.
    pub fn status_value(&self, name: &str) -> Option<Value> {
        self.last_status.lock().unwrap().get(name).cloned()
    }

    /// Snapshot of everything the device has reported so far.
    pub fn last_status(&self) -> StatusRecord {
        self.last_status.lock().unwrap().clone()
    }

    pub fn add_parent(&self, parent: Arc<dyn SessionObserver>) {
        self.parents.lock().unwrap().push(parent);
    }

    /// Connect in the background and run the session until it is closed or
    /// the heartbeat budget runs out.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.self_arc();
        tokio::spawn(async move { session.run().await });
    }

    /// Ask the session to shut down. Idempotent, non-blocking; parents are
    /// unregistered by the connection task as it winds down.
    pub fn close(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        tracing::debug!(device_id = %self.device_id, "session closing");
        *self.outbound.lock().unwrap() = None;
    }

    /// Send one GET frame asking for the full datapoint state.
    pub fn query(&self) -> Result<(), SessionError> {
        let mut payload = Map::new();
        payload.insert("devId".to_owned(), json!(self.device_id));
        payload.insert("gwId".to_owned(), json!(self.device_id));
        let frame = self.codec.encode_get(&Value::Object(payload))?;
        self.send(frame)
    }

    /// Translate named attributes through the driver table and send one
    /// encrypted SET frame.
    pub fn set(&self, attrs: &[(&str, Value)]) -> Result<(), SessionError> {
        let mut dps = Map::new();
        for (name, value) in attrs {
            let index = self
                .profile
                .dps_index(name)
                .ok_or_else(|| DriverError::UnknownAttribute((*name).to_owned()))?;
            dps.insert((index + 1).to_string(), self.profile.coerce(name, value)?);
        }
        self.raw_set(&Value::Object(dps))
    }

    /// Send a SET frame with a caller-supplied DPS object.
    pub fn raw_set(&self, dps: &Value) -> Result<(), SessionError> {
        let mut payload = Map::new();
        payload.insert("devId".to_owned(), json!(self.device_id));
        payload.insert("uid".to_owned(), json!(""));
        payload.insert("t".to_owned(), json!(epoch_secs()));
        payload.insert("dps".to_owned(), dps.clone());
        let frame = self.codec.encode_set(&Value::Object(payload))?;
        self.send(frame)
    }

    fn send(&self, frame: Vec<u8>) -> Result<(), SessionError> {
        match self.outbound.lock().unwrap().as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| SessionError::NotConnected),
            None => Err(SessionError::NotConnected),
        }
    }

    // -- Connection task --

    async fn run(self: Arc<Self>) {
        let addr = format!("{}:{}", self.ip, self.port);
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                tracing::debug!(device_id = %self.device_id, addr = %addr, error = %e, "connect failed");
                return;
            }
            Err(_) => {
                tracing::debug!(device_id = %self.device_id, addr = %addr, "connect timed out");
                return;
            }
        };
        if *self.closed.borrow() {
            return;
        }
        tracing::info!(device_id = %self.device_id, addr = %addr, "connected to device");

        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        *self.outbound.lock().unwrap() = Some(tx);
        self.missed.store(DISCONNECT_THRESHOLD, Ordering::SeqCst);

        // Writer drains the outbound queue; it ends when `close` drops the
        // sender or the peer goes away.
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
                let _ = write_half.flush().await;
            }
        });

        for parent in self.parents_snapshot() {
            parent.register(&self);
        }

        if let Some(dps) = self.profile.initial_dps() {
            let _ = self.raw_set(&dps);
        }

        let heartbeater = Arc::clone(&self);
        tokio::spawn(async move { heartbeater.heartbeat().await });

        self.read_loop(&mut read_half).await;
        self.teardown();
    }

    async fn heartbeat(self: Arc<Self>) {
        tracing::debug!(device_id = %self.device_id, interval = self.heartbeat_secs, "heartbeat started");
        let mut closed_rx = self.closed.subscribe();
        loop {
            if *closed_rx.borrow_and_update() {
                return;
            }
            if self.missed.load(Ordering::SeqCst) == 0 {
                tracing::info!(device_id = %self.device_id, "heartbeat budget exhausted, closing");
                self.close();
                return;
            }
            self.missed.fetch_sub(1, Ordering::SeqCst);
            let _ = self.query();
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(self.heartbeat_secs)) => {}
                _ = closed_rx.changed() => return,
            }
        }
    }

    async fn read_loop(&self, read_half: &mut OwnedReadHalf) {
        let mut closed_rx = self.closed.subscribe();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            if *closed_rx.borrow_and_update() {
                return;
            }
            tokio::select! {
                _ = closed_rx.changed() => return,
                read = read_half.read(&mut buf) => match read {
                    Ok(0) => {
                        tracing::debug!(device_id = %self.device_id, "connection closed by device");
                        return;
                    }
                    Ok(n) => self.handle_inbound(&buf[..n]),
                    Err(e) => {
                        tracing::debug!(device_id = %self.device_id, error = %e, "read failed");
                        return;
                    }
                }
            }
        }
    }

    fn handle_inbound(&self, data: &[u8]) {
        // Anything from the device refills the heartbeat budget.
        self.missed.store(DISCONNECT_THRESHOLD, Ordering::SeqCst);

        let this = self.self_arc();
        let mut last_record = StatusRecord::new();
        for (code, body) in self.codec.parse(data) {
            match body {
                FrameBody::Json(value) => {
                    if code != 0 {
                        tracing::debug!(device_id = %self.device_id, code, "device reported an error");
                        for parent in self.parents_snapshot() {
                            parent.got_error(&this, &last_record);
                        }
                        continue;
                    }
                    let record = self.decode_record(&value);
                    {
                        let mut status = self.last_status.lock().unwrap();
                        for (name, attr_value) in &record {
                            status.insert(name.clone(), attr_value.clone());
                        }
                    }
                    tracing::debug!(device_id = %self.device_id, ?record, "data received");
                    for parent in self.parents_snapshot() {
                        parent.got_data(&record);
                    }
                    last_record = record;
                }
                FrameBody::Empty => {
                    if code != 0 {
                        tracing::debug!(device_id = %self.device_id, code, "error frame with empty payload");
                        for parent in self.parents_snapshot() {
                            parent.got_error(&this, &StatusRecord::new());
                        }
                    }
                }
                FrameBody::Undecodable(e) => {
                    tracing::debug!(device_id = %self.device_id, code, error = %e, "undecodable frame");
                    if code != 0 {
                        for parent in self.parents_snapshot() {
                            parent.got_error(&this, &last_record);
                        }
                    }
                }
            }
        }
    }

    /// Map a decoded frame into an attribute record. DPS slot N resolves to
    /// the driver table entry N-1; unmapped slots surface under their
    /// numeric key only in raw mode (classification probing).
    fn decode_record(&self, value: &Value) -> StatusRecord {
        let mut record = StatusRecord::new();
        if let Some(dev_id) = value.get("devId") {
            record.insert("devId".to_owned(), dev_id.clone());
        }
        if let Some(Value::Object(dps)) = value.get("dps") {
            for (key, dp_value) in dps {
                let mapped = key
                    .parse::<usize>()
                    .ok()
                    .and_then(|slot| slot.checked_sub(1))
                    .and_then(|index| self.profile.attr_name(index));
                match mapped {
                    Some(name) => {
                        record.insert(name.to_owned(), dp_value.clone());
                    }
                    None if self.raw_dps => {
                        record.insert(key.clone(), dp_value.clone());
                    }
                    None => {}
                }
            }
        }
        self.profile.normalize(&mut record);
        record
    }

    fn teardown(&self) {
        self.close();
        *self.outbound.lock().unwrap() = None;
        if !self.unregistered.swap(true, Ordering::SeqCst) {
            let this = self.self_arc();
            for parent in self.parents_snapshot() {
                parent.unregister(&this);
            }
        }
        tracing::debug!(device_id = %self.device_id, "session ended");
    }

    fn parents_snapshot(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.parents.lock().unwrap().clone()
    }

    fn self_arc(&self) -> Arc<DeviceSession> {
        self.self_ref
            .upgrade()
            .expect("session methods are only reachable through its Arc")
    }
}

fn epoch_secs() -> String {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::DriverProfile;
    use std::sync::Mutex as StdMutex;

    fn session(profile: DriverProfile, raw: bool) -> Arc<DeviceSession> {
        let config = SessionConfig::new("abcdef0123456789abcd", "0123456789abcdef", "127.0.0.1")
            .with_profile(profile)
            .with_raw_dps(raw);
        DeviceSession::new(config, Vec::new()).unwrap()
    }

    #[test]
    fn rejects_bad_key_length() {
        let config = SessionConfig::new("abc", "short", "127.0.0.1");
        assert!(DeviceSession::new(config, Vec::new()).is_err());
    }

    #[test]
    fn decode_maps_dps_through_the_driver_table() {
        let s = session(DriverProfile::switch(), false);
        let record = s.decode_record(&json!({"devId": "abc", "dps": {"1": true}}));
        assert_eq!(record["devId"], json!("abc"));
        assert_eq!(record["power"], json!("on"));
    }

    #[test]
    fn unmapped_dps_drop_unless_raw_mode() {
        let mapped = session(DriverProfile::switch(), false);
        let record = mapped.decode_record(&json!({"dps": {"9": 42}}));
        assert!(record.get("9").is_none());

        let raw = session(DriverProfile::probe(), true);
        let record = raw.decode_record(&json!({"dps": {"9": 42}}));
        assert_eq!(record["9"], json!(42));
    }

    #[test]
    fn zero_and_garbage_dps_keys_are_tolerated() {
        let s = session(DriverProfile::switch(), false);
        let record = s.decode_record(&json!({"dps": {"0": 1, "x": 2}}));
        assert!(record.is_empty());
    }

    #[test]
    fn set_requires_a_known_attribute() {
        let s = session(DriverProfile::switch(), false);
        match s.set(&[("sparkle", json!(true))]) {
            Err(SessionError::Driver(DriverError::UnknownAttribute(name))) => {
                assert_eq!(name, "sparkle")
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn sends_fail_without_a_transport() {
        let s = session(DriverProfile::switch(), false);
        assert!(matches!(s.query(), Err(SessionError::NotConnected)));
        assert!(matches!(
            s.set(&[("power", json!(true))]),
            Err(SessionError::NotConnected)
        ));
    }

    #[test]
    fn inbound_frames_update_last_status() {
        let s = session(DriverProfile::switch(), false);
        let frame = s
            .codec
            .encode_get(&json!({"devId": "abc", "dps": {"1": true}}))
            .unwrap();
        s.handle_inbound(&frame);
        assert_eq!(s.status_value("power"), Some(json!("on")));
    }

    struct Recorder {
        records: StdMutex<Vec<StatusRecord>>,
        errors: StdMutex<usize>,
    }

    impl SessionObserver for Recorder {
        fn got_data(&self, record: &StatusRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
        fn got_error(&self, _session: &Arc<DeviceSession>, _last: &StatusRecord) {
            *self.errors.lock().unwrap() += 1;
        }
    }

    #[test]
    fn parents_receive_data_and_errors() {
        let recorder = Arc::new(Recorder {
            records: StdMutex::new(Vec::new()),
            errors: StdMutex::new(0),
        });
        let s = session(DriverProfile::switch(), false);
        s.add_parent(recorder.clone());

        let good = s.codec.encode_get(&json!({"dps": {"1": false}})).unwrap();
        s.handle_inbound(&good);

        // device-style error frame: empty payload, non-zero return code
        let mut bad = s.codec.encode_raw(crate::protocol::Command::Get, b"");
        bad[crate::protocol::HEADER_SIZE + 3] = 0x01;
        s.handle_inbound(&bad);

        let records = recorder.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["power"], json!("off"));
        assert_eq!(*recorder.errors.lock().unwrap(), 1);
    }
}
