//! LAN-side control of Tuya-compatible Wi-Fi devices.
//!
//! Devices announce themselves with periodic UDP broadcasts on port 6666 and
//! accept a framed, AES-ECB-encrypted command protocol over TCP port 6668.
//! This crate listens for those announcements, authenticates each device with
//! its previously harvested local key, infers the device kind by probing its
//! published datapoints, and keeps a heartbeated command channel open per
//! device with typed operations on top: switch on/off, curtain open/close,
//! and light colour/white control including timed fades.
//!
//! The usual entry point is a [`manager::TuyaManager`] fed by a
//! [`scanner::DeviceScanner`]; classified devices surface through the
//! [`session::SessionObserver`] handed to the manager.

pub mod drivers;
pub mod keystore;
pub mod light;
pub mod manager;
pub mod protocol;
pub mod scanner;
pub mod session;

pub use drivers::{DeviceKind, DriverError, OpenCloseSwitch, Switch, TypedDevice};
pub use keystore::{KeyStore, NoopKeyStore, TomlKeyStore};
pub use light::Light;
pub use manager::{ManagerConfig, TuyaManager};
pub use protocol::{CodecError, Command, FrameBody, MessageCodec, TuyaCipher};
pub use scanner::{AnnouncementSink, DeviceScanner};
pub use session::{DeviceSession, SessionConfig, SessionError, SessionObserver, StatusRecord};

/// TCP control port the devices listen on.
pub const DEFAULT_TCP_PORT: u16 = 6668;
/// UDP port the devices broadcast announcements to.
pub const DEFAULT_SCANNER_PORT: u16 = 6666;
/// Protocol version assumed when an announcement does not carry one.
pub const DEFAULT_VERSION: &str = "3.1";
/// Seconds between heartbeat queries on a classified session.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 10;
/// Seconds between heartbeat queries while probing an unclassified device.
pub const PROBE_HEARTBEAT_SECS: u64 = 2;
/// Unanswered heartbeats tolerated before a session closes itself.
pub const DISCONNECT_THRESHOLD: u32 = 3;
