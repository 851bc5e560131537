use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Persistence hook for the `device_id -> local_key` mapping. The manager
/// calls `load_keys` once at construction and `persist_keys` after every
/// key change; neither is allowed to fail the core, so implementations log
/// and swallow their own errors.
pub trait KeyStore: Send + Sync {
    fn load_keys(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    fn persist_keys(&self, _keys: &HashMap<String, String>) {}
}

/// Default store: keeps nothing.
pub struct NoopKeyStore;

impl KeyStore for NoopKeyStore {}

#[derive(Serialize, Deserialize, Default)]
struct KeyFile {
    #[serde(default)]
    devices: HashMap<String, String>,
}

/// File-backed store in TOML, one `devices` table of id = key pairs.
pub struct TomlKeyStore {
    path: PathBuf,
}

impl TomlKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl KeyStore for TomlKeyStore {
    fn load_keys(&self) -> HashMap<String, String> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) => {
                tracing::debug!(path = %self.path.display(), error = %e, "no key file loaded");
                return HashMap::new();
            }
        };
        match toml::from_str::<KeyFile>(&contents) {
            Ok(file) => file.devices,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "failed to parse key file");
                HashMap::new()
            }
        }
    }

    fn persist_keys(&self, keys: &HashMap<String, String>) {
        let file = KeyFile {
            devices: keys.clone(),
        };
        let serialized = match toml::to_string(&file) {
            Ok(serialized) => serialized,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize key file");
                return;
            }
        };
        if let Err(e) = std::fs::write(&self.path, serialized) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write key file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("tuyalan-{}-{name}.toml", std::process::id()))
    }

    #[test]
    fn noop_store_loads_nothing() {
        let store = NoopKeyStore;
        assert!(store.load_keys().is_empty());
        store.persist_keys(&HashMap::new());
    }

    #[test]
    fn toml_store_roundtrips() {
        let path = scratch_path("roundtrip");
        let store = TomlKeyStore::new(&path);

        let mut keys = HashMap::new();
        keys.insert("abcdef0123456789abcd".to_owned(), "0123456789abcdef".to_owned());
        store.persist_keys(&keys);

        assert_eq!(store.load_keys(), keys);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn missing_file_yields_empty_map() {
        let store = TomlKeyStore::new(scratch_path("missing"));
        assert!(store.load_keys().is_empty());
    }

    #[test]
    fn malformed_file_yields_empty_map() {
        let path = scratch_path("malformed");
        std::fs::write(&path, "not valid [ toml").unwrap();
        let store = TomlKeyStore::new(&path);
        assert!(store.load_keys().is_empty());
        let _ = std::fs::remove_file(&path);
    }
}
