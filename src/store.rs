
use std::fs;
use std::path::PathBuf;

/// Dumb string-keyed durable store, one JSON document per key. Write
/// failures are logged and swallowed: persistence degrades to non-durable
/// operation without affecting in-memory state.
#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    /// Store rooted at the platform-local data dir.
    pub fn open_default() -> Self {
        let dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chatterbox-tts");
        Self { dir }
    }

    pub fn open_at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    pub fn set(&self, key: &str, value: &str) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            log::warn!("store: failed to create {}: {}", self.dir.display(), e);
            return;
        }
        if let Err(e) = fs::write(self.path_for(key), value) {
            log::warn!("store: failed to write key {}: {}", key, e);
        }
    }

    pub fn remove(&self, key: &str) {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::warn!("store: failed to remove key {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open_at(dir.path());

        assert_eq!(store.get("missing"), None);

        store.set("greeting", "\"hello\"");
        assert_eq!(store.get("greeting").as_deref(), Some("\"hello\""));

        store.remove("greeting");
        assert_eq!(store.get("greeting"), None);
        // removing again is a no-op
        store.remove("greeting");
    }

    #[test]
    fn unwritable_dir_degrades_silently() {
        let store = KvStore::open_at("/proc/definitely/not/writable");
        store.set("key", "value");
        assert_eq!(store.get("key"), None);
    }
}
