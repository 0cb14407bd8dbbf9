
use crate::store::KvStore;

pub const TRACKED_JOBS_KEY: &str = "chatterbox-long-text-jobs";

/// Durable set of job ids the client believes may still be running.
/// Ids are added on submit and removed on terminal events; the set is what
/// makes monitoring resumable across restarts.
#[derive(Debug, Clone)]
pub struct TrackedJobs {
    store: KvStore,
}

impl TrackedJobs {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    pub fn load(&self) -> Vec<String> {
        self.store
            .get(TRACKED_JOBS_KEY)
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    pub fn contains(&self, job_id: &str) -> bool {
        self.load().iter().any(|id| id == job_id)
    }

    pub fn add(&self, job_id: &str) {
        let mut ids = self.load();
        if ids.iter().any(|id| id == job_id) {
            return;
        }
        ids.push(job_id.to_owned());
        self.save(&ids);
    }

    pub fn remove(&self, job_id: &str) {
        let mut ids = self.load();
        let before = ids.len();
        ids.retain(|id| id != job_id);
        if ids.len() != before {
            self.save(&ids);
        }
    }

    fn save(&self, ids: &[String]) {
        match serde_json::to_string(ids) {
            Ok(raw) => self.store.set(TRACKED_JOBS_KEY, &raw),
            Err(e) => log::warn!("tracker: failed to encode job ids: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_in_temp_dir() -> (tempfile::TempDir, TrackedJobs) {
        let dir = tempfile::tempdir().unwrap();
        let tracker = TrackedJobs::new(KvStore::open_at(dir.path()));
        (dir, tracker)
    }

    #[test]
    fn add_then_remove_updates_membership() {
        let (_dir, tracker) = tracker_in_temp_dir();
        assert!(tracker.load().is_empty());

        tracker.add("job-1");
        tracker.add("job-2");
        assert!(tracker.contains("job-1"));
        assert_eq!(tracker.load(), vec!["job-1".to_owned(), "job-2".to_owned()]);

        tracker.remove("job-1");
        assert!(!tracker.contains("job-1"));
        assert!(tracker.contains("job-2"));
    }

    #[test]
    fn add_is_idempotent() {
        let (_dir, tracker) = tracker_in_temp_dir();
        tracker.add("job-1");
        tracker.add("job-1");
        assert_eq!(tracker.load().len(), 1);
    }

    #[test]
    fn remove_of_unknown_id_is_a_no_op() {
        let (_dir, tracker) = tracker_in_temp_dir();
        tracker.add("job-1");
        tracker.remove("job-9");
        assert_eq!(tracker.load().len(), 1);
    }

    #[test]
    fn malformed_stored_value_loads_as_empty() {
        let (dir, tracker) = tracker_in_temp_dir();
        KvStore::open_at(dir.path()).set(TRACKED_JOBS_KEY, "{broken");
        assert!(tracker.load().is_empty());
    }

    #[test]
    fn survives_reopen_from_same_dir() {
        let dir = tempfile::tempdir().unwrap();
        TrackedJobs::new(KvStore::open_at(dir.path())).add("job-7");

        let reopened = TrackedJobs::new(KvStore::open_at(dir.path()));
        assert!(reopened.contains("job-7"));
    }
}
