// Durable per-application allow/deny cache
//
// Reads are answered from memory. Every mutation hands a full snapshot of the
// map to a writer thread which rewrites the JSON file; only the latest
// pending snapshot is kept, so the queue never grows past one entry.

use crate::error::NettoError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;

const POLICY_FILE: &str = "settings.json";

/// Where a decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    /// Chosen explicitly by the user
    #[default]
    User,
    /// Applied automatically on first contact
    Default,
}

/// Cached verdict for one application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDecision {
    pub app_id: String,
    pub allowed: bool,
    #[serde(default)]
    pub source: DecisionSource,
}

impl PolicyDecision {
    pub fn is_default(&self) -> bool {
        self.source == DecisionSource::Default
    }
}

/// Default policy file location under the user's data directory
pub fn default_policy_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("No data directory for this platform")?;
    Ok(data_dir.join("netto").join(POLICY_FILE))
}

pub struct PolicyStore {
    path: PathBuf,
    decisions: HashMap<String, PolicyDecision>,
    writer: PolicyWriter,
}

impl PolicyStore {
    /// Load the store from `path`, starting empty if the file is missing or unreadable
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create policy directory: {:?}", parent))?;
        }

        let decisions = match Self::load(&path) {
            Ok(decisions) => decisions,
            Err(e) => {
                log::warn!("Ignoring unreadable policy file {:?}: {:#}", path, e);
                HashMap::new()
            }
        };
        log::info!("Loaded {} policy decision(s) from {:?}", decisions.len(), path);

        let writer = PolicyWriter::spawn(path.clone())?;

        Ok(Self {
            path,
            decisions,
            writer,
        })
    }

    fn load(path: &Path) -> Result<HashMap<String, PolicyDecision>> {
        if !path.exists() {
            log::debug!("Policy file not found, starting empty");
            return Ok(HashMap::new());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file: {:?}", path))?;
        let list: Vec<PolicyDecision> =
            serde_json::from_str(&contents).context("Failed to parse policy file")?;

        Ok(list.into_iter().map(|d| (d.app_id.clone(), d)).collect())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, app_id: &str) -> Option<&PolicyDecision> {
        self.decisions.get(app_id)
    }

    /// Record an explicit user choice
    pub fn set(&mut self, app_id: &str, allowed: bool) {
        self.insert(app_id, allowed, DecisionSource::User);
    }

    /// Record the default policy for a first-seen application
    pub fn apply_default(&mut self, app_id: &str, allowed: bool) {
        self.insert(app_id, allowed, DecisionSource::Default);
    }

    fn insert(&mut self, app_id: &str, allowed: bool, source: DecisionSource) {
        self.decisions.insert(
            app_id.to_string(),
            PolicyDecision {
                app_id: app_id.to_string(),
                allowed,
                source,
            },
        );
        self.writer.submit(self.all());
    }

    /// All decisions, sorted by app id
    pub fn all(&self) -> Vec<PolicyDecision> {
        let mut all: Vec<_> = self.decisions.values().cloned().collect();
        all.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        all
    }

    pub fn len(&self) -> usize {
        self.decisions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }

    /// Block until every mutation made so far has been written (or failed)
    pub fn flush(&self) {
        self.pending_writes().wait();
    }

    /// Handle on the mutations made so far, waitable without borrowing the store
    pub fn pending_writes(&self) -> PendingWrites {
        self.writer.pending_writes()
    }

    /// Most recent write failure, if the last write did not succeed
    pub fn last_persist_error(&self) -> Option<NettoError> {
        self.writer.last_error().map(|message| NettoError::Persistence {
            path: self.path.clone(),
            message,
        })
    }
}

#[derive(Default)]
struct WriterState {
    pending: Option<(u64, Vec<PolicyDecision>)>,
    submitted: u64,
    written: u64,
    last_error: Option<String>,
    shutdown: bool,
}

struct WriterShared {
    state: Mutex<WriterState>,
    changed: Condvar,
}

impl WriterShared {
    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Writes submitted up to some point, see [`PolicyStore::pending_writes`]
pub struct PendingWrites {
    shared: Arc<WriterShared>,
    target: u64,
}

impl PendingWrites {
    /// Block until those writes have finished (or failed)
    pub fn wait(self) {
        let mut state = self.shared.lock();
        while state.written < self.target {
            state = self
                .shared
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }
}

/// Background thread that owns all disk writes of the policy file
struct PolicyWriter {
    shared: Arc<WriterShared>,
    handle: Option<thread::JoinHandle<()>>,
}

impl PolicyWriter {
    fn spawn(path: PathBuf) -> Result<Self> {
        let shared = Arc::new(WriterShared {
            state: Mutex::new(WriterState::default()),
            changed: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("netto-policy-writer".into())
            .spawn(move || Self::run(&path, &thread_shared))
            .context("Failed to spawn policy writer thread")?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    fn submit(&self, snapshot: Vec<PolicyDecision>) {
        let mut state = self.shared.lock();
        state.submitted += 1;
        let generation = state.submitted;
        state.pending = Some((generation, snapshot));
        self.shared.changed.notify_all();
    }

    fn pending_writes(&self) -> PendingWrites {
        PendingWrites {
            shared: Arc::clone(&self.shared),
            target: self.shared.lock().submitted,
        }
    }

    fn last_error(&self) -> Option<String> {
        self.shared.lock().last_error.clone()
    }

    fn run(path: &Path, shared: &WriterShared) {
        loop {
            let (generation, snapshot) = {
                let mut state = shared.lock();
                loop {
                    if let Some(pending) = state.pending.take() {
                        break pending;
                    }
                    if state.shutdown {
                        return;
                    }
                    state = shared
                        .changed
                        .wait(state)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            };

            let result = write_policy_file(path, &snapshot);

            let mut state = shared.lock();
            state.written = generation;
            match result {
                Ok(()) => {
                    log::debug!("Saved {} policy decision(s) to {:?}", snapshot.len(), path);
                    state.last_error = None;
                }
                Err(e) => {
                    // The in-memory decision stays in effect for this session
                    log::error!("Failed to persist policies to {:?}: {:#}", path, e);
                    state.last_error = Some(format!("{:#}", e));
                }
            }
            shared.changed.notify_all();
        }
    }
}

impl Drop for PolicyWriter {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.changed.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("Policy writer thread panicked");
            }
        }
    }
}

/// Rewrite the whole file through a temp file so readers never see a partial write
fn write_policy_file(path: &Path, decisions: &[PolicyDecision]) -> Result<()> {
    let contents =
        serde_json::to_string_pretty(decisions).context("Failed to serialize policies")?;

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, contents).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_in(dir: &tempfile::TempDir) -> PolicyStore {
        PolicyStore::open(dir.path().join(POLICY_FILE)).unwrap()
    }

    #[test]
    fn test_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.is_empty());
        assert!(store.get("com.apple.Safari").is_none());
    }

    #[test]
    fn test_set_is_visible_immediately_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        store.set("com.apple.Safari", false);
        let decision = store.get("com.apple.Safari").unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.source, DecisionSource::User);

        store.flush();
        let on_disk: Vec<PolicyDecision> =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(on_disk, store.all());
        assert!(store.last_persist_error().is_none());
    }

    #[test]
    fn test_one_decision_per_app() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        store.apply_default("org.mozilla.firefox", true);
        store.set("org.mozilla.firefox", false);

        assert_eq!(store.len(), 1);
        let decision = store.get("org.mozilla.firefox").unwrap();
        assert!(!decision.allowed);
        assert!(!decision.is_default());
    }

    #[test]
    fn test_reopen_restores_decisions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = store_in(&dir);
            store.set("a", true);
            store.apply_default("b", true);
            store.set("c", false);
        } // drop drains the writer

        let store = store_in(&dir);
        assert_eq!(store.len(), 3);
        assert!(store.get("b").unwrap().is_default());
        assert!(!store.get("c").unwrap().allowed);
    }

    #[test]
    fn test_reads_file_without_source_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(POLICY_FILE);
        fs::write(&path, r#"[{"appId":"com.example.app","allowed":false}]"#).unwrap();

        let store = PolicyStore::open(&path).unwrap();
        let decision = store.get("com.example.app").unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.source, DecisionSource::User);
    }

    #[test]
    fn test_corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(POLICY_FILE);
        fs::write(&path, "{ not json").unwrap();

        let store = PolicyStore::open(&path).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_failure_keeps_memory_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        // A directory where the file should be makes the rename fail
        fs::create_dir(store.path()).unwrap();
        store.set("com.example.app", true);
        store.flush();

        assert!(store.get("com.example.app").unwrap().allowed);
        assert!(matches!(
            store.last_persist_error(),
            Some(NettoError::Persistence { .. })
        ));
    }

    #[test]
    fn test_pending_writes_wait_after_store_moves_on() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        store.set("com.example.first", true);
        let pending = store.pending_writes();
        store.set("com.example.second", false);
        pending.wait();

        store.flush();
        let reopened = store_in(&dir);
        assert_eq!(reopened.len(), 2);
        assert!(!reopened.get("com.example.second").unwrap().allowed);
    }
}
