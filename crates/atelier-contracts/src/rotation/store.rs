use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use super::state::RotationState;
use crate::config::RotationConfig;
use crate::error::{ErrorKind, StoreError};

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// File-backed rotation records, one JSON file per persona.
///
/// Read-modify-write sequences go through [`RotationStore::lock`] (or the
/// [`RotationStore::update`] shorthand), which serializes writers for one
/// persona twice over: an in-process gate shared by every thread using this
/// store, and a `<record>.lock` file created with `create_new` for writers in
/// other processes. Both waits are bounded by the configured lock timeout.
/// Records are replaced by renaming a fully written temp file, so plain
/// [`RotationStore::load`] never observes a partial write.
#[derive(Debug)]
pub struct RotationStore {
    dir: PathBuf,
    lock_timeout: Duration,
    stale_lock_after: Duration,
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl RotationStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let defaults = RotationConfig::default();
        Self {
            dir: dir.into(),
            lock_timeout: defaults.lock_timeout(),
            stale_lock_after: defaults.stale_lock_after(),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &RotationConfig) -> Self {
        Self::new(&config.state_dir)
            .with_lock_timeout(config.lock_timeout())
            .with_stale_lock_after(config.stale_lock_after())
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_stale_lock_after(mut self, age: Duration) -> Self {
        self.stale_lock_after = age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, persona_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", record_stem(persona_id)))
    }

    /// Current record for `persona_id`, or the default when none exists yet.
    pub fn load(&self, persona_id: &str) -> RotationState {
        read_state_checked(&self.path_for(persona_id), persona_id).0
    }

    pub fn lock(&self, persona_id: &str) -> Result<RotationLease<'_>, StoreError> {
        let deadline = Instant::now() + self.lock_timeout;
        let timeout = || StoreError::LockTimeout {
            persona_id: persona_id.to_string(),
            waited: self.lock_timeout,
        };

        let gate = self.gate_for(persona_id);
        let gate = acquire_gate(&gate, deadline).ok_or_else(timeout)?;

        fs::create_dir_all(&self.dir).map_err(|err| StoreError::io(&self.dir, err))?;
        let record_path = self.path_for(persona_id);
        let lock_path = record_path.with_extension("lock");
        let lock_file = LockFile::acquire(&lock_path, deadline, self.stale_lock_after)
            .map_err(|err| StoreError::io(&lock_path, err))?
            .ok_or_else(timeout)?;

        let (state, readable) = read_state_checked(&record_path, persona_id);
        if !readable {
            quarantine_record(&record_path);
        }
        Ok(RotationLease {
            store: self,
            persona_id: persona_id.to_string(),
            state,
            _lock_file: lock_file,
            _gate: gate,
        })
    }

    pub fn commit(&self, persona_id: &str, state: RotationState) -> Result<(), StoreError> {
        let mut lease = self.lock(persona_id)?;
        *lease.state_mut() = state;
        lease.commit().map(|_| ())
    }

    /// Locks, hands the current record to `apply`, and commits the result.
    pub fn update<T>(
        &self,
        persona_id: &str,
        apply: impl FnOnce(&mut RotationState) -> T,
    ) -> Result<T, StoreError> {
        let mut lease = self.lock(persona_id)?;
        let result = apply(lease.state_mut());
        lease.commit()?;
        Ok(result)
    }

    /// Administrative reset back to the default record.
    pub fn reset(&self, persona_id: &str) -> Result<RotationState, StoreError> {
        let mut lease = self.lock(persona_id)?;
        *lease.state_mut() = RotationState::default();
        lease.commit()
    }

    fn write_state(&self, persona_id: &str, state: &RotationState) -> Result<(), StoreError> {
        let path = self.path_for(persona_id);
        let encoded = serde_json::to_vec_pretty(state)?;
        fs::create_dir_all(&self.dir).map_err(|err| StoreError::io(&self.dir, err))?;
        let mut temp = NamedTempFile::new_in(&self.dir).map_err(|err| StoreError::io(&self.dir, err))?;
        temp.write_all(&encoded)
            .and_then(|_| temp.as_file().sync_all())
            .map_err(|err| StoreError::io(temp.path(), err))?;
        temp.persist(&path)
            .map_err(|err| StoreError::io(&path, err.error))?;
        Ok(())
    }

    fn gate_for(&self, persona_id: &str) -> Arc<Gate> {
        let mut gates = lock_ignoring_poison(&self.gates);
        Arc::clone(gates.entry(persona_id.to_string()).or_default())
    }
}

/// Exclusive hold on one persona's record. Dropping the lease without
/// committing discards the changes and releases the lock.
#[derive(Debug)]
pub struct RotationLease<'a> {
    store: &'a RotationStore,
    persona_id: String,
    state: RotationState,
    _lock_file: LockFile,
    _gate: GateGuard,
}

impl RotationLease<'_> {
    pub fn persona_id(&self) -> &str {
        &self.persona_id
    }

    pub fn state(&self) -> &RotationState {
        &self.state
    }

    pub fn state_mut(&mut self) -> &mut RotationState {
        &mut self.state
    }

    pub fn commit(self) -> Result<RotationState, StoreError> {
        self.store.write_state(&self.persona_id, &self.state)?;
        Ok(self.state)
    }
}

#[derive(Debug, Default)]
struct Gate {
    held: Mutex<bool>,
    released: Condvar,
}

#[derive(Debug)]
struct GateGuard {
    gate: Arc<Gate>,
}

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut held = lock_ignoring_poison(&self.gate.held);
        *held = false;
        self.gate.released.notify_one();
    }
}

fn acquire_gate(gate: &Arc<Gate>, deadline: Instant) -> Option<GateGuard> {
    let mut held = lock_ignoring_poison(&gate.held);
    while *held {
        let now = Instant::now();
        if now >= deadline {
            return None;
        }
        let (next, _) = gate
            .released
            .wait_timeout(held, deadline - now)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        held = next;
    }
    *held = true;
    Some(GateGuard {
        gate: Arc::clone(gate),
    })
}

#[derive(Debug)]
struct LockFile {
    path: PathBuf,
    token: String,
}

impl LockFile {
    fn acquire(
        path: &Path,
        deadline: Instant,
        stale_after: Duration,
    ) -> std::io::Result<Option<Self>> {
        let token = unique_token();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{token}");
                    return Ok(Some(Self {
                        path: path.to_path_buf(),
                        token,
                    }));
                }
                Err(err) if err.kind() == IoErrorKind::AlreadyExists => {
                    if break_stale_lock(path, stale_after) {
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Ok(None);
                    }
                    thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Drop for LockFile {
    /// Only removes the lock file while it still carries this holder's token.
    fn drop(&mut self) {
        let still_ours = fs::read_to_string(&self.path)
            .map(|raw| raw.trim() == self.token)
            .unwrap_or(false);
        if still_ours {
            let _ = fs::remove_file(&self.path);
        }
    }
}

/// Claims a stale lock by renaming it aside and re-checks the age of the
/// claimed file. A claimed lock that is fresh is linked back into place.
fn break_stale_lock(path: &Path, stale_after: Duration) -> bool {
    if !lock_file_is_stale(path, stale_after) {
        return false;
    }
    let claimed = path.with_extension(format!("lock.stale-{}", unique_token()));
    if fs::rename(path, &claimed).is_err() {
        return false;
    }
    if lock_file_is_stale(&claimed, stale_after) {
        log::warn!("breaking stale rotation lock {}", path.display());
        let _ = fs::remove_file(&claimed);
        return true;
    }
    if fs::hard_link(&claimed, path).is_err() {
        log::warn!(
            "rotation lock {} was replaced while being checked",
            path.display()
        );
    }
    let _ = fs::remove_file(&claimed);
    false
}

fn unique_token() -> String {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    format!("{}-{nanos}", std::process::id())
}

fn lock_file_is_stale(path: &Path, stale_after: Duration) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .map(|age| age > stale_after)
        .unwrap_or(false)
}

/// The record (or the default) and whether the file on disk was usable. A
/// missing record counts as usable.
fn read_state_checked(path: &Path, persona_id: &str) -> (RotationState, bool) {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == IoErrorKind::NotFound => return (RotationState::default(), true),
        Err(err) => {
            log::warn!(
                "{}: rotation state for '{persona_id}' unreadable ({}): {err}; starting from defaults",
                ErrorKind::StateStoreCorrupt,
                path.display()
            );
            return (RotationState::default(), false);
        }
    };
    match serde_json::from_str::<RotationState>(&raw) {
        Ok(state) => (state, true),
        Err(err) => {
            log::warn!(
                "{}: rotation state for '{persona_id}' is corrupt ({}): {err}; starting from defaults",
                ErrorKind::StateStoreCorrupt,
                path.display()
            );
            (RotationState::default(), false)
        }
    }
}

/// Moves an unusable record out of the way so the next commit can write a
/// fresh one. Must be called with the persona lock held.
fn quarantine_record(path: &Path) {
    let aside = path.with_extension(format!("corrupt-{}", unique_token()));
    match fs::rename(path, &aside) {
        Ok(()) => log::warn!(
            "{}: moved unusable rotation record to {}",
            ErrorKind::StateStoreCorrupt,
            aside.display()
        ),
        Err(err) => log::warn!(
            "{}: could not move unusable rotation record {}: {err}",
            ErrorKind::StateStoreCorrupt,
            path.display()
        ),
    }
}

/// File stem that is safe on any filesystem and unique per persona id.
fn record_stem(persona_id: &str) -> String {
    let mut readable: String = persona_id
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(48)
        .collect();
    if readable.is_empty() {
        readable.push_str("persona");
    }
    let digest = Sha256::digest(persona_id.as_bytes());
    format!("{readable}-{}", &hex::encode(digest)[..8])
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn load_defaults_when_record_missing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path());
        assert_eq!(store.load("ava"), RotationState::default());
        Ok(())
    }

    #[test]
    fn update_persists_and_reloads() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path());
        store.update("ava", |state| state.last_pose_index = 4)?;

        let reopened = RotationStore::new(temp.path());
        assert_eq!(reopened.load("ava").last_pose_index, 4);
        assert_eq!(reopened.load("bea").last_pose_index, 0);
        Ok(())
    }

    #[test]
    fn commit_leaves_only_the_record_behind() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path());
        store.commit("ava", RotationState::default())?;
        store.commit("ava", RotationState::default())?;

        let names: Vec<String> = fs::read_dir(temp.path())?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("ava-"));
        assert!(names[0].ends_with(".json"));
        Ok(())
    }

    #[test]
    fn corrupt_record_resets_to_default() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path());
        fs::write(store.path_for("ava"), b"{ not json")?;

        assert_eq!(store.load("ava"), RotationState::default());
        store.update("ava", |state| state.last_expression_index = 2)?;
        assert_eq!(store.load("ava").last_expression_index, 2);
        Ok(())
    }

    #[test]
    fn concurrent_updates_do_not_lose_increments() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = Arc::new(RotationStore::new(temp.path()));
        let catalog_len = 7;
        let threads = 24;

        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    store.update("ava", |state| {
                        state.last_pose_index = (state.last_pose_index + 1) % catalog_len;
                    })
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }

        assert_eq!(store.load("ava").last_pose_index, threads % catalog_len);
        Ok(())
    }

    #[test]
    fn separate_store_instances_serialize_through_lock_file() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let dir = temp.path().to_path_buf();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let dir = dir.clone();
                thread::spawn(move || {
                    let store = RotationStore::new(dir);
                    store.update("ava", |state| state.last_accessory_index += 1)
                })
            })
            .collect();
        for handle in handles {
            handle
                .join()
                .map_err(|_| anyhow::anyhow!("worker panicked"))??;
        }
        assert_eq!(RotationStore::new(&dir).load("ava").last_accessory_index, 8);
        Ok(())
    }

    #[test]
    fn lock_wait_is_bounded() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path()).with_lock_timeout(Duration::from_millis(50));
        let _held = store.lock("ava")?;

        let err = store.lock("ava").err().map(|err| err.is_retryable());
        assert_eq!(err, Some(true));

        let other = RotationStore::new(temp.path()).with_lock_timeout(Duration::from_millis(50));
        assert!(matches!(
            other.lock("ava"),
            Err(StoreError::LockTimeout { .. })
        ));
        assert!(store.lock("bea").is_ok());
        Ok(())
    }

    #[test]
    fn dropped_lease_releases_lock_without_writing() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path()).with_lock_timeout(Duration::from_millis(50));
        {
            let mut lease = store.lock("ava")?;
            lease.state_mut().last_pose_index = 9;
        }
        assert_eq!(store.load("ava").last_pose_index, 0);
        assert!(store.lock("ava").is_ok());
        Ok(())
    }

    #[test]
    fn stale_lock_file_is_broken() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path())
            .with_lock_timeout(Duration::from_millis(200))
            .with_stale_lock_after(Duration::ZERO);
        fs::write(store.path_for("ava").with_extension("lock"), b"12345\n")?;
        thread::sleep(Duration::from_millis(20));
        assert!(store.lock("ava").is_ok());
        Ok(())
    }

    #[test]
    fn unreadable_record_is_moved_aside_and_rewritten() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path());
        fs::create_dir_all(store.path_for("ava"))?;

        assert_eq!(store.load("ava"), RotationState::default());
        store.update("ava", |state| state.last_pose_index = 5)?;
        assert!(store.path_for("ava").is_file());
        assert_eq!(store.load("ava").last_pose_index, 5);

        let set_aside = fs::read_dir(temp.path())?
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().contains(".corrupt-"))
            .count();
        assert_eq!(set_aside, 1);
        Ok(())
    }

    #[test]
    fn fresh_lock_is_not_broken() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let lock_path = temp.path().join("ava.lock");
        fs::write(&lock_path, b"999-1\n")?;

        assert!(!break_stale_lock(&lock_path, Duration::from_secs(3600)));
        assert_eq!(fs::read_to_string(&lock_path)?, "999-1\n");

        thread::sleep(Duration::from_millis(20));
        assert!(break_stale_lock(&lock_path, Duration::ZERO));
        assert!(!lock_path.exists());
        Ok(())
    }

    #[test]
    fn released_lock_leaves_a_replacement_holder_alone() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let lock_path = temp.path().join("ava.lock");
        let deadline = Instant::now() + Duration::from_millis(50);
        let held = LockFile::acquire(&lock_path, deadline, Duration::from_secs(3600))?
            .ok_or_else(|| anyhow::anyhow!("lock not acquired"))?;

        fs::write(&lock_path, b"other-holder\n")?;
        drop(held);
        assert_eq!(fs::read_to_string(&lock_path)?, "other-holder\n");
        Ok(())
    }

    #[test]
    fn reset_restores_default_record() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = RotationStore::new(temp.path());
        store.update("ava", |state| state.last_pose_index = 3)?;
        assert_eq!(store.reset("ava")?, RotationState::default());
        assert_eq!(store.load("ava"), RotationState::default());
        Ok(())
    }

    #[test]
    fn record_stem_is_filesystem_safe() {
        let stem = record_stem("Ava / Night Set");
        assert!(stem.starts_with("ava___night_set-"));
        assert_ne!(record_stem("a/b"), record_stem("a_b"));
    }
}
