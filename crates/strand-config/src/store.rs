use std::{
    collections::HashMap,
    sync::{Condvar, Mutex},
};

use strand_wire::Status;
use tracing::warn;

pub type Version = u64;

/// Interprets stored bytes; values that yield `None` are never admitted.
pub type ExtractVersionFn = Box<dyn Fn(&[u8]) -> Option<Version> + Send + Sync>;

pub type GetCallback = Box<dyn FnOnce(Status, Option<Vec<u8>>) + Send>;

/// `(status, version, value)`: on `VersionMismatch` the currently stored
/// version and value come back so the caller can rebase.
pub type UpdateCallback = Box<dyn FnOnce(Status, Option<Version>, Option<Vec<u8>>) + Send>;

/// Mutator for read-modify-write. Receives the current value (or `None`)
/// and returns the replacement; permitted statuses are `Ok`,
/// `VersionMismatch` and `Shutdown`.
pub type MutationFn = Box<dyn FnMut(Option<&[u8]>) -> (Status, Option<Vec<u8>>) + Send>;

struct State {
    entries: HashMap<String, Vec<u8>>,
    shutting_down: bool,
    in_flight: usize,
}

/// Key→value store with strict conditional updates. Values carry their
/// own version, surfaced through the user-supplied extractor; a commit
/// must strictly increase it. Callbacks fire exactly once, on the calling
/// thread, after the store's own state has settled.
pub struct VersionedConfigStore {
    extract_version: ExtractVersionFn,
    state: Mutex<State>,
    idle: Condvar,
}

impl VersionedConfigStore {
    pub fn new(extract_version: ExtractVersionFn) -> Self {
        Self {
            extract_version,
            state: Mutex::new(State {
                entries: HashMap::new(),
                shutting_down: false,
                in_flight: 0,
            }),
            idle: Condvar::new(),
        }
    }

    fn begin_op(&self) -> Option<OpGuard<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.shutting_down {
            return None;
        }
        state.in_flight += 1;
        Some(OpGuard { store: self })
    }

    /// Read `key`. With a `base_version`, a stored version at or below it
    /// comes back as `UpToDate` with no value.
    pub fn get(&self, key: &str, base_version: Option<Version>, cb: GetCallback) {
        let Some(_op) = self.begin_op() else {
            cb(Status::Shutdown, None);
            return;
        };
        let result = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.entries.get(key) {
                None => (Status::NotFound, None),
                Some(value) => match (base_version, (self.extract_version)(value)) {
                    (_, None) => (Status::InvalidConfig, None),
                    (Some(base), Some(stored)) if base >= stored => (Status::UpToDate, None),
                    _ => (Status::Ok, Some(value.clone())),
                },
            }
        };
        cb(result.0, result.1);
    }

    /// Linearizable read: always observes the latest committed value.
    /// Trivial here since commits serialize on the store lock, but part
    /// of the contract callers may rely on.
    pub fn get_latest(&self, key: &str, cb: GetCallback) {
        self.get(key, None, cb);
    }

    /// Write `key`. `base_version = None` overwrites unconditionally
    /// (initial creation included); `Some(v)` is a compare-and-swap
    /// against the stored version. Either way the incoming value's own
    /// version must be strictly greater than what it replaces.
    pub fn update(
        &self,
        key: &str,
        value: Vec<u8>,
        base_version: Option<Version>,
        cb: UpdateCallback,
    ) {
        let Some(_op) = self.begin_op() else {
            cb(Status::Shutdown, None, None);
            return;
        };
        let (status, version, existing) = self.update_locked(key, value, base_version);
        cb(status, version, existing);
    }

    fn update_locked(
        &self,
        key: &str,
        value: Vec<u8>,
        base_version: Option<Version>,
    ) -> (Status, Option<Version>, Option<Vec<u8>>) {
        let Some(new_version) = (self.extract_version)(&value) else {
            return (Status::InvalidParam, None, None);
        };
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let current = match state.entries.get(key) {
            Some(stored) => match (self.extract_version)(stored) {
                Some(version) => Some((version, stored)),
                None => return (Status::InvalidConfig, None, None),
            },
            None => None,
        };

        match (base_version, current) {
            (Some(_), None) => (Status::NotFound, None, None),
            (Some(base), Some((stored_version, stored))) if base != stored_version => {
                (Status::VersionMismatch, Some(stored_version), Some(stored.clone()))
            }
            (_, Some((stored_version, _))) if new_version <= stored_version => {
                (Status::InvalidParam, Some(stored_version), None)
            }
            _ => {
                state.entries.insert(key.to_owned(), value);
                (Status::Ok, Some(new_version), None)
            }
        }
    }

    /// Read the current value, run `mutate` on it, and commit the result
    /// conditionally on the version just read; retries from the top when
    /// a concurrent commit wins the race. Terminates when the commit
    /// lands or `mutate` returns non-Ok; `cb` observes the terminal
    /// status.
    pub fn read_modify_write(&self, key: &str, mut mutate: MutationFn, cb: UpdateCallback) {
        let Some(_op) = self.begin_op() else {
            cb(Status::Shutdown, None, None);
            return;
        };
        loop {
            let current = {
                let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                state.entries.get(key).cloned()
            };
            let read_version = current.as_deref().and_then(|v| (self.extract_version)(v));

            let (status, new_value) = mutate(current.as_deref());
            if status != Status::Ok {
                if !matches!(status, Status::VersionMismatch | Status::Shutdown) {
                    warn!(%status, key, "mutator returned out-of-contract status");
                }
                cb(status, read_version, current);
                return;
            }
            let Some(new_value) = new_value else {
                cb(Status::InvalidParam, read_version, current);
                return;
            };
            let Some(new_version) = (self.extract_version)(&new_value) else {
                cb(Status::InvalidParam, read_version, None);
                return;
            };

            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let stored_version =
                    state.entries.get(key).and_then(|v| (self.extract_version)(v));
                // A concurrent commit won the race; re-read and mutate again.
                if stored_version != read_version {
                    continue;
                }
                if let Some(read) = read_version
                    && new_version <= read
                {
                    drop(state);
                    cb(Status::InvalidParam, read_version, None);
                    return;
                }
                state.entries.insert(key.to_owned(), new_value);
            }
            cb(Status::Ok, Some(new_version), None);
            return;
        }
    }

    /// Blocks until every in-flight operation has completed, then fences
    /// the store. Call from a dedicated shutdown thread; operations
    /// arriving afterwards complete with `Shutdown`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.shutting_down = true;
        while state.in_flight > 0 {
            state = self.idle.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct OpGuard<'a> {
    store: &'a VersionedConfigStore,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.store.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_flight -= 1;
        if state.in_flight == 0 {
            self.store.idle.notify_all();
        }
    }
}
