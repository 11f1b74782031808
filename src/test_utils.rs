use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, OnceLock};

// Tests that touch the process environment or the working directory are
// serialized through one global lock; cargo runs tests in threads.
static ENV_MUTEX: OnceLock<Mutex<()>> = OnceLock::new();

fn env_lock() -> MutexGuard<'static, ()> {
    ENV_MUTEX
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Points PASSERELLE_DATA_DIR at a fresh per-test directory and holds the
// env lock for the guard's lifetime. Dropping it restores the previous
// value and deletes the directory, so config and store tests never see
// each other's files.
pub(crate) struct TestDataDir {
    _lock: MutexGuard<'static, ()>,
    previous: Option<String>,
    pub(crate) path: PathBuf,
}

impl TestDataDir {
    pub(crate) fn new(label: &str) -> Self {
        let lock = env_lock();
        let path = std::env::temp_dir().join(format!("passerelle-test-{}", label));
        let _ = std::fs::remove_dir_all(&path);
        let previous = std::env::var("PASSERELLE_DATA_DIR").ok();
        std::env::set_var("PASSERELLE_DATA_DIR", &path);
        Self {
            _lock: lock,
            previous,
            path,
        }
    }
}

impl Drop for TestDataDir {
    fn drop(&mut self) {
        match self.previous.as_deref() {
            Some(value) => std::env::set_var("PASSERELLE_DATA_DIR", value),
            None => std::env::remove_var("PASSERELLE_DATA_DIR"),
        }
        let _ = std::fs::remove_dir_all(&self.path);
    }
}

struct RestoreEnv {
    saved: Vec<(String, Option<String>)>,
}

impl Drop for RestoreEnv {
    fn drop(&mut self) {
        for (key, value) in &self.saved {
            match value.as_deref() {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}

// Applies the given environment overrides (None unsets) around the
// closure, under the env lock. Previous values come back even when the
// closure panics, so a failing assertion cannot poison later tests.
pub(crate) fn with_env_vars<F: FnOnce()>(vars: &[(&str, Option<&str>)], f: F) {
    let _lock = env_lock();
    let _restore = RestoreEnv {
        saved: vars
            .iter()
            .map(|(key, _)| ((*key).to_string(), std::env::var(key).ok()))
            .collect(),
    };
    for (key, value) in vars {
        match value {
            Some(value) => std::env::set_var(key, value),
            None => std::env::remove_var(key),
        }
    }
    f();
}
