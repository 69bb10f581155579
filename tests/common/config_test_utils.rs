use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;

const ENV_KEYS: &[&str] = &[
    "ONESHOT_SERVER__PORT",
    "ONESHOT_SERVER__HOST",
    "ONESHOT_OUTPUT__FORMAT",
    "ONESHOT_AUTH__USERNAME",
];

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// Puts back whatever the `ONESHOT_*` variables held before the test.
struct EnvRestore {
    saved: Vec<(&'static str, Option<std::ffi::OsString>)>,
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        for (key, value) in self.saved.drain(..) {
            match value {
                Some(value) => std::env::set_var(key, value),
                None => std::env::remove_var(key),
            }
        }
    }
}

/// Runs `f` with a config file containing `contents` and a clean
/// `ONESHOT_*` environment. The file's path is passed to `f`.
pub fn with_config_file<F>(contents: &str, f: F)
where
    F: FnOnce(&std::path::Path),
{
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let _restore = EnvRestore {
        saved: ENV_KEYS
            .iter()
            .map(|key| (*key, std::env::var_os(key)))
            .collect(),
    };
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }

    let temp_dir = TempDir::new().expect("create temp dir");
    let path = temp_dir.path().join("config.toml");
    std::fs::write(&path, contents).expect("write config");
    f(&path);
}
