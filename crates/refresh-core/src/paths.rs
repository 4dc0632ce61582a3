use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const REFRESH_DIR: &str = ".refresh";
pub const CONFIG_FILE: &str = ".refresh/config.yaml";
pub const HISTORY_FILE: &str = ".refresh/history.redb";
pub const LOCK_FILE: &str = ".refresh/lock.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn refresh_dir(root: &Path) -> PathBuf {
    root.join(REFRESH_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn history_path(root: &Path) -> PathBuf {
    root.join(HISTORY_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}
