//! Blocked-domain list: file loading and live reload.
//!
//! The blocklist is one defense-in-depth layer among several, so absence or
//! unreadability of the file degrades to an empty set instead of failing
//! the proxy. A `notify` watcher replaces the whole set on every change
//! event; readers always observe a complete set, never a partial update.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::host::matches_blocked;

/// Load the blocked-domain set from a newline-delimited file.
///
/// Lines are trimmed and lowercased; blank lines and `#` comments are
/// dropped. A missing path, missing file, or any read error yields an
/// empty set.
pub fn load_blocked(path: Option<&Path>) -> HashSet<String> {
    let Some(path) = path else {
        return HashSet::new();
    };

    match std::fs::read_to_string(path) {
        Ok(contents) => contents
            .lines()
            .map(|line| line.trim().to_lowercase())
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .collect(),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "blocklist unreadable, using empty set");
            HashSet::new()
        }
    }
}

/// Shared, live-reloading blocked-domain store.
///
/// Cloning is cheap; clones share the same underlying set and watch handle.
#[derive(Clone)]
pub struct BlocklistStore {
    set: Arc<RwLock<HashSet<String>>>,
    watcher: Arc<Mutex<Option<RecommendedWatcher>>>,
}

impl BlocklistStore {
    /// Create a store backed by the given file, watching it for changes.
    ///
    /// With no path the store is a fixed empty set. Watch-setup failures
    /// degrade to a static set (logged), matching the load behavior.
    pub fn new(path: Option<PathBuf>) -> Self {
        let set = Arc::new(RwLock::new(load_blocked(path.as_deref())));
        let watcher = path.and_then(|p| start_watcher(p, Arc::clone(&set)));
        Self {
            set,
            watcher: Arc::new(Mutex::new(watcher)),
        }
    }

    /// Create a store from a fixed in-memory set (no file, no watch).
    pub fn from_set(domains: HashSet<String>) -> Self {
        Self {
            set: Arc::new(RwLock::new(domains)),
            watcher: Arc::new(Mutex::new(None)),
        }
    }

    /// Suffix-aware membership test: the host or any parent domain.
    pub fn contains(&self, host: &str) -> bool {
        let set = self.set.read().unwrap_or_else(PoisonError::into_inner);
        matches_blocked(host, &set)
    }

    /// Number of listed domains.
    pub fn len(&self) -> usize {
        self.set
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel the file watch. Called when the proxy closes; the current
    /// set stays readable for connections still draining.
    pub fn stop(&self) {
        let mut watcher = self.watcher.lock().unwrap_or_else(PoisonError::into_inner);
        if watcher.take().is_some() {
            debug!("blocklist watch cancelled");
        }
    }
}

/// Start a watcher that reloads and wholesale-replaces the set on any
/// change event. The notify callback runs on the watcher's own thread, so
/// the reload never touches the connection path.
fn start_watcher(path: PathBuf, set: Arc<RwLock<HashSet<String>>>) -> Option<RecommendedWatcher> {
    let reload_path = path.clone();
    let mut watcher = match notify::recommended_watcher(
        move |event: notify::Result<notify::Event>| match event {
            Ok(_) => {
                let fresh = load_blocked(Some(&reload_path));
                let count = fresh.len();
                *set.write().unwrap_or_else(PoisonError::into_inner) = fresh;
                info!(path = %reload_path.display(), domains = count, "blocklist reloaded");
            }
            Err(e) => {
                warn!(path = %reload_path.display(), error = %e, "blocklist watch error");
            }
        },
    ) {
        Ok(w) => w,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to create blocklist watcher");
            return None;
        }
    };

    if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
        warn!(path = %path.display(), error = %e, "failed to watch blocklist file");
        return None;
    }

    Some(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn test_load_blocked_missing() {
        assert!(load_blocked(None).is_empty());
        assert!(load_blocked(Some(Path::new("/nonexistent/blocked.txt"))).is_empty());
    }

    #[test]
    fn test_load_blocked_parses_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "# comment line\n\nevil.com\n  Tracker.NET  \n\n# another\nads.example"
        )
        .unwrap();
        file.flush().unwrap();

        let set = load_blocked(Some(file.path()));
        let expected: HashSet<String> = ["evil.com", "tracker.net", "ads.example"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(set, expected);
    }

    #[test]
    fn test_store_contains_subdomains() {
        let store =
            BlocklistStore::from_set(["evil.com".to_string()].into_iter().collect());
        assert!(store.contains("evil.com"));
        assert!(store.contains("api.evil.com"));
        assert!(!store.contains("notevil.com"));
    }

    #[test]
    fn test_store_reloads_on_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blocked.txt");
        std::fs::write(&path, "first.example\n").unwrap();

        let store = BlocklistStore::new(Some(path.clone()));
        assert!(store.contains("first.example"));
        assert!(!store.contains("second.example"));

        std::fs::write(&path, "second.example\n").unwrap();

        // The watcher delivers asynchronously; poll briefly.
        let mut reloaded = false;
        for _ in 0..100 {
            if store.contains("second.example") && !store.contains("first.example") {
                reloaded = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert!(reloaded, "blocklist did not reload after file change");

        store.stop();
    }
}
