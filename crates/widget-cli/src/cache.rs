//! JSON file holding the last successful value of every widget.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use widget_sandbox::widget::ResultCache;

/// A [`ResultCache`] persisted as a flat `{"widget name": "value"}` JSON object.
#[derive(Debug)]
pub struct JsonFileCache {
    path: PathBuf,
    values: Mutex<BTreeMap<String, String>>,
}

impl JsonFileCache {
    /// Open the cache at `path`. A missing or unreadable file starts empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let values = load(&path);
        Self {
            path,
            values: Mutex::new(values),
        }
    }
}

fn load(path: &Path) -> BTreeMap<String, String> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot read widget cache, starting empty");
            return BTreeMap::new();
        }
    };
    serde_json::from_str(&content).unwrap_or_else(|e| {
        tracing::warn!(path = %path.display(), error = %e, "widget cache is corrupt, starting empty");
        BTreeMap::new()
    })
}

impl ResultCache for JsonFileCache {
    fn last_result(&self, widget: &str) -> Option<String> {
        self.values
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(widget)
            .cloned()
    }

    fn store(&self, widget: &str, value: &str) -> std::io::Result<()> {
        let mut values = self.values.lock().unwrap_or_else(|e| e.into_inner());
        values.insert(widget.to_string(), value.to_string());
        let json = serde_json::to_vec_pretty(&*values)?;
        std::fs::write(&self.path, json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache = JsonFileCache::open(dir.path().join("cache.json"));
        assert_eq!(cache.last_result("Weather"), None);
    }

    #[test]
    fn stored_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");

        let cache = JsonFileCache::open(&path);
        cache.store("Weather", "72°F").unwrap();
        cache.store("Stock", "101.5").unwrap();
        cache.store("Weather", "75°F").unwrap();

        let reopened = JsonFileCache::open(&path);
        assert_eq!(reopened.last_result("Weather").as_deref(), Some("75°F"));
        assert_eq!(reopened.last_result("Stock").as_deref(), Some("101.5"));
    }

    #[test]
    fn corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "not json").unwrap();

        let cache = JsonFileCache::open(&path);
        assert_eq!(cache.last_result("Weather"), None);
        cache.store("Weather", "1").unwrap();
        assert_eq!(JsonFileCache::open(&path).last_result("Weather").as_deref(), Some("1"));
    }
}
