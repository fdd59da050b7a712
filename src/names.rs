//! Client-name table
//!
//! Persistent clientId → last-seen displayName mapping, written as
//! `client_names.json` next to the recordings so post-hoc processing can
//! label audio. Updated on every rename and on floor grant.

use log::warn;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

pub struct ClientNames {
    path: PathBuf,
    map: Mutex<HashMap<String, String>>,
}

impl ClientNames {
    /// Load the table from disk; a missing or unreadable file starts empty.
    pub fn load(path: PathBuf) -> Self {
        let map = match fs::read_to_string(&path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(map) => map,
                Err(e) => {
                    warn!("Ignoring malformed client-name table {:?}: {}", path, e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            map: Mutex::new(map),
        }
    }

    /// Record a name and rewrite the file. Unchanged names skip the write.
    pub fn record(&self, client_id: &str, display_name: &str) {
        let mut map = self.map.lock();
        if map.get(client_id).map(String::as_str) == Some(display_name) {
            return;
        }
        map.insert(client_id.to_string(), display_name.to_string());
        self.save(&map);
    }

    /// Last-seen display name for a client id.
    pub fn get(&self, client_id: &str) -> Option<String> {
        self.map.lock().get(client_id).cloned()
    }

    fn save(&self, map: &HashMap<String, String>) {
        match serde_json::to_string_pretty(map) {
            Ok(json) => {
                if let Err(e) = fs::write(&self.path, json) {
                    warn!("Failed to write client-name table {:?}: {}", self.path, e);
                }
            }
            Err(e) => warn!("Failed to serialize client-name table: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_names.json");

        let names = ClientNames::load(path.clone());
        names.record("aaaaaaaa", "Alice");
        names.record("bbbbbbbb", "Bob");
        names.record("aaaaaaaa", "Alicia");

        let reloaded = ClientNames::load(path);
        assert_eq!(reloaded.get("aaaaaaaa").as_deref(), Some("Alicia"));
        assert_eq!(reloaded.get("bbbbbbbb").as_deref(), Some("Bob"));
        assert_eq!(reloaded.get("cccccccc"), None);
    }

    #[test]
    fn malformed_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client_names.json");
        fs::write(&path, "not json").unwrap();

        let names = ClientNames::load(path);
        assert_eq!(names.get("aaaaaaaa"), None);
    }
}
