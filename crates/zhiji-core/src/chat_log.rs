//! Append-only record of chat turns.
//!
//! One [`ChatLogEntry`] per line in `<log dir>/chat.jsonl`.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::ZhijiConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatLogEntry {
    pub timestamp: String,
    pub user_id: String,
    pub session_id: String,
    pub input: String,
    pub response: String,
    pub emotion: String,
    pub route: String,
    pub crisis: bool,
    /// Milliseconds spent per graph node.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub timings: BTreeMap<String, u64>,
}

pub struct ChatLogger {
    path: PathBuf,
    enabled: bool,
}

impl ChatLogger {
    pub fn new(dir: impl AsRef<Path>, enabled: bool) -> Self {
        Self {
            path: dir.as_ref().join("chat.jsonl"),
            enabled,
        }
    }

    pub fn from_config(config: &ZhijiConfig) -> Self {
        Self::new(config.chat_log_dir(), config.logging.chat_log)
    }

    /// Append one entry. Failures are logged and swallowed.
    pub fn log(&self, entry: &ChatLogEntry) {
        if !self.enabled {
            return;
        }
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let line = match serde_json::to_string(entry) {
            Ok(l) => l,
            Err(e) => {
                tracing::debug!("chat log: failed to serialize entry: {e}");
                return;
            }
        };
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path);
        match file {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{line}") {
                    tracing::debug!("chat log: write failed: {e}");
                }
            }
            Err(e) => tracing::debug!("chat log: failed to open {}: {e}", self.path.display()),
        }
    }

    /// The newest `limit` entries for a session, most recent first.
    pub fn recent_for_session(&self, session_id: &str, limit: usize) -> Vec<ChatLogEntry> {
        let mut entries = self.read_all();
        entries.retain(|e| e.session_id == session_id);
        entries.reverse();
        entries.truncate(limit);
        entries
    }

    fn read_all(&self) -> Vec<ChatLogEntry> {
        let Ok(contents) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        contents
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| serde_json::from_str(l).ok())
            .collect()
    }
}
