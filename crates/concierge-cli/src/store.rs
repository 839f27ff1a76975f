//! Thread persistence: one JSON document per conversation thread

use async_trait::async_trait;
use concierge_agent::{ConversationState, Error, Result, StateStore};
use std::path::{Path, PathBuf};

/// Stores each thread's state as `<dir>/<thread_id>.json`
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Get the threads directory
    pub fn threads_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("concierge")
            .join("threads")
    }

    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, thread_id: &str) -> Result<PathBuf> {
        let valid = !thread_id.is_empty()
            && thread_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !thread_id.starts_with('.');
        if !valid {
            return Err(Error::Store(format!("invalid thread id: {:?}", thread_id)));
        }
        Ok(self.dir.join(format!("{}.json", thread_id)))
    }

    /// Summaries of every stored thread, most recently active first
    pub async fn summaries(&self) -> Result<Vec<ThreadSummary>> {
        let mut summaries = Vec::new();
        for id in self.list_threads().await? {
            match self.load(&id).await {
                Ok(Some(state)) => summaries.push(ThreadSummary::from_state(&state)),
                Ok(None) => {}
                Err(e) => tracing::warn!(thread_id = %id, "Skipping unreadable thread: {}", e),
            }
        }
        summaries.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        Ok(summaries)
    }
}

fn store_err(e: std::io::Error) -> Error {
    Error::Store(e.to_string())
}

#[async_trait]
impl StateStore for FileStore {
    async fn load(&self, thread_id: &str) -> Result<Option<ConversationState>> {
        let path = self.path(thread_id)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    async fn save(&self, state: &ConversationState) -> Result<()> {
        let path = self.path(&state.thread_id)?;
        tokio::fs::create_dir_all(&self.dir).await.map_err(store_err)?;

        // Write then rename so a crash never leaves a half-written thread
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&tmp, content).await.map_err(store_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(store_err)?;
        tracing::debug!(thread_id = %state.thread_id, "Saved thread");
        Ok(())
    }

    async fn list_threads(&self) -> Result<Vec<String>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
            Err(e) => return Err(store_err(e)),
        };

        let mut ids = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(store_err)? {
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    ids.push(stem.to_string());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// Information about a saved thread
#[derive(Debug, Clone)]
pub struct ThreadSummary {
    pub id: String,
    pub message_count: usize,
    /// Timestamp (ms) of the newest message
    pub last_activity: Option<i64>,
    /// Question waiting for an answer, if any
    pub pending: Option<String>,
}

impl ThreadSummary {
    fn from_state(state: &ConversationState) -> Self {
        Self {
            id: state.thread_id.clone(),
            message_count: state.recent_messages.len(),
            last_activity: state.recent_messages.iter().map(|m| m.timestamp).max(),
            pending: state.pending_hitl.as_ref().map(|p| p.question.clone()),
        }
    }

    /// Format the last activity timestamp for display
    pub fn last_activity_display(&self) -> String {
        use chrono::{TimeZone, Utc};
        self.last_activity
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}
