//! Local workspace backing the builtin capabilities: tasks, events, notes
//! and a mail outbox, persisted as a single JSON file.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concierge_agent::{Adapter, AdapterOutcome, BoxedAdapter};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs;

/// Words that never narrow a search on their own
const STOP_WORDS: &[&str] = &[
    "the", "and", "with", "about", "task", "tasks", "event", "meeting", "email", "my", "for",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub done: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub title: String,
    pub when: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub content: String,
    pub saved_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Email {
    pub id: String,
    pub to: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceData {
    pub tasks: Vec<Task>,
    pub events: Vec<Event>,
    pub notes: Vec<Note>,
    pub outbox: Vec<Email>,
    next_id: u64,
}

impl WorkspaceData {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{}", prefix, self.next_id)
    }
}

/// Shared handle over the workspace data
#[derive(Clone, Default)]
pub struct Workspace {
    data: Arc<Mutex<WorkspaceData>>,
    /// Serializes file writes so snapshots land in the order they were taken
    writer: Arc<tokio::sync::Mutex<()>>,
    path: Option<PathBuf>,
}

impl Workspace {
    /// Get the default workspace file
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("concierge")
            .join("workspace.json")
    }

    /// A workspace that is never written to disk
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or start) a workspace file
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let data = match fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content).map_err(std::io::Error::other)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => WorkspaceData::default(),
            Err(e) => return Err(e),
        };
        Ok(Self {
            data: Arc::new(Mutex::new(data)),
            writer: Arc::default(),
            path: Some(path),
        })
    }

    /// Read the data
    pub fn read<R>(&self, f: impl FnOnce(&WorkspaceData) -> R) -> R {
        f(&self.data.lock())
    }

    /// Mutate the data and persist it
    async fn update<R>(&self, f: impl FnOnce(&mut WorkspaceData) -> R) -> std::io::Result<R> {
        let _writing = self.writer.lock().await;
        let (result, snapshot) = {
            let mut data = self.data.lock();
            let result = f(&mut data);
            let snapshot = match &self.path {
                Some(_) => Some(serde_json::to_string_pretty(&*data).map_err(std::io::Error::other)?),
                None => None,
            };
            (result, snapshot)
        };
        if let (Some(path), Some(content)) = (&self.path, snapshot) {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir).await?;
            }
            fs::write(path, content).await?;
        }
        Ok(result)
    }

    /// Open tasks whose title matches the query (all open tasks for an empty query)
    pub fn open_tasks_matching(&self, query: &str) -> Vec<Task> {
        self.read(|d| {
            d.tasks
                .iter()
                .filter(|t| !t.done && matches_query(&t.title, query))
                .cloned()
                .collect()
        })
    }

    /// Events whose title matches the query
    pub fn events_matching(&self, query: &str) -> Vec<Event> {
        self.read(|d| {
            d.events
                .iter()
                .filter(|e| matches_query(&e.title, query))
                .cloned()
                .collect()
        })
    }
}

/// Whether any significant word of `query` occurs in `text`
pub fn matches_query(text: &str, query: &str) -> bool {
    let text = text.to_lowercase();
    let words: Vec<String> = query
        .split_whitespace()
        .map(|w| w.to_lowercase())
        .filter(|w| w.chars().count() >= 3 && !STOP_WORDS.contains(&w.as_str()))
        .collect();
    words.is_empty() || words.iter().any(|w| text.contains(w.as_str()))
}

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| format!("missing '{}'", key))
}

fn bullet_list<'a>(items: impl Iterator<Item = &'a str>) -> String {
    items.map(|i| format!("- {}", i)).collect::<Vec<_>>().join("\n")
}

/// Adapter executing one capability's operations against the workspace
pub struct WorkspaceAdapter {
    capability: &'static str,
    workspace: Workspace,
}

impl WorkspaceAdapter {
    pub fn new(capability: &'static str, workspace: Workspace) -> Self {
        Self {
            capability,
            workspace,
        }
    }

    /// Adapters for every capability the workspace serves
    pub fn all(workspace: &Workspace) -> Vec<BoxedAdapter> {
        ["database", "calendar", "memory", "mail"]
            .into_iter()
            .map(|c| Arc::new(Self::new(c, workspace.clone())) as BoxedAdapter)
            .collect()
    }

    async fn run(&self, action: &str, args: &Value) -> Result<Value, String> {
        let ws = &self.workspace;
        let saved = |e: std::io::Error| format!("failed to save workspace: {}", e);
        match action {
            "create_task" => {
                let title = str_arg(args, "title")?.to_string();
                let id = ws
                    .update(|d| {
                        let id = d.next_id("task");
                        d.tasks.push(Task {
                            id: id.clone(),
                            title: title.clone(),
                            done: false,
                            created_at: Utc::now(),
                        });
                        id
                    })
                    .await
                    .map_err(saved)?;
                Ok(json!({ "id": id, "message": format!("Added task: {}", title) }))
            }
            "complete_task" | "delete_task" => {
                let id = str_arg(args, "id")?;
                let title = ws
                    .update(|d| {
                        let pos = d.tasks.iter().position(|t| t.id == id)?;
                        if action == "delete_task" {
                            Some(d.tasks.remove(pos).title)
                        } else {
                            d.tasks[pos].done = true;
                            Some(d.tasks[pos].title.clone())
                        }
                    })
                    .await
                    .map_err(saved)?
                    .ok_or_else(|| format!("no task with id {}", id))?;
                let verb = if action == "delete_task" { "Deleted task" } else { "Marked as done" };
                Ok(json!({ "id": id, "message": format!("{}: {}", verb, title) }))
            }
            "list_tasks" => {
                let tasks = ws.open_tasks_matching("");
                let message = if tasks.is_empty() {
                    "You have no open tasks.".to_string()
                } else {
                    format!(
                        "Open tasks:\n{}",
                        bullet_list(tasks.iter().map(|t| t.title.as_str()))
                    )
                };
                Ok(json!({ "count": tasks.len(), "message": message }))
            }
            "create_event" => {
                let title = str_arg(args, "title")?.to_string();
                let when = args.get("when").and_then(Value::as_str).map(str::to_string);
                let id = ws
                    .update(|d| {
                        let id = d.next_id("event");
                        d.events.push(Event {
                            id: id.clone(),
                            title: title.clone(),
                            when: when.clone(),
                            created_at: Utc::now(),
                        });
                        id
                    })
                    .await
                    .map_err(saved)?;
                let message = match when {
                    Some(when) => format!("Scheduled: {} ({})", title, when),
                    None => format!("Scheduled: {}", title),
                };
                Ok(json!({ "id": id, "message": message }))
            }
            "delete_event" => {
                let id = str_arg(args, "id")?;
                let title = ws
                    .update(|d| {
                        let pos = d.events.iter().position(|e| e.id == id)?;
                        Some(d.events.remove(pos).title)
                    })
                    .await
                    .map_err(saved)?
                    .ok_or_else(|| format!("no event with id {}", id))?;
                Ok(json!({ "id": id, "message": format!("Cancelled: {}", title) }))
            }
            "list_events" => {
                let events = ws.events_matching("");
                let message = if events.is_empty() {
                    "Your calendar is clear.".to_string()
                } else {
                    let lines: Vec<String> = events
                        .iter()
                        .map(|e| match &e.when {
                            Some(when) => format!("{} ({})", e.title, when),
                            None => e.title.clone(),
                        })
                        .collect();
                    format!("Upcoming events:\n{}", bullet_list(lines.iter().map(String::as_str)))
                };
                Ok(json!({ "count": events.len(), "message": message }))
            }
            "save_memory" => {
                let content = str_arg(args, "content")?.to_string();
                let id = ws
                    .update(|d| {
                        let id = d.next_id("note");
                        d.notes.push(Note {
                            id: id.clone(),
                            content,
                            saved_at: Utc::now(),
                        });
                        id
                    })
                    .await
                    .map_err(saved)?;
                Ok(json!({ "id": id, "message": "Got it, I'll remember that." }))
            }
            "search_memory" => {
                let query = args.get("query").and_then(Value::as_str).unwrap_or("");
                let found: Vec<String> = ws.read(|d| {
                    d.notes
                        .iter()
                        .filter(|n| matches_query(&n.content, query))
                        .map(|n| n.content.clone())
                        .collect()
                });
                let message = if found.is_empty() {
                    "I don't remember anything about that.".to_string()
                } else {
                    format!(
                        "You told me:\n{}",
                        bullet_list(found.iter().map(String::as_str))
                    )
                };
                Ok(json!({ "count": found.len(), "message": message }))
            }
            "send_email" => {
                let to = str_arg(args, "to")?.to_string();
                let body = args
                    .get("body")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let id = ws
                    .update(|d| {
                        let id = d.next_id("mail");
                        d.outbox.push(Email {
                            id: id.clone(),
                            to: to.clone(),
                            body,
                            sent_at: Utc::now(),
                        });
                        id
                    })
                    .await
                    .map_err(saved)?;
                Ok(json!({ "id": id, "message": format!("Email to {} queued.", to) }))
            }
            "search_emails" => {
                let query = args.get("query").and_then(Value::as_str).unwrap_or("");
                let found: Vec<String> = ws.read(|d| {
                    d.outbox
                        .iter()
                        .filter(|m| matches_query(&format!("{} {}", m.to, m.body), query))
                        .map(|m| format!("to {}: {}", m.to, m.body))
                        .collect()
                });
                let message = if found.is_empty() {
                    "No emails match.".to_string()
                } else {
                    format!("Emails:\n{}", bullet_list(found.iter().map(String::as_str)))
                };
                Ok(json!({ "count": found.len(), "message": message }))
            }
            other => Err(format!("unsupported action '{}'", other)),
        }
    }
}

#[async_trait]
impl Adapter for WorkspaceAdapter {
    fn capability(&self) -> &str {
        self.capability
    }

    async fn execute(&self, action: &str, args: &Value) -> AdapterOutcome {
        match self.run(action, args).await {
            Ok(data) => AdapterOutcome::ok(data),
            Err(message) => AdapterOutcome::failed(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_lifecycle() {
        let ws = Workspace::in_memory();
        let tasks = WorkspaceAdapter::new("database", ws.clone());

        let created = tasks
            .execute("create_task", &json!({"title": "buy milk"}))
            .await;
        assert!(created.success);
        let id = created.data.as_ref().unwrap()["id"].as_str().unwrap().to_string();

        let listed = tasks.execute("list_tasks", &json!({})).await;
        assert!(listed.data.unwrap()["message"].as_str().unwrap().contains("- buy milk"));

        let done = tasks.execute("complete_task", &json!({"id": id})).await;
        assert!(done.success);
        assert!(ws.open_tasks_matching("milk").is_empty());

        let missing = tasks.execute("delete_task", &json!({"id": "task-99"})).await;
        assert!(!missing.success);
        assert!(missing.error.unwrap().contains("task-99"));
    }

    #[tokio::test]
    async fn test_missing_args_fail() {
        let adapter = WorkspaceAdapter::new("mail", Workspace::in_memory());
        let outcome = adapter.execute("send_email", &json!({"body": "hi"})).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("missing 'to'"));
    }

    #[tokio::test]
    async fn test_workspace_persists_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspace.json");
        let ws = Workspace::open(&path).await.unwrap();
        WorkspaceAdapter::new("memory", ws)
            .execute("save_memory", &json!({"content": "passport ends in 42"}))
            .await;

        let reopened = Workspace::open(&path).await.unwrap();
        let found = WorkspaceAdapter::new("memory", reopened)
            .execute("search_memory", &json!({"query": "passport"}))
            .await;
        assert!(found.data.unwrap()["message"].as_str().unwrap().contains("ends in 42"));
    }

    #[tokio::test]
    async fn test_concurrent_updates_all_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("workspace.json");
        let ws = Workspace::open(&path).await.unwrap();
        let adapter = Arc::new(WorkspaceAdapter::new("database", ws));

        let mut handles = Vec::new();
        for i in 0..8 {
            let adapter = Arc::clone(&adapter);
            handles.push(tokio::spawn(async move {
                adapter
                    .execute("create_task", &json!({"title": format!("task {}", i)}))
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }

        let reopened = Workspace::open(&path).await.unwrap();
        assert_eq!(reopened.read(|d| d.tasks.len()), 8);
    }

    #[tokio::test]
    async fn test_open_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workspace.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(Workspace::open(&path).await.is_err());
    }

    #[test]
    fn test_matches_query_ignores_stop_words() {
        assert!(matches_query("Buy milk", "the milk task"));
        assert!(!matches_query("Buy milk", "bread"));
        assert!(matches_query("anything", "the task"));
    }
}
