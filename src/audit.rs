// Append-only audit trail.
//
// `record` is fire-and-forget: entries flow over an unbounded channel to a
// background writer that appends one JSONL file per UTC day. A failed write
// drops the entry with a warning; it never blocks or fails the request that
// triggered it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub actor: String,
    pub detail: Value,
}

#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::UnboundedSender<AuditEntry>,
}

impl AuditSink {
    /// Spawn the writer task and return the sink handle.
    pub fn new(audit_dir: PathBuf) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(audit_dir, rx));
        Self { tx }
    }

    /// Record an action. Never blocks, never errors.
    pub fn record(&self, action: &str, actor: &str, detail: Value) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            action: action.to_string(),
            actor: actor.to_string(),
            detail,
        };
        if self.tx.send(entry).is_err() {
            tracing::warn!(action, "audit writer gone, dropping entry");
        }
    }
}

async fn writer_task(audit_dir: PathBuf, mut rx: mpsc::UnboundedReceiver<AuditEntry>) {
    if let Err(e) = std::fs::create_dir_all(&audit_dir) {
        tracing::warn!(
            dir = %audit_dir.display(),
            error = %e,
            "cannot create audit directory; audit entries will be dropped"
        );
    }

    // Entries for one actor arrive in request causal order and a single
    // writer preserves channel order, so the file order is causal too.
    while let Some(entry) = rx.recv().await {
        if let Err(e) = append_entry(&audit_dir, &entry) {
            tracing::warn!(
                action = entry.action,
                actor = entry.actor,
                error = %e,
                "dropping audit entry"
            );
        }
    }
}

fn append_entry(audit_dir: &std::path::Path, entry: &AuditEntry) -> std::io::Result<()> {
    let day = entry.timestamp.format("%Y-%m-%d");
    let path = audit_dir.join(format!("{day}.jsonl"));
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let line = serde_json::to_string(entry)?;
    writeln!(file, "{line}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn read_entries(dir: &std::path::Path) -> Vec<AuditEntry> {
        let day = Utc::now().format("%Y-%m-%d");
        let path = dir.join(format!("{day}.jsonl"));
        let contents = tokio::fs::read_to_string(path).await.unwrap_or_default();
        contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_entries_written_in_order() {
        let dir = TempDir::new().unwrap();
        let sink = AuditSink::new(dir.path().to_path_buf());

        sink.record("goals.create", "u1", json!({"id": "1"}));
        sink.record("goals.delete", "u1", json!({"id": "1"}));

        // Writer runs in the background; give it a beat.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let entries = read_entries(dir.path()).await;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].action, "goals.create");
        assert_eq!(entries[1].action, "goals.delete");
        assert_eq!(entries[0].actor, "u1");
    }

    #[tokio::test]
    async fn test_unwritable_dir_never_errors() {
        // Point at a file so the directory cannot be created.
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, "x").unwrap();

        let sink = AuditSink::new(blocker);
        sink.record("noop", "guest", json!({}));
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Reaching here without a panic or error is the contract.
    }
}
