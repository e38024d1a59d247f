use super::{AuditEntry, NewAuditEntry, SubjectKind};
use crate::engine::db::DbHandle;
use anyhow::{Context, Result};
use std::path::Path;

/// Append-only sink backed by the engine database.
#[derive(Clone)]
pub struct AuditLog {
    db: DbHandle,
}

impl AuditLog {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn record(&self, entry: NewAuditEntry) -> Result<AuditEntry> {
        let action = entry.action.clone();
        let recorded = self.db.call(move |db| db.insert_audit(&entry)).await?;
        tracing::debug!(
            action = %action,
            subject = recorded.subject_kind.as_str(),
            subject_id = recorded.subject_id,
            "audit"
        );
        Ok(recorded)
    }

    /// Record an entry whose loss must not change control flow. A failure to
    /// append is logged at error level instead of propagated.
    pub async fn record_best_effort(&self, entry: NewAuditEntry) {
        let action = entry.action.clone();
        if let Err(e) = self.record(entry).await {
            tracing::error!(action = %action, error = %e, "failed to append audit entry");
        }
    }

    pub async fn entries(&self, subject: Option<(SubjectKind, i64)>) -> Result<Vec<AuditEntry>> {
        self.db.call(move |db| db.list_audit(subject)).await
    }

    /// Write entries as a pretty JSON array. Returns how many were written.
    pub async fn export(&self, path: &Path, subject: Option<(SubjectKind, i64)>) -> Result<usize> {
        let entries = self.entries(subject).await?;
        let json =
            serde_json::to_string_pretty(&entries).context("Failed to serialize audit entries")?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        tokio::fs::write(path, json)
            .await
            .with_context(|| format!("Failed to write audit export to {}", path.display()))?;
        Ok(entries.len())
    }
}
