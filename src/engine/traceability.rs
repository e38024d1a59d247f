//! Follows quadrant requirements into the files agents produce.
//!
//! After an agent Run advances a slice, its artifacts are mapped onto the
//! slice's trace items by category and every item is audited against the
//! worktree. The pass never changes the Run or the slice.

use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Result, bail};
use regex::Regex;
use serde::Serialize;
use serde_json::json;

use super::db::DbHandle;
use super::models::{
    Artifact, AuditFinding, ControlItem, ControlStatus, CoverageReport, Quadrants, Run, Slice,
    TraceCategory, TraceItem, TraceStatus,
};
use super::quadrants::{ControlSummary, derive_control_items, derive_trace_items, summarize_controls};
use crate::audit::{Actor, AuditLog, NewAuditEntry};

const SOURCE_EXTENSIONS: [&str; 14] = [
    "py", "js", "jsx", "ts", "tsx", "rs", "go", "java", "kt", "rb", "php", "cs", "c", "cpp",
];
const SNIPPET_CONTEXT: usize = 2;
const SNIPPET_CHARS: usize = 200;
const SNIPPET_KEYWORDS: usize = 3;

static KEYWORD: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[A-Za-z]{3,}").ok());

/// Whether an artifact path can realise an item of `category`.
pub fn matches_category(category: TraceCategory, path: &str) -> bool {
    let path = path.to_lowercase();
    match category {
        TraceCategory::Functional => path.contains("prd") || path.contains("doc"),
        TraceCategory::Physical => ["config", "setup", "requirement"]
            .iter()
            .any(|needle| path.contains(needle)),
        TraceCategory::Semantic => Path::new(&path)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| SOURCE_EXTENSIONS.contains(&ext)),
        TraceCategory::Exception => ["error", "exception", "handler"]
            .iter()
            .any(|needle| path.contains(needle)),
    }
}

/// Union matching artifact paths into every item not yet compliant.
/// Returns whether anything changed.
pub fn map_artifacts(
    items: &mut [TraceItem],
    artifacts: &[Artifact],
    commit_sha: Option<&str>,
) -> bool {
    let mut changed = false;
    for item in items
        .iter_mut()
        .filter(|item| item.status != TraceStatus::Compliant)
    {
        let mut matched = false;
        for artifact in artifacts {
            if !matches_category(item.category, &artifact.path) {
                continue;
            }
            matched = true;
            if !item.target_files.contains(&artifact.path) {
                item.target_files.push(artifact.path.clone());
                changed = true;
            }
        }
        if matched && let Some(sha) = commit_sha {
            item.commit_sha = Some(sha.to_string());
            changed = true;
        }
        if item.status == TraceStatus::Pending && !item.target_files.is_empty() {
            item.status = TraceStatus::NeedsAudit;
            changed = true;
        }
    }
    changed
}

fn keywords(text: &str) -> Vec<String> {
    KEYWORD
        .as_ref()
        .map(|re| {
            re.find_iter(text)
                .take(SNIPPET_KEYWORDS)
                .map(|m| m.as_str().to_lowercase())
                .collect()
        })
        .unwrap_or_default()
}

/// Lines around the first substantial line that mentions a keyword.
pub fn relevant_snippet(content: &str, text: &str) -> Option<String> {
    let keywords = keywords(text);
    if keywords.is_empty() {
        return None;
    }
    let lines: Vec<&str> = content.lines().collect();
    let hit = lines.iter().position(|line| {
        let lower = line.to_lowercase();
        line.trim().chars().count() > 10 && keywords.iter().any(|k| lower.contains(k.as_str()))
    })?;
    let start = hit.saturating_sub(SNIPPET_CONTEXT);
    let end = (hit + SNIPPET_CONTEXT + 1).min(lines.len());
    let snippet = lines[start..end].join("\n");
    if snippet.chars().count() > SNIPPET_CHARS {
        let mut clamped: String = snippet.chars().take(SNIPPET_CHARS).collect();
        clamped.push_str("...");
        Some(clamped)
    } else {
        Some(snippet)
    }
}

/// Audit each item against the files under `root`, updating its status.
pub fn audit_items(root: &Path, items: &mut [TraceItem]) -> Vec<AuditFinding> {
    let mut findings = Vec::with_capacity(items.len());
    for item in items.iter_mut() {
        if item.target_files.is_empty() {
            findings.push(AuditFinding {
                code: item.code.clone(),
                text: item.text.clone(),
                passed: false,
                snippet: None,
                note: "not mapped to any file".to_string(),
            });
            continue;
        }

        let present: Vec<&String> = item
            .target_files
            .iter()
            .filter(|rel| root.join(rel.as_str()).is_file())
            .collect();
        let finding = if present.is_empty() {
            AuditFinding {
                code: item.code.clone(),
                text: item.text.clone(),
                passed: false,
                snippet: None,
                note: format!("target files missing: {}", item.target_files.join(", ")),
            }
        } else {
            let snippet = present.iter().find_map(|rel| {
                std::fs::read_to_string(root.join(rel.as_str()))
                    .ok()
                    .and_then(|content| relevant_snippet(&content, &item.text))
            });
            AuditFinding {
                code: item.code.clone(),
                text: item.text.clone(),
                passed: true,
                snippet,
                note: format!(
                    "found in {}",
                    present.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
                ),
            }
        };
        item.status = if finding.passed {
            TraceStatus::Compliant
        } else {
            TraceStatus::NonCompliant
        };
        item.notes = Some(finding.note.clone());
        findings.push(finding);
    }
    findings
}

fn coverage_report(slice_id: i64, run_id: Option<i64>, findings: Vec<AuditFinding>) -> CoverageReport {
    let total = findings.len();
    let passed = findings.iter().filter(|f| f.passed).count();
    let coverage = if total == 0 {
        0.0
    } else {
        (passed as f64 / total as f64 * 1000.0).round() / 10.0
    };
    CoverageReport {
        id: 0,
        slice_id,
        run_id,
        total,
        passed,
        failed: total - passed,
        coverage,
        findings,
        created_at: String::new(),
    }
}

/// Counts of what [`Traceability::set_quadrants`] added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QuadrantsUpdate {
    pub traces_added: usize,
    pub controls_added: usize,
}

/// Everything `slice trace` shows.
#[derive(Debug, Clone, Serialize)]
pub struct TraceOverview {
    pub quadrants: Option<Quadrants>,
    pub items: Vec<TraceItem>,
    pub report: Option<CoverageReport>,
    pub controls: Vec<ControlItem>,
    pub summary: ControlSummary,
}

#[derive(Clone)]
pub struct Traceability {
    db: DbHandle,
    audit: AuditLog,
}

impl Traceability {
    pub fn new(db: DbHandle, audit: AuditLog) -> Self {
        Self { db, audit }
    }

    pub async fn quadrants(&self, slice_id: i64) -> Result<Option<Quadrants>> {
        self.db.call(move |db| db.get_quadrants(slice_id)).await
    }

    /// Merge `quadrants` into the stored ones, derive new trace items and
    /// seed the control table if it is empty.
    pub async fn set_quadrants(
        &self,
        slice_id: i64,
        quadrants: Quadrants,
        actor: Actor,
    ) -> Result<QuadrantsUpdate> {
        let mut merged = self.quadrants(slice_id).await?.unwrap_or_default();
        merged.merge(quadrants);
        if merged.is_empty() {
            bail!("At least one quadrant must be set");
        }
        let traces = derive_trace_items(&merged);
        let controls = derive_control_items(&merged);
        let stored = merged.clone();
        let (traces_added, controls_added) = self
            .db
            .call(move |db| db.save_quadrants(slice_id, &stored, &traces, &controls))
            .await?;
        self.audit
            .record(
                NewAuditEntry::slice(actor, "slice.quadrants_set", slice_id).with_payload(json!({
                    "quadrants": merged,
                    "traces_added": traces_added,
                    "controls_added": controls_added,
                })),
            )
            .await?;
        tracing::info!(slice_id, traces_added, controls_added, "quadrants set");
        Ok(QuadrantsUpdate {
            traces_added,
            controls_added,
        })
    }

    /// Map a successful agent Run's artifacts and audit the worktree.
    /// `None` when the slice has no quadrants.
    pub async fn record_run(
        &self,
        slice: &Slice,
        run: &Run,
        worktree: &Path,
    ) -> Result<Option<CoverageReport>> {
        let slice_id = slice.id;
        let (quadrants, mut items) = self
            .db
            .call(move |db| Ok((db.get_quadrants(slice_id)?, db.list_trace_items(slice_id)?)))
            .await?;
        if quadrants.is_none_or(|q| q.is_empty()) {
            return Ok(None);
        }

        map_artifacts(&mut items, &run.artifacts, run.commit_sha.as_deref());
        let root = worktree.to_path_buf();
        let (items, findings) = tokio::task::spawn_blocking(move || {
            let findings = audit_items(&root, &mut items);
            (items, findings)
        })
        .await?;
        let report = coverage_report(slice_id, Some(run.id), findings);
        let report = self
            .db
            .call(move |db| db.record_trace_audit(&items, &report))
            .await?;

        self.audit
            .record_best_effort(
                NewAuditEntry::slice(Actor::system(), "trace.audited", slice_id).with_payload(
                    json!({
                        "run_id": run.id,
                        "report_id": report.id,
                        "total": report.total,
                        "passed": report.passed,
                        "failed": report.failed,
                        "coverage": report.coverage,
                    }),
                ),
            )
            .await;
        tracing::debug!(
            slice_id,
            run_id = run.id,
            passed = report.passed,
            total = report.total,
            "trace audit recorded"
        );
        Ok(Some(report))
    }

    pub async fn set_control_status(
        &self,
        slice_id: i64,
        item_id: i64,
        status: ControlStatus,
        user: &str,
    ) -> Result<ControlItem> {
        let by = user.to_string();
        let item = self
            .db
            .call(move |db| db.set_control_status(slice_id, item_id, status, &by))
            .await?;
        self.audit
            .record(
                NewAuditEntry::slice(Actor::human(user), "control.updated", slice_id).with_payload(
                    json!({
                        "item_id": item.id,
                        "layer": item.layer.as_str(),
                        "item": item.item,
                        "status": status.as_str(),
                    }),
                ),
            )
            .await?;
        Ok(item)
    }

    pub async fn overview(&self, slice_id: i64) -> Result<TraceOverview> {
        let (quadrants, items, report, controls) = self
            .db
            .call(move |db| {
                db.get_slice(slice_id)?;
                Ok((
                    db.get_quadrants(slice_id)?,
                    db.list_trace_items(slice_id)?,
                    db.latest_coverage_report(slice_id)?,
                    db.list_control_items(slice_id)?,
                ))
            })
            .await?;
        let summary = summarize_controls(&controls);
        Ok(TraceOverview {
            quadrants,
            items,
            report,
            controls,
            summary,
        })
    }
}
