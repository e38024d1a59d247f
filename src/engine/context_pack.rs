//! Context bundle handed to the generation capability for a step.

use std::path::Path;

use anyhow::{Context, Result};
use git2::{Repository, Sort};
use serde::Serialize;
use walkdir::WalkDir;

use super::acl::PathAcl;
use super::models::{AcceptanceCriterion, Quadrants, Role, Slice};
use crate::config::GateSpec;

/// Documents every role sees when they exist.
pub const WELL_KNOWN_DOCS: [&str; 5] = [
    "README.md",
    "docs/PRD.md",
    "docs/DESIGN.md",
    "docs/ACCEPTANCE.md",
    "contracts/openapi.yaml",
];

const EXCERPT_LINES: usize = 200;
const RECENT_COMMITS: usize = 20;
const MAX_PREFIX_FILES: usize = 40;

#[derive(Debug, Clone, Serialize)]
pub struct FileExcerpt {
    pub path: String,
    pub content: String,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SliceSummary {
    pub id: i64,
    pub title: String,
    pub scope: String,
    pub out_of_scope: String,
    pub risk_level: String,
    pub branch: String,
    pub acceptance: Vec<AcceptanceCriterion>,
}

impl From<&Slice> for SliceSummary {
    fn from(slice: &Slice) -> Self {
        Self {
            id: slice.id,
            title: slice.title.clone(),
            scope: slice.scope.clone(),
            out_of_scope: slice.out_of_scope.clone(),
            risk_level: slice.risk_level.as_str().to_string(),
            branch: slice.branch_name.clone(),
            acceptance: slice.acceptance.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextBundle {
    pub slice: SliceSummary,
    pub role: Option<Role>,
    pub allowed_prefixes: Vec<String>,
    pub files: Vec<FileExcerpt>,
    pub recent_commits: Vec<String>,
    pub suggested_commands: Vec<String>,
    /// Present only for slices that carry four-quadrant requirements.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quadrants: Option<Quadrants>,
}

impl ContextBundle {
    pub fn with_quadrants(mut self, quadrants: Option<Quadrants>) -> Self {
        self.quadrants = quadrants.filter(|q| !q.is_empty());
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// First `EXCERPT_LINES` lines of a UTF-8 file. Binary files yield `None`.
fn excerpt(root: &Path, rel: &str) -> Option<FileExcerpt> {
    let bytes = std::fs::read(root.join(rel)).ok()?;
    let text = String::from_utf8(bytes).ok()?;
    let total = text.lines().count();
    let content = text
        .lines()
        .take(EXCERPT_LINES)
        .collect::<Vec<_>>()
        .join("\n");
    Some(FileExcerpt {
        path: rel.to_string(),
        content,
        truncated: total > EXCERPT_LINES,
    })
}

/// Files under a role's prefixes, sorted, capped.
fn prefix_files(root: &Path, prefixes: &[String]) -> Vec<String> {
    let mut out = Vec::new();
    for prefix in prefixes {
        let dir = root.join(prefix.trim_end_matches('/'));
        if !dir.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&dir)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
        {
            if let Ok(rel) = entry.path().strip_prefix(root) {
                let rel = rel.to_string_lossy().replace('\\', "/");
                if !out.contains(&rel) {
                    out.push(rel);
                }
            }
            if out.len() >= MAX_PREFIX_FILES {
                return out;
            }
        }
    }
    out
}

/// Subjects of the most recent commits reachable from HEAD.
pub fn recent_commits(root: &Path, limit: usize) -> Result<Vec<String>> {
    let repo = Repository::open(root)
        .with_context(|| format!("Failed to open git repository at {}", root.display()))?;
    let mut walk = repo.revwalk()?;
    if walk.push_head().is_err() {
        // Unborn branch.
        return Ok(Vec::new());
    }
    walk.set_sorting(Sort::TIME)?;
    let mut subjects = Vec::new();
    for oid in walk.take(limit) {
        let commit = repo.find_commit(oid?)?;
        let short = &commit.id().to_string()[..8];
        subjects.push(format!("{} {}", short, commit.summary().unwrap_or("")));
    }
    Ok(subjects)
}

/// Assemble the bundle from a checkout at `root`.
pub fn build_context_pack(
    root: &Path,
    slice: &Slice,
    role: Option<Role>,
    acl: &PathAcl,
    gates: &[GateSpec],
) -> Result<ContextBundle> {
    let mut files: Vec<FileExcerpt> = WELL_KNOWN_DOCS
        .iter()
        .filter_map(|doc| excerpt(root, doc))
        .collect();

    let allowed_prefixes = role.map(|r| acl.prefixes(r).to_vec()).unwrap_or_default();
    for rel in prefix_files(root, &allowed_prefixes) {
        if files.iter().any(|f| f.path == rel) {
            continue;
        }
        if let Some(ex) = excerpt(root, &rel) {
            files.push(ex);
        }
    }

    let recent_commits = recent_commits(root, RECENT_COMMITS)?;

    Ok(ContextBundle {
        slice: SliceSummary::from(slice),
        role,
        allowed_prefixes,
        files,
        recent_commits,
        suggested_commands: gates.iter().map(|g| g.command.clone()).collect(),
        quadrants: None,
    })
}
