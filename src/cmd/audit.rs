//! Audit log inspection, `sliceforge audit`.

use anyhow::Result;
use console::style;
use std::path::Path;

use super::load_config;
use crate::{AuditCommands, SubjectArgs};
use sliceforge::audit::{AuditLog, SubjectKind};
use sliceforge::engine::open_db;

fn subject(args: &SubjectArgs) -> Option<(SubjectKind, i64)> {
    args.project
        .map(|id| (SubjectKind::Project, id))
        .or(args.slice.map(|id| (SubjectKind::Slice, id)))
        .or(args.run.map(|id| (SubjectKind::Run, id)))
}

pub async fn cmd_audit(project_dir: &Path, command: &AuditCommands) -> Result<()> {
    let config = load_config(project_dir)?;
    let audit = AuditLog::new(open_db(&config)?);

    match command {
        AuditCommands::Show { subject: args } => {
            let entries = audit.entries(subject(args)).await?;
            if entries.is_empty() {
                println!("No audit entries.");
            }
            for e in entries {
                let action = if e.payload.get("security").and_then(|v| v.as_bool()) == Some(true) {
                    style(e.action.clone()).red().bold()
                } else {
                    style(e.action.clone()).bold()
                };
                println!(
                    "{}  {:<18} {:<28} {} {}",
                    style(e.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
                    format!("{}:{}", e.actor_kind.as_str(), e.actor_id),
                    action,
                    e.subject_kind.as_str(),
                    e.subject_id
                );
                if !e.payload.is_null() {
                    println!("    {}", style(e.payload.to_string()).dim());
                }
            }
        }
        AuditCommands::Export {
            output,
            subject: args,
        } => {
            let count = audit.export(output, subject(args)).await?;
            println!("Exported {} audit entries to {}", count, output.display());
        }
    }
    Ok(())
}
