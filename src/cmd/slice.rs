//! Slice commands: create, list, show, the human events and the
//! four-quadrant requirement views.

use anyhow::{Result, bail};
use console::style;
use serde_json::json;
use std::path::Path;

use super::{human, load_config};
use crate::{Cli, QuadrantArgs, SliceCommands};
use sliceforge::audit::{AuditLog, NewAuditEntry};
use sliceforge::engine::Engine;
use sliceforge::engine::models::{
    AcceptanceCriterion, ControlStatus, NewSlice, Quadrants, RiskLevel, Slice, SliceState,
    TraceStatus,
};
use sliceforge::engine::open_db;
use sliceforge::engine::state_machine::Event;
use sliceforge::engine::traceability::{Traceability, TraceOverview};

/// Parse `CODE:text` or `CODE:text:verification`.
fn parse_criterion(raw: &str) -> Result<AcceptanceCriterion> {
    let mut parts = raw.splitn(3, ':');
    let code = parts.next().unwrap_or_default().trim();
    let text = parts.next().unwrap_or_default().trim();
    if code.is_empty() || text.is_empty() {
        bail!(
            "Invalid acceptance criterion '{}'; expected CODE:text[:verification]",
            raw
        );
    }
    Ok(AcceptanceCriterion {
        code: code.to_string(),
        text: text.to_string(),
        verification: parts.next().unwrap_or_default().trim().to_string(),
    })
}

fn quadrants_from(args: QuadrantArgs) -> Quadrants {
    Quadrants {
        functional_core: args.functional,
        physical_constraints: args.physical,
        semantic_contract: args.semantic,
        exceptions: args.exceptions,
    }
}

fn print_quadrants(quadrants: &Quadrants) {
    for (name, text) in [
        ("functional core", &quadrants.functional_core),
        ("physical constraints", &quadrants.physical_constraints),
        ("semantic contract", &quadrants.semantic_contract),
        ("exceptions", &quadrants.exceptions),
    ] {
        println!("  {}:", style(name).bold());
        if text.trim().is_empty() {
            println!("    {}", style("(unspecified)").dim());
        }
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            println!("    {}", line.trim());
        }
    }
}

fn trace_style(status: TraceStatus) -> console::StyledObject<&'static str> {
    let s = style(status.as_str());
    match status {
        TraceStatus::Compliant => s.green(),
        TraceStatus::NonCompliant => s.red(),
        TraceStatus::NeedsAudit => s.yellow(),
        TraceStatus::Pending => s.dim(),
    }
}

fn print_trace(slice_id: i64, overview: &TraceOverview) {
    if overview.quadrants.is_none() {
        println!("Slice {} has no four-quadrant requirements.", slice_id);
        return;
    }
    println!("Trace items for slice {}:", style(slice_id).bold());
    for item in &overview.items {
        println!(
            "  {:<7} {:<13} {}",
            item.code,
            trace_style(item.status),
            item.text
        );
        if !item.target_files.is_empty() {
            println!("          {}", style(item.target_files.join(", ")).dim());
        }
    }
    if let Some(report) = &overview.report {
        println!();
        println!(
            "Latest audit (run #{}): {}/{} passed, coverage {:.1}%",
            report.run_id.map(|id| id.to_string()).unwrap_or_else(|| "-".into()),
            report.passed,
            report.total,
            report.coverage
        );
        for finding in report.findings.iter().filter(|f| !f.passed) {
            println!("  {} {}: {}", style("✗").red(), finding.code, finding.note);
        }
    }
    if !overview.controls.is_empty() {
        println!();
        println!(
            "Control table: {} items, coverage {:.1}%",
            overview.summary.total, overview.summary.coverage
        );
        for item in &overview.controls {
            println!(
                "  #{:<4} {:<10} {:<9} {}",
                item.id,
                item.layer.as_str(),
                item.status.as_str(),
                item.item
            );
        }
    }
}

fn state_style(state: SliceState) -> console::StyledObject<&'static str> {
    let s = style(state.as_str());
    match state {
        SliceState::CiPassed => s.green(),
        SliceState::CiFailed => s.red(),
        SliceState::Abandoned => s.dim(),
        _ => s.cyan(),
    }
}

fn print_slice(slice: &Slice) {
    println!("Slice {}: {}", style(slice.id).bold(), slice.title);
    println!("  state:   {}", state_style(slice.state));
    if let Some(step) = slice.failed_step {
        println!("  failed:  {}", step);
    }
    println!("  project: {}", slice.project_id);
    println!("  branch:  {}", slice.branch_name);
    println!("  risk:    {}", slice.risk_level.as_str());
    println!("  version: {}", slice.version);
    if !slice.scope.is_empty() {
        println!("  scope:   {}", slice.scope);
    }
    if !slice.out_of_scope.is_empty() {
        println!("  out of scope: {}", slice.out_of_scope);
    }
    if let Some(url) = &slice.pr_url {
        println!("  PR:      {}", url);
    }
    if !slice.acceptance.is_empty() {
        println!("  acceptance:");
        for ac in &slice.acceptance {
            println!("    [{}] {}", ac.code, ac.text);
        }
    }
}

pub async fn cmd_slice(project_dir: &Path, cli: &Cli, command: &SliceCommands) -> Result<()> {
    let config = load_config(project_dir)?;

    match command.clone() {
        SliceCommands::Create {
            project,
            title,
            scope,
            out_of_scope,
            risk,
            acceptance,
            quadrants,
        } => {
            let risk_level: RiskLevel = risk.parse().map_err(anyhow::Error::msg)?;
            let acceptance = acceptance
                .iter()
                .map(|raw| parse_criterion(raw))
                .collect::<Result<Vec<_>>>()?;
            if title.trim().is_empty() {
                bail!("Slice title must not be empty");
            }
            let db = open_db(&config)?;
            let new = NewSlice {
                project_id: project,
                title,
                scope,
                out_of_scope,
                risk_level,
                acceptance,
            };
            let slice = db.call(move |db| db.create_slice(&new)).await?;
            let audit = AuditLog::new(db.clone());
            audit
                .record(
                    NewAuditEntry::slice(human(cli), "slice.created", slice.id).with_payload(
                        json!({
                            "project_id": slice.project_id,
                            "title": slice.title,
                            "branch": slice.branch_name,
                        }),
                    ),
                )
                .await?;
            println!(
                "Created slice {} on branch {}",
                style(slice.id).bold(),
                slice.branch_name
            );
            let quadrants = quadrants_from(quadrants);
            if !quadrants.is_empty() {
                let update = Traceability::new(db, audit)
                    .set_quadrants(slice.id, quadrants, human(cli))
                    .await?;
                println!(
                    "Recorded quadrants: {} trace items, {} control items",
                    update.traces_added, update.controls_added
                );
            }
        }
        SliceCommands::List { project } => {
            let db = open_db(&config)?;
            let slices = db.call(move |db| db.list_slices(project)).await?;
            if slices.is_empty() {
                println!("No slices.");
            }
            for s in slices {
                println!(
                    "{:>4}  {:<14} {:<40} {}",
                    s.id,
                    state_style(s.state),
                    s.title,
                    style(&s.branch_name).dim()
                );
            }
        }
        SliceCommands::Show { id } => {
            let db = open_db(&config)?;
            let (slice, runs, gates) = db
                .call(move |db| {
                    Ok((db.get_slice(id)?, db.list_runs(id)?, db.latest_gate_run(id)?))
                })
                .await?;
            print_slice(&slice);
            if !runs.is_empty() {
                println!();
                println!("Runs:");
                for run in &runs {
                    println!(
                        "  #{:<4} {:<10} {:<10} attempts={} {}",
                        run.id,
                        run.kind.as_str(),
                        run.status.as_str(),
                        run.attempts,
                        run.error.as_deref().unwrap_or("")
                    );
                }
            }
            if let Some((run, results)) = gates {
                println!();
                println!("Latest gates (run #{}):", run.id);
                for r in results {
                    let status = match r.failure {
                        None => style("passed".to_string()).green(),
                        Some(f) => style(f.as_str().to_string()).red(),
                    };
                    println!("  {:<12} {}", r.name, status);
                }
            }
        }
        SliceCommands::Abandon { id } => {
            if !cli.yes {
                let confirm = dialoguer::Confirm::new()
                    .with_prompt(format!("Abandon slice {}? This cannot be undone.", id))
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if !confirm {
                    println!("Abandon cancelled");
                    return Ok(());
                }
            }
            let engine = Engine::open(&config, cli.operator())?;
            let user = cli.operator().unwrap_or_else(|| "operator".to_string());
            let slice = engine
                .scheduler()
                .human_event(id, Event::Abandon, &user)
                .await?;
            println!("Slice {} is {}", slice.id, state_style(slice.state));
        }
        SliceCommands::Remediate { id } => {
            let engine = Engine::open(&config, cli.operator())?;
            let user = cli.operator().unwrap_or_else(|| "operator".to_string());
            let slice = engine
                .scheduler()
                .human_event(id, Event::Remediate, &user)
                .await?;
            println!(
                "Slice {} re-entered {}",
                slice.id,
                state_style(slice.state)
            );
        }
        SliceCommands::Quadrants { id, quadrants } => {
            let db = open_db(&config)?;
            let trace = Traceability::new(db.clone(), AuditLog::new(db.clone()));
            let quadrants = quadrants_from(quadrants);
            if !quadrants.is_empty() {
                let update = trace.set_quadrants(id, quadrants, human(cli)).await?;
                println!(
                    "Updated quadrants of slice {}: {} new trace items, {} control items",
                    id, update.traces_added, update.controls_added
                );
            }
            let slice = db.call(move |db| db.get_slice(id)).await?;
            match trace.quadrants(id).await? {
                Some(stored) => {
                    println!("Quadrants of slice {}: {}", style(slice.id).bold(), slice.title);
                    print_quadrants(&stored);
                }
                None => println!("Slice {} has no four-quadrant requirements.", slice.id),
            }
        }
        SliceCommands::Trace { id } => {
            let db = open_db(&config)?;
            let overview = Traceability::new(db.clone(), AuditLog::new(db))
                .overview(id)
                .await?;
            print_trace(id, &overview);
        }
        SliceCommands::Control { id, item, status } => {
            let status: ControlStatus = status.parse().map_err(anyhow::Error::msg)?;
            let db = open_db(&config)?;
            let user = cli.operator().unwrap_or_else(|| "operator".to_string());
            let updated = Traceability::new(db.clone(), AuditLog::new(db))
                .set_control_status(id, item, status, &user)
                .await?;
            println!(
                "Control #{} ({}) is {}",
                updated.id,
                updated.item,
                updated.status.as_str()
            );
        }
    }
    Ok(())
}
