//! Execution commands: `step`, `run`, `publish`, `reconcile`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::{human, load_config};
use crate::Cli;
use sliceforge::engine::Engine;
use sliceforge::engine::models::RunStatus;
use sliceforge::engine::pipeline::StepSummary;

fn print_step(slice_id: i64, summary: &StepSummary) {
    let status = match summary.run.status {
        RunStatus::Success => style(summary.run.status.as_str()).green(),
        RunStatus::Cancelled => style(summary.run.status.as_str()).yellow(),
        _ => style(summary.run.status.as_str()).red(),
    };
    let parked = if summary.advanced { "" } else { " (parked)" };
    println!(
        "slice {:>4}  {:<10} run #{:<5} {} → {}{}",
        slice_id,
        summary.step.as_str(),
        summary.run.id,
        status,
        summary.slice.state,
        parked
    );
    if let Some(err) = &summary.run.error {
        println!("            {}", style(err).dim());
    }
}

pub async fn cmd_step(project_dir: &Path, cli: &Cli, slice_id: i64) -> Result<()> {
    let config = load_config(project_dir)?;
    let engine = Engine::open(&config, cli.operator())?;
    let scheduler = engine.scheduler();
    match scheduler.run_step(slice_id).await? {
        Some(summary) => print_step(slice_id, &summary),
        None => println!("Slice {} has no step due", slice_id),
    }
    Ok(())
}

pub async fn cmd_run(project_dir: &Path, cli: &Cli, slices: &[i64], publish: bool) -> Result<()> {
    let config = load_config(project_dir)?;
    let engine = Engine::open(&config, cli.operator())?;
    let mut scheduler = engine.scheduler();
    if publish {
        scheduler = scheduler.with_publisher(Arc::new(engine.publisher()?));
    }
    let scheduler = Arc::new(scheduler);

    let reconciled = scheduler.reconcile().await?;
    if !reconciled.is_empty() {
        println!(
            "{}",
            style(format!("Reconciled {} interrupted run(s)", reconciled.len())).yellow()
        );
    }

    let ids: Vec<i64> = if slices.is_empty() {
        engine
            .db
            .call(|db| db.list_slices(None))
            .await?
            .into_iter()
            .filter(|s| s.state.is_active())
            .map(|s| s.id)
            .collect()
    } else {
        slices.to_vec()
    };
    if ids.is_empty() {
        println!("No slices with a step due.");
        return Ok(());
    }

    println!(
        "{}",
        style(format!(
            "Driving {} slice(s) with {} worker(s)",
            ids.len(),
            scheduler.max_workers()
        ))
        .bold()
        .cyan()
    );

    let ctrl_c = {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("Cancelling in-flight steps...");
                scheduler.shutdown();
            }
        })
    };
    let progress = scheduler.run_slices(&ids).await;
    ctrl_c.abort();

    let mut failed = 0;
    for p in &progress {
        for summary in &p.steps {
            print_step(p.slice_id, summary);
        }
        if let Some(pr) = &p.pr {
            println!("slice {:>4}  PR #{} {}", p.slice_id, pr.number, pr.url);
        }
        if let Some(err) = &p.error {
            failed += 1;
            println!("slice {:>4}  {}", p.slice_id, style(err).red());
        }
    }
    if failed > 0 {
        anyhow::bail!("{} slice(s) stopped with an error", failed);
    }
    Ok(())
}

pub async fn cmd_publish(project_dir: &Path, cli: &Cli, slice_id: i64) -> Result<()> {
    let config = load_config(project_dir)?;
    let engine = Engine::open(&config, cli.operator())?;
    let scheduler = engine
        .scheduler()
        .with_publisher(Arc::new(engine.publisher()?));
    let pr = scheduler.publish(slice_id, human(cli)).await?;
    let verb = if pr.created { "Opened" } else { "Updated" };
    println!("{} PR #{}: {}", verb, pr.number, pr.url);
    Ok(())
}

pub async fn cmd_reconcile(project_dir: &Path, cli: &Cli) -> Result<()> {
    let config = load_config(project_dir)?;
    let engine = Engine::open(&config, cli.operator())?;
    let reconciled = engine.scheduler().reconcile().await?;
    if reconciled.is_empty() {
        println!("No interrupted runs.");
    }
    for run in reconciled {
        println!(
            "run #{} ({}, slice {}) marked error",
            run.id,
            run.kind.as_str(),
            run.slice_id
        );
    }
    Ok(())
}
