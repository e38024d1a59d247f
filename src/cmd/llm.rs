//! Generation endpoint settings, `sliceforge llm`.

use anyhow::{Context, Result, bail};
use console::style;
use serde_json::json;
use std::path::Path;

use super::{human, load_config};
use crate::{Cli, LlmCommands};
use sliceforge::audit::{AuditLog, NewAuditEntry, SubjectKind};
use sliceforge::engine::llm::{mask_api_key, probe_endpoint, resolve_llm_config};
use sliceforge::engine::models::{LlmSettings, MemberRole};
use sliceforge::engine::open_db;
use sliceforge::errors::SliceError;

fn print_layer(name: &str, layer: Option<&LlmSettings>) {
    match layer {
        Some(l) => println!(
            "  {:<8} {} {} key={} {}",
            name,
            if l.base_url.is_empty() { "-" } else { l.base_url.as_str() },
            if l.model.is_empty() { "-" } else { l.model.as_str() },
            if l.api_key.is_empty() {
                "-".to_string()
            } else {
                mask_api_key(&l.api_key)
            },
            if l.is_complete() {
                style("complete").green()
            } else {
                style("incomplete").dim()
            }
        ),
        None => println!("  {:<8} {}", name, style("not set").dim()),
    }
}

pub async fn cmd_llm(project_dir: &Path, cli: &Cli, command: &LlmCommands) -> Result<()> {
    let config = load_config(project_dir)?;
    let db = open_db(&config)?;
    let operator = cli.operator();

    match command.clone() {
        LlmCommands::Show { project } => {
            let user_id = operator.clone();
            let (user, proj) = db
                .call(move |db| {
                    let user = match &user_id {
                        Some(u) => db.user_llm_settings(u)?,
                        None => None,
                    };
                    let proj = match project {
                        Some(id) => db.project_llm_settings(id)?,
                        None => None,
                    };
                    Ok((user, proj))
                })
                .await?;
            let global = config.file.llm.settings();

            println!("LLM configuration layers (first complete wins):");
            print_layer("user", user.as_ref());
            if project.is_some() {
                print_layer("project", proj.as_ref());
            }
            print_layer("global", Some(&global));
            println!();
            match resolve_llm_config(user.as_ref(), proj.as_ref(), Some(&global)) {
                Some(resolved) => println!(
                    "Resolved: {} {} (source: {}, key {})",
                    resolved.base_url,
                    resolved.model,
                    resolved.source.as_str(),
                    mask_api_key(&resolved.api_key)
                ),
                None => println!("{}", style("No complete configuration; agent steps will park.").yellow()),
            }
        }
        LlmCommands::Set {
            project,
            base_url,
            model,
            api_key,
            provider,
            temperature,
            max_tokens,
            no_probe,
        } => {
            let api_key = api_key
                .or_else(|| std::env::var("LLM_API_KEY").ok())
                .filter(|k| !k.trim().is_empty())
                .context("An API key is required (--api-key or LLM_API_KEY)")?;
            let settings = LlmSettings {
                provider,
                base_url: base_url.trim().trim_end_matches('/').to_string(),
                api_key,
                model,
                temperature,
                max_tokens,
            };
            if !settings.is_complete() {
                bail!("base_url, model and api key are all required");
            }
            let user = operator
                .clone()
                .context("No acting user; pass --user or set SLICEFORGE_USER")?;

            if let Some(project_id) = project {
                let user = user.clone();
                db.call(move |db| {
                    db.get_project(project_id)?;
                    if db.member_role(project_id, &user)? != Some(MemberRole::Owner) {
                        return Err(SliceError::Unauthorized { user, project_id }.into());
                    }
                    Ok(())
                })
                .await?;
            }
            if !no_probe {
                probe_endpoint(&settings.base_url, &settings.api_key).await?;
            }

            let stored = settings.clone();
            let target_user = user.clone();
            db.call(move |db| match project {
                Some(id) => db.set_project_llm_settings(id, &stored),
                None => db.set_user_llm_settings(&target_user, &stored),
            })
            .await?;

            // Only project layers have an audit subject; user layers are logged.
            if let Some(project_id) = project {
                AuditLog::new(db)
                    .record(
                        NewAuditEntry::new(
                            human(cli),
                            "llm.configured",
                            SubjectKind::Project,
                            project_id,
                        )
                        .with_payload(json!({
                            "base_url": settings.base_url,
                            "model": settings.model,
                            "api_key": mask_api_key(&settings.api_key),
                        })),
                    )
                    .await?;
            } else {
                tracing::info!(user = %user, base_url = %settings.base_url, "user LLM layer stored");
            }
            println!(
                "Stored {} LLM configuration ({} {}, key {})",
                if project.is_some() { "project" } else { "user" },
                settings.base_url,
                settings.model,
                mask_api_key(&settings.api_key)
            );
        }
    }
    Ok(())
}
