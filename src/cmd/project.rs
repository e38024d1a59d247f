//! Initialization and project management commands.

use anyhow::{Result, bail};
use console::style;
use serde_json::json;
use std::path::Path;

use super::{human, load_config};
use crate::{Cli, ProjectCommands};
use sliceforge::audit::{AuditLog, NewAuditEntry, SubjectKind};
use sliceforge::config::{Config, SliceforgeToml};
use sliceforge::engine::models::MemberRole;
use sliceforge::engine::open_db;
use sliceforge::errors::SliceError;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    let config = Config::load(project_dir)?;
    let was_initialized = config.is_initialized();

    std::fs::create_dir_all(&config.state_dir)?;
    if !was_initialized {
        SliceforgeToml::default().save(&config.config_path())?;
    }
    open_db(&config)?;
    std::fs::create_dir_all(config.workspace_dir())?;

    if was_initialized {
        println!(
            "sliceforge already initialized at {}",
            config.state_dir.display()
        );
        println!("Database and workspace verified.");
    } else {
        println!("Initialized sliceforge at {}", config.state_dir.display());
        println!();
        println!("  .sliceforge/");
        println!("  ├── sliceforge.toml   # roles, gates, scheduler, llm, github");
        println!("  ├── sliceforge.db     # projects, slices, runs, audit log");
        println!("  └── workspace/        # repository clones and slice worktrees");
        println!();
        println!("Next steps:");
        println!("  1. sliceforge project add <name> <repo-url>");
        println!("  2. sliceforge slice create <project> <title>");
        println!("  3. sliceforge run");
    }
    Ok(())
}

pub async fn cmd_project(project_dir: &Path, cli: &Cli, command: &ProjectCommands) -> Result<()> {
    let config = load_config(project_dir)?;
    let db = open_db(&config)?;
    let audit = AuditLog::new(db.clone());

    match command.clone() {
        ProjectCommands::Add {
            name,
            repo_url,
            default_branch,
            github_repo,
        } => {
            let operator = cli.operator();
            let project = db
                .call(move |db| {
                    let project = db.create_project(
                        &name,
                        &repo_url,
                        &default_branch,
                        github_repo.as_deref(),
                    )?;
                    if let Some(user) = &operator {
                        db.upsert_member(project.id, user, MemberRole::Owner)?;
                    }
                    Ok(project)
                })
                .await?;
            audit
                .record(
                    NewAuditEntry::new(
                        human(cli),
                        "project.created",
                        SubjectKind::Project,
                        project.id,
                    )
                    .with_payload(json!({
                        "name": project.name,
                        "repo_url": project.repo_url,
                        "default_branch": project.default_branch,
                    })),
                )
                .await?;
            println!(
                "Created project {} ({})",
                style(project.id).bold(),
                project.name
            );
        }
        ProjectCommands::List => {
            let projects = db.call(|db| db.list_projects()).await?;
            if projects.is_empty() {
                println!("No projects.");
            }
            for p in projects {
                println!(
                    "{:>4}  {:<20} {}  ({})",
                    p.id,
                    p.name,
                    p.repo_url,
                    style(&p.default_branch).dim()
                );
            }
        }
        ProjectCommands::Remove { id } => {
            if !cli.yes {
                let confirm = dialoguer::Confirm::new()
                    .with_prompt(format!("Remove project {} and its finished slices?", id))
                    .default(false)
                    .interact()
                    .unwrap_or(false);
                if !confirm {
                    println!("Removal cancelled");
                    return Ok(());
                }
            }
            db.call(move |db| db.delete_project(id)).await?;
            audit
                .record(NewAuditEntry::new(
                    human(cli),
                    "project.deleted",
                    SubjectKind::Project,
                    id,
                ))
                .await?;
            println!("Removed project {}", id);
        }
        ProjectCommands::Member {
            project,
            user_id,
            role,
        } => {
            let role: MemberRole = role.parse().map_err(anyhow::Error::msg)?;
            let operator = cli.operator();
            let member = db
                .call(move |db| {
                    db.get_project(project)?;
                    let owners = db
                        .list_members(project)?
                        .into_iter()
                        .filter(|m| m.role == MemberRole::Owner)
                        .count();
                    // A project without owners accepts its first one from anyone.
                    if owners > 0 {
                        let user = operator.unwrap_or_default();
                        if db.member_role(project, &user)? != Some(MemberRole::Owner) {
                            return Err(SliceError::Unauthorized {
                                user,
                                project_id: project,
                            }
                            .into());
                        }
                    } else if role != MemberRole::Owner {
                        bail!("Project {} has no owner yet; add an owner first", project);
                    }
                    db.upsert_member(project, &user_id, role)
                })
                .await?;
            audit
                .record(
                    NewAuditEntry::new(
                        human(cli),
                        "project.member_set",
                        SubjectKind::Project,
                        project,
                    )
                    .with_payload(json!({"user_id": member.user_id, "role": member.role.as_str()})),
                )
                .await?;
            println!(
                "{} is now {} of project {}",
                member.user_id,
                member.role.as_str(),
                project
            );
        }
    }
    Ok(())
}
