//! Configuration view and validation commands, `sliceforge config`.

use anyhow::Result;
use std::path::Path;

use crate::ConfigCommands;
use sliceforge::config::{Config, SliceforgeToml};
use sliceforge::engine::llm::mask_api_key;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = Config::load(project_dir)?;
    let config_path = config.config_path();

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("sliceforge configuration");
            println!("========================");
            println!();
            if config.is_initialized() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No sliceforge.toml at {}; showing defaults.", config_path.display());
            }
            println!();

            let file = &config.file;
            println!("[workspace]");
            println!("  dir = {}", config.workspace_dir().display());
            println!("[database]");
            println!("  path = {}", config.db_path().display());
            println!();

            println!("[roles]");
            for (role, prefixes) in &file.roles {
                println!("  {} = {:?}", role, prefixes);
            }
            println!();

            for gate in &file.gates {
                println!("[[gates]]");
                println!("  name = \"{}\"", gate.name);
                println!("  command = \"{}\"", gate.command);
                println!("  timeout_secs = {}", gate.timeout_secs);
            }
            println!();

            println!("[scheduler]");
            println!("  max_workers = {}", file.scheduler.max_workers);
            println!("[agent]");
            println!("  max_attempts = {}", file.agent.max_attempts);
            println!("  base_delay_ms = {}", file.agent.base_delay_ms);
            println!("  max_delay_ms = {}", file.agent.max_delay_ms);
            println!("  request_timeout_secs = {}", file.agent.request_timeout_secs);
            println!();

            println!("[llm]  (with environment overrides)");
            println!("  provider = \"{}\"", file.llm.provider);
            println!("  base_url = \"{}\"", file.llm.base_url);
            println!("  model = \"{}\"", file.llm.model);
            println!("  api_key = \"{}\"", mask_api_key(&file.llm.api_key));
            println!("[github]");
            println!("  api_url = \"{}\"", file.github.api_url);
            println!(
                "  token = {}",
                if file.github.token.is_some() { "set" } else { "not set" }
            );
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let mut file = if config_path.exists() {
                SliceforgeToml::load(&config_path)?
            } else {
                println!("No sliceforge.toml found. Checking defaults.");
                SliceforgeToml::default()
            };
            // Environment overrides count toward completeness.
            file.apply_env(|key| std::env::var(key).ok());
            let warnings = file.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("sliceforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }
            std::fs::create_dir_all(&config.state_dir)?;
            SliceforgeToml::default().save(&config_path)?;

            println!("Created sliceforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [roles] path prefixes per agent role");
            println!("  - [[gates]] quality checks and their timeouts");
            println!("  - [llm] and [github] endpoints");
            println!();
        }
    }

    Ok(())
}
