//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module    | Commands handled                         |
//! |-----------|------------------------------------------|
//! | `project` | `Init`, `Project`                        |
//! | `config`  | `Config`                                 |
//! | `slice`   | `Slice`                                  |
//! | `run`     | `Step`, `Run`, `Publish`, `Reconcile`    |
//! | `audit`   | `Audit`                                  |
//! | `llm`     | `Llm`                                    |

pub mod audit;
pub mod config;
pub mod llm;
pub mod project;
pub mod run;
pub mod slice;

pub use audit::cmd_audit;
pub use config::cmd_config;
pub use llm::cmd_llm;
pub use project::{cmd_init, cmd_project};
pub use run::{cmd_publish, cmd_reconcile, cmd_run, cmd_step};
pub use slice::cmd_slice;

use anyhow::{Result, bail};
use std::path::Path;

use sliceforge::audit::Actor;
use sliceforge::config::Config;

/// Load configuration for a directory that has been initialized.
pub(crate) fn load_config(project_dir: &Path) -> Result<Config> {
    let config = Config::load(project_dir)?;
    if !config.is_initialized() {
        bail!(
            "Not a sliceforge project: {} is missing. Run `sliceforge init` first.",
            config.config_path().display()
        );
    }
    Ok(config)
}

/// Audit actor for the acting user.
pub(crate) fn human(cli: &crate::Cli) -> Actor {
    Actor::human(cli.operator().as_deref().unwrap_or("operator"))
}
