//! CLI command implementations.
//!
//! | Module      | Commands handled                          |
//! |-------------|-------------------------------------------|
//! | `project`   | `Init`                                    |
//! | `run`       | `Run`                                     |
//! | `status`    | `Status`, `Logs`, `Ports`                 |
//! | `lifecycle` | `Integrate`, `Cleanup`, `Rollback`, `Sweep` |

pub mod lifecycle;
pub mod project;
pub mod run;
pub mod status;

use anyhow::Result;
use serde::Serialize;

use refsmith::Engine;
use refsmith::config::EngineConfig;
use refsmith::init::is_initialized;

pub use lifecycle::{cmd_cleanup, cmd_integrate, cmd_rollback, cmd_sweep};
pub use project::cmd_init;
pub use run::{RunRequest, cmd_run};
pub use status::{cmd_logs, cmd_ports, cmd_status};

/// Open the engine for an initialized project.
fn open_engine(config: EngineConfig) -> Result<Engine> {
    if !is_initialized(&config.project_dir) {
        anyhow::bail!(
            "No refsmith project at {}. Run 'refsmith init' first.",
            config.project_dir.display()
        );
    }
    Engine::open(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
