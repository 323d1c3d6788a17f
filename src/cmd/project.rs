//! Project initialization command.

use anyhow::Result;
use std::path::Path;

pub fn cmd_init(project_dir: &Path, refs: &[String]) -> Result<()> {
    use refsmith::init::init_project;

    let result = init_project(project_dir, refs)?;

    if result.created {
        println!(
            "Initialized refsmith project at {}",
            result.data_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  refs/              # canonical ref repositories");
        println!("  .refsmith/");
        println!("  ├── refsmith.toml  # configuration");
        println!("  ├── refsmith.db    # execution state");
        println!("  ├── logs/");
        println!("  └── workspaces/    # per-execution worktrees");
    } else {
        println!(
            "refsmith project already initialized at {}",
            result.data_dir.display()
        );
    }

    for ref_id in &result.refs_created {
        println!("Created ref {}", ref_id);
    }
    if result.created {
        println!();
        println!("Next steps:");
        println!("  refsmith run --write <REF> -- <agent command>");
    }
    Ok(())
}
