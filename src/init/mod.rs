//! `refsmith init`: lay out a project.
//!
//! ```text
//! <project>/
//! ├── refs/                  # canonical ref repositories
//! └── .refsmith/
//!     ├── refsmith.toml      # configuration (defaults written once)
//!     ├── refsmith.db        # engine database
//!     ├── logs/              # rolling log files
//!     └── workspaces/        # per-execution worktrees
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::{CONFIG_FILE, DATA_DIR, DEFAULT_CONFIG_TOML, EngineConfig};
use crate::db::EngineDb;
use crate::git::RefRepo;
use crate::models::validate_id;

/// Result of initializing a refsmith project.
#[derive(Debug)]
pub struct InitResult {
    pub data_dir: PathBuf,
    /// False when the data directory already existed.
    pub created: bool,
    /// Refs initialised by this call.
    pub refs_created: Vec<String>,
}

/// Create (or complete) the project layout and initialise the named refs.
/// Existing refs and an existing config file are left untouched.
pub fn init_project(project_dir: &Path, refs: &[String]) -> Result<InitResult> {
    let data_dir = project_dir.join(DATA_DIR);
    let created = !data_dir.exists();
    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("Failed to create directory: {}", data_dir.display()))?;

    let config_path = data_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        std::fs::write(&config_path, DEFAULT_CONFIG_TOML)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;
    }

    let config = EngineConfig::load(project_dir)?;
    for dir in [&config.refs.root, &config.workspaces.root, &config.logs_dir()] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    EngineDb::new(&config.db_path())?;

    let mut refs_created = Vec::new();
    for ref_id in refs {
        validate_id("ref_id", ref_id)?;
        let path = config.ref_path(ref_id);
        if path.join(".git").exists() {
            continue;
        }
        RefRepo::init(&path, &config.refs.mainline)
            .with_context(|| format!("Failed to initialise ref {}", ref_id))?;
        refs_created.push(ref_id.clone());
    }

    Ok(InitResult {
        data_dir,
        created,
        refs_created,
    })
}

pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(DATA_DIR).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_creates_layout() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path(), &[]).unwrap();

        assert!(result.created);
        assert_eq!(result.data_dir, dir.path().join(".refsmith"));
        assert!(result.data_dir.join("refsmith.toml").is_file());
        assert!(result.data_dir.join("refsmith.db").is_file());
        assert!(result.data_dir.join("logs").is_dir());
        assert!(result.data_dir.join("workspaces").is_dir());
        assert!(dir.path().join("refs").is_dir());
        assert!(is_initialized(dir.path()));
    }

    #[test]
    fn test_init_project_twice_keeps_config() {
        let dir = tempdir().unwrap();
        init_project(dir.path(), &[]).unwrap();
        let config_path = dir.path().join(".refsmith/refsmith.toml");
        std::fs::write(&config_path, "[refs]\nmainline = \"trunk\"\n").unwrap();

        let again = init_project(dir.path(), &[]).unwrap();
        assert!(!again.created);
        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("trunk"));
    }

    #[test]
    fn test_init_project_creates_refs_once() {
        let dir = tempdir().unwrap();
        let refs = vec!["app".to_string(), "docs".to_string()];
        let result = init_project(dir.path(), &refs).unwrap();
        assert_eq!(result.refs_created, refs);
        let repo = RefRepo::open(&dir.path().join("refs/app")).unwrap();
        assert!(repo.branch_tip("main").unwrap().is_some());

        let again = init_project(dir.path(), &refs).unwrap();
        assert!(again.refs_created.is_empty());
    }

    #[test]
    fn test_init_project_rejects_bad_ref_id() {
        let dir = tempdir().unwrap();
        assert!(init_project(dir.path(), &["../up".to_string()]).is_err());
    }
}
