//! Commands that change an execution after it ran: integrate, cleanup,
//! rollback and the orphan sweep.

use anyhow::Result;

use refsmith::cleanup::CleanupOptions;
use refsmith::config::EngineConfig;
use refsmith::integration::ProcessOptions;
use refsmith::models::MergeStrategy;

use super::{open_engine, print_json};

pub async fn cmd_integrate(
    config: EngineConfig,
    execution_id: &str,
    message: Option<String>,
    merge: bool,
    ff_only: bool,
    json: bool,
) -> Result<()> {
    let merge_strategy = if ff_only {
        MergeStrategy::FastForwardOnly
    } else {
        config.lifecycle.merge_strategy
    };
    let engine = open_engine(config)?;
    let report = engine
        .integration()
        .process_execution_changes(
            execution_id,
            ProcessOptions {
                commit_message: message,
                merge,
                merge_strategy,
            },
        )
        .await?;
    if json {
        return print_json(&report);
    }

    if report.commits.is_empty() {
        println!("Nothing to integrate for {}", execution_id);
        return Ok(());
    }
    for (ref_id, commit) in &report.commits {
        let hash = commit.hash.as_deref().unwrap_or("-");
        if commit.committed {
            println!("{:<20} committed {}", ref_id, &hash[..hash.len().min(10)]);
        } else {
            println!("{:<20} {}", ref_id, commit.message);
        }
        if let Some(sync) = report.merges.get(ref_id) {
            println!("{:<20} {}", "", sync.message);
        }
    }
    if report.needs_review {
        anyhow::bail!("Execution {} needs review: some refs could not be synced", execution_id);
    }
    Ok(())
}

pub async fn cmd_cleanup(
    config: EngineConfig,
    execution_id: &str,
    options: CleanupOptions,
    json: bool,
) -> Result<()> {
    let engine = open_engine(config)?;
    let outcome = engine.cleanup().cleanup_execution(execution_id, options).await?;
    if json {
        return print_json(&outcome);
    }
    println!(
        "Cleaned up {}: {} worktree(s) removed, {} branch(es) deleted",
        execution_id, outcome.worktrees_removed, outcome.branches_removed
    );
    for error in &outcome.errors {
        eprintln!("  {}", error);
    }
    if !outcome.success() {
        anyhow::bail!("Cleanup of {} was incomplete", execution_id);
    }
    Ok(())
}

pub async fn cmd_rollback(config: EngineConfig, execution_id: &str, reason: &str, json: bool) -> Result<()> {
    let engine = open_engine(config)?;
    let result = engine.cleanup().rollback_execution(execution_id, reason).await?;
    if json {
        print_json(&result)?;
    }
    match result.error {
        None => {
            if !json {
                println!("Rolled back {}", execution_id);
            }
            Ok(())
        }
        Some(error) => anyhow::bail!("Rollback of {} failed; branches restored: {}", execution_id, error),
    }
}

pub async fn cmd_sweep(config: EngineConfig, older_than_hours: Option<u64>, json: bool) -> Result<()> {
    let hours = older_than_hours.unwrap_or(config.lifecycle.orphan_age_hours);
    let engine = open_engine(config)?;
    let report = engine.cleanup().cleanup_orphaned_executions(hours).await?;
    if json {
        return print_json(&report);
    }
    println!(
        "Swept executions idle for more than {}h: {} examined, {} workspace(s) removed, {} skipped, {} error(s)",
        hours, report.examined, report.workspaces_removed, report.skipped, report.errors
    );
    Ok(())
}
