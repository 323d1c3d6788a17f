//! Read-only views: executions, logs and port allocations.

use anyhow::Result;

use refsmith::config::EngineConfig;
use refsmith::models::{ExecutionStatus, LogStream};

use super::{open_engine, print_json};

pub async fn cmd_status(config: EngineConfig, execution_id: Option<&str>, json: bool) -> Result<()> {
    let engine = open_engine(config)?;

    let Some(execution_id) = execution_id else {
        let executions = engine.list_executions(&[]).await?;
        if json {
            return print_json(&executions);
        }
        if executions.is_empty() {
            println!("No executions.");
            return Ok(());
        }
        println!(
            "{:<38} {:<13} {:<12} Created",
            "Execution", "Status", "Agent"
        );
        for execution in &executions {
            println!(
                "{:<38} {:<13} {:<12} {}",
                execution.id, execution.status, execution.agent_type, execution.created_at
            );
        }
        let active = executions.iter().filter(|e| e.status.is_active()).count();
        let review = executions
            .iter()
            .filter(|e| e.status == ExecutionStatus::NeedsReview)
            .count();
        println!();
        println!(
            "{} executions ({} active, {} needing review)",
            executions.len(),
            active,
            review
        );
        return Ok(());
    };

    let execution = engine.get_execution(execution_id).await?;
    let integration = engine.integration().get_integration_status(execution_id).await?;
    let cleanup = engine.cleanup().get_cleanup_status(execution_id).await?;
    if json {
        return print_json(&serde_json::json!({
            "execution": execution,
            "integration": integration,
            "cleanup": cleanup,
        }));
    }

    println!("Execution {}", execution.id);
    println!("  status:     {}", execution.status);
    println!("  agent:      {}", execution.agent_type);
    if let Some(phase) = &execution.phase {
        println!("  phase:      {}", phase);
    }
    if let Some(session) = &execution.session_id {
        println!("  session:    {}", session);
    }
    println!("  created:    {}", execution.created_at);
    if let Some(completed) = &execution.completed_at {
        println!("  completed:  {}", completed);
    }
    if let Some(error) = &execution.error {
        println!("  error:      {}", error);
    }
    if execution.workspace_preserved {
        println!("  workspace preserved for review");
    }

    if !integration.refs.is_empty() {
        println!();
        println!("{:<20} {:<6} {:<10} Changes", "Ref", "Access", "Branch");
        for r in &integration.refs {
            println!(
                "{:<20} {:<6} {:<10} {}",
                r.ref_id,
                r.permission.as_str(),
                r.branch_state.as_str(),
                r.changes.len()
            );
            for change in &r.changes {
                println!(
                    "    {:<7} {} {}",
                    change.change_type.as_str(),
                    change
                        .commit_hash
                        .as_deref()
                        .map(|h| &h[..h.len().min(10)])
                        .unwrap_or("-"),
                    change.merge_status.as_deref().unwrap_or("")
                );
            }
        }
    }
    if let Some(record) = cleanup {
        println!();
        println!(
            "Last {}: {} at {}",
            record.action.as_str(),
            if record.success { "succeeded" } else { "failed" },
            record.created_at
        );
    }
    Ok(())
}

pub async fn cmd_logs(config: EngineConfig, execution_id: &str, limit: Option<u32>, json: bool) -> Result<()> {
    let engine = open_engine(config)?;
    engine.get_execution(execution_id).await?;
    let id = execution_id.to_string();
    let entries = engine
        .db()
        .call(move |db| db.list_log_entries(&id, limit))
        .await?;
    if json {
        return print_json(&entries);
    }
    for entry in entries {
        match entry.stream {
            LogStream::Stdout => println!("{}", entry.content),
            LogStream::Stderr => println!("[stderr] {}", entry.content),
            LogStream::System => println!("[refsmith] {}", entry.content),
        }
    }
    Ok(())
}

pub async fn cmd_ports(config: EngineConfig, cleanup_stale: bool, json: bool) -> Result<()> {
    let engine = open_engine(config)?;
    if cleanup_stale {
        let released = engine.ports().cleanup_stale_allocations().await?;
        if !json {
            println!("Released {} stale allocation(s)", released);
        }
    }
    let allocations = engine.ports().list_allocations().await?;
    if json {
        return print_json(&allocations);
    }
    if allocations.is_empty() {
        println!("No ports allocated.");
        return Ok(());
    }
    println!("{:<7} {:<38} Allocated", "Port", "Preview");
    for allocation in allocations {
        println!(
            "{:<7} {:<38} {}",
            allocation.port, allocation.preview_id, allocation.allocated_at
        );
    }
    Ok(())
}
