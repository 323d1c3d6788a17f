//! `refsmith run`: one execution end to end.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::debug;

use refsmith::config::EngineConfig;
use refsmith::events::FeedItem;
use refsmith::models::{ExecutionStatus, LogStream};
use refsmith::runner::AgentCommand;
use refsmith::{ExecutionRequest, RefRequest};

use super::{open_engine, print_json};

/// How long to wait for the printer to drain after the agent exits.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub struct RunRequest {
    pub read: Vec<String>,
    pub write: Vec<String>,
    pub create: Vec<String>,
    pub agent_type: String,
    pub session_id: Option<String>,
    pub command: Vec<String>,
    pub quiet: bool,
}

pub async fn cmd_run(config: EngineConfig, request: RunRequest, json: bool) -> Result<()> {
    let Some((program, args)) = request.command.split_first() else {
        anyhow::bail!("No command given. Usage: refsmith run [OPTIONS] -- <COMMAND>...");
    };
    let heartbeat = config.heartbeat_interval();
    let engine = Arc::new(open_engine(config)?);

    let refs = request
        .read
        .iter()
        .map(RefRequest::read)
        .chain(request.write.iter().map(RefRequest::write))
        .collect();
    let execution = engine
        .request_execution(ExecutionRequest {
            agent_type: request.agent_type.clone(),
            refs,
            create_refs: request.create.clone(),
            session_id: request.session_id.clone(),
        })
        .await?;
    let execution_id = execution.id.clone();
    if !json {
        println!("Execution {} started", execution_id);
    }

    let printer = (!request.quiet && !json).then(|| {
        let mut feed = engine.events().log_feed(&execution_id, heartbeat);
        tokio::spawn(async move {
            while let Some(item) = feed.next().await {
                match item {
                    FeedItem::Entry(entry) => match entry.stream {
                        LogStream::Stdout => println!("{}", entry.content),
                        LogStream::Stderr => eprintln!("{}", entry.content),
                        // The exit line is the last one an execution produces
                        LogStream::System => {
                            println!("[refsmith] {}", entry.content);
                            break;
                        }
                    },
                    FeedItem::Heartbeat => debug!("agent still running"),
                }
            }
        })
    });

    let command = AgentCommand {
        program: program.clone(),
        args: args.to_vec(),
        env: vec![("REFSMITH_EXECUTION_ID".to_string(), execution_id.clone())],
    };
    let handle = engine.launch_agent(&execution_id, &command).await?;
    handle.wait().await;
    if let Some(printer) = printer
        && tokio::time::timeout(DRAIN_TIMEOUT, printer).await.is_err()
    {
        debug!("output printer did not finish");
    }

    let execution = engine.get_execution(&execution_id).await?;
    if json {
        print_json(&execution)?;
    } else {
        println!("Execution {} {}", execution.id, execution.status);
        if let Some(error) = &execution.error {
            println!("  error: {}", error);
        }
        if execution.status == ExecutionStatus::NeedsReview {
            println!(
                "  workspace preserved at {}",
                engine.context().execution_workspace(&execution.id).display()
            );
        }
    }

    match execution.status {
        ExecutionStatus::Completed => Ok(()),
        status => anyhow::bail!("Execution {} finished as {}", execution.id, status),
    }
}
