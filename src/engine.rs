//! Top-level engine wiring every manager to one database, event bus and
//! ref lock map.
//!
//! Lifecycle of an execution:
//! 1. `request_execution` validates, asks the admission gate, creates the
//!    row and an isolated context for every requested ref.
//! 2. `launch_agent` spawns the agent in the execution workspace; its output
//!    flows through the stream handler.
//! 3. `on_process_exit` flushes output, integrates write refs on success and
//!    settles the final status.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::cleanup::{CleanupManager, CleanupOptions};
use crate::config::EngineConfig;
use crate::context::ExecutionContextManager;
use crate::db::{DbHandle, EngineDb, Transition};
use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, ProcessExitEvent};
use crate::git::RefLocks;
use crate::health::{HealthChecker, WaitOptions};
use crate::integration::{IntegrationManager, ProcessOptions};
use crate::models::*;
use crate::monitor::{AdmissionGate, ResourceMonitor};
use crate::ports::PortAllocator;
use crate::preview::PreviewManager;
use crate::runner::{AgentCommand, AgentRunner, ProcessSink, RunHandle};
use crate::stream::StreamHandler;

#[derive(Debug, Clone)]
pub struct RefRequest {
    pub ref_id: String,
    pub permission: RefPermission,
}

impl RefRequest {
    pub fn read(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            permission: RefPermission::Read,
        }
    }

    pub fn write(ref_id: impl Into<String>) -> Self {
        Self {
            ref_id: ref_id.into(),
            permission: RefPermission::Write,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionRequest {
    pub agent_type: String,
    pub refs: Vec<RefRequest>,
    /// Refs to initialise from scratch; touched for writing.
    pub create_refs: Vec<String>,
    pub session_id: Option<String>,
}

pub struct Engine {
    config: EngineConfig,
    db: DbHandle,
    events: EventBus,
    stream: Arc<StreamHandler>,
    context: Arc<ExecutionContextManager>,
    integration: IntegrationManager,
    cleanup: CleanupManager,
    ports: Arc<PortAllocator>,
    health: HealthChecker,
    previews: PreviewManager,
    runner: AgentRunner,
    admission: Arc<dyn AdmissionGate>,
    admission_lock: Mutex<()>,
}

impl Engine {
    /// Open (or create) the project database under the data directory.
    pub fn open(config: EngineConfig) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("Failed to create {}", config.data_dir.display()))?;
        let db = DbHandle::new(EngineDb::new(&config.db_path())?);
        Ok(Self::with_db(config, db))
    }

    pub fn with_db(config: EngineConfig, db: DbHandle) -> Self {
        let events = EventBus::new(config.events.channel_capacity);
        let locks = RefLocks::new();
        let stream = Arc::new(StreamHandler::new(
            db.clone(),
            events.clone(),
            config.stream.max_buffer_bytes,
            config.stream.max_line_chars,
        ));
        let context = Arc::new(ExecutionContextManager::new(
            db.clone(),
            locks.clone(),
            config.refs.root.clone(),
            config.workspaces.root.clone(),
            config.refs.mainline.clone(),
        ));
        let integration = IntegrationManager::new(db.clone(), locks.clone(), context.clone());
        let cleanup = CleanupManager::new(db.clone(), locks, context.clone(), stream.clone());
        let ports = Arc::new(PortAllocator::new(
            db.clone(),
            config.ports.range_start,
            config.ports.range_end,
        ));
        let health = HealthChecker::new();
        let previews = PreviewManager::new(
            db.clone(),
            ports.clone(),
            health.clone(),
            context.clone(),
            WaitOptions::from_config(&config.health),
        );
        let runner = AgentRunner::new(events.clone());
        let admission = Arc::new(ResourceMonitor::new(
            db.clone(),
            config.workspaces.root.clone(),
            config.limits.clone(),
        ));
        Self {
            config,
            db,
            events,
            stream,
            context,
            integration,
            cleanup,
            ports,
            health,
            previews,
            runner,
            admission,
            admission_lock: Mutex::new(()),
        }
    }

    /// Replace the admission gate (the resource monitor by default).
    pub fn with_admission_gate(mut self, gate: Arc<dyn AdmissionGate>) -> Self {
        self.admission = gate;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn db(&self) -> &DbHandle {
        &self.db
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stream(&self) -> &StreamHandler {
        &self.stream
    }

    pub fn context(&self) -> &ExecutionContextManager {
        &self.context
    }

    pub fn integration(&self) -> &IntegrationManager {
        &self.integration
    }

    pub fn cleanup(&self) -> &CleanupManager {
        &self.cleanup
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn previews(&self) -> &PreviewManager {
        &self.previews
    }

    pub fn runner(&self) -> &AgentRunner {
        &self.runner
    }

    pub fn admission(&self) -> &dyn AdmissionGate {
        self.admission.as_ref()
    }

    pub async fn request_execution(&self, request: ExecutionRequest) -> EngineResult<Execution> {
        if request.agent_type.trim().is_empty() {
            return Err(EngineError::validation("agent_type", "must not be empty"));
        }
        for r in &request.refs {
            validate_id("ref_id", &r.ref_id)?;
        }
        for ref_id in &request.create_refs {
            validate_id("ref_id", ref_id)?;
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        {
            // Check and insert together so concurrent requests see each other
            let _guard = self.admission_lock.lock().await;
            self.admission.check_admission().await?.into_result()?;
            let (id, agent_type, session_id) = (
                execution_id.clone(),
                request.agent_type.clone(),
                request.session_id.clone(),
            );
            self.db
                .call(move |db| db.create_execution(&id, &agent_type, session_id.as_deref()))
                .await
                .map_err(EngineError::Database)?;
        }

        if let Err(e) = self.setup_contexts(&execution_id, &request).await {
            self.fail_execution(&execution_id, &e.to_string()).await;
            match self.context.cleanup_execution_workspace(&execution_id).await {
                Ok(summary) if !summary.is_clean() => {
                    warn!(execution_id = %execution_id, errors = ?summary.errors, "partial workspace left after setup failure")
                }
                Ok(_) => {}
                Err(cleanup_err) => {
                    warn!(execution_id = %execution_id, error = %cleanup_err, "failed to clean up after setup failure")
                }
            }
            return Err(e);
        }

        info!(
            execution_id = %execution_id,
            agent_type = %request.agent_type,
            refs = request.refs.len() + request.create_refs.len(),
            "execution requested"
        );
        self.get_execution(&execution_id).await
    }

    async fn setup_contexts(&self, execution_id: &str, request: &ExecutionRequest) -> EngineResult<()> {
        for r in &request.refs {
            self.context
                .touch_ref(execution_id, &r.ref_id, r.permission)
                .await?;
        }
        for ref_id in &request.create_refs {
            self.context.create_ref(execution_id, ref_id).await?;
        }
        Ok(())
    }

    async fn fail_execution(&self, execution_id: &str, error: &str) {
        let (id, message) = (execution_id.to_string(), error.to_string());
        match self
            .db
            .call(move |db| db.transition_execution(&id, ExecutionStatus::Failed, Some(&message)))
            .await
        {
            Ok(Transition::Applied(_)) => warn!(execution_id, error, "execution failed"),
            Ok(_) => {}
            Err(e) => warn!(execution_id, error = %format!("{:#}", e), "failed to record execution failure"),
        }
    }

    pub async fn get_execution(&self, execution_id: &str) -> EngineResult<Execution> {
        let id = execution_id.to_string();
        self.db
            .call(move |db| db.get_execution(&id))
            .await
            .map_err(EngineError::Database)?
            .ok_or_else(|| EngineError::ExecutionNotFound {
                id: execution_id.to_string(),
            })
    }

    pub async fn list_executions(&self, statuses: &[ExecutionStatus]) -> EngineResult<Vec<Execution>> {
        let statuses = statuses.to_vec();
        self.db
            .call(move |db| db.list_executions(&statuses))
            .await
            .map_err(EngineError::Database)
    }

    async fn transition(
        &self,
        execution_id: &str,
        to: ExecutionStatus,
        error: Option<String>,
    ) -> EngineResult<Execution> {
        let id = execution_id.to_string();
        let result = self
            .db
            .call(move |db| db.transition_execution(&id, to, error.as_deref()))
            .await
            .map_err(EngineError::Database)?;
        match result {
            Transition::Applied(execution) => Ok(execution),
            Transition::Rejected { from } => Err(EngineError::InvalidTransition {
                id: execution_id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }),
            Transition::NotFound => Err(EngineError::ExecutionNotFound {
                id: execution_id.to_string(),
            }),
        }
    }

    pub async fn mark_running(&self, execution_id: &str) -> EngineResult<Execution> {
        self.transition(execution_id, ExecutionStatus::Running, None)
            .await
    }

    pub async fn heartbeat(&self, execution_id: &str) -> EngineResult<()> {
        let id = execution_id.to_string();
        self.require_updated(execution_id, move |db| db.touch_heartbeat(&id))
            .await
    }

    pub async fn set_phase(&self, execution_id: &str, phase: &str) -> EngineResult<()> {
        let (id, phase) = (execution_id.to_string(), phase.to_string());
        self.require_updated(execution_id, move |db| db.set_execution_phase(&id, &phase))
            .await
    }

    pub async fn set_session_id(&self, execution_id: &str, session_id: &str) -> EngineResult<()> {
        let (id, session) = (execution_id.to_string(), session_id.to_string());
        self.require_updated(execution_id, move |db| db.set_session_id(&id, &session))
            .await
    }

    async fn require_updated<F>(&self, execution_id: &str, f: F) -> EngineResult<()>
    where
        F: FnOnce(&EngineDb) -> anyhow::Result<bool> + Send + 'static,
    {
        let updated = self.db.call(f).await.map_err(EngineError::Database)?;
        if updated {
            Ok(())
        } else {
            Err(EngineError::ExecutionNotFound {
                id: execution_id.to_string(),
            })
        }
    }

    pub async fn handle_output(&self, execution_id: &str, stream: LogStream, bytes: &[u8]) -> usize {
        self.stream.handle_output(execution_id, stream, bytes).await
    }

    /// Spawn the agent in the execution workspace. A spawn failure fails the
    /// execution.
    pub async fn launch_agent(
        self: &Arc<Self>,
        execution_id: &str,
        command: &AgentCommand,
    ) -> EngineResult<RunHandle> {
        let execution = self.get_execution(execution_id).await?;
        if !execution.status.is_active() {
            return Err(EngineError::InvalidTransition {
                id: execution.id,
                from: execution.status.to_string(),
                to: ExecutionStatus::Running.to_string(),
            });
        }
        let workspace = self.context.execution_workspace(execution_id);
        let working_dir = if workspace.exists() {
            workspace
        } else {
            self.config.project_dir.clone()
        };

        // Running must be recorded before the child exists: a fast exit can
        // settle the execution before `launch` returns.
        if execution.status == ExecutionStatus::Starting {
            self.mark_running(execution_id).await?;
        }

        let sink: Arc<dyn ProcessSink> = self.clone();
        match self
            .runner
            .launch(execution_id, command, &working_dir, sink)
            .await
        {
            Ok(handle) => Ok(handle),
            Err(e) => {
                self.fail_execution(execution_id, &e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Settle an execution after its agent exited.
    pub async fn on_process_exit(&self, execution_id: &str, exit: ProcessExit) -> EngineResult<Execution> {
        let flushed = self.stream.flush_buffer(execution_id).await;
        self.stream
            .append_system(execution_id, &exit.describe())
            .await;
        self.events.publish_process_exit(ProcessExitEvent {
            execution_id: execution_id.to_string(),
            exit,
            timestamp: now_timestamp(),
        });

        let execution = self.get_execution(execution_id).await?;
        if execution.status.is_terminal() {
            warn!(execution_id, status = %execution.status, "exit reported for settled execution");
            return Ok(execution);
        }
        if exit.success() && execution.status == ExecutionStatus::Starting {
            self.mark_running(execution_id).await?;
        }

        let settled = if !exit.success() {
            self.transition(execution_id, ExecutionStatus::Failed, Some(exit.describe()))
                .await?
        } else if self.config.lifecycle.auto_integrate {
            let options = ProcessOptions {
                merge_strategy: self.config.lifecycle.merge_strategy,
                ..Default::default()
            };
            match self
                .integration
                .process_execution_changes(execution_id, options)
                .await
            {
                Ok(report) if report.needs_review => self.get_execution(execution_id).await?,
                Ok(_) => {
                    self.transition(execution_id, ExecutionStatus::Completed, None)
                        .await?
                }
                Err(e) => {
                    warn!(execution_id, error = %e, "integration failed");
                    self.transition(execution_id, ExecutionStatus::Failed, Some(e.to_string()))
                        .await?
                }
            }
        } else {
            self.transition(execution_id, ExecutionStatus::Completed, None)
                .await?
        };

        info!(execution_id, status = %settled.status, flushed, "execution settled");

        if self.config.lifecycle.auto_cleanup
            && !settled.workspace_preserved
            && matches!(settled.status, ExecutionStatus::Completed | ExecutionStatus::Failed)
            && let Err(e) = self
                .cleanup
                .cleanup_execution(execution_id, CleanupOptions::default())
                .await
        {
            warn!(execution_id, error = %e, "auto cleanup failed");
        }
        Ok(settled)
    }
}

#[async_trait]
impl ProcessSink for Engine {
    async fn on_output(&self, execution_id: &str, stream: LogStream, chunk: &[u8]) {
        self.handle_output(execution_id, stream, chunk).await;
    }

    async fn on_exit(&self, execution_id: &str, exit: ProcessExit) {
        if let Err(e) = self.on_process_exit(execution_id, exit).await {
            warn!(execution_id, error = %e, "failed to settle execution");
        }
    }
}
