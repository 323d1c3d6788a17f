//! Preview servers: allocate a port, spawn the dev server, wait until it
//! answers, and tear it down again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::context::ExecutionContextManager;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::health::{HealthChecker, WaitOptions};
use crate::models::*;
use crate::ports::PortAllocator;

/// Spawn attempts before giving up on a preview.
const MAX_SPAWN_ATTEMPTS: u32 = 3;

const PREVIEW_HOST: &str = "127.0.0.1";

#[derive(Debug, Clone, Default)]
pub struct PreviewCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

pub struct PreviewManager {
    db: DbHandle,
    ports: Arc<PortAllocator>,
    health: HealthChecker,
    context: Arc<ExecutionContextManager>,
    wait: WaitOptions,
    children: Mutex<HashMap<String, Child>>,
}

impl PreviewManager {
    pub fn new(
        db: DbHandle,
        ports: Arc<PortAllocator>,
        health: HealthChecker,
        context: Arc<ExecutionContextManager>,
        wait: WaitOptions,
    ) -> Self {
        Self {
            db,
            ports,
            health,
            context,
            wait,
            children: Mutex::new(HashMap::new()),
        }
    }

    /// URLs a dev server on `port` may answer on.
    pub fn candidate_urls(port: u16) -> Vec<String> {
        vec![
            format!("http://127.0.0.1:{}", port),
            format!("http://localhost:{}", port),
            format!("http://[::1]:{}", port),
        ]
    }

    /// The execution's worktree for `ref_id` when it has one, else the
    /// ref's canonical checkout.
    async fn preview_dir(&self, ref_id: &str, execution_id: Option<&str>) -> EngineResult<PathBuf> {
        if let Some(execution_id) = execution_id
            && let Some(manifest) = self.context.manifest(execution_id).await?
            && let Some(entry) = manifest.entry(ref_id)
            && entry.working_dir.exists()
        {
            return Ok(entry.working_dir.clone());
        }
        Ok(self.context.ref_path(ref_id))
    }

    pub async fn start_preview(
        &self,
        ref_id: &str,
        execution_id: Option<&str>,
        command: &PreviewCommand,
        preferred_port: Option<u16>,
    ) -> EngineResult<Preview> {
        validate_id("ref_id", ref_id)?;
        if let Some(execution_id) = execution_id {
            validate_id("execution_id", execution_id)?;
        }
        if !self.context.ref_exists(ref_id) {
            return Err(EngineError::RefNotFound {
                id: ref_id.to_string(),
            });
        }
        let dir = self.preview_dir(ref_id, execution_id).await?;

        let preview_id = uuid::Uuid::new_v4().to_string();
        let (id, r_id, exec) = (
            preview_id.clone(),
            ref_id.to_string(),
            execution_id.map(str::to_string),
        );
        self.db
            .call(move |db| db.create_preview(&id, &r_id, exec.as_deref()))
            .await
            .map_err(EngineError::Database)?;

        let mut preferred = preferred_port;
        let mut last_error = String::new();
        let mut spawned = None;
        for attempt in 1..=MAX_SPAWN_ATTEMPTS {
            let port = match self.ports.allocate_port(&preview_id, preferred.take()).await {
                Ok(port) => port,
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            };
            let mut cmd = Command::new(&command.program);
            cmd.args(&command.args)
                .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .env("PORT", port.to_string())
                .env("HOST", PREVIEW_HOST)
                .current_dir(&dir)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true);
            match cmd.spawn() {
                Ok(child) => {
                    spawned = Some((child, port));
                    break;
                }
                Err(e) => {
                    warn!(preview_id = %preview_id, port, attempt, error = %e, "preview spawn failed");
                    last_error = format!("failed to spawn {}: {}", command.program, e);
                    self.ports.release_port(port).await?;
                }
            }
        }

        let Some((mut child, port)) = spawned else {
            return self.fail(&preview_id, None, &last_error).await;
        };
        let pid = child.id();
        let (id, status_port) = (preview_id.clone(), port);
        self.db
            .call(move |db| {
                db.update_preview(&id, PreviewStatus::Starting, Some(status_port), None, pid, None)
            })
            .await
            .map_err(EngineError::Database)?;

        let urls = Self::candidate_urls(port);
        let found = tokio::select! {
            found = self.health.find_responsive_url(&urls, &self.wait) => found,
            status = child.wait() => {
                let reason = match status {
                    Ok(status) => format!("preview exited early with {}", status),
                    Err(e) => format!("preview exited early: {}", e),
                };
                return self.fail(&preview_id, None, &reason).await;
            }
        };

        match found {
            Some((url, outcome)) => {
                let (id, url_text) = (preview_id.clone(), url.clone());
                let preview = self
                    .db
                    .call(move |db| {
                        db.update_preview(&id, PreviewStatus::Running, None, Some(&url_text), None, None)
                    })
                    .await
                    .map_err(EngineError::Database)?;
                info!(preview_id = %preview_id, ref_id, port, url = %url, attempts = outcome.attempts, "preview running");
                self.children.lock().await.insert(preview_id, child);
                Ok(preview)
            }
            None => {
                if let Err(e) = child.kill().await {
                    warn!(preview_id = %preview_id, error = %e, "failed to kill unresponsive preview");
                }
                self.fail(&preview_id, Some(port), "preview never became responsive")
                    .await
            }
        }
    }

    async fn fail(&self, preview_id: &str, port: Option<u16>, error: &str) -> EngineResult<Preview> {
        warn!(preview_id, port = ?port, error, "preview failed");
        self.ports.release_ports_by_preview_id(preview_id).await?;
        let (id, error) = (preview_id.to_string(), error.to_string());
        self.db
            .call(move |db| db.update_preview(&id, PreviewStatus::Failed, None, None, None, Some(&error)))
            .await
            .map_err(EngineError::Database)
    }

    /// Kill the preview process, mark it stopped and release its ports.
    pub async fn stop_preview(&self, preview_id: &str) -> EngineResult<Preview> {
        let id = preview_id.to_string();
        let existing = self
            .db
            .call(move |db| db.get_preview(&id))
            .await
            .map_err(EngineError::Database)?
            .ok_or_else(|| EngineError::validation("preview_id", format!("unknown preview '{}'", preview_id)))?;

        if let Some(mut child) = self.children.lock().await.remove(preview_id)
            && let Err(e) = child.kill().await
        {
            warn!(preview_id, error = %e, "failed to kill preview");
        }
        let released = self.ports.release_ports_by_preview_id(preview_id).await?;

        if existing.status.is_terminal() {
            return Ok(existing);
        }
        let id = preview_id.to_string();
        let preview = self
            .db
            .call(move |db| db.update_preview(&id, PreviewStatus::Stopped, None, None, None, None))
            .await
            .map_err(EngineError::Database)?;
        info!(preview_id, released, "preview stopped");
        Ok(preview)
    }

    pub async fn get_preview(&self, preview_id: &str) -> EngineResult<Option<Preview>> {
        let id = preview_id.to_string();
        self.db
            .call(move |db| db.get_preview(&id))
            .await
            .map_err(EngineError::Database)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::git::RefLocks;
    use crate::git::test_support::*;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        db: DbHandle,
        previews: PreviewManager,
    }

    fn free_range(len: u16) -> (u16, u16) {
        // Probe for a block of currently bindable ports
        for _ in 0..50 {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            let start = listener.local_addr().unwrap().port();
            drop(listener);
            if start.checked_add(len).is_some()
                && (start..start + len).all(crate::ports::is_port_available)
            {
                return (start, start + len - 1);
            }
        }
        panic!("no free port range");
    }

    fn fixture(wait: WaitOptions) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let refs = dir.path().join("refs");
        init_ref(&refs, "site");
        let db = DbHandle::in_memory().unwrap();
        let context = Arc::new(ExecutionContextManager::new(
            db.clone(),
            RefLocks::new(),
            refs,
            dir.path().join("workspaces"),
            "main".into(),
        ));
        let (start, end) = free_range(5);
        let ports = Arc::new(PortAllocator::new(db.clone(), start, end));
        let previews = PreviewManager::new(db.clone(), ports, HealthChecker::new(), context, wait);
        Fixture {
            _dir: dir,
            db,
            previews,
        }
    }

    fn quick_wait() -> WaitOptions {
        WaitOptions {
            max_attempts: 1,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(10),
            timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn command(program: &str, args: &[&str]) -> PreviewCommand {
        PreviewCommand {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
        }
    }

    fn allocations(db: &DbHandle) -> usize {
        db.lock_sync().unwrap().list_port_allocations().unwrap().len()
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_ports() {
        let f = fixture(quick_wait());
        let preview = f
            .previews
            .start_preview("site", None, &command("/nonexistent/dev-server", &[]), None)
            .await
            .unwrap();
        assert_eq!(preview.status, PreviewStatus::Failed);
        assert!(preview.error.unwrap().contains("failed to spawn"));
        assert_eq!(allocations(&f.db), 0);
    }

    #[tokio::test]
    async fn test_unresponsive_server_fails_and_releases() {
        let f = fixture(quick_wait());
        let preview = f
            .previews
            .start_preview("site", None, &command("sleep", &["30"]), None)
            .await
            .unwrap();
        assert_eq!(preview.status, PreviewStatus::Failed);
        assert!(preview.port.is_some());
        assert_eq!(allocations(&f.db), 0);
    }

    #[tokio::test]
    async fn test_early_exit_fails() {
        let f = fixture(WaitOptions {
            max_attempts: 50,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(100),
            timeout: Duration::from_millis(100),
            ..Default::default()
        });
        let preview = f
            .previews
            .start_preview("site", None, &command("sh", &["-c", "exit 1"]), None)
            .await
            .unwrap();
        assert_eq!(preview.status, PreviewStatus::Failed);
        assert!(preview.error.unwrap().contains("exited early"));
    }

    #[tokio::test]
    async fn test_unknown_ref_and_preview() {
        let f = fixture(quick_wait());
        assert!(matches!(
            f.previews
                .start_preview("missing", None, &command("sleep", &["1"]), None)
                .await,
            Err(EngineError::RefNotFound { .. })
        ));
        assert!(matches!(
            f.previews.stop_preview("nope").await,
            Err(EngineError::Validation { .. })
        ));
    }

    #[tokio::test]
    async fn test_python_server_lifecycle() {
        let has_python = std::process::Command::new("python3")
            .arg("--version")
            .output()
            .is_ok_and(|o| o.status.success());
        if !has_python {
            return;
        }
        let f = fixture(WaitOptions {
            max_attempts: 40,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
            timeout: Duration::from_millis(500),
            ..Default::default()
        });
        let preview = f
            .previews
            .start_preview(
                "site",
                None,
                &command("sh", &["-c", "exec python3 -m http.server \"$PORT\" --bind \"$HOST\""]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(preview.status, PreviewStatus::Running, "{:?}", preview.error);
        let port = preview.port.unwrap();
        assert_eq!(preview.url.as_deref(), Some(format!("http://127.0.0.1:{}", port).as_str()));
        assert_eq!(allocations(&f.db), 1);

        let stopped = f.previews.stop_preview(&preview.id).await.unwrap();
        assert_eq!(stopped.status, PreviewStatus::Stopped);
        assert_eq!(allocations(&f.db), 0);
    }
}
