//! Launches agent processes and wires them into the engine.
//!
//! stdout and stderr are forwarded as raw chunks; framing into lines is the
//! stream handler's job. The exit is reported only after both pipes are
//! drained, so every byte is delivered before the exit.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};

use crate::errors::{EngineError, EngineResult};
use crate::events::{EventBus, ProcessStartEvent};
use crate::models::{LogStream, ProcessExit, now_timestamp};

const READ_CHUNK: usize = 8 * 1024;

/// What to run for an execution.
#[derive(Debug, Clone, Default)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl AgentCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Command line for display.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Receives a child's output and exit.
#[async_trait]
pub trait ProcessSink: Send + Sync + 'static {
    async fn on_output(&self, execution_id: &str, stream: LogStream, chunk: &[u8]);
    async fn on_exit(&self, execution_id: &str, exit: ProcessExit);
}

/// A launched process. `wait` resolves once the sink has handled the exit.
pub struct RunHandle {
    pub pid: Option<u32>,
    finished: oneshot::Receiver<ProcessExit>,
}

impl RunHandle {
    pub async fn wait(self) -> Option<ProcessExit> {
        self.finished.await.ok()
    }
}

struct RunningAgent {
    pid: Option<u32>,
    kill: oneshot::Sender<()>,
}

#[derive(Clone)]
pub struct AgentRunner {
    events: EventBus,
    running: Arc<Mutex<HashMap<String, RunningAgent>>>,
}

impl AgentRunner {
    pub fn new(events: EventBus) -> Self {
        Self {
            events,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn `command` in `working_dir` for `execution_id`.
    pub async fn launch(
        &self,
        execution_id: &str,
        command: &AgentCommand,
        working_dir: &Path,
        sink: Arc<dyn ProcessSink>,
    ) -> EngineResult<RunHandle> {
        let mut running = self.running.lock().await;
        if running.contains_key(execution_id) {
            return Err(EngineError::Process {
                execution_id: execution_id.to_string(),
                message: "an agent is already running".to_string(),
            });
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| EngineError::Process {
            execution_id: execution_id.to_string(),
            message: format!("failed to spawn {}: {}", command.program, e),
        })?;
        let pid = child.id();

        let pumps = [
            child
                .stdout
                .take()
                .map(|out| pump(execution_id, LogStream::Stdout, out, sink.clone())),
            child
                .stderr
                .take()
                .map(|err| pump(execution_id, LogStream::Stderr, err, sink.clone())),
        ];

        let (kill_tx, kill_rx) = oneshot::channel();
        running.insert(
            execution_id.to_string(),
            RunningAgent { pid, kill: kill_tx },
        );
        drop(running);

        info!(execution_id, pid = ?pid, command = %command.display(), "agent started");
        self.events.publish_process_start(ProcessStartEvent {
            execution_id: execution_id.to_string(),
            pid,
            command: command.display(),
            timestamp: now_timestamp(),
        });

        let (done_tx, done_rx) = oneshot::channel();
        let running = self.running.clone();
        let id = execution_id.to_string();
        tokio::spawn(async move {
            let exit = wait_for_exit(&id, child, kill_rx).await;
            for pump in pumps.into_iter().flatten() {
                if let Err(e) = pump.await {
                    warn!(execution_id = %id, error = %e, "output pump panicked");
                }
            }
            running.lock().await.remove(&id);
            info!(execution_id = %id, code = ?exit.code, signal = ?exit.signal, "agent exited");
            sink.on_exit(&id, exit).await;
            let _ = done_tx.send(exit);
        });

        Ok(RunHandle {
            pid,
            finished: done_rx,
        })
    }

    /// Kill the execution's child. Returns false when nothing is running.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let mut running = self.running.lock().await;
        match running.remove(execution_id) {
            Some(agent) => {
                debug!(execution_id, pid = ?agent.pid, "cancelling agent");
                agent.kill.send(()).is_ok()
            }
            None => false,
        }
    }

    pub async fn running(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.running.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

fn pump<R>(
    execution_id: &str,
    stream: LogStream,
    mut reader: R,
    sink: Arc<dyn ProcessSink>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let id = execution_id.to_string();
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => sink.on_output(&id, stream, &buf[..n]).await,
                Err(e) => {
                    warn!(execution_id = %id, stream = stream.as_str(), error = %e, "failed to read agent output");
                    break;
                }
            }
        }
    })
}

async fn wait_for_exit(execution_id: &str, mut child: Child, kill: oneshot::Receiver<()>) -> ProcessExit {
    let status = tokio::select! {
        status = child.wait() => status,
        Ok(()) = kill => {
            if let Err(e) = child.start_kill() {
                warn!(execution_id, error = %e, "failed to kill agent");
            }
            child.wait().await
        }
    };
    match status {
        Ok(status) => exit_from_status(status),
        Err(e) => {
            warn!(execution_id, error = %e, "failed to wait for agent");
            ProcessExit::default()
        }
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> ProcessExit {
    #[cfg(unix)]
    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
    #[cfg(not(unix))]
    let signal = None;
    ProcessExit {
        code: status.code(),
        signal,
    }
}
