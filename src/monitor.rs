//! Admission control for new executions.
//!
//! Each check is evaluated independently and reported; admission requires all
//! of them to pass. Denied requests are rejected, never queued.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::LimitsConfig;
use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};

/// Source of system load information.
pub trait HeadroomProbe: Send + Sync {
    /// 1-minute load average divided by CPU count, or `None` when unknown.
    fn load_per_cpu(&self) -> Option<f64>;
}

/// Reads `/proc/loadavg`. Reports nothing on platforms without it.
pub struct LoadAverageProbe;

impl HeadroomProbe for LoadAverageProbe {
    fn load_per_cpu(&self) -> Option<f64> {
        let content = std::fs::read_to_string("/proc/loadavg").ok()?;
        let load: f64 = content.split_whitespace().next()?.parse().ok()?;
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Some(load / cpus as f64)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionCheck {
    pub name: &'static str,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub checks: Vec<AdmissionCheck>,
}

impl AdmissionDecision {
    fn from_checks(checks: Vec<AdmissionCheck>) -> Self {
        let failed: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| c.detail.clone())
            .collect();
        Self {
            allowed: failed.is_empty(),
            reason: (!failed.is_empty()).then(|| failed.join("; ")),
            checks,
        }
    }

    pub fn into_result(self) -> EngineResult<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(EngineError::AdmissionDenied {
                reason: self.reason.unwrap_or_else(|| "admission denied".to_string()),
            })
        }
    }
}

/// Gate consulted before an execution is created.
#[async_trait]
pub trait AdmissionGate: Send + Sync {
    async fn check_admission(&self) -> EngineResult<AdmissionDecision>;
}

pub struct ResourceMonitor {
    db: DbHandle,
    workspaces_root: PathBuf,
    limits: LimitsConfig,
    probe: Arc<dyn HeadroomProbe>,
}

impl ResourceMonitor {
    pub fn new(db: DbHandle, workspaces_root: PathBuf, limits: LimitsConfig) -> Self {
        Self::with_probe(db, workspaces_root, limits, Arc::new(LoadAverageProbe))
    }

    pub fn with_probe(
        db: DbHandle,
        workspaces_root: PathBuf,
        limits: LimitsConfig,
        probe: Arc<dyn HeadroomProbe>,
    ) -> Self {
        Self {
            db,
            workspaces_root,
            limits,
            probe,
        }
    }

    async fn concurrency_check(&self) -> EngineResult<AdmissionCheck> {
        let active = self
            .db
            .call(|db| db.count_active_executions())
            .await
            .map_err(EngineError::Database)?;
        let max = self.limits.max_concurrent;
        Ok(AdmissionCheck {
            name: "concurrency",
            passed: active < max,
            detail: format!("{} of {} concurrent executions in use", active, max),
        })
    }

    async fn disk_checks(&self) -> EngineResult<Vec<AdmissionCheck>> {
        let root = self.workspaces_root.clone();
        let (used, free) = tokio::task::spawn_blocking(move || {
            let used = directory_size(&root);
            let free = available_space(&root);
            (used, free)
        })
        .await
        .context("Disk usage task panicked")?;

        let mut checks = vec![AdmissionCheck {
            name: "workspace_usage",
            passed: used < self.limits.max_workspace_bytes,
            detail: format!(
                "workspaces use {} of {} bytes",
                used, self.limits.max_workspace_bytes
            ),
        }];
        checks.push(match free {
            Some(free) => AdmissionCheck {
                name: "free_disk",
                passed: free >= self.limits.min_free_disk_bytes,
                detail: format!(
                    "{} bytes free, {} required",
                    free, self.limits.min_free_disk_bytes
                ),
            },
            None => AdmissionCheck {
                name: "free_disk",
                passed: true,
                detail: "free disk space unknown".to_string(),
            },
        });
        Ok(checks)
    }

    fn headroom_check(&self) -> AdmissionCheck {
        match self.probe.load_per_cpu() {
            Some(load) => AdmissionCheck {
                name: "system_load",
                passed: load <= self.limits.max_load_per_cpu,
                detail: format!(
                    "load {:.2} per cpu, limit {:.2}",
                    load, self.limits.max_load_per_cpu
                ),
            },
            None => AdmissionCheck {
                name: "system_load",
                passed: true,
                detail: "system load unavailable".to_string(),
            },
        }
    }
}

#[async_trait]
impl AdmissionGate for ResourceMonitor {
    async fn check_admission(&self) -> EngineResult<AdmissionDecision> {
        let mut checks = vec![self.concurrency_check().await?];
        checks.extend(self.disk_checks().await?);
        checks.push(self.headroom_check());
        let decision = AdmissionDecision::from_checks(checks);
        if decision.allowed {
            debug!("admission granted");
        } else {
            warn!(reason = ?decision.reason, "admission denied");
        }
        Ok(decision)
    }
}

/// Total size of regular files under `root`; unreadable entries are skipped.
pub fn directory_size(root: &Path) -> u64 {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}

/// Free space on the volume holding `path` (or its nearest existing ancestor).
fn available_space(path: &Path) -> Option<u64> {
    let existing = path.ancestors().find(|p| p.exists())?;
    fs2::available_space(existing).ok()
}
