use std::path::PathBuf;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").unwrap());

/// Execution and ref ids double as branch and directory names.
pub fn validate_id(field: &'static str, id: &str) -> EngineResult<()> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(EngineError::validation(
            field,
            format!("'{}' must be 1-64 characters of [A-Za-z0-9_-]", id),
        ))
    }
}

/// Current time in the format stored by the database (RFC 3339, millisecond
/// precision, `Z` suffix). Lexicographic order matches chronological order.
pub fn now_timestamp() -> String {
    format_timestamp(chrono::Utc::now())
}

pub fn format_timestamp(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Deterministic branch name for an execution.
pub fn execution_branch_name(execution_id: &str) -> String {
    format!("exec-{}", execution_id)
}

// ── Execution ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Starting,
    Running,
    Completed,
    Failed,
    NeedsReview,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::NeedsReview => "needs_review",
        }
    }

    /// Starting and running executions own a live workspace.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    /// Allowed lifecycle edges. `completed -> needs_review` is the only edge
    /// out of a terminal state: it flags a finished run whose integration
    /// could not be synced.
    pub fn can_transition_to(&self, to: ExecutionStatus) -> bool {
        use ExecutionStatus::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Starting, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, NeedsReview)
                | (Completed, NeedsReview)
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "needs_review" => Ok(Self::NeedsReview),
            _ => Err(format!("Invalid execution status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: String,
    pub status: ExecutionStatus,
    pub phase: Option<String>,
    pub agent_type: String,
    pub session_id: Option<String>,
    pub working_dir: Option<String>,
    pub conflict_details: Option<ConflictDetails>,
    pub workspace_preserved: bool,
    pub error: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub last_heartbeat: Option<String>,
}

impl Execution {
    /// Most recent activity timestamp: completion, else heartbeat, else creation.
    pub fn last_activity(&self) -> &str {
        self.completed_at
            .as_deref()
            .or(self.last_heartbeat.as_deref())
            .unwrap_or(&self.created_at)
    }
}

/// Structured failure payload persisted on the execution record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConflictDetails {
    /// One or more refs could not be synced into their mainline.
    SyncFailures {
        reason: String,
        failures: Vec<SyncFailure>,
    },
    /// Workspace setup failed for a ref; nothing from this execution is valid.
    SetupFailed { ref_id: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub ref_id: String,
    pub branch_name: String,
    pub error: String,
    pub message: String,
}

// ── Refs and manifest ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefPermission {
    Read,
    Write,
}

impl RefPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl std::fmt::Display for RefPermission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefPermission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            _ => Err(format!("Invalid ref permission: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Active,
    Discarded,
}

impl BranchState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Discarded => "discarded",
        }
    }
}

impl FromStr for BranchState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "discarded" => Ok(Self::Discarded),
            _ => Err(format!("Invalid branch state: {}", s)),
        }
    }
}

/// One ref touched by an execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub ref_id: String,
    pub permission: RefPermission,
    pub branch_name: String,
    pub working_dir: PathBuf,
    /// The ref did not exist before this execution created it.
    pub created_ref: bool,
    pub branch_state: BranchState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionManifest {
    pub execution_id: String,
    pub entries: Vec<ManifestEntry>,
}

impl ExecutionManifest {
    pub fn entry(&self, ref_id: &str) -> Option<&ManifestEntry> {
        self.entries.iter().find(|e| e.ref_id == ref_id)
    }

    pub fn write_entries(&self) -> impl Iterator<Item = &ManifestEntry> {
        self.entries
            .iter()
            .filter(|e| e.permission == RefPermission::Write)
    }
}

/// How an execution branch is folded into mainline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Fast-forward when possible, otherwise a conflict-free merge commit.
    #[default]
    Sync,
    /// Only fast-forward; a diverged mainline fails the sync.
    FastForwardOnly,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sync => "sync",
            Self::FastForwardOnly => "fast_forward_only",
        }
    }
}

impl FromStr for MergeStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(Self::Sync),
            "fast_forward_only" | "ff-only" => Ok(Self::FastForwardOnly),
            _ => Err(format!(
                "Invalid merge strategy '{}'. Valid values: sync, fast_forward_only",
                s
            )),
        }
    }
}

// ── Change records ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Commit,
    Merge,
    Create,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Merge => "merge",
            Self::Create => "create",
        }
    }
}

impl FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "commit" => Ok(Self::Commit),
            "merge" => Ok(Self::Merge),
            "create" => Ok(Self::Create),
            _ => Err(format!("Invalid change type: {}", s)),
        }
    }
}

/// Row to append; id and timestamp are assigned by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewChangeRecord {
    pub execution_id: String,
    pub ref_id: String,
    pub change_type: ChangeType,
    pub branch_name: String,
    pub commit_hash: Option<String>,
    pub merge_status: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefChangeRecord {
    pub id: i64,
    pub execution_id: String,
    pub ref_id: String,
    pub change_type: ChangeType,
    pub branch_name: String,
    pub commit_hash: Option<String>,
    pub merge_status: Option<String>,
    pub message: String,
    pub created_at: String,
}

/// Per-ref history returned by integration status queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefHistory {
    pub ref_id: String,
    pub permission: RefPermission,
    pub branch_name: String,
    pub branch_state: BranchState,
    pub changes: Vec<RefChangeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationStatus {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub refs: Vec<RefHistory>,
}

// ── Logs ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

impl FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "system" => Ok(Self::System),
            _ => Err(format!("Invalid log stream: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub execution_id: String,
    pub stream: LogStream,
    pub content: String,
    pub timestamp: String,
}

/// How a child process ended. `signal` is set when it was killed by one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl ProcessExit {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("process exited with code {}", code),
            (None, Some(signal)) => format!("process killed by signal {}", signal),
            (None, None) => "process exited".to_string(),
        }
    }
}

// ── Ports and previews ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortAllocation {
    pub port: u16,
    pub preview_id: String,
    pub allocated_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreviewStatus {
    Starting,
    Running,
    Stopped,
    Failed,
}

impl PreviewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }
}

impl FromStr for PreviewStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "stopped" => Ok(Self::Stopped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid preview status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Preview {
    pub id: String,
    pub ref_id: String,
    pub execution_id: Option<String>,
    pub port: Option<u16>,
    pub url: Option<String>,
    pub status: PreviewStatus,
    pub pid: Option<u32>,
    pub error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

// ── Cleanup ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    Cleanup,
    Rollback,
    Sweep,
}

impl CleanupAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::Rollback => "rollback",
            Self::Sweep => "sweep",
        }
    }
}

impl FromStr for CleanupAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cleanup" => Ok(Self::Cleanup),
            "rollback" => Ok(Self::Rollback),
            "sweep" => Ok(Self::Sweep),
            _ => Err(format!("Invalid cleanup action: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupRecord {
    pub execution_id: String,
    pub action: CleanupAction,
    pub success: bool,
    pub workspace_removed: bool,
    pub branches_removed: u32,
    pub error: Option<String>,
    pub created_at: String,
}
