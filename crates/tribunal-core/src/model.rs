use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suite {
    pub suite_id: i64,
    pub tenant_id: String,
    pub name: String,
    pub evaluator_config: serde_json::Value,
    pub version: i64,
    pub created_by: String,
    pub created_at: String,
    pub updated_by: String,
    pub updated_at: String,
}

/// Per-kind expectation attached to a case. `min_score` overrides the
/// evaluator's default pass threshold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Expectation {
    #[serde(default)]
    pub min_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCase {
    pub case_id: i64,
    pub tenant_id: String,
    pub suite_id: i64,
    pub evaluator_kinds: Vec<String>,
    #[serde(default)]
    pub expected: BTreeMap<String, Expectation>,
    pub user_input: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
    pub version: i64,
}

/// Body accepted by `add_case` / `update_case`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CasePayload {
    pub evaluator_kinds: Vec<String>,
    #[serde(default)]
    pub expected: BTreeMap<String, Expectation>,
    pub user_input: String,
    #[serde(default)]
    pub context: serde_json::Value,
    #[serde(default)]
    pub source_conversation_id: Option<String>,
}

/// Partial update for a suite. `expected_version` carries the optimistic
/// concurrency check; losers of an update race see `StaleVersion`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuitePatch {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub evaluator_config: Option<serde_json::Value>,
    #[serde(default)]
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExecutionStatus::Pending),
            "running" => Some(ExecutionStatus::Running),
            "completed" => Some(ExecutionStatus::Completed),
            "failed" => Some(ExecutionStatus::Failed),
            "cancelled" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Pending,
    Ok,
    Failed,
    Skipped,
}

impl CaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaseStatus::Pending => "pending",
            CaseStatus::Ok => "ok",
            CaseStatus::Failed => "failed",
            CaseStatus::Skipped => "skipped",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CaseStatus::Pending),
            "ok" => Some(CaseStatus::Ok),
            "failed" => Some(CaseStatus::Failed),
            "skipped" => Some(CaseStatus::Skipped),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, CaseStatus::Pending)
    }
}

/// Caller-supplied execution parameters. `conversation_spec_id` is opaque
/// to the core and handed to the conversation port unchanged; unknown keys
/// ride along in `extra`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionParams {
    #[serde(default)]
    pub conversation_spec_id: Option<String>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: i64,
    pub tenant_id: String,
    pub suite_id: i64,
    pub suite_version: i64,
    pub status: ExecutionStatus,
    pub progress_pct: u8,
    #[serde(default)]
    pub summary: Option<serde_json::Value>,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    pub params: ExecutionParams,
    #[serde(default)]
    pub error_kind: Option<String>,
    pub started_at: String,
    #[serde(default)]
    pub finished_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub result_id: i64,
    pub tenant_id: String,
    pub execution_id: i64,
    pub case_id: i64,
    pub case_version: i64,
    pub evaluator_kind: String,
    pub status: CaseStatus,
    pub score: Option<f64>,
    pub passed: Option<bool>,
    pub reasoning: Option<String>,
    pub system_response: Option<String>,
    pub latency_ms: Option<i64>,
    pub error_kind: Option<String>,
}

/// What an evaluator returns. Scores live in [0,1]; `passed` is derived
/// against the effective threshold by the Runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub score: f64,
    pub passed: bool,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Thinking,
    ToolCall,
    ResponseChunk,
    CaseStarted,
    CaseFinished,
    Complete,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Thinking => "thinking",
            EventKind::ToolCall => "tool_call",
            EventKind::ResponseChunk => "response_chunk",
            EventKind::CaseStarted => "case_started",
            EventKind::CaseFinished => "case_finished",
            EventKind::Complete => "complete",
        }
    }
}

/// Ephemeral streaming frame; never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventFrame {
    pub execution_id: i64,
    pub sequence: u64,
    pub kind: EventKind,
    pub payload: serde_json::Value,
    pub at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldChange {
    pub from: serde_json::Value,
    pub to: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SuiteDiff {
    pub changed: BTreeMap<String, FieldChange>,
}

impl SuiteDiff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStatusView {
    pub status: ExecutionStatus,
    pub progress_pct: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}
