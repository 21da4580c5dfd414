use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Unix epoch timestamp in seconds.
pub fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64
}

// ─── Schedule entities ────────────────────────────────────────────────

/// Weekly-recurring named grouping of steps, active on selected weekdays.
/// `days` is a comma-joined list of weekday indices (0=Mon .. 6=Sun).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Routine {
    pub id: i64,
    pub name: String,
    pub days: String,
    pub description: String,
}

/// One timed item inside a routine. Per-day completion lives in DailyLog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: i64,
    pub routine_id: i64,
    pub name: String,
    pub time: String,
    pub category: String,
    pub memo: String,
}

/// Per-day completion record for a routine step. Lazily created on the
/// first toggle for a (date, step) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyLog {
    pub id: i64,
    pub date: NaiveDate,
    pub step_id: i64,
    pub done: bool,
    pub memo: String,
}

/// One-off dated task independent of any routine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomTask {
    pub id: i64,
    pub date: NaiveDate,
    pub name: String,
    pub time: String,
    pub done: bool,
    pub memo: String,
}

/// Free-form journal entry for a single date. At most one per date.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DayLog {
    pub id: i64,
    pub date: NaiveDate,
    pub content: String,
}

/// Append-only chat transcript row. Assistant rows may carry an embedded
/// execution-trace marker at the end of `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRecord {
    pub id: i64,
    pub role: String,
    pub content: String,
    pub created_at: i64,
}

// ─── LLM provider port ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::text("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::text("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::text("assistant", content)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Definition of a tool that can be called by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A structured tool invocation returned by the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Arguments of the reserved `set_review_outcome` tool, captured as a
/// decision object instead of an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub action_required: bool,
    pub should_reply: bool,
    pub reply: String,
    pub notes: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// A plain text response with no tool calls.
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: vec![],
            decision: None,
            usage: None,
        }
    }
}
