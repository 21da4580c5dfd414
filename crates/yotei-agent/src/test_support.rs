use std::collections::VecDeque;
use std::sync::Mutex;

use yotei_core::error::{AgentError, Result};
use yotei_core::types::{ChatRequest, ChatResponse, ToolDefinition};

use crate::llm::ChatBackend;

/// Scripted model: pops one canned response per call and records the
/// requests it saw. Exhausting the script is a test bug.
pub struct ScriptedBackend {
    rounds: Mutex<VecDeque<Result<ChatResponse>>>,
    summaries: Mutex<VecDeque<Result<ChatResponse>>>,
    pub seen_round_requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedBackend {
    pub fn new(rounds: Vec<Result<ChatResponse>>) -> Self {
        Self {
            rounds: Mutex::new(rounds.into_iter().collect()),
            summaries: Mutex::new(VecDeque::new()),
            seen_round_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_summaries(self, summaries: Vec<Result<ChatResponse>>) -> Self {
        *self.summaries.lock().unwrap() = summaries.into_iter().collect();
        self
    }

    pub fn rounds_consumed(&self) -> usize {
        self.seen_round_requests.lock().unwrap().len()
    }
}

impl ChatBackend for ScriptedBackend {
    async fn chat_with_tools(
        &self,
        request: ChatRequest,
        _tools: &[ToolDefinition],
        _tool_choice: &str,
    ) -> Result<ChatResponse> {
        self.seen_round_requests.lock().unwrap().push(request);
        self.rounds
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| panic!("scripted backend ran out of round responses"))
    }

    async fn chat_summarize(&self, _request: ChatRequest) -> Result<ChatResponse> {
        self.summaries
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Err(AgentError::Llm {
                provider: "scripted".to_string(),
                message: "no summary scripted".to_string(),
            }))
    }
}
