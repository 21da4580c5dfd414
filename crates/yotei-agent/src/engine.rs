use serde_json::Value;
use yotei_core::config::Config;
use yotei_core::types::ChatMessage;

use crate::llm::{ChatBackend, LlmDispatch};
use crate::orchestrator::{run_scheduler_multi_step, TraceRound};
use crate::reply::{attach_execution_trace, build_final_reply, extract_execution_trace};
use crate::store::ScheduleStore;
use yotei_core::error::Result;

/// Result of processing one chat request.
#[derive(Debug)]
pub struct ChatOutcome {
    pub reply: String,
    pub should_refresh: bool,
    pub modified_ids: Vec<String>,
    pub execution_trace: Vec<TraceRound>,
}

/// A stored transcript row with its embedded trace split back out.
#[derive(Debug)]
pub struct ChatHistoryEntry {
    pub role: String,
    pub content: String,
    pub timestamp: i64,
    pub execution_trace: Vec<Value>,
}

/// Request-scope engine: one `process_chat` call drives one orchestration
/// run to completion. The store mediates all cross-request visibility.
pub struct Engine<B = LlmDispatch> {
    store: ScheduleStore,
    llm: B,
    config: Config,
}

impl Engine<LlmDispatch> {
    pub async fn new(config: Config) -> Result<Self> {
        let store = ScheduleStore::open(&config.database.path).await?;
        let llm = LlmDispatch::new(config.clone());
        Ok(Self { store, llm, config })
    }
}

impl<B: ChatBackend> Engine<B> {
    /// Assemble an engine from parts. Tests use this with a scripted
    /// backend and an in-memory store.
    pub fn from_parts(store: ScheduleStore, llm: B, config: Config) -> Self {
        Self { store, llm, config }
    }

    pub fn store(&self) -> &ScheduleStore {
        &self.store
    }

    /// Process one chat request: persist the user turn, run the
    /// orchestration loop, synthesize the reply, persist the assistant
    /// turn with its execution trace attached.
    pub async fn process_chat(
        &self,
        messages: &[ChatMessage],
        save_history: bool,
    ) -> ChatOutcome {
        let window = self.config.history.window;
        let start = messages.len().saturating_sub(window);
        let windowed = &messages[start..];

        let user_message = match windowed.last() {
            Some(last) if last.role == "user" => last.content.clone(),
            _ => "(Context only)".to_string(),
        };

        if save_history {
            if let Err(e) = self.store.append_chat("user", &user_message).await {
                log!(" [history] failed to save user message: {e}");
            }
        }

        let today = chrono::Local::now().date_naive();
        let run =
            run_scheduler_multi_step(&self.store, &self.llm, windowed, today, &self.config.scheduler)
                .await;

        let final_reply = build_final_reply(
            &self.llm,
            &user_message,
            &run.reply_text,
            &run.results,
            &run.errors,
        )
        .await;

        if save_history {
            let trace_values: Vec<Value> =
                run.execution_trace.iter().map(TraceRound::to_value).collect();
            let stored = attach_execution_trace(&final_reply, &trace_values);
            if let Err(e) = self.store.append_chat("assistant", &stored).await {
                log!(" [history] failed to save assistant message: {e}");
            }
        }

        ChatOutcome {
            reply: final_reply,
            should_refresh: !run.results.is_empty(),
            modified_ids: run.modified_ids,
            execution_trace: run.execution_trace,
        }
    }

    /// Stored transcript with traces re-extracted from assistant rows.
    pub async fn chat_history(&self, limit: usize) -> Result<Vec<ChatHistoryEntry>> {
        let records = self.store.recent_chat(limit).await?;
        Ok(records
            .into_iter()
            .map(|record| {
                let (content, execution_trace) = extract_execution_trace(&record.content);
                ChatHistoryEntry {
                    role: record.role,
                    content,
                    timestamp: record.created_at,
                    execution_trace,
                }
            })
            .collect())
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.store.clear_chat().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedBackend;
    use serde_json::json;
    use yotei_core::types::{ChatResponse, ToolInvocation};

    fn config() -> Config {
        Config::default()
    }

    async fn engine(backend: ScriptedBackend) -> Engine<ScriptedBackend> {
        let store = ScheduleStore::open_in_memory().await.unwrap();
        Engine::from_parts(store, backend, config())
    }

    #[tokio::test]
    async fn test_process_chat_persists_turns_with_trace() {
        let today = chrono::Local::now().date_naive().format("%Y-%m-%d").to_string();
        let backend = ScriptedBackend::new(vec![
            Ok(ChatResponse {
                content: "追加します。".to_string(),
                tool_calls: vec![ToolInvocation {
                    name: "create_custom_task".to_string(),
                    arguments: json!({ "name": "歯医者", "date": today, "time": "10:00" }),
                }],
                decision: None,
                usage: None,
            }),
            Ok(ChatResponse::text("追加しました！")),
        ])
        .with_summaries(vec![Ok(ChatResponse::text("📅 10時に歯医者を入れました！"))]);

        let engine = engine(backend).await;
        let outcome = engine
            .process_chat(&[ChatMessage::user("今日10時に歯医者を追加して")], true)
            .await;

        assert_eq!(outcome.reply, "📅 10時に歯医者を入れました！");
        assert!(outcome.should_refresh);
        assert_eq!(outcome.modified_ids, vec!["item_custom_1"]);
        assert_eq!(outcome.execution_trace.len(), 1);

        let history = engine.chat_history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, "user");
        assert!(history[0].execution_trace.is_empty());
        assert_eq!(history[1].role, "assistant");
        // Stored content is clean; the trace rides the marker.
        assert_eq!(history[1].content, "📅 10時に歯医者を入れました！");
        assert_eq!(history[1].execution_trace.len(), 1);
        assert_eq!(
            history[1].execution_trace[0]["actions"][0]["type"],
            "create_custom_task"
        );
    }

    #[tokio::test]
    async fn test_process_chat_without_tool_calls_is_verbatim() {
        let backend = ScriptedBackend::new(vec![Ok(ChatResponse::text("こんにちは！今日も頑張りましょう✨"))]);
        let engine = engine(backend).await;

        let outcome = engine
            .process_chat(&[ChatMessage::user("おはよう")], false)
            .await;

        assert_eq!(outcome.reply, "こんにちは！今日も頑張りましょう✨");
        assert!(!outcome.should_refresh);
        assert!(outcome.modified_ids.is_empty());
        assert!(outcome.execution_trace.is_empty());
        assert!(engine.chat_history(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_window_limits_messages_fed_to_run() {
        let backend = ScriptedBackend::new(vec![Ok(ChatResponse::text("了解です。"))]);
        let engine = engine(backend).await;

        let mut messages: Vec<ChatMessage> = (0..15)
            .map(|i| ChatMessage::user(format!("メッセージ{i}")))
            .collect();
        messages.push(ChatMessage::user("最後の発言"));

        engine.process_chat(&messages, false).await;

        let request = &engine.llm.seen_round_requests.lock().unwrap()[0];
        // Two system prompts plus at most `window` conversation messages.
        assert!(request.messages.len() <= 2 + engine.config.history.window);
        assert!(request
            .messages
            .iter()
            .any(|m| m.content.contains("最後の発言")));
        assert!(!request.messages.iter().any(|m| m.content.contains("メッセージ0")));
    }
}
