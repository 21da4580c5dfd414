use yotei_core::config::Config;
use yotei_core::error::{AgentError, Result};
use yotei_core::types::{ChatRequest, ChatResponse, ToolDefinition};
use yotei_llm::anthropic::AnthropicLlm;
use yotei_llm::openai::OpenAiLlm;
use yotei_llm::provider::LlmProvider;

/// Seam between the orchestration loop and the model. `LlmDispatch` is the
/// production implementation; tests script the rounds instead.
pub trait ChatBackend: Send + Sync {
    /// One scheduler round: full tool catalog, `tool_choice` as given.
    fn chat_with_tools(
        &self,
        request: ChatRequest,
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> impl std::future::Future<Output = Result<ChatResponse>> + Send;

    /// The final-reply summarizer pass (no tools).
    fn chat_summarize(
        &self,
        request: ChatRequest,
    ) -> impl std::future::Future<Output = Result<ChatResponse>> + Send;
}

/// Provider switch driven by config. Providers are constructed per call;
/// they are just an HTTP client plus two strings.
#[derive(Clone)]
pub struct LlmDispatch {
    config: Config,
}

impl LlmDispatch {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ChatBackend for LlmDispatch {
    async fn chat_with_tools(
        &self,
        request: ChatRequest,
        tools: &[ToolDefinition],
        tool_choice: &str,
    ) -> Result<ChatResponse> {
        let llm = &self.config.llm;
        log!(" [llm] calling {}/{} ({} tools)", llm.provider, llm.model, tools.len());
        match llm.provider.as_str() {
            "anthropic" => {
                let provider = AnthropicLlm::new(llm.api_key.clone(), llm.model.clone());
                provider.chat_with_tools(request, tools, tool_choice).await
            }
            "openai" => {
                let provider =
                    OpenAiLlm::with_base_url(llm.api_key.clone(), llm.model.clone(), &llm.base_url);
                provider.chat_with_tools(request, tools, tool_choice).await
            }
            other => Err(AgentError::Config(format!(
                "unknown LLM provider: '{other}'. Supported: anthropic, openai"
            ))),
        }
    }

    async fn chat_summarize(&self, request: ChatRequest) -> Result<ChatResponse> {
        let summarizer = &self.config.summarizer;
        log!(" [summary-llm] calling {}/{}", summarizer.provider, summarizer.model);
        match summarizer.provider.as_str() {
            "anthropic" => {
                let provider =
                    AnthropicLlm::new(summarizer.api_key.clone(), summarizer.model.clone());
                provider.chat(request).await
            }
            "openai" => {
                let provider = OpenAiLlm::with_base_url(
                    summarizer.api_key.clone(),
                    summarizer.model.clone(),
                    &summarizer.base_url,
                );
                provider.chat(request).await
            }
            other => Err(AgentError::Config(format!(
                "unknown summarizer provider: '{other}'. Supported: anthropic, openai"
            ))),
        }
    }
}
