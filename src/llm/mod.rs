//! AI 层：客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock）

pub mod deepseek;
pub mod mock;
pub mod openai;
pub mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use deepseek::{create_deepseek_client, DEEPSEEK_CHAT, DEEPSEEK_REASONER};
pub use mock::{MockLlmClient, ScriptedLlmClient};
pub use openai::OpenAiClient;
pub use traits::{GenerationConfig, LlmClient, LlmError};

use crate::config::LlmSection;

const OPENAI_DEFAULT_MODEL: &str = "gpt-4o-mini";

/// 根据配置与环境变量选择 AI 后端；缺少对应 API Key 时退回 Mock
pub fn create_llm_client(cfg: &LlmSection) -> Arc<dyn LlmClient> {
    let provider = cfg.provider.to_lowercase();
    let timeout = Duration::from_secs(cfg.request_timeout_secs);

    match provider.as_str() {
        "deepseek" => match std::env::var("DEEPSEEK_API_KEY") {
            Ok(key) => {
                let client = create_deepseek_client(cfg.model.as_deref(), &key, timeout);
                tracing::info!("Using DeepSeek LLM ({})", client.model());
                Arc::new(client)
            }
            Err(_) => {
                tracing::warn!("DEEPSEEK_API_KEY not set, using Mock LLM");
                Arc::new(MockLlmClient)
            }
        },
        "openai" => match std::env::var("OPENAI_API_KEY") {
            Ok(key) => {
                let model = cfg.model.as_deref().unwrap_or(OPENAI_DEFAULT_MODEL);
                tracing::info!("Using OpenAI-compatible LLM ({})", model);
                Arc::new(OpenAiClient::new(cfg.base_url.as_deref(), model, &key, timeout))
            }
            Err(_) => {
                tracing::warn!("OPENAI_API_KEY not set, using Mock LLM");
                Arc::new(MockLlmClient)
            }
        },
        "mock" => Arc::new(MockLlmClient),
        other => {
            tracing::warn!("Unknown LLM provider '{}', using Mock LLM", other);
            Arc::new(MockLlmClient)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mock_provider() {
        let cfg = LlmSection {
            provider: "Mock".to_string(),
            ..LlmSection::default()
        };
        assert_eq!(create_llm_client(&cfg).name(), "mock");
    }

    #[test]
    fn test_unknown_provider_falls_back() {
        let cfg = LlmSection {
            provider: "gemini-local".to_string(),
            ..LlmSection::default()
        };
        assert_eq!(create_llm_client(&cfg).name(), "mock");
    }
}
