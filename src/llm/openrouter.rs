// OpenRouter adapter: OpenAI protocol on a different base URL with attribution headers

use async_trait::async_trait;

use crate::llm::openai::OpenAIAdapter;
use crate::llm::provider::{LLMAdapter, ProviderError};
use crate::types::{LLMRequest, LLMResponse};

const OPENROUTER_API_BASE: &str = "https://openrouter.ai/api/v1";

pub struct OpenRouterAdapter {
    inner: OpenAIAdapter,
}

impl OpenRouterAdapter {
    pub fn new(api_key: &str) -> Self {
        Self::with_base_url(api_key, OPENROUTER_API_BASE)
    }

    pub fn with_base_url(api_key: &str, base_url: &str) -> Self {
        let inner = OpenAIAdapter::with_base_url(api_key, base_url)
            .with_header("HTTP-Referer", "https://github.com/trade-journal/trade-journal-jobs")
            .with_header("X-Title", "Trade Journal");
        Self { inner }
    }
}

#[async_trait]
impl LLMAdapter for OpenRouterAdapter {
    async fn create_chat_completion(&self, request: &LLMRequest) -> Result<LLMResponse, ProviderError> {
        self.inner.create_chat_completion(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LLMMessage;

    #[tokio::test]
    async fn test_sends_attribution_headers() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("x-title", "Trade Journal")
            .match_header("authorization", "Bearer sk-or")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"{}"}}]}"#)
            .create_async()
            .await;

        let adapter = OpenRouterAdapter::with_base_url("sk-or", &server.url());
        let response = adapter
            .create_chat_completion(&LLMRequest {
                model: "openai/gpt-4o-mini".to_string(),
                messages: vec![LLMMessage::user("hi")],
                max_tokens: None,
                temperature: None,
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(response.content, "{}");
        assert_eq!(response.model, "openai/gpt-4o-mini");
    }
}
