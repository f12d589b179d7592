use async_trait::async_trait;
use tracing::debug;

use crate::llm::prompt::build_messages;
use crate::llm::provider::{AnalysisProvider, ProviderError, ProviderReply, LLM};
use crate::models::Subject;
use crate::types::LLMRequest;

/// `AnalysisProvider` backed by a chat-completions model.
pub struct LlmAnalysisProvider {
    llm: LLM,
    model: String,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl LlmAnalysisProvider {
    pub fn new(llm: LLM, model: impl Into<String>) -> Self {
        Self {
            llm,
            model: model.into(),
            max_tokens: Some(1200),
            temperature: Some(0.3),
        }
    }

    pub fn with_sampling(mut self, max_tokens: Option<u32>, temperature: Option<f32>) -> Self {
        self.max_tokens = max_tokens;
        self.temperature = temperature;
        self
    }
}

#[async_trait]
impl AnalysisProvider for LlmAnalysisProvider {
    async fn generate(&self, subject: &Subject) -> Result<ProviderReply, ProviderError> {
        let request = LLMRequest {
            model: self.model.clone(),
            messages: build_messages(subject),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let response = self.llm.create_chat_completion(&request).await?;
        debug!(
            provider = self.llm.provider_name(),
            model = %response.model,
            total_tokens = response.usage.total_tokens,
            finish_reason = %response.finish_reason,
            "LLM analysis generated"
        );

        Ok(ProviderReply {
            content: response.content,
            model: response.model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::openai::OpenAIAdapter;
    use crate::models::{SubjectContext, SubjectKey, Trade, TradeSide};
    use crate::queue::jobs::JobKind;
    use chrono::Utc;

    #[tokio::test]
    async fn test_generate_returns_model_reply() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"model":"gpt-4o-mini","choices":[{"message":{"content":"{\"score\":72}"}}]}"#)
            .create_async()
            .await;

        let llm = LLM::from_adapter("openai", Box::new(OpenAIAdapter::with_base_url("sk", &server.url())));
        let provider = LlmAnalysisProvider::new(llm, "gpt-4o-mini");
        let subject = Subject {
            key: SubjectKey::new(JobKind::TradeAnalysis, "t1"),
            owner_id: "u1".to_string(),
            analysis_status: None,
            analysis_error: None,
            analysis_updated_at: None,
            analysis: None,
            context: SubjectContext::Trade(Trade {
                id: "t1".to_string(),
                owner_id: "u1".to_string(),
                symbol: "CL".to_string(),
                side: TradeSide::Long,
                entry_price: 70.0,
                exit_price: None,
                quantity: 1.0,
                fees: 0.0,
                notes: None,
                created_at: Utc::now(),
                closed_at: None,
            }),
        };

        let reply = provider.generate(&subject).await.unwrap();
        assert_eq!(reply.content, r#"{"score":72}"#);
        assert_eq!(reply.model, "gpt-4o-mini");
    }
}
