use async_trait::async_trait;
use std::time::Duration;

use crate::models::Subject;
use crate::types::{LLMRequest, LLMResponse};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("LLM API error ({status}): {message}")]
    Http { status: u16, message: String },

    #[error("LLM request failed: {0}")]
    Network(String),

    #[error("LLM call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unexpected LLM response: {0}")]
    InvalidResponse(String),

    #[error("LLM provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Rate limits, server errors and transport problems are worth another
    /// attempt; any other 4xx means the request itself is wrong.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProviderError::Http { status, .. } => *status == 429 || *status >= 500,
            ProviderError::Network(_) | ProviderError::Timeout(_) | ProviderError::InvalidResponse(_) => true,
            ProviderError::NotConfigured(_) => false,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProviderError::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

#[async_trait]
pub trait LLMAdapter: Send + Sync {
    async fn create_chat_completion(&self, request: &LLMRequest) -> Result<LLMResponse, ProviderError>;
}

/// Raw provider output for one subject, before parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub content: String,
    pub model: String,
}

#[async_trait]
pub trait AnalysisProvider: Send + Sync {
    async fn generate(&self, subject: &Subject) -> Result<ProviderReply, ProviderError>;
}

pub struct LLMProviderConfig {
    pub name: String,
    pub api_key: String,
    pub base_url: Option<String>,
}

pub struct LLM {
    adapter: Box<dyn LLMAdapter>,
    provider_name: String,
}

impl LLM {
    pub fn new(provider: LLMProviderConfig) -> Result<Self, ProviderError> {
        if provider.api_key.trim().is_empty() {
            return Err(ProviderError::NotConfigured(format!("missing API key for {}", provider.name)));
        }

        let adapter: Box<dyn LLMAdapter> = match (provider.name.as_str(), provider.base_url.as_deref()) {
            ("openai", Some(base_url)) => {
                Box::new(crate::llm::openai::OpenAIAdapter::with_base_url(&provider.api_key, base_url))
            }
            ("openai", None) => Box::new(crate::llm::openai::OpenAIAdapter::new(&provider.api_key)),
            ("openrouter", Some(base_url)) => Box::new(crate::llm::openrouter::OpenRouterAdapter::with_base_url(
                &provider.api_key,
                base_url,
            )),
            ("openrouter", None) => Box::new(crate::llm::openrouter::OpenRouterAdapter::new(&provider.api_key)),
            (other, _) => return Err(ProviderError::NotConfigured(format!("unsupported provider: {}", other))),
        };

        Ok(Self {
            adapter,
            provider_name: provider.name,
        })
    }

    pub fn from_adapter(name: impl Into<String>, adapter: Box<dyn LLMAdapter>) -> Self {
        Self {
            adapter,
            provider_name: name.into(),
        }
    }

    pub fn provider_name(&self) -> &str {
        &self.provider_name
    }

    pub async fn create_chat_completion(&self, request: &LLMRequest) -> Result<LLMResponse, ProviderError> {
        self.adapter.create_chat_completion(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        let http = |status| ProviderError::Http { status, message: String::new() };
        assert!(http(429).is_retryable());
        assert!(http(500).is_retryable());
        assert!(http(503).is_retryable());
        assert!(!http(400).is_retryable());
        assert!(!http(401).is_retryable());
        assert!(!http(404).is_retryable());
        assert!(ProviderError::Network("reset".into()).is_retryable());
        assert!(ProviderError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(!ProviderError::NotConfigured("x".into()).is_retryable());
    }

    #[test]
    fn test_selector_rejects_unknown_or_unkeyed_provider() {
        let unknown = LLM::new(LLMProviderConfig {
            name: "anthropic".into(),
            api_key: "sk-test".into(),
            base_url: None,
        });
        assert!(matches!(unknown, Err(ProviderError::NotConfigured(_))));

        let unkeyed = LLM::new(LLMProviderConfig {
            name: "openai".into(),
            api_key: " ".into(),
            base_url: None,
        });
        assert!(matches!(unkeyed, Err(ProviderError::NotConfigured(_))));

        let ok = LLM::new(LLMProviderConfig {
            name: "openrouter".into(),
            api_key: "sk-or".into(),
            base_url: None,
        })
        .unwrap();
        assert_eq!(ok.provider_name(), "openrouter");
    }
}
