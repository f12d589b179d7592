// LLM abstraction layer

pub mod analyst;
pub mod openai;
pub mod openrouter;
pub mod prompt;
pub mod provider;

pub use analyst::LlmAnalysisProvider;
pub use provider::*;
