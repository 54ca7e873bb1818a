//! LLM client abstraction used by the LLM-backed judges.
//!
//! ## Example
//!
//! ```rust,ignore
//! use halo_core::llm::{AnthropicClient, ClientConfig, Provider};
//!
//! let client = AnthropicClient::new(ClientConfig::from_env(Provider::Anthropic)?)?;
//! ```

mod client;
mod types;

pub(crate) use client::build_http_client;
pub use client::{AnthropicClient, ClientConfig, LLMClient, OpenAIClient};
pub use types::{
    ChatMessage, ChatRole, CompletionRequest, CompletionResponse, Provider, StopReason,
    TokenUsage,
};
