//! LLM-backed oracles.
//!
//! [`TextOracle`] is the seam every model call goes through: the HTTP client
//! implements it, and tests substitute canned implementations. The code
//! generator builds on it to produce [`shared_types::CommandDescriptor`]s.

mod code_generator;
pub mod json_extract;
mod llm_client;

pub use code_generator::{
    parse_descriptor, CodeOracle, LlmCodeGenerator, OracleError, GENERATION_FAILED_CODE,
};
pub use llm_client::{LlmClient, LlmError};

use async_trait::async_trait;

/// A model that answers a prompt with free text.
#[async_trait]
pub trait TextOracle: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, LlmError>;
}
