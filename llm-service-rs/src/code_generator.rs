// llm-service-rs/src/code_generator.rs
// Turns a natural-language request into a CommandDescriptor via a TextOracle

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use shared_types::CommandDescriptor;
use tracing::{debug, warn};

use crate::json_extract::extract_json_object;
use crate::{LlmError, TextOracle};

/// Code run when the oracle could not be reached at all.
pub const GENERATION_FAILED_CODE: &str = "echo 'Command generation failed'";

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("oracle unavailable: {0}")]
    Unavailable(#[from] LlmError),

    #[error("oracle output malformed: {0}")]
    Malformed(String),
}

/// Produces a command descriptor for a request.
///
/// `context` carries request metadata (timestamp, session id, device id,
/// command id) that is forwarded to the model verbatim.
#[async_trait]
pub trait CodeOracle: Send + Sync {
    async fn generate(
        &self,
        request: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<CommandDescriptor, OracleError>;
}

/// Parse model output into a descriptor. Only `code` and `safety_level` are
/// required.
pub fn parse_descriptor(text: &str) -> Result<CommandDescriptor, OracleError> {
    let json = extract_json_object(text)
        .ok_or_else(|| OracleError::Malformed("no JSON object found".to_string()))?;
    serde_json::from_str(json).map_err(|e| OracleError::Malformed(e.to_string()))
}

pub struct LlmCodeGenerator {
    oracle: Arc<dyn TextOracle>,
    shell: String,
}

impl LlmCodeGenerator {
    /// `shell` is the interpreter name the generated code must target.
    pub fn new(oracle: Arc<dyn TextOracle>, shell: impl Into<String>) -> Self {
        Self {
            oracle,
            shell: shell.into(),
        }
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are an expert {shell} developer and system administrator.\n\
             Generate safe, efficient {shell} code for the user's request.\n\
             \n\
             CRITICAL: Always return valid JSON only. No markdown, no text outside the JSON.\n\
             \n\
             Safety Levels:\n\
             - SAFE: No system risks\n\
             - CAUTION: Requires user attention\n\
             - DANGEROUS: High risk operation\n\
             - BLOCKED: Should not be executed",
            shell = self.shell
        )
    }

    fn prompt(&self, request: &str, context: &BTreeMap<String, String>) -> String {
        let context_info = if context.is_empty() {
            String::new()
        } else {
            // A BTreeMap of strings always serializes.
            format!(
                "\nContext: {}",
                serde_json::to_string_pretty(context).unwrap_or_default()
            )
        };
        format!(
            "Generate {shell} code for: \"{request}\"{context_info}\n\n\
             Return ONLY valid JSON in this exact format:\n\
             {{\n\
             \x20   \"code\": \"{shell} code here\",\n\
             \x20   \"safety_level\": \"SAFE\",\n\
             \x20   \"explanation\": \"What the code does\",\n\
             \x20   \"prerequisites\": \"Requirements needed\",\n\
             \x20   \"estimated_time\": \"Expected execution time\",\n\
             \x20   \"reversible\": true\n\
             }}",
            shell = self.shell
        )
    }
}

#[async_trait]
impl CodeOracle for LlmCodeGenerator {
    async fn generate(
        &self,
        request: &str,
        context: &BTreeMap<String, String>,
    ) -> Result<CommandDescriptor, OracleError> {
        let response = match self
            .oracle
            .complete(&self.system_prompt(), &self.prompt(request, context))
            .await
        {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "code generation oracle unavailable, using fallback");
                let mut fallback = CommandDescriptor::unparsed(GENERATION_FAILED_CODE);
                fallback.explanation = format!("Code generation failed: {}", err);
                return Ok(fallback);
            }
        };

        match parse_descriptor(&response) {
            Ok(descriptor) => {
                debug!(safety_level = %descriptor.safety_level, "descriptor generated");
                Ok(descriptor)
            }
            Err(err) => {
                warn!(error = %err, "could not parse oracle output, wrapping raw text");
                Ok(CommandDescriptor::unparsed(response.trim()))
            }
        }
    }
}
