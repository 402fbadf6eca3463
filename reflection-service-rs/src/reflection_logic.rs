// reflection-service-rs/src/reflection_logic.rs
// Core reflection logic for judging whether an execution fulfilled its request

use std::sync::Arc;

use llm_service::json_extract::extract_json_object;
use llm_service::TextOracle;
use serde::Deserialize;
use shared_types::{AnalysisResult, CommandDescriptor, ExecutionMetrics, QualityLabel};
use tracing::{debug, warn};

const SYSTEM_PROMPT: &str = "You are a command execution result analyzer. \
Analyze shell execution results precisely.\n\
Return ONLY valid JSON format. No markdown or extra text.";

/// Oracle output before the quality label is normalised.
#[derive(Debug, Deserialize)]
struct RawAnalysis {
    request_fulfilled: bool,
    #[serde(default)]
    execution_quality: String,
    #[serde(default)]
    issues_found: Vec<String>,
    #[serde(default)]
    suggestions: Vec<String>,
    #[serde(default)]
    risk_level: String,
    #[serde(default)]
    next_steps: String,
}

impl From<RawAnalysis> for AnalysisResult {
    fn from(raw: RawAnalysis) -> Self {
        AnalysisResult {
            request_fulfilled: raw.request_fulfilled,
            quality: QualityLabel::from_label(&raw.execution_quality),
            issues: raw.issues_found,
            suggestions: raw.suggestions,
            risk_level: raw.risk_level,
            next_steps: raw.next_steps,
        }
    }
}

/// Deterministic assessment used whenever the oracle cannot help.
pub fn fallback_analysis(execution_success: bool, output: &str) -> AnalysisResult {
    let fulfilled = execution_success && !output.to_lowercase().contains("error");
    if execution_success {
        AnalysisResult {
            request_fulfilled: fulfilled,
            quality: QualityLabel::Good,
            issues: Vec::new(),
            suggestions: vec!["Review output".to_string()],
            risk_level: "low".to_string(),
            next_steps: "Task completed".to_string(),
        }
    } else {
        AnalysisResult {
            request_fulfilled: false,
            quality: QualityLabel::Poor,
            issues: vec!["Execution failed".to_string()],
            suggestions: vec!["Check command syntax".to_string()],
            risk_level: "low".to_string(),
            next_steps: "Debug and retry".to_string(),
        }
    }
}

/// Parse oracle text into an analysis, tolerating fences and prose.
pub fn parse_analysis(text: &str) -> Option<AnalysisResult> {
    let json = extract_json_object(text)?;
    serde_json::from_str::<RawAnalysis>(json)
        .map(AnalysisResult::from)
        .map_err(|e| debug!(error = %e, "analysis JSON did not match schema"))
        .ok()
}

/// Judges an execution, through the reasoning oracle when one is configured.
#[derive(Clone, Default)]
pub struct ResultAnalyzer {
    oracle: Option<Arc<dyn TextOracle>>,
}

impl ResultAnalyzer {
    pub fn new(oracle: Arc<dyn TextOracle>) -> Self {
        Self {
            oracle: Some(oracle),
        }
    }

    /// Analyzer that only ever uses [`fallback_analysis`].
    pub fn offline() -> Self {
        Self { oracle: None }
    }

    pub fn has_oracle(&self) -> bool {
        self.oracle.is_some()
    }

    /// Never fails: oracle errors and unparseable output degrade to the
    /// fallback.
    pub async fn analyze(
        &self,
        request: &str,
        descriptor: &CommandDescriptor,
        execution_success: bool,
        output: &str,
        metrics: &ExecutionMetrics,
    ) -> AnalysisResult {
        let Some(oracle) = &self.oracle else {
            return fallback_analysis(execution_success, output);
        };

        let prompt = build_prompt(request, descriptor, execution_success, output, metrics);
        match oracle.complete(SYSTEM_PROMPT, &prompt).await {
            Ok(text) => match parse_analysis(&text) {
                Some(analysis) => analysis,
                None => {
                    warn!("analysis oracle returned unparseable output, using fallback");
                    fallback_analysis(execution_success, output)
                }
            },
            Err(err) => {
                warn!(error = %err, "analysis oracle unavailable, using fallback");
                fallback_analysis(execution_success, output)
            }
        }
    }
}

fn build_prompt(
    request: &str,
    descriptor: &CommandDescriptor,
    execution_success: bool,
    output: &str,
    metrics: &ExecutionMetrics,
) -> String {
    let code_info = serde_json::to_string_pretty(descriptor).unwrap_or_default();
    let metrics = serde_json::to_string_pretty(metrics).unwrap_or_default();
    format!(
        "Analyze this execution:\n\n\
         Request: {request}\n\
         Code Info: {code_info}\n\
         Success: {execution_success}\n\
         Output: {output}\n\
         Metrics: {metrics}\n\n\
         Return ONLY valid JSON:\n\
         {{\n\
         \x20   \"request_fulfilled\": true,\n\
         \x20   \"execution_quality\": \"excellent\",\n\
         \x20   \"issues_found\": [],\n\
         \x20   \"suggestions\": [\"suggestion\"],\n\
         \x20   \"risk_level\": \"low\",\n\
         \x20   \"next_steps\": \"action\"\n\
         }}"
    )
}
