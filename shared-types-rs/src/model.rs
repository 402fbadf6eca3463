// shared-types-rs/src/model.rs
// Descriptors, metrics and analysis results exchanged between the dispatch stages

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Risk level declared by the code-generation oracle for a candidate command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SafetyLevel {
    /// No system risk
    Safe,
    /// Requires operator attention
    Caution,
    /// High risk operation
    Dangerous,
    /// Must never be executed
    Blocked,
}

impl SafetyLevel {
    pub const ALL: [SafetyLevel; 4] = [
        SafetyLevel::Safe,
        SafetyLevel::Caution,
        SafetyLevel::Dangerous,
        SafetyLevel::Blocked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Safe => "SAFE",
            Self::Caution => "CAUTION",
            Self::Dangerous => "DANGEROUS",
            Self::Blocked => "BLOCKED",
        }
    }
}

impl fmt::Display for SafetyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown safety level: {0}")]
pub struct UnknownSafetyLevel(pub String);

impl FromStr for SafetyLevel {
    type Err = UnknownSafetyLevel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "SAFE" => Ok(Self::Safe),
            "CAUTION" => Ok(Self::Caution),
            "DANGEROUS" => Ok(Self::Dangerous),
            "BLOCKED" => Ok(Self::Blocked),
            _ => Err(UnknownSafetyLevel(s.to_string())),
        }
    }
}

impl Serialize for SafetyLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SafetyLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Structured description of a candidate command.
///
/// Only `code` and `safety_level` are mandatory when parsing oracle output;
/// the descriptive metadata falls back to empty values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub code: String,
    pub safety_level: SafetyLevel,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub prerequisites: String,
    #[serde(default)]
    pub estimated_time: String,
    #[serde(default)]
    pub reversible: bool,
}

impl CommandDescriptor {
    pub fn new(code: impl Into<String>, safety_level: SafetyLevel) -> Self {
        Self {
            code: code.into(),
            safety_level,
            explanation: String::new(),
            prerequisites: String::new(),
            estimated_time: String::new(),
            reversible: false,
        }
    }

    pub fn with_explanation(mut self, explanation: impl Into<String>) -> Self {
        self.explanation = explanation.into();
        self
    }

    /// Descriptor used when oracle output cannot be parsed: the raw text
    /// becomes the code and the risk is raised to CAUTION.
    pub fn unparsed(raw: impl Into<String>) -> Self {
        Self {
            code: raw.into(),
            safety_level: SafetyLevel::Caution,
            explanation: "Generated code (parsing failed)".to_string(),
            prerequisites: "None specified".to_string(),
            estimated_time: "Unknown".to_string(),
            reversible: false,
        }
    }
}

/// Timing and exit information for one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_seconds: f64,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub error_text: Option<String>,
}

/// What the executor hands back for one command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,
    pub output: String,
    pub metrics: ExecutionMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityLabel {
    Excellent,
    Good,
    Poor,
    Unknown,
}

impl QualityLabel {
    /// Lenient mapping used for oracle output; anything unrecognised is `Unknown`.
    pub fn from_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "excellent" => Self::Excellent,
            "good" => Self::Good,
            "poor" => Self::Poor,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Poor => "poor",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative assessment of an execution.
///
/// Field names follow the reasoning oracle's JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub request_fulfilled: bool,
    #[serde(rename = "execution_quality")]
    pub quality: QualityLabel,
    #[serde(rename = "issues_found", default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub risk_level: String,
    #[serde(default)]
    pub next_steps: String,
}
