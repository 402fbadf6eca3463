//! Data model shared by every crate of the dispatch engine: command
//! descriptors, execution metrics, analysis results and request records.

pub mod model;
pub mod record;

pub use model::{
    AnalysisResult, CommandDescriptor, ExecutionMetrics, ExecutionReport, QualityLabel,
    SafetyLevel, UnknownSafetyLevel,
};
pub use record::{Origin, RecordError, RequestOutcome, RequestRecord};
