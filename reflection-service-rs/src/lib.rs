// reflection-service-rs/src/lib.rs
// Result analysis for executed commands

mod reflection_logic;

pub use reflection_logic::{fallback_analysis, parse_analysis, ResultAnalyzer};
