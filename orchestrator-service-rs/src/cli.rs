// orchestrator-service-rs/src/cli.rs
// Interactive terminal: command parsing, result rendering, confirmation prompt

use std::fmt::Write as _;
use std::io::Write as _;

use async_trait::async_trait;
use shared_types::{CommandDescriptor, RequestOutcome, RequestRecord};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;

use crate::dispatch::Confirmer;
use crate::session::{CommandHistoryEntry, SessionStats};

const WIDE_RULE: usize = 80;
const NARROW_RULE: usize = 50;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliCommand {
    Empty,
    Help,
    History,
    /// `None` shows the current mode.
    Safety(Option<bool>),
    /// `None` shows the current timeout.
    Timeout(Option<u64>),
    InvalidTimeout(String),
    Stats,
    Export,
    Clear,
    Remote,
    Quit,
    Request(String),
}

impl CliCommand {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Self::Empty;
        }

        let lower = line.to_lowercase();
        let words: Vec<&str> = lower.split_whitespace().collect();
        match words.as_slice() {
            ["help"] => Self::Help,
            ["history"] => Self::History,
            ["stats"] => Self::Stats,
            ["export"] => Self::Export,
            ["clear"] => Self::Clear,
            ["remote"] => Self::Remote,
            ["quit"] | ["exit"] | ["q"] => Self::Quit,
            ["safety"] => Self::Safety(None),
            ["safety", "on"] => Self::Safety(Some(true)),
            ["safety", "off"] => Self::Safety(Some(false)),
            ["timeout"] => Self::Timeout(None),
            ["timeout", value] => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => Self::Timeout(Some(secs)),
                _ => Self::InvalidTimeout((*value).to_string()),
            },
            _ => Self::Request(line.to_string()),
        }
    }
}

fn rule(out: &mut String, width: usize) {
    let _ = writeln!(out, "{}", "=".repeat(width));
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "Yes"
    } else {
        "No"
    }
}

fn title_case(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Full report for a request that reached execution.
pub fn render_results(record: &RequestRecord, device_id: &str) -> String {
    let mut out = String::new();
    let fulfilled = record.request_fulfilled();
    let status = if record.execution_success && fulfilled {
        "SUCCESS"
    } else if record.execution_success {
        "PARTIAL SUCCESS"
    } else {
        "FAILED"
    };
    let elapsed = record
        .metrics
        .as_ref()
        .map(|m| format!("{:.2}s", m.elapsed_seconds))
        .unwrap_or_else(|| "N/A".to_string());

    out.push('\n');
    rule(&mut out, WIDE_RULE);
    let _ = writeln!(out, "EXECUTION RESULTS");
    rule(&mut out, WIDE_RULE);
    let _ = writeln!(out, "Device ID: {}", device_id);
    let _ = writeln!(out, "Request: {}", record.raw_request);
    let _ = writeln!(out, "Status: {}", status);
    let _ = writeln!(out, "Execution Time: {}", elapsed);

    if let Some(descriptor) = &record.descriptor {
        let _ = writeln!(out, "Safety Level: {}", descriptor.safety_level);
        let _ = writeln!(out, "\nGenerated Code:");
        let _ = writeln!(out, "{}", "-".repeat(40));
        let _ = writeln!(out, "{}", descriptor.code);
        let _ = writeln!(out, "\nCode Information:");
        let _ = writeln!(out, "- Explanation: {}", or_na(&descriptor.explanation));
        let _ = writeln!(out, "- Prerequisites: {}", or_na(&descriptor.prerequisites));
        let _ = writeln!(out, "- Estimated Time: {}", or_na(&descriptor.estimated_time));
        let _ = writeln!(out, "- Reversible: {}", yes_no(descriptor.reversible));
    }

    if !record.output.is_empty() && record.output != "Command executed successfully" {
        let _ = writeln!(out, "\nOutput:");
        let _ = writeln!(out, "{}", "-".repeat(40));
        let _ = writeln!(out, "{}", record.output);
    }

    let _ = writeln!(out, "\nPerformance Metrics:");
    if let Some(metrics) = &record.metrics {
        let exit_code = metrics
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "N/A".to_string());
        let _ = writeln!(out, "- Exit Code: {}", exit_code);
        let _ = writeln!(out, "- Timeout: {}", yes_no(metrics.timed_out));
    }
    let _ = writeln!(out, "- Request Fulfilled: {}", yes_no(fulfilled));
    if let Some(analysis) = &record.analysis {
        let _ = writeln!(out, "- Quality: {}", title_case(analysis.quality.as_str()));
        if !analysis.suggestions.is_empty() {
            let _ = writeln!(out, "\nSuggestions:");
            for (i, suggestion) in analysis.suggestions.iter().enumerate() {
                let _ = writeln!(out, "{}. {}", i + 1, suggestion);
            }
        }
    }
    rule(&mut out, WIDE_RULE);
    out
}

fn or_na(text: &str) -> &str {
    if text.trim().is_empty() {
        "N/A"
    } else {
        text
    }
}

/// What the operator sees once a request has finished, whatever the outcome.
pub fn render_outcome(record: &RequestRecord, device_id: &str) -> String {
    let reason = record.error.as_deref().unwrap_or("Safety concerns");
    match record.outcome {
        RequestOutcome::Blocked => format!(
            "Request Blocked: {}\nPlease modify your request or use safer alternatives.",
            reason
        ),
        RequestOutcome::Cancelled => "Operation cancelled by user.".to_string(),
        RequestOutcome::SystemError => format!("System Error: {}", reason),
        _ => render_results(record, device_id),
    }
}

pub fn render_help(device_id: &str) -> String {
    let mut out = String::new();
    out.push('\n');
    rule(&mut out, 60);
    let _ = writeln!(out, "COMMAND DISPATCH - HELP");
    rule(&mut out, 60);
    let _ = writeln!(out, "Device ID: {}", device_id);
    out.push_str(
        "Available Commands:\n\
         - Natural Language: generate and run a command\n\
         - help: Show this help menu\n\
         - history: View command history\n\
         - safety on/off: Toggle safety mode\n\
         - timeout <seconds>: Set execution timeout\n\
         - stats: Show session statistics\n\
         - remote: Show remote connection status\n\
         - export: Export session log\n\
         - clear: Clear the screen\n\
         - quit/exit: Exit the application\n\
         \nExamples:\n\
         - 'list files in current directory'\n\
         - 'show system information'\n\
         - 'check memory usage'\n",
    );
    rule(&mut out, 60);
    out
}

pub fn render_stats(
    stats: &SessionStats,
    model: &str,
    remote_connected: bool,
    listener_active: bool,
) -> String {
    let mut out = String::new();
    out.push('\n');
    rule(&mut out, NARROW_RULE);
    let _ = writeln!(out, "SESSION STATISTICS");
    rule(&mut out, NARROW_RULE);
    let _ = writeln!(out, "Device ID: {}", stats.device_id);
    let _ = writeln!(
        out,
        "Session Duration: {}m {}s",
        stats.duration_seconds / 60,
        stats.duration_seconds % 60
    );
    let _ = writeln!(out, "Total Commands: {}", stats.total_commands);
    let _ = writeln!(out, "Successful Commands: {}", stats.successful_executions);
    let _ = writeln!(out, "Success Rate: {:.1}%", stats.success_rate);
    let _ = writeln!(
        out,
        "Safety Mode: {}",
        if stats.safety_mode { "Enabled" } else { "Disabled" }
    );
    let _ = writeln!(out, "Timeout Setting: {}s", stats.timeout_seconds);
    let _ = writeln!(out, "Model: {}", model);
    let _ = writeln!(out, "Remote Connected: {}", yes_no(remote_connected));
    let _ = writeln!(
        out,
        "Remote Listener: {}",
        if listener_active { "Active" } else { "Inactive" }
    );
    rule(&mut out, NARROW_RULE);
    out
}

pub fn render_history(entries: &[CommandHistoryEntry]) -> String {
    if entries.is_empty() {
        return "No command history yet.".to_string();
    }
    let mut out = String::from("\nCommand History:\n");
    for (i, entry) in entries.iter().enumerate() {
        let _ = writeln!(out, "{}. {}", i + 1, entry.request);
    }
    out
}

/// Prompt text shown before a DANGEROUS command runs.
pub fn render_confirmation(descriptor: &CommandDescriptor) -> String {
    format!(
        "DANGEROUS OPERATION DETECTED\n\
         Explanation: {}\n\
         This operation may modify system settings or files.\n\
         Reversible: {}",
        or_na(&descriptor.explanation),
        yes_no(descriptor.reversible)
    )
}

/// Only an explicit `y` or `yes` confirms.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

/// Line reader over stdin shared by the REPL and the confirmation prompt.
pub struct LineReader {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl LineReader {
    pub fn stdin() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }

    /// Print `prompt` and wait for one line. `Ok(None)` on end of input.
    pub async fn prompt(&self, prompt: &str) -> std::io::Result<Option<String>> {
        let mut lines = self.lines.lock().await;
        print!("{}", prompt);
        std::io::stdout().flush()?;
        lines.next_line().await
    }
}

pub struct TerminalConfirmer<'a> {
    input: &'a LineReader,
}

impl<'a> TerminalConfirmer<'a> {
    pub fn new(input: &'a LineReader) -> Self {
        Self { input }
    }
}

#[async_trait]
impl<'a> Confirmer for TerminalConfirmer<'a> {
    async fn confirm(&self, descriptor: &CommandDescriptor) -> bool {
        println!("{}", render_confirmation(descriptor));
        match self.input.prompt("Do you want to proceed? (y/N): ").await {
            Ok(Some(answer)) => is_affirmative(&answer),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared_types::{AnalysisResult, ExecutionMetrics, ExecutionReport, Origin, QualityLabel, SafetyLevel};

    #[test]
    fn parses_builtin_commands_case_insensitively() {
        assert_eq!(CliCommand::parse("  "), CliCommand::Empty);
        assert_eq!(CliCommand::parse("HELP"), CliCommand::Help);
        assert_eq!(CliCommand::parse("q"), CliCommand::Quit);
        assert_eq!(CliCommand::parse("Exit"), CliCommand::Quit);
        assert_eq!(CliCommand::parse("safety"), CliCommand::Safety(None));
        assert_eq!(CliCommand::parse("safety OFF"), CliCommand::Safety(Some(false)));
        assert_eq!(CliCommand::parse("timeout 30"), CliCommand::Timeout(Some(30)));
        assert_eq!(
            CliCommand::parse("timeout soon"),
            CliCommand::InvalidTimeout("soon".into())
        );
        assert_eq!(
            CliCommand::parse("timeout 0"),
            CliCommand::InvalidTimeout("0".into())
        );
    }

    #[test]
    fn anything_else_is_a_request() {
        assert_eq!(
            CliCommand::parse("List files in /tmp"),
            CliCommand::Request("List files in /tmp".into())
        );
        assert_eq!(
            CliCommand::parse("safety check the firewall"),
            CliCommand::Request("safety check the firewall".into())
        );
    }

    #[test]
    fn confirmation_accepts_only_yes() {
        assert!(is_affirmative("y"));
        assert!(is_affirmative(" YES "));
        assert!(!is_affirmative(""));
        assert!(!is_affirmative("sure"));
    }

    fn executed(success: bool, fulfilled: bool) -> RequestRecord {
        let mut record = RequestRecord::new("r1", Origin::Local, "list files");
        record.transition(RequestOutcome::Processing).unwrap();
        let mut descriptor = CommandDescriptor::new("ls", SafetyLevel::Safe);
        descriptor.reversible = true;
        record.attach_descriptor(descriptor).unwrap();
        let now = Utc::now();
        record
            .attach_execution(ExecutionReport {
                success,
                output: "a\nb".into(),
                metrics: ExecutionMetrics {
                    started_at: now,
                    finished_at: now,
                    elapsed_seconds: 0.25,
                    timed_out: false,
                    exit_code: Some(if success { 0 } else { 1 }),
                    error_text: None,
                },
            })
            .unwrap();
        record
            .attach_analysis(AnalysisResult {
                request_fulfilled: fulfilled,
                quality: QualityLabel::Good,
                issues: vec![],
                suggestions: vec!["Review output".into()],
                risk_level: "low".into(),
                next_steps: "Task completed".into(),
            })
            .unwrap();
        record
    }

    #[test]
    fn results_banner_reflects_fulfilment() {
        let text = render_results(&executed(true, true), "dev00001");
        assert!(text.contains("Status: SUCCESS"));
        assert!(text.contains("Execution Time: 0.25s"));
        assert!(text.contains("- Reversible: Yes"));
        assert!(text.contains("- Quality: Good"));
        assert!(text.contains("1. Review output"));

        let text = render_results(&executed(true, false), "dev00001");
        assert!(text.contains("Status: PARTIAL SUCCESS"));

        let text = render_results(&executed(false, false), "dev00001");
        assert!(text.contains("Status: FAILED"));
        assert!(text.contains("- Exit Code: 1"));
    }

    #[test]
    fn blocked_outcome_shows_the_reason() {
        let mut record = RequestRecord::new("r2", Origin::Local, "wipe disk");
        record.transition(RequestOutcome::Processing).unwrap();
        record.set_error("Destroys data").unwrap();
        record.transition(RequestOutcome::Blocked).unwrap();
        let text = render_outcome(&record, "dev00001");
        assert!(text.starts_with("Request Blocked: Destroys data"));
    }

    #[test]
    fn stats_render_durations_and_rates() {
        let stats = SessionStats {
            device_id: "dev00001".into(),
            duration_seconds: 125,
            total_commands: 3,
            successful_executions: 2,
            success_rate: 66.6666,
            unique_commands: 2,
            safety_mode: true,
            timeout_seconds: 60,
        };
        let text = render_stats(&stats, "gpt-4o-mini", false, false);
        assert!(text.contains("Session Duration: 2m 5s"));
        assert!(text.contains("Success Rate: 66.7%"));
        assert!(text.contains("Remote Listener: Inactive"));
    }

    #[test]
    fn empty_history_says_so() {
        assert_eq!(render_history(&[]), "No command history yet.");
    }
}
