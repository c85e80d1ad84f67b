//! Output formatters for run summaries
//!
//! Provides table, JSON, CSV and one-line summary output.

use std::io::Write;

use crate::models::{CaseResult, HookFailure, Outcome, RunSummary};

/// Output format options
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputFormat {
    Table,
    Json,
    JsonPretty,
    Csv,
    Summary,
}

impl OutputFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "table" => Some(OutputFormat::Table),
            "json" => Some(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Some(OutputFormat::JsonPretty),
            "csv" => Some(OutputFormat::Csv),
            "summary" => Some(OutputFormat::Summary),
            _ => None,
        }
    }
}

/// Result formatter
pub struct ResultFormatter {
    format: OutputFormat,
    colorize: bool,
}

impl ResultFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            colorize: true,
        }
    }

    pub fn no_color(mut self) -> Self {
        self.colorize = false;
        self
    }

    /// Format a single case result
    pub fn format_result(&self, result: &CaseResult) -> String {
        match self.format {
            OutputFormat::Table => self.format_result_table(result),
            OutputFormat::Json => serde_json::to_string(result).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(result).unwrap_or_default(),
            OutputFormat::Csv => csv_rows(std::slice::from_ref(result)).unwrap_or_default(),
            OutputFormat::Summary => result.to_string(),
        }
    }

    fn outcome_label(&self, outcome: Outcome) -> String {
        let label = format!("{} {:12}", outcome.symbol(), outcome.to_string());
        if !self.colorize {
            return label;
        }
        let color = match outcome {
            Outcome::Passed => "32",
            Outcome::Skipped | Outcome::Inconclusive => "33",
            Outcome::Failed | Outcome::Cancelled | Outcome::TimedOut => "31",
        };
        format!("\x1b[{color}m{label}\x1b[0m")
    }

    fn format_result_table(&self, result: &CaseResult) -> String {
        let mut line = format!(
            "{} {:40} [{:>6}ms]",
            self.outcome_label(result.outcome),
            result.display_name,
            result.duration_ms
        );
        if result.attempts > 1 {
            line.push_str(&format!(" x{}", result.attempts));
        }
        if let Some(message) = result.message.as_deref().and_then(|m| m.lines().next()) {
            line.push_str(&format!("\n      {message}"));
        }
        line
    }

    /// Format a run summary
    pub fn format_summary(&self, summary: &RunSummary) -> String {
        match self.format {
            OutputFormat::Table => self.format_summary_table(summary),
            OutputFormat::Json => serde_json::to_string(summary).unwrap_or_default(),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(summary).unwrap_or_default(),
            OutputFormat::Csv => csv_rows(&summary.results).unwrap_or_default(),
            OutputFormat::Summary => self.format_summary_brief(summary),
        }
    }

    fn format_summary_table(&self, summary: &RunSummary) -> String {
        let mut output = String::new();

        output.push_str("\n═══════════════════════════════════════════════════════════════\n");
        output.push_str(&format!(
            " Test Run {}\n",
            summary.started_at.format("%Y-%m-%d %H:%M:%S")
        ));
        output.push_str("═══════════════════════════════════════════════════════════════\n");

        let mut fixture = None;
        for result in &summary.results {
            if fixture != Some(result.fixture_id.as_str()) {
                fixture = Some(result.fixture_id.as_str());
                output.push_str(&format!("\n {}\n", result.fixture_id));
            }
            output.push_str(&format!("   {}\n", self.format_result_table(result)));
        }

        if !summary.hook_failures.is_empty() {
            output.push_str("\n Hook failures:\n");
            for failure in &summary.hook_failures {
                output.push_str(&format!("   - {}\n", format_hook_failure(failure)));
            }
        }

        output.push_str("\n───────────────────────────────────────────────────────────────\n");
        let totals = summary.totals();
        let failed = if self.colorize && totals.failed > 0 {
            format!("\x1b[31m{}\x1b[0m", totals.failed)
        } else {
            totals.failed.to_string()
        };
        output.push_str(&format!(
            " Total: {} | Pass: {} | Fail: {} | Skip: {} | Inconclusive: {}\n",
            summary.total, totals.passed, failed, totals.skipped, totals.inconclusive
        ));
        if summary.cancelled > 0 || summary.timed_out > 0 {
            output.push_str(&format!(
                " (of which cancelled: {}, timed out: {})\n",
                summary.cancelled, summary.timed_out
            ));
        }
        output.push_str(&format!(
            " Pass Rate: {:5.1}% | Duration: {}ms\n",
            summary.pass_rate(),
            summary.total_duration_ms
        ));

        output
    }

    fn format_summary_brief(&self, summary: &RunSummary) -> String {
        let totals = summary.totals();
        format!(
            "{}/{} passed, {} failed, {} skipped, {} inconclusive ({:.1}%) in {}ms",
            totals.passed,
            summary.total,
            totals.failed,
            totals.skipped,
            totals.inconclusive,
            summary.pass_rate(),
            summary.total_duration_ms
        )
    }
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table)
    }
}

fn format_hook_failure(failure: &HookFailure) -> String {
    format!(
        "{} of {} ended {}: {}",
        failure.hook, failure.owner, failure.outcome, failure.message
    )
}

fn csv_rows(results: &[CaseResult]) -> anyhow::Result<String> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record([
        "case_id",
        "fixture_id",
        "display_name",
        "outcome",
        "duration_ms",
        "attempts",
        "message",
    ])?;
    for result in results {
        writer.write_record([
            result.case_id.as_str(),
            result.fixture_id.as_str(),
            result.display_name.as_str(),
            result.outcome.to_string().as_str(),
            result.duration_ms.to_string().as_str(),
            result.attempts.to_string().as_str(),
            result.message.as_deref().unwrap_or(""),
        ])?;
    }
    let bytes = writer.into_inner().map_err(|e| anyhow::anyhow!("{}", e.error()))?;
    Ok(String::from_utf8(bytes)?)
}

/// Write a summary to a file
pub fn write_summary_to_file(
    path: &str,
    summary: &RunSummary,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let formatter = ResultFormatter::new(format).no_color();
    let content = formatter.format_summary(summary);

    let mut file = std::fs::File::create(path)?;
    file.write_all(content.as_bytes())?;

    Ok(())
}
