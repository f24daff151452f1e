//! Prompt file loading and result file writing.

use std::fmt::Write as _;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::metrics::{ResultRecord, RunSummary};

/// Split file content into prompts: one per line, blank lines skipped.
pub fn parse_prompts(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Read the prompt file.
///
/// # Errors
///
/// Returns [`Error::NoPrompts`] if the file has no non-blank line.
pub fn load_prompts(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    info!(path = %path.display(), "loading prompts from file");

    let content = std::fs::read_to_string(path)?;
    let prompts = parse_prompts(&content);
    if prompts.is_empty() {
        return Err(Error::NoPrompts(path.display().to_string()));
    }

    for (i, prompt) in prompts.iter().enumerate() {
        debug!("{:3} prompt: {}", i + 1, prompt);
    }
    Ok(prompts)
}

/// Result file format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Markdown-style text.
    #[default]
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "txt" | "md" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("unknown output format: {other}"))),
        }
    }
}

/// Render records as text, in retirement order.
pub fn render_text(records: &[ResultRecord], date: DateTime<Local>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Results from parallel processing");
    let _ = writeln!(out, "# Total prompts: {}", records.len());
    let _ = writeln!(out, "# Date: {}", date.to_rfc3339());
    out.push('\n');

    for (i, record) in records.iter().enumerate() {
        let n = i + 1;
        let _ = writeln!(out, "### Prompt {n}:\n{}\n", record.prompt.trim());
        let _ = writeln!(out, "### Response {n}:\n{}\n", record.response.trim());
        let _ = writeln!(out, "### Stats {n}:");
        let _ = writeln!(
            out,
            "Processing time: {:.3} seconds",
            record.duration.as_secs_f64()
        );
        let _ = writeln!(out, "Prompt tokens: {}", record.prompt_tokens);
        let _ = writeln!(out, "Response tokens: {}", record.response_tokens);
        let _ = writeln!(out, "Total tokens: {}", record.total_tokens());
        let _ = writeln!(
            out,
            "Token generation speed: {:.2} tokens/second",
            record.tokens_per_second()
        );
        out.push_str("\n---\n\n");
    }

    out
}

#[derive(Serialize)]
struct JsonResults<'a> {
    total_prompts: usize,
    date: String,
    summary: &'a RunSummary,
    results: &'a [ResultRecord],
}

/// Render records and the run summary as pretty JSON.
pub fn render_json(
    records: &[ResultRecord],
    summary: &RunSummary,
    date: DateTime<Local>,
) -> Result<String> {
    let doc = JsonResults {
        total_prompts: records.len(),
        date: date.to_rfc3339(),
        summary,
        results: records,
    };
    Ok(serde_json::to_string_pretty(&doc)?)
}

/// Write the result file.
pub fn write_results(
    path: impl AsRef<Path>,
    format: OutputFormat,
    records: &[ResultRecord],
    summary: &RunSummary,
) -> Result<()> {
    let path = path.as_ref();
    info!(path = %path.display(), "saving results to file");

    let date = Local::now();
    let content = match format {
        OutputFormat::Text => render_text(records, date),
        OutputFormat::Json => render_json(records, summary, date)?,
    };
    std::fs::write(path, content)?;

    info!("results saved successfully");
    Ok(())
}
