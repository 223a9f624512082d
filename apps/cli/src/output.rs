//! Output formatting utilities

use crate::OutputFormat;
use console::{style, StyledObject};
use serde::Serialize;
use tubeq_types::JobStatus;

/// Print a value as pretty JSON, or through `Debug` for the other formats
pub fn print_output<T: Serialize + std::fmt::Debug>(
    value: &T,
    format: OutputFormat,
) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(value)?);
        }
        OutputFormat::Human | OutputFormat::Table => {
            println!("{:#?}", value);
        }
    }
    Ok(())
}

pub fn status_icon(status: JobStatus) -> StyledObject<&'static str> {
    match status {
        JobStatus::Completed => style("✓").green(),
        JobStatus::Downloading => style("↓").cyan(),
        JobStatus::Pending => style("·").dim(),
        JobStatus::Failed => style("✗").red(),
        JobStatus::Cancelled => style("○").dim(),
    }
}

/// Shorten to `max` characters, marking the cut with "..."
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max.saturating_sub(3)).collect();
    format!("{}...", kept)
}
