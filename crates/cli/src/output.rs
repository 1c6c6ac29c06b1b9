//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use diag_lib::task::{ProgressEvent, ProgressSink};
use diag_lib::SizeSummary;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human readable output (default)
    #[default]
    Default,
    /// JSON format
    Json,
}

/// Print a table from a list of items
pub fn print_table<T: Tabled + Serialize>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Default => {
            if items.is_empty() {
                println!("{}", "No items found".yellow());
                return;
            }
            let table = Table::new(items).with(Style::rounded()).to_string();
            println!("{}", table);
        }
        OutputFormat::Json => print_json(&items),
    }
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    if let Ok(json) = serde_json::to_string_pretty(value) {
        println!("{}", json);
    }
}

/// Print a success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message);
}

/// Print an error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message);
}

/// Print a warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message);
}

/// Print an info message
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2}Gi", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2}Mi", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2}Ki", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

#[derive(Tabled, Serialize)]
struct SizeRow {
    #[tabled(rename = "Host")]
    host: String,
    #[tabled(rename = "Files")]
    files: usize,
    #[tabled(rename = "Estimated Size")]
    size: String,
}

/// Render the dry-run estimate
pub fn print_size_summary(summary: &SizeSummary, format: OutputFormat) {
    if format == OutputFormat::Json {
        print_json(summary);
        return;
    }
    let rows: Vec<SizeRow> = summary
        .hosts
        .iter()
        .map(|(host, size)| SizeRow {
            host: host.clone(),
            files: size.files,
            size: format_bytes(size.bytes),
        })
        .collect();
    if !rows.is_empty() {
        print_table(&rows, format);
    }
    print_info(&format!(
        "Estimated size of data to collect: {}",
        format_bytes(summary.total())
    ));
}

/// Prints finished tasks as they complete
pub struct ConsoleProgress;

impl ProgressSink for ConsoleProgress {
    fn on_event(&self, event: &ProgressEvent) {
        if let ProgressEvent::Finished {
            label,
            error,
            done,
            total,
            ..
        } = event
        {
            let counter = format!("[{}/{}]", done, total).dimmed();
            match error {
                None => println!("{} {} {}", counter, "✓".green(), label),
                Some(e) => println!("{} {} {}: {}", counter, "✗".red(), label, e.red()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(2048), "2.00Ki");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00Mi");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00Gi");
    }
}
