//! Output formatting utilities

use clap::ValueEnum;
use colored::Colorize;
use operator_lib::{Phase, RiskLevel};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for CLI commands
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Print rows as a table
pub fn print_table<T: Tabled>(rows: &[T]) {
    if rows.is_empty() {
        println!("{}", "No items found".yellow());
        return;
    }
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{}", table);
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
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

/// Format a USD amount
pub fn format_currency(amount: f64) -> String {
    format!("${:.2}", amount)
}

/// Format confidence as percentage
pub fn format_confidence(confidence: f64) -> String {
    format!("{:.0}%", confidence * 100.0)
}

/// Color a policy phase
pub fn color_phase(phase: Phase) -> String {
    let text = phase.as_str();
    match phase {
        Phase::Pending | Phase::Analyzing => text.yellow().to_string(),
        Phase::Ready | Phase::Applying => text.blue().to_string(),
        Phase::Applied => text.green().to_string(),
        Phase::Failed | Phase::RolledBack => text.red().to_string(),
    }
}

/// Color a risk level
pub fn color_risk(level: RiskLevel) -> String {
    let text = level.as_str();
    match level {
        RiskLevel::Low => text.green().to_string(),
        RiskLevel::Medium => text.yellow().to_string(),
        RiskLevel::High | RiskLevel::Critical => text.red().to_string(),
    }
}

/// Color confidence based on value
pub fn color_confidence(confidence: f64) -> String {
    let formatted = format_confidence(confidence);
    if confidence >= 0.8 {
        formatted.green().to_string()
    } else if confidence >= 0.6 {
        formatted.yellow().to_string()
    } else {
        formatted.red().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_currency() {
        assert_eq!(format_currency(1234.5), "$1234.50");
        assert_eq!(format_currency(0.0), "$0.00");
    }

    #[test]
    fn test_format_confidence() {
        assert_eq!(format_confidence(0.85), "85%");
        assert_eq!(format_confidence(1.0), "100%");
    }
}
