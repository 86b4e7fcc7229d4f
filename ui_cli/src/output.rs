//! Output formatting utilities.

use std::io::{self, Write};

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

use crate::error::Result;
use crate::OutputFormat;

/// A machine-readable serialization target. Unlike [`OutputFormat`] this
/// has no table variant: items that render as prose in table mode can only
/// be serialized as JSON or YAML.
#[derive(Clone, Copy, Debug)]
pub enum SerialFormat {
    Json,
    Yaml,
}

/// Print data in the specified format.
pub fn print_data<T: Serialize + Tabled>(data: &[T], format: OutputFormat) -> Result<()> {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                let table = Table::new(data);
                println!("{}", table);
            }
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(data)?);
        }
        OutputFormat::Yaml => {
            println!("{}", serde_yaml_ng::to_string(data)?);
        }
    }
    Ok(())
}

/// Print a single item in the specified serialization.
pub fn print_item<T: Serialize>(item: &T, format: SerialFormat) -> Result<()> {
    match format {
        SerialFormat::Json => {
            println!("{}", serde_json::to_string_pretty(item)?);
        }
        SerialFormat::Yaml => {
            println!("{}", serde_yaml_ng::to_string(item)?);
        }
    }
    Ok(())
}

/// Print a success message.
pub fn success(msg: &str) {
    println!("{} {}", "✓".green().bold(), msg);
}

/// Print an info message.
pub fn info(msg: &str) {
    println!("{} {}", "→".blue(), msg);
}

/// Print a warning message.
pub fn warn(msg: &str) {
    println!("{} {}", "!".yellow().bold(), msg);
}

/// Print an error message.
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red().bold(), msg);
}

/// Print a section header.
pub fn section(title: &str) {
    println!("\n{}", title.bold().underline());
}

/// Ask the operator a yes/no question. Defaults to no.
pub fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{} {} [y/N] ", "?".cyan().bold(), prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    let answer = line.trim().to_ascii_lowercase();
    Ok(answer == "y" || answer == "yes")
}
