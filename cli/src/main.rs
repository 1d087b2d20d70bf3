//! secbox CLI - Command-line interface for the secbox orchestrator
//!
//! Runs commands in the tooling container and controls the container and
//! background task

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use reqwest::blocking::{Client, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// secbox CLI - Run security tools in a disposable container
#[derive(Parser)]
#[command(name = "secbox")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "CLI for the secbox orchestrator", long_about = None)]
struct Cli {
    /// secbox API URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    api_url: String,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, ValueEnum)]
enum Action {
    Start,
    Stop,
    Status,
}

impl Action {
    fn as_str(&self) -> &'static str {
        match self {
            Action::Start => "start",
            Action::Stop => "stop",
            Action::Status => "status",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a shell command in the container
    Exec {
        /// Command line, passed to the container's shell
        command: String,
    },

    /// Start, stop or inspect the container
    Vm {
        #[arg(value_enum)]
        action: Action,

        /// Remove the container after stopping it
        #[arg(long)]
        remove: bool,
    },

    /// Control the background task
    Task {
        #[arg(value_enum)]
        action: Action,

        /// Helper parameters as KEY=VALUE
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// List live terminal sessions
    Sessions,

    /// Get server health status
    Health,
}

#[derive(Debug, Serialize)]
struct ExecuteRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
    #[serde(default)]
    output: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
    version: String,
    uptime_seconds: u64,
    active_sessions: u64,
    #[serde(default)]
    engine_version: Option<String>,
    container_status: String,
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{}'", raw)),
    }
}

/// Fail with the server's `{error, output?}` body on non-success statuses
fn check(response: Response, what: &str) -> Result<Value> {
    let status = response.status();
    if status.is_success() {
        return response.json().context("Failed to parse response");
    }

    let text = response.text().unwrap_or_else(|_| "Unknown error".to_string());
    match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => {
            if let Some(output) = body.output.filter(|o| !o.is_empty()) {
                eprintln!("{}", output.trim_end().red());
            }
            anyhow::bail!("{} failed ({}): {}", what, status, body.error)
        }
        Err(_) => anyhow::bail!("{} failed ({}): {}", what, status, text),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let json = cli.output == OutputFormat::Json;

    match cli.command {
        Commands::Exec { command } => {
            let request = ExecuteRequest { command: &command };

            let response = client
                .post(format!("{}/api/execute", cli.api_url))
                .json(&request)
                .send()
                .context("Failed to send request")?;
            let result = check(response, "Command")?;

            if json {
                print_json(&result)?;
            } else {
                print!("{}", result["output"].as_str().unwrap_or_default());
            }
        }

        Commands::Vm { action, remove } => {
            let response = client
                .post(format!("{}/api/vm", cli.api_url))
                .json(&serde_json::json!({ "action": action.as_str(), "remove": remove }))
                .send()
                .context("Failed to send request")?;
            let result = check(response, "Container action")?;

            if json {
                print_json(&result)?;
            } else {
                let status = result["status"].as_str().unwrap_or("?");
                println!(
                    "{} {} {}",
                    "Container:".bright_cyan(),
                    result["container"].as_str().unwrap_or("?"),
                    if result["running"].as_bool() == Some(true) {
                        status.green()
                    } else {
                        status.yellow()
                    }
                );
                if let Some(id) = result["id"].as_str() {
                    println!("{} {}", "ID:".bright_cyan(), id);
                }
            }
        }

        Commands::Task { action, params } => {
            let mut body: BTreeMap<String, String> = params.into_iter().collect();
            body.insert("action".to_string(), action.as_str().to_string());

            let response = client
                .post(format!("{}/api/tasks", cli.api_url))
                .json(&body)
                .send()
                .context("Failed to send request")?;
            let result = check(response, "Task action")?;

            if json {
                print_json(&result)?;
            } else {
                println!(
                    "{} {}",
                    "Status:".bright_cyan(),
                    result["status"].as_str().unwrap_or("?")
                );
                if let Some(url) = result["url"].as_str() {
                    println!("{} {}", "URL:".bright_cyan(), url.bright_green());
                }
                if let Some(error) = result["error"].as_str() {
                    println!("{} {}", "Error:".bright_cyan(), error.red());
                }
                for (label, key) in [("Credentials:", "credentials"), ("IPs:", "ips")] {
                    let Some(lines) = result[key].as_array().filter(|l| !l.is_empty()) else {
                        continue;
                    };
                    println!("{}", label.bright_cyan());
                    for line in lines {
                        println!("  {}", line.as_str().unwrap_or_default());
                    }
                }
            }
        }

        Commands::Sessions => {
            let response = client
                .get(format!("{}/api/terminal/sessions", cli.api_url))
                .send()
                .context("Failed to list sessions")?;
            let result = check(response, "Session listing")?;

            if json {
                print_json(&result)?;
            } else {
                let sessions = result["sessions"].as_array().context("Invalid response")?;
                println!("{} {}", "Terminal sessions:".bright_cyan().bold(), sessions.len());
                for session in sessions {
                    let size = match (session["size"]["cols"].as_u64(), session["size"]["rows"].as_u64()) {
                        (Some(cols), Some(rows)) => format!("{}x{}", cols, rows),
                        _ => "-".to_string(),
                    };
                    println!(
                        "  {} {} {} {}",
                        session["session_id"].as_str().unwrap_or("?"),
                        session["container"].as_str().unwrap_or("?"),
                        session["phase"].as_str().unwrap_or("?"),
                        size
                    );
                }
            }
        }

        Commands::Health => {
            let response = client
                .get(format!("{}/health", cli.api_url))
                .send()
                .context("Failed to get health")?;

            if !response.status().is_success() {
                anyhow::bail!("Health check failed: {}", response.status());
            }

            let result: Value = response.json().context("Failed to parse response")?;
            if json {
                print_json(&result)?;
                return Ok(());
            }

            let health: HealthResponse =
                serde_json::from_value(result).context("Invalid health response")?;

            println!("{}", "secbox Orchestrator Status".bright_cyan().bold());
            println!("{}", "=".repeat(40).bright_blue());
            println!("{} {}", "Status:".cyan(),
                if health.status == "healthy" {
                    health.status.green()
                } else {
                    health.status.yellow()
                }
            );
            println!("{} {}", "Version:".cyan(), health.version);
            println!("{} {}s", "Uptime:".cyan(), health.uptime_seconds);
            println!("{} {}", "Active Sessions:".cyan(), health.active_sessions);
            println!(
                "{} {}",
                "Engine:".cyan(),
                health.engine_version.as_deref().unwrap_or("unreachable")
            );
            println!("{} {}", "Container:".cyan(), health.container_status);
        }
    }

    Ok(())
}
