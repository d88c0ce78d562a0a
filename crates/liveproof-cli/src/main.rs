use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

mod setup;

const DEFAULT_URL: &str = "http://127.0.0.1:8080";

#[derive(Parser)]
#[command(name = "liveproof")]
#[command(about = "Operator tools for the liveproofd verification daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download and verify the face detector model
    Setup {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Check model checksums without downloading
    VerifyModels {
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Query daemon health and detector availability
    Health {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
    /// Create a verification session and print its credentials
    Session {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Setup { model_dir } => setup::run(model_dir),
        Command::VerifyModels { model_dir } => setup::verify(model_dir),
        Command::Health { url } => health(&url),
        Command::Session { url } => session(&url),
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

fn parse_body(mut resp: ureq::http::Response<ureq::Body>, url: &str) -> Result<Value> {
    let text = resp
        .body_mut()
        .read_to_string()
        .with_context(|| format!("failed to read response from {url}"))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON from {url}"))
}

fn health(base: &str) -> Result<()> {
    let url = endpoint(base, "/health");
    let resp = ureq::get(&url)
        .call()
        .with_context(|| format!("failed to reach {url}"))?;
    let body = parse_body(resp, &url)?;

    let status = body["status"].as_str().unwrap_or("unknown");
    println!("status:   {status}");
    println!("version:  {}", body["version"].as_str().unwrap_or("?"));
    println!("sessions: {}", body["sessions"]);
    let detector = &body["detector"];
    if detector["available"].as_bool().unwrap_or(false) {
        println!(
            "detector: {} ({} workers)",
            detector["model"].as_str().unwrap_or("?"),
            detector["workers"]
        );
    } else {
        println!("detector: unavailable (client-reported faces only)");
    }
    Ok(())
}

fn session(base: &str) -> Result<()> {
    let url = endpoint(base, "/session");
    let resp = ureq::post(&url)
        .send_empty()
        .with_context(|| format!("failed to create session at {url}"))?;
    let body = parse_body(resp, &url)?;

    println!("session:    {}", body["sessionId"].as_str().unwrap_or("?"));
    println!("token:      {}", body["token"].as_str().unwrap_or("?"));
    println!("expires:    {}", body["expiresAt"].as_str().unwrap_or("?"));
    if let Some(challenges) = body["challenges"].as_array() {
        let names: Vec<&str> = challenges.iter().filter_map(Value::as_str).collect();
        println!("challenges: {}", names.join(", "));
    }
    println!("connect:    {}", endpoint(&base.replacen("http", "ws", 1), "/ws"));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_without_double_slash() {
        assert_eq!(endpoint("http://h:1/", "/health"), "http://h:1/health");
        assert_eq!(endpoint("http://h:1", "/health"), "http://h:1/health");
    }

    #[test]
    fn test_cli_parses_session_url() {
        let cli = Cli::parse_from(["liveproof", "session", "--url", "http://x:9"]);
        match cli.command {
            Command::Session { url } => assert_eq!(url, "http://x:9"),
            _ => panic!("expected session command"),
        }
    }
}
