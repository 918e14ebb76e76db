//! mail-tools-mcp: Email MCP server over stdio
//!
//! Exposes five tools to an MCP client: list folders, search emails, read
//! one email, count emails per day, and send email. Reading goes through
//! IMAP over implicit TLS; sending goes through authenticated SMTP, with a
//! best-effort copy appended to the account's Sent folder.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and stdio serving
//! - [`config`]: Environment-driven account and timeout settings
//! - [`errors`]: Error taxonomy with user-facing guidance
//! - [`decode`]: Never-failing header and body text decoding
//! - [`imap`]: TLS IMAP transport with per-command timeouts
//! - [`session`]: Session seams, command tracing and the per-call mailbox
//! - [`sent_folder`]: Provider profiles and Sent folder discovery
//! - [`mime`]: Message parsing into summaries and full content
//! - [`smtp`]: Message composition and SMTP submission
//! - [`operations`]: Search criteria and read-side mail operations
//! - [`models`]: Tool input DTOs and result types
//! - [`tools`]: Per-tool orchestration and reply texts
//! - [`server`]: MCP tool registration

mod config;
mod decode;
mod errors;
mod imap;
mod mime;
mod models;
mod operations;
mod sent_folder;
mod server;
mod session;
mod smtp;
#[cfg(test)]
mod testing;
mod tools;

use std::path::PathBuf;

use clap::Parser;
use config::MailConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Email MCP server over stdio
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Load environment variables from this file instead of `./.env`
    #[arg(long, value_name = "PATH")]
    env_file: Option<PathBuf>,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config, and serves the MCP
/// server over stdio. This process expects to be spawned by an MCP client
/// via `stdio` transport.
///
/// # Environment Variables
///
/// See [`MailConfig::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)?;
        }
        None => {
            dotenvy::dotenv().ok();
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = MailConfig::load_from_env()?;
    info!(
        imap = %config.imap_host,
        smtp = %config.smtp_host,
        smtp_port = config.smtp_port,
        "starting mail tools server"
    );
    let service = server::MailToolsServer::new(config)?
        .serve(stdio())
        .await?;
    service.waiting().await?;
    Ok(())
}
