//! Gatehouse CLI: tenant administration and the gateway launcher.
//!
//! `gatehouse tenants …` manipulates the registry directly (the registry
//! file lock keeps this safe alongside a running gateway); `gatehouse
//! serve` runs the gateway itself.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use gatehouse_core::config::GatewayConfig;
use gatehouse_core::{EchoRunner, StateLayout};
use gatehouse_tenancy::{TenantRegistry, UsageLedger};

mod output;
mod tenants;

/// Gatehouse — multi-tenant agent gateway.
#[derive(Parser)]
#[command(name = "gatehouse")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the gateway config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit a single JSON value instead of human-readable output.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage tenants.
    Tenants {
        #[command(subcommand)]
        command: TenantCommands,
    },

    /// Run the gateway in the foreground.
    Serve,
}

#[derive(Subcommand)]
enum TenantCommands {
    /// Create a tenant and print its token (shown exactly once).
    Create {
        /// Tenant id (lowercase alphanumerics, `_` and `-`, max 32 chars).
        tenant_id: String,

        /// Human-readable display name.
        #[arg(long)]
        display_name: Option<String>,
    },

    /// List tenant ids.
    List,

    /// Show one tenant's record and current usage.
    Info {
        /// Tenant id.
        tenant_id: String,
    },

    /// Remove a tenant.
    Remove {
        /// Tenant id.
        tenant_id: String,

        /// Also delete the tenant's state subtree.
        #[arg(long)]
        delete_data: bool,

        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },

    /// Rotate and print a fresh token (the old one stops working).
    Token {
        /// Tenant id.
        tenant_id: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::load(cli.config.as_deref()).context("failed to load config")?;

    match cli.command {
        Commands::Tenants { command } => run_tenants(&config, command, cli.json),
        Commands::Serve => run_serve(config),
    }
}

fn run_tenants(config: &GatewayConfig, command: TenantCommands, json: bool) -> Result<()> {
    let layout: StateLayout = config.layout();
    let registry = TenantRegistry::new(layout.clone());
    let ledger = UsageLedger::new(layout);

    match command {
        TenantCommands::Create {
            tenant_id,
            display_name,
        } => tenants::create(&registry, &tenant_id, display_name, json),
        TenantCommands::List => tenants::list(&registry, json),
        TenantCommands::Info { tenant_id } => tenants::info(&registry, &ledger, &tenant_id, json),
        TenantCommands::Remove {
            tenant_id,
            delete_data,
            force,
        } => tenants::remove(&registry, &tenant_id, delete_data, force, json),
        TenantCommands::Token { tenant_id } => tenants::token(&registry, &tenant_id, json),
    }
}

fn run_serve(config: GatewayConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;
    runtime.block_on(async move {
        let gateway = gatehouse_gateway::Gateway::new(
            config,
            Arc::new(EchoRunner),
            Arc::new(gatehouse_term::LocalPtySpawner),
        )
        .context("failed to assemble gateway")?;
        gatehouse_gateway::serve(gateway)
            .await
            .context("gateway exited with an error")
    })
}

/// Interactive yes/no prompt on stderr.
pub(crate) fn confirm(prompt: &str) -> Result<bool> {
    use std::io::Write;
    eprint!("{prompt} [y/N] ");
    std::io::stderr().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("failed to read confirmation")?;
    Ok(matches!(line.trim(), "y" | "Y" | "yes"))
}

/// Validate early so the error carries the format remedy before any
/// registry I/O happens.
pub(crate) fn require_valid_tenant_id(tenant_id: &str) -> Result<()> {
    if !gatehouse_core::is_valid_tenant_id(tenant_id) {
        bail!(
            "invalid tenant id {tenant_id:?} — use lowercase letters, digits, '_' or '-', \
             starting with a letter or digit, at most 32 characters"
        );
    }
    Ok(())
}
