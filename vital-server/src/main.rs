//! Vital Server - clinical data bundle executor
//!
//! Executes one FHIR batch or transaction bundle read from a JSON file against an in-memory
//! resource store, serialized by the configured resource locker, and prints the response.
//!
//! Usage:
//!   vital-server --bundle <FILE> [OPTIONS]
//!
//! Configuration:
//!   Uses a TOML configuration file when one exists at the given path, defaults otherwise.

use clap::Parser;
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vital_server::{LockerSettings, VitalServerBuilder, VitalServerConfig};
use vital_shared::RequestContext;

/// Vital Server - clinical data bundle executor
#[derive(Parser)]
#[command(
    name = "vital-server",
    version = env!("CARGO_PKG_VERSION"),
    about = "Vital Server - transactional FHIR bundle executor"
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "FILE",
        help = "Path to configuration file",
        default_value = "config/vital-server.toml"
    )]
    config: PathBuf,

    /// Bundle to execute
    #[arg(short, long, value_name = "FILE", help = "Path to a JSON bundle")]
    bundle: PathBuf,

    /// Deployment namespace
    #[arg(short, long, value_name = "NAME", help = "Override the deployment namespace")]
    namespace: Option<String>,

    /// Trace id propagated into logs and error outcomes
    #[arg(long, value_name = "ID", help = "Value of the x-trace-id header")]
    trace_id: Option<String>,

    /// Enable development mode
    #[arg(
        short = 'd',
        long,
        help = "Enable development mode (verbose logging, no-op locker)"
    )]
    dev_mode: bool,

    /// Log level
    #[arg(
        short = 'l',
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();

    let mut config = load_config(&args)?;
    apply_cli_overrides(&mut config, &args);

    // Initialize logging
    let log_level = if args.dev_mode {
        "debug,vital_server=trace,vital_shared=trace,vital_server_redis=debug".to_string()
    } else {
        format!(
            "{0},vital_server={0},vital_shared={0}",
            config.log_level
        )
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or(log_level),
        ))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_thread_ids(args.dev_mode)
                .with_file(args.dev_mode)
                .with_line_number(args.dev_mode),
        )
        .init();

    info!("Vital Server {}", env!("CARGO_PKG_VERSION"));
    if args.dev_mode {
        warn!("Development mode enabled");
    }
    info!(
        namespace = %config.namespace,
        locker = config.locker.kind(),
        "Configuration loaded"
    );

    let server = VitalServerBuilder::new().with_config(config).build()?;

    let body: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&args.bundle)?)?;
    let mut headers = HashMap::new();
    if let Some(trace_id) = &args.trace_id {
        headers.insert("x-trace-id".to_string(), trace_id.clone());
    }
    let ctx = RequestContext::from_headers(&headers);

    let (status, response) = server.execute_json(&ctx, body).await;
    info!(status, request_id = ctx.request_id(), "Bundle processed");
    println!("{}", serde_json::to_string_pretty(&response)?);

    if status >= 400 {
        std::process::exit(1);
    }
    Ok(())
}

/// Load configuration from file or use defaults
fn load_config(args: &Args) -> Result<VitalServerConfig, Box<dyn Error>> {
    if args.config.exists() {
        Ok(VitalServerConfig::from_toml_file(&args.config)?)
    } else {
        Ok(VitalServerConfig::default())
    }
}

/// Apply command line argument overrides to configuration
fn apply_cli_overrides(config: &mut VitalServerConfig, args: &Args) {
    if let Some(namespace) = &args.namespace {
        config.namespace = namespace.clone();
    }
    if let Some(log_level) = &args.log_level {
        config.log_level = log_level.clone();
    }
    if args.dev_mode {
        config.locker = LockerSettings::Nop;
    }
}
