//! `agent-sim` runs the operation service against an in-memory platform.
//!
//! Seeds the platform with restart operations and operations of a kind no
//! handler supports, runs until Ctrl-C or `--run-for-secs`, then prints the
//! final state of every operation as JSON.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use devagent::service::config::{keys, MapConfigSource};
use devagent::service::{OperationHandler, RestartHandler};
use devagent::telemetry::init_tracing;
use devagent::{Collaborators, InMemoryPlatform, OperationService, ServiceRegistry};
use devagent_core::{fragments, Operation};
use serde::Serialize;
use serde_json::json;
use tracing::info;

/// Operation service simulator
#[derive(Parser, Debug)]
#[command(name = "agent-sim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Seconds between polls when no operation is pending
    #[arg(long, env = "DEVAGENT_INTERVAL", default_value_t = 1)]
    interval: u64,

    /// Page size for reconciliation queries
    #[arg(long, env = "DEVAGENT_RESULT_SIZE", default_value_t = 100)]
    result_size: u64,

    /// Milliseconds to wait for the worker to stop
    #[arg(long, env = "DEVAGENT_SHUTDOWN_TIMEOUT", default_value_t = 10_000)]
    shutdown_timeout: u64,

    /// Milliseconds to wait for handlers to stop
    #[arg(long, env = "DEVAGENT_HANDLERS_SHUTDOWN_TIMEOUT", default_value_t = 10_000)]
    handlers_shutdown_timeout: u64,

    /// Number of restart operations to issue
    #[arg(long, default_value_t = 2)]
    restarts: usize,

    /// Number of operations of an unsupported kind to issue
    #[arg(long, default_value_t = 1)]
    unsupported: usize,

    /// Command run for each restart operation
    #[arg(long, env = "DEVAGENT_RESTART_COMMAND", default_value = "true")]
    restart_command: String,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    run_for_secs: Option<u64>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

/// Final platform state printed on exit.
#[derive(Serialize)]
struct Report {
    supported_operations: Option<Vec<String>>,
    operations: Vec<Operation>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs)?;

    let config = MapConfigSource::new()
        .with(keys::INTERVAL, args.interval)
        .with(keys::RESULT_SIZE, args.result_size)
        .with(keys::SHUTDOWN_TIMEOUT, args.shutdown_timeout)
        .with(keys::HANDLERS_SHUTDOWN_TIMEOUT, args.handlers_shutdown_timeout);

    let platform = Arc::new(InMemoryPlatform::new());
    for _ in 0..args.restarts {
        platform.issue(fragments::RESTART, json!({}));
    }
    for _ in 0..args.unsupported {
        platform.issue("acme_Blink", json!({ "times": 3 }));
    }

    let restart = RestartHandler::from_command_line(&args.restart_command)
        .ok_or_else(|| anyhow::anyhow!("restart command must not be empty"))?;
    let handlers: Vec<Arc<dyn OperationHandler>> = vec![Arc::new(restart)];

    let collaborators = Collaborators {
        operations: platform.clone(),
        inventory: Some(platform.clone()),
        system: platform.clone(),
    };
    let service = OperationService::from_source(collaborators, handlers, &config)?;

    let registry = ServiceRegistry::new();
    registry.register(service);
    registry.start_all().await?;
    info!(operations = args.restarts + args.unsupported, "agent-sim running");

    match args.run_for_secs {
        Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
        None => tokio::signal::ctrl_c().await?,
    }

    registry.stop_all().await?;
    let report = Report {
        supported_operations: platform.supported_operations(),
        operations: platform.operations(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
