//! propserve CLI - Distributed Property Estimation for HPC
//!
//! Runs the estimation server, submits data sets, polls and retrieves
//! requests, and hosts the queue-job worker entry point.

use clap::Parser;
use propserve::backend::{run_worker, LocalWorkerPool, QueueWorkerPool, WorkerPoolBackend};
use propserve::client::{EstimationClient, RequestHandle};
use propserve::config::{parse_server_address, CliArgs, Commands, ServeArgs, SubmitArgs, WorkerArgs};
use propserve::error::Result;
use propserve::executor::{CalculationExecutor, CommandExecutor};
use propserve::model::{DatasetProvider, ForceFieldSource, PropertyDataSet, ResultSet};
use propserve::schema::RequestOptions;
use propserve::server::{EstimationServer, ServerConfig};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() {
    let args = CliArgs::parse();

    // Initialize timestamped logging; -v raises the default level
    let filter = match args.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(args) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Commands::Serve(serve) => cmd_serve(&serve),
        Commands::Submit(submit) => cmd_submit(&submit),
        Commands::Status { request_id, server } => cmd_status(&request_id, &server),
        Commands::Retrieve {
            request_id,
            server,
            wait,
            output,
        } => cmd_retrieve(&request_id, &server, wait, output.as_deref()),
        Commands::Cancel { request_id, server } => cmd_cancel(&request_id, &server),
        Commands::Worker(worker) => cmd_worker(&worker),
    }
}

fn cmd_serve(args: &ServeArgs) -> Result<()> {
    let resources = args.resources()?;
    let pool_config = args.pool_config()?;
    let registry = args.registry()?;

    let executor: Arc<dyn CalculationExecutor> =
        Arc::new(CommandExecutor::new(&args.executor_cmd)?);

    let backend: Arc<dyn WorkerPoolBackend> = match args.backend.scheduler() {
        None => Arc::new(LocalWorkerPool::new(pool_config, resources, executor)),
        Some(kind) => {
            // provisioned queue jobs launch this binary's worker subcommand
            let binary = std::env::current_exe()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|_| "propserve".to_string());
            let worker_command = format!(
                "{} worker --connect {{address}} --executor-cmd '{}'",
                binary, args.executor_cmd
            );
            Arc::new(
                QueueWorkerPool::new(kind, pool_config, resources)
                    .with_worker_command(worker_command),
            )
        }
    };
    backend.start()?;

    let server = EstimationServer::new(
        ServerConfig {
            connection: args.connection(),
            working_directory: args.working_dir.clone(),
            retry_limit: args.retry_limit,
            delete_working_files: !args.keep_working_files,
        },
        registry,
        Arc::clone(&backend),
    );

    let outcome = server.run();
    server.stop();
    if let Err(e) = backend.stop() {
        tracing::warn!("error while stopping worker pool: {}", e);
    }
    outcome
}

fn cmd_submit(args: &SubmitArgs) -> Result<()> {
    let connection = parse_server_address(&args.server)?;
    let data_set = PropertyDataSet::load(&args.dataset)?;
    let force_field = ForceFieldSource::load(&args.force_field)?;
    let options: RequestOptions = propserve::model::load_json(&args.options)?;

    let client = EstimationClient::new(connection);
    let handle = client.request_estimate(data_set.enumerate_items(), force_field, options)?;
    println!("{}", handle.id);

    if args.wait {
        let results = handle.results(true)?;
        print_summary(&results);
        if let Some(path) = &args.output {
            results.save(path, true)?;
        }
    }

    Ok(())
}

fn cmd_status(request_id: &str, server: &str) -> Result<()> {
    let connection = parse_server_address(server)?;
    let client = EstimationClient::new(connection.clone());
    let handle = RequestHandle::new(request_id, connection);

    let status = client.status(&handle)?;
    println!(
        "{}: {:?} ({}/{} items finished)",
        status.request_id, status.state, status.completed_items, status.total_items
    );
    Ok(())
}

fn cmd_retrieve(
    request_id: &str,
    server: &str,
    wait: bool,
    output: Option<&std::path::Path>,
) -> Result<()> {
    let connection = parse_server_address(server)?;
    let handle = RequestHandle::new(request_id, connection);

    let results = handle.results(wait)?;
    print_summary(&results);

    match output {
        Some(path) => results.save(path, true)?,
        None => println!("{}", serde_json::to_string_pretty(&results)?),
    }
    Ok(())
}

fn cmd_cancel(request_id: &str, server: &str) -> Result<()> {
    let connection = parse_server_address(server)?;
    let client = EstimationClient::new(connection.clone());
    let handle = RequestHandle::new(request_id, connection);

    client.cancel(&handle)?;
    println!("cancellation requested for {}", request_id);
    Ok(())
}

fn cmd_worker(args: &WorkerArgs) -> Result<()> {
    let executor: Arc<dyn CalculationExecutor> =
        Arc::new(CommandExecutor::new(&args.executor_cmd)?);
    run_worker(&args.connect, executor)
}

fn print_summary(results: &ResultSet) {
    let succeeded = results.successes().count();
    let failed = results.failures().count();
    println!(
        "request {} is {:?}: {} estimated, {} failed, {} total",
        results.request_id,
        results.state,
        succeeded,
        failed,
        results.results.len()
    );
}
