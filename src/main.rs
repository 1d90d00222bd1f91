//! exthost CLI entry point.

use anyhow::Result;
use asupersync::runtime::RuntimeBuilder;
use clap::Parser;
use exthost::cli::{Cli, Commands};
use exthost::config::Config;
use exthost::host::Host;
use exthost::manifest;
use exthost::permissions;
use serde_json::{Value, json};
use std::io;
use std::path::PathBuf;
use std::sync::mpsc;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = Cli::parse();

    // Logs always go to stderr; a worker's stdout carries protocol frames.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    if matches!(cli.command, Commands::Worker) {
        std::process::exit(exthost::worker::run());
    }

    if let Err(err) = main_impl(cli) {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}

fn main_impl(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    match cli.command {
        Commands::List { extensions_dir } => {
            let dir = extensions_dir.unwrap_or_else(|| config.extensions_dir());
            let descriptors = manifest::discover(&dir)?;
            println!("{}", serde_json::to_string_pretty(&descriptors)?);
            Ok(())
        }
        Commands::CheckPermission { command } => {
            let trusted = config.trusted_namespaces();
            let check =
                permissions::check_command(&command, config.permissions.as_ref(), false, &trusted);
            println!("{}", serde_json::to_string_pretty(&check)?);
            Ok(())
        }
        Commands::Run {
            extensions_dir,
            activate,
            exec,
            args,
            event,
            payload,
        } => {
            let exec = match exec {
                Some(command) => Some((command, parse_json_args(&args)?)),
                None => None,
            };
            let event = match event {
                Some(name) => Some((name, parse_json(payload.as_deref())?)),
                None => None,
            };
            let request = RunRequest {
                extensions_dir,
                activate,
                exec,
                event,
            };
            let runtime = RuntimeBuilder::multi_thread()
                .blocking_threads(1, 8)
                .build()
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let handle = runtime.handle();
            let join = handle.spawn(Box::pin(run(config, request)));
            runtime.block_on(join)
        }
        // Dispatched before configuration loading.
        Commands::Worker => Ok(()),
    }
}

struct RunRequest {
    extensions_dir: Option<PathBuf>,
    activate: Vec<String>,
    exec: Option<(String, Vec<Value>)>,
    event: Option<(String, Value)>,
}

async fn run(config: Config, request: RunRequest) -> Result<()> {
    let host = Host::new(
        config.host_options(request.extensions_dir),
        config.permissions.clone(),
    );
    let handles = host.start()?;
    tracing::info!(workers = handles.len(), "Host started");

    // Eager extensions activate on their own; wait for them alongside the
    // explicitly requested ones.
    let mut to_activate: Vec<String> = host
        .extensions()
        .into_iter()
        .filter(|d| d.activates_eagerly())
        .map(|d| d.id)
        .collect();
    for id in request.activate {
        if !to_activate.contains(&id) {
            to_activate.push(id);
        }
    }
    for id in &to_activate {
        match host.activate(id).await {
            Ok(result) => println!("{}", json!({ "activate": id, "result": result })),
            Err(err) => eprintln!("Failed to activate {id}: {err}"),
        }
    }

    let wait_for_interrupt = request.exec.is_none() && request.event.is_none();
    if let Some((name, payload)) = request.event {
        let delivered = host.broadcast_event(&name, payload);
        println!("{}", json!({ "event": name, "delivered": delivered }));
    }
    if let Some((command, args)) = request.exec {
        let outcome = host.execute_command(&command, args).await;
        println!("{}", json!({ "command": command, "outcome": outcome }));
    }
    if wait_for_interrupt {
        wait_for_ctrl_c();
    }

    let reports = host.shutdown().await;
    for report in &reports {
        tracing::debug!(extension_id = %report.extension_id, code = ?report.code, "Worker stopped");
    }
    Ok(())
}

/// Block until Ctrl-C.
fn wait_for_ctrl_c() {
    let (tx, rx) = mpsc::channel();
    if let Err(err) = ctrlc::set_handler(move || {
        let _ = tx.send(());
    }) {
        eprintln!("Warning: Failed to install Ctrl+C handler: {err}");
        return;
    }
    eprintln!("Host running; press Ctrl+C to stop.");
    let _ = rx.recv();
}

fn parse_json(raw: Option<&str>) -> Result<Value> {
    raw.map_or(Ok(Value::Null), |raw| {
        serde_json::from_str(raw).map_err(|err| anyhow::anyhow!("Invalid JSON '{raw}': {err}"))
    })
}

fn parse_json_args(raw: &[String]) -> Result<Vec<Value>> {
    raw.iter().map(|arg| parse_json(Some(arg))).collect()
}
