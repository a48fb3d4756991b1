use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::signal;
use toolbridge::{
    config::ServiceConfig,
    observability::{logging::init_logging, metrics::start_prometheus},
};
use toolbridge_core::{ExecutionContextId, ServerId, ToolBridge};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "toolbridge", version, about = "Capability server bridge")]
struct Cli {
    /// YAML configuration file
    #[arg(long, short, global = true, env = "TOOLBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "TOOLBRIDGE_LOG_LEVEL")]
    log_level: Option<String>,

    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,

    #[arg(long, global = true, env = "TOOLBRIDGE_LOG_DIR")]
    log_dir: Option<String>,

    #[arg(long, global = true)]
    prometheus_port: Option<u16>,

    #[arg(long, global = true)]
    prometheus_host: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Register every configured server and run health probes until signalled
    #[command(visible_alias = "start")]
    Serve {
        /// Skip the Prometheus exporter
        #[arg(long, default_value_t = false)]
        no_metrics: bool,
    },
    /// Discover and print capabilities
    Discover {
        /// Limit discovery to one server
        #[arg(long)]
        server: Option<String>,
    },
    /// Invoke a capability once and print the result
    Invoke {
        /// Capability name, optionally qualified as `server:name`
        #[arg(long)]
        capability: String,

        /// JSON arguments
        #[arg(long, default_value = "{}")]
        args: String,

        /// Execution context id (generated when omitted)
        #[arg(long)]
        context: Option<String>,

        /// Per-call timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Probe one server and print its health
    Check {
        #[arg(long)]
        server: String,
    },
}

impl Cli {
    fn load_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServiceConfig::default(),
        };

        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.log_json {
            config.logging.json = true;
        }
        if let Some(dir) = &self.log_dir {
            config.logging.dir = Some(dir.clone());
        }
        if let Some(port) = self.prometheus_port {
            config.metrics.port = port;
        }
        if let Some(host) = &self.prometheus_host {
            config.metrics.host = host.clone();
        }

        config.validate()?;
        Ok(config)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn build_service(config: &ServiceConfig, only: Option<&str>) -> Result<ToolBridge> {
    let bridge_config = config.bridge.clone().with_env_proxy();
    let service = ToolBridge::new(bridge_config, Arc::new(config.budget()))?;

    let mut registered = 0usize;
    for definition in &config.servers {
        if only.is_some_and(|id| id != definition.id.as_str()) {
            continue;
        }
        service.register_server(definition.clone()).await?;
        registered += 1;
    }

    if let Some(id) = only {
        if registered == 0 {
            bail!("server '{}' is not configured", id);
        }
    }
    Ok(service)
}

async fn serve(service: ToolBridge, config: &ServiceConfig, no_metrics: bool) -> Result<()> {
    if !no_metrics {
        let addr = start_prometheus(config.metrics.to_prometheus_config())
            .context("installing Prometheus exporter")?;
        info!(%addr, "Prometheus exporter listening");
    }

    service.start_health_monitor().await;
    info!(
        servers = service.list_servers().len(),
        "Tool bridge running"
    );

    shutdown_signal().await;
    service.shutdown().await;
    info!("Tool bridge stopped");
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = cli.load_config()?;
    let _log_guard = init_logging(config.logging.to_logging_config()?);

    match cli.command {
        Commands::Serve { no_metrics } => {
            let service = build_service(&config, None).await?;
            serve(service, &config, no_metrics).await
        }
        Commands::Discover { server } => {
            let service = build_service(&config, server.as_deref()).await?;
            let mut sets = Vec::new();
            for server in service.list_servers() {
                sets.push(service.list_capabilities(&server.id)?);
            }
            service.shutdown().await;
            let sets: Vec<_> = sets.iter().map(|set| set.as_ref()).collect();
            print_json(&sets)
        }
        Commands::Invoke {
            capability,
            args,
            context,
            timeout,
        } => {
            let arguments: serde_json::Value =
                serde_json::from_str(&args).context("--args must be valid JSON")?;
            let service = build_service(&config, None).await?;
            let context_id = context
                .map(ExecutionContextId::new)
                .unwrap_or_else(ExecutionContextId::generate);

            let result = service
                .invoke(
                    &context_id,
                    &capability,
                    arguments,
                    timeout.map(Duration::from_secs),
                )
                .await;
            service.run_ended(&context_id).await;
            service.shutdown().await;

            match result {
                Ok(output) => print_json(&output),
                Err(failure) => {
                    print_json(&failure)?;
                    bail!("invocation failed: {}", failure)
                }
            }
        }
        Commands::Check { server } => {
            let service = build_service(&config, Some(&server)).await?;
            let snapshot = service.check_health(&ServerId::new(server)).await?;
            service.shutdown().await;
            print_json(&snapshot)
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}
