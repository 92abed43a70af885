use std::net::SocketAddr;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use capture_sync::client::{CaptureClient, ClientConfig, ClientExit};
use capture_sync::discovery;
use capture_sync::{Config, Daemon};

/// Capture Sync - multi-device capture coordination
#[derive(Parser)]
#[command(name = "capture-sync", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the controller (default)
    Serve {
        /// Control channel port
        #[arg(long, env = "CAPTURE_SYNC_CONTROL_PORT")]
        control_port: Option<u16>,
        /// Telemetry channel port
        #[arg(long, env = "CAPTURE_SYNC_TELEMETRY_PORT")]
        telemetry_port: Option<u16>,
        /// HTTP API port
        #[arg(long, env = "CAPTURE_SYNC_API_PORT")]
        api_port: Option<u16>,
        /// Do not advertise over mDNS
        #[arg(long)]
        no_advertise: bool,
    },
    /// Run simulated capture nodes against a controller
    Simulate {
        /// Controller control channel address
        #[arg(long, default_value = "127.0.0.1:8080")]
        controller: SocketAddr,
        /// Controller telemetry address; defaults to the control host on 8081
        #[arg(long)]
        telemetry: Option<SocketAddr>,
        /// Look the controller up over mDNS instead
        #[arg(long)]
        discover: bool,
        /// Number of nodes
        #[arg(short, long, default_value = "1")]
        nodes: u16,
        /// Node id prefix
        #[arg(long, default_value = "sim")]
        prefix: String,
        /// Clock skew per node in milliseconds (node i is skewed by i * skew)
        #[arg(long, default_value = "0")]
        skew_ms: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "info,capture_sync=info",
        1 => "info,capture_sync=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let command = cli.command.unwrap_or(Command::Serve {
        control_port: None,
        telemetry_port: None,
        api_port: None,
        no_advertise: false,
    });

    match command {
        Command::Serve {
            control_port,
            telemetry_port,
            api_port,
            no_advertise,
        } => {
            let mut config = Config::load()?;
            if let Some(port) = control_port {
                config.control_port = port;
            }
            if let Some(port) = telemetry_port {
                config.telemetry_port = port;
            }
            if let Some(port) = api_port {
                config.api_port = port;
            }
            if no_advertise {
                config.advertise = false;
            }
            config.validate()?;
            tracing::debug!(?config, "loaded configuration");
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting capture-sync controller");

            Daemon::new(config).await.run().await?;
            Ok(())
        }
        Command::Simulate {
            controller,
            telemetry,
            discover,
            nodes,
            prefix,
            skew_ms,
        } => {
            let (controller, telemetry) = if discover {
                let Some(endpoint) = discovery::browse(Duration::from_secs(5)).await? else {
                    anyhow::bail!("no controller found over mDNS");
                };
                tracing::info!(control = %endpoint.control, telemetry = %endpoint.telemetry, "controller discovered");
                (endpoint.control, endpoint.telemetry)
            } else {
                let telemetry = telemetry.unwrap_or_else(|| SocketAddr::new(controller.ip(), 8081));
                (controller, telemetry)
            };
            simulate(controller, telemetry, nodes, &prefix, skew_ms).await
        }
    }
}

async fn simulate(
    controller: SocketAddr,
    telemetry: SocketAddr,
    nodes: u16,
    prefix: &str,
    skew_ms: i64,
) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let mut tasks = Vec::with_capacity(usize::from(nodes));
    for i in 0..nodes {
        #[allow(clippy::cast_precision_loss)]
        let skew = (i64::from(i) * skew_ms) as f64 / 1000.0;
        let config = ClientConfig::new(format!("{prefix}-{}", i + 1))
            .with_capabilities(["GSR", "Thermal"])
            .with_clock_skew(skew)
            .with_telemetry(telemetry);
        let client = CaptureClient::new(config);
        let shutdown = shutdown_rx.clone();

        tasks.push(tokio::spawn(async move {
            let node_id = client.node_id().to_string();
            match client.connect(controller, shutdown).await {
                Ok(ClientExit::Shutdown) => tracing::info!(node_id = %node_id, "node stopped"),
                Ok(ClientExit::Disconnected) => tracing::warn!(node_id = %node_id, "controller disconnected"),
                Err(e) => tracing::error!(node_id = %node_id, error = %e, "node failed"),
            }
        }));
    }

    tracing::info!(nodes, %controller, %telemetry, "simulated nodes running");
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
