mod aggregator;
mod collectors;
mod config;
mod frame;
mod runner;
mod sample;
mod transport;

use aggregator::Aggregator;
use clap::Parser;
use collectors::gpu::NvidiaSmi;
use collectors::system::{SysinfoCpuTemp, SysinfoHost};
use collectors::GpuSource;
use config::Config;
use runner::{ExitReason, LoopTiming, SamplingLoop};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use transport::SerialLink;

#[derive(Parser, Debug)]
#[command(name = "serial-telemetry")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long, env = "TELEMETRY_PORT")]
    port: Option<String>,
    #[arg(long, env = "TELEMETRY_BAUD")]
    baud: Option<u32>,
    #[arg(long)]
    print_default_config: bool,
    #[arg(long, conflicts_with = "print_default_config")]
    list_ports: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }
    if cli.list_ports {
        print_ports();
        return;
    }

    let mut cfg = match Config::load_or_default(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };
    if let Some(port) = cli.port {
        cfg.serial.port = port;
    }
    if let Some(baud) = cli.baud {
        cfg.serial.baud_rate = baud;
    }
    if let Err(err) = cfg.validate() {
        error!(error = %err, "invalid configuration");
        std::process::exit(1);
    }

    info!(
        port = %cfg.serial.port,
        baud_rate = cfg.serial.baud_rate,
        interval_secs = cfg.interval_secs,
        layout = cfg.frame.layout.as_str(),
        "starting serial-telemetry"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received Ctrl+C, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => error!(error = %err, "failed to listen for Ctrl+C"),
        }
        // A dropped sender reads as shutdown on the loop side.
        std::future::pending::<()>().await;
    });
    // Let the watcher install its handler before the link is opened.
    tokio::task::yield_now().await;

    let link = match SerialLink::open(&cfg.serial) {
        Ok(link) => link,
        Err(err) => {
            error!(error = %err, "failed to open serial link");
            std::process::exit(1);
        }
    };

    let gpu: Option<Box<dyn GpuSource>> = if cfg.gpu.enabled {
        Some(Box::new(NvidiaSmi::new(
            cfg.gpu.nvidia_smi.clone(),
            cfg.gpu.index,
            cfg.gpu.timeout(),
        )))
    } else {
        None
    };
    let aggregator = Aggregator::new(
        Box::new(SysinfoHost::new()),
        Box::new(SysinfoCpuTemp::new()),
        gpu,
        cfg.fallback,
    );
    let timing = LoopTiming {
        settle_delay: cfg.serial.settle_delay(),
        interval: cfg.interval(),
    };

    let report = SamplingLoop::new(aggregator, link, cfg.frame.layout, timing)
        .run(shutdown_rx)
        .await;

    if report.exit == ExitReason::LinkLost {
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn print_ports() {
    match transport::list_ports() {
        Ok(ports) if ports.is_empty() => println!("no serial ports found"),
        Ok(ports) => {
            for p in ports {
                println!("{}\t{}", p.name, p.kind);
            }
        }
        Err(err) => {
            error!(error = %err, "failed to enumerate serial ports");
            std::process::exit(1);
        }
    }
}
