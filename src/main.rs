// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// This binary loads configuration, sets up telemetry, and runs the HTTP, gRPC and metrics transports.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use greeter::config::AppConfig;
use greeter::{server, telemetry};

#[derive(Parser)]
#[command(name = "greeter", version)]
#[command(about = "Greeting service over HTTP and gRPC", long_about = None)]
struct Cli {
    /// TOML config file; settings come from the environment when omitted.
    #[arg(short, long = "conf", env = "GREETER_CONF", global = true)]
    conf: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every configured transport until SIGINT/SIGTERM (default)
    Serve,
    /// Print the service name and version
    Version,
    /// Print the resolved configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = AppConfig::load(cli.conf.as_deref())?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            telemetry::init(&cfg.log);
            tracing::info!(service = %cfg.service_name, version = %cfg.version, "starting greeter");
            server::run(cfg).await
        }
        Commands::Version => {
            println!("{} {}", cfg.service_name, cfg.version);
            Ok(())
        }
        Commands::Config => {
            print_config(&cfg)?;
            Ok(())
        }
    }
}

fn print_config(cfg: &AppConfig) -> Result<()> {
    println!("service:  {} {}", cfg.service_name, cfg.version);

    let transports = [
        ("http", cfg.http_server()?),
        ("grpc", cfg.grpc_server()?),
        ("metrics", cfg.metrics_server()?),
    ];
    for (name, server) in transports {
        match server {
            Some(server) => println!(
                "{name:<8}  {} {} (timeout {:?})",
                server.network(),
                server.address(),
                server.timeout()
            ),
            None => println!("{name:<8}  disabled"),
        }
    }

    let (namespace, subsystem) = cfg.metrics_names();
    println!("metrics:  namespace={namespace} subsystem={subsystem}");
    println!("log:      level={} format={:?}", cfg.log.level, cfg.log.format);
    println!("shutdown: grace {:?}", cfg.shutdown_grace());
    Ok(())
}
