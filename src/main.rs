mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands};
use relay_tunnel::config::AppConfig;
use relay_tunnel::registry::Registry;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Check { config } => {
            let config = AppConfig::load(config)?;
            init_logging(&cli, &config);
            println!(
                "configuration OK: {} service(s), {} ingress rule(s)",
                config.services.len(),
                config.ingress.len()
            );
            Ok(())
        }
        Commands::Serve { config } => {
            let config = AppConfig::load(config)?;
            init_logging(&cli, &config);
            info!("relay-tunnel v{}", env!("CARGO_PKG_VERSION"));

            let registry = Registry::with_defaults();
            let services = config
                .build_services(&registry)
                .await
                .context("Failed to build services")?;

            let mut tasks = Vec::new();
            for service in &services {
                let service = service.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = service.serve().await {
                        tracing::error!("{}: {}", service.name(), e);
                    }
                }));
            }

            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for shutdown signal")?;
            info!("received shutdown signal, stopping services");

            for service in &services {
                service.close().await.ok();
            }
            for task in tasks {
                task.abort();
            }
            info!("stopped");
            Ok(())
        }
    }
}

/// 命令行 -v 优先于配置文件的日志级别
fn init_logging(cli: &Cli, config: &AppConfig) {
    let level = match cli.verbose {
        0 => config.log_level.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(level.as_str())
        .with_target(false)
        .init();
}
