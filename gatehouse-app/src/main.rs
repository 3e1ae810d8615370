use anyhow::{Context, Result};
use gatehouse_app::commands;
use gatehouse_app::config::{Config, DEFAULT_CONFIG_PATH};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "Usage: gatehouse [--config PATH] <command>

Commands:
  audit verify          Verify the audit hash chain
  audit tail [N]        Print the last N audit entries
  audit incidents [N]   Print the last N security incidents
  catalog               Validate and print the permission catalog
  health                Check configuration and storage";

#[tokio::main]
async fn main() -> Result<()> {
    let mut args: Vec<String> = std::env::args().skip(1).collect();

    let mut config_path = PathBuf::from(DEFAULT_CONFIG_PATH);
    if args.first().map(|s| s.as_str()) == Some("--config") {
        let path = args.get(1).context("--config needs a path")?;
        config_path = PathBuf::from(path);
        args.drain(..2);
    }

    if args.is_empty() || args[0] == "help" || args[0] == "--help" {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = Config::load(&config_path)?;
    init_tracing(&config);

    match args[0].as_str() {
        "audit" => commands::audit::run(&config, &args[1..]),
        "catalog" => commands::catalog::run(&config).await,
        "health" => commands::health::run(&config).await,
        other => {
            eprintln!("{}", USAGE);
            anyhow::bail!("Unknown command '{}'", other)
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
