use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use mb_cli::cli::{self, Cli, Command, ConfigCommand};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_cli_tracing();

    match cli.command {
        Command::List { json } => {
            let (config, _) = cli::load_config(cli.config.as_deref())?;
            cli::tools::list(&config, cli.server.as_deref(), json)
        }
        Command::Call {
            tool,
            args,
            id,
            timeout,
        } => {
            let (config, _) = cli::load_config(cli.config.as_deref())?;
            let ok = cli::tools::call(
                &config,
                cli.server.as_deref(),
                &tool,
                &args,
                &id,
                timeout,
            )?;
            if !ok {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Validate) => {
            let (config, config_path) = cli::load_config(cli.config.as_deref())?;
            if !cli::config::validate(&config, &config_path) {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Config(ConfigCommand::Show) => {
            let (config, _) = cli::load_config(cli.config.as_deref())?;
            let rendered = cli::config::show(&config).context("serializing config")?;
            print!("{rendered}");
            Ok(())
        }
        Command::Version => {
            println!("mcpbridge {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Compact human-readable logs on stderr, so stdout stays clean for results.
fn init_cli_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();
}
