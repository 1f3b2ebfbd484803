use clap::{Parser, Subcommand};
use color_eyre::eyre::Result;
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, registry, EnvFilter};

use mayfly_server::{run_api, run_controller, Config};

#[derive(Parser, Debug)]
#[command(author, version, about = "DHCP-backed IP address pools", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output - shows more detailed logs
    #[arg(short, long, default_value_t = false)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Serve the HTTP API
    Api(RunArgs),
    /// Run the reconciliation controller for one uplink
    Controller(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Path to a TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "mayfly={default_level},tower=warn,hyper=warn,h2=warn"
        ))
    });
    registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let (name, args) = match &cli.command {
        Commands::Api(args) => ("api", args),
        Commands::Controller(args) => ("controller", args),
    };

    let config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "configuration error");
            eprintln!("Configuration error: {e}");
            std::process::exit(1);
        }
    };
    config.log();

    let outcome = match cli.command {
        Commands::Api(_) => run_api(config).await,
        Commands::Controller(_) => run_controller(config).await,
    };
    if let Err(e) = outcome {
        error!("{name} failed: {e:#}");
        eprintln!("Error running mayfly {name}: {e}");
        std::process::exit(1);
    }
    Ok(())
}
