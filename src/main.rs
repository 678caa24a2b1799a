use clap::Parser;

use cmdlet::cli::args::{Cli, Commands};
use cmdlet::cli::commands;
use cmdlet::config::loader::load_config;
use cmdlet::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    // Load configuration (file + CLI overrides)
    let config = load_config(cli.global_opts.config.as_deref())?;

    // Dispatch to subcommand handler
    match cli.command {
        Commands::Run(args) => {
            let code = commands::run(args, config).await?;
            std::process::exit(code);
        }
        Commands::Check(args) => {
            commands::check(args).await?;
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
