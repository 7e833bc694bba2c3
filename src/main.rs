mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, CrdAction, Commands};

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if atty_is_tty() {
        subscriber.init();
    } else {
        subscriber.json().init();
    }
}

/// Whether stdout looks like an interactive terminal. Kept minimal (no
/// `atty`/`is-terminal` dependency) since the only decision it drives is
/// human-readable vs. JSON log formatting.
fn atty_is_tty() -> bool {
    std::env::var_os("TERM").is_some() && std::env::var_os("SANDBOX_OPERATOR_LOG_JSON").is_none()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Version => commands::version::run()?,
        Commands::Check => commands::check::run().await?,
        Commands::List { resource } => {
            commands::list::run(resource).await?;
        }
        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
        },
        Commands::Run => commands::run::run().await?,
    }

    Ok(())
}
