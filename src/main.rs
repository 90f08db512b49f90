use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kindtest::cli::{
    check_report, format_record_list, format_sweep_report, resolve_settings, run_cleanup,
    run_list, run_sweep, Cli, Commands,
};
use kindtest::kind::{KindProvisioner, Provisioner};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = resolve_settings(cli.config.as_deref(), cli.state_file)
        .context("Failed to load settings")?;
    let provisioner: Arc<dyn Provisioner> = Arc::new(KindProvisioner::from_settings(&settings));
    info!("Using state file {}", settings.state_file_path().display());

    match cli.command {
        Commands::Cleanup => {
            let report = run_cleanup(&settings, provisioner).await;
            print!("{}", format_sweep_report(&report));
            check_report(&report).context("Emergency cleanup incomplete")?;
        }
        Commands::Sweep => {
            let report = run_sweep(&settings, provisioner).await;
            print!("{}", format_sweep_report(&report));
            check_report(&report).context("Orphan sweep incomplete")?;
        }
        Commands::List(args) => {
            let records = run_list(&settings, provisioner, !args.no_probe).await;
            print!("{}", format_record_list(&records, chrono::Utc::now()));
        }
    }

    Ok(())
}
