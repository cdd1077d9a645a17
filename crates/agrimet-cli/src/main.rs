use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "agrimet")]
#[command(about = "CWA agricultural weather forecast ingestor + dashboard")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch the CWA feed and upsert it into the forecast database.
    Ingest,
    /// Serve the dashboard over the same database file.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let summary = agrimet_ingest::run_ingest_from_env().await?;
            println!(
                "ingest complete: run_id={} origin={} parsed={} stored={} db={}",
                summary.run_id,
                summary.origin,
                summary.parsed_records,
                summary.stored_rows,
                summary.database_path
            );
        }
        Commands::Serve => {
            agrimet_web::serve_from_env().await?;
        }
    }

    Ok(())
}
