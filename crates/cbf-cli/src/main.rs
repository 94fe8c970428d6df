use anyhow::{bail, Result};
use cbf_catalog::{render_summary, run_pipeline_from_env};
use cbf_core::format_price_eur;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "cbf-cli")]
#[command(about = "Costa Blanca new-build feed pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run every enabled feed once and print the run brief.
    Sync,
    /// Serve the catalog JSON API.
    Serve,
    /// Print one development and its units.
    Show { slug: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let run = run_pipeline_from_env().await?;
            info!(run_id = %run.run_id, failed_feeds = run.failed_feeds(), "sync finished");
            print!("{}", render_summary(&run));
        }
        Commands::Serve => {
            cbf_web::serve_from_env().await?;
        }
        Commands::Show { slug } => {
            let run = run_pipeline_from_env().await?;
            let Some(dev) = run.catalog.development(&slug) else {
                bail!("no development with slug {slug:?}");
            };
            println!("{}", serde_json::to_string_pretty(dev)?);
            for unit in run.catalog.development_units(&slug).unwrap_or_default() {
                let price = if unit.price > 0.0 {
                    format_price_eur(unit.price)
                } else {
                    "price on request".to_string()
                };
                println!(
                    "- {} {} ({} bed) {}",
                    unit.reference,
                    unit.property_type.label(),
                    unit.bedrooms,
                    price
                );
            }
        }
    }

    Ok(())
}
