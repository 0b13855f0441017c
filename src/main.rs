use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use disaster_panel::config::Config;
use disaster_panel::sources::create_source;
use disaster_panel::{constants, logging, panel};

#[derive(Parser)]
#[command(name = "disaster_panel")]
#[command(about = "County-year housing and natural-disasters analysis panel builder")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch and clean the raw sources
    Sources {
        /// Specific sources to run (comma-separated). Available:
        /// storm_events, shiller, fred. Defaults to all three.
        #[arg(long)]
        only: Option<String>,
    },
    /// Merge the processed tables into the final analysis panel
    Merge,
    /// Run all sources and then the merge, sequentially
    Run {
        /// Specific sources to run before merging (comma-separated)
        #[arg(long)]
        only: Option<String>,
    },
}

fn resolve_source_names(only: Option<String>) -> Vec<String> {
    match only {
        Some(list) => list.split(',').map(|s| s.trim().to_string()).collect(),
        None => constants::supported_sources()
            .into_iter()
            .map(str::to_string)
            .collect(),
    }
}

async fn run_sources(source_names: &[String], config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    for source_name in source_names {
        let span = tracing::info_span!("Running source", source = %source_name);
        let _enter = span.enter();

        let Some(source) = create_source(source_name) else {
            warn!("Unknown source specified");
            println!("Unknown source: {source_name} (available: {})",
                constants::supported_sources().join(", "));
            continue;
        };

        info!("Starting source run");
        println!("\n=== {} ===", source_name);
        match source.acquire(config).await {
            Ok(summary) => {
                info!("Source run finished");
                println!("\nSummary for {}:", summary.source_name);
                println!("   Raw rows:            {}", summary.raw_rows);
                println!("   Clean rows written:  {}", summary.clean_rows);
                println!("   Coercion fallbacks:  {}", summary.coercion_fallbacks);
                println!("   Output file:         {}", summary.output_file);
            }
            Err(e) => {
                // A layout or API failure in one source must not mask the
                // others, but the operator needs to see it prominently.
                error!("Source run failed: {}", e);
                println!("Source {source_name} failed: {e}");
                return Err(e.into());
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    logging::init_logging();

    let cli = Cli::parse();
    let config = Config::load()?;
    config.paths.ensure_dirs()?;

    match cli.command {
        Commands::Sources { only } => {
            println!("Running source pipelines...");
            let source_names = resolve_source_names(only);
            run_sources(&source_names, &config).await?;
        }
        Commands::Merge => {
            println!("Merging final analysis panel...");
            match panel::run_merge(&config) {
                Ok(report) => {
                    println!("\nMerge completed: {} rows in the final panel", report.rows_after_year_filter);
                }
                Err(e) => {
                    error!("Merge failed: {}", e);
                    println!("Merge failed: {e}");
                    return Err(e.into());
                }
            }
        }
        Commands::Run { only } => {
            println!("Running full pipeline (sources + merge)...");
            let source_names = resolve_source_names(only);

            println!("\nStep 1: sources");
            run_sources(&source_names, &config).await?;

            println!("\nStep 2: merge");
            match panel::run_merge(&config) {
                Ok(report) => {
                    println!("\nFull pipeline completed: {} rows in the final panel", report.rows_after_year_filter);
                }
                Err(e) => {
                    error!("Merge failed: {}", e);
                    println!("Merge failed: {e}");
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}
