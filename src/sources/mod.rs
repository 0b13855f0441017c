use crate::config::Config;
use crate::constants;
use crate::error::Result;

pub mod fred;
pub mod shiller;
pub mod storm_events;

/// Outcome of one source's fetch-and-clean run, for the CLI summary
#[derive(Debug)]
pub struct SourceSummary {
    pub source_name: &'static str,
    /// Raw rows or observations that entered the cleaning step
    pub raw_rows: usize,
    /// Rows in the cleaned annual table that was written
    pub clean_rows: usize,
    /// Numeric cells that degraded to the neutral value during cleaning
    pub coercion_fallbacks: u64,
    pub output_file: String,
}

/// Core trait that every raw data source implements.
///
/// A source owns its raw acquisition (cached on disk), its cleaning rules,
/// and its processed output file. Sources are independent of one another;
/// the panel merger is the only consumer of their outputs.
#[async_trait::async_trait]
pub trait DataSource: Send + Sync {
    /// Unique identifier for this source (CLI name and log label)
    fn source_name(&self) -> &'static str;

    /// Fetch (or reuse cached) raw data, clean it, and write the processed
    /// annual table under the configured processed directory.
    async fn acquire(&self, config: &Config) -> Result<SourceSummary>;
}

/// Look up a source implementation by its CLI name
pub fn create_source(source_name: &str) -> Option<Box<dyn DataSource>> {
    match source_name {
        constants::STORM_EVENTS_SOURCE => Some(Box::new(storm_events::StormEventsSource)),
        constants::SHILLER_SOURCE => Some(Box::new(shiller::ShillerSource)),
        constants::FRED_SOURCE => Some(Box::new(fred::FredSource)),
        _ => None,
    }
}
