//! Shiller national home-price series.
//!
//! The source is a legacy sheet with no labels on its data columns and
//! several interleaved, unrelated series; extraction is by fixed position
//! (see the layout contract in `constants`). This is the most fragile
//! dependency in the pipeline, so the layout is verified as a hard
//! precondition before any value is read: if the probe fails, the component
//! aborts with a layout error instead of silently returning a misaligned
//! series.

use crate::coerce::{round4, CoerceStats};
use crate::config::{Config, ShillerConfig};
use crate::constants::{
    SHILLER_CPI_COL, SHILLER_DATE_COL, SHILLER_HEADER_CANDIDATES, SHILLER_NOMINAL_COL,
    SHILLER_SOURCE, SHILLER_URL, SHILLER_URL_ALT,
};
use crate::error::{PipelineError, Result};
use crate::fetch;
use crate::sources::{DataSource, SourceSummary};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, instrument, warn};

pub const RAW_FILE: &str = "shiller_raw.csv";
pub const PROCESSED_FILE: &str = "shiller_clean.csv";

// Header probe: how many cells in the date column must parse as decimal
// years, and the year span considered plausible for this dataset.
const MIN_DATE_CELLS: usize = 50;
const DATE_RANGE: std::ops::RangeInclusive<f64> = 1880.0..=2030.0;

/// One annual row of the national price series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HpiAnnualRow {
    pub year: i32,
    /// Nominal home price index (Jan 1890 = 100)
    pub nominal_hpi: f64,
    /// Deflator (CPI) series carried alongside the index
    pub cpi: Option<f64>,
    /// Nominal deflated by CPI, rescaled so real == nominal at the
    /// reference year
    pub real_hpi: Option<f64>,
    /// Year-over-year percent changes; absent for the first year
    pub yoy_nominal: Option<f64>,
    pub yoy_real: Option<f64>,
}

/// Read the raw sheet into a cell grid. Rows have uneven widths, so the
/// reader is headerless and flexible.
pub fn read_sheet_grid(text: &str) -> Result<Vec<csv::StringRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    let mut grid = Vec::new();
    for record in reader.records() {
        grid.push(record?);
    }
    Ok(grid)
}

/// Probe the known header offsets and return the first whose data region
/// yields enough decimal-year cells in the date column.
///
/// No qualifying offset means the sheet layout has changed; a silent
/// misalignment would corrupt every downstream value without symptom, so
/// that case is fatal.
pub fn detect_header_row(grid: &[csv::StringRecord]) -> Result<usize> {
    for &candidate in &SHILLER_HEADER_CANDIDATES {
        if candidate + 1 >= grid.len() {
            continue;
        }
        let valid_dates = grid[candidate + 1..]
            .iter()
            .filter_map(|row| row.get(SHILLER_DATE_COL))
            .filter_map(|cell| cell.trim().parse::<f64>().ok())
            .filter(|value| DATE_RANGE.contains(value))
            .count();
        if valid_dates > MIN_DATE_CELLS {
            info!("Detected header row: {}", candidate);
            return Ok(candidate);
        }
    }
    Err(PipelineError::Layout(format!(
        "No candidate header row {:?} yields a decimal-year date column in position {}; \
         the sheet layout has changed and the extraction offsets must be re-verified",
        SHILLER_HEADER_CANDIDATES, SHILLER_DATE_COL
    )))
}

struct MeanAccumulator {
    sum: f64,
    count: u32,
}

impl MeanAccumulator {
    fn new() -> Self {
        Self { sum: 0.0, count: 0 }
    }

    fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / f64::from(self.count))
    }
}

/// Extract the nominal and deflator columns below the header row, average
/// monthly values to annual, and derive the real index and year-over-year
/// changes.
pub fn extract_annual(
    grid: &[csv::StringRecord],
    header_row: usize,
    config: &ShillerConfig,
    stats: &mut CoerceStats,
) -> Result<Vec<HpiAnnualRow>> {
    let mut nominal_by_year: BTreeMap<i32, MeanAccumulator> = BTreeMap::new();
    let mut cpi_by_year: BTreeMap<i32, MeanAccumulator> = BTreeMap::new();

    for row in &grid[header_row + 1..] {
        let date = row
            .get(SHILLER_DATE_COL)
            .and_then(|cell| stats.numeric(cell));
        let nominal = row
            .get(SHILLER_NOMINAL_COL)
            .and_then(|cell| stats.numeric(cell));
        // Rows without both a date and a nominal value carry nothing usable.
        let (Some(date), Some(nominal)) = (date, nominal) else {
            continue;
        };
        let year = date.trunc() as i32;
        if !(config.year_min..=config.year_max).contains(&year) {
            continue;
        }
        nominal_by_year
            .entry(year)
            .or_insert_with(MeanAccumulator::new)
            .push(nominal);
        if let Some(cpi) = row.get(SHILLER_CPI_COL).and_then(|cell| stats.numeric(cell)) {
            cpi_by_year
                .entry(year)
                .or_insert_with(MeanAccumulator::new)
                .push(cpi);
        }
    }

    // A year with no valid nominal values is dropped, not zero-filled.
    let mut rows: Vec<HpiAnnualRow> = nominal_by_year
        .iter()
        .filter_map(|(&year, acc)| {
            acc.mean().map(|nominal| HpiAnnualRow {
                year,
                nominal_hpi: round4(nominal),
                cpi: cpi_by_year.get(&year).and_then(MeanAccumulator::mean).map(round4),
                real_hpi: None,
                yoy_nominal: None,
                yoy_real: None,
            })
        })
        .collect();

    if rows.is_empty() {
        return Err(PipelineError::Layout(
            "Extraction produced no annual rows; the data region below the header is empty"
                .to_string(),
        ));
    }

    // Rescale by the deflator at the reference year so that real == nominal
    // in that year. Falling back to the mean deflator keeps the series
    // usable when the reference year is outside the extracted window.
    let cpi_base = match rows
        .iter()
        .find(|row| row.year == config.reference_year)
        .and_then(|row| row.cpi)
    {
        Some(base) => base,
        None => {
            let values: Vec<f64> = rows.iter().filter_map(|row| row.cpi).collect();
            if values.is_empty() {
                return Err(PipelineError::Layout(format!(
                    "Deflator column {SHILLER_CPI_COL} has no numeric values; cannot compute the real index"
                )));
            }
            let mean = values.iter().sum::<f64>() / values.len() as f64;
            warn!(
                "Reference year {} missing from the deflator series; rescaling by the mean deflator",
                config.reference_year
            );
            mean
        }
    };

    for row in &mut rows {
        row.real_hpi = row
            .cpi
            .map(|cpi| round4(row.nominal_hpi / cpi * cpi_base));
    }

    for i in 1..rows.len() {
        let prev_nominal = rows[i - 1].nominal_hpi;
        if prev_nominal != 0.0 {
            rows[i].yoy_nominal =
                Some(round4((rows[i].nominal_hpi - prev_nominal) / prev_nominal * 100.0));
        }
        if let (Some(prev_real), Some(real)) = (rows[i - 1].real_hpi, rows[i].real_hpi) {
            if prev_real != 0.0 {
                rows[i].yoy_real = Some(round4((real - prev_real) / prev_real * 100.0));
            }
        }
    }

    Ok(rows)
}

pub fn write_processed(path: &Path, rows: &[HpiAnnualRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_processed(path: &Path) -> Result<Vec<HpiAnnualRow>> {
    if !path.exists() {
        return Err(PipelineError::Config(format!(
            "Processed Shiller file not found: {}. Run the shiller source first.",
            path.display()
        )));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<HpiAnnualRow>() {
        rows.push(row?);
    }
    Ok(rows)
}

async fn download_raw(client: &reqwest::Client, dest: &Path) -> Result<()> {
    for url in [SHILLER_URL, SHILLER_URL_ALT] {
        match fetch::download_cached(client, url, dest).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                warn!("Could not download from {}: {}", url, e);
                println!("   Warning: could not download from {url}: {e}");
            }
        }
    }
    Err(PipelineError::Api {
        message: format!(
            "Could not download Shiller data from any URL. \
             Please download manually from https://shillerdata.com/ and save as: {}",
            dest.display()
        ),
    })
}

pub struct ShillerSource;

#[async_trait::async_trait]
impl DataSource for ShillerSource {
    fn source_name(&self) -> &'static str {
        SHILLER_SOURCE
    }

    #[instrument(skip(self, config))]
    async fn acquire(&self, config: &Config) -> Result<SourceSummary> {
        let raw_path = config.paths.raw_file(RAW_FILE);
        let client = reqwest::Client::new();
        download_raw(&client, &raw_path).await?;

        let raw_bytes = std::fs::read(&raw_path)?;
        let text = String::from_utf8_lossy(&raw_bytes);
        let grid = read_sheet_grid(&text)?;
        info!("Raw sheet: {} rows", grid.len());

        let header_row = detect_header_row(&grid)?;
        let mut stats = CoerceStats::default();
        let rows = extract_annual(&grid, header_row, &config.shiller, &mut stats)?;

        info!(
            "Reduced {} sheet rows (monthly) to {} annual rows",
            grid.len() - header_row - 1,
            rows.len()
        );
        println!(
            "   Before: {} rows (monthly) -> After: {} rows (annual)",
            grid.len() - header_row - 1,
            rows.len()
        );
        if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
            println!("   Year range: {} - {}", first.year, last.year);
        }

        let out_path = config.paths.processed_file(PROCESSED_FILE);
        write_processed(&out_path, &rows)?;
        stats.report(SHILLER_SOURCE);

        Ok(SourceSummary {
            source_name: SHILLER_SOURCE,
            raw_rows: grid.len(),
            clean_rows: rows.len(),
            coercion_fallbacks: stats.fallbacks,
            output_file: out_path.to_string_lossy().to_string(),
        })
    }
}
