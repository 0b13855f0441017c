//! FRED macro control series.
//!
//! Each configured series is downloaded at its native (weekly/monthly)
//! frequency from the FRED REST API, reduced to annual means, and extended
//! with year-over-year changes for the index-type series. Series are
//! normalized independently: a year missing from one series never affects
//! another series' availability for that year.

use crate::coerce::{round4, CoerceStats};
use crate::config::{Config, FredConfig};
use crate::constants::{FRED_API_BASE, FRED_SOURCE};
use crate::error::{PipelineError, Result};
use crate::sources::{DataSource, SourceSummary};
use chrono::{Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, instrument, warn};

pub const RAW_FILE: &str = "fred_raw.csv";
pub const PROCESSED_FILE: &str = "fred_clean.csv";

/// Output column whose annual first difference is also emitted
const MORTGAGE_RATE_COLUMN: &str = "mortgage_rate_30yr";
const MORTGAGE_RATE_CHG_COLUMN: &str = "mortgage_rate_chg";

/// One observation exactly as the API delivers it. The value stays a string
/// until coercion because FRED uses `"."` as its missing-value sentinel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FredObservation {
    pub date: NaiveDate,
    pub value: String,
}

/// Native-frequency observations keyed by output column name
pub type SeriesObservations = BTreeMap<String, Vec<FredObservation>>;

/// One annual row of macro controls. Columns are dynamic (from config), so
/// values live in an ordered map; a series with no valid observations in a
/// year is simply absent from that year's map.
#[derive(Debug, Clone, PartialEq)]
pub struct MacroAnnualRow {
    pub year: i32,
    pub values: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    observations: Vec<FredObservation>,
}

/// Resolve the FRED API key from the environment.
pub fn resolve_api_key() -> Result<String> {
    match std::env::var("FRED_API_KEY") {
        Ok(key) if !key.trim().is_empty() => Ok(key.trim().to_string()),
        _ => Err(PipelineError::Config(
            "FRED_API_KEY is not set. Get a free key at \
             https://fred.stlouisfed.org/docs/api/api_key.html and export it \
             (or put it in a .env file)."
                .to_string(),
        )),
    }
}

async fn fetch_series(
    client: &reqwest::Client,
    series_id: &str,
    api_key: &str,
    observation_start: &str,
) -> Result<Vec<FredObservation>> {
    let observation_end = Utc::now().date_naive().format("%Y-%m-%d").to_string();
    let response = client
        .get(FRED_API_BASE)
        .query(&[
            ("series_id", series_id),
            ("api_key", api_key),
            ("file_type", "json"),
            ("observation_start", observation_start),
            ("observation_end", observation_end.as_str()),
        ])
        .send()
        .await?
        .error_for_status()?;
    let body = response.bytes().await?;
    let data: ObservationsResponse = serde_json::from_slice(&body)?;
    Ok(data.observations)
}

async fn fetch_all(config: &FredConfig, api_key: &str) -> Result<SeriesObservations> {
    let client = reqwest::Client::new();
    let mut all_series = SeriesObservations::new();

    for series in &config.series {
        match fetch_series(&client, &series.id, api_key, &config.observation_start).await {
            Ok(observations) => {
                info!(
                    "Fetched {} ({} observations) -> {}",
                    series.id,
                    observations.len(),
                    series.column
                );
                println!(
                    "   + {:<14} -> {:<24} ({} obs)",
                    series.id,
                    series.column,
                    observations.len()
                );
                all_series.insert(series.column.clone(), observations);
            }
            Err(e) => {
                // A single failed series is skipped; zero series is fatal below.
                warn!("Fetch failed for {}: {}", series.id, e);
                println!("   x {:<14} failed: {e}", series.id);
            }
        }
    }

    if all_series.is_empty() {
        return Err(PipelineError::Api {
            message: "No FRED series could be downloaded. Check your API key.".to_string(),
        });
    }
    Ok(all_series)
}

/// Reduce native-frequency observations to one annual mean per (series,
/// year), then derive the configured year-over-year columns.
pub fn to_annual(
    series: &SeriesObservations,
    config: &FredConfig,
    stats: &mut CoerceStats,
) -> Vec<MacroAnnualRow> {
    let mut by_year: BTreeMap<i32, BTreeMap<String, f64>> = BTreeMap::new();

    for (column, observations) in series {
        let mut sums: BTreeMap<i32, (f64, u32)> = BTreeMap::new();
        for obs in observations {
            if let Some(value) = stats.numeric(&obs.value) {
                let entry = sums.entry(obs.date.year()).or_insert((0.0, 0));
                entry.0 += value;
                entry.1 += 1;
            }
        }
        for (year, (sum, count)) in sums {
            by_year
                .entry(year)
                .or_default()
                .insert(column.clone(), round4(sum / f64::from(count)));
        }
    }

    // Derived columns compare adjacent annual rows; both sides must be
    // present, so the first year of any series stays absent.
    let years: Vec<i32> = by_year.keys().copied().collect();
    let mut derived: Vec<(i32, String, f64)> = Vec::new();
    for column in &config.yoy_columns {
        for pair in years.windows(2) {
            let prev = by_year.get(&pair[0]).and_then(|m| m.get(column)).copied();
            let current = by_year.get(&pair[1]).and_then(|m| m.get(column)).copied();
            if let (Some(prev), Some(current)) = (prev, current) {
                if prev != 0.0 {
                    derived.push((
                        pair[1],
                        format!("{column}_yoy"),
                        round4((current - prev) / prev * 100.0),
                    ));
                }
            }
        }
    }
    if series.contains_key(MORTGAGE_RATE_COLUMN) {
        for pair in years.windows(2) {
            let prev = by_year
                .get(&pair[0])
                .and_then(|m| m.get(MORTGAGE_RATE_COLUMN))
                .copied();
            let current = by_year
                .get(&pair[1])
                .and_then(|m| m.get(MORTGAGE_RATE_COLUMN))
                .copied();
            if let (Some(prev), Some(current)) = (prev, current) {
                derived.push((
                    pair[1],
                    MORTGAGE_RATE_CHG_COLUMN.to_string(),
                    round4(current - prev),
                ));
            }
        }
    }
    for (year, column, value) in derived {
        if let Some(row) = by_year.get_mut(&year) {
            row.insert(column, value);
        }
    }

    by_year
        .into_iter()
        .map(|(year, values)| MacroAnnualRow { year, values })
        .collect()
}

/// Output column order: configured base columns first, then the derived
/// year-over-year and difference columns.
pub fn output_columns(config: &FredConfig) -> Vec<String> {
    let mut columns: Vec<String> = config.series.iter().map(|s| s.column.clone()).collect();
    for column in &config.yoy_columns {
        columns.push(format!("{column}_yoy"));
    }
    if columns.iter().any(|c| c == MORTGAGE_RATE_COLUMN) {
        columns.push(MORTGAGE_RATE_CHG_COLUMN.to_string());
    }
    columns
}

#[derive(Debug, Serialize, Deserialize)]
struct RawObservationRow {
    series: String,
    date: NaiveDate,
    value: String,
}

pub fn write_raw(path: &Path, series: &SeriesObservations) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for (column, observations) in series {
        for obs in observations {
            writer.serialize(RawObservationRow {
                series: column.clone(),
                date: obs.date,
                value: obs.value.clone(),
            })?;
        }
    }
    writer.flush()?;
    Ok(())
}

pub fn read_raw(path: &Path) -> Result<SeriesObservations> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut series = SeriesObservations::new();
    for row in reader.deserialize::<RawObservationRow>() {
        let row = row?;
        series
            .entry(row.series)
            .or_insert_with(Vec::new)
            .push(FredObservation {
                date: row.date,
                value: row.value,
            });
    }
    Ok(series)
}

/// Write the annual table with a `year` column followed by the configured
/// columns; absent values serialize as empty cells.
pub fn write_processed(path: &Path, rows: &[MacroAnnualRow], columns: &[String]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut header = vec!["year".to_string()];
    header.extend(columns.iter().cloned());
    writer.write_record(&header)?;

    for row in rows {
        let mut record = vec![row.year.to_string()];
        for column in columns {
            record.push(
                row.values
                    .get(column)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read the annual table back; returns the column names (without `year`)
/// and the rows.
pub fn read_processed(path: &Path) -> Result<(Vec<String>, Vec<MacroAnnualRow>)> {
    if !path.exists() {
        return Err(PipelineError::Config(format!(
            "Processed FRED file not found: {}. Run the fred source first.",
            path.display()
        )));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    if headers.get(0) != Some("year") {
        return Err(PipelineError::Layout(format!(
            "Expected first column 'year' in {}, found {:?}",
            path.display(),
            headers.get(0)
        )));
    }
    let columns: Vec<String> = headers.iter().skip(1).map(str::to_string).collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let year: i32 = record
            .get(0)
            .and_then(|cell| cell.trim().parse().ok())
            .ok_or_else(|| {
                PipelineError::MissingField(format!("year in {}", path.display()))
            })?;
        let mut values = BTreeMap::new();
        for (column, cell) in columns.iter().zip(record.iter().skip(1)) {
            if let Ok(value) = cell.trim().parse::<f64>() {
                values.insert(column.clone(), value);
            }
        }
        rows.push(MacroAnnualRow { year, values });
    }
    Ok((columns, rows))
}

pub struct FredSource;

#[async_trait::async_trait]
impl DataSource for FredSource {
    fn source_name(&self) -> &'static str {
        FRED_SOURCE
    }

    #[instrument(skip(self, config))]
    async fn acquire(&self, config: &Config) -> Result<SourceSummary> {
        let raw_path = config.paths.raw_file(RAW_FILE);

        let series = if raw_path.exists() {
            info!(
                "Raw file already exists, skipping download: {}",
                raw_path.display()
            );
            println!(
                "   Raw file already exists, skipping download: {}",
                raw_path.display()
            );
            read_raw(&raw_path)?
        } else {
            let api_key = resolve_api_key()?;
            println!("   Fetching {} series from FRED...", config.fred.series.len());
            let series = fetch_all(&config.fred, &api_key).await?;
            write_raw(&raw_path, &series)?;
            series
        };

        let raw_rows: usize = series.values().map(Vec::len).sum();
        println!("   Combined raw observations: {raw_rows}");

        let mut stats = CoerceStats::default();
        let rows = to_annual(&series, &config.fred, &mut stats);
        info!(
            "Reduced {} observations across {} series to {} annual rows",
            raw_rows,
            series.len(),
            rows.len()
        );
        println!(
            "   Reduced {} observations -> {} annual rows",
            raw_rows,
            rows.len()
        );
        if let (Some(first), Some(last)) = (rows.first(), rows.last()) {
            println!("   Year range: {} - {}", first.year, last.year);
        }

        let columns = output_columns(&config.fred);
        let out_path = config.paths.processed_file(PROCESSED_FILE);
        write_processed(&out_path, &rows, &columns)?;
        stats.report(FRED_SOURCE);

        Ok(SourceSummary {
            source_name: FRED_SOURCE,
            raw_rows,
            clean_rows: rows.len(),
            coercion_fallbacks: stats.fallbacks,
            output_file: out_path.to_string_lossy().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(date: &str, value: &str) -> FredObservation {
        FredObservation {
            date: date.parse().unwrap(),
            value: value.to_string(),
        }
    }

    fn config_with(series: &[(&str, &str)], yoy: &[&str]) -> FredConfig {
        FredConfig {
            observation_start: "1960-01-01".to_string(),
            series: series
                .iter()
                .map(|(id, column)| crate::config::FredSeries {
                    id: (*id).to_string(),
                    column: (*column).to_string(),
                })
                .collect(),
            yoy_columns: yoy.iter().map(|c| (*c).to_string()).collect(),
        }
    }

    #[test]
    fn annual_mean_ignores_sentinel_observations() {
        let mut series = SeriesObservations::new();
        series.insert(
            "unemployment_rate".to_string(),
            vec![
                obs("2005-01-01", "4.0"),
                obs("2005-02-01", "."),
                obs("2005-03-01", "6.0"),
            ],
        );
        let config = config_with(&[("UNRATE", "unemployment_rate")], &[]);
        let mut stats = CoerceStats::default();
        let rows = to_annual(&series, &config, &mut stats);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].year, 2005);
        assert_eq!(rows[0].values["unemployment_rate"], 5.0);
        assert_eq!(stats.fallbacks, 0);
    }

    #[test]
    fn year_with_no_valid_observations_is_absent() {
        let mut series = SeriesObservations::new();
        series.insert(
            "unemployment_rate".to_string(),
            vec![
                obs("2005-01-01", "4.0"),
                obs("2006-01-01", "."),
                obs("2007-01-01", "5.0"),
            ],
        );
        let config = config_with(&[("UNRATE", "unemployment_rate")], &[]);
        let rows = to_annual(&series, &config, &mut CoerceStats::default());

        let years: Vec<i32> = rows.iter().map(|r| r.year).collect();
        assert_eq!(years, vec![2005, 2007]);
    }

    #[test]
    fn series_are_normalized_independently() {
        let mut series = SeriesObservations::new();
        series.insert(
            "unemployment_rate".to_string(),
            vec![obs("2005-01-01", "4.0")],
        );
        series.insert(
            "treasury_10yr".to_string(),
            vec![obs("2006-01-01", "4.5")],
        );
        let config = config_with(
            &[("UNRATE", "unemployment_rate"), ("GS10", "treasury_10yr")],
            &[],
        );
        let rows = to_annual(&series, &config, &mut CoerceStats::default());

        assert_eq!(rows.len(), 2);
        assert!(rows[0].values.contains_key("unemployment_rate"));
        assert!(!rows[0].values.contains_key("treasury_10yr"));
        assert!(rows[1].values.contains_key("treasury_10yr"));
        assert!(!rows[1].values.contains_key("unemployment_rate"));
    }

    #[test]
    fn yoy_only_for_configured_index_series() {
        let mut series = SeriesObservations::new();
        series.insert(
            "cpi_all_items".to_string(),
            vec![obs("2005-06-01", "100.0"), obs("2006-06-01", "103.0")],
        );
        series.insert(
            "unemployment_rate".to_string(),
            vec![obs("2005-06-01", "4.0"), obs("2006-06-01", "5.0")],
        );
        let config = config_with(
            &[("CPIAUCSL", "cpi_all_items"), ("UNRATE", "unemployment_rate")],
            &["cpi_all_items"],
        );
        let rows = to_annual(&series, &config, &mut CoerceStats::default());

        assert!(!rows[0].values.contains_key("cpi_all_items_yoy"));
        assert_eq!(rows[1].values["cpi_all_items_yoy"], 3.0);
        assert!(!rows[1].values.contains_key("unemployment_rate_yoy"));
    }

    #[test]
    fn mortgage_rate_gets_annual_difference() {
        let mut series = SeriesObservations::new();
        series.insert(
            MORTGAGE_RATE_COLUMN.to_string(),
            vec![obs("2005-06-01", "5.8"), obs("2006-06-01", "6.4")],
        );
        let config = config_with(&[("MORTGAGE30US", MORTGAGE_RATE_COLUMN)], &[]);
        let rows = to_annual(&series, &config, &mut CoerceStats::default());

        assert!(!rows[0].values.contains_key(MORTGAGE_RATE_CHG_COLUMN));
        assert!((rows[1].values[MORTGAGE_RATE_CHG_COLUMN] - 0.6).abs() < 1e-9);
    }

    #[test]
    fn processed_table_round_trips_with_absent_cells() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fred_clean.csv");

        let mut series = SeriesObservations::new();
        series.insert(
            "unemployment_rate".to_string(),
            vec![obs("2005-01-01", "4.0"), obs("2007-01-01", "5.0")],
        );
        series.insert(
            "treasury_10yr".to_string(),
            vec![obs("2006-01-01", "4.5")],
        );
        let config = config_with(
            &[("UNRATE", "unemployment_rate"), ("GS10", "treasury_10yr")],
            &[],
        );
        let rows = to_annual(&series, &config, &mut CoerceStats::default());
        let columns = output_columns(&config);
        write_processed(&path, &rows, &columns).unwrap();

        let (read_columns, read_rows) = read_processed(&path).unwrap();
        assert_eq!(read_columns, columns);
        assert_eq!(read_rows, rows);
    }
}
