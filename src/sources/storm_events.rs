//! NOAA Storm Events: county-level natural disaster records.
//!
//! Downloads the per-year `details` CSV files, keeps county-resolved records,
//! parses the magnitude-suffixed damage strings, and aggregates everything to
//! one row per (fips, year). A county-year with no qualifying events does not
//! appear in the output; absence is the signal for "no recorded disaster."

use crate::coerce::{round2, CoerceStats};
use crate::config::Config;
use crate::constants::{NOAA_BASE_URL, STORM_EVENTS_SOURCE};
use crate::error::{PipelineError, Result};
use crate::fetch;
use crate::sources::{DataSource, SourceSummary};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info, instrument, warn};

pub const RAW_FILE: &str = "storm_events_raw.csv";
pub const PROCESSED_FILE: &str = "storm_events_clean.csv";

/// Convert NOAA damage strings ("10K", "2.5M", "1B", "750") to USD.
///
/// Malformed input degrades to zero rather than failing: the field is noisy
/// and totals over it are expected to be directionally, not exactly, correct.
/// Negative values are treated as malformed.
pub fn parse_damage(raw: &str, stats: &mut CoerceStats) -> f64 {
    let cell = raw.trim();
    if cell.is_empty() || cell == "0" {
        return 0.0;
    }
    stats.attempts += 1;
    let upper = cell.to_ascii_uppercase();
    let (body, multiplier) = match upper.as_bytes().last() {
        Some(b'K') => (&upper[..upper.len() - 1], 1_000.0),
        Some(b'M') => (&upper[..upper.len() - 1], 1_000_000.0),
        Some(b'B') => (&upper[..upper.len() - 1], 1_000_000_000.0),
        _ => (upper.as_str(), 1.0),
    };
    match body.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => value * multiplier,
        _ => {
            stats.fallbacks += 1;
            0.0
        }
    }
}

/// Build a 5-digit county FIPS from separate state and county codes.
///
/// The codes are zero-padded independently (2 + 3 digits) before
/// concatenation; naive string concatenation would turn state 6, county 37
/// into "637" instead of "06037". Non-numeric codes yield `None`.
pub fn build_fips(state_fips: &str, cz_fips: &str) -> Option<String> {
    let state = numeric_code(state_fips)?;
    let county = numeric_code(cz_fips)?;
    Some(format!("{state:02}{county:03}"))
}

// Some NOAA vintages carry FIPS codes as floats ("6.0"); accept those too.
fn numeric_code(raw: &str) -> Option<u32> {
    let value: f64 = raw.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(value as u32)
}

/// The NOAA `details` columns this pipeline consumes. Every other column in
/// the source file is ignored during deserialization.
#[derive(Debug, Deserialize)]
struct NoaaDetailsRow {
    #[serde(rename = "CZ_TYPE", default)]
    cz_type: String,
    #[serde(rename = "STATE_FIPS", default)]
    state_fips: String,
    #[serde(rename = "CZ_FIPS", default)]
    cz_fips: String,
    #[serde(rename = "STATE", default)]
    state: String,
    #[serde(rename = "EVENT_TYPE", default)]
    event_type: String,
    #[serde(rename = "DAMAGE_PROPERTY", default)]
    damage_property: String,
    #[serde(rename = "DAMAGE_CROPS", default)]
    damage_crops: String,
    #[serde(rename = "INJURIES_DIRECT", default)]
    injuries_direct: String,
    #[serde(rename = "INJURIES_INDIRECT", default)]
    injuries_indirect: String,
    #[serde(rename = "DEATHS_DIRECT", default)]
    deaths_direct: String,
    #[serde(rename = "DEATHS_INDIRECT", default)]
    deaths_indirect: String,
}

/// One county-resolved event with parsed damage and casualty figures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StormEvent {
    pub fips: String,
    pub state: String,
    pub year: i32,
    pub hazard_type: String,
    pub property_damage: f64,
    pub crop_damage: f64,
    pub injuries: f64,
    pub fatalities: f64,
}

/// One row per (fips, year): the disaster side of the final panel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountyYearAggregate {
    pub fips: String,
    pub year: i32,
    pub event_count: u32,
    pub total_damage: f64,
    pub property_damage: f64,
    pub crop_damage: f64,
    pub total_injuries: f64,
    pub total_fatalities: f64,
}

/// Parse one year's `details` CSV into county-resolved events.
///
/// Zone-resolved records (`CZ_TYPE != "C"`) are coarser than county and are
/// dropped, as are records whose FIPS fields are not numeric-coercible.
pub fn parse_year_csv(csv_text: &str, year: i32, stats: &mut CoerceStats) -> Result<Vec<StormEvent>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(csv_text.as_bytes());

    let mut events = Vec::new();
    for row in reader.deserialize::<NoaaDetailsRow>() {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                debug!("Skipping unreadable event row: {}", e);
                continue;
            }
        };
        if row.cz_type.trim() != "C" {
            continue;
        }
        let Some(fips) = build_fips(&row.state_fips, &row.cz_fips) else {
            continue;
        };
        events.push(StormEvent {
            fips,
            state: row.state,
            year,
            hazard_type: row.event_type,
            property_damage: parse_damage(&row.damage_property, stats),
            crop_damage: parse_damage(&row.damage_crops, stats),
            injuries: stats.numeric_or_zero(&row.injuries_direct)
                + stats.numeric_or_zero(&row.injuries_indirect),
            fatalities: stats.numeric_or_zero(&row.deaths_direct)
                + stats.numeric_or_zero(&row.deaths_indirect),
        });
    }
    Ok(events)
}

/// Aggregate event-level records to one row per (fips, year), sorted by key.
///
/// `total_damage` is defined as the sum of the two parsed components; it is
/// never re-parsed independently, so the three damage columns cannot drift.
pub fn aggregate_county_year(events: &[StormEvent]) -> Vec<CountyYearAggregate> {
    let mut groups: BTreeMap<(String, i32), CountyYearAggregate> = BTreeMap::new();
    for event in events {
        let group = groups
            .entry((event.fips.clone(), event.year))
            .or_insert_with(|| CountyYearAggregate {
                fips: event.fips.clone(),
                year: event.year,
                event_count: 0,
                total_damage: 0.0,
                property_damage: 0.0,
                crop_damage: 0.0,
                total_injuries: 0.0,
                total_fatalities: 0.0,
            });
        group.event_count += 1;
        group.property_damage += event.property_damage;
        group.crop_damage += event.crop_damage;
        group.total_injuries += event.injuries;
        group.total_fatalities += event.fatalities;
    }

    let mut rows: Vec<CountyYearAggregate> = groups.into_values().collect();
    for row in &mut rows {
        row.property_damage = round2(row.property_damage);
        row.crop_damage = round2(row.crop_damage);
        row.total_damage = round2(row.property_damage + row.crop_damage);
        row.total_injuries = round2(row.total_injuries);
        row.total_fatalities = round2(row.total_fatalities);
    }
    rows
}

/// Scrape the NOAA directory listing into `{year: filename}` for the
/// `details` files. A year can appear under several creation dates; the last
/// occurrence in the listing (most recently created) wins.
pub fn parse_file_index(listing: &str) -> Result<BTreeMap<i32, String>> {
    let pattern = Regex::new(r"StormEvents_details-ftp_v1\.0_d(\d{4})_c\d+\.csv\.gz")
        .map_err(|e| PipelineError::Config(format!("Invalid NOAA filename pattern: {e}")))?;

    let mut index = BTreeMap::new();
    for caps in pattern.captures_iter(listing) {
        let (Some(filename), Some(year)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if let Ok(year) = year.as_str().parse::<i32>() {
            index.insert(year, filename.as_str().to_string());
        }
    }
    Ok(index)
}

async fn fetch_all_years(config: &Config, stats: &mut CoerceStats) -> Result<Vec<StormEvent>> {
    let client = reqwest::Client::new();

    info!("Fetching NOAA directory listing");
    println!("   Fetching NOAA directory listing...");
    let listing_bytes = fetch::fetch_bytes(&client, NOAA_BASE_URL).await?;
    let listing = String::from_utf8_lossy(&listing_bytes);
    let index = parse_file_index(&listing)?;

    let window = &config.storm_events;
    let years: Vec<i32> = index
        .keys()
        .copied()
        .filter(|year| (window.start_year..=window.end_year).contains(year))
        .collect();
    if years.is_empty() {
        return Err(PipelineError::Api {
            message: format!(
                "No NOAA year files found in {}-{}; the directory layout may have changed",
                window.start_year, window.end_year
            ),
        });
    }
    info!("Found {} year files", years.len());
    println!("   Found {} year files, downloading...", years.len());

    let mut events = Vec::new();
    for year in years {
        let Some(filename) = index.get(&year) else {
            continue;
        };
        let url = format!("{NOAA_BASE_URL}{filename}");
        match fetch::fetch_gzipped_text(&client, &url).await {
            Ok(text) => {
                let year_events = parse_year_csv(&text, year, stats)?;
                info!("Fetched {} county events for {}", year_events.len(), year);
                println!("   + {year}  {:>7} county events", year_events.len());
                events.extend(year_events);
            }
            Err(e) => {
                // One bad year must not sink the whole batch
                warn!("Download failed for {}: {}", year, e);
                println!("   x {year}  failed: {e}");
            }
        }
    }

    if events.is_empty() {
        return Err(PipelineError::Api {
            message: "No NOAA data downloaded. Check your internet connection.".to_string(),
        });
    }
    Ok(events)
}

pub fn write_raw_events(path: &Path, events: &[StormEvent]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for event in events {
        writer.serialize(event)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_raw_events(path: &Path) -> Result<Vec<StormEvent>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut events = Vec::new();
    for event in reader.deserialize::<StormEvent>() {
        events.push(event?);
    }
    Ok(events)
}

pub fn write_processed(path: &Path, rows: &[CountyYearAggregate]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

pub fn read_processed(path: &Path) -> Result<Vec<CountyYearAggregate>> {
    if !path.exists() {
        return Err(PipelineError::Config(format!(
            "Processed storm events file not found: {}. Run the storm_events source first.",
            path.display()
        )));
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize::<CountyYearAggregate>() {
        rows.push(row?);
    }
    Ok(rows)
}

pub struct StormEventsSource;

#[async_trait::async_trait]
impl DataSource for StormEventsSource {
    fn source_name(&self) -> &'static str {
        STORM_EVENTS_SOURCE
    }

    #[instrument(skip(self, config))]
    async fn acquire(&self, config: &Config) -> Result<SourceSummary> {
        let raw_path = config.paths.raw_file(RAW_FILE);
        let mut stats = CoerceStats::default();

        let events = if raw_path.exists() {
            info!(
                "Raw file already exists, skipping download: {}",
                raw_path.display()
            );
            println!(
                "   Raw file already exists, skipping download: {}",
                raw_path.display()
            );
            read_raw_events(&raw_path)?
        } else {
            let events = fetch_all_years(config, &mut stats).await?;
            write_raw_events(&raw_path, &events)?;
            info!("Saved {} raw events -> {}", events.len(), raw_path.display());
            events
        };
        println!("   Combined raw events: {}", events.len());

        let panel = aggregate_county_year(&events);
        info!(
            "Aggregated {} events into {} county-year rows",
            events.len(),
            panel.len()
        );
        println!(
            "   Aggregated {} events -> {} county-year rows",
            events.len(),
            panel.len()
        );
        let min_year = panel.iter().map(|r| r.year).min();
        let max_year = panel.iter().map(|r| r.year).max();
        if let (Some(lo), Some(hi)) = (min_year, max_year) {
            let counties: std::collections::BTreeSet<&str> =
                panel.iter().map(|r| r.fips.as_str()).collect();
            println!("   Counties: {}   Years: {lo} - {hi}", counties.len());
        }

        let out_path = config.paths.processed_file(PROCESSED_FILE);
        write_processed(&out_path, &panel)?;
        stats.report(STORM_EVENTS_SOURCE);

        Ok(SourceSummary {
            source_name: STORM_EVENTS_SOURCE,
            raw_rows: events.len(),
            clean_rows: panel.len(),
            coercion_fallbacks: stats.fallbacks,
            output_file: out_path.to_string_lossy().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats() -> CoerceStats {
        CoerceStats::default()
    }

    fn event(fips: &str, year: i32, property: f64, crop: f64) -> StormEvent {
        StormEvent {
            fips: fips.to_string(),
            state: "CALIFORNIA".to_string(),
            year,
            hazard_type: "Flood".to_string(),
            property_damage: property,
            crop_damage: crop,
            injuries: 0.0,
            fatalities: 0.0,
        }
    }

    #[test]
    fn damage_suffixes_multiply() {
        let mut s = stats();
        assert_eq!(parse_damage("10K", &mut s), 10_000.0);
        assert_eq!(parse_damage("2.5M", &mut s), 2_500_000.0);
        assert_eq!(parse_damage("1B", &mut s), 1_000_000_000.0);
        assert_eq!(parse_damage("750", &mut s), 750.0);
        assert_eq!(s.fallbacks, 0);
    }

    #[test]
    fn damage_suffix_is_case_insensitive() {
        let mut s = stats();
        assert_eq!(parse_damage("10k", &mut s), 10_000.0);
        assert_eq!(parse_damage("2.5m", &mut s), 2_500_000.0);
    }

    #[test]
    fn damage_malformed_degrades_to_zero() {
        let mut s = stats();
        assert_eq!(parse_damage("", &mut s), 0.0);
        assert_eq!(parse_damage("garbage", &mut s), 0.0);
        assert_eq!(parse_damage("K", &mut s), 0.0);
        assert_eq!(parse_damage("-5K", &mut s), 0.0);
        // Empty input is missing, not malformed; the other three count.
        assert_eq!(s.fallbacks, 3);
    }

    #[test]
    fn fips_codes_are_padded_independently() {
        assert_eq!(build_fips("6", "37").as_deref(), Some("06037"));
        assert_eq!(build_fips("6.0", "37.0").as_deref(), Some("06037"));
        assert_eq!(build_fips("48", "1").as_deref(), Some("48001"));
        assert_eq!(build_fips("", "37"), None);
        assert_eq!(build_fips("six", "37"), None);
    }

    #[test]
    fn zone_records_and_bad_fips_are_dropped() {
        let csv_text = "\
STATE,STATE_FIPS,CZ_TYPE,CZ_FIPS,EVENT_TYPE,DAMAGE_PROPERTY,DAMAGE_CROPS,INJURIES_DIRECT,INJURIES_INDIRECT,DEATHS_DIRECT,DEATHS_INDIRECT
CALIFORNIA,6,C,37,Flood,5M,0,2,1,0,0
CALIFORNIA,6,Z,37,High Wind,1M,0,0,0,0,0
CALIFORNIA,,C,37,Flood,1K,0,0,0,0,0
";
        let mut s = stats();
        let events = parse_year_csv(csv_text, 2005, &mut s).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fips, "06037");
        assert_eq!(events[0].year, 2005);
        assert_eq!(events[0].property_damage, 5_000_000.0);
        assert_eq!(events[0].injuries, 3.0);
    }

    #[test]
    fn aggregate_counts_and_sums_one_group() {
        let events = vec![
            event("06037", 2005, 1_000.0, 500.0),
            event("06037", 2005, 2_000.0, 0.0),
            event("06037", 2005, 0.0, 0.0),
        ];
        let rows = aggregate_county_year(&events);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].event_count, 3);
        assert_eq!(rows[0].property_damage, 3_000.0);
        assert_eq!(rows[0].crop_damage, 500.0);
        assert_eq!(rows[0].total_damage, 3_500.0);
    }

    #[test]
    fn aggregate_emits_no_zero_rows() {
        // Output keys are exactly the distinct non-empty groups.
        let events = vec![
            event("06037", 2005, 0.0, 0.0),
            event("06037", 2006, 0.0, 0.0),
            event("48001", 2005, 0.0, 0.0),
        ];
        let rows = aggregate_county_year(&events);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|r| r.event_count == 1));
        assert!(rows.iter().all(|r| r.total_damage == 0.0));
    }

    #[test]
    fn aggregate_sorts_by_fips_then_year() {
        let events = vec![
            event("48001", 2006, 0.0, 0.0),
            event("06037", 2006, 0.0, 0.0),
            event("06037", 2005, 0.0, 0.0),
        ];
        let keys: Vec<(String, i32)> = aggregate_county_year(&events)
            .into_iter()
            .map(|r| (r.fips, r.year))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("06037".to_string(), 2005),
                ("06037".to_string(), 2006),
                ("48001".to_string(), 2006),
            ]
        );
    }

    #[test]
    fn file_index_keeps_newest_creation_date_per_year() {
        let listing = r#"
<a href="StormEvents_details-ftp_v1.0_d2005_c20210101.csv.gz">old</a>
<a href="StormEvents_details-ftp_v1.0_d2005_c20230301.csv.gz">new</a>
<a href="StormEvents_details-ftp_v1.0_d2006_c20220101.csv.gz">x</a>
<a href="StormEvents_fatalities-ftp_v1.0_d2005_c20230301.csv.gz">not details</a>
"#;
        let index = parse_file_index(listing).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(
            index[&2005],
            "StormEvents_details-ftp_v1.0_d2005_c20230301.csv.gz"
        );
    }

    #[test]
    fn raw_events_round_trip_through_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.csv");
        let events = vec![event("06037", 2005, 5_000_000.0, 0.0)];
        write_raw_events(&path, &events).unwrap();
        let back = read_raw_events(&path).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].fips, "06037");
        assert_eq!(back[0].property_damage, 5_000_000.0);
    }
}
