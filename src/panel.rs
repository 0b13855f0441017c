//! Panel merger: joins the three cleaned annual tables into the final
//! county-year analysis panel and verifies the structural invariants.
//!
//! The county-year disaster aggregate is the unit of analysis; the national
//! price and macro tables are left-joined on year (national series apply
//! uniformly to every county in a year). Fan-out and duplicate keys indicate
//! a broken join key upstream and abort the run; a year absent from a
//! national table surfaces as absent fields, never zero.

use crate::coerce::round4;
use crate::config::Config;
use crate::error::{PipelineError, Result};
use crate::sources::fred::{self, MacroAnnualRow};
use crate::sources::shiller::{self, HpiAnnualRow};
use crate::sources::storm_events::{self, CountyYearAggregate};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{info, instrument};

pub const PANEL_FILE: &str = "housing_disasters_panel.csv";

/// Ordered event-count bucket for the disaster-intensity categorical
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Intensity {
    None,
    Low,
    Moderate,
    High,
    VeryHigh,
}

impl Intensity {
    /// Bucket an event count using the configured inclusive upper bounds
    /// for low/moderate/high. Aggregate rows always have at least one
    /// event, so `None` only appears for hypothetical zero counts.
    pub fn from_event_count(count: u32, breaks: &[u32; 3]) -> Self {
        match count {
            0 => Self::None,
            c if c <= breaks[0] => Self::Low,
            c if c <= breaks[1] => Self::Moderate,
            c if c <= breaks[2] => Self::High,
            _ => Self::VeryHigh,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Low => "low",
            Self::Moderate => "moderate",
            Self::High => "high",
            Self::VeryHigh => "very_high",
        }
    }
}

/// One row of the final panel
#[derive(Debug, Clone)]
pub struct PanelRow {
    pub aggregate: CountyYearAggregate,
    /// Natural log of (total_damage + 1); tames the heavy right skew
    pub log_total_damage: f64,
    pub disaster_intensity: Intensity,
    /// National price series for this row's year, when available
    pub hpi: Option<HpiAnnualRow>,
    /// Macro controls for this row's year; may be empty when the year is
    /// absent from the macro table
    pub macros: std::collections::BTreeMap<String, f64>,
}

/// Audit trail of one merge run, reported on the console
#[derive(Debug)]
pub struct MergeReport {
    pub input_rows: usize,
    pub dropped_missing_key: usize,
    pub rows_after_joins: usize,
    pub rows_after_year_filter: usize,
    /// Percent of rows missing each nationally-sourced column
    pub missing_rates: Vec<(String, f64)>,
}

/// Index an annual table by year, failing on duplicates.
///
/// Uniqueness of the right-hand tables is what guarantees the left joins
/// cannot fan out; a duplicate year here means an upstream component broke
/// its one-row-per-year invariant.
fn index_by_year<'a, T>(rows: &'a [T], year_of: impl Fn(&T) -> i32, label: &str) -> Result<HashMap<i32, &'a T>> {
    let mut index = HashMap::with_capacity(rows.len());
    for row in rows {
        let year = year_of(row);
        if index.insert(year, row).is_some() {
            return Err(PipelineError::JoinKey(format!(
                "{label} table has more than one row for year {year}; joins would fan out"
            )));
        }
    }
    Ok(index)
}

/// Merge the three cleaned tables into the final panel.
///
/// Row count is preserved across both joins (verified), rows with a missing
/// key are dropped and counted, the year window is inclusive on both ends,
/// and duplicate (fips, year) pairs are fatal.
pub fn merge_panel(
    aggregates: Vec<CountyYearAggregate>,
    hpi_rows: &[HpiAnnualRow],
    macro_rows: &[MacroAnnualRow],
    macro_columns: &[String],
    config: &Config,
) -> Result<(Vec<PanelRow>, MergeReport)> {
    let hpi_by_year = index_by_year(hpi_rows, |r| r.year, "national price")?;
    let macros_by_year = index_by_year(macro_rows, |r| r.year, "macro controls")?;

    let input_rows = aggregates.len();

    // Rows without both keys cannot be assigned to the panel.
    let (keyed, dropped): (Vec<_>, Vec<_>) = aggregates
        .into_iter()
        .partition(|row| !row.fips.trim().is_empty() && row.year > 0);
    let dropped_missing_key = dropped.len();
    if dropped_missing_key > 0 {
        info!("Dropped {} rows with missing fips or year", dropped_missing_key);
        println!("   Dropped {dropped_missing_key} rows with missing fips or year");
    }

    info!("Left join on year: national price table");
    println!("   [Merge] disaster aggregate <- national price (left join on year)...");
    let joined_once: Vec<(CountyYearAggregate, Option<HpiAnnualRow>)> = keyed
        .into_iter()
        .map(|row| {
            let hpi = hpi_by_year.get(&row.year).map(|&r| r.clone());
            (row, hpi)
        })
        .collect();
    println!("   After price join: {} rows", joined_once.len());

    info!("Left join on year: macro controls table");
    println!("   [Merge] panel <- macro controls (left join on year)...");
    let joined: Vec<PanelRow> = joined_once
        .into_iter()
        .map(|(aggregate, hpi)| {
            let macros = macros_by_year
                .get(&aggregate.year)
                .map(|r| r.values.clone())
                .unwrap_or_default();
            let log_total_damage = round4((aggregate.total_damage.max(0.0) + 1.0).ln());
            let disaster_intensity = Intensity::from_event_count(
                aggregate.event_count,
                &config.panel.intensity_breaks,
            );
            PanelRow {
                aggregate,
                log_total_damage,
                disaster_intensity,
                hpi,
                macros,
            }
        })
        .collect();
    println!("   After macro join: {} rows", joined.len());

    let rows_after_joins = joined.len();
    if rows_after_joins != input_rows - dropped_missing_key {
        return Err(PipelineError::JoinKey(format!(
            "Row count changed across joins: {} in, {} out",
            input_rows - dropped_missing_key,
            rows_after_joins
        )));
    }

    // Inclusive on both ends
    let (year_min, year_max) = (config.panel.year_min, config.panel.year_max);
    let mut panel: Vec<PanelRow> = joined
        .into_iter()
        .filter(|row| (year_min..=year_max).contains(&row.aggregate.year))
        .collect();
    info!(
        "Year filter {}-{}: {} -> {} rows",
        year_min,
        year_max,
        rows_after_joins,
        panel.len()
    );
    println!(
        "   Year filter ({year_min}-{year_max}): {} -> {} rows",
        rows_after_joins,
        panel.len()
    );

    let mut seen: HashSet<(&str, i32)> = HashSet::with_capacity(panel.len());
    for row in &panel {
        if !seen.insert((row.aggregate.fips.as_str(), row.aggregate.year)) {
            return Err(PipelineError::JoinKey(format!(
                "Duplicate (fips, year) pair in panel: ({}, {})",
                row.aggregate.fips, row.aggregate.year
            )));
        }
    }
    drop(seen);

    panel.sort_by(|a, b| {
        (&a.aggregate.fips, a.aggregate.year).cmp(&(&b.aggregate.fips, b.aggregate.year))
    });

    let missing_rates = compute_missing_rates(&panel, macro_columns);
    let report = MergeReport {
        input_rows,
        dropped_missing_key,
        rows_after_joins,
        rows_after_year_filter: panel.len(),
        missing_rates,
    };
    Ok((panel, report))
}

/// Columns sourced from the national price table, in output order
const HPI_COLUMNS: [&str; 5] = ["nominal_hpi", "cpi_shiller", "real_hpi", "yoy_nominal", "yoy_real"];

fn hpi_field(row: &PanelRow, column: &str) -> Option<f64> {
    let hpi = row.hpi.as_ref()?;
    match column {
        "nominal_hpi" => Some(hpi.nominal_hpi),
        "cpi_shiller" => hpi.cpi,
        "real_hpi" => hpi.real_hpi,
        "yoy_nominal" => hpi.yoy_nominal,
        "yoy_real" => hpi.yoy_real,
        _ => None,
    }
}

fn compute_missing_rates(panel: &[PanelRow], macro_columns: &[String]) -> Vec<(String, f64)> {
    if panel.is_empty() {
        return Vec::new();
    }
    let total = panel.len() as f64;
    let mut rates = Vec::new();
    for column in HPI_COLUMNS {
        let missing = panel.iter().filter(|row| hpi_field(row, column).is_none()).count();
        rates.push((column.to_string(), missing as f64 / total * 100.0));
    }
    for column in macro_columns {
        let missing = panel
            .iter()
            .filter(|row| !row.macros.contains_key(column))
            .count();
        rates.push((column.clone(), missing as f64 / total * 100.0));
    }
    rates
}

/// Print the post-merge verification block (spec'd audit surface: a run's
/// correctness should be checkable from console output alone).
pub fn print_verification(panel: &[PanelRow], report: &MergeReport) {
    println!("\n==================================================");
    println!("PANEL VERIFICATION");
    println!("==================================================");
    println!("   Total rows:      {}", panel.len());
    let counties: HashSet<&str> = panel.iter().map(|r| r.aggregate.fips.as_str()).collect();
    println!("   Unique counties: {}", counties.len());
    if let (Some(first), Some(last)) = (
        panel.iter().map(|r| r.aggregate.year).min(),
        panel.iter().map(|r| r.aggregate.year).max(),
    ) {
        println!("   Year range:      {first} - {last}");
    }
    println!("   Dropped for missing keys: {}", report.dropped_missing_key);

    let nonzero: Vec<&(String, f64)> = report
        .missing_rates
        .iter()
        .filter(|(_, rate)| *rate > 0.0)
        .collect();
    if nonzero.is_empty() {
        println!("\n   No missing values in nationally-sourced columns");
    } else {
        println!("\n   Missing values (% per column):");
        for (column, rate) in nonzero {
            println!("     {column:<28} {rate:.1}%");
        }
    }
}

/// Write the final panel. Overwrite semantics: the file is replaced on
/// every run, never appended.
pub fn write_panel(path: &Path, panel: &[PanelRow], macro_columns: &[String]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;

    let mut header: Vec<String> = [
        "fips",
        "year",
        "event_count",
        "property_damage",
        "crop_damage",
        "total_damage",
        "total_injuries",
        "total_fatalities",
        "log_total_damage",
        "disaster_intensity",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    header.extend(HPI_COLUMNS.iter().map(|s| s.to_string()));
    header.extend(macro_columns.iter().cloned());
    writer.write_record(&header)?;

    for row in panel {
        let agg = &row.aggregate;
        let mut record = vec![
            agg.fips.clone(),
            agg.year.to_string(),
            agg.event_count.to_string(),
            agg.property_damage.to_string(),
            agg.crop_damage.to_string(),
            agg.total_damage.to_string(),
            agg.total_injuries.to_string(),
            agg.total_fatalities.to_string(),
            row.log_total_damage.to_string(),
            row.disaster_intensity.as_str().to_string(),
        ];
        for column in HPI_COLUMNS {
            record.push(
                hpi_field(row, column)
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            );
        }
        for column in macro_columns {
            record.push(
                row.macros
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

/// Load the three processed tables, merge, verify, and write the panel.
#[instrument(skip(config))]
pub fn run_merge(config: &Config) -> Result<MergeReport> {
    println!("   Loading processed datasets...");
    let aggregates =
        storm_events::read_processed(&config.paths.processed_file(storm_events::PROCESSED_FILE))?;
    println!("   Loaded storm_events  {:>8} rows", aggregates.len());
    let hpi_rows = shiller::read_processed(&config.paths.processed_file(shiller::PROCESSED_FILE))?;
    println!("   Loaded shiller       {:>8} rows", hpi_rows.len());
    let (macro_columns, macro_rows) =
        fred::read_processed(&config.paths.processed_file(fred::PROCESSED_FILE))?;
    println!("   Loaded fred          {:>8} rows", macro_rows.len());

    let (panel, report) = merge_panel(aggregates, &hpi_rows, &macro_rows, &macro_columns, config)?;
    print_verification(&panel, &report);

    let out_path = config.paths.final_file(PANEL_FILE);
    write_panel(&out_path, &panel, &macro_columns)?;
    info!("Final panel saved: {} rows -> {}", panel.len(), out_path.display());
    println!("\n   Final panel saved -> {}", out_path.display());
    println!("   Shape: {} rows x {} columns", panel.len(), 10 + HPI_COLUMNS.len() + macro_columns.len());

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::fred::MacroAnnualRow;
    use crate::sources::shiller::HpiAnnualRow;
    use std::collections::BTreeMap;

    fn aggregate(fips: &str, year: i32, event_count: u32, total_damage: f64) -> CountyYearAggregate {
        CountyYearAggregate {
            fips: fips.to_string(),
            year,
            event_count,
            total_damage,
            property_damage: total_damage,
            crop_damage: 0.0,
            total_injuries: 0.0,
            total_fatalities: 0.0,
        }
    }

    fn hpi(year: i32, nominal: f64) -> HpiAnnualRow {
        HpiAnnualRow {
            year,
            nominal_hpi: nominal,
            cpi: Some(100.0),
            real_hpi: Some(nominal),
            yoy_nominal: None,
            yoy_real: None,
        }
    }

    fn macro_row(year: i32, column: &str, value: f64) -> MacroAnnualRow {
        let mut values = BTreeMap::new();
        values.insert(column.to_string(), value);
        MacroAnnualRow { year, values }
    }

    fn test_config(year_min: i32, year_max: i32) -> Config {
        let mut config = Config::default();
        config.panel.year_min = year_min;
        config.panel.year_max = year_max;
        config
    }

    #[test]
    fn intensity_buckets_match_thresholds() {
        let breaks = [2, 5, 10];
        assert_eq!(Intensity::from_event_count(0, &breaks), Intensity::None);
        assert_eq!(Intensity::from_event_count(1, &breaks), Intensity::Low);
        assert_eq!(Intensity::from_event_count(2, &breaks), Intensity::Low);
        assert_eq!(Intensity::from_event_count(3, &breaks), Intensity::Moderate);
        assert_eq!(Intensity::from_event_count(5, &breaks), Intensity::Moderate);
        assert_eq!(Intensity::from_event_count(6, &breaks), Intensity::High);
        assert_eq!(Intensity::from_event_count(10, &breaks), Intensity::High);
        assert_eq!(Intensity::from_event_count(11, &breaks), Intensity::VeryHigh);
    }

    #[test]
    fn joins_preserve_row_count() {
        let aggregates = vec![
            aggregate("06037", 2005, 1, 100.0),
            aggregate("06037", 2006, 2, 200.0),
            aggregate("48001", 2005, 3, 300.0),
        ];
        let hpi_rows = vec![hpi(2005, 150.0), hpi(2006, 160.0)];
        let macro_rows = vec![macro_row(2005, "unemployment_rate", 5.0)];
        let columns = vec!["unemployment_rate".to_string()];

        let (panel, report) = merge_panel(
            aggregates,
            &hpi_rows,
            &macro_rows,
            &columns,
            &test_config(1980, 2022),
        )
        .unwrap();
        assert_eq!(panel.len(), 3);
        assert_eq!(report.rows_after_joins, 3);
        assert_eq!(report.dropped_missing_key, 0);
    }

    #[test]
    fn duplicate_year_in_national_table_is_fatal() {
        let aggregates = vec![aggregate("06037", 2005, 1, 100.0)];
        let hpi_rows = vec![hpi(2005, 150.0), hpi(2005, 151.0)];

        let err = merge_panel(aggregates, &hpi_rows, &[], &[], &test_config(1980, 2022))
            .unwrap_err();
        assert!(matches!(err, PipelineError::JoinKey(_)));
    }

    #[test]
    fn duplicate_county_year_pair_is_fatal() {
        let aggregates = vec![
            aggregate("06037", 2005, 1, 100.0),
            aggregate("06037", 2005, 2, 200.0),
        ];
        let err = merge_panel(aggregates, &[], &[], &[], &test_config(1980, 2022)).unwrap_err();
        assert!(matches!(err, PipelineError::JoinKey(_)));
    }

    #[test]
    fn missing_key_rows_are_dropped_and_counted() {
        let aggregates = vec![
            aggregate("06037", 2005, 1, 100.0),
            aggregate("", 2005, 1, 100.0),
            aggregate("48001", 0, 1, 100.0),
        ];
        let (panel, report) =
            merge_panel(aggregates, &[], &[], &[], &test_config(1980, 2022)).unwrap();
        assert_eq!(panel.len(), 1);
        assert_eq!(report.dropped_missing_key, 2);
    }

    #[test]
    fn year_filter_is_inclusive_on_both_ends() {
        let aggregates = vec![
            aggregate("06037", 1979, 1, 0.0),
            aggregate("06037", 1980, 1, 0.0),
            aggregate("06037", 2000, 1, 0.0),
            aggregate("06037", 2022, 1, 0.0),
            aggregate("06037", 2023, 1, 0.0),
        ];
        let (panel, _) =
            merge_panel(aggregates, &[], &[], &[], &test_config(1980, 2022)).unwrap();
        let years: Vec<i32> = panel.iter().map(|r| r.aggregate.year).collect();
        assert_eq!(years, vec![1980, 2000, 2022]);
    }

    #[test]
    fn absent_national_year_yields_absent_fields_not_zero() {
        let aggregates = vec![aggregate("06037", 2005, 1, 100.0)];
        let hpi_rows = vec![hpi(2004, 150.0)];
        let macro_rows = vec![macro_row(2004, "unemployment_rate", 5.0)];
        let columns = vec!["unemployment_rate".to_string()];

        let (panel, report) = merge_panel(
            aggregates,
            &hpi_rows,
            &macro_rows,
            &columns,
            &test_config(1980, 2022),
        )
        .unwrap();
        assert!(panel[0].hpi.is_none());
        assert!(panel[0].macros.is_empty());
        let nominal_rate = report
            .missing_rates
            .iter()
            .find(|(c, _)| c == "nominal_hpi")
            .unwrap();
        assert_eq!(nominal_rate.1, 100.0);
    }

    #[test]
    fn log_damage_and_sort_order() {
        let aggregates = vec![
            aggregate("48001", 2005, 1, 0.0),
            aggregate("06037", 2005, 1, 5_000_000.0),
        ];
        let (panel, _) =
            merge_panel(aggregates, &[], &[], &[], &test_config(1980, 2022)).unwrap();
        assert_eq!(panel[0].aggregate.fips, "06037");
        assert!((panel[0].log_total_damage - 5_000_001.0_f64.ln()).abs() < 1e-3);
        assert_eq!(panel[1].log_total_damage, 0.0);
    }
}
