use crate::error::{PipelineError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Pipeline configuration, loaded from `config.toml` when present.
///
/// One `Config` value is passed into every component so that all stages agree
/// on where raw/processed/final artifacts live; nothing reads path constants
/// from process-wide state.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub paths: Paths,
    pub panel: PanelConfig,
    pub storm_events: StormEventsConfig,
    pub shiller: ShillerConfig,
    pub fred: FredConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub raw_dir: PathBuf,
    pub processed_dir: PathBuf,
    pub final_dir: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            raw_dir: PathBuf::from("data/raw"),
            processed_dir: PathBuf::from("data/processed"),
            final_dir: PathBuf::from("data/final"),
        }
    }
}

impl Paths {
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.raw_dir)?;
        fs::create_dir_all(&self.processed_dir)?;
        fs::create_dir_all(&self.final_dir)?;
        Ok(())
    }

    pub fn raw_file(&self, name: &str) -> PathBuf {
        self.raw_dir.join(name)
    }

    pub fn processed_file(&self, name: &str) -> PathBuf {
        self.processed_dir.join(name)
    }

    pub fn final_file(&self, name: &str) -> PathBuf {
        self.final_dir.join(name)
    }
}

/// Final panel window and derived-field settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PanelConfig {
    /// Inclusive lower bound on panel years
    pub year_min: i32,
    /// Inclusive upper bound on panel years
    pub year_max: i32,
    /// Inclusive upper event-count bounds for the low/moderate/high
    /// intensity buckets; counts above the last bound are very_high.
    pub intensity_breaks: [u32; 3],
}

impl Default for PanelConfig {
    fn default() -> Self {
        Self {
            year_min: 1980,
            year_max: 2022,
            intensity_breaks: [2, 5, 10],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StormEventsConfig {
    /// First NOAA year file to download
    pub start_year: i32,
    /// Last NOAA year file to download
    pub end_year: i32,
}

impl Default for StormEventsConfig {
    fn default() -> Self {
        Self {
            start_year: 1960,
            end_year: 2024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ShillerConfig {
    /// Year whose deflator value rescales the real index, so that
    /// real == nominal in this year
    pub reference_year: i32,
    /// Monthly rows outside this inclusive window are dropped before
    /// annual averaging
    pub year_min: i32,
    pub year_max: i32,
}

impl Default for ShillerConfig {
    fn default() -> Self {
        Self {
            reference_year: 2000,
            year_min: 1960,
            year_max: 2024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FredConfig {
    /// Earliest observation date requested from the API
    pub observation_start: String,
    /// Series to download, in output-column order
    pub series: Vec<FredSeries>,
    /// Output columns (not series ids) that additionally get a
    /// year-over-year percent-change column. Index-type series only;
    /// rate-type series are left as-is.
    pub yoy_columns: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FredSeries {
    /// FRED series id, e.g. `MORTGAGE30US`
    pub id: String,
    /// Output column name, e.g. `mortgage_rate_30yr`
    pub column: String,
}

impl Default for FredConfig {
    fn default() -> Self {
        let series = [
            ("MORTGAGE30US", "mortgage_rate_30yr"),
            ("UNRATE", "unemployment_rate"),
            ("CPIAUCSL", "cpi_all_items"),
            ("FEDFUNDS", "fed_funds_rate"),
            ("GS10", "treasury_10yr"),
            ("CSUSHPISA", "case_shiller_national"),
        ]
        .into_iter()
        .map(|(id, column)| FredSeries {
            id: id.to_string(),
            column: column.to_string(),
        })
        .collect();

        Self {
            observation_start: "1960-01-01".to_string(),
            series,
            yoy_columns: vec![
                "case_shiller_national".to_string(),
                "cpi_all_items".to_string(),
            ],
        }
    }
}

impl Config {
    /// Load `config.toml` from the working directory, falling back to the
    /// built-in defaults when the file does not exist.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("config.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!(
                "Failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.panel.year_min > self.panel.year_max {
            return Err(PipelineError::Config(format!(
                "panel.year_min ({}) must not exceed panel.year_max ({})",
                self.panel.year_min, self.panel.year_max
            )));
        }
        let breaks = &self.panel.intensity_breaks;
        if !(breaks[0] < breaks[1] && breaks[1] < breaks[2]) {
            return Err(PipelineError::Config(format!(
                "panel.intensity_breaks must be strictly increasing, got {breaks:?}"
            )));
        }
        if self.fred.series.is_empty() {
            return Err(PipelineError::Config(
                "fred.series must name at least one series".to_string(),
            ));
        }
        for column in &self.fred.yoy_columns {
            if !self.fred.series.iter().any(|s| &s.column == column) {
                return Err(PipelineError::Config(format!(
                    "fred.yoy_columns entry '{column}' does not match any configured series column"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from(Path::new("does/not/exist.toml")).unwrap();
        assert_eq!(config.panel.year_min, 1980);
        assert_eq!(config.panel.year_max, 2022);
        assert_eq!(config.shiller.reference_year, 2000);
        assert_eq!(config.fred.series.len(), 6);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(file, "[panel]\nyear_min = 1990").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.panel.year_min, 1990);
        assert_eq!(config.panel.year_max, 2022);
    }

    #[test]
    fn inverted_year_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[panel]\nyear_min = 2030\nyear_max = 2000\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[test]
    fn unknown_yoy_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[fred]\nyoy_columns = [\"not_a_series\"]\n").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }
}
