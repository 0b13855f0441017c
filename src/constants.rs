/// Source name constants to ensure consistency across the codebase.
/// These names are used as CLI arguments, log labels, and file-name stems.

pub const STORM_EVENTS_SOURCE: &str = "storm_events";
pub const SHILLER_SOURCE: &str = "shiller";
pub const FRED_SOURCE: &str = "fred";

/// Get all supported source names, in pipeline order
pub fn supported_sources() -> Vec<&'static str> {
    vec![STORM_EVENTS_SOURCE, SHILLER_SOURCE, FRED_SOURCE]
}

/// NOAA Storm Events bulk CSV directory (public, no key required)
pub const NOAA_BASE_URL: &str = "https://www.ncei.noaa.gov/pub/data/swdi/stormevents/csvfiles/";

/// Shiller home-price workbook, exported as a delimited sheet.
/// Primary is Yale, the mirror is shillerdata.com.
pub const SHILLER_URL: &str = "http://www.econ.yale.edu/~shiller/data/Fig3-1.csv";
pub const SHILLER_URL_ALT: &str = "https://shillerdata.com/wp-content/uploads/Fig3-1.csv";

/// FRED series observations endpoint
pub const FRED_API_BASE: &str = "https://api.stlouisfed.org/fred/series/observations";

// Layout contract for the Shiller sheet (Fig 3.1 vintage). The sheet has no
// labels on its data columns and interleaves several unrelated series, so
// extraction is by fixed position. Any change here must be paired with a
// re-check of the header-row probe in `sources::shiller`.
pub const SHILLER_DATE_COL: usize = 0;
pub const SHILLER_NOMINAL_COL: usize = 1;
pub const SHILLER_CPI_COL: usize = 14;

/// Header-row offsets to probe, most likely first
pub const SHILLER_HEADER_CANDIDATES: [usize; 5] = [7, 6, 8, 5, 0];
