pub mod coerce;
pub mod config;
pub mod constants;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod panel;
pub mod sources;
