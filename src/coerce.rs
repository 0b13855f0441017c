//! Best-effort numeric coercion over noisy source text.
//!
//! Source data is known to contain malformed cells; a single bad record must
//! never halt a batch run. Every coercion goes through [`CoerceStats`] so the
//! run summary can report how many cells fell back to the neutral value.

use tracing::info;

/// Run-level counter of numeric coercions and their fallbacks.
#[derive(Debug, Default, Clone, Copy)]
pub struct CoerceStats {
    pub attempts: u64,
    pub fallbacks: u64,
}

impl CoerceStats {
    /// Parse a cell as a finite float. Empty cells and the FRED `"."`
    /// sentinel are missing by convention and do not count as fallbacks;
    /// anything else that fails to parse does.
    pub fn numeric(&mut self, raw: &str) -> Option<f64> {
        let cell = raw.trim();
        if cell.is_empty() || cell == "." {
            return None;
        }
        self.attempts += 1;
        match cell.parse::<f64>() {
            Ok(value) if value.is_finite() => Some(value),
            _ => {
                self.fallbacks += 1;
                None
            }
        }
    }

    /// Like [`numeric`](Self::numeric), but missing and malformed cells both
    /// degrade to zero. Used for count fields where absence means zero.
    pub fn numeric_or_zero(&mut self, raw: &str) -> f64 {
        self.numeric(raw).unwrap_or(0.0)
    }

    /// Fold another counter into this one.
    pub fn absorb(&mut self, other: CoerceStats) {
        self.attempts += other.attempts;
        self.fallbacks += other.fallbacks;
    }

    /// Log the coercion summary for one component's run.
    pub fn report(&self, label: &str) {
        info!(
            "Coercion summary for {}: {} attempts, {} fell back to the neutral value",
            label, self.attempts, self.fallbacks
        );
        if self.fallbacks > 0 {
            println!(
                "   {} malformed numeric cells in {} degraded to the neutral value",
                self.fallbacks, label
            );
        }
    }
}

/// Round to two decimal places (currency and casualty sums).
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Round to four decimal places (index values and percent changes).
pub fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
