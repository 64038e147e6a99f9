use log::info;
use serde::{Deserialize, Serialize};

/// Meter totals captured at the start of a day.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DailyTotals {
    /// Zero-based day of the year the checkpoint belongs to.
    pub day: u16,
    #[serde(rename = "import")]
    pub import_kwh: f64,
    #[serde(rename = "export")]
    pub export_kwh: f64,
}

#[derive(Debug, Clone, Default)]
pub struct DailyTotalsTracker {
    checkpoint: Option<DailyTotals>,
}

impl DailyTotalsTracker {
    pub fn new(checkpoint: Option<DailyTotals>) -> Self {
        Self { checkpoint }
    }

    pub fn checkpoint(&self) -> Option<DailyTotals> {
        self.checkpoint
    }

    /// Feeds the current meter totals. Returns a new checkpoint to persist on the
    /// first observation and whenever the day changes.
    pub fn observe(
        &mut self,
        day_of_year: u16,
        total_import_kwh: f64,
        total_export_kwh: f64,
    ) -> Option<DailyTotals> {
        // The meter reports zero totals until its first successful read.
        if total_import_kwh <= 0.0 && total_export_kwh <= 0.0 {
            return None;
        }
        if self
            .checkpoint
            .is_some_and(|checkpoint| checkpoint.day == day_of_year)
        {
            return None;
        }

        let checkpoint = DailyTotals {
            day: day_of_year,
            import_kwh: total_import_kwh,
            export_kwh: total_export_kwh,
        };
        info!(
            "day {day_of_year} totals checkpoint: import {total_import_kwh:.3} kWh, export {total_export_kwh:.3} kWh"
        );
        self.checkpoint = Some(checkpoint);
        Some(checkpoint)
    }

    /// Usage since the checkpoint as `(import, export)` kWh.
    pub fn today(&self, total_import_kwh: f64, total_export_kwh: f64) -> (f64, f64) {
        match self.checkpoint {
            Some(checkpoint) => (
                (total_import_kwh - checkpoint.import_kwh).max(0.0),
                (total_export_kwh - checkpoint.export_kwh).max(0.0),
            ),
            None => (0.0, 0.0),
        }
    }
}
