//! End-of-session report.

use std::fmt;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::types::ClassContext;

/// A student counted present, as shown in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PresentStudent {
    pub name: String,
    pub roll_no: String,
}

/// Computed once when a session stops, from the live marked set.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub class: ClassContext,
    pub total_roster_count: usize,
    pub present_count: usize,
    /// Sorted by name, then roll number.
    pub present: Vec<PresentStudent>,
    pub started_at: NaiveDateTime,
    pub ended_at: NaiveDateTime,
    pub frames: u64,
    pub ticks: u64,
    pub events_written: usize,
    /// Events the final flush could not persist.
    pub unflushed_events: usize,
}

impl SessionSummary {
    pub fn absent_count(&self) -> usize {
        self.total_roster_count.saturating_sub(self.present_count)
    }
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Class: {}", self.class)?;
        writeln!(
            f,
            "Present: {} of {} ({} absent)",
            self.present_count,
            self.total_roster_count,
            self.absent_count()
        )?;
        writeln!(
            f,
            "Session: {} to {}",
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.ended_at.format("%H:%M:%S")
        )?;
        if self.present.is_empty() {
            writeln!(f, "No students marked present")?;
        } else {
            for (i, student) in self.present.iter().enumerate() {
                writeln!(f, "  {}. {} ({})", i + 1, student.name, student.roll_no)?;
            }
        }
        if self.unflushed_events > 0 {
            writeln!(
                f,
                "WARNING: {} attendance event(s) could not be written",
                self.unflushed_events
            )?;
        }
        Ok(())
    }
}
