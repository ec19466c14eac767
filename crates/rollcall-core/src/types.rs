use std::collections::BTreeMap;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

/// Roll number, branch, and section given to identities the roster cannot resolve.
pub const UNKNOWN_ROLL_NO: &str = "N/A";
pub const UNKNOWN_CLASS: &str = "UNKNOWN";

/// Bounding box for a detected face, in frame pixel coordinates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// A captured grayscale frame handed to the recognizer.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes). Empty for synthetic frames.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub sequence: u32,
    pub timestamp: std::time::Instant,
}

impl Frame {
    /// A frame with no pixel data, used by synthetic sources and tests.
    pub fn blank(sequence: u32) -> Self {
        Self {
            data: Vec::new(),
            width: 0,
            height: 0,
            sequence,
            timestamp: std::time::Instant::now(),
        }
    }
}

/// One detection returned by the recognizer for a frame region.
///
/// `confidence` is a distance: lower means a stronger match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub bbox: BoundingBox,
    pub label: String,
    pub confidence: f32,
}

/// A student as known to the roster for the duration of one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    /// Identity label the recognizer reports for this student.
    pub label: String,
    pub name: String,
    pub roll_no: String,
    pub branch: String,
    pub section: String,
    /// Enrollment fields the core does not interpret (registration date, image count, ...).
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl StudentRecord {
    /// Placeholder bound to labels that match no student in the directory.
    pub fn unknown(label: &str) -> Self {
        Self {
            label: label.to_string(),
            name: label.to_string(),
            roll_no: UNKNOWN_ROLL_NO.to_string(),
            branch: UNKNOWN_CLASS.to_string(),
            section: UNKNOWN_CLASS.to_string(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.roll_no == UNKNOWN_ROLL_NO && self.branch == UNKNOWN_CLASS
    }

    /// Who this record stands for: the roll number, or the label while
    /// no roll number is assigned. Several labels may share one student.
    pub fn student_key(&self) -> &str {
        if self.roll_no == UNKNOWN_ROLL_NO {
            &self.label
        } else {
            &self.roll_no
        }
    }

    pub fn class_name(&self) -> String {
        format!("{}-{}", self.branch, self.section)
    }
}

/// The branch and section an attendance session is taken for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClassContext {
    pub branch: String,
    pub section: String,
}

impl ClassContext {
    /// Normalizes both parts to trimmed upper case.
    pub fn new(branch: &str, section: &str) -> Self {
        Self {
            branch: branch.trim().to_uppercase(),
            section: section.trim().to_uppercase(),
        }
    }

    /// Placeholder records belong to no class.
    pub fn contains(&self, record: &StudentRecord) -> bool {
        !record.is_unknown() && self.matches(&record.branch, &record.section)
    }

    pub fn matches(&self, branch: &str, section: &str) -> bool {
        self.branch.eq_ignore_ascii_case(branch.trim())
            && self.section.eq_ignore_ascii_case(section.trim())
    }
}

impl fmt::Display for ClassContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.branch, self.section)
    }
}

/// One row of the durable attendance log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "RollNo")]
    pub roll_no: String,
    #[serde(rename = "Branch")]
    pub branch: String,
    #[serde(rename = "Section")]
    pub section: String,
    #[serde(rename = "Date")]
    pub date: NaiveDate,
    #[serde(rename = "Time")]
    pub time: NaiveTime,
}

impl AttendanceEvent {
    /// Build the log row for `record` marked at `at`, truncated to whole seconds.
    pub fn new(record: &StudentRecord, context: &ClassContext, at: NaiveDateTime) -> Self {
        let time = at.time();
        Self {
            name: record.name.clone(),
            roll_no: record.roll_no.clone(),
            branch: context.branch.clone(),
            section: context.section.clone(),
            date: at.date(),
            time: time.with_nanosecond(0).unwrap_or(time),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(branch: &str, section: &str) -> StudentRecord {
        StudentRecord {
            label: "Asha Rao".into(),
            name: "Asha Rao".into(),
            roll_no: "CSEA001".into(),
            branch: branch.into(),
            section: section.into(),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_class_context_normalizes() {
        let ctx = ClassContext::new(" cse ", "a");
        assert_eq!(ctx.branch, "CSE");
        assert_eq!(ctx.section, "A");
        assert_eq!(ctx.to_string(), "CSE-A");
    }

    #[test]
    fn test_class_context_contains_ignores_case() {
        let ctx = ClassContext::new("CSE", "A");
        assert!(ctx.contains(&record("cse", "a")));
        assert!(!ctx.contains(&record("CSE", "B")));
        assert!(!ctx.contains(&record("ECE", "A")));
    }

    #[test]
    fn test_unknown_placeholder() {
        let rec = StudentRecord::unknown("Stranger");
        assert!(rec.is_unknown());
        assert_eq!(rec.roll_no, "N/A");
        assert_eq!(rec.branch, "UNKNOWN");
        assert_eq!(rec.section, "UNKNOWN");
        assert_eq!(rec.name, "Stranger");
    }

    #[test]
    fn test_event_truncates_subsecond_time() {
        let at = NaiveDate::from_ymd_opt(2026, 3, 2)
            .unwrap()
            .and_hms_milli_opt(9, 15, 2, 640)
            .unwrap();
        let ctx = ClassContext::new("CSE", "A");
        let event = AttendanceEvent::new(&record("CSE", "A"), &ctx, at);
        assert_eq!(event.time.to_string(), "09:15:02");
        assert_eq!(event.date.to_string(), "2026-03-02");
        assert_eq!(event.branch, "CSE");
    }
}
