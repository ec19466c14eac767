//! The recognition seam and a scripted implementation for dry runs.
//!
//! The face matcher itself lives outside this crate. Anything that can turn a
//! frame region into `(box, label, distance)` tuples can drive a session.

use std::collections::HashMap;
use std::io::BufRead;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::types::{Frame, Observation};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ObservationError {
    #[error("recognition engine unavailable: {0}")]
    Unavailable(String),
    #[error("recognition failed: {0}")]
    Failed(String),
}

/// A face recognition capability.
///
/// `observe` returns an empty list when no face is present; that is never an error.
pub trait Recognizer {
    fn observe(&mut self, region: &Frame) -> Result<Vec<Observation>, ObservationError>;

    /// Fails when the engine is missing or untrained.
    fn check_ready(&self) -> Result<(), ObservationError> {
        Ok(())
    }
}

impl<R: Recognizer + ?Sized> Recognizer for &mut R {
    fn observe(&mut self, region: &Frame) -> Result<Vec<Observation>, ObservationError> {
        (**self).observe(region)
    }

    fn check_ready(&self) -> Result<(), ObservationError> {
        (**self).check_ready()
    }
}

impl<R: Recognizer + ?Sized> Recognizer for Box<R> {
    fn observe(&mut self, region: &Frame) -> Result<Vec<Observation>, ObservationError> {
        (**self).observe(region)
    }

    fn check_ready(&self) -> Result<(), ObservationError> {
        (**self).check_ready()
    }
}

/// One line of a replay script.
#[derive(Debug, Clone, Deserialize)]
struct ReplayLine {
    sequence: u32,
    #[serde(default)]
    detections: Vec<Observation>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
enum ReplayOutcome {
    Detections(Vec<Observation>),
    Failure(String),
}

/// Replays recorded detections keyed by frame sequence number.
///
/// Script format is JSON lines:
/// `{"sequence": 4, "detections": [{"bbox": {...}, "label": "Asha Rao", "confidence": 41.5}]}`
/// or `{"sequence": 6, "error": "..."}`. Blank lines and `#` comments are skipped.
/// Sequences absent from the script observe no faces.
#[derive(Debug, Clone, Default)]
pub struct ReplayRecognizer {
    script: HashMap<u32, ReplayOutcome>,
    calls: usize,
}

impl ReplayRecognizer {
    pub fn load(path: &Path) -> Result<Self, ObservationError> {
        let file = std::fs::File::open(path).map_err(|e| {
            ObservationError::Unavailable(format!("replay script {}: {e}", path.display()))
        })?;
        let recognizer = Self::from_reader(std::io::BufReader::new(file))?;
        tracing::info!(
            path = %path.display(),
            frames = recognizer.script.len(),
            "replay script loaded"
        );
        Ok(recognizer)
    }

    pub fn from_reader<B: BufRead>(reader: B) -> Result<Self, ObservationError> {
        let mut script = HashMap::new();
        for (idx, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| ObservationError::Unavailable(e.to_string()))?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parsed: ReplayLine = serde_json::from_str(trimmed).map_err(|e| {
                ObservationError::Unavailable(format!("replay script line {}: {e}", idx + 1))
            })?;
            let outcome = match parsed.error {
                Some(msg) => ReplayOutcome::Failure(msg),
                None => ReplayOutcome::Detections(parsed.detections),
            };
            script.insert(parsed.sequence, outcome);
        }
        Ok(Self { script, calls: 0 })
    }

    /// Script with the same detections on every listed sequence.
    pub fn from_frames<I>(frames: I) -> Self
    where
        I: IntoIterator<Item = (u32, Vec<Observation>)>,
    {
        Self {
            script: frames
                .into_iter()
                .map(|(seq, dets)| (seq, ReplayOutcome::Detections(dets)))
                .collect(),
            calls: 0,
        }
    }

    /// Number of times `observe` has been invoked.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Recognizer for ReplayRecognizer {
    fn observe(&mut self, region: &Frame) -> Result<Vec<Observation>, ObservationError> {
        self.calls += 1;
        match self.script.get(&region.sequence) {
            Some(ReplayOutcome::Detections(dets)) => Ok(dets.clone()),
            Some(ReplayOutcome::Failure(msg)) => Err(ObservationError::Failed(msg.clone())),
            None => Ok(Vec::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCRIPT: &str = r#"
# recorded 2026-03-02, CSE-A
{"sequence": 2, "detections": [{"bbox": {"x": 10, "y": 20, "width": 120, "height": 120}, "label": "Asha Rao", "confidence": 41.5}]}
{"sequence": 4, "error": "region decode failed"}

{"sequence": 6, "detections": []}
"#;

    #[test]
    fn test_replay_parses_script() {
        let mut rec = ReplayRecognizer::from_reader(SCRIPT.as_bytes()).unwrap();

        let dets = rec.observe(&Frame::blank(2)).unwrap();
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].label, "Asha Rao");
        assert!((dets[0].confidence - 41.5).abs() < 1e-6);
        assert!((dets[0].bbox.width - 120.0).abs() < 1e-6);

        let err = rec.observe(&Frame::blank(4)).unwrap_err();
        assert_eq!(err, ObservationError::Failed("region decode failed".into()));

        assert!(rec.observe(&Frame::blank(6)).unwrap().is_empty());
        assert!(rec.observe(&Frame::blank(99)).unwrap().is_empty());
        assert_eq!(rec.calls(), 4);
    }

    #[test]
    fn test_replay_reports_bad_line() {
        let err = ReplayRecognizer::from_reader("{\"sequence\": 1}\nnot json\n".as_bytes())
            .unwrap_err();
        match err {
            ObservationError::Unavailable(msg) => assert!(msg.contains("line 2"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_replay_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let err = ReplayRecognizer::load(&dir.path().join("missing.jsonl")).unwrap_err();
        assert!(matches!(err, ObservationError::Unavailable(_)));
    }
}
