//! End-to-end session scenarios against real files.

use std::path::Path;

use rollcall_core::writer::read_log;
use rollcall_core::{
    CaptureError, ClassContext, CsvLog, Frame, FrameSource, IdentityManifest, MemoryLog,
    Observation, ReplayRecognizer, RosterIndex, SessionController, SessionError, SessionSettings,
    StopSignal, StudentDirectory, SyntheticFrames,
};

fn seen(label: &str, confidence: f32) -> Observation {
    Observation {
        bbox: Default::default(),
        label: label.into(),
        confidence,
    }
}

fn two_class_roster() -> RosterIndex {
    let directory = StudentDirectory::from_json(
        r#"{
            "a": {"name": "A", "rollNo": "X001", "branch": "CSE", "section": "X"},
            "b": {"name": "B", "rollNo": "Y001", "branch": "CSE", "section": "Y"}
        }"#,
    )
    .unwrap();
    RosterIndex::build(&IdentityManifest::from_labels(["a", "b"]), &directory)
}

fn every_frame() -> SessionSettings {
    SessionSettings {
        sample_every: 1,
        flush_every_ticks: 10,
        ..SessionSettings::default()
    }
}

/// Fails after yielding `good` frames.
struct DyingCamera {
    frames: SyntheticFrames,
    good: u32,
    yielded: u32,
}

impl FrameSource for DyingCamera {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if self.yielded == self.good {
            return Err(CaptureError::ReadFailed("device unplugged".into()));
        }
        self.yielded += 1;
        self.frames.next_frame()
    }
}

#[test]
fn test_one_event_per_student_and_none_for_other_class() {
    let recognizer = ReplayRecognizer::from_frames(vec![
        (1, vec![seen("a", 30.0)]),
        (2, vec![seen("a", 30.0)]),
        (3, vec![seen("b", 30.0)]),
    ]);
    let mut ctl = SessionController::new(two_class_roster(), recognizer, MemoryLog::new(), every_frame());
    ctl.start(ClassContext::new("CSE", "X")).unwrap();

    let summary = ctl.run(&mut SyntheticFrames::new(3), &StopSignal::new()).unwrap();

    let events = ctl.writer().log().events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].roll_no, "X001");
    assert_eq!(summary.present_count, 1);
    assert_eq!(summary.total_roster_count, 1);
}

#[test]
fn test_recognizer_invoked_floor_t_over_k_times() {
    for (frames, k) in [(10u32, 1u32), (10, 3), (7, 7), (6, 8), (100, 4), (0, 2)] {
        let mut ctl = SessionController::new(
            two_class_roster(),
            ReplayRecognizer::default(),
            MemoryLog::new(),
            SessionSettings {
                sample_every: k,
                ..SessionSettings::default()
            },
        );
        ctl.start(ClassContext::new("CSE", "X")).unwrap();
        let summary = ctl.run(&mut SyntheticFrames::new(frames), &StopSignal::new()).unwrap();
        assert_eq!(ctl.recognizer().calls(), (frames / k) as usize, "T={frames} K={k}");
        assert_eq!(summary.ticks, u64::from(frames / k));
        assert_eq!(summary.frames, u64::from(frames));
    }
}

#[test]
fn test_capture_failure_flushes_before_surfacing() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("attendance.csv");

    let recognizer = ReplayRecognizer::from_frames(vec![(2, vec![seen("a", 10.0)])]);
    let mut ctl = SessionController::new(
        two_class_roster(),
        recognizer,
        CsvLog::open(&log_path).unwrap(),
        SessionSettings {
            sample_every: 1,
            flush_every_ticks: 1000,
            ..SessionSettings::default()
        },
    );
    ctl.start(ClassContext::new("CSE", "X")).unwrap();

    let mut camera = DyingCamera {
        frames: SyntheticFrames::unbounded(),
        good: 5,
        yielded: 0,
    };
    let err = ctl.run(&mut camera, &StopSignal::new()).unwrap_err();
    match err {
        SessionError::Capture { source, summary } => {
            assert_eq!(source, CaptureError::ReadFailed("device unplugged".into()));
            assert_eq!(summary.present_count, 1);
            assert_eq!(summary.frames, 5);
            assert_eq!(summary.events_written, 1);
        }
        other => panic!("expected capture error, got {other:?}"),
    }

    let logged = read_log(&log_path).unwrap();
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0].name, "A");
    // A later stop returns the cached summary and writes nothing new.
    assert_eq!(ctl.stop().unwrap().present_count, 1);
    assert_eq!(read_log(&log_path).unwrap().len(), 1);
}

fn write_dataset(root: &Path, labels: &[&str]) {
    for label in labels {
        std::fs::create_dir_all(root.join("dataset").join(label)).unwrap();
    }
}

#[test]
fn test_session_from_files() {
    let dir = tempfile::tempdir().unwrap();
    write_dataset(dir.path(), &["Asha Rao", "Vikram Iyer", "Meera Das", "Walk In"]);
    let db = dir.path().join("student_database.json");
    std::fs::write(
        &db,
        r#"{
            "asha_rao": {"name": "Asha Rao", "rollNo": "CSEA001", "branch": "CSE", "section": "A"},
            "vikram_iyer": {"name": "Vikram Iyer", "rollNo": "CSEA002", "branch": "CSE", "section": "A"},
            "meera_das": {"name": "Meera Das", "rollNo": "ECEB004", "branch": "ECE", "section": "B"}
        }"#,
    )
    .unwrap();
    let script = dir.path().join("replay.jsonl");
    std::fs::write(
        &script,
        concat!(
            r#"{"sequence": 2, "detections": [{"label": "Vikram Iyer", "confidence": 48.2}, {"label": "Meera Das", "confidence": 33.0}]}"#,
            "\n",
            r#"{"sequence": 4, "detections": [{"label": "Walk In", "confidence": 12.0}, {"label": "Asha Rao", "confidence": 91.0}]}"#,
            "\n",
            r#"{"sequence": 6, "error": "blurred"}"#,
            "\n",
            r#"{"sequence": 8, "detections": [{"label": "Asha Rao", "confidence": 40.0}, {"label": "Vikram Iyer", "confidence": 20.0}]}"#,
            "\n",
        ),
    )
    .unwrap();
    let log_path = dir.path().join("logs").join("attendance.csv");

    let roster = RosterIndex::load(&dir.path().join("dataset"), &db).unwrap();
    let mut ctl = SessionController::new(
        roster,
        ReplayRecognizer::load(&script).unwrap(),
        CsvLog::open(&log_path).unwrap(),
        SessionSettings {
            sample_every: 2,
            flush_every_ticks: 2,
            ..SessionSettings::default()
        },
    );
    ctl.start(ClassContext::new("cse", "a")).unwrap();
    let summary = ctl.run(&mut SyntheticFrames::new(9), &StopSignal::new()).unwrap();

    assert_eq!(summary.present_count, 2);
    assert_eq!(summary.total_roster_count, 2);
    let names: Vec<&str> = summary.present.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["Asha Rao", "Vikram Iyer"]);

    let contents = std::fs::read_to_string(&log_path).unwrap();
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("Name,RollNo,Branch,Section,Date,Time"));
    let rows: Vec<&str> = lines.collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[0].starts_with("Vikram Iyer,CSEA002,CSE,A,"));
    assert!(rows[1].starts_with("Asha Rao,CSEA001,CSE,A,"));
}

#[test]
fn test_dropped_controller_still_persists_queue() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("attendance.csv");
    {
        let mut ctl = SessionController::new(
            two_class_roster(),
            ReplayRecognizer::from_frames(vec![(1, vec![seen("a", 10.0)])]),
            CsvLog::open(&log_path).unwrap(),
            SessionSettings {
                sample_every: 1,
                flush_every_ticks: 1000,
                ..SessionSettings::default()
            },
        );
        ctl.start(ClassContext::new("CSE", "X")).unwrap();
        ctl.process_frame(&Frame::blank(1)).unwrap();
        assert_eq!(ctl.writer().pending(), 1);
    }
    assert_eq!(read_log(&log_path).unwrap().len(), 1);
}
