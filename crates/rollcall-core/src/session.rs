//! Attendance session controller.
//!
//! `Idle -> Running -> Stopping -> Stopped`. The controller samples every
//! `sample_every`th frame, classifies each detection against the roster and
//! the session's class, and queues one attendance event per student. The
//! queue is flushed every `flush_every_ticks` sampling ticks and on every
//! exit path through [`SessionController::stop`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::recognizer::{ObservationError, Recognizer};
use crate::roster::RosterIndex;
use crate::source::{CaptureError, FrameSource};
use crate::summary::{PresentStudent, SessionSummary};
use crate::types::{AttendanceEvent, ClassContext, Frame, Observation, StudentRecord};
use crate::writer::{AttendanceLog, AttendanceWriter};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("cannot {op} while session is {status}")]
    InvalidState {
        op: &'static str,
        status: SessionStatus,
    },
    #[error("capture failed: {source}")]
    Capture {
        #[source]
        source: CaptureError,
        /// Summary computed after the final flush.
        summary: Box<SessionSummary>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Idle,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Running => "running",
            SessionStatus::Stopping => "stopping",
            SessionStatus::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// How far "at most once" reaches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarkingPolicy {
    /// Once per session; repeated sessions may log a student again.
    #[default]
    Session,
    /// Once per calendar day; students already in today's log are counted
    /// present without a new event.
    Day,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Recognize every Kth frame.
    pub sample_every: u32,
    /// Flush the writer every N sampling ticks.
    pub flush_every_ticks: u32,
    /// Detections are accepted when their distance is strictly below this.
    pub acceptance_bound: f32,
    pub cooldown: Duration,
    pub marking_policy: MarkingPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sample_every: 2,
            flush_every_ticks: 10,
            acceptance_bound: 75.0,
            cooldown: Duration::from_secs(5),
            marking_policy: MarkingPolicy::Session,
        }
    }
}

impl SessionSettings {
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.sample_every == 0 {
            return Err(SessionError::Configuration(
                "sample interval must be at least 1 frame".into(),
            ));
        }
        if self.flush_every_ticks == 0 {
            return Err(SessionError::Configuration(
                "flush interval must be at least 1 tick".into(),
            ));
        }
        if !self.acceptance_bound.is_finite() {
            return Err(SessionError::Configuration(
                "acceptance bound must be a finite number".into(),
            ));
        }
        Ok(())
    }
}

/// Cooperative cancellation flag, checked once per frame.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a detection meant for this session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum Outcome {
    /// Distance failed the acceptance bound.
    Unknown,
    /// Recognized, but enrolled in another class. Advisory only.
    WrongClass {
        #[serde(rename = "enrolledClass")]
        enrolled_class: String,
    },
    AlreadyMarked,
    /// Already in today's log under [`MarkingPolicy::Day`].
    AlreadyLogged,
    NewlyMarked,
}

/// One classified detection, with everything a renderer needs to draw it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub observation: Observation,
    /// Resolved roster record; absent for `Unknown`.
    pub record: Option<StudentRecord>,
    pub outcome: Outcome,
}

/// Result of one sampling tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub tick: u64,
    pub frame_sequence: u32,
    pub classifications: Vec<Classification>,
    /// Recognition failure for this tick's region, if any.
    pub observation_error: Option<ObservationError>,
    /// Events written by this tick's periodic flush.
    pub flushed: Option<usize>,
}

impl TickReport {
    pub fn newly_marked(&self) -> impl Iterator<Item = &Classification> {
        self.classifications
            .iter()
            .filter(|c| c.outcome == Outcome::NewlyMarked)
    }
}

/// Mutable per-session state, owned by the controller alone.
#[derive(Debug)]
pub struct SessionState {
    pub session_id: Uuid,
    pub context: ClassContext,
    pub started_at: NaiveDateTime,
    /// Student key -> first label that marked the student.
    marked: HashMap<String, String>,
    last_marked: HashMap<String, Instant>,
    /// Roll numbers already in today's log (day policy only).
    logged_today: HashSet<String>,
    frames: u64,
    ticks: u64,
    flush_failures: u64,
}

impl SessionState {
    fn new(context: ClassContext, logged_today: HashSet<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            context,
            started_at: Local::now().naive_local(),
            marked: HashMap::new(),
            last_marked: HashMap::new(),
            logged_today,
            frames: 0,
            ticks: 0,
            flush_failures: 0,
        }
    }

    /// Whether the student behind `student_key` was already marked.
    pub fn is_marked(&self, student_key: &str) -> bool {
        self.marked.contains_key(student_key)
    }

    pub fn marked_count(&self) -> usize {
        self.marked.len()
    }

    fn cooling_down(&self, student_key: &str, now: Instant, cooldown: Duration) -> bool {
        self.last_marked
            .get(student_key)
            .is_some_and(|at| now.duration_since(*at) < cooldown)
    }

    fn mark(&mut self, record: &StudentRecord, now: Instant) {
        let key = record.student_key().to_string();
        self.last_marked.insert(key.clone(), now);
        self.marked.insert(key, record.label.clone());
    }
}

/// Point-in-time view of a session, for status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProgress {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub class: Option<ClassContext>,
    pub class_size: usize,
    pub present_count: usize,
    pub frames: u64,
    pub ticks: u64,
    pub pending_events: usize,
    pub flush_failures: u64,
}

pub struct SessionController<R: Recognizer, L: AttendanceLog> {
    roster: RosterIndex,
    recognizer: R,
    writer: AttendanceWriter<L>,
    settings: SessionSettings,
    status: SessionStatus,
    state: Option<SessionState>,
    summary: Option<SessionSummary>,
}

impl<R: Recognizer, L: AttendanceLog> SessionController<R, L> {
    pub fn new(roster: RosterIndex, recognizer: R, log: L, settings: SessionSettings) -> Self {
        Self {
            roster,
            recognizer,
            writer: AttendanceWriter::new(log),
            settings,
            status: SessionStatus::Idle,
            state: None,
            summary: None,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn state(&self) -> Option<&SessionState> {
        self.state.as_ref()
    }

    pub fn roster(&self) -> &RosterIndex {
        &self.roster
    }

    pub fn writer(&self) -> &AttendanceWriter<L> {
        &self.writer
    }

    pub fn recognizer(&self) -> &R {
        &self.recognizer
    }

    pub fn progress(&self) -> SessionProgress {
        let state = self.state.as_ref();
        SessionProgress {
            status: self.status,
            session_id: state.map(|s| s.session_id.to_string()),
            class: state.map(|s| s.context.clone()),
            class_size: state.map_or(0, |s| self.roster.class_member_count(&s.context)),
            present_count: state.map_or(0, SessionState::marked_count),
            frames: state.map_or(0, |s| s.frames),
            ticks: state.map_or(0, |s| s.ticks),
            pending_events: self.writer.pending(),
            flush_failures: state.map_or(0, |s| s.flush_failures),
        }
    }

    /// Begin a session for `context`. Fails without leaving `Idle` when the
    /// settings are invalid, the recognizer is not ready, or the class is empty.
    pub fn start(&mut self, context: ClassContext) -> Result<(), SessionError> {
        if self.status != SessionStatus::Idle {
            return Err(SessionError::InvalidState {
                op: "start",
                status: self.status,
            });
        }
        self.settings.validate()?;
        self.recognizer
            .check_ready()
            .map_err(|e| SessionError::Configuration(e.to_string()))?;

        let class_size = self.roster.class_member_count(&context);
        if class_size == 0 {
            return Err(SessionError::Configuration(format!(
                "no enrolled students in class {context}"
            )));
        }

        let logged_today = match self.settings.marking_policy {
            MarkingPolicy::Session => HashSet::new(),
            MarkingPolicy::Day => self.logged_today(),
        };

        let state = SessionState::new(context, logged_today);
        tracing::info!(
            session = %state.session_id,
            class = %state.context,
            class_size,
            sample_every = self.settings.sample_every,
            flush_every_ticks = self.settings.flush_every_ticks,
            policy = ?self.settings.marking_policy,
            "attendance session started"
        );
        self.state = Some(state);
        self.status = SessionStatus::Running;
        Ok(())
    }

    fn logged_today(&self) -> HashSet<String> {
        let today = Local::now().date_naive();
        match self.writer.log().history() {
            Ok(events) => events
                .into_iter()
                .filter(|e| e.date == today && e.roll_no != crate::types::UNKNOWN_ROLL_NO)
                .map(|e| e.roll_no)
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read attendance log; day policy starts empty");
                HashSet::new()
            }
        }
    }

    /// Advance one frame. Returns a report on sampling ticks, `None` otherwise.
    pub fn process_frame(&mut self, frame: &Frame) -> Result<Option<TickReport>, SessionError> {
        if self.status != SessionStatus::Running {
            return Err(SessionError::InvalidState {
                op: "process a frame",
                status: self.status,
            });
        }
        Ok(self.advance(frame))
    }

    fn advance(&mut self, frame: &Frame) -> Option<TickReport> {
        let sample_every = u64::from(self.settings.sample_every);
        let tick = {
            let state = self.state.as_mut()?;
            state.frames += 1;
            if state.frames % sample_every != 0 {
                return None;
            }
            state.ticks += 1;
            state.ticks
        };

        let (observations, observation_error) = match self.recognizer.observe(frame) {
            Ok(observations) => (observations, None),
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "recognition failed; dropping region");
                (Vec::new(), Some(e))
            }
        };

        let classifications = observations
            .into_iter()
            .filter_map(|obs| self.classify(obs))
            .collect::<Vec<_>>();
        tracing::debug!(tick, detections = classifications.len(), "sampling tick");

        let flushed = if tick % u64::from(self.settings.flush_every_ticks) == 0 {
            self.periodic_flush()
        } else {
            None
        };

        Some(TickReport {
            tick,
            frame_sequence: frame.sequence,
            classifications,
            observation_error,
            flushed,
        })
    }

    fn classify(&mut self, observation: Observation) -> Option<Classification> {
        let state = self.state.as_mut()?;

        // NaN distances fail the comparison and land here too.
        if !(observation.confidence < self.settings.acceptance_bound) {
            return Some(Classification {
                observation,
                record: None,
                outcome: Outcome::Unknown,
            });
        }

        let record = self.roster.lookup(&observation.label).into_owned();
        let label = observation.label.as_str();
        let student = record.student_key();
        let now = Instant::now();

        let outcome = if !state.context.contains(&record) {
            tracing::debug!(label, enrolled = %record.class_name(), "detected student from another class");
            Outcome::WrongClass {
                enrolled_class: record.class_name(),
            }
        } else if state.is_marked(student) || state.cooling_down(student, now, self.settings.cooldown) {
            Outcome::AlreadyMarked
        } else if state.logged_today.contains(&record.roll_no) {
            state.mark(&record, now);
            tracing::info!(label, roll_no = %record.roll_no, "already logged today; counted present");
            Outcome::AlreadyLogged
        } else {
            let event = AttendanceEvent::new(&record, &state.context, Local::now().naive_local());
            tracing::info!(
                name = %event.name,
                roll_no = %event.roll_no,
                class = %state.context,
                time = %event.time,
                "marked present"
            );
            self.writer.enqueue(event);
            state.mark(&record, now);
            Outcome::NewlyMarked
        };

        Some(Classification {
            observation,
            record: Some(record),
            outcome,
        })
    }

    fn periodic_flush(&mut self) -> Option<usize> {
        match self.writer.flush() {
            Ok(0) => None,
            Ok(count) => Some(count),
            Err(e) => {
                let pending = self.writer.pending();
                if let Some(state) = self.state.as_mut() {
                    state.flush_failures += 1;
                }
                tracing::warn!(error = %e, pending, "attendance flush failed; events kept for next flush");
                None
            }
        }
    }

    /// Stop the session: final flush, then the summary. Calling again after
    /// the session stopped returns the same summary without flushing.
    pub fn stop(&mut self) -> Result<SessionSummary, SessionError> {
        match self.status {
            SessionStatus::Running => {}
            SessionStatus::Stopping | SessionStatus::Stopped => {
                return self.summary.clone().ok_or(SessionError::InvalidState {
                    op: "stop",
                    status: self.status,
                });
            }
            SessionStatus::Idle => {
                return Err(SessionError::InvalidState {
                    op: "stop",
                    status: self.status,
                })
            }
        }

        self.status = SessionStatus::Stopping;
        let unflushed_events = match self.writer.flush() {
            Ok(_) => 0,
            Err(e) => {
                let pending = self.writer.pending();
                tracing::error!(error = %e, pending, "final attendance flush failed");
                pending
            }
        };

        let Some(state) = self.state.as_ref() else {
            return Err(SessionError::InvalidState {
                op: "summarize",
                status: self.status,
            });
        };
        let summary = self.summarize(state, unflushed_events);
        tracing::info!(
            session = %summary.session_id,
            class = %summary.class,
            present = summary.present_count,
            total = summary.total_roster_count,
            written = summary.events_written,
            "attendance session stopped"
        );
        self.summary = Some(summary.clone());
        self.status = SessionStatus::Stopped;
        Ok(summary)
    }

    fn summarize(&self, state: &SessionState, unflushed_events: usize) -> SessionSummary {
        let ended_at = Local::now().naive_local();
        let mut present: Vec<PresentStudent> = state
            .marked
            .values()
            .map(|label| {
                let record = self.roster.lookup(label);
                PresentStudent {
                    name: record.name.clone(),
                    roll_no: record.roll_no.clone(),
                }
            })
            .collect();
        present.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.roll_no.cmp(&b.roll_no)));

        SessionSummary {
            session_id: state.session_id.to_string(),
            class: state.context.clone(),
            total_roster_count: self.roster.class_member_count(&state.context),
            present_count: state.marked.len(),
            present,
            started_at: state.started_at,
            ended_at,
            frames: state.frames,
            ticks: state.ticks,
            events_written: self.writer.written(),
            unflushed_events,
        }
    }

    /// Run until the source ends or `stop` is raised. See [`Self::run_with`].
    pub fn run<S: FrameSource>(
        &mut self,
        source: &mut S,
        stop: &StopSignal,
    ) -> Result<SessionSummary, SessionError> {
        self.run_with(source, |_, _| {
            if stop.is_raised() {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    /// Drive the session from `source`, calling `hook` after every frame with
    /// the tick report (on sampling ticks). The hook breaks the loop to stop.
    ///
    /// Every exit goes through [`Self::stop`]. A capture failure returns
    /// [`SessionError::Capture`] carrying the summary taken after the final flush.
    pub fn run_with<S, F>(&mut self, source: &mut S, mut hook: F) -> Result<SessionSummary, SessionError>
    where
        S: FrameSource,
        F: FnMut(&Self, Option<&TickReport>) -> ControlFlow<()>,
    {
        if self.status != SessionStatus::Running {
            return Err(SessionError::InvalidState {
                op: "run",
                status: self.status,
            });
        }

        let failure = loop {
            if hook(&*self, None).is_break() {
                tracing::info!("stop requested");
                break None;
            }
            match source.next_frame() {
                Ok(Some(frame)) => {
                    let report = self.advance(&frame);
                    if let Some(report) = report.as_ref() {
                        if hook(&*self, Some(report)).is_break() {
                            tracing::info!("stop requested");
                            break None;
                        }
                    }
                }
                Ok(None) => {
                    tracing::info!("frame source exhausted");
                    break None;
                }
                Err(e) => {
                    tracing::error!(error = %e, "frame capture failed; stopping session");
                    break Some(e);
                }
            }
        };

        let summary = self.stop()?;
        match failure {
            Some(source) => Err(SessionError::Capture {
                source,
                summary: Box::new(summary),
            }),
            None => Ok(summary),
        }
    }
}
