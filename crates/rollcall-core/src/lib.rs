//! rollcall-core: Attendance sessions driven by face recognition.
//!
//! Resolves recognizer identity labels against a roster snapshot, marks each
//! student of the session's class at most once, and appends the resulting
//! events to a CSV attendance log.

pub mod recognizer;
pub mod roster;
pub mod session;
pub mod source;
pub mod summary;
pub mod types;
pub mod writer;

pub use recognizer::{ObservationError, Recognizer, ReplayRecognizer};
pub use roster::{IdentityManifest, RosterError, RosterIndex, StudentDirectory};
pub use session::{
    Classification, MarkingPolicy, Outcome, SessionController, SessionError, SessionProgress,
    SessionSettings, SessionStatus, StopSignal, TickReport,
};
pub use source::{CaptureError, FrameSource, SyntheticFrames};
pub use summary::{PresentStudent, SessionSummary};
pub use types::{AttendanceEvent, BoundingBox, ClassContext, Frame, Observation, StudentRecord};
pub use writer::{AttendanceLog, AttendanceWriter, CsvLog, MemoryLog, PersistenceError};
