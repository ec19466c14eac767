use std::ops::ControlFlow;
use std::time::{Duration, Instant};

use rollcall_core::{
    CaptureError, ClassContext, CsvLog, Frame, FrameSource, ObservationError, Recognizer,
    ReplayRecognizer, RosterIndex, SessionController, SessionError, SessionProgress,
    SessionStatus, SessionSummary, SyntheticFrames,
};
use rollcall_hw::Camera;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] rollcall_hw::CameraError),
    #[error("roster error: {0}")]
    Roster(#[from] rollcall_core::RosterError),
    #[error("attendance log error: {0}")]
    Persistence(#[from] rollcall_core::PersistenceError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("a session is already running")]
    AlreadyRunning,
    #[error("no session has run yet")]
    NotRunning,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Reply to a successful start.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartedSession {
    pub session_id: String,
    pub class: ClassContext,
    pub class_size: usize,
}

/// Engine state reported to status queries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub session: SessionProgress,
    pub source: String,
    pub recognizer_ready: bool,
    pub last_summary: Option<SessionSummary>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Start {
        context: ClassContext,
        reply: oneshot::Sender<Result<StartedSession, EngineError>>,
    },
    Stop {
        reply: oneshot::Sender<Result<SessionSummary, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Start a session for `context`; returns once the session is running.
    pub async fn start(&self, context: ClassContext) -> Result<StartedSession, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Start {
                context,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Stop the running session after its final flush. When idle, returns
    /// the summary of the last session.
    pub async fn stop(&self) -> Result<SessionSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Stop { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Stands in when no recognition backend is configured; sessions refuse to start.
struct Unavailable(String);

impl Recognizer for Unavailable {
    fn observe(&mut self, _frame: &Frame) -> Result<Vec<rollcall_core::Observation>, ObservationError> {
        Err(ObservationError::Unavailable(self.0.clone()))
    }

    fn check_ready(&self) -> Result<(), ObservationError> {
        Err(ObservationError::Unavailable(self.0.clone()))
    }
}

fn load_recognizer(config: &Config) -> Box<dyn Recognizer + Send> {
    let Some(path) = config.replay_script.as_ref() else {
        tracing::warn!("no recognition backend configured; sessions will not start");
        return Box::new(Unavailable("no recognition backend configured".into()));
    };
    match ReplayRecognizer::load(path) {
        Ok(replay) => {
            tracing::info!(path = %path.display(), "replay recognizer loaded");
            Box::new(replay)
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "replay script unusable");
            Box::new(Unavailable(e.to_string()))
        }
    }
}

/// Blank frames at a fixed rate.
struct Paced {
    frames: SyntheticFrames,
    interval: Duration,
    next_at: Instant,
}

impl FrameSource for Paced {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        let now = Instant::now();
        if self.next_at > now {
            std::thread::sleep(self.next_at - now);
        }
        self.next_at = Instant::now() + self.interval;
        self.frames.next_frame()
    }
}

enum FrameInput {
    Camera(Camera),
    Synthetic(Duration),
}

impl FrameInput {
    fn open(config: &Config) -> Result<Self, EngineError> {
        if config.synthetic_frames {
            tracing::info!(fps = config.target_fps, "using synthetic frames");
            return Ok(Self::Synthetic(config.frame_interval()));
        }
        let camera = Camera::open(&config.camera_device, config.camera_width, config.camera_height)
            .inspect_err(|_| {
                for dev in Camera::list_devices() {
                    tracing::info!(
                        path = %dev.path,
                        name = %dev.name,
                        driver = %dev.driver,
                        bus = %dev.bus,
                        "available capture device"
                    );
                }
            })?;
        tracing::info!(
            device = %config.camera_device,
            width = camera.width,
            height = camera.height,
            fourcc = ?camera.fourcc,
            "camera opened"
        );
        Ok(Self::Camera(camera))
    }

    fn end_session(&mut self) {
        if let Self::Camera(camera) = self {
            camera.release();
        }
    }

    fn describe(&self) -> String {
        match self {
            Self::Camera(camera) => camera.device_path.clone(),
            Self::Synthetic(_) => "synthetic".into(),
        }
    }

    /// Fresh source for one session; synthetic sequences restart at 1.
    fn session_source(&mut self) -> Box<dyn FrameSource + '_> {
        match self {
            Self::Camera(camera) => Box::new(camera),
            Self::Synthetic(interval) => Box::new(Paced {
                frames: SyntheticFrames::unbounded(),
                interval: *interval,
                next_at: Instant::now(),
            }),
        }
    }
}

fn idle_progress() -> SessionProgress {
    SessionProgress {
        status: SessionStatus::Idle,
        session_id: None,
        class: None,
        class_size: 0,
        present_count: 0,
        frames: 0,
        ticks: 0,
        pending_events: 0,
        flush_failures: 0,
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// Opens the frame source and loads the recognizer up front, failing fast
/// if the camera is unavailable. Each start rebuilds the roster from disk
/// and reopens the attendance log, then drives the session while polling
/// for requests once per frame.
pub fn spawn_engine(config: Config) -> Result<EngineHandle, EngineError> {
    let mut input = FrameInput::open(&config)?;
    let mut recognizer = load_recognizer(&config);

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(8);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut last_summary: Option<SessionSummary> = None;

            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::Start { context, reply } => {
                        let mut controller = match open_session(&config, &mut recognizer) {
                            Ok(controller) => controller,
                            Err(e) => {
                                tracing::error!(error = %e, "failed to prepare session");
                                let _ = reply.send(Err(e));
                                continue;
                            }
                        };
                        if let Err(e) = controller.start(context) {
                            let _ = reply.send(Err(e.into()));
                            continue;
                        }
                        let progress = controller.progress();
                        let (Some(session_id), Some(class)) = (progress.session_id, progress.class)
                        else {
                            let _ = reply.send(Err(EngineError::NotRunning));
                            continue;
                        };
                        let _ = reply.send(Ok(StartedSession {
                            session_id,
                            class,
                            class_size: progress.class_size,
                        }));

                        let source_name = input.describe();
                        let ready = controller.recognizer().check_ready().is_ok();
                        let mut stop_reply = None;
                        let mut source = input.session_source();
                        let outcome = controller.run_with(&mut source, |ctl, _report| {
                            loop {
                                match rx.try_recv() {
                                    Ok(EngineRequest::Stop { reply }) => {
                                        stop_reply = Some(reply);
                                        return ControlFlow::Break(());
                                    }
                                    Ok(EngineRequest::Status { reply }) => {
                                        let _ = reply.send(EngineStatus {
                                            session: ctl.progress(),
                                            source: source_name.clone(),
                                            recognizer_ready: ready,
                                            last_summary: last_summary.clone(),
                                        });
                                    }
                                    Ok(EngineRequest::Start { reply, .. }) => {
                                        let _ = reply.send(Err(EngineError::AlreadyRunning));
                                    }
                                    Err(TryRecvError::Empty) => return ControlFlow::Continue(()),
                                    Err(TryRecvError::Disconnected) => return ControlFlow::Break(()),
                                }
                            }
                        });

                        drop(source);
                        input.end_session();

                        let result = match outcome {
                            Ok(summary) => {
                                last_summary = Some(summary.clone());
                                Ok(summary)
                            }
                            Err(SessionError::Capture { source, summary }) => {
                                tracing::error!(error = %source, "session ended by capture failure");
                                last_summary = Some((*summary).clone());
                                Ok(*summary)
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "session ended abnormally");
                                Err(EngineError::from(e))
                            }
                        };
                        if let Some(reply) = stop_reply {
                            let _ = reply.send(result);
                        }
                    }
                    EngineRequest::Stop { reply } => {
                        let _ = reply.send(last_summary.clone().ok_or(EngineError::NotRunning));
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(EngineStatus {
                            session: idle_progress(),
                            source: input.describe(),
                            recognizer_ready: recognizer.check_ready().is_ok(),
                            last_summary: last_summary.clone(),
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn open_session<'r>(
    config: &Config,
    recognizer: &'r mut Box<dyn Recognizer + Send>,
) -> Result<SessionController<&'r mut Box<dyn Recognizer + Send>, CsvLog>, EngineError> {
    let roster = RosterIndex::load(&config.dataset_dir, &config.student_db)?;
    let log = CsvLog::open(&config.attendance_log)?;
    tracing::info!(
        students = roster.len(),
        log = %log.path().display(),
        "session resources loaded"
    );
    Ok(SessionController::new(
        roster,
        recognizer,
        log,
        config.session_settings(),
    ))
}
