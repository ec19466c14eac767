use rollcall_core::ClassContext;
use serde::Serialize;
use zbus::interface;

use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct AttendanceService {
    engine: EngineHandle,
}

impl AttendanceService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Session(rollcall_core::SessionError::Configuration(msg)) => {
            zbus::fdo::Error::InvalidArgs(msg)
        }
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Attendance1")]
impl AttendanceService {
    /// Start a session for one branch and section. Returns the session id
    /// and class size as JSON.
    async fn start(&self, branch: &str, section: &str) -> zbus::fdo::Result<String> {
        let context = ClassContext::new(branch, section);
        tracing::info!(class = %context, "start requested");
        let started = self.engine.start(context).await.map_err(to_fdo)?;
        to_json(&started)
    }

    /// Stop the running session and return its summary as JSON.
    async fn stop(&self) -> zbus::fdo::Result<String> {
        tracing::info!("stop requested");
        let summary = self.engine.stop().await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Return engine and session progress as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engine": status,
        })
        .to_string())
    }
}
