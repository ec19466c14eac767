//! Frame sources feeding the session loop.

use thiserror::Error;

use crate::types::Frame;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    #[error("capture device unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame read failed: {0}")]
    ReadFailed(String),
}

/// A stream of frames. `Ok(None)` ends a finite stream.
pub trait FrameSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError>;
}

impl<S: FrameSource + ?Sized> FrameSource for &mut S {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        (**self).next_frame()
    }
}

/// Emits `total` blank frames with sequence numbers `1..=total`.
///
/// `total == None` never ends; the session runs until stopped.
#[derive(Debug, Clone)]
pub struct SyntheticFrames {
    next_sequence: u32,
    total: Option<u32>,
}

impl SyntheticFrames {
    pub fn new(total: u32) -> Self {
        Self {
            next_sequence: 1,
            total: Some(total),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            next_sequence: 1,
            total: None,
        }
    }
}

impl FrameSource for SyntheticFrames {
    fn next_frame(&mut self) -> Result<Option<Frame>, CaptureError> {
        if let Some(total) = self.total {
            if self.next_sequence > total {
                return Ok(None);
            }
        }
        let frame = Frame::blank(self.next_sequence);
        self.next_sequence = self.next_sequence.wrapping_add(1);
        Ok(Some(frame))
    }
}
