//! rollcall-hw: V4L2 camera capture for attendance sessions.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::PixelFormat;
