//! rollcall-hw: camera capture for the attendance monitor.
//!
//! Provides V4L2-based camera access with conversion of YUYV, MJPG and
//! RGB24 buffers to RGB frames.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo, FrameStream, PixelFormat};
pub use frame::{Frame, FrameError};
