//! roster-hw: V4L2 camera capture for the check-in kiosk.
//!
//! Opens a capture device, negotiates YUYV/GREY/Y16 and hands back 8-bit
//! grayscale frames after a configurable warm-up.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, DeviceInfo};
pub use frame::{Frame, PixelFormat};
