//! facetrail-hw: webcam capture for the tracking loop.
//!
//! Streams frames from a V4L2 device and converts them to the grayscale
//! [`facetrail_core::Frame`] the engine consumes.

pub mod camera;
pub mod convert;

pub use camera::{Camera, CameraError, DeviceInfo, PixelFormat, DEFAULT_DEVICE};
