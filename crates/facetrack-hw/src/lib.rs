//! facetrack-hw — Camera access for the attendance stream.
//!
//! [`CameraProvider`] / [`FrameSource`] are the seam the stream processor
//! drives; [`V4l2Provider`] is the V4L2 implementation.

pub mod camera;
pub mod frame;

pub use camera::{
    CameraError, CameraProvider, DeviceInfo, FrameSource, PixelFormat, V4l2Camera, V4l2Provider,
};
pub use frame::Frame;
