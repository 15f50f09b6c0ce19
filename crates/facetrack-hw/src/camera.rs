//! Camera abstraction and V4L2 capture via the `v4l` crate.

use crate::frame::{self, Frame};
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Upper bound on a single blocking dequeue, so a stop request is observed
/// even when the device stops delivering frames.
const READ_TIMEOUT: Duration = Duration::from_millis(500);
const STREAM_BUFFERS: u32 = 4;

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("timed out waiting for a frame")]
    Timeout,
}

/// Opens camera handles. The handle is closed when dropped.
pub trait CameraProvider: Send + Sync {
    fn open(&self, device: &str) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// An open camera.
pub trait FrameSource {
    /// Block for the next frame. `Ok(None)` means end of stream;
    /// `Err(CameraError::Timeout)` means no frame arrived in time.
    fn read(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUYV 4:2:2 packed (2 bytes/pixel, extract Y channel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
    /// 16-bit little-endian grayscale (2 bytes/pixel).
    Y16,
}

/// Opens `/dev/videoN` devices at the requested resolution.
#[derive(Debug, Clone, Copy)]
pub struct V4l2Provider {
    pub width: u32,
    pub height: u32,
}

impl Default for V4l2Provider {
    fn default() -> Self {
        Self {
            width: 640,
            height: 480,
        }
    }
}

impl CameraProvider for V4l2Provider {
    fn open(&self, device: &str) -> Result<Box<dyn FrameSource>, CameraError> {
        Ok(Box::new(V4l2Camera::open(device, self.width, self.height)?))
    }
}

/// V4L2 camera with a persistent mmap capture stream.
pub struct V4l2Camera {
    // Declared before `device` so the stream is torn down first.
    stream: MmapStream<'static>,
    #[allow(dead_code)]
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl V4l2Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0").
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }

        let device = Device::with_path(device_path).map_err(|e| {
            if e.raw_os_error() == Some(libc::EBUSY) {
                CameraError::DeviceBusy
            } else {
                CameraError::DeviceNotFound(format!("{device_path}: {e}"))
            }
        })?;

        let caps = device.query_caps().map_err(|e| {
            CameraError::CaptureFailed(format!("failed to query capabilities: {e}"))
        })?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }

        let mut fmt = device.format().map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to get format: {e}"))
        })?;
        fmt.fourcc = FourCC::new(b"YUYV");
        fmt.width = width;
        fmt.height = height;

        let negotiated = device.set_format(&fmt).map_err(|e| {
            CameraError::FormatNegotiationFailed(format!("failed to set format: {e}"))
        })?;

        let fourcc = negotiated.fourcc;
        let pixel_format = if fourcc == FourCC::new(b"GREY") {
            PixelFormat::Grey
        } else if fourcc == FourCC::new(b"YUYV") {
            PixelFormat::Yuyv
        } else if fourcc == FourCC::new(b"Y16 ") || fourcc == FourCC::new(b"Y16\0") {
            PixelFormat::Y16
        } else {
            return Err(CameraError::FormatNegotiationFailed(format!(
                "unsupported pixel format: {fourcc:?} (need YUYV, GREY, or Y16)"
            )));
        };

        let mut stream = MmapStream::with_buffers(&device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| {
                CameraError::CaptureFailed(format!("failed to create mmap stream: {e}"))
            })?;
        stream.set_timeout(READ_TIMEOUT);

        tracing::info!(
            device = device_path,
            driver = %caps.driver,
            card = %caps.card,
            width = negotiated.width,
            height = negotiated.height,
            fourcc = ?fourcc,
            "camera opened"
        );

        Ok(Self {
            stream,
            device,
            width: negotiated.width,
            height: negotiated.height,
            device_path: device_path.to_string(),
            fourcc,
            pixel_format,
        })
    }

    /// List available V4L2 video capture devices.
    pub fn list_devices() -> Vec<DeviceInfo> {
        let mut devices = Vec::new();
        for i in 0..16 {
            let path = format!("/dev/video{i}");
            if !Path::new(&path).exists() {
                continue;
            }
            let Ok(dev) = Device::with_path(&path) else {
                continue;
            };
            let Ok(caps) = dev.query_caps() else {
                continue;
            };
            if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
                continue;
            }
            devices.push(DeviceInfo {
                path,
                name: caps.card.clone(),
                driver: caps.driver.clone(),
            });
        }
        devices
    }
}

/// Convert a raw buffer to grayscale based on the negotiated format.
fn buf_to_grayscale(
    format: PixelFormat,
    width: u32,
    height: u32,
    buf: &[u8],
) -> Result<Vec<u8>, CameraError> {
    let pixels = (width * height) as usize;
    match format {
        PixelFormat::Grey => {
            if buf.len() < pixels {
                return Err(CameraError::CaptureFailed(format!(
                    "GREY buffer too short: expected {pixels}, got {}",
                    buf.len()
                )));
            }
            Ok(buf[..pixels].to_vec())
        }
        PixelFormat::Y16 => frame::y16_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("Y16 conversion failed: {e}"))),
        PixelFormat::Yuyv => frame::yuyv_to_grayscale(buf, width, height)
            .map_err(|e| CameraError::CaptureFailed(format!("YUYV conversion failed: {e}"))),
    }
}

impl FrameSource for V4l2Camera {
    fn read(&mut self) -> Result<Option<Frame>, CameraError> {
        let (format, width, height) = (self.pixel_format, self.width, self.height);
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Err(CameraError::Timeout),
            Err(e) => {
                return Err(CameraError::CaptureFailed(format!(
                    "failed to dequeue buffer: {e}"
                )))
            }
        };
        let sequence = meta.sequence;
        let gray = buf_to_grayscale(format, width, height, buf)?;
        Ok(Some(Frame::from_gray(gray, width, height, sequence)))
    }
}

impl Drop for V4l2Camera {
    fn drop(&mut self) {
        tracing::info!(device = %self.device_path, "camera released");
    }
}
