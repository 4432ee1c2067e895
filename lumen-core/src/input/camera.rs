//! V4L2 camera input (YUYV mmap capture).

use std::path::Path;

use tracing::info;
use v4l::buffer::Type;
use v4l::io::traits::CaptureStream;
use v4l::prelude::MmapStream;
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use crate::error::LumenError;
use crate::input::VideoInput;
use crate::vpx::RawImage;

const YUYV: FourCC = FourCC { repr: *b"YUYV" };

/// Webcam capture through V4L2, converted from packed YUYV to I420.
pub struct CameraInput {
    // the device must outlive the mmap'd buffers; a camera session
    // lasts for the whole process, so the device is leaked once here
    stream: MmapStream<'static>,
    display_width: u16,
    display_height: u16,
}

impl CameraInput {
    /// Open the V4L2 device at `path` and start YUYV streaming at the
    /// given geometry.
    pub fn open(
        path: &Path,
        display_width: u16,
        display_height: u16,
    ) -> Result<Self, LumenError> {
        let device: &'static Device = Box::leak(Box::new(Device::with_path(path)?));

        let requested = Format::new(u32::from(display_width), u32::from(display_height), YUYV);
        let format = device.set_format(&requested)?;

        if format.fourcc != YUYV {
            return Err(LumenError::Config(format!(
                "camera does not support YUYV capture (offered {})",
                format.fourcc
            )));
        }
        if format.width != u32::from(display_width) || format.height != u32::from(display_height)
        {
            return Err(LumenError::Config(format!(
                "camera cannot capture {display_width}x{display_height} \
                 (offered {}x{})",
                format.width, format.height
            )));
        }

        let stream = MmapStream::with_buffers(device, Type::VideoCapture, 4)?;
        info!("initialized camera capture at {display_width}x{display_height} YUYV");

        Ok(Self {
            stream,
            display_width,
            display_height,
        })
    }
}

impl VideoInput for CameraInput {
    fn display_width(&self) -> u16 {
        self.display_width
    }

    fn display_height(&self) -> u16 {
        self.display_height
    }

    fn read_frame(&mut self, raw_img: &mut RawImage) -> Result<bool, LumenError> {
        if raw_img.display_width() != self.display_width
            || raw_img.display_height() != self.display_height
        {
            return Err(LumenError::Config(
                "image dimensions don't match the camera".into(),
            ));
        }

        let expected = raw_img.y_size() * 2;
        let (buf, _meta) = self.stream.next()?;
        if buf.len() < expected {
            return Err(LumenError::Config(format!(
                "short camera frame: {} bytes, expected {expected}",
                buf.len()
            )));
        }

        raw_img.copy_from_yuyv(&buf[..expected])?;
        Ok(true)
    }
}
