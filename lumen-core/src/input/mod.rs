//! Raw video sources feeding the encoder.

#[cfg(feature = "camera")]
pub mod camera;
pub mod y4m;

#[cfg(feature = "camera")]
pub use camera::CameraInput;
pub use y4m::Y4mInput;

use crate::error::LumenError;
use crate::vpx::RawImage;

/// A source of raw I420 frames.
pub trait VideoInput {
    fn display_width(&self) -> u16;
    fn display_height(&self) -> u16;

    /// Fetch the next frame into `raw_img`.
    ///
    /// Returns false once the source is exhausted.
    fn read_frame(&mut self, raw_img: &mut RawImage) -> Result<bool, LumenError>;
}
