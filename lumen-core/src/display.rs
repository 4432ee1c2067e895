//! SDL2 video display sink.

use sdl2::EventPump;
use sdl2::event::Event;
use sdl2::pixels::PixelFormatEnum;
use sdl2::render::{Texture, WindowCanvas};

use crate::error::LumenError;
use crate::vpx::RawImage;

/// SDL2 window presenting decoded I420 frames through a streaming
/// IYUV texture.
pub struct VideoDisplay {
    canvas: WindowCanvas,
    texture: Texture,
    event_pump: EventPump,
    display_width: u16,
    display_height: u16,
}

impl VideoDisplay {
    pub fn new(display_width: u16, display_height: u16) -> Result<Self, LumenError> {
        let sdl = sdl2::init().map_err(LumenError::Display)?;
        let video = sdl.video().map_err(LumenError::Display)?;

        let window = video
            .window("lumen", u32::from(display_width), u32::from(display_height))
            .position_centered()
            .build()
            .map_err(|e| LumenError::Display(e.to_string()))?;

        let canvas = window
            .into_canvas()
            .build()
            .map_err(|e| LumenError::Display(e.to_string()))?;

        let texture = canvas
            .texture_creator()
            .create_texture_streaming(
                PixelFormatEnum::IYUV,
                u32::from(display_width),
                u32::from(display_height),
            )
            .map_err(|e| LumenError::Display(e.to_string()))?;

        let event_pump = sdl.event_pump().map_err(LumenError::Display)?;

        Ok(Self {
            canvas,
            texture,
            event_pump,
            display_width,
            display_height,
        })
    }

    /// Present one decoded frame.
    pub fn show_frame(&mut self, raw_img: &RawImage) -> Result<(), LumenError> {
        if raw_img.display_width() != self.display_width
            || raw_img.display_height() != self.display_height
        {
            return Err(LumenError::Config(
                "image dimensions don't match the display".into(),
            ));
        }

        self.texture
            .update_yuv(
                None,
                raw_img.y_plane(),
                raw_img.y_stride(),
                raw_img.u_plane(),
                raw_img.u_stride(),
                raw_img.v_plane(),
                raw_img.v_stride(),
            )
            .map_err(|e| LumenError::Display(e.to_string()))?;

        self.canvas.clear();
        self.canvas
            .copy(&self.texture, None, None)
            .map_err(LumenError::Display)?;
        self.canvas.present();

        Ok(())
    }

    /// Whether the user asked the window to close.
    pub fn signal_quit(&mut self) -> bool {
        self.event_pump
            .poll_iter()
            .any(|event| matches!(event, Event::Quit { .. }))
    }
}
