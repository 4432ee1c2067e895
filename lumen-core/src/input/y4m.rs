//! YUV4MPEG2 file input.
//!
//! Validates the stream header (`YUV4MPEG2 W<w> H<h> C420… …`), then
//! yields one I420 frame per `FRAME` marker: `W·H` Y bytes followed by
//! `W·H/4` U and V bytes each. In loop mode the file wraps around at
//! EOF.

use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::LumenError;
use crate::input::VideoInput;
use crate::vpx::RawImage;

const Y4M_SIGNATURE: &str = "YUV4MPEG2";

/// YUV4MPEG2 file reader.
pub struct Y4mInput {
    reader: BufReader<File>,
    display_width: u16,
    display_height: u16,
    /// Wrap around at EOF instead of ending the stream.
    loop_input: bool,
}

impl Y4mInput {
    /// Open a YUV4MPEG2 file, validating its header against the
    /// expected geometry.
    pub fn open(
        path: &Path,
        display_width: u16,
        display_height: u16,
        loop_input: bool,
    ) -> Result<Self, LumenError> {
        let mut reader = BufReader::new(File::open(path)?);

        let header = read_line(&mut reader)?
            .ok_or_else(|| LumenError::Config("empty YUV4MPEG2 file".into()))?;
        parse_stream_header(&header, display_width, display_height)?;

        Ok(Self {
            reader,
            display_width,
            display_height,
            loop_input,
        })
    }

    fn y_size(&self) -> usize {
        usize::from(self.display_width) * usize::from(self.display_height)
    }

    fn uv_size(&self) -> usize {
        self.y_size() / 4
    }
}

fn parse_stream_header(header: &str, width: u16, height: u16) -> Result<(), LumenError> {
    let Some(params) = header.strip_prefix(Y4M_SIGNATURE) else {
        return Err(LumenError::Config(
            "invalid YUV4MPEG2 file signature".into(),
        ));
    };

    for token in params.split(' ') {
        if token.is_empty() {
            continue;
        }

        match token.as_bytes()[0] {
            b'W' => {
                if token[1..].parse::<u32>().ok() != Some(u32::from(width)) {
                    return Err(LumenError::Config("wrong YUV4MPEG2 frame width".into()));
                }
            }
            b'H' => {
                if token[1..].parse::<u32>().ok() != Some(u32::from(height)) {
                    return Err(LumenError::Config("wrong YUV4MPEG2 frame height".into()));
                }
            }
            b'C' => {
                if !token.starts_with("C420") {
                    return Err(LumenError::Config(
                        "only the YUV420 color space is supported".into(),
                    ));
                }
            }
            _ => {} // interlacing, aspect, frame rate: ignored
        }
    }

    Ok(())
}

/// Read one `\n`-terminated header line; `None` at EOF.
fn read_line(reader: &mut BufReader<File>) -> Result<Option<String>, LumenError> {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line)? == 0 {
        return Ok(None);
    }
    if line.last() == Some(&b'\n') {
        line.pop();
    }

    String::from_utf8(line)
        .map(Some)
        .map_err(|_| LumenError::Config("invalid YUV4MPEG2 header line".into()))
}

fn read_plane(reader: &mut BufReader<File>, len: usize) -> Result<Vec<u8>, LumenError> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

impl VideoInput for Y4mInput {
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
                "image dimensions don't match the video input".into(),
            ));
        }

        let mut frame_header = read_line(&mut self.reader)?;

        if frame_header.is_none() {
            if !self.loop_input {
                return Ok(false);
            }

            // wrap to the beginning, skipping the stream header
            self.reader.seek(SeekFrom::Start(0))?;
            read_line(&mut self.reader)?;
            frame_header = read_line(&mut self.reader)?;
        }

        match frame_header {
            Some(line) if line.starts_with("FRAME") => {}
            _ => return Err(LumenError::Config("invalid YUV4MPEG2 input format".into())),
        }

        // Y, U, V planes in order
        raw_img.copy_y_from(&read_plane(&mut self.reader, self.y_size())?)?;
        raw_img.copy_u_from(&read_plane(&mut self.reader, self.uv_size())?)?;
        raw_img.copy_v_from(&read_plane(&mut self.reader, self.uv_size())?)?;

        Ok(true)
    }
}

// ── Tests ────────────────────────────────────────────────────────
