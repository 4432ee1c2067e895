//! Thin safe wrappers over the libvpx VP9 encoder and decoder.
//!
//! All `unsafe` in the crate lives here. The encoder configuration
//! mirrors the realtime settings WebRTC uses for VP9: one-pass CBR, no
//! lagged encoding, and automatic key-frame placement disabled — key
//! frames are only produced on demand, for loss recovery.

use std::os::raw::{c_int, c_uint, c_ulong};
use std::ptr;
use std::slice;

use bytes::Bytes;
use env_libvpx_sys as ffi;
use tracing::{debug, error, info};

use crate::error::LumenError;

fn check(ret: ffi::vpx_codec_err_t, what: &'static str) -> Result<(), LumenError> {
    if ret == ffi::VPX_CODEC_OK {
        Ok(())
    } else {
        Err(LumenError::Codec(format!("{what}: vpx error {}", ret as i64)))
    }
}

// ── RawImage ─────────────────────────────────────────────────────

/// A raw I420 image.
///
/// Either owned (allocated by us — the sender's reusable input image)
/// or borrowed from the decoder context; only the owning variant frees
/// the underlying `vpx_image` on drop.
pub struct RawImage {
    img: *mut ffi::vpx_image_t,
    owned: bool,
    display_width: u16,
    display_height: u16,
}

impl RawImage {
    /// Allocate a new I420 image of the given display size.
    pub fn new(display_width: u16, display_height: u16) -> Result<Self, LumenError> {
        let img = unsafe {
            ffi::vpx_img_alloc(
                ptr::null_mut(),
                ffi::VPX_IMG_FMT_I420,
                c_uint::from(display_width),
                c_uint::from(display_height),
                1,
            )
        };

        if img.is_null() {
            return Err(LumenError::Codec("vpx_img_alloc failed".into()));
        }

        Ok(Self {
            img,
            owned: true,
            display_width,
            display_height,
        })
    }

    /// Borrow an image returned by the decoder; the codec retains
    /// ownership and reuses the buffer on the next decode.
    fn from_codec(img: *mut ffi::vpx_image_t) -> Result<Self, LumenError> {
        let (fmt, d_w, d_h) = unsafe { ((*img).fmt, (*img).d_w, (*img).d_h) };
        if fmt != ffi::VPX_IMG_FMT_I420 {
            return Err(LumenError::Codec("decoder produced a non-I420 image".into()));
        }

        Ok(Self {
            img,
            owned: false,
            display_width: d_w as u16,
            display_height: d_h as u16,
        })
    }

    pub fn display_width(&self) -> u16 {
        self.display_width
    }

    pub fn display_height(&self) -> u16 {
        self.display_height
    }

    /// Bytes in the Y plane (tightly packed).
    pub fn y_size(&self) -> usize {
        usize::from(self.display_width) * usize::from(self.display_height)
    }

    /// Bytes in each chroma plane (tightly packed).
    pub fn uv_size(&self) -> usize {
        self.y_size() / 4
    }

    pub(crate) fn as_ptr(&self) -> *mut ffi::vpx_image_t {
        self.img
    }

    fn plane(&self, index: usize) -> (*mut u8, usize) {
        unsafe { ((*self.img).planes[index], (*self.img).stride[index] as usize) }
    }

    /// The Y plane including stride padding (`y_stride() · height` bytes).
    pub fn y_plane(&self) -> &[u8] {
        let (data, stride) = self.plane(ffi::VPX_PLANE_Y as usize);
        unsafe { slice::from_raw_parts(data, stride * usize::from(self.display_height)) }
    }

    pub fn u_plane(&self) -> &[u8] {
        let (data, stride) = self.plane(ffi::VPX_PLANE_U as usize);
        unsafe { slice::from_raw_parts(data, stride * usize::from(self.display_height) / 2) }
    }

    pub fn v_plane(&self) -> &[u8] {
        let (data, stride) = self.plane(ffi::VPX_PLANE_V as usize);
        unsafe { slice::from_raw_parts(data, stride * usize::from(self.display_height) / 2) }
    }

    pub fn y_stride(&self) -> usize {
        self.plane(ffi::VPX_PLANE_Y as usize).1
    }

    pub fn u_stride(&self) -> usize {
        self.plane(ffi::VPX_PLANE_U as usize).1
    }

    pub fn v_stride(&self) -> usize {
        self.plane(ffi::VPX_PLANE_V as usize).1
    }

    fn copy_plane(
        &mut self,
        index: usize,
        src: &[u8],
        row_len: usize,
        rows: usize,
    ) -> Result<(), LumenError> {
        if src.len() != row_len * rows {
            return Err(LumenError::Config(format!(
                "invalid plane size: got {} bytes, expected {}",
                src.len(),
                row_len * rows
            )));
        }

        let (dst, stride) = self.plane(index);
        for (row_idx, row) in src.chunks_exact(row_len).enumerate() {
            unsafe {
                ptr::copy_nonoverlapping(row.as_ptr(), dst.add(row_idx * stride), row_len);
            }
        }
        Ok(())
    }

    /// Copy a tightly packed Y plane into the image.
    pub fn copy_y_from(&mut self, src: &[u8]) -> Result<(), LumenError> {
        let width = usize::from(self.display_width);
        let height = usize::from(self.display_height);
        self.copy_plane(ffi::VPX_PLANE_Y as usize, src, width, height)
    }

    /// Copy a tightly packed U plane into the image.
    pub fn copy_u_from(&mut self, src: &[u8]) -> Result<(), LumenError> {
        let width = usize::from(self.display_width);
        let height = usize::from(self.display_height);
        self.copy_plane(ffi::VPX_PLANE_U as usize, src, width / 2, height / 2)
    }

    /// Copy a tightly packed V plane into the image.
    pub fn copy_v_from(&mut self, src: &[u8]) -> Result<(), LumenError> {
        let width = usize::from(self.display_width);
        let height = usize::from(self.display_height);
        self.copy_plane(ffi::VPX_PLANE_V as usize, src, width / 2, height / 2)
    }

    /// Convert a packed YUYV (4:2:2) buffer into this I420 image,
    /// subsampling chroma from the even rows.
    pub fn copy_from_yuyv(&mut self, src: &[u8]) -> Result<(), LumenError> {
        if src.len() != self.y_size() * 2 {
            return Err(LumenError::Config(format!(
                "invalid YUYV size: got {} bytes, expected {}",
                src.len(),
                self.y_size() * 2
            )));
        }

        let width = usize::from(self.display_width);
        let height = usize::from(self.display_height);
        let (y_dst, y_stride) = self.plane(ffi::VPX_PLANE_Y as usize);
        let (u_dst, u_stride) = self.plane(ffi::VPX_PLANE_U as usize);
        let (v_dst, v_stride) = self.plane(ffi::VPX_PLANE_V as usize);

        for (row_idx, row) in src.chunks_exact(width * 2).enumerate() {
            for x in 0..width {
                unsafe {
                    *y_dst.add(row_idx * y_stride + x) = row[2 * x];
                }
            }

            if row_idx % 2 == 0 {
                for x in (0..width).step_by(2) {
                    unsafe {
                        *u_dst.add(row_idx / 2 * u_stride + x / 2) = row[2 * x + 1];
                        *v_dst.add(row_idx / 2 * v_stride + x / 2) = row[2 * x + 3];
                    }
                }
            }
        }

        Ok(())
    }
}

impl Drop for RawImage {
    fn drop(&mut self) {
        if self.owned {
            unsafe { ffi::vpx_img_free(self.img) };
        }
    }
}

// ── VpxEncoder ───────────────────────────────────────────────────

/// One encoded VP9 frame drained from the codec.
pub struct EncodedPacket {
    pub data: Bytes,
    pub is_key: bool,
}

/// VP9 encoder context configured for realtime CBR streaming.
pub struct VpxEncoder {
    ctx: ffi::vpx_codec_ctx_t,
    cfg: ffi::vpx_codec_enc_cfg_t,
}

impl VpxEncoder {
    pub fn new(
        display_width: u16,
        display_height: u16,
        frame_rate: u16,
    ) -> Result<Self, LumenError> {
        let iface = unsafe { ffi::vpx_codec_vp9_cx() };

        let mut cfg: ffi::vpx_codec_enc_cfg_t = unsafe { std::mem::zeroed() };
        check(
            unsafe { ffi::vpx_codec_enc_config_default(iface, &mut cfg, 0) },
            "vpx_codec_enc_config_default",
        )?;

        cfg.g_w = c_uint::from(display_width);
        cfg.g_h = c_uint::from(display_height);
        cfg.g_timebase.num = 1;
        cfg.g_timebase.den = c_int::from(frame_rate);
        cfg.g_pass = ffi::VPX_RC_ONE_PASS;
        cfg.g_lag_in_frames = 0;
        cfg.g_error_resilient = ffi::VPX_ERROR_RESILIENT_DEFAULT;
        cfg.g_threads = 4;
        cfg.rc_resize_allowed = 0;
        cfg.rc_dropframe_thresh = 0;
        cfg.rc_buf_initial_sz = 500;
        cfg.rc_buf_optimal_sz = 600;
        cfg.rc_buf_sz = 1000;
        cfg.rc_min_quantizer = 2;
        cfg.rc_max_quantizer = 52;
        cfg.rc_undershoot_pct = 50;
        cfg.rc_overshoot_pct = 50;

        // key frames are only ever forced explicitly
        cfg.kf_mode = ffi::VPX_KF_DISABLED;
        cfg.kf_max_dist = c_uint::MAX;
        cfg.kf_min_dist = 0;

        cfg.rc_end_usage = ffi::VPX_CBR;

        let mut ctx: ffi::vpx_codec_ctx_t = unsafe { std::mem::zeroed() };
        check(
            unsafe {
                ffi::vpx_codec_enc_init_ver(
                    &mut ctx,
                    iface,
                    &cfg,
                    0,
                    ffi::VPX_ENCODER_ABI_VERSION as c_int,
                )
            },
            "vpx_codec_enc_init",
        )?;

        let mut encoder = Self { ctx, cfg };

        let cpu_used = num_cpus::get().min(16) as c_int;

        // motion-estimation effort; dominates encoding speed
        encoder.control(ffi::VP8E_SET_CPUUSED, cpu_used, "VP8E_SET_CPUUSED")?;
        // skip static/low-content blocks
        encoder.control(ffi::VP8E_SET_STATIC_THRESHOLD, 1, "VP8E_SET_STATIC_THRESHOLD")?;
        // clamp key-frame size to 900% of the average per-frame bitrate
        encoder.control(
            ffi::VP8E_SET_MAX_INTRA_BITRATE_PCT,
            900,
            "VP8E_SET_MAX_INTRA_BITRATE_PCT",
        )?;
        // adaptive per-segment quantization
        encoder.control(ffi::VP9E_SET_AQ_MODE, 3, "VP9E_SET_AQ_MODE")?;
        // 2^2 = 4 column tiles, matching g_threads
        encoder.control(ffi::VP9E_SET_TILE_COLUMNS, 2, "VP9E_SET_TILE_COLUMNS")?;
        encoder.control(ffi::VP9E_SET_ROW_MT, 1, "VP9E_SET_ROW_MT")?;
        encoder.control(
            ffi::VP9E_SET_FRAME_PARALLEL_DECODING,
            0,
            "VP9E_SET_FRAME_PARALLEL_DECODING",
        )?;
        encoder.control(ffi::VP9E_SET_NOISE_SENSITIVITY, 1, "VP9E_SET_NOISE_SENSITIVITY")?;

        info!("initialized VP9 encoder (cpu used: {cpu_used})");
        Ok(encoder)
    }

    fn control(
        &mut self,
        id: ffi::vp8e_enc_control_id,
        value: c_int,
        what: &'static str,
    ) -> Result<(), LumenError> {
        let ret = unsafe { ffi::vpx_codec_control_(&mut self.ctx, id as c_int, value) };
        check(ret, what)
    }

    /// Encode one raw frame and drain the single expected packet.
    pub fn encode_frame(
        &mut self,
        raw_img: &RawImage,
        pts: i64,
        force_key: bool,
    ) -> Result<EncodedPacket, LumenError> {
        let flags: ffi::vpx_enc_frame_flags_t = if force_key {
            ffi::VPX_EFLAG_FORCE_KF as ffi::vpx_enc_frame_flags_t
        } else {
            0
        };

        check(
            unsafe {
                ffi::vpx_codec_encode(
                    &mut self.ctx,
                    raw_img.as_ptr(),
                    pts,
                    1,
                    flags,
                    ffi::VPX_DL_REALTIME as c_ulong,
                )
            },
            "vpx_codec_encode",
        )?;

        let mut iter: ffi::vpx_codec_iter_t = ptr::null();
        let mut packet: Option<EncodedPacket> = None;

        loop {
            let pkt = unsafe { ffi::vpx_codec_get_cx_data(&mut self.ctx, &mut iter) };
            if pkt.is_null() {
                break;
            }
            if unsafe { (*pkt).kind } != ffi::VPX_CODEC_CX_FRAME_PKT {
                continue;
            }
            if packet.is_some() {
                return Err(LumenError::Codec(
                    "multiple frames were encoded at once".into(),
                ));
            }

            let (buf, sz, frame_flags) = unsafe {
                let frame = &(*pkt).data.frame;
                (frame.buf as *const u8, frame.sz, frame.flags)
            };
            debug_assert!(sz > 0);

            packet = Some(EncodedPacket {
                data: Bytes::copy_from_slice(unsafe { slice::from_raw_parts(buf, sz) }),
                is_key: frame_flags & ffi::VPX_FRAME_IS_KEY != 0,
            });
        }

        packet.ok_or_else(|| LumenError::Codec("encoder produced no frame packet".into()))
    }

    /// Update the CBR target (kbps) on the live context.
    pub fn set_target_bitrate(&mut self, bitrate_kbps: u32) -> Result<(), LumenError> {
        self.cfg.rc_target_bitrate = bitrate_kbps;
        check(
            unsafe { ffi::vpx_codec_enc_config_set(&mut self.ctx, &self.cfg) },
            "vpx_codec_enc_config_set",
        )
    }

    /// The codec's current CBR target (kbps).
    pub fn target_bitrate(&self) -> u32 {
        self.cfg.rc_target_bitrate
    }
}

impl Drop for VpxEncoder {
    fn drop(&mut self) {
        if unsafe { ffi::vpx_codec_destroy(&mut self.ctx) } != ffi::VPX_CODEC_OK {
            error!("failed to destroy VP9 encoder context");
        }
    }
}

// ── VpxDecoder ───────────────────────────────────────────────────

/// VP9 decoder context.
pub struct VpxDecoder {
    ctx: ffi::vpx_codec_ctx_t,
}

impl VpxDecoder {
    /// Initialize a decoding context with up to `threads` codec threads.
    pub fn new(
        display_width: u16,
        display_height: u16,
        threads: u32,
    ) -> Result<Self, LumenError> {
        let cfg = ffi::vpx_codec_dec_cfg_t {
            threads,
            w: c_uint::from(display_width),
            h: c_uint::from(display_height),
        };

        let mut ctx: ffi::vpx_codec_ctx_t = unsafe { std::mem::zeroed() };
        check(
            unsafe {
                ffi::vpx_codec_dec_init_ver(
                    &mut ctx,
                    ffi::vpx_codec_vp9_dx(),
                    &cfg,
                    0,
                    ffi::VPX_DECODER_ABI_VERSION as c_int,
                )
            },
            "vpx_codec_dec_init",
        )?;

        debug!("initialized VP9 decoder context");
        Ok(Self { ctx })
    }

    /// Decode one compressed frame.
    pub fn decode(&mut self, data: &[u8]) -> Result<(), LumenError> {
        check(
            unsafe {
                ffi::vpx_codec_decode(
                    &mut self.ctx,
                    data.as_ptr(),
                    data.len() as c_uint,
                    ptr::null_mut(),
                    1,
                )
            },
            "vpx_codec_decode",
        )
    }

    /// Drain the single decoded image.
    ///
    /// The returned [`RawImage`] borrows codec-owned memory and must be
    /// consumed before the next `decode` call.
    pub fn decoded_image(&mut self) -> Result<RawImage, LumenError> {
        let mut iter: ffi::vpx_codec_iter_t = ptr::null();
        let mut image: Option<RawImage> = None;

        loop {
            let img = unsafe { ffi::vpx_codec_get_frame(&mut self.ctx, &mut iter) };
            if img.is_null() {
                break;
            }
            if image.is_some() {
                return Err(LumenError::Codec(
                    "multiple frames were decoded at once".into(),
                ));
            }
            image = Some(RawImage::from_codec(img)?);
        }

        image.ok_or_else(|| LumenError::Codec("decoder produced no image".into()))
    }
}

impl Drop for VpxDecoder {
    fn drop(&mut self) {
        if unsafe { ffi::vpx_codec_destroy(&mut self.ctx) } != ffi::VPX_CODEC_OK {
            error!("failed to destroy VP9 decoder context");
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn black_image(width: u16, height: u16) -> RawImage {
        let mut img = RawImage::new(width, height).unwrap();
        img.copy_y_from(&vec![0u8; img.y_size()]).unwrap();
        img.copy_u_from(&vec![128u8; img.uv_size()]).unwrap();
        img.copy_v_from(&vec![128u8; img.uv_size()]).unwrap();
        img
    }

    #[test]
    fn plane_copy_validates_sizes() {
        let mut img = RawImage::new(16, 16).unwrap();
        assert!(img.copy_y_from(&[0u8; 10]).is_err());
        assert!(img.copy_u_from(&vec![0u8; 64]).is_ok());
        assert!(img.copy_from_yuyv(&[0u8; 3]).is_err());
    }

    #[test]
    fn yuyv_conversion_places_planes() {
        let mut img = RawImage::new(4, 2).unwrap();
        // two rows of YUYV: Y=10, U=20, V=30
        let mut yuyv = Vec::new();
        for _ in 0..4 {
            yuyv.extend_from_slice(&[10, 20, 10, 30]);
        }
        img.copy_from_yuyv(&yuyv).unwrap();

        assert_eq!(img.y_plane()[0], 10);
        assert_eq!(img.u_plane()[0], 20);
        assert_eq!(img.v_plane()[0], 30);
    }

    #[test]
    fn first_encoded_frame_is_key() {
        let mut encoder = VpxEncoder::new(64, 64, 30).unwrap();
        encoder.set_target_bitrate(500).unwrap();

        let img = black_image(64, 64);
        let packet = encoder.encode_frame(&img, 0, false).unwrap();
        assert!(packet.is_key);
        assert!(!packet.data.is_empty());
    }

    #[test]
    fn encode_decode_roundtrip() {
        let mut encoder = VpxEncoder::new(64, 64, 30).unwrap();
        encoder.set_target_bitrate(500).unwrap();
        let mut decoder = VpxDecoder::new(64, 64, 1).unwrap();

        let img = black_image(64, 64);
        let packet = encoder.encode_frame(&img, 0, false).unwrap();

        decoder.decode(&packet.data).unwrap();
        let decoded = decoder.decoded_image().unwrap();
        assert_eq!(decoded.display_width(), 64);
        assert_eq!(decoded.display_height(), 64);
    }

    #[test]
    fn forced_key_frame_is_key() {
        let mut encoder = VpxEncoder::new(64, 64, 30).unwrap();
        encoder.set_target_bitrate(500).unwrap();

        let img = black_image(64, 64);
        // frame 0 is a key frame regardless; frame 1 normally is not
        encoder.encode_frame(&img, 0, false).unwrap();
        let second = encoder.encode_frame(&img, 1, false).unwrap();
        assert!(!second.is_key);

        let forced = encoder.encode_frame(&img, 2, true).unwrap();
        assert!(forced.is_key);
    }
}
