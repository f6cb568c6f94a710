//! Encoder driver wrapping the system codec library.
//!
//! Reconfigures itself whenever the input description changes, fans the
//! pixel-format packers out over the CPU cores and hands the raw frame to
//! the encoder, emitting the coded packet wrapped as an engine frame.

use std::sync::{Mutex, MutexGuard, OnceLock};

use ffmpeg_next::{self as ffmpeg, format::Pixel};

use crate::encoders::line_convert::{converter_for, LineConverter};
use crate::encoders::packers::{split_strips, Packer};
use crate::encoders::registry::{self, DEFAULT_GOP_SIZE};
use crate::encoders::tuning::TuneParams;
use crate::types::config::{EncoderOptions, EngineContext};
use crate::types::error::{EncoderError, EncoderResult};
use crate::types::video_frame::{Codec, Interlacing, VideoDesc, VideoFrame};

/// The codec library is not reentrant across encoder open/close; every
/// open and teardown in the process is serialised on this lock.
fn codec_open_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .expect("codec open lock poisoned")
}

pub struct LavcEncoder {
    options: EncoderOptions,
    engine: EngineContext,
    cpu_count: usize,

    saved_desc: Option<VideoDesc>,
    configured: bool,

    encoder: Option<ffmpeg::codec::encoder::Video>,
    in_frame: Option<ffmpeg::util::frame::Video>,
    /// Staging buffer for inputs that are not already UYVY
    decoded: Vec<u8>,
    line_converter: Option<LineConverter>,
    packer: Packer,
    compressed_desc: Option<VideoDesc>,
    frame_seq: i64,
}

impl LavcEncoder {
    pub fn new(options: EncoderOptions, engine: EngineContext) -> EncoderResult<Self> {
        ffmpeg::init()?;
        let cpu_count = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or_else(|_| {
                log::warn!("cannot get the number of CPU cores, using one worker");
                1
            });
        log::info!("using codec: {}", options.codec.name());
        Ok(Self {
            options,
            engine,
            cpu_count,
            saved_desc: None,
            configured: false,
            encoder: None,
            in_frame: None,
            decoded: Vec::new(),
            line_converter: None,
            packer: Packer::Yuv420p,
            compressed_desc: None,
            frame_seq: 0,
        })
    }

    /// Compress one raw frame. `None` means the frame produced no packet
    /// this tick or was dropped; the encoder itself stays alive.
    pub fn compress(&mut self, frame: &VideoFrame) -> Option<VideoFrame> {
        let desc = frame.desc();
        let needs_reconfigure = self
            .saved_desc
            .map_or(true, |saved| !saved.eq_excluding_tiles(&desc));
        if needs_reconfigure {
            self.cleanup();
            // remembered even on failure: a retry waits for the next
            // differing input instead of thrashing every frame
            self.saved_desc = Some(desc);
            match self.configure_with(desc) {
                Ok(()) => self.configured = true,
                Err(err) => {
                    log::error!("encoder reconfiguration failed: {}", err);
                    self.configured = false;
                }
            }
        }
        if !self.configured {
            return None;
        }

        match self.encode_frame(frame) {
            Ok(out) => out,
            Err(err) => {
                log::error!("error encoding frame: {}", err);
                None
            }
        }
    }

    /// The opened encoder, for callers muxing the stream.
    pub fn encoder(&self) -> Option<&ffmpeg::codec::encoder::Video> {
        self.encoder.as_ref()
    }

    fn configure_with(&mut self, desc: VideoDesc) -> EncoderResult<()> {
        let entry = registry::lookup(self.options.codec).ok_or_else(|| {
            EncoderError::Config(format!(
                "requested output codec {} is not supported",
                self.options.codec.name()
            ))
        })?;

        if desc.width % 2 != 0 {
            return Err(EncoderError::Init(format!(
                "width must be even, got {}",
                desc.width
            )));
        }

        let codec = self.find_codec(entry)?;

        let supported: Option<Vec<Pixel>> = codec
            .video()
            .ok()
            .and_then(|video| video.formats().map(|formats| formats.collect()));
        let accepts = |format: Pixel| {
            supported
                .as_ref()
                .map_or(true, |formats| formats.contains(&format))
        };
        let pix_fmt = registry::select_pixel_format(
            self.options.subsampling,
            desc.interlacing,
            codec.name(),
            accepts,
        )
        .ok_or(EncoderError::NoPixelFormat)?;
        log::info!("selected pixfmt: {:?}", pix_fmt);

        let packer = Packer::for_pixel(pix_fmt).ok_or(EncoderError::NoPixelFormat)?;
        if packer.chroma_halved() && desc.height % 2 != 0 {
            return Err(EncoderError::Init(format!(
                "4:2:0 output requires an even height, got {}",
                desc.height
            )));
        }

        let mut encoder_ctx = ffmpeg::codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()?;

        let avg_bpp = self.options.bpp.unwrap_or(entry.avg_bpp);
        let bit_rate = self.options.bitrate.filter(|rate| *rate > 0).unwrap_or_else(|| {
            (f64::from(desc.width) * f64::from(desc.height) * desc.fps * avg_bpp) as i64
        });

        encoder_ctx.set_width(desc.width);
        encoder_ctx.set_height(desc.height);
        encoder_ctx.set_format(pix_fmt);
        encoder_ctx.set_time_base(ffmpeg::Rational::new(1, desc.fps.max(1.0) as i32));
        encoder_ctx.set_bit_rate(bit_rate as usize);
        encoder_ctx.set_max_b_frames(0);
        encoder_ctx.set_gop(self.options.gop.unwrap_or(DEFAULT_GOP_SIZE));
        unsafe {
            let ctx = encoder_ctx.as_mut_ptr();
            (*ctx).strict_std_compliance = ffmpeg::ffi::FF_COMPLIANCE_EXPERIMENTAL;
            (*ctx).bit_rate_tolerance = (bit_rate / 4) as i32;
        }

        self.line_converter = if desc.color_spec == Codec::Uyvy {
            None
        } else {
            Some(converter_for(desc.color_spec).ok_or_else(|| {
                EncoderError::Config(format!(
                    "unable to convert {} input",
                    desc.color_spec.name()
                ))
            })?)
        };
        self.decoded = vec![0u8; desc.width as usize * desc.height as usize * 2];

        if let Some(preset) = &self.options.preset {
            let ret = unsafe {
                let ctx = encoder_ctx.as_mut_ptr();
                let name = std::ffi::CString::new("preset").unwrap();
                let value = std::ffi::CString::new(preset.as_str())
                    .map_err(|_| EncoderError::Config("preset contains NUL".to_string()))?;
                ffmpeg::ffi::av_opt_set((*ctx).priv_data, name.as_ptr(), value.as_ptr(), 0)
            };
            if ret != 0 {
                return Err(EncoderError::Init("unable to set preset".to_string()));
            }
        }

        let params = TuneParams {
            have_preset: self.options.preset.is_some(),
            fps: desc.fps,
            interlaced: desc.interlacing == Interlacing::InterlacedMerged,
            h264_no_periodic_intra: self.options.h264_no_periodic_intra,
            cpu_count: self.cpu_count,
            threads: self.options.threads,
            cuda_devices: &self.engine.cuda_devices,
        };
        entry.tuning.apply(&mut encoder_ctx, &codec, &params);

        let encoder = {
            let _open = codec_open_lock();
            encoder_ctx
                .open_with(ffmpeg::Dictionary::new())
                .map_err(|err| EncoderError::Init(format!("could not open codec: {}", err)))?
        };

        let in_frame = ffmpeg::util::frame::Video::new(pix_fmt, desc.width, desc.height);

        self.encoder = Some(encoder);
        self.in_frame = Some(in_frame);
        self.packer = packer;
        self.compressed_desc = Some(VideoDesc {
            color_spec: self.options.codec,
            tile_count: 1,
            ..desc
        });
        Ok(())
    }

    fn find_codec(&self, entry: &registry::CodecEntry) -> EncoderResult<ffmpeg::Codec> {
        if let Some(backend) = &self.options.backend {
            return ffmpeg::encoder::find_by_name(backend)
                .ok_or_else(|| EncoderError::NoEncoder(backend.clone()));
        }
        if let Some(preferred) = entry.preferred_encoder {
            if let Some(codec) = ffmpeg::encoder::find_by_name(preferred) {
                return Ok(codec);
            }
            log::warn!(
                "preferred encoder \"{}\" not found, trying the default encoder",
                preferred
            );
        }
        ffmpeg::encoder::find(entry.av_codec).ok_or_else(|| {
            EncoderError::NoEncoder(format!(
                "no encoder for {} in the codec library",
                self.options.codec.name()
            ))
        })
    }

    fn encode_frame(&mut self, frame: &VideoFrame) -> EncoderResult<Option<VideoFrame>> {
        let desc = self.saved_desc.expect("configured encoder has a desc");
        let width = desc.width as usize;
        let height = desc.height as usize;

        let use_staging = if let Some(convert) = self.line_converter {
            let src_linesize = desc.color_spec.linesize(desc.width);
            let dst_linesize = width * 2;
            let data = frame.data();
            for y in 0..height {
                convert(
                    &mut self.decoded[y * dst_linesize..][..dst_linesize],
                    &data[y * src_linesize..][..src_linesize],
                );
            }
            true
        } else {
            false
        };

        let mut in_frame = self.in_frame.take().expect("configured encoder has a frame");
        {
            let src: &[u8] = if use_staging {
                &self.decoded
            } else {
                frame.data()
            };
            pack_into(&mut in_frame, self.packer, src, width, height, self.cpu_count);
        }

        let pts = self.frame_seq;
        self.frame_seq += 1;
        in_frame.set_pts(Some(pts));

        let encoder = self.encoder.as_mut().expect("configured encoder is open");
        let send_result = encoder.send_frame(&in_frame);
        self.in_frame = Some(in_frame);
        send_result?;

        let mut packet = ffmpeg::codec::packet::Packet::empty();
        if encoder.receive_packet(&mut packet).is_ok() {
            let out = VideoFrame::from_packet(
                self.compressed_desc.expect("configured encoder has a desc"),
                packet,
                pts,
            );
            log::trace!("compressed frame size: {}", out.data_len());
            Ok(Some(out))
        } else {
            Ok(None)
        }
    }

    fn cleanup(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            let _open = codec_open_lock();
            drop(encoder);
        }
        self.in_frame = None;
        self.compressed_desc = None;
        self.configured = false;
    }
}

impl Drop for LavcEncoder {
    fn drop(&mut self) {
        self.cleanup();
    }
}

/// Fan the packer out over per-core strips of the planar frame.
fn pack_into(
    frame: &mut ffmpeg::util::frame::Video,
    packer: Packer,
    src: &[u8],
    width: usize,
    height: usize,
    cpu_count: usize,
) {
    let chroma_halved = packer.chroma_halved();
    let y_stride = frame.stride(0);
    let cb_stride = frame.stride(1);
    let cr_stride = if packer == Packer::Nv12 {
        0
    } else {
        frame.stride(2)
    };
    let chroma_rows = if chroma_halved { height / 2 } else { height };

    // disjoint plane slices of the shared frame; the strip views split
    // them further so workers never alias
    let (y_plane, cb_plane, cr_plane) = unsafe {
        let raw = frame.as_mut_ptr();
        let y = std::slice::from_raw_parts_mut((*raw).data[0], y_stride * height);
        let cb = std::slice::from_raw_parts_mut((*raw).data[1], cb_stride * chroma_rows);
        let cr = if packer == Packer::Nv12 {
            &mut [][..]
        } else {
            std::slice::from_raw_parts_mut((*raw).data[2], cr_stride * chroma_rows)
        };
        (y, cb, cr)
    };

    let strips = split_strips(
        y_plane,
        cb_plane,
        cr_plane,
        [y_stride, cb_stride, cr_stride],
        height,
        chroma_halved,
        cpu_count,
    );

    std::thread::scope(|scope| {
        for (mut view, start_row) in strips {
            let rows = view.rows;
            let part = &src[start_row * width * 2..][..rows * width * 2];
            scope.spawn(move || packer.pack(&mut view, part, width));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::config::ParseOutcome;

    fn grey_uyvy_frame(width: u32, height: u32) -> VideoFrame {
        let mut frame =
            VideoFrame::alloc(width, height, Codec::Uyvy, 30.0, Interlacing::Progressive);
        frame.buffer_mut().fill(0x80);
        frame
    }

    fn mjpeg_available() -> bool {
        ffmpeg::init().is_ok() && ffmpeg::encoder::find(ffmpeg::codec::Id::MJPEG).is_some()
    }

    #[test]
    fn mjpeg_pts_is_the_input_index() {
        if !mjpeg_available() {
            return;
        }
        let options = match EncoderOptions::parse("codec=MJPEG").unwrap() {
            ParseOutcome::Parsed(options) => options,
            ParseOutcome::HelpShown => unreachable!(),
        };
        let mut encoder = LavcEncoder::new(options, EngineContext::default()).unwrap();
        let frame = grey_uyvy_frame(64, 32);
        let mut expected_pts = 0;
        for _ in 0..5 {
            if let Some(out) = encoder.compress(&frame) {
                assert!(out.is_coded());
                assert_eq!(out.color_spec, Codec::Mjpg);
                assert!(out.data_len() > 0);
                assert_eq!(out.pts, Some(expected_pts));
            }
            expected_pts += 1;
        }
    }

    #[test]
    fn reconfigure_keeps_pts_running() {
        if !mjpeg_available() {
            return;
        }
        let options = match EncoderOptions::parse("codec=MJPEG").unwrap() {
            ParseOutcome::Parsed(options) => options,
            ParseOutcome::HelpShown => unreachable!(),
        };
        let mut encoder = LavcEncoder::new(options, EngineContext::default()).unwrap();
        let small = grey_uyvy_frame(64, 32);
        let large = grey_uyvy_frame(128, 64);
        let mut last_pts = -1;
        for _ in 0..3 {
            if let Some(out) = encoder.compress(&small) {
                assert!(out.pts.unwrap() > last_pts);
                last_pts = out.pts.unwrap();
            }
        }
        for _ in 0..3 {
            if let Some(out) = encoder.compress(&large) {
                assert_eq!(out.width, 128);
                assert!(out.pts.unwrap() > last_pts);
                last_pts = out.pts.unwrap();
            }
        }
    }

    #[test]
    fn odd_width_is_rejected_and_sticky() {
        if !mjpeg_available() {
            return;
        }
        let mut encoder =
            LavcEncoder::new(EncoderOptions::default(), EngineContext::default()).unwrap();
        let odd = grey_uyvy_frame(63, 32);
        assert!(encoder.compress(&odd).is_none());
        // same desc again: still refused, no retry storm
        assert!(encoder.compress(&odd).is_none());
    }

    #[test]
    fn unknown_backend_fails_configuration() {
        if ffmpeg::init().is_err() {
            return;
        }
        let options = match EncoderOptions::parse("codec=H.264:backend=not_a_backend").unwrap() {
            ParseOutcome::Parsed(options) => options,
            ParseOutcome::HelpShown => unreachable!(),
        };
        let mut encoder = LavcEncoder::new(options, EngineContext::default()).unwrap();
        let frame = grey_uyvy_frame(64, 32);
        assert!(encoder.compress(&frame).is_none());
    }
}
