//! Mapping from engine codec ids to encoder backends, bitrate defaults and
//! tuning policies, plus the pixel-format negotiation.

use ffmpeg_next::{self as ffmpeg, format::Pixel};

use crate::encoders::tuning::TuningPolicy;
use crate::types::config::Subsampling;
use crate::types::video_frame::{Codec, Interlacing};

pub const DEFAULT_GOP_SIZE: u32 = 20;

pub const FMTS420: &[Pixel] = &[Pixel::YUV420P, Pixel::YUVJ420P, Pixel::NV12];
pub const FMTS422: &[Pixel] = &[Pixel::YUV422P, Pixel::YUVJ422P];
pub const FMTS444: &[Pixel] = &[Pixel::YUV444P, Pixel::YUVJ444P];

pub struct CodecEntry {
    pub codec_id: Codec,
    pub av_codec: ffmpeg::codec::Id,
    pub preferred_encoder: Option<&'static str>,
    /// Average bits per pixel used when no bitrate/bpp was requested
    pub avg_bpp: f64,
    pub tuning: TuningPolicy,
}

static CODEC_PARAMS: &[CodecEntry] = &[
    CodecEntry {
        codec_id: Codec::H264,
        av_codec: ffmpeg::codec::Id::H264,
        preferred_encoder: Some("libx264"),
        // 0.07 bpp covers low motion; doubled for medium motion and doubled
        // again for the latency-oriented preset/tune in use
        avg_bpp: 0.07 * 2.0 * 2.0,
        tuning: TuningPolicy::H264,
    },
    CodecEntry {
        codec_id: Codec::H265,
        av_codec: ffmpeg::codec::Id::HEVC,
        preferred_encoder: None,
        avg_bpp: 0.07 * 2.0 * 2.0,
        tuning: TuningPolicy::H265,
    },
    CodecEntry {
        codec_id: Codec::Mjpg,
        av_codec: ffmpeg::codec::Id::MJPEG,
        preferred_encoder: None,
        avg_bpp: 1.2,
        tuning: TuningPolicy::Default,
    },
    CodecEntry {
        codec_id: Codec::J2k,
        av_codec: ffmpeg::codec::Id::JPEG2000,
        preferred_encoder: None,
        avg_bpp: 1.0,
        tuning: TuningPolicy::Default,
    },
    CodecEntry {
        codec_id: Codec::Vp8,
        av_codec: ffmpeg::codec::Id::VP8,
        preferred_encoder: None,
        avg_bpp: 0.4,
        tuning: TuningPolicy::Vp8,
    },
];

pub fn lookup(codec: Codec) -> Option<&'static CodecEntry> {
    CODEC_PARAMS.iter().find(|entry| entry.codec_id == codec)
}

pub fn entries() -> &'static [CodecEntry] {
    CODEC_PARAMS
}

/// Candidate pixel formats in preference order for the requested
/// subsampling and the input's interlacing.
pub fn pixfmt_candidates(subsampling: Subsampling, interlacing: Interlacing) -> Vec<Pixel> {
    let mut candidates = Vec::new();
    match subsampling {
        Subsampling::Auto => {
            if interlacing == Interlacing::InterlacedMerged {
                // interlaced 4:2:0 subsamples chroma across fields and looks
                // poor, prefer 4:2:2 and 4:4:4
                candidates.extend_from_slice(FMTS422);
                candidates.extend_from_slice(FMTS444);
                candidates.extend_from_slice(FMTS420);
            } else {
                candidates.extend_from_slice(FMTS420);
                candidates.extend_from_slice(FMTS422);
                candidates.extend_from_slice(FMTS444);
            }
        }
        Subsampling::S420 => candidates.extend_from_slice(FMTS420),
        Subsampling::S422 => candidates.extend_from_slice(FMTS422),
        Subsampling::S444 => candidates.extend_from_slice(FMTS444),
    }
    candidates
}

/// Pick the first candidate the backend accepts. The `nvenc` backend is
/// pinned to NV12, the other formats are broken with it.
pub fn select_pixel_format<F>(
    subsampling: Subsampling,
    interlacing: Interlacing,
    backend_name: &str,
    accepts: F,
) -> Option<Pixel>
where
    F: Fn(Pixel) -> bool,
{
    if backend_name == "nvenc" {
        log::warn!("using NV12: other pixel formats seem to be broken with NVENC");
        return accepts(Pixel::NV12).then_some(Pixel::NV12);
    }
    pixfmt_candidates(subsampling, interlacing)
        .into_iter()
        .find(|format| accepts(*format))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_rows_match_engine_codecs() {
        assert_eq!(
            lookup(Codec::H264).unwrap().preferred_encoder,
            Some("libx264")
        );
        assert!(lookup(Codec::H265).unwrap().preferred_encoder.is_none());
        assert!((lookup(Codec::Mjpg).unwrap().avg_bpp - 1.2).abs() < f64::EPSILON);
        assert!(lookup(Codec::Rgba).is_none());
    }

    #[test]
    fn interlaced_auto_prefers_422_over_420() {
        // backend accepting only 4:2:0 and 4:2:2 planar formats
        let accepts = |f: Pixel| matches!(f, Pixel::YUV420P | Pixel::YUV422P);
        let picked = select_pixel_format(
            Subsampling::Auto,
            Interlacing::InterlacedMerged,
            "libx264",
            accepts,
        );
        assert_eq!(picked, Some(Pixel::YUV422P));
    }

    #[test]
    fn progressive_auto_prefers_420() {
        let accepts = |f: Pixel| matches!(f, Pixel::YUV420P | Pixel::YUV422P);
        let picked = select_pixel_format(
            Subsampling::Auto,
            Interlacing::Progressive,
            "libx264",
            accepts,
        );
        assert_eq!(picked, Some(Pixel::YUV420P));
    }

    #[test]
    fn explicit_subsampling_restricts_candidates() {
        let accepts = |f: Pixel| matches!(f, Pixel::YUV420P);
        let picked = select_pixel_format(
            Subsampling::S444,
            Interlacing::Progressive,
            "libx264",
            accepts,
        );
        assert_eq!(picked, None);
    }

    #[test]
    fn nvenc_is_pinned_to_nv12() {
        let accepts = |_: Pixel| true;
        let picked = select_pixel_format(
            Subsampling::Auto,
            Interlacing::Progressive,
            "nvenc",
            accepts,
        );
        assert_eq!(picked, Some(Pixel::NV12));
    }
}
