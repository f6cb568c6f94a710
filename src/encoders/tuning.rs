//! Per-codec encoder tuning, applied to a freshly allocated context before
//! it is opened.
//!
//! The option strings reshape the backends for low-latency screen content:
//! B-frames and lookahead off, one reference, intra refresh instead of full
//! I-frames. Options whose key spelling changed between backend releases
//! are retried under the legacy key before falling back to a preset.

use std::ffi::CString;

use ffmpeg_next::{self as ffmpeg, ffi};

use crate::types::config::ThreadMode;

const DEFAULT_X264_PRESET: &str = "superfast";
const DEFAULT_NVENC_H264_PRESET: &str = "llhp";

// ultrafast equivalent plus aq-mode=2; aq-mode=0 causes posterization and
// enabling it costs some 20 % CPU
const X264_LOW_LATENCY_OPTS: &str = "no-8x8dct=1:b-adapt=0:bframes=0:no-cabac=1:\
no-deblock=1:no-mbtree=1:me=dia:no-mixed-refs=1:partitions=none:\
rc-lookahead=0:ref=1:scenecut=0:subme=0:trellis=0:aq-mode=2";

// turns off B frames, most analysis and in-loop filters; the partitioning
// options (ctu/min-cu-size) have a heavy effect on parallelism
const X265_LOW_LATENCY_OPTS: &str = "b-adapt=0:bframes=0:no-b-pyramid=1:\
no-deblock=1:no-sao=1:no-weightb=1:no-weightp=1:no-b-intra=1:\
me=dia:max-merge=1:subme=0:no-strong-intra-smoothing=1:\
rc-lookahead=2:ref=1:scenecut=0:no-cutree=1:rd=0:\
ctu=32:min-cu-size=16:max-tu-size=16:frame-threads=3:pme=1:\
keyint=180:min-keyint=120:aq-mode=0";

/// Which tuning is dispatched for a codec id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningPolicy {
    Default,
    H264,
    H265,
    Vp8,
}

/// Inputs of a tuning pass, injected by the encoder driver.
pub struct TuneParams<'a> {
    pub have_preset: bool,
    pub fps: f64,
    pub interlaced: bool,
    pub h264_no_periodic_intra: bool,
    pub cpu_count: usize,
    pub threads: ThreadMode,
    pub cuda_devices: &'a [u32],
}

impl TuningPolicy {
    pub fn apply(
        &self,
        encoder: &mut ffmpeg::codec::encoder::video::Video,
        codec: &ffmpeg::Codec,
        params: &TuneParams,
    ) {
        let ctx = unsafe { encoder.as_mut_ptr() };
        match self {
            TuningPolicy::Default => set_default(ctx, codec, params),
            TuningPolicy::H264 => set_h264(ctx, codec, params),
            TuningPolicy::H265 => set_h265(ctx, params),
            TuningPolicy::Vp8 => set_vp8(ctx, params),
        }
    }
}

fn set_default(ctx: *mut ffi::AVCodecContext, codec: &ffmpeg::Codec, params: &TuneParams) {
    let capabilities = codec.capabilities();
    match params.threads {
        ThreadMode::Slice => {
            if capabilities.contains(ffmpeg::codec::Capabilities::SLICE_THREADS) {
                unsafe {
                    // zero means a count equal to the number of virtual cores
                    (*ctx).thread_count = 0;
                    (*ctx).thread_type = ffi::FF_THREAD_SLICE as i32;
                }
            } else {
                log::warn!("codec does not support slice-based multithreading");
            }
        }
        ThreadMode::Frame => {
            if capabilities.contains(ffmpeg::codec::Capabilities::FRAME_THREADS) {
                unsafe {
                    (*ctx).thread_count = 0;
                    (*ctx).thread_type = ffi::FF_THREAD_FRAME as i32;
                }
            } else {
                log::warn!("codec does not support frame-based multithreading");
            }
        }
        ThreadMode::No | ThreadMode::Unset => {}
    }
}

fn set_h264(ctx: *mut ffi::AVCodecContext, codec: &ffmpeg::Codec, params: &TuneParams) {
    match codec.name() {
        "libx264" => {
            if !params.have_preset {
                set_opts_with_fallback(
                    ctx,
                    X264_LOW_LATENCY_OPTS,
                    "x264-params",
                    "x264opts",
                    DEFAULT_X264_PRESET,
                );
            }
            opt_set(ctx, "tune", "fastdecode,zerolatency");
            set_even_frame_size_rc(ctx, params.fps, 8.0);
            if !params.h264_no_periodic_intra {
                unsafe {
                    (*ctx).refs = 1;
                }
                opt_set(ctx, "intra-refresh", "1");
            }
        }
        "nvenc" => {
            if !params.have_preset {
                opt_set(ctx, "preset", DEFAULT_NVENC_H264_PRESET);
            }
            opt_set(ctx, "cbr", "1");
            let gpu = params.cuda_devices.first().copied().unwrap_or(0);
            opt_set(ctx, "gpu", &gpu.to_string());
            unsafe {
                (*ctx).rc_max_rate = (*ctx).bit_rate;
                (*ctx).rc_buffer_size = ((*ctx).rc_max_rate as f64 / params.fps) as i32;
            }
        }
        other => {
            log::warn!(
                "unknown encoder {}, using default configuration values",
                other
            );
        }
    }
}

fn set_h265(ctx: *mut ffi::AVCodecContext, params: &TuneParams) {
    let mut opts = String::from(X265_LOW_LATENCY_OPTS);
    if params.interlaced {
        opts.push_str(":tff=1");
    }
    set_opts_with_fallback(ctx, &opts, "x265-params", "x265opts", "ultrafast");

    opt_set(ctx, "tune", "zerolatency");
    opt_set(ctx, "tune", "fastdecode");

    set_even_frame_size_rc(ctx, params.fps, 8.0);

    unsafe {
        (*ctx).refs = 1;
    }
    opt_set(ctx, "intra-refresh", "1");
}

fn set_vp8(ctx: *mut ffi::AVCodecContext, params: &TuneParams) {
    unsafe {
        (*ctx).thread_count = params.cpu_count as i32;
        (*ctx).profile = 0;
        (*ctx).slices = 4;
        (*ctx).rc_buffer_size = ((*ctx).bit_rate as f64 / params.fps) as i32;
    }
    opt_set(ctx, "deadline", "realtime");
}

/// Rate control that keeps frame sizes as even as possible.
fn set_even_frame_size_rc(ctx: *mut ffi::AVCodecContext, fps: f64, buffer_frames: f64) {
    unsafe {
        (*ctx).rc_max_rate = (*ctx).bit_rate;
        (*ctx).rc_buffer_size = ((*ctx).rc_max_rate as f64 / fps * buffer_frames) as i32;
        (*ctx).qcompress = 0.0;
        (*ctx).qmin = 0;
        (*ctx).qmax = 69;
        (*ctx).max_qdiff = 69;
    }
}

/// Set the backend option string under `key`, retrying `legacy_key` for
/// older backend releases and finally falling back to `fallback_preset`.
fn set_opts_with_fallback(
    ctx: *mut ffi::AVCodecContext,
    opts: &str,
    key: &str,
    legacy_key: &str,
    fallback_preset: &str,
) {
    let mut ret = opt_set(ctx, key, opts);
    if ret != 0 {
        ret = opt_set(ctx, legacy_key, opts);
    }
    if ret != 0 {
        ret = opt_set(ctx, "preset", fallback_preset);
        log::warn!(
            "old codec library detected, consider upgrading; using preset {}",
            fallback_preset
        );
    }
    if ret != 0 {
        log::warn!("unable to set preset");
    }
}

fn opt_set(ctx: *mut ffi::AVCodecContext, name: &str, value: &str) -> i32 {
    let name = CString::new(name).expect("option name contains no NUL");
    let value = CString::new(value).expect("option value contains no NUL");
    unsafe { ffi::av_opt_set((*ctx).priv_data, name.as_ptr(), value.as_ptr(), 0) }
}
