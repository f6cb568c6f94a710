pub mod lavc_encoder;
pub mod line_convert;
pub mod packers;
pub mod registry;
pub mod tuning;

pub use lavc_encoder::LavcEncoder;

/// Whether the codec library carries an H.264 encoder at all.
pub fn is_supported() -> bool {
    ffmpeg_next::init().is_ok()
        && ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::H264).is_some()
}
