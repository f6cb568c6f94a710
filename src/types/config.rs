use std::path::PathBuf;

use crate::types::error::{CaptureError, EncoderError};
use crate::types::video_frame::Codec;

/// Init status surfaced to the engine host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitCode {
    /// Initialization succeeded
    Ok,
    /// Nothing failed but there is no state to run (help was printed)
    NoErr,
    /// Initialization failed
    Fail,
    /// The capture module was asked for audio, which it cannot provide
    AudioNotSupported,
}

/// User options of the screen-capture module.
///
/// Parsed from the colon-separated token list of
/// `-t screen_pw[:cursor|:nocrop|:fps=<fps>|:restore=<token_file>]`.
#[derive(Debug, Clone)]
pub struct CaptureOptions {
    pub show_cursor: bool,
    pub restore_file: Option<PathBuf>,
    pub fps: Option<u32>,
    pub crop: bool,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            show_cursor: false,
            restore_file: None,
            fps: None,
            crop: true,
        }
    }
}

/// Outcome of parsing an option string: either usable options or "help was
/// printed, nothing to run".
#[derive(Debug)]
pub enum ParseOutcome<T> {
    Parsed(T),
    HelpShown,
}

impl CaptureOptions {
    pub fn parse(fmt: &str) -> Result<ParseOutcome<CaptureOptions>, CaptureError> {
        let mut options = CaptureOptions::default();
        for token in fmt.split(':').filter(|t| !t.is_empty()) {
            if token == "help" {
                print_capture_usage();
                return Ok(ParseOutcome::HelpShown);
            } else if token == "cursor" {
                options.show_cursor = true;
            } else if token == "nocrop" {
                options.crop = false;
            } else if let Some((name, value)) = token.split_once('=') {
                if name.eq_ignore_ascii_case("fps") {
                    options.fps = Some(value.parse().map_err(|_| {
                        CaptureError::Config(format!("invalid fps value: \"{}\"", value))
                    })?);
                } else if name == "restore" {
                    options.restore_file = Some(PathBuf::from(value));
                } else {
                    return Err(CaptureError::Config(format!(
                        "invalid option: \"{}\"",
                        token
                    )));
                }
            } else {
                return Err(CaptureError::Config(format!(
                    "invalid option: \"{}\"",
                    token
                )));
            }
        }
        Ok(ParseOutcome::Parsed(options))
    }
}

pub fn print_capture_usage() {
    println!("Screen capture using PipeWire and the ScreenCast desktop portal");
    println!("Usage: -t screen_pw[:cursor|:nocrop|:fps=<fps>|:restore=<token_file>]");
    println!("  cursor       - make the cursor visible (default hidden)");
    println!("  nocrop       - when capturing a window do not crop out the empty background");
    println!("  fps=<fps>    - preferred FPS passed to PipeWire (PipeWire may ignore it)");
    println!("  restore=<f>  - restore the selected window/display from a file; if not");
    println!("                 possible, show the selection dialog and save the token there");
}

/// Requested chroma subsampling; `Auto` picks per interlacing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subsampling {
    Auto,
    S420,
    S422,
    S444,
}

/// Threading mode handed to the encoder backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadMode {
    Unset,
    No,
    Frame,
    Slice,
}

/// User options of the compression stage.
///
/// Parsed from the colon-separated token list of
/// `-c libavcodec[:codec=<name>][:bitrate=<bps>|:bpp=<bpp>][:subsampling=<s>]
/// [:preset=<p>][:gop=<gop>][:h264_no_periodic_intra][:threads=<mode>]
/// [:backend=<name>]`.
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    pub codec: Codec,
    pub bitrate: Option<i64>,
    pub bpp: Option<f64>,
    pub subsampling: Subsampling,
    pub preset: Option<String>,
    pub gop: Option<u32>,
    pub h264_no_periodic_intra: bool,
    pub threads: ThreadMode,
    pub backend: Option<String>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            codec: Codec::Mjpg,
            bitrate: None,
            bpp: None,
            subsampling: Subsampling::Auto,
            preset: None,
            gop: None,
            h264_no_periodic_intra: false,
            threads: ThreadMode::Unset,
            backend: None,
        }
    }
}

impl EncoderOptions {
    pub fn parse(fmt: &str) -> Result<ParseOutcome<EncoderOptions>, EncoderError> {
        let mut options = EncoderOptions::default();
        for token in fmt.split(':').filter(|t| !t.is_empty()) {
            if token == "help" {
                print_compress_usage();
                return Ok(ParseOutcome::HelpShown);
            } else if token == "h264_no_periodic_intra" {
                options.h264_no_periodic_intra = true;
            } else if let Some((name, value)) = token.split_once('=') {
                match name {
                    "codec" => {
                        options.codec = Codec::from_name(value).ok_or_else(|| {
                            EncoderError::Config(format!("unable to find codec: \"{}\"", value))
                        })?;
                    }
                    "bitrate" => {
                        options.bitrate = Some(unit_evaluate(value).ok_or_else(|| {
                            EncoderError::Config(format!("invalid bitrate: \"{}\"", value))
                        })?);
                    }
                    "bpp" => {
                        options.bpp = Some(value.parse().map_err(|_| {
                            EncoderError::Config(format!("invalid bpp: \"{}\"", value))
                        })?);
                    }
                    "subsampling" => {
                        options.subsampling = match value {
                            "420" => Subsampling::S420,
                            "422" => Subsampling::S422,
                            "444" => Subsampling::S444,
                            _ => {
                                return Err(EncoderError::Config(
                                    "supported subsampling is 444, 422, or 420".to_string(),
                                ))
                            }
                        };
                    }
                    "preset" => options.preset = Some(value.to_string()),
                    "gop" => {
                        options.gop = Some(value.parse().map_err(|_| {
                            EncoderError::Config(format!("invalid gop: \"{}\"", value))
                        })?);
                    }
                    "threads" => {
                        options.threads = match value {
                            "no" => ThreadMode::No,
                            "frame" => ThreadMode::Frame,
                            "slice" => ThreadMode::Slice,
                            _ => {
                                return Err(EncoderError::Config(format!(
                                    "unknown thread mode: \"{}\"",
                                    value
                                )))
                            }
                        };
                    }
                    "backend" => options.backend = Some(value.to_string()),
                    _ => {
                        return Err(EncoderError::Config(format!(
                            "unknown option: \"{}\"",
                            token
                        )))
                    }
                }
            } else {
                return Err(EncoderError::Config(format!(
                    "unknown option: \"{}\"",
                    token
                )));
            }
        }
        Ok(ParseOutcome::Parsed(options))
    }
}

pub fn print_compress_usage() {
    println!("Codec library encoder usage:");
    println!(
        "\t-c libavcodec[:codec=<codec_name>][:bitrate=<bits_per_sec>|:bpp=<bits_per_pixel>]\
         [:subsampling=<subsampling>][:preset=<preset>][:gop=<gop>]\
         [:h264_no_periodic_intra][:threads=<thr_mode>][:backend=<backend>]"
    );
    println!("\t\t<codec_name> - H.264, H.265, MJPEG, J2K or VP8 (default MJPEG)");
    println!("\t\t<bits_per_sec> - requested bitrate, unit suffixes k/M/G allowed");
    println!("\t\t<subsampling> - one of 444, 422 or 420; default 420 for progressive,");
    println!("\t\t                422 for interlaced");
    println!("\t\t<preset> - codec preset, eg. ultrafast, superfast, medium for H.264");
    println!("\t\t<gop> - GOP size");
    println!("\t\th264_no_periodic_intra - do not use Periodic Intra Refresh with H.264");
    println!("\t\t<thr_mode> - one of \"no\", \"frame\" or \"slice\"");
    println!("\t\t<backend> - encoder backend (eg. nvenc or libx264 for H.264)");
}

/// Evaluate a numeric string with an optional k/M/G suffix (powers of 1000).
pub fn unit_evaluate(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let (number, multiplier) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], 1_000.0),
        Some('M') => (&value[..value.len() - 1], 1_000_000.0),
        Some('G') => (&value[..value.len() - 1], 1_000_000_000.0),
        _ => (value, 1.0),
    };
    let parsed: f64 = number.parse().ok()?;
    Some((parsed * multiplier).round() as i64)
}

/// Host context injected by the engine; the encoder never reaches for
/// process globals.
#[derive(Debug, Clone, Default)]
pub struct EngineContext {
    /// CUDA devices selected by the host, first entry used by NVENC
    pub cuda_devices: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_options_parse_all_tokens() {
        let parsed = CaptureOptions::parse("cursor:nocrop:fps=60:restore=/tmp/token").unwrap();
        let options = match parsed {
            ParseOutcome::Parsed(o) => o,
            ParseOutcome::HelpShown => panic!("help not requested"),
        };
        assert!(options.show_cursor);
        assert!(!options.crop);
        assert_eq!(options.fps, Some(60));
        assert_eq!(options.restore_file, Some(PathBuf::from("/tmp/token")));
    }

    #[test]
    fn capture_options_default_crops_without_cursor() {
        let options = match CaptureOptions::parse("").unwrap() {
            ParseOutcome::Parsed(o) => o,
            ParseOutcome::HelpShown => panic!(),
        };
        assert!(options.crop);
        assert!(!options.show_cursor);
        assert!(options.fps.is_none());
    }

    #[test]
    fn capture_options_accept_uppercase_fps() {
        let options = match CaptureOptions::parse("FPS=25").unwrap() {
            ParseOutcome::Parsed(o) => o,
            ParseOutcome::HelpShown => panic!(),
        };
        assert_eq!(options.fps, Some(25));
    }

    #[test]
    fn capture_options_reject_unknown_token() {
        assert!(matches!(
            CaptureOptions::parse("cursor:bogus"),
            Err(CaptureError::Config(_))
        ));
    }

    #[test]
    fn encoder_options_parse_full_grammar() {
        let parsed = EncoderOptions::parse(
            "codec=H.264:bitrate=8M:subsampling=422:preset=faster:gop=30:\
             h264_no_periodic_intra:threads=slice:backend=libx264",
        )
        .unwrap();
        let options = match parsed {
            ParseOutcome::Parsed(o) => o,
            ParseOutcome::HelpShown => panic!(),
        };
        assert_eq!(options.codec, Codec::H264);
        assert_eq!(options.bitrate, Some(8_000_000));
        assert_eq!(options.subsampling, Subsampling::S422);
        assert_eq!(options.preset.as_deref(), Some("faster"));
        assert_eq!(options.gop, Some(30));
        assert!(options.h264_no_periodic_intra);
        assert_eq!(options.threads, ThreadMode::Slice);
        assert_eq!(options.backend.as_deref(), Some("libx264"));
    }

    #[test]
    fn encoder_options_reject_bad_subsampling() {
        assert!(matches!(
            EncoderOptions::parse("subsampling=411"),
            Err(EncoderError::Config(_))
        ));
    }

    #[test]
    fn encoder_options_reject_unknown_codec() {
        assert!(matches!(
            EncoderOptions::parse("codec=wavelet9000"),
            Err(EncoderError::Config(_))
        ));
    }

    #[test]
    fn unit_evaluate_handles_suffixes() {
        assert_eq!(unit_evaluate("5000"), Some(5000));
        assert_eq!(unit_evaluate("8k"), Some(8_000));
        assert_eq!(unit_evaluate("2.5M"), Some(2_500_000));
        assert_eq!(unit_evaluate("1G"), Some(1_000_000_000));
        assert_eq!(unit_evaluate("junk"), None);
    }
}
