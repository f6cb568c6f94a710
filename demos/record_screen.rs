use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use portalcap::types::config::{
    CaptureOptions, EncoderOptions, EngineContext, InitCode, ParseOutcome,
};
use portalcap::{LavcEncoder, ScreenCapture};

/// Capture the screen and push every frame through the encoder, printing
/// packet sizes until interrupted.
///
/// Usage: record_screen [capture-options] [encode-options]
/// e.g.   record_screen cursor:fps=30 codec=H.264:bitrate=8M
fn main() {
    simple_logging::log_to_stderr(log::LevelFilter::Info);

    let mut args = std::env::args().skip(1);
    let capture_fmt = args.next().unwrap_or_default();
    let encode_fmt = args.next().unwrap_or_else(|| "codec=H.264".to_string());

    let code = run(&capture_fmt, &encode_fmt);
    std::process::exit(match code {
        InitCode::Ok | InitCode::NoErr => 0,
        InitCode::Fail | InitCode::AudioNotSupported => 1,
    });
}

fn run(capture_fmt: &str, encode_fmt: &str) -> InitCode {
    let capture_options = match CaptureOptions::parse(capture_fmt) {
        Ok(ParseOutcome::Parsed(options)) => options,
        Ok(ParseOutcome::HelpShown) => return InitCode::NoErr,
        Err(err) => {
            log::error!("{}", err);
            return InitCode::Fail;
        }
    };
    let encoder_options = match EncoderOptions::parse(encode_fmt) {
        Ok(ParseOutcome::Parsed(options)) => options,
        Ok(ParseOutcome::HelpShown) => return InitCode::NoErr,
        Err(err) => {
            log::error!("{}", err);
            return InitCode::Fail;
        }
    };

    let mut capture = match ScreenCapture::init(capture_options) {
        Ok(capture) => capture,
        Err(err) => {
            log::error!("{}", err);
            return InitCode::Fail;
        }
    };
    let mut encoder = match LavcEncoder::new(encoder_options, EngineContext::default()) {
        Ok(encoder) => encoder,
        Err(err) => {
            log::error!("{}", err);
            return InitCode::Fail;
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let ctrlc_stop = Arc::clone(&stop);
    ctrlc::set_handler(move || {
        println!("stopping...");
        ctrlc_stop.store(true, Ordering::Release);
    })
    .expect("cannot install signal handler");

    let mut grabbed: u64 = 0;
    let mut coded: u64 = 0;
    while !stop.load(Ordering::Acquire) && !capture.is_closed() {
        let Some(frame) = capture.grab() else {
            continue;
        };
        grabbed += 1;
        if let Some(packet) = encoder.compress(frame) {
            coded += 1;
            log::info!(
                "frame {} -> packet {} ({} bytes, pts {:?})",
                grabbed,
                coded,
                packet.data().len(),
                packet.pts
            );
        }
    }

    capture.done();
    log::info!("grabbed {} frames, encoded {}", grabbed, coded);
    InitCode::Ok
}
