//! # portalcap
//!
//! `portalcap` is the screen-capture subsystem of a real-time media engine
//! for Wayland-based Linux systems. It acquires display or window contents
//! through the ScreenCast desktop portal, streams raw frames from PipeWire
//! into a recycling frame pool, and hands them to the engine's grab thread
//! at its own tick rate. A separate compression stage wraps the system
//! codec library to turn raw frames into coded packets.
//!
//! ## Features
//!
//! - ScreenCast portal handshake with restore-token persistence
//! - PipeWire format/buffer negotiation with window cropping
//! - Lock-free producer/consumer frame pool with best-effort frame drop
//! - H.264 / H.265 / MJPEG / JPEG 2000 / VP8 encoding with per-codec
//!   low-latency tuning
//! - CPU-parallel pixel-format conversion
//!
//! ## Example
//!
//! ```no_run
//! use portalcap::types::config::{CaptureOptions, EncoderOptions, EngineContext};
//! use portalcap::{LavcEncoder, ScreenCapture};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut capture = ScreenCapture::init(CaptureOptions::default())?;
//!     let mut encoder = LavcEncoder::new(EncoderOptions::default(), EngineContext::default())?;
//!
//!     while let Some(frame) = capture.grab() {
//!         if let Some(packet) = encoder.compress(frame) {
//!             println!("coded frame of {} bytes", packet.data().len());
//!         }
//!     }
//!
//!     capture.done();
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use std::time::Duration;

use capture::pool::{FramePool, QUEUE_SIZE};
use capture::portal::{PortalSession, SessionEnd};
use capture::video::VideoCapture;
use capture::Terminate;
use types::config::CaptureOptions;
use types::error::{CaptureError, CaptureResult};
use types::video_frame::VideoFrame;

pub mod capture;
pub mod encoders;
pub mod types;

pub use encoders::LavcEncoder;

/// Capture module identification surfaced by probes.
pub const MODULE_NAME: &str = "screen_pw";
pub const MODULE_DESCRIPTION: &str = "Grabbing screen using PipeWire";

/// How long a grab waits for the next filled frame.
const GRAB_TIMEOUT: Duration = Duration::from_millis(500);

/// Running screen-capture session.
///
/// Owns the control thread (portal handshake and session watch), the
/// PipeWire loop thread and the frame pool. Frames returned by
/// [`ScreenCapture::grab`] are borrowed from the pool and recycled on the
/// next grab.
pub struct ScreenCapture {
    pool: FramePool,
    in_flight: Option<VideoFrame>,
    shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
    control_handle: Option<JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl ScreenCapture {
    /// Run portal and PipeWire setup, blocking until the stream is
    /// negotiated (or setup failed).
    pub fn init(options: CaptureOptions) -> CaptureResult<ScreenCapture> {
        log::debug!("capture init");

        let pool = FramePool::new(QUEUE_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        let (init_tx, init_rx) = mpsc::channel::<CaptureResult<()>>();
        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();

        let control_handle = std::thread::Builder::new()
            .name("screen-portal".to_string())
            .spawn({
                let pool = pool.clone();
                let closed = Arc::clone(&closed);
                move || run_control(options, pool, init_tx, shutdown_rx, closed)
            })
            .map_err(|err| CaptureError::Bus(format!("cannot spawn portal thread: {}", err)))?;

        let mut session = ScreenCapture {
            pool,
            in_flight: None,
            shutdown_tx: Some(shutdown_tx),
            control_handle: Some(control_handle),
            closed,
        };

        match init_rx.recv() {
            Ok(Ok(())) => {
                log::debug!("capture init ok");
                Ok(session)
            }
            Ok(Err(err)) => {
                session.close();
                Err(err)
            }
            Err(_) => {
                session.close();
                Err(CaptureError::Bus(
                    "capture control thread exited during setup".to_string(),
                ))
            }
        }
    }

    /// Fetch the next frame, waiting up to 500 ms. The previously returned
    /// frame is recycled into the pool first. `None` after the session was
    /// closed by the compositor or on timeout.
    pub fn grab(&mut self) -> Option<&VideoFrame> {
        if let Some(previous) = self.in_flight.take() {
            self.pool.recycle(previous);
        }
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        self.in_flight = self.pool.take_filled(GRAB_TIMEOUT);
        self.in_flight.as_ref()
    }

    /// Whether the compositor closed the session underneath us.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Stop the stream, close the portal session and join all threads.
    pub fn done(mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(());
        }
        if let Some(handle) = self.control_handle.take() {
            if let Err(err) = handle.join() {
                log::error!("capture control thread panicked: {:?}", err);
            }
        }
        self.in_flight = None;
        log::debug!("capture done");
    }
}

impl Drop for ScreenCapture {
    fn drop(&mut self) {
        self.close();
    }
}

/// Control thread: portal handshake, PipeWire thread spawn, then the
/// session watch until shutdown or compositor close.
fn run_control(
    mut options: CaptureOptions,
    pool: FramePool,
    init_tx: mpsc::Sender<CaptureResult<()>>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
    closed: Arc<AtomicBool>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            let _ = init_tx.send(Err(CaptureError::Bus(format!(
                "cannot start portal runtime: {}",
                err
            ))));
            return;
        }
    };

    let (portal, descriptor) = match runtime.block_on(PortalSession::open(&mut options)) {
        Ok(opened) => opened,
        Err(err) => {
            let _ = init_tx.send(Err(err));
            return;
        }
    };

    let (pw_terminate_tx, pw_terminate_rx) = pipewire::channel::channel();
    let video = VideoCapture::new(options, pool, init_tx.clone());
    let thread_init_tx = init_tx.clone();
    let pw_handle = match std::thread::Builder::new()
        .name("screen-pw".to_string())
        .spawn(move || {
            if let Err(err) = video.run(descriptor.fd, descriptor.node_id, pw_terminate_rx) {
                log::error!("capture loop failed: {}", err);
                let _ = thread_init_tx.send(Err(err));
            }
        }) {
        Ok(handle) => handle,
        Err(err) => {
            let _ = init_tx.send(Err(CaptureError::Bus(format!(
                "cannot spawn capture thread: {}",
                err
            ))));
            runtime.block_on(portal.close());
            return;
        }
    };

    // handshake done; stay around watching for the compositor closing the
    // session until the facade shuts us down
    let end = runtime.block_on(portal.wait_closed(shutdown_rx));
    if end == SessionEnd::CompositorClosed {
        closed.store(true, Ordering::Release);
    }

    let _ = pw_terminate_tx.send(Terminate {});
    if let Err(err) = pw_handle.join() {
        log::error!("capture loop thread panicked: {:?}", err);
    }
    runtime.block_on(portal.close());
}
