use std::error::Error;
use std::fmt;
use std::io;

/// Errors raised while setting up or running the screen-capture pipeline.
#[derive(Debug)]
pub enum CaptureError {
    /// Unrecognised or malformed option token
    Config(String),
    /// The user cancelled the portal picker dialog
    PortalDenied,
    /// Any other portal failure (timeout, permission, missing backend)
    PortalFailed(String),
    /// Low-level session bus failure
    Bus(String),
    /// No acceptable pixel format / buffer layout could be negotiated
    MediaNegotiation(String),
    /// Blank-frame starvation; recoverable, the buffer is dropped
    Backpressure,
    /// I/O errors (restore-token file)
    Io(io::Error),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CaptureError::PortalDenied => write!(f, "Portal request cancelled by user"),
            CaptureError::PortalFailed(msg) => write!(f, "Portal error: {}", msg),
            CaptureError::Bus(msg) => write!(f, "Session bus error: {}", msg),
            CaptureError::MediaNegotiation(msg) => write!(f, "Stream negotiation error: {}", msg),
            CaptureError::Backpressure => write!(f, "No blank frame available"),
            CaptureError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl Error for CaptureError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            CaptureError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for CaptureError {
    fn from(err: io::Error) -> Self {
        CaptureError::Io(err)
    }
}

impl From<zbus::Error> for CaptureError {
    fn from(err: zbus::Error) -> Self {
        CaptureError::Bus(err.to_string())
    }
}

impl From<zbus::zvariant::Error> for CaptureError {
    fn from(err: zbus::zvariant::Error) -> Self {
        CaptureError::Bus(err.to_string())
    }
}

impl From<pipewire::Error> for CaptureError {
    fn from(err: pipewire::Error) -> Self {
        CaptureError::MediaNegotiation(err.to_string())
    }
}

pub type CaptureResult<T> = std::result::Result<T, CaptureError>;

/// Errors raised by the compression stage.
#[derive(Debug)]
pub enum EncoderError {
    /// Unrecognised or malformed option token
    Config(String),
    /// Requested encoder backend is not present in the codec library
    NoEncoder(String),
    /// No pixel format acceptable to both sides
    NoPixelFormat,
    /// Context allocation / open failure
    Init(String),
    /// Encode call failed; the frame is dropped, the encoder survives
    Encode(String),
    /// Errors from the codec library
    Ffmpeg(ffmpeg_next::Error),
}

impl fmt::Display for EncoderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncoderError::Config(msg) => write!(f, "Configuration error: {}", msg),
            EncoderError::NoEncoder(name) => write!(f, "Encoder not found: {}", name),
            EncoderError::NoPixelFormat => write!(f, "Unable to find a suitable pixel format"),
            EncoderError::Init(msg) => write!(f, "Encoder initialization error: {}", msg),
            EncoderError::Encode(msg) => write!(f, "Encoding error: {}", msg),
            EncoderError::Ffmpeg(err) => write!(f, "FFmpeg error: {}", err),
        }
    }
}

impl Error for EncoderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            EncoderError::Ffmpeg(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ffmpeg_next::Error> for EncoderError {
    fn from(err: ffmpeg_next::Error) -> Self {
        EncoderError::Ffmpeg(err)
    }
}

pub type EncoderResult<T> = std::result::Result<T, EncoderError>;
