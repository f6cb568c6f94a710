pub mod pool;
pub mod portal;
pub mod video;

/// Message sent over the PipeWire channel to stop the capture loop.
pub struct Terminate {}
