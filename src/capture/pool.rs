//! Recycling pool of capture frames and the conversion into them.
//!
//! Two bounded queues move frames between the PipeWire callback thread and
//! the engine's grab thread: `blank` holds empty buffers for the producer,
//! `sending` holds filled frames for the consumer. Frames never leave the
//! pool; the consumer recycles the frame it holds before taking the next
//! one.

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::types::video_frame::{Codec, Interlacing, VideoFrame};

/// Frames circulating between the PipeWire thread and the grab thread.
pub const QUEUE_SIZE: usize = 3;

/// Crop rectangle reported by the compositor, in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Cloneable handle over the `blank`/`sending` queue pair.
#[derive(Clone)]
pub struct FramePool {
    blank_tx: Sender<VideoFrame>,
    blank_rx: Receiver<VideoFrame>,
    sending_tx: Sender<VideoFrame>,
    sending_rx: Receiver<VideoFrame>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        let (blank_tx, blank_rx) = bounded(capacity);
        let (sending_tx, sending_rx) = bounded(capacity);
        Self {
            blank_tx,
            blank_rx,
            sending_tx,
            sending_rx,
        }
    }

    /// Fill the blank queue with freshly allocated RGBA frames of the
    /// negotiated geometry.
    pub fn seed(&self, width: u32, height: u32, fps: f64) {
        for _ in 0..QUEUE_SIZE {
            let frame =
                VideoFrame::alloc(width, height, Codec::Rgba, fps, Interlacing::Progressive);
            if self.blank_tx.try_send(frame).is_err() {
                log::warn!("blank queue already full while seeding the pool");
                break;
            }
        }
    }

    /// Blocking timed dequeue of an empty frame (producer side).
    pub fn take_blank(&self, timeout: Duration) -> Option<VideoFrame> {
        match self.blank_rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Return a frame to the blank queue. On overflow the frame is dropped,
    /// which only happens if the pool was over-seeded.
    pub fn recycle(&self, frame: VideoFrame) {
        if self.blank_tx.try_send(frame).is_err() {
            log::warn!("blank queue full, dropping recycled frame");
        }
    }

    /// Hand a filled frame to the consumer side.
    pub fn send_filled(&self, frame: VideoFrame) {
        if let Err(err) = self.sending_tx.try_send(frame) {
            log::warn!("sending queue full, recycling frame instead");
            self.recycle(err.into_inner());
        }
    }

    /// Blocking timed dequeue of a filled frame (consumer side).
    pub fn take_filled(&self, timeout: Duration) -> Option<VideoFrame> {
        match self.sending_rx.recv_timeout(timeout) {
            Ok(frame) => Some(frame),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn blank_len(&self) -> usize {
        self.blank_rx.len()
    }

    pub fn sending_len(&self) -> usize {
        self.sending_rx.len()
    }
}

/// Copy one compositor buffer into a pool frame, converting the channel
/// order to RGBA and optionally cropping.
///
/// `swap_red_blue` is set for BGRA/BGRx sources. The destination frame's
/// geometry is updated to the crop rectangle (or the full source size) and
/// its stride becomes `4 * width`.
pub fn copy_frame(
    swap_red_blue: bool,
    src: &[u8],
    src_width: u32,
    src_height: u32,
    crop: Option<CropRegion>,
    out: &mut VideoFrame,
) {
    match crop {
        Some(region) => copy_frame_cropped(swap_red_blue, src, src_width, region, out),
        None => copy_frame_full(swap_red_blue, src, src_width, src_height, out),
    }
}

fn copy_frame_full(
    swap_red_blue: bool,
    src: &[u8],
    width: u32,
    height: u32,
    out: &mut VideoFrame,
) {
    let linesize = width as usize * 4;
    let total = linesize * height as usize;
    let dst = out.buffer_mut();
    debug_assert!(dst.len() >= total && src.len() >= total);
    if swap_red_blue {
        swap_copy(&mut dst[..total], &src[..total]);
    } else {
        dst[..total].copy_from_slice(&src[..total]);
    }
    out.width = width;
    out.height = height;
    out.set_data_len(total);
}

fn copy_frame_cropped(
    swap_red_blue: bool,
    src: &[u8],
    src_width: u32,
    region: CropRegion,
    out: &mut VideoFrame,
) {
    let src_linesize = src_width as usize * 4;
    let dst_linesize = region.width as usize * 4;
    let dst = out.buffer_mut();
    for row in 0..region.height as usize {
        let src_off = (region.y as usize + row) * src_linesize + region.x as usize * 4;
        let dst_off = row * dst_linesize;
        let src_line = &src[src_off..src_off + dst_linesize];
        let dst_line = &mut dst[dst_off..dst_off + dst_linesize];
        if swap_red_blue {
            swap_copy(dst_line, src_line);
        } else {
            dst_line.copy_from_slice(src_line);
        }
    }
    out.width = region.width;
    out.height = region.height;
    out.set_data_len(dst_linesize * region.height as usize);
}

// rgba <- bgra
fn swap_copy(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
        d[0] = s[2];
        d[1] = s[1];
        d[2] = s[0];
        d[3] = s[3];
    }
}

/// Clamp a compositor-reported crop rectangle to the negotiated size.
/// Returns `None` for rectangles that do not intersect the frame.
pub fn clamp_crop(region: CropRegion, width: u32, height: u32) -> Option<CropRegion> {
    if region.x >= width || region.y >= height || region.width == 0 || region.height == 0 {
        return None;
    }
    Some(CropRegion {
        x: region.x,
        y: region.y,
        width: region.width.min(width - region.x),
        height: region.height.min(height - region.y),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_bgra(width: u32, height: u32) -> Vec<u8> {
        let mut src = vec![0u8; (width * height * 4) as usize];
        for y in 0..height as usize {
            for x in 0..width as usize {
                let off = (y * width as usize + x) * 4;
                src[off] = x as u8; // B
                src[off + 1] = y as u8; // G
                src[off + 2] = (x + y) as u8; // R
                src[off + 3] = 0xff; // A
            }
        }
        src
    }

    #[test]
    fn full_copy_swaps_bgra_to_rgba() {
        let src = gradient_bgra(16, 8);
        let mut frame = VideoFrame::alloc(16, 8, Codec::Rgba, 30.0, Interlacing::Progressive);
        copy_frame(true, &src, 16, 8, None, &mut frame);
        // source (B, G, R, A) at (0, 0) is (0, 0, 0, 255); at (3, 2) it is
        // (3, 2, 5, 255) and must come out as (R, G, B, A) = (5, 2, 3, 255)
        let off = (2 * 16 + 3) * 4;
        assert_eq!(&frame.data()[off..off + 4], &[5, 2, 3, 0xff]);
        assert_eq!(frame.data_len(), 16 * 8 * 4);
    }

    #[test]
    fn full_copy_without_swap_is_memcpy() {
        let src = gradient_bgra(8, 8);
        let mut frame = VideoFrame::alloc(8, 8, Codec::Rgba, 30.0, Interlacing::Progressive);
        copy_frame(false, &src, 8, 8, None, &mut frame);
        assert_eq!(frame.data(), &src[..]);
    }

    #[test]
    fn cropped_copy_remaps_rows_and_swaps() {
        let src = gradient_bgra(32, 32);
        let mut frame = VideoFrame::alloc(32, 32, Codec::Rgba, 30.0, Interlacing::Progressive);
        let region = CropRegion {
            x: 10,
            y: 20,
            width: 8,
            height: 6,
        };
        copy_frame(true, &src, 32, 32, Some(region), &mut frame);
        assert_eq!(frame.width, 8);
        assert_eq!(frame.height, 6);
        assert_eq!(frame.data_len(), 8 * 6 * 4);
        // destination (0, 0) must equal source (10, 20) with R and B swapped:
        // source BGRA (10, 20, 30, 255) -> RGBA (30, 20, 10, 255)
        assert_eq!(&frame.data()[..4], &[30, 20, 10, 0xff]);
    }

    #[test]
    fn crop_clamps_to_frame_bounds() {
        let region = CropRegion {
            x: 100,
            y: 50,
            width: 1000,
            height: 1000,
        };
        let clamped = clamp_crop(region, 640, 480).unwrap();
        assert_eq!(clamped.width, 540);
        assert_eq!(clamped.height, 430);
        assert!(clamp_crop(
            CropRegion {
                x: 700,
                y: 0,
                width: 10,
                height: 10
            },
            640,
            480
        )
        .is_none());
    }

    #[test]
    fn pool_population_is_invariant_under_produce_consume() {
        let pool = FramePool::new(QUEUE_SIZE);
        pool.seed(4, 4, 30.0);
        assert_eq!(pool.blank_len(), QUEUE_SIZE);

        let mut in_flight: Option<VideoFrame> = None;
        for _ in 0..20 {
            // producer tick
            if let Some(frame) = pool.take_blank(Duration::from_millis(10)) {
                pool.send_filled(frame);
            }
            // consumer tick
            if let Some(previous) = in_flight.take() {
                pool.recycle(previous);
            }
            in_flight = pool.take_filled(Duration::from_millis(10));

            let held = usize::from(in_flight.is_some());
            assert_eq!(pool.blank_len() + pool.sending_len() + held, QUEUE_SIZE);
        }
    }

    #[test]
    fn producer_times_out_when_blank_queue_is_starved() {
        let pool = FramePool::new(QUEUE_SIZE);
        pool.seed(4, 4, 30.0);
        // drain all blanks into sending without any consumer
        for _ in 0..QUEUE_SIZE {
            let frame = pool.take_blank(Duration::from_millis(10)).unwrap();
            pool.send_filled(frame);
        }
        assert!(pool.take_blank(Duration::from_millis(20)).is_none());
        assert_eq!(pool.sending_len(), QUEUE_SIZE);
    }
}
