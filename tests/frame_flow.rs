//! Producer/consumer scenarios over the capture frame pool, exercising the
//! queue pair the way the PipeWire callback and the grab thread do.

use std::thread;
use std::time::Duration;

use portalcap::capture::pool::{copy_frame, CropRegion, FramePool, QUEUE_SIZE};
use portalcap::types::video_frame::{Codec, VideoFrame};

fn produce(pool: &FramePool, source_pixel: [u8; 4], sequence: i64) -> bool {
    // mirrors the buffer callback: take a blank frame, convert, send
    let Some(mut frame) = pool.take_blank(Duration::from_millis(20)) else {
        return false;
    };
    let width = frame.width;
    let height = frame.height;
    let src: Vec<u8> = source_pixel
        .iter()
        .copied()
        .cycle()
        .take((width * height * 4) as usize)
        .collect();
    copy_frame(true, &src, width, height, None, &mut frame);
    frame.pts = Some(sequence);
    pool.send_filled(frame);
    true
}

#[test]
fn frames_arrive_in_fifo_order_in_lockstep() {
    let pool = FramePool::new(QUEUE_SIZE);
    pool.seed(16, 8, 30.0);

    let producer_pool = pool.clone();
    let producer = thread::spawn(move || {
        for sequence in 0..150 {
            while !produce(&producer_pool, [1, 2, 3, 4], sequence) {
                thread::sleep(Duration::from_millis(1));
            }
        }
    });

    let mut in_flight: Option<VideoFrame> = None;
    let mut expected = 0;
    while expected < 150 {
        if let Some(previous) = in_flight.take() {
            pool.recycle(previous);
        }
        if let Some(frame) = pool.take_filled(Duration::from_millis(500)) {
            assert_eq!(frame.pts, Some(expected));
            assert_eq!(frame.color_spec, Codec::Rgba);
            // swapped copy: BGRA (1, 2, 3, 4) -> RGBA (3, 2, 1, 4)
            assert_eq!(&frame.data()[..4], &[3, 2, 1, 4]);
            in_flight = Some(frame);
            expected += 1;
        }
    }
    producer.join().unwrap();
}

#[test]
fn backpressure_drops_at_the_producer_never_reorders() {
    let pool = FramePool::new(QUEUE_SIZE);
    pool.seed(8, 8, 30.0);

    // fast producer, slow consumer
    let producer_pool = pool.clone();
    let producer = thread::spawn(move || {
        let mut produced = Vec::new();
        for sequence in 0..60 {
            if produce(&producer_pool, [9, 9, 9, 9], sequence) {
                produced.push(sequence);
            }
            thread::sleep(Duration::from_millis(2));
        }
        produced
    });

    let mut seen = Vec::new();
    let mut in_flight: Option<VideoFrame> = None;
    for _ in 0..12 {
        if let Some(previous) = in_flight.take() {
            pool.recycle(previous);
        }
        in_flight = pool.take_filled(Duration::from_millis(50));
        if let Some(frame) = &in_flight {
            seen.push(frame.pts.unwrap());
        }
        thread::sleep(Duration::from_millis(12));
    }
    let produced = producer.join().unwrap();

    // some frames were dropped under backpressure
    assert!(produced.len() < 60);
    // the consumer saw a strictly increasing subsequence
    assert!(seen.windows(2).all(|pair| pair[0] < pair[1]));
    // the queue never exceeded its capacity
    assert!(pool.sending_len() <= QUEUE_SIZE);
}

#[test]
fn cropped_frames_carry_the_crop_geometry() {
    let pool = FramePool::new(QUEUE_SIZE);
    pool.seed(1920, 1080, 30.0);

    let mut src = vec![0u8; 1920 * 1080 * 4];
    // mark source pixel (x = 10, y = 20) in BGRA
    let off = (20 * 1920 + 10) * 4;
    src[off] = 11;
    src[off + 1] = 22;
    src[off + 2] = 33;
    src[off + 3] = 44;

    let mut frame = pool.take_blank(Duration::from_millis(20)).unwrap();
    let region = CropRegion {
        x: 10,
        y: 20,
        width: 800,
        height: 600,
    };
    copy_frame(true, &src, 1920, 1080, Some(region), &mut frame);

    assert_eq!(frame.width, 800);
    assert_eq!(frame.height, 600);
    assert_eq!(frame.data_len(), 800 * 600 * 4);
    // stride is 4 * crop width
    assert_eq!(frame.data().len() / 600, 3200);
    assert_eq!(&frame.data()[..4], &[33, 22, 11, 44]);
}
