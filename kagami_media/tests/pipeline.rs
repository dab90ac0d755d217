//! End-to-end frame ownership under a realistic producer/consumer cadence.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kagami_media::{FrameQueue, Mailbox};

#[test]
fn no_frames_leak_under_load() {
    let queue = FrameQueue::new(8, 8, 320, 240);
    let mailbox = Arc::new(Mailbox::new(queue.pool().clone()));
    let producer_done = Arc::new(AtomicBool::new(false));

    // Producer: one frame per millisecond, pushed through the ring and
    // promoted into the mailbox like the decoder does.
    let producer = {
        let queue = queue.clone();
        let mailbox = mailbox.clone();
        let done = producer_done.clone();
        thread::spawn(move || {
            for sequence in 0..200u64 {
                if let Some(mut frame) = queue.acquire() {
                    frame.meta_mut().sequence = sequence;
                    queue.push(frame);
                    if let Some(newest) = queue.pop_adaptive() {
                        mailbox.publish(newest);
                    }
                }
                thread::sleep(Duration::from_millis(1));
            }
            done.store(true, Ordering::Release);
        })
    };

    // Consumer: drains the mailbox on a 16 ms timer, holding each frame
    // briefly the way a renderer would.
    let mut last_sequence = 0;
    while !producer_done.load(Ordering::Acquire) {
        if let Some(frame) = mailbox.take() {
            let sequence = frame.meta().sequence;
            assert!(sequence >= last_sequence, "mailbox must never go backwards");
            last_sequence = sequence;
        }
        thread::sleep(Duration::from_millis(16));
    }
    producer.join().unwrap();

    // Everything must return to the pool shortly after the producer stops.
    let deadline = Instant::now() + Duration::from_millis(100);
    loop {
        drop(mailbox.take());
        queue.clear();
        if queue.pool().used() == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "frames leaked: {} still out", queue.pool().used());
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn resize_mid_stream_never_mixes_dimensions() {
    let queue = FrameQueue::new(4, 8, 640, 480);

    for sequence in 0..3u64 {
        let mut frame = queue.acquire().unwrap();
        frame.meta_mut().sequence = sequence;
        assert!(queue.push(frame));
    }

    // Frames popped before the resize keep the old dimensions.
    let before = queue.pop().unwrap();
    assert_eq!(
        (before.geometry().width, before.geometry().height),
        (640, 480)
    );
    drop(before);

    // The decoder's resolution-change protocol: drain, then resize.
    queue.clear();
    queue.resize(1920, 1080);

    for sequence in 10..13u64 {
        let mut frame = queue.acquire().unwrap();
        frame.meta_mut().sequence = sequence;
        assert!(queue.push(frame));
    }
    while let Some(frame) = queue.pop() {
        let geometry = frame.geometry();
        assert_eq!((geometry.width, geometry.height), (1920, 1080));
        // Strides come from the same geometry; a frame can never carry
        // planes from two different allocations.
        assert!(geometry.stride_y >= 1920);
        assert!(geometry.stride_u >= 960);
    }
}
