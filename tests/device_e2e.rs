//! End-to-end capture test against a real V4L2 device.
//!
//! Needs hardware, so it only runs on demand:
//! cargo test --test device_e2e -- --ignored --nocapture

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vstream::capture::CaptureConfig;
use vstream::encoder::EncoderType;
use vstream::stream::{Pipeline, StreamConfig, StreamOutput};

#[test]
#[ignore] // Requires /dev/video0
fn test_capture_pipeline_produces_frames() {
    let config = StreamConfig {
        capture: CaptureConfig {
            path: "/dev/video0".into(),
            width: 640,
            height: 480,
            ..Default::default()
        },
        encoder_type: EncoderType::Cpu,
        quality: 80,
        workers: 2,
        every_frame: 1,
        error_delay: 1,
        slowdown: false,
        desired_fps: 30,
    };

    let output = Arc::new(StreamOutput::new());
    let stop = Arc::new(AtomicBool::new(false));

    let mut pipeline = Pipeline::new(
        config,
        Arc::clone(&output),
        None,
        None,
        Arc::clone(&stop),
    );
    let handle = std::thread::spawn(move || pipeline.run());

    // Wait for the first exposed frame.
    let deadline = Instant::now() + Duration::from_secs(10);
    let mut got_frame = false;
    while Instant::now() < deadline {
        if output.updated.load(Ordering::SeqCst) && output.online.load(Ordering::SeqCst) {
            let frame = output.frame.lock().unwrap();
            if frame.used() > 0 {
                println!(
                    "got {}x{} frame, {} bytes",
                    frame.width,
                    frame.height,
                    frame.used()
                );
                assert_eq!(&frame.data()[..2], &[0xFF, 0xD8], "not a JPEG");
                got_frame = true;
                break;
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    stop.store(true, Ordering::SeqCst);
    handle.join().unwrap();
    assert!(got_frame, "no frame captured within 10 seconds");
}
