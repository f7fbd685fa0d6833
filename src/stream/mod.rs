//! Stream pipeline: capture → worker pool → exposed frame.

pub mod blank;
pub mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::capture::{Capture, CaptureConfig, CaptureError};
use crate::clock;
#[cfg(feature = "drm-output")]
use crate::drm::{DrmOutput, ModeSelection, StubKind};
#[cfg(feature = "drm-output")]
use crate::encoder::convert;
use crate::encoder::{Encoder, EncoderType};
use crate::fps::FpsCounter;
use crate::frame::Frame;
use crate::sink::{H264Stream, Memsink};

use pool::WorkerPool;

/// The pipeline/HTTP handoff: the most recent completed frame plus
/// publication flags.
pub struct StreamOutput {
    pub frame: Mutex<Frame>,
    pub updated: AtomicBool,
    pub online: AtomicBool,
    pub captured_fps: FpsCounter,
    /// Set by the HTTP server while no stream clients are connected.
    pub no_clients: AtomicBool,
}

impl StreamOutput {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(Frame::new()),
            updated: AtomicBool::new(false),
            online: AtomicBool::new(false),
            captured_fps: FpsCounter::new("captured"),
            no_clients: AtomicBool::new(true),
        }
    }
}

impl Default for StreamOutput {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub capture: CaptureConfig,
    pub encoder_type: EncoderType,
    pub quality: u32,
    pub workers: usize,
    pub every_frame: u32,
    pub error_delay: u32,
    pub slowdown: bool,
    pub desired_fps: u32,
}

enum SessionEnd {
    Stopped,
    Restart,
}

pub struct Pipeline {
    config: StreamConfig,
    output: Arc<StreamOutput>,
    encoder: Arc<Encoder>,
    jpeg_sink: Option<Memsink>,
    h264: Option<H264Stream>,
    h264_tmp: Frame,
    #[cfg(feature = "drm-output")]
    drm: Option<DrmOutput>,
    /// The current session negotiated a displayable mode and format.
    #[cfg(feature = "drm-output")]
    drm_live: bool,
    /// The busy banner is up because HTTP clients own the stream.
    #[cfg(feature = "drm-output")]
    drm_busy_shown: bool,
    stop: Arc<AtomicBool>,
}

impl Pipeline {
    pub fn new(
        config: StreamConfig,
        output: Arc<StreamOutput>,
        jpeg_sink: Option<Memsink>,
        h264: Option<H264Stream>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let encoder = Arc::new(Encoder::new(config.encoder_type, config.quality));
        Self {
            config,
            output,
            encoder,
            jpeg_sink,
            h264,
            h264_tmp: Frame::new(),
            #[cfg(feature = "drm-output")]
            drm: None,
            #[cfg(feature = "drm-output")]
            drm_live: false,
            #[cfg(feature = "drm-output")]
            drm_busy_shown: false,
            stop,
        }
    }

    /// Attaches a DRM framebuffer output driven alongside the other sinks.
    #[cfg(feature = "drm-output")]
    pub fn set_drm(&mut self, drm: DrmOutput) {
        self.drm = Some(drm);
    }

    pub fn encoder(&self) -> Arc<Encoder> {
        Arc::clone(&self.encoder)
    }

    /// Outer loop: open the device, run the capture session, reopen on
    /// session-fatal errors after `error_delay`.
    pub fn run(&mut self) {
        while !self.stop.load(Ordering::SeqCst) {
            let capture = match Capture::open(&self.config.capture) {
                Ok(capture) => Arc::new(capture),
                Err(err) => {
                    match err {
                        CaptureError::NoSignal | CaptureError::NoSync => {
                            info!(error = %err, "capture source unavailable")
                        }
                        _ => warn!(error = %err, "can't initialize capture"),
                    }
                    self.set_offline();
                    self.sleep_interruptible(self.config.error_delay);
                    continue;
                }
            };

            self.encoder.prepare(capture.format());
            self.drm_session_start(&capture);
            let mut pool = WorkerPool::new(
                Arc::clone(&capture),
                Arc::clone(&self.encoder),
                self.config.workers,
            );

            let end = self.session_loop(&capture, &mut pool);
            drop(pool); // Joins the workers before the device closes
            self.set_offline();
            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Restart => {
                    info!("restarting capture session");
                }
            }
        }
        debug!("pipeline finished");
    }

    /// Inner loop: one tick = consume a finished result, then grab,
    /// admit and dispatch the next frame.
    fn session_loop(&mut self, capture: &Arc<Capture>, pool: &mut WorkerPool) -> SessionEnd {
        let mut grab_after = 0.0f64;
        let mut fluency_passed = 0u32;
        let mut every_counter = 0u32;
        let mut slowed = false;
        let mut h264_key_pending = true;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return SessionEnd::Stopped;
            }

            if self.config.slowdown {
                let idle = self.output.no_clients.load(Ordering::SeqCst);
                if idle != slowed {
                    capture.set_hw_fps(if idle { 1 } else { self.config.desired_fps });
                    slowed = idle;
                }
            }

            if !pool.wait_free(&self.stop) {
                return SessionEnd::Stopped;
            }

            if pool.oldest_done() {
                let output = &self.output;
                let jpeg_sink = &mut self.jpeg_sink;
                let consumed = pool.consume_oldest(|frame| {
                    Self::expose(output, jpeg_sink, frame);
                });
                if consumed.is_err() {
                    warn!("worker job failed, restarting session");
                    return SessionEnd::Restart;
                }
            }

            if self.stop.load(Ordering::SeqCst) {
                return SessionEnd::Stopped;
            }

            let grabbed = match capture.grab() {
                Ok(grabbed) => grabbed,
                Err(CaptureError::NoData) => continue,
                Err(err) => {
                    debug!(error = %err, "capture session ended");
                    return SessionEnd::Restart;
                }
            };
            let now = clock::now_monotonic();

            // --every-frame divider.
            if self.config.every_frame > 1 {
                every_counter += 1;
                if every_counter < self.config.every_frame {
                    debug!(
                        frame = every_counter,
                        every = self.config.every_frame,
                        "dropping frame for every-frame option"
                    );
                    let _ = capture.release(grabbed.index);
                    continue;
                }
                every_counter = 0;
            }

            // Fluency admission: smooth bursts the encoders can't sustain.
            if now < grab_after {
                fluency_passed += 1;
                debug!(passed = fluency_passed, "frame passed for fluency");
                let _ = capture.release(grabbed.index);
                continue;
            }
            fluency_passed = 0;
            self.output.captured_fps.bump(now);

            if let Some(h264) = &mut self.h264 {
                if h264.has_clients() {
                    let raw = capture.hw_frame(grabbed.index);
                    self.h264_tmp.set_data(raw.data);
                    self.h264_tmp.width = raw.width;
                    self.h264_tmp.height = raw.height;
                    self.h264_tmp.format = raw.format;
                    self.h264_tmp.stride = raw.stride;
                    self.h264_tmp.online = true;
                    self.h264_tmp.grab_ts = raw.grab_ts;
                    h264.process(&self.h264_tmp, h264_key_pending);
                    h264_key_pending = false;
                }
            }

            self.drm_expose_frame(capture, grabbed.index);

            let worker = pool
                .pick_free()
                .expect("a worker is free after wait_free()");
            pool.dispatch(worker, grabbed.index, grabbed.grab_ts);

            let fluency_delay = pool.fluency_delay();
            grab_after = now + fluency_delay;
            debug!(delay = fluency_delay, "fluency delay updated");
        }
    }

    /// Publishes a completed frame and feeds the JPEG sink.
    fn expose(output: &StreamOutput, jpeg_sink: &mut Option<Memsink>, frame: &Frame) {
        {
            let mut exposed = output.frame.lock().unwrap();
            exposed.copy_from(frame);
        }
        output.online.store(true, Ordering::SeqCst);
        output.updated.store(true, Ordering::SeqCst);

        if let Some(sink) = jpeg_sink {
            if sink.server_check(frame) {
                if let Err(err) = sink.server_put(frame) {
                    warn!(error = %err, "can't put frame into sink");
                }
            }
        }
    }

    fn set_offline(&mut self) {
        self.output.online.store(false, Ordering::SeqCst);
        self.output.updated.store(true, Ordering::SeqCst);
        self.output.captured_fps.reset();
        self.drm_show_no_signal();
    }

    /// Opens the DRM output for a fresh capture session and decides whether
    /// live frames can be shown or a diagnostic stub has to stay up.
    #[cfg(feature = "drm-output")]
    fn drm_session_start(&mut self, capture: &Capture) {
        self.drm_live = false;
        self.drm_busy_shown = false;
        let Some(drm) = &mut self.drm else {
            return;
        };
        match drm.open(Some((capture.width(), capture.height()))) {
            Ok(ModeSelection::Matched) => {
                if convert::is_convertible(capture.format()) {
                    self.drm_live = true;
                } else {
                    let _ = drm.wait_for_vsync();
                    if let Err(err) = drm.expose_stub(StubKind::BadFormat) {
                        warn!(error = %err, "can't show the bad-format stub");
                    }
                }
            }
            Ok(ModeSelection::Fallback) => {
                let _ = drm.wait_for_vsync();
                let stub = StubKind::BadResolution {
                    width: capture.width(),
                    height: capture.height(),
                    hz: capture.hz(),
                };
                if let Err(err) = drm.expose_stub(stub) {
                    warn!(error = %err, "can't show the bad-resolution stub");
                }
            }
            Err(err) => {
                warn!(error = %err, "can't open DRM output");
            }
        }
    }

    #[cfg(not(feature = "drm-output"))]
    fn drm_session_start(&mut self, _capture: &Capture) {}

    /// Flips one grabbed raw frame to the display, or keeps the busy
    /// banner up while HTTP clients consume the stream.
    #[cfg(feature = "drm-output")]
    fn drm_expose_frame(&mut self, capture: &Capture, index: usize) {
        if !self.drm_live {
            return;
        }
        let busy = !self.output.no_clients.load(Ordering::SeqCst);
        let Some(drm) = &mut self.drm else {
            return;
        };
        if let Err(err) = drm.wait_for_vsync() {
            warn!(error = %err, "display lost, disabling DRM output for this session");
            drm.close();
            self.drm_live = false;
            return;
        }

        // The display yields to the web stream; show who owns the video.
        if busy {
            if !self.drm_busy_shown {
                if let Err(err) = drm.expose_stub(StubKind::Busy) {
                    warn!(error = %err, "can't show the busy stub");
                }
                self.drm_busy_shown = true;
            }
            return;
        }
        self.drm_busy_shown = false;

        let raw = capture.hw_frame(index);
        if let Err(err) = drm.expose_raw(raw.data, raw.width, raw.height, raw.stride, raw.format) {
            warn!(error = %err, "DRM expose failed, disabling output for this session");
            drm.close();
            self.drm_live = false;
        }
    }

    #[cfg(not(feature = "drm-output"))]
    fn drm_expose_frame(&mut self, _capture: &Capture, _index: usize) {}

    /// Keeps the no-signal banner up while the source is down.
    #[cfg(feature = "drm-output")]
    fn drm_show_no_signal(&mut self) {
        self.drm_live = false;
        let Some(drm) = &mut self.drm else {
            return;
        };
        if let Err(err) = drm.ensure_no_signal() {
            debug!(error = %err, "no display for the no-signal stub");
            drm.close();
        }
    }

    #[cfg(not(feature = "drm-output"))]
    fn drm_show_no_signal(&mut self) {}

    fn sleep_interruptible(&self, seconds: u32) {
        info!(seconds, "sleeping before capture retry");
        let deadline = clock::now_monotonic() + seconds as f64;
        while clock::now_monotonic() < deadline && !self.stop.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(100));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_starts_offline() {
        let output = StreamOutput::new();
        assert!(!output.online.load(Ordering::SeqCst));
        assert!(!output.updated.load(Ordering::SeqCst));
        assert!(output.no_clients.load(Ordering::SeqCst));
    }

    #[test]
    fn test_expose_marks_updated_and_online() {
        let output = StreamOutput::new();
        let mut frame = Frame::new();
        frame.set_data(&[0xFF, 0xD8, 0xFF, 0xD9]);
        frame.width = 4;
        frame.height = 2;
        frame.online = true;

        Pipeline::expose(&output, &mut None, &frame);
        assert!(output.online.load(Ordering::SeqCst));
        assert!(output.updated.load(Ordering::SeqCst));
        let exposed = output.frame.lock().unwrap();
        assert_eq!(exposed.data(), frame.data());
        assert_eq!(exposed.width, 4);
    }
}
