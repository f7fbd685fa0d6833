//! The HTTP-exposed frame and its refresh-tick state machine:
//! drop-same-frames suppression and the offline placeholder handling.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::clock;
use crate::frame::{frames_equal, Frame};
use crate::stream::StreamOutput;

/// Ceiling for placeholder refreshes while offline, so idle clients still
/// get an occasional frame.
const BLANK_DROP_FLOOR: u32 = 10;

/// What a single refresh tick produced, fanned out to the client tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Refresh {
    /// The pipeline published something since the last tick.
    pub stream_updated: bool,
    /// The exposed frame actually changed and should be written out.
    pub frame_updated: bool,
}

pub struct Exposed {
    pub frame: Frame,
    pub online: bool,
    pub dropped: u32,
    pub captured_fps: u32,
    pub queued_fps: u32,
    pub expose_begin_ts: f64,
    pub expose_cmp_ts: f64,
    pub expose_end_ts: f64,
    last_as_blank_ts: f64,
}

pub struct Refresher {
    output: Arc<StreamOutput>,
    exposed: Mutex<Exposed>,
    blank: Frame,
    drop_same_frames: u32,
    drop_same_frames_blank: u32,
    /// `<0` disabled, `0` freeze the last frame forever, `>0` freeze seconds.
    last_as_blank: i64,
    queued_accum: Mutex<(u32, i64)>,
}

impl Refresher {
    pub fn new(
        output: Arc<StreamOutput>,
        blank: Frame,
        drop_same_frames: u32,
        last_as_blank: i64,
    ) -> Self {
        let now = clock::now_monotonic();
        let mut initial = Frame::new();
        initial.copy_from(&blank);
        Self {
            output,
            exposed: Mutex::new(Exposed {
                frame: initial,
                online: false,
                dropped: 0,
                captured_fps: 0,
                queued_fps: 0,
                expose_begin_ts: now,
                expose_cmp_ts: now,
                expose_end_ts: now,
                last_as_blank_ts: 0.0,
            }),
            blank,
            drop_same_frames,
            drop_same_frames_blank: drop_same_frames.max(BLANK_DROP_FLOOR),
            last_as_blank,
            queued_accum: Mutex::new((0, 0)),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, Exposed> {
        self.exposed.lock().unwrap()
    }

    /// One periodic tick: pulls the pipeline's latest frame into the
    /// exposed slot, or keeps the placeholder fresh while offline.
    pub fn refresh(&self) -> Refresh {
        let mut result = Refresh::default();

        if self.output.updated.load(Ordering::SeqCst) {
            if self.output.online.load(Ordering::SeqCst) {
                let stream_frame = self.output.frame.lock().unwrap();
                result.frame_updated = self.expose_new(&stream_frame);
                self.output.updated.store(false, Ordering::SeqCst);
            } else {
                self.output.updated.store(false, Ordering::SeqCst);
                result.frame_updated = self.expose_blank();
            }
            result.stream_updated = true;
        } else if !self.exposed.lock().unwrap().online {
            result.frame_updated = self.expose_blank();
            result.stream_updated = true;
        }
        result
    }

    fn expose_new(&self, stream_frame: &Frame) -> bool {
        let mut exposed = self.exposed.lock().unwrap();
        exposed.captured_fps = self.output.captured_fps.get();
        exposed.expose_begin_ts = clock::now_monotonic();

        if self.drop_same_frames > 0 {
            if exposed.online
                && exposed.dropped < self.drop_same_frames
                && frames_equal(&exposed.frame, stream_frame)
            {
                exposed.expose_cmp_ts = clock::now_monotonic();
                exposed.expose_end_ts = exposed.expose_cmp_ts;
                exposed.dropped += 1;
                debug!(dropped = exposed.dropped, "dropped same frame");
                return false;
            }
            exposed.expose_cmp_ts = clock::now_monotonic();
        } else {
            exposed.expose_cmp_ts = exposed.expose_begin_ts;
        }

        exposed.frame.copy_from(stream_frame);
        exposed.online = true;
        exposed.dropped = 0;
        exposed.expose_end_ts = clock::now_monotonic();
        true
    }

    fn expose_blank(&self) -> bool {
        let mut exposed = self.exposed.lock().unwrap();
        let now = clock::now_monotonic();
        exposed.expose_begin_ts = now;
        exposed.expose_cmp_ts = now;

        if exposed.online {
            // The online -> offline transition.
            if self.last_as_blank < 0 {
                info!("changed picture to the blank placeholder");
                exposed.frame.copy_from(&self.blank);
            } else if self.last_as_blank > 0 {
                info!(
                    seconds = self.last_as_blank,
                    "freezing the last alive frame"
                );
                exposed.last_as_blank_ts = now;
            } else {
                info!("freezing the last alive frame forever");
            }
            return Self::finish_blank(&mut exposed);
        }

        if self.last_as_blank > 0
            && exposed.last_as_blank_ts > 0.0
            && exposed.last_as_blank_ts + (self.last_as_blank as f64) < now
        {
            info!("changed the last alive frame to the blank placeholder");
            exposed.frame.copy_from(&self.blank);
            exposed.last_as_blank_ts = 0.0;
            return Self::finish_blank(&mut exposed);
        }

        if exposed.dropped < self.drop_same_frames_blank {
            exposed.dropped += 1;
            exposed.expose_end_ts = clock::now_monotonic();
            return false;
        }
        Self::finish_blank(&mut exposed)
    }

    fn finish_blank(exposed: &mut Exposed) -> bool {
        exposed.captured_fps = 0;
        exposed.online = false;
        exposed.dropped = 0;
        exposed.expose_end_ts = clock::now_monotonic();
        true
    }

    /// Accounts one tick on which at least one client got a frame queued.
    pub fn bump_queued(&self) {
        let second = clock::floor_second(clock::now_monotonic());
        let mut accum = self.queued_accum.lock().unwrap();
        if accum.1 != second {
            let fps = accum.0;
            self.exposed.lock().unwrap().queued_fps = fps;
            *accum = (0, second);
        }
        accum.0 += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;

    fn test_frame(payload: &[u8], online: bool) -> Frame {
        let mut f = Frame::new();
        f.set_data(payload);
        f.width = 8;
        f.height = 8;
        f.format = frame::FOURCC_JPEG;
        f.online = online;
        f
    }

    fn refresher(drop_same_frames: u32, last_as_blank: i64) -> (Arc<StreamOutput>, Refresher) {
        let output = Arc::new(StreamOutput::new());
        let blank = test_frame(b"blankjpegpayload", false);
        let r = Refresher::new(Arc::clone(&output), blank, drop_same_frames, last_as_blank);
        (output, r)
    }

    fn publish(output: &StreamOutput, payload: &[u8]) {
        let mut frame = output.frame.lock().unwrap();
        let fresh = test_frame(payload, true);
        frame.copy_from(&fresh);
        drop(frame);
        output.online.store(true, Ordering::SeqCst);
        output.updated.store(true, Ordering::SeqCst);
    }

    #[test]
    fn test_fresh_frame_is_exposed() {
        let (output, refresher) = refresher(0, -1);
        publish(&output, b"frame-1");
        let tick = refresher.refresh();
        assert!(tick.stream_updated);
        assert!(tick.frame_updated);
        assert_eq!(refresher.lock().frame.data(), b"frame-1");
        assert!(refresher.lock().online);
    }

    #[test]
    fn test_idle_tick_is_quiet_while_online() {
        let (output, refresher) = refresher(0, -1);
        publish(&output, b"frame-1");
        refresher.refresh();
        let tick = refresher.refresh();
        assert!(!tick.stream_updated);
        assert!(!tick.frame_updated);
    }

    #[test]
    fn test_drop_same_frames_bound() {
        let (output, refresher) = refresher(3, -1);
        publish(&output, b"same");
        assert!(refresher.refresh().frame_updated);

        // Identical re-publications are suppressed at most 3 times.
        let mut sent = 0;
        for _ in 0..8 {
            publish(&output, b"same");
            if refresher.refresh().frame_updated {
                sent += 1;
            }
        }
        // 8 identical exposures with K=3 must send on the 4th and 8th.
        assert_eq!(sent, 2);
    }

    #[test]
    fn test_different_frame_not_dropped() {
        let (output, refresher) = refresher(5, -1);
        publish(&output, b"frame-a");
        assert!(refresher.refresh().frame_updated);
        publish(&output, b"frame-b");
        assert!(refresher.refresh().frame_updated);
    }

    #[test]
    fn test_offline_switches_to_blank() {
        let (output, refresher) = refresher(0, -1);
        publish(&output, b"frame-1");
        refresher.refresh();

        output.online.store(false, Ordering::SeqCst);
        output.updated.store(true, Ordering::SeqCst);
        let tick = refresher.refresh();
        assert!(tick.stream_updated);
        assert!(tick.frame_updated);
        let exposed = refresher.lock();
        assert!(!exposed.online);
        assert_eq!(exposed.frame.data(), b"blankjpegpayload");
    }

    #[test]
    fn test_last_as_blank_freezes_forever() {
        let (output, refresher) = refresher(0, 0);
        publish(&output, b"last-live-frame");
        refresher.refresh();

        output.online.store(false, Ordering::SeqCst);
        output.updated.store(true, Ordering::SeqCst);
        assert!(refresher.refresh().frame_updated);
        // The last live frame stays, no blank switch.
        assert_eq!(refresher.lock().frame.data(), b"last-live-frame");
    }
}
