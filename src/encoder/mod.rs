//! Encoder dispatch: backend selection, preparation and fallback.

pub mod convert;
pub mod cpu;
pub mod h264;
pub mod hw;

use std::sync::atomic::{AtomicU8, Ordering};

use thiserror::Error;
use tracing::{info, warn};

use crate::capture::RawFrame;
use crate::frame::{self, Frame};

pub use h264::H264Encoder;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("unsupported input format: {0}")]
    UnsupportedFormat(String),

    #[error("jpeg encoding failed: {0}")]
    Jpeg(String),

    #[error("h264 encoding failed: {0}")]
    H264(String),
}

/// Selectable JPEG pipeline backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderType {
    /// Software JPEG from raw frames.
    Cpu,
    /// Pass-through of hardware-compressed JPEG.
    Hw,
    /// No compression, frames are copied as captured.
    Noop,
}

impl EncoderType {
    /// Case-insensitive name parsing. The vendor M2M backends are known
    /// names but not part of this build.
    pub fn parse(s: &str) -> Result<Self, String> {
        match s.to_ascii_uppercase().as_str() {
            "CPU" => Ok(Self::Cpu),
            "HW" => Ok(Self::Hw),
            "NOOP" => Ok(Self::Noop),
            "M2M-VIDEO" | "M2M-IMAGE" | "OMX" => {
                Err(format!("encoder {s} is not available in this build"))
            }
            _ => Err(format!("unknown encoder: {s}")),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::Hw => "HW",
            Self::Noop => "NOOP",
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            1 => Self::Hw,
            2 => Self::Noop,
            _ => Self::Cpu,
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Cpu => 0,
            Self::Hw => 1,
            Self::Noop => 2,
        }
    }
}

/// Shared encoder dispatcher.
///
/// Workers read the active backend tag once per frame; a fallback flips the
/// tag for frames dispatched afterwards and never disturbs an encode that is
/// already running.
pub struct Encoder {
    requested: EncoderType,
    quality: u32,
    active: AtomicU8,
}

impl Encoder {
    pub fn new(requested: EncoderType, quality: u32) -> Self {
        Self {
            requested,
            quality,
            active: AtomicU8::new(requested.tag()),
        }
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }

    pub fn active_type(&self) -> EncoderType {
        EncoderType::from_tag(self.active.load(Ordering::SeqCst))
    }

    /// Reconciles the requested backend with the negotiated capture format.
    /// Called once per capture session; idempotent for an unchanged format.
    pub fn prepare(&self, format: u32) {
        let mut active = self.requested;
        if frame::is_jpeg(format) && active == EncoderType::Cpu {
            info!("input is (M)JPEG, switching to HW pass-through");
            active = EncoderType::Hw;
        } else if !frame::is_jpeg(format) && active == EncoderType::Hw {
            warn!("HW pass-through requires a (M)JPEG source, falling back to CPU");
            active = EncoderType::Cpu;
        }
        info!(encoder = active.name(), quality = self.quality, "using encoder");
        self.active.store(active.tag(), Ordering::SeqCst);
    }

    /// Compresses one grabbed buffer into `dest`.
    ///
    /// A backend failure converts the dispatcher to the software JPEG
    /// fallback for the rest of the session and reports the error so the
    /// caller can restart the frame.
    pub fn compress(
        &self,
        src: &RawFrame<'_>,
        dest: &mut Frame,
        force_key: bool,
    ) -> Result<(), EncoderError> {
        let active = self.active_type();
        dest.grab_ts = src.grab_ts;

        let result = match active {
            EncoderType::Cpu => cpu::compress(
                src.data,
                src.width,
                src.height,
                src.format,
                src.stride,
                self.quality,
                dest,
            ),
            EncoderType::Hw => hw::compress(src.data, src.width, src.height, dest),
            EncoderType::Noop => {
                dest.encode_begin_ts = crate::clock::now_monotonic();
                dest.set_data(src.data);
                dest.width = src.width;
                dest.height = src.height;
                dest.format = src.format;
                dest.stride = src.stride;
                dest.online = true;
                dest.key = true;
                dest.encode_end_ts = crate::clock::now_monotonic();
                Ok(())
            }
        };
        let _ = force_key; // Every JPEG frame is self-contained

        if let Err(ref err) = result {
            if active != EncoderType::Cpu {
                warn!(encoder = active.name(), error = %err, "encoder failed, falling back to CPU");
                self.active.store(EncoderType::Cpu.tag(), Ordering::SeqCst);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw<'a>(data: &'a [u8], format: u32) -> RawFrame<'a> {
        RawFrame {
            data,
            width: 64,
            height: 48,
            format,
            stride: if frame::is_jpeg(format) { 0 } else { 128 },
            grab_ts: 1.5,
            dma_fd: None,
        }
    }

    #[test]
    fn test_parse() {
        assert_eq!(EncoderType::parse("cpu").unwrap(), EncoderType::Cpu);
        assert_eq!(EncoderType::parse("Hw").unwrap(), EncoderType::Hw);
        assert_eq!(EncoderType::parse("NOOP").unwrap(), EncoderType::Noop);
        assert!(EncoderType::parse("M2M-VIDEO").is_err());
        assert!(EncoderType::parse("whatever").is_err());
    }

    #[test]
    fn test_prepare_switches_for_jpeg_source() {
        let encoder = Encoder::new(EncoderType::Cpu, 80);
        encoder.prepare(frame::FOURCC_MJPEG);
        assert_eq!(encoder.active_type(), EncoderType::Hw);

        encoder.prepare(frame::FOURCC_YUYV);
        assert_eq!(encoder.active_type(), EncoderType::Cpu);
    }

    #[test]
    fn test_prepare_rejects_hw_for_raw_source() {
        let encoder = Encoder::new(EncoderType::Hw, 80);
        encoder.prepare(frame::FOURCC_YUYV);
        assert_eq!(encoder.active_type(), EncoderType::Cpu);
    }

    #[test]
    fn test_hw_failure_falls_back_to_cpu() {
        let encoder = Encoder::new(EncoderType::Hw, 80);
        encoder.prepare(frame::FOURCC_MJPEG);
        assert_eq!(encoder.active_type(), EncoderType::Hw);

        // Not a JPEG payload: the pass-through must fail and flip the tag.
        let garbage = vec![0u8; 1024];
        let mut dest = Frame::new();
        assert!(encoder.compress(&raw(&garbage, frame::FOURCC_MJPEG), &mut dest, false).is_err());
        assert_eq!(encoder.active_type(), EncoderType::Cpu);
    }

    #[test]
    fn test_noop_copies() {
        let encoder = Encoder::new(EncoderType::Noop, 80);
        encoder.prepare(frame::FOURCC_YUYV);
        let data = vec![7u8; 64 * 48 * 2];
        let mut dest = Frame::new();
        encoder.compress(&raw(&data, frame::FOURCC_YUYV), &mut dest, false).unwrap();
        assert_eq!(dest.data(), &data[..]);
        assert_eq!(dest.format, frame::FOURCC_YUYV);
        assert_eq!(dest.grab_ts, 1.5);
    }

    #[test]
    fn test_cpu_sets_grab_ts() {
        let encoder = Encoder::new(EncoderType::Cpu, 80);
        encoder.prepare(frame::FOURCC_YUYV);
        let data = vec![128u8; 64 * 48 * 2];
        let mut dest = Frame::new();
        encoder.compress(&raw(&data, frame::FOURCC_YUYV), &mut dest, false).unwrap();
        assert_eq!(dest.grab_ts, 1.5);
        assert_eq!(dest.format, frame::FOURCC_JPEG);
    }
}
