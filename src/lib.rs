//! Low-latency V4L2 MJPEG/H.264 streaming.
//!
//! The pipeline captures raw frames from a Video4Linux2 device, compresses
//! them on a pool of worker threads, and fans the freshest frame out to:
//! - HTTP clients over `multipart/x-mixed-replace` (plus `/snapshot` and
//!   a JSON `/state`),
//! - a shared-memory single-producer/many-consumer sink (JPEG and H.264),
//! - optionally a DRM framebuffer.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::sync::atomic::AtomicBool;
//! use vstream::stream::{Pipeline, StreamConfig, StreamOutput};
//!
//! let output = Arc::new(StreamOutput::new());
//! let stop = Arc::new(AtomicBool::new(false));
//! let config = StreamConfig {
//!     capture: Default::default(),
//!     encoder_type: vstream::encoder::EncoderType::Cpu,
//!     quality: 80,
//!     workers: 0,
//!     every_frame: 1,
//!     error_delay: 1,
//!     slowdown: false,
//!     desired_fps: 30,
//! };
//! let mut pipeline = Pipeline::new(config, output, None, None, stop);
//! pipeline.run();
//! ```

pub mod capture;
pub mod clock;
pub mod config;
#[cfg(feature = "drm-output")]
pub mod drm;
pub mod encoder;
pub mod fps;
pub mod frame;
pub mod server;
pub mod sink;
pub mod stream;

// Re-exports for convenience
pub use capture::{Capture, CaptureConfig, CaptureError};
pub use encoder::{Encoder, EncoderType};
pub use frame::Frame;
pub use server::{Server, ServerConfig};
pub use sink::{H264Stream, Memsink};
pub use stream::{Pipeline, StreamConfig, StreamOutput};
