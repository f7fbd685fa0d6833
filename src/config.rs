//! Command line interface and validated runtime configuration.

use std::path::PathBuf;

use clap::Parser;

use crate::capture::{self, CaptureConfig, ControlMode, DeviceControls, IoMethod};
use crate::encoder::EncoderType;
use crate::server::ServerConfig;
use crate::stream::StreamConfig;

#[derive(Parser, Debug)]
#[command(name = "vstreamd")]
#[command(about = "Low-latency V4L2 MJPEG/H.264 streamer over multipart HTTP")]
#[command(version)]
pub struct Cli {
    /// V4L2 capture device node
    #[arg(short = 'd', long, default_value = "/dev/video0")]
    pub device: PathBuf,

    /// Input channel number
    #[arg(long)]
    pub input: Option<u32>,

    /// Requested resolution, e.g. 1280x720
    #[arg(short = 'r', long, default_value = "640x480")]
    pub resolution: String,

    /// Capture format: YUYV, UYVY, RGB565, RGB24, MJPEG, JPEG, ...
    #[arg(short = 'm', long, default_value = "YUYV")]
    pub format: String,

    /// TV standard: PAL, NTSC, SECAM
    #[arg(long)]
    pub tv_standard: Option<String>,

    /// Streaming I/O method: MMAP or USERPTR
    #[arg(long, default_value = "MMAP")]
    pub io_method: String,

    /// Driver FPS hint, 0 means as fast as possible
    #[arg(short = 'f', long, default_value_t = 0)]
    pub desired_fps: u32,

    /// Number of capture buffers, 0 means cores + 1
    #[arg(short = 'b', long, default_value_t = 0)]
    pub buffers: u32,

    /// Number of encoder workers, 0 means one per buffer
    #[arg(short = 'w', long, default_value_t = 0)]
    pub workers: u32,

    /// JPEG quality 1..100
    #[arg(short = 'q', long, default_value_t = 80)]
    pub quality: u32,

    /// Encoder backend: CPU, HW, NOOP
    #[arg(short = 'c', long, default_value = "CPU")]
    pub encoder: String,

    /// Negotiate DV-timings and follow source changes
    #[arg(long)]
    pub dv_timings: bool,

    /// Keep the device open across frame timeouts
    #[arg(long)]
    pub persistent: bool,

    /// Swap RGB24/BGR24 reported by a buggy bridge
    #[arg(long)]
    pub format_swap_rgb: bool,

    /// Accept JPEG frames without a proper end marker
    #[arg(long)]
    pub allow_truncated_frames: bool,

    /// Drop frames smaller than this many bytes
    #[arg(long, default_value_t = 128)]
    pub min_frame_size: u32,

    /// Pass only every Nth captured frame to the encoders
    #[arg(long, default_value_t = 1)]
    pub every_frame: u32,

    /// Frame wait timeout in seconds
    #[arg(long, default_value_t = 1)]
    pub timeout: u32,

    /// Seconds to sleep before reopening a failed device
    #[arg(long, default_value_t = 1)]
    pub error_delay: u32,

    /// Export capture buffers as DMA handles
    #[arg(long)]
    pub dma_export: bool,

    /// Fail when DMA export is unavailable
    #[arg(long)]
    pub dma_required: bool,

    // Image controls, each `auto`, `default` or a number.
    #[arg(long)]
    pub brightness: Option<String>,
    #[arg(long)]
    pub contrast: Option<String>,
    #[arg(long)]
    pub saturation: Option<String>,
    #[arg(long)]
    pub hue: Option<String>,
    #[arg(long)]
    pub gamma: Option<String>,
    #[arg(long)]
    pub sharpness: Option<String>,
    #[arg(long)]
    pub backlight_compensation: Option<String>,
    #[arg(long)]
    pub white_balance: Option<String>,
    #[arg(long)]
    pub gain: Option<String>,
    #[arg(long)]
    pub color_effect: Option<String>,
    #[arg(long)]
    pub rotate: Option<String>,
    #[arg(long)]
    pub flip_vertical: Option<String>,
    #[arg(long)]
    pub flip_horizontal: Option<String>,

    /// HTTP bind host
    #[arg(short = 's', long, default_value = "127.0.0.1")]
    pub host: String,

    /// HTTP bind port
    #[arg(short = 'p', long, default_value_t = 8080)]
    pub port: u16,

    /// Bind to a UNIX socket instead of TCP
    #[arg(long)]
    pub unix: Option<PathBuf>,

    /// Remove an existing UNIX socket file before binding
    #[arg(long)]
    pub unix_rm: bool,

    /// Permissions for the UNIX socket, octal
    #[arg(long)]
    pub unix_mode: Option<String>,

    /// Accept the listen socket from systemd (LISTEN_FDS)
    #[arg(long)]
    pub systemd: bool,

    /// HTTP basic auth user
    #[arg(long)]
    pub user: Option<String>,

    /// HTTP basic auth password
    #[arg(long, default_value = "")]
    pub passwd: String,

    /// Serve static files from this directory instead of the index page
    #[arg(long = "static")]
    pub static_path: Option<PathBuf>,

    /// JPEG file to show while the source is offline
    #[arg(long)]
    pub blank: Option<PathBuf>,

    /// Freeze the last frame when going offline: -1 off, 0 forever, N seconds
    #[arg(long, default_value_t = -1)]
    pub last_as_blank: i64,

    /// Suppress up to N consecutive identical frames
    #[arg(long, default_value_t = 0)]
    pub drop_same_frames: u32,

    /// Limit capture to 1 fps while no stream clients are connected
    #[arg(long)]
    pub slowdown: bool,

    /// JPEG shared-memory sink name
    #[arg(long)]
    pub sink: Option<String>,

    /// Sink object permissions, octal
    #[arg(long, default_value = "660")]
    pub sink_mode: String,

    /// Remove sink objects on shutdown
    #[arg(long)]
    pub sink_rm: bool,

    /// Seconds a sink client is considered alive after its last read
    #[arg(long, default_value_t = 10)]
    pub sink_client_ttl: u32,

    /// H.264 shared-memory sink name
    #[arg(long)]
    pub h264_sink: Option<String>,

    /// H.264 bitrate in Kbit/s
    #[arg(long, default_value_t = 5000)]
    pub h264_bitrate: u32,

    /// H.264 group-of-pictures length
    #[arg(long, default_value_t = 30)]
    pub h264_gop: u32,

    /// DRM device for the framebuffer output
    #[cfg(feature = "drm-output")]
    #[arg(long)]
    pub drm_device: Option<PathBuf>,

    /// DRM connector port name, e.g. HDMI-A-1
    #[cfg(feature = "drm-output")]
    #[arg(long, default_value = "HDMI-A-1")]
    pub drm_port: String,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

/// Validated sink settings.
#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub name: String,
    pub mode: u32,
    pub rm: bool,
    pub client_ttl: f64,
}

/// Everything `main()` needs to wire the process together.
pub struct AppConfig {
    pub stream: StreamConfig,
    pub server: ServerConfig,
    pub jpeg_sink: Option<SinkSettings>,
    pub h264_sink: Option<SinkSettings>,
    pub h264_bitrate: u32,
    pub h264_gop: u32,
    #[cfg(feature = "drm-output")]
    pub drm: Option<crate::drm::DrmConfig>,
    pub verbose: bool,
}

fn parse_resolution(s: &str) -> Result<(u32, u32), String> {
    let (width, height) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("invalid resolution: {s}, expected WxH"))?;
    let width: u32 = width
        .parse()
        .map_err(|_| format!("invalid resolution width: {width}"))?;
    let height: u32 = height
        .parse()
        .map_err(|_| format!("invalid resolution height: {height}"))?;
    if width == 0 || height == 0 {
        return Err(format!("resolution must be positive: {s}"));
    }
    Ok((width, height))
}

fn parse_octal(s: &str, what: &str) -> Result<u32, String> {
    u32::from_str_radix(s, 8).map_err(|_| format!("invalid octal {what}: {s}"))
}

fn parse_control(value: &Option<String>, what: &str) -> Result<ControlMode, String> {
    match value {
        None => Ok(ControlMode::Skip),
        Some(s) => ControlMode::parse(s)
            .ok_or_else(|| format!("invalid {what}: {s}, expected auto, default or a number")),
    }
}

impl Cli {
    /// Validates all arguments into the runtime configuration.
    pub fn into_config(self) -> Result<AppConfig, String> {
        let (width, height) = parse_resolution(&self.resolution)?;
        let format = capture::parse_format(&self.format)
            .ok_or_else(|| format!("unknown format: {}", self.format))?;
        let standard = match &self.tv_standard {
            None => capture::sys::V4L2_STD_UNKNOWN,
            Some(s) => {
                capture::parse_standard(s).ok_or_else(|| format!("unknown tv standard: {s}"))?
            }
        };
        let io_method = IoMethod::parse(&self.io_method)
            .ok_or_else(|| format!("unknown io method: {}", self.io_method))?;
        let encoder_type = EncoderType::parse(&self.encoder)?;

        if !(1..=100).contains(&self.quality) {
            return Err(format!("quality must be in 1..100: {}", self.quality));
        }
        if self.every_frame == 0 {
            return Err("every-frame must be at least 1".into());
        }
        if self.timeout == 0 {
            return Err("timeout must be at least 1 second".into());
        }
        if self.h264_bitrate == 0 {
            return Err("h264 bitrate must be positive".into());
        }

        let controls = DeviceControls {
            brightness: parse_control(&self.brightness, "brightness")?,
            contrast: parse_control(&self.contrast, "contrast")?,
            saturation: parse_control(&self.saturation, "saturation")?,
            hue: parse_control(&self.hue, "hue")?,
            gamma: parse_control(&self.gamma, "gamma")?,
            sharpness: parse_control(&self.sharpness, "sharpness")?,
            backlight_compensation: parse_control(
                &self.backlight_compensation,
                "backlight-compensation",
            )?,
            white_balance: parse_control(&self.white_balance, "white-balance")?,
            gain: parse_control(&self.gain, "gain")?,
            color_effect: parse_control(&self.color_effect, "color-effect")?,
            rotate: parse_control(&self.rotate, "rotate")?,
            flip_vertical: parse_control(&self.flip_vertical, "flip-vertical")?,
            flip_horizontal: parse_control(&self.flip_horizontal, "flip-horizontal")?,
        };

        let capture = CaptureConfig {
            path: self.device,
            width,
            height,
            format,
            jpeg_quality: self.quality,
            standard,
            input: self.input,
            dv_timings: self.dv_timings,
            persistent: self.persistent,
            format_swap_rgb: self.format_swap_rgb,
            allow_truncated_frames: self.allow_truncated_frames,
            io_method,
            n_bufs: self.buffers,
            desired_fps: self.desired_fps,
            min_frame_size: self.min_frame_size,
            timeout: self.timeout,
            dma_export: self.dma_export,
            dma_required: self.dma_required,
            controls,
        };

        let stream = StreamConfig {
            capture,
            encoder_type,
            quality: self.quality,
            workers: self.workers as usize,
            every_frame: self.every_frame,
            error_delay: self.error_delay.max(1),
            slowdown: self.slowdown,
            desired_fps: self.desired_fps,
        };

        let unix_mode = match &self.unix_mode {
            None => None,
            Some(s) => Some(parse_octal(s, "unix mode")?),
        };
        let server = ServerConfig {
            host: self.host,
            port: self.port,
            unix_path: self.unix,
            unix_rm: self.unix_rm,
            unix_mode,
            systemd: self.systemd,
            user: self.user,
            passwd: self.passwd,
            static_path: self.static_path,
            drop_same_frames: self.drop_same_frames,
            last_as_blank: self.last_as_blank,
            blank_path: self.blank,
            desired_fps: self.desired_fps,
        };

        let sink_mode = parse_octal(&self.sink_mode, "sink mode")?;
        let make_sink = |name: &Option<String>| {
            name.as_ref().map(|name| SinkSettings {
                name: name.clone(),
                mode: sink_mode,
                rm: self.sink_rm,
                client_ttl: self.sink_client_ttl as f64,
            })
        };
        let jpeg_sink = make_sink(&self.sink);
        let h264_sink = make_sink(&self.h264_sink);

        #[cfg(feature = "drm-output")]
        let drm = self.drm_device.as_ref().map(|path| crate::drm::DrmConfig {
            path: path.clone(),
            port: self.drm_port.clone(),
            timeout: 1.0,
        });

        Ok(AppConfig {
            stream,
            server,
            jpeg_sink,
            h264_sink,
            h264_bitrate: self.h264_bitrate,
            h264_gop: self.h264_gop,
            #[cfg(feature = "drm-output")]
            drm,
            verbose: self.verbose,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<AppConfig, String> {
        let mut argv = vec!["vstreamd"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv)
            .map_err(|err| err.to_string())
            .and_then(Cli::into_config)
    }

    #[test]
    fn test_defaults() {
        let config = parse(&[]).unwrap();
        assert_eq!(config.stream.capture.width, 640);
        assert_eq!(config.stream.capture.height, 480);
        assert_eq!(config.stream.quality, 80);
        assert_eq!(config.server.port, 8080);
        assert!(config.jpeg_sink.is_none());
    }

    #[test]
    fn test_resolution_parsing() {
        let config = parse(&["--resolution", "1920x1080"]).unwrap();
        assert_eq!(config.stream.capture.width, 1920);
        assert_eq!(config.stream.capture.height, 1080);

        assert!(parse(&["--resolution", "1920"]).is_err());
        assert!(parse(&["--resolution", "0x1080"]).is_err());
        assert!(parse(&["--resolution", "axb"]).is_err());
    }

    #[test]
    fn test_quality_range() {
        assert!(parse(&["--quality", "100"]).is_ok());
        assert!(parse(&["--quality", "0"]).is_err());
        assert!(parse(&["--quality", "101"]).is_err());
    }

    #[test]
    fn test_unknown_format_rejected() {
        assert!(parse(&["--format", "NV999"]).is_err());
    }

    #[test]
    fn test_encoder_names() {
        assert!(parse(&["--encoder", "cpu"]).is_ok());
        assert!(parse(&["--encoder", "noop"]).is_ok());
        assert!(parse(&["--encoder", "M2M-VIDEO"]).is_err());
    }

    #[test]
    fn test_sink_settings() {
        let config = parse(&["--sink", "test", "--sink-mode", "644", "--sink-rm"]).unwrap();
        let sink = config.jpeg_sink.unwrap();
        assert_eq!(sink.name, "test");
        assert_eq!(sink.mode, 0o644);
        assert!(sink.rm);
    }

    #[test]
    fn test_controls() {
        let config = parse(&["--brightness", "auto", "--contrast", "42"]).unwrap();
        assert_eq!(config.stream.capture.controls.brightness, ControlMode::Auto);
        assert_eq!(
            config.stream.capture.controls.contrast,
            ControlMode::Value(42)
        );
        assert!(parse(&["--brightness", "sometimes"]).is_err());
    }

    #[test]
    fn test_bad_octal_rejected() {
        assert!(parse(&["--sink", "t", "--sink-mode", "9"]).is_err());
    }
}
