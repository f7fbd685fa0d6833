//! V4L2 capture device: open/negotiate, streaming I/O, grab/release.

pub mod controls;
pub mod sys;

use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};
use std::path::PathBuf;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock;
use crate::frame::{self, fourcc_to_string};

pub use controls::{ControlMode, DeviceControls};

const VIDEO_MAX_WIDTH: u32 = 10240;
const VIDEO_MAX_HEIGHT: u32 = 4320;
const STRIDE_ALIGN: u32 = 32;
// https://stackoverflow.com/questions/2253404
const MIN_JPEG_SIZE: u32 = 125;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("no signal from source")]
    NoSignal,

    #[error("no sync on signal")]
    NoSync,

    #[error("no frame data within timeout")]
    NoData,

    #[error("capture restart required: {0}")]
    RestartRequired(&'static str),

    #[error("device error: {0}")]
    Io(#[from] io::Error),

    #[error("device not usable: {0}")]
    Unsupported(String),
}

/// V4L2 streaming I/O method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMethod {
    Mmap,
    Userptr,
}

impl IoMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "MMAP" => Some(Self::Mmap),
            "USERPTR" => Some(Self::Userptr),
            _ => None,
        }
    }

    fn memory(self) -> u32 {
        match self {
            Self::Mmap => sys::V4L2_MEMORY_MMAP,
            Self::Userptr => sys::V4L2_MEMORY_USERPTR,
        }
    }
}

pub fn parse_format(s: &str) -> Option<u32> {
    match s.to_ascii_uppercase().as_str() {
        "YUYV" => Some(frame::FOURCC_YUYV),
        "YVYU" => Some(frame::FOURCC_YVYU),
        "UYVY" => Some(frame::FOURCC_UYVY),
        "GREY" => Some(frame::FOURCC_GREY),
        "RGB565" => Some(frame::FOURCC_RGB565),
        "RGB24" => Some(frame::FOURCC_RGB24),
        "BGR24" => Some(frame::FOURCC_BGR24),
        "MJPEG" => Some(frame::FOURCC_MJPEG),
        "JPEG" => Some(frame::FOURCC_JPEG),
        _ => None,
    }
}

pub fn parse_standard(s: &str) -> Option<sys::v4l2_std_id> {
    match s.to_ascii_uppercase().as_str() {
        "UNKNOWN" => Some(sys::V4L2_STD_UNKNOWN),
        "PAL" => Some(sys::V4L2_STD_PAL),
        "NTSC" => Some(sys::V4L2_STD_NTSC),
        "SECAM" => Some(sys::V4L2_STD_SECAM),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub jpeg_quality: u32,
    pub standard: sys::v4l2_std_id,
    pub input: Option<u32>,
    pub dv_timings: bool,
    pub persistent: bool,
    pub format_swap_rgb: bool,
    pub allow_truncated_frames: bool,
    pub io_method: IoMethod,
    pub n_bufs: u32,
    pub desired_fps: u32,
    pub min_frame_size: u32,
    pub timeout: u32,
    pub dma_export: bool,
    pub dma_required: bool,
    pub controls: DeviceControls,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            format: frame::FOURCC_YUYV,
            jpeg_quality: 80,
            standard: sys::V4L2_STD_UNKNOWN,
            input: None,
            dv_timings: false,
            persistent: false,
            format_swap_rgb: false,
            allow_truncated_frames: false,
            io_method: IoMethod::Mmap,
            n_bufs: 0,
            desired_fps: 0,
            min_frame_size: 128,
            timeout: 1,
            dma_export: false,
            dma_required: false,
            controls: DeviceControls::default(),
        }
    }
}

/// Per-buffer state written by the grab path and read by whoever encodes
/// and releases the buffer.
struct HwBufState {
    /// Driver buffer descriptor saved at dequeue time, needed to requeue.
    buf: sys::v4l2_buffer,
    planes: [sys::v4l2_plane; sys::VIDEO_MAX_PLANES],
    bytesused: usize,
    grab_ts: f64,
}

/// One capture buffer slot, mmap'ed from the driver or heap-allocated.
///
/// A buffer is either queued with the driver, grabbed by the capture thread,
/// or referenced by a worker; `grabbed`/`refs` enforce those transitions.
pub struct HwBuffer {
    index: u32,
    data: *mut u8,
    allocated: usize,
    mmaped: bool,
    dma_fd: Option<RawFd>,
    grabbed: AtomicBool,
    refs: AtomicU32,
    state: Mutex<HwBufState>,
}

// Payload access is serialized by the grabbed/refs protocol above: the
// kernel never writes a buffer while it is dequeued, and only one thread
// holds a dequeued buffer at a time.
unsafe impl Send for HwBuffer {}
unsafe impl Sync for HwBuffer {}

impl HwBuffer {
    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn dma_fd(&self) -> Option<RawFd> {
        self.dma_fd
    }

    pub fn incref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn decref(&self) {
        self.refs.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A borrowed view of a grabbed capture buffer, the encoder's input.
pub struct RawFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub stride: u32,
    pub grab_ts: f64,
    pub dma_fd: Option<RawFd>,
}

/// Result of a successful grab: the freshest valid buffer index.
#[derive(Debug, Clone, Copy)]
pub struct Grabbed {
    pub index: usize,
    pub grab_ts: f64,
}

/// An open, streaming V4L2 capture session.
///
/// Everything here is immutable after `open()` except the per-buffer state,
/// so grab/release/set_hw_fps take `&self` and the session can be shared
/// with encoder workers behind an `Arc`.
pub struct Capture {
    fd: RawFd,
    io_method: IoMethod,
    capture_type: u32,
    mplane: bool,
    persistent: bool,
    allow_truncated_frames: bool,
    min_frame_size: u32,
    timeout: u32,

    width: u32,
    height: u32,
    stride: u32,
    hz: f32,
    format: u32,
    raw_size: usize,
    hw_fps: u32,
    jpeg_quality: u32,

    bufs: Vec<HwBuffer>,
    streamon: AtomicBool,
    timeout_logged: AtomicBool,
}

impl Capture {
    /// Runs the full open sequence and starts streaming.
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        debug!(path = %config.path.display(), "opening capture device");
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(&config.path)?;
        let fd = file.into_raw_fd();

        let mut cap = Self {
            fd,
            io_method: config.io_method,
            capture_type: sys::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            mplane: false,
            persistent: config.persistent,
            allow_truncated_frames: config.allow_truncated_frames,
            min_frame_size: config.min_frame_size,
            timeout: config.timeout,
            width: config.width,
            height: config.height,
            stride: 0,
            hz: 0.0,
            format: config.format,
            raw_size: 0,
            hw_fps: 0,
            jpeg_quality: 0,
            bufs: Vec::new(),
            streamon: AtomicBool::new(false),
            timeout_logged: AtomicBool::new(false),
        };

        info!(path = %config.path.display(), "using V4L2 device");
        let result = cap.open_sequence(config);
        if let Err(err) = result {
            // Drop performs the partial teardown (streamoff, unmap, close).
            drop(cap);
            return Err(err);
        }
        Ok(cap)
    }

    fn open_sequence(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        self.open_check_cap(config)?;
        self.apply_resolution(config.width, config.height, 0.0)?;
        if config.dv_timings {
            self.open_dv_timings()?;
        }
        self.open_format(config, true)?;
        self.open_hw_fps(config.desired_fps);
        self.open_jpeg_quality(config.jpeg_quality);
        match config.io_method {
            IoMethod::Mmap => self.open_io_mmap(config)?,
            IoMethod::Userptr => self.open_io_userptr(config)?,
        }
        self.queue_all_buffers()?;
        if config.dma_export && !frame::is_jpeg(self.format) {
            // No component here consumes JPEG via DMA.
            if let Err(err) = self.open_export_to_dma() {
                if config.dma_required {
                    return Err(err);
                }
                warn!(error = %err, "DMA export unavailable, continuing without");
            }
        }
        controls::apply(self.fd, &config.controls);

        let mut buf_type = self.capture_type as i32;
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_STREAMON, &mut buf_type) }
            .map_err(|err| CaptureError::Unsupported(format!("can't start capturing: {err}")))?;
        self.streamon.store(true, Ordering::SeqCst);
        info!("capturing started");
        Ok(())
    }

    fn open_check_cap(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        let mut cpb: sys::v4l2_capability = unsafe { std::mem::zeroed() };
        debug!("querying device capabilities");
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_QUERYCAP, &mut cpb) }?;

        if cpb.capabilities & sys::V4L2_CAP_VIDEO_CAPTURE != 0 {
            self.capture_type = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE;
            self.mplane = false;
            info!("using capture type: single-planar");
        } else if cpb.capabilities & sys::V4L2_CAP_VIDEO_CAPTURE_MPLANE != 0 {
            self.capture_type = sys::V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE;
            self.mplane = true;
            info!("using capture type: multi-planar");
        } else {
            return Err(CaptureError::Unsupported(
                "video capture is not supported by device".into(),
            ));
        }

        if cpb.capabilities & sys::V4L2_CAP_STREAMING == 0 {
            return Err(CaptureError::Unsupported(
                "device doesn't support streaming i/o".into(),
            ));
        }

        if !self.mplane {
            if let Some(input) = config.input {
                let mut input = input as i32;
                info!(input, "using input channel");
                unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_INPUT, &mut input) }.map_err(
                    |err| CaptureError::Unsupported(format!("can't set input channel: {err}")),
                )?;
            }
        }

        if config.standard != sys::V4L2_STD_UNKNOWN {
            let mut std_id = config.standard;
            info!(standard = std_id, "using tv standard");
            unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_STD, &mut std_id) }.map_err(|err| {
                CaptureError::Unsupported(format!("can't set video standard: {err}"))
            })?;
        }
        Ok(())
    }

    fn open_dv_timings(&mut self) -> Result<(), CaptureError> {
        let mut dv = sys::v4l2_dv_timings::zeroed();
        debug!("querying DV-timings");
        match unsafe { sys::xioctl(self.fd, sys::VIDIOC_QUERY_DV_TIMINGS, &mut dv) } {
            Ok(()) => {
                let bt = unsafe { dv.u.bt };
                let (width, height) = (bt.width, bt.height);
                let pixelclock = bt.pixelclock;
                let mut hz = 0.0f32;
                if dv.type_ == sys::V4L2_DV_BT_656_1120 {
                    let htot = bt.width + bt.hfrontporch + bt.hsync + bt.hbackporch;
                    let vtot = (bt.height + bt.vfrontporch + bt.vsync + bt.vbackporch)
                        / if bt.interlaced != 0 { 2 } else { 1 };
                    if htot > 0 && vtot > 0 {
                        hz = (pixelclock as f64 / (htot as f64 * vtot as f64)) as f32;
                    }
                }
                info!(width, height, pixelclock, hz, "detected DV-timings");

                debug!("applying DV-timings");
                unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_DV_TIMINGS, &mut dv) }.map_err(
                    |err| CaptureError::Unsupported(format!("failed to apply DV-timings: {err}")),
                )?;
                self.apply_resolution(width, height, hz)?;
            }
            Err(err) if sys::errno_is(&err, libc::ENOLINK) => return Err(CaptureError::NoSignal),
            Err(err) if sys::errno_is(&err, libc::ENOLCK) => return Err(CaptureError::NoSync),
            Err(dv_err) => {
                // Fall back to analog standard detection.
                debug!("failed to query DV-timings, trying QuerySTD");
                let mut std_id: sys::v4l2_std_id = 0;
                unsafe { sys::xioctl(self.fd, sys::VIDIOC_QUERYSTD, &mut std_id) }.map_err(
                    |std_err| {
                        CaptureError::Unsupported(format!(
                            "failed to query DV-timings ({dv_err}) and QuerySTD ({std_err})"
                        ))
                    },
                )?;
                unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_STD, &mut std_id) }.map_err(|err| {
                    CaptureError::Unsupported(format!("can't apply detected standard: {err}"))
                })?;
                debug!(standard = std_id, "applied detected video standard");
            }
        }

        let mut sub = sys::v4l2_event_subscription::zeroed();
        sub.type_ = sys::V4L2_EVENT_SOURCE_CHANGE;
        debug!("subscribing to V4L2_EVENT_SOURCE_CHANGE");
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_SUBSCRIBE_EVENT, &mut sub) }.map_err(|err| {
            CaptureError::Unsupported(format!("can't subscribe to source-change events: {err}"))
        })?;
        Ok(())
    }

    fn open_format(&mut self, config: &CaptureConfig, first: bool) -> Result<(), CaptureError> {
        let stride = align_size(self.width, STRIDE_ALIGN) * 2;

        let mut fmt = sys::v4l2_format::zeroed();
        fmt.type_ = self.capture_type;
        if self.mplane {
            let pix_mp = unsafe { &mut fmt.fmt.pix_mp };
            pix_mp.width = self.width;
            pix_mp.height = self.height;
            pix_mp.pixelformat = config.format;
            pix_mp.field = sys::V4L2_FIELD_ANY;
            pix_mp.num_planes = 1;
        } else {
            let pix = unsafe { &mut fmt.fmt.pix };
            pix.width = self.width;
            pix.height = self.height;
            pix.pixelformat = config.format;
            pix.field = sys::V4L2_FIELD_ANY;
            pix.bytesperline = stride;
        }

        debug!(
            format = %fourcc_to_string(config.format),
            stride,
            width = self.width,
            height = self.height,
            "probing device format"
        );
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_FMT, &mut fmt) }
            .map_err(|err| CaptureError::Unsupported(format!("can't set device format: {err}")))?;

        let (got_width, got_height, got_format, got_stride, got_sizeimage) = if self.mplane {
            let pix_mp = unsafe { &fmt.fmt.pix_mp };
            (
                pix_mp.width,
                pix_mp.height,
                pix_mp.pixelformat,
                pix_mp.plane_fmt[0].bytesperline,
                pix_mp.plane_fmt[0].sizeimage,
            )
        } else {
            let pix = unsafe { &fmt.fmt.pix };
            (
                pix.width,
                pix.height,
                pix.pixelformat,
                pix.bytesperline,
                pix.sizeimage,
            )
        };

        // The driver may override the resolution; retry once with its values.
        let mismatch = got_width != self.width || got_height != self.height;
        if mismatch {
            warn!(
                requested_width = self.width,
                requested_height = self.height,
                "requested resolution is unavailable"
            );
        }
        self.apply_resolution(got_width, got_height, self.hz)?;
        if first && mismatch {
            return self.open_format(config, false);
        }
        info!(width = self.width, height = self.height, "using resolution");

        if got_format != config.format {
            warn!(
                requested = %fourcc_to_string(config.format),
                got = %fourcc_to_string(got_format),
                "driver format mismatch"
            );
            if !is_supported_format(got_format) {
                return Err(CaptureError::Unsupported(format!(
                    "unsupported driver format: {}",
                    fourcc_to_string(got_format)
                )));
            }
            info!(format = %fourcc_to_string(got_format), "falling back to driver format");
        }
        self.format = got_format;

        if config.format_swap_rgb {
            // Userspace workaround for capture bridges that report the
            // wrong RGB byte order.
            let swapped = match self.format {
                frame::FOURCC_RGB24 => Some(frame::FOURCC_BGR24),
                frame::FOURCC_BGR24 => Some(frame::FOURCC_RGB24),
                _ => None,
            };
            if let Some(swapped) = swapped {
                info!(
                    from = %fourcc_to_string(self.format),
                    to = %fourcc_to_string(swapped),
                    "using format swap"
                );
                self.format = swapped;
            }
        }
        info!(format = %fourcc_to_string(self.format), "using format");

        self.stride = got_stride;
        self.raw_size = got_sizeimage as usize;
        Ok(())
    }

    fn open_hw_fps(&mut self, desired_fps: u32) {
        self.hw_fps = 0;

        let mut parm = sys::v4l2_streamparm::zeroed();
        parm.type_ = self.capture_type;
        debug!("querying hw fps");
        if unsafe { sys::xioctl(self.fd, sys::VIDIOC_G_PARM, &mut parm) }.is_err() {
            info!("changing hw fps is not supported");
            return;
        }
        if unsafe { parm.parm.capture.capability } & sys::V4L2_CAP_TIMEPERFRAME == 0 {
            info!("changing hw fps is not supported");
            return;
        }

        let mut parm = sys::v4l2_streamparm::zeroed();
        parm.type_ = self.capture_type;
        unsafe {
            parm.parm.capture.timeperframe.numerator = 1;
            parm.parm.capture.timeperframe.denominator =
                if desired_fps == 0 { 255 } else { desired_fps };
        }
        if let Err(err) = unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_PARM, &mut parm) } {
            warn!(error = %err, "can't set hw fps");
            return;
        }

        let tpf = unsafe { parm.parm.capture.timeperframe };
        if tpf.numerator != 1 || tpf.denominator == 0 {
            warn!(
                numerator = tpf.numerator,
                denominator = tpf.denominator,
                "driver returned unusable timeperframe"
            );
            return;
        }
        self.hw_fps = tpf.denominator;
        if desired_fps != self.hw_fps {
            info!(desired = desired_fps, coerced = self.hw_fps, "using hw fps");
        } else {
            info!(fps = self.hw_fps, "using hw fps");
        }
    }

    fn open_jpeg_quality(&mut self, quality: u32) {
        self.jpeg_quality = 0;
        if !frame::is_jpeg(self.format) {
            return;
        }
        let mut comp = sys::v4l2_jpegcompression::zeroed();
        if unsafe { sys::xioctl(self.fd, sys::VIDIOC_G_JPEGCOMP, &mut comp) }.is_err() {
            info!("device doesn't support hw encoding quality params");
            return;
        }
        comp.quality = quality as i32;
        if unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_JPEGCOMP, &mut comp) }.is_err() {
            warn!("can't change hw jpeg quality");
            return;
        }
        self.jpeg_quality = quality;
    }

    fn request_buffers(&self, count: u32, memory: u32) -> Result<u32, CaptureError> {
        let mut req = sys::v4l2_requestbuffers::zeroed();
        req.count = count;
        req.type_ = self.capture_type;
        req.memory = memory;
        debug!(count, "requesting device buffers");
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_REQBUFS, &mut req) }
            .map_err(|err| CaptureError::Unsupported(format!("i/o method unsupported: {err}")))?;
        if req.count < 1 {
            return Err(CaptureError::Unsupported(format!(
                "insufficient buffer memory: {}",
                req.count
            )));
        }
        info!(requested = count, got = req.count, "requested device buffers");
        Ok(req.count)
    }

    fn new_hw_buffer(index: u32, data: *mut u8, allocated: usize, mmaped: bool) -> HwBuffer {
        HwBuffer {
            index,
            data,
            allocated,
            mmaped,
            dma_fd: None,
            grabbed: AtomicBool::new(false),
            refs: AtomicU32::new(0),
            state: Mutex::new(HwBufState {
                buf: sys::v4l2_buffer::zeroed(),
                planes: [sys::v4l2_plane::zeroed(); sys::VIDEO_MAX_PLANES],
                bytesused: 0,
                grab_ts: 0.0,
            }),
        }
    }

    fn open_io_mmap(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        let wanted = effective_buffers(config.n_bufs);
        let count = self.request_buffers(wanted, sys::V4L2_MEMORY_MMAP)?;

        for index in 0..count {
            let mut buf = sys::v4l2_buffer::zeroed();
            let mut planes = [sys::v4l2_plane::zeroed(); sys::VIDEO_MAX_PLANES];
            buf.type_ = self.capture_type;
            buf.memory = sys::V4L2_MEMORY_MMAP;
            buf.index = index;
            if self.mplane {
                buf.length = sys::VIDEO_MAX_PLANES as u32;
                buf.m.planes = planes.as_mut_ptr();
            }
            debug!(index, "querying device buffer");
            unsafe { sys::xioctl(self.fd, sys::VIDIOC_QUERYBUF, &mut buf) }
                .map_err(|err| CaptureError::Unsupported(format!("can't query buffer: {err}")))?;

            let (length, offset) = if self.mplane {
                (planes[0].length as usize, unsafe { planes[0].m.mem_offset })
            } else {
                (buf.length as usize, unsafe { buf.m.offset })
            };

            debug!(index, length, "mapping device buffer");
            let data = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    length,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    self.fd,
                    offset as libc::off_t,
                )
            };
            if data == libc::MAP_FAILED {
                return Err(CaptureError::Unsupported(format!(
                    "can't map device buffer {index}: {}",
                    io::Error::last_os_error()
                )));
            }
            self.bufs
                .push(Self::new_hw_buffer(index, data.cast(), length, true));
        }
        Ok(())
    }

    fn open_io_userptr(&mut self, config: &CaptureConfig) -> Result<(), CaptureError> {
        let wanted = effective_buffers(config.n_bufs);
        let count = self.request_buffers(wanted, sys::V4L2_MEMORY_USERPTR)?;

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let buf_size = align_size(self.raw_size.max(1) as u32, page_size as u32) as usize;

        for index in 0..count {
            let layout = std::alloc::Layout::from_size_align(buf_size, page_size)
                .map_err(|err| CaptureError::Unsupported(format!("bad buffer layout: {err}")))?;
            let data = unsafe { std::alloc::alloc_zeroed(layout) };
            if data.is_null() {
                return Err(CaptureError::Unsupported("buffer allocation failed".into()));
            }
            self.bufs
                .push(Self::new_hw_buffer(index, data, buf_size, false));
        }
        Ok(())
    }

    fn queue_all_buffers(&self) -> Result<(), CaptureError> {
        for hw in &self.bufs {
            let mut buf = sys::v4l2_buffer::zeroed();
            let mut planes = [sys::v4l2_plane::zeroed(); sys::VIDEO_MAX_PLANES];
            buf.type_ = self.capture_type;
            buf.memory = self.io_method.memory();
            buf.index = hw.index;
            if self.mplane {
                buf.m.planes = planes.as_mut_ptr();
                buf.length = 1;
            }
            if self.io_method == IoMethod::Userptr {
                buf.m.userptr = hw.data as libc::c_ulong;
                buf.length = hw.allocated as u32;
            }
            debug!(index = hw.index, "queueing device buffer");
            unsafe { sys::xioctl(self.fd, sys::VIDIOC_QBUF, &mut buf) }
                .map_err(|err| CaptureError::Unsupported(format!("can't queue buffer: {err}")))?;
        }
        Ok(())
    }

    fn open_export_to_dma(&mut self) -> Result<(), CaptureError> {
        for hw in &mut self.bufs {
            let mut exp = sys::v4l2_exportbuffer::zeroed();
            exp.type_ = self.capture_type;
            exp.index = hw.index;
            debug!(index = hw.index, "exporting device buffer to DMA");
            unsafe { sys::xioctl(self.fd, sys::VIDIOC_EXPBUF, &mut exp) }
                .map_err(|err| CaptureError::Unsupported(format!("can't export buffer: {err}")))?;
            hw.dma_fd = Some(exp.fd);
        }
        Ok(())
    }

    fn apply_resolution(&mut self, width: u32, height: u32, hz: f32) -> Result<(), CaptureError> {
        if width == 0 || width > VIDEO_MAX_WIDTH || height == 0 || height > VIDEO_MAX_HEIGHT {
            return Err(CaptureError::Unsupported(format!(
                "forbidden resolution {width}x{height}: max={VIDEO_MAX_WIDTH}x{VIDEO_MAX_HEIGHT}"
            )));
        }
        self.width = width;
        self.height = height;
        self.hz = hz;
        Ok(())
    }

    /// Waits for a frame or a device event. `Ok(())` means read-ready.
    fn wait_frame(&self) -> Result<(), CaptureError> {
        let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
        let mut error_fds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_fds);
            libc::FD_SET(self.fd, &mut read_fds);
            libc::FD_ZERO(&mut error_fds);
            libc::FD_SET(self.fd, &mut error_fds);
        }
        let mut timeout = libc::timeval {
            tv_sec: self.timeout as libc::time_t,
            tv_usec: 0,
        };

        let selected = unsafe {
            libc::select(
                self.fd + 1,
                &mut read_fds,
                ptr::null_mut(),
                &mut error_fds,
                &mut timeout,
            )
        };
        if selected < 0 {
            let err = io::Error::last_os_error();
            if !sys::errno_is(&err, libc::EINTR) {
                warn!(error = %err, "device select() error");
            }
            return Err(CaptureError::RestartRequired("select failed"));
        }
        if selected == 0 {
            if self.persistent {
                if !self.timeout_logged.swap(true, Ordering::Relaxed) {
                    info!("timeout while waiting for a frame, persisting");
                }
                return Err(CaptureError::NoData);
            }
            warn!("device select() timeout");
            return Err(CaptureError::RestartRequired("select timeout"));
        }
        self.timeout_logged.store(false, Ordering::Relaxed);

        if unsafe { libc::FD_ISSET(self.fd, &error_fds) } {
            self.consume_event()?;
        }
        if unsafe { libc::FD_ISSET(self.fd, &read_fds) } {
            return Ok(());
        }
        Err(CaptureError::NoData)
    }

    fn consume_event(&self) -> Result<(), CaptureError> {
        let mut event = sys::v4l2_event::zeroed();
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_DQEVENT, &mut event) }
            .map_err(|_| CaptureError::RestartRequired("can't consume device event"))?;
        match event.type_ {
            sys::V4L2_EVENT_SOURCE_CHANGE => {
                info!("got V4L2_EVENT_SOURCE_CHANGE, restarting");
                Err(CaptureError::RestartRequired("source changed"))
            }
            sys::V4L2_EVENT_EOS => {
                info!("got V4L2_EVENT_EOS, restarting");
                Err(CaptureError::RestartRequired("end of stream"))
            }
            _ => Ok(()),
        }
    }

    /// Dequeues the freshest valid buffer, requeueing stale or broken ones.
    pub fn grab(&self) -> Result<Grabbed, CaptureError> {
        self.wait_frame()?;

        let mut kept: Option<(sys::v4l2_buffer, [sys::v4l2_plane; sys::VIDEO_MAX_PLANES])> = None;
        let mut skipped = 0u32;
        let mut broken_only = false;

        debug!("grabbing hw buffer");
        loop {
            let mut buf = sys::v4l2_buffer::zeroed();
            let mut planes = [sys::v4l2_plane::zeroed(); sys::VIDEO_MAX_PLANES];
            buf.type_ = self.capture_type;
            buf.memory = self.io_method.memory();
            if self.mplane {
                buf.length = sys::VIDEO_MAX_PLANES as u32;
                buf.m.planes = planes.as_mut_ptr();
            }

            match unsafe { sys::xioctl(self.fd, sys::VIDIOC_DQBUF, &mut buf) } {
                Ok(()) => {
                    if buf.index as usize >= self.bufs.len() {
                        warn!(index = buf.index, "grabbed invalid hw buffer");
                        return Err(CaptureError::RestartRequired("invalid buffer index"));
                    }
                    let hw = &self.bufs[buf.index as usize];
                    if hw.grabbed.swap(true, Ordering::SeqCst) {
                        warn!(index = buf.index, "grabbed hw buffer is already in use");
                        return Err(CaptureError::RestartRequired("buffer already grabbed"));
                    }

                    if self.mplane {
                        buf.bytesused = planes[0].bytesused;
                    }

                    if !self.buffer_is_valid(&buf, hw) {
                        self.requeue_raw(&mut buf, &mut planes)?;
                        hw.grabbed.store(false, Ordering::SeqCst);
                        broken_only = true;
                        continue;
                    }

                    if let Some((mut prev, mut prev_planes)) = kept.take() {
                        // Keep only the freshest valid frame.
                        let prev_index = prev.index;
                        self.requeue_raw(&mut prev, &mut prev_planes)?;
                        self.bufs[prev_index as usize]
                            .grabbed
                            .store(false, Ordering::SeqCst);
                        skipped += 1;
                    }
                    kept = Some((buf, planes));
                }
                Err(err) if sys::errno_is(&err, libc::EAGAIN) => {
                    if let Some((buf, planes)) = kept {
                        let index = buf.index as usize;
                        let hw = &self.bufs[index];
                        let grab_ts = buf.timestamp.tv_sec as f64
                            + buf.timestamp.tv_usec as f64 / 1_000_000.0;
                        {
                            let mut state = hw.state.lock().unwrap();
                            state.buf = buf;
                            state.planes = planes;
                            state.bytesused = buf.bytesused as usize;
                            state.grab_ts = grab_ts;
                        }
                        hw.refs.store(0, Ordering::SeqCst);
                        debug!(
                            index,
                            bytesused = buf.bytesused,
                            skipped,
                            latency = clock::now_monotonic() - grab_ts,
                            "grabbed hw buffer"
                        );
                        return Ok(Grabbed { index, grab_ts });
                    }
                    if broken_only {
                        return Err(CaptureError::NoData);
                    }
                    warn!(error = %err, "can't grab hw buffer");
                    return Err(CaptureError::RestartRequired("dqbuf failed"));
                }
                Err(err) => {
                    warn!(error = %err, "can't grab hw buffer");
                    return Err(CaptureError::RestartRequired("dqbuf failed"));
                }
            }
        }
    }

    fn requeue_raw(
        &self,
        buf: &mut sys::v4l2_buffer,
        planes: &mut [sys::v4l2_plane; sys::VIDEO_MAX_PLANES],
    ) -> Result<(), CaptureError> {
        if self.mplane {
            buf.m.planes = planes.as_mut_ptr();
        }
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_QBUF, buf) }
            .map_err(|_| CaptureError::RestartRequired("can't requeue buffer"))?;
        Ok(())
    }

    fn buffer_is_valid(&self, buf: &sys::v4l2_buffer, hw: &HwBuffer) -> bool {
        // Corrupted frames captured under low light are much smaller than
        // regular ones; drop anything below the configured floor.
        if buf.bytesused < self.min_frame_size {
            debug!(
                index = buf.index,
                bytesused = buf.bytesused,
                "dropped too small frame, assuming it was broken"
            );
            return false;
        }

        if frame::is_jpeg(self.format) {
            if buf.bytesused < MIN_JPEG_SIZE {
                debug!(bytesused = buf.bytesused, "dropped frame too small for a JPEG");
                return false;
            }
            let used = (buf.bytesused as usize).min(hw.allocated);
            let data = unsafe { std::slice::from_raw_parts(hw.data as *const u8, used) };
            let begin = u16::from_be_bytes([data[0], data[1]]);
            if begin != 0xFFD8 {
                debug!(marker = begin, "dropped JPEG frame with invalid header");
                return false;
            }
            let end = u16::from_be_bytes([data[data.len() - 2], data[data.len() - 1]]);
            if end != 0xFFD9 && end != 0xD900 && end != 0x0000 {
                if !self.allow_truncated_frames {
                    debug!(marker = end, "dropped truncated JPEG frame");
                    return false;
                }
                debug!(marker = end, "keeping truncated JPEG frame");
            }
        }
        true
    }

    /// Requeues a grabbed buffer. The refcount must have dropped to zero.
    pub fn release(&self, index: usize) -> Result<(), CaptureError> {
        let hw = &self.bufs[index];
        debug_assert_eq!(hw.refs.load(Ordering::SeqCst), 0);
        let mut state = hw.state.lock().unwrap();
        let mut buf = state.buf;
        if self.mplane {
            buf.m.planes = state.planes.as_mut_ptr();
        }
        unsafe { sys::xioctl(self.fd, sys::VIDIOC_QBUF, &mut buf) }
            .map_err(|_| CaptureError::RestartRequired("can't release buffer"))?;
        drop(state);
        hw.grabbed.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Read-only view of a grabbed buffer for the encoder.
    pub fn hw_frame(&self, index: usize) -> RawFrame<'_> {
        let hw = &self.bufs[index];
        let state = hw.state.lock().unwrap();
        let used = state.bytesused.min(hw.allocated);
        let grab_ts = state.grab_ts;
        drop(state);
        RawFrame {
            data: unsafe { std::slice::from_raw_parts(hw.data as *const u8, used) },
            width: self.width,
            height: self.height,
            format: self.format,
            stride: self.stride,
            grab_ts,
            dma_fd: hw.dma_fd,
        }
    }

    pub fn buffer(&self, index: usize) -> &HwBuffer {
        &self.bufs[index]
    }

    /// Advisory FPS change, used by the no-clients slowdown.
    pub fn set_hw_fps(&self, fps: u32) {
        let mut parm = sys::v4l2_streamparm::zeroed();
        parm.type_ = self.capture_type;
        unsafe {
            parm.parm.capture.timeperframe.numerator = 1;
            parm.parm.capture.timeperframe.denominator = if fps == 0 { 255 } else { fps };
        }
        if unsafe { sys::xioctl(self.fd, sys::VIDIOC_S_PARM, &mut parm) }.is_err() {
            debug!(fps, "device ignored fps change");
        } else {
            info!(fps, "requested capture fps");
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> u32 {
        self.format
    }

    pub fn stride(&self) -> u32 {
        self.stride
    }

    pub fn hw_fps(&self) -> u32 {
        self.hw_fps
    }

    /// Source refresh rate detected from DV-timings, zero when unknown.
    pub fn hz(&self) -> f32 {
        self.hz
    }

    /// Quality actually applied to a hardware JPEG source, zero otherwise.
    pub fn jpeg_quality(&self) -> u32 {
        self.jpeg_quality
    }

    pub fn n_bufs(&self) -> usize {
        self.bufs.len()
    }

    pub fn uses_dma(&self) -> bool {
        self.bufs.iter().any(|hw| hw.dma_fd.is_some())
    }
}

impl AsRawFd for Capture {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Capture {
    fn drop(&mut self) {
        if self.streamon.swap(false, Ordering::SeqCst) {
            let mut buf_type = self.capture_type as i32;
            if unsafe { sys::xioctl(self.fd, sys::VIDIOC_STREAMOFF, &mut buf_type) }.is_err() {
                warn!("can't stop capturing");
            }
        }

        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        for hw in &self.bufs {
            if let Some(dma_fd) = hw.dma_fd {
                unsafe { libc::close(dma_fd) };
            }
            if hw.mmaped {
                if unsafe { libc::munmap(hw.data.cast(), hw.allocated) } < 0 {
                    warn!(index = hw.index, "can't unmap hw buffer");
                }
            } else if let Ok(layout) = std::alloc::Layout::from_size_align(hw.allocated, page_size)
            {
                unsafe { std::alloc::dealloc(hw.data, layout) };
            }
        }
        unsafe { libc::close(self.fd) };
        info!("capturing stopped");
    }
}

fn align_size(size: u32, align: u32) -> u32 {
    (size + align - 1) / align * align
}

fn effective_buffers(configured: u32) -> u32 {
    if configured > 0 {
        configured
    } else {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        cores + 1
    }
}

fn is_supported_format(format: u32) -> bool {
    matches!(
        format,
        frame::FOURCC_YUYV
            | frame::FOURCC_YVYU
            | frame::FOURCC_UYVY
            | frame::FOURCC_GREY
            | frame::FOURCC_RGB565
            | frame::FOURCC_RGB24
            | frame::FOURCC_BGR24
            | frame::FOURCC_MJPEG
            | frame::FOURCC_JPEG
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_size() {
        assert_eq!(align_size(1, 32), 32);
        assert_eq!(align_size(32, 32), 32);
        assert_eq!(align_size(33, 32), 64);
        assert_eq!(align_size(640, 32), 640);
    }

    #[test]
    fn test_parse_format() {
        assert_eq!(parse_format("yuyv"), Some(frame::FOURCC_YUYV));
        assert_eq!(parse_format("MJPEG"), Some(frame::FOURCC_MJPEG));
        assert_eq!(parse_format("bogus"), None);
    }

    #[test]
    fn test_parse_standard() {
        assert_eq!(parse_standard("pal"), Some(sys::V4L2_STD_PAL));
        assert_eq!(parse_standard("NTSC"), Some(sys::V4L2_STD_NTSC));
        assert_eq!(parse_standard("weird"), None);
    }

    #[test]
    fn test_io_method_parse() {
        assert_eq!(IoMethod::parse("mmap"), Some(IoMethod::Mmap));
        assert_eq!(IoMethod::parse("USERPTR"), Some(IoMethod::Userptr));
        assert_eq!(IoMethod::parse("dma"), None);
    }

    #[test]
    fn test_effective_buffers() {
        assert_eq!(effective_buffers(4), 4);
        assert!(effective_buffers(0) >= 2);
    }

    #[test]
    fn test_open_missing_device_fails() {
        let config = CaptureConfig {
            path: PathBuf::from("/dev/video-does-not-exist"),
            ..Default::default()
        };
        assert!(Capture::open(&config).is_err());
    }
}
