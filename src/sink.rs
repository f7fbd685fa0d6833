//! Shared-memory frame sink.
//!
//! A named POSIX shared-memory region handed from a single producer to many
//! consumer processes, paired with a named binary semaphore for wakeups and
//! an advisory whole-file lock for exclusion. Readers never starve the
//! producer: the producer only try-locks and skips the frame on contention.

use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::clock;
use crate::encoder::H264Encoder;
use crate::frame::{self, Frame};

const SINK_MAGIC: u64 = 0x0DEF_ACED_BEEF_CAFE;
const SINK_VERSION: u32 = 4;
/// Payload capacity, enough for `width * height * 4` up to 4K.
pub const SINK_MAX_DATA: usize = 3840 * 2160 * 4;

const POLL_STEP_US: u32 = 1000;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("frame is too big for the sink: {0} > {1}")]
    FrameTooBig(usize, usize),

    #[error("sink layout mismatch: magic={0:#x} version={1}")]
    LayoutMismatch(u64, u32),
}

/// The fixed layout of the shared region.
///
/// Atomics here are shared across processes; both sides of the handoff are
/// 64-bit Linux where these are always lock-free.
#[repr(C)]
struct SinkShared {
    magic: u64,
    version: u32,

    id: u64,

    width: u32,
    height: u32,
    format: u32,
    stride: u32,
    online: u8,
    key: u8,

    used: u64,
    grab_ts: f64,
    encode_begin_ts: f64,
    encode_end_ts: f64,

    last_client_ts: AtomicU64,
    key_requested: AtomicU8,

    data: [u8; SINK_MAX_DATA],
}

#[derive(Debug, PartialEq, Eq)]
pub enum PutResult {
    Put,
    /// A reader held the lock; the frame was skipped, not an error.
    Busy,
}

#[derive(Debug, PartialEq, Eq)]
pub enum GetResult {
    Frame,
    NoUpdate,
}

pub struct Memsink {
    name: String,
    mem_name: CString,
    sig_name: CString,
    server: bool,
    rm: bool,
    client_ttl: f64,
    timeout: f64,

    fd: RawFd,
    mem: *mut SinkShared,
    sem: *mut libc::sem_t,
    last_id: u64,
}

// The raw pointers target a shared mapping whose concurrent access is
// serialized by the file lock and the atomics above.
unsafe impl Send for Memsink {}

impl Memsink {
    /// Opens (and for the server, creates) the `/<name>.mem` + `/<name>.sig`
    /// object pair.
    pub fn server(name: &str, mode: u32, rm: bool, client_ttl: f64) -> Result<Self, SinkError> {
        Self::open(name, true, mode, rm, client_ttl, 1.0)
    }

    pub fn client(name: &str, timeout: f64) -> Result<Self, SinkError> {
        Self::open(name, false, 0o666, false, 0.0, timeout)
    }

    fn open(
        name: &str,
        server: bool,
        mode: u32,
        rm: bool,
        client_ttl: f64,
        timeout: f64,
    ) -> Result<Self, SinkError> {
        let prefix = if name.starts_with('/') {
            name.to_string()
        } else {
            format!("/{name}")
        };
        let mem_name = CString::new(format!("{prefix}.mem")).expect("no NULs in sink names");
        let sig_name = CString::new(format!("{prefix}.sig")).expect("no NULs in sink names");
        info!(sink = name, objects = %format!("{prefix}.{{mem,sig}}"), "using sink");

        let oflags = if server {
            libc::O_RDWR | libc::O_CREAT
        } else {
            libc::O_RDWR
        };

        let fd = unsafe { libc::shm_open(mem_name.as_ptr(), oflags, mode as libc::mode_t) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut sink = Self {
            name: name.to_string(),
            mem_name,
            sig_name,
            server,
            rm,
            client_ttl,
            timeout,
            fd,
            mem: ptr::null_mut(),
            sem: libc::SEM_FAILED.cast(),
            last_id: 0,
        };

        if server && unsafe { libc::ftruncate(fd, std::mem::size_of::<SinkShared>() as libc::off_t) } < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mem = unsafe {
            libc::mmap(
                ptr::null_mut(),
                std::mem::size_of::<SinkShared>(),
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if mem == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        sink.mem = mem.cast();

        let sem = unsafe {
            libc::sem_open(
                sink.sig_name.as_ptr(),
                oflags,
                mode as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED.cast() {
            return Err(io::Error::last_os_error().into());
        }
        sink.sem = sem;

        let shared = unsafe { &mut *sink.mem };
        if server {
            shared.magic = SINK_MAGIC;
            shared.version = SINK_VERSION;
        } else if shared.magic != SINK_MAGIC || shared.version != SINK_VERSION {
            return Err(SinkError::LayoutMismatch(shared.magic, shared.version));
        }

        Ok(sink)
    }

    /// True when a consumer has ticked `last_client_ts` within the TTL.
    pub fn has_recent_clients(&self) -> bool {
        debug_assert!(self.server);
        let last = f64::from_bits(
            unsafe { &*self.mem }
                .last_client_ts
                .load(Ordering::Relaxed),
        );
        clock::now_monotonic() - last <= self.client_ttl
    }

    /// True when a consumer has polled recently and `frame` is worth writing.
    pub fn server_check(&self, frame: &Frame) -> bool {
        frame.used() > 0 && self.has_recent_clients()
    }

    /// Reads and clears the consumer-side key frame request.
    pub fn take_key_request(&self) -> bool {
        unsafe { &*self.mem }
            .key_requested
            .swap(0, Ordering::Relaxed)
            != 0
    }

    /// Asks the producer to emit a key frame as soon as possible.
    pub fn request_key(&self) {
        unsafe { &*self.mem }
            .key_requested
            .store(1, Ordering::Relaxed);
    }

    /// Publishes `frame` into the shared region and signals consumers.
    pub fn server_put(&mut self, frame: &Frame) -> Result<PutResult, SinkError> {
        debug_assert!(self.server);

        if frame.used() > SINK_MAX_DATA {
            return Err(SinkError::FrameTooBig(frame.used(), SINK_MAX_DATA));
        }

        if unsafe { libc::flock(self.fd, libc::LOCK_EX | libc::LOCK_NB) } < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                debug!(sink = %self.name, "shared memory is busy, frame skipped");
                return Ok(PutResult::Busy);
            }
            return Err(err.into());
        }

        // Drain a stale wakeup so the semaphore stays binary.
        unsafe { libc::sem_trywait(self.sem) };

        let shared = unsafe { &mut *self.mem };
        shared.used = frame.used() as u64;
        shared.width = frame.width;
        shared.height = frame.height;
        shared.format = frame.format;
        shared.stride = frame.stride;
        shared.online = frame.online as u8;
        shared.key = frame.key as u8;
        shared.grab_ts = frame.grab_ts;
        shared.encode_begin_ts = frame.encode_begin_ts;
        shared.encode_end_ts = frame.encode_end_ts;
        shared.data[..frame.used()].copy_from_slice(frame.data());
        shared.id = shared.id.wrapping_add(1);

        if unsafe { libc::sem_post(self.sem) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if unsafe { libc::flock(self.fd, libc::LOCK_UN) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(PutResult::Put)
    }

    /// Waits for a fresh frame and copies it out.
    pub fn client_get(&mut self, frame: &mut Frame) -> Result<GetResult, SinkError> {
        debug_assert!(!self.server);

        // Stamp liveness before waiting so the producer keeps encoding
        // for a consumer that is merely blocked on the next frame.
        unsafe { &*self.mem }
            .last_client_ts
            .store(clock::now_monotonic().to_bits(), Ordering::Relaxed);

        if !self.sem_timedwait(self.timeout) {
            return Ok(GetResult::NoUpdate);
        }
        if !self.flock_timedwait(self.timeout) {
            return Ok(GetResult::NoUpdate);
        }

        let result = {
            let shared = unsafe { &mut *self.mem };
            if shared.id == self.last_id {
                GetResult::NoUpdate
            } else {
                let used = (shared.used as usize).min(SINK_MAX_DATA);
                frame.set_data(&shared.data[..used]);
                frame.width = shared.width;
                frame.height = shared.height;
                frame.format = shared.format;
                frame.stride = shared.stride;
                frame.online = shared.online != 0;
                frame.key = shared.key != 0;
                frame.grab_ts = shared.grab_ts;
                frame.encode_begin_ts = shared.encode_begin_ts;
                frame.encode_end_ts = shared.encode_end_ts;
                self.last_id = shared.id;
                GetResult::Frame
            }
        };

        unsafe { &*self.mem }
            .last_client_ts
            .store(clock::now_monotonic().to_bits(), Ordering::Relaxed);

        if unsafe { libc::flock(self.fd, libc::LOCK_UN) } < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(result)
    }

    /// Binary-semaphore wait with a monotonic deadline and 1 ms polling.
    fn sem_timedwait(&self, timeout: f64) -> bool {
        let deadline = clock::now_monotonic() + timeout;
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return true;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EAGAIN) || clock::now_monotonic() > deadline {
                return false;
            }
            unsafe { libc::usleep(POLL_STEP_US) };
        }
    }

    fn flock_timedwait(&self, timeout: f64) -> bool {
        let deadline = clock::now_monotonic() + timeout;
        loop {
            if unsafe { libc::flock(self.fd, libc::LOCK_EX | libc::LOCK_NB) } == 0 {
                return true;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EWOULDBLOCK) || clock::now_monotonic() > deadline {
                return false;
            }
            unsafe { libc::usleep(POLL_STEP_US) };
        }
    }
}

impl Drop for Memsink {
    fn drop(&mut self) {
        unsafe {
            if self.sem != libc::SEM_FAILED.cast() {
                libc::sem_close(self.sem);
                if self.rm {
                    libc::sem_unlink(self.sig_name.as_ptr());
                }
            }
            if !self.mem.is_null() {
                libc::munmap(self.mem.cast(), std::mem::size_of::<SinkShared>());
            }
            if self.fd >= 0 {
                libc::close(self.fd);
                if self.rm {
                    libc::shm_unlink(self.mem_name.as_ptr());
                }
            }
        }
    }
}

/// The H.264 side channel: encodes exposed frames on demand and hands them
/// to its own memory sink.
pub struct H264Stream {
    sink: Memsink,
    encoder: H264Encoder,
    tmp_src: Frame,
    dest: Frame,
    online: Arc<AtomicBool>,
}

impl H264Stream {
    pub fn new(sink: Memsink, bitrate_kbps: u32, gop: u32, fps_hint: u32) -> Self {
        Self {
            sink,
            encoder: H264Encoder::new(bitrate_kbps, gop, fps_hint),
            tmp_src: Frame::new(),
            dest: Frame::new(),
            online: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn online(&self) -> bool {
        self.online.load(Ordering::Relaxed)
    }

    /// Shared flag for `/state` reporting.
    pub fn online_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.online)
    }

    /// True while somebody is reading the sink; lets the pipeline skip the
    /// per-frame copy and encode entirely.
    pub fn has_clients(&self) -> bool {
        self.sink.has_recent_clients()
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.encoder.bitrate_kbps()
    }

    pub fn gop(&self) -> u32 {
        self.encoder.gop()
    }

    /// Encodes and publishes one source frame. Skips all work when nobody
    /// has read from the sink within the TTL.
    pub fn process(&mut self, src: &Frame, mut force_key: bool) {
        if !self.sink.server_check(src) {
            self.online.store(false, Ordering::Relaxed);
            return;
        }

        let src = if frame::is_jpeg(src.format) {
            // The H.264 encoder wants raw pixels; decode the JPEG source.
            let begin = clock::now_monotonic();
            match image::load_from_memory(src.data()) {
                Ok(decoded) => {
                    let rgb = decoded.to_rgb8();
                    let (width, height) = (rgb.width(), rgb.height());
                    self.tmp_src.set_data(rgb.as_raw());
                    self.tmp_src.width = width;
                    self.tmp_src.height = height;
                    self.tmp_src.format = frame::FOURCC_RGB24;
                    self.tmp_src.stride = width * 3;
                    self.tmp_src.online = src.online;
                    self.tmp_src.grab_ts = src.grab_ts;
                    debug!(time = clock::now_monotonic() - begin, "decoded JPEG for H.264");
                    &self.tmp_src
                }
                Err(err) => {
                    warn!(error = %err, "can't decode JPEG source for H.264");
                    return;
                }
            }
        } else {
            src
        };

        if self.sink.take_key_request() {
            info!("key frame requested by a sink client");
            force_key = true;
        }

        if !self.encoder.is_prepared_for(
            src.width,
            src.height,
            src.format,
            src.stride,
            false,
        ) {
            if let Err(err) =
                self.encoder
                    .prepare(src.width, src.height, src.format, src.stride, false)
            {
                warn!(error = %err, "can't prepare H.264 encoder");
                self.online.store(false, Ordering::Relaxed);
                return;
            }
        }

        let mut online = false;
        match self.encoder.compress(src, &mut self.dest, force_key) {
            Ok(()) => match self.sink.server_put(&self.dest) {
                Ok(_) => online = true,
                Err(err) => warn!(error = %err, "can't put H.264 frame into sink"),
            },
            Err(err) => warn!(error = %err, "H.264 compression failed"),
        }
        self.online.store(online, Ordering::Relaxed);
    }
}
