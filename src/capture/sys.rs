//! Raw `videodev2.h` definitions and the retrying ioctl wrapper.
//!
//! Only the subset the capture device actually uses. These types mirror the
//! kernel ABI and must stay `#[repr(C)]`; nothing here is a public API.

#![allow(non_camel_case_types, dead_code)]

use std::io;
use std::mem;
use std::os::unix::io::RawFd;

use libc::{c_ulong, timeval};

pub const VIDEO_MAX_PLANES: usize = 8;

// _IOC encoding, generic Linux layout: nr 0..8, type 8..16, size 16..30, dir 30..32.
const IOC_WRITE: c_ulong = 1;
const IOC_READ: c_ulong = 2;

const fn ioc(dir: c_ulong, nr: c_ulong, size: usize) -> c_ulong {
    (dir << 30) | ((size as c_ulong) << 16) | ((b'V' as c_ulong) << 8) | nr
}

const fn ior<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_READ, nr, mem::size_of::<T>())
}

const fn iow<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_WRITE, nr, mem::size_of::<T>())
}

const fn iowr<T>(nr: c_ulong) -> c_ulong {
    ioc(IOC_READ | IOC_WRITE, nr, mem::size_of::<T>())
}

pub const VIDIOC_QUERYCAP: c_ulong = ior::<v4l2_capability>(0);
pub const VIDIOC_S_FMT: c_ulong = iowr::<v4l2_format>(5);
pub const VIDIOC_REQBUFS: c_ulong = iowr::<v4l2_requestbuffers>(8);
pub const VIDIOC_QUERYBUF: c_ulong = iowr::<v4l2_buffer>(9);
pub const VIDIOC_QBUF: c_ulong = iowr::<v4l2_buffer>(15);
pub const VIDIOC_EXPBUF: c_ulong = iowr::<v4l2_exportbuffer>(16);
pub const VIDIOC_DQBUF: c_ulong = iowr::<v4l2_buffer>(17);
pub const VIDIOC_STREAMON: c_ulong = iow::<i32>(18);
pub const VIDIOC_STREAMOFF: c_ulong = iow::<i32>(19);
pub const VIDIOC_G_PARM: c_ulong = iowr::<v4l2_streamparm>(21);
pub const VIDIOC_S_PARM: c_ulong = iowr::<v4l2_streamparm>(22);
pub const VIDIOC_S_STD: c_ulong = iow::<v4l2_std_id>(24);
pub const VIDIOC_G_CTRL: c_ulong = iowr::<v4l2_control>(27);
pub const VIDIOC_S_CTRL: c_ulong = iowr::<v4l2_control>(28);
pub const VIDIOC_QUERYCTRL: c_ulong = iowr::<v4l2_queryctrl>(36);
pub const VIDIOC_S_INPUT: c_ulong = iowr::<i32>(39);
pub const VIDIOC_G_JPEGCOMP: c_ulong = ior::<v4l2_jpegcompression>(61);
pub const VIDIOC_S_JPEGCOMP: c_ulong = iow::<v4l2_jpegcompression>(62);
pub const VIDIOC_QUERYSTD: c_ulong = ior::<v4l2_std_id>(63);
pub const VIDIOC_S_DV_TIMINGS: c_ulong = iowr::<v4l2_dv_timings>(87);
pub const VIDIOC_DQEVENT: c_ulong = ior::<v4l2_event>(89);
pub const VIDIOC_SUBSCRIBE_EVENT: c_ulong = iow::<v4l2_event_subscription>(90);
pub const VIDIOC_QUERY_DV_TIMINGS: c_ulong = ior::<v4l2_dv_timings>(99);

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_VIDEO_CAPTURE_MPLANE: u32 = 0x0000_1000;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;
pub const V4L2_CAP_TIMEPERFRAME: u32 = 0x0000_1000;

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_BUF_TYPE_VIDEO_CAPTURE_MPLANE: u32 = 9;

pub const V4L2_MEMORY_MMAP: u32 = 1;
pub const V4L2_MEMORY_USERPTR: u32 = 2;

pub const V4L2_FIELD_ANY: u32 = 0;

pub const V4L2_EVENT_EOS: u32 = 2;
pub const V4L2_EVENT_SOURCE_CHANGE: u32 = 5;

pub const V4L2_DV_BT_656_1120: u32 = 0;

pub const V4L2_CTRL_FLAG_DISABLED: u32 = 0x0001;

pub type v4l2_std_id = u64;

pub const V4L2_STD_UNKNOWN: v4l2_std_id = 0;
pub const V4L2_STD_PAL: v4l2_std_id = 0x0000_00ff;
pub const V4L2_STD_NTSC: v4l2_std_id = 0x0000_b000;
pub const V4L2_STD_SECAM: v4l2_std_id = 0x00ff_0000;

const V4L2_CID_BASE: u32 = 0x0098_0900;
pub const V4L2_CID_BRIGHTNESS: u32 = V4L2_CID_BASE;
pub const V4L2_CID_CONTRAST: u32 = V4L2_CID_BASE + 1;
pub const V4L2_CID_SATURATION: u32 = V4L2_CID_BASE + 2;
pub const V4L2_CID_HUE: u32 = V4L2_CID_BASE + 3;
pub const V4L2_CID_AUTO_WHITE_BALANCE: u32 = V4L2_CID_BASE + 12;
pub const V4L2_CID_GAMMA: u32 = V4L2_CID_BASE + 16;
pub const V4L2_CID_AUTOGAIN: u32 = V4L2_CID_BASE + 18;
pub const V4L2_CID_GAIN: u32 = V4L2_CID_BASE + 19;
pub const V4L2_CID_HFLIP: u32 = V4L2_CID_BASE + 20;
pub const V4L2_CID_VFLIP: u32 = V4L2_CID_BASE + 21;
pub const V4L2_CID_HUE_AUTO: u32 = V4L2_CID_BASE + 25;
pub const V4L2_CID_WHITE_BALANCE_TEMPERATURE: u32 = V4L2_CID_BASE + 26;
pub const V4L2_CID_SHARPNESS: u32 = V4L2_CID_BASE + 27;
pub const V4L2_CID_BACKLIGHT_COMPENSATION: u32 = V4L2_CID_BASE + 28;
pub const V4L2_CID_COLORFX: u32 = V4L2_CID_BASE + 31;
pub const V4L2_CID_AUTOBRIGHTNESS: u32 = V4L2_CID_BASE + 32;
pub const V4L2_CID_ROTATE: u32 = V4L2_CID_BASE + 34;

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub private: u32,
    pub flags: u32,
    pub enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_plane_pix_format {
    pub sizeimage: u32,
    pub bytesperline: u32,
    pub reserved: [u16; 6],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_pix_format_mplane {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub colorspace: u32,
    pub plane_fmt: [v4l2_plane_pix_format; VIDEO_MAX_PLANES],
    pub num_planes: u8,
    pub flags: u8,
    pub enc: u8,
    pub quantization: u8,
    pub xfer_func: u8,
    pub reserved: [u8; 7],
}

#[repr(C)]
pub union v4l2_format_union {
    pub pix: v4l2_pix_format,
    pub pix_mp: v4l2_pix_format_mplane,
    pub raw_data: [u8; 200],
    // The kernel union also holds pointer-bearing variants; this member
    // reproduces their 8-byte alignment so the ioctl size matches.
    align: [u64; 25],
}

#[repr(C)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_union,
}

impl v4l2_format {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

impl v4l2_requestbuffers {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_plane_union {
    pub mem_offset: u32,
    pub userptr: c_ulong,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_plane {
    pub bytesused: u32,
    pub length: u32,
    pub m: v4l2_plane_union,
    pub data_offset: u32,
    pub reserved: [u32; 11],
}

impl v4l2_plane {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_union {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut v4l2_plane,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_union,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl v4l2_buffer {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_exportbuffer {
    pub type_: u32,
    pub index: u32,
    pub plane: u32,
    pub flags: u32,
    pub fd: i32,
    pub reserved: [u32; 11],
}

impl v4l2_exportbuffer {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_fract {
    pub numerator: u32,
    pub denominator: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_captureparm {
    pub capability: u32,
    pub capturemode: u32,
    pub timeperframe: v4l2_fract,
    pub extendedmode: u32,
    pub readbuffers: u32,
    pub reserved: [u32; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_streamparm_union {
    pub capture: v4l2_captureparm,
    pub raw_data: [u8; 200],
}

#[repr(C)]
pub struct v4l2_streamparm {
    pub type_: u32,
    pub parm: v4l2_streamparm_union,
}

impl v4l2_streamparm {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_control {
    pub id: u32,
    pub value: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_queryctrl {
    pub id: u32,
    pub type_: u32,
    pub name: [u8; 32],
    pub minimum: i32,
    pub maximum: i32,
    pub step: i32,
    pub default_value: i32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

impl v4l2_queryctrl {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_jpegcompression {
    pub quality: i32,
    pub app_n: i32,
    pub app_len: i32,
    pub app_data: [u8; 60],
    pub com_len: i32,
    pub com_data: [u8; 60],
    pub jpeg_markers: u32,
}

impl v4l2_jpegcompression {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_event_subscription {
    pub type_: u32,
    pub id: u32,
    pub flags: u32,
    pub reserved: [u32; 5],
}

impl v4l2_event_subscription {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C)]
pub struct v4l2_event {
    pub type_: u32,
    // The payload union; only the event type is inspected here. The kernel
    // union is 8-byte aligned, hence u64 storage.
    pub u: [u64; 8],
    pub pending: u32,
    pub sequence: u32,
    pub timestamp: libc::timespec,
    pub id: u32,
    pub reserved: [u32; 8],
}

impl v4l2_event {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct v4l2_bt_timings {
    pub width: u32,
    pub height: u32,
    pub interlaced: u32,
    pub polarities: u32,
    pub pixelclock: u64,
    pub hfrontporch: u32,
    pub hsync: u32,
    pub hbackporch: u32,
    pub vfrontporch: u32,
    pub vsync: u32,
    pub vbackporch: u32,
    pub il_vfrontporch: u32,
    pub il_vsync: u32,
    pub il_vbackporch: u32,
    pub standards: u32,
    pub flags: u32,
    pub picture_aspect: v4l2_fract,
    pub cea861_vic: u8,
    pub hdmi_vic: u8,
    pub reserved: [u8; 46],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_dv_timings_union {
    pub bt: v4l2_bt_timings,
    pub reserved: [u32; 32],
}

#[repr(C)]
pub struct v4l2_dv_timings {
    pub type_: u32,
    pub u: v4l2_dv_timings_union,
}

impl v4l2_dv_timings {
    pub fn zeroed() -> Self {
        unsafe { mem::zeroed() }
    }
}

/// ioctl with automatic retry of transient failures.
///
/// `EINTR`, `EAGAIN` and `ETIMEDOUT` are retried up to four times; the last
/// errno is returned when the retries run out, so a persistent `EAGAIN`
/// (e.g. an empty DQBUF queue) is still observable by the caller.
///
/// # Safety
///
/// `arg` must point to a properly initialized struct matching `request`.
pub unsafe fn xioctl<T>(fd: RawFd, request: c_ulong, arg: *mut T) -> io::Result<()> {
    const RETRIES: u32 = 4;

    let mut last = io::Error::from_raw_os_error(libc::EINVAL);
    for _ in 0..RETRIES {
        if libc::ioctl(fd, request as _, arg) >= 0 {
            return Ok(());
        }
        last = io::Error::last_os_error();
        match last.raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::ETIMEDOUT) => continue,
            _ => break,
        }
    }
    Err(last)
}

/// True when errno of `err` equals `code`.
pub fn errno_is(err: &io::Error, code: i32) -> bool {
    err.raw_os_error() == Some(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ioctl_numbers_match_kernel_abi() {
        // Spot checks against the values produced by the kernel's _IOC macros
        // on 64-bit Linux.
        assert_eq!(VIDIOC_QUERYCAP, 0x8068_5600);
        assert_eq!(VIDIOC_STREAMON, 0x4004_5612);
        assert_eq!(VIDIOC_STREAMOFF, 0x4004_5613);
        assert_eq!(VIDIOC_QBUF, 0xc058_560f);
        assert_eq!(VIDIOC_DQBUF, 0xc058_5611);
    }

    #[test]
    fn test_struct_sizes_match_kernel_abi() {
        assert_eq!(mem::size_of::<v4l2_capability>(), 104);
        assert_eq!(mem::size_of::<v4l2_format>(), 208);
        assert_eq!(mem::size_of::<v4l2_buffer>(), 88);
        assert_eq!(mem::size_of::<v4l2_plane>(), 64);
        assert_eq!(mem::size_of::<v4l2_exportbuffer>(), 64);
        assert_eq!(mem::size_of::<v4l2_dv_timings>(), 132);
        assert_eq!(mem::size_of::<v4l2_event>(), 136);
        assert_eq!(mem::size_of::<v4l2_streamparm>(), 204);
        assert_eq!(mem::size_of::<v4l2_pix_format_mplane>(), 192);
    }
}
