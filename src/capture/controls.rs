//! Image control application (brightness, contrast, ...).

use std::os::unix::io::RawFd;

use tracing::{debug, info, warn};

use super::sys;

/// How a single control should be driven.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ControlMode {
    /// Leave the control untouched.
    #[default]
    Skip,
    /// Enable the driver's automatic mode.
    Auto,
    /// Reset to the driver's default value.
    Default,
    /// Set an explicit value.
    Value(i32),
}

impl ControlMode {
    /// Parses `auto`, `default`, or an integer value.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "default" => Some(Self::Default),
            _ => s.parse::<i32>().ok().map(Self::Value),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceControls {
    pub brightness: ControlMode,
    pub contrast: ControlMode,
    pub saturation: ControlMode,
    pub hue: ControlMode,
    pub gamma: ControlMode,
    pub sharpness: ControlMode,
    pub backlight_compensation: ControlMode,
    pub white_balance: ControlMode,
    pub gain: ControlMode,
    pub color_effect: ControlMode,
    pub rotate: ControlMode,
    pub flip_vertical: ControlMode,
    pub flip_horizontal: ControlMode,
}

/// Applies all configured controls. Failures are logged, never fatal.
pub fn apply(fd: RawFd, ctl: &DeviceControls) {
    apply_auto(fd, "brightness", sys::V4L2_CID_AUTOBRIGHTNESS, sys::V4L2_CID_BRIGHTNESS, ctl.brightness);
    apply_manual(fd, "contrast", sys::V4L2_CID_CONTRAST, ctl.contrast);
    apply_manual(fd, "saturation", sys::V4L2_CID_SATURATION, ctl.saturation);
    apply_auto(fd, "hue", sys::V4L2_CID_HUE_AUTO, sys::V4L2_CID_HUE, ctl.hue);
    apply_manual(fd, "gamma", sys::V4L2_CID_GAMMA, ctl.gamma);
    apply_manual(fd, "sharpness", sys::V4L2_CID_SHARPNESS, ctl.sharpness);
    apply_manual(fd, "backlight_compensation", sys::V4L2_CID_BACKLIGHT_COMPENSATION, ctl.backlight_compensation);
    apply_auto(fd, "white_balance", sys::V4L2_CID_AUTO_WHITE_BALANCE, sys::V4L2_CID_WHITE_BALANCE_TEMPERATURE, ctl.white_balance);
    apply_auto(fd, "gain", sys::V4L2_CID_AUTOGAIN, sys::V4L2_CID_GAIN, ctl.gain);
    apply_manual(fd, "color_effect", sys::V4L2_CID_COLORFX, ctl.color_effect);
    apply_manual(fd, "rotate", sys::V4L2_CID_ROTATE, ctl.rotate);
    apply_manual(fd, "flip_vertical", sys::V4L2_CID_VFLIP, ctl.flip_vertical);
    apply_manual(fd, "flip_horizontal", sys::V4L2_CID_HFLIP, ctl.flip_horizontal);
}

fn apply_manual(fd: RawFd, name: &str, cid: u32, mode: ControlMode) {
    match mode {
        ControlMode::Skip | ControlMode::Auto => {}
        ControlMode::Default => set_default(fd, name, cid, false),
        ControlMode::Value(value) => set_value(fd, name, cid, value, false),
    }
}

fn apply_auto(fd: RawFd, name: &str, auto_cid: u32, manual_cid: u32, mode: ControlMode) {
    match mode {
        ControlMode::Skip => {}
        ControlMode::Auto => set_value(fd, name, auto_cid, 1, false),
        ControlMode::Value(value) => {
            set_value(fd, name, auto_cid, 0, true);
            set_value(fd, name, manual_cid, value, false);
        }
        ControlMode::Default => {
            set_value(fd, name, auto_cid, 0, true); // Reset the inactive flag
            set_default(fd, name, manual_cid, false);
            set_default(fd, name, auto_cid, false);
        }
    }
}

fn query(fd: RawFd, name: &str, cid: u32, quiet: bool) -> Option<sys::v4l2_queryctrl> {
    let mut query = sys::v4l2_queryctrl::zeroed();
    query.id = cid;
    let ok = unsafe { sys::xioctl(fd, sys::VIDIOC_QUERYCTRL, &mut query) }.is_ok()
        && query.flags & sys::V4L2_CTRL_FLAG_DISABLED == 0;
    if !ok {
        if !quiet {
            warn!(control = name, "changing this control is unsupported");
        }
        return None;
    }
    Some(query)
}

fn set_default(fd: RawFd, name: &str, cid: u32, quiet: bool) {
    if let Some(info) = query(fd, name, cid, quiet) {
        set_checked(fd, name, cid, info.default_value, &info, quiet);
    }
}

fn set_value(fd: RawFd, name: &str, cid: u32, value: i32, quiet: bool) {
    if let Some(info) = query(fd, name, cid, quiet) {
        set_checked(fd, name, cid, value, &info, quiet);
    }
}

fn set_checked(
    fd: RawFd,
    name: &str,
    cid: u32,
    value: i32,
    info: &sys::v4l2_queryctrl,
    quiet: bool,
) {
    if value < info.minimum
        || value > info.maximum
        || (info.step != 0 && (value - info.minimum) % info.step != 0)
    {
        if !quiet {
            warn!(
                control = name,
                value,
                min = info.minimum,
                max = info.maximum,
                step = info.step,
                "invalid control value"
            );
        }
        return;
    }
    let mut ctl = sys::v4l2_control { id: cid, value };
    if unsafe { sys::xioctl(fd, sys::VIDIOC_S_CTRL, &mut ctl) }.is_err() {
        if !quiet {
            warn!(control = name, "can't set control");
        }
    } else if !quiet {
        info!(control = name, value = ctl.value, "applied control");
    } else {
        debug!(control = name, value = ctl.value, "applied control");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_mode_parse() {
        assert_eq!(ControlMode::parse("auto"), Some(ControlMode::Auto));
        assert_eq!(ControlMode::parse("DEFAULT"), Some(ControlMode::Default));
        assert_eq!(ControlMode::parse("-5"), Some(ControlMode::Value(-5)));
        assert_eq!(ControlMode::parse("128"), Some(ControlMode::Value(128)));
        assert_eq!(ControlMode::parse("bogus"), None);
    }
}
