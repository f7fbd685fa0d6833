//! KMS framebuffer output: flips captured frames (or a diagnostic banner)
//! on VSync.

pub mod text;

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::path::PathBuf;

use drm::buffer::{Buffer, DrmFourcc};
use drm::control::{connector, crtc, framebuffer, Device as ControlDevice, Event, Mode, ModeTypeFlags, PageFlipFlags};
use drm::Device;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoder::convert;

use text::TextRenderer;

#[derive(Error, Debug)]
pub enum DrmError {
    #[error("drm i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("no display connected")]
    NoDisplay,

    #[error("output is not open")]
    Closed,

    #[error("unsupported frame for direct output")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputState {
    Closed,
    Ok,
    NoDisplay,
}

/// How well the chosen display mode fits the captured source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeSelection {
    /// The mode can show the source directly.
    Matched,
    /// Only the connector's preferred mode was available; the source does
    /// not fit and a diagnostic stub should be shown instead.
    Fallback,
}

/// Why a stub screen is shown instead of live video.
#[derive(Debug, Clone, PartialEq)]
pub enum StubKind {
    NoSignal,
    BadResolution { width: u32, height: u32, hz: f32 },
    BadFormat,
    Busy,
}

impl StubKind {
    fn message(&self) -> String {
        match self {
            Self::NoSignal => "< NO SIGNAL >".to_string(),
            Self::BadResolution { width, height, hz } => format!(
                "< UNSUPPORTED RESOLUTION >\n \n< {width}x{height}p{hz:.2} >\n \nby this display"
            ),
            Self::BadFormat => "< UNSUPPORTED CAPTURE FORMAT >".to_string(),
            Self::Busy => "< ONLINE IS ACTIVE >".to_string(),
        }
    }
}

struct Card(File);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

#[derive(Debug, Clone)]
pub struct DrmConfig {
    pub path: PathBuf,
    pub port: String,
    pub timeout: f64,
}

struct Output {
    card: Card,
    crtc: crtc::Handle,
    mode: Mode,
    fb: framebuffer::Handle,
    dumb: drm::control::dumbbuffer::DumbBuffer,
    flip_pending: bool,
}

/// A KMS sink in the `CLOSED -> OK -> CLOSED` cycle, with a transient
/// `NO_DISPLAY` while the connector status reads disconnected.
pub struct DrmOutput {
    config: DrmConfig,
    output: Option<Output>,
    text: TextRenderer,
}

impl DrmOutput {
    pub fn new(config: DrmConfig) -> Self {
        Self {
            config,
            output: None,
            text: TextRenderer::new(),
        }
    }

    pub fn state(&self) -> OutputState {
        match self.output {
            Some(_) => OutputState::Ok,
            None if !self.display_connected() => OutputState::NoDisplay,
            None => OutputState::Closed,
        }
    }

    /// Reads `/sys/class/drm/<card>-<port>/status`; `d` means unplugged.
    fn display_connected(&self) -> bool {
        let card_name = self
            .config
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "card0".into());
        let status = format!("/sys/class/drm/{card_name}-{}/status", self.config.port);
        match std::fs::read(&status) {
            Ok(bytes) => bytes.first() != Some(&b'd'),
            Err(_) => true, // No sysfs node, trust the mode probe
        }
    }

    /// Opens the device and picks connector, CRTC and mode.
    ///
    /// With a source resolution the mode is chosen as: exact match, else
    /// same width and smaller height, else the connector's preferred mode
    /// (reported as a fallback so the caller shows a diagnostic stub).
    /// Without a source, the preferred mode is used for stub screens.
    pub fn open(&mut self, source: Option<(u32, u32)>) -> Result<ModeSelection, DrmError> {
        self.close();

        if !self.display_connected() {
            return Err(DrmError::NoDisplay);
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&self.config.path)?;
        let card = Card(file);

        let resources = card.resource_handles()?;
        let mut chosen: Option<(connector::Handle, connector::Info)> = None;
        for handle in resources.connectors() {
            let conn = card.get_connector(*handle, false)?;
            if conn.state() == connector::State::Connected
                && format!("{:?}-{}", conn.interface(), conn.interface_id()) == self.config.port
            {
                chosen = Some((*handle, conn));
                break;
            }
        }
        // Fall back to the first connected connector when the port name
        // does not match the interface naming.
        if chosen.is_none() {
            for handle in resources.connectors() {
                let conn = card.get_connector(*handle, false)?;
                if conn.state() == connector::State::Connected {
                    chosen = Some((*handle, conn));
                    break;
                }
            }
        }
        let (conn_handle, conn) = chosen.ok_or(DrmError::NoDisplay)?;

        let (mode, selection) = pick_mode(conn.modes(), source).ok_or(DrmError::NoDisplay)?;
        let (mode_width, mode_height) = mode.size();
        info!(
            width = mode_width,
            height = mode_height,
            refresh = mode.vrefresh(),
            matched = (selection == ModeSelection::Matched),
            "using display mode"
        );

        let crtc_handle = conn
            .current_encoder()
            .and_then(|enc| card.get_encoder(enc).ok())
            .and_then(|enc| enc.crtc())
            .or_else(|| resources.crtcs().first().copied())
            .ok_or(DrmError::NoDisplay)?;

        let dumb = card.create_dumb_buffer(
            (mode_width as u32, mode_height as u32),
            DrmFourcc::Xrgb8888,
            32,
        )?;
        let fb = card.add_framebuffer(&dumb, 24, 32)?;
        card.set_crtc(crtc_handle, Some(fb), (0, 0), &[conn_handle], Some(mode))?;

        self.output = Some(Output {
            card,
            crtc: crtc_handle,
            mode,
            fb,
            dumb,
            flip_pending: false,
        });
        Ok(selection)
    }

    pub fn close(&mut self) {
        if let Some(output) = self.output.take() {
            let _ = output.card.destroy_framebuffer(output.fb);
            let _ = output.card.destroy_dumb_buffer(output.dumb);
            debug!("drm output closed");
        }
    }

    /// Waits for a pending page flip to complete, bounded by the timeout.
    pub fn wait_for_vsync(&mut self) -> Result<(), DrmError> {
        let output = match &mut self.output {
            Some(output) => output,
            None => return Ok(()),
        };
        if !output.flip_pending {
            return Ok(());
        }

        let fd: RawFd = output.card.as_fd().as_raw_fd();
        let mut poll_fd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = (self.config.timeout * 1000.0) as libc::c_int;
        let polled = unsafe { libc::poll(&mut poll_fd, 1, timeout_ms) };
        if polled < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if polled == 0 {
            warn!("vsync wait timed out");
            output.flip_pending = false;
            return Ok(());
        }

        for event in output.card.receive_events()? {
            if let Event::PageFlip(_) = event {
                output.flip_pending = false;
            }
        }
        Ok(())
    }

    /// Draws a raw RGB-convertible frame into the dumb buffer and flips it.
    pub fn expose_raw(
        &mut self,
        data: &[u8],
        width: u32,
        height: u32,
        stride: u32,
        format: u32,
    ) -> Result<(), DrmError> {
        if !self.display_connected() {
            return Err(DrmError::NoDisplay);
        }
        if self.output.is_none() {
            return Err(DrmError::Closed);
        }

        let mut rgb = Vec::new();
        if !convert::to_rgb(data, width, height, stride, format, &mut rgb) {
            return Err(DrmError::Unsupported);
        }
        self.blit_rgb(&rgb, width, height)?;
        self.flip()
    }

    /// Draws a diagnostic text banner into the dumb buffer and flips it.
    /// Shown while there is no signal, the mode does not fit the source,
    /// or the output is otherwise unusable for live video.
    pub fn expose_stub(&mut self, stub: StubKind) -> Result<(), DrmError> {
        if !self.display_connected() {
            return Err(DrmError::NoDisplay);
        }
        let output = self.output.as_ref().ok_or(DrmError::Closed)?;
        let (mode_width, mode_height) = output.mode.size();
        let (mode_width, mode_height) = (mode_width as u32, mode_height as u32);

        info!(message = %stub.message().replace('\n', " "), "showing stub screen");
        let canvas = self
            .text
            .draw(&stub.message(), mode_width, mode_height)
            .to_vec();
        self.blit_rgb(&canvas, mode_width, mode_height)?;
        self.flip()
    }

    /// Keeps the no-signal banner on screen, opening the output in stub
    /// mode when needed. Driven by the pipeline while the source is down.
    pub fn ensure_no_signal(&mut self) -> Result<(), DrmError> {
        if self.output.is_none() {
            self.open(None)?;
        }
        self.wait_for_vsync()?;
        self.expose_stub(StubKind::NoSignal)
    }

    /// Copies packed RGB24 rows into the XRGB8888 dumb buffer, top-left
    /// anchored and letterboxed with black.
    fn blit_rgb(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<(), DrmError> {
        let output = self.output.as_mut().ok_or(DrmError::Closed)?;
        let (mode_width, mode_height) = output.mode.size();
        let (mode_width, mode_height) = (mode_width as usize, mode_height as usize);
        let pitch = output.dumb.pitch() as usize;

        let mut mapping = output.card.map_dumb_buffer(&mut output.dumb)?;
        let pixels = mapping.as_mut();
        pixels.fill(0);
        let copy_height = (height as usize).min(mode_height);
        let copy_width = (width as usize).min(mode_width);
        for row in 0..copy_height {
            let src = &rgb[row * width as usize * 3..];
            let dest = &mut pixels[row * pitch..];
            for col in 0..copy_width {
                // XRGB8888 little-endian: B G R X
                dest[col * 4] = src[col * 3 + 2];
                dest[col * 4 + 1] = src[col * 3 + 1];
                dest[col * 4 + 2] = src[col * 3];
                dest[col * 4 + 3] = 0;
            }
        }
        Ok(())
    }

    fn flip(&mut self) -> Result<(), DrmError> {
        let output = self.output.as_mut().ok_or(DrmError::Closed)?;
        output
            .card
            .page_flip(output.crtc, output.fb, PageFlipFlags::EVENT, None)?;
        output.flip_pending = true;
        Ok(())
    }
}

impl Drop for DrmOutput {
    fn drop(&mut self) {
        self.close();
    }
}

fn pick_mode(modes: &[Mode], source: Option<(u32, u32)>) -> Option<(Mode, ModeSelection)> {
    if let Some((width, height)) = source {
        // Exact resolution match first.
        if let Some(mode) = modes
            .iter()
            .find(|m| m.size().0 as u32 == width && m.size().1 as u32 == height)
        {
            return Some((*mode, ModeSelection::Matched));
        }
        // Same width, closest smaller height.
        if let Some(mode) = modes
            .iter()
            .filter(|m| m.size().0 as u32 == width && (m.size().1 as u32) < height)
            .max_by_key(|m| m.size().1)
        {
            return Some((*mode, ModeSelection::Matched));
        }
    }
    // The connector's preferred mode; without a source this is the normal
    // choice, with one it means the source cannot be shown directly.
    let selection = if source.is_some() {
        ModeSelection::Fallback
    } else {
        ModeSelection::Matched
    };
    if let Some(mode) = modes
        .iter()
        .find(|m| m.mode_type().contains(ModeTypeFlags::PREFERRED))
    {
        return Some((*mode, selection));
    }
    modes.first().map(|mode| (*mode, selection))
}
