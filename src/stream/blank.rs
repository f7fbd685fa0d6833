//! Placeholder frame shown while the source is offline.

use std::path::Path;

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::{info, warn};

use crate::frame::{self, Frame};

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

/// Loads the user-supplied placeholder JPEG, or generates the built-in one.
pub fn load(path: Option<&Path>) -> Frame {
    if let Some(path) = path {
        match load_external(path) {
            Ok(frame) => {
                info!(path = %path.display(), "using external blank placeholder");
                return frame;
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "can't use external blank placeholder");
            }
        }
    }
    info!("using internal blank placeholder");
    generate(DEFAULT_WIDTH, DEFAULT_HEIGHT)
}

fn load_external(path: &Path) -> Result<Frame, String> {
    let data = std::fs::read(path).map_err(|err| err.to_string())?;
    // Decode only to validate the file and learn its resolution.
    let decoded = image::load_from_memory(&data).map_err(|err| err.to_string())?;

    let mut blank = Frame::new();
    blank.set_data(&data);
    blank.width = decoded.width();
    blank.height = decoded.height();
    blank.format = frame::FOURCC_JPEG;
    blank.online = false;
    Ok(blank)
}

/// Generates a black JPEG placeholder of the given resolution.
pub fn generate(width: u32, height: u32) -> Frame {
    let rgb = vec![0u8; (width * height * 3) as usize];
    let mut blank = Frame::new();
    {
        let out = blank.data_mut();
        let mut encoder = JpegEncoder::new_with_quality(&mut *out, 75);
        encoder
            .encode(&rgb, width, height, ExtendedColorType::Rgb8)
            .expect("encoding a black frame to memory never fails");
    }
    blank.width = width;
    blank.height = height;
    blank.format = frame::FOURCC_JPEG;
    blank.online = false;
    blank
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_generate_is_jpeg() {
        let blank = generate(320, 240);
        assert_eq!(blank.width, 320);
        assert_eq!(blank.height, 240);
        assert!(!blank.online);
        assert_eq!(&blank.data()[..2], &[0xFF, 0xD8]);
    }

    #[test]
    fn test_load_falls_back_on_garbage_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"definitely not a jpeg").unwrap();
        let blank = load(Some(file.path()));
        // Built-in placeholder dimensions.
        assert_eq!(blank.width, DEFAULT_WIDTH);
        assert_eq!(blank.height, DEFAULT_HEIGHT);
    }

    #[test]
    fn test_load_external() {
        let generated = generate(160, 120);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(generated.data()).unwrap();
        let blank = load(Some(file.path()));
        assert_eq!(blank.width, 160);
        assert_eq!(blank.height, 120);
    }
}
