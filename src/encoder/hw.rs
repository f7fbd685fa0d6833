//! Pass-through for sources that already deliver JPEG.
//!
//! The capture hardware does the actual compression; this backend only
//! validates the bitstream header and copies it out of the capture buffer.

use super::EncoderError;
use crate::clock;
use crate::frame::{self, Frame};

pub fn compress(
    data: &[u8],
    width: u32,
    height: u32,
    dest: &mut Frame,
) -> Result<(), EncoderError> {
    dest.encode_begin_ts = clock::now_monotonic();

    if data.len() < 2 || data[0] != 0xFF || data[1] != 0xD8 {
        return Err(EncoderError::Jpeg("passed frame is not a JPEG".into()));
    }
    dest.set_data(data);

    dest.width = width;
    dest.height = height;
    dest.format = frame::FOURCC_JPEG;
    dest.stride = 0;
    dest.online = true;
    dest.key = true;
    dest.encode_end_ts = clock::now_monotonic();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passthrough_copies_bytes() {
        let jpeg = [0xFFu8, 0xD8, 1, 2, 3, 0xFF, 0xD9];
        let mut dest = Frame::new();
        compress(&jpeg, 640, 480, &mut dest).unwrap();
        assert_eq!(dest.data(), &jpeg);
        assert_eq!(dest.width, 640);
        assert_eq!(dest.format, frame::FOURCC_JPEG);
    }

    #[test]
    fn test_rejects_non_jpeg() {
        let mut dest = Frame::new();
        assert!(compress(&[0u8; 16], 640, 480, &mut dest).is_err());
    }
}
