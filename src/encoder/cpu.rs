//! Software JPEG encoding of raw capture formats.

use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

use super::convert;
use super::EncoderError;
use crate::clock;
use crate::frame::{self, Frame};

/// Compresses a raw frame into `dest` as JPEG.
pub fn compress(
    data: &[u8],
    width: u32,
    height: u32,
    format: u32,
    stride: u32,
    quality: u32,
    dest: &mut Frame,
) -> Result<(), EncoderError> {
    dest.encode_begin_ts = clock::now_monotonic();

    let mut rgb = Vec::new();
    if !convert::to_rgb(data, width, height, stride, format, &mut rgb) {
        return Err(EncoderError::UnsupportedFormat(frame::fourcc_to_string(
            format,
        )));
    }

    let out = dest.data_mut();
    out.clear();
    let mut encoder = JpegEncoder::new_with_quality(&mut *out, quality.clamp(1, 100) as u8);
    encoder
        .encode(&rgb, width, height, ExtendedColorType::Rgb8)
        .map_err(|err| EncoderError::Jpeg(err.to_string()))?;

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
    fn test_compress_yuyv_produces_jpeg() {
        let data = vec![128u8; 64 * 48 * 2];
        let mut dest = Frame::new();
        compress(&data, 64, 48, frame::FOURCC_YUYV, 128, 80, &mut dest).unwrap();
        assert!(dest.used() > 0);
        assert_eq!(dest.format, frame::FOURCC_JPEG);
        assert_eq!(&dest.data()[..2], &[0xFF, 0xD8]);
        let tail = &dest.data()[dest.used() - 2..];
        assert_eq!(tail, &[0xFF, 0xD9]);
        assert!(dest.encode_end_ts >= dest.encode_begin_ts);
    }

    #[test]
    fn test_compress_rejects_compressed_input() {
        let data = vec![0u8; 1024];
        let mut dest = Frame::new();
        let result = compress(&data, 64, 48, frame::FOURCC_MJPEG, 0, 80, &mut dest);
        assert!(matches!(result, Err(EncoderError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_quality_changes_size() {
        let mut data = Vec::new();
        for i in 0..64 * 48 * 2 {
            data.push((i % 251) as u8); // Noisy input so quality matters
        }
        let mut low = Frame::new();
        let mut high = Frame::new();
        compress(&data, 64, 48, frame::FOURCC_YUYV, 128, 10, &mut low).unwrap();
        compress(&data, 64, 48, frame::FOURCC_YUYV, 128, 95, &mut high).unwrap();
        assert!(high.used() > low.used());
    }
}
