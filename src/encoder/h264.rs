//! Software H.264 encoding for the shared-memory sink stream.

use openh264::encoder::{BitRate, Encoder, EncoderConfig, FrameRate};
use openh264::formats::YUVSlices;
use openh264::OpenH264API;

use super::convert;
use super::EncoderError;
use crate::clock;
use crate::frame::{self, Frame};

/// The `(width, height, format, stride, dma)` tuple a session was built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrepTuple {
    width: u32,
    height: u32,
    format: u32,
    stride: u32,
    dma: bool,
}

pub struct H264Encoder {
    bitrate_kbps: u32,
    gop: u32,
    fps_hint: u32,

    prepared: Option<PrepTuple>,
    session: Option<Encoder>,
    frames_since_key: u32,
    scratch: Vec<u8>,
}

impl H264Encoder {
    pub fn new(bitrate_kbps: u32, gop: u32, fps_hint: u32) -> Self {
        Self {
            bitrate_kbps,
            gop: gop.max(1),
            fps_hint: if fps_hint == 0 { 30 } else { fps_hint },
            prepared: None,
            session: None,
            frames_since_key: 0,
            scratch: Vec::new(),
        }
    }

    pub fn bitrate_kbps(&self) -> u32 {
        self.bitrate_kbps
    }

    pub fn gop(&self) -> u32 {
        self.gop
    }

    /// (Re)builds the encoding session when the input tuple changes.
    /// A second call with an equal tuple is a no-op.
    pub fn prepare(
        &mut self,
        width: u32,
        height: u32,
        format: u32,
        stride: u32,
        dma: bool,
    ) -> Result<(), EncoderError> {
        let tuple = PrepTuple {
            width,
            height,
            format,
            stride,
            dma,
        };
        if self.prepared == Some(tuple) && self.session.is_some() {
            return Ok(());
        }
        tracing::info!(
            width,
            height,
            format = %frame::fourcc_to_string(format),
            bitrate_kbps = self.bitrate_kbps,
            gop = self.gop,
            "preparing H.264 encoder"
        );
        self.session = Some(self.build_session()?);
        self.prepared = Some(tuple);
        self.frames_since_key = 0;
        Ok(())
    }

    pub fn is_prepared_for(
        &self,
        width: u32,
        height: u32,
        format: u32,
        stride: u32,
        dma: bool,
    ) -> bool {
        self.prepared
            == Some(PrepTuple {
                width,
                height,
                format,
                stride,
                dma,
            })
            && self.session.is_some()
    }

    fn build_session(&self) -> Result<Encoder, EncoderError> {
        let api = OpenH264API::from_source();
        let config = EncoderConfig::new()
            .max_frame_rate(FrameRate::from_hz(self.fps_hint as f32))
            .bitrate(BitRate::from_bps(self.bitrate_kbps * 1000));
        Encoder::with_api_config(api, config).map_err(|err| EncoderError::H264(err.to_string()))
    }

    /// Encodes `src` into `dest`.
    ///
    /// Key frames are produced by rebuilding the session, which guarantees
    /// SPS/PPS in front of the IDR regardless of encoder build flags; that
    /// happens on `force_key`, at every GOP boundary, and right after
    /// `prepare`.
    pub fn compress(&mut self, src: &Frame, dest: &mut Frame, force_key: bool) -> Result<(), EncoderError> {
        let tuple = self.prepared.ok_or_else(|| {
            EncoderError::H264("encoder used before prepare".into())
        })?;

        dest.encode_begin_ts = clock::now_monotonic();

        let mut key = false;
        if force_key || self.frames_since_key >= self.gop || self.session.is_none() {
            self.session = Some(self.build_session()?);
            self.frames_since_key = 0;
            key = true;
        }

        if !convert::to_i420(
            src.data(),
            tuple.width,
            tuple.height,
            tuple.stride,
            tuple.format,
            &mut self.scratch,
        ) {
            return Err(EncoderError::UnsupportedFormat(frame::fourcc_to_string(
                tuple.format,
            )));
        }

        let (width, height) = (tuple.width as usize, tuple.height as usize);
        let y_size = width * height;
        let c_size = y_size / 4;
        let (y_plane, chroma) = self.scratch.split_at(y_size);
        let (u_plane, v_plane) = chroma.split_at(c_size);
        let yuv = YUVSlices::new(
            (y_plane, u_plane, v_plane),
            (width, height),
            (width, width / 2, width / 2),
        );

        let session = self.session.as_mut().expect("session built above");
        let bitstream = session
            .encode(&yuv)
            .map_err(|err| EncoderError::H264(err.to_string()))?;
        let encoded = bitstream.to_vec();

        write_annex_b(&encoded, dest.data_mut());
        self.frames_since_key += 1;

        dest.width = tuple.width;
        dest.height = tuple.height;
        dest.format = frame::FOURCC_H264;
        dest.stride = 0;
        dest.online = src.online;
        dest.key = key;
        dest.grab_ts = src.grab_ts;
        dest.encode_end_ts = clock::now_monotonic();
        Ok(())
    }
}

/// Normalizes the encoder output to Annex-B start codes. Some builds emit
/// AVCC length prefixes instead; detect and rewrite those.
fn write_annex_b(encoded: &[u8], out: &mut Vec<u8>) {
    out.clear();
    let starts_with_code = encoded.len() >= 4
        && encoded[0] == 0
        && encoded[1] == 0
        && (encoded[2] == 1 || (encoded[2] == 0 && encoded[3] == 1));
    if starts_with_code || encoded.len() < 4 {
        out.extend_from_slice(encoded);
        return;
    }

    let mut i = 0;
    while i + 4 <= encoded.len() {
        let nalu_size =
            u32::from_be_bytes([encoded[i], encoded[i + 1], encoded[i + 2], encoded[i + 3]])
                as usize;
        i += 4;
        if nalu_size == 0 || i + nalu_size > encoded.len() {
            break;
        }
        out.extend_from_slice(&[0, 0, 0, 1]);
        out.extend_from_slice(&encoded[i..i + nalu_size]);
        i += nalu_size;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annex_b_passthrough() {
        let data = [0u8, 0, 0, 1, 0x67, 0x42];
        let mut out = Vec::new();
        write_annex_b(&data, &mut out);
        assert_eq!(out, data);
    }

    #[test]
    fn test_avcc_rewritten() {
        let data = [0u8, 0, 0, 2, 0x67, 0x42]; // One 2-byte NAL, AVCC framed
        let mut out = Vec::new();
        write_annex_b(&data, &mut out);
        assert_eq!(out, [0, 0, 0, 1, 0x67, 0x42]);
    }

    #[test]
    fn test_prepare_is_idempotent() {
        let mut enc = H264Encoder::new(5000, 30, 30);
        enc.prepare(64, 48, frame::FOURCC_YUYV, 128, false).unwrap();
        assert!(enc.is_prepared_for(64, 48, frame::FOURCC_YUYV, 128, false));
        // Same tuple: must keep the existing session.
        enc.prepare(64, 48, frame::FOURCC_YUYV, 128, false).unwrap();
        assert!(enc.is_prepared_for(64, 48, frame::FOURCC_YUYV, 128, false));
        assert!(!enc.is_prepared_for(128, 48, frame::FOURCC_YUYV, 128, false));
    }

    #[test]
    fn test_encode_roundtrip_marks_first_frame_key() {
        let mut enc = H264Encoder::new(1000, 30, 30);
        enc.prepare(64, 48, frame::FOURCC_YUYV, 128, false).unwrap();

        let mut src = Frame::new();
        src.set_data(&vec![128u8; 64 * 48 * 2]);
        src.width = 64;
        src.height = 48;
        src.format = frame::FOURCC_YUYV;
        src.stride = 128;
        src.online = true;

        let mut dest = Frame::new();
        enc.compress(&src, &mut dest, false).unwrap();
        assert!(dest.used() > 0);
        assert!(dest.key);
        assert_eq!(dest.format, frame::FOURCC_H264);
        // Annex-B start code in front.
        assert_eq!(&dest.data()[..3], &[0, 0, 0][..]);

        let mut second = Frame::new();
        enc.compress(&src, &mut second, false).unwrap();
        assert!(!second.key);

        let mut forced = Frame::new();
        enc.compress(&src, &mut forced, true).unwrap();
        assert!(forced.key);
    }
}
