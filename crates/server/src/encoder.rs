use anyhow::{Context, Result, ensure};
use bytes::Bytes;
use openh264::encoder::Encoder;
use openh264::formats::{RgbSliceU8, YUVBuffer};

use crate::video::VideoFrame;

/// Wraps the OpenH264 encoder, turning BGR frames into Annex-B H.264
/// access units suitable for a sample track.
pub struct H264Encoder {
    inner: Encoder,
    rgb_scratch: Vec<u8>,
}

impl H264Encoder {
    pub fn new() -> Result<Self> {
        let inner = Encoder::new().context("Failed to create OpenH264 encoder")?;
        Ok(Self {
            inner,
            rgb_scratch: Vec::new(),
        })
    }

    /// Encode one BGR24 frame. An empty result means the encoder produced
    /// no output for this input.
    pub fn encode_bgr(&mut self, frame: &VideoFrame) -> Result<Bytes> {
        let expected = (frame.width * frame.height * 3) as usize;
        ensure!(
            frame.data.len() == expected,
            "Frame buffer is {} bytes, expected {expected}",
            frame.data.len()
        );

        // The OpenH264 converters take RGB; swap the channel order first.
        self.rgb_scratch.clear();
        self.rgb_scratch.reserve(expected);
        for px in frame.data.chunks_exact(3) {
            self.rgb_scratch.extend_from_slice(&[px[2], px[1], px[0]]);
        }

        let rgb = RgbSliceU8::new(
            &self.rgb_scratch,
            (frame.width as usize, frame.height as usize),
        );
        let yuv = YUVBuffer::from_rgb_source(rgb);
        let bitstream = self
            .inner
            .encode(&yuv)
            .context("OpenH264 encode failed")?;
        Ok(Bytes::from(bitstream.to_vec()))
    }
}
