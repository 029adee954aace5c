use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior, interval};
use tracing::{debug, warn};
use webrtc::api::media_engine::MIME_TYPE_H264;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::encoder::H264Encoder;
use crate::peer::H264_FMTP_LINE;

/// RTP clock rate for video. Frame timestamps are expressed in this base.
pub const VIDEO_TIME_BASE: u32 = 90_000;

/// One uncompressed video frame with its presentation timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Packed BGR24 pixels, row-major.
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Presentation timestamp in `time_base` ticks.
    pub pts: i64,
    /// Ticks per second of the `pts` clock.
    pub time_base: u32,
    /// Display duration of this frame.
    pub duration: Duration,
}

/// Supplier of timestamped video frames at a fixed cadence.
///
/// Sessions receive a factory for these rather than a concrete type, so
/// tests and future capture backends can swap the source without touching
/// the session.
#[async_trait]
pub trait VideoSource: Send {
    /// Media kind discriminator; always `"video"` for video sources.
    fn kind(&self) -> &'static str {
        "video"
    }

    /// Produce the next frame, paced to roughly one frame interval.
    async fn next_frame(&mut self) -> Result<VideoFrame>;
}

pub type VideoSourceFactory = Box<dyn Fn() -> Box<dyn VideoSource> + Send + Sync>;

/// Paces frame production and hands out monotonic presentation timestamps
/// in the transport's 90 kHz clock.
pub struct FrameClock {
    fps: u32,
    next_pts: i64,
    ticker: Option<Interval>,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        Self {
            fps,
            next_pts: 0,
            ticker: None,
        }
    }

    /// Sleep until the next frame slot, then return its pts and time base.
    /// The first tick completes immediately.
    pub async fn tick(&mut self) -> (i64, u32) {
        let fps = self.fps;
        let ticker = self.ticker.get_or_insert_with(|| {
            let mut ticker = interval(Duration::from_secs(1) / fps);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        ticker.tick().await;
        let pts = self.next_pts;
        self.next_pts += i64::from(VIDEO_TIME_BASE / self.fps);
        (pts, VIDEO_TIME_BASE)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs(1) / self.fps
    }
}

const DISC_RADIUS: i64 = 40;
const CAPTION: &str = "IRIS WEBRTC";
const CAPTION_ORIGIN: (i64, i64) = (20, 40);
const GLYPH_SCALE: i64 = 2;

/// Synthetic video source: an oscillating green disc over a black
/// background with a static caption. Stands in for a real camera in tests
/// and demo deployments.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    fps: u32,
    clock: FrameClock,
    frame_index: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, fps: u32) -> Self {
        Self {
            width,
            height,
            fps,
            clock: FrameClock::new(fps),
            frame_index: 0,
        }
    }

    fn render(&self, t: f64) -> Vec<u8> {
        let (w, h) = (i64::from(self.width), i64::from(self.height));
        let mut data = vec![0u8; (w * h * 3) as usize];

        let cx = w / 2 + ((w as f64 / 4.0) * t.sin()) as i64;
        let cy = h / 2 + ((h as f64 / 4.0) * t.cos()) as i64;
        draw_disc(&mut data, w, h, cx, cy, DISC_RADIUS, [0, 255, 0]);

        let (x0, y0) = CAPTION_ORIGIN;
        draw_caption(&mut data, w, h, x0, y0, CAPTION, [255, 255, 255]);
        data
    }
}

#[async_trait]
impl VideoSource for TestPatternSource {
    async fn next_frame(&mut self) -> Result<VideoFrame> {
        let (pts, time_base) = self.clock.tick().await;
        let t = self.frame_index as f64 / f64::from(self.fps);
        self.frame_index += 1;
        Ok(VideoFrame {
            data: self.render(t),
            width: self.width,
            height: self.height,
            pts,
            time_base,
            duration: self.clock.frame_duration(),
        })
    }
}

fn draw_disc(data: &mut [u8], w: i64, h: i64, cx: i64, cy: i64, radius: i64, bgr: [u8; 3]) {
    for y in (cy - radius).max(0)..=(cy + radius).min(h - 1) {
        for x in (cx - radius).max(0)..=(cx + radius).min(w - 1) {
            let (dx, dy) = (x - cx, y - cy);
            if dx * dx + dy * dy <= radius * radius {
                let i = ((y * w + x) * 3) as usize;
                data[i..i + 3].copy_from_slice(&bgr);
            }
        }
    }
}

fn draw_caption(data: &mut [u8], w: i64, h: i64, x0: i64, y0: i64, text: &str, bgr: [u8; 3]) {
    let mut pen_x = x0;
    for c in text.chars() {
        let rows = glyph(c);
        for (row, bits) in rows.iter().enumerate() {
            for col in 0..5i64 {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for sy in 0..GLYPH_SCALE {
                    for sx in 0..GLYPH_SCALE {
                        let x = pen_x + col * GLYPH_SCALE + sx;
                        let y = y0 + row as i64 * GLYPH_SCALE + sy;
                        if x < 0 || y < 0 || x >= w || y >= h {
                            continue;
                        }
                        let i = ((y * w + x) * 3) as usize;
                        data[i..i + 3].copy_from_slice(&bgr);
                    }
                }
            }
        }
        pen_x += 6 * GLYPH_SCALE;
    }
}

/// 5x7 glyphs for the caption, one byte per row, low five bits used.
/// Characters outside the set render as blanks.
fn glyph(c: char) -> [u8; 7] {
    match c {
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x1B, 0x11],
        _ => [0; 7],
    }
}

/// Create the outbound video track for a peer connection and start the pump
/// feeding it encoded frames from `source`.
///
/// The returned handle aborts the pump; session teardown uses it to stop
/// frame production.
pub async fn attach_video_track(
    pc: &Arc<RTCPeerConnection>,
    source: Box<dyn VideoSource>,
) -> Result<JoinHandle<()>> {
    let track = Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_H264.to_string(),
            clock_rate: VIDEO_TIME_BASE,
            sdp_fmtp_line: H264_FMTP_LINE.to_string(),
            ..Default::default()
        },
        source.kind().to_string(),
        "iris".to_string(),
    ));

    let rtp_sender = pc
        .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
        .await
        .context("Failed to add video track")?;

    // Interceptors such as NACK stall unless incoming RTCP is drained.
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((_, _)) = rtp_sender.read(&mut rtcp_buf).await {}
    });

    Ok(tokio::spawn(run_video_pump(track, source)))
}

/// Pull frames from the source, encode, and write them to the track.
///
/// A source failure ends the pump and with it the outbound stream; sample
/// write errors are logged and the next frame is tried anyway, since
/// write_sample also fails transiently while the track is unbound.
async fn run_video_pump(track: Arc<TrackLocalStaticSample>, mut source: Box<dyn VideoSource>) {
    let mut encoder = match H264Encoder::new() {
        Ok(encoder) => encoder,
        Err(e) => {
            warn!("Failed to initialize H.264 encoder: {e:#}");
            return;
        }
    };
    let mut frame_count: u64 = 0;

    loop {
        let frame = match source.next_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Video source failed, closing outbound track: {e:#}");
                return;
            }
        };

        let data = match encoder.encode_bgr(&frame) {
            Ok(data) => data,
            Err(e) => {
                warn!("Failed to encode video frame: {e:#}");
                continue;
            }
        };
        if data.is_empty() {
            // The encoder is allowed to buffer before the first access unit.
            continue;
        }

        let sample = Sample {
            data,
            duration: frame.duration,
            ..Default::default()
        };
        match track.write_sample(&sample).await {
            Ok(()) => {
                frame_count += 1;
                if frame_count.is_multiple_of(300) {
                    debug!(frame_count, "Video frames written to track");
                }
            }
            Err(e) => debug!("Write video sample: {e:#}"),
        }
    }
}
