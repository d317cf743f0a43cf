// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Collaborator interfaces the core consumes but does not implement in
//! full generality (spec §6.6). Each is a trait at the seam plus one
//! concrete, minimal adapter — GStreamer for RTSP, the `image` crate's
//! JPEG encoder for stills. A caller embedding this engine is expected to
//! bring its own credential store and recording-session tracker.

use std::sync::mpsc::Receiver;
use std::time::Duration;

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::info;

use crate::error::{RevereError, Result};
use crate::storage::MediaType;

/// One encoded sample delivered by an [`RtspSource`].
#[derive(Debug, Clone)]
pub struct Sample {
    pub ts: u64,
    pub is_key: bool,
    pub media_type: MediaType,
    pub bytes: Vec<u8>,
    /// Source-relative presentation time, in the source's own clock base
    /// (spec §6.6); the recording context converts this to wall-clock.
    pub pts_clock_base: i64,
}

/// One decoded video frame, produced alongside the encoded stream so the
/// motion analyzer never has to decode the stored codec itself (spec
/// §4.6 step 5: "Motion runs on a decoded copy; it never blocks
/// ingest").
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub format: crate::motion::PixelFormat,
}

/// An RTSP-plus-codec source delivering encoded samples to a recording
/// context. The concrete adapter owns its own worker thread; `recv`
/// blocks the caller's recording thread, which is the intended
/// suspension point (spec §5).
pub trait RtspSource: Send {
    /// Block up to `timeout` waiting for the next sample. `Ok(None)`
    /// means a clean end-of-stream; `Err` means an unrecoverable
    /// protocol error (caller should transition to `Dead`).
    fn recv(&mut self, timeout: Duration) -> Result<Option<Sample>>;

    /// Non-blocking poll for the next decoded frame, if the source
    /// produces one (e.g. a parallel `decodebin` branch). Default: no
    /// decoded frames available, so motion analysis is simply skipped.
    fn try_recv_decoded(&mut self) -> Option<DecodedFrame> {
        None
    }

    /// Negotiated video codec name/parameters, available once the first
    /// video sample has been produced.
    fn video_codec(&self) -> Option<(String, String)>;
    fn audio_codec(&self) -> Option<(String, String)>;

    /// Stop the underlying pipeline. Idempotent.
    fn close(&mut self);
}

/// `(camera_id) -> (user?, pass?)` (spec §6.6).
pub trait CredentialResolver: Send + Sync {
    fn resolve(&self, camera_id: &str) -> (Option<String>, Option<String>);
}

/// `(camera_id) -> bool`, queried by discovery to avoid contending with
/// an active recording session (spec §6.6, §4.8).
pub trait IsRecordingPredicate: Send + Sync {
    fn is_recording(&self, camera_id: &str) -> bool;
}

/// `(decoded_frame, format) -> bytes` (spec §6.6), used by the read
/// surface to encode a key frame for delivery.
pub trait ImageEncoder: Send + Sync {
    fn encode(&self, data: &[u8], width: u32, height: u32, format: crate::motion::PixelFormat) -> Result<Vec<u8>>;
}

/// Decodes one stored key frame's payload into raw pixels for
/// [`ImageEncoder`]. Transcoding/decoding the video codec itself is out
/// of scope (spec §1 Non-goals); this is a stub seam, not an
/// implementation, mirroring the object-detection stub the spec calls
/// out for the same reason.
pub trait FrameDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<(Vec<u8>, u32, u32, crate::motion::PixelFormat)>;
}

/// JPEG backend over the `image` crate, grounded in the pack's
/// `image`/`imageproc`-based examples rather than an external codec
/// library.
pub struct JpegEncoder {
    pub quality: u8,
}

impl Default for JpegEncoder {
    fn default() -> Self {
        Self { quality: 85 }
    }
}

impl ImageEncoder for JpegEncoder {
    fn encode(&self, data: &[u8], width: u32, height: u32, format: crate::motion::PixelFormat) -> Result<Vec<u8>> {
        use crate::motion::PixelFormat;
        use image::codecs::jpeg::JpegEncoder as CodecEncoder;
        use image::ColorType;

        let (rgb, color_type) = match format {
            PixelFormat::Gray8 => (data.to_vec(), ColorType::L8),
            PixelFormat::Rgb => (data.to_vec(), ColorType::Rgb8),
            PixelFormat::Bgr => {
                let mut rgb = data.to_vec();
                for px in rgb.chunks_exact_mut(3) {
                    px.swap(0, 2);
                }
                (rgb, ColorType::Rgb8)
            }
            PixelFormat::Bgra => {
                let mut rgba = data.to_vec();
                for px in rgba.chunks_exact_mut(4) {
                    px.swap(0, 2);
                }
                (rgba, ColorType::Rgba8)
            }
        };

        let mut out = Vec::new();
        let mut encoder = CodecEncoder::new_with_quality(&mut out, self.quality);
        encoder
            .encode(&rgb, width, height, color_type.into())
            .map_err(|e| RevereError::Protocol(format!("JPEG encode failed: {e}")))?;
        Ok(out)
    }
}

/// GStreamer-backed [`RtspSource`], grounded in the teacher's
/// `camera::CameraStream` pipeline but delivering raw encoded samples
/// (not a muxed container) over a blocking `std::sync::mpsc` channel so
/// the recording context's thread (not a tokio task) can consume it.
pub struct GstRtspSource {
    pipeline: gst::Pipeline,
    rx: Receiver<Sample>,
    decoded_rx: Receiver<DecodedFrame>,
    video_codec: Option<(String, String)>,
    audio_codec: Option<(String, String)>,
}

impl GstRtspSource {
    /// Connect to `rtsp_url`, depayloading H.264 video into raw access
    /// units for storage, while a parallel `tee` branch decodes to raw
    /// BGR frames for the motion analyzer (spec §4.6 step 5).
    pub fn connect(camera_id: &str, rtsp_url: &str) -> Result<Self> {
        gst::init().map_err(|e| RevereError::Protocol(format!("gst::init: {e}")))?;

        let pipeline_str = format!(
            "rtspsrc location={rtsp_url} latency=200 protocols=tcp name=src \
             src. ! rtph264depay ! h264parse config-interval=-1 ! tee name=t \
             t. ! queue ! appsink name=video_sink emit-signals=true max-buffers=32 drop=true sync=false \
             t. ! queue leaky=downstream max-size-buffers=2 ! avdec_h264 ! videoconvert ! \
             video/x-raw,format=BGR ! appsink name=decoded_sink emit-signals=true max-buffers=2 drop=true sync=false"
        );

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| RevereError::Protocol(format!("parse_launch: {e}")))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| RevereError::Protocol("pipeline launch did not yield a Pipeline".into()))?;

        let appsink: gst_app::AppSink = pipeline
            .by_name("video_sink")
            .ok_or_else(|| RevereError::Protocol("video_sink element missing".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| RevereError::Protocol("video_sink is not an AppSink".into()))?;

        let (tx, rx) = std::sync::mpsc::sync_channel::<Sample>(128);
        appsink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let pts = buf.pts().map(|t| t.nseconds() as i64).unwrap_or(0);
                    let is_key = !buf.flags().contains(gst::BufferFlags::DELTA_UNIT);
                    let out = Sample {
                        ts: 0, // wall-clock conversion happens in the recording context
                        is_key,
                        media_type: MediaType::Video,
                        bytes: map.as_slice().to_vec(),
                        pts_clock_base: pts,
                    };
                    let _ = tx.try_send(out);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        let decoded_sink: gst_app::AppSink = pipeline
            .by_name("decoded_sink")
            .ok_or_else(|| RevereError::Protocol("decoded_sink element missing".into()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| RevereError::Protocol("decoded_sink is not an AppSink".into()))?;

        let (decoded_tx, decoded_rx) = std::sync::mpsc::sync_channel::<DecodedFrame>(2);
        decoded_sink.set_callbacks(
            gst_app::AppSinkCallbacks::builder()
                .new_sample(move |sink| {
                    let sample = sink.pull_sample().map_err(|_| gst::FlowError::Error)?;
                    let buf = sample.buffer().ok_or(gst::FlowError::Error)?;
                    let caps = sample.caps().ok_or(gst::FlowError::Error)?;
                    let s = caps.structure(0).ok_or(gst::FlowError::Error)?;
                    let width: i32 = s.get("width").map_err(|_| gst::FlowError::Error)?;
                    let height: i32 = s.get("height").map_err(|_| gst::FlowError::Error)?;
                    let map = buf.map_readable().map_err(|_| gst::FlowError::Error)?;
                    let frame = DecodedFrame {
                        data: map.as_slice().to_vec(),
                        width: width as u32,
                        height: height as u32,
                        format: crate::motion::PixelFormat::Bgr,
                    };
                    let _ = decoded_tx.try_send(frame);
                    Ok(gst::FlowSuccess::Ok)
                })
                .build(),
        );

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| RevereError::Protocol(format!("set_state Playing: {e}")))?;

        info!(camera = camera_id, rtsp_url, "RTSP pipeline started");

        Ok(Self {
            pipeline,
            rx,
            decoded_rx,
            video_codec: Some(("h264".into(), String::new())),
            audio_codec: None,
        })
    }
}

impl RtspSource for GstRtspSource {
    fn recv(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        match self.rx.recv_timeout(timeout) {
            Ok(sample) => Ok(Some(sample)),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Ok(None),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                Err(RevereError::Protocol("RTSP pipeline channel disconnected".into()))
            }
        }
    }

    fn try_recv_decoded(&mut self) -> Option<DecodedFrame> {
        self.decoded_rx.try_recv().ok()
    }

    fn video_codec(&self) -> Option<(String, String)> {
        self.video_codec.clone()
    }

    fn audio_codec(&self) -> Option<(String, String)> {
        self.audio_codec.clone()
    }

    fn close(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

impl Drop for GstRtspSource {
    fn drop(&mut self) {
        self.close();
    }
}
