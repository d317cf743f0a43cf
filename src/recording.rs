// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Recording context — the per-camera pipeline that consumes encoded
//! frames, normalizes timestamps, drives the storage writer, and watches
//! for stall (spec §4.6).
//!
//! Runs on its own OS thread (spec §5); `stop()` signals it to drain and
//! joins, idempotently.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::collaborators::RtspSource;
use crate::config::CameraConfig;
use crate::motion::{MotionParams, MotionState};
use crate::storage::block_store::BlockStore;
use crate::storage::writer::StorageWriter;
use crate::storage::MediaType;

const STALL_BUDGET: Duration = Duration::from_secs(30);
const RECV_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Starting,
    Running,
    Dead,
}

/// Bytes-per-second accounting over a sliding 60 s window (SPEC_FULL
/// §4.6 supplement — the source tracks raw totals; this generalizes to a
/// rolling rate so long-lived cameras don't dilute toward zero).
#[derive(Default)]
struct ByteRateWindow {
    samples: VecDeque<(Instant, u64)>,
}

impl ByteRateWindow {
    fn record(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > Duration::from_secs(60) {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn bytes_per_second(&self, now: Instant) -> f64 {
        let Some(&(oldest, _)) = self.samples.front() else { return 0.0 };
        let elapsed = now.duration_since(oldest).as_secs_f64().max(1.0);
        let total: u64 = self.samples.iter().map(|(_, b)| b).sum();
        total as f64 / elapsed
    }
}

struct Shared {
    state: Mutex<RecordingState>,
    rate: Mutex<ByteRateWindow>,
    stop_requested: AtomicBool,
}

/// Runtime singleton per recorded camera (spec §3.1).
pub struct RecordingContext {
    camera_id: String,
    store: Arc<BlockStore>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

fn now_ns() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos() as i64
}

impl RecordingContext {
    /// Construct and start the pipeline (spec §4.6 `Starting`). `source`
    /// is already connected; `store` is the already-open per-camera
    /// block store, `motion_store` its parallel metrics store.
    pub fn start(
        camera: CameraConfig,
        mut source: Box<dyn RtspSource>,
        store: Arc<BlockStore>,
        motion_store: Arc<BlockStore>,
        seal_threshold: f64,
        retention_age_ns: i64,
    ) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(RecordingState::Starting),
            rate: Mutex::new(ByteRateWindow::default()),
            stop_requested: AtomicBool::new(false),
        });

        let worker_shared = shared.clone();
        let camera_id = camera.id.clone();
        let motion_enabled = camera.motion_enabled;
        let worker_store = store.clone();

        let handle = std::thread::spawn(move || {
            let mut writer = StorageWriter::new(worker_store, seal_threshold, retention_age_ns);
            let mut motion_writer = StorageWriter::new(motion_store, seal_threshold, retention_age_ns);
            let mut motion = motion_enabled.then(|| MotionState::new(MotionParams::default()));
            let start_wall = now_ns();
            let mut last_v_time = Instant::now();
            let mut last_a_time = Instant::now();
            let mut video_codec_set = false;
            let mut audio_codec_set = false;

            *worker_shared.state.lock().unwrap() = RecordingState::Running;
            info!(camera = %camera_id, "Recording context running");

            loop {
                if worker_shared.stop_requested.load(Ordering::Relaxed) {
                    break;
                }
                let should_die = match source.recv(RECV_POLL) {
                    Ok(Some(sample)) => {
                        if !video_codec_set {
                            if let Some((name, params)) = source.video_codec() {
                                writer.set_video_codec(name, params);
                                video_codec_set = true;
                            }
                        }
                        if !audio_codec_set {
                            if let Some((name, params)) = source.audio_codec() {
                                writer.set_audio_codec(name, params);
                                audio_codec_set = true;
                            }
                        }

                        let wall_ts = (start_wall + sample.pts_clock_base).max(0) as u64;
                        match sample.media_type {
                            MediaType::Video => last_v_time = Instant::now(),
                            MediaType::Audio => last_a_time = Instant::now(),
                            MediaType::All => {}
                        }

                        let bytes = sample.bytes.len() as u64;
                        if let Err(e) =
                            writer.write_frame(sample.media_type, &sample.bytes, sample.is_key, wall_ts, now_ns())
                        {
                            warn!(camera = %camera_id, error = %e, "write_frame failed");
                            matches!(e, crate::error::RevereError::StorageExhausted | crate::error::RevereError::Protocol(_))
                        } else {
                            worker_shared.rate.lock().unwrap().record(Instant::now(), bytes);
                            false
                        }
                    }
                    Ok(None) => false, // poll timeout, not a stall by itself
                    Err(e) => {
                        warn!(camera = %camera_id, error = %e, "RTSP source error");
                        true
                    }
                };

                // Motion runs on a decoded copy; it never blocks ingest of
                // the next encoded sample (spec §4.6 step 5).
                if let Some(motion) = motion.as_mut() {
                    while let Some(frame) = source.try_recv_decoded() {
                        if let Some(info) = motion.process(&frame.data, frame.width, frame.height, frame.format) {
                            match serde_json::to_vec(&info) {
                                Ok(payload) => {
                                    if let Err(e) = motion_writer.write_frame(
                                        MediaType::Video,
                                        &payload,
                                        true,
                                        now_ns().max(0) as u64,
                                        now_ns(),
                                    ) {
                                        warn!(camera = %camera_id, error = %e, "motion metric write failed");
                                    }
                                }
                                Err(e) => warn!(camera = %camera_id, error = %e, "motion metric serialize failed"),
                            }
                        }
                    }
                }

                let stalled = last_v_time.elapsed() > STALL_BUDGET;
                if should_die || stalled {
                    if stalled {
                        warn!(camera = %camera_id, "no video for {:?}, marking Dead", STALL_BUDGET);
                    }
                    break;
                }
                let _ = last_a_time; // retained for parity with the source's per-stream stall bookkeeping
            }

            source.close();
            let _ = writer.flush();
            let _ = motion_writer.flush();
            *worker_shared.state.lock().unwrap() = RecordingState::Dead;
            info!(camera = %camera_id, "Recording context dead");
        });

        Self { camera_id: camera.id, store, shared, handle: Some(handle) }
    }

    pub fn camera_id(&self) -> &str {
        &self.camera_id
    }

    /// The camera's block store, for concurrent read access from the
    /// HTTP surface while this context's own thread keeps writing
    /// (spec §5: readers and the writer serialize internally on the
    /// store's mmap mutex, not via the file's advisory lock).
    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn state(&self) -> RecordingState {
        *self.shared.state.lock().unwrap()
    }

    pub fn dead(&self) -> bool {
        self.state() == RecordingState::Dead
    }

    pub fn bytes_per_second(&self) -> f64 {
        self.shared.rate.lock().unwrap().bytes_per_second(Instant::now())
    }

    /// Signal the worker to drain and join. Idempotent (spec §8.1).
    pub fn stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for RecordingContext {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_rate_window_averages_over_trailing_minute() {
        let mut w = ByteRateWindow::default();
        let t0 = Instant::now();
        w.record(t0, 1_000_000);
        let t1 = t0 + Duration::from_secs(10);
        w.record(t1, 1_000_000);
        let rate = w.bytes_per_second(t1);
        assert!(rate > 0.0);
    }
}
