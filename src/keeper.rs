// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Stream keeper: owns the set of running [`RecordingContext`]s, keyed by
//! camera id, and reconciles it against configuration/discovery deltas
//! (spec §4.7).
//!
//! Mirrors the teacher's `RecordingManager` shape (one owning map plus
//! add/remove/list/shutdown) but reconciles against a full camera-config
//! snapshot rather than one-at-a-time hot add/remove, since discovery
//! delivers whole change sets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::collaborators::{CredentialResolver, RtspSource};
use crate::config::{CameraConfig, Config};
use crate::error::Result;
use crate::recording::{RecordingContext, RecordingState};
use crate::storage::block_store::BlockStore;
use crate::storage::sizing::required_file_size_for_retention_hours;

const SHUTDOWN_BUDGET: Duration = Duration::from_secs(10);

struct Entry {
    config: CameraConfig,
    context: RecordingContext,
    motion_store: Arc<BlockStore>,
    retention_age_ns: i64,
}

/// Assumed byte rate for sizing the per-camera motion-metrics store
/// (SPEC_FULL §4.11 supplement): metric frames are tiny JSON blobs, not
/// video, so this is sized far smaller than `assumed_byte_rate`.
const MOTION_STORE_BYTE_RATE: u64 = 2_000;

/// Connects to a camera's RTSP endpoint. Boxed trait object so the keeper
/// doesn't depend on the concrete GStreamer adapter (spec §6.6).
pub trait SourceFactory: Send + Sync {
    fn connect(&self, camera: &CameraConfig, rtsp_url: &str) -> Result<Box<dyn RtspSource>>;
}

pub struct StreamKeeper {
    config: Config,
    entries: Mutex<HashMap<String, Entry>>,
    credentials: Arc<dyn CredentialResolver>,
    sources: Arc<dyn SourceFactory>,
}

impl StreamKeeper {
    pub fn new(config: Config, credentials: Arc<dyn CredentialResolver>, sources: Arc<dyn SourceFactory>) -> Self {
        Self { config, entries: Mutex::new(HashMap::new()), credentials, sources }
    }

    /// Start every `record = true` camera from the static config (spec
    /// §4.7, initial load).
    pub fn start_configured(&self) -> Result<()> {
        for cam in self.config.cameras.clone() {
            if cam.record {
                if let Err(e) = self.start_one(cam.clone()) {
                    warn!(camera = cam.id, error = %e, "failed to start camera");
                }
            }
        }
        Ok(())
    }

    /// Reconcile against a changed-streams batch from discovery (spec
    /// §4.8): replace on config-hash change, start new streams, leave
    /// unaffected ones alone.
    pub fn apply_changes(&self, changed: Vec<CameraConfig>) {
        for cam in changed {
            if !cam.record {
                self.stop_one(&cam.id);
                continue;
            }
            self.stop_one(&cam.id);
            if let Err(e) = self.start_one(cam.clone()) {
                warn!(camera = cam.id, error = %e, "failed to (re)start camera after config change");
            }
        }
    }

    fn start_one(&self, cam: CameraConfig) -> Result<()> {
        let Some(rtsp_url) = cam.rtsp_url.clone() else {
            warn!(camera = cam.id, "no rtsp_url, skipping");
            return Ok(());
        };

        let path = self.config.camera_path(&cam.id);
        if !path.exists() {
            let retention_hours = cam.retention_days_override.unwrap_or(self.config.storage.retention_days) as u64 * 24;
            let (num_blocks, total) = required_file_size_for_retention_hours(
                retention_hours,
                self.config.storage.assumed_byte_rate,
                self.config.storage.block_size,
            );
            info!(
                camera = cam.id,
                num_blocks,
                size = crate::storage::sizing::human_readable_file_size(total as f64),
                "allocating new storage file"
            );
            BlockStore::allocate(&path, self.config.storage.block_size, num_blocks)?;
        }
        let store = Arc::new(BlockStore::open(&path)?);
        store.lock_exclusive()?;

        let retention_hours = cam.retention_days_override.unwrap_or(self.config.storage.retention_days) as u64 * 24;
        let motion_path = self.config.motion_path(&cam.id);
        if !motion_path.exists() {
            let (num_blocks, _) =
                required_file_size_for_retention_hours(retention_hours, MOTION_STORE_BYTE_RATE, self.config.storage.block_size);
            BlockStore::allocate(&motion_path, self.config.storage.block_size, num_blocks)?;
        }
        let motion_store = Arc::new(BlockStore::open(&motion_path)?);

        let (_user, _pass) = self.credentials.resolve(&cam.id);
        let source = self.sources.connect(&cam, &rtsp_url)?;

        let retention_age_ns = retention_hours as i64 * 3600 * 1_000_000_000;

        let context = RecordingContext::start(
            cam.clone(),
            source,
            store,
            motion_store.clone(),
            self.config.storage.seal_threshold,
            retention_age_ns,
        );

        info!(camera = cam.id, name = cam.name, "recording context started");
        self.entries.lock().insert(cam.id.clone(), Entry { config: cam, context, motion_store, retention_age_ns });
        Ok(())
    }

    fn stop_one(&self, camera_id: &str) {
        if let Some(mut entry) = self.entries.lock().remove(camera_id) {
            entry.context.stop();
            info!(camera = camera_id, "recording context stopped");
        }
    }

    /// Reap contexts that have gone `Dead` (crashed sources, stalled
    /// feeds) and reconstruct any that are still configured to record —
    /// the supervisor-loop step in spec §4.7 item 3, and §7's `Timeout`
    /// row ("keeper reconstructs on next tick if camera still enabled").
    /// `Dead` is terminal for a single [`RecordingContext`]; restarting
    /// it is this call's job, not the context's own. Returns the camera
    /// ids that were reaped, restarted or not.
    pub fn reconcile_dead(&self) -> Vec<String> {
        let dead: Vec<(String, CameraConfig)> = {
            let mut entries = self.entries.lock();
            let dead_ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.context.state() == RecordingState::Dead)
                .map(|(id, _)| id.clone())
                .collect();
            let mut dead = Vec::with_capacity(dead_ids.len());
            for id in dead_ids {
                if let Some(entry) = entries.remove(&id) {
                    dead.push((id, entry.config));
                }
            }
            dead
        };

        let mut reaped = Vec::with_capacity(dead.len());
        for (id, cam) in dead {
            warn!(camera = id, "recording context went dead, reconstructing");
            if cam.record {
                if let Err(e) = self.start_one(cam) {
                    warn!(camera = id, error = %e, "failed to reconstruct dead camera");
                }
            }
            reaped.push(id);
        }
        reaped
    }

    pub fn list_cameras(&self) -> Vec<CameraConfig> {
        self.entries.lock().values().map(|e| e.config.clone()).collect()
    }

    pub fn is_recording(&self, camera_id: &str) -> bool {
        self.entries.lock().get(camera_id).map(|e| e.context.state() != RecordingState::Dead).unwrap_or(false)
    }

    pub fn bytes_per_second(&self, camera_id: &str) -> Option<f64> {
        self.entries.lock().get(camera_id).map(|e| e.context.bytes_per_second())
    }

    /// The running camera's block store, for the read-only HTTP surface
    /// (spec §4.11). `None` if the camera isn't currently recording.
    pub fn store_for(&self, camera_id: &str) -> Option<Arc<BlockStore>> {
        self.entries.lock().get(camera_id).map(|e| e.context.store().clone())
    }

    /// The running camera's parallel motion-metrics store (spec §4.11).
    pub fn motion_store_for(&self, camera_id: &str) -> Option<Arc<BlockStore>> {
        self.entries.lock().get(camera_id).map(|e| e.motion_store.clone())
    }

    pub fn retention_age_ns(&self, camera_id: &str) -> Option<i64> {
        self.entries.lock().get(camera_id).map(|e| e.retention_age_ns)
    }

    /// Stop every context, bounded to [`SHUTDOWN_BUDGET`] (spec §8.1).
    pub fn shutdown(&self) {
        info!("stream keeper shutting down");
        let entries: Vec<(String, Entry)> = self.entries.lock().drain().collect();
        let handles: Vec<_> = entries
            .into_iter()
            .map(|(id, mut entry)| {
                std::thread::spawn(move || {
                    entry.context.stop();
                    id
                })
            })
            .collect();

        let deadline = std::time::Instant::now() + SHUTDOWN_BUDGET;
        for handle in handles {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                warn!("shutdown budget exceeded, abandoning remaining worker joins");
                break;
            }
            match handle.join() {
                Ok(id) => info!(camera = id, "stopped"),
                Err(_) => warn!("worker thread panicked during shutdown"),
            }
        }
    }
}

/// Predicate adapter used by [`crate::discovery::DiscoveryAgent`] to avoid
/// interrogating a camera that already has an active recording session
/// (spec §6.6, §4.8).
impl crate::collaborators::IsRecordingPredicate for StreamKeeper {
    fn is_recording(&self, camera_id: &str) -> bool {
        StreamKeeper::is_recording(self, camera_id)
    }
}
