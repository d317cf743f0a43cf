// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Discovery agent: polls a pluggable device provider every 60 s, hashes
//! each stream's config to detect new or changed cameras, and emits the
//! changed set to the stream keeper (spec §4.8).
//!
//! Grounded in the original `r_agent`/`r_stream_config` pair: a supervisor
//! thread with a fixed 60 s timer, an MD5 change-hash over a fixed field
//! order, and a jittered interrogation cache. The provider itself (ONVIF
//! in the original) is a trait here — no ONVIF client is in scope.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};
use rand::Rng;
use tracing::{info, warn};

use crate::collaborators::{CredentialResolver, IsRecordingPredicate};
use crate::error::Result;

/// A discovered stream's configuration, mirroring `r_stream_config`
/// (spec §4.8). Optional fields are skipped, not zero-filled, when
/// hashed — matching the original's null-check-per-field behavior.
#[derive(Debug, Clone, Default)]
pub struct StreamConfig {
    pub id: String,
    pub camera_name: Option<String>,
    pub ipv4: Option<String>,
    pub port: Option<i32>,
    pub protocol: Option<String>,
    pub xaddrs: Option<String>,
    pub address: Option<String>,
    pub rtsp_url: Option<String>,
    pub video_codec: Option<String>,
    pub video_codec_parameters: Option<String>,
    pub video_timebase: Option<i32>,
    pub audio_codec: Option<String>,
    pub audio_codec_parameters: Option<String>,
    pub audio_timebase: Option<i32>,
}

/// MD5 over the fixed field order `id | ipv4 | xaddrs | address |
/// rtsp_url | video_codec | video_codec_parameters | video_timebase |
/// audio_codec | audio_codec_parameters | audio_timebase`, skipping any
/// field that is `None` (spec §4.8).
pub fn hash_stream_config(sc: &StreamConfig) -> String {
    let mut h = Md5::new();
    h.update(sc.id.as_bytes());
    if let Some(v) = &sc.ipv4 {
        h.update(v.as_bytes());
    }
    if let Some(v) = &sc.xaddrs {
        h.update(v.as_bytes());
    }
    if let Some(v) = &sc.address {
        h.update(v.as_bytes());
    }
    if let Some(v) = &sc.rtsp_url {
        h.update(v.as_bytes());
    }
    if let Some(v) = &sc.video_codec {
        h.update(v.as_bytes());
    }
    if let Some(v) = &sc.video_codec_parameters {
        h.update(v.as_bytes());
    }
    if let Some(v) = sc.video_timebase {
        h.update(v.to_le_bytes());
    }
    if let Some(v) = &sc.audio_codec {
        h.update(v.as_bytes());
    }
    if let Some(v) = &sc.audio_codec_parameters {
        h.update(v.as_bytes());
    }
    if let Some(v) = sc.audio_timebase {
        h.update(v.to_le_bytes());
    }
    format!("{:x}", h.finalize())
}

/// `id = md5(address)`, the stable camera identity (spec §4.8).
pub fn hash_address(address: &str) -> String {
    let mut h = Md5::new();
    h.update(address.as_bytes());
    format!("{:x}", h.finalize())
}

/// One bare device sighting, before interrogation fills in codec/RTSP
/// details.
#[derive(Debug, Clone)]
pub struct DiscoveredDevice {
    pub name: String,
    pub ipv4: String,
    pub xaddrs: String,
    pub address: String,
}

/// Pluggable discovery backend (ONVIF in the original, generic here;
/// spec §6.6).
pub trait DeviceProvider: Send {
    /// One discovery sweep; an empty result means nothing new or
    /// reachable this round.
    fn poll(&mut self) -> Result<Vec<DiscoveredDevice>>;

    /// Fetch codec/RTSP detail for one device, using resolved
    /// credentials.
    fn interrogate(
        &mut self,
        device: &DiscoveredDevice,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<StreamConfig>;
}

struct CacheEntry {
    config: StreamConfig,
    expires_at: Instant,
}

/// Interrogation cache keyed by camera id, expiring at `60 min +
/// random(0..10) min` to avoid every camera re-interrogating in lockstep
/// (spec §4.8).
struct InterrogationCache {
    entries: HashMap<String, CacheEntry>,
}

impl InterrogationCache {
    fn new() -> Self {
        Self { entries: HashMap::new() }
    }

    fn get(&mut self, id: &str, now: Instant) -> Option<StreamConfig> {
        match self.entries.get(id) {
            Some(e) if e.expires_at > now => Some(e.config.clone()),
            _ => {
                self.entries.remove(id);
                None
            }
        }
    }

    fn put(&mut self, id: String, config: StreamConfig, base_mins: u64, jitter_mins: u64, now: Instant) {
        let jitter = if jitter_mins == 0 { 0 } else { rand::thread_rng().gen_range(0..jitter_mins) };
        let ttl = Duration::from_secs((base_mins + jitter) * 60);
        self.entries.insert(id, CacheEntry { config, expires_at: now + ttl });
    }
}

/// `(config, hash)` pairs newly discovered or changed this sweep.
pub type ChangedStreams = Vec<(StreamConfig, String)>;

struct Shared {
    stop_requested: AtomicBool,
}

/// Supervisor thread polling a [`DeviceProvider`] every `poll_interval`
/// and emitting [`ChangedStreams`] batches over `changed_tx` (spec
/// §4.8). Owns no storage or recording state itself — that's the stream
/// keeper's job.
pub struct DiscoveryAgent {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl DiscoveryAgent {
    pub fn start(
        mut provider: Box<dyn DeviceProvider>,
        credentials: Arc<dyn CredentialResolver>,
        is_recording: Arc<dyn IsRecordingPredicate>,
        changed_tx: Sender<ChangedStreams>,
        poll_interval: Duration,
        cache_base_mins: u64,
        cache_jitter_mins: u64,
    ) -> Self {
        let shared = Arc::new(Shared { stop_requested: AtomicBool::new(false) });
        let worker_shared = shared.clone();

        let handle = std::thread::spawn(move || {
            let mut device_hashes: HashMap<String, String> = HashMap::new();
            let mut cache = InterrogationCache::new();
            info!("discovery agent running");

            loop {
                if worker_shared.stop_requested.load(Ordering::Relaxed) {
                    break;
                }

                match provider.poll() {
                    Ok(devices) if !devices.is_empty() => {
                        let mut changed: ChangedStreams = Vec::new();
                        let now = Instant::now();

                        for device in devices {
                            let id = hash_address(&device.address);
                            if is_recording.is_recording(&id) {
                                continue;
                            }

                            let sc = if let Some(cached) = cache.get(&id, now) {
                                cached
                            } else {
                                let (user, pass) = credentials.resolve(&id);
                                match provider.interrogate(&device, user.as_deref(), pass.as_deref()) {
                                    Ok(mut sc) => {
                                        sc.id = id.clone();
                                        cache.put(id.clone(), sc.clone(), cache_base_mins, cache_jitter_mins, now);
                                        sc
                                    }
                                    Err(e) => {
                                        warn!(camera = id, error = %e, "interrogation failed");
                                        continue;
                                    }
                                }
                            };

                            let new_hash = hash_stream_config(&sc);
                            let is_new_or_changed =
                                device_hashes.get(&id).map(|h| h != &new_hash).unwrap_or(true);
                            if is_new_or_changed {
                                device_hashes.insert(id.clone(), new_hash.clone());
                                changed.push((sc, new_hash));
                            }
                        }

                        if !changed.is_empty() {
                            info!(count = changed.len(), "emitting changed streams");
                            let _ = changed_tx.send(changed);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "discovery poll failed"),
                }

                for _ in 0..poll_interval.as_millis() / 100 {
                    if worker_shared.stop_requested.load(Ordering::Relaxed) {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(100));
                }
            }
            info!("discovery agent stopped");
        });

        Self { shared, handle: Some(handle) }
    }

    /// Drop a camera's remembered config hash so the next sweep treats
    /// it as new (spec §4.8 `forget`).
    pub fn stop(&mut self) {
        self.shared.stop_requested.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DiscoveryAgent {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_changes_when_rtsp_url_changes() {
        let mut sc = StreamConfig { id: "cam1".into(), address: Some("10.0.0.5".into()), ..Default::default() };
        let h1 = hash_stream_config(&sc);
        sc.rtsp_url = Some("rtsp://10.0.0.5/stream1".into());
        let h2 = hash_stream_config(&sc);
        assert_ne!(h1, h2);
    }

    #[test]
    fn null_fields_are_skipped_not_zero_filled() {
        let a = StreamConfig { id: "cam1".into(), ..Default::default() };
        let b = StreamConfig { id: "cam1".into(), port: Some(80), protocol: Some("http".into()), ..Default::default() };
        // port/protocol aren't part of the hash's field list.
        assert_eq!(hash_stream_config(&a), hash_stream_config(&b));
    }

    #[test]
    fn address_hash_is_stable_md5() {
        assert_eq!(hash_address("10.0.0.5"), hash_address("10.0.0.5"));
        assert_ne!(hash_address("10.0.0.5"), hash_address("10.0.0.6"));
    }
}
