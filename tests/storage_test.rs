// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage + keeper integration tests.
//!
//! Run with: `cargo test`

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;

use revere::collaborators::{CredentialResolver, RtspSource, Sample};
use revere::config::{ApiConfig, CameraConfig, Config, DiscoveryConfig, StorageConfig};
use revere::error::{RevereError, Result};
use revere::keeper::{SourceFactory, StreamKeeper};
use revere::storage::block_store::BlockStore;
use revere::storage::reader::StorageReader;
use revere::storage::writer::{prune, StorageWriter};
use revere::storage::MediaType;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

#[test]
fn allocate_write_and_read_roundtrip() {
    let dir = tmp_dir();
    let path = dir.path().join("cam1.rvd");
    BlockStore::allocate(&path, 4096, 4).expect("allocate");

    let store = BlockStore::open(&path).expect("open");
    {
        let mut writer = StorageWriter::new(Arc::new(store), 0.75, 14 * 24 * 3600 * 1_000_000_000);
        writer.set_video_codec("h264".into(), "profile=high".into());
        writer.write_frame(MediaType::Video, b"frame-0-key", true, 1000, 1000).unwrap();
        writer.write_frame(MediaType::Video, b"frame-1-delta", false, 2000, 2000).unwrap();
        writer.flush().unwrap();
    }

    let store = BlockStore::open(&path).expect("reopen");
    let reader = StorageReader::new(&store);
    let result = reader.query(MediaType::Video, 0, u64::MAX).expect("query");
    assert_eq!(result.frames.len(), 2);
    assert_eq!(result.frames[0].data, b"frame-0-key");
    assert_eq!(result.frames[1].data, b"frame-1-delta");
    assert_eq!(result.video_codec_name, "h264");
    assert_eq!(reader.first_ts().unwrap(), Some(1000));
    assert_eq!(reader.last_ts().unwrap(), Some(2000));
}

#[test]
fn seals_a_new_block_on_key_frame_past_threshold() {
    let dir = tmp_dir();
    let path = dir.path().join("cam1.rvd");
    // Small block so a handful of frames pushes past the 0.75 seal threshold.
    BlockStore::allocate(&path, 512, 4).expect("allocate");
    let store = Arc::new(BlockStore::open(&path).expect("open"));

    let mut writer = StorageWriter::new(store.clone(), 0.75, 14 * 24 * 3600 * 1_000_000_000);
    writer.write_frame(MediaType::Video, &vec![0xAAu8; 200], true, 1000, 1000).unwrap();
    // Still under threshold: a second key frame should not roll the block yet.
    writer.write_frame(MediaType::Video, &vec![0xBBu8; 50], true, 2000, 2000).unwrap();
    writer.flush().unwrap();

    let reader = StorageReader::new(&store);
    let blocks = reader.query_blocks(0, u64::MAX).unwrap();
    // One sealed block holding both GOPs, since neither push crossed the
    // threshold before the next key frame arrived.
    assert_eq!(blocks.len(), 1);
}

#[test]
fn dumbdex_mutation_rolls_back_after_simulated_crash() {
    let dir = tmp_dir();
    let path = dir.path().join("cam1.rvd");
    BlockStore::allocate(&path, 4096, 4).expect("allocate");

    {
        let store = Arc::new(BlockStore::open(&path).expect("open"));
        let mut writer = StorageWriter::new(store.clone(), 0.75, 14 * 24 * 3600 * 1_000_000_000);
        writer.write_frame(MediaType::Video, b"sealed-before-crash", true, 1000, 1000).unwrap();
        writer.flush().unwrap();
        // `store` drops here with no journal outstanding (insert() commits
        // on success) — this establishes the pre-crash baseline.
    }

    // Hand-craft a journal as if a second insert died mid-mutation: record
    // the current count word's pre-image, then corrupt it in place without
    // committing.
    {
        let store = BlockStore::open(&path).expect("reopen");
        let mut journal = revere::storage::journal::Journal::begin(&path).expect("begin journal");
        let mut view = store.dumbdex_region();
        journal.record(&view, 0, 4).expect("record pre-image");
        view[0..4].copy_from_slice(&99u32.to_le_bytes());
        view.flush().unwrap();
        // Deliberately drop `journal` without calling `commit_journal`,
        // simulating a crash after the write but before fsync+delete.
        drop(journal);
    }

    // Reopening must detect the stale journal and roll the region back.
    let store = BlockStore::open(&path).expect("reopen after crash");
    let reader = StorageReader::new(&store);
    let blocks = reader.query_blocks(0, u64::MAX).unwrap();
    assert_eq!(blocks.len(), 1, "rollback should restore the one committed block, not the corrupted count");
    let mut journal_path = path.clone().into_os_string();
    journal_path.push(".journal");
    assert!(!std::path::Path::new(&journal_path).exists());
}

#[test]
fn prune_frees_blocks_older_than_retention() {
    let dir = tmp_dir();
    let path = dir.path().join("cam1.rvd");
    BlockStore::allocate(&path, 512, 4).expect("allocate");
    let store = Arc::new(BlockStore::open(&path).expect("open"));

    let retention_ns = 1_000i64;
    let mut writer = StorageWriter::new(store.clone(), 0.01, retention_ns);
    // Each key frame past the 1% threshold rolls to a new block, so four
    // key frames occupy all four blocks.
    for i in 0..4u64 {
        writer.write_frame(MediaType::Video, &vec![0xCCu8; 50], true, i * 10, (i * 10) as i64).unwrap();
    }
    writer.flush().unwrap();

    let reader = StorageReader::new(&store);
    assert_eq!(reader.query_blocks(0, u64::MAX).unwrap().len(), 4);

    // now_ns far past every frame's timestamp plus the retention window:
    // every block becomes stale.
    let freed = prune(&store, 100_000, retention_ns).unwrap();
    assert_eq!(freed, 4);
    assert_eq!(reader.query_blocks(0, u64::MAX).unwrap().len(), 0);
}

/// A scripted, in-memory [`RtspSource`] for exercising [`StreamKeeper`]
/// without a real RTSP endpoint: yields a fixed sample sequence once, then
/// blocks until `close` is called.
struct ScriptedSource {
    samples: Mutex<Vec<Sample>>,
    closed: Arc<std::sync::atomic::AtomicBool>,
}

impl RtspSource for ScriptedSource {
    fn recv(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        if let Some(sample) = self.samples.lock().unwrap().pop() {
            return Ok(Some(sample));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(20)));
        if self.closed.load(Ordering::Relaxed) {
            Err(RevereError::Protocol("closed".into()))
        } else {
            Ok(None)
        }
    }

    fn video_codec(&self) -> Option<(String, String)> {
        Some(("h264".into(), String::new()))
    }

    fn audio_codec(&self) -> Option<(String, String)> {
        None
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
    }
}

struct ScriptedFactory {
    spawned: AtomicUsize,
}

impl SourceFactory for ScriptedFactory {
    fn connect(&self, _camera: &CameraConfig, _rtsp_url: &str) -> Result<Box<dyn RtspSource>> {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let mut samples = vec![
            Sample { ts: 0, is_key: false, media_type: MediaType::Video, bytes: b"delta".to_vec(), pts_clock_base: 1_000_000 },
            Sample { ts: 0, is_key: true, media_type: MediaType::Video, bytes: b"key".to_vec(), pts_clock_base: 0 },
        ];
        // `recv` above pops from the back, so push in reverse delivery order.
        samples.reverse();
        Ok(Box::new(ScriptedSource { samples: Mutex::new(samples), closed: Arc::new(std::sync::atomic::AtomicBool::new(false)) }))
    }
}

struct NoCreds;
impl CredentialResolver for NoCreds {
    fn resolve(&self, _camera_id: &str) -> (Option<String>, Option<String>) {
        (None, None)
    }
}

fn test_config(top_dir: &std::path::Path) -> Config {
    Config {
        top_dir: top_dir.to_path_buf(),
        storage: StorageConfig {
            block_size: 4096,
            seal_threshold: 0.75,
            segment_gap_secs: 10,
            retention_days: 14,
            assumed_byte_rate: 1_000_000,
        },
        cameras: vec![CameraConfig {
            id: "cam1".into(),
            name: "Front door".into(),
            ipv4: "10.0.0.5".into(),
            onvif_url: String::new(),
            rtsp_url: Some("rtsp://10.0.0.5/stream1".into()),
            record: true,
            motion_enabled: false,
            retention_days_override: None,
            motion_sensitivity: 2.0,
        }],
        api: ApiConfig { enabled: false, port: 0 },
        discovery: DiscoveryConfig { poll_interval_secs: 60, cache_base_mins: 60, cache_jitter_mins: 10 },
    }
}

#[test]
fn stream_keeper_starts_writes_and_stops_cleanly() {
    let dir = tmp_dir();
    let config = test_config(dir.path());
    let factory = Arc::new(ScriptedFactory { spawned: AtomicUsize::new(0) });
    let keeper = StreamKeeper::new(config.clone(), Arc::new(NoCreds), factory.clone());

    keeper.start_configured().expect("start");
    assert!(keeper.is_recording("cam1"));
    assert_eq!(factory.spawned.load(Ordering::Relaxed), 1);

    // Give the worker thread a moment to drain the scripted samples and
    // flush them into the block store.
    std::thread::sleep(Duration::from_millis(200));
    keeper.shutdown();

    let path = config.camera_path("cam1");
    assert!(path.exists(), "camera storage file should have been allocated");
    let store = BlockStore::open(&path).expect("reopen after shutdown");
    let reader = StorageReader::new(&store);
    let result = reader.query(MediaType::Video, 0, u64::MAX).expect("query");
    assert_eq!(result.frames.len(), 1, "writer drops frames until the first video key frame opens a block");
    assert!(result.frames[0].key);
}

/// A source that yields one key frame, then fails every subsequent
/// `recv` — drives its [`RecordingContext`] to `Dead` almost immediately,
/// for exercising [`StreamKeeper::reconcile_dead`].
struct DyingSource {
    samples: Mutex<Vec<Sample>>,
}

impl RtspSource for DyingSource {
    fn recv(&mut self, timeout: Duration) -> Result<Option<Sample>> {
        if let Some(sample) = self.samples.lock().unwrap().pop() {
            return Ok(Some(sample));
        }
        std::thread::sleep(timeout.min(Duration::from_millis(10)));
        Err(RevereError::Protocol("source died".into()))
    }

    fn video_codec(&self) -> Option<(String, String)> {
        Some(("h264".into(), String::new()))
    }

    fn audio_codec(&self) -> Option<(String, String)> {
        None
    }

    fn close(&mut self) {}
}

struct DyingFactory {
    spawned: AtomicUsize,
}

impl SourceFactory for DyingFactory {
    fn connect(&self, _camera: &CameraConfig, _rtsp_url: &str) -> Result<Box<dyn RtspSource>> {
        self.spawned.fetch_add(1, Ordering::Relaxed);
        let mut samples =
            vec![Sample { ts: 0, is_key: true, media_type: MediaType::Video, bytes: b"key".to_vec(), pts_clock_base: 0 }];
        samples.reverse();
        Ok(Box::new(DyingSource { samples: Mutex::new(samples) }))
    }
}

#[test]
fn reconcile_dead_restarts_a_crashed_context() {
    let dir = tmp_dir();
    let config = test_config(dir.path());
    let factory = Arc::new(DyingFactory { spawned: AtomicUsize::new(0) });
    let keeper = StreamKeeper::new(config.clone(), Arc::new(NoCreds), factory.clone());

    keeper.start_configured().expect("start");
    assert_eq!(factory.spawned.load(Ordering::Relaxed), 1);

    // Give the source's recv loop time to fail and mark the context Dead.
    std::thread::sleep(Duration::from_millis(200));
    assert!(!keeper.is_recording("cam1"), "context should have died");

    let reaped = keeper.reconcile_dead();
    assert_eq!(reaped, vec!["cam1".to_string()]);
    assert_eq!(factory.spawned.load(Ordering::Relaxed), 2, "a still-enabled camera should be reconstructed");
    assert!(keeper.is_recording("cam1"));

    keeper.shutdown();
}

#[test]
fn stream_keeper_apply_changes_restarts_on_delta() {
    let dir = tmp_dir();
    let config = test_config(dir.path());
    let factory = Arc::new(ScriptedFactory { spawned: AtomicUsize::new(0) });
    let keeper = StreamKeeper::new(config.clone(), Arc::new(NoCreds), factory.clone());

    keeper.start_configured().expect("start");
    assert_eq!(factory.spawned.load(Ordering::Relaxed), 1);

    let mut changed = config.cameras[0].clone();
    changed.name = "Front door (renamed)".into();
    keeper.apply_changes(vec![changed]);

    assert_eq!(factory.spawned.load(Ordering::Relaxed), 2, "a changed config should stop and reconnect the source");
    assert!(keeper.is_recording("cam1"));

    keeper.shutdown();
}
