// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Revere — self-hosted video surveillance recording engine.
//!
//! Usage:
//!   revere record   --config config.toml
//!   revere status   --config config.toml
//!   revere list     --config config.toml --camera cam1
//!   revere export   --config config.toml --camera cam1 --start 0 --end 1700000000000000000 -o export.json
//!   revere allocate --config config.toml --camera cam1 --retention-hours 336 --byte-rate 1000000
//!   revere prune    --config config.toml --camera cam1

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use revere::collaborators::{CredentialResolver, GstRtspSource, RtspSource};
use revere::config::{CameraConfig, Config};
use revere::discovery::{DeviceProvider, DiscoveredDevice, DiscoveryAgent, StreamConfig};
use revere::error::Result;
use revere::keeper::{SourceFactory, StreamKeeper};
use revere::storage::block_store::BlockStore;
use revere::storage::reader::StorageReader;
use revere::storage::sizing::{human_readable_file_size, required_file_size_for_retention_hours};
use revere::storage::writer::prune;

#[derive(Parser)]
#[command(name = "revere", about = "Self-hosted video surveillance recording engine", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start recording all configured cameras, plus discovery and the
    /// HTTP read surface if enabled.
    Record {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print a per-camera status snapshot and exit.
    Status {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
    /// List contiguous recorded segments for a camera.
    List {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        camera: String,
    },
    /// Export a merged, time-ordered frame range to a JSON file.
    Export {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        camera: String,
        /// Start of the range, in nanoseconds since epoch.
        #[arg(long)]
        start: u64,
        /// End of the range, in nanoseconds since epoch.
        #[arg(long)]
        end: u64,
        #[arg(short, long, default_value = "export.json")]
        output: PathBuf,
    },
    /// Pre-allocate a camera's storage file for a retention window.
    Allocate {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        camera: String,
        #[arg(long)]
        retention_hours: u64,
        /// Assumed steady-state byte rate; defaults to the configured value.
        #[arg(long)]
        byte_rate: Option<u64>,
    },
    /// Manually free every block older than the camera's retention window.
    Prune {
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        camera: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Command::Record { config } => run_record(config).await,
        Command::Status { config } => run_status(config),
        Command::List { config, camera } => run_list(config, &camera),
        Command::Export { config, camera, start, end, output } => run_export(config, &camera, start, end, &output),
        Command::Allocate { config, camera, retention_hours, byte_rate } => {
            run_allocate(config, &camera, retention_hours, byte_rate)
        }
        Command::Prune { config, camera } => run_prune(config, &camera),
    };

    if let Err(e) = result {
        error!(error = %e, "command failed");
        std::process::exit(1);
    }
}

/// No-op credential resolver: cameras with no embedded credentials in
/// their RTSP URL are connected to anonymously. A caller embedding this
/// engine behind an actual credential store supplies its own
/// [`CredentialResolver`] (spec §6.6).
struct NoCredentials;

impl CredentialResolver for NoCredentials {
    fn resolve(&self, _camera_id: &str) -> (Option<String>, Option<String>) {
        (None, None)
    }
}

struct GstSourceFactory;

impl SourceFactory for GstSourceFactory {
    fn connect(&self, camera: &CameraConfig, rtsp_url: &str) -> Result<Box<dyn RtspSource>> {
        Ok(Box::new(GstRtspSource::connect(&camera.id, rtsp_url)?))
    }
}

/// A device provider with nothing to discover. Plugging in an actual
/// ONVIF client is the embedder's job (spec §4.8, §6.6); this keeps
/// `revere record` functional against a purely static camera list.
struct NullDeviceProvider;

impl DeviceProvider for NullDeviceProvider {
    fn poll(&mut self) -> Result<Vec<DiscoveredDevice>> {
        Ok(Vec::new())
    }

    fn interrogate(
        &mut self,
        _device: &DiscoveredDevice,
        _username: Option<&str>,
        _password: Option<&str>,
    ) -> Result<StreamConfig> {
        unreachable!("NullDeviceProvider never discovers a device to interrogate")
    }
}

/// How often the keeper checks for and reconstructs dead recording
/// contexts (spec §4.7 item 3). Independent of discovery's own poll
/// interval, since a dead context isn't a config change discovery would
/// ever notice.
const RECONCILE_TICK: Duration = Duration::from_secs(10);

async fn run_record(config_path: PathBuf) -> Result<()> {
    let cfg = Config::from_file(&config_path)?;

    info!(
        cameras = cfg.cameras.len(),
        top_dir = ?cfg.top_dir,
        block_size = cfg.storage.block_size,
        retention_days = cfg.storage.retention_days,
        "starting revere"
    );

    let credentials: Arc<dyn CredentialResolver> = Arc::new(NoCredentials);
    let keeper = Arc::new(StreamKeeper::new(cfg.clone(), credentials.clone(), Arc::new(GstSourceFactory)));
    keeper.start_configured()?;

    let (changed_tx, changed_rx) = std::sync::mpsc::channel();
    let mut discovery = DiscoveryAgent::start(
        Box::new(NullDeviceProvider),
        credentials,
        keeper.clone(),
        changed_tx,
        std::time::Duration::from_secs(cfg.discovery.poll_interval_secs),
        cfg.discovery.cache_base_mins,
        cfg.discovery.cache_jitter_mins,
    );

    let keeper_for_changes = keeper.clone();
    std::thread::spawn(move || {
        for changed in changed_rx {
            let cameras: Vec<CameraConfig> = changed
                .into_iter()
                .map(|(sc, _hash)| CameraConfig {
                    id: sc.id,
                    name: sc.camera_name.unwrap_or_default(),
                    ipv4: sc.ipv4.unwrap_or_default(),
                    onvif_url: sc.xaddrs.unwrap_or_default(),
                    rtsp_url: sc.rtsp_url,
                    record: true,
                    motion_enabled: true,
                    retention_days_override: None,
                    motion_sensitivity: 2.0,
                })
                .collect();
            keeper_for_changes.apply_changes(cameras);
        }
    });

    let reconcile_stop = Arc::new(AtomicBool::new(false));
    let reconcile_stop_worker = reconcile_stop.clone();
    let keeper_for_reconcile = keeper.clone();
    let reconcile_handle = std::thread::spawn(move || {
        while !reconcile_stop_worker.load(Ordering::Relaxed) {
            for _ in 0..RECONCILE_TICK.as_millis() / 100 {
                if reconcile_stop_worker.load(Ordering::Relaxed) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            if reconcile_stop_worker.load(Ordering::Relaxed) {
                break;
            }
            let reaped = keeper_for_reconcile.reconcile_dead();
            if !reaped.is_empty() {
                info!(cameras = ?reaped, "reconciled dead recording contexts");
            }
        }
    });

    if cfg.api.enabled {
        let state = Arc::new(revere::web::AppState {
            keeper: keeper.clone(),
            encoder: Arc::new(revere::collaborators::JpegEncoder::default()),
            decoder: None,
        });
        let port = cfg.api.port;
        tokio::spawn(async move {
            revere::web::start_server(state, port).await;
        });
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(e) => error!(error = %e, "signal error"),
    }

    reconcile_stop.store(true, Ordering::Relaxed);
    let _ = reconcile_handle.join();
    discovery.stop();
    keeper.shutdown();
    Ok(())
}

fn run_status(config_path: PathBuf) -> Result<()> {
    let cfg = Config::from_file(&config_path)?;
    println!("=== revere status ===");
    println!("top_dir: {}", cfg.top_dir.display());
    println!("cameras: {}", cfg.cameras.len());
    for cam in &cfg.cameras {
        let path = cfg.camera_path(&cam.id);
        if !path.exists() {
            println!("  {} ({}): no storage file allocated yet", cam.id, cam.name);
            continue;
        }
        let store = BlockStore::open(&path)?;
        let reader = StorageReader::new(&store);
        let first = reader.first_ts()?;
        let last = reader.last_ts()?;
        let size = store.block_size() as u64 * (store.num_blocks() as u64 + 1) + revere::storage::HEADER_SIZE as u64;
        println!(
            "  {} ({}): {} blocks, range [{:?}, {:?}], file size {}",
            cam.id,
            cam.name,
            store.num_blocks(),
            first,
            last,
            human_readable_file_size(size as f64)
        );
    }
    Ok(())
}

fn run_list(config_path: PathBuf, camera_id: &str) -> Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let path = cfg.camera_path(camera_id);
    let store = BlockStore::open(&path)?;
    let reader = StorageReader::new(&store);
    let (first, last) = (reader.first_ts()?.unwrap_or(0), reader.last_ts()?.unwrap_or(u64::MAX));
    let segments = reader.query_segments(first, last, cfg.storage.segment_gap_secs * 1_000_000_000)?;

    if segments.is_empty() {
        println!("No segments found for camera '{camera_id}'");
        return Ok(());
    }
    println!("=== Segments for camera '{camera_id}' ===");
    for seg in &segments {
        println!("  [{}, {}]", seg.start_ts, seg.end_ts);
    }
    println!("Total: {} segments", segments.len());
    Ok(())
}

fn run_export(config_path: PathBuf, camera_id: &str, start: u64, end: u64, output: &PathBuf) -> Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let path = cfg.camera_path(camera_id);
    let store = BlockStore::open(&path)?;
    let reader = StorageReader::new(&store);
    let result = reader.query(revere::storage::MediaType::All, start, end)?;

    let json = serde_json::to_vec_pretty(&result)
        .map_err(|e| revere::error::RevereError::Protocol(format!("serialize export: {e}")))?;
    std::fs::write(output, json)?;
    println!("Exported {} frames for camera '{camera_id}' -> {}", result.frames.len(), output.display());
    Ok(())
}

fn run_allocate(config_path: PathBuf, camera_id: &str, retention_hours: u64, byte_rate: Option<u64>) -> Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let byte_rate = byte_rate.unwrap_or(cfg.storage.assumed_byte_rate);
    let (num_blocks, total) = required_file_size_for_retention_hours(retention_hours, byte_rate, cfg.storage.block_size);
    let path = cfg.camera_path(camera_id);
    BlockStore::allocate(&path, cfg.storage.block_size, num_blocks)?;
    println!(
        "Allocated {} ({} blocks, {})",
        path.display(),
        num_blocks,
        human_readable_file_size(total as f64)
    );
    Ok(())
}

fn run_prune(config_path: PathBuf, camera_id: &str) -> Result<()> {
    let cfg = Config::from_file(&config_path)?;
    let path = cfg.camera_path(camera_id);
    let store = BlockStore::open(&path)?;
    let retention_age_ns = cfg.storage.retention_days as i64 * 24 * 3600 * 1_000_000_000;
    let now_ns = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_nanos() as i64;
    let freed = prune(&store, now_ns, retention_age_ns)?;
    println!("Freed {freed} blocks for camera '{camera_id}'");
    Ok(())
}
