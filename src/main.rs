//! Slouch tracker demo: wires the router, monitoring loop, control panel and
//! a few renderers together with a simulated camera and pose estimator.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::Bytes;
use clap::Parser;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use slouch_tracker::camera::{CameraBackend, DeviceKind, Frame, MediaDeviceInfo, VideoSource};
use slouch_tracker::config::{Config, EmitPolicy};
use slouch_tracker::control::ControlPanel;
use slouch_tracker::monitor::MonitorService;
use slouch_tracker::pose::{Keypoint, KeypointIndex, KeypointSource, Pose};
use slouch_tracker::relay::RelayRouter;
use slouch_tracker::renderer::Renderer;
use slouch_tracker::runtime::{Documents, Hub};

#[derive(Parser)]
#[command(
    name = "slouch-tracker",
    version,
    about = "Posture monitor: baseline calibration and slouch alerts",
    long_about = None
)]
struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Number of simulated web documents to render into
    #[arg(short, long, default_value_t = 3)]
    documents: usize,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(short, long)]
    seconds: Option<u64>,

    /// Emit an alignment event after every sample, not only on changes
    #[arg(long)]
    every_tick: bool,
}

// ===========================================================================
// Simulated camera and pose estimator
// ===========================================================================

const FRAME_WIDTH: u32 = 640;
const FRAME_HEIGHT: u32 = 480;
/// Frames per simulated upright/slouched cycle
const POSTURE_CYCLE: u64 = 120;

struct SimulatedCamera;

impl CameraBackend for SimulatedCamera {
    fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
        Ok(vec![
            MediaDeviceInfo {
                device_id: "sim-mic".into(),
                label: "Simulated Microphone".into(),
                kind: DeviceKind::AudioInput,
            },
            MediaDeviceInfo::video("sim-cam-0", "Simulated Camera"),
            MediaDeviceInfo::video("sim-cam-1", ""),
        ])
    }

    fn open(&self, device_id: &str) -> Result<Box<dyn VideoSource>> {
        if !device_id.starts_with("sim-cam-") {
            bail!("unknown device {device_id}");
        }
        Ok(Box::new(SimulatedVideo {
            frames: AtomicU64::new(0),
        }))
    }
}

/// Each frame carries its sequence number so the estimator can replay a
/// deterministic posture trace.
struct SimulatedVideo {
    frames: AtomicU64,
}

impl VideoSource for SimulatedVideo {
    fn current_frame(&self) -> Option<Frame> {
        let n = self.frames.fetch_add(1, Ordering::Relaxed);
        Some(Frame {
            width: FRAME_WIDTH,
            height: FRAME_HEIGHT,
            data: Bytes::copy_from_slice(&n.to_le_bytes()),
        })
    }
}

struct SimulatedEstimator;

impl SimulatedEstimator {
    fn eye_y(n: u64) -> f32 {
        let phase = n % POSTURE_CYCLE;
        let sway = ((n as f32) * 0.3).sin() * 3.0;
        if (70..100).contains(&phase) {
            140.0 + sway
        } else {
            100.0 + sway
        }
    }

    /// Inference time varies with the frame; some frames overrun the period.
    fn latency(n: u64) -> Duration {
        Duration::from_millis(30 + (n * 37) % 150)
    }
}

impl KeypointSource for SimulatedEstimator {
    fn estimate(&self, frame: Frame) -> BoxFuture<'static, Result<Vec<Pose>>> {
        async move {
            let Some(n) = frame
                .data
                .get(..8)
                .and_then(|b| <[u8; 8]>::try_from(b).ok())
                .map(u64::from_le_bytes)
            else {
                bail!("frame too short ({} bytes)", frame.data.len());
            };
            time::sleep(Self::latency(n)).await;

            // nobody in front of the camera now and then
            if n % 50 == 49 {
                return Ok(Vec::new());
            }
            let mut keypoints = vec![Keypoint::default(); KeypointIndex::COUNT];
            keypoints[KeypointIndex::RightEye as usize] =
                Keypoint::new(frame.width as f32 / 2.0, Self::eye_y(n), 0.9);
            Ok(vec![Pose::new(keypoints)])
        }
        .boxed()
    }
}

// ===========================================================================
// Main
// ===========================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config);
    if cli.every_tick {
        config.monitor.emit_policy = EmitPolicy::EveryTick;
    }

    info!("Slouch Tracker ({})", env!("GIT_VERSION"));
    info!(
        period_ms = config.monitor.detection_rate_ms,
        max_deviation = config.monitor.max_deviation,
        emit_policy = ?config.monitor.emit_policy,
        keepalive_samples = config.monitor.keepalive_samples,
        "monitor config"
    );

    let shutdown = CancellationToken::new();
    let hub = Hub::new();
    let documents = Documents::new();

    // Coordinator
    let router = RelayRouter::new(documents.clone(), &config.relay);
    let router_task = tokio::spawn(router.run(hub.clone(), shutdown.clone()));

    // Documents and their renderers; the internal page never gets one
    let internal = documents.open("chrome://extensions");
    info!(document = internal, "opened out-of-scope document");
    for i in 0..cli.documents {
        let id = documents.open(&format!("https://site{i}.example/"));
        let Some((renderer, handle)) = Renderer::mount(&documents, id) else {
            warn!(document = id, "renderer already mounted");
            continue;
        };
        tokio::spawn(renderer.run());

        let mut overlay = handle.watch();
        tokio::spawn(async move {
            while overlay.changed().await.is_ok() {
                let now = *overlay.borrow_and_update();
                info!(
                    document = handle.document(),
                    class = now.body_class().unwrap_or(""),
                    text = now.status_text(),
                    "overlay updated"
                );
            }
        });
    }

    // Monitoring surface
    let (service, monitor) = MonitorService::new(
        &config.monitor,
        hub.clone(),
        Arc::new(SimulatedCamera),
        Arc::new(SimulatedEstimator),
    );
    for (position, device) in monitor.devices().iter().enumerate() {
        info!(
            device = %device.device_id,
            label = %device.display_label(position),
            "camera available"
        );
    }
    let monitor_task = tokio::spawn(service.run(shutdown.clone()));

    // Control surface: start watching, recalibrate once after a while
    let mut panel = ControlPanel::connect(&hub);
    let panel_shutdown = shutdown.clone();
    tokio::spawn(async move {
        panel.toggle_watching(true);
        let recalibrate = time::sleep(Duration::from_secs(8));
        tokio::pin!(recalibrate);
        let mut recalibrated = false;
        loop {
            tokio::select! {
                _ = panel_shutdown.cancelled() => break,
                status = panel.next_status() => match status {
                    Some(push) => info!(?push, "control panel status"),
                    None => break,
                },
                _ = &mut recalibrate, if !recalibrated => {
                    recalibrated = true;
                    info!("control panel: reset baseline");
                    panel.reset_baseline();
                }
            }
        }
    });

    let deadline = async {
        match cli.seconds {
            Some(secs) => time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("failed to listen for Ctrl-C: {e}");
            }
        }
        _ = deadline => {}
    }

    info!("shutting down");
    shutdown.cancel();
    let _ = monitor_task.await;
    let _ = router_task.await;
    info!(badge = %hub.badge_text(), title = monitor.title(), "stopped");
    Ok(())
}
