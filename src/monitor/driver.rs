use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::sampler::{extract_sample_y, Sampler};
use super::{Command, Effect, Monitor, RunState, TITLE_IDLE};
use crate::alignment::Sample;
use crate::camera::{video_inputs, CameraBackend, MediaDeviceInfo, VideoSource};
use crate::config::MonitorConfig;
use crate::pose::{KeypointSource, Pose};
use crate::protocol::{
    self, AlignmentEvent, ControlCommand, StatusPush, CONTROL_CHANNEL, RELAY_CHANNEL,
};
use crate::runtime::{Hub, Listener, Port, PortSender};

/// The monitoring surface is by definition open while this loop runs.
const IS_PANEL_OPEN: bool = true;

/// Commands and observation points for the monitoring surface's own UI.
#[derive(Clone)]
pub struct MonitorHandle {
    commands: mpsc::UnboundedSender<Command>,
    run_state: watch::Receiver<RunState>,
    title: watch::Receiver<&'static str>,
    devices: Arc<[MediaDeviceInfo]>,
}

impl MonitorHandle {
    /// `false` once the loop has shut down.
    pub fn send(&self, cmd: Command) -> bool {
        self.commands.send(cmd).is_ok()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state.borrow().clone()
    }

    pub fn watch_run_state(&self) -> watch::Receiver<RunState> {
        self.run_state.clone()
    }

    pub fn title(&self) -> &'static str {
        *self.title.borrow()
    }

    /// Cameras found when the loop was built.
    pub fn devices(&self) -> &[MediaDeviceInfo] {
        &self.devices
    }
}

struct InferenceDone {
    session: u64,
    result: Result<Vec<Pose>>,
}

/// Async driver around [`Monitor`].
pub struct MonitorService {
    monitor: Monitor,
    hub: Hub,
    camera: Arc<dyn CameraBackend>,
    source: Arc<dyn KeypointSource>,
    video: Option<Box<dyn VideoSource>>,
    sampler: Sampler,
    period: Duration,
    relay: Option<PortSender>,
    control_listener: Listener,
    controls: Vec<PortSender>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    done_tx: mpsc::UnboundedSender<InferenceDone>,
    done_rx: mpsc::UnboundedReceiver<InferenceDone>,
    run_state_tx: watch::Sender<RunState>,
    title_tx: watch::Sender<&'static str>,
}

impl MonitorService {
    /// Build the loop, register as the control-channel acceptor and select
    /// the first available camera.
    pub fn new(
        config: &MonitorConfig,
        hub: Hub,
        camera: Arc<dyn CameraBackend>,
        source: Arc<dyn KeypointSource>,
    ) -> (Self, MonitorHandle) {
        let mut monitor = Monitor::new(config);

        let devices = match camera.enumerate_devices() {
            Ok(all) => video_inputs(all),
            Err(e) => {
                warn!("device enumeration failed: {e:#}");
                Vec::new()
            }
        };
        match devices.first() {
            Some(first) => {
                info!(
                    device = %first.device_id,
                    label = %first.display_label(0),
                    "default camera selected"
                );
                monitor.select_device(&first.device_id);
            }
            None => warn!("no video input devices found"),
        }

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (done_tx, done_rx) = mpsc::unbounded_channel();
        let (run_state_tx, run_state_rx) = watch::channel(monitor.run_state().clone());
        let (title_tx, title_rx) = watch::channel(TITLE_IDLE);
        let control_listener = hub.listen(CONTROL_CHANNEL);

        let handle = MonitorHandle {
            commands: commands_tx.clone(),
            run_state: run_state_rx,
            title: title_rx,
            devices: devices.into(),
        };

        let service = Self {
            monitor,
            hub,
            camera,
            source,
            video: None,
            sampler: Sampler::new(),
            period: config.period(),
            relay: None,
            control_listener,
            controls: Vec::new(),
            commands_tx,
            commands_rx,
            done_tx,
            done_rx,
            run_state_tx,
            title_tx,
        };
        (service, handle)
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = time::interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(period_ms = self.period.as_millis() as u64, "monitoring loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                Some(port) = self.control_listener.accept() => self.attach_control(port),
                Some(cmd) = self.commands_rx.recv() => self.apply(cmd, &mut ticker),
                Some(done) = self.done_rx.recv() => self.on_inference(done),
                _ = ticker.tick(), if self.monitor.is_watching() => self.on_tick(),
            }
        }

        info!(skipped_ticks = self.sampler.skipped(), "monitoring loop stopped");
    }

    fn apply(&mut self, cmd: Command, ticker: &mut Interval) {
        let was_watching = self.monitor.is_watching();
        let effects = self.monitor.handle(cmd);
        self.execute(effects);

        let run = self.monitor.run_state();
        if was_watching != run.is_watching {
            info!(watching = run.is_watching, device = ?run.device_id, "run state changed");
        }
        if !was_watching && run.is_watching {
            // first sample one full period after start
            ticker.reset();
        }
    }

    fn on_tick(&mut self) {
        let Some(frame) = self.video.as_ref().and_then(|v| v.current_frame()) else {
            return;
        };
        if !self.sampler.try_begin() {
            debug!(skipped = self.sampler.skipped(), "inference still pending; tick skipped");
            return;
        }

        let session = self.monitor.session();
        let pending = self.source.estimate(frame);
        let done = self.done_tx.clone();
        tokio::spawn(async move {
            let result = match AssertUnwindSafe(pending).catch_unwind().await {
                Ok(result) => result,
                Err(_) => Err(anyhow!("keypoint source panicked")),
            };
            let _ = done.send(InferenceDone { session, result });
        });
    }

    fn on_inference(&mut self, done: InferenceDone) {
        self.sampler.finish();

        if done.session != self.monitor.session() || !self.monitor.is_watching() {
            debug!(session = done.session, "discarding inference from a stopped session");
            return;
        }
        let poses = match done.result {
            Ok(poses) => poses,
            Err(e) => {
                warn!("pose estimation failed: {e:#}");
                return;
            }
        };
        let Some(y) = extract_sample_y(&poses) else {
            return;
        };
        let effects = self.monitor.observe(Sample::new(y));
        debug!(y, state = ?self.monitor.state_for(y), "sample classified");
        self.execute(effects);
    }

    fn execute(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Emit(event) => {
                    if !self.emit(&event) {
                        self.monitor.delivery_failed();
                    }
                }
                Effect::PushWatching(is_watching) => {
                    self.push_status(StatusPush::SetIsWatching { is_watching })
                }
                Effect::Badge(text) => self.hub.set_badge_text(text),
                Effect::Title(title) => {
                    self.title_tx.send_replace(title);
                }
                Effect::OpenCamera(device_id) => self.open_camera(&device_id),
                Effect::CloseCamera => self.video = None,
            }
        }

        let current = self.monitor.run_state();
        self.run_state_tx.send_if_modified(|published| {
            if *published == *current {
                return false;
            }
            *published = current.clone();
            true
        });
    }

    /// Post to the router, reconnecting once if the previous port died.
    /// `false` if the event was dropped.
    fn emit(&mut self, event: &AlignmentEvent) -> bool {
        let frame = match protocol::encode(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{e:#}");
                return false;
            }
        };
        if let Some(relay) = &self.relay {
            if relay.post(frame.clone()) {
                return true;
            }
        }

        let (relay, _) = self.hub.connect(RELAY_CHANNEL).split();
        let delivered = relay.post(frame);
        if !delivered {
            debug!(?event, "relay router unavailable; event dropped");
        }
        self.relay = Some(relay);
        delivered
    }

    fn push_status(&mut self, push: StatusPush) {
        let before = self.controls.len();
        self.controls.retain(|port| protocol::send_message(port, &push));
        let dropped = before - self.controls.len();
        if dropped > 0 {
            debug!(dropped, "released closed control channels");
        }
    }

    fn attach_control(&mut self, port: Port) {
        let (tx, mut rx) = port.split();
        protocol::send_message(
            &tx,
            &StatusPush::SetIsWatching {
                is_watching: self.monitor.is_watching(),
            },
        );
        protocol::send_message(
            &tx,
            &StatusPush::SetIsPanelOpen {
                is_panel_open: IS_PANEL_OPEN,
            },
        );
        self.controls.push(tx);
        debug!(surfaces = self.controls.len(), "control surface connected");

        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = protocol::recv_message::<ControlCommand>(&mut rx).await {
                match msg {
                    Ok(cmd) => {
                        if commands.send(cmd.into()).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("ignoring control message: {e:#}"),
                }
            }
            debug!("control surface disconnected");
        });
    }

    fn open_camera(&mut self, device_id: &str) {
        match self.camera.open(device_id) {
            Ok(video) => {
                info!(device = device_id, "camera opened");
                self.video = Some(video);
            }
            Err(e) => {
                warn!(device = device_id, "failed to open camera: {e:#}");
                self.video = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alignment::Alignment;
    use crate::camera::Frame;
    use crate::config::EmitPolicy;
    use crate::pose::Keypoint;
    use crate::monitor::{BADGE_OFF, BADGE_ON, TITLE_ACTIVE};
    use bytes::Bytes;
    use futures::future::BoxFuture;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::Notify;
    use tokio::time::{sleep, timeout};

    // --- fakes ---

    struct ReadyVideo;

    impl VideoSource for ReadyVideo {
        fn current_frame(&self) -> Option<Frame> {
            Some(Frame {
                width: 640,
                height: 480,
                data: Bytes::from_static(&[0u8; 4]),
            })
        }
    }

    #[derive(Default)]
    struct FakeCamera {
        fail_open: bool,
        opened: Mutex<Vec<String>>,
    }

    impl CameraBackend for FakeCamera {
        fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>> {
            Ok(vec![
                MediaDeviceInfo::video("cam-1", "Integrated Camera"),
                MediaDeviceInfo::video("cam-2", ""),
            ])
        }

        fn open(&self, device_id: &str) -> Result<Box<dyn VideoSource>> {
            if self.fail_open {
                anyhow::bail!("permission denied");
            }
            self.opened.lock().unwrap().push(device_id.to_string());
            Ok(Box::new(ReadyVideo))
        }
    }

    fn pose_at(y: f32) -> Vec<Pose> {
        vec![Pose::new(vec![Keypoint::new(320.0, y, 0.9); 17])]
    }

    /// Pops one scripted y per call; empty script means nobody in frame.
    #[derive(Default)]
    struct ScriptedSource {
        ys: Mutex<VecDeque<f32>>,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        fn push(&self, y: f32) {
            self.ys.lock().unwrap().push_back(y);
        }
    }

    impl KeypointSource for ScriptedSource {
        fn estimate(&self, _frame: Frame) -> BoxFuture<'static, Result<Vec<Pose>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.ys.lock().unwrap().pop_front();
            async move { Ok(next.map(pose_at).unwrap_or_default()) }.boxed()
        }
    }

    /// Every call blocks until the gate is opened once.
    #[derive(Default)]
    struct GatedSource {
        gate: Arc<Notify>,
        calls: AtomicUsize,
    }

    impl KeypointSource for GatedSource {
        fn estimate(&self, _frame: Frame) -> BoxFuture<'static, Result<Vec<Pose>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let gate = self.gate.clone();
            async move {
                gate.notified().await;
                Ok(pose_at(100.0))
            }
            .boxed()
        }
    }

    #[derive(Default)]
    struct PanickingSource {
        calls: AtomicUsize,
    }

    impl KeypointSource for PanickingSource {
        fn estimate(&self, _frame: Frame) -> BoxFuture<'static, Result<Vec<Pose>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move { panic!("model crashed") }.boxed()
        }
    }

    fn spawn_service(
        hub: &Hub,
        camera: Arc<FakeCamera>,
        source: Arc<dyn KeypointSource>,
    ) -> (MonitorHandle, CancellationToken) {
        let config = MonitorConfig {
            emit_policy: EmitPolicy::OnTransition,
            ..MonitorConfig::default()
        };
        let (service, handle) = MonitorService::new(&config, hub.clone(), camera, source);
        let shutdown = CancellationToken::new();
        tokio::spawn(service.run(shutdown.clone()));
        (handle, shutdown)
    }

    async fn next_event(port: &mut Port) -> AlignmentEvent {
        let frame = port.recv().await.expect("relay closed");
        protocol::decode(&frame).unwrap()
    }

    async fn next_status(port: &mut Port) -> StatusPush {
        let frame = port.recv().await.expect("control closed");
        protocol::decode(&frame).unwrap()
    }

    // --- tests ---

    #[tokio::test(start_paused = true)]
    async fn test_scenario_end_to_end() {
        let hub = Hub::new();
        let mut relay = hub.listen(RELAY_CHANNEL);
        let source = Arc::new(ScriptedSource::default());
        for y in [100.0, 130.0, 120.0] {
            source.push(y);
        }
        let (handle, _shutdown) =
            spawn_service(&hub, Arc::new(FakeCamera::default()), source.clone());

        assert_eq!(handle.devices().len(), 2);
        assert_eq!(handle.run_state().device_id.as_deref(), Some("cam-1"));
        assert!(handle.send(Command::SetWatching(true)));

        let mut port = relay.accept().await.unwrap();
        assert_eq!(next_event(&mut port).await, AlignmentEvent::baseline(100.0));
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Good));
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Bad));
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Good));
        assert_eq!(hub.badge_text(), BADGE_ON);
        assert_eq!(handle.title(), TITLE_ACTIVE);

        handle.send(Command::ResetBaseline);
        sleep(Duration::from_millis(1)).await;
        source.push(70.0);
        assert_eq!(next_event(&mut port).await, AlignmentEvent::baseline(70.0));
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Good));

        handle.send(Command::SetWatching(false));
        sleep(Duration::from_millis(1)).await;
        let calls = source.calls.load(Ordering::SeqCst);
        source.push(300.0);
        assert!(timeout(Duration::from_secs(2), port.recv()).await.is_err());
        assert_eq!(source.calls.load(Ordering::SeqCst), calls);
        assert_eq!(hub.badge_text(), BADGE_OFF);
        assert!(!handle.run_state().is_watching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_inference_skips_ticks() {
        let hub = Hub::new();
        let mut relay = hub.listen(RELAY_CHANNEL);
        let source = Arc::new(GatedSource::default());
        let (handle, _shutdown) =
            spawn_service(&hub, Arc::new(FakeCamera::default()), source.clone());

        handle.send(Command::SetWatching(true));
        sleep(Duration::from_millis(550)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        source.gate.notify_one();
        let mut port = relay.accept().await.unwrap();
        assert_eq!(next_event(&mut port).await, AlignmentEvent::baseline(100.0));

        sleep(Duration::from_millis(150)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inference_after_stop_is_discarded() {
        let hub = Hub::new();
        let mut relay = hub.listen(RELAY_CHANNEL);
        let source = Arc::new(GatedSource::default());
        let (handle, _shutdown) =
            spawn_service(&hub, Arc::new(FakeCamera::default()), source.clone());

        handle.send(Command::SetWatching(true));
        sleep(Duration::from_millis(150)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);

        handle.send(Command::SetWatching(false));
        sleep(Duration::from_millis(1)).await;
        source.gate.notify_one();
        assert!(timeout(Duration::from_millis(500), relay.accept()).await.is_err());

        // guard was released by the discarded result
        handle.send(Command::SetWatching(true));
        sleep(Duration::from_millis(150)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_source_does_not_wedge_loop() {
        let hub = Hub::new();
        let source = Arc::new(PanickingSource::default());
        let (handle, _shutdown) =
            spawn_service(&hub, Arc::new(FakeCamera::default()), source.clone());

        handle.send(Command::SetWatching(true));
        sleep(Duration::from_millis(450)).await;
        assert!(source.calls.load(Ordering::SeqCst) >= 3);
        assert!(handle.run_state().is_watching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_is_contained() {
        let hub = Hub::new();
        let source = Arc::new(ScriptedSource::default());
        let camera = Arc::new(FakeCamera {
            fail_open: true,
            ..FakeCamera::default()
        });
        let (handle, _shutdown) = spawn_service(&hub, camera, source.clone());

        handle.send(Command::SetWatching(true));
        sleep(Duration::from_millis(500)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        handle.send(Command::SetWatching(false));
        sleep(Duration::from_millis(1)).await;
        assert!(!handle.run_state().is_watching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_device_reopens_camera() {
        let hub = Hub::new();
        let camera = Arc::new(FakeCamera::default());
        let (handle, _shutdown) =
            spawn_service(&hub, camera.clone(), Arc::new(ScriptedSource::default()));

        handle.send(Command::SetWatching(true));
        handle.send(Command::SwitchDevice("cam-2".into()));
        sleep(Duration::from_millis(1)).await;

        assert_eq!(*camera.opened.lock().unwrap(), vec!["cam-1", "cam-2"]);
        let run = handle.run_state();
        assert!(run.is_watching);
        assert_eq!(run.device_id.as_deref(), Some("cam-2"));
        assert_eq!(hub.badge_text(), BADGE_ON);
    }

    #[tokio::test(start_paused = true)]
    async fn test_control_channel_status_and_commands() {
        let hub = Hub::new();
        let (handle, _shutdown) = spawn_service(
            &hub,
            Arc::new(FakeCamera::default()),
            Arc::new(ScriptedSource::default()),
        );

        let mut panel = hub.connect(CONTROL_CHANNEL);
        assert_eq!(
            next_status(&mut panel).await,
            StatusPush::SetIsWatching { is_watching: false }
        );
        assert_eq!(
            next_status(&mut panel).await,
            StatusPush::SetIsPanelOpen { is_panel_open: true }
        );

        // toggled from the monitoring surface itself; mirrored to the panel
        handle.send(Command::SetWatching(true));
        assert_eq!(
            next_status(&mut panel).await,
            StatusPush::SetIsWatching { is_watching: true }
        );

        // commands from the panel, including garbage that must be ignored
        panel.post(Bytes::from_static(b"{\"action\":\"NOPE\"}"));
        let off = protocol::encode(&ControlCommand::ToggleWatching { is_watching: false }).unwrap();
        panel.post(off);
        assert_eq!(
            next_status(&mut panel).await,
            StatusPush::SetIsWatching { is_watching: false }
        );
        assert!(!handle.run_state().is_watching);
        assert_eq!(hub.badge_text(), BADGE_OFF);

        // a closed panel is released silently
        drop(panel);
        handle.send(Command::SetWatching(true));
        sleep(Duration::from_millis(1)).await;
        assert!(handle.run_state().is_watching);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_after_router_restart() {
        let hub = Hub::new();
        let mut relay = hub.listen(RELAY_CHANNEL);
        let source = Arc::new(ScriptedSource::default());
        source.push(100.0);
        let (handle, _shutdown) =
            spawn_service(&hub, Arc::new(FakeCamera::default()), source.clone());

        handle.send(Command::SetWatching(true));
        let mut port = relay.accept().await.unwrap();
        assert_eq!(next_event(&mut port).await, AlignmentEvent::baseline(100.0));

        drop(port);
        drop(relay);
        let mut relay = hub.listen(RELAY_CHANNEL);
        source.push(200.0);

        let mut port = relay.accept().await.unwrap();
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Bad));
    }

    #[tokio::test(start_paused = true)]
    async fn test_verdict_resent_once_router_returns() {
        let hub = Hub::new();
        let source = Arc::new(ScriptedSource::default());
        for _ in 0..5 {
            source.push(100.0);
        }
        for _ in 0..5 {
            source.push(200.0);
        }
        let (handle, _shutdown) =
            spawn_service(&hub, Arc::new(FakeCamera::default()), source.clone());

        // no router while the posture turns bad
        handle.send(Command::SetWatching(true));
        sleep(Duration::from_secs(2)).await;
        assert!(source.ys.lock().unwrap().is_empty());

        let mut relay = hub.listen(RELAY_CHANNEL);
        for _ in 0..3 {
            source.push(200.0);
        }
        let mut port = relay.accept().await.unwrap();
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Bad));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_reaches_late_renderer() {
        let hub = Hub::new();
        let mut relay = hub.listen(RELAY_CHANNEL);
        let source = Arc::new(ScriptedSource::default());
        source.push(100.0);
        for _ in 0..40 {
            source.push(150.0);
        }
        let config = MonitorConfig {
            keepalive_samples: 5,
            ..MonitorConfig::default()
        };
        let (service, handle) = MonitorService::new(
            &config,
            hub.clone(),
            Arc::new(FakeCamera::default()),
            source.clone(),
        );
        tokio::spawn(service.run(CancellationToken::new()));

        handle.send(Command::SetWatching(true));
        let mut port = relay.accept().await.unwrap();
        assert_eq!(next_event(&mut port).await, AlignmentEvent::baseline(100.0));
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Good));
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Bad));
        // unchanged verdict comes again without any transition
        assert_eq!(next_event(&mut port).await, AlignmentEvent::alignment(Alignment::Bad));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_ends_loop() {
        let hub = Hub::new();
        let config = MonitorConfig::default();
        let (service, handle) = MonitorService::new(
            &config,
            hub.clone(),
            Arc::new(FakeCamera::default()),
            Arc::new(ScriptedSource::default()),
        );
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(service.run(shutdown.clone()));

        shutdown.cancel();
        task.await.unwrap();
        assert!(!handle.send(Command::ResetBaseline));
    }
}
