//! Broadcast publisher: single-producer fan-out to N subscribers.
//!
//! One broadcast task reads bundles from a bounded inbound queue and offers
//! them to every subscriber's bounded queue with a non-blocking enqueue —
//! a slow subscriber only ever loses its own frames. Per-subscriber
//! hysteresis drops the heavy cloud payload for consumers that keep
//! falling behind; they still receive metadata-only bundles, which doubles
//! as the recovery probe. Fine-grained field filtering beyond that happens
//! in each subscriber's own serialisation stage using its `StreamRequest`.
//!
//! ## Locking
//! The subscriber map lock is never held across an enqueue attempt: the
//! broadcast task snapshots the subscribers, releases the lock, then
//! iterates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use frame_types::{BackgroundSnapshot, FrameBundle, FrameMeta, FrameType};

use crate::diagnostics::Diagnostics;
use crate::recorder::RecorderError;
use crate::replay::{ReplayControl, SeekTarget};

pub const INBOUND_QUEUE_DEPTH: usize = 100;
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 10;
/// Consecutive failed enqueues before a subscriber enters skip mode.
pub const DEFAULT_MAX_SLOW: u32 = 3;
/// Consecutive successful enqueues required to leave skip mode.
pub const DEFAULT_MIN_FAST: u32 = 5;
/// Resend interval for an unchanged background snapshot.
pub const BACKGROUND_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PublisherError {
    #[error("publisher already running")]
    AlreadyRunning,
    #[error("publisher not running")]
    NotRunning,
    #[error("a recorder is already attached")]
    RecorderAttached,
    #[error("invalid control request: {0}")]
    InvalidControl(String),
}

// ── Collaborator interfaces ───────────────────────────────────────────────────

/// Capability interface of the background manager. Consumed by the
/// publisher; the manager never calls back in.
pub trait BackgroundSource: Send + Sync {
    fn snapshot(&self) -> BackgroundSnapshot;
    fn sequence_number(&self) -> u64;
}

/// Sink for the recorder hook. At most one per publisher; called
/// synchronously by the broadcast task after fan-out.
pub trait FrameSink: Send {
    fn record(&mut self, frame: &FrameBundle) -> Result<(), RecorderError>;
    fn close(&mut self) -> Result<(), RecorderError>;
}

// ── Stream requests & capabilities ────────────────────────────────────────────

/// Content filters a subscriber declares at subscribe time.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    pub points: bool,
    pub clusters: bool,
    pub tracks: bool,
    pub background: bool,
    pub debug: bool,
}

impl Default for StreamRequest {
    fn default() -> Self {
        Self {
            points: true,
            clusters: true,
            tracks: true,
            background: true,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Points,
    Clusters,
    Tracks,
    Debug,
    Replay,
    Recording,
}

/// Control surface exposed to the transport layer.
#[derive(Debug, Clone)]
pub enum ControlRequest {
    Pause,
    Play,
    SeekFrame(u64),
    SeekTimestamp(i64),
    SetRate(f32),
    SetOverlayModes(Vec<String>),
    GetCapabilities,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    Ack,
    Capabilities(Vec<Capability>),
}

// ── Slow-consumer hysteresis ──────────────────────────────────────────────────

/// Per-subscriber cooldown state. `max_slow` consecutive failed enqueues
/// enter skip mode; only `min_fast` consecutive successes leave it.
#[derive(Debug)]
pub struct SendGate {
    max_slow: u32,
    min_fast: u32,
    slow_streak: u32,
    fast_streak: u32,
    skipping: bool,
}

impl SendGate {
    pub fn new(max_slow: u32, min_fast: u32) -> Self {
        Self {
            max_slow,
            min_fast,
            slow_streak: 0,
            fast_streak: 0,
            skipping: false,
        }
    }

    pub fn skipping(&self) -> bool {
        self.skipping
    }

    pub fn on_success(&mut self) {
        self.slow_streak = 0;
        if self.skipping {
            self.fast_streak += 1;
            if self.fast_streak >= self.min_fast {
                self.skipping = false;
                self.fast_streak = 0;
            }
        }
    }

    pub fn on_drop(&mut self) {
        self.fast_streak = 0;
        self.slow_streak += 1;
        if self.slow_streak >= self.max_slow {
            self.skipping = true;
        }
    }
}

impl Default for SendGate {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SLOW, DEFAULT_MIN_FAST)
    }
}

// ── Publisher ─────────────────────────────────────────────────────────────────

pub struct SubscriberHandle {
    pub id: u64,
    pub request: StreamRequest,
    pub rx: mpsc::Receiver<Arc<FrameBundle>>,
}

struct SubscriberEntry {
    tx: mpsc::Sender<Arc<FrameBundle>>,
    request: StreamRequest,
}

#[derive(Default)]
struct BackgroundState {
    last_sent_seq: Option<u64>,
    last_sent_at: Option<Instant>,
}

struct Shared {
    running: AtomicBool,
    inbound_tx: Mutex<Option<mpsc::Sender<FrameBundle>>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    subscribers: RwLock<HashMap<u64, SubscriberEntry>>,
    next_subscriber_id: AtomicU64,
    background: Mutex<Option<Arc<dyn BackgroundSource>>>,
    bg_state: Mutex<BackgroundState>,
    recorder: Mutex<Option<Box<dyn FrameSink>>>,
    replay_control: Mutex<Option<Arc<ReplayControl>>>,
    replay_active: AtomicBool,
    overlay_modes: Mutex<Vec<String>>,
    diag: Diagnostics,
}

#[derive(Clone)]
pub struct Publisher {
    shared: Arc<Shared>,
}

impl Publisher {
    pub fn new(diag: Diagnostics) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                inbound_tx: Mutex::new(None),
                stop_tx: Mutex::new(None),
                task: Mutex::new(None),
                subscribers: RwLock::new(HashMap::new()),
                next_subscriber_id: AtomicU64::new(0),
                background: Mutex::new(None),
                bg_state: Mutex::new(BackgroundState::default()),
                recorder: Mutex::new(None),
                replay_control: Mutex::new(None),
                replay_active: AtomicBool::new(false),
                overlay_modes: Mutex::new(Vec::new()),
                diag,
            }),
        }
    }

    /// Spawn the broadcast task. Fails if already running.
    pub fn start(&self) -> Result<(), PublisherError> {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return Err(PublisherError::AlreadyRunning);
        }
        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        let (stop_tx, stop_rx) = watch::channel(false);
        *lock(&self.shared.inbound_tx) = Some(tx);
        *lock(&self.shared.stop_tx) = Some(stop_tx);
        let task = tokio::spawn(run_broadcast(Arc::clone(&self.shared), rx, stop_rx));
        *lock(&self.shared.task) = Some(task);
        info!("publisher started");
        Ok(())
    }

    /// Drain the inbound queue, end every subscriber stream, close any
    /// attached recorder. Idempotent.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }
        *lock(&self.shared.inbound_tx) = None;
        if let Some(stop) = lock(&self.shared.stop_tx).take() {
            let _ = stop.send(true);
        }
        let task = lock(&self.shared.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let recorder = lock(&self.shared.recorder).take();
        if let Some(mut recorder) = recorder {
            if let Err(e) = recorder.close() {
                warn!("publisher: recorder close failed: {e}");
            }
        }
        info!("publisher stopped");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Non-blocking hand-off into the broadcast task. Drops the frame (and
    /// returns its buffers) when the inbound queue is full; a no-op before
    /// `start` and after `stop`.
    pub fn publish(&self, bundle: FrameBundle) {
        let tx = lock(&self.shared.inbound_tx).clone();
        let Some(tx) = tx else {
            bundle.release();
            return;
        };
        match tx.try_send(bundle) {
            Ok(()) => {}
            Err(TrySendError::Full(bundle)) => {
                Diagnostics::count(&self.shared.diag.stats().frames_dropped_inbound);
                debug!(
                    frame_id = bundle.meta.frame_id,
                    "inbound queue full, dropping frame"
                );
                bundle.release();
            }
            Err(TrySendError::Closed(bundle)) => {
                bundle.release();
            }
        }
    }

    pub async fn subscribe(&self, request: StreamRequest) -> SubscriberHandle {
        let id = self.shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_DEPTH);
        self.shared.subscribers.write().await.insert(
            id,
            SubscriberEntry {
                tx,
                request: request.clone(),
            },
        );
        info!(id, "subscriber added");
        SubscriberHandle { id, request, rx }
    }

    pub async fn unsubscribe(&self, id: u64) {
        if self.shared.subscribers.write().await.remove(&id).is_some() {
            info!(id, "subscriber removed");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.shared.subscribers.read().await.len()
    }

    /// Attach the single recorder hook.
    pub fn attach_recorder(&self, sink: Box<dyn FrameSink>) -> Result<(), PublisherError> {
        let mut guard = lock(&self.shared.recorder);
        if guard.is_some() {
            return Err(PublisherError::RecorderAttached);
        }
        *guard = Some(sink);
        Ok(())
    }

    pub fn attach_background(&self, source: Arc<dyn BackgroundSource>) {
        *lock(&self.shared.background) = Some(source);
    }

    pub fn attach_replay_control(&self, control: Arc<ReplayControl>) {
        *lock(&self.shared.replay_control) = Some(control);
    }

    /// While replay is active, background snapshots are suppressed.
    pub fn set_replay_active(&self, active: bool) {
        self.shared.replay_active.store(active, Ordering::SeqCst);
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = vec![
            Capability::Points,
            Capability::Clusters,
            Capability::Tracks,
            Capability::Debug,
        ];
        if lock(&self.shared.replay_control).is_some() {
            caps.push(Capability::Replay);
        }
        if lock(&self.shared.recorder).is_some() {
            caps.push(Capability::Recording);
        }
        caps
    }

    pub fn overlay_modes(&self) -> Vec<String> {
        lock(&self.shared.overlay_modes).clone()
    }

    pub fn handle_control(&self, request: ControlRequest) -> Result<ControlReply, PublisherError> {
        match request {
            ControlRequest::GetCapabilities => Ok(ControlReply::Capabilities(self.capabilities())),
            ControlRequest::SetOverlayModes(modes) => {
                *lock(&self.shared.overlay_modes) = modes;
                Ok(ControlReply::Ack)
            }
            ControlRequest::Pause => {
                self.replay_control()?.set_paused(true);
                Ok(ControlReply::Ack)
            }
            ControlRequest::Play => {
                self.replay_control()?.set_paused(false);
                Ok(ControlReply::Ack)
            }
            ControlRequest::SeekFrame(index) => {
                self.replay_control()?.seek(SeekTarget::Frame(index));
                Ok(ControlReply::Ack)
            }
            ControlRequest::SeekTimestamp(ts_ns) => {
                self.replay_control()?.seek(SeekTarget::Timestamp(ts_ns));
                Ok(ControlReply::Ack)
            }
            ControlRequest::SetRate(rate) => {
                self.replay_control()?
                    .set_rate(rate)
                    .map_err(|e| PublisherError::InvalidControl(e.to_string()))?;
                Ok(ControlReply::Ack)
            }
        }
    }

    fn replay_control(&self) -> Result<Arc<ReplayControl>, PublisherError> {
        lock(&self.shared.replay_control)
            .clone()
            .ok_or(PublisherError::NotRunning)
    }
}

/// Lock a std mutex, surviving poisoning (a panicked task must not wedge
/// the pipeline).
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Broadcast task ────────────────────────────────────────────────────────────

async fn run_broadcast(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<FrameBundle>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let mut gates: HashMap<u64, SendGate> = HashMap::new();
    loop {
        tokio::select! {
            _ = stop_rx.changed() => {
                // Drain whatever was queued before the stop, then shut down.
                while let Ok(bundle) = rx.try_recv() {
                    handle_inbound(&shared, &mut gates, bundle).await;
                }
                break;
            }
            maybe = rx.recv() => match maybe {
                Some(bundle) => handle_inbound(&shared, &mut gates, bundle).await,
                None => break,
            }
        }
    }
    // Dropping the senders ends every subscriber stream.
    shared.subscribers.write().await.clear();
    debug!("broadcast task exited");
}

async fn handle_inbound(
    shared: &Arc<Shared>,
    gates: &mut HashMap<u64, SendGate>,
    mut bundle: FrameBundle,
) {
    if bundle.frame_type == FrameType::Full {
        bundle.frame_type = FrameType::Foreground;
    }
    let source = lock(&shared.background).clone();
    if let Some(source) = &source {
        bundle.background_seq = source.sequence_number();
    }
    let bundle = Arc::new(bundle);

    // A due background snapshot always goes out ahead of the foreground
    // frame of the same iteration.
    if let Some(background) = background_frame_if_due(shared, source.as_deref(), &bundle) {
        Diagnostics::count(&shared.diag.stats().background_frames);
        dispatch(shared, gates, background, false).await;
    }

    dispatch(shared, gates, bundle, true).await;
    Diagnostics::count(&shared.diag.stats().frames_published);
}

/// Fan one frame out to every eligible subscriber, then optionally hand it
/// to the recorder. Holds its own retain for the duration so a fast
/// subscriber cannot return the buffers mid-iteration.
async fn dispatch(
    shared: &Arc<Shared>,
    gates: &mut HashMap<u64, SendGate>,
    bundle: Arc<FrameBundle>,
    record: bool,
) {
    bundle.retain();

    let snapshot: Vec<(u64, mpsc::Sender<Arc<FrameBundle>>, StreamRequest)> = {
        let subscribers = shared.subscribers.read().await;
        subscribers
            .iter()
            .map(|(id, entry)| (*id, entry.tx.clone(), entry.request.clone()))
            .collect()
    };

    let mut light: Option<Arc<FrameBundle>> = None;
    let mut stale: Vec<u64> = Vec::new();
    for (id, tx, request) in snapshot {
        if bundle.frame_type == FrameType::Background && !request.background {
            continue;
        }
        let gate = gates.entry(id).or_default();
        let full = request.points && !gate.skipping() && bundle.cloud.is_some();
        let payload = if full {
            bundle.retain();
            Arc::clone(&bundle)
        } else {
            light
                .get_or_insert_with(|| Arc::new(bundle.without_cloud()))
                .clone()
        };
        match tx.try_send(payload) {
            Ok(()) => gate.on_success(),
            Err(TrySendError::Full(payload)) => {
                payload.release();
                gate.on_drop();
                Diagnostics::count(&shared.diag.stats().subscriber_drops);
                debug!(
                    subscriber = id,
                    frame_id = bundle.meta.frame_id,
                    skipping = gate.skipping(),
                    "subscriber queue full, frame dropped"
                );
            }
            Err(TrySendError::Closed(payload)) => {
                payload.release();
                stale.push(id);
            }
        }
    }

    if !stale.is_empty() {
        let mut subscribers = shared.subscribers.write().await;
        for id in stale {
            subscribers.remove(&id);
            gates.remove(&id);
            info!(id, "subscriber stream closed, removed");
        }
    }

    if record {
        let mut guard = lock(&shared.recorder);
        if let Some(recorder) = guard.as_mut() {
            if let Err(e) = recorder.record(&bundle) {
                Diagnostics::count(&shared.diag.stats().recorder_errors);
                warn!("recorder error (recording stays attached): {e}");
            }
        }
    }

    bundle.release();
}

fn background_frame_if_due(
    shared: &Arc<Shared>,
    source: Option<&dyn BackgroundSource>,
    foreground: &Arc<FrameBundle>,
) -> Option<Arc<FrameBundle>> {
    let source = source?;
    if shared.replay_active.load(Ordering::SeqCst) {
        return None;
    }
    let mut state = lock(&shared.bg_state);
    let seq = source.sequence_number();
    let changed = state.last_sent_seq.map_or(true, |last| last != seq);
    let overdue = state
        .last_sent_at
        .map_or(true, |at| at.elapsed() >= BACKGROUND_INTERVAL);
    if !(changed || overdue) {
        return None;
    }
    let snapshot = source.snapshot();
    state.last_sent_seq = Some(snapshot.seq);
    state.last_sent_at = Some(Instant::now());
    Some(Arc::new(FrameBundle {
        meta: FrameMeta {
            frame_id: foreground.meta.frame_id,
            timestamp_ns: foreground.meta.timestamp_ns,
            sensor_id: foreground.meta.sensor_id.clone(),
            coordinate_frame: foreground.meta.coordinate_frame.clone(),
        },
        frame_type: FrameType::Background,
        background_seq: snapshot.seq,
        cloud: Some(snapshot.cloud),
        clusters: None,
        tracks: None,
        playback: None,
    }))
}
