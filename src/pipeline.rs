//! Pipeline orchestrator.
//!
//! One worker thread owns the frame source, motion gate, classifier, and
//! evidence writer, and runs `tick` at most `fps` times a second. Everything
//! other threads may observe (the active flag, the last accepted event, the
//! counters) lives in `PipelineState` and is reached through a
//! `PipelineHandle`.
//!
//! A failed stage ends its tick and is logged with its kind; it never ends the
//! loop. The only way out is `PipelineWorker::stop`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::capacity::CapacityController;
use crate::config::{bytes_to_gb, PipelineConfig, SharedConfig};
use crate::detect::{ClassifierBoundary, Debouncer, MotionGate};
use crate::error::PipelineError;
use crate::evidence::EvidenceWriter;
use crate::ingest::FrameSource;
use crate::storage::{Category, EvidenceEntry, EvidenceListing, EvidenceStore};

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(30);
const START_RETRY_INITIAL: Duration = Duration::from_millis(500);
const START_RETRY_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
pub struct PipelineState {
    active: AtomicBool,
    last_event: Mutex<Option<DateTime<Local>>>,
    ticks: AtomicU64,
    events_written: AtomicU64,
    capture_failures: AtomicU64,
    classification_failures: AtomicU64,
    persistence_failures: AtomicU64,
    eviction_failures: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FailureCounts {
    pub capture: u64,
    pub classification: u64,
    pub persistence: u64,
    pub eviction: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusSnapshot {
    pub active: bool,
    pub last_event: Option<DateTime<Local>>,
    pub ticks: u64,
    pub events_written: u64,
    pub failures: FailureCounts,
}

impl PipelineState {
    pub fn new(active: bool) -> Self {
        Self {
            active: AtomicBool::new(active),
            ..Self::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
    }

    fn toggle(&self) -> bool {
        !self.active.fetch_xor(true, Ordering::SeqCst)
    }

    fn last_event_guard(&self) -> MutexGuard<'_, Option<DateTime<Local>>> {
        self.last_event.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn last_event(&self) -> Option<DateTime<Local>> {
        *self.last_event_guard()
    }

    fn record_event(&self, at: DateTime<Local>) {
        *self.last_event_guard() = Some(at);
    }

    fn record_failure(&self, err: &PipelineError) {
        let counter = match err {
            PipelineError::Capture(_) => &self.capture_failures,
            PipelineError::Classification(_) => &self.classification_failures,
            PipelineError::Persistence(_) => &self.persistence_failures,
            PipelineError::Eviction { .. } => &self.eviction_failures,
            PipelineError::ConfigRejected(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            active: self.is_active(),
            last_event: self.last_event(),
            ticks: self.ticks.load(Ordering::Relaxed),
            events_written: self.events_written.load(Ordering::Relaxed),
            failures: FailureCounts {
                capture: self.capture_failures.load(Ordering::Relaxed),
                classification: self.classification_failures.load(Ordering::Relaxed),
                persistence: self.persistence_failures.load(Ordering::Relaxed),
                eviction: self.eviction_failures.load(Ordering::Relaxed),
            },
        }
    }
}

/// Thread-safe view of a running pipeline for the management interface.
#[derive(Clone, Debug)]
pub struct PipelineHandle {
    state: Arc<PipelineState>,
    store: EvidenceStore,
    config: SharedConfig,
}

impl PipelineHandle {
    pub fn get_state(&self) -> StatusSnapshot {
        self.state.snapshot()
    }

    /// Takes effect at the next tick boundary; an in-flight tick completes.
    pub fn set_active(&self, active: bool) {
        self.state.set_active(active);
        log::info!("monitoring {}", if active { "resumed" } else { "paused" });
    }

    /// Flip the active flag and return the new value.
    pub fn toggle(&self) -> bool {
        let active = self.state.toggle();
        log::info!("monitoring {}", if active { "resumed" } else { "paused" });
        active
    }

    pub fn enumerate_evidence(
        &self,
        category: Option<Category>,
        limit: usize,
    ) -> Result<EvidenceListing> {
        self.store.enumerate(category, limit)
    }

    pub fn delete_evidence(&self, category: Category, id: &str) -> Result<()> {
        self.store.delete(category, id)?;
        log::info!("deleted {}/{}", category, id);
        Ok(())
    }

    pub fn storage_usage_gb(&self) -> Result<f64> {
        Ok(bytes_to_gb(self.store.usage_bytes()?))
    }

    pub fn store(&self) -> &EvidenceStore {
        &self.store
    }

    pub fn config(&self) -> PipelineConfig {
        self.config.snapshot()
    }

    pub fn fps(&self) -> u32 {
        self.config.fps()
    }

    pub fn set_fps(&self, fps: u32) -> Result<(), PipelineError> {
        self.config.set_fps(fps)
    }

    pub fn high_water_mark_gb(&self) -> f64 {
        self.config.high_water_mark_gb()
    }

    pub fn set_high_water_mark_gb(&self, gb: f64) -> Result<(), PipelineError> {
        self.config.set_high_water_mark_gb(gb)
    }

    pub fn detection_confidence(&self) -> f32 {
        self.config.detection_confidence()
    }

    pub fn set_detection_confidence(&self, confidence: f32) -> Result<(), PipelineError> {
        self.config.set_detection_confidence(confidence)
    }
}

/// What one tick did.
#[derive(Debug)]
pub enum TickOutcome {
    Paused,
    CaptureFailed(PipelineError),
    /// No motion against the background model.
    Idle,
    /// Motion inside the cooldown window.
    CooledDown,
    ClassificationFailed(PipelineError),
    /// Motion accepted, nothing classified, and saving such events is off.
    Skipped,
    PersistenceFailed(PipelineError),
    Recorded { entry: EvidenceEntry, evicted: usize },
}

pub struct Pipeline {
    source: Box<dyn FrameSource>,
    motion: MotionGate,
    debouncer: Debouncer,
    classifier: ClassifierBoundary,
    writer: EvidenceWriter,
    capacity: CapacityController,
    config: SharedConfig,
    state: Arc<PipelineState>,
}

impl Pipeline {
    pub fn new(
        source: Box<dyn FrameSource>,
        classifier: ClassifierBoundary,
        store: EvidenceStore,
        config: SharedConfig,
    ) -> Self {
        Self {
            source,
            motion: MotionGate::new(),
            debouncer: Debouncer::new(),
            classifier,
            writer: EvidenceWriter::new(store.clone()),
            capacity: CapacityController::new(store),
            config,
            state: Arc::new(PipelineState::new(true)),
        }
    }

    /// Replace the capacity controller, e.g. one with a custom usage meter.
    pub fn with_capacity(mut self, capacity: CapacityController) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            state: self.state.clone(),
            store: self.writer.store().clone(),
            config: self.config.clone(),
        }
    }

    /// Start the frame source. `spawn` calls this on the worker thread, and
    /// again with backoff until it succeeds.
    ///
    /// The motion background is dropped, so the first frame afterwards only
    /// seeds it.
    pub fn start(&mut self) -> Result<()> {
        self.source.start()?;
        self.motion.reset();
        if let Err(err) = self.classifier.warm_up() {
            log::warn!("classifier {} warm-up failed: {}", self.classifier.backend_name(), err);
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        self.source.stop()
    }

    /// Run one iteration: capture, motion, debounce, classify, persist,
    /// enforce capacity. Stops at the first failing stage.
    pub fn tick(&mut self, now: DateTime<Local>) -> TickOutcome {
        let tick = self.state.ticks.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.state.is_active() {
            return TickOutcome::Paused;
        }
        let config = self.config.snapshot();

        let frame = match self.source.capture_frame() {
            Ok(frame) => frame,
            Err(err) => {
                let err = PipelineError::capture(err);
                self.record_failure(tick, &err);
                return TickOutcome::CaptureFailed(err);
            }
        };

        if !self.motion.evaluate(&frame, config.motion_threshold_percent) {
            return TickOutcome::Idle;
        }
        log::debug!(
            "tick {}: motion {:.1}%",
            tick,
            self.motion.last_ratio() * 100.0
        );

        if !self
            .debouncer
            .should_accept(now, self.state.last_event(), config.cooldown_seconds)
        {
            return TickOutcome::CooledDown;
        }
        self.state.record_event(now);

        let detections = match self.classifier.classify(&frame, config.detection_confidence) {
            Ok(detections) => detections,
            Err(err) => {
                self.record_failure(tick, &err);
                return TickOutcome::ClassificationFailed(err);
            }
        };
        if detections.is_empty() && !config.save_on_motion_without_detection {
            log::debug!("tick {}: motion without a pet, not saved", tick);
            return TickOutcome::Skipped;
        }

        let entry = match self.writer.write(&frame, &detections) {
            Ok(entry) => entry,
            Err(err) => {
                self.record_failure(tick, &err);
                return TickOutcome::PersistenceFailed(err);
            }
        };
        self.state.events_written.fetch_add(1, Ordering::Relaxed);

        let evicted = match self.capacity.enforce_limit(config.high_water_mark_bytes()) {
            Ok(Some(report)) => {
                self.state
                    .eviction_failures
                    .fetch_add(report.failed as u64, Ordering::Relaxed);
                report.evicted
            }
            Ok(None) => 0,
            Err(err) => {
                self.record_failure(tick, &err);
                0
            }
        };

        TickOutcome::Recorded { entry, evicted }
    }

    fn record_failure(&self, tick: u64, err: &PipelineError) {
        self.state.record_failure(err);
        log::warn!("tick {}: {} failure: {}", tick, err.kind(), err);
    }

    fn log_health(&self) {
        let status = self.state.snapshot();
        let source = self.source.stats();
        log::info!(
            "health: active={} ticks={} events={} failures(capture={} classification={} persistence={} eviction={}) source={} healthy={} frames={}",
            status.active,
            status.ticks,
            status.events_written,
            status.failures.capture,
            status.failures.classification,
            status.failures.persistence,
            status.failures.eviction,
            source.url,
            self.source.is_healthy(),
            source.frames_captured
        );
    }

    /// Run the loop on a dedicated thread until `PipelineWorker::stop`.
    ///
    /// Dropping the worker without calling `stop` also ends the loop, but
    /// leaves the thread unjoined.
    pub fn spawn(self) -> Result<PipelineWorker> {
        let handle = self.handle();
        let (shutdown_tx, shutdown_rx) = mpsc::channel();
        let join = std::thread::Builder::new()
            .name("petdoor-pipeline".to_string())
            .spawn(move || self.run(shutdown_rx))?;
        Ok(PipelineWorker {
            handle,
            shutdown: Some(shutdown_tx),
            join: Some(join),
        })
    }

    /// One more start attempt. Returns the backoff state while still failing.
    fn retry_start(&mut self, mut retry: StartRetry, now: Instant) -> Option<StartRetry> {
        match self.start() {
            Ok(()) => {
                log::info!("frame source started after {} attempt(s)", retry.attempts + 1);
                None
            }
            Err(err) => {
                retry.failed(now);
                log::warn!(
                    "frame source start attempt {} failed: {:#}; retrying in {:?}",
                    retry.attempts,
                    err,
                    retry.delay
                );
                Some(retry)
            }
        }
    }

    fn run(mut self, shutdown: Receiver<()>) {
        // Until a start succeeds, ticks still run and count capture failures.
        let mut retry = match self.start() {
            Ok(()) => None,
            Err(err) => {
                log::error!("frame source failed to start: {:#}", err);
                Some(StartRetry::new(Instant::now()))
            }
        };
        log::info!(
            "pipeline running: classifier={} fps={} storage={}",
            self.classifier.backend_name(),
            self.config.fps(),
            self.writer.store().root().display()
        );

        let mut last_health_log = Instant::now();
        loop {
            let started = Instant::now();
            if retry.as_ref().is_some_and(|r| r.due(started)) {
                retry = retry.take().and_then(|r| self.retry_start(r, started));
            }
            let outcome = self.tick(Local::now());
            if let TickOutcome::Recorded { evicted, .. } = &outcome {
                if *evicted > 0 {
                    log::debug!("capacity pass evicted {} pair(s)", evicted);
                }
            }

            if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
                self.log_health();
                last_health_log = Instant::now();
            }

            let period = Duration::from_secs_f64(1.0 / f64::from(self.config.fps().max(1)));
            match shutdown.recv_timeout(period.saturating_sub(started.elapsed())) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        if let Err(err) = self.stop() {
            log::warn!("frame source failed to stop cleanly: {:#}", err);
        }
        log::info!("pipeline stopped");
    }
}

/// Exponential backoff between attempts to start the frame source.
#[derive(Debug)]
struct StartRetry {
    attempts: u32,
    delay: Duration,
    next_at: Instant,
}

impl StartRetry {
    fn new(now: Instant) -> Self {
        Self {
            attempts: 1,
            delay: START_RETRY_INITIAL,
            next_at: now + START_RETRY_INITIAL,
        }
    }

    fn due(&self, now: Instant) -> bool {
        now >= self.next_at
    }

    fn failed(&mut self, now: Instant) {
        self.attempts += 1;
        self.delay = (self.delay * 2).min(START_RETRY_MAX);
        self.next_at = now + self.delay;
    }
}

pub struct PipelineWorker {
    handle: PipelineHandle,
    shutdown: Option<Sender<()>>,
    join: Option<JoinHandle<()>>,
}

impl PipelineWorker {
    pub fn handle(&self) -> PipelineHandle {
        self.handle.clone()
    }

    /// Wake the loop at its sleep, let it release the source, and join it.
    pub fn stop(mut self) -> Result<()> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("pipeline thread panicked"))?;
        }
        Ok(())
    }
}
