//! Fixed-interval polling of every device.
//!
//! Each tick dispatches one cycle per device as its own task and returns
//! immediately, so a slow device never delays the next tick for the others:
//!
//! - A device without `ParallelReadout` whose previous cycle is still running skips
//!   the tick with a warning.
//! - A device with `ParallelReadout` gets a new invocation anyway. It waits for the
//!   device's session at most one device timeout and skips the tick if the session
//!   is still busy by then; otherwise it runs a full cycle of its own. Overlapping
//!   invocations per device are therefore bounded by twice the device timeout.
//!
//! A collector per tick waits for every invocation it dispatched, up to that
//! invocation's bound plus a small grace period. Collected ticks are recorded in the
//! [`ErrorTracker`] in tick order and handed to a single writer task that flushes
//! them through the [`BatchWriter`], one flush (retries included) at a time. While a
//! flush is running at most one tick waits for the writer: when the database is
//! down, a newer tick replaces the waiting one and the older batch is dropped.
//!
//! On shutdown no further ticks start; ticks already dispatched are collected, the
//! in-flight and waiting batches are flushed, then every session is closed.

use crate::error::DeviceError;
use crate::error_tracker::{ErrorTracker, Transition};
use crate::poller::{PollOutcome, Poller, CLOSE_TIMEOUT};
use crate::reading::Reading;
use crate::writer::{BatchWriter, FlushOutcome};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

/// Slack on top of an invocation's bound before its collector stops waiting.
pub const COLLECT_GRACE: Duration = Duration::from_millis(250);

/// Lifecycle of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Waiting for the next tick.
    Idle,
    /// At least one tick is being collected or flushed.
    Polling,
    /// Shut down; no further ticks.
    Stopped,
}

/// Everything that happened in one tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    /// Tick number, starting at 1.
    pub tick: u64,
    /// When the tick was dispatched.
    pub started: DateTime<Utc>,
    /// One outcome per device that ran a cycle.
    pub outcomes: Vec<PollOutcome>,
    /// Devices that sat this tick out because their session was still busy.
    pub skipped: Vec<String>,
    /// Result of writing the tick's readings.
    pub flush: FlushOutcome,
}

impl TickReport {
    /// Outcome of one device in this tick.
    pub fn outcome(&self, device: &str) -> Option<&PollOutcome> {
        self.outcomes.iter().find(|o| o.device == device)
    }

    /// Total readings collected in this tick.
    pub fn reading_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.readings.len()).sum()
    }
}

struct DeviceSlot {
    name: String,
    parallel: bool,
    timeout: Duration,
    poller: Arc<Mutex<Poller>>,
    in_flight: Arc<AtomicUsize>,
}

impl DeviceSlot {
    /// Longest one invocation can take from dispatch to outcome.
    fn bound(&self) -> Duration {
        let wait = if self.parallel {
            self.timeout
        } else {
            Duration::ZERO
        };
        wait + self.timeout + CLOSE_TIMEOUT
    }
}

/// Marks a device invocation as running until dropped, panics included.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Cycle {
    Polled(PollOutcome),
    Busy,
}

/// A tick whose cycles are running.
struct Dispatched {
    tick: u64,
    started: DateTime<Utc>,
    skipped: Vec<String>,
    cycles: oneshot::Receiver<(Vec<PollOutcome>, Vec<String>)>,
}

/// A tick recorded in the tracker, waiting to be flushed.
struct Recorded {
    tick: u64,
    started: DateTime<Utc>,
    outcomes: Vec<PollOutcome>,
    skipped: Vec<String>,
}

impl Recorded {
    fn readings(&self) -> Vec<Reading> {
        self.outcomes
            .iter()
            .flat_map(|o| o.readings.iter().cloned())
            .collect()
    }

    fn point_count(&self) -> usize {
        self.outcomes.iter().map(|o| o.readings.len()).sum()
    }

    fn report(self, flush: FlushOutcome) -> TickReport {
        TickReport {
            tick: self.tick,
            started: self.started,
            outcomes: self.outcomes,
            skipped: self.skipped,
            flush,
        }
    }
}

#[derive(Default)]
struct FlushQueue {
    waiting: VecDeque<Recorded>,
    flushing: bool,
    closed: bool,
}

/// Ticks waiting for the writer. While a flush is running at most one tick waits;
/// a newer tick replaces it.
#[derive(Default)]
struct PendingFlush {
    queue: parking_lot::Mutex<FlushQueue>,
    notify: Notify,
}

impl PendingFlush {
    /// Queue `recorded`, returning the ticks it replaced.
    fn offer(&self, recorded: Recorded) -> Vec<Recorded> {
        let mut displaced = Vec::new();
        {
            let mut queue = self.queue.lock();
            queue.waiting.push_back(recorded);
            if queue.flushing {
                while queue.waiting.len() > 1 {
                    displaced.extend(queue.waiting.pop_front());
                }
            }
        }
        self.notify.notify_one();
        displaced
    }

    fn close(&self) {
        self.queue.lock().closed = true;
        self.notify.notify_one();
    }

    /// Next tick to flush, marking the previous flush as done; `None` once closed
    /// and empty.
    async fn take(&self) -> Option<Recorded> {
        loop {
            {
                let mut queue = self.queue.lock();
                queue.flushing = false;
                if let Some(next) = queue.waiting.pop_front() {
                    queue.flushing = true;
                    return Some(next);
                }
                if queue.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }
}

#[derive(Debug, Default)]
struct Status {
    stopped: AtomicBool,
    pending: AtomicUsize,
    ticks: AtomicU64,
}

/// Where finished ticks go.
#[derive(Clone)]
struct Reporter {
    status: Arc<Status>,
    reports: Option<mpsc::UnboundedSender<TickReport>>,
}

impl Reporter {
    fn finish(&self, report: TickReport) {
        self.status.pending.fetch_sub(1, Ordering::SeqCst);
        if let Some(reports) = &self.reports {
            let _ = reports.send(report);
        }
    }
}

/// Polls all devices on a fixed interval and writes each tick's readings.
pub struct Scheduler {
    slots: Vec<DeviceSlot>,
    interval: Duration,
    collect_window: Duration,
    writer: BatchWriter,
    tracker: Arc<ErrorTracker>,
    status: Arc<Status>,
    reports: Option<mpsc::UnboundedSender<TickReport>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("devices", &self.slots.iter().map(|s| &s.name).collect::<Vec<_>>())
            .field("interval", &self.interval)
            .field("collect_window", &self.collect_window)
            .field("state", &self.state())
            .finish()
    }
}

impl Scheduler {
    /// Scheduler over `pollers`, ticking every `interval`.
    pub fn new(pollers: Vec<Poller>, writer: BatchWriter, interval: Duration) -> Self {
        let slots: Vec<DeviceSlot> = pollers
            .into_iter()
            .map(|poller| DeviceSlot {
                name: poller.name().to_string(),
                parallel: poller.config().parallel_readout,
                timeout: poller.config().timeout,
                poller: Arc::new(Mutex::new(poller)),
                in_flight: Arc::new(AtomicUsize::new(0)),
            })
            .collect();
        let longest = slots
            .iter()
            .map(DeviceSlot::bound)
            .max()
            .unwrap_or(Duration::ZERO);
        Self {
            slots,
            interval,
            collect_window: longest + COLLECT_GRACE,
            writer,
            tracker: Arc::new(ErrorTracker::new()),
            status: Arc::new(Status::default()),
            reports: None,
        }
    }

    /// Also send every [`TickReport`] to `reports`.
    pub fn with_reports(mut self, reports: mpsc::UnboundedSender<TickReport>) -> Self {
        self.reports = Some(reports);
        self
    }

    /// Per-device failure state.
    pub fn tracker(&self) -> Arc<ErrorTracker> {
        Arc::clone(&self.tracker)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SchedulerState {
        if self.status.stopped.load(Ordering::SeqCst) {
            SchedulerState::Stopped
        } else if self.status.pending.load(Ordering::SeqCst) > 0 {
            SchedulerState::Polling
        } else {
            SchedulerState::Idle
        }
    }

    /// Ticks dispatched so far.
    pub fn ticks(&self) -> u64 {
        self.status.ticks.load(Ordering::SeqCst)
    }

    /// Longest a tick waits for its slowest device.
    pub fn collect_window(&self) -> Duration {
        self.collect_window
    }

    /// Run a single tick to completion, then close all sessions.
    pub async fn run_once(&self) -> TickReport {
        let recorded = record_tick(self.dispatch(), &self.tracker).await;
        let report = flush_tick(recorded, &self.writer).await;
        self.reporter().finish(report.clone());
        self.close_sessions().await;
        self.status.stopped.store(true, Ordering::SeqCst);
        report
    }

    /// Tick until `shutdown` turns true (or its sender is dropped), then drain.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let pending = Arc::new(PendingFlush::default());
        let (queue, recorder) = self.spawn_recorder(Arc::clone(&pending));
        let flusher = self.spawn_flusher(pending);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            devices = self.slots.len(),
            interval_ms = self.interval.as_millis() as u64,
            "Polling started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if queue.send(self.dispatch()).await.is_err() {
                        warn!("Tick recorder stopped unexpectedly");
                        break;
                    }
                }
            }
        }

        info!(
            in_flight = self.status.pending.load(Ordering::SeqCst),
            "Shutdown requested, finishing in-flight cycles"
        );
        drop(queue);
        if let Err(e) = recorder.await {
            error!(error = %e, "Tick recorder failed");
        }
        if let Err(e) = flusher.await {
            error!(error = %e, "Tick writer failed");
        }
        self.close_sessions().await;
        self.status.stopped.store(true, Ordering::SeqCst);
        info!(ticks = self.ticks(), "Polling stopped");
    }

    fn reporter(&self) -> Reporter {
        Reporter {
            status: Arc::clone(&self.status),
            reports: self.reports.clone(),
        }
    }

    /// Records dispatched ticks in order and hands them to the writer.
    fn spawn_recorder(
        &self,
        pending: Arc<PendingFlush>,
    ) -> (mpsc::Sender<Dispatched>, JoinHandle<()>) {
        // Every tick is collected within the collect window, so this many covers the
        // ticks that can be outstanding at once.
        let capacity = (self.collect_window.as_millis() / self.interval.as_millis().max(1))
            as usize
            + 2;
        let (tx, mut rx) = mpsc::channel::<Dispatched>(capacity);
        let tracker = Arc::clone(&self.tracker);
        let reporter = self.reporter();
        let handle = tokio::spawn(async move {
            while let Some(dispatched) = rx.recv().await {
                let recorded = record_tick(dispatched, &tracker).await;
                let tick = recorded.tick;
                for stale in pending.offer(recorded) {
                    let points = stale.point_count();
                    error!(
                        tick = stale.tick,
                        points,
                        superseded_by = tick,
                        "Database still busy with an earlier batch, dropping waiting batch"
                    );
                    reporter.finish(stale.report(FlushOutcome::Superseded {
                        points,
                        by_tick: tick,
                    }));
                }
            }
            pending.close();
        });
        (tx, handle)
    }

    /// Flushes recorded ticks one at a time.
    fn spawn_flusher(&self, pending: Arc<PendingFlush>) -> JoinHandle<()> {
        let writer = self.writer.clone();
        let reporter = self.reporter();
        tokio::spawn(async move {
            while let Some(recorded) = pending.take().await {
                reporter.finish(flush_tick(recorded, &writer).await);
            }
        })
    }

    /// Start this tick's cycles and a collector for their outcomes.
    fn dispatch(&self) -> Dispatched {
        let tick = self.status.ticks.fetch_add(1, Ordering::SeqCst) + 1;
        self.status.pending.fetch_add(1, Ordering::SeqCst);
        let started = Utc::now();
        let dispatched_at = Instant::now();

        let mut skipped = Vec::new();
        let mut cycles = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if !slot.parallel && slot.in_flight.load(Ordering::SeqCst) > 0 {
                warn!(device = %slot.name, tick, "Previous cycle still running, skipping tick");
                skipped.push(slot.name.clone());
                continue;
            }
            let running = InFlight::enter(&slot.in_flight);
            let shared = Arc::clone(&slot.poller);
            let name = slot.name.clone();
            let wait_until = dispatched_at + slot.timeout;
            let handle = tokio::spawn(async move {
                let _running = running;
                let mut poller = match timeout_at(wait_until, shared.lock()).await {
                    Ok(poller) => poller,
                    Err(_) => {
                        warn!(
                            device = %name,
                            tick,
                            waited_ms = dispatched_at.elapsed().as_millis() as u64,
                            "Session still busy after a whole timeout, skipping tick"
                        );
                        return Cycle::Busy;
                    }
                };
                let result = AssertUnwindSafe(poller.poll()).catch_unwind().await;
                match result {
                    Ok(outcome) => Cycle::Polled(outcome),
                    Err(panic) => {
                        let error = DeviceError::Aborted(panic_message(panic.as_ref()));
                        error!(device = %name, tick, error = %error, "Device driver panicked");
                        let outcome =
                            PollOutcome::failed(&name, started, dispatched_at.elapsed(), error);
                        poller.record_aborted(&outcome);
                        Cycle::Polled(outcome)
                    }
                }
            });
            cycles.push((
                slot.name.clone(),
                dispatched_at + slot.bound() + COLLECT_GRACE,
                handle,
            ));
        }

        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut outcomes = Vec::with_capacity(cycles.len());
            let mut busy = Vec::new();
            for (name, deadline, handle) in cycles {
                match timeout_at(deadline, handle).await {
                    Ok(Ok(Cycle::Polled(outcome))) => outcomes.push(outcome),
                    Ok(Ok(Cycle::Busy)) => busy.push(name),
                    Ok(Err(e)) => {
                        error!(device = %name, tick, error = %e, "Device cycle task failed");
                        outcomes.push(PollOutcome::failed(
                            &name,
                            started,
                            dispatched_at.elapsed(),
                            DeviceError::Aborted(e.to_string()),
                        ));
                    }
                    Err(_) => {
                        warn!(device = %name, tick, "Device cycle did not report in time");
                        outcomes.push(PollOutcome::missed(
                            &name,
                            started,
                            dispatched_at.elapsed(),
                        ));
                    }
                }
            }
            let _ = tx.send((outcomes, busy));
        });

        trace!(tick, skipped = skipped.len(), "Tick dispatched");
        Dispatched {
            tick,
            started,
            skipped,
            cycles: rx,
        }
    }

    async fn close_sessions(&self) {
        join_all(self.slots.iter().map(|slot| async move {
            match timeout(slot.timeout, slot.poller.lock()).await {
                Ok(mut poller) => poller.shutdown().await,
                Err(_) => warn!(device = %slot.name, "Could not close session, cycle still running"),
            }
        }))
        .await;
    }
}

/// Wait for a tick's outcomes and record them in the tracker.
async fn record_tick(dispatched: Dispatched, tracker: &ErrorTracker) -> Recorded {
    let (outcomes, busy) = dispatched.cycles.await.unwrap_or_default();
    for outcome in &outcomes {
        log_transition(outcome, tracker.record(outcome));
    }
    let mut skipped = dispatched.skipped;
    skipped.extend(busy);
    Recorded {
        tick: dispatched.tick,
        started: dispatched.started,
        outcomes,
        skipped,
    }
}

/// Write a recorded tick's readings.
async fn flush_tick(recorded: Recorded, writer: &BatchWriter) -> TickReport {
    let readings = recorded.readings();
    let flush = writer.flush(&readings).await;
    debug!(
        tick = recorded.tick,
        devices = recorded.outcomes.len(),
        skipped = recorded.skipped.len(),
        readings = readings.len(),
        "Tick complete"
    );
    recorded.report(flush)
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned());
    match message {
        Some(message) => format!("driver panicked: {}", message),
        None => "driver panicked".to_string(),
    }
}

fn log_transition(outcome: &PollOutcome, transition: Transition) {
    let device = outcome.device.as_str();
    match transition {
        Transition::Healthy => {}
        Transition::Recovered { after } => {
            info!(device, failed_cycles = after, "Device recovered");
        }
        Transition::FirstFailure | Transition::Changed if outcome.is_success() => {
            warn!(
                device,
                readings = outcome.readings.len(),
                errors = %outcome.error_summary(),
                "Some channels failed"
            );
        }
        Transition::FirstFailure | Transition::Changed => {
            warn!(device, errors = %outcome.error_summary(), "Device cycle failed");
        }
        Transition::Repeated => {
            debug!(device, errors = %outcome.error_summary(), "Device still failing");
        }
    }
}
