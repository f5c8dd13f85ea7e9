//! Background image loading feeding ordered, fixed-size batches.
//!
//! A fixed pool of worker threads claims dataset positions in order, loads and
//! preprocesses each image outside the lock, and parks the result in a bounded
//! reorder buffer. The single consumer ([`Batches`]) takes results strictly in
//! dataset order. At most `queue_capacity` positions are claimed but not yet
//! delivered at any time, so workers block when the consumer falls behind.
//!
//! Shutdown is cooperative: [`ImageProducer::close`] raises the cancel flag,
//! wakes every waiter and waits up to the grace period for workers to exit.
//! A worker that is mid-load finishes that image and delivers it; it never
//! claims another. Workers still loading when the grace period runs out are
//! detached, and the consumer receives a [`LoadFailure`] for each position
//! they hold instead of waiting on them.

use crate::storage::{DatasetEntry, ImageLoader};
use delta_core::{DeltaError, Result};
use ndarray::{Array3, Array4, Axis};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Producer tuning.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Images per batch.
    pub batch_size: usize,
    pub num_workers: usize,
    /// Maximum number of claimed but undelivered images.
    pub queue_capacity: usize,
    /// Rescale before cropping (disable for pre-cropped datasets).
    pub need_rescale: bool,
    /// How long [`ImageProducer::close`] waits for workers.
    pub shutdown_grace: Duration,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            num_workers: 4,
            queue_capacity: 16,
            need_rescale: true,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl ProducerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeltaError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.num_workers == 0 {
            return Err(DeltaError::Configuration(
                "num_workers must be positive".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(DeltaError::Configuration(
                "queue_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Stop signal observed by every worker at each blocking point.
#[derive(Debug, Default)]
struct CancelToken(AtomicBool);

impl CancelToken {
    fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One preprocessed image.
#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub index: usize,
    pub label: usize,
    pub name: String,
    /// `[crop, crop, channels]`
    pub pixels: Array3<f32>,
}

/// An image that could not be produced. Travels in its batch instead of the
/// record so the consumer can report it.
#[derive(Debug)]
pub struct LoadFailure {
    pub index: usize,
    pub name: String,
    pub error: DeltaError,
}

impl LoadFailure {
    fn new(entry: &DatasetEntry, reason: impl Into<String>) -> Self {
        Self {
            index: entry.index,
            name: entry.name.clone(),
            error: DeltaError::ImageLoad {
                path: entry.path.clone(),
                reason: reason.into(),
            },
        }
    }
}

/// Up to `batch_size` consecutive images, in dataset order.
///
/// `indices`, `labels`, `names` and the first axis of `images` are parallel.
/// Images that failed to load are listed in `failures` only.
#[derive(Debug)]
pub struct Batch {
    pub indices: Vec<usize>,
    pub labels: Vec<usize>,
    pub names: Vec<String>,
    /// `[len, crop, crop, channels]`
    pub images: Array4<f32>,
    pub failures: Vec<LoadFailure>,
}

impl Batch {
    fn assemble(records: Vec<ImageRecord>, mut failures: Vec<LoadFailure>) -> Self {
        let shape = records.first().map(|r| r.pixels.dim());
        let (records, mismatched): (Vec<_>, Vec<_>) = records
            .into_iter()
            .partition(|r| Some(r.pixels.dim()) == shape);
        for record in mismatched {
            let (h, w, c) = record.pixels.dim();
            let expected = shape.map(|(h, w, c)| vec![h, w, c]).unwrap_or_default();
            failures.push(LoadFailure {
                index: record.index,
                name: record.name,
                error: DeltaError::ShapeMismatch {
                    expected,
                    got: vec![h, w, c],
                },
            });
        }
        failures.sort_by_key(|f| f.index);

        let (h, w, c) = shape.unwrap_or((0, 0, 0));
        let mut images = Array4::zeros((records.len(), h, w, c));
        for (mut dst, record) in images.axis_iter_mut(Axis(0)).zip(&records) {
            dst.assign(&record.pixels);
        }
        Self {
            indices: records.iter().map(|r| r.index).collect(),
            labels: records.iter().map(|r| r.label).collect(),
            names: records.into_iter().map(|r| r.name).collect(),
            images,
            failures,
        }
    }

    /// Number of successfully loaded images.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Outcome of [`ImageProducer::close`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Workers joined.
    pub joined: usize,
    /// Workers still running after the grace period (detached).
    pub timed_out: usize,
    /// Workers that panicked during the run.
    pub crashed: usize,
    pub grace: Duration,
}

impl ShutdownReport {
    /// The non-fatal error to report when some workers did not stop in time.
    pub fn timeout_error(&self) -> Option<DeltaError> {
        (self.timed_out > 0).then(|| DeltaError::ShutdownTimeout {
            pending: self.timed_out,
            grace_ms: self.grace.as_millis() as u64,
        })
    }
}

type Slot = std::result::Result<ImageRecord, LoadFailure>;

#[derive(Default)]
struct QueueState {
    next_claim: usize,
    next_deliver: usize,
    ready: BTreeMap<usize, Slot>,
    live_workers: usize,
    crashed: usize,
    /// Set by `close` when workers outlive the grace period.
    detached: bool,
}

struct Shared {
    entries: Vec<DatasetEntry>,
    loader: Arc<dyn ImageLoader>,
    capacity: usize,
    cancel: CancelToken,
    state: Mutex<QueueState>,
    /// Workers wait here for capacity.
    not_full: Condvar,
    /// The consumer waits here for the next position.
    not_empty: Condvar,
    /// `close` waits here for `live_workers` to reach zero.
    workers_done: Condvar,
}

/// Marks a worker as finished on every exit path, including panics.
struct WorkerGuard<'a> {
    shared: &'a Shared,
    id: usize,
    claimed: Option<usize>,
}

impl Drop for WorkerGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if let Some(position) = self.claimed.take() {
            // Only reachable by unwinding out of the loader.
            warn!("Loader worker {} panicked while loading position {}", self.id, position);
            state.crashed += 1;
            let entry = &self.shared.entries[position];
            state
                .ready
                .insert(position, Err(LoadFailure::new(entry, "loader worker panicked")));
        }
        state.live_workers -= 1;
        drop(state);
        self.shared.not_empty.notify_all();
        self.shared.workers_done.notify_all();
    }
}

fn worker_loop(shared: &Shared, guard: &mut WorkerGuard<'_>) {
    loop {
        let position = {
            let mut state = shared.state.lock();
            loop {
                if shared.cancel.is_cancelled() || state.next_claim >= shared.entries.len() {
                    return;
                }
                if state.next_claim < state.next_deliver + shared.capacity {
                    break;
                }
                shared.not_full.wait(&mut state);
            }
            state.next_claim += 1;
            state.next_claim - 1
        };
        guard.claimed = Some(position);

        let entry = &shared.entries[position];
        let slot = match shared.loader.load(entry) {
            Ok(pixels) => Ok(ImageRecord {
                index: entry.index,
                label: entry.label,
                name: entry.name.clone(),
                pixels,
            }),
            Err(error) => {
                debug!("Failed to load {}: {}", entry.name, error);
                Err(LoadFailure {
                    index: entry.index,
                    name: entry.name.clone(),
                    error,
                })
            }
        };

        shared.state.lock().ready.insert(position, slot);
        guard.claimed = None;
        shared.not_empty.notify_all();
    }
}

enum Lifecycle {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Closed,
}

/// Bounded, ordered producer of preprocessed image batches.
pub struct ImageProducer {
    config: ProducerConfig,
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

impl ImageProducer {
    pub fn new(
        entries: Vec<DatasetEntry>,
        loader: Arc<dyn ImageLoader>,
        config: ProducerConfig,
    ) -> Result<Self> {
        config.validate()?;
        let shared = Self::fresh_shared(entries, loader, config.queue_capacity);
        Ok(Self {
            config,
            shared,
            lifecycle: Mutex::new(Lifecycle::Idle),
        })
    }

    fn fresh_shared(
        entries: Vec<DatasetEntry>,
        loader: Arc<dyn ImageLoader>,
        capacity: usize,
    ) -> Arc<Shared> {
        Arc::new(Shared {
            entries,
            loader,
            capacity,
            cancel: CancelToken::default(),
            state: Mutex::new(QueueState::default()),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            workers_done: Condvar::new(),
        })
    }

    /// Total number of images to produce.
    pub fn len(&self) -> usize {
        self.shared.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries.is_empty()
    }

    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.config.batch_size)
    }

    /// Launch the worker pool. No-op when already running.
    pub fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running(_) => return Ok(()),
            Lifecycle::Closed => {
                return Err(DeltaError::Configuration(
                    "producer is closed; call startover() to run again".to_string(),
                ))
            }
            Lifecycle::Idle => {}
        }

        let num_workers = self.config.num_workers.min(self.len());
        let mut handles = Vec::with_capacity(num_workers);
        let mut spawn_error = None;
        for id in 0..num_workers {
            self.shared.state.lock().live_workers += 1;
            let shared = Arc::clone(&self.shared);
            let spawned = thread::Builder::new()
                .name(format!("delta-loader-{id}"))
                .spawn(move || {
                    let mut guard = WorkerGuard {
                        shared: &shared,
                        id,
                        claimed: None,
                    };
                    worker_loop(&shared, &mut guard);
                });
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    self.shared.state.lock().live_workers -= 1;
                    spawn_error = Some(e);
                    break;
                }
            }
        }
        debug!(
            "Started {} loader workers for {} images",
            handles.len(),
            self.len()
        );
        *lifecycle = Lifecycle::Running(handles);
        drop(lifecycle);

        match spawn_error {
            Some(e) => {
                self.shared.not_empty.notify_all();
                Err(e.into())
            }
            None => Ok(()),
        }
    }

    /// Ordered batches over the whole dataset, starting the workers if needed.
    ///
    /// Yields `ceil(len / batch_size)` batches unless the producer is closed
    /// first, in which case it ends after the last image that was claimed
    /// before the stop signal.
    pub fn batches(&self) -> Result<Batches<'_>> {
        if matches!(*self.lifecycle.lock(), Lifecycle::Idle) {
            self.start()?;
        }
        Ok(Batches { producer: self })
    }

    /// Stop all workers and wait for them up to the grace period.
    ///
    /// Idempotent: later calls return an empty report. Workers still running
    /// after the grace period are detached and reported in `timed_out`.
    pub fn close(&self) -> ShutdownReport {
        let grace = self.config.shutdown_grace;
        let handles = match std::mem::replace(&mut *self.lifecycle.lock(), Lifecycle::Closed) {
            Lifecycle::Running(handles) => handles,
            Lifecycle::Idle | Lifecycle::Closed => {
                return ShutdownReport {
                    grace,
                    ..ShutdownReport::default()
                }
            }
        };

        let deadline = Instant::now() + grace;
        let mut state = self.shared.state.lock();
        self.shared.cancel.cancel();
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        while state.live_workers > 0 {
            if self
                .shared
                .workers_done
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        let pending = state.live_workers;
        let crashed = state.crashed;
        if pending > 0 {
            state.detached = true;
        }
        drop(state);
        // Release a consumer parked on a position a detached worker holds
        self.shared.not_empty.notify_all();

        let mut joined = 0;
        for handle in handles {
            if pending == 0 || handle.is_finished() {
                let _ = handle.join();
                joined += 1;
            }
        }

        if pending > 0 {
            warn!(
                "{} loader worker(s) still running after {:?}; detaching",
                pending, grace
            );
        }
        debug!("Producer closed: {joined} joined, {pending} detached, {crashed} crashed");
        ShutdownReport {
            joined,
            timed_out: pending,
            crashed,
            grace,
        }
    }

    /// Close and rewind so [`ImageProducer::batches`] runs from the start.
    pub fn startover(&mut self) -> Result<ShutdownReport> {
        let report = self.close();
        let entries = self.shared.entries.clone();
        let loader = Arc::clone(&self.shared.loader);
        // Detached workers keep the old state alive; they never see the new one.
        self.shared = Self::fresh_shared(entries, loader, self.config.queue_capacity);
        *self.lifecycle.get_mut() = Lifecycle::Idle;
        self.start()?;
        Ok(report)
    }
}

impl Drop for ImageProducer {
    fn drop(&mut self) {
        self.close();
    }
}

/// Consumer side of an [`ImageProducer`].
pub struct Batches<'a> {
    producer: &'a ImageProducer,
}

impl Batches<'_> {
    /// Block until the next position is available, or `None` once the
    /// producer has been closed and nothing more was claimed. Positions held
    /// by detached workers come back as failures.
    fn next_slot(&self) -> Option<Slot> {
        let shared = &self.producer.shared;
        let mut state = shared.state.lock();
        let position = state.next_deliver;
        if position >= shared.entries.len() {
            return None;
        }
        let slot = loop {
            if let Some(slot) = state.ready.remove(&position) {
                break slot;
            }
            if shared.cancel.is_cancelled() && position >= state.next_claim {
                return None;
            }
            if state.detached {
                break Err(LoadFailure::new(
                    &shared.entries[position],
                    "loader worker detached at shutdown",
                ));
            }
            if state.live_workers == 0 {
                break Err(LoadFailure::new(
                    &shared.entries[position],
                    "no loader worker left to produce it",
                ));
            }
            shared.not_empty.wait(&mut state);
        };
        state.next_deliver += 1;
        drop(state);
        shared.not_full.notify_all();
        Some(slot)
    }
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let batch_size = self.producer.config.batch_size;
        let mut records = Vec::with_capacity(batch_size);
        let mut failures = Vec::new();
        while records.len() + failures.len() < batch_size {
            match self.next_slot() {
                Some(Ok(record)) => records.push(record),
                Some(Err(failure)) => failures.push(failure),
                None => break,
            }
        }
        if records.is_empty() && failures.is_empty() {
            return None;
        }
        Some(Batch::assemble(records, failures))
    }
}
