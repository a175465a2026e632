//! Background print pipeline and the bounded worker pool that runs it
//!
//! Requests are acknowledged before a worker picks them up. A worker runs
//! capture, encode and dispatch for one job at a time; failures are logged
//! and recorded in the [`JobLog`] and never reach the HTTP caller.

use crate::{
    Capturer, ErrorSeverity, JobLog, JobState, Metrics, PipelineError, PrintCommands, PrintJob,
    PrintSink, RasterEncoder,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

/// Capture, encode and dispatch for single jobs
pub struct Pipeline {
    capturer: Arc<dyn Capturer>,
    sink: Arc<dyn PrintSink>,
    print_width: u32,
    commands: PrintCommands,
    jobs: Arc<JobLog>,
    metrics: Arc<Metrics>,
    active: AtomicUsize,
}

impl Pipeline {
    pub fn new(
        capturer: Arc<dyn Capturer>,
        sink: Arc<dyn PrintSink>,
        print_width: u32,
        commands: PrintCommands,
        jobs: Arc<JobLog>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            capturer,
            sink,
            print_width,
            commands,
            jobs,
            metrics,
            active: AtomicUsize::new(0),
        }
    }

    /// Run one job to completion, recording every transition
    pub async fn run(&self, mut job: PrintJob) -> Result<(), PipelineError> {
        let start = Instant::now();
        let active = self.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.set_active_jobs(active);

        let result = self.execute(&mut job).await;

        let active = self.active.fetch_sub(1, Ordering::Relaxed) - 1;
        self.metrics.set_active_jobs(active);

        match &result {
            Ok(()) => {
                self.jobs.advance(&job.id, JobState::Done);
                self.metrics.record_finished(start.elapsed(), None);
                info!("Job {} printed on {} in {:?}", job.id, job.target.queue_name, start.elapsed());
            }
            Err(err) => {
                self.jobs.fail(&job.id, err.stage(), err);
                self.metrics.record_finished(start.elapsed(), Some(err.stage()));
                log_failure(&job.id, err);
            }
        }

        result
    }

    async fn execute(&self, job: &mut PrintJob) -> Result<(), PipelineError> {
        self.jobs.advance(&job.id, JobState::Capturing);
        let stage = Instant::now();
        let bitmap = self
            .capturer
            .capture(&job.raw_document, self.print_width, &job.artifact_path)
            .await?;
        self.metrics.record_stage("capture", stage.elapsed());
        job.bounding_box = Some(bitmap.bounding_box);
        self.jobs.set_bounding_box(&job.id, bitmap.bounding_box);

        self.jobs.advance(&job.id, JobState::Encoding);
        let stage = Instant::now();
        let encoder = RasterEncoder::new(job.target.driver_type, self.commands.clone());
        let buffer = encoder.encode(&bitmap.image)?;
        self.metrics.record_stage("encode", stage.elapsed());
        self.jobs.set_buffer_len(&job.id, buffer.len());
        debug!("Job {} encoded into {} bytes", job.id, buffer.len());

        self.jobs.advance(&job.id, JobState::Dispatching);
        let stage = Instant::now();
        let buffer = job.device_buffer.insert(buffer);
        self.sink
            .dispatch(buffer, &job.artifact_path, &job.target.queue_name)
            .await?;
        self.metrics.record_stage("dispatch", stage.elapsed());

        Ok(())
    }
}

/// Log a pipeline failure at the level its severity calls for
pub fn log_failure(job_id: &str, err: &PipelineError) {
    match err.severity() {
        ErrorSeverity::High => error!("Job {} failed during {}: {}", job_id, err.stage(), err),
        ErrorSeverity::Medium | ErrorSeverity::Low => {
            warn!("Job {} failed during {}: {}", job_id, err.stage(), err)
        }
    }
}

pub struct PrintWorker {
    id: usize,
    pipeline: Arc<Pipeline>,
    pending: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
    is_running: Arc<AtomicBool>,
    processed_count: Arc<AtomicUsize>,
    error_count: Arc<AtomicUsize>,
}

impl PrintWorker {
    pub fn new(
        id: usize,
        pipeline: Arc<Pipeline>,
        pending: Arc<AtomicUsize>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            pipeline,
            pending,
            metrics,
            is_running: Arc::new(AtomicBool::new(false)),
            processed_count: Arc::new(AtomicUsize::new(0)),
            error_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn run_with_shared_receiver(&self, jobs: Arc<Mutex<mpsc::Receiver<PrintJob>>>) {
        debug!("Starting print worker {}", self.id);
        self.is_running.store(true, Ordering::Relaxed);

        loop {
            let job = {
                let mut receiver = jobs.lock().await;
                receiver.recv().await
            };

            let Some(job) = job else { break };
            let depth = self.pending.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
            self.metrics.set_queue_depth(depth);
            debug!("Worker {} picked up job {}", self.id, job.id);

            match self.pipeline.run(job).await {
                Ok(()) => {
                    self.processed_count.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        self.is_running.store(false, Ordering::Relaxed);
        debug!("Print worker {} stopped", self.id);
    }

    pub fn get_stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id,
            is_running: self.is_running.load(Ordering::Relaxed),
            processed_count: self.processed_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
        }
    }
}

impl Clone for PrintWorker {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            pipeline: self.pipeline.clone(),
            pending: self.pending.clone(),
            metrics: self.metrics.clone(),
            is_running: self.is_running.clone(),
            processed_count: self.processed_count.clone(),
            error_count: self.error_count.clone(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerStats {
    pub id: usize,
    pub is_running: bool,
    pub processed_count: usize,
    pub error_count: usize,
}

/// Fixed set of workers draining a bounded job queue
pub struct WorkerPool {
    workers: Vec<PrintWorker>,
    sender: mpsc::Sender<PrintJob>,
    capacity: usize,
    /// Jobs accepted but not yet picked up by a worker
    pending: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    pub fn new(
        pipeline: Arc<Pipeline>,
        worker_count: usize,
        capacity: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        let shared_receiver = Arc::new(Mutex::new(receiver));
        let pending = Arc::new(AtomicUsize::new(0));

        let workers: Vec<PrintWorker> = (0..worker_count.max(1))
            .map(|i| PrintWorker::new(i, pipeline.clone(), pending.clone(), metrics.clone()))
            .collect();

        for worker in &workers {
            let worker = worker.clone();
            let rx = shared_receiver.clone();
            tokio::spawn(async move {
                worker.run_with_shared_receiver(rx).await;
            });
        }

        info!("Started {} print workers (queue capacity {})", workers.len(), capacity);

        Self {
            workers,
            sender,
            capacity,
            pending,
            metrics,
        }
    }

    /// Queue a job without waiting; a full queue rejects it immediately
    pub fn submit(&self, job: PrintJob) -> Result<(), PipelineError> {
        // counted before the send so a worker never sees the job uncounted
        self.pending.fetch_add(1, Ordering::Relaxed);
        let result = self.sender.try_send(job).map_err(|e| {
            self.pending.fetch_sub(1, Ordering::Relaxed);
            match e {
                TrySendError::Full(_) | TrySendError::Closed(_) => {
                    PipelineError::QueueFull(self.capacity)
                }
            }
        });
        self.metrics.set_queue_depth(self.queue_depth());
        result
    }

    pub fn queue_depth(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get_worker_stats(&self) -> Vec<WorkerStats> {
        self.workers.iter().map(|w| w.get_stats()).collect()
    }

    pub fn total_processed(&self) -> usize {
        self.workers.iter().map(|w| w.get_stats().processed_count).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.workers.iter().map(|w| w.get_stats().error_count).sum()
    }

    pub fn active_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.get_stats().is_running).count()
    }
}
