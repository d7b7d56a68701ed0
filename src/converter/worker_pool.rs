//! # Worker Pool Module
//!
//! N worker concorrenti che consumano una coda di job limitata.
//!
//! ## Contratto:
//! - `add_job` blocca il chiamante quando la coda è piena (backpressure)
//! - ogni job accodato prima di `stop()` produce esattamente un risultato
//! - un panic durante un job diventa un risultato con errore, i worker
//!   fratelli continuano
//! - `stop()` chiude la coda, attende la fine dei job in corso e chiude lo
//!   stream dei risultati
//!
//! Lo stream dei risultati è anch'esso limitato: va consumato mentre i job
//! girano, altrimenti `stop()` resta in attesa.

use anyhow::{bail, Result};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::converter::image_converter::{ConversionResult, ImageConverter, Job};
use crate::converter::panic_message;
use crate::converter::rate_limiter::RateLimiter;
use crate::error::ConvertError;

/// Fixed-size pool of conversion workers.
pub struct WorkerPool {
    workers: usize,
    converter: Arc<ImageConverter>,
    limiter: Arc<RateLimiter>,
    job_tx: Option<mpsc::Sender<Job>>,
    job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    result_tx: Option<mpsc::Sender<ConversionResult>>,
    result_rx: Option<mpsc::Receiver<ConversionResult>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(workers: usize, converter: Arc<ImageConverter>, limiter: Arc<RateLimiter>) -> Self {
        let workers = workers.max(1);
        let capacity = workers * 2;
        let (job_tx, job_rx) = mpsc::channel(capacity);
        let (result_tx, result_rx) = mpsc::channel(capacity);

        Self {
            workers,
            converter,
            limiter,
            job_tx: Some(job_tx),
            job_rx: Arc::new(Mutex::new(job_rx)),
            result_tx: Some(result_tx),
            result_rx: Some(result_rx),
            handles: Vec::with_capacity(workers),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Launch the workers. Calling it twice has no effect.
    pub fn start(&mut self) {
        if !self.handles.is_empty() {
            return;
        }
        let Some(result_tx) = self.result_tx.take() else {
            warn!("Worker pool already stopped, not starting");
            return;
        };

        for id in 0..self.workers {
            let job_rx = self.job_rx.clone();
            let result_tx = result_tx.clone();
            let converter = self.converter.clone();
            let limiter = self.limiter.clone();

            self.handles.push(tokio::spawn(async move {
                Self::worker_loop(id, job_rx, result_tx, converter, limiter).await;
            }));
        }
        debug!("Started {} workers", self.workers);
        // the stream closes once every worker has dropped its sender
    }

    async fn worker_loop(
        id: usize,
        job_rx: Arc<Mutex<mpsc::Receiver<Job>>>,
        result_tx: mpsc::Sender<ConversionResult>,
        converter: Arc<ImageConverter>,
        limiter: Arc<RateLimiter>,
    ) {
        loop {
            let job = job_rx.lock().await.recv().await;
            let Some(job) = job else {
                break;
            };

            limiter.wait().await;
            debug!("Worker {} converting {}", id, job.source_path.display());
            let result = guarded(&job.source_path, converter.convert_job(&job)).await;

            if result_tx.send(result).await.is_err() {
                warn!("Result stream dropped, worker {} exiting", id);
                break;
            }
        }
        debug!("Worker {} finished", id);
    }

    /// Enqueue a job, waiting while the queue is full.
    pub async fn add_job(&self, job: Job) -> Result<()> {
        let Some(tx) = &self.job_tx else {
            bail!("worker pool is stopped");
        };
        if tx.send(job).await.is_err() {
            bail!("worker pool is stopped");
        }
        Ok(())
    }

    /// The result stream; can be taken once.
    pub fn take_results(&mut self) -> Option<mpsc::Receiver<ConversionResult>> {
        self.result_rx.take()
    }

    /// Stop accepting jobs, drain the queue and wait for every worker.
    pub async fn stop(&mut self) {
        self.job_tx.take();
        self.result_tx.take();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        debug!("Worker pool stopped");
    }
}

/// Recovery boundary: a panic inside `job` becomes an error result.
async fn guarded<F>(source: &Path, job: F) -> ConversionResult
where
    F: Future<Output = ConversionResult>,
{
    match AssertUnwindSafe(job).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!("Conversion of {} panicked: {}", source.display(), message);
            ConversionResult::failed(source, ConvertError::Other(format!("worker panicked: {}", message)))
        }
    }
}
