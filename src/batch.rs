//! # Batch Converter
//!
//! Orchestratore principale: collega discovery, worker pool, sessione e
//! statistiche.
//!
//! ## Flusso:
//! 1. Validazione pre-flight (input, formato, path di output, spazio disco)
//! 2. Discovery dei file e mirroring delle directory vuote
//! 3. Ripresa della sessione precedente, se corrisponde esattamente
//! 4. Sottomissione dei job con backpressure, consumo concorrente dei risultati
//! 5. Checkpoint periodico della sessione, halt su Ctrl-C o errore fatale
//! 6. Salvataggio cache, pulizia/salvataggio sessione, report finale
//!
//! La sessione viene scritta solo da qui, mai dai worker.

use anyhow::Result;
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, ImageCodec};
use crate::config::Config;
use crate::converter::{
    ConversionCache, ConversionResult, ConvertOptions, ImageConverter, Job, PathResolver,
    RateLimiter, WorkerPool,
};
use crate::error::ConvertError;
use crate::file_manager::{FileManager, SUPPORTED_INPUT_EXTENSIONS};
use crate::progress::ProgressManager;
use crate::state::{ConversionState, SessionStore};
use crate::stats::ConversionStatistics;
use crate::validator;

const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

/// What a run produced.
#[derive(Debug)]
pub struct BatchOutcome {
    pub statistics: ConversionStatistics,
    /// Submission stopped early (Ctrl-C or a fatal error)
    pub halted: bool,
    /// Files a resumed session had already done, deleted originals included
    pub resumed_files: usize,
}

/// Drives one conversion run over a file or directory tree
pub struct BatchConverter {
    config: Config,
    input: PathBuf,
    target_format: String,
    codec: Arc<dyn Codec>,
    session_store: Option<SessionStore>,
    cache_path: Option<PathBuf>,
    halt: Arc<AtomicBool>,
    show_progress: bool,
}

impl BatchConverter {
    /// Converter using the `image` codec and the per-user session and cache files.
    pub fn new(input: &Path, target_format: &str, config: Config) -> Result<Self> {
        config.validate()?;
        let session_store = if config.resume_enabled {
            Some(SessionStore::open_default()?)
        } else {
            None
        };
        let cache_path = if config.cache_enabled {
            Some(Config::app_dir()?.join("cache.json"))
        } else {
            None
        };

        Ok(Self {
            config,
            input: input.to_path_buf(),
            target_format: target_format.trim().to_lowercase(),
            codec: Arc::new(ImageCodec::new()),
            session_store,
            cache_path,
            halt: Arc::new(AtomicBool::new(false)),
            show_progress: true,
        })
    }

    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_session_store(mut self, store: Option<SessionStore>) -> Self {
        self.session_store = store;
        self
    }

    pub fn with_cache_path(mut self, path: Option<PathBuf>) -> Self {
        self.cache_path = path;
        self
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    /// Setting this flag stops job submission.
    pub fn halt_handle(&self) -> Arc<AtomicBool> {
        self.halt.clone()
    }

    pub async fn run(&self) -> Result<BatchOutcome> {
        let start_time = Instant::now();

        validator::validate_inputs(&self.input, &self.target_format)?;
        if let Some(ref output_dir) = self.config.batch_processing.output_dir {
            validator::validate_file_path(output_dir)?;
        }

        let input = self
            .input
            .canonicalize()
            .unwrap_or_else(|_| self.input.clone());
        let batch_mode = input.is_dir();
        let root = if batch_mode {
            input.clone()
        } else {
            input.parent().map(Path::to_path_buf).unwrap_or_default()
        };

        info!("Starting image conversion in: {}", input.display());
        let file_manager = FileManager::new(self.config.batch_processing.clone());
        let collected = file_manager.collect(&input, SUPPORTED_INPUT_EXTENSIONS)?;
        self.log_configuration(collected.files.len());

        self.prepare_output(&root, &collected.empty_dirs).await?;
        self.check_disk_space(&root, &collected.files).await?;

        let (mut state, resumed) = self.open_session(&input, &root, &collected.files).await?;
        // outputs written beside their sources are not inputs of the resumed run
        let produced = self.produced_outputs(&root, &state);
        let pending: Vec<PathBuf> = collected
            .files
            .iter()
            .filter(|f| !state.is_processed(f) && !produced.contains(*f))
            .cloned()
            .collect();
        let resumed_files = if resumed { state.processed_count() } else { 0 };
        if resumed {
            info!(
                "Resuming session {}: {} files already done, {} remaining",
                state.session_id,
                resumed_files,
                pending.len()
            );
        }

        let mut statistics = if batch_mode {
            let batch = &self.config.batch_processing;
            ConversionStatistics::batch(batch.recursive_search, batch.preserve_structure, batch.group_by_folder)
        } else {
            ConversionStatistics::new()
        };

        if collected.files.is_empty() {
            info!("No image files found to convert");
            statistics.calculate();
            statistics.log_report(start_time.elapsed());
            self.finish_session(&state, false).await;
            return Ok(BatchOutcome {
                statistics,
                halted: false,
                resumed_files,
            });
        }

        let cache = Arc::new(match self.cache_path {
            Some(ref path) => ConversionCache::load(path).await,
            None => ConversionCache::new(),
        });
        let converter = Arc::new(ImageConverter::with_cache(
            ConvertOptions::from(&self.config),
            self.codec.clone(),
            cache.clone(),
        ));
        let limiter = Arc::new(RateLimiter::new(self.config.rate_limit));

        let progress = if self.show_progress {
            ProgressManager::new((pending.len() + resumed_files) as u64)
        } else {
            ProgressManager::hidden()
        };
        progress.skip(resumed_files as u64);

        self.checkpoint(&state).await;
        let interrupt = self.watch_interrupt();
        let jobs = pending.iter().map(|file| self.job_for(&root, file));
        let processed = self
            .process(jobs, converter, limiter, &mut state, &mut statistics, &progress)
            .await;
        interrupt.abort();
        if let Err(e) = processed {
            error!("Job submission failed: {}", e);
            self.halt.store(true, Ordering::SeqCst);
        }

        let halted = self.halt.load(Ordering::SeqCst);
        self.finish_session(&state, halted).await;

        if let Some(ref path) = self.cache_path {
            if !self.config.dry_run {
                if let Err(e) = cache.save(path).await {
                    warn!("Failed to save conversion cache: {}", e);
                }
            }
        }

        statistics.calculate();
        progress.finish(&statistics.format_summary());
        if halted {
            warn!("Run halted before all files were submitted; the report is partial");
        }
        statistics.log_report(start_time.elapsed());

        Ok(BatchOutcome {
            statistics,
            halted,
            resumed_files,
        })
    }

    /// Submit jobs and consume results concurrently.
    async fn process(
        &self,
        jobs: impl Iterator<Item = Job>,
        converter: Arc<ImageConverter>,
        limiter: Arc<RateLimiter>,
        state: &mut ConversionState,
        statistics: &mut ConversionStatistics,
        progress: &ProgressManager,
    ) -> Result<()> {
        let mut pool = WorkerPool::new(self.config.workers, converter, limiter);
        let Some(mut results) = pool.take_results() else {
            anyhow::bail!("worker pool result stream unavailable");
        };
        pool.start();

        let halt = &self.halt;
        let producer = async {
            let mut submitted = 0usize;
            let mut outcome = Ok(());
            for job in jobs {
                if halt.load(Ordering::SeqCst) {
                    info!("Halt requested, no further jobs will be submitted");
                    break;
                }
                if let Err(e) = pool.add_job(job).await {
                    outcome = Err(e);
                    break;
                }
                submitted += 1;
            }
            pool.stop().await;
            debug!("Submitted {} jobs", submitted);
            outcome
        };

        let consumer = async {
            let mut last_save = Instant::now();
            while let Some(result) = results.recv().await {
                self.record(&result, state, statistics, progress);
                if last_save.elapsed() >= CHECKPOINT_INTERVAL {
                    self.checkpoint(state).await;
                    last_save = Instant::now();
                }
            }
        };

        let (produced, ()) = tokio::join!(producer, consumer);
        produced
    }

    fn record(
        &self,
        result: &ConversionResult,
        state: &mut ConversionState,
        statistics: &mut ConversionStatistics,
        progress: &ProgressManager,
    ) {
        statistics.add_result(result);

        let name = result
            .original_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        match result.error {
            None => {
                state.mark_processed(&result.original_path);
                progress.update(&name);
            }
            Some(ConvertError::AlreadyInTargetFormat) => {
                debug!("Already in target format: {}", result.original_path.display());
                state.mark_processed(&result.original_path);
                progress.update(&name);
            }
            Some(ref e) => {
                if e.is_fatal() {
                    error!("Fatal error on {}: {}", result.original_path.display(), e);
                    self.halt.store(true, Ordering::SeqCst);
                } else {
                    warn!("Failed to convert {}: {}", result.original_path.display(), e);
                }
                progress.update(&format!("{} failed", name));
            }
        }
    }

    fn job_for(&self, root: &Path, file: &Path) -> Job {
        let job = Job::new(file, self.target_format.clone());
        if self.config.batch_processing.output_dir.is_some() {
            job.with_output_path(self.output_path(root, file))
        } else {
            job
        }
    }

    fn output_path(&self, root: &Path, file: &Path) -> PathBuf {
        if self.config.batch_processing.output_dir.is_some() {
            PathResolver::get_output_path(root, file, &self.target_format, &self.config.batch_processing)
        } else {
            PathResolver::in_place(file, &self.target_format)
        }
    }

    /// Where the session's processed files were written, minus paths that are
    /// processed sources themselves.
    fn produced_outputs(&self, root: &Path, state: &ConversionState) -> HashSet<PathBuf> {
        state
            .processed_files
            .iter()
            .map(|source| self.output_path(root, source))
            .filter(|output| !state.is_processed(output))
            .collect()
    }

    /// Create the output tree and mirror empty source directories.
    async fn prepare_output(&self, root: &Path, empty_dirs: &[PathBuf]) -> Result<()> {
        if self.config.dry_run {
            return Ok(());
        }
        let batch = &self.config.batch_processing;
        let Some(ref output_dir) = batch.output_dir else {
            return Ok(());
        };
        if !output_dir.exists() {
            tokio::fs::create_dir_all(output_dir).await?;
            info!("Created output directory: {}", output_dir.display());
        }
        if batch.skip_empty_dirs {
            return Ok(());
        }
        for dir in empty_dirs {
            if let Some(mirrored) = PathResolver::mirror_directory(root, dir, batch) {
                debug!("Mirroring empty directory {}", mirrored.display());
                tokio::fs::create_dir_all(&mirrored).await?;
            }
        }
        Ok(())
    }

    async fn check_disk_space(&self, root: &Path, files: &[PathBuf]) -> Result<()> {
        if self.config.dry_run || files.is_empty() {
            return Ok(());
        }
        let target = self
            .config
            .batch_processing
            .output_dir
            .as_deref()
            .unwrap_or(root);
        let required = validator::estimate_required_space(files).await;
        if !validator::has_sufficient_space(target, required) {
            return Err(ConvertError::Fatal(format!(
                "insufficient disk space at {}: about {} required",
                target.display(),
                FileManager::format_size(required)
            ))
            .into());
        }
        Ok(())
    }

    /// Resume a matching stored session or start a new one.
    async fn open_session(
        &self,
        input: &Path,
        root: &Path,
        files: &[PathBuf],
    ) -> Result<(ConversionState, bool)> {
        let fresh = ConversionState::new(input, &self.target_format, files.len());
        let Some(ref store) = self.session_store else {
            return Ok((fresh, false));
        };
        let Some(stored) = store.load_state().await? else {
            return Ok((fresh, false));
        };

        // converted originals may have been deleted since the interruption,
        // and in-place outputs now show up in the collected files
        let produced = self.produced_outputs(root, &stored);
        let mut known: BTreeSet<&Path> = files
            .iter()
            .filter(|f| !produced.contains(*f))
            .map(PathBuf::as_path)
            .collect();
        known.extend(stored.processed_files.iter().map(PathBuf::as_path));

        if stored.matches(input, &self.target_format, known.len()) {
            return Ok((stored, true));
        }

        info!(
            "Discarding stale session {} ({} -> {})",
            stored.session_id,
            stored.input_dir.display(),
            stored.target_format
        );
        if !self.config.dry_run {
            store.clear_state().await?;
        }
        Ok((fresh, false))
    }

    async fn checkpoint(&self, state: &ConversionState) {
        if self.config.dry_run {
            return;
        }
        if let Some(ref store) = self.session_store {
            if let Err(e) = store.save_state(state).await {
                warn!("Failed to checkpoint session: {}", e);
            }
        }
    }

    /// Clear the session after a complete run, keep it after a halt.
    async fn finish_session(&self, state: &ConversionState, halted: bool) {
        if self.config.dry_run {
            return;
        }
        let Some(ref store) = self.session_store else {
            return;
        };
        let outcome = if halted {
            info!("Session saved, rerun the same command to resume");
            store.save_state(state).await
        } else {
            store.clear_state().await
        };
        if let Err(e) = outcome {
            warn!("Failed to update session state: {}", e);
        }
    }

    fn watch_interrupt(&self) -> tokio::task::JoinHandle<()> {
        let halt = self.halt.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing dispatched jobs");
                halt.store(true, Ordering::SeqCst);
            }
        })
    }

    fn log_configuration(&self, file_count: usize) {
        let batch = &self.config.batch_processing;
        info!(
            "Target format: {} (quality: {})",
            self.target_format, self.config.quality
        );
        if self.config.max_dimension > 0 {
            info!("Max dimension: {}px", self.config.max_dimension);
        }
        match batch.output_dir {
            Some(ref output_dir) if batch.preserve_structure => {
                info!("Output directory: {} (structure preserved)", output_dir.display())
            }
            Some(ref output_dir) => {
                info!("Output directory: {} (flattened)", output_dir.display())
            }
            None => info!("Mode: Write beside the originals"),
        }
        if self.config.keep_original {
            info!("Originals will be kept");
        }
        if self.config.auto_backup {
            info!("Backups enabled");
        }
        if self.config.dry_run {
            info!("Dry run mode: No files will be modified");
        }
        if self.config.rate_limit > 0 {
            info!("Rate limit: {} files/sec", self.config.rate_limit);
        }
        info!("Workers: {}", self.config.workers);
        info!("Found {} image files to process", file_count);
    }
}
