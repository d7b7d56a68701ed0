//! # Conversion Statistics Module
//!
//! Aggregatore single-consumer dei risultati: classifica ogni risultato e
//! accumula i totali. I campi derivati vengono calcolati una sola volta da
//! `calculate()`, dopo l'ultimo risultato.
//!
//! ## Classificazione:
//! - errore → failed, attribuito per `ErrorKind` (mai per testo)
//! - già nel formato di destinazione, o nessun path/size → skipped
//! - altrimenti → converted, con byte prima/dopo

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::converter::ConversionResult;
use crate::error::ErrorKind;
use crate::file_manager::FileManager;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FailureAnalysis {
    pub corrupted: usize,
    pub permission: usize,
    pub unsupported: usize,
    pub other: usize,
}

/// Accumulated outcome of a batch run
#[derive(Debug, Default, Clone)]
pub struct ConversionStatistics {
    pub total_files: usize,
    pub converted_files: usize,
    pub skipped_files: usize,
    pub failed_files: usize,
    pub total_size_before: u64,
    pub total_size_after: u64,
    pub total_duration: Duration,
    pub failures: FailureAnalysis,
    /// Converted files per source directory (batch mode only)
    pub directories_processed: BTreeMap<PathBuf, usize>,
    pub batch_mode: bool,
    pub recursive_search: bool,
    pub preserve_structure: bool,
    pub group_by_folder: bool,

    // derived, set by calculate()
    pub average_duration: Duration,
    pub space_saved: i64,
    pub compression_ratio: f64,
}

impl ConversionStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statistics that also track per-directory counts
    pub fn batch(recursive_search: bool, preserve_structure: bool, group_by_folder: bool) -> Self {
        Self {
            batch_mode: true,
            recursive_search,
            preserve_structure,
            group_by_folder,
            ..Self::default()
        }
    }

    pub fn add_result(&mut self, result: &ConversionResult) {
        self.total_files += 1;
        self.total_duration += result.duration;

        if let Some(ref error) = result.error {
            match error.kind() {
                ErrorKind::AlreadyInTargetFormat => self.skipped_files += 1,
                ErrorKind::CorruptedImage => self.fail(|f| f.corrupted += 1),
                ErrorKind::PermissionDenied => self.fail(|f| f.permission += 1),
                ErrorKind::UnsupportedFormat => self.fail(|f| f.unsupported += 1),
                ErrorKind::SourceNotFound | ErrorKind::Fatal | ErrorKind::Other => {
                    self.fail(|f| f.other += 1)
                }
            }
            return;
        }

        if result.original_path.as_os_str().is_empty() && result.new_size == 0 {
            self.skipped_files += 1;
            return;
        }

        self.converted_files += 1;
        self.total_size_before += result.original_size;
        self.total_size_after += result.new_size;

        if self.batch_mode {
            let dir = result
                .original_path
                .parent()
                .unwrap_or(Path::new(""))
                .to_path_buf();
            *self.directories_processed.entry(dir).or_insert(0) += 1;
        }
    }

    fn fail(&mut self, bump: impl FnOnce(&mut FailureAnalysis)) {
        self.failed_files += 1;
        bump(&mut self.failures);
    }

    /// Compute the derived fields. Call once, after the last result.
    pub fn calculate(&mut self) {
        if self.total_files > 0 {
            self.average_duration = self.total_duration / self.total_files as u32;
        }
        if self.total_size_before > 0 {
            self.space_saved = self.total_size_before as i64 - self.total_size_after as i64;
            self.compression_ratio = self.total_size_after as f64 / self.total_size_before as f64;
        }
    }

    /// Converted files per second of wall-clock time.
    pub fn effective_throughput(&self, wall_clock: Duration) -> f64 {
        let secs = wall_clock.as_secs_f64();
        if secs > 0.0 {
            self.converted_files as f64 / secs
        } else {
            0.0
        }
    }

    /// One-line summary for the progress bar
    pub fn format_summary(&self) -> String {
        format!(
            "Processed: {} files | Converted: {} | Skipped: {} | Failed: {}",
            self.total_files, self.converted_files, self.skipped_files, self.failed_files
        )
    }

    /// Emit the final report. Expects `calculate()` to have run.
    pub fn log_report(&self, wall_clock: Duration) {
        info!("=== Conversion Report ===");
        info!("Converted: {}", self.converted_files);
        info!("Skipped: {}", self.skipped_files);
        info!("Failed: {}", self.failed_files);
        info!("Total processed: {}", self.total_files);

        info!("=== Time Analysis ===");
        info!("Total conversion time (sum of all file durations): {:.2?}", self.total_duration);
        info!("Avg. time per file: ~{:.2?} (non-parallel)", self.average_duration);
        info!("Wall-clock time: {:.2?}", wall_clock);
        if self.converted_files > 0 {
            info!(
                "Effective processing speed: {:.1} files/sec",
                self.effective_throughput(wall_clock)
            );
        }

        if self.total_size_before > 0 {
            info!("=== Size Analysis ===");
            info!("Original total size: {}", FileManager::format_size(self.total_size_before));
            info!("New total size: {}", FileManager::format_size(self.total_size_after));
            if self.space_saved > 0 {
                info!(
                    "Space saved: {} ({:.1}% reduction)",
                    FileManager::format_size(self.space_saved as u64),
                    (1.0 - self.compression_ratio) * 100.0
                );
            } else if self.space_saved < 0 {
                info!(
                    "Size increased: {} ({:.1}% increase)",
                    FileManager::format_size(self.space_saved.unsigned_abs()),
                    (self.compression_ratio - 1.0) * 100.0
                );
            }
        }

        if self.batch_mode {
            info!("=== Batch Processing ===");
            info!(
                "Recursive search: {}",
                if self.recursive_search { "Enabled" } else { "Disabled" }
            );
            info!(
                "Directory structure: {}",
                if self.preserve_structure { "Preserved" } else { "Flattened" }
            );
            info!("Directories processed: {}", self.directories_processed.len());
            if self.group_by_folder {
                for (dir, count) in &self.directories_processed {
                    info!("  • {}: {} files", dir.display(), count);
                }
            }
        }

        if self.failed_files > 0 {
            warn!("=== Failure Analysis ===");
            if self.failures.corrupted > 0 {
                warn!("  • Corrupted images: {}", self.failures.corrupted);
            }
            if self.failures.permission > 0 {
                warn!("  • Permission errors: {}", self.failures.permission);
            }
            if self.failures.unsupported > 0 {
                warn!("  • Unsupported formats: {}", self.failures.unsupported);
            }
            if self.failures.other > 0 {
                warn!("  • Other errors: {}", self.failures.other);
            }
        }
    }
}
