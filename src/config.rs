//! # Configuration Management Module
//!
//! Questo modulo gestisce tutta la configurazione dell'applicazione.
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri di conversione
//! - Definisce `BatchConfig` per la modalità batch (ricorsione, output, symlink)
//! - Fornisce validazione robusta dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file YAML (o JSON)
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Parametri di configurazione:
//! - `default_format`: Formato di destinazione (default: "png")
//! - `quality`: Qualità encoder (1-100, default: 80)
//! - `workers`: Numero di worker paralleli (default: 4)
//! - `max_dimension`: Lato massimo in pixel, 0 = nessun resize (default: 0)
//! - `log_level`: Livello di logging (default: "info")
//! - `metadata`: Politica metadata `keep` | `strip` | `strip-location` (default: keep)
//! - `auto_backup`: Backup dell'originale in `backup/` (default: false)
//! - `resume_enabled`: Ripresa di sessioni interrotte (default: true)
//! - `rate_limit`: Operazioni al secondo, 0 = illimitato (default: 0)
//! - `cache_enabled`: Persistenza della cache di conversione (default: true)
//! - `batch_processing`: Blocco annidato `BatchConfig`
//!
//! ## Esempio (config.yaml):
//! ```yaml
//! default_format: webp
//! quality: 85
//! workers: 8
//! batch_processing:
//!   recursive_search: true
//!   preserve_structure: true
//!   output_dir: /tmp/converted
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::codec::TargetFormat;

const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Metadata handling when re-encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataPolicy {
    /// Retain embedded metadata
    #[default]
    Keep,
    /// Remove all embedded metadata
    Strip,
    /// Remove location tags only (not yet implemented: behaves like `keep`)
    StripLocation,
}

impl MetadataPolicy {
    /// The policy the codec actually applies.
    pub fn effective(self) -> Self {
        match self {
            Self::StripLocation => Self::Keep,
            other => other,
        }
    }

    pub fn is_implemented(self) -> bool {
        !matches!(self, Self::StripLocation)
    }
}

/// Batch processing options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Descend into sub-directories
    pub recursive_search: bool,
    /// Maximum walk depth (0 = unlimited, 1 = top-level files only)
    pub max_depth: usize,
    /// Mirror the source tree under `output_dir`
    pub preserve_structure: bool,
    /// Separate output directory (None = convert beside the source)
    pub output_dir: Option<PathBuf>,
    /// Add a per-folder breakdown to the final report
    pub group_by_folder: bool,
    /// Do not recreate empty source directories in the output tree
    pub skip_empty_dirs: bool,
    /// Follow symbolic links while walking
    pub follow_symlinks: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            recursive_search: true,
            max_depth: 0,
            preserve_structure: true,
            output_dir: None,
            group_by_folder: false,
            skip_empty_dirs: true,
            follow_symlinks: false,
        }
    }
}

/// Configuration for batch conversion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub default_format: String,
    /// Encoder quality (1-100)
    pub quality: u8,
    /// Number of parallel workers
    pub workers: usize,
    /// Longest side in pixels (0 = no downscale)
    pub max_dimension: u32,
    pub log_level: String,
    pub metadata: MetadataPolicy,
    pub auto_backup: bool,
    pub resume_enabled: bool,
    /// Aggregate operations per second (0 = unlimited)
    pub rate_limit: u32,
    pub cache_enabled: bool,
    pub batch_processing: BatchConfig,
    /// Keep the source file after a successful conversion
    #[serde(skip)]
    pub keep_original: bool,
    /// Dry run - don't write or delete anything
    #[serde(skip)]
    pub dry_run: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_format: "png".to_string(),
            quality: 80,
            workers: 4,
            max_dimension: 0,
            log_level: "info".to_string(),
            metadata: MetadataPolicy::Keep,
            auto_backup: false,
            resume_enabled: true,
            rate_limit: 0,
            cache_enabled: true,
            batch_processing: BatchConfig::default(),
            keep_original: false,
            dry_run: false,
        }
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.quality == 0 || self.quality > 100 {
            return Err(anyhow::anyhow!("Quality must be between 1 and 100"));
        }

        if self.workers == 0 {
            return Err(anyhow::anyhow!("Number of workers must be greater than 0"));
        }

        if TargetFormat::parse(&self.default_format).is_none() {
            return Err(anyhow::anyhow!(
                "Unsupported default format: {}",
                self.default_format
            ));
        }

        if !LOG_LEVELS.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(anyhow::anyhow!("Unknown log level: {}", self.log_level));
        }

        if let Some(ref output_dir) = self.batch_processing.output_dir {
            if output_dir.exists() && !output_dir.is_dir() {
                return Err(anyhow::anyhow!(
                    "Output path is not a directory: {}",
                    output_dir.display()
                ));
            }
        }

        Ok(())
    }

    /// Per-user configuration directory (`~/.batch-convert`)
    pub fn app_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find home directory"))?
            .join(".batch-convert"))
    }

    /// Default configuration file location
    pub fn default_path() -> Result<PathBuf> {
        Ok(Self::app_dir()?.join("config.yaml"))
    }

    /// Load configuration from file
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = if is_json(path) {
            serde_json::from_str(&content)?
        } else {
            serde_yml::from_str(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = if is_json(path) {
            serde_json::to_string_pretty(self)?
        } else {
            serde_yml::to_string(self)?
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, content).await?;
        Ok(())
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.quality = 0;
        assert!(config.validate().is_err());

        config.quality = 80;
        config.workers = 0;
        assert!(config.validate().is_err());

        config.workers = 2;
        config.default_format = "bmp".to_string();
        assert!(config.validate().is_err());

        config.default_format = "jpeg".to_string();
        config.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.default_format, "png");
        assert_eq!(config.quality, 80);
        assert_eq!(config.workers, 4);
        assert_eq!(config.metadata, MetadataPolicy::Keep);
        assert!(config.resume_enabled);
        assert!(!config.dry_run);
        assert!(config.batch_processing.recursive_search);
        assert_eq!(config.batch_processing.max_depth, 0);
    }

    #[test]
    fn test_strip_location_is_a_keep_noop() {
        assert_eq!(MetadataPolicy::StripLocation.effective(), MetadataPolicy::Keep);
        assert_eq!(MetadataPolicy::Strip.effective(), MetadataPolicy::Strip);
        assert!(!MetadataPolicy::StripLocation.is_implemented());
    }

    #[tokio::test]
    async fn test_config_save_load_yaml() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let original_config = Config {
            default_format: "webp".to_string(),
            quality: 85,
            workers: 8,
            max_dimension: 2048,
            metadata: MetadataPolicy::Strip,
            batch_processing: BatchConfig {
                output_dir: Some(temp_dir.path().join("out")),
                preserve_structure: false,
                ..BatchConfig::default()
            },
            ..Config::default()
        };

        original_config.save_to_file(&config_path).await.unwrap();
        let content = std::fs::read_to_string(&config_path).unwrap();
        assert!(content.contains("metadata: strip"));

        let loaded_config = Config::from_file(&config_path).await.unwrap();
        assert_eq!(loaded_config, original_config);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            "quality: 60\nbatch_processing:\n  follow_symlinks: true\n",
        )
        .unwrap();

        let loaded = Config::from_file(&config_path).await.unwrap();
        assert_eq!(loaded.quality, 60);
        assert_eq!(loaded.workers, 4);
        assert!(loaded.batch_processing.follow_symlinks);
        assert!(loaded.batch_processing.recursive_search);
    }

    #[tokio::test]
    async fn test_missing_file_gives_default() {
        let temp_dir = TempDir::new().unwrap();
        let loaded = Config::from_file(&temp_dir.path().join("none.yaml"))
            .await
            .unwrap();
        assert_eq!(loaded, Config::default());
    }
}
