//! # Session State Module
//!
//! Questo modulo persiste lo stato di una conversione batch per permettere
//! la ripresa di un run interrotto.
//!
//! ## Responsabilità:
//! - Salva lo stato della sessione in modo atomico (temp file + rename)
//! - Carica lo stato di un run precedente, se presente
//! - Verifica che lo stato corrisponda all'invocazione corrente
//! - Cancella lo stato al termine di un run completo
//!
//! ## Strategia di persistence:
//! - Un unico file JSON per utente: `~/.batch-convert/resume.json`
//! - Scritto solo dal driver, mai dai worker
//!
//! ## Esempio state file:
//! ```json
//! {
//!   "session_id": "0b6f4c8e-...",
//!   "input_dir": "/photos",
//!   "target_format": "webp",
//!   "total_files": 1200,
//!   "processed_files": ["/photos/a.png", "/photos/b.png"],
//!   "started_at": 1642680000
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::file_manager::FileManager;

/// Persisted record of an in-progress batch run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionState {
    pub session_id: String,
    pub input_dir: PathBuf,
    pub target_format: String,
    pub total_files: usize,
    #[serde(default)]
    pub processed_files: BTreeSet<PathBuf>,
    #[serde(default)]
    pub started_at: u64,
}

impl ConversionState {
    pub fn new(input_dir: &Path, target_format: &str, total_files: usize) -> Self {
        let started_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        Self {
            session_id: Uuid::new_v4().to_string(),
            input_dir: input_dir.to_path_buf(),
            target_format: target_format.to_lowercase(),
            total_files,
            processed_files: BTreeSet::new(),
            started_at,
        }
    }

    /// A stored session may only be resumed by an identical invocation.
    pub fn matches(&self, input_dir: &Path, target_format: &str, total_files: usize) -> bool {
        self.input_dir == input_dir
            && self.target_format.eq_ignore_ascii_case(target_format)
            && self.total_files == total_files
    }

    pub fn mark_processed(&mut self, path: &Path) {
        self.processed_files.insert(path.to_path_buf());
    }

    pub fn is_processed(&self, path: &Path) -> bool {
        self.processed_files.contains(path)
    }

    pub fn processed_count(&self) -> usize {
        self.processed_files.len()
    }
}

/// Single-writer store for the resume file
pub struct SessionStore {
    state_file_path: PathBuf,
}

impl SessionStore {
    /// Store at an explicit location
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            state_file_path: path.into(),
        }
    }

    /// Store at the per-user location
    pub fn open_default() -> Result<Self> {
        Ok(Self::at(Config::app_dir()?.join("resume.json")))
    }

    pub fn path(&self) -> &Path {
        &self.state_file_path
    }

    /// Save current state atomically
    pub async fn save_state(&self, state: &ConversionState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state)?;
        if let Some(parent) = self.state_file_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let path = self.state_file_path.clone();
        tokio::task::spawn_blocking(move || FileManager::atomic_write(&path, &content))
            .await?
            .with_context(|| format!("failed to write session state {}", self.state_file_path.display()))?;
        debug!(
            "Session {} saved ({} processed)",
            state.session_id,
            state.processed_count()
        );
        Ok(())
    }

    /// Load the stored state; `None` when there is none or it is unreadable.
    pub async fn load_state(&self) -> Result<Option<ConversionState>> {
        if !self.state_file_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.state_file_path).await?;
        match serde_json::from_str(&content) {
            Ok(state) => Ok(Some(state)),
            Err(e) => {
                warn!(
                    "Ignoring corrupt session state {}: {}",
                    self.state_file_path.display(),
                    e
                );
                Ok(None)
            }
        }
    }

    pub async fn clear_state(&self) -> Result<()> {
        match fs::remove_file(&self.state_file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
