//! # File Management Module
//!
//! Questo modulo gestisce tutte le operazioni sui file e la discovery delle immagini.
//!
//! ## Responsabilità:
//! - Discovery (ricorsiva o meno) dei file immagine in una directory
//! - Limite di profondità configurabile, symlink opzionali con rilevamento cicli
//! - Ordinamento deterministico (lessicografico) necessario per il resume
//! - Scritture atomiche (temp file + rename) per backup e output
//! - Formattazione human-readable delle dimensioni
//!
//! ## Formati in input:
//! PNG, JPG, JPEG, WebP, TIFF, TIF, GIF, BMP
//!
//! ## Cicli di symlink:
//! Quando i symlink vengono seguiti, ogni directory è identificata dal suo
//! path canonico. Una directory già visitata viene saltata senza errore.
//!
//! ## Esempio:
//! ```rust,ignore
//! let manager = FileManager::new(config.batch_processing.clone());
//! let files = manager.collect_files(root, SUPPORTED_INPUT_EXTENSIONS)?;
//! ```

use anyhow::Result;
use std::collections::{BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::BatchConfig;

/// Extensions the codec can decode.
pub const SUPPORTED_INPUT_EXTENSIONS: &[&str] =
    &["png", "jpg", "jpeg", "webp", "tiff", "tif", "gif", "bmp"];

/// Outcome of a directory walk.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectedFiles {
    /// Candidate files, sorted lexicographically
    pub files: Vec<PathBuf>,
    /// Directories below the root that contain no candidate file
    pub empty_dirs: Vec<PathBuf>,
}

/// Walks input trees and performs file operations
pub struct FileManager {
    config: BatchConfig,
}

impl FileManager {
    pub fn new(config: BatchConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Collect candidate files under `root`, ordered by path.
    pub fn collect_files(&self, root: &Path, allowed_extensions: &[&str]) -> Result<Vec<PathBuf>> {
        Ok(self.collect(root, allowed_extensions)?.files)
    }

    /// Walk `root` and return candidate files plus empty directories.
    pub fn collect(&self, root: &Path, allowed_extensions: &[&str]) -> Result<CollectedFiles> {
        if root.is_file() {
            let files = if Self::has_extension(root, allowed_extensions) {
                vec![root.to_path_buf()]
            } else {
                Vec::new()
            };
            return Ok(CollectedFiles {
                files,
                empty_dirs: Vec::new(),
            });
        }

        let mut walker = WalkDir::new(root)
            .follow_links(self.config.follow_symlinks)
            .sort_by_file_name();
        if let Some(depth) = self.effective_max_depth() {
            walker = walker.max_depth(depth);
        }

        let follow_symlinks = self.config.follow_symlinks;
        let mut visited: HashSet<PathBuf> = HashSet::new();
        let mut files = Vec::new();
        let mut dirs = BTreeSet::new();

        let entries = walker.into_iter().filter_entry(|entry| {
            if !follow_symlinks || !entry.file_type().is_dir() {
                return true;
            }
            match entry.path().canonicalize() {
                Ok(canonical) => {
                    if visited.insert(canonical) {
                        true
                    } else {
                        debug!("Skipping already visited directory: {}", entry.path().display());
                        false
                    }
                }
                Err(_) => true,
            }
        });

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.depth() == 0 {
                        return Err(anyhow::anyhow!(
                            "Failed to read input directory {}: {}",
                            root.display(),
                            e
                        ));
                    }
                    if e.loop_ancestor().is_some() {
                        debug!("Skipping symlink cycle: {}", e);
                    } else {
                        warn!("Skipping unreadable entry: {}", e);
                    }
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                if entry.depth() > 0 {
                    dirs.insert(entry.path().to_path_buf());
                }
            } else if entry.file_type().is_file()
                && Self::has_extension(entry.path(), allowed_extensions)
            {
                files.push(entry.path().to_path_buf());
            }
        }

        files.sort();

        let mut non_empty: HashSet<&Path> = HashSet::new();
        for file in &files {
            let mut current = file.parent();
            while let Some(dir) = current {
                if dir == root || !non_empty.insert(dir) {
                    break;
                }
                current = dir.parent();
            }
        }
        let empty_dirs = dirs
            .iter()
            .filter(|dir| !non_empty.contains(dir.as_path()))
            .cloned()
            .collect();

        debug!("Collected {} files under {}", files.len(), root.display());
        Ok(CollectedFiles { files, empty_dirs })
    }

    /// walkdir depth: root children are depth 1
    fn effective_max_depth(&self) -> Option<usize> {
        if !self.config.recursive_search {
            Some(1)
        } else if self.config.max_depth > 0 {
            Some(self.config.max_depth)
        } else {
            None
        }
    }

    /// Case-insensitive extension match
    pub fn has_extension(path: &Path, allowed_extensions: &[&str]) -> bool {
        match Self::extension(path) {
            Some(ext) => allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(&ext)),
            None => false,
        }
    }

    /// Lowercase extension without the dot
    pub fn extension(path: &Path) -> Option<String> {
        path.extension().map(|ext| ext.to_string_lossy().to_lowercase())
    }

    /// Get information about a file (size and modification time)
    pub async fn get_file_info(path: &Path) -> io::Result<(u64, SystemTime)> {
        let metadata = fs::metadata(path).await?;
        Ok((metadata.len(), metadata.modified()?))
    }

    /// Copy `src` to `dst` through a temp file in `dst`'s directory,
    /// synced and closed before the final rename.
    pub fn atomic_copy(src: &Path, dst: &Path) -> io::Result<()> {
        let mut reader = std::fs::File::open(src)?;
        Self::atomic_write_with(dst, |file| io::copy(&mut reader, file).map(|_| ()))
    }

    /// Write `data` to `dst` with the same temp-then-rename pattern.
    pub fn atomic_write(dst: &Path, data: &[u8]) -> io::Result<()> {
        Self::atomic_write_with(dst, |file| io::Write::write_all(file, data))
    }

    fn atomic_write_with<F>(dst: &Path, write: F) -> io::Result<()>
    where
        F: FnOnce(&mut std::fs::File) -> io::Result<()>,
    {
        let dir = match dst.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new().prefix(".tmp_").tempfile_in(dir)?;
        write(tmp.as_file_mut())?;
        tmp.as_file().sync_all()?;
        // into_temp_path closes the handle; the temp file is removed if persist fails
        tmp.into_temp_path().persist(dst).map_err(|e| e.error)?;
        Ok(())
    }

    /// Get human-readable file size
    pub fn format_size(size: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = size as f64;
        let mut unit_index = 0;

        while size >= 1024.0 && unit_index < UNITS.len() - 1 {
            size /= 1024.0;
            unit_index += 1;
        }

        if unit_index == 0 {
            format!("{} {}", size as u64, UNITS[unit_index])
        } else {
            format!("{:.2} {}", size, UNITS[unit_index])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        std::fs::write(root.join("test1.png"), b"fake png").unwrap();
        std::fs::create_dir(root.join("sub")).unwrap();
        std::fs::write(root.join("sub").join("test2.jpg"), b"fake jpg").unwrap();
        std::fs::write(root.join("notes.txt"), b"text").unwrap();
        temp_dir
    }

    #[test]
    fn test_recursive_collect_finds_nested_file() {
        let temp_dir = tree();
        let manager = FileManager::new(BatchConfig {
            recursive_search: true,
            preserve_structure: true,
            ..BatchConfig::default()
        });

        let files = manager
            .collect_files(temp_dir.path(), &["png", "jpg"])
            .unwrap();
        assert_eq!(
            files,
            vec![
                temp_dir.path().join("sub").join("test2.jpg"),
                temp_dir.path().join("test1.png"),
            ]
        );
    }

    #[test]
    fn test_non_recursive_and_depth_limits() {
        let temp_dir = tree();
        std::fs::create_dir_all(temp_dir.path().join("sub/deeper")).unwrap();
        std::fs::write(temp_dir.path().join("sub/deeper/x.PNG"), b"x").unwrap();

        let flat = FileManager::new(BatchConfig {
            recursive_search: false,
            ..BatchConfig::default()
        });
        let files = flat.collect_files(temp_dir.path(), SUPPORTED_INPUT_EXTENSIONS).unwrap();
        assert_eq!(files, vec![temp_dir.path().join("test1.png")]);

        let depth_two = FileManager::new(BatchConfig {
            max_depth: 2,
            ..BatchConfig::default()
        });
        let files = depth_two
            .collect_files(temp_dir.path(), SUPPORTED_INPUT_EXTENSIONS)
            .unwrap();
        assert_eq!(files.len(), 2);

        let unlimited = FileManager::new(BatchConfig::default());
        let files = unlimited
            .collect_files(temp_dir.path(), SUPPORTED_INPUT_EXTENSIONS)
            .unwrap();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn test_collect_is_deterministic_and_reports_empty_dirs() {
        let temp_dir = tree();
        std::fs::create_dir_all(temp_dir.path().join("empty/inner")).unwrap();
        let manager = FileManager::new(BatchConfig::default());

        let first = manager.collect(temp_dir.path(), SUPPORTED_INPUT_EXTENSIONS).unwrap();
        let second = manager.collect(temp_dir.path(), SUPPORTED_INPUT_EXTENSIONS).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.empty_dirs,
            vec![
                temp_dir.path().join("empty"),
                temp_dir.path().join("empty").join("inner"),
            ]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_cycle_is_skipped() {
        let temp_dir = tree();
        std::os::unix::fs::symlink(temp_dir.path(), temp_dir.path().join("sub").join("loop"))
            .unwrap();

        let manager = FileManager::new(BatchConfig {
            follow_symlinks: true,
            ..BatchConfig::default()
        });
        let files = manager
            .collect_files(temp_dir.path(), SUPPORTED_INPUT_EXTENSIONS)
            .unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_single_file_root() {
        let temp_dir = tree();
        let manager = FileManager::new(BatchConfig::default());
        let file = temp_dir.path().join("test1.png");
        assert_eq!(
            manager.collect_files(&file, SUPPORTED_INPUT_EXTENSIONS).unwrap(),
            vec![file]
        );
    }

    #[test]
    fn test_atomic_copy_leaves_no_temp_files() {
        let temp_dir = TempDir::new().unwrap();
        let src = temp_dir.path().join("a.png");
        std::fs::write(&src, b"original bytes").unwrap();
        let backup_dir = temp_dir.path().join("backup");
        std::fs::create_dir(&backup_dir).unwrap();
        let dst = backup_dir.join("a.png.bak");

        FileManager::atomic_copy(&src, &dst).unwrap();

        assert_eq!(std::fs::read(&dst).unwrap(), b"original bytes");
        let names: Vec<_> = std::fs::read_dir(&backup_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn test_format_size() {
        assert_eq!(FileManager::format_size(512), "512 B");
        assert_eq!(FileManager::format_size(2048), "2.00 KB");
        assert_eq!(FileManager::format_size(5 * 1024 * 1024), "5.00 MB");
    }
}
